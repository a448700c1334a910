//! End-to-end admission and resolution flows against an in-memory upstream.

use hms_gateway_core::{
    ApiError, CallerIdentity, FetchClient, FetchRequest, FieldSpec, GatewayCore, OperationShape,
    RateLimiterConfig, RequestContext, RestBatchFetcher, Role, SetOptions, WindowConfig,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Upstream stub serving `/doctors/{id}` from a fixed table.
struct DoctorsService {
    doctors: HashMap<String, Value>,
    fetches: AtomicUsize,
}

impl DoctorsService {
    fn new() -> Arc<Self> {
        let mut doctors = HashMap::new();
        for (id, name, specialty) in [
            ("D1", "Dr. Okafor", "cardiology"),
            ("D2", "Dr. Lindqvist", "neurology"),
            ("D3", "Dr. Moreau", "pediatrics"),
        ] {
            doctors.insert(
                id.to_string(),
                json!({"id": id, "name": name, "specialty": specialty}),
            );
        }
        Arc::new(Self {
            doctors,
            fetches: AtomicUsize::new(0),
        })
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl FetchClient for DoctorsService {
    async fn fetch(&self, request: FetchRequest) -> Result<Value, ApiError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let id = request
            .path
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        self.doctors
            .get(&id)
            .cloned()
            .ok_or_else(|| ApiError::not_found(format!("doctor {id} not found")))
    }

    async fn batch_fetch(&self, requests: Vec<FetchRequest>) -> Vec<Result<Value, ApiError>> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            results.push(self.fetch(request).await);
        }
        results
    }
}

fn trace_init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn doctors_core(upstream: Arc<DoctorsService>) -> GatewayCore {
    trace_init();
    GatewayCore::builder(upstream).build().expect("core builds")
}

/// Resolve one doctor the way a field resolver would: cache first, loader on
/// miss, cache populated with the result.
async fn resolve_doctor(
    core: &GatewayCore,
    scope: &hms_gateway_core::RequestScope,
    id: &str,
) -> Option<Value> {
    if let Some(cached) = core.cache().get("doctors", id, None).await {
        return Some(cached);
    }

    let fetcher = Arc::new(RestBatchFetcher::new(
        Arc::clone(core.fetch_client()),
        |key| FetchRequest::get(format!("/doctors/{key}")),
    ));
    let loader = scope.loader("doctors", fetcher);
    let value = loader.load(id).await.expect("upstream reachable")?;
    core.cache()
        .set("doctors", id, None, value.clone(), SetOptions::new())
        .await;
    Some(value)
}

#[tokio::test]
async fn cold_cache_fetches_upstream_once_and_populates() {
    let upstream = DoctorsService::new();
    let core = doctors_core(upstream.clone());
    let scope = core.request_scope();

    let doctor = resolve_doctor(&core, &scope, "D1").await.expect("D1 exists");
    assert_eq!(doctor["name"], "Dr. Okafor");
    assert_eq!(upstream.fetches(), 1);

    let stats = core.cache().stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 0);
    assert_eq!(stats.sets, 1);
}

#[tokio::test]
async fn warm_cache_serves_without_upstream_fetch() {
    let upstream = DoctorsService::new();
    let core = doctors_core(upstream.clone());

    let scope = core.request_scope();
    resolve_doctor(&core, &scope, "D1").await.expect("D1 exists");
    assert_eq!(upstream.fetches(), 1);

    // A later request hits the cache, not the upstream
    let scope = core.request_scope();
    let doctor = resolve_doctor(&core, &scope, "D1").await.expect("D1 exists");
    assert_eq!(doctor["name"], "Dr. Okafor");
    assert_eq!(upstream.fetches(), 1);
    assert_eq!(core.cache().stats().hits, 1);
}

#[tokio::test]
async fn concurrent_resolution_batches_unique_keys() {
    let upstream = DoctorsService::new();
    let core = doctors_core(upstream.clone());
    let scope = core.request_scope();

    let fetcher = Arc::new(RestBatchFetcher::new(
        Arc::clone(core.fetch_client()),
        |key| FetchRequest::get(format!("/doctors/{key}")),
    ));
    let loader = scope.loader("doctors", fetcher);

    let keys = ["D1", "D2", "D1", "D3", "D2"].map(String::from).to_vec();
    let results = loader.load_many(keys).await;

    assert_eq!(results.len(), 5);
    // 3 unique keys, one upstream request each through the positional batch
    assert_eq!(upstream.fetches(), 3);
    assert_eq!(
        results[0].as_ref().unwrap().as_ref().unwrap()["id"],
        "D1"
    );
    assert_eq!(
        results[4].as_ref().unwrap().as_ref().unwrap()["id"],
        "D2"
    );
}

#[tokio::test]
async fn unknown_doctor_resolves_to_absent_not_error() {
    let upstream = DoctorsService::new();
    let core = doctors_core(upstream);
    let scope = core.request_scope();

    let fetcher = Arc::new(RestBatchFetcher::new(
        Arc::clone(core.fetch_client()),
        |key| FetchRequest::get(format!("/doctors/{key}")),
    ));
    let loader = scope.loader("doctors", fetcher);
    assert_eq!(loader.load("D404").await.unwrap(), None);
}

#[tokio::test]
async fn anonymous_burst_is_cut_off_at_the_quota() {
    trace_init();
    let upstream = DoctorsService::new();
    let core = GatewayCore::builder(upstream)
        .with_rate_limiter_config({
            let mut config = RateLimiterConfig::default();
            config.requests.anonymous = WindowConfig::new(100, Duration::from_secs(60));
            config
        })
        .build()
        .expect("core builds");

    let operation = OperationShape::query(vec![FieldSpec::new("doctors").with_page_size(10)]);
    let context = RequestContext::anonymous(Some("203.0.113.50".to_string()));

    for i in 0..100 {
        assert!(
            core.admit(&operation, &context).await.is_ok(),
            "request {} should be admitted",
            i + 1
        );
    }

    let rejection = core
        .admit(&operation, &context)
        .await
        .expect_err("request 101 exceeds the anonymous quota");
    assert!(rejection.retry_after_seconds.unwrap() > 0);
    assert!(rejection.cost.is_none());
}

#[tokio::test]
async fn expensive_anonymous_query_is_rejected_but_staff_passes() {
    let upstream = DoctorsService::new();
    let core = doctors_core(upstream);

    // doctors(100) -> appointments(100) -> prescriptions(100)
    let operation = OperationShape::query(vec![FieldSpec::new("doctors")
        .with_page_size(100)
        .with_child(
            FieldSpec::new("appointments")
                .with_page_size(100)
                .with_child(FieldSpec::new("prescriptions").with_page_size(100)),
        )]);

    let anonymous = RequestContext::anonymous(Some("203.0.113.9".to_string()));
    let rejection = core
        .admit(&operation, &anonymous)
        .await
        .expect_err("deep fan-out exceeds the anonymous ceiling");
    assert!(rejection.cost.unwrap() > rejection.ceiling.unwrap());

    let staff_shape = OperationShape::query(vec![FieldSpec::new("doctors")
        .with_page_size(20)
        .with_child(FieldSpec::new("appointments").with_page_size(10))]);
    let staff = RequestContext::authenticated(CallerIdentity {
        id: "S9".to_string(),
        role: Role::Staff,
    });
    assert!(core.admit(&staff_shape, &staff).await.is_ok());
}

#[tokio::test]
async fn admitted_request_flows_through_loader_and_cache() {
    let upstream = DoctorsService::new();
    let core = doctors_core(upstream.clone());

    let operation = OperationShape::query(vec![FieldSpec::new("doctors").with_page_size(3)]);
    let context = RequestContext::authenticated(CallerIdentity {
        id: "P12".to_string(),
        role: Role::Patient,
    });

    core.admit(&operation, &context).await.expect("admissible");

    let scope = core.request_scope();
    let (a, b) = tokio::join!(
        resolve_doctor(&core, &scope, "D1"),
        resolve_doctor(&core, &scope, "D2"),
    );
    assert_eq!(a.unwrap()["specialty"], "cardiology");
    assert_eq!(b.unwrap()["specialty"], "neurology");
    assert_eq!(upstream.fetches(), 2);

    core.shutdown().await;
}
