//! Gateway core context
//!
//! One [`GatewayCore`] is constructed at process start and handed by
//! reference to everything that needs batching, caching, or admission
//! control. There are no module-level singletons; lifecycle is explicit:
//! build once, share via `Arc`, call [`GatewayCore::shutdown`] during
//! drain.
//!
//! Loaders are request-scoped: call [`GatewayCore::request_scope`] once per
//! logical operation and fetch loaders from the scope, so memoization and
//! batch windows never leak across requests.

use crate::batch_loader::{BatchFetcher, KeyedBatchLoader, LoaderConfig};
use crate::cache::{CacheConfig, TieredCache};
use crate::complexity::{ComplexityConfig, ComplexityGate, OperationShape};
use crate::fetch::FetchClient;
use crate::metrics::Metrics;
use crate::pipeline::{AdmissionPipeline, AdmissionStage, ComplexityStage, RateLimitStage};
use crate::rate_limiter::{InMemoryRateLimitStore, RateLimitStore, RateLimiter, RateLimiterConfig};
use crate::shared_store::{InMemorySharedStore, SharedStore};
use crate::types::{Rejection, RequestContext};
use crate::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Explicit dependency container for the batching/caching/admission core.
pub struct GatewayCore {
    metrics: Arc<Metrics>,
    cache: Arc<TieredCache>,
    rate_limiter: Arc<RateLimiter>,
    complexity_gate: Arc<ComplexityGate>,
    pipeline: AdmissionPipeline,
    fetch_client: Arc<dyn FetchClient>,
    loader_config: LoaderConfig,
}

impl GatewayCore {
    pub fn builder(fetch_client: Arc<dyn FetchClient>) -> GatewayCoreBuilder {
        GatewayCoreBuilder::new(fetch_client)
    }

    /// Run the admission pipeline for one operation.
    pub async fn admit(
        &self,
        operation: &OperationShape,
        context: &RequestContext,
    ) -> std::result::Result<(), Rejection> {
        self.pipeline.admit(operation, context).await
    }

    /// Open a loader scope for one logical operation.
    pub fn request_scope(&self) -> RequestScope {
        RequestScope {
            loader_config: self.loader_config.clone(),
            metrics: Arc::clone(&self.metrics),
            loaders: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn complexity_gate(&self) -> &Arc<ComplexityGate> {
        &self.complexity_gate
    }

    pub fn fetch_client(&self) -> &Arc<dyn FetchClient> {
        &self.fetch_client
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Render the metrics registry in Prometheus text format.
    pub fn render_metrics(&self) -> String {
        self.metrics.render()
    }

    /// Flush outstanding background work. Call once during process drain.
    pub async fn shutdown(&self) {
        self.cache.flush_pending_writes().await;
        tracing::info!("gateway core drained");
    }
}

impl std::fmt::Debug for GatewayCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayCore")
            .field("pipeline", &self.pipeline)
            .field("loader_config", &self.loader_config)
            .finish()
    }
}

/// Builder for [`GatewayCore`].
///
/// Stores default to in-memory implementations; production embeds swap in
/// shared implementations so every gateway instance agrees on cache
/// invalidation and quota.
pub struct GatewayCoreBuilder {
    fetch_client: Arc<dyn FetchClient>,
    cache_config: CacheConfig,
    complexity_config: ComplexityConfig,
    rate_config: RateLimiterConfig,
    loader_config: LoaderConfig,
    shared_store: Option<Arc<dyn SharedStore>>,
    rate_store: Option<Arc<dyn RateLimitStore>>,
    extra_stages: Vec<Box<dyn AdmissionStage>>,
}

impl GatewayCoreBuilder {
    pub fn new(fetch_client: Arc<dyn FetchClient>) -> Self {
        Self {
            fetch_client,
            cache_config: CacheConfig::default(),
            complexity_config: ComplexityConfig::default(),
            rate_config: RateLimiterConfig::default(),
            loader_config: LoaderConfig::default(),
            shared_store: None,
            rate_store: None,
            extra_stages: Vec::new(),
        }
    }

    pub fn with_cache_config(mut self, config: CacheConfig) -> Self {
        self.cache_config = config;
        self
    }

    pub fn with_complexity_config(mut self, config: ComplexityConfig) -> Self {
        self.complexity_config = config;
        self
    }

    pub fn with_rate_limiter_config(mut self, config: RateLimiterConfig) -> Self {
        self.rate_config = config;
        self
    }

    pub fn with_loader_config(mut self, config: LoaderConfig) -> Self {
        self.loader_config = config;
        self
    }

    pub fn with_shared_store(mut self, store: Arc<dyn SharedStore>) -> Self {
        self.shared_store = Some(store);
        self
    }

    pub fn with_rate_limit_store(mut self, store: Arc<dyn RateLimitStore>) -> Self {
        self.rate_store = Some(store);
        self
    }

    /// Append an admission stage after the built-in rate-limit and
    /// complexity stages.
    pub fn with_stage(mut self, stage: Box<dyn AdmissionStage>) -> Self {
        self.extra_stages.push(stage);
        self
    }

    pub fn build(self) -> Result<GatewayCore> {
        let metrics = Arc::new(Metrics::new()?);
        let ceilings = self.complexity_config.ceilings.clone().validated()?;
        let complexity_config = self.complexity_config.with_ceilings(ceilings);

        let shared_store = self
            .shared_store
            .unwrap_or_else(|| Arc::new(InMemorySharedStore::new()));
        let rate_store = self
            .rate_store
            .unwrap_or_else(|| Arc::new(InMemoryRateLimitStore::new()));

        let cache = Arc::new(TieredCache::new(
            self.cache_config,
            shared_store,
            Arc::clone(&metrics),
        ));
        let rate_limiter = Arc::new(RateLimiter::new(
            self.rate_config,
            rate_store,
            Arc::clone(&metrics),
        ));
        let complexity_gate = Arc::new(ComplexityGate::new(
            complexity_config,
            Arc::clone(&metrics),
        ));

        let mut pipeline = AdmissionPipeline::new()
            .with_stage(Box::new(RateLimitStage::new(Arc::clone(&rate_limiter))))
            .with_stage(Box::new(ComplexityStage::new(Arc::clone(&complexity_gate))));
        for stage in self.extra_stages {
            pipeline.push(stage);
        }

        Ok(GatewayCore {
            metrics,
            cache,
            rate_limiter,
            complexity_gate,
            pipeline,
            fetch_client: self.fetch_client,
            loader_config: self.loader_config,
        })
    }
}

/// Loaders for one logical operation.
///
/// Created from [`GatewayCore::request_scope`] and dropped when the
/// operation finishes, taking loader memoization with it.
pub struct RequestScope {
    loader_config: LoaderConfig,
    metrics: Arc<Metrics>,
    loaders: Mutex<HashMap<String, KeyedBatchLoader>>,
}

impl RequestScope {
    /// Fetch or create the loader registered under `name`. Repeated calls
    /// within one scope return the same loader, so concurrent resolvers
    /// share its batch windows.
    pub fn loader(&self, name: &str, fetcher: Arc<dyn BatchFetcher>) -> KeyedBatchLoader {
        let mut loaders = self.loaders.lock();
        loaders
            .entry(name.to_string())
            .or_insert_with(|| {
                KeyedBatchLoader::new(
                    name,
                    fetcher,
                    self.loader_config.clone(),
                    Arc::clone(&self.metrics),
                )
            })
            .clone()
    }
}

impl std::fmt::Debug for RequestScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.loaders.lock().keys().cloned().collect();
        f.debug_struct("RequestScope").field("loaders", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch_loader::BatchEntry;
    use crate::fetch::{ApiError, FetchRequest};
    use serde_json::json;

    struct NullFetchClient;

    #[async_trait::async_trait]
    impl FetchClient for NullFetchClient {
        async fn fetch(
            &self,
            _request: FetchRequest,
        ) -> std::result::Result<serde_json::Value, ApiError> {
            Err(ApiError::unavailable("not wired in this test"))
        }

        async fn batch_fetch(
            &self,
            requests: Vec<FetchRequest>,
        ) -> Vec<std::result::Result<serde_json::Value, ApiError>> {
            requests
                .into_iter()
                .map(|_| Err(ApiError::unavailable("not wired in this test")))
                .collect()
        }
    }

    struct EchoFetcher;

    #[async_trait::async_trait]
    impl BatchFetcher for EchoFetcher {
        async fn fetch_batch(
            &self,
            keys: &[String],
        ) -> std::result::Result<Vec<BatchEntry>, ApiError> {
            Ok(keys.iter().map(|k| BatchEntry::Found(json!({ "id": k }))).collect())
        }
    }

    fn core() -> GatewayCore {
        GatewayCore::builder(Arc::new(NullFetchClient)).build().unwrap()
    }

    #[tokio::test]
    async fn test_builder_defaults() {
        let core = core();
        core.metrics().record_cache("miss");
        let rendered = core.render_metrics();
        assert!(rendered.contains("gateway_cache_operations_total"));
    }

    #[tokio::test]
    async fn test_request_scope_reuses_loaders_by_name() {
        let core = core();
        let scope = core.request_scope();

        let first = scope.loader("doctors", Arc::new(EchoFetcher));
        let second = scope.loader("doctors", Arc::new(EchoFetcher));
        first.load("D1").await.unwrap();
        // The second handle shares the first loader's memo
        second.load("D1").await.unwrap();
        assert_eq!(first.name(), "doctors");

        let other_scope = core.request_scope();
        let fresh = other_scope.loader("doctors", Arc::new(EchoFetcher));
        assert_eq!(fresh.load("D1").await.unwrap(), Some(json!({"id": "D1"})));
    }

    #[tokio::test]
    async fn test_invalid_ceilings_fail_the_build() {
        let mut config = ComplexityConfig::default();
        config.ceilings.anonymous = config.ceilings.admin + 1;
        let result = GatewayCore::builder(Arc::new(NullFetchClient))
            .with_complexity_config(config)
            .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_flushes_cleanly() {
        let core = core();
        core.shutdown().await;
    }
}
