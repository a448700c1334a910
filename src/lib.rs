//! # hms-gateway-core
//!
//! The request-batching, caching, and admission-control core of a hospital
//! management GraphQL gateway that federates REST microservices.
//!
//! ## Features
//!
//! - **Batching**: [`KeyedBatchLoader`] coalesces per-key lookups issued
//!   during one operation into deduplicated upstream batches (N+1 prevention)
//! - **Tiered caching**: [`TieredCache`] layers a bounded in-process tier
//!   over a shared store, with per-namespace TTL/strategy, LZ4 compression,
//!   and tag-based invalidation
//! - **Cost admission**: [`ComplexityGate`] prices operations before they
//!   run and enforces per-role cost ceilings
//! - **Rate limiting**: [`RateLimiter`] tracks fixed-window quotas per
//!   caller over a pluggable counter store
//! - **Pipeline**: admission checks compose as ordered [`AdmissionStage`]s
//!   rather than per-resolver annotations
//!
//! ## Main Components
//!
//! - [`GatewayCore`]: process-wide dependency container and entry point.
//! - [`GatewayCoreBuilder`]: configuration builder for the core.
//! - [`RequestScope`]: per-operation loader registry.
//! - [`FetchClient`]: the opaque boundary to the upstream REST services.
//!
//! ## Example
//!
//! ```rust,no_run
//! use hms_gateway_core::{
//!     FieldSpec, GatewayCore, HttpFetchClient, OperationShape, RequestContext,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let fetch = Arc::new(HttpFetchClient::with_base_url(
//!         "http://hospital-services.internal",
//!     ));
//!     let core = GatewayCore::builder(fetch).build()?;
//!
//!     let operation =
//!         OperationShape::query(vec![FieldSpec::new("doctors").with_page_size(20)]);
//!     let context = RequestContext::anonymous(Some("203.0.113.7".to_string()));
//!     if let Err(rejection) = core.admit(&operation, &context).await {
//!         println!("rejected: {}", rejection.reason);
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod batch_loader;
pub mod cache;
pub mod complexity;
pub mod compression;
pub mod context;
pub mod error;
pub mod fetch;
pub mod metrics;
pub mod pipeline;
pub mod rate_limiter;
pub mod shared_store;
pub mod types;

pub use batch_loader::{
    BatchEntry, BatchFetcher, KeyedBatchLoader, LoaderConfig, RestBatchFetcher,
};
pub use cache::{
    CacheConfig, CacheStats, NamespacePolicy, SetOptions, TieredCache, WriteStrategy,
};
pub use complexity::{
    BudgetCheck, ComplexityConfig, ComplexityGate, FieldSpec, OperationShape, RoleCeilings,
};
pub use context::{GatewayCore, GatewayCoreBuilder, RequestScope};
pub use error::{ClientError, Error, Result};
pub use fetch::{ApiError, FetchClient, FetchConfig, FetchRequest, HttpFetchClient, HttpMethod, RetryConfig};
pub use metrics::Metrics;
pub use pipeline::{
    AdmissionPipeline, AdmissionStage, ComplexityStage, RateLimitStage, RequireRoleStage,
};
pub use rate_limiter::{
    InMemoryRateLimitStore, RateLimitDecision, RateLimitStore, RateLimiter, RateLimiterConfig,
    RoleQuotas, WindowConfig,
};
pub use shared_store::{InMemorySharedStore, SharedEntry, SharedStore};
pub use types::{CallerIdentity, OperationKind, Rejection, RequestContext, Role};
