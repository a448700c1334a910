//! Admission pipeline
//!
//! Cross-cutting admission checks are composed as an ordered chain of
//! stages, each deciding `(operation, context) -> allow | reject`. The
//! default order is rate limit first (cheapest check), then the complexity
//! gate. Any rejection short-circuits the chain and is returned to the
//! caller as a structured [`Rejection`].
//!
//! Stages are uniform and explicit; there is no per-resolver annotation
//! mechanism. Embedders can append their own stages for concerns such as
//! role requirements or maintenance windows.

use crate::complexity::{ComplexityGate, OperationShape};
use crate::rate_limiter::RateLimiter;
use crate::types::{Rejection, RequestContext, Role};
use std::sync::Arc;

/// One admission check.
///
/// Stages must be pure pre-checks over the operation shape and context;
/// they run before any resolution work and must not touch loader or cache
/// state.
#[async_trait::async_trait]
pub trait AdmissionStage: Send + Sync {
    async fn check(
        &self,
        operation: &OperationShape,
        context: &RequestContext,
    ) -> std::result::Result<(), Rejection>;

    /// Stage name for logging
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Ordered chain of admission stages.
#[derive(Default)]
pub struct AdmissionPipeline {
    stages: Vec<Box<dyn AdmissionStage>>,
}

impl AdmissionPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stage(mut self, stage: Box<dyn AdmissionStage>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn push(&mut self, stage: Box<dyn AdmissionStage>) {
        self.stages.push(stage);
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run every stage in order. The first rejection wins.
    pub async fn admit(
        &self,
        operation: &OperationShape,
        context: &RequestContext,
    ) -> std::result::Result<(), Rejection> {
        for stage in &self.stages {
            if let Err(rejection) = stage.check(operation, context).await {
                tracing::debug!(
                    stage = stage.name(),
                    request_id = %context.request_id,
                    reason = %rejection.reason,
                    "operation rejected"
                );
                return Err(rejection);
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for AdmissionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.stages.iter().map(|s| s.name()).collect();
        f.debug_struct("AdmissionPipeline").field("stages", &names).finish()
    }
}

/// Counts the request against the caller's window quota.
pub struct RateLimitStage {
    limiter: Arc<RateLimiter>,
}

impl RateLimitStage {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }
}

#[async_trait::async_trait]
impl AdmissionStage for RateLimitStage {
    async fn check(
        &self,
        operation: &OperationShape,
        context: &RequestContext,
    ) -> std::result::Result<(), Rejection> {
        self.limiter
            .check_and_increment(context, operation.kind)
            .await
            .map(|_| ())
    }

    fn name(&self) -> &'static str {
        "rate_limit"
    }
}

/// Prices the operation and enforces the caller role's cost ceiling.
pub struct ComplexityStage {
    gate: Arc<ComplexityGate>,
}

impl ComplexityStage {
    pub fn new(gate: Arc<ComplexityGate>) -> Self {
        Self { gate }
    }
}

#[async_trait::async_trait]
impl AdmissionStage for ComplexityStage {
    async fn check(
        &self,
        operation: &OperationShape,
        context: &RequestContext,
    ) -> std::result::Result<(), Rejection> {
        self.gate.admit(operation, context.role()).map(|_| ())
    }

    fn name(&self) -> &'static str {
        "complexity"
    }
}

/// Rejects callers below a minimum role. Useful for admin-only mutations
/// where the resolved identity is already available at admission time.
pub struct RequireRoleStage {
    minimum: Role,
}

impl RequireRoleStage {
    pub fn new(minimum: Role) -> Self {
        Self { minimum }
    }
}

#[async_trait::async_trait]
impl AdmissionStage for RequireRoleStage {
    async fn check(
        &self,
        _operation: &OperationShape,
        context: &RequestContext,
    ) -> std::result::Result<(), Rejection> {
        if context.role() >= self.minimum {
            Ok(())
        } else {
            Err(Rejection::forbidden(format!(
                "operation requires at least the {} role",
                self.minimum.as_str()
            )))
        }
    }

    fn name(&self) -> &'static str {
        "require_role"
    }
}
