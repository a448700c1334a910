//! Fixed-window rate limiting per caller
//!
//! Every operation passes this check before the complexity gate. Counters
//! are tracked in fixed windows keyed by caller identity (role-scoped user
//! id for authenticated callers, source address for anonymous ones) and
//! stored behind the [`RateLimitStore`] trait so a shared store can replace
//! the in-memory default when several gateway instances must agree on quota.
//!
//! Subscriptions hold resources open far longer than queries, so they are
//! counted in their own tighter windows, separate from query/mutation
//! traffic.

use crate::metrics::Metrics;
use crate::types::{OperationKind, Rejection, RequestContext, Role};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One quota: at most `max_requests` per `window`.
#[derive(Clone, Copy, Debug)]
pub struct WindowConfig {
    pub max_requests: u32,
    pub window: Duration,
}

impl WindowConfig {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }
}

/// Per-role quotas. The ordering `admin >= staff >= patient >= anonymous`
/// is an invariant of the gateway.
#[derive(Clone, Debug)]
pub struct RoleQuotas {
    pub admin: WindowConfig,
    pub staff: WindowConfig,
    pub patient: WindowConfig,
    pub anonymous: WindowConfig,
}

impl RoleQuotas {
    pub fn quota(&self, role: Role) -> WindowConfig {
        match role {
            Role::Admin => self.admin,
            Role::Staff => self.staff,
            Role::Patient => self.patient,
            Role::Anonymous => self.anonymous,
        }
    }
}

/// Configuration for the rate limiter
#[derive(Clone, Debug)]
pub struct RateLimiterConfig {
    /// Quotas for queries and mutations
    pub requests: RoleQuotas,
    /// Tighter quotas for subscription operations
    pub subscriptions: RoleQuotas,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        let minute = Duration::from_secs(60);
        Self {
            requests: RoleQuotas {
                admin: WindowConfig::new(1_000, minute),
                staff: WindowConfig::new(500, minute),
                patient: WindowConfig::new(200, minute),
                anonymous: WindowConfig::new(100, minute),
            },
            subscriptions: RoleQuotas {
                admin: WindowConfig::new(100, minute),
                staff: WindowConfig::new(50, minute),
                patient: WindowConfig::new(20, minute),
                anonymous: WindowConfig::new(10, minute),
            },
        }
    }
}

/// Counter state for one caller key after an increment.
#[derive(Clone, Copy, Debug)]
pub struct WindowCount {
    pub count: u32,
    pub reset_at: Instant,
}

/// Storage for window counters.
///
/// `increment` must atomically reset an expired window and count the
/// current request in the fresh one.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn increment(&self, key: &str, window: Duration) -> anyhow::Result<WindowCount>;
}

/// Default single-instance store.
#[derive(Debug, Default)]
pub struct InMemoryRateLimitStore {
    windows: Mutex<HashMap<String, WindowCount>>,
}

impl InMemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimitStore for InMemoryRateLimitStore {
    async fn increment(&self, key: &str, window: Duration) -> anyhow::Result<WindowCount> {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let entry = windows.entry(key.to_string()).or_insert(WindowCount {
            count: 0,
            reset_at: now + window,
        });
        if entry.reset_at <= now {
            entry.count = 0;
            entry.reset_at = now + window;
        }
        entry.count += 1;
        Ok(*entry)
    }
}

/// Outcome of an admitted rate-limit check.
#[derive(Clone, Copy, Debug)]
pub struct RateLimitDecision {
    pub remaining: u32,
    pub reset_at: Instant,
}

/// Fixed-window limiter over a pluggable counter store.
pub struct RateLimiter {
    config: RateLimiterConfig,
    store: Arc<dyn RateLimitStore>,
    metrics: Arc<Metrics>,
}

impl RateLimiter {
    pub fn new(
        config: RateLimiterConfig,
        store: Arc<dyn RateLimitStore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            store,
            metrics,
        }
    }

    /// Count this request against the caller's window and decide admission.
    ///
    /// Rejections carry the retry-after duration derived from the window's
    /// reset time. A store failure is logged and the request is admitted:
    /// quota accounting must never take the gateway down with it.
    pub async fn check_and_increment(
        &self,
        context: &RequestContext,
        kind: OperationKind,
    ) -> std::result::Result<RateLimitDecision, Rejection> {
        let role = context.role();
        let quota = match kind {
            OperationKind::Subscription => self.config.subscriptions.quota(role),
            _ => self.config.requests.quota(role),
        };

        // Subscriptions consume their own counters
        let caller_key = context.caller_key();
        let counter_key = match kind {
            OperationKind::Subscription => format!("sub:{caller_key}"),
            _ => format!("req:{caller_key}"),
        };

        let counted = match self.store.increment(&counter_key, quota.window).await {
            Ok(counted) => counted,
            Err(error) => {
                tracing::warn!(%error, caller = %caller_key, "rate-limit store unavailable, admitting");
                return Ok(RateLimitDecision {
                    remaining: quota.max_requests,
                    reset_at: Instant::now() + quota.window,
                });
            }
        };

        if counted.count > quota.max_requests {
            let retry_after = counted
                .reset_at
                .saturating_duration_since(Instant::now())
                .as_secs()
                .max(1);
            tracing::info!(
                caller = %caller_key,
                count = counted.count,
                max = quota.max_requests,
                retry_after,
                "rate limit exceeded"
            );
            self.metrics.record_rate_limit_rejection(role.as_str());
            self.metrics.record_admission("rate_limit", "rejected");
            return Err(Rejection::rate_limited(
                format!(
                    "request quota of {} per {}s exhausted",
                    quota.max_requests,
                    quota.window.as_secs()
                ),
                retry_after,
            ));
        }

        self.metrics.record_admission("rate_limit", "allowed");
        Ok(RateLimitDecision {
            remaining: quota.max_requests - counted.count,
            reset_at: counted.reset_at,
        })
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .finish()
    }
}
