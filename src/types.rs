//! Caller identity and request-scoped types shared across the core.
//!
//! The authentication subsystem is an external collaborator: by the time a
//! request reaches the admission pipeline its identity is already resolved
//! into a [`CallerIdentity`] (or absent, for anonymous callers). These types
//! only carry what the gate components need: who is calling and with what
//! role.

use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Caller roles, ordered by privilege.
///
/// Quota and budget configuration must preserve the ordering
/// `Admin >= Staff >= Patient >= Anonymous`; the built-in defaults do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Anonymous,
    Patient,
    /// Doctors, nurses, receptionists. Staff have a legitimate need for
    /// wider queries than patients.
    Staff,
    Admin,
}

impl Role {
    /// Stable label used in caller keys and metric labels
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Anonymous => "anonymous",
            Role::Patient => "patient",
            Role::Staff => "staff",
            Role::Admin => "admin",
        }
    }
}

/// Resolved caller identity supplied by the external auth collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerIdentity {
    pub id: String,
    pub role: Role,
}

impl CallerIdentity {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }
}

/// Kind of logical operation, for quota selection.
///
/// Subscriptions hold resources open and get a distinct, tighter rate
/// window than queries and mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Query => "query",
            OperationKind::Mutation => "mutation",
            OperationKind::Subscription => "subscription",
        }
    }
}

/// Per-request context passed through the admission pipeline.
///
/// Constructed by the embedding server for each inbound logical operation;
/// the core never reads transport details beyond what is captured here.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Resolved identity, or `None` for unauthenticated callers
    pub identity: Option<CallerIdentity>,
    /// Network origin, used to key anonymous callers
    pub client_ip: Option<String>,
    /// Unique request identifier for log correlation
    pub request_id: String,
    /// Request start time for timing
    pub started_at: Instant,
}

impl RequestContext {
    pub fn new(identity: Option<CallerIdentity>, client_ip: Option<String>) -> Self {
        Self {
            identity,
            client_ip,
            request_id: uuid::Uuid::new_v4().to_string(),
            started_at: Instant::now(),
        }
    }

    pub fn authenticated(identity: CallerIdentity) -> Self {
        Self::new(Some(identity), None)
    }

    pub fn anonymous(client_ip: Option<String>) -> Self {
        Self::new(None, client_ip)
    }

    /// Effective role: the identity's role, or anonymous
    pub fn role(&self) -> Role {
        self.identity
            .as_ref()
            .map(|i| i.role)
            .unwrap_or(Role::Anonymous)
    }

    /// Stable caller key: authenticated callers by role-scoped user id,
    /// anonymous callers by source address.
    pub fn caller_key(&self) -> String {
        match &self.identity {
            Some(identity) => format!("{}:{}", identity.role.as_str(), identity.id),
            None => format!(
                "ip:{}",
                self.client_ip.as_deref().unwrap_or("unknown")
            ),
        }
    }
}

/// Structured rejection envelope returned when admission fails.
///
/// Transport encoding (HTTP status, GraphQL error extensions) is the
/// embedding server's concern; the core only guarantees the shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rejection {
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ceiling: Option<u64>,
}

impl Rejection {
    pub fn rate_limited(reason: impl Into<String>, retry_after_seconds: u64) -> Self {
        Self {
            reason: reason.into(),
            retry_after_seconds: Some(retry_after_seconds),
            cost: None,
            ceiling: None,
        }
    }

    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retry_after_seconds: None,
            cost: None,
            ceiling: None,
        }
    }

    pub fn over_budget(reason: impl Into<String>, cost: u64, ceiling: u64) -> Self {
        Self {
            reason: reason.into(),
            retry_after_seconds: None,
            cost: Some(cost),
            ceiling: Some(ceiling),
        }
    }

    /// Map into the error taxonomy for callers that propagate `Result`
    pub fn into_error(self) -> crate::Error {
        match (self.cost, self.ceiling, self.retry_after_seconds) {
            (Some(cost), Some(ceiling), _) => crate::Error::BudgetExceeded { cost, ceiling },
            (_, _, Some(retry_after_secs)) => {
                crate::Error::RateLimitExceeded { retry_after_secs }
            }
            _ => crate::Error::Internal(self.reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_ordering() {
        assert!(Role::Admin > Role::Staff);
        assert!(Role::Staff > Role::Patient);
        assert!(Role::Patient > Role::Anonymous);
    }

    #[test]
    fn test_caller_key_authenticated() {
        let ctx = RequestContext::new(
            Some(CallerIdentity::new("u-17", Role::Staff)),
            Some("10.0.0.9".to_string()),
        );
        assert_eq!(ctx.caller_key(), "staff:u-17");
        assert_eq!(ctx.role(), Role::Staff);
    }

    #[test]
    fn test_caller_key_anonymous() {
        let ctx = RequestContext::new(None, Some("203.0.113.7".to_string()));
        assert_eq!(ctx.caller_key(), "ip:203.0.113.7");
        assert_eq!(ctx.role(), Role::Anonymous);

        let ctx = RequestContext::new(None, None);
        assert_eq!(ctx.caller_key(), "ip:unknown");
    }

    #[test]
    fn test_rejection_serialization_skips_absent_fields() {
        let rejection = Rejection::rate_limited("too many requests", 30);
        let json = serde_json::to_string(&rejection).unwrap();
        assert!(json.contains("retry_after_seconds"));
        assert!(!json.contains("ceiling"));

        let rejection = Rejection::over_budget("query too complex", 900, 500);
        let json = serde_json::to_string(&rejection).unwrap();
        assert!(json.contains("\"cost\":900"));
        assert!(json.contains("\"ceiling\":500"));
        assert!(!json.contains("retry_after_seconds"));
    }

    #[test]
    fn test_rejection_into_error() {
        let err = Rejection::over_budget("x", 9, 5).into_error();
        assert!(matches!(
            err,
            crate::Error::BudgetExceeded {
                cost: 9,
                ceiling: 5
            }
        ));

        let err = Rejection::rate_limited("x", 12).into_error();
        assert!(matches!(
            err,
            crate::Error::RateLimitExceeded {
                retry_after_secs: 12
            }
        ));
    }
}
