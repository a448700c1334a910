//! Error types for the gateway core

use crate::fetch::ApiError;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the gateway core
///
/// Covers the admission, batching and caching layers. Upstream business
/// errors pass through as [`Error::Upstream`]; cache problems never surface
/// here (they degrade to misses) except as [`Error::CacheDegraded`] in logs
/// and internal plumbing.
#[derive(Error, Debug)]
pub enum Error {
    /// Upstream REST service unreachable or returned an invalid response
    #[error("upstream error: {0}")]
    Upstream(#[from] ApiError),

    /// Key explicitly marked absent by the upstream batch function.
    /// Callers normally see `Ok(None)` instead; this variant exists for
    /// paths that require a present value.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// Operation cost exceeded the caller's ceiling
    #[error("operation cost {cost} exceeds ceiling {ceiling}")]
    BudgetExceeded { cost: u64, ceiling: u64 },

    /// Caller exceeded its request quota for the current window
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimitExceeded { retry_after_secs: u64 },

    /// Shared cache tier unreachable. Never surfaced to callers; reads
    /// degrade to misses and writes become best-effort.
    #[error("cache degraded: {0}")]
    CacheDegraded(String),

    /// Serialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal errors
    #[error("internal error: {0}")]
    Internal(String),

    /// Any other error
    #[error("error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Convert to the client-facing error shape.
    ///
    /// # Security
    ///
    /// In production (ENV=production), internal diagnostic detail is
    /// sanitized. Admission rejections keep their full message since they
    /// carry the detail a well-behaved client needs to adapt.
    pub fn to_client_error(&self) -> ClientError {
        let is_production = std::env::var("ENV")
            .map(|e| e == "production" || e == "prod")
            .unwrap_or(false);

        let message = if is_production {
            match self {
                Error::Upstream(_) => "service unavailable for this field".to_string(),
                Error::CacheDegraded(_) => "service temporarily degraded".to_string(),
                Error::Internal(_) | Error::Io(_) | Error::Other(_) => {
                    "internal server error".to_string()
                }
                Error::Serialization(_) => "data processing error".to_string(),
                // Safe to expose: structured admission detail and absent keys
                Error::KeyNotFound(_)
                | Error::BudgetExceeded { .. }
                | Error::RateLimitExceeded { .. } => self.to_string(),
            }
        } else {
            self.to_string()
        };

        ClientError {
            message,
            code: self.code().to_string(),
        }
    }

    /// Stable machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            Error::Upstream(_) => "UPSTREAM_UNAVAILABLE",
            Error::KeyNotFound(_) => "KEY_NOT_FOUND",
            Error::BudgetExceeded { .. } => "BUDGET_EXCEEDED",
            Error::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            Error::CacheDegraded(_) => "CACHE_DEGRADED",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Other(_) => "UNKNOWN_ERROR",
        }
    }
}

/// Client-facing error shape
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ClientError {
    pub message: String,
    pub code: String,
}

impl From<Error> for ClientError {
    fn from(err: Error) -> Self {
        err.to_client_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_error_display() {
        let err = Error::BudgetExceeded {
            cost: 1200,
            ceiling: 1000,
        };
        assert_eq!(err.to_string(), "operation cost 1200 exceeds ceiling 1000");

        let err = Error::RateLimitExceeded {
            retry_after_secs: 42,
        };
        assert_eq!(err.to_string(), "rate limit exceeded, retry after 42s");

        let err = Error::KeyNotFound("doctor:D9".to_string());
        assert_eq!(err.to_string(), "key not found: doctor:D9");
    }

    #[test]
    fn test_error_codes() {
        let cases: Vec<(Error, &str)> = vec![
            (
                Error::Upstream(ApiError::unavailable("down")),
                "UPSTREAM_UNAVAILABLE",
            ),
            (Error::KeyNotFound("k".into()), "KEY_NOT_FOUND"),
            (
                Error::BudgetExceeded {
                    cost: 2,
                    ceiling: 1,
                },
                "BUDGET_EXCEEDED",
            ),
            (
                Error::RateLimitExceeded {
                    retry_after_secs: 1,
                },
                "RATE_LIMIT_EXCEEDED",
            ),
            (Error::CacheDegraded("redis".into()), "CACHE_DEGRADED"),
            (Error::Internal("x".into()), "INTERNAL_ERROR"),
        ];
        for (err, code) in cases {
            assert_eq!(err.code(), code);
        }
    }

    #[test]
    fn test_client_error_sanitized_in_production() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("ENV", "production");

        let err = Error::Internal("connection string leaked".to_string());
        let client = err.to_client_error();
        assert_eq!(client.message, "internal server error");
        assert!(!client.message.contains("connection string"));

        let err = Error::Upstream(ApiError::unavailable("supabase refused"));
        let client = err.to_client_error();
        assert_eq!(client.message, "service unavailable for this field");

        // Admission rejections keep their detail even in production
        let err = Error::BudgetExceeded {
            cost: 900,
            ceiling: 500,
        };
        let client = err.to_client_error();
        assert!(client.message.contains("900"));
        assert!(client.message.contains("500"));

        std::env::remove_var("ENV");
    }

    #[test]
    fn test_client_error_full_detail_in_development() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("ENV");

        let err = Error::Internal("boom".to_string());
        let client = err.to_client_error();
        assert_eq!(client.message, "internal error: boom");
        assert_eq!(client.code, "INTERNAL_ERROR");
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
