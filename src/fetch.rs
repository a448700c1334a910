//! Upstream REST boundary
//!
//! The gateway resolves entity data from opaque REST microservices (doctor,
//! patient, appointment services and so on). This module defines the
//! [`FetchClient`] seam the batch loader talks to, and an HTTP
//! implementation with per-request timeouts and retry with exponential
//! backoff.
//!
//! Failure shape matters more than transport detail here: `batch_fetch`
//! returns one independent `Result` per request, positionally aligned with
//! its input, so one failed key can never poison its siblings.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Error returned by the upstream boundary.
///
/// Cloneable so the batch loader can hand the same failure to every caller
/// waiting on a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    pub message: String,
    pub code: String,
}

impl ApiError {
    pub fn new(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: code.into(),
        }
    }

    /// Transport-level failure: unreachable service, timeout, invalid body
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(message, "UPSTREAM_UNAVAILABLE")
    }

    /// Upstream explicitly reported the entity as absent
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(message, "NOT_FOUND")
    }

    pub fn is_not_found(&self) -> bool {
        self.code == "NOT_FOUND"
    }
}

/// HTTP methods supported by the fetch boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        };
        write!(f, "{s}")
    }
}

/// One upstream request: method, path and optional parameters.
///
/// For GET requests `params` become query-string pairs; for mutating
/// methods they are sent as the JSON body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchRequest {
    pub method: HttpMethod,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl FetchRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            path: path.into(),
            params: None,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }
}

/// The opaque boundary to upstream REST microservices.
///
/// `batch_fetch` never fails as a whole because one element failed; each
/// position carries its own success or [`ApiError`].
#[async_trait]
pub trait FetchClient: Send + Sync {
    async fn fetch(&self, request: FetchRequest) -> Result<Value, ApiError>;

    async fn batch_fetch(&self, requests: Vec<FetchRequest>) -> Vec<Result<Value, ApiError>>;
}

/// Retry configuration for failed upstream requests
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
    /// HTTP status codes that should trigger a retry
    pub retry_statuses: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            retry_statuses: vec![429, 500, 502, 503, 504],
        }
    }
}

impl RetryConfig {
    /// Disable retries
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }
}

/// Configuration for the HTTP fetch client
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Base URL of the upstream service mesh entry point
    pub base_url: String,
    /// Fixed per-request timeout, distinct from any batching window
    pub timeout: Duration,
    /// Default headers for all requests
    pub default_headers: HashMap<String, String>,
    /// Retry policy
    pub retry: RetryConfig,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout: Duration::from_secs(30),
            default_headers: HashMap::new(),
            retry: RetryConfig::default(),
        }
    }
}

/// HTTP implementation of [`FetchClient`] over `reqwest`
pub struct HttpFetchClient {
    config: FetchConfig,
    client: reqwest::Client,
}

impl HttpFetchClient {
    pub fn new(config: FetchConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self::new(FetchConfig {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            ..Default::default()
        })
    }

    fn build_url(&self, request: &FetchRequest) -> String {
        let mut url = format!("{}{}", self.config.base_url, request.path);
        if request.method == HttpMethod::Get {
            if let Some(Value::Object(params)) = &request.params {
                let query: Vec<String> = params
                    .iter()
                    .map(|(k, v)| {
                        let v = match v {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        format!("{}={}", k, urlencoding::encode(&v))
                    })
                    .collect();
                if !query.is_empty() {
                    url.push('?');
                    url.push_str(&query.join("&"));
                }
            }
        }
        url
    }

    async fn execute_once(&self, request: &FetchRequest) -> Result<(u16, Value), ApiError> {
        let url = self.build_url(request);
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&url),
            HttpMethod::Post => self.client.post(&url),
            HttpMethod::Put => self.client.put(&url),
            HttpMethod::Patch => self.client.patch(&url),
            HttpMethod::Delete => self.client.delete(&url),
        };

        for (key, value) in &self.config.default_headers {
            builder = builder.header(key, value);
        }

        if request.method != HttpMethod::Get {
            if let Some(params) = &request.params {
                builder = builder.json(params);
            }
        }

        let response = builder
            .timeout(self.config.timeout)
            .send()
            .await
            .map_err(|e| ApiError::unavailable(format!("{} {url} failed: {e}", request.method)))?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| ApiError::unavailable(format!("reading body from {url}: {e}")))?;
        let body: Value = serde_json::from_str(&text).unwrap_or(Value::String(text));

        Ok((status, body))
    }

    async fn execute_with_retry(&self, request: &FetchRequest) -> Result<Value, ApiError> {
        let retry = &self.config.retry;
        let mut attempts = 0;
        let mut backoff = retry.initial_backoff;

        loop {
            attempts += 1;
            match self.execute_once(request).await {
                Ok((status, body)) if (200..300).contains(&status) => {
                    debug!(method = %request.method, path = %request.path, status, "upstream fetch ok");
                    return Ok(body);
                }
                Ok((404, _)) => {
                    return Err(ApiError::not_found(format!(
                        "{} not found upstream",
                        request.path
                    )));
                }
                Ok((status, body)) => {
                    if retry.retry_statuses.contains(&status) && attempts <= retry.max_retries {
                        warn!(
                            method = %request.method, path = %request.path, status,
                            attempt = attempts, "upstream returned retryable status, backing off"
                        );
                        tokio::time::sleep(backoff).await;
                        backoff = next_backoff(backoff, retry);
                        continue;
                    }
                    return Err(ApiError::new(
                        format!("{} {} returned {status}: {body}", request.method, request.path),
                        format!("HTTP_{status}"),
                    ));
                }
                Err(e) => {
                    if attempts <= retry.max_retries {
                        warn!(
                            method = %request.method, path = %request.path, error = %e,
                            attempt = attempts, "upstream fetch failed, backing off"
                        );
                        tokio::time::sleep(backoff).await;
                        backoff = next_backoff(backoff, retry);
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }
}

fn next_backoff(current: Duration, retry: &RetryConfig) -> Duration {
    std::cmp::min(
        Duration::from_secs_f64(current.as_secs_f64() * retry.multiplier),
        retry.max_backoff,
    )
}

#[async_trait]
impl FetchClient for HttpFetchClient {
    async fn fetch(&self, request: FetchRequest) -> Result<Value, ApiError> {
        self.execute_with_retry(&request).await
    }

    async fn batch_fetch(&self, requests: Vec<FetchRequest>) -> Vec<Result<Value, ApiError>> {
        // Concurrent, positionally aligned, per-element failure. The batch
        // loader bounds fan-out via its max batch size.
        futures::future::join_all(
            requests
                .into_iter()
                .map(|request| async move { self.execute_with_retry(&request).await }),
        )
        .await
    }
}
