//! Keyed batch loading for upstream entity fetches
//!
//! This module provides the loader that prevents N+1 upstream calls: many
//! individual `load(key)` calls issued while resolving one operation are
//! coalesced into a single batched fetch per unique key.
//!
//! # How It Works
//!
//! 1. **Registration**: `load(key)` registers the key in the current batch
//!    window (creating one if needed) and returns once the batch resolves
//! 2. **Flush**: the window dispatches after the scheduling interval
//!    (default 10ms) or once it holds the maximum key count (default 100),
//!    whichever comes first
//! 3. **Dedup**: the batch function receives each unique key once, in order
//!    of first appearance; results are re-expanded to every waiting caller
//! 4. **Isolation**: a failed key rejects only its own callers; sibling keys
//!    in the same batch resolve normally
//!
//! Loader-local memoization keeps a key from being fetched twice within one
//! loader's lifetime; it is distinct from the tiered cache and is discarded
//! with the loader at the end of the request.

use crate::fetch::{ApiError, FetchClient, FetchRequest};
use crate::metrics::Metrics;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Outcome of fetching one key within a batch.
///
/// `Missing` is a legitimate result (the entity does not exist), not an
/// error; only `Failed` rejects the waiting callers.
#[derive(Clone, Debug)]
pub enum BatchEntry {
    Found(serde_json::Value),
    Missing,
    Failed(ApiError),
}

/// Batch function invoked once per window flush.
///
/// The returned vector must be positionally aligned with `keys`. A top-level
/// `Err` fails every key in the window.
#[async_trait::async_trait]
pub trait BatchFetcher: Send + Sync {
    async fn fetch_batch(&self, keys: &[String]) -> std::result::Result<Vec<BatchEntry>, ApiError>;
}

/// Configuration for one loader.
#[derive(Clone, Debug)]
pub struct LoaderConfig {
    /// Scheduling window: how long a new window waits before dispatching
    pub window: Duration,
    /// Dispatch immediately once this many unique keys are queued
    pub max_batch_size: usize,
    /// Remember resolved keys for the lifetime of the loader
    pub memoize: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(10),
            max_batch_size: 100,
            memoize: true,
        }
    }
}

impl LoaderConfig {
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_max_batch_size(mut self, max: usize) -> Self {
        self.max_batch_size = max;
        self
    }

    pub fn with_memoize(mut self, memoize: bool) -> Self {
        self.memoize = memoize;
        self
    }
}

/// Cloneable per-key outcome, fanned out to every waiter of the key.
type LoadResult = std::result::Result<Option<serde_json::Value>, ApiError>;

struct Window {
    generation: u64,
    /// Unique keys in order of first appearance
    keys: Vec<String>,
    waiters: HashMap<String, Vec<oneshot::Sender<LoadResult>>>,
}

#[derive(Default)]
struct LoaderState {
    current: Option<Window>,
    next_generation: u64,
    /// Keys dispatched but not yet resolved; late loads join here
    in_flight: HashMap<String, Vec<oneshot::Sender<LoadResult>>>,
    memo: HashMap<String, LoadResult>,
}

enum Registration {
    Memoized(LoadResult),
    Pending(oneshot::Receiver<LoadResult>),
}

struct LoaderInner {
    name: String,
    config: LoaderConfig,
    fetcher: Arc<dyn BatchFetcher>,
    metrics: Arc<Metrics>,
    state: Mutex<LoaderState>,
}

/// Batching loader for one key-type (doctors, patients, schedule slots, ...).
///
/// Cheap to clone; clones share the same windows and memo. Intended lifetime
/// is one logical operation.
#[derive(Clone)]
pub struct KeyedBatchLoader {
    inner: Arc<LoaderInner>,
}

impl KeyedBatchLoader {
    pub fn new(
        name: impl Into<String>,
        fetcher: Arc<dyn BatchFetcher>,
        config: LoaderConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            inner: Arc::new(LoaderInner {
                name: name.into(),
                config,
                fetcher,
                metrics,
                state: Mutex::new(LoaderState::default()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Load one key, batching with other loads issued within the window.
    ///
    /// `Ok(None)` means the upstream reported the key as not found.
    pub async fn load(&self, key: impl Into<String>) -> Result<Option<serde_json::Value>> {
        let (mut registrations, flushed) = self.register_keys(vec![key.into()]);
        for window in flushed {
            self.spawn_dispatch(window);
        }
        let registration = registrations.pop().ok_or_else(|| {
            Error::Internal("registration produced no pending slot".to_string())
        })?;
        Self::resolve(registration).await
    }

    /// Load many keys at once. The output is positionally aligned with the
    /// input, duplicates included; each element fails or succeeds
    /// independently.
    pub async fn load_many(
        &self,
        keys: Vec<String>,
    ) -> Vec<Result<Option<serde_json::Value>>> {
        if keys.is_empty() {
            return Vec::new();
        }
        let (registrations, flushed) = self.register_keys(keys);
        for window in flushed {
            self.spawn_dispatch(window);
        }
        let mut results = Vec::with_capacity(registrations.len());
        for registration in registrations {
            results.push(Self::resolve(registration).await);
        }
        results
    }

    /// Forget the memoized result for `key` so the next load refetches it.
    pub fn clear(&self, key: &str) {
        self.inner.state.lock().memo.remove(key);
    }

    /// Forget every memoized result.
    pub fn clear_all(&self) {
        self.inner.state.lock().memo.clear();
    }

    async fn resolve(registration: Registration) -> Result<Option<serde_json::Value>> {
        let outcome = match registration {
            Registration::Memoized(outcome) => outcome,
            Registration::Pending(receiver) => receiver.await.map_err(|_| {
                Error::Internal("batch dispatch dropped without delivering a result".to_string())
            })?,
        };
        outcome.map_err(Error::Upstream)
    }

    /// Register keys under one lock acquisition so a multi-key load lands in
    /// a single window whenever capacity allows.
    fn register_keys(&self, keys: Vec<String>) -> (Vec<Registration>, Vec<Window>) {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        let mut registrations = Vec::with_capacity(keys.len());
        let mut flushed = Vec::new();

        for key in keys {
            if inner.config.memoize {
                if let Some(outcome) = state.memo.get(&key) {
                    registrations.push(Registration::Memoized(outcome.clone()));
                    continue;
                }
            }

            let (sender, receiver) = oneshot::channel();
            registrations.push(Registration::Pending(receiver));

            if let Some(waiters) = state.in_flight.get_mut(&key) {
                waiters.push(sender);
                continue;
            }

            if state.current.is_none() {
                let generation = state.next_generation;
                state.next_generation += 1;
                self.spawn_flush_timer(generation);
                state.current = Some(Window {
                    generation,
                    keys: Vec::new(),
                    waiters: HashMap::new(),
                });
            }

            let window_full = match state.current.as_mut() {
                Some(window) => {
                    if !window.waiters.contains_key(&key) {
                        window.keys.push(key.clone());
                    }
                    window.waiters.entry(key).or_default().push(sender);
                    window.keys.len() >= inner.config.max_batch_size
                }
                None => false,
            };

            if window_full {
                if let Some(full) = state.current.take() {
                    Self::mark_in_flight(&mut state, &full);
                    flushed.push(full);
                }
            }
        }

        (registrations, flushed)
    }

    /// Move a window's waiters into the in-flight map so loads arriving
    /// during the fetch attach to it instead of refetching.
    fn mark_in_flight(state: &mut LoaderState, window: &Window) {
        for key in &window.keys {
            state.in_flight.entry(key.clone()).or_default();
        }
    }

    fn spawn_flush_timer(&self, generation: u64) {
        let inner = Arc::clone(&self.inner);
        let window = self.inner.config.window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let taken = {
                let mut state = inner.state.lock();
                // The size trigger may have flushed this generation already
                let still_current =
                    matches!(&state.current, Some(current) if current.generation == generation);
                if still_current {
                    state.current.take().map(|window| {
                        Self::mark_in_flight(&mut state, &window);
                        window
                    })
                } else {
                    None
                }
            };
            if let Some(window) = taken {
                Self::dispatch(inner, window).await;
            }
        });
    }

    fn spawn_dispatch(&self, window: Window) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            Self::dispatch(inner, window).await;
        });
    }

    async fn dispatch(inner: Arc<LoaderInner>, mut window: Window) {
        let keys = std::mem::take(&mut window.keys);
        tracing::debug!(loader = %inner.name, batch_size = keys.len(), "dispatching batch");
        inner.metrics.record_batch_size(keys.len());

        let outcomes: Vec<LoadResult> = match inner.fetcher.fetch_batch(&keys).await {
            Ok(entries) if entries.len() == keys.len() => entries
                .into_iter()
                .map(|entry| match entry {
                    BatchEntry::Found(value) => Ok(Some(value)),
                    BatchEntry::Missing => Ok(None),
                    BatchEntry::Failed(error) => Err(error),
                })
                .collect(),
            Ok(entries) => {
                tracing::error!(
                    loader = %inner.name,
                    expected = keys.len(),
                    received = entries.len(),
                    "batch function returned a misaligned result set"
                );
                let error = ApiError {
                    message: format!(
                        "batch for '{}' returned {} results for {} keys",
                        inner.name,
                        entries.len(),
                        keys.len()
                    ),
                    code: "BATCH_SHAPE_MISMATCH".to_string(),
                };
                keys.iter().map(|_| Err(error.clone())).collect()
            }
            Err(error) => {
                tracing::warn!(loader = %inner.name, %error, "whole batch failed");
                keys.iter().map(|_| Err(error.clone())).collect()
            }
        };

        let mut deliveries: Vec<(oneshot::Sender<LoadResult>, LoadResult)> = Vec::new();
        {
            let mut state = inner.state.lock();
            for (key, outcome) in keys.iter().zip(outcomes) {
                if inner.config.memoize {
                    state.memo.insert(key.clone(), outcome.clone());
                }
                let mut waiters = window.waiters.remove(key).unwrap_or_default();
                if let Some(late) = state.in_flight.remove(key) {
                    waiters.extend(late);
                }
                for waiter in waiters {
                    deliveries.push((waiter, outcome.clone()));
                }
            }
        }
        for (waiter, outcome) in deliveries {
            // A closed receiver means the caller was cancelled; nothing to do
            let _ = waiter.send(outcome);
        }
    }
}

impl std::fmt::Debug for KeyedBatchLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedBatchLoader")
            .field("name", &self.inner.name)
            .field("config", &self.inner.config)
            .finish()
    }
}

/// [`BatchFetcher`] backed by a [`FetchClient`], mapping each key to one REST
/// request. Not-found responses become [`BatchEntry::Missing`].
pub struct RestBatchFetcher {
    client: Arc<dyn FetchClient>,
    to_request: Box<dyn Fn(&str) -> FetchRequest + Send + Sync>,
}

impl RestBatchFetcher {
    pub fn new(
        client: Arc<dyn FetchClient>,
        to_request: impl Fn(&str) -> FetchRequest + Send + Sync + 'static,
    ) -> Self {
        Self {
            client,
            to_request: Box::new(to_request),
        }
    }
}

#[async_trait::async_trait]
impl BatchFetcher for RestBatchFetcher {
    async fn fetch_batch(&self, keys: &[String]) -> std::result::Result<Vec<BatchEntry>, ApiError> {
        let requests = keys.iter().map(|key| (self.to_request)(key)).collect();
        let responses = self.client.batch_fetch(requests).await;
        Ok(responses
            .into_iter()
            .map(|response| match response {
                Ok(value) => BatchEntry::Found(value),
                Err(error) if error.is_not_found() => BatchEntry::Missing,
                Err(error) => BatchEntry::Failed(error),
            })
            .collect())
    }
}
