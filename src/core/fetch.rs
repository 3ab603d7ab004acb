// src/core/fetch.rs

//! The retry loop around a single cluster read: transient-error
//! classification, bounded retries with a replaceable sleep, cache
//! population, and telemetry.

use crate::config::FetchConfig;
use crate::core::cache::ResponseCache;
use crate::core::errors::KubedeckError;
use crate::core::events::UiEventBus;
use crate::core::metrics;
use crate::core::transport::TransportFailureTracker;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::warn;

/// Per-instance retry telemetry, mirrored to the Prometheus registry.
#[derive(Debug, Default)]
pub struct FetchStats {
    pub retry_attempts: AtomicU64,
    pub retry_successes: AtomicU64,
    pub retry_exhausted: AtomicU64,
}

impl FetchStats {
    pub fn retry_attempts(&self) -> u64 {
        self.retry_attempts.load(Ordering::Relaxed)
    }

    pub fn retry_successes(&self) -> u64 {
        self.retry_successes.load(Ordering::Relaxed)
    }

    pub fn retry_exhausted(&self) -> u64 {
        self.retry_exhausted.load(Ordering::Relaxed)
    }
}

type RetrySleep = Arc<dyn Fn(Duration) -> BoxFuture<'static, ()> + Send + Sync>;

/// Coordinates single reads against cluster APIs: cache lookup, bounded
/// retries on transient errors, telemetry, and structured UI error events on
/// final failure.
pub struct FetchCoordinator {
    cache: Arc<ResponseCache>,
    ui_bus: Arc<UiEventBus>,
    transport: Option<Arc<TransportFailureTracker>>,
    max_attempts: u32,
    retry_delay: Duration,
    retry_sleep: RetrySleep,
    pub stats: FetchStats,
}

impl FetchCoordinator {
    pub fn new(cache: Arc<ResponseCache>, ui_bus: Arc<UiEventBus>, cfg: &FetchConfig) -> Self {
        Self {
            cache,
            ui_bus,
            transport: None,
            max_attempts: cfg.max_attempts.max(1),
            retry_delay: cfg.retry_delay(),
            retry_sleep: Arc::new(|d| Box::pin(tokio::time::sleep(d))),
            stats: FetchStats::default(),
        }
    }

    /// Wires transport failure accounting into the retry loop.
    pub fn with_transport_tracker(mut self, tracker: Arc<TransportFailureTracker>) -> Self {
        self.transport = Some(tracker);
        self
    }

    /// Replaces the inter-attempt sleep. Tests use a no-op sleep.
    pub fn with_retry_sleep<F>(mut self, sleep: F) -> Self
    where
        F: Fn(Duration) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        self.retry_sleep = Arc::new(sleep);
        self
    }

    /// Performs one read for `cluster_id`, consulting the cache first when
    /// `cache_key` is non-empty and retrying transient failures.
    ///
    /// `kind` and `identifier` describe the resource for the `backend-error`
    /// event emitted on final failure.
    pub async fn fetch_resource<T, F, Fut>(
        &self,
        cluster_id: &str,
        cache_key: &str,
        kind: &str,
        identifier: &str,
        fetch: F,
    ) -> Result<T, KubedeckError>
    where
        T: Serialize + DeserializeOwned,
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, KubedeckError>>,
    {
        if !cache_key.is_empty()
            && let Some(value) = self.cache.get(cluster_id, cache_key)
            && let Ok(cached) = serde_json::from_value::<T>(value)
        {
            return Ok(cached);
        }

        let mut attempt: u32 = 1;
        let mut retried = false;
        loop {
            match fetch().await {
                Ok(value) => {
                    if retried {
                        self.stats.retry_successes.fetch_add(1, Ordering::Relaxed);
                        metrics::FETCH_RETRY_SUCCESSES_TOTAL.inc();
                    }
                    if let Some(tracker) = &self.transport {
                        tracker.record_success(cluster_id);
                    }
                    if !cache_key.is_empty()
                        && let Ok(json) = serde_json::to_value(&value)
                    {
                        self.cache.put(cluster_id, cache_key, json);
                    }
                    return Ok(value);
                }
                Err(err) => {
                    let retryable = err.is_retryable();
                    if retryable && let Some(tracker) = &self.transport {
                        tracker.record_failure(cluster_id, kind, &err);
                    }
                    if retryable && attempt < self.max_attempts {
                        attempt += 1;
                        retried = true;
                        self.stats.retry_attempts.fetch_add(1, Ordering::Relaxed);
                        metrics::FETCH_RETRY_ATTEMPTS_TOTAL.inc();
                        warn!(
                            "Transient error fetching {} '{}' from cluster '{}' (attempt {}/{}): {}",
                            kind, identifier, cluster_id, attempt, self.max_attempts, err
                        );
                        (self.retry_sleep)(self.retry_delay).await;
                        continue;
                    }

                    if retryable {
                        self.stats.retry_exhausted.fetch_add(1, Ordering::Relaxed);
                        metrics::FETCH_RETRY_EXHAUSTED_TOTAL.inc();
                    }
                    self.ui_bus
                        .emit_backend_error(cluster_id, kind, identifier, &err.to_string());
                    return Err(err);
                }
            }
        }
    }
}

impl std::fmt::Debug for FetchCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchCoordinator")
            .field("max_attempts", &self.max_attempts)
            .field("retry_delay", &self.retry_delay)
            .finish()
    }
}
