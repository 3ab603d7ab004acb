// src/core/auth.rs

//! The per-cluster authentication state machine.
//!
//! One `AuthManager` exists per cluster for as long as the cluster is part of
//! the runtime; client bundle rebuilds swap the probe underneath it rather
//! than replacing the manager.

use crate::core::errors::KubedeckError;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The authentication state of one cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthState {
    /// Credentials are believed to work.
    Valid,
    /// A failure was reported; retries are scheduled with backoff.
    Recovering,
    /// Recovery attempts are exhausted (or disabled). Waiting for a manual retry.
    Invalid,
}

/// Progress information for the UI countdown while a cluster is recovering.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryInfo {
    pub current_attempt: u32,
    pub max_attempts: u32,
    pub seconds_until_retry: u64,
}

/// Probes whether the cluster's credentials currently work.
#[async_trait]
pub trait AuthProbe: Send + Sync {
    async fn probe(&self) -> Result<(), KubedeckError>;
}

/// A probe slot whose target can be swapped when the client bundle is rebuilt.
/// The manager keeps pointing here across rebuilds.
#[derive(Default)]
pub struct SwappableProbe {
    inner: RwLock<Option<Arc<dyn AuthProbe>>>,
}

impl SwappableProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, probe: Arc<dyn AuthProbe>) {
        *self.inner.write() = Some(probe);
    }
}

#[async_trait]
impl AuthProbe for SwappableProbe {
    async fn probe(&self) -> Result<(), KubedeckError> {
        let probe = self.inner.read().clone();
        match probe {
            Some(p) => p.probe().await,
            None => Err(KubedeckError::ClientsUnavailable(
                "no credential probe installed".to_string(),
            )),
        }
    }
}

/// Backoff policy for recovery retries.
#[derive(Debug, Clone)]
pub struct AuthRetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub progress_tick: Duration,
}

impl From<&crate::config::AuthRecoveryConfig> for AuthRetryPolicy {
    fn from(cfg: &crate::config::AuthRecoveryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts,
            initial_backoff: Duration::from_millis(cfg.initial_backoff_ms),
            max_backoff: Duration::from_millis(cfg.max_backoff_ms),
            progress_tick: Duration::from_millis(cfg.progress_tick_ms.max(1)),
        }
    }
}

impl AuthRetryPolicy {
    /// Exponential backoff with jitter: `initial * 2^(attempt-1)`, capped,
    /// plus up to 25% random jitter to avoid thundering retries.
    fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff);
        let jitter_budget = (base.as_millis() as u64) / 4;
        if jitter_budget == 0 {
            return base;
        }
        let jitter = rand::Rng::gen_range(&mut rand::thread_rng(), 0..=jitter_budget);
        base + Duration::from_millis(jitter)
    }
}

pub type StateChangeCallback = Box<dyn Fn(AuthState, &str) + Send + Sync>;
pub type RecoveryProgressCallback = Box<dyn Fn(RecoveryInfo) + Send + Sync>;

struct AuthInner {
    state: AuthState,
    reason: String,
    attempt: u32,
    retry_deadline: Option<Instant>,
    retry_cancel: Option<CancellationToken>,
    on_state_change: Vec<StateChangeCallback>,
    on_progress: Vec<RecoveryProgressCallback>,
}

/// The per-cluster authentication state machine.
///
/// Callbacks registered via [`AuthManager::on_state_change`] are invoked
/// *while the internal mutex is held*; implementers must hand off any heavy
/// work asynchronously and must never call back into the manager
/// synchronously.
pub struct AuthManager {
    cluster_id: String,
    policy: AuthRetryPolicy,
    probe_slot: Arc<SwappableProbe>,
    inner: Mutex<AuthInner>,
    shutdown: CancellationToken,
}

impl AuthManager {
    pub fn new(cluster_id: impl Into<String>, policy: AuthRetryPolicy) -> Arc<Self> {
        Arc::new(Self {
            cluster_id: cluster_id.into(),
            policy,
            probe_slot: Arc::new(SwappableProbe::new()),
            inner: Mutex::new(AuthInner {
                state: AuthState::Valid,
                reason: String::new(),
                attempt: 0,
                retry_deadline: None,
                retry_cancel: None,
                on_state_change: Vec::new(),
                on_progress: Vec::new(),
            }),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    /// Installs (or swaps) the credential probe. Called on every client bundle
    /// build so the manager always probes the current bundle.
    pub fn install_probe(&self, probe: Arc<dyn AuthProbe>) {
        self.probe_slot.set(probe);
    }

    /// Returns the current state and its reason atomically.
    pub fn state(&self) -> (AuthState, String) {
        let inner = self.inner.lock();
        (inner.state, inner.reason.clone())
    }

    pub fn is_valid(&self) -> bool {
        self.inner.lock().state == AuthState::Valid
    }

    /// Countdown information while recovering, `None` otherwise.
    pub fn recovery_info(&self) -> Option<RecoveryInfo> {
        let inner = self.inner.lock();
        if inner.state != AuthState::Recovering {
            return None;
        }
        Some(RecoveryInfo {
            current_attempt: inner.attempt,
            max_attempts: self.policy.max_attempts,
            seconds_until_retry: inner
                .retry_deadline
                .map(|d| d.saturating_duration_since(Instant::now()).as_secs())
                .unwrap_or(0),
        })
    }

    /// Registers a state-change callback. Invoked in transition order, under
    /// the internal mutex.
    pub fn on_state_change(&self, callback: StateChangeCallback) {
        self.inner.lock().on_state_change.push(callback);
    }

    /// Registers a recovery progress callback, ticked periodically while the
    /// manager is recovering.
    pub fn on_recovery_progress(&self, callback: RecoveryProgressCallback) {
        self.inner.lock().on_progress.push(callback);
    }

    /// Reports a credential failure observed by a caller (heartbeat, API
    /// read). A valid cluster enters recovery; a recovering or invalid
    /// cluster is left alone.
    pub fn report_failure(self: &Arc<Self>, reason: &str) {
        let mut inner = self.inner.lock();
        match inner.state {
            AuthState::Valid => {
                if self.policy.max_attempts == 0 {
                    Self::transition(&mut inner, AuthState::Invalid, reason);
                    return;
                }
                inner.attempt = 0;
                Self::transition(&mut inner, AuthState::Recovering, reason);
                self.schedule_retry_locked(&mut inner, reason);
            }
            AuthState::Recovering => {
                debug!(
                    "Cluster '{}' reported another auth failure while already recovering: {}",
                    self.cluster_id, reason
                );
            }
            AuthState::Invalid => {}
        }
    }

    /// Manually restarts recovery from the invalid state.
    pub fn trigger_retry(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        if inner.state != AuthState::Invalid {
            return;
        }
        inner.attempt = 0;
        Self::transition(&mut inner, AuthState::Recovering, "manual retry requested");
        self.schedule_retry_locked(&mut inner, "manual retry requested");
    }

    /// Cancels any pending retry timer. The manager stays in its final state.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let mut inner = self.inner.lock();
        if let Some(cancel) = inner.retry_cancel.take() {
            cancel.cancel();
        }
    }

    /// Applies a state transition and fires callbacks in order. Must be called
    /// with the inner lock held.
    fn transition(inner: &mut AuthInner, state: AuthState, reason: &str) {
        if inner.state == state && inner.reason == reason {
            return;
        }
        inner.state = state;
        inner.reason = reason.to_string();
        for callback in &inner.on_state_change {
            callback(state, reason);
        }
    }

    /// Schedules the next recovery attempt, or gives up when the budget is
    /// exhausted. Must be called with the inner lock held and only while
    /// `state == Recovering`.
    fn schedule_retry_locked(self: &Arc<Self>, inner: &mut AuthInner, reason: &str) {
        inner.attempt += 1;
        if inner.attempt > self.policy.max_attempts {
            warn!(
                "Cluster '{}' auth recovery exhausted after {} attempts.",
                self.cluster_id, self.policy.max_attempts
            );
            inner.retry_deadline = None;
            inner.retry_cancel = None;
            Self::transition(inner, AuthState::Invalid, "recovery attempts exhausted");
            return;
        }

        let delay = self.policy.backoff_for(inner.attempt);
        let deadline = Instant::now() + delay;
        inner.retry_deadline = Some(deadline);

        let cancel = self.shutdown.child_token();
        if let Some(previous) = inner.retry_cancel.replace(cancel.clone()) {
            previous.cancel();
        }

        debug!(
            "Cluster '{}' auth retry {}/{} scheduled in {:?} ({}).",
            self.cluster_id, inner.attempt, self.policy.max_attempts, delay, reason
        );

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.retry_after(deadline, cancel).await;
        });
    }

    /// Waits out the backoff (emitting progress ticks), then probes once and
    /// transitions based on the result.
    async fn retry_after(self: Arc<Self>, deadline: Instant, cancel: CancellationToken) {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            self.emit_progress(deadline);
            let tick = self.policy.progress_tick.min(remaining);
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(tick) => {}
            }
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            result = self.probe_slot.probe() => result,
        };

        match result {
            Ok(()) => {
                let mut inner = self.inner.lock();
                if inner.state == AuthState::Recovering {
                    info!("Cluster '{}' credentials recovered.", self.cluster_id);
                    inner.attempt = 0;
                    inner.retry_deadline = None;
                    inner.retry_cancel = None;
                    Self::transition(&mut inner, AuthState::Valid, "credentials recovered");
                }
            }
            Err(e) => {
                let mut inner = self.inner.lock();
                if inner.state == AuthState::Recovering {
                    debug!(
                        "Cluster '{}' auth probe failed on attempt {}: {}",
                        self.cluster_id, inner.attempt, e
                    );
                    let reason = e.to_string();
                    self.schedule_retry_locked(&mut inner, &reason);
                }
            }
        }
    }

    fn emit_progress(&self, deadline: Instant) {
        let inner = self.inner.lock();
        if inner.state != AuthState::Recovering {
            return;
        }
        let info = RecoveryInfo {
            current_attempt: inner.attempt,
            max_attempts: self.policy.max_attempts,
            seconds_until_retry: deadline.saturating_duration_since(Instant::now()).as_secs(),
        };
        for callback in &inner.on_progress {
            callback(info.clone());
        }
    }
}

impl std::fmt::Debug for AuthManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (state, reason) = self.state();
        f.debug_struct("AuthManager")
            .field("cluster_id", &self.cluster_id)
            .field("state", &state)
            .field("reason", &reason)
            .finish()
    }
}
