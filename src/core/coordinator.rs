// src/core/coordinator.rs

//! The selection coordinator: serializes every mutation of the active cluster
//! set and preempts older generations by cancellation.

use crate::core::errors::KubedeckError;
use crate::core::metrics;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Rolling diagnostics window size.
const DIAGNOSTICS_WINDOW: usize = 256;

/// Named phases of a selection mutation, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationPhase {
    Queue,
    Intent,
    Commit,
    ClientSync,
    Refresh,
    Catalog,
}

impl MutationPhase {
    pub fn label(&self) -> &'static str {
        match self {
            MutationPhase::Queue => "queue",
            MutationPhase::Intent => "intent",
            MutationPhase::Commit => "commit",
            MutationPhase::ClientSync => "client-sync",
            MutationPhase::Refresh => "refresh",
            MutationPhase::Catalog => "catalog",
        }
    }
}

/// Records phase timings for one mutation.
#[derive(Debug, Default)]
pub struct PhaseRecorder {
    phases: Mutex<HashMap<MutationPhase, Duration>>,
}

impl PhaseRecorder {
    pub fn record(&self, phase: MutationPhase, elapsed: Duration) {
        self.phases.lock().insert(phase, elapsed);
    }

    pub fn snapshot(&self) -> HashMap<MutationPhase, Duration> {
        self.phases.lock().clone()
    }
}

/// Terminal status of one selection mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    Completed,
    Failed,
    Canceled,
    Superseded,
}

impl MutationStatus {
    pub fn label(&self) -> &'static str {
        match self {
            MutationStatus::Completed => "ok",
            MutationStatus::Failed => "failed",
            MutationStatus::Canceled => "canceled",
            MutationStatus::Superseded => "superseded",
        }
    }
}

/// One diagnostics sample.
#[derive(Debug, Clone)]
pub struct SelectionMutationSample {
    pub generation: u64,
    pub reason: String,
    pub status: MutationStatus,
    pub total: Duration,
    pub phases: HashMap<MutationPhase, Duration>,
    pub error: Option<String>,
}

/// The rolling diagnostics window.
#[derive(Debug, Default)]
pub struct SelectionDiagnostics {
    samples: Mutex<VecDeque<SelectionMutationSample>>,
}

impl SelectionDiagnostics {
    fn push(&self, sample: SelectionMutationSample) {
        let mut samples = self.samples.lock();
        if samples.len() == DIAGNOSTICS_WINDOW {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    pub fn snapshot(&self) -> Vec<SelectionMutationSample> {
        self.samples.lock().iter().cloned().collect()
    }

    pub fn count_by_status(&self, status: MutationStatus) -> usize {
        self.samples
            .lock()
            .iter()
            .filter(|s| s.status == status)
            .count()
    }
}

/// The handle a mutation body receives.
#[derive(Debug, Clone)]
pub struct SelectionMutation {
    pub generation: u64,
    /// Cancelled when a newer generation arrives or the app shuts down.
    pub cancel: CancellationToken,
    pub phases: Arc<PhaseRecorder>,
}

impl SelectionMutation {
    /// Bails out with `Canceled` when this generation has been preempted.
    pub fn check_canceled(&self) -> Result<(), KubedeckError> {
        if self.cancel.is_cancelled() {
            Err(KubedeckError::Canceled)
        } else {
            Ok(())
        }
    }
}

/// Serializes cluster-set mutations and owns the generation counter.
pub struct SelectionCoordinator {
    app_cancel: CancellationToken,
    generation: AtomicU64,
    mutation_lock: tokio::sync::Mutex<()>,
    /// The generation currently holding the mutation slot, with its token.
    active_generation: Mutex<Option<(u64, CancellationToken)>>,
    pub diagnostics: SelectionDiagnostics,
}

impl SelectionCoordinator {
    pub fn new(app_cancel: CancellationToken) -> Self {
        Self {
            app_cancel,
            generation: AtomicU64::new(0),
            mutation_lock: tokio::sync::Mutex::new(()),
            active_generation: Mutex::new(None),
            diagnostics: SelectionDiagnostics::default(),
        }
    }

    /// The most recently issued generation.
    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn is_selection_generation_current(&self, generation: u64) -> bool {
        generation == self.current_generation()
    }

    /// Runs `body` as the next selection mutation.
    ///
    /// The new generation preempts the in-flight one by cancelling its token
    /// *before* waiting for the serialization slot. A mutation that loses the
    /// race while waiting finalizes as superseded and returns Ok. Canceled
    /// and superseded outcomes are success-equivalent for the caller.
    pub async fn run_selection_mutation<F, Fut>(
        &self,
        reason: &str,
        body: F,
    ) -> Result<(), KubedeckError>
    where
        F: FnOnce(SelectionMutation) -> Fut,
        Fut: Future<Output = Result<(), KubedeckError>>,
    {
        let started = Instant::now();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        // Preempt stale work immediately, even before acquiring the slot.
        if let Some((active, token)) = self.active_generation.lock().as_ref() {
            debug!(
                "Selection mutation '{}' (gen {}) preempting generation {}.",
                reason, generation, active
            );
            token.cancel();
        }

        let _slot = self.mutation_lock.lock().await;
        let queue_wait = started.elapsed();

        if self.current_generation() != generation {
            // A newer mutation arrived while this one was waiting.
            self.finalize(SelectionMutationSample {
                generation,
                reason: reason.to_string(),
                status: MutationStatus::Superseded,
                total: started.elapsed(),
                phases: HashMap::new(),
                error: None,
            });
            return Ok(());
        }

        let cancel = self.app_cancel.child_token();
        {
            let mut active = self.active_generation.lock();
            if let Some((_, stale)) = active.replace((generation, cancel.clone())) {
                stale.cancel();
            }
        }

        let phases = Arc::new(PhaseRecorder::default());
        phases.record(MutationPhase::Queue, queue_wait);

        let mutation = SelectionMutation {
            generation,
            cancel: cancel.clone(),
            phases: phases.clone(),
        };

        let result = body(mutation).await;

        {
            let mut active = self.active_generation.lock();
            if matches!(&*active, Some((g, _)) if *g == generation) {
                *active = None;
            }
        }

        let (status, error) = match &result {
            Ok(()) => (MutationStatus::Completed, None),
            Err(KubedeckError::Canceled) => (MutationStatus::Canceled, None),
            Err(KubedeckError::Superseded) => (MutationStatus::Superseded, None),
            Err(e) => (MutationStatus::Failed, Some(e.to_string())),
        };

        if status == MutationStatus::Failed {
            warn!(
                "Selection mutation '{}' (gen {}) failed: {}",
                reason,
                generation,
                error.as_deref().unwrap_or("unknown")
            );
        }

        self.finalize(SelectionMutationSample {
            generation,
            reason: reason.to_string(),
            status,
            total: started.elapsed(),
            phases: phases.snapshot(),
            error,
        });

        match status {
            MutationStatus::Completed | MutationStatus::Canceled | MutationStatus::Superseded => {
                Ok(())
            }
            MutationStatus::Failed => result,
        }
    }

    /// Fire-and-forget variant for callers that must not block, such as auth
    /// state-change handlers.
    pub fn run_selection_mutation_async<F, Fut>(self: &Arc<Self>, reason: String, body: F)
    where
        F: FnOnce(SelectionMutation) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), KubedeckError>> + Send,
    {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let _ = coordinator.run_selection_mutation(&reason, body).await;
        });
    }

    fn finalize(&self, sample: SelectionMutationSample) {
        metrics::SELECTION_MUTATIONS_TOTAL
            .with_label_values(&[sample.status.label()])
            .inc();
        self.diagnostics.push(sample);
    }
}

impl std::fmt::Debug for SelectionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectionCoordinator")
            .field("generation", &self.current_generation())
            .finish()
    }
}
