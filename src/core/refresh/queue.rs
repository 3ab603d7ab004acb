// src/core/refresh/queue.rs

//! The per-cluster manual refresh queue: jobs enqueued by the UI, processed
//! one at a time by a worker that blocks until cancellation.

use crate::core::errors::KubedeckError;
use crate::core::selection::ClusterMeta;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Capacity of the pending-job channel per cluster.
const REFRESH_QUEUE_CAPACITY: usize = 64;

/// Terminal and in-flight states of one refresh job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshJobState {
    Queued,
    Running,
    Succeeded,
    Failed(String),
    Cancelled,
}

impl RefreshJobState {
    pub fn label(&self) -> &'static str {
        match self {
            RefreshJobState::Queued => "queued",
            RefreshJobState::Running => "running",
            RefreshJobState::Succeeded => "succeeded",
            RefreshJobState::Failed(_) => "failed",
            RefreshJobState::Cancelled => "cancelled",
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            RefreshJobState::Failed(message) => Some(message),
            _ => None,
        }
    }
}

/// One manual refresh job on one cluster.
#[derive(Debug, Clone)]
pub struct RefreshJob {
    pub id: String,
    pub domain: String,
    pub scope: String,
    pub reason: String,
    pub state: RefreshJobState,
}

/// Executes one refresh against the cluster. The production handler re-lists
/// the domain and republishes fresh state; tests record invocations.
#[async_trait]
pub trait RefreshHandler: Send + Sync {
    async fn refresh(&self, domain: &str, scope: &str) -> Result<(), KubedeckError>;
}

/// The per-cluster job queue.
#[derive(Debug)]
pub struct RefreshQueue {
    meta: ClusterMeta,
    jobs: DashMap<String, RefreshJob>,
    tx: mpsc::Sender<String>,
    counter: AtomicU64,
}

impl RefreshQueue {
    /// Creates the queue plus the receiver its worker drains.
    pub fn new(meta: ClusterMeta) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(REFRESH_QUEUE_CAPACITY);
        (
            Arc::new(Self {
                meta,
                jobs: DashMap::new(),
                tx,
                counter: AtomicU64::new(0),
            }),
            rx,
        )
    }

    pub fn meta(&self) -> &ClusterMeta {
        &self.meta
    }

    /// Enqueues a job and returns its id.
    pub fn enqueue(
        &self,
        domain: &str,
        scope: &str,
        reason: &str,
    ) -> Result<String, KubedeckError> {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("job-{}-{seq}", self.meta.id);
        let job = RefreshJob {
            id: id.clone(),
            domain: domain.to_string(),
            scope: scope.to_string(),
            reason: reason.to_string(),
            state: RefreshJobState::Queued,
        };
        self.jobs.insert(id.clone(), job);
        if self.tx.try_send(id.clone()).is_err() {
            self.mark(&id, RefreshJobState::Failed("refresh queue is full".to_string()));
            return Err(KubedeckError::Internal(format!(
                "refresh queue for cluster '{}' is full",
                self.meta.id
            )));
        }
        Ok(id)
    }

    pub fn status(&self, job_id: &str) -> Option<RefreshJobState> {
        self.jobs.get(job_id).map(|j| j.state.clone())
    }

    pub fn job(&self, job_id: &str) -> Option<RefreshJob> {
        self.jobs.get(job_id).map(|j| j.clone())
    }

    fn mark(&self, job_id: &str, state: RefreshJobState) {
        if let Some(mut job) = self.jobs.get_mut(job_id) {
            job.state = state;
        }
    }

    /// Marks every non-terminal job cancelled. Called on subsystem shutdown.
    pub fn cancel_pending(&self) {
        for mut entry in self.jobs.iter_mut() {
            if matches!(entry.state, RefreshJobState::Queued | RefreshJobState::Running) {
                entry.state = RefreshJobState::Cancelled;
            }
        }
    }
}

/// The single worker draining one cluster's refresh queue.
pub struct RefreshWorker {
    queue: Arc<RefreshQueue>,
    handler: Arc<dyn RefreshHandler>,
}

impl RefreshWorker {
    pub fn new(queue: Arc<RefreshQueue>, handler: Arc<dyn RefreshHandler>) -> Self {
        Self { queue, handler }
    }

    /// Processes jobs until the cancellation token fires. Receiving the next
    /// job blocks; cancellation is the only way out.
    pub async fn run(self, mut rx: mpsc::Receiver<String>, cancel: CancellationToken) {
        loop {
            let job_id = tokio::select! {
                _ = cancel.cancelled() => {
                    self.queue.cancel_pending();
                    return;
                }
                next = rx.recv() => match next {
                    Some(id) => id,
                    None => return,
                },
            };

            let Some(job) = self.queue.job(&job_id) else {
                continue;
            };
            if job.state != RefreshJobState::Queued {
                continue;
            }

            self.queue.mark(&job_id, RefreshJobState::Running);
            debug!(
                "Cluster '{}' running manual refresh '{}' (domain={}, scope={}, reason={}).",
                self.queue.meta.id, job_id, job.domain, job.scope, job.reason
            );

            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    self.queue.mark(&job_id, RefreshJobState::Cancelled);
                    self.queue.cancel_pending();
                    return;
                }
                result = self.handler.refresh(&job.domain, &job.scope) => result,
            };

            match result {
                Ok(()) => self.queue.mark(&job_id, RefreshJobState::Succeeded),
                Err(e) => {
                    warn!(
                        "Cluster '{}' manual refresh '{}' failed: {}",
                        self.queue.meta.id, job_id, e
                    );
                    self.queue.mark(&job_id, RefreshJobState::Failed(e.to_string()));
                }
            }
        }
    }
}
