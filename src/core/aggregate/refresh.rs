// src/core/aggregate/refresh.rs

//! The aggregate manual refresh queue: fans one refresh request out to the
//! per-cluster queues and reduces their child job states to one status.

use crate::core::errors::KubedeckError;
use crate::core::lifecycle::LifecycleManager;
use crate::core::metrics;
use crate::core::refresh::RefreshJobState;
use crate::core::scope::Scope;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use super::snapshot::AggregateSnapshotService;

/// One aggregate job and its child jobs per cluster.
#[derive(Debug, Clone)]
pub struct AggregateRefreshJob {
    pub id: String,
    pub domain: String,
    pub scope: String,
    pub reason: String,
    /// cluster id → child job id
    pub child_jobs: HashMap<String, String>,
}

/// The reduced status of an aggregate job.
#[derive(Debug, Clone, Serialize)]
pub struct AggregateRefreshStatus {
    pub id: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "childJobs")]
    pub child_jobs: HashMap<String, String>,
}

/// Fans refresh requests out across clusters.
pub struct AggregateRefreshQueue {
    lifecycle: Arc<LifecycleManager>,
    snapshots: Arc<AggregateSnapshotService>,
    jobs: DashMap<String, AggregateRefreshJob>,
    counter: AtomicU64,
}

impl AggregateRefreshQueue {
    pub fn new(lifecycle: Arc<LifecycleManager>, snapshots: Arc<AggregateSnapshotService>) -> Self {
        Self {
            lifecycle,
            snapshots,
            jobs: DashMap::new(),
            counter: AtomicU64::new(0),
        }
    }

    /// Enqueues one refresh on every target cluster and returns the aggregate
    /// job id.
    pub fn enqueue(
        &self,
        domain: &str,
        raw_scope: &str,
        reason: &str,
    ) -> Result<String, KubedeckError> {
        let scope = Scope::parse(raw_scope)?;
        let targets = self.snapshots.resolve_targets(domain, &scope)?;
        let per_cluster_scope = scope.per_cluster_scope();

        let mut child_jobs = HashMap::with_capacity(targets.len());
        for target in &targets {
            let child_id = target
                .queue
                .enqueue(domain, &per_cluster_scope, reason)?;
            child_jobs.insert(target.meta.id.clone(), child_id);
        }

        let seq = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("job-agg-{seq}");
        debug!(
            "Aggregate refresh '{}' enqueued for domain '{}' across {} clusters ({}).",
            id,
            domain,
            child_jobs.len(),
            reason
        );
        self.jobs.insert(
            id.clone(),
            AggregateRefreshJob {
                id: id.clone(),
                domain: domain.to_string(),
                scope: raw_scope.to_string(),
                reason: reason.to_string(),
                child_jobs,
            },
        );
        metrics::MANUAL_REFRESH_JOBS_TOTAL.inc();
        Ok(id)
    }

    /// Reduces the child job states:
    /// any Failed → Failed (first error, prefixed with its cluster id);
    /// any Cancelled → Cancelled; any Running → Running; any Queued → Queued;
    /// all Succeeded → Succeeded.
    pub fn status(&self, aggregate_id: &str) -> Result<AggregateRefreshStatus, KubedeckError> {
        let job = self
            .jobs
            .get(aggregate_id)
            .map(|j| j.clone())
            .ok_or_else(|| KubedeckError::JobNotFound(aggregate_id.to_string()))?;

        let mut states: Vec<(String, RefreshJobState)> = Vec::with_capacity(job.child_jobs.len());
        for (cluster_id, child_id) in &job.child_jobs {
            let state = self
                .lifecycle
                .subsystem(cluster_id)
                .and_then(|s| s.queue.status(child_id))
                // The cluster left the selection: its child is gone for good.
                .unwrap_or(RefreshJobState::Cancelled);
            states.push((cluster_id.clone(), state));
        }

        let failed = states
            .iter()
            .find_map(|(cluster_id, state)| {
                state
                    .error()
                    .map(|message| format!("Cluster {cluster_id}: {message}"))
            });
        let reduced = if let Some(error) = failed {
            return Ok(AggregateRefreshStatus {
                id: job.id,
                state: "failed".to_string(),
                error: Some(error),
                child_jobs: job.child_jobs,
            });
        } else if states.iter().any(|(_, s)| *s == RefreshJobState::Cancelled) {
            "cancelled"
        } else if states.iter().any(|(_, s)| *s == RefreshJobState::Running) {
            "running"
        } else if states.iter().any(|(_, s)| *s == RefreshJobState::Queued) {
            "queued"
        } else {
            "succeeded"
        };

        Ok(AggregateRefreshStatus {
            id: job.id,
            state: reduced.to_string(),
            error: None,
            child_jobs: job.child_jobs,
        })
    }
}

impl std::fmt::Debug for AggregateRefreshQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateRefreshQueue")
            .field("jobs", &self.jobs.len())
            .finish()
    }
}
