// src/core/aggregate/snapshot.rs

//! The aggregate snapshot service: fans one domain read out across the
//! target clusters and merges the results with partial-failure semantics.

use crate::core::errors::KubedeckError;
use crate::core::lifecycle::LifecycleManager;
use crate::core::refresh::{DomainSnapshot, RefreshSubsystem, SnapshotStats};
use crate::core::scope::{Scope, domain_requires_single_cluster};
use std::sync::Arc;
use tracing::debug;

/// Builds merged snapshots across clusters.
pub struct AggregateSnapshotService {
    lifecycle: Arc<LifecycleManager>,
}

impl AggregateSnapshotService {
    pub fn new(lifecycle: Arc<LifecycleManager>) -> Self {
        Self { lifecycle }
    }

    /// Resolves the target subsystems for a parsed scope.
    ///
    /// An explicit cluster list requires every named cluster to be active.
    /// Without a list, single-cluster domains use the primary and everything
    /// else targets all clusters in configured order.
    pub fn resolve_targets(
        &self,
        domain: &str,
        scope: &Scope,
    ) -> Result<Vec<Arc<RefreshSubsystem>>, KubedeckError> {
        if !scope.clusters.is_empty() {
            if domain_requires_single_cluster(domain) && scope.clusters.len() > 1 {
                return Err(KubedeckError::InvalidScope(format!(
                    "domain '{domain}' addresses a single cluster, got {}",
                    scope.clusters.len()
                )));
            }
            let mut targets = Vec::with_capacity(scope.clusters.len());
            for id in &scope.clusters {
                let subsystem = self
                    .lifecycle
                    .subsystem(id)
                    .ok_or_else(|| KubedeckError::ClusterUnavailable(id.clone()))?;
                targets.push(subsystem);
            }
            return Ok(targets);
        }

        let targets = if domain_requires_single_cluster(domain) {
            self.lifecycle.primary_subsystem().into_iter().collect()
        } else {
            self.lifecycle.subsystems_in_order()
        };
        if targets.is_empty() {
            return Err(KubedeckError::ClusterUnavailable(
                "no active clusters".to_string(),
            ));
        }
        Ok(targets)
    }

    /// Builds a snapshot of `domain` for `raw_scope`.
    ///
    /// Multi-cluster runs tolerate partial failure: a failing cluster
    /// contributes a `"Cluster <id>: <err>"` warning and is skipped; only
    /// all-fail returns an error (the first one). A single-cluster run fails
    /// fast.
    pub async fn build(
        &self,
        domain: &str,
        raw_scope: &str,
    ) -> Result<DomainSnapshot, KubedeckError> {
        let scope = Scope::parse(raw_scope)?;
        let targets = self.resolve_targets(domain, &scope)?;

        if targets.len() == 1 {
            let target = &targets[0];
            let mut snapshot = target.snapshots.build(domain, &scope.selector).await?;
            snapshot.scope = raw_scope.to_string();
            return Ok(snapshot);
        }

        let reads = targets
            .iter()
            .map(|t| t.snapshots.build(domain, &scope.selector));
        let results = futures::future::join_all(reads).await;

        let mut merged = DomainSnapshot::empty(domain, raw_scope);
        let mut warnings = Vec::new();
        let mut first_error: Option<KubedeckError> = None;
        let mut successes = 0usize;

        for (target, result) in targets.iter().zip(results) {
            match result {
                Ok(snapshot) => {
                    successes += 1;
                    warnings.extend(snapshot.stats.warnings);
                    merged.entries.extend(snapshot.entries);
                }
                Err(e) => {
                    debug!(
                        "Cluster '{}' failed snapshot build for domain '{}': {}",
                        target.meta.id, domain, e
                    );
                    warnings.push(format!("Cluster {}: {e}", target.meta.id));
                    first_error.get_or_insert(e);
                }
            }
        }

        if successes == 0
            && let Some(e) = first_error
        {
            return Err(e);
        }

        merged.stats = SnapshotStats {
            total: merged.entries.len(),
            warnings,
        };
        Ok(merged)
    }
}

impl std::fmt::Debug for AggregateSnapshotService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateSnapshotService").finish()
    }
}
