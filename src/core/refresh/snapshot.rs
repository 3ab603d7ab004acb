// src/core/refresh/snapshot.rs

//! Snapshot types and the per-cluster snapshot provider seam.

use crate::core::errors::KubedeckError;
use crate::core::scope::ScopeSelector;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Aggregate statistics attached to a snapshot, including partial-failure
/// warnings from multi-cluster merges.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotStats {
    pub total: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// One entry of a domain snapshot, always attributed to its cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEntry {
    #[serde(rename = "clusterId")]
    pub cluster_id: String,
    #[serde(rename = "clusterName")]
    pub cluster_name: String,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
}

/// A consistent point-in-time read of one domain, possibly merged across
/// clusters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainSnapshot {
    pub domain: String,
    pub scope: String,
    #[serde(rename = "generatedAt")]
    pub generated_at: i64,
    pub entries: Vec<SnapshotEntry>,
    pub stats: SnapshotStats,
}

impl DomainSnapshot {
    pub fn empty(domain: &str, scope: &str) -> Self {
        Self {
            domain: domain.to_string(),
            scope: scope.to_string(),
            generated_at: chrono::Utc::now().timestamp_millis(),
            entries: Vec::new(),
            stats: SnapshotStats::default(),
        }
    }
}

/// Builds domain snapshots for one cluster.
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    async fn build(
        &self,
        domain: &str,
        selector: &ScopeSelector,
    ) -> Result<DomainSnapshot, KubedeckError>;
}
