// tests/integration/aggregate_test.rs

//! Integration tests for aggregate snapshots and the manual refresh fan-out.

use super::test_helpers::{TestContext, make_entry};
use std::sync::atomic::Ordering;
use std::time::Duration;

// ===== Snapshots =====

#[tokio::test]
async fn test_multi_cluster_snapshot_merges_in_order() {
    let ctx = TestContext::new().await;
    ctx.select(&["/a", "/b"]).await.unwrap();

    ctx.backend
        .behavior("a")
        .set_snapshot_entries(vec![make_entry("Deployment", "default", "web")]);
    ctx.backend
        .behavior("b")
        .set_snapshot_entries(vec![make_entry("Deployment", "default", "api")]);

    let snapshot = ctx
        .runtime
        .snapshots
        .build("workloads", "namespace:default")
        .await
        .unwrap();

    assert_eq!(snapshot.stats.total, 2);
    assert!(snapshot.stats.warnings.is_empty());
    // Configured cluster order is preserved, with per-cluster attribution.
    assert_eq!(snapshot.entries[0].cluster_id, "a");
    assert_eq!(snapshot.entries[0].name, "web");
    assert_eq!(snapshot.entries[1].cluster_id, "b");
    assert_eq!(snapshot.entries[1].name, "api");
}

#[tokio::test]
async fn test_partial_failure_yields_warning_not_error() {
    let ctx = TestContext::new().await;
    ctx.select(&["/a", "/b"]).await.unwrap();

    ctx.backend
        .behavior("a")
        .set_snapshot_entries(vec![make_entry("Deployment", "default", "web")]);
    ctx.backend.behavior("b").set_snapshot_error("boom");

    let snapshot = ctx
        .runtime
        .snapshots
        .build("workloads", "clusters=a,b|namespace:default")
        .await
        .unwrap();

    assert_eq!(snapshot.entries.len(), 1);
    assert_eq!(snapshot.entries[0].cluster_id, "a");
    assert_eq!(snapshot.stats.warnings.len(), 1);
    assert!(snapshot.stats.warnings[0].starts_with("Cluster b:"));
    assert!(snapshot.stats.warnings[0].contains("boom"));
}

#[tokio::test]
async fn test_all_clusters_failing_returns_first_error() {
    let ctx = TestContext::new().await;
    ctx.select(&["/a", "/b"]).await.unwrap();

    ctx.backend.behavior("a").set_snapshot_error("a down");
    ctx.backend.behavior("b").set_snapshot_error("b down");

    let result = ctx
        .runtime
        .snapshots
        .build("workloads", "clusters=a,b|cluster")
        .await;
    let err = result.unwrap_err();
    assert!(err.to_string().contains("a down"));
}

#[tokio::test]
async fn test_explicit_single_cluster_request_fails_fast() {
    let ctx = TestContext::new().await;
    ctx.select(&["/a", "/b"]).await.unwrap();

    ctx.backend.behavior("a").set_snapshot_error("a down");

    // One explicitly requested cluster: strict, no warning downgrade.
    let result = ctx
        .runtime
        .snapshots
        .build("workloads", "clusters=a|cluster")
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_explicit_list_requires_active_clusters() {
    let ctx = TestContext::new().await;
    ctx.select(&["/a"]).await.unwrap();

    let result = ctx
        .runtime
        .snapshots
        .build("workloads", "clusters=a,ghost|cluster")
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_single_cluster_domain_uses_primary() {
    let ctx = TestContext::new().await;
    ctx.select(&["/a", "/b"]).await.unwrap();

    ctx.backend
        .behavior("a")
        .set_snapshot_entries(vec![make_entry("Node", "default", "node-1")]);
    ctx.backend
        .behavior("b")
        .set_snapshot_entries(vec![make_entry("Node", "default", "node-2")]);

    let snapshot = ctx
        .runtime
        .snapshots
        .build("node-maintenance", "cluster")
        .await
        .unwrap();

    // Primary only: the first cluster in configured order.
    assert_eq!(snapshot.entries.len(), 1);
    assert_eq!(snapshot.entries[0].cluster_id, "a");
}

#[tokio::test]
async fn test_single_cluster_domain_rejects_multi_cluster_list() {
    let ctx = TestContext::new().await;
    ctx.select(&["/a", "/b"]).await.unwrap();

    let result = ctx
        .runtime
        .snapshots
        .build("catalog", "clusters=a,b|cluster")
        .await;
    assert!(result.is_err());
}

// ===== Manual refresh =====

/// Polls the aggregate status until it leaves queued/running.
async fn settle_status(
    ctx: &TestContext,
    id: &str,
    timeout: Duration,
) -> kubedeck::core::aggregate::AggregateRefreshStatus {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let status = ctx.runtime.refresh.status(id).unwrap();
        if status.state != "queued" && status.state != "running" {
            return status;
        }
        if tokio::time::Instant::now() >= deadline {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_manual_refresh_fans_out_and_succeeds() {
    let ctx = TestContext::new().await;
    ctx.select(&["/a", "/b"]).await.unwrap();

    let id = ctx
        .runtime
        .refresh
        .enqueue("workloads", "cluster", "user-requested")
        .unwrap();
    assert!(id.starts_with("job-agg-"));

    let status = settle_status(&ctx, &id, Duration::from_secs(2)).await;
    assert_eq!(status.state, "succeeded");
    assert_eq!(status.child_jobs.len(), 2);
    assert_eq!(ctx.backend.behavior("a").refreshes.load(Ordering::Relaxed), 1);
    assert_eq!(ctx.backend.behavior("b").refreshes.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_manual_refresh_failure_is_prefixed_with_cluster_id() {
    let ctx = TestContext::new().await;
    ctx.select(&["/a", "/b"]).await.unwrap();

    *ctx.backend.behavior("b").refresh_error.lock() = Some("relist failed".to_string());

    let id = ctx
        .runtime
        .refresh
        .enqueue("workloads", "cluster", "user-requested")
        .unwrap();

    let status = settle_status(&ctx, &id, Duration::from_secs(2)).await;
    assert_eq!(status.state, "failed");
    let error = status.error.expect("failed status carries the first error");
    assert!(error.starts_with("Cluster b:"));
    assert!(error.contains("relist failed"));
}

#[tokio::test]
async fn test_manual_refresh_child_lost_with_cluster_reports_cancelled() {
    let ctx = TestContext::new().await;
    ctx.select(&["/a", "/b"]).await.unwrap();

    // Slow the jobs down so the cluster disappears while they are pending.
    *ctx.backend.behavior("a").refresh_delay.lock() = Duration::from_millis(200);
    *ctx.backend.behavior("b").refresh_delay.lock() = Duration::from_millis(200);

    let id = ctx
        .runtime
        .refresh
        .enqueue("workloads", "cluster", "user-requested")
        .unwrap();

    ctx.select(&["/a"]).await.unwrap();

    let status = settle_status(&ctx, &id, Duration::from_secs(2)).await;
    assert_eq!(status.state, "cancelled");
}

#[tokio::test]
async fn test_manual_refresh_unknown_job_is_an_error() {
    let ctx = TestContext::new().await;
    ctx.select(&["/a"]).await.unwrap();
    assert!(ctx.runtime.refresh.status("job-agg-999").is_err());
}
