// tests/integration/lifecycle_test.rs

//! Integration tests for the lifecycle manager: selection diffs, auth-failed
//! skip behavior, single-cluster rebuild, and cross-cluster isolation.

use super::test_helpers::{TestContext, wait_until};
use kubedeck::core::auth::AuthState;
use std::sync::atomic::Ordering;
use std::time::Duration;

// ===== Selection add/remove =====

#[tokio::test]
async fn test_select_two_clusters_builds_both() {
    let ctx = TestContext::new().await;

    ctx.select(&["/a:ctx-a", "/b:ctx-b"]).await.unwrap();

    assert_eq!(ctx.active_ids(), vec!["a:ctx-a", "b:ctx-b"]);
    assert!(ctx.runtime.lifecycle.cluster_clients("a:ctx-a").is_some());
    assert!(ctx.runtime.lifecycle.cluster_clients("b:ctx-b").is_some());
}

#[tokio::test]
async fn test_remove_cluster_stops_exactly_one_subsystem() {
    let ctx = TestContext::new().await;

    ctx.select(&["/a:ctx-a", "/b:ctx-b"]).await.unwrap();
    let removed = ctx
        .runtime
        .lifecycle
        .subsystem("a:ctx-a")
        .expect("a must be live before removal");

    ctx.select(&["/b:ctx-b"]).await.unwrap();

    // Exactly one subsystem remains, keyed by the surviving cluster.
    assert_eq!(ctx.active_ids(), vec!["b:ctx-b"]);
    assert!(ctx.runtime.lifecycle.cluster_clients("a:ctx-a").is_none());

    // The removed cluster's machinery is stopped promptly.
    assert!(removed.is_shut_down());
    let survivor = ctx.runtime.lifecycle.subsystem("b:ctx-b").unwrap();
    assert!(!survivor.is_shut_down());
}

#[tokio::test]
async fn test_reorder_keeps_existing_subsystems() {
    let ctx = TestContext::new().await;

    ctx.select(&["/a:ctx-a", "/b:ctx-b"]).await.unwrap();
    let a_before = ctx.runtime.lifecycle.subsystem("a:ctx-a").unwrap();

    ctx.select(&["/b:ctx-b", "/a:ctx-a"]).await.unwrap();

    assert_eq!(ctx.active_ids(), vec!["b:ctx-b", "a:ctx-a"]);
    let a_after = ctx.runtime.lifecycle.subsystem("a:ctx-a").unwrap();
    assert!(std::sync::Arc::ptr_eq(&a_before, &a_after));
}

// ===== Cross-cluster isolation =====

#[tokio::test]
async fn test_build_failure_in_one_cluster_never_blocks_another() {
    let ctx = TestContext::new().await;
    ctx.backend
        .behavior("a:ctx-a")
        .fail_build
        .store(true, Ordering::Relaxed);

    ctx.select(&["/a:ctx-a", "/b:ctx-b"]).await.unwrap();

    // The failing cluster stays listed without a subsystem; the healthy one
    // gets exactly one subsystem.
    assert_eq!(ctx.active_ids(), vec!["b:ctx-b"]);
    let degraded = ctx.runtime.lifecycle.cluster_clients("a:ctx-a").unwrap();
    assert!(degraded.auth_failed_on_init());
    assert_eq!(
        ctx.runtime.lifecycle.cluster_order(),
        vec!["a:ctx-a", "b:ctx-b"]
    );
}

#[tokio::test]
async fn test_preflight_failure_skips_subsystem_but_keeps_order() {
    let ctx = TestContext::new().await;
    ctx.backend
        .behavior("a:ctx-a")
        .fail_preflight
        .store(true, Ordering::Relaxed);

    ctx.select(&["/a:ctx-a", "/b:ctx-b"]).await.unwrap();

    assert_eq!(ctx.active_ids(), vec!["b:ctx-b"]);
    let degraded = ctx.runtime.lifecycle.cluster_clients("a:ctx-a").unwrap();
    assert!(degraded.auth_failed_on_init());
    assert_eq!(
        ctx.runtime.lifecycle.cluster_order(),
        vec!["a:ctx-a", "b:ctx-b"]
    );
}

#[tokio::test]
async fn test_invalid_auth_in_one_cluster_never_blocks_another() {
    let mut config = TestContext::fast_config();
    config.auth.max_attempts = 0; // any failure is immediately terminal
    let ctx = TestContext::with_config(config).await;

    ctx.select(&["/a:ctx-a"]).await.unwrap();
    let bundle = ctx.runtime.lifecycle.cluster_clients("a:ctx-a").unwrap();
    bundle.auth.report_failure("credentials expired");
    assert_eq!(bundle.auth.state().0, AuthState::Invalid);

    // The invalid cluster's subsystem comes down via a coordinated teardown.
    assert!(wait_until(Duration::from_secs(2), || ctx.active_ids().is_empty()).await);

    // Re-selecting with a healthy second cluster succeeds and yields exactly
    // one subsystem for it, none for the invalid one.
    ctx.select(&["/a:ctx-a", "/b:ctx-b"]).await.unwrap();
    assert_eq!(ctx.active_ids(), vec!["b:ctx-b"]);
}

#[tokio::test]
async fn test_subsystem_build_failure_is_isolated() {
    let ctx = TestContext::new().await;
    ctx.backend
        .behavior("a:ctx-a")
        .fail_subsystem
        .store(true, Ordering::Relaxed);

    ctx.select(&["/a:ctx-a", "/b:ctx-b"]).await.unwrap();
    assert_eq!(ctx.active_ids(), vec!["b:ctx-b"]);
}

// ===== Rebuild =====

#[tokio::test]
async fn test_rebuild_preserves_auth_manager_identity() {
    let ctx = TestContext::new().await;
    ctx.select(&["/a:ctx-a"]).await.unwrap();

    let before = ctx.runtime.lifecycle.cluster_clients("a:ctx-a").unwrap();
    let auth_before = before.auth.clone();

    ctx.runtime.rebuild_cluster("a:ctx-a").await.unwrap();

    let after = ctx.runtime.lifecycle.cluster_clients("a:ctx-a").unwrap();
    assert!(std::sync::Arc::ptr_eq(&auth_before, &after.auth));
    assert!(!after.auth_failed_on_init());
    assert_eq!(ctx.active_ids(), vec!["a:ctx-a"]);
}

#[tokio::test]
async fn test_rebuild_clears_auth_failed_on_init() {
    let ctx = TestContext::new().await;
    let behavior = ctx.backend.behavior("a:ctx-a");
    behavior.fail_preflight.store(true, Ordering::Relaxed);

    ctx.select(&["/a:ctx-a"]).await.unwrap();
    assert!(ctx.active_ids().is_empty());

    // Credentials fixed; the rebuild picks them up and builds the subsystem.
    behavior.fail_preflight.store(false, Ordering::Relaxed);
    ctx.runtime.rebuild_cluster("a:ctx-a").await.unwrap();

    let bundle = ctx.runtime.lifecycle.cluster_clients("a:ctx-a").unwrap();
    assert!(!bundle.auth_failed_on_init());
    assert_eq!(ctx.active_ids(), vec!["a:ctx-a"]);
}

#[tokio::test]
async fn test_rebuild_opens_facade_gate_when_never_started() {
    let ctx = TestContext::new().await;
    let behavior = ctx.backend.behavior("a:ctx-a");
    behavior.fail_preflight.store(true, Ordering::Relaxed);

    // All clusters auth-failed at startup: the facade gate stays closed.
    ctx.select(&["/a:ctx-a"]).await.unwrap();
    assert!(!ctx.runtime.lifecycle.facade_started());

    behavior.fail_preflight.store(false, Ordering::Relaxed);
    ctx.runtime.rebuild_cluster("a:ctx-a").await.unwrap();
    assert!(ctx.runtime.lifecycle.facade_started());
}

// ===== Teardown =====

#[tokio::test]
async fn test_teardown_affects_only_the_target_cluster() {
    let ctx = TestContext::new().await;
    ctx.select(&["/a:ctx-a", "/b:ctx-b"]).await.unwrap();

    ctx.runtime.teardown_cluster("a:ctx-a").await.unwrap();

    assert_eq!(ctx.active_ids(), vec!["b:ctx-b"]);
    // The client bundle stays: the cluster is still listed.
    assert!(ctx.runtime.lifecycle.cluster_clients("a:ctx-a").is_some());
}

#[tokio::test]
async fn test_teardown_stops_catalog_and_revalidation() {
    let ctx = TestContext::new().await;
    ctx.select(&["/a:ctx-a"]).await.unwrap();

    let subsystem = ctx.runtime.lifecycle.subsystem("a:ctx-a").unwrap();
    let revalidation = subsystem.revalidation_token();
    assert!(subsystem.catalog.is_running());

    ctx.runtime.teardown_cluster("a:ctx-a").await.unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(revalidation.is_cancelled());
    assert!(!subsystem.catalog.is_running());
}
