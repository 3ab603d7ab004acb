// tests/integration/heartbeat_test.rs

//! Integration tests for the heartbeat loop: outcome classification, auth
//! gating, and the auth recovery round-trip.

use super::test_helpers::{TestContext, wait_for_ui_event};
use kubedeck::core::auth::AuthState;
use kubedeck::core::errors::KubedeckError;
use std::sync::atomic::Ordering;
use std::time::Duration;

#[tokio::test]
async fn test_healthy_probe_emits_healthy_event() {
    let ctx = TestContext::new().await;
    ctx.select(&["/c:ctx-c"]).await.unwrap();

    let mut ui_rx = ctx.runtime.ui_bus.subscribe();
    ctx.heartbeat().probe_all().await;

    let event = wait_for_ui_event(&mut ui_rx, "cluster:health:healthy", Duration::from_secs(1))
        .await
        .expect("healthy event must be emitted");
    assert_eq!(event.payload["clusterId"], "c:ctx-c");
}

#[tokio::test]
async fn test_connectivity_failure_never_touches_auth_manager() {
    let ctx = TestContext::new().await;
    ctx.select(&["/c:ctx-c"]).await.unwrap();

    let behavior = ctx.backend.behavior("c:ctx-c");
    behavior.push_ready(Err(KubedeckError::Timeout("no route to host".to_string())));

    let mut ui_rx = ctx.runtime.ui_bus.subscribe();
    ctx.heartbeat().probe_all().await;

    let event = wait_for_ui_event(
        &mut ui_rx,
        "cluster:health:degraded",
        Duration::from_secs(1),
    )
    .await
    .expect("degraded event must be emitted");
    assert_eq!(event.payload["reason"], "connectivity");

    let bundle = ctx.runtime.lifecycle.cluster_clients("c:ctx-c").unwrap();
    assert_eq!(bundle.auth.state().0, AuthState::Valid);
}

#[tokio::test]
async fn test_auth_invalid_cluster_is_skipped_entirely() {
    let mut config = TestContext::fast_config();
    config.auth.max_attempts = 0;
    let ctx = TestContext::with_config(config).await;
    ctx.select(&["/c:ctx-c"]).await.unwrap();

    let behavior = ctx.backend.behavior("c:ctx-c");
    let bundle = ctx.runtime.lifecycle.cluster_clients("c:ctx-c").unwrap();
    bundle.auth.report_failure("expired token");
    assert_eq!(bundle.auth.state().0, AuthState::Invalid);

    let probes_before = behavior.ready_probes.load(Ordering::Relaxed);
    ctx.heartbeat().probe_all().await;

    // No request was issued: auth recovery owns the cluster.
    assert_eq!(behavior.ready_probes.load(Ordering::Relaxed), probes_before);
}

#[tokio::test]
async fn test_recovering_cluster_is_skipped() {
    let ctx = TestContext::new().await;
    ctx.select(&["/c:ctx-c"]).await.unwrap();

    let behavior = ctx.backend.behavior("c:ctx-c");
    // Keep the auth probe failing so the manager stays in recovery while the
    // heartbeat sweep below runs.
    for _ in 0..4 {
        behavior.push_probe(Err(KubedeckError::AuthFailure("still broken".to_string())));
    }
    let bundle = ctx.runtime.lifecycle.cluster_clients("c:ctx-c").unwrap();
    bundle.auth.report_failure("expired token");
    assert_eq!(bundle.auth.state().0, AuthState::Recovering);

    let probes_before = behavior.ready_probes.load(Ordering::Relaxed);
    ctx.heartbeat().probe_all().await;
    assert_eq!(behavior.ready_probes.load(Ordering::Relaxed), probes_before);
}

#[tokio::test]
async fn test_auth_failure_roundtrip_recovers() {
    let ctx = TestContext::new().await;
    ctx.select(&["/c:ctx-c"]).await.unwrap();

    let behavior = ctx.backend.behavior("c:ctx-c");
    behavior.push_ready(Err(KubedeckError::ApiStatus {
        code: 403,
        message: "forbidden".to_string(),
    }));

    let mut ui_rx = ctx.runtime.ui_bus.subscribe();
    ctx.heartbeat().probe_all().await;

    // Health degrades with reason=auth before recovery starts.
    let degraded = wait_for_ui_event(
        &mut ui_rx,
        "cluster:health:degraded",
        Duration::from_secs(1),
    )
    .await
    .expect("degraded event must be emitted");
    assert_eq!(degraded.payload["reason"], "auth");

    wait_for_ui_event(&mut ui_rx, "cluster:auth:recovering", Duration::from_secs(1))
        .await
        .expect("recovering event must be emitted");

    // The default auth probe succeeds, so recovery completes after backoff.
    wait_for_ui_event(&mut ui_rx, "cluster:auth:recovered", Duration::from_secs(2))
        .await
        .expect("recovered event must be emitted");

    let bundle = ctx.runtime.lifecycle.cluster_clients("c:ctx-c").unwrap();
    assert_eq!(bundle.auth.state().0, AuthState::Valid);

    // The next sweep reports the cluster healthy again.
    ctx.heartbeat().probe_all().await;
    wait_for_ui_event(&mut ui_rx, "cluster:health:healthy", Duration::from_secs(1))
        .await
        .expect("healthy event must be emitted after recovery");
}

#[tokio::test]
async fn test_exec_credential_pattern_classifies_as_auth() {
    let ctx = TestContext::new().await;
    ctx.select(&["/c:ctx-c"]).await.unwrap();

    let behavior = ctx.backend.behavior("c:ctx-c");
    behavior.push_ready(Err(KubedeckError::TransportFailure(
        "getting credentials: exec: executable gke-gcloud-auth-plugin failed with exit code 1"
            .to_string(),
    )));

    let mut ui_rx = ctx.runtime.ui_bus.subscribe();
    ctx.heartbeat().probe_all().await;

    let degraded = wait_for_ui_event(
        &mut ui_rx,
        "cluster:health:degraded",
        Duration::from_secs(1),
    )
    .await
    .expect("degraded event must be emitted");
    assert_eq!(degraded.payload["reason"], "auth");
}
