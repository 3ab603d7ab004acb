// tests/integration/stream_test.rs

//! Integration tests for the multiplexed resource stream core.

use super::test_helpers::TestContext;
use kubedeck::core::aggregate::StreamRequest;
use kubedeck::core::aggregate::stream::SocketSubscriptions;
use kubedeck::core::refresh::{ResourceDelta, ResourceFrame};
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;

async fn next_frame(
    rx: &mut mpsc::Receiver<ResourceFrame>,
    timeout: Duration,
) -> Option<ResourceFrame> {
    tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
}

fn subscribe_request(id: &str, clusters: &[&str], kind: &str) -> StreamRequest {
    StreamRequest::Subscribe {
        id: id.to_string(),
        clusters: clusters.iter().map(|c| c.to_string()).collect(),
        kind: kind.to_string(),
        namespace: None,
    }
}

#[tokio::test]
async fn test_subscription_starts_with_reset_frames_per_cluster() {
    let ctx = TestContext::new().await;
    ctx.select(&["/a", "/b"]).await.unwrap();

    *ctx.backend.behavior("a").stream_items.lock() = vec![json!({"name": "pod-a"})];
    *ctx.backend.behavior("b").stream_items.lock() = vec![json!({"name": "pod-b"})];

    let (tx, mut rx) = mpsc::channel(32);
    let mut subscriptions = SocketSubscriptions::default();
    ctx.runtime
        .resources
        .handle_request(subscribe_request("sub-1", &[], "Pod"), tx, &mut subscriptions)
        .await;

    let mut reset_clusters = Vec::new();
    for _ in 0..2 {
        match next_frame(&mut rx, Duration::from_secs(1)).await {
            Some(ResourceFrame::Reset {
                subscription_id,
                cluster_id,
                kind,
                items,
            }) => {
                assert_eq!(subscription_id, "sub-1");
                assert_eq!(kind, "Pod");
                assert_eq!(items.len(), 1);
                reset_clusters.push(cluster_id);
            }
            other => panic!("expected reset frame, got {other:?}"),
        }
    }
    reset_clusters.sort();
    assert_eq!(reset_clusters, vec!["a", "b"]);
}

#[tokio::test]
async fn test_deltas_flow_after_the_reset() {
    let ctx = TestContext::new().await;
    ctx.select(&["/a"]).await.unwrap();

    let (tx, mut rx) = mpsc::channel(32);
    let mut subscriptions = SocketSubscriptions::default();
    ctx.runtime
        .resources
        .handle_request(
            subscribe_request("sub-1", &["a"], "Pod"),
            tx,
            &mut subscriptions,
        )
        .await;

    // Consume the reset frame first.
    assert!(matches!(
        next_frame(&mut rx, Duration::from_secs(1)).await,
        Some(ResourceFrame::Reset { .. })
    ));

    ctx.backend
        .adapter("a")
        .expect("adapter exists once the subsystem is live")
        .publish(ResourceDelta {
            kind: "Pod".to_string(),
            namespace: Some("default".to_string()),
            event_type: "added".to_string(),
            item: json!({"name": "pod-new"}),
        });

    match next_frame(&mut rx, Duration::from_secs(1)).await {
        Some(ResourceFrame::Delta {
            cluster_id,
            kind,
            event_type,
            item,
            ..
        }) => {
            assert_eq!(cluster_id, "a");
            assert_eq!(kind, "Pod");
            assert_eq!(event_type, "added");
            assert_eq!(item["name"], "pod-new");
        }
        other => panic!("expected delta frame, got {other:?}"),
    }
}

#[tokio::test]
async fn test_unsubscribe_stops_the_delta_flow() {
    let ctx = TestContext::new().await;
    ctx.select(&["/a"]).await.unwrap();

    let (tx, mut rx) = mpsc::channel(32);
    let mut subscriptions = SocketSubscriptions::default();
    ctx.runtime
        .resources
        .handle_request(
            subscribe_request("sub-1", &["a"], "Pod"),
            tx.clone(),
            &mut subscriptions,
        )
        .await;
    assert!(matches!(
        next_frame(&mut rx, Duration::from_secs(1)).await,
        Some(ResourceFrame::Reset { .. })
    ));

    ctx.runtime
        .resources
        .handle_request(
            StreamRequest::Unsubscribe {
                id: "sub-1".to_string(),
            },
            tx,
            &mut subscriptions,
        )
        .await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let adapter = ctx.backend.adapter("a").unwrap();
    adapter.publish(ResourceDelta {
        kind: "Pod".to_string(),
        namespace: None,
        event_type: "added".to_string(),
        item: json!({"name": "late"}),
    });

    assert!(next_frame(&mut rx, Duration::from_millis(100)).await.is_none());
}

#[tokio::test]
async fn test_unknown_cluster_subscription_yields_error_frame() {
    let ctx = TestContext::new().await;
    ctx.select(&["/a"]).await.unwrap();

    let (tx, mut rx) = mpsc::channel(32);
    let mut subscriptions = SocketSubscriptions::default();
    ctx.runtime
        .resources
        .handle_request(
            subscribe_request("sub-1", &["ghost"], "Pod"),
            tx,
            &mut subscriptions,
        )
        .await;

    match next_frame(&mut rx, Duration::from_secs(1)).await {
        Some(ResourceFrame::Error {
            subscription_id, ..
        }) => assert_eq!(subscription_id, "sub-1"),
        other => panic!("expected error frame, got {other:?}"),
    }
}
