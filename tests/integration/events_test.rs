// tests/integration/events_test.rs

//! Integration tests for the aggregate event stream: fan-in ordering,
//! cluster attribution, scope filtering, and resume-buffer replay.

use super::test_helpers::{TestContext, make_event};
use kubedeck::core::aggregate::EventFrame;
use std::time::Duration;

/// Receives the next frame within a timeout.
async fn next_frame(
    rx: &mut tokio::sync::mpsc::Receiver<EventFrame>,
    timeout: Duration,
) -> Option<EventFrame> {
    tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
}

#[tokio::test]
async fn test_fresh_subscription_starts_with_reset_snapshot() {
    let ctx = TestContext::new().await;
    ctx.select(&["/a"]).await.unwrap();

    let subscription = ctx.runtime.events.subscribe("cluster", None).await.unwrap();

    assert_eq!(subscription.initial.len(), 1);
    let reset = &subscription.initial[0];
    assert!(reset.reset);
    assert_eq!(reset.sequence, 1);
    assert!(reset.snapshot.is_some());
    assert!(reset.events.is_empty());
}

#[tokio::test]
async fn test_events_from_both_clusters_arrive_with_attribution() {
    let ctx = TestContext::new().await;
    ctx.select(&["/a", "/b"]).await.unwrap();

    let mut subscription = ctx
        .runtime
        .events
        .subscribe("clusters=a,b|cluster", None)
        .await
        .unwrap();

    ctx.publish_event("a", make_event("first", None));
    // A short pause pins the arrival order across the two clusters.
    tokio::time::sleep(Duration::from_millis(20)).await;
    ctx.publish_event("b", make_event("second", None));

    let frame_one = next_frame(&mut subscription.rx, Duration::from_secs(1))
        .await
        .expect("first event frame");
    let frame_two = next_frame(&mut subscription.rx, Duration::from_secs(1))
        .await
        .expect("second event frame");

    assert_eq!(frame_one.events[0].cluster_id.as_deref(), Some("a"));
    assert_eq!(frame_one.events[0].name, "first");
    assert_eq!(frame_two.events[0].cluster_id.as_deref(), Some("b"));
    assert_eq!(frame_two.events[0].name, "second");
    assert!(frame_two.sequence > frame_one.sequence);
}

#[tokio::test]
async fn test_namespace_scope_filters_events() {
    let ctx = TestContext::new().await;
    ctx.select(&["/a"]).await.unwrap();

    let mut subscription = ctx
        .runtime
        .events
        .subscribe("namespace:default", None)
        .await
        .unwrap();

    ctx.publish_event("a", make_event("other-ns", Some("kube-system")));
    ctx.publish_event("a", make_event("in-ns", Some("default")));

    let frame = next_frame(&mut subscription.rx, Duration::from_secs(1))
        .await
        .expect("filtered event frame");
    assert_eq!(frame.events[0].name, "in-ns");
}

#[tokio::test]
async fn test_resume_replays_buffered_entries_without_snapshot() {
    let ctx = TestContext::new().await;
    ctx.select(&["/a"]).await.unwrap();

    let total_events = 6u64;
    let mut last_sequence = 0;
    {
        let mut subscription = ctx.runtime.events.subscribe("cluster", None).await.unwrap();
        for i in 0..total_events {
            ctx.publish_event("a", make_event(&format!("event-{i}"), None));
        }
        for _ in 0..total_events {
            let frame = next_frame(&mut subscription.rx, Duration::from_secs(1))
                .await
                .expect("live frame");
            last_sequence = frame.sequence;
        }
    }

    // Reconnect from the middle: everything after `since` replays in order,
    // with no duplicates and no snapshot.
    let since = last_sequence - 3;
    let resumed = ctx
        .runtime
        .events
        .subscribe("cluster", Some(since))
        .await
        .unwrap();

    let sequences: Vec<u64> = resumed.initial.iter().map(|f| f.sequence).collect();
    assert_eq!(sequences, vec![since + 1, since + 2, since + 3]);
    assert!(resumed.initial.iter().all(|f| !f.reset));
    assert!(resumed.initial.iter().all(|f| f.snapshot.is_none()));
}

#[tokio::test]
async fn test_resume_outside_buffer_falls_back_to_reset() {
    let mut config = TestContext::fast_config();
    config.streams.event_resume_buffer = 2;
    let ctx = TestContext::with_config(config).await;
    ctx.select(&["/a"]).await.unwrap();

    {
        let mut subscription = ctx.runtime.events.subscribe("cluster", None).await.unwrap();
        for i in 0..5 {
            ctx.publish_event("a", make_event(&format!("event-{i}"), None));
        }
        for _ in 0..5 {
            next_frame(&mut subscription.rx, Duration::from_secs(1))
                .await
                .expect("live frame");
        }
    }

    // Sequence 1 left the two-entry ring long ago: a reset is required.
    let resumed = ctx.runtime.events.subscribe("cluster", Some(1)).await.unwrap();
    assert_eq!(resumed.initial.len(), 1);
    assert!(resumed.initial[0].reset);
    assert!(resumed.initial[0].snapshot.is_some());
}

#[tokio::test]
async fn test_dropped_scope_buffer_forces_reset() {
    let ctx = TestContext::new().await;
    ctx.select(&["/a"]).await.unwrap();

    {
        let mut subscription = ctx.runtime.events.subscribe("cluster", None).await.unwrap();
        ctx.publish_event("a", make_event("one", None));
        next_frame(&mut subscription.rx, Duration::from_secs(1))
            .await
            .expect("live frame");
    }

    ctx.runtime.events.drop_scope_buffer("cluster");

    let resumed = ctx.runtime.events.subscribe("cluster", Some(1)).await.unwrap();
    assert_eq!(resumed.initial.len(), 1);
    assert!(resumed.initial[0].reset);
}

#[tokio::test]
async fn test_subscribe_on_unknown_cluster_fails() {
    let ctx = TestContext::new().await;
    ctx.select(&["/a"]).await.unwrap();

    let result = ctx
        .runtime
        .events
        .subscribe("clusters=ghost|cluster", None)
        .await;
    assert!(result.is_err());
}
