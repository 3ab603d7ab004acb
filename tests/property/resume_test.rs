// tests/property/resume_test.rs

//! Property-based tests for event stream resumability: any reconnect from a
//! still-buffered sequence replays exactly the entries after it, in order,
//! with no duplicates and no snapshot.

use crate::test_helpers::{TestContext, make_event};
use proptest::prelude::*;
use std::time::Duration;

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 10, // Each case spins up a full runtime.
        max_shrink_iters: 20,
        ..ProptestConfig::default()
    })]

    #[test]
    fn prop_resume_replays_exactly_the_tail(
        total in 1u64..8,
        resume_offset in 0u64..8,
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async move {
            let ctx = TestContext::new().await;
            ctx.select(&["/a"]).await.unwrap();

            // Sequence 1 is the initial reset; events take 2..=total+1.
            let last_sequence = {
                let mut subscription =
                    ctx.runtime.events.subscribe("cluster", None).await.unwrap();
                assert_eq!(subscription.initial[0].sequence, 1);

                for i in 0..total {
                    ctx.publish_event("a", make_event(&format!("e{i}"), None));
                }
                let mut last = 1;
                for _ in 0..total {
                    let frame = tokio::time::timeout(
                        Duration::from_secs(1),
                        subscription.rx.recv(),
                    )
                    .await
                    .expect("frame within timeout")
                    .expect("stream stays open");
                    assert_eq!(frame.sequence, last + 1);
                    last = frame.sequence;
                }
                last
            };

            // Resume from any still-buffered point at or after the oldest.
            let since = (resume_offset % last_sequence) + 1;
            let resumed = ctx
                .runtime
                .events
                .subscribe("cluster", Some(since))
                .await
                .unwrap();

            let sequences: Vec<u64> =
                resumed.initial.iter().map(|f| f.sequence).collect();
            let expected: Vec<u64> = (since + 1..=last_sequence).collect();
            assert_eq!(sequences, expected);
            assert!(resumed.initial.iter().all(|f| f.snapshot.is_none()));
        });
    }
}
