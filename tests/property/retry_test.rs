// tests/property/retry_test.rs

//! Property-based tests for fetch retry accounting.

use kubedeck::config::FetchConfig;
use kubedeck::core::cache::ResponseCache;
use kubedeck::core::errors::KubedeckError;
use kubedeck::core::events::UiEventBus;
use kubedeck::core::fetch::FetchCoordinator;
use proptest::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

fn coordinator(max_attempts: u32) -> FetchCoordinator {
    let cache = Arc::new(ResponseCache::new(Duration::from_secs(60), 64));
    let cfg = FetchConfig {
        max_attempts,
        retry_delay_ms: 1,
    };
    FetchCoordinator::new(cache, Arc::new(UiEventBus::new()), &cfg)
        .with_retry_sleep(|_| Box::pin(async {}))
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 50,
        max_shrink_iters: 100,
        ..ProptestConfig::default()
    })]

    /// For a transient-then-success sequence of length k within the attempt
    /// budget: retry_attempts advances by k-1, retry_successes by 1, and
    /// retry_exhausted stays 0.
    #[test]
    fn prop_transient_then_success_accounting(k in 2u32..=5) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let fetcher = coordinator(5);
            let calls = Arc::new(AtomicU32::new(0));

            let calls_clone = calls.clone();
            let result: u32 = fetcher
                .fetch_resource("c", "", "Pod", "default/p", move || {
                    let calls = calls_clone.clone();
                    async move {
                        if calls.fetch_add(1, Ordering::SeqCst) + 1 < k {
                            Err(KubedeckError::TransportFailure("flaky".to_string()))
                        } else {
                            Ok(k)
                        }
                    }
                })
                .await
                .unwrap();

            assert_eq!(result, k);
            assert_eq!(calls.load(Ordering::SeqCst), k);
            assert_eq!(fetcher.stats.retry_attempts(), u64::from(k - 1));
            assert_eq!(fetcher.stats.retry_successes(), 1);
            assert_eq!(fetcher.stats.retry_exhausted(), 0);
        });
    }

    /// Persistent transient failures exhaust the budget: exactly
    /// max_attempts calls, max_attempts-1 retries, one exhaustion.
    #[test]
    fn prop_persistent_transient_failure_exhausts(max_attempts in 1u32..=5) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let fetcher = coordinator(max_attempts);
            let calls = Arc::new(AtomicU32::new(0));

            let calls_clone = calls.clone();
            let result: Result<u32, _> = fetcher
                .fetch_resource("c", "", "Pod", "default/p", move || {
                    let calls = calls_clone.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err(KubedeckError::Timeout("deadline exceeded".to_string()))
                    }
                })
                .await;

            assert!(result.is_err());
            assert_eq!(calls.load(Ordering::SeqCst), max_attempts);
            assert_eq!(fetcher.stats.retry_attempts(), u64::from(max_attempts - 1));
            assert_eq!(fetcher.stats.retry_successes(), 0);
            assert_eq!(fetcher.stats.retry_exhausted(), 1);
        });
    }
}
