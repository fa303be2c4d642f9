//! Property-Based Tests for retry bounds

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use archivum_repl::ReconError;
use archivum_transport::{RetryExecutor, RetryPolicy};
use proptest::prelude::*;

fn executor(attempts: u32) -> RetryExecutor {
    RetryExecutor::new(RetryPolicy::new(attempts, Duration::ZERO, Duration::ZERO).with_jitter(false))
}

/// Run an always-failing operation and report (calls, error).
fn failing_run(retry: &RetryExecutor, retry_error: Option<bool>) -> (u32, Result<(), ReconError>) {
    let calls = Arc::new(AtomicU32::new(0));
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let counter = calls.clone();
    let op = move || {
        let counter = counter.clone();
        async move {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            Err::<(), _>(ReconError::transient(format!("call {}", n)))
        }
    };
    let result = rt.block_on(async {
        match retry_error {
            None => retry.exec(op).await,
            Some(accept) => retry.exec_with(move |_: &ReconError| accept, op).await,
        }
    });
    (calls.load(Ordering::SeqCst), result)
}

proptest! {
    #[test]
    fn prop_always_failing_runs_exactly_max_attempts(attempts in 1u32..8) {
        let (calls, result) = failing_run(&executor(attempts), None);
        prop_assert_eq!(calls, attempts);
        let message = result.unwrap_err().to_string();
        let expected = format!("call {}", attempts);
        let names_last_call = message.contains(&expected);
        prop_assert!(names_last_call, "{:?} does not name {:?}", message, expected);
    }

    #[test]
    fn prop_refusing_predicate_runs_once(attempts in 1u32..8) {
        let (calls, result) = failing_run(&executor(attempts), Some(false));
        prop_assert_eq!(calls, 1);
        let transient = matches!(result, Err(ReconError::TransientIo { .. }));
        prop_assert!(transient, "expected a transient error, got {:?}", result);
    }

    #[test]
    fn prop_accepting_predicate_uses_whole_budget(attempts in 1u32..8) {
        let (calls, _) = failing_run(&executor(attempts), Some(true));
        prop_assert_eq!(calls, attempts);
    }

    #[test]
    fn prop_result_retry_stops_on_final_value(attempts in 1u32..8, ready_at in 1u32..10) {
        let retry = executor(attempts);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let last = rt.block_on(retry.exec_until(
            |n: &u32| *n < ready_at,
            move || {
                let counter = counter.clone();
                async move { counter.fetch_add(1, Ordering::SeqCst) + 1 }
            },
        ));
        prop_assert_eq!(last, ready_at.min(attempts));
        prop_assert_eq!(calls.load(Ordering::SeqCst), ready_at.min(attempts));
    }
}
