//! End-to-end retry orchestrator scenarios.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use vectorforge_core::error::Error;
use vectorforge_core::progress::{OperationKind, ProgressTracker};
use vectorforge_core::retry::{RetryOrchestrator, RetryPolicy, RetryStrategy};

fn exponential_policy() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_secs(60),
        strategy: RetryStrategy::Exponential,
        jitter: 0.0,
        global_timeout: None,
    }
}

#[tokio::test]
async fn exponential_retry_exhaustion_invokes_callback_once() {
    let callbacks = Arc::new(AtomicU32::new(0));
    let callbacks_clone = Arc::clone(&callbacks);
    let orchestrator = RetryOrchestrator::new(exponential_policy()).with_failure_callback(
        Box::new(move |_: &String, _| {
            callbacks_clone.fetch_add(1, Ordering::SeqCst);
        }),
    );

    let outcome: vectorforge_core::retry::RetryOutcome<String, ()> = orchestrator
        .process(vec!["doc-1".to_string()], |_| async {
            Err(Error::Batch("store rejected".into()))
        })
        .await;

    assert!(outcome.results.is_empty());
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].attempts, 3);
    assert_eq!(outcome.summary.failed_retries, 3);
    assert_eq!(callbacks.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.summary.error_types["batch"], 3);
}

#[tokio::test]
async fn delay_sequence_matches_strategy() {
    let orchestrator: RetryOrchestrator<u32> = RetryOrchestrator::new(RetryPolicy {
        max_retries: 3,
        initial_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(60),
        strategy: RetryStrategy::Exponential,
        jitter: 0.0,
        global_timeout: None,
    });
    assert_eq!(orchestrator.compute_delay(0), Duration::from_secs(1));
    assert_eq!(orchestrator.compute_delay(1), Duration::from_secs(2));
    assert_eq!(orchestrator.compute_delay(2), Duration::from_secs(4));
}

#[tokio::test]
async fn jitter_stays_within_band() {
    let orchestrator: RetryOrchestrator<u32> = RetryOrchestrator::new(RetryPolicy {
        max_retries: 3,
        initial_delay: Duration::from_secs(10),
        max_delay: Duration::from_secs(600),
        strategy: RetryStrategy::Linear,
        jitter: 0.5,
        global_timeout: None,
    });
    for _ in 0..200 {
        let delay = orchestrator.compute_delay(0).as_secs_f64();
        assert!((5.0..=15.0).contains(&delay), "delay {delay} out of band");
    }
}

#[tokio::test]
async fn mixed_batch_keeps_input_order_and_reports_progress() {
    let progress = Arc::new(ProgressTracker::new(OperationKind::Process, 4));
    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_clone = Arc::clone(&attempts);

    let orchestrator = RetryOrchestrator::new(RetryPolicy {
        max_retries: 4,
        initial_delay: Duration::from_millis(5),
        max_delay: Duration::from_secs(1),
        strategy: RetryStrategy::Linear,
        jitter: 0.0,
        global_timeout: None,
    })
    .with_progress(Arc::clone(&progress));

    let outcome = orchestrator
        .process(vec![10u32, 20, 30, 40], move |n| {
            let attempts = Arc::clone(&attempts_clone);
            async move {
                // Item 30 fails twice before recovering
                if n == 30 && attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::Batch("transient".into()))
                } else {
                    Ok(n + 1)
                }
            }
        })
        .await;

    assert_eq!(outcome.results, vec![11, 21, 31, 41]);
    assert!(progress.is_done());
    assert_eq!(progress.snapshot().completed, 4);
}

#[tokio::test]
async fn terminal_wall_time_respects_deadline_plus_tick() {
    let policy = RetryPolicy {
        max_retries: 1000,
        initial_delay: Duration::from_millis(50),
        max_delay: Duration::from_secs(10),
        strategy: RetryStrategy::Linear,
        jitter: 0.0,
        global_timeout: Some(Duration::from_millis(200)),
    };
    let orchestrator = RetryOrchestrator::new(policy);
    let started = Instant::now();
    let outcome: vectorforge_core::retry::RetryOutcome<u32, u32> = orchestrator
        .process(vec![1, 2], |_| async { Err(Error::Batch("down".into())) })
        .await;
    let elapsed = started.elapsed();

    assert_eq!(outcome.failures.len(), 2);
    assert!(outcome.failures.iter().all(|f| f.deadline));
    // Deadline plus at most one retry tick of slack
    assert!(elapsed <= Duration::from_millis(200 + 150), "{elapsed:?}");
}
