//! Per-item retry with policy-driven backoff.
//!
//! The orchestrator wraps each input in a pending slot, attempts items
//! whose retry time has arrived, and reschedules failures until the
//! retry budget or the global deadline runs out. A failing item never
//! blocks other items in the same pass, and terminal items are
//! reported in the outcome rather than raised.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::progress::ProgressTracker;

/// Idle tick used when no item is eligible yet
const RETRY_TICK: Duration = Duration::from_millis(100);

/// Backoff strategies for failed operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    /// Fixed delay between retries
    Linear,
    /// Exponential backoff
    Exponential,
    /// Fibonacci sequence delays
    Fibonacci,
}

/// Configuration for retry behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of executions per item
    pub max_retries: u32,
    /// Base delay before the first retry
    pub initial_delay: Duration,
    /// Ceiling applied to every computed delay
    pub max_delay: Duration,
    /// Delay growth strategy
    pub strategy: RetryStrategy,
    /// Random jitter factor in `[0, 1]`
    pub jitter: f64,
    /// Overall wall-clock budget for the whole loop
    pub global_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            strategy: RetryStrategy::Exponential,
            jitter: 0.1,
            global_timeout: None,
        }
    }
}

/// Metrics emitted by one orchestrator run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetrySummary {
    /// Number of re-attempt executions (first tries excluded)
    pub total_retries: u64,
    /// Successes that needed at least one retry
    pub successful_retries: u64,
    /// Failed executions, first tries included
    pub failed_retries: u64,
    /// Wall-clock time spent in the loop
    pub total_retry_time: Duration,
    /// Mean scheduled retry delay
    pub avg_retry_delay: Duration,
    /// Failure counts by error kind
    pub error_types: HashMap<String, u64>,
}

/// A payload whose retries were exhausted or refused
#[derive(Debug)]
pub struct TerminalItem<T> {
    /// The original payload
    pub payload: T,
    /// Executions completed before giving up
    pub attempts: u32,
    /// The final error
    pub error: Error,
    /// Whether the global deadline cut the item off
    pub deadline: bool,
}

/// Outcome of a retry run: successes in input order, terminal items, summary
#[derive(Debug)]
pub struct RetryOutcome<T, R> {
    /// Successful results in input order
    pub results: Vec<R>,
    /// Items that never succeeded
    pub failures: Vec<TerminalItem<T>>,
    /// Run metrics
    pub summary: RetrySummary,
}

impl<T, R> RetryOutcome<T, R> {
    /// True when every input succeeded
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Callback invoked once per terminally failed payload
pub type FailureCallback<T> = Box<dyn Fn(&T, &Error) + Send + Sync>;

/// Predicate deciding whether an error is worth retrying
pub type RetryPredicate = Box<dyn Fn(&Error) -> bool + Send + Sync>;

/// Drives per-item retries for a batch of payloads
pub struct RetryOrchestrator<T> {
    policy: RetryPolicy,
    fib_cache: Mutex<Vec<u64>>,
    retry_predicate: Option<RetryPredicate>,
    failure_callback: Option<FailureCallback<T>>,
    progress: Option<Arc<ProgressTracker>>,
}

impl<T> std::fmt::Debug for RetryOrchestrator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryOrchestrator")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

struct Pending<T> {
    payload: T,
    attempt: u32,
    next_retry_at: Instant,
    last_error: Option<Error>,
}

impl<T: Clone + Send> RetryOrchestrator<T> {
    /// Create an orchestrator with the given policy
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            fib_cache: Mutex::new(vec![0, 1]),
            retry_predicate: None,
            failure_callback: None,
            progress: None,
        }
    }

    /// Classify errors as retryable; absent, every error is retried
    #[must_use]
    pub fn with_retry_predicate(mut self, predicate: RetryPredicate) -> Self {
        self.retry_predicate = Some(predicate);
        self
    }

    /// Invoke a callback for every terminally failed payload
    #[must_use]
    pub fn with_failure_callback(mut self, callback: FailureCallback<T>) -> Self {
        self.failure_callback = Some(callback);
        self
    }

    /// Report per-item completion to a progress tracker
    #[must_use]
    pub fn with_progress(mut self, progress: Arc<ProgressTracker>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// The active policy
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Delay before the retry following execution `attempt` (0-based)
    ///
    /// Jitter multiplies by `1 + uniform(-j, +j)`; the result is
    /// clamped to `max_delay` afterwards, so a saturated base delay
    /// returns exactly the ceiling when jitter is zero.
    #[must_use]
    pub fn compute_delay(&self, attempt: u32) -> Duration {
        let base = self.policy.initial_delay.as_secs_f64();
        let raw = match self.policy.strategy {
            RetryStrategy::Linear => base,
            RetryStrategy::Exponential => base * 2f64.powi(attempt as i32),
            RetryStrategy::Fibonacci => base * self.fibonacci(attempt + 1) as f64,
        };
        let jitter = if self.policy.jitter > 0.0 {
            (fastrand::f64() * 2.0 - 1.0) * self.policy.jitter
        } else {
            0.0
        };
        let jittered = raw * (1.0 + jitter);
        let capped = jittered.min(self.policy.max_delay.as_secs_f64()).max(0.0);
        Duration::from_secs_f64(capped)
    }

    fn fibonacci(&self, n: u32) -> u64 {
        let mut cache = self.fib_cache.lock();
        while cache.len() <= n as usize {
            let next = cache[cache.len() - 1].saturating_add(cache[cache.len() - 2]);
            cache.push(next);
        }
        cache[n as usize]
    }

    /// Process `items`, retrying failures per the policy
    ///
    /// `operation` receives a clone of the payload for each execution.
    /// Items are attempted in input order within each pass and results
    /// are returned in input order.
    pub async fn process<R, F, Fut>(&self, items: Vec<T>, mut operation: F) -> RetryOutcome<T, R>
    where
        F: FnMut(T) -> Fut,
        Fut: std::future::Future<Output = Result<R>>,
    {
        let started = Instant::now();
        let deadline = self.policy.global_timeout.map(|t| started + t);
        let total = items.len();
        debug!(
            items = total,
            max_retries = self.policy.max_retries,
            strategy = ?self.policy.strategy,
            "starting retry loop"
        );

        let mut slots: Vec<Option<Pending<T>>> = items
            .into_iter()
            .map(|payload| {
                Some(Pending {
                    payload,
                    attempt: 0,
                    next_retry_at: started,
                    last_error: None,
                })
            })
            .collect();
        let mut results: Vec<Option<R>> = (0..total).map(|_| None).collect();
        let mut pending: Vec<usize> = (0..total).collect();
        let mut failures: Vec<TerminalItem<T>> = Vec::new();

        let mut summary = RetrySummary::default();
        let mut scheduled_delays: Vec<Duration> = Vec::new();

        'outer: while !pending.is_empty() {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    break 'outer;
                }
            }

            let now = Instant::now();
            let eligible: Vec<usize> = pending
                .iter()
                .copied()
                .filter(|&i| {
                    slots[i].as_ref().is_some_and(|slot| {
                        slot.next_retry_at <= now && slot.attempt < self.policy.max_retries
                    })
                })
                .collect();

            if eligible.is_empty() {
                let all_exhausted = pending.iter().all(|&i| {
                    slots[i]
                        .as_ref()
                        .is_none_or(|slot| slot.attempt >= self.policy.max_retries)
                });
                if all_exhausted {
                    warn!(pending = pending.len(), "all pending items exceeded max retries");
                    break 'outer;
                }
                // Nothing ready yet; tick without busy-waiting and
                // without overshooting the deadline.
                let mut tick = RETRY_TICK;
                if let Some(deadline) = deadline {
                    tick = tick.min(deadline.saturating_duration_since(now));
                }
                tokio::time::sleep(tick.max(Duration::from_millis(1))).await;
                continue;
            }

            for idx in eligible {
                let Some((payload, attempt)) = slots[idx]
                    .as_ref()
                    .map(|slot| (slot.payload.clone(), slot.attempt))
                else {
                    continue;
                };
                if attempt > 0 {
                    summary.total_retries += 1;
                }

                match operation(payload).await {
                    Ok(result) => {
                        if attempt > 0 {
                            summary.successful_retries += 1;
                            debug!(index = idx, retries = attempt, "item recovered");
                        }
                        results[idx] = Some(result);
                        pending.retain(|&i| i != idx);
                        slots[idx] = None;
                        if let Some(progress) = &self.progress {
                            progress.complete_batch(1, 0);
                        }
                    }
                    Err(error) => {
                        summary.failed_retries += 1;
                        *summary
                            .error_types
                            .entry(error.kind().to_string())
                            .or_insert(0) += 1;

                        let refused = self
                            .retry_predicate
                            .as_ref()
                            .is_some_and(|pred| !pred(&error));
                        let exhausted = attempt + 1 >= self.policy.max_retries;

                        if refused || exhausted {
                            if refused {
                                warn!(index = idx, error = %error, "non-retryable error");
                            }
                            let Some(slot) = slots[idx].take() else {
                                continue;
                            };
                            pending.retain(|&i| i != idx);
                            if let Some(callback) = &self.failure_callback {
                                callback(&slot.payload, &error);
                            }
                            if let Some(progress) = &self.progress {
                                progress.complete_batch(0, 1);
                            }
                            failures.push(TerminalItem {
                                payload: slot.payload,
                                attempts: attempt + 1,
                                error,
                                deadline: false,
                            });
                        } else {
                            let delay = self.compute_delay(attempt);
                            scheduled_delays.push(delay);
                            let Some(slot) = slots[idx].as_mut() else {
                                continue;
                            };
                            slot.next_retry_at = Instant::now() + delay;
                            slot.attempt = attempt + 1;
                            slot.last_error = Some(error);
                            debug!(
                                index = idx,
                                attempt = attempt + 1,
                                delay_ms = delay.as_millis() as u64,
                                "retry scheduled"
                            );
                        }
                    }
                }
            }
        }

        // Anything still pending ran out of budget, either the global
        // deadline or a zero retry allowance.
        let deadline_hit = deadline.is_some_and(|d| Instant::now() >= d);
        for idx in std::mem::take(&mut pending) {
            let Some(slot) = slots[idx].take() else {
                continue;
            };
            if let Some(last) = &slot.last_error {
                debug!(index = idx, last_error = %last, "giving up with retries pending");
            }
            let elapsed = started.elapsed();
            if let Some(progress) = &self.progress {
                progress.complete_batch(0, 1);
            }
            failures.push(TerminalItem {
                payload: slot.payload,
                attempts: slot.attempt,
                error: Error::Timeout {
                    elapsed_ms: elapsed.as_millis() as u64,
                    deadline_exceeded: deadline_hit,
                },
                deadline: deadline_hit,
            });
        }

        summary.total_retry_time = started.elapsed();
        if !scheduled_delays.is_empty() {
            let total: Duration = scheduled_delays.iter().sum();
            summary.avg_retry_delay = total / scheduled_delays.len() as u32;
        }
        debug!(
            succeeded = results.iter().filter(|r| r.is_some()).count(),
            failed = failures.len(),
            elapsed_ms = summary.total_retry_time.as_millis() as u64,
            "retry loop finished"
        );

        RetryOutcome {
            results: results.into_iter().flatten().collect(),
            failures,
            summary,
        }
    }
}
