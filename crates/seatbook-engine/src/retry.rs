//! Bounded retry with fixed backoff.
//!
//! A booking attempt is retried while the store keeps reporting transient
//! failures, up to `max_attempts` attempts in total. The pause between
//! attempts is one of two fixed delays: a short one after ordinary
//! conflicts and a long one after deadlocks and serialization failures,
//! matching the window in which the store detects and breaks lock cycles.
//! Nothing is retried past the run deadline.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use seatbook_core::config::BookingConfig;
use seatbook_core::error::{AppError, ErrorKind};

/// Why a passenger's booking was given up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Every allowed attempt failed.
    RetriesExhausted,
    /// The run deadline elapsed.
    DeadlineElapsed,
    /// The last error is not worth retrying.
    NonRetryable,
    /// The task ended without reporting an outcome (panicked or aborted).
    TaskAborted,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::RetriesExhausted => "retries_exhausted",
            Self::DeadlineElapsed => "deadline_elapsed",
            Self::NonRetryable => "non_retryable",
            Self::TaskAborted => "task_aborted",
        };
        f.write_str(s)
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for the delay, then attempt again.
    Retry(Duration),
    /// Stop and report a failed outcome.
    GiveUp(FailureReason),
}

/// A failed attempt, reported before the policy acts on it.
#[derive(Debug)]
pub struct FailedAttempt<'a> {
    /// 1-based attempt number.
    pub attempt: u32,
    pub error: &'a AppError,
    pub decision: RetryDecision,
}

/// Final error of a retried operation.
#[derive(Debug)]
pub struct GaveUp {
    pub reason: FailureReason,
    pub error: AppError,
}

/// Future of one attempt, borrowing the state threaded through
/// [`RetryPolicy::run`].
pub type AttemptFuture<'s, T> = Pin<Box<dyn Future<Output = Result<T, AppError>> + Send + 's>>;

/// Result of [`RetryPolicy::run`] with the number of attempts made.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, GaveUp>,
    pub attempts: u32,
}

/// Attempt bound and backoff delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    conflict_backoff: Duration,
    deadlock_backoff: Duration,
}

impl RetryPolicy {
    /// Create a policy. `max_attempts` is raised to at least 1.
    pub fn new(max_attempts: u32, conflict_backoff: Duration, deadlock_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            conflict_backoff,
            deadlock_backoff,
        }
    }

    /// Policy configured by the booking section.
    pub fn from_config(config: &BookingConfig) -> Self {
        Self::new(
            config.max_retries,
            config.conflict_backoff(),
            config.deadlock_backoff(),
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decide what follows failed attempt number `attempt`.
    pub fn decide(&self, attempt: u32, error: &AppError) -> RetryDecision {
        match error.kind {
            ErrorKind::Timeout => RetryDecision::GiveUp(FailureReason::DeadlineElapsed),
            kind if !kind.is_retryable() => RetryDecision::GiveUp(FailureReason::NonRetryable),
            _ if attempt >= self.max_attempts => {
                RetryDecision::GiveUp(FailureReason::RetriesExhausted)
            }
            kind if kind.is_deadlock() => RetryDecision::Retry(self.deadlock_backoff),
            _ => RetryDecision::Retry(self.conflict_backoff),
        }
    }

    /// Run `op` until it succeeds or the policy gives up.
    ///
    /// `op` receives `state` (typically the task's connection) and the
    /// 1-based attempt number. `on_failure` sees every failed attempt,
    /// including the last one. A retry whose backoff would reach `deadline`
    /// gives up with `DeadlineElapsed` right away, keeping the attempt's
    /// error; no attempt starts after the deadline.
    pub async fn run<S, T, F, R>(
        &self,
        deadline: Instant,
        state: &mut S,
        mut op: F,
        mut on_failure: R,
    ) -> RetryOutcome<T>
    where
        S: Send + ?Sized,
        F: for<'s> FnMut(&'s mut S, u32) -> AttemptFuture<'s, T>,
        R: FnMut(FailedAttempt<'_>),
    {
        let mut attempt = 0;
        loop {
            if Instant::now() >= deadline {
                return RetryOutcome {
                    result: Err(GaveUp {
                        reason: FailureReason::DeadlineElapsed,
                        error: AppError::timeout(format!(
                            "run deadline elapsed after {attempt} attempt(s)"
                        )),
                    }),
                    attempts: attempt,
                };
            }

            attempt += 1;
            let error = match op(&mut *state, attempt).await {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                    };
                }
                Err(e) => e,
            };

            let mut decision = self.decide(attempt, &error);
            if let RetryDecision::Retry(delay) = decision {
                let wakes_too_late = Instant::now()
                    .checked_add(delay)
                    .is_none_or(|wake| wake >= deadline);
                if wakes_too_late {
                    decision = RetryDecision::GiveUp(FailureReason::DeadlineElapsed);
                }
            }
            on_failure(FailedAttempt {
                attempt,
                error: &error,
                decision,
            });

            match decision {
                RetryDecision::GiveUp(reason) => {
                    return RetryOutcome {
                        result: Err(GaveUp { reason, error }),
                        attempts: attempt,
                    };
                }
                RetryDecision::Retry(delay) => tokio::time::sleep(delay).await,
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&BookingConfig::default())
    }
}
