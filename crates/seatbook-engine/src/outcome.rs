//! Per-passenger outcomes and the collector that gathers them.
//!
//! Each booking task owns one [`OutcomeReporter`]. It may report any number
//! of failed attempts while it runs and reports its terminal outcome by
//! consuming itself in [`OutcomeReporter::finish`], so a task cannot report
//! twice. A single [`OutcomeCollector`] drains the channel and, once every
//! reporter is gone, builds the outcome list.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use seatbook_core::error::{AppError, ErrorKind};
use seatbook_core::types::PassengerId;
use seatbook_entity::Seat;

use crate::retry::FailureReason;

/// Terminal result of one passenger's booking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// The passenger got a seat.
    Assigned {
        passenger: PassengerId,
        seat: Seat,
        attempts: u32,
    },
    /// The booking was given up.
    Failed {
        passenger: PassengerId,
        reason: FailureReason,
        kind: ErrorKind,
        message: String,
        attempts: u32,
    },
}

impl Outcome {
    /// Failed outcome carrying the last error.
    pub fn failed(
        passenger: PassengerId,
        reason: FailureReason,
        error: &AppError,
        attempts: u32,
    ) -> Self {
        Self::Failed {
            passenger,
            reason,
            kind: error.kind,
            message: error.message.clone(),
            attempts,
        }
    }

    pub fn passenger(&self) -> PassengerId {
        match self {
            Self::Assigned { passenger, .. } | Self::Failed { passenger, .. } => *passenger,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Assigned { attempts, .. } | Self::Failed { attempts, .. } => *attempts,
        }
    }

    /// The assigned seat, if any.
    pub fn seat(&self) -> Option<&Seat> {
        match self {
            Self::Assigned { seat, .. } => Some(seat),
            Self::Failed { .. } => None,
        }
    }

    pub fn is_assigned(&self) -> bool {
        matches!(self, Self::Assigned { .. })
    }
}

/// One failed booking attempt, kept for the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub passenger: PassengerId,
    /// 1-based attempt number.
    pub attempt: u32,
    pub kind: ErrorKind,
    pub message: String,
    /// Backoff before the next attempt, or `None` when this was the last.
    pub backoff_ms: Option<u64>,
}

#[derive(Debug)]
enum BookingEvent {
    AttemptFailed(AttemptRecord),
    Finished(Outcome),
}

/// Write side handed to one booking task.
#[derive(Debug)]
pub struct OutcomeReporter {
    passenger: PassengerId,
    tx: mpsc::UnboundedSender<BookingEvent>,
}

impl OutcomeReporter {
    /// Record a failed attempt.
    pub fn attempt_failed(&self, record: AttemptRecord) {
        // The collector outlives every reporter; a send error means the run
        // is being torn down.
        let _ = self.tx.send(BookingEvent::AttemptFailed(record));
    }

    /// Record the terminal outcome.
    pub fn finish(self, outcome: Outcome) {
        if outcome.passenger() != self.passenger {
            warn!(
                reporter = %self.passenger,
                outcome = %outcome.passenger(),
                "Outcome reported for a different passenger"
            );
        }
        let _ = self.tx.send(BookingEvent::Finished(outcome));
    }
}

/// Everything reported during a run.
#[derive(Debug, Clone, Default)]
pub struct Collected {
    /// One outcome per expected passenger, in passenger order.
    pub outcomes: Vec<Outcome>,
    /// Failed attempts in the order they were reported.
    pub attempt_log: Vec<AttemptRecord>,
}

/// Single consumer of all booking events of a run.
#[derive(Debug)]
pub struct OutcomeCollector {
    tx: mpsc::UnboundedSender<BookingEvent>,
    rx: mpsc::UnboundedReceiver<BookingEvent>,
}

impl Default for OutcomeCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl OutcomeCollector {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    /// A reporter for one passenger's task.
    pub fn reporter(&self, passenger: PassengerId) -> OutcomeReporter {
        OutcomeReporter {
            passenger,
            tx: self.tx.clone(),
        }
    }

    /// Drain events until every reporter has been dropped.
    ///
    /// Passengers in `expected` without a reported outcome get a
    /// `TaskAborted` failure; a second outcome for the same passenger is
    /// ignored.
    pub async fn collect(self, expected: &[PassengerId]) -> Collected {
        let Self { tx, mut rx } = self;
        drop(tx);

        let mut reported: BTreeMap<PassengerId, Outcome> = BTreeMap::new();
        let mut attempt_log = Vec::new();
        let mut attempts_seen: BTreeMap<PassengerId, u32> = BTreeMap::new();

        while let Some(event) = rx.recv().await {
            match event {
                BookingEvent::AttemptFailed(record) => {
                    let seen = attempts_seen.entry(record.passenger).or_default();
                    *seen = (*seen).max(record.attempt);
                    attempt_log.push(record);
                }
                BookingEvent::Finished(outcome) => {
                    let passenger = outcome.passenger();
                    if reported.contains_key(&passenger) {
                        warn!(passenger = %passenger, "Duplicate outcome ignored");
                        continue;
                    }
                    reported.insert(passenger, outcome);
                }
            }
        }

        let outcomes: Vec<Outcome> = expected
            .iter()
            .map(|passenger| {
                reported.remove(passenger).unwrap_or_else(|| {
                    warn!(passenger = %passenger, "Booking task ended without an outcome");
                    let attempts = attempts_seen.get(passenger).copied().unwrap_or(0);
                    Outcome::failed(
                        *passenger,
                        FailureReason::TaskAborted,
                        &AppError::internal("booking task ended without reporting an outcome"),
                        attempts,
                    )
                })
            })
            .collect();

        for passenger in reported.keys() {
            warn!(passenger = %passenger, "Outcome reported for an unknown passenger");
        }

        Collected {
            outcomes,
            attempt_log,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assigned(passenger: i32, seat: i32) -> Outcome {
        Outcome::Assigned {
            passenger: PassengerId(passenger),
            seat: Seat::new(seat, 1, 1, seat),
            attempts: 1,
        }
    }

    #[tokio::test]
    async fn test_collects_in_passenger_order() {
        let collector = OutcomeCollector::new();
        let first = collector.reporter(PassengerId(1));
        let second = collector.reporter(PassengerId(2));

        let task = tokio::spawn(async move {
            second.attempt_failed(AttemptRecord {
                passenger: PassengerId(2),
                attempt: 1,
                kind: ErrorKind::Conflict,
                message: "seat taken".to_string(),
                backoff_ms: Some(50),
            });
            second.finish(assigned(2, 2));
            first.finish(assigned(1, 1));
        });

        let collected = collector
            .collect(&[PassengerId(1), PassengerId(2)])
            .await;
        task.await.unwrap();

        let passengers: Vec<PassengerId> =
            collected.outcomes.iter().map(Outcome::passenger).collect();
        assert_eq!(passengers, vec![PassengerId(1), PassengerId(2)]);
        assert_eq!(collected.attempt_log.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_outcome_becomes_task_aborted() {
        let collector = OutcomeCollector::new();
        let reporter = collector.reporter(PassengerId(7));
        reporter.attempt_failed(AttemptRecord {
            passenger: PassengerId(7),
            attempt: 1,
            kind: ErrorKind::Deadlock,
            message: "deadlock detected".to_string(),
            backoff_ms: Some(1000),
        });
        drop(reporter);

        let collected = collector.collect(&[PassengerId(7)]).await;
        match &collected.outcomes[0] {
            Outcome::Failed {
                reason, attempts, ..
            } => {
                assert_eq!(*reason, FailureReason::TaskAborted);
                assert_eq!(*attempts, 1);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_outcome_json_shape() {
        let outcome = Outcome::failed(
            PassengerId(3),
            FailureReason::RetriesExhausted,
            &AppError::conflict("seat taken"),
            2,
        );
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["reason"], "retries_exhausted");
        assert_eq!(json["kind"], "conflict");
        assert_eq!(json["attempts"], 2);
    }
}
