//! Allocation orchestrator: one booking run from trip claim to report.
//!
//! A run loads the passengers, claims one unclaimed trip, opens a
//! connection pool, and spawns one booking task per passenger. Each task
//! acquires a connection, keeps it for all of its attempts, and reports
//! exactly one outcome. The run waits for every task, closes the pool and
//! builds the [`Report`].
//!
//! Setup failures (store unreachable, no trip left, pool construction) are
//! fatal and returned from [`AllocationOrchestrator::run`]. Failures inside
//! a booking task only ever end up in that passenger's outcome.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{Instrument, Span, debug, error, field, info, info_span, warn};

use seatbook_core::config::BookingConfig;
use seatbook_core::error::{AppError, ErrorKind};
use seatbook_core::result::AppResult;
use seatbook_core::types::{IsolationLevel, LockStrategy, PassengerId, RunId, TripId};
use seatbook_database::{StoreConnection, StoreConnector};
use seatbook_entity::{Passenger, Seat, Trip};

use crate::outcome::{AttemptRecord, Outcome, OutcomeCollector, OutcomeReporter};
use crate::pool::ConnectionPool;
use crate::report::{Report, RunSummary};
use crate::retry::{FailureReason, RetryDecision, RetryPolicy};
use crate::strategy::SelectSeat;
use crate::transaction::Transaction;

/// How many times a trip claim lost to a concurrent run is retried with
/// the next unclaimed trip.
const MAX_CLAIM_ATTEMPTS: u32 = 3;

/// Runs booking runs against one store.
#[derive(Debug)]
pub struct AllocationOrchestrator<K: StoreConnector> {
    connector: Arc<K>,
    config: BookingConfig,
    retry: RetryPolicy,
}

impl<K: StoreConnector> AllocationOrchestrator<K> {
    pub fn new(connector: K, config: BookingConfig) -> Self {
        let retry = RetryPolicy::from_config(&config);
        Self {
            connector: Arc::new(connector),
            config,
            retry,
        }
    }

    /// Execute one booking run.
    pub async fn run(&self) -> AppResult<Report> {
        self.config.validate()?;

        let run_id = RunId::new();
        let span = info_span!(
            "booking_run",
            run_id = %run_id,
            trip_id = field::Empty,
            strategy = %self.config.lock_strategy,
            isolation = %self.config.isolation_level,
        );
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: RunId) -> AppResult<Report> {
        let started_at = Utc::now();
        let started = Instant::now();
        let deadline = started + self.config.run_deadline();

        let (passengers, trip) = within_deadline(deadline, "setup", self.prepare()).await?;
        Span::current().record("trip_id", trip.id.get());
        info!(
            trip = %trip.code,
            passengers = passengers.len(),
            pool_capacity = self.config.pool_capacity,
            selection_may_block = self.config.lock_strategy.may_block(),
            "Booking run started"
        );

        let pool = within_deadline(
            deadline,
            "pool construction",
            ConnectionPool::open(self.connector.as_ref(), self.config.pool_capacity),
        )
        .await?;

        let collector = OutcomeCollector::new();
        let mut tasks = JoinSet::new();
        for passenger in &passengers {
            let task = BookingTask {
                pool: pool.clone(),
                trip: trip.id,
                passenger: passenger.id,
                strategy: self.config.lock_strategy,
                isolation: self.config.isolation_level,
                retry: self.retry,
                deadline,
                reporter: collector.reporter(passenger.id),
            };
            let span = info_span!("passenger", passenger_id = %passenger.id, name = %passenger.name);
            tasks.spawn(task.run().instrument(span));
        }

        let expected: Vec<PassengerId> = passengers.iter().map(|p| p.id).collect();
        let ((), collected) = tokio::join!(drain(tasks), collector.collect(&expected));

        let pool_high_water = pool.high_water();
        if let Err(e) = pool.close().await {
            warn!(error = %e, "Failed to close connection pool");
        }

        let summary = RunSummary {
            run_id,
            trip,
            started_at,
            elapsed: started.elapsed(),
            pool_high_water,
        };
        let report = Report::build(summary, &self.config, collected);
        info!(
            assigned = report.assigned_count(),
            failed = report.failed_count(),
            failed_attempts = report.attempt_log().len(),
            elapsed_ms = report.elapsed().as_millis() as u64,
            "Booking run finished"
        );
        Ok(report)
    }

    /// Load passengers and claim a trip over a dedicated connection.
    async fn prepare(&self) -> AppResult<(Vec<Passenger>, Trip)> {
        let mut conn = self.connector.connect().await?;
        let prepared = load_and_claim(&mut conn).await;
        if let Err(e) = conn.close().await {
            warn!(error = %e, "Failed to close setup connection");
        }
        prepared
    }
}

async fn load_and_claim<C: StoreConnection>(conn: &mut C) -> AppResult<(Vec<Passenger>, Trip)> {
    let passengers = conn.list_passengers().await?;

    let mut attempt = 1;
    loop {
        let trip = conn.next_unclaimed_trip().await?;
        match conn.claim_trip(trip.id).await {
            Ok(()) => {
                debug!(trip_id = %trip.id, attempt, "Trip claimed");
                return Ok((passengers, trip));
            }
            Err(e) if e.kind == ErrorKind::Conflict && attempt < MAX_CLAIM_ATTEMPTS => {
                debug!(trip_id = %trip.id, error = %e, "Trip claimed by a concurrent run, reselecting");
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn within_deadline<T>(
    deadline: Instant,
    step: &str,
    fut: impl Future<Output = AppResult<T>>,
) -> AppResult<T> {
    tokio::time::timeout_at(deadline, fut)
        .await
        .map_err(|_| AppError::timeout(format!("run deadline elapsed during {step}")))?
}

async fn drain(mut tasks: JoinSet<()>) {
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Booking task did not complete");
        }
    }
}

/// Everything one passenger's task needs.
struct BookingTask<C: StoreConnection> {
    pool: ConnectionPool<C>,
    trip: TripId,
    passenger: PassengerId,
    strategy: LockStrategy,
    isolation: IsolationLevel,
    retry: RetryPolicy,
    deadline: Instant,
    reporter: OutcomeReporter,
}

impl<C: StoreConnection> BookingTask<C> {
    async fn run(self) {
        let Self {
            pool,
            trip,
            passenger,
            strategy,
            isolation,
            retry,
            deadline,
            reporter,
        } = self;

        let mut conn = match within_deadline(deadline, "connection acquire", pool.acquire()).await
        {
            Ok(conn) => conn,
            Err(e) => {
                let reason = if e.kind == ErrorKind::Timeout {
                    FailureReason::DeadlineElapsed
                } else {
                    FailureReason::NonRetryable
                };
                warn!(error = %e, "Could not acquire a connection");
                reporter.finish(Outcome::failed(passenger, reason, &e, 0));
                return;
            }
        };
        debug!(slot = conn.slot(), "Connection acquired");

        let result = retry
            .run(
                deadline,
                &mut conn,
                move |conn, attempt| {
                    debug!(attempt, "Booking attempt");
                    Box::pin(book_seat(&mut **conn, trip, passenger, strategy, isolation, deadline))
                },
                |failed| {
                    let backoff_ms = match failed.decision {
                        RetryDecision::Retry(delay) => {
                            Some(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX))
                        }
                        RetryDecision::GiveUp(_) => None,
                    };
                    warn!(
                        attempt = failed.attempt,
                        kind = %failed.error.kind,
                        error = %failed.error.message,
                        backoff_ms = ?backoff_ms,
                        "Booking attempt failed"
                    );
                    reporter.attempt_failed(AttemptRecord {
                        passenger,
                        attempt: failed.attempt,
                        kind: failed.error.kind,
                        message: failed.error.message.clone(),
                        backoff_ms,
                    });
                },
            )
            .await;

        let outcome = match result.result {
            Ok(seat) => {
                info!(seat = %seat.label, attempts = result.attempts, "Seat assigned");
                Outcome::Assigned {
                    passenger,
                    seat,
                    attempts: result.attempts,
                }
            }
            Err(gave_up) => {
                warn!(
                    reason = %gave_up.reason,
                    error = %gave_up.error,
                    attempts = result.attempts,
                    "Booking given up"
                );
                Outcome::failed(passenger, gave_up.reason, &gave_up.error, result.attempts)
            }
        };

        if let Err(e) = pool.release(conn) {
            error!(error = %e, "Failed to release connection");
        }
        reporter.finish(outcome);
    }
}

/// One attempt: begin, select, assign, commit. Rolls back on failure.
///
/// Selection and assignment may wait on row locks and give up at the run
/// deadline. The store is told the time left as its lock timeout, so a wait
/// ends on the store side too and the rollback after it does not block.
/// Commit and rollback always run to completion.
async fn book_seat<C: StoreConnection>(
    conn: &mut C,
    trip: TripId,
    passenger: PassengerId,
    strategy: LockStrategy,
    isolation: IsolationLevel,
    deadline: Instant,
) -> AppResult<Seat> {
    let mut tx = Transaction::begin(conn, isolation).await?;

    let assigned = async {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(AppError::timeout("run deadline elapsed before seat selection"));
        }
        tx.limit_lock_waits(remaining).await?;

        let seat = within_deadline(deadline, "seat selection", strategy.select_seat(&mut tx, trip))
            .await?;
        within_deadline(
            deadline,
            "seat assignment",
            tx.connection().assign_seat(passenger, seat.id),
        )
        .await?;
        Ok::<_, AppError>(seat)
    }
    .await;

    match assigned {
        Ok(seat) => {
            tx.commit().await?;
            Ok(seat)
        }
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "Rollback after failed attempt failed");
            }
            Err(e)
        }
    }
}
