//! Integration tests for contention, retries, deadlines and setup failures.

mod helpers;

use seatbook_core::ErrorKind;
use seatbook_core::types::{IsolationLevel, LockStrategy};
use seatbook_database::{FaultPoint, MemoryStore, StoreConnection, StoreConnector};
use seatbook_engine::{AllocationOrchestrator, FailureReason, Outcome};

use helpers::Fixture;

#[tokio::test(start_paused = true)]
async fn test_two_passengers_race_for_last_seat() {
    let fixture = Fixture::new(1, 1, 2);
    let config = fixture.config(LockStrategy::NoLock, IsolationLevel::ReadCommitted, 2, 3);

    let report = AllocationOrchestrator::new(fixture.store.clone(), config)
        .run()
        .await
        .unwrap();

    helpers::assert_complete(&report, &fixture.passengers);
    helpers::assert_no_double_assignment(&report);
    assert_eq!(report.assigned_count(), 1);

    let loser = report
        .outcomes()
        .iter()
        .find(|o| !o.is_assigned())
        .unwrap();
    match loser {
        Outcome::Failed {
            reason, attempts, ..
        } => {
            assert_eq!(*reason, FailureReason::RetriesExhausted);
            assert_eq!(*attempts, 3);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(report.attempt_log().iter().all(|r| r.passenger == loser.passenger()));
    assert_eq!(report.attempt_log().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_failed_outcomes_use_every_attempt() {
    let fixture = Fixture::new(1, 2, 5);
    let config = fixture.config(
        LockStrategy::ExclusiveLockSkipped,
        IsolationLevel::ReadCommitted,
        5,
        2,
    );

    let report = AllocationOrchestrator::new(fixture.store.clone(), config)
        .run()
        .await
        .unwrap();

    helpers::assert_complete(&report, &fixture.passengers);
    assert_eq!(report.assigned_count(), 2);
    assert_eq!(report.failed_count(), 3);
    for outcome in report.outcomes().iter().filter(|o| !o.is_assigned()) {
        assert_eq!(outcome.attempts(), 2, "{outcome:?}");
    }
}

#[tokio::test(start_paused = true)]
async fn test_deadlock_is_retried_with_extended_backoff() {
    let fixture = Fixture::new(1, 2, 1);
    fixture
        .store
        .inject_fault(FaultPoint::Commit, ErrorKind::Deadlock, 1);
    let config = fixture.config(
        LockStrategy::ExclusiveLock,
        IsolationLevel::Serializable,
        1,
        2,
    );

    let report = AllocationOrchestrator::new(fixture.store.clone(), config)
        .run()
        .await
        .unwrap();

    assert_eq!(report.assigned_count(), 1);
    assert_eq!(report.outcomes()[0].attempts(), 2);
    assert_eq!(report.attempt_log().len(), 1);
    assert_eq!(report.attempt_log()[0].kind, ErrorKind::Deadlock);
    assert_eq!(report.attempt_log()[0].backoff_ms, Some(20));
}

#[tokio::test(start_paused = true)]
async fn test_deadlock_backoff_past_deadline_reports_deadlock() {
    let fixture = Fixture::new(1, 2, 1);
    fixture
        .store
        .inject_fault(FaultPoint::Commit, ErrorKind::Deadlock, 1);
    let mut config = fixture.config(
        LockStrategy::ExclusiveLock,
        IsolationLevel::Serializable,
        1,
        5,
    );
    config.run_deadline_seconds = 1;
    config.deadlock_backoff_ms = 5_000;

    let report = AllocationOrchestrator::new(fixture.store.clone(), config)
        .run()
        .await
        .unwrap();

    match &report.outcomes()[0] {
        Outcome::Failed {
            reason,
            kind,
            attempts,
            ..
        } => {
            assert_eq!(*reason, FailureReason::DeadlineElapsed);
            assert_eq!(*kind, ErrorKind::Deadlock);
            assert_eq!(*attempts, 1);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(report.attempt_log().len(), 1);
    assert_eq!(report.attempt_log()[0].kind, ErrorKind::Deadlock);
    assert_eq!(report.attempt_log()[0].backoff_ms, None);
    assert!(report.elapsed() < std::time::Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_deadline_fails_blocked_passenger() {
    let fixture = Fixture::new(1, 1, 1);
    let mut config = fixture.config(
        LockStrategy::ExclusiveLock,
        IsolationLevel::ReadCommitted,
        1,
        5,
    );
    config.run_deadline_seconds = 1;

    // Another session holds the only seat and never lets go.
    let mut holder = fixture.store.connect().await.unwrap();
    holder.begin().await.unwrap();
    holder
        .select_seat(fixture.trip.id, LockStrategy::ExclusiveLock.row_lock())
        .await
        .unwrap();

    let report = AllocationOrchestrator::new(fixture.store.clone(), config)
        .run()
        .await
        .unwrap();

    match &report.outcomes()[0] {
        Outcome::Failed {
            reason,
            kind,
            attempts,
            ..
        } => {
            assert_eq!(*reason, FailureReason::DeadlineElapsed);
            assert_eq!(*kind, ErrorKind::Timeout);
            assert_eq!(*attempts, 1);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(fixture.store.free_seat_count(fixture.trip.id), 1);
    holder.rollback().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_trip_is_claimed_only_once() {
    let fixture = Fixture::new(1, 2, 2);
    let config = fixture.config(
        LockStrategy::ExclusiveLock,
        IsolationLevel::ReadCommitted,
        2,
        1,
    );
    let orchestrator = AllocationOrchestrator::new(fixture.store.clone(), config);

    orchestrator.run().await.unwrap();
    assert!(fixture.store.is_claimed(fixture.trip.id));

    let mut conn = fixture.store.connect().await.unwrap();
    let err = conn.claim_trip(fixture.trip.id).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Conflict);

    let err = orchestrator.run().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_runs_claim_different_trips() {
    let fixture = Fixture::new(1, 3, 3);
    let second_trip = fixture.store.add_trip("SB-TEST-2", 1, 3);
    let config = fixture.config(
        LockStrategy::ExclusiveLock,
        IsolationLevel::ReadCommitted,
        2,
        2,
    );

    let first = AllocationOrchestrator::new(fixture.store.clone(), config.clone());
    let second = AllocationOrchestrator::new(fixture.store.clone(), config);
    let (a, b) = tokio::join!(first.run(), second.run());
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_ne!(a.trip().id, b.trip().id);
    for report in [&a, &b] {
        helpers::assert_no_double_assignment(report);
        assert_eq!(report.assigned_count(), 3);
    }
    assert_eq!(fixture.store.assignments(fixture.trip.id).len(), 3);
    assert_eq!(fixture.store.assignments(second_trip.id).len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_connection_failure_at_pool_open_is_fatal() {
    let fixture = Fixture::new(1, 2, 2);
    // The setup connection succeeds, the pool's connections do not.
    fixture.store.fail_connections_after(1);
    let config = fixture.config(
        LockStrategy::ExclusiveLock,
        IsolationLevel::ReadCommitted,
        2,
        1,
    );

    let err = AllocationOrchestrator::new(fixture.store.clone(), config)
        .run()
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::Connection);
    assert_eq!(fixture.store.stats().open_connections, 0);
}

#[tokio::test]
async fn test_unreachable_store_is_fatal() {
    let store = MemoryStore::new();
    store.fail_connections_after(0);
    let fixture = Fixture::with_store(store, 1, 1, 1);
    let config = fixture.config(
        LockStrategy::NoLock,
        IsolationLevel::ReadCommitted,
        1,
        1,
    );

    let err = AllocationOrchestrator::new(fixture.store.clone(), config)
        .run()
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Connection);
}
