//! Integration tests for complete booking runs against the in-memory store.

mod helpers;

use seatbook_core::types::{IsolationLevel, LockStrategy};
use seatbook_engine::{AllocationOrchestrator, Outcome};

use helpers::Fixture;

#[tokio::test(start_paused = true)]
async fn test_single_connection_books_every_seat() {
    let fixture = Fixture::new(1, 6, 6);
    let config = fixture.config(
        LockStrategy::ExclusiveLock,
        IsolationLevel::ReadCommitted,
        1,
        1,
    );

    let report = AllocationOrchestrator::new(fixture.store.clone(), config)
        .run()
        .await
        .unwrap();

    assert_eq!(report.trip().id, fixture.trip.id);
    assert_eq!(report.assigned_count(), 6);
    assert_eq!(report.occupied_count(), 6);
    assert!(report.attempt_log().is_empty());
    helpers::assert_complete(&report, &fixture.passengers);
    helpers::assert_no_double_assignment(&report);

    // Capacity 1: transactions never overlap.
    assert_eq!(fixture.store.stats().max_open_transactions, 1);
    assert_eq!(report.pool_high_water(), 1);
    assert_eq!(fixture.store.assignments(fixture.trip.id).len(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_outcomes_match_committed_state() {
    let fixture = Fixture::new(2, 4, 8);
    let config = fixture.config(
        LockStrategy::ExclusiveLockSkipped,
        IsolationLevel::ReadCommitted,
        4,
        3,
    );

    let report = AllocationOrchestrator::new(fixture.store.clone(), config)
        .run()
        .await
        .unwrap();

    let committed = fixture.store.assignments(fixture.trip.id);
    for outcome in report.outcomes() {
        if let Outcome::Assigned {
            passenger, seat, ..
        } = outcome
        {
            assert!(
                committed.contains(&(seat.clone(), *passenger)),
                "outcome {outcome:?} not committed"
            );
            assert_eq!(
                report.slot(seat.row_no, seat.column_no).map(|s| s.passenger),
                Some(*passenger)
            );
        }
    }
    assert_eq!(committed.len(), report.assigned_count());
}

#[tokio::test(start_paused = true)]
async fn test_every_strategy_and_isolation_level_is_safe() {
    for strategy in LockStrategy::ALL {
        for isolation in IsolationLevel::ALL {
            let fixture = Fixture::new(2, 3, 8);
            let config = fixture.config(strategy, isolation, 4, 3);

            let report = AllocationOrchestrator::new(fixture.store.clone(), config)
                .run()
                .await
                .unwrap_or_else(|e| panic!("{strategy}/{isolation}: {e}"));

            helpers::assert_complete(&report, &fixture.passengers);
            helpers::assert_no_double_assignment(&report);
            assert!(report.assigned_count() <= 6, "{strategy}/{isolation}");
            assert_eq!(
                fixture.store.assignments(fixture.trip.id).len(),
                report.assigned_count(),
                "{strategy}/{isolation}"
            );
            assert_eq!(fixture.store.stats().open_transactions, 0);
            assert_eq!(fixture.store.stats().open_connections, 0);
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_pool_capacity_bounds_concurrency() {
    let fixture = Fixture::new(3, 4, 12);
    let config = fixture.config(
        LockStrategy::ExclusiveLock,
        IsolationLevel::ReadCommitted,
        3,
        2,
    );

    let report = AllocationOrchestrator::new(fixture.store.clone(), config)
        .run()
        .await
        .unwrap();

    assert!(report.pool_high_water() <= 3);
    assert!(fixture.store.stats().max_open_transactions <= 3);
    // One setup connection plus the pool.
    assert_eq!(fixture.store.stats().connects, 4);
    helpers::assert_complete(&report, &fixture.passengers);
}

#[tokio::test(start_paused = true)]
async fn test_run_without_passengers_reports_empty_grid() {
    let fixture = Fixture::new(2, 2, 0);
    let config = fixture.config(
        LockStrategy::ExclusiveLock,
        IsolationLevel::ReadCommitted,
        2,
        1,
    );

    let report = AllocationOrchestrator::new(fixture.store.clone(), config)
        .run()
        .await
        .unwrap();

    assert!(report.outcomes().is_empty());
    assert_eq!(report.occupied_count(), 0);
    assert!(fixture.store.is_claimed(fixture.trip.id));
}
