//! PostgreSQL smoke test.
//!
//! Runs only when `SEATBOOK_TEST_DATABASE_URL` points at a disposable
//! database; the booking tables are truncated and reseeded.

use seatbook_core::config::{BookingConfig, DatabaseConfig, SeatLayout};
use seatbook_core::types::{IsolationLevel, LockStrategy};
use seatbook_database::{PgConnector, StoreConnection, StoreConnector};
use seatbook_engine::AllocationOrchestrator;

fn test_database() -> Option<DatabaseConfig> {
    let url = std::env::var("SEATBOOK_TEST_DATABASE_URL").ok()?;
    Some(DatabaseConfig {
        url,
        connect_timeout_seconds: 5,
    })
}

async fn seed(connector: &PgConnector, passengers: i32, rows: i32, seats_per_row: i32) {
    let mut conn = connector.connect().await.expect("connect for seeding");
    let pg = conn.inner_mut();

    sqlx::query("TRUNCATE seats, trips, passengers RESTART IDENTITY CASCADE")
        .execute(&mut *pg)
        .await
        .expect("truncate");
    sqlx::query("INSERT INTO passengers (name) SELECT 'Passenger ' || n FROM generate_series(1, $1) AS n")
        .bind(passengers)
        .execute(&mut *pg)
        .await
        .expect("seed passengers");
    sqlx::query("INSERT INTO trips (code) VALUES ('SB-PG-1')")
        .execute(&mut *pg)
        .await
        .expect("seed trip");
    sqlx::query(
        "INSERT INTO seats (trip_id, label, row_no, column_no) \
         SELECT 1, r || chr(64 + c), r, c \
         FROM generate_series(1, $1) AS r, generate_series(1, $2) AS c \
         ORDER BY r, c",
    )
    .bind(rows)
    .bind(seats_per_row)
    .execute(&mut *pg)
    .await
    .expect("seed seats");

    conn.close().await.expect("close seeding connection");
}

#[tokio::test]
async fn test_postgres_booking_run() {
    let Some(database) = test_database() else {
        eprintln!("SEATBOOK_TEST_DATABASE_URL not set, skipping");
        return;
    };

    seatbook_database::migration::migrate(&database)
        .await
        .expect("migrations");
    let connector = PgConnector::new(&database).expect("connector");
    seed(&connector, 6, 2, 3).await;

    let config = BookingConfig {
        pool_capacity: 3,
        run_deadline_seconds: 30,
        lock_strategy: LockStrategy::ExclusiveLockSkipped,
        isolation_level: IsolationLevel::ReadCommitted,
        max_retries: 3,
        conflict_backoff_ms: 10,
        deadlock_backoff_ms: 1000,
        layout: SeatLayout {
            rows: 2,
            seats_per_row: 3,
            aisle_after: 1,
        },
    };

    let report = AllocationOrchestrator::new(connector, config)
        .run()
        .await
        .expect("booking run");

    assert_eq!(report.outcomes().len(), 6);
    assert_eq!(report.assigned_count(), 6);
    assert_eq!(report.occupied_count(), 6);
}
