//! Shared test helpers for integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::time::Duration;

use seatbook_core::config::{BookingConfig, SeatLayout};
use seatbook_core::types::{IsolationLevel, LockStrategy, SeatId};
use seatbook_database::MemoryStore;
use seatbook_engine::Report;
use seatbook_entity::{Passenger, Trip};

/// Simulated latency of every store round trip.
pub const ROUND_TRIP: Duration = Duration::from_millis(2);

/// In-memory store seeded with one trip and a set of passengers.
pub struct Fixture {
    /// The seeded store
    pub store: MemoryStore,
    /// The only trip, `rows` x `seats_per_row` seats
    pub trip: Trip,
    /// Seeded passengers in id order
    pub passengers: Vec<Passenger>,
    /// Layout matching the trip's cabin
    pub layout: SeatLayout,
}

impl Fixture {
    /// Seed a store whose round trips take [`ROUND_TRIP`].
    pub fn new(rows: u32, seats_per_row: u32, passengers: usize) -> Self {
        Self::with_store(MemoryStore::with_latency(ROUND_TRIP), rows, seats_per_row, passengers)
    }

    /// Seed an existing store.
    pub fn with_store(store: MemoryStore, rows: u32, seats_per_row: u32, passengers: usize) -> Self {
        let trip = store.add_trip("SB-TEST", rows, seats_per_row);
        let passengers = (1..=passengers)
            .map(|n| store.add_passenger(format!("Passenger {n}")))
            .collect();
        let layout = SeatLayout {
            rows,
            seats_per_row,
            aisle_after: seats_per_row / 2,
        };
        Self {
            store,
            trip,
            passengers,
            layout,
        }
    }

    /// Booking configuration for this fixture with short backoffs.
    pub fn config(
        &self,
        strategy: LockStrategy,
        isolation: IsolationLevel,
        pool_capacity: usize,
        max_retries: u32,
    ) -> BookingConfig {
        BookingConfig {
            pool_capacity,
            run_deadline_seconds: 60,
            lock_strategy: strategy,
            isolation_level: isolation,
            max_retries,
            conflict_backoff_ms: 5,
            deadlock_backoff_ms: 20,
            layout: self.layout,
        }
    }
}

/// Every seat appears in at most one assigned outcome.
pub fn assert_no_double_assignment(report: &Report) {
    let mut seen: HashSet<SeatId> = HashSet::new();
    for outcome in report.outcomes() {
        if let Some(seat) = outcome.seat() {
            assert!(
                seen.insert(seat.id),
                "seat {} assigned twice in {:?}",
                seat.label,
                report.outcomes()
            );
        }
    }
}

/// Exactly one outcome per passenger.
pub fn assert_complete(report: &Report, passengers: &[Passenger]) {
    assert_eq!(report.outcomes().len(), passengers.len());
    for passenger in passengers {
        let count = report
            .outcomes()
            .iter()
            .filter(|o| o.passenger() == passenger.id)
            .count();
        assert_eq!(count, 1, "passenger {} has {count} outcomes", passenger.id);
    }
}
