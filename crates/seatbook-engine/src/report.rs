//! Final report of a booking run.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use seatbook_core::config::{BookingConfig, SeatLayout};
use seatbook_core::types::{IsolationLevel, LockStrategy, PassengerId, RunId, SeatId};
use seatbook_entity::Trip;

use crate::outcome::{AttemptRecord, Collected, Outcome};

/// A passenger placed on the seat grid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotAssignment {
    pub passenger: PassengerId,
    pub seat: SeatId,
    pub label: String,
}

/// Read-only view of a finished run: the seat grid plus every outcome.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    run_id: RunId,
    trip: Trip,
    lock_strategy: LockStrategy,
    isolation_level: IsolationLevel,
    pool_capacity: usize,
    /// Most connections checked out at once during the run.
    pool_high_water: usize,
    started_at: DateTime<Utc>,
    elapsed_ms: u64,
    layout: SeatLayout,
    /// Row-major grid, `layout.rows * layout.seats_per_row` slots.
    slots: Vec<Option<SlotAssignment>>,
    /// One outcome per passenger, in passenger order.
    outcomes: Vec<Outcome>,
    /// Every failed attempt, including those that were retried.
    attempt_log: Vec<AttemptRecord>,
}

/// Run facts the report is built from besides the outcomes.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: RunId,
    pub trip: Trip,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub pool_high_water: usize,
}

impl Report {
    /// Build the report, placing every assigned seat on the grid.
    pub fn build(summary: RunSummary, config: &BookingConfig, collected: Collected) -> Self {
        let layout = config.layout;
        let mut slots: Vec<Option<SlotAssignment>> = vec![None; layout.capacity()];

        for outcome in &collected.outcomes {
            let Outcome::Assigned {
                passenger, seat, ..
            } = outcome
            else {
                continue;
            };

            let Some(index) = layout.slot_index(seat.row_no, seat.column_no) else {
                warn!(seat = %seat.label, "Assigned seat lies outside the configured layout");
                continue;
            };
            if let Some(existing) = &slots[index] {
                warn!(
                    seat = %seat.label,
                    first = %existing.passenger,
                    second = %passenger,
                    "Seat reported assigned to two passengers"
                );
                continue;
            }
            slots[index] = Some(SlotAssignment {
                passenger: *passenger,
                seat: seat.id,
                label: seat.label.clone(),
            });
        }

        Self {
            run_id: summary.run_id,
            trip: summary.trip,
            lock_strategy: config.lock_strategy,
            isolation_level: config.isolation_level,
            pool_capacity: config.pool_capacity,
            pool_high_water: summary.pool_high_water,
            started_at: summary.started_at,
            elapsed_ms: u64::try_from(summary.elapsed.as_millis()).unwrap_or(u64::MAX),
            layout,
            slots,
            outcomes: collected.outcomes,
            attempt_log: collected.attempt_log,
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn trip(&self) -> &Trip {
        &self.trip
    }

    pub fn lock_strategy(&self) -> LockStrategy {
        self.lock_strategy
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn pool_capacity(&self) -> usize {
        self.pool_capacity
    }

    /// Most connections checked out at once during the run.
    pub fn pool_high_water(&self) -> usize {
        self.pool_high_water
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn layout(&self) -> SeatLayout {
        self.layout
    }

    /// Row-major grid slots.
    pub fn slots(&self) -> &[Option<SlotAssignment>] {
        &self.slots
    }

    /// One outcome per passenger, in passenger order.
    pub fn outcomes(&self) -> &[Outcome] {
        &self.outcomes
    }

    /// Every failed attempt, including those that were retried.
    pub fn attempt_log(&self) -> &[AttemptRecord] {
        &self.attempt_log
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }

    /// Grid slots marked occupied.
    pub fn occupied_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn assigned_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_assigned()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.len() - self.assigned_count()
    }

    /// Slot at 1-based `row` and `column`.
    pub fn slot(&self, row: i32, column: i32) -> Option<&SlotAssignment> {
        self.layout
            .slot_index(row, column)
            .and_then(|index| self.slots[index].as_ref())
    }

    /// Grid rows, front to back.
    pub fn rows(&self) -> impl Iterator<Item = &[Option<SlotAssignment>]> {
        self.slots.chunks(self.layout.seats_per_row.max(1) as usize)
    }

    pub fn outcome_for(&self, passenger: PassengerId) -> Option<&Outcome> {
        self.outcomes.iter().find(|o| o.passenger() == passenger)
    }
}
