//! Booking run configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::types::{IsolationLevel, LockStrategy};

/// Settings for one booking run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingConfig {
    /// Number of store connections the run may hold at once.
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,
    /// Deadline for the whole run, in seconds.
    #[serde(default = "default_run_deadline")]
    pub run_deadline_seconds: u64,
    /// How each transaction selects its seat.
    #[serde(default)]
    pub lock_strategy: LockStrategy,
    /// Isolation level of every booking transaction.
    #[serde(default)]
    pub isolation_level: IsolationLevel,
    /// Attempts per passenger before the booking is given up (at least 1).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Pause before retrying after an ordinary failure, in milliseconds.
    #[serde(default = "default_conflict_backoff")]
    pub conflict_backoff_ms: u64,
    /// Pause before retrying after a deadlock or serialization failure, in
    /// milliseconds. Sized after the store's deadlock detection window.
    #[serde(default = "default_deadlock_backoff")]
    pub deadlock_backoff_ms: u64,
    /// Cabin layout used to place seats on the report grid.
    #[serde(default)]
    pub layout: SeatLayout,
}

impl Default for BookingConfig {
    fn default() -> Self {
        Self {
            pool_capacity: default_pool_capacity(),
            run_deadline_seconds: default_run_deadline(),
            lock_strategy: LockStrategy::default(),
            isolation_level: IsolationLevel::default(),
            max_retries: default_max_retries(),
            conflict_backoff_ms: default_conflict_backoff(),
            deadlock_backoff_ms: default_deadlock_backoff(),
            layout: SeatLayout::default(),
        }
    }
}

impl BookingConfig {
    /// Check the invariants the engine relies on.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.pool_capacity == 0 {
            return Err(AppError::validation("pool_capacity must be greater than 0"));
        }
        if self.max_retries == 0 {
            return Err(AppError::validation("max_retries must be at least 1"));
        }
        if self.run_deadline_seconds == 0 {
            return Err(AppError::validation(
                "run_deadline_seconds must be greater than 0",
            ));
        }
        self.layout.validate()
    }

    /// Deadline for the whole run.
    pub fn run_deadline(&self) -> Duration {
        Duration::from_secs(self.run_deadline_seconds)
    }

    /// Backoff after an ordinary failed attempt.
    pub fn conflict_backoff(&self) -> Duration {
        Duration::from_millis(self.conflict_backoff_ms)
    }

    /// Backoff after a deadlock or serialization failure.
    pub fn deadlock_backoff(&self) -> Duration {
        Duration::from_millis(self.deadlock_backoff_ms)
    }
}

/// Cabin grid: `rows` rows of `seats_per_row` seats, with the aisle after
/// seat number `aisle_after` of each row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatLayout {
    /// Number of seat rows.
    #[serde(default = "default_rows")]
    pub rows: u32,
    /// Seats in each row.
    #[serde(default = "default_seats_per_row")]
    pub seats_per_row: u32,
    /// The aisle follows this seat column (1-based); 0 for no aisle.
    #[serde(default = "default_aisle_after")]
    pub aisle_after: u32,
}

impl Default for SeatLayout {
    fn default() -> Self {
        Self {
            rows: default_rows(),
            seats_per_row: default_seats_per_row(),
            aisle_after: default_aisle_after(),
        }
    }
}

impl SeatLayout {
    /// Total number of grid slots.
    pub fn capacity(&self) -> usize {
        self.rows as usize * self.seats_per_row as usize
    }

    /// Grid slot of a seat at 1-based `row` and `column`, if it is on the grid.
    pub fn slot_index(&self, row: i32, column: i32) -> Option<usize> {
        let row = u32::try_from(row).ok().filter(|r| (1..=self.rows).contains(r))?;
        let column = u32::try_from(column)
            .ok()
            .filter(|c| (1..=self.seats_per_row).contains(c))?;
        Some(((row - 1) * self.seats_per_row + (column - 1)) as usize)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.rows == 0 || self.seats_per_row == 0 {
            return Err(AppError::validation(
                "layout must have at least one row and one seat per row",
            ));
        }
        if self.aisle_after >= self.seats_per_row {
            return Err(AppError::validation(
                "layout.aisle_after must be smaller than seats_per_row",
            ));
        }
        Ok(())
    }
}

fn default_pool_capacity() -> usize {
    10
}

fn default_run_deadline() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    1
}

fn default_conflict_backoff() -> u64 {
    50
}

fn default_deadlock_backoff() -> u64 {
    1000
}

fn default_rows() -> u32 {
    30
}

fn default_seats_per_row() -> u32 {
    6
}

fn default_aisle_after() -> u32 {
    3
}
