//! Trip entity model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use seatbook_core::types::TripId;

/// A scheduled trip whose seats are handed out by a booking run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Trip {
    /// Unique trip identifier.
    pub id: TripId,
    /// Human-readable trip code (e.g. a flight number).
    pub code: String,
    /// Scheduled departure.
    pub departs_at: Option<DateTime<Utc>>,
}

impl Trip {
    /// Create a trip without a departure time.
    pub fn new(id: impl Into<TripId>, code: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            code: code.into(),
            departs_at: None,
        }
    }
}
