//! Seat entity model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use seatbook_core::types::{SeatId, TripId};

/// A seat on a trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Seat {
    /// Unique seat row identifier.
    pub id: SeatId,
    /// Trip the seat belongs to.
    pub trip_id: TripId,
    /// External seat key printed on the boarding pass (e.g. `"12C"`).
    pub label: String,
    /// 1-based cabin row.
    pub row_no: i32,
    /// 1-based position within the row.
    pub column_no: i32,
}

impl Seat {
    /// Create a seat, deriving its label from row and column (`1A`, `1B`, ...).
    pub fn new(
        id: impl Into<SeatId>,
        trip_id: impl Into<TripId>,
        row_no: i32,
        column_no: i32,
    ) -> Self {
        Self {
            id: id.into(),
            trip_id: trip_id.into(),
            label: seat_label(row_no, column_no),
            row_no,
            column_no,
        }
    }
}

/// Conventional seat label: row number followed by a column letter.
pub fn seat_label(row_no: i32, column_no: i32) -> String {
    let letter = u8::try_from(column_no - 1)
        .ok()
        .filter(|offset| *offset < 26)
        .map(|offset| char::from(b'A' + offset))
        .unwrap_or('?');
    format!("{row_no}{letter}")
}
