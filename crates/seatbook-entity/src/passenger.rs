//! Passenger entity model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use seatbook_core::types::PassengerId;

/// A passenger waiting for a seat. Loaded once per run and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Passenger {
    /// Unique passenger identifier.
    pub id: PassengerId,
    /// Display name.
    pub name: String,
}

impl Passenger {
    /// Create a passenger.
    pub fn new(id: impl Into<PassengerId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}
