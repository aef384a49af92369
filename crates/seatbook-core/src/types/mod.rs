//! Shared domain types.

pub mod id;
pub mod isolation;
pub mod lock;

pub use id::{PassengerId, RunId, SeatId, TripId};
pub use isolation::IsolationLevel;
pub use lock::{LockStrategy, RowLock, RowLockMode};
