//! Convenience result type alias for seatbook.

use crate::error::AppError;

/// A specialized `Result` type for seatbook operations.
pub type AppResult<T> = Result<T, AppError>;
