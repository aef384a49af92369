//! Transaction isolation levels.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Isolation level a booking transaction runs at.
///
/// `READ UNCOMMITTED` is not offered: PostgreSQL treats it as
/// `READ COMMITTED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// Each statement sees data committed before it began.
    #[default]
    ReadCommitted,
    /// All statements see the snapshot taken by the first statement.
    RepeatableRead,
    /// Repeatable read plus predicate-level conflict detection.
    Serializable,
}

impl IsolationLevel {
    /// Every supported isolation level, weakest first.
    pub const ALL: [IsolationLevel; 3] = [
        Self::ReadCommitted,
        Self::RepeatableRead,
        Self::Serializable,
    ];

    /// The level as it appears in `SET TRANSACTION ISOLATION LEVEL ...`.
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }

    /// Whether the whole transaction reads from one snapshot.
    pub fn uses_transaction_snapshot(&self) -> bool {
        !matches!(self, Self::ReadCommitted)
    }

    /// Return the level as a snake_case string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadCommitted => "read_committed",
            Self::RepeatableRead => "repeatable_read",
            Self::Serializable => "serializable",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for IsolationLevel {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|level| {
                level.as_str().eq_ignore_ascii_case(s) || level.as_sql().eq_ignore_ascii_case(s)
            })
            .ok_or_else(|| AppError::validation(format!("Unknown isolation level '{s}'")))
    }
}
