//! Seat-selection lock strategies and the row locks they request.
//!
//! A [`LockStrategy`] is a run-wide choice of how a booking transaction
//! picks "the next free seat". The store never sees the strategy itself,
//! only the [`RowLock`] it maps to: which native row lock to take on the
//! candidate row, and whether rows locked by others are skipped instead of
//! waited for.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Native row lock mode requested from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowLockMode {
    /// Plain read, no row lock.
    None,
    /// Shared row lock (`FOR SHARE`).
    Share,
    /// Exclusive row lock (`FOR UPDATE`).
    Update,
}

/// Row lock requested when selecting a candidate seat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RowLock {
    /// Lock mode taken on the selected row.
    pub mode: RowLockMode,
    /// Skip rows another transaction holds a conflicting lock on.
    pub skip_locked: bool,
}

impl RowLock {
    /// Locking clause appended to the selection query.
    pub fn sql_clause(&self) -> &'static str {
        match (self.mode, self.skip_locked) {
            (RowLockMode::None, _) => "",
            (RowLockMode::Share, false) => "FOR SHARE",
            (RowLockMode::Share, true) => "FOR SHARE SKIP LOCKED",
            (RowLockMode::Update, false) => "FOR UPDATE",
            (RowLockMode::Update, true) => "FOR UPDATE SKIP LOCKED",
        }
    }
}

/// How a booking transaction selects its seat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStrategy {
    /// Read the first free seat without locking it. Concurrent tasks may
    /// pick the same seat and only find out when assigning it.
    NoLock,
    /// Shared lock on the first free seat; waits for exclusive holders.
    SharedLock,
    /// Shared lock, skipping seats held exclusively by others.
    SharedLockSkipped,
    /// Exclusive lock on the first free seat; waits for any holder.
    #[default]
    ExclusiveLock,
    /// Exclusive lock, skipping seats locked by others.
    ExclusiveLockSkipped,
}

impl LockStrategy {
    /// Every strategy, in declaration order.
    pub const ALL: [LockStrategy; 5] = [
        Self::NoLock,
        Self::SharedLock,
        Self::SharedLockSkipped,
        Self::ExclusiveLock,
        Self::ExclusiveLockSkipped,
    ];

    /// The row lock this strategy asks the store for.
    pub fn row_lock(&self) -> RowLock {
        let (mode, skip_locked) = match self {
            Self::NoLock => (RowLockMode::None, false),
            Self::SharedLock => (RowLockMode::Share, false),
            Self::SharedLockSkipped => (RowLockMode::Share, true),
            Self::ExclusiveLock => (RowLockMode::Update, false),
            Self::ExclusiveLockSkipped => (RowLockMode::Update, true),
        };
        RowLock { mode, skip_locked }
    }

    /// Whether selection can block behind another transaction's lock.
    pub fn may_block(&self) -> bool {
        matches!(self, Self::SharedLock | Self::ExclusiveLock)
    }

    /// Return the strategy as a snake_case string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoLock => "no_lock",
            Self::SharedLock => "shared_lock",
            Self::SharedLockSkipped => "shared_lock_skipped",
            Self::ExclusiveLock => "exclusive_lock",
            Self::ExclusiveLockSkipped => "exclusive_lock_skipped",
        }
    }
}

impl fmt::Display for LockStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for LockStrategy {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str().eq_ignore_ascii_case(&normalized))
            .ok_or_else(|| AppError::validation(format!("Unknown lock strategy '{s}'")))
    }
}
