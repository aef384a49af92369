//! # seatbook-engine
//!
//! The concurrent seat allocation engine. An [`AllocationOrchestrator`]
//! claims a trip and fans out one booking task per passenger. Tasks share a
//! bounded [`ConnectionPool`], run each attempt in a [`Transaction`] at the
//! configured isolation level, pick seats through the run's
//! [`LockStrategy`](seatbook_core::types::LockStrategy) and retry transient
//! failures under a [`RetryPolicy`]. Outcomes are gathered by a single
//! [`OutcomeCollector`] into a [`Report`].

pub mod orchestrator;
pub mod outcome;
pub mod pool;
pub mod report;
pub mod retry;
pub mod strategy;
pub mod transaction;

pub use orchestrator::AllocationOrchestrator;
pub use outcome::{AttemptRecord, Outcome, OutcomeCollector, OutcomeReporter};
pub use pool::{ConnectionPool, PooledConnection};
pub use report::{Report, SlotAssignment};
pub use retry::{FailureReason, RetryDecision, RetryPolicy};
pub use strategy::SelectSeat;
pub use transaction::Transaction;
