//! # seatbook-database
//!
//! The booking store seam ([`StoreConnector`] / [`StoreConnection`]) and
//! its implementations: PostgreSQL over a raw `sqlx` connection, and an
//! in-memory store for single-node runs and tests.

pub mod error;
pub mod memory;
pub mod migration;
pub mod postgres;
pub mod store;

pub use memory::{FaultPoint, MemoryConnection, MemoryStore, StoreStats};
pub use postgres::{PgConnector, PgStoreConnection};
pub use store::{StoreConnection, StoreConnector};
