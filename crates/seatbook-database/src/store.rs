//! Store connection traits.
//!
//! The engine never talks to a database directly. It opens connections
//! through a [`StoreConnector`] and drives each of them through the
//! operations of [`StoreConnection`]. Locking, isolation and durability are
//! the store's business; the engine only chooses which row lock and
//! isolation level to ask for and reacts to the error kinds it gets back.

use std::time::Duration;

use async_trait::async_trait;

use seatbook_core::result::AppResult;
use seatbook_core::types::{IsolationLevel, PassengerId, RowLock, SeatId, TripId};
use seatbook_entity::{Passenger, Seat, Trip};

/// Opens new store connections.
#[async_trait]
pub trait StoreConnector: Send + Sync + 'static {
    /// Connection type handed out by this connector.
    type Connection: StoreConnection;

    /// Open one new connection. Fails with `Connection` when the store is
    /// unreachable.
    async fn connect(&self) -> AppResult<Self::Connection>;
}

/// One exclusive connection to the booking store.
///
/// Transaction control is explicit: `begin`, then `set_isolation` before any
/// other statement, then exactly one of `commit` or `rollback`.
#[async_trait]
pub trait StoreConnection: Send + 'static {
    /// All passengers, ordered by id.
    async fn list_passengers(&mut self) -> AppResult<Vec<Passenger>>;

    /// The next trip nobody has claimed yet. `NotFound` when none is left.
    async fn next_unclaimed_trip(&mut self) -> AppResult<Trip>;

    /// Mark a trip as claimed by this run. Claiming an already claimed (or
    /// unknown) trip fails with `Conflict`.
    async fn claim_trip(&mut self, trip: TripId) -> AppResult<()>;

    /// Open a transaction.
    async fn begin(&mut self) -> AppResult<()>;

    /// Set the isolation level of the open transaction.
    async fn set_isolation(&mut self, level: IsolationLevel) -> AppResult<()>;

    /// Limit how long any later statement of the open transaction waits for
    /// a row lock. A wait that runs out fails with `Timeout`. Does not count
    /// as a statement for `set_isolation`.
    async fn set_lock_timeout(&mut self, timeout: Duration) -> AppResult<()>;

    /// Select the first unassigned seat of `trip` taking `lock` on it. Does
    /// not modify anything. `NotFound` when no candidate is visible.
    async fn select_seat(&mut self, trip: TripId, lock: RowLock) -> AppResult<Seat>;

    /// Assign `seat` to `passenger` inside the open transaction.
    ///
    /// Uniqueness contract: succeeds only while the seat is unassigned and
    /// the passenger holds no other seat on the same trip. Otherwise fails
    /// with `Conflict`, or `Deadlock` when the store reports a serialization
    /// failure.
    async fn assign_seat(&mut self, passenger: PassengerId, seat: SeatId) -> AppResult<()>;

    /// Commit the open transaction.
    async fn commit(&mut self) -> AppResult<()>;

    /// Roll back the open transaction.
    async fn rollback(&mut self) -> AppResult<()>;

    /// Called when a transaction is dropped without commit or rollback. The
    /// transaction must be rolled back no later than the next `begin`.
    fn abandon_transaction(&mut self);

    /// Close the connection.
    async fn close(self) -> AppResult<()>
    where
        Self: Sized;
}
