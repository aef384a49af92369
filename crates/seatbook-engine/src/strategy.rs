//! Seat selection under the run's lock strategy.
//!
//! Every [`LockStrategy`] variant implements [`SelectSeat`] by asking the
//! store for the first free seat with the matching [`RowLock`]. Locking,
//! waiting and skipping are done by the store.
//!
//! [`RowLock`]: seatbook_core::types::RowLock

use async_trait::async_trait;
use tracing::trace;

use seatbook_core::result::AppResult;
use seatbook_core::types::{LockStrategy, TripId};
use seatbook_database::StoreConnection;
use seatbook_entity::Seat;

use crate::transaction::Transaction;

/// Picks the next free seat of a trip inside an open transaction.
///
/// Implementations return exactly one currently unassigned seat, or fail
/// with `NotFound` (nothing visible) or the store's conflict error. They
/// never modify store state.
#[async_trait]
pub trait SelectSeat: Send + Sync {
    async fn select_seat<C: StoreConnection>(
        &self,
        tx: &mut Transaction<'_, C>,
        trip: TripId,
    ) -> AppResult<Seat>;
}

#[async_trait]
impl SelectSeat for LockStrategy {
    async fn select_seat<C: StoreConnection>(
        &self,
        tx: &mut Transaction<'_, C>,
        trip: TripId,
    ) -> AppResult<Seat> {
        let lock = self.row_lock();
        let seat = tx.connection().select_seat(trip, lock).await?;
        trace!(strategy = %self, seat = %seat.label, "Seat candidate selected");
        Ok(seat)
    }
}
