//! Fixed-size store connection pool.
//!
//! All connections are opened up front. A FIFO semaphore with one permit
//! per idle connection throttles [`ConnectionPool::acquire`]; the
//! connection itself lives behind an owned async mutex so a
//! [`PooledConnection`] can hand out `&mut C` without leaving the pool.
//!
//! A [`PooledConnection`] returns itself to the pool when dropped, so every
//! exit path of a task (success, error, panic, cancellation) gives the slot
//! back.

use std::collections::HashSet;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, Semaphore};
use tracing::{debug, info, warn};

use seatbook_core::error::AppError;
use seatbook_core::result::AppResult;
use seatbook_database::{StoreConnection, StoreConnector};

/// Bounded pool of store connections.
pub struct ConnectionPool<C: StoreConnection> {
    shared: Arc<PoolShared<C>>,
}

impl<C: StoreConnection> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: StoreConnection> fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("capacity", &self.capacity())
            .field("outstanding", &self.outstanding())
            .field("high_water", &self.high_water())
            .finish()
    }
}

struct PoolShared<C> {
    capacity: usize,
    permits: Semaphore,
    inner: Mutex<PoolInner<C>>,
    high_water: AtomicUsize,
}

struct PoolInner<C> {
    slots: Vec<Arc<AsyncMutex<C>>>,
    idle: Vec<usize>,
    checked_out: HashSet<usize>,
}

impl<C> PoolShared<C> {
    fn inner(&self) -> MutexGuard<'_, PoolInner<C>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Put a checked out slot back and wake one waiter.
    fn check_in(&self, slot: usize) -> AppResult<()> {
        {
            let mut inner = self.inner();
            if !inner.checked_out.remove(&slot) {
                return Err(AppError::contract_violation(format!(
                    "connection slot {slot} released twice"
                )));
            }
            inner.idle.push(slot);
        }
        self.permits.add_permits(1);
        Ok(())
    }
}

impl<C: StoreConnection> ConnectionPool<C> {
    /// Open a pool of `capacity` connections.
    ///
    /// Connections are opened eagerly. If any of them fails, the ones
    /// already opened are closed and the error is returned.
    pub async fn open<K>(connector: &K, capacity: usize) -> AppResult<Self>
    where
        K: StoreConnector<Connection = C>,
    {
        if capacity == 0 {
            return Err(AppError::validation("pool capacity must be greater than 0"));
        }

        let mut opened = Vec::with_capacity(capacity);
        for index in 0..capacity {
            match connector.connect().await {
                Ok(conn) => opened.push(conn),
                Err(e) => {
                    warn!(
                        opened = index,
                        capacity,
                        error = %e,
                        "Connection pool construction failed, closing opened connections"
                    );
                    for conn in opened {
                        if let Err(close_err) = conn.close().await {
                            debug!(error = %close_err, "Failed to close connection");
                        }
                    }
                    return Err(e);
                }
            }
        }

        info!(capacity, "Connection pool opened");

        let slots = opened
            .into_iter()
            .map(|conn| Arc::new(AsyncMutex::new(conn)))
            .collect();
        Ok(Self {
            shared: Arc::new(PoolShared {
                capacity,
                permits: Semaphore::new(capacity),
                inner: Mutex::new(PoolInner {
                    slots,
                    idle: (0..capacity).rev().collect(),
                    checked_out: HashSet::with_capacity(capacity),
                }),
                high_water: AtomicUsize::new(0),
            }),
        })
    }

    /// Wait for a free connection.
    ///
    /// Waiters are served in FIFO order. Cancel safe: dropping the future
    /// never loses a slot.
    pub async fn acquire(&self) -> AppResult<PooledConnection<C>> {
        let permit = self
            .shared
            .permits
            .acquire()
            .await
            .map_err(|_| AppError::contract_violation("connection pool is closed"))?;

        let (slot, conn) = {
            let mut inner = self.shared.inner();
            let Some(slot) = inner.idle.pop() else {
                return Err(AppError::internal(
                    "connection pool granted a permit without an idle connection",
                ));
            };
            inner.checked_out.insert(slot);
            self.shared
                .high_water
                .fetch_max(inner.checked_out.len(), Ordering::Relaxed);
            (slot, Arc::clone(&inner.slots[slot]))
        };
        permit.forget();

        let checkout = Checkout {
            pool: Arc::clone(&self.shared),
            slot,
            returned: false,
        };
        let conn = conn.lock_owned().await;
        Ok(PooledConnection { conn, checkout })
    }

    /// Return a connection to the pool.
    ///
    /// Fails with `ContractViolation` if the connection belongs to another
    /// pool; that connection is still returned to its own pool.
    pub fn release(&self, conn: PooledConnection<C>) -> AppResult<()> {
        if !Arc::ptr_eq(&conn.checkout.pool, &self.shared) {
            return Err(AppError::contract_violation(
                "released a connection that was not acquired from this pool",
            ));
        }
        let PooledConnection { conn, checkout } = conn;
        drop(conn);
        checkout.check_in()
    }

    /// Close every connection.
    ///
    /// Fails with `ContractViolation`, leaving the pool untouched, while any
    /// connection is still checked out. Otherwise all connections are
    /// closed and the first close error, if any, is returned.
    pub async fn close(self) -> AppResult<()> {
        let slots = {
            let mut inner = self.shared.inner();
            if !inner.checked_out.is_empty() {
                return Err(AppError::contract_violation(format!(
                    "cannot close connection pool with {} connection(s) checked out",
                    inner.checked_out.len()
                )));
            }
            self.shared.permits.close();
            inner.idle.clear();
            std::mem::take(&mut inner.slots)
        };

        let mut first_error = None;
        for slot in slots {
            let Ok(conn) = Arc::try_unwrap(slot) else {
                warn!("Connection still referenced at pool close, dropping it");
                continue;
            };
            if let Err(e) = conn.into_inner().close().await {
                warn!(error = %e, "Failed to close pooled connection");
                first_error.get_or_insert(e);
            }
        }

        info!(high_water = self.high_water(), "Connection pool closed");
        first_error.map_or(Ok(()), Err)
    }

    /// Number of connections the pool owns.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Connections currently checked out.
    pub fn outstanding(&self) -> usize {
        self.shared.inner().checked_out.len()
    }

    /// Connections currently idle.
    pub fn available(&self) -> usize {
        self.shared.inner().idle.len()
    }

    /// Highest number of connections ever checked out at once.
    pub fn high_water(&self) -> usize {
        self.shared.high_water.load(Ordering::Relaxed)
    }
}

/// Marks one slot as checked out until returned or dropped.
struct Checkout<C> {
    pool: Arc<PoolShared<C>>,
    slot: usize,
    returned: bool,
}

impl<C> Checkout<C> {
    fn check_in(mut self) -> AppResult<()> {
        self.returned = true;
        self.pool.check_in(self.slot)
    }
}

impl<C> Drop for Checkout<C> {
    fn drop(&mut self) {
        if self.returned {
            return;
        }
        if let Err(e) = self.pool.check_in(self.slot) {
            warn!(slot = self.slot, error = %e, "Failed to return connection to pool");
        }
    }
}

/// A connection checked out of a [`ConnectionPool`].
pub struct PooledConnection<C: StoreConnection> {
    // Field order matters: the connection is unlocked before the slot is
    // marked idle again.
    conn: OwnedMutexGuard<C>,
    checkout: Checkout<C>,
}

impl<C: StoreConnection> PooledConnection<C> {
    /// Pool slot this connection occupies.
    pub fn slot(&self) -> usize {
        self.checkout.slot
    }
}

impl<C: StoreConnection> Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.conn
    }
}

impl<C: StoreConnection> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.conn
    }
}

impl<C: StoreConnection> fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("slot", &self.checkout.slot)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use seatbook_core::ErrorKind;
    use seatbook_database::MemoryStore;

    use super::*;

    #[tokio::test]
    async fn test_open_rejects_zero_capacity() {
        let store = MemoryStore::new();
        let err = ConnectionPool::open(&store, 0).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_open_failure_closes_opened_connections() {
        let store = MemoryStore::new();
        store.fail_connections_after(2);

        let err = ConnectionPool::open(&store, 3).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Connection);
        assert_eq!(store.stats().connects, 2);
        assert_eq!(store.stats().open_connections, 0);
    }

    #[tokio::test]
    async fn test_acquire_release_accounting() {
        let store = MemoryStore::new();
        let pool = ConnectionPool::open(&store, 2).await.unwrap();

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_ne!(a.slot(), b.slot());
        assert_eq!(pool.outstanding(), 2);
        assert_eq!(pool.available(), 0);

        pool.release(a).unwrap();
        drop(b);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.high_water(), 2);

        pool.close().await.unwrap();
        assert_eq!(store.stats().open_connections, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_blocks_until_release() {
        let store = MemoryStore::new();
        let pool = ConnectionPool::open(&store, 1).await.unwrap();
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|c| c.slot()) })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(held);
        assert_eq!(waiter.await.unwrap().unwrap(), 0);
        assert_eq!(pool.high_water(), 1);
    }

    #[tokio::test]
    async fn test_release_foreign_connection_is_contract_violation() {
        let store = MemoryStore::new();
        let pool = ConnectionPool::open(&store, 1).await.unwrap();
        let other = ConnectionPool::open(&store, 1).await.unwrap();

        let foreign = other.acquire().await.unwrap();
        let err = pool.release(foreign).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ContractViolation);
        assert_eq!(other.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_double_check_in_is_detected() {
        let store = MemoryStore::new();
        let pool = ConnectionPool::open(&store, 1).await.unwrap();
        let conn = pool.acquire().await.unwrap();
        let slot = conn.slot();
        pool.release(conn).unwrap();

        let err = pool.shared.check_in(slot).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ContractViolation);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_close_with_outstanding_connection_fails() {
        let store = MemoryStore::new();
        let pool = ConnectionPool::open(&store, 1).await.unwrap();
        let conn = pool.acquire().await.unwrap();

        let err = pool.clone().close().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ContractViolation);

        drop(conn);
        pool.clone().close().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ContractViolation);
    }
}
