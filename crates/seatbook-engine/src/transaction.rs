//! Store transactions with an explicit isolation level.

use std::time::Duration;

use tracing::{debug, warn};

use seatbook_core::result::AppResult;
use seatbook_core::types::IsolationLevel;
use seatbook_database::StoreConnection;

/// An open transaction on a borrowed store connection.
///
/// `commit` and `rollback` consume the transaction, so at most one of them
/// runs. A transaction dropped without either is abandoned: the connection
/// rolls it back before it is used again.
#[derive(Debug)]
pub struct Transaction<'c, C: StoreConnection> {
    conn: &'c mut C,
    isolation: IsolationLevel,
    finished: bool,
}

impl<'c, C: StoreConnection> Transaction<'c, C> {
    /// Open a transaction and set its isolation level before any statement.
    ///
    /// If the isolation level cannot be set the transaction is rolled back
    /// and the original error returned.
    pub async fn begin(conn: &'c mut C, isolation: IsolationLevel) -> AppResult<Self> {
        conn.begin().await?;

        if let Err(e) = conn.set_isolation(isolation).await {
            if let Err(rollback_err) = conn.rollback().await {
                warn!(
                    error = %rollback_err,
                    "Rollback after failed isolation setup also failed"
                );
                conn.abandon_transaction();
            }
            return Err(e);
        }

        debug!(isolation = %isolation, "Transaction started");
        Ok(Self {
            conn,
            isolation,
            finished: false,
        })
    }

    /// Isolation level the transaction runs at.
    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    /// Make row lock waits of later statements fail with `Timeout` after
    /// `timeout`, on the store side.
    pub async fn limit_lock_waits(&mut self, timeout: Duration) -> AppResult<()> {
        self.conn.set_lock_timeout(timeout).await
    }

    /// The connection, for statements inside the transaction.
    pub fn connection(&mut self) -> &mut C {
        self.conn
    }

    pub async fn commit(mut self) -> AppResult<()> {
        self.finished = true;
        self.conn.commit().await
    }

    pub async fn rollback(mut self) -> AppResult<()> {
        self.finished = true;
        self.conn.rollback().await
    }
}

impl<C: StoreConnection> Drop for Transaction<'_, C> {
    fn drop(&mut self) {
        if !self.finished {
            warn!("Transaction dropped without commit or rollback");
            self.conn.abandon_transaction();
        }
    }
}

#[cfg(test)]
mod tests {
    use seatbook_core::ErrorKind;
    use seatbook_core::types::LockStrategy;
    use seatbook_database::{FaultPoint, MemoryStore, StoreConnector};

    use super::*;

    #[tokio::test]
    async fn test_commit_ends_transaction() {
        let store = MemoryStore::new();
        let mut conn = store.connect().await.unwrap();

        let tx = Transaction::begin(&mut conn, IsolationLevel::Serializable)
            .await
            .unwrap();
        assert_eq!(tx.isolation(), IsolationLevel::Serializable);
        assert_eq!(store.stats().open_transactions, 1);
        tx.commit().await.unwrap();

        assert_eq!(store.stats().open_transactions, 0);
        assert_eq!(store.stats().commits, 1);
    }

    #[tokio::test]
    async fn test_dropped_transaction_is_rolled_back() {
        let store = MemoryStore::new();
        let mut conn = store.connect().await.unwrap();

        {
            let _tx = Transaction::begin(&mut conn, IsolationLevel::ReadCommitted)
                .await
                .unwrap();
        }

        assert_eq!(store.stats().open_transactions, 0);
        assert_eq!(store.stats().rollbacks, 1);
        assert!(Transaction::begin(&mut conn, IsolationLevel::ReadCommitted)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_begin_failure_leaves_no_transaction() {
        let store = MemoryStore::new();
        store.inject_fault(FaultPoint::Begin, ErrorKind::Connection, 1);
        let mut conn = store.connect().await.unwrap();

        let err = Transaction::begin(&mut conn, IsolationLevel::ReadCommitted)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Connection);
        assert_eq!(store.stats().open_transactions, 0);
    }

    #[tokio::test]
    async fn test_isolation_failure_rolls_back() {
        let store = MemoryStore::new();
        store.inject_fault(FaultPoint::SetIsolation, ErrorKind::Database, 1);
        let mut conn = store.connect().await.unwrap();

        let err = Transaction::begin(&mut conn, IsolationLevel::Serializable)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Database);
        assert_eq!(store.stats().rollbacks, 1);
        assert_eq!(store.stats().open_transactions, 0);
        assert!(Transaction::begin(&mut conn, IsolationLevel::Serializable)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_isolation_failure_abandons_when_rollback_fails() {
        let store = MemoryStore::new();
        store.inject_fault(FaultPoint::SetIsolation, ErrorKind::Database, 1);
        store.inject_fault(FaultPoint::Rollback, ErrorKind::Connection, 1);
        let mut conn = store.connect().await.unwrap();

        let err = Transaction::begin(&mut conn, IsolationLevel::RepeatableRead)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Database);
        assert_eq!(store.stats().rollbacks, 1);
        assert_eq!(store.stats().open_transactions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_wait_limit_applies_to_statements() {
        let store = MemoryStore::new();
        let trip = store.add_trip("SB300", 1, 1);
        let lock = LockStrategy::ExclusiveLock.row_lock();
        let mut holder = store.connect().await.unwrap();
        let mut conn = store.connect().await.unwrap();

        let mut held = Transaction::begin(&mut holder, IsolationLevel::ReadCommitted)
            .await
            .unwrap();
        held.connection().select_seat(trip.id, lock).await.unwrap();

        let mut tx = Transaction::begin(&mut conn, IsolationLevel::ReadCommitted)
            .await
            .unwrap();
        tx.limit_lock_waits(Duration::from_millis(40)).await.unwrap();
        let err = tx
            .connection()
            .select_seat(trip.id, lock)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        tx.rollback().await.unwrap();
        held.rollback().await.unwrap();
    }
}
