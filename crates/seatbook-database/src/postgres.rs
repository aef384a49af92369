//! PostgreSQL store over raw `sqlx` connections.
//!
//! Each [`PgStoreConnection`] wraps one `PgConnection`. Transactions are
//! driven with explicit `BEGIN` / `SET TRANSACTION` / `COMMIT` / `ROLLBACK`
//! statements so the isolation level is set before the first query runs,
//! and row locking is left entirely to PostgreSQL.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::Connection;
use tracing::{debug, info, warn};

use seatbook_core::config::DatabaseConfig;
use seatbook_core::error::AppError;
use seatbook_core::result::AppResult;
use seatbook_core::types::{IsolationLevel, PassengerId, RowLock, SeatId, TripId};
use seatbook_entity::{Passenger, Seat, Trip};

use crate::error::store_error;
use crate::store::{StoreConnection, StoreConnector};

/// Opens PostgreSQL connections from a [`DatabaseConfig`].
#[derive(Debug, Clone)]
pub struct PgConnector {
    options: PgConnectOptions,
    connect_timeout: Duration,
}

impl PgConnector {
    /// Create a connector from configuration.
    pub fn new(config: &DatabaseConfig) -> AppResult<Self> {
        let options = config.url.parse::<PgConnectOptions>().map_err(|e| {
            AppError::configuration(format!(
                "Invalid database URL '{}': {e}",
                mask_password(&config.url)
            ))
        })?;

        info!(
            url = %mask_password(&config.url),
            connect_timeout_seconds = config.connect_timeout_seconds,
            "PostgreSQL connector configured"
        );

        Ok(Self {
            options,
            connect_timeout: Duration::from_secs(config.connect_timeout_seconds),
        })
    }
}

#[async_trait]
impl StoreConnector for PgConnector {
    type Connection = PgStoreConnection;

    async fn connect(&self) -> AppResult<PgStoreConnection> {
        let connecting = PgConnection::connect_with(&self.options);
        let conn = tokio::time::timeout(self.connect_timeout, connecting)
            .await
            .map_err(|_| {
                AppError::connection(format!(
                    "Timed out connecting to PostgreSQL after {:?}",
                    self.connect_timeout
                ))
            })?
            .map_err(|e| store_error("Failed to connect to PostgreSQL", e))?;

        debug!("Opened PostgreSQL connection");
        Ok(PgStoreConnection {
            conn,
            abandoned: false,
        })
    }
}

/// One PostgreSQL connection used by the booking engine.
#[derive(Debug)]
pub struct PgStoreConnection {
    conn: PgConnection,
    /// A transaction was dropped without commit or rollback.
    abandoned: bool,
}

impl PgStoreConnection {
    /// Return the underlying connection, e.g. for fixtures in tests.
    pub fn inner_mut(&mut self) -> &mut PgConnection {
        &mut self.conn
    }

    async fn execute(&mut self, sql: &str, context: &str) -> AppResult<()> {
        sqlx::query(sql)
            .execute(&mut self.conn)
            .await
            .map(|_| ())
            .map_err(|e| store_error(context, e))
    }
}

#[async_trait]
impl StoreConnection for PgStoreConnection {
    async fn list_passengers(&mut self) -> AppResult<Vec<Passenger>> {
        sqlx::query_as::<_, Passenger>("SELECT id, name FROM passengers ORDER BY id")
            .fetch_all(&mut self.conn)
            .await
            .map_err(|e| store_error("Failed to list passengers", e))
    }

    async fn next_unclaimed_trip(&mut self) -> AppResult<Trip> {
        sqlx::query_as::<_, Trip>(
            "SELECT id, code, departs_at FROM trips \
             WHERE claimed_at IS NULL \
             ORDER BY departs_at NULLS LAST, id \
             LIMIT 1",
        )
        .fetch_optional(&mut self.conn)
        .await
        .map_err(|e| store_error("Failed to find next trip", e))?
        .ok_or_else(|| AppError::not_found("No unclaimed trip left"))
    }

    async fn claim_trip(&mut self, trip: TripId) -> AppResult<()> {
        let result = sqlx::query(
            "UPDATE trips SET claimed_at = NOW() WHERE id = $1 AND claimed_at IS NULL",
        )
        .bind(trip)
        .execute(&mut self.conn)
        .await
        .map_err(|e| store_error("Failed to claim trip", e))?;

        if result.rows_affected() == 0 {
            return Err(AppError::conflict(format!(
                "Trip {trip} is already claimed or does not exist"
            )));
        }
        Ok(())
    }

    async fn begin(&mut self) -> AppResult<()> {
        if self.abandoned {
            warn!("Rolling back abandoned transaction before BEGIN");
            self.execute("ROLLBACK", "Failed to roll back abandoned transaction")
                .await?;
            self.abandoned = false;
        }
        self.execute("BEGIN", "Failed to start transaction").await
    }

    async fn set_isolation(&mut self, level: IsolationLevel) -> AppResult<()> {
        let sql = format!("SET TRANSACTION ISOLATION LEVEL {}", level.as_sql());
        self.execute(&sql, "Failed to set isolation level").await
    }

    async fn set_lock_timeout(&mut self, timeout: Duration) -> AppResult<()> {
        let sql = lock_timeout_statement(timeout);
        self.execute(&sql, "Failed to set lock timeout").await
    }

    async fn select_seat(&mut self, trip: TripId, lock: RowLock) -> AppResult<Seat> {
        let sql = format!(
            "SELECT id, trip_id, label, row_no, column_no FROM seats \
             WHERE trip_id = $1 AND passenger_id IS NULL \
             ORDER BY id \
             LIMIT 1 {}",
            lock.sql_clause()
        );

        sqlx::query_as::<_, Seat>(&sql)
            .bind(trip)
            .fetch_optional(&mut self.conn)
            .await
            .map_err(|e| store_error("Failed to select seat", e))?
            .ok_or_else(|| AppError::not_found(format!("No free seat visible on trip {trip}")))
    }

    async fn assign_seat(&mut self, passenger: PassengerId, seat: SeatId) -> AppResult<()> {
        let result = sqlx::query(
            "UPDATE seats SET passenger_id = $1 WHERE id = $2 AND passenger_id IS NULL",
        )
        .bind(passenger)
        .bind(seat)
        .execute(&mut self.conn)
        .await
        .map_err(|e| store_error("Failed to assign seat", e))?;

        if result.rows_affected() == 0 {
            return Err(AppError::conflict(format!(
                "Seat {seat} was assigned by a concurrent transaction"
            )));
        }
        Ok(())
    }

    async fn commit(&mut self) -> AppResult<()> {
        self.execute("COMMIT", "Failed to commit transaction").await
    }

    async fn rollback(&mut self) -> AppResult<()> {
        self.abandoned = false;
        self.execute("ROLLBACK", "Failed to roll back transaction").await
    }

    fn abandon_transaction(&mut self) {
        self.abandoned = true;
    }

    async fn close(self) -> AppResult<()> {
        self.conn
            .close()
            .await
            .map_err(|e| store_error("Failed to close PostgreSQL connection", e))
    }
}

/// `SET LOCAL lock_timeout` for the rest of the open transaction. Rounded
/// up to at least one millisecond since zero disables the timeout.
fn lock_timeout_statement(timeout: Duration) -> String {
    let millis = timeout.as_millis().max(1);
    format!("SET LOCAL lock_timeout = '{millis}ms'")
}

/// Mask the password portion of a database URL for safe logging.
fn mask_password(url: &str) -> String {
    if let Some(at_pos) = url.find('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            let scheme_end = url.find("://").map(|p| p + 3).unwrap_or(0);
            if colon_pos > scheme_end {
                return format!("{}:****@{}", &url[..colon_pos], &url[at_pos + 1..]);
            }
        }
    }
    url.to_string()
}
