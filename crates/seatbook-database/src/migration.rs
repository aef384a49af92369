//! Database migration runner.

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use seatbook_core::config::DatabaseConfig;
use seatbook_core::error::{AppError, ErrorKind};

use crate::error::store_error;

/// Run all pending database migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<(), AppError> {
    info!("Running database migrations...");

    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .map_err(|e| {
            AppError::with_source(
                ErrorKind::Database,
                format!("Failed to run migrations: {e}"),
                e,
            )
        })?;

    info!("Database migrations completed successfully");
    Ok(())
}

/// Connect with a single-connection pool, migrate, and disconnect.
pub async fn migrate(config: &DatabaseConfig) -> Result<(), AppError> {
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
        .connect(&config.url)
        .await
        .map_err(|e| store_error("Failed to connect for migrations", e))?;

    let result = run_migrations(&pool).await;
    pool.close().await;
    result
}
