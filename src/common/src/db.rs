//! Database access for the engine's persisted state.
//!
//! The store sees one writer (the persister task) plus a burst of reads at
//! startup recovery, so the pool stays small and acquisition is bounded: a
//! saturated pool should fail a write loudly rather than queue it behind a
//! stuck connection.

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;

use crate::Config;

/// Connections for one persister plus recovery reads.
const POOL_SIZE: u32 = 4;
/// Bound on waiting for a pooled connection.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);
/// Bound on the initial connection attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// The tables this service owns.
const TABLES: [&str; 3] = ["positions", "trade_records", "window_snapshots"];

#[derive(Debug, Error)]
pub enum DbError {
    #[error("Database connection failed: {0}")]
    Connect(sqlx::Error),

    #[error("Schema initialisation failed: {0}")]
    Schema(sqlx::Error),

    #[error("Store unhealthy: {0}")]
    Unhealthy(String),
}

/// Handle to the engine's Postgres store.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Open the pool. Fails fast: a store that cannot be reached at startup
    /// means the engine refuses to start.
    pub async fn connect(config: &Config) -> Result<Self, DbError> {
        let pool = PgPoolOptions::new()
            .max_connections(POOL_SIZE)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(&config.database_url)
            .await
            .map_err(DbError::Connect)?;

        // The pool connects lazily per connection; force one real round trip
        // so startup surfaces bad credentials or an unreachable host.
        tokio::time::timeout(CONNECT_TIMEOUT, sqlx::query("SELECT 1").execute(&pool))
            .await
            .map_err(|_| DbError::Unhealthy("connect probe timed out".to_string()))?
            .map_err(DbError::Connect)?;

        Ok(Self { pool })
    }

    /// The pool, for repository functions.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the engine's tables if they do not exist. Idempotent; run once
    /// at startup before recovery reads.
    pub async fn ensure_schema(&self) -> Result<(), DbError> {
        for statement in [
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                id UUID PRIMARY KEY,
                asset TEXT NOT NULL,
                side TEXT NOT NULL,
                token_id TEXT NOT NULL,
                entry_price NUMERIC NOT NULL,
                shares NUMERIC NOT NULL,
                entry_time TIMESTAMPTZ NOT NULL,
                phase_at_entry TEXT NOT NULL,
                strategy TEXT NOT NULL,
                state TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS trade_records (
                id UUID PRIMARY KEY,
                asset TEXT NOT NULL,
                side TEXT NOT NULL,
                entry_price NUMERIC NOT NULL,
                exit_price NUMERIC NOT NULL,
                shares NUMERIC NOT NULL,
                pnl NUMERIC NOT NULL,
                exit_reason TEXT NOT NULL,
                entry_time TIMESTAMPTZ NOT NULL,
                exit_time TIMESTAMPTZ NOT NULL,
                strategy TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS window_snapshots (
                slug TEXT PRIMARY KEY,
                asset TEXT NOT NULL,
                price_to_beat NUMERIC NOT NULL,
                yes_price NUMERIC,
                no_price NUMERIC,
                end_time TIMESTAMPTZ NOT NULL,
                captured_at TIMESTAMPTZ NOT NULL
            )
            "#,
        ] {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(DbError::Schema)?;
        }

        Ok(())
    }

    /// Verify the store is usable: reachable, and every table the persister
    /// writes actually exists.
    pub async fn health_check(&self) -> Result<(), DbError> {
        for table in TABLES {
            let exists: bool = sqlx::query_scalar(
                "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_name = $1)",
            )
            .bind(table)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| DbError::Unhealthy(e.to_string()))?;

            if !exists {
                return Err(DbError::Unhealthy(format!("missing table {table}")));
            }
        }

        Ok(())
    }
}
