//! Postgres-backed invoice store, job queue and gateway-config store.
//!
//! ## Error mapping
//!
//! | SQLx error | Postgres code | `StoreError` | Scenario |
//! |------------|---------------|--------------|----------|
//! | Database (unique violation) | `23505` | `Conflict` | concurrent generation for the same order, second active gateway config |
//! | Database (foreign key violation) | `23503` | `NotFound` | job or history row pointing at a missing invoice |
//! | Database (other) | any | `Database` | |
//! | PoolClosed / other | n/a | `Database` | connection or network failure |
//!
//! ## Concurrency
//!
//! - Invoice numbering is serialised by a transaction-scoped advisory lock.
//! - Claims use `FOR UPDATE SKIP LOCKED`, so concurrent workers never wait on
//!   or receive the same job.
//! - Outcome updates are guarded by the `atualizado_em` value the claim
//!   returned; a mismatch means the lease was lost.

mod gateway_configs;
mod invoices;
mod jobs;

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row};
use tracing::{info, instrument};

use crate::StoreError;
use crate::config::DatabaseSettings;

/// All three stores over one connection pool.
#[derive(Debug, Clone)]
pub struct PostgresBackend {
    pool: Arc<PgPool>,
}

impl PostgresBackend {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    #[instrument(skip(url), fields(max_connections = max_connections), err)]
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        info!("connecting to PostgreSQL");
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub async fn from_settings(settings: &DatabaseSettings) -> Result<Self, StoreError> {
        let url = settings
            .url
            .as_deref()
            .ok_or_else(|| StoreError::Database("DATABASE_URL is not set".to_string()))?;
        Self::connect(url, settings.max_connections).await
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&*self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("migration failed: {e}")))?;
        info!("database migrations applied");
        Ok(())
    }
}

pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("{operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Conflict(msg),
                Some("23503") => StoreError::NotFound(msg),
                _ => StoreError::Database(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Database(format!("connection pool closed in {operation}"))
        }
        other => StoreError::Database(format!("{operation}: {other}")),
    }
}

/// Row decode failures are database errors, not missing rows.
pub(crate) fn decode_error(column: &str, err: sqlx::Error) -> StoreError {
    StoreError::Database(format!("failed to read column {column}: {err}"))
}

pub(crate) fn column<'r, T>(row: &'r PgRow, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(name).map_err(|e| decode_error(name, e))
}

/// `INTEGER` counters never go negative; clamp anyway.
pub(crate) fn attempts_from_db(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

pub(crate) fn attempts_to_db(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}
