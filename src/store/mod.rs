//! Persistent-store collaborator.
//!
//! The Oracle performs four kinds of store access: the per-cycle node
//! snapshot read, raw-telemetry archival, geofence-event insert/close, and
//! the weekly-stat read for trend analysis. [`OracleStore`] abstracts them so
//! the engine and trend monitor are store-agnostic; [`PgStore`] is the
//! production PostgreSQL implementation and [`MemoryStore`] backs tests.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::types::{GeofenceEvent, GeofenceNode, TelemetrySample, WeeklyNodeStat};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Store read/write failures.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// CRUD surface the Oracle needs from the persistent store.
#[async_trait]
pub trait OracleStore: Send + Sync {
    /// Read-only snapshot of the active geofence nodes, taken once per cycle.
    async fn active_nodes(&self) -> Result<Vec<GeofenceNode>, PersistenceError>;

    /// Append the cycle's raw samples to the archival sink consumed by
    /// downstream clustering analytics.
    async fn append_raw_samples(
        &self,
        samples: &[TelemetrySample],
    ) -> Result<(), PersistenceError>;

    /// Insert a geofence event — an open logistics event (`exit_time = None`)
    /// or a complete traffic event.
    async fn insert_event(&self, event: &GeofenceEvent) -> Result<(), PersistenceError>;

    /// Close the open logistics event matching (imei, node, exit IS NULL).
    /// Returns the number of rows closed.
    async fn close_open_logistics(
        &self,
        imei: &str,
        node_id: i64,
        exit_time: DateTime<Utc>,
        duration_minutes: i64,
    ) -> Result<u64, PersistenceError>;

    /// Weekly aggregate rows, ordered by node then week descending.
    async fn weekly_stats(&self) -> Result<Vec<WeeklyNodeStat>, PersistenceError>;
}

/// Create the PostgreSQL connection pool.
pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Connected to PostgreSQL");
    Ok(pool)
}

/// Run database migrations from the migrations/ directory.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("Migrations complete");
    Ok(())
}
