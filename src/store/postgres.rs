//! PostgreSQL implementation of [`OracleStore`].

use super::{OracleStore, PersistenceError};
use crate::types::{GeofenceEvent, GeofenceNode, TelemetrySample, WeeklyNodeStat};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

/// Production store backed by the shared PostgreSQL pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OracleStore for PgStore {
    async fn active_nodes(&self) -> Result<Vec<GeofenceNode>, PersistenceError> {
        let nodes = sqlx::query_as::<_, GeofenceNode>(
            "SELECT id, name, latitude, longitude, radius_meters, category, \
                    suggested_dwell_minutes, is_active \
             FROM geofence_nodes WHERE is_active = TRUE ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(nodes)
    }

    async fn append_raw_samples(
        &self,
        samples: &[TelemetrySample],
    ) -> Result<(), PersistenceError> {
        if samples.is_empty() {
            return Ok(());
        }

        // One multi-row insert per cycle; fleets are small enough (hundreds
        // of vehicles) that a single statement stays well under parameter
        // limits.
        let mut builder = sqlx::QueryBuilder::new(
            "INSERT INTO raw_telemetry (imei, latitude, longitude, speed_kmh, ignition_on, sample_time) ",
        );
        builder.push_values(samples, |mut row, sample| {
            row.push_bind(&sample.imei)
                .push_bind(sample.latitude)
                .push_bind(sample.longitude)
                .push_bind(sample.speed_kmh)
                .push_bind(sample.ignition_on)
                .push_bind(sample.sample_time);
        });
        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn insert_event(&self, event: &GeofenceEvent) -> Result<(), PersistenceError> {
        sqlx::query(
            "INSERT INTO geofence_events \
                 (node_id, imei, event_type, entry_time, exit_time, duration_minutes, \
                  avg_speed_kmh, ignition_on, is_verified) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(event.node_id)
        .bind(&event.imei)
        .bind(event.event_type.as_str())
        .bind(event.entry_time)
        .bind(event.exit_time)
        .bind(event.duration_minutes)
        .bind(event.avg_speed_kmh)
        .bind(event.ignition_on)
        .bind(event.is_verified)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn close_open_logistics(
        &self,
        imei: &str,
        node_id: i64,
        exit_time: DateTime<Utc>,
        duration_minutes: i64,
    ) -> Result<u64, PersistenceError> {
        let result = sqlx::query(
            "UPDATE geofence_events \
             SET exit_time = $1, duration_minutes = $2 \
             WHERE imei = $3 AND node_id = $4 AND event_type = 'logistics' \
               AND exit_time IS NULL",
        )
        .bind(exit_time)
        .bind(duration_minutes)
        .bind(imei)
        .bind(node_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn weekly_stats(&self) -> Result<Vec<WeeklyNodeStat>, PersistenceError> {
        let stats = sqlx::query_as::<_, WeeklyNodeStat>(
            "SELECT node_id, node_name, category, week_start, total_events, total_dwell_minutes \
             FROM weekly_node_stats ORDER BY node_id, week_start DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(stats)
    }
}
