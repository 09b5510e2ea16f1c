//! In-memory [`OracleStore`] for tests and offline replays.
//!
//! Mirrors the PostgreSQL semantics the engine relies on, including the
//! (imei, node, exit IS NULL) close predicate. State is inspectable so
//! scenario tests can assert on exactly which events were written.

use super::{OracleStore, PersistenceError};
use crate::types::{GeofenceEvent, GeofenceNode, TelemetrySample, WeeklyNodeStat};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Mutex;

#[derive(Default)]
struct Inner {
    nodes: Vec<GeofenceNode>,
    raw_samples: Vec<TelemetrySample>,
    events: Vec<GeofenceEvent>,
    weekly_stats: Vec<WeeklyNodeStat>,
    fail_writes: bool,
}

/// Shared in-memory store.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn add_node(&self, node: GeofenceNode) {
        self.lock().nodes.push(node);
    }

    pub fn set_weekly_stats(&self, stats: Vec<WeeklyNodeStat>) {
        self.lock().weekly_stats = stats;
    }

    /// Make every write fail, to exercise per-vehicle failure isolation.
    pub fn fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    pub fn events(&self) -> Vec<GeofenceEvent> {
        self.lock().events.clone()
    }

    pub fn raw_sample_count(&self) -> usize {
        self.lock().raw_samples.len()
    }

    fn write_error() -> PersistenceError {
        PersistenceError::Database(sqlx::Error::PoolClosed)
    }
}

#[async_trait]
impl OracleStore for MemoryStore {
    async fn active_nodes(&self) -> Result<Vec<GeofenceNode>, PersistenceError> {
        Ok(self
            .lock()
            .nodes
            .iter()
            .filter(|node| node.is_active)
            .cloned()
            .collect())
    }

    async fn append_raw_samples(
        &self,
        samples: &[TelemetrySample],
    ) -> Result<(), PersistenceError> {
        let mut inner = self.lock();
        if inner.fail_writes {
            return Err(Self::write_error());
        }
        inner.raw_samples.extend_from_slice(samples);
        Ok(())
    }

    async fn insert_event(&self, event: &GeofenceEvent) -> Result<(), PersistenceError> {
        let mut inner = self.lock();
        if inner.fail_writes {
            return Err(Self::write_error());
        }
        inner.events.push(event.clone());
        Ok(())
    }

    async fn close_open_logistics(
        &self,
        imei: &str,
        node_id: i64,
        exit_time: DateTime<Utc>,
        duration_minutes: i64,
    ) -> Result<u64, PersistenceError> {
        let mut inner = self.lock();
        if inner.fail_writes {
            return Err(Self::write_error());
        }
        let mut closed = 0u64;
        for event in &mut inner.events {
            if event.imei == imei
                && event.node_id == node_id
                && event.event_type == crate::types::EventType::Logistics
                && event.exit_time.is_none()
            {
                event.exit_time = Some(exit_time);
                event.duration_minutes = Some(duration_minutes);
                closed += 1;
            }
        }
        Ok(closed)
    }

    async fn weekly_stats(&self) -> Result<Vec<WeeklyNodeStat>, PersistenceError> {
        let mut stats = self.lock().weekly_stats.clone();
        stats.sort_by(|a, b| {
            a.node_id
                .cmp(&b.node_id)
                .then(b.week_start.cmp(&a.week_start))
        });
        Ok(stats)
    }
}
