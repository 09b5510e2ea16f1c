//! Core domain records shared across the Oracle.
//!
//! These are the canonical shapes every component speaks: the node snapshot
//! read from the store, the normalized telemetry sample produced by the
//! fetcher, the per-vehicle tracking state owned by the engine, and the
//! events/stats the engine and trend monitor emit.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// A named circular geofence zone ("node").
///
/// Owned externally; the engine takes a read-only snapshot once per cycle.
/// Dwell thresholds live on the node record, not in global configuration.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct GeofenceNode {
    pub id: i64,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub radius_meters: f64,
    /// Commercial category (e.g. "dry_port", "fuel_station").
    pub category: String,
    /// Minimum ignition-off minutes before a stay becomes billable.
    pub suggested_dwell_minutes: i64,
    pub is_active: bool,
}

/// One normalized vehicle position, produced per cycle and consumed
/// immediately. Raw copies are archived for downstream clustering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub imei: String,
    pub latitude: f64,
    pub longitude: f64,
    pub speed_kmh: f64,
    pub ignition_on: bool,
    pub sample_time: DateTime<Utc>,
}

/// Cross-cycle dwell state for one vehicle, keyed by IMEI in the engine's
/// tracking map. Created on first sighting, reset (not destroyed) on zone
/// exit, reused on the next entry.
#[derive(Debug, Clone, Default)]
pub struct VehicleTrackingState {
    /// Node the vehicle currently occupies, if any.
    pub current_node_id: Option<i64>,
    /// When the vehicle entered the current node.
    pub entry_time: Option<DateTime<Utc>>,
    /// Start of the current continuous ignition-off stretch inside the node.
    pub ignition_off_since: Option<DateTime<Utc>>,
    /// Whether a logistics event has already been opened for this stay.
    pub event_already_recorded: bool,
    /// Per-stay speed accumulator so `avg_speed` covers the whole stay.
    pub speed_sum_kmh: f64,
    pub speed_samples: u32,
}

impl VehicleTrackingState {
    /// Reset all sub-state after a zone exit. The map entry itself survives.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Average speed observed during the current stay (0 if no samples yet).
    pub fn avg_speed_kmh(&self) -> f64 {
        if self.speed_samples == 0 {
            0.0
        } else {
            self.speed_sum_kmh / f64::from(self.speed_samples)
        }
    }
}

/// Classification of a geofence event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    /// Billable qualifying stay (opened at the dwell threshold, closed on exit).
    Logistics,
    /// Non-billable transit through a node (written complete on exit).
    Traffic,
}

impl EventType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Logistics => "logistics",
            Self::Traffic => "traffic",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A derived geofence event. Logistics events are inserted open
/// (`exit_time = None`) and closed later; traffic events are inserted
/// complete in a single write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeofenceEvent {
    pub node_id: i64,
    pub imei: String,
    pub event_type: EventType,
    pub entry_time: DateTime<Utc>,
    pub exit_time: Option<DateTime<Utc>>,
    /// Whole minutes between entry and exit; `None` while the event is open.
    pub duration_minutes: Option<i64>,
    pub avg_speed_kmh: f64,
    /// Ignition state observed when the event was recorded.
    pub ignition_on: bool,
    pub is_verified: bool,
}

/// One row of the externally materialized weekly aggregate view, ordered by
/// node then week descending when read for trend analysis.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WeeklyNodeStat {
    pub node_id: i64,
    pub node_name: String,
    pub category: String,
    pub week_start: NaiveDate,
    pub total_events: i64,
    pub total_dwell_minutes: i64,
}

/// Anomalous week-over-week growth on one node's event volume.
#[derive(Debug, Clone, Serialize)]
pub struct TrendAlert {
    pub node_id: i64,
    pub node_name: String,
    pub previous_events: i64,
    pub current_events: i64,
    pub growth_percent: f64,
}
