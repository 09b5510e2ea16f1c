//! Geofence engine — the per-vehicle dwell state machine.
//!
//! Each cycle takes a node snapshot, fetches the fleet's positions, archives
//! the raw samples, and evaluates every vehicle independently:
//!
//! - **OUTSIDE → INSIDE**: the position falls within a node's radius. Entry
//!   time is stamped; an ignition-off stretch starts immediately if the
//!   ignition is already off.
//! - **INSIDE → INSIDE** (same node): the ignition-off stretch is maintained,
//!   and once it reaches the node's dwell threshold exactly one *open*
//!   logistics event is written for the stay.
//! - **INSIDE → OUTSIDE**: the open logistics event is closed, or — when no
//!   logistics event was opened and the stay outlasted the 2-minute noise
//!   floor — a complete traffic event is written.
//!
//! Per-vehicle persistence failures are logged and do not stop the rest of
//! the fleet from being evaluated; the orchestrator isolates whole-cycle
//! failures at the cycle boundary.

use crate::clock::Clock;
use crate::store::{OracleStore, PersistenceError};
use crate::telemetry::{FetchError, TelemetrySource};
use crate::types::{EventType, GeofenceEvent, GeofenceNode, TelemetrySample, VehicleTrackingState};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Mean Earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Stays at or below this duration are GPS noise — no traffic event.
pub const TRAFFIC_NOISE_FLOOR_MINUTES: i64 = 2;

/// Errors that abort a whole engine cycle. Caught at the cycle boundary so
/// the next scheduled cycle is unaffected.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("Node snapshot load failed: {0}")]
    NodeLoad(#[source] PersistenceError),

    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Counters for one engine cycle, reported on the orchestrator's result
/// channel.
#[derive(Debug, Clone, Default)]
pub struct CycleStats {
    pub nodes: usize,
    pub samples: usize,
    pub entries: usize,
    pub exits: usize,
    pub logistics_opened: usize,
    pub logistics_closed: usize,
    pub traffic_recorded: usize,
    pub write_failures: usize,
    pub archive_failed: bool,
}

/// Great-circle (haversine) distance between two coordinates, in meters.
/// Symmetric, and zero for identical points.
pub fn haversine_distance_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().asin()
}

/// Of all nodes containing the position, pick the one whose center is
/// closest. With non-overlapping nodes this degenerates to the single match.
fn nearest_containing_node(
    nodes: &[GeofenceNode],
    latitude: f64,
    longitude: f64,
) -> Option<&GeofenceNode> {
    nodes
        .iter()
        .filter_map(|node| {
            let distance = haversine_distance_m(latitude, longitude, node.latitude, node.longitude);
            (distance <= node.radius_meters).then_some((node, distance))
        })
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(node, _)| node)
}

/// The geofence engine. Owns the cross-cycle tracking map exclusively; the
/// orchestrator serializes cycles through a mutex so no locking is needed
/// here.
pub struct GeofenceEngine {
    source: Arc<dyn TelemetrySource>,
    store: Arc<dyn OracleStore>,
    clock: Arc<dyn Clock>,
    tracking: HashMap<String, VehicleTrackingState>,
}

impl GeofenceEngine {
    pub fn new(
        source: Arc<dyn TelemetrySource>,
        store: Arc<dyn OracleStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            source,
            store,
            clock,
            tracking: HashMap::new(),
        }
    }

    /// Run one full polling cycle: node snapshot, telemetry fetch, raw
    /// archival, then per-vehicle evaluation.
    pub async fn run_cycle(&mut self) -> Result<CycleStats, CycleError> {
        let nodes = self.store.active_nodes().await.map_err(CycleError::NodeLoad)?;
        let samples = self.source.fetch_fleet().await?;

        let mut stats = CycleStats {
            nodes: nodes.len(),
            samples: samples.len(),
            ..CycleStats::default()
        };

        // Archive before evaluation; the clustering pipeline wants every
        // sample, including ones that trigger no transition.
        if let Err(e) = self.store.append_raw_samples(&samples).await {
            warn!(error = %e, samples = samples.len(), "Raw telemetry archival failed, continuing cycle");
            stats.archive_failed = true;
        }

        for sample in &samples {
            self.evaluate_vehicle(&nodes, sample, &mut stats).await;
        }

        debug!(
            nodes = stats.nodes,
            samples = stats.samples,
            entries = stats.entries,
            exits = stats.exits,
            "Engine cycle evaluated"
        );
        Ok(stats)
    }

    /// Evaluate one vehicle's transition for this cycle. Never fails: event
    /// write errors are logged and counted so the rest of the fleet still
    /// gets processed.
    async fn evaluate_vehicle(
        &mut self,
        nodes: &[GeofenceNode],
        sample: &TelemetrySample,
        stats: &mut CycleStats,
    ) {
        let now = self.clock.now();
        let matched = nearest_containing_node(nodes, sample.latitude, sample.longitude);
        let store = self.store.as_ref();
        let state = self.tracking.entry(sample.imei.clone()).or_default();

        match (state.current_node_id, matched) {
            (None, None) => {}
            (None, Some(node)) => {
                enter_node(state, node, sample, now);
                stats.entries += 1;
            }
            (Some(current), Some(node)) if node.id == current => {
                continue_stay(store, state, node, sample, now, stats).await;
            }
            (Some(current), matched) => {
                // Left the node — possibly straight into an adjacent one.
                exit_node(store, state, current, sample, now, stats).await;
                if let Some(node) = matched {
                    enter_node(state, node, sample, now);
                    stats.entries += 1;
                }
            }
        }
    }
}

/// OUTSIDE → INSIDE.
fn enter_node(
    state: &mut VehicleTrackingState,
    node: &GeofenceNode,
    sample: &TelemetrySample,
    now: DateTime<Utc>,
) {
    state.current_node_id = Some(node.id);
    state.entry_time = Some(now);
    state.ignition_off_since = (!sample.ignition_on).then_some(now);
    state.event_already_recorded = false;
    state.speed_sum_kmh = sample.speed_kmh;
    state.speed_samples = 1;

    debug!(imei = %sample.imei, node = %node.name, "Vehicle entered node");
}

/// INSIDE → INSIDE (same node): maintain the ignition-off stretch and open
/// the logistics event once the dwell threshold is reached.
async fn continue_stay(
    store: &dyn OracleStore,
    state: &mut VehicleTrackingState,
    node: &GeofenceNode,
    sample: &TelemetrySample,
    now: DateTime<Utc>,
    stats: &mut CycleStats,
) {
    if sample.ignition_on {
        state.ignition_off_since = None;
    } else if state.ignition_off_since.is_none() {
        state.ignition_off_since = Some(now);
    }

    state.speed_sum_kmh += sample.speed_kmh;
    state.speed_samples += 1;

    if state.event_already_recorded {
        return;
    }
    let Some(off_since) = state.ignition_off_since else {
        return;
    };
    if now - off_since < Duration::minutes(node.suggested_dwell_minutes) {
        return;
    }

    let event = GeofenceEvent {
        node_id: node.id,
        imei: sample.imei.clone(),
        event_type: EventType::Logistics,
        entry_time: state.entry_time.unwrap_or(now),
        exit_time: None,
        duration_minutes: None,
        avg_speed_kmh: state.avg_speed_kmh(),
        ignition_on: false,
        is_verified: false,
    };
    match store.insert_event(&event).await {
        Ok(()) => {
            // Only mark the stay recorded on a successful write, so a
            // transient failure retries next cycle instead of losing the
            // billable event.
            state.event_already_recorded = true;
            stats.logistics_opened += 1;
            info!(
                imei = %sample.imei,
                node = %node.name,
                dwell_minutes = node.suggested_dwell_minutes,
                "Logistics event opened"
            );
        }
        Err(e) => {
            stats.write_failures += 1;
            warn!(error = %e, imei = %sample.imei, node_id = node.id, "Logistics event insert failed");
        }
    }
}

/// INSIDE → OUTSIDE: close the open logistics event, or record a traffic
/// event when the stay beat the noise floor. Sub-state is reset either way.
async fn exit_node(
    store: &dyn OracleStore,
    state: &mut VehicleTrackingState,
    node_id: i64,
    sample: &TelemetrySample,
    now: DateTime<Utc>,
    stats: &mut CycleStats,
) {
    let entry_time = state.entry_time;
    let duration_minutes = entry_time.map(|entry| (now - entry).num_minutes());

    if state.event_already_recorded {
        match store
            .close_open_logistics(&sample.imei, node_id, now, duration_minutes.unwrap_or(0))
            .await
        {
            Ok(0) => {
                warn!(imei = %sample.imei, node_id, "No open logistics event found to close");
            }
            Ok(_) => {
                stats.logistics_closed += 1;
                info!(
                    imei = %sample.imei,
                    node_id,
                    duration_minutes = duration_minutes.unwrap_or(0),
                    "Logistics event closed"
                );
            }
            Err(e) => {
                stats.write_failures += 1;
                warn!(error = %e, imei = %sample.imei, node_id, "Logistics event close failed");
            }
        }
    } else if let Some(entry) = entry_time {
        if now - entry > Duration::minutes(TRAFFIC_NOISE_FLOOR_MINUTES) {
            let event = GeofenceEvent {
                node_id,
                imei: sample.imei.clone(),
                event_type: EventType::Traffic,
                entry_time: entry,
                exit_time: Some(now),
                duration_minutes,
                avg_speed_kmh: state.avg_speed_kmh(),
                ignition_on: sample.ignition_on,
                is_verified: false,
            };
            match store.insert_event(&event).await {
                Ok(()) => {
                    stats.traffic_recorded += 1;
                    debug!(imei = %sample.imei, node_id, "Traffic event recorded");
                }
                Err(e) => {
                    stats.write_failures += 1;
                    warn!(error = %e, imei = %sample.imei, node_id, "Traffic event insert failed");
                }
            }
        }
    }

    state.reset();
    stats.exits += 1;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: i64, latitude: f64, longitude: f64, radius_meters: f64) -> GeofenceNode {
        GeofenceNode {
            id,
            name: format!("node-{id}"),
            latitude,
            longitude,
            radius_meters,
            category: "dry_port".to_string(),
            suggested_dwell_minutes: 15,
            is_active: true,
        }
    }

    #[test]
    fn distance_is_symmetric_and_zero_on_identity() {
        let (a_lat, a_lon) = (3.451_6, -76.532_0);
        let (b_lat, b_lon) = (4.710_9, -74.072_1);

        let ab = haversine_distance_m(a_lat, a_lon, b_lat, b_lon);
        let ba = haversine_distance_m(b_lat, b_lon, a_lat, a_lon);
        assert!((ab - ba).abs() < 1e-6);
        assert_eq!(haversine_distance_m(a_lat, a_lon, a_lat, a_lon), 0.0);

        // Cali → Bogotá is roughly 300 km.
        assert!((295_000.0..320_000.0).contains(&ab));
    }

    #[test]
    fn one_degree_of_latitude_is_about_111_km() {
        let d = haversine_distance_m(0.0, 0.0, 1.0, 0.0);
        assert!((110_000.0..112_500.0).contains(&d));
    }

    #[test]
    fn containment_respects_radius() {
        let nodes = vec![node(1, 3.0, -76.5, 200.0)];
        // ~111 m north of center: inside.
        assert!(nearest_containing_node(&nodes, 3.001, -76.5).is_some());
        // ~555 m north: outside.
        assert!(nearest_containing_node(&nodes, 3.005, -76.5).is_none());
    }

    #[test]
    fn overlapping_nodes_resolve_to_nearest_center() {
        let nodes = vec![
            node(1, 3.000, -76.500, 5_000.0),
            node(2, 3.010, -76.500, 5_000.0),
        ];
        // Position sits in both circles but closer to node 2's center.
        let winner = nearest_containing_node(&nodes, 3.008, -76.500).unwrap();
        assert_eq!(winner.id, 2);
    }
}
