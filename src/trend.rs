//! Trend monitor — week-over-week growth anomalies on node event volume.
//!
//! Reads the externally materialized weekly aggregate view and compares each
//! node's latest week against the prior one. Pure read-and-compute; alerts
//! surface through the process log and the returned count.

use crate::store::{OracleStore, PersistenceError};
use crate::types::{TrendAlert, WeeklyNodeStat};
use std::sync::Arc;
use tracing::{debug, warn};

/// Prior-week volume below this floor is too sparse to compare.
pub const MIN_PREVIOUS_WEEK_EVENTS: i64 = 5;

/// Growth at or above this ratio raises an alert.
pub const GROWTH_ALERT_RATIO: f64 = 0.20;

/// Periodic growth-anomaly detector over the weekly stat view.
pub struct TrendMonitor {
    store: Arc<dyn OracleStore>,
}

impl TrendMonitor {
    pub fn new(store: Arc<dyn OracleStore>) -> Self {
        Self { store }
    }

    /// Scan the weekly view and log one alert per anomalous node.
    /// Returns the alert count.
    pub async fn detect_growth_anomalies(&self) -> Result<usize, PersistenceError> {
        let stats = self.store.weekly_stats().await?;
        let alerts = growth_alerts(&stats);

        for alert in &alerts {
            warn!(
                node_id = alert.node_id,
                node = %alert.node_name,
                previous = alert.previous_events,
                current = alert.current_events,
                growth_percent = format!("{:.1}", alert.growth_percent),
                "Anomalous event-volume growth on node"
            );
        }
        debug!(
            rows = stats.len(),
            alerts = alerts.len(),
            "Trend scan complete"
        );
        Ok(alerts.len())
    }
}

/// Compute growth alerts from rows ordered by node then week descending.
///
/// For each node with at least two weekly samples, the newest week is
/// compared to the one before it. Nodes whose prior week sits below
/// [`MIN_PREVIOUS_WEEK_EVENTS`] are skipped regardless of growth.
pub fn growth_alerts(stats: &[WeeklyNodeStat]) -> Vec<TrendAlert> {
    let mut alerts = Vec::new();

    let mut i = 0;
    while i < stats.len() {
        let node_id = stats[i].node_id;
        let group_end = stats[i..]
            .iter()
            .position(|row| row.node_id != node_id)
            .map_or(stats.len(), |offset| i + offset);

        // Rows arrive week-descending, so [i] is the latest week.
        if group_end - i >= 2 {
            let current = &stats[i];
            let previous = &stats[i + 1];
            if previous.total_events >= MIN_PREVIOUS_WEEK_EVENTS {
                let growth = (current.total_events - previous.total_events) as f64
                    / previous.total_events as f64;
                if growth >= GROWTH_ALERT_RATIO {
                    alerts.push(TrendAlert {
                        node_id,
                        node_name: current.node_name.clone(),
                        previous_events: previous.total_events,
                        current_events: current.total_events,
                        growth_percent: growth * 100.0,
                    });
                }
            }
        }

        i = group_end;
    }

    alerts
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn stat(node_id: i64, week: &str, total_events: i64) -> WeeklyNodeStat {
        WeeklyNodeStat {
            node_id,
            node_name: format!("node-{node_id}"),
            category: "dry_port".to_string(),
            week_start: NaiveDate::parse_from_str(week, "%Y-%m-%d").unwrap(),
            total_events,
            total_dwell_minutes: total_events * 20,
        }
    }

    #[test]
    fn thirty_percent_growth_alerts() {
        let stats = vec![stat(1, "2024-06-10", 13), stat(1, "2024-06-03", 10)];
        let alerts = growth_alerts(&stats);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].previous_events, 10);
        assert_eq!(alerts[0].current_events, 13);
        assert!((alerts[0].growth_percent - 30.0).abs() < 1e-9);
    }

    #[test]
    fn exactly_twenty_percent_growth_alerts() {
        let stats = vec![stat(1, "2024-06-10", 12), stat(1, "2024-06-03", 10)];
        assert_eq!(growth_alerts(&stats).len(), 1);
    }

    #[test]
    fn growth_below_threshold_is_quiet() {
        let stats = vec![stat(1, "2024-06-10", 11), stat(1, "2024-06-03", 10)];
        assert!(growth_alerts(&stats).is_empty());
    }

    #[test]
    fn sparse_previous_week_is_skipped_regardless_of_growth() {
        // 4 → 40 is 900% growth, but below the sample floor.
        let stats = vec![stat(1, "2024-06-10", 40), stat(1, "2024-06-03", 4)];
        assert!(growth_alerts(&stats).is_empty());
    }

    #[test]
    fn single_week_nodes_are_ignored() {
        let stats = vec![stat(1, "2024-06-10", 50)];
        assert!(growth_alerts(&stats).is_empty());
    }

    #[test]
    fn only_latest_pair_is_compared_per_node() {
        // Older weeks 5 → 50 would alert, but only the newest pair counts.
        let stats = vec![
            stat(1, "2024-06-17", 50),
            stat(1, "2024-06-10", 50),
            stat(1, "2024-06-03", 5),
            stat(2, "2024-06-17", 26),
            stat(2, "2024-06-10", 20),
        ];
        let alerts = growth_alerts(&stats);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].node_id, 2);
    }
}
