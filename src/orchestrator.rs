//! Polling orchestrator — schedules engine and trend cycles.
//!
//! Both timers fire immediately at process start, then on their fixed
//! intervals (engine every 3 minutes by default, trend daily). Scheduling is
//! decoupled from execution: each tick spawns the cycle and the outcome comes
//! back on a result channel, so a failed or slow cycle never stalls the
//! timers. A tick that finds the previous engine cycle still running is
//! skipped rather than run concurrently — the tracking map is single-writer.

use crate::config::PollingConfig;
use crate::engine::{CycleStats, GeofenceEngine};
use crate::trend::TrendMonitor;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Which periodic job produced a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleKind {
    Geofence,
    Trend,
}

impl std::fmt::Display for CycleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Geofence => write!(f, "geofence"),
            Self::Trend => write!(f, "trend"),
        }
    }
}

/// Result of one scheduled invocation.
#[derive(Debug, Clone)]
pub enum CycleOutcome {
    /// Engine cycle completed; counters attached.
    Geofence(CycleStats),
    /// Trend cycle completed with this many alerts.
    Trend { alerts: usize },
    /// The previous cycle of this kind was still running.
    Skipped,
    /// The cycle failed; the error was already logged at source.
    Failed(String),
}

/// One entry on the orchestrator's result channel.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub kind: CycleKind,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub outcome: CycleOutcome,
}

/// Drives the two periodic jobs and reports every invocation's outcome.
pub struct Orchestrator {
    engine: Arc<Mutex<GeofenceEngine>>,
    monitor: Arc<TrendMonitor>,
    engine_interval: Duration,
    trend_interval: Duration,
    reports: mpsc::Sender<CycleReport>,
}

impl Orchestrator {
    pub fn new(
        engine: GeofenceEngine,
        monitor: TrendMonitor,
        polling: &PollingConfig,
        reports: mpsc::Sender<CycleReport>,
    ) -> Self {
        Self {
            engine: Arc::new(Mutex::new(engine)),
            monitor: Arc::new(monitor),
            engine_interval: Duration::from_secs(polling.engine_interval_secs),
            trend_interval: Duration::from_secs(polling.trend_interval_secs),
            reports,
        }
    }

    /// Run the scheduler until the cancellation token fires.
    ///
    /// Both intervals yield their first tick immediately, which covers the
    /// run-once-at-startup behavior for free.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            engine_interval_secs = self.engine_interval.as_secs(),
            trend_interval_secs = self.trend_interval.as_secs(),
            "Polling orchestrator started"
        );

        let mut engine_tick = tokio::time::interval(self.engine_interval);
        engine_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut trend_tick = tokio::time::interval(self.trend_interval);
        trend_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("Orchestrator shutting down");
                    break;
                }
                _ = engine_tick.tick() => {
                    let engine = Arc::clone(&self.engine);
                    let reports = self.reports.clone();
                    tokio::spawn(async move {
                        let report = run_geofence_cycle(&engine).await;
                        if reports.send(report).await.is_err() {
                            debug!("Report channel closed");
                        }
                    });
                }
                _ = trend_tick.tick() => {
                    let monitor = Arc::clone(&self.monitor);
                    let reports = self.reports.clone();
                    tokio::spawn(async move {
                        let report = run_trend_cycle(&monitor).await;
                        if reports.send(report).await.is_err() {
                            debug!("Report channel closed");
                        }
                    });
                }
            }
        }
    }
}

/// Run one engine cycle behind the skip-if-running guard.
pub async fn run_geofence_cycle(engine: &Mutex<GeofenceEngine>) -> CycleReport {
    let started_at = Utc::now();
    let timer = std::time::Instant::now();

    let outcome = match engine.try_lock() {
        Ok(mut engine) => match engine.run_cycle().await {
            Ok(stats) => CycleOutcome::Geofence(stats),
            Err(e) => CycleOutcome::Failed(e.to_string()),
        },
        Err(_) => CycleOutcome::Skipped,
    };

    CycleReport {
        kind: CycleKind::Geofence,
        started_at,
        elapsed: timer.elapsed(),
        outcome,
    }
}

/// Run one trend cycle. Trend scans are read-only so no guard is needed,
/// and at a daily interval overlap cannot occur anyway.
pub async fn run_trend_cycle(monitor: &TrendMonitor) -> CycleReport {
    let started_at = Utc::now();
    let timer = std::time::Instant::now();

    let outcome = match monitor.detect_growth_anomalies().await {
        Ok(alerts) => CycleOutcome::Trend { alerts },
        Err(e) => CycleOutcome::Failed(e.to_string()),
    };

    CycleReport {
        kind: CycleKind::Trend,
        started_at,
        elapsed: timer.elapsed(),
        outcome,
    }
}

/// Consume cycle reports and turn them into operator-facing log lines.
/// Failures were already logged with context at their source; this is the
/// per-cycle summary operators watch.
pub async fn log_reports(mut reports: mpsc::Receiver<CycleReport>) {
    while let Some(report) = reports.recv().await {
        let elapsed_ms = report.elapsed.as_millis() as u64;
        match report.outcome {
            CycleOutcome::Geofence(stats) => info!(
                elapsed_ms,
                nodes = stats.nodes,
                samples = stats.samples,
                entries = stats.entries,
                exits = stats.exits,
                logistics_opened = stats.logistics_opened,
                logistics_closed = stats.logistics_closed,
                traffic_recorded = stats.traffic_recorded,
                write_failures = stats.write_failures,
                archive_failed = stats.archive_failed,
                "Geofence cycle complete"
            ),
            CycleOutcome::Trend { alerts } => {
                info!(elapsed_ms, alerts, "Trend cycle complete");
            }
            CycleOutcome::Skipped => warn!(
                kind = %report.kind,
                "Previous cycle still running — tick skipped"
            ),
            CycleOutcome::Failed(reason) => error!(
                kind = %report.kind,
                elapsed_ms,
                reason,
                "Cycle failed; next tick unaffected"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::store::MemoryStore;
    use crate::telemetry::{FetchError, TelemetrySource};
    use crate::types::TelemetrySample;
    use async_trait::async_trait;

    struct EmptySource;

    #[async_trait]
    impl TelemetrySource for EmptySource {
        async fn fetch_fleet(&self) -> Result<Vec<TelemetrySample>, FetchError> {
            Ok(Vec::new())
        }
    }

    struct FailingSource;

    #[async_trait]
    impl TelemetrySource for FailingSource {
        async fn fetch_fleet(&self) -> Result<Vec<TelemetrySample>, FetchError> {
            Err(FetchError::MissingRecordArray)
        }
    }

    fn engine_with(source: Arc<dyn TelemetrySource>) -> Mutex<GeofenceEngine> {
        Mutex::new(GeofenceEngine::new(
            source,
            Arc::new(MemoryStore::new()),
            Arc::new(SystemClock),
        ))
    }

    #[tokio::test]
    async fn completed_cycle_reports_stats() {
        let engine = engine_with(Arc::new(EmptySource));
        let report = run_geofence_cycle(&engine).await;
        assert_eq!(report.kind, CycleKind::Geofence);
        assert!(matches!(report.outcome, CycleOutcome::Geofence(_)));
    }

    #[tokio::test]
    async fn failed_fetch_is_contained_in_the_report() {
        let engine = engine_with(Arc::new(FailingSource));
        let report = run_geofence_cycle(&engine).await;
        assert!(matches!(report.outcome, CycleOutcome::Failed(_)));

        // The failure must not poison the engine: the next tick works.
        let report = run_geofence_cycle(&engine).await;
        assert!(matches!(report.outcome, CycleOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn busy_engine_tick_is_skipped() {
        let engine = engine_with(Arc::new(EmptySource));
        let guard = engine.lock().await;
        let report = run_geofence_cycle(&engine).await;
        assert!(matches!(report.outcome, CycleOutcome::Skipped));
        drop(guard);

        let report = run_geofence_cycle(&engine).await;
        assert!(matches!(report.outcome, CycleOutcome::Geofence(_)));
    }

    #[tokio::test]
    async fn trend_cycle_reports_alert_count() {
        let monitor = TrendMonitor::new(Arc::new(MemoryStore::new()));
        let report = run_trend_cycle(&monitor).await;
        assert!(matches!(report.outcome, CycleOutcome::Trend { alerts: 0 }));
    }
}
