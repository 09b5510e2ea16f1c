//! Fleet Oracle — telemetry ingestion and geofence event engine.
//!
//! Polls a vendor GPS feed on a fixed interval, matches vehicle positions
//! against named circular zones ("nodes"), tracks per-vehicle dwell state
//! across cycles, and derives billable logistics events and ambient traffic
//! events. A daily trend monitor flags anomalous week-over-week growth in
//! per-node event volume.
//!
//! Component layering, leaves first:
//!
//! - [`credentials`] — TTL-cached vendor bearer token, harvested with a
//!   headless browser.
//! - [`telemetry`] — bulk position fetch and normalization.
//! - [`store`] — persistent-store collaborator (PostgreSQL).
//! - [`engine`] — the per-vehicle geofence state machine.
//! - [`trend`] — weekly growth anomaly detection.
//! - [`orchestrator`] — fixed-interval scheduling with per-cycle failure
//!   isolation.

pub mod clock;
pub mod config;
pub mod credentials;
pub mod engine;
pub mod orchestrator;
pub mod store;
pub mod telemetry;
pub mod trend;
pub mod types;
