//! Telemetry fetcher — one bulk position request per cycle.
//!
//! The vendor's fleet-position endpoint is loosely typed: field names vary by
//! firmware generation (`imei` vs `deviceId`, `lat` vs `latitude`, ...), some
//! deployments still wrap the JSON in a legacy JSONP callback, and individual
//! records arrive with null coordinates or garbage speeds. This module
//! normalizes all of that onto the canonical [`TelemetrySample`]: every field
//! is resolved through an explicit alias list, and a record that carries *no*
//! alias for a required field fails the fetch loudly rather than defaulting.
//!
//! Records with implausible speed (> 120 km/h) or null/zero coordinates are
//! dropped and counted, not errors — they are routine GPS noise.

use crate::credentials::{AcquisitionError, CredentialCache};
use crate::types::TelemetrySample;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Speed ceiling above which a sample is treated as a GPS glitch.
pub const MAX_PLAUSIBLE_SPEED_KMH: f64 = 120.0;

/// Field-name aliases observed across vendor firmware generations.
const IMEI_ALIASES: &[&str] = &["imei", "IMEI", "deviceId", "device_id", "unit_id"];
const LAT_ALIASES: &[&str] = &["latitude", "lat", "la"];
const LON_ALIASES: &[&str] = &["longitude", "lng", "lon", "lo"];
const SPEED_ALIASES: &[&str] = &["speed", "speedKmh", "speed_kmh", "sp"];
const IGNITION_ALIASES: &[&str] = &["ignition", "acc", "ignitionOn", "ignition_on"];
const TIME_ALIASES: &[&str] = &["sampleTime", "gpsTime", "gps_time", "timestamp", "dt_tracker"];

/// Keys under which object-shaped payloads nest the record array.
const RECORD_ARRAY_KEYS: &[&str] = &["items", "data", "devices", "records"];

/// Telemetry fetch errors. Any of these aborts the cycle — no telemetry
/// means nothing to evaluate.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Credential unavailable: {0}")]
    Credential(#[from] AcquisitionError),

    #[error("Vendor request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unparsable vendor payload: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Vendor payload is missing the expected record array")]
    MissingRecordArray,

    #[error("Record {index}: no alias matched required field `{field}`")]
    MissingField { index: usize, field: &'static str },
}

/// Source of one cycle's worth of fleet positions. Implemented by
/// [`VendorTelemetryFetcher`] in production and by scripted sources in tests.
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    async fn fetch_fleet(&self) -> Result<Vec<TelemetrySample>, FetchError>;
}

/// Production fetcher against the vendor position endpoint.
pub struct VendorTelemetryFetcher {
    http: reqwest::Client,
    positions_url: String,
    credentials: Arc<CredentialCache>,
}

impl VendorTelemetryFetcher {
    pub fn new(positions_url: &str, credentials: Arc<CredentialCache>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        Self {
            http,
            positions_url: positions_url.to_string(),
            credentials,
        }
    }
}

#[async_trait]
impl TelemetrySource for VendorTelemetryFetcher {
    async fn fetch_fleet(&self) -> Result<Vec<TelemetrySample>, FetchError> {
        let credential = self.credentials.get_valid().await?;

        let response = self
            .http
            .get(&self.positions_url)
            .query(&[
                ("token", credential.token.as_str()),
                ("account_id", credential.account_id.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?;

        let body = response.text().await?;
        normalize_payload(&body)
    }
}

/// Parse a raw vendor payload into canonical samples.
///
/// Accepts a bare JSON array, an object nesting the array under a known key,
/// or either of those wrapped in a legacy JSONP callback.
pub fn normalize_payload(body: &str) -> Result<Vec<TelemetrySample>, FetchError> {
    let json: Value = serde_json::from_str(strip_callback_wrapper(body))?;

    let records = match &json {
        Value::Array(records) => records,
        Value::Object(map) => RECORD_ARRAY_KEYS
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_array))
            .ok_or(FetchError::MissingRecordArray)?,
        _ => return Err(FetchError::MissingRecordArray),
    };

    let mut samples = Vec::with_capacity(records.len());
    let mut dropped = 0usize;
    for (index, record) in records.iter().enumerate() {
        match normalize_record(index, record)? {
            Some(sample) => samples.push(sample),
            None => dropped += 1,
        }
    }

    if dropped > 0 {
        debug!(dropped, kept = samples.len(), "Filtered implausible telemetry records");
    }
    Ok(samples)
}

/// Strip a legacy `callbackName(...)` JSONP wrapper, if present.
fn strip_callback_wrapper(body: &str) -> &str {
    let trimmed = body.trim();
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        return trimmed;
    }
    match (trimmed.find('('), trimmed.rfind(')')) {
        (Some(open), Some(close)) if open < close => trimmed[open + 1..close].trim(),
        _ => trimmed,
    }
}

/// Map one raw record onto the canonical sample.
///
/// `Ok(None)` means the record was dropped by a plausibility filter.
/// A record lacking any alias for a required field is a hard error.
fn normalize_record(index: usize, record: &Value) -> Result<Option<TelemetrySample>, FetchError> {
    let Value::Object(fields) = record else {
        warn!(index, "Skipping non-object telemetry record");
        return Ok(None);
    };

    let resolve = |aliases: &[&str], field: &'static str| -> Result<Value, FetchError> {
        aliases
            .iter()
            .find_map(|alias| fields.get(*alias))
            .cloned()
            .ok_or(FetchError::MissingField { index, field })
    };

    let imei = resolve(IMEI_ALIASES, "imei")?;
    let latitude = resolve(LAT_ALIASES, "latitude")?;
    let longitude = resolve(LON_ALIASES, "longitude")?;
    let speed = resolve(SPEED_ALIASES, "speed")?;
    let ignition = resolve(IGNITION_ALIASES, "ignition")?;
    let sample_time = resolve(TIME_ALIASES, "sample_time")?;

    // Null or unparsable values on a *present* field are per-record noise,
    // filtered like any other implausible sample.
    let (Some(imei), Some(latitude), Some(longitude), Some(sample_time)) = (
        as_string(&imei),
        as_f64(&latitude),
        as_f64(&longitude),
        as_timestamp(&sample_time),
    ) else {
        return Ok(None);
    };

    let speed_kmh = as_f64(&speed).unwrap_or(0.0);
    let ignition_on = as_bool(&ignition).unwrap_or(false);

    if latitude == 0.0 || longitude == 0.0 {
        return Ok(None);
    }
    if speed_kmh > MAX_PLAUSIBLE_SPEED_KMH {
        return Ok(None);
    }

    Ok(Some(TelemetrySample {
        imei,
        latitude,
        longitude,
        speed_kmh,
        ignition_on,
        sample_time,
    }))
}

fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => Some(n.as_f64().is_some_and(|v| v != 0.0)),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "on" | "yes" => Some(true),
            "0" | "false" | "off" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Timestamps arrive as epoch seconds, epoch milliseconds, RFC 3339, or the
/// vendor's `YYYY-MM-DD HH:MM:SS` (UTC) format.
fn as_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let raw = n.as_i64()?;
            // Millisecond epochs are 13 digits; second epochs 10.
            if raw > 10_000_000_000 {
                Utc.timestamp_millis_opt(raw).single()
            } else {
                Utc.timestamp_opt(raw, 0).single()
            }
        }
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                    .ok()
                    .map(|naive| naive.and_utc())
            }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_jsonp_wrapper() {
        let body = r#"loadVehicles([{"imei":"111","lat":3.1,"lng":-76.2,"speed":40,"acc":1,"timestamp":1717243200}]);"#;
        let samples = normalize_payload(body).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].imei, "111");
        assert!(samples[0].ignition_on);
    }

    #[test]
    fn accepts_bare_array_and_nested_object() {
        let bare = r#"[{"imei":"1","lat":3.0,"lng":-76.0,"speed":10,"acc":0,"timestamp":1717243200}]"#;
        assert_eq!(normalize_payload(bare).unwrap().len(), 1);

        let nested = r#"{"items":[{"deviceId":"2","latitude":"3.5","longitude":"-76.5","speed_kmh":"55.5","ignition":"on","gps_time":"2024-06-01 12:00:00"}]}"#;
        let samples = normalize_payload(nested).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].imei, "2");
        assert!((samples[0].speed_kmh - 55.5).abs() < 1e-9);
        assert!(samples[0].ignition_on);
    }

    #[test]
    fn payload_without_record_array_fails() {
        assert!(matches!(
            normalize_payload(r#"{"status":"ok"}"#),
            Err(FetchError::MissingRecordArray)
        ));
        assert!(matches!(
            normalize_payload("42"),
            Err(FetchError::MissingRecordArray)
        ));
    }

    #[test]
    fn missing_required_alias_fails_loudly() {
        // No imei alias at all — this is a schema problem, not noise.
        let body = r#"[{"lat":3.0,"lng":-76.0,"speed":10,"acc":0,"timestamp":1717243200}]"#;
        assert!(matches!(
            normalize_payload(body),
            Err(FetchError::MissingField { index: 0, field: "imei" })
        ));
    }

    #[test]
    fn drops_implausible_speed_and_zero_coordinates() {
        let body = r#"[
            {"imei":"fast","lat":3.0,"lng":-76.0,"speed":150,"acc":1,"timestamp":1717243200},
            {"imei":"origin","lat":0,"lng":0,"speed":30,"acc":1,"timestamp":1717243200},
            {"imei":"null-pos","lat":null,"lng":-76.0,"speed":30,"acc":1,"timestamp":1717243200},
            {"imei":"ok","lat":3.0,"lng":-76.0,"speed":119.9,"acc":1,"timestamp":1717243200}
        ]"#;
        let samples = normalize_payload(body).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].imei, "ok");
    }

    #[test]
    fn parses_millisecond_epochs() {
        let body = r#"[{"imei":"1","lat":3.0,"lng":-76.0,"speed":10,"acc":0,"timestamp":1717243200000}]"#;
        let samples = normalize_payload(body).unwrap();
        assert_eq!(samples[0].sample_time.timestamp(), 1_717_243_200);
    }

    #[test]
    fn numeric_imei_is_stringified() {
        let body = r#"[{"imei":350123456789,"lat":3.0,"lng":-76.0,"speed":10,"acc":0,"timestamp":1717243200}]"#;
        assert_eq!(normalize_payload(body).unwrap()[0].imei, "350123456789");
    }
}
