//! Oracle configuration — TOML file, environment variables, defaults.
//!
//! ## Loading order
//!
//! 1. Explicit path passed on the command line (`--config`)
//! 2. `ORACLE_CONFIG` environment variable (path to TOML file)
//! 3. `oracle.toml` in the current working directory
//! 4. Built-in defaults
//!
//! Environment variables override the file for deploy-time secrets:
//! `ORACLE_VENDOR_ACCOUNT`, `ORACLE_VENDOR_SECRET`, `DATABASE_URL`.
//!
//! Vendor account credentials are required; a missing account id or secret is
//! a fatal startup error raised before the first cycle runs.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Configuration errors. All fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file {path} could not be read: {source}")]
    Unreadable {
        path: String,
        source: std::io::Error,
    },

    #[error("Config file {path} is not valid TOML: {source}")]
    Invalid {
        path: String,
        source: toml::de::Error,
    },

    #[error("Vendor account id missing — set [vendor] account_id or ORACLE_VENDOR_ACCOUNT")]
    MissingVendorAccount,

    #[error("Vendor secret missing — set [vendor] secret or ORACLE_VENDOR_SECRET")]
    MissingVendorSecret,

    #[error("Database URL missing — set database_url or DATABASE_URL")]
    MissingDatabaseUrl,
}

/// Vendor telemetry platform settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VendorConfig {
    /// Account identifier submitted on the vendor login form.
    pub account_id: String,
    /// Account secret submitted on the vendor login form.
    pub secret: String,
    /// Login surface driven by the credential harvester.
    pub login_url: String,
    /// Bulk fleet-position endpoint queried once per cycle.
    pub positions_url: String,
    /// URL substring identifying the authenticated fleet-data request whose
    /// query parameters carry the bearer token.
    pub data_request_marker: String,
}

impl Default for VendorConfig {
    fn default() -> Self {
        Self {
            account_id: String::new(),
            secret: String::new(),
            login_url: "https://gps.vendor.example/login".to_string(),
            positions_url: "https://gps.vendor.example/api/get_devices".to_string(),
            data_request_marker: "get_devices".to_string(),
        }
    }
}

/// Timer intervals for the polling orchestrator.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Geofence engine cycle interval in seconds (default: 180).
    pub engine_interval_secs: u64,
    /// Trend monitor cycle interval in seconds (default: 86400 = daily).
    pub trend_interval_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            engine_interval_secs: 180,
            trend_interval_secs: 86_400,
        }
    }
}

/// Top-level Oracle configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct OracleConfig {
    pub vendor: VendorConfig,
    pub polling: PollingConfig,
    /// PostgreSQL connection URL.
    pub database_url: String,
    /// Directory for diagnostic screenshots captured on login failure.
    pub screenshot_dir: Option<PathBuf>,
}

impl OracleConfig {
    /// Load configuration from an optional explicit path, applying
    /// environment and CLI overrides and validating required fields.
    pub fn load(
        cli_path: Option<&Path>,
        cli_database_url: Option<String>,
    ) -> Result<Self, ConfigError> {
        let path = cli_path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("ORACLE_CONFIG").ok().map(PathBuf::from))
            .or_else(|| {
                let default = PathBuf::from("oracle.toml");
                default.exists().then_some(default)
            });

        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(&path).map_err(|source| {
                    ConfigError::Unreadable {
                        path: path.display().to_string(),
                        source,
                    }
                })?;
                let config: Self =
                    toml::from_str(&raw).map_err(|source| ConfigError::Invalid {
                        path: path.display().to_string(),
                        source,
                    })?;
                info!(path = %path.display(), "Loaded Oracle config");
                config
            }
            None => {
                info!("No config file found, using built-in defaults");
                Self::default()
            }
        };

        config.apply_env_overrides();
        if let Some(url) = cli_database_url {
            config.database_url = url;
        }
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(account) = std::env::var("ORACLE_VENDOR_ACCOUNT") {
            self.vendor.account_id = account;
        }
        if let Ok(secret) = std::env::var("ORACLE_VENDOR_SECRET") {
            self.vendor.secret = secret;
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.database_url = url;
        }
    }

    /// Check required fields. Called by [`load`]; exposed for tests.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vendor.account_id.trim().is_empty() {
            return Err(ConfigError::MissingVendorAccount);
        }
        if self.vendor.secret.trim().is_empty() {
            return Err(ConfigError::MissingVendorSecret);
        }
        if self.database_url.trim().is_empty() {
            return Err(ConfigError::MissingDatabaseUrl);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_toml() -> &'static str {
        r#"
            database_url = "postgres://oracle:pw@localhost/oracle"

            [vendor]
            account_id = "acme-logistics"
            secret = "hunter2"
            login_url = "https://gps.example/login"
            positions_url = "https://gps.example/api/get_devices"

            [polling]
            engine_interval_secs = 60
        "#
    }

    #[test]
    fn parses_full_config() {
        let config: OracleConfig = toml::from_str(full_toml()).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.vendor.account_id, "acme-logistics");
        assert_eq!(config.polling.engine_interval_secs, 60);
        // Unspecified sections fall back to defaults
        assert_eq!(config.polling.trend_interval_secs, 86_400);
        assert_eq!(config.vendor.data_request_marker, "get_devices");
    }

    #[test]
    fn missing_vendor_account_is_fatal() {
        let config: OracleConfig = toml::from_str(
            r#"
            database_url = "postgres://x"
            [vendor]
            secret = "s"
            "#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingVendorAccount)
        ));
    }

    #[test]
    fn missing_secret_is_fatal() {
        let config: OracleConfig = toml::from_str(
            r#"
            database_url = "postgres://x"
            [vendor]
            account_id = "a"
            "#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingVendorSecret)
        ));
    }

    #[test]
    fn missing_database_url_is_fatal() {
        let config: OracleConfig = toml::from_str(
            r#"
            [vendor]
            account_id = "a"
            secret = "s"
            "#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingDatabaseUrl)
        ));
    }
}
