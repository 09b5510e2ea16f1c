//! Fleet Oracle daemon.
//!
//! Wires the credential cache, telemetry fetcher, geofence engine, and trend
//! monitor together and hands them to the polling orchestrator. Runs until
//! SIGINT.
//!
//! # Environment variables
//!
//! - `ORACLE_CONFIG`: path to the TOML config file (default: `oracle.toml`)
//! - `ORACLE_VENDOR_ACCOUNT` / `ORACLE_VENDOR_SECRET`: vendor login (required)
//! - `DATABASE_URL`: PostgreSQL connection URL (required)
//! - `RUST_LOG`: logging filter (default: info)

use anyhow::{Context, Result};
use clap::Parser;
use fleet_oracle::clock::SystemClock;
use fleet_oracle::config::OracleConfig;
use fleet_oracle::credentials::{BrowserHarvester, CredentialCache};
use fleet_oracle::engine::GeofenceEngine;
use fleet_oracle::orchestrator::{self, Orchestrator};
use fleet_oracle::store::{self, PgStore};
use fleet_oracle::telemetry::VendorTelemetryFetcher;
use fleet_oracle::trend::TrendMonitor;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fleet-oracle")]
#[command(about = "Telemetry ingestion and geofence event engine")]
#[command(version)]
struct CliArgs {
    /// Path to the TOML config file (overrides ORACLE_CONFIG)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// PostgreSQL connection URL (overrides config file and DATABASE_URL)
    #[arg(long, value_name = "URL")]
    database_url: Option<String>,

    /// Run one engine cycle and one trend cycle, then exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = CliArgs::parse();

    // Missing vendor credentials are fatal here, before the first cycle.
    let config = OracleConfig::load(args.config.as_deref(), args.database_url.clone())
        .context("Loading Oracle configuration")?;

    let pool = store::create_pool(&config.database_url)
        .await
        .context("Connecting to PostgreSQL")?;
    store::run_migrations(&pool)
        .await
        .context("Running database migrations")?;

    let store = Arc::new(PgStore::new(pool));
    let clock = Arc::new(SystemClock);

    let screenshot_dir = config
        .screenshot_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("diagnostics"));
    let harvester = Arc::new(BrowserHarvester::new(
        &config.vendor.login_url,
        &config.vendor.account_id,
        &config.vendor.secret,
        &config.vendor.data_request_marker,
        screenshot_dir,
    ));
    let credentials = Arc::new(CredentialCache::new(harvester, clock.clone()));
    let source = Arc::new(VendorTelemetryFetcher::new(
        &config.vendor.positions_url,
        credentials,
    ));

    let mut engine = GeofenceEngine::new(source, store.clone(), clock);
    let monitor = TrendMonitor::new(store);

    if args.once {
        let stats = engine.run_cycle().await.context("Engine cycle failed")?;
        info!(?stats, "Engine cycle complete");
        let alerts = monitor
            .detect_growth_anomalies()
            .await
            .context("Trend cycle failed")?;
        info!(alerts, "Trend cycle complete");
        return Ok(());
    }

    let (report_tx, report_rx) = mpsc::channel(32);
    let orchestrator = Orchestrator::new(engine, monitor, &config.polling, report_tx);

    let shutdown = CancellationToken::new();
    let logger = tokio::spawn(orchestrator::log_reports(report_rx));
    let runner = tokio::spawn(orchestrator.run(shutdown.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("Listening for shutdown signal")?;
    info!("Shutdown signal received");
    shutdown.cancel();

    runner.await.ok();
    logger.await.ok();
    info!("Fleet Oracle stopped");
    Ok(())
}
