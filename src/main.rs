//! Ridecheck - automatic attendance for school transport routes
//!
//! Runs one route execution: samples the bus position, detects arrival at
//! each student's stop and records attendance without driver input.
//!
//! Module structure:
//! - `domain/` - Core business types (identifiers, attendance, events)
//! - `io/` - External interfaces (positioning, record stores, MQTT, Prometheus)
//! - `services/` - Business logic (geofence, queue, engine, sampler, sync)
//! - `infra/` - Infrastructure (Config, errors, Metrics)

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use ridecheck::domain::types::RouteExecution;
use ridecheck::infra::config::SyncBackend;
use ridecheck::infra::{Config, Metrics};
use ridecheck::io::reconciliation_log::ReconciliationLog;
use ridecheck::io::record_store::RosterRow;
use ridecheck::io::{
    create_event_channel, HttpRecordStore, JsonlRecordStore, MemoryRecordStore, MqttPublisher, RecordStore,
    ReplayPositionProvider,
};
use ridecheck::services::{create_sync_gateway, AttendanceEngine, EngineSettings, SyncPolicy};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Ridecheck - geofence attendance for school routes
#[derive(Parser, Debug)]
#[command(name = "ridecheck", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "config/dev.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured logging with configurable level via RUST_LOG env var
    // Default: INFO, use RUST_LOG=debug for per-fix visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(version = %env!("CARGO_PKG_VERSION"), git_hash = %env!("GIT_HASH"), "ridecheck starting");

    let args = Args::parse();
    let config = Config::load_from_path(&args.config);

    info!(
        config_file = %config.config_file(),
        route_id = %config.route_id(),
        bus_id = %config.bus_id(),
        sample_interval_secs = %config.sample_interval().as_secs(),
        confirm_policy = ?config.confirm_policy(),
        sync_backend = ?config.sync_backend(),
        mqtt_enabled = %config.mqtt_enabled(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    // Roster comes from the same backend attendance is written to
    let store = build_store(&config)?;
    let entries = store
        .load_route_entries(config.route_id())
        .await
        .with_context(|| format!("Failed to load roster for route {}", config.route_id()))?;
    if entries.is_empty() {
        warn!(route_id = %config.route_id(), "roster_empty");
    }

    // Start sync gateway (owns the store; retries run off the hot path)
    let reconciliation_log = ReconciliationLog::new(config.reconciliation_file());
    let (sync, gateway) =
        create_sync_gateway(store, SyncPolicy::from_config(&config), metrics.clone(), Some(reconciliation_log));
    let gateway_task = tokio::spawn(gateway.run());

    // Create MQTT event channel and publisher (if enabled)
    let (events, publisher_task) = if config.mqtt_enabled() {
        let (sender, rx) = create_event_channel(1000, config.bus_id().clone(), metrics.clone());
        let publisher = MqttPublisher::new(&config, rx);
        let task = tokio::spawn(publisher.run(shutdown_rx.clone()));
        (Some(sender), Some(task))
    } else {
        (None, None)
    };

    let provider = ReplayPositionProvider::from_file(config.fixes_file())?.with_permission(!config.deny_permission());

    let execution = RouteExecution::start(
        config.route_id().clone(),
        config.driver_id().clone(),
        config.bus_id().clone(),
        Utc::now(),
    );
    let (engine, handles) = AttendanceEngine::new(
        execution,
        entries,
        EngineSettings::from_config(&config),
        Arc::new(provider),
        sync,
        events.clone(),
        metrics.clone(),
    );

    // Start Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_bus = config.bus_id().to_string();
        let prom_snapshot = handles.snapshots.clone();
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = ridecheck::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                prom_bus,
                prom_snapshot,
                prom_shutdown,
            )
            .await
            {
                error!(error = %e, "Prometheus metrics server error");
            }
        });
    }

    // Start metrics reporter (lock-free reads with full summary)
    let reporter_metrics = metrics.clone();
    let reporter_snapshot = handles.snapshots.clone();
    let reporter_events = events;
    let mut reporter_shutdown = shutdown_rx.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(metrics_interval));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let remaining = reporter_snapshot.borrow().remaining;
                    let summary = reporter_metrics.report(remaining);
                    summary.log();
                    if let Some(events) = &reporter_events {
                        events.send_metrics(&summary);
                    }
                }
                _ = reporter_shutdown.changed() => break,
            }
        }
    });

    // End the route on Ctrl+C; the engine seals every student before returning
    let control = handles.control.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        control.end().await;
    });

    let summary = engine.run().await;

    for decision in &summary.decisions {
        info!(
            student_id = %decision.student_id,
            outcome = %decision.outcome.as_str(),
            reason = %decision.reason.as_str(),
            "final_attendance"
        );
    }
    info!(
        route_execution_id = %summary.route_execution_id,
        end_reason = %summary.end_reason.as_str(),
        picked_up = %summary.picked_up,
        absent = %summary.absent,
        needs_reconciliation = %summary.sync.needs_reconciliation,
        "route_summary"
    );
    metrics.report(0).log();

    // Stop background tasks; the publisher drains queued events first
    let _ = shutdown_tx.send(true);
    drop(handles);
    if let Some(task) = publisher_task {
        if let Err(e) = task.await {
            error!(error = %e, "mqtt_publisher_task_failed");
        }
    }
    if let Err(e) = gateway_task.await {
        error!(error = %e, "sync_gateway_task_failed");
    }

    info!("ridecheck shutdown complete");
    Ok(())
}

/// Build the record store selected by `sync.backend`
fn build_store(config: &Config) -> anyhow::Result<Arc<dyn RecordStore>> {
    let store: Arc<dyn RecordStore> = match config.sync_backend() {
        SyncBackend::Memory => {
            let content = std::fs::read_to_string(config.roster_file())
                .with_context(|| format!("Failed to read roster file {}", config.roster_file()))?;
            let rows: Vec<RosterRow> = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse roster file {}", config.roster_file()))?;
            let entries = rows.into_iter().map(|r| r.into_entry(config.default_radius_m())).collect();
            Arc::new(MemoryRecordStore::with_roster(entries))
        }
        SyncBackend::File => {
            Arc::new(JsonlRecordStore::open(config.data_dir(), config.roster_file(), config.default_radius_m())?)
        }
        SyncBackend::Http => {
            let url = config.http_url().context("sync.http_url is required for the http backend")?;
            Arc::new(HttpRecordStore::new(url, config.http_api_key(), config.http_timeout(), config.default_radius_m())?)
        }
    };
    Ok(store)
}
