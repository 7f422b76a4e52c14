//! Prometheus metrics HTTP endpoint
//!
//! Exposes engine metrics in Prometheus text format at /metrics and the
//! current route snapshot as JSON at /route, for a presentation layer that
//! polls rather than subscribes.
//! Uses hyper for the HTTP server.

use crate::infra::metrics::{
    Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_DWELL_BOUNDS, METRICS_NUM_BUCKETS,
};
use crate::services::route_state::RouteSnapshot;
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with bus label
fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, bus: &str, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{bus=\"{bus}\"}} {val}");
}

/// Write a gauge metric with f64 value
fn write_gauge_f64(output: &mut String, name: &str, help: &str, bus: &str, val: f64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} gauge");
    let _ = writeln!(output, "{name}{{bus=\"{bus}\"}} {val:.6}");
}

/// Write a histogram metric with buckets and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    bus: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    bounds: &[u64; 10],
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in bounds.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{bus=\"{bus}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{bus=\"{bus}\",le=\"+Inf\"}} {cumulative}");
    let _ = writeln!(output, "{name}_count{{bus=\"{bus}\"}} {cumulative}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(metrics: &Metrics, snapshot: &RouteSnapshot, bus: &str) -> String {
    let summary = metrics.report(snapshot.remaining);
    let mut output = String::with_capacity(4096);

    write_sampling_metrics(&mut output, bus, &summary);
    write_attendance_metrics(&mut output, bus, &summary, snapshot);
    write_sync_metrics(&mut output, bus, &summary, snapshot);

    output
}

fn write_sampling_metrics(output: &mut String, bus: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "ridecheck_samples_total",
        "Position fixes processed",
        MetricType::Counter,
        bus,
        summary.samples_total,
    );
    write_metric(
        output,
        "ridecheck_sample_failures_total",
        "Position acquisitions that failed or timed out",
        MetricType::Counter,
        bus,
        summary.sample_failures_total,
    );
    write_gauge_f64(
        output,
        "ridecheck_ticks_per_min",
        "Fixes processed per minute since last scrape",
        bus,
        summary.ticks_per_min,
    );
    write_histogram(
        output,
        "ridecheck_tick_latency_us",
        "Tick processing latency in microseconds",
        bus,
        &summary.lat_buckets,
        &METRICS_BUCKET_BOUNDS,
    );
}

fn write_attendance_metrics(
    output: &mut String,
    bus: &str,
    summary: &MetricsSummary,
    snapshot: &RouteSnapshot,
) {
    let _ = writeln!(output, "# HELP ridecheck_decisions_total Sealed attendance decisions");
    let _ = writeln!(output, "# TYPE ridecheck_decisions_total counter");
    for (outcome, val) in [
        ("auto_present", summary.auto_present_total),
        ("manual_present", summary.manual_present_total),
        ("manual_absent", summary.manual_absent_total),
    ] {
        let _ = writeln!(output, "ridecheck_decisions_total{{bus=\"{bus}\",outcome=\"{outcome}\"}} {val}");
    }

    write_histogram(
        output,
        "ridecheck_dwell_seconds",
        "Time in the stop zone at decision",
        bus,
        &summary.dwell_buckets,
        &METRICS_DWELL_BOUNDS,
    );
    write_metric(
        output,
        "ridecheck_zone_entries_total",
        "Zone entries by the head of the queue",
        MetricType::Counter,
        bus,
        summary.zone_entries_total,
    );
    write_metric(
        output,
        "ridecheck_commands_total",
        "Driver commands accepted",
        MetricType::Counter,
        bus,
        summary.commands_total,
    );
    write_metric(
        output,
        "ridecheck_commands_rejected_total",
        "Driver commands rejected",
        MetricType::Counter,
        bus,
        summary.commands_rejected_total,
    );
    write_metric(
        output,
        "ridecheck_students_remaining",
        "Students without a terminal outcome",
        MetricType::Gauge,
        bus,
        snapshot.remaining as u64,
    );
    write_metric(
        output,
        "ridecheck_manual_mode",
        "Automatic detection degraded (1) or active (0)",
        MetricType::Gauge,
        bus,
        u64::from(snapshot.manual_mode),
    );
}

fn write_sync_metrics(output: &mut String, bus: &str, summary: &MetricsSummary, snapshot: &RouteSnapshot) {
    write_metric(
        output,
        "ridecheck_persist_attempts_total",
        "Store write attempts",
        MetricType::Counter,
        bus,
        summary.persist_attempts_total,
    );
    write_metric(
        output,
        "ridecheck_persist_retries_total",
        "Store write attempts after the first",
        MetricType::Counter,
        bus,
        summary.persist_retries_total,
    );
    write_metric(
        output,
        "ridecheck_persist_succeeded_total",
        "Store writes acknowledged",
        MetricType::Counter,
        bus,
        summary.persist_succeeded_total,
    );
    write_metric(
        output,
        "ridecheck_persist_exhausted_total",
        "Store writes that need manual reconciliation",
        MetricType::Counter,
        bus,
        summary.persist_exhausted_total,
    );
    write_metric(
        output,
        "ridecheck_persist_deduped_total",
        "Store writes skipped because the same key was in flight",
        MetricType::Counter,
        bus,
        summary.persist_deduped_total,
    );
    write_metric(
        output,
        "ridecheck_pending_sync",
        "Writes dispatched and not yet acknowledged",
        MetricType::Gauge,
        bus,
        snapshot.pending_sync as u64,
    );
    write_metric(
        output,
        "ridecheck_events_dropped_total",
        "Route events dropped due to channel full",
        MetricType::Counter,
        bus,
        summary.events_dropped,
    );
}

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    bus: Arc<String>,
    snapshot: watch::Receiver<RouteSnapshot>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let current = snapshot.borrow().clone();
            let body = format_prometheus_metrics(&metrics, &current, &bus);
            respond(StatusCode::OK, "text/plain; version=0.0.4; charset=utf-8", body)
        }
        (&Method::GET, "/route") => {
            let body = serde_json::to_vec(&*snapshot.borrow());
            match body {
                Ok(body) => respond(StatusCode::OK, "application/json", body),
                Err(e) => {
                    error!(error = %e, "route_snapshot_serialize_failed");
                    respond(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", "snapshot unavailable")
                }
            }
        }
        (&Method::GET, "/health") => respond(StatusCode::OK, "text/plain", "ok"),
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
    };
    Ok(response)
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    bus_id: String,
    snapshot: watch::Receiver<RouteSnapshot>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let bus = Arc::new(bus_id);

    info!(port = %port, bus = %bus, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let bus = bus.clone();
                        let snapshot = snapshot.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                let bus = bus.clone();
                                let snapshot = snapshot.clone();
                                async move { handle_request(req, metrics, bus, snapshot).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
