//! Typed channel for outbound route events
//!
//! Provides a non-blocking way to hand domain events to the dispatcher.
//! Uses bounded mpsc channels to prevent unbounded memory growth; when the
//! dispatcher falls behind, events are dropped and counted, never awaited.

use crate::domain::events::RouteEvent;
use crate::domain::types::BusId;
use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_NUM_BUCKETS};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Messages that can be sent to the dispatcher
#[derive(Debug)]
pub enum OutboundMessage {
    /// Domain event for notification fan-out
    Event(EventPayload),
    /// Periodic metrics snapshot
    Metrics(MetricsPayload),
}

impl OutboundMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        match self {
            OutboundMessage::Event(p) => serde_json::to_string(p),
            OutboundMessage::Metrics(p) => serde_json::to_string(p),
        }
    }
}

/// Domain event tagged with the bus it came from
#[derive(Debug, Clone, Serialize)]
pub struct EventPayload {
    pub bus_id: BusId,
    #[serde(flatten)]
    pub event: RouteEvent,
}

/// Payload for metrics snapshot
#[derive(Debug, Serialize)]
pub struct MetricsPayload {
    pub bus_id: BusId,
    /// Timestamp (epoch ms)
    pub ts: i64,
    pub samples_total: u64,
    pub sample_failures_total: u64,
    pub ticks_per_min: f64,
    /// Tick latency histogram buckets (Prometheus-style exponential)
    pub lat_buckets: [u64; METRICS_NUM_BUCKETS],
    pub lat_p99_us: u64,
    pub auto_present: u64,
    pub manual_present: u64,
    pub manual_absent: u64,
    pub remaining: usize,
    pub pending_sync: u64,
    pub persist_exhausted: u64,
    pub events_dropped: u64,
}

impl MetricsPayload {
    pub fn from_summary(summary: &MetricsSummary, bus_id: BusId) -> Self {
        Self {
            bus_id,
            ts: Utc::now().timestamp_millis(),
            samples_total: summary.samples_total,
            sample_failures_total: summary.sample_failures_total,
            ticks_per_min: summary.ticks_per_min,
            lat_buckets: summary.lat_buckets,
            lat_p99_us: summary.lat_p99_us,
            auto_present: summary.auto_present_total,
            manual_present: summary.manual_present_total,
            manual_absent: summary.manual_absent_total,
            remaining: summary.remaining_students,
            pending_sync: summary.pending_sync,
            persist_exhausted: summary.persist_exhausted_total,
            events_dropped: summary.events_dropped,
        }
    }
}

/// Sender handle for outbound events
///
/// Clone this to share across multiple producers.
/// Non-blocking - if the channel is full, messages are dropped.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<OutboundMessage>,
    bus_id: BusId,
    metrics: Arc<Metrics>,
}

impl EventSender {
    pub fn new(tx: mpsc::Sender<OutboundMessage>, bus_id: BusId, metrics: Arc<Metrics>) -> Self {
        Self { tx, bus_id, metrics }
    }

    /// Send a domain event
    pub fn send_event(&self, event: RouteEvent) {
        let kind = event.as_str();
        let payload = EventPayload { bus_id: self.bus_id.clone(), event };
        if self.tx.try_send(OutboundMessage::Event(payload)).is_err() {
            self.metrics.record_event_dropped();
            debug!(event = %kind, "route_event_dropped");
        }
    }

    /// Send a metrics snapshot
    pub fn send_metrics(&self, summary: &MetricsSummary) {
        let payload = MetricsPayload::from_summary(summary, self.bus_id.clone());
        let _ = self.tx.try_send(OutboundMessage::Metrics(payload));
    }
}

/// Create a new event channel pair
///
/// Returns (sender, receiver) where sender can be cloned and shared.
pub fn create_event_channel(
    buffer_size: usize,
    bus_id: BusId,
    metrics: Arc<Metrics>,
) -> (EventSender, mpsc::Receiver<OutboundMessage>) {
    let (tx, rx) = mpsc::channel(buffer_size);
    (EventSender::new(tx, bus_id, metrics), rx)
}
