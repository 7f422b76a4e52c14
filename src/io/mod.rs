//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `positioning` - Position provider interface and file replay
//! - `record_store` - Record store interface, in-memory and JSONL stores
//! - `http_store` - REST record store
//! - `event_channel` - Typed channel for outbound route events
//! - `mqtt_events` - MQTT publisher for route events and metrics
//! - `reconciliation_log` - Writes that exhausted their retries (JSONL format)
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod event_channel;
pub mod http_store;
pub mod mqtt_events;
pub mod positioning;
pub mod prometheus;
pub mod reconciliation_log;
pub mod record_store;

// Re-export commonly used types
pub use event_channel::{create_event_channel, EventSender, OutboundMessage};
pub use http_store::HttpRecordStore;
pub use mqtt_events::MqttPublisher;
pub use positioning::{PositionProvider, ReplayPositionProvider};
pub use record_store::{JsonlRecordStore, MemoryRecordStore, RecordStore};
