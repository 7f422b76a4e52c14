//! Domain models - core attendance types
//!
//! This module contains the canonical data types used throughout the system:
//! - `types` - identifiers, location samples, stops, route entries, route executions
//! - `attendance` - per-student attendance state machine and dwell window
//! - `events` - domain events for the notification dispatcher

pub mod attendance;
pub mod events;
pub mod types;
