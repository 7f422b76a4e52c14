//! Services - business logic and state management
//!
//! This module contains the core business logic services:
//! - `geofence` - Circular stop zones and great-circle distance
//! - `student_queue` - Ordered queue of students along the route
//! - `route_state` - Authoritative per-route attendance state
//! - `engine` - Control loop tying sampling, dwell and driver commands together
//! - `sampler` - Periodic position acquisition
//! - `sync_gateway` - Retried, deduplicated persistence of records

pub mod engine;
pub mod geofence;
pub mod route_state;
pub mod sampler;
pub mod student_queue;
pub mod sync_gateway;

// Re-export commonly used types
pub use engine::{AttendanceEngine, DriverCommands, EngineSettings, RouteControl, RouteSummary};
pub use route_state::{RouteSnapshot, RouteState};
pub use sync_gateway::{create_sync_gateway, SyncGateway, SyncHandle, SyncPolicy};
