//! Shared types for the attendance engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default geofence radius around a stop, in meters
pub const DEFAULT_RADIUS_M: f64 = 50.0;

/// Declares a string-backed identifier newtype.
///
/// Backend identifiers are opaque strings (usually UUIDs); the newtypes keep a
/// student id from being passed where a stop id is expected.
macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }
    };
}

string_id!(
    /// Student identifier from the record store
    StudentId
);
string_id!(
    /// Stop identifier
    StopId
);
string_id!(
    /// Route identifier (the static route definition, not one day's run)
    RouteId
);
string_id!(
    /// Bus identifier
    BusId
);
string_id!(
    /// Driver identifier
    DriverId
);
string_id!(
    /// Identifier of a single route execution (UUIDv7, time-sortable)
    RouteExecutionId
);

impl RouteExecutionId {
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }
}

/// A single raw position fix from the positioning subsystem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_kmh: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy_m: Option<f64>,
    pub captured_at: DateTime<Utc>,
}

impl LocationSample {
    pub fn new(latitude: f64, longitude: f64, captured_at: DateTime<Utc>) -> Self {
        Self { latitude, longitude, speed_kmh: None, accuracy_m: None, captured_at }
    }

    pub fn with_speed_kmh(mut self, speed_kmh: f64) -> Self {
        self.speed_kmh = Some(speed_kmh);
        self
    }

    pub fn with_accuracy_m(mut self, accuracy_m: f64) -> Self {
        self.accuracy_m = Some(accuracy_m);
        self
    }
}

fn default_radius_m() -> f64 {
    DEFAULT_RADIUS_M
}

/// A pickup stop on a route
///
/// Coordinates are optional because the record store may hold stops that were
/// never geocoded; such stops produce a "no zone configured" entry instead of
/// a geofence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stop {
    pub id: StopId,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default = "default_radius_m")]
    pub radius_meters: f64,
    pub sequence_index: u32,
    pub route_id: RouteId,
}

impl Stop {
    pub fn new(
        id: impl Into<String>,
        latitude: f64,
        longitude: f64,
        sequence_index: u32,
        route_id: impl Into<String>,
    ) -> Self {
        Self {
            id: StopId::new(id),
            latitude: Some(latitude),
            longitude: Some(longitude),
            radius_meters: DEFAULT_RADIUS_M,
            sequence_index,
            route_id: RouteId::new(route_id),
        }
    }

    pub fn with_radius(mut self, radius_meters: f64) -> Self {
        self.radius_meters = radius_meters;
        self
    }
}

/// One student assigned to the active route
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentRouteEntry {
    pub student_id: StudentId,
    pub stop: Stop,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_contact: Option<String>,
}

impl StudentRouteEntry {
    pub fn new(student_id: impl Into<String>, display_name: impl Into<String>, stop: Stop) -> Self {
        Self {
            student_id: StudentId::new(student_id),
            stop,
            display_name: display_name.into(),
            parent_contact: None,
        }
    }
}

/// One day's run of a route by one driver and bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteExecution {
    pub id: RouteExecutionId,
    pub route_id: RouteId,
    pub driver_id: DriverId,
    pub bus_id: BusId,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub active: bool,
}

impl RouteExecution {
    /// Start a new execution with a freshly generated id
    pub fn start(route_id: RouteId, driver_id: DriverId, bus_id: BusId, at: DateTime<Utc>) -> Self {
        Self {
            id: RouteExecutionId::generate(),
            route_id,
            driver_id,
            bus_id,
            started_at: at,
            ended_at: None,
            active: true,
        }
    }

    /// Close the execution. Ending twice keeps the first end time.
    pub fn end(&mut self, at: DateTime<Utc>) {
        if self.ended_at.is_none() {
            self.ended_at = Some(at);
        }
        self.active = false;
    }

    pub fn is_ended(&self) -> bool {
        self.ended_at.is_some()
    }
}
