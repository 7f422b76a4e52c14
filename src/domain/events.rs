//! Domain events handed to the notification dispatcher
//!
//! The engine only states what happened; wording, recipients and delivery
//! tokens belong to the dispatcher.

use crate::domain::attendance::AttendanceOutcome;
use crate::domain::types::{BusId, DriverId, RouteExecutionId, RouteId, StopId, StudentId};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum RouteEvent {
    RouteStarted {
        route_execution_id: RouteExecutionId,
        route_id: RouteId,
        driver_id: DriverId,
        bus_id: BusId,
        students: usize,
        ts: DateTime<Utc>,
    },
    /// Informational: the student's stop is next ("en camino")
    StudentApproaching {
        route_execution_id: RouteExecutionId,
        student_id: StudentId,
        stop_id: StopId,
        distance_m: f64,
        ts: DateTime<Utc>,
    },
    /// Informational: the bus is inside the student's stop zone
    StudentInZone {
        route_execution_id: RouteExecutionId,
        student_id: StudentId,
        stop_id: StopId,
        ts: DateTime<Utc>,
    },
    StudentPickedUp {
        route_execution_id: RouteExecutionId,
        student_id: StudentId,
        stop_id: StopId,
        outcome: AttendanceOutcome,
        ts: DateTime<Utc>,
    },
    StudentAbsent {
        route_execution_id: RouteExecutionId,
        student_id: StudentId,
        stop_id: StopId,
        ts: DateTime<Utc>,
    },
    RouteEnded {
        route_execution_id: RouteExecutionId,
        route_id: RouteId,
        picked_up: usize,
        absent: usize,
        ts: DateTime<Utc>,
    },
}

impl RouteEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteEvent::RouteStarted { .. } => "route_started",
            RouteEvent::StudentApproaching { .. } => "student_approaching",
            RouteEvent::StudentInZone { .. } => "student_in_zone",
            RouteEvent::StudentPickedUp { .. } => "student_picked_up",
            RouteEvent::StudentAbsent { .. } => "student_absent",
            RouteEvent::RouteEnded { .. } => "route_ended",
        }
    }

    /// Attendance-bearing events are published with at-least-once delivery
    pub fn is_attendance(&self) -> bool {
        matches!(
            self,
            RouteEvent::StudentPickedUp { .. }
                | RouteEvent::StudentAbsent { .. }
                | RouteEvent::RouteStarted { .. }
                | RouteEvent::RouteEnded { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_tag() {
        let event = RouteEvent::StudentAbsent {
            route_execution_id: RouteExecutionId::from("exec-1"),
            student_id: StudentId::from("s1"),
            stop_id: StopId::from("stop-1"),
            ts: DateTime::from_timestamp(1_767_600_000, 0).unwrap(),
        };
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["t"], "student_absent");
        assert_eq!(json["student_id"], "s1");
        assert_eq!(event.as_str(), "student_absent");
        assert!(event.is_attendance());
    }
}
