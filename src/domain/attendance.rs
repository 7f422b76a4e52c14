//! Per-student attendance state machine
//!
//! Each student on the route owns one `StudentAttendance`. It moves forward only:
//!
//! ```text
//! Pending -> Approaching -> InZone -> { AutoPresent | ManualAbsent | ManualPresent }
//! ```
//!
//! While in the zone the driver may record a manual mark (absent or present)
//! and flip it any number of times. The mark is provisional until the bus
//! leaves the zone or the queue moves on; at that point the last mark (or
//! AutoPresent when there is none) is sealed and never changes again.

use crate::domain::types::StudentId;
use crate::infra::error::CommandError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Attendance outcome visible to the rest of the system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceOutcome {
    Pending,
    Approaching,
    InZone,
    AutoPresent,
    ManualAbsent,
    ManualPresent,
}

impl AttendanceOutcome {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceOutcome::Pending => "pending",
            AttendanceOutcome::Approaching => "approaching",
            AttendanceOutcome::InZone => "in_zone",
            AttendanceOutcome::AutoPresent => "auto_present",
            AttendanceOutcome::ManualAbsent => "manual_absent",
            AttendanceOutcome::ManualPresent => "manual_present",
        }
    }

    /// Whether this value can be a sealed decision
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AttendanceOutcome::AutoPresent
                | AttendanceOutcome::ManualAbsent
                | AttendanceOutcome::ManualPresent
        )
    }

    /// Whether the student rode the bus
    pub fn is_present(&self) -> bool {
        matches!(self, AttendanceOutcome::AutoPresent | AttendanceOutcome::ManualPresent)
    }
}

/// Manual driver mark
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManualMark {
    Absent,
    Present,
}

impl ManualMark {
    fn outcome(self) -> AttendanceOutcome {
        match self {
            ManualMark::Absent => AttendanceOutcome::ManualAbsent,
            ManualMark::Present => AttendanceOutcome::ManualPresent,
        }
    }
}

/// When an in-zone student with no manual mark is confirmed present
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfirmPolicy {
    /// Confirm when the bus leaves the zone (or the queue moves on)
    #[default]
    OnExit,
    /// Also confirm once the bus has dwelt this long inside the zone
    AfterDwell { seconds: u64 },
}

/// Why a decision was sealed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    ZoneExit,
    DwellThreshold,
    DriverCommand,
    QueueAdvanced,
    RouteEnded,
}

impl DecisionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionReason::ZoneExit => "zone_exit",
            DecisionReason::DwellThreshold => "dwell_threshold",
            DecisionReason::DriverCommand => "driver_command",
            DecisionReason::QueueAdvanced => "queue_advanced",
            DecisionReason::RouteEnded => "route_ended",
        }
    }
}

/// A sealed attendance decision, ready to be persisted
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceDecision {
    pub student_id: StudentId,
    pub outcome: AttendanceOutcome,
    pub decided_at: DateTime<Utc>,
    pub reason: DecisionReason,
    /// Seconds spent in the zone, if the student ever entered it
    pub dwell_seconds: Option<u64>,
}

/// Time the bus has spent inside one student's zone
///
/// Exists only while the student is in the zone. Entry and refreshes must
/// come from the same clock. Elapsed time has 1 second resolution and never
/// moves backwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DwellWindow {
    pub student_id: StudentId,
    pub entered_zone_at: DateTime<Utc>,
    pub elapsed_seconds: u64,
}

impl DwellWindow {
    pub fn new(student_id: StudentId, entered_zone_at: DateTime<Utc>) -> Self {
        Self { student_id, entered_zone_at, elapsed_seconds: 0 }
    }

    /// Update elapsed time. Returns true if the visible second count changed.
    pub fn refresh(&mut self, now: DateTime<Utc>) -> bool {
        let elapsed = (now - self.entered_zone_at).num_seconds().max(0) as u64;
        if elapsed > self.elapsed_seconds {
            self.elapsed_seconds = elapsed;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone)]
enum Phase {
    Pending,
    Approaching,
    InZone { dwell: DwellWindow, mark: Option<ManualMark> },
    Final { decision: AttendanceDecision },
}

/// What a single observation or command did to a student
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Unchanged,
    Approaching { distance_m: f64 },
    EnteredZone { distance_m: f64 },
    DwellUpdated { elapsed_seconds: u64 },
    MarkRecorded { mark: ManualMark },
    Decided(AttendanceDecision),
}

/// Attendance state machine for one student in one route execution
#[derive(Debug, Clone)]
pub struct StudentAttendance {
    student_id: StudentId,
    phase: Phase,
    last_distance_m: Option<f64>,
}

impl StudentAttendance {
    pub fn new(student_id: StudentId) -> Self {
        Self { student_id, phase: Phase::Pending, last_distance_m: None }
    }

    pub fn student_id(&self) -> &StudentId {
        &self.student_id
    }

    /// Current outcome. In the zone, a provisional manual mark shows through.
    pub fn outcome(&self) -> AttendanceOutcome {
        match &self.phase {
            Phase::Pending => AttendanceOutcome::Pending,
            Phase::Approaching => AttendanceOutcome::Approaching,
            Phase::InZone { mark: Some(mark), .. } => mark.outcome(),
            Phase::InZone { mark: None, .. } => AttendanceOutcome::InZone,
            Phase::Final { decision } => decision.outcome,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self.phase, Phase::Final { .. })
    }

    pub fn is_in_zone(&self) -> bool {
        matches!(self.phase, Phase::InZone { .. })
    }

    pub fn decision(&self) -> Option<&AttendanceDecision> {
        match &self.phase {
            Phase::Final { decision } => Some(decision),
            _ => None,
        }
    }

    pub fn dwell(&self) -> Option<&DwellWindow> {
        match &self.phase {
            Phase::InZone { dwell, .. } => Some(dwell),
            _ => None,
        }
    }

    pub fn manual_mark(&self) -> Option<ManualMark> {
        match &self.phase {
            Phase::InZone { mark, .. } => *mark,
            _ => None,
        }
    }

    pub fn last_distance_m(&self) -> Option<f64> {
        self.last_distance_m
    }

    /// Feed one geofence evaluation
    pub fn observe(
        &mut self,
        inside_zone: bool,
        distance_m: f64,
        at: DateTime<Utc>,
        policy: ConfirmPolicy,
    ) -> Transition {
        if self.is_final() {
            return Transition::Unchanged;
        }
        self.last_distance_m = Some(distance_m);

        match &mut self.phase {
            Phase::Pending | Phase::Approaching if inside_zone => {
                self.phase = Phase::InZone {
                    dwell: DwellWindow::new(self.student_id.clone(), at),
                    mark: None,
                };
                Transition::EnteredZone { distance_m }
            }
            Phase::Pending => {
                self.phase = Phase::Approaching;
                Transition::Approaching { distance_m }
            }
            Phase::Approaching => Transition::Unchanged,
            Phase::InZone { dwell, mark } => {
                if !inside_zone {
                    let outcome = mark.map(ManualMark::outcome).unwrap_or(AttendanceOutcome::AutoPresent);
                    return self.seal(outcome, at, DecisionReason::ZoneExit);
                }
                let changed = dwell.refresh(at);
                if let Some(decided) = self.check_dwell_threshold(at, policy) {
                    return decided;
                }
                match (changed, self.dwell()) {
                    (true, Some(d)) => Transition::DwellUpdated { elapsed_seconds: d.elapsed_seconds },
                    _ => Transition::Unchanged,
                }
            }
            Phase::Final { .. } => Transition::Unchanged,
        }
    }

    /// Advance the dwell counter from the clock, without a position fix
    pub fn refresh_dwell(&mut self, now: DateTime<Utc>, policy: ConfirmPolicy) -> Transition {
        let Phase::InZone { dwell, .. } = &mut self.phase else {
            return Transition::Unchanged;
        };
        if !dwell.refresh(now) {
            return Transition::Unchanged;
        }
        let elapsed_seconds = dwell.elapsed_seconds;
        self.check_dwell_threshold(now, policy)
            .unwrap_or(Transition::DwellUpdated { elapsed_seconds })
    }

    /// Apply a driver mark
    ///
    /// In the zone the mark is provisional. Before the zone was reached (manual
    /// mode, unconfigured stop) the mark is sealed at once.
    pub fn mark(&mut self, mark: ManualMark, at: DateTime<Utc>) -> Result<Transition, CommandError> {
        match &mut self.phase {
            Phase::Final { .. } => Err(CommandError::AlreadyFinal(self.student_id.clone())),
            Phase::InZone { mark: current, .. } => {
                *current = Some(mark);
                Ok(Transition::MarkRecorded { mark })
            }
            Phase::Pending | Phase::Approaching => {
                Ok(self.seal(mark.outcome(), at, DecisionReason::DriverCommand))
            }
        }
    }

    /// Seal whatever outcome is implied right now
    ///
    /// In the zone: the manual mark, or AutoPresent. Never reached: ManualAbsent.
    pub fn release(&mut self, at: DateTime<Utc>, reason: DecisionReason) -> Transition {
        let outcome = match &self.phase {
            Phase::Final { .. } => return Transition::Unchanged,
            Phase::InZone { mark, .. } => {
                mark.map(ManualMark::outcome).unwrap_or(AttendanceOutcome::AutoPresent)
            }
            Phase::Pending | Phase::Approaching => AttendanceOutcome::ManualAbsent,
        };
        self.seal(outcome, at, reason)
    }

    fn check_dwell_threshold(&mut self, at: DateTime<Utc>, policy: ConfirmPolicy) -> Option<Transition> {
        let ConfirmPolicy::AfterDwell { seconds } = policy else {
            return None;
        };
        match &self.phase {
            // A manual mark always wins over the timer
            Phase::InZone { dwell, mark: None } if dwell.elapsed_seconds >= seconds => {
                Some(self.seal(AttendanceOutcome::AutoPresent, at, DecisionReason::DwellThreshold))
            }
            _ => None,
        }
    }

    fn seal(&mut self, outcome: AttendanceOutcome, at: DateTime<Utc>, reason: DecisionReason) -> Transition {
        let dwell_seconds = self.dwell().map(|d| d.elapsed_seconds);
        let decision = AttendanceDecision {
            student_id: self.student_id.clone(),
            outcome,
            decided_at: at,
            reason,
            dwell_seconds,
        };
        self.phase = Phase::Final { decision: decision.clone() };
        Transition::Decided(decision)
    }
}
