//! Authoritative in-memory state of one route execution
//!
//! `RouteState` owns the student queue and every student's state machine. It
//! is synchronous and free of I/O: callers pass the time in and receive a list
//! of `StateChange`s describing what happened, which the engine turns into
//! persistence jobs, domain events and metrics.
//!
//! Every mutation goes through one `&mut self` method, so wrapping the state
//! in a single mutex makes ticks and manual commands mutually exclusive.

use crate::domain::attendance::{
    AttendanceDecision, AttendanceOutcome, ConfirmPolicy, DecisionReason, ManualMark, Transition,
};
use crate::domain::types::{
    LocationSample, RouteExecution, RouteExecutionId, RouteId, StopId, StudentId, StudentRouteEntry,
};
use crate::infra::error::CommandError;
use crate::services::student_queue::StudentQueue;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// State of automatic position sampling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingStatus {
    Starting,
    Active,
    PermissionDenied,
    Stopped,
}

/// One observable effect of a state mutation
#[derive(Debug, Clone, PartialEq)]
pub enum StateChange {
    Approaching { student_id: StudentId, stop_id: StopId, distance_m: f64 },
    EnteredZone { student_id: StudentId, stop_id: StopId, distance_m: f64 },
    DwellUpdated { student_id: StudentId, elapsed_seconds: u64 },
    MarkRecorded { student_id: StudentId, mark: ManualMark },
    Decided { decision: AttendanceDecision, stop_id: StopId },
    QueueAdvanced { next: Option<StudentId> },
}

impl StateChange {
    pub fn decision(&self) -> Option<&AttendanceDecision> {
        match self {
            StateChange::Decided { decision, .. } => Some(decision),
            _ => None,
        }
    }
}

/// Per-student view for the presentation layer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StudentSnapshot {
    pub student_id: StudentId,
    pub display_name: String,
    pub stop_id: StopId,
    pub sequence_index: u32,
    pub outcome: AttendanceOutcome,
    pub is_final: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_m: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dwell_seconds: Option<u64>,
    pub no_zone: bool,
}

/// Whole-route view for the presentation layer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteSnapshot {
    pub route_execution_id: RouteExecutionId,
    pub route_id: RouteId,
    pub active: bool,
    pub sampling: SamplingStatus,
    /// Automatic detection is degraded; the driver must mark attendance by hand
    pub manual_mode: bool,
    pub current_student: Option<StudentId>,
    pub remaining: usize,
    pub picked_up: usize,
    pub absent: usize,
    /// Writes dispatched but not yet acknowledged by the store
    pub pending_sync: usize,
    /// Writes that exhausted their retries
    pub needs_reconciliation: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_position: Option<LocationSample>,
    pub students: Vec<StudentSnapshot>,
}

/// Authoritative state for one route execution
pub struct RouteState {
    execution: RouteExecution,
    queue: StudentQueue,
    policy: ConfirmPolicy,
    sampling: SamplingStatus,
    last_position: Option<LocationSample>,
}

impl RouteState {
    pub fn new(execution: RouteExecution, entries: Vec<StudentRouteEntry>, policy: ConfirmPolicy) -> Self {
        Self {
            execution,
            queue: StudentQueue::new(entries),
            policy,
            sampling: SamplingStatus::Starting,
            last_position: None,
        }
    }

    pub fn execution(&self) -> &RouteExecution {
        &self.execution
    }

    pub fn queue(&self) -> &StudentQueue {
        &self.queue
    }

    pub fn is_ended(&self) -> bool {
        self.execution.is_ended()
    }

    pub fn sampling(&self) -> SamplingStatus {
        self.sampling
    }

    pub fn set_sampling(&mut self, status: SamplingStatus) {
        if !self.is_ended() {
            self.sampling = status;
        }
    }

    pub fn last_position(&self) -> Option<&LocationSample> {
        self.last_position.as_ref()
    }

    pub fn outcome_of(&self, student_id: &StudentId) -> Option<AttendanceOutcome> {
        self.queue.get(student_id).map(|s| s.attendance.outcome())
    }

    /// Process one position fix against the current stop
    ///
    /// Every unresolved student waiting at the head's stop shares its zone and
    /// is evaluated together; no other stop is looked at. When the fix seals
    /// the stop (the bus left its zone), the next head is evaluated against the
    /// same fix.
    ///
    /// `now` is the processing time. Zone entry and dwell are timed on it, so
    /// a fix stamped earlier or later than its arrival cannot skew the dwell
    /// counter; `captured_at` only identifies the persisted location.
    pub fn apply_sample(&mut self, sample: &LocationSample, now: DateTime<Utc>) -> Vec<StateChange> {
        let mut changes = Vec::new();
        if self.is_ended() {
            return changes;
        }
        self.last_position = Some(sample.clone());

        while let Some(stop_id) = self.queue.current().map(|s| s.entry.stop.id.clone()) {
            let mut sealed = false;
            for slot in self.queue.iter_mut() {
                if slot.entry.stop.id != stop_id || slot.attendance.is_final() {
                    continue;
                }
                let Ok(zone) = &slot.zone else {
                    continue;
                };
                let result = zone.evaluate_sample(sample);
                let transition = slot.attendance.observe(
                    result.inside_zone,
                    result.distance_m,
                    now,
                    self.policy,
                );
                let student_id = slot.student_id().clone();
                sealed |= push_transition(&mut changes, student_id, stop_id.clone(), transition);
            }
            if !sealed || !self.advance(&mut changes) {
                break;
            }
        }
        changes
    }

    /// Advance dwell counters from the clock
    pub fn refresh_dwell(&mut self, now: DateTime<Utc>) -> Vec<StateChange> {
        let mut changes = Vec::new();
        if self.is_ended() {
            return changes;
        }
        let mut sealed = false;
        for slot in self.queue.iter_mut().filter(|s| s.attendance.is_in_zone()) {
            let transition = slot.attendance.refresh_dwell(now, self.policy);
            let student_id = slot.student_id().clone();
            let stop_id = slot.entry.stop.id.clone();
            sealed |= push_transition(&mut changes, student_id, stop_id, transition);
        }
        if sealed {
            self.advance(&mut changes);
        }
        changes
    }

    pub fn mark_absent(
        &mut self,
        student_id: &StudentId,
        now: DateTime<Utc>,
    ) -> Result<Vec<StateChange>, CommandError> {
        self.mark(student_id, ManualMark::Absent, now)
    }

    pub fn mark_present(
        &mut self,
        student_id: &StudentId,
        now: DateTime<Utc>,
    ) -> Result<Vec<StateChange>, CommandError> {
        self.mark(student_id, ManualMark::Present, now)
    }

    /// Apply a manual mark
    ///
    /// Accepted for the head, for students sharing the head's stop, and for
    /// students whose stop has no zone configured.
    fn mark(
        &mut self,
        student_id: &StudentId,
        mark: ManualMark,
        now: DateTime<Utc>,
    ) -> Result<Vec<StateChange>, CommandError> {
        if self.is_ended() {
            return Err(CommandError::RouteEnded);
        }
        let slot =
            self.queue.get(student_id).ok_or_else(|| CommandError::UnknownStudent(student_id.clone()))?;
        if slot.attendance.is_final() {
            return Err(CommandError::AlreadyFinal(student_id.clone()));
        }
        if slot.has_zone() && !self.queue.is_at_current_stop(student_id) {
            return Err(CommandError::NotCurrent(student_id.clone()));
        }

        let mut changes = Vec::new();
        let Some(slot) = self.queue.get_mut(student_id) else {
            return Err(CommandError::UnknownStudent(student_id.clone()));
        };
        let transition = slot.attendance.mark(mark, now)?;
        let stop_id = slot.entry.stop.id.clone();
        if push_transition(&mut changes, student_id.clone(), stop_id, transition) {
            self.advance(&mut changes);
        }
        Ok(changes)
    }

    /// Driver skips ahead: seal the head with its implied outcome
    ///
    /// In the zone this is the manual mark or AutoPresent; a head that was never
    /// reached is sealed ManualAbsent. The new head is evaluated on the next fix.
    pub fn advance_queue(&mut self, now: DateTime<Utc>) -> Result<Vec<StateChange>, CommandError> {
        if self.is_ended() {
            return Err(CommandError::RouteEnded);
        }
        let slot = self.queue.current_mut().ok_or(CommandError::QueueEmpty)?;
        let transition = slot.attendance.release(now, DecisionReason::QueueAdvanced);
        let student_id = slot.student_id().clone();
        let stop_id = slot.entry.stop.id.clone();

        let mut changes = Vec::new();
        push_transition(&mut changes, student_id, stop_id, transition);
        self.advance(&mut changes);
        Ok(changes)
    }

    /// End the route execution and seal every unresolved student
    ///
    /// Students still in the zone get their implied outcome; everyone else is
    /// sealed ManualAbsent. Idempotent: a second call returns no changes.
    pub fn end(&mut self, now: DateTime<Utc>) -> Vec<StateChange> {
        let mut changes = Vec::new();
        if self.is_ended() {
            return changes;
        }
        for slot in self.queue.iter_mut() {
            let transition = slot.attendance.release(now, DecisionReason::RouteEnded);
            let student_id = slot.student_id().clone();
            let stop_id = slot.entry.stop.id.clone();
            push_transition(&mut changes, student_id, stop_id, transition);
        }
        self.queue.advance();
        self.execution.end(now);
        self.sampling = SamplingStatus::Stopped;
        changes
    }

    /// Move the cursor past sealed entries. Returns true if the head changed.
    fn advance(&mut self, changes: &mut Vec<StateChange>) -> bool {
        if !self.queue.advance() {
            return false;
        }
        let next = self.queue.current().map(|s| s.student_id().clone());
        changes.push(StateChange::QueueAdvanced { next });
        true
    }

    /// Build a presentation snapshot (sync counters are filled in by the engine)
    pub fn snapshot(&self) -> RouteSnapshot {
        let students = self
            .queue
            .iter()
            .map(|slot| StudentSnapshot {
                student_id: slot.student_id().clone(),
                display_name: slot.entry.display_name.clone(),
                stop_id: slot.entry.stop.id.clone(),
                sequence_index: slot.entry.stop.sequence_index,
                outcome: slot.attendance.outcome(),
                is_final: slot.attendance.is_final(),
                distance_m: slot.attendance.last_distance_m(),
                dwell_seconds: slot.attendance.dwell().map(|d| d.elapsed_seconds),
                no_zone: !slot.has_zone(),
            })
            .collect();

        RouteSnapshot {
            route_execution_id: self.execution.id.clone(),
            route_id: self.execution.route_id.clone(),
            active: self.execution.active,
            sampling: self.sampling,
            manual_mode: self.sampling == SamplingStatus::PermissionDenied,
            current_student: self.queue.current().map(|s| s.student_id().clone()),
            remaining: self.queue.remaining(),
            picked_up: self.queue.picked_up_count(),
            absent: self.queue.absent_count(),
            pending_sync: 0,
            needs_reconciliation: 0,
            last_position: self.last_position.clone(),
            students,
        }
    }
}

/// Record a transition as a state change. Returns true if it sealed a decision.
fn push_transition(
    changes: &mut Vec<StateChange>,
    student_id: StudentId,
    stop_id: StopId,
    transition: Transition,
) -> bool {
    match transition {
        Transition::Unchanged => return false,
        Transition::Approaching { distance_m } => {
            changes.push(StateChange::Approaching { student_id, stop_id, distance_m })
        }
        Transition::EnteredZone { distance_m } => {
            changes.push(StateChange::EnteredZone { student_id, stop_id, distance_m })
        }
        Transition::DwellUpdated { elapsed_seconds } => {
            changes.push(StateChange::DwellUpdated { student_id, elapsed_seconds })
        }
        Transition::MarkRecorded { mark } => changes.push(StateChange::MarkRecorded { student_id, mark }),
        Transition::Decided(decision) => {
            changes.push(StateChange::Decided { decision, stop_id });
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::Stop;

    const ROUTE: &str = "route-7";

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_767_600_000 + secs, 0).unwrap()
    }

    /// Stops spaced ~1.1 km apart along a meridian
    fn entry(id: &str, seq: u32) -> StudentRouteEntry {
        StudentRouteEntry::new(id, id.to_uppercase(), Stop::new(format!("stop-{id}"), 0.01 * seq as f64, 0.0, seq, ROUTE))
    }

    fn state(entries: Vec<StudentRouteEntry>) -> RouteState {
        state_with_policy(entries, ConfirmPolicy::OnExit)
    }

    fn state_with_policy(entries: Vec<StudentRouteEntry>, policy: ConfirmPolicy) -> RouteState {
        let execution = RouteExecution::start(ROUTE.into(), "driver-1".into(), "bus-1".into(), t(0));
        RouteState::new(execution, entries, policy)
    }

    fn at(lat: f64, lon: f64, secs: i64) -> LocationSample {
        LocationSample::new(lat, lon, t(secs))
    }

    fn sid(id: &str) -> StudentId {
        StudentId::from(id)
    }

    fn decisions(changes: &[StateChange]) -> Vec<(String, AttendanceOutcome)> {
        changes
            .iter()
            .filter_map(StateChange::decision)
            .map(|d| (d.student_id.to_string(), d.outcome))
            .collect()
    }

    #[test]
    fn test_end_to_end_two_students() {
        let mut route = state(vec![entry("a", 1), entry("b", 2)]);
        let a_lat = 0.01;

        // tick1: far from A
        let changes = route.apply_sample(&at(0.0, 0.0, 0), t(0));
        assert!(matches!(changes[0], StateChange::Approaching { .. }));
        assert_eq!(route.outcome_of(&sid("a")), Some(AttendanceOutcome::Approaching));

        // tick2: inside A's 50m radius
        let changes = route.apply_sample(&at(a_lat + 0.0002, 0.0, 10), t(10));
        assert!(matches!(changes[0], StateChange::EnteredZone { .. }));
        assert_eq!(route.outcome_of(&sid("a")), Some(AttendanceOutcome::InZone));
        assert_eq!(route.snapshot().students[0].dwell_seconds, Some(0));

        // tick3: still inside, dwell grows
        let changes = route.apply_sample(&at(a_lat, 0.0001, 20), t(20));
        assert_eq!(
            changes,
            vec![StateChange::DwellUpdated { student_id: sid("a"), elapsed_seconds: 10 }]
        );

        // tick4: outside, no manual command
        let changes = route.apply_sample(&at(a_lat + 0.002, 0.0, 30), t(30));
        assert_eq!(decisions(&changes), vec![("a".to_string(), AttendanceOutcome::AutoPresent)]);
        assert!(changes.contains(&StateChange::QueueAdvanced { next: Some(sid("b")) }));
        assert_eq!(route.queue().current().unwrap().student_id(), &sid("b"));
        // B is evaluated against the same fix
        assert_eq!(route.outcome_of(&sid("b")), Some(AttendanceOutcome::Approaching));
        assert_eq!(route.snapshot().picked_up, 1);
    }

    #[test]
    fn test_only_head_is_evaluated() {
        let mut route = state(vec![entry("a", 1), entry("b", 2), entry("c", 3)]);

        // Inside B's zone, outside A's
        let changes = route.apply_sample(&at(0.02, 0.0, 0), t(0));
        assert_eq!(changes.len(), 1);
        assert_eq!(route.outcome_of(&sid("a")), Some(AttendanceOutcome::Approaching));
        assert_eq!(route.outcome_of(&sid("b")), Some(AttendanceOutcome::Pending));
        assert_eq!(route.outcome_of(&sid("c")), Some(AttendanceOutcome::Pending));

        route.apply_sample(&at(0.02, 0.0, 10), t(10));
        assert_eq!(route.outcome_of(&sid("b")), Some(AttendanceOutcome::Pending));
    }

    #[test]
    fn test_manual_absent_survives_continued_presence() {
        let policy = ConfirmPolicy::AfterDwell { seconds: 20 };
        let mut route = state_with_policy(vec![entry("a", 1), entry("b", 2)], policy);
        route.apply_sample(&at(0.01, 0.0, 0), t(0));
        route.mark_absent(&sid("a"), t(2)).unwrap();

        for secs in [10, 20, 30, 60] {
            let changes = route.apply_sample(&at(0.01, 0.0, secs), t(secs));
            assert!(decisions(&changes).is_empty());
            route.refresh_dwell(t(secs + 1));
        }
        assert_eq!(route.outcome_of(&sid("a")), Some(AttendanceOutcome::ManualAbsent));

        // Only an explicit mark changes it, and only before exit
        route.mark_present(&sid("a"), t(61)).unwrap();
        assert_eq!(route.outcome_of(&sid("a")), Some(AttendanceOutcome::ManualPresent));
        route.mark_absent(&sid("a"), t(62)).unwrap();

        let changes = route.apply_sample(&at(0.015, 0.0, 70), t(70));
        assert_eq!(decisions(&changes), vec![("a".to_string(), AttendanceOutcome::ManualAbsent)]);
        assert_eq!(route.mark_present(&sid("a"), t(71)), Err(CommandError::AlreadyFinal(sid("a"))));
    }

    #[test]
    fn test_dwell_threshold_policy_seals_and_advances() {
        let policy = ConfirmPolicy::AfterDwell { seconds: 30 };
        let mut route = state_with_policy(vec![entry("a", 1), entry("b", 2)], policy);
        route.apply_sample(&at(0.01, 0.0, 0), t(0));

        assert!(decisions(&route.refresh_dwell(t(29))).is_empty());
        let changes = route.refresh_dwell(t(30));
        assert_eq!(decisions(&changes), vec![("a".to_string(), AttendanceOutcome::AutoPresent)]);
        assert_eq!(route.queue().current().unwrap().student_id(), &sid("b"));
    }

    #[test]
    fn test_dwell_timed_on_processing_clock() {
        let policy = ConfirmPolicy::AfterDwell { seconds: 60 };
        let mut route = state_with_policy(vec![entry("a", 1)], policy);

        // Cached fix, captured five minutes before it arrived
        route.apply_sample(&at(0.01, 0.0, 0), t(300));
        let changes = route.refresh_dwell(t(301));
        assert!(decisions(&changes).is_empty());
        assert_eq!(route.snapshot().students[0].dwell_seconds, Some(1));

        route.apply_sample(&at(0.01, 0.0, 10), t(310));
        assert_eq!(route.snapshot().students[0].dwell_seconds, Some(10));
        assert_eq!(route.outcome_of(&sid("a")), Some(AttendanceOutcome::InZone));
    }

    #[test]
    fn test_commands_limited_to_current_stop() {
        let mut route = state(vec![entry("a", 1), entry("b", 2)]);
        assert_eq!(route.mark_absent(&sid("b"), t(0)), Err(CommandError::NotCurrent(sid("b"))));
        assert_eq!(
            route.mark_absent(&sid("zed"), t(0)),
            Err(CommandError::UnknownStudent(sid("zed")))
        );
    }

    #[test]
    fn test_manual_mode_marks_seal_head() {
        let mut route = state(vec![entry("a", 1), entry("b", 2)]);
        route.set_sampling(SamplingStatus::PermissionDenied);
        assert!(route.snapshot().manual_mode);

        let changes = route.mark_present(&sid("a"), t(5)).unwrap();
        assert_eq!(decisions(&changes), vec![("a".to_string(), AttendanceOutcome::ManualPresent)]);
        assert_eq!(route.queue().current().unwrap().student_id(), &sid("b"));
    }

    #[test]
    fn test_siblings_share_the_stop_zone() {
        let a = entry("a", 1);
        let mut sibling = entry("sib", 1);
        sibling.stop = a.stop.clone();
        let mut route = state(vec![a, sibling, entry("c", 2)]);

        route.apply_sample(&at(0.01, 0.0, 0), t(0));
        assert_eq!(route.outcome_of(&sid("a")), Some(AttendanceOutcome::InZone));
        assert_eq!(route.outcome_of(&sid("sib")), Some(AttendanceOutcome::InZone));
        assert_eq!(route.outcome_of(&sid("c")), Some(AttendanceOutcome::Pending));

        // A mark on the sibling is provisional while the bus is at the stop
        let changes = route.mark_absent(&sid("sib"), t(3)).unwrap();
        assert_eq!(changes, vec![StateChange::MarkRecorded { student_id: sid("sib"), mark: ManualMark::Absent }]);

        let changes = route.apply_sample(&at(0.0125, 0.0, 20), t(20));
        assert_eq!(
            decisions(&changes),
            vec![
                ("a".to_string(), AttendanceOutcome::AutoPresent),
                ("sib".to_string(), AttendanceOutcome::ManualAbsent),
            ]
        );
        assert_eq!(route.queue().current().unwrap().student_id(), &sid("c"));
        assert_eq!(route.outcome_of(&sid("c")), Some(AttendanceOutcome::Approaching));
    }

    #[test]
    fn test_sibling_marked_before_arrival_is_sealed() {
        let a = entry("a", 1);
        let mut sibling = entry("sib", 1);
        sibling.stop = a.stop.clone();
        let mut route = state(vec![a, sibling, entry("c", 2)]);

        route.apply_sample(&at(0.0, 0.0, 0), t(0));
        let changes = route.mark_present(&sid("sib"), t(3)).unwrap();
        assert_eq!(decisions(&changes), vec![("sib".to_string(), AttendanceOutcome::ManualPresent)]);
        // Head is untouched
        assert_eq!(route.outcome_of(&sid("a")), Some(AttendanceOutcome::Approaching));
    }

    #[test]
    fn test_unzoned_entry_flagged_and_markable() {
        let mut unzoned = entry("b", 2);
        unzoned.stop.longitude = None;
        let mut route = state(vec![entry("a", 1), unzoned, entry("c", 3)]);

        let snapshot = route.snapshot();
        assert!(snapshot.students[1].no_zone);
        assert!(!snapshot.students[0].no_zone);

        let changes = route.mark_absent(&sid("b"), t(1)).unwrap();
        assert_eq!(decisions(&changes), vec![("b".to_string(), AttendanceOutcome::ManualAbsent)]);
        assert_eq!(route.queue().current().unwrap().student_id(), &sid("a"));
    }

    #[test]
    fn test_advance_queue_seals_head() {
        let mut route = state(vec![entry("a", 1), entry("b", 2), entry("c", 3)]);
        route.apply_sample(&at(0.0, 0.0, 0), t(0));
        let changes = route.advance_queue(t(5)).unwrap();
        assert_eq!(decisions(&changes), vec![("a".to_string(), AttendanceOutcome::ManualAbsent)]);

        route.apply_sample(&at(0.02, 0.0, 10), t(10));
        let changes = route.advance_queue(t(15)).unwrap();
        assert_eq!(decisions(&changes), vec![("b".to_string(), AttendanceOutcome::AutoPresent)]);

        route.advance_queue(t(16)).unwrap();
        assert_eq!(route.advance_queue(t(17)), Err(CommandError::QueueEmpty));
    }

    #[test]
    fn test_end_finalizes_everyone() {
        let mut unzoned = entry("d", 4);
        unzoned.stop.latitude = None;
        let mut route = state(vec![entry("a", 1), entry("b", 2), entry("c", 3), unzoned]);

        route.apply_sample(&at(0.01, 0.0, 0), t(0)); // a in zone
        let changes = route.end(t(100));
        let mut got = decisions(&changes);
        got.sort_by(|x, y| x.0.cmp(&y.0));
        assert_eq!(
            got,
            vec![
                ("a".to_string(), AttendanceOutcome::AutoPresent),
                ("b".to_string(), AttendanceOutcome::ManualAbsent),
                ("c".to_string(), AttendanceOutcome::ManualAbsent),
                ("d".to_string(), AttendanceOutcome::ManualAbsent),
            ]
        );

        // No survivor is left non-terminal
        let snapshot = route.snapshot();
        assert!(snapshot.students.iter().all(|s| s.is_final && s.outcome.is_terminal()));
        assert!(!snapshot.active);
        assert_eq!(snapshot.remaining, 0);
        assert_eq!(route.execution().ended_at, Some(t(100)));

        // Nothing is accepted afterwards
        assert!(route.end(t(200)).is_empty());
        assert!(route.apply_sample(&at(0.02, 0.0, 210), t(210)).is_empty());
        assert_eq!(route.mark_present(&sid("b"), t(220)), Err(CommandError::RouteEnded));
    }
}
