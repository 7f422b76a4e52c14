//! Engine mutation handlers
//!
//! Each handler runs with the route state locked: apply, dispatch, publish.
//! Dispatch never blocks; persistence and events are queued to their workers.

use super::{EndReason, EngineShared, RouteSummary};
use crate::domain::events::RouteEvent;
use crate::domain::types::{LocationSample, RouteExecution, StudentId};
use crate::infra::error::CommandError;
use crate::io::record_store::AttendanceRecord;
use crate::services::route_state::{RouteState, SamplingStatus, StateChange};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

impl EngineShared {
    /// Announce the route and return the execution the sampler tags fixes with
    pub(super) fn route_started(&self) -> RouteExecution {
        let state = self.state.lock();
        let execution = state.execution().clone();
        info!(
            route_execution_id = %execution.id,
            route_id = %execution.route_id,
            bus_id = %execution.bus_id,
            students = %state.queue().len(),
            "route_started"
        );
        self.emit(RouteEvent::RouteStarted {
            route_execution_id: execution.id.clone(),
            route_id: execution.route_id.clone(),
            driver_id: execution.driver_id.clone(),
            bus_id: execution.bus_id.clone(),
            students: state.queue().len(),
            ts: execution.started_at,
        });
        self.publish(&state);
        execution
    }

    pub(super) fn apply_sample(&self, sample: &LocationSample) {
        let mut state = self.state.lock();
        let changes = state.apply_sample(sample, self.clock.now());
        self.dispatch(&state, changes);
        self.publish(&state);
    }

    pub(super) fn refresh_dwell(&self) {
        let mut state = self.state.lock();
        let changes = state.refresh_dwell(self.clock.now());
        if changes.is_empty() {
            return;
        }
        self.dispatch(&state, changes);
        self.publish(&state);
    }

    /// Republish after the sync gateway settled a write
    pub(super) fn refresh_sync(&self) {
        self.publish(&self.state.lock());
    }

    pub(super) fn set_sampling(&self, status: SamplingStatus) {
        let mut state = self.state.lock();
        state.set_sampling(status);
        self.publish(&state);
    }

    /// Seal every student, announce the end and wait for writes to settle
    pub(super) async fn finish(&self, reason: EndReason) -> RouteSummary {
        let (execution, picked_up, absent, decisions) = {
            let mut state = self.state.lock();
            let now = self.clock.now();
            let changes = state.end(now);
            self.dispatch(&state, changes);

            let snapshot = state.snapshot();
            let decisions = state
                .queue()
                .iter()
                .filter_map(|slot| slot.attendance.decision().cloned())
                .collect::<Vec<_>>();
            let execution = state.execution().clone();
            self.emit(RouteEvent::RouteEnded {
                route_execution_id: execution.id.clone(),
                route_id: execution.route_id.clone(),
                picked_up: snapshot.picked_up,
                absent: snapshot.absent,
                ts: now,
            });
            (execution, snapshot.picked_up, snapshot.absent, decisions)
        };

        let sync = self.sync.flush().await;
        self.publish(&self.state.lock());

        info!(
            route_execution_id = %execution.id,
            reason = %reason.as_str(),
            picked_up = %picked_up,
            absent = %absent,
            pending_sync = %sync.pending,
            needs_reconciliation = %sync.needs_reconciliation,
            "route_ended"
        );
        if sync.needs_reconciliation > 0 {
            warn!(count = %sync.needs_reconciliation, "route_ended_with_unsynced_records");
        }

        RouteSummary {
            route_execution_id: execution.id,
            end_reason: reason,
            picked_up,
            absent,
            decisions,
            sync,
        }
    }

    /// Run a driver command against the locked state
    fn command(
        &self,
        name: &'static str,
        student_id: Option<&StudentId>,
        apply: impl FnOnce(&mut RouteState, DateTime<Utc>) -> Result<Vec<StateChange>, CommandError>,
    ) -> Result<(), CommandError> {
        let mut state = self.state.lock();
        match apply(&mut state, self.clock.now()) {
            Ok(changes) => {
                self.metrics.record_command(true);
                info!(command = %name, student_id = ?student_id.map(StudentId::as_str), "driver_command_applied");
                self.dispatch(&state, changes);
                self.publish(&state);
                Ok(())
            }
            Err(e) => {
                self.metrics.record_command(false);
                warn!(command = %name, error = %e, "driver_command_rejected");
                Err(e)
            }
        }
    }

    /// Turn state changes into persistence jobs, events, metrics and logs
    fn dispatch(&self, state: &RouteState, changes: Vec<StateChange>) {
        let execution = state.execution();
        for change in changes {
            match change {
                StateChange::Approaching { student_id, stop_id, distance_m } => {
                    debug!(student_id = %student_id, distance_m = %distance_m.round(), "student_approaching");
                    self.emit(RouteEvent::StudentApproaching {
                        route_execution_id: execution.id.clone(),
                        student_id,
                        stop_id,
                        distance_m,
                        ts: self.clock.now(),
                    });
                }
                StateChange::EnteredZone { student_id, stop_id, distance_m } => {
                    self.metrics.record_zone_entry();
                    info!(
                        student_id = %student_id,
                        stop_id = %stop_id,
                        distance_m = %distance_m.round(),
                        "student_in_zone"
                    );
                    self.emit(RouteEvent::StudentInZone {
                        route_execution_id: execution.id.clone(),
                        student_id,
                        stop_id,
                        ts: self.clock.now(),
                    });
                }
                StateChange::DwellUpdated { .. } => {}
                StateChange::MarkRecorded { student_id, mark } => {
                    info!(student_id = %student_id, mark = ?mark, "manual_mark_recorded");
                }
                StateChange::Decided { decision, stop_id } => {
                    self.metrics.record_decision(decision.outcome, decision.dwell_seconds);
                    info!(
                        student_id = %decision.student_id,
                        stop_id = %stop_id,
                        outcome = %decision.outcome.as_str(),
                        reason = %decision.reason.as_str(),
                        dwell_seconds = ?decision.dwell_seconds,
                        "attendance_decided"
                    );
                    self.sync.persist_attendance(AttendanceRecord::from_decision(
                        execution,
                        stop_id.clone(),
                        &decision,
                    ));
                    let event = if decision.outcome.is_present() {
                        RouteEvent::StudentPickedUp {
                            route_execution_id: execution.id.clone(),
                            student_id: decision.student_id,
                            stop_id,
                            outcome: decision.outcome,
                            ts: decision.decided_at,
                        }
                    } else {
                        RouteEvent::StudentAbsent {
                            route_execution_id: execution.id.clone(),
                            student_id: decision.student_id,
                            stop_id,
                            ts: decision.decided_at,
                        }
                    };
                    self.emit(event);
                }
                StateChange::QueueAdvanced { next } => {
                    info!(next = ?next.as_ref().map(StudentId::as_str), "queue_advanced");
                }
            }
        }
    }

    fn emit(&self, event: RouteEvent) {
        if let Some(events) = &self.events {
            events.send_event(event);
        }
    }

    /// Publish a fresh snapshot with the sync counters filled in
    fn publish(&self, state: &RouteState) {
        let mut snapshot = state.snapshot();
        let report = self.sync.report();
        snapshot.pending_sync = report.pending;
        snapshot.needs_reconciliation = report.needs_reconciliation;
        snapshot.manual_mode |= report.needs_reconciliation > 0;
        self.snapshot_tx.send_replace(snapshot);
    }
}

/// Manual driver commands
///
/// Applied immediately against the same lock as position ticks. Clone to share
/// with the presentation layer.
#[derive(Clone)]
pub struct DriverCommands {
    shared: Arc<EngineShared>,
}

impl DriverCommands {
    pub(super) fn new(shared: Arc<EngineShared>) -> Self {
        Self { shared }
    }

    pub fn mark_absent(&self, student_id: &StudentId) -> Result<(), CommandError> {
        self.shared
            .command("mark_absent", Some(student_id), |state, now| state.mark_absent(student_id, now))
    }

    pub fn mark_present(&self, student_id: &StudentId) -> Result<(), CommandError> {
        self.shared
            .command("mark_present", Some(student_id), |state, now| state.mark_present(student_id, now))
    }

    /// Move past the current student
    pub fn advance_queue(&self) -> Result<(), CommandError> {
        self.shared.command("advance_queue", None, |state, now| state.advance_queue(now))
    }
}
