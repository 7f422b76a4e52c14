//! Ordered queue of students for one route execution
//!
//! Entries are ordered by stop sequence. Only the stop of the head of the
//! unresolved, zoned entries is ever evaluated against bus positions: the bus
//! visits stops in order, and a stop far down the route can be geometrically
//! close to the current position without being the next pickup. Students who
//! share the head's stop are evaluated with it.
//!
//! Entries whose stop has no usable geofence are flagged "no zone configured"
//! and skipped by the cursor. They stay unresolved until the driver marks them
//! or the route ends.

use crate::domain::attendance::StudentAttendance;
use crate::domain::types::{StudentId, StudentRouteEntry};
use crate::infra::error::GeofenceConfigError;
use crate::services::geofence::Geofence;
use rustc_hash::FxHashMap;
use tracing::warn;

/// One student's place in the queue
#[derive(Debug, Clone)]
pub struct QueueSlot {
    pub entry: StudentRouteEntry,
    pub zone: Result<Geofence, GeofenceConfigError>,
    pub attendance: StudentAttendance,
}

impl QueueSlot {
    fn new(entry: StudentRouteEntry) -> Self {
        let zone = Geofence::from_stop(&entry.stop);
        if let Err(e) = &zone {
            warn!(
                student_id = %entry.student_id,
                stop_id = %entry.stop.id,
                error = %e,
                "stop_no_zone_configured"
            );
        }
        let attendance = StudentAttendance::new(entry.student_id.clone());
        Self { entry, zone, attendance }
    }

    pub fn has_zone(&self) -> bool {
        self.zone.is_ok()
    }

    pub fn student_id(&self) -> &StudentId {
        &self.entry.student_id
    }
}

/// Students of the active route, ordered by stop sequence
#[derive(Debug, Clone)]
pub struct StudentQueue {
    slots: Vec<QueueSlot>,
    index: FxHashMap<StudentId, usize>,
    /// Position of the current head; `slots.len()` once exhausted
    cursor: usize,
}

impl StudentQueue {
    /// Build the queue. Ties in sequence index keep roster order.
    pub fn new(mut entries: Vec<StudentRouteEntry>) -> Self {
        entries.sort_by_key(|e| e.stop.sequence_index);
        let slots: Vec<QueueSlot> = entries.into_iter().map(QueueSlot::new).collect();
        let index = slots.iter().enumerate().map(|(i, s)| (s.student_id().clone(), i)).collect();
        let mut queue = Self { slots, index, cursor: 0 };
        queue.skip_resolved();
        queue
    }

    /// Current head: the first unresolved entry with a zone
    pub fn current(&self) -> Option<&QueueSlot> {
        self.slots.get(self.cursor)
    }

    pub fn current_mut(&mut self) -> Option<&mut QueueSlot> {
        self.slots.get_mut(self.cursor)
    }

    /// Move past the head once its attendance is final
    ///
    /// Returns true if the head changed.
    pub fn advance(&mut self) -> bool {
        let before = self.cursor;
        self.skip_resolved();
        self.cursor != before
    }

    fn skip_resolved(&mut self) {
        while let Some(slot) = self.slots.get(self.cursor) {
            if slot.has_zone() && !slot.attendance.is_final() {
                break;
            }
            self.cursor += 1;
        }
    }

    pub fn get(&self, student_id: &StudentId) -> Option<&QueueSlot> {
        self.index.get(student_id).map(|&i| &self.slots[i])
    }

    pub fn get_mut(&mut self, student_id: &StudentId) -> Option<&mut QueueSlot> {
        self.index.get(student_id).map(|&i| &mut self.slots[i])
    }

    /// Whether a student is the head or shares the head's stop
    pub fn is_at_current_stop(&self, student_id: &StudentId) -> bool {
        match (self.current(), self.get(student_id)) {
            (Some(head), Some(slot)) => head.entry.stop.id == slot.entry.stop.id,
            _ => false,
        }
    }

    /// Entries not yet sealed (including unzoned ones)
    pub fn remaining(&self) -> usize {
        self.slots.iter().filter(|s| !s.attendance.is_final()).count()
    }

    pub fn picked_up_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.attendance.is_final() && s.attendance.outcome().is_present())
            .count()
    }

    pub fn absent_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.attendance.is_final() && !s.attendance.outcome().is_present())
            .count()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueueSlot> {
        self.slots.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut QueueSlot> {
        self.slots.iter_mut()
    }
}
