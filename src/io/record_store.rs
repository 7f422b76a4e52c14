//! Backing record store for attendance, location history and rosters
//!
//! Writes are idempotent by key: attendance by `(student_id,
//! route_execution_id)` and location by `(bus_id, captured_at)`. Writing a
//! record whose key is already stored is a successful no-op, so a retry after
//! a lost acknowledgement never creates a second record.
//!
//! Backends:
//! - `MemoryRecordStore` - in-process, for tests and demos
//! - `JsonlRecordStore` - append-only JSONL files in a data directory
//! - `HttpRecordStore` (see `http_store`) - managed REST backend

use crate::domain::attendance::{AttendanceDecision, AttendanceOutcome, DecisionReason};
use crate::domain::types::{
    BusId, DriverId, LocationSample, RouteExecution, RouteExecutionId, RouteId, Stop, StopId,
    StudentId, StudentRouteEntry,
};
use crate::infra::error::StoreResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Attendance row as stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub student_id: StudentId,
    pub route_execution_id: RouteExecutionId,
    pub route_id: RouteId,
    pub stop_id: StopId,
    pub outcome: AttendanceOutcome,
    pub reason: DecisionReason,
    pub decided_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dwell_seconds: Option<u64>,
}

impl AttendanceRecord {
    pub fn from_decision(
        execution: &RouteExecution,
        stop_id: StopId,
        decision: &AttendanceDecision,
    ) -> Self {
        Self {
            student_id: decision.student_id.clone(),
            route_execution_id: execution.id.clone(),
            route_id: execution.route_id.clone(),
            stop_id,
            outcome: decision.outcome,
            reason: decision.reason,
            decided_at: decision.decided_at,
            dwell_seconds: decision.dwell_seconds,
        }
    }

    /// Idempotence key
    pub fn key(&self) -> String {
        format!("{}:{}", self.route_execution_id, self.student_id)
    }
}

/// Location history row as stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationRecord {
    pub bus_id: BusId,
    pub driver_id: DriverId,
    pub route_execution_id: RouteExecutionId,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_kmh: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy_m: Option<f64>,
    pub captured_at: DateTime<Utc>,
}

impl LocationRecord {
    pub fn from_sample(execution: &RouteExecution, sample: &LocationSample) -> Self {
        Self {
            bus_id: execution.bus_id.clone(),
            driver_id: execution.driver_id.clone(),
            route_execution_id: execution.id.clone(),
            latitude: sample.latitude,
            longitude: sample.longitude,
            speed_kmh: sample.speed_kmh,
            accuracy_m: sample.accuracy_m,
            captured_at: sample.captured_at,
        }
    }

    /// Idempotence key (millisecond capture time)
    pub fn key(&self) -> String {
        format!("{}:{}", self.bus_id, self.captured_at.timestamp_millis())
    }
}

/// Flat roster row: one student with their stop
///
/// Radius is optional in stored rosters; missing radii take the configured
/// default when converted.
#[derive(Debug, Clone, Deserialize)]
pub struct RosterRow {
    pub student_id: String,
    pub display_name: String,
    #[serde(default)]
    pub parent_contact: Option<String>,
    pub route_id: String,
    pub stop_id: String,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub radius_meters: Option<f64>,
    pub sequence_index: u32,
}

impl RosterRow {
    pub fn into_entry(self, default_radius_m: f64) -> StudentRouteEntry {
        let stop = Stop {
            id: StopId::new(self.stop_id),
            latitude: self.latitude,
            longitude: self.longitude,
            radius_meters: self.radius_meters.unwrap_or(default_radius_m),
            sequence_index: self.sequence_index,
            route_id: RouteId::new(self.route_id),
        };
        StudentRouteEntry {
            student_id: StudentId::new(self.student_id),
            stop,
            display_name: self.display_name,
            parent_contact: self.parent_contact,
        }
    }
}

/// Entries of one route from a set of roster rows, ordered by stop sequence
pub fn route_entries(rows: Vec<RosterRow>, route_id: &RouteId, default_radius_m: f64) -> Vec<StudentRouteEntry> {
    let mut entries: Vec<StudentRouteEntry> = rows
        .into_iter()
        .filter(|r| r.route_id == route_id.as_str())
        .map(|r| r.into_entry(default_radius_m))
        .collect();
    entries.sort_by_key(|e| e.stop.sequence_index);
    entries
}

/// Result of an idempotent write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Created,
    /// A record with the same key already existed; nothing was written
    Duplicate,
}

/// Backing record store
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn upsert_attendance(&self, record: &AttendanceRecord) -> StoreResult<WriteOutcome>;

    async fn upsert_location(&self, record: &LocationRecord) -> StoreResult<WriteOutcome>;

    /// Students assigned to a route, ordered by stop sequence
    async fn load_route_entries(&self, route_id: &RouteId) -> StoreResult<Vec<StudentRouteEntry>>;
}

/// In-process record store
#[derive(Default)]
pub struct MemoryRecordStore {
    attendance: Mutex<FxHashMap<String, AttendanceRecord>>,
    locations: Mutex<FxHashMap<String, LocationRecord>>,
    roster: Mutex<Vec<StudentRouteEntry>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_roster(entries: Vec<StudentRouteEntry>) -> Self {
        let store = Self::new();
        *store.roster.lock() = entries;
        store
    }

    pub fn attendance(&self) -> Vec<AttendanceRecord> {
        let mut records: Vec<AttendanceRecord> = self.attendance.lock().values().cloned().collect();
        records.sort_by(|a, b| a.student_id.cmp(&b.student_id));
        records
    }

    pub fn attendance_for(&self, student_id: &StudentId) -> Vec<AttendanceRecord> {
        self.attendance.lock().values().filter(|r| &r.student_id == student_id).cloned().collect()
    }

    pub fn location_count(&self) -> usize {
        self.locations.lock().len()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn upsert_attendance(&self, record: &AttendanceRecord) -> StoreResult<WriteOutcome> {
        let mut attendance = self.attendance.lock();
        if attendance.contains_key(&record.key()) {
            return Ok(WriteOutcome::Duplicate);
        }
        attendance.insert(record.key(), record.clone());
        Ok(WriteOutcome::Created)
    }

    async fn upsert_location(&self, record: &LocationRecord) -> StoreResult<WriteOutcome> {
        let mut locations = self.locations.lock();
        if locations.contains_key(&record.key()) {
            return Ok(WriteOutcome::Duplicate);
        }
        locations.insert(record.key(), record.clone());
        Ok(WriteOutcome::Created)
    }

    async fn load_route_entries(&self, route_id: &RouteId) -> StoreResult<Vec<StudentRouteEntry>> {
        let mut entries: Vec<StudentRouteEntry> =
            self.roster.lock().iter().filter(|e| &e.stop.route_id == route_id).cloned().collect();
        entries.sort_by_key(|e| e.stop.sequence_index);
        Ok(entries)
    }
}

/// Append-only JSONL files with a key index rebuilt on open
///
/// Layout under the data directory:
/// - attendance.jsonl
/// - locations.jsonl
pub struct JsonlRecordStore {
    attendance_path: PathBuf,
    locations_path: PathBuf,
    roster_path: PathBuf,
    default_radius_m: f64,
    attendance_keys: tokio::sync::Mutex<FxHashSet<String>>,
    location_keys: tokio::sync::Mutex<FxHashSet<String>>,
}

impl JsonlRecordStore {
    /// Open the store, indexing any records already on disk
    pub fn open(data_dir: impl AsRef<Path>, roster_path: impl AsRef<Path>, default_radius_m: f64) -> StoreResult<Self> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir)?;

        let attendance_path = data_dir.join("attendance.jsonl");
        let locations_path = data_dir.join("locations.jsonl");
        let attendance_keys = index_keys::<AttendanceRecord>(&attendance_path, AttendanceRecord::key)?;
        let location_keys = index_keys::<LocationRecord>(&locations_path, LocationRecord::key)?;

        info!(
            data_dir = %data_dir.display(),
            attendance = %attendance_keys.len(),
            locations = %location_keys.len(),
            "jsonl_store_opened"
        );

        Ok(Self {
            attendance_path,
            locations_path,
            roster_path: roster_path.as_ref().to_path_buf(),
            default_radius_m,
            attendance_keys: tokio::sync::Mutex::new(attendance_keys),
            location_keys: tokio::sync::Mutex::new(location_keys),
        })
    }

    /// Append a line unless its key is already present
    ///
    /// The key set lock is held across the append so two writers of the same
    /// key cannot both pass the check.
    async fn append_once<T: Serialize>(
        path: &Path,
        keys: &tokio::sync::Mutex<FxHashSet<String>>,
        key: String,
        record: &T,
    ) -> StoreResult<WriteOutcome> {
        let mut keys = keys.lock().await;
        if keys.contains(&key) {
            return Ok(WriteOutcome::Duplicate);
        }
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(path).await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        debug!(file = %path.display(), bytes = %line.len(), "record_appended");

        keys.insert(key);
        Ok(WriteOutcome::Created)
    }
}

/// Read the keys of an existing JSONL file; unreadable lines are skipped
fn index_keys<T: serde::de::DeserializeOwned>(
    path: &Path,
    key: impl Fn(&T) -> String,
) -> StoreResult<FxHashSet<String>> {
    let mut keys = FxHashSet::default();
    if !path.exists() {
        return Ok(keys);
    }
    let content = std::fs::read_to_string(path)?;
    for (line_no, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(line) {
            Ok(record) => {
                keys.insert(key(&record));
            }
            Err(e) => {
                warn!(file = %path.display(), line = %(line_no + 1), error = %e, "record_line_skipped");
            }
        }
    }
    Ok(keys)
}

#[async_trait]
impl RecordStore for JsonlRecordStore {
    async fn upsert_attendance(&self, record: &AttendanceRecord) -> StoreResult<WriteOutcome> {
        Self::append_once(&self.attendance_path, &self.attendance_keys, record.key(), record).await
    }

    async fn upsert_location(&self, record: &LocationRecord) -> StoreResult<WriteOutcome> {
        Self::append_once(&self.locations_path, &self.location_keys, record.key(), record).await
    }

    async fn load_route_entries(&self, route_id: &RouteId) -> StoreResult<Vec<StudentRouteEntry>> {
        let content = tokio::fs::read_to_string(&self.roster_path).await?;
        let rows: Vec<RosterRow> = serde_json::from_str(&content)?;
        Ok(route_entries(rows, route_id, self.default_radius_m))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_767_600_000 + secs, 0).unwrap()
    }

    fn execution() -> RouteExecution {
        let mut execution = RouteExecution::start("r1".into(), "d1".into(), "bus-1".into(), ts(0));
        execution.id = RouteExecutionId::from("exec-1");
        execution
    }

    fn attendance(student: &str, outcome: AttendanceOutcome) -> AttendanceRecord {
        let decision = AttendanceDecision {
            student_id: StudentId::from(student),
            outcome,
            decided_at: ts(30),
            reason: DecisionReason::ZoneExit,
            dwell_seconds: Some(20),
        };
        AttendanceRecord::from_decision(&execution(), StopId::from("stop-1"), &decision)
    }

    fn location(secs: i64) -> LocationRecord {
        LocationRecord::from_sample(&execution(), &LocationSample::new(0.01, 0.0, ts(secs)))
    }

    const ROSTER: &str = r#"[
        {"student_id": "b", "display_name": "B", "route_id": "r1", "stop_id": "s2",
         "latitude": 0.02, "longitude": 0.0, "sequence_index": 2},
        {"student_id": "a", "display_name": "A", "route_id": "r1", "stop_id": "s1",
         "latitude": 0.01, "longitude": 0.0, "radius_meters": 80.0, "sequence_index": 1},
        {"student_id": "x", "display_name": "X", "route_id": "r2", "stop_id": "s9",
         "sequence_index": 1}
    ]"#;

    #[tokio::test]
    async fn test_memory_attendance_is_idempotent() {
        let store = MemoryRecordStore::new();
        let record = attendance("s1", AttendanceOutcome::AutoPresent);
        assert_eq!(store.upsert_attendance(&record).await.unwrap(), WriteOutcome::Created);
        assert_eq!(store.upsert_attendance(&record).await.unwrap(), WriteOutcome::Duplicate);
        assert_eq!(store.attendance_for(&StudentId::from("s1")).len(), 1);
    }

    #[tokio::test]
    async fn test_memory_location_keyed_by_bus_and_time() {
        let store = MemoryRecordStore::new();
        store.upsert_location(&location(0)).await.unwrap();
        store.upsert_location(&location(0)).await.unwrap();
        store.upsert_location(&location(10)).await.unwrap();
        assert_eq!(store.location_count(), 2);
    }

    #[tokio::test]
    async fn test_jsonl_idempotent_across_reopen() {
        let dir = tempdir().unwrap();
        let roster = dir.path().join("roster.json");
        {
            let store = JsonlRecordStore::open(dir.path(), &roster, 50.0).unwrap();
            let record = attendance("s1", AttendanceOutcome::ManualAbsent);
            store.upsert_attendance(&record).await.unwrap();
            store.upsert_attendance(&record).await.unwrap();
            store.upsert_location(&location(0)).await.unwrap();
        }

        let store = JsonlRecordStore::open(dir.path(), &roster, 50.0).unwrap();
        let again = store.upsert_attendance(&attendance("s1", AttendanceOutcome::ManualAbsent)).await;
        assert_eq!(again.unwrap(), WriteOutcome::Duplicate);

        let content = fs::read_to_string(dir.path().join("attendance.jsonl")).unwrap();
        assert_eq!(content.lines().count(), 1);
        let parsed: serde_json::Value = serde_json::from_str(content.trim()).unwrap();
        assert_eq!(parsed["outcome"], "manual_absent");
        assert_eq!(parsed["route_execution_id"], "exec-1");
    }

    #[tokio::test]
    async fn test_jsonl_roster_filters_and_orders() {
        let dir = tempdir().unwrap();
        let roster = dir.path().join("roster.json");
        fs::write(&roster, ROSTER).unwrap();

        let store = JsonlRecordStore::open(dir.path().join("data"), &roster, 45.0).unwrap();
        let entries = store.load_route_entries(&RouteId::from("r1")).await.unwrap();

        let ids: Vec<&str> = entries.iter().map(|e| e.student_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(entries[0].stop.radius_meters, 80.0);
        assert_eq!(entries[1].stop.radius_meters, 45.0);
    }

    #[tokio::test]
    async fn test_missing_roster_is_an_error() {
        let dir = tempdir().unwrap();
        let store = JsonlRecordStore::open(dir.path(), dir.path().join("nope.json"), 50.0).unwrap();
        assert!(store.load_route_entries(&RouteId::from("r1")).await.is_err());
    }
}
