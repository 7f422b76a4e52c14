//! End-to-end route scenarios through the public engine API

use chrono::Utc;
use ridecheck::domain::attendance::{AttendanceOutcome, ConfirmPolicy, DecisionReason};
use ridecheck::domain::types::{RouteExecution, RouteId, Stop, StudentRouteEntry};
use ridecheck::infra::Metrics;
use ridecheck::io::positioning::ReplayStep;
use ridecheck::io::record_store::{AttendanceRecord, WriteOutcome};
use ridecheck::io::{JsonlRecordStore, MemoryRecordStore, RecordStore, ReplayPositionProvider};
use ridecheck::services::engine::EndReason;
use ridecheck::services::sampler::SamplerSettings;
use ridecheck::services::{create_sync_gateway, AttendanceEngine, EngineSettings, RouteSummary, SyncPolicy};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

const ROSTER: &str = r#"[
  {"student_id": "s1", "display_name": "Ana", "route_id": "r-am", "stop_id": "stop-a",
   "latitude": 0.01, "longitude": 0.0, "sequence_index": 1},
  {"student_id": "s2", "display_name": "Beto", "route_id": "r-am", "stop_id": "stop-a",
   "latitude": 0.01, "longitude": 0.0, "sequence_index": 1},
  {"student_id": "s3", "display_name": "Caro", "route_id": "r-am", "stop_id": "stop-b",
   "latitude": 0.02, "longitude": 0.0, "radius_meters": 80.0, "sequence_index": 2},
  {"student_id": "s4", "display_name": "Dani", "route_id": "r-am", "stop_id": "stop-x",
   "sequence_index": 3},
  {"student_id": "s9", "display_name": "Other", "route_id": "r-pm", "stop_id": "stop-z",
   "latitude": 0.5, "longitude": 0.5, "sequence_index": 1}
]"#;

fn settings(policy: ConfirmPolicy) -> EngineSettings {
    EngineSettings {
        policy,
        sampler: SamplerSettings { interval: Duration::from_secs(10), high_accuracy: true },
        dwell_tick: Duration::from_secs(1),
        background_grace: Duration::from_secs(120),
    }
}

fn fixes(points: &[(f64, f64)]) -> ReplayPositionProvider {
    let base = Utc::now();
    let steps = points
        .iter()
        .enumerate()
        .map(|(i, &(lat, lon))| ReplayStep::fix_at(lat, lon, base + chrono::Duration::seconds(10 * i as i64)))
        .collect();
    ReplayPositionProvider::new(steps)
}

async fn run_route(
    store: Arc<dyn RecordStore>,
    provider: ReplayPositionProvider,
    policy: ConfirmPolicy,
) -> RouteSummary {
    let route_id = RouteId::from("r-am");
    let entries = store.load_route_entries(&route_id).await.unwrap();
    let metrics = Arc::new(Metrics::new());
    let (sync, gateway) = create_sync_gateway(store, SyncPolicy::default(), metrics.clone(), None);
    tokio::spawn(gateway.run());

    let execution = RouteExecution::start(route_id, "driver-1".into(), "bus-1".into(), Utc::now());
    let (engine, _handles) =
        AttendanceEngine::new(execution, entries, settings(policy), Arc::new(provider), sync, None, metrics);
    engine.run().await
}

fn outcome(summary: &RouteSummary, id: &str) -> Option<AttendanceOutcome> {
    summary.decisions.iter().find(|d| d.student_id.as_str() == id).map(|d| d.outcome)
}

#[tokio::test(start_paused = true)]
async fn test_full_route_against_jsonl_store() {
    let dir = tempdir().unwrap();
    let roster_path = dir.path().join("roster.json");
    std::fs::write(&roster_path, ROSTER).unwrap();
    let data_dir = dir.path().join("data");
    let store = Arc::new(JsonlRecordStore::open(&data_dir, &roster_path, 50.0).unwrap());

    let provider = fixes(&[
        (0.0, 0.0),    // approaching stop A
        (0.01, 0.0),   // at stop A: s1 and s2 in zone
        (0.01, 0.0),
        (0.0125, 0.0), // left A
        (0.0196, 0.0), // inside stop B's 80 m zone
        (0.0225, 0.0), // left B
    ]);
    let summary = run_route(store.clone(), provider, ConfirmPolicy::OnExit).await;

    assert_eq!(summary.end_reason, EndReason::PositionSourceClosed);
    assert_eq!(outcome(&summary, "s1"), Some(AttendanceOutcome::AutoPresent));
    assert_eq!(outcome(&summary, "s2"), Some(AttendanceOutcome::AutoPresent));
    assert_eq!(outcome(&summary, "s3"), Some(AttendanceOutcome::AutoPresent));
    // No zone configured: never detected, sealed when the route ends
    assert_eq!(outcome(&summary, "s4"), Some(AttendanceOutcome::ManualAbsent));
    assert_eq!(outcome(&summary, "s9"), None);
    assert_eq!((summary.picked_up, summary.absent), (3, 1));
    assert_eq!(summary.sync.pending, 0);
    assert_eq!(summary.sync.needs_reconciliation, 0);

    let attendance = std::fs::read_to_string(data_dir.join("attendance.jsonl")).unwrap();
    assert_eq!(attendance.lines().count(), 4);
    let locations = std::fs::read_to_string(data_dir.join("locations.jsonl")).unwrap();
    assert_eq!(locations.lines().count(), 6);

    // A retried write after a lost ack must not duplicate the record
    let first: AttendanceRecord = serde_json::from_str(attendance.lines().next().unwrap()).unwrap();
    let reopened = JsonlRecordStore::open(&data_dir, &roster_path, 50.0).unwrap();
    assert_eq!(reopened.upsert_attendance(&first).await.unwrap(), WriteOutcome::Duplicate);
    let attendance = std::fs::read_to_string(data_dir.join("attendance.jsonl")).unwrap();
    assert_eq!(attendance.lines().count(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_after_dwell_policy_confirms_while_stopped() {
    let entries = vec![
        StudentRouteEntry::new("s1", "Ana", Stop::new("stop-a", 0.01, 0.0, 1, "r-am")),
        StudentRouteEntry::new("s3", "Caro", Stop::new("stop-b", 0.02, 0.0, 2, "r-am")),
    ];
    let store = Arc::new(MemoryRecordStore::with_roster(entries));

    // Parked at stop A for 20 seconds, never leaving
    let provider = fixes(&[(0.01, 0.0), (0.01, 0.0), (0.01, 0.0)]);
    let summary = run_route(store.clone(), provider, ConfirmPolicy::AfterDwell { seconds: 20 }).await;

    let s1 = summary.decisions.iter().find(|d| d.student_id.as_str() == "s1").unwrap();
    assert_eq!(s1.outcome, AttendanceOutcome::AutoPresent);
    assert_eq!(s1.reason, DecisionReason::DwellThreshold);
    assert_eq!(s1.dwell_seconds, Some(20));

    // s3 was the head when the fixes ran out
    let s3 = summary.decisions.iter().find(|d| d.student_id.as_str() == "s3").unwrap();
    assert_eq!(s3.outcome, AttendanceOutcome::ManualAbsent);
    assert_eq!(s3.reason, DecisionReason::RouteEnded);
    assert_eq!(store.attendance().len(), 2);
}
