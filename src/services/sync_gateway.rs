//! Sync gateway - persists attendance and location records off the hot path
//!
//! Callers hand records to a `SyncHandle` and return immediately; the
//! gateway worker writes each record in its own task so a slow or failing
//! write never delays the next one. Failed writes are retried with bounded
//! exponential backoff. A write that exhausts its attempts (or is rejected
//! outright) becomes a reconciliation record and is never reported as success.
//!
//! A record whose key is already in flight is not dispatched a second time;
//! keys already acknowledged are handled by the store's own idempotence.
//!
//! Every change to the pending or reconciliation counts is broadcast on a
//! `watch` channel (`SyncHandle::subscribe`).

use crate::domain::types::{BusId, RouteExecutionId, StudentId};
use crate::infra::config::Config;
use crate::infra::error::StoreError;
use crate::infra::metrics::Metrics;
use crate::io::reconciliation_log::ReconciliationLog;
use crate::io::record_store::{AttendanceRecord, LocationRecord, RecordStore, WriteOutcome};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Retry policy for store writes
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl SyncPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.max_attempts().max(1),
            initial_backoff: config.initial_backoff(),
            max_backoff: config.max_backoff(),
        }
    }

    /// Delay after the given failed attempt (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

/// Identity of a write for in-flight dedupe
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SyncKey {
    Attendance { student_id: StudentId, route_execution_id: RouteExecutionId },
    Location { bus_id: BusId, captured_at_ms: i64 },
}

/// One record to write
#[derive(Debug, Clone)]
pub enum SyncWrite {
    Attendance(AttendanceRecord),
    Location(LocationRecord),
}

impl SyncWrite {
    pub fn key(&self) -> SyncKey {
        match self {
            SyncWrite::Attendance(r) => SyncKey::Attendance {
                student_id: r.student_id.clone(),
                route_execution_id: r.route_execution_id.clone(),
            },
            SyncWrite::Location(r) => {
                SyncKey::Location { bus_id: r.bus_id.clone(), captured_at_ms: r.captured_at.timestamp_millis() }
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SyncWrite::Attendance(_) => "attendance",
            SyncWrite::Location(_) => "location",
        }
    }

    fn store_key(&self) -> String {
        match self {
            SyncWrite::Attendance(r) => r.key(),
            SyncWrite::Location(r) => r.key(),
        }
    }

    fn payload(&self) -> serde_json::Value {
        let payload = match self {
            SyncWrite::Attendance(r) => serde_json::to_value(r),
            SyncWrite::Location(r) => serde_json::to_value(r),
        };
        payload.unwrap_or(serde_json::Value::Null)
    }

    async fn write(&self, store: &dyn RecordStore) -> Result<WriteOutcome, StoreError> {
        match self {
            SyncWrite::Attendance(r) => store.upsert_attendance(r).await,
            SyncWrite::Location(r) => store.upsert_location(r).await,
        }
    }
}

/// A write that needs manual reconciliation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciliationRecord {
    pub kind: String,
    pub key: String,
    pub attempts: u32,
    pub last_error: String,
    pub failed_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// State of outstanding writes after a flush
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct FlushReport {
    pub pending: usize,
    pub needs_reconciliation: usize,
}

struct SyncStatus {
    pending: FxHashSet<SyncKey>,
    reconciliation: Vec<ReconciliationRecord>,
    changes: watch::Sender<FlushReport>,
}

impl SyncStatus {
    fn new() -> Self {
        let (changes, _) = watch::channel(FlushReport::default());
        Self { pending: FxHashSet::default(), reconciliation: Vec::new(), changes }
    }

    fn report(&self) -> FlushReport {
        FlushReport { pending: self.pending.len(), needs_reconciliation: self.reconciliation.len() }
    }

    /// Record the new counts in metrics and wake subscribers
    fn changed(&self, metrics: &Metrics) {
        metrics.set_pending_sync(self.pending.len() as u64);
        self.changes.send_replace(self.report());
    }
}

enum SyncJob {
    Write(SyncWrite),
    Flush(oneshot::Sender<()>),
}

/// Producer side of the gateway
///
/// Clone this to share across the engine and sampler. Never blocks.
#[derive(Clone)]
pub struct SyncHandle {
    tx: mpsc::UnboundedSender<SyncJob>,
    status: Arc<Mutex<SyncStatus>>,
    metrics: Arc<Metrics>,
}

impl SyncHandle {
    pub fn persist_attendance(&self, record: AttendanceRecord) {
        self.dispatch(SyncWrite::Attendance(record));
    }

    pub fn persist_location(&self, record: LocationRecord) {
        self.dispatch(SyncWrite::Location(record));
    }

    fn dispatch(&self, write: SyncWrite) {
        let key = write.key();
        {
            let mut status = self.status.lock();
            if !status.pending.insert(key.clone()) {
                self.metrics.record_persist_deduped();
                debug!(kind = %write.kind(), key = %write.store_key(), "persist_deduped");
                return;
            }
            status.changed(&self.metrics);
        }

        if let Err(mpsc::error::SendError(job)) = self.tx.send(SyncJob::Write(write)) {
            // Gateway is gone: nothing will ever write this record
            if let SyncJob::Write(write) = job {
                let record = ReconciliationRecord {
                    kind: write.kind().to_string(),
                    key: write.store_key(),
                    attempts: 0,
                    last_error: "sync gateway stopped".to_string(),
                    failed_at: Utc::now(),
                    payload: write.payload(),
                };
                error!(kind = %record.kind, key = %record.key, "persist_dropped_gateway_stopped");
                let mut status = self.status.lock();
                status.pending.remove(&key);
                status.reconciliation.push(record);
                status.changed(&self.metrics);
                self.metrics.record_persist_exhausted();
            }
        }
    }

    /// Writes dispatched and not yet settled
    pub fn pending_count(&self) -> usize {
        self.status.lock().pending.len()
    }

    pub fn reconciliation_count(&self) -> usize {
        self.status.lock().reconciliation.len()
    }

    pub fn reconciliation_records(&self) -> Vec<ReconciliationRecord> {
        self.status.lock().reconciliation.clone()
    }

    pub fn report(&self) -> FlushReport {
        self.status.lock().report()
    }

    /// Watch the pending and reconciliation counts
    pub fn subscribe(&self) -> watch::Receiver<FlushReport> {
        self.status.lock().changes.subscribe()
    }

    /// Wait until every write dispatched before this call has settled
    pub async fn flush(&self) -> FlushReport {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(SyncJob::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
        self.report()
    }
}

/// Gateway worker that owns the store
pub struct SyncGateway {
    store: Arc<dyn RecordStore>,
    rx: mpsc::UnboundedReceiver<SyncJob>,
    status: Arc<Mutex<SyncStatus>>,
    policy: SyncPolicy,
    metrics: Arc<Metrics>,
    reconciliation_log: Option<Arc<ReconciliationLog>>,
}

impl SyncGateway {
    /// Run the worker until every handle is dropped, then settle in-flight writes
    pub async fn run(mut self) {
        info!(max_attempts = %self.policy.max_attempts, "sync_gateway_started");
        let mut tasks: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                job = self.rx.recv() => match job {
                    Some(SyncJob::Write(write)) => {
                        tasks.spawn(deliver(
                            write,
                            self.store.clone(),
                            self.policy,
                            self.status.clone(),
                            self.metrics.clone(),
                            self.reconciliation_log.clone(),
                        ));
                    }
                    Some(SyncJob::Flush(done)) => {
                        while tasks.join_next().await.is_some() {}
                        let _ = done.send(());
                    }
                    None => break,
                },
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        while tasks.join_next().await.is_some() {}
        info!("sync_gateway_stopped");
    }
}

/// Write one record with retries, then settle its status
async fn deliver(
    write: SyncWrite,
    store: Arc<dyn RecordStore>,
    policy: SyncPolicy,
    status: Arc<Mutex<SyncStatus>>,
    metrics: Arc<Metrics>,
    reconciliation_log: Option<Arc<ReconciliationLog>>,
) {
    let mut attempt = 0;
    let failure = loop {
        attempt += 1;
        metrics.record_persist_attempt(attempt);
        match write.write(store.as_ref()).await {
            Ok(outcome) => {
                metrics.record_persist_succeeded();
                debug!(
                    kind = %write.kind(),
                    key = %write.store_key(),
                    attempt = %attempt,
                    duplicate = %(outcome == WriteOutcome::Duplicate),
                    "persist_succeeded"
                );
                break None;
            }
            Err(e) if !e.is_retryable() || attempt >= policy.max_attempts => break Some(e),
            Err(e) => {
                let delay = policy.backoff(attempt);
                warn!(
                    kind = %write.kind(),
                    key = %write.store_key(),
                    attempt = %attempt,
                    backoff_ms = %delay.as_millis(),
                    error = %e,
                    "persist_retry"
                );
                tokio::time::sleep(delay).await;
            }
        }
    };

    let record = failure.map(|e| {
        metrics.record_persist_exhausted();
        error!(
            kind = %write.kind(),
            key = %write.store_key(),
            attempts = %attempt,
            error = %e,
            "persist_exhausted_needs_reconciliation"
        );
        ReconciliationRecord {
            kind: write.kind().to_string(),
            key: write.store_key(),
            attempts: attempt,
            last_error: e.to_string(),
            failed_at: Utc::now(),
            payload: write.payload(),
        }
    });

    if let (Some(record), Some(log)) = (&record, &reconciliation_log) {
        log.write_record(record);
    }

    let mut status = status.lock();
    status.pending.remove(&write.key());
    if let Some(record) = record {
        status.reconciliation.push(record);
    }
    status.changed(&metrics);
}

/// Create a gateway and its handle
///
/// Returns the handle (for engine and sampler) and the worker (to be spawned)
pub fn create_sync_gateway(
    store: Arc<dyn RecordStore>,
    policy: SyncPolicy,
    metrics: Arc<Metrics>,
    reconciliation_log: Option<ReconciliationLog>,
) -> (SyncHandle, SyncGateway) {
    let (tx, rx) = mpsc::unbounded_channel();
    let status = Arc::new(Mutex::new(SyncStatus::new()));
    let handle = SyncHandle { tx, status: status.clone(), metrics: metrics.clone() };
    let gateway = SyncGateway {
        store,
        rx,
        status,
        policy,
        metrics,
        reconciliation_log: reconciliation_log.map(Arc::new),
    };
    (handle, gateway)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::attendance::{AttendanceDecision, AttendanceOutcome, DecisionReason};
    use crate::domain::types::{LocationSample, RouteExecution, RouteId, StopId, StudentRouteEntry};
    use crate::infra::error::StoreResult;
    use crate::io::record_store::MemoryRecordStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn execution() -> RouteExecution {
        RouteExecution::start("r1".into(), "d1".into(), "bus-1".into(), Utc::now())
    }

    fn attendance(execution: &RouteExecution, student: &str) -> AttendanceRecord {
        let decision = AttendanceDecision {
            student_id: StudentId::from(student),
            outcome: AttendanceOutcome::AutoPresent,
            decided_at: Utc::now(),
            reason: DecisionReason::ZoneExit,
            dwell_seconds: Some(12),
        };
        AttendanceRecord::from_decision(execution, StopId::from("stop-1"), &decision)
    }

    /// Fails the first `failures` writes, then delegates to memory
    struct FlakyStore {
        failures: u32,
        calls: AtomicU32,
        reject: bool,
        inner: MemoryRecordStore,
    }

    impl FlakyStore {
        fn new(failures: u32) -> Self {
            Self { failures, calls: AtomicU32::new(0), reject: false, inner: MemoryRecordStore::new() }
        }

        fn rejecting() -> Self {
            Self { reject: true, ..Self::new(u32::MAX) }
        }

        fn fail(&self) -> Option<StoreError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.reject {
                return Some(StoreError::Rejected { status: 400, message: "bad row".into() });
            }
            (call < self.failures).then(|| StoreError::Http("connection reset".into()))
        }
    }

    #[async_trait]
    impl RecordStore for FlakyStore {
        async fn upsert_attendance(&self, record: &AttendanceRecord) -> StoreResult<WriteOutcome> {
            match self.fail() {
                Some(e) => Err(e),
                None => self.inner.upsert_attendance(record).await,
            }
        }

        async fn upsert_location(&self, record: &LocationRecord) -> StoreResult<WriteOutcome> {
            match self.fail() {
                Some(e) => Err(e),
                None => self.inner.upsert_location(record).await,
            }
        }

        async fn load_route_entries(&self, route_id: &RouteId) -> StoreResult<Vec<StudentRouteEntry>> {
            self.inner.load_route_entries(route_id).await
        }
    }

    fn start(store: Arc<dyn RecordStore>, metrics: Arc<Metrics>) -> SyncHandle {
        let (handle, gateway) = create_sync_gateway(store, SyncPolicy::default(), metrics, None);
        tokio::spawn(gateway.run());
        handle
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = SyncPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff(4), Duration::from_millis(4000));
        assert_eq!(policy.backoff(7), Duration::from_secs(30));
        assert_eq!(policy.backoff(40), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let store = Arc::new(FlakyStore::new(2));
        let metrics = Arc::new(Metrics::new());
        let handle = start(store.clone(), metrics.clone());
        let execution = execution();

        handle.persist_attendance(attendance(&execution, "s1"));
        let report = handle.flush().await;

        assert_eq!(report, FlushReport { pending: 0, needs_reconciliation: 0 });
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
        assert_eq!(store.inner.attendance().len(), 1);
        assert_eq!(metrics.persist_succeeded_total(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_write_needs_reconciliation() {
        let store = Arc::new(FlakyStore::new(u32::MAX));
        let metrics = Arc::new(Metrics::new());
        let handle = start(store.clone(), metrics.clone());
        let execution = execution();

        handle.persist_attendance(attendance(&execution, "s1"));
        let report = handle.flush().await;

        assert_eq!(report.needs_reconciliation, 1);
        assert_eq!(report.pending, 0);
        assert_eq!(store.calls.load(Ordering::SeqCst), 5);
        assert_eq!(metrics.persist_succeeded_total(), 0);
        assert_eq!(metrics.persist_exhausted_total(), 1);

        let records = handle.reconciliation_records();
        assert_eq!(records[0].kind, "attendance");
        assert_eq!(records[0].attempts, 5);
        assert_eq!(records[0].payload["student_id"], "s1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribers_see_writes_settle() {
        let store = Arc::new(FlakyStore::new(u32::MAX));
        let handle = start(store.clone(), Arc::new(Metrics::new()));
        let mut counts = handle.subscribe();
        let execution = execution();

        handle.persist_attendance(attendance(&execution, "s1"));
        assert_eq!(*counts.borrow_and_update(), FlushReport { pending: 1, needs_reconciliation: 0 });

        // Retries run out without anyone calling flush
        let settled = counts.wait_for(|r| r.pending == 0).await.unwrap();
        assert_eq!(*settled, FlushReport { pending: 0, needs_reconciliation: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_write_is_not_retried() {
        let store = Arc::new(FlakyStore::rejecting());
        let handle = start(store.clone(), Arc::new(Metrics::new()));
        let execution = execution();

        handle.persist_location(LocationRecord::from_sample(
            &execution,
            &LocationSample::new(0.0, 0.0, Utc::now()),
        ));
        let report = handle.flush().await;

        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.needs_reconciliation, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_duplicate_is_deduped() {
        let store = Arc::new(FlakyStore::new(1));
        let metrics = Arc::new(Metrics::new());
        let handle = start(store.clone(), metrics.clone());
        let execution = execution();

        handle.persist_attendance(attendance(&execution, "s1"));
        handle.persist_attendance(attendance(&execution, "s1"));
        assert_eq!(handle.pending_count(), 1);
        assert_eq!(metrics.persist_deduped_total(), 1);

        handle.flush().await;
        assert_eq!(store.inner.attendance().len(), 1);

        // A later retry of an acknowledged write is absorbed by the store
        handle.persist_attendance(attendance(&execution, "s1"));
        handle.flush().await;
        assert_eq!(store.inner.attendance_for(&StudentId::from("s1")).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_are_concurrent() {
        let store = Arc::new(FlakyStore::new(0));
        let handle = start(store.clone(), Arc::new(Metrics::new()));
        let execution = execution();

        for i in 0..20 {
            handle.persist_attendance(attendance(&execution, &format!("s{i}")));
        }
        let report = handle.flush().await;
        assert_eq!(report.pending, 0);
        assert_eq!(store.inner.attendance().len(), 20);
    }

    #[tokio::test]
    async fn test_dispatch_after_gateway_stopped() {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
        let (handle, gateway) = create_sync_gateway(store, SyncPolicy::default(), Arc::new(Metrics::new()), None);
        drop(gateway);

        handle.persist_attendance(attendance(&execution(), "s1"));
        assert_eq!(handle.pending_count(), 0);
        assert_eq!(handle.reconciliation_count(), 1);
        assert_eq!(handle.flush().await.needs_reconciliation, 1);
    }
}
