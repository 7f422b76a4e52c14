//! Location sampler - periodic position fixes for the active route
//!
//! Requests foreground permission once. If it is refused, reports
//! `PermissionDenied` and never samples; there is no re-prompt. Otherwise it
//! asks the provider for one fix per interval. A failed or timed-out
//! acquisition skips that tick and only bumps a counter. Each fix is handed
//! to the sync gateway as location history before the engine sees it.

use crate::domain::types::{LocationSample, RouteExecution};
use crate::infra::error::PositionError;
use crate::infra::metrics::Metrics;
use crate::io::positioning::PositionProvider;
use crate::io::record_store::LocationRecord;
use crate::services::sync_gateway::SyncHandle;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// What the sampler reports to the engine
#[derive(Debug, Clone, PartialEq)]
pub enum SamplerEvent {
    /// Permission granted; fixes will follow
    Active,
    Sample(LocationSample),
    PermissionDenied,
    /// The provider will never produce another fix
    SourceClosed,
}

#[derive(Debug, Clone, Copy)]
pub struct SamplerSettings {
    pub interval: Duration,
    pub high_accuracy: bool,
}

pub struct LocationSampler {
    provider: Arc<dyn PositionProvider>,
    settings: SamplerSettings,
    execution: RouteExecution,
    sync: SyncHandle,
    tx: mpsc::Sender<SamplerEvent>,
    metrics: Arc<Metrics>,
}

/// Running sampler; `stop` halts emission
pub struct SamplerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SamplerHandle {
    /// Stop sampling and wait for the loop to exit. No event is sent afterwards.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "sampler_task_failed");
        }
    }
}

impl LocationSampler {
    pub fn new(
        provider: Arc<dyn PositionProvider>,
        settings: SamplerSettings,
        execution: RouteExecution,
        sync: SyncHandle,
        tx: mpsc::Sender<SamplerEvent>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { provider, settings, execution, sync, tx, metrics }
    }

    /// Spawn the sampling loop
    pub fn start(self) -> SamplerHandle {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(shutdown_rx));
        SamplerHandle { shutdown, task }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let granted = tokio::select! {
            granted = self.provider.request_foreground_permission() => granted,
            _ = shutdown.changed() => return,
        };
        if !granted {
            warn!(route_execution_id = %self.execution.id, "positioning_permission_denied");
            let _ = self.tx.send(SamplerEvent::PermissionDenied).await;
            return;
        }
        if self.tx.send(SamplerEvent::Active).await.is_err() {
            return;
        }

        info!(
            interval_secs = %self.settings.interval.as_secs(),
            high_accuracy = %self.settings.high_accuracy,
            "sampler_started"
        );

        let mut ticker = interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let acquired = tokio::select! {
                        result = self.acquire() => result,
                        _ = shutdown.changed() => break,
                    };
                    match acquired {
                        Ok(sample) => {
                            self.sync.persist_location(LocationRecord::from_sample(&self.execution, &sample));
                            if self.tx.send(SamplerEvent::Sample(sample)).await.is_err() {
                                break;
                            }
                        }
                        Err(PositionError::SourceClosed) => {
                            info!("position_source_closed");
                            let _ = self.tx.send(SamplerEvent::SourceClosed).await;
                            break;
                        }
                        Err(e) => {
                            self.metrics.record_sample_failure();
                            debug!(error = %e, "sample_acquisition_failed");
                        }
                    }
                }
            }
        }

        info!("sampler_stopped");
    }

    /// One fix, bounded by the sampling interval
    async fn acquire(&self) -> Result<LocationSample, PositionError> {
        let request = self.provider.get_current_position(self.settings.high_accuracy);
        match tokio::time::timeout(self.settings.interval, request).await {
            Ok(result) => result,
            Err(_) => Err(PositionError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::RouteExecution;
    use crate::infra::metrics::Metrics;
    use crate::io::positioning::{ReplayFailure, ReplayPositionProvider, ReplayStep};
    use crate::io::record_store::{MemoryRecordStore, RecordStore};
    use crate::services::sync_gateway::{create_sync_gateway, SyncPolicy};
    use chrono::Utc;

    struct Harness {
        rx: mpsc::Receiver<SamplerEvent>,
        handle: SamplerHandle,
        sync: SyncHandle,
        store: Arc<MemoryRecordStore>,
        metrics: Arc<Metrics>,
    }

    fn start(provider: ReplayPositionProvider) -> Harness {
        let store = Arc::new(MemoryRecordStore::new());
        let metrics = Arc::new(Metrics::new());
        let dyn_store: Arc<dyn RecordStore> = store.clone();
        let (sync, gateway) = create_sync_gateway(dyn_store, SyncPolicy::default(), metrics.clone(), None);
        tokio::spawn(gateway.run());

        let (tx, rx) = mpsc::channel(8);
        let execution = RouteExecution::start("r1".into(), "d1".into(), "bus-1".into(), Utc::now());
        let settings = SamplerSettings { interval: Duration::from_secs(10), high_accuracy: true };
        let sampler =
            LocationSampler::new(Arc::new(provider), settings, execution, sync.clone(), tx, metrics.clone());
        Harness { rx, handle: sampler.start(), sync, store, metrics }
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_denied_emits_once_and_never_samples() {
        let provider = ReplayPositionProvider::new(vec![ReplayStep::fix(0.0, 0.0)]).with_permission(false);
        let mut h = start(provider);

        assert_eq!(h.rx.recv().await, Some(SamplerEvent::PermissionDenied));
        assert_eq!(h.rx.recv().await, None);
        assert_eq!(h.store.location_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_skipped_and_fixes_persisted() {
        let provider = ReplayPositionProvider::new(vec![
            ReplayStep::fix_at(0.0, 0.0, Utc::now()),
            ReplayStep::fail(ReplayFailure::Timeout),
            ReplayStep::fail(ReplayFailure::Unavailable),
            ReplayStep::fix_at(0.001, 0.0, Utc::now() + chrono::Duration::seconds(30)),
        ]);
        let mut h = start(provider);

        assert_eq!(h.rx.recv().await, Some(SamplerEvent::Active));
        assert!(matches!(h.rx.recv().await, Some(SamplerEvent::Sample(s)) if s.latitude == 0.0));
        assert!(matches!(h.rx.recv().await, Some(SamplerEvent::Sample(s)) if s.latitude == 0.001));
        assert_eq!(h.rx.recv().await, Some(SamplerEvent::SourceClosed));

        assert_eq!(h.metrics.sample_failures_total(), 2);
        h.sync.flush().await;
        assert_eq!(h.store.location_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_emission() {
        let steps = (0..100).map(|i| ReplayStep::fix(0.0001 * i as f64, 0.0)).collect();
        let mut h = start(ReplayPositionProvider::new(steps));

        assert_eq!(h.rx.recv().await, Some(SamplerEvent::Active));
        assert!(matches!(h.rx.recv().await, Some(SamplerEvent::Sample(_))));
        h.handle.stop().await;

        // Drain whatever was already queued; the channel then closes
        while h.rx.recv().await.is_some() {}
        assert!(h.store.location_count() < 100);
    }
}
