//! Attendance engine - one control loop per route execution
//!
//! The engine owns the route's `RouteState` behind a single mutex and
//! coordinates:
//! - Position fixes from the `LocationSampler`, one tick at a time
//! - A 1 second dwell clock for students inside their stop zone
//! - Settled or exhausted writes, so the sync indicators stay current
//! - Manual driver commands (`DriverCommands`), applied immediately
//! - Route lifecycle (explicit end, backgrounding beyond a grace period)
//!
//! Every mutation locks the state, applies, dispatches persistence and
//! events without blocking, publishes a fresh snapshot and unlocks. Ticks and
//! commands therefore never interleave inside a student's state machine.

mod handlers;

use crate::domain::attendance::{AttendanceDecision, ConfirmPolicy};
use crate::domain::types::{RouteExecution, RouteExecutionId, StudentRouteEntry};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::event_channel::EventSender;
use crate::io::positioning::PositionProvider;
use crate::services::route_state::{RouteSnapshot, RouteState, SamplingStatus};
use crate::services::sampler::{LocationSampler, SamplerEvent, SamplerSettings};
use crate::services::sync_gateway::{FlushReport, SyncHandle};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

pub use handlers::DriverCommands;

/// Lifecycle notices from the host application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    End,
    Backgrounded,
    Foregrounded,
}

/// Why the route execution ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Requested,
    BackgroundGraceExpired,
    PositionSourceClosed,
    ControlClosed,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::Requested => "requested",
            EndReason::BackgroundGraceExpired => "background_grace_expired",
            EndReason::PositionSourceClosed => "position_source_closed",
            EndReason::ControlClosed => "control_closed",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub policy: ConfirmPolicy,
    pub sampler: SamplerSettings,
    pub dwell_tick: Duration,
    pub background_grace: Duration,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            policy: config.confirm_policy(),
            sampler: SamplerSettings {
                interval: config.sample_interval(),
                high_accuracy: config.high_accuracy(),
            },
            dwell_tick: Duration::from_secs(1),
            background_grace: config.background_grace(),
        }
    }
}

/// Final account of a route execution
#[derive(Debug, Clone, Serialize)]
pub struct RouteSummary {
    pub route_execution_id: RouteExecutionId,
    pub end_reason: EndReason,
    pub picked_up: usize,
    pub absent: usize,
    pub decisions: Vec<AttendanceDecision>,
    pub sync: FlushReport,
}

/// Processing clock for one route execution
///
/// Wall time at creation, advanced by the runtime's monotonic clock. Zone
/// entry, dwell, commands and decisions are all stamped from it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RouteClock {
    origin: DateTime<Utc>,
    started: tokio::time::Instant,
}

impl RouteClock {
    fn new() -> Self {
        Self { origin: Utc::now(), started: tokio::time::Instant::now() }
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.started.elapsed()).unwrap_or_else(|_| chrono::Duration::zero());
        self.origin + elapsed
    }
}

/// State shared by the control loop and command handles
pub(crate) struct EngineShared {
    clock: RouteClock,
    state: Mutex<RouteState>,
    sync: SyncHandle,
    events: Option<EventSender>,
    metrics: Arc<Metrics>,
    snapshot_tx: watch::Sender<RouteSnapshot>,
}

/// Host-side handle for lifecycle notices
#[derive(Clone)]
pub struct RouteControl {
    tx: mpsc::Sender<ControlMessage>,
}

impl RouteControl {
    pub async fn end(&self) {
        let _ = self.tx.send(ControlMessage::End).await;
    }

    pub async fn backgrounded(&self) {
        let _ = self.tx.send(ControlMessage::Backgrounded).await;
    }

    pub async fn foregrounded(&self) {
        let _ = self.tx.send(ControlMessage::Foregrounded).await;
    }
}

/// Handles returned alongside a new engine
pub struct EngineHandles {
    pub commands: DriverCommands,
    pub control: RouteControl,
    pub snapshots: watch::Receiver<RouteSnapshot>,
}

pub struct AttendanceEngine {
    shared: Arc<EngineShared>,
    provider: Arc<dyn PositionProvider>,
    settings: EngineSettings,
    control_rx: mpsc::Receiver<ControlMessage>,
}

impl AttendanceEngine {
    /// Create the engine for a freshly started route execution
    pub fn new(
        execution: RouteExecution,
        entries: Vec<StudentRouteEntry>,
        settings: EngineSettings,
        provider: Arc<dyn PositionProvider>,
        sync: SyncHandle,
        events: Option<EventSender>,
        metrics: Arc<Metrics>,
    ) -> (Self, EngineHandles) {
        let state = RouteState::new(execution, entries, settings.policy);
        let (snapshot_tx, snapshots) = watch::channel(state.snapshot());
        let shared = Arc::new(EngineShared {
            clock: RouteClock::new(),
            state: Mutex::new(state),
            sync,
            events,
            metrics,
            snapshot_tx,
        });
        let (control_tx, control_rx) = mpsc::channel(8);

        let handles = EngineHandles {
            commands: DriverCommands::new(shared.clone()),
            control: RouteControl { tx: control_tx },
            snapshots,
        };
        (Self { shared, provider, settings, control_rx }, handles)
    }

    /// Run the route to completion
    ///
    /// Returns once the route has ended, every student is final and pending
    /// writes have settled.
    pub async fn run(mut self) -> RouteSummary {
        let execution = self.shared.route_started();
        let (sample_tx, mut sample_rx) = mpsc::channel(4);
        let sampler = LocationSampler::new(
            self.provider.clone(),
            self.settings.sampler,
            execution,
            self.shared.sync.clone(),
            sample_tx,
            self.shared.metrics.clone(),
        )
        .start();

        let mut dwell_ticker = interval(self.settings.dwell_tick);
        dwell_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let grace = tokio::time::sleep(self.settings.background_grace);
        tokio::pin!(grace);
        let mut backgrounded = false;
        let mut sampler_live = true;
        let mut sync_status = self.shared.sync.subscribe();

        let end_reason = loop {
            tokio::select! {
                event = sample_rx.recv(), if sampler_live => match event {
                    Some(SamplerEvent::Sample(sample)) => {
                        let started = Instant::now();
                        self.shared.apply_sample(&sample);
                        self.shared.metrics.record_tick(started.elapsed().as_micros() as u64);
                    }
                    Some(SamplerEvent::Active) => self.shared.set_sampling(SamplingStatus::Active),
                    Some(SamplerEvent::PermissionDenied) => {
                        warn!("manual_mode_permission_denied");
                        self.shared.set_sampling(SamplingStatus::PermissionDenied);
                    }
                    Some(SamplerEvent::SourceClosed) => break EndReason::PositionSourceClosed,
                    None => sampler_live = false,
                },
                _ = dwell_ticker.tick() => self.shared.refresh_dwell(),
                Ok(()) = sync_status.changed() => self.shared.refresh_sync(),
                msg = self.control_rx.recv() => match msg {
                    Some(ControlMessage::End) => break EndReason::Requested,
                    Some(ControlMessage::Backgrounded) => {
                        info!(grace_secs = %self.settings.background_grace.as_secs(), "route_backgrounded");
                        grace.as_mut().reset(tokio::time::Instant::now() + self.settings.background_grace);
                        backgrounded = true;
                    }
                    Some(ControlMessage::Foregrounded) => {
                        if backgrounded {
                            info!("route_foregrounded");
                        }
                        backgrounded = false;
                    }
                    None => break EndReason::ControlClosed,
                },
                _ = &mut grace, if backgrounded => {
                    warn!("background_grace_expired");
                    break EndReason::BackgroundGraceExpired;
                }
            }
        };

        // No fix is accepted once the route is closing
        sampler.stop().await;
        drop(sample_rx);

        self.shared.finish(end_reason).await
    }
}
