//! Positioning subsystem interface
//!
//! `PositionProvider` is what the sampler talks to: a one-shot permission
//! request and a one-shot fix request. `ReplayPositionProvider` serves fixes
//! from a JSONL file (or an in-memory script), one per request.
//!
//! Replay file format, one object per line:
//! ```text
//! {"latitude": 4.6512, "longitude": -74.0551, "speed_kmh": 22.5, "accuracy_m": 8.0}
//! {"fail": "timeout"}
//! {"fail": "unavailable"}
//! ```

use crate::domain::types::LocationSample;
use crate::infra::error::PositionError;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::VecDeque;
use std::path::Path;
use tracing::info;

#[async_trait]
pub trait PositionProvider: Send + Sync {
    /// Ask for foreground positioning access. Called once per route start.
    async fn request_foreground_permission(&self) -> bool;

    /// Acquire one fix
    async fn get_current_position(&self, high_accuracy: bool) -> Result<LocationSample, PositionError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayFailure {
    Timeout,
    Unavailable,
}

/// One scripted answer to a position request
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ReplayStep {
    Fix {
        latitude: f64,
        longitude: f64,
        #[serde(default)]
        speed_kmh: Option<f64>,
        #[serde(default)]
        accuracy_m: Option<f64>,
        /// Fixed capture time; the request time is used when absent
        #[serde(default)]
        captured_at: Option<DateTime<Utc>>,
    },
    Fail {
        fail: ReplayFailure,
    },
}

impl ReplayStep {
    pub fn fix(latitude: f64, longitude: f64) -> Self {
        ReplayStep::Fix { latitude, longitude, speed_kmh: None, accuracy_m: None, captured_at: None }
    }

    /// A fix with a fixed capture time
    pub fn fix_at(latitude: f64, longitude: f64, captured_at: DateTime<Utc>) -> Self {
        ReplayStep::Fix { latitude, longitude, speed_kmh: None, accuracy_m: None, captured_at: Some(captured_at) }
    }

    pub fn fail(failure: ReplayFailure) -> Self {
        ReplayStep::Fail { fail: failure }
    }
}

/// Replays a fixed script of fixes and failures
///
/// Once the script is exhausted every request returns `SourceClosed`.
pub struct ReplayPositionProvider {
    steps: Mutex<VecDeque<ReplayStep>>,
    permission_granted: bool,
}

impl ReplayPositionProvider {
    pub fn new(steps: Vec<ReplayStep>) -> Self {
        Self { steps: Mutex::new(steps.into()), permission_granted: true }
    }

    /// Load a replay script from a JSONL file
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read fixes file {}", path.display()))?;

        let mut steps = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let step: ReplayStep = serde_json::from_str(line)
                .with_context(|| format!("Invalid fix at {}:{}", path.display(), line_no + 1))?;
            steps.push(step);
        }

        info!(file = %path.display(), steps = %steps.len(), "replay_fixes_loaded");
        Ok(Self::new(steps))
    }

    pub fn with_permission(mut self, granted: bool) -> Self {
        self.permission_granted = granted;
        self
    }

    pub fn remaining(&self) -> usize {
        self.steps.lock().len()
    }
}

#[async_trait]
impl PositionProvider for ReplayPositionProvider {
    async fn request_foreground_permission(&self) -> bool {
        self.permission_granted
    }

    async fn get_current_position(&self, _high_accuracy: bool) -> Result<LocationSample, PositionError> {
        let Some(step) = self.steps.lock().pop_front() else {
            return Err(PositionError::SourceClosed);
        };
        match step {
            ReplayStep::Fix { latitude, longitude, speed_kmh, accuracy_m, captured_at } => {
                let mut sample = LocationSample::new(latitude, longitude, captured_at.unwrap_or_else(Utc::now));
                sample.speed_kmh = speed_kmh;
                sample.accuracy_m = accuracy_m;
                Ok(sample)
            }
            ReplayStep::Fail { fail: ReplayFailure::Timeout } => Err(PositionError::Timeout),
            ReplayStep::Fail { fail: ReplayFailure::Unavailable } => {
                Err(PositionError::Unavailable("no satellite fix".to_string()))
            }
        }
    }
}
