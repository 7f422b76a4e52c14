//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use crate::domain::attendance::ConfirmPolicy;
use crate::domain::types::{BusId, DriverId, RouteId, DEFAULT_RADIUS_M};
use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmMode {
    OnExit,
    AfterDwell,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncBackend {
    Memory,
    File,
    Http,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
    pub route_id: String,
    pub driver_id: String,
    pub bus_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SamplerConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_true")]
    pub high_accuracy: bool,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self { interval_secs: default_interval_secs(), high_accuracy: true }
    }
}

fn default_interval_secs() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttendanceConfig {
    #[serde(default = "default_confirm_policy")]
    pub confirm_policy: ConfirmMode,
    /// Dwell seconds before auto-confirmation (after_dwell only)
    #[serde(default = "default_confirm_after_secs")]
    pub confirm_after_secs: u64,
    /// Radius applied to stops without one in the roster
    #[serde(default = "default_radius_m")]
    pub default_radius_m: f64,
    /// How long the app may stay backgrounded before the route is ended
    #[serde(default = "default_background_grace_secs")]
    pub background_grace_secs: u64,
}

impl Default for AttendanceConfig {
    fn default() -> Self {
        Self {
            confirm_policy: default_confirm_policy(),
            confirm_after_secs: default_confirm_after_secs(),
            default_radius_m: default_radius_m(),
            background_grace_secs: default_background_grace_secs(),
        }
    }
}

fn default_confirm_policy() -> ConfirmMode {
    ConfirmMode::OnExit
}

fn default_confirm_after_secs() -> u64 {
    60
}

fn default_radius_m() -> f64 {
    DEFAULT_RADIUS_M
}

fn default_background_grace_secs() -> u64 {
    120
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_backend")]
    pub backend: SyncBackend,
    /// Directory for the file backend (attendance.jsonl, locations.jsonl)
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Roster file for the memory and file backends
    #[serde(default = "default_roster_file")]
    pub roster_file: String,
    #[serde(default)]
    pub http_url: Option<String>,
    #[serde(default)]
    pub http_api_key: Option<String>,
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// JSONL file receiving writes that exhausted their retries
    #[serde(default = "default_reconciliation_file")]
    pub reconciliation_file: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            data_dir: default_data_dir(),
            roster_file: default_roster_file(),
            http_url: None,
            http_api_key: None,
            http_timeout_ms: default_http_timeout_ms(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            reconciliation_file: default_reconciliation_file(),
        }
    }
}

fn default_backend() -> SyncBackend {
    SyncBackend::File
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_roster_file() -> String {
    "config/roster.json".to_string()
}

fn default_http_timeout_ms() -> u64 {
    5000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_reconciliation_file() -> String {
    "data/needs_reconciliation.jsonl".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    #[serde(default)]
    pub mqtt_enabled: bool,
    #[serde(default = "default_mqtt_host")]
    pub mqtt_host: String,
    #[serde(default = "default_mqtt_port")]
    pub mqtt_port: u16,
    #[serde(default)]
    pub mqtt_username: Option<String>,
    #[serde(default)]
    pub mqtt_password: Option<String>,
    /// Topic prefix; events go to `<prefix>/events`, metrics to `<prefix>/metrics`
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            mqtt_enabled: false,
            mqtt_host: default_mqtt_host(),
            mqtt_port: default_mqtt_port(),
            mqtt_username: None,
            mqtt_password: None,
            topic_prefix: default_topic_prefix(),
        }
    }
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_topic_prefix() -> String {
    "ridecheck".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default)]
    pub prometheus_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval(), prometheus_port: 0 }
    }
}

fn default_metrics_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplayConfig {
    #[serde(default = "default_fixes_file")]
    pub fixes_file: String,
    /// Simulate a denied positioning permission
    #[serde(default)]
    pub deny_permission: bool,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self { fixes_file: default_fixes_file(), deny_permission: false }
    }
}

fn default_fixes_file() -> String {
    "demos/fixes.jsonl".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    pub route: RouteConfig,
    #[serde(default)]
    pub sampler: SamplerConfig,
    #[serde(default)]
    pub attendance: AttendanceConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub replay: ReplayConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    route_id: RouteId,
    driver_id: DriverId,
    bus_id: BusId,
    sample_interval_secs: u64,
    high_accuracy: bool,
    confirm_mode: ConfirmMode,
    confirm_after_secs: u64,
    default_radius_m: f64,
    background_grace_secs: u64,
    sync_backend: SyncBackend,
    data_dir: String,
    roster_file: String,
    http_url: Option<String>,
    http_api_key: Option<String>,
    http_timeout_ms: u64,
    max_attempts: u32,
    initial_backoff_ms: u64,
    max_backoff_ms: u64,
    reconciliation_file: String,
    mqtt_enabled: bool,
    mqtt_host: String,
    mqtt_port: u16,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    topic_prefix: String,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    fixes_file: String,
    deny_permission: bool,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        let sampler = SamplerConfig::default();
        let attendance = AttendanceConfig::default();
        let sync = SyncConfig::default();
        let events = EventsConfig::default();
        let metrics = MetricsConfig::default();
        let replay = ReplayConfig::default();
        Self {
            route_id: RouteId::from("route-1"),
            driver_id: DriverId::from("driver-1"),
            bus_id: BusId::from("bus-1"),
            sample_interval_secs: sampler.interval_secs,
            high_accuracy: sampler.high_accuracy,
            confirm_mode: attendance.confirm_policy,
            confirm_after_secs: attendance.confirm_after_secs,
            default_radius_m: attendance.default_radius_m,
            background_grace_secs: attendance.background_grace_secs,
            sync_backend: SyncBackend::Memory,
            data_dir: sync.data_dir,
            roster_file: sync.roster_file,
            http_url: sync.http_url,
            http_api_key: sync.http_api_key,
            http_timeout_ms: sync.http_timeout_ms,
            max_attempts: sync.max_attempts,
            initial_backoff_ms: sync.initial_backoff_ms,
            max_backoff_ms: sync.max_backoff_ms,
            reconciliation_file: sync.reconciliation_file,
            mqtt_enabled: events.mqtt_enabled,
            mqtt_host: events.mqtt_host,
            mqtt_port: events.mqtt_port,
            mqtt_username: None,
            mqtt_password: None,
            topic_prefix: events.topic_prefix,
            metrics_interval_secs: metrics.interval_secs,
            prometheus_port: metrics.prometheus_port,
            fixes_file: replay.fixes_file,
            deny_permission: replay.deny_permission,
            config_file: "default".to_string(),
        }
    }
}

impl Config {
    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        if toml_config.sampler.interval_secs == 0 {
            anyhow::bail!("sampler.interval_secs must be at least 1 in {}", path.display());
        }
        if toml_config.sync.max_attempts == 0 {
            anyhow::bail!("sync.max_attempts must be at least 1 in {}", path.display());
        }
        if toml_config.sync.backend == SyncBackend::Http && toml_config.sync.http_url.is_none() {
            anyhow::bail!("sync.http_url is required for the http backend in {}", path.display());
        }

        Ok(Self {
            route_id: RouteId::new(toml_config.route.route_id),
            driver_id: DriverId::new(toml_config.route.driver_id),
            bus_id: BusId::new(toml_config.route.bus_id),
            sample_interval_secs: toml_config.sampler.interval_secs,
            high_accuracy: toml_config.sampler.high_accuracy,
            confirm_mode: toml_config.attendance.confirm_policy,
            confirm_after_secs: toml_config.attendance.confirm_after_secs,
            default_radius_m: toml_config.attendance.default_radius_m,
            background_grace_secs: toml_config.attendance.background_grace_secs,
            sync_backend: toml_config.sync.backend,
            data_dir: toml_config.sync.data_dir,
            roster_file: toml_config.sync.roster_file,
            http_url: toml_config.sync.http_url,
            http_api_key: toml_config.sync.http_api_key,
            http_timeout_ms: toml_config.sync.http_timeout_ms,
            max_attempts: toml_config.sync.max_attempts,
            initial_backoff_ms: toml_config.sync.initial_backoff_ms,
            max_backoff_ms: toml_config.sync.max_backoff_ms,
            reconciliation_file: toml_config.sync.reconciliation_file,
            mqtt_enabled: toml_config.events.mqtt_enabled,
            mqtt_host: toml_config.events.mqtt_host,
            mqtt_port: toml_config.events.mqtt_port,
            mqtt_username: toml_config.events.mqtt_username,
            mqtt_password: toml_config.events.mqtt_password,
            topic_prefix: toml_config.events.topic_prefix,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            prometheus_port: toml_config.metrics.prometheus_port,
            fixes_file: toml_config.replay.fixes_file,
            deny_permission: toml_config.replay.deny_permission,
            config_file: path.display().to_string(),
        })
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load(args: &[String]) -> Self {
        Self::load_from_path(&Self::resolve_config_path(args))
    }

    pub fn load_from_path(config_path: &str) -> Self {
        match Self::from_file(config_path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    /// Confirmation policy for in-zone students without a manual mark
    pub fn confirm_policy(&self) -> ConfirmPolicy {
        match self.confirm_mode {
            ConfirmMode::OnExit => ConfirmPolicy::OnExit,
            ConfirmMode::AfterDwell => ConfirmPolicy::AfterDwell { seconds: self.confirm_after_secs },
        }
    }

    pub fn route_id(&self) -> &RouteId {
        &self.route_id
    }

    pub fn driver_id(&self) -> &DriverId {
        &self.driver_id
    }

    pub fn bus_id(&self) -> &BusId {
        &self.bus_id
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs)
    }

    pub fn high_accuracy(&self) -> bool {
        self.high_accuracy
    }

    pub fn default_radius_m(&self) -> f64 {
        self.default_radius_m
    }

    pub fn background_grace(&self) -> Duration {
        Duration::from_secs(self.background_grace_secs)
    }

    pub fn sync_backend(&self) -> SyncBackend {
        self.sync_backend
    }

    pub fn data_dir(&self) -> &str {
        &self.data_dir
    }

    pub fn roster_file(&self) -> &str {
        &self.roster_file
    }

    pub fn http_url(&self) -> Option<&str> {
        self.http_url.as_deref()
    }

    pub fn http_api_key(&self) -> Option<&str> {
        self.http_api_key.as_deref()
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn reconciliation_file(&self) -> &str {
        &self.reconciliation_file
    }

    pub fn mqtt_enabled(&self) -> bool {
        self.mqtt_enabled
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt_host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt_port
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt_username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt_password.as_deref()
    }

    pub fn events_topic(&self) -> String {
        format!("{}/events", self.topic_prefix)
    }

    pub fn metrics_topic(&self) -> String {
        format!("{}/metrics", self.topic_prefix)
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn fixes_file(&self) -> &str {
        &self.fixes_file
    }

    pub fn deny_permission(&self) -> bool {
        self.deny_permission
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to switch the confirmation policy
    #[cfg(test)]
    pub fn with_confirm_after_secs(mut self, secs: u64) -> Self {
        self.confirm_mode = ConfirmMode::AfterDwell;
        self.confirm_after_secs = secs;
        self
    }

    /// Builder method for tests to shorten retry backoff
    #[cfg(test)]
    pub fn with_backoff_ms(mut self, initial_ms: u64, max_ms: u64) -> Self {
        self.initial_backoff_ms = initial_ms;
        self.max_backoff_ms = max_ms;
        self
    }
}
