//! Infrastructure - configuration, errors and metrics
//!
//! This module contains infrastructure concerns:
//! - `config` - Application configuration (TOML loading, defaults)
//! - `error` - Typed errors for positioning, storage and driver commands
//! - `metrics` - Lock-free metrics collection

pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use config::Config;
pub use metrics::Metrics;
