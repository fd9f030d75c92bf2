// /////////////////////////////////////////////////////////////////////////////
// StepFlow Pipeline Framework
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Framework Settings
//!
//! Process-wide configuration loaded at startup: global step defaults,
//! per-step overrides, cache provider selection, concurrency and kill-switch
//! tuning, and startup health gating. Settings come from an optional
//! `stepflow.toml` file overlaid with `STEPFLOW_*` environment variables;
//! both layers are merged by the `config` crate.
//!
//! ```toml
//! profile = "prod"
//! max_concurrency = 16
//! ordering = "auto"
//!
//! [step_defaults]
//! retry_limit = 3
//! retry_wait_ms = 2000
//!
//! [steps."parse-document"]
//! retry_limit = 5
//! backpressure = "drop"
//!
//! [cache]
//! provider = "memory"
//!
//! [health]
//! startup_timeout_ms = 30000
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use stepflow_domain::{PipelineError, StepConfigOverlay};

use crate::infrastructure::runtime::concurrency::OrderingPolicy;
use crate::infrastructure::runtime::kill_switch::KillSwitchConfig;

/// Deployment profile; provider selection is stricter in production.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Profile {
    #[default]
    Dev,
    Prod,
}

/// Cache subsystem settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Backend name or fully qualified provider type selecting among multiple
    /// registered cache providers.
    pub provider: Option<String>,
    /// Default TTL applied to cache writes, in milliseconds. `None` means no
    /// expiry unless the aspect configures one.
    pub default_ttl_ms: Option<u64>,
}

impl CacheSettings {
    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl_ms.map(Duration::from_millis)
    }
}

/// Persistence subsystem settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceSettings {
    /// Served item type selecting among multiple registered persistence
    /// providers.
    pub provider: Option<String>,
}

/// Startup health gating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    /// Time each required downstream has to report healthy before startup
    /// fails.
    pub startup_timeout_ms: u64,
    /// Delay between health probe attempts.
    pub probe_interval_ms: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            startup_timeout_ms: 30_000,
            probe_interval_ms: 250,
        }
    }
}

impl HealthSettings {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

/// Root settings document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameworkSettings {
    pub profile: Profile,
    /// Concurrency cap for unordered merges; 0 means "number of CPUs".
    pub max_concurrency: usize,
    pub ordering: OrderingPolicy,
    /// Global step configuration defaults overlaid on the framework defaults.
    pub step_defaults: StepConfigOverlay,
    /// Per-step overrides keyed by step id.
    pub steps: HashMap<String, StepConfigOverlay>,
    pub cache: CacheSettings,
    pub persistence: PersistenceSettings,
    pub kill_switch: KillSwitchConfig,
    pub health: HealthSettings,
    /// Sampling interval of the run monitor (kill switch, inflight average).
    pub monitor_interval_ms: u64,
}

impl FrameworkSettings {
    /// Settings with every knob at its framework default.
    pub fn defaults() -> Self {
        Self {
            monitor_interval_ms: 100,
            ..Self::default()
        }
    }

    /// Loads settings from an optional TOML file plus `STEPFLOW_*`
    /// environment overrides (e.g. `STEPFLOW_MAX_CONCURRENCY=32`).
    pub fn load(path: Option<&Path>) -> Result<Self, PipelineError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        } else {
            builder = builder.add_source(File::with_name("stepflow").required(false));
        }
        builder = builder.add_source(Environment::with_prefix("STEPFLOW").separator("__"));

        let settings: FrameworkSettings = builder
            .build()
            .map_err(|e| PipelineError::invalid_config(format!("failed to load settings: {e}")))?
            .try_deserialize()
            .map_err(|e| PipelineError::invalid_config(format!("invalid settings: {e}")))?;
        let mut settings = settings;
        if settings.monitor_interval_ms == 0 {
            settings.monitor_interval_ms = 100;
        }
        Ok(settings)
    }

    pub fn effective_max_concurrency(&self) -> usize {
        if self.max_concurrency == 0 {
            std::thread::available_parallelism().map(usize::from).unwrap_or(4)
        } else {
            self.max_concurrency
        }
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms.max(1))
    }
}
