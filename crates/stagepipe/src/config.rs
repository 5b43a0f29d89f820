//! Pipeline configuration with auto-tuning based on system resources.

use serde::{Deserialize, Serialize};
use std::path::Path;
use sysinfo::System;
use tracing::info;

use crate::error::{PipelineError, Result};

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total RAM in bytes.
    pub total_memory_bytes: u64,
    /// Total RAM in GB.
    pub total_memory_gb: f64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        let total_memory_bytes = sys.total_memory();
        let total_memory_gb = total_memory_bytes as f64 / (1024.0 * 1024.0 * 1024.0);
        let cpu_cores = sys.cpus().len();

        Self {
            total_memory_bytes,
            total_memory_gb,
            cpu_cores,
        }
    }

    /// Log detected system resources.
    pub fn log(&self) {
        info!(
            "System resources: {:.1} GB RAM, {} CPU cores",
            self.total_memory_gb, self.cpu_cores
        );
    }
}

/// What a worker does when a transform fails on a single item.
///
/// The policy is chosen once per pipeline and applied uniformly to every
/// stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Abort the whole run on the first transform failure.
    #[default]
    FailFast,

    /// Log the failure, drop the item, and keep the loop running.
    SkipAndLog,
}

/// Pipeline behavior configuration.
/// Performance-related fields use Option<T> to distinguish between "not set"
/// (use auto-tuned default) and "explicitly set" (use provided value).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PipelineConfig {
    /// Channel capacity in items; 0 means unbounded. Auto-tuned based on RAM
    /// if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_capacity: Option<usize>,

    /// Workers per stage when a stage does not specify its own pool size.
    /// Auto-tuned based on CPU cores if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_pool_size: Option<usize>,

    /// Failure policy applied to every stage (default: fail_fast).
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

impl PipelineConfig {
    /// Load configuration from a YAML file and validate it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: PipelineConfig = serde_yaml::from_str(&contents)?;
        validate(&config)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let contents = serde_yaml::to_string(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that weren't explicitly set.
    pub fn with_auto_tuning(self) -> Self {
        let resources = SystemResources::detect();
        resources.log();
        self.with_auto_tuning_from(&resources)
    }

    /// Apply auto-tuned defaults from already-detected resources.
    pub fn with_auto_tuning_from(mut self, resources: &SystemResources) -> Self {
        let cores = resources.cpu_cores;
        let ram_gb = resources.total_memory_gb;

        // Pool size: scale with cores, 2-8 range
        if self.default_pool_size.is_none() {
            let pool = (cores / 2).max(2).min(8);
            self.default_pool_size = Some(pool);
        }

        // Channel capacity: scale with RAM
        // Base: 16 slots, +16 per 8GB of RAM, cap at 128
        if self.channel_capacity.is_none() {
            let capacity = 16 + ((ram_gb / 8.0) as usize * 16);
            let capacity = capacity.max(16).min(128);
            self.channel_capacity = Some(capacity);
        }

        info!(
            "Auto-tuned config: pool_size={}, channel_capacity={}, failure_policy={:?}",
            self.default_pool_size.unwrap(),
            self.channel_capacity.unwrap(),
            self.failure_policy,
        );

        self
    }

    // Accessor methods that return the effective value (with fallback
    // defaults). These are used when the config hasn't been auto-tuned yet.

    pub fn get_channel_capacity(&self) -> usize {
        self.channel_capacity.unwrap_or(16)
    }

    pub fn get_default_pool_size(&self) -> usize {
        self.default_pool_size.unwrap_or(4)
    }
}

/// Validate the configuration.
pub fn validate(config: &PipelineConfig) -> Result<()> {
    // Only check values that were explicitly set
    if let Some(0) = config.default_pool_size {
        return Err(PipelineError::Config(
            "default_pool_size must be at least 1".into(),
        ));
    }

    Ok(())
}
