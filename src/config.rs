/*!
 * Configuration types for Warden
 *
 * Every threshold in here was tuned empirically; the defaults are a starting
 * point and all of them can be overridden from TOML.
 */

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use warden_core_resilience::{AdmissionConfig, DeviceClass, GovernorConfig};

use crate::assets::AssetConfig;
use crate::error::{Result, WardenError};
use crate::lifecycle::LifecycleConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::policy::PolicyConfig;
use crate::recovery::RecoveryConfig;
use crate::store::StoreConfig;

/// Main configuration for a Warden context
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WardenConfig {
    #[serde(default)]
    pub governor: GovernorSection,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub admission: AdmissionSection,

    #[serde(default)]
    pub policy: PolicyConfig,

    #[serde(default)]
    pub assets: AssetConfig,

    #[serde(default)]
    pub recovery: RecoveryConfig,

    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Signal governor tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernorSection {
    #[serde(default = "default_max_signals")]
    pub max_signals_per_window: u32,

    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    #[serde(default = "default_resting_period_ms")]
    pub resting_period_ms: u64,

    #[serde(default = "default_recovery_time_ms")]
    pub recovery_time_ms: u64,

    #[serde(default = "default_emergency_threshold")]
    pub emergency_threshold: u32,

    #[serde(default = "default_notification_interval_ms")]
    pub notification_interval_ms: u64,
}

impl Default for GovernorSection {
    fn default() -> Self {
        Self {
            max_signals_per_window: default_max_signals(),
            window_ms: default_window_ms(),
            resting_period_ms: default_resting_period_ms(),
            recovery_time_ms: default_recovery_time_ms(),
            emergency_threshold: default_emergency_threshold(),
            notification_interval_ms: default_notification_interval_ms(),
        }
    }
}

impl GovernorSection {
    pub fn to_governor_config(&self) -> GovernorConfig {
        GovernorConfig {
            max_signals_per_window: self.max_signals_per_window,
            window: Duration::from_millis(self.window_ms),
            resting_period: Duration::from_millis(self.resting_period_ms),
            recovery_time: Duration::from_millis(self.recovery_time_ms),
            emergency_threshold: self.emergency_threshold,
            notification_interval: Duration::from_millis(self.notification_interval_ms),
        }
    }
}

/// Admission controller tunables
///
/// Capacity fields left unset are derived from the device probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionSection {
    #[serde(default)]
    pub max_concurrent_leases: Option<usize>,

    #[serde(default)]
    pub max_queue_size: Option<usize>,

    #[serde(default = "default_queue_timeout_ms")]
    pub queue_timeout_ms: u64,

    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for AdmissionSection {
    fn default() -> Self {
        Self {
            max_concurrent_leases: None,
            max_queue_size: None,
            queue_timeout_ms: default_queue_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl AdmissionSection {
    /// Resolve limits against the probed device class
    pub fn to_admission_config(&self, class: DeviceClass) -> AdmissionConfig {
        let derived = AdmissionConfig::for_class(class);
        AdmissionConfig {
            max_concurrent_leases: self
                .max_concurrent_leases
                .unwrap_or(derived.max_concurrent_leases),
            max_queue_size: self.max_queue_size.unwrap_or(derived.max_queue_size),
            queue_timeout: Duration::from_millis(self.queue_timeout_ms),
            sweep_interval: Duration::from_millis(self.sweep_interval_ms),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level for diagnostic output
    #[serde(default)]
    pub level: LogLevel,

    /// Log file path (None = stdout)
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Enable verbose logging (shorthand for level = debug)
    #[serde(default)]
    pub verbose: bool,
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

// Default value functions for serde
fn default_max_signals() -> u32 {
    10
}

fn default_window_ms() -> u64 {
    1000
}

fn default_resting_period_ms() -> u64 {
    1000
}

fn default_recovery_time_ms() -> u64 {
    5000
}

fn default_emergency_threshold() -> u32 {
    3
}

fn default_notification_interval_ms() -> u64 {
    5000
}

fn default_queue_timeout_ms() -> u64 {
    5000
}

fn default_sweep_interval_ms() -> u64 {
    2000
}

impl WardenConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: WardenConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| WardenError::Serialization(e.to_string()))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.governor.max_signals_per_window == 0 {
            return Err(WardenError::Config(
                "governor.max_signals_per_window must be at least 1".to_string(),
            ));
        }

        if self.governor.window_ms == 0 {
            return Err(WardenError::Config(
                "governor.window_ms must be greater than 0".to_string(),
            ));
        }

        if self.governor.emergency_threshold == 0 {
            return Err(WardenError::Config(
                "governor.emergency_threshold must be at least 1".to_string(),
            ));
        }

        if self.admission.max_concurrent_leases == Some(0) {
            return Err(WardenError::Config(
                "admission.max_concurrent_leases must be at least 1".to_string(),
            ));
        }

        if self.store.key_prefix.is_empty() {
            return Err(WardenError::Config(
                "store.key_prefix must not be empty".to_string(),
            ));
        }

        if self.policy.max_violations == 0 {
            return Err(WardenError::Config(
                "policy.max_violations must be at least 1".to_string(),
            ));
        }

        if self.orchestrator.poll_interval_ms == 0 {
            return Err(WardenError::Config(
                "orchestrator.poll_interval_ms must be greater than 0".to_string(),
            ));
        }

        self.recovery.validate()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = WardenConfig::default();
        assert_eq!(config.governor.max_signals_per_window, 10);
        assert_eq!(config.store.key_prefix, "warden:");
        assert_eq!(config.admission.max_concurrent_leases, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: WardenConfig = toml::from_str(
            r#"
            [governor]
            max_signals_per_window = 2

            [admission]
            max_concurrent_leases = 1

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();

        assert_eq!(config.governor.max_signals_per_window, 2);
        assert_eq!(config.governor.window_ms, 1000);
        assert_eq!(config.logging.level, LogLevel::Debug);

        let admission = config.admission.to_admission_config(DeviceClass::Desktop);
        assert_eq!(admission.max_concurrent_leases, 1);
        assert_eq!(admission.max_queue_size, 16);
    }

    #[test]
    fn test_validation_failures() {
        let mut config = WardenConfig::default();

        config.governor.max_signals_per_window = 0;
        assert!(config.validate().is_err());
        config.governor.max_signals_per_window = 10;

        config.admission.max_concurrent_leases = Some(0);
        assert!(config.validate().is_err());
        config.admission.max_concurrent_leases = None;

        config.store.key_prefix.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_roundtrip() {
        let file = NamedTempFile::new().unwrap();
        let mut config = WardenConfig::default();
        config.recovery.noise_threshold = 7;

        config.to_file(file.path()).unwrap();
        let loaded = WardenConfig::from_file(file.path()).unwrap();
        assert_eq!(loaded.recovery.noise_threshold, 7);
    }

    #[test]
    fn test_governor_conversion() {
        let section = GovernorSection {
            resting_period_ms: 250,
            ..Default::default()
        };
        let governor = section.to_governor_config();
        assert_eq!(governor.resting_period, Duration::from_millis(250));
        assert_eq!(governor.max_signals_per_window, 10);
    }

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(LogLevel::Error.to_tracing_level(), tracing::Level::ERROR);
        assert_eq!(LogLevel::Trace.to_tracing_level(), tracing::Level::TRACE);
    }
}
