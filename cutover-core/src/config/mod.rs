//! Configuration for Cutover
//!
//! Loaded from a TOML file, then overridden from the environment, then
//! validated. Every section has defaults so an empty file is a valid config.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CutoverError, CutoverResult};

pub mod defaults;

pub use defaults::*;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CutoverConfig {
    pub storage: StorageConfig,
    pub appliance: ApplianceConfig,
    pub timeouts: TimeoutConfig,
    pub polling: PollingConfig,
    pub reconcile: ReconcileConfig,
    pub logging: LoggingConfig,
    pub platform: PlatformConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the database file
    pub data_dir: PathBuf,

    /// Database file name inside `data_dir`
    pub database_file: String,
}

/// The source-facing appliance that owns replicated volumes between failovers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplianceConfig {
    /// Platform VM id of the appliance
    pub vm_id: String,

    /// Host whose block-device inventory is used for correlation
    pub host_id: String,
}

/// Bounded waits for every external call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    #[serde(with = "humantime_serde")]
    pub power_off: Duration,

    #[serde(with = "humantime_serde")]
    pub power_on: Duration,

    #[serde(with = "humantime_serde")]
    pub final_sync: Duration,

    #[serde(with = "humantime_serde")]
    pub volume_operation: Duration,

    /// Window in which a freshly attached device must appear
    #[serde(with = "humantime_serde")]
    pub device_correlation: Duration,

    #[serde(with = "humantime_serde")]
    pub snapshot: Duration,

    #[serde(with = "humantime_serde")]
    pub vm_create: Duration,

    /// Exceeding this only produces a warning
    #[serde(with = "humantime_serde")]
    pub guest_ready: Duration,

    #[serde(with = "humantime_serde")]
    pub driver_preparation: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    #[serde(with = "humantime_serde")]
    pub power_state_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub volume_operation_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub correlation_interval: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Non-terminal jobs untouched for longer than this are reconciled
    /// against platform state on startup
    #[serde(with = "humantime_serde")]
    pub staleness_threshold: Duration,

    pub run_on_startup: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub backend: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            database_file: DEFAULT_DATABASE_FILE.to_string(),
        }
    }
}

impl Default for ApplianceConfig {
    fn default() -> Self {
        Self {
            vm_id: DEFAULT_APPLIANCE_VM_ID.to_string(),
            host_id: DEFAULT_APPLIANCE_HOST_ID.to_string(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            power_off: duration_secs(DEFAULT_POWER_OFF_TIMEOUT_SECS),
            power_on: duration_secs(DEFAULT_POWER_ON_TIMEOUT_SECS),
            final_sync: duration_secs(DEFAULT_FINAL_SYNC_TIMEOUT_SECS),
            volume_operation: duration_secs(DEFAULT_VOLUME_OPERATION_TIMEOUT_SECS),
            device_correlation: duration_secs(DEFAULT_DEVICE_CORRELATION_WINDOW_SECS),
            snapshot: duration_secs(DEFAULT_SNAPSHOT_TIMEOUT_SECS),
            vm_create: duration_secs(DEFAULT_VM_CREATE_TIMEOUT_SECS),
            guest_ready: duration_secs(DEFAULT_GUEST_READY_TIMEOUT_SECS),
            driver_preparation: duration_secs(DEFAULT_DRIVER_PREPARATION_TIMEOUT_SECS),
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            power_state_interval: duration_millis(DEFAULT_POWER_STATE_POLL_MS),
            volume_operation_interval: duration_millis(DEFAULT_VOLUME_OPERATION_POLL_MS),
            correlation_interval: duration_millis(DEFAULT_CORRELATION_POLL_MS),
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            staleness_threshold: duration_secs(DEFAULT_RECONCILE_STALENESS_SECS),
            run_on_startup: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            json: false,
        }
    }
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            backend: DEFAULT_PLATFORM_BACKEND.to_string(),
        }
    }
}

impl CutoverConfig {
    /// Load from a TOML file, apply environment overrides and validate
    pub fn load(path: Option<&Path>) -> CutoverResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> CutoverResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> CutoverResult<Self> {
        toml::from_str(contents)
            .map_err(|e| CutoverError::configuration("config file", e.to_string()))
    }

    /// Apply `CUTOVER_*` environment overrides
    pub fn apply_env(&mut self) -> CutoverResult<()> {
        if let Ok(val) = std::env::var("CUTOVER_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("CUTOVER_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("CUTOVER_APPLIANCE_VM_ID") {
            self.appliance.vm_id = val;
        }
        if let Ok(val) = std::env::var("CUTOVER_RECONCILE_STALENESS_SECS") {
            let secs: u64 = val.parse().map_err(|_| {
                CutoverError::configuration(
                    "reconcile.staleness_threshold",
                    format!("Invalid CUTOVER_RECONCILE_STALENESS_SECS '{}'", val),
                )
            })?;
            self.reconcile.staleness_threshold = duration_secs(secs);
        }
        Ok(())
    }

    pub fn validate(&self) -> CutoverResult<()> {
        let timeouts = [
            ("timeouts.power_off", self.timeouts.power_off),
            ("timeouts.power_on", self.timeouts.power_on),
            ("timeouts.final_sync", self.timeouts.final_sync),
            ("timeouts.volume_operation", self.timeouts.volume_operation),
            ("timeouts.snapshot", self.timeouts.snapshot),
            ("timeouts.vm_create", self.timeouts.vm_create),
            ("timeouts.guest_ready", self.timeouts.guest_ready),
            ("timeouts.driver_preparation", self.timeouts.driver_preparation),
            ("polling.power_state_interval", self.polling.power_state_interval),
            ("polling.volume_operation_interval", self.polling.volume_operation_interval),
            ("polling.correlation_interval", self.polling.correlation_interval),
        ];
        for (name, value) in timeouts {
            if value.is_zero() {
                return Err(CutoverError::configuration(name, "must be greater than zero"));
            }
        }

        if self.timeouts.device_correlation < duration_secs(MIN_DEVICE_CORRELATION_WINDOW_SECS) {
            return Err(CutoverError::configuration(
                "timeouts.device_correlation",
                format!(
                    "must be at least {}s to tolerate asynchronous provisioning delay",
                    MIN_DEVICE_CORRELATION_WINDOW_SECS
                ),
            ));
        }

        if self.appliance.vm_id.is_empty() {
            return Err(CutoverError::configuration("appliance.vm_id", "cannot be empty"));
        }

        if self.platform.backend != DEFAULT_PLATFORM_BACKEND {
            return Err(CutoverError::configuration(
                "platform.backend",
                format!("unsupported backend '{}'", self.platform.backend),
            ));
        }

        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.storage.data_dir.join(&self.storage.database_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_yields_defaults() {
        let config = CutoverConfig::from_toml_str("").unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.timeouts.power_off, Duration::from_secs(300));
        assert_eq!(config.reconcile.staleness_threshold, Duration::from_secs(900));
    }

    #[test]
    fn test_humantime_durations() {
        let config = CutoverConfig::from_toml_str(
            r#"
            [timeouts]
            device_correlation = "90s"
            power_off = "2m"

            [reconcile]
            staleness_threshold = "1h"
            "#,
        )
        .unwrap();
        assert_eq!(config.timeouts.device_correlation, Duration::from_secs(90));
        assert_eq!(config.timeouts.power_off, Duration::from_secs(120));
        assert_eq!(config.reconcile.staleness_threshold, Duration::from_secs(3600));
        // untouched fields keep defaults
        assert_eq!(config.timeouts.power_on, Duration::from_secs(180));
    }

    #[test]
    fn test_short_correlation_window_rejected() {
        let mut config = CutoverConfig::default();
        config.timeouts.device_correlation = Duration::from_secs(2);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("timeouts.device_correlation"));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = CutoverConfig::default();
        config.timeouts.snapshot = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let config = CutoverConfig::from_toml_str("[platform]\nbackend = \"vsphere\"\n").unwrap();
        assert!(config.validate().is_err());
    }
}
