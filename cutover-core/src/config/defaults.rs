//! Default configuration values for Cutover
//!
//! Centralized so tuning knobs are easy to find.

use std::time::Duration;

// Storage defaults
pub const DEFAULT_DATA_DIR: &str = "./data";
pub const DEFAULT_DATABASE_FILE: &str = "cutover.redb";

// Appliance defaults
pub const DEFAULT_APPLIANCE_VM_ID: &str = "appliance";
pub const DEFAULT_APPLIANCE_HOST_ID: &str = "appliance-host";

// Timeout defaults
pub const DEFAULT_POWER_OFF_TIMEOUT_SECS: u64 = 300; // 5 minutes
pub const DEFAULT_POWER_ON_TIMEOUT_SECS: u64 = 180; // 3 minutes
pub const DEFAULT_FINAL_SYNC_TIMEOUT_SECS: u64 = 4 * 3600;
pub const DEFAULT_VOLUME_OPERATION_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_DEVICE_CORRELATION_WINDOW_SECS: u64 = 60;
pub const DEFAULT_SNAPSHOT_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_VM_CREATE_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_GUEST_READY_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_DRIVER_PREPARATION_TIMEOUT_SECS: u64 = 1800;

/// Correlation windows shorter than this cannot absorb platform provisioning delay
pub const MIN_DEVICE_CORRELATION_WINDOW_SECS: u64 = 10;

// Polling defaults
pub const DEFAULT_POWER_STATE_POLL_MS: u64 = 5_000;
pub const DEFAULT_VOLUME_OPERATION_POLL_MS: u64 = 1_000;
pub const DEFAULT_CORRELATION_POLL_MS: u64 = 500;

// Reconciliation defaults
pub const DEFAULT_RECONCILE_STALENESS_SECS: u64 = 900; // 15 minutes

// Logging defaults
pub const DEFAULT_LOG_LEVEL: &str = "info";

// Platform defaults
pub const DEFAULT_PLATFORM_BACKEND: &str = "simulated";

pub fn duration_secs(secs: u64) -> Duration {
    Duration::from_secs(secs)
}

pub fn duration_millis(millis: u64) -> Duration {
    Duration::from_millis(millis)
}
