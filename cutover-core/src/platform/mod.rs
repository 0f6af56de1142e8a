//! Interfaces to the systems cutover drives but does not own
//!
//! The destination cloud (volumes, snapshots, compute), the appliance host's
//! block-device inventory, the source hypervisor, the replication transport,
//! the guest driver conversion tool and the credential store are all
//! consumed through these traits. Every call is async and returns a
//! [`CutoverError`](crate::error::CutoverError) classified for retry and
//! reporting.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::CutoverConfig;
use crate::error::{CutoverError, CutoverResult};
use crate::types::{DeviceLocation, DiskDescriptor, Firmware, GuestFamily, VolumeId};

pub mod simulated;

pub use simulated::{FailureInjection, SimulatedPlatform};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub volume_id: VolumeId,
    pub name: String,
    pub size_gb: u64,
    /// VM the volume is currently attached to
    pub attached_to: Option<String>,
    /// Device slot the platform assigned on attach
    pub device_slot: Option<u32>,
    pub account: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotState {
    Creating,
    BackedUp,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub snapshot_id: String,
    pub volume_id: VolumeId,
    pub name: String,
    pub state: SnapshotState,
}

/// Block device as listed on the appliance host
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockDevice {
    pub path: String,
    pub size_bytes: u64,
    /// Serial reported by virtio, when the hypervisor exposes one
    pub serial: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    Running,
    Stopped,
    Starting,
    Stopping,
}

/// Compute profile for a destination VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSpec {
    pub name: String,
    pub cpus: u32,
    pub memory_mb: u32,
    pub firmware: Firmware,
    pub guest_family: GuestFamily,
    /// Destination network ids, in NIC order
    pub network_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmInfo {
    pub vm_id: String,
    pub name: String,
    pub power_state: PowerState,
    pub account: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub network_id: String,
    pub name: String,
    /// Isolated networks have no route to production
    pub isolated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncHandle(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStatus {
    Running,
    Completed { change_marker: String },
    Failed { reason: String },
}

/// Credentials currently active for the destination platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub account: String,
    pub endpoint: String,
}

#[async_trait]
pub trait VolumePlatform: Send + Sync {
    async fn create_volume(&self, name: &str, size_gb: u64) -> CutoverResult<VolumeInfo>;

    /// Request an attach; completion is observed, not assumed
    async fn attach_volume(&self, volume_id: &VolumeId, vm_id: &str) -> CutoverResult<()>;

    async fn detach_volume(&self, volume_id: &VolumeId) -> CutoverResult<()>;

    async fn delete_volume(&self, volume_id: &VolumeId) -> CutoverResult<()>;

    async fn get_volume(&self, volume_id: &VolumeId) -> CutoverResult<Option<VolumeInfo>>;

    async fn list_volumes_for_vm(&self, vm_id: &str) -> CutoverResult<Vec<VolumeInfo>>;
}

#[async_trait]
pub trait SnapshotPlatform: Send + Sync {
    async fn create_snapshot(&self, volume_id: &VolumeId, name: &str) -> CutoverResult<SnapshotInfo>;

    async fn get_snapshot(&self, snapshot_id: &str) -> CutoverResult<Option<SnapshotInfo>>;

    async fn list_snapshots(&self, volume_id: &VolumeId) -> CutoverResult<Vec<SnapshotInfo>>;

    /// Fails while the volume is attached to a running VM
    async fn revert_snapshot(&self, snapshot_id: &str) -> CutoverResult<()>;

    async fn delete_snapshot(&self, snapshot_id: &str) -> CutoverResult<()>;
}

/// Block devices currently visible on a host
#[async_trait]
pub trait HostDeviceInventory: Send + Sync {
    async fn list_block_devices(&self, host_id: &str) -> CutoverResult<Vec<BlockDevice>>;
}

#[async_trait]
pub trait ComputePlatform: Send + Sync {
    async fn create_vm(&self, spec: &VmSpec) -> CutoverResult<String>;

    async fn delete_vm(&self, vm_id: &str) -> CutoverResult<()>;

    async fn power_on_vm(&self, vm_id: &str) -> CutoverResult<()>;

    async fn power_off_vm(&self, vm_id: &str) -> CutoverResult<()>;

    async fn get_vm(&self, vm_id: &str) -> CutoverResult<Option<VmInfo>>;

    async fn find_vm_by_name(&self, name: &str) -> CutoverResult<Option<VmInfo>>;

    /// Whether the guest inside a running VM answers
    async fn guest_responsive(&self, vm_id: &str) -> CutoverResult<bool>;

    async fn list_networks(&self) -> CutoverResult<Vec<NetworkInfo>>;
}

/// Power control over the source hypervisor
#[async_trait]
pub trait HypervisorControl: Send + Sync {
    async fn power_off(&self, source_vm_id: &str) -> CutoverResult<()>;

    async fn power_on(&self, source_vm_id: &str) -> CutoverResult<()>;

    async fn get_power_state(&self, source_vm_id: &str) -> CutoverResult<PowerState>;
}

#[async_trait]
pub trait ReplicationTransport: Send + Sync {
    async fn start_incremental_sync(
        &self,
        disk: &DiskDescriptor,
        change_marker: Option<&str>,
    ) -> CutoverResult<SyncHandle>;

    async fn sync_status(&self, handle: &SyncHandle) -> CutoverResult<SyncStatus>;
}

/// One-shot guest conversion run against a boot volume
#[async_trait]
pub trait DriverPreparation: Send + Sync {
    async fn prepare_boot_volume(
        &self,
        volume_id: &VolumeId,
        device: &DeviceLocation,
        guest_family: GuestFamily,
    ) -> CutoverResult<()>;
}

/// Queried per job; never cached for a service's lifetime
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn active_credentials(&self) -> CutoverResult<Credentials>;

    /// Account owning a VM on the destination platform
    async fn vm_account(&self, vm_id: &str) -> CutoverResult<String>;
}

/// Every external capability the engine needs, bundled for wiring
#[derive(Clone)]
pub struct PlatformServices {
    pub volumes: Arc<dyn VolumePlatform>,
    pub snapshots: Arc<dyn SnapshotPlatform>,
    pub inventory: Arc<dyn HostDeviceInventory>,
    pub compute: Arc<dyn ComputePlatform>,
    pub hypervisor: Arc<dyn HypervisorControl>,
    pub transport: Arc<dyn ReplicationTransport>,
    pub drivers: Arc<dyn DriverPreparation>,
    pub credentials: Arc<dyn CredentialProvider>,
}

impl PlatformServices {
    pub fn from_simulated(platform: Arc<SimulatedPlatform>) -> Self {
        Self {
            volumes: platform.clone(),
            snapshots: platform.clone(),
            inventory: platform.clone(),
            compute: platform.clone(),
            hypervisor: platform.clone(),
            transport: platform.clone(),
            drivers: platform.clone(),
            credentials: platform,
        }
    }

    /// Build the backend named in the configuration
    pub fn from_config(config: &CutoverConfig) -> CutoverResult<(Self, Option<Arc<SimulatedPlatform>>)> {
        match config.platform.backend.as_str() {
            "simulated" => {
                let platform = Arc::new(SimulatedPlatform::new(
                    &config.appliance.vm_id,
                    &config.appliance.host_id,
                ));
                Ok((Self::from_simulated(platform.clone()), Some(platform)))
            }
            other => Err(CutoverError::configuration(
                "platform",
                format!("unknown backend '{}'", other),
            )),
        }
    }
}

impl std::fmt::Debug for PlatformServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformServices").finish_non_exhaustive()
    }
}
