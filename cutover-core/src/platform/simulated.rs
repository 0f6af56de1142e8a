//! In-memory platform used by tests and the demo command
//!
//! Behaves like a destination cloud with an appliance host attached: device
//! paths for appliance attaches are picked at random from the free
//! `/dev/vdX` letters and may show up late, so nothing downstream can get
//! away with predicting them. Failures are injected through
//! [`FailureInjection`].

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::debug;

use super::{
    BlockDevice, ComputePlatform, CredentialProvider, Credentials, DriverPreparation,
    HostDeviceInventory, HypervisorControl, NetworkInfo, PowerState, ReplicationTransport,
    SnapshotInfo, SnapshotPlatform, SnapshotState, SyncHandle, SyncStatus, VmInfo, VmSpec,
    VolumeInfo, VolumePlatform,
};
use crate::error::{CutoverError, CutoverResult};
use crate::types::{DeviceLocation, DiskDescriptor, GuestFamily, VolumeId};

const DEFAULT_ACCOUNT: &str = "admin";
const MAX_GUEST_SLOTS: u32 = 15;

/// Knobs for making the simulated platform misbehave
#[derive(Debug, Clone)]
pub struct FailureInjection {
    /// Snapshot creation fails for these volumes
    pub fail_snapshot_for: HashSet<VolumeId>,
    pub fail_vm_create: bool,
    /// Appliance attaches succeed but the device never shows up on the host
    pub hide_host_devices: bool,
    /// Delay before an attached device becomes visible on the host
    pub device_delay: Duration,
    /// Report virtio serials for host devices
    pub expose_serials: bool,
    /// A detached host device stays listed this long; its path is free for
    /// reuse immediately
    pub device_linger: Duration,
    pub fail_driver_preparation: bool,
    /// Source VM stays in `stopping` forever
    pub stuck_power_off: bool,
    pub guest_unresponsive: bool,
    pub fail_sync: bool,
    /// Delay added to every call
    pub latency: Duration,
}

impl Default for FailureInjection {
    fn default() -> Self {
        Self {
            fail_snapshot_for: HashSet::new(),
            fail_vm_create: false,
            hide_host_devices: false,
            device_delay: Duration::ZERO,
            expose_serials: true,
            device_linger: Duration::ZERO,
            fail_driver_preparation: false,
            stuck_power_off: false,
            guest_unresponsive: false,
            fail_sync: false,
            latency: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
struct HostDevice {
    device: BlockDevice,
    visible_at: Instant,
}

/// A detached device the host inventory still reports
#[derive(Debug, Clone)]
struct LingeringDevice {
    device: BlockDevice,
    gone_at: Instant,
}

#[derive(Debug, Clone)]
struct SimSync {
    disk_key: u32,
    polls: u32,
}

#[derive(Debug, Default)]
struct SimState {
    next_id: u64,
    active_account: Option<String>,
    volumes: HashMap<VolumeId, VolumeInfo>,
    vms: HashMap<String, VmInfo>,
    vm_specs: HashMap<String, VmSpec>,
    snapshots: HashMap<String, SnapshotInfo>,
    host_devices: HashMap<VolumeId, HostDevice>,
    lingering_devices: Vec<LingeringDevice>,
    source_power: HashMap<String, PowerState>,
    syncs: HashMap<String, SimSync>,
    networks: Vec<NetworkInfo>,
    driver_runs: Vec<VolumeId>,
    reverts: Vec<String>,
}

impl SimState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{:08x}-{:04}", prefix, rand::random::<u32>(), self.next_id)
    }

    fn account(&self) -> String {
        self.active_account
            .clone()
            .unwrap_or_else(|| DEFAULT_ACCOUNT.to_string())
    }

    fn volume_mut(&mut self, volume_id: &VolumeId) -> CutoverResult<&mut VolumeInfo> {
        self.volumes
            .get_mut(volume_id)
            .ok_or_else(|| CutoverError::not_found(format!("volume {}", volume_id)))
    }
}

pub struct SimulatedPlatform {
    appliance_vm_id: String,
    host_id: String,
    state: Mutex<SimState>,
    failures: Mutex<FailureInjection>,
}

impl std::fmt::Debug for SimulatedPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedPlatform")
            .field("appliance_vm_id", &self.appliance_vm_id)
            .field("host_id", &self.host_id)
            .finish_non_exhaustive()
    }
}

impl SimulatedPlatform {
    /// Platform with the appliance VM already running on `host_id`
    pub fn new(appliance_vm_id: &str, host_id: &str) -> Self {
        let mut state = SimState::default();
        state.vms.insert(
            appliance_vm_id.to_string(),
            VmInfo {
                vm_id: appliance_vm_id.to_string(),
                name: "cutover-appliance".to_string(),
                power_state: PowerState::Running,
                account: DEFAULT_ACCOUNT.to_string(),
            },
        );
        Self {
            appliance_vm_id: appliance_vm_id.to_string(),
            host_id: host_id.to_string(),
            state: Mutex::new(state),
            failures: Mutex::new(FailureInjection::default()),
        }
    }

    pub fn inject(&self, f: impl FnOnce(&mut FailureInjection)) {
        f(&mut self.failures.lock());
    }

    fn failures(&self) -> FailureInjection {
        self.failures.lock().clone()
    }

    async fn simulate_latency(&self) {
        let latency = self.failures.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    // Seeding

    pub fn add_network(&self, network_id: &str, name: &str, isolated: bool) {
        self.state.lock().networks.push(NetworkInfo {
            network_id: network_id.to_string(),
            name: name.to_string(),
            isolated,
        });
    }

    pub fn add_source_vm(&self, source_vm_id: &str, power_state: PowerState) {
        self.state
            .lock()
            .source_power
            .insert(source_vm_id.to_string(), power_state);
    }

    /// A replicated volume, already attached to the appliance with its
    /// device visible
    pub fn seed_appliance_volume(&self, name: &str, size_gb: u64) -> VolumeId {
        let expose_serials = self.failures.lock().expose_serials;
        let mut state = self.state.lock();
        let volume_id = VolumeId::new(uuid::Uuid::new_v4().to_string());
        let slot = pick_slot(&state, &self.appliance_vm_id);
        let account = state.account();
        state.volumes.insert(
            volume_id.clone(),
            VolumeInfo {
                volume_id: volume_id.clone(),
                name: name.to_string(),
                size_gb,
                attached_to: Some(self.appliance_vm_id.clone()),
                device_slot: slot,
                account,
            },
        );
        let path = pick_device_path(&state);
        state.host_devices.insert(
            volume_id.clone(),
            HostDevice {
                device: BlockDevice {
                    path,
                    size_bytes: size_gb * 1024 * 1024 * 1024,
                    serial: expose_serials.then(|| volume_id.virtio_serial()),
                },
                visible_at: Instant::now(),
            },
        );
        volume_id
    }

    /// Rotate the credentials the platform considers active
    pub fn set_active_account(&self, account: &str) {
        self.state.lock().active_account = Some(account.to_string());
    }

    pub fn clear_active_account(&self) {
        self.state.lock().active_account = Some(String::new());
    }

    pub fn set_vm_account(&self, vm_id: &str, account: &str) {
        if let Some(vm) = self.state.lock().vms.get_mut(vm_id) {
            vm.account = account.to_string();
        }
    }

    // Inspection

    pub fn volume(&self, volume_id: &VolumeId) -> Option<VolumeInfo> {
        self.state.lock().volumes.get(volume_id).cloned()
    }

    pub fn vm(&self, vm_id: &str) -> Option<VmInfo> {
        self.state.lock().vms.get(vm_id).cloned()
    }

    pub fn vm_spec(&self, vm_id: &str) -> Option<VmSpec> {
        self.state.lock().vm_specs.get(vm_id).cloned()
    }

    pub fn vm_by_name(&self, name: &str) -> Option<VmInfo> {
        self.state
            .lock()
            .vms
            .values()
            .find(|vm| vm.name == name)
            .cloned()
    }

    /// Destination VMs, excluding the appliance
    pub fn destination_vm_count(&self) -> usize {
        self.state
            .lock()
            .vms
            .keys()
            .filter(|id| **id != self.appliance_vm_id)
            .count()
    }

    pub fn snapshots_for(&self, volume_id: &VolumeId) -> Vec<SnapshotInfo> {
        self.state
            .lock()
            .snapshots
            .values()
            .filter(|s| &s.volume_id == volume_id)
            .cloned()
            .collect()
    }

    pub fn snapshot_count(&self) -> usize {
        self.state.lock().snapshots.len()
    }

    pub fn source_power_state(&self, source_vm_id: &str) -> Option<PowerState> {
        self.state.lock().source_power.get(source_vm_id).copied()
    }

    /// Path the host actually assigned, visible or not
    pub fn assigned_host_path(&self, volume_id: &VolumeId) -> Option<String> {
        self.state
            .lock()
            .host_devices
            .get(volume_id)
            .map(|d| d.device.path.clone())
    }

    pub fn driver_runs(&self) -> Vec<VolumeId> {
        self.state.lock().driver_runs.clone()
    }

    pub fn reverted_snapshots(&self) -> Vec<String> {
        self.state.lock().reverts.clone()
    }
}

fn pick_device_path(state: &SimState) -> String {
    let used: HashSet<&str> = state
        .host_devices
        .values()
        .map(|d| d.device.path.as_str())
        .collect();
    // The kernel hands a freed name out again while a stale listing lags
    let now = Instant::now();
    if let Some(stale) = state
        .lingering_devices
        .iter()
        .find(|d| d.gone_at > now && !used.contains(d.device.path.as_str()))
    {
        return stale.device.path.clone();
    }
    // vda is the appliance's own root disk
    let mut free: Vec<String> = ('b'..='z')
        .map(|letter| format!("/dev/vd{}", letter))
        .filter(|path| !used.contains(path.as_str()))
        .collect();
    free.shuffle(&mut rand::thread_rng());
    free.pop()
        .unwrap_or_else(|| format!("/dev/vdz{}", state.host_devices.len()))
}

fn pick_slot(state: &SimState, vm_id: &str) -> Option<u32> {
    let used: HashSet<u32> = state
        .volumes
        .values()
        .filter(|v| v.attached_to.as_deref() == Some(vm_id))
        .filter_map(|v| v.device_slot)
        .collect();
    let mut free: Vec<u32> = (1..=MAX_GUEST_SLOTS).filter(|s| !used.contains(s)).collect();
    free.shuffle(&mut rand::thread_rng());
    free.pop()
}

#[async_trait]
impl VolumePlatform for SimulatedPlatform {
    async fn create_volume(&self, name: &str, size_gb: u64) -> CutoverResult<VolumeInfo> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        let volume_id = VolumeId::new(uuid::Uuid::new_v4().to_string());
        let info = VolumeInfo {
            volume_id: volume_id.clone(),
            name: name.to_string(),
            size_gb,
            attached_to: None,
            device_slot: None,
            account: state.account(),
        };
        state.volumes.insert(volume_id, info.clone());
        Ok(info)
    }

    async fn attach_volume(&self, volume_id: &VolumeId, vm_id: &str) -> CutoverResult<()> {
        self.simulate_latency().await;
        let failures = self.failures();
        let mut state = self.state.lock();
        if !state.vms.contains_key(vm_id) {
            return Err(CutoverError::not_found(format!("vm {}", vm_id)));
        }
        let slot = pick_slot(&state, vm_id);
        let volume = state.volume_mut(volume_id)?;
        if let Some(owner) = &volume.attached_to {
            return Err(CutoverError::platform_failed(
                "attach volume",
                format!("volume {} is already attached to {}", volume_id, owner),
            ));
        }
        volume.attached_to = Some(vm_id.to_string());
        volume.device_slot = slot;
        let size_bytes = volume.size_gb * 1024 * 1024 * 1024;

        if vm_id == self.appliance_vm_id && !failures.hide_host_devices {
            let path = pick_device_path(&state);
            debug!(volume_id = %volume_id, path = %path, "Simulated host device assigned");
            state.lingering_devices.retain(|d| d.device.path != path);
            state.host_devices.insert(
                volume_id.clone(),
                HostDevice {
                    device: BlockDevice {
                        path,
                        size_bytes,
                        serial: failures.expose_serials.then(|| volume_id.virtio_serial()),
                    },
                    visible_at: Instant::now() + failures.device_delay,
                },
            );
        }
        Ok(())
    }

    async fn detach_volume(&self, volume_id: &VolumeId) -> CutoverResult<()> {
        self.simulate_latency().await;
        let failures = self.failures();
        let mut state = self.state.lock();
        let volume = state.volume_mut(volume_id)?;
        if volume.attached_to.is_none() {
            return Err(CutoverError::platform_failed(
                "detach volume",
                format!("volume {} is not attached", volume_id),
            ));
        }
        volume.attached_to = None;
        volume.device_slot = None;
        if let Some(host) = state.host_devices.remove(volume_id) {
            if !failures.device_linger.is_zero() {
                state.lingering_devices.push(LingeringDevice {
                    device: host.device,
                    gone_at: Instant::now() + failures.device_linger,
                });
            }
        }
        Ok(())
    }

    async fn delete_volume(&self, volume_id: &VolumeId) -> CutoverResult<()> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        let volume = state.volume_mut(volume_id)?;
        if volume.attached_to.is_some() {
            return Err(CutoverError::platform_failed(
                "delete volume",
                format!("volume {} is still attached", volume_id),
            ));
        }
        state.volumes.remove(volume_id);
        Ok(())
    }

    async fn get_volume(&self, volume_id: &VolumeId) -> CutoverResult<Option<VolumeInfo>> {
        self.simulate_latency().await;
        Ok(self.state.lock().volumes.get(volume_id).cloned())
    }

    async fn list_volumes_for_vm(&self, vm_id: &str) -> CutoverResult<Vec<VolumeInfo>> {
        self.simulate_latency().await;
        let state = self.state.lock();
        let mut volumes: Vec<VolumeInfo> = state
            .volumes
            .values()
            .filter(|v| v.attached_to.as_deref() == Some(vm_id))
            .cloned()
            .collect();
        volumes.sort_by(|a, b| a.volume_id.cmp(&b.volume_id));
        Ok(volumes)
    }
}

#[async_trait]
impl SnapshotPlatform for SimulatedPlatform {
    async fn create_snapshot(&self, volume_id: &VolumeId, name: &str) -> CutoverResult<SnapshotInfo> {
        self.simulate_latency().await;
        let failures = self.failures();
        let mut state = self.state.lock();
        if !state.volumes.contains_key(volume_id) {
            return Err(CutoverError::not_found(format!("volume {}", volume_id)));
        }
        if failures.fail_snapshot_for.contains(volume_id) {
            return Err(CutoverError::platform_failed(
                "create snapshot",
                format!("primary storage rejected snapshot of volume {}", volume_id),
            ));
        }
        let snapshot = SnapshotInfo {
            snapshot_id: state.next_id("snap"),
            volume_id: volume_id.clone(),
            name: name.to_string(),
            state: SnapshotState::BackedUp,
        };
        state
            .snapshots
            .insert(snapshot.snapshot_id.clone(), snapshot.clone());
        Ok(snapshot)
    }

    async fn get_snapshot(&self, snapshot_id: &str) -> CutoverResult<Option<SnapshotInfo>> {
        self.simulate_latency().await;
        Ok(self.state.lock().snapshots.get(snapshot_id).cloned())
    }

    async fn list_snapshots(&self, volume_id: &VolumeId) -> CutoverResult<Vec<SnapshotInfo>> {
        Ok(self.snapshots_for(volume_id))
    }

    async fn revert_snapshot(&self, snapshot_id: &str) -> CutoverResult<()> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        let snapshot = state
            .snapshots
            .get(snapshot_id)
            .cloned()
            .ok_or_else(|| CutoverError::not_found(format!("snapshot {}", snapshot_id)))?;
        let owner_running = state
            .volumes
            .get(&snapshot.volume_id)
            .and_then(|v| v.attached_to.as_ref())
            .and_then(|owner| state.vms.get(owner))
            .map(|vm| vm.power_state == PowerState::Running && vm.vm_id != self.appliance_vm_id)
            .unwrap_or(false);
        if owner_running {
            return Err(CutoverError::platform_failed(
                "revert snapshot",
                format!(
                    "volume {} is attached to a running VM",
                    snapshot.volume_id
                ),
            ));
        }
        state.reverts.push(snapshot_id.to_string());
        Ok(())
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> CutoverResult<()> {
        self.simulate_latency().await;
        match self.state.lock().snapshots.remove(snapshot_id) {
            Some(_) => Ok(()),
            None => Err(CutoverError::not_found(format!("snapshot {}", snapshot_id))),
        }
    }
}

#[async_trait]
impl HostDeviceInventory for SimulatedPlatform {
    async fn list_block_devices(&self, host_id: &str) -> CutoverResult<Vec<BlockDevice>> {
        self.simulate_latency().await;
        if host_id != self.host_id {
            return Err(CutoverError::not_found(format!("host {}", host_id)));
        }
        let now = Instant::now();
        let state = self.state.lock();
        let mut devices = vec![BlockDevice {
            path: "/dev/vda".to_string(),
            size_bytes: 20 * 1024 * 1024 * 1024,
            serial: None,
        }];
        devices.extend(
            state
                .host_devices
                .values()
                .filter(|d| d.visible_at <= now)
                .map(|d| d.device.clone()),
        );
        devices.extend(
            state
                .lingering_devices
                .iter()
                .filter(|d| d.gone_at > now)
                .map(|d| d.device.clone()),
        );
        devices.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(devices)
    }
}

#[async_trait]
impl ComputePlatform for SimulatedPlatform {
    async fn create_vm(&self, spec: &VmSpec) -> CutoverResult<String> {
        self.simulate_latency().await;
        if self.failures().fail_vm_create {
            return Err(CutoverError::platform_failed(
                "create vm",
                "insufficient capacity in destination zone",
            ));
        }
        let mut state = self.state.lock();
        if state.vms.values().any(|vm| vm.name == spec.name) {
            return Err(CutoverError::platform_failed(
                "create vm",
                format!("a VM named '{}' already exists", spec.name),
            ));
        }
        if let Some(missing) = spec
            .network_ids
            .iter()
            .find(|id| !state.networks.iter().any(|n| &n.network_id == *id))
        {
            return Err(CutoverError::platform_failed(
                "create vm",
                format!("network {} not found", missing),
            ));
        }
        let vm_id = state.next_id("vm");
        let account = state.account();
        state.vms.insert(
            vm_id.clone(),
            VmInfo {
                vm_id: vm_id.clone(),
                name: spec.name.clone(),
                power_state: PowerState::Stopped,
                account,
            },
        );
        state.vm_specs.insert(vm_id.clone(), spec.clone());
        Ok(vm_id)
    }

    async fn delete_vm(&self, vm_id: &str) -> CutoverResult<()> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        let vm = state
            .vms
            .get(vm_id)
            .ok_or_else(|| CutoverError::not_found(format!("vm {}", vm_id)))?;
        if vm.power_state != PowerState::Stopped {
            return Err(CutoverError::platform_failed(
                "delete vm",
                format!("vm {} must be stopped first", vm_id),
            ));
        }
        if state
            .volumes
            .values()
            .any(|v| v.attached_to.as_deref() == Some(vm_id))
        {
            return Err(CutoverError::platform_failed(
                "delete vm",
                format!("vm {} still has attached volumes", vm_id),
            ));
        }
        state.vms.remove(vm_id);
        state.vm_specs.remove(vm_id);
        Ok(())
    }

    async fn power_on_vm(&self, vm_id: &str) -> CutoverResult<()> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        let vm = state
            .vms
            .get_mut(vm_id)
            .ok_or_else(|| CutoverError::not_found(format!("vm {}", vm_id)))?;
        vm.power_state = PowerState::Running;
        Ok(())
    }

    async fn power_off_vm(&self, vm_id: &str) -> CutoverResult<()> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        let vm = state
            .vms
            .get_mut(vm_id)
            .ok_or_else(|| CutoverError::not_found(format!("vm {}", vm_id)))?;
        vm.power_state = PowerState::Stopped;
        Ok(())
    }

    async fn get_vm(&self, vm_id: &str) -> CutoverResult<Option<VmInfo>> {
        self.simulate_latency().await;
        Ok(self.vm(vm_id))
    }

    async fn find_vm_by_name(&self, name: &str) -> CutoverResult<Option<VmInfo>> {
        self.simulate_latency().await;
        Ok(self.vm_by_name(name))
    }

    async fn guest_responsive(&self, vm_id: &str) -> CutoverResult<bool> {
        let unresponsive = self.failures().guest_unresponsive;
        let running = self
            .vm(vm_id)
            .map(|vm| vm.power_state == PowerState::Running)
            .unwrap_or(false);
        Ok(running && !unresponsive)
    }

    async fn list_networks(&self) -> CutoverResult<Vec<NetworkInfo>> {
        self.simulate_latency().await;
        Ok(self.state.lock().networks.clone())
    }
}

#[async_trait]
impl HypervisorControl for SimulatedPlatform {
    async fn power_off(&self, source_vm_id: &str) -> CutoverResult<()> {
        self.simulate_latency().await;
        let stuck = self.failures().stuck_power_off;
        let mut state = self.state.lock();
        let power = state
            .source_power
            .get_mut(source_vm_id)
            .ok_or_else(|| CutoverError::not_found(format!("source vm {}", source_vm_id)))?;
        *power = if stuck {
            PowerState::Stopping
        } else {
            PowerState::Stopped
        };
        Ok(())
    }

    async fn power_on(&self, source_vm_id: &str) -> CutoverResult<()> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        let power = state
            .source_power
            .get_mut(source_vm_id)
            .ok_or_else(|| CutoverError::not_found(format!("source vm {}", source_vm_id)))?;
        *power = PowerState::Running;
        Ok(())
    }

    async fn get_power_state(&self, source_vm_id: &str) -> CutoverResult<PowerState> {
        self.source_power_state(source_vm_id)
            .ok_or_else(|| CutoverError::not_found(format!("source vm {}", source_vm_id)))
    }
}

#[async_trait]
impl ReplicationTransport for SimulatedPlatform {
    async fn start_incremental_sync(
        &self,
        disk: &DiskDescriptor,
        _change_marker: Option<&str>,
    ) -> CutoverResult<SyncHandle> {
        self.simulate_latency().await;
        if self.failures().fail_sync {
            return Err(CutoverError::platform_unavailable(
                "start incremental sync",
                "replication tunnel is down",
            ));
        }
        let mut state = self.state.lock();
        let handle = state.next_id("sync");
        state.syncs.insert(
            handle.clone(),
            SimSync {
                disk_key: disk.disk_key,
                polls: 0,
            },
        );
        Ok(SyncHandle(handle))
    }

    async fn sync_status(&self, handle: &SyncHandle) -> CutoverResult<SyncStatus> {
        let mut state = self.state.lock();
        let sync = state
            .syncs
            .get_mut(&handle.0)
            .ok_or_else(|| CutoverError::not_found(format!("sync job {}", handle.0)))?;
        sync.polls += 1;
        if sync.polls < 2 {
            return Ok(SyncStatus::Running);
        }
        Ok(SyncStatus::Completed {
            change_marker: format!("52 {}/{}", sync.disk_key, handle.0),
        })
    }
}

#[async_trait]
impl DriverPreparation for SimulatedPlatform {
    async fn prepare_boot_volume(
        &self,
        volume_id: &VolumeId,
        device: &DeviceLocation,
        _guest_family: GuestFamily,
    ) -> CutoverResult<()> {
        self.simulate_latency().await;
        if self.failures().fail_driver_preparation {
            return Err(CutoverError::platform_failed(
                "driver preparation",
                format!("conversion tool exited with code 1 on {}", device),
            ));
        }
        self.state.lock().driver_runs.push(volume_id.clone());
        Ok(())
    }
}

#[async_trait]
impl CredentialProvider for SimulatedPlatform {
    async fn active_credentials(&self) -> CutoverResult<Credentials> {
        let account = self.state.lock().account();
        if account.is_empty() {
            return Err(CutoverError::CredentialsUnavailable {
                reason: "no active destination platform credentials are configured".to_string(),
            });
        }
        Ok(Credentials {
            account,
            endpoint: "sim://destination".to_string(),
        })
    }

    async fn vm_account(&self, vm_id: &str) -> CutoverResult<String> {
        self.vm(vm_id)
            .map(|vm| vm.account)
            .ok_or_else(|| CutoverError::not_found(format!("vm {}", vm_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_appliance_attach_assigns_unused_path() {
        let platform = SimulatedPlatform::new("appliance", "host");
        let first = platform.seed_appliance_volume("disk-0", 10);
        let second = platform.create_volume("disk-1", 10).await.unwrap().volume_id;
        platform.attach_volume(&second, "appliance").await.unwrap();

        let a = platform.assigned_host_path(&first).unwrap();
        let b = platform.assigned_host_path(&second).unwrap();
        assert_ne!(a, b);
        assert_ne!(b, "/dev/vda");

        let devices = platform.list_block_devices("host").await.unwrap();
        let serial = second.virtio_serial();
        assert!(devices
            .iter()
            .any(|d| d.path == b && d.serial.as_deref() == Some(serial.as_str())));
    }

    #[tokio::test]
    async fn test_delete_vm_requires_detached_volumes() {
        let platform = SimulatedPlatform::new("appliance", "host");
        let vm_id = platform
            .create_vm(&VmSpec {
                name: "dest".into(),
                cpus: 2,
                memory_mb: 2048,
                firmware: crate::types::Firmware::Bios,
                guest_family: GuestFamily::Linux,
                network_ids: vec![],
            })
            .await
            .unwrap();
        let volume = platform.create_volume("d", 1).await.unwrap().volume_id;
        platform.attach_volume(&volume, &vm_id).await.unwrap();
        assert!(platform.delete_vm(&vm_id).await.is_err());
        platform.detach_volume(&volume).await.unwrap();
        platform.delete_vm(&vm_id).await.unwrap();
        assert!(platform.vm(&vm_id).is_none());
    }

    #[tokio::test]
    async fn test_credentials_unavailable() {
        let platform = SimulatedPlatform::new("appliance", "host");
        platform.clear_active_account();
        let err = platform.active_credentials().await.unwrap_err();
        assert!(matches!(err, CutoverError::CredentialsUnavailable { .. }));
    }
}
