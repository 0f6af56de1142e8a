//! Volume/device lifecycle authority
//!
//! The only component that creates, attaches, detaches or deletes volumes,
//! and the only writer of device mappings. Each request becomes a durable
//! [`VolumeOperation`] record that moves `pending → executing →
//! completed | failed`; callers either submit and poll, or execute and
//! block.
//!
//! Device paths are observed, never predicted. An attach to the appliance
//! takes the host lock, reads the host inventory, attaches, and then diffs
//! fresh inventory reads against that snapshot until the volume's device
//! appears or the correlation window closes. Attaches to any other VM use
//! the device slot the platform reports once the attach is confirmed.

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::common::{poll_until, with_timeout};
use crate::config::CutoverConfig;
use crate::correlation::{correlate, find_by_serial, Correlation, DeviceMappingStore};
use crate::error::{CutoverError, CutoverResult};
use crate::platform::{HostDeviceInventory, PlatformServices, VolumeInfo, VolumePlatform};
use crate::storage::{Store, VOLUME_OPERATIONS_TABLE};
use crate::types::{
    ContextId, DeviceLocation, DiskId, OperationId, OperationMode, VolumeDeviceMapping, VolumeId,
    VolumeOperation, VolumeOperationKind, VolumeOperationStatus,
};

/// Disk a volume backs; carried onto its device mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskLink {
    pub context_id: ContextId,
    pub disk_id: DiskId,
}

#[derive(Debug, Clone)]
pub enum VolumeRequest {
    Create { name: String, size_gb: u64 },
    Attach {
        volume_id: VolumeId,
        vm_id: String,
        link: Option<DiskLink>,
    },
    Detach { volume_id: VolumeId },
    Delete { volume_id: VolumeId },
}

impl VolumeRequest {
    fn to_operation(&self) -> VolumeOperation {
        match self {
            VolumeRequest::Create { name, .. } => {
                VolumeOperation::new(VolumeOperationKind::Create, VolumeId::new(name.clone()), None)
            }
            VolumeRequest::Attach {
                volume_id,
                vm_id,
                link,
            } => {
                let mut op = VolumeOperation::new(
                    VolumeOperationKind::Attach,
                    volume_id.clone(),
                    Some(vm_id.clone()),
                );
                if let Some(link) = link {
                    op.context_id = Some(link.context_id.clone());
                    op.disk_id = Some(link.disk_id);
                }
                op
            }
            VolumeRequest::Detach { volume_id } => {
                VolumeOperation::new(VolumeOperationKind::Detach, volume_id.clone(), None)
            }
            VolumeRequest::Delete { volume_id } => {
                VolumeOperation::new(VolumeOperationKind::Delete, volume_id.clone(), None)
            }
        }
    }
}

/// A volume attached to a VM together with its correlated mapping
#[derive(Debug, Clone)]
pub struct AttachedVolume {
    pub info: VolumeInfo,
    pub mapping: Option<VolumeDeviceMapping>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationReconcileSummary {
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy)]
struct AuthorityTimeouts {
    operation: Duration,
    correlation: Duration,
    operation_poll: Duration,
    correlation_poll: Duration,
}

/// Result of executing one request
struct Outcome {
    volume_id: Option<VolumeId>,
    mapping: Option<VolumeDeviceMapping>,
}

pub struct VolumeAuthority {
    store: Store,
    mappings: DeviceMappingStore,
    volumes: Arc<dyn VolumePlatform>,
    inventory: Arc<dyn HostDeviceInventory>,
    appliance_vm_id: String,
    host_id: String,
    timeouts: AuthorityTimeouts,
    volume_locks: DashMap<VolumeId, Arc<Mutex<()>>>,
    host_lock: Mutex<()>,
}

impl std::fmt::Debug for VolumeAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeAuthority")
            .field("appliance_vm_id", &self.appliance_vm_id)
            .field("host_id", &self.host_id)
            .finish_non_exhaustive()
    }
}

impl VolumeAuthority {
    pub fn new(store: Store, platform: &PlatformServices, config: &CutoverConfig) -> Self {
        Self {
            mappings: DeviceMappingStore::new(store.clone()),
            store,
            volumes: platform.volumes.clone(),
            inventory: platform.inventory.clone(),
            appliance_vm_id: config.appliance.vm_id.clone(),
            host_id: config.appliance.host_id.clone(),
            timeouts: AuthorityTimeouts {
                operation: config.timeouts.volume_operation,
                correlation: config.timeouts.device_correlation,
                operation_poll: config.polling.volume_operation_interval,
                correlation_poll: config.polling.correlation_interval,
            },
            volume_locks: DashMap::new(),
            host_lock: Mutex::new(()),
        }
    }

    pub fn appliance_vm_id(&self) -> &str {
        &self.appliance_vm_id
    }

    pub fn mappings(&self) -> &DeviceMappingStore {
        &self.mappings
    }

    pub async fn mapping(&self, volume_id: &VolumeId) -> CutoverResult<Option<VolumeDeviceMapping>> {
        self.mappings.get(volume_id).await
    }

    // Tracked primitives

    /// Record the request and run it in the background
    pub async fn submit(self: &Arc<Self>, request: VolumeRequest) -> CutoverResult<VolumeOperation> {
        let op = request.to_operation();
        self.save_operation(&op).await?;
        let authority = Arc::clone(self);
        let submitted = op.clone();
        tokio::spawn(async move {
            if let Err(e) = authority.run(op, request).await {
                debug!(error = %e, "Background volume operation failed");
            }
        });
        Ok(submitted)
    }

    /// Record the request and run it to completion
    pub async fn execute(&self, request: VolumeRequest) -> CutoverResult<VolumeOperation> {
        let op = request.to_operation();
        self.save_operation(&op).await?;
        self.run(op, request).await
    }

    pub async fn get_operation(&self, id: OperationId) -> CutoverResult<Option<VolumeOperation>> {
        self.store.get(VOLUME_OPERATIONS_TABLE, &id.to_string()).await
    }

    pub async fn list_operations(&self) -> CutoverResult<Vec<VolumeOperation>> {
        self.store.list(VOLUME_OPERATIONS_TABLE).await
    }

    /// Block until an operation is terminal or `timeout` elapses
    pub async fn wait_for_operation(
        &self,
        id: OperationId,
        timeout: Duration,
    ) -> CutoverResult<VolumeOperation> {
        poll_until(
            &format!("volume operation {}", id),
            timeout,
            self.timeouts.operation_poll,
            || async move {
                match self.get_operation(id).await? {
                    Some(op) if op.status.is_terminal() => Ok(Some(op)),
                    Some(_) => Ok(None),
                    None => Err(CutoverError::not_found(format!("volume operation {}", id))),
                }
            },
        )
        .await
    }

    // Convenience wrappers

    pub async fn create_volume(&self, name: &str, size_gb: u64) -> CutoverResult<VolumeId> {
        let op = self
            .execute(VolumeRequest::Create {
                name: name.to_string(),
                size_gb,
            })
            .await?;
        Ok(op.volume_id)
    }

    pub async fn attach_and_wait(
        &self,
        volume_id: &VolumeId,
        vm_id: &str,
        link: Option<DiskLink>,
    ) -> CutoverResult<VolumeDeviceMapping> {
        let op = self
            .execute(VolumeRequest::Attach {
                volume_id: volume_id.clone(),
                vm_id: vm_id.to_string(),
                link,
            })
            .await?;
        op.mapping.ok_or_else(|| {
            CutoverError::internal(format!("attach of {} completed without a mapping", volume_id))
        })
    }

    pub async fn detach_and_wait(&self, volume_id: &VolumeId) -> CutoverResult<()> {
        self.execute(VolumeRequest::Detach {
            volume_id: volume_id.clone(),
        })
        .await
        .map(|_| ())
    }

    pub async fn delete_volume(&self, volume_id: &VolumeId) -> CutoverResult<()> {
        self.execute(VolumeRequest::Delete {
            volume_id: volume_id.clone(),
        })
        .await
        .map(|_| ())
    }

    /// Volumes currently attached to a VM with their mappings
    pub async fn list(&self, owner_vm_id: &str) -> CutoverResult<Vec<AttachedVolume>> {
        let infos = with_timeout(
            self.volumes.list_volumes_for_vm(owner_vm_id),
            self.timeouts.operation,
            "list volumes",
        )
        .await??;
        let mut attached = Vec::with_capacity(infos.len());
        for info in infos {
            let mapping = self
                .mappings
                .get(&info.volume_id)
                .await?
                .filter(|m| m.owner_vm_id == owner_vm_id);
            attached.push(AttachedVolume { info, mapping });
        }
        Ok(attached)
    }

    /// Current platform view of a volume
    pub async fn volume_info(&self, volume_id: &VolumeId) -> CutoverResult<Option<VolumeInfo>> {
        with_timeout(
            self.volumes.get_volume(volume_id),
            self.timeouts.operation,
            "get volume",
        )
        .await?
    }

    // Execution

    async fn save_operation(&self, op: &VolumeOperation) -> CutoverResult<()> {
        self.store
            .put(VOLUME_OPERATIONS_TABLE, &op.id.to_string(), op)
            .await
    }

    fn lock_for(&self, volume_id: &VolumeId) -> Arc<Mutex<()>> {
        self.volume_locks
            .entry(volume_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    #[instrument(skip(self, op, request), fields(operation_id = %op.id, kind = %op.kind, volume_id = %op.volume_id))]
    async fn run(&self, mut op: VolumeOperation, request: VolumeRequest) -> CutoverResult<VolumeOperation> {
        op.status = VolumeOperationStatus::Executing;
        op.updated_at = Utc::now();
        self.save_operation(&op).await?;

        let result = match &request {
            VolumeRequest::Create { name, size_gb } => self.do_create(name, *size_gb).await,
            VolumeRequest::Attach {
                volume_id,
                vm_id,
                link,
            } => {
                let lock = self.lock_for(volume_id);
                let _guard = lock.lock().await;
                self.do_attach(volume_id, vm_id, link.clone()).await
            }
            VolumeRequest::Detach { volume_id } => {
                let lock = self.lock_for(volume_id);
                let _guard = lock.lock().await;
                self.do_detach(volume_id).await
            }
            VolumeRequest::Delete { volume_id } => {
                let lock = self.lock_for(volume_id);
                let _guard = lock.lock().await;
                self.do_delete(volume_id).await
            }
        };

        let now = Utc::now();
        op.updated_at = now;
        op.completed_at = Some(now);
        match result {
            Ok(outcome) => {
                if let Some(volume_id) = outcome.volume_id {
                    op.volume_id = volume_id;
                }
                op.mapping = outcome.mapping;
                op.status = VolumeOperationStatus::Completed;
                self.save_operation(&op).await?;
                debug!("Volume operation completed");
                Ok(op)
            }
            Err(e) => {
                op.status = VolumeOperationStatus::Failed;
                op.error = Some(e.to_string());
                self.save_operation(&op).await?;
                warn!(error = %e, "Volume operation failed");
                Err(e)
            }
        }
    }

    async fn require_volume(&self, volume_id: &VolumeId) -> CutoverResult<VolumeInfo> {
        self.volume_info(volume_id)
            .await?
            .ok_or_else(|| CutoverError::not_found(format!("volume {}", volume_id)))
    }

    async fn do_create(&self, name: &str, size_gb: u64) -> CutoverResult<Outcome> {
        let info = with_timeout(
            self.volumes.create_volume(name, size_gb),
            self.timeouts.operation,
            "create volume",
        )
        .await??;
        info!(volume_id = %info.volume_id, name, size_gb, "Created volume");
        Ok(Outcome {
            volume_id: Some(info.volume_id),
            mapping: None,
        })
    }

    async fn do_attach(
        &self,
        volume_id: &VolumeId,
        vm_id: &str,
        link: Option<DiskLink>,
    ) -> CutoverResult<Outcome> {
        let info = self.require_volume(volume_id).await?;

        match info.attached_to.as_deref() {
            Some(owner) if owner == vm_id => {
                let mapping = self.current_attachment(&info, vm_id, link).await?;
                debug!(owner = vm_id, "Volume already attached to requested owner");
                return Ok(Outcome {
                    volume_id: None,
                    mapping: Some(mapping),
                });
            }
            Some(owner) => {
                return Err(CutoverError::VolumeBusy {
                    volume_id: volume_id.to_string(),
                    reason: format!("attached to {}; detach it first", owner),
                });
            }
            None => {}
        }

        let location = if vm_id == self.appliance_vm_id {
            self.attach_to_host(volume_id, vm_id).await?
        } else {
            self.attach_to_guest(volume_id, vm_id).await?
        };

        let mapping = self.write_mapping(volume_id, vm_id, location, link).await?;
        info!(owner = vm_id, location = %mapping.location, mode = ?mapping.mode, "Volume attached");
        Ok(Outcome {
            volume_id: None,
            mapping: Some(mapping),
        })
    }

    /// Attach to the appliance and find the device by inventory diff.
    ///
    /// The host lock is held from the baseline read through the diff so a
    /// concurrent attach of another volume cannot be mistaken for ours.
    async fn attach_to_host(&self, volume_id: &VolumeId, vm_id: &str) -> CutoverResult<DeviceLocation> {
        let _host = self.host_lock.lock().await;
        let before = with_timeout(
            self.inventory.list_block_devices(&self.host_id),
            self.timeouts.operation,
            "list host devices",
        )
        .await??;

        with_timeout(
            self.volumes.attach_volume(volume_id, vm_id),
            self.timeouts.operation,
            "attach volume",
        )
        .await??;

        let inventory = &self.inventory;
        let host_id = self.host_id.as_str();
        let before = &before;
        let device = poll_until(
            &format!("device correlation for volume {}", volume_id),
            self.timeouts.correlation,
            self.timeouts.correlation_poll,
            || async move {
                let after = inventory.list_block_devices(host_id).await?;
                match correlate(before, &after, volume_id) {
                    Correlation::Found(device) => Ok(Some(device)),
                    Correlation::Ambiguous(count) => {
                        debug!(count, "New devices present but none match the volume yet");
                        Ok(None)
                    }
                    Correlation::NoNewDevice => Ok(None),
                }
            },
        )
        .await
        .map_err(|e| {
            warn!(error = %e, "Device never appeared; volume stays attached until explicitly detached");
            e
        })?;

        Ok(DeviceLocation::Host { path: device.path })
    }

    /// Attach to a guest VM and wait for the platform to confirm the slot
    async fn attach_to_guest(&self, volume_id: &VolumeId, vm_id: &str) -> CutoverResult<DeviceLocation> {
        with_timeout(
            self.volumes.attach_volume(volume_id, vm_id),
            self.timeouts.operation,
            "attach volume",
        )
        .await??;

        let volumes = &self.volumes;
        let device_id = poll_until(
            &format!("attach confirmation for volume {}", volume_id),
            self.timeouts.correlation,
            self.timeouts.operation_poll,
            || async move {
                let info = volumes
                    .get_volume(volume_id)
                    .await?
                    .ok_or_else(|| CutoverError::not_found(format!("volume {}", volume_id)))?;
                Ok(match (info.attached_to.as_deref(), info.device_slot) {
                    (Some(owner), Some(slot)) if owner == vm_id => Some(slot),
                    _ => None,
                })
            },
        )
        .await?;

        Ok(DeviceLocation::Guest { device_id })
    }

    /// Mapping for a volume already attached to `vm_id`, re-observed when
    /// no matching mapping is on record
    async fn current_attachment(
        &self,
        info: &VolumeInfo,
        vm_id: &str,
        link: Option<DiskLink>,
    ) -> CutoverResult<VolumeDeviceMapping> {
        if let Some(existing) = self.mappings.get(&info.volume_id).await? {
            if existing.owner_vm_id == vm_id {
                return Ok(existing);
            }
        }
        let location = self.observe_location(info, vm_id).await?.ok_or_else(|| {
            CutoverError::platform_failed(
                "device correlation",
                format!(
                    "volume {} is attached to {} but its device cannot be identified; detach and retry",
                    info.volume_id, vm_id
                ),
            )
        })?;
        self.write_mapping(&info.volume_id, vm_id, location, link).await
    }

    /// Where an attached volume is right now, without attaching anything
    async fn observe_location(&self, info: &VolumeInfo, vm_id: &str) -> CutoverResult<Option<DeviceLocation>> {
        if vm_id == self.appliance_vm_id {
            let devices = with_timeout(
                self.inventory.list_block_devices(&self.host_id),
                self.timeouts.operation,
                "list host devices",
            )
            .await??;
            Ok(find_by_serial(&devices, &info.volume_id).map(|d| DeviceLocation::Host {
                path: d.path.clone(),
            }))
        } else {
            Ok(info
                .device_slot
                .map(|device_id| DeviceLocation::Guest { device_id }))
        }
    }

    async fn write_mapping(
        &self,
        volume_id: &VolumeId,
        vm_id: &str,
        location: DeviceLocation,
        link: Option<DiskLink>,
    ) -> CutoverResult<VolumeDeviceMapping> {
        let mode = if vm_id == self.appliance_vm_id {
            OperationMode::Appliance
        } else {
            OperationMode::Failover
        };
        let mapping = VolumeDeviceMapping {
            volume_id: volume_id.clone(),
            context_id: link.as_ref().map(|l| l.context_id.clone()),
            disk_id: link.map(|l| l.disk_id),
            owner_vm_id: vm_id.to_string(),
            location,
            mode,
            logical_name: volume_id.export_name(),
            correlated_at: Utc::now(),
        };
        self.mappings.upsert(&mapping).await?;
        Ok(mapping)
    }

    async fn do_detach(&self, volume_id: &VolumeId) -> CutoverResult<Outcome> {
        let info = self.require_volume(volume_id).await?;
        let Some(owner) = info.attached_to.clone() else {
            self.mappings.remove(volume_id).await?;
            debug!("Volume already detached");
            return Ok(Outcome {
                volume_id: None,
                mapping: None,
            });
        };
        let previous = self.mappings.get(volume_id).await?;

        with_timeout(
            self.volumes.detach_volume(volume_id),
            self.timeouts.operation,
            "detach volume",
        )
        .await??;

        let volumes = &self.volumes;
        poll_until(
            &format!("detach confirmation for volume {}", volume_id),
            self.timeouts.operation,
            self.timeouts.operation_poll,
            || async move {
                let info = volumes.get_volume(volume_id).await?;
                Ok(info.filter(|i| i.attached_to.is_none()).map(|_| ()))
            },
        )
        .await?;

        if owner == self.appliance_vm_id {
            if let Some(DeviceLocation::Host { path }) = previous.map(|m| m.location) {
                self.wait_for_device_removal(&path).await;
            }
        }

        self.mappings.remove(volume_id).await?;
        info!(previous_owner = %owner, "Volume detached");
        Ok(Outcome {
            volume_id: None,
            mapping: None,
        })
    }

    /// Best effort: a lingering host device only delays path reuse
    async fn wait_for_device_removal(&self, path: &str) {
        let inventory = &self.inventory;
        let host_id = self.host_id.as_str();
        let result = poll_until(
            "host device removal",
            self.timeouts.correlation,
            self.timeouts.correlation_poll,
            || async move {
                let devices = inventory.list_block_devices(host_id).await?;
                Ok((!devices.iter().any(|d| d.path == path)).then_some(()))
            },
        )
        .await;
        if let Err(e) = result {
            warn!(path, error = %e, "Host device still present after detach");
        }
    }

    async fn do_delete(&self, volume_id: &VolumeId) -> CutoverResult<Outcome> {
        let Some(info) = self.volume_info(volume_id).await? else {
            self.mappings.remove(volume_id).await?;
            debug!("Volume already deleted");
            return Ok(Outcome {
                volume_id: None,
                mapping: None,
            });
        };
        if let Some(owner) = info.attached_to {
            return Err(CutoverError::VolumeBusy {
                volume_id: volume_id.to_string(),
                reason: format!("still attached to {}", owner),
            });
        }
        with_timeout(
            self.volumes.delete_volume(volume_id),
            self.timeouts.operation,
            "delete volume",
        )
        .await??;
        self.mappings.remove(volume_id).await?;
        info!("Volume deleted");
        Ok(Outcome {
            volume_id: None,
            mapping: None,
        })
    }

    // Recovery

    /// Settle operations left non-terminal by a previous process.
    ///
    /// Each one is completed or failed from what the platform shows now.
    pub async fn reconcile_operations(&self) -> CutoverResult<OperationReconcileSummary> {
        let mut summary = OperationReconcileSummary::default();
        for mut op in self.list_operations().await? {
            if op.status.is_terminal() {
                continue;
            }
            let resolution = self.resolve_interrupted(&op).await;
            let now = Utc::now();
            op.updated_at = now;
            op.completed_at = Some(now);
            match resolution {
                Ok(mapping) => {
                    op.status = VolumeOperationStatus::Completed;
                    op.mapping = mapping;
                    summary.completed += 1;
                }
                Err(e) => {
                    op.status = VolumeOperationStatus::Failed;
                    op.error = Some(e.to_string());
                    summary.failed += 1;
                }
            }
            info!(operation_id = %op.id, kind = %op.kind, status = ?op.status, "Reconciled interrupted volume operation");
            self.save_operation(&op).await?;
        }
        Ok(summary)
    }

    async fn resolve_interrupted(&self, op: &VolumeOperation) -> CutoverResult<Option<VolumeDeviceMapping>> {
        let interrupted = |what: &str| {
            CutoverError::platform_failed(
                format!("{} volume", op.kind),
                format!("interrupted by restart; {}", what),
            )
        };
        match op.kind {
            VolumeOperationKind::Create => Err(interrupted(
                "any volume it created must be located and cleaned up manually",
            )),
            VolumeOperationKind::Attach => {
                let target = op.target_vm_id.as_deref().unwrap_or_default();
                let info = self.volume_info(&op.volume_id).await?;
                match info {
                    Some(info) if info.attached_to.as_deref() == Some(target) => {
                        match self.observe_location(&info, target).await? {
                            Some(location) => {
                                let link = match (&op.context_id, op.disk_id) {
                                    (Some(context_id), Some(disk_id)) => Some(DiskLink {
                                        context_id: context_id.clone(),
                                        disk_id,
                                    }),
                                    _ => None,
                                };
                                Ok(Some(self.write_mapping(&op.volume_id, target, location, link).await?))
                            }
                            None => Err(interrupted(
                                "volume is attached but its device could not be identified; cleanup required",
                            )),
                        }
                    }
                    Some(_) => Err(interrupted("attach did not take effect")),
                    None => Err(CutoverError::not_found(format!("volume {}", op.volume_id))),
                }
            }
            VolumeOperationKind::Detach => match self.volume_info(&op.volume_id).await? {
                Some(info) if info.attached_to.is_none() => {
                    self.mappings.remove(&op.volume_id).await?;
                    Ok(None)
                }
                Some(_) => Err(interrupted("volume is still attached")),
                None => Err(CutoverError::not_found(format!("volume {}", op.volume_id))),
            },
            VolumeOperationKind::Delete => match self.volume_info(&op.volume_id).await? {
                None => {
                    self.mappings.remove(&op.volume_id).await?;
                    Ok(None)
                }
                Some(_) => Err(interrupted("volume still exists")),
            },
        }
    }
}
