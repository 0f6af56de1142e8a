use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::CutoverError;

/// Stable identifier of a VM replication context
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextId(pub String);

impl ContextId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier shared by a failover/rollback job and its tracker entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = CutoverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(JobId)
            .map_err(|e| CutoverError::validation("job_id", e.to_string()))
    }
}

/// Platform-stable volume identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VolumeId(pub String);

impl VolumeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Logical export / persistent device name for this volume.
    ///
    /// Derived from the volume id alone so two volumes owned by the same VM
    /// can never collide.
    pub fn export_name(&self) -> String {
        format!("vol-{}", self.0)
    }

    /// Serial a virtio block device reports for this volume: the volume id
    /// without hyphens, truncated to 20 characters.
    pub fn virtio_serial(&self) -> String {
        self.0.chars().filter(|c| *c != '-').take(20).collect()
    }
}

impl std::fmt::Display for VolumeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Internal disk descriptor id; assigned once and never regenerated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DiskId(pub Uuid);

impl DiskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DiskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DiskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a tracked volume operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(pub Uuid);

impl OperationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverKind {
    Live,
    Test,
}

impl FailoverKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailoverKind::Live => "live",
            FailoverKind::Test => "test",
        }
    }
}

impl std::fmt::Display for FailoverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailoverKind {
    type Err = CutoverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "live" => Ok(FailoverKind::Live),
            "test" => Ok(FailoverKind::Test),
            other => Err(CutoverError::validation(
                "failover_kind",
                format!("unknown failover kind '{}', expected 'live' or 'test'", other),
            )),
        }
    }
}

/// Lifecycle status of a VM replication context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextStatus {
    Discovered,
    Replicating,
    ReadyForFailover,
    FailedOverTest,
    FailedOverLive,
    CleanupRequired,
}

impl ContextStatus {
    pub fn failed_over(kind: FailoverKind) -> Self {
        match kind {
            FailoverKind::Live => ContextStatus::FailedOverLive,
            FailoverKind::Test => ContextStatus::FailedOverTest,
        }
    }
}

impl std::fmt::Display for ContextStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ContextStatus::Discovered => "discovered",
            ContextStatus::Replicating => "replicating",
            ContextStatus::ReadyForFailover => "ready_for_failover",
            ContextStatus::FailedOverTest => "failed_over_test",
            ContextStatus::FailedOverLive => "failed_over_live",
            ContextStatus::CleanupRequired => "cleanup_required",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuestFamily {
    Linux,
    Windows,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Firmware {
    Bios,
    Uefi,
}

/// Disk controller the source VM boots from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskBus {
    Virtio,
    Scsi,
    Sata,
    Ide,
}

/// Source VM hardware as seen by the hypervisor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub cpus: u32,
    pub memory_mb: u32,
    pub guest_family: GuestFamily,
    pub firmware: Firmware,
    pub disk_bus: DiskBus,
    /// Source network names, in NIC order
    pub networks: Vec<String>,
}

impl SourceSpec {
    /// The destination only offers virtio; a Windows guest booting from any
    /// other controller needs drivers injected before it can boot.
    pub fn boot_subsystem_mismatch(&self) -> bool {
        self.guest_family == GuestFamily::Windows && self.disk_bus != DiskBus::Virtio
    }
}

impl Default for SourceSpec {
    fn default() -> Self {
        Self {
            cpus: 2,
            memory_mb: 2048,
            guest_family: GuestFamily::Linux,
            firmware: Firmware::Bios,
            disk_bus: DiskBus::Virtio,
            networks: Vec::new(),
        }
    }
}

/// Aggregate root for one managed source VM
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmContext {
    pub context_id: ContextId,
    pub source_vm_id: String,
    pub name: String,
    pub status: ContextStatus,
    pub source_spec: SourceSpec,
    pub last_job_id: Option<JobId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One replicated source disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskDescriptor {
    pub disk_id: DiskId,
    pub context_id: ContextId,
    /// Hypervisor-assigned key (2000, 2001, ...)
    pub disk_key: u32,
    pub size_gb: u64,
    pub change_marker: Option<String>,
    pub volume_id: Option<VolumeId>,
    pub updated_at: DateTime<Utc>,
}

/// Mutable fields replication reports for a disk
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskUpdate {
    pub disk_key: u32,
    pub size_gb: u64,
    pub change_marker: Option<String>,
    pub volume_id: Option<VolumeId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationMode {
    /// Attached to the source-facing appliance for replication
    Appliance,
    /// Attached to a destination VM after failover
    Failover,
}

/// Where an attached volume was observed
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceLocation {
    /// Block device on the appliance host, found by inventory diff
    Host { path: String },
    /// Device slot reported by the platform for a guest VM
    Guest { device_id: u32 },
}

impl std::fmt::Display for DeviceLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceLocation::Host { path } => f.write_str(path),
            DeviceLocation::Guest { device_id } => write!(f, "guest-slot-{}", device_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeDeviceMapping {
    pub volume_id: VolumeId,
    pub context_id: Option<ContextId>,
    pub disk_id: Option<DiskId>,
    pub owner_vm_id: String,
    pub location: DeviceLocation,
    pub mode: OperationMode,
    pub logical_name: String,
    pub correlated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeOperationKind {
    Create,
    Attach,
    Detach,
    Delete,
}

impl std::fmt::Display for VolumeOperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            VolumeOperationKind::Create => "create",
            VolumeOperationKind::Attach => "attach",
            VolumeOperationKind::Detach => "detach",
            VolumeOperationKind::Delete => "delete",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeOperationStatus {
    Pending,
    Executing,
    Completed,
    Failed,
}

impl VolumeOperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            VolumeOperationStatus::Completed | VolumeOperationStatus::Failed
        )
    }
}

/// Durable record of one volume lifecycle operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeOperation {
    pub id: OperationId,
    pub kind: VolumeOperationKind,
    pub status: VolumeOperationStatus,
    pub volume_id: VolumeId,
    pub target_vm_id: Option<String>,
    /// Disk the volume backs, carried onto the mapping an attach produces
    pub context_id: Option<ContextId>,
    pub disk_id: Option<DiskId>,
    pub mapping: Option<VolumeDeviceMapping>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl VolumeOperation {
    pub fn new(kind: VolumeOperationKind, volume_id: VolumeId, target_vm_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: OperationId::new(),
            kind,
            status: VolumeOperationStatus::Pending,
            volume_id,
            target_vm_id,
            context_id: None,
            disk_id: None,
            mapping: None,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// Source network → destination network for one context and failover kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkMapping {
    pub context_id: ContextId,
    pub kind: FailoverKind,
    pub source_network: String,
    pub destination_network_id: String,
    pub updated_at: DateTime<Utc>,
}

impl NetworkMapping {
    pub fn storage_key(context_id: &ContextId, kind: FailoverKind, source_network: &str) -> String {
        format!("{}/{}/{}", context_id, kind, source_network)
    }

    pub fn key(&self) -> String {
        Self::storage_key(&self.context_id, self.kind, &self.source_network)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failover_kind_rejects_unknown_values() {
        assert_eq!("live".parse::<FailoverKind>().unwrap(), FailoverKind::Live);
        assert_eq!("test".parse::<FailoverKind>().unwrap(), FailoverKind::Test);
        let err = "LIVE".parse::<FailoverKind>().unwrap_err();
        assert!(matches!(err, CutoverError::Validation { .. }));
    }

    #[test]
    fn test_export_name_derives_from_volume_id() {
        let a = VolumeId::new("b3bb9310-1b59-4f62-97e8-cefffdfe3804");
        let b = VolumeId::new("c1d2e3f4-1b59-4f62-97e8-cefffdfe3804");
        assert_eq!(a.export_name(), "vol-b3bb9310-1b59-4f62-97e8-cefffdfe3804");
        assert_ne!(a.export_name(), b.export_name());
    }

    #[test]
    fn test_virtio_serial_truncation() {
        let volume = VolumeId::new("b3bb9310-1b59-4f62-97e8-cefffdfe3804");
        assert_eq!(volume.virtio_serial(), "b3bb93101b594f6297e8");
        assert_eq!(VolumeId::new("short").virtio_serial(), "short");
    }

    #[test]
    fn test_boot_subsystem_mismatch() {
        let mut spec = SourceSpec::default();
        assert!(!spec.boot_subsystem_mismatch());
        spec.guest_family = GuestFamily::Windows;
        spec.disk_bus = DiskBus::Scsi;
        assert!(spec.boot_subsystem_mismatch());
        spec.disk_bus = DiskBus::Virtio;
        assert!(!spec.boot_subsystem_mismatch());
    }
}
