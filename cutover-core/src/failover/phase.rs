//! Phases and job status state machine
//!
//! Failover and rollback are two plans over one phase vocabulary. The
//! engine walks a plan in order; a disabled phase is recorded as skipped,
//! never silently dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::config::{FailoverBehavior, RollbackOptions};
use crate::types::FailoverKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    // Failover
    Validate,
    PowerOffSource,
    FinalSync,
    Snapshot,
    DriverPreparation,
    CreateVm,
    AttachVolumes,
    StartVm,
    Finalize,
    // Rollback
    ValidateRollback,
    StopDestinationVm,
    DetachVolumes,
    DeleteDestinationVm,
    RevertSnapshots,
    DeleteSnapshots,
    ReattachVolumes,
    PowerOnSource,
    FinalizeRollback,
}

pub const FAILOVER_PLAN: [Phase; 9] = [
    Phase::Validate,
    Phase::PowerOffSource,
    Phase::FinalSync,
    Phase::Snapshot,
    Phase::DriverPreparation,
    Phase::CreateVm,
    Phase::AttachVolumes,
    Phase::StartVm,
    Phase::Finalize,
];

pub const ROLLBACK_PLAN: [Phase; 9] = [
    Phase::ValidateRollback,
    Phase::StopDestinationVm,
    Phase::DetachVolumes,
    Phase::DeleteDestinationVm,
    Phase::RevertSnapshots,
    Phase::DeleteSnapshots,
    Phase::ReattachVolumes,
    Phase::PowerOnSource,
    Phase::FinalizeRollback,
];

impl Phase {
    /// Tracker step name
    pub fn step_name(&self) -> &'static str {
        match self {
            Phase::Validate => "validation",
            Phase::PowerOffSource => "source-vm-power-off",
            Phase::FinalSync => "final-sync",
            Phase::Snapshot => "multi-volume-snapshot-creation",
            Phase::DriverPreparation => "driver-preparation",
            Phase::CreateVm => "vm-creation",
            Phase::AttachVolumes => "volume-attachment",
            Phase::StartVm => "vm-startup",
            Phase::Finalize => "status-update",
            Phase::ValidateRollback => "rollback-validation",
            Phase::StopDestinationVm => "destination-vm-shutdown",
            Phase::DetachVolumes => "volume-detachment",
            Phase::DeleteDestinationVm => "destination-vm-deletion",
            Phase::RevertSnapshots => "snapshot-revert",
            Phase::DeleteSnapshots => "snapshot-cleanup",
            Phase::ReattachVolumes => "volume-reattachment-to-appliance",
            Phase::PowerOnSource => "source-vm-power-on",
            Phase::FinalizeRollback => "vm-context-status-update",
        }
    }

    /// Operator-facing name
    pub fn display_name(&self) -> &'static str {
        match self {
            Phase::Validate => "Pre-flight Validation",
            Phase::PowerOffSource => "Powering Off Source VM",
            Phase::FinalSync => "Final Data Synchronization",
            Phase::Snapshot => "Creating Backup Snapshots",
            Phase::DriverPreparation => "Preparing Drivers for Compatibility",
            Phase::CreateVm => "Creating Destination VM",
            Phase::AttachVolumes => "Attaching Storage Volumes",
            Phase::StartVm => "Starting VM",
            Phase::Finalize => "Updating VM Status",
            Phase::ValidateRollback => "Rollback Validation",
            Phase::StopDestinationVm => "Shutting Down Destination VM",
            Phase::DetachVolumes => "Detaching Storage Volumes",
            Phase::DeleteDestinationVm => "Removing Destination VM",
            Phase::RevertSnapshots => "Rolling Back to Backup",
            Phase::DeleteSnapshots => "Cleaning Up Backups",
            Phase::ReattachVolumes => "Restoring Storage Configuration",
            Phase::PowerOnSource => "Powering On Source VM",
            Phase::FinalizeRollback => "Finalizing VM State",
        }
    }

    /// Status the job reports while this phase runs
    pub fn job_status(&self) -> JobStatus {
        match self {
            Phase::Validate => JobStatus::Validating,
            Phase::PowerOffSource => JobStatus::PoweringOffSource,
            Phase::FinalSync => JobStatus::FinalSyncing,
            Phase::Snapshot => JobStatus::Snapshotting,
            Phase::DriverPreparation => JobStatus::PreparingDrivers,
            Phase::CreateVm => JobStatus::CreatingVm,
            Phase::AttachVolumes => JobStatus::AttachingVolumes,
            Phase::StartVm | Phase::Finalize => JobStatus::Starting,
            _ => JobStatus::RollingBack,
        }
    }

    /// Phases from here on may leave platform resources behind
    pub fn is_committed(&self) -> bool {
        !matches!(
            self,
            Phase::Validate | Phase::PowerOffSource | Phase::FinalSync | Phase::ValidateRollback
        )
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.step_name())
    }
}

/// Why a failover phase is disabled, or `None` when it runs
pub fn failover_skip_reason(
    phase: Phase,
    behavior: &FailoverBehavior,
    driver_preparation_needed: bool,
) -> Option<String> {
    match phase {
        Phase::Validate if behavior.skip_validation => Some("validation skipped by request".into()),
        Phase::PowerOffSource if !behavior.power_off_source => {
            Some(format!("{} failover leaves the source VM running", behavior.kind))
        }
        Phase::FinalSync if !behavior.perform_final_sync => Some("final sync not requested".into()),
        Phase::Snapshot if !behavior.snapshots_enabled() => Some("snapshot policy is none".into()),
        Phase::DriverPreparation if behavior.skip_driver_injection => {
            Some("driver injection skipped by request".into())
        }
        Phase::DriverPreparation if !driver_preparation_needed => {
            Some("source boot subsystem already compatible".into())
        }
        _ => None,
    }
}

/// Why a rollback phase is disabled, or `None` when it runs
pub fn rollback_skip_reason(
    phase: Phase,
    kind: FailoverKind,
    options: &RollbackOptions,
) -> Option<String> {
    match phase {
        Phase::RevertSnapshots if !options.revert_snapshots => {
            Some("snapshot revert not requested".into())
        }
        Phase::PowerOnSource if kind == FailoverKind::Test => {
            Some("test failover never powered off the source VM".into())
        }
        Phase::PowerOnSource if !options.power_on_source => {
            Some("source VM left in its current state".into())
        }
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Validating,
    PoweringOffSource,
    FinalSyncing,
    Snapshotting,
    PreparingDrivers,
    CreatingVm,
    AttachingVolumes,
    Starting,
    RollingBack,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    fn rank(&self) -> Option<u8> {
        match self {
            JobStatus::Pending => Some(0),
            JobStatus::Validating => Some(1),
            JobStatus::PoweringOffSource => Some(2),
            JobStatus::FinalSyncing => Some(3),
            JobStatus::Snapshotting => Some(4),
            JobStatus::PreparingDrivers => Some(5),
            JobStatus::CreatingVm => Some(6),
            JobStatus::AttachingVolumes => Some(7),
            JobStatus::Starting => Some(8),
            JobStatus::Completed => Some(9),
            JobStatus::RollingBack | JobStatus::Failed => None,
        }
    }

    /// Legal transitions: forward along the failover sequence, into
    /// `rolling-back` only from `pending`, and into `failed` from anything
    /// non-terminal. Terminal states never move.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if *self == next {
            return true;
        }
        match (self, next) {
            (_, JobStatus::Failed) => true,
            (JobStatus::Pending, JobStatus::RollingBack) => true,
            (JobStatus::RollingBack, JobStatus::Completed) => true,
            (JobStatus::RollingBack, _) | (_, JobStatus::RollingBack) => false,
            (current, next) => match (current.rank(), next.rank()) {
                (Some(a), Some(b)) => b > a,
                _ => false,
            },
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobStatus::Pending => "pending",
            JobStatus::Validating => "validating",
            JobStatus::PoweringOffSource => "powering-off-source",
            JobStatus::FinalSyncing => "final-syncing",
            JobStatus::Snapshotting => "snapshotting",
            JobStatus::PreparingDrivers => "preparing-drivers",
            JobStatus::CreatingVm => "vm-creating",
            JobStatus::AttachingVolumes => "volume-attaching",
            JobStatus::Starting => "starting",
            JobStatus::RollingBack => "rolling-back",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseOutcome {
    Completed,
    Skipped { reason: String },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: Phase,
    pub outcome: PhaseOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions_only() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Validating));
        assert!(JobStatus::Validating.can_transition_to(JobStatus::Snapshotting));
        assert!(JobStatus::Starting.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::AttachingVolumes.can_transition_to(JobStatus::CreatingVm));
        assert!(JobStatus::Snapshotting.can_transition_to(JobStatus::Snapshotting));
    }

    #[test]
    fn test_failed_reachable_from_any_non_terminal() {
        for status in [
            JobStatus::Pending,
            JobStatus::Validating,
            JobStatus::Snapshotting,
            JobStatus::AttachingVolumes,
            JobStatus::RollingBack,
        ] {
            assert!(status.can_transition_to(JobStatus::Failed), "{status}");
        }
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Completed));
    }

    #[test]
    fn test_rolling_back_only_from_pending() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::RollingBack));
        assert!(!JobStatus::Validating.can_transition_to(JobStatus::RollingBack));
        assert!(!JobStatus::Starting.can_transition_to(JobStatus::RollingBack));
        assert!(JobStatus::RollingBack.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::RollingBack.can_transition_to(JobStatus::Starting));
    }

    #[test]
    fn test_plans_map_to_expected_statuses() {
        let statuses: Vec<JobStatus> = FAILOVER_PLAN.iter().map(|p| p.job_status()).collect();
        let mut current = JobStatus::Pending;
        for status in statuses {
            assert!(current.can_transition_to(status), "{current} -> {status}");
            current = status;
        }
        assert!(ROLLBACK_PLAN
            .iter()
            .all(|p| p.job_status() == JobStatus::RollingBack));
    }

    #[test]
    fn test_commitment_boundary() {
        assert!(!Phase::FinalSync.is_committed());
        assert!(Phase::Snapshot.is_committed());
        assert!(Phase::CreateVm.is_committed());
    }
}
