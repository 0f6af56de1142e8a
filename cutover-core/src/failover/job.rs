//! Durable failover/rollback job record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::config::{FailoverBehavior, RollbackOptions};
use super::phase::{JobStatus, Phase, PhaseOutcome, PhaseRecord, FAILOVER_PLAN, ROLLBACK_PLAN};
use super::report::FailureReport;
use crate::error::{CreatedResources, CutoverError, CutoverResult};
use crate::types::{ContextId, FailoverKind, JobId, SourceSpec, VmContext, VolumeId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobOperation {
    Failover {
        behavior: FailoverBehavior,
    },
    Rollback {
        target_job: JobId,
        options: RollbackOptions,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub disk_key: u32,
    pub volume_id: VolumeId,
    pub snapshot_id: String,
}

/// Owner a volume had before the failover moved it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeOwnerRecord {
    pub disk_key: u32,
    pub volume_id: VolumeId,
    pub original_owner: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverJob {
    pub job_id: JobId,
    pub context_id: ContextId,
    pub kind: FailoverKind,
    pub operation: JobOperation,
    pub status: JobStatus,

    /// Source VM as captured at job start
    pub source_vm_id: String,
    pub source_name: String,
    pub source_spec: SourceSpec,

    pub destination_vm_id: Option<String>,
    pub destination_vm_name: Option<String>,
    pub snapshots: Vec<SnapshotRecord>,
    pub volume_owners: Vec<VolumeOwnerRecord>,

    pub planned_phases: Vec<Phase>,
    pub phases: Vec<PhaseRecord>,
    pub current_phase: Option<Phase>,
    pub failure: Option<FailureReport>,
    pub warnings: Vec<String>,

    /// Set on a failover job once a rollback has completed for it
    pub rolled_back_by: Option<JobId>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl FailoverJob {
    pub fn new_failover(context: &VmContext, behavior: FailoverBehavior) -> Self {
        let kind = behavior.kind;
        let destination_vm_name = behavior.destination_vm_name(&context.name);
        let mut job = Self::base(context, kind, JobOperation::Failover { behavior });
        job.destination_vm_name = Some(destination_vm_name);
        job.planned_phases = FAILOVER_PLAN.to_vec();
        job
    }

    /// A rollback job inherits the resources recorded on its target
    pub fn new_rollback(context: &VmContext, target: &FailoverJob, options: RollbackOptions) -> Self {
        let mut job = Self::base(
            context,
            target.kind,
            JobOperation::Rollback {
                target_job: target.job_id,
                options,
            },
        );
        job.destination_vm_id = target.destination_vm_id.clone();
        job.destination_vm_name = target.destination_vm_name.clone();
        job.snapshots = target.snapshots.clone();
        job.volume_owners = target.volume_owners.clone();
        job.source_spec = target.source_spec.clone();
        job.planned_phases = ROLLBACK_PLAN.to_vec();
        job
    }

    fn base(context: &VmContext, kind: FailoverKind, operation: JobOperation) -> Self {
        let now = Utc::now();
        Self {
            job_id: JobId::new(),
            context_id: context.context_id.clone(),
            kind,
            operation,
            status: JobStatus::Pending,
            source_vm_id: context.source_vm_id.clone(),
            source_name: context.name.clone(),
            source_spec: context.source_spec.clone(),
            destination_vm_id: None,
            destination_vm_name: None,
            snapshots: Vec::new(),
            volume_owners: Vec::new(),
            planned_phases: Vec::new(),
            phases: Vec::new(),
            current_phase: None,
            failure: None,
            warnings: Vec::new(),
            rolled_back_by: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn is_rollback(&self) -> bool {
        matches!(self.operation, JobOperation::Rollback { .. })
    }

    pub fn behavior(&self) -> Option<&FailoverBehavior> {
        match &self.operation {
            JobOperation::Failover { behavior } => Some(behavior),
            JobOperation::Rollback { .. } => None,
        }
    }

    /// Rollback is allowed for cleanup-enabled failover jobs, or when forced
    pub fn is_cleanup_eligible(&self) -> bool {
        self.behavior().map(|b| b.cleanup_enabled).unwrap_or(false)
    }

    /// Move to `next`, rejecting anything the state machine forbids
    pub fn transition(&mut self, next: JobStatus) -> CutoverResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(CutoverError::InvalidTransition {
                job_id: self.job_id.to_string(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        if next.is_terminal() {
            self.completed_at = Some(self.updated_at);
            self.current_phase = None;
        }
        Ok(())
    }

    pub fn begin_phase(&mut self, phase: Phase) -> CutoverResult<()> {
        self.transition(phase.job_status())?;
        self.current_phase = Some(phase);
        Ok(())
    }

    pub fn record_phase(&mut self, phase: Phase, outcome: PhaseOutcome, started_at: DateTime<Utc>) {
        self.phases.push(PhaseRecord {
            phase,
            outcome,
            started_at,
            finished_at: Utc::now(),
        });
        self.updated_at = Utc::now();
    }

    /// Last phase that finished without failing
    pub fn furthest_completed_phase(&self) -> Option<Phase> {
        self.phases
            .iter()
            .rev()
            .find(|r| !matches!(r.outcome, PhaseOutcome::Failed { .. }))
            .map(|r| r.phase)
    }

    pub fn phase_outcome(&self, phase: Phase) -> Option<&PhaseOutcome> {
        self.phases
            .iter()
            .rev()
            .find(|r| r.phase == phase)
            .map(|r| &r.outcome)
    }

    /// Finished phases over planned phases, 0..=100
    pub fn percent(&self) -> u8 {
        if self.status == JobStatus::Completed {
            return 100;
        }
        if self.planned_phases.is_empty() {
            return 0;
        }
        let finished = self
            .phases
            .iter()
            .filter(|r| !matches!(r.outcome, PhaseOutcome::Failed { .. }))
            .count()
            .min(self.planned_phases.len());
        ((finished * 100) / self.planned_phases.len()) as u8
    }

    pub fn snapshot_ids(&self) -> Vec<String> {
        self.snapshots.iter().map(|s| s.snapshot_id.clone()).collect()
    }

    pub fn created_resources(&self) -> CreatedResources {
        CreatedResources {
            destination_vm_id: self.destination_vm_id.clone(),
            snapshot_ids: self.snapshot_ids(),
            moved_volumes: self
                .volume_owners
                .iter()
                .map(|o| {
                    (
                        o.volume_id.to_string(),
                        o.original_owner.clone().unwrap_or_else(|| "detached".to_string()),
                    )
                })
                .collect(),
        }
    }

    pub fn original_owner(&self, volume_id: &VolumeId) -> Option<&VolumeOwnerRecord> {
        self.volume_owners.iter().find(|o| &o.volume_id == volume_id)
    }
}
