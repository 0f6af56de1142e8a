//! Startup reconciliation
//!
//! Settles work a previous process left behind. Volume operations are
//! resolved first, then stale jobs are finalized from what the platform
//! shows: completed when the destination VM is demonstrably up with every
//! volume attached, failed with an interrupted report otherwise.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::context::ContextRegistry;
use crate::error::CutoverResult;
use crate::failover::{FailoverJob, FailoverOrchestrator, FailureReport, JobStatus, Phase, PhaseOutcome};
use crate::platform::{ComputePlatform, PowerState, VolumePlatform};
use crate::storage::Store;
use crate::types::ContextStatus;
use crate::volume::{OperationReconcileSummary, VolumeAuthority};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub operations: OperationReconcileSummary,
    pub jobs_completed: usize,
    pub jobs_failed: usize,
    /// Non-terminal jobs younger than the staleness threshold
    pub jobs_left_fresh: usize,
    pub jobs_left_running: usize,
}

pub struct Reconciler {
    store: Store,
    contexts: ContextRegistry,
    authority: Arc<VolumeAuthority>,
    orchestrator: Arc<FailoverOrchestrator>,
    compute: Arc<dyn ComputePlatform>,
    volumes: Arc<dyn VolumePlatform>,
    staleness_threshold: Duration,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("staleness_threshold", &self.staleness_threshold)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    pub fn new(
        store: Store,
        authority: Arc<VolumeAuthority>,
        orchestrator: Arc<FailoverOrchestrator>,
        compute: Arc<dyn ComputePlatform>,
        volumes: Arc<dyn VolumePlatform>,
        staleness_threshold: Duration,
    ) -> Self {
        Self {
            contexts: ContextRegistry::new(store.clone()),
            store,
            authority,
            orchestrator,
            compute,
            volumes,
            staleness_threshold,
        }
    }

    pub async fn run(&self) -> CutoverResult<ReconcileSummary> {
        self.run_at(Utc::now()).await
    }

    /// Reconcile as if the current time were `now`
    #[instrument(skip(self))]
    pub async fn run_at(&self, now: DateTime<Utc>) -> CutoverResult<ReconcileSummary> {
        let mut summary = ReconcileSummary {
            operations: self.authority.reconcile_operations().await?,
            ..Default::default()
        };

        for job in self.store.list_jobs().await? {
            if job.status.is_terminal() {
                continue;
            }
            if self.orchestrator.is_running(job.job_id) {
                summary.jobs_left_running += 1;
                continue;
            }
            let fresh = now
                .signed_duration_since(job.updated_at)
                .to_std()
                .map(|age| age < self.staleness_threshold)
                .unwrap_or(true);
            if fresh {
                debug!(job_id = %job.job_id, updated_at = %job.updated_at, "Job not yet stale");
                summary.jobs_left_fresh += 1;
                continue;
            }
            match self.finalize_stale(job).await? {
                JobStatus::Completed => summary.jobs_completed += 1,
                _ => summary.jobs_failed += 1,
            }
        }

        info!(
            operations_completed = summary.operations.completed,
            operations_failed = summary.operations.failed,
            jobs_completed = summary.jobs_completed,
            jobs_failed = summary.jobs_failed,
            jobs_left_fresh = summary.jobs_left_fresh,
            "Reconciliation finished"
        );
        Ok(summary)
    }

    async fn finalize_stale(&self, mut job: FailoverJob) -> CutoverResult<JobStatus> {
        let destination = match job.destination_vm_id.as_deref() {
            Some(vm_id) => self.compute.get_vm(vm_id).await?,
            None => match job.destination_vm_name.as_deref() {
                Some(name) => self.compute.find_vm_by_name(name).await?,
                None => None,
            },
        };
        if let Some(vm) = &destination {
            if job.destination_vm_id.is_none() {
                info!(job_id = %job.job_id, vm_id = %vm.vm_id, "Recorded destination VM found by name");
                job.destination_vm_id = Some(vm.vm_id.clone());
            }
        }

        let running = destination
            .as_ref()
            .is_some_and(|vm| vm.power_state == PowerState::Running);
        if !job.is_rollback() && running && self.proves_success(&job).await? {
            job.record_phase(Phase::Finalize, PhaseOutcome::Completed, Utc::now());
            job.transition(JobStatus::Completed)?;
            self.store
                .finish_job(&job, Some(ContextStatus::failed_over(job.kind)))
                .await?;
            info!(job_id = %job.job_id, "Stale job completed from platform state");
            return Ok(JobStatus::Completed);
        }

        let resources = job.created_resources();
        let context_status = (job.is_rollback() || !resources.is_empty())
            .then_some(ContextStatus::CleanupRequired);
        job.failure = Some(FailureReport::interrupted(job.current_phase, resources));
        job.transition(JobStatus::Failed)?;
        self.store.finish_job(&job, context_status).await?;
        warn!(job_id = %job.job_id, context_id = %job.context_id, "Stale job marked failed; rollback recommended");
        Ok(JobStatus::Failed)
    }

    /// Past the start phase with every disk's volume on the destination VM
    async fn proves_success(&self, job: &FailoverJob) -> CutoverResult<bool> {
        let started = matches!(job.phase_outcome(Phase::StartVm), Some(PhaseOutcome::Completed))
            || job.current_phase == Some(Phase::Finalize);
        let Some(destination) = job.destination_vm_id.as_deref() else {
            return Ok(false);
        };
        if !started {
            return Ok(false);
        }
        let disks = self.contexts.disks_for_context(&job.context_id).await?;
        if disks.is_empty() {
            return Ok(false);
        }
        for disk in disks {
            let Some(volume_id) = disk.volume_id else {
                return Ok(false);
            };
            let attached = self
                .volumes
                .get_volume(&volume_id)
                .await?
                .and_then(|info| info.attached_to)
                .is_some_and(|owner| owner == destination);
            if !attached {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
