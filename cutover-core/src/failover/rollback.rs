//! Rollback phases
//!
//! Each step reads platform state before acting, so running a rollback a
//! second time (or after a partial one) only does what is still left to do.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::config::RollbackOptions;
use super::engine::{FailoverOrchestrator, PhaseFailure, RunState};
use super::job::{FailoverJob, JobOperation};
use super::phase::{JobStatus, Phase, PhaseOutcome};
use super::report::FailureReport;
use crate::common::with_timeout;
use crate::error::{CutoverError, CutoverResult};
use crate::platform::PowerState;
use crate::types::{ContextId, ContextStatus, FailoverKind, JobId, VolumeId};
use crate::volume::DiskLink;

/// A volume rollback is responsible for, in disk-key order
struct RollbackVolume {
    disk_key: u32,
    volume_id: VolumeId,
    link: Option<DiskLink>,
    /// None when the volume was detached before failover
    restore_to: Option<String>,
}

impl FailoverOrchestrator {
    /// Admit a rollback and run it in the background
    pub async fn submit_rollback(
        self: &Arc<Self>,
        context_id: &ContextId,
        kind: FailoverKind,
        options: RollbackOptions,
    ) -> CutoverResult<JobId> {
        let job = self.prepare_rollback(context_id, kind, options).await?;
        let job_id = job.job_id;
        self.reserve(job_id);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.run_rollback(job).await {
                debug!(job_id = %job_id, error = %e, "Background rollback ended with error");
            }
        });
        Ok(job_id)
    }

    /// Admit a rollback and run it to completion
    pub async fn execute_rollback(
        &self,
        context_id: &ContextId,
        kind: FailoverKind,
        options: RollbackOptions,
    ) -> CutoverResult<FailoverJob> {
        let job = self.prepare_rollback(context_id, kind, options).await?;
        self.run_rollback(job).await
    }

    async fn prepare_rollback(
        &self,
        context_id: &ContextId,
        kind: FailoverKind,
        options: RollbackOptions,
    ) -> CutoverResult<FailoverJob> {
        options.validate(kind)?;
        let context = self.contexts.require_context(context_id).await?;
        self.settle_abandoned(context_id).await?;

        let target = self
            .store
            .jobs_for_context(context_id)
            .await?
            .into_iter()
            .rev()
            .find(|job| !job.is_rollback() && job.kind == kind)
            .ok_or_else(|| {
                CutoverError::validation(
                    "rollback",
                    format!("context {} has no {} failover to roll back", context_id, kind),
                )
            })?;
        if !target.is_cleanup_eligible() && !options.force_cleanup {
            return Err(CutoverError::validation(
                "cleanup_enabled",
                format!(
                    "failover job {} was run without cleanup; use force cleanup to roll it back",
                    target.job_id
                ),
            ));
        }
        if target.rolled_back_by.is_some() {
            info!(target_job = %target.job_id, "Failover already rolled back; re-running cleanup");
        }

        let job = FailoverJob::new_rollback(&context, &target, options);
        self.admit(&job, "rollback").await?;
        Ok(job)
    }

    /// Fail an active job no task in this process is driving so rollback
    /// can take over the context
    async fn settle_abandoned(&self, context_id: &ContextId) -> CutoverResult<()> {
        let Some(active_id) = self.store.active_job(context_id).await? else {
            return Ok(());
        };
        if self.is_running(active_id) {
            return Err(CutoverError::job_already_active(context_id, active_id));
        }
        let Some(mut abandoned) = self.store.get_job(active_id).await? else {
            return Ok(());
        };
        if abandoned.status.is_terminal() {
            return Ok(());
        }
        warn!(job_id = %active_id, status = %abandoned.status, "Marking interrupted job failed before rollback");
        abandoned.failure = Some(FailureReport::interrupted(
            abandoned.current_phase,
            abandoned.created_resources(),
        ));
        abandoned.transition(JobStatus::Failed)?;
        self.store
            .finish_job(&abandoned, Some(ContextStatus::CleanupRequired))
            .await
    }

    async fn run_rollback(&self, mut job: FailoverJob) -> CutoverResult<FailoverJob> {
        let _running = self.mark_running(job.job_id);
        let force = match &job.operation {
            JobOperation::Rollback { options, .. } => options.force_cleanup,
            JobOperation::Failover { .. } => false,
        };
        info!(
            job_id = %job.job_id,
            context_id = %job.context_id,
            kind = %job.kind,
            destination_vm_id = ?job.destination_vm_id,
            force,
            "Starting rollback"
        );

        let mut state = RunState::default();
        match self.contexts.disks_for_context(&job.context_id).await {
            Ok(disks) => state.disks = disks,
            Err(error) => {
                let failure = PhaseFailure {
                    phase: Phase::ValidateRollback,
                    error,
                };
                return Err(self.fail_job(job, failure, &state).await);
            }
        }

        match self.drive(&mut job, &mut state, force).await {
            Ok(()) => {
                self.end_job(job.job_id, JobStatus::Completed).await;
                info!(job_id = %job.job_id, "Rollback completed");
                Ok(job)
            }
            Err(failure) => Err(self.fail_job(job, failure, &state).await),
        }
    }

    fn rollback_volumes(&self, job: &FailoverJob, state: &RunState) -> Vec<RollbackVolume> {
        let mut volumes: Vec<RollbackVolume> = state
            .disks
            .iter()
            .filter_map(|disk| {
                let volume_id = disk.volume_id.clone()?;
                let restore_to = match job.original_owner(&volume_id) {
                    Some(record) => record.original_owner.clone(),
                    None => Some(self.appliance_vm_id.clone()),
                };
                Some(RollbackVolume {
                    disk_key: disk.disk_key,
                    link: Some(Self::disk_link(job, disk)),
                    volume_id,
                    restore_to,
                })
            })
            .collect();

        // Volumes the failover moved whose disk has since been dropped
        for record in &job.volume_owners {
            if !volumes.iter().any(|v| v.volume_id == record.volume_id) {
                volumes.push(RollbackVolume {
                    disk_key: record.disk_key,
                    volume_id: record.volume_id.clone(),
                    link: None,
                    restore_to: record.original_owner.clone(),
                });
            }
        }
        volumes.sort_by_key(|v| v.disk_key);
        volumes
    }

    pub(super) async fn validate_rollback(&self, job: &mut FailoverJob) -> CutoverResult<()> {
        self.check_credentials().await?;

        // A crash between VM creation and recording its id leaves the VM
        // findable only by name
        if job.destination_vm_id.is_none() {
            if let Some(name) = job.destination_vm_name.as_deref() {
                if let Some(vm) = self.platform.compute.find_vm_by_name(name).await? {
                    info!(vm_id = %vm.vm_id, name, "Adopted unrecorded destination VM");
                    job.destination_vm_id = Some(vm.vm_id);
                }
            }
        }
        Ok(())
    }

    pub(super) async fn stop_destination_vm(&self, job: &FailoverJob) -> CutoverResult<()> {
        let Some(destination) = job.destination_vm_id.as_deref() else {
            debug!("No destination VM recorded");
            return Ok(());
        };
        let compute = &self.platform.compute;
        match compute.get_vm(destination).await? {
            None => debug!(vm_id = destination, "Destination VM already gone"),
            Some(vm) if vm.power_state == PowerState::Stopped => {
                debug!(vm_id = destination, "Destination VM already stopped")
            }
            Some(_) => {
                with_timeout(
                    compute.power_off_vm(destination),
                    self.timeouts.power_off,
                    "power off destination VM",
                )
                .await??;
                self.wait_for_vm_power(destination, PowerState::Stopped, self.timeouts.power_off)
                    .await?;
                info!(vm_id = destination, "Destination VM stopped");
            }
        }
        Ok(())
    }

    pub(super) async fn detach_destination_volumes(
        &self,
        job: &FailoverJob,
        state: &RunState,
    ) -> CutoverResult<()> {
        let Some(destination) = job.destination_vm_id.as_deref() else {
            return Ok(());
        };
        for volume in self.rollback_volumes(job, state) {
            let attached_to_destination = self
                .authority
                .volume_info(&volume.volume_id)
                .await?
                .and_then(|info| info.attached_to)
                .is_some_and(|owner| owner == destination);
            if attached_to_destination {
                self.authority.detach_and_wait(&volume.volume_id).await?;
                info!(volume_id = %volume.volume_id, "Detached from destination VM");
            }
        }
        Ok(())
    }

    pub(super) async fn delete_destination_vm(&self, job: &FailoverJob) -> CutoverResult<()> {
        let Some(destination) = job.destination_vm_id.as_deref() else {
            return Ok(());
        };
        let compute = &self.platform.compute;
        if compute.get_vm(destination).await?.is_none() {
            debug!(vm_id = destination, "Destination VM already deleted");
            return Ok(());
        }
        with_timeout(
            compute.delete_vm(destination),
            self.timeouts.vm_create,
            "delete destination VM",
        )
        .await??;
        info!(vm_id = destination, "Destination VM deleted");
        Ok(())
    }

    pub(super) async fn revert_snapshots(&self, job: &mut FailoverJob) -> CutoverResult<()> {
        for record in job.snapshots.clone() {
            if self.snapshots.exists(&record.snapshot_id).await? {
                self.snapshots.revert(&record.snapshot_id).await?;
            } else {
                warn!(snapshot_id = %record.snapshot_id, volume_id = %record.volume_id, "Snapshot missing; volume not reverted");
                job.warnings.push(format!(
                    "Snapshot {} no longer exists; volume {} was not reverted",
                    record.snapshot_id, record.volume_id
                ));
            }
        }
        Ok(())
    }

    pub(super) async fn delete_snapshots(&self, job: &FailoverJob) -> CutoverResult<()> {
        for record in &job.snapshots {
            self.snapshots.delete(&record.snapshot_id).await?;
        }
        Ok(())
    }

    /// Return every volume to the owner it had before failover
    pub(super) async fn reattach_volumes(&self, job: &FailoverJob, state: &RunState) -> CutoverResult<()> {
        for volume in self.rollback_volumes(job, state) {
            let Some(owner) = volume.restore_to.as_deref() else {
                continue;
            };
            let current = self
                .authority
                .volume_info(&volume.volume_id)
                .await?
                .ok_or_else(|| CutoverError::not_found(format!("volume {}", volume.volume_id)))?;
            if current.attached_to.as_deref().is_some_and(|o| o != owner) {
                self.authority.detach_and_wait(&volume.volume_id).await?;
            }
            let mapping = self
                .authority
                .attach_and_wait(&volume.volume_id, owner, volume.link)
                .await?;
            info!(disk_key = volume.disk_key, volume_id = %volume.volume_id, location = %mapping.location, owner, "Volume restored");
        }
        Ok(())
    }

    pub(super) async fn power_on_source(&self, job: &FailoverJob) -> CutoverResult<()> {
        let hypervisor = &self.platform.hypervisor;
        let source = job.source_vm_id.as_str();
        if hypervisor.get_power_state(source).await? != PowerState::Running {
            with_timeout(
                hypervisor.power_on(source),
                self.timeouts.power_on,
                "power on source VM",
            )
            .await??;
        }
        self.wait_for_source_power(source, PowerState::Running, self.timeouts.power_on)
            .await?;
        info!(source_vm_id = source, "Source VM powered on");
        Ok(())
    }

    /// Link the failover job to this rollback and return the context to
    /// ready_for_failover
    pub(super) async fn finalize_rollback(&self, job: &mut FailoverJob) -> CutoverResult<()> {
        if let JobOperation::Rollback { target_job, .. } = &job.operation {
            if let Some(mut target) = self.store.get_job(*target_job).await? {
                target.rolled_back_by = Some(job.job_id);
                target.updated_at = Utc::now();
                self.store.save_job(&target).await?;
            }
        }

        let mut finished = job.clone();
        finished.record_phase(Phase::FinalizeRollback, PhaseOutcome::Completed, Utc::now());
        finished.transition(JobStatus::Completed)?;
        self.store
            .finish_job(&finished, Some(ContextStatus::ReadyForFailover))
            .await?;
        *job = finished;
        Ok(())
    }
}
