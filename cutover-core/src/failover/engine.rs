//! Unified failover engine
//!
//! Live failover, test failover and rollback are plans over one phase
//! driver. A job is admitted durably, then each planned phase runs as a
//! tracked step: disabled phases are recorded as skipped, the job record
//! is saved at every phase boundary, and a failure stops the plan (or, for
//! a forced rollback, is recorded and stepped over).

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn, Instrument};

use super::config::{resolve_behavior, ConfigOverrides, FailoverRequest};
use super::job::{FailoverJob, JobOperation, SnapshotRecord, VolumeOwnerRecord};
use super::phase::{
    failover_skip_reason, rollback_skip_reason, JobStatus, Phase, PhaseOutcome,
};
use super::report::FailureReport;
use crate::common::{poll_until, with_timeout};
use crate::config::{CutoverConfig, PollingConfig, TimeoutConfig};
use crate::context::ContextRegistry;
use crate::error::{CreatedResources, CutoverError, CutoverResult, ErrorCategory};
use crate::network::{NetworkConfigOption, NetworkResolver, ResolvedNetworks};
use crate::platform::{Credentials, PlatformServices, PowerState, SyncStatus, VmSpec};
use crate::snapshot::SnapshotManager;
use crate::storage::Store;
use crate::tracker::{step_span, JobMeta, JobTracker, StepStatus};
use crate::types::{
    ContextId, ContextStatus, DiskDescriptor, FailoverKind, JobId, VolumeDeviceMapping, VolumeId,
};
use crate::volume::{DiskLink, VolumeAuthority};

/// Per-run working state that is derived, not persisted
#[derive(Debug, Default)]
pub(super) struct RunState {
    pub(super) disks: Vec<DiskDescriptor>,
    pub(super) networks: Option<ResolvedNetworks>,
    pub(super) driver_preparation_needed: bool,
    pub(super) source_powered_off: bool,
}

pub(super) struct PhaseFailure {
    pub(super) phase: Phase,
    pub(super) error: CutoverError,
}

/// Snapshot of a job for status queries
#[derive(Debug, Clone, Serialize)]
pub struct JobStatusView {
    pub job_id: JobId,
    pub context_id: ContextId,
    pub kind: FailoverKind,
    pub is_rollback: bool,
    pub status: JobStatus,
    /// Phase running now, or the furthest one reached
    pub phase: Option<Phase>,
    pub percent: u8,
    pub destination_vm_id: Option<String>,
    pub snapshot_ids: Vec<String>,
    pub warnings: Vec<String>,
    pub error: Option<FailureReport>,
}

/// Removes a job from the in-process running set when dropped
pub(super) struct RunningGuard<'a> {
    running: &'a DashMap<JobId, ()>,
    job_id: JobId,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.running.remove(&self.job_id);
    }
}

pub struct FailoverOrchestrator {
    pub(super) store: Store,
    pub(super) contexts: ContextRegistry,
    pub(super) authority: Arc<VolumeAuthority>,
    pub(super) snapshots: SnapshotManager,
    pub(super) networks: NetworkResolver,
    pub(super) tracker: Arc<dyn JobTracker>,
    pub(super) platform: PlatformServices,
    pub(super) timeouts: TimeoutConfig,
    pub(super) polling: PollingConfig,
    pub(super) appliance_vm_id: String,
    running: DashMap<JobId, ()>,
}

impl std::fmt::Debug for FailoverOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailoverOrchestrator")
            .field("appliance_vm_id", &self.appliance_vm_id)
            .field("running_jobs", &self.running.len())
            .finish_non_exhaustive()
    }
}

impl FailoverOrchestrator {
    pub fn new(
        store: Store,
        platform: PlatformServices,
        authority: Arc<VolumeAuthority>,
        tracker: Arc<dyn JobTracker>,
        config: &CutoverConfig,
    ) -> Self {
        Self {
            contexts: ContextRegistry::new(store.clone()),
            snapshots: SnapshotManager::new(platform.snapshots.clone(), config),
            networks: NetworkResolver::new(store.clone(), platform.compute.clone()),
            store,
            authority,
            tracker,
            platform,
            timeouts: config.timeouts.clone(),
            polling: config.polling.clone(),
            appliance_vm_id: config.appliance.vm_id.clone(),
            running: DashMap::new(),
        }
    }

    // Produced interface

    /// Admit a failover and run it in the background
    pub async fn submit_failover(
        self: &Arc<Self>,
        request: FailoverRequest,
        overrides: ConfigOverrides,
    ) -> CutoverResult<JobId> {
        let job = self.prepare_failover(request, overrides).await?;
        let job_id = job.job_id;
        self.reserve(job_id);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.run_failover(job).await {
                debug!(job_id = %job_id, error = %e, "Background failover ended with error");
            }
        });
        Ok(job_id)
    }

    /// Admit a failover and run it to completion
    pub async fn execute_failover(
        &self,
        request: FailoverRequest,
        overrides: ConfigOverrides,
    ) -> CutoverResult<FailoverJob> {
        let job = self.prepare_failover(request, overrides).await?;
        self.run_failover(job).await
    }

    pub async fn get_job(&self, job_id: JobId) -> CutoverResult<Option<FailoverJob>> {
        self.store.get_job(job_id).await
    }

    pub async fn jobs_for_context(&self, context_id: &ContextId) -> CutoverResult<Vec<FailoverJob>> {
        self.store.jobs_for_context(context_id).await
    }

    pub async fn get_job_status(&self, job_id: JobId) -> CutoverResult<JobStatusView> {
        let job = self
            .get_job(job_id)
            .await?
            .ok_or_else(|| CutoverError::not_found(format!("job {}", job_id)))?;
        Ok(JobStatusView {
            job_id: job.job_id,
            context_id: job.context_id.clone(),
            kind: job.kind,
            is_rollback: job.is_rollback(),
            status: job.status,
            phase: job.current_phase.or_else(|| {
                job.failure
                    .as_ref()
                    .map(|f| f.phase)
                    .or_else(|| job.furthest_completed_phase())
            }),
            percent: job.percent(),
            destination_vm_id: job.destination_vm_id.clone(),
            snapshot_ids: job.snapshot_ids(),
            warnings: job.warnings.clone(),
            error: job.failure.clone(),
        })
    }

    pub async fn get_network_config_options(
        &self,
        context_id: &ContextId,
        kind: FailoverKind,
    ) -> CutoverResult<Vec<NetworkConfigOption>> {
        self.networks.get_network_config_options(context_id, kind).await
    }

    /// Whether a job is executing in this process
    pub fn is_running(&self, job_id: JobId) -> bool {
        self.running.contains_key(&job_id)
    }

    // Admission and driving

    async fn prepare_failover(
        &self,
        request: FailoverRequest,
        overrides: ConfigOverrides,
    ) -> CutoverResult<FailoverJob> {
        let behavior = resolve_behavior(&request, overrides, Utc::now())?;
        let context = self.contexts.require_context(&request.context_id).await?;
        let job = FailoverJob::new_failover(&context, behavior);
        self.admit(&job, "failover").await?;
        Ok(job)
    }

    pub(super) async fn admit(&self, job: &FailoverJob, operation: &'static str) -> CutoverResult<()> {
        self.store.admit_job(job).await?;
        self.tracker
            .start_job(&JobMeta {
                job_id: job.job_id,
                context_id: job.context_id.clone(),
                kind: job.kind,
                operation,
            })
            .await
    }

    /// Claim a job for this process before its task is spawned
    pub(super) fn reserve(&self, job_id: JobId) {
        self.running.insert(job_id, ());
    }

    pub(super) fn mark_running(&self, job_id: JobId) -> RunningGuard<'_> {
        self.running.insert(job_id, ());
        RunningGuard {
            running: &self.running,
            job_id,
        }
    }

    async fn run_failover(&self, mut job: FailoverJob) -> CutoverResult<FailoverJob> {
        let _running = self.mark_running(job.job_id);
        info!(
            job_id = %job.job_id,
            context_id = %job.context_id,
            kind = %job.kind,
            destination = job.destination_vm_name.as_deref().unwrap_or_default(),
            "Starting failover"
        );

        let mut state = RunState::default();
        if let Err(error) = self.preflight(&job, &mut state).await {
            let failure = PhaseFailure {
                phase: Phase::Validate,
                error,
            };
            return Err(self.fail_job(job, failure, &state).await);
        }

        match self.drive(&mut job, &mut state, false).await {
            Ok(()) => {
                self.end_job(job.job_id, JobStatus::Completed).await;
                info!(job_id = %job.job_id, destination_vm_id = ?job.destination_vm_id, "Failover completed");
                Ok(job)
            }
            Err(failure) => Err(self.fail_job(job, failure, &state).await),
        }
    }

    /// Walk the job's plan
    pub(super) async fn drive(
        &self,
        job: &mut FailoverJob,
        state: &mut RunState,
        continue_on_error: bool,
    ) -> Result<(), PhaseFailure> {
        let mut failures: Vec<PhaseFailure> = Vec::new();

        for phase in job.planned_phases.clone() {
            if phase == Phase::FinalizeRollback && !failures.is_empty() {
                return Err(failures.remove(0));
            }

            let started_at = Utc::now();
            job.begin_phase(phase)
                .map_err(|error| PhaseFailure { phase, error })?;
            let step = self
                .tracker
                .start_step(job.job_id, phase.step_name())
                .await
                .map_err(|error| PhaseFailure { phase, error })?;

            let skip = self.skip_reason(phase, job, state);
            let span = step_span(job.job_id, phase.step_name());
            let result = match &skip {
                Some(reason) => {
                    info!(parent: &span, reason = %reason, "Phase skipped");
                    Ok(())
                }
                None => {
                    self.run_phase(phase, job, state)
                        .instrument(span.clone())
                        .await
                }
            };

            match result {
                Ok(()) => {
                    let step_status = match skip {
                        Some(_) => StepStatus::Skipped,
                        None => StepStatus::Completed,
                    };
                    if !job.status.is_terminal() {
                        let outcome = match skip {
                            Some(reason) => PhaseOutcome::Skipped { reason },
                            None => PhaseOutcome::Completed,
                        };
                        job.record_phase(phase, outcome, started_at);
                        self.store
                            .save_job(job)
                            .await
                            .map_err(|error| PhaseFailure { phase, error })?;
                    }
                    if let Err(e) = self.tracker.end_step(step, step_status, None).await {
                        warn!(job_id = %job.job_id, step = phase.step_name(), error = %e, "Failed to close tracker step");
                    }
                }
                Err(error) => {
                    if let Err(e) = self
                        .tracker
                        .end_step(step, StepStatus::Failed, Some(error.to_string()))
                        .await
                    {
                        warn!(job_id = %job.job_id, step = phase.step_name(), error = %e, "Failed to close tracker step");
                    }
                    if !continue_on_error {
                        return Err(PhaseFailure { phase, error });
                    }
                    warn!(
                        parent: &span,
                        error = %error,
                        "Phase failed; continuing because cleanup is forced"
                    );
                    job.record_phase(
                        phase,
                        PhaseOutcome::Failed {
                            error: error.to_string(),
                        },
                        started_at,
                    );
                    job.warnings
                        .push(format!("{} failed: {}", phase.display_name(), error));
                    if let Err(e) = self.store.save_job(job).await {
                        warn!(job_id = %job.job_id, error = %e, "Failed to save job after forced step");
                    }
                    failures.push(PhaseFailure { phase, error });
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(failures.remove(0))
        }
    }

    fn skip_reason(&self, phase: Phase, job: &FailoverJob, state: &RunState) -> Option<String> {
        match &job.operation {
            JobOperation::Failover { behavior } => {
                failover_skip_reason(phase, behavior, state.driver_preparation_needed)
            }
            JobOperation::Rollback { options, .. } => rollback_skip_reason(phase, job.kind, options),
        }
    }

    async fn run_phase(
        &self,
        phase: Phase,
        job: &mut FailoverJob,
        state: &mut RunState,
    ) -> CutoverResult<()> {
        match phase {
            Phase::Validate => self.validate_readiness(job, state).await,
            Phase::PowerOffSource => self.power_off_source(job, state).await,
            Phase::FinalSync => self.final_sync(job, state).await,
            Phase::Snapshot => self.snapshot_volumes(job, state).await,
            Phase::DriverPreparation => self.prepare_drivers(job, state).await,
            Phase::CreateVm => self.create_destination_vm(job, state).await,
            Phase::AttachVolumes => self.attach_volumes(job, state).await,
            Phase::StartVm => self.start_destination_vm(job).await,
            Phase::Finalize => self.finalize_failover(job).await,
            Phase::ValidateRollback => self.validate_rollback(job).await,
            Phase::StopDestinationVm => self.stop_destination_vm(job).await,
            Phase::DetachVolumes => self.detach_destination_volumes(job, state).await,
            Phase::DeleteDestinationVm => self.delete_destination_vm(job).await,
            Phase::RevertSnapshots => self.revert_snapshots(job).await,
            Phase::DeleteSnapshots => self.delete_snapshots(job).await,
            Phase::ReattachVolumes => self.reattach_volumes(job, state).await,
            Phase::PowerOnSource => self.power_on_source(job).await,
            Phase::FinalizeRollback => self.finalize_rollback(job).await,
        }
    }

    /// Record a terminal failure and build the error returned to the caller.
    ///
    /// Failures after the commitment point come back as `Irrecoverable`
    /// carrying every resource id the job created.
    pub(super) async fn fail_job(
        &self,
        mut job: FailoverJob,
        failure: PhaseFailure,
        state: &RunState,
    ) -> CutoverError {
        let PhaseFailure { phase, error } = failure;
        if !matches!(job.phase_outcome(phase), Some(PhaseOutcome::Failed { .. })) {
            job.record_phase(
                phase,
                PhaseOutcome::Failed {
                    error: error.to_string(),
                },
                Utc::now(),
            );
        }

        let resources = job.created_resources();
        let report = if job.is_rollback() {
            FailureReport::for_rollback(phase, &error, resources.clone())
        } else {
            FailureReport::for_failover(phase, &error, resources.clone(), job.is_cleanup_eligible())
        };
        error!(
            job_id = %job.job_id,
            context_id = %job.context_id,
            phase = phase.step_name(),
            category = %error.category(),
            rollback_recommended = report.rollback_recommended,
            error = %error,
            "Job failed"
        );
        job.failure = Some(report);
        if let Err(e) = job.transition(JobStatus::Failed) {
            error!(job_id = %job.job_id, error = %e, "Could not mark job failed");
        }

        let leaves_cleanup = job.is_rollback() || !resources.is_empty() || state.source_powered_off;
        let context_status = leaves_cleanup.then_some(ContextStatus::CleanupRequired);
        if let Err(e) = self.store.finish_job(&job, context_status).await {
            error!(job_id = %job.job_id, error = %e, "Failed to persist failed job");
        }
        self.end_job(job.job_id, JobStatus::Failed).await;

        let committed = phase.is_committed() || !resources.is_empty();
        match error {
            CutoverError::Irrecoverable { .. } => error,
            other if committed => escalate(phase, other, resources),
            other => other,
        }
    }

    pub(super) async fn end_job(&self, job_id: JobId, status: JobStatus) {
        if let Err(e) = self.tracker.end_job(job_id, status).await {
            warn!(job_id = %job_id, error = %e, "Failed to close tracker job");
        }
    }

    // Shared helpers

    /// Fetch credentials fresh and check they own the appliance
    pub(super) async fn check_credentials(&self) -> CutoverResult<Credentials> {
        let credentials = self.platform.credentials.active_credentials().await?;
        let owner = self
            .platform
            .credentials
            .vm_account(&self.appliance_vm_id)
            .await?;
        if owner != credentials.account {
            return Err(CutoverError::AccountMismatch {
                resource: format!("appliance VM {}", self.appliance_vm_id),
                expected: credentials.account,
                actual: owner,
            });
        }
        Ok(credentials)
    }

    pub(super) fn disk_link(job: &FailoverJob, disk: &DiskDescriptor) -> DiskLink {
        DiskLink {
            context_id: job.context_id.clone(),
            disk_id: disk.disk_id,
        }
    }

    pub(super) async fn wait_for_vm_power(
        &self,
        vm_id: &str,
        wanted: PowerState,
        limit: std::time::Duration,
    ) -> CutoverResult<()> {
        let compute = &self.platform.compute;
        poll_until(
            &format!("VM {} to reach {:?}", vm_id, wanted),
            limit,
            self.polling.power_state_interval,
            || async move {
                let vm = compute
                    .get_vm(vm_id)
                    .await?
                    .ok_or_else(|| CutoverError::not_found(format!("vm {}", vm_id)))?;
                Ok((vm.power_state == wanted).then_some(()))
            },
        )
        .await
    }

    pub(super) async fn wait_for_source_power(
        &self,
        source_vm_id: &str,
        wanted: PowerState,
        limit: std::time::Duration,
    ) -> CutoverResult<()> {
        let hypervisor = &self.platform.hypervisor;
        poll_until(
            &format!("source VM {} to reach {:?}", source_vm_id, wanted),
            limit,
            self.polling.power_state_interval,
            || async move {
                let state = hypervisor.get_power_state(source_vm_id).await?;
                Ok((state == wanted).then_some(()))
            },
        )
        .await
    }

    // Failover phases

    /// Mandatory checks that run even when readiness validation is skipped
    async fn preflight(&self, job: &FailoverJob, state: &mut RunState) -> CutoverResult<()> {
        let behavior = job
            .behavior()
            .ok_or_else(|| CutoverError::internal("preflight on a rollback job"))?;
        state.disks = self.contexts.disks_for_context(&job.context_id).await?;
        state.driver_preparation_needed = job.source_spec.boot_subsystem_mismatch();

        self.check_credentials().await?;

        let networks = self
            .networks
            .resolve(
                &job.context_id,
                job.kind,
                &job.source_spec.networks,
                behavior.network_override.as_ref(),
            )
            .await?;
        debug!(strategy = ?networks.strategy, assignments = ?networks.assignments, "Networks resolved");
        state.networks = Some(networks);

        if state.driver_preparation_needed
            && !behavior.skip_driver_injection
            && !behavior.snapshots_enabled()
        {
            return Err(CutoverError::validation(
                "snapshot_policy",
                "driver preparation modifies the boot volume and requires a snapshot first",
            ));
        }
        Ok(())
    }

    async fn validate_readiness(&self, job: &FailoverJob, state: &RunState) -> CutoverResult<()> {
        let context = self.contexts.require_context(&job.context_id).await?;
        if !matches!(
            context.status,
            ContextStatus::ReadyForFailover | ContextStatus::Replicating
        ) {
            return Err(CutoverError::validation(
                "context_status",
                format!(
                    "context {} is {}; failover needs ready_for_failover or replicating",
                    context.context_id, context.status
                ),
            ));
        }
        if state.disks.is_empty() {
            return Err(CutoverError::validation(
                "disks",
                format!("context {} has no replicated disks", job.context_id),
            ));
        }
        for disk in &state.disks {
            let volume_id = disk_volume(disk)?;
            let info = self
                .authority
                .volume_info(volume_id)
                .await?
                .ok_or_else(|| CutoverError::not_found(format!("volume {}", volume_id)))?;
            if let Some(owner) = info.attached_to.as_deref() {
                if owner != self.appliance_vm_id {
                    return Err(CutoverError::validation(
                        "volume_owner",
                        format!(
                            "volume {} of disk {} is attached to unexpected VM {}",
                            volume_id, disk.disk_key, owner
                        ),
                    ));
                }
            }
        }
        if job.behavior().map(|b| b.power_off_source).unwrap_or(false) {
            self.platform
                .hypervisor
                .get_power_state(&job.source_vm_id)
                .await?;
        }
        Ok(())
    }

    async fn power_off_source(&self, job: &FailoverJob, state: &mut RunState) -> CutoverResult<()> {
        let hypervisor = &self.platform.hypervisor;
        let source = job.source_vm_id.as_str();
        let current = with_timeout(
            hypervisor.get_power_state(source),
            self.timeouts.power_off,
            "get source power state",
        )
        .await??;
        if current != PowerState::Stopped {
            with_timeout(
                hypervisor.power_off(source),
                self.timeouts.power_off,
                "power off source VM",
            )
            .await??;
        }
        self.wait_for_source_power(source, PowerState::Stopped, self.timeouts.power_off)
            .await?;
        state.source_powered_off = true;
        info!(source_vm_id = source, "Source VM powered off");
        Ok(())
    }

    async fn final_sync(&self, job: &FailoverJob, state: &mut RunState) -> CutoverResult<()> {
        let transport = &self.platform.transport;
        let mut synced = Vec::with_capacity(state.disks.len());
        for disk in &state.disks {
            let handle = with_timeout(
                transport.start_incremental_sync(disk, disk.change_marker.as_deref()),
                self.timeouts.volume_operation,
                "start incremental sync",
            )
            .await??;
            let handle = &handle;
            let marker = poll_until(
                &format!("final sync of disk {}", disk.disk_key),
                self.timeouts.final_sync,
                self.polling.volume_operation_interval,
                || async move {
                    match transport.sync_status(handle).await? {
                        SyncStatus::Running => Ok(None),
                        SyncStatus::Completed { change_marker } => Ok(Some(change_marker)),
                        SyncStatus::Failed { reason } => {
                            Err(CutoverError::platform_failed("final sync", reason))
                        }
                    }
                },
            )
            .await?;
            let updated = self
                .contexts
                .record_change_marker(&job.context_id, disk.disk_key, &marker)
                .await?;
            info!(disk_key = disk.disk_key, change_marker = %marker, "Final sync complete");
            synced.push(updated);
        }
        state.disks = synced;
        Ok(())
    }

    /// Snapshot every disk's volume or none of them
    async fn snapshot_volumes(&self, job: &mut FailoverJob, state: &RunState) -> CutoverResult<()> {
        let behavior = job
            .behavior()
            .cloned()
            .ok_or_else(|| CutoverError::internal("snapshot phase on a rollback job"))?;
        let mut created: Vec<SnapshotRecord> = Vec::new();

        for disk in &state.disks {
            let volume_id = disk_volume(disk)?.clone();
            let name = behavior.snapshot_name(&job.source_name, disk.disk_key);
            match self.snapshots.create(&volume_id, &name).await {
                Ok(info) => {
                    let record = SnapshotRecord {
                        disk_key: disk.disk_key,
                        volume_id,
                        snapshot_id: info.snapshot_id,
                    };
                    job.snapshots.push(record.clone());
                    created.push(record);
                    self.store.save_job(job).await?;
                }
                Err(e) => {
                    warn!(disk_key = disk.disk_key, error = %e, partial = created.len(), "Snapshot failed; removing partial set");
                    for record in &created {
                        match self.snapshots.delete(&record.snapshot_id).await {
                            Ok(_) => job.snapshots.retain(|s| s.snapshot_id != record.snapshot_id),
                            Err(de) => {
                                warn!(snapshot_id = %record.snapshot_id, error = %de, "Could not remove partial snapshot")
                            }
                        }
                    }
                    return Err(CutoverError::platform_failed(
                        "multi-volume snapshot",
                        format!(
                            "snapshot of disk {} failed: {}; {} of {} partial snapshot(s) removed",
                            disk.disk_key,
                            e,
                            created.len() - job.snapshots.len(),
                            created.len()
                        ),
                    ));
                }
            }
        }
        info!(count = created.len(), "Snapshots created for all disks");
        Ok(())
    }

    /// Run the guest conversion tool against the snapshotted boot volume
    async fn prepare_drivers(&self, job: &mut FailoverJob, state: &RunState) -> CutoverResult<()> {
        let boot = state
            .disks
            .first()
            .ok_or_else(|| CutoverError::validation("disks", "no boot disk"))?;
        let volume_id = disk_volume(boot)?;

        let mapping = match self.authority.mapping(volume_id).await? {
            Some(mapping) if mapping.owner_vm_id == self.appliance_vm_id => mapping,
            _ => {
                self.authority
                    .attach_and_wait(volume_id, &self.appliance_vm_id, Some(Self::disk_link(job, boot)))
                    .await?
            }
        };

        let result = with_timeout(
            self.platform.drivers.prepare_boot_volume(
                volume_id,
                &mapping.location,
                job.source_spec.guest_family,
            ),
            self.timeouts.driver_preparation,
            "driver preparation",
        )
        .await
        .and_then(|inner| inner);

        match result {
            Ok(()) => {
                info!(volume_id = %volume_id, "Boot volume prepared");
                Ok(())
            }
            Err(e) if job.kind == FailoverKind::Live => {
                warn!(volume_id = %volume_id, error = %e, "Driver preparation failed; continuing live failover");
                job.warnings.push(format!(
                    "Driver preparation failed, the VM may need drivers installed manually: {}",
                    e
                ));
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn create_destination_vm(&self, job: &mut FailoverJob, state: &RunState) -> CutoverResult<()> {
        let networks = state
            .networks
            .as_ref()
            .ok_or_else(|| CutoverError::internal("networks were not resolved"))?;
        let name = job
            .destination_vm_name
            .clone()
            .ok_or_else(|| CutoverError::internal("destination VM name missing"))?;
        let spec = VmSpec {
            name,
            cpus: job.source_spec.cpus,
            memory_mb: job.source_spec.memory_mb,
            firmware: job.source_spec.firmware,
            guest_family: job.source_spec.guest_family,
            network_ids: networks.destination_ids(),
        };

        let vm_id = with_timeout(
            self.platform.compute.create_vm(&spec),
            self.timeouts.vm_create,
            "create destination VM",
        )
        .await??;
        job.destination_vm_id = Some(vm_id.clone());
        self.store.save_job(job).await?;
        info!(destination_vm_id = %vm_id, name = %spec.name, "Destination VM created");
        Ok(())
    }

    /// Move every disk's volume to the destination VM in disk-key order:
    /// the boot disk first, then the data disks concurrently
    async fn attach_volumes(&self, job: &mut FailoverJob, state: &RunState) -> CutoverResult<()> {
        let destination = job
            .destination_vm_id
            .clone()
            .ok_or_else(|| CutoverError::internal("destination VM id missing"))?;

        for disk in &state.disks {
            let volume_id = disk_volume(disk)?;
            if job.original_owner(volume_id).is_some() {
                continue;
            }
            let info = self
                .authority
                .volume_info(volume_id)
                .await?
                .ok_or_else(|| CutoverError::not_found(format!("volume {}", volume_id)))?;
            job.volume_owners.push(VolumeOwnerRecord {
                disk_key: disk.disk_key,
                volume_id: volume_id.clone(),
                original_owner: info.attached_to.filter(|owner| *owner != destination),
            });
        }
        self.store.save_job(job).await?;

        let (boot, data) = state
            .disks
            .split_first()
            .ok_or_else(|| CutoverError::validation("disks", "no disks to attach"))?;
        let job_ref: &FailoverJob = job;
        self.move_disk(job_ref, boot, &destination).await?;

        let results = join_all(
            data.iter()
                .map(|disk| self.move_disk(job_ref, disk, &destination)),
        )
        .await;
        results.into_iter().collect::<CutoverResult<Vec<_>>>()?;
        Ok(())
    }

    /// Detach from any other owner, then attach to `destination`
    async fn move_disk(
        &self,
        job: &FailoverJob,
        disk: &DiskDescriptor,
        destination: &str,
    ) -> CutoverResult<VolumeDeviceMapping> {
        let volume_id = disk_volume(disk)?;
        let info = self
            .authority
            .volume_info(volume_id)
            .await?
            .ok_or_else(|| CutoverError::not_found(format!("volume {}", volume_id)))?;
        if info.attached_to.as_deref().is_some_and(|owner| owner != destination) {
            self.authority.detach_and_wait(volume_id).await?;
        }
        let mapping = self
            .authority
            .attach_and_wait(volume_id, destination, Some(Self::disk_link(job, disk)))
            .await?;
        info!(disk_key = disk.disk_key, volume_id = %volume_id, location = %mapping.location, "Disk attached to destination");
        Ok(mapping)
    }

    async fn start_destination_vm(&self, job: &mut FailoverJob) -> CutoverResult<()> {
        let destination = job
            .destination_vm_id
            .clone()
            .ok_or_else(|| CutoverError::internal("destination VM id missing"))?;
        let compute = &self.platform.compute;
        with_timeout(
            compute.power_on_vm(&destination),
            self.timeouts.power_on,
            "power on destination VM",
        )
        .await??;

        let vm_id = destination.as_str();
        let ready = poll_until(
            &format!("guest of VM {} to respond", vm_id),
            self.timeouts.guest_ready,
            self.polling.power_state_interval,
            || async move { Ok(compute.guest_responsive(vm_id).await?.then_some(())) },
        )
        .await;
        match ready {
            Ok(()) => info!(destination_vm_id = vm_id, "Destination VM running and responsive"),
            Err(CutoverError::Timeout { duration, .. }) => {
                warn!(destination_vm_id = vm_id, "Guest did not respond in time");
                job.warnings.push(format!(
                    "Guest did not respond within {}s; the VM is powered on",
                    duration.as_secs()
                ));
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Mark the job completed and the context failed over.
    ///
    /// The failover has already succeeded; a persistence error here is
    /// logged and left for startup reconciliation.
    async fn finalize_failover(&self, job: &mut FailoverJob) -> CutoverResult<()> {
        job.record_phase(Phase::Finalize, PhaseOutcome::Completed, Utc::now());
        job.transition(JobStatus::Completed)?;
        let status = ContextStatus::failed_over(job.kind);
        if let Err(e) = self.store.finish_job(job, Some(status)).await {
            error!(
                job_id = %job.job_id,
                error = %e,
                "Failover succeeded but its final state could not be persisted"
            );
            job.warnings
                .push(format!("Final status not persisted: {}", e));
        }
        Ok(())
    }
}

pub(super) fn disk_volume(disk: &DiskDescriptor) -> CutoverResult<&VolumeId> {
    disk.volume_id.as_ref().ok_or_else(|| {
        CutoverError::validation(
            "volume_id",
            format!("disk {} has no destination volume", disk.disk_key),
        )
    })
}

fn escalate(phase: Phase, error: CutoverError, resources: CreatedResources) -> CutoverError {
    let message = match error.category() {
        ErrorCategory::Conflict => error.to_string(),
        _ => format!("{} failed: {}", phase.display_name(), error),
    };
    CutoverError::irrecoverable(message, resources)
}
