//! Startup reconciliation of jobs and volume operations a previous
//! process left behind

mod common;

use chrono::{Duration as ChronoDuration, Utc};

use cutover_core::failover::{resolve_behavior, FailoverJob, Phase, SnapshotRecord};
use cutover_core::platform::{ComputePlatform, VolumePlatform};
use cutover_core::storage::VOLUME_OPERATIONS_TABLE;
use cutover_core::types::{DeviceLocation, VolumeOperation, VolumeOperationKind, VolumeOperationStatus};
use cutover_core::{
    ConfigOverrides, ContextStatus, ErrorCategory, FailoverKind, FailoverRequest, JobStatus,
};

use common::{setup, TestEnv};

/// A failover job admitted and advanced to snapshotting, as a crashed
/// process would have left it
async fn abandoned_job(env: &TestEnv) -> FailoverJob {
    let context = env
        .service
        .contexts
        .require_context(&env.context_id)
        .await
        .unwrap();
    let behavior = resolve_behavior(
        &FailoverRequest::new(env.context_id.clone(), FailoverKind::Test),
        ConfigOverrides::default(),
        Utc::now(),
    )
    .unwrap();
    let mut job = FailoverJob::new_failover(&context, behavior);
    env.service.store.admit_job(&job).await.unwrap();

    job.begin_phase(Phase::Snapshot).unwrap();
    job.snapshots.push(SnapshotRecord {
        disk_key: 2000,
        volume_id: env.volume(2000),
        snapshot_id: "snap-orphan".to_string(),
    });
    env.service.store.save_job(&job).await.unwrap();
    job
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fresh_job_is_left_alone() {
    let env = setup().await;
    let job = abandoned_job(&env).await;

    let summary = env.service.reconciler.run_at(Utc::now()).await.unwrap();
    assert_eq!(summary.jobs_left_fresh, 1);
    assert_eq!(summary.jobs_failed, 0);

    let stored = env.service.orchestrator.get_job(job.job_id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Snapshotting);
    assert_eq!(
        env.service.store.active_job(&env.context_id).await.unwrap(),
        Some(job.job_id)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stale_job_without_proof_is_failed() {
    let env = setup().await;
    let job = abandoned_job(&env).await;

    let later = Utc::now() + ChronoDuration::hours(2);
    let summary = env.service.reconciler.run_at(later).await.unwrap();
    assert_eq!(summary.jobs_failed, 1);
    assert_eq!(summary.jobs_completed, 0);

    let stored = env.service.orchestrator.get_job(job.job_id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    let report = stored.failure.unwrap();
    assert_eq!(report.phase, Phase::Snapshot);
    assert_eq!(report.category, ErrorCategory::Irrecoverable);
    assert!(report.rollback_recommended);
    assert_eq!(report.resources.snapshot_ids, vec!["snap-orphan".to_string()]);

    assert_eq!(env.context_status().await, ContextStatus::CleanupRequired);
    assert!(env
        .service
        .store
        .active_job(&env.context_id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stale_job_with_running_destination_is_completed() {
    let env = setup().await;
    let finished = env
        .service
        .orchestrator
        .execute_failover(
            FailoverRequest::new(env.context_id.clone(), FailoverKind::Test),
            ConfigOverrides::default(),
        )
        .await
        .unwrap();

    // Pretend the process died after the VM came up, before finalize
    let mut job = finished.clone();
    job.status = JobStatus::Starting;
    job.completed_at = None;
    job.current_phase = Some(Phase::Finalize);
    env.service
        .contexts
        .set_status(&env.context_id, ContextStatus::ReadyForFailover)
        .await
        .unwrap();
    env.service.store.admit_job(&job).await.unwrap();

    let later = Utc::now() + ChronoDuration::hours(2);
    let summary = env.service.reconciler.run_at(later).await.unwrap();
    assert_eq!(summary.jobs_completed, 1);

    let stored = env.service.orchestrator.get_job(job.job_id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    assert!(stored.failure.is_none());
    assert_eq!(env.context_status().await, ContextStatus::FailedOverTest);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stale_job_with_stopped_destination_is_failed() {
    let env = setup().await;
    let finished = env
        .service
        .orchestrator
        .execute_failover(
            FailoverRequest::new(env.context_id.clone(), FailoverKind::Test),
            ConfigOverrides::default(),
        )
        .await
        .unwrap();
    let vm_id = finished.destination_vm_id.clone().unwrap();

    let mut job = finished;
    job.status = JobStatus::AttachingVolumes;
    job.completed_at = None;
    job.current_phase = Some(Phase::AttachVolumes);
    env.service.store.admit_job(&job).await.unwrap();
    env.platform.power_off_vm(&vm_id).await.unwrap();

    let later = Utc::now() + ChronoDuration::hours(2);
    let summary = env.service.reconciler.run_at(later).await.unwrap();
    assert_eq!(summary.jobs_failed, 1);
    let stored = env.service.orchestrator.get_job(job.job_id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(
        stored.failure.unwrap().resources.destination_vm_id.as_deref(),
        Some(vm_id.as_str())
    );
    assert_eq!(env.context_status().await, ContextStatus::CleanupRequired);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_interrupted_volume_operations_are_settled() {
    let env = setup().await;
    let authority = &env.service.volumes;
    let volume = authority.create_volume("orphan", 5).await.unwrap();

    // The attach reached the platform but its operation was never finished
    env.platform.attach_volume(&volume, env.appliance()).await.unwrap();
    let mut attach = VolumeOperation::new(
        VolumeOperationKind::Attach,
        volume.clone(),
        Some(env.appliance().to_string()),
    );
    attach.status = VolumeOperationStatus::Executing;
    env.service
        .store
        .put(VOLUME_OPERATIONS_TABLE, &attach.id.to_string(), &attach)
        .await
        .unwrap();

    let mut create = VolumeOperation::new(
        VolumeOperationKind::Create,
        cutover_core::VolumeId::new("never-created"),
        None,
    );
    create.status = VolumeOperationStatus::Executing;
    env.service
        .store
        .put(VOLUME_OPERATIONS_TABLE, &create.id.to_string(), &create)
        .await
        .unwrap();

    let summary = env.service.reconciler.run().await.unwrap();
    assert_eq!(summary.operations.completed, 1);
    assert_eq!(summary.operations.failed, 1);

    let settled = authority.get_operation(attach.id).await.unwrap().unwrap();
    assert_eq!(settled.status, VolumeOperationStatus::Completed);
    let mapping = authority.mapping(&volume).await.unwrap().unwrap();
    assert_eq!(
        mapping.location,
        DeviceLocation::Host {
            path: env.platform.assigned_host_path(&volume).unwrap()
        }
    );

    let failed = authority.get_operation(create.id).await.unwrap().unwrap();
    assert_eq!(failed.status, VolumeOperationStatus::Failed);
    assert!(failed.error.unwrap().contains("interrupted"));
}
