//! Failure paths: what is left behind, what is reported, how it recovers

mod common;

use std::collections::BTreeMap;

use cutover_core::failover::{Phase, PhaseOutcome};
use cutover_core::platform::PowerState;
use cutover_core::types::{DiskBus, GuestFamily, SourceSpec};
use cutover_core::{
    ConfigOverrides, ContextStatus, CutoverError, ErrorCategory, FailoverKind, FailoverRequest,
    JobStatus, RollbackOptions,
};

use common::{setup, setup_with, TestEnv, ISOLATED_NETWORK, SOURCE_NETWORK, SOURCE_VM};

fn request(env: &TestEnv, kind: FailoverKind) -> FailoverRequest {
    FailoverRequest::new(env.context_id.clone(), kind)
}

async fn last_job(env: &TestEnv) -> cutover_core::failover::FailoverJob {
    env.service
        .orchestrator
        .jobs_for_context(&env.context_id)
        .await
        .unwrap()
        .pop()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_snapshot_failure_leaves_no_partial_set() {
    let env = setup().await;
    let failing = env.volume(2001);
    env.platform.inject(move |f| {
        f.fail_snapshot_for.insert(failing);
    });

    let err = env
        .service
        .orchestrator
        .execute_failover(request(&env, FailoverKind::Test), ConfigOverrides::default())
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Irrecoverable);

    // The first disk's snapshot was created, then removed with the set
    assert_eq!(env.platform.snapshot_count(), 0);
    assert_eq!(env.platform.destination_vm_count(), 0);

    let job = last_job(&env).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.snapshots.is_empty());
    let report = job.failure.unwrap();
    assert_eq!(report.phase, Phase::Snapshot);
    assert!(report.technical_detail.contains("disk 2001"));
    // Nothing left behind, so the context keeps its status
    assert_eq!(env.context_status().await, ContextStatus::ReadyForFailover);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_network_mapping_fails_closed() {
    let env = setup().await;
    env.service
        .networks
        .remove_mapping(&env.context_id, FailoverKind::Test, SOURCE_NETWORK)
        .await
        .unwrap();

    let err = env
        .service
        .orchestrator
        .execute_failover(request(&env, FailoverKind::Test), ConfigOverrides::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CutoverError::Validation { .. }));
    assert_eq!(env.platform.snapshot_count(), 0);
    assert_eq!(env.platform.destination_vm_count(), 0);

    // A live mapping never stands in for a test one; an override does
    let mut overrides = BTreeMap::new();
    overrides.insert(SOURCE_NETWORK.to_string(), ISOLATED_NETWORK.to_string());
    let job = env
        .service
        .orchestrator
        .execute_failover(
            request(&env, FailoverKind::Test),
            ConfigOverrides {
                network_override: Some(overrides),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(env
        .service
        .networks
        .mappings_for(&env.context_id)
        .await
        .unwrap()
        .iter()
        .all(|m| m.kind == FailoverKind::Live));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_vm_creation_failure_reports_snapshots_and_rolls_back() {
    let env = setup().await;
    env.platform.inject(|f| f.fail_vm_create = true);

    let err = env
        .service
        .orchestrator
        .execute_failover(request(&env, FailoverKind::Test), ConfigOverrides::default())
        .await
        .unwrap_err();
    let CutoverError::Irrecoverable { resources, .. } = &err else {
        panic!("expected irrecoverable error, got {err:?}");
    };
    assert_eq!(resources.snapshot_ids.len(), 2);
    assert!(resources.destination_vm_id.is_none());

    let status = env
        .service
        .orchestrator
        .get_job_status(last_job(&env).await.job_id)
        .await
        .unwrap();
    assert_eq!(status.status, JobStatus::Failed);
    assert_eq!(status.phase, Some(Phase::CreateVm));
    let report = status.error.unwrap();
    assert!(report.rollback_recommended);
    assert!(report.rollback_available);
    assert_eq!(env.context_status().await, ContextStatus::CleanupRequired);

    env.platform.inject(|f| f.fail_vm_create = false);
    let rollback = env
        .service
        .orchestrator
        .execute_rollback(&env.context_id, FailoverKind::Test, RollbackOptions::for_kind(FailoverKind::Test))
        .await
        .unwrap();
    assert_eq!(rollback.status, JobStatus::Completed);
    assert_eq!(env.platform.snapshot_count(), 0);
    assert_eq!(env.context_status().await, ContextStatus::ReadyForFailover);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_account_mismatch_is_specific() {
    let env = setup().await;
    env.platform.set_active_account("tenant-b");

    let err = env
        .service
        .orchestrator
        .execute_failover(request(&env, FailoverKind::Test), ConfigOverrides::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CutoverError::AccountMismatch { .. }));

    let report = last_job(&env).await.failure.unwrap();
    assert_eq!(report.category, ErrorCategory::Conflict);
    assert!(report.message.contains("tenant-b"));
    assert!(report.message.contains("admin"));
    assert!(!report.rollback_recommended);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_credentials_fail_validation() {
    let env = setup().await;
    env.platform.clear_active_account();

    let err = env
        .service
        .orchestrator
        .execute_failover(request(&env, FailoverKind::Test), ConfigOverrides::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CutoverError::CredentialsUnavailable { .. }));
    assert_eq!(env.platform.destination_vm_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_driver_preparation_failure_depends_on_kind() {
    let spec = SourceSpec {
        guest_family: GuestFamily::Windows,
        disk_bus: DiskBus::Sata,
        ..Default::default()
    };

    let env = setup_with(&[2000], spec.clone()).await;
    env.platform.inject(|f| f.fail_driver_preparation = true);
    let err = env
        .service
        .orchestrator
        .execute_failover(request(&env, FailoverKind::Test), ConfigOverrides::default())
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Irrecoverable);
    assert_eq!(last_job(&env).await.failure.unwrap().phase, Phase::DriverPreparation);

    let env = setup_with(&[2000], spec).await;
    env.platform.inject(|f| f.fail_driver_preparation = true);
    let job = env
        .service
        .orchestrator
        .execute_failover(request(&env, FailoverKind::Live), ConfigOverrides::default())
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.warnings.iter().any(|w| w.contains("Driver preparation failed")));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_driver_preparation_requires_snapshots() {
    let spec = SourceSpec {
        guest_family: GuestFamily::Windows,
        disk_bus: DiskBus::Ide,
        ..Default::default()
    };
    let env = setup_with(&[2000], spec).await;
    let err = env
        .service
        .orchestrator
        .execute_failover(
            request(&env, FailoverKind::Live),
            ConfigOverrides {
                snapshots: Some(false),
                skip_validation: true,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CutoverError::Validation { .. }));
    assert!(env.platform.driver_runs().is_empty());
    // Rejected before the source was touched
    assert_eq!(env.platform.source_power_state(SOURCE_VM), Some(PowerState::Running));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unresponsive_guest_is_a_warning() {
    let env = setup().await;
    env.platform.inject(|f| f.guest_unresponsive = true);

    let job = env
        .service
        .orchestrator
        .execute_failover(request(&env, FailoverKind::Test), ConfigOverrides::default())
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.phase_outcome(Phase::StartVm), Some(&PhaseOutcome::Completed));
    assert!(job.warnings.iter().any(|w| w.contains("did not respond")));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stuck_source_power_off_times_out_before_commitment() {
    let env = setup().await;
    env.platform.inject(|f| f.stuck_power_off = true);

    let err = env
        .service
        .orchestrator
        .execute_failover(request(&env, FailoverKind::Live), ConfigOverrides::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CutoverError::Timeout { .. }));
    assert_eq!(env.platform.snapshot_count(), 0);
    assert_eq!(env.platform.destination_vm_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rollback_without_cleanup_needs_force() {
    let env = setup().await;
    env.service
        .orchestrator
        .execute_failover(
            request(&env, FailoverKind::Live),
            ConfigOverrides {
                cleanup_enabled: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let err = env
        .service
        .orchestrator
        .execute_rollback(&env.context_id, FailoverKind::Live, RollbackOptions::for_kind(FailoverKind::Live))
        .await
        .unwrap_err();
    assert!(matches!(err, CutoverError::Validation { .. }));

    let forced = RollbackOptions {
        force_cleanup: true,
        ..RollbackOptions::for_kind(FailoverKind::Live)
    };
    let rollback = env
        .service
        .orchestrator
        .execute_rollback(&env.context_id, FailoverKind::Live, forced)
        .await
        .unwrap();
    assert_eq!(rollback.status, JobStatus::Completed);
    assert_eq!(env.platform.destination_vm_count(), 0);
    assert_eq!(env.platform.source_power_state(SOURCE_VM), Some(PowerState::Running));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rollback_without_failover_is_rejected() {
    let env = setup().await;
    let err = env
        .service
        .orchestrator
        .execute_rollback(&env.context_id, FailoverKind::Live, RollbackOptions::for_kind(FailoverKind::Live))
        .await
        .unwrap_err();
    assert!(matches!(err, CutoverError::Validation { .. }));
}
