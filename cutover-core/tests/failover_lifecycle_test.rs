//! End-to-end failover and rollback against the simulated platform

mod common;

use pretty_assertions::assert_eq;

use cutover_core::failover::{FailoverJob, Phase, PhaseOutcome};
use cutover_core::platform::PowerState;
use cutover_core::tracker::{JobTracker, StepStatus};
use cutover_core::types::{
    DeviceLocation, DiskBus, GuestFamily, OperationMode, SourceSpec, VolumeOperationKind,
};
use cutover_core::{
    ConfigOverrides, ContextStatus, FailoverKind, FailoverRequest, JobStatus, RollbackOptions,
};

use common::{setup, setup_with, TestEnv, ISOLATED_NETWORK, PROD_NETWORK, SOURCE_NAME, SOURCE_VM};

async fn run_failover(env: &TestEnv, kind: FailoverKind) -> FailoverJob {
    env.service
        .orchestrator
        .execute_failover(
            FailoverRequest::new(env.context_id.clone(), kind),
            ConfigOverrides::default(),
        )
        .await
        .unwrap()
}

async fn run_rollback(env: &TestEnv, kind: FailoverKind) -> FailoverJob {
    env.service
        .orchestrator
        .execute_rollback(&env.context_id, kind, RollbackOptions::for_kind(kind))
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_live_failover_happy_path() {
    let env = setup().await;
    let before = env.disks().await;

    let job = run_failover(&env, FailoverKind::Live).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(env.context_status().await, ContextStatus::FailedOverLive);
    assert_eq!(env.platform.source_power_state(SOURCE_VM), Some(PowerState::Stopped));

    // Exact name, production network
    let vm_id = job.destination_vm_id.clone().unwrap();
    let vm = env.platform.vm(&vm_id).unwrap();
    assert_eq!(vm.name, SOURCE_NAME);
    assert_eq!(vm.power_state, PowerState::Running);
    assert_eq!(
        env.platform.vm_spec(&vm_id).unwrap().network_ids,
        vec![PROD_NETWORK.to_string()]
    );

    // One snapshot per disk, both volumes on the destination
    assert_eq!(job.snapshots.len(), 2);
    for (_, volume_id) in &env.volumes {
        assert_eq!(
            env.platform.volume(volume_id).unwrap().attached_to.as_deref(),
            Some(vm_id.as_str())
        );
        let mapping = env.service.volumes.mapping(volume_id).await.unwrap().unwrap();
        assert_eq!(mapping.owner_vm_id, vm_id);
        assert_eq!(mapping.mode, OperationMode::Failover);
        assert!(matches!(mapping.location, DeviceLocation::Guest { .. }));
    }

    // Final sync advanced every change marker
    let after = env.disks().await;
    for (old, new) in before.iter().zip(after.iter()) {
        assert_ne!(old.change_marker, new.change_marker);
    }

    assert_eq!(
        job.phase_outcome(Phase::DriverPreparation),
        Some(&PhaseOutcome::Skipped {
            reason: "source boot subsystem already compatible".to_string()
        })
    );
    let status = env
        .service
        .orchestrator
        .get_job_status(job.job_id)
        .await
        .unwrap();
    assert_eq!(status.percent, 100);
    assert!(status.error.is_none());
    assert_eq!(status.snapshot_ids, job.snapshot_ids());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_test_failover_leaves_source_running_and_rolls_back() {
    let env = setup().await;

    let job = run_failover(&env, FailoverKind::Test).await;
    let vm_id = job.destination_vm_id.clone().unwrap();
    let vm = env.platform.vm(&vm_id).unwrap();
    assert!(vm.name.starts_with(&format!("{}-test-", SOURCE_NAME)));
    assert_eq!(
        env.platform.vm_spec(&vm_id).unwrap().network_ids,
        vec![ISOLATED_NETWORK.to_string()]
    );
    assert_eq!(env.platform.source_power_state(SOURCE_VM), Some(PowerState::Running));
    assert!(matches!(
        job.phase_outcome(Phase::PowerOffSource),
        Some(PhaseOutcome::Skipped { .. })
    ));
    assert!(matches!(
        job.phase_outcome(Phase::FinalSync),
        Some(PhaseOutcome::Skipped { .. })
    ));
    assert_eq!(env.context_status().await, ContextStatus::FailedOverTest);

    let rollback = run_rollback(&env, FailoverKind::Test).await;
    assert_eq!(rollback.status, JobStatus::Completed);
    assert_eq!(env.context_status().await, ContextStatus::ReadyForFailover);
    assert!(env.platform.vm(&vm_id).is_none());
    assert_eq!(env.platform.snapshot_count(), 0);
    assert_eq!(env.platform.reverted_snapshots().len(), 2);
    for (_, volume_id) in &env.volumes {
        assert_eq!(
            env.platform.volume(volume_id).unwrap().attached_to.as_deref(),
            Some(env.appliance())
        );
        let mapping = env.service.volumes.mapping(volume_id).await.unwrap().unwrap();
        assert_eq!(mapping.mode, OperationMode::Appliance);
        assert!(matches!(mapping.location, DeviceLocation::Host { .. }));
    }

    let failover = env
        .service
        .orchestrator
        .get_job(job.job_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failover.rolled_back_by, Some(rollback.job_id));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rollback_is_idempotent() {
    let env = setup().await;
    run_failover(&env, FailoverKind::Test).await;
    run_rollback(&env, FailoverKind::Test).await;

    let appliance_state: Vec<_> = env
        .volumes
        .iter()
        .map(|(_, v)| env.platform.volume(v).unwrap().attached_to)
        .collect();

    let second = run_rollback(&env, FailoverKind::Test).await;
    assert_eq!(second.status, JobStatus::Completed);
    assert_eq!(env.context_status().await, ContextStatus::ReadyForFailover);
    assert_eq!(env.platform.destination_vm_count(), 0);
    let after: Vec<_> = env
        .volumes
        .iter()
        .map(|(_, v)| env.platform.volume(v).unwrap().attached_to)
        .collect();
    assert_eq!(appliance_state, after);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_live_rollback_powers_source_back_on() {
    let env = setup().await;
    run_failover(&env, FailoverKind::Live).await;
    assert_eq!(env.platform.source_power_state(SOURCE_VM), Some(PowerState::Stopped));

    let rollback = run_rollback(&env, FailoverKind::Live).await;
    assert_eq!(rollback.status, JobStatus::Completed);
    assert_eq!(env.platform.source_power_state(SOURCE_VM), Some(PowerState::Running));
    assert_eq!(env.context_status().await, ContextStatus::ReadyForFailover);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_disk_order_and_identity_stable_across_cycles() {
    let env = setup_with(&[2002, 2000, 2001], SourceSpec::default()).await;
    let identities: Vec<_> = env.disks().await.iter().map(|d| (d.disk_key, d.disk_id)).collect();
    assert_eq!(
        identities.iter().map(|(k, _)| *k).collect::<Vec<_>>(),
        vec![2000, 2001, 2002]
    );

    for _ in 0..2 {
        let job = run_failover(&env, FailoverKind::Test).await;
        let vm_id = job.destination_vm_id.clone().unwrap();

        // The boot disk is always the first volume attached to the destination
        let mut attaches: Vec<_> = env
            .service
            .volumes
            .list_operations()
            .await
            .unwrap()
            .into_iter()
            .filter(|op| {
                op.kind == VolumeOperationKind::Attach && op.target_vm_id.as_deref() == Some(vm_id.as_str())
            })
            .collect();
        attaches.sort_by_key(|op| op.created_at);
        assert_eq!(attaches.len(), 3);
        assert_eq!(attaches[0].volume_id, env.volume(2000));

        let snapshot_keys: Vec<_> = job.snapshots.iter().map(|s| s.disk_key).collect();
        assert_eq!(snapshot_keys, vec![2000, 2001, 2002]);

        for (disk_key, disk_id) in &identities {
            let mapping = env
                .service
                .volumes
                .mapping(&env.volume(*disk_key))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(mapping.disk_id, Some(*disk_id));
        }

        run_rollback(&env, FailoverKind::Test).await;
        let current: Vec<_> = env.disks().await.iter().map(|d| (d.disk_key, d.disk_id)).collect();
        assert_eq!(current, identities);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_windows_guest_gets_driver_preparation() {
    let spec = SourceSpec {
        guest_family: GuestFamily::Windows,
        disk_bus: DiskBus::Scsi,
        ..Default::default()
    };
    let env = setup_with(&[2000, 2001], spec).await;

    let job = run_failover(&env, FailoverKind::Test).await;
    assert_eq!(job.phase_outcome(Phase::DriverPreparation), Some(&PhaseOutcome::Completed));
    assert_eq!(env.platform.driver_runs(), vec![env.volume(2000)]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_steps_are_tracked_per_phase() {
    let env = setup().await;
    let job = run_failover(&env, FailoverKind::Test).await;

    let steps = env.service.tracker.steps(job.job_id).await.unwrap();
    let names: Vec<_> = steps.iter().map(|s| s.step.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "validation",
            "source-vm-power-off",
            "final-sync",
            "multi-volume-snapshot-creation",
            "driver-preparation",
            "vm-creation",
            "volume-attachment",
            "vm-startup",
            "status-update",
        ]
    );
    assert_eq!(steps[1].status, StepStatus::Skipped);
    assert!(steps.iter().all(|s| s.finished_at.is_some()));
}
