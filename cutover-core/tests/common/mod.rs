//! Shared fixtures for integration tests
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use cutover_core::config::CutoverConfig;
use cutover_core::platform::{PlatformServices, PowerState, SimulatedPlatform};
use cutover_core::storage::Store;
use cutover_core::types::{DiskDescriptor, DiskUpdate, SourceSpec};
use cutover_core::{ContextId, ContextStatus, CutoverService, FailoverKind, VolumeId};

pub const SOURCE_VM: &str = "vm-src-101";
pub const SOURCE_NAME: &str = "web01";
pub const SOURCE_NETWORK: &str = "VM Network";
pub const PROD_NETWORK: &str = "net-prod";
pub const ISOLATED_NETWORK: &str = "net-iso";

/// A service over a temp-dir store and the simulated platform, with one
/// context ready for failover
pub struct TestEnv {
    pub service: CutoverService,
    pub platform: Arc<SimulatedPlatform>,
    pub context_id: ContextId,
    pub volumes: Vec<(u32, VolumeId)>,
    _dir: TempDir,
}

impl TestEnv {
    pub async fn disks(&self) -> Vec<DiskDescriptor> {
        self.service
            .contexts
            .disks_for_context(&self.context_id)
            .await
            .unwrap()
    }

    pub async fn context_status(&self) -> ContextStatus {
        self.service
            .contexts
            .require_context(&self.context_id)
            .await
            .unwrap()
            .status
    }

    pub fn volume(&self, disk_key: u32) -> VolumeId {
        self.volumes
            .iter()
            .find(|(key, _)| *key == disk_key)
            .map(|(_, volume)| volume.clone())
            .unwrap()
    }

    pub fn appliance(&self) -> &str {
        &self.service.config.appliance.vm_id
    }
}

/// Short timeouts and fast polling so failure paths finish quickly
pub fn test_config(dir: &TempDir) -> CutoverConfig {
    let mut config = CutoverConfig::default();
    config.storage.data_dir = dir.path().to_path_buf();
    config.timeouts.power_off = Duration::from_secs(2);
    config.timeouts.power_on = Duration::from_secs(2);
    config.timeouts.final_sync = Duration::from_secs(2);
    config.timeouts.volume_operation = Duration::from_secs(5);
    config.timeouts.device_correlation = Duration::from_secs(2);
    config.timeouts.snapshot = Duration::from_secs(2);
    config.timeouts.vm_create = Duration::from_secs(2);
    config.timeouts.guest_ready = Duration::from_millis(300);
    config.timeouts.driver_preparation = Duration::from_secs(2);
    config.polling.power_state_interval = Duration::from_millis(10);
    config.polling.volume_operation_interval = Duration::from_millis(10);
    config.polling.correlation_interval = Duration::from_millis(10);
    config
}

pub async fn setup() -> TestEnv {
    setup_with(&[2000, 2001], SourceSpec::default()).await
}

/// Context with one replicated volume per disk key, each attached to the
/// appliance, and network mappings for both failover kinds
pub async fn setup_with(disk_keys: &[u32], spec: SourceSpec) -> TestEnv {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let store = Store::open(&config.database_path()).unwrap();
    let platform = Arc::new(SimulatedPlatform::new(
        &config.appliance.vm_id,
        &config.appliance.host_id,
    ));
    platform.add_network(PROD_NETWORK, "production", false);
    platform.add_network(ISOLATED_NETWORK, "isolated-test", true);
    platform.add_source_vm(SOURCE_VM, PowerState::Running);

    let service = CutoverService::with_platform(
        store,
        PlatformServices::from_simulated(platform.clone()),
        Some(platform.clone()),
        config,
    );

    let context_id = ContextId::new("ctx-web01");
    let spec = SourceSpec {
        networks: vec![SOURCE_NETWORK.to_string()],
        ..spec
    };
    service
        .contexts
        .register_context(context_id.clone(), SOURCE_VM, SOURCE_NAME, spec)
        .await
        .unwrap();

    let mut volumes = Vec::new();
    for &disk_key in disk_keys {
        let volume_id = platform.seed_appliance_volume(&format!("{}-{}", SOURCE_NAME, disk_key), 20);
        service
            .contexts
            .upsert_disk(
                &context_id,
                DiskUpdate {
                    disk_key,
                    size_gb: 20,
                    change_marker: Some("52 3c 4f-1".to_string()),
                    volume_id: Some(volume_id.clone()),
                },
            )
            .await
            .unwrap();
        volumes.push((disk_key, volume_id));
    }

    service
        .networks
        .set_mapping(&context_id, FailoverKind::Live, SOURCE_NETWORK, PROD_NETWORK)
        .await
        .unwrap();
    service
        .networks
        .set_mapping(&context_id, FailoverKind::Test, SOURCE_NETWORK, ISOLATED_NETWORK)
        .await
        .unwrap();
    service
        .contexts
        .set_status(&context_id, ContextStatus::ReadyForFailover)
        .await
        .unwrap();

    TestEnv {
        service,
        platform,
        context_id,
        volumes,
        _dir: dir,
    }
}
