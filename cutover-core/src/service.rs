//! Service wiring
//!
//! Builds every component over one store and one set of platform
//! capabilities.

use std::sync::Arc;
use tracing::info;

use crate::config::CutoverConfig;
use crate::context::ContextRegistry;
use crate::error::CutoverResult;
use crate::failover::FailoverOrchestrator;
use crate::network::NetworkResolver;
use crate::platform::{PlatformServices, SimulatedPlatform};
use crate::reconcile::Reconciler;
use crate::storage::Store;
use crate::tracker::{JobTracker, RedbJobTracker};
use crate::volume::VolumeAuthority;

#[derive(Debug, Clone)]
pub struct CutoverService {
    pub config: CutoverConfig,
    pub store: Store,
    pub contexts: ContextRegistry,
    pub networks: NetworkResolver,
    pub volumes: Arc<VolumeAuthority>,
    pub orchestrator: Arc<FailoverOrchestrator>,
    pub reconciler: Arc<Reconciler>,
    pub tracker: Arc<RedbJobTracker>,
    /// Set when the configured backend is the in-memory simulator
    pub simulator: Option<Arc<SimulatedPlatform>>,
}

impl CutoverService {
    /// Open the database and platform named in `config`, reconciling
    /// leftovers from a previous process when configured to
    pub async fn open(config: CutoverConfig) -> CutoverResult<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.storage.data_dir)?;
        let store = Store::open(&config.database_path())?;
        let (platform, simulator) = PlatformServices::from_config(&config)?;
        let service = Self::with_platform(store, platform, simulator, config);
        if service.config.reconcile.run_on_startup {
            service.reconciler.run().await?;
        }
        Ok(service)
    }

    pub fn with_platform(
        store: Store,
        platform: PlatformServices,
        simulator: Option<Arc<SimulatedPlatform>>,
        config: CutoverConfig,
    ) -> Self {
        let volumes = Arc::new(VolumeAuthority::new(store.clone(), &platform, &config));
        let tracker = Arc::new(RedbJobTracker::new(store.clone()));
        let orchestrator = Arc::new(FailoverOrchestrator::new(
            store.clone(),
            platform.clone(),
            volumes.clone(),
            tracker.clone() as Arc<dyn JobTracker>,
            &config,
        ));
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            volumes.clone(),
            orchestrator.clone(),
            platform.compute.clone(),
            platform.volumes.clone(),
            config.reconcile.staleness_threshold,
        ));
        info!(
            appliance_vm_id = %config.appliance.vm_id,
            backend = %config.platform.backend,
            "Cutover service ready"
        );
        Self {
            contexts: ContextRegistry::new(store.clone()),
            networks: NetworkResolver::new(store.clone(), platform.compute.clone()),
            config,
            store,
            volumes,
            orchestrator,
            reconciler,
            tracker,
            simulator,
        }
    }
}
