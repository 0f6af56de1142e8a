//! Network strategy resolution
//!
//! Maps each source network to a destination network for a context and
//! failover kind. Resolution fails closed: a missing mapping is a
//! validation error, never a fallback to some other network.

use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use crate::error::{CutoverError, CutoverResult};
use crate::failover::config::NetworkStrategy;
use crate::platform::{ComputePlatform, NetworkInfo};
use crate::storage::{self, Store, CONTEXTS_TABLE, NETWORK_MAPPINGS_TABLE};
use crate::types::{ContextId, FailoverKind, NetworkMapping, VmContext};

/// Destination network chosen for each source network, in NIC order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedNetworks {
    pub strategy: NetworkStrategy,
    pub assignments: Vec<(String, String)>,
}

impl ResolvedNetworks {
    pub fn destination_ids(&self) -> Vec<String> {
        self.assignments.iter().map(|(_, dest)| dest.clone()).collect()
    }
}

/// One row of the network configuration view
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkConfigOption {
    pub source_network: String,
    pub current_destination: Option<String>,
    pub candidates: Vec<NetworkInfo>,
}

#[derive(Clone)]
pub struct NetworkResolver {
    store: Store,
    compute: Arc<dyn ComputePlatform>,
}

impl std::fmt::Debug for NetworkResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkResolver").finish_non_exhaustive()
    }
}

impl NetworkResolver {
    pub fn new(store: Store, compute: Arc<dyn ComputePlatform>) -> Self {
        Self { store, compute }
    }

    pub async fn set_mapping(
        &self,
        context_id: &ContextId,
        kind: FailoverKind,
        source_network: &str,
        destination_network_id: &str,
    ) -> CutoverResult<NetworkMapping> {
        let context: Option<VmContext> = self.store.get(CONTEXTS_TABLE, context_id.as_str()).await?;
        if context.is_none() {
            return Err(CutoverError::not_found(format!("context {}", context_id)));
        }
        if source_network.is_empty() {
            return Err(CutoverError::validation("source_network", "must not be empty"));
        }
        let networks = self.compute.list_networks().await?;
        if !networks.iter().any(|n| n.network_id == destination_network_id) {
            return Err(CutoverError::validation(
                "destination_network_id",
                format!("network '{}' does not exist on the destination platform", destination_network_id),
            ));
        }

        let mapping = NetworkMapping {
            context_id: context_id.clone(),
            kind,
            source_network: source_network.to_string(),
            destination_network_id: destination_network_id.to_string(),
            updated_at: Utc::now(),
        };
        self.store
            .put(NETWORK_MAPPINGS_TABLE, &mapping.key(), &mapping)
            .await?;
        info!(context_id = %context_id, %kind, source_network, destination_network_id, "Network mapping set");
        Ok(mapping)
    }

    pub async fn remove_mapping(
        &self,
        context_id: &ContextId,
        kind: FailoverKind,
        source_network: &str,
    ) -> CutoverResult<bool> {
        self.store
            .remove(
                NETWORK_MAPPINGS_TABLE,
                &NetworkMapping::storage_key(context_id, kind, source_network),
            )
            .await
    }

    pub async fn mappings_for(&self, context_id: &ContextId) -> CutoverResult<Vec<NetworkMapping>> {
        self.store
            .scan_prefix(NETWORK_MAPPINGS_TABLE, &storage::context_prefix(context_id))
            .await
    }

    /// Resolve every source network for a failover of `kind`.
    ///
    /// With an override, only the override is consulted and nothing is
    /// persisted. Without one, each source network needs a stored mapping
    /// of exactly this kind.
    pub async fn resolve(
        &self,
        context_id: &ContextId,
        kind: FailoverKind,
        source_networks: &[String],
        network_override: Option<&BTreeMap<String, String>>,
    ) -> CutoverResult<ResolvedNetworks> {
        if let Some(overrides) = network_override {
            let assignments = source_networks
                .iter()
                .map(|source| {
                    overrides
                        .get(source)
                        .map(|dest| (source.clone(), dest.clone()))
                        .ok_or_else(|| {
                            CutoverError::validation(
                                "network_override",
                                format!("override does not cover source network '{}'", source),
                            )
                        })
                })
                .collect::<CutoverResult<Vec<_>>>()?;
            return Ok(ResolvedNetworks {
                strategy: NetworkStrategy::Custom,
                assignments,
            });
        }

        let stored: BTreeMap<String, String> = self
            .mappings_for(context_id)
            .await?
            .into_iter()
            .filter(|m| m.kind == kind)
            .map(|m| (m.source_network, m.destination_network_id))
            .collect();

        let mut assignments = Vec::with_capacity(source_networks.len());
        for source in source_networks {
            let dest = stored.get(source).ok_or_else(|| {
                CutoverError::validation(
                    "network_mapping",
                    format!(
                        "no {} network mapping for source network '{}' of context {}",
                        kind, source, context_id
                    ),
                )
            })?;
            assignments.push((source.clone(), dest.clone()));
        }
        Ok(ResolvedNetworks {
            strategy: NetworkStrategy::default_for(kind),
            assignments,
        })
    }

    /// Each source network with its current mapping for `kind` and the
    /// destination networks it could use; test failovers list isolated
    /// networks first
    pub async fn get_network_config_options(
        &self,
        context_id: &ContextId,
        kind: FailoverKind,
    ) -> CutoverResult<Vec<NetworkConfigOption>> {
        let context: VmContext = self
            .store
            .get(CONTEXTS_TABLE, context_id.as_str())
            .await?
            .ok_or_else(|| CutoverError::not_found(format!("context {}", context_id)))?;
        let stored: BTreeMap<String, String> = self
            .mappings_for(context_id)
            .await?
            .into_iter()
            .filter(|m| m.kind == kind)
            .map(|m| (m.source_network, m.destination_network_id))
            .collect();

        let mut candidates = self.compute.list_networks().await?;
        candidates.sort_by(|a, b| {
            let rank = |n: &NetworkInfo| match kind {
                FailoverKind::Test => !n.isolated,
                FailoverKind::Live => n.isolated,
            };
            rank(a).cmp(&rank(b)).then_with(|| a.name.cmp(&b.name))
        });

        Ok(context
            .source_spec
            .networks
            .iter()
            .map(|source| NetworkConfigOption {
                source_network: source.clone(),
                current_destination: stored.get(source).cloned(),
                candidates: candidates.clone(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextRegistry;
    use crate::platform::SimulatedPlatform;
    use crate::types::SourceSpec;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, NetworkResolver, ContextId) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("net.redb")).unwrap();
        let platform = Arc::new(SimulatedPlatform::new("appliance", "host"));
        platform.add_network("net-prod", "production", false);
        platform.add_network("net-iso", "isolated", true);
        let registry = ContextRegistry::new(store.clone());
        let context_id = ContextId::new("ctx-net");
        registry
            .register_context(
                context_id.clone(),
                "vm-1",
                "web01",
                SourceSpec {
                    networks: vec!["VM Network".into()],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        (dir, NetworkResolver::new(store, platform), context_id)
    }

    #[tokio::test]
    async fn test_resolution_is_kind_specific() {
        let (_dir, resolver, ctx) = setup().await;
        resolver
            .set_mapping(&ctx, FailoverKind::Live, "VM Network", "net-prod")
            .await
            .unwrap();
        let sources = vec!["VM Network".to_string()];

        let live = resolver.resolve(&ctx, FailoverKind::Live, &sources, None).await.unwrap();
        assert_eq!(live.strategy, NetworkStrategy::Production);
        assert_eq!(live.destination_ids(), vec!["net-prod".to_string()]);

        let err = resolver
            .resolve(&ctx, FailoverKind::Test, &sources, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CutoverError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_override_is_not_persisted() {
        let (_dir, resolver, ctx) = setup().await;
        let mut overrides = BTreeMap::new();
        overrides.insert("VM Network".to_string(), "net-iso".to_string());
        let sources = vec!["VM Network".to_string()];
        let resolved = resolver
            .resolve(&ctx, FailoverKind::Test, &sources, Some(&overrides))
            .await
            .unwrap();
        assert_eq!(resolved.strategy, NetworkStrategy::Custom);
        assert!(resolver.mappings_for(&ctx).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_destination_rejected() {
        let (_dir, resolver, ctx) = setup().await;
        assert!(resolver
            .set_mapping(&ctx, FailoverKind::Test, "VM Network", "net-missing")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_config_options_prefer_isolated_for_test() {
        let (_dir, resolver, ctx) = setup().await;
        resolver
            .set_mapping(&ctx, FailoverKind::Test, "VM Network", "net-iso")
            .await
            .unwrap();
        let options = resolver
            .get_network_config_options(&ctx, FailoverKind::Test)
            .await
            .unwrap();
        assert_eq!(options.len(), 1);
        assert_eq!(options[0].current_destination.as_deref(), Some("net-iso"));
        assert!(options[0].candidates[0].isolated);
    }
}
