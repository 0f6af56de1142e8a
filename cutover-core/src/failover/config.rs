//! Failover behavior resolution
//!
//! Callers supply identity and kind plus optional overrides; the resolver
//! produces the one explicitly typed behavior value the engine executes.
//! Behavior values are never assembled by hand at call sites.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{CutoverError, CutoverResult};
use crate::types::{ContextId, FailoverKind};

/// Mandatory identity of a failover request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailoverRequest {
    pub context_id: ContextId,
    pub kind: FailoverKind,
}

impl FailoverRequest {
    pub fn new(context_id: ContextId, kind: FailoverKind) -> Self {
        Self { context_id, kind }
    }
}

/// Optional per-request toggles; `None` keeps the kind's default
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub power_off_source: Option<bool>,
    pub perform_final_sync: Option<bool>,
    pub snapshots: Option<bool>,
    pub cleanup_enabled: Option<bool>,
    pub skip_validation: bool,
    pub skip_driver_injection: bool,
    /// Explicit source → destination network mapping for this run only
    pub network_override: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmNaming {
    Exact,
    SuffixedWithTimestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotPolicy {
    None,
    Enabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkStrategy {
    Production,
    Isolated,
    Custom,
}

impl NetworkStrategy {
    pub fn default_for(kind: FailoverKind) -> Self {
        match kind {
            FailoverKind::Live => NetworkStrategy::Production,
            FailoverKind::Test => NetworkStrategy::Isolated,
        }
    }
}

/// Fully resolved behavior of one failover run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverBehavior {
    pub kind: FailoverKind,
    pub vm_naming: VmNaming,
    pub snapshot_policy: SnapshotPolicy,
    pub network_strategy: NetworkStrategy,
    pub power_off_source: bool,
    pub perform_final_sync: bool,
    pub skip_validation: bool,
    pub skip_driver_injection: bool,
    pub cleanup_enabled: bool,
    pub network_override: Option<BTreeMap<String, String>>,
    pub requested_at: DateTime<Utc>,
}

impl FailoverBehavior {
    /// Name of the destination VM for a source VM name
    pub fn destination_vm_name(&self, source_name: &str) -> String {
        match self.vm_naming {
            VmNaming::Exact => source_name.to_string(),
            VmNaming::SuffixedWithTimestamp => {
                format!("{}-test-{}", source_name, self.requested_at.timestamp())
            }
        }
    }

    /// Snapshot name for one disk; unique per disk key within a run
    pub fn snapshot_name(&self, source_name: &str, disk_key: u32) -> String {
        format!(
            "{}-failover-{}-{}-{}",
            self.kind,
            source_name,
            self.requested_at.timestamp(),
            disk_key
        )
    }

    pub fn snapshots_enabled(&self) -> bool {
        self.snapshot_policy == SnapshotPolicy::Enabled
    }
}

/// Resolve a request and its overrides into a validated behavior
pub fn resolve_behavior(
    request: &FailoverRequest,
    overrides: ConfigOverrides,
    now: DateTime<Utc>,
) -> CutoverResult<FailoverBehavior> {
    let kind = request.kind;
    let (default_power_off, default_final_sync) = match kind {
        FailoverKind::Live => (true, true),
        FailoverKind::Test => (false, false),
    };

    let power_off_source = overrides.power_off_source.unwrap_or(default_power_off);
    let perform_final_sync = overrides.perform_final_sync.unwrap_or(default_final_sync);
    let snapshot_policy = match overrides.snapshots.unwrap_or(true) {
        true => SnapshotPolicy::Enabled,
        false => SnapshotPolicy::None,
    };
    let cleanup_enabled = overrides.cleanup_enabled.unwrap_or(true);
    let network_strategy = if overrides.network_override.is_some() {
        NetworkStrategy::Custom
    } else {
        NetworkStrategy::default_for(kind)
    };
    let vm_naming = match kind {
        FailoverKind::Live => VmNaming::Exact,
        FailoverKind::Test => VmNaming::SuffixedWithTimestamp,
    };

    let behavior = FailoverBehavior {
        kind,
        vm_naming,
        snapshot_policy,
        network_strategy,
        power_off_source,
        perform_final_sync,
        skip_validation: overrides.skip_validation,
        skip_driver_injection: overrides.skip_driver_injection,
        cleanup_enabled,
        network_override: overrides.network_override,
        requested_at: now,
    };
    validate_behavior(&behavior)?;
    Ok(behavior)
}

fn validate_behavior(behavior: &FailoverBehavior) -> CutoverResult<()> {
    match behavior.kind {
        FailoverKind::Live => {
            if behavior.perform_final_sync && !behavior.power_off_source {
                return Err(CutoverError::validation(
                    "perform_final_sync",
                    "final sync requires the source VM to be powered off first",
                ));
            }
        }
        FailoverKind::Test => {
            if behavior.power_off_source {
                return Err(CutoverError::validation(
                    "power_off_source",
                    "test failover never powers off the source VM",
                ));
            }
            if behavior.perform_final_sync {
                return Err(CutoverError::validation(
                    "perform_final_sync",
                    "test failover cannot perform a final sync",
                ));
            }
            if !behavior.snapshots_enabled() {
                return Err(CutoverError::validation(
                    "snapshot_policy",
                    "test failover requires snapshots so the volumes can be reverted",
                ));
            }
            if !behavior.cleanup_enabled {
                return Err(CutoverError::validation(
                    "cleanup_enabled",
                    "test failover must remain cleanup-eligible",
                ));
            }
        }
    }

    if let Some(mapping) = &behavior.network_override {
        if mapping.is_empty() {
            return Err(CutoverError::validation(
                "network_override",
                "override was supplied but maps no networks",
            ));
        }
        if let Some((source, _)) = mapping.iter().find(|(_, dest)| dest.is_empty()) {
            return Err(CutoverError::validation(
                "network_override",
                format!("source network '{}' maps to an empty destination", source),
            ));
        }
    }
    Ok(())
}

/// Options for rolling back a failover
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackOptions {
    /// Live only: power the source VM back on after cleanup
    pub power_on_source: bool,
    /// Continue past failed steps, and allow rollback of jobs without cleanup enabled
    pub force_cleanup: bool,
    /// Revert volumes to the failover snapshots before deleting them
    pub revert_snapshots: bool,
}

impl RollbackOptions {
    pub fn for_kind(kind: FailoverKind) -> Self {
        Self {
            power_on_source: kind == FailoverKind::Live,
            force_cleanup: false,
            revert_snapshots: true,
        }
    }

    pub fn validate(&self, kind: FailoverKind) -> CutoverResult<()> {
        if self.power_on_source && kind == FailoverKind::Test {
            return Err(CutoverError::validation(
                "power_on_source",
                "the source VM is never powered off by a test failover",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn request(kind: FailoverKind) -> FailoverRequest {
        FailoverRequest::new(ContextId::new("ctx-1"), kind)
    }

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_live_defaults() {
        let behavior =
            resolve_behavior(&request(FailoverKind::Live), ConfigOverrides::default(), now())
                .unwrap();
        assert_eq!(behavior.vm_naming, VmNaming::Exact);
        assert_eq!(behavior.network_strategy, NetworkStrategy::Production);
        assert!(behavior.power_off_source);
        assert!(behavior.perform_final_sync);
        assert!(behavior.cleanup_enabled);
        assert_eq!(behavior.destination_vm_name("pgtest1"), "pgtest1");
    }

    #[test]
    fn test_test_defaults() {
        let behavior =
            resolve_behavior(&request(FailoverKind::Test), ConfigOverrides::default(), now())
                .unwrap();
        assert_eq!(behavior.network_strategy, NetworkStrategy::Isolated);
        assert!(behavior.snapshots_enabled());
        assert!(!behavior.power_off_source);
        assert_eq!(
            behavior.destination_vm_name("pgtest1"),
            "pgtest1-test-1700000000"
        );
    }

    #[test]
    fn test_test_failover_rejects_power_off() {
        let overrides = ConfigOverrides {
            power_off_source: Some(true),
            ..Default::default()
        };
        let err = resolve_behavior(&request(FailoverKind::Test), overrides, now()).unwrap_err();
        assert!(matches!(err, CutoverError::Validation { ref field, .. } if field == "power_off_source"));
    }

    #[test]
    fn test_test_failover_requires_snapshots() {
        let overrides = ConfigOverrides {
            snapshots: Some(false),
            ..Default::default()
        };
        assert!(resolve_behavior(&request(FailoverKind::Test), overrides, now()).is_err());
    }

    #[test]
    fn test_final_sync_requires_power_off() {
        let overrides = ConfigOverrides {
            power_off_source: Some(false),
            ..Default::default()
        };
        let err = resolve_behavior(&request(FailoverKind::Live), overrides, now()).unwrap_err();
        assert!(err.to_string().contains("perform_final_sync"));

        let overrides = ConfigOverrides {
            power_off_source: Some(false),
            perform_final_sync: Some(false),
            ..Default::default()
        };
        assert!(resolve_behavior(&request(FailoverKind::Live), overrides, now()).is_ok());
    }

    #[test]
    fn test_network_override_selects_custom_strategy() {
        let mut mapping = BTreeMap::new();
        mapping.insert("VM Network".to_string(), "net-42".to_string());
        let overrides = ConfigOverrides {
            network_override: Some(mapping),
            ..Default::default()
        };
        let behavior = resolve_behavior(&request(FailoverKind::Test), overrides, now()).unwrap();
        assert_eq!(behavior.network_strategy, NetworkStrategy::Custom);
    }

    #[test]
    fn test_snapshot_names_are_unique_per_disk() {
        let behavior =
            resolve_behavior(&request(FailoverKind::Test), ConfigOverrides::default(), now())
                .unwrap();
        assert_ne!(
            behavior.snapshot_name("vm", 2000),
            behavior.snapshot_name("vm", 2001)
        );
    }

    #[test]
    fn test_rollback_defaults() {
        assert!(RollbackOptions::for_kind(FailoverKind::Live).power_on_source);
        assert!(!RollbackOptions::for_kind(FailoverKind::Test).power_on_source);
        let options = RollbackOptions {
            power_on_source: true,
            ..RollbackOptions::for_kind(FailoverKind::Test)
        };
        assert!(options.validate(FailoverKind::Test).is_err());
    }
}
