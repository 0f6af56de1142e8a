//! Snapshot manager
//!
//! Thin wrapper over the platform's per-volume snapshot primitive with
//! bounded waits. Multi-disk all-or-nothing handling belongs to the
//! failover engine.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::common::{poll_until, with_timeout};
use crate::config::CutoverConfig;
use crate::error::{CutoverError, CutoverResult};
use crate::platform::{SnapshotInfo, SnapshotPlatform, SnapshotState};
use crate::types::VolumeId;

#[derive(Clone)]
pub struct SnapshotManager {
    snapshots: Arc<dyn SnapshotPlatform>,
    timeout: Duration,
    poll_interval: Duration,
}

impl std::fmt::Debug for SnapshotManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotManager")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl SnapshotManager {
    pub fn new(snapshots: Arc<dyn SnapshotPlatform>, config: &CutoverConfig) -> Self {
        Self {
            snapshots,
            timeout: config.timeouts.snapshot,
            poll_interval: config.polling.volume_operation_interval,
        }
    }

    /// Snapshot a volume and wait until the platform reports it backed up
    pub async fn create(&self, volume_id: &VolumeId, name: &str) -> CutoverResult<SnapshotInfo> {
        let created = with_timeout(
            self.snapshots.create_snapshot(volume_id, name),
            self.timeout,
            "create snapshot",
        )
        .await??;

        let snapshots = &self.snapshots;
        let snapshot_id = created.snapshot_id.as_str();
        let ready = poll_until(
            &format!("snapshot {} of volume {}", snapshot_id, volume_id),
            self.timeout,
            self.poll_interval,
            || async move {
                let info = snapshots
                    .get_snapshot(snapshot_id)
                    .await?
                    .ok_or_else(|| CutoverError::not_found(format!("snapshot {}", snapshot_id)))?;
                match info.state {
                    SnapshotState::BackedUp => Ok(Some(info)),
                    SnapshotState::Creating => Ok(None),
                    SnapshotState::Error => Err(CutoverError::platform_failed(
                        "create snapshot",
                        format!("snapshot {} entered error state", snapshot_id),
                    )),
                }
            },
        )
        .await?;
        info!(volume_id = %volume_id, snapshot_id = %ready.snapshot_id, name, "Snapshot ready");
        Ok(ready)
    }

    pub async fn list(&self, volume_id: &VolumeId) -> CutoverResult<Vec<SnapshotInfo>> {
        with_timeout(
            self.snapshots.list_snapshots(volume_id),
            self.timeout,
            "list snapshots",
        )
        .await?
    }

    pub async fn exists(&self, snapshot_id: &str) -> CutoverResult<bool> {
        let found = with_timeout(
            self.snapshots.get_snapshot(snapshot_id),
            self.timeout,
            "get snapshot",
        )
        .await??;
        Ok(found.is_some())
    }

    /// Revert a volume to a snapshot; the volume must not back a running VM
    pub async fn revert(&self, snapshot_id: &str) -> CutoverResult<()> {
        with_timeout(
            self.snapshots.revert_snapshot(snapshot_id),
            self.timeout,
            "revert snapshot",
        )
        .await??;
        info!(snapshot_id, "Reverted volume to snapshot");
        Ok(())
    }

    /// Delete a snapshot; returns false when it was already gone
    pub async fn delete(&self, snapshot_id: &str) -> CutoverResult<bool> {
        match with_timeout(
            self.snapshots.delete_snapshot(snapshot_id),
            self.timeout,
            "delete snapshot",
        )
        .await?
        {
            Ok(()) => {
                info!(snapshot_id, "Deleted snapshot");
                Ok(true)
            }
            Err(e) if e.is_not_found() => {
                debug!(snapshot_id, "Snapshot already deleted");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{SimulatedPlatform, VolumePlatform};

    #[tokio::test]
    async fn test_create_and_idempotent_delete() {
        let platform = Arc::new(SimulatedPlatform::new("appliance", "host"));
        let manager = SnapshotManager::new(platform.clone(), &CutoverConfig::default());
        let volume = platform.create_volume("d", 1).await.unwrap().volume_id;

        let snapshot = manager.create(&volume, "test-failover-vm-1-2000").await.unwrap();
        assert_eq!(snapshot.state, SnapshotState::BackedUp);
        assert_eq!(manager.list(&volume).await.unwrap().len(), 1);

        assert!(manager.delete(&snapshot.snapshot_id).await.unwrap());
        assert!(!manager.delete(&snapshot.snapshot_id).await.unwrap());
        assert!(!manager.exists(&snapshot.snapshot_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_injected_failure_propagates() {
        let platform = Arc::new(SimulatedPlatform::new("appliance", "host"));
        let manager = SnapshotManager::new(platform.clone(), &CutoverConfig::default());
        let volume = platform.create_volume("d", 1).await.unwrap().volume_id;
        let failing = volume.clone();
        platform.inject(move |f| {
            f.fail_snapshot_for.insert(failing);
        });
        assert!(manager.create(&volume, "snap").await.is_err());
    }
}
