//! Volume to device correlation
//!
//! Holds the persisted volume → observed device mapping and the pure
//! before/after inventory diff used to discover a freshly attached
//! device. Only the volume authority writes mappings.

use std::collections::HashSet;

use crate::error::CutoverResult;
use crate::platform::BlockDevice;
use crate::storage::{Store, DEVICE_MAPPINGS_TABLE};
use crate::types::{ContextId, VolumeDeviceMapping, VolumeId};

/// Result of diffing two host inventories for one volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Correlation {
    Found(BlockDevice),
    /// New devices appeared but none can be tied to the volume yet
    Ambiguous(usize),
    NoNewDevice,
}

/// Find the device a volume received between two inventory reads.
///
/// A device is new when its (path, serial) pair was not listed before, so a
/// path reused while the previous device still lingered in the baseline
/// counts once its serial changes. A new device whose serial equals the
/// volume's virtio serial always wins.
/// Without a serial match, a single new device that reports no serial is
/// accepted; anything else is ambiguous and the caller keeps polling.
pub fn correlate(before: &[BlockDevice], after: &[BlockDevice], volume_id: &VolumeId) -> Correlation {
    let known: HashSet<(&str, Option<&str>)> = before
        .iter()
        .map(|d| (d.path.as_str(), d.serial.as_deref()))
        .collect();
    let new: Vec<&BlockDevice> = after
        .iter()
        .filter(|d| !known.contains(&(d.path.as_str(), d.serial.as_deref())))
        .collect();

    if new.is_empty() {
        return Correlation::NoNewDevice;
    }

    let serial = volume_id.virtio_serial();
    if let Some(device) = new.iter().find(|d| d.serial.as_deref() == Some(serial.as_str())) {
        return Correlation::Found((*device).clone());
    }

    match new.as_slice() {
        [only] if only.serial.is_none() => Correlation::Found((*only).clone()),
        _ => Correlation::Ambiguous(new.len()),
    }
}

/// Find a volume's device in a single inventory by serial alone
pub fn find_by_serial<'a>(devices: &'a [BlockDevice], volume_id: &VolumeId) -> Option<&'a BlockDevice> {
    let serial = volume_id.virtio_serial();
    devices
        .iter()
        .find(|d| d.serial.as_deref() == Some(serial.as_str()))
}

/// Persisted device mappings, keyed by volume id
#[derive(Debug, Clone)]
pub struct DeviceMappingStore {
    store: Store,
}

impl DeviceMappingStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn get(&self, volume_id: &VolumeId) -> CutoverResult<Option<VolumeDeviceMapping>> {
        self.store.get(DEVICE_MAPPINGS_TABLE, volume_id.as_str()).await
    }

    pub async fn list(&self) -> CutoverResult<Vec<VolumeDeviceMapping>> {
        self.store.list(DEVICE_MAPPINGS_TABLE).await
    }

    pub async fn list_for_owner(&self, owner_vm_id: &str) -> CutoverResult<Vec<VolumeDeviceMapping>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|m| m.owner_vm_id == owner_vm_id)
            .collect())
    }

    pub async fn list_for_context(&self, context_id: &ContextId) -> CutoverResult<Vec<VolumeDeviceMapping>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|m| m.context_id.as_ref() == Some(context_id))
            .collect())
    }

    pub(crate) async fn upsert(&self, mapping: &VolumeDeviceMapping) -> CutoverResult<()> {
        self.store
            .put(DEVICE_MAPPINGS_TABLE, mapping.volume_id.as_str(), mapping)
            .await
    }

    pub(crate) async fn remove(&self, volume_id: &VolumeId) -> CutoverResult<bool> {
        self.store
            .remove(DEVICE_MAPPINGS_TABLE, volume_id.as_str())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn device(path: &str, serial: Option<&str>) -> BlockDevice {
        BlockDevice {
            path: path.to_string(),
            size_bytes: 1 << 30,
            serial: serial.map(str::to_string),
        }
    }

    #[test]
    fn test_serial_match_wins_over_other_new_devices() {
        let volume = VolumeId::new("b3bb9310-1b59-4f62-97e8-cefffdfe3804");
        let before = vec![device("/dev/vda", None)];
        let after = vec![
            device("/dev/vda", None),
            device("/dev/vdb", Some("ffffffffffffffffffff")),
            device("/dev/vdc", Some("b3bb93101b594f6297e8")),
        ];
        assert_eq!(
            correlate(&before, &after, &volume),
            Correlation::Found(device("/dev/vdc", Some("b3bb93101b594f6297e8")))
        );
    }

    #[test]
    fn test_single_serialless_device_is_accepted() {
        let volume = VolumeId::new("vol-1");
        let after = vec![device("/dev/vdq", None)];
        assert_eq!(
            correlate(&[], &after, &volume),
            Correlation::Found(device("/dev/vdq", None))
        );
    }

    #[test]
    fn test_foreign_serial_is_ambiguous() {
        let volume = VolumeId::new("vol-1");
        let after = vec![device("/dev/vdq", Some("someoneelse"))];
        assert_eq!(correlate(&[], &after, &volume), Correlation::Ambiguous(1));
        assert_eq!(correlate(&after, &after, &volume), Correlation::NoNewDevice);
    }

    #[test]
    fn test_reused_path_with_new_serial_is_found() {
        let old = VolumeId::new("0f7a2c4e-9d1b-4e55-8a60-1c2d3e4f5a6b");
        let volume = VolumeId::new("7be1d0c2-44aa-4b8e-9f31-a2b3c4d5e6f7");
        let before = vec![
            device("/dev/vda", None),
            device("/dev/vdb", Some(old.virtio_serial().as_str())),
        ];
        let after = vec![
            device("/dev/vda", None),
            device("/dev/vdb", Some(volume.virtio_serial().as_str())),
        ];
        assert_eq!(
            correlate(&before, &after, &volume),
            Correlation::Found(device("/dev/vdb", Some(volume.virtio_serial().as_str())))
        );
    }

    proptest! {
        #[test]
        fn prop_found_device_is_new(letters in proptest::collection::hash_set(b'b'..=b'z', 1..10)) {
            let volume = VolumeId::new("c0ffee00-0000-4000-8000-000000000001");
            let mut paths: Vec<String> = letters.iter().map(|l| format!("/dev/vd{}", *l as char)).collect();
            paths.sort();
            let target = paths.pop().unwrap();
            let before: Vec<BlockDevice> = paths.iter().map(|p| device(p, Some("other"))).collect();
            let mut after = before.clone();
            after.push(device(&target, Some(volume.virtio_serial().as_str())));
            match correlate(&before, &after, &volume) {
                Correlation::Found(found) => prop_assert_eq!(found.path, target),
                other => prop_assert!(false, "unexpected {:?}", other),
            }
        }

        #[test]
        fn prop_virtio_serial_is_hyphenless_prefix(id in "[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}") {
            let serial = VolumeId::new(id.clone()).virtio_serial();
            prop_assert_eq!(serial.len(), 20);
            prop_assert!(!serial.contains('-'));
            prop_assert!(id.replace('-', "").starts_with(&serial));
        }
    }
}
