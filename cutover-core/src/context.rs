//! VM replication contexts and their disk descriptors
//!
//! Contexts are written by discovery and replication; the failover engine
//! reads them and moves their status. A disk descriptor's internal id is
//! assigned once, on first sight of its `(context, disk key)`, and every
//! later replication cycle only touches the mutable fields.

use chrono::Utc;
use tracing::{debug, info};

use crate::error::{CutoverError, CutoverResult};
use crate::storage::{self, Store, CONTEXTS_TABLE, DISKS_TABLE};
use crate::types::{
    ContextId, ContextStatus, DiskDescriptor, DiskId, DiskUpdate, SourceSpec, VmContext,
};

#[derive(Debug, Clone)]
pub struct ContextRegistry {
    store: Store,
}

impl ContextRegistry {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Register a newly discovered source VM
    pub async fn register_context(
        &self,
        context_id: ContextId,
        source_vm_id: &str,
        name: &str,
        source_spec: SourceSpec,
    ) -> CutoverResult<VmContext> {
        if context_id.as_str().is_empty() || context_id.as_str().contains('/') {
            return Err(CutoverError::validation(
                "context_id",
                "must be non-empty and must not contain '/'",
            ));
        }
        if name.is_empty() {
            return Err(CutoverError::validation("name", "must not be empty"));
        }
        if let Some(existing) = self.get_context(&context_id).await? {
            if existing.source_vm_id != source_vm_id {
                return Err(CutoverError::validation(
                    "source_vm_id",
                    format!(
                        "context {} already tracks source VM {}",
                        context_id, existing.source_vm_id
                    ),
                ));
            }
            return Ok(existing);
        }

        let now = Utc::now();
        let context = VmContext {
            context_id: context_id.clone(),
            source_vm_id: source_vm_id.to_string(),
            name: name.to_string(),
            status: ContextStatus::Discovered,
            source_spec,
            last_job_id: None,
            created_at: now,
            updated_at: now,
        };
        self.store
            .put(CONTEXTS_TABLE, context_id.as_str(), &context)
            .await?;
        info!(context_id = %context_id, source_vm_id, name, "Registered VM context");
        Ok(context)
    }

    pub async fn get_context(&self, context_id: &ContextId) -> CutoverResult<Option<VmContext>> {
        self.store.get(CONTEXTS_TABLE, context_id.as_str()).await
    }

    pub async fn require_context(&self, context_id: &ContextId) -> CutoverResult<VmContext> {
        self.get_context(context_id)
            .await?
            .ok_or_else(|| CutoverError::not_found(format!("context {}", context_id)))
    }

    pub async fn list_contexts(&self) -> CutoverResult<Vec<VmContext>> {
        self.store.list(CONTEXTS_TABLE).await
    }

    pub async fn set_status(
        &self,
        context_id: &ContextId,
        status: ContextStatus,
    ) -> CutoverResult<VmContext> {
        let mut context = self.require_context(context_id).await?;
        if context.status != status {
            debug!(context_id = %context_id, from = %context.status, to = %status, "Context status change");
        }
        context.status = status;
        context.updated_at = Utc::now();
        self.store
            .put(CONTEXTS_TABLE, context_id.as_str(), &context)
            .await?;
        Ok(context)
    }

    /// Insert or update the descriptor for `(context, update.disk_key)`.
    ///
    /// An existing descriptor keeps its internal id.
    pub async fn upsert_disk(
        &self,
        context_id: &ContextId,
        update: DiskUpdate,
    ) -> CutoverResult<DiskDescriptor> {
        self.require_context(context_id).await?;
        let key = storage::disk_key(context_id, update.disk_key);
        let existing: Option<DiskDescriptor> = self.store.get(DISKS_TABLE, &key).await?;

        let descriptor = match existing {
            Some(mut disk) => {
                disk.size_gb = update.size_gb;
                if update.change_marker.is_some() {
                    disk.change_marker = update.change_marker;
                }
                if update.volume_id.is_some() {
                    disk.volume_id = update.volume_id;
                }
                disk.updated_at = Utc::now();
                disk
            }
            None => DiskDescriptor {
                disk_id: DiskId::new(),
                context_id: context_id.clone(),
                disk_key: update.disk_key,
                size_gb: update.size_gb,
                change_marker: update.change_marker,
                volume_id: update.volume_id,
                updated_at: Utc::now(),
            },
        };
        self.store.put(DISKS_TABLE, &key, &descriptor).await?;
        Ok(descriptor)
    }

    pub async fn record_change_marker(
        &self,
        context_id: &ContextId,
        disk_key: u32,
        change_marker: &str,
    ) -> CutoverResult<DiskDescriptor> {
        let key = storage::disk_key(context_id, disk_key);
        let mut disk: DiskDescriptor = self
            .store
            .get(DISKS_TABLE, &key)
            .await?
            .ok_or_else(|| {
                CutoverError::not_found(format!("disk {} of context {}", disk_key, context_id))
            })?;
        disk.change_marker = Some(change_marker.to_string());
        disk.updated_at = Utc::now();
        self.store.put(DISKS_TABLE, &key, &disk).await?;
        Ok(disk)
    }

    /// Disks of a context, ordered by hypervisor disk key
    pub async fn disks_for_context(&self, context_id: &ContextId) -> CutoverResult<Vec<DiskDescriptor>> {
        let mut disks: Vec<DiskDescriptor> = self
            .store
            .scan_prefix(DISKS_TABLE, &storage::context_prefix(context_id))
            .await?;
        disks.sort_by_key(|d| d.disk_key);
        Ok(disks)
    }

    /// Remove a context with its disks, network mappings and device mappings
    pub async fn decommission_context(&self, context_id: &ContextId) -> CutoverResult<()> {
        self.store.decommission_context(context_id).await
    }
}
