//! Durable state in redb
//!
//! Every table maps a string key to a bincode-encoded value. Calls run on the
//! blocking pool so async callers never stall the runtime on disk I/O.
//! Multi-entity invariants (single active job per context, terminal status
//! releasing the context, cascading decommission) are each enforced inside
//! one write transaction.

use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{CutoverError, CutoverResult};
use crate::failover::job::FailoverJob;
use crate::types::{ContextId, ContextStatus, DiskDescriptor, JobId, VmContext};

pub const CONTEXTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("contexts");
/// Key: `<context>/<disk key, zero padded>`
pub const DISKS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("disks");
/// Key: volume id
pub const DEVICE_MAPPINGS_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("device_mappings");
pub const VOLUME_OPERATIONS_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("volume_operations");
pub const FAILOVER_JOBS_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("failover_jobs");
/// Key: context id, value: id of the context's non-terminal job
pub const ACTIVE_JOBS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("active_jobs");
/// Key: `<context>/<kind>/<source network>`
pub const NETWORK_MAPPINGS_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("network_mappings");
/// Key: `<job id>/<sequence, zero padded>`
pub const JOB_STEPS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("job_steps");

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

pub fn disk_key(context_id: &ContextId, disk_key: u32) -> String {
    format!("{}/{:010}", context_id, disk_key)
}

pub fn context_prefix(context_id: &ContextId) -> String {
    format!("{}/", context_id)
}

/// Handle to the cutover database
#[derive(Clone)]
pub struct Store {
    database: Arc<Database>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Open or create the database and make sure every table exists
    pub fn open(path: &Path) -> CutoverResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let database = Arc::new(Database::create(path)?);
        init_database_tables(&database)?;
        info!(path = %path.display(), "Opened cutover database");
        Ok(Self { database })
    }

    pub fn from_database(database: Arc<Database>) -> CutoverResult<Self> {
        init_database_tables(&database)?;
        Ok(Self { database })
    }

    async fn blocking<T, F>(&self, f: F) -> CutoverResult<T>
    where
        F: FnOnce(&Database) -> CutoverResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.database.clone();
        tokio::task::spawn_blocking(move || f(&db)).await?
    }

    pub async fn put<T>(&self, table: Table, key: &str, value: &T) -> CutoverResult<()>
    where
        T: Serialize,
    {
        let key = key.to_string();
        let bytes = bincode::serialize(value)?;
        self.blocking(move |db| {
            let write_txn = db.begin_write()?;
            {
                let mut t = write_txn.open_table(table)?;
                t.insert(key.as_str(), bytes.as_slice())?;
            }
            write_txn.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn get<T>(&self, table: Table, key: &str) -> CutoverResult<Option<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let key = key.to_string();
        self.blocking(move |db| {
            let read_txn = db.begin_read()?;
            let t = read_txn.open_table(table)?;
            match t.get(key.as_str())? {
                Some(bytes) => Ok(Some(bincode::deserialize(bytes.value())?)),
                None => Ok(None),
            }
        })
        .await
    }

    /// Remove a key; returns whether it existed
    pub async fn remove(&self, table: Table, key: &str) -> CutoverResult<bool> {
        let key = key.to_string();
        self.blocking(move |db| {
            let write_txn = db.begin_write()?;
            let existed = {
                let mut t = write_txn.open_table(table)?;
                let removed = t.remove(key.as_str())?;
                removed.is_some()
            };
            write_txn.commit()?;
            Ok(existed)
        })
        .await
    }

    /// All values whose key starts with `prefix`, in key order
    pub async fn scan_prefix<T>(&self, table: Table, prefix: &str) -> CutoverResult<Vec<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let prefix = prefix.to_string();
        self.blocking(move |db| {
            let read_txn = db.begin_read()?;
            let t = read_txn.open_table(table)?;
            let mut values = Vec::new();
            for entry in t.range::<&str>(prefix.as_str()..)? {
                let (key, bytes) = entry?;
                if !key.value().starts_with(prefix.as_str()) {
                    break;
                }
                values.push(bincode::deserialize(bytes.value())?);
            }
            Ok(values)
        })
        .await
    }

    pub async fn list<T>(&self, table: Table) -> CutoverResult<Vec<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.scan_prefix(table, "").await
    }

    // Job lifecycle

    /// Persist a new job and mark it active for its context.
    ///
    /// The active-job check and both writes happen in one write
    /// transaction; redb serializes write transactions, so two concurrent
    /// admissions for the same context cannot both pass the check.
    pub async fn admit_job(&self, job: &FailoverJob) -> CutoverResult<()> {
        let job = job.clone();
        self.blocking(move |db| {
            let write_txn = db.begin_write()?;
            let context_key = job.context_id.to_string();
            let job_key = job.job_id.to_string();

            if let Some(active) = active_job_in(&write_txn, &context_key)? {
                return Err(CutoverError::job_already_active(context_key, active));
            }

            {
                let mut contexts = write_txn.open_table(CONTEXTS_TABLE)?;
                let mut context: VmContext = match contexts.get(context_key.as_str())? {
                    Some(bytes) => bincode::deserialize(bytes.value())?,
                    None => return Err(CutoverError::not_found(format!("context {}", context_key))),
                };
                context.last_job_id = Some(job.job_id);
                context.updated_at = chrono::Utc::now();
                let bytes = bincode::serialize(&context)?;
                contexts.insert(context_key.as_str(), bytes.as_slice())?;
            }
            {
                let bytes = bincode::serialize(&job)?;
                let mut jobs = write_txn.open_table(FAILOVER_JOBS_TABLE)?;
                jobs.insert(job_key.as_str(), bytes.as_slice())?;
                let mut active = write_txn.open_table(ACTIVE_JOBS_TABLE)?;
                active.insert(context_key.as_str(), job_key.as_bytes())?;
            }
            write_txn.commit()?;
            debug!(job_id = %job.job_id, context_id = %job.context_id, "Admitted job");
            Ok(())
        })
        .await
    }

    pub async fn save_job(&self, job: &FailoverJob) -> CutoverResult<()> {
        self.put(FAILOVER_JOBS_TABLE, &job.job_id.to_string(), job)
            .await
    }

    pub async fn get_job(&self, job_id: JobId) -> CutoverResult<Option<FailoverJob>> {
        self.get(FAILOVER_JOBS_TABLE, &job_id.to_string()).await
    }

    pub async fn list_jobs(&self) -> CutoverResult<Vec<FailoverJob>> {
        self.list(FAILOVER_JOBS_TABLE).await
    }

    /// Jobs of a context, oldest first
    pub async fn jobs_for_context(&self, context_id: &ContextId) -> CutoverResult<Vec<FailoverJob>> {
        let mut jobs: Vec<FailoverJob> = self
            .list_jobs()
            .await?
            .into_iter()
            .filter(|j| &j.context_id == context_id)
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    pub async fn active_job(&self, context_id: &ContextId) -> CutoverResult<Option<JobId>> {
        let key = context_id.to_string();
        self.blocking(move |db| {
            let read_txn = db.begin_read()?;
            let active = read_txn.open_table(ACTIVE_JOBS_TABLE)?;
            match active.get(key.as_str())? {
                Some(bytes) => Ok(Some(parse_job_id(bytes.value())?)),
                None => Ok(None),
            }
        })
        .await
    }

    /// Write a terminal job, release its context and optionally move the
    /// context to a new status, all in one transaction
    pub async fn finish_job(
        &self,
        job: &FailoverJob,
        context_status: Option<ContextStatus>,
    ) -> CutoverResult<()> {
        if !job.status.is_terminal() {
            return Err(CutoverError::internal(format!(
                "finish_job called for non-terminal job {} ({})",
                job.job_id, job.status
            )));
        }
        let job = job.clone();
        self.blocking(move |db| {
            let write_txn = db.begin_write()?;
            let context_key = job.context_id.to_string();
            let job_key = job.job_id.to_string();
            {
                let bytes = bincode::serialize(&job)?;
                let mut jobs = write_txn.open_table(FAILOVER_JOBS_TABLE)?;
                jobs.insert(job_key.as_str(), bytes.as_slice())?;
            }
            {
                let mut active = write_txn.open_table(ACTIVE_JOBS_TABLE)?;
                let owned_by_job = match active.get(context_key.as_str())? {
                    Some(bytes) => parse_job_id(bytes.value())? == job.job_id,
                    None => false,
                };
                if owned_by_job {
                    active.remove(context_key.as_str())?;
                }
            }
            if let Some(status) = context_status {
                let mut contexts = write_txn.open_table(CONTEXTS_TABLE)?;
                let existing = contexts
                    .get(context_key.as_str())?
                    .map(|bytes| bincode::deserialize::<VmContext>(bytes.value()))
                    .transpose()?;
                if let Some(mut context) = existing {
                    context.status = status;
                    context.updated_at = chrono::Utc::now();
                    let bytes = bincode::serialize(&context)?;
                    contexts.insert(context_key.as_str(), bytes.as_slice())?;
                }
            }
            write_txn.commit()?;
            Ok(())
        })
        .await
    }

    // Context lifecycle

    /// Delete a context and everything keyed to it.
    ///
    /// Refused while the context has an active job. Job records are kept as
    /// history.
    pub async fn decommission_context(&self, context_id: &ContextId) -> CutoverResult<()> {
        let context_key = context_id.to_string();
        let prefix = context_prefix(context_id);
        self.blocking(move |db| {
            let write_txn = db.begin_write()?;
            if let Some(active) = active_job_in(&write_txn, &context_key)? {
                return Err(CutoverError::job_already_active(context_key, active));
            }

            let mut volume_ids = Vec::new();
            {
                let mut disks = write_txn.open_table(DISKS_TABLE)?;
                let mut keys = Vec::new();
                for entry in disks.range::<&str>(prefix.as_str()..)? {
                    let (key, bytes) = entry?;
                    if !key.value().starts_with(prefix.as_str()) {
                        break;
                    }
                    let disk: DiskDescriptor = bincode::deserialize(bytes.value())?;
                    if let Some(volume) = disk.volume_id {
                        volume_ids.push(volume.to_string());
                    }
                    keys.push(key.value().to_string());
                }
                for key in &keys {
                    disks.remove(key.as_str())?;
                }
            }
            {
                let mut mappings = write_txn.open_table(DEVICE_MAPPINGS_TABLE)?;
                for volume in &volume_ids {
                    mappings.remove(volume.as_str())?;
                }
            }
            {
                let mut networks = write_txn.open_table(NETWORK_MAPPINGS_TABLE)?;
                let mut keys = Vec::new();
                for entry in networks.range::<&str>(prefix.as_str()..)? {
                    let (key, _) = entry?;
                    if !key.value().starts_with(prefix.as_str()) {
                        break;
                    }
                    keys.push(key.value().to_string());
                }
                for key in &keys {
                    networks.remove(key.as_str())?;
                }
            }
            {
                let mut contexts = write_txn.open_table(CONTEXTS_TABLE)?;
                if contexts.remove(context_key.as_str())?.is_none() {
                    return Err(CutoverError::not_found(format!("context {}", context_key)));
                }
            }
            write_txn.commit()?;
            info!(context_id = %context_key, volumes = volume_ids.len(), "Decommissioned context");
            Ok(())
        })
        .await
    }
}

/// Active job id for a context inside a write transaction, ignoring rows
/// that point at jobs already terminal
fn active_job_in(write_txn: &WriteTransaction, context_key: &str) -> CutoverResult<Option<JobId>> {
    let active = write_txn.open_table(ACTIVE_JOBS_TABLE)?;
    let job_id = match active.get(context_key)? {
        Some(bytes) => parse_job_id(bytes.value())?,
        None => return Ok(None),
    };
    let jobs = write_txn.open_table(FAILOVER_JOBS_TABLE)?;
    let job_key = job_id.to_string();
    let still_active = match jobs.get(job_key.as_str())? {
        Some(bytes) => {
            let job: FailoverJob = bincode::deserialize(bytes.value())?;
            !job.status.is_terminal()
        }
        None => false,
    };
    Ok(still_active.then_some(job_id))
}

fn parse_job_id(bytes: &[u8]) -> CutoverResult<JobId> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| CutoverError::serialization("decode active job id", e))?;
    text.parse()
}

pub fn init_database_tables(database: &Database) -> CutoverResult<()> {
    let write_txn = database.begin_write()?;
    let _ = write_txn.open_table(CONTEXTS_TABLE)?;
    let _ = write_txn.open_table(DISKS_TABLE)?;
    let _ = write_txn.open_table(DEVICE_MAPPINGS_TABLE)?;
    let _ = write_txn.open_table(VOLUME_OPERATIONS_TABLE)?;
    let _ = write_txn.open_table(FAILOVER_JOBS_TABLE)?;
    let _ = write_txn.open_table(ACTIVE_JOBS_TABLE)?;
    let _ = write_txn.open_table(NETWORK_MAPPINGS_TABLE)?;
    let _ = write_txn.open_table(JOB_STEPS_TABLE)?;
    write_txn.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("test.redb")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_put_get_remove() {
        let (_dir, store) = create_test_store();
        store.put(CONTEXTS_TABLE, "k", &"value".to_string()).await.unwrap();
        let value: Option<String> = store.get(CONTEXTS_TABLE, "k").await.unwrap();
        assert_eq!(value.as_deref(), Some("value"));
        assert!(store.remove(CONTEXTS_TABLE, "k").await.unwrap());
        assert!(!store.remove(CONTEXTS_TABLE, "k").await.unwrap());
    }

    #[tokio::test]
    async fn test_scan_prefix_respects_boundaries() {
        let (_dir, store) = create_test_store();
        let a = ContextId::new("a");
        let ab = ContextId::new("ab");
        store.put(DISKS_TABLE, &disk_key(&a, 2001), &2001u32).await.unwrap();
        store.put(DISKS_TABLE, &disk_key(&a, 2000), &2000u32).await.unwrap();
        store.put(DISKS_TABLE, &disk_key(&ab, 1), &1u32).await.unwrap();

        let keys: Vec<u32> = store.scan_prefix(DISKS_TABLE, &context_prefix(&a)).await.unwrap();
        assert_eq!(keys, vec![2000, 2001]);
    }

    #[test]
    fn test_disk_keys_sort_numerically() {
        let ctx = ContextId::new("c");
        assert!(disk_key(&ctx, 999) < disk_key(&ctx, 2000));
    }
}
