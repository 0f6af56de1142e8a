//! Job/step tracking
//!
//! Every job phase runs as one tracked step. The tracker gives the step a
//! durable record and a `job_step` tracing span so log lines from anything
//! the phase calls carry the job id and step name.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn, Span};

use crate::error::CutoverResult;
use crate::failover::phase::JobStatus;
use crate::storage::{Store, JOB_STEPS_TABLE};
use crate::types::{ContextId, FailoverKind, JobId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobMeta {
    pub job_id: JobId,
    pub context_id: ContextId,
    pub kind: FailoverKind,
    pub operation: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Completed,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub job_id: JobId,
    pub sequence: u32,
    pub step: String,
    pub status: StepStatus,
    pub detail: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    fn key(&self) -> String {
        step_key(self.job_id, self.sequence)
    }
}

fn step_key(job_id: JobId, sequence: u32) -> String {
    format!("{}/{:04}", job_id, sequence)
}

/// Span every step's work runs under
pub fn step_span(job_id: JobId, step: &str) -> Span {
    info_span!("job_step", job_id = %job_id, step)
}

#[async_trait]
pub trait JobTracker: Send + Sync {
    async fn start_job(&self, meta: &JobMeta) -> CutoverResult<()>;

    async fn start_step(&self, job_id: JobId, step: &str) -> CutoverResult<StepRecord>;

    async fn end_step(
        &self,
        record: StepRecord,
        status: StepStatus,
        detail: Option<String>,
    ) -> CutoverResult<()>;

    async fn end_job(&self, job_id: JobId, status: JobStatus) -> CutoverResult<()>;

    async fn steps(&self, job_id: JobId) -> CutoverResult<Vec<StepRecord>>;
}

/// Tracker persisting step records in the cutover database
#[derive(Debug)]
pub struct RedbJobTracker {
    store: Store,
    sequences: DashMap<JobId, u32>,
}

impl RedbJobTracker {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            sequences: DashMap::new(),
        }
    }

    async fn next_sequence(&self, job_id: JobId) -> CutoverResult<u32> {
        if !self.sequences.contains_key(&job_id) {
            // Continue numbering after steps written by an earlier process
            let existing = self.steps(job_id).await?.len() as u32;
            self.sequences.entry(job_id).or_insert(existing);
        }
        let mut entry = self.sequences.entry(job_id).or_insert(0);
        *entry += 1;
        Ok(*entry)
    }
}

#[async_trait]
impl JobTracker for RedbJobTracker {
    async fn start_job(&self, meta: &JobMeta) -> CutoverResult<()> {
        info!(
            job_id = %meta.job_id,
            context_id = %meta.context_id,
            kind = %meta.kind,
            operation = meta.operation,
            "Job started"
        );
        Ok(())
    }

    async fn start_step(&self, job_id: JobId, step: &str) -> CutoverResult<StepRecord> {
        let record = StepRecord {
            job_id,
            sequence: self.next_sequence(job_id).await?,
            step: step.to_string(),
            status: StepStatus::Running,
            detail: None,
            started_at: Utc::now(),
            finished_at: None,
        };
        self.store.put(JOB_STEPS_TABLE, &record.key(), &record).await?;
        Ok(record)
    }

    async fn end_step(
        &self,
        mut record: StepRecord,
        status: StepStatus,
        detail: Option<String>,
    ) -> CutoverResult<()> {
        record.status = status;
        record.detail = detail;
        record.finished_at = Some(Utc::now());
        self.store.put(JOB_STEPS_TABLE, &record.key(), &record).await
    }

    async fn end_job(&self, job_id: JobId, status: JobStatus) -> CutoverResult<()> {
        self.sequences.remove(&job_id);
        match status {
            JobStatus::Failed => warn!(job_id = %job_id, %status, "Job ended"),
            _ => info!(job_id = %job_id, %status, "Job ended"),
        }
        Ok(())
    }

    async fn steps(&self, job_id: JobId) -> CutoverResult<Vec<StepRecord>> {
        self.store
            .scan_prefix(JOB_STEPS_TABLE, &format!("{}/", job_id))
            .await
    }
}
