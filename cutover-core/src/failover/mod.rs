//! Failover and rollback orchestration

pub mod config;
pub mod engine;
pub mod job;
pub mod phase;
pub mod report;
mod rollback;

pub use config::{
    resolve_behavior, ConfigOverrides, FailoverBehavior, FailoverRequest, NetworkStrategy,
    RollbackOptions, SnapshotPolicy, VmNaming,
};
pub use engine::{FailoverOrchestrator, JobStatusView};
pub use job::{FailoverJob, JobOperation, SnapshotRecord, VolumeOwnerRecord};
pub use phase::{JobStatus, Phase, PhaseOutcome, PhaseRecord, FAILOVER_PLAN, ROLLBACK_PLAN};
pub use report::FailureReport;
