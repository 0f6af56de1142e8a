pub mod common;
pub mod config;
pub mod context;
pub mod correlation;
pub mod error;
pub mod failover;
pub mod network;
pub mod platform;
pub mod reconcile;
pub mod service;
pub mod snapshot;
pub mod storage;
pub mod tracker;
pub mod types;
pub mod volume;

pub use config::CutoverConfig;
pub use error::{CutoverError, CutoverResult, ErrorCategory};
pub use failover::{
    ConfigOverrides, FailoverOrchestrator, FailoverRequest, JobStatus, JobStatusView,
    RollbackOptions,
};
pub use service::CutoverService;
pub use types::{ContextId, ContextStatus, FailoverKind, JobId, VolumeId};
