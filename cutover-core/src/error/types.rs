//! Core error types for Cutover

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Operator-facing classification of an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    TransientPlatform,
    Conflict,
    Irrecoverable,
    NotFound,
    Internal,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::TransientPlatform => "transient_platform",
            ErrorCategory::Conflict => "conflict",
            ErrorCategory::Irrecoverable => "irrecoverable",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Identifiers of platform resources created by a job
///
/// Persisted on the failover job and attached to irrecoverable errors so an
/// operator (or rollback) can find everything that was created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedResources {
    pub destination_vm_id: Option<String>,
    pub snapshot_ids: Vec<String>,
    /// Volumes moved away from their original owner: (volume id, original owner)
    pub moved_volumes: Vec<(String, String)>,
}

impl CreatedResources {
    pub fn is_empty(&self) -> bool {
        self.destination_vm_id.is_none()
            && self.snapshot_ids.is_empty()
            && self.moved_volumes.is_empty()
    }
}

impl std::fmt::Display for CreatedResources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "destination_vm={}, snapshots=[{}], moved_volumes=[{}]",
            self.destination_vm_id.as_deref().unwrap_or("none"),
            self.snapshot_ids.join(", "),
            self.moved_volumes
                .iter()
                .map(|(volume, owner)| format!("{}<-{}", volume, owner))
                .collect::<Vec<_>>()
                .join(", ")
        )
    }
}

/// Error type for all Cutover operations
#[derive(Error, Debug)]
pub enum CutoverError {
    // Validation
    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Configuration error in {component}: {message}")]
    ConfigurationError { component: String, message: String },

    #[error("Invalid state transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: String,
        from: String,
        to: String,
    },

    // Transient platform failures
    #[error("Operation timed out: {operation} after {duration:?}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    #[error("Platform unreachable during {operation}: {details}")]
    PlatformUnavailable { operation: String, details: String },

    #[error("Temporary failure: {details}")]
    TemporaryFailure { details: String },

    // Conflicts
    #[error("Job {job_id} is already active for context {context_id}")]
    JobAlreadyActive { context_id: String, job_id: String },

    #[error(
        "Account mismatch on {resource}: active credentials belong to account '{expected}' \
         but the resource is owned by account '{actual}'. Update the platform credentials \
         or re-register the resource under account '{expected}'"
    )]
    AccountMismatch {
        resource: String,
        expected: String,
        actual: String,
    },

    #[error("Credentials unavailable: {reason}. Configure active credentials before retrying")]
    CredentialsUnavailable { reason: String },

    #[error("Volume {volume_id} is busy: {reason}")]
    VolumeBusy { volume_id: String, reason: String },

    // Irrecoverable
    #[error("Irrecoverable failure: {message} (created resources: {resources})")]
    Irrecoverable {
        message: String,
        resources: CreatedResources,
    },

    #[error("Platform operation '{operation}' failed: {details}")]
    PlatformOperationFailed { operation: String, details: String },

    // Not found
    #[error("Resource not found: {resource}")]
    NotFound { resource: String },

    // Storage & internal
    #[error("Storage operation '{operation}' failed")]
    Storage {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Serialization operation '{operation}' failed")]
    Serialization {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("IO error: {0}")]
    IoError(#[from] Box<std::io::Error>),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

pub type Result<T> = std::result::Result<T, CutoverError>;
pub type CutoverResult<T> = std::result::Result<T, CutoverError>;

impl CutoverError {
    /// Classify this error for reporting and retry decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            CutoverError::Validation { .. }
            | CutoverError::ConfigurationError { .. }
            | CutoverError::InvalidTransition { .. } => ErrorCategory::Validation,

            CutoverError::Timeout { .. }
            | CutoverError::PlatformUnavailable { .. }
            | CutoverError::TemporaryFailure { .. } => ErrorCategory::TransientPlatform,

            CutoverError::JobAlreadyActive { .. }
            | CutoverError::AccountMismatch { .. }
            | CutoverError::CredentialsUnavailable { .. }
            | CutoverError::VolumeBusy { .. } => ErrorCategory::Conflict,

            CutoverError::Irrecoverable { .. } | CutoverError::PlatformOperationFailed { .. } => {
                ErrorCategory::Irrecoverable
            }

            CutoverError::NotFound { .. } => ErrorCategory::NotFound,

            CutoverError::Storage { .. }
            | CutoverError::Serialization { .. }
            | CutoverError::IoError(_)
            | CutoverError::Internal { .. } => ErrorCategory::Internal,
        }
    }

    /// Only transient platform errors are worth retrying
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::TransientPlatform
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CutoverError::NotFound { .. })
    }
}
