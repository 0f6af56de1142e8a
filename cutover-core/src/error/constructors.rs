//! Constructor methods for CutoverError

use super::types::{CreatedResources, CutoverError};

impl CutoverError {
    /// Create a validation error for a field or precondition
    ///
    /// # Examples
    /// ```rust
    /// use cutover_core::error::CutoverError;
    ///
    /// let err = CutoverError::validation("network_mapping", "no test mapping for 'VM Network'");
    /// assert!(err.to_string().contains("network_mapping"));
    /// ```
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        CutoverError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn configuration(component: impl Into<String>, message: impl Into<String>) -> Self {
        CutoverError::ConfigurationError {
            component: component.into(),
            message: message.into(),
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        CutoverError::NotFound {
            resource: resource.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, duration: std::time::Duration) -> Self {
        CutoverError::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    pub fn platform_unavailable(operation: impl Into<String>, details: impl Into<String>) -> Self {
        CutoverError::PlatformUnavailable {
            operation: operation.into(),
            details: details.into(),
        }
    }

    pub fn platform_failed(operation: impl Into<String>, details: impl Into<String>) -> Self {
        CutoverError::PlatformOperationFailed {
            operation: operation.into(),
            details: details.into(),
        }
    }

    /// Conflict: another job already holds the context
    pub fn job_already_active(context_id: impl ToString, job_id: impl ToString) -> Self {
        CutoverError::JobAlreadyActive {
            context_id: context_id.to_string(),
            job_id: job_id.to_string(),
        }
    }

    pub fn irrecoverable(message: impl Into<String>, resources: CreatedResources) -> Self {
        CutoverError::Irrecoverable {
            message: message.into(),
            resources,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        CutoverError::Internal {
            message: message.into(),
        }
    }

    /// Create a Storage error with a boxed source
    pub fn storage<E: std::error::Error + Send + Sync + 'static>(
        operation: impl Into<String>,
        source: E,
    ) -> Self {
        CutoverError::Storage {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    /// Create a Serialization error with a boxed source
    pub fn serialization<E: std::error::Error + Send + Sync + 'static>(
        operation: impl Into<String>,
        source: E,
    ) -> Self {
        CutoverError::Serialization {
            operation: operation.into(),
            source: Box::new(source),
        }
    }
}
