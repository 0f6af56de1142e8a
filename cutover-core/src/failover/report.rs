//! Operator-facing failure reports
//!
//! A report names the phase, a cause an operator can act on without log
//! access, and whether rollback is recommended and available. Account and
//! credential problems keep their specific text; internal plumbing errors
//! are summarized.

use serde::{Deserialize, Serialize};

use super::phase::Phase;
use crate::error::{CreatedResources, CutoverError, ErrorCategory};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    pub phase: Phase,
    pub display_phase: String,
    pub message: String,
    /// Full error text for administrators
    pub technical_detail: String,
    pub category: ErrorCategory,
    pub actionable_steps: Vec<String>,
    pub rollback_recommended: bool,
    pub rollback_available: bool,
    pub resources: CreatedResources,
}

impl FailureReport {
    /// Build a report for a failover-phase error
    pub fn for_failover(
        phase: Phase,
        error: &CutoverError,
        resources: CreatedResources,
        cleanup_enabled: bool,
    ) -> Self {
        let (message, actionable_steps) = sanitize(phase, error);
        let committed = phase.is_committed() || !resources.is_empty();
        Self {
            phase,
            display_phase: phase.display_name().to_string(),
            message,
            technical_detail: error.to_string(),
            category: error.category(),
            actionable_steps,
            rollback_recommended: committed,
            rollback_available: committed && cleanup_enabled,
            resources,
        }
    }

    /// Build a report for a rollback-phase error; re-running rollback is the recovery path
    pub fn for_rollback(phase: Phase, error: &CutoverError, resources: CreatedResources) -> Self {
        let (message, mut actionable_steps) = sanitize(phase, error);
        actionable_steps.push("Re-run the rollback once the cause is resolved".to_string());
        Self {
            phase,
            display_phase: phase.display_name().to_string(),
            message,
            technical_detail: error.to_string(),
            category: error.category(),
            actionable_steps,
            rollback_recommended: true,
            rollback_available: true,
            resources,
        }
    }

    /// Job abandoned by a previous process and found stale on startup
    pub fn interrupted(phase: Option<Phase>, resources: CreatedResources) -> Self {
        let phase = phase.unwrap_or(Phase::Validate);
        Self {
            phase,
            display_phase: phase.display_name().to_string(),
            message: format!(
                "Job was interrupted during '{}' and did not reach a verified final state",
                phase.display_name()
            ),
            technical_detail: "job record stale and external state did not prove success"
                .to_string(),
            category: ErrorCategory::Irrecoverable,
            actionable_steps: vec!["Run a rollback to clean up created resources".to_string()],
            rollback_recommended: true,
            rollback_available: true,
            resources,
        }
    }
}

fn sanitize(phase: Phase, error: &CutoverError) -> (String, Vec<String>) {
    match error {
        CutoverError::AccountMismatch { .. } | CutoverError::CredentialsUnavailable { .. } => {
            (error.to_string(), vec!["Update the active platform credentials".to_string()])
        }
        CutoverError::Validation { .. } | CutoverError::ConfigurationError { .. } => (
            error.to_string(),
            vec!["Correct the configuration and resubmit".to_string()],
        ),
        CutoverError::JobAlreadyActive { .. } => (
            error.to_string(),
            vec!["Wait for the active job to finish or roll it back".to_string()],
        ),
        CutoverError::Timeout { operation, duration } => (
            format!(
                "{} did not finish within {}s ({})",
                phase.display_name(),
                duration.as_secs(),
                operation
            ),
            timeout_steps(phase),
        ),
        CutoverError::PlatformUnavailable { .. } | CutoverError::TemporaryFailure { .. } => (
            format!("Destination platform unreachable during {}", phase.display_name()),
            vec!["Check connectivity to the destination platform and retry".to_string()],
        ),
        CutoverError::NotFound { resource } => (
            format!("{} failed: {} no longer exists", phase.display_name(), resource),
            vec!["Verify the resource was not removed outside of Cutover".to_string()],
        ),
        CutoverError::Irrecoverable { message, .. } => (message.clone(), phase_steps(phase)),
        CutoverError::PlatformOperationFailed { details, .. } => (
            format!("{} failed: {}", phase.display_name(), details),
            phase_steps(phase),
        ),
        CutoverError::VolumeBusy { volume_id, reason } => (
            format!("Volume {} is busy: {}", volume_id, reason),
            vec!["Retry once the in-flight volume operation finishes".to_string()],
        ),
        CutoverError::InvalidTransition { .. }
        | CutoverError::Storage { .. }
        | CutoverError::Serialization { .. }
        | CutoverError::IoError(_)
        | CutoverError::Internal { .. } => (
            format!("Internal error during {}", phase.display_name()),
            vec!["Contact an administrator with the job id".to_string()],
        ),
    }
}

fn timeout_steps(phase: Phase) -> Vec<String> {
    match phase {
        Phase::PowerOffSource => vec![
            "Check that guest tools are running on the source VM".to_string(),
            "Power the source VM off manually and retry".to_string(),
        ],
        Phase::AttachVolumes | Phase::ReattachVolumes | Phase::DetachVolumes => vec![
            "Volume did not appear on the target; detach it explicitly before retrying".to_string(),
        ],
        _ => vec!["Retry the operation; increase the timeout if the platform is slow".to_string()],
    }
}

fn phase_steps(phase: Phase) -> Vec<String> {
    match phase {
        Phase::Snapshot => vec!["Check storage capacity on the destination platform".to_string()],
        Phase::DriverPreparation => vec![
            "Try live failover instead (no driver modification required)".to_string(),
            "Verify the VM runs Windows and its boot disk is healthy".to_string(),
        ],
        Phase::CreateVm => vec![
            "Verify the network mapping for this failover kind".to_string(),
            "Check available CPU and memory on the destination".to_string(),
        ],
        Phase::AttachVolumes => vec!["Roll back, then retry the failover".to_string()],
        _ => vec!["Roll back to release created resources".to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_account_mismatch_keeps_specific_text() {
        let err = CutoverError::AccountMismatch {
            resource: "appliance vm".into(),
            expected: "admin".into(),
            actual: "ops".into(),
        };
        let report = FailureReport::for_failover(Phase::Validate, &err, CreatedResources::default(), true);
        assert!(report.message.contains("'admin'"));
        assert!(report.message.contains("'ops'"));
        assert_eq!(report.category, ErrorCategory::Conflict);
        assert!(!report.rollback_recommended);
    }

    #[test]
    fn test_post_commitment_failure_recommends_rollback() {
        let resources = CreatedResources {
            destination_vm_id: Some("vm-9".into()),
            ..Default::default()
        };
        let err = CutoverError::timeout("attach volume", Duration::from_secs(60));
        let report = FailureReport::for_failover(Phase::AttachVolumes, &err, resources, true);
        assert!(report.rollback_recommended);
        assert!(report.rollback_available);
        assert!(report.message.contains("60s"));
    }

    #[test]
    fn test_internal_errors_are_summarized() {
        let err = CutoverError::internal("redb page 42 corrupt");
        let report = FailureReport::for_failover(Phase::CreateVm, &err, CreatedResources::default(), false);
        assert!(!report.message.contains("redb"));
        assert!(report.technical_detail.contains("redb"));
        assert!(!report.rollback_available);
    }
}
