use super::*;

#[test]
fn test_categories() {
    assert_eq!(
        CutoverError::validation("kind", "bad").category(),
        ErrorCategory::Validation
    );
    assert_eq!(
        CutoverError::timeout("power-off", std::time::Duration::from_secs(1)).category(),
        ErrorCategory::TransientPlatform
    );
    assert_eq!(
        CutoverError::job_already_active("ctx", "job").category(),
        ErrorCategory::Conflict
    );
    assert_eq!(
        CutoverError::irrecoverable("boom", CreatedResources::default()).category(),
        ErrorCategory::Irrecoverable
    );
}

#[test]
fn test_only_transient_errors_are_retryable() {
    assert!(CutoverError::platform_unavailable("attach", "connection refused").is_retryable());
    assert!(!CutoverError::not_found("volume vol-1").is_retryable());
    assert!(!CutoverError::validation("x", "y").is_retryable());
}

#[test]
fn test_account_mismatch_message_is_actionable() {
    let err = CutoverError::AccountMismatch {
        resource: "appliance VM oma-1".into(),
        expected: "migration".into(),
        actual: "admin".into(),
    };
    let msg = err.to_string();
    assert!(msg.contains("oma-1"));
    assert!(msg.contains("'migration'"));
    assert!(msg.contains("'admin'"));
    assert!(msg.contains("Update the platform credentials"));
}

#[test]
fn test_irrecoverable_carries_resources() {
    let resources = CreatedResources {
        destination_vm_id: Some("vm-9".into()),
        snapshot_ids: vec!["snap-1".into(), "snap-2".into()],
        moved_volumes: vec![("vol-1".into(), "oma-1".into())],
    };
    let err = CutoverError::irrecoverable("attach failed", resources.clone());
    let msg = err.to_string();
    assert!(msg.contains("vm-9"));
    assert!(msg.contains("snap-2"));
    assert!(msg.contains("vol-1<-oma-1"));
    match err {
        CutoverError::Irrecoverable { resources: r, .. } => assert_eq!(r, resources),
        other => panic!("unexpected error: {other}"),
    }
}
