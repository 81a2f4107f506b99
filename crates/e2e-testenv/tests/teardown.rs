//! Teardown pipeline behaviour against a fake provisioner.

mod common;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use common::FakeProvisioner;
use e2e_testenv::{
    DynVmProvisioner, EnvironmentId, TeardownPipeline, TeardownResource, TestEnvironment,
    VmMetadata, marker,
};
use tokio_util::sync::CancellationToken;

const TARGET: &str = "e2e-20250101-abcd1234-target";
const GIT_SERVER: &str = "e2e-20250101-abcd1234-gitserver";

fn pipeline(provisioner: &Arc<FakeProvisioner>) -> TeardownPipeline {
    let provisioner: DynVmProvisioner = provisioner.clone();
    TeardownPipeline::new(provisioner)
}

fn record(root: Option<PathBuf>) -> TestEnvironment {
    let mut env = TestEnvironment::new(EnvironmentId::from("e2e-20250101-abcd1234"), Utc::now());
    env.target_vm = Some(VmMetadata {
        name: TARGET.into(),
        ip: "192.168.122.10".into(),
        ..Default::default()
    });
    env.git_server_vm = Some(VmMetadata {
        name: GIT_SERVER.into(),
        ip: "192.168.122.11".into(),
        ..Default::default()
    });
    env.temp_dir_root = root;
    env
}

/// Creates a managed root with some content below it.
fn managed_root(parent: &std::path::Path) -> PathBuf {
    let root = parent.join("e2e-20250101-abcd1234");
    marker::create(&root).unwrap();
    std::fs::create_dir_all(root.join("vmm")).unwrap();
    std::fs::write(root.join("vmm").join("disk.qcow2"), b"disk").unwrap();
    root
}

// =============================================================================
// Clean teardown
// =============================================================================

#[tokio::test]
async fn test_absent_vms_and_managed_root_tear_down_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let root = managed_root(dir.path());
    let provisioner = FakeProvisioner::new();

    let report = pipeline(&provisioner)
        .run(&record(Some(root.clone())), &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.is_clean(), "unexpected failures: {report}");
    assert!(!root.exists());
    // Absent domains are checked, never destroyed.
    assert!(!provisioner.calls().iter().any(|c| c.starts_with("destroy:")));
}

#[tokio::test]
async fn test_existing_vms_are_destroyed_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let root = managed_root(dir.path());
    let provisioner = FakeProvisioner::new();
    provisioner.add_domain(TARGET);
    provisioner.add_domain(GIT_SERVER);

    let report = pipeline(&provisioner)
        .run(&record(Some(root)), &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.is_clean());
    assert_eq!(
        provisioner.calls(),
        vec![
            format!("exists:{TARGET}"),
            format!("destroy:{TARGET}"),
            format!("exists:{GIT_SERVER}"),
            format!("destroy:{GIT_SERVER}"),
        ]
    );
    assert!(!provisioner.has_domain(TARGET));
    assert!(!provisioner.has_domain(GIT_SERVER));
}

#[tokio::test]
async fn test_already_removed_root_counts_as_cleaned() {
    let dir = tempfile::tempdir().unwrap();
    let provisioner = FakeProvisioner::new();
    let env = record(Some(dir.path().join("gone")));

    let report = pipeline(&provisioner)
        .run(&env, &CancellationToken::new())
        .await
        .unwrap();
    assert!(report.is_clean());
}

#[tokio::test]
async fn test_artifact_path_is_removed_without_marker() {
    let dir = tempfile::tempdir().unwrap();
    let artifacts = dir.path().join("artifacts").join("e2e-20250101-abcd1234");
    std::fs::create_dir_all(&artifacts).unwrap();
    std::fs::write(artifacts.join("id_ed25519"), b"key").unwrap();

    let mut env = record(None);
    env.artifact_path = Some(artifacts.clone());

    let report = pipeline(&FakeProvisioner::new())
        .run(&env, &CancellationToken::new())
        .await
        .unwrap();
    assert!(report.is_clean());
    assert!(!artifacts.exists());
}

#[tokio::test]
async fn test_record_without_resources_is_a_no_op() {
    let provisioner = FakeProvisioner::new();
    let env = TestEnvironment::new(EnvironmentId::from("e2e-20250101-abcd1234"), Utc::now());

    let report = pipeline(&provisioner)
        .run(&env, &CancellationToken::new())
        .await
        .unwrap();
    assert!(report.is_clean());
    assert!(provisioner.calls().is_empty());
}

// =============================================================================
// Partial failure
// =============================================================================

#[tokio::test]
async fn test_failed_target_destroy_still_cleans_the_rest() {
    let dir = tempfile::tempdir().unwrap();
    let root = managed_root(dir.path());
    let provisioner = FakeProvisioner::new();
    provisioner.add_domain(TARGET);
    provisioner.add_domain(GIT_SERVER);
    provisioner.set_fail_destroy(TARGET, true);

    let report = pipeline(&provisioner)
        .run(&record(Some(root.clone())), &CancellationToken::new())
        .await
        .unwrap();

    assert!(!report.is_clean());
    assert_eq!(
        report.failed_resources(),
        vec![&TeardownResource::TargetVm(TARGET.into())]
    );
    assert!(report.to_string().contains(TARGET));
    assert!(provisioner.calls().contains(&format!("destroy:{GIT_SERVER}")));
    assert!(!provisioner.has_domain(GIT_SERVER));
    assert!(!root.exists());
}

#[tokio::test]
async fn test_failed_existence_check_is_reported() {
    let provisioner = FakeProvisioner::new();
    provisioner.set_fail_exists(GIT_SERVER);

    let report = pipeline(&provisioner)
        .run(&record(None), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        report.failed_resources(),
        vec![&TeardownResource::GitServerVm(GIT_SERVER.into())]
    );
}

#[tokio::test]
async fn test_unmanaged_root_is_never_deleted() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("not-ours");
    std::fs::create_dir_all(&root).unwrap();
    std::fs::write(root.join("precious.txt"), b"keep me").unwrap();

    let report = pipeline(&FakeProvisioner::new())
        .run(&record(Some(root.clone())), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].error.is_unsafe_deletion());
    assert_eq!(
        std::fs::read(root.join("precious.txt")).unwrap(),
        b"keep me"
    );
}

#[tokio::test]
async fn test_retry_reports_the_same_failures() {
    let dir = tempfile::tempdir().unwrap();
    let root = managed_root(dir.path());
    let provisioner = FakeProvisioner::new();
    provisioner.add_domain(TARGET);
    provisioner.set_fail_destroy(TARGET, true);
    let teardown = pipeline(&provisioner);
    let env = record(Some(root));

    let first = teardown.run(&env, &CancellationToken::new()).await.unwrap();
    let second = teardown.run(&env, &CancellationToken::new()).await.unwrap();
    assert_eq!(first.failed_resources(), second.failed_resources());

    provisioner.set_fail_destroy(TARGET, false);
    let third = teardown.run(&env, &CancellationToken::new()).await.unwrap();
    assert!(third.is_clean());
    assert!(!provisioner.has_domain(TARGET));
}

#[tokio::test]
async fn test_empty_id_is_rejected_before_any_step() {
    let provisioner = FakeProvisioner::new();
    let mut env = record(None);
    env.id = EnvironmentId::default();

    let err = pipeline(&provisioner)
        .run(&env, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.is_invalid_schema());
    assert!(provisioner.calls().is_empty());
}
