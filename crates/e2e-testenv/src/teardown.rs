//! Best-effort teardown of an environment's resources.
//!
//! Every step runs regardless of earlier failures. Failures are collected in
//! order into a [`TeardownReport`]; an empty report means everything the
//! record points at is gone. All steps are idempotent, so a failed teardown
//! can be retried as is.

use std::fmt;
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::environment::{TestEnvironment, VmMetadata};
use crate::error::{EnvError, Result};
use crate::marker;
use crate::provider::DynVmProvisioner;

/// Resource a teardown step was working on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeardownResource {
    TargetVm(String),
    GitServerVm(String),
    /// Managed `temp_dir_root`.
    TempDirRoot(PathBuf),
    /// Legacy artifact directory.
    ArtifactPath(PathBuf),
}

impl fmt::Display for TeardownResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TargetVm(name) => write!(f, "target VM '{name}'"),
            Self::GitServerVm(name) => write!(f, "git server VM '{name}'"),
            Self::TempDirRoot(path) => write!(f, "temp dir root {}", path.display()),
            Self::ArtifactPath(path) => write!(f, "artifact path {}", path.display()),
        }
    }
}

/// One failed teardown step.
#[derive(Debug)]
pub struct TeardownFailure {
    pub resource: TeardownResource,
    pub error: EnvError,
}

impl fmt::Display for TeardownFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.resource, self.error)
    }
}

/// Ordered failures of one teardown run.
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub failures: Vec<TeardownFailure>,
}

impl TeardownReport {
    /// Returns true if every step succeeded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Resources that could not be reclaimed, in step order.
    #[must_use]
    pub fn failed_resources(&self) -> Vec<&TeardownResource> {
        self.failures.iter().map(|f| &f.resource).collect()
    }

    fn push(&mut self, resource: TeardownResource, error: EnvError) {
        warn!(%resource, error = %error, "teardown step failed");
        self.failures.push(TeardownFailure { resource, error });
    }
}

impl fmt::Display for TeardownReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.failures.is_empty() {
            return f.write_str("teardown complete");
        }
        for (i, failure) in self.failures.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{failure}")?;
        }
        Ok(())
    }
}

/// Reverses what the setup pipeline assembled.
pub struct TeardownPipeline {
    provisioner: DynVmProvisioner,
}

impl TeardownPipeline {
    pub fn new(provisioner: DynVmProvisioner) -> Self {
        Self { provisioner }
    }

    /// Tears down everything `env` points at.
    ///
    /// # Errors
    ///
    /// Returns [`EnvError::InvalidSchema`] only for a record with an empty
    /// ID. Resource failures are reported in the [`TeardownReport`].
    pub async fn run(
        &self,
        env: &TestEnvironment,
        cancel: &CancellationToken,
    ) -> Result<TeardownReport> {
        if env.id.is_empty() {
            return Err(EnvError::invalid_schema("environment ID is empty"));
        }
        info!(env_id = %env.id, status = %env.status, "tearing down environment");

        let mut report = TeardownReport::default();

        if let Some(name) = vm_name(env.target_vm.as_ref()) {
            if let Err(e) = self.destroy_vm(name, cancel).await {
                report.push(TeardownResource::TargetVm(name.to_owned()), e);
            }
        }
        if let Some(name) = vm_name(env.git_server_vm.as_ref()) {
            if let Err(e) = self.destroy_vm(name, cancel).await {
                report.push(TeardownResource::GitServerVm(name.to_owned()), e);
            }
        }

        if let Some(root) = &env.temp_dir_root {
            if let Err(e) = remove_temp_root(root) {
                report.push(TeardownResource::TempDirRoot(root.clone()), e);
            }
        }

        if let Some(path) = &env.artifact_path {
            if let Err(e) = remove_dir_if_present(path) {
                report.push(TeardownResource::ArtifactPath(path.clone()), e);
            }
        }

        if report.is_clean() {
            info!(env_id = %env.id, "teardown complete");
        } else {
            warn!(
                env_id = %env.id,
                failures = report.failures.len(),
                "teardown incomplete: {report}"
            );
        }
        Ok(report)
    }

    /// Destroys a VM if it exists. An absent VM is already cleaned up.
    async fn destroy_vm(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        let exists = self.provisioner.domain_exists(name, cancel).await?;
        if !exists {
            info!(vm = name, "VM already absent");
            return Ok(());
        }
        self.provisioner.destroy_vm(name, cancel).await?;
        info!(vm = name, "VM destroyed");
        Ok(())
    }
}

fn vm_name(vm: Option<&VmMetadata>) -> Option<&str> {
    vm.map(|v| v.name.as_str()).filter(|n| !n.is_empty())
}

/// Deletes the managed root. A root that no longer exists counts as
/// cleaned; one that exists without the marker is never touched.
fn remove_temp_root(root: &Path) -> Result<()> {
    if !root_present(std::fs::symlink_metadata(root).map(drop))? {
        return Ok(());
    }
    marker::remove(root)?;
    info!(path = %root.display(), "temp dir root removed");
    Ok(())
}

/// Only `NotFound` means gone; any other lookup error leaves the root in
/// doubt and fails the step.
fn root_present(lookup: std::io::Result<()>) -> Result<bool> {
    match lookup {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn remove_dir_if_present(path: &Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => {
            info!(path = %path.display(), "artifact path removed");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_display_lists_failures_in_order() {
        let mut report = TeardownReport::default();
        report.push(
            TeardownResource::TargetVm("e2e-target".into()),
            EnvError::Provisioning("destroy failed".into()),
        );
        report.push(
            TeardownResource::TempDirRoot(PathBuf::from("/tmp/root")),
            EnvError::UnsafeDeletion(PathBuf::from("/tmp/root")),
        );

        let s = report.to_string();
        let target_at = s.find("target VM 'e2e-target'").unwrap();
        let root_at = s.find("temp dir root /tmp/root").unwrap();
        assert!(target_at < root_at);
        assert!(!report.is_clean());
    }

    #[test]
    fn test_empty_report_is_clean() {
        let report = TeardownReport::default();
        assert!(report.is_clean());
        assert_eq!(report.to_string(), "teardown complete");
    }

    #[test]
    fn test_remove_temp_root_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        remove_temp_root(&dir.path().join("gone")).unwrap();
    }

    #[test]
    fn test_remove_temp_root_unmanaged_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let err = remove_temp_root(dir.path()).unwrap_err();
        assert!(err.is_unsafe_deletion());
        assert!(dir.path().exists());
    }

    #[test]
    fn test_root_lookup_errors_other_than_not_found_fail() {
        let denied = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        let err = root_present(Err(denied)).unwrap_err();
        assert!(matches!(err, EnvError::Io(_)));

        let missing = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert!(!root_present(Err(missing)).unwrap());
        assert!(root_present(Ok(())).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_remove_temp_root_unreadable_parent_is_failure() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let parent = dir.path().join("locked");
        let root = parent.join("e2e-20250101-abcd1234");
        marker::create(&root).unwrap();
        std::fs::set_permissions(&parent, std::fs::Permissions::from_mode(0o000)).unwrap();

        let readable = std::fs::symlink_metadata(&root).is_ok();
        let result = remove_temp_root(&root);
        std::fs::set_permissions(&parent, std::fs::Permissions::from_mode(0o755)).unwrap();

        if readable {
            eprintln!("SKIP test_remove_temp_root_unreadable_parent_is_failure — running as root");
            return;
        }
        assert!(matches!(result.unwrap_err(), EnvError::Io(_)));
        assert!(marker::is_managed(&root));
    }

    #[test]
    fn test_vm_name_skips_empty() {
        let vm = VmMetadata::default();
        assert_eq!(vm_name(Some(&vm)), None);
        assert_eq!(vm_name(None), None);
    }
}
