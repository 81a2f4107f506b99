//! Test environment aggregate and its lifecycle status.
//!
//! A [`TestEnvironment`] is plain owned data: `Clone` produces a fully
//! independent copy, which is what the store and registry hand out on every
//! read and take in on every write.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix shared by every generated environment ID.
pub const ID_PREFIX: &str = "e2e";

/// Length of the random suffix of an environment ID.
pub const ID_SUFFIX_LEN: usize = 8;

/// Environment identifier, `e2e-<YYYYMMDD>-<8 alphanumeric>`.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvironmentId(String);

impl EnvironmentId {
    /// Generates a fresh ID dated `now`.
    #[must_use]
    pub fn generate(now: DateTime<Utc>) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!(
            "{ID_PREFIX}-{}-{}",
            now.format("%Y%m%d"),
            &suffix[..ID_SUFFIX_LEN]
        ))
    }

    /// Parses and validates an ID string.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.splitn(3, '-');
        let prefix = parts.next()?;
        let date = parts.next()?;
        let suffix = parts.next()?;
        let well_formed = prefix == ID_PREFIX
            && date.len() == 8
            && date.bytes().all(|b| b.is_ascii_digit())
            && suffix.len() == ID_SUFFIX_LEN
            && suffix.bytes().all(|b| b.is_ascii_alphanumeric());
        well_formed.then(|| Self(s.to_owned()))
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the ID is empty (never valid for persistence).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for EnvironmentId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for EnvironmentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for EnvironmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle status of an environment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentStatus {
    /// All resources are provisioned; nothing has run against it yet.
    #[default]
    Created,
    /// The bootstrap tool is being applied.
    Setup,
    /// Bootstrap finished; verification is running.
    Running,
    /// Verification passed.
    Passed,
    /// Verification or bootstrap failed.
    Failed,
    /// A teardown left some resources behind; retry is possible.
    PartiallyDeleted,
}

impl EnvironmentStatus {
    /// Returns the on-disk name of the status.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Setup => "setup",
            Self::Running => "running",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::PartiallyDeleted => "partially_deleted",
        }
    }

    /// Returns true if the status requires both VMs to have an IP.
    #[must_use]
    pub const fn requires_vm_ips(&self) -> bool {
        matches!(self, Self::Running | Self::Passed | Self::Failed)
    }

    /// Returns true if moving from `self` to `next` is allowed.
    ///
    /// Statuses only move forward; `partially_deleted` may be re-entered so
    /// teardown can be retried.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        use EnvironmentStatus::*;
        if *self == next {
            return true;
        }
        match self {
            Created => matches!(next, Setup | Running | Failed | PartiallyDeleted),
            Setup => matches!(next, Running | Failed | PartiallyDeleted),
            Running => matches!(next, Passed | Failed | PartiallyDeleted),
            Passed | Failed => next == PartiallyDeleted,
            PartiallyDeleted => false,
        }
    }
}

impl std::fmt::Display for EnvironmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// VM metadata reported by the provisioning provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmMetadata {
    /// Domain name of the VM.
    pub name: String,
    /// Guest IP address (empty until resolved).
    #[serde(default)]
    pub ip: String,
    /// Number of virtual CPUs.
    #[serde(default)]
    pub vcpus: u32,
    /// Memory in MiB.
    #[serde(default)]
    pub memory_mib: u64,
    /// Disk size in GiB.
    #[serde(default)]
    pub disk_gib: u64,
    /// Files the provider created on the host for this VM.
    #[serde(default)]
    pub created_files: Vec<PathBuf>,
}

impl VmMetadata {
    /// Returns true if the guest IP has been resolved.
    #[must_use]
    pub fn has_ip(&self) -> bool {
        !self.ip.trim().is_empty()
    }
}

/// Host-side keypair used to reach the target VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshKeyPair {
    pub private_key: PathBuf,
    pub public_key: PathBuf,
}

/// One disposable test environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestEnvironment {
    pub id: EnvironmentId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: EnvironmentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_vm: Option<VmMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_server_vm: Option<VmMetadata>,
    /// Managed root holding `vmm/`, `gitserver/` and `artifacts/`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_dir_root: Option<PathBuf>,
    /// Legacy artifact directory, deleted without a marker check.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_keys: Option<SshKeyPair>,
    /// Repository name to SSH clone URL.
    #[serde(default)]
    pub git_ssh_urls: BTreeMap<String, String>,
    /// Repositories requested at setup time.
    #[serde(default)]
    pub repositories: Vec<String>,
    /// Append-only audit list of every path setup created.
    #[serde(default)]
    pub managed_resources: Vec<PathBuf>,
    #[serde(default)]
    pub notes: String,
}

impl TestEnvironment {
    /// Creates an empty record in the `created` state.
    #[must_use]
    pub fn new(id: EnvironmentId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            created_at: now,
            updated_at: now,
            status: EnvironmentStatus::Created,
            target_vm: None,
            git_server_vm: None,
            temp_dir_root: None,
            artifact_path: None,
            ssh_keys: None,
            git_ssh_urls: BTreeMap::new(),
            repositories: Vec::new(),
            managed_resources: Vec::new(),
            notes: String::new(),
        }
    }

    /// Refreshes `updated_at`.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Adds a line to `notes`, keeping what is already there.
    pub fn append_note(&mut self, note: &str) {
        if !self.notes.is_empty() {
            self.notes.push('\n');
        }
        self.notes.push_str(note);
    }

    /// Appends a path to the audit list.
    pub fn record_resource(&mut self, path: impl Into<PathBuf>) {
        self.managed_resources.push(path.into());
    }

    /// Appends several paths to the audit list, keeping their order.
    pub fn record_resources<I, P>(&mut self, paths: I)
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.managed_resources
            .extend(paths.into_iter().map(Into::into));
    }

    /// Requested repositories that have no SSH URL yet.
    #[must_use]
    pub fn missing_repositories(&self) -> Vec<&str> {
        self.repositories
            .iter()
            .filter(|r| !self.git_ssh_urls.contains_key(r.as_str()))
            .map(String::as_str)
            .collect()
    }

    /// Checks the record invariants that must hold in `status`.
    ///
    /// Returns a description of the first violated invariant.
    pub fn check_invariants_for(&self, status: EnvironmentStatus) -> Result<(), String> {
        if status.requires_vm_ips() {
            let target_ok = self.target_vm.as_ref().is_some_and(VmMetadata::has_ip);
            let git_ok = self.git_server_vm.as_ref().is_some_and(VmMetadata::has_ip);
            if !target_ok {
                return Err("target VM has no IP".to_string());
            }
            if !git_ok {
                return Err("git server VM has no IP".to_string());
            }
        }
        if status != EnvironmentStatus::Created && status != EnvironmentStatus::PartiallyDeleted {
            let missing = self.missing_repositories();
            if !missing.is_empty() {
                return Err(format!("no git SSH URL for {}", missing.join(", ")));
            }
        }
        Ok(())
    }
}
