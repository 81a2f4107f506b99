//! Ports to the external collaborators the orchestrator drives.
//!
//! - [`VmProvisioner`]: creates, destroys and queries VMs.
//! - [`GitServer`] / [`GitServerFactory`]: stands up the git server VM.
//! - [`GuestSsh`]: SSH readiness and guest key retrieval.
//!
//! Every call takes a [`CancellationToken`] so a caller can abort long waits.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::environment::{EnvironmentId, VmMetadata};
use crate::error::EnvError;

/// Errors reported by port implementations.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The VM or domain does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A bounded wait elapsed before the resource became ready.
    #[error("timed out after {elapsed:?} waiting for {what}")]
    Timeout { what: String, elapsed: Duration },

    /// The provider or guest could not be reached.
    #[error("connection error: {0}")]
    Connection(String),

    /// The provider rejected or failed the operation.
    #[error("{0}")]
    Failed(String),

    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Returns true if this is a timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<ProviderError> for EnvError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::NotFound(what) => Self::NotFound(what),
            ProviderError::Timeout { .. } => Self::Timeout(e.to_string()),
            ProviderError::Cancelled => Self::Cancelled,
            ProviderError::Connection(_) | ProviderError::Failed(_) => {
                Self::Provisioning(e.to_string())
            }
        }
    }
}

/// Result type alias for port calls.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

// =============================================================================
// VM provisioning
// =============================================================================

/// Request to create one VM.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Domain name, unique on the host.
    pub name: String,
    /// Base image the VM disk is layered on.
    pub base_image: PathBuf,
    /// Directory the provider may write disks and seeds into.
    pub work_dir: PathBuf,
    /// Public key authorized for the login user.
    pub ssh_public_key: String,
    pub vcpus: u32,
    pub memory_mib: u64,
    pub disk_gib: u64,
    /// Upper bound for IP resolution.
    pub ip_timeout: Duration,
}

/// Lifecycle contract of the virtualization provider.
#[async_trait]
pub trait VmProvisioner: Send + Sync {
    /// Creates and boots a VM, returning once its IP is known.
    async fn create_vm(
        &self,
        config: &VmConfig,
        cancel: &CancellationToken,
    ) -> ProviderResult<VmMetadata>;

    /// Destroys a VM. Must succeed if the VM is already gone.
    async fn destroy_vm(&self, name: &str, cancel: &CancellationToken) -> ProviderResult<()>;

    /// Returns whether a domain named `name` exists.
    async fn domain_exists(&self, name: &str, cancel: &CancellationToken) -> ProviderResult<bool>;
}

/// Shared provisioner trait object.
pub type DynVmProvisioner = Arc<dyn VmProvisioner>;

/// Polls `resolve` until it yields an address or `timeout` elapses.
///
/// `resolve` returns `Ok(None)` while the address is not yet known. A
/// `Connection` error from the last attempt is kept as context, but the
/// overall failure after the deadline is always `Timeout`, so callers can
/// tell "never came up" from "provider unreachable". Any other error aborts
/// immediately.
pub async fn poll_for_ip<F, Fut>(
    what: &str,
    mut resolve: F,
    timeout: Duration,
    interval: Duration,
    cancel: &CancellationToken,
) -> ProviderResult<String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ProviderResult<Option<String>>>,
{
    let start = tokio::time::Instant::now();
    let deadline = start + timeout;
    loop {
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        match resolve().await {
            Ok(Some(ip)) if !ip.trim().is_empty() => return Ok(ip),
            Ok(_) => {}
            Err(ProviderError::Connection(msg)) => {
                tracing::debug!(what, error = %msg, "IP lookup failed, retrying");
            }
            Err(e) => return Err(e),
        }

        if tokio::time::Instant::now() + interval > deadline {
            return Err(ProviderError::Timeout {
                what: format!("IP of {what}"),
                elapsed: start.elapsed(),
            });
        }
        tokio::select! {
            () = cancel.cancelled() => return Err(ProviderError::Cancelled),
            () = tokio::time::sleep(interval) => {}
        }
    }
}

// =============================================================================
// Git server
// =============================================================================

/// Everything the git server collaborator needs to stand up its VM.
#[derive(Debug, Clone)]
pub struct GitServerRequest {
    pub env_id: EnvironmentId,
    /// Domain name for the git server VM.
    pub vm_name: String,
    /// Managed `gitserver/` directory of the environment.
    pub work_dir: PathBuf,
    /// Source material pushed into the served repositories.
    pub source_dir: PathBuf,
    pub base_image: PathBuf,
    /// Keys allowed to clone: the host key and the target VM's own key.
    pub authorized_keys: Vec<String>,
    /// Repositories to create.
    pub repositories: Vec<String>,
    pub vcpus: u32,
    pub memory_mib: u64,
    pub disk_gib: u64,
}

/// Reported once [`GitServer::run`] has succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitServerStatus {
    pub vm: VmMetadata,
    /// Repository name to SSH clone URL.
    pub ssh_urls: BTreeMap<String, String>,
    pub service_port: u16,
}

/// One git server instance, bound to one environment.
#[async_trait]
pub trait GitServer: Send + Sync {
    /// Provisions the VM and bootstraps the repositories.
    async fn run(&mut self, cancel: &CancellationToken) -> ProviderResult<()>;

    /// Returns `None` until `run` has succeeded.
    fn status(&self) -> Option<GitServerStatus>;

    /// Destroys the git server VM.
    async fn teardown(&mut self, cancel: &CancellationToken) -> ProviderResult<()>;
}

/// Builds a [`GitServer`] for a request.
pub trait GitServerFactory: Send + Sync {
    fn build(&self, request: GitServerRequest) -> Box<dyn GitServer>;
}

// =============================================================================
// Guest SSH
// =============================================================================

/// How to reach a guest over SSH.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub private_key: PathBuf,
}

/// SSH readiness and key retrieval against a guest.
#[async_trait]
pub trait GuestSsh: Send + Sync {
    /// Blocks until the guest's SSH service answers or `timeout` elapses.
    async fn await_ready(
        &self,
        target: &SshTarget,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> ProviderResult<()>;

    /// Returns the guest's own outbound public key (OpenSSH format),
    /// creating the key on the guest if it has none.
    async fn guest_public_key(
        &self,
        target: &SshTarget,
        cancel: &CancellationToken,
    ) -> ProviderResult<String>;
}
