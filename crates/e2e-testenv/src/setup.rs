//! Setup pipeline: assembles one running environment.
//!
//! ```text
//! registry record → managed temp root (vmm/, gitserver/, artifacts/)
//!   → artifact dir → base image → SSH keypair → target VM (+ SSH ready)
//!   → target VM key → git server VM → merge URLs → persist
//! ```
//!
//! The first failing phase stops the pipeline. Resources created before the
//! failure are left in place and recorded on the partial environment carried
//! by [`SetupError`], which the caller hands to teardown.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::environment::{EnvironmentStatus, TestEnvironment, VmMetadata};
use crate::error::EnvError;
use crate::image::{ImageCache, ImageSource};
use crate::keys;
use crate::marker;
use crate::provider::{
    DynVmProvisioner, GitServerFactory, GitServerRequest, GuestSsh, SshTarget, VmConfig,
};
use crate::registry::EnvironmentRegistry;
use crate::store::ArtifactStore;

/// Component subdirectories created under the temp root.
pub const VMM_DIR: &str = "vmm";
pub const GITSERVER_DIR: &str = "gitserver";
pub const ARTIFACTS_DIR: &str = "artifacts";

/// Pipeline phase, reported with every setup failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupPhase {
    Validate,
    CreateRecord,
    Workspace,
    Artifacts,
    Image,
    SshKeys,
    TargetVm,
    GitServer,
    GitServerMerge,
    Persist,
}

impl fmt::Display for SetupPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Validate => "validate",
            Self::CreateRecord => "create record",
            Self::Workspace => "workspace",
            Self::Artifacts => "artifacts",
            Self::Image => "image",
            Self::SshKeys => "ssh keys",
            Self::TargetVm => "target VM",
            Self::GitServer => "git server",
            Self::GitServerMerge => "git server merge",
            Self::Persist => "persist",
        };
        f.write_str(s)
    }
}

/// A failed setup, with the partially populated record if one exists.
#[derive(Debug, Error)]
#[error("setup failed during {phase}: {source}")]
pub struct SetupError {
    pub phase: SetupPhase,
    #[source]
    pub source: EnvError,
    /// Record as far as setup got; hand it to teardown.
    pub environment: Option<Box<TestEnvironment>>,
}

/// CPU, memory and disk for one VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSizing {
    pub vcpus: u32,
    pub memory_mib: u64,
    pub disk_gib: u64,
}

impl VmSizing {
    /// Default sizing of the target device VM.
    pub const TARGET: Self = Self {
        vcpus: 2,
        memory_mib: 2048,
        disk_gib: 20,
    };

    /// Default sizing of the git server VM.
    pub const GIT_SERVER: Self = Self {
        vcpus: 1,
        memory_mib: 1024,
        disk_gib: 10,
    };
}

/// Per-invocation setup inputs.
#[derive(Debug, Clone)]
pub struct SetupRequest {
    /// Root under which environment directories are created.
    pub artifact_root: PathBuf,
    /// Directory holding the cached base image.
    pub image_cache_dir: PathBuf,
    /// Source material the git server serves.
    pub gitserver_source: PathBuf,
    /// Permit downloading the base image when it is not cached.
    pub allow_image_download: bool,
    /// Repositories the git server must expose.
    pub repositories: Vec<String>,
    pub target: VmSizing,
    pub git_server: VmSizing,
}

impl SetupRequest {
    /// Rejects empty required paths before anything is created.
    fn validate(&self) -> Result<(), EnvError> {
        let required: [(&str, &Path); 3] = [
            ("artifact root", &self.artifact_root),
            ("image cache directory", &self.image_cache_dir),
            ("git server source path", &self.gitserver_source),
        ];
        for (what, path) in required {
            if path.as_os_str().is_empty() {
                return Err(EnvError::invalid_input(format!("{what} is empty")));
            }
        }
        if self.repositories.iter().any(|r| r.trim().is_empty()) {
            return Err(EnvError::invalid_input("repository name is empty"));
        }
        Ok(())
    }
}

/// Settings shared by every setup run.
#[derive(Debug, Clone)]
pub struct SetupOptions {
    pub image: ImageSource,
    /// `ssh-keygen` binary used for the host keypair.
    pub ssh_keygen: PathBuf,
    /// Login user on both VMs.
    pub ssh_user: String,
    pub ssh_port: u16,
    /// Bound on waiting for the target VM's SSH service.
    pub ssh_ready_timeout: Duration,
    /// Bound on IP resolution, passed to the provisioner.
    pub ip_timeout: Duration,
    /// Bound on the whole base image download.
    pub http_timeout: Duration,
}

impl Default for SetupOptions {
    fn default() -> Self {
        Self {
            image: ImageSource::default(),
            ssh_keygen: PathBuf::from("ssh-keygen"),
            ssh_user: "ubuntu".to_string(),
            ssh_port: 22,
            ssh_ready_timeout: Duration::from_secs(60),
            ip_timeout: Duration::from_secs(60),
            http_timeout: Duration::from_secs(1800),
        }
    }
}

type PhaseResult<T> = Result<T, (SetupPhase, EnvError)>;

fn at<E: Into<EnvError>>(phase: SetupPhase) -> impl FnOnce(E) -> (SetupPhase, EnvError) {
    move |e| (phase, e.into())
}

fn ensure_not_cancelled(phase: SetupPhase, cancel: &CancellationToken) -> PhaseResult<()> {
    if cancel.is_cancelled() {
        return Err((phase, EnvError::Cancelled));
    }
    Ok(())
}

/// Composes the ports into one provisioned environment.
pub struct SetupPipeline {
    registry: Arc<EnvironmentRegistry>,
    store: Arc<ArtifactStore>,
    provisioner: DynVmProvisioner,
    git_servers: Arc<dyn GitServerFactory>,
    ssh: Arc<dyn GuestSsh>,
    options: SetupOptions,
}

impl SetupPipeline {
    pub fn new(
        registry: Arc<EnvironmentRegistry>,
        store: Arc<ArtifactStore>,
        provisioner: DynVmProvisioner,
        git_servers: Arc<dyn GitServerFactory>,
        ssh: Arc<dyn GuestSsh>,
        options: SetupOptions,
    ) -> Self {
        Self {
            registry,
            store,
            provisioner,
            git_servers,
            ssh,
            options,
        }
    }

    /// Runs the whole pipeline.
    ///
    /// # Errors
    ///
    /// Returns a [`SetupError`] naming the failing phase. After the record
    /// is created, the error carries it with every resource made so far.
    pub async fn run(
        &self,
        request: &SetupRequest,
        cancel: &CancellationToken,
    ) -> Result<TestEnvironment, SetupError> {
        request.validate().map_err(|source| SetupError {
            phase: SetupPhase::Validate,
            source,
            environment: None,
        })?;

        let mut env = self.registry.create().map_err(|source| SetupError {
            phase: SetupPhase::CreateRecord,
            source,
            environment: None,
        })?;
        env.repositories = request.repositories.clone();

        match self.provision(&mut env, request, cancel).await {
            Ok(()) => {
                info!(env_id = %env.id, "environment ready");
                Ok(env)
            }
            Err((phase, source)) => {
                env.touch();
                // Keep the registry in step with what actually exists.
                if let Err(e) = self.registry.update(&env) {
                    warn!(env_id = %env.id, error = %e, "failed to record partial environment");
                }
                Err(SetupError {
                    phase,
                    source,
                    environment: Some(Box::new(env)),
                })
            }
        }
    }

    async fn provision(
        &self,
        env: &mut TestEnvironment,
        request: &SetupRequest,
        cancel: &CancellationToken,
    ) -> PhaseResult<()> {
        // Workspace.
        ensure_not_cancelled(SetupPhase::Workspace, cancel)?;
        let root = request.artifact_root.join(env.id.as_str());
        marker::create(&root).map_err(at(SetupPhase::Workspace))?;
        env.temp_dir_root = Some(root.clone());
        env.record_resource(&root);
        for sub in [VMM_DIR, GITSERVER_DIR, ARTIFACTS_DIR] {
            let dir = root.join(sub);
            std::fs::create_dir_all(&dir).map_err(at(SetupPhase::Workspace))?;
            env.record_resource(dir);
        }
        info!(env_id = %env.id, root = %root.display(), "workspace created");

        // Per-environment artifact directory.
        ensure_not_cancelled(SetupPhase::Artifacts, cancel)?;
        let artifact_dir = request
            .artifact_root
            .join(ARTIFACTS_DIR)
            .join(env.id.as_str());
        std::fs::create_dir_all(&artifact_dir).map_err(at(SetupPhase::Artifacts))?;
        env.artifact_path = Some(artifact_dir.clone());
        env.record_resource(&artifact_dir);
        self.checkpoint(env);

        // Base image.
        ensure_not_cancelled(SetupPhase::Image, cancel)?;
        let base_image = ImageCache::new(&request.image_cache_dir, self.options.image.clone())
            .with_http_timeout(self.options.http_timeout)
            .ensure(request.allow_image_download, cancel)
            .await
            .map_err(at(SetupPhase::Image))?;

        // Host keypair.
        ensure_not_cancelled(SetupPhase::SshKeys, cancel)?;
        let keypair =
            keys::generate_keypair(&self.options.ssh_keygen, &artifact_dir, env.id.as_str())
                .await
                .map_err(at(SetupPhase::SshKeys))?;
        env.record_resources([&keypair.private_key, &keypair.public_key]);
        env.ssh_keys = Some(keypair.clone());
        let host_key = keys::read_public_key(&keypair.public_key)
            .await
            .map_err(at(SetupPhase::SshKeys))?;
        self.checkpoint(env);

        // Target VM.
        let target_name = format!("{}-target", env.id);
        let vm_config = VmConfig {
            name: target_name.clone(),
            base_image: base_image.clone(),
            work_dir: root.join(VMM_DIR),
            ssh_public_key: host_key.clone(),
            vcpus: request.target.vcpus,
            memory_mib: request.target.memory_mib,
            disk_gib: request.target.disk_gib,
            ip_timeout: self.options.ip_timeout,
        };
        // Named before creation so teardown can find a half-created domain.
        env.target_vm = Some(VmMetadata {
            name: target_name.clone(),
            ..Default::default()
        });
        self.checkpoint(env);
        let target = self
            .provisioner
            .create_vm(&vm_config, cancel)
            .await
            .map_err(at(SetupPhase::TargetVm))?;
        env.record_resources(&target.created_files);
        env.target_vm = Some(target.clone());
        self.checkpoint(env);
        if !target.has_ip() {
            return Err((
                SetupPhase::TargetVm,
                EnvError::Provisioning(format!("VM {target_name} reported no IP")),
            ));
        }

        let ssh_target = SshTarget {
            host: target.ip.clone(),
            port: self.options.ssh_port,
            user: self.options.ssh_user.clone(),
            private_key: keypair.private_key.clone(),
        };
        self.ssh
            .await_ready(&ssh_target, self.options.ssh_ready_timeout, cancel)
            .await
            .map_err(at(SetupPhase::TargetVm))?;
        info!(env_id = %env.id, vm = %target.name, ip = %target.ip, "target VM ready");

        // Git server: needs the target VM's own key, so it comes second.
        ensure_not_cancelled(SetupPhase::GitServer, cancel)?;
        let guest_key = self
            .ssh
            .guest_public_key(&ssh_target, cancel)
            .await
            .map_err(at(SetupPhase::GitServer))?;

        let git_name = format!("{}-gitserver", env.id);
        env.git_server_vm = Some(VmMetadata {
            name: git_name.clone(),
            ..Default::default()
        });
        self.checkpoint(env);
        let mut server = self.git_servers.build(GitServerRequest {
            env_id: env.id.clone(),
            vm_name: git_name,
            work_dir: root.join(GITSERVER_DIR),
            source_dir: request.gitserver_source.clone(),
            base_image,
            authorized_keys: vec![host_key, guest_key],
            repositories: request.repositories.clone(),
            vcpus: request.git_server.vcpus,
            memory_mib: request.git_server.memory_mib,
            disk_gib: request.git_server.disk_gib,
        });
        server.run(cancel).await.map_err(at(SetupPhase::GitServer))?;

        // Merge what the git server reports.
        let status = server.status().ok_or_else(|| {
            (
                SetupPhase::GitServerMerge,
                EnvError::Provisioning("git server reported no status after run".to_string()),
            )
        })?;
        env.record_resources(&status.vm.created_files);
        env.git_ssh_urls.extend(status.ssh_urls);
        env.git_server_vm = Some(status.vm);
        self.checkpoint(env);
        let missing = env.missing_repositories();
        if !missing.is_empty() {
            return Err((
                SetupPhase::GitServerMerge,
                EnvError::Provisioning(format!(
                    "git server exposed no URL for {}",
                    missing.join(", ")
                )),
            ));
        }
        info!(
            env_id = %env.id,
            port = status.service_port,
            repositories = env.git_ssh_urls.len(),
            "git server ready"
        );

        // Persist.
        env.status = EnvironmentStatus::Created;
        env.touch();
        self.registry
            .update(env)
            .map_err(at(SetupPhase::Persist))?;
        self.store
            .save(env, cancel)
            .map_err(at(SetupPhase::Persist))?;
        Ok(())
    }

    /// Mirrors the partially built record into the registry.
    fn checkpoint(&self, env: &mut TestEnvironment) {
        env.touch();
        if let Err(e) = self.registry.update(env) {
            tracing::debug!(env_id = %env.id, error = %e, "registry checkpoint skipped");
        }
    }
}
