//! Shared fakes and fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use e2e_testenv::{
    ArtifactStore, DynVmProvisioner, EnvironmentManager, GitServer, GitServerFactory,
    GitServerRequest, GitServerStatus, GuestSsh, ImageSource, ProviderError, ProviderResult,
    SetupOptions, SetupRequest, SshTarget, VmConfig, VmMetadata, VmProvisioner, VmSizing,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

pub const TARGET_IP: &str = "192.168.122.10";
pub const GIT_SERVER_IP: &str = "192.168.122.11";
pub const GUEST_KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIGuestKey ubuntu@target";
pub const IMAGE_FILE: &str = "base.img";

/// Returns true if `ssh-keygen` can be spawned.
pub fn ssh_keygen_available() -> bool {
    std::process::Command::new("ssh-keygen")
        .arg("-?")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok()
}

// =============================================================================
// VM provisioner
// =============================================================================

#[derive(Default)]
struct ProvisionerState {
    domains: HashSet<String>,
    fail_create: bool,
    fail_destroy: HashSet<String>,
    fail_exists: HashSet<String>,
    calls: Vec<String>,
}

/// In-memory provisioner. Domains exist from `create_vm` until `destroy_vm`.
#[derive(Default)]
pub struct FakeProvisioner {
    state: Mutex<ProvisionerState>,
}

impl FakeProvisioner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_domain(&self, name: &str) {
        self.state.lock().unwrap().domains.insert(name.to_string());
    }

    pub fn remove_domain(&self, name: &str) {
        self.state.lock().unwrap().domains.remove(name);
    }

    pub fn has_domain(&self, name: &str) -> bool {
        self.state.lock().unwrap().domains.contains(name)
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.state.lock().unwrap().fail_create = fail;
    }

    pub fn set_fail_destroy(&self, name: &str, fail: bool) {
        let mut state = self.state.lock().unwrap();
        if fail {
            state.fail_destroy.insert(name.to_string());
        } else {
            state.fail_destroy.remove(name);
        }
    }

    pub fn set_fail_exists(&self, name: &str) {
        self.state.lock().unwrap().fail_exists.insert(name.to_string());
    }

    /// Calls in order, formatted as `op:name`.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }
}

#[async_trait]
impl VmProvisioner for FakeProvisioner {
    async fn create_vm(
        &self,
        config: &VmConfig,
        _cancel: &CancellationToken,
    ) -> ProviderResult<VmMetadata> {
        {
            let mut state = self.state.lock().unwrap();
            state.calls.push(format!("create:{}", config.name));
            if state.fail_create {
                return Err(ProviderError::Failed("virt-install exited with 1".into()));
            }
            state.domains.insert(config.name.clone());
        }

        let disk = config.work_dir.join(format!("{}.qcow2", config.name));
        std::fs::write(&disk, b"disk").map_err(|e| ProviderError::Failed(e.to_string()))?;
        Ok(VmMetadata {
            name: config.name.clone(),
            ip: TARGET_IP.to_string(),
            vcpus: config.vcpus,
            memory_mib: config.memory_mib,
            disk_gib: config.disk_gib,
            created_files: vec![disk],
        })
    }

    async fn destroy_vm(&self, name: &str, _cancel: &CancellationToken) -> ProviderResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("destroy:{name}"));
        if state.fail_destroy.contains(name) {
            return Err(ProviderError::Failed(format!("virsh destroy {name} failed")));
        }
        state.domains.remove(name);
        Ok(())
    }

    async fn domain_exists(&self, name: &str, _cancel: &CancellationToken) -> ProviderResult<bool> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("exists:{name}"));
        if state.fail_exists.contains(name) {
            return Err(ProviderError::Connection("libvirt socket unavailable".into()));
        }
        Ok(state.domains.contains(name))
    }
}

// =============================================================================
// Git server
// =============================================================================

#[derive(Default)]
struct GitServerFactoryState {
    requests: Vec<GitServerRequest>,
    fail_run: bool,
    omit_repository: Option<String>,
}

/// Builds [`FakeGitServer`]s that register their VM with the shared provisioner.
pub struct FakeGitServerFactory {
    provisioner: Arc<FakeProvisioner>,
    state: Arc<Mutex<GitServerFactoryState>>,
}

impl FakeGitServerFactory {
    pub fn new(provisioner: Arc<FakeProvisioner>) -> Arc<Self> {
        Arc::new(Self {
            provisioner,
            state: Arc::default(),
        })
    }

    pub fn set_fail_run(&self, fail: bool) {
        self.state.lock().unwrap().fail_run = fail;
    }

    /// Makes the next servers leave `repository` without a URL.
    pub fn omit_repository(&self, repository: &str) {
        self.state.lock().unwrap().omit_repository = Some(repository.to_string());
    }

    pub fn requests(&self) -> Vec<GitServerRequest> {
        self.state.lock().unwrap().requests.clone()
    }
}

impl GitServerFactory for FakeGitServerFactory {
    fn build(&self, request: GitServerRequest) -> Box<dyn GitServer> {
        let mut state = self.state.lock().unwrap();
        state.requests.push(request.clone());
        Box::new(FakeGitServer {
            request,
            provisioner: Arc::clone(&self.provisioner),
            fail_run: state.fail_run,
            omit_repository: state.omit_repository.clone(),
            status: None,
        })
    }
}

pub struct FakeGitServer {
    request: GitServerRequest,
    provisioner: Arc<FakeProvisioner>,
    fail_run: bool,
    omit_repository: Option<String>,
    status: Option<GitServerStatus>,
}

#[async_trait]
impl GitServer for FakeGitServer {
    async fn run(&mut self, _cancel: &CancellationToken) -> ProviderResult<()> {
        let name = &self.request.vm_name;
        // The domain exists even when bootstrapping fails afterwards.
        self.provisioner.add_domain(name);
        if self.fail_run {
            return Err(ProviderError::Failed("git bootstrap failed".into()));
        }

        let disk = self.request.work_dir.join(format!("{name}.qcow2"));
        std::fs::write(&disk, b"disk").map_err(|e| ProviderError::Failed(e.to_string()))?;

        let ssh_urls: BTreeMap<_, _> = self
            .request
            .repositories
            .iter()
            .filter(|r| self.omit_repository.as_deref() != Some(r.as_str()))
            .map(|r| {
                (
                    r.clone(),
                    format!("ssh://git@{GIT_SERVER_IP}/srv/git/{r}.git"),
                )
            })
            .collect();
        self.status = Some(GitServerStatus {
            vm: VmMetadata {
                name: name.clone(),
                ip: GIT_SERVER_IP.to_string(),
                vcpus: self.request.vcpus,
                memory_mib: self.request.memory_mib,
                disk_gib: self.request.disk_gib,
                created_files: vec![disk],
            },
            ssh_urls,
            service_port: 22,
        });
        Ok(())
    }

    fn status(&self) -> Option<GitServerStatus> {
        self.status.clone()
    }

    async fn teardown(&mut self, _cancel: &CancellationToken) -> ProviderResult<()> {
        self.provisioner.remove_domain(&self.request.vm_name);
        self.status = None;
        Ok(())
    }
}

// =============================================================================
// Guest SSH
// =============================================================================

#[derive(Default)]
pub struct FakeGuestSsh {
    pub fail_ready: Mutex<bool>,
    pub targets: Mutex<Vec<SshTarget>>,
}

impl FakeGuestSsh {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl GuestSsh for FakeGuestSsh {
    async fn await_ready(
        &self,
        target: &SshTarget,
        timeout: Duration,
        _cancel: &CancellationToken,
    ) -> ProviderResult<()> {
        self.targets.lock().unwrap().push(target.clone());
        if *self.fail_ready.lock().unwrap() {
            return Err(ProviderError::Timeout {
                what: format!("SSH on {}", target.host),
                elapsed: timeout,
            });
        }
        Ok(())
    }

    async fn guest_public_key(
        &self,
        _target: &SshTarget,
        _cancel: &CancellationToken,
    ) -> ProviderResult<String> {
        Ok(GUEST_KEY.to_string())
    }
}

// =============================================================================
// Harness
// =============================================================================

/// A manager wired to fakes inside a scratch directory.
pub struct Harness {
    pub dir: TempDir,
    pub provisioner: Arc<FakeProvisioner>,
    pub git_servers: Arc<FakeGitServerFactory>,
    pub ssh: Arc<FakeGuestSsh>,
    pub manager: EnvironmentManager,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = FakeProvisioner::new();
        let git_servers = FakeGitServerFactory::new(Arc::clone(&provisioner));
        let ssh = FakeGuestSsh::new();
        let manager = open_manager(dir.path(), &provisioner, &git_servers, &ssh);
        Self {
            dir,
            provisioner,
            git_servers,
            ssh,
            manager,
        }
    }

    pub fn artifact_root(&self) -> PathBuf {
        self.dir.path().join("artifacts")
    }

    pub fn image_cache_dir(&self) -> PathBuf {
        self.dir.path().join("images")
    }

    pub fn store_path(&self) -> PathBuf {
        self.dir.path().join("state").join("environments.json")
    }

    /// Puts a base image into the cache.
    pub fn seed_image(&self) {
        std::fs::create_dir_all(self.image_cache_dir()).unwrap();
        std::fs::write(self.image_cache_dir().join(IMAGE_FILE), b"qcow").unwrap();
    }

    pub fn request(&self) -> SetupRequest {
        let source = self.dir.path().join("source");
        std::fs::create_dir_all(&source).unwrap();
        SetupRequest {
            artifact_root: self.artifact_root(),
            image_cache_dir: self.image_cache_dir(),
            gitserver_source: source,
            allow_image_download: false,
            repositories: vec!["dotfiles".to_string(), "infra".to_string()],
            target: VmSizing::TARGET,
            git_server: VmSizing::GIT_SERVER,
        }
    }

    /// Opens a second manager over the same store and fakes.
    pub fn reopen(&self) -> EnvironmentManager {
        open_manager(self.dir.path(), &self.provisioner, &self.git_servers, &self.ssh)
    }

    pub fn store(&self) -> ArtifactStore {
        ArtifactStore::new(self.store_path())
    }
}

fn open_manager(
    root: &Path,
    provisioner: &Arc<FakeProvisioner>,
    git_servers: &Arc<FakeGitServerFactory>,
    ssh: &Arc<FakeGuestSsh>,
) -> EnvironmentManager {
    let store = Arc::new(ArtifactStore::new(
        root.join("state").join("environments.json"),
    ));
    let dyn_provisioner: DynVmProvisioner = provisioner.clone();
    let options = SetupOptions {
        image: ImageSource {
            url: "http://127.0.0.1:9/unused.img".to_string(),
            file_name: IMAGE_FILE.to_string(),
            sha256: None,
        },
        ssh_ready_timeout: Duration::from_secs(1),
        ip_timeout: Duration::from_secs(1),
        ..SetupOptions::default()
    };
    EnvironmentManager::open(
        store,
        dyn_provisioner,
        git_servers.clone(),
        ssh.clone(),
        options,
        &CancellationToken::new(),
    )
    .unwrap()
}
