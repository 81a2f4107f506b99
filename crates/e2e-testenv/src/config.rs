//! Configuration management.
//!
//! Configuration is loaded from multiple sources with the following priority:
//!
//! 1. Environment variables (`E2E_TESTENV_*`, nested keys split on `__`)
//! 2. Configuration file (~/.config/e2e-testenv/config.toml)
//! 3. Default values
//!
//! ## Example Configuration File
//!
//! ```toml
//! repositories = ["dotfiles"]
//!
//! [paths]
//! artifact_root = "/var/tmp/e2e"
//! image_cache_dir = "/var/cache/e2e/images"
//! gitserver_source = "/srv/e2e/source"
//!
//! [image]
//! allow_download = true
//!
//! [vm.target]
//! vcpus = 2
//! memory_mib = 2048
//! disk_gib = 20
//!
//! [timeouts]
//! ssh_ready_secs = 120
//!
//! [logging]
//! level = "debug"
//! format = "json"
//! ```
//!
//! `E2E_TESTENV_PATHS__ARTIFACT_ROOT=/tmp/e2e` overrides `paths.artifact_root`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::image::{DEFAULT_IMAGE_FILE, DEFAULT_IMAGE_URL, ImageSource};
use crate::setup::{SetupOptions, SetupRequest, VmSizing};
use crate::store::STORE_FILE_NAME;

/// Prefix of configuration environment variables.
pub const ENV_PREFIX: &str = "E2E_TESTENV_";

/// Orchestrator configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Repositories the git server must expose.
    pub repositories: Vec<String>,
    pub paths: PathsConfig,
    pub image: ImageConfig,
    pub vm: VmSizingConfig,
    pub timeouts: TimeoutsConfig,
    pub ssh: SshConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Loads configuration from the user config file and environment.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration cannot be loaded.
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(user_config_path())
    }

    /// Loads configuration from a specific file, then the environment.
    ///
    /// A missing file is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be parsed.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
    }

    /// Path of the store document.
    #[must_use]
    pub fn store_path(&self) -> PathBuf {
        self.paths
            .store_file
            .clone()
            .unwrap_or_else(|| self.paths.artifact_root.join(STORE_FILE_NAME))
    }

    /// Per-invocation setup inputs derived from this configuration.
    #[must_use]
    pub fn setup_request(&self) -> SetupRequest {
        SetupRequest {
            artifact_root: self.paths.artifact_root.clone(),
            image_cache_dir: self.paths.image_cache_dir.clone(),
            gitserver_source: self.paths.gitserver_source.clone(),
            allow_image_download: self.image.allow_download,
            repositories: self.repositories.clone(),
            target: self.vm.target,
            git_server: self.vm.git_server,
        }
    }

    /// Settings shared by every setup run.
    #[must_use]
    pub fn setup_options(&self) -> SetupOptions {
        SetupOptions {
            image: self.image.source(),
            ssh_keygen: self.ssh.ssh_keygen.clone(),
            ssh_user: self.ssh.user.clone(),
            ssh_port: self.ssh.port,
            ssh_ready_timeout: Duration::from_secs(self.timeouts.ssh_ready_secs),
            ip_timeout: Duration::from_secs(self.timeouts.ip_secs),
            http_timeout: Duration::from_secs(self.timeouts.http_secs),
        }
    }
}

/// Filesystem locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root under which environment directories are created.
    pub artifact_root: PathBuf,
    /// Shared base image cache.
    pub image_cache_dir: PathBuf,
    /// Source material served by the git server. Must be set.
    pub gitserver_source: PathBuf,
    /// Store document; defaults to `<artifact_root>/environments.json`.
    pub store_file: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let data = default_data_dir();
        Self {
            artifact_root: data.join("artifacts"),
            image_cache_dir: data.join("images"),
            gitserver_source: PathBuf::new(),
            store_file: None,
        }
    }
}

/// Base image settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub url: String,
    pub file_name: String,
    /// Expected SHA-256 of the download.
    pub sha256: Option<String>,
    /// Download the image when it is not cached.
    pub allow_download: bool,
}

impl ImageConfig {
    #[must_use]
    pub fn source(&self) -> ImageSource {
        ImageSource {
            url: self.url.clone(),
            file_name: self.file_name.clone(),
            sha256: self.sha256.clone(),
        }
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_IMAGE_URL.to_string(),
            file_name: DEFAULT_IMAGE_FILE.to_string(),
            sha256: None,
            allow_download: false,
        }
    }
}

/// VM sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VmSizingConfig {
    pub target: VmSizing,
    pub git_server: VmSizing,
}

impl Default for VmSizingConfig {
    fn default() -> Self {
        Self {
            target: VmSizing::TARGET,
            git_server: VmSizing::GIT_SERVER,
        }
    }
}

/// Timeouts, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    /// Wait for the target VM's SSH service.
    pub ssh_ready_secs: u64,
    /// Wait for a VM's IP to be resolvable.
    pub ip_secs: u64,
    /// Whole base image download.
    pub http_secs: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            ssh_ready_secs: 60,
            ip_secs: 60,
            http_secs: 1800,
        }
    }
}

/// SSH settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    /// Login user on the VMs.
    pub user: String,
    pub port: u16,
    /// `ssh-keygen` binary.
    pub ssh_keygen: PathBuf,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "ubuntu".to_string(),
            port: 22,
            ssh_keygen: PathBuf::from("ssh-keygen"),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    pub level: String,
    /// Log format (text, json).
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("e2e-testenv")
}

fn user_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("~/.config"))
        .join("e2e-testenv")
        .join("config.toml")
}
