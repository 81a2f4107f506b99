//! # e2e-testenv
//!
//! Lifecycle orchestration for disposable end-to-end test environments.
//!
//! An environment pairs a target device VM with a git server VM that serves
//! the repositories under test, plus the directories, keys and records
//! needed to reach and later reclaim them:
//!
//! - [`EnvironmentManager`]: setup, teardown and status changes
//! - [`SetupPipeline`] / [`TeardownPipeline`]: the two halves of the lifecycle
//! - [`EnvironmentRegistry`]: live records and the status state machine
//! - [`ArtifactStore`]: durable JSON record store
//! - [`marker`]: managed-directory safety marker
//! - [`VmProvisioner`], [`GitServer`], [`GuestSsh`]: provider ports
//!
//! Deletion is fail-closed: a directory is only ever removed recursively if
//! it carries the marker file written when it was created.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod environment;
pub mod error;
pub mod image;
pub mod keys;
pub mod logging;
pub mod manager;
pub mod marker;
pub mod provider;
pub mod registry;
pub mod setup;
pub mod ssh;
pub mod store;
pub mod teardown;

pub use config::Config;
pub use environment::{EnvironmentId, EnvironmentStatus, SshKeyPair, TestEnvironment, VmMetadata};
pub use error::{EnvError, Result};
pub use image::{ImageCache, ImageSource};
pub use manager::EnvironmentManager;
pub use provider::{
    DynVmProvisioner, GitServer, GitServerFactory, GitServerRequest, GitServerStatus, GuestSsh,
    ProviderError, ProviderResult, SshTarget, VmConfig, VmProvisioner,
};
pub use registry::EnvironmentRegistry;
pub use setup::{SetupError, SetupOptions, SetupPhase, SetupPipeline, SetupRequest, VmSizing};
pub use ssh::OpenSshGuest;
pub use store::ArtifactStore;
pub use teardown::{TeardownFailure, TeardownPipeline, TeardownReport, TeardownResource};
