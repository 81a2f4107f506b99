//! Environment manager: the entry point for callers.
//!
//! Owns the registry and the store and keeps them in step. Setup records
//! are persisted once ready, or as soon as setup fails so that a later
//! teardown by ID can reclaim what was created. Teardown deletes the record
//! only when every resource is gone; otherwise the record stays behind as
//! `partially_deleted` for a retry.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::environment::{EnvironmentId, EnvironmentStatus, TestEnvironment};
use crate::error::{EnvError, Result};
use crate::provider::{DynVmProvisioner, GitServerFactory, GuestSsh};
use crate::registry::EnvironmentRegistry;
use crate::setup::{SetupError, SetupOptions, SetupPipeline, SetupRequest};
use crate::store::ArtifactStore;
use crate::teardown::{TeardownPipeline, TeardownReport};

/// Coordinates setup, teardown and status changes of environments.
pub struct EnvironmentManager {
    registry: Arc<EnvironmentRegistry>,
    store: Arc<ArtifactStore>,
    setup: SetupPipeline,
    teardown: TeardownPipeline,
}

impl EnvironmentManager {
    /// Opens the manager, loading every persisted record into the registry.
    ///
    /// # Errors
    ///
    /// Returns an error if the store document cannot be read.
    pub fn open(
        store: Arc<ArtifactStore>,
        provisioner: DynVmProvisioner,
        git_servers: Arc<dyn GitServerFactory>,
        ssh: Arc<dyn GuestSsh>,
        options: SetupOptions,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let registry = Arc::new(EnvironmentRegistry::new());
        let persisted = store.list_all(cancel)?;
        for env in &persisted {
            registry.insert(env)?;
        }
        info!(
            store = %store.path().display(),
            environments = persisted.len(),
            "environment manager opened"
        );

        let setup = SetupPipeline::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            Arc::clone(&provisioner),
            git_servers,
            ssh,
            options,
        );
        Ok(Self {
            registry,
            store,
            setup,
            teardown: TeardownPipeline::new(provisioner),
        })
    }

    /// Assembles a new environment.
    ///
    /// # Errors
    ///
    /// On failure the partial record, if any, is persisted before the
    /// [`SetupError`] is returned; pass its ID to [`teardown`](Self::teardown).
    pub async fn setup(
        &self,
        request: &SetupRequest,
        cancel: &CancellationToken,
    ) -> std::result::Result<TestEnvironment, SetupError> {
        match self.setup.run(request, cancel).await {
            Ok(env) => Ok(env),
            Err(mut err) => {
                if let Some(env) = err.environment.as_deref_mut() {
                    let note = format!("setup failed during {}: {}", err.phase, err.source);
                    env.append_note(&note);
                    env.touch();
                    if let Err(e) = self.registry.update(env) {
                        warn!(
                            env_id = %env.id,
                            error = %e,
                            "failed to record partial environment"
                        );
                    }
                    // Persist with a fresh token: the caller's may be what failed setup.
                    if let Err(e) = self.store.save(env, &CancellationToken::new()) {
                        warn!(
                            env_id = %env.id,
                            error = %e,
                            "failed to persist partial environment"
                        );
                    }
                }
                Err(err)
            }
        }
    }

    /// Tears down a known environment.
    ///
    /// A clean teardown removes the record from the store and registry. An
    /// incomplete one leaves it as `partially_deleted`.
    ///
    /// # Errors
    ///
    /// Returns [`EnvError::NotFound`] for an unknown ID, or a store error.
    pub async fn teardown(
        &self,
        id: &EnvironmentId,
        cancel: &CancellationToken,
    ) -> Result<TeardownReport> {
        let env = match self.registry.get(id) {
            Ok(env) => env,
            Err(e) if e.is_not_found() => {
                let env = self.store.load(id, cancel)?;
                self.registry.insert(&env)?;
                env
            }
            Err(e) => return Err(e),
        };
        self.teardown_record(&env, cancel).await
    }

    /// Tears down a record that may not be registered or persisted, such as
    /// the partial environment of a [`SetupError`].
    ///
    /// The outcome is recorded even if `cancel` has fired, since a cancelled
    /// teardown is exactly the case that leaves resources behind.
    ///
    /// # Errors
    ///
    /// Returns [`EnvError::InvalidSchema`] for a record with an empty ID, or
    /// a store error.
    pub async fn teardown_record(
        &self,
        env: &TestEnvironment,
        cancel: &CancellationToken,
    ) -> Result<TeardownReport> {
        let report = self.teardown.run(env, cancel).await?;
        let persist = CancellationToken::new();

        if report.is_clean() {
            match self.store.delete(&env.id, &persist) {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
            match self.registry.remove(&env.id) {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(env_id = %env.id, error = %e, "failed to drop registry record"),
            }
            info!(env_id = %env.id, "environment deleted");
            return Ok(report);
        }

        let mut remaining = env.clone();
        remaining.status = EnvironmentStatus::PartiallyDeleted;
        remaining.append_note(&format!("teardown incomplete: {report}"));
        remaining.touch();
        if self.registry.update(&remaining).is_err() {
            self.registry.insert(&remaining)?;
        }
        self.store.save(&remaining, &persist)?;
        warn!(
            env_id = %env.id,
            failures = report.failures.len(),
            "environment left partially deleted"
        );
        Ok(report)
    }

    /// Moves an environment to `next` and persists the change. If the store
    /// write fails the registry keeps the previous status.
    ///
    /// # Errors
    ///
    /// Returns [`EnvError::InvalidTransition`] if the move is not allowed,
    /// or the store error.
    pub fn transition(
        &self,
        id: &EnvironmentId,
        next: EnvironmentStatus,
        cancel: &CancellationToken,
    ) -> Result<TestEnvironment> {
        if cancel.is_cancelled() {
            return Err(EnvError::Cancelled);
        }
        let previous = self.registry.get(id)?;
        let env = self.registry.transition(id, next)?;
        if let Err(e) = self.store.save(&env, cancel) {
            if let Err(restore) = self.registry.update(&previous) {
                warn!(env_id = %id, error = %restore, "failed to restore previous status");
            }
            return Err(e);
        }
        Ok(env)
    }

    /// Returns a copy of the record with `id`.
    ///
    /// # Errors
    ///
    /// Returns [`EnvError::NotFound`] if the ID is unknown.
    pub fn get(&self, id: &EnvironmentId) -> Result<TestEnvironment> {
        self.registry.get(id)
    }

    /// Returns copies of all known records, ordered by ID.
    pub fn list(&self) -> Result<Vec<TestEnvironment>> {
        self.registry.list()
    }

    #[must_use]
    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }
}
