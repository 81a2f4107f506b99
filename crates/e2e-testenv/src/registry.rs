//! In-memory environment registry and status state machine.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::environment::{EnvironmentId, EnvironmentStatus, TestEnvironment};
use crate::error::{EnvError, Result};

/// Upper bound on ID regeneration when a collision is found.
const MAX_ID_ATTEMPTS: usize = 16;

/// Produces a candidate ID for a record created at the given time.
pub type IdGenerator = Box<dyn Fn(DateTime<Utc>) -> EnvironmentId + Send + Sync>;

/// Live environment records keyed by ID.
///
/// Records are cloned in and out; mutating a returned record never changes
/// registry state until it is passed back through [`update`](Self::update).
pub struct EnvironmentRegistry {
    environments: RwLock<HashMap<EnvironmentId, TestEnvironment>>,
    generate_id: IdGenerator,
}

impl Default for EnvironmentRegistry {
    fn default() -> Self {
        Self::with_id_generator(Box::new(EnvironmentId::generate))
    }
}

impl EnvironmentRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty registry that draws IDs from `generate_id`.
    #[must_use]
    pub fn with_id_generator(generate_id: IdGenerator) -> Self {
        Self {
            environments: RwLock::default(),
            generate_id,
        }
    }

    /// Creates and registers a fresh record with a collision-free ID.
    ///
    /// # Errors
    ///
    /// Returns an error if no unused ID could be generated.
    pub fn create(&self) -> Result<TestEnvironment> {
        let mut environments = self
            .environments
            .write()
            .map_err(|_| EnvError::LockPoisoned("registry"))?;

        let now = Utc::now();
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = (self.generate_id)(now);
            if environments.contains_key(&id) {
                debug!(env_id = %id, "generated ID already in use, retrying");
                continue;
            }
            let env = TestEnvironment::new(id.clone(), now);
            environments.insert(id.clone(), env.clone());
            info!(env_id = %id, "environment registered");
            return Ok(env);
        }
        Err(EnvError::AlreadyExists(
            "could not generate an unused environment ID".to_string(),
        ))
    }

    /// Registers an existing record, e.g. one loaded from the store.
    ///
    /// # Errors
    ///
    /// Returns [`EnvError::AlreadyExists`] if the ID is already known.
    pub fn insert(&self, env: &TestEnvironment) -> Result<()> {
        if env.id.is_empty() {
            return Err(EnvError::invalid_schema("environment ID is empty"));
        }
        let mut environments = self
            .environments
            .write()
            .map_err(|_| EnvError::LockPoisoned("registry"))?;
        if environments.contains_key(&env.id) {
            return Err(EnvError::AlreadyExists(format!("environment {}", env.id)));
        }
        environments.insert(env.id.clone(), env.clone());
        Ok(())
    }

    /// Returns a copy of the record with `id`.
    ///
    /// # Errors
    ///
    /// Returns [`EnvError::NotFound`] if the ID is unknown.
    pub fn get(&self, id: &EnvironmentId) -> Result<TestEnvironment> {
        self.environments
            .read()
            .map_err(|_| EnvError::LockPoisoned("registry"))?
            .get(id)
            .cloned()
            .ok_or_else(|| EnvError::not_found(format!("environment {id}")))
    }

    /// Replaces a known record. Never inserts.
    ///
    /// # Errors
    ///
    /// Returns [`EnvError::NotFound`] if the ID is unknown.
    pub fn update(&self, env: &TestEnvironment) -> Result<()> {
        let mut environments = self
            .environments
            .write()
            .map_err(|_| EnvError::LockPoisoned("registry"))?;
        let slot = environments
            .get_mut(&env.id)
            .ok_or_else(|| EnvError::not_found(format!("environment {}", env.id)))?;
        *slot = env.clone();
        Ok(())
    }

    /// Removes a record, returning it.
    ///
    /// # Errors
    ///
    /// Returns [`EnvError::NotFound`] if the ID is unknown.
    pub fn remove(&self, id: &EnvironmentId) -> Result<TestEnvironment> {
        self.environments
            .write()
            .map_err(|_| EnvError::LockPoisoned("registry"))?
            .remove(id)
            .ok_or_else(|| EnvError::not_found(format!("environment {id}")))
    }

    /// Returns copies of all records, ordered by ID.
    pub fn list(&self) -> Result<Vec<TestEnvironment>> {
        let environments = self
            .environments
            .read()
            .map_err(|_| EnvError::LockPoisoned("registry"))?;
        let mut all: Vec<_> = environments.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    /// Moves a record to `next`, enforcing the transition table and the
    /// record invariants of the target status. Returns the updated copy.
    ///
    /// # Errors
    ///
    /// Returns [`EnvError::NotFound`] for an unknown ID and
    /// [`EnvError::InvalidTransition`] if the move is not allowed.
    pub fn transition(
        &self,
        id: &EnvironmentId,
        next: EnvironmentStatus,
    ) -> Result<TestEnvironment> {
        let mut environments = self
            .environments
            .write()
            .map_err(|_| EnvError::LockPoisoned("registry"))?;
        let env = environments
            .get_mut(id)
            .ok_or_else(|| EnvError::not_found(format!("environment {id}")))?;

        let invalid = |reason: String| EnvError::InvalidTransition {
            id: id.to_string(),
            from: env.status,
            to: next,
            reason,
        };
        if !env.status.can_transition_to(next) {
            return Err(invalid("transition not allowed".to_string()));
        }
        env.check_invariants_for(next).map_err(invalid)?;

        let from = env.status;
        env.status = next;
        env.touch();
        info!(env_id = %id, %from, to = %next, "environment status changed");
        Ok(env.clone())
    }
}
