//! File-backed artifact store.
//!
//! All environment records live in one JSON document:
//!
//! ```text
//! {
//!   "version": "1",
//!   "last_updated": "2024-01-01T12:00:00Z",
//!   "environments": { "<id>": { ...TestEnvironment... } }
//! }
//! ```
//!
//! The document is cached in memory and lazily loaded the first time the
//! cache is found empty. Every mutation rewrites the whole file through a
//! temporary file and an atomic rename. Records are cloned on the way in and
//! on the way out, so callers never alias the cache.

use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::environment::{EnvironmentId, TestEnvironment};
use crate::error::{EnvError, Result};

/// Schema version written to and required from the store document.
pub const STORE_VERSION: &str = "1";

/// Default file name of the store document.
pub const STORE_FILE_NAME: &str = "environments.json";

type Environments = BTreeMap<EnvironmentId, TestEnvironment>;

/// Document as written to disk.
#[derive(Debug, Serialize)]
struct StoreDocument<'a> {
    version: &'static str,
    last_updated: DateTime<Utc>,
    environments: &'a Environments,
}

/// Document as read from disk; every field is optional so that schema
/// problems surface as [`EnvError::InvalidSchema`] rather than a JSON error.
#[derive(Debug, Deserialize)]
struct RawStoreDocument {
    version: Option<String>,
    #[serde(default)]
    environments: Option<Environments>,
}

/// Durable registry of environment records.
pub struct ArtifactStore {
    /// Path of the JSON document.
    path: PathBuf,
    /// Cached records. Writers hold the lock across the file rewrite.
    environments: RwLock<Environments>,
}

impl ArtifactStore {
    /// Creates a store backed by `path`. Nothing is read until first use.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            environments: RwLock::new(BTreeMap::new()),
        }
    }

    /// Returns the path of the backing document.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Inserts or replaces `env` and rewrites the document.
    ///
    /// # Errors
    ///
    /// Returns [`EnvError::InvalidSchema`] for an empty ID (the file is not
    /// touched), [`EnvError::Cancelled`] if `cancel` already fired, or an
    /// error from loading or writing the document.
    pub fn save(&self, env: &TestEnvironment, cancel: &CancellationToken) -> Result<()> {
        check_cancelled(cancel)?;
        if env.id.is_empty() {
            return Err(EnvError::invalid_schema("environment ID is empty"));
        }

        let mut environments = self
            .environments
            .write()
            .map_err(|_| EnvError::LockPoisoned("artifact store"))?;
        self.load_if_empty(&mut environments)?;

        let previous = environments.insert(env.id.clone(), env.clone());
        if let Err(e) = self.write_document(&environments) {
            // Keep the cache in step with what is actually on disk.
            match previous {
                Some(prev) => environments.insert(env.id.clone(), prev),
                None => environments.remove(&env.id),
            };
            return Err(e);
        }

        debug!(env_id = %env.id, status = %env.status, "environment saved");
        Ok(())
    }

    /// Loads a copy of the record with `id`.
    ///
    /// # Errors
    ///
    /// Returns [`EnvError::InvalidSchema`] for an empty ID or a corrupt
    /// document, and [`EnvError::NotFound`] if no such record exists.
    pub fn load(&self, id: &EnvironmentId, cancel: &CancellationToken) -> Result<TestEnvironment> {
        check_cancelled(cancel)?;
        if id.is_empty() {
            return Err(EnvError::invalid_schema("environment ID is empty"));
        }
        self.ensure_loaded()?;

        let environments = self
            .environments
            .read()
            .map_err(|_| EnvError::LockPoisoned("artifact store"))?;
        environments
            .get(id)
            .cloned()
            .ok_or_else(|| EnvError::not_found(format!("environment {id}")))
    }

    /// Returns copies of every record, ordered by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be loaded.
    pub fn list_all(&self, cancel: &CancellationToken) -> Result<Vec<TestEnvironment>> {
        check_cancelled(cancel)?;
        self.ensure_loaded()?;

        let environments = self
            .environments
            .read()
            .map_err(|_| EnvError::LockPoisoned("artifact store"))?;
        Ok(environments.values().cloned().collect())
    }

    /// Removes the record with `id` and rewrites the document.
    ///
    /// # Errors
    ///
    /// Returns [`EnvError::NotFound`] if no such record exists.
    pub fn delete(&self, id: &EnvironmentId, cancel: &CancellationToken) -> Result<()> {
        check_cancelled(cancel)?;
        if id.is_empty() {
            return Err(EnvError::invalid_schema("environment ID is empty"));
        }

        let mut environments = self
            .environments
            .write()
            .map_err(|_| EnvError::LockPoisoned("artifact store"))?;
        self.load_if_empty(&mut environments)?;

        let removed = environments
            .remove(id)
            .ok_or_else(|| EnvError::not_found(format!("environment {id}")))?;
        if let Err(e) = self.write_document(&environments) {
            environments.insert(id.clone(), removed);
            return Err(e);
        }

        info!(env_id = %id, "environment record deleted");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Private helpers
    // -------------------------------------------------------------------------

    /// Populates an empty cache from disk, for read paths.
    fn ensure_loaded(&self) -> Result<()> {
        {
            let environments = self
                .environments
                .read()
                .map_err(|_| EnvError::LockPoisoned("artifact store"))?;
            if !environments.is_empty() {
                return Ok(());
            }
        }
        let mut environments = self
            .environments
            .write()
            .map_err(|_| EnvError::LockPoisoned("artifact store"))?;
        self.load_if_empty(&mut environments)
    }

    fn load_if_empty(&self, environments: &mut Environments) -> Result<()> {
        if environments.is_empty() {
            *environments = read_document(&self.path)?;
        }
        Ok(())
    }

    fn write_document(&self, environments: &Environments) -> Result<()> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)?;

        let document = StoreDocument {
            version: STORE_VERSION,
            last_updated: Utc::now(),
            environments,
        };
        let data = serde_json::to_vec_pretty(&document)?;

        let mut temp = tempfile::NamedTempFile::new_in(&parent)?;
        temp.write_all(&data)?;
        temp.as_file().sync_all()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(temp.path(), fs::Permissions::from_mode(0o600))?;
        }
        temp.persist(&self.path).map_err(|e| EnvError::Io(e.error))?;

        debug!(
            path = %self.path.display(),
            records = environments.len(),
            "artifact store written"
        );
        Ok(())
    }
}

/// Reads and validates the document. A missing file is an empty store.
fn read_document(path: &Path) -> Result<Environments> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(e.into()),
    };

    let raw: RawStoreDocument = serde_json::from_slice(&data).map_err(|e| {
        EnvError::invalid_schema(format!("malformed store {}: {e}", path.display()))
    })?;

    match raw.version.as_deref() {
        None => {
            return Err(EnvError::invalid_schema(format!(
                "store {} has no version field",
                path.display()
            )));
        }
        Some(STORE_VERSION) => {}
        Some(other) => {
            return Err(EnvError::invalid_schema(format!(
                "store {} has unsupported version {other:?}",
                path.display()
            )));
        }
    }

    let environments = raw.environments.unwrap_or_default();
    for (key, env) in &environments {
        if key.is_empty() || *key != env.id {
            return Err(EnvError::invalid_schema(format!(
                "store entry {key:?} holds record {:?}",
                env.id.as_str()
            )));
        }
    }
    Ok(environments)
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(EnvError::Cancelled);
    }
    Ok(())
}
