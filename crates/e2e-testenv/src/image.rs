//! Base VM image cache.
//!
//! Both VMs of an environment are layered on one cloud image kept in a
//! shared cache directory:
//!
//! ```text
//! <image_cache_dir>/
//! └── <file_name>          # e.g. ubuntu-24.04-server-cloudimg-amd64.img
//! ```
//!
//! The image is downloaded only when the caller permits it; otherwise a
//! missing image is an [`EnvError::ImageNotFound`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{EnvError, Result};

/// Default base image download URL.
pub const DEFAULT_IMAGE_URL: &str =
    "https://cloud-images.ubuntu.com/releases/24.04/release/ubuntu-24.04-server-cloudimg-amd64.img";

/// Default cached file name of the base image.
pub const DEFAULT_IMAGE_FILE: &str = "ubuntu-24.04-server-cloudimg-amd64.img";

/// Default HTTP timeout for the whole download.
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(1800);

/// Where the base image comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageSource {
    pub url: String,
    /// File name inside the cache directory.
    pub file_name: String,
    /// Expected lowercase hex SHA-256 of the download, if known.
    pub sha256: Option<String>,
}

impl Default for ImageSource {
    fn default() -> Self {
        Self {
            url: DEFAULT_IMAGE_URL.to_string(),
            file_name: DEFAULT_IMAGE_FILE.to_string(),
            sha256: None,
        }
    }
}

/// Local cache holding the base image.
#[derive(Debug, Clone)]
pub struct ImageCache {
    cache_dir: PathBuf,
    source: ImageSource,
    http_timeout: Duration,
}

impl ImageCache {
    /// Creates a cache rooted at `cache_dir`.
    pub fn new(cache_dir: impl Into<PathBuf>, source: ImageSource) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            source,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }

    /// Overrides the download timeout.
    #[must_use]
    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    /// Path the image lives at once cached.
    #[must_use]
    pub fn image_path(&self) -> PathBuf {
        self.cache_dir.join(&self.source.file_name)
    }

    /// Makes sure the base image is present, downloading it if permitted.
    ///
    /// # Errors
    ///
    /// Returns [`EnvError::ImageNotFound`] if the image is missing and
    /// `allow_download` is false; a download is never attempted in that case.
    pub async fn ensure(
        &self,
        allow_download: bool,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let path = self.image_path();
        if fs::metadata(&path).await.map(|m| m.is_file()).unwrap_or(false) {
            debug!(path = %path.display(), "base image cached");
            return Ok(path);
        }
        if !allow_download {
            return Err(EnvError::ImageNotFound(path));
        }

        fs::create_dir_all(&self.cache_dir).await?;
        self.download(&path, cancel).await?;
        Ok(path)
    }

    async fn download(&self, dest: &Path, cancel: &CancellationToken) -> Result<()> {
        info!(url = %self.source.url, dest = %dest.display(), "downloading base image");

        let client = reqwest::Client::builder()
            .timeout(self.http_timeout)
            .user_agent(concat!("e2e-testenv/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| EnvError::Download(format!("failed to create HTTP client: {e}")))?;

        let response = client
            .get(&self.source.url)
            .send()
            .await
            .map_err(|e| EnvError::Download(format!("GET {}: {e}", self.source.url)))?;
        if !response.status().is_success() {
            return Err(EnvError::Download(format!(
                "GET {} returned {}",
                self.source.url,
                response.status()
            )));
        }

        // Unique temp name so concurrent setups never share a partial file.
        let temp_path = dest.with_file_name(format!(
            "{}.part.{}.{}",
            self.source.file_name,
            std::process::id(),
            uuid::Uuid::new_v4().simple()
        ));
        let result = self
            .stream_to(response, &temp_path, cancel)
            .await
            .and_then(|digest| self.verify_digest(&digest));

        match result {
            Ok(()) => {
                fs::rename(&temp_path, dest).await?;
                info!(dest = %dest.display(), "base image downloaded");
                Ok(())
            }
            Err(e) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(e)
            }
        }
    }

    /// Streams the body into `path`, returning the hex SHA-256 of what was written.
    async fn stream_to(
        &self,
        response: reqwest::Response,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let mut file = fs::File::create(path).await?;
        let mut hasher = Sha256::new();
        let mut downloaded: u64 = 0;
        let mut stream = response.bytes_stream();

        loop {
            let chunk = tokio::select! {
                () = cancel.cancelled() => return Err(EnvError::Cancelled),
                next = stream.next() => match next {
                    Some(chunk) => chunk
                        .map_err(|e| EnvError::Download(format!("download error: {e}")))?,
                    None => break,
                },
            };
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
        }

        file.flush().await?;
        file.sync_all().await?;
        debug!(bytes = downloaded, path = %path.display(), "download complete");
        Ok(hex::encode(hasher.finalize()))
    }

    fn verify_digest(&self, actual: &str) -> Result<()> {
        match &self.source.sha256 {
            Some(expected) if !expected.eq_ignore_ascii_case(actual) => Err(EnvError::Download(
                format!("checksum mismatch: expected {expected}, got {actual}"),
            )),
            _ => Ok(()),
        }
    }
}
