//! Host-side SSH keypair generation.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::info;

use crate::environment::SshKeyPair;
use crate::error::{EnvError, Result};

/// File name of the generated private key.
pub const PRIVATE_KEY_FILE: &str = "id_ed25519";

/// Generates an ed25519 keypair in `dir` using `ssh-keygen`.
///
/// The private key is restricted to the owner (0600). Existing key files in
/// `dir` are replaced.
///
/// # Errors
///
/// Returns an error if `ssh-keygen` cannot be run or fails.
pub async fn generate_keypair(
    ssh_keygen: &Path,
    dir: &Path,
    comment: &str,
) -> Result<SshKeyPair> {
    tokio::fs::create_dir_all(dir).await?;
    let private_key = dir.join(PRIVATE_KEY_FILE);
    let public_key = public_key_path(&private_key);

    for path in [&private_key, &public_key] {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }

    let output = Command::new(ssh_keygen)
        .args(["-q", "-t", "ed25519", "-N", "", "-C", comment, "-f"])
        .arg(&private_key)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| {
            EnvError::Provisioning(format!("failed to run {}: {e}", ssh_keygen.display()))
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(EnvError::Provisioning(format!(
            "ssh-keygen failed: {}",
            stderr.trim()
        )));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&private_key, std::fs::Permissions::from_mode(0o600)).await?;
    }

    info!(path = %private_key.display(), "SSH keypair generated");
    Ok(SshKeyPair {
        private_key,
        public_key,
    })
}

/// Reads a public key file as a single trimmed line.
///
/// # Errors
///
/// Returns an error if the file cannot be read or is empty.
pub async fn read_public_key(path: &Path) -> Result<String> {
    let content = tokio::fs::read_to_string(path).await?;
    let key = content.trim();
    if key.is_empty() {
        return Err(EnvError::Provisioning(format!(
            "public key {} is empty",
            path.display()
        )));
    }
    Ok(key.to_string())
}

fn public_key_path(private_key: &Path) -> PathBuf {
    let mut name = private_key.as_os_str().to_owned();
    name.push(".pub");
    PathBuf::from(name)
}
