//! [`GuestSsh`] implementation backed by a TCP banner check and the system
//! `ssh` client.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::provider::{GuestSsh, ProviderError, ProviderResult, SshTarget};

/// Default interval between readiness checks.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Default per-attempt connect and banner timeout.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Exit status `ssh` uses for its own (transport) failures.
const SSH_TRANSPORT_EXIT: i32 = 255;

/// Script run on the guest to print (and if needed create) its own key.
const GUEST_KEY_SCRIPT: &str = "test -f ~/.ssh/id_ed25519.pub || \
     (mkdir -p ~/.ssh && ssh-keygen -q -t ed25519 -N '' -f ~/.ssh/id_ed25519); \
     cat ~/.ssh/id_ed25519.pub";

/// Probes guests with plain TCP and shells out to `ssh` for commands.
#[derive(Debug, Clone)]
pub struct OpenSshGuest {
    /// Path of the `ssh` client binary.
    pub ssh_binary: PathBuf,
    pub poll_interval: Duration,
    pub connect_timeout: Duration,
}

impl Default for OpenSshGuest {
    fn default() -> Self {
        Self {
            ssh_binary: PathBuf::from("ssh"),
            poll_interval: DEFAULT_POLL_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl OpenSshGuest {
    /// Connects once and checks for an SSH protocol banner.
    async fn check_banner(&self, target: &SshTarget) -> ProviderResult<()> {
        let addr = (target.host.as_str(), target.port);
        let mut stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                ProviderError::Connection(format!("connect to {} timed out", target.host))
            })?
            .map_err(|e| ProviderError::Connection(format!("connect to {}: {e}", target.host)))?;

        let mut banner = [0u8; 255];
        let n = tokio::time::timeout(self.connect_timeout, stream.read(&mut banner))
            .await
            .map_err(|_| ProviderError::Connection("no SSH banner".to_string()))?
            .map_err(|e| ProviderError::Connection(format!("read banner: {e}")))?;

        if banner[..n].starts_with(b"SSH-") {
            Ok(())
        } else {
            Err(ProviderError::Connection(format!(
                "{}:{} did not answer with an SSH banner",
                target.host, target.port
            )))
        }
    }

    fn ssh_command(&self, target: &SshTarget, remote: &str) -> Command {
        let mut cmd = Command::new(&self.ssh_binary);
        cmd.arg("-i")
            .arg(&target.private_key)
            .arg("-p")
            .arg(target.port.to_string())
            .args(["-o", "BatchMode=yes"])
            .args(["-o", "StrictHostKeyChecking=no"])
            .args(["-o", "UserKnownHostsFile=/dev/null"])
            .args(["-o", "LogLevel=ERROR"])
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)))
            .arg(format!("{}@{}", target.user, target.host))
            .arg(remote)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl GuestSsh for OpenSshGuest {
    async fn await_ready(
        &self,
        target: &SshTarget,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> ProviderResult<()> {
        let start = tokio::time::Instant::now();
        let deadline = start + timeout;

        loop {
            if cancel.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }
            match self.check_banner(target).await {
                Ok(()) => {
                    info!(host = %target.host, elapsed = ?start.elapsed(), "SSH is ready");
                    return Ok(());
                }
                Err(e) => debug!(host = %target.host, error = %e, "SSH not ready yet"),
            }

            if tokio::time::Instant::now() + self.poll_interval > deadline {
                return Err(ProviderError::Timeout {
                    what: format!("SSH on {}:{}", target.host, target.port),
                    elapsed: start.elapsed(),
                });
            }
            tokio::select! {
                () = cancel.cancelled() => return Err(ProviderError::Cancelled),
                () = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    async fn guest_public_key(
        &self,
        target: &SshTarget,
        cancel: &CancellationToken,
    ) -> ProviderResult<String> {
        let mut cmd = self.ssh_command(target, GUEST_KEY_SCRIPT);
        let output = tokio::select! {
            () = cancel.cancelled() => return Err(ProviderError::Cancelled),
            out = cmd.output() => out
                .map_err(|e| ProviderError::Failed(format!("failed to run ssh: {e}")))?,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(match output.status.code() {
                Some(SSH_TRANSPORT_EXIT) => ProviderError::Connection(stderr),
                _ => ProviderError::Failed(format!("reading guest key failed: {stderr}")),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_public_key(&stdout).ok_or_else(|| {
            ProviderError::Failed(format!(
                "guest {} printed no public key",
                target.host
            ))
        })
    }
}

/// Extracts the first OpenSSH public key line from command output.
pub(crate) fn parse_public_key(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("ssh-") || line.starts_with("ecdsa-"))
        .map(str::to_owned)
}
