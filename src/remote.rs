//! Remote command execution and file retrieval.
//!
//! Commands run over an authenticated SSH channel against one target node.
//! Two forms exist: [`run`] for commands that either succeed or represent a
//! real failure (cluster initialization), and [`run_with_retry`] for commands
//! racing a boot-time condition outside our control (the remote command
//! service may not have started yet). The retrying form re-attempts the full
//! command and surfaces the final failure verbatim.

use std::io::Write;
use std::os::unix::fs::PermissionsExt;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::debug;

use crate::provision::Node;
use crate::retry::{retry_with_policy, RetryPolicy};
use crate::sshkey::Keypair;
use crate::{Error, Result};

/// Trait for the authenticated remote channel
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    /// Execute a command on the node and return its stdout
    async fn exec(&self, node: &Node, command: &str) -> Result<String>;

    /// Fetch a remote file's contents, escalating privilege when required
    async fn fetch_file(&self, node: &Node, remote_path: &str, elevated: bool) -> Result<String>;
}

/// Execute a one-shot command; any failure is final
pub async fn run<C>(channel: &C, node: &Node, command: &str) -> Result<String>
where
    C: RemoteChannel + ?Sized,
{
    channel.exec(node, command).await
}

/// Execute a command, re-attempting the full command per the policy.
///
/// The final failure comes back unchanged so operators can diagnose the real
/// cause rather than a generic timeout.
pub async fn run_with_retry<C>(
    channel: &C,
    node: &Node,
    command: &str,
    policy: &RetryPolicy,
) -> Result<String>
where
    C: RemoteChannel + ?Sized,
{
    retry_with_policy(policy, command, || channel.exec(node, command)).await
}

fn fetch_command(remote_path: &str, elevated: bool) -> String {
    if elevated {
        format!("sudo cat {}", remote_path)
    } else {
        format!("cat {}", remote_path)
    }
}

/// Remote channel that shells out to the ssh binary.
///
/// The run's private key is persisted to a mode-0600 temp file for the
/// channel's lifetime; the file is removed when the channel is dropped.
pub struct SshCli {
    key_file: NamedTempFile,
}

impl SshCli {
    /// Create a channel authenticated with the given keypair
    pub fn new(keypair: &Keypair) -> Result<Self> {
        let mut key_file = tempfile::Builder::new()
            .prefix("kindling-ssh-key-")
            .tempfile()?;
        key_file.write_all(keypair.private_key.as_bytes())?;
        key_file.flush()?;

        // ssh refuses private keys readable by group or others
        let mut perms = key_file.as_file().metadata()?.permissions();
        perms.set_mode(0o600);
        key_file.as_file().set_permissions(perms)?;

        Ok(Self { key_file })
    }
}

#[async_trait]
impl RemoteChannel for SshCli {
    async fn exec(&self, node: &Node, command: &str) -> Result<String> {
        debug!(node = %node.address, command, "Executing remote command");

        let output = Command::new("ssh")
            .arg("-i")
            .arg(self.key_file.path())
            .args([
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "UserKnownHostsFile=/dev/null",
                "-o",
                "BatchMode=yes",
                "-o",
                "ConnectTimeout=10",
            ])
            .arg(node.ssh_target())
            .arg(command)
            .output()
            .await
            .map_err(|e| {
                Error::remote_exec(
                    node.address.to_string(),
                    command,
                    format!("failed to start ssh: {}", e),
                )
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::remote_exec(
                node.address.to_string(),
                command,
                format!("{}: {}", output.status, stderr.trim()),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn fetch_file(&self, node: &Node, remote_path: &str, elevated: bool) -> Result<String> {
        self.exec(node, &fetch_command(remote_path, elevated)).await
    }
}
