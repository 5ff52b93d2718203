//! OpenSSH command execution
//!
//! All remote access goes through the system `ssh`, `scp` and `ssh-keyscan`
//! binaries. The [`RemoteShell`] trait is the seam that lets the rest of the
//! crate be tested without a real node.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::process::Command;
use tracing::debug;

use super::RemoteAccessError;

/// Host key type requested from `ssh-keyscan`, matching the generated client key
const HOST_KEY_TYPE: &str = "ed25519";

/// Command output for testability
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Whether command succeeded
    pub success: bool,
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given stderr
    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        Self {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }
    }
}

/// Who to log in as, and with which key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshIdentity {
    /// Remote login user
    pub user: String,
    /// Private key file
    pub private_key: PathBuf,
}

impl SshIdentity {
    /// Create an identity
    pub fn new(user: impl Into<String>, private_key: impl Into<PathBuf>) -> Self {
        Self {
            user: user.into(),
            private_key: private_key.into(),
        }
    }

    fn destination(&self, address: &str) -> String {
        format!("{}@{}", self.user, address)
    }
}

/// Trait for executing SSH-family commands (allows mocking in tests)
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Fetch the node's host keys in known-hosts format
    async fn scan_host_keys(&self, address: &str) -> Result<String, RemoteAccessError>;

    /// Run `command` on the node
    async fn run(
        &self,
        address: &str,
        identity: &SshIdentity,
        command: &str,
    ) -> Result<CommandOutput, RemoteAccessError>;

    /// Copy `remote_path` from the node to `local_path`
    async fn copy_from(
        &self,
        address: &str,
        identity: &SshIdentity,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<CommandOutput, RemoteAccessError>;
}

/// Remote shell backed by the OpenSSH client binaries
#[derive(Debug, Clone)]
pub struct OpenSshClient {
    known_hosts: PathBuf,
    port: u16,
    connect_timeout: Duration,
}

impl OpenSshClient {
    /// Create a client that trusts only the given known-hosts file
    pub fn new(known_hosts: impl Into<PathBuf>, port: u16, connect_timeout: Duration) -> Self {
        Self {
            known_hosts: known_hosts.into(),
            port,
            connect_timeout,
        }
    }

    fn common_options(&self, identity: &SshIdentity) -> Vec<String> {
        // ssh's ConnectTimeout is whole seconds
        let connect_secs = self.connect_timeout.as_secs().max(1);
        vec![
            "-i".to_string(),
            identity.private_key.to_string_lossy().into_owned(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=yes".to_string(),
            "-o".to_string(),
            format!("UserKnownHostsFile={}", self.known_hosts.display()),
            "-o".to_string(),
            format!("ConnectTimeout={}", connect_secs),
        ]
    }

    async fn output(program: &str, mut cmd: Command) -> Result<CommandOutput, RemoteAccessError> {
        debug!(command = ?cmd, "Executing {}", program);
        let output = cmd
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| RemoteAccessError::spawn(program, e))?;
        Ok(CommandOutput::from(output))
    }
}

#[async_trait]
impl RemoteShell for OpenSshClient {
    async fn scan_host_keys(&self, address: &str) -> Result<String, RemoteAccessError> {
        let mut cmd = Command::new("ssh-keyscan");
        cmd.arg("-t")
            .arg(HOST_KEY_TYPE)
            .arg("-p")
            .arg(self.port.to_string())
            .arg("-T")
            .arg(self.connect_timeout.as_secs().max(1).to_string())
            .arg(address);

        let output = Self::output("ssh-keyscan", cmd).await?;
        if !output.success {
            return Err(RemoteAccessError::KeyScan {
                address: address.to_string(),
                message: output.stderr.trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    async fn run(
        &self,
        address: &str,
        identity: &SshIdentity,
        command: &str,
    ) -> Result<CommandOutput, RemoteAccessError> {
        let mut cmd = Command::new("ssh");
        cmd.args(self.common_options(identity))
            .arg("-p")
            .arg(self.port.to_string())
            .arg(identity.destination(address))
            .arg(command);
        Self::output("ssh", cmd).await
    }

    async fn copy_from(
        &self,
        address: &str,
        identity: &SshIdentity,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<CommandOutput, RemoteAccessError> {
        let mut cmd = Command::new("scp");
        cmd.args(self.common_options(identity))
            .arg("-P")
            .arg(self.port.to_string())
            .arg(format!("{}:{}", identity.destination(address), remote_path))
            .arg(local_path);
        Self::output("scp", cmd).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_joins_user_and_address() {
        let identity = SshIdentity::new("ubuntu", "/keys/id");
        assert_eq!(identity.destination("10.0.0.5"), "ubuntu@10.0.0.5");
    }

    #[test]
    fn common_options_pin_known_hosts_and_batch_mode() {
        let client = OpenSshClient::new("/home/op/.stratus/known_hosts", 22, Duration::from_millis(500));
        let opts = client.common_options(&SshIdentity::new("ubuntu", "/keys/id"));

        assert!(opts.contains(&"/keys/id".to_string()));
        assert!(opts.contains(&"BatchMode=yes".to_string()));
        assert!(opts.contains(&"StrictHostKeyChecking=yes".to_string()));
        assert!(opts.contains(&"UserKnownHostsFile=/home/op/.stratus/known_hosts".to_string()));
        // Sub-second timeouts round up to ssh's 1s minimum
        assert!(opts.contains(&"ConnectTimeout=1".to_string()));
    }

    #[test]
    fn command_output_from_helpers() {
        assert!(CommandOutput::ok("fine").success);
        let failed = CommandOutput::failed("Connection refused");
        assert!(!failed.success);
        assert_eq!(failed.stderr, "Connection refused");
    }
}
