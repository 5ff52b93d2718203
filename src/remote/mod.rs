//! Remote access to provisioned nodes
//!
//! Two concerns live here:
//! - trust: making sure the managed known-hosts file holds exactly the key the
//!   node presents right now ([`RemoteAccess::ensure_trust`])
//! - liveness: confirming that a login shell actually works, not only that
//!   sshd accepts TCP connections ([`RemoteAccess::wait_for_shell`])
//!
//! The orchestrator depends on the [`RemoteAccess`] trait; the concrete
//! [`RemoteAccessManager`] composes a [`KnownHostsFile`] with a [`RemoteShell`].

mod keys;
mod known_hosts;
mod ssh;

pub use keys::SshKeyPair;
pub use known_hosts::{KnownHostsFile, Rotation};
pub use ssh::{CommandOutput, OpenSshClient, RemoteShell, SshIdentity};

#[cfg(test)]
pub use ssh::MockRemoteShell;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use thiserror::Error;
use tracing::info;

use crate::retry::RetryPolicy;

/// Command every shell probe runs
const SHELL_PROBE_COMMAND: &str = "true";

/// Failure talking to a node or managing local SSH state
#[derive(Debug, Error)]
pub enum RemoteAccessError {
    /// An SSH-family binary could not be started
    #[error("failed to run {program}: {message}")]
    Spawn {
        /// Binary that failed to start
        program: String,
        /// Underlying error
        message: String,
    },

    /// A binary ran but reported failure
    #[error("{program} failed: {message}")]
    Command {
        /// Binary that failed
        program: String,
        /// Its stderr
        message: String,
    },

    /// Host keys could not be fetched
    #[error("host key scan of {address} failed: {message}")]
    KeyScan {
        /// Scanned address
        address: String,
        /// Description of what failed
        message: String,
    },

    /// A local SSH file could not be read or written
    #[error("failed to update {path}: {message}")]
    KnownHosts {
        /// Affected file
        path: String,
        /// Underlying error
        message: String,
    },
}

impl RemoteAccessError {
    /// A binary could not be spawned
    pub fn spawn(program: &str, err: std::io::Error) -> Self {
        Self::Spawn {
            program: program.to_string(),
            message: err.to_string(),
        }
    }

    /// A local SSH file could not be updated
    pub fn known_hosts(path: &Path, err: std::io::Error) -> Self {
        Self::KnownHosts {
            path: path.display().to_string(),
            message: err.to_string(),
        }
    }
}

/// The shell never became usable within the retry budget
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("shell on {address} not usable after {attempts} attempts ({elapsed:?}): {last_error}")]
pub struct ShellTimeout {
    /// Node address
    pub address: String,
    /// Attempts made
    pub attempts: u32,
    /// Nominal time waited (`attempts * interval`)
    pub elapsed: Duration,
    /// Why the last attempt failed
    pub last_error: String,
}

/// Trust and liveness operations the orchestrator needs (allows mocking in tests)
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteAccess: Send + Sync {
    /// Replace any stale host keys for `address` with the key it presents now
    async fn ensure_trust(&self, address: &str) -> Result<(), RemoteAccessError>;

    /// Wait until a trivial command succeeds over SSH
    async fn wait_for_shell(
        &self,
        address: &str,
        identity: &SshIdentity,
        policy: &RetryPolicy,
    ) -> Result<(), ShellTimeout>;
}

/// [`RemoteAccess`] over a managed known-hosts file and a [`RemoteShell`]
pub struct RemoteAccessManager {
    known_hosts: KnownHostsFile,
    shell: Arc<dyn RemoteShell>,
}

impl RemoteAccessManager {
    /// Create a manager
    pub fn new(known_hosts: KnownHostsFile, shell: Arc<dyn RemoteShell>) -> Self {
        Self { known_hosts, shell }
    }

    /// The managed known-hosts file
    pub fn known_hosts(&self) -> &KnownHostsFile {
        &self.known_hosts
    }

    async fn probe_shell(&self, address: &str, identity: &SshIdentity) -> Result<(), String> {
        let output = self
            .shell
            .run(address, identity, SHELL_PROBE_COMMAND)
            .await
            .map_err(|e| e.to_string())?;
        if output.success {
            Ok(())
        } else {
            Err(output.stderr.trim().to_string())
        }
    }
}

#[async_trait]
impl RemoteAccess for RemoteAccessManager {
    async fn ensure_trust(&self, address: &str) -> Result<(), RemoteAccessError> {
        let scanned = self.shell.scan_host_keys(address).await?;
        let rotation = self.known_hosts.rotate(address, &scanned)?;
        info!(
            address,
            archived = rotation.archived,
            recorded = rotation.recorded,
            "Host key trusted"
        );
        Ok(())
    }

    async fn wait_for_shell(
        &self,
        address: &str,
        identity: &SshIdentity,
        policy: &RetryPolicy,
    ) -> Result<(), ShellTimeout> {
        info!(address, user = %identity.user, "Waiting for remote shell");

        let operation = format!("shell {}", address);
        let (_, attempt) = policy
            .poll(&operation, move |_| self.probe_shell(address, identity))
            .await
            .map_err(|exhausted| ShellTimeout {
                address: address.to_string(),
                attempts: exhausted.attempts,
                elapsed: exhausted.elapsed,
                last_error: exhausted.last_error,
            })?;

        info!(address, attempt, "Remote shell is usable");
        Ok(())
    }
}
