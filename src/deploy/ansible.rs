//! Ansible playbook runner
//!
//! Prepares the three inputs the playbook reads (inventory, credentials,
//! extra vars) inside the extracted bundle, then runs `ansible-playbook`
//! from the bundle root. Output is streamed into the log; the tail of stderr
//! is kept for the error.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{DeploymentError, DeploymentParams, DeploymentRunner, PlaybookBundle};
use crate::atomic::write_atomic;
use crate::store::Credential;

/// Inventory file written into the bundle root
pub const INVENTORY_FILE: &str = "hosts.yml";
/// Extra vars file written into the bundle root
pub const EXTRA_VARS_FILE: &str = "extra-vars.yml";
/// Credentials file the playbook reads the API login from
pub const CREDENTIALS_FILE: &str = "credentials/credentials-micado.yml";
/// Cloud credentials file name inside the bundle's credentials directory
const CLOUD_CREDENTIALS_FILE: &str = "credentials/credentials-cloud-api.yml";
/// Inventory host name the playbook targets
const INVENTORY_HOST: &str = "micado";
/// Lines of stderr kept for error reporting
const STDERR_TAIL_LINES: usize = 20;

/// Runs a playbook bundle with `ansible-playbook`
pub struct AnsibleRunner {
    bundle: PlaybookBundle,
    playbook_file: String,
    ssh_user: String,
    private_key: PathBuf,
    known_hosts: PathBuf,
    cloud_credentials: Option<PathBuf>,
    /// Token of the current run; replaced at the start of each run
    cancel: Mutex<CancellationToken>,
}

impl AnsibleRunner {
    /// Create a runner for `playbook_file` inside `bundle`
    pub fn new(
        bundle: PlaybookBundle,
        playbook_file: impl Into<String>,
        ssh_user: impl Into<String>,
        private_key: impl Into<PathBuf>,
        known_hosts: impl Into<PathBuf>,
    ) -> Self {
        Self {
            bundle,
            playbook_file: playbook_file.into(),
            ssh_user: ssh_user.into(),
            private_key: private_key.into(),
            known_hosts: known_hosts.into(),
            cloud_credentials: None,
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Copy this cloud credentials file into the bundle before each run
    pub fn with_cloud_credentials(mut self, path: impl Into<PathBuf>) -> Self {
        self.cloud_credentials = Some(path.into());
        self
    }

    /// Install a fresh token for a new run so an earlier cancel does not carry over
    fn arm(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.cancel.lock().unwrap_or_else(PoisonError::into_inner) = token.clone();
        token
    }

    /// Inventory document targeting `address`
    fn inventory(&self, address: &str) -> serde_json::Value {
        let ssh_args = format!(
            "-o StrictHostKeyChecking=yes -o UserKnownHostsFile={}",
            self.known_hosts.display()
        );
        serde_json::json!({
            "all": {
                "hosts": {
                    INVENTORY_HOST: {
                        "ansible_host": address,
                        "ansible_connection": "ssh",
                        "ansible_user": self.ssh_user,
                        "ansible_ssh_private_key_file": self.private_key.display().to_string(),
                        "ansible_ssh_extra_args": ssh_args,
                    }
                }
            }
        })
    }

    /// Write inventory, credentials and extra vars into `root`
    fn prepare(
        &self,
        root: &Path,
        address: &str,
        params: &DeploymentParams,
    ) -> Result<(), DeploymentError> {
        let (username, password) = match &params.credential {
            Credential::Basic { username, password } => (username, password),
            Credential::Token { .. } => {
                return Err(DeploymentError::Setup(
                    "the playbook needs a username/password credential".to_string(),
                ))
            }
        };

        let credentials = serde_json::json!({
            "authentication": {
                "username": username,
                "password": password,
            }
        });

        write_yaml(&root.join(INVENTORY_FILE), &self.inventory(address))?;
        write_yaml(&root.join(CREDENTIALS_FILE), &credentials)?;
        write_yaml(&root.join(EXTRA_VARS_FILE), &params.extra_vars)?;

        if let Some(source) = &self.cloud_credentials {
            if source.is_file() {
                let target = root.join(CLOUD_CREDENTIALS_FILE);
                std::fs::copy(source, &target).map_err(|e| {
                    DeploymentError::Setup(format!(
                        "failed to copy {} to {}: {}",
                        source.display(),
                        target.display(),
                        e
                    ))
                })?;
            } else {
                warn!(path = %source.display(), "Cloud credentials file not found, skipping");
            }
        }
        Ok(())
    }

    fn command(&self, root: &Path) -> Command {
        let mut cmd = Command::new("ansible-playbook");
        cmd.current_dir(root)
            .arg("-i")
            .arg(INVENTORY_FILE)
            .arg(&self.playbook_file)
            .arg("-e")
            .arg(format!("@{}", EXTRA_VARS_FILE))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

fn write_yaml<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), DeploymentError> {
    let yaml = serde_yaml::to_string(value)
        .map_err(|e| DeploymentError::Setup(format!("failed to encode {}: {}", path.display(), e)))?;
    write_atomic(path, yaml.as_bytes())
        .map_err(|e| DeploymentError::Setup(format!("failed to write {}: {}", path.display(), e)))
}

/// Log every stdout line as it arrives
async fn forward_stdout(reader: impl AsyncRead + Unpin) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !line.trim().is_empty() {
            debug!(target: "stratus::ansible", "{}", line);
        }
    }
}

/// Log stderr and keep its last lines
async fn collect_stderr(reader: impl AsyncRead + Unpin) -> String {
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "stratus::ansible", stream = "stderr", "{}", line);
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    Vec::from(tail).join("\n")
}

#[async_trait]
impl DeploymentRunner for AnsibleRunner {
    async fn run(&self, address: &str, params: &DeploymentParams) -> Result<(), DeploymentError> {
        let cancel = self.arm();
        let root = self.bundle.ensure().await?;
        self.prepare(&root, address, params)?;

        info!(address, playbook = %self.playbook_file, dir = %root.display(), "Running playbook");

        let mut child = self
            .command(&root)
            .spawn()
            .map_err(|e| DeploymentError::Spawn {
                program: "ansible-playbook".to_string(),
                message: e.to_string(),
            })?;

        let stdout = child.stdout.take().map(|out| tokio::spawn(forward_stdout(out)));
        let stderr = child.stderr.take().map(|err| tokio::spawn(collect_stderr(err)));

        let status = tokio::select! {
            status = child.wait() => status.map_err(|e| DeploymentError::Spawn {
                program: "ansible-playbook".to_string(),
                message: e.to_string(),
            })?,
            _ = cancel.cancelled() => {
                warn!(address, "Deployment cancelled, stopping ansible-playbook");
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill ansible-playbook");
                }
                return Err(DeploymentError::Cancelled);
            }
        };

        if let Some(task) = stdout {
            let _ = task.await;
        }
        let stderr = match stderr {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            return Err(DeploymentError::Failed {
                status: status.to_string(),
                stderr,
            });
        }

        info!(address, "Playbook completed");
        Ok(())
    }

    fn cancel(&self) {
        self.cancel.lock().unwrap_or_else(PoisonError::into_inner).cancel();
    }
}
