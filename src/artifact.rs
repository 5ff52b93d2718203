//! Certificate retrieval
//!
//! After deployment the node's API serves a self-signed certificate. It is
//! copied to `<cert_dir>/<id>-ssl.pem` so an API client can trust it later.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use thiserror::Error;
use tracing::info;

use crate::remote::{RemoteShell, SshIdentity};

/// Copying a file off the node failed
#[derive(Debug, Error)]
pub enum TransferError {
    /// The local destination could not be prepared or finalized
    #[error("local file {path}: {message}")]
    Local {
        /// Local path involved
        path: String,
        /// Underlying error
        message: String,
    },

    /// The remote copy failed
    #[error("copy of {remote_path} failed: {message}")]
    Remote {
        /// Remote path that was copied
        remote_path: String,
        /// Description of what failed
        message: String,
    },
}

impl TransferError {
    fn local(path: &Path, err: std::io::Error) -> Self {
        Self::Local {
            path: path.display().to_string(),
            message: err.to_string(),
        }
    }
}

/// Trait for fetching the node certificate (allows mocking in tests)
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ArtifactRetriever: Send + Sync {
    /// Copy the certificate from `address` to a local path derived from `identifier`
    async fn fetch_certificate(
        &self,
        address: &str,
        identifier: &str,
    ) -> Result<PathBuf, TransferError>;
}

/// Local certificate path for a cluster id.
///
/// Characters that are unsafe in file names are replaced, so the same id
/// always maps to the same file.
pub fn certificate_path(cert_dir: &Path, identifier: &str) -> PathBuf {
    let safe: String = identifier
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    cert_dir.join(format!("{}-ssl.pem", safe))
}

/// Fetches the certificate with `scp`
pub struct ScpArtifactRetriever {
    shell: Arc<dyn RemoteShell>,
    identity: SshIdentity,
    remote_path: String,
    cert_dir: PathBuf,
}

impl ScpArtifactRetriever {
    /// Create a retriever copying `remote_path` into `cert_dir`
    pub fn new(
        shell: Arc<dyn RemoteShell>,
        identity: SshIdentity,
        remote_path: impl Into<String>,
        cert_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            shell,
            identity,
            remote_path: remote_path.into(),
            cert_dir: cert_dir.into(),
        }
    }
}

#[async_trait]
impl ArtifactRetriever for ScpArtifactRetriever {
    async fn fetch_certificate(
        &self,
        address: &str,
        identifier: &str,
    ) -> Result<PathBuf, TransferError> {
        std::fs::create_dir_all(&self.cert_dir)
            .map_err(|e| TransferError::local(&self.cert_dir, e))?;

        let target = certificate_path(&self.cert_dir, identifier);
        // Copy next to the target so a failed fetch leaves the previous file alone
        let partial = self.cert_dir.join(format!(
            ".{}.partial",
            target
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        ));

        let result = self
            .shell
            .copy_from(address, &self.identity, &self.remote_path, &partial)
            .await;

        let failure = match result {
            Ok(output) if output.success => None,
            Ok(output) => Some(output.stderr.trim().to_string()),
            Err(e) => Some(e.to_string()),
        };
        if let Some(message) = failure {
            let _ = std::fs::remove_file(&partial);
            return Err(TransferError::Remote {
                remote_path: self.remote_path.clone(),
                message,
            });
        }

        std::fs::rename(&partial, &target).map_err(|e| TransferError::local(&target, e))?;
        info!(address, path = %target.display(), "Certificate retrieved");
        Ok(target)
    }
}
