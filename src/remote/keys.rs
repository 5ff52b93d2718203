//! Operator SSH key pair
//!
//! The public half is injected into new nodes through cloud-init; the private
//! half is used for every later SSH, SCP and playbook connection.

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::info;

use super::RemoteAccessError;

/// An ed25519 key pair on disk
#[derive(Debug, Clone)]
pub struct SshKeyPair {
    private_key: PathBuf,
    public_key: PathBuf,
}

impl SshKeyPair {
    /// Key pair at `private_key` and `<private_key>.pub`
    pub fn at(private_key: impl Into<PathBuf>) -> Self {
        let private_key = private_key.into();
        let mut public = private_key.as_os_str().to_owned();
        public.push(".pub");
        Self {
            private_key,
            public_key: PathBuf::from(public),
        }
    }

    /// Private key path
    pub fn private_key(&self) -> &Path {
        &self.private_key
    }

    /// Public key path
    pub fn public_key_path(&self) -> &Path {
        &self.public_key
    }

    /// Whether both halves exist
    pub fn exists(&self) -> bool {
        self.private_key.is_file() && self.public_key.is_file()
    }

    /// Generate the pair with `ssh-keygen` unless it already exists, and
    /// return the public key line.
    pub async fn ensure(&self) -> Result<String, RemoteAccessError> {
        if !self.exists() {
            info!(path = %self.private_key.display(), "Generating operator SSH key pair");
            if let Some(parent) = self.private_key.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| RemoteAccessError::known_hosts(parent, e))?;
            }
            let output = Command::new("ssh-keygen")
                .args(["-q", "-t", "ed25519", "-N", "", "-C", "stratus", "-f"])
                .arg(&self.private_key)
                .output()
                .await
                .map_err(|e| RemoteAccessError::spawn("ssh-keygen", e))?;
            if !output.status.success() {
                return Err(RemoteAccessError::Command {
                    program: "ssh-keygen".to_string(),
                    message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                });
            }
        }
        self.public_key()
    }

    /// Read the public key line
    pub fn public_key(&self) -> Result<String, RemoteAccessError> {
        let content = std::fs::read_to_string(&self.public_key)
            .map_err(|e| RemoteAccessError::known_hosts(&self.public_key, e))?;
        Ok(content.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_key_path_appends_pub() {
        let pair = SshKeyPair::at("/home/op/.stratus/id_ed25519");
        assert_eq!(
            pair.public_key_path(),
            Path::new("/home/op/.stratus/id_ed25519.pub")
        );
    }

    #[tokio::test]
    async fn existing_pair_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let pair = SshKeyPair::at(dir.path().join("id_ed25519"));
        std::fs::write(pair.private_key(), "PRIVATE").unwrap();
        std::fs::write(pair.public_key_path(), "ssh-ed25519 AAAAkey stratus\n").unwrap();

        assert!(pair.exists());
        assert_eq!(pair.ensure().await.unwrap(), "ssh-ed25519 AAAAkey stratus");
    }
}
