//! stratus configuration stored under the stratus home directory.
//!
//! Layout of the home directory (default `~/.stratus/`):
//! - `config.yaml`: optional overrides for [`StratusConfig`]
//! - `clusters.yaml`: cluster state file (see [`crate::store`])
//! - `known_hosts`: host keys for provisioned nodes
//! - `certs/<id>-ssl.pem`: certificates fetched from deployed nodes
//! - `id_ed25519`, `id_ed25519.pub`: operator key pair injected into nodes
//! - `credentials-cloud.yaml`: backend credentials
//! - `playbook-<version>/`: extracted deployment playbooks
//!
//! The home resolution chain (highest priority first):
//! 1. Explicit `--home` flag
//! 2. `STRATUS_HOME` environment variable
//! 3. `~/.stratus`
//!
//! Nothing here is process-global: a [`StratusConfig`] is built once and
//! handed to every component at construction.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;
use crate::{Error, Result};

const HOME_DIR_NAME: &str = ".stratus";
const CONFIG_FILE_NAME: &str = "config.yaml";
const STATE_FILE_NAME: &str = "clusters.yaml";
const KNOWN_HOSTS_FILE_NAME: &str = "known_hosts";
const CERT_DIR_NAME: &str = "certs";
const PRIVATE_KEY_FILE_NAME: &str = "id_ed25519";
const CLOUD_CREDENTIALS_FILE_NAME: &str = "credentials-cloud.yaml";
const LOG_FILE_NAME: &str = "stratus.log";

/// Environment variable overriding the home directory
pub const STRATUS_HOME_ENV: &str = "STRATUS_HOME";

/// Default version of the deployment playbook bundle
pub const DEFAULT_PLAYBOOK_VERSION: &str = "v0.12.2";

/// Default tarball URL for playbook bundles; `{version}` is substituted
pub const DEFAULT_PLAYBOOK_URL_TEMPLATE: &str =
    "https://github.com/micado-scale/ansible-micado/tarball/{version}";

/// Default location of the node's self-signed certificate
pub const DEFAULT_REMOTE_CERT_PATH: &str = "/var/lib/micado/zorp/config/ssl.pem";

/// Runtime configuration shared by all components.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StratusConfig {
    /// Home directory; never read from the config file itself
    #[serde(skip)]
    pub home: PathBuf,
    /// Login user on provisioned nodes
    pub ssh_user: String,
    /// SSH port on provisioned nodes
    pub ssh_port: u16,
    /// Port of the node's API, waited on after deployment (`None` skips the wait)
    pub api_port: Option<u16>,
    /// API version written into cluster records
    pub api_version: String,
    /// Path segment of the node API below the host
    pub api_path: String,
    /// Version of the playbook bundle to deploy
    pub playbook_version: String,
    /// URL template for downloading playbook bundles
    pub playbook_url_template: String,
    /// Playbook file to run inside the bundle
    pub playbook_file: String,
    /// Remote path of the certificate generated by the deployment
    pub remote_cert_path: String,
    /// Policy for TCP port readiness
    pub port_policy: RetryPolicy,
    /// Policy for remote shell readiness
    pub shell_policy: RetryPolicy,
    /// Policy for a cloud server reaching its active state
    pub server_active_policy: RetryPolicy,
    /// Per-attempt connection timeout for probes, in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for StratusConfig {
    fn default() -> Self {
        Self {
            home: PathBuf::from(HOME_DIR_NAME),
            ssh_user: "ubuntu".to_string(),
            ssh_port: 22,
            api_port: Some(443),
            api_version: "v2.0".to_string(),
            api_path: "toscasubmitter".to_string(),
            playbook_version: DEFAULT_PLAYBOOK_VERSION.to_string(),
            playbook_url_template: DEFAULT_PLAYBOOK_URL_TEMPLATE.to_string(),
            playbook_file: "micado.yml".to_string(),
            remote_cert_path: DEFAULT_REMOTE_CERT_PATH.to_string(),
            port_policy: RetryPolicy::port_default(),
            shell_policy: RetryPolicy::shell_default(),
            server_active_policy: RetryPolicy::server_active_default(),
            connect_timeout_ms: 1000,
        }
    }
}

impl StratusConfig {
    /// Defaults rooted at the given home directory
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            ..Default::default()
        }
    }

    /// Load `config.yaml` from `home`, falling back to defaults if missing.
    ///
    /// Creates the home directory if it does not exist.
    pub fn load(home: &Path) -> Result<Self> {
        ensure_dir(home)?;
        let path = home.join(CONFIG_FILE_NAME);
        if !path.exists() {
            return Ok(Self::with_home(home));
        }
        let data = std::fs::read_to_string(&path)
            .map_err(|e| Error::config(format!("failed to read {}: {}", path.display(), e)))?;
        let mut config: StratusConfig = serde_yaml::from_str(&data)
            .map_err(|e| Error::config(format!("failed to parse {}: {}", path.display(), e)))?;
        config.home = home.to_path_buf();
        Ok(config)
    }

    /// Per-attempt connection timeout for probes
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Path to the cluster state file
    pub fn state_file(&self) -> PathBuf {
        self.home.join(STATE_FILE_NAME)
    }

    /// Path to the managed known-hosts file
    pub fn known_hosts(&self) -> PathBuf {
        self.home.join(KNOWN_HOSTS_FILE_NAME)
    }

    /// Directory holding fetched certificates
    pub fn cert_dir(&self) -> PathBuf {
        self.home.join(CERT_DIR_NAME)
    }

    /// Operator private key
    pub fn private_key(&self) -> PathBuf {
        self.home.join(PRIVATE_KEY_FILE_NAME)
    }

    /// Operator public key
    pub fn public_key(&self) -> PathBuf {
        self.home.join(format!("{}.pub", PRIVATE_KEY_FILE_NAME))
    }

    /// Backend credentials file
    pub fn cloud_credentials(&self) -> PathBuf {
        self.home.join(CLOUD_CREDENTIALS_FILE_NAME)
    }

    /// Log file used by `--log-file`
    pub fn log_file(&self) -> PathBuf {
        self.home.join(LOG_FILE_NAME)
    }

    /// Directory an extracted playbook bundle lives in
    pub fn playbook_dir(&self, version: &str) -> PathBuf {
        self.home.join(format!("playbook-{}", version))
    }

    /// Download URL of a playbook bundle
    pub fn playbook_url(&self, version: &str) -> String {
        self.playbook_url_template.replace("{version}", version)
    }
}

/// Resolve the home directory using the priority chain.
pub fn resolve_home(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(STRATUS_HOME_ENV) {
        if !path.is_empty() {
            return Ok(PathBuf::from(path));
        }
    }

    let home =
        dirs::home_dir().ok_or_else(|| Error::config("could not determine home directory"))?;
    Ok(home.join(HOME_DIR_NAME))
}

/// Create `dir` (and parents) if it does not exist.
pub fn ensure_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        std::fs::create_dir_all(dir).map_err(|e| {
            Error::config(format!("failed to create {}: {}", dir.display(), e))
        })?;
    }
    Ok(())
}
