//! Cluster state store
//!
//! A single YAML document maps cluster ids to the connection metadata needed
//! to reattach an API client and tear the cluster down later:
//!
//! ```yaml
//! clusters:
//!   abc:
//!     address: 10.0.0.5
//!     api_endpoint: https://10.0.0.5/toscasubmitter
//!     api_version: v2.0
//!     credential:
//!       username: admin
//!       password: ...
//!     cert_path: /home/op/.stratus/certs/abc-ssl.pem
//!     provider_params:
//!       provider: openstack
//! ```
//!
//! Every call re-reads the file. Mutations rewrite it whole through
//! [`write_atomic`]. Two processes mutating the store at once are not
//! coordinated: the last writer wins.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::atomic::write_atomic;
use crate::{Error, Result};

/// How the API client authenticates
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Credential {
    /// HTTP basic auth
    Basic {
        /// Login name
        username: String,
        /// Password
        password: String,
    },
    /// Bearer token
    Token {
        /// Token value
        token: String,
    },
}

impl Credential {
    /// Username/password credential
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Token credential
    pub fn token(token: impl Into<String>) -> Self {
        Self::Token {
            token: token.into(),
        }
    }
}

// Secrets never reach logs
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Self::Token { .. } => f.debug_struct("Token").field("token", &"<redacted>").finish(),
        }
    }
}

/// Persisted metadata for one provisioned and deployed node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRecord {
    /// Provider-assigned id (the key in the state file)
    #[serde(skip)]
    pub id: String,
    /// Reachable node address
    pub address: String,
    /// Base URL of the node's API
    pub api_endpoint: String,
    /// API version path segment
    pub api_version: String,
    /// Credential the API accepts
    pub credential: Credential,
    /// PEM file trusted as the API's TLS root
    pub cert_path: PathBuf,
    /// What the provider needs to tear the node down later
    #[serde(default)]
    pub provider_params: BTreeMap<String, String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateDocument {
    #[serde(default)]
    clusters: BTreeMap<String, ClusterRecord>,
}

/// File-backed map from cluster id to [`ClusterRecord`]
#[derive(Debug, Clone)]
pub struct ClusterStateStore {
    path: PathBuf,
}

impl ClusterStateStore {
    /// Store backed by the file at `path` (created on first write)
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<StateDocument> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(StateDocument::default()),
            Err(e) => return Err(Error::persistence_failed(&self.path, e.to_string())),
        };
        if content.trim().is_empty() {
            return Ok(StateDocument::default());
        }

        let mut document: StateDocument = serde_yaml::from_str(&content)
            .map_err(|e| Error::persistence_failed(&self.path, e.to_string()))?;
        for (id, record) in document.clusters.iter_mut() {
            record.id = id.clone();
        }
        Ok(document)
    }

    fn write(&self, document: &StateDocument) -> Result<()> {
        let yaml = serde_yaml::to_string(document)
            .map_err(|e| Error::persistence_failed(&self.path, e.to_string()))?;
        write_atomic(&self.path, yaml.as_bytes())
            .map_err(|e| Error::persistence_failed(&self.path, e.to_string()))
    }

    /// Insert or replace the record for `record.id`
    pub fn put(&self, record: &ClusterRecord) -> Result<()> {
        if record.id.is_empty() {
            return Err(Error::persistence_failed(&self.path, "record has an empty id"));
        }
        let mut document = self.read()?;
        document.clusters.insert(record.id.clone(), record.clone());
        self.write(&document)?;
        debug!(cluster = %record.id, path = %self.path.display(), "Stored cluster record");
        Ok(())
    }

    /// Record for `id`
    pub fn get(&self, id: &str) -> Result<ClusterRecord> {
        self.read()?
            .clusters
            .remove(id)
            .ok_or_else(|| Error::record_not_found(id))
    }

    /// Remove the record for `id`
    pub fn remove(&self, id: &str) -> Result<()> {
        let mut document = self.read()?;
        if document.clusters.remove(id).is_none() {
            return Err(Error::record_not_found(id));
        }
        self.write(&document)?;
        debug!(cluster = %id, path = %self.path.display(), "Removed cluster record");
        Ok(())
    }

    /// All records, ordered by id
    pub fn list(&self) -> Result<Vec<ClusterRecord>> {
        Ok(self.read()?.clusters.into_values().collect())
    }
}
