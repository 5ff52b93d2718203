//! Provisioning backend abstraction
//!
//! A backend creates one compute node with a reachable address and deletes
//! it again by id. The orchestrator is written against the
//! [`ProvisioningBackend`] trait; which backend runs is decided by the
//! [`Backend`] enum, so adding a provider means adding a variant, not a new
//! orchestrator.
//!
//! # Supported Providers
//!
//! - [`OpenStackBackend`] - Nova/Neutron REST APIs with a pre-issued token
//! - [`StaticBackend`] - an existing host reachable at a known address
//!
//! Backends describe themselves through [`ProvisioningBackend::provider_params`].
//! Those params are stored with the cluster record and fed back into
//! [`Backend::from_params`] when a later process tears the node down.

mod openstack;
mod static_host;

pub use openstack::{OpenStackBackend, OpenStackConfig, OpenStackCredentials};
pub use static_host::StaticBackend;

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryPolicy;
use crate::{Error, Result};

/// Key of the provider name inside `provider_params`
pub const PROVIDER_PARAM: &str = "provider";

/// Supported provisioning backends
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    /// OpenStack compute
    OpenStack,
    /// Pre-existing host
    Static,
}

impl ProviderType {
    /// Stable lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenStack => "openstack",
            Self::Static => "static",
        }
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "openstack" => Ok(Self::OpenStack),
            "static" => Ok(Self::Static),
            other => Err(Error::config(format!("unknown provider: {}", other))),
        }
    }
}

/// What to provision
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvisionRequest {
    /// Human-readable node name
    pub name: String,
    /// Public key authorized for the default user through cloud-init
    pub ssh_public_key: String,
}

/// A node the backend created
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvisionedNode {
    /// Provider-assigned id
    pub id: String,
    /// Reachable address
    pub address: String,
}

/// The backend could not create or delete a node
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ProvisioningError {
    /// Description of what failed
    pub message: String,
    /// Id of a node that exists despite the failure and needs cleanup
    pub partial_id: Option<String>,
}

impl ProvisioningError {
    /// Failure that left nothing behind
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            partial_id: None,
        }
    }

    /// Failure after the node `id` was already created
    pub fn partial(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            partial_id: Some(id.into()),
        }
    }
}

/// Trait for creating and deleting compute nodes (allows mocking in tests)
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProvisioningBackend: Send + Sync {
    /// Which provider this is
    fn provider_type(&self) -> ProviderType;

    /// Create a node and wait until it has a reachable address
    async fn create(&self, request: &ProvisionRequest) -> std::result::Result<ProvisionedNode, ProvisioningError>;

    /// Delete the node `id`. Deleting a node that is already gone succeeds.
    async fn delete(&self, id: &str) -> std::result::Result<(), ProvisioningError>;

    /// Non-secret parameters needed to rebuild this backend for teardown
    fn provider_params(&self) -> BTreeMap<String, String>;
}

/// The configured backend
#[derive(Debug, Clone)]
pub enum Backend {
    /// OpenStack compute
    OpenStack(OpenStackBackend),
    /// Pre-existing host
    Static(StaticBackend),
}

impl Backend {
    /// Rebuild a backend from a record's `provider_params`.
    ///
    /// Secrets are never stored in the record; the OpenStack token is read
    /// from `credentials_path`.
    pub fn from_params(
        params: &BTreeMap<String, String>,
        credentials_path: &Path,
        server_active_policy: RetryPolicy,
    ) -> Result<Self> {
        let provider = params
            .get(PROVIDER_PARAM)
            .ok_or_else(|| Error::config("record has no provider parameter"))?
            .parse::<ProviderType>()?;

        match provider {
            ProviderType::OpenStack => {
                let credentials = OpenStackCredentials::load(credentials_path)?;
                let config = OpenStackConfig::from_params(params)?;
                Ok(Self::OpenStack(OpenStackBackend::new(
                    config,
                    credentials,
                    server_active_policy,
                )?))
            }
            ProviderType::Static => Ok(Self::Static(StaticBackend::from_params(params)?)),
        }
    }

    fn inner(&self) -> &dyn ProvisioningBackend {
        match self {
            Self::OpenStack(backend) => backend,
            Self::Static(backend) => backend,
        }
    }
}

#[async_trait]
impl ProvisioningBackend for Backend {
    fn provider_type(&self) -> ProviderType {
        self.inner().provider_type()
    }

    async fn create(&self, request: &ProvisionRequest) -> std::result::Result<ProvisionedNode, ProvisioningError> {
        self.inner().create(request).await
    }

    async fn delete(&self, id: &str) -> std::result::Result<(), ProvisioningError> {
        self.inner().delete(id).await
    }

    fn provider_params(&self) -> BTreeMap<String, String> {
        self.inner().provider_params()
    }
}

/// Fresh name for a new node
pub fn node_name() -> String {
    format!("stratus-{}", uuid::Uuid::new_v4().simple())
}

/// Cloud-init document authorizing `public_key` for the image's default user
pub(crate) fn cloud_init(public_key: &str) -> String {
    format!(
        "#cloud-config\n\nssh_authorized_keys:\n  - {}\n",
        public_key.trim()
    )
}
