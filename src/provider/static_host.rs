//! Static host provider
//!
//! Deploys onto a server that already exists. Nothing is created and nothing
//! is deleted: the node's lifecycle belongs to whoever set it up.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use super::{
    ProviderType, ProvisionRequest, ProvisionedNode, ProvisioningBackend, ProvisioningError,
    PROVIDER_PARAM,
};
use crate::{Error, Result};

/// Backend for a pre-existing host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticBackend {
    id: String,
    address: String,
}

impl StaticBackend {
    /// Backend for the host at `address`, with a fresh id unless one is given
    pub fn new(address: impl Into<String>, id: Option<String>) -> Self {
        Self {
            id: id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            address: address.into(),
        }
    }

    /// Rebuild from stored `provider_params`
    pub fn from_params(params: &BTreeMap<String, String>) -> Result<Self> {
        let address = params
            .get("address")
            .ok_or_else(|| Error::config("static provider params are missing `address`"))?;
        Ok(Self::new(address.clone(), params.get("id").cloned()))
    }

    /// Id the node is recorded under
    pub fn id(&self) -> &str {
        &self.id
    }
}

#[async_trait]
impl ProvisioningBackend for StaticBackend {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Static
    }

    async fn create(
        &self,
        _request: &ProvisionRequest,
    ) -> std::result::Result<ProvisionedNode, ProvisioningError> {
        if self.address.trim().is_empty() {
            return Err(ProvisioningError::new("static host has an empty address"));
        }
        info!(id = %self.id, address = %self.address, "Using existing host");
        Ok(ProvisionedNode {
            id: self.id.clone(),
            address: self.address.clone(),
        })
    }

    async fn delete(&self, id: &str) -> std::result::Result<(), ProvisioningError> {
        info!(id, address = %self.address, "Static host is left running");
        Ok(())
    }

    fn provider_params(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (PROVIDER_PARAM.to_string(), ProviderType::Static.to_string()),
            ("id".to_string(), self.id.clone()),
            ("address".to_string(), self.address.clone()),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ProvisionRequest {
        ProvisionRequest {
            name: "stratus-test".to_string(),
            ssh_public_key: "ssh-ed25519 AAAA".to_string(),
        }
    }

    #[tokio::test]
    async fn create_returns_configured_host() {
        let backend = StaticBackend::new("192.168.1.20", Some("edge-1".to_string()));
        let node = backend.create(&request()).await.unwrap();
        assert_eq!(
            node,
            ProvisionedNode {
                id: "edge-1".to_string(),
                address: "192.168.1.20".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn generated_id_is_stable_across_calls() {
        let backend = StaticBackend::new("192.168.1.20", None);
        let first = backend.create(&request()).await.unwrap();
        let second = backend.create(&request()).await.unwrap();
        assert_eq!(first.id, second.id);
        assert!(Uuid::parse_str(&first.id).is_ok());
    }

    #[tokio::test]
    async fn delete_is_a_no_op() {
        let backend = StaticBackend::new("192.168.1.20", None);
        assert!(backend.delete(backend.id()).await.is_ok());
    }

    #[tokio::test]
    async fn empty_address_is_rejected() {
        let err = StaticBackend::new(" ", None).create(&request()).await.unwrap_err();
        assert!(err.partial_id.is_none());
    }

    #[test]
    fn params_round_trip() {
        let backend = StaticBackend::new("192.168.1.20", Some("edge-1".to_string()));
        assert_eq!(StaticBackend::from_params(&backend.provider_params()).unwrap(), backend);
        assert!(StaticBackend::from_params(&BTreeMap::new()).is_err());
    }
}
