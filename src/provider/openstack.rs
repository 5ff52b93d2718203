//! OpenStack provider
//!
//! Talks to Nova (compute) and Neutron (network) directly over REST using a
//! token issued out of band. Keystone authentication is not performed here.
//!
//! Creation order:
//! 1. pick an unattached floating IP (fail early, before anything is created)
//! 2. boot the server with cloud-init user data
//! 3. wait for `ACTIVE`
//! 4. attach the floating IP to the server's port
//!
//! Any failure after step 2 reports the server id as `partial_id` so the
//! caller can delete it.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use base64::Engine;
use rand::seq::SliceRandom;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{
    cloud_init, ProviderType, ProvisionRequest, ProvisionedNode, ProvisioningBackend,
    ProvisioningError, PROVIDER_PARAM,
};
use crate::retry::RetryPolicy;
use crate::{Error, Result};

const AUTH_TOKEN_HEADER: &str = "x-auth-token";

/// Token and endpoints from `credentials-cloud.yaml`
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct OpenStackCredentials {
    /// Pre-issued Keystone token
    pub token: String,
    /// Nova endpoint, including the project path if the cloud needs it
    pub compute_url: String,
    /// Neutron endpoint
    pub network_url: String,
}

impl OpenStackCredentials {
    /// Read credentials from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        serde_yaml::from_str(&data)
            .map_err(|e| Error::config(format!("failed to parse {}: {}", path.display(), e)))
    }
}

impl fmt::Debug for OpenStackCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenStackCredentials")
            .field("token", &"<redacted>")
            .field("compute_url", &self.compute_url)
            .field("network_url", &self.network_url)
            .finish()
    }
}

/// What to boot, and where
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OpenStackConfig {
    /// Image id
    pub image: String,
    /// Flavor id
    pub flavor: String,
    /// Network id the server's NIC attaches to
    pub network: String,
    /// Nova keypair name, in addition to the cloud-init key
    pub keypair: Option<String>,
    /// Security group name
    pub security_group: Option<String>,
    /// Region name
    pub region: Option<String>,
    /// Project id
    pub project_id: Option<String>,
    /// Keystone URL the token was issued by
    pub auth_url: Option<String>,
    /// User domain name
    pub domain: Option<String>,
    /// Overrides the compute endpoint from the credentials file
    pub compute_url: Option<String>,
    /// Overrides the network endpoint from the credentials file
    pub network_url: Option<String>,
}

impl OpenStackConfig {
    /// Rebuild from stored `provider_params`.
    ///
    /// Only what teardown needs is stored, so image, flavor and network are
    /// left empty.
    pub fn from_params(params: &BTreeMap<String, String>) -> Result<Self> {
        let get = |key: &str| params.get(key).cloned();
        Ok(Self {
            region: get("region"),
            project_id: get("project_id"),
            auth_url: get("auth_url"),
            domain: get("domain"),
            compute_url: get("compute_url"),
            network_url: get("network_url"),
            ..Default::default()
        })
    }
}

#[derive(Deserialize)]
struct ServerEnvelope {
    server: ServerBody,
}

#[derive(Deserialize)]
struct ServerBody {
    id: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Deserialize)]
struct FloatingIpList {
    floatingips: Vec<FloatingIp>,
}

#[derive(Clone, Deserialize)]
struct FloatingIp {
    id: String,
    floating_ip_address: String,
    #[serde(default)]
    port_id: Option<String>,
}

#[derive(Deserialize)]
struct PortList {
    ports: Vec<Port>,
}

#[derive(Deserialize)]
struct Port {
    id: String,
}

/// OpenStack backend over the Nova and Neutron REST APIs
#[derive(Clone)]
pub struct OpenStackBackend {
    http: Client,
    config: OpenStackConfig,
    compute_url: String,
    network_url: String,
    active_policy: RetryPolicy,
}

impl fmt::Debug for OpenStackBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenStackBackend")
            .field("config", &self.config)
            .field("compute_url", &self.compute_url)
            .field("network_url", &self.network_url)
            .finish()
    }
}

impl OpenStackBackend {
    /// Create a backend authenticating every request with `credentials.token`
    pub fn new(
        config: OpenStackConfig,
        credentials: OpenStackCredentials,
        active_policy: RetryPolicy,
    ) -> Result<Self> {
        let mut token = HeaderValue::from_str(&credentials.token)
            .map_err(|_| Error::config("OpenStack token is not a valid header value"))?;
        token.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(AUTH_TOKEN_HEADER, token);

        let http = Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {}", e)))?;

        let compute_url = config
            .compute_url
            .clone()
            .unwrap_or(credentials.compute_url)
            .trim_end_matches('/')
            .to_string();
        let network_url = config
            .network_url
            .clone()
            .unwrap_or(credentials.network_url)
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            http,
            config,
            compute_url,
            network_url,
            active_policy,
        })
    }

    async fn send_json(&self, what: &str, request: RequestBuilder) -> std::result::Result<Value, String> {
        let response = request
            .send()
            .await
            .map_err(|e| format!("{}: {}", what, e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(format!("{}: {} {}", what, status, body.trim()));
        }
        if status == StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        response.json().await.map_err(|e| format!("{}: {}", what, e))
    }

    async fn free_floating_ip(&self) -> std::result::Result<FloatingIp, String> {
        let url = format!("{}/v2.0/floatingips", self.network_url);
        let body = self.send_json("list floating IPs", self.http.get(&url)).await?;
        let list: FloatingIpList =
            serde_json::from_value(body).map_err(|e| format!("list floating IPs: {}", e))?;

        let free: Vec<FloatingIp> = list
            .floatingips
            .into_iter()
            .filter(|ip| ip.port_id.is_none())
            .collect();
        free.choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| "no unattached floating IP available".to_string())
    }

    async fn boot(&self, request: &ProvisionRequest) -> std::result::Result<String, String> {
        let user_data = base64::engine::general_purpose::STANDARD
            .encode(cloud_init(&request.ssh_public_key));

        let mut server = json!({
            "name": request.name,
            "imageRef": self.config.image,
            "flavorRef": self.config.flavor,
            "networks": [{ "uuid": self.config.network }],
            "user_data": user_data,
        });
        if let Some(keypair) = &self.config.keypair {
            server["key_name"] = json!(keypair);
        }
        if let Some(group) = &self.config.security_group {
            server["security_groups"] = json!([{ "name": group }]);
        }

        let url = format!("{}/servers", self.compute_url);
        let body = self
            .send_json("create server", self.http.post(&url).json(&json!({ "server": server })))
            .await?;
        let envelope: ServerEnvelope =
            serde_json::from_value(body).map_err(|e| format!("create server: {}", e))?;
        Ok(envelope.server.id)
    }

    async fn server_status(&self, id: &str) -> std::result::Result<String, String> {
        let url = format!("{}/servers/{}", self.compute_url, id);
        let body = self.send_json("get server", self.http.get(&url)).await?;
        let envelope: ServerEnvelope =
            serde_json::from_value(body).map_err(|e| format!("get server: {}", e))?;
        debug!(server = %envelope.server.id, status = ?envelope.server.status, "Server status");
        Ok(envelope.server.status.unwrap_or_default())
    }

    async fn wait_active(&self, id: &str) -> std::result::Result<(), String> {
        let operation = format!("server {} active", id);
        let (status, _) = self
            .active_policy
            .poll(&operation, move |_| async move {
                let status = self.server_status(id).await?;
                match status.as_str() {
                    "ACTIVE" | "ERROR" => Ok::<_, String>(status),
                    other => Err(format!("server is {}", other)),
                }
            })
            .await
            .map_err(|e| {
                format!(
                    "server {} not active after {} attempts: {}",
                    id, e.attempts, e.last_error
                )
            })?;

        if status == "ERROR" {
            return Err(format!("server {} entered ERROR state", id));
        }
        Ok(())
    }

    async fn attach(&self, server_id: &str, ip: &FloatingIp) -> std::result::Result<(), String> {
        let url = format!("{}/v2.0/ports", self.network_url);
        let body = self
            .send_json(
                "list server ports",
                self.http.get(&url).query(&[("device_id", server_id)]),
            )
            .await?;
        let ports: PortList =
            serde_json::from_value(body).map_err(|e| format!("list server ports: {}", e))?;
        let port = ports
            .ports
            .first()
            .ok_or_else(|| format!("server {} has no network port", server_id))?;

        let url = format!("{}/v2.0/floatingips/{}", self.network_url, ip.id);
        self.send_json(
            "attach floating IP",
            self.http
                .put(&url)
                .json(&json!({ "floatingip": { "port_id": port.id } })),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ProvisioningBackend for OpenStackBackend {
    fn provider_type(&self) -> ProviderType {
        ProviderType::OpenStack
    }

    async fn create(
        &self,
        request: &ProvisionRequest,
    ) -> std::result::Result<ProvisionedNode, ProvisioningError> {
        let ip = self.free_floating_ip().await.map_err(ProvisioningError::new)?;

        info!(name = %request.name, image = %self.config.image, flavor = %self.config.flavor, "Creating server");
        let id = self.boot(request).await.map_err(ProvisioningError::new)?;
        info!(server = %id, "Server created, waiting for ACTIVE");

        self.wait_active(&id)
            .await
            .map_err(|e| ProvisioningError::partial(&id, e))?;

        info!(server = %id, ip = %ip.floating_ip_address, "Attaching floating IP");
        self.attach(&id, &ip)
            .await
            .map_err(|e| ProvisioningError::partial(&id, e))?;

        Ok(ProvisionedNode {
            id,
            address: ip.floating_ip_address,
        })
    }

    async fn delete(&self, id: &str) -> std::result::Result<(), ProvisioningError> {
        let url = format!("{}/servers/{}", self.compute_url, id);
        let response = self
            .http
            .delete(&url)
            .send()
            .await
            .map_err(|e| ProvisioningError::new(format!("delete server {}: {}", id, e)))?;

        match response.status() {
            status if status.is_success() => {
                info!(server = %id, "Server deleted");
                Ok(())
            }
            StatusCode::NOT_FOUND => {
                info!(server = %id, "Server already gone");
                Ok(())
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(ProvisioningError::new(format!(
                    "delete server {}: {} {}",
                    id,
                    status,
                    body.trim()
                )))
            }
        }
    }

    fn provider_params(&self) -> BTreeMap<String, String> {
        let mut params = BTreeMap::from([
            (PROVIDER_PARAM.to_string(), ProviderType::OpenStack.to_string()),
            ("compute_url".to_string(), self.compute_url.clone()),
            ("network_url".to_string(), self.network_url.clone()),
        ]);
        let optional = [
            ("region", &self.config.region),
            ("project_id", &self.config.project_id),
            ("auth_url", &self.config.auth_url),
            ("domain", &self.config.domain),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                params.insert(key.to_string(), value.clone());
            }
        }
        params
    }
}
