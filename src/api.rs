//! Client for the deployed node's application API
//!
//! The node exposes a small REST API under `{endpoint}/{version}/applications/`.
//! stratus uses it to submit application descriptions, list what is running
//! and tear everything down before the node itself is deleted.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use reqwest::{Certificate, Client, RequestBuilder, Response};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::store::{ClusterRecord, Credential};
use crate::{Error, Result};

/// A request to the application API failed
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request could not be sent or its response read
    #[error("request to {url} failed: {message}")]
    Transport {
        /// Requested URL
        url: String,
        /// Underlying error
        message: String,
    },

    /// The API answered with an error status
    #[error("{url} returned {status}: {body}")]
    Status {
        /// Requested URL
        url: String,
        /// HTTP status code
        status: u16,
        /// Response body
        body: String,
    },

    /// The response did not have the expected shape
    #[error("unexpected response from {url}: {message}")]
    Decode {
        /// Requested URL
        url: String,
        /// What was wrong
        message: String,
    },

    /// A submission carried neither a description nor a URL
    #[error("either an application description or a URL to one is required")]
    MissingDescription,
}

/// An application to deploy onto the node
///
/// At least one of `adt` and `url` must be set. Unset fields are omitted
/// from the request body.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ApplicationSubmission {
    /// Id to deploy under; the API assigns one when omitted
    #[serde(skip)]
    pub app_id: Option<String>,
    /// Inline application description template
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adt: Option<Value>,
    /// URL of an application description template
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Template input values
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, Value>,
    /// Validate and translate without running any component
    pub dryrun: bool,
}

impl ApplicationSubmission {
    fn has_description(&self) -> bool {
        self.adt.as_ref().is_some_and(|adt| !adt.is_null())
            || self.url.as_deref().is_some_and(|url| !url.is_empty())
    }
}

/// Application operations the orchestrator needs (allows mocking in tests)
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ApplicationApi: Send + Sync {
    /// Ids of the running applications
    async fn applications(&self) -> std::result::Result<Vec<String>, ApiError>;

    /// Deploy an application, returning the API's id and status document
    async fn submit(&self, submission: &ApplicationSubmission) -> std::result::Result<Value, ApiError>;

    /// Force-delete every application, returning how many were deleted
    async fn destroy_all(&self) -> std::result::Result<usize, ApiError>;
}

/// Builds an [`ApplicationApi`] for a stored cluster (allows mocking in tests)
#[cfg_attr(test, automock)]
pub trait ApiConnector: Send + Sync {
    /// Connect to the cluster described by `record`
    fn connect(&self, record: &ClusterRecord) -> Result<Arc<dyn ApplicationApi>>;
}

/// Connector producing [`SubmitterClient`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitterConnector;

impl ApiConnector for SubmitterConnector {
    fn connect(&self, record: &ClusterRecord) -> Result<Arc<dyn ApplicationApi>> {
        Ok(Arc::new(SubmitterClient::from_record(record)?))
    }
}

/// REST client for the node's application API
#[derive(Debug, Clone)]
pub struct SubmitterClient {
    http: Client,
    endpoint: String,
    version: String,
    credential: Credential,
}

impl SubmitterClient {
    /// Build a client from a stored record, trusting its certificate.
    ///
    /// Fails with `MalformedCredentials` if the credential is incomplete or
    /// the certificate cannot be read.
    pub fn from_record(record: &ClusterRecord) -> Result<Self> {
        validate_credential(&record.id, &record.credential)?;

        let pem = std::fs::read(&record.cert_path).map_err(|e| {
            Error::malformed_credentials(
                &record.id,
                format!("cannot read certificate {}: {}", record.cert_path.display(), e),
            )
        })?;

        Self::new(
            &record.id,
            &record.api_endpoint,
            &record.api_version,
            record.credential.clone(),
            Some(&pem),
        )
    }

    /// Build a client for `endpoint`, optionally trusting `root_pem`
    pub fn new(
        id: &str,
        endpoint: &str,
        version: &str,
        credential: Credential,
        root_pem: Option<&[u8]>,
    ) -> Result<Self> {
        validate_credential(id, &credential)?;

        let mut builder = Client::builder();
        if let Some(pem) = root_pem {
            let cert = Certificate::from_pem(pem).map_err(|e| {
                Error::malformed_credentials(id, format!("invalid certificate: {}", e))
            })?;
            builder = builder.add_root_certificate(cert);
        }
        let http = builder
            .build()
            .map_err(|e| Error::malformed_credentials(id, format!("cannot build client: {}", e)))?;

        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            version: version.trim_matches('/').to_string(),
            credential,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}{}", self.endpoint, self.version, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.credential {
            Credential::Basic { username, password } => request.basic_auth(username, Some(password)),
            Credential::Token { token } => request.bearer_auth(token),
        }
    }

    async fn send(
        &self,
        url: &str,
        request: RequestBuilder,
    ) -> std::result::Result<Response, ApiError> {
        debug!(url, "Sending API request");
        self.authorize(request)
            .send()
            .await
            .map_err(|e| ApiError::Transport {
                url: url.to_string(),
                message: e.to_string(),
            })
    }

    async fn json(url: &str, response: Response) -> std::result::Result<Value, ApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        response.json().await.map_err(|e| ApiError::Decode {
            url: url.to_string(),
            message: e.to_string(),
        })
    }

    /// Ids of the running applications
    pub async fn list_applications(&self) -> std::result::Result<Vec<String>, ApiError> {
        let url = self.url("/applications/");
        let response = self.send(&url, self.http.get(&url)).await?;
        let body = Self::json(&url, response).await?;

        let entries = body
            .get("applications")
            .and_then(Value::as_array)
            .ok_or_else(|| ApiError::Decode {
                url: url.clone(),
                message: "missing `applications` list".to_string(),
            })?;

        entries
            .iter()
            .map(|entry| {
                application_id(entry).ok_or_else(|| ApiError::Decode {
                    url: url.clone(),
                    message: format!("application entry without id: {}", entry),
                })
            })
            .collect()
    }

    /// Detailed information on one application
    pub async fn inspect_application(&self, app_id: &str) -> std::result::Result<Value, ApiError> {
        let url = self.url(&format!("/applications/{}/", app_id));
        let response = self.send(&url, self.http.get(&url)).await?;
        Self::json(&url, response).await
    }

    /// Deploy an application.
    ///
    /// Posts to `/applications/{app_id}/` when an id is given, otherwise to
    /// `/applications/`. Fails with `MissingDescription` before any request
    /// when the submission has neither an ADT nor a URL.
    pub async fn create_application(
        &self,
        submission: &ApplicationSubmission,
    ) -> std::result::Result<Value, ApiError> {
        if !submission.has_description() {
            return Err(ApiError::MissingDescription);
        }
        let url = match submission.app_id.as_deref() {
            Some(app_id) => self.url(&format!("/applications/{}/", app_id)),
            None => self.url("/applications/"),
        };
        let response = self.send(&url, self.http.post(&url).json(submission)).await?;
        let body = Self::json(&url, response).await?;
        info!(app = ?submission.app_id, dryrun = submission.dryrun, "Application submitted");
        Ok(body)
    }

    /// Delete one application. With `force`, error statuses are ignored.
    pub async fn delete_application(
        &self,
        app_id: &str,
        force: bool,
    ) -> std::result::Result<(), ApiError> {
        let url = self.url(&format!("/applications/{}/", app_id));
        let request = self
            .http
            .delete(&url)
            .json(&serde_json::json!({ "force": force }));
        let response = self.send(&url, request).await?;

        let status = response.status();
        if !status.is_success() {
            if force {
                warn!(app = app_id, status = status.as_u16(), "Forced delete reported an error");
                return Ok(());
            }
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                url,
                status: status.as_u16(),
                body,
            });
        }
        info!(app = app_id, "Application deleted");
        Ok(())
    }
}

#[async_trait]
impl ApplicationApi for SubmitterClient {
    async fn applications(&self) -> std::result::Result<Vec<String>, ApiError> {
        self.list_applications().await
    }

    async fn submit(&self, submission: &ApplicationSubmission) -> std::result::Result<Value, ApiError> {
        self.create_application(submission).await
    }

    async fn destroy_all(&self) -> std::result::Result<usize, ApiError> {
        let apps = self.list_applications().await?;
        for app in &apps {
            self.delete_application(app, true).await?;
        }
        Ok(apps.len())
    }
}

/// Applications are listed either as bare ids or as objects with an `id`
fn application_id(entry: &Value) -> Option<String> {
    match entry {
        Value::String(id) => Some(id.clone()),
        Value::Object(map) => map.get("id").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

fn validate_credential(id: &str, credential: &Credential) -> Result<()> {
    match credential {
        Credential::Basic { username, .. } if username.is_empty() => {
            Err(Error::malformed_credentials(id, "empty username"))
        }
        Credential::Basic { password, .. } if password.is_empty() => {
            Err(Error::malformed_credentials(id, "empty password"))
        }
        Credential::Token { token } if token.is_empty() => {
            Err(Error::malformed_credentials(id, "empty token"))
        }
        _ => Ok(()),
    }
}
