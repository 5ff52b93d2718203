//! Cluster lifecycle orchestration
//!
//! `create()` drives a fixed pipeline:
//!
//! ```text
//! Provisioning -> AwaitingPort -> AwaitingShell -> Deploying -> FetchingArtifact -> Persisting -> Ready
//!       \______________\_______________\______________\_______________\_______________\-> Failed
//! ```
//!
//! Once a node exists, any failure (or cancellation) deletes it again before
//! the error is returned. The caller always sees the error that stopped the
//! pipeline; a failed cleanup is logged, never returned. The cluster record is
//! written in `Persisting`, so a record exists only for a node that made it
//! all the way through.
//!
//! `destroy()` tears down in the opposite direction: applications first
//! (best-effort), then the node (must succeed), then the record. A failed node
//! deletion keeps the record so `destroy()` can simply be retried.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api::{ApiConnector, ApplicationApi};
use crate::artifact::ArtifactRetriever;
use crate::config::StratusConfig;
use crate::deploy::{DeploymentError, DeploymentParams, DeploymentRunner};
use crate::probe::{ProbeTimeout, ReadinessProbe};
use crate::provider::{node_name, ProvisionRequest, ProvisioningBackend};
use crate::remote::{RemoteAccess, SshIdentity};
use crate::retry::RetryPolicy;
use crate::store::{ClusterRecord, ClusterStateStore, Credential};
use crate::{Error, Result};

/// Length of generated API passwords
pub const GENERATED_PASSWORD_LEN: usize = 14;

/// Default API login name
pub const DEFAULT_API_USER: &str = "admin";

/// States of the `create()` pipeline
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    /// Asking the backend for a node
    Provisioning,
    /// Waiting for the SSH port
    AwaitingPort,
    /// Establishing host-key trust and waiting for a usable shell
    AwaitingShell,
    /// Running the deployment and waiting for the API port
    Deploying,
    /// Copying the certificate off the node
    FetchingArtifact,
    /// Writing the cluster record
    Persisting,
    /// Done
    Ready,
    /// Stopped by an error or cancellation
    Failed,
}

impl Stage {
    /// Stable name for logs and errors
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provisioning => "Provisioning",
            Self::AwaitingPort => "AwaitingPort",
            Self::AwaitingShell => "AwaitingShell",
            Self::Deploying => "Deploying",
            Self::FetchingArtifact => "FetchingArtifact",
            Self::Persisting => "Persisting",
            Self::Ready => "Ready",
            Self::Failed => "Failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed inputs of every pipeline run
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Login user on the node
    pub ssh_user: String,
    /// Operator private key
    pub private_key: PathBuf,
    /// Operator public key line injected at provisioning
    pub ssh_public_key: String,
    /// SSH port probed before trust is established
    pub ssh_port: u16,
    /// API port probed after deployment, if any
    pub api_port: Option<u16>,
    /// API version stored in the record
    pub api_version: String,
    /// Path segment of the API endpoint
    pub api_path: String,
    /// Retry policy of port probes
    pub port_policy: RetryPolicy,
    /// Retry policy of the shell probe
    pub shell_policy: RetryPolicy,
}

impl PipelineSettings {
    /// Settings taken from `config`, with the given public key
    pub fn from_config(config: &StratusConfig, ssh_public_key: impl Into<String>) -> Self {
        Self {
            ssh_user: config.ssh_user.clone(),
            private_key: config.private_key(),
            ssh_public_key: ssh_public_key.into(),
            ssh_port: config.ssh_port,
            api_port: config.api_port,
            api_version: config.api_version.clone(),
            api_path: config.api_path.clone(),
            port_policy: config.port_policy,
            shell_policy: config.shell_policy,
        }
    }

    fn identity(&self) -> SshIdentity {
        SshIdentity::new(&self.ssh_user, &self.private_key)
    }

    fn api_endpoint(&self, address: &str) -> String {
        format!("https://{}/{}", address, self.api_path.trim_matches('/'))
    }
}

/// Per-call inputs of `create()`
#[derive(Debug, Clone, PartialEq)]
pub struct CreateOptions {
    /// Node name, generated when absent
    pub name: Option<String>,
    /// API login name
    pub username: String,
    /// API password, generated when absent
    pub password: Option<String>,
    /// Variables passed to the deployment
    pub extra_vars: BTreeMap<String, serde_yaml::Value>,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            name: None,
            username: DEFAULT_API_USER.to_string(),
            password: None,
            extra_vars: BTreeMap::new(),
        }
    }
}

/// Outcome of a successful `create()`
#[derive(Debug, Clone, PartialEq)]
pub struct CreateReport {
    /// The stored record
    pub record: ClusterRecord,
    /// Every stage entered, ending in [`Stage::Ready`]
    pub history: Vec<Stage>,
}

impl CreateReport {
    /// Last stage reached
    pub fn final_stage(&self) -> Option<Stage> {
        self.history.last().copied()
    }
}

/// The collaborators a pipeline run needs
#[derive(Clone)]
pub struct Components {
    /// TCP readiness checks
    pub probe: Arc<dyn ReadinessProbe>,
    /// Host-key trust and shell liveness
    pub remote: Arc<dyn RemoteAccess>,
    /// Deployment runner
    pub runner: Arc<dyn DeploymentRunner>,
    /// Certificate retrieval
    pub retriever: Arc<dyn ArtifactRetriever>,
    /// Builds API clients from records
    pub connector: Arc<dyn ApiConnector>,
}

/// Transient state passed between stages of one `create()`
struct PipelineContext {
    id: String,
    address: String,
    credential: Credential,
}

/// Generate a random alphanumeric password
pub fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_PASSWORD_LEN)
        .map(char::from)
        .collect()
}

/// Composes provisioning, probing, deployment, retrieval and persistence
pub struct LifecycleOrchestrator<B: ProvisioningBackend> {
    backend: B,
    components: Components,
    store: ClusterStateStore,
    settings: PipelineSettings,
    cancel: CancellationToken,
}

impl<B: ProvisioningBackend> LifecycleOrchestrator<B> {
    /// Create an orchestrator
    pub fn new(
        backend: B,
        components: Components,
        store: ClusterStateStore,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            backend,
            components,
            store,
            settings,
            cancel: CancellationToken::new(),
        }
    }

    /// Use `token` to cancel in-flight pipelines
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// The backing state store
    pub fn store(&self) -> &ClusterStateStore {
        &self.store
    }

    /// Record a stage transition, refusing to start it once cancelled
    fn enter(&self, history: &mut Vec<Stage>, stage: Stage, address: Option<&str>) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled {
                stage: stage.to_string(),
            });
        }
        info!(stage = %stage, address = address.unwrap_or("-"), "Entering stage");
        history.push(stage);
        Ok(())
    }

    /// Provision, deploy and record a new cluster
    pub async fn create(&self, options: &CreateOptions) -> Result<CreateReport> {
        let mut history = Vec::new();

        let request = ProvisionRequest {
            name: options.name.clone().unwrap_or_else(node_name),
            ssh_public_key: self.settings.ssh_public_key.clone(),
        };
        let provider = self.backend.provider_type();

        if let Err(e) = self.enter(&mut history, Stage::Provisioning, None) {
            history.push(Stage::Failed);
            return Err(e);
        }

        let node = match self.backend.create(&request).await {
            Ok(node) if !node.address.trim().is_empty() => node,
            Ok(node) => {
                let err = Error::provisioning_failed(provider.as_str(), "no address assigned");
                self.compensate(&node.id, &err).await;
                return Err(err);
            }
            Err(e) => {
                let err = Error::provisioning_failed(provider.as_str(), e.message.clone());
                if let Some(id) = &e.partial_id {
                    self.compensate(id, &err).await;
                }
                return Err(err);
            }
        };
        info!(cluster = %node.id, address = %node.address, provider = %provider, "Node provisioned");

        let context = PipelineContext {
            id: node.id,
            address: node.address,
            credential: Credential::basic(
                &options.username,
                options.password.clone().unwrap_or_else(generate_password),
            ),
        };

        match self.run_stages(&context, options, &mut history).await {
            Ok(record) => {
                history.push(Stage::Ready);
                info!(cluster = %record.id, address = %record.address, "Cluster ready");
                Ok(CreateReport { record, history })
            }
            Err(err) => {
                history.push(Stage::Failed);
                self.compensate(&context.id, &err).await;
                Err(err)
            }
        }
    }

    async fn run_stages(
        &self,
        ctx: &PipelineContext,
        options: &CreateOptions,
        history: &mut Vec<Stage>,
    ) -> Result<ClusterRecord> {
        let address = ctx.address.as_str();

        self.enter(history, Stage::AwaitingPort, Some(address))?;
        self.wait_for_port(address, self.settings.ssh_port).await?;

        self.enter(history, Stage::AwaitingShell, Some(address))?;
        self.components
            .remote
            .ensure_trust(address)
            .await
            .map_err(|e| Error::trust_failed(address, e.to_string()))?;
        self.components
            .remote
            .wait_for_shell(address, &self.settings.identity(), &self.settings.shell_policy)
            .await
            .map_err(|t| Error::ShellTimeout {
                address: t.address,
                attempts: t.attempts,
                elapsed: t.elapsed,
            })?;

        self.enter(history, Stage::Deploying, Some(address))?;
        let params = DeploymentParams {
            credential: ctx.credential.clone(),
            extra_vars: options.extra_vars.clone(),
        };
        self.deploy(ctx, &params).await?;
        if let Some(port) = self.settings.api_port {
            self.wait_for_port(address, port).await?;
        }

        self.enter(history, Stage::FetchingArtifact, Some(address))?;
        let cert_path = self
            .components
            .retriever
            .fetch_certificate(address, &ctx.id)
            .await
            .map_err(|e| Error::artifact_fetch_failed(&ctx.id, address, e.to_string()))?;

        self.enter(history, Stage::Persisting, Some(address))?;
        let record = ClusterRecord {
            id: ctx.id.clone(),
            address: ctx.address.clone(),
            api_endpoint: self.settings.api_endpoint(address),
            api_version: self.settings.api_version.clone(),
            credential: ctx.credential.clone(),
            cert_path,
            provider_params: self.backend.provider_params(),
        };
        self.store.put(&record)?;

        Ok(record)
    }

    async fn wait_for_port(&self, address: &str, port: u16) -> Result<()> {
        self.components
            .probe
            .wait_for_port(address, port, &self.settings.port_policy)
            .await
            .map_err(|t: ProbeTimeout| Error::PortTimeout {
                address: t.address,
                port: t.port,
                attempts: t.attempts,
                elapsed: t.elapsed,
            })
    }

    /// Run the deployment, stopping the runner if the pipeline is cancelled
    async fn deploy(&self, ctx: &PipelineContext, params: &DeploymentParams) -> Result<()> {
        let runner = &self.components.runner;
        let run = runner.run(&ctx.address, params);
        tokio::pin!(run);

        let result = tokio::select! {
            result = &mut run => result,
            _ = self.cancel.cancelled() => {
                warn!(cluster = %ctx.id, "Cancellation requested during deployment");
                runner.cancel();
                run.await
            }
        };

        match result {
            Ok(()) => Ok(()),
            Err(DeploymentError::Cancelled) => Err(Error::Cancelled {
                stage: Stage::Deploying.to_string(),
            }),
            Err(e) => Err(Error::deployment_failed(&ctx.id, &ctx.address, e.to_string())),
        }
    }

    /// Delete a partially created node. Failures are logged, never returned.
    async fn compensate(&self, id: &str, cause: &Error) {
        warn!(cluster = %id, error = %cause, kind = cause.kind(), "Pipeline failed, deleting node");
        match self.backend.delete(id).await {
            Ok(()) => info!(cluster = %id, "Partially created node deleted"),
            Err(e) => error!(
                cluster = %id,
                error = %e,
                "Failed to delete partially created node; it must be removed manually"
            ),
        }
    }

    /// Tear down a cluster: applications, then node, then record
    pub async fn destroy(&self, id: &str) -> Result<()> {
        let record = self.store.get(id)?;

        info!(cluster = %id, stage = "DestroyingApp", "Tearing down applications");
        match self.components.connector.connect(&record) {
            Ok(api) => match api.destroy_all().await {
                Ok(count) => info!(cluster = %id, count, "Applications removed"),
                Err(e) => warn!(cluster = %id, error = %e, "Application teardown failed, continuing"),
            },
            Err(e) => warn!(cluster = %id, error = %e, "Cannot reach application API, continuing"),
        }

        info!(cluster = %id, stage = "DeletingVm", "Deleting node");
        self.backend.delete(id).await.map_err(|e| {
            Error::deprovisioning_failed(id, self.backend.provider_type().as_str(), e.message)
        })?;

        info!(cluster = %id, stage = "RemovingRecord", "Removing cluster record");
        self.store.remove(id)?;

        match std::fs::remove_file(&record.cert_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                cluster = %id,
                path = %record.cert_path.display(),
                error = %e,
                "Failed to remove certificate"
            ),
        }

        info!(cluster = %id, stage = "Destroyed", "Cluster destroyed");
        Ok(())
    }

    /// API client for a stored cluster
    pub fn attach(&self, id: &str) -> Result<Arc<dyn ApplicationApi>> {
        let record = self.store.get(id)?;
        self.components.connector.connect(&record)
    }
}
