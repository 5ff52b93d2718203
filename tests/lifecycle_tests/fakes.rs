//! In-process stand-ins for every external system the pipeline touches
//!
//! Each fake appends what it was asked to do to a shared [`Journal`], so a
//! test can assert on the order of side effects across collaborators.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use stratus::api::{ApiConnector, ApiError, ApplicationApi, ApplicationSubmission};
use stratus::artifact::{ArtifactRetriever, TransferError};
use stratus::deploy::{DeploymentError, DeploymentParams, DeploymentRunner};
use stratus::probe::{ProbeTimeout, ReadinessProbe};
use stratus::provider::{
    ProviderType, ProvisionRequest, ProvisionedNode, ProvisioningBackend, ProvisioningError,
    PROVIDER_PARAM,
};
use stratus::remote::{RemoteAccess, RemoteAccessError, ShellTimeout, SshIdentity};
use stratus::{
    ClusterRecord, ClusterStateStore, Components, Error, LifecycleOrchestrator, PipelineSettings,
    RetryPolicy,
};

// =============================================================================
// Journal
// =============================================================================

/// Ordered log of side effects shared by all fakes
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|e| *e == event).count()
    }
}

// =============================================================================
// Provisioning
// =============================================================================

pub struct FakeBackend {
    journal: Journal,
    node: ProvisionedNode,
    create_error: Option<ProvisioningError>,
    delete_error: Option<String>,
}

impl FakeBackend {
    pub fn new(journal: &Journal, id: &str, address: &str) -> Self {
        Self {
            journal: journal.clone(),
            node: ProvisionedNode {
                id: id.to_string(),
                address: address.to_string(),
            },
            create_error: None,
            delete_error: None,
        }
    }

    pub fn failing_create(mut self, error: ProvisioningError) -> Self {
        self.create_error = Some(error);
        self
    }

    pub fn failing_delete(mut self, message: &str) -> Self {
        self.delete_error = Some(message.to_string());
        self
    }
}

#[async_trait]
impl ProvisioningBackend for FakeBackend {
    fn provider_type(&self) -> ProviderType {
        ProviderType::OpenStack
    }

    async fn create(&self, _request: &ProvisionRequest) -> Result<ProvisionedNode, ProvisioningError> {
        self.journal.push("create");
        match &self.create_error {
            Some(e) => Err(e.clone()),
            None => Ok(self.node.clone()),
        }
    }

    async fn delete(&self, id: &str) -> Result<(), ProvisioningError> {
        self.journal.push(format!("delete:{}", id));
        match &self.delete_error {
            Some(message) => Err(ProvisioningError::new(message.clone())),
            None => Ok(()),
        }
    }

    fn provider_params(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (PROVIDER_PARAM.to_string(), "openstack".to_string()),
            ("region".to_string(), "RegionOne".to_string()),
        ])
    }
}

// =============================================================================
// Readiness and remote access
// =============================================================================

/// Port probe that refuses connections until a given attempt
pub struct FlakyProbe {
    journal: Journal,
    succeed_on: u32,
    /// (port, attempt it succeeded on)
    pub successes: Mutex<Vec<(u16, u32)>>,
}

impl FlakyProbe {
    pub fn new(journal: &Journal, succeed_on: u32) -> Self {
        Self {
            journal: journal.clone(),
            succeed_on,
            successes: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ReadinessProbe for FlakyProbe {
    async fn wait_for_port(
        &self,
        address: &str,
        port: u16,
        policy: &RetryPolicy,
    ) -> Result<(), ProbeTimeout> {
        self.journal.push(format!("port:{}", port));
        let succeed_on = self.succeed_on;
        let (_, attempt) = policy
            .poll("fake port", move |attempt| async move {
                if attempt >= succeed_on {
                    Ok(())
                } else {
                    Err("connection refused")
                }
            })
            .await
            .map_err(|e| ProbeTimeout {
                address: address.to_string(),
                port,
                attempts: e.attempts,
                elapsed: e.elapsed,
            })?;
        self.successes.lock().unwrap().push((port, attempt));
        Ok(())
    }
}

pub struct FakeRemote {
    journal: Journal,
}

impl FakeRemote {
    pub fn new(journal: &Journal) -> Self {
        Self {
            journal: journal.clone(),
        }
    }
}

#[async_trait]
impl RemoteAccess for FakeRemote {
    async fn ensure_trust(&self, _address: &str) -> Result<(), RemoteAccessError> {
        self.journal.push("trust");
        Ok(())
    }

    async fn wait_for_shell(
        &self,
        _address: &str,
        identity: &SshIdentity,
        _policy: &RetryPolicy,
    ) -> Result<(), ShellTimeout> {
        self.journal.push(format!("shell:{}", identity.user));
        Ok(())
    }
}

// =============================================================================
// Deployment and artifacts
// =============================================================================

pub struct FakeRunner {
    journal: Journal,
    failure: Option<String>,
    /// Params of every run, in order
    pub runs: Mutex<Vec<DeploymentParams>>,
}

impl FakeRunner {
    pub fn new(journal: &Journal) -> Self {
        Self {
            journal: journal.clone(),
            failure: None,
            runs: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(mut self, stderr: &str) -> Self {
        self.failure = Some(stderr.to_string());
        self
    }
}

#[async_trait]
impl DeploymentRunner for FakeRunner {
    async fn run(&self, address: &str, params: &DeploymentParams) -> Result<(), DeploymentError> {
        self.journal.push(format!("deploy:{}", address));
        self.runs.lock().unwrap().push(params.clone());
        match &self.failure {
            Some(stderr) => Err(DeploymentError::Failed {
                status: "exit status: 2".to_string(),
                stderr: stderr.clone(),
            }),
            None => Ok(()),
        }
    }
}

pub struct FakeRetriever {
    journal: Journal,
    cert_dir: PathBuf,
}

impl FakeRetriever {
    pub fn new(journal: &Journal, cert_dir: impl Into<PathBuf>) -> Self {
        Self {
            journal: journal.clone(),
            cert_dir: cert_dir.into(),
        }
    }
}

#[async_trait]
impl ArtifactRetriever for FakeRetriever {
    async fn fetch_certificate(
        &self,
        _address: &str,
        identifier: &str,
    ) -> Result<PathBuf, TransferError> {
        self.journal.push("fetch");
        Ok(self.cert_dir.join(format!("{}.pem", identifier)))
    }
}

// =============================================================================
// Application API
// =============================================================================

pub struct FakeApi {
    journal: Journal,
    apps: Vec<String>,
    reachable: bool,
}

#[async_trait]
impl ApplicationApi for FakeApi {
    async fn applications(&self) -> Result<Vec<String>, ApiError> {
        self.journal.push("applications");
        Ok(self.apps.clone())
    }

    async fn submit(&self, _submission: &ApplicationSubmission) -> Result<Value, ApiError> {
        self.journal.push("submit");
        Ok(Value::Null)
    }

    async fn destroy_all(&self) -> Result<usize, ApiError> {
        self.journal.push("destroy_all");
        if !self.reachable {
            return Err(ApiError::Transport {
                url: "https://10.0.0.5/toscasubmitter/v2.0/applications/".to_string(),
                message: "connection refused".to_string(),
            });
        }
        Ok(self.apps.len())
    }
}

pub struct FakeConnector {
    journal: Journal,
    apps: Vec<String>,
    reachable: bool,
}

impl FakeConnector {
    pub fn new(journal: &Journal, apps: &[&str]) -> Self {
        Self {
            journal: journal.clone(),
            apps: apps.iter().map(|a| a.to_string()).collect(),
            reachable: true,
        }
    }

    pub fn unreachable(mut self) -> Self {
        self.reachable = false;
        self
    }
}

impl ApiConnector for FakeConnector {
    fn connect(&self, record: &ClusterRecord) -> stratus::Result<Arc<dyn ApplicationApi>> {
        self.journal.push(format!("connect:{}", record.id));
        if record.cert_path.as_os_str().is_empty() {
            return Err(Error::malformed_credentials(&record.id, "no certificate"));
        }
        Ok(Arc::new(FakeApi {
            journal: self.journal.clone(),
            apps: self.apps.clone(),
            reachable: self.reachable,
        }))
    }
}

// =============================================================================
// Assembly
// =============================================================================

/// Settings with instant retries and no API port wait
pub fn settings(port_attempts: u32) -> PipelineSettings {
    PipelineSettings {
        ssh_user: "ubuntu".to_string(),
        private_key: PathBuf::from("/keys/id_ed25519"),
        ssh_public_key: "ssh-ed25519 AAAAtest stratus".to_string(),
        ssh_port: 22,
        api_port: None,
        api_version: "v2.0".to_string(),
        api_path: "toscasubmitter".to_string(),
        port_policy: RetryPolicy::new(Duration::ZERO, port_attempts),
        shell_policy: RetryPolicy::new(Duration::ZERO, 3),
    }
}

/// Everything a story needs to drive and inspect one pipeline
pub struct Harness<B: ProvisioningBackend> {
    pub journal: Journal,
    pub orchestrator: LifecycleOrchestrator<B>,
    pub probe: Arc<FlakyProbe>,
    pub runner: Arc<FakeRunner>,
    pub store: ClusterStateStore,
    _dir: tempfile::TempDir,
}

pub struct HarnessBuilder {
    journal: Journal,
    probe: FlakyProbe,
    runner: FakeRunner,
    connector: FakeConnector,
    settings: PipelineSettings,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        let journal = Journal::default();
        Self {
            probe: FlakyProbe::new(&journal, 1),
            runner: FakeRunner::new(&journal),
            connector: FakeConnector::new(&journal, &[]),
            settings: settings(5),
            journal,
        }
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn probe(mut self, probe: FlakyProbe) -> Self {
        self.probe = probe;
        self
    }

    pub fn runner(mut self, runner: FakeRunner) -> Self {
        self.runner = runner;
        self
    }

    pub fn connector(mut self, connector: FakeConnector) -> Self {
        self.connector = connector;
        self
    }

    pub fn settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build<B: ProvisioningBackend>(self, backend: B) -> Harness<B> {
        let dir = tempfile::tempdir().unwrap();
        let store = ClusterStateStore::new(dir.path().join("clusters.yaml"));
        let probe = Arc::new(self.probe);
        let runner = Arc::new(self.runner);

        let components = Components {
            probe: probe.clone(),
            remote: Arc::new(FakeRemote::new(&self.journal)),
            runner: runner.clone(),
            retriever: Arc::new(FakeRetriever::new(&self.journal, "/certs")),
            connector: Arc::new(self.connector),
        };

        Harness {
            orchestrator: LifecycleOrchestrator::new(
                backend,
                components,
                store.clone(),
                self.settings,
            ),
            journal: self.journal,
            probe,
            runner,
            store,
            _dir: dir,
        }
    }
}
