//! Stratus - single-node cloud deployment lifecycle manager
//!
//! Stratus creates a compute node through a provisioning backend, waits for it
//! to come up, establishes SSH trust, runs a deployment playbook on it, fetches
//! the certificate the deployment generates and records everything needed to
//! talk to (and later tear down) the deployed API.
//!
//! # Architecture
//!
//! Every external system sits behind a trait so the pipeline can be driven by
//! fakes in tests:
//! - [`provider::ProvisioningBackend`] creates and deletes nodes
//! - [`probe::ReadinessProbe`] waits for TCP ports
//! - [`remote::RemoteAccess`] manages host-key trust and shell liveness
//! - [`deploy::DeploymentRunner`] runs the deployment
//! - [`artifact::ArtifactRetriever`] copies the certificate off the node
//! - [`api::ApiConnector`] builds API clients from stored records
//!
//! [`orchestrator::LifecycleOrchestrator`] composes them and owns failure
//! compensation. [`store::ClusterStateStore`] is the only persistent state.
//!
//! # Modules
//!
//! - [`api`] - Client for the deployed application API
//! - [`artifact`] - Certificate retrieval over SSH
//! - [`atomic`] - Atomic file replacement
//! - [`config`] - Home directory layout and tunables
//! - [`deploy`] - Playbook bundle handling and the deployment runner
//! - [`error`] - Error types for stratus operations
//! - [`orchestrator`] - The create/destroy pipeline
//! - [`probe`] - TCP readiness checks
//! - [`provider`] - Provisioning backends (OpenStack, static host)
//! - [`remote`] - SSH keys, known_hosts and remote commands
//! - [`retry`] - Bounded fixed-interval retry
//! - [`store`] - Cluster record persistence

#![warn(missing_docs)]

pub mod api;
pub mod artifact;
pub mod atomic;
pub mod config;
pub mod deploy;
pub mod error;
pub mod orchestrator;
pub mod probe;
pub mod provider;
pub mod remote;
pub mod retry;
pub mod store;

pub use error::Error;
pub use orchestrator::{
    Components, CreateOptions, CreateReport, LifecycleOrchestrator, PipelineSettings, Stage,
};
pub use retry::RetryPolicy;
pub use store::{ClusterRecord, ClusterStateStore, Credential};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
