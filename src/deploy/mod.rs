//! Deployment of the software stack onto a node
//!
//! A deployment is one long-running, never-retried run of a playbook against
//! a single address. The orchestrator only sees the [`DeploymentRunner`]
//! trait; [`AnsibleRunner`] is the concrete runner and [`PlaybookBundle`]
//! fetches the playbook it runs.

mod ansible;
mod playbook;

pub use ansible::{AnsibleRunner, CREDENTIALS_FILE, EXTRA_VARS_FILE, INVENTORY_FILE};
pub use playbook::PlaybookBundle;

use std::collections::BTreeMap;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use thiserror::Error;

use crate::store::Credential;

/// Extra var toggling the Terraform cloud orchestrator
pub const ENABLE_TERRAFORM: &str = "enable_terraform";
/// Extra var toggling the Occopus cloud orchestrator
pub const ENABLE_OCCOPUS: &str = "enable_occopus";

/// Inputs of one deployment run
#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentParams {
    /// Credential the deployed API will accept
    pub credential: Credential,
    /// Variables passed to the playbook
    pub extra_vars: BTreeMap<String, serde_yaml::Value>,
}

impl DeploymentParams {
    /// Params with no extra vars
    pub fn new(credential: Credential) -> Self {
        Self {
            credential,
            extra_vars: BTreeMap::new(),
        }
    }

    /// Set a playbook variable
    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<serde_yaml::Value>) -> Self {
        self.extra_vars.insert(key.into(), value.into());
        self
    }

    /// Set the cloud orchestrator toggles the stack understands
    pub fn with_orchestrators(self, terraform: bool, occopus: bool) -> Self {
        self.with_var(ENABLE_TERRAFORM, terraform)
            .with_var(ENABLE_OCCOPUS, occopus)
    }
}

/// A deployment run failed
#[derive(Debug, Error)]
pub enum DeploymentError {
    /// Inputs for the run could not be prepared
    #[error("deployment setup failed: {0}")]
    Setup(String),

    /// The playbook bundle could not be fetched or unpacked
    #[error("playbook bundle unavailable: {0}")]
    Bundle(String),

    /// The runner binary could not be started
    #[error("failed to start {program}: {message}")]
    Spawn {
        /// Binary that failed to start
        program: String,
        /// Underlying error
        message: String,
    },

    /// The playbook ran and failed
    #[error("playbook exited with {status}: {stderr}")]
    Failed {
        /// Exit status description
        status: String,
        /// Tail of the runner's stderr
        stderr: String,
    },

    /// The run was cancelled and the runner was stopped
    #[error("deployment cancelled")]
    Cancelled,
}

/// Trait for running a deployment against a node (allows mocking in tests)
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeploymentRunner: Send + Sync {
    /// Run the deployment to completion
    async fn run(&self, address: &str, params: &DeploymentParams) -> Result<(), DeploymentError>;

    /// Stop an in-flight run. Runners that cannot be interrupted ignore this.
    fn cancel(&self) {}
}
