//! Error types for stratus
//!
//! Errors carry the context needed to diagnose a failure without re-running
//! the pipeline: the cluster id, the node address and, where it matters, the
//! stage that failed. Component-level errors (probe timeouts, transfer
//! failures, ...) are mapped into this type by the orchestrator.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for stratus operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The provisioning backend could not create the node
    #[error("provisioning failed [{provider}]: {message}")]
    ProvisioningFailed {
        /// Provider that was asked to create the node
        provider: String,
        /// Description of what failed
        message: String,
    },

    /// The provisioning backend could not delete the node
    #[error("deprovisioning failed [{provider}] for {id}: {message}")]
    DeprovisioningFailed {
        /// Provider-assigned node id
        id: String,
        /// Provider that was asked to delete the node
        provider: String,
        /// Description of what failed
        message: String,
    },

    /// A port never became reachable within its retry budget
    #[error("port {port} on {address} not reachable after {attempts} attempts ({elapsed:?})")]
    PortTimeout {
        /// Node address
        address: String,
        /// TCP port that was probed
        port: u16,
        /// Number of attempts made
        attempts: u32,
        /// Nominal time spent waiting (attempts * interval)
        elapsed: Duration,
    },

    /// The remote shell never became usable within its retry budget
    #[error("shell on {address} not usable after {attempts} attempts ({elapsed:?})")]
    ShellTimeout {
        /// Node address
        address: String,
        /// Number of attempts made
        attempts: u32,
        /// Nominal time spent waiting (attempts * interval)
        elapsed: Duration,
    },

    /// Host-key trust could not be established
    #[error("host key trust failed for {address}: {message}")]
    TrustFailed {
        /// Node address
        address: String,
        /// Description of what failed
        message: String,
    },

    /// The deployment run reported an error
    #[error("deployment failed for {id} ({address}): {message}")]
    DeploymentFailed {
        /// Cluster id
        id: String,
        /// Node address
        address: String,
        /// Description of what failed
        message: String,
    },

    /// The certificate could not be copied off the node
    #[error("artifact fetch failed for {id} ({address}): {message}")]
    ArtifactFetchFailed {
        /// Cluster id
        id: String,
        /// Node address
        address: String,
        /// Description of what failed
        message: String,
    },

    /// The state file could not be read or written
    #[error("persistence failed for {}: {message}", path.display())]
    PersistenceFailed {
        /// Path of the state file
        path: PathBuf,
        /// Description of what failed
        message: String,
    },

    /// No record exists for the requested cluster id
    #[error("cluster record not found: {id}")]
    RecordNotFound {
        /// Requested cluster id
        id: String,
    },

    /// A record's credential cannot be used to build an API client
    #[error("malformed credentials for {id}: {message}")]
    MalformedCredentials {
        /// Cluster id
        id: String,
        /// Description of what is wrong
        message: String,
    },

    /// The pipeline was cancelled
    #[error("cancelled during stage {stage}")]
    Cancelled {
        /// Stage at which the pipeline stopped
        stage: String,
    },

    /// Invalid or missing configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Local I/O error outside the state file
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a provisioning error
    pub fn provisioning_failed(provider: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ProvisioningFailed {
            provider: provider.into(),
            message: msg.into(),
        }
    }

    /// Create a deprovisioning error
    pub fn deprovisioning_failed(
        id: impl Into<String>,
        provider: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::DeprovisioningFailed {
            id: id.into(),
            provider: provider.into(),
            message: msg.into(),
        }
    }

    /// Create a host-key trust error
    pub fn trust_failed(address: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::TrustFailed {
            address: address.into(),
            message: msg.into(),
        }
    }

    /// Create a deployment error
    pub fn deployment_failed(
        id: impl Into<String>,
        address: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::DeploymentFailed {
            id: id.into(),
            address: address.into(),
            message: msg.into(),
        }
    }

    /// Create an artifact fetch error
    pub fn artifact_fetch_failed(
        id: impl Into<String>,
        address: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::ArtifactFetchFailed {
            id: id.into(),
            address: address.into(),
            message: msg.into(),
        }
    }

    /// Create a persistence error for the given state file
    pub fn persistence_failed(path: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        Self::PersistenceFailed {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create a record-not-found error
    pub fn record_not_found(id: impl Into<String>) -> Self {
        Self::RecordNotFound { id: id.into() }
    }

    /// Create a malformed credentials error
    pub fn malformed_credentials(id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::MalformedCredentials {
            id: id.into(),
            message: msg.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Short, stable name of the error kind for logs and exit reporting
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ProvisioningFailed { .. } => "ProvisioningFailed",
            Self::DeprovisioningFailed { .. } => "DeprovisioningFailed",
            Self::PortTimeout { .. } => "PortTimeout",
            Self::ShellTimeout { .. } => "ShellTimeout",
            Self::TrustFailed { .. } => "TrustFailed",
            Self::DeploymentFailed { .. } => "DeploymentFailed",
            Self::ArtifactFetchFailed { .. } => "ArtifactFetchFailed",
            Self::PersistenceFailed { .. } => "PersistenceFailed",
            Self::RecordNotFound { .. } => "RecordNotFound",
            Self::MalformedCredentials { .. } => "MalformedCredentials",
            Self::Cancelled { .. } => "Cancelled",
            Self::Config(_) => "Config",
            Self::Io(_) => "Io",
        }
    }
}
