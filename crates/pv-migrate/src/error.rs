//! Error types for the migration engine.
//!
//! Every failure the engine can surface is a [`MigrateError`]. The variants fall into
//! two groups: preflight failures that end the run immediately, and strategy failures
//! that the engine absorbs before trying the next strategy.

use thiserror::Error;

/// Result type alias for migration operations.
pub type MigrateResult<T> = Result<T, MigrateError>;

/// Errors that can occur while migrating a persistent volume claim.
#[derive(Debug, Error)]
pub enum MigrateError {
    /// Kubeconfig could not be loaded or the requested context is absent.
    #[error("kubeconfig error: {0}")]
    Config(String),

    /// The claim does not exist.
    #[error("pvc {namespace}/{name} not found")]
    NotFound {
        /// Namespace that was searched
        namespace: String,
        /// Claim name
        name: String,
    },

    /// The claim cannot be migrated in its current state.
    #[error("pvc {namespace}/{name} is not supported: {reason}")]
    Unsupported {
        /// Claim namespace
        namespace: String,
        /// Claim name
        name: String,
        /// Why the claim was rejected
        reason: String,
    },

    /// The claim is mounted and mounted claims were not explicitly allowed.
    #[error("PVC {name} is mounted to node {node} and ignore-mounted is not requested")]
    Mounted {
        /// Claim name
        name: String,
        /// Node that mounts the claim
        node: String,
    },

    /// The destination claim can be written by neither RWO nor RWX.
    #[error("destination pvc {namespace}/{name} is not writable")]
    NotWritable {
        /// Claim namespace
        namespace: String,
        /// Claim name
        name: String,
    },

    /// A strategy name that the engine does not know.
    #[error("unknown strategy: {0}")]
    UnknownStrategy(String),

    /// A strategy declined this migration.
    #[error("strategy cannot handle this migration")]
    Unaccepted,

    /// Installing a chart release failed.
    #[error("failed to install helm release {release}: {reason}")]
    Install {
        /// Release name
        release: String,
        /// Helm output or launch failure
        reason: String,
    },

    /// Uninstalling a chart release failed.
    #[error("failed to uninstall helm release {release}: {reason}")]
    Uninstall {
        /// Release name
        release: String,
        /// Helm output or launch failure
        reason: String,
    },

    /// The rsync job's pod terminated without succeeding.
    #[error("job {namespace}/{name} failed")]
    JobFailed {
        /// Job namespace
        namespace: String,
        /// Job name
        name: String,
    },

    /// The load balancer never published an address.
    #[error("timed out waiting for load balancer address of service {namespace}/{name}")]
    LbTimeout {
        /// Service namespace
        namespace: String,
        /// Service name
        name: String,
    },

    /// No node reports an internal or external IP address.
    #[error("no node with an InternalIP or ExternalIP address found")]
    NoNodeAddress,

    /// Port-forward setup or operation failed.
    #[error("port-forward error: {0}")]
    PortForward(String),

    /// A command could not be built or exited unsuccessfully.
    #[error("command error: {0}")]
    Command(String),

    /// Every requested strategy was tried and none succeeded.
    #[error("all strategies failed")]
    AllStrategiesFailed,

    /// SSH key generation or encoding failed.
    #[error("ssh key error: {0}")]
    Key(String),

    /// The run was cancelled.
    #[error("migration cancelled")]
    Cancelled,

    /// Kubernetes API error.
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    /// Watch stream error.
    #[error("watch error: {0}")]
    Watch(#[from] kube::runtime::watcher::Error),

    /// Condition wait error.
    #[error("wait error: {0}")]
    Wait(#[from] kube::runtime::wait::Error),

    /// Filesystem or process I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Values serialisation error.
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl MigrateError {
    /// Creates a not found error for a claim.
    #[must_use]
    pub fn not_found(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Creates a job failure error.
    #[must_use]
    pub fn job_failed(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::JobFailed {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Returns true when the engine may move on to the next strategy after this error.
    ///
    /// Preflight kinds (config, lookup, mount and writability checks, unknown strategy
    /// names) and cancellation end the run; everything a strategy raises while driving
    /// a transfer does not.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Self::Config(_)
                | Self::NotFound { .. }
                | Self::Unsupported { .. }
                | Self::Mounted { .. }
                | Self::NotWritable { .. }
                | Self::UnknownStrategy(_)
                | Self::AllStrategiesFailed
                | Self::Cancelled
        )
    }
}
