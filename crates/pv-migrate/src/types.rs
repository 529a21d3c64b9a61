//! Core request types for the migration engine.
//!
//! This module defines the immutable input of a run:
//! - `PvcRef`: where a claim lives (kubeconfig, context, namespace, name, sub-path)
//! - `KeyAlgorithm`: which SSH key type to mint
//! - `HelmOverlays`: user-provided chart value layers
//! - `Request`: everything the engine needs for one migration

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::MigrateError;
use crate::helm::HELM_BINARY;

/// Strategies tried when the caller does not name any.
pub const DEFAULT_STRATEGIES: &[&str] = &["mount", "clusterip", "lbsvc"];

/// Default Helm install/uninstall timeout.
pub const DEFAULT_HELM_TIMEOUT: Duration = Duration::from_secs(60);

/// Default load balancer address timeout.
pub const DEFAULT_LB_SVC_TIMEOUT: Duration = Duration::from_secs(120);

/// Reference to a persistent volume claim on some cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PvcRef {
    /// Path to a kubeconfig file; `None` uses the standard discovery rules.
    pub kubeconfig: Option<PathBuf>,
    /// Kubeconfig context; `None` uses the loader's current context.
    pub context: Option<String>,
    /// Namespace; `None` resolves to the context's default namespace.
    pub namespace: Option<String>,
    /// Claim name.
    pub name: String,
    /// Sub-path inside the volume to copy from or into.
    pub path: String,
}

impl PvcRef {
    /// Creates a reference to a claim using the default kubeconfig, context and namespace.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            kubeconfig: None,
            context: None,
            namespace: None,
            name: name.into(),
            path: "/".to_string(),
        }
    }

    /// Sets the kubeconfig path.
    #[must_use]
    pub fn with_kubeconfig(mut self, path: impl Into<PathBuf>) -> Self {
        self.kubeconfig = Some(path.into());
        self
    }

    /// Sets the kubeconfig context.
    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Sets the namespace.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Sets the sub-path inside the volume.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }
}

/// SSH key algorithm used for the sshd/rsync pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum KeyAlgorithm {
    /// Ed25519 keys in OpenSSH format.
    #[default]
    Ed25519,
    /// 2048-bit RSA keys in PKCS#1 format.
    Rsa,
}

impl KeyAlgorithm {
    /// Returns the algorithm's short name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ed25519 => "ed25519",
            Self::Rsa => "rsa",
        }
    }

    /// Path at which the private key is mounted inside migration pods.
    #[must_use]
    pub fn private_key_mount_path(self) -> String {
        format!("/tmp/id_{}", self.as_str())
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyAlgorithm {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ed25519" => Ok(Self::Ed25519),
            "rsa" => Ok(Self::Rsa),
            other => Err(MigrateError::Key(format!("unsupported key algorithm: {other}"))),
        }
    }
}

/// User-provided chart value layers, applied after the strategy's own values.
///
/// Later layers win on collision: values files in order, then `--set`,
/// `--set-string`, `--set-file`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HelmOverlays {
    /// Values files, in order.
    pub values_files: Vec<PathBuf>,
    /// `key=value` assignments.
    pub set: Vec<String>,
    /// `key=value` assignments forced to strings.
    pub set_string: Vec<String>,
    /// `key=path` assignments read from files.
    pub set_file: Vec<String>,
}

/// Where the progress bar is drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProgressOutput {
    /// Standard error.
    #[default]
    Stderr,
    /// Standard output.
    Stdout,
    /// Never drawn; progress is logged at debug level instead.
    Hidden,
}

/// A complete migration request.
///
/// Created by the caller, handed to the engine, never mutated during the run.
#[derive(Debug, Clone)]
pub struct Request {
    /// Source claim.
    pub source: PvcRef,
    /// Destination claim.
    pub dest: PvcRef,
    /// Delete files on the destination that do not exist on the source.
    pub delete_extraneous: bool,
    /// Proceed even if a claim is mounted by a running pod.
    pub ignore_mounted: bool,
    /// Do not preserve file owner and group.
    pub no_chown: bool,
    /// Render a progress bar while rsync runs.
    pub show_progress: bool,
    /// Mount the source claim read-only.
    pub source_mount_read_only: bool,
    /// Compress data in transit.
    pub compress: bool,
    /// Leave chart releases installed after the attempt.
    pub skip_cleanup: bool,
    /// SSH key algorithm.
    pub key_algorithm: KeyAlgorithm,
    /// Strategy names to try, in order.
    pub strategies: Vec<String>,
    /// User chart value layers.
    pub helm: HelmOverlays,
    /// Address the rsync side uses instead of the discovered one.
    pub dest_host_override: Option<String>,
    /// Fixed NodePort for the `nodeport` strategy.
    pub node_port: Option<u16>,
    /// Helm executable, looked up on `PATH` when not a path.
    pub helm_binary: PathBuf,
    /// Helm install/uninstall timeout.
    pub helm_timeout: Duration,
    /// Load balancer and service watch timeout.
    pub lb_svc_timeout: Duration,
    /// Progress bar target.
    pub progress_output: ProgressOutput,
}

impl Request {
    /// Creates a request with the default options.
    #[must_use]
    pub fn new(source: PvcRef, dest: PvcRef) -> Self {
        Self {
            source,
            dest,
            delete_extraneous: false,
            ignore_mounted: false,
            no_chown: false,
            show_progress: true,
            source_mount_read_only: true,
            compress: true,
            skip_cleanup: false,
            key_algorithm: KeyAlgorithm::default(),
            strategies: DEFAULT_STRATEGIES.iter().map(ToString::to_string).collect(),
            helm: HelmOverlays::default(),
            dest_host_override: None,
            node_port: None,
            helm_binary: PathBuf::from(HELM_BINARY),
            helm_timeout: DEFAULT_HELM_TIMEOUT,
            lb_svc_timeout: DEFAULT_LB_SVC_TIMEOUT,
            progress_output: ProgressOutput::default(),
        }
    }

    /// Sets the strategy list.
    #[must_use]
    pub fn with_strategies<I, S>(mut self, strategies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.strategies = strategies.into_iter().map(Into::into).collect();
        self
    }

    /// Sets whether mounted claims are tolerated.
    #[must_use]
    pub const fn with_ignore_mounted(mut self, ignore: bool) -> Self {
        self.ignore_mounted = ignore;
        self
    }

    /// Sets whether extraneous destination files are deleted.
    #[must_use]
    pub const fn with_delete_extraneous(mut self, delete: bool) -> Self {
        self.delete_extraneous = delete;
        self
    }

    /// Sets whether ownership is left alone.
    #[must_use]
    pub const fn with_no_chown(mut self, no_chown: bool) -> Self {
        self.no_chown = no_chown;
        self
    }

    /// Sets the key algorithm.
    #[must_use]
    pub const fn with_key_algorithm(mut self, algorithm: KeyAlgorithm) -> Self {
        self.key_algorithm = algorithm;
        self
    }

    /// Sets the helm executable.
    #[must_use]
    pub fn with_helm_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.helm_binary = binary.into();
        self
    }

    /// Returns true when the progress bar should be drawn.
    #[must_use]
    pub fn progress_bar_enabled(&self) -> bool {
        self.show_progress && self.progress_output != ProgressOutput::Hidden
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_defaults() {
        let req = Request::new(PvcRef::new("source"), PvcRef::new("dest"));
        assert_eq!(req.strategies, vec!["mount", "clusterip", "lbsvc"]);
        assert_eq!(req.key_algorithm, KeyAlgorithm::Ed25519);
        assert_eq!(req.helm_timeout, Duration::from_secs(60));
        assert_eq!(req.lb_svc_timeout, Duration::from_secs(120));
        assert!(req.source_mount_read_only);
        assert!(req.compress);
        assert!(!req.skip_cleanup);
        assert_eq!(req.helm_binary, PathBuf::from("helm"));
        assert_eq!(req.source.path, "/");
    }

    #[test]
    fn key_algorithm_parsing() {
        assert_eq!("ed25519".parse::<KeyAlgorithm>().ok(), Some(KeyAlgorithm::Ed25519));
        assert_eq!("RSA".parse::<KeyAlgorithm>().ok(), Some(KeyAlgorithm::Rsa));
        assert!("dsa".parse::<KeyAlgorithm>().is_err());
    }

    #[test]
    fn private_key_mount_path_uses_algorithm() {
        assert_eq!(KeyAlgorithm::Ed25519.private_key_mount_path(), "/tmp/id_ed25519");
        assert_eq!(KeyAlgorithm::Rsa.private_key_mount_path(), "/tmp/id_rsa");
    }

    #[test]
    fn hidden_output_disables_progress_bar() {
        let mut req = Request::new(PvcRef::new("a"), PvcRef::new("b"));
        assert!(req.progress_bar_enabled());
        req.progress_output = ProgressOutput::Hidden;
        assert!(!req.progress_bar_enabled());
    }
}
