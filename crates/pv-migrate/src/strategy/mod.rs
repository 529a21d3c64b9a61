//! Transport strategies.
//!
//! Each strategy is an algorithm that connects the source and destination volumes
//! through chart releases:
//!
//! - `mount`: one rsync job mounting both claims
//! - `clusterip`: sshd next to the source, rsync next to the destination, in-cluster DNS
//! - `lbsvc`: sshd behind a `LoadBalancer` service, reachable across clusters
//! - `nodeport`: sshd behind a `NodePort` service
//! - `local`: two sshd pods bridged by port-forwards and a local ssh client
//!
//! Strategies hold no state; everything lives on the [`Attempt`] they run with.

mod clusterip;
mod lbsvc;
mod local;
mod mount;
mod nodeport;

use std::fmt;
use std::str::FromStr;

use serde_json::{Value, json};
use tracing::info;

use crate::error::{MigrateError, MigrateResult};
use crate::k8s::PvcInfo;
use crate::migration::Attempt;
use crate::rsync::RsyncCommand;
use crate::ssh::KeyPair;
use crate::types::Request;

/// Where the source claim is mounted in migration pods.
pub const SOURCE_MOUNT_PATH: &str = "/source";
/// Where the destination claim is mounted in migration pods.
pub const DEST_MOUNT_PATH: &str = "/dest";

/// A transport strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// Both claims mounted into one pod.
    Mount,
    /// sshd reached through its cluster DNS name.
    ClusterIp,
    /// sshd reached through a load balancer.
    LoadBalancer,
    /// sshd reached through a node port.
    NodePort,
    /// Both sides port-forwarded to this machine.
    Local,
}

impl Strategy {
    /// Every strategy, in default preference order.
    pub const ALL: [Self; 5] = [
        Self::Mount,
        Self::ClusterIp,
        Self::LoadBalancer,
        Self::NodePort,
        Self::Local,
    ];

    /// The strategy's name as given on the command line.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Mount => "mount",
            Self::ClusterIp => "clusterip",
            Self::LoadBalancer => "lbsvc",
            Self::NodePort => "nodeport",
            Self::Local => "local",
        }
    }

    /// Maps strategy names to strategies, keeping their order.
    ///
    /// # Errors
    ///
    /// Returns [`MigrateError::UnknownStrategy`] for the first unknown name.
    pub fn resolve<S: AsRef<str>>(names: &[S]) -> MigrateResult<Vec<Self>> {
        names.iter().map(|n| n.as_ref().parse()).collect()
    }

    /// Runs the strategy, then cleans up the attempt's releases.
    ///
    /// Cleanup runs whatever the outcome, including cancellation.
    ///
    /// # Errors
    ///
    /// Returns [`MigrateError::Unaccepted`] if the strategy cannot handle the migration,
    /// [`MigrateError::Cancelled`] if the run was cancelled, or the strategy's failure.
    pub async fn run(self, attempt: &Attempt<'_>) -> MigrateResult<()> {
        let result = tokio::select! {
            biased;
            () = attempt.cancel().cancelled() => Err(MigrateError::Cancelled),
            result = self.execute(attempt) => result,
        };
        attempt.cleanup().await;
        result
    }

    async fn execute(self, attempt: &Attempt<'_>) -> MigrateResult<()> {
        match self {
            Self::Mount => mount::run(attempt).await,
            Self::ClusterIp => clusterip::run(attempt).await,
            Self::LoadBalancer => lbsvc::run(attempt).await,
            Self::NodePort => nodeport::run(attempt).await,
            Self::Local => local::run(attempt).await,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == name)
            .ok_or_else(|| MigrateError::UnknownStrategy(name.to_string()))
    }
}

/// Path rsync reads or writes: the mount point joined with the requested sub-path.
#[must_use]
pub fn rsync_path(mount: &str, path: &str) -> String {
    format!("{mount}/{path}")
}

/// Rsync command with both paths and flags filled in from the request.
#[must_use]
pub fn base_rsync_command(request: &Request) -> RsyncCommand {
    RsyncCommand::new(
        rsync_path(SOURCE_MOUNT_PATH, &request.source.path),
        rsync_path(DEST_MOUNT_PATH, &request.dest.path),
    )
    .with_flags(request.no_chown, request.delete_extraneous, request.compress)
}

/// Name of the rsync job a release renders.
#[must_use]
pub fn job_name(release: &str) -> String {
    format!("{release}-rsync")
}

/// Name of the sshd service a release renders.
#[must_use]
pub fn sshd_service_name(release: &str) -> String {
    format!("{release}-sshd")
}

/// One `pvcMounts` entry.
#[must_use]
pub fn pvc_mount(name: &str, mount_path: &str, read_only: bool) -> Value {
    json!({ "name": name, "mountPath": mount_path, "readOnly": read_only })
}

/// sshd values serving the source claim.
#[must_use]
pub fn source_sshd_values(source: &PvcInfo, request: &Request, keys: &KeyPair, service_type: &str) -> Value {
    json!({
        "enabled": true,
        "namespace": source.namespace(),
        "publicKey": keys.public_key,
        "service": { "type": service_type },
        "pvcMounts": [pvc_mount(source.name(), SOURCE_MOUNT_PATH, request.source_mount_read_only)],
        "affinity": source.affinity_value(),
    })
}

/// rsync job values writing into the destination claim over ssh.
#[must_use]
pub fn dest_rsync_values(dest: &PvcInfo, keys: &KeyPair, remote_host: &str, command: &str) -> Value {
    json!({
        "enabled": true,
        "namespace": dest.namespace(),
        "privateKeyMount": true,
        "privateKey": keys.private_key,
        "privateKeyMountPath": keys.algorithm.private_key_mount_path(),
        "sshRemoteHost": remote_host,
        "command": command,
        "pvcMounts": [pvc_mount(dest.name(), DEST_MOUNT_PATH, false)],
        "affinity": dest.affinity_value(),
    })
}

/// Host the rsync side connects to: the override when given, else the discovered one.
#[must_use]
pub fn remote_host(request: &Request, discovered: String) -> String {
    match &request.dest_host_override {
        Some(host) if !host.is_empty() => {
            info!(host = %host, "using destination host override");
            host.clone()
        }
        _ => discovered,
    }
}
