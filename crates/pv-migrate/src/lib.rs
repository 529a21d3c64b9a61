//! # pv-migrate
//!
//! Copies the contents of one Kubernetes `PersistentVolumeClaim` into another, within a
//! namespace, across namespaces or across clusters.
//!
//! The engine deploys short-lived sshd and rsync workloads through a bundled Helm chart
//! and tries a list of transport strategies in order until one succeeds.
//!
//! ## Strategies
//!
//! - **mount**: one rsync job mounts both claims
//! - **clusterip**: sshd next to the source, rsync reaches it over cluster DNS
//! - **lbsvc**: sshd behind a `LoadBalancer` service, works across clusters
//! - **nodeport**: sshd behind a `NodePort` service
//! - **local**: both sides port-forwarded and bridged by a local ssh client
//!
//! ## Example
//!
//! ```rust,no_run
//! use pv_migrate::{Migrator, PvcRef, Request};
//!
//! # async fn run() -> pv_migrate::MigrateResult<()> {
//! let request = Request::new(
//!     PvcRef::new("old-data").with_namespace("ns1"),
//!     PvcRef::new("new-data").with_namespace("ns2"),
//! )
//! .with_strategies(["mount", "clusterip"]);
//!
//! Migrator::new().run(request).await
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`types`]: Request and claim references
//! - [`error`]: Error types and results
//! - [`k8s`]: Cluster access, claim classification, address discovery, port-forwarding
//! - [`helm`]: Bundled chart and the `helm` binary driver
//! - [`rsync`]: Rsync command builder, progress parser and log tailer
//! - [`ssh`]: Ephemeral SSH key pairs
//! - [`strategy`]: The five transport strategies
//! - [`migration`]: Per-run and per-attempt state
//! - [`migrator`]: The strategy engine

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod helm;
pub mod k8s;
pub mod migration;
pub mod migrator;
pub mod rsync;
pub mod ssh;
pub mod strategy;
pub mod types;

// Re-export main types for convenience
pub use error::{MigrateError, MigrateResult};
pub use migration::{Attempt, Migration, ReleaseRegistry};
pub use migrator::{DefaultRunner, Migrator, StrategyRunner, prepare};
pub use ssh::KeyPair;
pub use strategy::Strategy;
pub use types::{
    DEFAULT_HELM_TIMEOUT, DEFAULT_LB_SVC_TIMEOUT, DEFAULT_STRATEGIES, HelmOverlays,
    KeyAlgorithm, ProgressOutput, PvcRef, Request,
};
