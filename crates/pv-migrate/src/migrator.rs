//! The strategy engine.
//!
//! [`Migrator::run`] resolves the requested strategies, looks up both claims, runs the
//! preflight checks and then tries each strategy in order until one succeeds. A
//! strategy that declines or fails hands over to the next one; preflight failures and
//! cancellation end the run.

use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::error::{MigrateError, MigrateResult};
use crate::k8s::{ClientIdentity, ClusterClient, PvcInfo, classify, get_client};
use crate::migration::{Attempt, Migration};
use crate::strategy::Strategy;
use crate::types::{PvcRef, Request};

/// Runs one strategy for one attempt.
///
/// The engine only sees this seam, so strategy ordering can be exercised with
/// scripted outcomes.
pub trait StrategyRunner {
    /// Runs `strategy` for `attempt`, cleanup included.
    fn run<'a>(
        &'a self,
        strategy: Strategy,
        attempt: &'a Attempt<'a>,
    ) -> impl Future<Output = MigrateResult<()>> + 'a;
}

/// Runs the real strategies.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRunner;

impl StrategyRunner for DefaultRunner {
    fn run<'a>(
        &'a self,
        strategy: Strategy,
        attempt: &'a Attempt<'a>,
    ) -> impl Future<Output = MigrateResult<()>> + 'a {
        strategy.run(attempt)
    }
}

/// Migrates a claim's contents by trying strategies in order.
#[derive(Debug, Default)]
pub struct Migrator<R = DefaultRunner> {
    runner: R,
}

impl Migrator {
    /// Creates a migrator running the real strategies.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl<R: StrategyRunner> Migrator<R> {
    /// Creates a migrator with a custom runner.
    #[must_use]
    pub const fn with_runner(runner: R) -> Self {
        Self { runner }
    }

    /// Runs a migration with a fresh cancellation token.
    ///
    /// # Errors
    ///
    /// See [`Migrator::run_with_cancel`].
    pub async fn run(&self, request: Request) -> MigrateResult<()> {
        self.run_with_cancel(request, CancellationToken::new()).await
    }

    /// Runs a migration.
    ///
    /// SIGINT and SIGTERM cancel the run. A cancelled run uninstalls whatever releases
    /// are still recorded, unless cleanup is skipped, and returns
    /// [`MigrateError::Cancelled`].
    ///
    /// # Errors
    ///
    /// Returns the preflight error that stopped the run, [`MigrateError::Cancelled`],
    /// or [`MigrateError::AllStrategiesFailed`] when no strategy succeeded.
    pub async fn run_with_cancel(
        &self,
        request: Request,
        cancel: CancellationToken,
    ) -> MigrateResult<()> {
        let strategies = Strategy::resolve(&request.strategies)?;
        let migration = prepare(request, cancel).await?;

        let signals = spawn_signal_handler(migration.cancel.clone());
        let result = self.drive(&migration, &strategies).await;
        signals.abort();

        if migration.cancel.is_cancelled() {
            sweep_releases(&migration).await;
        }
        result
    }

    /// Tries each strategy in order against a prepared migration.
    ///
    /// # Errors
    ///
    /// Returns the first non-recoverable strategy error, or
    /// [`MigrateError::AllStrategiesFailed`].
    pub async fn drive(&self, migration: &Migration, strategies: &[Strategy]) -> MigrateResult<()> {
        for &strategy in strategies {
            let attempt = Attempt::new(migration);
            let span = info_span!("attempt", attempt = %attempt.id(), strategy = %strategy);

            let result = async {
                info!("attempting migration");
                self.runner.run(strategy, &attempt).await
            }
            .instrument(span.clone())
            .await;

            let _entered = span.enter();
            match result {
                Ok(()) => {
                    info!("migration succeeded");
                    return Ok(());
                }
                Err(MigrateError::Unaccepted) => {
                    info!("Strategy cannot handle this migration, will try the next one");
                }
                Err(e) if !e.is_recoverable() => return Err(e),
                Err(e) => {
                    warn!(error = %e, "Migration failed with this strategy, will try with the remaining strategies");
                }
            }
        }
        Err(MigrateError::AllStrategiesFailed)
    }
}

/// Loads both clusters, classifies both claims and runs the preflight checks.
///
/// # Errors
///
/// Returns the config, lookup, mounted or writability error that failed the preflight.
pub async fn prepare(request: Request, cancel: CancellationToken) -> MigrateResult<Migration> {
    let (source_client, dest_client) = clients(&request.source, &request.dest).await?;

    let source_ns = resolve_namespace(&request.source, &source_client);
    let dest_ns = resolve_namespace(&request.dest, &dest_client);
    debug!(source = %format!("{source_ns}/{}", request.source.name), dest = %format!("{dest_ns}/{}", request.dest.name), "resolved claims");

    let source = classify(source_client, &source_ns, &request.source.name).await?;
    let dest = classify(dest_client, &dest_ns, &request.dest.name).await?;

    check_mounted(&source, request.ignore_mounted)?;
    check_mounted(&dest, request.ignore_mounted)?;
    check_writable(&dest)?;

    Migration::new(source, dest, request, cancel)
}

/// Loads the source client, reusing it for the destination when both references
/// resolve to the same kubeconfig and context.
async fn clients(
    source: &PvcRef,
    dest: &PvcRef,
) -> MigrateResult<(Arc<ClusterClient>, Arc<ClusterClient>)> {
    let source_client = Arc::new(
        get_client(source.kubeconfig.as_deref(), source.context.as_deref()).await?,
    );
    let dest_identity =
        ClientIdentity::resolve(dest.kubeconfig.as_deref(), dest.context.as_deref());
    let dest_client = if *source_client.identity() == dest_identity {
        Arc::clone(&source_client)
    } else {
        Arc::new(get_client(dest.kubeconfig.as_deref(), dest.context.as_deref()).await?)
    };
    Ok((source_client, dest_client))
}

fn resolve_namespace(pvc: &PvcRef, client: &ClusterClient) -> String {
    pvc.namespace
        .clone()
        .filter(|ns| !ns.is_empty())
        .unwrap_or_else(|| client.default_namespace().to_string())
}

fn check_mounted(pvc: &PvcInfo, ignore_mounted: bool) -> MigrateResult<()> {
    let Some(node) = pvc.mounted_node() else {
        return Ok(());
    };
    if ignore_mounted {
        info!(pvc = %format!("{}/{}", pvc.namespace(), pvc.name()), node, "ignoring mounted pvc");
        return Ok(());
    }
    Err(MigrateError::Mounted {
        name: pvc.name().to_string(),
        node: node.to_string(),
    })
}

fn check_writable(dest: &PvcInfo) -> MigrateResult<()> {
    if dest.supports_rwo() || dest.supports_rwx() {
        Ok(())
    } else {
        Err(MigrateError::NotWritable {
            namespace: dest.namespace().to_string(),
            name: dest.name().to_string(),
        })
    }
}

/// Removes releases a cancelled run left behind, such as ones whose attempt cleanup
/// failed. Honours `skip_cleanup`.
async fn sweep_releases(migration: &Migration) {
    let releases = &migration.releases;
    if releases.is_empty() {
        return;
    }
    let request = &migration.request;
    if request.skip_cleanup {
        let names: Vec<String> = releases.snapshot().into_iter().map(|r| r.name).collect();
        info!(releases = ?names, "run cancelled, skipping cleanup");
        return;
    }
    warn!(count = releases.len(), "run cancelled, removing remaining releases");
    releases
        .uninstall_all(&request.helm_binary, request.helm_timeout)
        .await;
}

fn spawn_signal_handler(cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        shutdown_signal().await;
        warn!("received termination signal, cancelling");
        cancel.cancel();
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
