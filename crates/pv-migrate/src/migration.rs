//! Migration and attempt state shared by the engine and the strategies.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::MigrateResult;
use crate::helm::{self, Chart, InstallRequest};
use crate::k8s::{ClusterClient, PvcInfo};
use crate::rsync::ProgressSink;
use crate::types::Request;

/// Prefix of every release name.
pub const RELEASE_PREFIX: &str = "pv-migrate";

/// A chart release created on some cluster.
#[derive(Debug, Clone)]
pub struct ReleaseRecord {
    /// Release name.
    pub name: String,
    /// Release namespace.
    pub namespace: String,
    /// Cluster the release was installed on.
    pub client: Arc<ClusterClient>,
    /// Attempt that created the release.
    pub attempt_id: String,
}

/// Releases that may still exist, shared with the signal handler.
#[derive(Debug, Clone, Default)]
pub struct ReleaseRegistry {
    records: Arc<Mutex<Vec<ReleaseRecord>>>,
}

impl ReleaseRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a release.
    pub fn record(&self, record: ReleaseRecord) {
        self.records.lock().push(record);
    }

    /// Forgets a release.
    pub fn remove(&self, name: &str, namespace: &str) {
        self.records
            .lock()
            .retain(|r| !(r.name == name && r.namespace == namespace));
    }

    /// Copies out the recorded releases.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ReleaseRecord> {
        self.records.lock().clone()
    }

    /// Releases created by one attempt.
    #[must_use]
    pub fn for_attempt(&self, attempt_id: &str) -> Vec<ReleaseRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.attempt_id == attempt_id)
            .cloned()
            .collect()
    }

    /// Number of recorded releases.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// True when nothing is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Uninstalls the given releases, best-effort.
    ///
    /// Failures are logged; a release is forgotten only once it is gone.
    pub async fn uninstall(
        &self,
        records: Vec<ReleaseRecord>,
        helm_binary: &Path,
        timeout: Duration,
    ) {
        for record in records {
            let result = helm::uninstall(
                helm_binary,
                &record.client,
                &record.namespace,
                &record.name,
                timeout,
            )
            .await;
            match result {
                Ok(()) => self.remove(&record.name, &record.namespace),
                Err(e) => warn!(
                    release = %record.name,
                    namespace = %record.namespace,
                    error = %e,
                    "failed to clean up release"
                ),
            }
        }
    }

    /// Uninstalls every recorded release.
    pub async fn uninstall_all(&self, helm_binary: &Path, timeout: Duration) {
        self.uninstall(self.snapshot(), helm_binary, timeout).await;
    }
}

/// Everything a strategy needs for one migration.
#[derive(Debug)]
pub struct Migration {
    /// Source claim.
    pub source: PvcInfo,
    /// Destination claim.
    pub dest: PvcInfo,
    /// The caller's request.
    pub request: Request,
    /// Unpacked chart.
    pub chart: Chart,
    /// Live releases.
    pub releases: ReleaseRegistry,
    /// Root cancellation token.
    pub cancel: CancellationToken,
}

impl Migration {
    /// Assembles a migration from classified claims.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the chart cannot be unpacked.
    pub fn new(
        source: PvcInfo,
        dest: PvcInfo,
        request: Request,
        cancel: CancellationToken,
    ) -> MigrateResult<Self> {
        Ok(Self {
            source,
            dest,
            request,
            chart: Chart::materialize()?,
            releases: ReleaseRegistry::new(),
            cancel,
        })
    }

    /// True when both claims live on the same API server.
    #[must_use]
    pub fn same_cluster(&self) -> bool {
        self.source.client().same_cluster(self.dest.client())
    }
}

/// One strategy try.
#[derive(Debug)]
pub struct Attempt<'a> {
    id: String,
    release_prefix: String,
    migration: &'a Migration,
}

impl<'a> Attempt<'a> {
    /// Creates an attempt with a fresh id and release prefix.
    #[must_use]
    pub fn new(migration: &'a Migration) -> Self {
        let id = new_attempt_id();
        let release_prefix = format!("{RELEASE_PREFIX}-{id}");
        Self {
            id,
            release_prefix,
            migration,
        }
    }

    /// Five lowercase hex characters.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// `pv-migrate-<id>`.
    #[must_use]
    pub fn release_prefix(&self) -> &str {
        &self.release_prefix
    }

    /// The migration this attempt belongs to.
    #[must_use]
    pub const fn migration(&self) -> &'a Migration {
        self.migration
    }

    /// The caller's request.
    #[must_use]
    pub const fn request(&self) -> &'a Request {
        &self.migration.request
    }

    /// Root cancellation token.
    #[must_use]
    pub const fn cancel(&self) -> &'a CancellationToken {
        &self.migration.cancel
    }

    /// Progress sink configured from the request.
    #[must_use]
    pub fn progress_sink(&self) -> ProgressSink {
        let request = self.request();
        ProgressSink::new(request.progress_bar_enabled(), request.progress_output)
    }

    /// Installs a release and records it for cleanup.
    ///
    /// The release is recorded before helm runs, so a half-applied install is still
    /// cleaned up.
    ///
    /// # Errors
    ///
    /// Returns [`crate::MigrateError::Install`] if helm fails.
    pub async fn install(
        &self,
        client: &Arc<ClusterClient>,
        namespace: &str,
        release: &str,
        values: &Value,
    ) -> MigrateResult<()> {
        self.migration.releases.record(ReleaseRecord {
            name: release.to_string(),
            namespace: namespace.to_string(),
            client: Arc::clone(client),
            attempt_id: self.id.clone(),
        });
        helm::install(&InstallRequest {
            binary: &self.request().helm_binary,
            client,
            chart: &self.migration.chart,
            namespace,
            release,
            attempt_id: &self.id,
            values,
            overlays: &self.request().helm,
            timeout: self.request().helm_timeout,
        })
        .await
    }

    /// Uninstalls every release this attempt recorded, unless cleanup is skipped.
    pub async fn cleanup(&self) {
        let records = self.migration.releases.for_attempt(&self.id);
        if records.is_empty() {
            return;
        }
        if self.request().skip_cleanup {
            let names: Vec<&str> = records.iter().map(|r| r.name.as_str()).collect();
            info!(releases = ?names, "skipping cleanup, releases left installed");
            return;
        }
        info!(count = records.len(), "cleaning up releases");
        let request = self.request();
        self.migration
            .releases
            .uninstall(records, &request.helm_binary, request.helm_timeout)
            .await;
    }
}

fn new_attempt_id() -> String {
    let n: u32 = rand::thread_rng().gen_range(0..0x10_0000);
    format!("{n:05x}")
}
