//! Same-cluster migration over the sshd service's cluster DNS name.

use serde_json::{Value, json};
use tracing::info;

use super::{base_rsync_command, dest_rsync_values, job_name, remote_host, source_sshd_values, sshd_service_name};
use crate::error::{MigrateError, MigrateResult};
use crate::k8s::service::cluster_dns_name;
use crate::k8s::wait_for_job;
use crate::migration::{Attempt, Migration};
use crate::ssh::{self, KeyPair};

/// Builds the values of the single release carrying both sides.
fn values(migration: &Migration, release: &str, keys: &KeyPair) -> MigrateResult<Value> {
    let request = &migration.request;
    let discovered = cluster_dns_name(&sshd_service_name(release), migration.source.namespace());
    let host = remote_host(request, discovered);
    let command = base_rsync_command(request).with_ssh_source(host.clone()).build()?;

    Ok(json!({
        "sshd": source_sshd_values(&migration.source, request, keys, "ClusterIP"),
        "rsync": dest_rsync_values(&migration.dest, keys, &host, &command),
    }))
}

pub(super) async fn run(attempt: &Attempt<'_>) -> MigrateResult<()> {
    let migration = attempt.migration();
    if !migration.same_cluster() {
        return Err(MigrateError::Unaccepted);
    }

    let dest = &migration.dest;
    let keys = ssh::generate(attempt.request().key_algorithm)?;
    let release = attempt.release_prefix();
    let values = values(migration, release, &keys)?;

    info!(release, "installing sshd and rsync over cluster dns");
    attempt
        .install(dest.client(), dest.namespace(), release, &values)
        .await?;

    wait_for_job(
        dest.client(),
        dest.namespace(),
        &job_name(release),
        attempt.progress_sink(),
        attempt.cancel(),
    )
    .await
}
