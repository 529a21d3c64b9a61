//! Migration through an sshd service of type `LoadBalancer`.

use serde_json::{Value, json};
use tracing::info;

use super::{base_rsync_command, dest_rsync_values, job_name, remote_host, source_sshd_values, sshd_service_name};
use crate::error::MigrateResult;
use crate::k8s::service::{format_ssh_target_host, wait_for_load_balancer_address};
use crate::k8s::wait_for_job;
use crate::migration::{Attempt, Migration};
use crate::ssh::{self, KeyPair};

fn sshd_values(migration: &Migration, keys: &KeyPair) -> Value {
    json!({ "sshd": source_sshd_values(&migration.source, &migration.request, keys, "LoadBalancer") })
}

fn rsync_values(migration: &Migration, keys: &KeyPair, address: &str) -> MigrateResult<Value> {
    let host = remote_host(&migration.request, format_ssh_target_host(address));
    let command = base_rsync_command(&migration.request)
        .with_ssh_source(host.clone())
        .build()?;
    Ok(json!({ "rsync": dest_rsync_values(&migration.dest, keys, &host, &command) }))
}

pub(super) async fn run(attempt: &Attempt<'_>) -> MigrateResult<()> {
    let migration = attempt.migration();
    let (source, dest) = (&migration.source, &migration.dest);
    let request = attempt.request();

    let keys = ssh::generate(request.key_algorithm)?;
    let src_release = format!("{}-src", attempt.release_prefix());
    let dest_release = format!("{}-dest", attempt.release_prefix());

    info!(release = %src_release, "installing sshd behind a load balancer");
    attempt
        .install(source.client(), source.namespace(), &src_release, &sshd_values(migration, &keys))
        .await?;

    let address = wait_for_load_balancer_address(
        source.client(),
        source.namespace(),
        &sshd_service_name(&src_release),
        request.lb_svc_timeout,
    )
    .await?;

    info!(release = %dest_release, %address, "installing rsync job");
    attempt
        .install(
            dest.client(),
            dest.namespace(),
            &dest_release,
            &rsync_values(migration, &keys, &address)?,
        )
        .await?;

    wait_for_job(
        dest.client(),
        dest.namespace(),
        &job_name(&dest_release),
        attempt.progress_sink(),
        attempt.cancel(),
    )
    .await
}
