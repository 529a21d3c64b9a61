//! Migration through an sshd service of type `NodePort`.

use serde_json::{Value, json};
use tracing::info;

use super::{base_rsync_command, dest_rsync_values, job_name, remote_host, source_sshd_values, sshd_service_name};
use crate::error::MigrateResult;
use crate::k8s::pod::sshd_pods;
use crate::k8s::service::{
    AddressPreference, format_ssh_target_host, reachable_node_ip, wait_for_node_port,
};
use crate::k8s::wait_for_job;
use crate::migration::{Attempt, Migration};
use crate::ssh::{self, KeyPair};

fn sshd_values(migration: &Migration, keys: &KeyPair) -> Value {
    let mut sshd = source_sshd_values(&migration.source, &migration.request, keys, "NodePort");
    if let Some(port) = migration.request.node_port {
        sshd["service"]["nodePort"] = json!(port);
    }
    json!({ "sshd": sshd })
}

fn rsync_values(migration: &Migration, keys: &KeyPair, node_ip: &str, port: u16) -> MigrateResult<Value> {
    let host = remote_host(&migration.request, format_ssh_target_host(node_ip));
    let command = base_rsync_command(&migration.request)
        .with_ssh_source(host.clone())
        .with_port(port)
        .build()?;
    let mut rsync = dest_rsync_values(&migration.dest, keys, &host, &command);
    rsync["sshRemotePort"] = json!(port);
    Ok(json!({ "rsync": rsync }))
}

/// Internal addresses work inside one cluster; across clusters only external ones do.
fn address_preference(migration: &Migration) -> AddressPreference {
    if migration.same_cluster() {
        AddressPreference::Internal
    } else {
        AddressPreference::External
    }
}

pub(super) async fn run(attempt: &Attempt<'_>) -> MigrateResult<()> {
    let migration = attempt.migration();
    let (source, dest) = (&migration.source, &migration.dest);
    let request = attempt.request();

    let keys = ssh::generate(request.key_algorithm)?;
    let src_release = format!("{}-src", attempt.release_prefix());
    let dest_release = format!("{}-dest", attempt.release_prefix());

    info!(release = %src_release, node_port = ?request.node_port, "installing sshd behind a node port");
    attempt
        .install(source.client(), source.namespace(), &src_release, &sshd_values(migration, &keys))
        .await?;

    let port = wait_for_node_port(
        source.client(),
        source.namespace(),
        &sshd_service_name(&src_release),
        request.lb_svc_timeout,
    )
    .await?;

    let pods = sshd_pods(source.client(), source.namespace(), &src_release).await?;
    let sshd_node = pods
        .iter()
        .find_map(|p| p.spec.as_ref().and_then(|s| s.node_name.clone()));
    let node_ip =
        reachable_node_ip(source.client(), sshd_node.as_deref(), address_preference(migration)).await?;

    info!(release = %dest_release, %node_ip, port, "installing rsync job");
    attempt
        .install(
            dest.client(),
            dest.namespace(),
            &dest_release,
            &rsync_values(migration, &keys, &node_ip, port)?,
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
