//! Pod lookups shared by the job waiter and the address acquirers.

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};

use super::client::ClusterClient;
use crate::error::MigrateResult;

/// Component label carried by chart pods.
pub const COMPONENT_LABEL: &str = "app.kubernetes.io/component";
/// Instance label carried by chart pods; its value is the release name.
pub const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";
/// Component label value of sshd pods.
pub const SSHD_COMPONENT: &str = "sshd";

/// Label selector matching the sshd pod of a release.
#[must_use]
pub fn sshd_selector(release: &str) -> String {
    format!("{COMPONENT_LABEL}={SSHD_COMPONENT},{INSTANCE_LABEL}={release}")
}

/// Label selector matching the pods of a job.
#[must_use]
pub fn job_selector(job_name: &str) -> String {
    format!("job-name={job_name}")
}

/// The pod's phase, if reported.
#[must_use]
pub fn phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref()?.phase.as_deref()
}

/// True when the pod has started running and its logs can be followed.
#[must_use]
pub fn is_tailable(pod: &Pod) -> bool {
    phase(pod).is_some_and(|p| p != "Pending" && p != "Unknown")
}

/// True when the pod reached a terminal phase, or no longer exists.
#[must_use]
pub fn is_finished(pod: Option<&Pod>) -> bool {
    pod.is_none_or(|p| matches!(phase(p), Some("Succeeded" | "Failed")))
}

/// True when the pod succeeded.
#[must_use]
pub fn is_succeeded(pod: &Pod) -> bool {
    phase(pod) == Some("Succeeded")
}

/// Lists the sshd pods of a release.
///
/// # Errors
///
/// Returns an API error if the list call fails.
pub async fn sshd_pods(
    client: &ClusterClient,
    namespace: &str,
    release: &str,
) -> MigrateResult<Vec<Pod>> {
    let pods: Api<Pod> = Api::namespaced(client.client(), namespace);
    let list = pods
        .list(&ListParams::default().labels(&sshd_selector(release)))
        .await?;
    Ok(list.items)
}
