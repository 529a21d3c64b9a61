//! Persistent volume claim classification.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::api::{Api, ListParams};
use serde_json::{Value, json};
use tracing::debug;

use super::client::ClusterClient;
use crate::error::{MigrateError, MigrateResult};

const READ_WRITE_ONCE: &str = "ReadWriteOnce";
const READ_ONLY_MANY: &str = "ReadOnlyMany";
const READ_WRITE_MANY: &str = "ReadWriteMany";
const READ_WRITE_ONCE_POD: &str = "ReadWriteOncePod";

/// Weight given to the preferred node affinity term.
pub const PREFERRED_AFFINITY_WEIGHT: i32 = 100;

/// Scheduling hint for migration pods that mount a claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AffinityHint {
    /// The pod must run on this node.
    Required(String),
    /// The pod should run on this node.
    Preferred(String),
}

impl AffinityHint {
    /// Renders the hint as a pod `affinity` values tree.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Required(node) => json!({
                "nodeAffinity": {
                    "requiredDuringSchedulingIgnoredDuringExecution": {
                        "nodeSelectorTerms": [{ "matchFields": [node_match(node)] }]
                    }
                }
            }),
            Self::Preferred(node) => json!({
                "nodeAffinity": {
                    "preferredDuringSchedulingIgnoredDuringExecution": [{
                        "weight": PREFERRED_AFFINITY_WEIGHT,
                        "preference": { "matchFields": [node_match(node)] }
                    }]
                }
            }),
        }
    }
}

fn node_match(node: &str) -> Value {
    json!({ "key": "metadata.name", "operator": "In", "values": [node] })
}

/// A classified claim.
#[derive(Debug, Clone)]
pub struct PvcInfo {
    client: Arc<ClusterClient>,
    claim: PersistentVolumeClaim,
    namespace: String,
    name: String,
    mounted_node: Option<String>,
    supports_rwo: bool,
    supports_rox: bool,
    supports_rwx: bool,
    affinity: Option<AffinityHint>,
}

impl PvcInfo {
    /// Classifies a claim from the fetched claim and the pods of its namespace.
    ///
    /// The first pod (in list order) scheduled on a node and referencing the claim
    /// decides the mounting node. `ReadWriteOncePod` counts as read-write-once.
    ///
    /// # Errors
    ///
    /// Returns [`MigrateError::Unsupported`] if the claim is `ReadWriteOncePod` and
    /// already mounted.
    pub fn from_parts(
        client: Arc<ClusterClient>,
        claim: PersistentVolumeClaim,
        pods: &[Pod],
    ) -> MigrateResult<Self> {
        let name = claim.metadata.name.clone().unwrap_or_default();
        let namespace = claim
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| client.default_namespace().to_string());

        let modes: Vec<&str> = claim
            .spec
            .as_ref()
            .and_then(|s| s.access_modes.as_ref())
            .map(|m| m.iter().map(String::as_str).collect())
            .unwrap_or_default();
        let rwop = modes.contains(&READ_WRITE_ONCE_POD);
        let supports_rwo = rwop || modes.contains(&READ_WRITE_ONCE);
        let supports_rox = modes.contains(&READ_ONLY_MANY);
        let supports_rwx = modes.contains(&READ_WRITE_MANY);

        let mounted_node = find_mounted_node(&name, pods);

        if rwop {
            if let Some(node) = &mounted_node {
                return Err(MigrateError::Unsupported {
                    namespace,
                    name,
                    reason: format!("ReadWriteOncePod claim is already mounted on node {node}"),
                });
            }
        }

        let affinity = affinity_hint(mounted_node.as_deref(), supports_rox, supports_rwx);

        Ok(Self {
            client,
            claim,
            namespace,
            name,
            mounted_node,
            supports_rwo,
            supports_rox,
            supports_rwx,
            affinity,
        })
    }

    /// Cluster the claim lives on.
    #[must_use]
    pub fn client(&self) -> &Arc<ClusterClient> {
        &self.client
    }

    /// The fetched claim.
    #[must_use]
    pub const fn claim(&self) -> &PersistentVolumeClaim {
        &self.claim
    }

    /// Claim namespace.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Claim name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Node of the first pod mounting the claim.
    #[must_use]
    pub fn mounted_node(&self) -> Option<&str> {
        self.mounted_node.as_deref()
    }

    /// Supports `ReadWriteOnce` (or `ReadWriteOncePod`).
    #[must_use]
    pub const fn supports_rwo(&self) -> bool {
        self.supports_rwo
    }

    /// Supports `ReadOnlyMany`.
    #[must_use]
    pub const fn supports_rox(&self) -> bool {
        self.supports_rox
    }

    /// Supports `ReadWriteMany`.
    #[must_use]
    pub const fn supports_rwx(&self) -> bool {
        self.supports_rwx
    }

    /// True when the claim can only be attached on one node at a time.
    #[must_use]
    pub const fn is_node_bound(&self) -> bool {
        !self.supports_rox && !self.supports_rwx
    }

    /// Scheduling hint for pods mounting this claim.
    #[must_use]
    pub const fn affinity(&self) -> Option<&AffinityHint> {
        self.affinity.as_ref()
    }

    /// Affinity rendered as chart values, `null` when there is none.
    #[must_use]
    pub fn affinity_value(&self) -> Value {
        self.affinity.as_ref().map_or(Value::Null, AffinityHint::to_value)
    }
}

/// Returns the affinity hint for a claim with the given mount state and access modes.
#[must_use]
pub fn affinity_hint(
    mounted_node: Option<&str>,
    supports_rox: bool,
    supports_rwx: bool,
) -> Option<AffinityHint> {
    let node = mounted_node?.to_string();
    if supports_rox || supports_rwx {
        Some(AffinityHint::Preferred(node))
    } else {
        Some(AffinityHint::Required(node))
    }
}

fn find_mounted_node(claim_name: &str, pods: &[Pod]) -> Option<String> {
    pods.iter().find_map(|pod| {
        let spec = pod.spec.as_ref()?;
        let node = spec.node_name.as_deref().filter(|n| !n.is_empty())?;
        let mounts_claim = spec.volumes.iter().flatten().any(|v| {
            v.persistent_volume_claim
                .as_ref()
                .is_some_and(|c| c.claim_name == claim_name)
        });
        mounts_claim.then(|| node.to_string())
    })
}

/// Fetches and classifies a claim.
///
/// # Errors
///
/// Returns [`MigrateError::NotFound`] if the claim does not exist,
/// [`MigrateError::Unsupported`] for a mounted `ReadWriteOncePod` claim, or an API error.
pub async fn classify(
    client: Arc<ClusterClient>,
    namespace: &str,
    name: &str,
) -> MigrateResult<PvcInfo> {
    let claims: Api<PersistentVolumeClaim> = Api::namespaced(client.client(), namespace);
    let claim = claims
        .get_opt(name)
        .await?
        .ok_or_else(|| MigrateError::not_found(namespace, name))?;

    let pods: Api<Pod> = Api::namespaced(client.client(), namespace);
    let pods = pods.list(&ListParams::default()).await?;

    let info = PvcInfo::from_parts(client, claim, &pods.items)?;
    debug!(
        namespace,
        pvc = name,
        node = ?info.mounted_node(),
        rwo = info.supports_rwo(),
        rox = info.supports_rox(),
        rwx = info.supports_rwx(),
        "classified pvc"
    );
    Ok(info)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use k8s_openapi::api::core::v1::{
        PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, PodSpec, Volume,
    };
    use kube::api::ObjectMeta;

    pub(crate) fn claim(namespace: &str, name: &str, modes: &[&str]) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..ObjectMeta::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(modes.iter().map(ToString::to_string).collect()),
                ..PersistentVolumeClaimSpec::default()
            }),
            ..PersistentVolumeClaim::default()
        }
    }

    pub(crate) fn pod_mounting(claim_name: &str, node: Option<&str>) -> Pod {
        Pod {
            spec: Some(PodSpec {
                node_name: node.map(ToString::to_string),
                volumes: Some(vec![Volume {
                    name: "data".to_string(),
                    persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                        claim_name: claim_name.to_string(),
                        read_only: None,
                    }),
                    ..Volume::default()
                }]),
                ..PodSpec::default()
            }),
            ..Pod::default()
        }
    }

    pub(crate) fn info(
        client: &Arc<ClusterClient>,
        namespace: &str,
        name: &str,
        modes: &[&str],
        node: Option<&str>,
    ) -> PvcInfo {
        let pods: Vec<Pod> = node.map(|n| pod_mounting(name, Some(n))).into_iter().collect();
        PvcInfo::from_parts(Arc::clone(client), claim(namespace, name, modes), &pods)
            .expect("classify")
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::k8s::client::test_support::offline_client;

    fn client() -> Arc<ClusterClient> {
        Arc::new(offline_client("http://127.0.0.1:1", None, None))
    }

    mod classification {
        use super::*;

        #[tokio::test]
        async fn access_modes_are_detected() {
            let info = info(&client(), "ns1", "data", &["ReadWriteOnce", "ReadOnlyMany"], None);
            assert!(info.supports_rwo());
            assert!(info.supports_rox());
            assert!(!info.supports_rwx());
            assert_eq!(info.namespace(), "ns1");
            assert_eq!(info.name(), "data");
        }

        #[tokio::test]
        async fn read_write_once_pod_counts_as_rwo() {
            let info = info(&client(), "ns1", "data", &["ReadWriteOncePod"], None);
            assert!(info.supports_rwo());
            assert!(info.is_node_bound());
        }

        #[tokio::test]
        async fn mounted_rwop_is_unsupported() {
            let pods = vec![pod_mounting("data", Some("node-a"))];
            let result = PvcInfo::from_parts(
                client(),
                claim("ns1", "data", &["ReadWriteOncePod"]),
                &pods,
            );
            assert!(matches!(result, Err(MigrateError::Unsupported { .. })));
        }

        #[tokio::test]
        async fn first_mounting_pod_wins() {
            let pods = vec![
                pod_mounting("other", Some("node-x")),
                pod_mounting("data", None),
                pod_mounting("data", Some("node-a")),
                pod_mounting("data", Some("node-b")),
            ];
            let info =
                PvcInfo::from_parts(client(), claim("ns1", "data", &["ReadWriteOnce"]), &pods)
                    .expect("classify");
            assert_eq!(info.mounted_node(), Some("node-a"));
        }

        #[tokio::test]
        async fn unmounted_claim_has_no_affinity() {
            let info = info(&client(), "ns1", "data", &["ReadWriteOnce"], None);
            assert_eq!(info.mounted_node(), None);
            assert!(info.affinity().is_none());
            assert_eq!(info.affinity_value(), Value::Null);
        }
    }

    mod affinity {
        use super::*;
        use test_case::test_case;

        #[test_case(Some("n1"), false, false, Some(AffinityHint::Required("n1".into())) ; "rwo mounted")]
        #[test_case(Some("n1"), true, false, Some(AffinityHint::Preferred("n1".into())) ; "rox mounted")]
        #[test_case(Some("n1"), false, true, Some(AffinityHint::Preferred("n1".into())) ; "rwx mounted")]
        #[test_case(Some("n1"), true, true, Some(AffinityHint::Preferred("n1".into())) ; "rox rwx mounted")]
        #[test_case(None, false, false, None ; "unmounted rwo")]
        #[test_case(None, true, true, None ; "unmounted rwx")]
        fn hint_matrix(node: Option<&str>, rox: bool, rwx: bool, expected: Option<AffinityHint>) {
            assert_eq!(affinity_hint(node, rox, rwx), expected);
        }

        #[test]
        fn required_renders_node_selector_terms() {
            let value = AffinityHint::Required("worker-1".into()).to_value();
            let term = &value["nodeAffinity"]["requiredDuringSchedulingIgnoredDuringExecution"]
                ["nodeSelectorTerms"][0]["matchFields"][0];
            assert_eq!(term["key"], "metadata.name");
            assert_eq!(term["operator"], "In");
            assert_eq!(term["values"][0], "worker-1");
        }

        #[test]
        fn preferred_renders_weighted_preference() {
            let value = AffinityHint::Preferred("worker-2".into()).to_value();
            let pref = &value["nodeAffinity"]["preferredDuringSchedulingIgnoredDuringExecution"][0];
            assert_eq!(pref["weight"], 100);
            assert_eq!(pref["preference"]["matchFields"][0]["values"][0], "worker-2");
        }
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn affinity_rule_holds(
                node in proptest::option::of("[a-z][a-z0-9-]{0,12}"),
                rox: bool,
                rwx: bool,
            ) {
                let hint = affinity_hint(node.as_deref(), rox, rwx);
                let required = matches!(hint, Some(AffinityHint::Required(_)));
                let preferred = matches!(hint, Some(AffinityHint::Preferred(_)));
                prop_assert_eq!(required, node.is_some() && !rox && !rwx);
                prop_assert_eq!(preferred, node.is_some() && (rox || rwx));
                prop_assert_eq!(hint.is_none(), node.is_none());
            }
        }
    }
}
