//! Single-pod migration with both claims mounted.

use serde_json::{Value, json};
use tracing::info;

use super::{DEST_MOUNT_PATH, SOURCE_MOUNT_PATH, base_rsync_command, job_name, pvc_mount};
use crate::error::{MigrateError, MigrateResult};
use crate::k8s::{PvcInfo, wait_for_job};
use crate::migration::Attempt;

/// True when one pod can mount both claims at once.
pub(crate) fn accepts(source: &PvcInfo, dest: &PvcInfo) -> bool {
    if !source.client().same_cluster(dest.client()) || source.namespace() != dest.namespace() {
        return false;
    }
    let same_node = source.mounted_node() == dest.mounted_node();
    same_node
        || source.mounted_node().is_none()
        || dest.mounted_node().is_none()
        || source.supports_rox()
        || source.supports_rwx()
        || dest.supports_rwx()
}

/// Node the pod must run on, if any.
///
/// A mounted claim that only attaches to one node wins, source first; otherwise any
/// mounted side.
pub(crate) fn pinned_node(source: &PvcInfo, dest: &PvcInfo) -> Option<String> {
    fn bound(pvc: &PvcInfo) -> Option<&str> {
        pvc.is_node_bound().then(|| pvc.mounted_node()).flatten()
    }

    bound(source)
        .or_else(|| bound(dest))
        .or_else(|| source.mounted_node())
        .or_else(|| dest.mounted_node())
        .map(ToString::to_string)
}

fn values(source: &PvcInfo, dest: &PvcInfo, read_only: bool, command: &str) -> Value {
    json!({
        "rsync": {
            "enabled": true,
            "namespace": dest.namespace(),
            "nodeName": pinned_node(source, dest),
            "command": command,
            "pvcMounts": [
                pvc_mount(source.name(), SOURCE_MOUNT_PATH, read_only),
                pvc_mount(dest.name(), DEST_MOUNT_PATH, false),
            ],
        }
    })
}

pub(super) async fn run(attempt: &Attempt<'_>) -> MigrateResult<()> {
    let migration = attempt.migration();
    let (source, dest) = (&migration.source, &migration.dest);
    if !accepts(source, dest) {
        return Err(MigrateError::Unaccepted);
    }

    let request = attempt.request();
    let command = base_rsync_command(request).build()?;
    let release = attempt.release_prefix();
    let values = values(source, dest, request.source_mount_read_only, &command);

    info!(release, node = ?pinned_node(source, dest), "installing rsync job mounting both claims");
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::test_support::{Side, migration};

    const RWO: &[&str] = &["ReadWriteOnce"];
    const ROX: &[&str] = &["ReadOnlyMany"];
    const RWX: &[&str] = &["ReadWriteMany"];

    fn side<'a>(modes: &'a [&'a str], node: Option<&'a str>) -> Side<'a> {
        Side {
            modes,
            node,
            ..Side::default()
        }
    }

    mod acceptance {
        use super::*;
        use test_case::test_case;

        #[test_case(RWO, None, RWO, None, true ; "both unmounted")]
        #[test_case(RWO, Some("n1"), RWO, Some("n1"), true ; "same node")]
        #[test_case(RWO, Some("n1"), RWO, None, true ; "dest unmounted")]
        #[test_case(RWO, None, RWO, Some("n2"), true ; "source unmounted")]
        #[test_case(RWO, Some("n1"), RWO, Some("n2"), false ; "rwo on different nodes")]
        #[test_case(ROX, Some("n1"), RWO, Some("n2"), true ; "source rox")]
        #[test_case(RWX, Some("n1"), RWO, Some("n2"), true ; "source rwx")]
        #[test_case(RWO, Some("n1"), RWX, Some("n2"), true ; "dest rwx")]
        #[test_case(RWO, Some("n1"), ROX, Some("n2"), false ; "dest rox does not help")]
        #[tokio::test]
        async fn node_matrix(
            src_modes: &[&str],
            src_node: Option<&str>,
            dest_modes: &[&str],
            dest_node: Option<&str>,
            expected: bool,
        ) {
            let m = migration(&side(src_modes, src_node), &side(dest_modes, dest_node));
            assert_eq!(accepts(&m.source, &m.dest), expected);
        }

        #[tokio::test]
        async fn different_namespaces_are_rejected() {
            let dest = Side {
                namespace: "ns2",
                ..Side::default()
            };
            let m = migration(&Side::default(), &dest);
            assert!(!accepts(&m.source, &m.dest));
        }

        #[tokio::test]
        async fn different_clusters_are_rejected() {
            let dest = Side {
                url: "http://127.0.0.1:2",
                ..Side::default()
            };
            let m = migration(&Side::default(), &dest);
            assert!(!accepts(&m.source, &m.dest));
        }

        #[tokio::test]
        async fn unaccepted_migration_installs_nothing() {
            let m = migration(&side(RWO, Some("n1")), &side(RWO, Some("n2")));
            let attempt = Attempt::new(&m);
            let result = run(&attempt).await;
            assert!(matches!(result, Err(MigrateError::Unaccepted)));
            assert!(m.releases.is_empty());
        }
    }

    mod pinning {
        use super::*;
        use test_case::test_case;

        #[test_case(RWO, Some("n1"), RWO, Some("n2"), Some("n1") ; "bound source wins")]
        #[test_case(RWX, Some("n1"), RWO, Some("n2"), Some("n2") ; "bound dest beats shared source")]
        #[test_case(RWX, Some("n1"), RWX, Some("n2"), Some("n1") ; "mounted source")]
        #[test_case(RWX, None, RWX, Some("n2"), Some("n2") ; "mounted dest")]
        #[test_case(RWO, None, RWO, None, None ; "nothing mounted")]
        #[tokio::test]
        async fn node_choice(
            src_modes: &[&str],
            src_node: Option<&str>,
            dest_modes: &[&str],
            dest_node: Option<&str>,
            expected: Option<&str>,
        ) {
            let m = migration(&side(src_modes, src_node), &side(dest_modes, dest_node));
            assert_eq!(pinned_node(&m.source, &m.dest).as_deref(), expected);
        }
    }

    #[tokio::test]
    async fn values_mount_both_claims() {
        let m = migration(&side(RWO, Some("n1")), &side(RWO, None));
        let v = values(&m.source, &m.dest, true, "rsync -av /source// /dest//");
        let rsync = &v["rsync"];
        assert_eq!(rsync["enabled"], true);
        assert_eq!(rsync["nodeName"], "n1");
        assert_eq!(rsync["namespace"], "ns1");
        assert_eq!(rsync["pvcMounts"][0]["name"], "source");
        assert_eq!(rsync["pvcMounts"][0]["mountPath"], "/source");
        assert_eq!(rsync["pvcMounts"][0]["readOnly"], true);
        assert_eq!(rsync["pvcMounts"][1]["name"], "dest");
        assert_eq!(rsync["pvcMounts"][1]["readOnly"], false);
        assert!(v.get("sshd").is_none());
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        fn modes() -> impl Strategy<Value = &'static [&'static str]> {
            prop_oneof![Just(RWO), Just(ROX), Just(RWX)]
        }

        proptest! {
            #[test]
            fn acceptance_rule(
                src_modes in modes(),
                dest_modes in modes(),
                src_node in proptest::option::of(prop_oneof![Just("n1"), Just("n2")]),
                dest_node in proptest::option::of(prop_oneof![Just("n1"), Just("n2")]),
                same_ns: bool,
            ) {
                let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().expect("runtime");
                let _guard = rt.enter();
                let dest_ns = if same_ns { "ns1" } else { "ns2" };
                let m = migration(
                    &side(src_modes, src_node),
                    &Side { namespace: dest_ns, ..side(dest_modes, dest_node) },
                );
                let expected = same_ns
                    && (src_node == dest_node
                        || src_node.is_none()
                        || dest_node.is_none()
                        || src_modes == ROX
                        || src_modes == RWX
                        || dest_modes == RWX);
                prop_assert_eq!(accepts(&m.source, &m.dest), expected);
            }
        }
    }
}
