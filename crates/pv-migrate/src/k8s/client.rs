//! Cluster client resolution.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::debug;

use crate::error::{MigrateError, MigrateResult};

/// The kubeconfig file and context a client resolves to once defaults are applied.
///
/// A missing path becomes the first `KUBECONFIG` entry, then `~/.kube/config` if it
/// exists. A missing context becomes that file's current context. Existing paths are
/// canonicalized.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientIdentity {
    /// Kubeconfig file, `None` for in-cluster configuration.
    pub kubeconfig: Option<PathBuf>,
    /// Context name.
    pub context: Option<String>,
}

impl ClientIdentity {
    /// Resolves against the process environment.
    #[must_use]
    pub fn resolve(kubeconfig: Option<&Path>, context: Option<&str>) -> Self {
        Self::resolve_in(
            kubeconfig,
            context,
            std::env::var_os("KUBECONFIG"),
            std::env::var_os("HOME").map(PathBuf::from),
        )
    }

    fn resolve_in(
        kubeconfig: Option<&Path>,
        context: Option<&str>,
        kubeconfig_env: Option<OsString>,
        home: Option<PathBuf>,
    ) -> Self {
        let path = kubeconfig
            .map(Path::to_path_buf)
            .or_else(|| {
                let env = kubeconfig_env?;
                std::env::split_paths(&env).find(|p| !p.as_os_str().is_empty())
            })
            .or_else(|| {
                home.map(|h| h.join(".kube").join("config"))
                    .filter(|p| p.is_file())
            })
            .map(|p| std::fs::canonicalize(&p).unwrap_or(p));
        let context = context
            .map(ToString::to_string)
            .or_else(|| path.as_deref().and_then(current_context));
        Self {
            kubeconfig: path,
            context,
        }
    }
}

fn current_context(path: &Path) -> Option<String> {
    Kubeconfig::read_from(path)
        .ok()?
        .current_context
        .filter(|c| !c.is_empty())
}

/// A typed Kubernetes client plus the kubeconfig coordinates it was built from.
///
/// Two clients compare equal iff they resolve to the same [`ClientIdentity`], so an
/// omitted kubeconfig or context equals the default it stands for.
/// [`ClusterClient::same_cluster`] answers the looser question of whether both point
/// at the same API server.
#[derive(Clone)]
pub struct ClusterClient {
    client: Client,
    kubeconfig: Option<PathBuf>,
    context: Option<String>,
    identity: ClientIdentity,
    cluster_url: String,
    default_namespace: String,
}

impl ClusterClient {
    /// Builds a client from an already-resolved REST config.
    ///
    /// # Errors
    ///
    /// Returns [`MigrateError::Kube`] if the HTTP client cannot be constructed.
    pub fn from_config(
        config: Config,
        kubeconfig: Option<PathBuf>,
        context: Option<String>,
    ) -> MigrateResult<Self> {
        let cluster_url = config.cluster_url.to_string();
        let default_namespace = config.default_namespace.clone();
        let client = Client::try_from(config)?;
        let identity = ClientIdentity::resolve(kubeconfig.as_deref(), context.as_deref());
        Ok(Self {
            client,
            kubeconfig,
            context,
            identity,
            cluster_url,
            default_namespace,
        })
    }

    /// The typed API handle.
    #[must_use]
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Kubeconfig path the client was loaded from, if one was given explicitly.
    #[must_use]
    pub fn kubeconfig(&self) -> Option<&Path> {
        self.kubeconfig.as_deref()
    }

    /// Context the client was loaded with, if one was given explicitly.
    #[must_use]
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Kubeconfig and context with defaults applied.
    #[must_use]
    pub const fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    /// API server URL.
    #[must_use]
    pub fn cluster_url(&self) -> &str {
        &self.cluster_url
    }

    /// Namespace selected by the kubeconfig context.
    #[must_use]
    pub fn default_namespace(&self) -> &str {
        &self.default_namespace
    }

    /// Returns true when both clients talk to the same API server.
    #[must_use]
    pub fn same_cluster(&self, other: &Self) -> bool {
        self.cluster_url == other.cluster_url
    }

    /// Arguments that point the `helm` binary at the same cluster.
    #[must_use]
    pub fn helm_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(path) = &self.kubeconfig {
            args.push("--kubeconfig".to_string());
            args.push(path.display().to_string());
        }
        if let Some(context) = &self.context {
            args.push("--kube-context".to_string());
            args.push(context.clone());
        }
        args
    }
}

impl PartialEq for ClusterClient {
    fn eq(&self, other: &Self) -> bool {
        self.identity == other.identity
    }
}

impl Eq for ClusterClient {}

impl fmt::Debug for ClusterClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterClient")
            .field("kubeconfig", &self.kubeconfig)
            .field("context", &self.context)
            .field("identity", &self.identity)
            .field("cluster_url", &self.cluster_url)
            .field("default_namespace", &self.default_namespace)
            .finish_non_exhaustive()
    }
}

/// Loads a client for the given kubeconfig and context.
///
/// A missing path falls back to `KUBECONFIG` and then `~/.kube/config`; with neither a
/// path nor a context, in-cluster configuration is also tried. A missing context uses
/// the kubeconfig's current context.
///
/// # Errors
///
/// Returns [`MigrateError::Config`] if no kubeconfig can be loaded or the context does
/// not exist.
pub async fn get_client(
    kubeconfig: Option<&Path>,
    context: Option<&str>,
) -> MigrateResult<ClusterClient> {
    let config = match (kubeconfig, context) {
        (None, None) => Config::infer()
            .await
            .map_err(|e| MigrateError::Config(e.to_string()))?,
        _ => {
            let raw = match kubeconfig {
                Some(path) => Kubeconfig::read_from(path).map_err(|e| {
                    MigrateError::Config(format!("failed to read {}: {e}", path.display()))
                })?,
                None => Kubeconfig::read().map_err(|e| MigrateError::Config(e.to_string()))?,
            };
            let options = KubeConfigOptions {
                context: context.map(ToString::to_string),
                ..KubeConfigOptions::default()
            };
            Config::from_custom_kubeconfig(raw, &options)
                .await
                .map_err(|e| MigrateError::Config(e.to_string()))?
        }
    };

    debug!(
        kubeconfig = ?kubeconfig,
        context = ?context,
        cluster = %config.cluster_url,
        namespace = %config.default_namespace,
        "loaded cluster config"
    );

    ClusterClient::from_config(
        config,
        kubeconfig.map(Path::to_path_buf),
        context.map(ToString::to_string),
    )
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A client pointed at an unroutable server, for tests that never hit the API.
    pub(crate) fn offline_client(url: &str, kubeconfig: Option<&str>, context: Option<&str>) -> ClusterClient {
        let mut config = Config::new(url.parse().expect("valid url"));
        config.default_namespace = "default".to_string();
        ClusterClient::from_config(
            config,
            kubeconfig.map(PathBuf::from),
            context.map(ToString::to_string),
        )
        .expect("client")
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::offline_client;
    use super::*;
    use std::io::Write;

    const KUBECONFIG: &str = r"
apiVersion: v1
kind: Config
current-context: alpha
clusters:
- name: alpha
  cluster:
    server: https://10.0.0.1:6443
- name: beta
  cluster:
    server: https://10.0.0.2:6443
users:
- name: admin
  user:
    token: abc
contexts:
- name: alpha
  context:
    cluster: alpha
    user: admin
    namespace: team-a
- name: beta
  context:
    cluster: beta
    user: admin
";

    fn kubeconfig_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(KUBECONFIG.as_bytes()).expect("write");
        file
    }

    mod loading {
        use super::*;

        #[tokio::test]
        async fn current_context_namespace_is_default() {
            let file = kubeconfig_file();
            let client = get_client(Some(file.path()), None).await.expect("client");
            assert_eq!(client.default_namespace(), "team-a");
            assert!(client.cluster_url().starts_with("https://10.0.0.1:6443"));
        }

        #[tokio::test]
        async fn explicit_context_without_namespace_uses_default() {
            let file = kubeconfig_file();
            let client = get_client(Some(file.path()), Some("beta")).await.expect("client");
            assert_eq!(client.default_namespace(), "default");
            assert!(client.cluster_url().starts_with("https://10.0.0.2:6443"));
        }

        #[tokio::test]
        async fn missing_context_is_config_error() {
            let file = kubeconfig_file();
            let err = get_client(Some(file.path()), Some("gamma")).await.expect_err("should fail");
            assert!(matches!(err, MigrateError::Config(_)));
        }

        #[tokio::test]
        async fn missing_file_is_config_error() {
            let err = get_client(Some(Path::new("/nonexistent/kubeconfig")), None)
                .await
                .expect_err("should fail");
            assert!(matches!(err, MigrateError::Config(_)));
        }
    }

    mod identity {
        use super::*;

        #[tokio::test]
        async fn equality_follows_path_and_context() {
            let a = offline_client("http://127.0.0.1:1", Some("/k"), Some("c1"));
            let b = offline_client("http://127.0.0.1:2", Some("/k"), Some("c1"));
            let c = offline_client("http://127.0.0.1:1", Some("/k"), Some("c2"));
            assert_eq!(a, b);
            assert_ne!(a, c);
            assert!(a.same_cluster(&c));
            assert!(!a.same_cluster(&b));
        }

        #[tokio::test]
        async fn omitted_context_equals_current_context() {
            let file = kubeconfig_file();
            let implicit = get_client(Some(file.path()), None).await.expect("client");
            let explicit = get_client(Some(file.path()), Some("alpha")).await.expect("client");
            let other = get_client(Some(file.path()), Some("beta")).await.expect("client");
            assert_eq!(implicit, explicit);
            assert_ne!(implicit, other);
            assert_eq!(implicit.identity().context.as_deref(), Some("alpha"));
        }

        #[test]
        fn kubeconfig_env_stands_in_for_omitted_path() {
            let file = kubeconfig_file();
            let from_env = ClientIdentity::resolve_in(
                None,
                None,
                Some(std::env::join_paths([file.path(), Path::new("/other")]).expect("join")),
                None,
            );
            let explicit = ClientIdentity::resolve_in(Some(file.path()), None, None, None);
            assert_eq!(from_env, explicit);
            assert_eq!(from_env.context.as_deref(), Some("alpha"));
        }

        #[test]
        fn home_config_stands_in_for_omitted_path() {
            let home = tempfile::tempdir().expect("tempdir");
            let config = home.path().join(".kube").join("config");
            std::fs::create_dir_all(config.parent().expect("parent")).expect("mkdir");
            std::fs::write(&config, KUBECONFIG).expect("write");

            let implicit = ClientIdentity::resolve_in(None, None, None, Some(home.path().to_path_buf()));
            let explicit = ClientIdentity::resolve_in(Some(&config), Some("alpha"), None, None);
            assert_eq!(implicit, explicit);
        }

        #[test]
        fn missing_home_config_means_in_cluster() {
            let home = tempfile::tempdir().expect("tempdir");
            let identity = ClientIdentity::resolve_in(None, None, None, Some(home.path().to_path_buf()));
            assert_eq!(identity, ClientIdentity::default());
        }

        #[tokio::test]
        async fn helm_args_carry_explicit_coordinates() {
            let client = offline_client("http://127.0.0.1:1", Some("/tmp/kc"), Some("dev"));
            assert_eq!(
                client.helm_args(),
                vec!["--kubeconfig", "/tmp/kc", "--kube-context", "dev"]
            );
            let client = offline_client("http://127.0.0.1:1", None, None);
            assert!(client.helm_args().is_empty());
        }
    }
}
