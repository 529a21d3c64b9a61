//! Chart installation through the `helm` binary.
//!
//! The chart ships inside the library and is written to a private temporary directory
//! once per migration. Values are rendered to a 0600 YAML file and handed to helm as the
//! first `-f`, so every user overlay wins over them.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use serde_json::Value;
use tempfile::{NamedTempFile, TempDir};
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{MigrateError, MigrateResult};
use crate::k8s::ClusterClient;
use crate::types::HelmOverlays;

/// Default helm executable, looked up on `PATH`.
pub const HELM_BINARY: &str = "helm";

/// Extra time granted to the helm process beyond its own `--timeout`.
const PROCESS_GRACE: Duration = Duration::from_secs(10);

const CHART_FILES: &[(&str, &str)] = &[
    ("Chart.yaml", include_str!("../chart/Chart.yaml")),
    ("values.yaml", include_str!("../chart/values.yaml")),
    (".helmignore", include_str!("../chart/.helmignore")),
    ("templates/_helpers.tpl", include_str!("../chart/templates/_helpers.tpl")),
    ("templates/sshd/secret.yaml", include_str!("../chart/templates/sshd/secret.yaml")),
    ("templates/sshd/deployment.yaml", include_str!("../chart/templates/sshd/deployment.yaml")),
    ("templates/sshd/service.yaml", include_str!("../chart/templates/sshd/service.yaml")),
    ("templates/rsync/secret.yaml", include_str!("../chart/templates/rsync/secret.yaml")),
    ("templates/rsync/job.yaml", include_str!("../chart/templates/rsync/job.yaml")),
];

/// The bundled chart, unpacked on disk. Removed on drop.
#[derive(Debug)]
pub struct Chart {
    dir: TempDir,
}

impl Chart {
    /// Writes the bundled chart into a fresh temporary directory.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory or a file cannot be written.
    pub fn materialize() -> MigrateResult<Self> {
        let dir = tempfile::Builder::new().prefix("pv-migrate-chart-").tempdir()?;
        for (relative, contents) in CHART_FILES {
            let path = dir.path().join(relative);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, contents)?;
        }
        debug!(path = %dir.path().display(), "chart materialized");
        Ok(Self { dir })
    }

    /// Chart directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// Writes `values` as YAML into a uniquely named 0600 temp file.
///
/// # Errors
///
/// Returns an I/O or serialisation error.
pub fn write_values_file(attempt_id: &str, values: &Value) -> MigrateResult<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix(&format!("pv-migrate-vals-{attempt_id}-"))
        .suffix(".yaml")
        .tempfile()?;
    serde_yaml::to_writer(&mut file, values)?;
    std::io::Write::flush(&mut file)?;
    Ok(file)
}

fn timeout_arg(timeout: Duration) -> String {
    format!("{}s", timeout.as_secs().max(1))
}

/// Arguments for `helm install`.
#[must_use]
pub fn install_args(
    client: &ClusterClient,
    release: &str,
    namespace: &str,
    chart_dir: &Path,
    values_file: &Path,
    overlays: &HelmOverlays,
    timeout: Duration,
) -> Vec<String> {
    let mut args = vec![
        "install".to_string(),
        release.to_string(),
        chart_dir.display().to_string(),
        "--namespace".to_string(),
        namespace.to_string(),
        "--wait".to_string(),
        "--timeout".to_string(),
        timeout_arg(timeout),
    ];
    args.extend(client.helm_args());
    args.push("-f".to_string());
    args.push(values_file.display().to_string());
    for file in &overlays.values_files {
        args.push("-f".to_string());
        args.push(file.display().to_string());
    }
    let flagged = [
        ("--set", &overlays.set),
        ("--set-string", &overlays.set_string),
        ("--set-file", &overlays.set_file),
    ];
    for (flag, values) in flagged {
        for value in values {
            args.push(flag.to_string());
            args.push(value.clone());
        }
    }
    args
}

/// Arguments for `helm uninstall`.
#[must_use]
pub fn uninstall_args(
    client: &ClusterClient,
    release: &str,
    namespace: &str,
    timeout: Duration,
) -> Vec<String> {
    let mut args = vec![
        "uninstall".to_string(),
        release.to_string(),
        "--namespace".to_string(),
        namespace.to_string(),
        "--wait".to_string(),
        "--timeout".to_string(),
        timeout_arg(timeout),
    ];
    args.extend(client.helm_args());
    args
}

/// True when helm's error output says the release does not exist.
///
/// Only helm's own release lookup messages count. Other "not found" errors, such as a
/// missing kube context or namespace, mean the release may still be installed.
#[must_use]
pub fn is_release_not_found(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    stderr.contains("release: not found") || stderr.contains("release not loaded")
}

async fn run_helm(binary: &Path, args: &[String], timeout: Duration) -> Result<Output, String> {
    let mut command = Command::new(binary);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    match tokio::time::timeout(timeout + PROCESS_GRACE, command.output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(format!("failed to run {}: {e}", binary.display())),
        Err(_) => Err(format!(
            "{} did not finish within {}s",
            binary.display(),
            timeout.as_secs()
        )),
    }
}

fn failure_reason(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    if stderr.is_empty() {
        format!("helm exited with {}", output.status)
    } else {
        stderr.to_string()
    }
}

/// One chart install request.
#[derive(Debug)]
pub struct InstallRequest<'a> {
    /// Helm executable.
    pub binary: &'a Path,
    /// Cluster to install into.
    pub client: &'a ClusterClient,
    /// Unpacked chart.
    pub chart: &'a Chart,
    /// Release namespace.
    pub namespace: &'a str,
    /// Release name.
    pub release: &'a str,
    /// Attempt id, used to name the values file.
    pub attempt_id: &'a str,
    /// Strategy values, applied before the user overlays.
    pub values: &'a Value,
    /// User overlays.
    pub overlays: &'a HelmOverlays,
    /// Install timeout.
    pub timeout: Duration,
}

/// Installs a release and waits for its resources to become ready.
///
/// # Errors
///
/// Returns [`MigrateError::Install`] if helm fails or does not finish in time.
pub async fn install(req: &InstallRequest<'_>) -> MigrateResult<()> {
    let values_file = write_values_file(req.attempt_id, req.values)?;
    let args = install_args(
        req.client,
        req.release,
        req.namespace,
        req.chart.path(),
        values_file.path(),
        req.overlays,
        req.timeout,
    );
    debug!(release = req.release, namespace = req.namespace, "installing helm release");

    let install_error = |reason: String| MigrateError::Install {
        release: req.release.to_string(),
        reason,
    };
    let output = run_helm(req.binary, &args, req.timeout)
        .await
        .map_err(install_error)?;
    if !output.status.success() {
        return Err(install_error(failure_reason(&output)));
    }
    info!(release = req.release, namespace = req.namespace, "helm release installed");
    Ok(())
}

/// Uninstalls a release. A release that does not exist counts as uninstalled.
///
/// # Errors
///
/// Returns [`MigrateError::Uninstall`] for any other helm failure.
pub async fn uninstall(
    binary: &Path,
    client: &ClusterClient,
    namespace: &str,
    release: &str,
    timeout: Duration,
) -> MigrateResult<()> {
    let args = uninstall_args(client, release, namespace, timeout);
    let uninstall_error = |reason: String| MigrateError::Uninstall {
        release: release.to_string(),
        reason,
    };
    let output = run_helm(binary, &args, timeout)
        .await
        .map_err(uninstall_error)?;
    if output.status.success() {
        info!(release, namespace, "helm release uninstalled");
        return Ok(());
    }
    let reason = failure_reason(&output);
    if is_release_not_found(&reason) {
        debug!(release, namespace, "helm release already gone");
        return Ok(());
    }
    Err(uninstall_error(reason))
}

/// Looks up an executable on `PATH`.
#[must_use]
pub fn find_executable(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}
