//! Migration bridged through this machine.
//!
//! Both sides get an sshd pod. Each is port-forwarded to a local port, then a local
//! ssh client logs into the source sshd with a reverse tunnel to the destination sshd
//! and runs rsync there, pushing through the tunnel.

use std::io::Write;
use std::path::Path;
use std::process::Stdio;

use serde_json::{Value, json};
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use super::{DEST_MOUNT_PATH, base_rsync_command, pvc_mount, source_sshd_values};
use crate::error::{MigrateError, MigrateResult};
use crate::helm::find_executable;
use crate::k8s::pod::sshd_pods;
use crate::k8s::service::SSH_PORT;
use crate::k8s::{ClusterClient, PortForward, PvcInfo};
use crate::migration::{Attempt, Migration};
use crate::rsync::LogTail;
use crate::ssh::{self, KeyPair};
use crate::types::{KeyAlgorithm, Request};

/// Port the reverse tunnel opens inside the source sshd pod.
pub const REVERSE_TUNNEL_PORT: u16 = 50000;

const SSH_BINARY: &str = "ssh";

fn source_values(migration: &Migration, keys: &KeyPair) -> Value {
    let mut sshd = source_sshd_values(&migration.source, &migration.request, keys, "ClusterIP");
    sshd["privateKeyMount"] = json!(true);
    sshd["privateKey"] = json!(keys.private_key);
    sshd["privateKeyMountPath"] = json!(keys.algorithm.private_key_mount_path());
    json!({ "sshd": sshd })
}

fn dest_values(dest: &PvcInfo, keys: &KeyPair) -> Value {
    json!({
        "sshd": {
            "enabled": true,
            "namespace": dest.namespace(),
            "publicKey": keys.public_key,
            "pvcMounts": [pvc_mount(dest.name(), DEST_MOUNT_PATH, false)],
            "affinity": dest.affinity_value(),
        }
    })
}

/// Rsync run inside the source sshd pod, pushing through the reverse tunnel with the
/// key mounted from the release secret.
fn remote_rsync_command(request: &Request, algorithm: KeyAlgorithm) -> MigrateResult<String> {
    base_rsync_command(request)
        .with_ssh_dest("localhost")
        .with_identity_file(algorithm.private_key_mount_path())
        .with_port(REVERSE_TUNNEL_PORT)
        .build()
}

/// Arguments of the local ssh client.
fn ssh_args(key_file: &Path, src_port: u16, dest_port: u16, remote_command: &str) -> Vec<String> {
    vec![
        "-i".to_string(),
        key_file.display().to_string(),
        "-p".to_string(),
        src_port.to_string(),
        "-R".to_string(),
        format!("{REVERSE_TUNNEL_PORT}:localhost:{dest_port}"),
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-o".to_string(),
        "UserKnownHostsFile=/dev/null".to_string(),
        "root@localhost".to_string(),
        remote_command.to_string(),
    ]
}

fn write_key_file(keys: &KeyPair) -> MigrateResult<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("pv-migrate-key-")
        .tempfile()?;
    file.write_all(keys.private_key.as_bytes())?;
    file.flush()?;
    Ok(file)
}

async fn forward_sshd(
    attempt: &Attempt<'_>,
    client: &ClusterClient,
    namespace: &str,
    release: &str,
) -> MigrateResult<PortForward> {
    let pods = sshd_pods(client, namespace, release).await?;
    let [pod] = pods.as_slice() else {
        return Err(MigrateError::PortForward(format!(
            "expected exactly one sshd pod for release {release}, found {}",
            pods.len()
        )));
    };
    let name = pod.metadata.name.as_deref().unwrap_or_default();
    PortForward::start(client, namespace, name, SSH_PORT, attempt.cancel()).await
}

pub(super) async fn run(attempt: &Attempt<'_>) -> MigrateResult<()> {
    if find_executable(SSH_BINARY).is_none() {
        return Err(MigrateError::Command(
            "ssh binary not found on PATH, it is required by the local strategy".to_string(),
        ));
    }

    let migration = attempt.migration();
    let (source, dest) = (&migration.source, &migration.dest);
    let request = attempt.request();

    let keys = ssh::generate(request.key_algorithm)?;
    let src_release = format!("{}-src", attempt.release_prefix());
    let dest_release = format!("{}-dest", attempt.release_prefix());

    info!(source = %src_release, dest = %dest_release, "installing sshd on both sides");
    attempt
        .install(source.client(), source.namespace(), &src_release, &source_values(migration, &keys))
        .await?;
    attempt
        .install(dest.client(), dest.namespace(), &dest_release, &dest_values(dest, &keys))
        .await?;

    let (src_forward, dest_forward) = tokio::try_join!(
        forward_sshd(attempt, source.client(), source.namespace(), &src_release),
        forward_sshd(attempt, dest.client(), dest.namespace(), &dest_release),
    )?;

    let result = run_ssh(attempt, &keys, src_forward.local_port(), dest_forward.local_port()).await;

    src_forward.stop().await;
    dest_forward.stop().await;
    result
}

async fn run_ssh(
    attempt: &Attempt<'_>,
    keys: &KeyPair,
    src_port: u16,
    dest_port: u16,
) -> MigrateResult<()> {
    let remote_command = remote_rsync_command(attempt.request(), keys.algorithm)?;
    let key_file = write_key_file(keys)?;
    let args = ssh_args(key_file.path(), src_port, dest_port, &remote_command);

    debug!(src_port, dest_port, "starting local ssh client");
    let mut child = Command::new(SSH_BINARY)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let (tail, lines) = LogTail::spawn(attempt.progress_sink(), attempt.cancel());
    let stop = tail.stop_token();

    let stdout = child.stdout.take();
    let stdout_task = tokio::spawn(async move {
        let Some(stdout) = stdout else { return };
        let mut reader = BufReader::new(stdout).lines();
        loop {
            tokio::select! {
                () = stop.cancelled() => break,
                line = reader.next_line() => match line {
                    Ok(Some(line)) => {
                        if lines.send(line).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) | Err(_) => break,
                },
            }
        }
    });

    let stderr = child.stderr.take();
    let stderr_task = tokio::spawn(async move {
        let Some(stderr) = stderr else { return };
        let mut reader = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            debug!(line = %line, "ssh");
        }
    });

    let status = child.wait().await?;
    let _ = stdout_task.await;
    tail.finish(status.success()).await;
    let _ = stderr_task.await;

    if status.success() {
        info!("local rsync finished");
        Ok(())
    } else {
        Err(MigrateError::Command(format!("ssh exited with {status}")))
    }
}
