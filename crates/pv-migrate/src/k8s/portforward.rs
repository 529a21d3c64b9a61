//! Local port-forwarding to a pod.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::ClusterClient;
use crate::error::{MigrateError, MigrateResult};

/// How long a forwarder may take to become ready.
pub const READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Asks the kernel for a free local TCP port.
///
/// The port is released before returning, so another process may grab it first.
///
/// # Errors
///
/// Returns an I/O error if binding fails.
pub fn free_local_port() -> MigrateResult<u16> {
    let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}

/// A running forward from a local port to a pod port.
///
/// Each accepted local connection gets its own tunnel. Dropping the handle stops the
/// forwarder.
pub struct PortForward {
    local_port: u16,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl PortForward {
    /// Starts forwarding a free local port to `remote_port` on the pod.
    ///
    /// # Errors
    ///
    /// Returns [`MigrateError::PortForward`] if the forwarder is not ready within
    /// [`READY_TIMEOUT`] or the pod cannot be reached.
    pub async fn start(
        client: &ClusterClient,
        namespace: &str,
        pod_name: &str,
        remote_port: u16,
        cancel: &CancellationToken,
    ) -> MigrateResult<Self> {
        let local_port = free_local_port()?;
        let pods: Api<Pod> = Api::namespaced(client.client(), namespace);
        let stop = cancel.child_token();
        let (ready_tx, ready_rx) = oneshot::channel();

        let task = tokio::spawn(run_forwarder(
            pods,
            pod_name.to_string(),
            remote_port,
            local_port,
            ready_tx,
            stop.clone(),
        ));
        let forward = Self {
            local_port,
            stop,
            task,
        };

        match tokio::time::timeout(READY_TIMEOUT, ready_rx).await {
            Ok(Ok(Ok(()))) => {
                info!(namespace, pod = pod_name, local_port, remote_port, "port-forward ready");
                Ok(forward)
            }
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(MigrateError::PortForward(format!(
                "forwarder for pod {namespace}/{pod_name} exited before becoming ready"
            ))),
            Err(_) => Err(MigrateError::PortForward(format!(
                "port-forward to pod {namespace}/{pod_name} not ready within {}s",
                READY_TIMEOUT.as_secs()
            ))),
        }
    }

    /// Local port the forwarder listens on.
    #[must_use]
    pub const fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Stops the forwarder and waits for it to exit.
    pub async fn stop(mut self) {
        self.stop.cancel();
        let _ = (&mut self.task).await;
    }
}

impl Drop for PortForward {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn run_forwarder(
    pods: Api<Pod>,
    pod_name: String,
    remote_port: u16,
    local_port: u16,
    ready: oneshot::Sender<MigrateResult<()>>,
    stop: CancellationToken,
) {
    let listener = match TcpListener::bind((Ipv4Addr::LOCALHOST, local_port)).await {
        Ok(listener) => listener,
        Err(e) => {
            let _ = ready.send(Err(e.into()));
            return;
        }
    };

    // A tunnel that opens proves the pod is reachable before we report ready.
    match pods.portforward(&pod_name, &[remote_port]).await {
        Ok(probe) => probe.abort(),
        Err(e) => {
            let _ = ready.send(Err(MigrateError::PortForward(format!(
                "cannot forward to pod {pod_name}: {e}"
            ))));
            return;
        }
    }
    let _ = ready.send(Ok(()));

    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((conn, peer)) => spawn_tunnel(pods.clone(), pod_name.clone(), remote_port, conn, peer, stop.clone()),
                Err(e) => warn!(local_port, error = %e, "failed to accept forwarded connection"),
            },
        }
    }
    debug!(pod = %pod_name, local_port, "port-forward stopped");
}

fn spawn_tunnel(
    pods: Api<Pod>,
    pod_name: String,
    remote_port: u16,
    conn: TcpStream,
    peer: SocketAddr,
    stop: CancellationToken,
) {
    tokio::spawn(async move {
        tokio::select! {
            () = stop.cancelled() => {}
            result = tunnel(&pods, &pod_name, remote_port, conn) => {
                if let Err(e) = result {
                    debug!(pod = %pod_name, %peer, error = %e, "forwarded connection ended with error");
                }
            }
        }
    });
}

async fn tunnel(
    pods: &Api<Pod>,
    pod_name: &str,
    remote_port: u16,
    mut conn: TcpStream,
) -> MigrateResult<()> {
    let mut forwarder = pods.portforward(pod_name, &[remote_port]).await?;
    let mut upstream = forwarder.take_stream(remote_port).ok_or_else(|| {
        MigrateError::PortForward(format!("no stream for port {remote_port}"))
    })?;
    tokio::io::copy_bidirectional(&mut conn, &mut upstream).await?;
    drop(upstream);
    forwarder
        .join()
        .await
        .map_err(|e| MigrateError::PortForward(e.to_string()))
}
