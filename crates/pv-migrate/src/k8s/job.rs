//! Waiting for the rsync job while tailing its progress.

use std::future::Future;
use std::pin::pin;
use std::time::Duration;

use futures::{AsyncBufReadExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use kube::api::{Api, LogParams};
use kube::runtime::wait::await_condition;
use kube::runtime::{WatchStreamExt, watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::ClusterClient;
use super::pod::{is_finished, is_succeeded, is_tailable, job_selector};
use crate::error::{MigrateError, MigrateResult};
use crate::rsync::{LogTail, ProgressSink};

/// Times a broken log stream is re-opened before tailing gives up.
pub const MAX_LOG_REOPENS: u32 = 30;

/// Delay between log stream re-opens.
pub const LOG_REOPEN_DELAY: Duration = Duration::from_secs(1);

/// Blocks until the job's pod terminates, feeding its log into `sink`.
///
/// Success is decided by the pod's terminal phase only; the end of the log stream
/// means nothing on its own.
///
/// # Errors
///
/// Returns [`MigrateError::JobFailed`] if the pod ends in any phase other than
/// `Succeeded`, or a watch error.
pub async fn wait_for_job(
    client: &ClusterClient,
    namespace: &str,
    job_name: &str,
    sink: ProgressSink,
    cancel: &CancellationToken,
) -> MigrateResult<()> {
    let pods: Api<Pod> = Api::namespaced(client.client(), namespace);

    let pod = wait_for_tailable_pod(&pods, namespace, job_name).await?;
    let pod_name = pod.name_any();
    info!(namespace, job = job_name, pod = %pod_name, "rsync pod started");

    let (tail, lines) = LogTail::spawn(sink, cancel);
    let producer = tokio::spawn(stream_pod_logs(
        pods.clone(),
        pod_name.clone(),
        lines,
        tail.stop_token(),
    ));

    let outcome = await_condition(pods, &pod_name, is_finished).await;
    let succeeded = matches!(&outcome, Ok(Some(pod)) if is_succeeded(pod));

    tail.finish(succeeded).await;
    let _ = producer.await;

    job_outcome(namespace, job_name, outcome?.as_ref())
}

/// Maps the pod's final state to the job's result. A vanished pod is a failure.
fn job_outcome(namespace: &str, job_name: &str, pod: Option<&Pod>) -> MigrateResult<()> {
    if pod.is_some_and(is_succeeded) {
        info!(namespace, job = job_name, "rsync job succeeded");
        Ok(())
    } else {
        Err(MigrateError::job_failed(namespace, job_name))
    }
}

async fn wait_for_tailable_pod(
    pods: &Api<Pod>,
    namespace: &str,
    job_name: &str,
) -> MigrateResult<Pod> {
    let config = watcher::Config::default().labels(&job_selector(job_name));
    let mut stream = pin!(watcher(pods.clone(), config).applied_objects());
    while let Some(pod) = stream.try_next().await? {
        if is_tailable(&pod) {
            return Ok(pod);
        }
        debug!(pod = %pod.name_any(), "waiting for rsync pod to start");
    }
    Err(MigrateError::job_failed(namespace, job_name))
}

/// Follows the pod's log until the tail stops or the consumer goes away.
async fn stream_pod_logs(
    pods: Api<Pod>,
    pod_name: String,
    lines: mpsc::Sender<String>,
    stop: CancellationToken,
) {
    reopen_stream(
        &pod_name,
        &stop,
        || lines.is_closed(),
        || forward_log_lines(&pods, &pod_name, &lines),
    )
    .await;
}

/// Runs `open` until `stop` fires or `done` holds, re-opening an ended or broken
/// stream at most [`MAX_LOG_REOPENS`] times. Returns how many times it opened.
///
/// Only the first failure is logged at warn.
async fn reopen_stream<D, F, Fut>(
    pod: &str,
    stop: &CancellationToken,
    done: D,
    mut open: F,
) -> u32
where
    D: Fn() -> bool,
    F: FnMut() -> Fut,
    Fut: Future<Output = MigrateResult<()>>,
{
    let mut warned = false;
    let mut opens = 0;
    for attempt in 0..=MAX_LOG_REOPENS {
        opens += 1;
        let result = tokio::select! {
            () = stop.cancelled() => return opens,
            result = open() => result,
        };
        if stop.is_cancelled() || done() {
            return opens;
        }

        match result {
            Ok(()) => debug!(pod, attempt, "log stream ended"),
            Err(e) if !warned => {
                warn!(pod, error = %e, "log stream broke, re-opening");
                warned = true;
            }
            Err(e) => debug!(pod, error = %e, attempt, "log stream broke again"),
        }

        if attempt == MAX_LOG_REOPENS {
            break;
        }
        tokio::select! {
            () = stop.cancelled() => return opens,
            () = tokio::time::sleep(LOG_REOPEN_DELAY) => {}
        }
    }
    warn!(pod, "giving up on log stream, progress will not be shown");
    opens
}

async fn forward_log_lines(
    pods: &Api<Pod>,
    pod_name: &str,
    lines: &mpsc::Sender<String>,
) -> MigrateResult<()> {
    let params = LogParams {
        follow: true,
        ..LogParams::default()
    };
    let mut stream = pin!(pods.log_stream(pod_name, &params).await?.lines());
    while let Some(line) = stream.try_next().await? {
        if lines.send(line).await.is_err() {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::client::test_support::offline_client;

    #[tokio::test]
    async fn unreachable_api_surfaces_watch_error() {
        let client = offline_client("http://127.0.0.1:1", None, None);
        let cancel = CancellationToken::new();
        let result = wait_for_job(
            &client,
            "ns1",
            "pv-migrate-abcde-rsync",
            ProgressSink::hidden(),
            &cancel,
        )
        .await;
        assert!(matches!(result, Err(MigrateError::Watch(_))));
    }

    mod outcome {
        use super::*;
        use crate::k8s::pod::test_support::pod;

        #[test]
        fn succeeded_pod_passes() {
            let pod = pod("p", Some("Succeeded"), None);
            job_outcome("ns1", "pv-migrate-abcde-rsync", Some(&pod)).expect("succeeded");
        }

        #[test]
        fn failed_pod_fails_the_job() {
            let pod = pod("p", Some("Failed"), None);
            let err = job_outcome("ns1", "pv-migrate-abcde-rsync", Some(&pod)).expect_err("failed");
            assert!(matches!(err, MigrateError::JobFailed { .. }), "{err}");
            assert!(err.is_recoverable());
        }

        #[test]
        fn vanished_pod_fails_the_job() {
            let err = job_outcome("ns1", "pv-migrate-abcde-rsync", None).expect_err("vanished");
            assert!(matches!(err, MigrateError::JobFailed { .. }));
        }
    }

    mod reopen {
        use super::*;
        use std::sync::atomic::{AtomicU32, Ordering};

        fn broken() -> MigrateResult<()> {
            Err(MigrateError::Command("stream reset".to_string()))
        }

        #[tokio::test(start_paused = true)]
        async fn broken_stream_gives_up_after_budget() {
            let stop = CancellationToken::new();
            let calls = AtomicU32::new(0);
            let started = tokio::time::Instant::now();

            let opens = reopen_stream("p", &stop, || false, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { broken() }
            })
            .await;

            assert_eq!(opens, MAX_LOG_REOPENS + 1);
            assert_eq!(calls.load(Ordering::SeqCst), 31);
            assert_eq!(started.elapsed(), LOG_REOPEN_DELAY * MAX_LOG_REOPENS);
        }

        #[tokio::test(start_paused = true)]
        async fn ended_stream_is_reopened_too() {
            let stop = CancellationToken::new();
            let opens = reopen_stream("p", &stop, || false, || async { Ok(()) }).await;
            assert_eq!(opens, MAX_LOG_REOPENS + 1);
        }

        #[tokio::test(start_paused = true)]
        async fn stop_ends_the_loop() {
            let stop = CancellationToken::new();
            let calls = AtomicU32::new(0);

            let opens = reopen_stream("p", &stop, || false, || {
                if calls.fetch_add(1, Ordering::SeqCst) == 2 {
                    stop.cancel();
                }
                async { broken() }
            })
            .await;

            assert_eq!(opens, 3);
        }

        #[tokio::test(start_paused = true)]
        async fn closed_consumer_ends_the_loop() {
            let stop = CancellationToken::new();
            let opens = reopen_stream("p", &stop, || true, || async { broken() }).await;
            assert_eq!(opens, 1);
        }
    }
}
