//! Progress consumer for rsync output.
//!
//! A [`LogTail`] owns a consumer task that reads lines from a bounded channel, parses
//! rsync progress out of them and either drives a progress bar or debug-logs them.
//! Producers (a pod log stream, an ssh child's stdout) feed the channel and stop when
//! the tail's stop token fires. The tail is finished with a single success signal.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::progress::{parse_line, Progress};
use crate::types::ProgressOutput;

/// Capacity of the line channel between producers and the consumer.
pub const LINE_CHANNEL_CAPACITY: usize = 256;

const BAR_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";

/// Where parsed progress goes.
pub struct ProgressSink {
    bar: Option<ProgressBar>,
}

impl ProgressSink {
    /// Creates a sink drawing a bar to `output`, or a logging-only sink when `show` is false.
    #[must_use]
    pub fn new(show: bool, output: ProgressOutput) -> Self {
        let target = match output {
            ProgressOutput::Stderr => ProgressDrawTarget::stderr(),
            ProgressOutput::Stdout => ProgressDrawTarget::stdout(),
            ProgressOutput::Hidden => return Self::hidden(),
        };
        if !show {
            return Self::hidden();
        }

        let style = ProgressStyle::with_template(BAR_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        let bar = ProgressBar::with_draw_target(Some(1), target).with_style(style);
        Self { bar: Some(bar) }
    }

    /// Creates a sink that only logs.
    #[must_use]
    pub const fn hidden() -> Self {
        Self { bar: None }
    }

    /// Feeds one output line.
    pub fn observe(&self, line: &str) {
        let Some(progress) = parse_line(line) else {
            debug!(line, "rsync");
            return;
        };
        match &self.bar {
            Some(bar) => apply(bar, progress),
            None => debug!(
                transferred = progress.transferred,
                total = progress.total,
                percentage = progress.percentage,
                "rsync progress"
            ),
        }
    }

    fn finish(&self) {
        if let Some(bar) = &self.bar {
            if let Some(len) = bar.length() {
                bar.set_position(len);
            }
            bar.finish();
        }
    }

    fn abandon(&self) {
        if let Some(bar) = &self.bar {
            bar.abandon();
        }
    }

    #[cfg(test)]
    fn position(&self) -> Option<(u64, Option<u64>)> {
        self.bar.as_ref().map(|b| (b.position(), b.length()))
    }
}

/// Raises the bar's length to the latest total and never moves it backwards, so a
/// re-opened stream replaying old lines does not rewind the display.
fn apply(bar: &ProgressBar, progress: Progress) {
    let total = progress.total.max(progress.transferred);
    if total > 0 {
        bar.set_length(total);
    }
    if progress.transferred > bar.position() {
        bar.set_position(progress.transferred);
    }
}

/// Handle to a running progress consumer.
pub struct LogTail {
    success_tx: oneshot::Sender<bool>,
    stop: CancellationToken,
    consumer: JoinHandle<()>,
}

impl LogTail {
    /// Spawns the consumer and returns the tail plus the sender producers write to.
    ///
    /// The consumer exits when `cancel` fires, when the tail is finished, or both.
    #[must_use]
    pub fn spawn(sink: ProgressSink, cancel: &CancellationToken) -> (Self, mpsc::Sender<String>) {
        let (lines_tx, lines_rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        let (success_tx, success_rx) = oneshot::channel();
        let stop = cancel.child_token();
        let consumer = tokio::spawn(consume(lines_rx, success_rx, sink, stop.clone()));
        (
            Self {
                success_tx,
                stop,
                consumer,
            },
            lines_tx,
        )
    }

    /// Token that producers watch to know when to stop.
    #[must_use]
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Delivers the success signal and waits for the consumer to drain and exit.
    pub async fn finish(self, success: bool) {
        let _ = self.success_tx.send(success);
        let _ = self.consumer.await;
        self.stop.cancel();
    }
}

async fn consume(
    mut lines: mpsc::Receiver<String>,
    mut success: oneshot::Receiver<bool>,
    sink: ProgressSink,
    stop: CancellationToken,
) {
    let mut producers_done = false;
    loop {
        tokio::select! {
            biased;
            () = stop.cancelled() => {
                sink.abandon();
                break;
            }
            outcome = &mut success => {
                while let Ok(line) = lines.try_recv() {
                    sink.observe(&line);
                }
                if matches!(outcome, Ok(true)) {
                    sink.finish();
                } else {
                    sink.abandon();
                }
                break;
            }
            line = lines.recv(), if !producers_done => match line {
                Some(line) => sink.observe(&line),
                None => producers_done = true,
            },
        }
    }
    stop.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar_sink() -> ProgressSink {
        let bar = ProgressBar::with_draw_target(Some(1), ProgressDrawTarget::hidden());
        ProgressSink { bar: Some(bar) }
    }

    #[test]
    fn observe_raises_length_and_position() {
        let sink = bar_sink();
        sink.observe("  12,345  67%");
        assert_eq!(sink.position(), Some((12_345, Some(18_425))));

        sink.observe("total size is 20,000  speedup is 1.00");
        assert_eq!(sink.position(), Some((20_000, Some(20_000))));
    }

    #[test]
    fn replayed_lines_do_not_rewind() {
        let sink = bar_sink();
        sink.observe("  50,000  50%");
        sink.observe("  10,000  10%");
        let (position, _) = sink.position().expect("bar");
        assert_eq!(position, 50_000);
    }

    #[test]
    fn zero_progress_keeps_initial_length() {
        let sink = bar_sink();
        sink.observe("  0   0%");
        assert_eq!(sink.position(), Some((0, Some(1))));
    }

    #[test]
    fn hidden_output_has_no_bar() {
        let sink = ProgressSink::new(true, ProgressOutput::Hidden);
        assert!(sink.position().is_none());
        let sink = ProgressSink::new(false, ProgressOutput::Stderr);
        assert!(sink.position().is_none());
    }

    #[tokio::test]
    async fn finish_drains_queued_lines() {
        let cancel = CancellationToken::new();
        let (tail, tx) = LogTail::spawn(ProgressSink::hidden(), &cancel);
        let stop = tail.stop_token();
        tx.send("  1,000  10%".to_string()).await.expect("send");
        tx.send("total size is 10,000".to_string()).await.expect("send");
        tail.finish(true).await;
        assert!(stop.is_cancelled());
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test]
    async fn consumer_waits_for_signal_after_producers_close() {
        let cancel = CancellationToken::new();
        let (tail, tx) = LogTail::spawn(ProgressSink::hidden(), &cancel);
        let stop = tail.stop_token();
        drop(tx);
        tokio::task::yield_now().await;
        assert!(!stop.is_cancelled());
        tail.finish(false).await;
        assert!(stop.is_cancelled());
    }

    #[tokio::test]
    async fn parent_cancellation_stops_consumer() {
        let cancel = CancellationToken::new();
        let (tail, _tx) = LogTail::spawn(ProgressSink::hidden(), &cancel);
        let stop = tail.stop_token();
        cancel.cancel();
        assert!(stop.is_cancelled());
        tail.finish(false).await;
    }
}
