//! Rsync command building and progress tracking.

pub mod cmd;
pub mod logtail;
pub mod progress;

pub use cmd::{RsyncCommand, DEFAULT_SSH_USER};
pub use logtail::{LogTail, ProgressSink};
pub use progress::{parse_line, Progress};
