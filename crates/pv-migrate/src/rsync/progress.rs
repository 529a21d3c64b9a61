//! Parsing of rsync `--info=progress2` output.
//!
//! Two line shapes carry progress:
//! - intra-transfer lines such as `  12,345  67%  1.2MB/s  0:00:01`
//! - the closing summary `total size is 18,425  speedup is 1.00`

use once_cell::sync::Lazy;
use regex::Regex;

static PROGRESS_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\s*(?P<bytes>[0-9]+(,[0-9]+)*)\s+(?P<percentage>[0-9]{1,3})%")
        .unwrap_or_else(|_| unreachable!("progress pattern is valid"))
});

static TOTAL_SIZE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"total size is (?P<bytes>[0-9]+(,[0-9]+)*)")
        .unwrap_or_else(|_| unreachable!("total size pattern is valid"))
});

/// A progress observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    /// Bytes transferred so far.
    pub transferred: u64,
    /// Estimated total bytes.
    pub total: u64,
    /// Completion percentage, 0..=100.
    pub percentage: u8,
}

/// Parses one log line, returning `None` for lines that carry no progress.
#[must_use]
pub fn parse_line(line: &str) -> Option<Progress> {
    if let Some(caps) = TOTAL_SIZE_REGEX.captures(line) {
        let total = parse_bytes(&caps["bytes"])?;
        return Some(Progress {
            transferred: total,
            total,
            percentage: 100,
        });
    }

    let caps = PROGRESS_REGEX.captures(line)?;
    let transferred = parse_bytes(&caps["bytes"])?;
    let percentage: u8 = caps["percentage"].parse().ok()?;
    if percentage == 0 {
        return Some(Progress::default());
    }

    let mut total = (transferred as f64 * 100.0 / f64::from(percentage)).round() as u64;
    if transferred > total {
        total = transferred;
    }

    Some(Progress {
        transferred,
        total,
        percentage: percentage.min(100),
    })
}

fn parse_bytes(s: &str) -> Option<u64> {
    s.replace(',', "").parse().ok()
}
