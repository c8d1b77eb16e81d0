// External tool adapters
//
// The job engine talks to the downloader and trimmer only through these
// traits, so process-spawning details stay out of the state machine and
// tests run against scripted fakes.

pub mod downloader;
pub mod probe;
pub mod trimmer;

use std::path::{Path, PathBuf};
use std::process::Child;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::constants::SUBPROCESS_POLL_INTERVAL_MS;
use crate::error::{DownloadErrorKind, Result};

pub use downloader::YtDlpDownloader;
pub use trimmer::FfmpegTrimmer;

#[derive(Debug, Clone)]
pub struct DownloadOutput {
    pub file_path: PathBuf,
    /// Media duration in seconds, when the adapter could determine it.
    /// Used to validate trim offsets before invoking the trimmer.
    pub duration_hint: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct SourceInfo {
    pub title: Option<String>,
    pub duration_secs: Option<f64>,
}

/// Command contract for the external downloader tool.
pub trait Downloader: Send + Sync {
    /// Fetch `url` into `dest_dir` using the given format selector.
    /// Polls `cancel` while the subprocess runs; a set flag kills it and
    /// returns `TaktError::Cancelled`.
    fn download(
        &self,
        url: &str,
        format: &str,
        dest_dir: &Path,
        cancel: &AtomicBool,
    ) -> Result<DownloadOutput>;

    /// Fetch source metadata without downloading.
    fn analyze(&self, url: &str) -> Result<SourceInfo>;

    /// Check whether the source is still retrievable.
    fn probe_source(&self, url: &str) -> Result<bool>;
}

/// Command contract for the external trim/transcode tool.
/// Offsets are seconds: inclusive start, exclusive end.
pub trait Trimmer: Send + Sync {
    fn trim(
        &self,
        input: &Path,
        start_secs: f64,
        end_secs: f64,
        output: &Path,
        cancel: &AtomicBool,
    ) -> Result<()>;
}

/// Outcome of waiting on a subprocess with a deadline and cancel flag.
pub(crate) enum WaitOutcome {
    Exited(std::process::ExitStatus),
    TimedOut,
    Cancelled,
}

/// Poll a child process until it exits, the timeout lapses, or the
/// cancel flag is set. The child is killed on timeout/cancel.
pub(crate) fn wait_with_deadline(
    child: &mut Child,
    timeout: Option<Duration>,
    cancel: &AtomicBool,
) -> std::io::Result<WaitOutcome> {
    let started = Instant::now();
    loop {
        if cancel.load(Ordering::Relaxed) {
            child.kill().ok();
            child.wait().ok();
            return Ok(WaitOutcome::Cancelled);
        }
        if let Some(timeout) = timeout {
            if started.elapsed() >= timeout {
                child.kill().ok();
                child.wait().ok();
                return Ok(WaitOutcome::TimedOut);
            }
        }
        if let Some(status) = child.try_wait()? {
            return Ok(WaitOutcome::Exited(status));
        }
        std::thread::sleep(Duration::from_millis(SUBPROCESS_POLL_INTERVAL_MS));
    }
}

/// Classify a downloader failure from its stderr. Permanent failures
/// (bad URL, private/removed video) are never retried; everything else
/// is treated as transient and retried with backoff.
pub fn classify_download_failure(stderr: &str) -> DownloadErrorKind {
    const PERMANENT_MARKERS: [&str; 8] = [
        "private video",
        "video unavailable",
        "is not a valid url",
        "unsupported url",
        "has been removed",
        "account associated with this video has been terminated",
        "sign in to confirm your age",
        "http error 404",
    ];

    let lower = stderr.to_lowercase();
    if PERMANENT_MARKERS.iter().any(|m| lower.contains(m)) {
        DownloadErrorKind::Permanent
    } else {
        DownloadErrorKind::Transient
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_permanent_failures() {
        assert_eq!(
            classify_download_failure("ERROR: Private video. Sign in if you've been granted access"),
            DownloadErrorKind::Permanent
        );
        assert_eq!(
            classify_download_failure("ERROR: Video unavailable"),
            DownloadErrorKind::Permanent
        );
        assert_eq!(
            classify_download_failure("ERROR: 'htp://x' is not a valid URL"),
            DownloadErrorKind::Permanent
        );
    }

    #[test]
    fn test_classify_transient_failures() {
        assert_eq!(
            classify_download_failure("ERROR: unable to download video data: HTTP Error 429"),
            DownloadErrorKind::Transient
        );
        assert_eq!(
            classify_download_failure("ERROR: Connection reset by peer"),
            DownloadErrorKind::Transient
        );
        assert_eq!(classify_download_failure(""), DownloadErrorKind::Transient);
    }
}
