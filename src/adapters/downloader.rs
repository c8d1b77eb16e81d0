// yt-dlp adapter

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use serde::Deserialize;

use crate::adapters::{
    classify_download_failure, probe, wait_with_deadline, DownloadOutput, Downloader, SourceInfo,
    WaitOutcome,
};
use crate::error::{Result, TaktError};
use crate::tools;

pub struct YtDlpDownloader {
    timeout: Duration,
}

impl YtDlpDownloader {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[derive(Deserialize)]
struct YtDlpInfo {
    title: Option<String>,
    duration: Option<f64>,
}

impl Downloader for YtDlpDownloader {
    fn download(
        &self,
        url: &str,
        format: &str,
        dest_dir: &Path,
        cancel: &AtomicBool,
    ) -> Result<DownloadOutput> {
        let ytdlp = tools::ytdlp_path();
        let output_template = dest_dir.join("media.%(ext)s");

        log::debug!("Starting yt-dlp for {} (format {})", url, format);

        let mut child = Command::new(&ytdlp)
            .arg("--quiet")
            .arg("--no-warnings")
            .arg("--no-progress")
            .arg("--no-playlist")
            .arg("-f")
            .arg(format)
            .arg("-o")
            .arg(&output_template)
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| TaktError::Tool(format!("spawn {}: {}", ytdlp.display(), e)))?;

        match wait_with_deadline(&mut child, Some(self.timeout), cancel)? {
            WaitOutcome::Cancelled => return Err(TaktError::Cancelled),
            WaitOutcome::TimedOut => {
                return Err(TaktError::transient_download(format!(
                    "download timed out after {}s",
                    self.timeout.as_secs()
                )));
            }
            WaitOutcome::Exited(status) => {
                if !status.success() {
                    let mut stderr = String::new();
                    if let Some(mut pipe) = child.stderr.take() {
                        pipe.read_to_string(&mut stderr).ok();
                    }
                    let message = stderr
                        .lines()
                        .rev()
                        .find(|l| !l.trim().is_empty())
                        .unwrap_or("yt-dlp failed")
                        .to_string();
                    return Err(TaktError::Download {
                        kind: classify_download_failure(&stderr),
                        message,
                    });
                }
            }
        }

        let file_path = find_downloaded_file(dest_dir)?;
        let duration_hint = probe::duration_secs(&file_path).ok();

        Ok(DownloadOutput {
            file_path,
            duration_hint,
        })
    }

    fn analyze(&self, url: &str) -> Result<SourceInfo> {
        let ytdlp = tools::ytdlp_path();

        let output = Command::new(&ytdlp)
            .arg("-J")
            .arg("--no-playlist")
            .arg("--no-warnings")
            .arg(url)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| TaktError::Tool(format!("spawn {}: {}", ytdlp.display(), e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TaktError::Download {
                kind: classify_download_failure(&stderr),
                message: format!("analyze failed: {}", stderr.trim()),
            });
        }

        let info: YtDlpInfo = serde_json::from_slice(&output.stdout)?;
        Ok(SourceInfo {
            title: info.title,
            duration_secs: info.duration,
        })
    }

    fn probe_source(&self, url: &str) -> Result<bool> {
        let ytdlp = tools::ytdlp_path();

        let output = Command::new(&ytdlp)
            .arg("--simulate")
            .arg("--quiet")
            .arg("--no-warnings")
            .arg("--no-playlist")
            .arg(url)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| TaktError::Tool(format!("spawn {}: {}", ytdlp.display(), e)))?;

        Ok(output.status.success())
    }
}

/// Locate the file yt-dlp produced in the staging directory. Partial
/// downloads (.part, .ytdl) are ignored.
fn find_downloaded_file(dest_dir: &Path) -> Result<std::path::PathBuf> {
    let mut candidates: Vec<std::path::PathBuf> = std::fs::read_dir(dest_dir)
        .map_err(|e| TaktError::Storage(format!("read {}: {}", dest_dir.display(), e)))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && !matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("part") | Some("ytdl") | Some("json")
                )
        })
        .collect();

    candidates.sort();
    candidates.into_iter().next().ok_or_else(|| {
        TaktError::transient_download("downloader exited successfully but produced no file")
    })
}
