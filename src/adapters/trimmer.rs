// ffmpeg trim adapter

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use crate::adapters::{wait_with_deadline, Trimmer, WaitOutcome};
use crate::error::{Result, TaktError};
use crate::tools;

pub struct FfmpegTrimmer {
    timeout: Duration,
}

impl FfmpegTrimmer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Trimmer for FfmpegTrimmer {
    fn trim(
        &self,
        input: &Path,
        start_secs: f64,
        end_secs: f64,
        output: &Path,
        cancel: &AtomicBool,
    ) -> Result<()> {
        let ffmpeg = tools::ffmpeg_path();

        log::debug!(
            "Trimming {} [{:.3}, {:.3}) -> {}",
            input.display(),
            start_secs,
            end_secs,
            output.display()
        );

        // Stream copy keeps the trim fast; offsets snap to the nearest
        // keyframe at the container level.
        let mut child = Command::new(&ffmpeg)
            .arg("-y")
            .arg("-i")
            .arg(input)
            .arg("-ss")
            .arg(format!("{:.3}", start_secs))
            .arg("-to")
            .arg(format!("{:.3}", end_secs))
            .arg("-c")
            .arg("copy")
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| TaktError::Tool(format!("spawn {}: {}", ffmpeg.display(), e)))?;

        match wait_with_deadline(&mut child, Some(self.timeout), cancel)? {
            WaitOutcome::Cancelled => Err(TaktError::Cancelled),
            WaitOutcome::TimedOut => Err(TaktError::Trim(format!(
                "trim timed out after {}s",
                self.timeout.as_secs()
            ))),
            WaitOutcome::Exited(status) => {
                if status.success() {
                    if !output.exists() {
                        return Err(TaktError::Trim(
                            "ffmpeg exited successfully but produced no file".to_string(),
                        ));
                    }
                    Ok(())
                } else {
                    let mut stderr = String::new();
                    if let Some(mut pipe) = child.stderr.take() {
                        pipe.read_to_string(&mut stderr).ok();
                    }
                    let tail = stderr
                        .lines()
                        .rev()
                        .find(|l| !l.trim().is_empty())
                        .unwrap_or("ffmpeg failed");
                    Err(TaktError::Trim(tail.to_string()))
                }
            }
        }
    }
}
