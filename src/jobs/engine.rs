// Job engine
//
// Pulls queued jobs through download -> trim -> index. Each worker
// thread owns its own database connection; coordination happens through
// the jobs table (run tokens) and the in-process cancel flags.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;

use crate::adapters::{Downloader, FfmpegTrimmer, Trimmer, YtDlpDownloader};
use crate::artifacts::ArtifactStore;
use crate::config::Config;
use crate::constants::quality_format;
use crate::db::{self, schema};
use crate::db::schema::{Job, JobState, NewVideo};
use crate::error::{Result, TaktError};
use crate::jobs::{self, JobPayload};
use crate::store;

#[derive(Debug, Default)]
pub struct DrainSummary {
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

pub struct JobEngine {
    library_root: PathBuf,
    config: Config,
    downloader: Arc<dyn Downloader>,
    trimmer: Arc<dyn Trimmer>,
}

impl JobEngine {
    pub fn new(
        library_root: impl Into<PathBuf>,
        config: Config,
        downloader: Arc<dyn Downloader>,
        trimmer: Arc<dyn Trimmer>,
    ) -> Self {
        Self {
            library_root: library_root.into(),
            config,
            downloader,
            trimmer,
        }
    }

    /// Engine wired to the real yt-dlp and ffmpeg adapters.
    pub fn with_default_tools(library_root: impl Into<PathBuf>, config: Config) -> Self {
        let timeout = Duration::from_secs(config.download.timeout_secs);
        Self::new(
            library_root,
            config.clone(),
            Arc::new(YtDlpDownloader::new(timeout)),
            Arc::new(FfmpegTrimmer::new(timeout)),
        )
    }

    /// Requeue jobs left active by a crashed run, then drain the queue.
    pub fn run(&self) -> Result<DrainSummary> {
        let conn = db::open_db(&db::get_db_path(&self.library_root))
            .map_err(TaktError::from)?;
        jobs::recover_interrupted(&conn)?;
        drop(conn);
        self.drain()
    }

    /// Work the queue to empty with up to max_concurrent_downloads
    /// worker threads, each claiming jobs FIFO.
    pub fn drain(&self) -> Result<DrainSummary> {
        let workers = self.config.max_concurrent_downloads.max(1);
        let completed = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);
        let cancelled = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    if let Err(e) = self.worker_loop(&completed, &failed, &cancelled) {
                        log::error!("Worker exited with error: {}", e);
                    }
                });
            }
        });

        Ok(DrainSummary {
            completed: completed.into_inner(),
            failed: failed.into_inner(),
            cancelled: cancelled.into_inner(),
        })
    }

    fn worker_loop(
        &self,
        completed: &AtomicUsize,
        failed: &AtomicUsize,
        cancelled: &AtomicUsize,
    ) -> Result<()> {
        let conn = db::open_db(&db::get_db_path(&self.library_root))
            .map_err(TaktError::from)?;
        let worker = jobs::worker_id();

        while let Some(job) = jobs::claim_next(&conn, &worker)? {
            match self.run_job(&conn, &job) {
                JobResult::Completed => completed.fetch_add(1, Ordering::Relaxed),
                JobResult::Failed => failed.fetch_add(1, Ordering::Relaxed),
                JobResult::Cancelled => cancelled.fetch_add(1, Ordering::Relaxed),
            };
        }
        Ok(())
    }

    fn run_job(&self, conn: &Connection, job: &Job) -> JobResult {
        let run_token = job.run_token.clone().unwrap_or_default();
        let cancel = jobs::cancel_flag(job.id);
        log::info!("Job {} starting ({})", job.id, job.url);

        let outcome = self.execute_pipeline(conn, job, &run_token, &cancel);

        let result = match outcome {
            Ok(video_id) => match jobs::complete_job(conn, job.id, &run_token, video_id) {
                Ok(true) => {
                    log::info!("Job {} completed as video {}", job.id, video_id);
                    JobResult::Completed
                }
                _ => {
                    // Lost the job between indexing and completion; undo
                    // the index entry so nothing dangles.
                    log::warn!("Job {} lost ownership at completion; rolling back", job.id);
                    let artifacts = ArtifactStore::new(&self.library_root);
                    store::delete_video(conn, &artifacts, video_id).ok();
                    JobResult::Cancelled
                }
            },
            Err(TaktError::Cancelled) => {
                jobs::mark_cancelled(conn, job.id, &run_token).ok();
                log::info!("Job {} cancelled", job.id);
                JobResult::Cancelled
            }
            Err(e) => {
                jobs::fail_job(conn, job.id, &run_token, &e.to_string()).ok();
                log::warn!("Job {} failed: {}", job.id, e);
                JobResult::Failed
            }
        };

        jobs::clear_cancel_flag(job.id);
        std::fs::remove_dir_all(db::get_staging_path(&self.library_root, job.id)).ok();
        result
    }

    fn execute_pipeline(
        &self,
        conn: &Connection,
        job: &Job,
        run_token: &str,
        cancel: &AtomicBool,
    ) -> Result<i64> {
        let payload: JobPayload = serde_json::from_str(&job.payload)?;
        let format = quality_format(&payload.quality).ok_or_else(|| {
            TaktError::InvalidArgument(format!("unknown quality profile '{}'", payload.quality))
        })?;

        let staging = db::get_staging_path(&self.library_root, job.id);
        std::fs::create_dir_all(&staging)?;

        // -- download, with retry on transient failures --
        let download = self.download_with_retry(conn, job, run_token, format, &staging, cancel)?;
        let duration = download.duration_hint;

        // -- trim, when a clip range was requested --
        let wants_clip = job.clip_start_secs.is_some() || job.clip_end_secs.is_some();
        let mut final_path = download.file_path.clone();
        let mut trim_applied = false;

        if wants_clip {
            self.check_advance(conn, job.id, run_token, JobState::Trimming)?;
            if cancel.load(Ordering::SeqCst) {
                return Err(TaktError::Cancelled);
            }

            let start = job.clip_start_secs.unwrap_or(0.0);
            let end = match job.clip_end_secs.or(duration) {
                Some(e) => e,
                None => {
                    return Err(TaktError::Trim(
                        "cannot resolve clip end: media duration unknown".to_string(),
                    ))
                }
            };
            if let Some(d) = duration {
                if start >= d {
                    return Err(TaktError::Trim(format!(
                        "clip start {:.3}s is beyond media duration {:.3}s",
                        start, d
                    )));
                }
                if end > d {
                    return Err(TaktError::Trim(format!(
                        "clip end {:.3}s is beyond media duration {:.3}s",
                        end, d
                    )));
                }
            }

            let ext = download
                .file_path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("mp4");
            let trimmed = staging.join(format!("trimmed.{}", ext));

            match self.trimmer.trim(&download.file_path, start, end, &trimmed, cancel) {
                Ok(()) => {
                    final_path = trimmed;
                    trim_applied = true;
                }
                Err(TaktError::Cancelled) => return Err(TaktError::Cancelled),
                Err(e) if self.config.keep_raw_on_trim_failure => {
                    log::warn!(
                        "Job {}: trim failed ({}); archiving raw download instead",
                        job.id,
                        e
                    );
                }
                Err(e) => return Err(e),
            }
        }

        // -- index --
        self.check_advance(conn, job.id, run_token, JobState::Indexing)?;
        if cancel.load(Ordering::SeqCst) {
            return Err(TaktError::Cancelled);
        }

        let title = match payload.title.clone() {
            Some(t) => t,
            None => self
                .downloader
                .analyze(&job.url)
                .ok()
                .and_then(|info| info.title)
                .unwrap_or_else(|| job.url.clone()),
        };

        let artifacts = ArtifactStore::new(&self.library_root);
        let put = artifacts.put(conn, &final_path)?;

        let stored_duration = if trim_applied {
            Some(job.clip_end_secs.or(duration).unwrap_or(0.0) - job.clip_start_secs.unwrap_or(0.0))
        } else {
            duration
        };

        let new_video = NewVideo {
            profile_id: job.profile_id,
            source_url: job.url.clone(),
            title,
            description: String::new(),
            duration_secs: stored_duration,
            clip_start_secs: if trim_applied { job.clip_start_secs } else { None },
            clip_end_secs: if trim_applied { job.clip_end_secs } else { None },
            fingerprint: put.fingerprint.clone(),
            quality: payload.quality.clone(),
        };

        let mut tag_ids = Vec::with_capacity(payload.tags.len());
        for name in &payload.tags {
            tag_ids.push(store::get_or_create_tag(conn, name)?.id);
        }

        match store::create_video(conn, &new_video, &tag_ids, &payload.group_ids) {
            Ok(video) => Ok(video.id),
            Err(e) => {
                // Metadata write failed after the blob was stored; drop
                // the reference we just took so the store stays balanced.
                artifacts.remove(conn, &put.fingerprint).ok();
                Err(e)
            }
        }
    }

    fn download_with_retry(
        &self,
        conn: &Connection,
        job: &Job,
        run_token: &str,
        format: &str,
        staging: &std::path::Path,
        cancel: &AtomicBool,
    ) -> Result<crate::adapters::DownloadOutput> {
        // Attempts already burned before a crash still count.
        let mut attempts = job.attempts;
        let max_retries = self.config.download.max_retries.max(1);

        loop {
            if cancel.load(Ordering::SeqCst) {
                return Err(TaktError::Cancelled);
            }

            match self.downloader.download(&job.url, format, staging, cancel) {
                Ok(output) => return Ok(output),
                Err(TaktError::Cancelled) => return Err(TaktError::Cancelled),
                Err(e) => {
                    attempts += 1;
                    jobs::record_attempt(conn, job.id, run_token, &e.to_string())?;

                    if !e.is_transient() || attempts >= max_retries {
                        return Err(e);
                    }

                    let backoff = self.config.download.retry_backoff_secs
                        << (attempts.saturating_sub(1).min(16) as u64);
                    log::warn!(
                        "Job {}: download attempt {} failed ({}); retrying in {}s",
                        job.id,
                        attempts,
                        e,
                        backoff
                    );
                    if sleep_with_cancel(Duration::from_secs(backoff), cancel) {
                        return Err(TaktError::Cancelled);
                    }
                }
            }
        }
    }

    /// Move to the next pipeline state, translating a lost run token
    /// into the reason we lost it.
    fn check_advance(
        &self,
        conn: &Connection,
        job_id: i64,
        run_token: &str,
        next: JobState,
    ) -> Result<()> {
        if jobs::advance_state(conn, job_id, run_token, next)? {
            return Ok(());
        }
        match schema::get_job(conn, job_id)?.map(|j| j.state) {
            Some(JobState::Cancelled) => Err(TaktError::Cancelled),
            state => Err(TaktError::Concurrency(format!(
                "job {} is no longer owned by this worker (state: {:?})",
                job_id, state
            ))),
        }
    }
}

enum JobResult {
    Completed,
    Failed,
    Cancelled,
}

/// Sleep in short slices so a cancel request interrupts the backoff.
/// Returns true when cancelled.
fn sleep_with_cancel(total: Duration, cancel: &AtomicBool) -> bool {
    let slice = Duration::from_millis(50);
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if cancel.load(Ordering::SeqCst) {
            return true;
        }
        let step = remaining.min(slice);
        std::thread::sleep(step);
        remaining -= step;
    }
    cancel.load(Ordering::SeqCst)
}
