// Job queue
//
// Durable download jobs live in the jobs table. Workers claim the oldest
// queued job with a single UPDATE ... RETURNING, stamping a fresh
// run_token; every later transition re-checks that token so a recovered
// or reassigned job can't be finished twice.

pub mod engine;
#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex};

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::constants::quality_format;
use crate::db::schema::{self, Job, JobState, NewJob, JOB_COLUMNS};
use crate::error::{Result, TaktError};
use crate::store;

pub use engine::JobEngine;

/// Per-submission options carried in the job row as JSON.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JobPayload {
    pub quality: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub group_ids: Vec<i64>,
}

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub url: String,
    pub profile_id: i64,
    pub clip_start_secs: Option<f64>,
    pub clip_end_secs: Option<f64>,
    pub quality: Option<String>,
    pub title: Option<String>,
    pub tags: Vec<String>,
    pub group_ids: Vec<i64>,
}

#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub job_id: i64,
    /// True when an equivalent job was already in flight; no new row.
    pub deduplicated: bool,
}

/// Normalized clip identity for dedup. Untrimmed downloads share the
/// key "full"; trimmed ones get "start-end" with seconds formatted
/// without trailing zeros, so 30.0 and 30 collide as intended.
pub fn clip_key(start_secs: Option<f64>, end_secs: Option<f64>) -> String {
    match (start_secs, end_secs) {
        (None, None) => "full".to_string(),
        (start, end) => format!(
            "{}-{}",
            start.map(format_secs).unwrap_or_default(),
            end.map(format_secs).unwrap_or_default()
        ),
    }
}

fn format_secs(secs: f64) -> String {
    let s = format!("{:.3}", secs);
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}

/// Identifies this worker process in claimed_by for diagnostics.
pub fn worker_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    format!("{}:{}", host, std::process::id())
}

fn validate_clip(start: Option<f64>, end: Option<f64>) -> Result<()> {
    if let Some(s) = start {
        if s < 0.0 {
            return Err(TaktError::InvalidArgument(
                "clip start must be >= 0".to_string(),
            ));
        }
    }
    if let (Some(s), Some(e)) = (start, end) {
        if e <= s {
            return Err(TaktError::InvalidArgument(
                "clip end must be greater than clip start".to_string(),
            ));
        }
    }
    Ok(())
}

fn find_inflight(conn: &Connection, url: &str, clip_key: &str) -> Result<Option<i64>> {
    let existing = conn
        .query_row(
            "SELECT id FROM jobs
             WHERE url = ?1 AND clip_key = ?2
               AND state IN ('queued', 'downloading', 'trimming', 'indexing')",
            params![url, clip_key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(existing)
}

fn is_constraint_violation(err: &TaktError) -> bool {
    matches!(
        err,
        TaktError::Database(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Enqueue a download. An equivalent non-terminal job (same url and
/// clip key) is returned instead of inserting a duplicate; once the
/// earlier job reaches a terminal state the same request enqueues anew.
/// The jobs_inflight unique index is the arbiter, so two submitters
/// racing from separate processes both resolve to the same job id.
pub fn submit(conn: &Connection, config: &Config, request: &SubmitRequest) -> Result<SubmitOutcome> {
    if request.url.trim().is_empty() {
        return Err(TaktError::InvalidArgument("url must not be empty".to_string()));
    }
    validate_clip(request.clip_start_secs, request.clip_end_secs)?;

    let quality = request
        .quality
        .clone()
        .unwrap_or_else(|| config.default_quality.clone());
    if quality_format(&quality).is_none() {
        return Err(TaktError::InvalidArgument(format!(
            "unknown quality profile '{}'",
            quality
        )));
    }

    let tx = conn.unchecked_transaction()?;

    let profile = store::require_profile(&tx, request.profile_id)?;
    for &group_id in &request.group_ids {
        let group = store::require_group(&tx, group_id)?;
        if group.profile_id != profile.id {
            return Err(TaktError::Conflict(format!(
                "group '{}' belongs to a different profile",
                group.name
            )));
        }
    }

    let key = clip_key(request.clip_start_secs, request.clip_end_secs);

    let payload = JobPayload {
        quality,
        title: request.title.clone(),
        tags: request.tags.clone(),
        group_ids: request.group_ids.clone(),
    };

    let job_id = match schema::insert_job(
        &tx,
        &NewJob {
            url: request.url.clone(),
            clip_start_secs: request.clip_start_secs,
            clip_end_secs: request.clip_end_secs,
            clip_key: key.clone(),
            profile_id: request.profile_id,
            payload: serde_json::to_string(&payload)?,
        },
    ) {
        Ok(id) => id,
        Err(e) if is_constraint_violation(&e) => {
            // An equivalent job is already in flight (possibly inserted
            // by a concurrent submitter); resolve to it.
            match find_inflight(&tx, &request.url, &key)? {
                Some(job_id) => {
                    tx.commit()?;
                    log::info!("Deduplicated submission onto in-flight job {}", job_id);
                    return Ok(SubmitOutcome {
                        job_id,
                        deduplicated: true,
                    });
                }
                None => return Err(e),
            }
        }
        Err(e) => return Err(e),
    };
    tx.commit()?;

    log::info!("Queued job {} for {}", job_id, request.url);
    Ok(SubmitOutcome {
        job_id,
        deduplicated: false,
    })
}

/// Atomically claim the oldest queued job, moving it to downloading
/// with a fresh run token. Returns None when the queue is empty.
pub fn claim_next(conn: &Connection, worker: &str) -> Result<Option<Job>> {
    let run_token = uuid::Uuid::new_v4().to_string();
    let sql = format!(
        "UPDATE jobs
         SET state = 'downloading', claimed_by = ?1, run_token = ?2,
             updated_at = datetime('now')
         WHERE id = (SELECT id FROM jobs WHERE state = 'queued'
                     ORDER BY created_at ASC, id ASC LIMIT 1)
         RETURNING {}",
        JOB_COLUMNS
    );
    let job = conn
        .query_row(&sql, params![worker, run_token], schema::map_job)
        .optional()?;
    Ok(job)
}

/// Move a claimed job to the next pipeline state. Returns false when
/// the job is no longer ours (cancelled, recovered, or finished).
pub fn advance_state(conn: &Connection, job_id: i64, run_token: &str, state: JobState) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE jobs SET state = ?1, updated_at = datetime('now')
         WHERE id = ?2 AND run_token = ?3
           AND state IN ('downloading', 'trimming', 'indexing')",
        params![state.as_str(), job_id, run_token],
    )?;
    Ok(changed > 0)
}

/// Record one failed download attempt without changing state.
pub fn record_attempt(conn: &Connection, job_id: i64, run_token: &str, error: &str) -> Result<()> {
    conn.execute(
        "UPDATE jobs SET attempts = attempts + 1, last_error = ?1,
             updated_at = datetime('now')
         WHERE id = ?2 AND run_token = ?3",
        params![error, job_id, run_token],
    )?;
    Ok(())
}

pub fn complete_job(conn: &Connection, job_id: i64, run_token: &str, video_id: i64) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE jobs SET state = 'completed', video_id = ?1, last_error = NULL,
             updated_at = datetime('now'), completed_at = datetime('now')
         WHERE id = ?2 AND run_token = ?3
           AND state IN ('downloading', 'trimming', 'indexing')",
        params![video_id, job_id, run_token],
    )?;
    Ok(changed > 0)
}

pub fn fail_job(conn: &Connection, job_id: i64, run_token: &str, error: &str) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE jobs SET state = 'failed', last_error = ?1,
             updated_at = datetime('now'), completed_at = datetime('now')
         WHERE id = ?2 AND run_token = ?3
           AND state IN ('downloading', 'trimming', 'indexing')",
        params![error, job_id, run_token],
    )?;
    Ok(changed > 0)
}

/// Engine-side transition after observing the cancel flag.
pub fn mark_cancelled(conn: &Connection, job_id: i64, run_token: &str) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE jobs SET state = 'cancelled',
             updated_at = datetime('now'), completed_at = datetime('now')
         WHERE id = ?1 AND run_token = ?2
           AND state IN ('downloading', 'trimming', 'indexing')",
        params![job_id, run_token],
    )?;
    Ok(changed > 0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The row was flipped to cancelled directly (queued, or active with
    /// no cancel flag registered in this process).
    Cancelled,
    /// Job is running here; the worker will observe the flag and stop.
    Requested,
}

/// User-facing cancellation. Queued jobs flip straight to cancelled;
/// running jobs get their in-process cancel flag set. Terminal jobs
/// are immutable.
pub fn cancel_job(conn: &Connection, job_id: i64) -> Result<CancelOutcome> {
    let tx = conn.unchecked_transaction()?;
    let job = schema::get_job(&tx, job_id)?
        .ok_or_else(|| TaktError::NotFound(format!("job {}", job_id)))?;

    match job.state {
        JobState::Queued => {
            tx.execute(
                "UPDATE jobs SET state = 'cancelled',
                     updated_at = datetime('now'), completed_at = datetime('now')
                 WHERE id = ?1 AND state = 'queued'",
                params![job_id],
            )?;
            tx.commit()?;
            log::info!("Cancelled queued job {}", job_id);
            Ok(CancelOutcome::Cancelled)
        }
        state if state.is_active() => {
            if request_cancel(job_id) {
                tx.commit()?;
                log::info!("Requested cancellation of running job {}", job_id);
                Ok(CancelOutcome::Requested)
            } else {
                // No worker in this process holds the job: either a
                // crashed run left it behind, or a worker in another
                // process owns it. Flip the row now; a live worker
                // observes the cancelled state at its next transition
                // and cleans up its own staging.
                tx.execute(
                    "UPDATE jobs SET state = 'cancelled',
                         updated_at = datetime('now'), completed_at = datetime('now')
                     WHERE id = ?1 AND state IN ('downloading', 'trimming', 'indexing')",
                    params![job_id],
                )?;
                tx.commit()?;
                log::info!("Cancelled orphaned job {}", job_id);
                Ok(CancelOutcome::Cancelled)
            }
        }
        state => Err(TaktError::Conflict(format!(
            "job {} is already {}",
            job_id, state
        ))),
    }
}

/// Requeue jobs a dead worker left in an active state. Attempt counts
/// are preserved so retry budgets survive the crash.
pub fn recover_interrupted(conn: &Connection) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare(
        "UPDATE jobs SET state = 'queued', claimed_by = NULL, run_token = NULL,
             updated_at = datetime('now')
         WHERE state IN ('downloading', 'trimming', 'indexing')
         RETURNING id",
    )?;
    let ids: Vec<i64> = stmt
        .query_map([], |row| row.get(0))?
        .collect::<std::result::Result<_, _>>()?;
    if !ids.is_empty() {
        log::warn!("Requeued {} interrupted job(s): {:?}", ids.len(), ids);
    }
    Ok(ids)
}

/// Delete terminal jobs older than the retention window.
pub fn prune_terminal(conn: &Connection, retention_days: i64) -> Result<usize> {
    let cutoff = format!("-{} days", retention_days.max(0));
    let removed = conn.execute(
        "DELETE FROM jobs
         WHERE state IN ('completed', 'failed', 'cancelled')
           AND COALESCE(completed_at, updated_at) < datetime('now', ?1)",
        params![cutoff],
    )?;
    Ok(removed)
}

// ----- Cancel flag registry -----
//
// In-process flags shared between the CLI-facing cancel path and the
// worker threads polling their subprocesses.

static CANCEL_FLAGS: LazyLock<Mutex<HashMap<i64, Arc<AtomicBool>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Register (or fetch) the cancel flag for a job.
pub fn cancel_flag(job_id: i64) -> Arc<AtomicBool> {
    let mut flags = CANCEL_FLAGS.lock().unwrap_or_else(|e| e.into_inner());
    flags
        .entry(job_id)
        .or_insert_with(|| Arc::new(AtomicBool::new(false)))
        .clone()
}

/// Set the cancel flag for a job. Returns false when no worker has
/// registered it (job not running in this process).
pub fn request_cancel(job_id: i64) -> bool {
    let flags = CANCEL_FLAGS.lock().unwrap_or_else(|e| e.into_inner());
    match flags.get(&job_id) {
        Some(flag) => {
            flag.store(true, Ordering::SeqCst);
            true
        }
        None => false,
    }
}

/// Drop the flag once the job reaches a terminal state.
pub fn clear_cancel_flag(job_id: i64) {
    let mut flags = CANCEL_FLAGS.lock().unwrap_or_else(|e| e.into_inner());
    flags.remove(&job_id);
}
