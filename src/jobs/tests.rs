use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use rusqlite::Connection;
use tempfile::TempDir;

use crate::adapters::testing::{DownloadScript, FakeDownloader, FakeTrimmer};
use crate::config::{Config, DownloadConfig};
use crate::db::{self, schema};
use crate::db::schema::JobState;
use crate::error::TaktError;
use crate::jobs::*;
use crate::store;

fn setup() -> (TempDir, Connection) {
    let tmp = TempDir::new().unwrap();
    db::init_library_folders(tmp.path()).unwrap();
    let conn = db::open_db(&db::get_db_path(tmp.path())).unwrap();
    (tmp, conn)
}

fn make_profile(conn: &Connection) -> i64 {
    store::create_profile(conn, "archive").unwrap().id
}

fn request(url: &str, profile_id: i64) -> SubmitRequest {
    SubmitRequest {
        url: url.to_string(),
        profile_id,
        clip_start_secs: None,
        clip_end_secs: None,
        quality: None,
        title: Some("a title".to_string()),
        tags: Vec::new(),
        group_ids: Vec::new(),
    }
}

fn test_config() -> Config {
    Config {
        max_concurrent_downloads: 1,
        download: DownloadConfig {
            timeout_secs: 30,
            max_retries: 3,
            retry_backoff_secs: 0,
        },
        keep_raw_on_trim_failure: false,
        default_quality: "best".to_string(),
        job_retention_days: 30,
    }
}

fn engine_with(
    root: &std::path::Path,
    config: Config,
    script: Vec<DownloadScript>,
    trimmer: FakeTrimmer,
) -> (JobEngine, Arc<FakeDownloader>, Arc<FakeTrimmer>) {
    let downloader = Arc::new(FakeDownloader::new(script));
    let trimmer = Arc::new(trimmer);
    let engine = JobEngine::new(root, config, downloader.clone(), trimmer.clone());
    (engine, downloader, trimmer)
}

// ----- queue operations -----

#[test]
fn test_clip_key_normalization() {
    assert_eq!(clip_key(None, None), "full");
    assert_eq!(clip_key(Some(12.5), Some(30.0)), "12.5-30");
    assert_eq!(clip_key(Some(12.500), Some(30.0)), "12.5-30");
    assert_eq!(clip_key(None, Some(30.0)), "-30");
    assert_eq!(clip_key(Some(0.0), None), "0-");
}

#[test]
fn test_submit_validation() {
    let (_tmp, conn) = setup();
    let profile_id = make_profile(&conn);

    let mut r = request("  ", profile_id);
    assert!(matches!(submit(&conn, &test_config(), &r), Err(TaktError::InvalidArgument(_))));

    r = request("https://example.com/v", profile_id);
    r.clip_start_secs = Some(20.0);
    r.clip_end_secs = Some(10.0);
    assert!(matches!(submit(&conn, &test_config(), &r), Err(TaktError::InvalidArgument(_))));

    r = request("https://example.com/v", profile_id);
    r.quality = Some("4k_hdr".to_string());
    assert!(matches!(submit(&conn, &test_config(), &r), Err(TaktError::InvalidArgument(_))));

    r = request("https://example.com/v", 999);
    assert!(matches!(submit(&conn, &test_config(), &r), Err(TaktError::NotFound(_))));
}

#[test]
fn test_submit_quality_defaults_from_config() {
    let (_tmp, conn) = setup();
    let profile_id = make_profile(&conn);

    let mut config = test_config();
    config.default_quality = "720p".to_string();

    let outcome = submit(&conn, &config, &request("https://example.com/a", profile_id)).unwrap();
    let job = schema::get_job(&conn, outcome.job_id).unwrap().unwrap();
    let payload: JobPayload = serde_json::from_str(&job.payload).unwrap();
    assert_eq!(payload.quality, "720p");

    // An explicit quality on the request still wins
    let mut r = request("https://example.com/b", profile_id);
    r.quality = Some("audio_best".to_string());
    let outcome = submit(&conn, &config, &r).unwrap();
    let job = schema::get_job(&conn, outcome.job_id).unwrap().unwrap();
    let payload: JobPayload = serde_json::from_str(&job.payload).unwrap();
    assert_eq!(payload.quality, "audio_best");

    // A config default naming no known profile is rejected
    config.default_quality = "8k".to_string();
    assert!(matches!(
        submit(&conn, &config, &request("https://example.com/c", profile_id)),
        Err(TaktError::InvalidArgument(_))
    ));
}

#[test]
fn test_submit_dedups_in_flight() {
    let (_tmp, conn) = setup();
    let profile_id = make_profile(&conn);

    let first = submit(&conn, &test_config(), &request("https://example.com/v", profile_id)).unwrap();
    assert!(!first.deduplicated);

    let second = submit(&conn, &test_config(), &request("https://example.com/v", profile_id)).unwrap();
    assert!(second.deduplicated);
    assert_eq!(second.job_id, first.job_id);

    // A different clip of the same url is a distinct job
    let mut clipped = request("https://example.com/v", profile_id);
    clipped.clip_start_secs = Some(5.0);
    clipped.clip_end_secs = Some(10.0);
    let third = submit(&conn, &test_config(), &clipped).unwrap();
    assert!(!third.deduplicated);
    assert_ne!(third.job_id, first.job_id);
}

#[test]
fn test_resubmit_after_terminal() {
    let (_tmp, conn) = setup();
    let profile_id = make_profile(&conn);

    let first = submit(&conn, &test_config(), &request("https://example.com/v", profile_id)).unwrap();
    assert_eq!(cancel_job(&conn, first.job_id).unwrap(), CancelOutcome::Cancelled);

    let second = submit(&conn, &test_config(), &request("https://example.com/v", profile_id)).unwrap();
    assert!(!second.deduplicated);
    assert_ne!(second.job_id, first.job_id);
}

#[test]
fn test_claim_fifo_order() {
    let (_tmp, conn) = setup();
    let profile_id = make_profile(&conn);

    let a = submit(&conn, &test_config(), &request("https://example.com/a", profile_id)).unwrap();
    let b = submit(&conn, &test_config(), &request("https://example.com/b", profile_id)).unwrap();

    let first = claim_next(&conn, "w1").unwrap().unwrap();
    assert_eq!(first.id, a.job_id);
    assert_eq!(first.state, JobState::Downloading);
    assert_eq!(first.claimed_by.as_deref(), Some("w1"));
    assert!(first.run_token.is_some());

    let second = claim_next(&conn, "w1").unwrap().unwrap();
    assert_eq!(second.id, b.job_id);

    assert!(claim_next(&conn, "w1").unwrap().is_none());
}

#[test]
fn test_cancel_job_claimed_by_another_process() {
    let (_tmp, conn) = setup();
    let profile_id = make_profile(&conn);

    let outcome = submit(&conn, &test_config(), &request("https://example.com/v", profile_id)).unwrap();
    // Claimed by a worker that registered no cancel flag here, as if it
    // lives in another process.
    let job = claim_next(&conn, "otherhost:4242").unwrap().unwrap();
    let token = job.run_token.unwrap();

    assert_eq!(cancel_job(&conn, outcome.job_id).unwrap(), CancelOutcome::Cancelled);

    let reloaded = schema::get_job(&conn, outcome.job_id).unwrap().unwrap();
    assert_eq!(reloaded.state, JobState::Cancelled);

    // The remote worker's next transition fails against the flipped row
    assert!(!advance_state(&conn, job.id, &token, JobState::Trimming).unwrap());
    assert!(!complete_job(&conn, job.id, &token, 1).unwrap());
}

#[test]
fn test_terminal_jobs_are_immutable() {
    let (_tmp, conn) = setup();
    let profile_id = make_profile(&conn);

    submit(&conn, &test_config(), &request("https://example.com/v", profile_id)).unwrap();
    let job = claim_next(&conn, "w1").unwrap().unwrap();
    let token = job.run_token.unwrap();

    assert!(fail_job(&conn, job.id, &token, "boom").unwrap());

    // No transition out of failed
    assert!(!complete_job(&conn, job.id, &token, 1).unwrap());
    assert!(!mark_cancelled(&conn, job.id, &token).unwrap());
    assert!(matches!(cancel_job(&conn, job.id), Err(TaktError::Conflict(_))));

    let reloaded = schema::get_job(&conn, job.id).unwrap().unwrap();
    assert_eq!(reloaded.state, JobState::Failed);
}

#[test]
fn test_recover_requeues_preserving_attempts() {
    let (_tmp, conn) = setup();
    let profile_id = make_profile(&conn);

    submit(&conn, &test_config(), &request("https://example.com/v", profile_id)).unwrap();
    let job = claim_next(&conn, "w1").unwrap().unwrap();
    let token = job.run_token.unwrap();
    record_attempt(&conn, job.id, &token, "net down").unwrap();
    record_attempt(&conn, job.id, &token, "net down").unwrap();

    let requeued = recover_interrupted(&conn).unwrap();
    assert_eq!(requeued, vec![job.id]);

    let reloaded = schema::get_job(&conn, job.id).unwrap().unwrap();
    assert_eq!(reloaded.state, JobState::Queued);
    assert_eq!(reloaded.attempts, 2);
    assert!(reloaded.run_token.is_none());
    assert!(reloaded.claimed_by.is_none());

    // The stale token no longer moves the job
    assert!(!fail_job(&conn, job.id, &token, "late").unwrap());
}

#[test]
fn test_prune_terminal_respects_retention() {
    let (_tmp, conn) = setup();
    let profile_id = make_profile(&conn);

    let old = submit(&conn, &test_config(), &request("https://example.com/old", profile_id)).unwrap();
    let job = claim_next(&conn, "w1").unwrap().unwrap();
    fail_job(&conn, job.id, &job.run_token.unwrap(), "boom").unwrap();
    conn.execute(
        "UPDATE jobs SET completed_at = datetime('now', '-40 days') WHERE id = ?1",
        rusqlite::params![old.job_id],
    )
    .unwrap();

    let fresh = submit(&conn, &test_config(), &request("https://example.com/new", profile_id)).unwrap();

    assert_eq!(prune_terminal(&conn, 30).unwrap(), 1);
    assert!(schema::get_job(&conn, old.job_id).unwrap().is_none());
    assert!(schema::get_job(&conn, fresh.job_id).unwrap().is_some());
}

// ----- engine pipeline -----

#[test]
fn test_engine_completes_full_download() {
    let (tmp, conn) = setup();
    let profile_id = make_profile(&conn);

    let mut r = request("https://example.com/v", profile_id);
    r.title = None; // force a metadata fetch for the title
    r.tags = vec!["news".to_string()];
    let outcome = submit(&conn, &test_config(), &r).unwrap();

    let (engine, downloader, _trimmer) = engine_with(
        tmp.path(),
        test_config(),
        vec![DownloadScript::Succeed {
            content: b"full video".to_vec(),
            duration: 120.0,
        }],
        FakeTrimmer::new(),
    );
    let summary = engine.drain().unwrap();
    assert_eq!(summary.completed, 1);
    assert_eq!(downloader.call_count(), 1);

    let job = schema::get_job(&conn, outcome.job_id).unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert!(job.completed_at.is_some());

    let video = store::require_video(&conn, job.video_id.unwrap()).unwrap();
    assert_eq!(video.title, "fetched title");
    assert_eq!(video.source_url, "https://example.com/v");
    assert_eq!(video.duration_secs, Some(120.0));
    assert!(video.clip_start_secs.is_none());
    assert_eq!(video.tag_ids.len(), 1);
    assert!(tmp.path().join(&video.file_path).exists());

    // Staging cleaned up
    assert!(!db::get_staging_path(tmp.path(), job.id).exists());
}

#[test]
fn test_engine_retries_transient_failures() {
    let (tmp, conn) = setup();
    let profile_id = make_profile(&conn);
    let outcome = submit(&conn, &test_config(), &request("https://example.com/v", profile_id)).unwrap();

    let (engine, downloader, _trimmer) = engine_with(
        tmp.path(),
        test_config(),
        vec![
            DownloadScript::Transient("HTTP Error 429".to_string()),
            DownloadScript::Succeed {
                content: b"eventually".to_vec(),
                duration: 60.0,
            },
        ],
        FakeTrimmer::new(),
    );
    let summary = engine.drain().unwrap();
    assert_eq!(summary.completed, 1);
    assert_eq!(downloader.call_count(), 2);

    let job = schema::get_job(&conn, outcome.job_id).unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempts, 1);
}

#[test]
fn test_engine_permanent_failure_is_not_retried() {
    let (tmp, conn) = setup();
    let profile_id = make_profile(&conn);
    let outcome = submit(&conn, &test_config(), &request("https://example.com/v", profile_id)).unwrap();

    let (engine, downloader, _trimmer) = engine_with(
        tmp.path(),
        test_config(),
        vec![DownloadScript::Permanent("Private video".to_string())],
        FakeTrimmer::new(),
    );
    let summary = engine.drain().unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(downloader.call_count(), 1);

    let job = schema::get_job(&conn, outcome.job_id).unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts, 1);
    assert!(job.last_error.unwrap().contains("Private video"));
}

#[test]
fn test_engine_exhausts_transient_retries() {
    let (tmp, conn) = setup();
    let profile_id = make_profile(&conn);
    let outcome = submit(&conn, &test_config(), &request("https://example.com/v", profile_id)).unwrap();

    let (engine, downloader, _trimmer) = engine_with(
        tmp.path(),
        test_config(),
        vec![
            DownloadScript::Transient("timeout".to_string()),
            DownloadScript::Transient("timeout".to_string()),
            DownloadScript::Transient("timeout".to_string()),
        ],
        FakeTrimmer::new(),
    );
    let summary = engine.drain().unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(downloader.call_count(), 3);

    let job = schema::get_job(&conn, outcome.job_id).unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts, 3);
}

#[test]
fn test_engine_trims_requested_clip() {
    let (tmp, conn) = setup();
    let profile_id = make_profile(&conn);

    let mut r = request("https://example.com/v", profile_id);
    r.clip_start_secs = Some(10.0);
    r.clip_end_secs = Some(40.0);
    let outcome = submit(&conn, &test_config(), &r).unwrap();

    let (engine, _downloader, trimmer) = engine_with(
        tmp.path(),
        test_config(),
        vec![DownloadScript::Succeed {
            content: b"raw media".to_vec(),
            duration: 120.0,
        }],
        FakeTrimmer::new(),
    );
    let summary = engine.drain().unwrap();
    assert_eq!(summary.completed, 1);
    assert_eq!(trimmer.call_count(), 1);

    let job = schema::get_job(&conn, outcome.job_id).unwrap().unwrap();
    let video = store::require_video(&conn, job.video_id.unwrap()).unwrap();
    assert_eq!(video.clip_start_secs, Some(10.0));
    assert_eq!(video.clip_end_secs, Some(40.0));
    assert_eq!(video.duration_secs, Some(30.0));

    let blob = std::fs::read(tmp.path().join(&video.file_path)).unwrap();
    assert!(blob.ends_with(b":trimmed:10.000-40.000"));
}

#[test]
fn test_engine_rejects_out_of_bounds_clip() {
    let (tmp, conn) = setup();
    let profile_id = make_profile(&conn);

    let mut r = request("https://example.com/v", profile_id);
    r.clip_start_secs = Some(10.0);
    r.clip_end_secs = Some(500.0);
    let outcome = submit(&conn, &test_config(), &r).unwrap();

    let (engine, _downloader, trimmer) = engine_with(
        tmp.path(),
        test_config(),
        vec![DownloadScript::Succeed {
            content: b"raw media".to_vec(),
            duration: 120.0,
        }],
        FakeTrimmer::new(),
    );
    let summary = engine.drain().unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(trimmer.call_count(), 0);

    let job = schema::get_job(&conn, outcome.job_id).unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert!(job.last_error.unwrap().contains("beyond media duration"));
}

#[test]
fn test_engine_trim_failure_fails_job() {
    let (tmp, conn) = setup();
    let profile_id = make_profile(&conn);

    let mut r = request("https://example.com/v", profile_id);
    r.clip_start_secs = Some(1.0);
    r.clip_end_secs = Some(2.0);
    let outcome = submit(&conn, &test_config(), &r).unwrap();

    let (engine, _downloader, _trimmer) = engine_with(
        tmp.path(),
        test_config(),
        vec![DownloadScript::Succeed {
            content: b"raw media".to_vec(),
            duration: 120.0,
        }],
        FakeTrimmer::failing(),
    );
    let summary = engine.drain().unwrap();
    assert_eq!(summary.failed, 1);

    let job = schema::get_job(&conn, outcome.job_id).unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);

    // Nothing indexed, no blob left behind
    assert!(schema::list_artifacts(&conn).unwrap().is_empty());
}

#[test]
fn test_engine_trim_failure_keeps_raw_when_configured() {
    let (tmp, conn) = setup();
    let profile_id = make_profile(&conn);

    let mut r = request("https://example.com/v", profile_id);
    r.clip_start_secs = Some(1.0);
    r.clip_end_secs = Some(2.0);
    let outcome = submit(&conn, &test_config(), &r).unwrap();

    let mut config = test_config();
    config.keep_raw_on_trim_failure = true;
    let (engine, _downloader, _trimmer) = engine_with(
        tmp.path(),
        config,
        vec![DownloadScript::Succeed {
            content: b"raw media".to_vec(),
            duration: 120.0,
        }],
        FakeTrimmer::failing(),
    );
    let summary = engine.drain().unwrap();
    assert_eq!(summary.completed, 1);

    let job = schema::get_job(&conn, outcome.job_id).unwrap().unwrap();
    let video = store::require_video(&conn, job.video_id.unwrap()).unwrap();
    // Raw archive: no clip metadata, full duration
    assert!(video.clip_start_secs.is_none());
    assert!(video.clip_end_secs.is_none());
    assert_eq!(video.duration_secs, Some(120.0));
    assert_eq!(
        std::fs::read(tmp.path().join(&video.file_path)).unwrap(),
        b"raw media"
    );
}

#[test]
fn test_engine_rolls_back_artifact_on_indexing_failure() {
    let (tmp, conn) = setup();
    let profile_id = make_profile(&conn);
    let outcome = submit(&conn, &test_config(), &request("https://example.com/v", profile_id)).unwrap();

    // Profile disappears while the job is queued; indexing must fail
    // and release the stored blob.
    store::delete_profile(&conn, profile_id).unwrap();

    let (engine, _downloader, _trimmer) = engine_with(
        tmp.path(),
        test_config(),
        vec![DownloadScript::Succeed {
            content: b"doomed".to_vec(),
            duration: 10.0,
        }],
        FakeTrimmer::new(),
    );
    let summary = engine.drain().unwrap();
    assert_eq!(summary.failed, 1);

    let job = schema::get_job(&conn, outcome.job_id).unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert!(schema::list_artifacts(&conn).unwrap().is_empty());

    let blob_files = walkdir::WalkDir::new(db::get_blobs_path(tmp.path()))
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .count();
    assert_eq!(blob_files, 0);
}

#[test]
fn test_engine_dedups_identical_content_across_jobs() {
    let (tmp, conn) = setup();
    let profile_id = make_profile(&conn);

    let a = submit(&conn, &test_config(), &request("https://example.com/a", profile_id)).unwrap();
    let b = submit(&conn, &test_config(), &request("https://example.com/b", profile_id)).unwrap();

    let (engine, _downloader, _trimmer) = engine_with(
        tmp.path(),
        test_config(),
        vec![
            DownloadScript::Succeed {
                content: b"same bytes".to_vec(),
                duration: 10.0,
            },
            DownloadScript::Succeed {
                content: b"same bytes".to_vec(),
                duration: 10.0,
            },
        ],
        FakeTrimmer::new(),
    );
    let summary = engine.drain().unwrap();
    assert_eq!(summary.completed, 2);

    let job_a = schema::get_job(&conn, a.job_id).unwrap().unwrap();
    let job_b = schema::get_job(&conn, b.job_id).unwrap().unwrap();
    let video_a = store::require_video(&conn, job_a.video_id.unwrap()).unwrap();
    let video_b = store::require_video(&conn, job_b.video_id.unwrap()).unwrap();

    assert_eq!(video_a.fingerprint, video_b.fingerprint);
    let artifacts = schema::list_artifacts(&conn).unwrap();
    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[0].refcount, 2);
}

#[test]
fn test_engine_cancel_during_download() {
    let (tmp, conn) = setup();
    let profile_id = make_profile(&conn);

    let outcome = submit(&conn, &test_config(), &request("https://example.com/v", profile_id)).unwrap();
    // Give the job an id that can't collide with other tests sharing the
    // process-wide cancel flag registry.
    let job_id: i64 = 770_077;
    conn.execute(
        "UPDATE jobs SET id = ?1 WHERE id = ?2",
        rusqlite::params![job_id, outcome.job_id],
    )
    .unwrap();

    let started = Arc::new(AtomicBool::new(false));
    let (engine, _downloader, _trimmer) = engine_with(
        tmp.path(),
        test_config(),
        vec![DownloadScript::BlockUntilCancelled {
            started: started.clone(),
        }],
        FakeTrimmer::new(),
    );

    let handle = std::thread::spawn(move || engine.drain());

    for _ in 0..1000 {
        if started.load(std::sync::atomic::Ordering::SeqCst) {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
    assert!(started.load(std::sync::atomic::Ordering::SeqCst), "worker never started");

    assert_eq!(cancel_job(&conn, job_id).unwrap(), CancelOutcome::Requested);

    let summary = handle.join().unwrap().unwrap();
    assert_eq!(summary.cancelled, 1);

    let job = schema::get_job(&conn, job_id).unwrap().unwrap();
    assert_eq!(job.state, JobState::Cancelled);
    assert!(job.completed_at.is_some());
    assert!(!db::get_staging_path(tmp.path(), job_id).exists());
}
