// Metadata store
//
// Contract-level operations over the schema helpers: uniqueness and
// referential integrity checks, per-video mutual exclusion, and atomic
// single-video mutations. All multi-row writes for one video happen in
// one transaction; a crash mid-update never leaves partial tag/group
// associations.

pub mod bulk;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, TryLockError};
use std::time::{Duration, Instant};

use rusqlite::Connection;

use crate::artifacts::ArtifactStore;
use crate::constants::{VIDEO_LOCK_POLL_INTERVAL_MS, VIDEO_LOCK_TIMEOUT_MS};
use crate::db::schema::{self, Group, NewVideo, Profile, Tag, Video};
use crate::error::{Result, TaktError};

/// Per-video lock registry. Single edits, bulk edits, and deletes for the
/// same video id serialize here; edits to different videos do not.
static VIDEO_LOCKS: std::sync::LazyLock<Mutex<HashMap<i64, Arc<Mutex<()>>>>> =
    std::sync::LazyLock::new(|| Mutex::new(HashMap::new()));

fn video_lock(video_id: i64) -> Arc<Mutex<()>> {
    let mut locks = VIDEO_LOCKS.lock().unwrap_or_else(|e| e.into_inner());
    Arc::clone(locks.entry(video_id).or_default())
}

/// Run `f` holding the per-video lock, waiting up to the configured
/// timeout before failing with a concurrency error.
pub fn with_video_lock<T>(video_id: i64, f: impl FnOnce() -> Result<T>) -> Result<T> {
    let lock = video_lock(video_id);
    let deadline = Instant::now() + Duration::from_millis(VIDEO_LOCK_TIMEOUT_MS);
    loop {
        match lock.try_lock() {
            Ok(_guard) => return f(),
            Err(TryLockError::WouldBlock) => {
                if Instant::now() >= deadline {
                    return Err(TaktError::Concurrency(format!(
                        "timed out waiting for edit lock on video {}",
                        video_id
                    )));
                }
                std::thread::sleep(Duration::from_millis(VIDEO_LOCK_POLL_INTERVAL_MS));
            }
            Err(TryLockError::Poisoned(_)) => {
                return Err(TaktError::Concurrency(format!(
                    "edit lock poisoned for video {}",
                    video_id
                )));
            }
        }
    }
}

/// Map a SQLite UNIQUE violation to a ConflictError.
fn map_unique(err: TaktError, what: impl Into<String>) -> TaktError {
    match err {
        TaktError::Database(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            TaktError::Conflict(what.into())
        }
        other => other,
    }
}

// ----- Profiles -----

pub fn create_profile(conn: &Connection, name: &str) -> Result<Profile> {
    let id = schema::insert_profile(conn, name)
        .map_err(|e| map_unique(e, format!("profile name '{}' already exists", name)))?;
    schema::get_profile(conn, id)?
        .ok_or_else(|| TaktError::NotFound(format!("profile {}", id)))
}

pub fn require_profile(conn: &Connection, id: i64) -> Result<Profile> {
    schema::get_profile(conn, id)?
        .ok_or_else(|| TaktError::NotFound(format!("profile {}", id)))
}

/// Deleting a profile that still owns videos is rejected; callers must
/// reassign or delete the videos first. The profile's (necessarily
/// unused) groups are removed with it.
pub fn delete_profile(conn: &Connection, id: i64) -> Result<()> {
    require_profile(conn, id)?;

    let owned = schema::count_profile_videos(conn, id)?;
    if owned > 0 {
        return Err(TaktError::Conflict(format!(
            "profile {} owns {} videos; reassign or delete them first",
            id, owned
        )));
    }

    let tx = conn.unchecked_transaction()?;
    for group in schema::list_groups(&tx, id)? {
        schema::delete_group_row(&tx, group.id)?;
    }
    schema::delete_profile_row(&tx, id)?;
    tx.commit()?;
    Ok(())
}

// ----- Groups -----

pub fn create_group(conn: &Connection, profile_id: i64, name: &str) -> Result<Group> {
    require_profile(conn, profile_id)?;
    let id = schema::insert_group(conn, profile_id, name).map_err(|e| {
        map_unique(
            e,
            format!("group '{}' already exists in profile {}", name, profile_id),
        )
    })?;
    schema::get_group(conn, id)?.ok_or_else(|| TaktError::NotFound(format!("group {}", id)))
}

pub fn require_group(conn: &Connection, id: i64) -> Result<Group> {
    schema::get_group(conn, id)?.ok_or_else(|| TaktError::NotFound(format!("group {}", id)))
}

pub fn delete_group(conn: &Connection, id: i64) -> Result<()> {
    require_group(conn, id)?;
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM video_groups WHERE group_id = ?1", [id])?;
    schema::delete_group_row(&tx, id)?;
    tx.commit()?;
    Ok(())
}

// ----- Tags -----

pub fn create_tag(conn: &Connection, name: &str) -> Result<Tag> {
    let id = schema::insert_tag(conn, name)
        .map_err(|e| map_unique(e, format!("tag name '{}' already exists", name)))?;
    schema::get_tag(conn, id)?.ok_or_else(|| TaktError::NotFound(format!("tag {}", id)))
}

pub fn require_tag(conn: &Connection, id: i64) -> Result<Tag> {
    schema::get_tag(conn, id)?.ok_or_else(|| TaktError::NotFound(format!("tag {}", id)))
}

/// Get a tag by name, creating it if missing.
pub fn get_or_create_tag(conn: &Connection, name: &str) -> Result<Tag> {
    if let Some(tag) = schema::get_tag_by_name(conn, name)? {
        return Ok(tag);
    }
    create_tag(conn, name)
}

pub fn delete_tag(conn: &Connection, id: i64) -> Result<()> {
    require_tag(conn, id)?;
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM video_tags WHERE tag_id = ?1", [id])?;
    schema::delete_tag_row(&tx, id)?;
    tx.commit()?;
    Ok(())
}

// ----- Videos -----

/// Create a video with its initial tag/group associations in one
/// transaction. Called by the job engine at indexing time and never
/// partially visible.
pub fn create_video(
    conn: &Connection,
    video: &NewVideo,
    tag_ids: &[i64],
    group_ids: &[i64],
) -> Result<Video> {
    require_profile(conn, video.profile_id)?;
    for tag_id in tag_ids {
        require_tag(conn, *tag_id)?;
    }
    for group_id in group_ids {
        let group = require_group(conn, *group_id)?;
        if group.profile_id != video.profile_id {
            return Err(TaktError::Conflict(format!(
                "group {} belongs to profile {}, not {}",
                group.id, group.profile_id, video.profile_id
            )));
        }
    }

    let tx = conn.unchecked_transaction()?;
    let id = schema::insert_video(&tx, video)?;
    for tag_id in tag_ids {
        schema::add_video_tag(&tx, id, *tag_id)?;
    }
    for group_id in group_ids {
        schema::add_video_group(&tx, id, *group_id)?;
    }
    tx.commit()?;

    schema::get_video(conn, id)?.ok_or_else(|| TaktError::NotFound(format!("video {}", id)))
}

pub fn require_video(conn: &Connection, id: i64) -> Result<Video> {
    schema::get_video(conn, id)?.ok_or_else(|| TaktError::NotFound(format!("video {}", id)))
}

/// A partial update applied atomically to one video.
#[derive(Debug, Clone, Default)]
pub struct VideoPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    /// `complete` or `archived`.
    pub status: Option<String>,
    pub set_profile: Option<i64>,
    pub add_tags: Vec<i64>,
    pub remove_tags: Vec<i64>,
    pub add_groups: Vec<i64>,
    pub remove_groups: Vec<i64>,
}

impl VideoPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.status.is_none()
            && self.set_profile.is_none()
            && self.add_tags.is_empty()
            && self.remove_tags.is_empty()
            && self.add_groups.is_empty()
            && self.remove_groups.is_empty()
    }
}

/// Apply a patch under the per-video lock. Field updates, profile moves,
/// and association changes commit together or not at all.
pub fn update_video(conn: &Connection, id: i64, patch: &VideoPatch) -> Result<Video> {
    with_video_lock(id, || update_video_locked(conn, id, patch))
}

fn update_video_locked(conn: &Connection, id: i64, patch: &VideoPatch) -> Result<Video> {
    let video = require_video(conn, id)?;

    let target_profile = match patch.set_profile {
        Some(pid) => {
            require_profile(conn, pid)?;
            pid
        }
        None => video.profile_id,
    };

    if let Some(ref status) = patch.status {
        if status != "complete" && status != "archived" && status != "failed" {
            return Err(TaktError::InvalidArgument(format!(
                "invalid video status '{}'",
                status
            )));
        }
    }

    // Validate references before opening the write transaction
    for tag_id in patch.add_tags.iter().chain(&patch.remove_tags) {
        require_tag(conn, *tag_id)?;
    }
    for group_id in patch.add_groups.iter() {
        let group = require_group(conn, *group_id)?;
        if group.profile_id != target_profile {
            return Err(TaktError::Conflict(format!(
                "group {} belongs to profile {}, not {}",
                group.id, group.profile_id, target_profile
            )));
        }
    }
    for group_id in patch.remove_groups.iter() {
        require_group(conn, *group_id)?;
    }

    let tx = conn.unchecked_transaction()?;

    // Field updates via dynamic SET clause
    let mut set_clauses: Vec<String> = Vec::new();
    let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(ref title) = patch.title {
        set_clauses.push(format!("title = ?{}", params_vec.len() + 1));
        params_vec.push(Box::new(title.clone()));
    }
    if let Some(ref description) = patch.description {
        set_clauses.push(format!("description = ?{}", params_vec.len() + 1));
        params_vec.push(Box::new(description.clone()));
    }
    if let Some(ref status) = patch.status {
        set_clauses.push(format!("status = ?{}", params_vec.len() + 1));
        params_vec.push(Box::new(status.clone()));
    }
    if patch.set_profile.is_some() && target_profile != video.profile_id {
        set_clauses.push(format!("profile_id = ?{}", params_vec.len() + 1));
        params_vec.push(Box::new(target_profile));
        // Groups are scoped to the old profile; every association would
        // dangle after the move, so they go with it.
        tx.execute("DELETE FROM video_groups WHERE video_id = ?1", [id])?;
    }

    if !set_clauses.is_empty() {
        params_vec.push(Box::new(id));
        let sql = format!(
            "UPDATE videos SET {} WHERE id = ?{}",
            set_clauses.join(", "),
            params_vec.len()
        );
        let params_refs: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();
        tx.execute(&sql, params_refs.as_slice())?;
    }

    for tag_id in &patch.add_tags {
        schema::add_video_tag(&tx, id, *tag_id)?;
    }
    for tag_id in &patch.remove_tags {
        schema::remove_video_tag(&tx, id, *tag_id)?;
    }
    for group_id in &patch.add_groups {
        schema::add_video_group(&tx, id, *group_id)?;
    }
    for group_id in &patch.remove_groups {
        schema::remove_video_group(&tx, id, *group_id)?;
    }

    tx.commit()?;

    require_video(conn, id)
}

/// Delete a video and release its artifact reference. The blob survives
/// while other videos still share the fingerprint.
pub fn delete_video(conn: &Connection, artifacts: &ArtifactStore, id: i64) -> Result<()> {
    with_video_lock(id, || {
        let video = require_video(conn, id)?;

        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM video_tags WHERE video_id = ?1", [id])?;
        tx.execute("DELETE FROM video_groups WHERE video_id = ?1", [id])?;
        tx.execute("UPDATE jobs SET video_id = NULL WHERE video_id = ?1", [id])?;
        schema::delete_video_row(&tx, id)?;
        tx.commit()?;

        artifacts.remove(conn, &video.fingerprint)?;
        Ok(())
    })
}

/// Record a source availability probe result.
pub fn mark_source_status(conn: &Connection, id: i64, available: bool) -> Result<()> {
    require_video(conn, id)?;
    let status = if available {
        crate::constants::SOURCE_AVAILABLE
    } else {
        crate::constants::SOURCE_GONE
    };
    conn.execute(
        "UPDATE videos SET source_status = ?1, last_checked_at = datetime('now') WHERE id = ?2",
        rusqlite::params![status, id],
    )?;
    Ok(())
}

// ----- Query -----

/// Filterable, restartable video listing. Results are newest-first;
/// callers page with limit/offset.
#[derive(Debug, Clone, Default)]
pub struct VideoQuery {
    pub profile_id: Option<i64>,
    pub group_id: Option<i64>,
    pub tag_id: Option<i64>,
    pub title_contains: Option<String>,
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: i64,
}

pub fn query_videos(conn: &Connection, query: &VideoQuery) -> Result<Vec<Video>> {
    let mut where_clauses: Vec<String> = Vec::new();
    let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(profile_id) = query.profile_id {
        where_clauses.push(format!("v.profile_id = ?{}", params_vec.len() + 1));
        params_vec.push(Box::new(profile_id));
    }
    if let Some(group_id) = query.group_id {
        where_clauses.push(format!(
            "v.id IN (SELECT video_id FROM video_groups WHERE group_id = ?{})",
            params_vec.len() + 1
        ));
        params_vec.push(Box::new(group_id));
    }
    if let Some(tag_id) = query.tag_id {
        where_clauses.push(format!(
            "v.id IN (SELECT video_id FROM video_tags WHERE tag_id = ?{})",
            params_vec.len() + 1
        ));
        params_vec.push(Box::new(tag_id));
    }
    if let Some(ref text) = query.title_contains {
        where_clauses.push(format!("v.title LIKE ?{}", params_vec.len() + 1));
        params_vec.push(Box::new(format!("%{}%", text)));
    }
    if let Some(ref status) = query.status {
        where_clauses.push(format!("v.status = ?{}", params_vec.len() + 1));
        params_vec.push(Box::new(status.clone()));
    }

    let where_sql = if where_clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", where_clauses.join(" AND "))
    };

    params_vec.push(Box::new(query.limit.unwrap_or(i64::MAX)));
    let limit_param = params_vec.len();
    params_vec.push(Box::new(query.offset));
    let offset_param = params_vec.len();

    let sql = format!(
        "SELECT {} FROM videos v JOIN artifacts a ON v.fingerprint = a.fingerprint
         {} ORDER BY v.created_at DESC, v.id DESC LIMIT ?{} OFFSET ?{}",
        schema::video_columns(),
        where_sql,
        limit_param,
        offset_param
    );

    let params_refs: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();
    let mut stmt = conn.prepare(&sql)?;
    let mut videos = stmt
        .query_map(params_refs.as_slice(), schema::map_video)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    for video in &mut videos {
        schema::load_video_associations(conn, video)?;
    }

    Ok(videos)
}

// ----- Consistency check -----

#[derive(Debug, Default)]
pub struct VerifyReport {
    pub checked: usize,
    /// Videos whose artifact row is missing, whose blob file is gone, or
    /// whose blob content no longer hashes to the recorded fingerprint.
    pub broken: Vec<(i64, String)>,
}

/// Verify that every complete video's fingerprint resolves to an indexed
/// blob that exists on disk and still hashes to that fingerprint.
pub fn verify_index(conn: &Connection, artifacts: &ArtifactStore) -> Result<VerifyReport> {
    let mut report = VerifyReport::default();
    let videos = query_videos(
        conn,
        &VideoQuery {
            status: Some("complete".to_string()),
            ..Default::default()
        },
    )?;

    for video in videos {
        report.checked += 1;
        match schema::get_artifact(conn, &video.fingerprint)? {
            None => report
                .broken
                .push((video.id, format!("no artifact row for {}", video.fingerprint))),
            Some(artifact) => {
                let blob = artifacts.full_path(&artifact.rel_path);
                if !blob.exists() {
                    report
                        .broken
                        .push((video.id, format!("blob missing: {}", artifact.rel_path)));
                } else if !crate::hash::verify_fingerprint(&blob, &video.fingerprint)? {
                    report.broken.push((
                        video.id,
                        format!("fingerprint mismatch: {}", artifact.rel_path),
                    ));
                }
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests;
