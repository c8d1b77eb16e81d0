// Database schema types and query helpers

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::Result;

// ----- Profile -----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub id: i64,
    pub name: String,
    pub created_at: String,
}

pub fn insert_profile(conn: &Connection, name: &str) -> Result<i64> {
    conn.execute("INSERT INTO profiles (name) VALUES (?1)", params![name])?;
    Ok(conn.last_insert_rowid())
}

pub fn get_profile(conn: &Connection, id: i64) -> Result<Option<Profile>> {
    let result = conn
        .query_row(
            "SELECT id, name, created_at FROM profiles WHERE id = ?1",
            params![id],
            map_profile,
        )
        .optional()?;
    Ok(result)
}

pub fn get_profile_by_name(conn: &Connection, name: &str) -> Result<Option<Profile>> {
    let result = conn
        .query_row(
            "SELECT id, name, created_at FROM profiles WHERE name = ?1",
            params![name],
            map_profile,
        )
        .optional()?;
    Ok(result)
}

pub fn list_profiles(conn: &Connection) -> Result<Vec<Profile>> {
    let mut stmt = conn.prepare("SELECT id, name, created_at FROM profiles ORDER BY name ASC")?;
    let profiles = stmt
        .query_map([], map_profile)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(profiles)
}

pub fn count_profile_videos(conn: &Connection, profile_id: i64) -> Result<i64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM videos WHERE profile_id = ?1",
        params![profile_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

pub fn delete_profile_row(conn: &Connection, id: i64) -> Result<()> {
    conn.execute("DELETE FROM profiles WHERE id = ?1", params![id])?;
    Ok(())
}

fn map_profile(row: &rusqlite::Row) -> rusqlite::Result<Profile> {
    Ok(Profile {
        id: row.get(0)?,
        name: row.get(1)?,
        created_at: row.get(2)?,
    })
}

// ----- Group -----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: i64,
    pub profile_id: i64,
    pub name: String,
    pub created_at: String,
}

pub fn insert_group(conn: &Connection, profile_id: i64, name: &str) -> Result<i64> {
    conn.execute(
        "INSERT INTO groups (profile_id, name) VALUES (?1, ?2)",
        params![profile_id, name],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_group(conn: &Connection, id: i64) -> Result<Option<Group>> {
    let result = conn
        .query_row(
            "SELECT id, profile_id, name, created_at FROM groups WHERE id = ?1",
            params![id],
            map_group,
        )
        .optional()?;
    Ok(result)
}

pub fn get_group_by_name(conn: &Connection, profile_id: i64, name: &str) -> Result<Option<Group>> {
    let result = conn
        .query_row(
            "SELECT id, profile_id, name, created_at FROM groups WHERE profile_id = ?1 AND name = ?2",
            params![profile_id, name],
            map_group,
        )
        .optional()?;
    Ok(result)
}

pub fn list_groups(conn: &Connection, profile_id: i64) -> Result<Vec<Group>> {
    let mut stmt = conn.prepare(
        "SELECT id, profile_id, name, created_at FROM groups WHERE profile_id = ?1 ORDER BY name ASC",
    )?;
    let groups = stmt
        .query_map(params![profile_id], map_group)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(groups)
}

pub fn delete_group_row(conn: &Connection, id: i64) -> Result<()> {
    conn.execute("DELETE FROM groups WHERE id = ?1", params![id])?;
    Ok(())
}

fn map_group(row: &rusqlite::Row) -> rusqlite::Result<Group> {
    Ok(Group {
        id: row.get(0)?,
        profile_id: row.get(1)?,
        name: row.get(2)?,
        created_at: row.get(3)?,
    })
}

// ----- Tag -----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tag {
    pub id: i64,
    pub name: String,
    pub created_at: String,
}

pub fn insert_tag(conn: &Connection, name: &str) -> Result<i64> {
    conn.execute("INSERT INTO tags (name) VALUES (?1)", params![name])?;
    Ok(conn.last_insert_rowid())
}

pub fn get_tag(conn: &Connection, id: i64) -> Result<Option<Tag>> {
    let result = conn
        .query_row(
            "SELECT id, name, created_at FROM tags WHERE id = ?1",
            params![id],
            map_tag,
        )
        .optional()?;
    Ok(result)
}

pub fn get_tag_by_name(conn: &Connection, name: &str) -> Result<Option<Tag>> {
    let result = conn
        .query_row(
            "SELECT id, name, created_at FROM tags WHERE name = ?1",
            params![name],
            map_tag,
        )
        .optional()?;
    Ok(result)
}

pub fn list_tags(conn: &Connection) -> Result<Vec<Tag>> {
    let mut stmt = conn.prepare("SELECT id, name, created_at FROM tags ORDER BY name ASC")?;
    let tags = stmt
        .query_map([], map_tag)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(tags)
}

pub fn delete_tag_row(conn: &Connection, id: i64) -> Result<()> {
    conn.execute("DELETE FROM tags WHERE id = ?1", params![id])?;
    Ok(())
}

fn map_tag(row: &rusqlite::Row) -> rusqlite::Result<Tag> {
    Ok(Tag {
        id: row.get(0)?,
        name: row.get(1)?,
        created_at: row.get(2)?,
    })
}

// ----- Artifact -----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub fingerprint: String,
    pub rel_path: String,
    pub size_bytes: i64,
    pub refcount: i64,
    pub created_at: String,
}

pub fn insert_artifact(conn: &Connection, fingerprint: &str, rel_path: &str, size_bytes: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO artifacts (fingerprint, rel_path, size_bytes, refcount) VALUES (?1, ?2, ?3, 1)",
        params![fingerprint, rel_path, size_bytes],
    )?;
    Ok(())
}

pub fn get_artifact(conn: &Connection, fingerprint: &str) -> Result<Option<Artifact>> {
    let result = conn
        .query_row(
            "SELECT fingerprint, rel_path, size_bytes, refcount, created_at
             FROM artifacts WHERE fingerprint = ?1",
            params![fingerprint],
            map_artifact,
        )
        .optional()?;
    Ok(result)
}

pub fn list_artifacts(conn: &Connection) -> Result<Vec<Artifact>> {
    let mut stmt = conn.prepare(
        "SELECT fingerprint, rel_path, size_bytes, refcount, created_at
         FROM artifacts ORDER BY created_at ASC",
    )?;
    let artifacts = stmt
        .query_map([], map_artifact)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(artifacts)
}

/// Increment an artifact's refcount. Returns false if the row is missing.
pub fn increment_artifact_refcount(conn: &Connection, fingerprint: &str) -> Result<bool> {
    let rows = conn.execute(
        "UPDATE artifacts SET refcount = refcount + 1 WHERE fingerprint = ?1",
        params![fingerprint],
    )?;
    Ok(rows > 0)
}

/// Decrement an artifact's refcount, returning the new count.
pub fn decrement_artifact_refcount(conn: &Connection, fingerprint: &str) -> Result<Option<i64>> {
    conn.execute(
        "UPDATE artifacts SET refcount = refcount - 1 WHERE fingerprint = ?1 AND refcount > 0",
        params![fingerprint],
    )?;
    let count = conn
        .query_row(
            "SELECT refcount FROM artifacts WHERE fingerprint = ?1",
            params![fingerprint],
            |row| row.get(0),
        )
        .optional()?;
    Ok(count)
}

pub fn delete_artifact_row(conn: &Connection, fingerprint: &str) -> Result<()> {
    conn.execute("DELETE FROM artifacts WHERE fingerprint = ?1", params![fingerprint])?;
    Ok(())
}

fn map_artifact(row: &rusqlite::Row) -> rusqlite::Result<Artifact> {
    Ok(Artifact {
        fingerprint: row.get(0)?,
        rel_path: row.get(1)?,
        size_bytes: row.get(2)?,
        refcount: row.get(3)?,
        created_at: row.get(4)?,
    })
}

// ----- Video -----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Video {
    pub id: i64,
    pub uuid: String,
    pub profile_id: i64,
    pub source_url: String,
    pub title: String,
    pub description: String,
    pub duration_secs: Option<f64>,
    pub clip_start_secs: Option<f64>,
    pub clip_end_secs: Option<f64>,
    pub fingerprint: String,
    /// Relative blob path, joined from the artifact index.
    pub file_path: String,
    pub quality: String,
    pub status: String,
    pub source_status: String,
    pub last_checked_at: Option<String>,
    pub created_at: String,
    pub group_ids: Vec<i64>,
    pub tag_ids: Vec<i64>,
}

#[derive(Debug, Clone)]
pub struct NewVideo {
    pub profile_id: i64,
    pub source_url: String,
    pub title: String,
    pub description: String,
    pub duration_secs: Option<f64>,
    pub clip_start_secs: Option<f64>,
    pub clip_end_secs: Option<f64>,
    pub fingerprint: String,
    pub quality: String,
}

const VIDEO_COLUMNS: &str = "v.id, v.uuid, v.profile_id, v.source_url, v.title, v.description,
            v.duration_secs, v.clip_start_secs, v.clip_end_secs, v.fingerprint, a.rel_path,
            v.quality, v.status, v.source_status, v.last_checked_at, v.created_at";

pub fn insert_video(conn: &Connection, video: &NewVideo) -> Result<i64> {
    let video_uuid = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO videos (uuid, profile_id, source_url, title, description, duration_secs,
                             clip_start_secs, clip_end_secs, fingerprint, quality)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            video_uuid,
            video.profile_id,
            video.source_url,
            video.title,
            video.description,
            video.duration_secs,
            video.clip_start_secs,
            video.clip_end_secs,
            video.fingerprint,
            video.quality,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_video(conn: &Connection, id: i64) -> Result<Option<Video>> {
    let sql = format!(
        "SELECT {} FROM videos v JOIN artifacts a ON v.fingerprint = a.fingerprint WHERE v.id = ?1",
        VIDEO_COLUMNS
    );
    let video = conn.query_row(&sql, params![id], map_video).optional()?;
    match video {
        Some(mut v) => {
            load_video_associations(conn, &mut v)?;
            Ok(Some(v))
        }
        None => Ok(None),
    }
}

pub fn delete_video_row(conn: &Connection, id: i64) -> Result<()> {
    conn.execute("DELETE FROM videos WHERE id = ?1", params![id])?;
    Ok(())
}

pub fn map_video(row: &rusqlite::Row) -> rusqlite::Result<Video> {
    Ok(Video {
        id: row.get(0)?,
        uuid: row.get(1)?,
        profile_id: row.get(2)?,
        source_url: row.get(3)?,
        title: row.get(4)?,
        description: row.get(5)?,
        duration_secs: row.get(6)?,
        clip_start_secs: row.get(7)?,
        clip_end_secs: row.get(8)?,
        fingerprint: row.get(9)?,
        file_path: row.get(10)?,
        quality: row.get(11)?,
        status: row.get(12)?,
        source_status: row.get(13)?,
        last_checked_at: row.get(14)?,
        created_at: row.get(15)?,
        group_ids: Vec::new(),
        tag_ids: Vec::new(),
    })
}

pub fn load_video_associations(conn: &Connection, video: &mut Video) -> Result<()> {
    video.group_ids = get_video_group_ids(conn, video.id)?;
    video.tag_ids = get_video_tag_ids(conn, video.id)?;
    Ok(())
}

pub fn video_columns() -> &'static str {
    VIDEO_COLUMNS
}

// ----- Video associations -----

pub fn add_video_tag(conn: &Connection, video_id: i64, tag_id: i64) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO video_tags (video_id, tag_id) VALUES (?1, ?2)",
        params![video_id, tag_id],
    )?;
    Ok(())
}

pub fn remove_video_tag(conn: &Connection, video_id: i64, tag_id: i64) -> Result<()> {
    conn.execute(
        "DELETE FROM video_tags WHERE video_id = ?1 AND tag_id = ?2",
        params![video_id, tag_id],
    )?;
    Ok(())
}

pub fn add_video_group(conn: &Connection, video_id: i64, group_id: i64) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO video_groups (video_id, group_id) VALUES (?1, ?2)",
        params![video_id, group_id],
    )?;
    Ok(())
}

pub fn remove_video_group(conn: &Connection, video_id: i64, group_id: i64) -> Result<()> {
    conn.execute(
        "DELETE FROM video_groups WHERE video_id = ?1 AND group_id = ?2",
        params![video_id, group_id],
    )?;
    Ok(())
}

pub fn get_video_tag_ids(conn: &Connection, video_id: i64) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT tag_id FROM video_tags WHERE video_id = ?1 ORDER BY tag_id ASC",
    )?;
    let ids = stmt
        .query_map(params![video_id], |row| row.get(0))?
        .collect::<std::result::Result<Vec<i64>, _>>()?;
    Ok(ids)
}

pub fn get_video_group_ids(conn: &Connection, video_id: i64) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT group_id FROM video_groups WHERE video_id = ?1 ORDER BY group_id ASC",
    )?;
    let ids = stmt
        .query_map(params![video_id], |row| row.get(0))?
        .collect::<std::result::Result<Vec<i64>, _>>()?;
    Ok(ids)
}

pub fn count_group_videos(conn: &Connection, group_id: i64) -> Result<i64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM video_groups WHERE group_id = ?1",
        params![group_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

pub fn count_tag_videos(conn: &Connection, tag_id: i64) -> Result<i64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM video_tags WHERE tag_id = ?1",
        params![tag_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

// ----- Job -----

/// Job lifecycle states. Queued jobs are admitted FIFO; terminal states
/// (completed, failed, cancelled) are immutable once reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Downloading,
    Trimming,
    Indexing,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Downloading => "downloading",
            JobState::Trimming => "trimming",
            JobState::Indexing => "indexing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<JobState> {
        match s {
            "queued" => Some(JobState::Queued),
            "downloading" => Some(JobState::Downloading),
            "trimming" => Some(JobState::Trimming),
            "indexing" => Some(JobState::Indexing),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            "cancelled" => Some(JobState::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Cancelled)
    }

    /// States a crashed process can leave behind; recovery requeues them.
    pub fn is_active(&self) -> bool {
        matches!(self, JobState::Downloading | JobState::Trimming | JobState::Indexing)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub video_id: Option<i64>,
    pub url: String,
    pub clip_start_secs: Option<f64>,
    pub clip_end_secs: Option<f64>,
    pub clip_key: String,
    pub profile_id: i64,
    /// JSON blob: initial tags, quality, optional title.
    pub payload: String,
    pub state: JobState,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub claimed_by: Option<String>,
    pub run_token: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub url: String,
    pub clip_start_secs: Option<f64>,
    pub clip_end_secs: Option<f64>,
    pub clip_key: String,
    pub profile_id: i64,
    pub payload: String,
}

pub const JOB_COLUMNS: &str = "id, video_id, url, clip_start_secs, clip_end_secs, clip_key,
             profile_id, payload, state, attempts, last_error, claimed_by, run_token,
             created_at, updated_at, completed_at";

pub fn insert_job(conn: &Connection, job: &NewJob) -> Result<i64> {
    conn.execute(
        "INSERT INTO jobs (url, clip_start_secs, clip_end_secs, clip_key, profile_id, payload)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            job.url,
            job.clip_start_secs,
            job.clip_end_secs,
            job.clip_key,
            job.profile_id,
            job.payload,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_job(conn: &Connection, id: i64) -> Result<Option<Job>> {
    let sql = format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS);
    let result = conn.query_row(&sql, params![id], map_job).optional()?;
    Ok(result)
}

pub fn list_jobs(conn: &Connection, state: Option<JobState>, limit: i64) -> Result<Vec<Job>> {
    let jobs = match state {
        Some(st) => {
            let sql = format!(
                "SELECT {} FROM jobs WHERE state = ?1 ORDER BY created_at ASC, id ASC LIMIT ?2",
                JOB_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![st.as_str(), limit], map_job)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        }
        None => {
            let sql = format!(
                "SELECT {} FROM jobs ORDER BY created_at ASC, id ASC LIMIT ?1",
                JOB_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![limit], map_job)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        }
    };
    Ok(jobs)
}

pub fn map_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
    let state_str: String = row.get(8)?;
    let state = JobState::parse(&state_str).unwrap_or(JobState::Failed);
    Ok(Job {
        id: row.get(0)?,
        video_id: row.get(1)?,
        url: row.get(2)?,
        clip_start_secs: row.get(3)?,
        clip_end_secs: row.get(4)?,
        clip_key: row.get(5)?,
        profile_id: row.get(6)?,
        payload: row.get(7)?,
        state,
        attempts: row.get(9)?,
        last_error: row.get(10)?,
        claimed_by: row.get(11)?,
        run_token: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
        completed_at: row.get(15)?,
    })
}
