// Database migrations
// Migrations are forward-only. Never edit or delete a migration after it ships.

use anyhow::Result;
use rusqlite::Connection;

/// All migrations in order. Each migration is a SQL string.
const MIGRATIONS: &[&str] = &[
    // Migration 1: Initial schema
    r#"
    -- Profiles: top-level ownership scope for videos
    CREATE TABLE profiles (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        created_at TEXT NOT NULL DEFAULT (datetime('now'))
    );

    -- Groups: profile-scoped labels, many-to-many with videos
    CREATE TABLE groups (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        profile_id INTEGER NOT NULL REFERENCES profiles(id),
        name TEXT NOT NULL,
        created_at TEXT NOT NULL DEFAULT (datetime('now')),
        UNIQUE(profile_id, name)
    );

    -- Tags: global labels, many-to-many with videos
    CREATE TABLE tags (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        created_at TEXT NOT NULL DEFAULT (datetime('now'))
    );

    -- Artifact index: one row per stored blob, refcounted
    CREATE TABLE artifacts (
        fingerprint TEXT PRIMARY KEY,
        rel_path TEXT NOT NULL UNIQUE,
        size_bytes INTEGER NOT NULL,
        refcount INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL DEFAULT (datetime('now'))
    );

    -- Videos: one per completed archive request
    CREATE TABLE videos (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        uuid TEXT NOT NULL UNIQUE,
        profile_id INTEGER NOT NULL REFERENCES profiles(id),
        source_url TEXT NOT NULL,
        title TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        duration_secs REAL,
        clip_start_secs REAL,
        clip_end_secs REAL,
        fingerprint TEXT NOT NULL REFERENCES artifacts(fingerprint),
        quality TEXT NOT NULL DEFAULT 'best',
        status TEXT NOT NULL DEFAULT 'complete'
            CHECK (status IN ('complete', 'failed', 'archived')),
        source_status TEXT NOT NULL DEFAULT 'unchecked'
            CHECK (source_status IN ('unchecked', 'available', 'gone')),
        last_checked_at TEXT,
        created_at TEXT NOT NULL DEFAULT (datetime('now'))
    );

    CREATE INDEX videos_profile ON videos(profile_id);
    CREATE INDEX videos_fingerprint ON videos(fingerprint);

    -- Video-Group mapping
    CREATE TABLE video_groups (
        video_id INTEGER NOT NULL REFERENCES videos(id),
        group_id INTEGER NOT NULL REFERENCES groups(id),
        PRIMARY KEY (video_id, group_id)
    );

    -- Video-Tag mapping
    CREATE TABLE video_tags (
        video_id INTEGER NOT NULL REFERENCES videos(id),
        tag_id INTEGER NOT NULL REFERENCES tags(id),
        created_at TEXT NOT NULL DEFAULT (datetime('now')),
        PRIMARY KEY (video_id, tag_id)
    );

    -- Jobs: durable archive request queue
    CREATE TABLE jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        video_id INTEGER REFERENCES videos(id),
        url TEXT NOT NULL,
        clip_start_secs REAL,
        clip_end_secs REAL,
        clip_key TEXT NOT NULL,
        profile_id INTEGER NOT NULL REFERENCES profiles(id),
        payload TEXT NOT NULL DEFAULT '{}',
        state TEXT NOT NULL DEFAULT 'queued'
            CHECK (state IN ('queued', 'downloading', 'trimming', 'indexing',
                             'completed', 'failed', 'cancelled')),
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        claimed_by TEXT,
        run_token TEXT,
        created_at TEXT NOT NULL DEFAULT (datetime('now')),
        updated_at TEXT NOT NULL DEFAULT (datetime('now')),
        completed_at TEXT
    );

    -- Dedup-in-flight: at most one non-terminal job per (url, clip range)
    CREATE UNIQUE INDEX jobs_inflight ON jobs(url, clip_key)
        WHERE state IN ('queued', 'downloading', 'trimming', 'indexing');

    CREATE INDEX jobs_state ON jobs(state, created_at);
    "#,
];

fn get_schema_version(conn: &Connection) -> Result<u32> {
    let version: u32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    Ok(version)
}

/// Run all pending migrations (crash-safe)
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;
    let target_version = MIGRATIONS.len() as u32;

    // Refuse to open a DB created by a newer TaktX build
    if current_version > target_version {
        anyhow::bail!(
            "Database schema version {} is newer than this build supports (max {}). Please upgrade TaktX.",
            current_version,
            target_version
        );
    }

    if current_version == target_version {
        return Ok(());
    }

    // Apply pending migrations one-by-one
    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let migration_version = (i + 1) as u32;
        if migration_version <= current_version {
            continue;
        }

        conn.execute_batch(migration)?;
        conn.execute_batch(&format!("PRAGMA user_version = {}", migration_version))?;

        log::debug!("Applied migration {}", migration_version);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_apply_cleanly() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        run_migrations(&conn).unwrap();

        // Re-running is a no-op
        run_migrations(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), MIGRATIONS.len() as u32);
    }
}
