// Database module

pub mod migrations;
pub mod schema;

use std::path::{Path, PathBuf};

use anyhow::Result;
use rusqlite::Connection;

use crate::constants::{BLOBS_FOLDER, DB_FILENAME, STAGING_FOLDER, TAKTX_FOLDER};

/// Open or create a database at the given path
pub fn open_db(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;

    // Enable foreign keys (must be done per connection)
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;

    // Enable WAL mode for better concurrency
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;

    // Concurrent workers share the file; wait instead of failing fast
    conn.busy_timeout(std::time::Duration::from_secs(10))?;

    // Run migrations
    migrations::run_migrations(&conn)?;

    Ok(conn)
}

/// Get the database path for a library root
pub fn get_db_path(library_root: &Path) -> PathBuf {
    library_root.join(TAKTX_FOLDER).join(DB_FILENAME)
}

/// Get the .taktx folder path for a library root
pub fn get_taktx_path(library_root: &Path) -> PathBuf {
    library_root.join(TAKTX_FOLDER)
}

/// Get the staging folder for a job
pub fn get_staging_path(library_root: &Path, job_id: i64) -> PathBuf {
    library_root
        .join(TAKTX_FOLDER)
        .join(STAGING_FOLDER)
        .join(job_id.to_string())
}

/// Get the artifact blob root for a library
pub fn get_blobs_path(library_root: &Path) -> PathBuf {
    library_root.join(BLOBS_FOLDER)
}

/// Initialize library folder structure
pub fn init_library_folders(library_root: &Path) -> Result<()> {
    let taktx = library_root.join(TAKTX_FOLDER);
    std::fs::create_dir_all(&taktx)?;
    std::fs::create_dir_all(taktx.join(STAGING_FOLDER))?;
    std::fs::create_dir_all(library_root.join(BLOBS_FOLDER))?;
    Ok(())
}
