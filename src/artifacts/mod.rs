// Content-addressed artifact store
//
// Blobs live under <library>/blobs/<2-char prefix>/<hash>.<ext>. The side
// index (artifacts table) maps fingerprint -> rel_path + refcount. The
// refcount is mutated only here, inside transactions; physical deletion
// happens when it reaches zero.

use std::path::{Path, PathBuf};

use rusqlite::Connection;
use walkdir::WalkDir;

use crate::constants::BLOBS_FOLDER;
use crate::db::schema;
use crate::error::{Result, TaktError};
use crate::hash;

#[derive(Debug, Clone)]
pub struct PutOutcome {
    pub fingerprint: String,
    pub rel_path: String,
    /// True if an identical blob already existed; no bytes were copied.
    pub deduplicated: bool,
}

#[derive(Debug, Default)]
pub struct OrphanReport {
    /// Blob files on disk with no index row (deleted).
    pub removed_files: Vec<String>,
    /// Index rows whose blob file is missing (reported, not deleted).
    pub missing_blobs: Vec<String>,
}

pub struct ArtifactStore {
    library_root: PathBuf,
}

impl ArtifactStore {
    pub fn new(library_root: impl Into<PathBuf>) -> Self {
        Self {
            library_root: library_root.into(),
        }
    }

    pub fn blob_root(&self) -> PathBuf {
        self.library_root.join(BLOBS_FOLDER)
    }

    /// Absolute path for a stored rel_path.
    pub fn full_path(&self, rel_path: &str) -> PathBuf {
        self.library_root.join(rel_path)
    }

    /// Ingest a file into the store. The source file is consumed: moved
    /// into the blob tree, or deleted when an identical blob already
    /// exists. Each call counts as one reference.
    ///
    /// Safe to retry after a crash: a blob file left on disk without an
    /// index row is adopted instead of re-copied.
    pub fn put(&self, conn: &Connection, source: &Path) -> Result<PutOutcome> {
        let fingerprint = hash::compute_fingerprint(source)?;
        let size_bytes = std::fs::metadata(source)
            .map_err(|e| TaktError::Storage(format!("stat {}: {}", source.display(), e)))?
            .len() as i64;

        let hex = hash::fingerprint_hex(&fingerprint);
        let ext = source
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("bin")
            .to_ascii_lowercase();
        let rel_path = format!("{}/{}/{}.{}", BLOBS_FOLDER, &hex[..2], hex, ext);

        let tx = conn.unchecked_transaction()?;

        if let Some(existing) = schema::get_artifact(&tx, &fingerprint)? {
            schema::increment_artifact_refcount(&tx, &fingerprint)?;
            tx.commit()?;
            // Identical content already stored; drop the duplicate bytes.
            std::fs::remove_file(source).ok();
            return Ok(PutOutcome {
                fingerprint,
                rel_path: existing.rel_path,
                deduplicated: true,
            });
        }

        let dest = self.library_root.join(&rel_path);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| TaktError::Storage(format!("mkdir {}: {}", parent.display(), e)))?;
        }

        if dest.exists() {
            // Leftover from an interrupted put; the content address
            // guarantees it holds the same bytes. Adopt it.
            std::fs::remove_file(source).ok();
        } else {
            move_file(source, &dest)?;
        }

        schema::insert_artifact(&tx, &fingerprint, &rel_path, size_bytes)?;
        tx.commit()?;

        Ok(PutOutcome {
            fingerprint,
            rel_path,
            deduplicated: false,
        })
    }

    /// Drop one reference. The blob file is deleted only when the count
    /// reaches zero.
    pub fn remove(&self, conn: &Connection, fingerprint: &str) -> Result<()> {
        let tx = conn.unchecked_transaction()?;

        let artifact = schema::get_artifact(&tx, fingerprint)?
            .ok_or_else(|| TaktError::NotFound(format!("artifact {}", fingerprint)))?;

        let remaining = schema::decrement_artifact_refcount(&tx, fingerprint)?.unwrap_or(0);
        if remaining <= 0 {
            schema::delete_artifact_row(&tx, fingerprint)?;
            tx.commit()?;
            let full = self.library_root.join(&artifact.rel_path);
            if full.exists() {
                std::fs::remove_file(&full)
                    .map_err(|e| TaktError::Storage(format!("remove {}: {}", full.display(), e)))?;
            }
        } else {
            tx.commit()?;
        }

        Ok(())
    }

    pub fn exists(&self, conn: &Connection, fingerprint: &str) -> Result<bool> {
        Ok(schema::get_artifact(conn, fingerprint)?.is_some())
    }

    pub fn refcount(&self, conn: &Connection, fingerprint: &str) -> Result<Option<i64>> {
        Ok(schema::get_artifact(conn, fingerprint)?.map(|a| a.refcount))
    }

    /// Sweep the blob tree: delete files with no index row, report index
    /// rows whose file has gone missing.
    pub fn cleanup_orphans(&self, conn: &Connection) -> Result<OrphanReport> {
        let mut report = OrphanReport::default();

        let blob_root = self.blob_root();
        if blob_root.exists() {
            for entry in WalkDir::new(&blob_root).into_iter().filter_map(|e| e.ok()) {
                if !entry.file_type().is_file() {
                    continue;
                }
                let stem = entry
                    .path()
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("");
                let fingerprint = format!("blake3:{}", stem);
                if schema::get_artifact(conn, &fingerprint)?.is_none() {
                    log::info!("Removing orphaned blob {}", entry.path().display());
                    std::fs::remove_file(entry.path()).ok();
                    report
                        .removed_files
                        .push(entry.path().to_string_lossy().to_string());
                }
            }
        }

        for artifact in schema::list_artifacts(conn)? {
            if !self.library_root.join(&artifact.rel_path).exists() {
                report.missing_blobs.push(artifact.fingerprint);
            }
        }

        Ok(report)
    }
}

/// Move a file, falling back to copy+remove across filesystems.
fn move_file(source: &Path, dest: &Path) -> Result<()> {
    if std::fs::rename(source, dest).is_ok() {
        return Ok(());
    }
    std::fs::copy(source, dest)
        .map_err(|e| TaktError::Storage(format!("copy to {}: {}", dest.display(), e)))?;
    std::fs::remove_file(source)
        .map_err(|e| TaktError::Storage(format!("remove {}: {}", source.display(), e)))?;
    Ok(())
}
