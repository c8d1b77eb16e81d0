// Library configuration
//
// Stored as JSON at <library>/.taktx/config.json. Missing fields take
// defaults so older config files keep loading after upgrades.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DownloadConfig {
    /// Max wall-clock seconds to wait for the downloader subprocess.
    pub timeout_secs: u64,
    /// Attempts on transient network failure.
    pub max_retries: i32,
    /// Base delay between attempts; doubles per attempt.
    pub retry_backoff_secs: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECONDS,
            max_retries: DEFAULT_DOWNLOAD_MAX_RETRIES,
            retry_backoff_secs: DEFAULT_RETRY_BACKOFF_SECONDS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Worker pool size; jobs beyond this stay queued (FIFO).
    pub max_concurrent_downloads: usize,
    pub download: DownloadConfig,
    /// If true, a trim failure falls back to archiving the raw download
    /// instead of failing the job.
    pub keep_raw_on_trim_failure: bool,
    /// Default quality profile for submissions that don't name one.
    pub default_quality: String,
    /// Terminal jobs older than this are removed by `jobs --prune`.
    pub job_retention_days: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            download: DownloadConfig::default(),
            keep_raw_on_trim_failure: false,
            default_quality: DEFAULT_QUALITY.to_string(),
            job_retention_days: DEFAULT_JOB_RETENTION_DAYS,
        }
    }
}

impl Config {
    /// Load config from a library root, falling back to defaults when the
    /// file does not exist yet.
    pub fn load(library_root: &Path) -> Result<Config> {
        let path = library_root.join(TAKTX_FOLDER).join(CONFIG_FILENAME);
        if !path.exists() {
            return Ok(Config::default());
        }
        let data = std::fs::read_to_string(&path)?;
        let config: Config = serde_json::from_str(&data)?;
        Ok(config)
    }

    /// Write config to a library root.
    pub fn save(&self, library_root: &Path) -> Result<()> {
        let dir = library_root.join(TAKTX_FOLDER);
        std::fs::create_dir_all(&dir)?;
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(dir.join(CONFIG_FILENAME), data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_when_missing() {
        let tmp = TempDir::new().unwrap();
        let config = Config::load(tmp.path()).unwrap();
        assert_eq!(config.max_concurrent_downloads, DEFAULT_MAX_CONCURRENT_DOWNLOADS);
        assert_eq!(config.download.max_retries, DEFAULT_DOWNLOAD_MAX_RETRIES);
        assert!(!config.keep_raw_on_trim_failure);
    }

    #[test]
    fn test_round_trip_and_partial_file() {
        let tmp = TempDir::new().unwrap();

        let mut config = Config::default();
        config.max_concurrent_downloads = 4;
        config.save(tmp.path()).unwrap();

        let loaded = Config::load(tmp.path()).unwrap();
        assert_eq!(loaded.max_concurrent_downloads, 4);

        // A file with only one field still loads, rest defaulted
        let path = tmp.path().join(TAKTX_FOLDER).join(CONFIG_FILENAME);
        std::fs::write(&path, r#"{"max_concurrent_downloads": 7}"#).unwrap();
        let partial = Config::load(tmp.path()).unwrap();
        assert_eq!(partial.max_concurrent_downloads, 7);
        assert_eq!(partial.default_quality, DEFAULT_QUALITY);
    }
}
