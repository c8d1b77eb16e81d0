// TaktX constants

pub const TAKTX_FOLDER: &str = ".taktx";
pub const DB_FILENAME: &str = "taktx.db";
pub const CONFIG_FILENAME: &str = "config.json";
pub const STAGING_FOLDER: &str = "staging";
pub const BLOBS_FOLDER: &str = "blobs";

// Hashing
pub const HASH_CHUNK_SIZE: usize = 1_048_576; // 1MB

// Concurrency defaults
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 2;

// Download adapter defaults
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECONDS: u64 = 900;
pub const DEFAULT_DOWNLOAD_MAX_RETRIES: i32 = 3;
pub const DEFAULT_RETRY_BACKOFF_SECONDS: u64 = 5;

// How often subprocess wait loops poll for exit / cancellation
pub const SUBPROCESS_POLL_INTERVAL_MS: u64 = 200;

// Per-video edit lock acquisition
pub const VIDEO_LOCK_TIMEOUT_MS: u64 = 5_000;
pub const VIDEO_LOCK_POLL_INTERVAL_MS: u64 = 25;

// Job retention
pub const DEFAULT_JOB_RETENTION_DAYS: i64 = 30;

// Quality profile names mapped to yt-dlp format strings
pub const QUALITY_PROFILES: [(&str, &str); 6] = [
    ("best", "bestvideo[ext=mp4]+bestaudio[ext=m4a]/best[ext=mp4]/best"),
    ("1080p", "bestvideo[height<=1080][ext=mp4]+bestaudio[ext=m4a]/best[height<=1080][ext=mp4]"),
    ("720p", "bestvideo[height<=720][ext=mp4]+bestaudio[ext=m4a]/best[height<=720][ext=mp4]"),
    ("video_only", "bestvideo[ext=mp4]"),
    ("audio_best", "bestaudio[ext=m4a]/bestaudio"),
    ("audio_low", "worstaudio[ext=m4a]/worstaudio"),
];
pub const DEFAULT_QUALITY: &str = "best";

// Source availability states; new videos start as 'unchecked' (schema default)
pub const SOURCE_AVAILABLE: &str = "available";
pub const SOURCE_GONE: &str = "gone";

/// Look up the yt-dlp format string for a quality profile name.
pub fn quality_format(name: &str) -> Option<&'static str> {
    QUALITY_PROFILES
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, fmt)| *fmt)
}
