// External tool resolver for yt-dlp/ffmpeg/ffprobe
//
// Resolution order:
// 1) Environment variable override (TAKTX_YTDLP_PATH, etc.)
// 2) Sidecar next to the executable
// 3) bin/ subdirectory next to the executable
// 4) PATH fallback

use std::env;
use std::path::PathBuf;

/// Get the directory containing the current executable
fn exe_dir() -> Option<PathBuf> {
    env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|d| d.to_path_buf()))
}

/// Resolve an external tool path.
fn resolve_tool(env_key: &str, default_name: &str) -> PathBuf {
    // 1) Check environment variable override
    if let Ok(v) = env::var(env_key) {
        let p = PathBuf::from(&v);
        if p.exists() {
            return p;
        }
    }

    // Add .exe on Windows
    let mut filename = default_name.to_string();
    if cfg!(windows) && !filename.to_lowercase().ends_with(".exe") {
        filename.push_str(".exe");
    }

    // 2) Check sidecar next to executable
    if let Some(dir) = exe_dir() {
        let candidate = dir.join(&filename);
        if candidate.exists() {
            return candidate;
        }

        // 3) bin/ subdirectory (common bundling pattern)
        let bin_candidate = dir.join("bin").join(&filename);
        if bin_candidate.exists() {
            return bin_candidate;
        }
    }

    // 4) Fall back to PATH
    PathBuf::from(default_name)
}

/// Get path to the yt-dlp binary
pub fn ytdlp_path() -> PathBuf {
    resolve_tool("TAKTX_YTDLP_PATH", "yt-dlp")
}

/// Get path to the ffmpeg binary
pub fn ffmpeg_path() -> PathBuf {
    resolve_tool("TAKTX_FFMPEG_PATH", "ffmpeg")
}

/// Get path to the ffprobe binary
pub fn ffprobe_path() -> PathBuf {
    resolve_tool("TAKTX_FFPROBE_PATH", "ffprobe")
}

/// Check if a tool is available at the resolved path
pub fn is_tool_available(tool: &str) -> bool {
    let path = match tool {
        "yt-dlp" => ytdlp_path(),
        "ffmpeg" => ffmpeg_path(),
        "ffprobe" => ffprobe_path(),
        _ => return false,
    };

    if path.exists() {
        return true;
    }

    // Otherwise try running it (for PATH fallback)
    std::process::Command::new(&path)
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_tool_fallback() {
        // Without env var set, should return the default name for PATH lookup
        let path = resolve_tool("TAKTX_TEST_NONEXISTENT", "testcmd");
        assert_eq!(path, PathBuf::from("testcmd"));
    }

    #[test]
    fn test_env_override() {
        let temp_dir = std::env::temp_dir();
        let temp_file = temp_dir.join("taktx_test_tool");
        std::fs::write(&temp_file, "test").ok();

        std::env::set_var("TAKTX_TEST_TOOL", temp_file.to_str().unwrap());
        let path = resolve_tool("TAKTX_TEST_TOOL", "default");
        assert_eq!(path, temp_file);

        std::env::remove_var("TAKTX_TEST_TOOL");
        std::fs::remove_file(&temp_file).ok();
    }
}
