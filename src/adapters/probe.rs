// ffprobe duration extraction

use std::path::Path;
use std::process::{Command, Stdio};

use serde::Deserialize;

use crate::error::{Result, TaktError};
use crate::tools;

#[derive(Deserialize)]
struct ProbeOutput {
    format: Option<ProbeFormat>,
}

#[derive(Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// Media duration in seconds, from the container header.
pub fn duration_secs(path: &Path) -> Result<f64> {
    let ffprobe = tools::ffprobe_path();

    let output = Command::new(&ffprobe)
        .arg("-v")
        .arg("quiet")
        .arg("-print_format")
        .arg("json")
        .arg("-show_format")
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| TaktError::Tool(format!("spawn {}: {}", ffprobe.display(), e)))?;

    if !output.status.success() {
        return Err(TaktError::Tool(format!(
            "ffprobe failed for {}",
            path.display()
        )));
    }

    let probe: ProbeOutput = serde_json::from_slice(&output.stdout)?;
    probe
        .format
        .and_then(|f| f.duration)
        .and_then(|d| d.parse::<f64>().ok())
        .ok_or_else(|| TaktError::Tool(format!("no duration reported for {}", path.display())))
}
