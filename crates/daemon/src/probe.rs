use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use tokio::process::Command;

use crate::error::OperationError;

/// Complete ffprobe output structure
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeData {
    #[serde(default)]
    pub streams: Vec<ProbeStream>,
    pub format: Option<ProbeFormat>,
}

/// Format-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeFormat {
    #[serde(rename = "format_name")]
    pub format_name: Option<String>,
    pub duration: Option<String>,
    pub tags: Option<HashMap<String, String>>,
}

/// Stream-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeStream {
    pub index: i32,
    #[serde(rename = "codec_type")]
    pub codec_type: Option<String>,
    #[serde(rename = "codec_name")]
    pub codec_name: Option<String>,
    pub channels: Option<u32>,
    #[serde(rename = "channel_layout")]
    pub channel_layout: Option<String>,
    #[serde(rename = "sample_rate")]
    pub sample_rate: Option<String>,
    pub tags: Option<HashMap<String, String>>,
    pub disposition: Option<HashMap<String, i32>>,
}

/// Run ffprobe and parse the JSON output. `select_streams` narrows the
/// probe to a stream selector such as `a:0`.
pub async fn probe_file(
    ffprobe_bin: &Path,
    file_path: &Path,
    select_streams: Option<&str>,
) -> Result<ProbeData, OperationError> {
    if !file_path.exists() {
        return Err(OperationError::ExternalTool(format!(
            "file does not exist: {}",
            file_path.display()
        )));
    }

    let mut cmd = Command::new(ffprobe_bin);
    cmd.arg("-v")
        .arg("error")
        .arg("-print_format")
        .arg("json")
        .arg("-show_streams")
        .arg("-show_format");
    if let Some(selector) = select_streams {
        cmd.arg("-select_streams").arg(selector);
    }
    cmd.arg(file_path);

    let output = cmd.output().await.map_err(|e| {
        OperationError::ExternalTool(format!(
            "failed to execute ffprobe for {}: {}",
            file_path.display(),
            e
        ))
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(OperationError::ExternalTool(format!(
            "ffprobe failed (exit code {}) for {}: {}",
            output.status.code().unwrap_or(-1),
            file_path.display(),
            stderr.trim()
        )));
    }

    let json_str = String::from_utf8_lossy(&output.stdout);
    parse_probe_output(&json_str).map_err(|e| {
        OperationError::ExternalTool(format!(
            "failed to parse ffprobe JSON for {}: {}",
            file_path.display(),
            e
        ))
    })
}

fn parse_probe_output(json_str: &str) -> Result<ProbeData, serde_json::Error> {
    serde_json::from_str(json_str)
}

/// Properties of one audio stream, extracted for validation before a
/// conversion is attempted. Derived, never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioStreamProfile {
    /// Codec name as ffprobe reports it, e.g. `dts`, `aac`, `flac`
    pub codec_family: String,
    /// Channel layout string, e.g. `5.1(side)`, `7.1`
    pub channel_layout: String,
    pub channel_count: u32,
    pub sample_rate: Option<u32>,
    /// Container duration; absent duration makes progress indeterminate,
    /// it is not an error
    pub duration_secs: Option<f64>,
}

impl AudioStreamProfile {
    /// Build a profile from a probe narrowed to one audio stream.
    pub fn from_probe(data: &ProbeData) -> Result<Self, OperationError> {
        let stream = data
            .streams
            .first()
            .ok_or_else(|| OperationError::Validation("no audio streams found".to_string()))?;

        let duration_secs = data
            .format
            .as_ref()
            .and_then(|f| f.duration.as_deref())
            .and_then(|d| d.parse::<f64>().ok())
            .filter(|d| *d > 0.0);

        Ok(AudioStreamProfile {
            codec_family: stream.codec_name.clone().unwrap_or_default(),
            channel_layout: stream.channel_layout.clone().unwrap_or_default(),
            channel_count: stream.channels.unwrap_or(0),
            sample_rate: stream.sample_rate.as_deref().and_then(|s| s.parse().ok()),
            duration_secs,
        })
    }
}
