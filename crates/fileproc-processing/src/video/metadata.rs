//! Video metadata extraction through ffprobe

use chrono::{DateTime, Utc};
use fileproc_core::models::{File, OutputKind, ProcessedOutput};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::command::{CommandError, CommandRunner};

pub const METADATA_EXTENSION: &str = "json";

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("ffprobe invocation failed: {0}")]
    Probe(#[from] CommandError),

    #[error("ffprobe output is not valid JSON: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("failed to write metadata file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl MetadataError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            MetadataError::Probe(_) => true,
            MetadataError::Parse(_) => false,
            MetadataError::Write { .. } => true,
        }
    }
}

/// Technical description of a video file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub format: String,
    pub bit_rate: String,
    pub codec: String,
    pub duration: String,
    pub width: i32,
    pub height: i32,
    pub resolution: String,
    /// Size in bytes
    pub size: i64,
}

impl VideoMetadata {
    /// The `video_metadata` output recorded against `file`.
    pub fn into_output(self, file: &File, now: DateTime<Utc>) -> ProcessedOutput {
        let mut output = ProcessedOutput::new(OutputKind::VideoMetadata);
        output.storage_path = file.storage_path.clone();
        output.name = format!("{}-metadata", file.id);
        output.extension = METADATA_EXTENSION.to_string();
        output.format = self.format;
        output.width = self.width;
        output.height = self.height;
        output.size = self.size;
        output.codec = self.codec;
        output.bit_rate = self.bit_rate;
        output.duration = self.duration;
        output.resolution = self.resolution;
        output.created_at = Some(now);
        output.updated_at = Some(now);
        output
    }
}

/// Treats an explicit JSON `null` like a missing key.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Default, Deserialize)]
struct ProbeFormat {
    #[serde(default, deserialize_with = "null_as_default")]
    format_name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    bit_rate: String,
    #[serde(default, deserialize_with = "null_as_default")]
    duration: String,
    #[serde(default, deserialize_with = "null_as_default")]
    size: String,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    #[serde(default, deserialize_with = "null_as_default")]
    codec_name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    codec_type: String,
    #[serde(default, deserialize_with = "null_as_default")]
    width: i32,
    #[serde(default, deserialize_with = "null_as_default")]
    height: i32,
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default, deserialize_with = "null_as_default")]
    format: ProbeFormat,
    #[serde(default, deserialize_with = "null_as_default")]
    streams: Vec<ProbeStream>,
}

/// Parse `ffprobe -print_format json -show_format -show_streams` output.
///
/// Dimensions and codec come from the first video stream with a positive
/// frame size. A file without one yields zero dimensions and `"0x0"`.
pub fn parse_probe_output(stdout: &[u8]) -> Result<VideoMetadata, MetadataError> {
    let probe: ProbeOutput = serde_json::from_slice(stdout).map_err(MetadataError::Parse)?;

    let (codec, width, height) = probe
        .streams
        .iter()
        .find(|s| s.codec_type.eq_ignore_ascii_case("video") && s.width > 0 && s.height > 0)
        .map(|s| (s.codec_name.clone(), s.width, s.height))
        .unwrap_or_default();

    Ok(VideoMetadata {
        format: probe.format.format_name,
        bit_rate: probe.format.bit_rate,
        duration: probe.format.duration,
        size: probe.format.size.trim().parse::<i64>().unwrap_or(0),
        codec,
        width,
        height,
        resolution: format!("{}x{}", width, height),
    })
}

/// Write `{dir}/{file_id}-metadata.json` beside the source file.
pub async fn write_metadata_file(
    dir: &Path,
    file_id: uuid::Uuid,
    metadata: &VideoMetadata,
) -> Result<PathBuf, MetadataError> {
    let path = dir.join(format!("{}-metadata.{}", file_id, METADATA_EXTENSION));
    let body = serde_json::to_vec_pretty(metadata).map_err(MetadataError::Parse)?;
    tokio::fs::write(&path, body)
        .await
        .map_err(|source| MetadataError::Write {
            path: path.clone(),
            source,
        })?;
    Ok(path)
}

pub struct VideoMetadataExtractor {
    runner: Arc<dyn CommandRunner>,
    ffprobe_path: String,
}

impl VideoMetadataExtractor {
    pub fn new(runner: Arc<dyn CommandRunner>, ffprobe_path: impl Into<String>) -> Self {
        Self {
            runner,
            ffprobe_path: ffprobe_path.into(),
        }
    }

    #[tracing::instrument(skip(self, cancel), fields(
        process.executable.name = "ffprobe",
        process.executable.path = %self.ffprobe_path,
        ffmpeg.operation = "probe"
    ))]
    pub async fn extract(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<VideoMetadata, MetadataError> {
        let args: Vec<OsString> = vec![
            "-v".into(),
            "error".into(),
            "-print_format".into(),
            "json".into(),
            "-show_format".into(),
            "-show_streams".into(),
            path.as_os_str().to_os_string(),
        ];

        let output = self
            .runner
            .run(&self.ffprobe_path, &args, cancel)
            .await
            .inspect_err(|e| tracing::error!(error = %e, path = %path.display(), "ffprobe failed"))?;

        let metadata = parse_probe_output(&output.stdout)?;

        tracing::info!(
            path = %path.display(),
            resolution = %metadata.resolution,
            codec = %metadata.codec,
            duration = %metadata.duration,
            "Video metadata extracted"
        );

        Ok(metadata)
    }
}
