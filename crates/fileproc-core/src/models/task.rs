use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use uuid::Uuid;

/// Kinds of background work the pipeline knows how to route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    #[serde(rename = "image:resize")]
    ImageResize,
    #[serde(rename = "video:extract-metadata")]
    VideoExtractMetadata,
    #[serde(rename = "video:transcode")]
    VideoTranscode,
}

impl TaskKind {
    pub const ALL: [TaskKind; 3] = [
        TaskKind::ImageResize,
        TaskKind::VideoExtractMetadata,
        TaskKind::VideoTranscode,
    ];

    /// Wire identifier stored alongside the payload.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::ImageResize => "image:resize",
            TaskKind::VideoExtractMetadata => "video:extract-metadata",
            TaskKind::VideoTranscode => "video:transcode",
        }
    }
}

impl Display for TaskKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image:resize" => Ok(TaskKind::ImageResize),
            "video:extract-metadata" => Ok(TaskKind::VideoExtractMetadata),
            "video:transcode" => Ok(TaskKind::VideoTranscode),
            _ => Err(anyhow::anyhow!("Invalid task kind: {}", s)),
        }
    }
}

/// Trait for type-safe task payloads
pub trait TaskPayload: Serialize + for<'de> Deserialize<'de> + Send + Sync {
    const KIND: TaskKind;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageResizePayload {
    pub file_id: Uuid,
    /// Directory holding the source image; the resized copy lands next to it.
    pub storage_path: String,
    pub filename: String,
    pub width: i32,
    pub height: i32,
}

impl TaskPayload for ImageResizePayload {
    const KIND: TaskKind = TaskKind::ImageResize;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VideoMetadataPayload {
    pub file_id: Uuid,
    pub storage_path: String,
    pub filename: String,
}

impl TaskPayload for VideoMetadataPayload {
    const KIND: TaskKind = TaskKind::VideoExtractMetadata;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VideoTranscodePayload {
    pub file_id: Uuid,
    pub storage_path: String,
    pub filename: String,
    pub format: String,
    #[serde(default = "default_quality")]
    pub quality: String,
    /// Target frame size as `WIDTHxHEIGHT`.
    pub resolution: String,
}

fn default_quality() -> String {
    "medium".to_string()
}

impl TaskPayload for VideoTranscodePayload {
    const KIND: TaskKind = TaskKind::VideoTranscode;
}
