use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use uuid::Uuid;

/// Kind of derived artifact. Kinds written by newer workers are kept as `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OutputKind {
    ResizedImage,
    VideoMetadata,
    TranscodedVideo,
    Other(String),
}

impl OutputKind {
    pub fn as_str(&self) -> &str {
        match self {
            OutputKind::ResizedImage => "resized_image",
            OutputKind::VideoMetadata => "video_metadata",
            OutputKind::TranscodedVideo => "transcoded_video",
            OutputKind::Other(kind) => kind,
        }
    }
}

impl From<String> for OutputKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "resized_image" => OutputKind::ResizedImage,
            "video_metadata" => OutputKind::VideoMetadata,
            "transcoded_video" => OutputKind::TranscodedVideo,
            _ => OutputKind::Other(value),
        }
    }
}

impl From<OutputKind> for String {
    fn from(kind: OutputKind) -> Self {
        kind.as_str().to_string()
    }
}

impl Display for OutputKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.as_str())
    }
}

/// A derived artifact or metadata extraction result attached to a file.
///
/// Outputs are immutable once appended; reprocessing appends a new one.
/// `id` and the timestamps are filled in by the record store when unset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessedOutput {
    #[serde(default)]
    pub id: Option<Uuid>,
    #[serde(rename = "type")]
    pub kind: OutputKind,
    #[serde(default)]
    pub storage_path: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub extension: String,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub width: i32,
    #[serde(default)]
    pub height: i32,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub codec: String,
    #[serde(default)]
    pub bit_rate: String,
    #[serde(default)]
    pub duration: String,
    #[serde(default)]
    pub resolution: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ProcessedOutput {
    /// Empty output of the given kind; engines fill in the fields they know.
    pub fn new(kind: OutputKind) -> Self {
        Self {
            id: None,
            kind,
            storage_path: String::new(),
            name: String::new(),
            extension: String::new(),
            format: String::new(),
            width: 0,
            height: 0,
            size: 0,
            codec: String::new(),
            bit_rate: String::new(),
            duration: String::new(),
            resolution: String::new(),
            created_at: None,
            updated_at: None,
        }
    }

    /// Assign id and timestamps where the producer left them unset.
    pub fn stamp(mut self, now: DateTime<Utc>) -> Self {
        if self.id.is_none() {
            self.id = Some(Uuid::new_v4());
        }
        if self.created_at.is_none() {
            self.created_at = Some(now);
        }
        if self.updated_at.is_none() {
            self.updated_at = Some(now);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_kind_is_preserved() {
        let json = r#"{"type":"thumbnail_strip","name":"strip"}"#;
        let output: ProcessedOutput = serde_json::from_str(json).unwrap();
        assert_eq!(output.kind, OutputKind::Other("thumbnail_strip".to_string()));

        let back = serde_json::to_value(&output).unwrap();
        assert_eq!(back["type"], "thumbnail_strip");
    }

    #[test]
    fn stamp_keeps_existing_id() {
        let id = Uuid::new_v4();
        let mut output = ProcessedOutput::new(OutputKind::ResizedImage);
        output.id = Some(id);

        let stamped = output.stamp(Utc::now());
        assert_eq!(stamped.id, Some(id));
        assert!(stamped.created_at.is_some());
        assert_eq!(stamped.created_at, stamped.updated_at);
    }

    #[test]
    fn stamp_assigns_missing_id() {
        let stamped = ProcessedOutput::new(OutputKind::VideoMetadata).stamp(Utc::now());
        assert!(stamped.id.is_some());
    }
}
