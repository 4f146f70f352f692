use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use uuid::Uuid;

use super::processed_output::ProcessedOutput;

/// MIME types classified as images at upload time.
pub const IMAGE_MIME_TYPES: &[&str] = &["image/jpeg", "image/png", "image/gif", "image/jpg"];

/// MIME types classified as videos at upload time.
pub const VIDEO_MIME_TYPES: &[&str] = &["video/mp4", "video/avi", "video/mkv", "video/mov"];

/// Coarse category of an uploaded file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FileCategory {
    Image,
    Video,
    Other,
}

impl FileCategory {
    /// Classify a MIME type. Only called once, when the file record is built.
    pub fn from_mime_type(mime_type: &str) -> Self {
        let mime = mime_type.trim().to_ascii_lowercase();
        if IMAGE_MIME_TYPES.contains(&mime.as_str()) {
            FileCategory::Image
        } else if VIDEO_MIME_TYPES.contains(&mime.as_str()) {
            FileCategory::Video
        } else {
            FileCategory::Other
        }
    }
}

impl Display for FileCategory {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            FileCategory::Image => write!(f, "image"),
            FileCategory::Video => write!(f, "video"),
            FileCategory::Other => write!(f, "other"),
        }
    }
}

impl FromStr for FileCategory {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image" => Ok(FileCategory::Image),
            "video" => Ok(FileCategory::Video),
            "other" => Ok(FileCategory::Other),
            _ => Err(anyhow::anyhow!("Invalid file category: {}", s)),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl Display for FileStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            FileStatus::Pending => write!(f, "pending"),
            FileStatus::Processing => write!(f, "processing"),
            FileStatus::Completed => write!(f, "completed"),
            FileStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for FileStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(FileStatus::Pending),
            "processing" => Ok(FileStatus::Processing),
            "completed" => Ok(FileStatus::Completed),
            "failed" => Ok(FileStatus::Failed),
            _ => Err(anyhow::anyhow!("Invalid file status: {}", s)),
        }
    }
}

/// An uploaded file and the outputs derived from it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct File {
    pub id: Uuid,
    pub original_name: String,
    pub generated_name: String,
    pub mime_type: String,
    pub size: i64,
    pub storage_path: String,
    pub uploaded_extension: String,
    /// Derived from `mime_type` when the record is built and never recomputed.
    pub category: FileCategory,
    pub status: FileStatus,
    #[serde(default)]
    pub processed_outputs: Vec<ProcessedOutput>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields known at upload time.
#[derive(Debug, Clone)]
pub struct NewFile {
    pub original_name: String,
    pub generated_name: String,
    pub mime_type: String,
    pub size: i64,
    pub storage_path: String,
    pub uploaded_extension: String,
}

impl File {
    pub fn new(upload: NewFile) -> Self {
        let now = Utc::now();
        let category = FileCategory::from_mime_type(&upload.mime_type);
        Self {
            id: Uuid::new_v4(),
            original_name: upload.original_name,
            generated_name: upload.generated_name,
            mime_type: upload.mime_type,
            size: upload.size,
            storage_path: upload.storage_path,
            uploaded_extension: upload.uploaded_extension,
            category,
            status: FileStatus::Pending,
            processed_outputs: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_image(&self) -> bool {
        self.category == FileCategory::Image
    }

    pub fn is_video(&self) -> bool {
        self.category == FileCategory::Video
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload(mime: &str) -> NewFile {
        NewFile {
            original_name: "clip.mp4".to_string(),
            generated_name: "3f1c".to_string(),
            mime_type: mime.to_string(),
            size: 1024,
            storage_path: "/srv/uploads".to_string(),
            uploaded_extension: "mp4".to_string(),
        }
    }

    #[test]
    fn category_derived_from_mime_type() {
        assert_eq!(File::new(upload("image/png")).category, FileCategory::Image);
        assert_eq!(File::new(upload("IMAGE/JPEG")).category, FileCategory::Image);
        assert_eq!(File::new(upload("video/mp4")).category, FileCategory::Video);
        assert_eq!(
            File::new(upload("application/pdf")).category,
            FileCategory::Other
        );
    }

    #[test]
    fn category_does_not_follow_extension() {
        // A .mp4 upload declared as an image stays an image.
        let file = File::new(upload("image/gif"));
        assert!(file.is_image());
        assert!(!file.is_video());
    }

    #[test]
    fn new_file_starts_pending_without_outputs() {
        let file = File::new(upload("video/mov"));
        assert_eq!(file.status, FileStatus::Pending);
        assert!(file.processed_outputs.is_empty());
        assert_eq!(file.created_at, file.updated_at);
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            FileStatus::Pending,
            FileStatus::Processing,
            FileStatus::Completed,
            FileStatus::Failed,
        ] {
            assert_eq!(status.to_string().parse::<FileStatus>().unwrap(), status);
        }
        assert!("archived".parse::<FileStatus>().is_err());
    }
}
