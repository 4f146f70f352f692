use fileproc_core::models::{OutputKind, ProcessedOutput};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::ImageReader;
use std::fs::OpenOptions;
use std::io::{BufWriter, Cursor, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const JPEG_QUALITY: u8 = 90;
pub const RESIZED_EXTENSION: &str = "jpg";

#[derive(Debug, thiserror::Error)]
pub enum ResizeError {
    #[error("invalid resize parameters: {0}")]
    InvalidParameters(String),

    #[error("failed to read source image {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode source image {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to encode resized image: {0}")]
    Encode(#[source] image::ImageError),

    #[error("failed to write resized image {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ResizeError {
    /// Bad parameters and undecodable sources fail the same way every time.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ResizeError::Read { .. } | ResizeError::Write { .. })
    }
}

/// Resizes stored images into JPEG siblings.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageResizer;

impl ImageResizer {
    pub fn new() -> Self {
        Self
    }

    /// Resize `{dir}/{filename}` to exactly `width`x`height`.
    ///
    /// The result is written as `resized_{id}.jpg` in the same directory, where
    /// `id` is also the returned output's id. Blocking; run it off the async
    /// executor.
    pub fn resize(
        &self,
        dir: &Path,
        filename: &str,
        width: i32,
        height: i32,
    ) -> Result<ProcessedOutput, ResizeError> {
        if width <= 0 || height <= 0 || filename.is_empty() {
            tracing::warn!(
                filename = %filename,
                width = width,
                height = height,
                "Rejected resize request"
            );
            return Err(ResizeError::InvalidParameters(format!(
                "width={} height={} filename={:?}",
                width, height, filename
            )));
        }

        let source_path = dir.join(filename);

        let bytes = std::fs::read(&source_path).map_err(|source| ResizeError::Read {
            path: source_path.clone(),
            source,
        })?;

        let img = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|source| ResizeError::Read {
                path: source_path.clone(),
                source,
            })?
            .decode()
            .map_err(|source| ResizeError::Decode {
                path: source_path.clone(),
                source,
            })?;

        let resized = img
            .resize_exact(width as u32, height as u32, FilterType::Lanczos3)
            .to_rgb8();

        let mut encoded = Vec::new();
        JpegEncoder::new_with_quality(&mut encoded, JPEG_QUALITY)
            .encode_image(&resized)
            .map_err(ResizeError::Encode)?;

        let id = Uuid::new_v4();
        let name = format!("resized_{}.{}", id, RESIZED_EXTENSION);
        let output_path = dir.join(&name);
        write_new(&output_path, &encoded).map_err(|source| ResizeError::Write {
            path: output_path.clone(),
            source,
        })?;

        tracing::info!(
            source = %source_path.display(),
            output = %output_path.display(),
            width = width,
            height = height,
            "Image resized"
        );

        let mut output = ProcessedOutput::new(OutputKind::ResizedImage);
        output.id = Some(id);
        output.storage_path = dir.to_string_lossy().into_owned();
        output.name = name;
        output.extension = RESIZED_EXTENSION.to_string();
        output.format = "jpeg".to_string();
        output.width = width;
        output.height = height;
        output.resolution = format!("{}x{}", width, height);
        output.size = encoded.len() as i64;
        Ok(output)
    }
}

/// Write to a path that must not exist yet.
fn write_new(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let file = OpenOptions::new().write(true).create_new(true).open(path)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(bytes)?;
    writer.flush()
}
