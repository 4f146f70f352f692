//! Task handlers wiring the media engines to the record store.

mod image_resize;
mod video_metadata;
mod video_transcode;

pub use image_resize::ImageResizeHandler;
pub use video_metadata::VideoMetadataHandler;
pub use video_transcode::VideoTranscodeHandler;

use fileproc_core::models::TaskKind;
use fileproc_core::{AppError, ErrorMetadata, LogLevel, TaskError, WorkerConfig};
use fileproc_db::{FileStore, StoreError};
use fileproc_processing::{CommandRunner, ImageResizer, VideoMetadataExtractor, VideoTranscoder};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::registry::{HandlerRegistry, RegistryError};

/// Classify a store failure through the shared error metadata table, logging
/// it at the level the table assigns.
pub(crate) fn store_failure(err: StoreError) -> TaskError {
    let err = AppError::from(err);
    let code = err.error_code();
    match err.log_level() {
        LogLevel::Debug => tracing::debug!(error.code = code, error = %err, "Store operation failed"),
        LogLevel::Warn => tracing::warn!(error.code = code, error = %err, "Store operation failed"),
        LogLevel::Error => tracing::error!(error.code = code, error = %err, "Store operation failed"),
    }
    TaskError::from(err)
}

/// Payload paths are relative to the storage root unless already absolute.
pub(crate) fn resolve_dir(storage_root: &Path, storage_path: &str) -> PathBuf {
    storage_root.join(storage_path)
}

/// Registry with a handler for every known task kind.
pub fn default_registry(
    store: Arc<dyn FileStore>,
    runner: Arc<dyn CommandRunner>,
    config: &WorkerConfig,
) -> Result<HandlerRegistry, RegistryError> {
    let root = config.storage_root.clone();

    let registry = HandlerRegistry::builder()
        .register(
            TaskKind::ImageResize,
            Arc::new(ImageResizeHandler::new(
                store.clone(),
                ImageResizer::new(),
                root.clone(),
            )),
        )?
        .register(
            TaskKind::VideoExtractMetadata,
            Arc::new(VideoMetadataHandler::new(
                store.clone(),
                VideoMetadataExtractor::new(runner.clone(), config.ffprobe_path.clone()),
                root.clone(),
            )),
        )?
        .register(
            TaskKind::VideoTranscode,
            Arc::new(VideoTranscodeHandler::new(
                store,
                VideoTranscoder::new(runner, config.ffmpeg_path.clone()),
                root,
            )),
        )?
        .build();

    Ok(registry)
}
