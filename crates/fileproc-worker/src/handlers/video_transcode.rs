use async_trait::async_trait;
use fileproc_core::models::VideoTranscodePayload;
use fileproc_core::TaskError;
use fileproc_db::FileStore;
use fileproc_processing::{TranscodeRequest, VideoTranscoder};
use std::path::PathBuf;
use std::sync::Arc;

use super::{resolve_dir, store_failure};
use crate::context::TaskContext;
use crate::envelope::Task;
use crate::registry::TaskHandler;

pub struct VideoTranscodeHandler {
    store: Arc<dyn FileStore>,
    transcoder: VideoTranscoder,
    storage_root: PathBuf,
}

impl VideoTranscodeHandler {
    pub fn new(store: Arc<dyn FileStore>, transcoder: VideoTranscoder, storage_root: PathBuf) -> Self {
        Self {
            store,
            transcoder,
            storage_root,
        }
    }

    #[tracing::instrument(skip(self, payload, ctx), fields(
        task.id = %ctx.task_id,
        file_id = %payload.file_id,
        format = %payload.format,
        resolution = %payload.resolution
    ))]
    async fn transcode(&self, payload: VideoTranscodePayload, ctx: &TaskContext) -> Result<(), TaskError> {
        let file = self
            .store
            .get_file(payload.file_id)
            .await
            .map_err(store_failure)?;
        if !file.is_video() {
            return Err(TaskError::unrecoverable(anyhow::anyhow!(
                "file {} is not a video ({})",
                file.id,
                file.mime_type
            )));
        }

        let request = TranscodeRequest {
            dir: resolve_dir(&self.storage_root, &payload.storage_path),
            filename: payload.filename,
            format: payload.format,
            quality: payload.quality,
            resolution: payload.resolution,
        };

        let mut output = self
            .transcoder
            .transcode(&request, &ctx.cancel)
            .await
            .map_err(|e| {
                if e.is_recoverable() {
                    TaskError::recoverable(e)
                } else {
                    TaskError::unrecoverable(e)
                }
            })?;
        output.storage_path = payload.storage_path;

        let stored = self
            .store
            .add_processed_output(file.id, output)
            .await
            .map_err(store_failure)?;

        tracing::info!(output_name = %stored.name, size = stored.size, "Transcoded video recorded");
        Ok(())
    }
}

#[async_trait]
impl TaskHandler for VideoTranscodeHandler {
    async fn handle(&self, task: Task, ctx: TaskContext) -> Result<(), TaskError> {
        match task {
            Task::VideoTranscode(payload) => self.transcode(payload, &ctx).await,
            other => Err(TaskError::unrecoverable(anyhow::anyhow!(
                "video transcode handler received {}",
                other.kind()
            ))),
        }
    }
}
