use async_trait::async_trait;
use chrono::Utc;
use fileproc_core::models::{FileStatus, VideoMetadataPayload};
use fileproc_core::TaskError;
use fileproc_db::FileStore;
use fileproc_processing::{write_metadata_file, MetadataError, VideoMetadataExtractor};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use super::{resolve_dir, store_failure};
use crate::context::TaskContext;
use crate::envelope::Task;
use crate::registry::TaskHandler;

fn classify(err: MetadataError) -> TaskError {
    if err.is_recoverable() {
        TaskError::recoverable(err)
    } else {
        TaskError::unrecoverable(err)
    }
}

/// Probes a stored video, writes the metadata JSON next to it and records a
/// `video_metadata` output.
pub struct VideoMetadataHandler {
    store: Arc<dyn FileStore>,
    extractor: VideoMetadataExtractor,
    storage_root: PathBuf,
}

impl VideoMetadataHandler {
    pub fn new(
        store: Arc<dyn FileStore>,
        extractor: VideoMetadataExtractor,
        storage_root: PathBuf,
    ) -> Self {
        Self {
            store,
            extractor,
            storage_root,
        }
    }

    #[tracing::instrument(skip(self, payload, ctx), fields(
        task.id = %ctx.task_id,
        file_id = %payload.file_id,
        retry_count = ctx.retry_count
    ))]
    async fn extract(&self, payload: VideoMetadataPayload, ctx: &TaskContext) -> Result<(), TaskError> {
        let file = self
            .store
            .get_file(payload.file_id)
            .await
            .map_err(store_failure)?;

        if !file.is_video() {
            self.mark(file.id, FileStatus::Failed).await;
            return Err(TaskError::unrecoverable(anyhow::anyhow!(
                "file {} is not a video ({})",
                file.id,
                file.mime_type
            )));
        }

        self.mark(file.id, FileStatus::Processing).await;

        let result = self.probe_and_record(&payload, &file, ctx).await;
        match &result {
            Ok(()) => self.mark(file.id, FileStatus::Completed).await,
            Err(err) if !err.is_recoverable() || ctx.is_final_attempt() => {
                self.mark(file.id, FileStatus::Failed).await
            }
            Err(_) => {}
        }
        result
    }

    async fn probe_and_record(
        &self,
        payload: &VideoMetadataPayload,
        file: &fileproc_core::models::File,
        ctx: &TaskContext,
    ) -> Result<(), TaskError> {
        let dir = resolve_dir(&self.storage_root, &payload.storage_path);
        let source = dir.join(&payload.filename);

        let metadata = self
            .extractor
            .extract(&source, &ctx.cancel)
            .await
            .map_err(classify)?;

        let written = write_metadata_file(&dir, file.id, &metadata)
            .await
            .map_err(classify)?;
        tracing::debug!(path = %written.display(), "Metadata file written");

        let output = metadata.into_output(file, Utc::now());
        self.store
            .add_processed_output(file.id, output)
            .await
            .map_err(store_failure)?;

        Ok(())
    }

    /// Status is informational; a failed update must not fail the task.
    async fn mark(&self, file_id: Uuid, status: FileStatus) {
        if let Err(e) = self.store.update_status(file_id, status).await {
            tracing::warn!(file_id = %file_id, status = %status, error = %e, "Failed to update file status");
        }
    }
}

#[async_trait]
impl TaskHandler for VideoMetadataHandler {
    async fn handle(&self, task: Task, ctx: TaskContext) -> Result<(), TaskError> {
        match task {
            Task::VideoExtractMetadata(payload) => self.extract(payload, &ctx).await,
            other => Err(TaskError::unrecoverable(anyhow::anyhow!(
                "video metadata handler received {}",
                other.kind()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fileproc_core::models::{File, NewFile, OutputKind, TaskKind};
    use fileproc_db::InMemoryFileStore;
    use fileproc_processing::{CommandError, CommandOutput, CommandRunner};
    use std::ffi::OsString;
    use tokio_util::sync::CancellationToken;

    const PROBE: &str = r#"{
        "streams": [
            {"codec_type": "audio", "codec_name": "aac"},
            {"codec_type": "video", "codec_name": "h264", "width": 1280, "height": 720}
        ],
        "format": {"format_name": "mov,mp4", "duration": "4.2", "bit_rate": "900000", "size": "472500"}
    }"#;

    enum Probe {
        Ok,
        Exit(i32),
    }

    struct FakeProbe(Probe);

    #[async_trait]
    impl CommandRunner for FakeProbe {
        async fn run(
            &self,
            program: &str,
            _args: &[OsString],
            _cancel: &CancellationToken,
        ) -> Result<CommandOutput, CommandError> {
            match self.0 {
                Probe::Ok => Ok(CommandOutput {
                    stdout: PROBE.as_bytes().to_vec(),
                    stderr: Vec::new(),
                }),
                Probe::Exit(code) => Err(CommandError::Failed {
                    program: program.to_string(),
                    status: Some(code),
                    output: CommandOutput {
                        stdout: Vec::new(),
                        stderr: b"moov atom not found".to_vec(),
                    },
                }),
            }
        }
    }

    fn ctx(retry_count: u32) -> TaskContext {
        TaskContext {
            task_id: Uuid::new_v4(),
            kind: TaskKind::VideoExtractMetadata,
            retry_count,
            max_retry: 3,
            cancel: CancellationToken::new(),
        }
    }

    async fn seeded(store: &InMemoryFileStore, dir: &std::path::Path, mime: &str) -> File {
        let file = File::new(NewFile {
            original_name: "clip.mp4".to_string(),
            generated_name: "clip.mp4".to_string(),
            mime_type: mime.to_string(),
            size: 472_500,
            storage_path: dir.to_string_lossy().into_owned(),
            uploaded_extension: "mp4".to_string(),
        });
        store.create_file(&file).await.unwrap();
        file
    }

    fn handler(store: Arc<InMemoryFileStore>, probe: Probe) -> VideoMetadataHandler {
        VideoMetadataHandler::new(
            store,
            VideoMetadataExtractor::new(Arc::new(FakeProbe(probe)), "ffprobe"),
            PathBuf::new(),
        )
    }

    fn task(file: &File) -> Task {
        Task::VideoExtractMetadata(VideoMetadataPayload {
            file_id: file.id,
            storage_path: file.storage_path.clone(),
            filename: "clip.mp4".to_string(),
        })
    }

    #[tokio::test]
    async fn records_metadata_and_writes_sidecar() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryFileStore::new());
        let file = seeded(&store, tmp.path(), "video/mp4").await;

        handler(store.clone(), Probe::Ok)
            .handle(task(&file), ctx(0))
            .await
            .unwrap();

        let stored = store.get_file(file.id).await.unwrap();
        assert_eq!(stored.status, FileStatus::Completed);
        assert_eq!(stored.processed_outputs.len(), 1);
        let output = &stored.processed_outputs[0];
        assert_eq!(output.kind, OutputKind::VideoMetadata);
        assert_eq!(output.name, format!("{}-metadata", file.id));
        assert_eq!(output.resolution, "1280x720");

        let sidecar = tmp.path().join(format!("{}-metadata.json", file.id));
        let written: serde_json::Value =
            serde_json::from_slice(&std::fs::read(sidecar).unwrap()).unwrap();
        assert_eq!(written["codec"], "h264");
    }

    #[tokio::test]
    async fn non_video_is_rejected_without_probing() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryFileStore::new());
        let file = seeded(&store, tmp.path(), "image/png").await;

        let err = handler(store.clone(), Probe::Exit(1))
            .handle(task(&file), ctx(0))
            .await
            .unwrap_err();

        assert!(!err.is_recoverable());
        let stored = store.get_file(file.id).await.unwrap();
        assert_eq!(stored.status, FileStatus::Failed);
        assert!(stored.processed_outputs.is_empty());
    }

    #[tokio::test]
    async fn probe_failure_is_retried_until_final_attempt() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryFileStore::new());
        let file = seeded(&store, tmp.path(), "video/mp4").await;
        let handler = handler(store.clone(), Probe::Exit(1));

        let err = handler.handle(task(&file), ctx(0)).await.unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(
            store.get_file(file.id).await.unwrap().status,
            FileStatus::Processing
        );

        handler.handle(task(&file), ctx(3)).await.unwrap_err();
        assert_eq!(
            store.get_file(file.id).await.unwrap().status,
            FileStatus::Failed
        );
    }
}
