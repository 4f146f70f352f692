use anyhow::Context;
use async_trait::async_trait;
use fileproc_core::models::ImageResizePayload;
use fileproc_core::TaskError;
use fileproc_db::FileStore;
use fileproc_processing::ImageResizer;
use std::path::PathBuf;
use std::sync::Arc;

use super::{resolve_dir, store_failure};
use crate::context::TaskContext;
use crate::envelope::Task;
use crate::registry::TaskHandler;

pub struct ImageResizeHandler {
    store: Arc<dyn FileStore>,
    resizer: ImageResizer,
    storage_root: PathBuf,
}

impl ImageResizeHandler {
    pub fn new(store: Arc<dyn FileStore>, resizer: ImageResizer, storage_root: PathBuf) -> Self {
        Self {
            store,
            resizer,
            storage_root,
        }
    }

    #[tracing::instrument(skip(self, payload, ctx), fields(
        task.id = %ctx.task_id,
        file_id = %payload.file_id,
        width = payload.width,
        height = payload.height
    ))]
    async fn resize(&self, payload: ImageResizePayload, ctx: &TaskContext) -> Result<(), TaskError> {
        // Existence only; the category is not checked here.
        self.store
            .get_file(payload.file_id)
            .await
            .map_err(store_failure)?;

        let resizer = self.resizer;
        let dir = resolve_dir(&self.storage_root, &payload.storage_path);
        let filename = payload.filename.clone();
        let (width, height) = (payload.width, payload.height);

        let mut output = tokio::task::spawn_blocking(move || {
            resizer.resize(&dir, &filename, width, height)
        })
        .await
        .context("Resize task panicked")
        .map_err(TaskError::recoverable)?
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
            .add_processed_output(payload.file_id, output)
            .await
            .map_err(store_failure)?;

        tracing::info!(output_name = %stored.name, "Resized image recorded");
        Ok(())
    }
}

#[async_trait]
impl TaskHandler for ImageResizeHandler {
    async fn handle(&self, task: Task, ctx: TaskContext) -> Result<(), TaskError> {
        match task {
            Task::ImageResize(payload) => self.resize(payload, &ctx).await,
            other => Err(TaskError::unrecoverable(anyhow::anyhow!(
                "image resize handler received {}",
                other.kind()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fileproc_core::models::{File, NewFile, OutputKind};
    use fileproc_db::InMemoryFileStore;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn ctx() -> TaskContext {
        TaskContext {
            task_id: Uuid::new_v4(),
            kind: fileproc_core::models::TaskKind::ImageResize,
            retry_count: 0,
            max_retry: 3,
            cancel: CancellationToken::new(),
        }
    }

    async fn seeded(store: &InMemoryFileStore, dir: &std::path::Path) -> File {
        image::RgbImage::from_pixel(64, 48, image::Rgb([200, 30, 30]))
            .save(dir.join("source.png"))
            .unwrap();
        let file = File::new(NewFile {
            original_name: "source.png".to_string(),
            generated_name: "source.png".to_string(),
            mime_type: "image/png".to_string(),
            size: 0,
            storage_path: dir.to_string_lossy().into_owned(),
            uploaded_extension: "png".to_string(),
        });
        store.create_file(&file).await.unwrap();
        file
    }

    #[tokio::test]
    async fn records_resized_output() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryFileStore::new());
        let file = seeded(&store, tmp.path()).await;
        let handler =
            ImageResizeHandler::new(store.clone(), ImageResizer::new(), PathBuf::from("/unused"));

        let payload = ImageResizePayload {
            file_id: file.id,
            storage_path: file.storage_path.clone(),
            filename: "source.png".to_string(),
            width: 16,
            height: 12,
        };
        handler.handle(Task::ImageResize(payload), ctx()).await.unwrap();

        let stored = store.get_file(file.id).await.unwrap();
        assert_eq!(stored.processed_outputs.len(), 1);
        let output = &stored.processed_outputs[0];
        assert_eq!(output.kind, OutputKind::ResizedImage);
        assert_eq!((output.width, output.height), (16, 12));
        assert!(tmp.path().join(&output.name).exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_utf8_storage_root_is_not_mangled() {
        use std::os::unix::ffi::OsStrExt;

        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join(std::ffi::OsStr::from_bytes(b"m\xe9dia"));
        std::fs::create_dir_all(root.join("uploads")).unwrap();
        image::RgbImage::from_pixel(20, 20, image::Rgb([0, 90, 0]))
            .save(root.join("uploads").join("leaf.png"))
            .unwrap();

        let store = Arc::new(InMemoryFileStore::new());
        let file = File::new(NewFile {
            original_name: "leaf.png".to_string(),
            generated_name: "leaf.png".to_string(),
            mime_type: "image/png".to_string(),
            size: 0,
            storage_path: "uploads".to_string(),
            uploaded_extension: "png".to_string(),
        });
        store.create_file(&file).await.unwrap();
        let handler = ImageResizeHandler::new(store.clone(), ImageResizer::new(), root.clone());

        handler
            .handle(
                Task::ImageResize(ImageResizePayload {
                    file_id: file.id,
                    storage_path: "uploads".to_string(),
                    filename: "leaf.png".to_string(),
                    width: 10,
                    height: 10,
                }),
                ctx(),
            )
            .await
            .unwrap();

        let stored = store.get_file(file.id).await.unwrap();
        let output = &stored.processed_outputs[0];
        assert_eq!(output.storage_path, "uploads");
        assert!(root.join("uploads").join(&output.name).exists());
    }

    #[tokio::test]
    async fn invalid_dimensions_are_unrecoverable() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryFileStore::new());
        let file = seeded(&store, tmp.path()).await;
        let handler = ImageResizeHandler::new(store.clone(), ImageResizer::new(), PathBuf::new());

        let err = handler
            .handle(
                Task::ImageResize(ImageResizePayload {
                    file_id: file.id,
                    storage_path: file.storage_path.clone(),
                    filename: "source.png".to_string(),
                    width: 0,
                    height: 12,
                }),
                ctx(),
            )
            .await
            .unwrap_err();
        assert!(!err.is_recoverable());
        assert!(store.get_file(file.id).await.unwrap().processed_outputs.is_empty());
    }

    #[tokio::test]
    async fn unknown_file_is_unrecoverable() {
        let store = Arc::new(InMemoryFileStore::new());
        let handler = ImageResizeHandler::new(store, ImageResizer::new(), PathBuf::new());

        let err = handler
            .handle(
                Task::ImageResize(ImageResizePayload {
                    file_id: Uuid::new_v4(),
                    storage_path: "/nowhere".to_string(),
                    filename: "a.png".to_string(),
                    width: 10,
                    height: 10,
                }),
                ctx(),
            )
            .await
            .unwrap_err();
        assert!(!err.is_recoverable());
    }
}
