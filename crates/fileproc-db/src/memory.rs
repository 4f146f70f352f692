use async_trait::async_trait;
use chrono::Utc;
use fileproc_core::models::{File, FileStatus, ProcessedOutput};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::FileStore;

pub const DEFAULT_MAX_CONFLICT_RETRIES: u32 = 5;

#[derive(Clone)]
struct Versioned {
    file: File,
    version: u64,
}

/// Process-local record store.
///
/// Appends follow an optimistic protocol: snapshot the record and its version,
/// build the new output list off-lock, then commit only if the version is
/// unchanged. A lost race is retried up to `max_conflict_retries` times.
#[derive(Clone)]
pub struct InMemoryFileStore {
    files: Arc<Mutex<HashMap<Uuid, Versioned>>>,
    max_conflict_retries: u32,
}

impl Default for InMemoryFileStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryFileStore {
    pub fn new() -> Self {
        Self::with_max_conflict_retries(DEFAULT_MAX_CONFLICT_RETRIES)
    }

    pub fn with_max_conflict_retries(max_conflict_retries: u32) -> Self {
        Self {
            files: Arc::new(Mutex::new(HashMap::new())),
            max_conflict_retries,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Versioned>> {
        // A panicked writer never leaves a half-applied record behind.
        self.files.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn snapshot(&self, id: Uuid) -> Result<Versioned, StoreError> {
        self.lock().get(&id).cloned().ok_or(StoreError::NotFound(id))
    }

    /// Swap in `file` if the stored version is still `expected`.
    fn compare_and_swap(&self, file: File, expected: u64) -> Result<bool, StoreError> {
        let mut files = self.lock();
        let entry = files.get_mut(&file.id).ok_or(StoreError::NotFound(file.id))?;
        if entry.version != expected {
            return Ok(false);
        }
        entry.file = file;
        entry.version += 1;
        Ok(true)
    }
}

#[async_trait]
impl FileStore for InMemoryFileStore {
    async fn get_file(&self, id: Uuid) -> Result<File, StoreError> {
        Ok(self.snapshot(id)?.file)
    }

    async fn create_file(&self, file: &File) -> Result<(), StoreError> {
        self.lock().insert(
            file.id,
            Versioned {
                file: file.clone(),
                version: 0,
            },
        );
        Ok(())
    }

    #[tracing::instrument(skip(self, output), fields(file_id = %file_id, output.kind = %output.kind))]
    async fn add_processed_output(
        &self,
        file_id: Uuid,
        output: ProcessedOutput,
    ) -> Result<ProcessedOutput, StoreError> {
        let output = output.stamp(Utc::now());
        let attempts = self.max_conflict_retries + 1;

        for attempt in 1..=attempts {
            let Versioned { mut file, version } = self.snapshot(file_id)?;

            // Let other writers run between read and commit.
            tokio::task::yield_now().await;

            file.processed_outputs.push(output.clone());
            file.updated_at = Utc::now();

            if self.compare_and_swap(file, version)? {
                return Ok(output);
            }

            tracing::debug!(
                file_id = %file_id,
                attempt = attempt,
                "Concurrent append detected, retrying"
            );
        }

        tracing::warn!(file_id = %file_id, attempts = attempts, "Append conflict retries exhausted");
        Err(StoreError::Conflict { file_id, attempts })
    }

    async fn update_status(&self, id: Uuid, status: FileStatus) -> Result<(), StoreError> {
        let mut files = self.lock();
        let entry = files.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        entry.file.status = status;
        entry.file.updated_at = Utc::now();
        entry.version += 1;
        Ok(())
    }
}
