use async_trait::async_trait;
use fileproc_core::models::{File, FileStatus, ProcessedOutput};
use uuid::Uuid;

use crate::error::StoreError;

/// Record store for files and their processed outputs.
///
/// Implementations must make `add_processed_output` safe under concurrent
/// callers: two appends to the same file both land, in completion order.
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn get_file(&self, id: Uuid) -> Result<File, StoreError>;

    /// Persist a new record as given; the category is not recomputed.
    async fn create_file(&self, file: &File) -> Result<(), StoreError>;

    /// Append one output, assigning its id and timestamps when unset.
    async fn add_processed_output(
        &self,
        file_id: Uuid,
        output: ProcessedOutput,
    ) -> Result<ProcessedOutput, StoreError>;

    async fn update_status(&self, id: Uuid, status: FileStatus) -> Result<(), StoreError>;
}
