use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fileproc_core::models::{File, FileStatus, ProcessedOutput};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::FileStore;

#[derive(sqlx::FromRow)]
struct FileRow {
    id: Uuid,
    original_name: String,
    generated_name: String,
    mime_type: String,
    size: i64,
    storage_path: String,
    uploaded_extension: String,
    category: String,
    status: String,
    processed_outputs: Json<Vec<ProcessedOutput>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<FileRow> for File {
    type Error = StoreError;

    fn try_from(row: FileRow) -> Result<Self, Self::Error> {
        Ok(File {
            id: row.id,
            original_name: row.original_name,
            generated_name: row.generated_name,
            mime_type: row.mime_type,
            size: row.size,
            storage_path: row.storage_path,
            uploaded_extension: row.uploaded_extension,
            category: row
                .category
                .parse()
                .map_err(|e| StoreError::Corrupt(format!("{}", e)))?,
            status: row
                .status
                .parse()
                .map_err(|e| StoreError::Corrupt(format!("{}", e)))?,
            processed_outputs: row.processed_outputs.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Clone)]
pub struct FileRepository {
    pool: PgPool,
}

impl FileRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FileStore for FileRepository {
    #[tracing::instrument(skip(self), fields(db.table = "files", db.operation = "select", db.record_id = %id))]
    async fn get_file(&self, id: Uuid) -> Result<File, StoreError> {
        let row: Option<FileRow> = sqlx::query_as::<Postgres, FileRow>(
            r#"
            SELECT
                id,
                original_name,
                generated_name,
                mime_type,
                size,
                storage_path,
                uploaded_extension,
                category,
                status,
                processed_outputs,
                created_at,
                updated_at
            FROM files
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or(StoreError::NotFound(id))?.try_into()
    }

    #[tracing::instrument(skip(self, file), fields(db.table = "files", db.operation = "insert", db.record_id = %file.id))]
    async fn create_file(&self, file: &File) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO files (
                id, original_name, generated_name, mime_type, size, storage_path,
                uploaded_extension, category, status, processed_outputs, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(file.id)
        .bind(&file.original_name)
        .bind(&file.generated_name)
        .bind(&file.mime_type)
        .bind(file.size)
        .bind(&file.storage_path)
        .bind(&file.uploaded_extension)
        .bind(file.category.to_string())
        .bind(file.status.to_string())
        .bind(Json(&file.processed_outputs))
        .bind(file.created_at)
        .bind(file.updated_at)
        .execute(&self.pool)
        .await?;

        tracing::debug!(file_id = %file.id, category = %file.category, "File record created");
        Ok(())
    }

    /// Uses atomic PostgreSQL jsonb || to avoid read-modify-write races.
    #[tracing::instrument(skip(self, output), fields(db.table = "files", db.operation = "update", db.record_id = %file_id, output.kind = %output.kind))]
    async fn add_processed_output(
        &self,
        file_id: Uuid,
        output: ProcessedOutput,
    ) -> Result<ProcessedOutput, StoreError> {
        let output = output.stamp(Utc::now());
        let value = serde_json::to_value(&output)?;

        let row: Option<(Uuid,)> = sqlx::query_as::<Postgres, (Uuid,)>(
            r#"
            UPDATE files
            SET processed_outputs = COALESCE(processed_outputs, '[]'::jsonb) || jsonb_build_array($2::jsonb),
                updated_at = NOW()
            WHERE id = $1
            RETURNING id
            "#,
        )
        .bind(file_id)
        .bind(value)
        .fetch_optional(&self.pool)
        .await?;

        if row.is_none() {
            return Err(StoreError::NotFound(file_id));
        }

        tracing::info!(
            file_id = %file_id,
            output_id = ?output.id,
            kind = %output.kind,
            "Processed output appended"
        );
        Ok(output)
    }

    #[tracing::instrument(skip(self), fields(db.table = "files", db.operation = "update", db.record_id = %id))]
    async fn update_status(&self, id: Uuid, status: FileStatus) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE files
            SET status = $2,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }

        tracing::debug!(file_id = %id, status = %status, "File status updated");
        Ok(())
    }
}
