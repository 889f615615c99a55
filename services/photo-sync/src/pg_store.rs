use crate::config::DatabaseConfig;
use crate::model::{FacilityAssociation, FileRecord, NewFileRecord};
use crate::storage_client::{RecordError, RecordStore};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::FromRow;
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

const COLUMNS: &str = "id, business_id, filename, original_filename, content_hash, storage_path, \
                       size_bytes, mime_type, upload_status, facility, created_at, updated_at";

/// `facility_files` row as read from Postgres
#[derive(Debug, Clone, FromRow)]
struct FileRow {
    id: Uuid,
    business_id: Uuid,
    filename: String,
    original_filename: String,
    content_hash: String,
    storage_path: String,
    size_bytes: i64,
    mime_type: String,
    upload_status: String,
    facility: Json<FacilityAssociation>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<FileRow> for FileRecord {
    fn from(row: FileRow) -> Self {
        Self {
            id: row.id,
            business_id: row.business_id,
            filename: row.filename,
            original_filename: row.original_filename,
            content_hash: row.content_hash,
            storage_path: row.storage_path,
            size_bytes: row.size_bytes,
            mime_type: row.mime_type,
            upload_status: row.upload_status,
            facility: row.facility.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

fn backend(context: &str, e: sqlx::Error) -> RecordError {
    RecordError::Backend(format!("{context}: {e}"))
}

/// Metadata store for accepted files in PostgreSQL
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    /// Create a new record store with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn find_by_hash(
        &self,
        business_id: Uuid,
        content_hash: &str,
    ) -> Result<Option<FileRecord>, RecordError> {
        let row = sqlx::query_as::<_, FileRow>(&format!(
            "SELECT {COLUMNS} FROM facility_files WHERE business_id = $1 AND content_hash = $2"
        ))
        .bind(business_id)
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| backend("Failed to look up content hash", e))?;

        Ok(row.map(FileRecord::from))
    }

    #[instrument(skip(self, record), fields(business_id = %record.business_id, storage_path = %record.storage_path))]
    async fn insert(&self, record: NewFileRecord) -> Result<FileRecord, RecordError> {
        // The unique constraint settles concurrent uploads of the same content
        let inserted = sqlx::query_as::<_, FileRow>(&format!(
            r#"
            INSERT INTO facility_files (
                id, business_id, filename, original_filename, content_hash,
                storage_path, size_bytes, mime_type, upload_status, facility,
                created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5,
                $6, $7, $8, 'uploaded', $9,
                NOW(), NOW()
            )
            ON CONFLICT (business_id, content_hash) DO NOTHING
            RETURNING {COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(record.business_id)
        .bind(&record.filename)
        .bind(&record.original_filename)
        .bind(&record.content_hash)
        .bind(&record.storage_path)
        .bind(record.size_bytes)
        .bind(&record.mime_type)
        .bind(Json(&record.facility))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| backend("Failed to insert file record", e))?;

        match inserted {
            Some(row) => {
                metrics::counter!("photo_sync.records.inserted").increment(1);
                debug!(record_id = %row.id, "File record inserted");
                Ok(row.into())
            }
            None => {
                let existing = self
                    .find_by_hash(record.business_id, &record.content_hash)
                    .await?
                    .ok_or_else(|| {
                        RecordError::Backend("conflicting row vanished before it could be read".to_string())
                    })?;
                Err(RecordError::Conflict(Box::new(existing)))
            }
        }
    }

    async fn list(&self, business_id: Uuid) -> Result<Vec<FileRecord>, RecordError> {
        let rows = sqlx::query_as::<_, FileRow>(&format!(
            "SELECT {COLUMNS} FROM facility_files WHERE business_id = $1 ORDER BY created_at DESC"
        ))
        .bind(business_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| backend("Failed to list file records", e))?;

        Ok(rows.into_iter().map(FileRecord::from).collect())
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: Uuid) -> Result<(), RecordError> {
        sqlx::query("DELETE FROM facility_files WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| backend("Failed to delete file record", e))?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), RecordError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| backend("Database ping failed", e))?;
        Ok(())
    }
}
