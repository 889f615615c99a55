use crate::config::S3Config;
use crate::storage_client::{BlobError, BlobStore, ProgressReporter};
use anyhow::Result;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use aws_types::region::Region;
use bytes::Bytes;
use std::ops::Range;
use tracing::{debug, info, instrument, warn};

/// Blob store backed by S3 or an S3-compatible service
pub struct S3BlobStore {
    client: S3Client,
    config: S3Config,
}

impl S3BlobStore {
    /// Create a new S3 blob store
    pub async fn new(config: &S3Config) -> Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 blob store initialized"
        );

        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    /// Simple single-part upload for small files
    async fn simple_upload(&self, path: &str, bytes: Bytes, content_type: &str) -> Result<(), BlobError> {
        self.client
            .put_object()
            .bucket(&self.config.bucket)
            .key(path)
            .body(ByteStream::from(bytes))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| blob_error("put object", e))?;
        Ok(())
    }

    /// Multipart upload for large files, reporting progress per part
    async fn multipart_upload(
        &self,
        path: &str,
        bytes: Bytes,
        content_type: &str,
        progress: &ProgressReporter,
    ) -> Result<(), BlobError> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(&self.config.bucket)
            .key(path)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| blob_error("create multipart upload", e))?;

        let upload_id = create_response
            .upload_id()
            .ok_or_else(|| BlobError::Rejected("no upload id in response".to_string()))?
            .to_string();

        match self.upload_parts(path, &upload_id, &bytes, progress).await {
            Ok(parts) => {
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.config.bucket)
                    .key(path)
                    .upload_id(&upload_id)
                    .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(parts)).build())
                    .send()
                    .await
                    .map_err(|e| blob_error("complete multipart upload", e))?;
                Ok(())
            }
            Err(e) => {
                // Abandoned parts keep costing storage until aborted
                if let Err(abort) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.config.bucket)
                    .key(path)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(storage_path = %path, error = %DisplayErrorContext(&abort), "Failed to abort multipart upload");
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        path: &str,
        upload_id: &str,
        bytes: &Bytes,
        progress: &ProgressReporter,
    ) -> Result<Vec<CompletedPart>, BlobError> {
        let total = bytes.len() as u64;
        let mut completed_parts = Vec::new();

        for (index, range) in part_ranges(bytes.len(), self.config.part_size_bytes).into_iter().enumerate() {
            let part_number = index as i32 + 1;
            let sent = range.end as u64;

            let response = self
                .client
                .upload_part()
                .bucket(&self.config.bucket)
                .key(path)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(bytes.slice(range)))
                .send()
                .await
                .map_err(|e| blob_error("upload part", e))?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(response.e_tag().unwrap_or_default())
                    .build(),
            );
            progress.report(sent, total);
        }

        Ok(completed_parts)
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    #[instrument(skip(self, bytes, progress), fields(storage_path = %path, size_bytes = bytes.len()))]
    async fn put(
        &self,
        path: &str,
        bytes: Bytes,
        content_type: &str,
        progress: &ProgressReporter,
    ) -> Result<(), BlobError> {
        let total = bytes.len() as u64;

        if bytes.len() > self.config.multipart_threshold_bytes {
            self.multipart_upload(path, bytes, content_type, progress).await?;
        } else {
            self.simple_upload(path, bytes, content_type).await?;
            progress.report(total, total);
        }

        metrics::counter!("photo_sync.bytes.uploaded").increment(total);
        debug!("Object uploaded");
        Ok(())
    }

    #[instrument(skip(self), fields(storage_path = %path))]
    async fn delete(&self, path: &str) -> Result<(), BlobError> {
        self.client
            .delete_object()
            .bucket(&self.config.bucket)
            .key(path)
            .send()
            .await
            .map_err(|e| blob_error("delete object", e))?;

        debug!("Object deleted");
        Ok(())
    }

    fn public_url(&self, path: &str) -> String {
        public_object_url(&self.config, path)
    }
}

/// Service errors are rejections; everything else is transport.
fn blob_error<E, R>(operation: &str, err: SdkError<E, R>) -> BlobError
where
    E: std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let detail = format!("{operation}: {}", DisplayErrorContext(&err));
    match err {
        SdkError::ServiceError(_) => BlobError::Rejected(detail),
        _ => BlobError::Transfer(detail),
    }
}

/// Byte ranges of each multipart part
fn part_ranges(len: usize, part_size: usize) -> Vec<Range<usize>> {
    let part_size = part_size.max(1);
    (0..len)
        .step_by(part_size)
        .map(|start| start..(start + part_size).min(len))
        .collect()
}

/// Public URL of an object: the configured base URL when there is one,
/// otherwise the endpoint (path style) or the virtual-hosted AWS URL.
fn public_object_url(config: &S3Config, path: &str) -> String {
    if let Some(ref base) = config.public_base_url {
        return format!("{}/{}", base.trim_end_matches('/'), path);
    }
    match config.endpoint_url {
        Some(ref endpoint) => format!("{}/{}/{}", endpoint.trim_end_matches('/'), config.bucket, path),
        None => format!(
            "https://{}.s3.{}.amazonaws.com/{}",
            config.bucket, config.region, path
        ),
    }
}
