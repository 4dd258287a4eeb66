// dbbackup/src/backup/s3_upload.rs
use std::path::Path;

use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::error::DisplayErrorContext;
use s3::primitives::ByteStream;
use s3::types::{CompletedMultipartUpload, CompletedPart};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::StorageConfig;
use crate::errors::{AppError, Result};

/// Files above this size are sent as a multipart upload in parts of this size.
const PART_SIZE: u64 = 16 * 1024 * 1024;
/// S3 rejects multipart uploads with more parts than this.
const MAX_PARTS: u64 = 10_000;

/// Destination for finished backup artifacts.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Uploads `path` under `prefix` and returns the object key.
    async fn upload_file(&self, prefix: &str, path: &Path) -> Result<String>;
}

/// `prefix/basename(path)`, without a leading slash.
pub fn object_key(prefix: &str, path: &Path) -> String {
    let base = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        base
    } else {
        format!("{}/{}", prefix, base)
    }
}

fn upload_error<E>(key: &str, err: E) -> AppError
where
    E: std::error::Error,
{
    AppError::Upload {
        key: key.to_string(),
        message: DisplayErrorContext(err).to_string(),
    }
}

fn needs_multipart(size: u64) -> bool {
    size > PART_SIZE
}

/// One byte range of a multipart upload. Part numbers start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PartPlan {
    number: i32,
    offset: u64,
    len: u64,
}

/// Splits `size` bytes into parts of `PART_SIZE`, growing the part size when
/// the file would otherwise need more than `MAX_PARTS` parts.
fn plan_parts(size: u64) -> Vec<PartPlan> {
    let part_size = PART_SIZE.max(size.div_ceil(MAX_PARTS));
    let mut parts = Vec::new();
    let mut offset = 0;
    while offset < size {
        let len = part_size.min(size - offset);
        parts.push(PartPlan {
            number: parts.len() as i32 + 1,
            offset,
            len,
        });
        offset += len;
    }
    parts
}

fn validate_endpoint(endpoint: &str) -> Result<()> {
    let invalid = |why: String| AppError::Config(format!("S3_ENDPOINT '{}' is not a valid URL: {}", endpoint, why));
    let url = Url::parse(endpoint).map_err(|e| invalid(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(invalid("missing host".to_string()));
    }
    Ok(())
}

/// Uploads to an S3-compatible object storage service.
pub struct S3Uploader {
    client: s3::Client,
    bucket: String,
}

impl S3Uploader {
    /// Builds the client from the default AWS configuration chain, applying a
    /// custom endpoint and path-style addressing when configured.
    pub async fn new(storage: &StorageConfig) -> Result<Self> {
        if let Some(endpoint) = &storage.endpoint {
            validate_endpoint(endpoint)?;
        }
        let sdk_config = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .load()
            .await;
        Self::from_sdk_config(&sdk_config, storage)
    }

    pub fn from_sdk_config(sdk_config: &aws_config::SdkConfig, storage: &StorageConfig) -> Result<Self> {
        let mut builder = s3::config::Builder::from(sdk_config);
        if let Some(endpoint) = &storage.endpoint {
            validate_endpoint(endpoint)?;
            builder = builder.endpoint_url(endpoint);
        }
        if storage.force_path_style {
            builder = builder.force_path_style(true);
        }

        info!(
            bucket = %storage.bucket,
            endpoint = storage.endpoint.as_deref().unwrap_or("default"),
            path_style = storage.force_path_style,
            "S3 client configured"
        );
        Ok(S3Uploader {
            client: s3::Client::from_conf(builder.build()),
            bucket: storage.bucket.clone(),
        })
    }

    async fn put_single(&self, key: &str, path: &Path) -> Result<()> {
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| upload_error(key, e))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| upload_error(key, e))?;
        Ok(())
    }

    async fn put_multipart(&self, key: &str, file: File, size: u64) -> Result<()> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| upload_error(key, e))?;
        let upload_id = created.upload_id().ok_or_else(|| AppError::Upload {
            key: key.to_string(),
            message: "storage returned no multipart upload id".to_string(),
        })?;

        match self.upload_parts(key, upload_id, file, size).await {
            Ok(parts) => {
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .multipart_upload(
                        CompletedMultipartUpload::builder()
                            .set_parts(Some(parts))
                            .build(),
                    )
                    .send()
                    .await
                    .map_err(|e| upload_error(key, e))?;
                Ok(())
            }
            Err(e) => {
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .send()
                    .await
                {
                    warn!(
                        "Failed to abort multipart upload {} for {}: {}",
                        upload_id,
                        key,
                        DisplayErrorContext(abort_err)
                    );
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        mut file: File,
        size: u64,
    ) -> Result<Vec<CompletedPart>> {
        let plan = plan_parts(size);
        let mut parts = Vec::with_capacity(plan.len());

        for part in plan {
            let mut buf = vec![0u8; part.len as usize];
            file.read_exact(&mut buf)
                .await
                .map_err(|e| AppError::io(format!("reading part {} of {}", part.number, key), e))?;

            let uploaded = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part.number)
                .body(ByteStream::from(buf))
                .send()
                .await
                .map_err(|e| upload_error(key, e))?;
            debug!("Uploaded part {} of {} (offset {})", part.number, key, part.offset);

            parts.push(
                CompletedPart::builder()
                    .set_e_tag(uploaded.e_tag().map(str::to_string))
                    .part_number(part.number)
                    .build(),
            );
        }
        Ok(parts)
    }
}

#[async_trait]
impl ObjectStore for S3Uploader {
    async fn upload_file(&self, prefix: &str, path: &Path) -> Result<String> {
        let key = object_key(prefix, path);
        let file = File::open(path)
            .await
            .map_err(|e| AppError::io(format!("opening {} for upload", path.display()), e))?;
        let size = file
            .metadata()
            .await
            .map_err(|e| AppError::io(format!("reading metadata of {}", path.display()), e))?
            .len();

        info!(
            "Uploading {} ({} bytes) to s3://{}/{}",
            path.display(),
            size,
            self.bucket,
            key
        );

        if needs_multipart(size) {
            self.put_multipart(&key, file, size).await?;
        } else {
            drop(file);
            self.put_single(&key, path).await?;
        }

        info!("Uploaded {} to s3://{}/{}", path.display(), self.bucket, key);
        Ok(key)
    }
}
