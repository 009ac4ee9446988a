// ABOUTME: S3-compatible object storage backend for workspace archives
// ABOUTME: Uploads via bounded multipart parts with retry, downloads as an async reader

use super::{ObjectStore, ObjectStoreError, Result, UploadResult};
use crate::runtime::BoxedReader;
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketLocationConstraint, CompletedMultipartUpload, CompletedPart, CreateBucketConfiguration,
};
use aws_sdk_s3::Client;
use bytes::Bytes;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

/// Multipart part size. S3 requires at least 5 MiB for every part but the last.
pub const PART_SIZE: usize = 8 * 1024 * 1024;

const RETRY_MAX_ELAPSED: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct S3Settings {
    pub endpoint: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub force_path_style: bool,
}

#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
    region: String,
    endpoint: String,
    part_size: usize,
}

impl S3ObjectStore {
    pub async fn connect(settings: S3Settings) -> Self {
        let credentials = Credentials::new(
            &settings.access_key,
            &settings.secret_key,
            None,
            None,
            "sandcastle",
        );

        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()))
            .credentials_provider(credentials)
            .endpoint_url(&settings.endpoint)
            .load()
            .await;

        let config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(settings.force_path_style)
            .build();

        Self::with_client(
            Client::from_conf(config),
            settings.bucket,
            settings.region,
            settings.endpoint,
        )
    }

    pub fn with_client(client: Client, bucket: String, region: String, endpoint: String) -> Self {
        Self {
            client,
            bucket,
            region,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            part_size: PART_SIZE,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Create the archive bucket unless it is already there.
    pub async fn ensure_bucket(&self) -> Result<()> {
        let mut request = self.client.create_bucket().bucket(&self.bucket);
        if self.region != "us-east-1" {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }

        match request.send().await {
            Ok(_) => {
                info!("Created bucket {}", self.bucket);
                Ok(())
            }
            Err(err) => {
                let exists = err
                    .as_service_error()
                    .map(|e| e.is_bucket_already_owned_by_you() || e.is_bucket_already_exists())
                    .unwrap_or(false);
                if exists {
                    debug!("Bucket {} already exists", self.bucket);
                    Ok(())
                } else {
                    Err(ObjectStoreError::Configuration(format!(
                        "failed to create bucket {}: {}",
                        self.bucket,
                        DisplayErrorContext(&err)
                    )))
                }
            }
        }
    }

    fn location(&self, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, self.bucket, key)
    }

    async fn with_retry<F, T, Fut>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        use backoff::{future::retry, ExponentialBackoff};

        let backoff = ExponentialBackoff {
            max_elapsed_time: Some(RETRY_MAX_ELAPSED),
            ..Default::default()
        };

        retry(backoff, || async {
            match operation().await {
                Ok(result) => Ok(result),
                Err(e @ ObjectStoreError::Network(_)) => {
                    warn!("Transient object storage error, retrying: {}", e);
                    Err(backoff::Error::transient(e))
                }
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        })
        .await
    }

    async fn put_small(&self, key: &str, body: Bytes, content_type: &str) -> Result<UploadResult> {
        let output = self
            .with_retry(|| {
                let body = body.clone();
                async move {
                    self.client
                        .put_object()
                        .bucket(&self.bucket)
                        .key(key)
                        .content_type(content_type)
                        .body(ByteStream::from(body))
                        .send()
                        .await
                        .map_err(|e| classify(e, ObjectStoreError::Upload))
                }
            })
            .await?;

        Ok(UploadResult {
            key: key.to_string(),
            etag: output.e_tag().map(str::to_string),
            location: self.location(key),
        })
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        first: Bytes,
        body: &mut BoxedReader,
    ) -> Result<Option<String>> {
        let mut parts = Vec::new();
        let mut next = first;
        let mut part_number: i32 = 1;

        while !next.is_empty() {
            let output = self
                .with_retry(|| {
                    let chunk = next.clone();
                    async move {
                        self.client
                            .upload_part()
                            .bucket(&self.bucket)
                            .key(key)
                            .upload_id(upload_id)
                            .part_number(part_number)
                            .body(ByteStream::from(chunk))
                            .send()
                            .await
                            .map_err(|e| classify(e, ObjectStoreError::Upload))
                    }
                })
                .await?;

            debug!("Uploaded part {} of {} ({} bytes)", part_number, key, next.len());
            parts.push(
                CompletedPart::builder()
                    .set_e_tag(output.e_tag().map(str::to_string))
                    .part_number(part_number)
                    .build(),
            );

            part_number += 1;
            next = read_part(body, self.part_size).await?;
        }

        let completed = self
            .with_retry(|| {
                let upload = CompletedMultipartUpload::builder()
                    .set_parts(Some(parts.clone()))
                    .build();
                async move {
                    self.client
                        .complete_multipart_upload()
                        .bucket(&self.bucket)
                        .key(key)
                        .upload_id(upload_id)
                        .multipart_upload(upload)
                        .send()
                        .await
                        .map_err(|e| classify(e, ObjectStoreError::Upload))
                }
            })
            .await?;

        Ok(completed.e_tag().map(str::to_string))
    }

    async fn abort(&self, key: &str, upload_id: &str) {
        let result = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await;
        if let Err(e) = result {
            warn!(
                "Failed to abort multipart upload {} for {}: {}",
                upload_id,
                key,
                DisplayErrorContext(&e)
            );
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn upload(
        &self,
        key: &str,
        mut body: BoxedReader,
        content_type: &str,
    ) -> Result<UploadResult> {
        info!("Uploading {} to bucket {}", key, self.bucket);

        let first = read_part(&mut body, self.part_size).await?;
        if first.len() < self.part_size {
            return self.put_small(key, first, content_type).await;
        }

        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| classify(e, ObjectStoreError::Upload))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| ObjectStoreError::Upload("missing multipart upload id".to_string()))?
            .to_string();

        match self.upload_parts(key, &upload_id, first, &mut body).await {
            Ok(etag) => {
                info!("Uploaded {} to bucket {}", key, self.bucket);
                Ok(UploadResult {
                    key: key.to_string(),
                    etag,
                    location: self.location(key),
                })
            }
            Err(e) => {
                self.abort(key, &upload_id).await;
                Err(e)
            }
        }
    }

    async fn download_stream(&self, key: &str) -> Result<BoxedReader> {
        debug!("Opening download stream for {}", key);

        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| {
                let missing_key = err
                    .as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false);
                let status_404 = err
                    .raw_response()
                    .map(|r| r.status().as_u16() == 404)
                    .unwrap_or(false);
                if missing_key || status_404 {
                    ObjectStoreError::NotFound(key.to_string())
                } else {
                    classify(err, ObjectStoreError::Download)
                }
            })?;

        Ok(Box::pin(output.body.into_async_read()))
    }
}

/// Read until `size` bytes are buffered or the reader is exhausted.
async fn read_part(body: &mut BoxedReader, size: usize) -> Result<Bytes> {
    let mut part = Vec::with_capacity(size);
    (&mut *body).take(size as u64).read_to_end(&mut part).await?;
    Ok(Bytes::from(part))
}

/// Timeouts and dispatch failures are worth retrying; everything else is final.
fn classify<E, R>(err: SdkError<E, R>, wrap: fn(String) -> ObjectStoreError) -> ObjectStoreError
where
    E: std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let message = DisplayErrorContext(&err).to_string();
    match err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
            ObjectStoreError::Network(message)
        }
        _ => wrap(message),
    }
}
