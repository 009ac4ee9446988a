// ABOUTME: Object storage interface for workspace archive artifacts
// ABOUTME: Streams uploads and downloads so archives never sit fully in memory

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runtime::BoxedReader;

pub mod s3;

pub use s3::{S3ObjectStore, S3Settings};

#[derive(Error, Debug)]
pub enum ObjectStoreError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("Download failed: {0}")]
    Download(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ObjectStoreError>;

/// Where an uploaded object ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResult {
    pub key: String,
    pub etag: Option<String>,
    pub location: String,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload everything `body` yields under `key`.
    async fn upload(&self, key: &str, body: BoxedReader, content_type: &str)
        -> Result<UploadResult>;

    /// Open a reader over the object stored under `key`.
    async fn download_stream(&self, key: &str) -> Result<BoxedReader>;
}
