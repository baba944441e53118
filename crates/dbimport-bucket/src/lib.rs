//! Read-only access to buckets of named blobs.
//!
//! Two backends implement the same traits: an S3-compatible object store and a
//! local directory that mirrors the remote key layout. Higher layers only ever
//! see [`StorageClient`] and [`BucketRef`].

mod local;
mod s3;

pub use local::{LocalBucket, LocalStorage};
pub use s3::{S3Bucket, S3Config, S3Storage};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BucketError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("sdk error: {0}")]
    Sdk(String),
    #[error("object '{key}' not found in bucket '{bucket}'")]
    NotFound { bucket: String, key: String },
    #[error("bucket '{0}' does not exist")]
    BucketNotFound(String),
    #[error("invalid object key '{0}'")]
    InvalidKey(String),
    #[error("i/o error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl BucketError {
    pub(crate) fn from_sdk(err: impl fmt::Display) -> Self {
        Self::Sdk(err.to_string())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Resolves bucket names to bucket handles.
#[async_trait]
pub trait StorageClient: Send + Sync {
    async fn get_bucket(&self, name: &str) -> Result<BucketRef, BucketError>;
}

/// A named collection of blobs. Implementations never mutate the backing store.
#[async_trait]
pub trait Bucket: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Lazily lists object keys, optionally restricted to those starting with `prefix`.
    fn list_keys<'a>(&'a self, prefix: Option<&'a str>) -> BoxStream<'a, Result<String, BucketError>>;

    async fn read(&self, key: &str) -> Result<Bytes, BucketError>;

    async fn exists(&self, key: &str) -> Result<bool, BucketError>;
}

pub type BucketRef = Arc<dyn Bucket>;

/// Handle to a (possibly non-existent) object inside a bucket.
#[derive(Clone)]
pub struct Blob {
    bucket: BucketRef,
    name: String,
}

impl Blob {
    pub fn new(bucket: BucketRef, name: impl Into<String>) -> Self {
        Self {
            bucket,
            name: name.into(),
        }
    }

    /// Key relative to the bucket.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bucket_name(&self) -> &str {
        self.bucket.name()
    }

    /// Reads the full object. Fails with [`BucketError::NotFound`] when the
    /// object vanished after it was listed.
    pub async fn open(&self) -> Result<Bytes, BucketError> {
        self.bucket.read(&self.name).await
    }

    pub async fn exists(&self) -> Result<bool, BucketError> {
        self.bucket.exists(&self.name).await
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blob")
            .field("bucket", &self.bucket.name())
            .field("name", &self.name)
            .finish()
    }
}

/// Blob-level helpers on a shared bucket handle.
pub trait BucketExt {
    fn blob(&self, path: &str) -> Blob;
    fn list_blobs<'a>(&'a self, prefix: Option<&'a str>) -> BoxStream<'a, Result<Blob, BucketError>>;
}

impl BucketExt for BucketRef {
    fn blob(&self, path: &str) -> Blob {
        Blob::new(Arc::clone(self), path)
    }

    fn list_blobs<'a>(&'a self, prefix: Option<&'a str>) -> BoxStream<'a, Result<Blob, BucketError>> {
        self.list_keys(prefix)
            .map_ok(move |key| Blob::new(Arc::clone(self), key))
            .boxed()
    }
}

/// Selects the storage backend. This is the only place that knows which
/// implementation is active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageConfig {
    Local { root: PathBuf },
    S3(S3Config),
}

impl StorageConfig {
    pub async fn connect(&self) -> Result<Arc<dyn StorageClient>, BucketError> {
        match self {
            StorageConfig::Local { root } => Ok(Arc::new(LocalStorage::new(root.clone()))),
            StorageConfig::S3(config) => Ok(Arc::new(S3Storage::new(config.clone()).await?)),
        }
    }
}

impl FromStr for StorageConfig {
    type Err = BucketError;

    /// Accepts `s3` (settings from the environment) or `local:<directory>`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value == "s3" {
            return Ok(StorageConfig::S3(S3Config::from_env()));
        }
        match value.strip_prefix("local:") {
            Some(root) if !root.is_empty() => Ok(StorageConfig::Local {
                root: PathBuf::from(root),
            }),
            _ => Err(BucketError::Configuration(format!(
                "unknown storage '{value}', expected 's3' or 'local:<directory>'"
            ))),
        }
    }
}
