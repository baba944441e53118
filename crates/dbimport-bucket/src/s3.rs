use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::provider::SharedCredentialsProvider;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::Client;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::sync::Arc;
use tracing::debug;

use crate::{Bucket, BucketError, BucketRef, StorageClient};

/// Connection settings for an S3-compatible endpoint. Google Cloud Storage is
/// reachable through its interoperability endpoint with HMAC keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Config {
    pub region: String,
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    pub force_path_style: bool,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            endpoint: None,
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
            force_path_style: false,
        }
    }
}

impl S3Config {
    pub fn from_env() -> Self {
        let var = |key: &str| std::env::var(key).ok().filter(|value| !value.is_empty());
        let defaults = Self::default();
        Self {
            region: var("S3_REGION").unwrap_or(defaults.region),
            endpoint: var("S3_ENDPOINT_URL"),
            access_key_id: var("S3_ACCESS_KEY_ID"),
            secret_access_key: var("S3_SECRET_ACCESS_KEY"),
            session_token: var("S3_SESSION_TOKEN"),
            force_path_style: var("S3_FORCE_PATH_STYLE")
                .map(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
        }
    }
}

#[derive(Clone)]
pub struct S3Storage {
    client: Client,
}

impl S3Storage {
    pub async fn new(config: S3Config) -> Result<Self, BucketError> {
        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(config.region.clone()));

        match (&config.access_key_id, &config.secret_access_key) {
            (Some(access_key), Some(secret_key)) => {
                let credentials = Credentials::new(
                    access_key,
                    secret_key,
                    config.session_token.clone(),
                    None,
                    "static",
                );
                loader = loader.credentials_provider(SharedCredentialsProvider::new(credentials));
            }
            (None, None) => {}
            _ => {
                return Err(BucketError::Configuration(
                    "S3 access key id and secret access key must be set together".into(),
                ))
            }
        }

        let shared_config = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared_config);

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        if config.force_path_style {
            builder = builder.force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
        })
    }
}

#[async_trait]
impl StorageClient for S3Storage {
    async fn get_bucket(&self, name: &str) -> Result<BucketRef, BucketError> {
        if name.is_empty() {
            return Err(BucketError::Configuration(
                "bucket name cannot be empty".into(),
            ));
        }
        Ok(Arc::new(S3Bucket {
            client: self.client.clone(),
            name: name.to_string(),
        }))
    }
}

#[derive(Clone)]
pub struct S3Bucket {
    client: Client,
    name: String,
}

impl std::fmt::Debug for S3Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Bucket").field("name", &self.name).finish()
    }
}

#[async_trait]
impl Bucket for S3Bucket {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_keys<'a>(&'a self, prefix: Option<&'a str>) -> BoxStream<'a, Result<String, BucketError>> {
        let mut request = self.client.list_objects_v2().bucket(&self.name);
        if let Some(prefix) = prefix {
            request = request.prefix(prefix);
        }
        let pages = request.into_paginator().send();

        stream::try_unfold(pages, |mut pages| async move {
            match pages.next().await {
                Some(page) => {
                    let page = page.map_err(BucketError::from_sdk)?;
                    let keys: Vec<Result<String, BucketError>> = page
                        .contents()
                        .iter()
                        .filter_map(|object| object.key())
                        // Zero-byte "directory" markers are not blobs.
                        .filter(|key| !key.ends_with('/'))
                        .map(|key| Ok(key.to_string()))
                        .collect();
                    debug!(count = keys.len(), "listed page of object keys");
                    Ok(Some((stream::iter(keys), pages)))
                }
                None => Ok(None),
            }
        })
        .try_flatten()
        .boxed()
    }

    async fn read(&self, key: &str) -> Result<Bytes, BucketError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.name)
            .key(key)
            .send()
            .await
            .map_err(|err| {
                let service_err = err.into_service_error();
                if service_err.is_no_such_key() {
                    BucketError::NotFound {
                        bucket: self.name.clone(),
                        key: key.to_string(),
                    }
                } else {
                    BucketError::from_sdk(service_err)
                }
            })?;

        let data = output.body.collect().await.map_err(BucketError::from_sdk)?;
        Ok(data.into_bytes())
    }

    async fn exists(&self, key: &str) -> Result<bool, BucketError> {
        match self
            .client
            .head_object()
            .bucket(&self.name)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(BucketError::from_sdk(service_err))
                }
            }
        }
    }
}
