//! Local-filesystem double: bucket `name` lives at `<root>/<name>` and object
//! keys are `/`-separated paths relative to it. Only reading and listing are
//! supported.

use async_trait::async_trait;
use bytes::Bytes;
use futures::future;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use crate::{Bucket, BucketError, BucketRef, StorageClient};

#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn bucket(&self, name: &str) -> LocalBucket {
        LocalBucket {
            name: name.to_string(),
            path: self.root.join(name),
        }
    }
}

#[async_trait]
impl StorageClient for LocalStorage {
    async fn get_bucket(&self, name: &str) -> Result<BucketRef, BucketError> {
        if name.is_empty() || name.contains(['/', '\\']) || name == ".." || name == "." {
            return Err(BucketError::Configuration(format!(
                "invalid local bucket name '{name}'"
            )));
        }
        Ok(Arc::new(self.bucket(name)))
    }
}

#[derive(Debug, Clone)]
pub struct LocalBucket {
    name: String,
    path: PathBuf,
}

impl LocalBucket {
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, BucketError> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !valid {
            return Err(BucketError::InvalidKey(key.to_string()));
        }
        Ok(self.path.join(relative))
    }

    fn not_found(&self, key: &str) -> BucketError {
        BucketError::NotFound {
            bucket: self.name.clone(),
            key: key.to_string(),
        }
    }
}

struct Walk {
    bucket: String,
    root: PathBuf,
    pending: Vec<PathBuf>,
    current: Option<tokio::fs::ReadDir>,
}

fn relative_key(root: &Path, path: &Path) -> Result<String, BucketError> {
    let relative = path
        .strip_prefix(root)
        .map_err(|_| BucketError::InvalidKey(path.display().to_string()))?;
    let mut parts = Vec::new();
    for component in relative.components() {
        let part = component
            .as_os_str()
            .to_str()
            .ok_or_else(|| BucketError::InvalidKey(path.display().to_string()))?;
        parts.push(part);
    }
    Ok(parts.join("/"))
}

#[async_trait]
impl Bucket for LocalBucket {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_keys<'a>(&'a self, prefix: Option<&'a str>) -> BoxStream<'a, Result<String, BucketError>> {
        let walk = Walk {
            bucket: self.name.clone(),
            root: self.path.clone(),
            pending: vec![self.path.clone()],
            current: None,
        };

        stream::try_unfold(walk, |mut walk| async move {
            loop {
                if let Some(dir) = walk.current.as_mut() {
                    let entry = dir.next_entry().await.map_err(|source| BucketError::Io {
                        path: walk.root.clone(),
                        source,
                    })?;
                    match entry {
                        Some(entry) => {
                            let path = entry.path();
                            let file_type = entry
                                .file_type()
                                .await
                                .map_err(|source| BucketError::Io {
                                    path: path.clone(),
                                    source,
                                })?;
                            // Symlinks are not followed so listing stays inside the bucket.
                            if file_type.is_dir() {
                                walk.pending.push(path);
                            } else if file_type.is_file() {
                                let key = relative_key(&walk.root, &path)?;
                                return Ok(Some((key, walk)));
                            }
                        }
                        None => walk.current = None,
                    }
                    continue;
                }

                let Some(next) = walk.pending.pop() else {
                    return Ok(None);
                };
                match tokio::fs::read_dir(&next).await {
                    Ok(dir) => walk.current = Some(dir),
                    Err(err) if err.kind() == ErrorKind::NotFound && next == walk.root => {
                        return Err(BucketError::BucketNotFound(walk.bucket.clone()));
                    }
                    Err(source) => return Err(BucketError::Io { path: next, source }),
                }
            }
        })
        .try_filter(move |key| future::ready(prefix.map_or(true, |p| key.starts_with(p))))
        .boxed()
    }

    async fn read(&self, key: &str) -> Result<Bytes, BucketError> {
        let path = self.object_path(key)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return Err(self.not_found(key)),
            Err(err) if err.kind() == ErrorKind::NotFound => return Err(self.not_found(key)),
            Err(source) => return Err(BucketError::Io { path, source }),
        }
        match tokio::fs::read(&path).await {
            Ok(contents) => Ok(Bytes::from(contents)),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(self.not_found(key)),
            Err(source) => Err(BucketError::Io { path, source }),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, BucketError> {
        let path = match self.object_path(key) {
            Ok(path) => path,
            Err(BucketError::InvalidKey(_)) => return Ok(false),
            Err(err) => return Err(err),
        };
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(BucketError::Io { path, source }),
        }
    }
}
