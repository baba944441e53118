use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use dbimport_bucket::{Blob, BucketExt, BucketRef};
use futures::TryStreamExt;
use tracing::{info, warn};

use super::Workspace;

#[derive(Args, Debug)]
pub struct DownloadArgs {
    pub pipeline: String,

    /// Root of the local mirror; files land in `<dest>/<bucket>/<key>`.
    #[arg(long, default_value = ".")]
    pub dest: PathBuf,

    #[arg(long)]
    pub prefix: Option<String>,

    #[arg(long, default_value_t = 8)]
    pub concurrency: usize,
}

pub async fn run(workspace: &Workspace, args: DownloadArgs) -> Result<()> {
    let pipeline = workspace.pipeline(&args.pipeline)?;
    let storage = workspace.storage.connect().await?;
    let bucket = storage
        .get_bucket(&pipeline.bucket_name)
        .await
        .with_context(|| format!("opening bucket {}", pipeline.bucket_name))?;

    let written = mirror(&bucket, &args.dest, args.prefix.as_deref(), args.concurrency).await?;
    println!(
        "downloaded {written} files from {} into {}",
        pipeline.bucket_name,
        args.dest.join(&pipeline.bucket_name).display()
    );
    Ok(())
}

/// Copies every blob under `prefix` into `dest/<bucket>/`, returning the
/// number of files written.
pub async fn mirror(
    bucket: &BucketRef,
    dest: &Path,
    prefix: Option<&str>,
    concurrency: usize,
) -> Result<usize> {
    let root = dest.join(bucket.name());
    let written = bucket
        .list_blobs(prefix)
        .map_err(anyhow::Error::from)
        .map_ok(|blob| {
            let root = root.clone();
            async move { save(&blob, &root).await }
        })
        .try_buffer_unordered(concurrency.max(1))
        .try_fold(0usize, |count, saved| async move { Ok(count + usize::from(saved)) })
        .await?;
    Ok(written)
}

async fn save(blob: &Blob, root: &Path) -> Result<bool> {
    let Some(relative) = local_path(blob.name()) else {
        warn!(blob = blob.name(), "skipping key that does not map to a local path");
        return Ok(false);
    };
    let target = root.join(relative);
    let bytes = blob
        .open()
        .await
        .with_context(|| format!("reading {}", blob.name()))?;

    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&target, &bytes)
        .await
        .with_context(|| format!("writing {}", target.display()))?;
    info!(blob = blob.name(), bytes = bytes.len(), "downloaded");
    Ok(true)
}

/// Keys containing `..`, absolute parts or empty segments stay remote.
fn local_path(key: &str) -> Option<PathBuf> {
    if key.is_empty() || key.ends_with('/') || key.contains("//") {
        return None;
    }
    let path = PathBuf::from(key);
    path.components()
        .all(|component| matches!(component, Component::Normal(_)))
        .then_some(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbimport_bucket::{LocalStorage, StorageClient};

    #[test]
    fn rejects_keys_escaping_the_mirror() {
        assert!(local_path("a/b.csv").is_some());
        assert!(local_path("../b.csv").is_none());
        assert!(local_path("/etc/passwd").is_none());
        assert!(local_path("a//b").is_none());
        assert!(local_path("dir/").is_none());
    }

    #[tokio::test]
    async fn mirrors_the_bucket_layout() {
        let source = tempfile::tempdir().unwrap();
        let bucket_dir = source.path().join("artifacts");
        std::fs::create_dir_all(bucket_dir.join("2024")).unwrap();
        std::fs::write(bucket_dir.join("a.csv"), "id\n1\n").unwrap();
        std::fs::write(bucket_dir.join("2024/b.csv"), "id\n2\n").unwrap();

        let storage = LocalStorage::new(source.path());
        let bucket = storage.get_bucket("artifacts").await.unwrap();
        let dest = tempfile::tempdir().unwrap();

        let written = mirror(&bucket, dest.path(), None, 4).await.unwrap();
        assert_eq!(written, 2);
        assert_eq!(
            std::fs::read_to_string(dest.path().join("artifacts/2024/b.csv")).unwrap(),
            "id\n2\n"
        );

        let only_2024 = tempfile::tempdir().unwrap();
        let written = mirror(&bucket, only_2024.path(), Some("2024/"), 1)
            .await
            .unwrap();
        assert_eq!(written, 1);
        assert!(!only_2024.path().join("artifacts/a.csv").exists());
    }
}
