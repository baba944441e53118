use std::collections::BTreeSet;
use std::fs;

use dbimport_bucket::{BucketError, BucketExt, LocalStorage, StorageClient};
use futures::TryStreamExt;

fn populate(root: &std::path::Path) {
    let bucket = root.join("artifacts");
    fs::create_dir_all(bucket.join("2023-06-01/abc123")).unwrap();
    fs::create_dir_all(bucket.join("logs")).unwrap();
    fs::write(bucket.join("2023-06-01/abc123/results.json"), b"{}").unwrap();
    fs::write(bucket.join("2023-06-01/summary.csv"), b"id\n7\n").unwrap();
    fs::write(bucket.join("logs/run.txt"), b"ok").unwrap();
}

#[tokio::test]
async fn lists_relative_keys() {
    let dir = tempfile::tempdir().unwrap();
    populate(dir.path());

    let storage = LocalStorage::new(dir.path());
    let bucket = storage.get_bucket("artifacts").await.unwrap();

    let names: BTreeSet<String> = bucket
        .list_blobs(None)
        .map_ok(|blob| blob.name().to_string())
        .try_collect()
        .await
        .unwrap();

    let expected: BTreeSet<String> = [
        "2023-06-01/abc123/results.json",
        "2023-06-01/summary.csv",
        "logs/run.txt",
    ]
    .into_iter()
    .map(String::from)
    .collect();
    assert_eq!(names, expected);
}

#[tokio::test]
async fn listing_honours_prefix() {
    let dir = tempfile::tempdir().unwrap();
    populate(dir.path());

    let bucket = LocalStorage::new(dir.path())
        .get_bucket("artifacts")
        .await
        .unwrap();

    let names: Vec<String> = bucket
        .list_blobs(Some("2023-06-01/"))
        .map_ok(|blob| blob.name().to_string())
        .try_collect()
        .await
        .unwrap();

    assert_eq!(names.len(), 2);
    assert!(names.iter().all(|name| name.starts_with("2023-06-01/")));
}

#[tokio::test]
async fn open_reads_contents_and_reports_missing_blobs() {
    let dir = tempfile::tempdir().unwrap();
    populate(dir.path());

    let bucket = LocalStorage::new(dir.path())
        .get_bucket("artifacts")
        .await
        .unwrap();

    let blob = bucket.blob("logs/run.txt");
    assert!(blob.exists().await.unwrap());
    assert_eq!(blob.open().await.unwrap().as_ref(), b"ok");

    let missing = bucket.blob("logs/missing.txt");
    assert!(!missing.exists().await.unwrap());
    let err = missing.open().await.unwrap_err();
    assert!(err.is_not_found(), "unexpected error: {err}");
}

#[tokio::test]
async fn vanished_blob_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    populate(dir.path());

    let bucket = LocalStorage::new(dir.path())
        .get_bucket("artifacts")
        .await
        .unwrap();
    let blobs: Vec<_> = bucket.list_blobs(Some("logs/")).try_collect().await.unwrap();
    assert_eq!(blobs.len(), 1);

    fs::remove_file(dir.path().join("artifacts/logs/run.txt")).unwrap();
    assert!(blobs[0].open().await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn directories_and_escaping_keys_are_not_blobs() {
    let dir = tempfile::tempdir().unwrap();
    populate(dir.path());
    fs::write(dir.path().join("secret.txt"), b"secret").unwrap();

    let bucket = LocalStorage::new(dir.path())
        .get_bucket("artifacts")
        .await
        .unwrap();

    assert!(bucket.blob("logs").open().await.unwrap_err().is_not_found());
    assert!(matches!(
        bucket.blob("../secret.txt").open().await,
        Err(BucketError::InvalidKey(_))
    ));
    assert!(!bucket.blob("../secret.txt").exists().await.unwrap());
}

#[tokio::test]
async fn missing_bucket_fails_listing() {
    let dir = tempfile::tempdir().unwrap();
    let bucket = LocalStorage::new(dir.path())
        .get_bucket("nope")
        .await
        .unwrap();

    let result: Result<Vec<_>, _> = bucket.list_blobs(None).try_collect().await;
    assert!(matches!(result, Err(BucketError::BucketNotFound(name)) if name == "nope"));
}
