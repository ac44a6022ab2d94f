//! End-to-end behaviour of the local store through the public API.

use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicUsize, Ordering},
};

use oci_spec::image::Descriptor;
use similar_asserts::assert_eq;
use tempfile::TempDir;

use mft::{
    copy::copy,
    layout::LayoutStore,
    store::{BlobReader, MutableStore, TaggedIndex},
    Config, CopyOptions, Repository, Result,
};

fn setup() -> (TempDir, Config) {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::new(dir.path().join("data"));
    (dir, config)
}

fn write_file(dir: &TempDir, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap();
    path
}

fn blob_count(layout: &Path) -> usize {
    match std::fs::read_dir(layout.join("blobs/sha256")) {
        Ok(entries) => entries.count(),
        Err(_) => 0,
    }
}

#[tokio::test]
async fn round_trip_arbitrary_bytes() {
    let (dir, config) = setup();
    let content: Vec<u8> = (0..=255u8).cycle().take(4099).collect();
    let file = write_file(&dir, "binary.yaml", &content);

    let repo = Repository::new(&config, "bin:v1").unwrap();
    repo.save(&file).await.unwrap();
    assert_eq!(repo.dump().await.unwrap(), content);

    let empty = write_file(&dir, "empty.yaml", b"");
    let repo = Repository::new(&config, "bin:empty").unwrap();
    repo.save(&empty).await.unwrap();
    assert!(repo.dump().await.unwrap().is_empty());
}

#[tokio::test]
async fn identical_content_shares_blobs() {
    let (dir, config) = setup();
    let a = write_file(&dir, "a.yaml", b"kind: Service\n");

    let v1 = Repository::new(&config, "svc:v1").unwrap();
    let v2 = Repository::new(&config, "svc:v2").unwrap();
    let d1 = v1.save(&a).await.unwrap();
    let d2 = v2.save(&a).await.unwrap();

    // same title, same bytes, same repository: one manifest, one layer, one config
    assert_eq!(d1.digest(), d2.digest());
    assert_eq!(blob_count(v1.layout_path()), 3);
    assert_eq!(v1.path().await.unwrap(), v2.path().await.unwrap());
}

#[tokio::test]
async fn delete_collects_only_unshared_blobs() {
    let (dir, config) = setup();
    let a = write_file(&dir, "a.yaml", b"a: 1\n");
    let b = write_file(&dir, "b.yaml", b"b: 2\n");

    let v1 = Repository::new(&config, "app:v1").unwrap();
    let v2 = Repository::new(&config, "app:v2").unwrap();
    v1.save(&a).await.unwrap();
    v2.save(&b).await.unwrap();
    // two manifests, two layers, one shared config
    assert_eq!(blob_count(v1.layout_path()), 5);

    let result = v1.delete().await.unwrap().unwrap();
    assert_eq!(result.repository, "app");
    assert_eq!(result.tag, "v1");
    assert_eq!(result.removed_blobs.len(), 2);
    assert_eq!(blob_count(v1.layout_path()), 3);
    assert!(v1.dump().await.unwrap_err().is_not_found());
    assert_eq!(v2.dump().await.unwrap(), b"b: 2\n".to_vec());

    let result = v2.delete().await.unwrap().unwrap();
    assert_eq!(result.removed_blobs.len(), 3);
    assert!(!v2.layout_path().exists());
}

#[tokio::test]
async fn delete_is_idempotent() {
    let (dir, config) = setup();
    let repo = Repository::new(&config, "app:v1").unwrap();
    assert!(repo.delete().await.unwrap().is_none());

    repo.save(&write_file(&dir, "a.yaml", b"x")).await.unwrap();
    assert!(repo.delete().await.unwrap().is_some());
    assert!(repo.delete().await.unwrap().is_none());
}

#[tokio::test]
async fn tag_normalization() {
    let (dir, config) = setup();
    let short = Repository::new(&config, "app:v1").unwrap();
    let long = Repository::new(&config, "local/app:v1").unwrap();
    assert_eq!(short.layout_path(), long.layout_path());
    assert_eq!(short.name(), "local/app");

    short.save(&write_file(&dir, "a.yaml", b"a")).await.unwrap();
    assert_eq!(long.dump().await.unwrap(), b"a".to_vec());

    let latest = Repository::new(&config, "app").unwrap();
    assert_eq!(latest.tag(), "latest");
}

/// Wraps a store and counts blob writes.
#[derive(Debug)]
struct Counting {
    inner: LayoutStore,
    pushes: AtomicUsize,
}

impl MutableStore for Counting {
    async fn exists(&self, desc: &Descriptor) -> Result<bool> {
        self.inner.exists(desc).await
    }

    async fn fetch(&self, desc: &Descriptor) -> Result<BlobReader> {
        self.inner.fetch(desc).await
    }

    async fn push(&self, desc: &Descriptor, content: BlobReader) -> Result<()> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        self.inner.push(desc, content).await
    }

    async fn delete(&self, digest: &str) -> Result<()> {
        self.inner.delete(digest).await
    }
}

impl TaggedIndex for Counting {
    async fn resolve(&self, tag: &str) -> Result<Descriptor> {
        self.inner.resolve(tag).await
    }

    async fn tag(&self, desc: &Descriptor, tag: &str) -> Result<()> {
        self.inner.tag(desc, tag).await
    }

    async fn untag(&self, tag: &str) -> Result<Option<Descriptor>> {
        self.inner.untag(tag).await
    }

    async fn tags(&self) -> Result<Vec<(String, Descriptor)>> {
        self.inner.tags().await
    }

    async fn predecessors(&self, desc: &Descriptor) -> Result<Vec<Descriptor>> {
        self.inner.predecessors(desc).await
    }
}

#[tokio::test]
async fn recopy_writes_nothing() {
    let (dir, config) = setup();
    let repo = Repository::new(&config, "app:v1").unwrap();
    repo.save(&write_file(&dir, "a.yaml", b"kind: Pod\n"))
        .await
        .unwrap();

    let dest = Counting {
        inner: LayoutStore::new(dir.path().join("mirror")),
        pushes: AtomicUsize::new(0),
    };
    let first = copy(repo.layout(), "v1", &dest, "v1", &CopyOptions::default())
        .await
        .unwrap();
    assert_eq!(first.copied, 3);
    assert_eq!(dest.pushes.load(Ordering::SeqCst), 3);

    let second = copy(repo.layout(), "v1", &dest, "v1", &CopyOptions::default())
        .await
        .unwrap();
    assert_eq!(second.copied, 0);
    assert_eq!(dest.pushes.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn deployment_scenario() {
    let (dir, config) = setup();
    let content = b"apiVersion: apps/v1\nkind: Deployment\nx:\n";
    assert_eq!(content.len(), 40);
    let file = write_file(&dir, "deployment.yaml", content);

    let repo = Repository::new(&config, "local/app:v1").unwrap();
    repo.save(&file).await.unwrap();
    assert_eq!(repo.dump().await.unwrap(), content.to_vec());

    let listed = mft::list(&config).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].repository, "app");
    assert_eq!(listed[0].tag, "v1");

    repo.delete().await.unwrap().unwrap();
    assert!(repo.dump().await.unwrap_err().is_not_found());
    assert!(!config.storage_dir.join("local/app").exists());
}
