//! Local OCI image layout storage.
//!
//! Each repository is one directory following the OCI image-layout
//! convention, so standard tooling can read it directly:
//!
//! ```text
//! <root>/
//! ├── oci-layout          {"imageLayoutVersion":"1.0.0"}
//! ├── index.json          tag and manifest entries
//! └── blobs/
//!     └── sha256/
//!         └── <hex>       content, named by its own digest
//! ```
//!
//! Tagged entries in `index.json` carry the
//! `org.opencontainers.image.ref.name` annotation. Manifests stored without
//! a tag (signatures) are kept as entries without that annotation so they
//! can still be found as referrers.
//!
//! `index.json` is the only shared state. It is re-read before every
//! change and replaced atomically, but there is no locking: two processes
//! mutating the same repository at once can lose an update.

use std::{
    collections::HashMap,
    fs::Permissions,
    io::{ErrorKind, Write},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use log::{debug, trace};
use oci_spec::image::{
    Descriptor, ImageIndex, ImageIndexBuilder, ImageManifest, MediaType, OciLayoutBuilder,
};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncWriteExt},
};

use crate::{
    digest::{is_manifest_media_type, ref_name, split_digest, without_ref_name, ANNOTATION_REF_NAME},
    store::{BlobReader, DigestCheck, MutableStore, TaggedIndex},
    Error, Result,
};

const INDEX_FILE: &str = "index.json";
const LAYOUT_FILE: &str = "oci-layout";
const LAYOUT_VERSION: &str = "1.0.0";

/// A single repository stored as an OCI image layout directory.
#[derive(Debug, Clone)]
pub struct LayoutStore {
    root: PathBuf,
}

impl LayoutStore {
    /// Opens the layout at `root`. Nothing is created until the first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The layout directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem path of the blob with the given digest.
    pub fn blob_path(&self, digest: &str) -> Result<PathBuf> {
        let (algorithm, encoded) = split_digest(digest)?;
        Ok(self.root.join("blobs").join(algorithm).join(encoded))
    }

    fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    /// Creates the layout skeleton if this is the first write.
    async fn ensure_layout(&self) -> Result<()> {
        tokio::fs::create_dir_all(self.root.join("blobs").join("sha256")).await?;
        let layout = self.root.join(LAYOUT_FILE);
        if tokio::fs::metadata(&layout).await.is_err() {
            let doc = OciLayoutBuilder::default()
                .image_layout_version(LAYOUT_VERSION)
                .build()?;
            self.write_atomic(&layout, &serde_json::to_vec(&doc)?)?;
        }
        Ok(())
    }

    /// Reads `index.json`. A layout that was never written reads as empty.
    pub async fn read_index(&self) -> Result<ImageIndex> {
        let path = self.index_path();
        match tokio::fs::read(&path).await {
            Ok(data) => serde_json::from_slice(&data)
                .map_err(|e| Error::corruption(path.display().to_string(), e.to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound => empty_index(),
            Err(e) => Err(e.into()),
        }
    }

    /// Replaces `index.json` with `index`.
    pub async fn write_index(&self, index: &ImageIndex) -> Result<()> {
        self.ensure_layout().await?;
        trace!(
            "writing {} with {} entries",
            self.index_path().display(),
            index.manifests().len()
        );
        self.write_atomic(&self.index_path(), &serde_json::to_vec_pretty(index)?)
    }

    fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<()> {
        let mut tmp = tempfile::Builder::new()
            .prefix(".tmp-")
            .tempfile_in(&self.root)?;
        tmp.write_all(data)?;
        tmp.as_file().set_permissions(Permissions::from_mode(0o644))?;
        tmp.persist(path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    /// Records `desc` as an untagged manifest, unless the index already
    /// has an entry for that digest.
    pub async fn record(&self, desc: &Descriptor) -> Result<()> {
        let mut index = self.read_index().await?;
        if index.manifests().iter().any(|e| e.digest() == desc.digest()) {
            return Ok(());
        }
        let mut manifests = index.manifests().clone();
        manifests.push(without_ref_name(desc));
        index.set_manifests(manifests);
        debug!("recorded untagged manifest {}", desc.digest());
        self.write_index(&index).await
    }

    /// Parses the manifest stored under `desc`.
    pub async fn read_manifest(&self, desc: &Descriptor) -> Result<ImageManifest> {
        let data = self.fetch_all(desc).await?;
        serde_json::from_slice(&data)
            .map_err(|e| Error::corruption(desc.digest().to_string(), e.to_string()))
    }

    /// Removes the layout files and blobs, then the directory itself if
    /// nothing else is left in it.
    ///
    /// Repositories nest (`team` and `team/app` share a path prefix), so
    /// anything that isn't part of this layout is left alone.
    pub async fn destroy(&self) -> Result<()> {
        for file in [INDEX_FILE, LAYOUT_FILE] {
            match tokio::fs::remove_file(self.root.join(file)).await {
                Err(e) if e.kind() != ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        }
        match tokio::fs::remove_dir_all(self.root.join("blobs")).await {
            Err(e) if e.kind() != ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }

        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if entries.next_entry().await?.is_some() {
            debug!("keeping {}: not empty", self.root.display());
            return Ok(());
        }
        tokio::fs::remove_dir(&self.root).await?;
        Ok(())
    }
}

pub(crate) fn empty_index() -> Result<ImageIndex> {
    Ok(ImageIndexBuilder::default()
        .schema_version(2u32)
        .media_type(MediaType::ImageIndex)
        .manifests(Vec::<Descriptor>::new())
        .build()?)
}

impl MutableStore for LayoutStore {
    async fn exists(&self, desc: &Descriptor) -> Result<bool> {
        let path = self.blob_path(&desc.digest().to_string())?;
        match tokio::fs::metadata(&path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn fetch(&self, desc: &Descriptor) -> Result<BlobReader> {
        let digest = desc.digest().to_string();
        match File::open(self.blob_path(&digest)?).await {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(Error::NotFound(format!("blob {digest}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn push(&self, desc: &Descriptor, mut content: BlobReader) -> Result<()> {
        let path = self.blob_path(&desc.digest().to_string())?;
        self.ensure_layout().await?;

        if tokio::fs::metadata(&path).await.is_err() {
            // The temporary file is removed on drop unless persisted, which
            // covers both digest mismatch and cancellation mid-stream.
            let dir = path.parent().unwrap_or(&self.root);
            let tmp = tempfile::Builder::new().prefix(".tmp-").tempfile_in(dir)?;
            let mut file = File::from_std(tmp.as_file().try_clone()?);
            let mut check = DigestCheck::default();
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let n = content.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                check.update(&buf[..n]);
                file.write_all(&buf[..n]).await?;
            }
            file.flush().await?;
            drop(file);
            check.finish(desc)?;

            tmp.as_file().set_permissions(Permissions::from_mode(0o644))?;
            tmp.persist(&path).map_err(|e| Error::Io(e.error))?;
            trace!("wrote blob {}", desc.digest());
        }

        if is_manifest_media_type(desc.media_type()) {
            self.record(desc).await?;
        }
        Ok(())
    }

    async fn delete(&self, digest: &str) -> Result<()> {
        match tokio::fs::remove_file(self.blob_path(digest)?).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

impl TaggedIndex for LayoutStore {
    async fn resolve(&self, tag: &str) -> Result<Descriptor> {
        let index = self.read_index().await?;
        index
            .manifests()
            .iter()
            .find(|e| ref_name(e) == Some(tag))
            .map(without_ref_name)
            .ok_or_else(|| Error::NotFound(format!("tag {tag}")))
    }

    async fn tag(&self, desc: &Descriptor, tag: &str) -> Result<()> {
        let mut index = self.read_index().await?;
        let mut manifests: Vec<Descriptor> = index
            .manifests()
            .iter()
            .filter(|e| match ref_name(e) {
                Some(name) => name != tag,
                None => e.digest() != desc.digest(),
            })
            .cloned()
            .collect();

        let mut entry = without_ref_name(desc);
        let mut annotations = entry.annotations().clone().unwrap_or_default();
        annotations.insert(ANNOTATION_REF_NAME.to_string(), tag.to_string());
        entry.set_annotations(Some(annotations));
        manifests.push(entry);

        index.set_manifests(manifests);
        debug!("tagged {} as {tag} in {}", desc.digest(), self.root.display());
        self.write_index(&index).await
    }

    async fn untag(&self, tag: &str) -> Result<Option<Descriptor>> {
        let mut index = self.read_index().await?;
        let mut manifests = index.manifests().clone();
        let Some(pos) = manifests.iter().position(|e| ref_name(e) == Some(tag)) else {
            return Ok(None);
        };
        let removed = manifests.remove(pos);
        index.set_manifests(manifests);
        self.write_index(&index).await?;
        Ok(Some(without_ref_name(&removed)))
    }

    async fn tags(&self) -> Result<Vec<(String, Descriptor)>> {
        let index = self.read_index().await?;
        Ok(index
            .manifests()
            .iter()
            .filter_map(|e| ref_name(e).map(|t| (t.to_string(), without_ref_name(e))))
            .collect())
    }

    async fn predecessors(&self, desc: &Descriptor) -> Result<Vec<Descriptor>> {
        let index = self.read_index().await?;
        let mut found: HashMap<String, Descriptor> = HashMap::new();
        for entry in index.manifests() {
            if !is_manifest_media_type(entry.media_type()) || entry.digest() == desc.digest() {
                continue;
            }
            let manifest = match self.read_manifest(entry).await {
                Ok(m) => m,
                Err(e) => {
                    debug!("skipping unreadable manifest {}: {e}", entry.digest());
                    continue;
                }
            };
            let Some(subject) = manifest.subject() else {
                continue;
            };
            if subject.digest() != desc.digest() {
                continue;
            }
            let mut referrer = without_ref_name(entry);
            if referrer.artifact_type().is_none() {
                referrer.set_artifact_type(manifest.artifact_type().clone());
            }
            found.entry(entry.digest().to_string()).or_insert(referrer);
        }
        let mut found: Vec<Descriptor> = found.into_values().collect();
        found.sort_by(|a, b| a.digest().to_string().cmp(&b.digest().to_string()));
        Ok(found)
    }
}
