//! Named manifest artifacts in the local store.
//!
//! A [`Repository`] binds a normalized reference to its OCI layout under
//! the storage root and offers the user-facing verbs: save a YAML file,
//! dump it back, copy it, push and pull it, and delete it with garbage
//! collection.

use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use oci_spec::image::{Descriptor, ImageManifestBuilder, MediaType};
use serde::Serialize;

use crate::{
    config::Config,
    copy::{classify, copy, CopyOptions, CopyResult},
    credentials::{CredentialStore, DockerConfig},
    digest::{
        descriptor_for_reader, empty_config_descriptor, media_type_of, ANNOTATION_TITLE, ARTIFACT_TYPE,
        CONTENT_MEDIA_TYPE, EMPTY_CONFIG, EMPTY_MEDIA_TYPE, MANIFEST_MEDIA_TYPE,
    },
    gc::delete_tag,
    layout::LayoutStore,
    memory::MemoryStore,
    reference::{display_name, Reference},
    remote::RemoteRepository,
    store::{MutableStore, TaggedIndex},
    Error, Result,
};

/// What [`Repository::delete`] removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteResult {
    /// Repository name for display.
    pub repository: String,
    /// The deleted tag.
    pub tag: String,
    /// Manifest plus layer sizes of the deleted artifact.
    pub size: u64,
    /// Digests of blobs removed from disk.
    pub removed_blobs: Vec<String>,
}

/// One tagged artifact found by [`list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestInfo {
    /// Repository name, without the `local/` prefix.
    pub repository: String,
    /// Tag.
    pub tag: String,
    /// Size of the manifest blob in bytes.
    pub size: u64,
    /// Modification time of the manifest blob.
    pub created: DateTime<Utc>,
}

/// A tagged artifact in the local store.
#[derive(Debug)]
pub struct Repository {
    reference: Reference,
    layout: LayoutStore,
    credentials: Option<Arc<dyn CredentialStore>>,
}

fn io_context(path: &Path, e: io::Error) -> Error {
    Error::Io(io::Error::new(e.kind(), format!("{}: {e}", path.display())))
}

impl Repository {
    /// Opens the repository named by `reference` under `config.storage_dir`.
    pub fn new(config: &Config, reference: &str) -> Result<Self> {
        let reference = Reference::parse(reference)?;
        let layout = LayoutStore::new(
            config
                .storage_dir
                .join(reference.registry())
                .join(reference.repository()),
        );
        Ok(Self {
            reference,
            layout,
            credentials: None,
        })
    }

    /// Uses `credentials` for push and pull instead of the Docker config.
    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// The normalized reference.
    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    /// `registry/repository`.
    pub fn name(&self) -> String {
        self.reference.name()
    }

    /// The tag.
    pub fn tag(&self) -> &str {
        self.reference.tag()
    }

    /// The reference as shown to users, without the `local/` prefix.
    pub fn display(&self) -> String {
        display_name(&self.reference.to_string()).to_string()
    }

    /// The layout directory of this repository.
    pub fn layout_path(&self) -> &Path {
        self.layout.root()
    }

    /// The underlying layout store.
    pub fn layout(&self) -> &LayoutStore {
        &self.layout
    }

    /// The manifest descriptor the tag points to.
    pub async fn resolve(&self) -> Result<Descriptor> {
        match self.layout.resolve(self.tag()).await {
            Err(e) if e.is_not_found() => {
                Err(Error::NotFound(format!("manifest {}", self.display())))
            }
            other => other,
        }
    }

    /// Whether the tag exists locally.
    pub async fn exists(&self) -> Result<bool> {
        match self.layout.resolve(self.tag()).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Stores the file at `manifest_file` as this tag.
    ///
    /// The file is hashed in one pass and then streamed straight into the
    /// layout. Only the config and manifest are assembled in memory before
    /// being copied in, so the tag appears once every blob is on disk.
    /// Saving identical content again produces the same manifest digest.
    pub async fn save(&self, manifest_file: &Path) -> Result<Descriptor> {
        let open = || async {
            tokio::fs::File::open(manifest_file)
                .await
                .map_err(|e| io_context(manifest_file, e))
        };
        let title = manifest_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let layer = descriptor_for_reader(
            CONTENT_MEDIA_TYPE,
            open().await?,
            Some(HashMap::from([(ANNOTATION_TITLE.to_string(), title)])),
        )
        .await?;
        if !self.layout.exists(&layer).await? {
            // a file changed since hashing fails the digest check here
            self.layout.push(&layer, Box::new(open().await?)).await?;
        }

        let staging = MemoryStore::new();
        staging.put(EMPTY_MEDIA_TYPE, EMPTY_CONFIG, None).await?;

        let manifest = ImageManifestBuilder::default()
            .schema_version(2u32)
            .media_type(MediaType::ImageManifest)
            .artifact_type(media_type_of(ARTIFACT_TYPE))
            .config(empty_config_descriptor()?)
            .layers(vec![layer.clone()])
            .annotations(HashMap::from([(ANNOTATION_TITLE.to_string(), self.name())]))
            .build()?;
        let mut desc = staging
            .put(MANIFEST_MEDIA_TYPE, &serde_json::to_vec(&manifest)?, None)
            .await?;
        desc.set_artifact_type(Some(media_type_of(ARTIFACT_TYPE)));
        staging.tag(&desc, self.tag()).await?;

        let result = copy(
            &staging,
            self.tag(),
            &self.layout,
            self.tag(),
            &CopyOptions::default(),
        )
        .await?;
        debug!(
            "saved {} as {} ({} bytes)",
            manifest_file.display(),
            self.reference,
            layer.size()
        );
        Ok(result.root)
    }

    async fn content_layer(&self) -> Result<Descriptor> {
        let desc = self.resolve().await?;
        let manifest = self.layout.read_manifest(&desc).await?;
        match manifest.layers().as_slice() {
            [layer] => Ok(layer.clone()),
            layers => Err(Error::corruption(
                self.display(),
                format!("expected exactly 1 layer, found {}", layers.len()),
            )),
        }
    }

    /// The stored YAML, byte for byte.
    pub async fn dump(&self) -> Result<Vec<u8>> {
        let layer = self.content_layer().await?;
        self.layout.fetch_all(&layer).await
    }

    /// Filesystem path of the blob holding the YAML.
    pub async fn path(&self) -> Result<PathBuf> {
        let layer = self.content_layer().await?;
        if !self.layout.exists(&layer).await? {
            return Err(Error::NotFound(format!("blob {}", layer.digest())));
        }
        self.layout.blob_path(&layer.digest().to_string())
    }

    /// Copies this tag to `dest` within the local store.
    ///
    /// Fails with [`Error::Conflict`] if `dest` already exists.
    pub async fn copy_to(&self, dest: &Repository, options: &CopyOptions) -> Result<CopyResult> {
        self.resolve().await?;
        if dest.exists().await? {
            return Err(Error::Conflict(format!("destination tag {}", dest.display())));
        }
        copy(&self.layout, self.tag(), &dest.layout, dest.tag(), options)
            .await
            .map_err(|e| classify(e, &self.display(), &self.name()))
    }

    fn remote(&self) -> Result<RemoteRepository> {
        if self.reference.is_local() {
            return Err(Error::InvalidReference {
                reference: self.display(),
                reason: "local artifacts have no registry; copy to a registry reference first"
                    .into(),
            });
        }
        match &self.credentials {
            Some(credentials) => RemoteRepository::new(&self.reference, credentials.as_ref()),
            None => RemoteRepository::new(&self.reference, &DockerConfig::load_default()?),
        }
    }

    /// Uploads this tag to its registry.
    pub async fn push(&self, options: &CopyOptions) -> Result<CopyResult> {
        self.resolve().await?;
        let remote = self.remote()?;
        debug!("pushing {}", self.reference);
        copy(&self.layout, self.tag(), &remote, self.tag(), options)
            .await
            .map_err(|e| classify(e, &self.display(), &self.name()))
    }

    /// Downloads this tag from its registry.
    pub async fn pull(&self, options: &CopyOptions) -> Result<CopyResult> {
        let remote = self.remote()?;
        debug!("pulling {}", self.reference);
        copy(&remote, self.tag(), &self.layout, self.tag(), options)
            .await
            .map_err(|e| match e {
                Error::NotFound(_) => Error::NotFound(format!("manifest {}", self.display())),
                e => classify(e, &self.display(), &self.name()),
            })
    }

    /// Deletes the tag and every blob no other tag still uses.
    ///
    /// Returns `None` if the tag did not exist.
    pub async fn delete(&self) -> Result<Option<DeleteResult>> {
        let Some(result) = delete_tag(&self.layout, self.tag()).await? else {
            return Ok(None);
        };
        Ok(Some(DeleteResult {
            repository: display_name(&self.name()).to_string(),
            tag: self.tag().to_string(),
            size: result.size,
            removed_blobs: result.removed_blobs,
        }))
    }
}

/// Every tagged artifact under `config.storage_dir`, sorted by repository
/// and tag. Repositories whose index can't be read are skipped with a
/// warning.
pub async fn list(config: &Config) -> Result<Vec<ManifestInfo>> {
    let root = &config.storage_dir;
    let mut found = Vec::new();
    let mut pending = vec![root.clone()];

    while let Some(dir) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound && dir == *root => return Ok(found),
            Err(e) => return Err(io_context(&dir, e)),
        };
        let is_layout = tokio::fs::metadata(dir.join("index.json")).await.is_ok();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if is_layout && entry.file_name() == "blobs" {
                continue;
            }
            pending.push(entry.path());
        }
        if !is_layout {
            continue;
        }

        let name = match dir.strip_prefix(root) {
            Ok(rel) => rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/"),
            Err(_) => continue,
        };
        let repository = display_name(&name).to_string();
        let layout = LayoutStore::new(&dir);
        let tags = match layout.tags().await {
            Ok(tags) => tags,
            Err(e) => {
                warn!("skipping {}: {e}", dir.display());
                continue;
            }
        };
        for (tag, desc) in tags {
            let created = match layout.blob_path(&desc.digest().to_string()) {
                Ok(path) => match tokio::fs::metadata(&path).await.and_then(|m| m.modified()) {
                    Ok(mtime) => DateTime::<Utc>::from(mtime),
                    Err(e) => {
                        warn!("skipping {repository}:{tag}: {e}");
                        continue;
                    }
                },
                Err(e) => {
                    warn!("skipping {repository}:{tag}: {e}");
                    continue;
                }
            };
            found.push(ManifestInfo {
                repository: repository.clone(),
                tag,
                size: desc.size(),
                created,
            });
        }
    }

    found.sort_by(|a, b| (&a.repository, &a.tag).cmp(&(&b.repository, &b.tag)));
    Ok(found)
}
