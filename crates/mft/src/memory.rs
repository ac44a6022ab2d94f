//! Ephemeral in-memory store used to stage an artifact before it is copied
//! into a real repository.

use std::{
    collections::{BTreeMap, HashMap},
    io::Cursor,
    sync::Mutex,
};

use bytes::Bytes;
use oci_spec::image::{Descriptor, ImageManifest};
use tokio::io::AsyncReadExt;

use crate::{
    digest::{is_manifest_media_type, without_ref_name},
    store::{verify_content, BlobReader, MutableStore, TaggedIndex},
    Error, Result,
};

#[derive(Debug, Default)]
struct Inner {
    blobs: HashMap<String, Bytes>,
    manifests: BTreeMap<String, Descriptor>,
    tags: BTreeMap<String, Descriptor>,
}

/// A store that keeps everything in memory and disappears on drop.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // every update is a single insert or remove, so a poisoned map is intact
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of blobs held, manifests included.
    pub fn blob_count(&self) -> usize {
        self.lock().blobs.len()
    }
}

impl MutableStore for MemoryStore {
    async fn exists(&self, desc: &Descriptor) -> Result<bool> {
        Ok(self.lock().blobs.contains_key(&desc.digest().to_string()))
    }

    async fn fetch(&self, desc: &Descriptor) -> Result<BlobReader> {
        let digest = desc.digest().to_string();
        let data = self
            .lock()
            .blobs
            .get(&digest)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("blob {digest}")))?;
        Ok(Box::new(Cursor::new(data)))
    }

    async fn push(&self, desc: &Descriptor, mut content: BlobReader) -> Result<()> {
        let mut data = Vec::new();
        content.read_to_end(&mut data).await?;
        verify_content(desc, &data)?;

        let digest = desc.digest().to_string();
        let mut inner = self.lock();
        inner.blobs.entry(digest.clone()).or_insert_with(|| data.into());
        if is_manifest_media_type(desc.media_type()) {
            inner.manifests.insert(digest, without_ref_name(desc));
        }
        Ok(())
    }

    async fn delete(&self, digest: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.blobs.remove(digest);
        inner.manifests.remove(digest);
        Ok(())
    }
}

impl TaggedIndex for MemoryStore {
    async fn resolve(&self, tag: &str) -> Result<Descriptor> {
        self.lock()
            .tags
            .get(tag)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("tag {tag}")))
    }

    async fn tag(&self, desc: &Descriptor, tag: &str) -> Result<()> {
        self.lock()
            .tags
            .insert(tag.to_string(), without_ref_name(desc));
        Ok(())
    }

    async fn untag(&self, tag: &str) -> Result<Option<Descriptor>> {
        Ok(self.lock().tags.remove(tag))
    }

    async fn tags(&self) -> Result<Vec<(String, Descriptor)>> {
        Ok(self
            .lock()
            .tags
            .iter()
            .map(|(t, d)| (t.clone(), d.clone()))
            .collect())
    }

    async fn predecessors(&self, desc: &Descriptor) -> Result<Vec<Descriptor>> {
        let inner = self.lock();
        let mut found = Vec::new();
        for (digest, entry) in &inner.manifests {
            let Some(data) = inner.blobs.get(digest) else {
                continue;
            };
            let Ok(manifest) = serde_json::from_slice::<ImageManifest>(data) else {
                continue;
            };
            if manifest
                .subject()
                .as_ref()
                .is_some_and(|s| s.digest() == desc.digest())
            {
                let mut referrer = entry.clone();
                if referrer.artifact_type().is_none() {
                    referrer.set_artifact_type(manifest.artifact_type().clone());
                }
                found.push(referrer);
            }
        }
        Ok(found)
    }
}
