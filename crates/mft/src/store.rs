//! Capability traits shared by every place artifacts can live.
//!
//! A [`MutableStore`] holds blobs by digest, and a [`TaggedIndex`] maps tags
//! to manifest descriptors. The local OCI layout, the in-memory staging
//! store and the remote registry client each implement both, so the copy
//! engine can move artifacts between any two of them without knowing
//! which is which.

use std::io::Cursor;

use oci_spec::image::Descriptor;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{
    digest::{descriptor_for, sha256_digest},
    Error, Result,
};

/// A readable blob stream.
pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

/// Storage of blobs keyed by digest.
#[allow(async_fn_in_trait)]
pub trait MutableStore {
    /// Whether the content named by `desc` is present.
    async fn exists(&self, desc: &Descriptor) -> Result<bool>;

    /// Opens the content named by `desc`. Fails with [`Error::NotFound`]
    /// if absent.
    async fn fetch(&self, desc: &Descriptor) -> Result<BlobReader>;

    /// Streams `content` into the store under `desc`.
    ///
    /// Implementations verify the size and digest before the blob becomes
    /// visible; a mismatch is [`Error::Corruption`].
    async fn push(&self, desc: &Descriptor, content: BlobReader) -> Result<()>;

    /// Removes a blob. Removing an absent blob is not an error.
    async fn delete(&self, digest: &str) -> Result<()>;

    /// Reads a whole blob and checks it against `desc`.
    ///
    /// Only meant for manifest-sized documents.
    async fn fetch_all(&self, desc: &Descriptor) -> Result<Vec<u8>> {
        let mut reader = self.fetch(desc).await?;
        // sizes come from untrusted descriptors, so let the buffer grow
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await?;
        verify_content(desc, &data)?;
        Ok(data)
    }

    /// Stores `data`, returning its descriptor. Writing bytes that are
    /// already present is a no-op.
    async fn put(
        &self,
        media_type: &str,
        data: &[u8],
        annotations: Option<std::collections::HashMap<String, String>>,
    ) -> Result<Descriptor> {
        let desc = descriptor_for(media_type, data, annotations)?;
        if !self.exists(&desc).await? {
            self.push(&desc, Box::new(Cursor::new(data.to_vec())))
                .await?;
        }
        Ok(desc)
    }
}

/// A tag to manifest mapping with referrer discovery.
#[allow(async_fn_in_trait)]
pub trait TaggedIndex {
    /// Looks up the manifest descriptor for `tag`. Fails with
    /// [`Error::NotFound`] if the tag is unknown.
    async fn resolve(&self, tag: &str) -> Result<Descriptor>;

    /// Points `tag` at `desc`, replacing any previous target.
    async fn tag(&self, desc: &Descriptor, tag: &str) -> Result<()>;

    /// Removes `tag`, returning what it pointed to.
    async fn untag(&self, tag: &str) -> Result<Option<Descriptor>>;

    /// All tags with their manifest descriptors.
    async fn tags(&self) -> Result<Vec<(String, Descriptor)>>;

    /// Manifests whose `subject` is `desc`.
    async fn predecessors(&self, desc: &Descriptor) -> Result<Vec<Descriptor>>;
}

/// Checks size and digest of fully read content against its descriptor.
pub fn verify_content(desc: &Descriptor, data: &[u8]) -> Result<()> {
    let expected = desc.digest().to_string();
    if data.len() as u64 != desc.size() {
        return Err(Error::corruption(
            expected,
            format!("expected {} bytes, got {}", desc.size(), data.len()),
        ));
    }
    let actual = sha256_digest(data);
    if actual != expected {
        return Err(Error::corruption(expected, format!("content hashes to {actual}")));
    }
    Ok(())
}

/// Running size and digest of a stream, checked once it ends.
#[derive(Debug, Default)]
pub(crate) struct DigestCheck {
    hasher: Sha256,
    written: u64,
}

impl DigestCheck {
    pub(crate) fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.written += chunk.len() as u64;
    }

    /// The digest and size of everything seen.
    pub(crate) fn digest(self) -> (String, u64) {
        (format!("sha256:{}", hex::encode(self.hasher.finalize())), self.written)
    }

    pub(crate) fn finish(self, desc: &Descriptor) -> Result<()> {
        let expected = desc.digest().to_string();
        if self.written != desc.size() {
            return Err(Error::corruption(
                expected,
                format!("expected {} bytes, got {}", desc.size(), self.written),
            ));
        }
        let (actual, _) = self.digest();
        if actual != expected {
            return Err(Error::corruption(expected, format!("content hashes to {actual}")));
        }
        Ok(())
    }
}
