//! OCI distribution client.
//!
//! Implements [`MutableStore`] and [`TaggedIndex`] on top of an
//! [`oci_client::Client`] so the copy engine can push and pull exactly as it
//! copies between local stores. The client answers registry auth
//! challenges itself; we only hand it the credential for the registry.
//!
//! Registries without the referrers API get the `sha256-<hex>` tag schema:
//! a pushed manifest with a `subject` is added to an image index tagged
//! after the subject's digest, and referrer lookups fall back to that tag.

use std::{
    collections::HashMap,
    fmt,
    io::Cursor,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

use bytes::Bytes;
use log::{debug, trace};
use oci_client::{
    client::{ClientConfig, ClientProtocol},
    errors::{OciDistributionError, OciErrorCode},
    manifest::OciDescriptor,
    secrets::RegistryAuth,
    Client, Reference as OciReference, RegistryOperation,
};
use oci_spec::image::{Descriptor, DescriptorBuilder, Digest as OciDigest, ImageIndex, ImageManifest, MediaType};
use reqwest::header::HeaderValue;
use tokio::io::AsyncReadExt;
use tokio_util::io::StreamReader;

use crate::{
    credentials::CredentialStore,
    digest::{is_manifest_media_type, sha256_digest, split_digest},
    layout::empty_index,
    reference::Reference,
    store::{verify_content, BlobReader, MutableStore, TaggedIndex},
    Error, Result,
};

const MANIFEST_MEDIA_TYPES: &[&str] = &[
    "application/vnd.oci.image.manifest.v1+json",
    "application/vnd.oci.image.index.v1+json",
    "application/vnd.docker.distribution.manifest.v2+json",
];

/// One repository on a remote registry.
pub struct RemoteRepository {
    client: Client,
    registry: String,
    repository: String,
    auth: RegistryAuth,
    pull_ready: AtomicBool,
    push_ready: AtomicBool,
    referrers_api: Mutex<Option<bool>>,
}

impl fmt::Debug for RemoteRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteRepository")
            .field("registry", &self.registry)
            .field("repository", &self.repository)
            .field("anonymous", &matches!(self.auth, RegistryAuth::Anonymous))
            .finish()
    }
}

impl RemoteRepository {
    /// Connects to the registry named by `reference`, taking credentials
    /// for that registry from `credentials`.
    pub fn new(reference: &Reference, credentials: &dyn CredentialStore) -> Result<Self> {
        let protocol = if reference.is_plain_http() {
            ClientProtocol::Http
        } else {
            ClientProtocol::Https
        };
        let auth = match credentials.get(reference.registry())? {
            Some(credential) => RegistryAuth::Basic(credential.username, credential.password),
            None => RegistryAuth::Anonymous,
        };

        Ok(Self {
            client: Client::new(ClientConfig {
                protocol,
                ..Default::default()
            }),
            registry: reference.registry().to_string(),
            repository: reference.repository().to_string(),
            auth,
            pull_ready: AtomicBool::new(false),
            push_ready: AtomicBool::new(false),
            referrers_api: Mutex::new(None),
        })
    }

    fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// The client-side reference for a tag or a digest in this repository.
    fn target(&self, tag_or_digest: &str) -> OciReference {
        if tag_or_digest.contains(':') {
            OciReference::with_digest(
                self.registry.clone(),
                self.repository.clone(),
                tag_or_digest.to_string(),
            )
        } else {
            OciReference::with_tag(
                self.registry.clone(),
                self.repository.clone(),
                tag_or_digest.to_string(),
            )
        }
    }

    /// Lets the client negotiate credentials for `operation` once.
    async fn authorize(&self, operation: RegistryOperation) -> Result<()> {
        let ready = match operation {
            RegistryOperation::Push => &self.push_ready,
            RegistryOperation::Pull => &self.pull_ready,
        };
        if ready.load(Ordering::Acquire) {
            return Ok(());
        }
        self.client
            .auth(&self.target("latest"), &self.auth, operation)
            .await
            .map_err(|e| self.error(e, || "registry".into()))?;
        ready.store(true, Ordering::Release);
        Ok(())
    }

    /// Maps a client failure onto the error taxonomy. `what` names the
    /// content for [`Error::NotFound`].
    fn error(&self, err: OciDistributionError, what: impl FnOnce() -> String) -> Error {
        if matches!(err, OciDistributionError::RequestError(_)) {
            return Error::Network {
                registry: self.registry.clone(),
                source: Box::new(err),
            };
        }
        match err {
            OciDistributionError::AuthenticationFailure(message) => Error::Unauthorized {
                registry: self.registry.clone(),
                message,
            },
            OciDistributionError::UnauthorizedError { url } => Error::Unauthorized {
                registry: self.registry.clone(),
                message: format!("401 Unauthorized for {url}"),
            },
            OciDistributionError::ImageManifestNotFoundError(_) => {
                Error::NotFound(format!("{} in {}", what(), self.name()))
            }
            OciDistributionError::ServerError { code, url, message } => {
                self.status_error(code, url, message, what)
            }
            OciDistributionError::RegistryError { envelope, url } => {
                let message = envelope
                    .errors
                    .iter()
                    .map(|e| e.message.clone())
                    .filter(|m| !m.is_empty())
                    .collect::<Vec<_>>()
                    .join("; ");
                let code = match envelope.errors.first().map(|e| &e.code) {
                    Some(OciErrorCode::Unauthorized) => 401,
                    Some(OciErrorCode::Denied) => 403,
                    Some(
                        OciErrorCode::BlobUnknown
                        | OciErrorCode::ManifestUnknown
                        | OciErrorCode::NameUnknown,
                    ) => 404,
                    _ => 400,
                };
                self.status_error(code, url, message, what)
            }
            other => Error::Io(std::io::Error::other(other)),
        }
    }

    fn status_error(
        &self,
        status: u16,
        url: String,
        message: String,
        what: impl FnOnce() -> String,
    ) -> Error {
        match status {
            401 => Error::Unauthorized {
                registry: self.registry.clone(),
                message,
            },
            403 => Error::Forbidden {
                repository: self.name(),
                message,
            },
            404 => Error::NotFound(format!("{} in {}", what(), self.name())),
            _ => Error::Registry {
                registry: self.registry.clone(),
                status,
                url,
                message,
            },
        }
    }

    fn unsupported(&self, what: &str) -> Error {
        Error::Registry {
            registry: self.registry.clone(),
            status: 405,
            url: self.name(),
            message: format!("{what} is not supported on registries"),
        }
    }

    // ===== Manifests =====

    async fn get_manifest(&self, tag_or_digest: &str) -> Result<Bytes> {
        self.authorize(RegistryOperation::Pull).await?;
        let (data, _) = self
            .client
            .pull_manifest_raw(&self.target(tag_or_digest), &self.auth, MANIFEST_MEDIA_TYPES)
            .await
            .map_err(|e| self.error(e, || format!("manifest {tag_or_digest}")))?;
        Ok(Bytes::copy_from_slice(&data))
    }

    async fn put_manifest(&self, tag_or_digest: &str, media_type: &MediaType, data: &[u8]) -> Result<()> {
        self.authorize(RegistryOperation::Push).await?;
        let content_type = HeaderValue::from_str(&media_type.to_string()).map_err(|e| {
            Error::corruption(tag_or_digest.to_string(), format!("invalid media type: {e}"))
        })?;
        trace!("putting manifest {tag_or_digest} in {}", self.name());
        self.client
            .push_manifest_raw(&self.target(tag_or_digest), data.to_vec(), content_type)
            .await
            .map_err(|e| self.error(e, || format!("manifest {tag_or_digest}")))?;
        Ok(())
    }

    /// Whether the registry serves `/referrers`, asked once per repository.
    async fn has_referrers_api(&self, subject: &Descriptor) -> Result<bool> {
        if let Some(known) = *self.referrers_api.lock().unwrap_or_else(|e| e.into_inner()) {
            return Ok(known);
        }
        let supported = match self.referrers(subject).await {
            Ok(_) => true,
            Err(e) if e.is_not_found() => false,
            Err(e) => return Err(e),
        };
        *self.referrers_api.lock().unwrap_or_else(|e| e.into_inner()) = Some(supported);
        Ok(supported)
    }

    async fn referrers(&self, subject: &Descriptor) -> Result<Vec<Descriptor>> {
        self.authorize(RegistryOperation::Pull).await?;
        let digest = subject.digest().to_string();
        let index = self
            .client
            .pull_referrers(&self.target(&digest), None)
            .await
            .map_err(|e| self.error(e, || format!("referrers of {digest}")))?;
        index
            .manifests
            .into_iter()
            .map(|entry| {
                let size = u64::try_from(entry.size)
                    .map_err(|e| Error::corruption(entry.digest.clone(), e.to_string()))?;
                let mut builder = DescriptorBuilder::default()
                    .media_type(MediaType::from(entry.media_type.as_str()))
                    .digest(entry.digest.parse::<OciDigest>()?)
                    .size(size);
                if let Some(annotations) = entry.annotations {
                    builder = builder.annotations(annotations.into_iter().collect::<HashMap<_, _>>());
                }
                Ok(builder.build()?)
            })
            .collect()
    }

    /// Adds `referrer` to the `sha256-<hex>` fallback index of `subject`.
    async fn update_referrers_tag(&self, subject: &Descriptor, referrer: Descriptor) -> Result<()> {
        let tag = referrers_tag(&subject.digest().to_string())?;
        let mut index: ImageIndex = match self.get_manifest(&tag).await {
            Ok(data) => serde_json::from_slice(&data)
                .map_err(|e| Error::corruption(format!("{} {tag}", self.name()), e.to_string()))?,
            Err(e) if e.is_not_found() => empty_index()?,
            Err(e) => return Err(e),
        };
        if index.manifests().iter().any(|m| m.digest() == referrer.digest()) {
            return Ok(());
        }
        let mut manifests = index.manifests().clone();
        manifests.push(referrer);
        index.set_manifests(manifests);
        debug!("updating referrers tag {tag} in {}", self.name());
        self.put_manifest(&tag, &MediaType::ImageIndex, &serde_json::to_vec(&index)?)
            .await
    }

    async fn push_manifest(&self, desc: &Descriptor, data: Vec<u8>) -> Result<()> {
        verify_content(desc, &data)?;
        self.put_manifest(&desc.digest().to_string(), desc.media_type(), &data)
            .await?;

        let Ok(manifest) = serde_json::from_slice::<ImageManifest>(&data) else {
            return Ok(());
        };
        let Some(subject) = manifest.subject() else {
            return Ok(());
        };
        if self.has_referrers_api(subject).await? {
            return Ok(());
        }
        let mut referrer = desc.clone();
        if referrer.artifact_type().is_none() {
            referrer.set_artifact_type(manifest.artifact_type().clone());
        }
        self.update_referrers_tag(subject, referrer).await
    }
}

fn oci_descriptor(desc: &Descriptor) -> Result<OciDescriptor> {
    Ok(OciDescriptor {
        media_type: desc.media_type().to_string(),
        digest: desc.digest().to_string(),
        size: i64::try_from(desc.size())
            .map_err(|e| Error::corruption(desc.digest().to_string(), e.to_string()))?,
        ..Default::default()
    })
}

impl MutableStore for RemoteRepository {
    async fn exists(&self, desc: &Descriptor) -> Result<bool> {
        self.authorize(RegistryOperation::Pull).await?;
        let digest = desc.digest().to_string();
        let found = if is_manifest_media_type(desc.media_type()) {
            self.client
                .fetch_manifest_digest(&self.target(&digest), &self.auth)
                .await
                .map(drop)
        } else {
            // a GET whose body is never read; the client has no blob HEAD
            self.client
                .pull_blob_stream(&self.target(&digest), &oci_descriptor(desc)?)
                .await
                .map(drop)
        };
        match found.map_err(|e| self.error(e, || digest.clone())) {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn fetch(&self, desc: &Descriptor) -> Result<BlobReader> {
        let digest = desc.digest().to_string();
        if is_manifest_media_type(desc.media_type()) {
            let data = self.get_manifest(&digest).await?;
            return Ok(Box::new(Cursor::new(data)));
        }
        self.authorize(RegistryOperation::Pull).await?;
        let blob = self
            .client
            .pull_blob_stream(&self.target(&digest), &oci_descriptor(desc)?)
            .await
            .map_err(|e| self.error(e, || format!("blob {digest}")))?;
        Ok(Box::new(StreamReader::new(blob.stream)))
    }

    async fn push(&self, desc: &Descriptor, mut content: BlobReader) -> Result<()> {
        let mut data = Vec::new();
        content.read_to_end(&mut data).await?;
        if is_manifest_media_type(desc.media_type()) {
            return self.push_manifest(desc, data).await;
        }

        verify_content(desc, &data)?;
        self.authorize(RegistryOperation::Push).await?;
        let digest = desc.digest().to_string();
        trace!("pushing blob {digest} ({} bytes) to {}", desc.size(), self.name());
        self.client
            .push_blob(&self.target(&digest), &data, &digest)
            .await
            .map_err(|e| self.error(e, || format!("blob {digest}")))?;
        Ok(())
    }

    async fn delete(&self, _digest: &str) -> Result<()> {
        Err(self.unsupported("deleting blobs"))
    }
}

impl TaggedIndex for RemoteRepository {
    async fn resolve(&self, tag: &str) -> Result<Descriptor> {
        let data = match self.get_manifest(tag).await {
            Err(e) if e.is_not_found() => {
                return Err(Error::NotFound(format!("tag {tag} in {}", self.name())))
            }
            other => other?,
        };
        let media_type = serde_json::from_slice::<serde_json::Value>(&data)
            .ok()
            .and_then(|v| v.get("mediaType").and_then(|m| m.as_str()).map(MediaType::from))
            .unwrap_or(MediaType::ImageManifest);

        Ok(DescriptorBuilder::default()
            .media_type(media_type)
            .digest(sha256_digest(&data).parse::<OciDigest>()?)
            .size(data.len() as u64)
            .build()?)
    }

    async fn tag(&self, desc: &Descriptor, tag: &str) -> Result<()> {
        let data = self.get_manifest(&desc.digest().to_string()).await?;
        verify_content(desc, &data)?;
        self.put_manifest(tag, desc.media_type(), &data).await
    }

    async fn untag(&self, _tag: &str) -> Result<Option<Descriptor>> {
        Err(self.unsupported("deleting tags"))
    }

    async fn tags(&self) -> Result<Vec<(String, Descriptor)>> {
        self.authorize(RegistryOperation::Pull).await?;
        let list = self
            .client
            .list_tags(&self.target("latest"), &self.auth, None, None)
            .await
            .map_err(|e| self.error(e, || "tag list".into()))?;
        let mut tags = Vec::new();
        for tag in list.tags {
            let desc = self.resolve(&tag).await?;
            tags.push((tag, desc));
        }
        Ok(tags)
    }

    async fn predecessors(&self, desc: &Descriptor) -> Result<Vec<Descriptor>> {
        let mut found = match self.referrers(desc).await {
            Ok(found) => found,
            Err(e) if e.is_not_found() => {
                debug!("{} has no referrers API, using the tag schema", self.registry);
                match self.get_manifest(&referrers_tag(&desc.digest().to_string())?).await {
                    Ok(data) => serde_json::from_slice::<ImageIndex>(&data)
                        .map_err(|e| {
                            Error::corruption(format!("referrers of {}", desc.digest()), e.to_string())
                        })?
                        .manifests()
                        .clone(),
                    Err(e) if e.is_not_found() => Vec::new(),
                    Err(e) => return Err(e),
                }
            }
            Err(e) => return Err(e),
        };

        // the artifact type decides what a referrer is, so fill it in
        // from the manifest when the index left it out
        for referrer in &mut found {
            if referrer.artifact_type().is_some() || !is_manifest_media_type(referrer.media_type()) {
                continue;
            }
            let data = self.fetch_all(referrer).await?;
            if let Ok(manifest) = serde_json::from_slice::<ImageManifest>(&data) {
                referrer.set_artifact_type(manifest.artifact_type().clone());
            }
        }
        Ok(found)
    }
}

/// The fallback tag under which referrers of `digest` are indexed.
fn referrers_tag(digest: &str) -> Result<String> {
    let (algorithm, encoded) = split_digest(digest)?;
    Ok(format!("{algorithm}-{encoded}"))
}
