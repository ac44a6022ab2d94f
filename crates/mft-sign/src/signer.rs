//! Attaching signatures to stored manifests.
//!
//! A signature is its own small manifest in the same layout: the DER
//! encoded ECDSA signature as the single layer, the empty config, and a
//! `subject` pointing at the signed manifest. It is recorded in the index
//! without a tag and found again through referrer lookup.
//!
//! The signed message is the manifest digest as text
//! (`sha256:<hex>`), hashed with SHA-256 by the ECDSA signer.

use std::io::Cursor;

use log::debug;
use oci_spec::image::{Descriptor, ImageManifestBuilder, MediaType};
use p256::ecdsa::{signature::Signer, Signature, SigningKey};

use mft::{
    digest::{
        descriptor_for, empty_config_descriptor, media_type_of, EMPTY_CONFIG, EMPTY_MEDIA_TYPE,
        MANIFEST_MEDIA_TYPE, SIGNATURE_ARTIFACT_TYPE, SIGNATURE_MEDIA_TYPE,
    },
    store::MutableStore,
    Repository, Result,
};

/// A signature that was written.
#[derive(Debug, Clone)]
pub struct SignResult {
    /// The signed manifest.
    pub subject: Descriptor,
    /// Digest of the signature manifest.
    pub digest: String,
}

/// The bytes a signature covers for `subject`.
pub(crate) fn signed_message(subject: &Descriptor) -> String {
    subject.digest().to_string()
}

/// Signs the manifest `repo` points to with `key`.
pub async fn sign(repo: &Repository, key: &SigningKey) -> Result<SignResult> {
    let subject = repo.resolve().await?;
    let layout = repo.layout();

    let signature: Signature = key.sign(signed_message(&subject).as_bytes());
    let der = signature.to_der();
    let layer = layout.put(SIGNATURE_MEDIA_TYPE, der.as_bytes(), None).await?;
    layout.put(EMPTY_MEDIA_TYPE, EMPTY_CONFIG, None).await?;

    let manifest = ImageManifestBuilder::default()
        .schema_version(2u32)
        .media_type(MediaType::ImageManifest)
        .artifact_type(media_type_of(SIGNATURE_ARTIFACT_TYPE))
        .config(empty_config_descriptor()?)
        .layers(vec![layer])
        .subject(subject.clone())
        .build()?;
    let data = serde_json::to_vec(&manifest)?;
    let mut desc = descriptor_for(MANIFEST_MEDIA_TYPE, &data, None)?;
    desc.set_artifact_type(Some(media_type_of(SIGNATURE_ARTIFACT_TYPE)));
    if !layout.exists(&desc).await? {
        layout.push(&desc, Box::new(Cursor::new(data))).await?;
    }
    layout.record(&desc).await?;

    debug!("signed {} ({}) as {}", repo.display(), subject.digest(), desc.digest());
    Ok(SignResult {
        subject,
        digest: desc.digest().to_string(),
    })
}
