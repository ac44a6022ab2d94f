//! Checking stored signatures against public keys.

use log::debug;
use oci_spec::image::Descriptor;
use p256::ecdsa::{signature::Verifier, Signature, VerifyingKey};

use mft::{
    digest::{is_manifest_media_type, SIGNATURE_ARTIFACT_TYPE},
    layout::LayoutStore,
    store::{MutableStore, TaggedIndex},
    Error, Repository, Result,
};

use crate::signer::signed_message;

/// The signature that validated.
#[derive(Debug, Clone)]
pub struct VerifyResult {
    /// Digest of the signature manifest.
    pub signature: String,
    /// Name of the key that validated it.
    pub key: String,
}

fn is_signature_type(artifact_type: Option<String>) -> bool {
    artifact_type.as_deref() == Some(SIGNATURE_ARTIFACT_TYPE)
}

/// Reads the signature held by `candidate`.
///
/// `Ok(None)` means `candidate` isn't a signature at all; an error means
/// it is one but can't be read.
async fn extract_signature(layout: &LayoutStore, candidate: &Descriptor) -> Result<Option<Vec<u8>>> {
    let declared = is_signature_type(candidate.artifact_type().as_ref().map(|t| t.to_string()));
    if !declared && !is_manifest_media_type(candidate.media_type()) {
        return Ok(None);
    }
    let manifest = match layout.read_manifest(candidate).await {
        Ok(manifest) => manifest,
        Err(e) if declared => return Err(e),
        Err(_) => return Ok(None),
    };
    if !declared && !is_signature_type(manifest.artifact_type().as_ref().map(|t| t.to_string())) {
        return Ok(None);
    }
    let Some(layer) = manifest.layers().first() else {
        return Err(Error::Corruption {
            location: candidate.digest().to_string(),
            reason: "signature manifest has no layers".into(),
        });
    };
    Ok(Some(layout.fetch_all(layer).await?))
}

/// Verifies the manifest `repo` points to.
///
/// Succeeds if any key validates any of its signatures. Fails with
/// [`Error::NotFound`] when the manifest has no signatures, and with
/// [`Error::VerificationFailed`] when none of them validate.
pub async fn verify(repo: &Repository, keys: &[(String, VerifyingKey)]) -> Result<VerifyResult> {
    let subject = repo.resolve().await?;
    let layout = repo.layout();
    let message = signed_message(&subject);

    let mut found = 0usize;
    let mut unreadable = Vec::new();
    for candidate in layout.predecessors(&subject).await? {
        let der = match extract_signature(layout, &candidate).await {
            Ok(Some(der)) => der,
            Ok(None) => continue,
            Err(e) => {
                found += 1;
                unreadable.push(format!("{}: {e}", candidate.digest()));
                continue;
            }
        };
        found += 1;
        let signature = match Signature::from_der(&der) {
            Ok(signature) => signature,
            Err(e) => {
                unreadable.push(format!("{}: malformed signature: {e}", candidate.digest()));
                continue;
            }
        };
        for (name, key) in keys {
            if key.verify(message.as_bytes(), &signature).is_ok() {
                debug!("{} verified by key {name}", repo.display());
                return Ok(VerifyResult {
                    signature: candidate.digest().to_string(),
                    key: name.clone(),
                });
            }
        }
    }

    if found == 0 {
        return Err(Error::NotFound(format!("signature for {}", repo.display())));
    }
    let mut reason = format!(
        "none of the {} available public key(s) could verify the {found} signature(s)",
        keys.len()
    );
    if !unreadable.is_empty() {
        reason.push_str(&format!(
            "; additionally, {} signature(s) could not be read: {}",
            unreadable.len(),
            unreadable.join("; ")
        ));
    }
    Err(Error::VerificationFailed {
        reference: repo.display(),
        reason,
    })
}
