//! Save/pull combined with signing/verification, with rollback.
//!
//! `pack` never leaves an unsigned artifact behind when signing was asked
//! for, and `pull` never leaves an unverified artifact behind unless the tag
//! was already there before the pull.

use std::path::Path;

use log::{debug, warn};
use oci_spec::image::Descriptor;

use mft::{CopyOptions, CopyResult, Error, Repository, Result};

use crate::{
    keys::{KeyStore, DEFAULT_KEY_NAME},
    signer::{self, SignResult},
    verifier::{self, VerifyResult},
};

/// Options for [`pack`].
#[derive(Debug, Clone)]
pub struct PackOptions {
    /// Private key to sign with.
    pub key_name: String,
    /// Store without signing.
    pub skip_sign: bool,
}

impl Default for PackOptions {
    fn default() -> Self {
        Self {
            key_name: DEFAULT_KEY_NAME.to_string(),
            skip_sign: false,
        }
    }
}

/// What [`pack`] stored.
#[derive(Debug, Clone)]
pub struct PackResult {
    /// The stored manifest.
    pub manifest: Descriptor,
    /// The signature, unless signing was skipped.
    pub signature: Option<SignResult>,
}

/// Options for [`pull`].
#[derive(Debug, Clone, Default)]
pub struct PullOptions {
    /// Keep the pulled artifact without checking its signatures.
    pub skip_verify: bool,
    /// Transfer options; referrers are always copied.
    pub copy: CopyOptions,
}

/// What [`pull`] fetched.
#[derive(Debug, Clone)]
pub struct PullResult {
    /// Transfer statistics.
    pub copy: CopyResult,
    /// The signature that validated, unless verification was skipped.
    pub verified: Option<VerifyResult>,
}

/// Deletes the tag after `err`, keeping both errors if that fails too.
async fn rollback(repo: &Repository, err: Error) -> Error {
    debug!("rolling back {}: {err}", repo.display());
    match repo.delete().await {
        Ok(_) => err,
        Err(cleanup) => {
            warn!("failed to clean up {}: {cleanup}", repo.display());
            Error::Rollback {
                source: Box::new(err),
                cleanup: Box::new(cleanup),
            }
        }
    }
}

/// Signs `repo` with the named private key.
pub async fn sign(repo: &Repository, keys: &KeyStore, key_name: &str) -> Result<SignResult> {
    if !keys.private_exists(key_name) {
        return Err(Error::MissingSigningKey(key_name.to_string()));
    }
    let key = keys.load_private(key_name)?;
    signer::sign(repo, &key).await
}

/// Verifies `repo` against every public key in `keys`.
pub async fn verify(repo: &Repository, keys: &KeyStore) -> Result<VerifyResult> {
    let public = keys.load_all_public()?;
    if public.is_empty() {
        return Err(Error::NoVerificationKeys(keys.dir().to_path_buf()));
    }
    verifier::verify(repo, &public).await
}

/// Saves `file` as `repo` and signs it.
///
/// The key is checked before anything is written. If signing fails the
/// freshly saved tag is deleted again.
pub async fn pack(
    repo: &Repository,
    keys: &KeyStore,
    file: &Path,
    options: &PackOptions,
) -> Result<PackResult> {
    if !options.skip_sign && !keys.private_exists(&options.key_name) {
        return Err(Error::MissingSigningKey(options.key_name.clone()));
    }

    let manifest = repo.save(file).await?;
    if options.skip_sign {
        return Ok(PackResult {
            manifest,
            signature: None,
        });
    }

    match sign(repo, keys, &options.key_name).await {
        Ok(signature) => Ok(PackResult {
            manifest,
            signature: Some(signature),
        }),
        Err(e) => Err(rollback(repo, e).await),
    }
}

/// Pulls `repo` from its registry, with signatures, and verifies it.
///
/// If verification fails the tag is deleted, but only when it did not
/// exist locally before the pull.
pub async fn pull(repo: &Repository, keys: &KeyStore, options: &PullOptions) -> Result<PullResult> {
    let existed_before = repo.exists().await?;

    let copy_options = CopyOptions {
        with_referrers: true,
        ..options.copy.clone()
    };
    let copy = repo.pull(&copy_options).await?;
    if options.skip_verify {
        return Ok(PullResult {
            copy,
            verified: None,
        });
    }

    let verified = verify_pulled(repo, keys, existed_before).await?;
    Ok(PullResult {
        copy,
        verified: Some(verified),
    })
}

async fn verify_pulled(
    repo: &Repository,
    keys: &KeyStore,
    existed_before: bool,
) -> Result<VerifyResult> {
    match verify(repo, keys).await {
        Ok(verified) => Ok(verified),
        Err(e) if existed_before => Err(e),
        Err(e) => Err(rollback(repo, e).await),
    }
}
