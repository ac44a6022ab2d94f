//! Error types for the mft library.
//!
//! Every fallible operation returns [`Result<T>`], an alias for
//! `Result<T, Error>`.
//!
//! # Error Categories
//!
//! - **Absence**: [`NotFound`]. A tag, blob, key or signature that isn't
//!   there. Often a clean no-op for the caller.
//! - **Refusal**: [`Conflict`]. A copy or key write would overwrite
//!   something that exists.
//! - **Remote access**: [`Unauthorized`], [`Forbidden`], [`Network`],
//!   [`Registry`]
//! - **Integrity**: [`Corruption`], [`VerificationFailed`]
//! - **Keys**: [`InvalidKeyName`], [`InvalidKey`], [`InsecureKeyPermissions`],
//!   [`MissingSigningKey`], [`NoVerificationKeys`]
//! - **Cleanup**: [`Rollback`], carrying both the failure and the cleanup error
//! - **System errors**: [`Io`], [`Json`], [`Oci`]
//!
//! [`NotFound`]: Error::NotFound
//! [`Conflict`]: Error::Conflict
//! [`Unauthorized`]: Error::Unauthorized
//! [`Forbidden`]: Error::Forbidden
//! [`Network`]: Error::Network
//! [`Registry`]: Error::Registry
//! [`Corruption`]: Error::Corruption
//! [`VerificationFailed`]: Error::VerificationFailed
//! [`InvalidKeyName`]: Error::InvalidKeyName
//! [`InvalidKey`]: Error::InvalidKey
//! [`InsecureKeyPermissions`]: Error::InsecureKeyPermissions
//! [`MissingSigningKey`]: Error::MissingSigningKey
//! [`NoVerificationKeys`]: Error::NoVerificationKeys
//! [`Rollback`]: Error::Rollback
//! [`Io`]: Error::Io
//! [`Json`]: Error::Json
//! [`Oci`]: Error::Oci

use std::path::PathBuf;

/// Result type alias for operations that may return an [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for storage, transport and signature operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The named tag, blob, key or signature does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// Something that would be overwritten already exists: the destination
    /// tag of a copy, or a key file.
    #[error("{0} already exists")]
    Conflict(String),

    /// The registry rejected or never received credentials.
    #[error(
        "authentication failed for registry {registry}: {message}\n\
         Please ensure you are logged in using 'docker login {registry}'"
    )]
    Unauthorized {
        /// Registry host.
        registry: String,
        /// Message returned by the registry.
        message: String,
    },

    /// Credentials were accepted but lack permission on the repository.
    #[error(
        "access denied to repository {repository}: {message}\n\
         Check if you have the required permissions to this repository"
    )]
    Forbidden {
        /// `registry/repository`
        repository: String,
        /// Message returned by the registry.
        message: String,
    },

    /// Connection failure or timeout talking to a registry.
    #[error(
        "network error with {registry}: {source}\n\
         Check your network connection and registry availability"
    )]
    Network {
        /// Registry host.
        registry: String,
        /// Underlying transport error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The registry answered with a status we have no better mapping for.
    #[error("registry {registry} returned {status} for {url}: {message}")]
    Registry {
        /// Registry host.
        registry: String,
        /// HTTP status code.
        status: u16,
        /// Request URL.
        url: String,
        /// Response body, if any.
        message: String,
    },

    /// Stored content does not match its digest or cannot be parsed.
    #[error("corrupt content {location}: {reason}")]
    Corruption {
        /// Digest or path of the offending content.
        location: String,
        /// What was wrong with it.
        reason: String,
    },

    /// Signatures exist for the artifact but none validated.
    #[error("signature verification failed for {reference}: {reason}")]
    VerificationFailed {
        /// Reference that was verified.
        reference: String,
        /// Summary of what was tried.
        reason: String,
    },

    /// A key name that would escape the key directory.
    #[error("invalid key name {0:?}: must be non-empty and must not contain '/', '\\' or '..'")]
    InvalidKeyName(String),

    /// A key file that doesn't hold a usable P-256 key.
    #[error("invalid key {path}: {reason}")]
    InvalidKey {
        /// Key file.
        path: PathBuf,
        /// Parse failure.
        reason: String,
    },

    /// A private key file readable by group or others.
    #[error(
        "private key {} has insecure permissions {mode:#o}; run 'chmod 600 {}'",
        path.display(),
        path.display()
    )]
    InsecureKeyPermissions {
        /// Key file.
        path: PathBuf,
        /// Observed permission bits.
        mode: u32,
    },

    /// Signing was requested with a private key that isn't there.
    #[error(
        "signing key {0:?} not found, run 'kubectl mft key generate' to create a key pair"
    )]
    MissingSigningKey(String),

    /// Verification was requested but the key directory has no public keys.
    #[error(
        "no verification keys found in {}, run 'kubectl mft key import <file>' to import a public key",
        .0.display()
    )]
    NoVerificationKeys(PathBuf),

    /// An operation failed and undoing its partial result failed too.
    #[error("{source}; additionally failed to clean up: {cleanup}")]
    Rollback {
        /// The original failure.
        #[source]
        source: Box<Error>,
        /// The failure while cleaning up.
        cleanup: Box<Error>,
    },

    /// A reference string that can't be parsed into registry/repository:tag.
    #[error("invalid reference {reference:?}: {reason}")]
    InvalidReference {
        /// The input as given.
        reference: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The operation was cancelled before it completed.
    #[error("operation cancelled")]
    Cancelled,

    /// A copy failed for a reason not covered by a more specific variant.
    #[error("failed to copy manifest {reference}: {source}")]
    Copy {
        /// Reference being copied.
        reference: String,
        /// The original failure.
        #[source]
        source: Box<Error>,
    },

    /// I/O error occurred during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Building or validating an OCI document failed.
    #[error("OCI error: {0}")]
    Oci(#[from] oci_spec::OciSpecError),
}

impl Error {
    /// True for [`Error::NotFound`], including when wrapped by a failed copy.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Copy { source, .. } | Error::Rollback { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    pub(crate) fn corruption(location: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Corruption {
            location: location.into(),
            reason: reason.into(),
        }
    }
}
