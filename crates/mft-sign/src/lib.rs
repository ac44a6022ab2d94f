//! Detached ECDSA P-256 signatures for manifests stored with [`mft`].
//!
//! Keys live as PEM files in a key directory ([`keys::KeyStore`]).
//! Signatures are stored next to the artifact they sign as untagged
//! manifests whose `subject` is the signed manifest, so they travel with it
//! on push and pull.

pub mod keys;
pub mod ops;
pub mod signer;
pub mod verifier;

pub use keys::{KeyInfo, KeyKind, KeyStore, DEFAULT_KEY_NAME};
pub use ops::{pack, pull, PackOptions, PackResult, PullOptions, PullResult};
pub use signer::SignResult;
pub use verifier::VerifyResult;
