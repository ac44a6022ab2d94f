//! Local OCI layout storage for Kubernetes manifests.
//!
//! Manifests are stored as single-layer OCI artifacts, one image layout per
//! repository under a storage root, and can be copied to and from any OCI
//! distribution registry. Blobs are content addressed and shared between
//! tags; deleting a tag reclaims whatever is no longer referenced.

pub mod config;
pub mod copy;
pub mod credentials;
pub mod digest;
pub mod error;
pub mod gc;
pub mod layout;
pub mod memory;
pub mod reference;
pub mod remote;
pub mod repository;
pub mod store;


pub use config::Config;
pub use copy::{CopyOptions, CopyResult};
pub use error::{Error, Result};
pub use repository::{list, DeleteResult, ManifestInfo, Repository};
