//! Storage locations.
//!
//! A [`Config`] is built once at startup and passed to everything that
//! touches disk. Nothing in this crate reads the environment on its own.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use crate::{Error, Result};

/// Overrides the manifest storage root.
pub const STORAGE_DIR_ENV: &str = "KUBECTL_MFT_STORAGE_DIR";
/// Overrides the signing key directory.
pub const KEY_DIR_ENV: &str = "KUBECTL_MFT_KEY_DIR";
/// Overrides the CRD schema directory.
pub const SCHEMA_DIR_ENV: &str = "KUBECTL_MFT_SCHEMA_DIR";

const APP_DIR: &str = "kubectl-mft";

/// Where manifests, keys and schemas live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Root of the per-repository OCI layouts.
    pub storage_dir: PathBuf,
    /// Directory of `<name>.key` / `<name>.pub` files.
    pub key_dir: PathBuf,
    /// Directory of CRD schemas, used by the external validator.
    pub schema_dir: PathBuf,
}

impl Config {
    /// Lays out all three directories under `base`.
    pub fn new(base: impl AsRef<Path>) -> Self {
        let base = base.as_ref();
        Self {
            storage_dir: base.join("manifests"),
            key_dir: base.join("keys"),
            schema_dir: base.join("schemas"),
        }
    }

    /// Defaults under the user data directory
    /// (`~/.local/share/kubectl-mft` on Linux), with per-directory
    /// overrides from `KUBECTL_MFT_*_DIR`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(dirs::data_dir(), |key| std::env::var_os(key))
    }

    /// Like [`Config::from_env`] with the data directory and the
    /// environment supplied by the caller.
    pub fn from_lookup(
        data_dir: Option<PathBuf>,
        lookup: impl Fn(&str) -> Option<OsString>,
    ) -> Result<Self> {
        let overridden = |key: &str| lookup(key).filter(|v| !v.is_empty()).map(PathBuf::from);
        let storage_dir = overridden(STORAGE_DIR_ENV);
        let key_dir = overridden(KEY_DIR_ENV);
        let schema_dir = overridden(SCHEMA_DIR_ENV);

        let defaults = match data_dir {
            Some(dir) => Some(Self::new(dir.join(APP_DIR))),
            None if storage_dir.is_some() && key_dir.is_some() && schema_dir.is_some() => None,
            None => {
                return Err(Error::NotFound(
                    "user data directory (set HOME or the KUBECTL_MFT_*_DIR variables)".into(),
                ))
            }
        };
        let default = |pick: fn(&Self) -> &PathBuf| {
            defaults.as_ref().map(|d| pick(d).clone()).unwrap_or_default()
        };

        Ok(Self {
            storage_dir: storage_dir.unwrap_or_else(|| default(|d| &d.storage_dir)),
            key_dir: key_dir.unwrap_or_else(|| default(|d| &d.key_dir)),
            schema_dir: schema_dir.unwrap_or_else(|| default(|d| &d.schema_dir)),
        })
    }

    /// Replaces the storage root.
    pub fn with_storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage_dir = dir.into();
        self
    }

    /// Replaces the key directory.
    pub fn with_key_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.key_dir = dir.into();
        self
    }
}
