//! Named ECDSA P-256 key pairs in a key directory.
//!
//! ```text
//! <key_dir>/          0700
//! ├── <name>.key      PKCS#8 PEM private key, 0600
//! └── <name>.pub      SubjectPublicKeyInfo PEM public key, 0644
//! ```
//!
//! A name may have either half or both. Private keys readable by group or
//! others are refused at load time.

use std::{
    collections::BTreeMap,
    fs::{self, DirBuilder, OpenOptions, Permissions},
    io::{ErrorKind, Write},
    os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt},
    path::{Path, PathBuf},
};

use log::debug;
use p256::{
    ecdsa::{SigningKey, VerifyingKey},
    pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding},
};
use rand::rngs::OsRng;

use mft::{Config, Error, Result};

/// Key name used when none is given.
pub const DEFAULT_KEY_NAME: &str = "default";

const PRIVATE_EXT: &str = "key";
const PUBLIC_EXT: &str = "pub";

const DIR_MODE: u32 = 0o700;
const PRIVATE_MODE: u32 = 0o600;
const PUBLIC_MODE: u32 = 0o644;

/// Which half of a key pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// `<name>.key`
    Private,
    /// `<name>.pub`
    Public,
}

impl KeyKind {
    fn extension(self) -> &'static str {
        match self {
            KeyKind::Private => PRIVATE_EXT,
            KeyKind::Public => PUBLIC_EXT,
        }
    }
}

/// What the key directory holds for one name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInfo {
    /// Key name.
    pub name: String,
    /// Whether `<name>.key` exists.
    pub has_private: bool,
    /// Whether `<name>.pub` exists.
    pub has_public: bool,
}

/// A directory of named key pairs.
#[derive(Debug, Clone)]
pub struct KeyStore {
    dir: PathBuf,
}

/// Rejects names that are empty or could leave the key directory.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
        return Err(Error::InvalidKeyName(name.to_string()));
    }
    Ok(())
}

fn invalid_key(path: &Path, reason: impl ToString) -> Error {
    Error::InvalidKey {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

fn read_key_file(path: &Path, what: &str) -> Result<String> {
    match fs::read_to_string(path) {
        Ok(pem) => Ok(pem),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            Err(Error::NotFound(format!("{what} {}", path.display())))
        }
        Err(e) => Err(e.into()),
    }
}

fn write_key_file(path: &Path, data: &[u8], mode: u32) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)?;
    // the open mode only applies to new files
    file.set_permissions(Permissions::from_mode(mode))?;
    file.write_all(data)?;
    Ok(())
}

impl KeyStore {
    /// Keys under `dir`. Nothing is created until a key is written.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Keys under `config.key_dir`.
    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.key_dir)
    }

    /// The key directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of one half of the named pair.
    pub fn key_path(&self, name: &str, kind: KeyKind) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.dir.join(format!("{name}.{}", kind.extension())))
    }

    fn ensure_dir(&self) -> Result<()> {
        DirBuilder::new()
            .recursive(true)
            .mode(DIR_MODE)
            .create(&self.dir)?;
        Ok(())
    }

    /// Creates a new key pair called `name`.
    ///
    /// An existing private key is only replaced with `force`. If the public
    /// half can't be written the private half is removed again.
    pub fn generate(&self, name: &str, force: bool) -> Result<VerifyingKey> {
        let private_path = self.key_path(name, KeyKind::Private)?;
        let public_path = self.key_path(name, KeyKind::Public)?;
        self.ensure_dir()?;
        if !force && private_path.exists() {
            return Err(Error::Conflict(format!(
                "private key {} (use --force to overwrite)",
                private_path.display()
            )));
        }

        let signing_key = SigningKey::random(&mut OsRng);
        let verifying_key = *signing_key.verifying_key();

        let private_pem = signing_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| invalid_key(&private_path, e))?;
        write_key_file(&private_path, private_pem.as_bytes(), PRIVATE_MODE)?;

        let written = verifying_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| invalid_key(&public_path, e))
            .and_then(|pem| write_key_file(&public_path, pem.as_bytes(), PUBLIC_MODE));
        if let Err(e) = written {
            let _ = fs::remove_file(&private_path);
            return Err(e);
        }

        debug!("generated key pair {name} in {}", self.dir.display());
        Ok(verifying_key)
    }

    /// Copies the PEM public key at `file` into the store.
    ///
    /// The name defaults to the file name without its extension. An existing
    /// public key of that name is only replaced with `force`. Returns the
    /// name used.
    pub fn import_public(&self, file: &Path, name: Option<&str>, force: bool) -> Result<String> {
        let name = match name {
            Some(name) => name.to_string(),
            None => file
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };
        let dest = self.key_path(&name, KeyKind::Public)?;

        let pem = read_key_file(file, "public key file")?;
        VerifyingKey::from_public_key_pem(&pem).map_err(|e| invalid_key(file, e))?;

        self.ensure_dir()?;
        if !force && dest.exists() {
            return Err(Error::Conflict(format!(
                "public key {} (use --force to overwrite)",
                dest.display()
            )));
        }
        write_key_file(&dest, pem.as_bytes(), PUBLIC_MODE)?;
        debug!("imported {} as {name}", file.display());
        Ok(name)
    }

    /// The PEM text of the named public key.
    pub fn export_public(&self, name: &str) -> Result<String> {
        read_key_file(&self.key_path(name, KeyKind::Public)?, "public key")
    }

    /// Every key name with the halves present, sorted by name.
    pub fn list(&self) -> Result<Vec<KeyInfo>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys: BTreeMap<String, KeyInfo> = BTreeMap::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            let Some((name, ext)) = file_name.rsplit_once('.') else {
                continue;
            };
            let info = || KeyInfo {
                name: name.to_string(),
                has_private: false,
                has_public: false,
            };
            match ext {
                PRIVATE_EXT => keys.entry(name.to_string()).or_insert_with(info).has_private = true,
                PUBLIC_EXT => keys.entry(name.to_string()).or_insert_with(info).has_public = true,
                _ => {}
            }
        }
        Ok(keys.into_values().collect())
    }

    /// Removes one half of the named pair.
    pub fn delete(&self, name: &str, kind: KeyKind) -> Result<()> {
        let path = self.key_path(name, kind)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let what = match kind {
                    KeyKind::Private => "private key",
                    KeyKind::Public => "public key",
                };
                Err(Error::NotFound(format!("{what} {name:?}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Whether the named private key exists.
    pub fn private_exists(&self, name: &str) -> bool {
        self.key_path(name, KeyKind::Private)
            .map(|path| path.is_file())
            .unwrap_or(false)
    }

    /// Whether any public key exists.
    pub fn public_keys_exist(&self) -> bool {
        self.list()
            .map(|keys| keys.iter().any(|k| k.has_public))
            .unwrap_or(false)
    }

    /// Loads the named private key, refusing files with group or other
    /// permission bits set.
    pub fn load_private(&self, name: &str) -> Result<SigningKey> {
        let path = self.key_path(name, KeyKind::Private)?;
        let mode = match fs::metadata(&path) {
            Ok(meta) => meta.permissions().mode() & 0o777,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::MissingSigningKey(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        if mode & 0o077 != 0 {
            return Err(Error::InsecureKeyPermissions { path, mode });
        }
        let pem = read_key_file(&path, "private key")?;
        SigningKey::from_pkcs8_pem(&pem).map_err(|e| invalid_key(&path, e))
    }

    /// Loads the named public key.
    pub fn load_public(&self, name: &str) -> Result<VerifyingKey> {
        let path = self.key_path(name, KeyKind::Public)?;
        let pem = read_key_file(&path, "public key")?;
        VerifyingKey::from_public_key_pem(&pem).map_err(|e| invalid_key(&path, e))
    }

    /// Every public key with its name, sorted by name.
    pub fn load_all_public(&self) -> Result<Vec<(String, VerifyingKey)>> {
        self.list()?
            .into_iter()
            .filter(|k| k.has_public)
            .map(|k| {
                let key = self.load_public(&k.name)?;
                Ok((k.name, key))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn mode(path: &Path) -> u32 {
        fs::metadata(path).unwrap().permissions().mode() & 0o777
    }

    #[test]
    fn test_generate_layout_and_modes() {
        let dir = tempfile::tempdir().unwrap();
        let keys = KeyStore::new(dir.path().join("keys"));
        let public = keys.generate(DEFAULT_KEY_NAME, false).unwrap();

        assert_eq!(mode(keys.dir()), 0o700);
        assert_eq!(mode(&keys.dir().join("default.key")), 0o600);
        assert_eq!(mode(&keys.dir().join("default.pub")), 0o644);

        let loaded = keys.load_private(DEFAULT_KEY_NAME).unwrap();
        assert_eq!(*loaded.verifying_key(), public);
        assert_eq!(keys.load_public(DEFAULT_KEY_NAME).unwrap(), public);
        assert!(keys
            .export_public(DEFAULT_KEY_NAME)
            .unwrap()
            .starts_with("-----BEGIN PUBLIC KEY-----"));
    }

    #[test]
    fn test_generate_requires_force() {
        let dir = tempfile::tempdir().unwrap();
        let keys = KeyStore::new(dir.path());
        let first = keys.generate("k", false).unwrap();
        let err = keys.generate("k", false).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)), "{err}");
        let second = keys.generate("k", true).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_insecure_private_key_refused() {
        let dir = tempfile::tempdir().unwrap();
        let keys = KeyStore::new(dir.path());
        keys.generate("k", false).unwrap();
        let path = keys.key_path("k", KeyKind::Private).unwrap();
        fs::set_permissions(&path, Permissions::from_mode(0o644)).unwrap();

        let err = keys.load_private("k").unwrap_err();
        assert!(
            matches!(err, Error::InsecureKeyPermissions { mode: 0o644, .. }),
            "{err}"
        );
    }

    #[test]
    fn test_name_validation() {
        let dir = tempfile::tempdir().unwrap();
        let keys = KeyStore::new(dir.path());
        for bad in ["", "../x", "a/b", "a\\b", ".."] {
            assert!(
                matches!(keys.generate(bad, false), Err(Error::InvalidKeyName(_))),
                "{bad:?}"
            );
        }
        assert!(!keys.private_exists("../etc/passwd"));
    }

    #[test]
    fn test_import_list_delete() {
        let dir = tempfile::tempdir().unwrap();
        let keys = KeyStore::new(dir.path().join("keys"));
        keys.generate("alice", false).unwrap();

        let exported = dir.path().join("bob.pub");
        fs::write(&exported, keys.export_public("alice").unwrap()).unwrap();
        assert_eq!(keys.import_public(&exported, None, false).unwrap(), "bob");
        assert!(matches!(
            keys.import_public(&exported, None, false),
            Err(Error::Conflict(_))
        ));

        let garbage = dir.path().join("garbage.pub");
        fs::write(&garbage, "not a key").unwrap();
        assert!(matches!(
            keys.import_public(&garbage, None, false),
            Err(Error::InvalidKey { .. })
        ));

        assert_eq!(
            keys.list().unwrap(),
            vec![
                KeyInfo {
                    name: "alice".into(),
                    has_private: true,
                    has_public: true
                },
                KeyInfo {
                    name: "bob".into(),
                    has_private: false,
                    has_public: true
                },
            ]
        );
        assert_eq!(keys.load_all_public().unwrap().len(), 2);

        keys.delete("alice", KeyKind::Private).unwrap();
        assert!(!keys.private_exists("alice"));
        assert!(keys.delete("alice", KeyKind::Private).unwrap_err().is_not_found());
        assert!(matches!(
            keys.load_private("alice"),
            Err(Error::MissingSigningKey(_))
        ));
        assert!(keys.public_keys_exist());
    }

    #[test]
    fn test_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let keys = KeyStore::new(dir.path().join("nope"));
        assert!(keys.list().unwrap().is_empty());
        assert!(!keys.public_keys_exist());
        assert!(keys.load_all_public().unwrap().is_empty());
    }
}
