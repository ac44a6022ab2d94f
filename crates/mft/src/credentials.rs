//! Registry credentials.
//!
//! Credential resolution belongs to the caller: the transport only asks a
//! [`CredentialStore`] for the username and password of a registry host.
//! [`DockerConfig`] reads what `docker login` leaves behind in
//! `config.json`. Credential helpers (`credsStore`, `credHelpers`) are not
//! run; when one is configured for a registry we have no inline entry for,
//! a warning says so and access falls back to anonymous.

use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
};

use base64::{engine::general_purpose::STANDARD, Engine};
use log::{debug, warn};
use serde::Deserialize;

use crate::{Error, Result};

/// A username and password (or token) for one registry.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    /// Username.
    pub username: String,
    /// Password or access token.
    pub password: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"[redacted]")
            .finish()
    }
}

/// Source of registry credentials.
pub trait CredentialStore: Send + Sync + fmt::Debug {
    /// Credentials for `registry`, or `None` for anonymous access.
    fn get(&self, registry: &str) -> Result<Option<Credential>>;
}

/// Anonymous access everywhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct Anonymous;

impl CredentialStore for Anonymous {
    fn get(&self, _registry: &str) -> Result<Option<Credential>> {
        Ok(None)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigFile {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
    #[serde(default)]
    creds_store: Option<String>,
    #[serde(default)]
    cred_helpers: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct AuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    identitytoken: Option<String>,
}

/// Credentials from a Docker `config.json`.
#[derive(Debug, Default)]
pub struct DockerConfig {
    auths: HashMap<String, Credential>,
    creds_store: Option<String>,
    cred_helpers: HashMap<String, String>,
}

impl DockerConfig {
    /// Loads `$DOCKER_CONFIG/config.json`, else `~/.docker/config.json`.
    /// A missing file yields an empty store.
    pub fn load_default() -> Result<Self> {
        let path = match std::env::var_os("DOCKER_CONFIG") {
            Some(dir) => PathBuf::from(dir).join("config.json"),
            None => match dirs::home_dir() {
                Some(home) => home.join(".docker").join("config.json"),
                None => return Ok(Self::default()),
            },
        };
        Self::load(&path)
    }

    /// Loads a specific `config.json`. A missing file yields an empty store.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read(path) {
            Ok(data) => Self::parse(&data)
                .map_err(|e| Error::corruption(path.display().to_string(), e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no docker config at {}", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn parse(data: &[u8]) -> std::result::Result<Self, String> {
        let file: ConfigFile = serde_json::from_slice(data).map_err(|e| e.to_string())?;
        let mut auths = HashMap::new();
        for (server, entry) in file.auths {
            if let Some(token) = entry.identitytoken.filter(|t| !t.is_empty()) {
                auths.insert(
                    registry_key(&server).to_string(),
                    Credential {
                        username: IDENTITY_TOKEN_USER.to_string(),
                        password: token,
                    },
                );
                continue;
            }
            let credential = match (entry.auth, entry.username, entry.password) {
                (Some(auth), _, _) if !auth.is_empty() => {
                    let decoded = STANDARD
                        .decode(auth.trim())
                        .map_err(|e| format!("auth for {server}: {e}"))?;
                    let decoded = String::from_utf8(decoded)
                        .map_err(|_| format!("auth for {server} is not UTF-8"))?;
                    let (username, password) = decoded
                        .split_once(':')
                        .ok_or_else(|| format!("auth for {server} is not user:password"))?;
                    Credential {
                        username: username.to_string(),
                        password: password.to_string(),
                    }
                }
                (_, Some(username), Some(password)) => Credential { username, password },
                _ => continue,
            };
            auths.insert(registry_key(&server).to_string(), credential);
        }
        let cred_helpers = file
            .cred_helpers
            .into_iter()
            .map(|(server, helper)| (registry_key(&server).to_string(), helper))
            .collect();
        Ok(Self {
            auths,
            creds_store: file.creds_store.filter(|s| !s.is_empty()),
            cred_helpers,
        })
    }

    /// The credential helper docker would ask for `registry`, if any.
    pub fn helper_for(&self, registry: &str) -> Option<&str> {
        self.cred_helpers
            .get(registry_key(registry))
            .or(self.creds_store.as_ref())
            .map(String::as_str)
    }
}

/// Username docker pairs with an identity (refresh) token.
const IDENTITY_TOKEN_USER: &str = "<token>";

/// Normalizes a `config.json` server key to a bare registry host.
fn registry_key(server: &str) -> &str {
    let host = server
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let host = host.split('/').next().unwrap_or(host);
    match host {
        "index.docker.io" | "registry-1.docker.io" => "docker.io",
        other => other,
    }
}

impl CredentialStore for DockerConfig {
    fn get(&self, registry: &str) -> Result<Option<Credential>> {
        let found = self.auths.get(registry_key(registry)).cloned();
        if found.is_none() {
            if let Some(helper) = self.helper_for(registry) {
                warn!(
                    "credentials for {registry} are managed by docker-credential-{helper}, \
                     which is not supported; continuing anonymously"
                );
            }
        }
        Ok(found)
    }
}
