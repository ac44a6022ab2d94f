//! Artifact references: `registry/repository:tag`.
//!
//! A bare `name:tag` has no registry component and is placed under the
//! `local` pseudo-registry, a namespace for artifacts that are never meant
//! to be pushed. The prefix is stripped again for display.

use std::fmt;

use crate::{Error, Result};

/// Registry used for references written without one.
pub const DEFAULT_REGISTRY: &str = "local";

/// Tag used when a reference has none.
pub const DEFAULT_TAG: &str = "latest";

/// A parsed, normalized artifact reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    registry: String,
    repository: String,
    tag: String,
}

/// Prepends the default registry to references without a `/`.
pub fn normalize(reference: &str) -> String {
    if reference.contains('/') {
        reference.to_string()
    } else {
        format!("{DEFAULT_REGISTRY}/{reference}")
    }
}

/// Strips the default registry prefix for display.
pub fn display_name(name: &str) -> &str {
    name.strip_prefix(DEFAULT_REGISTRY)
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or(name)
}

impl Reference {
    /// Parses and normalizes a reference string.
    pub fn parse(reference: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidReference {
            reference: reference.to_string(),
            reason: reason.to_string(),
        };

        if reference.contains('@') {
            return Err(invalid("digest references are not supported, use a tag"));
        }

        let normalized = normalize(reference);
        let (registry, rest) = normalized
            .split_once('/')
            .ok_or_else(|| invalid("missing repository"))?;
        if registry.is_empty() {
            return Err(invalid("missing registry"));
        }
        if rest.is_empty() {
            return Err(invalid("missing repository"));
        }

        // a ':' after the last '/' separates the tag; earlier ones belong
        // to a registry port
        let last_segment = rest.rfind('/').map_or(0, |i| i + 1);
        let (repository, tag) = match rest[last_segment..].rfind(':') {
            Some(i) => (&rest[..last_segment + i], &rest[last_segment + i + 1..]),
            None => (rest, DEFAULT_TAG),
        };

        if !valid_repository(repository) {
            return Err(invalid(
                "repository must be lowercase alphanumeric components separated by '/', '.', '_' or '-'",
            ));
        }
        if !valid_tag(tag) {
            return Err(invalid(
                "tag must be 1-128 characters of [A-Za-z0-9_.-], not starting with '.' or '-'",
            ));
        }

        Ok(Self {
            registry: registry.to_string(),
            repository: repository.to_string(),
            tag: tag.to_string(),
        })
    }

    /// Registry host, or `local`.
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// Repository path within the registry.
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// The tag.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// `registry/repository`, also the storage directory relative to the
    /// storage root.
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// Whether this names the local-only namespace.
    pub fn is_local(&self) -> bool {
        self.registry == DEFAULT_REGISTRY
    }

    /// Registries reached over plain HTTP.
    pub fn is_plain_http(&self) -> bool {
        self.registry.starts_with("localhost") || self.registry.starts_with("127.0.0.1")
    }

    /// The same repository with a different tag.
    pub fn with_tag(&self, tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            ..self.clone()
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.registry, self.repository, self.tag)
    }
}

fn valid_repository(repository: &str) -> bool {
    !repository.is_empty()
        && repository.split('/').all(|component| {
            let bytes = component.as_bytes();
            !bytes.is_empty()
                && bytes[0].is_ascii_alphanumeric()
                && bytes[bytes.len() - 1].is_ascii_alphanumeric()
                && bytes.iter().all(|&b| {
                    b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'.' | b'_' | b'-')
                })
                && !component.contains("..")
        })
}

fn valid_tag(tag: &str) -> bool {
    let bytes = tag.as_bytes();
    (1..=128).contains(&bytes.len())
        && (bytes[0].is_ascii_alphanumeric() || bytes[0] == b'_')
        && bytes
            .iter()
            .all(|&b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}
