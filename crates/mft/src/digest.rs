//! Digests, descriptors and the media types this crate writes.

use std::{collections::HashMap, str::FromStr};

use oci_spec::image::{Descriptor, DescriptorBuilder, Digest as OciDigest, MediaType};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{store::DigestCheck, Error, Result};

/// Artifact type of a packed Kubernetes manifest.
pub const ARTIFACT_TYPE: &str = "application/vnd.kubectl-mft.v1";

/// Media type of the single content layer holding the manifest YAML.
pub const CONTENT_MEDIA_TYPE: &str = "application/vnd.kubectl-mft.content.v1+yaml";

/// Artifact type of a detached signature manifest.
pub const SIGNATURE_ARTIFACT_TYPE: &str = "application/vnd.kubectl-mft.signature.v1";

/// Media type of the layer holding the DER encoded signature.
pub const SIGNATURE_MEDIA_TYPE: &str = "application/vnd.kubectl-mft.signature.v1+der";

/// OCI image manifest media type.
pub const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// OCI empty descriptor media type, used as the artifact config.
pub const EMPTY_MEDIA_TYPE: &str = "application/vnd.oci.empty.v1+json";

/// Digest of the two-byte `{}` empty config.
pub const EMPTY_CONFIG_DIGEST: &str =
    "sha256:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a";

/// Content of the empty config blob.
pub const EMPTY_CONFIG: &[u8] = b"{}";

/// Index annotation naming the tag of an entry.
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

/// Title annotation, set on the content layer and the manifest.
pub const ANNOTATION_TITLE: &str = "org.opencontainers.image.title";

/// Computes the `sha256:<hex>` digest string of `data`.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Splits `sha256:<hex>` into algorithm and encoded parts, validating both.
pub fn split_digest(digest: &str) -> Result<(&str, &str)> {
    let (algorithm, encoded) = digest
        .split_once(':')
        .ok_or_else(|| Error::corruption(digest, "digest has no algorithm prefix"))?;
    if algorithm != "sha256" {
        return Err(Error::corruption(
            digest,
            format!("unsupported digest algorithm {algorithm}"),
        ));
    }
    if encoded.len() != 64 || !encoded.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::corruption(digest, "malformed sha256 hex"));
    }
    Ok((algorithm, encoded))
}

/// Builds a descriptor for `data` with the given media type.
pub fn descriptor_for(
    media_type: &str,
    data: &[u8],
    annotations: Option<HashMap<String, String>>,
) -> Result<Descriptor> {
    let mut builder = DescriptorBuilder::default()
        .media_type(media_type_of(media_type))
        .digest(OciDigest::from_str(&sha256_digest(data))?)
        .size(data.len() as u64);
    if let Some(annotations) = annotations {
        builder = builder.annotations(annotations);
    }
    Ok(builder.build()?)
}

/// Builds a descriptor for everything `reader` yields, hashing it in a
/// single pass without keeping it.
pub async fn descriptor_for_reader(
    media_type: &str,
    mut reader: impl AsyncRead + Unpin,
    annotations: Option<HashMap<String, String>>,
) -> Result<Descriptor> {
    let mut check = DigestCheck::default();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        check.update(&buf[..n]);
    }
    let (digest, size) = check.digest();
    let mut builder = DescriptorBuilder::default()
        .media_type(media_type_of(media_type))
        .digest(OciDigest::from_str(&digest)?)
        .size(size);
    if let Some(annotations) = annotations {
        builder = builder.annotations(annotations);
    }
    Ok(builder.build()?)
}

/// Descriptor of the shared `{}` config blob.
pub fn empty_config_descriptor() -> Result<Descriptor> {
    Ok(DescriptorBuilder::default()
        .media_type(MediaType::EmptyJSON)
        .digest(OciDigest::from_str(EMPTY_CONFIG_DIGEST)?)
        .size(EMPTY_CONFIG.len() as u64)
        .build()?)
}

/// Maps a media type string onto the oci-spec enum so well-known types
/// compare equal to what deserialization produces.
pub fn media_type_of(s: &str) -> MediaType {
    MediaType::from(s)
}

/// True for media types that name a JSON manifest rather than a blob.
pub fn is_manifest_media_type(media_type: &MediaType) -> bool {
    matches!(
        media_type.to_string().as_str(),
        "application/vnd.oci.image.manifest.v1+json"
            | "application/vnd.oci.image.index.v1+json"
            | "application/vnd.docker.distribution.manifest.v2+json"
            | "application/vnd.docker.distribution.manifest.list.v2+json"
    )
}

/// Returns a copy of `desc` with the tag annotation removed.
pub fn without_ref_name(desc: &Descriptor) -> Descriptor {
    let mut desc = desc.clone();
    if let Some(annotations) = desc.annotations().as_ref() {
        let mut annotations = annotations.clone();
        annotations.remove(ANNOTATION_REF_NAME);
        desc.set_annotations((!annotations.is_empty()).then_some(annotations));
    }
    desc
}

/// The tag recorded on an index entry, if any.
pub fn ref_name(desc: &Descriptor) -> Option<&str> {
    desc.annotations()
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_REF_NAME))
        .map(String::as_str)
}

/// Formats a byte count with binary units, e.g. `1.5KiB`.
pub fn format_size(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{bytes}B");
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT && exp < 5 {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    format!(
        "{:.1}{}iB",
        bytes as f64 / div as f64,
        ['K', 'M', 'G', 'T', 'P', 'E'][exp]
    )
}
