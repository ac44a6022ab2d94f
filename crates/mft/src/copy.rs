//! Copying artifacts between stores.
//!
//! [`copy`] resolves a tag in the source, walks the manifest graph (config,
//! layers, subject, and index children) and transfers every node the
//! destination lacks, children before parents, before finally tagging the
//! root in the destination. Blobs already present at the destination are
//! never rewritten, so an interrupted copy can simply be run again.

use std::{collections::HashSet, io::Cursor};

use log::{debug, trace};
use oci_spec::image::{Descriptor, ImageIndex, ImageManifest, MediaType};
use tokio_util::sync::CancellationToken;

use crate::{
    digest::is_manifest_media_type,
    store::{BlobReader, MutableStore, TaggedIndex},
    Error, Result,
};

/// Options for [`copy`].
#[derive(Debug, Clone, Default)]
pub struct CopyOptions {
    /// Also copy manifests that refer to the root through their `subject`
    /// (signatures), untagged.
    pub with_referrers: bool,
    /// Checked before each blob; cancelling also aborts the blob in flight.
    pub cancel: CancellationToken,
}

/// What a copy transferred.
#[derive(Debug, Clone)]
pub struct CopyResult {
    /// The root manifest, as tagged in the destination.
    pub root: Descriptor,
    /// Blobs and manifests written to the destination.
    pub copied: usize,
    /// Nodes the destination already had.
    pub skipped: usize,
    /// Bytes written to the destination.
    pub bytes: u64,
}

/// Copies `src_tag` from `source` to `dest_tag` in `dest`.
pub async fn copy<S, D>(
    source: &S,
    src_tag: &str,
    dest: &D,
    dest_tag: &str,
    options: &CopyOptions,
) -> Result<CopyResult>
where
    S: MutableStore + TaggedIndex,
    D: MutableStore + TaggedIndex,
{
    let root = source.resolve(src_tag).await?;
    let mut result = CopyResult {
        root: root.clone(),
        copied: 0,
        skipped: 0,
        bytes: 0,
    };

    copy_graph(source, dest, &root, options, &mut result).await?;

    if options.with_referrers {
        for referrer in source.predecessors(&root).await? {
            debug!("copying referrer {} of {}", referrer.digest(), root.digest());
            copy_graph(source, dest, &referrer, options, &mut result).await?;
        }
    }

    check_cancelled(&options.cancel)?;
    dest.tag(&root, dest_tag).await?;
    debug!(
        "copied {src_tag} -> {dest_tag}: {} written ({} bytes), {} already present",
        result.copied, result.bytes, result.skipped
    );
    Ok(result)
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

/// Children of a manifest or index, parsed from its bytes.
fn successors(desc: &Descriptor, data: &[u8]) -> Result<Vec<Descriptor>> {
    let corrupt = |e: serde_json::Error| Error::corruption(desc.digest().to_string(), e.to_string());
    if *desc.media_type() == MediaType::ImageIndex {
        let index: ImageIndex = serde_json::from_slice(data).map_err(corrupt)?;
        return Ok(index.manifests().clone());
    }
    let manifest: ImageManifest = serde_json::from_slice(data).map_err(corrupt)?;
    let mut children = vec![manifest.config().clone()];
    children.extend(manifest.layers().iter().cloned());
    children.extend(manifest.subject().clone());
    Ok(children)
}

async fn copy_graph<S, D>(
    source: &S,
    dest: &D,
    root: &Descriptor,
    options: &CopyOptions,
    result: &mut CopyResult,
) -> Result<()>
where
    S: MutableStore + TaggedIndex,
    D: MutableStore + TaggedIndex,
{
    // Depth-first walk producing a post-order: every node is transferred
    // after everything it references.
    let mut seen = HashSet::new();
    let mut order: Vec<(Descriptor, Option<Vec<u8>>)> = Vec::new();
    let mut stack: Vec<(Descriptor, Option<Option<Vec<u8>>>)> = vec![(root.clone(), None)];

    while let Some((desc, visited)) = stack.pop() {
        if let Some(data) = visited {
            order.push((desc, data));
            continue;
        }
        if !seen.insert(desc.digest().to_string()) {
            continue;
        }
        check_cancelled(&options.cancel)?;

        if dest.exists(&desc).await? {
            // a manifest the destination already has implies its graph
            trace!("{} already present", desc.digest());
            result.skipped += 1;
            continue;
        }

        if is_manifest_media_type(desc.media_type()) {
            let data = source.fetch_all(&desc).await?;
            let children = successors(&desc, &data)?;
            stack.push((desc, Some(Some(data))));
            stack.extend(children.into_iter().rev().map(|c| (c, None)));
        } else {
            stack.push((desc, Some(None)));
        }
    }

    for (desc, data) in order {
        check_cancelled(&options.cancel)?;
        let content: BlobReader = match data {
            Some(data) => Box::new(Cursor::new(data)),
            None => source.fetch(&desc).await?,
        };
        trace!("copying {} ({} bytes)", desc.digest(), desc.size());
        tokio::select! {
            pushed = dest.push(&desc, content) => pushed?,
            _ = options.cancel.cancelled() => return Err(Error::Cancelled),
        }
        result.copied += 1;
        result.bytes += desc.size();
    }
    Ok(())
}

/// Maps transport failures onto the error taxonomy for a copy of
/// `reference` in `repository` (`registry/repository`). Specific failures
/// pass through, anything else is wrapped with the reference while keeping
/// the original cause.
pub fn classify(err: Error, reference: &str, repository: &str) -> Error {
    match err {
        Error::NotFound(_)
        | Error::Conflict(_)
        | Error::Unauthorized { .. }
        | Error::Forbidden { .. }
        | Error::Network { .. }
        | Error::Corruption { .. }
        | Error::Cancelled
        | Error::Copy { .. } => err,
        Error::Registry { status: 401, registry, message, .. } => {
            Error::Unauthorized { registry, message }
        }
        Error::Registry { status: 403, message, .. } => Error::Forbidden {
            repository: repository.to_string(),
            message,
        },
        other => Error::Copy {
            reference: reference.to_string(),
            source: Box::new(other),
        },
    }
}
