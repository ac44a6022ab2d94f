//! Tag deletion with garbage collection of orphaned blobs.
//!
//! Blobs are shared between tags by content, so whether a blob can go is
//! always decided against what the index still references after the tag
//! has been removed, never against what was deleted:
//!
//! 1. Resolve the tag; an unknown tag is a successful no-op.
//! 2. Remove its entry and persist the index. When no other entry still
//!    names the same manifest, untagged manifests whose `subject` is that
//!    manifest (its signatures) are dropped in the same write. The tag's
//!    own manifest is only read after this, so a missing or corrupt
//!    manifest never keeps a tag alive.
//! 3. Collect the live set from every remaining entry: the manifest itself
//!    plus its config and layers. Subjects are not followed.
//! 4. Delete each blob of the removed manifests that is not live. Failures
//!    are logged and skipped.
//! 5. Remove the repository directory once the index is empty.

use std::collections::HashSet;

use log::{debug, warn};
use oci_spec::image::{Descriptor, ImageManifest};

use crate::{
    digest::{is_manifest_media_type, ref_name},
    layout::LayoutStore,
    store::{MutableStore, TaggedIndex},
    Result,
};

/// Outcome of deleting a tag.
#[derive(Debug, Clone)]
pub struct GcResult {
    /// The manifest the tag pointed to.
    pub manifest: Descriptor,
    /// Manifest plus layer sizes of the deleted artifact.
    pub size: u64,
    /// Digests of the blobs that were removed from disk.
    pub removed_blobs: Vec<String>,
    /// Whether the repository directory was removed.
    pub removed_repository: bool,
}

fn blobs_of(desc: &Descriptor, manifest: Option<&ImageManifest>) -> Vec<String> {
    let mut blobs = vec![desc.digest().to_string()];
    if let Some(manifest) = manifest {
        blobs.push(manifest.config().digest().to_string());
        blobs.extend(manifest.layers().iter().map(|l| l.digest().to_string()));
    }
    blobs
}

/// Removes `tag` from `layout` and reclaims blobs nothing else references.
///
/// Returns `None` if the tag did not exist.
pub async fn delete_tag(layout: &LayoutStore, tag: &str) -> Result<Option<GcResult>> {
    let target = match layout.resolve(tag).await {
        Ok(desc) => desc,
        Err(e) if e.is_not_found() => {
            debug!("tag {tag} not present in {}", layout.root().display());
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    // Step 2: rewrite the index without the tag (and its dangling referrers).
    let mut index = layout.read_index().await?;
    let mut remaining: Vec<Descriptor> = index
        .manifests()
        .iter()
        .filter(|e| ref_name(e) != Some(tag))
        .cloned()
        .collect();

    let mut removed: Vec<(Descriptor, Option<ImageManifest>)> = Vec::new();
    let mut dangling = vec![target.digest().to_string()];
    while let Some(subject) = dangling.pop() {
        if remaining.iter().any(|e| e.digest().to_string() == subject) {
            continue;
        }
        let mut kept = Vec::with_capacity(remaining.len());
        for entry in remaining {
            if ref_name(&entry).is_some() || !is_manifest_media_type(entry.media_type()) {
                kept.push(entry);
                continue;
            }
            match layout.read_manifest(&entry).await {
                Ok(m) if m.subject().as_ref().map(|s| s.digest().to_string()) == Some(subject.clone()) => {
                    debug!("dropping referrer {} of {subject}", entry.digest());
                    dangling.push(entry.digest().to_string());
                    removed.push((entry, Some(m)));
                }
                Ok(_) => kept.push(entry),
                Err(e) => {
                    warn!("failed to read manifest {}: {e}", entry.digest());
                    kept.push(entry);
                }
            }
        }
        remaining = kept;
    }

    index.set_manifests(remaining);
    layout.write_index(&index).await?;

    // The tag is gone now. Without its manifest only the manifest blob
    // itself can be reclaimed.
    let target_manifest = match layout.read_manifest(&target).await {
        Ok(m) => Some(m),
        Err(e) => {
            warn!("manifest {} of tag {tag} is unreadable, reclaiming it alone: {e}", target.digest());
            None
        }
    };
    let size = target.size()
        + target_manifest
            .iter()
            .flat_map(|m| m.layers())
            .map(|l| l.size())
            .sum::<u64>();
    removed.insert(0, (target.clone(), target_manifest));

    // Step 3: what the remaining entries still reference.
    let mut live = HashSet::new();
    for entry in index.manifests() {
        live.insert(entry.digest().to_string());
        match layout.read_manifest(entry).await {
            Ok(m) => live.extend(blobs_of(entry, Some(&m))),
            Err(e) => warn!("failed to read manifest {}: {e}", entry.digest()),
        }
    }

    // Step 4: reclaim.
    let mut removed_blobs = Vec::new();
    let mut candidates = HashSet::new();
    for (desc, manifest) in &removed {
        for digest in blobs_of(desc, manifest.as_ref()) {
            if live.contains(&digest) || !candidates.insert(digest.clone()) {
                continue;
            }
            match layout.delete(&digest).await {
                Ok(()) => removed_blobs.push(digest),
                Err(e) => warn!("failed to delete blob {digest}: {e}"),
            }
        }
    }

    // Step 5.
    let mut removed_repository = false;
    if index.manifests().is_empty() {
        match layout.destroy().await {
            Ok(()) => removed_repository = true,
            Err(e) => warn!(
                "failed to remove repository directory {}: {e}",
                layout.root().display()
            ),
        }
    }

    debug!(
        "deleted {tag} ({}), removed {} blobs",
        target.digest(),
        removed_blobs.len()
    );
    Ok(Some(GcResult {
        manifest: target,
        size,
        removed_blobs,
        removed_repository,
    }))
}
