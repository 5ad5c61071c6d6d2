//! Mark-and-sweep garbage collection for OCI layouts.
//!
//! Everything reachable from `index.json` is kept: index children
//! recursively, and the config and layers of every image. Other files under
//! `blobs/` are deleted.

use std::collections::HashSet;
use std::path::Path;

use a3s_oci_core::error::Result;
use serde::Serialize;
use tracing::{debug, warn};

use super::{read_blob_bytes, read_index, BLOBS_DIR};
use crate::descriptor::Descriptor;
use crate::digest::Digest;
use crate::manifest::Manifest;
use crate::mediatype;

/// Outcome of one collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcSummary {
    /// Digests found reachable from the root index.
    pub reachable: usize,
    /// Blob files deleted.
    pub removed: usize,
    pub removed_bytes: u64,
}

pub(super) async fn collect(root: &Path) -> Result<GcSummary> {
    let reachable = mark(root).await?;
    let (removed, removed_bytes) = sweep(root, &reachable).await?;
    Ok(GcSummary {
        reachable: reachable.len(),
        removed,
        removed_bytes,
    })
}

/// Digests reachable from `index.json`.
///
/// Missing manifests are skipped so partially copied layouts can still be
/// collected; a manifest that fails to decode aborts the collection.
async fn mark(root: &Path) -> Result<HashSet<Digest>> {
    let index = read_index(root).await?;
    let mut reachable = HashSet::new();
    let mut pending: Vec<Descriptor> = Vec::new();
    for desc in index.manifests {
        if reachable.insert(desc.digest.clone()) {
            pending.push(desc);
        }
    }

    while let Some(desc) = pending.pop() {
        if !mediatype::is_manifest(&desc.media_type) {
            continue;
        }
        let raw = match read_blob_bytes(root, &desc.digest).await {
            Ok(raw) => raw,
            Err(e) if e.is_not_found() => {
                warn!(
                    path = %root.display(),
                    digest = %desc.digest,
                    "Manifest missing from layout, skipping"
                );
                continue;
            }
            Err(e) => return Err(e),
        };
        let manifest = Manifest::from_descriptor(&desc, raw)?;

        if let Some(indexer) = manifest.as_indexer() {
            for child in indexer.manifests() {
                if reachable.insert(child.digest.clone()) {
                    pending.push(child.clone());
                }
            }
        }
        if let Some(imager) = manifest.as_imager() {
            for blob in imager.config().into_iter().chain(imager.layers()) {
                reachable.insert(blob.digest.clone());
            }
        }
    }
    Ok(reachable)
}

/// Delete unreachable files under `blobs/<algorithm>/`.
async fn sweep(root: &Path, reachable: &HashSet<Digest>) -> Result<(usize, u64)> {
    let blobs = root.join(BLOBS_DIR);
    let mut removed = 0;
    let mut removed_bytes = 0;

    let mut algorithms = match tokio::fs::read_dir(&blobs).await {
        Ok(dir) => dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((0, 0)),
        Err(e) => return Err(e.into()),
    };
    while let Some(algorithm) = algorithms.next_entry().await? {
        if !algorithm.file_type().await?.is_dir() {
            continue;
        }
        let algorithm_name = algorithm.file_name().to_string_lossy().into_owned();
        let mut files = tokio::fs::read_dir(algorithm.path()).await?;
        while let Some(file) = files.next_entry().await? {
            let name = file.file_name().to_string_lossy().into_owned();
            let Ok(digest) = Digest::parse(&format!("{}:{}", algorithm_name, name)) else {
                debug!(path = %file.path().display(), "Ignoring non-blob file");
                continue;
            };
            if reachable.contains(&digest) {
                continue;
            }
            let size = file.metadata().await?.len();
            tokio::fs::remove_file(file.path()).await?;
            removed += 1;
            removed_bytes += size;
            debug!(digest = %digest, size, "Removed unreachable blob");
        }
    }
    Ok((removed, removed_bytes))
}
