//! OCI image layout store.
//!
//! Persists manifests and blobs in an OCI image layout directory:
//!
//! ```text
//! <path>/oci-layout
//! <path>/index.json
//! <path>/blobs/<algorithm>/<hex>
//! ```
//!
//! Tags are `index.json` entries annotated with
//! `org.opencontainers.image.ref.name`. Every write marks the layout path as
//! modified; [`LayoutStore::close`] then garbage collects blobs no longer
//! reachable from `index.json`, unless the path is still held.

pub mod gc;

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use a3s_oci_core::config::StoreConfig;
use a3s_oci_core::error::{OciError, Result};
use a3s_oci_core::LockTable;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{OwnedRwLockReadGuard, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use gc::GcSummary;

use crate::descriptor::Descriptor;
use crate::digest::{Digest, Digester};
use crate::manifest::{Manifest, OciIndex};
use crate::reference::Reference;
use crate::referrers::Referrers;
use crate::transport::{transfer_queue, BlobReader, BlobStore, ManifestStore, TransferQueue};

/// Annotation holding the tag of an `index.json` entry.
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

const LAYOUT_FILE: &str = "oci-layout";
const LAYOUT_VERSION: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;
const INDEX_FILE: &str = "index.json";
const BLOBS_DIR: &str = "blobs";
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Per layout path bookkeeping.
struct PathState {
    modified: bool,
    holds: usize,
    /// Shared by in-flight operations, exclusive during GC.
    gate: Arc<RwLock<()>>,
}

impl PathState {
    fn new() -> Self {
        Self {
            modified: false,
            holds: 0,
            gate: Arc::new(RwLock::new(())),
        }
    }
}

type PathMap = Arc<Mutex<HashMap<PathBuf, PathState>>>;

/// Keeps a layout path from being garbage collected while alive.
pub struct PathHold {
    paths: PathMap,
    path: PathBuf,
    _gate: OwnedRwLockReadGuard<()>,
}

impl PathHold {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PathHold {
    fn drop(&mut self) {
        if let Some(state) = self.paths.lock().get_mut(&self.path) {
            state.holds = state.holds.saturating_sub(1);
        }
    }
}

impl std::fmt::Debug for PathHold {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathHold").field("path", &self.path).finish()
    }
}

/// Store over OCI layout directories, addressed by `ocidir://` references.
pub struct LayoutStore {
    config: StoreConfig,
    paths: PathMap,
    locks: LockTable,
    queue: TransferQueue,
}

impl Default for LayoutStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl LayoutStore {
    pub fn new(config: StoreConfig) -> Self {
        let queue = transfer_queue(&config.transfer);
        Self {
            config,
            paths: Arc::new(Mutex::new(HashMap::new())),
            locks: LockTable::new(),
            queue,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Hold the layout path of `reference`; [`LayoutStore::close`] skips GC
    /// until every hold is dropped. Waits for a running collection to finish.
    pub async fn hold(&self, reference: &Reference) -> Result<PathHold> {
        let path = Self::root(reference)?;
        let gate = self.enter(&path).await;
        self.paths
            .lock()
            .entry(path.clone())
            .or_insert_with(PathState::new)
            .holds += 1;
        Ok(PathHold {
            paths: Arc::clone(&self.paths),
            path,
            _gate: gate,
        })
    }

    /// Whether the layout was written since its last GC.
    pub fn is_modified(&self, reference: &Reference) -> bool {
        Self::root(reference)
            .map(|root| {
                self.paths
                    .lock()
                    .get(&root)
                    .map(|s| s.modified)
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    /// Tags recorded in `index.json`, sorted.
    pub async fn tag_list(&self, reference: &Reference) -> Result<Vec<String>> {
        let root = Self::root(reference)?;
        let _gate = self.enter(&root).await;
        let index = read_index(&root).await?;
        let mut tags: Vec<String> = index
            .manifests
            .iter()
            .filter_map(|d| d.annotations.get(ANNOTATION_REF_NAME).cloned())
            .collect();
        tags.sort();
        tags.dedup();
        Ok(tags)
    }

    /// Finish with a reference.
    ///
    /// Garbage collects the layout when GC is enabled, the path was modified
    /// and nothing holds or uses it; returns `None` when skipped. A failed
    /// collection keeps the modified flag so the next close retries.
    pub async fn close(&self, reference: &Reference) -> Result<Option<GcSummary>> {
        let root = Self::root(reference)?;
        if !self.config.gc {
            return Ok(None);
        }
        let gate = match self.paths.lock().get(&root) {
            Some(state) => Arc::clone(&state.gate),
            None => return Ok(None),
        };
        let Ok(exclusive) = gate.try_write_owned() else {
            debug!(path = %root.display(), "Layout in use, deferring GC");
            return Ok(None);
        };
        // Holds and writes take the gate, so this check cannot go stale.
        let due = self
            .paths
            .lock()
            .get(&root)
            .map(|state| state.modified && state.holds == 0)
            .unwrap_or(false);
        if !due {
            return Ok(None);
        }

        let summary = self.collect(&root).await;
        drop(exclusive);
        self.forget_if_idle(&root);
        summary.map(Some)
    }

    /// Garbage collect the layout now, whether or not it was modified.
    pub async fn gc(&self, reference: &Reference) -> Result<GcSummary> {
        let root = Self::root(reference)?;
        let gate = Arc::clone(
            &self
                .paths
                .lock()
                .entry(root.clone())
                .or_insert_with(PathState::new)
                .gate,
        );
        let exclusive = gate.try_write_owned().map_err(|_| {
            OciError::Other(format!(
                "Layout {} is held or has operations in flight",
                root.display()
            ))
        })?;

        let summary = self.collect(&root).await;
        drop(exclusive);
        self.forget_if_idle(&root);
        summary
    }

    /// Sweep `root`. Callers hold the path's gate exclusively.
    async fn collect(&self, root: &Path) -> Result<GcSummary> {
        let summary = {
            let _index = self.locks.lock_keys(&[index_key(root)]).await;
            gc::collect(root).await?
        };
        self.locks.prune();
        if let Some(state) = self.paths.lock().get_mut(root) {
            state.modified = false;
        }
        info!(
            path = %root.display(),
            reachable = summary.reachable,
            removed = summary.removed,
            removed_bytes = summary.removed_bytes,
            "Layout garbage collected"
        );
        Ok(summary)
    }

    /// Layout directory of `reference`, absolute and free of `.` and `..`
    /// so every spelling of a directory shares one bookkeeping entry.
    fn root(reference: &Reference) -> Result<PathBuf> {
        let path = reference.path().ok_or_else(|| {
            OciError::Unsupported(format!("{} is not an OCI layout reference", reference))
        })?;
        normalize_path(Path::new(path))
    }

    /// Drop the bookkeeping of a path nothing holds, uses or has modified.
    fn forget_if_idle(&self, root: &Path) {
        let mut paths = self.paths.lock();
        let idle = paths
            .get(root)
            .map(|s| !s.modified && s.holds == 0 && Arc::strong_count(&s.gate) == 1)
            .unwrap_or(false);
        if idle {
            paths.remove(root);
        }
    }

    /// Shared access to a path for the duration of one operation.
    async fn enter(&self, root: &Path) -> OwnedRwLockReadGuard<()> {
        let gate = {
            let mut paths = self.paths.lock();
            let state = paths.entry(root.to_path_buf()).or_insert_with(PathState::new);
            Arc::clone(&state.gate)
        };
        gate.read_owned().await
    }

    fn mark_modified(&self, root: &Path) {
        self.paths
            .lock()
            .entry(root.to_path_buf())
            .or_insert_with(PathState::new)
            .modified = true;
    }

    /// Apply `update` to `index.json` under the path's index lock, writing
    /// the file back when it reports a change.
    async fn update_index<F>(&self, root: &Path, update: F) -> Result<bool>
    where
        F: FnOnce(&mut OciIndex) -> bool + Send,
    {
        let _lock = self.locks.lock_keys(&[index_key(root)]).await;
        let mut index = read_index(root).await?;
        if !update(&mut index) {
            return Ok(false);
        }
        write_index(root, &index).await?;
        self.mark_modified(root);
        Ok(true)
    }

    async fn load_manifest(&self, root: &Path, reference: &Reference) -> Result<Manifest> {
        let index = read_index(root).await?;
        let entry = match (&reference.digest, &reference.tag) {
            (Some(digest), _) => index.manifests.iter().find(|d| d.digest == *digest).cloned(),
            (None, Some(tag)) => Some(find_tag(&index, tag).cloned().ok_or_else(|| {
                OciError::NotFound(format!("tag {} in {}", tag, root.display()))
            })?),
            (None, None) => {
                return Err(OciError::NotFound(format!(
                    "{} names no tag or digest",
                    reference
                )))
            }
        };

        match entry {
            Some(mut desc) => {
                let raw = read_blob_bytes(root, &desc.digest).await?;
                desc.annotations.remove(ANNOTATION_REF_NAME);
                Manifest::from_descriptor(&desc, raw)
            }
            None => {
                let digest = reference.digest.clone().ok_or_else(|| {
                    OciError::NotFound(format!("{} in {}", reference, root.display()))
                })?;
                let raw = read_blob_bytes(root, &digest).await?;
                let media_type = Manifest::detect(&raw)?;
                let desc = Descriptor::new(media_type, digest, raw.len() as u64);
                Manifest::from_descriptor(&desc, raw)
            }
        }
    }
}

#[async_trait]
impl ManifestStore for LayoutStore {
    async fn get_manifest(&self, reference: &Reference) -> Result<Manifest> {
        let root = Self::root(reference)?;
        let _gate = self.enter(&root).await;
        self.load_manifest(&root, reference).await
    }

    async fn head_manifest(&self, reference: &Reference) -> Result<Descriptor> {
        let root = Self::root(reference)?;
        let _gate = self.enter(&root).await;
        let manifest = self.load_manifest(&root, reference).await?;
        Ok(manifest.descriptor().clone())
    }

    async fn put_manifest(&self, reference: &Reference, manifest: &Manifest) -> Result<()> {
        let root = Self::root(reference)?;
        let _gate = self.enter(&root).await;
        ensure_layout(&root).await?;
        write_blob_atomic(&root, manifest.digest(), manifest.raw()).await?;
        self.mark_modified(&root);

        if let Some(tag) = &reference.tag {
            let mut entry = manifest.descriptor().clone();
            entry.annotations.insert(ANNOTATION_REF_NAME.to_string(), tag.clone());
            let tag = tag.clone();
            self.update_index(&root, move |index| {
                index.manifests.retain(|d| !is_tagged(d, &tag));
                index.manifests.push(entry);
                true
            })
            .await?;
        }
        debug!(
            path = %root.display(),
            digest = %manifest.digest(),
            tag = reference.tag.as_deref().unwrap_or(""),
            "Stored manifest"
        );

        if self.config.referrers_on_put {
            if let Some(subject) = manifest.subject() {
                let added = {
                    let _lock = self
                        .locks
                        .lock_keys(&[referrers_key(&root, &subject.digest)])
                        .await;
                    Referrers::new(self).add(&reference.base(), manifest).await
                };
                self.locks.prune();
                added?;
            }
        }
        Ok(())
    }

    async fn delete_manifest(&self, reference: &Reference) -> Result<()> {
        let root = Self::root(reference)?;
        let _gate = self.enter(&root).await;
        let manifest = self.load_manifest(&root, reference).await?;
        let digest = manifest.digest().clone();

        if let Some(subject) = manifest.subject() {
            // Also lock the deleted manifest's own referrers so nothing is
            // attached to it while it goes away.
            let deleted = {
                let _lock = self
                    .locks
                    .lock_keys(&[referrers_key(&root, &subject.digest), referrers_key(&root, &digest)])
                    .await;
                Referrers::new(self).delete(&reference.base(), &manifest).await
            };
            self.locks.prune();
            match deleted {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    debug!(digest = %digest, "Manifest was not listed as a referrer");
                }
                Err(e) => return Err(e),
            }
        }

        let target = digest.clone();
        self.update_index(&root, move |index| {
            let before = index.manifests.len();
            index.manifests.retain(|d| d.digest != target);
            index.manifests.len() != before
        })
        .await?;

        remove_blob(&root, &digest).await?;
        self.mark_modified(&root);
        debug!(path = %root.display(), digest = %digest, "Deleted manifest");
        Ok(())
    }

    async fn delete_tag(&self, reference: &Reference) -> Result<()> {
        let root = Self::root(reference)?;
        let tag = reference.tag.clone().ok_or_else(|| {
            OciError::InvalidReference {
                reference: reference.to_string(),
                reason: "deleting a tag requires a tag".to_string(),
            }
        })?;
        let _gate = self.enter(&root).await;
        let target = tag.clone();
        let removed = self
            .update_index(&root, move |index| {
                let before = index.manifests.len();
                index.manifests.retain(|d| !is_tagged(d, &target));
                index.manifests.len() != before
            })
            .await?;
        if !removed {
            return Err(OciError::NotFound(format!("tag {} in {}", tag, root.display())));
        }
        debug!(path = %root.display(), tag = %tag, "Deleted tag");
        Ok(())
    }

    fn admission(&self) -> Option<&TransferQueue> {
        Some(&self.queue)
    }
}

#[async_trait]
impl BlobStore for LayoutStore {
    async fn get_blob(&self, reference: &Reference, desc: &Descriptor) -> Result<BlobReader> {
        let root = Self::root(reference)?;
        let _gate = self.enter(&root).await;
        let path = blob_path(&root, &desc.digest);
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| blob_error(e, &root, &desc.digest))?;
        Ok(Box::pin(file))
    }

    async fn head_blob(&self, reference: &Reference, desc: &Descriptor) -> Result<Descriptor> {
        let root = Self::root(reference)?;
        let _gate = self.enter(&root).await;
        let meta = tokio::fs::metadata(blob_path(&root, &desc.digest))
            .await
            .map_err(|e| blob_error(e, &root, &desc.digest))?;
        Ok(Descriptor::new(
            desc.media_type.clone(),
            desc.digest.clone(),
            meta.len(),
        ))
    }

    async fn put_blob(
        &self,
        reference: &Reference,
        desc: &Descriptor,
        mut reader: BlobReader,
    ) -> Result<Descriptor> {
        let root = Self::root(reference)?;
        let _gate = self.enter(&root).await;
        ensure_layout(&root).await?;

        let mut digester = Digester::new(desc.digest.algorithm())?;
        let target = blob_path(&root, &desc.digest);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp = temp_path(&target);
        let mut file = tokio::fs::File::create(&temp).await?;

        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let written = async {
            loop {
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                digester.update(&buf[..n]);
                file.write_all(&buf[..n]).await?;
            }
            file.flush().await?;
            Ok::<(), OciError>(())
        }
        .await;
        drop(file);

        let verified = written.and_then(|()| {
            if digester.size() != desc.size {
                return Err(OciError::SizeMismatch {
                    expected: desc.size,
                    actual: digester.size(),
                });
            }
            let actual = digester.finish();
            if actual != desc.digest {
                return Err(OciError::DigestMismatch {
                    expected: desc.digest.to_string(),
                    actual: actual.to_string(),
                });
            }
            Ok(())
        });
        if let Err(e) = verified {
            if let Err(remove) = tokio::fs::remove_file(&temp).await {
                warn!(path = %temp.display(), error = %remove, "Failed to remove temp blob");
            }
            return Err(e);
        }

        tokio::fs::rename(&temp, &target).await?;
        self.mark_modified(&root);
        debug!(
            path = %root.display(),
            digest = %desc.digest,
            size = desc.size,
            "Stored blob"
        );
        Ok(Descriptor::new(
            desc.media_type.clone(),
            desc.digest.clone(),
            desc.size,
        ))
    }

    async fn delete_blob(&self, reference: &Reference, desc: &Descriptor) -> Result<()> {
        let root = Self::root(reference)?;
        let _gate = self.enter(&root).await;
        remove_blob(&root, &desc.digest).await?;
        self.mark_modified(&root);
        debug!(path = %root.display(), digest = %desc.digest, "Deleted blob");
        Ok(())
    }
}

/// Make `path` absolute and resolve `.` and `..` lexically.
fn normalize_path(path: &Path) -> Result<PathBuf> {
    let absolute = std::path::absolute(path)?;
    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    Ok(normalized)
}

fn index_key(root: &Path) -> String {
    format!("index:{}", root.display())
}

fn referrers_key(root: &Path, digest: &Digest) -> String {
    format!("referrers:{}@{}", root.display(), digest)
}

fn is_tagged(desc: &Descriptor, tag: &str) -> bool {
    desc.annotations.get(ANNOTATION_REF_NAME).map(String::as_str) == Some(tag)
}

fn find_tag<'a>(index: &'a OciIndex, tag: &str) -> Option<&'a Descriptor> {
    index.manifests.iter().find(|d| is_tagged(d, tag))
}

pub(crate) fn blob_path(root: &Path, digest: &Digest) -> PathBuf {
    root.join(BLOBS_DIR).join(digest.algorithm()).join(digest.hex())
}

fn temp_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{}.{}.tmp", name, Uuid::new_v4()))
}

fn blob_error(e: std::io::Error, root: &Path, digest: &Digest) -> OciError {
    if e.kind() == std::io::ErrorKind::NotFound {
        OciError::NotFound(format!("blob {} in {}", digest, root.display()))
    } else {
        OciError::IoError(e)
    }
}

/// Create the layout directory and its `oci-layout` marker.
async fn ensure_layout(root: &Path) -> Result<()> {
    tokio::fs::create_dir_all(root.join(BLOBS_DIR)).await?;
    let marker = root.join(LAYOUT_FILE);
    if !tokio::fs::try_exists(&marker).await? {
        tokio::fs::write(&marker, LAYOUT_VERSION).await?;
    }
    Ok(())
}

/// Read `index.json`; a missing file is an empty index.
pub(crate) async fn read_index(root: &Path) -> Result<OciIndex> {
    let path = root.join(INDEX_FILE);
    match tokio::fs::read(&path).await {
        Ok(data) => serde_json::from_slice(&data).map_err(|e| {
            OciError::ManifestError(format!("Failed to parse {}: {}", path.display(), e))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(OciIndex::new()),
        Err(e) => Err(e.into()),
    }
}

async fn write_index(root: &Path, index: &OciIndex) -> Result<()> {
    let data = serde_json::to_vec_pretty(index)?;
    let path = root.join(INDEX_FILE);
    let temp = temp_path(&path);
    tokio::fs::write(&temp, data).await?;
    tokio::fs::rename(&temp, &path).await?;
    Ok(())
}

pub(crate) async fn read_blob_bytes(root: &Path, digest: &Digest) -> Result<Vec<u8>> {
    tokio::fs::read(blob_path(root, digest))
        .await
        .map_err(|e| blob_error(e, root, digest))
}

/// Write already verified content under its digest.
async fn write_blob_atomic(root: &Path, digest: &Digest, bytes: &[u8]) -> Result<()> {
    let target = blob_path(root, digest);
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let temp = temp_path(&target);
    tokio::fs::write(&temp, bytes).await?;
    tokio::fs::rename(&temp, &target).await?;
    Ok(())
}

async fn remove_blob(root: &Path, digest: &Digest) -> Result<()> {
    tokio::fs::remove_file(blob_path(root, digest))
        .await
        .map_err(|e| blob_error(e, root, digest))
}
