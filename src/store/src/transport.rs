//! Store traits shared by registry and layout backends.
//!
//! The referrer manager and copy orchestration only talk to these traits,
//! so a registry client can plug in next to [`crate::layout::LayoutStore`].

use std::pin::Pin;

use a3s_oci_core::config::{QueueOrder, TransferConfig};
use a3s_oci_core::error::{OciError, Result};
use a3s_oci_core::AdmissionQueue;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::descriptor::Descriptor;
use crate::manifest::Manifest;
use crate::reference::Reference;

/// Streaming blob content.
pub type BlobReader = Pin<Box<dyn AsyncRead + Send>>;

/// What a transfer slot is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Manifest,
    Blob,
}

/// Entry held in a transfer admission queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub kind: JobKind,
    pub size: u64,
}

impl Job {
    pub fn manifest(size: u64) -> Self {
        Self {
            kind: JobKind::Manifest,
            size,
        }
    }

    pub fn blob(size: u64) -> Self {
        Self {
            kind: JobKind::Blob,
            size,
        }
    }
}

/// Admission queue bounding concurrent transfers against one store.
pub type TransferQueue = AdmissionQueue<Job>;

/// Build the transfer queue described by `config`.
pub fn transfer_queue(config: &TransferConfig) -> TransferQueue {
    match config.order {
        QueueOrder::Fifo => AdmissionQueue::new(config.max_concurrent),
        QueueOrder::ManifestsFirst => {
            AdmissionQueue::with_priority(config.max_concurrent, |queued: &[Job], _active: &[Job]| {
                queued
                    .iter()
                    .position(|job| job.kind == JobKind::Manifest)
                    .unwrap_or(0)
            })
        }
    }
}

/// Manifest access.
#[async_trait]
pub trait ManifestStore: Send + Sync {
    /// Fetch the manifest a reference points to (digest wins over tag).
    async fn get_manifest(&self, reference: &Reference) -> Result<Manifest>;

    /// Resolve a reference to the manifest descriptor without the body.
    async fn head_manifest(&self, reference: &Reference) -> Result<Descriptor>;

    /// Store a manifest; a tagged reference also moves the tag.
    async fn put_manifest(&self, reference: &Reference, manifest: &Manifest) -> Result<()>;

    async fn delete_manifest(&self, reference: &Reference) -> Result<()>;

    /// Remove a tag without deleting the manifest it names.
    async fn delete_tag(&self, reference: &Reference) -> Result<()> {
        Err(OciError::Unsupported(format!(
            "deleting tags is not supported for {}",
            reference
        )))
    }

    /// Queue bounding concurrent transfers, when the store has one.
    fn admission(&self) -> Option<&TransferQueue> {
        None
    }
}

/// Blob access.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get_blob(&self, reference: &Reference, desc: &Descriptor) -> Result<BlobReader>;

    /// Descriptor of a stored blob, `NotFound` when absent.
    async fn head_blob(&self, reference: &Reference, desc: &Descriptor) -> Result<Descriptor>;

    /// Store a blob read from `reader`, verifying size and digest.
    async fn put_blob(
        &self,
        reference: &Reference,
        desc: &Descriptor,
        reader: BlobReader,
    ) -> Result<Descriptor>;

    async fn delete_blob(&self, reference: &Reference, desc: &Descriptor) -> Result<()>;
}

/// A store that holds both manifests and blobs.
pub trait Store: ManifestStore + BlobStore {}

impl<S: ManifestStore + BlobStore + ?Sized> Store for S {}

/// Read a whole blob into memory, verifying it against `desc`.
pub async fn read_blob<S>(store: &S, reference: &Reference, desc: &Descriptor) -> Result<Vec<u8>>
where
    S: BlobStore + ?Sized,
{
    let mut reader = store.get_blob(reference, desc).await?;
    let mut bytes = Vec::with_capacity(desc.size as usize);
    reader.read_to_end(&mut bytes).await?;
    desc.check_content(&bytes)?;
    Ok(bytes)
}

/// Reader over in-memory bytes.
pub fn bytes_reader(bytes: Vec<u8>) -> BlobReader {
    Box::pin(std::io::Cursor::new(bytes))
}
