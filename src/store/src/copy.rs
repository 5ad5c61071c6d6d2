//! Copy manifests and their content between stores.
//!
//! Walks a manifest tree depth first: index children, then config and
//! layers, then the manifest itself, so a destination never names content
//! it does not hold. Blob transfers are admitted through the transfer queues
//! of both stores as one transaction.

use a3s_oci_core::error::{OciError, Result};
use a3s_oci_core::{AdmissionQueue, CancellationToken, Transaction};
use futures::future::BoxFuture;
use tracing::{debug, info, warn};

use crate::descriptor::Descriptor;
use crate::manifest::Manifest;
use crate::reference::Reference;
use crate::referrers::{ReferrerFilter, Referrers};
use crate::transport::{Job, Store};

/// Copy options.
#[derive(Debug, Clone, Default)]
pub struct CopyOptions {
    /// Also copy referrers of every copied manifest.
    pub referrers: bool,
    pub cancel: CancellationToken,
}

/// What a copy transferred.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopySummary {
    pub manifests: usize,
    pub blobs: usize,
    /// Blobs already present at the destination.
    pub skipped: usize,
    pub bytes: u64,
}

/// Copy the manifest `src_ref` names, and everything it references, to
/// `dst_ref`.
pub async fn copy_image<S, D>(
    src: &S,
    src_ref: &Reference,
    dst: &D,
    dst_ref: &Reference,
    opts: &CopyOptions,
) -> Result<CopySummary>
where
    S: Store + ?Sized,
    D: Store + ?Sized,
{
    let root = src.get_manifest(src_ref).await?;
    let mut copier = Copier {
        src,
        src_ref,
        dst,
        dst_ref,
        opts,
        summary: CopySummary::default(),
    };
    copier.copy_manifest(root, dst_ref.clone()).await?;

    info!(
        src = %src_ref,
        dst = %dst_ref,
        manifests = copier.summary.manifests,
        blobs = copier.summary.blobs,
        skipped = copier.summary.skipped,
        bytes = copier.summary.bytes,
        "Copied image"
    );
    Ok(copier.summary)
}

struct Copier<'a, S: ?Sized, D: ?Sized> {
    src: &'a S,
    src_ref: &'a Reference,
    dst: &'a D,
    dst_ref: &'a Reference,
    opts: &'a CopyOptions,
    summary: CopySummary,
}

impl<'a, S, D> Copier<'a, S, D>
where
    S: Store + ?Sized,
    D: Store + ?Sized,
{
    fn copy_manifest(&mut self, manifest: Manifest, target: Reference) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.check_cancelled()?;

            let children = manifest
                .as_indexer()
                .map(|i| i.manifests().to_vec())
                .unwrap_or_default();
            for child in children {
                let fetched = self
                    .src
                    .get_manifest(&self.src_ref.with_digest(child.digest.clone()))
                    .await?;
                if *fetched.digest() != child.digest {
                    return Err(OciError::DigestMismatch {
                        expected: child.digest.to_string(),
                        actual: fetched.digest().to_string(),
                    });
                }
                let child_target = self.dst_ref.with_digest(child.digest.clone());
                self.copy_manifest(fetched, child_target).await?;
            }

            let blobs: Vec<Descriptor> = manifest
                .as_imager()
                .map(|i| i.config().into_iter().chain(i.layers()).cloned().collect())
                .unwrap_or_default();
            for blob in &blobs {
                self.copy_blob(blob).await?;
            }

            let admission = self.admit(Job::manifest(manifest.descriptor().size)).await?;
            self.dst.put_manifest(&target, &manifest).await?;
            drop(admission);
            self.summary.manifests += 1;
            debug!(digest = %manifest.digest(), target = %target, "Copied manifest");

            if self.opts.referrers {
                self.copy_referrers(&manifest).await?;
            }
            Ok(())
        })
    }

    async fn copy_referrers(&mut self, manifest: &Manifest) -> Result<()> {
        let subject = self.src_ref.with_digest(manifest.digest().clone());
        let list = Referrers::new(self.src)
            .list(&subject, &ReferrerFilter::default())
            .await?;

        for desc in list.descriptors {
            let referrer = self
                .src
                .get_manifest(&self.src_ref.with_digest(desc.digest.clone()))
                .await?;
            let target = self.dst_ref.with_digest(desc.digest.clone());
            self.copy_manifest(referrer.clone(), target).await?;
            Referrers::new(self.dst)
                .add(&self.dst_ref.base(), &referrer)
                .await?;
        }
        Ok(())
    }

    async fn copy_blob(&mut self, desc: &Descriptor) -> Result<()> {
        self.check_cancelled()?;
        match self.dst.head_blob(self.dst_ref, desc).await {
            Ok(found) if found.size == desc.size => {
                self.summary.skipped += 1;
                debug!(digest = %desc.digest, "Blob already present");
                return Ok(());
            }
            Ok(found) => {
                warn!(
                    digest = %desc.digest,
                    expected = desc.size,
                    found = found.size,
                    "Destination blob has the wrong size, copying again"
                );
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let txn = self.admit(Job::blob(desc.size)).await?;
        // The destination queue is part of the transaction; this is a no-op.
        let _slot = match self.dst.admission() {
            Some(queue) => {
                queue
                    .acquire_in(txn.as_ref(), &self.opts.cancel, Job::blob(desc.size))
                    .await?
            }
            None => None,
        };

        let reader = self.src.get_blob(self.src_ref, desc).await?;
        self.dst.put_blob(self.dst_ref, desc, reader).await?;
        self.summary.blobs += 1;
        self.summary.bytes += desc.size;
        Ok(())
    }

    /// Take a slot in the source and destination transfer queues together.
    async fn admit(&self, job: Job) -> Result<Option<Transaction<Job>>> {
        let mut requests = Vec::with_capacity(2);
        if let Some(queue) = self.src.admission() {
            requests.push((queue, job.clone()));
        }
        if let Some(queue) = self.dst.admission() {
            requests.push((queue, job));
        }
        if requests.is_empty() {
            return Ok(None);
        }
        AdmissionQueue::acquire_multi(&self.opts.cancel, &requests)
            .await
            .map(Some)
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.opts.cancel.is_cancelled() {
            return Err(OciError::Cancelled);
        }
        Ok(())
    }
}
