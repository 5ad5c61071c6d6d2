//! A3S OCI Store - Content-addressable storage for OCI images and artifacts.
//!
//! This crate provides reference parsing, the descriptor and manifest model,
//! referrer graph maintenance, an on-disk OCI image layout store with
//! mark-and-sweep garbage collection, and manifest tree copying between stores.

#![allow(clippy::result_large_err)]

pub mod copy;
pub mod descriptor;
pub mod digest;
pub mod layout;
pub mod manifest;
pub mod mediatype;
pub mod platform;
pub mod reference;
pub mod referrers;
pub mod transport;

// Re-export common types
pub use copy::{copy_image, CopyOptions, CopySummary};
pub use descriptor::Descriptor;
pub use digest::{Digest, Digester};
pub use layout::{GcSummary, LayoutStore, PathHold};
pub use manifest::{Annotator, Imager, Indexer, Manifest, ManifestKind, Subjecter};
pub use platform::Platform;
pub use reference::{Locator, Reference};
pub use referrers::{fallback_tag, ReferrerFilter, ReferrerList, Referrers};
pub use transport::{BlobReader, BlobStore, Job, JobKind, ManifestStore, Store, TransferQueue};

/// A3S OCI Store version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
