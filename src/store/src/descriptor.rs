//! Content descriptors.
//!
//! A descriptor points at content by digest and size. Two comparisons are
//! provided: [`Descriptor::same`] asks whether two descriptors name identical
//! bytes (media types compared through the Docker/OCI compatibility table),
//! while `==` additionally requires the metadata to match exactly.

use std::collections::BTreeMap;

use a3s_oci_core::error::{OciError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::mediatype;
use crate::platform::Platform;

/// Content descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub media_type: String,
    pub digest: Digest,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Base64 encoded inline copy of the content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
}

impl Descriptor {
    pub fn new(media_type: impl Into<String>, digest: Digest, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest,
            size,
            urls: Vec::new(),
            annotations: BTreeMap::new(),
            data: None,
            platform: None,
            artifact_type: None,
        }
    }

    /// Descriptor for `bytes` using a sha256 digest.
    pub fn for_bytes(media_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self::new(media_type, Digest::sha256_of(bytes), bytes.len() as u64)
    }

    /// Attach an inline copy of `bytes`, which must be the described content.
    pub fn with_data(mut self, bytes: &[u8]) -> Result<Self> {
        self.check_content(bytes)?;
        self.data = Some(BASE64.encode(bytes));
        Ok(self)
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Decode the inline data, verifying length and digest.
    ///
    /// Returns `Ok(None)` when the descriptor carries no data.
    pub fn inline_data(&self) -> Result<Option<Vec<u8>>> {
        let Some(encoded) = &self.data else {
            return Ok(None);
        };
        let bytes = BASE64.decode(encoded).map_err(|e| {
            OciError::ManifestError(format!("invalid inline data for {}: {}", self.digest, e))
        })?;
        self.check_content(&bytes)?;
        Ok(Some(bytes))
    }

    /// Fail unless `bytes` has this descriptor's size and digest.
    pub fn check_content(&self, bytes: &[u8]) -> Result<()> {
        if bytes.len() as u64 != self.size {
            return Err(OciError::SizeMismatch {
                expected: self.size,
                actual: bytes.len() as u64,
            });
        }
        self.digest.verify(bytes)
    }

    /// Whether both descriptors reference identical content.
    pub fn same(&self, other: &Descriptor) -> bool {
        self.digest == other.digest
            && self.size == other.size
            && mediatype::compatible(&self.media_type, &other.media_type)
    }

    /// Whether the descriptor's platform satisfies `wanted`.
    pub fn matches_platform(&self, wanted: &Platform) -> bool {
        self.platform
            .as_ref()
            .map(|p| p.matches(wanted))
            .unwrap_or(false)
    }
}

impl PartialEq for Descriptor {
    fn eq(&self, other: &Self) -> bool {
        self.media_type == other.media_type
            && self.digest == other.digest
            && self.size == other.size
            && self.artifact_type == other.artifact_type
            && self.platform == other.platform
            && self.urls == other.urls
            && self.annotations == other.annotations
    }
}

impl Eq for Descriptor {}
