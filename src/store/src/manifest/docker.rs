//! Docker distribution manifests: schema 1 (optionally JWS signed),
//! schema 2 image manifests and schema 2 manifest lists.

use a3s_oci_core::error::{OciError, Result};
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::{Deserialize, Serialize};

use super::{Imager, Indexer};
use crate::descriptor::Descriptor;
use crate::digest::Digest;
use crate::mediatype;

/// Schema 1 layer reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FsLayer {
    pub blob_sum: Digest,
}

/// Schema 1 history entry; the payload is an opaque JSON string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct V1History {
    pub v1_compatibility: String,
}

/// One JWS signature of a signed schema 1 manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JwsSignature {
    #[serde(default)]
    pub header: serde_json::Value,
    pub signature: String,
    pub protected: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProtectedHeader {
    format_length: usize,
    format_tail: String,
}

/// Legacy schema 1 manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Docker1Manifest {
    pub schema_version: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub fs_layers: Vec<FsLayer>,
    #[serde(default)]
    pub history: Vec<V1History>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signatures: Vec<JwsSignature>,
    #[serde(skip)]
    layer_descriptors: Vec<Descriptor>,
}

impl Docker1Manifest {
    pub(crate) fn decode(raw: &[u8]) -> Result<Self> {
        let mut manifest: Docker1Manifest = serde_json::from_slice(raw)
            .map_err(|e| OciError::ManifestError(format!("invalid schema 1 manifest: {}", e)))?;
        if manifest.schema_version != 1 {
            return Err(OciError::ManifestError(format!(
                "schema 1 manifest has schemaVersion {}",
                manifest.schema_version
            )));
        }
        manifest.layer_descriptors = manifest
            .fs_layers
            .iter()
            .map(|l| Descriptor::new(mediatype::DOCKER2_LAYER_GZIP, l.blob_sum.clone(), 0))
            .collect();
        Ok(manifest)
    }

    /// The bytes the signatures cover, which is also what the manifest
    /// digest is computed over.
    ///
    /// Each protected header records how much of the raw document precedes
    /// the signature block (`formatLength`) and the bytes that closed the
    /// document before signing (`formatTail`).
    pub(crate) fn signed_payload(&self, raw: &[u8]) -> Result<Vec<u8>> {
        let mut payload: Option<Vec<u8>> = None;
        for signature in &self.signatures {
            if signature.signature.is_empty() {
                return Err(OciError::ManifestError("empty JWS signature".to_string()));
            }
            let header = decode_b64url(&signature.protected)?;
            let header: ProtectedHeader = serde_json::from_slice(&header).map_err(|e| {
                OciError::ManifestError(format!("invalid JWS protected header: {}", e))
            })?;
            if header.format_length > raw.len() {
                return Err(OciError::ManifestError(format!(
                    "JWS formatLength {} exceeds manifest length {}",
                    header.format_length,
                    raw.len()
                )));
            }
            let mut candidate = raw[..header.format_length].to_vec();
            candidate.extend_from_slice(&decode_b64url(&header.format_tail)?);

            match &payload {
                Some(existing) if *existing != candidate => {
                    return Err(OciError::ManifestError(
                        "JWS signatures disagree on the signed payload".to_string(),
                    ));
                }
                Some(_) => {}
                None => payload = Some(candidate),
            }
        }

        payload.ok_or_else(|| {
            OciError::ManifestError("signed schema 1 manifest has no signatures".to_string())
        })
    }
}

impl Imager for Docker1Manifest {
    fn config(&self) -> Option<&Descriptor> {
        None
    }

    fn layers(&self) -> &[Descriptor] {
        &self.layer_descriptors
    }
}

fn decode_b64url(s: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(s)
        .or_else(|_| URL_SAFE.decode(s))
        .map_err(|e| OciError::ManifestError(format!("invalid base64url in JWS: {}", e)))
}

/// Docker schema 2 image manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Docker2Manifest {
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: String,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
}

impl Docker2Manifest {
    pub(crate) fn decode(raw: &[u8]) -> Result<Self> {
        let manifest: Docker2Manifest = serde_json::from_slice(raw)
            .map_err(|e| OciError::ManifestError(format!("invalid schema 2 manifest: {}", e)))?;
        check_schema_version(manifest.schema_version)?;
        Ok(manifest)
    }
}

impl Imager for Docker2Manifest {
    fn config(&self) -> Option<&Descriptor> {
        Some(&self.config)
    }

    fn layers(&self) -> &[Descriptor] {
        &self.layers
    }
}

/// Docker schema 2 manifest list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Docker2ManifestList {
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: String,
    pub manifests: Vec<Descriptor>,
}

impl Docker2ManifestList {
    pub(crate) fn decode(raw: &[u8]) -> Result<Self> {
        let list: Docker2ManifestList = serde_json::from_slice(raw)
            .map_err(|e| OciError::ManifestError(format!("invalid manifest list: {}", e)))?;
        check_schema_version(list.schema_version)?;
        Ok(list)
    }
}

impl Indexer for Docker2ManifestList {
    fn manifests(&self) -> &[Descriptor] {
        &self.manifests
    }

    fn set_manifests(&mut self, manifests: Vec<Descriptor>) {
        self.manifests = manifests;
    }
}

pub(crate) fn check_schema_version(version: u32) -> Result<()> {
    if version != 2 {
        return Err(OciError::ManifestError(format!(
            "unsupported schemaVersion {}",
            version
        )));
    }
    Ok(())
}
