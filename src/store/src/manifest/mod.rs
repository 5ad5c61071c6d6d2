//! Manifest model.
//!
//! A [`Manifest`] pairs the raw bytes it was decoded from with a tagged
//! variant ([`ManifestKind`]). Each variant is a flat record that implements
//! only the capabilities it has:
//!
//! - [`Subjecter`]: optional link to the manifest it refers to
//! - [`Indexer`]: ordered child manifests (lists and indexes)
//! - [`Imager`]: config and layers
//!
//! The raw bytes are kept as received so the descriptor digest stays stable;
//! only the mutators re-serialize, and they recompute the descriptor.

pub mod docker;
pub mod oci;

use std::collections::BTreeMap;

use a3s_oci_core::error::{OciError, Result};
use serde::Serialize;

pub use docker::{Docker1Manifest, Docker2Manifest, Docker2ManifestList};
pub use oci::{OciArtifact, OciIndex, OciManifest};

use crate::descriptor::Descriptor;
use crate::digest::{self, Digest};
use crate::mediatype;
use crate::platform::Platform;

/// Manifests that may declare a subject.
pub trait Subjecter: Send + Sync {
    fn subject(&self) -> Option<&Descriptor>;
    fn set_subject(&mut self, subject: Option<Descriptor>);
}

/// Manifests that list child manifests.
pub trait Indexer: Send + Sync {
    fn manifests(&self) -> &[Descriptor];
    fn set_manifests(&mut self, manifests: Vec<Descriptor>);
}

/// Manifests that describe a single image.
pub trait Imager: Send + Sync {
    /// Config blob, absent for artifact and schema 1 manifests.
    fn config(&self) -> Option<&Descriptor>;
    fn layers(&self) -> &[Descriptor];
}

/// Manifests carrying top-level annotations.
pub trait Annotator: Send + Sync {
    fn annotations(&self) -> &BTreeMap<String, String>;
    fn annotations_mut(&mut self) -> &mut BTreeMap<String, String>;
}

/// Decoded manifest variants.
#[derive(Debug, Clone, PartialEq)]
pub enum ManifestKind {
    Docker1(Docker1Manifest),
    Docker1Signed(Docker1Manifest),
    Docker2(Docker2Manifest),
    Docker2List(Docker2ManifestList),
    OciImage(OciManifest),
    OciIndex(OciIndex),
    OciArtifact(OciArtifact),
}

impl ManifestKind {
    fn decode(media_type: &str, raw: &[u8]) -> Result<Self> {
        let kind = match media_type {
            mediatype::DOCKER1_MANIFEST => ManifestKind::Docker1(Docker1Manifest::decode(raw)?),
            mediatype::DOCKER1_MANIFEST_SIGNED => {
                ManifestKind::Docker1Signed(Docker1Manifest::decode(raw)?)
            }
            mediatype::DOCKER2_MANIFEST => ManifestKind::Docker2(Docker2Manifest::decode(raw)?),
            mediatype::DOCKER2_MANIFEST_LIST => {
                ManifestKind::Docker2List(Docker2ManifestList::decode(raw)?)
            }
            mediatype::OCI1_MANIFEST => ManifestKind::OciImage(OciManifest::decode(raw)?),
            mediatype::OCI1_INDEX => ManifestKind::OciIndex(OciIndex::decode(raw)?),
            mediatype::OCI1_ARTIFACT => ManifestKind::OciArtifact(OciArtifact::decode(raw)?),
            other => {
                return Err(OciError::UnsupportedMediaType(format!(
                    "{} is not a manifest media type",
                    other
                )))
            }
        };

        if let Some(declared) = kind.declared_media_type() {
            if mediatype::base(declared) != media_type {
                return Err(OciError::UnsupportedMediaType(format!(
                    "document declares {} but was decoded as {}",
                    declared, media_type
                )));
            }
        }
        Ok(kind)
    }

    /// Media type this variant is stored under.
    pub fn media_type(&self) -> &'static str {
        match self {
            ManifestKind::Docker1(_) => mediatype::DOCKER1_MANIFEST,
            ManifestKind::Docker1Signed(_) => mediatype::DOCKER1_MANIFEST_SIGNED,
            ManifestKind::Docker2(_) => mediatype::DOCKER2_MANIFEST,
            ManifestKind::Docker2List(_) => mediatype::DOCKER2_MANIFEST_LIST,
            ManifestKind::OciImage(_) => mediatype::OCI1_MANIFEST,
            ManifestKind::OciIndex(_) => mediatype::OCI1_INDEX,
            ManifestKind::OciArtifact(_) => mediatype::OCI1_ARTIFACT,
        }
    }

    /// `mediaType` field found inside the document, if any.
    fn declared_media_type(&self) -> Option<&str> {
        let declared = match self {
            ManifestKind::Docker1(_) | ManifestKind::Docker1Signed(_) => None,
            ManifestKind::Docker2(m) => Some(m.media_type.as_str()),
            ManifestKind::Docker2List(m) => Some(m.media_type.as_str()),
            ManifestKind::OciImage(m) => m.media_type.as_deref(),
            ManifestKind::OciIndex(m) => m.media_type.as_deref(),
            ManifestKind::OciArtifact(m) => Some(m.media_type.as_str()),
        };
        declared.filter(|d| !d.is_empty())
    }

    fn encode(&self) -> Result<Vec<u8>> {
        fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>> {
            Ok(serde_json::to_vec(value)?)
        }
        match self {
            ManifestKind::Docker1(m) => to_vec(m),
            ManifestKind::Docker1Signed(_) => Err(OciError::Unsupported(
                "signed schema 1 manifests cannot be re-serialized".to_string(),
            )),
            ManifestKind::Docker2(m) => to_vec(m),
            ManifestKind::Docker2List(m) => to_vec(m),
            ManifestKind::OciImage(m) => to_vec(m),
            ManifestKind::OciIndex(m) => to_vec(m),
            ManifestKind::OciArtifact(m) => to_vec(m),
        }
    }

    fn content_digest(&self, algorithm: &str, raw: &[u8]) -> Result<Digest> {
        match self {
            ManifestKind::Docker1Signed(m) => Digest::compute(algorithm, &m.signed_payload(raw)?),
            _ => Digest::compute(algorithm, raw),
        }
    }

    fn subjecter_mut(&mut self) -> Option<&mut dyn Subjecter> {
        match self {
            ManifestKind::OciImage(m) => Some(m),
            ManifestKind::OciIndex(m) => Some(m),
            ManifestKind::OciArtifact(m) => Some(m),
            _ => None,
        }
    }

    fn indexer_mut(&mut self) -> Option<&mut dyn Indexer> {
        match self {
            ManifestKind::Docker2List(m) => Some(m),
            ManifestKind::OciIndex(m) => Some(m),
            _ => None,
        }
    }

    fn annotator_mut(&mut self) -> Option<&mut dyn Annotator> {
        match self {
            ManifestKind::OciImage(m) => Some(m),
            ManifestKind::OciIndex(m) => Some(m),
            ManifestKind::OciArtifact(m) => Some(m),
            _ => None,
        }
    }
}

/// A decoded manifest and the bytes it came from.
#[derive(Debug, Clone)]
pub struct Manifest {
    desc: Descriptor,
    raw: Vec<u8>,
    kind: ManifestKind,
}

impl Manifest {
    /// Decode `raw` as `media_type`, computing a sha256 descriptor.
    pub fn from_bytes(raw: impl Into<Vec<u8>>, media_type: &str) -> Result<Self> {
        let raw = raw.into();
        let media_type = mediatype::base(media_type);
        let kind = ManifestKind::decode(media_type, &raw)?;
        let digest = kind.content_digest(digest::SHA256, &raw)?;
        let desc = Descriptor::new(media_type, digest, raw.len() as u64);
        Ok(Self { desc, raw, kind })
    }

    /// Decode `raw` fetched through `desc`, failing unless the bytes match
    /// the descriptor's size and digest.
    pub fn from_descriptor(desc: &Descriptor, raw: impl Into<Vec<u8>>) -> Result<Self> {
        let raw = raw.into();
        let media_type = mediatype::base(&desc.media_type);
        let kind = ManifestKind::decode(media_type, &raw)?;
        if raw.len() as u64 != desc.size {
            return Err(OciError::SizeMismatch {
                expected: desc.size,
                actual: raw.len() as u64,
            });
        }
        let actual = kind.content_digest(desc.digest.algorithm(), &raw)?;
        if actual != desc.digest {
            return Err(OciError::DigestMismatch {
                expected: desc.digest.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(Self {
            desc: desc.clone(),
            raw,
            kind,
        })
    }

    /// Decode bytes of unknown media type, see [`Manifest::detect`].
    pub fn decode(raw: impl Into<Vec<u8>>) -> Result<Self> {
        let raw = raw.into();
        let media_type = Self::detect(&raw)?;
        Self::from_bytes(raw, media_type)
    }

    /// Guess the media type of a manifest document.
    ///
    /// The `mediaType` field wins; otherwise the document's shape decides.
    pub fn detect(raw: &[u8]) -> Result<&'static str> {
        let value: serde_json::Value = serde_json::from_slice(raw)
            .map_err(|e| OciError::ManifestError(format!("invalid manifest JSON: {}", e)))?;
        let object = value
            .as_object()
            .ok_or_else(|| OciError::ManifestError("manifest is not a JSON object".to_string()))?;

        if let Some(declared) = object.get("mediaType").and_then(|v| v.as_str()) {
            let declared = mediatype::base(declared);
            return KNOWN_MANIFEST_TYPES
                .iter()
                .copied()
                .find(|known| *known == declared)
                .ok_or_else(|| OciError::UnsupportedMediaType(declared.to_string()));
        }

        let detected = if object.contains_key("signatures") {
            mediatype::DOCKER1_MANIFEST_SIGNED
        } else if object.contains_key("fsLayers") {
            mediatype::DOCKER1_MANIFEST
        } else if object.contains_key("manifests") {
            mediatype::OCI1_INDEX
        } else if object.contains_key("config") {
            mediatype::OCI1_MANIFEST
        } else if object.contains_key("blobs") || object.contains_key("artifactType") {
            mediatype::OCI1_ARTIFACT
        } else {
            return Err(OciError::UnsupportedMediaType(
                "unable to detect manifest media type".to_string(),
            ));
        };
        Ok(detected)
    }

    /// Serialize `kind` into a new manifest.
    pub fn from_kind(kind: ManifestKind) -> Result<Self> {
        let raw = kind.encode()?;
        let digest = kind.content_digest(digest::SHA256, &raw)?;
        let desc = Descriptor::new(kind.media_type(), digest, raw.len() as u64);
        Ok(Self { desc, raw, kind })
    }

    /// Fresh OCI index listing `manifests`.
    pub fn new_index(
        manifests: Vec<Descriptor>,
        annotations: BTreeMap<String, String>,
    ) -> Result<Self> {
        let mut index = OciIndex::new();
        index.manifests = manifests;
        index.annotations = annotations;
        Self::from_kind(ManifestKind::OciIndex(index))
    }

    /// Descriptor of this manifest; its digest covers [`Manifest::raw`]
    /// (or the signed payload for schema 1 signed manifests).
    pub fn descriptor(&self) -> &Descriptor {
        &self.desc
    }

    pub fn media_type(&self) -> &str {
        &self.desc.media_type
    }

    pub fn digest(&self) -> &Digest {
        &self.desc.digest
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn kind(&self) -> &ManifestKind {
        &self.kind
    }

    pub fn is_index(&self) -> bool {
        self.as_indexer().is_some()
    }

    pub fn as_subjecter(&self) -> Option<&dyn Subjecter> {
        match &self.kind {
            ManifestKind::OciImage(m) => Some(m),
            ManifestKind::OciIndex(m) => Some(m),
            ManifestKind::OciArtifact(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_indexer(&self) -> Option<&dyn Indexer> {
        match &self.kind {
            ManifestKind::Docker2List(m) => Some(m),
            ManifestKind::OciIndex(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_imager(&self) -> Option<&dyn Imager> {
        match &self.kind {
            ManifestKind::Docker1(m) | ManifestKind::Docker1Signed(m) => Some(m),
            ManifestKind::Docker2(m) => Some(m),
            ManifestKind::OciImage(m) => Some(m),
            ManifestKind::OciArtifact(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_annotator(&self) -> Option<&dyn Annotator> {
        match &self.kind {
            ManifestKind::OciImage(m) => Some(m),
            ManifestKind::OciIndex(m) => Some(m),
            ManifestKind::OciArtifact(m) => Some(m),
            _ => None,
        }
    }

    /// Declared subject, if the variant supports one and it is set.
    pub fn subject(&self) -> Option<&Descriptor> {
        self.as_subjecter().and_then(|s| s.subject())
    }

    /// Top-level annotations; empty for variants without them.
    pub fn annotations(&self) -> BTreeMap<String, String> {
        self.as_annotator()
            .map(|a| a.annotations().clone())
            .unwrap_or_default()
    }

    /// Child manifest matching `platform`; the first match wins.
    pub fn platform_descriptor(&self, platform: &Platform) -> Result<Descriptor> {
        let indexer = self.as_indexer().ok_or_else(|| {
            OciError::Unsupported(format!("{} does not list platforms", self.media_type()))
        })?;
        indexer
            .manifests()
            .iter()
            .find(|d| d.matches_platform(platform))
            .cloned()
            .ok_or_else(|| {
                OciError::NotFound(format!("platform {} in {}", platform, self.digest()))
            })
    }

    pub fn set_subject(&mut self, subject: Option<Descriptor>) -> Result<()> {
        let media_type = self.media_type().to_string();
        let subjecter = self.kind.subjecter_mut().ok_or_else(|| {
            OciError::Unsupported(format!("{} does not support a subject", media_type))
        })?;
        subjecter.set_subject(subject);
        self.refresh()
    }

    pub fn set_manifests(&mut self, manifests: Vec<Descriptor>) -> Result<()> {
        let media_type = self.media_type().to_string();
        let indexer = self.kind.indexer_mut().ok_or_else(|| {
            OciError::Unsupported(format!("{} does not list manifests", media_type))
        })?;
        indexer.set_manifests(manifests);
        self.refresh()
    }

    /// Set (`Some`) or remove (`None`) a top-level annotation.
    pub fn set_annotation(&mut self, key: &str, value: Option<String>) -> Result<()> {
        let media_type = self.media_type().to_string();
        let annotator = self.kind.annotator_mut().ok_or_else(|| {
            OciError::Unsupported(format!("{} does not support annotations", media_type))
        })?;
        match value {
            Some(value) => {
                annotator.annotations_mut().insert(key.to_string(), value);
            }
            None => {
                annotator.annotations_mut().remove(key);
            }
        }
        self.refresh()
    }

    /// Re-serialize after a mutation and recompute the descriptor.
    fn refresh(&mut self) -> Result<()> {
        let raw = self.kind.encode()?;
        let algorithm = if self.desc.digest.is_computable() {
            self.desc.digest.algorithm().to_string()
        } else {
            digest::SHA256.to_string()
        };
        let digest = self.kind.content_digest(&algorithm, &raw)?;
        self.desc = Descriptor::new(self.desc.media_type.clone(), digest, raw.len() as u64);
        self.raw = raw;
        Ok(())
    }
}

const KNOWN_MANIFEST_TYPES: &[&str] = &[
    mediatype::DOCKER1_MANIFEST,
    mediatype::DOCKER1_MANIFEST_SIGNED,
    mediatype::DOCKER2_MANIFEST,
    mediatype::DOCKER2_MANIFEST_LIST,
    mediatype::OCI1_MANIFEST,
    mediatype::OCI1_INDEX,
    mediatype::OCI1_ARTIFACT,
];
