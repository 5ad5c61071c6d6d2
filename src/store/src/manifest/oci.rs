//! OCI image manifests, image indexes and artifact manifests.

use std::collections::BTreeMap;

use a3s_oci_core::error::{OciError, Result};
use serde::{Deserialize, Serialize};

use super::docker::check_schema_version;
use super::{Annotator, Imager, Indexer, Subjecter};
use crate::descriptor::Descriptor;
use crate::mediatype;

/// OCI image manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciManifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Descriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl OciManifest {
    pub(crate) fn decode(raw: &[u8]) -> Result<Self> {
        let manifest: OciManifest = serde_json::from_slice(raw)
            .map_err(|e| OciError::ManifestError(format!("invalid OCI manifest: {}", e)))?;
        check_schema_version(manifest.schema_version)?;
        Ok(manifest)
    }
}

impl Imager for OciManifest {
    fn config(&self) -> Option<&Descriptor> {
        Some(&self.config)
    }

    fn layers(&self) -> &[Descriptor] {
        &self.layers
    }
}

impl Subjecter for OciManifest {
    fn subject(&self) -> Option<&Descriptor> {
        self.subject.as_ref()
    }

    fn set_subject(&mut self, subject: Option<Descriptor>) {
        self.subject = subject;
    }
}

impl Annotator for OciManifest {
    fn annotations(&self) -> &BTreeMap<String, String> {
        &self.annotations
    }

    fn annotations_mut(&mut self) -> &mut BTreeMap<String, String> {
        &mut self.annotations
    }
}

/// OCI image index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciIndex {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Descriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl OciIndex {
    /// Empty index carrying the OCI media type.
    pub fn new() -> Self {
        Self {
            schema_version: 2,
            media_type: Some(mediatype::OCI1_INDEX.to_string()),
            artifact_type: None,
            manifests: Vec::new(),
            subject: None,
            annotations: BTreeMap::new(),
        }
    }

    pub(crate) fn decode(raw: &[u8]) -> Result<Self> {
        let index: OciIndex = serde_json::from_slice(raw)
            .map_err(|e| OciError::ManifestError(format!("invalid OCI index: {}", e)))?;
        check_schema_version(index.schema_version)?;
        Ok(index)
    }
}

impl Default for OciIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl Indexer for OciIndex {
    fn manifests(&self) -> &[Descriptor] {
        &self.manifests
    }

    fn set_manifests(&mut self, manifests: Vec<Descriptor>) {
        self.manifests = manifests;
    }
}

impl Subjecter for OciIndex {
    fn subject(&self) -> Option<&Descriptor> {
        self.subject.as_ref()
    }

    fn set_subject(&mut self, subject: Option<Descriptor>) {
        self.subject = subject;
    }
}

impl Annotator for OciIndex {
    fn annotations(&self) -> &BTreeMap<String, String> {
        &self.annotations
    }

    fn annotations_mut(&mut self) -> &mut BTreeMap<String, String> {
        &mut self.annotations
    }
}

/// OCI artifact manifest. Blobs play the role of layers and there is no
/// config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciArtifact {
    pub media_type: String,
    #[serde(default)]
    pub artifact_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blobs: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Descriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl OciArtifact {
    pub(crate) fn decode(raw: &[u8]) -> Result<Self> {
        let artifact: OciArtifact = serde_json::from_slice(raw)
            .map_err(|e| OciError::ManifestError(format!("invalid OCI artifact: {}", e)))?;
        if artifact.artifact_type.is_empty() {
            return Err(OciError::ManifestError(
                "artifact manifest is missing artifactType".to_string(),
            ));
        }
        Ok(artifact)
    }
}

impl Imager for OciArtifact {
    fn config(&self) -> Option<&Descriptor> {
        None
    }

    fn layers(&self) -> &[Descriptor] {
        &self.blobs
    }
}

impl Subjecter for OciArtifact {
    fn subject(&self) -> Option<&Descriptor> {
        self.subject.as_ref()
    }

    fn set_subject(&mut self, subject: Option<Descriptor>) {
        self.subject = subject;
    }
}

impl Annotator for OciArtifact {
    fn annotations(&self) -> &BTreeMap<String, String> {
        &self.annotations
    }

    fn annotations_mut(&mut self) -> &mut BTreeMap<String, String> {
        &mut self.annotations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oci_manifest_fields() {
        let raw = br#"{
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "artifactType": "application/vnd.example.sig",
            "config": {"mediaType": "application/vnd.oci.empty.v1+json", "digest": "sha256:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a", "size": 2},
            "layers": [],
            "annotations": {"org.example": "yes"}
        }"#;
        let manifest = OciManifest::decode(raw).unwrap();
        assert_eq!(manifest.artifact_type.as_deref(), Some("application/vnd.example.sig"));
        assert_eq!(manifest.config().unwrap().size, 2);
        assert!(manifest.subject().is_none());
        assert_eq!(manifest.annotations()["org.example"], "yes");
    }

    #[test]
    fn test_artifact_requires_type() {
        let raw = br#"{"mediaType":"application/vnd.oci.artifact.manifest.v1+json"}"#;
        assert!(OciArtifact::decode(raw).is_err());
    }

    #[test]
    fn test_index_skips_empty_fields() {
        let json = serde_json::to_value(OciIndex::new()).unwrap();
        assert_eq!(json["schemaVersion"], 2);
        assert_eq!(json["mediaType"], mediatype::OCI1_INDEX);
        assert!(json.get("subject").is_none());
        assert!(json.get("annotations").is_none());
        assert_eq!(json["manifests"], serde_json::json!([]));
    }
}
