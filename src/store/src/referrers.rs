//! Referrer graph manager.
//!
//! Referrers of a subject are tracked in an OCI index pushed under a fallback
//! tag derived from the subject digest. Each entry copies the artifact type
//! and annotations of the referring manifest, so listing never has to fetch
//! the referrers themselves.
//!
//! The read-modify-write of the fallback index is not transactional; callers
//! that need atomic updates lock the subject first (the layout store does).

use std::collections::BTreeMap;

use a3s_oci_core::error::{OciError, Result};
use tracing::debug;

use crate::descriptor::Descriptor;
use crate::digest::Digest;
use crate::manifest::{Manifest, ManifestKind};
use crate::platform::Platform;
use crate::reference::Reference;
use crate::transport::ManifestStore;

const MAX_ALGORITHM_LEN: usize = 32;
const MAX_HEX_LEN: usize = 64;

/// Tag under which the referrers of `digest` are stored.
///
/// `<algorithm>-<hex>` with characters outside `[A-Za-z0-9._-]` replaced by
/// `-`, the algorithm truncated to 32 and the hex to 64 characters.
pub fn fallback_tag(digest: &Digest) -> String {
    format!(
        "{}-{}",
        sanitize(digest.algorithm(), MAX_ALGORITHM_LEN),
        sanitize(digest.hex(), MAX_HEX_LEN)
    )
}

fn sanitize(s: &str, max: usize) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .take(max)
        .collect()
}

/// Filters applied when listing referrers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferrerFilter {
    /// Only entries with this artifact type.
    pub artifact_type: Option<String>,
    /// Every pair must match; an empty value only requires the key.
    pub annotations: BTreeMap<String, String>,
    /// When the subject is an index, list the referrers of this platform's
    /// child instead.
    pub platform: Option<Platform>,
}

impl ReferrerFilter {
    pub fn artifact_type(artifact_type: impl Into<String>) -> Self {
        Self {
            artifact_type: Some(artifact_type.into()),
            ..Default::default()
        }
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = Some(platform);
        self
    }

    fn matches(&self, desc: &Descriptor) -> bool {
        if let Some(wanted) = &self.artifact_type {
            if desc.artifact_type.as_deref() != Some(wanted.as_str()) {
                return false;
            }
        }
        self.annotations.iter().all(|(key, value)| match desc.annotations.get(key) {
            Some(actual) => value.is_empty() || actual == value,
            None => false,
        })
    }
}

/// Referrers of one subject.
#[derive(Debug, Clone)]
pub struct ReferrerList {
    /// Subject, resolved to a digest.
    pub subject: Reference,
    pub descriptors: Vec<Descriptor>,
    /// Annotations of the backing index.
    pub annotations: BTreeMap<String, String>,
    /// Backing index as stored under the fallback tag.
    pub manifest: Manifest,
    /// Tags the list was loaded from.
    pub tags: Vec<String>,
}

impl ReferrerList {
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

/// Descriptor recorded for a referrer, carrying its artifact type and
/// annotations.
pub fn referrer_descriptor(manifest: &Manifest) -> Descriptor {
    let own = manifest.descriptor();
    let mut desc = Descriptor::new(own.media_type.clone(), own.digest.clone(), own.size);
    let (artifact_type, annotations) = match manifest.kind() {
        ManifestKind::OciArtifact(m) => (
            Some(m.artifact_type.clone()).filter(|t| !t.is_empty()),
            m.annotations.clone(),
        ),
        ManifestKind::OciImage(m) => (
            m.artifact_type
                .clone()
                .or_else(|| Some(m.config.media_type.clone()))
                .filter(|t| !t.is_empty()),
            m.annotations.clone(),
        ),
        ManifestKind::OciIndex(m) => (m.artifact_type.clone(), m.annotations.clone()),
        _ => (None, BTreeMap::new()),
    };
    desc.artifact_type = artifact_type;
    desc.annotations = annotations;
    desc
}

/// The subject a referrer declares, validated to be fully populated.
fn declared_subject(manifest: &Manifest) -> Result<&Descriptor> {
    let subjecter = manifest.as_subjecter().ok_or_else(|| {
        OciError::Unsupported(format!("{} cannot declare a subject", manifest.media_type()))
    })?;
    match subjecter.subject() {
        Some(subject) if !subject.media_type.is_empty() && subject.size > 0 => Ok(subject),
        _ => Err(OciError::SubjectNotSet),
    }
}

/// Referrer operations against a manifest store.
pub struct Referrers<'a, S: ?Sized> {
    store: &'a S,
}

impl<'a, S: ManifestStore + ?Sized> Referrers<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// List referrers of `subject`.
    ///
    /// A subject without a digest is resolved through the store first. No
    /// stored index yields an empty list.
    pub async fn list(&self, subject: &Reference, filter: &ReferrerFilter) -> Result<ReferrerList> {
        let digest = self.resolve(subject, filter.platform.as_ref()).await?;
        let mut list = self.load(subject, &digest).await?;
        list.descriptors.retain(|d| filter.matches(d));
        Ok(list)
    }

    /// Record `manifest` as a referrer of its subject in the repository of
    /// `reference`. Adding the same digest twice is a no-op.
    pub async fn add(&self, reference: &Reference, manifest: &Manifest) -> Result<()> {
        let subject = declared_subject(manifest)?;
        let mut list = self.load(reference, &subject.digest).await?;
        if list.descriptors.iter().any(|d| d.digest == *manifest.digest()) {
            debug!(
                referrer = %manifest.digest(),
                subject = %subject.digest,
                "Referrer already recorded"
            );
            return Ok(());
        }

        list.descriptors.push(referrer_descriptor(manifest));
        debug!(
            referrer = %manifest.digest(),
            subject = %subject.digest,
            count = list.descriptors.len(),
            "Adding referrer"
        );
        self.save(list).await
    }

    /// Remove every entry for `manifest` from its subject's referrers.
    pub async fn delete(&self, reference: &Reference, manifest: &Manifest) -> Result<()> {
        let subject = declared_subject(manifest)?;
        let mut list = self.load(reference, &subject.digest).await?;
        let before = list.descriptors.len();
        list.descriptors.retain(|d| d.digest != *manifest.digest());
        if list.descriptors.len() == before {
            return Err(OciError::NotFound(format!(
                "referrer {} of {}",
                manifest.digest(),
                subject.digest
            )));
        }

        debug!(
            referrer = %manifest.digest(),
            subject = %subject.digest,
            count = list.descriptors.len(),
            "Deleting referrer"
        );
        self.save(list).await
    }

    async fn resolve(&self, subject: &Reference, platform: Option<&Platform>) -> Result<Digest> {
        let digest = match &subject.digest {
            Some(digest) => digest.clone(),
            None => self.store.head_manifest(subject).await?.digest,
        };
        let Some(platform) = platform else {
            return Ok(digest);
        };

        let manifest = self
            .store
            .get_manifest(&subject.with_digest(digest.clone()))
            .await?;
        if manifest.is_index() {
            Ok(manifest.platform_descriptor(platform)?.digest)
        } else {
            Ok(digest)
        }
    }

    async fn load(&self, reference: &Reference, digest: &Digest) -> Result<ReferrerList> {
        let tag = fallback_tag(digest);
        let fallback = reference.with_tag(&tag)?;
        let manifest = match self.store.get_manifest(&fallback).await {
            Ok(manifest) => manifest,
            Err(e) if e.is_not_found() => Manifest::new_index(Vec::new(), BTreeMap::new())?,
            Err(e) => return Err(e),
        };

        let descriptors = manifest
            .as_indexer()
            .ok_or_else(|| {
                OciError::UnsupportedMediaType(format!(
                    "referrers tag {} holds {}",
                    tag,
                    manifest.media_type()
                ))
            })?
            .manifests()
            .to_vec();

        Ok(ReferrerList {
            subject: reference.with_digest(digest.clone()),
            descriptors,
            annotations: manifest.annotations(),
            manifest,
            tags: vec![tag],
        })
    }

    async fn save(&self, mut list: ReferrerList) -> Result<()> {
        let tag = fallback_tag(list.subject.digest.as_ref().ok_or(OciError::SubjectNotSet)?);
        let fallback = list.subject.with_tag(&tag)?;

        if list.descriptors.is_empty() {
            match self.store.delete_tag(&fallback).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) if e.is_unsupported() => {
                    debug!(tag = %tag, "Tag deletion unsupported, pushing empty referrers index");
                }
                Err(e) => return Err(e),
            }
        }

        list.manifest.set_manifests(list.descriptors)?;
        self.store.put_manifest(&fallback, &list.manifest).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mediatype;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Manifests keyed by digest plus a tag map.
    #[derive(Default)]
    struct MemoryStore {
        manifests: Mutex<HashMap<Digest, Manifest>>,
        tags: Mutex<HashMap<String, Digest>>,
        can_delete_tags: bool,
    }

    impl MemoryStore {
        fn with_tag_deletion() -> Self {
            Self {
                can_delete_tags: true,
                ..Default::default()
            }
        }

        fn lookup(&self, reference: &Reference) -> Result<Manifest> {
            let digest = match &reference.digest {
                Some(d) => d.clone(),
                None => {
                    let tag = reference.tag.clone().unwrap_or_default();
                    self.tags
                        .lock()
                        .get(&tag)
                        .cloned()
                        .ok_or_else(|| OciError::NotFound(tag))?
                }
            };
            self.manifests
                .lock()
                .get(&digest)
                .cloned()
                .ok_or_else(|| OciError::NotFound(digest.to_string()))
        }
    }

    #[async_trait]
    impl ManifestStore for MemoryStore {
        async fn get_manifest(&self, reference: &Reference) -> Result<Manifest> {
            self.lookup(reference)
        }

        async fn head_manifest(&self, reference: &Reference) -> Result<Descriptor> {
            self.lookup(reference).map(|m| m.descriptor().clone())
        }

        async fn put_manifest(&self, reference: &Reference, manifest: &Manifest) -> Result<()> {
            self.manifests
                .lock()
                .insert(manifest.digest().clone(), manifest.clone());
            if let Some(tag) = &reference.tag {
                self.tags.lock().insert(tag.clone(), manifest.digest().clone());
            }
            Ok(())
        }

        async fn delete_manifest(&self, reference: &Reference) -> Result<()> {
            let manifest = self.lookup(reference)?;
            self.manifests.lock().remove(manifest.digest());
            Ok(())
        }

        async fn delete_tag(&self, reference: &Reference) -> Result<()> {
            if !self.can_delete_tags {
                return Err(OciError::Unsupported("tag deletion".to_string()));
            }
            let tag = reference.tag.clone().unwrap_or_default();
            self.tags
                .lock()
                .remove(&tag)
                .map(|_| ())
                .ok_or_else(|| OciError::NotFound(tag))
        }
    }

    fn repo() -> Reference {
        Reference::parse("registry.example.com/app").unwrap()
    }

    fn subject_image() -> Manifest {
        let raw = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": mediatype::OCI1_MANIFEST,
            "config": Descriptor::for_bytes(mediatype::OCI1_IMAGE_CONFIG, b"{}"),
            "layers": [],
        })
        .to_string();
        Manifest::from_bytes(raw, mediatype::OCI1_MANIFEST).unwrap()
    }

    fn referrer(subject: &Manifest, artifact_type: &str, note: &str) -> Manifest {
        let raw = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": mediatype::OCI1_MANIFEST,
            "artifactType": artifact_type,
            "config": Descriptor::for_bytes(mediatype::OCI1_EMPTY, b"{}"),
            "layers": [],
            "subject": subject.descriptor(),
            "annotations": {"org.example.note": note},
        })
        .to_string();
        Manifest::from_bytes(raw, mediatype::OCI1_MANIFEST).unwrap()
    }

    #[test]
    fn test_fallback_tag() {
        let digest = Digest::sha256_of(b"subject");
        assert_eq!(fallback_tag(&digest), format!("sha256-{}", digest.hex()));

        let long: Digest = format!("sha512:{}", "a".repeat(128)).parse().unwrap();
        assert_eq!(fallback_tag(&long), format!("sha512-{}", "a".repeat(64)));

        let odd: Digest = format!("multihash+base58:{}", "b".repeat(40)).parse().unwrap();
        assert_eq!(fallback_tag(&odd), format!("multihash-base58-{}", "b".repeat(40)));

        assert_eq!(sanitize(&"x".repeat(40), MAX_ALGORITHM_LEN).len(), 32);
    }

    #[test]
    fn test_fallback_tag_independent_of_tag() {
        let digest = Digest::sha256_of(b"subject");
        let a = Reference::parse("example.com/app:v1").unwrap().add_digest(digest.clone());
        let b = Reference::parse("example.com/app:v2").unwrap().add_digest(digest);
        assert_eq!(
            fallback_tag(a.digest.as_ref().unwrap()),
            fallback_tag(b.digest.as_ref().unwrap())
        );
    }

    #[test]
    fn test_referrer_descriptor_artifact_type() {
        let subject = subject_image();
        let sig = referrer(&subject, "application/vnd.example.sig", "a");
        let desc = referrer_descriptor(&sig);
        assert_eq!(desc.artifact_type.as_deref(), Some("application/vnd.example.sig"));
        assert_eq!(desc.annotations["org.example.note"], "a");
        assert!(desc.same(sig.descriptor()));

        // Images without artifactType fall back to the config media type.
        let desc = referrer_descriptor(&subject);
        assert_eq!(desc.artifact_type.as_deref(), Some(mediatype::OCI1_IMAGE_CONFIG));
    }

    #[tokio::test]
    async fn test_list_missing_is_empty() {
        let store = MemoryStore::default();
        let subject = subject_image();
        let list = Referrers::new(&store)
            .list(&repo().with_digest(subject.digest().clone()), &ReferrerFilter::default())
            .await
            .unwrap();
        assert!(list.is_empty());
        assert!(list.manifest.is_index());
        assert_eq!(list.tags, vec![fallback_tag(subject.digest())]);
    }

    #[tokio::test]
    async fn test_add_is_idempotent() {
        let store = MemoryStore::default();
        let referrers = Referrers::new(&store);
        let subject = subject_image();
        let sig = referrer(&subject, "application/vnd.example.sig", "a");

        referrers.add(&repo(), &sig).await.unwrap();
        referrers.add(&repo(), &sig).await.unwrap();

        let list = referrers
            .list(&repo().with_digest(subject.digest().clone()), &ReferrerFilter::default())
            .await
            .unwrap();
        assert_eq!(list.descriptors.len(), 1);
        assert_eq!(list.descriptors[0].digest, *sig.digest());
    }

    #[tokio::test]
    async fn test_delete_restores_empty() {
        let store = MemoryStore::with_tag_deletion();
        let referrers = Referrers::new(&store);
        let subject = subject_image();
        let sig = referrer(&subject, "application/vnd.example.sig", "a");

        referrers.add(&repo(), &sig).await.unwrap();
        referrers.delete(&repo(), &sig).await.unwrap();

        assert!(store.tags.lock().is_empty());
        let list = referrers
            .list(&repo().with_digest(subject.digest().clone()), &ReferrerFilter::default())
            .await
            .unwrap();
        assert!(list.is_empty());

        let err = referrers.delete(&repo(), &sig).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_delete_pushes_empty_index_without_tag_deletion() {
        let store = MemoryStore::default();
        let referrers = Referrers::new(&store);
        let subject = subject_image();
        let sig = referrer(&subject, "application/vnd.example.sig", "a");

        referrers.add(&repo(), &sig).await.unwrap();
        referrers.delete(&repo(), &sig).await.unwrap();

        let tag = fallback_tag(subject.digest());
        let stored = store.lookup(&repo().with_tag(&tag).unwrap()).unwrap();
        assert!(stored.as_indexer().unwrap().manifests().is_empty());
    }

    #[tokio::test]
    async fn test_subject_required() {
        let store = MemoryStore::default();
        let referrers = Referrers::new(&store);

        let err = referrers.add(&repo(), &subject_image()).await.unwrap_err();
        assert!(matches!(err, OciError::SubjectNotSet));

        let docker = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": mediatype::DOCKER2_MANIFEST,
            "config": Descriptor::for_bytes(mediatype::DOCKER2_IMAGE_CONFIG, b"{}"),
            "layers": [],
        })
        .to_string();
        let docker = Manifest::from_bytes(docker, mediatype::DOCKER2_MANIFEST).unwrap();
        assert!(referrers.delete(&repo(), &docker).await.unwrap_err().is_unsupported());

        let mut partial = referrer(&subject_image(), "application/vnd.example.sig", "a");
        let mut subject = subject_image().descriptor().clone();
        subject.media_type.clear();
        partial.set_subject(Some(subject)).unwrap();
        assert!(matches!(
            referrers.add(&repo(), &partial).await,
            Err(OciError::SubjectNotSet)
        ));
    }

    #[tokio::test]
    async fn test_list_filters() {
        let store = MemoryStore::default();
        let referrers = Referrers::new(&store);
        let subject = subject_image();
        let sig = referrer(&subject, "application/vnd.example.sig", "a");
        let sbom = referrer(&subject, "application/vnd.example.sbom", "b");
        referrers.add(&repo(), &sig).await.unwrap();
        referrers.add(&repo(), &sbom).await.unwrap();

        let subject_ref = repo().with_digest(subject.digest().clone());
        let by_type = referrers
            .list(&subject_ref, &ReferrerFilter::artifact_type("application/vnd.example.sbom"))
            .await
            .unwrap();
        assert_eq!(by_type.descriptors.len(), 1);
        assert_eq!(by_type.descriptors[0].digest, *sbom.digest());

        let by_value = referrers
            .list(
                &subject_ref,
                &ReferrerFilter::default().with_annotation("org.example.note", "a"),
            )
            .await
            .unwrap();
        assert_eq!(by_value.descriptors.len(), 1);
        assert_eq!(by_value.descriptors[0].digest, *sig.digest());

        let by_key = referrers
            .list(
                &subject_ref,
                &ReferrerFilter::default().with_annotation("org.example.note", ""),
            )
            .await
            .unwrap();
        assert_eq!(by_key.descriptors.len(), 2);

        let missing = referrers
            .list(
                &subject_ref,
                &ReferrerFilter::default().with_annotation("org.example.other", ""),
            )
            .await
            .unwrap();
        assert!(missing.is_empty());
    }

    #[tokio::test]
    async fn test_list_resolves_tag_and_platform() {
        let store = MemoryStore::default();
        let referrers = Referrers::new(&store);
        let child = subject_image();
        let mut child_desc = child.descriptor().clone();
        child_desc.platform = Some(Platform::new("linux", "amd64"));
        let index = Manifest::new_index(vec![child_desc], BTreeMap::new()).unwrap();

        let tagged = repo().with_tag("v1").unwrap();
        store.put_manifest(&tagged, &index).await.unwrap();
        store
            .put_manifest(&repo().with_digest(child.digest().clone()), &child)
            .await
            .unwrap();
        referrers
            .add(&repo(), &referrer(&child, "application/vnd.example.sig", "a"))
            .await
            .unwrap();

        let by_tag = referrers.list(&tagged, &ReferrerFilter::default()).await.unwrap();
        assert_eq!(by_tag.subject.digest.as_ref(), Some(index.digest()));
        assert!(by_tag.is_empty());

        let by_platform = referrers
            .list(
                &tagged,
                &ReferrerFilter::default().with_platform(Platform::new("linux", "amd64")),
            )
            .await
            .unwrap();
        assert_eq!(by_platform.subject.digest.as_ref(), Some(child.digest()));
        assert_eq!(by_platform.descriptors.len(), 1);
    }
}
