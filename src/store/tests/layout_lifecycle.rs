//! Integration test: image lifecycle in an OCI layout.
//!
//! Exercises the public API end to end against temporary directories:
//!
//! 1. Push an image and a signature that names it as subject
//! 2. Query referrers through the fallback tag
//! 3. Copy the image, with referrers, into a second layout
//! 4. Untag an image and let `close` garbage collect the layout

use std::collections::BTreeMap;

use a3s_oci_core::StoreConfig;
use a3s_oci_store::transport::{bytes_reader, read_blob};
use a3s_oci_store::{
    copy_image, fallback_tag, mediatype, BlobStore, CopyOptions, Descriptor, LayoutStore,
    Manifest, ManifestStore, Platform, Reference, ReferrerFilter, Referrers,
};
use tempfile::TempDir;

const SIGNATURE_TYPE: &str = "application/vnd.example.signature.v1+json";

async fn push_blob(store: &LayoutStore, r: &Reference, media_type: &str, bytes: &[u8]) -> Descriptor {
    let desc = Descriptor::for_bytes(media_type, bytes);
    store
        .put_blob(r, &desc, bytes_reader(bytes.to_vec()))
        .await
        .unwrap()
}

/// Push a single-layer image tagged `tag`.
async fn push_image(store: &LayoutStore, r: &Reference, tag: &str, layer: &[u8]) -> Manifest {
    let config = push_blob(store, r, mediatype::OCI1_IMAGE_CONFIG, b"{\"os\":\"linux\"}").await;
    let layer = push_blob(store, r, mediatype::OCI1_LAYER_GZIP, layer).await;
    let raw = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": mediatype::OCI1_MANIFEST,
        "config": config,
        "layers": [layer],
    })
    .to_string();
    let manifest = Manifest::from_bytes(raw, mediatype::OCI1_MANIFEST).unwrap();
    store
        .put_manifest(&r.with_tag(tag).unwrap(), &manifest)
        .await
        .unwrap();
    manifest
}

/// Push a signature artifact whose subject is `subject`.
async fn push_signature(store: &LayoutStore, r: &Reference, subject: &Manifest) -> Manifest {
    let config = push_blob(store, r, mediatype::OCI1_EMPTY, b"{}").await;
    let payload = push_blob(store, r, SIGNATURE_TYPE, subject.digest().to_string().as_bytes()).await;
    let raw = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": mediatype::OCI1_MANIFEST,
        "artifactType": SIGNATURE_TYPE,
        "config": config,
        "layers": [payload],
        "subject": subject.descriptor(),
        "annotations": { "org.example.signer": "ci" },
    })
    .to_string();
    let signature = Manifest::from_bytes(raw, mediatype::OCI1_MANIFEST).unwrap();
    store
        .put_manifest(&r.with_digest(signature.digest().clone()), &signature)
        .await
        .unwrap();
    signature
}

#[tokio::test]
async fn test_referrers_follow_manifest_lifecycle() {
    let tmp = TempDir::new().unwrap();
    let store = LayoutStore::default();
    let r = Reference::layout(tmp.path().join("app").to_string_lossy().into_owned());

    let image = push_image(&store, &r, "v1", b"app layer").await;
    let signature = push_signature(&store, &r, &image).await;

    let tags = store.tag_list(&r).await.unwrap();
    assert_eq!(tags.len(), 2);
    assert!(tags.contains(&"v1".to_string()));
    assert!(tags.contains(&fallback_tag(image.digest())));

    // Tags resolve to the subject digest.
    let referrers = Referrers::new(&store);
    let list = referrers
        .list(&r.with_tag("v1").unwrap(), &ReferrerFilter::default())
        .await
        .unwrap();
    assert_eq!(list.subject.digest.as_ref(), Some(image.digest()));
    assert_eq!(list.descriptors.len(), 1);
    let found = &list.descriptors[0];
    assert_eq!(found.digest, *signature.digest());
    assert_eq!(found.artifact_type.as_deref(), Some(SIGNATURE_TYPE));
    assert_eq!(found.annotations.get("org.example.signer").map(String::as_str), Some("ci"));

    let by_signer = ReferrerFilter::artifact_type(SIGNATURE_TYPE).with_annotation("org.example.signer", "");
    let list = referrers
        .list(&r.with_digest(image.digest().clone()), &by_signer)
        .await
        .unwrap();
    assert_eq!(list.descriptors.len(), 1);

    let other = ReferrerFilter::artifact_type("application/vnd.example.sbom");
    let list = referrers
        .list(&r.with_digest(image.digest().clone()), &other)
        .await
        .unwrap();
    assert!(list.is_empty());

    // Deleting the referrer drops the fallback tag with it.
    store
        .delete_manifest(&r.with_digest(signature.digest().clone()))
        .await
        .unwrap();
    let list = referrers
        .list(&r.with_digest(image.digest().clone()), &ReferrerFilter::default())
        .await
        .unwrap();
    assert!(list.is_empty());
    assert_eq!(store.tag_list(&r).await.unwrap(), vec!["v1".to_string()]);
}

#[tokio::test]
async fn test_close_collects_untagged_content() {
    let tmp = TempDir::new().unwrap();
    let store = LayoutStore::default();
    let r = Reference::layout(tmp.path().join("app").to_string_lossy().into_owned());

    let keep = push_image(&store, &r, "keep", b"kept layer").await;
    let dropped = push_image(&store, &r, "drop", b"dropped layer").await;
    let dropped_layer = dropped.as_imager().unwrap().layers()[0].clone();
    let kept_layer = keep.as_imager().unwrap().layers()[0].clone();

    {
        let _hold = store.hold(&r).await.unwrap();
        store.delete_tag(&r.with_tag("drop").unwrap()).await.unwrap();
        // Held paths are never collected.
        assert!(store.close(&r).await.unwrap().is_none());
    }

    let summary = store.close(&r).await.unwrap().unwrap();
    // The dropped manifest and its layer; the config is shared.
    assert_eq!(summary.removed, 2);
    assert!(!store.is_modified(&r));
    assert!(store.close(&r).await.unwrap().is_none());

    let err = store.head_blob(&r, &dropped_layer).await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(read_blob(&store, &r, &kept_layer).await.unwrap(), b"kept layer");
    assert!(store.get_manifest(&r.with_tag("drop").unwrap()).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_copy_layout_to_layout_with_referrers() {
    let tmp = TempDir::new().unwrap();
    let config = StoreConfig::from_yaml_str("transfer:\n  max_concurrent: 1\n  order: fifo\n").unwrap();
    let src_store = LayoutStore::new(config.clone());
    let dst_store = LayoutStore::new(config);
    let src = Reference::layout(tmp.path().join("src").to_string_lossy().into_owned());
    let dst = Reference::layout(tmp.path().join("dst").to_string_lossy().into_owned());

    let amd64 = push_image(&src_store, &src, "amd64", b"amd64 layer").await;
    let arm64 = push_image(&src_store, &src, "arm64", b"arm64 layer").await;
    let mut amd64_desc = amd64.descriptor().clone();
    amd64_desc.platform = Some(Platform::new("linux", "amd64"));
    let mut arm64_desc = arm64.descriptor().clone();
    arm64_desc.platform = Some(Platform::new("linux", "arm64"));
    let index = Manifest::new_index(vec![amd64_desc, arm64_desc], BTreeMap::new()).unwrap();
    src_store
        .put_manifest(&src.with_tag("multi").unwrap(), &index)
        .await
        .unwrap();
    let signature = push_signature(&src_store, &src, &index).await;

    let opts = CopyOptions {
        referrers: true,
        ..Default::default()
    };
    let summary = copy_image(
        &src_store,
        &src.with_tag("multi").unwrap(),
        &dst_store,
        &dst.with_tag("latest").unwrap(),
        &opts,
    )
    .await
    .unwrap();
    // Two images, the index and the signature.
    assert_eq!(summary.manifests, 4);
    assert_eq!(dst_store.admission().map(|q| q.status().active), Some(0));

    let copied = dst_store.get_manifest(&dst.with_tag("latest").unwrap()).await.unwrap();
    assert_eq!(copied.raw(), index.raw());
    let child = copied
        .platform_descriptor(&Platform::new("linux", "arm64"))
        .unwrap();
    assert_eq!(child.digest, *arm64.digest());
    let layer = arm64.as_imager().unwrap().layers()[0].clone();
    assert_eq!(read_blob(&dst_store, &dst, &layer).await.unwrap(), b"arm64 layer");

    let list = Referrers::new(&dst_store)
        .list(&dst.with_tag("latest").unwrap(), &ReferrerFilter::default())
        .await
        .unwrap();
    assert_eq!(list.descriptors.len(), 1);
    assert_eq!(list.descriptors[0].digest, *signature.digest());

    let mut tags = dst_store.tag_list(&dst).await.unwrap();
    tags.retain(|t| t != &fallback_tag(index.digest()));
    assert_eq!(tags, vec!["latest".to_string()]);
}
