//! Media type constants and the Docker/OCI compatibility table.

/// Legacy schema 1 manifest, unsigned.
pub const DOCKER1_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v1+json";
/// Legacy schema 1 manifest with a JWS signature.
pub const DOCKER1_MANIFEST_SIGNED: &str = "application/vnd.docker.distribution.manifest.v1+prettyjws";
/// Docker schema 2 image manifest.
pub const DOCKER2_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
/// Docker schema 2 manifest list.
pub const DOCKER2_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
/// Docker image config.
pub const DOCKER2_IMAGE_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
/// Docker gzip layer.
pub const DOCKER2_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
/// Docker foreign (non-distributable) gzip layer.
pub const DOCKER2_FOREIGN_LAYER: &str = "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip";

/// OCI image manifest.
pub const OCI1_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
/// OCI image index.
pub const OCI1_INDEX: &str = "application/vnd.oci.image.index.v1+json";
/// OCI artifact manifest.
pub const OCI1_ARTIFACT: &str = "application/vnd.oci.artifact.manifest.v1+json";
/// OCI image config.
pub const OCI1_IMAGE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
/// OCI empty JSON descriptor target (`{}`).
pub const OCI1_EMPTY: &str = "application/vnd.oci.empty.v1+json";
/// OCI uncompressed layer.
pub const OCI1_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";
/// OCI gzip layer.
pub const OCI1_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
/// OCI zstd layer.
pub const OCI1_LAYER_ZSTD: &str = "application/vnd.oci.image.layer.v1.tar+zstd";
/// OCI non-distributable gzip layer.
pub const OCI1_FOREIGN_LAYER_GZIP: &str =
    "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip";

/// Docker media types and their OCI equivalents.
const EQUIVALENTS: &[(&str, &str)] = &[
    (DOCKER2_MANIFEST, OCI1_MANIFEST),
    (DOCKER2_MANIFEST_LIST, OCI1_INDEX),
    (DOCKER2_IMAGE_CONFIG, OCI1_IMAGE_CONFIG),
    (DOCKER2_LAYER_GZIP, OCI1_LAYER_GZIP),
    (DOCKER2_FOREIGN_LAYER, OCI1_FOREIGN_LAYER_GZIP),
    (DOCKER1_MANIFEST_SIGNED, DOCKER1_MANIFEST),
];

/// Strip parameters and whitespace, e.g. `type; charset=utf-8` → `type`.
pub fn base(media_type: &str) -> &str {
    media_type.split(';').next().unwrap_or("").trim()
}

/// Canonical form used for compatibility comparisons.
pub fn normalize(media_type: &str) -> &str {
    let media_type = base(media_type);
    EQUIVALENTS
        .iter()
        .find(|(docker, _)| *docker == media_type)
        .map(|(_, oci)| *oci)
        .unwrap_or(media_type)
}

/// Whether two media types describe the same kind of content.
pub fn compatible(a: &str, b: &str) -> bool {
    normalize(a) == normalize(b)
}

/// Manifest media types this crate decodes.
pub fn is_manifest(media_type: &str) -> bool {
    matches!(
        base(media_type),
        DOCKER1_MANIFEST
            | DOCKER1_MANIFEST_SIGNED
            | DOCKER2_MANIFEST
            | DOCKER2_MANIFEST_LIST
            | OCI1_MANIFEST
            | OCI1_INDEX
            | OCI1_ARTIFACT
    )
}

/// Manifest media types that list child manifests.
pub fn is_index(media_type: &str) -> bool {
    matches!(base(media_type), DOCKER2_MANIFEST_LIST | OCI1_INDEX)
}
