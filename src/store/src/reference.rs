//! OCI reference parsing.
//!
//! Parses locators like `ghcr.io/a3s-box/code:v0.1.0` or
//! `ocidir://./layout:v1` into structured components. Registry references
//! are normalized on parse: Docker Hub aliases collapse to `docker.io`,
//! single-segment Docker Hub repositories gain the `library/` namespace and
//! references without a tag or digest get the `latest` tag.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use a3s_oci_core::error::{OciError, Result};
use regex::Regex;

use crate::digest::Digest;

/// Default registry when none is specified.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Namespace prepended to single-segment Docker Hub repositories.
pub const DEFAULT_NAMESPACE: &str = "library";

/// Default tag when none is specified.
pub const DEFAULT_TAG: &str = "latest";

/// Registry used when a layout path is projected into registry form.
pub const LAYOUT_REGISTRY: &str = "localhost";

/// Hostnames that mean Docker Hub.
const REGISTRY_ALIASES: &[&str] = &[
    "docker.io",
    "index.docker.io",
    "registry-1.docker.io",
    "registry.hub.docker.com",
];

const MAX_REPOSITORY_LEN: usize = 255;

fn scheme_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([a-z][a-z0-9+.-]*)://(.*)$").expect("scheme pattern"))
}

fn host_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?:(?:[a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9-]*[a-zA-Z0-9])(?:\.(?:[a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9-]*[a-zA-Z0-9]))*|\[[a-fA-F0-9:]+\])(?::[0-9]+)?$",
        )
        .expect("host pattern")
    })
}

fn component_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[a-z0-9]+(?:(?:\.|_|__|-+)[a-z0-9]+)*$").expect("component pattern")
    })
}

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9._-]{0,127}$").expect("tag pattern"))
}

/// Where a reference points.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Locator {
    /// A repository on a registry.
    Registry { registry: String, repository: String },
    /// An OCI layout directory on the local filesystem.
    Layout { path: String },
}

/// Parsed OCI reference.
///
/// Values are immutable by convention: the `with_*` helpers return a new
/// reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    pub locator: Locator,
    /// Tag (e.g., "latest", "v0.1.0")
    pub tag: Option<String>,
    /// Manifest digest
    pub digest: Option<Digest>,
}

impl Reference {
    /// Parse a reference string.
    ///
    /// Supports formats:
    /// - `nginx` → docker.io/library/nginx:latest
    /// - `nginx:1.25` → docker.io/library/nginx:1.25
    /// - `myuser/myimage` → docker.io/myuser/myimage:latest
    /// - `ghcr.io/org/image:tag` → ghcr.io/org/image:tag
    /// - `ghcr.io/org/image@sha256:abc...` → ghcr.io/org/image@sha256:abc...
    /// - `reg://ghcr.io/org/image` → same as without the scheme
    /// - `ocidir://path/to/layout:tag` → OCI layout at `path/to/layout`
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(invalid(reference, "empty reference"));
        }

        match split_scheme(reference)? {
            (Scheme::Registry, rest) => Self::parse_registry(reference, rest),
            (Scheme::Layout, rest) => Self::parse_layout(reference, rest),
        }
    }

    /// Parse a locator without repository, tag or digest.
    ///
    /// Accepts a registry host (`registry.example.com:5000`, `localhost`) or
    /// an `ocidir://` path. The returned registry reference has an empty
    /// repository.
    pub fn parse_host(locator: &str) -> Result<Self> {
        let locator = locator.trim();
        if locator.is_empty() {
            return Err(invalid(locator, "empty host"));
        }

        match split_scheme(locator)? {
            (Scheme::Registry, host) => {
                if !host_re().is_match(host) {
                    return Err(invalid(locator, "invalid registry host"));
                }
                Ok(Self {
                    locator: Locator::Registry {
                        registry: canonical_registry(host),
                        repository: String::new(),
                    },
                    tag: None,
                    digest: None,
                })
            }
            (Scheme::Layout, path) => {
                if path.is_empty() {
                    return Err(invalid(locator, "empty layout path"));
                }
                Ok(Self {
                    locator: Locator::Layout {
                        path: path.to_string(),
                    },
                    tag: None,
                    digest: None,
                })
            }
        }
    }

    fn parse_registry(original: &str, rest: &str) -> Result<Self> {
        let (name_tag, digest) = split_digest(original, rest)?;
        let (name, tag) = split_tag(name_tag);

        if let Some(tag) = tag {
            if !tag_re().is_match(tag) {
                return Err(invalid(original, "invalid tag"));
            }
        }

        let (registry, repository) = split_registry_repository(original, name)?;

        // Apply default tag if no tag and no digest
        let tag = match (tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            (tag, _) => tag.map(str::to_string),
        };

        Ok(Self {
            locator: Locator::Registry {
                registry,
                repository,
            },
            tag,
            digest,
        })
    }

    fn parse_layout(original: &str, rest: &str) -> Result<Self> {
        let (path_tag, digest) = split_digest(original, rest)?;
        let (path, tag) = match split_tag(path_tag) {
            (path, Some(tag)) if tag_re().is_match(tag) => (path, Some(tag)),
            _ => (path_tag, None),
        };

        if path.is_empty() {
            return Err(invalid(original, "empty layout path"));
        }

        let tag = match (tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            (tag, _) => tag.map(str::to_string),
        };

        Ok(Self {
            locator: Locator::Layout {
                path: path.to_string(),
            },
            tag,
            digest,
        })
    }

    /// Registry reference from parts, validating the repository.
    pub fn registry(registry: &str, repository: &str) -> Result<Self> {
        Self::parse(&format!("{}/{}", registry, repository))
    }

    /// Layout reference for a directory.
    pub fn layout(path: impl Into<String>) -> Self {
        Self {
            locator: Locator::Layout { path: path.into() },
            tag: Some(DEFAULT_TAG.to_string()),
            digest: None,
        }
    }

    /// Canonical string form; parsing it yields an equal reference.
    pub fn common_name(&self) -> String {
        let mut s = match &self.locator {
            Locator::Registry {
                registry,
                repository,
            } => {
                if repository.is_empty() {
                    registry.clone()
                } else {
                    format!("{}/{}", registry, repository)
                }
            }
            Locator::Layout { path } => format!("ocidir://{}", path),
        };
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(&digest.to_string());
        }
        s
    }

    pub fn is_layout(&self) -> bool {
        matches!(self.locator, Locator::Layout { .. })
    }

    /// Registry hostname, `None` for layouts.
    pub fn registry_host(&self) -> Option<&str> {
        match &self.locator {
            Locator::Registry { registry, .. } => Some(registry),
            Locator::Layout { .. } => None,
        }
    }

    /// Repository path, `None` for layouts.
    pub fn repository(&self) -> Option<&str> {
        match &self.locator {
            Locator::Registry { repository, .. } => Some(repository),
            Locator::Layout { .. } => None,
        }
    }

    /// Layout directory, `None` for registry references.
    pub fn path(&self) -> Option<&str> {
        match &self.locator {
            Locator::Layout { path } => Some(path),
            Locator::Registry { .. } => None,
        }
    }

    /// Same reference pointing at `tag`; clears the digest.
    pub fn with_tag(&self, tag: &str) -> Result<Self> {
        if !tag_re().is_match(tag) {
            return Err(invalid(tag, "invalid tag"));
        }
        Ok(Self {
            locator: self.locator.clone(),
            tag: Some(tag.to_string()),
            digest: None,
        })
    }

    /// Same reference pointing at `digest`; clears the tag.
    pub fn with_digest(&self, digest: Digest) -> Self {
        Self {
            locator: self.locator.clone(),
            tag: None,
            digest: Some(digest),
        }
    }

    /// Same reference with `digest` added; the tag is kept.
    pub fn add_digest(&self, digest: Digest) -> Self {
        Self {
            locator: self.locator.clone(),
            tag: self.tag.clone(),
            digest: Some(digest),
        }
    }

    /// Same repository or layout with neither tag nor digest.
    pub fn base(&self) -> Self {
        Self {
            locator: self.locator.clone(),
            tag: None,
            digest: None,
        }
    }

    /// Both point at the same registry host, or the same layout directory.
    pub fn equal_registry(&self, other: &Reference) -> bool {
        match (&self.locator, &other.locator) {
            (Locator::Registry { registry: a, .. }, Locator::Registry { registry: b, .. }) => a == b,
            (Locator::Layout { path: a }, Locator::Layout { path: b }) => a == b,
            _ => false,
        }
    }

    /// Both point at the same repository, or the same layout directory.
    pub fn equal_repository(&self, other: &Reference) -> bool {
        match (&self.locator, &other.locator) {
            (Locator::Registry { .. }, Locator::Registry { .. }) => {
                self.equal_registry(other) && self.repository() == other.repository()
            }
            (Locator::Layout { path: a }, Locator::Layout { path: b }) => a == b,
            _ => false,
        }
    }

    /// Project into registry form.
    ///
    /// Layout paths become a repository under [`LAYOUT_REGISTRY`]: lowercased,
    /// with characters outside the repository grammar replaced by `-` and
    /// empty or relative components dropped.
    pub fn to_registry(&self) -> Self {
        match &self.locator {
            Locator::Registry { .. } => self.clone(),
            Locator::Layout { path } => Self {
                locator: Locator::Registry {
                    registry: LAYOUT_REGISTRY.to_string(),
                    repository: sanitize_repository(path),
                },
                tag: self.tag.clone(),
                digest: self.digest.clone(),
            },
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.common_name())
    }
}

impl FromStr for Reference {
    type Err = OciError;

    fn from_str(s: &str) -> Result<Self> {
        Reference::parse(s)
    }
}

enum Scheme {
    Registry,
    Layout,
}

fn invalid(reference: &str, reason: &str) -> OciError {
    OciError::InvalidReference {
        reference: reference.to_string(),
        reason: reason.to_string(),
    }
}

fn split_scheme(s: &str) -> Result<(Scheme, &str)> {
    let Some(caps) = scheme_re().captures(s) else {
        return Ok((Scheme::Registry, s));
    };
    let rest = caps.get(2).map(|m| m.as_str()).unwrap_or("");
    match &caps[1] {
        "reg" => Ok((Scheme::Registry, rest)),
        "ocidir" => Ok((Scheme::Layout, rest)),
        other => Err(invalid(s, &format!("unsupported scheme '{}'", other))),
    }
}

/// Split off `@digest`.
fn split_digest<'a>(original: &str, s: &'a str) -> Result<(&'a str, Option<Digest>)> {
    match s.rfind('@') {
        Some(at_pos) => {
            let digest = Digest::parse(&s[at_pos + 1..])
                .map_err(|e| invalid(original, &e.to_string()))?;
            Ok((&s[..at_pos], Some(digest)))
        }
        None => Ok((s, None)),
    }
}

/// Split `:tag`, but only after the last `/`.
fn split_tag(s: &str) -> (&str, Option<&str>) {
    let last_segment_start = s.rfind('/').map(|p| p + 1).unwrap_or(0);
    match s[last_segment_start..].rfind(':') {
        Some(colon_pos) => {
            let colon_pos = last_segment_start + colon_pos;
            (&s[..colon_pos], Some(&s[colon_pos + 1..]))
        }
        None => (s, None),
    }
}

/// Split a name into registry and repository components.
fn split_registry_repository(original: &str, name: &str) -> Result<(String, String)> {
    // The first component is a registry when it looks like a hostname:
    // contains a dot or colon, or is exactly "localhost".
    let (registry, repository) = match name.split_once('/') {
        Some((first, rest)) if first.contains('.') || first.contains(':') || first == "localhost" => {
            if !host_re().is_match(first) {
                return Err(invalid(original, "invalid registry host"));
            }
            (canonical_registry(first), rest.to_string())
        }
        // A lone "localhost" names a registry; use `parse_host` for those.
        None if name == "localhost" => {
            return Err(invalid(original, "localhost is a registry host, repository is missing"))
        }
        _ => (DEFAULT_REGISTRY.to_string(), name.to_string()),
    };

    if repository.is_empty() {
        return Err(invalid(original, "empty repository"));
    }

    validate_repository(original, &repository)?;

    let repository = if registry == DEFAULT_REGISTRY && !repository.contains('/') {
        format!("{}/{}", DEFAULT_NAMESPACE, repository)
    } else {
        repository
    };

    Ok((registry, repository))
}

fn canonical_registry(host: &str) -> String {
    if REGISTRY_ALIASES.contains(&host) {
        DEFAULT_REGISTRY.to_string()
    } else {
        host.to_string()
    }
}

fn validate_repository(original: &str, repository: &str) -> Result<()> {
    if repository.len() > MAX_REPOSITORY_LEN {
        return Err(invalid(original, "repository name too long"));
    }
    for component in repository.split('/') {
        if component.is_empty() {
            return Err(invalid(original, "empty path component"));
        }
        if !component_re().is_match(component) {
            if component_re().is_match(&component.to_lowercase()) {
                return Err(OciError::ReferenceNotLowercase(original.to_string()));
            }
            return Err(invalid(
                original,
                &format!("invalid path component '{}'", component),
            ));
        }
    }
    Ok(())
}

fn sanitize_repository(path: &str) -> String {
    let components: Vec<String> = path
        .split(['/', '\\'])
        .filter(|c| !c.is_empty() && *c != "." && *c != "..")
        .map(|c| {
            let replaced: String = c
                .to_lowercase()
                .chars()
                .map(|ch| if ch.is_ascii_lowercase() || ch.is_ascii_digit() { ch } else { '-' })
                .collect();
            collapse_separators(&replaced)
        })
        .filter(|c| !c.is_empty())
        .collect();

    if components.is_empty() {
        "layout".to_string()
    } else {
        components.join("/")
    }
}

/// Turn a run of `-` into a valid component: no leading or trailing separators.
fn collapse_separators(s: &str) -> String {
    s.trim_matches('-').to_string()
}
