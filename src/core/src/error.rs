use thiserror::Error;

/// A3S OCI store error types
#[derive(Error, Debug)]
pub enum OciError {
    /// Reference string does not match the locator grammar
    #[error("Invalid reference: {reference} - {reason}")]
    InvalidReference { reference: String, reason: String },

    /// Repository path contains uppercase characters
    #[error("Invalid reference: repository must be lowercase: {0}")]
    ReferenceNotLowercase(String),

    /// Malformed or unsupported digest
    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    /// Manifest, blob or tag is missing
    #[error("Not found: {0}")]
    NotFound(String),

    /// The manifest or store lacks a required capability
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Media type is unknown or does not match the content
    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),

    /// Referrer operation on a manifest without a populated subject
    #[error("Subject not set")]
    SubjectNotSet,

    /// Content hashed to an unexpected digest
    #[error("Digest mismatch: expected {expected}, computed {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// Content length differs from the descriptor size
    #[error("Size mismatch: expected {expected}, received {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// Malformed or structurally invalid manifest
    #[error("Manifest error: {0}")]
    ManifestError(String),

    /// Admission was cancelled before the entry became active
    #[error("Cancelled")]
    Cancelled,

    /// Admission queue misuse
    #[error("Queue error: {0}")]
    QueueError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl OciError {
    /// True for missing manifests, blobs and tags, including filesystem `NotFound`.
    pub fn is_not_found(&self) -> bool {
        match self {
            OciError::NotFound(_) => true,
            OciError::IoError(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// True when the error signals a missing capability rather than a failure.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, OciError::Unsupported(_))
    }

    /// True for digest and size mismatches.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            OciError::DigestMismatch { .. } | OciError::SizeMismatch { .. }
        )
    }
}

impl From<serde_json::Error> for OciError {
    fn from(err: serde_json::Error) -> Self {
        OciError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for OciError {
    fn from(err: serde_yaml::Error) -> Self {
        OciError::SerializationError(err.to_string())
    }
}

/// Result type alias for A3S OCI store operations
pub type Result<T> = std::result::Result<T, OciError>;
