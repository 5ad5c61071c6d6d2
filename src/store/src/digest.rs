//! Content digests (`algorithm:hex`).

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use a3s_oci_core::error::{OciError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256, Sha512};

/// Canonical digest algorithm.
pub const SHA256: &str = "sha256";

/// Longer digest algorithm accepted by the OCI image spec.
pub const SHA512: &str = "sha512";

fn digest_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([a-z0-9]+(?:[.+_-][a-z0-9]+)*):([a-fA-F0-9]{32,})$")
            .expect("digest pattern is valid")
    })
}

/// A validated content digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    algorithm: String,
    hex: String,
}

impl Digest {
    /// Parse `algorithm:hex`.
    ///
    /// Any algorithm matching the grammar is accepted with at least 32 hex
    /// characters; `sha256` and `sha512` must have their exact lengths.
    pub fn parse(s: &str) -> Result<Self> {
        let caps = digest_regex()
            .captures(s)
            .ok_or_else(|| OciError::InvalidDigest(s.to_string()))?;
        let algorithm = caps[1].to_string();
        let hex = caps[2].to_string();

        let expected = match algorithm.as_str() {
            SHA256 => Some(64),
            SHA512 => Some(128),
            _ => None,
        };
        if let Some(len) = expected {
            if hex.len() != len {
                return Err(OciError::InvalidDigest(format!(
                    "{}: {} requires {} hex characters",
                    s, algorithm, len
                )));
            }
            if hex.bytes().any(|b| b.is_ascii_uppercase()) {
                return Err(OciError::InvalidDigest(format!(
                    "{}: hex must be lowercase",
                    s
                )));
            }
        }

        Ok(Self { algorithm, hex })
    }

    /// SHA-256 digest of `data`.
    pub fn sha256_of(data: &[u8]) -> Self {
        Self {
            algorithm: SHA256.to_string(),
            hex: hex::encode(Sha256::digest(data)),
        }
    }

    /// Digest of `data` with a named algorithm.
    pub fn compute(algorithm: &str, data: &[u8]) -> Result<Self> {
        let mut digester = Digester::new(algorithm)?;
        digester.update(data);
        Ok(digester.finish())
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Whether this store can compute digests with this algorithm.
    pub fn is_computable(&self) -> bool {
        matches!(self.algorithm.as_str(), SHA256 | SHA512)
    }

    /// Fail unless `data` hashes to this digest.
    pub fn verify(&self, data: &[u8]) -> Result<()> {
        let actual = Digest::compute(&self.algorithm, data)?;
        if actual != *self {
            return Err(OciError::DigestMismatch {
                expected: self.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl FromStr for Digest {
    type Err = OciError;

    fn from_str(s: &str) -> Result<Self> {
        Digest::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = OciError;

    fn try_from(s: String) -> Result<Self> {
        Digest::parse(&s)
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> Self {
        d.to_string()
    }
}

enum Hasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

/// Incremental digest computation with a byte count.
pub struct Digester {
    hasher: Hasher,
    size: u64,
}

impl Digester {
    pub fn new(algorithm: &str) -> Result<Self> {
        let hasher = match algorithm {
            SHA256 => Hasher::Sha256(Sha256::new()),
            SHA512 => Hasher::Sha512(Sha512::new()),
            other => {
                return Err(OciError::InvalidDigest(format!(
                    "unsupported digest algorithm: {}",
                    other
                )))
            }
        };
        Ok(Self { hasher, size: 0 })
    }

    pub fn update(&mut self, data: &[u8]) {
        self.size += data.len() as u64;
        match &mut self.hasher {
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    /// Bytes consumed so far.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn finish(self) -> Digest {
        match self.hasher {
            Hasher::Sha256(h) => Digest {
                algorithm: SHA256.to_string(),
                hex: hex::encode(h.finalize()),
            },
            Hasher::Sha512(h) => Digest {
                algorithm: SHA512.to_string(),
                hex: hex::encode(h.finalize()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_SHA256: &str =
        "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_sha256_of_empty() {
        assert_eq!(Digest::sha256_of(b"").to_string(), EMPTY_SHA256);
    }

    #[test]
    fn test_parse_sha256() {
        let d = Digest::parse(EMPTY_SHA256).unwrap();
        assert_eq!(d.algorithm(), "sha256");
        assert_eq!(d.hex().len(), 64);
        assert!(d.is_computable());
    }

    #[test]
    fn test_parse_rejects_short_sha256() {
        assert!(matches!(
            Digest::parse("sha256:abcdef1234567890abcdef1234567890"),
            Err(OciError::InvalidDigest(_))
        ));
    }

    #[test]
    fn test_parse_rejects_uppercase_sha256() {
        let upper = EMPTY_SHA256.to_uppercase().replace("SHA256", "sha256");
        assert!(Digest::parse(&upper).is_err());
    }

    #[test]
    fn test_parse_other_algorithm() {
        let d = Digest::parse("blake3:0123456789abcdef0123456789abcdef").unwrap();
        assert_eq!(d.algorithm(), "blake3");
        assert!(!d.is_computable());
        assert!(Digest::parse("blake3:0123").is_err());
    }

    #[test]
    fn test_parse_malformed() {
        for s in ["", "sha256", "sha256:", ":abc", "sha256:xyz", "SHA256:00"] {
            assert!(Digest::parse(s).is_err(), "{} should fail", s);
        }
    }

    #[test]
    fn test_verify() {
        let d = Digest::sha256_of(b"hello");
        assert!(d.verify(b"hello").is_ok());
        let err = d.verify(b"world").unwrap_err();
        assert!(err.is_integrity());
    }

    #[test]
    fn test_digester_matches_one_shot() {
        let mut digester = Digester::new(SHA512).unwrap();
        digester.update(b"hel");
        digester.update(b"lo");
        assert_eq!(digester.size(), 5);
        assert_eq!(
            digester.finish(),
            Digest::compute(SHA512, b"hello").unwrap()
        );
    }

    #[test]
    fn test_digester_unknown_algorithm() {
        assert!(Digester::new("md5").is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let d = Digest::sha256_of(b"x");
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, format!("\"{}\"", d));
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
        assert!(serde_json::from_str::<Digest>("\"nope\"").is_err());
    }
}
