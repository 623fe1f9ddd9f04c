//! Hashing utilities.
//!
//! Hashes travel as typed strings in the form of `sha256:<64 hex chars>`,
//! both in the `X-Arrears-Chunk-Hash` header and in JSON bodies.

use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::{ArrearsError, ArrearsResult};

/// A content hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Hash {
    Sha256([u8; 32]),
}

impl Hash {
    /// Convenience function to generate a SHA-256 hash from a slice.
    pub fn sha256_from_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self::Sha256(hasher.finalize().into())
    }

    /// Parses a typed representation of a hash.
    pub fn from_typed(s: &str) -> ArrearsResult<Self> {
        let (algorithm, digest) = s.split_once(':').ok_or_else(|| ArrearsError::InvalidHash {
            hash: s.to_owned(),
            reason: "missing algorithm prefix",
        })?;

        match algorithm {
            "sha256" => {
                let mut bytes = [0u8; 32];
                hex::decode_to_slice(digest, &mut bytes).map_err(|_| ArrearsError::InvalidHash {
                    hash: s.to_owned(),
                    reason: "expected 64 hexadecimal characters",
                })?;
                Ok(Self::Sha256(bytes))
            }
            _ => Err(ArrearsError::UnsupportedHashAlgorithm(algorithm.to_owned())),
        }
    }

    /// Returns the hash in the typed base16 format.
    pub fn to_typed_base16(&self) -> String {
        match self {
            Self::Sha256(bytes) => format!("sha256:{}", hex::encode(bytes)),
        }
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_typed_base16())
    }
}

impl FromStr for Hash {
    type Err = ArrearsError;

    fn from_str(s: &str) -> ArrearsResult<Self> {
        Self::from_typed(s)
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_typed_base16())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_typed(&s).map_err(de::Error::custom)
    }
}
