//! Part checksums.
//!
//! A part artifact is identified by the SHA-256 digest of the packed
//! stream. The digest is computed while the stream is produced (see
//! [`crate::stream::StreamHasher`]), so it is known the moment the
//! upload completes.

#[cfg(test)]
mod tests;

use displaydoc::Display;
use serde::{de, ser, Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ChBackupResult;

/// A checksum of a packed part artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Checksum {
    /// An SHA-256 digest.
    Sha256([u8; 32]),
}

/// A checksum error.
#[derive(Debug, Display)]
pub enum Error {
    /// Invalid hexadecimal checksum: {0}
    InvalidHex(hex::FromHexError),

    /// Invalid checksum length: expected {expected} bytes, got {actual}.
    InvalidLength { expected: usize, actual: usize },
}

impl Checksum {
    /// Convenience function to digest a byte slice in one go.
    pub fn sha256_from_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self::Sha256(hasher.finalize().into())
    }

    /// Parses the hexadecimal representation.
    pub fn from_hex(s: &str) -> ChBackupResult<Self> {
        let v = hex::decode(s).map_err(Error::InvalidHex)?;
        let v: [u8; 32] = v.try_into().map_err(|v: Vec<u8>| Error::InvalidLength {
            expected: 32,
            actual: v.len(),
        })?;

        Ok(Self::Sha256(v))
    }

    /// Returns the hexadecimal representation.
    ///
    /// This is the canonical form used in backup documents.
    pub fn to_hex(&self) -> String {
        hex::encode(self.data())
    }

    fn data(&self) -> &[u8] {
        match self {
            Self::Sha256(d) => d,
        }
    }
}

impl From<[u8; 32]> for Checksum {
    fn from(digest: [u8; 32]) -> Self {
        Self::Sha256(digest)
    }
}

impl<'de> Deserialize<'de> for Checksum {
    /// Deserializes a hexadecimal checksum string.
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        use de::Error;

        String::deserialize(deserializer)
            .and_then(|s| Self::from_hex(&s).map_err(|e| Error::custom(e.to_string())))
    }
}

impl Serialize for Checksum {
    /// Serializes a checksum into a hexadecimal string.
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: ser::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}
