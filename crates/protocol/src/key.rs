//! Content keys: MD5 digests that name an asset by its bytes.

use std::fmt;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use md5::{Digest, Md5};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Digest length in bytes.
pub const KEY_LEN: usize = 16;

/// Error returned when a content key cannot be parsed from text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyParseError {
    #[error("content key must be {expected} hex characters, got {got}")]
    Length { expected: usize, got: usize },

    #[error("content key is not valid hex: {0}")]
    InvalidHex(String),
}

/// Digest of an asset's full byte content.
///
/// Two assets with identical bytes always have identical keys. The key is
/// rendered as lowercase hex wherever it appears as text, including the
/// on-disk partial file name.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentKey([u8; KEY_LEN]);

impl ContentKey {
    /// Wraps an already computed digest.
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Computes the key of an in-memory asset.
    pub fn compute(data: &[u8]) -> Self {
        Self::from_digest(&Md5::digest(data))
    }

    /// Computes the key by streaming `reader` to its end.
    pub fn from_reader<R: Read>(mut reader: R) -> std::io::Result<Self> {
        let mut hasher = Md5::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Self::from_digest(&hasher.finalize()))
    }

    fn from_digest(digest: &[u8]) -> Self {
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(digest);
        Self(bytes)
    }

    /// Computes the key of a file on disk without loading it whole.
    pub fn from_file(path: &Path) -> std::io::Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(file)
    }

    /// Parses a 32 character hex key (either case).
    pub fn from_hex(text: &str) -> Result<Self, KeyParseError> {
        if text.len() != KEY_LEN * 2 {
            return Err(KeyParseError::Length {
                expected: KEY_LEN * 2,
                got: text.len(),
            });
        }
        let mut bytes = [0u8; KEY_LEN];
        hex::decode_to_slice(text, &mut bytes)
            .map_err(|e| KeyParseError::InvalidHex(e.to_string()))?;
        Ok(Self(bytes))
    }

    /// Lowercase hex rendering.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentKey({})", self.to_hex())
    }
}

impl FromStr for ContentKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for ContentKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::from_hex(&text).map_err(serde::de::Error::custom)
    }
}
