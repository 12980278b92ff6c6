use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::key::ContentKey;

/// Descriptor of one asset being transferred.
///
/// Sent to the receiver before the first chunk. `size` is the exact byte
/// length of the asset and the only thing completion is judged against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetHeader {
    pub id: ContentKey,
    pub name: String,
    pub size: u64,
}

impl AssetHeader {
    pub fn new(id: ContentKey, name: impl Into<String>, size: u64) -> Self {
        Self {
            id,
            name: name.into(),
            size,
        }
    }

    /// Builds a header for an in-memory asset.
    pub fn for_bytes(name: impl Into<String>, data: &[u8]) -> Self {
        Self::new(ContentKey::compute(data), name, data.len() as u64)
    }

    /// Builds a header for a file on disk.
    ///
    /// The display name is the file stem; the key is computed by streaming
    /// the file.
    pub fn for_file(path: &Path) -> std::io::Result<Self> {
        let size = std::fs::metadata(path)?.len();
        let id = ContentKey::from_file(path)?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self::new(id, name, size))
    }

    /// Returns `true` for a zero-byte asset, which needs no chunks.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}
