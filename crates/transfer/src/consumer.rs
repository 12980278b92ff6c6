use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use assetlink_protocol::{AssetHeader, ContentKey};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::progress::ProgressHandle;
use crate::{PART_EXTENSION, TransferError};

/// What a consumer does with bytes beyond the size its header declared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OvershootPolicy {
    /// Write them and report the transfer complete.
    #[default]
    Tolerate,
    /// Refuse the chunk with [`TransferError::ProtocolViolation`].
    Reject,
}

/// Where a consumer is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Receiving,
    Complete,
}

/// Path of the partial file for `id` under `dir`: `<dir>/<key-hex>.part`.
pub fn part_file_path(dir: &Path, id: &ContentKey) -> PathBuf {
    dir.join(format!("{id}.{PART_EXTENSION}"))
}

/// Reassembles one asset from chunks delivered in production order.
///
/// Each chunk is appended to `<dir>/<key>.part` with its own
/// open/append/close, so no file handle outlives a call and dropping the
/// consumer mid-transfer leaks nothing. Whatever partial file is left behind
/// is removed the next time a consumer is created for the same key and
/// directory.
pub struct AssetConsumer {
    header: AssetHeader,
    part_path: PathBuf,
    bytes_written: u64,
    policy: OvershootPolicy,
    progress: ProgressHandle,
    failed: bool,
}

impl AssetConsumer {
    /// Prepares `dir` to receive the asset described by `header`.
    ///
    /// Creates the directory if needed and deletes any stale partial file
    /// for the same key. An empty `dir` means the current directory.
    pub fn new(dir: impl AsRef<Path>, header: AssetHeader) -> Result<Self, TransferError> {
        Self::with_policy(dir, header, OvershootPolicy::default())
    }

    pub fn with_policy(
        dir: impl AsRef<Path>,
        header: AssetHeader,
        policy: OvershootPolicy,
    ) -> Result<Self, TransferError> {
        let part_path = prepare_part_file(dir.as_ref(), &header)?;
        debug!(
            key = %header.id,
            name = %header.name,
            size = header.size,
            path = %part_path.display(),
            "asset consumer ready"
        );

        let progress = ProgressHandle::new(&header);
        Ok(Self {
            header,
            part_path,
            bytes_written: 0,
            policy,
            progress,
            failed: false,
        })
    }

    /// Appends the next chunk payload to the partial file.
    ///
    /// On failure the byte count is left as it was and the consumer refuses
    /// any further chunks; the caller should treat the transfer as failed.
    pub fn accept(&mut self, data: &[u8]) -> Result<(), TransferError> {
        if self.failed {
            return Err(TransferError::InvalidArgument(format!(
                "consumer for asset {} is unusable after a failed write",
                self.header.id
            )));
        }

        let len = data.len() as u64;
        let after = self.bytes_written + len;
        if self.policy == OvershootPolicy::Reject && after > self.header.size {
            return Err(TransferError::ProtocolViolation(format!(
                "asset {} declared {} bytes, chunk would bring it to {after}",
                self.header.id, self.header.size
            )));
        }

        let was_complete = self.is_complete();
        if let Err(source) = append(&self.part_path, data) {
            warn!(
                key = %self.header.id,
                path = %self.part_path.display(),
                error = %source,
                "failed to append chunk"
            );
            self.failed = true;
            self.progress.mark_failed();
            return Err(TransferError::Write {
                path: self.part_path.clone(),
                source,
            });
        }

        self.bytes_written = after;
        self.progress.set_transferred(after);

        if after > self.header.size {
            warn!(
                key = %self.header.id,
                declared = self.header.size,
                written = after,
                "asset overshot its declared size"
            );
        }
        if !was_complete && self.is_complete() {
            info!(key = %self.header.id, name = %self.header.name, bytes = after, "asset received");
        }
        Ok(())
    }

    /// `true` once at least `header.size` bytes have been written.
    pub fn is_complete(&self) -> bool {
        self.bytes_written >= self.header.size
    }

    pub fn state(&self) -> ConsumerState {
        if self.is_complete() {
            ConsumerState::Complete
        } else {
            ConsumerState::Receiving
        }
    }

    /// Fraction received; `1.0` for an empty asset.
    pub fn percent_complete(&self) -> f64 {
        if self.header.size == 0 {
            return 1.0;
        }
        self.bytes_written as f64 / self.header.size as f64
    }

    /// Recomputes the key of the partial file and compares it with the
    /// header's.
    pub fn verify(&self) -> Result<(), TransferError> {
        let actual = ContentKey::from_file(&self.part_path)?;
        if actual != self.header.id {
            return Err(TransferError::ChecksumMismatch {
                expected: self.header.id,
                actual,
            });
        }
        Ok(())
    }

    pub fn id(&self) -> ContentKey {
        self.header.id
    }

    pub fn name(&self) -> &str {
        &self.header.name
    }

    pub fn size(&self) -> u64 {
        self.header.size
    }

    pub fn header(&self) -> &AssetHeader {
        &self.header
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn has_failed(&self) -> bool {
        self.failed
    }

    /// Location of the partial file; once complete, hand it to the asset
    /// store.
    pub fn resolved_path(&self) -> &Path {
        &self.part_path
    }

    /// Handle for observing progress from other threads.
    pub fn progress(&self) -> ProgressHandle {
        self.progress.clone()
    }
}

/// Resolves, creates and cleans the partial file location for `header`.
///
/// A zero-size asset gets an empty file right away, since no chunk will
/// ever create it.
pub(crate) fn prepare_part_file(
    dir: &Path,
    header: &AssetHeader,
) -> Result<PathBuf, TransferError> {
    let dir = if dir.as_os_str().is_empty() {
        Path::new(".")
    } else {
        dir
    };
    let dir = std::path::absolute(dir).map_err(|e| {
        TransferError::InvalidArgument(format!("bad destination {}: {e}", dir.display()))
    })?;

    std::fs::create_dir_all(&dir).map_err(|source| TransferError::Write {
        path: dir.clone(),
        source,
    })?;

    let part_path = part_file_path(&dir, &header.id);
    match std::fs::remove_file(&part_path) {
        Ok(()) => debug!(path = %part_path.display(), "removed stale partial file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(source) => {
            return Err(TransferError::Write {
                path: part_path,
                source,
            });
        }
    }

    if header.size == 0 {
        std::fs::File::create(&part_path).map_err(|source| TransferError::Write {
            path: part_path.clone(),
            source,
        })?;
    }
    Ok(part_path)
}

fn append(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(data)
}
