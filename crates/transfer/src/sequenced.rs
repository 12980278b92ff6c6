//! Consumer for chunks that carry their own index and offset.
//!
//! Each chunk is written at its offset, so the transport may reorder
//! delivery. Both ends must agree on the chunk size: chunk `i` starts at
//! `i * chunk_size` and only the last one may be shorter. Anything else is a
//! protocol violation, which keeps a misbehaving peer from steering writes
//! or bookkeeping outside the declared asset.

use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use assetlink_protocol::{AssetHeader, ContentKey, SequencedChunk};
use tracing::{debug, info, warn};

use crate::TransferError;
use crate::consumer::{OvershootPolicy, prepare_part_file};
use crate::progress::ProgressHandle;

/// Outcome of handing a sequenced chunk to a [`SequencedConsumer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkResult {
    /// The chunk was the next one expected and has been written.
    Accepted,
    /// A chunk with this index was already written; nothing was done.
    Duplicate,
    /// The chunk was written, but earlier chunks are still missing.
    OutOfOrder { expected: u64, got: u64 },
}

pub struct SequencedConsumer {
    header: AssetHeader,
    part_path: PathBuf,
    chunk_size: u64,
    chunk_count: u64,
    /// Bytes of `[0, size)` covered by received chunks.
    covered: u64,
    /// Bytes written, including tolerated overshoot on the last chunk.
    bytes_written: u64,
    policy: OvershootPolicy,
    progress: ProgressHandle,
    failed: bool,
    /// Lowest index not yet received.
    next_index: u64,
    /// Received indices above `next_index`.
    ahead: BTreeSet<u64>,
}

impl SequencedConsumer {
    /// Same directory preparation and stale cleanup as
    /// [`AssetConsumer::new`](crate::AssetConsumer::new). `chunk_size` is the
    /// sender's chunk size.
    pub fn new(
        dir: impl AsRef<Path>,
        header: AssetHeader,
        chunk_size: usize,
    ) -> Result<Self, TransferError> {
        Self::with_policy(dir, header, chunk_size, OvershootPolicy::default())
    }

    pub fn with_policy(
        dir: impl AsRef<Path>,
        header: AssetHeader,
        chunk_size: usize,
        policy: OvershootPolicy,
    ) -> Result<Self, TransferError> {
        if chunk_size == 0 {
            return Err(TransferError::InvalidArgument(
                "chunk size must be greater than zero".into(),
            ));
        }
        let chunk_size = chunk_size as u64;
        let part_path = prepare_part_file(dir.as_ref(), &header)?;
        let progress = ProgressHandle::new(&header);
        Ok(Self {
            chunk_count: header.size.div_ceil(chunk_size),
            header,
            part_path,
            chunk_size,
            covered: 0,
            bytes_written: 0,
            policy,
            progress,
            failed: false,
            next_index: 0,
            ahead: BTreeSet::new(),
        })
    }

    pub fn accept(&mut self, chunk: &SequencedChunk) -> Result<ChunkResult, TransferError> {
        if self.failed {
            return Err(TransferError::InvalidArgument(format!(
                "consumer for asset {} is unusable after a failed write",
                self.header.id
            )));
        }
        if chunk.id != self.header.id {
            return Err(TransferError::InvalidArgument(format!(
                "chunk for asset {} given to consumer of {}",
                chunk.id, self.header.id
            )));
        }

        let index = chunk.index;
        let expected_len = self.check_position(chunk)?;

        if index < self.next_index || self.ahead.contains(&index) {
            debug!(key = %self.header.id, index, "duplicate chunk ignored");
            return Ok(ChunkResult::Duplicate);
        }

        if let Err(source) = write_at(&self.part_path, chunk.offset, &chunk.data) {
            warn!(
                key = %self.header.id,
                index,
                error = %source,
                "failed to write chunk"
            );
            self.failed = true;
            self.progress.mark_failed();
            return Err(TransferError::Write {
                path: self.part_path.clone(),
                source,
            });
        }

        self.bytes_written += chunk.data.len() as u64;
        self.covered += expected_len;
        self.progress.set_transferred(self.covered);

        let result = if index == self.next_index {
            self.next_index += 1;
            while self.ahead.remove(&self.next_index) {
                self.next_index += 1;
            }
            ChunkResult::Accepted
        } else {
            self.ahead.insert(index);
            ChunkResult::OutOfOrder {
                expected: self.next_index,
                got: index,
            }
        };

        if self.is_complete() {
            info!(key = %self.header.id, bytes = self.bytes_written, "asset received");
        }
        Ok(result)
    }

    /// Validates index, offset and length against the chunk layout and
    /// returns how many bytes of the asset the chunk covers.
    fn check_position(&self, chunk: &SequencedChunk) -> Result<u64, TransferError> {
        let id = self.header.id;
        let index = chunk.index;
        if index >= self.chunk_count {
            return Err(TransferError::ProtocolViolation(format!(
                "chunk {index} of asset {id} is out of range (asset has {} chunks)",
                self.chunk_count
            )));
        }

        // index < chunk_count, so this cannot overflow.
        let start = index * self.chunk_size;
        if chunk.offset != start {
            return Err(TransferError::ProtocolViolation(format!(
                "chunk {index} of asset {id} at offset {}, expected {start}",
                chunk.offset
            )));
        }

        let expected_len = self.chunk_size.min(self.header.size - start);
        let len = chunk.data.len() as u64;
        let is_last = index + 1 == self.chunk_count;
        if len < expected_len {
            return Err(TransferError::ProtocolViolation(format!(
                "chunk {index} of asset {id} is {len} bytes, expected {expected_len}"
            )));
        }
        if len > expected_len {
            if !is_last || self.policy == OvershootPolicy::Reject {
                return Err(TransferError::ProtocolViolation(format!(
                    "chunk {index} of asset {id} is {len} bytes, past its {expected_len}-byte slot"
                )));
            }
            warn!(
                key = %id,
                index,
                overshoot = len - expected_len,
                "last chunk runs past declared size"
            );
        }
        Ok(expected_len)
    }

    /// Up to `limit` indices below the highest one received that have not
    /// arrived, lowest first.
    pub fn missing(&self, limit: usize) -> Vec<u64> {
        let Some(&highest) = self.ahead.last() else {
            return Vec::new();
        };
        (self.next_index..highest)
            .filter(|i| !self.ahead.contains(i))
            .take(limit)
            .collect()
    }

    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Number of chunks the asset is split into.
    pub fn chunk_count(&self) -> u64 {
        self.chunk_count
    }

    /// Every chunk index has been received.
    pub fn is_complete(&self) -> bool {
        self.next_index == self.chunk_count
    }

    pub fn percent_complete(&self) -> f64 {
        if self.header.size == 0 {
            return 1.0;
        }
        self.covered as f64 / self.header.size as f64
    }

    pub fn id(&self) -> ContentKey {
        self.header.id
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

    pub fn resolved_path(&self) -> &Path {
        &self.part_path
    }

    pub fn progress(&self) -> ProgressHandle {
        self.progress.clone()
    }
}

fn write_at(path: &Path, offset: u64, data: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(data)
}
