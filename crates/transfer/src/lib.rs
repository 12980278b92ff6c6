//! Chunked asset transfer: slice an asset into bounded chunks on one side,
//! append them to a `.part` file on the other, and track progress for many
//! assets in flight at once.
//!
//! The engine does no networking. A sender pulls chunks from an
//! [`AssetProducer`] and hands them to its transport; a receiver feeds each
//! arriving chunk to the matching [`AssetConsumer`] in the order they were
//! produced. [`TransferManager`] does the per-key bookkeeping for both sides.

mod config;
mod consumer;
mod manager;
mod producer;
mod progress;
mod sequenced;

use std::path::PathBuf;

use assetlink_protocol::ContentKey;

pub use config::TransferConfig;
pub use consumer::{AssetConsumer, ConsumerState, OvershootPolicy, part_file_path};
pub use manager::{CompletedAsset, EventCallback, Registration, TransferEvent, TransferManager};
pub use producer::{AssetProducer, AssetSource, BoxedProducer};
pub use progress::{
    ProgressCallback, ProgressHandle, ProgressTracker, SpeedCalculator, TransferProgress,
    TransferStatus,
};
pub use sequenced::{ChunkResult, SequencedConsumer};

/// Default chunk ceiling: 256 KiB.
///
/// Small enough that a slow link keeps making visible progress, large enough
/// that the per-chunk open/append/close on the receiver stays cheap.
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// Extension of in-progress files: `<dir>/<key>.part`.
pub const PART_EXTENSION: &str = "part";

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed to read source of asset {key}: {source}")]
    SourceRead {
        key: ContentKey,
        source: std::io::Error,
    },

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        expected: ContentKey,
        actual: ContentKey,
    },

    #[error("no transfer in progress for asset {0}")]
    UnknownAsset(ContentKey),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
