//! Wire types shared by both ends of an asset transfer.
//!
//! An asset is named by its [`ContentKey`], announced with an
//! [`AssetHeader`], then streamed as [`AssetChunk`]s in binary frames.

pub mod chunk;
pub mod header;
pub mod key;

// Re-export primary types for convenience.
pub use chunk::{
    AssetChunk, Frame, FrameError, SequencedChunk, decode_frame, encode_chunk_frame,
    encode_sequenced_frame,
};
pub use header::AssetHeader;
pub use key::{ContentKey, KEY_LEN, KeyParseError};
