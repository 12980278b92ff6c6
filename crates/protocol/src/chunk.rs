//! Chunk messages and their binary frame encoding.
//!
//! Wire format:
//!
//! ```text
//! [4 bytes BE: header_len][header_len bytes: JSON header][rest: chunk payload]
//! ```
//!
//! The JSON header always carries the content key (`id`). Sequenced chunks
//! add `index` and `offset`; plain chunks carry neither and rely on the
//! transport delivering them in order.

use serde::{Deserialize, Serialize};

use crate::key::ContentKey;

/// One slice of an asset, tagged with the key of the asset it belongs to.
///
/// Carries no offset: its position is implied by the order it arrives in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetChunk {
    pub id: ContentKey,
    pub data: Vec<u8>,
}

impl AssetChunk {
    pub fn new(id: ContentKey, data: Vec<u8>) -> Self {
        Self { id, data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A chunk that states its own position, for transports that may reorder
/// or duplicate messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencedChunk {
    pub id: ContentKey,
    /// Zero-based position in the producer's emission order.
    pub index: u64,
    /// Byte offset of `data` within the asset.
    pub offset: u64,
    pub data: Vec<u8>,
}

impl SequencedChunk {
    /// Drops the position, leaving an order-dependent chunk.
    pub fn into_chunk(self) -> AssetChunk {
        AssetChunk {
            id: self.id,
            data: self.data,
        }
    }
}

/// A decoded binary frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Chunk(AssetChunk),
    Sequenced(SequencedChunk),
}

impl Frame {
    pub fn id(&self) -> ContentKey {
        match self {
            Frame::Chunk(c) => c.id,
            Frame::Sequenced(c) => c.id,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FrameHeader {
    id: ContentKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    index: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    offset: Option<u64>,
}

/// Errors from binary frame decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame too short (need at least 4 bytes)")]
    TooShort,

    #[error("header truncated: expected {expected} bytes, got {got}")]
    HeaderTruncated { expected: usize, got: usize },

    #[error("invalid header JSON: {0}")]
    InvalidJson(String),

    #[error("sequenced frame is missing `{0}`")]
    MissingField(&'static str),
}

/// Encodes a plain chunk.
pub fn encode_chunk_frame(chunk: &AssetChunk) -> Result<Vec<u8>, serde_json::Error> {
    let header = FrameHeader {
        id: chunk.id,
        index: None,
        offset: None,
    };
    encode(&header, &chunk.data)
}

/// Encodes a sequenced chunk.
pub fn encode_sequenced_frame(chunk: &SequencedChunk) -> Result<Vec<u8>, serde_json::Error> {
    let header = FrameHeader {
        id: chunk.id,
        index: Some(chunk.index),
        offset: Some(chunk.offset),
    };
    encode(&header, &chunk.data)
}

fn encode(header: &FrameHeader, payload: &[u8]) -> Result<Vec<u8>, serde_json::Error> {
    let header_json = serde_json::to_vec(header)?;
    let header_len = header_json.len() as u32;

    let mut buf = Vec::with_capacity(4 + header_json.len() + payload.len());
    buf.extend_from_slice(&header_len.to_be_bytes());
    buf.extend_from_slice(&header_json);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Decodes a frame produced by [`encode_chunk_frame`] or
/// [`encode_sequenced_frame`].
pub fn decode_frame(data: &[u8]) -> Result<Frame, FrameError> {
    if data.len() < 4 {
        return Err(FrameError::TooShort);
    }

    let header_len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    let body = &data[4..];
    if body.len() < header_len {
        return Err(FrameError::HeaderTruncated {
            expected: header_len,
            got: body.len(),
        });
    }

    let header: FrameHeader = serde_json::from_slice(&body[..header_len])
        .map_err(|e| FrameError::InvalidJson(e.to_string()))?;
    let payload = body[header_len..].to_vec();

    match (header.index, header.offset) {
        (None, None) => Ok(Frame::Chunk(AssetChunk::new(header.id, payload))),
        (Some(index), Some(offset)) => Ok(Frame::Sequenced(SequencedChunk {
            id: header.id,
            index,
            offset,
            data: payload,
        })),
        (Some(_), None) => Err(FrameError::MissingField("offset")),
        (None, Some(_)) => Err(FrameError::MissingField("index")),
    }
}
