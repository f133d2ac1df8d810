//! Chunked sessions
//!
//! Bodies larger than one characteristic write are framed into indexed
//! chunks and reassembled on the receiving side.

pub mod chunk;
pub mod manager;

pub use chunk::{parse_chunk, split_payload, split_payload_tagged, ChunkHeader, CHUNK_HEADER_SIZE};
pub use manager::{ChunkSink, ChunkedSession, ChunkedSessionManager, SessionEvent, SessionRole};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Chunk header too short: {0} bytes")]
    HeaderTooShort(usize),
    #[error("Invalid chunk header: {0}")]
    InvalidHeader(String),
    #[error("Chunk declares {declared} payload bytes but carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("Payload too large to chunk: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("Chunk total changed mid-session: expected {expected}, got {got}")]
    TotalMismatch { expected: u16, got: u16 },
    #[error("Session incomplete: {missing} chunks missing")]
    Incomplete { missing: usize },
    #[error("Chunk {index} failed after {attempts} attempts")]
    SendFailed { index: u16, attempts: u32 },
    #[error("Session timed out with {received}/{total} chunks")]
    Timeout { received: usize, total: usize },
}
