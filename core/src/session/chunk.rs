// Indexed, length-prefixed chunk framing
//
// Wire layout (big-endian):
//   [index: u16 | total: u16 | payload_len: u16 | tag: u16 | payload...]
//
// The tag names the body a chunk belongs to. Every chunk of one body carries
// the same tag; untagged bodies use 0.

use super::SessionError;

/// Size of the chunk header in bytes
pub const CHUNK_HEADER_SIZE: usize = 8;

/// Header carried in front of every chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Index of this chunk (0-based)
    pub index: u16,
    /// Total number of chunks in the body
    pub total: u16,
    /// Number of payload bytes following the header
    pub payload_len: u16,
    /// Body the chunk belongs to
    pub tag: u16,
}

impl ChunkHeader {
    /// Create a new chunk header
    pub fn new(index: u16, total: u16, payload_len: u16) -> Result<Self, SessionError> {
        if total == 0 || index >= total {
            return Err(SessionError::InvalidHeader(format!(
                "index {} out of range for {} chunks",
                index, total
            )));
        }
        Ok(Self {
            index,
            total,
            payload_len,
            tag: 0,
        })
    }

    pub fn with_tag(mut self, tag: u16) -> Self {
        self.tag = tag;
        self
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> [u8; CHUNK_HEADER_SIZE] {
        let mut bytes = [0u8; CHUNK_HEADER_SIZE];
        bytes[0..2].copy_from_slice(&self.index.to_be_bytes());
        bytes[2..4].copy_from_slice(&self.total.to_be_bytes());
        bytes[4..6].copy_from_slice(&self.payload_len.to_be_bytes());
        bytes[6..8].copy_from_slice(&self.tag.to_be_bytes());
        bytes
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SessionError> {
        if bytes.len() < CHUNK_HEADER_SIZE {
            return Err(SessionError::HeaderTooShort(bytes.len()));
        }
        let index = u16::from_be_bytes([bytes[0], bytes[1]]);
        let total = u16::from_be_bytes([bytes[2], bytes[3]]);
        let payload_len = u16::from_be_bytes([bytes[4], bytes[5]]);
        let tag = u16::from_be_bytes([bytes[6], bytes[7]]);
        Ok(Self::new(index, total, payload_len)?.with_tag(tag))
    }
}

/// Split a body into framed chunks of at most `max_chunk_size` bytes each
pub fn split_payload(data: &[u8], max_chunk_size: usize) -> Result<Vec<Vec<u8>>, SessionError> {
    split_payload_tagged(data, max_chunk_size, 0)
}

/// Like [`split_payload`], stamping every chunk with `tag`
pub fn split_payload_tagged(
    data: &[u8],
    max_chunk_size: usize,
    tag: u16,
) -> Result<Vec<Vec<u8>>, SessionError> {
    let max_payload = max_chunk_size.saturating_sub(CHUNK_HEADER_SIZE);
    if max_payload == 0 {
        return Err(SessionError::InvalidHeader(format!(
            "chunk size {} leaves no room for payload",
            max_chunk_size
        )));
    }
    let max_payload = max_payload.min(u16::MAX as usize);

    if data.is_empty() {
        let header = ChunkHeader::new(0, 1, 0)?.with_tag(tag);
        return Ok(vec![header.to_bytes().to_vec()]);
    }

    let total = data.len().div_ceil(max_payload);
    if total > u16::MAX as usize {
        return Err(SessionError::PayloadTooLarge(data.len()));
    }

    data.chunks(max_payload)
        .enumerate()
        .map(|(index, slice)| {
            let header =
                ChunkHeader::new(index as u16, total as u16, slice.len() as u16)?.with_tag(tag);
            let mut chunk = Vec::with_capacity(CHUNK_HEADER_SIZE + slice.len());
            chunk.extend_from_slice(&header.to_bytes());
            chunk.extend_from_slice(slice);
            Ok(chunk)
        })
        .collect()
}

/// Parse a raw chunk into its header and payload
pub fn parse_chunk(raw: &[u8]) -> Result<(ChunkHeader, &[u8]), SessionError> {
    let header = ChunkHeader::from_bytes(raw)?;
    let payload = &raw[CHUNK_HEADER_SIZE..];
    if payload.len() != header.payload_len as usize {
        return Err(SessionError::LengthMismatch {
            declared: header.payload_len as usize,
            actual: payload.len(),
        });
    }
    Ok((header, payload))
}
