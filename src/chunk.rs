//! Chunk addressing.
//!
//! A file of `file_size` bytes is cut into fixed-size chunks; only the last
//! one may be shorter. Everything here is pure arithmetic.

use crate::config::BASE_CHUNK_SIZE;
use crate::error::ChunkError;

/// Chunk size in bytes for a given multiplier of [`BASE_CHUNK_SIZE`].
pub fn chunk_size(multiplier: u64) -> u64 {
    BASE_CHUNK_SIZE * multiplier.max(1)
}

pub fn offset(index: u64, chunk_size: u64) -> u64 {
    index * chunk_size
}

/// Length of chunk `index`, or `InvalidChunk` when its offset lies at or past
/// the end of the file.
pub fn size(index: u64, file_size: u64, offset: u64, chunk_size: u64) -> Result<u64, ChunkError> {
    check_chunk_id(index, file_size, offset)?;
    Ok(chunk_size.min(file_size - offset))
}

pub fn check_chunk_id(index: u64, file_size: u64, offset: u64) -> Result<(), ChunkError> {
    if offset >= file_size {
        return Err(ChunkError::InvalidChunk { index, offset, file_size });
    }
    Ok(())
}

pub fn total_chunks(file_size: u64, chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    file_size.div_ceil(chunk_size)
}

/// URL plus `Range` header value selecting `[offset, offset + length)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRequest {
    pub url: String,
    pub range: String,
}

pub fn request(base_url: &str, file_size: u64, offset: u64, length: u64) -> Result<ChunkRequest, ChunkError> {
    if length == 0 || offset + length > file_size {
        return Err(ChunkError::InvalidChunk { index: 0, offset, file_size });
    }
    Ok(ChunkRequest {
        url: base_url.to_string(),
        range: format!("bytes={}-{}", offset, offset + length - 1),
    })
}

/// Addressing bundle for one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLayout {
    pub file_size: u64,
    pub chunk_size: u64,
}

impl ChunkLayout {
    pub fn new(file_size: u64, chunk_size: u64) -> Self {
        Self { file_size, chunk_size: chunk_size.max(1) }
    }

    pub fn with_multiplier(file_size: u64, multiplier: u64) -> Self {
        Self::new(file_size, chunk_size(multiplier))
    }

    pub fn total_chunks(&self) -> u64 {
        total_chunks(self.file_size, self.chunk_size)
    }

    /// `(offset, length)` of chunk `index`.
    pub fn locate(&self, index: u64) -> Result<(u64, u64), ChunkError> {
        let offset = offset(index, self.chunk_size);
        let length = size(index, self.file_size, offset, self.chunk_size)?;
        Ok((offset, length))
    }
}
