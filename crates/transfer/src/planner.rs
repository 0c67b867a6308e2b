//! Chunk planning: splits a file of known size into fixed-size ranges.

use crate::UploadError;

/// One contiguous byte range of the source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkDescriptor {
    /// 0-based ordinal; the server reassembles by this, not by arrival order.
    pub index: usize,
    /// Byte offset within the file.
    pub offset: u64,
    /// Size of this chunk in bytes.
    pub length: u64,
}

impl ChunkDescriptor {
    /// One past the last byte of this chunk.
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Number of chunks for `file_size` bytes: `ceil(file_size / chunk_size)`,
/// and at least one so empty files still get a session.
pub fn chunk_count(file_size: u64, chunk_size: u64) -> Result<usize, UploadError> {
    if chunk_size == 0 {
        return Err(UploadError::InvalidConfiguration(
            "chunk size must be greater than 0".into(),
        ));
    }
    let count = file_size.div_ceil(chunk_size).max(1);
    usize::try_from(count).map_err(|_| {
        UploadError::InvalidConfiguration(format!(
            "{file_size} bytes at chunk size {chunk_size} yields too many chunks"
        ))
    })
}

/// Plans the ordered chunk list for a file.
///
/// All chunks but the last are exactly `chunk_size` bytes. A zero-byte file
/// produces a single zero-length chunk.
pub fn plan(file_size: u64, chunk_size: u64) -> Result<Vec<ChunkDescriptor>, UploadError> {
    let count = chunk_count(file_size, chunk_size)?;
    let mut chunks = Vec::with_capacity(count);
    let mut offset = 0u64;
    for index in 0..count {
        let length = chunk_size.min(file_size - offset);
        chunks.push(ChunkDescriptor {
            index,
            offset,
            length,
        });
        offset += length;
    }
    Ok(chunks)
}

/// Converts a signed chunk size from the binding boundary.
pub fn validate_chunk_size(chunk_size: i64) -> Result<u64, UploadError> {
    u64::try_from(chunk_size)
        .ok()
        .filter(|size| *size > 0)
        .ok_or_else(|| {
            UploadError::InvalidConfiguration(format!(
                "chunk size must be greater than 0, got {chunk_size}"
            ))
        })
}

/// Converts a signed parallelism from the binding boundary; `<= 0` means 1.
pub fn normalize_parallel(parallel: i64) -> usize {
    usize::try_from(parallel).unwrap_or(0).max(1)
}
