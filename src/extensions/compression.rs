//! Payload compression.
//!
//! The transport compresses a packet's header and payload as one block and
//! keeps the result only if it is strictly smaller. [`Compressor`] is the
//! seam; [`ZstdCompressor`] (feature `compression`) is the stock
//! implementation.

use crate::core::CompressionError;

/// Block compressor used by the transport.
pub trait Compressor: Send {
    /// Compress a block.
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError>;

    /// Decompress a block, failing if the output would exceed `max_size`.
    fn decompress(&self, data: &[u8], max_size: usize) -> Result<Vec<u8>, CompressionError>;
}

/// Minimum block size worth compressing.
pub const MIN_COMPRESS_SIZE: usize = 64;

/// Default zstd compression level (1-22, higher = smaller but slower)
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// zstd block compressor.
#[cfg(feature = "compression")]
#[derive(Debug, Clone)]
pub struct ZstdCompressor {
    level: i32,
    min_size: usize,
}

#[cfg(feature = "compression")]
impl ZstdCompressor {
    /// Create a compressor with default settings.
    pub fn new() -> Self {
        Self {
            level: DEFAULT_COMPRESSION_LEVEL,
            min_size: MIN_COMPRESS_SIZE,
        }
    }

    /// Set compression level, clamped to 1..=22.
    pub fn with_level(mut self, level: i32) -> Self {
        self.level = level.clamp(1, 22);
        self
    }

    /// Blocks shorter than `min_size` are returned as-is, which the
    /// transport then sends uncompressed.
    pub fn with_min_size(mut self, min_size: usize) -> Self {
        self.min_size = min_size;
        self
    }

    /// Compression level.
    pub fn level(&self) -> i32 {
        self.level
    }
}

#[cfg(feature = "compression")]
impl Default for ZstdCompressor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "compression")]
impl Compressor for ZstdCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        if data.len() < self.min_size {
            return Ok(data.to_vec());
        }
        zstd::encode_all(data, self.level)
            .map_err(|e| CompressionError::CompressionFailed(e.to_string()))
    }

    fn decompress(&self, data: &[u8], max_size: usize) -> Result<Vec<u8>, CompressionError> {
        use std::io::Read;

        let decoder = zstd::Decoder::new(data)
            .map_err(|e| CompressionError::DecompressionFailed(e.to_string()))?;

        // Read one byte past the limit to tell "exactly at" from "over".
        let mut output = Vec::new();
        decoder
            .take(max_size as u64 + 1)
            .read_to_end(&mut output)
            .map_err(|e| CompressionError::DecompressionFailed(e.to_string()))?;

        if output.len() > max_size {
            return Err(CompressionError::SizeExceeded {
                size: output.len(),
                limit: max_size,
            });
        }
        Ok(output)
    }
}
