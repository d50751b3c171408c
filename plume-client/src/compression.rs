//! Payload compression codecs.
//!
//! Entries pushed by the broker may be compressed with any of the codecs
//! below; the metadata carries the codec id and the uncompressed size so
//! the consumer can decode without guessing. The compress side exists for
//! the producer half of the client and for tests that fabricate broker
//! frames.

use bytes::Bytes;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("Compression failed: {0}")]
    CompressionFailed(String),

    #[error("Decompression failed: {0}")]
    DecompressionFailed(String),

    #[error("Unsupported compression type: {0}")]
    UnsupportedType(u8),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

/// Compression codecs understood on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionType {
    None = 0,
    Gzip = 1,
    Snappy = 2,
    Lz4 = 3,
    Zstd = 4,
}

impl TryFrom<u8> for CompressionType {
    type Error = CompressionError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CompressionType::None),
            1 => Ok(CompressionType::Gzip),
            2 => Ok(CompressionType::Snappy),
            3 => Ok(CompressionType::Lz4),
            4 => Ok(CompressionType::Zstd),
            _ => Err(CompressionError::UnsupportedType(value)),
        }
    }
}

impl From<CompressionType> for u8 {
    fn from(compression_type: CompressionType) -> Self {
        compression_type as u8
    }
}

/// Compress `data` with the given codec.
pub fn compress(data: &[u8], compression_type: CompressionType) -> Result<Bytes, CompressionError> {
    match compression_type {
        CompressionType::None => Ok(Bytes::copy_from_slice(data)),
        CompressionType::Lz4 => Ok(Bytes::from(lz4_flex::compress(data))),
        CompressionType::Snappy => {
            let mut encoder = snap::raw::Encoder::new();
            let compressed = encoder
                .compress_vec(data)
                .map_err(|e| CompressionError::CompressionFailed(e.to_string()))?;
            Ok(Bytes::from(compressed))
        }
        CompressionType::Gzip => {
            use std::io::Write;

            let mut buffer = Vec::with_capacity(data.len());
            let mut encoder =
                flate2::write::GzEncoder::new(&mut buffer, flate2::Compression::fast());
            encoder.write_all(data)?;
            encoder.finish()?;
            Ok(Bytes::from(buffer))
        }
        CompressionType::Zstd => {
            let compressed = zstd::encode_all(data, 3)
                .map_err(|e| CompressionError::CompressionFailed(e.to_string()))?;
            Ok(Bytes::from(compressed))
        }
    }
}

/// Decompress `data` with the given codec.
///
/// `uncompressed_size` is the size hint from the message metadata; LZ4
/// cannot decode a raw block without it.
pub fn decompress(
    data: &[u8],
    compression_type: CompressionType,
    uncompressed_size: Option<usize>,
) -> Result<Bytes, CompressionError> {
    match compression_type {
        CompressionType::None => Ok(Bytes::copy_from_slice(data)),
        CompressionType::Lz4 => {
            let decompressed = if let Some(size_hint) = uncompressed_size {
                lz4_flex::decompress(data, size_hint)
                    .map_err(|e| CompressionError::DecompressionFailed(e.to_string()))?
            } else {
                lz4_flex::decompress_size_prepended(data)
                    .map_err(|e| CompressionError::DecompressionFailed(e.to_string()))?
            };
            Ok(Bytes::from(decompressed))
        }
        CompressionType::Snappy => {
            let mut decoder = snap::raw::Decoder::new();
            let decompressed = decoder
                .decompress_vec(data)
                .map_err(|e| CompressionError::DecompressionFailed(e.to_string()))?;
            Ok(Bytes::from(decompressed))
        }
        CompressionType::Gzip => {
            use std::io::Read;

            let mut buffer = Vec::new();
            let mut decoder = flate2::read::GzDecoder::new(data);
            decoder.read_to_end(&mut buffer)?;
            Ok(Bytes::from(buffer))
        }
        CompressionType::Zstd => {
            let decompressed = if let Some(size_hint) = uncompressed_size {
                let mut buffer = Vec::with_capacity(size_hint);
                zstd::stream::copy_decode(data, &mut buffer)
                    .map_err(|e| CompressionError::DecompressionFailed(e.to_string()))?;
                buffer
            } else {
                zstd::decode_all(data)
                    .map_err(|e| CompressionError::DecompressionFailed(e.to_string()))?
            };
            Ok(Bytes::from(decompressed))
        }
    }
}
