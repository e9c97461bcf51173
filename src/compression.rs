//! Chunk payload compression for transport.
//!
//! Chunks are stored uncompressed on disk. A transfer may declare a method in
//! its metadata, in which case `process_*_chunk` expects compressed payloads
//! and `get_*_chunk` returns compressed payloads.

use crate::error::{Result, VolError};
use flate2::read::{DeflateDecoder, DeflateEncoder};
use flate2::Compression as FlateCompression;
use serde::{Deserialize, Serialize};
use std::io::Read;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum CompressionMethod {
    #[default]
    None = 0,
    Deflate = 1,
    /// Byte-pair run-length encoding, good for label chunks
    Rle = 2,
    Zstd = 3,
}

impl CompressionMethod {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CompressionMethod::None),
            1 => Some(CompressionMethod::Deflate),
            2 => Some(CompressionMethod::Rle),
            3 => Some(CompressionMethod::Zstd),
            _ => None,
        }
    }
}

/// Compression level, clamped to 0..=9
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionLevel(u8);

impl CompressionLevel {
    pub fn new(level: u8) -> Self {
        Self(level.min(9))
    }

    pub fn fast() -> Self {
        Self(1)
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl Default for CompressionLevel {
    fn default() -> Self {
        Self(3)
    }
}

pub trait Compressor: Send + Sync {
    fn compress(&self, data: &[u8], level: CompressionLevel) -> Result<Vec<u8>>;

    /// With `expected_size` set, output past that many bytes is rejected
    /// before it is buffered
    fn decompress(&self, data: &[u8], expected_size: Option<usize>) -> Result<Vec<u8>>;

    fn method(&self) -> CompressionMethod;
}

#[derive(Debug, Default)]
pub struct NoneCompressor;

impl Compressor for NoneCompressor {
    fn compress(&self, data: &[u8], _level: CompressionLevel) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8], _expected_size: Option<usize>) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn method(&self) -> CompressionMethod {
        CompressionMethod::None
    }
}

#[derive(Debug, Default)]
pub struct DeflateCompressor;

impl Compressor for DeflateCompressor {
    fn compress(&self, data: &[u8], level: CompressionLevel) -> Result<Vec<u8>> {
        let mut encoder = DeflateEncoder::new(data, FlateCompression::new(level.value() as u32));
        let mut compressed = Vec::new();
        encoder
            .read_to_end(&mut compressed)
            .map_err(|e| VolError::Compression(e.to_string()))?;
        Ok(compressed)
    }

    fn decompress(&self, data: &[u8], expected_size: Option<usize>) -> Result<Vec<u8>> {
        read_bounded(DeflateDecoder::new(data), expected_size, CompressionMethod::Deflate)
    }

    fn method(&self) -> CompressionMethod {
        CompressionMethod::Deflate
    }
}

#[derive(Debug, Default)]
pub struct ZstdCompressor;

impl Compressor for ZstdCompressor {
    fn compress(&self, data: &[u8], level: CompressionLevel) -> Result<Vec<u8>> {
        zstd::encode_all(data, level.value() as i32).map_err(|e| VolError::Compression(e.to_string()))
    }

    fn decompress(&self, data: &[u8], expected_size: Option<usize>) -> Result<Vec<u8>> {
        let decoder = zstd::stream::read::Decoder::new(data)
            .map_err(|e| VolError::Decompression(e.to_string()))?;
        read_bounded(decoder, expected_size, CompressionMethod::Zstd)
    }

    fn method(&self) -> CompressionMethod {
        CompressionMethod::Zstd
    }
}

/// `(count, value)` byte pairs, runs capped at 255
#[derive(Debug, Default)]
pub struct RleCompressor;

impl Compressor for RleCompressor {
    fn compress(&self, data: &[u8], _level: CompressionLevel) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut rest = data;
        while let Some(&value) = rest.first() {
            let run = rest.iter().take(255).take_while(|&&b| b == value).count();
            out.push(run as u8);
            out.push(value);
            rest = &rest[run..];
        }
        Ok(out)
    }

    fn decompress(&self, data: &[u8], expected_size: Option<usize>) -> Result<Vec<u8>> {
        if data.len() % 2 != 0 {
            return Err(VolError::Decompression(format!(
                "RLE stream has odd length {}",
                data.len()
            )));
        }
        let limit = expected_size.unwrap_or(usize::MAX);
        let mut out = Vec::with_capacity(expected_size.unwrap_or(0));
        for pair in data.chunks_exact(2) {
            if pair[0] == 0 {
                return Err(VolError::Decompression("RLE run of length 0".to_string()));
            }
            if out.len() + pair[0] as usize > limit {
                return Err(oversized(CompressionMethod::Rle, limit));
            }
            out.resize(out.len() + pair[0] as usize, pair[1]);
        }
        Ok(out)
    }

    fn method(&self) -> CompressionMethod {
        CompressionMethod::Rle
    }
}

fn oversized(method: CompressionMethod, limit: usize) -> VolError {
    VolError::Decompression(format!("{:?} stream decodes past {} bytes", method, limit))
}

/// Drain `reader`, reading at most one byte past `limit`
fn read_bounded(mut reader: impl Read, limit: Option<usize>, method: CompressionMethod) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(limit.unwrap_or(0));
    let result = match limit {
        Some(limit) => reader.by_ref().take(limit as u64 + 1).read_to_end(&mut out),
        None => reader.read_to_end(&mut out),
    };
    result.map_err(|e| VolError::Decompression(e.to_string()))?;
    match limit {
        Some(limit) if out.len() > limit => Err(oversized(method, limit)),
        _ => Ok(out),
    }
}

pub fn get_compressor(method: CompressionMethod) -> Box<dyn Compressor> {
    match method {
        CompressionMethod::None => Box::new(NoneCompressor),
        CompressionMethod::Deflate => Box::new(DeflateCompressor),
        CompressionMethod::Rle => Box::new(RleCompressor),
        CompressionMethod::Zstd => Box::new(ZstdCompressor),
    }
}

/// Decode a transported chunk and check it is exactly `chunk_size` bytes
pub fn decode_chunk(method: CompressionMethod, data: &[u8], chunk_size: usize) -> Result<Vec<u8>> {
    let decoded = get_compressor(method).decompress(data, Some(chunk_size))?;
    if decoded.len() != chunk_size {
        return Err(VolError::Decompression(format!(
            "{:?} chunk decoded to {} bytes, expected {}",
            method,
            decoded.len(),
            chunk_size
        )));
    }
    Ok(decoded)
}
