//! Compression Module
//!
//! Opportunistic DEFLATE compression of serialized payloads.
//!
//! Compression is an optimization only: when it is disabled, or when it
//! would not shrink the payload, values pass through untouched and the
//! entry records `compressed: false`.

use std::io::{Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use crate::error::{Result, StashError};

/// Output of a successful compression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compressed {
    pub data: Vec<u8>,
    pub original_size: u64,
    pub compressed_size: u64,
}

/// Threshold-gated DEFLATE codec
#[derive(Debug, Clone)]
pub struct Compressor {
    enabled: bool,
    threshold: usize,
}

impl Compressor {
    pub fn new(enabled: bool, threshold: usize) -> Self {
        Self { enabled, threshold }
    }

    /// Whether the codec is active at all
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Compress `bytes` if they exceed the threshold
    ///
    /// Returns `None` when the payload should be stored as-is.
    pub fn compress(&self, bytes: &[u8]) -> Result<Option<Compressed>> {
        if !self.enabled || bytes.len() <= self.threshold {
            return Ok(None);
        }

        let data = deflate(bytes)?;
        if data.len() >= bytes.len() {
            tracing::trace!(
                "Compression did not shrink payload ({} -> {} bytes), storing raw",
                bytes.len(),
                data.len()
            );
            return Ok(None);
        }

        Ok(Some(Compressed {
            original_size: bytes.len() as u64,
            compressed_size: data.len() as u64,
            data,
        }))
    }

    /// Inflate data produced by `compress`
    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        inflate(data)
    }
}

/// DEFLATE a buffer at the default level
pub fn deflate(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(bytes)
        .map_err(|e| StashError::Compression(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| StashError::Compression(e.to_string()))
}

/// Inflate a DEFLATE buffer
pub fn inflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = DeflateDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| StashError::Compression(e.to_string()))?;
    Ok(out)
}
