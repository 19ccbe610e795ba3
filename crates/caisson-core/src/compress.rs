use std::io::{Read, Write};

use xz2::read::XzDecoder;
use xz2::write::XzEncoder;

use crate::error::{CaissonError, Result};

pub const METHOD_LZMA: &str = "lzma";
pub const METHOD_ZERO: &str = "zero";

/// Bundle payload compression. The method name travels in the bundle
/// header so the read side can decode bundles written under a
/// different configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// Identity passthrough, for incompressible data or benchmarks.
    Zero,
    Lzma { level: u32 },
}

impl Compression {
    pub fn from_config(method: &str, level: u32) -> Result<Self> {
        match method {
            METHOD_LZMA => Ok(Compression::Lzma { level }),
            METHOD_ZERO => Ok(Compression::Zero),
            other => Err(CaissonError::UnknownCompressionMethod(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Compression::Zero => METHOD_ZERO,
            Compression::Lzma { .. } => METHOD_LZMA,
        }
    }
}

pub fn compress(method: Compression, data: &[u8]) -> Result<Vec<u8>> {
    match method {
        Compression::Zero => Ok(data.to_vec()),
        Compression::Lzma { level } => {
            let mut encoder = XzEncoder::new(Vec::with_capacity(data.len() / 2 + 64), level);
            encoder.write_all(data)?;
            Ok(encoder.finish()?)
        }
    }
}

/// Decompresses by stored method name. `expected_len` comes from the
/// bundle's table of contents and bounds the output exactly.
pub fn decompress(method_name: &str, data: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    match method_name {
        METHOD_ZERO => Ok(data.to_vec()),
        METHOD_LZMA => {
            let mut out = Vec::with_capacity(expected_len);
            let decoder = XzDecoder::new(data);
            decoder
                .take(expected_len as u64 + 1)
                .read_to_end(&mut out)?;
            Ok(out)
        }
        other => Err(CaissonError::UnknownCompressionMethod(other.to_string())),
    }
}
