use std::borrow::Cow;

use reed_solomon_erasure::galois_8::ReedSolomon;
use serde::{Deserialize, Serialize};

use crate::chunk_id::ChunkId;
use crate::compress::{self, Compression};
use crate::error::{CaissonError, Result};
use crate::wire::{FrameReader, FrameWriter};

pub const BUNDLE_FORMAT_VERSION: u32 = 1;

/// Erasure coding always spans 256 shards total; the parity level
/// decides how many of them are redundancy.
pub const ERASURE_TOTAL_SHARDS: usize = 256;

const SHARD_CRC_TRAILER_LEN: usize = ERASURE_TOTAL_SHARDS * 4;

#[derive(Debug, Serialize, Deserialize)]
struct BundleHeader {
    version: u32,
    compression_method: String,
    erasure_parity: u32,
}

/// A group of chunks stored as one blob.
///
/// While filling, chunks append to the payload buffer and the table of
/// contents in lockstep. Once handed to persistence the bundle is only
/// read. A decoded bundle serves chunk reads by walking the TOC, since
/// chunk offsets are implied by the cumulative sizes.
#[derive(Debug)]
pub struct Bundle {
    capacity: usize,
    payload: Vec<u8>,
    toc: Vec<ChunkId>,
}

impl Bundle {
    pub fn new(capacity: usize) -> Self {
        Bundle {
            capacity,
            payload: Vec::with_capacity(capacity),
            toc: Vec::new(),
        }
    }

    pub fn has_room(&self, length: usize) -> bool {
        self.capacity - self.payload.len() >= length
    }

    /// Appends a chunk given as a wrapped ring region. Returns false,
    /// leaving the bundle untouched, when the payload would overflow.
    pub fn add_chunk(&mut self, region: (&[u8], &[u8]), id: ChunkId) -> bool {
        let length = region.0.len() + region.1.len();
        debug_assert_eq!(id.size as usize, length);
        if !self.has_room(length) {
            return false;
        }
        self.toc.push(id);
        self.payload.extend_from_slice(region.0);
        self.payload.extend_from_slice(region.1);
        true
    }

    pub fn toc(&self) -> &[ChunkId] {
        &self.toc
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.toc.is_empty()
    }

    /// The bytes of one chunk, located by its TOC position.
    pub fn chunk_bytes(&self, id: &ChunkId) -> Option<&[u8]> {
        let mut offset = 0usize;
        for chunk in &self.toc {
            if chunk == id {
                return self.payload.get(offset..offset + id.size as usize);
            }
            offset += chunk.size as usize;
        }
        None
    }

    /// Serializes the bundle: header record, TOC record, checksum,
    /// compressed payload, checksum, optionally wrapped in erasure
    /// shards with per-shard CRC trailers. One Adler-32 runs across the
    /// whole logical stream, trailers included.
    pub fn encode(&self, compression: Compression, erasure_parity: usize) -> Result<Vec<u8>> {
        let mut writer = FrameWriter::new();
        writer.put_record(&BundleHeader {
            version: BUNDLE_FORMAT_VERSION,
            compression_method: compression.name().to_string(),
            erasure_parity: erasure_parity as u32,
        })?;
        writer.put_record(&self.toc)?;
        writer.put_checksum();
        let compressed = compress::compress(compression, &self.payload)?;
        writer.put_bytes(&compressed);
        writer.put_checksum();

        let plain = writer.into_inner();
        if erasure_parity == 0 {
            Ok(plain)
        } else {
            erasure_encode(&plain, erasure_parity)
        }
    }

    /// Decodes a bundle blob. `name` only feeds error messages.
    pub fn decode(data: &[u8], name: &str) -> Result<Bundle> {
        let header: BundleHeader = FrameReader::new(data, name).take_record()?;
        if header.version != BUNDLE_FORMAT_VERSION {
            return Err(CaissonError::CorruptBundle {
                file: name.to_string(),
                reason: format!("unsupported version {}", header.version),
            });
        }

        // With erasure coding the logical stream is the data-shard
        // prefix, repaired first if any CRC disagrees.
        let logical: Cow<'_, [u8]> = if header.erasure_parity > 0 {
            erasure_verify_repair(data, header.erasure_parity as usize, name)?
        } else {
            Cow::Borrowed(data)
        };

        let mut reader = FrameReader::new(&logical, name);
        let header: BundleHeader = reader.take_record()?;
        let toc: Vec<ChunkId> = reader.take_record()?;
        reader.verify_checksum()?;

        let expected: usize = toc.iter().map(|c| c.size as usize).sum();
        let compressed = reader.take_bytes()?;
        let payload = compress::decompress(&header.compression_method, compressed, expected)?;
        if payload.len() != expected {
            return Err(CaissonError::CorruptBundle {
                file: name.to_string(),
                reason: format!("payload is {} bytes, TOC says {expected}", payload.len()),
            });
        }
        reader.verify_checksum()?;

        Ok(Bundle {
            capacity: payload.len(),
            payload,
            toc,
        })
    }
}

/// Splits `data` into 256 − parity equal data shards (zero padded),
/// derives the parity shards, and appends 256 CRC32 trailers.
fn erasure_encode(data: &[u8], parity: usize) -> Result<Vec<u8>> {
    let data_count = ERASURE_TOTAL_SHARDS - parity;
    let shard_size = data.len() / data_count + 1;

    let mut shards: Vec<Vec<u8>> = Vec::with_capacity(ERASURE_TOTAL_SHARDS);
    for i in 0..data_count {
        let mut shard = vec![0u8; shard_size];
        let start = i * shard_size;
        if start < data.len() {
            let end = (start + shard_size).min(data.len());
            shard[..end - start].copy_from_slice(&data[start..end]);
        }
        shards.push(shard);
    }
    shards.resize_with(ERASURE_TOTAL_SHARDS, || vec![0u8; shard_size]);

    let rs = ReedSolomon::new(data_count, parity).map_err(|e| CaissonError::Other(e.to_string()))?;
    rs.encode(&mut shards)
        .map_err(|e| CaissonError::Other(e.to_string()))?;

    let mut out = Vec::with_capacity(ERASURE_TOTAL_SHARDS * shard_size + SHARD_CRC_TRAILER_LEN);
    for shard in &shards {
        out.extend_from_slice(shard);
    }
    for shard in &shards {
        out.extend_from_slice(&crc32fast::hash(shard).to_le_bytes());
    }
    Ok(out)
}

/// Checks every shard against its CRC trailer; when any disagree,
/// reconstructs the missing ones and re-verifies before handing back
/// the logical data-shard stream.
fn erasure_verify_repair<'a>(data: &'a [u8], parity: usize, name: &str) -> Result<Cow<'a, [u8]>> {
    if data.len() < SHARD_CRC_TRAILER_LEN + ERASURE_TOTAL_SHARDS {
        return Err(CaissonError::UnexpectedEndOfInput(name.to_string()));
    }
    let data_count = ERASURE_TOTAL_SHARDS - parity;
    let shard_size = (data.len() - SHARD_CRC_TRAILER_LEN) / ERASURE_TOTAL_SHARDS;
    let crc_offset = data.len() - SHARD_CRC_TRAILER_LEN;

    let stored_crc = |i: usize| {
        u32::from_le_bytes(
            data[crc_offset + i * 4..crc_offset + i * 4 + 4]
                .try_into()
                .unwrap(),
        )
    };
    let shard_data = |i: usize| &data[i * shard_size..(i + 1) * shard_size];

    let mut correct = [true; ERASURE_TOTAL_SHARDS];
    let mut all_correct = true;
    for i in 0..ERASURE_TOTAL_SHARDS {
        correct[i] = crc32fast::hash(shard_data(i)) == stored_crc(i);
        if !correct[i] {
            all_correct = false;
            tracing::warn!(bundle = name, shard = i, "corrupt bundle shard");
        }
    }

    if all_correct {
        return Ok(Cow::Borrowed(&data[..data_count * shard_size]));
    }

    let first_bad = correct.iter().position(|c| !c).unwrap_or(0);
    let mut shards: Vec<Option<Vec<u8>>> = (0..ERASURE_TOTAL_SHARDS)
        .map(|i| correct[i].then(|| shard_data(i).to_vec()))
        .collect();

    let rs = ReedSolomon::new(data_count, parity).map_err(|e| CaissonError::Other(e.to_string()))?;
    rs.reconstruct(&mut shards)
        .map_err(|_| CaissonError::UnrecoverableErasureLoss {
            file: name.to_string(),
            shard: first_bad,
        })?;

    let mut logical = Vec::with_capacity(data_count * shard_size);
    for (i, shard) in shards.iter().enumerate() {
        let shard = shard.as_ref().ok_or_else(|| CaissonError::UnrecoverableErasureLoss {
            file: name.to_string(),
            shard: i,
        })?;
        if crc32fast::hash(shard) != stored_crc(i) {
            return Err(CaissonError::UnrecoverableErasureLoss {
                file: name.to_string(),
                shard: i,
            });
        }
        if i < data_count {
            logical.extend_from_slice(shard);
        }
    }
    tracing::info!(bundle = name, "bundle repaired from erasure shards");
    Ok(Cow::Owned(logical))
}
