use std::fmt;

use blake2::digest::{Update, VariableOutput};
use blake2::Blake2bVar;
use rand::RngCore;
use serde::{Deserialize, Serialize};

pub const CHUNK_ID_WIRE_LEN: usize = 24;
pub const BUNDLE_ID_LEN: usize = 24;

const CONTENT_HASH_LEN: usize = 16;
const STREAM_DIGEST_LEN: usize = 32;

/// Identity of a deduplicated chunk.
///
/// `hash0`/`hash1` are the two little-endian halves of the 16-byte
/// content hash; `rolling` is the rolling-hash digest over the same
/// bytes. The full tuple, size included, is the equality key: the
/// rolling hash alone is only a probe filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkId {
    pub hash0: u64,
    pub hash1: u64,
    pub rolling: u64,
    pub size: u32,
}

impl ChunkId {
    /// Builds an id from a chunk's bytes, given as the (possibly
    /// wrapped) two-slice region the ring buffer hands out.
    pub fn from_region(region: (&[u8], &[u8]), rolling: u64) -> Self {
        let (hash0, hash1) = content_hash(region);
        ChunkId {
            hash0,
            hash1,
            rolling,
            size: (region.0.len() + region.1.len()) as u32,
        }
    }

    /// The 24-byte wire form: hash0, hash1, rolling, all little-endian.
    /// The size travels separately beside it.
    pub fn to_wire(&self) -> [u8; CHUNK_ID_WIRE_LEN] {
        let mut out = [0u8; CHUNK_ID_WIRE_LEN];
        out[0..8].copy_from_slice(&self.hash0.to_le_bytes());
        out[8..16].copy_from_slice(&self.hash1.to_le_bytes());
        out[16..24].copy_from_slice(&self.rolling.to_le_bytes());
        out
    }

    pub fn from_wire(wire: &[u8; CHUNK_ID_WIRE_LEN], size: u32) -> Self {
        ChunkId {
            hash0: u64::from_le_bytes(wire[0..8].try_into().unwrap()),
            hash1: u64::from_le_bytes(wire[8..16].try_into().unwrap()),
            rolling: u64::from_le_bytes(wire[16..24].try_into().unwrap()),
            size,
        }
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", hex::encode(self.to_wire()), self.size)
    }
}

/// 16-byte content hash split into two little-endian u64 halves.
pub fn content_hash(region: (&[u8], &[u8])) -> (u64, u64) {
    let mut hasher = Blake2bVar::new(CONTENT_HASH_LEN).expect("valid output length");
    hasher.update(region.0);
    hasher.update(region.1);
    let mut out = [0u8; CONTENT_HASH_LEN];
    hasher
        .finalize_variable(&mut out)
        .expect("matching output length");
    (
        u64::from_le_bytes(out[0..8].try_into().unwrap()),
        u64::from_le_bytes(out[8..16].try_into().unwrap()),
    )
}

/// Incremental 32-byte digest over a whole stream, recorded in the
/// backup descriptor and checked after restore.
pub struct StreamDigest {
    hasher: Blake2bVar,
    length: u64,
}

impl StreamDigest {
    pub fn new() -> Self {
        StreamDigest {
            hasher: Blake2bVar::new(STREAM_DIGEST_LEN).expect("valid output length"),
            length: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.length += data.len() as u64;
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn finalize(self) -> [u8; STREAM_DIGEST_LEN] {
        let mut out = [0u8; STREAM_DIGEST_LEN];
        self.hasher
            .finalize_variable(&mut out)
            .expect("matching output length");
        out
    }
}

impl Default for StreamDigest {
    fn default() -> Self {
        StreamDigest::new()
    }
}

/// Identity of a persisted bundle: 24 random bytes, assigned only when
/// the bundle blob moves to its final location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BundleId(pub [u8; BUNDLE_ID_LEN]);

impl BundleId {
    pub fn random() -> Self {
        let mut bytes = [0u8; BUNDLE_ID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        BundleId(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Two-hex-digit directory shard, taken from the first byte.
    pub fn shard_prefix(&self) -> String {
        format!("{:02x}", self.0[0])
    }

    /// Storage key of this bundle's blob relative to the store root.
    pub fn storage_key(&self) -> String {
        format!("bundles/{}/{}", self.shard_prefix(), self.to_hex())
    }
}

impl fmt::Display for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_round_trip() {
        let id = ChunkId {
            hash0: 0x0123_4567_89ab_cdef,
            hash1: 0xfedc_ba98_7654_3210,
            rolling: 0xdead_beef_cafe_f00d,
            size: 65536,
        };
        let wire = id.to_wire();
        assert_eq!(ChunkId::from_wire(&wire, id.size), id);
        assert_eq!(&wire[0..8], &id.hash0.to_le_bytes());
    }

    #[test]
    fn region_id_ignores_split_point() {
        let data = b"some chunk payload that wraps around the ring";
        let whole = ChunkId::from_region((data, &[]), 42);
        let split = ChunkId::from_region((&data[..13], &data[13..]), 42);
        assert_eq!(whole, split);
        assert_eq!(whole.size as usize, data.len());
    }

    #[test]
    fn size_distinguishes_ids() {
        let a = ChunkId::from_region((b"aaaa", &[]), 1);
        let mut b = a;
        b.size += 1;
        assert_ne!(a, b);
    }

    #[test]
    fn bundle_id_rendering() {
        let id = BundleId([0xab; BUNDLE_ID_LEN]);
        assert_eq!(id.to_hex().len(), 48);
        assert_eq!(id.shard_prefix(), "ab");
        assert_eq!(id.storage_key(), format!("bundles/ab/{}", id.to_hex()));
    }

    #[test]
    fn stream_digest_tracks_length() {
        let mut digest = StreamDigest::new();
        digest.update(b"hello ");
        digest.update(b"world");
        assert_eq!(digest.length(), 11);

        let mut whole = StreamDigest::new();
        whole.update(b"hello world");
        assert_eq!(digest.finalize(), whole.finalize());
    }
}
