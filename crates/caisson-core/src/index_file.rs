//! Persisted chunk index files under `index/`. Each file lists, for
//! every bundle written by one run, the bundle id and its ordered table
//! of contents. Startup loads all of them; the store never rewrites an
//! existing index file.

use serde::{Deserialize, Serialize};

use crate::chunk_id::{BundleId, ChunkId};
use crate::error::{CaissonError, Result};
use crate::storage::StorageBackend;
use crate::wire::{FrameReader, FrameWriter};

pub const INDEX_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct IndexFileHeader {
    version: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct BundleRecord {
    bundle: BundleId,
    toc: Vec<ChunkId>,
}

pub fn write(
    storage: &dyn StorageBackend,
    key: &str,
    bundles: &[(BundleId, Vec<ChunkId>)],
) -> Result<()> {
    let mut writer = FrameWriter::new();
    writer.put_record(&IndexFileHeader {
        version: INDEX_FORMAT_VERSION,
    })?;
    for (bundle, toc) in bundles {
        writer.put_record(&BundleRecord {
            bundle: *bundle,
            toc: toc.clone(),
        })?;
    }
    writer.put_terminator();
    writer.put_checksum();
    storage.put(key, &writer.into_inner())
}

pub fn load(storage: &dyn StorageBackend, key: &str) -> Result<Vec<(BundleId, Vec<ChunkId>)>> {
    let data = storage
        .get(key)?
        .ok_or_else(|| CaissonError::Other(format!("index file '{key}' disappeared")))?;
    let mut reader = FrameReader::new(&data, key);
    let header: IndexFileHeader = reader.take_record()?;
    if header.version != INDEX_FORMAT_VERSION {
        return Err(CaissonError::CorruptBundle {
            file: key.to_string(),
            reason: format!("unsupported index version {}", header.version),
        });
    }
    let mut bundles = Vec::new();
    while let Some(record) = reader.take_optional_record::<BundleRecord>()? {
        bundles.push((record.bundle, record.toc));
    }
    reader.verify_checksum()?;
    Ok(bundles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MemoryBackend;

    fn toc(seed: u64, count: u32) -> Vec<ChunkId> {
        (0..count)
            .map(|i| ChunkId {
                hash0: seed + i as u64,
                hash1: seed ^ 0xffff,
                rolling: seed * 31 + i as u64,
                size: 512 + i,
            })
            .collect()
    }

    #[test]
    fn round_trip() {
        let storage = MemoryBackend::new();
        let bundles = vec![
            (BundleId([1; 24]), toc(100, 3)),
            (BundleId([2; 24]), toc(200, 0)),
            (BundleId([3; 24]), toc(300, 7)),
        ];
        write(&storage, "index/run1", &bundles).unwrap();
        assert_eq!(load(&storage, "index/run1").unwrap(), bundles);
    }

    #[test]
    fn empty_file_round_trips() {
        let storage = MemoryBackend::new();
        write(&storage, "index/empty", &[]).unwrap();
        assert!(load(&storage, "index/empty").unwrap().is_empty());
    }

    #[test]
    fn corruption_detected() {
        let storage = MemoryBackend::new();
        write(&storage, "index/run1", &[(BundleId([9; 24]), toc(1, 4))]).unwrap();
        storage.tamper("index/run1", |data| {
            let mid = data.len() / 2;
            data[mid] ^= 0x01;
        });
        assert!(load(&storage, "index/run1").is_err());
    }

    #[test]
    fn truncation_detected() {
        let storage = MemoryBackend::new();
        write(&storage, "index/run1", &[(BundleId([9; 24]), toc(1, 4))]).unwrap();
        storage.tamper("index/run1", |data| data.truncate(6));
        assert!(matches!(
            load(&storage, "index/run1"),
            Err(CaissonError::UnexpectedEndOfInput(_))
        ));
    }
}
