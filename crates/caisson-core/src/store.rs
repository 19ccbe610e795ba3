use std::sync::{Arc, Mutex};

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::bundle::Bundle;
use crate::chunk_id::{BundleId, ChunkId};
use crate::chunker::ChunkStore;
use crate::compress::Compression;
use crate::config::{StoreConfig, StoreSettings};
use crate::error::{CaissonError, Result};
use crate::index::{build_index, ChunkIndex, IndexEntry};
use crate::index_file;
use crate::storage::{StorageBackend, INDEX_PREFIX, SETTINGS_KEY, TMP_PREFIX};
use crate::wire::{FrameReader, FrameWriter};
use crate::workers::{Permits, Promise, WorkerPool};

/// What one finished backup run changed on disk.
#[derive(Debug, Clone, Copy)]
pub struct FinishReport {
    pub new_bundles: usize,
}

/// Coordinator for one store: the in-memory chunk index, the bundle
/// being filled, and the persistence pipeline.
///
/// Chunk saves come in single-threaded from the chunker. A full bundle
/// is handed to the worker pool, which compresses it, erasure-encodes
/// it and writes it to `tmp/`; a counting permit bounds how many such
/// encodes are in flight, throttling the chunker when persistence lags.
/// Nothing gets its final name before `finish`, so an interrupted run
/// leaves only unreferenced temporaries behind.
pub struct BundleStore {
    storage: Arc<dyn StorageBackend>,
    config: StoreConfig,
    pool: Arc<WorkerPool>,
    index: Box<dyn ChunkIndex>,
    current: Bundle,
    pending: Arc<Mutex<Vec<(String, Vec<ChunkId>)>>>,
    inflight: Vec<Promise<()>>,
    permits: Arc<Permits>,
    has_settings: bool,
}

impl BundleStore {
    /// Opens a store: applies persisted settings over `config`, then
    /// loads every index file under `index/` before the first lookup.
    pub fn open(
        storage: Arc<dyn StorageBackend>,
        mut config: StoreConfig,
        pool: Arc<WorkerPool>,
    ) -> Result<Self> {
        let has_settings = match storage.get(SETTINGS_KEY)? {
            Some(data) => {
                let settings = decode_settings(&data)?;
                config.apply_settings(&settings);
                true
            }
            None => false,
        };
        config.validate()?;

        let mut entries = Vec::new();
        let mut keys = storage.list(INDEX_PREFIX)?;
        keys.sort();
        for key in keys {
            for (bundle, toc) in index_file::load(&*storage, &key)? {
                for id in toc {
                    entries.push(IndexEntry {
                        id,
                        bundle: Some(bundle),
                    });
                }
            }
        }
        tracing::info!(chunks = entries.len(), "store opened");

        let current = Bundle::new(config.bundle_max_payload);
        let permits = Arc::new(Permits::new(config.max_inflight_bundles));
        Ok(BundleStore {
            storage,
            index: build_index(entries),
            current,
            permits,
            pending: Arc::new(Mutex::new(Vec::new())),
            inflight: Vec::new(),
            has_settings,
            config,
            pool,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    pub fn chunk_count(&self) -> usize {
        self.index.len()
    }

    /// Maps a chunk reference to the bundle holding it. Chunks packed
    /// by an unfinished run have no bundle yet and cannot be restored.
    pub fn resolve_bundle(&self, id: &ChunkId) -> Result<BundleId> {
        self.index
            .exact_lookup(id.rolling, id.hash0, id.hash1, id.size)
            .and_then(|entry| entry.bundle)
            .ok_or(CaissonError::MissingChunkReference(*id))
    }

    /// Schedules an async decode of a bundle blob.
    pub fn load_bundle(&self, bundle: BundleId) -> Promise<Bundle> {
        let storage = Arc::clone(&self.storage);
        self.pool.submit(move || {
            let key = bundle.storage_key();
            let data = storage.get(&key)?.ok_or_else(|| CaissonError::CorruptBundle {
                file: key.clone(),
                reason: "bundle blob missing".to_string(),
            })?;
            Bundle::decode(&data, &key)
        })
    }

    /// Hands the currently filling bundle to the persistence pipeline.
    fn seal_current(&mut self) -> Result<()> {
        let bundle = std::mem::replace(
            &mut self.current,
            Bundle::new(self.config.bundle_max_payload),
        );
        if bundle.is_empty() {
            return Ok(());
        }
        let compression = Compression::from_config(
            &self.config.compression_method,
            self.config.compression_level,
        )?;
        let parity = self.config.erasure_parity;

        self.permits.acquire();
        let storage = Arc::clone(&self.storage);
        let pending = Arc::clone(&self.pending);
        let permits = Arc::clone(&self.permits);
        let promise = self.pool.submit(move || {
            let result = (|| {
                let blob = bundle.encode(compression, parity)?;
                let tmp_key = format!("{TMP_PREFIX}/{}", random_name());
                storage.put(&tmp_key, &blob)?;
                tracing::debug!(
                    payload = bundle.payload_len(),
                    blob = blob.len(),
                    "bundle persisted to temporary"
                );
                pending.lock().unwrap().push((tmp_key, bundle.toc().to_vec()));
                Ok(())
            })();
            permits.release();
            result
        });
        self.inflight.push(promise);
        Ok(())
    }

    /// Flushes the partial bundle, waits for every persistence task,
    /// then assigns random ids, moves the blobs into their sharded
    /// final locations and writes one index file covering the run.
    pub fn finish(&mut self) -> Result<FinishReport> {
        self.seal_current()?;
        for promise in self.inflight.drain(..) {
            promise.wait()?;
        }

        let pending = std::mem::take(&mut *self.pending.lock().unwrap());
        let mut records = Vec::with_capacity(pending.len());
        for (tmp_key, toc) in pending {
            let id = BundleId::random();
            self.storage.rename(&tmp_key, &id.storage_key())?;
            records.push((id, toc));
        }
        if !records.is_empty() {
            let index_key = format!("{INDEX_PREFIX}/{}", BundleId::random().to_hex());
            index_file::write(&*self.storage, &index_key, &records)?;
        }
        if !self.has_settings {
            self.storage
                .put(SETTINGS_KEY, &encode_settings(&self.config.settings())?)?;
            self.has_settings = true;
        }
        tracing::info!(bundles = records.len(), "run persisted");
        Ok(FinishReport {
            new_bundles: records.len(),
        })
    }
}

impl ChunkStore for BundleStore {
    fn probe(&self, rolling: u64) -> bool {
        self.index.approx_contains(rolling)
    }

    fn lookup(&self, rolling: u64, hash0: u64, hash1: u64, size: u32) -> Option<ChunkId> {
        self.index
            .exact_lookup(rolling, hash0, hash1, size)
            .map(|entry| entry.id)
    }

    fn save_chunk(&mut self, id: ChunkId, region: (&[u8], &[u8])) -> Result<()> {
        self.index.insert(IndexEntry { id, bundle: None });
        if !self.current.has_room(id.size as usize) {
            self.seal_current()?;
        }
        if !self.current.add_chunk(region, id) {
            return Err(CaissonError::Other(format!(
                "chunk of {} bytes exceeds bundle capacity {}",
                id.size, self.config.bundle_max_payload
            )));
        }
        Ok(())
    }
}

fn random_name() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect()
}

fn encode_settings(settings: &StoreSettings) -> Result<Vec<u8>> {
    let mut writer = FrameWriter::new();
    writer.put_record(settings)?;
    writer.put_checksum();
    Ok(writer.into_inner())
}

fn decode_settings(data: &[u8]) -> Result<StoreSettings> {
    let mut reader = FrameReader::new(data, SETTINGS_KEY);
    let settings: StoreSettings = reader.take_record()?;
    reader.verify_checksum()?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollhash::RollingHash;
    use crate::storage::BUNDLES_PREFIX;
    use crate::testutil::MemoryBackend;

    fn chunk_of(data: &[u8]) -> ChunkId {
        ChunkId::from_region(
            (data, &[]),
            RollingHash::digest_buffer(data, 0, data.len()),
        )
    }

    fn open_store(storage: &Arc<MemoryBackend>) -> BundleStore {
        let mut config = StoreConfig::default();
        config.chunk_max_size = 1 << 10;
        config.bundle_max_payload = 1 << 12;
        config.compression_method = "zero".to_string();
        let backend: Arc<dyn StorageBackend> = Arc::clone(storage) as Arc<dyn StorageBackend>;
        BundleStore::open(backend, config, Arc::new(WorkerPool::new(2))).unwrap()
    }

    #[test]
    fn pack_finish_reopen_restore_chunk() {
        let storage = Arc::new(MemoryBackend::new());
        let mut store = open_store(&storage);

        let data = vec![0x5au8; 900];
        let id = chunk_of(&data);
        store.save_chunk(id, (&data, &[])).unwrap();
        assert!(store.lookup(id.rolling, id.hash0, id.hash1, id.size).is_some());
        // Unfinished: the chunk is indexed but not restorable yet.
        assert!(matches!(
            store.resolve_bundle(&id),
            Err(CaissonError::MissingChunkReference(_))
        ));

        let report = store.finish().unwrap();
        assert_eq!(report.new_bundles, 1);
        assert_eq!(storage.keys("bundles/").len(), 1);
        assert_eq!(storage.keys("index/").len(), 1);
        assert!(storage.get(SETTINGS_KEY).unwrap().is_some());
        assert!(storage.keys("tmp/").is_empty());

        let reopened = open_store(&storage);
        assert_eq!(reopened.chunk_count(), 1);
        let bundle_id = reopened.resolve_bundle(&id).unwrap();
        let bundle = reopened.load_bundle(bundle_id).wait().unwrap();
        assert_eq!(bundle.chunk_bytes(&id).unwrap(), &data[..]);
    }

    #[test]
    fn full_bundles_roll_over() {
        let storage = Arc::new(MemoryBackend::new());
        let mut store = open_store(&storage);

        // 6 chunks of 1 KiB against a 4 KiB payload bound.
        for i in 0..6u8 {
            let data = vec![i; 1024];
            store.save_chunk(chunk_of(&data), (&data, &[])).unwrap();
        }
        let report = store.finish().unwrap();
        assert!(report.new_bundles >= 2);
        assert_eq!(storage.keys("bundles/").len(), report.new_bundles);
        assert_eq!(storage.keys("index/").len(), 1);
    }

    #[test]
    fn empty_finish_writes_no_bundles() {
        let storage = Arc::new(MemoryBackend::new());
        let mut store = open_store(&storage);
        let report = store.finish().unwrap();
        assert_eq!(report.new_bundles, 0);
        assert!(storage.keys(&format!("{BUNDLES_PREFIX}/")).is_empty());
        assert!(storage.keys("index/").is_empty());
    }

    #[test]
    fn settings_survive_reopen() {
        let storage = Arc::new(MemoryBackend::new());
        let mut store = open_store(&storage);
        let data = vec![1u8; 512];
        store.save_chunk(chunk_of(&data), (&data, &[])).unwrap();
        store.finish().unwrap();

        // Reopen with defaults: persisted settings win.
        let backend: Arc<dyn StorageBackend> = Arc::clone(&storage) as Arc<dyn StorageBackend>;
        let reopened = BundleStore::open(
            backend,
            StoreConfig::default(),
            Arc::new(WorkerPool::new(1)),
        )
        .unwrap();
        assert_eq!(reopened.config().compression_method, "zero");
        assert_eq!(reopened.config().bundle_max_payload, 1 << 12);
    }

    #[test]
    fn unknown_chunk_is_missing_reference() {
        let storage = Arc::new(MemoryBackend::new());
        let store = open_store(&storage);
        let id = chunk_of(b"never stored, but long enough to matter");
        assert!(matches!(
            store.resolve_bundle(&id),
            Err(CaissonError::MissingChunkReference(_))
        ));
    }
}
