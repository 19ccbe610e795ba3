use std::io::Read;

use crate::chunk_id::{content_hash, ChunkId, StreamDigest};
use crate::config::MIN_CHUNK_SIZE;
use crate::error::Result;
use crate::instruction::Instruction;
use crate::ring::RingBuffer;
use crate::rollhash::RollingHash;

/// What the chunker needs from the store: the two-stage dedup lookup
/// and a sink for freshly cut chunks.
pub trait ChunkStore {
    /// Rolling-hash probe; false positives are allowed.
    fn probe(&self, rolling: u64) -> bool;
    /// Full-identity lookup.
    fn lookup(&self, rolling: u64, hash0: u64, hash1: u64, size: u32) -> Option<ChunkId>;
    /// Registers a new chunk, handing over its bytes as a wrapped ring
    /// region.
    fn save_chunk(&mut self, id: ChunkId, region: (&[u8], &[u8])) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ChunkerStats {
    pub found_chunks: u64,
    pub false_positives: u64,
    pub short_chunks: u64,
}

/// Result of chunking one stream.
pub struct ChunkedStream {
    pub instructions: Vec<Instruction>,
    /// Bytes consumed from the input.
    pub length: u64,
    /// 32-byte digest over the whole input.
    pub digest: [u8; 32],
    pub stats: ChunkerStats,
}

/// Content-defined chunker with a provisional-chunk phase and a
/// boundary-probe phase running over the same window.
///
/// Three cursors walk a ring of 4x the chunk limit:
///
/// ```text
///   [..........................................]
///      ^chunk_tail     ^hash_tail      ^hash_head
///      |-- provisional --|-- probe window W --|
/// ```
///
/// Bytes enter at `hash_head`. Until the window holds `max_chunk_size`
/// bytes it only grows (`roll_in`); afterwards it slides (`rotate`),
/// growing the provisional chunk one byte per step. Every full window
/// position is probed against the index; a verified match emits the
/// provisional chunk (dedup-saved) and the matched reference, then
/// restarts the window. When the provisional chunk reaches the limit it
/// is force-cut using the rolling digest cached the moment the window
/// last filled, which at that point covers exactly the cut bytes.
pub struct Chunker {
    max_chunk_size: usize,
    ring: RingBuffer,
    hash: RollingHash,
    hash_head: usize,
    hash_tail: usize,
    chunk_tail: usize,
    chunk_length: usize,
    hash_length: usize,
    /// Rolling digest of the full window, cached when it fills.
    next_chunk_hash: u64,
    instructions: Vec<Instruction>,
    digest: StreamDigest,
    stats: ChunkerStats,
}

impl Chunker {
    pub fn new(max_chunk_size: usize) -> Self {
        debug_assert!(max_chunk_size >= MIN_CHUNK_SIZE);
        Chunker {
            max_chunk_size,
            ring: RingBuffer::new(max_chunk_size * 4),
            hash: RollingHash::new(),
            hash_head: 0,
            hash_tail: 0,
            chunk_tail: 0,
            chunk_length: 0,
            hash_length: 0,
            next_chunk_hash: 0,
            instructions: Vec::new(),
            digest: StreamDigest::new(),
            stats: ChunkerStats::default(),
        }
    }

    /// Consumes `input` to the end, producing the instruction stream.
    pub fn run<S: ChunkStore>(
        mut self,
        input: &mut impl Read,
        store: &mut S,
    ) -> Result<ChunkedStream> {
        loop {
            let head = self.hash_head;
            let tail = self.chunk_tail;
            let read = match input.read(self.ring.free_span(head, tail)) {
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            if read == 0 {
                break;
            }
            {
                let (span, wrapped) = self.ring.region(head, read);
                debug_assert!(wrapped.is_empty());
                self.digest.update(span);
            }

            for _ in 0..read {
                if self.hash_length == self.max_chunk_size {
                    self.advance_hash(store)?;
                } else {
                    self.read_in_hash();
                }
                if self.hash_length >= self.max_chunk_size {
                    self.check_match(store)?;
                }
            }
        }

        if self.chunk_length > 0 {
            let rolling = self.ring.digest_region(self.chunk_tail, self.chunk_length);
            self.flush_chunk(self.chunk_tail, self.chunk_length, rolling, store)?;
        }
        if self.hash_head != self.hash_tail {
            let rolling = self.ring.digest_region(self.hash_tail, self.hash_length);
            self.flush_chunk(self.hash_tail, self.hash_length, rolling, store)?;
        }

        tracing::debug!(
            length = self.digest.length(),
            found = self.stats.found_chunks,
            false_positives = self.stats.false_positives,
            short = self.stats.short_chunks,
            "chunker finished"
        );
        let length = self.digest.length();
        Ok(ChunkedStream {
            instructions: self.instructions,
            length,
            digest: self.digest.finalize(),
            stats: self.stats,
        })
    }

    /// Slides the full window one byte, growing the provisional chunk;
    /// force-cuts when the chunk reaches the limit.
    fn advance_hash<S: ChunkStore>(&mut self, store: &mut S) -> Result<()> {
        let incoming = self.ring.get(self.hash_head);
        let outgoing = self.ring.get(self.hash_tail);
        self.hash.rotate(incoming, outgoing);
        self.hash_head = self.ring.next(self.hash_head);
        self.hash_tail = self.ring.next(self.hash_tail);
        self.chunk_length += 1;

        if self.chunk_length == self.max_chunk_size {
            // The cached digest covers exactly these bytes: the window
            // filled right where the chunk now ends.
            let rolling = self.next_chunk_hash;
            self.flush_chunk(self.chunk_tail, self.chunk_length, rolling, store)?;
            self.next_chunk_hash = self.hash.digest();
            self.chunk_tail = self.hash_tail;
            self.chunk_length = 0;
        }
        Ok(())
    }

    /// Grows the window by the byte at `hash_head`.
    fn read_in_hash(&mut self) {
        let incoming = self.ring.get(self.hash_head);
        self.hash.roll_in(incoming);
        self.hash_head = self.ring.next(self.hash_head);
        self.hash_length += 1;

        if self.hash_length == self.max_chunk_size {
            self.next_chunk_hash = self.hash.digest();
        }
    }

    /// Probes the current full window against the index; on a verified
    /// hit, emits the provisional chunk and the matched reference, then
    /// restarts the window after the match.
    fn check_match<S: ChunkStore>(&mut self, store: &mut S) -> Result<()> {
        let rolling = self.hash.digest();
        if !store.probe(rolling) {
            return Ok(());
        }
        let (hash0, hash1) = content_hash(self.ring.region(self.hash_tail, self.hash_length));
        match store.lookup(rolling, hash0, hash1, self.hash_length as u32) {
            Some(found) => {
                self.stats.found_chunks += 1;
                if self.chunk_tail != self.hash_tail {
                    let part = self.ring.digest_region(self.chunk_tail, self.chunk_length);
                    self.flush_chunk(self.chunk_tail, self.chunk_length, part, store)?;
                    self.chunk_length = 0;
                }
                self.instructions.push(Instruction::Chunk(found));
                self.hash = RollingHash::new();
                self.chunk_tail = self.hash_head;
                self.hash_tail = self.hash_head;
                self.hash_length = 0;
            }
            None => {
                self.stats.false_positives += 1;
                tracing::debug!(rolling, "rolling hash false positive");
            }
        }
        Ok(())
    }

    /// Emits a region as a dedup-saved chunk, or as literal bytes when
    /// it is too short to be worth indexing.
    fn flush_chunk<S: ChunkStore>(
        &mut self,
        offset: usize,
        length: usize,
        rolling: u64,
        store: &mut S,
    ) -> Result<()> {
        if length < MIN_CHUNK_SIZE {
            self.stats.short_chunks += 1;
            self.instructions
                .push(Instruction::Bytes(self.ring.copy_region(offset, length)));
            return Ok(());
        }
        let region = self.ring.region(offset, length);
        let (hash0, hash1) = content_hash(region);
        match store.lookup(rolling, hash0, hash1, length as u32) {
            Some(prev) => {
                self.stats.found_chunks += 1;
                self.instructions.push(Instruction::Chunk(prev));
            }
            None => {
                let id = ChunkId {
                    hash0,
                    hash1,
                    rolling,
                    size: length as u32,
                };
                store.save_chunk(id, region)?;
                self.instructions.push(Instruction::Chunk(id));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{RngCore, SeedableRng};
    use std::collections::HashMap;

    /// Plain map-backed chunk store for driving the chunker alone.
    #[derive(Default)]
    struct MapStore {
        chunks: HashMap<ChunkId, Vec<u8>>,
        saved: usize,
    }

    impl ChunkStore for MapStore {
        fn probe(&self, rolling: u64) -> bool {
            self.chunks.keys().any(|id| id.rolling == rolling)
        }

        fn lookup(&self, rolling: u64, hash0: u64, hash1: u64, size: u32) -> Option<ChunkId> {
            let id = ChunkId {
                hash0,
                hash1,
                rolling,
                size,
            };
            self.chunks.contains_key(&id).then_some(id)
        }

        fn save_chunk(&mut self, id: ChunkId, region: (&[u8], &[u8])) -> Result<()> {
            let mut data = region.0.to_vec();
            data.extend_from_slice(region.1);
            assert_eq!(data.len(), id.size as usize);
            self.chunks.insert(id, data);
            self.saved += 1;
            Ok(())
        }
    }

    fn reassemble(instructions: &[Instruction], store: &MapStore) -> Vec<u8> {
        let mut out = Vec::new();
        for instruction in instructions {
            match instruction {
                Instruction::Bytes(data) => out.extend_from_slice(data),
                Instruction::Chunk(id) => out.extend_from_slice(&store.chunks[id]),
            }
        }
        out
    }

    fn random_data(len: usize, seed: u64) -> Vec<u8> {
        let mut data = vec![0u8; len];
        StdRng::seed_from_u64(seed).fill_bytes(&mut data);
        data
    }

    #[test]
    fn round_trip_random_stream() {
        let data = random_data(64 * 1024 + 777, 1);
        let mut store = MapStore::default();
        let outcome = Chunker::new(4096)
            .run(&mut &data[..], &mut store)
            .unwrap();

        assert_eq!(outcome.length, data.len() as u64);
        assert_eq!(reassemble(&outcome.instructions, &store), data);

        let mut digest = StreamDigest::new();
        digest.update(&data);
        assert_eq!(outcome.digest, digest.finalize());
    }

    #[test]
    fn chunk_sizes_respect_bounds() {
        let data = random_data(40_000, 2);
        let mut store = MapStore::default();
        let outcome = Chunker::new(4096).run(&mut &data[..], &mut store).unwrap();

        let mut total = 0usize;
        for instruction in &outcome.instructions {
            match instruction {
                Instruction::Chunk(id) => {
                    assert!(id.size as usize >= MIN_CHUNK_SIZE);
                    assert!(id.size as usize <= 4096);
                    total += id.size as usize;
                }
                Instruction::Bytes(bytes) => {
                    assert!(bytes.len() < MIN_CHUNK_SIZE);
                    total += bytes.len();
                }
            }
        }
        assert_eq!(total, data.len());
    }

    #[test]
    fn boundaries_are_deterministic() {
        let data = random_data(30_000, 3);
        let mut store_a = MapStore::default();
        let a = Chunker::new(2048).run(&mut &data[..], &mut store_a).unwrap();
        let mut store_b = MapStore::default();
        let b = Chunker::new(2048).run(&mut &data[..], &mut store_b).unwrap();
        assert_eq!(a.instructions, b.instructions);
    }

    #[test]
    fn second_run_is_pure_references() {
        let data = random_data(20_000, 4);
        let mut store = MapStore::default();
        let first = Chunker::new(1024).run(&mut &data[..], &mut store).unwrap();
        let saved_after_first = store.saved;

        let second = Chunker::new(1024).run(&mut &data[..], &mut store).unwrap();
        assert_eq!(store.saved, saved_after_first, "no new chunks on rerun");
        assert!(second
            .instructions
            .iter()
            .all(|i| matches!(i, Instruction::Chunk(_))));
        assert_eq!(reassemble(&second.instructions, &store), data);
        assert!(second.stats.found_chunks > 0);
    }

    #[test]
    fn shifted_content_still_dedups() {
        let shared = random_data(16_384, 5);
        let mut store = MapStore::default();
        Chunker::new(1024).run(&mut &shared[..], &mut store).unwrap();
        let saved_after_first = store.saved;

        // Same content behind an unaligned prefix: the sliding probe
        // must resynchronize onto the known chunks.
        let mut shifted = random_data(701, 6);
        shifted.extend_from_slice(&shared);
        let outcome = Chunker::new(1024).run(&mut &shifted[..], &mut store).unwrap();

        assert!(outcome.stats.found_chunks > 0);
        assert!(store.saved > saved_after_first, "prefix makes some new chunks");
        assert_eq!(reassemble(&outcome.instructions, &store), shifted);
    }

    #[test]
    fn tiny_input_is_literal() {
        let data = b"shorter than the minimum".to_vec();
        let mut store = MapStore::default();
        let outcome = Chunker::new(1024).run(&mut &data[..], &mut store).unwrap();
        assert_eq!(store.saved, 0);
        assert_eq!(
            outcome.instructions,
            vec![Instruction::Bytes(data.clone())]
        );
    }

    #[test]
    fn empty_input() {
        let mut store = MapStore::default();
        let outcome = Chunker::new(1024).run(&mut &b""[..], &mut store).unwrap();
        assert!(outcome.instructions.is_empty());
        assert_eq!(outcome.length, 0);
    }

    #[test]
    fn repetitive_input_dedups_against_itself() {
        // 1 KiB block repeated 8 times with the window equal to the
        // block size: after the first block everything should match.
        let block = random_data(1024, 7);
        let mut data = Vec::new();
        for _ in 0..8 {
            data.extend_from_slice(&block);
        }
        let mut store = MapStore::default();
        let outcome = Chunker::new(1024).run(&mut &data[..], &mut store).unwrap();
        assert!(outcome.stats.found_chunks >= 6);
        assert_eq!(reassemble(&outcome.instructions, &store), data);
    }
}
