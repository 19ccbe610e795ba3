use smallvec::SmallVec;

use crate::chunk_id::{BundleId, ChunkId};

/// One known chunk. The bundle id is present only for chunks loaded
/// from persisted index files; chunks packed during the current run get
/// their bundle id at persist time and are never looked up by bundle
/// within the same run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub id: ChunkId,
    pub bundle: Option<BundleId>,
}

/// In-memory chunk lookup, append-only for the duration of a run.
///
/// `approx_contains` answers by rolling hash alone and may report
/// false positives; `exact_lookup` compares the full identity tuple.
pub trait ChunkIndex: Send {
    fn approx_contains(&self, rolling: u64) -> bool;
    fn exact_lookup(&self, rolling: u64, hash0: u64, hash1: u64, size: u32) -> Option<&IndexEntry>;
    fn insert(&mut self, entry: IndexEntry);
    fn len(&self) -> usize;
}

/// Picks an implementation by initial size: open addressing keeps small
/// indexes dense, the stacked variant tolerates the clustering that
/// long probe runs cause at scale.
pub fn build_index(entries: Vec<IndexEntry>) -> Box<dyn ChunkIndex> {
    if entries.len() < (1 << 22) {
        Box::new(LinearProbeIndex::new(entries))
    } else {
        Box::new(StackedIndex::new(entries))
    }
}

const TABLE_CAP_BITS: u32 = 30;

fn table_bits(count: usize, floor_bits: u32) -> u32 {
    let mut bits = floor_bits;
    while bits < TABLE_CAP_BITS + 1 {
        if (1usize << bits) > count {
            break;
        }
        bits += 1;
    }
    bits
}

/// Open-addressing table with linear probing, keyed by the low bits of
/// the rolling hash. Doubles when the entry count exceeds the table
/// length, capped at 2^30 slots.
pub struct LinearProbeIndex {
    slots: Vec<Option<IndexEntry>>,
    mask: usize,
    count: usize,
}

impl LinearProbeIndex {
    const FLOOR_BITS: u32 = 20;

    pub fn new(entries: Vec<IndexEntry>) -> Self {
        Self::with_floor(entries, Self::FLOOR_BITS)
    }

    fn with_floor(entries: Vec<IndexEntry>, floor_bits: u32) -> Self {
        let size = 1usize << table_bits(entries.len(), floor_bits);
        let mut index = LinearProbeIndex {
            slots: vec![None; size],
            mask: size - 1,
            count: entries.len(),
        };
        for entry in entries {
            Self::place(&mut index.slots, index.mask, entry);
        }
        index
    }

    fn place(slots: &mut [Option<IndexEntry>], mask: usize, entry: IndexEntry) {
        let mut idx = entry.id.rolling as usize & mask;
        while slots[idx].is_some() {
            idx = (idx + 1) & mask;
        }
        slots[idx] = Some(entry);
    }

    fn grow(&mut self) {
        tracing::debug!(count = self.count, "chunk index resize");
        let size = self.slots.len() << 1;
        let mask = size - 1;
        let mut slots = vec![None; size];
        for entry in self.slots.drain(..).flatten() {
            Self::place(&mut slots, mask, entry);
        }
        self.slots = slots;
        self.mask = mask;
    }
}

impl ChunkIndex for LinearProbeIndex {
    fn approx_contains(&self, rolling: u64) -> bool {
        let mut idx = rolling as usize & self.mask;
        while let Some(entry) = &self.slots[idx] {
            if entry.id.rolling == rolling {
                return true;
            }
            idx = (idx + 1) & self.mask;
        }
        false
    }

    fn exact_lookup(&self, rolling: u64, hash0: u64, hash1: u64, size: u32) -> Option<&IndexEntry> {
        let mut idx = rolling as usize & self.mask;
        while let Some(entry) = &self.slots[idx] {
            if entry.id.rolling == rolling
                && entry.id.hash0 == hash0
                && entry.id.hash1 == hash1
                && entry.id.size == size
            {
                return self.slots[idx].as_ref();
            }
            idx = (idx + 1) & self.mask;
        }
        None
    }

    fn insert(&mut self, entry: IndexEntry) {
        Self::place(&mut self.slots, self.mask, entry);
        self.count += 1;
        // Must grow before the table fills completely or probing for an
        // absent key would never hit an empty slot.
        if self.count >= self.slots.len() && self.slots.len() != 1 << TABLE_CAP_BITS {
            self.grow();
        }
    }

    fn len(&self) -> usize {
        self.count
    }
}

type Bucket = SmallVec<[IndexEntry; 1]>;

/// Chained variant: each slot holds a growable bucket behind one
/// pointer, so a vacant slot costs a machine word and probe runs never
/// cross slots.
pub struct StackedIndex {
    slots: Vec<Option<Box<Bucket>>>,
    mask: usize,
    count: usize,
}

impl StackedIndex {
    const FLOOR_BITS: u32 = 26;

    pub fn new(entries: Vec<IndexEntry>) -> Self {
        Self::with_floor(entries, Self::FLOOR_BITS)
    }

    fn with_floor(entries: Vec<IndexEntry>, floor_bits: u32) -> Self {
        let size = 1usize << table_bits(entries.len(), floor_bits);
        let mut index = StackedIndex {
            slots: Vec::new(),
            mask: size - 1,
            count: entries.len(),
        };
        index.slots.resize_with(size, || None);
        for entry in entries {
            Self::place(&mut index.slots, index.mask, entry);
        }
        index
    }

    fn place(slots: &mut [Option<Box<Bucket>>], mask: usize, entry: IndexEntry) {
        let slot = &mut slots[entry.id.rolling as usize & mask];
        match slot {
            None => *slot = Some(Box::new(SmallVec::from_elem(entry, 1))),
            Some(bucket) => bucket.push(entry),
        }
    }

    fn bucket(&self, rolling: u64) -> &[IndexEntry] {
        match &self.slots[rolling as usize & self.mask] {
            Some(bucket) => bucket,
            None => &[],
        }
    }

    fn grow(&mut self) {
        tracing::debug!(count = self.count, "chunk index resize");
        let size = self.slots.len() << 1;
        let mask = size - 1;
        let mut slots: Vec<Option<Box<Bucket>>> = Vec::new();
        slots.resize_with(size, || None);
        for bucket in self.slots.drain(..).flatten() {
            for entry in bucket.into_iter() {
                Self::place(&mut slots, mask, entry);
            }
        }
        self.slots = slots;
        self.mask = mask;
    }
}

impl ChunkIndex for StackedIndex {
    fn approx_contains(&self, rolling: u64) -> bool {
        self.bucket(rolling).iter().any(|e| e.id.rolling == rolling)
    }

    fn exact_lookup(&self, rolling: u64, hash0: u64, hash1: u64, size: u32) -> Option<&IndexEntry> {
        self.bucket(rolling).iter().find(|e| {
            e.id.rolling == rolling && e.id.hash0 == hash0 && e.id.hash1 == hash1 && e.id.size == size
        })
    }

    fn insert(&mut self, entry: IndexEntry) {
        Self::place(&mut self.slots, self.mask, entry);
        self.count += 1;
        if self.count > self.slots.len() && self.slots.len() != 1 << TABLE_CAP_BITS {
            self.grow();
        }
    }

    fn len(&self) -> usize {
        self.count
    }
}
