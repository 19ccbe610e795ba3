//! Deduplicating bundle store.
//!
//! A backup run chunks an input stream with a content-defined chunker,
//! dedups chunks against an in-memory index, packs new chunks into
//! compressed (optionally erasure-coded) bundles, and records the
//! stream as an instruction list that is itself recursively re-chunked
//! until it stops shrinking. Restore resolves the instruction layers
//! back down, scheduling bundle decodes with optimal eviction under a
//! bounded cache.

pub mod bundle;
pub mod chunk_id;
pub mod chunker;
pub mod compress;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod index;
pub mod index_file;
pub mod instruction;
pub mod ops;
pub mod restore;
pub mod ring;
pub mod rollhash;
pub mod storage;
pub mod store;
pub mod testutil;
pub mod wire;
pub mod workers;

pub use chunk_id::{BundleId, ChunkId};
pub use config::StoreConfig;
pub use error::{CaissonError, Result};
pub use storage::{LocalBackend, StorageBackend};
pub use store::BundleStore;
pub use workers::WorkerPool;
