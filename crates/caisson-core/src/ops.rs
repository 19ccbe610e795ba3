//! Backup and restore drivers tying the chunker, store and restorer
//! together, including the recursive packing of instruction streams.

use std::io::{Read, Write};

use crate::chunk_id::StreamDigest;
use crate::chunker::Chunker;
use crate::descriptor::{self, BackupDescriptor};
use crate::error::{CaissonError, Result};
use crate::instruction;
use crate::restore as schedule;
use crate::storage::BACKUPS_PREFIX;
use crate::store::BundleStore;

#[derive(Debug, Clone, Copy)]
pub struct BackupReport {
    pub length: u64,
    pub iterations: u32,
    pub new_bundles: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct RestoreReport {
    pub length: u64,
}

fn backup_key(name: &str) -> String {
    format!("{BACKUPS_PREFIX}/{name}")
}

/// Backs up `input` under `name`.
///
/// The input is chunked once, then the serialized instruction stream is
/// itself re-chunked over and over while that keeps shrinking it: for
/// large inputs the stream is chunk-reference-dense and highly
/// repetitive across backups, so the metadata dedups just like the
/// data. The descriptor records the last pass and how many passes to
/// unwind.
pub fn backup(store: &mut BundleStore, name: &str, input: &mut impl Read) -> Result<BackupReport> {
    let key = backup_key(name);
    let chunk_max = store.config().chunk_max_size;

    let outcome = Chunker::new(chunk_max).run(input, store)?;
    let mut packed = instruction::encode(&outcome.instructions);

    let mut iterations = 0u32;
    loop {
        let pass = Chunker::new(chunk_max).run(&mut &packed[..], store)?;
        let repacked = instruction::encode(&pass.instructions);
        iterations += 1;
        let shrunk = repacked.len() < packed.len();
        tracing::debug!(pass = iterations, bytes = repacked.len(), "instruction pass");
        packed = repacked;
        if !shrunk {
            break;
        }
    }

    let report = store.finish()?;
    descriptor::write(
        &**store.storage(),
        &key,
        &BackupDescriptor {
            iterations,
            length: outcome.length,
            digest: outcome.digest,
            instructions: packed,
        },
    )?;

    tracing::info!(
        backup = name,
        length = outcome.length,
        iterations,
        new_bundles = report.new_bundles,
        found_chunks = outcome.stats.found_chunks,
        "backup complete"
    );
    Ok(BackupReport {
        length: outcome.length,
        iterations,
        new_bundles: report.new_bundles,
    })
}

/// Restores the backup stored under `name` into `out`, verifying
/// length and digest against the descriptor.
pub fn restore(store: &BundleStore, name: &str, out: &mut impl Write) -> Result<RestoreReport> {
    let desc = descriptor::load(&**store.storage(), &backup_key(name))?;
    let max_cached = store.config().max_cached_bundles;

    // Unwind the re-chunking passes: each executes one instruction
    // layer, producing the packed stream of the layer below.
    let mut packed = desc.instructions.clone();
    for pass in 0..desc.iterations {
        let instructions = instruction::decode(&packed)?;
        let actions = schedule::plan(&instructions, |id| store.resolve_bundle(id), max_cached)?;
        let mut buf = Vec::new();
        schedule::execute(&actions, store, &mut buf)?;
        tracing::debug!(pass, bytes = buf.len(), "unwound instruction layer");
        packed = buf;
    }

    // Final layer streams the actual data.
    let instructions = instruction::decode(&packed)?;
    let actions = schedule::plan(&instructions, |id| store.resolve_bundle(id), max_cached)?;
    let mut writer = DigestWriter::new(out);
    schedule::execute(&actions, store, &mut writer)?;

    let length = writer.digest.length();
    let digest = writer.digest.finalize();
    if length != desc.length {
        return Err(CaissonError::DescriptorMismatch(format!(
            "restored {length} bytes, descriptor says {}",
            desc.length
        )));
    }
    if digest != desc.digest {
        return Err(CaissonError::DescriptorMismatch(
            "stream digest differs".to_string(),
        ));
    }

    tracing::info!(backup = name, length, "restore complete");
    Ok(RestoreReport { length })
}

/// Write adapter hashing and counting everything that passes through.
struct DigestWriter<'a, W: Write> {
    inner: &'a mut W,
    digest: StreamDigest,
}

impl<'a, W: Write> DigestWriter<'a, W> {
    fn new(inner: &'a mut W) -> Self {
        DigestWriter {
            inner,
            digest: StreamDigest::new(),
        }
    }
}

impl<W: Write> Write for DigestWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write_all(buf)?;
        self.digest.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
