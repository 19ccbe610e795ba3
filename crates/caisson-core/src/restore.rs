use std::collections::HashMap;
use std::io::Write;

use crate::chunk_id::{BundleId, ChunkId};
use crate::error::{CaissonError, Result};
use crate::instruction::Instruction;
use crate::store::BundleStore;

/// One step of a restore schedule. `Load` starts an async bundle
/// decode, `Unload` drops it from the cache, the emits produce output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Load(BundleId),
    Unload(BundleId),
    EmitBytes(Vec<u8>),
    EmitChunk(ChunkId, BundleId),
}

/// Builds the complete Load/Unload/Emit schedule for an instruction
/// list before any I/O happens.
///
/// The whole emit sequence is known up front, so eviction can be
/// optimal (Belady): when the cache is full, the cached bundle whose
/// next use lies furthest ahead is evicted. Its Unload goes right
/// after its last use before the current position and the replacement
/// Load right after that, which starts the decode as early as the
/// bounded cache allows. While the cache still has room, loads are
/// hoisted to the very front of the schedule.
pub fn plan(
    instructions: &[Instruction],
    resolve: impl Fn(&ChunkId) -> Result<BundleId>,
    max_cached: usize,
) -> Result<Vec<Action>> {
    let mut actions: Vec<Action> = Vec::with_capacity(instructions.len());
    for instruction in instructions {
        actions.push(match instruction {
            Instruction::Bytes(data) => Action::EmitBytes(data.clone()),
            Instruction::Chunk(id) => Action::EmitChunk(*id, resolve(id)?),
        });
    }

    let mut cached: Vec<BundleId> = Vec::new();
    let mut i = 0usize;
    while i < actions.len() {
        let bundle = match &actions[i] {
            Action::EmitChunk(_, bundle) => *bundle,
            _ => {
                i += 1;
                continue;
            }
        };
        if cached.contains(&bundle) {
            i += 1;
            continue;
        }

        let mut load_position = 0usize;
        if cached.len() >= max_cached {
            // Next upcoming use of every cached bundle.
            let mut next_used = vec![usize::MAX; cached.len()];
            for (j, action) in actions.iter().enumerate().skip(i) {
                if let Action::EmitChunk(_, b) = action {
                    if let Some(idx) = cached.iter().position(|x| x == b) {
                        if next_used[idx] == usize::MAX {
                            next_used[idx] = j;
                        }
                    }
                }
            }
            let mut evict = 0usize;
            for candidate in 1..next_used.len() {
                if next_used[evict] < next_used[candidate] {
                    evict = candidate;
                }
            }
            let evicted = cached.remove(evict);

            // Unload right after the evictee's last use behind us; the
            // replacement load goes immediately after the unload.
            for j in (0..i).rev() {
                if matches!(&actions[j], Action::EmitChunk(_, b) if *b == evicted) {
                    actions.insert(j + 1, Action::Unload(evicted));
                    load_position = j + 2;
                    i += 1;
                    break;
                }
            }
            if load_position == 0 {
                return Err(CaissonError::Other(
                    "restore schedule lost track of an evicted bundle".to_string(),
                ));
            }
        }

        actions.insert(load_position, Action::Load(bundle));
        i += 1;
        cached.push(bundle);
    }
    Ok(actions)
}

/// Runs a schedule against the store, streaming output to `out`. Emits
/// block only on the promise of their own bundle; the output is
/// flushed after every action so a consumer pipeline sees steady
/// progress. An evicted bundle's decode may still be running; that
/// work is simply discarded.
pub fn execute(actions: &[Action], store: &BundleStore, out: &mut impl Write) -> Result<()> {
    let mut cache = HashMap::new();
    for action in actions {
        match action {
            Action::Load(bundle) => {
                cache.insert(*bundle, store.load_bundle(*bundle));
            }
            Action::Unload(bundle) => {
                cache.remove(bundle);
            }
            Action::EmitBytes(data) => out.write_all(data)?,
            Action::EmitChunk(id, bundle_id) => {
                let promise = cache.get(bundle_id).ok_or_else(|| {
                    CaissonError::Other(format!("bundle {bundle_id} was never scheduled for load"))
                })?;
                let bundle = promise.wait()?;
                let bytes = bundle.chunk_bytes(id).ok_or_else(|| CaissonError::CorruptBundle {
                    file: bundle_id.to_hex(),
                    reason: format!("chunk {id} missing from decoded bundle"),
                })?;
                out.write_all(bytes)?;
            }
        }
        out.flush()?;
    }
    Ok(())
}
