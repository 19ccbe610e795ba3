//! Backup descriptors under `backups/<name>`: the packed instruction
//! stream of the final recursion pass plus everything needed to verify
//! a restore end to end.

use serde::{Deserialize, Serialize};

use crate::error::{CaissonError, Result};
use crate::storage::StorageBackend;
use crate::wire::{FrameReader, FrameWriter};

pub const DESCRIPTOR_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct DescriptorHeader {
    version: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct DescriptorBody {
    iterations: u32,
    length: u64,
    digest: [u8; 32],
}

/// One named backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupDescriptor {
    /// How many re-chunking passes produced `instructions`; restore
    /// unwinds this many layers before the final streaming pass.
    pub iterations: u32,
    /// Original input length in bytes.
    pub length: u64,
    /// 32-byte digest of the original input.
    pub digest: [u8; 32],
    /// Packed instruction stream of the last pass.
    pub instructions: Vec<u8>,
}

pub fn write(storage: &dyn StorageBackend, key: &str, descriptor: &BackupDescriptor) -> Result<()> {
    let mut writer = FrameWriter::new();
    writer.put_record(&DescriptorHeader {
        version: DESCRIPTOR_FORMAT_VERSION,
    })?;
    writer.put_record(&DescriptorBody {
        iterations: descriptor.iterations,
        length: descriptor.length,
        digest: descriptor.digest,
    })?;
    writer.put_bytes(&descriptor.instructions);
    writer.put_checksum();
    storage.put(key, &writer.into_inner())
}

pub fn load(storage: &dyn StorageBackend, key: &str) -> Result<BackupDescriptor> {
    let data = storage
        .get(key)?
        .ok_or_else(|| CaissonError::Other(format!("no backup at '{key}'")))?;
    let mut reader = FrameReader::new(&data, key);
    let header: DescriptorHeader = reader.take_record()?;
    if header.version != DESCRIPTOR_FORMAT_VERSION {
        return Err(CaissonError::CorruptBundle {
            file: key.to_string(),
            reason: format!("unsupported descriptor version {}", header.version),
        });
    }
    let body: DescriptorBody = reader.take_record()?;
    let instructions = reader.take_bytes()?.to_vec();
    reader.verify_checksum()?;
    Ok(BackupDescriptor {
        iterations: body.iterations,
        length: body.length,
        digest: body.digest,
        instructions,
    })
}
