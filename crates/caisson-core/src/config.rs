use serde::{Deserialize, Serialize};

use crate::error::{CaissonError, Result};

/// Smallest chunk the chunker will ever emit as a dedup unit; shorter
/// runs become literal instruction bytes.
pub const MIN_CHUNK_SIZE: usize = 1 << 8;

/// Tunables for a store. The first four shape the on-disk format and are
/// persisted with the store; the rest only affect the running process.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Upper bound on chunk size; also the rolling-hash window width.
    pub chunk_max_size: usize,
    /// Upper bound on the uncompressed payload of one bundle.
    pub bundle_max_payload: usize,
    /// Bundle payload compression method name ("lzma" or "zero").
    pub compression_method: String,
    /// Compression level, 0..=9 for lzma.
    pub compression_level: u32,
    /// Reed-Solomon parity shards out of 256 total; 0 disables erasure
    /// coding entirely.
    pub erasure_parity: usize,
    /// Restore-side bound on concurrently cached decoded bundles.
    pub max_cached_bundles: usize,
    /// Backup-side bound on bundle encodes in flight at once.
    pub max_inflight_bundles: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            chunk_max_size: 1 << 16,
            bundle_max_payload: 1 << 21,
            compression_method: "lzma".to_string(),
            compression_level: 6,
            erasure_parity: 0,
            max_cached_bundles: 16,
            max_inflight_bundles: default_parallelism(),
        }
    }
}

pub fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl StoreConfig {
    /// Applies one `key=value` override from the command line.
    pub fn apply_option(&mut self, option: &str) -> Result<()> {
        let (key, value) = option
            .split_once('=')
            .ok_or_else(|| CaissonError::InvalidConfigValue(format!("'{option}' is not key=value")))?;
        match key {
            "chunk.max_size" => self.chunk_max_size = parse_size(key, value)?,
            "bundle.max_payload_size" => self.bundle_max_payload = parse_size(key, value)?,
            "compression" | "bundle.compression_method" => {
                self.compression_method = value.to_string();
            }
            "lzma.compression_level" => self.compression_level = parse_number(key, value)? as u32,
            "bundle.erasure_level" => self.erasure_parity = parse_number(key, value)?,
            "cache-size" => self.max_cached_bundles = parse_number(key, value)?,
            "threads" => self.max_inflight_bundles = parse_number(key, value)?,
            _ => {
                return Err(CaissonError::InvalidConfigValue(format!(
                    "unknown option '{key}'"
                )))
            }
        }
        Ok(())
    }

    pub fn apply_options<I, S>(&mut self, options: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for option in options {
            self.apply_option(option.as_ref())?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_max_size < MIN_CHUNK_SIZE {
            return Err(CaissonError::InvalidConfigValue(format!(
                "chunk.max_size must be at least {MIN_CHUNK_SIZE}"
            )));
        }
        if self.bundle_max_payload < self.chunk_max_size {
            return Err(CaissonError::InvalidConfigValue(
                "bundle.max_payload_size must be at least chunk.max_size".to_string(),
            ));
        }
        match self.compression_method.as_str() {
            "lzma" | "zero" => {}
            other => {
                return Err(CaissonError::InvalidConfigValue(format!(
                    "unknown compression method '{other}'"
                )))
            }
        }
        if self.compression_level > 9 {
            return Err(CaissonError::InvalidConfigValue(
                "lzma.compression_level must be 0..=9".to_string(),
            ));
        }
        if self.erasure_parity >= 256 {
            return Err(CaissonError::InvalidConfigValue(
                "bundle.erasure_level must be below 256".to_string(),
            ));
        }
        if self.max_cached_bundles == 0 {
            return Err(CaissonError::InvalidConfigValue(
                "cache-size must be at least 1".to_string(),
            ));
        }
        if self.max_inflight_bundles == 0 {
            return Err(CaissonError::InvalidConfigValue(
                "threads must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// The format-affecting subset persisted in the store root.
    pub fn settings(&self) -> StoreSettings {
        StoreSettings {
            chunk_max_size: self.chunk_max_size as u64,
            bundle_max_payload: self.bundle_max_payload as u64,
            compression_method: self.compression_method.clone(),
            compression_level: self.compression_level,
            erasure_parity: self.erasure_parity as u32,
        }
    }

    pub fn apply_settings(&mut self, settings: &StoreSettings) {
        self.chunk_max_size = settings.chunk_max_size as usize;
        self.bundle_max_payload = settings.bundle_max_payload as usize;
        self.compression_method = settings.compression_method.clone();
        self.compression_level = settings.compression_level;
        self.erasure_parity = settings.erasure_parity as usize;
    }
}

/// Settings written once when a store is created and reapplied on every
/// open, so later runs keep producing compatible bundles.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreSettings {
    pub chunk_max_size: u64,
    pub bundle_max_payload: u64,
    pub compression_method: String,
    pub compression_level: u32,
    pub erasure_parity: u32,
}

fn parse_number(key: &str, value: &str) -> Result<usize> {
    value
        .parse::<usize>()
        .map_err(|_| CaissonError::InvalidConfigValue(format!("{key}: '{value}' is not a number")))
}

/// Parses a byte count with an optional `k`/`m`/`g` suffix.
fn parse_size(key: &str, value: &str) -> Result<usize> {
    let value = value.trim();
    let (digits, shift) = match value.as_bytes().last() {
        Some(b'k') | Some(b'K') => (&value[..value.len() - 1], 10),
        Some(b'm') | Some(b'M') => (&value[..value.len() - 1], 20),
        Some(b'g') | Some(b'G') => (&value[..value.len() - 1], 30),
        _ => (value, 0),
    };
    let base = digits
        .parse::<usize>()
        .map_err(|_| CaissonError::InvalidConfigValue(format!("{key}: '{value}' is not a size")))?;
    base.checked_shl(shift)
        .filter(|_| base.leading_zeros() >= shift)
        .ok_or_else(|| CaissonError::InvalidConfigValue(format!("{key}: '{value}' overflows")))
}
