//! Test doubles shared by unit and integration tests.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::error::Result;
use crate::storage::StorageBackend;

/// In-memory storage backend. Useful where tests want to inspect or
/// corrupt blobs without touching the filesystem.
#[derive(Default)]
pub struct MemoryBackend {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self, prefix: &str) -> Vec<String> {
        self.blobs
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Applies `mutate` to a stored blob in place.
    pub fn tamper(&self, key: &str, mutate: impl FnOnce(&mut Vec<u8>)) {
        let mut blobs = self.blobs.lock().unwrap();
        let blob = blobs.get_mut(key).expect("blob to tamper with");
        mutate(blob);
    }
}

impl StorageBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.lock().unwrap().get(key).cloned())
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        self.blobs
            .lock()
            .unwrap()
            .insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut with_slash = prefix.to_string();
        if !with_slash.ends_with('/') {
            with_slash.push('/');
        }
        Ok(self.keys(&with_slash))
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let mut blobs = self.blobs.lock().unwrap();
        let data = blobs.remove(from).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, format!("no blob '{from}'"))
        })?;
        blobs.insert(to.to_string(), data);
        Ok(())
    }
}
