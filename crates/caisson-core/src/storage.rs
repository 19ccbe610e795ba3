use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{CaissonError, Result};

/// Blob storage under a store root. Keys are `/`-separated relative
/// paths; implementations decide how they map to real locations.
///
/// `put` must be atomic: readers never observe a partially written
/// blob, which is what lets bundle persistence write to `tmp/` and
/// `rename` into place only at finish.
pub trait StorageBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &str, data: &[u8]) -> Result<()>;
    /// All keys under `prefix`, in unspecified order.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
    fn rename(&self, from: &str, to: &str) -> Result<()>;
}

/// Store layout prefixes.
pub const BUNDLES_PREFIX: &str = "bundles";
pub const INDEX_PREFIX: &str = "index";
pub const BACKUPS_PREFIX: &str = "backups";
pub const TMP_PREFIX: &str = "tmp";
pub const SETTINGS_KEY: &str = "settings";

/// Filesystem-backed store rooted at one directory.
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn create(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(LocalBackend { root })
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn collect(&self, dir: &Path, key_prefix: &str, out: &mut Vec<String>) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let key = if key_prefix.is_empty() {
                name.to_string()
            } else {
                format!("{key_prefix}/{name}")
            };
            if entry.file_type()?.is_dir() {
                self.collect(&entry.path(), &key, out)?;
            } else {
                out.push(key);
            }
        }
        Ok(())
    }
}

impl StorageBackend for LocalBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.resolve(key)?;
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.resolve(key)?;
        let parent = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(parent)?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(data)?;
        tmp.flush()?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = self.resolve(prefix)?;
        let mut out = Vec::new();
        if dir.is_dir() {
            self.collect(&dir, prefix, &mut out)?;
        }
        Ok(out)
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from = self.resolve(from)?;
        let to = self.resolve(to)?;
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(from, to)?;
        Ok(())
    }
}

fn validate_key(key: &str) -> Result<()> {
    let ok = !key.is_empty()
        && !key.starts_with('/')
        && !key.ends_with('/')
        && key
            .split('/')
            .all(|part| !part.is_empty() && part != "." && part != "..");
    if ok {
        Ok(())
    } else {
        Err(CaissonError::Other(format!("invalid storage key '{key}'")))
    }
}
