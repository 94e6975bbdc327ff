//! Fragment persistence.
//!
//! The overlay consumes persistence as an opaque map from 32-byte keys to
//! byte vectors. [`DiskStore`] keeps one file per fragment; [`MemoryStore`]
//! backs tests and ephemeral nodes. Implementations must support
//! concurrent reads and serialize writes internally.

use std::collections::HashMap;
use std::fs;
use std::io::Write as _;
use std::path::PathBuf;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A persistent byte-key/byte-value map.
pub trait FragmentStore: Send + Sync {
    /// `None` when the key is not present.
    fn read(&self, key: &[u8; 32]) -> Option<Vec<u8>>;

    fn write(&self, key: &[u8; 32], value: &[u8]) -> Result<(), StoreError>;

    fn remove(&self, key: &[u8; 32]);

    /// All present keys, for republication seeding.
    fn keys(&self) -> Vec<[u8; 32]>;
}

/// One file per fragment, hex-named, under a single directory.
pub struct DiskStore {
    dir: PathBuf,
    // Serializes writers; readers go through the filesystem concurrently.
    lock: RwLock<()>,
}

impl DiskStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            lock: RwLock::new(()),
        })
    }

    fn path_for(&self, key: &[u8; 32]) -> PathBuf {
        let mut name = String::with_capacity(64);
        for byte in key {
            name.push_str(&format!("{:02x}", byte));
        }
        self.dir.join(name)
    }

    fn key_from_name(name: &str) -> Option<[u8; 32]> {
        if name.len() != 64 {
            return None;
        }
        let mut key = [0u8; 32];
        for (i, chunk) in name.as_bytes().chunks(2).enumerate() {
            let s = std::str::from_utf8(chunk).ok()?;
            key[i] = u8::from_str_radix(s, 16).ok()?;
        }
        Some(key)
    }
}

impl FragmentStore for DiskStore {
    fn read(&self, key: &[u8; 32]) -> Option<Vec<u8>> {
        let _guard = self.lock.read();
        fs::read(self.path_for(key)).ok()
    }

    fn write(&self, key: &[u8; 32], value: &[u8]) -> Result<(), StoreError> {
        let _guard = self.lock.write();
        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(value)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &[u8; 32]) {
        let _guard = self.lock.write();
        if let Err(e) = fs::remove_file(self.path_for(key)) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove fragment file: {}", e);
            }
        }
    }

    fn keys(&self) -> Vec<[u8; 32]> {
        let _guard = self.lock.read();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("failed to enumerate fragment store: {}", e);
                return Vec::new();
            }
        };
        entries
            .flatten()
            .filter_map(|entry| Self::key_from_name(&entry.file_name().to_string_lossy()))
            .collect()
    }
}

/// In-memory store for tests and ephemeral nodes.
#[derive(Default)]
pub struct MemoryStore {
    map: RwLock<HashMap<[u8; 32], Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FragmentStore for MemoryStore {
    fn read(&self, key: &[u8; 32]) -> Option<Vec<u8>> {
        self.map.read().get(key).cloned()
    }

    fn write(&self, key: &[u8; 32], value: &[u8]) -> Result<(), StoreError> {
        self.map.write().insert(*key, value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &[u8; 32]) {
        self.map.write().remove(key);
    }

    fn keys(&self) -> Vec<[u8; 32]> {
        self.map.read().keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path()).unwrap();

        let key = [7u8; 32];
        assert!(store.read(&key).is_none());

        store.write(&key, &[0xde, 0xad]).unwrap();
        assert_eq!(store.read(&key), Some(vec![0xde, 0xad]));

        assert_eq!(store.keys(), vec![key]);

        store.remove(&key);
        assert!(store.read(&key).is_none());
        assert!(store.keys().is_empty());
    }

    #[test]
    fn disk_store_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path()).unwrap();

        let key = [1u8; 32];
        store.write(&key, b"one").unwrap();
        store.write(&key, b"two").unwrap();
        assert_eq!(store.read(&key), Some(b"two".to_vec()));
        assert_eq!(store.keys().len(), 1);
    }

    #[test]
    fn disk_store_ignores_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("not-a-fragment"), b"x").unwrap();
        let store = DiskStore::open(dir.path()).unwrap();
        assert!(store.keys().is_empty());
    }

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryStore::new();
        let key = [9u8; 32];
        store.write(&key, &[1, 2, 3]).unwrap();
        assert_eq!(store.read(&key), Some(vec![1, 2, 3]));
        store.remove(&key);
        assert!(store.read(&key).is_none());
    }
}
