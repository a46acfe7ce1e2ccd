// src/datastore.rs

//! Content-addressable file store
//!
//! File contents are stored gzip-compressed under their content hash,
//! spread over two directory levels:
//!
//! ```text
//! <top>/<hash[0:2]>/<hash[2:4]>/<hash[4:]>
//! ```
//!
//! Entries are write-once. The compressed bytes can be read back as-is so
//! changesets can ship them without recompressing.

use crate::error::{Error, Result};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Shortest hash which can be split into a path
pub const MIN_HASH_LEN: usize = 5;

/// A content store rooted at one directory
#[derive(Debug, Clone)]
pub struct DataStore {
    top: PathBuf,
}

impl DataStore {
    /// Open the store rooted at `top`, which must already be a directory
    pub fn new(top: impl AsRef<Path>) -> Result<Self> {
        let top = top.as_ref();
        if !top.is_dir() {
            return Err(Error::NotADirectory(top.display().to_string()));
        }
        Ok(Self {
            top: top.to_path_buf(),
        })
    }

    pub fn top(&self) -> &Path {
        &self.top
    }

    /// Directory and file path holding `hash`
    pub fn hash_to_path(&self, hash: &str) -> Result<(PathBuf, PathBuf)> {
        if hash.len() < MIN_HASH_LEN || !hash.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(Error::InvalidHash(hash.to_string()));
        }
        let dir = self.top.join(&hash[0..2]).join(&hash[2..4]);
        let path = dir.join(&hash[4..]);
        Ok((dir, path))
    }

    pub fn has_file(&self, hash: &str) -> Result<bool> {
        let (_, path) = self.hash_to_path(hash)?;
        Ok(path.exists())
    }

    /// Start a new entry for `hash`
    ///
    /// The returned writer compresses everything written to it and must be
    /// finished with [`GzEncoder::finish`].
    ///
    /// # Errors
    ///
    /// * `Error::DuplicateHash` if the entry already exists
    pub fn create(&self, hash: &str) -> Result<GzEncoder<File>> {
        let file = self.create_file(hash)?;
        Ok(GzEncoder::new(file, Compression::default()))
    }

    fn create_file(&self, hash: &str) -> Result<File> {
        let (dir, path) = self.hash_to_path(hash)?;

        // Another writer may have created the directories already
        fs::create_dir_all(&dir)?;

        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                ErrorKind::AlreadyExists => Error::DuplicateHash(hash.to_string()),
                _ => Error::Io(e),
            })
    }

    /// Store everything read from `reader` under `hash`
    ///
    /// # Returns
    ///
    /// * `Result<u64>` - Number of uncompressed bytes stored
    pub fn add_file<R: Read>(&self, hash: &str, reader: &mut R) -> Result<u64> {
        let mut writer = self.create(hash)?;
        let written = io::copy(reader, &mut writer).and_then(|n| writer.finish().map(|_| n));

        match written {
            Ok(n) => {
                debug!("Stored {} bytes as {}", n, hash);
                Ok(n)
            }
            Err(e) => {
                self.discard(hash);
                Err(Error::Io(e))
            }
        }
    }

    /// Store already-compressed bytes under `hash`
    pub fn add_compressed(&self, hash: &str, compressed: &[u8]) -> Result<()> {
        let mut file = self.create_file(hash)?;
        if let Err(e) = file.write_all(compressed).and_then(|_| file.sync_all()) {
            self.discard(hash);
            return Err(Error::Io(e));
        }
        debug!("Stored {} compressed bytes as {}", compressed.len(), hash);
        Ok(())
    }

    fn discard(&self, hash: &str) {
        if let Ok((_, path)) = self.hash_to_path(hash) {
            if let Err(e) = fs::remove_file(&path) {
                warn!("Failed to remove partial entry {}: {}", path.display(), e);
            }
        }
    }

    fn open_file(&self, hash: &str) -> Result<File> {
        let (_, path) = self.hash_to_path(hash)?;
        File::open(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => Error::ContentsMissing(hash.to_string()),
            _ => Error::Io(e),
        })
    }

    /// Open the entry for `hash`, decompressing as it is read
    pub fn open(&self, hash: &str) -> Result<GzDecoder<File>> {
        Ok(GzDecoder::new(self.open_file(hash)?))
    }

    /// Read and decompress the whole entry for `hash`
    pub fn read(&self, hash: &str) -> Result<Vec<u8>> {
        let mut contents = Vec::new();
        self.open(hash)?.read_to_end(&mut contents)?;
        Ok(contents)
    }

    /// The compressed bytes of the entry for `hash`
    pub fn open_raw(&self, hash: &str) -> Result<Vec<u8>> {
        let mut raw = Vec::new();
        self.open_file(hash)?.read_to_end(&mut raw)?;
        Ok(raw)
    }

    /// Remove the entry for `hash`
    ///
    /// Emptied directories are removed too. Failing to remove a directory
    /// is not an error; another entry may still live there.
    pub fn remove(&self, hash: &str) -> Result<()> {
        let (dir, path) = self.hash_to_path(hash)?;
        fs::remove_file(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => Error::ContentsMissing(hash.to_string()),
            _ => Error::Io(e),
        })?;

        if fs::remove_dir(&dir).is_ok() {
            if let Some(parent) = dir.parent() {
                let _ = fs::remove_dir(parent);
            }
        }

        debug!("Removed {}", hash);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const HASH: &str = "abcdef0123456789";

    fn store() -> (TempDir, DataStore) {
        let dir = TempDir::new().unwrap();
        let store = DataStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_new_requires_directory() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("plain");
        fs::write(&file, b"x").unwrap();

        assert!(matches!(DataStore::new(&file), Err(Error::NotADirectory(_))));
        assert!(matches!(
            DataStore::new(dir.path().join("missing")),
            Err(Error::NotADirectory(_))
        ));
    }

    #[test]
    fn test_hash_to_path_layout() {
        let (dir, store) = store();
        let (parent, path) = store.hash_to_path(HASH).unwrap();
        assert_eq!(parent, dir.path().join("ab").join("cd"));
        assert_eq!(path, dir.path().join("ab").join("cd").join("ef0123456789"));

        assert!(matches!(store.hash_to_path("abcd"), Err(Error::InvalidHash(_))));
        assert!(matches!(store.hash_to_path("../../x"), Err(Error::InvalidHash(_))));
    }

    #[test]
    fn test_add_and_read_back() {
        let (_dir, store) = store();
        assert!(!store.has_file(HASH).unwrap());

        let n = store.add_file(HASH, &mut &b"hello world"[..]).unwrap();
        assert_eq!(n, 11);
        assert!(store.has_file(HASH).unwrap());
        assert_eq!(store.read(HASH).unwrap(), b"hello world");

        let mut decoded = String::new();
        GzDecoder::new(&store.open_raw(HASH).unwrap()[..])
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, "hello world");
    }

    #[test]
    fn test_create_is_write_once() {
        let (_dir, store) = store();
        let mut writer = store.create(HASH).unwrap();
        writer.write_all(b"first").unwrap();
        writer.finish().unwrap();

        assert!(matches!(store.create(HASH), Err(Error::DuplicateHash(_))));
        assert_eq!(store.read(HASH).unwrap(), b"first");
    }

    #[test]
    fn test_shared_directories_are_tolerated() {
        let (_dir, store) = store();
        store.add_file("abcd1111", &mut &b"one"[..]).unwrap();
        store.add_file("abcd2222", &mut &b"two"[..]).unwrap();
        assert_eq!(store.read("abcd1111").unwrap(), b"one");
        assert_eq!(store.read("abcd2222").unwrap(), b"two");
    }

    #[test]
    fn test_remove_cleans_empty_directories() {
        let (dir, store) = store();
        store.add_file("abcd1111", &mut &b"one"[..]).unwrap();
        store.add_file("abcd2222", &mut &b"two"[..]).unwrap();

        store.remove("abcd1111").unwrap();
        assert!(dir.path().join("ab").join("cd").is_dir());
        assert!(!store.has_file("abcd1111").unwrap());

        store.remove("abcd2222").unwrap();
        assert!(!dir.path().join("ab").exists());

        assert!(matches!(store.remove("abcd2222"), Err(Error::ContentsMissing(_))));
    }

    #[test]
    fn test_open_missing_entry() {
        let (_dir, store) = store();
        assert!(matches!(store.open(HASH), Err(Error::ContentsMissing(_))));
        assert!(matches!(store.open_raw(HASH), Err(Error::ContentsMissing(_))));
    }

    #[test]
    fn test_add_compressed_round_trip() {
        let (_dir, store) = store();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"payload").unwrap();
        let compressed = encoder.finish().unwrap();

        store.add_compressed(HASH, &compressed).unwrap();
        assert_eq!(store.open_raw(HASH).unwrap(), compressed);
        assert_eq!(store.read(HASH).unwrap(), b"payload");
    }
}
