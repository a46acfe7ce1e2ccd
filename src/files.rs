// src/files.rs

//! File streams and file-level change records
//!
//! A [`FileStream`] is the metadata a trove records for one of its files:
//! kind, permissions, ownership, size, content hash and flags. Streams are
//! frozen to canonical JSON; the sha256 of that frozen form is the file's
//! [`FileId`]. Each file occupies a slot in its trove named by a [`PathId`].

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Hex-encoded sha256 of `bytes`
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn decode_hex<const N: usize>(value: &str) -> Result<[u8; N]> {
    let bytes = hex::decode(value).map_err(|_| Error::InvalidHash(value.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| Error::InvalidHash(value.to_string()))
}

/// Identifier of a file's slot within a trove, stable across versions
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathId([u8; 16]);

impl PathId {
    pub fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Derive a path id from a trove name and file path
    pub fn for_path(trove: &str, path: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(trove.as_bytes());
        hasher.update([0]);
        hasher.update(path.as_bytes());
        let digest = hasher.finalize();

        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        Self(bytes)
    }

    pub fn from_hex(value: &str) -> Result<Self> {
        decode_hex(value).map(Self)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PathId({})", self.to_hex())
    }
}

/// sha256 of a frozen file stream
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId([u8; 32]);

impl FileId {
    pub fn from_hex(value: &str) -> Result<Self> {
        decode_hex(value).map(Self)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileId({})", self.to_hex())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    Device,
    Socket,
    Fifo,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileFlags {
    /// Locally modifiable; contents travel as diffs and are never shared
    #[serde(default)]
    pub config: bool,
    /// Source file fetched automatically at build time
    #[serde(default)]
    pub auto_source: bool,
    #[serde(default)]
    pub initial_contents: bool,
    #[serde(default)]
    pub transient: bool,
}

/// Metadata for one file in a trove
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStream {
    pub kind: FileKind,
    pub mode: u32,
    pub owner: String,
    pub group: String,
    pub mtime: i64,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default)]
    pub flags: FileFlags,
}

impl FileStream {
    fn base(kind: FileKind, mode: u32) -> Self {
        Self {
            kind,
            mode,
            owner: "root".to_string(),
            group: "root".to_string(),
            mtime: 0,
            size: 0,
            sha256: None,
            target: None,
            flags: FileFlags::default(),
        }
    }

    /// A regular file holding `contents`
    pub fn regular(contents: &[u8], mode: u32) -> Self {
        Self {
            size: contents.len() as u64,
            sha256: Some(sha256_hex(contents)),
            ..Self::base(FileKind::Regular, mode)
        }
    }

    pub fn directory(mode: u32) -> Self {
        Self::base(FileKind::Directory, mode)
    }

    pub fn symlink(target: &str) -> Self {
        Self {
            size: target.len() as u64,
            target: Some(target.to_string()),
            ..Self::base(FileKind::Symlink, 0o777)
        }
    }

    /// Mark the file as a config file
    pub fn config(mut self) -> Self {
        self.flags.config = true;
        self
    }

    /// Mark the file as an automatically fetched source
    pub fn auto_source(mut self) -> Self {
        self.flags.auto_source = true;
        self
    }

    pub fn with_mtime(mut self, mtime: i64) -> Self {
        self.mtime = mtime;
        self
    }

    /// Canonical frozen form
    pub fn freeze(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn thaw(frozen: &str) -> Result<Self> {
        Ok(serde_json::from_str(frozen)?)
    }

    /// sha256 of the frozen form
    pub fn file_id(&self) -> Result<FileId> {
        let frozen = self.freeze()?;
        let mut hasher = Sha256::new();
        hasher.update(frozen.as_bytes());
        Ok(FileId(hasher.finalize().into()))
    }

    /// True for files whose contents live in the content store
    pub fn has_contents(&self) -> bool {
        self.kind == FileKind::Regular && self.sha256.is_some()
    }

    pub fn is_config(&self) -> bool {
        self.flags.config
    }
}

/// One field of a file stream that differs between two versions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldChange {
    Mode(u32),
    Owner(String),
    Group(String),
    Mtime(i64),
    Size(u64),
    Sha256(Option<String>),
    Target(Option<String>),
    Flags(FileFlags),
}

/// How to turn the old stream for a path into the new one
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileChange {
    /// The whole new stream; used for new files and kind changes
    Absolute(FileStream),
    /// Fields which differ from the old stream
    Relative(Vec<FieldChange>),
}

impl FileChange {
    /// Rebuild the new stream
    ///
    /// # Errors
    ///
    /// * `Error::FileStreamMissing` if a relative change has no old stream
    pub fn apply(&self, old: Option<&FileStream>) -> Result<FileStream> {
        let changes = match self {
            FileChange::Absolute(stream) => return Ok(stream.clone()),
            FileChange::Relative(changes) => changes,
        };

        let mut stream = old
            .cloned()
            .ok_or_else(|| Error::FileStreamMissing("relative change without a base".to_string()))?;

        for change in changes {
            match change {
                FieldChange::Mode(v) => stream.mode = *v,
                FieldChange::Owner(v) => stream.owner = v.clone(),
                FieldChange::Group(v) => stream.group = v.clone(),
                FieldChange::Mtime(v) => stream.mtime = *v,
                FieldChange::Size(v) => stream.size = *v,
                FieldChange::Sha256(v) => stream.sha256 = v.clone(),
                FieldChange::Target(v) => stream.target = v.clone(),
                FieldChange::Flags(v) => stream.flags = *v,
            }
        }
        Ok(stream)
    }

    pub fn is_absolute(&self) -> bool {
        matches!(self, FileChange::Absolute(_))
    }
}

/// Compute the change from `old` to `new`
///
/// # Returns
///
/// * `(FileChange, bool)` - The change record and whether the file's
///   contents differ from the old file's (always true for a new file with
///   contents)
pub fn file_change_set(old: Option<&FileStream>, new: &FileStream) -> (FileChange, bool) {
    let contents_changed = new.has_contents() && old.is_none_or(|old| old.sha256 != new.sha256);

    let old = match old {
        Some(old) if old.kind == new.kind => old,
        _ => return (FileChange::Absolute(new.clone()), contents_changed),
    };

    let mut changes = Vec::new();
    if old.mode != new.mode {
        changes.push(FieldChange::Mode(new.mode));
    }
    if old.owner != new.owner {
        changes.push(FieldChange::Owner(new.owner.clone()));
    }
    if old.group != new.group {
        changes.push(FieldChange::Group(new.group.clone()));
    }
    if old.mtime != new.mtime {
        changes.push(FieldChange::Mtime(new.mtime));
    }
    if old.size != new.size {
        changes.push(FieldChange::Size(new.size));
    }
    if old.sha256 != new.sha256 {
        changes.push(FieldChange::Sha256(new.sha256.clone()));
    }
    if old.target != new.target {
        changes.push(FieldChange::Target(new.target.clone()));
    }
    if old.flags != new.flags {
        changes.push(FieldChange::Flags(new.flags));
    }

    (FileChange::Relative(changes), contents_changed)
}
