// src/changeset/mod.rs

//! Changesets
//!
//! A changeset bundles everything needed to move a set of troves from one
//! state to another: per-trove change records, removed troves, file stream
//! changes and file contents. Content entries are kept in the order they
//! were produced; a pointer entry always follows the real entry it refers
//! to, so a linear reader never has to look ahead.

pub mod diff;

use crate::error::{Error, Result};
use crate::files::{FileChange, FileId, PathId};
use crate::flavor::Flavor;
use crate::trove::{TroveChangeSet, TroveIdentity};
use crate::version::Version;
use std::collections::HashMap;
use std::fmt;

pub use diff::{apply_diff, unified_diff};

/// One requested trove transition
///
/// `old` absent means a fresh install; `new` absent means a removal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChangeSetJob {
    pub name: String,
    pub old: Option<(Version, Flavor)>,
    pub new: Option<(Version, Flavor)>,
    pub absolute: bool,
}

impl ChangeSetJob {
    /// Install `version` from nothing
    pub fn install(name: &str, version: Version, flavor: Flavor, absolute: bool) -> Self {
        Self {
            name: name.to_string(),
            old: None,
            new: Some((version, flavor)),
            absolute,
        }
    }

    pub fn update(
        name: &str,
        old: (Version, Flavor),
        new: (Version, Flavor),
    ) -> Self {
        Self {
            name: name.to_string(),
            old: Some(old),
            new: Some(new),
            absolute: false,
        }
    }

    pub fn erase(name: &str, version: Version, flavor: Flavor) -> Self {
        Self {
            name: name.to_string(),
            old: Some((version, flavor)),
            new: None,
            absolute: false,
        }
    }

    pub fn old_identity(&self) -> Option<TroveIdentity> {
        self.old
            .as_ref()
            .map(|(v, f)| TroveIdentity::new(&self.name, v.clone(), f.clone()))
    }

    pub fn new_identity(&self) -> Option<TroveIdentity> {
        self.new
            .as_ref()
            .map(|(v, f)| TroveIdentity::new(&self.name, v.clone(), f.clone()))
    }
}

impl fmt::Display for ChangeSetJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let side = |side: &Option<(Version, Flavor)>| match side {
            Some((version, flavor)) => format!("{}[{}]", version, flavor),
            None => "-".to_string(),
        };
        write!(f, "{} {} -> {}", self.name, side(&self.old), side(&self.new))?;
        if self.absolute {
            write!(f, " (absolute)")?;
        }
        Ok(())
    }
}

/// Knobs for [`crate::repository::Repository::create_change_set`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeSetOptions {
    /// Follow contained troves
    pub recurse: bool,
    /// Load and diff file lists
    pub with_files: bool,
    /// Ship file contents
    pub with_file_contents: bool,
    /// Leave out contents of automatically fetched sources
    pub exclude_auto_source: bool,
}

impl Default for ChangeSetOptions {
    fn default() -> Self {
        Self {
            recurse: true,
            with_files: true,
            with_file_contents: true,
            exclude_auto_source: false,
        }
    }
}

/// Payload of a content entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileContents {
    /// Whole contents, gzip-compressed when the entry says so
    Full(Vec<u8>),
    /// Unified diff against the old contents of a config file
    Diff(String),
    /// Same bytes as an earlier entry in this changeset
    Pointer {
        path_id: PathId,
        file_id: FileId,
        sha256: String,
    },
    /// The file has no contents of its own
    Absent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContentsEntry {
    pub path_id: PathId,
    pub file_id: FileId,
    pub is_config: bool,
    pub compressed: bool,
    pub contents: FileContents,
}

impl FileContentsEntry {
    pub fn is_pointer(&self) -> bool {
        matches!(self.contents, FileContents::Pointer { .. })
    }
}

/// Stream change for one file of one trove
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChangeEntry {
    pub path_id: PathId,
    pub old_file_id: Option<FileId>,
    pub new_file_id: FileId,
    pub change: FileChange,
}

#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    troves: Vec<TroveChangeSet>,
    removed: Vec<TroveIdentity>,
    files: Vec<FileChangeEntry>,
    contents: Vec<FileContentsEntry>,
    index: HashMap<(PathId, FileId), usize>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_trove(&mut self, trove: TroveChangeSet) {
        self.troves.push(trove);
    }

    /// Record a trove which the changeset removes
    pub fn old_trove(&mut self, identity: TroveIdentity) {
        self.removed.push(identity);
    }

    pub fn add_file(&mut self, entry: FileChangeEntry) {
        self.files.push(entry);
    }

    /// Append a content entry
    ///
    /// A second entry for the same `(PathId, FileId)` is ignored.
    pub fn add_file_contents(&mut self, entry: FileContentsEntry) {
        let key = (entry.path_id, entry.file_id);
        if self.index.contains_key(&key) {
            return;
        }
        self.index.insert(key, self.contents.len());
        self.contents.push(entry);
    }

    pub fn troves(&self) -> &[TroveChangeSet] {
        &self.troves
    }

    pub fn removed_troves(&self) -> &[TroveIdentity] {
        &self.removed
    }

    pub fn file_changes(&self) -> &[FileChangeEntry] {
        &self.files
    }

    /// Content entries in production order
    pub fn contents(&self) -> &[FileContentsEntry] {
        &self.contents
    }

    pub fn get_file_change(&self, path_id: PathId, file_id: FileId) -> Option<&FileChangeEntry> {
        self.files
            .iter()
            .find(|entry| entry.path_id == path_id && entry.new_file_id == file_id)
    }

    pub fn get_contents(&self, path_id: PathId, file_id: FileId) -> Option<&FileContentsEntry> {
        self.index
            .get(&(path_id, file_id))
            .map(|&index| &self.contents[index])
    }

    /// Follow a pointer entry to the entry holding the bytes
    pub fn resolve<'a>(&'a self, entry: &'a FileContentsEntry) -> Option<&'a FileContentsEntry> {
        match &entry.contents {
            FileContents::Pointer {
                path_id, file_id, ..
            } => self.get_contents(*path_id, *file_id),
            _ => Some(entry),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.troves.is_empty() && self.removed.is_empty()
    }

    /// Check that every pointer refers to an earlier, real entry
    pub fn validate(&self) -> Result<()> {
        for (position, entry) in self.contents.iter().enumerate() {
            let FileContents::Pointer {
                path_id, file_id, ..
            } = &entry.contents
            else {
                continue;
            };
            match self.index.get(&(*path_id, *file_id)) {
                Some(&target) if target < position && !self.contents[target].is_pointer() => {}
                _ => {
                    return Err(Error::Commit(format!(
                        "pointer entry {} refers to {} which does not precede it",
                        entry.path_id, path_id
                    )));
                }
            }
        }
        Ok(())
    }
}

/// A file whose old or new version lives in another repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalFileRequest {
    pub path_id: PathId,
    pub trove: String,
    pub old_trove: Option<(Version, Flavor)>,
    pub new_trove: (Version, Flavor),
    pub old_file: Option<(FileId, Version)>,
    pub new_file: (FileId, Version),
}

/// Output of changeset creation
#[derive(Debug, Clone, Default)]
pub struct ChangeSetResult {
    pub change_set: ChangeSet,
    /// Jobs which touch another repository, left for the caller
    pub external_troves: Vec<ChangeSetJob>,
    pub external_files: Vec<ExternalFileRequest>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::FileStream;

    fn entry(path: &str, contents: FileContents) -> FileContentsEntry {
        let stream = FileStream::regular(path.as_bytes(), 0o644);
        FileContentsEntry {
            path_id: PathId::for_path("test", path),
            file_id: stream.file_id().unwrap(),
            is_config: false,
            compressed: false,
            contents,
        }
    }

    #[test]
    fn test_default_options() {
        let options = ChangeSetOptions::default();
        assert!(options.recurse);
        assert!(options.with_files);
        assert!(options.with_file_contents);
        assert!(!options.exclude_auto_source);
    }

    #[test]
    fn test_contents_keep_order_and_resolve() {
        let full = entry("/a", FileContents::Full(b"data".to_vec()));
        let pointer = entry(
            "/b",
            FileContents::Pointer {
                path_id: full.path_id,
                file_id: full.file_id,
                sha256: "h".to_string(),
            },
        );

        let mut cs = ChangeSet::new();
        cs.add_file_contents(full.clone());
        cs.add_file_contents(pointer.clone());
        cs.add_file_contents(full.clone());

        assert_eq!(cs.contents().len(), 2);
        assert_eq!(cs.resolve(&pointer), Some(&full));
        assert_eq!(cs.get_contents(pointer.path_id, pointer.file_id), Some(&pointer));
        assert!(cs.validate().is_ok());
    }

    #[test]
    fn test_resolve_passes_through_entries_outside_the_changeset() {
        let cs = ChangeSet::new();
        let detached = entry("/c", FileContents::Full(b"loose".to_vec()));
        let resolved = cs.resolve(&detached);
        assert!(std::ptr::eq(resolved.unwrap(), &detached));

        let dangling = entry(
            "/d",
            FileContents::Pointer {
                path_id: detached.path_id,
                file_id: detached.file_id,
                sha256: "h".to_string(),
            },
        );
        assert_eq!(cs.resolve(&dangling), None);
    }

    #[test]
    fn test_validate_rejects_forward_pointer() {
        let full = entry("/a", FileContents::Full(b"data".to_vec()));
        let pointer = entry(
            "/b",
            FileContents::Pointer {
                path_id: full.path_id,
                file_id: full.file_id,
                sha256: "h".to_string(),
            },
        );

        let mut cs = ChangeSet::new();
        cs.add_file_contents(pointer);
        cs.add_file_contents(full);
        assert!(matches!(cs.validate(), Err(Error::Commit(_))));
    }

    #[test]
    fn test_job_display() {
        let version = Version::parse("/conary.example.com@spc:devel/1.0-1-1").unwrap();
        let job = ChangeSetJob::install("test", version.clone(), Flavor::empty(), true);
        assert_eq!(
            job.to_string(),
            "test - -> /conary.example.com@spc:devel/1.0-1-1[] (absolute)"
        );
        assert_eq!(job.old_identity(), None);
        assert_eq!(job.new_identity().unwrap().version, version);
    }
}
