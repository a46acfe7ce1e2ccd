// src/trove.rs

//! Troves and trove change sets
//!
//! A trove is a named, versioned, flavored unit of software. It owns a
//! list of files (keyed by [`PathId`]) and may contain other troves.
//! [`Trove::diff`] computes the [`TroveChangeSet`] between two states of a
//! trove, along with the file streams and contained-trove changesets needed
//! to make the result complete.

use crate::changeset::ChangeSetJob;
use crate::error::{Error, Result};
use crate::files::{FileId, PathId};
use crate::flavor::Flavor;
use crate::version::Version;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// `(name, version, flavor)` naming one trove
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TroveIdentity {
    pub name: String,
    pub version: Version,
    pub flavor: Flavor,
}

impl TroveIdentity {
    pub fn new(name: &str, version: Version, flavor: Flavor) -> Self {
        Self {
            name: name.to_string(),
            version,
            flavor,
        }
    }
}

impl fmt::Display for TroveIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}[{}]", self.name, self.version, self.flavor)
    }
}

/// Descriptive metadata carried with a trove
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TroveInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// One file in a trove
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TroveFile {
    pub path: String,
    pub file_id: FileId,
    /// Version the file stream was last changed in
    pub version: Version,
}

/// How a trove refers to a contained trove
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TroveRef {
    /// Installed along with the container unless excluded
    pub by_default: bool,
    /// Reached through another contained trove; not recursed into
    pub weak: bool,
}

impl TroveRef {
    pub fn strong(by_default: bool) -> Self {
        Self {
            by_default,
            weak: false,
        }
    }

    pub fn weak(by_default: bool) -> Self {
        Self {
            by_default,
            weak: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trove {
    name: String,
    version: Version,
    flavor: Flavor,
    info: TroveInfo,
    files: BTreeMap<PathId, TroveFile>,
    troves: BTreeMap<TroveIdentity, TroveRef>,
}

impl Trove {
    pub fn new(name: &str, version: Version, flavor: Flavor) -> Self {
        Self {
            name: name.to_string(),
            version,
            flavor,
            info: TroveInfo::default(),
            files: BTreeMap::new(),
            troves: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    pub fn flavor(&self) -> &Flavor {
        &self.flavor
    }

    pub fn identity(&self) -> TroveIdentity {
        TroveIdentity::new(&self.name, self.version.clone(), self.flavor.clone())
    }

    pub fn info(&self) -> &TroveInfo {
        &self.info
    }

    pub fn set_info(&mut self, info: TroveInfo) {
        self.info = info;
    }

    pub fn add_file(&mut self, path_id: PathId, path: &str, file_id: FileId, version: Version) {
        self.files.insert(
            path_id,
            TroveFile {
                path: path.to_string(),
                file_id,
                version,
            },
        );
    }

    pub fn remove_file(&mut self, path_id: &PathId) -> Option<TroveFile> {
        self.files.remove(path_id)
    }

    pub fn file(&self, path_id: &PathId) -> Option<&TroveFile> {
        self.files.get(path_id)
    }

    pub fn files(&self) -> impl Iterator<Item = (&PathId, &TroveFile)> {
        self.files.iter()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn add_trove(&mut self, identity: TroveIdentity, reference: TroveRef) {
        self.troves.insert(identity, reference);
    }

    pub fn remove_trove(&mut self, identity: &TroveIdentity) -> Option<TroveRef> {
        self.troves.remove(identity)
    }

    pub fn troves(&self) -> impl Iterator<Item = (&TroveIdentity, &TroveRef)> {
        self.troves.iter()
    }

    /// Contained troves which are not weak references
    pub fn strong_troves(&self) -> impl Iterator<Item = &TroveIdentity> {
        self.troves
            .iter()
            .filter(|(_, reference)| !reference.weak)
            .map(|(identity, _)| identity)
    }

    /// Compute the change from `old` to this trove
    ///
    /// With no `old` the change set lists every file and contained trove as
    /// new. When `absolute` is set, contained troves are requested as fresh
    /// installs too; otherwise added and removed contained troves are paired
    /// up into updates where possible (see [`pair_troves`]).
    ///
    /// # Returns
    ///
    /// * The trove change set
    /// * File streams whose changes must accompany it
    /// * Changesets for contained troves needed to complete it
    pub fn diff(
        &self,
        old: Option<&Trove>,
        absolute: bool,
    ) -> (TroveChangeSet, Vec<FileRequest>, Vec<ChangeSetJob>) {
        let mut cs = TroveChangeSet {
            name: self.name.clone(),
            old_version: old.map(|o| o.version.clone()),
            new_version: self.version.clone(),
            old_flavor: old.map(|o| o.flavor.clone()),
            new_flavor: self.flavor.clone(),
            absolute: old.is_none() && absolute,
            new_files: Vec::new(),
            changed_files: Vec::new(),
            old_files: Vec::new(),
            new_troves: Vec::new(),
            changed_troves: Vec::new(),
            old_troves: Vec::new(),
            info: match old {
                Some(o) if o.info == self.info => None,
                _ => Some(self.info.clone()),
            },
        };
        let mut files_needed = Vec::new();

        let empty = BTreeMap::new();
        let old_files = old.map_or(&empty, |o| &o.files);

        for (path_id, file) in &self.files {
            match old_files.get(path_id) {
                None => {
                    files_needed.push(FileRequest {
                        path_id: *path_id,
                        old_file_id: None,
                        old_version: None,
                        new_file_id: file.file_id,
                        new_version: file.version.clone(),
                    });
                    cs.new_files.push((*path_id, file.clone()));
                }
                Some(prev) => {
                    let path = (prev.path != file.path).then(|| file.path.clone());
                    let version = (prev.version != file.version || prev.file_id != file.file_id)
                        .then(|| file.version.clone());

                    if version.is_some() {
                        files_needed.push(FileRequest {
                            path_id: *path_id,
                            old_file_id: Some(prev.file_id),
                            old_version: Some(prev.version.clone()),
                            new_file_id: file.file_id,
                            new_version: file.version.clone(),
                        });
                    }
                    if path.is_some() || version.is_some() {
                        cs.changed_files.push(ChangedFile {
                            path_id: *path_id,
                            path,
                            file_id: file.file_id,
                            version,
                        });
                    }
                }
            }
        }
        cs.old_files = old_files
            .keys()
            .filter(|path_id| !self.files.contains_key(path_id))
            .copied()
            .collect();

        let mut added: Vec<TroveIdentity> = Vec::new();
        let mut removed: Vec<TroveIdentity> = Vec::new();

        for (identity, reference) in &self.troves {
            if let Some(prev) = old.and_then(|o| o.troves.get(identity)) {
                if prev != reference {
                    cs.changed_troves.push((identity.clone(), *reference));
                }
                continue;
            }
            cs.new_troves.push((identity.clone(), *reference));
            if !reference.weak {
                added.push(identity.clone());
            }
        }
        if let Some(old) = old {
            for (identity, reference) in &old.troves {
                if self.troves.contains_key(identity) {
                    continue;
                }
                cs.old_troves.push(identity.clone());
                if !reference.weak {
                    removed.push(identity.clone());
                }
            }
        }

        let jobs = if absolute {
            added
                .into_iter()
                .map(|id| ChangeSetJob::install(&id.name, id.version, id.flavor, true))
                .collect()
        } else {
            pair_troves(added, removed)
                .into_iter()
                .map(|(old, new)| to_job(old, new))
                .collect()
        };

        (cs, files_needed, jobs)
    }
}

fn to_job(old: Option<TroveIdentity>, new: Option<TroveIdentity>) -> ChangeSetJob {
    let name = old
        .as_ref()
        .or(new.as_ref())
        .map(|id| id.name.clone())
        .unwrap_or_default();
    ChangeSetJob {
        name,
        old: old.map(|id| (id.version, id.flavor)),
        new: new.map(|id| (id.version, id.flavor)),
        absolute: false,
    }
}

/// Sort key placing the newest commit first
fn newest_first(a: &TroveIdentity, b: &TroveIdentity) -> std::cmp::Ordering {
    let stamp = |id: &TroveIdentity| id.version.trailing_revision().map_or(0.0, |r| r.timestamp());
    stamp(b)
        .total_cmp(&stamp(a))
        .then_with(|| b.version.cmp(&a.version))
        .then_with(|| b.flavor.cmp(&a.flavor))
}

/// Match old and new versions of one name and flavor grouping
///
/// Pairs on the same branch are taken first (newest old version wins),
/// then pairs across branches by descending [`Version::closeness`], and
/// whatever is left is paired newest with newest. Unpaired entries come
/// back with the other side empty.
fn version_match(
    old: &BTreeSet<TroveIdentity>,
    new: &BTreeSet<TroveIdentity>,
) -> Vec<(Option<TroveIdentity>, Option<TroveIdentity>)> {
    let mut old = old.clone();
    let mut new = new.clone();
    let mut matches = Vec::new();

    let candidates: Vec<TroveIdentity> = new.iter().cloned().collect();
    for new_id in candidates {
        let branch = new_id.version.branch();
        let mut same_branch: Vec<&TroveIdentity> = old
            .iter()
            .filter(|old_id| old_id.version.branch() == branch)
            .collect();
        same_branch.sort_by(|a, b| newest_first(a, b));

        if let Some(old_id) = same_branch.first().map(|id| (*id).clone()) {
            old.remove(&old_id);
            new.remove(&new_id);
            matches.push((Some(old_id), Some(new_id)));
        }
    }

    let mut scored = Vec::new();
    for new_id in &new {
        for old_id in &old {
            let score = new_id.version.closeness(&old_id.version);
            if score > 0.0 {
                scored.push((score, old_id.clone(), new_id.clone()));
            }
        }
    }
    scored.sort_by(|a, b| {
        b.0.total_cmp(&a.0)
            .then_with(|| b.1.cmp(&a.1))
            .then_with(|| b.2.cmp(&a.2))
    });
    for (_, old_id, new_id) in scored {
        if old.contains(&old_id) && new.contains(&new_id) {
            old.remove(&old_id);
            new.remove(&new_id);
            matches.push((Some(old_id), Some(new_id)));
        }
    }

    let mut old: Vec<TroveIdentity> = old.into_iter().collect();
    let mut new: Vec<TroveIdentity> = new.into_iter().collect();
    old.sort_by(newest_first);
    new.sort_by(newest_first);

    let paired = old.len().min(new.len());
    let rest_old = old.split_off(paired);
    let rest_new = new.split_off(paired);
    matches.extend(old.into_iter().zip(new).map(|(o, n)| (Some(o), Some(n))));
    matches.extend(rest_old.into_iter().map(|o| (Some(o), None)));
    matches.extend(rest_new.into_iter().map(|n| (None, Some(n))));
    matches
}

/// Pair added and removed contained troves into updates
///
/// Names with no counterpart become installs or removals. For the rest,
/// versions sharing an identical flavor are matched first, then everything
/// left of that name is matched regardless of flavor.
pub fn pair_troves(
    added: Vec<TroveIdentity>,
    removed: Vec<TroveIdentity>,
) -> Vec<(Option<TroveIdentity>, Option<TroveIdentity>)> {
    let mut added_by_name: BTreeMap<String, BTreeSet<TroveIdentity>> = BTreeMap::new();
    for id in added {
        added_by_name.entry(id.name.clone()).or_default().insert(id);
    }
    let mut removed_by_name: BTreeMap<String, BTreeSet<TroveIdentity>> = BTreeMap::new();
    for id in removed {
        removed_by_name.entry(id.name.clone()).or_default().insert(id);
    }

    let mut pairs = Vec::new();

    for (name, mut new_set) in added_by_name {
        let Some(mut old_set) = removed_by_name.remove(&name) else {
            pairs.extend(new_set.into_iter().map(|id| (None, Some(id))));
            continue;
        };

        let flavors: BTreeSet<Flavor> = new_set
            .iter()
            .map(|id| id.flavor.clone())
            .filter(|flavor| old_set.iter().any(|id| &id.flavor == flavor))
            .collect();

        for flavor in flavors {
            let old_group = old_set.iter().filter(|id| id.flavor == flavor).cloned().collect();
            let new_group = new_set.iter().filter(|id| id.flavor == flavor).cloned().collect();

            for (old_id, new_id) in version_match(&old_group, &new_group) {
                if let (Some(old_id), Some(new_id)) = (old_id, new_id) {
                    old_set.remove(&old_id);
                    new_set.remove(&new_id);
                    pairs.push((Some(old_id), Some(new_id)));
                }
            }
        }

        pairs.extend(version_match(&old_set, &new_set));
    }

    for old_set in removed_by_name.into_values() {
        pairs.extend(old_set.into_iter().map(|id| (Some(id), None)));
    }

    pairs
}

/// A file stream the change set needs, old side absent for new files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRequest {
    pub path_id: PathId,
    pub old_file_id: Option<FileId>,
    pub old_version: Option<Version>,
    pub new_file_id: FileId,
    pub new_version: Version,
}

/// A file present in both states whose path or stream changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedFile {
    pub path_id: PathId,
    /// New path, when it moved
    pub path: Option<String>,
    pub file_id: FileId,
    /// New file version, when the stream changed
    pub version: Option<Version>,
}

/// Difference between two states of a trove
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TroveChangeSet {
    pub name: String,
    pub old_version: Option<Version>,
    pub new_version: Version,
    pub old_flavor: Option<Flavor>,
    pub new_flavor: Flavor,
    /// Built against nothing; applies without an old trove
    pub absolute: bool,
    pub new_files: Vec<(PathId, TroveFile)>,
    pub changed_files: Vec<ChangedFile>,
    pub old_files: Vec<PathId>,
    pub new_troves: Vec<(TroveIdentity, TroveRef)>,
    /// Contained troves whose reference flags changed
    pub changed_troves: Vec<(TroveIdentity, TroveRef)>,
    pub old_troves: Vec<TroveIdentity>,
    /// New metadata, when it differs from the old trove's
    pub info: Option<TroveInfo>,
}

impl TroveChangeSet {
    pub fn new_identity(&self) -> TroveIdentity {
        TroveIdentity::new(&self.name, self.new_version.clone(), self.new_flavor.clone())
    }

    pub fn old_identity(&self) -> Option<TroveIdentity> {
        match (&self.old_version, &self.old_flavor) {
            (Some(version), Some(flavor)) => {
                Some(TroveIdentity::new(&self.name, version.clone(), flavor.clone()))
            }
            _ => None,
        }
    }

    /// Rebuild the new trove from the old one
    ///
    /// # Errors
    ///
    /// * `Error::TroveMissing` if the change set is relative to an old trove
    ///   and `old` is absent or is a different trove
    pub fn apply(&self, old: Option<&Trove>) -> Result<Trove> {
        let mut trove = match (self.old_identity(), old) {
            (None, _) => Trove::new(&self.name, self.new_version.clone(), self.new_flavor.clone()),
            (Some(expected), Some(old)) if old.identity() == expected => {
                let mut trove = old.clone();
                trove.version = self.new_version.clone();
                trove.flavor = self.new_flavor.clone();
                trove
            }
            (Some(expected), _) => return Err(Error::TroveMissing(expected.to_string())),
        };

        for path_id in &self.old_files {
            trove.files.remove(path_id);
        }
        for (path_id, file) in &self.new_files {
            trove.files.insert(*path_id, file.clone());
        }
        for change in &self.changed_files {
            let file = trove
                .files
                .get_mut(&change.path_id)
                .ok_or_else(|| Error::FileStreamMissing(change.path_id.to_hex()))?;
            if let Some(path) = &change.path {
                file.path = path.clone();
            }
            if let Some(version) = &change.version {
                file.version = version.clone();
            }
            file.file_id = change.file_id;
        }

        for identity in &self.old_troves {
            trove.troves.remove(identity);
        }
        for (identity, reference) in self.new_troves.iter().chain(&self.changed_troves) {
            trove.troves.insert(identity.clone(), *reference);
        }

        if let Some(info) = &self.info {
            trove.info = info.clone();
        }

        Ok(trove)
    }
}
