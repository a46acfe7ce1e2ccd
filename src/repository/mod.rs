// src/repository/mod.rs

//! Repository: changeset creation and commit
//!
//! A repository binds the set of host names it serves, a trove store and a
//! content store. [`Repository::create_change_set`] turns trove jobs into a
//! [`ChangeSet`]; anything touching another host is handed back to the
//! caller instead of being fetched. [`Repository::commit_change_set`]
//! stores the troves, file streams and contents a changeset carries.

mod trovestore;

pub use trovestore::TroveStore;

use crate::changeset::{
    ChangeSet, ChangeSetJob, ChangeSetOptions, ChangeSetResult, ExternalFileRequest,
    FileChangeEntry, FileContents, FileContentsEntry, apply_diff, unified_diff,
};
use crate::datastore::DataStore;
use crate::db::{self, SqliteTroveStore};
use crate::error::{Error, Result};
use crate::files::{FileId, FileStream, PathId, file_change_set, sha256_hex};
use crate::flavor::Flavor;
use crate::trove::{FileRequest, TroveChangeSet};
use crate::version::Version;
use flate2::read::GzDecoder;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fs;
use std::io::Read;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Default location of the trove database
pub const DEFAULT_DB_PATH: &str = "/srv/conary/repos.db";

/// Default root of the content store
pub const DEFAULT_CONTENTS_DIR: &str = "/srv/conary/contents";

/// Decides whether a version lives in this repository
pub trait HostPredicate {
    fn is_local(&self, version: &Version) -> bool;
}

/// The host names a repository answers for
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerNames(BTreeSet<String>);

impl ServerNames {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(names.into_iter().map(Into::into).collect())
    }

    pub fn contains(&self, host: &str) -> bool {
        self.0.contains(host)
    }
}

impl HostPredicate for ServerNames {
    fn is_local(&self, version: &Version) -> bool {
        version.host().is_some_and(|host| self.contains(host))
    }
}

impl<F> HostPredicate for F
where
    F: Fn(&Version) -> bool,
{
    fn is_local(&self, version: &Version) -> bool {
        self(version)
    }
}

/// Where a repository keeps its data and which hosts it serves
#[derive(Debug, Clone)]
pub struct RepositoryConfig {
    pub db_path: PathBuf,
    pub contents_dir: PathBuf,
    pub server_names: Vec<String>,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            contents_dir: PathBuf::from(DEFAULT_CONTENTS_DIR),
            server_names: Vec::new(),
        }
    }
}

impl RepositoryConfig {
    /// Open (creating if needed) the SQLite trove store and content store
    pub fn open(&self) -> Result<Repository<SqliteTroveStore>> {
        let db_path = self.db_path.to_string_lossy();
        db::init(&db_path)?;
        fs::create_dir_all(&self.contents_dir)?;

        let troves = SqliteTroveStore::open(&db_path)?;
        let contents = DataStore::new(&self.contents_dir)?;
        info!(
            "Opened repository {} serving {:?}",
            self.db_path.display(),
            self.server_names
        );
        Ok(Repository::new(
            ServerNames::new(self.server_names.iter().cloned()),
            troves,
            contents,
        ))
    }
}

/// A file request waiting for its streams
struct PendingFile {
    trove: String,
    request: FileRequest,
}

pub struct Repository<S: TroveStore> {
    hosts: Box<dyn HostPredicate>,
    troves: S,
    contents: DataStore,
}

impl<S: TroveStore> Repository<S> {
    pub fn new(hosts: impl HostPredicate + 'static, troves: S, contents: DataStore) -> Self {
        Self {
            hosts: Box::new(hosts),
            troves,
            contents,
        }
    }

    pub fn troves(&self) -> &S {
        &self.troves
    }

    pub fn troves_mut(&mut self) -> &mut S {
        &mut self.troves
    }

    pub fn contents(&self) -> &DataStore {
        &self.contents
    }

    pub fn is_local(&self, version: &Version) -> bool {
        self.hosts.is_local(version)
    }

    /// Build a changeset for `jobs`
    ///
    /// Jobs are processed in order, with contained troves queued behind
    /// them when `options.recurse` is set. Each distinct
    /// `(name, old, new)` transition is diffed once. Jobs and files whose
    /// versions live on another host come back in the result's external
    /// lists untouched.
    ///
    /// # Errors
    ///
    /// * `Error::TroveMissing` if a local trove is not stored
    /// * `Error::FileStreamMissing` / `Error::ContentsMissing` if a needed
    ///   stream or its contents are absent
    pub fn create_change_set(
        &self,
        jobs: &[ChangeSetJob],
        options: ChangeSetOptions,
    ) -> Result<ChangeSetResult> {
        let mut result = ChangeSetResult::default();
        let mut queue: VecDeque<ChangeSetJob> = jobs.iter().cloned().collect();
        let mut seen: HashSet<(String, Option<Flavor>, Option<Flavor>, Option<Version>, Option<Version>)> =
            HashSet::new();
        let mut pending: Vec<PendingFile> = Vec::new();

        while let Some(job) = queue.pop_front() {
            let old_flavor = job.old.as_ref().map(|(_, f)| f.clone());
            let new_flavor = job.new.as_ref().map(|(_, f)| f.clone());
            let old_version = job.old.as_ref().map(|(v, _)| v.clone());
            let new_version = job.new.as_ref().map(|(v, _)| v.clone());
            if !seen.insert((
                job.name.clone(),
                old_flavor,
                new_flavor,
                old_version,
                new_version,
            )) {
                continue;
            }

            let Some((new_version, new_flavor)) = &job.new else {
                self.erase_job(&job, &mut queue, &mut result)?;
                continue;
            };

            let old_is_foreign = job.old.as_ref().is_some_and(|(v, _)| !self.is_local(v));
            if !self.is_local(new_version) || old_is_foreign {
                debug!("Deferring {} to another repository", job);
                result.external_troves.push(job);
                continue;
            }

            let new = self.troves.get_trove(
                &job.name,
                new_version,
                new_flavor,
                options.with_files,
            )?;
            let old = match &job.old {
                Some((version, flavor)) => Some(self.troves.get_trove(
                    &job.name,
                    version,
                    flavor,
                    options.with_files,
                )?),
                None => None,
            };

            let (trove_cs, files_needed, troves_needed) = new.diff(old.as_ref(), job.absolute);

            if options.recurse {
                queue.extend(troves_needed.into_iter().map(|mut needed| {
                    needed.absolute = job.absolute;
                    needed
                }));
            }

            for request in files_needed {
                let foreign = !self.is_local(&request.new_version)
                    || request.old_version.as_ref().is_some_and(|v| !self.is_local(v));
                if foreign {
                    result.external_files.push(ExternalFileRequest {
                        path_id: request.path_id,
                        trove: job.name.clone(),
                        old_trove: job.old.clone(),
                        new_trove: (new_version.clone(), new_flavor.clone()),
                        old_file: request.old_file_id.zip(request.old_version.clone()),
                        new_file: (request.new_file_id, request.new_version.clone()),
                    });
                } else {
                    pending.push(PendingFile {
                        trove: job.name.clone(),
                        request,
                    });
                }
            }

            result.change_set.new_trove(trove_cs);
        }

        self.add_files(&mut result.change_set, pending, options)?;

        info!(
            "Created changeset: {} troves, {} removed, {} contents, {} external troves, {} external files",
            result.change_set.troves().len(),
            result.change_set.removed_troves().len(),
            result.change_set.contents().len(),
            result.external_troves.len(),
            result.external_files.len()
        );
        Ok(result)
    }

    fn erase_job(
        &self,
        job: &ChangeSetJob,
        queue: &mut VecDeque<ChangeSetJob>,
        result: &mut ChangeSetResult,
    ) -> Result<()> {
        let Some((version, flavor)) = &job.old else {
            warn!("Ignoring empty job for {}", job.name);
            return Ok(());
        };

        if !self.is_local(version) {
            result.external_troves.push(job.clone());
            return Ok(());
        }

        let old = self.troves.get_trove(&job.name, version, flavor, false)?;
        for child in old.strong_troves() {
            queue.push_back(ChangeSetJob {
                name: child.name.clone(),
                old: Some((child.version.clone(), child.flavor.clone())),
                new: None,
                absolute: job.absolute,
            });
        }
        result.change_set.old_trove(old.identity());
        Ok(())
    }

    /// Add file changes and contents for every local file request
    ///
    /// Requests are handled in descending path id order across the whole
    /// changeset. Identical non-config contents are shipped once; later
    /// requests for the same hash become pointers to the first entry.
    fn add_files(
        &self,
        cs: &mut ChangeSet,
        mut pending: Vec<PendingFile>,
        options: ChangeSetOptions,
    ) -> Result<()> {
        if pending.is_empty() {
            return Ok(());
        }

        let mut keys: Vec<(PathId, FileId)> = Vec::with_capacity(pending.len() * 2);
        for file in &pending {
            if let Some(old_id) = file.request.old_file_id {
                keys.push((file.request.path_id, old_id));
            }
            keys.push((file.request.path_id, file.request.new_file_id));
        }
        let streams = self.troves.get_file_streams(&keys)?;

        pending.sort_by(|a, b| {
            (b.request.path_id, b.request.new_file_id, b.request.old_file_id)
                .cmp(&(a.request.path_id, a.request.new_file_id, a.request.old_file_id))
        });

        let mut pointers: HashMap<String, (PathId, FileId)> = HashMap::new();

        for PendingFile { trove, request } in pending {
            let lookup = |file_id: FileId| {
                streams
                    .get(&(request.path_id, file_id))
                    .ok_or_else(|| Error::FileStreamMissing(format!("{} {}", request.path_id, file_id)))
            };
            let new = lookup(request.new_file_id)?;
            let old = request.old_file_id.map(lookup).transpose()?;

            let (change, contents_changed) = file_change_set(old, new);
            cs.add_file(FileChangeEntry {
                path_id: request.path_id,
                old_file_id: request.old_file_id,
                new_file_id: request.new_file_id,
                change,
            });

            if !options.with_file_contents || (options.exclude_auto_source && new.flags.auto_source)
            {
                continue;
            }

            // Pristine contents must travel when a file turns into a config file
            let became_config = old.is_some_and(|old| new.is_config() && !old.is_config());
            if !contents_changed && !became_config {
                continue;
            }

            debug!("Adding contents for {} {}", trove, request.path_id);
            let contents = self.file_contents(&request, old, new, &mut pointers)?;
            cs.add_file_contents(contents);
        }

        Ok(())
    }

    fn file_contents(
        &self,
        request: &FileRequest,
        old: Option<&FileStream>,
        new: &FileStream,
        pointers: &mut HashMap<String, (PathId, FileId)>,
    ) -> Result<FileContentsEntry> {
        let mut entry = FileContentsEntry {
            path_id: request.path_id,
            file_id: request.new_file_id,
            is_config: new.is_config(),
            compressed: false,
            contents: FileContents::Absent,
        };

        let Some(sha256) = new.sha256.as_ref().filter(|_| new.has_contents()) else {
            return Ok(entry);
        };

        if new.is_config() {
            let new_bytes = self.contents.read(sha256)?;
            // Only a config file replacing a config file travels as a diff
            let old_sha = old
                .filter(|o| o.is_config() && o.has_contents())
                .and_then(|o| o.sha256.as_ref());

            let diff = match old_sha {
                Some(old_sha) => {
                    let old_bytes = self.contents.read(old_sha)?;
                    match (std::str::from_utf8(&old_bytes), std::str::from_utf8(&new_bytes)) {
                        (Ok(old_text), Ok(new_text)) => unified_diff(old_text, new_text),
                        _ => None,
                    }
                }
                None => None,
            };
            entry.contents = match diff {
                Some(diff) => FileContents::Diff(diff),
                None => FileContents::Full(new_bytes),
            };
            return Ok(entry);
        }

        if let Some(&(path_id, file_id)) = pointers.get(sha256) {
            entry.contents = FileContents::Pointer {
                path_id,
                file_id,
                sha256: sha256.clone(),
            };
            return Ok(entry);
        }

        pointers.insert(sha256.clone(), (request.path_id, request.new_file_id));
        entry.contents = FileContents::Full(self.contents.open_raw(sha256)?);
        entry.compressed = true;
        Ok(entry)
    }

    /// Store the troves a changeset carries
    ///
    /// Runs in one trove store transaction; any failure rolls it back and
    /// is returned. Contents already written to the content store stay
    /// there. Removals carried by the changeset are not applied.
    ///
    /// # Errors
    ///
    /// * `Error::Commit` if a trove is on the local host or the changeset's
    ///   pointers are out of order
    /// * `Error::Integrity` if contents do not match their file stream
    pub fn commit_change_set(&mut self, cs: &ChangeSet) -> Result<()> {
        for trove_cs in cs.troves() {
            if trove_cs.new_version.is_on_local_host() {
                return Err(Error::Commit(format!(
                    "{} is on a local label",
                    trove_cs.new_identity()
                )));
            }
        }
        cs.validate()?;

        self.troves.begin()?;
        match self.store_change_set(cs) {
            Ok(()) => {
                self.troves.commit()?;
                info!("Committed {} troves", cs.troves().len());
                Ok(())
            }
            Err(e) => {
                warn!("Commit failed, rolling back: {}", e);
                if let Err(rollback_err) = self.troves.rollback() {
                    warn!("Rollback failed: {}", rollback_err);
                }
                Err(e)
            }
        }
    }

    fn store_change_set(&mut self, cs: &ChangeSet) -> Result<()> {
        for trove_cs in cs.troves() {
            let old = match trove_cs.old_identity() {
                Some(id) => Some(self.troves.get_trove(&id.name, &id.version, &id.flavor, true)?),
                None => None,
            };
            let trove = trove_cs.apply(old.as_ref())?;

            for (path_id, file_id) in changed_streams(trove_cs) {
                self.store_file(cs, path_id, file_id)?;
            }

            self.troves.add_trove(&trove)?;
            debug!("Committed trove {}", trove.identity());
        }
        Ok(())
    }

    fn store_file(&mut self, cs: &ChangeSet, path_id: PathId, file_id: FileId) -> Result<()> {
        let Some(entry) = cs.get_file_change(path_id, file_id) else {
            // Shared with a trove that is already stored
            self.troves.get_file_streams(&[(path_id, file_id)])?;
            return Ok(());
        };

        let old = match entry.old_file_id {
            Some(old_id) => self
                .troves
                .get_file_streams(&[(path_id, old_id)])?
                .remove(&(path_id, old_id)),
            None => None,
        };
        let stream = entry.change.apply(old.as_ref())?;

        let actual = stream.file_id()?;
        if actual != file_id {
            return Err(Error::Integrity {
                expected: file_id.to_hex(),
                actual: actual.to_hex(),
            });
        }
        self.troves.add_file_stream(path_id, file_id, &stream)?;

        if let Some(sha256) = stream.sha256.as_ref().filter(|_| stream.has_contents()) {
            if !self.contents.has_file(sha256)? {
                self.store_contents(cs, path_id, file_id, sha256, old.as_ref())?;
            }
        }
        Ok(())
    }

    fn store_contents(
        &self,
        cs: &ChangeSet,
        path_id: PathId,
        file_id: FileId,
        sha256: &str,
        old: Option<&FileStream>,
    ) -> Result<()> {
        let entry = cs
            .get_contents(path_id, file_id)
            .and_then(|entry| cs.resolve(entry))
            .ok_or_else(|| Error::ContentsMissing(sha256.to_string()))?;

        // Compressed entries are stored as shipped once their hash checks out
        let (bytes, shipped) = match &entry.contents {
            FileContents::Full(data) if entry.compressed => {
                let mut bytes = Vec::new();
                GzDecoder::new(&data[..]).read_to_end(&mut bytes)?;
                (bytes, Some(data))
            }
            FileContents::Full(data) => (data.clone(), None),
            FileContents::Diff(diff) => {
                let old_sha = old
                    .and_then(|o| o.sha256.as_ref())
                    .ok_or_else(|| Error::Patch(format!("no old contents for {}", path_id)))?;
                let old_text = String::from_utf8(self.contents.read(old_sha)?)
                    .map_err(|e| Error::Patch(e.to_string()))?;
                (apply_diff(&old_text, diff)?.into_bytes(), None)
            }
            FileContents::Pointer { .. } | FileContents::Absent => {
                return Err(Error::ContentsMissing(sha256.to_string()));
            }
        };

        let actual = sha256_hex(&bytes);
        if actual != sha256 {
            return Err(Error::Integrity {
                expected: sha256.to_string(),
                actual,
            });
        }

        let stored = match shipped {
            Some(data) => self.contents.add_compressed(sha256, data),
            None => self.contents.add_file(sha256, &mut &bytes[..]).map(|_| ()),
        };
        match stored {
            Ok(()) => Ok(()),
            Err(Error::DuplicateHash(_)) => {
                debug!("Contents {} already stored", sha256);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// File streams a trove change set introduces
fn changed_streams(trove_cs: &TroveChangeSet) -> Vec<(PathId, FileId)> {
    let added = trove_cs
        .new_files
        .iter()
        .map(|(path_id, file)| (*path_id, file.file_id));
    let changed = trove_cs
        .changed_files
        .iter()
        .filter(|change| change.version.is_some())
        .map(|change| (change.path_id, change.file_id));
    added.chain(changed).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trove::{Trove, TroveIdentity, TroveRef};
    use tempfile::TempDir;

    const HOST: &str = "conary.example.com";

    fn version(text: &str, ts: f64) -> Version {
        Version::from_string_with_timestamps(text, &[ts]).unwrap()
    }

    fn repository() -> (TempDir, Repository<SqliteTroveStore>) {
        let dir = TempDir::new().unwrap();
        let repo = Repository::new(
            ServerNames::new([HOST]),
            SqliteTroveStore::in_memory().unwrap(),
            DataStore::new(dir.path()).unwrap(),
        );
        (dir, repo)
    }

    /// Store `stream` and its contents, returning the file id
    fn add_file(
        repo: &mut Repository<SqliteTroveStore>,
        trove: &mut Trove,
        path: &str,
        stream: &FileStream,
        contents: &[u8],
    ) -> PathId {
        let path_id = PathId::for_path(trove.name(), path);
        let file_id = stream.file_id().unwrap();
        repo.troves_mut()
            .add_file_stream(path_id, file_id, stream)
            .unwrap();
        if let Some(sha) = &stream.sha256 {
            if !repo.contents().has_file(sha).unwrap() {
                repo.contents().add_file(sha, &mut &contents[..]).unwrap();
            }
        }
        let file_version = trove.version().clone();
        trove.add_file(path_id, path, file_id, file_version);
        path_id
    }

    #[test]
    fn test_server_names() {
        let names = ServerNames::new([HOST]);
        assert!(names.is_local(&version("/conary.example.com@spc:devel/1-1-1", 1.0)));
        assert!(!names.is_local(&version("/other.example.com@spc:devel/1-1-1", 1.0)));
        assert!(!names.is_local(&Version::new_version()));

        let closure = |v: &Version| v.host() == Some("other.example.com");
        assert!(closure.is_local(&version("/other.example.com@spc:devel/1-1-1", 1.0)));
    }

    #[test]
    fn test_missing_trove_is_reported() {
        let (_dir, repo) = repository();
        let job = ChangeSetJob::install(
            "test",
            version("/conary.example.com@spc:devel/1.0-1-1", 1.0),
            Flavor::empty(),
            true,
        );
        assert!(matches!(
            repo.create_change_set(&[job], ChangeSetOptions::default()),
            Err(Error::TroveMissing(_))
        ));
    }

    #[test]
    fn test_foreign_jobs_are_deferred() {
        let (_dir, repo) = repository();
        let local = version("/conary.example.com@spc:devel/1.0-1-1", 1.0);
        let foreign = version("/other.example.com@spc:devel/1.0-1-1", 1.0);

        let jobs = vec![
            ChangeSetJob::install("a", foreign.clone(), Flavor::empty(), false),
            ChangeSetJob::update("b", (foreign.clone(), Flavor::empty()), (local, Flavor::empty())),
            ChangeSetJob::erase("c", foreign, Flavor::empty()),
        ];
        let result = repo
            .create_change_set(&jobs, ChangeSetOptions::default())
            .unwrap();
        assert_eq!(result.external_troves, jobs);
        assert!(result.change_set.is_empty());
    }

    #[test]
    fn test_absolute_changeset_with_contents() {
        let (_dir, mut repo) = repository();
        let v = version("/conary.example.com@spc:devel/1.0-1-1", 100.0);
        let mut trove = Trove::new("test", v.clone(), Flavor::empty());

        let conf = FileStream::regular(b"key=value\n", 0o644).config();
        let bin = FileStream::regular(b"\x7fELF", 0o755);
        let dir = FileStream::directory(0o755);
        let conf_id = add_file(&mut repo, &mut trove, "/etc/test.conf", &conf, b"key=value\n");
        let bin_id = add_file(&mut repo, &mut trove, "/usr/bin/test", &bin, b"\x7fELF");
        let dir_id = add_file(&mut repo, &mut trove, "/usr/share/test", &dir, b"");
        repo.troves_mut().add_trove(&trove).unwrap();

        let job = ChangeSetJob::install("test", v, Flavor::empty(), true);
        let result = repo
            .create_change_set(&[job], ChangeSetOptions::default())
            .unwrap();
        let cs = &result.change_set;

        assert_eq!(cs.troves().len(), 1);
        assert!(cs.troves()[0].absolute);
        assert_eq!(cs.file_changes().len(), 3);
        assert!(cs.file_changes().iter().all(|f| f.change.is_absolute()));

        // Directories have no contents to ship
        assert_eq!(cs.contents().len(), 2);
        assert!(cs.get_contents(dir_id, dir.file_id().unwrap()).is_none());

        let conf_entry = cs.get_contents(conf_id, conf.file_id().unwrap()).unwrap();
        assert!(conf_entry.is_config);
        assert!(!conf_entry.compressed);
        assert_eq!(conf_entry.contents, FileContents::Full(b"key=value\n".to_vec()));

        let bin_entry = cs.get_contents(bin_id, bin.file_id().unwrap()).unwrap();
        assert!(bin_entry.compressed);

        let mut keys: Vec<PathId> = cs.file_changes().iter().map(|f| f.path_id).collect();
        let mut sorted = keys.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(keys, sorted);
        keys.dedup();
        assert_eq!(keys.len(), 3);
    }

    #[test]
    fn test_identical_contents_become_pointers() {
        let (_dir, mut repo) = repository();
        let v = version("/conary.example.com@spc:devel/1.0-1-1", 100.0);
        let mut trove = Trove::new("test", v.clone(), Flavor::empty());

        let stream = FileStream::regular(b"same", 0o644);
        add_file(&mut repo, &mut trove, "/usr/share/a", &stream, b"same");
        add_file(&mut repo, &mut trove, "/usr/share/b", &stream, b"same");
        add_file(&mut repo, &mut trove, "/usr/share/c", &stream, b"same");
        repo.troves_mut().add_trove(&trove).unwrap();

        let job = ChangeSetJob::install("test", v, Flavor::empty(), true);
        let cs = repo
            .create_change_set(&[job], ChangeSetOptions::default())
            .unwrap()
            .change_set;

        let contents = cs.contents();
        assert_eq!(contents.len(), 3);
        assert!(!contents[0].is_pointer());
        assert!(contents[1..].iter().all(FileContentsEntry::is_pointer));
        for entry in &contents[1..] {
            assert_eq!(cs.resolve(entry), Some(&contents[0]));
            assert!(!entry.compressed);
        }
        cs.validate().unwrap();
    }

    #[test]
    fn test_config_update_ships_diff() {
        let (_dir, mut repo) = repository();
        let v1 = version("/conary.example.com@spc:devel/1.0-1-1", 100.0);
        let v2 = version("/conary.example.com@spc:devel/1.0-1-2", 200.0);

        let mut old = Trove::new("test", v1.clone(), Flavor::empty());
        let conf1 = FileStream::regular(b"a=1\nb=2\n", 0o644).config();
        let path_id = add_file(&mut repo, &mut old, "/etc/test.conf", &conf1, b"a=1\nb=2\n");
        repo.troves_mut().add_trove(&old).unwrap();

        let mut new = Trove::new("test", v2.clone(), Flavor::empty());
        let conf2 = FileStream::regular(b"a=1\nb=3\n", 0o644).config();
        add_file(&mut repo, &mut new, "/etc/test.conf", &conf2, b"a=1\nb=3\n");
        repo.troves_mut().add_trove(&new).unwrap();

        let job = ChangeSetJob::update("test", (v1, Flavor::empty()), (v2, Flavor::empty()));
        let cs = repo
            .create_change_set(&[job], ChangeSetOptions::default())
            .unwrap()
            .change_set;

        let entry = cs.get_contents(path_id, conf2.file_id().unwrap()).unwrap();
        match &entry.contents {
            FileContents::Diff(diff) => {
                assert_eq!(apply_diff("a=1\nb=2\n", diff).unwrap(), "a=1\nb=3\n");
            }
            other => panic!("expected a diff, got {:?}", other),
        }
        assert!(!cs.file_changes()[0].change.is_absolute());
    }

    /// Ship an update of /etc/test.conf from `old_stream` to `new_stream`
    fn update_contents(
        old_stream: &FileStream,
        old_bytes: &[u8],
        new_stream: &FileStream,
        new_bytes: &[u8],
    ) -> FileContentsEntry {
        let (_dir, mut repo) = repository();
        let v1 = version("/conary.example.com@spc:devel/1.0-1-1", 100.0);
        let v2 = version("/conary.example.com@spc:devel/1.0-1-2", 200.0);

        let mut old = Trove::new("test", v1.clone(), Flavor::empty());
        let path_id = add_file(&mut repo, &mut old, "/etc/test.conf", old_stream, old_bytes);
        repo.troves_mut().add_trove(&old).unwrap();

        let mut new = Trove::new("test", v2.clone(), Flavor::empty());
        add_file(&mut repo, &mut new, "/etc/test.conf", new_stream, new_bytes);
        repo.troves_mut().add_trove(&new).unwrap();

        let job = ChangeSetJob::update("test", (v1, Flavor::empty()), (v2, Flavor::empty()));
        let cs = repo
            .create_change_set(&[job], ChangeSetOptions::default())
            .unwrap()
            .change_set;
        cs.get_contents(path_id, new_stream.file_id().unwrap())
            .unwrap()
            .clone()
    }

    #[test]
    fn test_file_turning_config_ships_full_contents() {
        let plain = FileStream::regular(b"a=1\n", 0o644);
        let config = FileStream::regular(b"a=1\n", 0o644).config();

        let entry = update_contents(&plain, b"a=1\n", &config, b"a=1\n");
        assert!(entry.is_config);
        assert!(!entry.compressed);
        assert_eq!(entry.contents, FileContents::Full(b"a=1\n".to_vec()));
    }

    #[test]
    fn test_large_config_rewrite_ships_full_contents() {
        let old_text: String = (0..20_000).map(|i| format!("old{}\n", i)).collect();
        let new_text: String = (0..20_000).map(|i| format!("new{}\n", i)).collect();
        let old_conf = FileStream::regular(old_text.as_bytes(), 0o644).config();
        let new_conf = FileStream::regular(new_text.as_bytes(), 0o644).config();

        let entry = update_contents(&old_conf, old_text.as_bytes(), &new_conf, new_text.as_bytes());
        assert_eq!(entry.contents, FileContents::Full(new_text.into_bytes()));
    }

    #[test]
    fn test_exclude_auto_source_and_no_contents() {
        let (_dir, mut repo) = repository();
        let v = version("/conary.example.com@spc:devel/1.0-1-1", 100.0);
        let mut trove = Trove::new("test:source", v.clone(), Flavor::empty());
        let tarball = FileStream::regular(b"tarball", 0o644).auto_source();
        add_file(&mut repo, &mut trove, "test-1.0.tar.gz", &tarball, b"tarball");
        repo.troves_mut().add_trove(&trove).unwrap();

        let job = ChangeSetJob::install("test:source", v, Flavor::empty(), true);
        let options = ChangeSetOptions {
            exclude_auto_source: true,
            ..ChangeSetOptions::default()
        };
        let cs = repo.create_change_set(&[job.clone()], options).unwrap().change_set;
        assert_eq!(cs.file_changes().len(), 1);
        assert!(cs.contents().is_empty());

        let options = ChangeSetOptions {
            with_file_contents: false,
            ..ChangeSetOptions::default()
        };
        let cs = repo.create_change_set(&[job.clone()], options).unwrap().change_set;
        assert!(cs.contents().is_empty());

        let options = ChangeSetOptions {
            with_files: false,
            ..ChangeSetOptions::default()
        };
        let cs = repo.create_change_set(&[job], options).unwrap().change_set;
        assert!(cs.file_changes().is_empty());
    }

    #[test]
    fn test_recursion_and_duplicates() {
        let (_dir, mut repo) = repository();
        let v = version("/conary.example.com@spc:devel/1.0-1-1", 100.0);
        let child = Trove::new("test:runtime", v.clone(), Flavor::empty());
        repo.troves_mut().add_trove(&child).unwrap();

        let mut group = Trove::new("group-test", v.clone(), Flavor::empty());
        group.add_trove(child.identity(), TroveRef::strong(true));
        repo.troves_mut().add_trove(&group).unwrap();

        let job = ChangeSetJob::install("group-test", v.clone(), Flavor::empty(), true);
        let child_job = ChangeSetJob::install("test:runtime", v.clone(), Flavor::empty(), true);

        let cs = repo
            .create_change_set(&[job.clone(), child_job], ChangeSetOptions::default())
            .unwrap()
            .change_set;
        assert_eq!(cs.troves().len(), 2);

        let options = ChangeSetOptions {
            recurse: false,
            ..ChangeSetOptions::default()
        };
        let cs = repo.create_change_set(&[job], options).unwrap().change_set;
        assert_eq!(cs.troves().len(), 1);
    }

    #[test]
    fn test_erase_recurses_into_strong_troves() {
        let (_dir, mut repo) = repository();
        let v = version("/conary.example.com@spc:devel/1.0-1-1", 100.0);
        let foreign = version("/other.example.com@spc:devel/1.0-1-1", 100.0);

        let child = Trove::new("test:runtime", v.clone(), Flavor::empty());
        repo.troves_mut().add_trove(&child).unwrap();
        let mut group = Trove::new("group-test", v.clone(), Flavor::empty());
        group.add_trove(child.identity(), TroveRef::strong(true));
        group.add_trove(
            TroveIdentity::new("weak:runtime", v.clone(), Flavor::empty()),
            TroveRef::weak(true),
        );
        group.add_trove(
            TroveIdentity::new("remote", foreign.clone(), Flavor::empty()),
            TroveRef::strong(true),
        );
        repo.troves_mut().add_trove(&group).unwrap();

        let job = ChangeSetJob::erase("group-test", v, Flavor::empty());
        let result = repo
            .create_change_set(&[job], ChangeSetOptions::default())
            .unwrap();

        let removed: Vec<&str> = result
            .change_set
            .removed_troves()
            .iter()
            .map(|id| id.name.as_str())
            .collect();
        assert_eq!(removed, vec!["group-test", "test:runtime"]);
        assert_eq!(
            result.external_troves,
            vec![ChangeSetJob::erase("remote", foreign, Flavor::empty())]
        );
    }

    #[test]
    fn test_commit_round_trip() {
        let (_src_dir, mut source) = repository();
        let (_dst_dir, mut target) = repository();

        let v = version("/conary.example.com@spc:devel/1.0-1-1", 100.0);
        let mut trove = Trove::new("test", v.clone(), Flavor::empty());
        let conf = FileStream::regular(b"x=1\n", 0o644).config();
        let data = FileStream::regular(b"shared", 0o644);
        add_file(&mut source, &mut trove, "/etc/test.conf", &conf, b"x=1\n");
        add_file(&mut source, &mut trove, "/usr/share/one", &data, b"shared");
        add_file(&mut source, &mut trove, "/usr/share/two", &data, b"shared");
        source.troves_mut().add_trove(&trove).unwrap();

        let job = ChangeSetJob::install("test", v.clone(), Flavor::empty(), true);
        let cs = source
            .create_change_set(&[job], ChangeSetOptions::default())
            .unwrap()
            .change_set;
        target.commit_change_set(&cs).unwrap();

        let stored = target
            .troves()
            .get_trove("test", &v, &Flavor::empty(), true)
            .unwrap();
        assert_eq!(stored, trove);
        assert_eq!(
            target.contents().read(data.sha256.as_ref().unwrap()).unwrap(),
            b"shared"
        );
        assert_eq!(
            target.contents().read(conf.sha256.as_ref().unwrap()).unwrap(),
            b"x=1\n"
        );
    }

    #[test]
    fn test_commit_keeps_compressed_contents_as_shipped() {
        let (_src_dir, mut source) = repository();
        let (_dst_dir, mut target) = repository();

        let v = version("/conary.example.com@spc:devel/1.0-1-1", 100.0);
        let mut trove = Trove::new("test", v.clone(), Flavor::empty());
        let bin = FileStream::regular(b"\x7fELF binary", 0o755);
        let path_id = add_file(&mut source, &mut trove, "/usr/bin/test", &bin, b"\x7fELF binary");
        source.troves_mut().add_trove(&trove).unwrap();

        let job = ChangeSetJob::install("test", v, Flavor::empty(), true);
        let cs = source
            .create_change_set(&[job], ChangeSetOptions::default())
            .unwrap()
            .change_set;
        let entry = cs.get_contents(path_id, bin.file_id().unwrap()).unwrap();
        assert!(entry.compressed);
        let FileContents::Full(shipped) = &entry.contents else {
            panic!("expected full contents, got {:?}", entry.contents);
        };

        target.commit_change_set(&cs).unwrap();
        let sha = bin.sha256.as_ref().unwrap();
        assert_eq!(&target.contents().open_raw(sha).unwrap(), shipped);
        assert_eq!(target.contents().read(sha).unwrap(), b"\x7fELF binary");
    }

    #[test]
    fn test_commit_rejects_local_versions() {
        let (_dir, mut repo) = repository();
        let v = Version::parse("/local@local:COOK/1.0-1-1").unwrap();
        let trove = Trove::new("test", v, Flavor::empty());
        let (trove_cs, _, _) = trove.diff(None, true);

        let mut cs = ChangeSet::new();
        cs.new_trove(trove_cs);
        assert!(matches!(repo.commit_change_set(&cs), Err(Error::Commit(_))));
    }

    #[test]
    fn test_commit_rolls_back_on_bad_contents() {
        let (_src_dir, mut source) = repository();
        let (_dst_dir, mut target) = repository();

        let v = version("/conary.example.com@spc:devel/1.0-1-1", 100.0);
        let mut trove = Trove::new("test", v.clone(), Flavor::empty());
        let stream = FileStream::regular(b"expected", 0o644);
        add_file(&mut source, &mut trove, "/usr/share/file", &stream, b"expected");
        source.troves_mut().add_trove(&trove).unwrap();

        let job = ChangeSetJob::install("test", v.clone(), Flavor::empty(), true);
        let cs = source
            .create_change_set(&[job], ChangeSetOptions::default())
            .unwrap()
            .change_set;

        // Rebuild the changeset with tampered contents
        let mut tampered = ChangeSet::new();
        for trove_cs in cs.troves() {
            tampered.new_trove(trove_cs.clone());
        }
        for file in cs.file_changes() {
            tampered.add_file(file.clone());
        }
        for entry in cs.contents() {
            tampered.add_file_contents(FileContentsEntry {
                contents: FileContents::Full(b"tampered".to_vec()),
                compressed: false,
                ..entry.clone()
            });
        }

        assert!(matches!(
            target.commit_change_set(&tampered),
            Err(Error::Integrity { .. })
        ));
        assert!(
            !target
                .troves()
                .has_trove("test", &v, &Flavor::empty())
                .unwrap()
        );
    }
}
