// src/repository/trovestore.rs

//! Trove store interface
//!
//! The changeset engine reads troves and file streams through this trait
//! and the commit path writes through it. Writes made between
//! [`TroveStore::begin`] and [`TroveStore::commit`] become visible
//! together or, after [`TroveStore::rollback`], not at all.

use crate::error::Result;
use crate::files::{FileId, FileStream, PathId};
use crate::flavor::Flavor;
use crate::trove::Trove;
use crate::version::Version;
use std::collections::HashMap;

pub trait TroveStore {
    /// Load a trove, with its file list when `with_files` is set
    ///
    /// # Errors
    ///
    /// * `Error::TroveMissing` if no such trove is stored
    fn get_trove(
        &self,
        name: &str,
        version: &Version,
        flavor: &Flavor,
        with_files: bool,
    ) -> Result<Trove>;

    fn has_trove(&self, name: &str, version: &Version, flavor: &Flavor) -> Result<bool>;

    /// Fetch many file streams at once
    ///
    /// # Errors
    ///
    /// * `Error::FileStreamMissing` if any requested stream is absent
    fn get_file_streams(
        &self,
        requests: &[(PathId, FileId)],
    ) -> Result<HashMap<(PathId, FileId), FileStream>>;

    /// Store a trove; storing the same trove twice is an error
    fn add_trove(&mut self, trove: &Trove) -> Result<()>;

    /// Store a file stream; storing an identical stream again is a no-op
    fn add_file_stream(&mut self, path_id: PathId, file_id: FileId, stream: &FileStream)
    -> Result<()>;

    fn begin(&mut self) -> Result<()>;

    fn commit(&mut self) -> Result<()>;

    fn rollback(&mut self) -> Result<()>;
}
