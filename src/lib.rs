// src/lib.rs

//! Conary repository core
//!
//! Versioning, changeset computation and content storage for the Conary
//! package repository.
//!
//! # Architecture
//!
//! - Versions: label paths with per-hop revisions and timestamps, covering
//!   branches and shadows
//! - Troves: named, versioned, flavored units holding files and other troves
//! - Changesets: minimal diffs between trove states, with de-duplicated
//!   file contents and cross-repository work handed back to the caller
//! - Content store: write-once, gzip-compressed blobs addressed by sha256
//! - Database-first: troves and file streams live in SQLite

pub mod changeset;
pub mod datastore;
pub mod db;
mod error;
pub mod files;
pub mod flavor;
pub mod repository;
pub mod trove;
pub mod version;

pub use error::{Error, Result};
