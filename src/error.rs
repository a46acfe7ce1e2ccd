// src/error.rs

use thiserror::Error;

/// Core error types for conary-core
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed label, revision or version string
    #[error("Parse error: {0}")]
    Parse(#[from] crate::version::ParseError),

    /// Invalid operation on a version
    #[error("Version error: {0}")]
    Version(#[from] crate::version::VersionError),

    /// Content store key too short to be split into a path
    #[error("Invalid content hash: {0:?}")]
    InvalidHash(String),

    /// Content store entry already exists
    #[error("Content hash already stored: {0}")]
    DuplicateHash(String),

    /// Content store root is not a directory
    #[error("Not a directory: {0}")]
    NotADirectory(String),

    /// Trove requested by a changeset job is not in the trove store
    #[error("Trove not found: {0}")]
    TroveMissing(String),

    /// File stream referenced by a trove is not in the trove store
    #[error("File stream not found: {0}")]
    FileStreamMissing(String),

    /// File contents referenced by a file stream are not in the content store
    #[error("File contents not found: {0}")]
    ContentsMissing(String),

    /// Changeset cannot be committed to this repository
    #[error("Commit rejected: {0}")]
    Commit(String),

    /// Contents do not match the hash recorded in their file stream
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    /// Config file diff does not apply to the stored contents
    #[error("Failed to apply diff: {0}")]
    Patch(String),

    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization of file streams or trove metadata failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Database initialization error
    #[error("Failed to initialize database: {0}")]
    InitError(String),

    /// Database not found
    #[error("Database not found at path: {0}")]
    DatabaseNotFound(String),
}

/// Result type alias using conary-core's Error type
pub type Result<T> = std::result::Result<T, Error>;
