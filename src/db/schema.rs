// src/db/schema.rs

//! Trove store schema and migrations
//!
//! Versions are stored in frozen form so timestamps survive a round trip.
//! The display form is kept alongside for lookups typed by hand.

use crate::error::{Error, Result};
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the schema version tracking table
fn init_schema_version(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    init_schema_version(conn)?;

    let version = conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    Ok(())
}

/// Apply all pending migrations to bring the database up to date
pub fn migrate(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;
    debug!("Current schema version: {}", current_version);

    if current_version >= SCHEMA_VERSION {
        return Ok(());
    }

    for version in (current_version + 1)..=SCHEMA_VERSION {
        info!("Applying migration to version {}", version);
        apply_migration(conn, version)?;
        set_schema_version(conn, version)?;
    }

    Ok(())
}

fn apply_migration(conn: &Connection, version: i32) -> Result<()> {
    match version {
        1 => migrate_v1(conn),
        _ => Err(Error::InitError(format!(
            "Unknown migration version: {}",
            version
        ))),
    }
}

/// Initial schema
///
/// - troves: one row per (name, version, flavor)
/// - trove_files: the file list of each trove
/// - trove_troves: contained-trove references
/// - file_streams: frozen file metadata keyed by (path id, file id)
fn migrate_v1(conn: &Connection) -> Result<()> {
    debug!("Creating schema version 1");

    conn.execute_batch(
        "
        CREATE TABLE troves (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            version TEXT NOT NULL,
            version_string TEXT NOT NULL,
            flavor TEXT NOT NULL,
            info TEXT NOT NULL,
            UNIQUE(name, version, flavor)
        );

        CREATE INDEX idx_troves_name ON troves(name);

        CREATE TABLE trove_files (
            trove_id INTEGER NOT NULL,
            path_id TEXT NOT NULL,
            path TEXT NOT NULL,
            file_id TEXT NOT NULL,
            version TEXT NOT NULL,
            PRIMARY KEY (trove_id, path_id),
            FOREIGN KEY (trove_id) REFERENCES troves(id) ON DELETE CASCADE
        );

        CREATE TABLE trove_troves (
            trove_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            version TEXT NOT NULL,
            flavor TEXT NOT NULL,
            by_default INTEGER NOT NULL,
            weak INTEGER NOT NULL,
            PRIMARY KEY (trove_id, name, version, flavor),
            FOREIGN KEY (trove_id) REFERENCES troves(id) ON DELETE CASCADE
        );

        CREATE TABLE file_streams (
            path_id TEXT NOT NULL,
            file_id TEXT NOT NULL,
            stream TEXT NOT NULL,
            PRIMARY KEY (path_id, file_id)
        );
        ",
    )?;

    info!("Schema version 1 created successfully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn create_test_db() -> (NamedTempFile, Connection) {
        let temp_file = NamedTempFile::new().unwrap();
        let conn = Connection::open(temp_file.path()).unwrap();
        (temp_file, conn)
    }

    #[test]
    fn test_schema_version_tracking() {
        let (_temp, conn) = create_test_db();
        assert_eq!(get_schema_version(&conn).unwrap(), 0);

        migrate(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_migrate_creates_all_tables() {
        let (_temp, conn) = create_test_db();
        migrate(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<_, _>>()
            .unwrap();

        for table in ["troves", "trove_files", "trove_troves", "file_streams", "schema_version"] {
            assert!(tables.contains(&table.to_string()), "missing {}", table);
        }
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let (_temp, conn) = create_test_db();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_troves_unique_identity() {
        let (_temp, conn) = create_test_db();
        migrate(&conn).unwrap();

        let insert = "INSERT INTO troves (name, version, version_string, flavor, info)
                      VALUES (?1, ?2, ?3, ?4, '{}')";
        conn.execute(insert, ["test", "/a@b:c/0.000:1-1", "/a@b:c/1-1", ""])
            .unwrap();
        assert!(
            conn.execute(insert, ["test", "/a@b:c/0.000:1-1", "/a@b:c/1-1", ""])
                .is_err()
        );
        conn.execute(insert, ["test", "/a@b:c/0.000:1-1", "/a@b:c/1-1", "x86"])
            .unwrap();
    }

    #[test]
    fn test_foreign_key_constraints() {
        let (_temp, conn) = create_test_db();
        conn.execute("PRAGMA foreign_keys = ON", []).unwrap();
        migrate(&conn).unwrap();

        let result = conn.execute(
            "INSERT INTO trove_files (trove_id, path_id, path, file_id, version)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            ["999", "00", "/usr/bin/test", "11", "/a@b:c/0.000:1-1"],
        );
        assert!(result.is_err());
    }
}
