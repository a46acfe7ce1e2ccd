// src/db/store.rs

//! SQLite-backed trove store

use super::schema;
use crate::error::{Error, Result};
use crate::files::{FileId, FileStream, PathId};
use crate::flavor::Flavor;
use crate::repository::TroveStore;
use crate::trove::{Trove, TroveIdentity, TroveInfo, TroveRef};
use crate::version::Version;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Key pairs bound per file stream query
const STREAM_BATCH: usize = 400;

pub struct SqliteTroveStore {
    conn: Connection,
}

impl SqliteTroveStore {
    /// Open a database created by [`super::init`]
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = super::open(db_path)?;
        schema::migrate(&conn)?;
        Ok(Self { conn })
    }

    /// A throwaway store, mostly for tests
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        schema::migrate(&conn)?;
        Ok(Self { conn })
    }

    fn trove_row(
        &self,
        name: &str,
        version: &Version,
        flavor: &Flavor,
    ) -> Result<Option<(i64, String)>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, info FROM troves WHERE name = ?1 AND version = ?2 AND flavor = ?3",
                params![name, version.freeze(), flavor.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row)
    }

    /// Every stored trove, optionally limited to one name
    pub fn list_troves(&self, name: Option<&str>) -> Result<Vec<TroveIdentity>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, version, flavor FROM troves
             WHERE ?1 IS NULL OR name = ?1
             ORDER BY name, id",
        )?;
        let rows = stmt
            .query_map(params![name], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(name, version, flavor)| {
                Ok(TroveIdentity::new(
                    &name,
                    Version::thaw(&version)?,
                    Flavor::new(flavor),
                ))
            })
            .collect()
    }

    /// Look a trove up by the display form of its version
    ///
    /// Hand-typed versions carry no timestamps, so they cannot be matched
    /// against the frozen form. The most recently stored match wins.
    pub fn find_trove(
        &self,
        name: &str,
        version: &str,
        flavor: &Flavor,
    ) -> Result<Option<TroveIdentity>> {
        let frozen: Option<String> = self
            .conn
            .query_row(
                "SELECT version FROM troves
                 WHERE name = ?1 AND version_string = ?2 AND flavor = ?3
                 ORDER BY id DESC LIMIT 1",
                params![name, version, flavor.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        frozen
            .map(|frozen| {
                Ok(TroveIdentity::new(
                    name,
                    Version::thaw(&frozen)?,
                    flavor.clone(),
                ))
            })
            .transpose()
    }
}

fn insert_trove(conn: &Connection, trove: &Trove) -> Result<()> {
    conn.execute(
        "INSERT INTO troves (name, version, version_string, flavor, info)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            trove.name(),
            trove.version().freeze(),
            trove.version().as_string(),
            trove.flavor().as_str(),
            serde_json::to_string(trove.info())?,
        ],
    )?;
    let trove_id = conn.last_insert_rowid();

    let mut stmt = conn.prepare_cached(
        "INSERT INTO trove_files (trove_id, path_id, path, file_id, version)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    for (path_id, file) in trove.files() {
        stmt.execute(params![
            trove_id,
            path_id.to_hex(),
            file.path,
            file.file_id.to_hex(),
            file.version.freeze(),
        ])?;
    }

    let mut stmt = conn.prepare_cached(
        "INSERT INTO trove_troves (trove_id, name, version, flavor, by_default, weak)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    for (identity, reference) in trove.troves() {
        stmt.execute(params![
            trove_id,
            identity.name,
            identity.version.freeze(),
            identity.flavor.as_str(),
            reference.by_default,
            reference.weak,
        ])?;
    }

    debug!(
        "Stored trove {} with {} files",
        trove.identity(),
        trove.file_count()
    );
    Ok(())
}

impl TroveStore for SqliteTroveStore {
    fn get_trove(
        &self,
        name: &str,
        version: &Version,
        flavor: &Flavor,
        with_files: bool,
    ) -> Result<Trove> {
        let (trove_id, info) = self.trove_row(name, version, flavor)?.ok_or_else(|| {
            Error::TroveMissing(TroveIdentity::new(name, version.clone(), flavor.clone()).to_string())
        })?;

        let mut trove = Trove::new(name, version.clone(), flavor.clone());
        trove.set_info(serde_json::from_str::<TroveInfo>(&info)?);

        if with_files {
            let mut stmt = self.conn.prepare_cached(
                "SELECT path_id, path, file_id, version FROM trove_files WHERE trove_id = ?1",
            )?;
            let files = stmt
                .query_map(params![trove_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            for (path_id, path, file_id, file_version) in files {
                trove.add_file(
                    PathId::from_hex(&path_id)?,
                    &path,
                    FileId::from_hex(&file_id)?,
                    Version::thaw(&file_version)?,
                );
            }
        }

        let mut stmt = self.conn.prepare_cached(
            "SELECT name, version, flavor, by_default, weak FROM trove_troves WHERE trove_id = ?1",
        )?;
        let troves = stmt
            .query_map(params![trove_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, bool>(3)?,
                    row.get::<_, bool>(4)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        for (child, child_version, child_flavor, by_default, weak) in troves {
            trove.add_trove(
                TroveIdentity::new(&child, Version::thaw(&child_version)?, Flavor::new(child_flavor)),
                TroveRef { by_default, weak },
            );
        }

        Ok(trove)
    }

    fn has_trove(&self, name: &str, version: &Version, flavor: &Flavor) -> Result<bool> {
        Ok(self.trove_row(name, version, flavor)?.is_some())
    }

    fn get_file_streams(
        &self,
        requests: &[(PathId, FileId)],
    ) -> Result<HashMap<(PathId, FileId), FileStream>> {
        let mut seen = HashSet::with_capacity(requests.len());
        let unique: Vec<(PathId, FileId)> = requests
            .iter()
            .copied()
            .filter(|key| seen.insert(*key))
            .collect();

        let mut streams = HashMap::with_capacity(unique.len());
        for chunk in unique.chunks(STREAM_BATCH) {
            let sql = format!(
                "SELECT path_id, file_id, stream FROM file_streams
                 WHERE (path_id, file_id) IN (VALUES {})",
                vec!["(?, ?)"; chunk.len()].join(", ")
            );
            let keys: Vec<String> = chunk
                .iter()
                .flat_map(|(path_id, file_id)| [path_id.to_hex(), file_id.to_hex()])
                .collect();

            let mut stmt = self.conn.prepare_cached(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(keys.iter()), |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            for (path_id, file_id, frozen) in rows {
                let key = (PathId::from_hex(&path_id)?, FileId::from_hex(&file_id)?);
                streams.insert(key, FileStream::thaw(&frozen)?);
            }
        }

        if let Some((path_id, file_id)) = unique.iter().find(|key| !streams.contains_key(*key)) {
            return Err(Error::FileStreamMissing(format!("{} {}", path_id, file_id)));
        }

        debug!("Loaded {} file streams", streams.len());
        Ok(streams)
    }

    fn add_trove(&mut self, trove: &Trove) -> Result<()> {
        if self.conn.is_autocommit() {
            super::transaction(&mut self.conn, |tx| insert_trove(tx, trove))
        } else {
            insert_trove(&self.conn, trove)
        }
    }

    fn add_file_stream(
        &mut self,
        path_id: PathId,
        file_id: FileId,
        stream: &FileStream,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO file_streams (path_id, file_id, stream) VALUES (?1, ?2, ?3)",
            params![path_id.to_hex(), file_id.to_hex(), stream.freeze()?],
        )?;
        Ok(())
    }

    fn begin(&mut self) -> Result<()> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }
}
