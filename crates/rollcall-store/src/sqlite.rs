//! SQLite-backed [`RosterStore`].

use crate::codec::{self, LoadedRoster};
use crate::thumbnails::ThumbnailDir;
use crate::{RosterStore, StoreError};
use rollcall_core::Identity;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

/// Key the roster blob is stored under.
const ROSTER_KEY: &str = "identities";

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS kv (
    key   TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
)";

pub struct SqliteStore {
    conn: Connection,
    thumbnails: ThumbnailDir,
}

impl SqliteStore {
    /// Open (or create) the database at `db_path` and the thumbnail
    /// directory at `thumbnail_dir`.
    pub fn open(db_path: &Path, thumbnail_dir: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        tracing::info!(db = %db_path.display(), thumbnails = %thumbnail_dir.display(), "opened roster store");
        Self::with_connection(conn, ThumbnailDir::open(thumbnail_dir)?)
    }

    /// In-memory database; thumbnails still go to `thumbnail_dir`.
    pub fn open_in_memory(thumbnail_dir: &Path) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?, ThumbnailDir::open(thumbnail_dir)?)
    }

    fn with_connection(conn: Connection, thumbnails: ThumbnailDir) -> Result<Self, StoreError> {
        conn.execute(SCHEMA, [])?;
        Ok(Self { conn, thumbnails })
    }

    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?)
    }

    fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }
}

impl RosterStore for SqliteStore {
    fn load_identities(&self) -> Result<LoadedRoster, StoreError> {
        match self.get(ROSTER_KEY)? {
            Some(blob) => codec::decode_roster(&blob),
            None => Ok(LoadedRoster::default()),
        }
    }

    fn save_identities(&mut self, identities: &[Identity]) -> Result<(), StoreError> {
        let blob = codec::encode_roster(identities)?;
        self.put(ROSTER_KEY, &blob)
    }

    fn load_thumbnail(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.thumbnails.load(name)
    }

    fn save_thumbnail(&mut self, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.thumbnails.save(name, bytes)
    }

    fn delete_thumbnail(&mut self, name: &str) -> Result<bool, StoreError> {
        self.thumbnails.delete(name)
    }

    fn thumbnail_names(&self) -> Result<Vec<String>, StoreError> {
        self.thumbnails.names()
    }
}
