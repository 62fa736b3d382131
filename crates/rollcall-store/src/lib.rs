//! rollcall-store: Persistence for the enrolled roster.
//!
//! The roster is one JSON object (`{name: identity}`) kept under a single
//! key in a SQLite key-value table, so every save replaces it atomically.
//! Thumbnails are PNG files in a separate directory, one per name.

pub mod codec;
pub mod sqlite;
pub mod thumbnails;

pub use codec::{LoadedRoster, SkippedEntry};
pub use sqlite::SqliteStore;
pub use thumbnails::ThumbnailDir;

use rollcall_core::Identity;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("persisted roster is corrupt: {0}")]
    Corrupt(String),
    #[error("invalid storage key {0:?}")]
    InvalidKey(String),
}

/// Backend holding the roster blob and the thumbnail files.
///
/// Every method is one independent write or read; callers serialize
/// access (the daemon holds the store behind the roster lock).
pub trait RosterStore: Send {
    /// Read every persisted identity. Undecodable entries are skipped and
    /// reported, not fatal.
    fn load_identities(&self) -> Result<LoadedRoster, StoreError>;

    /// Replace the persisted roster with `identities` in one write.
    fn save_identities(&mut self, identities: &[Identity]) -> Result<(), StoreError>;

    fn load_thumbnail(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn save_thumbnail(&mut self, name: &str, bytes: &[u8]) -> Result<(), StoreError>;

    /// Returns whether a thumbnail existed.
    fn delete_thumbnail(&mut self, name: &str) -> Result<bool, StoreError>;

    /// Names that currently have a stored thumbnail.
    fn thumbnail_names(&self) -> Result<Vec<String>, StoreError>;
}
