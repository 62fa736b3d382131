//! The in-memory roster and its persistence protocol.
//!
//! The roster only changes after the store has accepted the change: every
//! mutation builds the next roster, persists it, and swaps it in on
//! success. Readers take an `Arc` snapshot and never hold the lock while
//! matching.

use rollcall_core::Identity;
use rollcall_store::{RosterStore, StoreError};
use std::sync::{Arc, Mutex, MutexGuard};

struct Inner {
    entries: Arc<Vec<Identity>>,
    store: Box<dyn RosterStore>,
}

pub struct Roster {
    inner: Mutex<Inner>,
    /// Embedding length produced by the loaded model, if known.
    dimension: Option<usize>,
}

impl Roster {
    /// An empty roster over `store`. Call [`load`](Self::load) to populate it.
    pub fn new(store: Box<dyn RosterStore>, dimension: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: Arc::new(Vec::new()),
                store,
            }),
            dimension,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the in-memory roster with the persisted one.
    ///
    /// Corrupt entries and entries of the wrong embedding length are
    /// dropped with a warning. Thumbnails without an identity are deleted.
    pub fn load(&self) -> Result<usize, StoreError> {
        let mut inner = self.lock();
        let loaded = inner.store.load_identities()?;

        for skipped in &loaded.skipped {
            tracing::warn!(key = %skipped.key, reason = %skipped.reason, "dropping corrupt roster entry");
        }

        let entries: Vec<Identity> = loaded
            .identities
            .into_iter()
            .filter(|identity| match self.dimension {
                Some(dim) if identity.embedding.len() != dim => {
                    tracing::warn!(
                        name = %identity.name,
                        expected = dim,
                        actual = identity.embedding.len(),
                        "dropping roster entry with wrong embedding length"
                    );
                    false
                }
                _ => true,
            })
            .collect();

        for orphan in inner
            .store
            .thumbnail_names()?
            .into_iter()
            .filter(|name| !entries.iter().any(|e| &e.name == name))
        {
            match inner.store.delete_thumbnail(&orphan) {
                Ok(_) => tracing::warn!(name = %orphan, "deleted orphan thumbnail"),
                Err(e) => tracing::warn!(name = %orphan, error = %e, "failed to delete orphan thumbnail"),
            }
        }

        let count = entries.len();
        inner.entries = Arc::new(entries);
        tracing::info!(count, "roster loaded");
        Ok(count)
    }

    /// Immutable view of the current roster, in insertion order.
    pub fn snapshot(&self) -> Arc<Vec<Identity>> {
        Arc::clone(&self.lock().entries)
    }

    pub fn get(&self, name: &str) -> Option<Identity> {
        self.lock().entries.iter().find(|e| e.name == name).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Insert or replace `identity` together with its thumbnail.
    ///
    /// Returns the identity it replaced, if any. On error nothing is
    /// committed: the previous thumbnail is restored and the in-memory
    /// roster is unchanged.
    pub fn upsert(&self, identity: Identity, thumbnail: &[u8]) -> Result<Option<Identity>, StoreError> {
        let mut inner = self.lock();
        let name = identity.name.clone();
        let previous_thumbnail = inner.store.load_thumbnail(&name)?;

        inner.store.save_thumbnail(&name, thumbnail)?;

        let mut next = inner.entries.to_vec();
        let replaced = match next.iter_mut().find(|e| e.name == name) {
            Some(slot) => Some(std::mem::replace(slot, identity)),
            None => {
                next.push(identity);
                None
            }
        };

        if let Err(e) = inner.store.save_identities(&next) {
            let rollback = match &previous_thumbnail {
                Some(bytes) => inner.store.save_thumbnail(&name, bytes),
                None => inner.store.delete_thumbnail(&name).map(|_| ()),
            };
            if let Err(rb) = rollback {
                tracing::error!(name = %name, error = %rb, "failed to roll back thumbnail");
            }
            return Err(e);
        }

        inner.entries = Arc::new(next);
        tracing::info!(name = %name, replaced = replaced.is_some(), count = inner.entries.len(), "roster entry saved");
        Ok(replaced)
    }

    /// Remove `name` and its thumbnail. `Ok(None)` if it was not enrolled.
    pub fn remove(&self, name: &str) -> Result<Option<Identity>, StoreError> {
        let mut inner = self.lock();
        let Some(idx) = inner.entries.iter().position(|e| e.name == name) else {
            return Ok(None);
        };

        let mut next = inner.entries.to_vec();
        let removed = next.remove(idx);
        inner.store.save_identities(&next)?;
        inner.entries = Arc::new(next);

        // The identity is gone either way; a leftover file is swept on the next load.
        if let Err(e) = inner.store.delete_thumbnail(name) {
            tracing::warn!(name, error = %e, "failed to delete thumbnail");
        }

        tracing::info!(name, count = inner.entries.len(), "roster entry removed");
        Ok(Some(removed))
    }

    /// Thumbnail bytes for an enrolled name, read from the store on demand.
    pub fn thumbnail(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let inner = self.lock();
        if !inner.entries.iter().any(|e| e.name == name) {
            return Ok(None);
        }
        inner.store.load_thumbnail(name)
    }
}
