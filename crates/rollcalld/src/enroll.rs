//! Enrollment and deletion of roster identities.

use crate::engine::{Capture, LatestCapture};
use crate::roster::Roster;
use rollcall_core::thumbnail::{encode_thumbnail, ThumbnailError};
use rollcall_core::{Identity, IdentityMetadata};
use rollcall_store::thumbnails::is_valid_key;
use rollcall_store::StoreError;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("no face captured yet; wait for the camera to see a face")]
    NoFaceCaptured,
    #[error("invalid {field}: {reason}")]
    Validation {
        field: &'static str,
        reason: &'static str,
    },
    #[error("no identity named {0:?}")]
    NotFound(String),
    #[error("persistence failed: {0}")]
    Persistence(#[from] StoreError),
    #[error("thumbnail failed: {0}")]
    Thumbnail(#[from] ThumbnailError),
}

pub struct EnrollmentController {
    roster: Arc<Roster>,
    latest: LatestCapture,
    thumbnail_size: u32,
}

impl EnrollmentController {
    pub fn new(roster: Arc<Roster>, latest: LatestCapture, thumbnail_size: u32) -> Self {
        Self {
            roster,
            latest,
            thumbnail_size,
        }
    }

    /// Enroll the face from the most recent successful inference.
    pub fn enroll(&self, metadata: IdentityMetadata) -> Result<Identity, EnrollError> {
        let capture = self
            .latest
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        self.enroll_capture(metadata, capture)
    }

    /// Enroll `capture` under `metadata`. An existing entry with the same
    /// name is replaced.
    pub fn enroll_capture(
        &self,
        metadata: IdentityMetadata,
        capture: Option<Capture>,
    ) -> Result<Identity, EnrollError> {
        let capture = capture.ok_or(EnrollError::NoFaceCaptured)?;
        let metadata = validate(metadata)?;

        let thumbnail = encode_thumbnail(&capture.frame, self.thumbnail_size)?;
        let captured_at = capture.at;
        let identity = Identity::from_metadata(metadata, capture.embedding);
        let replaced = self.roster.upsert(identity.clone(), &thumbnail)?;

        tracing::info!(
            name = %identity.name,
            id = %identity.id,
            replaced = replaced.is_some(),
            thumbnail_bytes = thumbnail.len(),
            captured_at = %captured_at,
            "enrolled"
        );
        Ok(identity)
    }

    /// Remove `name` and its thumbnail. Confirmation is the caller's job.
    pub fn delete(&self, name: &str) -> Result<Identity, EnrollError> {
        match self.roster.remove(name)? {
            Some(identity) => {
                tracing::info!(name, "deleted");
                Ok(identity)
            }
            None => Err(EnrollError::NotFound(name.to_string())),
        }
    }

    pub fn roster(&self) -> &Arc<Roster> {
        &self.roster
    }
}

fn validate(metadata: IdentityMetadata) -> Result<IdentityMetadata, EnrollError> {
    let metadata = IdentityMetadata {
        name: metadata.name.trim().to_string(),
        id: metadata.id.trim().to_string(),
        department: metadata.department.trim().to_string(),
        section: metadata.section.trim().to_string(),
    };
    for (field, value) in [
        ("name", &metadata.name),
        ("id", &metadata.id),
        ("department", &metadata.department),
        ("section", &metadata.section),
    ] {
        if value.is_empty() {
            return Err(EnrollError::Validation {
                field,
                reason: "must not be empty",
            });
        }
    }
    if !is_valid_key(&metadata.name) {
        return Err(EnrollError::Validation {
            field: "name",
            reason: "must not start with '.' or contain path separators",
        });
    }
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{identity, MemoryStore};
    use chrono::Utc;
    use image::{Rgb, RgbImage};
    use rollcall_core::Embedding;
    use rollcall_store::SqliteStore;
    use std::sync::Mutex;

    fn metadata(name: &str, id: &str, department: &str, section: &str) -> IdentityMetadata {
        IdentityMetadata {
            name: name.into(),
            id: id.into(),
            department: department.into(),
            section: section.into(),
        }
    }

    fn capture(values: &[f32]) -> Capture {
        Capture {
            embedding: Embedding::new(values.to_vec()),
            frame: Arc::new(RgbImage::from_pixel(32, 24, Rgb([200, 120, 40]))),
            at: Utc::now(),
        }
    }

    fn controller(store: MemoryStore) -> EnrollmentController {
        let roster = Arc::new(Roster::new(Box::new(store), Some(3)));
        EnrollmentController::new(roster, Arc::new(Mutex::new(None)), 16)
    }

    #[test]
    fn test_enroll_round_trip_through_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("roster.db");
        let thumbs = dir.path().join("thumbs");
        let enrolled = {
            let store = SqliteStore::open(&db, &thumbs).unwrap();
            let roster = Arc::new(Roster::new(Box::new(store), Some(3)));
            let latest = Arc::new(Mutex::new(Some(capture(&[0.1, 0.7, -0.2]))));
            let controller = EnrollmentController::new(roster, latest, 128);
            controller.enroll(metadata("Alice", "1", "CS", "A")).unwrap()
        };

        let store = SqliteStore::open(&db, &thumbs).unwrap();
        let roster = Roster::new(Box::new(store), Some(3));
        assert_eq!(roster.load().unwrap(), 1);
        assert_eq!(roster.get("Alice"), Some(enrolled));
        let thumbnail = roster.thumbnail("Alice").unwrap().unwrap();
        assert!(!thumbnail.is_empty());
        assert_eq!(
            image::load_from_memory(&thumbnail).unwrap().to_rgb8().dimensions(),
            (128, 128)
        );
    }

    #[test]
    fn test_enroll_without_capture() {
        let controller = controller(MemoryStore::default());
        assert!(matches!(
            controller.enroll(metadata("Bob", "2", "EE", "B")),
            Err(EnrollError::NoFaceCaptured)
        ));
        assert_eq!(controller.roster().len(), 0);
    }

    #[test]
    fn test_enroll_names_missing_field() {
        let controller = controller(MemoryStore::default());
        let cases = [
            (metadata("", "2", "EE", "B"), "name"),
            (metadata("Bob", "  ", "EE", "B"), "id"),
            (metadata("Bob", "2", "", "B"), "department"),
            (metadata("Bob", "2", "EE", "\t"), "section"),
            (metadata("../Bob", "2", "EE", "B"), "name"),
        ];
        for (meta, expected) in cases {
            match controller.enroll_capture(meta, Some(capture(&[1.0, 0.0, 0.0]))) {
                Err(EnrollError::Validation { field, .. }) => assert_eq!(field, expected),
                other => panic!("expected validation error for {expected}, got {other:?}"),
            }
        }
        assert_eq!(controller.roster().len(), 0);
    }

    #[test]
    fn test_enroll_trims_and_overwrites() {
        let store = MemoryStore::default();
        let controller = controller(store.clone());
        controller
            .enroll_capture(metadata(" Bob ", "2", "EE", "B"), Some(capture(&[1.0, 0.0, 0.0])))
            .unwrap();
        let second = controller
            .enroll_capture(metadata("Bob", "3", "ME", "C"), Some(capture(&[0.0, 1.0, 0.0])))
            .unwrap();

        assert_eq!(controller.roster().len(), 1);
        assert_eq!(controller.roster().get("Bob"), Some(second.clone()));
        assert_eq!(store.persisted(), vec![second]);
        assert_eq!(store.thumbnail_keys(), vec!["Bob".to_string()]);
    }

    #[test]
    fn test_enroll_surfaces_persistence_failure() {
        let store = MemoryStore::default();
        let controller = controller(store.clone());
        store.fail_saves(true);
        assert!(matches!(
            controller.enroll_capture(metadata("Bob", "2", "EE", "B"), Some(capture(&[1.0, 0.0, 0.0]))),
            Err(EnrollError::Persistence(_))
        ));
        assert_eq!(controller.roster().len(), 0);
        assert!(store.thumbnail_keys().is_empty());
    }

    #[test]
    fn test_delete_unknown_leaves_roster_unchanged() {
        let store = MemoryStore::default();
        store.seed(&[identity("amy", &[1.0, 0.0, 0.0])], &["amy"]);
        let controller = controller(store.clone());
        controller.roster().load().unwrap();

        assert!(matches!(controller.delete("zed"), Err(EnrollError::NotFound(n)) if n == "zed"));
        assert_eq!(controller.roster().len(), 1);
        assert_eq!(store.persisted().len(), 1);

        assert_eq!(controller.delete("amy").unwrap().name, "amy");
        assert!(matches!(controller.delete("amy"), Err(EnrollError::NotFound(_))));
        assert!(store.thumbnail_keys().is_empty());
    }
}
