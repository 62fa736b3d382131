//! Nearest-neighbour matching of a probe embedding against the roster.

use crate::types::{Embedding, Identity};
use thiserror::Error;

/// A roster embedding whose length differs from the probe.
///
/// All embeddings in a session come from the same model, so this is an
/// invariant violation rather than a user-facing condition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("embedding length mismatch for {name:?}: probe has {expected}, roster entry has {actual}")]
pub struct DimensionMismatch {
    pub name: String,
    pub expected: usize,
    pub actual: usize,
}

/// Result of matching a probe embedding against the roster.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Roster key of the accepted entry; `None` means Unknown.
    pub name: Option<String>,
    /// Distance to the nearest entry, reported even when rejected.
    /// `f32::INFINITY` for an empty roster.
    pub distance: f32,
}

impl MatchResult {
    pub fn unknown(distance: f32) -> Self {
        Self {
            name: None,
            distance,
        }
    }

    pub fn is_known(&self) -> bool {
        self.name.is_some()
    }

    /// Display label: the matched name, or "Unknown".
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or("Unknown")
    }
}

/// Strategy for comparing a probe embedding against the enrolled roster.
pub trait Matcher {
    fn compare(
        &self,
        probe: &Embedding,
        roster: &[Identity],
        threshold: f32,
    ) -> Result<MatchResult, DimensionMismatch>;
}

/// Cosine-distance matcher.
///
/// Visits every roster entry in order; on equal distances the first entry
/// wins. A candidate is accepted when its distance is at most `threshold`.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare(
        &self,
        probe: &Embedding,
        roster: &[Identity],
        threshold: f32,
    ) -> Result<MatchResult, DimensionMismatch> {
        let mut best_dist = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, identity) in roster.iter().enumerate() {
            if identity.embedding.len() != probe.len() {
                return Err(DimensionMismatch {
                    name: identity.name.clone(),
                    expected: probe.len(),
                    actual: identity.embedding.len(),
                });
            }
            let dist = probe.cosine_distance(&identity.embedding);
            if best_idx.is_none() || dist < best_dist {
                best_dist = dist;
                best_idx = Some(i);
            }
        }

        Ok(match best_idx {
            Some(idx) if best_dist <= threshold => MatchResult {
                name: Some(roster[idx].name.clone()),
                distance: best_dist,
            },
            _ => MatchResult::unknown(best_dist),
        })
    }
}
