use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Face embedding vector, as produced by the embedding model.
///
/// Serialized as a bare array of floats so persisted rosters stay
/// readable by other tooling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Cosine distance `1 - cos(a, b)`, in [0, 2].
    ///
    /// Returns 1.0 when either vector has zero norm. Callers must compare
    /// embeddings of equal length; see [`crate::matcher::CosineMatcher`].
    pub fn cosine_distance(&self, other: &Embedding) -> f32 {
        debug_assert_eq!(self.values.len(), other.values.len());

        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        if norm_a <= 0.0 || norm_b <= 0.0 {
            return 1.0;
        }
        // sqrt of the product keeps distance(a, a) exactly 0 for most inputs.
        1.0 - dot / (norm_a * norm_b).sqrt()
    }
}

/// Descriptive fields collected at enrollment time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityMetadata {
    pub name: String,
    pub id: String,
    pub department: String,
    pub section: String,
}

/// An enrolled person. `name` is the roster key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub id: String,
    pub department: String,
    pub section: String,
    pub embedding: Embedding,
}

impl Identity {
    pub fn from_metadata(metadata: IdentityMetadata, embedding: Embedding) -> Self {
        Self {
            name: metadata.name,
            id: metadata.id,
            department: metadata.department,
            section: metadata.section,
            embedding,
        }
    }
}

/// A debounced recognition, as delivered to the event sink and D-Bus clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionEvent {
    pub id: String,
    pub name: String,
    pub department: String,
    pub section: String,
    pub distance: f32,
    pub timestamp: DateTime<Utc>,
}

impl RecognitionEvent {
    pub fn new(identity: &Identity, distance: f32, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: identity.id.clone(),
            name: identity.name.clone(),
            department: identity.department.clone(),
            section: identity.section.clone(),
            distance,
            timestamp,
        }
    }
}
