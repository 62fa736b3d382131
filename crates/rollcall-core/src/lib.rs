//! rollcall-core: Face embedding and identity matching engine.
//!
//! Turns an RGB face raster into a normalized model tensor, runs it
//! through an embedding model (ONNX Runtime), and matches the resulting
//! vector against an enrolled roster by cosine distance.

pub mod debounce;
pub mod matcher;
pub mod recognizer;
pub mod tensor;
pub mod thumbnail;
pub mod types;

pub use debounce::RecognitionDebouncer;
pub use matcher::{CosineMatcher, DimensionMismatch, MatchResult, Matcher};
pub use recognizer::{EmbeddingModel, ModelError, OnnxEmbedder};
pub use tensor::{FaceTensor, TensorBuilder, TensorError};
pub use types::{Embedding, Identity, IdentityMetadata, RecognitionEvent};
