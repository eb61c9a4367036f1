//! rollcall-core — Embedding gallery model and face matching.
//!
//! Holds the in-memory gallery with its dimensionality lock, the
//! nearest-neighbor matchers, and the contract for the external
//! embedding extractor. Nothing in this crate touches the filesystem.

pub mod error;
pub mod extractor;
pub mod gallery;
pub mod matcher;
pub mod types;
pub mod validation;

pub use error::CoreError;
pub use extractor::{EmbeddingExtractor, ExtractionError};
pub use gallery::Gallery;
pub use matcher::{CosineMatcher, DistanceMetric, EuclideanMatcher, Matcher};
pub use types::{Embedding, EmbeddingRecord, MatchResult};

/// Match threshold used with the VGG-Face embeddings and raw Euclidean distance.
///
/// Only meaningful for that model/metric pair; recalibrate when either changes.
pub const DEFAULT_MATCH_THRESHOLD: f64 = 0.68;
