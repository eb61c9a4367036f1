//! Contract for the external embedding extractor.

use crate::types::Embedding;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("no face detected in {0}")]
    NoFaceDetected(String),
    #[error("embedding extraction failed: {0}")]
    Failed(String),
}

/// Turns a face image into an embedding vector.
///
/// Implementations may be slow and may fail; callers must not have mutated
/// any gallery or ledger state before the extraction has succeeded.
pub trait EmbeddingExtractor {
    fn extract(&mut self, image: &Path) -> Result<Embedding, ExtractionError>;
}
