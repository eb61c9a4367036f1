use thiserror::Error;

/// Validation failures raised before any gallery mutation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    #[error("identity must not be empty or blank")]
    InvalidIdentity,
    #[error("dimension mismatch: gallery holds {expected}-dim embeddings, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("embedding has no components")]
    EmptyEmbedding,
    #[error("embedding component {index} is not a finite number")]
    NonFinite { index: usize },
}
