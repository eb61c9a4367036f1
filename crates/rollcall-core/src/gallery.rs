//! In-memory embedding gallery.
//!
//! The gallery's dimensionality is discovered from the first enrolled
//! vector (or taken from a configured default) and then locked: every
//! later record must have exactly that many components.

use crate::error::CoreError;
use crate::types::{Embedding, EmbeddingRecord};
use crate::validation;

/// Ordered, append-only collection of enrolled embeddings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Gallery {
    dimension: Option<usize>,
    records: Vec<EmbeddingRecord>,
}

impl Gallery {
    /// Empty gallery with an undetermined dimensionality.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty gallery with a preset dimensionality (or none).
    pub fn with_dimension(dimension: Option<usize>) -> Self {
        Self {
            dimension,
            records: Vec::new(),
        }
    }

    /// Locked dimensionality, `None` while still undetermined.
    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    pub fn records(&self) -> &[EmbeddingRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Validate a prospective record without touching the gallery.
    ///
    /// Returns the normalized identity on success.
    pub fn check<'a>(&self, identity: &'a str, embedding: &Embedding) -> Result<&'a str, CoreError> {
        let identity = validation::normalize_identity(identity)?;
        validation::check_components(&embedding.values)?;
        if let Some(expected) = self.dimension {
            validation::check_dimension(expected, embedding.dimension())?;
        }
        Ok(identity)
    }

    /// Append a record, locking the dimensionality on the first one.
    ///
    /// Returns the stored (trimmed) identity. Nothing changes when
    /// validation fails.
    pub fn push(&mut self, identity: &str, embedding: Embedding) -> Result<String, CoreError> {
        let identity = self.check(identity, &embedding)?.to_string();
        if self.dimension.is_none() {
            tracing::debug!(dimension = embedding.dimension(), "gallery dimensionality locked");
            self.dimension = Some(embedding.dimension());
        }
        self.records.push(EmbeddingRecord {
            identity: identity.clone(),
            embedding,
        });
        Ok(identity)
    }

    /// Enrolled identities with their record counts, in first-enrollment order.
    pub fn identities(&self) -> Vec<(String, usize)> {
        let mut out: Vec<(String, usize)> = Vec::new();
        for record in &self.records {
            match out.iter_mut().find(|(id, _)| *id == record.identity) {
                Some((_, count)) => *count += 1,
                None => out.push((record.identity.clone(), 1)),
            }
        }
        out
    }
}
