use serde::{Deserialize, Serialize};

/// Face embedding vector produced by the external extraction model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f64>,
}

impl Embedding {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }

    /// Number of components.
    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar. A zero vector has
    /// no direction, so its similarity to anything is 0.
    ///
    /// Each vector is scaled by its largest magnitude first, so very large
    /// or very small components cannot overflow or underflow the norms.
    pub fn similarity(&self, other: &Embedding) -> f64 {
        let scale_a = max_abs(&self.values);
        let scale_b = max_abs(&other.values);
        if scale_a == 0.0 || scale_b == 0.0 {
            return 0.0;
        }

        let mut dot = 0.0f64;
        let mut norm_a = 0.0f64;
        let mut norm_b = 0.0f64;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            let (a, b) = (a / scale_a, b / scale_b);
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { (dot / denom).clamp(-1.0, 1.0) } else { 0.0 }
    }

    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f64 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f64>()
            .sqrt()
    }

    /// Cosine distance, `1 - similarity`, in [0, 2].
    pub fn cosine_distance(&self, other: &Embedding) -> f64 {
        1.0 - self.similarity(other)
    }
}

fn max_abs(values: &[f64]) -> f64 {
    values.iter().fold(0.0f64, |m, v| m.max(v.abs()))
}

impl From<Vec<f64>> for Embedding {
    fn from(values: Vec<f64>) -> Self {
        Self { values }
    }
}

/// One enrolled (identity, embedding) pair.
///
/// The same identity may appear in several records, one per enrollment photo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub identity: String,
    pub embedding: Embedding,
}

/// Result of matching a probe embedding against a gallery.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MatchResult {
    /// The closest record lies strictly under the threshold.
    Matched {
        identity: String,
        distance: f64,
        /// Position of the winning record in gallery insertion order.
        index: usize,
    },
    /// Nothing close enough. `best_distance` is the rejected minimum,
    /// `None` when the gallery was empty.
    NoMatch { best_distance: Option<f64> },
}

impl MatchResult {
    pub fn is_match(&self) -> bool {
        matches!(self, MatchResult::Matched { .. })
    }

    /// Matched identity, if any.
    pub fn identity(&self) -> Option<&str> {
        match self {
            MatchResult::Matched { identity, .. } => Some(identity),
            MatchResult::NoMatch { .. } => None,
        }
    }

    /// Distance of the closest record, whether accepted or rejected.
    pub fn distance(&self) -> Option<f64> {
        match self {
            MatchResult::Matched { distance, .. } => Some(*distance),
            MatchResult::NoMatch { best_distance } => *best_distance,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_identical() {
        let a = Embedding::new(vec![1.0, 0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0, 0.0]);
        assert!((a.similarity(&b) - 1.0).abs() < 1e-12);
        assert!(a.cosine_distance(&b).abs() < 1e-12);
    }

    #[test]
    fn test_cosine_similarity_opposite() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![-1.0, 0.0]);
        assert!((a.similarity(&b) + 1.0).abs() < 1e-12);
        assert!((a.cosine_distance(&b) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0]);
        assert_eq!(a.similarity(&b), 0.0);
        assert_eq!(a.cosine_distance(&b), 1.0);
    }

    #[test]
    fn test_cosine_similarity_extreme_magnitudes() {
        let big = Embedding::new(vec![1e200, 0.0]);
        let unit = Embedding::new(vec![1.0, 0.0]);
        let tiny = Embedding::new(vec![1e-200, 1e-200]);
        assert!((big.similarity(&big) - 1.0).abs() < 1e-12);
        assert!((big.similarity(&unit) - 1.0).abs() < 1e-12);
        assert!((tiny.similarity(&unit) - std::f64::consts::FRAC_1_SQRT_2).abs() < 1e-12);
        assert!(big.cosine_distance(&big).is_finite());
    }

    #[test]
    fn test_euclidean_distance() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![3.0, 4.0]);
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-12);
        assert_eq!(b.euclidean_distance(&b), 0.0);
    }

    #[test]
    fn test_match_result_accessors() {
        let hit = MatchResult::Matched { identity: "ada".into(), distance: 0.1, index: 2 };
        assert!(hit.is_match());
        assert_eq!(hit.identity(), Some("ada"));
        assert_eq!(hit.distance(), Some(0.1));

        let miss = MatchResult::NoMatch { best_distance: Some(0.9) };
        assert!(!miss.is_match());
        assert_eq!(miss.identity(), None);
        assert_eq!(miss.distance(), Some(0.9));
    }

    #[test]
    fn test_match_result_json_shape() {
        let miss = MatchResult::NoMatch { best_distance: None };
        let json = serde_json::to_value(&miss).unwrap();
        assert_eq!(json["outcome"], "no_match");
        assert!(json["best_distance"].is_null());
    }
}
