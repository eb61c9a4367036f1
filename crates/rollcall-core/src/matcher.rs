//! Brute-force nearest-neighbor matching over a gallery snapshot.

use crate::error::CoreError;
use crate::gallery::Gallery;
use crate::types::{Embedding, MatchResult};
use crate::validation;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Strategy for comparing a probe embedding against a gallery of enrolled faces.
///
/// Implementors only supply the distance; the scan, tie-break and threshold
/// decision are shared.
pub trait Matcher {
    /// Distance between two vectors of equal length. Lower = more similar.
    fn distance(&self, a: &Embedding, b: &Embedding) -> f64;

    /// Find the closest record and accept it if its distance is strictly
    /// below `threshold`.
    ///
    /// Every record is visited; on equal distances the earliest record in
    /// insertion order wins. An empty gallery is never an error.
    fn compare(
        &self,
        probe: &Embedding,
        gallery: &Gallery,
        threshold: f64,
    ) -> Result<MatchResult, CoreError> {
        let dimension = match gallery.dimension() {
            Some(d) if !gallery.is_empty() => d,
            _ => return Ok(MatchResult::NoMatch { best_distance: None }),
        };
        validation::check_dimension(dimension, probe.dimension())?;
        validation::check_components(&probe.values)?;

        let mut best: Option<(usize, f64)> = None;
        for (i, record) in gallery.records().iter().enumerate() {
            let distance = self.distance(probe, &record.embedding);
            // NaN never ranks; it would block every later comparison.
            let distance = if distance.is_nan() { f64::INFINITY } else { distance };
            let is_better = match best {
                None => true,
                Some((_, best_distance)) => distance < best_distance,
            };
            if is_better {
                best = Some((i, distance));
            }
        }

        let result = match best {
            Some((index, distance)) if distance < threshold => MatchResult::Matched {
                identity: gallery.records()[index].identity.clone(),
                distance,
                index,
            },
            Some((_, distance)) => MatchResult::NoMatch { best_distance: Some(distance) },
            None => MatchResult::NoMatch { best_distance: None },
        };

        tracing::debug!(
            candidates = gallery.len(),
            threshold,
            matched = result.is_match(),
            distance = ?result.distance(),
            "compared probe against gallery"
        );

        Ok(result)
    }
}

/// Raw Euclidean (L2) distance.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn distance(&self, a: &Embedding, b: &Embedding) -> f64 {
        a.euclidean_distance(b)
    }
}

/// Cosine distance, `1 - cosine similarity`.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn distance(&self, a: &Embedding, b: &Embedding) -> f64 {
        a.cosine_distance(b)
    }
}

/// Configurable choice of distance metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    #[default]
    Euclidean,
    Cosine,
}

impl DistanceMetric {
    /// Matcher implementing this metric.
    pub fn matcher(self) -> Box<dyn Matcher + Send> {
        match self {
            DistanceMetric::Euclidean => Box::new(EuclideanMatcher),
            DistanceMetric::Cosine => Box::new(CosineMatcher),
        }
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DistanceMetric::Euclidean => f.write_str("euclidean"),
            DistanceMetric::Cosine => f.write_str("cosine"),
        }
    }
}

impl FromStr for DistanceMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "euclidean" | "l2" => Ok(DistanceMetric::Euclidean),
            "cosine" => Ok(DistanceMetric::Cosine),
            other => Err(format!("unknown distance metric '{other}' (expected euclidean or cosine)")),
        }
    }
}
