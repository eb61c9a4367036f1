//! Enrollment and recognition flows.
//!
//! Thin glue between collaborators (operator gate, embedding extractor)
//! and the stores. Every function takes the current store handles
//! explicitly; nothing here holds state between calls.

use crate::error::StoreError;
use crate::gallery::GalleryStore;
use crate::ledger::{Ledger, LedgerBook, RecordOutcome};
use chrono::{NaiveDate, NaiveDateTime};
use rollcall_core::{
    validation, CoreError, Embedding, EmbeddingExtractor, ExtractionError, Gallery, MatchResult, Matcher,
};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

/// Whether an authorized operator is active for the current request.
pub trait OperatorGate {
    fn is_operator_active(&self) -> bool;
}

impl OperatorGate for bool {
    fn is_operator_active(&self) -> bool {
        *self
    }
}

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("an authorized operator is required for this operation")]
    Unauthorized,
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error(transparent)]
    Invalid(#[from] CoreError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of one recognition attempt.
#[derive(Debug, Clone, Serialize)]
pub struct Recognition {
    pub result: MatchResult,
    /// Ledger outcome, present only when the probe matched.
    pub attendance: Option<RecordOutcome>,
}

/// Enroll a pre-extracted embedding under `identity`.
pub fn enroll(
    gate: &dyn OperatorGate,
    gallery: &mut GalleryStore,
    identity: &str,
    embedding: Embedding,
) -> Result<(), CoordinatorError> {
    require_operator(gate)?;
    gallery.enroll(identity, embedding)?;
    Ok(())
}

/// Extract an embedding from `image` and enroll it.
///
/// The identity is validated before the (slow) extraction runs, and the
/// gallery is untouched if extraction fails.
pub fn enroll_image(
    gate: &dyn OperatorGate,
    extractor: &mut dyn EmbeddingExtractor,
    gallery: &mut GalleryStore,
    identity: &str,
    image: &Path,
) -> Result<(), CoordinatorError> {
    require_operator(gate)?;
    validation::normalize_identity(identity)?;
    let embedding = extract(extractor, image)?;
    gallery.enroll(identity, embedding)?;
    Ok(())
}

/// Match `probe` against the gallery and, on a match, record attendance
/// in `ledger` at `now`.
pub fn recognize(
    gallery: &Gallery,
    ledger: &mut Ledger,
    matcher: &dyn Matcher,
    threshold: f64,
    probe: &Embedding,
    now: NaiveDateTime,
) -> Result<Recognition, CoordinatorError> {
    let result = matcher.compare(probe, gallery, threshold)?;

    let attendance = match &result {
        MatchResult::Matched { identity, distance, .. } => {
            tracing::info!(identity = %identity, distance, "face recognized");
            Some(ledger.record(identity, now)?)
        }
        MatchResult::NoMatch { best_distance } => {
            tracing::info!(best_distance = ?best_distance, threshold, "no matching face");
            None
        }
    };

    Ok(Recognition { result, attendance })
}

/// Extract an embedding from `image`, then [`recognize`] it.
pub fn recognize_image(
    extractor: &mut dyn EmbeddingExtractor,
    gallery: &Gallery,
    ledger: &mut Ledger,
    matcher: &dyn Matcher,
    threshold: f64,
    image: &Path,
    now: NaiveDateTime,
) -> Result<Recognition, CoordinatorError> {
    let probe = extract(extractor, image)?;
    recognize(gallery, ledger, matcher, threshold, &probe, now)
}

/// Administrative: delete every enrolled embedding.
pub fn clear_gallery(gate: &dyn OperatorGate, gallery: &mut GalleryStore) -> Result<usize, CoordinatorError> {
    require_operator(gate)?;
    Ok(gallery.clear()?)
}

/// Administrative: discard the attendance ledger for `day`.
pub fn clear_day(gate: &dyn OperatorGate, book: &LedgerBook, day: NaiveDate) -> Result<bool, CoordinatorError> {
    require_operator(gate)?;
    Ok(book.delete(day)?)
}

fn require_operator(gate: &dyn OperatorGate) -> Result<(), CoordinatorError> {
    if gate.is_operator_active() {
        Ok(())
    } else {
        tracing::warn!("operation refused: no authorized operator");
        Err(CoordinatorError::Unauthorized)
    }
}

fn extract(extractor: &mut dyn EmbeddingExtractor, image: &Path) -> Result<Embedding, CoordinatorError> {
    extractor.extract(image).map_err(|e| {
        tracing::warn!(image = %image.display(), error = %e, "embedding extraction failed");
        CoordinatorError::Extraction(e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::{EuclideanMatcher, DEFAULT_MATCH_THRESHOLD};
    use std::collections::HashMap;
    use std::path::PathBuf;

    /// Extractor returning canned vectors keyed by file name.
    struct FakeExtractor {
        vectors: HashMap<PathBuf, Vec<f64>>,
        calls: usize,
    }

    impl FakeExtractor {
        fn new(entries: &[(&str, &[f64])]) -> Self {
            Self {
                vectors: entries
                    .iter()
                    .map(|(name, v)| (PathBuf::from(name), v.to_vec()))
                    .collect(),
                calls: 0,
            }
        }
    }

    impl EmbeddingExtractor for FakeExtractor {
        fn extract(&mut self, image: &Path) -> Result<Embedding, ExtractionError> {
            self.calls += 1;
            match self.vectors.get(image) {
                Some(v) => Ok(Embedding::new(v.clone())),
                None if image.to_string_lossy().contains("blank") => {
                    Err(ExtractionError::NoFaceDetected(image.display().to_string()))
                }
                None => Err(ExtractionError::Failed("unreadable image".into())),
            }
        }
    }

    fn fixture() -> (tempfile::TempDir, GalleryStore, LedgerBook) {
        let dir = tempfile::TempDir::new().unwrap();
        let gallery = GalleryStore::load(dir.path().join("faces.csv"), None).unwrap();
        let book = LedgerBook::new(dir.path().join("attendance"));
        (dir, gallery, book)
    }

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 18)
            .unwrap()
            .and_hms_opt(9, 15, 0)
            .unwrap()
    }

    #[test]
    fn test_enroll_requires_operator() {
        let (_dir, mut gallery, _book) = fixture();
        let err = enroll(&false, &mut gallery, "ada", Embedding::new(vec![1.0])).unwrap_err();
        assert!(matches!(err, CoordinatorError::Unauthorized));
        assert!(gallery.gallery().is_empty());
        assert!(!gallery.path().exists());
    }

    #[test]
    fn test_enroll_image_extraction_failure_leaves_gallery_untouched() {
        let (_dir, mut gallery, _book) = fixture();
        let mut extractor = FakeExtractor::new(&[]);

        let err = enroll_image(&true, &mut extractor, &mut gallery, "ada", Path::new("blank.jpg")).unwrap_err();
        assert!(matches!(err, CoordinatorError::Extraction(ExtractionError::NoFaceDetected(_))));
        let err = enroll_image(&true, &mut extractor, &mut gallery, "ada", Path::new("x.jpg")).unwrap_err();
        assert!(matches!(err, CoordinatorError::Extraction(ExtractionError::Failed(_))));

        assert!(gallery.gallery().is_empty());
        assert!(!gallery.path().exists());
    }

    #[test]
    fn test_enroll_image_validates_identity_before_extracting() {
        let (_dir, mut gallery, _book) = fixture();
        let mut extractor = FakeExtractor::new(&[("ada.jpg", &[1.0, 0.0])]);
        let err = enroll_image(&true, &mut extractor, &mut gallery, "", Path::new("ada.jpg")).unwrap_err();
        assert!(matches!(err, CoordinatorError::Invalid(CoreError::InvalidIdentity)));
        assert_eq!(extractor.calls, 0);
    }

    #[test]
    fn test_recognize_records_once_per_day() {
        let (_dir, mut gallery, book) = fixture();
        enroll(&true, &mut gallery, "A", Embedding::new(vec![0.2, 0.4])).unwrap();
        enroll(&true, &mut gallery, "B", Embedding::new(vec![0.9, 0.9])).unwrap();
        let mut ledger = book.load(now().date()).unwrap();

        let probe = Embedding::new(vec![0.2, 0.4]);
        let first = recognize(gallery.gallery(), &mut ledger, &EuclideanMatcher, DEFAULT_MATCH_THRESHOLD, &probe, now()).unwrap();
        assert_eq!(
            first.result,
            MatchResult::Matched { identity: "A".into(), distance: 0.0, index: 0 }
        );
        assert_eq!(first.attendance, Some(RecordOutcome::Recorded { timestamp: now() }));

        let later = now() + chrono::Duration::hours(2);
        let second = recognize(gallery.gallery(), &mut ledger, &EuclideanMatcher, DEFAULT_MATCH_THRESHOLD, &probe, later).unwrap();
        assert_eq!(second.attendance, Some(RecordOutcome::AlreadyRecorded { first_seen: now() }));
        assert_eq!(book.load(now().date()).unwrap().len(), 1);
    }

    #[test]
    fn test_recognize_no_match_records_nothing() {
        let (_dir, mut gallery, book) = fixture();
        enroll(&true, &mut gallery, "A", Embedding::new(vec![5.0, 5.0])).unwrap();
        let mut ledger = book.load(now().date()).unwrap();

        let probe = Embedding::new(vec![0.0, 0.0]);
        let outcome = recognize(gallery.gallery(), &mut ledger, &EuclideanMatcher, DEFAULT_MATCH_THRESHOLD, &probe, now()).unwrap();
        assert!(!outcome.result.is_match());
        assert!(outcome.attendance.is_none());
        assert!(ledger.is_empty());
        assert!(!ledger.path().exists());
    }

    #[test]
    fn test_recognize_empty_gallery() {
        let (_dir, gallery, book) = fixture();
        let mut ledger = book.load(now().date()).unwrap();
        let outcome = recognize(
            gallery.gallery(),
            &mut ledger,
            &EuclideanMatcher,
            DEFAULT_MATCH_THRESHOLD,
            &Embedding::new(vec![1.0, 2.0, 3.0]),
            now(),
        )
        .unwrap();
        assert_eq!(outcome.result, MatchResult::NoMatch { best_distance: None });
    }

    #[test]
    fn test_recognize_image_propagates_extraction_error() {
        let (_dir, mut gallery, book) = fixture();
        enroll(&true, &mut gallery, "A", Embedding::new(vec![1.0])).unwrap();
        let mut ledger = book.load(now().date()).unwrap();
        let mut extractor = FakeExtractor::new(&[("a.jpg", &[1.0])]);

        let err = recognize_image(
            &mut extractor,
            gallery.gallery(),
            &mut ledger,
            &EuclideanMatcher,
            DEFAULT_MATCH_THRESHOLD,
            Path::new("blank.png"),
            now(),
        )
        .unwrap_err();
        assert!(matches!(err, CoordinatorError::Extraction(ExtractionError::NoFaceDetected(_))));

        let ok = recognize_image(
            &mut extractor,
            gallery.gallery(),
            &mut ledger,
            &EuclideanMatcher,
            DEFAULT_MATCH_THRESHOLD,
            Path::new("a.jpg"),
            now(),
        )
        .unwrap();
        assert_eq!(ok.result.identity(), Some("A"));
    }

    #[test]
    fn test_admin_clears_are_gated() {
        let (_dir, mut gallery, book) = fixture();
        enroll(&true, &mut gallery, "A", Embedding::new(vec![1.0])).unwrap();
        let mut ledger = book.load(now().date()).unwrap();
        ledger.record("A", now()).unwrap();

        assert!(matches!(clear_gallery(&false, &mut gallery), Err(CoordinatorError::Unauthorized)));
        assert!(matches!(clear_day(&false, &book, now().date()), Err(CoordinatorError::Unauthorized)));
        assert_eq!(gallery.gallery().len(), 1);

        assert_eq!(clear_gallery(&true, &mut gallery).unwrap(), 1);
        assert!(clear_day(&true, &book, now().date()).unwrap());
        assert!(book.load(now().date()).unwrap().is_empty());
    }
}
