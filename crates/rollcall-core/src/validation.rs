//! Identity and vector checks shared by enrollment, matching and the stores.

use crate::error::CoreError;

/// Validate a claimed identity and return it without surrounding whitespace.
pub fn normalize_identity(identity: &str) -> Result<&str, CoreError> {
    let trimmed = identity.trim();
    if trimmed.is_empty() {
        return Err(CoreError::InvalidIdentity);
    }
    Ok(trimmed)
}

/// Reject empty vectors and any NaN or infinite component.
pub fn check_components(values: &[f64]) -> Result<(), CoreError> {
    if values.is_empty() {
        return Err(CoreError::EmptyEmbedding);
    }
    match values.iter().position(|v| !v.is_finite()) {
        Some(index) => Err(CoreError::NonFinite { index }),
        None => Ok(()),
    }
}

/// Check a vector length against an established dimensionality.
pub fn check_dimension(expected: usize, actual: usize) -> Result<(), CoreError> {
    if expected != actual {
        return Err(CoreError::DimensionMismatch { expected, actual });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_trimmed() {
        assert_eq!(normalize_identity("  Ada Lovelace \t"), Ok("Ada Lovelace"));
    }

    #[test]
    fn test_identity_blank_rejected() {
        assert_eq!(normalize_identity(""), Err(CoreError::InvalidIdentity));
        assert_eq!(normalize_identity(" \n\t "), Err(CoreError::InvalidIdentity));
    }

    #[test]
    fn test_components_non_finite() {
        assert_eq!(
            check_components(&[0.1, f64::NAN, 0.3]),
            Err(CoreError::NonFinite { index: 1 })
        );
        assert_eq!(
            check_components(&[f64::INFINITY]),
            Err(CoreError::NonFinite { index: 0 })
        );
    }

    #[test]
    fn test_components_empty() {
        assert_eq!(check_components(&[]), Err(CoreError::EmptyEmbedding));
        assert_eq!(check_components(&[-1.5, 0.0]), Ok(()));
    }

    #[test]
    fn test_dimension() {
        assert!(check_dimension(4, 4).is_ok());
        assert_eq!(
            check_dimension(4, 3),
            Err(CoreError::DimensionMismatch { expected: 4, actual: 3 })
        );
    }
}
