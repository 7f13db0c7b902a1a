//! Missing data descriptors
//!
//! Ensemble member files can contain fill values which should be ignored during computation.
//! There are multiple ways to describe the missing data. Currently we support:
//!
//! * A single missing value
//! * Multiple missing values
//! * A valid minimum value
//! * A valid maximum value
//! * A valid range of values
//!
//! JSON `null` and non-finite numbers are always treated as missing, regardless of the
//! descriptor.

use serde::{Deserialize, Serialize};
use validator::ValidationError;

/// Missing data
///
/// This enum can represent all known descriptions of missing data used in NetCDF4 files, which is
/// where most ensemble member output originates.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Missing {
    /// A single missing value
    MissingValue(f64),
    /// Multple missing values
    MissingValues(Vec<f64>),
    /// Valid minimum
    ValidMin(f64),
    /// Valid maxiumum
    ValidMax(f64),
    /// Valid range
    ValidRange(f64, f64),
}

impl Missing {
    /// Validate a [Missing] descriptor.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Missing::ValidRange(min, max) = self {
            if min >= max {
                let mut error =
                    ValidationError::new("Missing data valid range min must be less than max");
                error.add_param("min".into(), min);
                error.add_param("max".into(), max);
                return Err(error);
            };
        };
        Ok(())
    }

    /// Filter function to check whether the provided value is a 'missing' value
    pub fn is_missing(&self, x: f64) -> bool {
        match self {
            Missing::MissingValue(value) => x == *value,
            Missing::MissingValues(values) => values.contains(&x),
            Missing::ValidMin(min) => x < *min,
            Missing::ValidMax(max) => x > *max,
            Missing::ValidRange(min, max) => x < *min || x > *max,
        }
    }
}

/// Map a raw sample onto the in-memory representation, where absent samples are NaN.
///
/// # Arguments
///
/// * `value`: Raw sample, `None` for JSON `null`
/// * `missing`: Optional missing data descriptor
pub fn to_sample(value: Option<f64>, missing: Option<&Missing>) -> f64 {
    match value {
        Some(x) if x.is_finite() && !missing.is_some_and(|m| m.is_missing(x)) => x,
        _ => f64::NAN,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_missing_value() {
        Missing::MissingValue(-9999.0).validate().unwrap();
    }

    #[test]
    #[should_panic(expected = "Missing data valid range min must be less than max")]
    fn test_validate_range_min_gt_max() {
        Missing::ValidRange(42.0, -42.0).validate().unwrap();
    }

    #[test]
    #[should_panic(expected = "Missing data valid range min must be less than max")]
    fn test_validate_range_min_eq_max() {
        Missing::ValidRange(42.0, 42.0).validate().unwrap();
    }

    #[test]
    fn test_deserialise_snake_case() {
        let missing: Missing = serde_json::from_str(r#"{"missing_value": -9999.0}"#).unwrap();
        assert_eq!(Missing::MissingValue(-9999.0), missing);
        let missing: Missing = serde_json::from_str(r#"{"valid_range": [0.0, 1e6]}"#).unwrap();
        assert_eq!(Missing::ValidRange(0.0, 1e6), missing);
    }

    #[test]
    fn test_is_missing_value() {
        let missing = Missing::MissingValue(1.0);
        assert!(!missing.is_missing(0.0));
        assert!(missing.is_missing(1.0));
        assert!(!missing.is_missing(2.0));
    }

    #[test]
    fn test_is_missing_values() {
        let missing = Missing::MissingValues(vec![1.0, 2.0]);
        assert!(!missing.is_missing(0.0));
        assert!(missing.is_missing(1.0));
        assert!(missing.is_missing(2.0));
        assert!(!missing.is_missing(3.0));
    }

    #[test]
    fn test_is_missing_valid_min() {
        let missing = Missing::ValidMin(1.0);
        assert!(missing.is_missing(0.0));
        assert!(!missing.is_missing(1.0));
        assert!(!missing.is_missing(2.0));
    }

    #[test]
    fn test_is_missing_valid_max() {
        let missing = Missing::ValidMax(1.0);
        assert!(!missing.is_missing(0.0));
        assert!(!missing.is_missing(1.0));
        assert!(missing.is_missing(2.0));
    }

    #[test]
    fn test_is_missing_valid_range() {
        let missing = Missing::ValidRange(1.0, 2.0);
        assert!(missing.is_missing(0.0));
        assert!(!missing.is_missing(1.0));
        assert!(!missing.is_missing(2.0));
        assert!(missing.is_missing(3.0));
    }

    #[test]
    fn test_to_sample() {
        let missing = Missing::MissingValue(-9999.0);
        assert_eq!(4.0, to_sample(Some(4.0), Some(&missing)));
        assert!(to_sample(Some(-9999.0), Some(&missing)).is_nan());
        assert!(to_sample(None, None).is_nan());
        assert!(to_sample(Some(f64::INFINITY), None).is_nan());
        assert_eq!(-9999.0, to_sample(Some(-9999.0), None));
    }
}
