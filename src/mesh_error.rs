//! MeshAdaptError: unified error type for mesh-adapt public APIs
//!
//! Every fallible public API in this crate reports through this enum. The
//! taxonomy mirrors the failure policy of the adaptation kernel: caller bugs
//! (bad dimension, missing tags, non-SPD metrics) surface as errors at the
//! entry point; cavity-level gating failures are not errors (the operator
//! declines the key); internal invariant breaks are caught by debug
//! assertions and, with the `check-invariants` feature, in release builds.

use thiserror::Error;

/// Unified error type for mesh-adapt operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MeshAdaptError {
    /// Mesh dimension outside the supported set {2, 3}.
    #[error("unsupported mesh dimension {0} (expected 2 or 3)")]
    UnsupportedDimension(usize),
    /// An array argument has a length that is not a multiple of its width.
    #[error("array of {len} entries is not divisible by width {width}")]
    ArraySizeMismatch { len: usize, width: usize },
    /// A required tag is missing from the mesh.
    #[error("required tag \"{name}\" missing at entity dimension {dim}")]
    MissingTag { dim: usize, name: String },
    /// A tag with this name already exists at this dimension.
    #[error("tag \"{name}\" already present at entity dimension {dim}")]
    DuplicateTag { dim: usize, name: String },
    /// A tag exists but holds a different scalar type than requested.
    #[error("tag \"{name}\" at dimension {dim} has a different scalar type")]
    TagTypeMismatch { dim: usize, name: String },
    /// Tag data length disagrees with entity count times width.
    #[error("tag \"{name}\" has {len} entries, expected {expected}")]
    TagSizeMismatch {
        name: String,
        len: usize,
        expected: usize,
    },
    /// A metric argument is not symmetric positive-definite.
    #[error("metric is not positive-definite (eigenvalue {0})")]
    NotPositiveDefinite(f64),
    /// An isotropic size value must be strictly positive.
    #[error("size field value {0} is not strictly positive")]
    NonPositiveSize(f64),
    /// Adapt options failed validation.
    #[error("invalid adapt options: {0}")]
    InvalidOptions(String),
    /// The input mesh violates a precondition of the requested operation.
    #[error("mesh precondition violated: {0}")]
    Precondition(String),
    /// Element quality fell below the hard floor the caller promised to hold.
    #[error("element quality {found} below min_quality_allowed {allowed}")]
    QualityBelowAllowed { found: f64, allowed: f64 },
    /// An edge exceeded the emergency length ceiling.
    #[error("edge length {found} above max_length_allowed {allowed}")]
    LengthAboveAllowed { found: f64, allowed: f64 },
    /// Internal invariant violated; indicates a bug in the kernel.
    #[error("internal invariant violated: {0}")]
    InvariantViolation(String),
}

/// Shorthand used throughout the crate.
pub type Result<T> = std::result::Result<T, MeshAdaptError>;

/// Invariant check that returns `InvariantViolation` instead of panicking.
///
/// In debug builds (or with the `check-invariants` feature) the condition is
/// evaluated and a failure is reported; otherwise the check compiles away.
#[macro_export]
macro_rules! check_invariant {
    ($cond:expr, $($arg:tt)*) => {
        #[cfg(any(debug_assertions, feature = "check-invariants"))]
        {
            if !$cond {
                return Err($crate::mesh_error::MeshAdaptError::InvariantViolation(
                    format!($($arg)*),
                ));
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_context() {
        let e = MeshAdaptError::MissingTag {
            dim: 0,
            name: "metric".into(),
        };
        assert_eq!(
            e.to_string(),
            "required tag \"metric\" missing at entity dimension 0"
        );
    }

    #[test]
    fn errors_compare_equal() {
        assert_eq!(
            MeshAdaptError::UnsupportedDimension(4),
            MeshAdaptError::UnsupportedDimension(4)
        );
        assert_ne!(
            MeshAdaptError::UnsupportedDimension(4),
            MeshAdaptError::UnsupportedDimension(5)
        );
    }
}
