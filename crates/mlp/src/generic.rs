//! Placeholder for the unconstrained generic MLP.
//!
//! The intended component is a plain multi-layer perceptron without any of
//! the hypersphere machinery, mapping `[..., dim_in]` to `[..., dim_out]`
//! through `dim_hidden`. The design has not landed; construction fails with
//! an explicit error rather than guessing at semantics, so callers can
//! distinguish "not yet available" from a bug.

use thiserror::Error;

/// Error raised by the unfinished generic MLP.
#[derive(Debug, Error)]
pub enum MlpError {
    /// The generic MLP has no implementation yet.
    #[error("generic MLP is not implemented")]
    Unimplemented,
}

/// Unconstrained multi-layer perceptron. Not implemented.
#[derive(Debug)]
pub struct GenericMlp {
    _private: (),
}

impl GenericMlp {
    /// Always fails with [`MlpError::Unimplemented`].
    pub fn new(_dim_in: usize, _dim_hidden: usize, _dim_out: usize) -> Result<Self, MlpError> {
        Err(MlpError::Unimplemented)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construction_reports_unimplemented() {
        let err = GenericMlp::new(256, 128, 64).unwrap_err();
        assert!(matches!(err, MlpError::Unimplemented));
        assert_eq!(err.to_string(), "generic MLP is not implemented");
    }
}
