// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for candle-reft.

/// Errors that can occur during ReFT operations.
///
/// The taxonomy is strict: configuration and payload errors are fatal and
/// raised immediately, numerical errors (ill-conditioned ridge systems)
/// propagate uncaught, and shape errors are raised by input validation
/// before any model computation occurs.  Nothing in this crate retries or
/// translates an error; the orchestration layer performs handler cleanup
/// and re-raises the original error unchanged.
#[derive(Debug, thiserror::Error)]
pub enum ReftError {
    /// Tensor operation or host-model error (wraps candle).
    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),

    /// Missing required constructor keys, invalid enumerated option
    /// values, or dictionary-size/rank mismatches at restore time.
    #[error("config error: {0}")]
    Config(String),

    /// A required per-call side-channel tensor is absent from the
    /// subspace payload.
    #[error("missing payload: {0}")]
    MissingPayload(String),

    /// Cholesky factorization failure or other numerical breakdown.
    #[error("numerical error: {0}")]
    Numerical(String),

    /// Shape mismatch detected by broadcasting/input validation.
    #[error("shape error: {0}")]
    Shape(String),

    /// I/O error (checkpoint files).
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for candle-reft operations.
pub type Result<T> = std::result::Result<T, ReftError>;
