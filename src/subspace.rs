// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-call subspace payloads and intervention result records.
//!
//! A [`SubspacePayload`] carries the auxiliary tensors some interventions
//! need for a single forward/generate invocation (hidden-state embeddings
//! for the ridge intervention, token weights for the token-selective
//! variant).  It is scoped to one call and never persisted.
//!
//! Interventions declare which payload entries they need via
//! [`PayloadKey`] capability tags, and the orchestration wrapper computes
//! exactly the union of declared requirements — no type inspection.
//!
//! [`InterventionOutput`] is the per-call result record: the transformed
//! hidden states plus any penalty and diagnostics the call produced.

use std::fmt;

use candle_core::Tensor;

use crate::error::{ReftError, Result};

// ---------------------------------------------------------------------------
// PayloadKey
// ---------------------------------------------------------------------------

/// A side-channel tensor an intervention may require or accept.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKey {
    /// Token-embedding sequence of the base input ("edit instruction").
    HiddenStates,
    /// Per-token selection weights.
    TokenWeights,
}

impl fmt::Display for PayloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HiddenStates => write!(f, "hidden_states"),
            Self::TokenWeights => write!(f, "token_weights"),
        }
    }
}

// ---------------------------------------------------------------------------
// SubspacePayload
// ---------------------------------------------------------------------------

/// Ephemeral per-call auxiliary tensors threaded from the orchestration
/// wrapper to specific intervention instances.
///
/// # Example
///
/// ```
/// use candle_core::{DType, Device, Tensor};
/// use candle_reft::{PayloadKey, SubspacePayload};
///
/// let hs = Tensor::zeros((2, 4, 8), DType::F32, &Device::Cpu).unwrap();
/// let payload = SubspacePayload::new().with_hidden_states(hs);
/// assert!(payload.contains(PayloadKey::HiddenStates));
/// assert!(!payload.contains(PayloadKey::TokenWeights));
/// ```
#[derive(Debug, Clone, Default)]
pub struct SubspacePayload {
    /// Embedding sequence, `[batch, instruction_seq, embed_dim]`.
    hidden_states: Option<Tensor>,
    /// Token selection weights, `[batch, seq, 1]`.
    token_weights: Option<Tensor>,
}

impl SubspacePayload {
    /// Create an empty payload.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a hidden-states entry.
    #[must_use]
    pub fn with_hidden_states(mut self, hidden_states: Tensor) -> Self {
        self.hidden_states = Some(hidden_states);
        self
    }

    /// Attach a token-weights entry.
    #[must_use]
    pub fn with_token_weights(mut self, token_weights: Tensor) -> Self {
        self.token_weights = Some(token_weights);
        self
    }

    /// The hidden-states entry, if present.
    #[must_use]
    pub const fn hidden_states(&self) -> Option<&Tensor> {
        self.hidden_states.as_ref()
    }

    /// The token-weights entry, if present.
    #[must_use]
    pub const fn token_weights(&self) -> Option<&Tensor> {
        self.token_weights.as_ref()
    }

    /// The hidden-states entry, or a payload error naming the consumer.
    ///
    /// # Errors
    ///
    /// Returns [`ReftError::MissingPayload`] when absent.
    pub fn require_hidden_states(&self, consumer: &str) -> Result<&Tensor> {
        self.hidden_states.as_ref().ok_or_else(|| {
            ReftError::MissingPayload(format!(
                "{consumer} requires a 'hidden_states' entry in the subspace payload"
            ))
        })
    }

    /// Whether the payload carries the given entry.
    #[must_use]
    pub const fn contains(&self, key: PayloadKey) -> bool {
        match key {
            PayloadKey::HiddenStates => self.hidden_states.is_some(),
            PayloadKey::TokenWeights => self.token_weights.is_some(),
        }
    }

    /// Whether the payload carries no entries at all.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.hidden_states.is_none() && self.token_weights.is_none()
    }

    /// A copy restricted to the given keys (used when broadcasting the
    /// payload to interventions with different declared requirements).
    #[must_use]
    pub fn restricted_to(&self, keys: &[PayloadKey]) -> Self {
        let mut out = Self::new();
        for key in keys {
            match key {
                PayloadKey::HiddenStates => out.hidden_states = self.hidden_states.clone(),
                PayloadKey::TokenWeights => out.token_weights = self.token_weights.clone(),
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// InterventionOutput
// ---------------------------------------------------------------------------

/// Result record of a single intervention forward call.
///
/// Replaces mutable "last computed penalty" bookkeeping with an explicit
/// per-call record; the quasi-projective intervention additionally caches
/// the penalty for training loops that drive interventions through the
/// hook engine and never see this record.
#[derive(Debug)]
pub struct InterventionOutput {
    /// Transformed hidden states, same shape and dtype as the base.
    pub output: Tensor,
    /// Sparsity/regularization penalty for this call, if computed.
    pub penalty: Option<f32>,
    /// Diagnostics, only populated in training mode with metrics enabled.
    pub diagnostics: Option<QuasiDiagnostics>,
}

impl InterventionOutput {
    /// A record carrying only the transformed tensor.
    #[must_use]
    pub const fn plain(output: Tensor) -> Self {
        Self {
            output,
            penalty: None,
            diagnostics: None,
        }
    }

    /// The penalty, or the defined zero value when none was computed.
    #[must_use]
    pub fn penalty_or_zero(&self) -> f32 {
        self.penalty.unwrap_or(0.0)
    }
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

/// Diagnostics from one ridge solve (base or source target).
///
/// Never feeds gradients; computed from detached values only.
#[derive(Debug, Clone, Default)]
pub struct RidgeDiagnostics {
    /// Mean of the regularization diagonal, when score-derived.
    pub denominator_mean: Option<f32>,
    /// Minimum of the regularization diagonal, when score-derived.
    pub denominator_min: Option<f32>,
    /// Maximum of the regularization diagonal, when score-derived.
    pub denominator_max: Option<f32>,
    /// Mean L2 norm of the importance scores across the batch.
    pub importance_score_norm: f32,
    /// Mean trace of the hat matrix (effective dimensionality); only
    /// available on the hat-matrix solve path.
    pub effective_dim: Option<f32>,
}

/// Diagnostics from one quasi-projective forward call.
#[derive(Debug, Clone, Default)]
pub struct QuasiDiagnostics {
    /// Diagnostics of the base-target solve.
    pub base: RidgeDiagnostics,
    /// Diagnostics of the source-target solve.
    pub source: RidgeDiagnostics,
    /// Norm of the base's projection onto the selected span.
    pub base_interchange_norm: f32,
    /// Norm of the source's projection onto the selected span.
    pub source_interchange_norm: f32,
    /// Norm of the applied correction (source minus base projection).
    pub intervention_norm: f32,
    /// Norm of the selected importance scores.
    pub dictionary_norm: f32,
    /// Mean numerical rank of the selected dictionary across the batch.
    pub basis_rank_mean: f32,
    /// Mean angular change between base and output (radians).
    pub angular_change: f32,
    /// The penalty value, mirrored here when computed.
    pub lambda_penalty: Option<f32>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn payload_queries() {
        let payload = SubspacePayload::new();
        assert!(payload.is_empty());
        assert!(payload.require_hidden_states("test").is_err());

        let hs = Tensor::zeros((1, 2, 4), DType::F32, &Device::Cpu).unwrap();
        let payload = payload.with_hidden_states(hs);
        assert!(!payload.is_empty());
        assert!(payload.contains(PayloadKey::HiddenStates));
        assert!(payload.require_hidden_states("test").is_ok());
        assert!(payload.token_weights().is_none());
    }

    #[test]
    fn payload_restriction_filters_entries() {
        let hs = Tensor::zeros((1, 2, 4), DType::F32, &Device::Cpu).unwrap();
        let tw = Tensor::ones((1, 2, 1), DType::F32, &Device::Cpu).unwrap();
        let payload = SubspacePayload::new()
            .with_hidden_states(hs)
            .with_token_weights(tw);

        let only_weights = payload.restricted_to(&[PayloadKey::TokenWeights]);
        assert!(only_weights.contains(PayloadKey::TokenWeights));
        assert!(!only_weights.contains(PayloadKey::HiddenStates));
    }

    #[test]
    fn output_penalty_defaults_to_zero() {
        let t = Tensor::zeros((1, 2, 4), DType::F32, &Device::Cpu).unwrap();
        let out = InterventionOutput::plain(t);
        assert!((out.penalty_or_zero() - 0.0).abs() < f32::EPSILON);
    }
}
