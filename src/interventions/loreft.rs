// SPDX-License-Identifier: MIT OR Apache-2.0

//! `LoReFT` — the rotated low-rank edit — and its token-selective variant.
//!
//! `LoReFT(h) = h + R^T(f(Wh + b) − Rh)`
//!
//! `R` is an orthonormal `[embed_dim, rank]` rotation, `W`/`b` the learned
//! source projection, `f` the configured activation.  The edit replaces
//! the base's coordinates in the rotated subspace with the learned
//! source's, leaving the orthogonal complement untouched.

use std::cell::Cell;

use candle_core::{Module, Tensor};
use candle_nn::{Dropout, Linear, VarBuilder};

use crate::config::{ActFn, InterventionConfig, InterventionKind};
use crate::error::Result;
use crate::rotate::LowRankRotateLayer;
use crate::subspace::{InterventionOutput, PayloadKey, SubspacePayload};

use super::{Intervention, apply_act};

// ---------------------------------------------------------------------------
// LoreftIntervention
// ---------------------------------------------------------------------------

/// `LoReFT(h) = h + R^T(f(Wh + b) − Rh)`.
pub struct LoreftIntervention {
    /// Orthonormal rotation into the low-rank subspace.
    rotate_layer: LowRankRotateLayer,
    /// Learned source projection `W`, `b`.
    learned_source: Linear,
    /// Train-time dropout, applied as the final stage.
    dropout: Dropout,
    /// Activation on the learned source.
    act_fn: ActFn,
    /// Training-mode flag (gates dropout).
    training: Cell<bool>,
}

impl LoreftIntervention {
    /// Build from a configuration.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ReftError::Config`] when `low_rank_dimension` is
    /// absent or not below `embed_dim`.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn new(config: &InterventionConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let rank = config.require_low_rank_dimension()?;
        let rotate_layer = LowRankRotateLayer::new(config.embed_dim, rank, vb.pp("rotate_layer"))?;
        let learned_source = candle_nn::linear(config.embed_dim, rank, vb.pp("learned_source"))?;
        Ok(Self {
            rotate_layer,
            learned_source,
            dropout: Dropout::new(config.dropout),
            act_fn: config.act_fn,
            training: Cell::new(false),
        })
    }

    /// The rotation layer (used by checkpoint I/O).
    #[must_use]
    pub const fn rotate_layer(&self) -> &LowRankRotateLayer {
        &self.rotate_layer
    }

    /// The pre-dropout transform shared with the token-selective variant.
    ///
    /// # Shapes
    /// - `base`: `[batch, seq, embed_dim]`
    /// - returns: `[batch, seq, embed_dim]` in the weight dtype
    pub(crate) fn transform(&self, base: &Tensor) -> Result<Tensor> {
        let q = self.rotate_layer.orthonormal_weight()?;
        let cast = base.to_dtype(q.dtype())?;
        let rotated = cast.broadcast_matmul(&q)?;
        let projected = apply_act(self.act_fn, &self.learned_source.forward(&cast)?)?;
        let lifted = (projected - rotated)?.broadcast_matmul(&q.t()?)?;
        Ok((cast + lifted)?)
    }
}

impl Intervention for LoreftIntervention {
    fn forward(
        &self,
        base: &Tensor,
        _source: Option<&Tensor>,
        _subspaces: Option<&SubspacePayload>,
    ) -> Result<InterventionOutput> {
        let output = self.transform(base)?.to_dtype(base.dtype())?;
        let output = self.dropout.forward(&output, self.training.get())?;
        Ok(InterventionOutput::plain(output))
    }

    fn kind(&self) -> InterventionKind {
        InterventionKind::Loreft
    }

    fn set_training(&self, training: bool) {
        self.training.set(training);
    }
}

// ---------------------------------------------------------------------------
// TokenSelectiveLoreftIntervention
// ---------------------------------------------------------------------------

/// `LoReFT` with a final elementwise scale by per-call token weights.
///
/// The scale is applied before dropout.  A payload without a
/// `token_weights` entry means identity weights — not an error.
pub struct TokenSelectiveLoreftIntervention {
    /// The underlying `LoReFT` transform.
    inner: LoreftIntervention,
}

impl TokenSelectiveLoreftIntervention {
    /// Build from a configuration.
    ///
    /// # Errors
    ///
    /// Same conditions as [`LoreftIntervention::new`].
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn new(config: &InterventionConfig, vb: VarBuilder<'_>) -> Result<Self> {
        Ok(Self {
            inner: LoreftIntervention::new(config, vb)?,
        })
    }

    /// The rotation layer (used by checkpoint I/O).
    #[must_use]
    pub const fn rotate_layer(&self) -> &LowRankRotateLayer {
        self.inner.rotate_layer()
    }
}

impl Intervention for TokenSelectiveLoreftIntervention {
    fn forward(
        &self,
        base: &Tensor,
        _source: Option<&Tensor>,
        subspaces: Option<&SubspacePayload>,
    ) -> Result<InterventionOutput> {
        let mut output = self.inner.transform(base)?;
        if let Some(weights) = subspaces.and_then(SubspacePayload::token_weights) {
            output = output.broadcast_mul(&weights.to_dtype(output.dtype())?)?;
        }
        let output = output.to_dtype(base.dtype())?;
        let output = self
            .inner
            .dropout
            .forward(&output, self.inner.training.get())?;
        Ok(InterventionOutput::plain(output))
    }

    fn kind(&self) -> InterventionKind {
        InterventionKind::TokenSelectiveLoreft
    }

    fn optional_payload(&self) -> &'static [PayloadKey] {
        &[PayloadKey::TokenWeights]
    }

    fn set_training(&self, training: bool) {
        self.inner.set_training(training);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::as_conversions,
    clippy::cast_precision_loss
)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn build(embed_dim: usize, rank: usize) -> (VarMap, LoreftIntervention) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = InterventionConfig::new(embed_dim).with_low_rank_dimension(rank);
        let intervention = LoreftIntervention::new(&config, vb).unwrap();
        (varmap, intervention)
    }

    fn base_batch(device: &Device) -> Tensor {
        let data: Vec<f32> = (0..2 * 3 * 8).map(|i| (i as f32 / 10.0).sin()).collect();
        Tensor::from_vec(data, (2, 3, 8), device).unwrap()
    }

    #[test]
    fn output_matches_documented_correction() {
        // batch=2, embed_dim=8, rank=2, identity activation, zero dropout:
        // output must equal base + (f(Wh + b) - Rh) @ R^T, shape and dtype
        // preserved.
        let device = Device::Cpu;
        let (_varmap, intervention) = build(8, 2);
        let base = base_batch(&device);

        let out = intervention.forward(&base, None, None).unwrap();
        assert_eq!(out.output.dims(), &[2, 3, 8]);
        assert_eq!(out.output.dtype(), DType::F32);

        // Recompute the correction by hand from the module's parameters.
        let q = intervention.rotate_layer.orthonormal_weight().unwrap();
        let rotated = base.broadcast_matmul(&q).unwrap();
        let projected = intervention.learned_source.forward(&base).unwrap();
        let expected = (&base
            + (projected - rotated)
                .unwrap()
                .broadcast_matmul(&q.t().unwrap())
                .unwrap())
            .unwrap();

        let got: Vec<f32> = out.output.flatten_all().unwrap().to_vec1().unwrap();
        let want: Vec<f32> = expected.flatten_all().unwrap().to_vec1().unwrap();
        for (g, w) in got.iter().zip(want.iter()) {
            assert!((g - w).abs() < 1e-5, "got {g}, want {w}");
        }
    }

    #[test]
    fn eval_mode_dropout_is_identity() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = InterventionConfig::new(8)
            .with_low_rank_dimension(2)
            .with_dropout(0.5);
        let intervention = LoreftIntervention::new(&config, vb).unwrap();
        intervention.set_training(false);

        let base = base_batch(&device);
        let a = intervention.forward(&base, None, None).unwrap();
        let b = intervention.forward(&base, None, None).unwrap();
        let av: Vec<f32> = a.output.flatten_all().unwrap().to_vec1().unwrap();
        let bv: Vec<f32> = b.output.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(av, bv);
    }

    #[test]
    fn token_selective_scales_by_weights() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = InterventionConfig::new(8).with_low_rank_dimension(2);
        let intervention = TokenSelectiveLoreftIntervention::new(&config, vb).unwrap();

        let base = base_batch(&device);
        let plain = intervention.forward(&base, None, None).unwrap();

        // Zero weights zero the whole output; missing weights are identity.
        let weights = Tensor::zeros((2, 3, 1), DType::F32, &device).unwrap();
        let payload = SubspacePayload::new().with_token_weights(weights);
        let scaled = intervention.forward(&base, None, Some(&payload)).unwrap();
        let sv: Vec<f32> = scaled.output.flatten_all().unwrap().to_vec1().unwrap();
        assert!(sv.iter().all(|x| x.abs() < 1e-7));

        let empty_payload = SubspacePayload::new();
        let unscaled = intervention
            .forward(&base, None, Some(&empty_payload))
            .unwrap();
        let pv: Vec<f32> = plain.output.flatten_all().unwrap().to_vec1().unwrap();
        let uv: Vec<f32> = unscaled.output.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(pv, uv);
    }

    #[test]
    fn declares_token_weight_capability() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = InterventionConfig::new(8).with_low_rank_dimension(2);
        let intervention = TokenSelectiveLoreftIntervention::new(&config, vb).unwrap();
        assert_eq!(
            intervention.optional_payload(),
            &[PayloadKey::TokenWeights]
        );
        assert!(intervention.required_payload().is_empty());
    }
}
