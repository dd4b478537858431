// SPDX-License-Identifier: MIT OR Apache-2.0

//! The remaining linear-algebra intervention variants.
//!
//! Each composes the same three primitives — a learned linear (or
//! constant) source in the low-rank space, an optional activation, and a
//! lift back to full rank through the rotation/projection transpose —
//! according to its fixed algebraic formula:
//!
//! | Variant | Formula |
//! |---------|---------|
//! | `NoReFT` | `h + W2^T(f(W1 h + b) − W2 h)` |
//! | `ConsReFT` | `h + R^T(b − Rh)` |
//! | `LobiReFT` | `h + R^T b` |
//! | `DiReFT` | `h + R^T f(Wh + b)` |
//! | `NodiReFT` | `h + W2^T f(W1 h + b)` |

use std::cell::Cell;

use candle_core::{Module, Tensor};
use candle_nn::{Dropout, Linear, VarBuilder};

use crate::config::{ActFn, InterventionConfig, InterventionKind};
use crate::error::Result;
use crate::rotate::LowRankRotateLayer;
use crate::subspace::{InterventionOutput, SubspacePayload};

use super::{Intervention, apply_act};

// ---------------------------------------------------------------------------
// NoreftIntervention
// ---------------------------------------------------------------------------

/// `NoReFT(h) = h + W2^T(f(W1 h + b) − W2 h)`.
///
/// Like `LoReFT` but with an unconstrained projection `W2` in place of
/// the orthonormal rotation.
pub struct NoreftIntervention {
    /// Unconstrained projection `W2` (bias controlled by `add_bias`).
    proj_layer: Linear,
    /// Learned source projection `W1`, `b`.
    learned_source: Linear,
    /// Train-time dropout.
    dropout: Dropout,
    /// Activation on the learned source.
    act_fn: ActFn,
    /// Training-mode flag.
    training: Cell<bool>,
}

impl NoreftIntervention {
    /// Build from a configuration.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ReftError::Config`] when `low_rank_dimension` is
    /// absent.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn new(config: &InterventionConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let rank = config.require_low_rank_dimension()?;
        let proj_layer = if config.add_bias {
            candle_nn::linear(config.embed_dim, rank, vb.pp("proj_layer"))?
        } else {
            candle_nn::linear_no_bias(config.embed_dim, rank, vb.pp("proj_layer"))?
        };
        let learned_source = candle_nn::linear(config.embed_dim, rank, vb.pp("learned_source"))?;
        Ok(Self {
            proj_layer,
            learned_source,
            dropout: Dropout::new(config.dropout),
            act_fn: config.act_fn,
            training: Cell::new(false),
        })
    }
}

impl Intervention for NoreftIntervention {
    fn forward(
        &self,
        base: &Tensor,
        _source: Option<&Tensor>,
        _subspaces: Option<&SubspacePayload>,
    ) -> Result<InterventionOutput> {
        let cast = base.to_dtype(self.proj_layer.weight().dtype())?;
        let projected = self.proj_layer.forward(&cast)?;
        let source = apply_act(self.act_fn, &self.learned_source.forward(&cast)?)?;
        let lifted = (source - projected)?.broadcast_matmul(self.proj_layer.weight())?;
        let output = (cast + lifted)?.to_dtype(base.dtype())?;
        let output = self.dropout.forward(&output, self.training.get())?;
        Ok(InterventionOutput::plain(output))
    }

    fn kind(&self) -> InterventionKind {
        InterventionKind::Noreft
    }

    fn set_training(&self, training: bool) {
        self.training.set(training);
    }
}

// ---------------------------------------------------------------------------
// ConsreftIntervention
// ---------------------------------------------------------------------------

/// `ConsReFT(h) = h + R^T(b − Rh)` — the learned source is a constant
/// vector, so the edit drives the rotated coordinates toward `b`
/// regardless of the input.
pub struct ConsreftIntervention {
    /// Orthonormal rotation.
    rotate_layer: LowRankRotateLayer,
    /// Constant learned source `b`, `[rank]`.
    learned_source: Tensor,
}

impl ConsreftIntervention {
    /// Build from a configuration.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ReftError::Config`] when `low_rank_dimension` is
    /// absent.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn new(config: &InterventionConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let rank = config.require_low_rank_dimension()?;
        let rotate_layer = LowRankRotateLayer::new(config.embed_dim, rank, vb.pp("rotate_layer"))?;
        let learned_source = vb.get_with_hints(
            rank,
            "learned_source",
            candle_nn::Init::Uniform { lo: 0.0, up: 1.0 },
        )?;
        Ok(Self {
            rotate_layer,
            learned_source,
        })
    }

    /// The rotation layer (used by checkpoint I/O).
    #[must_use]
    pub const fn rotate_layer(&self) -> &LowRankRotateLayer {
        &self.rotate_layer
    }
}

impl Intervention for ConsreftIntervention {
    fn forward(
        &self,
        base: &Tensor,
        _source: Option<&Tensor>,
        _subspaces: Option<&SubspacePayload>,
    ) -> Result<InterventionOutput> {
        let q = self.rotate_layer.orthonormal_weight()?;
        let cast = base.to_dtype(q.dtype())?;
        let rotated = cast.broadcast_matmul(&q)?;
        let diff = self.learned_source.broadcast_sub(&rotated)?;
        let output = (cast + diff.broadcast_matmul(&q.t()?)?)?.to_dtype(base.dtype())?;
        Ok(InterventionOutput::plain(output))
    }

    fn kind(&self) -> InterventionKind {
        InterventionKind::Consreft
    }
}

// ---------------------------------------------------------------------------
// LobireftIntervention
// ---------------------------------------------------------------------------

/// `LobiReFT(h) = h + R^T b` — a learned bias lifted through the
/// rotation; the edit direction is input-independent.
pub struct LobireftIntervention {
    /// Orthonormal rotation.
    rotate_layer: LowRankRotateLayer,
    /// Constant learned source `b`, `[rank]`.
    learned_source: Tensor,
    /// Train-time dropout.
    dropout: Dropout,
    /// Training-mode flag.
    training: Cell<bool>,
}

impl LobireftIntervention {
    /// Build from a configuration.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ReftError::Config`] when `low_rank_dimension` is
    /// absent.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn new(config: &InterventionConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let rank = config.require_low_rank_dimension()?;
        let rotate_layer = LowRankRotateLayer::new(config.embed_dim, rank, vb.pp("rotate_layer"))?;
        let learned_source = vb.get_with_hints(
            rank,
            "learned_source",
            candle_nn::Init::Uniform { lo: 0.0, up: 1.0 },
        )?;
        Ok(Self {
            rotate_layer,
            learned_source,
            dropout: Dropout::new(config.dropout),
            training: Cell::new(false),
        })
    }

    /// The rotation layer (used by checkpoint I/O).
    #[must_use]
    pub const fn rotate_layer(&self) -> &LowRankRotateLayer {
        &self.rotate_layer
    }
}

impl Intervention for LobireftIntervention {
    fn forward(
        &self,
        base: &Tensor,
        _source: Option<&Tensor>,
        _subspaces: Option<&SubspacePayload>,
    ) -> Result<InterventionOutput> {
        let q = self.rotate_layer.orthonormal_weight()?;
        let cast = base.to_dtype(q.dtype())?;
        let delta = self
            .learned_source
            .unsqueeze(0)?
            .matmul(&q.t()?)?
            .squeeze(0)?;
        let output = cast.broadcast_add(&delta)?.to_dtype(base.dtype())?;
        let output = self.dropout.forward(&output, self.training.get())?;
        Ok(InterventionOutput::plain(output))
    }

    fn kind(&self) -> InterventionKind {
        InterventionKind::Lobireft
    }

    fn set_training(&self, training: bool) {
        self.training.set(training);
    }
}

// ---------------------------------------------------------------------------
// DireftIntervention
// ---------------------------------------------------------------------------

/// `DiReFT(h) = h + R^T f(Wh + b)` — drops the subtraction term of
/// `LoReFT`, adding the lifted source directly.
pub struct DireftIntervention {
    /// Orthonormal rotation.
    rotate_layer: LowRankRotateLayer,
    /// Learned source projection.
    learned_source: Linear,
    /// Train-time dropout.
    dropout: Dropout,
    /// Activation on the learned source.
    act_fn: ActFn,
    /// Training-mode flag.
    training: Cell<bool>,
}

impl DireftIntervention {
    /// Build from a configuration.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ReftError::Config`] when `low_rank_dimension` is
    /// absent.
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
}

impl Intervention for DireftIntervention {
    fn forward(
        &self,
        base: &Tensor,
        _source: Option<&Tensor>,
        _subspaces: Option<&SubspacePayload>,
    ) -> Result<InterventionOutput> {
        let q = self.rotate_layer.orthonormal_weight()?;
        let cast = base.to_dtype(q.dtype())?;
        let source = apply_act(self.act_fn, &self.learned_source.forward(&cast)?)?;
        let output = (cast + source.broadcast_matmul(&q.t()?)?)?.to_dtype(base.dtype())?;
        let output = self.dropout.forward(&output, self.training.get())?;
        Ok(InterventionOutput::plain(output))
    }

    fn kind(&self) -> InterventionKind {
        InterventionKind::Direft
    }

    fn set_training(&self, training: bool) {
        self.training.set(training);
    }
}

// ---------------------------------------------------------------------------
// NodireftIntervention
// ---------------------------------------------------------------------------

/// `NodiReFT(h) = h + W2^T f(W1 h + b)` — no rotation constraint and no
/// subtraction term.
pub struct NodireftIntervention {
    /// Unconstrained projection `W2`.
    proj_layer: Linear,
    /// Learned source projection.
    learned_source: Linear,
    /// Train-time dropout.
    dropout: Dropout,
    /// Activation on the learned source.
    act_fn: ActFn,
    /// Training-mode flag.
    training: Cell<bool>,
}

impl NodireftIntervention {
    /// Build from a configuration.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ReftError::Config`] when `low_rank_dimension` is
    /// absent.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn new(config: &InterventionConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let rank = config.require_low_rank_dimension()?;
        let proj_layer = if config.add_bias {
            candle_nn::linear(config.embed_dim, rank, vb.pp("proj_layer"))?
        } else {
            candle_nn::linear_no_bias(config.embed_dim, rank, vb.pp("proj_layer"))?
        };
        let learned_source = candle_nn::linear(config.embed_dim, rank, vb.pp("learned_source"))?;
        Ok(Self {
            proj_layer,
            learned_source,
            dropout: Dropout::new(config.dropout),
            act_fn: config.act_fn,
            training: Cell::new(false),
        })
    }
}

impl Intervention for NodireftIntervention {
    fn forward(
        &self,
        base: &Tensor,
        _source: Option<&Tensor>,
        _subspaces: Option<&SubspacePayload>,
    ) -> Result<InterventionOutput> {
        let cast = base.to_dtype(self.proj_layer.weight().dtype())?;
        let source = apply_act(self.act_fn, &self.learned_source.forward(&cast)?)?;
        let output =
            (cast + source.broadcast_matmul(self.proj_layer.weight())?)?.to_dtype(base.dtype())?;
        let output = self.dropout.forward(&output, self.training.get())?;
        Ok(InterventionOutput::plain(output))
    }

    fn kind(&self) -> InterventionKind {
        InterventionKind::Nodireft
    }

    fn set_training(&self, training: bool) {
        self.training.set(training);
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

    fn base_batch(device: &Device) -> Tensor {
        let data: Vec<f32> = (0..2 * 3 * 8).map(|i| (i as f32 / 7.0).cos()).collect();
        Tensor::from_vec(data, (2, 3, 8), device).unwrap()
    }

    #[test]
    fn lobireft_adds_exact_lifted_bias() {
        // With learned_source set to a known constant vector, the output
        // must equal base + b @ R^T exactly — no stochastic components.
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = InterventionConfig::new(8).with_low_rank_dimension(2);
        let intervention = LobireftIntervention::new(&config, vb).unwrap();

        let known = Tensor::from_vec(vec![0.5f32, -1.25], 2, &device).unwrap();
        varmap
            .data()
            .lock()
            .unwrap()
            .get("learned_source")
            .unwrap()
            .set(&known)
            .unwrap();

        let base = base_batch(&device);
        let out = intervention.forward(&base, None, None).unwrap();

        let q = intervention.rotate_layer.orthonormal_weight().unwrap();
        let delta = known
            .unsqueeze(0)
            .unwrap()
            .matmul(&q.t().unwrap())
            .unwrap()
            .squeeze(0)
            .unwrap();
        let expected = base.broadcast_add(&delta).unwrap();

        let got: Vec<f32> = out.output.flatten_all().unwrap().to_vec1().unwrap();
        let want: Vec<f32> = expected.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(got, want);
    }

    #[test]
    fn consreft_drives_rotated_coordinates_to_constant() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = InterventionConfig::new(8).with_low_rank_dimension(2);
        let intervention = ConsreftIntervention::new(&config, vb).unwrap();

        let base = base_batch(&device);
        let out = intervention.forward(&base, None, None).unwrap();

        // Rotating the output must yield the learned constant everywhere:
        // R(h + R^T(b - Rh)) = Rh + (b - Rh) = b, since R^T R = I.
        let q = intervention.rotate_layer.orthonormal_weight().unwrap();
        let rotated_out = out.output.broadcast_matmul(&q).unwrap();
        let rotated: Vec<f32> = rotated_out.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = intervention
            .learned_source
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        for chunk in rotated.chunks(2) {
            for (got, want) in chunk.iter().zip(b.iter()) {
                assert!((got - want).abs() < 1e-5, "got {got}, want {want}");
            }
        }
    }

    #[test]
    fn noreft_preserves_shape_and_dtype() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = InterventionConfig::new(8)
            .with_low_rank_dimension(3)
            .with_add_bias(true);
        let intervention = NoreftIntervention::new(&config, vb).unwrap();

        let base = base_batch(&device);
        let out = intervention.forward(&base, None, None).unwrap();
        assert_eq!(out.output.dims(), base.dims());
        assert_eq!(out.output.dtype(), base.dtype());
    }

    #[test]
    fn direft_equals_base_plus_lifted_source() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = InterventionConfig::new(8).with_low_rank_dimension(2);
        let intervention = DireftIntervention::new(&config, vb).unwrap();

        let base = base_batch(&device);
        let out = intervention.forward(&base, None, None).unwrap();

        let q = intervention.rotate_layer.orthonormal_weight().unwrap();
        let source = intervention.learned_source.forward(&base).unwrap();
        let expected = (&base + source.broadcast_matmul(&q.t().unwrap()).unwrap()).unwrap();

        let got: Vec<f32> = out.output.flatten_all().unwrap().to_vec1().unwrap();
        let want: Vec<f32> = expected.flatten_all().unwrap().to_vec1().unwrap();
        for (g, w) in got.iter().zip(want.iter()) {
            assert!((g - w).abs() < 1e-5);
        }
    }

    #[test]
    fn nodireft_runs_without_rotation_parameters() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = InterventionConfig::new(8).with_low_rank_dimension(2);
        let intervention = NodireftIntervention::new(&config, vb).unwrap();

        let base = base_batch(&device);
        let out = intervention.forward(&base, None, None).unwrap();
        assert_eq!(out.output.dims(), base.dims());

        // No rotate_layer variables were created.
        let data = varmap.data().lock().unwrap();
        assert!(data.keys().all(|k| !k.contains("rotate_layer")));
    }
}
