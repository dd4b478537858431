// SPDX-License-Identifier: MIT OR Apache-2.0

//! The intervention family: trainable hidden-state transforms.
//!
//! - [`loreft`] — the rotated low-rank edit (`LoReFT`) and its
//!   token-selective variant.
//! - [`family`] — the remaining linear-algebra variants (`NoReFT`,
//!   `ConsReFT`, `LobiReFT`, `DiReFT`, `NodiReFT`).
//! - [`quasi`] — the closed-form ridge quasi-projection.
//!
//! Every variant implements [`Intervention`]: a stateful transform of a
//! hidden-state batch that leaves shape and dtype unchanged.  Variants
//! declare the per-call side-channel tensors they consume via
//! [`PayloadKey`] capability tags; the orchestration wrapper computes
//! exactly the union of declared requirements.

pub mod family;
pub mod loreft;
pub mod quasi;

pub use family::{
    ConsreftIntervention, DireftIntervention, LobireftIntervention, NodireftIntervention,
    NoreftIntervention,
};
pub use loreft::{LoreftIntervention, TokenSelectiveLoreftIntervention};
pub use quasi::QuasiProjectiveIntervention;

use candle_core::Tensor;
use candle_nn::VarBuilder;

use crate::config::{ActFn, InterventionConfig, InterventionKind};
use crate::error::{ReftError, Result};
use crate::subspace::{InterventionOutput, PayloadKey, SubspacePayload};

// ---------------------------------------------------------------------------
// Intervention trait
// ---------------------------------------------------------------------------

/// A trainable transform applied to a host model's hidden states at a
/// chosen layer/position.
///
/// `forward` must return a tensor with the base's shape and numeric
/// precision.  The `source` argument exists for interchange-style
/// engines; every variant in this crate is sourceless and ignores it.
pub trait Intervention {
    /// Transform a batch of hidden states.
    ///
    /// # Shapes
    /// - `base`: `[batch, seq, embed_dim]`
    /// - returns: output with the same shape and dtype as `base`
    ///
    /// # Errors
    ///
    /// Returns [`ReftError::MissingPayload`] when a required payload
    /// entry is absent, and [`ReftError::Model`] /
    /// [`ReftError::Numerical`] on tensor or solver failures.
    fn forward(
        &self,
        base: &Tensor,
        source: Option<&Tensor>,
        subspaces: Option<&SubspacePayload>,
    ) -> Result<InterventionOutput>;

    /// The variant this intervention implements.
    fn kind(&self) -> InterventionKind;

    /// Payload entries this intervention cannot run without.
    fn required_payload(&self) -> &'static [PayloadKey] {
        &[]
    }

    /// Payload entries this intervention uses when present.
    fn optional_payload(&self) -> &'static [PayloadKey] {
        &[]
    }

    /// Switch between training and evaluation behavior (dropout,
    /// metrics).  Default: stateless no-op.
    fn set_training(&self, training: bool) {
        let _ = training;
    }

    /// Last computed penalty, for training loops that drive interventions
    /// through the hook engine and never see the per-call record.
    /// Returns the defined zero value when nothing is cached.
    fn penalty(&self) -> f32 {
        0.0
    }

    /// Clear the cached penalty.  Reset is always an explicit call,
    /// never automatic.
    fn zero_penalty(&self) {}
}

// ---------------------------------------------------------------------------
// Activation dispatch
// ---------------------------------------------------------------------------

/// Apply the configured activation to the learned-source projection.
///
/// # Errors
///
/// Returns [`ReftError::Model`] on tensor operation failures.
pub(crate) fn apply_act(act_fn: ActFn, x: &Tensor) -> Result<Tensor> {
    match act_fn {
        ActFn::Linear => Ok(x.clone()),
        ActFn::Relu => Ok(x.relu()?),
        ActFn::Gelu => Ok(x.gelu_erf()?),
        ActFn::Silu => Ok(x.silu()?),
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Construct an intervention of the given kind from a configuration.
///
/// Trainable parameters are created through `vb`, so callers that root
/// the builder in a `VarMap` can hand the collected variables to an
/// optimizer and to checkpoint I/O.
///
/// # Errors
///
/// Returns [`ReftError::Config`] when required configuration keys for the
/// requested kind are absent or invalid.
// TRAIT_OBJECT: the registry holds heterogeneous variants behind dynamic dispatch
#[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
pub fn build_intervention(
    kind: InterventionKind,
    config: &InterventionConfig,
    vb: VarBuilder<'_>,
) -> Result<Box<dyn Intervention>> {
    match kind {
        InterventionKind::Loreft => Ok(Box::new(loreft::LoreftIntervention::new(config, vb)?)),
        InterventionKind::TokenSelectiveLoreft => Ok(Box::new(
            loreft::TokenSelectiveLoreftIntervention::new(config, vb)?,
        )),
        InterventionKind::Noreft => Ok(Box::new(family::NoreftIntervention::new(config, vb)?)),
        InterventionKind::Consreft => {
            Ok(Box::new(family::ConsreftIntervention::new(config, vb)?))
        }
        InterventionKind::Lobireft => {
            Ok(Box::new(family::LobireftIntervention::new(config, vb)?))
        }
        InterventionKind::Direft => Ok(Box::new(family::DireftIntervention::new(config, vb)?)),
        InterventionKind::Nodireft => {
            Ok(Box::new(family::NodireftIntervention::new(config, vb)?))
        }
        InterventionKind::QuasiProjective => {
            let ridge = config.ridge.as_ref().ok_or_else(|| {
                ReftError::Config(
                    "quasi_projective intervention requires a ridge configuration".into(),
                )
            })?;
            Ok(Box::new(quasi::QuasiProjectiveIntervention::new(ridge, vb)?))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn factory_builds_every_linear_variant() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = InterventionConfig::new(16).with_low_rank_dimension(4);

        for kind in [
            InterventionKind::Loreft,
            InterventionKind::TokenSelectiveLoreft,
            InterventionKind::Noreft,
            InterventionKind::Consreft,
            InterventionKind::Lobireft,
            InterventionKind::Direft,
            InterventionKind::Nodireft,
        ] {
            let built = build_intervention(kind, &config, vb.pp(kind.to_string())).unwrap();
            assert_eq!(built.kind(), kind);
        }
    }

    #[test]
    fn factory_rejects_missing_rank() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = InterventionConfig::new(16);
        assert!(matches!(
            build_intervention(InterventionKind::Loreft, &config, vb),
            Err(ReftError::Config(_))
        ));
    }

    #[test]
    fn factory_rejects_quasi_without_ridge_config() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = InterventionConfig::new(16);
        assert!(matches!(
            build_intervention(InterventionKind::QuasiProjective, &config, vb),
            Err(ReftError::Config(_))
        ));
    }
}
