// SPDX-License-Identifier: MIT OR Apache-2.0

//! Orthogonally-constrained low-rank rotation layer.
//!
//! [`LowRankRotateLayer`] maps the full hidden-state space into a
//! low-rank subspace through a matrix whose columns stay orthonormal
//! throughout training.  The constraint is maintained by explicit
//! re-projection: the stored parameter matrix is unconstrained (and is
//! what the optimizer updates), and every access runs it through a
//! Householder-QR projection to an orthonormal basis.  No
//! re-orthogonalization pass is ever needed between optimizer steps.

use candle_core::Tensor;
use candle_nn::VarBuilder;

use crate::error::{ReftError, Result};
use crate::linalg;

/// An orthogonally-constrained linear map of shape
/// `(embed_dim, low_rank_dimension)`.
///
/// Owned exclusively by the intervention that created it.
pub struct LowRankRotateLayer {
    /// Unconstrained trainable parameter matrix, `[embed_dim, rank]`.
    weight: Tensor,
    /// Full hidden dimension.
    embed_dim: usize,
    /// Low-rank subspace dimension.
    rank: usize,
}

impl LowRankRotateLayer {
    /// Create a rotation layer with a trainable `[embed_dim, rank]` weight.
    ///
    /// # Errors
    ///
    /// Returns [`ReftError::Config`] unless `embed_dim > rank` (the layer
    /// only makes sense as a strict dimensionality reduction), and
    /// [`ReftError::Model`] if variable creation fails.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn new(embed_dim: usize, rank: usize, vb: VarBuilder<'_>) -> Result<Self> {
        if rank == 0 || rank >= embed_dim {
            return Err(ReftError::Config(format!(
                "low_rank_dimension must satisfy 0 < rank < embed_dim, got rank {rank} for embed_dim {embed_dim}"
            )));
        }
        let weight = vb.get_with_hints(
            (embed_dim, rank),
            "weight",
            candle_nn::init::DEFAULT_KAIMING_NORMAL,
        )?;
        Ok(Self {
            weight,
            embed_dim,
            rank,
        })
    }

    /// The orthonormal form of the weight.
    ///
    /// Recomputed from the raw parameter on every access, so columns are
    /// orthonormal regardless of how many optimizer steps have touched
    /// the raw matrix.
    ///
    /// # Errors
    ///
    /// Returns [`ReftError::Numerical`] if the raw weight became
    /// rank-deficient.
    pub fn orthonormal_weight(&self) -> Result<Tensor> {
        linalg::orthonormalize(&self.weight)
    }

    /// Project into the low-rank subspace: `x @ Q`.
    ///
    /// # Shapes
    /// - `x`: `[batch, seq, embed_dim]` (any leading dims)
    /// - returns: `[batch, seq, rank]`
    ///
    /// # Errors
    ///
    /// Returns [`ReftError::Model`] on tensor operation failures.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let q = self.orthonormal_weight()?;
        Ok(x.to_dtype(q.dtype())?.broadcast_matmul(&q)?)
    }

    /// The raw (unconstrained) parameter matrix.
    #[must_use]
    pub const fn raw_weight(&self) -> &Tensor {
        &self.weight
    }

    /// Full hidden dimension.
    #[must_use]
    pub const fn embed_dim(&self) -> usize {
        self.embed_dim
    }

    /// Low-rank subspace dimension.
    #[must_use]
    pub const fn rank(&self) -> usize {
        self.rank
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

    fn layer(embed_dim: usize, rank: usize) -> (VarMap, LowRankRotateLayer) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let layer = LowRankRotateLayer::new(embed_dim, rank, vb).unwrap();
        (varmap, layer)
    }

    #[test]
    fn columns_stay_orthonormal_after_raw_updates() {
        let (varmap, layer) = layer(8, 2);

        // Simulate optimizer steps by overwriting the raw weight with an
        // arbitrary (non-orthonormal) matrix.
        let noise: Vec<f32> = (0..16).map(|i| (i as f32).cos() * 2.5 + 0.3).collect();
        let noise = Tensor::from_vec(noise, (8, 2), &Device::Cpu).unwrap();
        let data = varmap.data().lock().unwrap();
        data.values().next().unwrap().set(&noise).unwrap();
        drop(data);

        let q = layer.orthonormal_weight().unwrap();
        let gram: Vec<Vec<f32>> = q.t().unwrap().matmul(&q).unwrap().to_vec2().unwrap();
        for i in 0..2 {
            for j in 0..2 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((gram[i][j] - expected).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn forward_projects_to_rank() {
        let (_varmap, layer) = layer(8, 2);
        let x = Tensor::ones((2, 5, 8), DType::F32, &Device::Cpu).unwrap();
        let projected = layer.forward(&x).unwrap();
        assert_eq!(projected.dims(), &[2, 5, 2]);
        assert_eq!(projected.dtype(), DType::F32);
    }

    #[test]
    fn rejects_rank_not_below_embed_dim() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(matches!(
            LowRankRotateLayer::new(4, 4, vb.clone()),
            Err(ReftError::Config(_))
        ));
        assert!(matches!(
            LowRankRotateLayer::new(4, 0, vb),
            Err(ReftError::Config(_))
        ));
    }
}
