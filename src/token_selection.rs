// SPDX-License-Identifier: MIT OR Apache-2.0

//! Automated token selection for token-selective interventions.
//!
//! [`TokenSelector`] turns the base input's embedding sequence into
//! per-token intervention weights: a [`ScaledDotProductAttention`] pass
//! scores every token against its context, and a
//! [`DiscreteTokenSelection`] head discretizes the scores with a
//! temperature-scheduled binary-concrete relaxation (soft and noisy
//! while training, hard thresholded at evaluation).
//!
//! The temperature anneals from `start_temperature` to `end_temperature`
//! over `total_steps`; the training loop drives [`advance_step`]
//! (scheduler integration itself lives outside this crate).
//!
//! [`advance_step`]: DiscreteTokenSelection::advance_step

use std::cell::Cell;

use candle_core::{D, DType, Module, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::error::{ReftError, Result};

// ---------------------------------------------------------------------------
// ScaledDotProductAttention
// ---------------------------------------------------------------------------

/// Single-head scaled dot-product self-attention used as a token scorer.
pub struct ScaledDotProductAttention {
    /// Query projection.
    q_proj: Linear,
    /// Key projection.
    k_proj: Linear,
    /// Value projection.
    v_proj: Linear,
    /// Attention scale factor, `1/sqrt(embed_dim)`.
    scale: f64,
}

impl ScaledDotProductAttention {
    /// Build projections of shape `embed_dim -> embed_dim`.
    ///
    /// # Errors
    ///
    /// Returns [`ReftError::Model`] if variable creation fails.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn new(embed_dim: usize, vb: VarBuilder<'_>) -> Result<Self> {
        let q_proj = candle_nn::linear(embed_dim, embed_dim, vb.pp("q_proj"))?;
        let k_proj = candle_nn::linear(embed_dim, embed_dim, vb.pp("k_proj"))?;
        let v_proj = candle_nn::linear(embed_dim, embed_dim, vb.pp("v_proj"))?;
        #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
        let scale = 1.0 / (embed_dim as f64).sqrt();
        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            scale,
        })
    }

    /// Full (non-causal) self-attention over the sequence.
    ///
    /// # Shapes
    /// - `query`, `key`, `value`: `[batch, seq, embed_dim]`
    /// - returns: `(attended [batch, seq, embed_dim],
    ///   pattern [batch, seq, seq])`
    ///
    /// # Errors
    ///
    /// Returns [`ReftError::Model`] on tensor operation failures.
    pub fn forward(&self, query: &Tensor, key: &Tensor, value: &Tensor) -> Result<(Tensor, Tensor)> {
        let q = self.q_proj.forward(query)?;
        let k = self.k_proj.forward(key)?;
        let v = self.v_proj.forward(value)?;

        // CONTIGUOUS: transpose produces non-unit strides; matmul requires contiguous layout
        let scores = (q.matmul(&k.t()?.contiguous()?)? * self.scale)?;

        // PROMOTE: softmax over F16/BF16 can produce NaN; compute in F32
        let original_dtype = scores.dtype();
        let scores_f32 = scores.to_dtype(DType::F32)?;
        let mut pattern = candle_nn::ops::softmax_last_dim(&scores_f32)?;
        if original_dtype != DType::F32 {
            pattern = pattern.to_dtype(original_dtype)?;
        }

        let attended = pattern.matmul(&v.contiguous()?)?;
        Ok((attended, pattern))
    }
}

// ---------------------------------------------------------------------------
// Temperature schedule
// ---------------------------------------------------------------------------

/// Linear temperature anneal from `start` to `end` over `total_steps`.
#[derive(Debug, Clone, Copy)]
pub struct TemperatureSchedule {
    /// Temperature at step 0.
    pub start: f64,
    /// Temperature at and after `total_steps`.
    pub end: f64,
    /// Number of steps over which to anneal.
    pub total_steps: usize,
}

impl TemperatureSchedule {
    /// Create a schedule.
    #[must_use]
    pub const fn new(start: f64, end: f64, total_steps: usize) -> Self {
        Self {
            start,
            end,
            total_steps,
        }
    }

    /// Temperature at the given step, clamped to the end value.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    pub fn at(&self, step: usize) -> f64 {
        if self.total_steps == 0 || step >= self.total_steps {
            return self.end;
        }
        let fraction = step as f64 / self.total_steps as f64;
        (self.end - self.start).mul_add(fraction, self.start)
    }
}

/// How score logits become selection weights.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiscretizationStrategy {
    /// Binary-concrete relaxation: Gumbel-logistic noise plus
    /// temperature-scaled sigmoid while training, hard 0/1 threshold at
    /// evaluation.
    #[default]
    BinaryConcrete,
    /// Plain temperature-scaled sigmoid in both modes.
    Sigmoid,
}

// ---------------------------------------------------------------------------
// DiscreteTokenSelection
// ---------------------------------------------------------------------------

/// Discretizes per-token scores into intervention weights.
pub struct DiscreteTokenSelection {
    /// Scoring head, `embed_dim -> 1`.
    score_head: Linear,
    /// Temperature schedule.
    schedule: TemperatureSchedule,
    /// Discretization strategy.
    strategy: DiscretizationStrategy,
    /// Current scheduler step.
    step: Cell<usize>,
    /// Training-mode flag (gates the concrete noise).
    training: Cell<bool>,
}

impl DiscreteTokenSelection {
    /// Build the selection head.
    ///
    /// # Errors
    ///
    /// Returns [`ReftError::Model`] if variable creation fails.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn new(
        embed_dim: usize,
        schedule: TemperatureSchedule,
        strategy: DiscretizationStrategy,
        vb: VarBuilder<'_>,
    ) -> Result<Self> {
        let score_head = candle_nn::linear(embed_dim, 1, vb.pp("score_head"))?;
        Ok(Self {
            score_head,
            schedule,
            strategy,
            step: Cell::new(0),
            training: Cell::new(false),
        })
    }

    /// Score attended token features and discretize.
    ///
    /// # Shapes
    /// - `features`: `[batch, seq, embed_dim]`
    /// - returns: `[batch, seq, 1]` weights in `[0, 1]`
    ///
    /// # Errors
    ///
    /// Returns [`ReftError::Model`] on tensor operation failures.
    pub fn forward(&self, features: &Tensor) -> Result<Tensor> {
        let logits = self.score_head.forward(features)?;
        self.discretize(&logits)
    }

    /// Derive weights from an attention pattern instead of features:
    /// each token's score is its incoming attention mass (mean over
    /// query positions), logit-transformed.
    ///
    /// # Shapes
    /// - `pattern`: `[batch, seq, seq]`
    /// - returns: `[batch, seq, 1]`
    ///
    /// # Errors
    ///
    /// Returns [`ReftError::Model`] on tensor operation failures.
    pub fn forward_from_pattern(&self, pattern: &Tensor) -> Result<Tensor> {
        // Mean over the query axis gives the mass received per position.
        let mass = pattern.to_dtype(DType::F32)?.mean(1)?;
        let eps = 1e-6f64;
        let logits = ((&mass + eps)? / ((1.0 - &mass)? + eps)?)?.log()?;
        self.discretize(&logits.unsqueeze(D::Minus1)?)
    }

    /// Apply the temperature-scheduled discretization.
    fn discretize(&self, logits: &Tensor) -> Result<Tensor> {
        let temperature = self.schedule.at(self.step.get());
        if temperature <= 0.0 {
            return Err(ReftError::Config(format!(
                "temperature schedule produced non-positive temperature {temperature}"
            )));
        }
        let original_dtype = logits.dtype();
        // PROMOTE: the relaxation runs in F32
        let logits = logits.to_dtype(DType::F32)?;

        let weights = match (self.strategy, self.training.get()) {
            (DiscretizationStrategy::BinaryConcrete, true) => {
                // Gumbel-logistic noise: g = log(u) - log(1 - u).
                let u = Tensor::rand(1e-6f32, 1.0 - 1e-6, logits.dims(), logits.device())?;
                let noise = (u.log()? - (1.0 - &u)?.log()?)?;
                let relaxed = ((logits + noise)? / temperature)?;
                candle_nn::ops::sigmoid(&relaxed)?
            }
            (DiscretizationStrategy::BinaryConcrete, false) => {
                // Hard threshold at evaluation: weight 1 where the logit
                // is positive.
                logits.gt(0.0)?.to_dtype(DType::F32)?
            }
            (DiscretizationStrategy::Sigmoid, _) => {
                candle_nn::ops::sigmoid(&(logits / temperature)?)?
            }
        };
        Ok(weights.to_dtype(original_dtype)?)
    }

    /// Advance the temperature schedule by one step.
    pub fn advance_step(&self) {
        self.step.set(self.step.get().saturating_add(1));
    }

    /// Set the scheduler step directly.
    pub fn set_step(&self, step: usize) {
        self.step.set(step);
    }

    /// The temperature for the current step.
    #[must_use]
    pub fn current_temperature(&self) -> f64 {
        self.schedule.at(self.step.get())
    }

    /// Switch between training and evaluation behavior.
    pub fn set_training(&self, training: bool) {
        self.training.set(training);
    }
}

// ---------------------------------------------------------------------------
// TokenSelector
// ---------------------------------------------------------------------------

/// Embedding sequence in, per-token intervention weights out.
pub struct TokenSelector {
    /// Context scorer.
    attention: ScaledDotProductAttention,
    /// Discretizer.
    selector: DiscreteTokenSelection,
    /// Score from the attention pattern instead of attended features.
    use_attn_weights: bool,
}

impl TokenSelector {
    /// Build the selector.
    ///
    /// # Errors
    ///
    /// Returns [`ReftError::Model`] if variable creation fails.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn new(
        embed_dim: usize,
        schedule: TemperatureSchedule,
        strategy: DiscretizationStrategy,
        use_attn_weights: bool,
        vb: VarBuilder<'_>,
    ) -> Result<Self> {
        Ok(Self {
            attention: ScaledDotProductAttention::new(embed_dim, vb.pp("selection_module"))?,
            selector: DiscreteTokenSelection::new(
                embed_dim,
                schedule,
                strategy,
                vb.pp("discrete_selector"),
            )?,
            use_attn_weights,
        })
    }

    /// Compute token weights from the base embedding sequence.
    ///
    /// # Shapes
    /// - `embeddings`: `[batch, seq, embed_dim]`
    /// - returns: `[batch, seq, 1]`
    ///
    /// # Errors
    ///
    /// Returns [`ReftError::Model`] on tensor operation failures.
    pub fn forward(&self, embeddings: &Tensor) -> Result<Tensor> {
        let (attended, pattern) = self.attention.forward(embeddings, embeddings, embeddings)?;
        if self.use_attn_weights {
            self.selector.forward_from_pattern(&pattern)
        } else {
            self.selector.forward(&attended)
        }
    }

    /// The discretizer, for scheduler integration.
    #[must_use]
    pub const fn selector(&self) -> &DiscreteTokenSelection {
        &self.selector
    }

    /// Switch between training and evaluation behavior.
    pub fn set_training(&self, training: bool) {
        self.selector.set_training(training);
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
    use candle_core::Device;
    use candle_nn::{VarBuilder, VarMap};

    fn embeddings(device: &Device) -> Tensor {
        let data: Vec<f32> = (0..2 * 5 * 8).map(|i| (i as f32 / 11.0).sin()).collect();
        Tensor::from_vec(data, (2, 5, 8), device).unwrap()
    }

    #[test]
    fn temperature_schedule_anneals_linearly() {
        let schedule = TemperatureSchedule::new(1.0, 0.1, 10);
        assert!((schedule.at(0) - 1.0).abs() < 1e-9);
        assert!((schedule.at(5) - 0.55).abs() < 1e-9);
        assert!((schedule.at(10) - 0.1).abs() < 1e-9);
        assert!((schedule.at(100) - 0.1).abs() < 1e-9);
    }

    #[test]
    fn attention_shapes_and_row_stochastic_pattern() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let attention = ScaledDotProductAttention::new(8, vb).unwrap();

        let x = embeddings(&device);
        let (attended, pattern) = attention.forward(&x, &x, &x).unwrap();
        assert_eq!(attended.dims(), &[2, 5, 8]);
        assert_eq!(pattern.dims(), &[2, 5, 5]);

        let rows: Vec<Vec<Vec<f32>>> = pattern.to_vec3().unwrap();
        for batch in &rows {
            for row in batch {
                let sum: f32 = row.iter().sum();
                assert!((sum - 1.0).abs() < 1e-5, "row sum {sum}");
            }
        }
    }

    #[test]
    fn eval_mode_produces_hard_weights() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let selector = TokenSelector::new(
            8,
            TemperatureSchedule::new(1.0, 0.1, 100),
            DiscretizationStrategy::BinaryConcrete,
            false,
            vb,
        )
        .unwrap();
        selector.set_training(false);

        let weights = selector.forward(&embeddings(&device)).unwrap();
        assert_eq!(weights.dims(), &[2, 5, 1]);
        let v: Vec<f32> = weights.flatten_all().unwrap().to_vec1().unwrap();
        assert!(v.iter().all(|w| *w == 0.0 || *w == 1.0));
    }

    #[test]
    fn training_mode_produces_soft_weights_in_unit_interval() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let selector = TokenSelector::new(
            8,
            TemperatureSchedule::new(1.0, 0.1, 100),
            DiscretizationStrategy::BinaryConcrete,
            false,
            vb,
        )
        .unwrap();
        selector.set_training(true);

        let weights = selector.forward(&embeddings(&device)).unwrap();
        let v: Vec<f32> = weights.flatten_all().unwrap().to_vec1().unwrap();
        assert!(v.iter().all(|w| (0.0..=1.0).contains(w)));
    }

    #[test]
    fn pattern_mode_matches_output_shape() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let selector = TokenSelector::new(
            8,
            TemperatureSchedule::new(1.0, 0.1, 100),
            DiscretizationStrategy::Sigmoid,
            true,
            vb,
        )
        .unwrap();

        let weights = selector.forward(&embeddings(&device)).unwrap();
        assert_eq!(weights.dims(), &[2, 5, 1]);
    }

    #[test]
    fn scheduler_step_advances_temperature() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let selection = DiscreteTokenSelection::new(
            8,
            TemperatureSchedule::new(2.0, 1.0, 2),
            DiscretizationStrategy::Sigmoid,
            vb,
        )
        .unwrap();

        assert!((selection.current_temperature() - 2.0).abs() < 1e-9);
        selection.advance_step();
        assert!((selection.current_temperature() - 1.5).abs() < 1e-9);
        selection.advance_step();
        assert!((selection.current_temperature() - 1.0).abs() < 1e-9);
        selection.set_step(0);
        assert!((selection.current_temperature() - 2.0).abs() < 1e-9);
    }
}
