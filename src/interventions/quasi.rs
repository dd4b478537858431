// SPDX-License-Identifier: MIT OR Apache-2.0

//! Quasi-projective ridge intervention.
//!
//! Computes a closed-form, per-batch ridge-regression projection of
//! hidden states onto a span selected dynamically from a learned
//! dictionary, then swaps the base's projection for the learned source's:
//!
//! 1. An "edit instruction" embedding sequence (from the subspace
//!    payload) is RMS-normalized at its last position and encoded into
//!    per-dictionary-element importance scores.
//! 2. Dictionary rows are selected per example (top-k / full / dynamic).
//! 3. For the normalized base and the normalized learned source, ridge
//!    coefficients are solved in closed form via a batched Cholesky
//!    factorization of the regularized Gram matrix — never a direct
//!    matrix inverse.  The regularization diagonal is derived from the
//!    importance scores by the configured parameterization.
//! 4. `output = base + (source_projection − base_projection)`: the
//!    orthogonal complement of the selected span is untouched.
//!
//! A sparsity penalty over the selected scores is cached per call for the
//! training loop; diagnostics are computed only in training mode when
//! enabled and never feed gradients.

use std::cell::Cell;

use candle_core::{D, DType, Module, Tensor};
use candle_nn::{Embedding, Linear, RmsNorm, VarBuilder};

use crate::config::{InterventionKind, RidgeConfig, RidgeParameterization, SelectionMechanism};
use crate::error::{ReftError, Result};
use crate::linalg;
use crate::subspace::{
    InterventionOutput, PayloadKey, QuasiDiagnostics, RidgeDiagnostics, SubspacePayload,
};

use super::Intervention;

// ---------------------------------------------------------------------------
// Dictionary storage
// ---------------------------------------------------------------------------

/// Dictionary storage, shaped by the selection mechanism.
enum Dictionary {
    /// Direct lookup table, `[dict_size, embed_dim]` (full / top-k).
    Table(Embedding),
    /// Linear map from the scoring vector to flattened per-example rows
    /// (dynamic).
    Dynamic(Linear),
}

// ---------------------------------------------------------------------------
// QuasiProjectiveIntervention
// ---------------------------------------------------------------------------

/// Closed-form ridge quasi-projection onto a learned dictionary span.
pub struct QuasiProjectiveIntervention {
    /// Full configuration (also consumed by checkpoint migration).
    config: RidgeConfig,
    /// Whether a penalty is computed (config value, forced off for
    /// dynamic selection).
    return_penalty: bool,
    /// Learned source projection, `embed_dim -> embed_dim`.
    learned_source: Linear,
    /// Edit-instruction encoder (linear; rectified on application).
    edit_encoder: Linear,
    /// Dictionary storage.
    dictionary: Dictionary,
    /// RMS norm over the edit-instruction embedding.
    input_layernorm: RmsNorm,
    /// RMS norm over the base hidden states.
    base_layernorm: RmsNorm,
    /// RMS norm over the learned source.
    source_layernorm: RmsNorm,
    /// Penalty cached by the most recent forward call.
    penalty: Cell<Option<f32>>,
    /// Training-mode flag (gates diagnostics).
    training: Cell<bool>,
}

impl QuasiProjectiveIntervention {
    /// Build from a ridge configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ReftError::Config`] for a zero-sized dictionary, an
    /// out-of-range `top_k_parameter`, a zero `scoring_dimension` in
    /// dynamic mode, or the explicitly unimplemented `topk_ste`
    /// parameterization.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn new(config: &RidgeConfig, vb: VarBuilder<'_>) -> Result<Self> {
        if config.dict_size == 0 || config.embed_dim == 0 {
            return Err(ReftError::Config(
                "dict_size and embed_dim must be positive".into(),
            ));
        }
        if config.ridge_parameterization == RidgeParameterization::TopkSte {
            return Err(ReftError::Config(
                "ridge_parameterization 'topk_ste' is an explicitly unimplemented mode".into(),
            ));
        }
        if config.selection_mechanism == SelectionMechanism::TopK
            && (config.top_k_parameter == 0 || config.top_k_parameter > config.dict_size)
        {
            return Err(ReftError::Config(format!(
                "top_k_parameter must be in 1..={}, got {}",
                config.dict_size, config.top_k_parameter
            )));
        }
        if config.selection_mechanism == SelectionMechanism::Dynamic && config.scoring_dimension == 0
        {
            return Err(ReftError::Config(
                "scoring_dimension must be positive for dynamic selection".into(),
            ));
        }

        let encoder_out = if config.selection_mechanism == SelectionMechanism::Dynamic {
            config.scoring_dimension
        } else {
            config.dict_size
        };
        let edit_encoder = candle_nn::linear(
            config.embed_dim,
            encoder_out,
            vb.pp("edit_instruction_encodings"),
        )?;
        let learned_source =
            candle_nn::linear(config.embed_dim, config.embed_dim, vb.pp("learned_source"))?;

        let dictionary = match config.selection_mechanism {
            SelectionMechanism::Full | SelectionMechanism::TopK => Dictionary::Table(
                candle_nn::embedding(config.dict_size, config.embed_dim, vb.pp("dictionary"))?,
            ),
            SelectionMechanism::Dynamic => Dictionary::Dynamic(candle_nn::linear_no_bias(
                config.scoring_dimension,
                config.dict_size * config.embed_dim,
                vb.pp("dictionary"),
            )?),
        };

        let input_layernorm = candle_nn::rms_norm(config.embed_dim, 1e-5, vb.pp("input_layernorm"))?;
        let base_layernorm = candle_nn::rms_norm(config.embed_dim, 1e-5, vb.pp("base_layernorm"))?;
        let source_layernorm =
            candle_nn::rms_norm(config.embed_dim, 1e-5, vb.pp("source_layernorm"))?;

        // The penalty is meaningless when the span itself is an
        // unconstrained function of the scores.
        let return_penalty =
            config.return_penalty && config.selection_mechanism != SelectionMechanism::Dynamic;

        Ok(Self {
            config: config.clone(),
            return_penalty,
            learned_source,
            edit_encoder,
            dictionary,
            input_layernorm,
            base_layernorm,
            source_layernorm,
            penalty: Cell::new(None),
            training: Cell::new(false),
        })
    }

    /// The ridge configuration this intervention was built from.
    #[must_use]
    pub const fn config(&self) -> &RidgeConfig {
        &self.config
    }

    // --- Selection -------------------------------------------------------

    /// Select dictionary rows and their importance scores per example.
    ///
    /// # Shapes
    /// - `scores`: `[batch, dict_size]` (full/topk) or
    ///   `[batch, scoring_dimension]` (dynamic)
    /// - returns: `(selected [batch, k, embed_dim], values)` where
    ///   `values` is the full score vector for full/dynamic and exactly
    ///   `top_k_parameter` entries for top-k
    fn select_dictionary(&self, scores: &Tensor) -> Result<(Tensor, Tensor)> {
        let (batch, _width) = scores.dims2()?;
        match (&self.dictionary, self.config.selection_mechanism) {
            (Dictionary::Table(table), SelectionMechanism::TopK) => {
                let sorted = scores.arg_sort_last_dim(false)?;
                let indices = sorted
                    .narrow(D::Minus1, 0, self.config.top_k_parameter)?
                    .contiguous()?;
                let values = scores.gather(&indices, D::Minus1)?;
                let selected = table.forward(&indices)?;
                Ok((selected, values))
            }
            (Dictionary::Table(table), SelectionMechanism::Full) => {
                let selected = table
                    .embeddings()
                    .unsqueeze(0)?
                    .expand((batch, self.config.dict_size, self.config.embed_dim))?
                    .contiguous()?;
                Ok((selected, scores.clone()))
            }
            (Dictionary::Dynamic(map), SelectionMechanism::Dynamic) => {
                let selected = map.forward(scores)?.reshape((
                    batch,
                    self.config.dict_size,
                    self.config.embed_dim,
                ))?;
                Ok((selected, scores.clone()))
            }
            // Construction pairs storage with mechanism; reaching here
            // means the invariant was broken.
            _ => Err(ReftError::Config(
                "dictionary storage does not match selection mechanism".into(),
            )),
        }
    }

    // --- Ridge solve -----------------------------------------------------

    /// Regularization diagonal from importance scores, or `None` for the
    /// flat `lambda * I` path.
    fn denominator_scores(&self, values: &Tensor) -> Result<Option<Tensor>> {
        if self.config.selection_mechanism == SelectionMechanism::Dynamic {
            return Ok(None);
        }
        match self.config.ridge_parameterization {
            RidgeParameterization::InvAlpha => {
                let shifted = (values + self.config.epsilon)?;
                Ok(Some(shifted.powf(self.config.importance_power)?))
            }
            RidgeParameterization::Sigmoid => Ok(Some(candle_nn::ops::sigmoid(values)?)),
            RidgeParameterization::Softmax => {
                Ok(Some(candle_nn::ops::softmax_last_dim(values)?))
            }
            RidgeParameterization::Fixed | RidgeParameterization::TopkSte => Ok(None),
        }
    }

    /// Closed-form ridge projection of `targets` onto the span of `rows`.
    ///
    /// # Shapes
    /// - `rows`: `[batch, k, embed_dim]` — selected dictionary rows
    /// - `targets`: `[batch, seq, embed_dim]`
    /// - `values`: importance scores for the regularization diagonal
    /// - returns: projections `[batch, seq, embed_dim]` in f32
    fn ridge_projection(
        &self,
        rows: &Tensor,
        targets: &Tensor,
        values: &Tensor,
    ) -> Result<(Tensor, RidgeDiagnostics)> {
        // PROMOTE: the solve runs in f32 regardless of module dtype
        let x = rows.to_dtype(DType::F32)?;
        let y = targets.to_dtype(DType::F32)?;
        let (_, k, _) = x.dims3()?;

        // CONTIGUOUS: transpose produces non-unit strides; matmul requires contiguous layout
        let xt = x.t()?.contiguous()?;
        let gram = x.matmul(&xt)?;

        let denominator = self.denominator_scores(&values.to_dtype(DType::F32)?)?;
        let eye = linalg::identity(k, DType::F32, x.device())?;
        let regularized = match &denominator {
            Some(diag) => {
                let embedded = diag.unsqueeze(D::Minus1)?.broadcast_mul(&eye)?;
                (gram + embedded)?
            }
            None => gram.broadcast_add(&(eye * self.config.lambda_parameter)?)?,
        };

        let yt = y.t()?.contiguous()?;
        let coeffs = if self.config.hat_matrix {
            // Solve for the hat matrix first; coefficients follow as
            // hat @ Y.
            linalg::batched_cholesky_solve(&regularized, &x)?
        } else {
            let xty = x.matmul(&yt)?;
            linalg::batched_cholesky_solve(&regularized, &xty)?
        };

        let mut diagnostics = RidgeDiagnostics::default();
        let collect_metrics = self.config.compute_metrics && self.training.get();
        if collect_metrics {
            if let Some(diag) = &denominator {
                let flat: Vec<f32> = diag.flatten_all()?.to_vec1()?;
                diagnostics.denominator_mean = Some(mean(&flat));
                diagnostics.denominator_min = flat.iter().copied().reduce(f32::min);
                diagnostics.denominator_max = flat.iter().copied().reduce(f32::max);
            }
            diagnostics.importance_score_norm = row_norm_mean(values)?;
            if self.config.hat_matrix {
                // Effective dimensionality: mean trace of X beta'^T.
                let hat = x.matmul(&coeffs.t()?.contiguous()?)?;
                diagnostics.effective_dim = Some(batched_trace_mean(&hat)?);
            }
        }

        let coeffs = if self.config.hat_matrix {
            coeffs.matmul(&yt)?
        } else {
            coeffs
        };

        // Projections: coeffs^T @ X.
        let projections = coeffs.t()?.contiguous()?.matmul(&x)?;
        Ok((projections, diagnostics))
    }

    // --- Penalty ---------------------------------------------------------

    /// Sparsity penalty over the selected scores per the active
    /// parameterization.
    fn compute_penalty(&self, values: &Tensor) -> Result<Option<f32>> {
        let lambda = self.config.lambda_parameter;
        let transformed = match self.config.ridge_parameterization {
            RidgeParameterization::InvAlpha => values.powf(self.config.importance_power)?,
            RidgeParameterization::Sigmoid => candle_nn::ops::sigmoid(values)?,
            RidgeParameterization::Softmax => candle_nn::ops::softmax_last_dim(values)?,
            RidgeParameterization::Fixed | RidgeParameterization::TopkSte => return Ok(None),
        };
        let ratio = ((transformed + lambda)?.recip()? * lambda)?;
        Ok(Some(scalar_mean(&ratio)?))
    }
}

impl Intervention for QuasiProjectiveIntervention {
    fn forward(
        &self,
        base: &Tensor,
        _source: Option<&Tensor>,
        subspaces: Option<&SubspacePayload>,
    ) -> Result<InterventionOutput> {
        // The edit instruction is non-negotiable: fail before any tensor
        // computation.
        let hidden_states = subspaces
            .ok_or_else(|| {
                ReftError::MissingPayload(
                    "quasi-projective intervention requires a subspace payload".into(),
                )
            })?
            .require_hidden_states("quasi-projective intervention")?;

        let module_dtype = self.learned_source.weight().dtype();
        let (_, instruction_len, _) = hidden_states.dims3()?;
        if instruction_len == 0 {
            return Err(ReftError::Shape(
                "hidden_states payload has an empty instruction sequence".into(),
            ));
        }

        // Encode the last instruction position into importance scores.
        let last = hidden_states
            .to_dtype(module_dtype)?
            .narrow(1, instruction_len - 1, 1)?;
        let normalized_instruction = self.input_layernorm.forward(&last)?.squeeze(1)?;
        let scores = self.edit_encoder.forward(&normalized_instruction)?.relu()?;

        // Normalize base and learned source prior to regression.
        let cast = base.to_dtype(module_dtype)?;
        let normalized_base = self.base_layernorm.forward(&cast)?;
        let learned = self.learned_source.forward(&cast)?;
        let normalized_source = self.source_layernorm.forward(&learned)?;

        let (selected, values) = self.select_dictionary(&scores)?;

        let (base_projection, base_diag) =
            self.ridge_projection(&selected, &normalized_base, &values)?;
        let (source_projection, source_diag) =
            self.ridge_projection(&selected, &normalized_source, &values)?;

        let interchange = (&source_projection - &base_projection)?;
        let output = (cast.to_dtype(DType::F32)? + &interchange)?.to_dtype(base.dtype())?;

        let penalty = if self.return_penalty {
            self.compute_penalty(&values)?
        } else {
            None
        };
        if self.return_penalty {
            self.penalty.set(penalty);
        }

        let diagnostics = if self.config.compute_metrics && self.training.get() {
            Some(QuasiDiagnostics {
                base: base_diag,
                source: source_diag,
                base_interchange_norm: tensor_norm(&base_projection)?,
                source_interchange_norm: tensor_norm(&source_projection)?,
                intervention_norm: tensor_norm(&interchange)?,
                dictionary_norm: tensor_norm(&values)?,
                basis_rank_mean: mean_rank(&selected)?,
                angular_change: angular_change(base, &output)?,
                lambda_penalty: penalty,
            })
        } else {
            None
        };

        Ok(InterventionOutput {
            output,
            penalty,
            diagnostics,
        })
    }

    fn kind(&self) -> InterventionKind {
        InterventionKind::QuasiProjective
    }

    fn required_payload(&self) -> &'static [PayloadKey] {
        &[PayloadKey::HiddenStates]
    }

    fn set_training(&self, training: bool) {
        self.training.set(training);
    }

    fn penalty(&self) -> f32 {
        self.penalty.get().unwrap_or(0.0)
    }

    fn zero_penalty(&self) {
        self.penalty.set(None);
    }
}

// ---------------------------------------------------------------------------
// Diagnostic helpers (detached; never feed gradients)
// ---------------------------------------------------------------------------

/// Mean of a slice, 0 if empty.
#[allow(clippy::cast_precision_loss, clippy::as_conversions)]
fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f32>() / values.len() as f32
    }
}

/// Scalar mean of a tensor.
fn scalar_mean(t: &Tensor) -> Result<f32> {
    Ok(t.to_dtype(DType::F32)?.mean_all()?.to_scalar::<f32>()?)
}

/// Frobenius norm of a tensor.
fn tensor_norm(t: &Tensor) -> Result<f32> {
    Ok(t.to_dtype(DType::F32)?
        .sqr()?
        .sum_all()?
        .sqrt()?
        .to_scalar::<f32>()?)
}

/// Mean L2 norm of the last-dim rows of a 2D tensor.
fn row_norm_mean(t: &Tensor) -> Result<f32> {
    let norms = t.to_dtype(DType::F32)?.sqr()?.sum(D::Minus1)?.sqrt()?;
    scalar_mean(&norms)
}

/// Mean trace of a batch of square matrices.
#[allow(clippy::cast_precision_loss, clippy::as_conversions)]
fn batched_trace_mean(t: &Tensor) -> Result<f32> {
    let mats: Vec<Vec<Vec<f32>>> = t.to_dtype(DType::F32)?.to_vec3()?;
    let mut traces = Vec::with_capacity(mats.len());
    for mat in &mats {
        let trace: f32 = mat
            .iter()
            .enumerate()
            .filter_map(|(i, row)| row.get(i))
            .sum();
        traces.push(trace);
    }
    Ok(mean(&traces))
}

/// Mean numerical rank of the selected dictionary across the batch.
#[allow(clippy::cast_precision_loss, clippy::as_conversions)]
fn mean_rank(selected: &Tensor) -> Result<f32> {
    let ranks = linalg::batched_matrix_rank(selected, 1e-5)?;
    let ranks_f: Vec<f32> = ranks.into_iter().map(|r| r as f32).collect();
    Ok(mean(&ranks_f))
}

/// Mean angular change (radians) between base and output hidden states,
/// via inverse cosine of the clamped per-position cosine similarity.
fn angular_change(base: &Tensor, output: &Tensor) -> Result<f32> {
    let a = base.to_dtype(DType::F32)?;
    let b = output.to_dtype(DType::F32)?;
    let dot = (&a * &b)?.sum(D::Minus1)?;
    let norm_a = a.sqr()?.sum(D::Minus1)?.sqrt()?;
    let norm_b = b.sqr()?.sum(D::Minus1)?.sqrt()?;
    let denom = (norm_a * norm_b)?.maximum(1e-12)?;
    let cosine: Vec<f32> = (dot / denom)?.flatten_all()?.to_vec1()?;
    let angles: Vec<f32> = cosine
        .into_iter()
        .map(|c| c.clamp(-1.0 + 1e-6, 1.0 - 1e-6).acos())
        .collect();
    Ok(mean(&angles))
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
    use candle_nn::VarMap;

    const EMBED: usize = 16;
    const DICT: usize = 8;
    const TOP_K: usize = 3;

    fn build(config: &RidgeConfig) -> QuasiProjectiveIntervention {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        QuasiProjectiveIntervention::new(config, vb).unwrap()
    }

    fn base_batch(device: &Device) -> Tensor {
        let data: Vec<f32> = (0..2 * 4 * EMBED)
            .map(|i| (i as f32 / 9.0).sin() * 0.8)
            .collect();
        Tensor::from_vec(data, (2, 4, EMBED), device).unwrap()
    }

    fn payload(device: &Device) -> SubspacePayload {
        let data: Vec<f32> = (0..2 * 3 * EMBED)
            .map(|i| (i as f32 / 5.0).cos() * 0.6)
            .collect();
        let hs = Tensor::from_vec(data, (2, 3, EMBED), device).unwrap();
        SubspacePayload::new().with_hidden_states(hs)
    }

    #[test]
    fn missing_payload_is_hard_error() {
        let intervention = build(&RidgeConfig::new(EMBED, DICT, TOP_K, 1.0));
        let base = base_batch(&Device::Cpu);

        let no_payload = intervention.forward(&base, None, None);
        assert!(matches!(no_payload, Err(ReftError::MissingPayload(_))));

        let empty = SubspacePayload::new();
        let empty_payload = intervention.forward(&base, None, Some(&empty));
        assert!(matches!(empty_payload, Err(ReftError::MissingPayload(_))));
    }

    #[test]
    fn topk_ste_is_rejected_at_construction() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = RidgeConfig::new(EMBED, DICT, TOP_K, 1.0)
            .with_parameterization(RidgeParameterization::TopkSte);
        assert!(matches!(
            QuasiProjectiveIntervention::new(&config, vb),
            Err(ReftError::Config(_))
        ));
    }

    #[test]
    fn top_k_out_of_range_is_rejected() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = RidgeConfig::new(EMBED, DICT, DICT + 1, 1.0)
            .with_selection(SelectionMechanism::TopK);
        assert!(matches!(
            QuasiProjectiveIntervention::new(&config, vb),
            Err(ReftError::Config(_))
        ));
    }

    #[test]
    fn full_selection_keeps_entire_score_vector() {
        let intervention = build(&RidgeConfig::new(EMBED, DICT, TOP_K, 1.0));
        let scores_data: Vec<f32> = (0..2 * DICT).map(|i| i as f32).collect();
        let scores = Tensor::from_vec(scores_data, (2, DICT), &Device::Cpu).unwrap();

        let (selected, values) = intervention.select_dictionary(&scores).unwrap();
        assert_eq!(values.dims(), &[2, DICT]);
        assert_eq!(selected.dims(), &[2, DICT, EMBED]);

        // No truncation: values equal the raw score vector.
        let raw: Vec<f32> = scores.flatten_all().unwrap().to_vec1().unwrap();
        let got: Vec<f32> = values.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(raw, got);
    }

    #[test]
    fn topk_selection_picks_exactly_k_largest() {
        let config =
            RidgeConfig::new(EMBED, DICT, TOP_K, 1.0).with_selection(SelectionMechanism::TopK);
        let intervention = build(&config);

        let scores_data: Vec<f32> = vec![
            0.1, 5.0, 0.2, 3.0, 0.3, 4.0, 0.0, 0.4, // example 0
            9.0, 0.0, 8.0, 0.1, 7.0, 0.2, 0.3, 0.4, // example 1
        ];
        let scores = Tensor::from_vec(scores_data, (2, DICT), &Device::Cpu).unwrap();

        let (selected, values) = intervention.select_dictionary(&scores).unwrap();
        assert_eq!(values.dims(), &[2, TOP_K]);
        assert_eq!(selected.dims(), &[2, TOP_K, EMBED]);

        let v: Vec<Vec<f32>> = values.to_vec2().unwrap();
        assert_eq!(v[0], vec![5.0, 4.0, 3.0]);
        assert_eq!(v[1], vec![9.0, 8.0, 7.0]);
    }

    #[test]
    fn forward_preserves_shape_and_dtype() {
        let intervention = build(&RidgeConfig::new(EMBED, DICT, TOP_K, 1.0));
        let device = Device::Cpu;
        let base = base_batch(&device);

        let out = intervention
            .forward(&base, None, Some(&payload(&device)))
            .unwrap();
        assert_eq!(out.output.dims(), base.dims());
        assert_eq!(out.output.dtype(), base.dtype());
    }

    #[test]
    fn penalty_accessor_reset_is_idempotent() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let intervention =
            QuasiProjectiveIntervention::new(&RidgeConfig::new(EMBED, DICT, TOP_K, 1.0), vb)
                .unwrap();
        // Pin the encoder bias positive so the selected scores (and the
        // penalty) are strictly positive.
        varmap
            .data()
            .lock()
            .unwrap()
            .get("edit_instruction_encodings.bias")
            .unwrap()
            .set(&Tensor::ones(DICT, DType::F32, &device).unwrap())
            .unwrap();
        let base = base_batch(&device);

        assert!((intervention.penalty() - 0.0).abs() < f32::EPSILON);

        let out = intervention
            .forward(&base, None, Some(&payload(&device)))
            .unwrap();
        assert!(out.penalty.is_some());
        assert!(intervention.penalty() > 0.0);

        intervention.zero_penalty();
        assert!((intervention.penalty() - 0.0).abs() < f32::EPSILON);
        // Stays zero until the next forward call repopulates it.
        assert!((intervention.penalty() - 0.0).abs() < f32::EPSILON);

        intervention
            .forward(&base, None, Some(&payload(&device)))
            .unwrap();
        assert!(intervention.penalty() > 0.0);
    }

    #[test]
    fn hat_and_plain_paths_agree_on_shared_parameters() {
        // The hat-matrix solve changes the numerical path, not the
        // output semantics.
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let plain =
            QuasiProjectiveIntervention::new(&RidgeConfig::new(EMBED, DICT, TOP_K, 1.0), vb.clone())
                .unwrap();
        // Same VarBuilder prefix: the hat module reuses the exact same
        // variables, so the two paths solve the same system.
        let hat = QuasiProjectiveIntervention::new(
            &RidgeConfig::new(EMBED, DICT, TOP_K, 1.0).with_hat_matrix(true),
            vb,
        )
        .unwrap();

        let base = base_batch(&device);
        let p = payload(&device);
        let a = plain.forward(&base, None, Some(&p)).unwrap();
        let b = hat.forward(&base, None, Some(&p)).unwrap();

        let av: Vec<f32> = a.output.flatten_all().unwrap().to_vec1().unwrap();
        let bv: Vec<f32> = b.output.flatten_all().unwrap().to_vec1().unwrap();
        for (x, y) in av.iter().zip(bv.iter()) {
            assert!((x - y).abs() < 1e-3, "hat {y} vs plain {x}");
        }
    }

    #[test]
    fn dynamic_selection_disables_penalty() {
        let config = RidgeConfig::new(EMBED, DICT, TOP_K, 1.0)
            .with_selection(SelectionMechanism::Dynamic)
            .with_scoring_dimension(2);
        let intervention = build(&config);
        let device = Device::Cpu;
        let base = base_batch(&device);

        let out = intervention
            .forward(&base, None, Some(&payload(&device)))
            .unwrap();
        assert!(out.penalty.is_none());
        assert!((intervention.penalty() - 0.0).abs() < f32::EPSILON);
        assert_eq!(out.output.dims(), base.dims());
    }

    #[test]
    fn diagnostics_only_in_training_with_metrics() {
        let config = RidgeConfig::new(EMBED, DICT, TOP_K, 1.0).with_compute_metrics(true);
        let intervention = build(&config);
        let device = Device::Cpu;
        let base = base_batch(&device);
        let p = payload(&device);

        // Eval mode: metrics stay off even when configured on.
        let out = intervention.forward(&base, None, Some(&p)).unwrap();
        assert!(out.diagnostics.is_none());

        intervention.set_training(true);
        let out = intervention.forward(&base, None, Some(&p)).unwrap();
        let diagnostics = out.diagnostics.unwrap();
        assert!(diagnostics.base.denominator_mean.is_some());
        assert!(diagnostics.basis_rank_mean > 0.0);
        assert!(diagnostics.angular_change >= 0.0);
    }

    #[test]
    fn sigmoid_and_softmax_parameterizations_run() {
        let device = Device::Cpu;
        let base = base_batch(&device);
        let p = payload(&device);
        for parameterization in [
            RidgeParameterization::Sigmoid,
            RidgeParameterization::Softmax,
            RidgeParameterization::Fixed,
        ] {
            let config = RidgeConfig::new(EMBED, DICT, TOP_K, 1.0)
                .with_parameterization(parameterization);
            let intervention = build(&config);
            let out = intervention.forward(&base, None, Some(&p)).unwrap();
            let v: Vec<f32> = out.output.flatten_all().unwrap().to_vec1().unwrap();
            assert!(v.iter().all(|x| x.is_finite()), "{parameterization} produced non-finite output");
            // The flat parameterization computes no penalty.
            if parameterization == RidgeParameterization::Fixed {
                assert!(out.penalty.is_none());
            } else {
                assert!(out.penalty.is_some());
            }
        }
    }
}
