// SPDX-License-Identifier: MIT OR Apache-2.0

//! Intervention configuration and JSON parsing.
//!
//! [`InterventionConfig`] captures the configuration axes shared by the
//! linear-intervention family; [`RidgeConfig`] adds the knobs of the
//! quasi-projective ridge intervention.  Both can be built
//! programmatically via setters or parsed from a `serde_json::Value`
//! (e.g., an experiment config file).
//!
//! # Usage
//!
//! ```
//! use candle_reft::{ActFn, InterventionConfig};
//!
//! let config = InterventionConfig::new(768)
//!     .with_low_rank_dimension(4)
//!     .with_act_fn(ActFn::Linear)
//!     .with_dropout(0.05);
//! assert_eq!(config.embed_dim, 768);
//! ```

use std::fmt;

use serde_json::Value;

use crate::error::{ReftError, Result};

// ---------------------------------------------------------------------------
// Configuration enums
// ---------------------------------------------------------------------------

/// The intervention variant to construct.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterventionKind {
    /// `LoReFT(h) = h + R^T(f(Wh + b) - Rh)` — rotated low-rank edit.
    Loreft,
    /// LoReFT with a final elementwise scale by per-call token weights.
    TokenSelectiveLoreft,
    /// `NoReFT(h) = h + W2^T(f(W1 h + b) - W2 h)` — unconstrained projection.
    Noreft,
    /// `ConsReFT(h) = h + R^T(b - Rh)` — constant learned source.
    Consreft,
    /// `LobiReFT(h) = h + R^T b` — learned bias only.
    Lobireft,
    /// `DiReFT(h) = h + R^T f(Wh + b)` — no subtraction term.
    Direft,
    /// `NodiReFT(h) = h + W2^T f(W1 h + b)` — no rotation, no subtraction.
    Nodireft,
    /// Closed-form ridge quasi-projection onto a learned dictionary span.
    QuasiProjective,
}

impl fmt::Display for InterventionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Loreft => write!(f, "loreft"),
            Self::TokenSelectiveLoreft => write!(f, "token_selective_loreft"),
            Self::Noreft => write!(f, "noreft"),
            Self::Consreft => write!(f, "consreft"),
            Self::Lobireft => write!(f, "lobireft"),
            Self::Direft => write!(f, "direft"),
            Self::Nodireft => write!(f, "nodireft"),
            Self::QuasiProjective => write!(f, "quasi_projective"),
        }
    }
}

/// Activation applied to the learned-source projection.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActFn {
    /// Identity (the default; matches `act_fn: None`).
    #[default]
    Linear,
    /// Rectified linear unit.
    Relu,
    /// Gaussian error linear unit (erf variant).
    Gelu,
    /// Sigmoid linear unit.
    Silu,
}

impl fmt::Display for ActFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linear => write!(f, "linear"),
            Self::Relu => write!(f, "relu"),
            Self::Gelu => write!(f, "gelu"),
            Self::Silu => write!(f, "silu"),
        }
    }
}

/// How raw importance scores become the ridge-diagonal weighting.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RidgeParameterization {
    /// `(score + epsilon)^importance_power` — higher-scored dictionary
    /// elements receive less regularization when the power is negative.
    #[default]
    InvAlpha,
    /// Straight-through-estimator top-k.  Accepted as a name but
    /// explicitly unimplemented; construction fails.
    TopkSte,
    /// `sigmoid(score)`.
    Sigmoid,
    /// `softmax(score)` over the selected elements.
    Softmax,
    /// Flat `lambda * I` regularization, ignoring scores (the `none`
    /// parameterization).
    Fixed,
}

impl fmt::Display for RidgeParameterization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvAlpha => write!(f, "inv_alpha"),
            Self::TopkSte => write!(f, "topk_ste"),
            Self::Sigmoid => write!(f, "sigmoid"),
            Self::Softmax => write!(f, "softmax"),
            Self::Fixed => write!(f, "none"),
        }
    }
}

impl RidgeParameterization {
    /// Parse a parameterization name.
    ///
    /// # Errors
    ///
    /// Returns [`ReftError::Config`] for unknown names.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "inv_alpha" => Ok(Self::InvAlpha),
            "topk_ste" => Ok(Self::TopkSte),
            "sigmoid" => Ok(Self::Sigmoid),
            "softmax" => Ok(Self::Softmax),
            "none" => Ok(Self::Fixed),
            other => Err(ReftError::Config(format!(
                "invalid ridge_parameterization: '{other}'"
            ))),
        }
    }
}

/// How dictionary elements are chosen per example.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionMechanism {
    /// Use every dictionary row; scores only weight the regularizer.
    #[default]
    Full,
    /// Select the `top_k_parameter` highest-scored rows per example.
    TopK,
    /// Compute rows as a linear function of the scoring vector, reshaped
    /// to `(dict_size, embed_dim)` per example.
    Dynamic,
}

impl fmt::Display for SelectionMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::TopK => write!(f, "topk"),
            Self::Dynamic => write!(f, "dynamic"),
        }
    }
}

impl SelectionMechanism {
    /// Parse a selection-mechanism name.
    ///
    /// # Errors
    ///
    /// Returns [`ReftError::Config`] for unknown names.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "full" => Ok(Self::Full),
            "topk" => Ok(Self::TopK),
            "dynamic" => Ok(Self::Dynamic),
            other => Err(ReftError::Config(format!(
                "invalid selection_mechanism: '{other}'"
            ))),
        }
    }
}

/// Composition mode for multiple interventions in one forward pass.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterventionMode {
    /// All interventions read the same un-intervened sources.
    #[default]
    Parallel,
    /// Each intervention sees the output of the previous one.
    Serial,
}

impl fmt::Display for InterventionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parallel => write!(f, "parallel"),
            Self::Serial => write!(f, "serial"),
        }
    }
}

// ---------------------------------------------------------------------------
// InterventionConfig
// ---------------------------------------------------------------------------

/// Configuration for the linear-intervention family.
///
/// `embed_dim` is always required.  `low_rank_dimension` is required by
/// every variant except the quasi-projective one (which uses
/// [`RidgeConfig`] instead); its absence is a configuration error
/// detected at construction, not at forward time.
#[derive(Debug, Clone)]
pub struct InterventionConfig {
    /// Hidden dimension of the host model (`d_model`).
    pub embed_dim: usize,
    /// Rank of the low-rank subspace.
    pub low_rank_dimension: Option<usize>,
    /// Activation applied to the learned-source projection.
    pub act_fn: ActFn,
    /// Train-time dropout probability applied as the final stage.
    pub dropout: f32,
    /// Whether the projection layer carries a bias (NoReFT/NodiReFT).
    pub add_bias: bool,
    /// Ridge-intervention knobs; required for the quasi-projective kind.
    pub ridge: Option<RidgeConfig>,
}

impl InterventionConfig {
    /// Create a configuration with defaults for the given embed dim.
    #[must_use]
    pub const fn new(embed_dim: usize) -> Self {
        Self {
            embed_dim,
            low_rank_dimension: None,
            act_fn: ActFn::Linear,
            dropout: 0.0,
            add_bias: false,
            ridge: None,
        }
    }

    /// Set the low-rank dimension.
    #[must_use]
    pub const fn with_low_rank_dimension(mut self, rank: usize) -> Self {
        self.low_rank_dimension = Some(rank);
        self
    }

    /// Set the activation function.
    #[must_use]
    pub const fn with_act_fn(mut self, act_fn: ActFn) -> Self {
        self.act_fn = act_fn;
        self
    }

    /// Set the dropout probability.
    #[must_use]
    pub const fn with_dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    /// Set whether the projection layer carries a bias.
    #[must_use]
    pub const fn with_add_bias(mut self, add_bias: bool) -> Self {
        self.add_bias = add_bias;
        self
    }

    /// Attach ridge-intervention configuration.
    #[must_use]
    pub fn with_ridge(mut self, ridge: RidgeConfig) -> Self {
        self.ridge = Some(ridge);
        self
    }

    /// The low-rank dimension, or a configuration error if unset.
    ///
    /// # Errors
    ///
    /// Returns [`ReftError::Config`] when `low_rank_dimension` is absent.
    pub fn require_low_rank_dimension(&self) -> Result<usize> {
        self.low_rank_dimension.ok_or_else(|| {
            ReftError::Config("missing required key 'low_rank_dimension'".into())
        })
    }

    /// Parse a configuration from a JSON value.
    ///
    /// Required: `embed_dim`.  Optional: `low_rank_dimension`, `act_fn`,
    /// `dropout`, `add_bias`, and a nested `ridge` object parsed by
    /// [`RidgeConfig::from_json`].
    ///
    /// # Errors
    ///
    /// Returns [`ReftError::Config`] if required fields are missing or an
    /// enumerated value is invalid.
    pub fn from_json(config: &Value) -> Result<Self> {
        let act_fn = match config.get("act_fn").and_then(Value::as_str) {
            None | Some("linear") => ActFn::Linear,
            Some("relu") => ActFn::Relu,
            Some("gelu") => ActFn::Gelu,
            Some("silu") => ActFn::Silu,
            Some(other) => {
                return Err(ReftError::Config(format!("invalid act_fn: '{other}'")));
            }
        };

        let ridge = match config.get("ridge") {
            Some(value) => Some(RidgeConfig::from_json(get_usize(config, "embed_dim")?, value)?),
            None => None,
        };

        Ok(Self {
            embed_dim: get_usize(config, "embed_dim")?,
            low_rank_dimension: get_optional_usize(config, "low_rank_dimension"),
            act_fn,
            dropout: get_f32_or(config, "dropout", 0.0),
            add_bias: get_bool_or(config, "add_bias", false),
            ridge,
        })
    }
}

// ---------------------------------------------------------------------------
// RidgeConfig
// ---------------------------------------------------------------------------

/// Configuration for the quasi-projective ridge intervention.
///
/// `dict_size`, `top_k_parameter`, and `lambda_parameter` are required;
/// everything else has the documented default.
#[derive(Debug, Clone)]
pub struct RidgeConfig {
    /// Hidden dimension of the host model.
    pub embed_dim: usize,
    /// Number of dictionary elements.
    pub dict_size: usize,
    /// Number of rows selected in top-k mode.
    pub top_k_parameter: usize,
    /// Ridge regularization strength.
    pub lambda_parameter: f64,
    /// Numerical floor added before exponentiation.
    pub epsilon: f64,
    /// Exponent applied to importance scores for the ridge diagonal.
    /// Negative values give higher-scored elements less regularization.
    pub importance_power: f64,
    /// Whether a sparsity penalty is computed and exposed.  Forced off
    /// for dynamic selection.
    pub return_penalty: bool,
    /// How raw scores become the ridge-diagonal weighting.
    pub ridge_parameterization: RidgeParameterization,
    /// How dictionary elements are chosen per example.
    pub selection_mechanism: SelectionMechanism,
    /// Width of the scoring head when selection is dynamic.
    pub scoring_dimension: usize,
    /// Solve for the projection (hat) matrix instead of coefficients.
    /// Changes the numerical path, not the output semantics.
    pub hat_matrix: bool,
    /// Compute diagnostic statistics (training mode only).
    pub compute_metrics: bool,
}

impl RidgeConfig {
    /// Create a configuration with defaults for the required keys.
    #[must_use]
    pub const fn new(
        embed_dim: usize,
        dict_size: usize,
        top_k_parameter: usize,
        lambda_parameter: f64,
    ) -> Self {
        Self {
            embed_dim,
            dict_size,
            top_k_parameter,
            lambda_parameter,
            epsilon: 1e-6,
            importance_power: -2.0,
            return_penalty: true,
            ridge_parameterization: RidgeParameterization::InvAlpha,
            selection_mechanism: SelectionMechanism::Full,
            scoring_dimension: 1,
            hat_matrix: false,
            compute_metrics: false,
        }
    }

    /// Set the ridge parameterization.
    #[must_use]
    pub const fn with_parameterization(mut self, p: RidgeParameterization) -> Self {
        self.ridge_parameterization = p;
        self
    }

    /// Set the selection mechanism.
    #[must_use]
    pub const fn with_selection(mut self, s: SelectionMechanism) -> Self {
        self.selection_mechanism = s;
        self
    }

    /// Set the scoring dimension (dynamic selection).
    #[must_use]
    pub const fn with_scoring_dimension(mut self, d: usize) -> Self {
        self.scoring_dimension = d;
        self
    }

    /// Enable or disable the penalty term.
    #[must_use]
    pub const fn with_return_penalty(mut self, enabled: bool) -> Self {
        self.return_penalty = enabled;
        self
    }

    /// Enable the hat-matrix solve path.
    #[must_use]
    pub const fn with_hat_matrix(mut self, enabled: bool) -> Self {
        self.hat_matrix = enabled;
        self
    }

    /// Enable diagnostic metrics (training mode only).
    #[must_use]
    pub const fn with_compute_metrics(mut self, enabled: bool) -> Self {
        self.compute_metrics = enabled;
        self
    }

    /// Set the importance-power exponent.
    #[must_use]
    pub const fn with_importance_power(mut self, power: f64) -> Self {
        self.importance_power = power;
        self
    }

    /// Parse a ridge configuration from a JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`ReftError::Config`] if `dict_size`, `top_k_parameter`,
    /// or `lambda_parameter` are missing, or an enumerated value is
    /// invalid.
    pub fn from_json(embed_dim: usize, config: &Value) -> Result<Self> {
        let ridge_parameterization =
            match config.get("ridge_parameterization").and_then(Value::as_str) {
                None => RidgeParameterization::InvAlpha,
                Some(s) => RidgeParameterization::parse(s)?,
            };
        let selection_mechanism = match config.get("selection_mechanism").and_then(Value::as_str)
        {
            None => SelectionMechanism::Full,
            Some(s) => SelectionMechanism::parse(s)?,
        };

        Ok(Self {
            embed_dim,
            dict_size: get_usize(config, "dict_size")?,
            top_k_parameter: get_usize(config, "top_k_parameter")?,
            lambda_parameter: get_f64(config, "lambda_parameter")?,
            epsilon: get_f64_or(config, "epsilon", 1e-6),
            importance_power: get_f64_or(config, "importance_power", -2.0),
            return_penalty: get_bool_or(config, "return_penalty", true),
            ridge_parameterization,
            selection_mechanism,
            scoring_dimension: get_usize_or(config, "scoring_dimension", 1),
            hat_matrix: get_bool_or(config, "hat_matrix", false),
            compute_metrics: get_bool_or(config, "compute_metrics", false),
        })
    }
}

// ---------------------------------------------------------------------------
// JSON extraction helpers
// ---------------------------------------------------------------------------

/// Extract a required `usize` field from a JSON object.
fn get_usize(config: &Value, key: &str) -> Result<usize> {
    let val = config
        .get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| ReftError::Config(format!("missing or invalid field '{key}'")))?;
    usize::try_from(val)
        .map_err(|_| ReftError::Config(format!("field '{key}' value {val} overflows usize")))
}

/// Extract an optional `usize` field, returning a default if absent.
fn get_usize_or(config: &Value, key: &str, default: usize) -> usize {
    config
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|v| usize::try_from(v).ok())
        .unwrap_or(default)
}

/// Extract an optional `usize` field, returning `None` if absent.
fn get_optional_usize(config: &Value, key: &str) -> Option<usize> {
    config
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|v| usize::try_from(v).ok())
}

/// Extract a required `f64` field.
fn get_f64(config: &Value, key: &str) -> Result<f64> {
    config
        .get(key)
        .and_then(Value::as_f64)
        .ok_or_else(|| ReftError::Config(format!("missing or invalid field '{key}'")))
}

/// Extract an `f64` field, returning a default if absent.
fn get_f64_or(config: &Value, key: &str, default: f64) -> f64 {
    config.get(key).and_then(Value::as_f64).unwrap_or(default)
}

/// Extract an `f32` field, returning a default if absent.
#[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
fn get_f32_or(config: &Value, key: &str, default: f32) -> f32 {
    config
        .get(key)
        .and_then(Value::as_f64)
        .map_or(default, |v| v as f32)
}

/// Extract a `bool` field, returning a default if absent.
fn get_bool_or(config: &Value, key: &str, default: bool) -> bool {
    config.get(key).and_then(Value::as_bool).unwrap_or(default)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let config = InterventionConfig::new(512).with_low_rank_dimension(8);
        assert_eq!(config.embed_dim, 512);
        assert_eq!(config.low_rank_dimension, Some(8));
        assert_eq!(config.act_fn, ActFn::Linear);
        assert!((config.dropout - 0.0).abs() < f32::EPSILON);
        assert!(!config.add_bias);
    }

    #[test]
    fn missing_rank_is_config_error() {
        let config = InterventionConfig::new(512);
        assert!(matches!(
            config.require_low_rank_dimension(),
            Err(ReftError::Config(_))
        ));
    }

    #[test]
    fn parse_basic_json() {
        let json = serde_json::json!({
            "embed_dim": 768,
            "low_rank_dimension": 4,
            "act_fn": "relu",
            "dropout": 0.05
        });
        let config = InterventionConfig::from_json(&json).unwrap();
        assert_eq!(config.embed_dim, 768);
        assert_eq!(config.low_rank_dimension, Some(4));
        assert_eq!(config.act_fn, ActFn::Relu);
        assert!((config.dropout - 0.05).abs() < 1e-6);
    }

    #[test]
    fn parse_ridge_json() {
        let json = serde_json::json!({
            "embed_dim": 768,
            "ridge": {
                "dict_size": 64,
                "top_k_parameter": 8,
                "lambda_parameter": 1.0,
                "selection_mechanism": "topk",
                "ridge_parameterization": "sigmoid",
                "hat_matrix": true
            }
        });
        let config = InterventionConfig::from_json(&json).unwrap();
        let ridge = config.ridge.unwrap();
        assert_eq!(ridge.dict_size, 64);
        assert_eq!(ridge.top_k_parameter, 8);
        assert_eq!(ridge.selection_mechanism, SelectionMechanism::TopK);
        assert_eq!(
            ridge.ridge_parameterization,
            RidgeParameterization::Sigmoid
        );
        assert!(ridge.hat_matrix);
        // Defaults fill in.
        assert!((ridge.epsilon - 1e-6).abs() < 1e-12);
        assert!((ridge.importance_power + 2.0).abs() < 1e-12);
        assert!(ridge.return_penalty);
    }

    #[test]
    fn missing_required_ridge_key_errors() {
        let json = serde_json::json!({
            "embed_dim": 768,
            "ridge": { "dict_size": 64, "top_k_parameter": 8 }
        });
        assert!(InterventionConfig::from_json(&json).is_err());
    }

    #[test]
    fn invalid_enumerated_value_errors() {
        assert!(RidgeParameterization::parse("banana").is_err());
        assert!(SelectionMechanism::parse("some").is_err());
        let json = serde_json::json!({ "embed_dim": 16, "act_fn": "swishglu" });
        assert!(InterventionConfig::from_json(&json).is_err());
    }

    #[test]
    fn enum_display_names() {
        assert_eq!(RidgeParameterization::InvAlpha.to_string(), "inv_alpha");
        assert_eq!(RidgeParameterization::Fixed.to_string(), "none");
        assert_eq!(SelectionMechanism::TopK.to_string(), "topk");
        assert_eq!(InterventionKind::QuasiProjective.to_string(), "quasi_projective");
        assert_eq!(InterventionMode::Parallel.to_string(), "parallel");
    }
}
