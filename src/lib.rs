// SPDX-License-Identifier: MIT OR Apache-2.0

//! # candle-reft
//!
//! Representation fine-tuning (ReFT) for language models in Rust, built
//! on [candle](https://github.com/huggingface/candle).
//!
//! candle-reft implements the ReFT intervention algebra: lightweight
//! trainable modules that edit a frozen host transformer's hidden
//! states at chosen layers and token positions — a parameter-efficient
//! alternative to full fine-tuning.
//!
//! ## What's inside
//!
//! - **The intervention family** — the orthonormal low-rank rotation
//!   primitive and the `LoReFT` / `NoReFT` / `ConsReFT` / `LobiReFT` /
//!   `DiReFT` / `NodiReFT` variants, plus a token-selective form scaled
//!   by per-call token weights.
//! - **The quasi-projective ridge intervention** — a closed-form,
//!   per-batch ridge regression onto a learned dictionary span, solved
//!   by batched Cholesky factorization (never an explicit inverse).
//! - **The orchestration wrapper** — [`ReftModel`] computes side-channel
//!   payloads once per call, broadcasts inputs across batch and
//!   intervention dimensions, and guarantees hook-handler teardown on
//!   every exit path.
//!
//! The host transformer and the generic hook-installation machinery are
//! external collaborators, consumed through the narrow
//! [`InterventionHost`] and [`HookEngine`] traits.

#![deny(warnings)]
#![warn(missing_docs)]

pub mod broadcast;
mod checkpoint;
pub mod config;
pub mod error;
pub mod host;
pub mod interventions;
pub mod linalg;
pub mod model;
pub mod rotate;
pub mod subspace;
pub mod token_selection;

pub use broadcast::{ResolvedPositions, UnitLocationSpec};
pub use config::{
    ActFn, InterventionConfig, InterventionKind, InterventionMode, RidgeConfig,
    RidgeParameterization, SelectionMechanism,
};
pub use error::{ReftError, Result};
pub use host::{
    GenerateOptions, HandlerHandle, HandlerRequest, HandlerSpec, HookEngine, InterventionHost,
    TokenBatch,
};
pub use interventions::{Intervention, build_intervention};
pub use model::{
    ForwardOptions, GenerateRequest, InterventionSite, ReftForwardOutput, ReftGenerateOutput,
    ReftModel,
};
pub use rotate::LowRankRotateLayer;
pub use subspace::{
    InterventionOutput, PayloadKey, QuasiDiagnostics, RidgeDiagnostics, SubspacePayload,
};
pub use token_selection::{
    DiscreteTokenSelection, DiscretizationStrategy, ScaledDotProductAttention,
    TemperatureSchedule, TokenSelector,
};
