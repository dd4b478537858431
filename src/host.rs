// SPDX-License-Identifier: MIT OR Apache-2.0

//! Seams to the external collaborators: the frozen host model and the
//! hook-installation engine.
//!
//! The host transformer and the generic interception machinery are not
//! part of this crate; they are consumed through two narrow traits.
//! [`InterventionHost`] exposes forward/generate entry points and the
//! token-embedding table (located by one of the two conventional
//! attribute names).  [`HookEngine`] installs forward handlers for a
//! fully-resolved [`HandlerRequest`] and returns a [`HandlerHandle`]
//! whose removal the orchestration wrapper guarantees on every exit
//! path.

use candle_core::Tensor;
use candle_nn::Embedding;

use crate::broadcast::ResolvedPositions;
use crate::config::InterventionMode;
use crate::error::Result;
use crate::interventions::Intervention;
use crate::subspace::SubspacePayload;

// ---------------------------------------------------------------------------
// TokenBatch
// ---------------------------------------------------------------------------

/// A tokenized input batch for the host model.
#[derive(Debug, Clone)]
pub struct TokenBatch {
    /// Token IDs, `[batch, seq]`.
    pub input_ids: Tensor,
    /// Attention mask, `[batch, seq]`, if any.
    pub attention_mask: Option<Tensor>,
    /// Training labels, if any.
    pub labels: Option<Tensor>,
}

impl TokenBatch {
    /// Create a batch from token IDs.
    #[must_use]
    pub const fn new(input_ids: Tensor) -> Self {
        Self {
            input_ids,
            attention_mask: None,
            labels: None,
        }
    }

    /// Attach an attention mask.
    #[must_use]
    pub fn with_attention_mask(mut self, mask: Tensor) -> Self {
        self.attention_mask = Some(mask);
        self
    }

    /// Attach training labels.
    #[must_use]
    pub fn with_labels(mut self, labels: Tensor) -> Self {
        self.labels = Some(labels);
        self
    }

    /// Batch size (size of the leading dimension).
    ///
    /// # Errors
    ///
    /// Returns [`crate::ReftError::Model`] if `input_ids` has no dims.
    pub fn batch_size(&self) -> Result<usize> {
        Ok(self.input_ids.dim(0)?)
    }

    /// Sequence length.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ReftError::Model`] if `input_ids` is not 2D.
    pub fn seq_len(&self) -> Result<usize> {
        Ok(self.input_ids.dim(1)?)
    }
}

// ---------------------------------------------------------------------------
// GenerateOptions
// ---------------------------------------------------------------------------

/// Generation parameters forwarded to the host model.
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    /// Maximum number of new tokens to generate.
    pub max_new_tokens: usize,
    /// Beam-search width (1 = greedy/sampling).
    pub num_beams: usize,
    /// Whether the host should use its KV cache.
    pub use_cache: bool,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            max_new_tokens: 32,
            num_beams: 1,
            use_cache: true,
        }
    }
}

// ---------------------------------------------------------------------------
// InterventionHost
// ---------------------------------------------------------------------------

/// Narrow interface of the frozen host model.
///
/// The wrapper locates the token-embedding table by attribute name,
/// trying `"wte"` then `"embed_tokens"`; a host exposing neither cannot
/// support payload computation (hard error, no fallback).
pub trait InterventionHost {
    /// Plain forward pass; returns the model output (typically logits).
    ///
    /// # Errors
    ///
    /// Host-defined failures surface unchanged.
    fn forward(&self, batch: &TokenBatch, use_cache: Option<bool>) -> Result<Tensor>;

    /// Autoregressive generation; returns generated token IDs or host
    /// output.
    ///
    /// # Errors
    ///
    /// Host-defined failures surface unchanged.
    fn generate(&self, batch: &TokenBatch, options: &GenerateOptions) -> Result<Tensor>;

    /// The token-embedding sub-module registered under `name`, if any.
    fn token_embedding(&self, name: &str) -> Option<&Embedding> {
        let _ = name;
        None
    }
}

// ---------------------------------------------------------------------------
// HandlerRequest
// ---------------------------------------------------------------------------

/// One fully-resolved intervention handler: where to intercept, which
/// intervention to call, and the per-call inputs it receives.
pub struct HandlerSpec<'a> {
    /// Layer index to intercept at.
    pub layer: usize,
    /// Representation component name at that layer (e.g.
    /// `"block_output"`).
    pub component: &'a str,
    /// The intervention to invoke on the intercepted activation.
    pub intervention: &'a dyn Intervention,
    /// Source batch whose activations replace the base's, if any.
    pub source: Option<&'a TokenBatch>,
    /// Precomputed source activations, if any.
    pub source_activation: Option<&'a Tensor>,
    /// Token positions to intervene on.
    pub positions: ResolvedPositions,
    /// Per-intervention subspace payload (restricted to declared keys).
    pub payload: Option<SubspacePayload>,
    /// Whether the engine should collect this handler's output
    /// activation for the caller.
    pub collect: bool,
}

/// Everything the engine needs to install handlers for one call.
pub struct HandlerRequest<'a> {
    /// Composition mode.
    pub mode: InterventionMode,
    /// One spec per registered intervention, in registry order.
    pub handlers: Vec<HandlerSpec<'a>>,
}

// ---------------------------------------------------------------------------
// HandlerHandle
// ---------------------------------------------------------------------------

/// Removal token for a set of installed handlers.
///
/// `remove()` must run exactly once; dropping an un-removed handle runs
/// it as a safety net, so interception state can never leak into the
/// next call even on exceptional control flow.
pub struct HandlerHandle {
    /// Deferred removal action; `None` once executed.
    remover: Option<Box<dyn FnOnce()>>,
}

impl HandlerHandle {
    /// Wrap a removal action.
    #[must_use]
    pub fn new(remover: impl FnOnce() + 'static) -> Self {
        Self {
            remover: Some(Box::new(remover)),
        }
    }

    /// A handle with nothing to remove (engines with no installed state).
    #[must_use]
    pub const fn noop() -> Self {
        Self { remover: None }
    }

    /// Remove the installed handlers.
    pub fn remove(mut self) {
        if let Some(remover) = self.remover.take() {
            remover();
        }
    }
}

impl Drop for HandlerHandle {
    fn drop(&mut self) {
        if let Some(remover) = self.remover.take() {
            remover();
        }
    }
}

impl std::fmt::Debug for HandlerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerHandle")
            .field("armed", &self.remover.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// HookEngine
// ---------------------------------------------------------------------------

/// Narrow interface of the external hook-installation engine.
pub trait HookEngine {
    /// Install forward handlers for the request; the returned handle's
    /// removal is guaranteed by the orchestration wrapper.
    ///
    /// # Errors
    ///
    /// Engine-defined failures surface unchanged.
    fn install_handlers(&self, request: &HandlerRequest<'_>) -> Result<HandlerHandle>;

    /// Activations collected by handlers flagged with
    /// [`HandlerSpec::collect`] during the most recent intervened pass.
    fn collected_activations(&self) -> Vec<Tensor> {
        Vec::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn handle_remove_runs_exactly_once() {
        let count = Rc::new(Cell::new(0));
        let witness = Rc::clone(&count);
        let handle = HandlerHandle::new(move || witness.set(witness.get() + 1));
        handle.remove();
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn dropping_unremoved_handle_still_removes() {
        let count = Rc::new(Cell::new(0));
        let witness = Rc::clone(&count);
        {
            let _handle = HandlerHandle::new(move || witness.set(witness.get() + 1));
        }
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn noop_handle_is_inert() {
        let handle = HandlerHandle::noop();
        handle.remove();
    }

    #[test]
    fn token_batch_dims() {
        use candle_core::{DType, Device, Tensor};
        let ids = Tensor::zeros((3, 7), DType::U32, &Device::Cpu).unwrap();
        let batch = TokenBatch::new(ids);
        assert_eq!(batch.batch_size().unwrap(), 3);
        assert_eq!(batch.seq_len().unwrap(), 7);
        assert!(batch.attention_mask.is_none());
        assert!(batch.labels.is_none());
    }
}
