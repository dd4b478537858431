// SPDX-License-Identifier: MIT OR Apache-2.0

//! The ReFT orchestration wrapper.
//!
//! [`ReftModel`] owns the intervention registry and decides, per
//! forward/generate call, which interventions receive which side-channel
//! payload.  It computes each payload exactly once (embedding lookups,
//! attention-derived token weights), broadcasts call inputs across the
//! batch and intervention dimensions, validates shapes, hands the
//! fully-resolved request to the external hook engine, runs the host
//! model, and reassembles outputs.
//!
//! Handler teardown is guaranteed on every exit path: the engine's
//! removal token is dropped (and therefore executed) whether the
//! intervened pass returns, errors, or panics.
//!
//! Per call the wrapper moves through: idle → payload-computed →
//! broadcast/validated → (optional un-intervened pass) →
//! handlers-installed → intervened pass → handlers-removed → idle.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};

use crate::broadcast::{
    self, ResolvedPositions, UnitLocationSpec, broadcast_source_activations, broadcast_sources,
    broadcast_unit_locations,
};
use crate::checkpoint;
use crate::config::{InterventionConfig, InterventionKind, InterventionMode};
use crate::error::{ReftError, Result};
use crate::host::{
    GenerateOptions, HandlerRequest, HandlerSpec, HookEngine, InterventionHost, TokenBatch,
};
use crate::interventions::{Intervention, build_intervention};
use crate::subspace::{PayloadKey, SubspacePayload};
use crate::token_selection::{DiscretizationStrategy, TemperatureSchedule, TokenSelector};

// ---------------------------------------------------------------------------
// InterventionSite
// ---------------------------------------------------------------------------

/// A layer/component location in the host model where an intervention
/// intercepts hidden states.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InterventionSite {
    /// Layer index.
    pub layer: usize,
    /// Representation component at that layer (e.g. `"block_output"`).
    pub component: String,
}

impl InterventionSite {
    /// Create a site.
    #[must_use]
    pub fn new(layer: usize, component: impl Into<String>) -> Self {
        Self {
            layer,
            component: component.into(),
        }
    }

    /// The conventional residual-stream output site for a layer.
    #[must_use]
    pub fn block_output(layer: usize) -> Self {
        Self::new(layer, "block_output")
    }
}

impl fmt::Display for InterventionSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "layer.{}.{}", self.layer, self.component)
    }
}

// ---------------------------------------------------------------------------
// Registry entry
// ---------------------------------------------------------------------------

/// A registered intervention plus the metadata checkpoint I/O needs.
pub(crate) struct RegisteredIntervention {
    /// Where the intervention intercepts.
    pub(crate) site: InterventionSite,
    /// The intervention instance.
    // TRAIT_OBJECT: the registry holds heterogeneous variants behind dynamic dispatch
    pub(crate) intervention: Box<dyn Intervention>,
    /// The configuration it was built from.
    pub(crate) config: InterventionConfig,
    /// Variable-name prefix inside the wrapper's `VarMap`.
    pub(crate) key: String,
    /// Whether the engine should collect this handler's output.
    pub(crate) collect: bool,
}

// ---------------------------------------------------------------------------
// Call options and outputs
// ---------------------------------------------------------------------------

/// Optional inputs for [`ReftModel::forward`].
#[derive(Default)]
pub struct ForwardOptions<'a> {
    /// Source batches (interchange-style engines), one per intervention
    /// group or a single shared batch.
    pub sources: Option<&'a [TokenBatch]>,
    /// Compact unit-location specification.
    pub unit_locations: Option<UnitLocationSpec>,
    /// Precomputed source activations.
    pub source_representations: Option<&'a [Tensor]>,
    /// Caller-provided subspace payload; entries the wrapper computes
    /// itself take precedence.
    pub subspaces: Option<SubspacePayload>,
    /// Also run (and return) the un-intervened forward pass.
    pub output_original: bool,
    /// KV-cache flag forwarded to the host.
    pub use_cache: Option<bool>,
}

/// Optional inputs for [`ReftModel::generate`].
#[derive(Default)]
pub struct GenerateRequest<'a> {
    /// Source batches, as in [`ForwardOptions`].
    pub sources: Option<&'a [TokenBatch]>,
    /// Compact unit-location specification.  When absent and
    /// `intervene_on_prompt` is off, every generated token position is
    /// intervened upon.
    pub unit_locations: Option<UnitLocationSpec>,
    /// Precomputed source activations.
    pub source_representations: Option<&'a [Tensor]>,
    /// Caller-provided subspace payload.
    pub subspaces: Option<SubspacePayload>,
    /// Restrict interception to the prompt.
    pub intervene_on_prompt: bool,
    /// Also run (and return) the un-intervened generation.
    pub output_original: bool,
    /// Generation parameters forwarded to the host.
    pub generate: GenerateOptions,
}

/// Structured output of [`ReftModel::forward`].
#[derive(Debug)]
pub struct ReftForwardOutput {
    /// Un-intervened host output, when requested.
    pub original_output: Option<Tensor>,
    /// Intervened host output.
    pub intervened_output: Tensor,
    /// Activations collected by collect-flagged handlers.
    pub collected_activations: Vec<Tensor>,
    /// Token-selection weights used for this call, if computed.
    pub token_weights: Option<Tensor>,
}

/// Structured output of [`ReftModel::generate`].
#[derive(Debug)]
pub struct ReftGenerateOutput {
    /// Un-intervened generation, when requested.
    pub original_output: Option<Tensor>,
    /// Intervened generation.
    pub intervened_output: Tensor,
    /// Token-selection weights used for this call, if computed.
    pub token_weights: Option<Tensor>,
}

// ---------------------------------------------------------------------------
// ReftModel
// ---------------------------------------------------------------------------

/// Orchestration wrapper around a frozen host model and a hook engine.
pub struct ReftModel<H: InterventionHost, E: HookEngine> {
    /// The frozen host model.
    host: H,
    /// The external hook-installation engine.
    engine: E,
    /// Composition mode for multiple interventions.
    mode: InterventionMode,
    /// Ordered registry of interventions.
    registry: Vec<RegisteredIntervention>,
    /// Trainable variables of every intervention (and the selector).
    varmap: VarMap,
    /// Automated token selector, when enabled.
    token_selector: Option<TokenSelector>,
    /// Device interventions live on.
    device: Device,
    /// Dtype interventions are created with.
    dtype: DType,
}

impl<H: InterventionHost, E: HookEngine> ReftModel<H, E> {
    /// Wrap a host model and hook engine.
    #[must_use]
    pub fn new(host: H, engine: E, device: Device, dtype: DType) -> Self {
        Self {
            host,
            engine,
            mode: InterventionMode::Parallel,
            registry: Vec::new(),
            varmap: VarMap::new(),
            token_selector: None,
            device,
            dtype,
        }
    }

    /// Set the composition mode.
    #[must_use]
    pub const fn with_mode(mut self, mode: InterventionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Register an intervention at a site.  Interventions run in
    /// registration order.
    ///
    /// # Errors
    ///
    /// Returns [`ReftError::Config`] when required configuration keys
    /// for the kind are absent or invalid.
    pub fn add_intervention(
        &mut self,
        site: InterventionSite,
        kind: InterventionKind,
        config: &InterventionConfig,
    ) -> Result<()> {
        let key = format!("{site}.{}", self.registry.len());
        let vb = VarBuilder::from_varmap(&self.varmap, self.dtype, &self.device).pp(&key);
        let intervention = build_intervention(kind, config, vb)?;
        tracing::debug!(site = %site, kind = %kind, "registered intervention");
        self.registry.push(RegisteredIntervention {
            site,
            intervention,
            config: config.clone(),
            key,
            collect: false,
        });
        Ok(())
    }

    /// Mark the most recently registered intervention for activation
    /// collection.
    pub fn collect_last(&mut self) {
        if let Some(entry) = self.registry.last_mut() {
            entry.collect = true;
        }
    }

    /// Enable automated token selection for token-selective
    /// interventions.
    ///
    /// # Errors
    ///
    /// Returns [`ReftError::Model`] if variable creation fails.
    pub fn enable_token_selection(
        &mut self,
        embed_dim: usize,
        schedule: TemperatureSchedule,
        strategy: DiscretizationStrategy,
        use_attn_weights: bool,
    ) -> Result<()> {
        let vb =
            VarBuilder::from_varmap(&self.varmap, self.dtype, &self.device).pp("token_selection");
        self.token_selector = Some(TokenSelector::new(
            embed_dim,
            schedule,
            strategy,
            use_attn_weights,
            vb,
        )?);
        Ok(())
    }

    /// The wrapped host model.
    pub const fn host(&self) -> &H {
        &self.host
    }

    /// The trainable-variable map (hand `all_vars()` to an optimizer).
    pub const fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// The token selector, when enabled.
    pub const fn token_selector(&self) -> Option<&TokenSelector> {
        self.token_selector.as_ref()
    }

    /// Number of registered interventions.
    #[must_use]
    pub fn num_interventions(&self) -> usize {
        self.registry.len()
    }

    /// Iterate over registered interventions in order.
    pub fn interventions(&self) -> impl Iterator<Item = (&InterventionSite, &dyn Intervention)> {
        self.registry
            .iter()
            .map(|entry| (&entry.site, &*entry.intervention))
    }

    /// Total number of trainable intervention parameters.
    #[must_use]
    pub fn trainable_parameter_count(&self) -> usize {
        let count = self
            .varmap
            .all_vars()
            .iter()
            .map(|var| var.as_tensor().elem_count())
            .sum();
        tracing::debug!(count, "trainable intervention parameters");
        count
    }

    /// Switch every intervention (and the selector) between training
    /// and evaluation behavior.
    pub fn set_training(&self, training: bool) {
        for entry in &self.registry {
            entry.intervention.set_training(training);
        }
        if let Some(selector) = &self.token_selector {
            selector.set_training(training);
        }
    }

    /// Cached penalties of every registered intervention, in registry
    /// order.
    #[must_use]
    pub fn penalties(&self) -> Vec<f32> {
        self.registry
            .iter()
            .map(|entry| entry.intervention.penalty())
            .collect()
    }

    /// Clear every cached penalty.
    pub fn zero_penalties(&self) {
        for entry in &self.registry {
            entry.intervention.zero_penalty();
        }
    }

    // --- Checkpoints -----------------------------------------------------

    /// Save the minimal intervention state snapshots to a safetensors
    /// file.
    ///
    /// # Errors
    ///
    /// Returns [`ReftError::Model`] on serialization failure.
    pub fn save_interventions<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        checkpoint::save(&self.registry, &self.varmap, path)
    }

    /// Restore intervention state from a safetensors file, including
    /// the legacy ridge-checkpoint migration path.
    ///
    /// # Errors
    ///
    /// Returns [`ReftError::Config`] on rank or dictionary-size
    /// mismatches, [`ReftError::Model`] on I/O or tensor failures.
    pub fn load_interventions<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        checkpoint::load(&self.registry, &self.varmap, &self.device, path)
    }

    // --- Payload computation ---------------------------------------------

    /// Union of payload keys declared by the registered interventions.
    fn payload_requirements(&self) -> HashSet<PayloadKey> {
        let mut union = HashSet::new();
        for entry in &self.registry {
            union.extend(entry.intervention.required_payload());
            union.extend(entry.intervention.optional_payload());
        }
        union
    }

    /// Embedding lookup through the host's token-embedding table,
    /// located by the two conventional attribute names.
    fn embedding_lookup(&self, batch: &TokenBatch) -> Result<Tensor> {
        let embedding = self
            .host
            .token_embedding("wte")
            .or_else(|| self.host.token_embedding("embed_tokens"))
            .ok_or_else(|| {
                ReftError::Config(
                    "host model exposes neither a 'wte' nor an 'embed_tokens' embedding table"
                        .into(),
                )
            })?;
        use candle_core::Module;
        Ok(embedding.forward(&batch.input_ids)?)
    }

    /// Compute the side-channel payload once per call.  Entries the
    /// wrapper computes overlay any caller-provided payload.  Returns
    /// the merged payload and the token weights separately (the latter
    /// are part of the call output).
    fn compute_payload(
        &self,
        base: &TokenBatch,
        caller_payload: Option<&SubspacePayload>,
        num_beams: usize,
    ) -> Result<(SubspacePayload, Option<Tensor>)> {
        let requirements = self.payload_requirements();
        let mut payload = caller_payload.cloned().unwrap_or_default();
        let mut token_weights = None;

        if requirements.contains(&PayloadKey::TokenWeights) {
            if let Some(selector) = &self.token_selector {
                let embeddings = self.embedding_lookup(base)?;
                let mut weights = selector.forward(&embeddings)?;
                if num_beams > 1 {
                    // Beam search expands the effective batch.
                    weights = repeat_per_beam(&weights, num_beams)?;
                }
                tracing::debug!(dims = ?weights.dims(), "computed token-selection weights");
                payload = payload.with_token_weights(weights.clone());
                token_weights = Some(weights);
            }
        }

        if requirements.contains(&PayloadKey::HiddenStates) {
            let hidden_states = self.embedding_lookup(base)?;
            tracing::debug!(dims = ?hidden_states.dims(), "computed hidden-state payload");
            payload = payload.with_hidden_states(hidden_states);
        }

        Ok((payload, token_weights))
    }

    // --- Forward ---------------------------------------------------------

    /// Intervened forward pass.
    ///
    /// With no sources, no source activations, no unit locations, and an
    /// empty registry this is a pure pass-through to the host model; no
    /// handler installation is attempted.  Training labels travel on the
    /// base [`TokenBatch`].
    ///
    /// # Errors
    ///
    /// Propagates configuration, payload, shape, numerical, and host
    /// errors unchanged after handler teardown.
    pub fn forward(
        &self,
        base: &TokenBatch,
        options: &ForwardOptions<'_>,
    ) -> Result<ReftForwardOutput> {
        let passthrough = options.sources.is_none()
            && options.source_representations.is_none()
            && options.unit_locations.is_none()
            && self.registry.is_empty();
        if passthrough {
            let output = self.host.forward(base, options.use_cache)?;
            return Ok(ReftForwardOutput {
                original_output: None,
                intervened_output: output,
                collected_activations: Vec::new(),
                token_weights: None,
            });
        }

        let (payload, token_weights) =
            self.compute_payload(base, options.subspaces.as_ref(), 1)?;

        let batch_size = base.batch_size()?;
        let positions = broadcast_unit_locations(
            options.unit_locations.as_ref(),
            batch_size,
            self.registry.len(),
        )?;
        let sources = broadcast_sources(options.sources, self.registry.len())?;
        let activations =
            broadcast_source_activations(options.source_representations, self.registry.len())?;
        broadcast::validate_inputs(base, &positions, &sources)?;

        let original_output = if options.output_original {
            Some(self.host.forward(base, options.use_cache)?)
        } else {
            None
        };

        let request = self.build_request(&payload, &positions, &sources, &activations);
        let any_collect = self.registry.iter().any(|entry| entry.collect);

        // Handler teardown is guaranteed: `handle` runs its removal on
        // drop, including the early-return paths below.
        let handle = self.engine.install_handlers(&request)?;
        let intervened_output = self.host.forward(base, options.use_cache)?;
        let collected_activations = if any_collect {
            self.engine.collected_activations()
        } else {
            Vec::new()
        };
        handle.remove();

        Ok(ReftForwardOutput {
            original_output,
            intervened_output,
            collected_activations,
            token_weights,
        })
    }

    // --- Generate --------------------------------------------------------

    /// Intervened autoregressive generation, symmetric to
    /// [`forward`](Self::forward).
    ///
    /// When no explicit unit locations are given and interception is not
    /// prompt-only, every generated token position is intervened upon.
    /// Token-selection weights are replicated per beam candidate before
    /// broadcasting.
    ///
    /// # Errors
    ///
    /// Propagates errors unchanged after handler teardown.
    pub fn generate(
        &self,
        base: &TokenBatch,
        request: &GenerateRequest<'_>,
    ) -> Result<ReftGenerateOutput> {
        let unit_locations = match (&request.unit_locations, request.intervene_on_prompt) {
            (Some(spec), _) => Some(spec.clone()),
            (None, false) => Some(UnitLocationSpec::AllPositions),
            (None, true) => None,
        };

        let (payload, token_weights) = self.compute_payload(
            base,
            request.subspaces.as_ref(),
            request.generate.num_beams,
        )?;

        let batch_size = base.batch_size()?;
        let positions = broadcast_unit_locations(
            unit_locations.as_ref(),
            batch_size,
            self.registry.len(),
        )?;
        let sources = broadcast_sources(request.sources, self.registry.len())?;
        let activations =
            broadcast_source_activations(request.source_representations, self.registry.len())?;
        broadcast::validate_inputs(base, &positions, &sources)?;

        let original_output = if request.output_original {
            Some(self.host.generate(base, &request.generate)?)
        } else {
            None
        };

        let handler_request = self.build_request(&payload, &positions, &sources, &activations);

        // Teardown guaranteed exactly as in forward.
        let handle = self.engine.install_handlers(&handler_request)?;
        let intervened_output = self.host.generate(base, &request.generate)?;
        handle.remove();

        Ok(ReftGenerateOutput {
            original_output,
            intervened_output,
            token_weights,
        })
    }

    /// Assemble the fully-resolved handler request for the engine.
    fn build_request<'a>(
        &'a self,
        payload: &SubspacePayload,
        positions: &[ResolvedPositions],
        sources: &[Option<&'a TokenBatch>],
        activations: &[Option<&'a Tensor>],
    ) -> HandlerRequest<'a> {
        let handlers = self
            .registry
            .iter()
            .enumerate()
            .map(|(i, entry)| {
                let declared: Vec<PayloadKey> = entry
                    .intervention
                    .required_payload()
                    .iter()
                    .chain(entry.intervention.optional_payload())
                    .copied()
                    .collect();
                let restricted = payload.restricted_to(&declared);
                HandlerSpec {
                    layer: entry.site.layer,
                    component: &entry.site.component,
                    intervention: &*entry.intervention,
                    source: sources.get(i).copied().flatten(),
                    source_activation: activations.get(i).copied().flatten(),
                    positions: positions
                        .get(i)
                        .cloned()
                        .unwrap_or(ResolvedPositions::All),
                    payload: (!restricted.is_empty()).then_some(restricted),
                    collect: entry.collect,
                }
            })
            .collect();
        HandlerRequest {
            mode: self.mode,
            handlers,
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Replicate a batched tensor per beam candidate along the batch axis:
/// `[b, ...] -> [b * beams, ...]` with each example repeated
/// consecutively.
fn repeat_per_beam(tensor: &Tensor, beams: usize) -> Result<Tensor> {
    if beams <= 1 {
        return Ok(tensor.clone());
    }
    let dims = tensor.dims().to_vec();
    let batch = dims.first().copied().unwrap_or(0);
    let mut expanded_dims = dims.clone();
    expanded_dims.insert(1, beams);
    let mut flat_dims = dims;
    if let Some(leading) = flat_dims.first_mut() {
        *leading = batch * beams;
    }
    Ok(tensor
        .unsqueeze(1)?
        .expand(expanded_dims)?
        .contiguous()?
        .reshape(flat_dims)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn site_display() {
        let site = InterventionSite::block_output(7);
        assert_eq!(site.to_string(), "layer.7.block_output");
    }

    #[test]
    fn repeat_per_beam_interleaves_examples() {
        let device = Device::Cpu;
        let t = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0], (2, 2), &device).unwrap();
        let repeated = repeat_per_beam(&t, 3).unwrap();
        assert_eq!(repeated.dims(), &[6, 2]);
        let v: Vec<Vec<f32>> = repeated.to_vec2().unwrap();
        assert_eq!(v[0], vec![1.0, 2.0]);
        assert_eq!(v[1], vec![1.0, 2.0]);
        assert_eq!(v[2], vec![1.0, 2.0]);
        assert_eq!(v[3], vec![3.0, 4.0]);
    }

    #[test]
    fn repeat_per_beam_single_beam_is_identity() {
        let device = Device::Cpu;
        let t = Tensor::from_vec(vec![1.0f32, 2.0], (2, 1), &device).unwrap();
        let repeated = repeat_per_beam(&t, 1).unwrap();
        assert_eq!(repeated.dims(), &[2, 1]);
    }
}
