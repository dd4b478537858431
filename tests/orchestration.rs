// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end orchestration scenarios against a mock host model and a
//! mock hook engine.
//!
//! The mock engine records what the wrapper hands it (handler count,
//! resolved positions, payload routing) and counts removal calls, which
//! lets these tests pin down the pass-through shortcut, the payload
//! requirement union, the generation sentinel, and guaranteed handler
//! teardown on error paths.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::as_conversions,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation
)]

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Embedding, VarBuilder, VarMap};

use candle_reft::{
    DiscretizationStrategy, ForwardOptions, GenerateOptions, GenerateRequest, HandlerHandle,
    HandlerRequest, HookEngine, InterventionConfig, InterventionHost, InterventionKind,
    InterventionSite, ReftError, ReftModel, ResolvedPositions, RidgeConfig, TemperatureSchedule,
    TokenBatch, UnitLocationSpec,
};

const VOCAB: usize = 16;
const EMBED: usize = 8;

// ---------------------------------------------------------------------------
// Mock host
// ---------------------------------------------------------------------------

/// Frozen toy host: forward returns scaled token embeddings.
struct MockHost {
    embed: Embedding,
    /// Attribute name the embedding table is registered under.
    embedding_name: &'static str,
    /// When set, the next forward call fails.
    fail_forward: Cell<bool>,
    /// Number of forward invocations.
    forward_calls: Cell<usize>,
}

impl MockHost {
    fn new(embedding_name: &'static str) -> Self {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let embed = candle_nn::embedding(VOCAB, EMBED, vb.pp("embed")).unwrap();
        Self {
            embed,
            embedding_name,
            fail_forward: Cell::new(false),
            forward_calls: Cell::new(0),
        }
    }
}

impl InterventionHost for MockHost {
    fn forward(&self, batch: &TokenBatch, _use_cache: Option<bool>) -> candle_reft::Result<Tensor> {
        self.forward_calls.set(self.forward_calls.get() + 1);
        if self.fail_forward.get() {
            return Err(ReftError::Model(candle_core::Error::Msg(
                "mock host forward failure".into(),
            )));
        }
        Ok((self.embed.forward(&batch.input_ids)? * 2.0)?)
    }

    fn generate(
        &self,
        batch: &TokenBatch,
        options: &GenerateOptions,
    ) -> candle_reft::Result<Tensor> {
        let batch_size = batch.batch_size()?;
        Ok(Tensor::ones(
            (batch_size, options.max_new_tokens),
            DType::U32,
            &Device::Cpu,
        )?)
    }

    fn token_embedding(&self, name: &str) -> Option<&Embedding> {
        (name == self.embedding_name).then_some(&self.embed)
    }
}

// ---------------------------------------------------------------------------
// Mock engine
// ---------------------------------------------------------------------------

/// Record of one installed handler, as seen by the engine.
#[derive(Clone)]
struct SeenHandler {
    layer: usize,
    positions: ResolvedPositions,
    has_hidden_states: bool,
    has_token_weights: bool,
}

/// Hook engine that records requests and counts removals.  When
/// `apply_base` is set, it additionally drives each handler's
/// intervention on that activation, the way a real engine would inside
/// the host's forward pass.
#[derive(Clone, Default)]
struct MockEngine {
    installs: Rc<Cell<usize>>,
    removals: Rc<Cell<usize>>,
    seen: Rc<RefCell<Vec<SeenHandler>>>,
    apply_base: Rc<RefCell<Option<Tensor>>>,
}

impl HookEngine for MockEngine {
    fn install_handlers(
        &self,
        request: &HandlerRequest<'_>,
    ) -> candle_reft::Result<HandlerHandle> {
        self.installs.set(self.installs.get() + 1);
        let mut seen = Vec::with_capacity(request.handlers.len());
        for handler in &request.handlers {
            seen.push(SeenHandler {
                layer: handler.layer,
                positions: handler.positions.clone(),
                has_hidden_states: handler
                    .payload
                    .as_ref()
                    .is_some_and(|p| p.hidden_states().is_some()),
                has_token_weights: handler
                    .payload
                    .as_ref()
                    .is_some_and(|p| p.token_weights().is_some()),
            });
            if let Some(base) = self.apply_base.borrow().as_ref() {
                let out = handler
                    .intervention
                    .forward(base, None, handler.payload.as_ref())?;
                assert_eq!(out.output.dims(), base.dims());
            }
        }
        *self.seen.borrow_mut() = seen;

        let removals = Rc::clone(&self.removals);
        Ok(HandlerHandle::new(move || {
            removals.set(removals.get() + 1);
        }))
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn token_batch(batch_size: usize, seq_len: usize) -> TokenBatch {
    #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
    let ids: Vec<u32> = (0..batch_size * seq_len)
        .map(|i| (i % VOCAB) as u32)
        .collect();
    TokenBatch::new(Tensor::from_vec(ids, (batch_size, seq_len), &Device::Cpu).unwrap())
}

fn model_with(
    embedding_name: &'static str,
) -> (ReftModel<MockHost, MockEngine>, MockEngine) {
    let engine = MockEngine::default();
    let model = ReftModel::new(
        MockHost::new(embedding_name),
        engine.clone(),
        Device::Cpu,
        DType::F32,
    );
    (model, engine)
}

fn loreft_config() -> InterventionConfig {
    InterventionConfig::new(EMBED).with_low_rank_dimension(2)
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn empty_model_forward_is_pure_passthrough() {
    let (model, engine) = model_with("wte");
    let batch = token_batch(2, 4);

    let out = model.forward(&batch, &ForwardOptions::default()).unwrap();

    // Output equals a direct host forward call.
    let direct = model.host().forward(&batch, None).unwrap();
    let got: Vec<f32> = out
        .intervened_output
        .flatten_all()
        .unwrap()
        .to_vec1()
        .unwrap();
    let want: Vec<f32> = direct.flatten_all().unwrap().to_vec1().unwrap();
    assert_eq!(got, want);

    // No handler installation was attempted.
    assert_eq!(engine.installs.get(), 0);
    assert!(out.original_output.is_none());
    assert!(out.token_weights.is_none());
    assert!(out.collected_activations.is_empty());
}

#[test]
fn intervened_forward_installs_and_removes_handlers() {
    let (mut model, engine) = model_with("wte");
    model
        .add_intervention(
            InterventionSite::block_output(3),
            InterventionKind::Loreft,
            &loreft_config(),
        )
        .unwrap();

    let batch = token_batch(2, 4);
    let out = model.forward(&batch, &ForwardOptions::default()).unwrap();

    assert_eq!(engine.installs.get(), 1);
    assert_eq!(engine.removals.get(), 1);
    assert_eq!(out.intervened_output.dims(), &[2, 4, EMBED]);

    let seen = engine.seen.borrow();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].layer, 3);
    // A plain LoReFT declares no payload keys, so it receives none.
    assert!(!seen[0].has_hidden_states);
    assert!(!seen[0].has_token_weights);
}

#[test]
fn handlers_are_removed_when_the_intervened_pass_fails() {
    let (mut model, engine) = model_with("wte");
    model
        .add_intervention(
            InterventionSite::block_output(0),
            InterventionKind::Loreft,
            &loreft_config(),
        )
        .unwrap();

    model.host().fail_forward.set(true);
    let batch = token_batch(2, 4);
    let result = model.forward(&batch, &ForwardOptions::default());

    assert!(result.is_err());
    assert_eq!(engine.installs.get(), 1);
    // Teardown still ran on the error path.
    assert_eq!(engine.removals.get(), 1);
}

#[test]
fn output_original_runs_an_extra_host_pass() {
    let (mut model, _engine) = model_with("wte");
    model
        .add_intervention(
            InterventionSite::block_output(0),
            InterventionKind::Loreft,
            &loreft_config(),
        )
        .unwrap();

    let batch = token_batch(1, 3);
    let options = ForwardOptions {
        output_original: true,
        ..Default::default()
    };
    let out = model.forward(&batch, &options).unwrap();
    assert!(out.original_output.is_some());
    assert_eq!(model.host().forward_calls.get(), 2);
}

#[test]
fn quasi_intervention_receives_hidden_state_payload() {
    let (mut model, engine) = model_with("embed_tokens");
    let ridge = RidgeConfig::new(EMBED, 4, 2, 1.0);
    let config = InterventionConfig::new(EMBED).with_ridge(ridge);
    model
        .add_intervention(
            InterventionSite::block_output(1),
            InterventionKind::QuasiProjective,
            &config,
        )
        .unwrap();

    // Pin the encoder bias positive so every example selects at least
    // one dictionary element (makes the penalty strictly positive).
    {
        let data = model.varmap().data().lock().unwrap();
        let bias = data
            .get("layer.1.block_output.0.edit_instruction_encodings.bias")
            .unwrap();
        bias.set(&Tensor::ones(4, DType::F32, &Device::Cpu).unwrap())
            .unwrap();
    }

    // Have the engine actually drive the intervention, as a real one
    // would during the host's forward pass.
    let base: Vec<f32> = (0..2 * 4 * EMBED).map(|i| (i % 41) as f32 / 40.0).collect();
    *engine.apply_base.borrow_mut() =
        Some(Tensor::from_vec(base, (2, 4, EMBED), &Device::Cpu).unwrap());

    let batch = token_batch(2, 4);
    model.forward(&batch, &ForwardOptions::default()).unwrap();

    let seen = engine.seen.borrow();
    assert!(seen[0].has_hidden_states);
    assert!(!seen[0].has_token_weights);
    drop(seen);

    // The engine-driven call populated the penalty cache; an explicit
    // reset clears it.
    assert!(model.penalties()[0] > 0.0);
    model.zero_penalties();
    assert!((model.penalties()[0] - 0.0).abs() < f32::EPSILON);
}

#[test]
fn quasi_payload_requires_an_embedding_table() {
    // Host exposes neither "wte" nor "embed_tokens": payload computation
    // is a hard error, no fallback.
    let (mut model, _engine) = model_with("lm_embed");
    let config = InterventionConfig::new(EMBED).with_ridge(RidgeConfig::new(EMBED, 4, 2, 1.0));
    model
        .add_intervention(
            InterventionSite::block_output(0),
            InterventionKind::QuasiProjective,
            &config,
        )
        .unwrap();

    let batch = token_batch(1, 3);
    let result = model.forward(&batch, &ForwardOptions::default());
    assert!(matches!(result, Err(ReftError::Config(_))));
}

#[test]
fn token_selection_produces_weights_and_routes_them() {
    let (mut model, engine) = model_with("wte");
    model
        .enable_token_selection(
            EMBED,
            TemperatureSchedule::new(1.0, 0.1, 100),
            DiscretizationStrategy::BinaryConcrete,
            false,
        )
        .unwrap();
    model
        .add_intervention(
            InterventionSite::block_output(2),
            InterventionKind::TokenSelectiveLoreft,
            &loreft_config(),
        )
        .unwrap();

    let batch = token_batch(2, 5);
    let out = model.forward(&batch, &ForwardOptions::default()).unwrap();

    let weights = out.token_weights.unwrap();
    assert_eq!(weights.dims(), &[2, 5, 1]);
    assert!(engine.seen.borrow()[0].has_token_weights);
}

#[test]
fn generate_defaults_to_the_all_positions_sentinel() {
    let (mut model, engine) = model_with("wte");
    model
        .add_intervention(
            InterventionSite::block_output(0),
            InterventionKind::Loreft,
            &loreft_config(),
        )
        .unwrap();

    let batch = token_batch(1, 4);
    let request = GenerateRequest::default();
    let out = model.generate(&batch, &request).unwrap();

    assert_eq!(out.intervened_output.dims(), &[1, 32]);
    assert_eq!(engine.seen.borrow()[0].positions, ResolvedPositions::All);
    assert_eq!(engine.removals.get(), 1);
}

#[test]
fn generate_with_explicit_positions_keeps_them() {
    let (mut model, engine) = model_with("wte");
    model
        .add_intervention(
            InterventionSite::block_output(0),
            InterventionKind::Loreft,
            &loreft_config(),
        )
        .unwrap();

    let batch = token_batch(2, 4);
    let request = GenerateRequest {
        unit_locations: Some(UnitLocationSpec::Position(1)),
        intervene_on_prompt: true,
        ..Default::default()
    };
    model.generate(&batch, &request).unwrap();

    assert_eq!(
        engine.seen.borrow()[0].positions,
        ResolvedPositions::PerExample(vec![vec![1], vec![1]])
    );
}

#[test]
fn beam_search_replicates_token_weights() {
    let (mut model, _engine) = model_with("wte");
    model
        .enable_token_selection(
            EMBED,
            TemperatureSchedule::new(1.0, 0.1, 100),
            DiscretizationStrategy::Sigmoid,
            false,
        )
        .unwrap();
    model
        .add_intervention(
            InterventionSite::block_output(0),
            InterventionKind::TokenSelectiveLoreft,
            &loreft_config(),
        )
        .unwrap();

    let batch = token_batch(2, 4);
    let request = GenerateRequest {
        generate: GenerateOptions {
            num_beams: 3,
            ..Default::default()
        },
        ..Default::default()
    };
    let out = model.generate(&batch, &request).unwrap();

    // 2 examples x 3 beams.
    assert_eq!(out.token_weights.unwrap().dims(), &[6, 4, 1]);
}

#[test]
fn shape_validation_runs_before_any_host_computation() {
    let (mut model, engine) = model_with("wte");
    model
        .add_intervention(
            InterventionSite::block_output(0),
            InterventionKind::Loreft,
            &loreft_config(),
        )
        .unwrap();

    let batch = token_batch(2, 4);
    let options = ForwardOptions {
        unit_locations: Some(UnitLocationSpec::Position(9)),
        ..Default::default()
    };
    let result = model.forward(&batch, &options);

    assert!(matches!(result, Err(ReftError::Shape(_))));
    assert_eq!(model.host().forward_calls.get(), 0);
    assert_eq!(engine.installs.get(), 0);
}

#[test]
fn trainable_parameters_are_counted() {
    let (mut model, _engine) = model_with("wte");
    assert_eq!(model.trainable_parameter_count(), 0);

    model
        .add_intervention(
            InterventionSite::block_output(0),
            InterventionKind::Loreft,
            &loreft_config(),
        )
        .unwrap();

    // rotate_layer (8x2) + learned_source weight (2x8) + bias (2).
    assert_eq!(model.trainable_parameter_count(), 16 + 16 + 2);
}

#[test]
fn checkpoint_roundtrip_through_the_wrapper() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("reft.safetensors");

    let (mut model, _engine) = model_with("wte");
    model
        .add_intervention(
            InterventionSite::block_output(0),
            InterventionKind::Loreft,
            &loreft_config(),
        )
        .unwrap();
    model.save_interventions(&path).unwrap();

    let (mut restored, _engine2) = model_with("wte");
    restored
        .add_intervention(
            InterventionSite::block_output(0),
            InterventionKind::Loreft,
            &loreft_config(),
        )
        .unwrap();
    restored.load_interventions(&path).unwrap();

    // Both models now hold identical learned-source weights.
    let read = |m: &ReftModel<MockHost, MockEngine>| -> Vec<f32> {
        let data = m.varmap().data().lock().unwrap();
        data.get("layer.0.block_output.0.learned_source.weight")
            .unwrap()
            .as_tensor()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap()
    };
    assert_eq!(read(&model), read(&restored));
}
