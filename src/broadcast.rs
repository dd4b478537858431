// SPDX-License-Identifier: MIT OR Apache-2.0

//! Broadcasting of compact call inputs to full per-intervention shape,
//! and the input validation that runs before any model computation.
//!
//! Callers hand the orchestration wrapper compact forms — a single
//! position, one shared position list, or the all-positions sentinel —
//! and the wrapper expands them to one entry per registered intervention
//! and per batch example.  Validation raises [`ReftError::Shape`] on any
//! mismatch, preventing partial execution.

use crate::error::{ReftError, Result};
use crate::host::TokenBatch;

// ---------------------------------------------------------------------------
// UnitLocationSpec
// ---------------------------------------------------------------------------

/// Compact specification of which token positions to intervene on.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitLocationSpec {
    /// One position, shared by every example and intervention.
    Position(usize),
    /// One position list, shared by every example and intervention.
    Positions(Vec<usize>),
    /// Per-example position lists, shared by every intervention.
    PerExample(Vec<Vec<usize>>),
    /// Fully explicit: per-intervention, per-example position lists.
    PerIntervention(Vec<Vec<Vec<usize>>>),
    /// Intervene on every position, including each newly generated
    /// token (the generation-time sentinel).
    AllPositions,
}

/// Positions resolved for a single intervention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedPositions {
    /// Explicit per-example position lists, `[batch][positions]`.
    PerExample(Vec<Vec<usize>>),
    /// Every position.
    All,
}

/// Broadcast a unit-location spec to one entry per intervention.
///
/// `None` resolves to the all-positions form for every intervention.
///
/// # Errors
///
/// Returns [`ReftError::Shape`] if an explicit per-example or
/// per-intervention form does not match `batch_size` /
/// `num_interventions`.
pub fn broadcast_unit_locations(
    spec: Option<&UnitLocationSpec>,
    batch_size: usize,
    num_interventions: usize,
) -> Result<Vec<ResolvedPositions>> {
    let resolved = match spec {
        None | Some(UnitLocationSpec::AllPositions) => {
            vec![ResolvedPositions::All; num_interventions]
        }
        Some(UnitLocationSpec::Position(pos)) => {
            vec![
                ResolvedPositions::PerExample(vec![vec![*pos]; batch_size]);
                num_interventions
            ]
        }
        Some(UnitLocationSpec::Positions(positions)) => {
            vec![
                ResolvedPositions::PerExample(vec![positions.clone(); batch_size]);
                num_interventions
            ]
        }
        Some(UnitLocationSpec::PerExample(per_example)) => {
            if per_example.len() != batch_size {
                return Err(ReftError::Shape(format!(
                    "unit locations cover {} examples, batch size is {batch_size}",
                    per_example.len()
                )));
            }
            vec![ResolvedPositions::PerExample(per_example.clone()); num_interventions]
        }
        Some(UnitLocationSpec::PerIntervention(nested)) => {
            if nested.len() != num_interventions {
                return Err(ReftError::Shape(format!(
                    "unit locations cover {} interventions, registry has {num_interventions}",
                    nested.len()
                )));
            }
            let mut out = Vec::with_capacity(num_interventions);
            for per_example in nested {
                if per_example.len() != batch_size {
                    return Err(ReftError::Shape(format!(
                        "unit locations cover {} examples, batch size is {batch_size}",
                        per_example.len()
                    )));
                }
                out.push(ResolvedPositions::PerExample(per_example.clone()));
            }
            out
        }
    };
    Ok(resolved)
}

// ---------------------------------------------------------------------------
// Sources and activations
// ---------------------------------------------------------------------------

/// Broadcast source batches to one entry per intervention.
///
/// A single source replicates across all interventions; `None` yields
/// all-`None`.
///
/// # Errors
///
/// Returns [`ReftError::Shape`] if the source count matches neither 1
/// nor `num_interventions`.
pub fn broadcast_sources<'a>(
    sources: Option<&'a [TokenBatch]>,
    num_interventions: usize,
) -> Result<Vec<Option<&'a TokenBatch>>> {
    match sources {
        None => Ok(vec![None; num_interventions]),
        Some([]) => Ok(vec![None; num_interventions]),
        Some([single]) => Ok(vec![Some(single); num_interventions]),
        Some(list) if list.len() == num_interventions => Ok(list.iter().map(Some).collect()),
        Some(list) => Err(ReftError::Shape(format!(
            "{} sources provided for {num_interventions} interventions",
            list.len()
        ))),
    }
}

/// Broadcast precomputed source activations to one entry per
/// intervention, with the same replication rule as sources.
///
/// # Errors
///
/// Returns [`ReftError::Shape`] if the activation count matches neither
/// 1 nor `num_interventions`.
pub fn broadcast_source_activations<'a>(
    activations: Option<&'a [candle_core::Tensor]>,
    num_interventions: usize,
) -> Result<Vec<Option<&'a candle_core::Tensor>>> {
    match activations {
        None => Ok(vec![None; num_interventions]),
        Some([]) => Ok(vec![None; num_interventions]),
        Some([single]) => Ok(vec![Some(single); num_interventions]),
        Some(list) if list.len() == num_interventions => Ok(list.iter().map(Some).collect()),
        Some(list) => Err(ReftError::Shape(format!(
            "{} source activations provided for {num_interventions} interventions",
            list.len()
        ))),
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate broadcast inputs against the base batch before any model
/// computation.
///
/// # Errors
///
/// Returns [`ReftError::Shape`] when a position exceeds the base
/// sequence length, a per-example list does not match the batch size,
/// or a source batch size differs from the base's.
pub fn validate_inputs(
    base: &TokenBatch,
    positions: &[ResolvedPositions],
    sources: &[Option<&TokenBatch>],
) -> Result<()> {
    let batch_size = base.batch_size()?;
    let seq_len = base.seq_len()?;

    for resolved in positions {
        if let ResolvedPositions::PerExample(per_example) = resolved {
            if per_example.len() != batch_size {
                return Err(ReftError::Shape(format!(
                    "resolved unit locations cover {} examples, batch size is {batch_size}",
                    per_example.len()
                )));
            }
            for example in per_example {
                for &pos in example {
                    if pos >= seq_len {
                        return Err(ReftError::Shape(format!(
                            "unit location {pos} out of range (seq_len is {seq_len})"
                        )));
                    }
                }
            }
        }
    }

    for source in sources.iter().flatten() {
        let source_batch = source.batch_size()?;
        if source_batch != batch_size {
            return Err(ReftError::Shape(format!(
                "source batch size {source_batch} does not match base batch size {batch_size}"
            )));
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};

    fn batch(batch_size: usize, seq_len: usize) -> TokenBatch {
        let ids = Tensor::zeros((batch_size, seq_len), DType::U32, &Device::Cpu).unwrap();
        TokenBatch::new(ids)
    }

    #[test]
    fn single_position_broadcasts_everywhere() {
        let resolved =
            broadcast_unit_locations(Some(&UnitLocationSpec::Position(3)), 2, 4).unwrap();
        assert_eq!(resolved.len(), 4);
        for r in &resolved {
            assert_eq!(
                *r,
                ResolvedPositions::PerExample(vec![vec![3], vec![3]])
            );
        }
    }

    #[test]
    fn none_resolves_to_all_positions() {
        let resolved = broadcast_unit_locations(None, 2, 3).unwrap();
        assert_eq!(resolved, vec![ResolvedPositions::All; 3]);
    }

    #[test]
    fn per_example_mismatch_is_shape_error() {
        let spec = UnitLocationSpec::PerExample(vec![vec![0], vec![1], vec![2]]);
        assert!(matches!(
            broadcast_unit_locations(Some(&spec), 2, 1),
            Err(ReftError::Shape(_))
        ));
    }

    #[test]
    fn per_intervention_counts_must_match() {
        let spec = UnitLocationSpec::PerIntervention(vec![vec![vec![0]], vec![vec![1]]]);
        assert!(matches!(
            broadcast_unit_locations(Some(&spec), 1, 3),
            Err(ReftError::Shape(_))
        ));
        let ok = broadcast_unit_locations(Some(&spec), 1, 2).unwrap();
        assert_eq!(ok.len(), 2);
    }

    #[test]
    fn sources_replicate_or_match() {
        let a = batch(2, 4);
        let single = vec![a.clone()];
        let replicated = broadcast_sources(Some(&single), 3).unwrap();
        assert_eq!(replicated.len(), 3);
        assert!(replicated.iter().all(Option::is_some));

        let none = broadcast_sources(None, 3).unwrap();
        assert!(none.iter().all(Option::is_none));

        let two = vec![a.clone(), a];
        assert!(matches!(
            broadcast_sources(Some(&two), 3),
            Err(ReftError::Shape(_))
        ));
    }

    #[test]
    fn validation_rejects_out_of_range_positions() {
        let base = batch(2, 4);
        let positions = vec![ResolvedPositions::PerExample(vec![vec![5], vec![0]])];
        assert!(matches!(
            validate_inputs(&base, &positions, &[]),
            Err(ReftError::Shape(_))
        ));
    }

    #[test]
    fn validation_rejects_source_batch_mismatch() {
        let base = batch(2, 4);
        let source = batch(3, 4);
        let sources = vec![Some(&source)];
        assert!(matches!(
            validate_inputs(&base, &[ResolvedPositions::All], &sources),
            Err(ReftError::Shape(_))
        ));
    }

    #[test]
    fn validation_passes_well_formed_inputs() {
        let base = batch(2, 4);
        let source = batch(2, 4);
        let sources = vec![Some(&source)];
        let positions = vec![ResolvedPositions::PerExample(vec![vec![0, 3], vec![1]])];
        assert!(validate_inputs(&base, &positions, &sources).is_ok());
    }
}
