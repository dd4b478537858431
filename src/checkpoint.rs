// SPDX-License-Identifier: MIT OR Apache-2.0

//! Minimal intervention state snapshots.
//!
//! Rotation-based interventions persist exactly the learned-source
//! entries plus one `rotate_layer` entry holding the orthonormal
//! `[embed_dim, rank]` matrix — not the unconstrained parameter or any
//! re-parameterization bookkeeping — keeping checkpoints small.  Restore
//! reconstructs the rotation and verifies it reproduces the stored
//! matrix within numerical tolerance; a stored rank that differs from
//! the configured one is a hard error, never silently truncated or
//! padded.
//!
//! The ridge intervention additionally understands one legacy layout: a
//! `rotate_layer.parametrizations.weight.original` entry whose column
//! space is migrated into the dictionary storage.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{Device, Tensor};
use candle_nn::VarMap;

use crate::config::{InterventionKind, SelectionMechanism};
use crate::error::{ReftError, Result};
use crate::linalg;
use crate::model::RegisteredIntervention;

/// Max-abs tolerance for the post-load rotation verification.
const ROTATION_TOLERANCE: f32 = 1e-5;

/// Whether a kind persists the rotation-layer snapshot format.
const fn is_rotation_based(kind: InterventionKind) -> bool {
    matches!(
        kind,
        InterventionKind::Loreft
            | InterventionKind::TokenSelectiveLoreft
            | InterventionKind::Consreft
            | InterventionKind::Lobireft
            | InterventionKind::Direft
    )
}

// ---------------------------------------------------------------------------
// Save
// ---------------------------------------------------------------------------

/// Write the minimal snapshots of every registered intervention to a
/// safetensors file.
pub(crate) fn save<P: AsRef<Path>>(
    registry: &[RegisteredIntervention],
    varmap: &VarMap,
    path: P,
) -> Result<()> {
    let mut state: HashMap<String, Tensor> = HashMap::new();

    for entry in registry {
        let kind = entry.intervention.kind();
        let raw_rotate_key = format!("{}.rotate_layer.weight", entry.key);
        for (name, tensor) in vars_with_prefix(varmap, &entry.key)? {
            if is_rotation_based(kind) && name == raw_rotate_key {
                // Persist the projected orthonormal matrix, not the raw
                // parameter.
                let snapshot_key = format!("{}.rotate_layer", entry.key);
                state.insert(snapshot_key, linalg::orthonormalize(&tensor)?);
            } else {
                state.insert(name, tensor);
            }
        }
    }

    tracing::info!(entries = state.len(), path = %path.as_ref().display(), "saving intervention state");
    candle_core::safetensors::save(&state, path)?;
    Ok(())
}

/// Current values of every variable under a registry prefix.
fn vars_with_prefix(varmap: &VarMap, prefix: &str) -> Result<Vec<(String, Tensor)>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| ReftError::Config("variable map lock poisoned".into()))?;
    let dotted = format!("{prefix}.");
    let mut out = Vec::new();
    for (name, var) in data.iter() {
        if name.starts_with(&dotted) {
            out.push((name.clone(), var.as_tensor().clone()));
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Restore intervention state from a safetensors file.
pub(crate) fn load<P: AsRef<Path>>(
    registry: &[RegisteredIntervention],
    varmap: &VarMap,
    device: &Device,
    path: P,
) -> Result<()> {
    let state = candle_core::safetensors::load(path.as_ref(), device)?;
    tracing::info!(entries = state.len(), path = %path.as_ref().display(), "loading intervention state");

    for entry in registry {
        let kind = entry.intervention.kind();
        if is_rotation_based(kind) {
            restore_rotation_entry(entry, varmap, &state)?;
        } else if kind == InterventionKind::QuasiProjective {
            restore_quasi_entry(entry, varmap, &state)?;
        } else {
            restore_plain_entry(entry, varmap, &state)?;
        }
    }
    Ok(())
}

/// Restore a rotation-based intervention: learned-source entries plus
/// the `rotate_layer` matrix, with rank check and orthogonality
/// verification.
fn restore_rotation_entry(
    entry: &RegisteredIntervention,
    varmap: &VarMap,
    state: &HashMap<String, Tensor>,
) -> Result<()> {
    let snapshot_key = format!("{}.rotate_layer", entry.key);
    let stored = state.get(&snapshot_key).ok_or_else(|| {
        ReftError::Config(format!(
            "checkpoint has no '{snapshot_key}' entry for intervention '{}'",
            entry.key
        ))
    })?;

    let (stored_embed, stored_rank) = stored.dims2()?;
    let configured_rank = entry.config.require_low_rank_dimension()?;
    if stored_embed != entry.config.embed_dim || stored_rank != configured_rank {
        return Err(ReftError::Config(format!(
            "stored rotation is {stored_embed}x{stored_rank}, module expects {}x{configured_rank}",
            entry.config.embed_dim
        )));
    }

    // Reconstruct the rotation from the stored matrix and verify it
    // reproduces the stored weight.
    let reconstructed = linalg::orthonormalize(stored)?;
    let diff = max_abs_diff(&reconstructed, stored)?;
    if diff > ROTATION_TOLERANCE {
        return Err(ReftError::Numerical(format!(
            "restored rotation for '{}' fails orthogonality verification (max diff {diff})",
            entry.key
        )));
    }

    set_var(varmap, &format!("{}.rotate_layer.weight", entry.key), stored)?;
    restore_matching_vars(entry, varmap, state, &[format!("{}.rotate_layer.weight", entry.key)])
}

/// Restore a quasi-projective intervention, falling back to the legacy
/// reflective-checkpoint migration when the direct layout is absent.
fn restore_quasi_entry(
    entry: &RegisteredIntervention,
    varmap: &VarMap,
    state: &HashMap<String, Tensor>,
) -> Result<()> {
    let legacy_key = format!("{}.rotate_layer.parametrizations.weight.original", entry.key);
    let dictionary_key = format!("{}.dictionary.weight", entry.key);

    if state.contains_key(&dictionary_key) {
        return restore_matching_vars(entry, varmap, state, &[]);
    }

    let Some(reflect) = state.get(&legacy_key) else {
        return Err(ReftError::Config(format!(
            "checkpoint has neither '{dictionary_key}' nor the legacy '{legacy_key}' entry"
        )));
    };

    let ridge = entry.config.ridge.as_ref().ok_or_else(|| {
        ReftError::Config("registered quasi intervention lost its ridge configuration".into())
    })?;

    let (_, reflect_dim) = reflect.dims2()?;
    if ridge.dict_size != reflect_dim {
        return Err(ReftError::Config(format!(
            "configured dict_size {} does not match stored rotation width {reflect_dim}",
            ridge.dict_size
        )));
    }

    tracing::info!(key = %entry.key, "migrating legacy reflective checkpoint into dictionary storage");
    let migrated = match ridge.selection_mechanism {
        SelectionMechanism::Full | SelectionMechanism::TopK => {
            // Per-row copy of the rotation's column space.
            reflect.t()?.contiguous()?
        }
        SelectionMechanism::Dynamic => {
            let flat = reflect.flatten_all()?;
            let rows = flat.dim(0)?;
            flat.unsqueeze(1)?
                .expand((rows, ridge.scoring_dimension))?
                .contiguous()?
        }
        #[allow(unreachable_patterns)]
        _ => {
            return Err(ReftError::Config(
                "legacy checkpoint migration is undefined for this selection mode".into(),
            ));
        }
    };
    set_var(varmap, &dictionary_key, &migrated)?;

    // Remaining quasi parameters restore tolerantly from whatever the
    // checkpoint carries.
    restore_matching_vars(entry, varmap, state, &[dictionary_key])
}

/// Restore a projection-based intervention (plain parameter set).
fn restore_plain_entry(
    entry: &RegisteredIntervention,
    varmap: &VarMap,
    state: &HashMap<String, Tensor>,
) -> Result<()> {
    restore_matching_vars(entry, varmap, state, &[])
}

/// Copy every checkpoint entry under the registry prefix into its
/// variable, skipping names already handled.
fn restore_matching_vars(
    entry: &RegisteredIntervention,
    varmap: &VarMap,
    state: &HashMap<String, Tensor>,
    already_handled: &[String],
) -> Result<()> {
    let prefix = format!("{}.", entry.key);
    for (name, tensor) in state {
        if !name.starts_with(&prefix) || already_handled.contains(name) {
            continue;
        }
        if has_var(varmap, name) {
            set_var(varmap, name, tensor)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// VarMap access
// ---------------------------------------------------------------------------

/// Whether the map holds a variable under the name.
fn has_var(varmap: &VarMap, name: &str) -> bool {
    varmap
        .data()
        .lock()
        .map(|data| data.contains_key(name))
        .unwrap_or(false)
}

/// Overwrite a variable's value in place.
fn set_var(varmap: &VarMap, name: &str, value: &Tensor) -> Result<()> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| ReftError::Config("variable map lock poisoned".into()))?;
    let var = data.get(name).ok_or_else(|| {
        ReftError::Config(format!("no registered variable named '{name}'"))
    })?;
    var.set(&value.to_dtype(var.as_tensor().dtype())?)?;
    Ok(())
}

/// Max absolute elementwise difference between two tensors.
fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    let diff: Vec<f32> = (a.to_dtype(candle_core::DType::F32)?
        - b.to_dtype(candle_core::DType::F32)?)?
        .abs()?
        .flatten_all()?
        .to_vec1()?;
    Ok(diff.into_iter().fold(0.0f32, f32::max))
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
    use candle_core::DType;
    use candle_nn::VarBuilder;

    use crate::config::{InterventionConfig, RidgeConfig};
    use crate::interventions::build_intervention;
    use crate::model::InterventionSite;

    const KEY: &str = "layer.0.block_output.0";

    fn rotation_entry(varmap: &VarMap, rank: usize) -> RegisteredIntervention {
        let config = InterventionConfig::new(8).with_low_rank_dimension(rank);
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu).pp(KEY);
        RegisteredIntervention {
            site: InterventionSite::block_output(0),
            intervention: build_intervention(InterventionKind::Loreft, &config, vb).unwrap(),
            config,
            key: KEY.to_string(),
            collect: false,
        }
    }

    fn quasi_entry(varmap: &VarMap, ridge: RidgeConfig) -> RegisteredIntervention {
        let config = InterventionConfig::new(ridge.embed_dim).with_ridge(ridge);
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu).pp(KEY);
        RegisteredIntervention {
            site: InterventionSite::block_output(0),
            intervention: build_intervention(InterventionKind::QuasiProjective, &config, vb)
                .unwrap(),
            config,
            key: KEY.to_string(),
            collect: false,
        }
    }

    fn rotation_of(varmap: &VarMap) -> Tensor {
        let data = varmap.data().lock().unwrap();
        let raw = data
            .get(&format!("{KEY}.rotate_layer.weight"))
            .unwrap()
            .as_tensor()
            .clone();
        drop(data);
        linalg::orthonormalize(&raw).unwrap()
    }

    #[test]
    fn rotation_roundtrip_reproduces_weight() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.safetensors");

        let varmap = VarMap::new();
        let registry = vec![rotation_entry(&varmap, 2)];
        let saved_rotation = rotation_of(&varmap);
        save(&registry, &varmap, &path).unwrap();

        // A fresh module starts from different random parameters.
        let restored_map = VarMap::new();
        let restored_registry = vec![rotation_entry(&restored_map, 2)];
        load(&restored_registry, &restored_map, &Device::Cpu, &path).unwrap();

        let reloaded = rotation_of(&restored_map);
        let diff = max_abs_diff(&reloaded, &saved_rotation).unwrap();
        assert!(diff < 1e-5, "round-trip rotation differs by {diff}");
    }

    #[test]
    fn learned_source_survives_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.safetensors");

        let varmap = VarMap::new();
        let registry = vec![rotation_entry(&varmap, 2)];
        let original: Vec<f32> = {
            let data = varmap.data().lock().unwrap();
            data.get(&format!("{KEY}.learned_source.weight"))
                .unwrap()
                .as_tensor()
                .flatten_all()
                .unwrap()
                .to_vec1()
                .unwrap()
        };
        save(&registry, &varmap, &path).unwrap();

        let restored_map = VarMap::new();
        let restored_registry = vec![rotation_entry(&restored_map, 2)];
        load(&restored_registry, &restored_map, &Device::Cpu, &path).unwrap();

        let reloaded: Vec<f32> = {
            let data = restored_map.data().lock().unwrap();
            data.get(&format!("{KEY}.learned_source.weight"))
                .unwrap()
                .as_tensor()
                .flatten_all()
                .unwrap()
                .to_vec1()
                .unwrap()
        };
        assert_eq!(original, reloaded);
    }

    #[test]
    fn mismatched_rank_is_hard_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.safetensors");

        let varmap = VarMap::new();
        let registry = vec![rotation_entry(&varmap, 2)];
        save(&registry, &varmap, &path).unwrap();

        // Restoring a rank-2 snapshot into a rank-4 module must raise,
        // never silently truncate or pad.
        let wider_map = VarMap::new();
        let wider_registry = vec![rotation_entry(&wider_map, 4)];
        assert!(matches!(
            load(&wider_registry, &wider_map, &Device::Cpu, &path),
            Err(ReftError::Config(_))
        ));
    }

    #[test]
    fn legacy_reflective_checkpoint_migrates_into_dictionary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legacy.safetensors");
        let (embed, dict) = (8usize, 4usize);

        let reflect_data: Vec<f32> = (0..embed * dict).map(|i| i as f32 / 10.0).collect();
        let reflect = Tensor::from_vec(reflect_data, (embed, dict), &Device::Cpu).unwrap();
        let mut legacy: HashMap<String, Tensor> = HashMap::new();
        legacy.insert(
            format!("{KEY}.rotate_layer.parametrizations.weight.original"),
            reflect.clone(),
        );
        candle_core::safetensors::save(&legacy, &path).unwrap();

        let varmap = VarMap::new();
        let registry = vec![quasi_entry(&varmap, RidgeConfig::new(embed, dict, 2, 1.0))];
        load(&registry, &varmap, &Device::Cpu, &path).unwrap();

        let data = varmap.data().lock().unwrap();
        let dictionary = data
            .get(&format!("{KEY}.dictionary.weight"))
            .unwrap()
            .as_tensor()
            .clone();
        drop(data);

        let expected = reflect.t().unwrap().contiguous().unwrap();
        let diff = max_abs_diff(&dictionary, &expected).unwrap();
        assert!(diff < 1e-6, "migrated dictionary differs by {diff}");
    }

    #[test]
    fn legacy_migration_rejects_dict_size_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legacy.safetensors");
        let embed = 8usize;

        let reflect = Tensor::zeros((embed, 3), DType::F32, &Device::Cpu).unwrap();
        let mut legacy: HashMap<String, Tensor> = HashMap::new();
        legacy.insert(
            format!("{KEY}.rotate_layer.parametrizations.weight.original"),
            reflect,
        );
        candle_core::safetensors::save(&legacy, &path).unwrap();

        // Configured dict_size 4 != stored rotation width 3.
        let varmap = VarMap::new();
        let registry = vec![quasi_entry(&varmap, RidgeConfig::new(embed, 4, 2, 1.0))];
        assert!(matches!(
            load(&registry, &varmap, &Device::Cpu, &path),
            Err(ReftError::Config(_))
        ));
    }
}
