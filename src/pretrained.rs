//! Import of reference GPT-2 checkpoints (HF safetensors naming scheme).

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};

use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::model::GPT;

/// The single supported architecture tag.
pub const GPT2_ARCH: &str = "gpt2";

/// Weight matrices the reference checkpoint stores in the Conv1D
/// convention; these are transposed on import.
const TRANSPOSED_SUFFIXES: [&str; 4] = [
    "attn.c_attn.weight",
    "attn.c_proj.weight",
    "mlp.c_fc.weight",
    "mlp.c_proj.weight",
];

impl GPT {
    /// Builds a GPT-2 Small model and fills every parameter from a
    /// reference checkpoint in safetensors format. The returned `VarMap`
    /// keeps the loaded parameters trainable.
    pub fn from_pretrained<P: AsRef<Path>>(
        arch: &str,
        path: P,
        device: &Device,
    ) -> Result<(Self, VarMap)> {
        if arch != GPT2_ARCH {
            return Err(Error::Mismatch(format!(
                "unsupported architecture tag: {} (only {} is supported)",
                arch, GPT2_ARCH
            )));
        }
        let config = ModelConfig::gpt2();
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);
        let model = GPT::new(&config, vb)?;

        let weights = candle_core::safetensors::load(path.as_ref(), device)?;
        load_weights(&var_map, weights)?;
        Ok((model, var_map))
    }
}

/// Copies a named tensor set into a model's variables.
///
/// Checkpoint names may carry a `transformer.` prefix; causal mask buffers
/// (`.attn.bias`, `.attn.masked_bias`) and the tied `lm_head.weight` are
/// skipped. The remaining name set must match the model's variables exactly
/// and every shape must line up after transposition, otherwise the copy
/// fails with `Error::Mismatch` before any parameter has been written.
pub fn load_weights(var_map: &VarMap, weights: HashMap<String, Tensor>) -> Result<()> {
    let mut source: HashMap<String, Tensor> = HashMap::with_capacity(weights.len());
    for (name, tensor) in weights {
        let canon = match name.strip_prefix("transformer.") {
            Some(stripped) => stripped.to_string(),
            None => name,
        };
        if canon.ends_with(".attn.bias")
            || canon.ends_with(".attn.masked_bias")
            || canon == "lm_head.weight"
        {
            continue;
        }
        source.insert(canon, tensor);
    }

    let data = var_map.data().lock().unwrap();
    if source.len() != data.len() {
        return Err(Error::Mismatch(format!(
            "mismatched parameter count: checkpoint has {}, model has {}",
            source.len(),
            data.len()
        )));
    }

    // Validate every name and shape up front so a failed import leaves the
    // model untouched.
    let mut staged: Vec<(&Var, Tensor)> = Vec::with_capacity(data.len());
    for (name, var) in data.iter() {
        let tensor = source.get(name).ok_or_else(|| {
            Error::Mismatch(format!("checkpoint is missing parameter {}", name))
        })?;
        let tensor = if TRANSPOSED_SUFFIXES.iter().any(|s| name.ends_with(s)) {
            tensor.t()?.contiguous()?
        } else {
            tensor.clone()
        };
        if tensor.dims() != var.dims() {
            return Err(Error::Mismatch(format!(
                "shape mismatch for {}: checkpoint {:?}, model {:?}",
                name,
                tensor.dims(),
                var.dims()
            )));
        }
        staged.push((var, tensor.to_dtype(DType::F32)?));
    }

    for (var, tensor) in staged {
        var.set(&tensor)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(config: &ModelConfig) -> (GPT, VarMap) {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
        let model = GPT::new(config, vb).unwrap();
        (model, var_map)
    }

    /// Exports a model's variables the way the reference checkpoint stores
    /// them: `transformer.` prefix, Conv1D-transposed projections, mask
    /// buffers present, tied lm_head duplicated.
    fn export_reference_format(var_map: &VarMap, config: &ModelConfig) -> HashMap<String, Tensor> {
        let data = var_map.data().lock().unwrap();
        let mut out = HashMap::new();
        for (name, var) in data.iter() {
            let tensor = if TRANSPOSED_SUFFIXES.iter().any(|s| name.ends_with(s)) {
                var.as_tensor().t().unwrap().contiguous().unwrap()
            } else {
                var.as_tensor().clone()
            };
            out.insert(format!("transformer.{}", name), tensor);
        }
        for i in 0..config.n_layers {
            let buffer = Tensor::ones(
                (config.block_size, config.block_size),
                DType::F32,
                &Device::Cpu,
            )
            .unwrap();
            out.insert(format!("transformer.h.{}.attn.bias", i), buffer);
        }
        out.insert(
            "lm_head.weight".to_string(),
            data.get("wte.weight").unwrap().as_tensor().clone(),
        );
        out
    }

    #[test]
    fn test_import_round_trip() {
        let config = ModelConfig::nano();
        let (_donor, donor_map) = build(&config);
        let (_model, var_map) = build(&config);

        let weights = export_reference_format(&donor_map, &config);
        load_weights(&var_map, weights).unwrap();

        let donor_data = donor_map.data().lock().unwrap();
        let data = var_map.data().lock().unwrap();
        for name in ["wte.weight", "h.0.attn.c_attn.weight", "h.1.mlp.c_proj.bias"] {
            let expected: Vec<f32> = donor_data
                .get(name)
                .unwrap()
                .as_tensor()
                .flatten_all()
                .unwrap()
                .to_vec1()
                .unwrap();
            let got: Vec<f32> = data
                .get(name)
                .unwrap()
                .as_tensor()
                .flatten_all()
                .unwrap()
                .to_vec1()
                .unwrap();
            assert_eq!(expected, got, "parameter {} not copied", name);
        }
    }

    #[test]
    fn test_import_rejects_unknown_arch() {
        let result = GPT::from_pretrained("gpt3", "/nonexistent", &Device::Cpu);
        assert!(matches!(result, Err(Error::Mismatch(_))));
    }

    #[test]
    fn test_import_rejects_missing_parameter() {
        let config = ModelConfig::nano();
        let (_donor, donor_map) = build(&config);
        let (_model, var_map) = build(&config);

        let mut weights = export_reference_format(&donor_map, &config);
        weights.remove("transformer.ln_f.weight");
        assert!(matches!(
            load_weights(&var_map, weights),
            Err(Error::Mismatch(_))
        ));
    }

    #[test]
    fn test_import_shape_mismatch_is_atomic() {
        let config = ModelConfig::nano();
        let (_donor, donor_map) = build(&config);
        let (model, var_map) = build(&config);

        let before: Vec<f32> = model
            .token_embedding()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();

        let mut weights = export_reference_format(&donor_map, &config);
        weights.insert(
            "transformer.ln_f.weight".to_string(),
            Tensor::zeros(config.n_embed + 1, DType::F32, &Device::Cpu).unwrap(),
        );
        assert!(matches!(
            load_weights(&var_map, weights),
            Err(Error::Mismatch(_))
        ));

        // No parameter may have been overwritten by the failed import.
        let after: Vec<f32> = model
            .token_embedding()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(before, after);
    }
}
