//! Autoregressive text generation with top-k sampling.

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{Error, Result};
use crate::model::{last_position_logits, GPT};
use crate::tokenizer::Tokenizer;

pub const DEFAULT_TOP_K: usize = 50;

/// Decodes token sequences from a model by repeatedly sampling the next
/// token from the top-k of the predicted distribution. Deterministic for a
/// fixed seed.
pub struct Sampler<'a> {
    model: &'a GPT,
    device: &'a Device,
}

impl<'a> Sampler<'a> {
    pub fn new(model: &'a GPT, device: &'a Device) -> Self {
        Self { model, device }
    }

    /// Replicates `prompt` across `num_return_sequences` rows and extends
    /// each row one token at a time until every row has `max_length`
    /// tokens.
    pub fn sample(
        &self,
        prompt: &[u32],
        num_return_sequences: usize,
        max_length: usize,
        top_k: usize,
        seed: u64,
    ) -> Result<Vec<Vec<u32>>> {
        if prompt.is_empty() {
            return Err(Error::Shape("prompt must be non-empty".to_string()));
        }
        if num_return_sequences == 0 {
            return Ok(Vec::new());
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let mut rows: Vec<Vec<u32>> = vec![prompt.to_vec(); num_return_sequences];

        while rows[0].len() < max_length {
            let seq_len = rows[0].len();
            let flat: Vec<u32> = rows.iter().flatten().copied().collect();
            let input = Tensor::from_vec(flat, (num_return_sequences, seq_len), self.device)?;

            let (logits, _) = self.model.forward(&input, None)?;
            let logits = last_position_logits(&logits)?;
            let probs = candle_nn::ops::softmax_last_dim(&logits)?;
            let probs: Vec<Vec<f32>> = probs.to_vec2()?;

            for (row, row_probs) in rows.iter_mut().zip(probs.iter()) {
                row.push(sample_top_k(row_probs, top_k, &mut rng));
            }
        }

        for row in &mut rows {
            row.truncate(max_length);
        }
        Ok(rows)
    }

    /// Like [`sample`](Self::sample), decoding each row back to text.
    pub fn sample_text(
        &self,
        tokenizer: &Tokenizer,
        prompt: &str,
        num_return_sequences: usize,
        max_length: usize,
        top_k: usize,
        seed: u64,
    ) -> Result<Vec<String>> {
        let prompt_tokens = tokenizer.encode(prompt)?;
        let rows = self.sample(&prompt_tokens, num_return_sequences, max_length, top_k, seed)?;
        rows.iter().map(|row| tokenizer.decode(row)).collect()
    }
}

/// One multinomial draw restricted to the `k` highest-probability tokens.
fn sample_top_k(probs: &[f32], k: usize, rng: &mut StdRng) -> u32 {
    let mut indexed: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
    indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    indexed.truncate(k.min(indexed.len()));

    let total: f32 = indexed.iter().map(|(_, p)| p).sum();
    let r: f32 = rng.random::<f32>() * total;

    let mut acc = 0.0;
    for &(idx, p) in &indexed {
        acc += p;
        if acc > r {
            return idx as u32;
        }
    }
    // Floating-point underflow can leave r barely above the cumulative sum;
    // fall back to the least likely retained token.
    indexed.last().map(|&(idx, _)| idx as u32).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use candle_core::DType;
    use candle_nn::{VarBuilder, VarMap};

    fn build() -> (GPT, VarMap) {
        let config = ModelConfig::nano();
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
        let model = GPT::new(&config, vb).unwrap();
        (model, var_map)
    }

    #[test]
    fn test_sample_is_deterministic() {
        let (model, _var_map) = build();
        let device = Device::Cpu;
        let sampler = Sampler::new(&model, &device);
        let prompt = [1u32, 2, 3, 4];

        let a = sampler.sample(&prompt, 1, 10, DEFAULT_TOP_K, 42).unwrap();
        let b = sampler.sample(&prompt, 1, 10, DEFAULT_TOP_K, 42).unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0].len(), 10);
        assert_eq!(&a[0][..4], &prompt);
    }

    #[test]
    fn test_sample_multiple_rows() {
        let (model, _var_map) = build();
        let device = Device::Cpu;
        let sampler = Sampler::new(&model, &device);

        let rows = sampler.sample(&[7u32, 8], 3, 6, DEFAULT_TOP_K, 0).unwrap();
        assert_eq!(rows.len(), 3);
        for row in &rows {
            assert_eq!(row.len(), 6);
            assert_eq!(&row[..2], &[7, 8]);
        }
    }

    #[test]
    fn test_prompt_longer_than_max_length() {
        let (model, _var_map) = build();
        let device = Device::Cpu;
        let sampler = Sampler::new(&model, &device);

        let rows = sampler.sample(&[1u32, 2, 3, 4, 5], 1, 3, DEFAULT_TOP_K, 0).unwrap();
        assert_eq!(rows[0], vec![1, 2, 3]);
    }

    #[test]
    fn test_empty_prompt_rejected() {
        let (model, _var_map) = build();
        let device = Device::Cpu;
        let sampler = Sampler::new(&model, &device);
        assert!(matches!(
            sampler.sample(&[], 1, 4, DEFAULT_TOP_K, 0),
            Err(Error::Shape(_))
        ));
    }

    #[test]
    fn test_top_k_restricts_support() {
        let probs = vec![0.05f32, 0.5, 0.3, 0.1, 0.05];
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..100 {
            let token = sample_top_k(&probs, 2, &mut rng);
            assert!(token == 1 || token == 2, "token {} outside top-2", token);
        }
    }
}
