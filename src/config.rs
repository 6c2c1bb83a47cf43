use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Maximum sequence length (context window)
    pub block_size: usize,
    /// Vocabulary size
    pub vocab_size: usize,
    /// Number of transformer layers
    pub n_layers: usize,
    /// Number of attention heads
    pub n_head: usize,
    /// Embedding dimension
    pub n_embed: usize,
}

impl ModelConfig {
    /// GPT-2 Small configuration (124M parameters), matching the
    /// pretrained reference checkpoint.
    pub fn gpt2() -> Self {
        Self {
            block_size: 1024,
            vocab_size: 50257,
            n_layers: 12,
            n_head: 12,
            n_embed: 768,
        }
    }

    /// Tiny configuration for testing/debugging
    pub fn tiny() -> Self {
        Self {
            block_size: 256,
            vocab_size: 1000,
            n_layers: 4,
            n_head: 4,
            n_embed: 128,
        }
    }

    /// Nano configuration - fastest for testing
    pub fn nano() -> Self {
        Self {
            block_size: 64,
            vocab_size: 256,
            n_layers: 2,
            n_head: 2,
            n_embed: 32,
        }
    }

    pub fn head_dim(&self) -> usize {
        self.n_embed / self.n_head
    }

    /// Total trainable parameter count. The output projection is tied to
    /// the token embedding and adds no parameters of its own.
    pub fn num_parameters(&self) -> usize {
        let c = self.n_embed;
        let embed_params = (self.vocab_size + self.block_size) * c;
        let attn_params = 3 * c * c + 3 * c + c * c + c;
        let mlp_params = 2 * (4 * c * c) + 5 * c;
        let norm_params = 2 * c;
        let layer_params = attn_params + mlp_params + 2 * norm_params;
        embed_params + self.n_layers * layer_params + norm_params
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_embed % self.n_head != 0 {
            return Err(Error::Config(format!(
                "n_embed ({}) must be divisible by n_head ({})",
                self.n_embed, self.n_head
            )));
        }
        Ok(())
    }

    pub fn from_json(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save_json(&self, path: &str) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Learning rate
    pub learning_rate: f64,
    /// Weight decay for AdamW
    pub weight_decay: f64,
    /// Adam beta1
    pub beta1: f64,
    /// Adam beta2
    pub beta2: f64,
    /// Batch size
    pub batch_size: usize,
    /// Sequence length for training
    pub seq_len: usize,
    /// Number of optimizer steps to run
    pub num_steps: usize,
    /// Log every N steps
    pub log_every: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 3e-4,
            weight_decay: 0.01,
            beta1: 0.9,
            beta2: 0.999,
            batch_size: 16,
            seq_len: 1024,
            num_steps: 50,
            log_every: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_are_valid() {
        assert!(ModelConfig::gpt2().validate().is_ok());
        assert!(ModelConfig::tiny().validate().is_ok());
        assert!(ModelConfig::nano().validate().is_ok());
    }

    #[test]
    fn test_bad_head_split_rejected() {
        let config = ModelConfig {
            n_embed: 10,
            n_head: 3,
            ..ModelConfig::nano()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_head_dim() {
        assert_eq!(ModelConfig::gpt2().head_dim(), 64);
    }
}
