//! Error types for minigpt

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid model configuration (e.g. head/embedding divisibility).
    #[error("config error: {0}")]
    Config(String),

    /// Tensor shape violation detected during a forward pass.
    #[error("shape error: {0}")]
    Shape(String),

    /// Pretrained checkpoint name or shape mismatch on import.
    #[error("pretrained weight mismatch: {0}")]
    Mismatch(String),

    /// Token buffer too short for a single batch window.
    #[error("insufficient data: need at least {needed} tokens, got {got}")]
    InsufficientData { needed: usize, got: usize },

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
