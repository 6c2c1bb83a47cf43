use std::path::Path;

use candle_core::{DType, Device, Tensor};

use crate::error::{Error, Result};
use crate::io;
use crate::tokenizer::Tokenizer;

/// Slices a flat token stream into fixed-shape `[B, T]` input/target
/// minibatches, wrapping around to the start when the remaining tail is
/// shorter than one window.
pub struct BatchSource {
    tokens: Vec<u32>,
    batch_size: usize,
    seq_len: usize,
    cursor: usize,
}

impl BatchSource {
    pub fn from_tokens(tokens: Vec<u32>, batch_size: usize, seq_len: usize) -> Result<Self> {
        let needed = batch_size * seq_len + 1;
        if tokens.len() < needed {
            return Err(Error::InsufficientData {
                needed,
                got: tokens.len(),
            });
        }
        Ok(Self {
            tokens,
            batch_size,
            seq_len,
            cursor: 0,
        })
    }

    /// Reads the whole corpus file into memory and tokenizes it once.
    pub fn from_file<P: AsRef<Path>>(
        path: P,
        tokenizer: &Tokenizer,
        batch_size: usize,
        seq_len: usize,
    ) -> Result<Self> {
        let text = io::read_to_string(path)?;
        let tokens = tokenizer.encode(&text)?;
        Self::from_tokens(tokens, batch_size, seq_len)
    }

    /// Returns the next `([B, T], [B, T])` (inputs, targets) pair; targets
    /// are inputs shifted one position forward. Advances the cursor by B*T
    /// and resets it to 0 once the next window would overrun the buffer.
    pub fn next_batch(&mut self, device: &Device) -> Result<(Tensor, Tensor)> {
        let window = self.batch_size * self.seq_len;
        let buf = &self.tokens[self.cursor..self.cursor + window + 1];

        let inputs = Tensor::from_slice(&buf[..window], (self.batch_size, self.seq_len), device)?
            .to_dtype(DType::U32)?;
        let targets = Tensor::from_slice(&buf[1..], (self.batch_size, self.seq_len), device)?
            .to_dtype(DType::U32)?;

        self.cursor += window;
        if self.cursor + window + 1 > self.tokens.len() {
            self.cursor = 0;
        }

        Ok((inputs, targets))
    }

    pub fn num_tokens(&self) -> usize {
        self.tokens.len()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }
}
