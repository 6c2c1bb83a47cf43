use candle_core::Tensor;
use candle_nn::{layer_norm, Embedding, Init, LayerNorm, Linear, Module, VarBuilder};

use crate::config::ModelConfig;
use crate::error::{Error, Result};

const LAYER_NORM_EPS: f64 = 1e-5;
const INIT_STD: f64 = 0.02;

/// Distinguishes projections that write into the residual stream, which
/// receive a depth-compensated initialization std.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinearRole {
    Standard,
    ResidualOutput,
}

fn init_linear(
    in_dim: usize,
    out_dim: usize,
    bias: bool,
    role: LinearRole,
    n_layers: usize,
    vb: VarBuilder,
) -> Result<Linear> {
    let stdev = match role {
        LinearRole::Standard => INIT_STD,
        LinearRole::ResidualOutput => INIT_STD + (2.0 * n_layers as f64).powf(-0.5),
    };
    let weight = vb.get_with_hints(
        (out_dim, in_dim),
        "weight",
        Init::Randn { mean: 0.0, stdev },
    )?;
    let bias = if bias {
        Some(vb.get_with_hints(out_dim, "bias", Init::Const(0.0))?)
    } else {
        None
    };
    Ok(Linear::new(weight, bias))
}

fn masked_fill(on_false: &Tensor, mask: &Tensor, on_true: f32) -> candle_core::Result<Tensor> {
    let shape = on_false.shape();
    let mask = mask.broadcast_as(shape.dims())?;
    let on_true = Tensor::new(on_true, on_false.device())?.broadcast_as(shape.dims())?;
    mask.where_cond(&on_true, on_false)
}

/// Multi-head scaled dot-product attention with a precomputed causal mask.
pub struct CausalSelfAttention {
    c_attn: Linear,
    c_proj: Linear,
    n_head: usize,
    n_embed: usize,
    block_size: usize,
    // [block_size, block_size] u8, 1 above the diagonal (future positions)
    mask: Tensor,
}

impl CausalSelfAttention {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let c_attn = init_linear(
            config.n_embed,
            3 * config.n_embed,
            true,
            LinearRole::Standard,
            config.n_layers,
            vb.pp("c_attn"),
        )?;
        let c_proj = init_linear(
            config.n_embed,
            config.n_embed,
            true,
            LinearRole::ResidualOutput,
            config.n_layers,
            vb.pp("c_proj"),
        )?;

        let bs = config.block_size;
        let mut mask_data = vec![0u8; bs * bs];
        for i in 0..bs {
            for j in (i + 1)..bs {
                mask_data[i * bs + j] = 1;
            }
        }
        let mask = Tensor::from_vec(mask_data, (bs, bs), vb.device())?;

        Ok(Self {
            c_attn,
            c_proj,
            n_head: config.n_head,
            n_embed: config.n_embed,
            block_size: config.block_size,
            mask,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (batch_size, seq_len, _) = x.dims3()?;
        if seq_len > self.block_size {
            return Err(Error::Shape(format!(
                "sequence length {} exceeds block size {}",
                seq_len, self.block_size
            )));
        }
        let head_dim = self.n_embed / self.n_head;

        let qkv = self.c_attn.forward(x)?;
        let q = qkv.narrow(2, 0, self.n_embed)?;
        let k = qkv.narrow(2, self.n_embed, self.n_embed)?;
        let v = qkv.narrow(2, 2 * self.n_embed, self.n_embed)?;

        let q = q
            .reshape((batch_size, seq_len, self.n_head, head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = k
            .reshape((batch_size, seq_len, self.n_head, head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = v
            .reshape((batch_size, seq_len, self.n_head, head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let scale = 1.0 / (head_dim as f64).sqrt();
        let k_t = k.transpose(2, 3)?.contiguous()?;
        let att = q.matmul(&k_t)?.affine(scale, 0.0)?;

        let mask = self.mask.narrow(0, 0, seq_len)?.narrow(1, 0, seq_len)?;
        let att = masked_fill(&att, &mask, f32::NEG_INFINITY)?;
        let att = candle_nn::ops::softmax_last_dim(&att)?;

        let y = att.matmul(&v)?;
        let y = y
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch_size, seq_len, self.n_embed))?;
        Ok(self.c_proj.forward(&y)?)
    }
}

/// Position-wise feed-forward: Linear(C -> 4C), tanh-approximated GELU,
/// Linear(4C -> C).
pub struct Mlp {
    c_fc: Linear,
    c_proj: Linear,
}

impl Mlp {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let c_fc = init_linear(
            config.n_embed,
            4 * config.n_embed,
            true,
            LinearRole::Standard,
            config.n_layers,
            vb.pp("c_fc"),
        )?;
        let c_proj = init_linear(
            4 * config.n_embed,
            config.n_embed,
            true,
            LinearRole::ResidualOutput,
            config.n_layers,
            vb.pp("c_proj"),
        )?;
        Ok(Self { c_fc, c_proj })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.c_fc.forward(x)?;
        let x = x.gelu()?;
        Ok(self.c_proj.forward(&x)?)
    }
}

/// Pre-norm transformer block. Output shape always equals input shape, so
/// blocks stack uniformly.
pub struct Block {
    ln_1: LayerNorm,
    attn: CausalSelfAttention,
    ln_2: LayerNorm,
    mlp: Mlp,
}

impl Block {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let ln_1 = layer_norm(config.n_embed, LAYER_NORM_EPS, vb.pp("ln_1"))?;
        let attn = CausalSelfAttention::new(config, vb.pp("attn"))?;
        let ln_2 = layer_norm(config.n_embed, LAYER_NORM_EPS, vb.pp("ln_2"))?;
        let mlp = Mlp::new(config, vb.pp("mlp"))?;
        Ok(Self {
            ln_1,
            attn,
            ln_2,
            mlp,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = (x + self.attn.forward(&self.ln_1.forward(x)?)?)?;
        let x = (&x + self.mlp.forward(&self.ln_2.forward(&x)?)?)?;
        Ok(x)
    }
}

/// GPT-2-style language model: token + position embeddings, a stack of
/// pre-norm blocks, a final layer norm, and an output projection tied to
/// the token embedding.
pub struct GPT {
    wte: Embedding,
    wpe: Embedding,
    blocks: Vec<Block>,
    ln_f: LayerNorm,
    lm_head: Linear,
    config: ModelConfig,
}

impl GPT {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;

        let wte_weight = vb.get_with_hints(
            (config.vocab_size, config.n_embed),
            "wte.weight",
            Init::Randn {
                mean: 0.0,
                stdev: INIT_STD,
            },
        )?;
        let wte = Embedding::new(wte_weight.clone(), config.n_embed);
        let wpe_weight = vb.get_with_hints(
            (config.block_size, config.n_embed),
            "wpe.weight",
            Init::Randn {
                mean: 0.0,
                stdev: INIT_STD,
            },
        )?;
        let wpe = Embedding::new(wpe_weight, config.n_embed);

        let mut blocks = Vec::with_capacity(config.n_layers);
        for i in 0..config.n_layers {
            blocks.push(Block::new(config, vb.pp(format!("h.{}", i)))?);
        }
        let ln_f = layer_norm(config.n_embed, LAYER_NORM_EPS, vb.pp("ln_f"))?;

        // Weight tying: the output projection shares the token embedding's
        // storage, so one gradient step moves both.
        let lm_head = Linear::new(wte_weight, None);

        Ok(Self {
            wte,
            wpe,
            blocks,
            ln_f,
            lm_head,
            config: config.clone(),
        })
    }

    /// Runs the model over a `[B, T]` batch of token ids. When targets are
    /// supplied, also returns the mean cross-entropy loss over all B*T
    /// positions.
    pub fn forward(
        &self,
        idx: &Tensor,
        targets: Option<&Tensor>,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let (_batch_size, seq_len) = idx.dims2()?;
        if seq_len > self.config.block_size {
            return Err(Error::Shape(format!(
                "sequence length {} exceeds block size {}",
                seq_len, self.config.block_size
            )));
        }

        let pos = Tensor::arange(0u32, seq_len as u32, idx.device())?;
        let tok_emb = self.wte.forward(idx)?;
        let pos_emb = self.wpe.forward(&pos)?;
        let mut x = tok_emb.broadcast_add(&pos_emb)?;

        for block in &self.blocks {
            x = block.forward(&x)?;
        }

        let x = self.ln_f.forward(&x)?;
        let logits = self.lm_head.forward(&x)?;

        let loss = match targets {
            Some(targets) => Some(cross_entropy_loss(&logits, targets)?),
            None => None,
        };
        Ok((logits, loss))
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn token_embedding(&self) -> &Tensor {
        self.wte.embeddings()
    }

    pub fn lm_head_weight(&self) -> &Tensor {
        self.lm_head.weight()
    }

    pub fn num_parameters(&self) -> usize {
        self.config.num_parameters()
    }
}

pub fn cross_entropy_loss(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let (batch_size, seq_len, vocab_size) = logits.dims3()?;
    let logits = logits.reshape((batch_size * seq_len, vocab_size))?;
    let targets = targets.reshape((batch_size * seq_len,))?;
    Ok(candle_nn::loss::cross_entropy(&logits, &targets)?)
}

/// Last-position logits of a `[B, T, vocab]` tensor, shape `[B, vocab]`.
pub fn last_position_logits(logits: &Tensor) -> Result<Tensor> {
    let (_, seq_len, _) = logits.dims3()?;
    Ok(logits.narrow(1, seq_len - 1, 1)?.squeeze(1)?.contiguous()?)
}
