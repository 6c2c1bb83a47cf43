use std::path::Path;
use std::time::Instant;

use candle_core::{DType, Device};
use candle_nn::optim::{AdamW, Optimizer, ParamsAdamW};
use candle_nn::{VarBuilder, VarMap};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use crate::config::{ModelConfig, TrainingConfig};
use crate::data::BatchSource;
use crate::error::{Error, Result};
use crate::model::GPT;

/// Owns the model, its variables, and the optimizer for one training run.
/// Construct it once at startup; there is no process-global state.
pub struct TrainingSession {
    model: GPT,
    optimizer: AdamW,
    var_map: VarMap,
    training_config: TrainingConfig,
    device: Device,
    global_step: usize,
}

impl TrainingSession {
    pub fn new(
        config: ModelConfig,
        training_config: TrainingConfig,
        device: Device,
    ) -> Result<Self> {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &device);
        let model = GPT::new(&config, vb)?;

        let params = ParamsAdamW {
            lr: training_config.learning_rate,
            beta1: training_config.beta1,
            beta2: training_config.beta2,
            weight_decay: training_config.weight_decay,
            eps: 1e-8,
        };
        let optimizer = AdamW::new(var_map.all_vars(), params)?;

        info!(
            "Initialized model with {} parameters",
            model.num_parameters()
        );

        Ok(Self {
            model,
            optimizer,
            var_map,
            training_config,
            device,
            global_step: 0,
        })
    }

    /// Runs the configured number of optimizer steps over `source`,
    /// returning the last observed loss. Each step fetches one batch, runs
    /// the forward pass with targets, backpropagates, and applies one
    /// optimizer update.
    pub fn run(&mut self, source: &mut BatchSource) -> Result<f64> {
        let num_steps = self.training_config.num_steps;
        let pb = ProgressBar::new(num_steps as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} loss: {msg}")
                .unwrap()
                .progress_chars("##-"),
        );

        let mut last_loss = f64::NAN;
        for _ in 0..num_steps {
            let t0 = Instant::now();
            let (inputs, targets) = source.next_batch(&self.device)?;

            let (_logits, loss) = self.model.forward(&inputs, Some(&targets))?;
            let Some(loss) = loss else {
                return Err(Error::Shape(
                    "forward pass returned no loss for a labeled batch".to_string(),
                ));
            };

            // backward_step zeroes gradients, backpropagates, and applies
            // the update in one call.
            self.optimizer.backward_step(&loss)?;

            let loss_value = loss.to_scalar::<f32>()? as f64;
            let dt_ms = t0.elapsed().as_secs_f64() * 1000.0;
            last_loss = loss_value;
            self.global_step += 1;

            if self.global_step % self.training_config.log_every == 0 {
                info!(
                    "step {} loss: {:.4} time: {:.1}ms",
                    self.global_step, loss_value, dt_ms
                );
                pb.set_message(format!("{:.4}", loss_value));
            }
            pb.inc(1);
        }

        pb.finish_with_message("done");
        Ok(last_loss)
    }

    pub fn save_checkpoint<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.var_map.save(path)?;
        Ok(())
    }

    pub fn load_checkpoint<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.var_map.load(path)?;
        Ok(())
    }

    pub fn model(&self) -> &GPT {
        &self.model
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }
}
