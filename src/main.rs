use anyhow::Result;
use candle_core::Device;
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use minigpt::config::{ModelConfig, TrainingConfig};
use minigpt::data::BatchSource;
use minigpt::generate::{Sampler, DEFAULT_TOP_K};
use minigpt::model::GPT;
use minigpt::tokenizer::Tokenizer;
use minigpt::training::TrainingSession;

#[derive(Parser)]
#[command(name = "minigpt")]
#[command(about = "Train and sample GPT-2-style language models")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a model on a text corpus
    Train {
        /// Path to the training corpus (plain UTF-8 text, optionally .gz/.zst)
        #[arg(short, long)]
        data: String,

        /// Path to a tokenizer file, or a hub identifier such as "gpt2"
        #[arg(short, long, default_value = "gpt2")]
        tokenizer: String,

        /// Model configuration preset (nano, tiny, gpt2)
        #[arg(short, long, default_value = "gpt2")]
        model: String,

        /// Output directory for checkpoints
        #[arg(short, long, default_value = "checkpoints")]
        output: String,

        /// Learning rate
        #[arg(long, default_value = "3e-4")]
        lr: f64,

        /// Batch size
        #[arg(short, long, default_value = "16")]
        batch_size: usize,

        /// Sequence length
        #[arg(long, default_value = "1024")]
        seq_len: usize,

        /// Number of optimizer steps
        #[arg(long, default_value = "50")]
        steps: usize,

        /// Use GPU (Metal on macOS, CUDA on Linux/Windows)
        #[arg(long, default_value = "false")]
        gpu: bool,

        /// GPU device index
        #[arg(long, default_value = "0")]
        gpu_id: usize,
    },

    /// Generate text from a pretrained or trained model
    Generate {
        /// Path to a reference GPT-2 checkpoint (safetensors, HF naming)
        #[arg(long, conflicts_with = "checkpoint")]
        pretrained: Option<String>,

        /// Path to a checkpoint saved by `train`
        #[arg(short, long, requires = "config")]
        checkpoint: Option<String>,

        /// Path to the model config for --checkpoint
        #[arg(long)]
        config: Option<String>,

        /// Path to a tokenizer file, or a hub identifier such as "gpt2"
        #[arg(short, long, default_value = "gpt2")]
        tokenizer: String,

        /// Prompt text
        #[arg(short, long)]
        prompt: String,

        /// Number of sequences to sample
        #[arg(short, long, default_value = "5")]
        num_sequences: usize,

        /// Total sequence length (prompt included)
        #[arg(short, long, default_value = "30")]
        max_length: usize,

        /// Top-k cutoff
        #[arg(long, default_value_t = DEFAULT_TOP_K)]
        top_k: usize,

        /// Random seed
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Use GPU (Metal on macOS, CUDA on Linux/Windows)
        #[arg(long, default_value = "false")]
        gpu: bool,
    },

    /// Show model info
    Info {
        /// Model configuration preset
        #[arg(short, long, default_value = "gpt2")]
        model: String,
    },
}

#[allow(unused_variables)]
fn get_device(use_gpu: bool, gpu_id: usize) -> Result<Device> {
    if use_gpu {
        #[cfg(feature = "metal")]
        {
            return Ok(Device::new_metal(gpu_id)?);
        }
        #[cfg(feature = "cuda")]
        {
            return Ok(Device::new_cuda(gpu_id)?);
        }
        #[cfg(not(any(feature = "metal", feature = "cuda")))]
        {
            tracing::warn!(
                "No GPU feature enabled, using CPU. Build with --features metal or --features cuda"
            );
            return Ok(Device::Cpu);
        }
    }
    Ok(Device::Cpu)
}

fn get_config(name: &str) -> ModelConfig {
    match name {
        "nano" => ModelConfig::nano(),
        "tiny" => ModelConfig::tiny(),
        "gpt2" => ModelConfig::gpt2(),
        _ => {
            eprintln!("Unknown model config '{}', using gpt2", name);
            ModelConfig::gpt2()
        }
    }
}

fn load_tokenizer(path_or_id: &str) -> Result<Tokenizer> {
    if std::path::Path::new(path_or_id).exists() {
        Ok(Tokenizer::from_file(path_or_id)?)
    } else {
        Ok(Tokenizer::from_pretrained(path_or_id)?)
    }
}

fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Train {
            data,
            tokenizer: tokenizer_arg,
            model,
            output,
            lr,
            batch_size,
            seq_len,
            steps,
            gpu,
            gpu_id,
        } => {
            let device = get_device(gpu, gpu_id)?;
            info!("Using device: {:?}", device);

            let tokenizer = load_tokenizer(&tokenizer_arg)?;
            let mut config = get_config(&model);
            config.vocab_size = tokenizer.vocab_size();
            info!("Model config: {:?}", config);

            let mut source = BatchSource::from_file(&data, &tokenizer, batch_size, seq_len)?;
            info!("Corpus size: {} tokens", source.num_tokens());

            let training_config = TrainingConfig {
                learning_rate: lr,
                batch_size,
                seq_len,
                num_steps: steps,
                ..Default::default()
            };

            std::fs::create_dir_all(&output)?;

            let mut session = TrainingSession::new(config.clone(), training_config, device)?;
            let last_loss = session.run(&mut source)?;
            info!("Final loss: {:.4}", last_loss);

            config.save_json(&format!("{}/config.json", output))?;
            let checkpoint = format!("{}/model.safetensors", output);
            session.save_checkpoint(&checkpoint)?;
            info!("Saved checkpoint to {}", checkpoint);
        }

        Commands::Generate {
            pretrained,
            checkpoint,
            config: config_path,
            tokenizer: tokenizer_arg,
            prompt,
            num_sequences,
            max_length,
            top_k,
            seed,
            gpu,
        } => {
            let device = get_device(gpu, 0)?;
            info!("Using device: {:?}", device);

            let tokenizer = load_tokenizer(&tokenizer_arg)?;

            let (model, _var_map) = match (pretrained, checkpoint) {
                (Some(path), None) => {
                    info!("Loading pretrained weights from {}", path);
                    GPT::from_pretrained("gpt2", &path, &device)?
                }
                (None, Some(path)) => {
                    let config_path = config_path
                        .ok_or_else(|| anyhow::anyhow!("--checkpoint requires --config"))?;
                    let config = ModelConfig::from_json(&config_path)?;
                    let mut var_map = candle_nn::VarMap::new();
                    let vb = candle_nn::VarBuilder::from_varmap(
                        &var_map,
                        candle_core::DType::F32,
                        &device,
                    );
                    let model = GPT::new(&config, vb)?;
                    var_map.load(&path)?;
                    info!("Loaded model from {}", path);
                    (model, var_map)
                }
                _ => anyhow::bail!("provide exactly one of --pretrained or --checkpoint"),
            };

            let sampler = Sampler::new(&model, &device);
            let rows = sampler.sample_text(
                &tokenizer,
                &prompt,
                num_sequences,
                max_length,
                top_k,
                seed,
            )?;
            for row in rows {
                println!("> {}", row);
            }
        }

        Commands::Info { model } => {
            let config = get_config(&model);
            println!("Model: {}", model);
            println!("  Block size: {}", config.block_size);
            println!("  Vocab size: {}", config.vocab_size);
            println!("  Num layers: {}", config.n_layers);
            println!("  Num heads: {}", config.n_head);
            println!("  Embedding dim: {}", config.n_embed);
            println!("  Head dimension: {}", config.head_dim());
            println!(
                "  Parameters: {} ({:.2}M)",
                config.num_parameters(),
                config.num_parameters() as f64 / 1_000_000.0
            );
        }
    }

    Ok(())
}
