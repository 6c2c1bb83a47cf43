pub mod config;
pub mod data;
pub mod error;
pub mod generate;
pub mod io;
pub mod model;
pub mod pretrained;
pub mod tokenizer;
pub mod training;

pub use config::{ModelConfig, TrainingConfig};
pub use data::BatchSource;
pub use error::{Error, Result};
pub use generate::Sampler;
pub use model::GPT;
pub use tokenizer::Tokenizer;
pub use training::TrainingSession;
