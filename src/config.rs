use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::baseline::BaselineConfig;
use crate::dataset::OverflowPolicy;
use crate::decoding::DecodingConfig;
use crate::engine::EngineConfig;
use crate::error::{QgError, Result};
use crate::scheduler::MixturePolicy;
use crate::tokenizer::DEFAULT_VOCAB_SIZE;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub batch_size: usize,
    /// Fixed number of batches per epoch; derived from the data when unset.
    pub batches_per_epoch: Option<usize>,
    pub gradient_accumulation_steps: usize,
    pub seed: u64,
    pub mixture: MixturePolicy,
    pub max_input_length: usize,
    pub max_output_length: usize,
    /// Truncate over-long training pairs or leave them out.
    pub overflow: OverflowPolicy,
    pub vocab_size: usize,
    pub checkpoint_dir: PathBuf,
    /// Evaluate every n-th epoch. The last epoch is always evaluated when
    /// evaluation data is given.
    pub eval_every: Option<usize>,
    pub eval_decoding: DecodingConfig,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 3,
            batch_size: 8,
            batches_per_epoch: None,
            gradient_accumulation_steps: 1,
            seed: 42,
            mixture: MixturePolicy::default(),
            max_input_length: 512,
            max_output_length: 32,
            overflow: OverflowPolicy::Truncate,
            vocab_size: DEFAULT_VOCAB_SIZE,
            checkpoint_dir: PathBuf::from("checkpoints"),
            eval_every: None,
            eval_decoding: DecodingConfig::default(),
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(QgError::config("epochs must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(QgError::config("batch_size must be at least 1"));
        }
        if self.batches_per_epoch == Some(0) {
            return Err(QgError::config("batches_per_epoch must be positive when set"));
        }
        if self.gradient_accumulation_steps == 0 {
            return Err(QgError::config("gradient_accumulation_steps must be at least 1"));
        }
        if self.max_input_length == 0 || self.max_output_length == 0 {
            return Err(QgError::config("sequence length limits must be positive"));
        }
        if self.eval_every == Some(0) {
            return Err(QgError::config("eval_every must be positive when set"));
        }
        self.mixture.validate()?;
        self.eval_decoding.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServingConfig {
    /// Repository alias (`org/name`) or checkpoint directory.
    pub model: String,
    pub model_cache_dir: PathBuf,
    pub max_input_length: usize,
    pub request_timeout_ms: Option<u64>,
    pub decoding: DecodingConfig,
}

impl Default for ServingConfig {
    fn default() -> Self {
        Self {
            model: "checkpoints/epoch-0003".to_string(),
            model_cache_dir: PathBuf::from("models"),
            max_input_length: 512,
            request_timeout_ms: Some(30_000),
            decoding: DecodingConfig::default(),
        }
    }
}

impl ServingConfig {
    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            max_input_length: self.max_input_length,
        }
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub training: TrainingConfig,
    pub baseline: BaselineConfig,
    pub serving: ServingConfig,
}

impl AppConfig {
    /// Defaults, then the TOML file, then `MULTIQG_*` variables with `__`
    /// between nested keys (`MULTIQG_TRAINING__EPOCHS=5`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults =
            Config::try_from(&AppConfig::default()).map_err(|e| QgError::config(e.to_string()))?;
        let mut builder = Config::builder().add_source(defaults);
        if let Some(path) = path {
            if !path.exists() {
                return Err(QgError::config(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            }
            builder = builder.add_source(File::from(path));
        }
        builder = builder.add_source(
            Environment::with_prefix("MULTIQG")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| QgError::config(e.to_string()))?;
        config.training.validate()?;
        config.serving.decoding.validate()?;
        Ok(config)
    }
}
