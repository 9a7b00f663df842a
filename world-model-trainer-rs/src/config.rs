//! Configuration types for latent-dynamics training.
//!
//! The configuration is split into the same four sections a training run is
//! described by: the experiment (data, batch shape, optimizer, epochs), the
//! model, the truncated-BPTT runner, and logging/checkpointing.
//!
//! # Overview
//!
//! - **Serializable** - Load/save configurations from TOML files
//! - **Validated** - Invalid knobs are rejected before any epoch runs
//! - **Defaulted** - Every field has a default, so partial files work
//!
//! # Example
//!
//! ```rust
//! use world_model_trainer_rs::config::TrainerConfig;
//!
//! let config = TrainerConfig::builder()
//!     .batch_size(16)
//!     .tbptt_stride(4)
//!     .max_epochs(20)
//!     .build();
//!
//! assert!(config.validate().is_ok());
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, WorldModelError};

/// Main configuration for a training run.
///
/// | Parameter | Default | Description |
/// |-----------|---------|-------------|
/// | `experiment.batch_size` | 32 | Chunks per batch |
/// | `experiment.sequence_length` | 32 | Timesteps per chunk |
/// | `experiment.learning_rate` | 1e-3 | Adam learning rate |
/// | `experiment.max_epochs` | 10 | Train/validation rounds |
/// | `trainer.tbptt_stride` | 1 | Steps per truncation window |
/// | `logging.scalar_log_frequency` | 10 | Global steps between log events |
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainerConfig {
    /// Data, batch shape, optimizer and epoch settings.
    #[serde(default)]
    pub experiment: ExperimentConfig,

    /// Latent-dynamics model settings.
    #[serde(default)]
    pub model: ModelConfig,

    /// Truncated-BPTT runner settings.
    #[serde(default)]
    pub trainer: RunnerConfig,

    /// Logging and checkpoint settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Experiment parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Number of sequence chunks stacked into one batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Number of timesteps in one chunk.
    #[serde(default = "default_sequence_length")]
    pub sequence_length: usize,

    /// Adam learning rate.
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    /// Number of epochs to run.
    #[serde(default = "default_max_epochs")]
    pub max_epochs: usize,

    /// Seed for model initialization, shuffling and latent resampling.
    #[serde(default = "default_manual_seed")]
    pub manual_seed: u64,

    /// Path to the VAE-preprocessed episode file (JSON).
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,

    /// Fraction of episodes held out for validation (taken from the tail).
    #[serde(default = "default_val_fraction")]
    pub val_fraction: f64,
}

fn default_batch_size() -> usize {
    32
}
fn default_sequence_length() -> usize {
    32
}
fn default_learning_rate() -> f64 {
    1e-3
}
fn default_max_epochs() -> usize {
    10
}
fn default_manual_seed() -> u64 {
    1010
}
fn default_data_path() -> PathBuf {
    PathBuf::from("./data/episodes.json")
}
fn default_val_fraction() -> f64 {
    0.1
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            sequence_length: default_sequence_length(),
            learning_rate: default_learning_rate(),
            max_epochs: default_max_epochs(),
            manual_seed: default_manual_seed(),
            data_path: default_data_path(),
            val_fraction: default_val_fraction(),
        }
    }
}

/// Model parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Registry name of the model, e.g. `lstm_mse` or `lstm_bce`.
    #[serde(default = "default_model_name")]
    pub name: String,

    /// Width of the recurrent state.
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,

    /// Dimension of the VAE latent space.
    #[serde(default = "default_latent_size")]
    pub latent_size: usize,

    /// Dimension of the action vector.
    #[serde(default = "default_action_size")]
    pub action_size: usize,
}

fn default_model_name() -> String {
    "lstm_mse".into()
}
fn default_hidden_size() -> usize {
    256
}
fn default_latent_size() -> usize {
    32
}
fn default_action_size() -> usize {
    3
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: default_model_name(),
            hidden_size: default_hidden_size(),
            latent_size: default_latent_size(),
            action_size: default_action_size(),
        }
    }
}

/// Truncated-BPTT runner parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Number of steps per truncation window. Must be > 0.
    #[serde(default = "default_tbptt_stride")]
    pub tbptt_stride: usize,

    /// Whether to draw a progress bar during passes.
    #[serde(default = "default_show_progress")]
    pub show_progress: bool,
}

fn default_tbptt_stride() -> usize {
    1
}
fn default_show_progress() -> bool {
    true
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            tbptt_stride: default_tbptt_stride(),
            show_progress: default_show_progress(),
        }
    }
}

/// Logging and checkpoint parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Root directory for versioned run directories.
    #[serde(default = "default_base_save_dir")]
    pub base_save_dir: PathBuf,

    /// Debug mode: no metrics sink, no checkpoints, anomaly detection on.
    #[serde(default)]
    pub debug: bool,

    /// Whether to persist checkpoints at the end of every epoch.
    #[serde(default = "default_save_model_checkpoints")]
    pub save_model_checkpoints: bool,

    /// Number of global steps between scalar log events.
    #[serde(default = "default_scalar_log_frequency")]
    pub scalar_log_frequency: usize,
}

fn default_base_save_dir() -> PathBuf {
    PathBuf::from("./logs/mdn-rnn")
}
fn default_save_model_checkpoints() -> bool {
    true
}
fn default_scalar_log_frequency() -> usize {
    10
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            base_save_dir: default_base_save_dir(),
            debug: false,
            save_model_checkpoints: default_save_model_checkpoints(),
            scalar_log_frequency: default_scalar_log_frequency(),
        }
    }
}

impl TrainerConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> TrainerConfigBuilder {
        TrainerConfigBuilder::default()
    }

    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Ok(toml::from_str(&content)?)
    }

    /// Saves configuration to a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or writing fails.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }

    /// Pretty JSON rendering, recorded as run metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_pretty_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Whether checkpoints are written for this run.
    #[must_use]
    pub fn checkpoints_enabled(&self) -> bool {
        self.logging.save_model_checkpoints && !self.logging.debug
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`WorldModelError::Config`] naming the first invalid knob.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("trainer.tbptt_stride", self.trainer.tbptt_stride),
            ("experiment.max_epochs", self.experiment.max_epochs),
            ("experiment.batch_size", self.experiment.batch_size),
            ("experiment.sequence_length", self.experiment.sequence_length),
            ("logging.scalar_log_frequency", self.logging.scalar_log_frequency),
            ("model.hidden_size", self.model.hidden_size),
            ("model.latent_size", self.model.latent_size),
            ("model.action_size", self.model.action_size),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(WorldModelError::Config(format!("{name} must be > 0")));
            }
        }

        if !(self.experiment.learning_rate > 0.0 && self.experiment.learning_rate.is_finite()) {
            return Err(WorldModelError::Config(
                "experiment.learning_rate must be a positive finite number".to_string(),
            ));
        }

        let val_fraction = self.experiment.val_fraction;
        if !(val_fraction > 0.0 && val_fraction < 1.0) {
            return Err(WorldModelError::Config(
                "experiment.val_fraction must be in (0, 1)".to_string(),
            ));
        }

        crate::model::ModelKind::from_name(&self.model.name)?;

        Ok(())
    }
}

/// Builder for [`TrainerConfig`].
#[derive(Debug, Default)]
pub struct TrainerConfigBuilder {
    config: TrainerConfig,
}

impl TrainerConfigBuilder {
    /// Sets the batch size.
    #[must_use]
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.config.experiment.batch_size = batch_size;
        self
    }

    /// Sets the chunk length in timesteps.
    #[must_use]
    pub fn sequence_length(mut self, length: usize) -> Self {
        self.config.experiment.sequence_length = length;
        self
    }

    /// Sets the learning rate.
    #[must_use]
    pub fn learning_rate(mut self, lr: f64) -> Self {
        self.config.experiment.learning_rate = lr;
        self
    }

    /// Sets the number of epochs.
    #[must_use]
    pub fn max_epochs(mut self, epochs: usize) -> Self {
        self.config.experiment.max_epochs = epochs;
        self
    }

    /// Sets the seed.
    #[must_use]
    pub fn manual_seed(mut self, seed: u64) -> Self {
        self.config.experiment.manual_seed = seed;
        self
    }

    /// Sets the validation fraction.
    #[must_use]
    pub fn val_fraction(mut self, fraction: f64) -> Self {
        self.config.experiment.val_fraction = fraction;
        self
    }

    /// Sets the episode file path.
    #[must_use]
    pub fn data_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.experiment.data_path = path.into();
        self
    }

    /// Sets the model registry name.
    #[must_use]
    pub fn model_name(mut self, name: impl Into<String>) -> Self {
        self.config.model.name = name.into();
        self
    }

    /// Sets the recurrent width.
    #[must_use]
    pub fn hidden_size(mut self, size: usize) -> Self {
        self.config.model.hidden_size = size;
        self
    }

    /// Sets the latent and action dimensions.
    #[must_use]
    pub fn dims(mut self, latent_size: usize, action_size: usize) -> Self {
        self.config.model.latent_size = latent_size;
        self.config.model.action_size = action_size;
        self
    }

    /// Sets the truncation stride.
    #[must_use]
    pub fn tbptt_stride(mut self, stride: usize) -> Self {
        self.config.trainer.tbptt_stride = stride;
        self
    }

    /// Enables or disables the progress bar.
    #[must_use]
    pub fn show_progress(mut self, show: bool) -> Self {
        self.config.trainer.show_progress = show;
        self
    }

    /// Sets the run directory root.
    #[must_use]
    pub fn base_save_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.logging.base_save_dir = dir.into();
        self
    }

    /// Sets debug mode.
    #[must_use]
    pub fn debug(mut self, debug: bool) -> Self {
        self.config.logging.debug = debug;
        self
    }

    /// Enables or disables checkpoint persistence.
    #[must_use]
    pub fn save_model_checkpoints(mut self, save: bool) -> Self {
        self.config.logging.save_model_checkpoints = save;
        self
    }

    /// Sets the scalar log frequency.
    #[must_use]
    pub fn scalar_log_frequency(mut self, frequency: usize) -> Self {
        self.config.logging.scalar_log_frequency = frequency;
        self
    }

    /// Builds the configuration. Call [`TrainerConfig::validate`] before use.
    #[must_use]
    pub fn build(self) -> TrainerConfig {
        self.config
    }
}
