//! Error types for latent-dynamics training.
//!
//! The training loop never catches or retries an error: every variant below is
//! surfaced to the caller of [`Trainer::fit`](crate::trainer::Trainer::fit) and
//! aborts the run after the current step.
//!
//! # Error Categories
//!
//! - **Configuration errors**: invalid knobs, rejected before any epoch runs
//! - **Data contract violations**: mismatched batch dimensions inside a step,
//!   empty sequence collections
//! - **Numerical divergence**: non-finite loss, only raised when anomaly
//!   detection is enabled
//! - **Capability mismatches**: a sequence source that cannot provide a
//!   feature the runner needs
//! - **I/O errors**: checkpoint, metrics and configuration files
//!
//! # Example
//!
//! ```rust
//! use world_model_trainer_rs::error::{Result, WorldModelError};
//!
//! fn check_stride(stride: usize) -> Result<()> {
//!     if stride == 0 {
//!         return Err(WorldModelError::Config("tbptt_stride must be > 0".to_string()));
//!     }
//!     Ok(())
//! }
//!
//! assert!(check_stride(0).is_err());
//! assert!(check_stride(4).is_ok());
//! ```

use thiserror::Error;

/// Result type alias for world-model training operations.
pub type Result<T> = std::result::Result<T, WorldModelError>;

/// Errors that can occur while training the latent-dynamics model.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum WorldModelError {
    /// Configuration error (invalid parameters or incompatible settings).
    #[error("configuration error: {0}")]
    Config(String),

    /// The data handed to the training loop breaks its contract.
    #[error("data contract violation: {0}")]
    DataContract(String),

    /// Non-finite loss observed while anomaly detection is enabled.
    #[error("non-finite loss {value} in sequence {sequence} at step {step}")]
    NumericalDivergence {
        /// Index of the sequence in the source.
        sequence: usize,
        /// Step index inside the sequence.
        step: usize,
        /// The offending loss value.
        value: f64,
    },

    /// A sequence source was asked for a capability it does not implement.
    #[error("unsupported by sequence source: {0}")]
    Unsupported(String),

    /// Checkpoint save or load failed.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid TOML configuration file.
    #[error("invalid config file: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// Configuration could not be serialized.
    #[error("failed to serialize config: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// Progress bar template error.
    #[error("template error: {0}")]
    Template(String),
}

impl From<indicatif::style::TemplateError> for WorldModelError {
    fn from(err: indicatif::style::TemplateError) -> Self {
        WorldModelError::Template(err.to_string())
    }
}

impl WorldModelError {
    /// Returns `true` for errors raised before training touched any state.
    #[must_use]
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_) | Self::TomlParse(_))
    }
}
