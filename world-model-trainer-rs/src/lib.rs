//! # world-model-trainer-rs
//!
//! Training of the recurrent latent-dynamics model ("M model") of a World
//! Models pipeline with truncated backpropagation through time.
//!
//! ## Overview
//!
//! Observations are encoded ahead of time by a frozen VAE into `(mu, log_var)`
//! pairs. The dynamics model, an LSTM over `concat(latent, action)`, learns to
//! predict the next latent and the reward. Episodes are independent
//! sequences: the recurrent state is carried across the batches of one
//! episode and reset between episodes, and gradients are truncated every
//! `tbptt_stride` steps.
//!
//! ```text
//!   episodes.json
//!        │  EpisodeDataset::split / into_sequence_source
//!        ▼
//!   SequenceSource ──► TbpttRunner ──────────────────────────────┐
//!   (train, val)        per sequence: reset state                │
//!                       per step:     resample z (FrozenEncoder) │
//!                                     forward + loss             │
//!                                     backward/step at boundary  │
//!                                     RunningStatistic update    │
//!                                     periodic log ─► MetricsSink
//!                                                                 │
//!   Trainer ◄── PassReport (avg loss, next global step) ◄─────────┘
//!      │
//!      ▼
//!   CheckpointPolicy ──► CheckpointStore (latest / best)
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use world_model_trainer_rs::config::TrainerConfig;
//! use world_model_trainer_rs::trainer::run_training;
//!
//! # fn main() -> world_model_trainer_rs::Result<()> {
//! let config = TrainerConfig::from_file("config.toml")?;
//! let summary = run_training(&config, None)?;
//! println!("best validation loss: {:?}", summary.best_val_loss);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`config`] - Training configuration and serialization
//! - [`error`] - Error types
//! - [`data`] - Host-side batches, sequence sources and the episode loader
//! - [`encoder`] - Latent resampling through the frozen VAE
//! - [`model`] - Latent-dynamics models and the LSTM implementation
//! - [`metrics`] - Running loss statistics
//! - [`sink`] - Destinations for log events
//! - [`runner`] - Truncated-BPTT train and validation passes
//! - [`checkpoint`] - Best-model tracking and checkpoint persistence
//! - [`trainer`] - Epoch orchestration

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]
// Allow precision loss casts - acceptable in ML numerical code
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::too_many_lines)]

// Core modules
pub mod config;
pub mod error;

// Data and models
pub mod data;
pub mod encoder;
pub mod model;

// Metrics and monitoring
pub mod metrics;
pub mod sink;

// Training loop
pub mod checkpoint;
pub mod runner;
pub mod trainer;

// Re-exports for convenient access
pub use checkpoint::{
    CheckpointMetadata, CheckpointPolicy, CheckpointRecord, CheckpointSlot, CheckpointStore,
    FileCheckpointStore, MemoryCheckpointStore,
};
pub use config::TrainerConfig;
pub use data::{
    EpisodeDataset, HostTensor, InMemorySequences, RewardTransform, SequenceSource,
    TransitionBatch,
};
pub use encoder::{FrozenEncoder, GaussianReparameterizer};
pub use error::{Result, WorldModelError};
pub use metrics::RunningStatistic;
pub use model::{
    DynamicsLoss, DynamicsOutput, LatentDynamicsModel, LstmDynamics, LstmDynamicsConfig,
    ModelKind, RecurrentState, RewardHead, RewardOutputMode,
};
pub use runner::{PassMode, PassReport, TbpttRunner};
pub use sink::{JsonlSink, MemorySink, MetricsSink, NullSink};
pub use trainer::{Trainer, TrainingSummary};

/// Prelude module for convenient imports.
///
/// ```
/// use world_model_trainer_rs::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        CheckpointPolicy, FrozenEncoder, GaussianReparameterizer, LatentDynamicsModel,
        LstmDynamicsConfig, MetricsSink, Result, SequenceSource, TbpttRunner, Trainer,
        TrainerConfig, TransitionBatch, WorldModelError,
    };
}
