//! Epoch orchestration.
//!
//! ```text
//! Init ─► [ TrainPass ─► ValidationPass ─► CheckpointDecision ] × max_epochs ─► Done
//! ```
//!
//! [`Trainer::fit`] is generic over the model, optimizer, encoder and data
//! sources. [`run_training`] wires the concrete pieces together for the
//! command line: episode file, LSTM model, Adam, versioned run directory and
//! file checkpoints.

use burn::backend::{Autodiff, NdArray};
use burn::module::AutodiffModule;
use burn::optim::{AdamConfig, Optimizer};
use burn::tensor::backend::{AutodiffBackend, Backend};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::checkpoint::{
    load_checkpoint_dir, CheckpointPolicy, CheckpointStore, FileCheckpointStore,
};
use crate::config::TrainerConfig;
use crate::data::{EpisodeDataset, RewardTransform, SequenceSource};
use crate::encoder::{FrozenEncoder, GaussianReparameterizer};
use crate::error::{Result, WorldModelError};
use crate::model::{LatentDynamicsModel, LstmDynamics, LstmDynamicsConfig};
use crate::runner::TbpttRunner;
use crate::sink::{JsonlSink, MetricsSink, NullSink};

/// Backend used by the command line.
pub type DefaultBackend = Autodiff<NdArray>;

/// File name of the configuration copy inside a run directory.
pub const CONFIG_COPY_FILE: &str = "config.toml";

/// Losses of one epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochSummary {
    /// Epoch number, starting at 0.
    pub epoch: usize,
    /// Average training loss.
    pub train_loss: f64,
    /// Average validation loss.
    pub val_loss: f64,
    /// Whether the validation loss was the best so far.
    pub is_best: bool,
}

/// Outcome of [`Trainer::fit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSummary {
    /// Number of completed epochs.
    pub epochs_completed: usize,
    /// Validation loss of the last epoch.
    pub final_val_loss: Option<f64>,
    /// Lowest validation loss.
    pub best_val_loss: Option<f64>,
    /// Next global step of the training pass counter.
    pub train_log_steps: u64,
    /// Next global step of the validation pass counter.
    pub val_log_steps: u64,
    /// Per-epoch losses.
    pub epochs: Vec<EpochSummary>,
}

/// Alternates training and validation passes for a fixed number of epochs.
#[derive(Debug, Clone)]
pub struct Trainer<B: Backend> {
    config: TrainerConfig,
    runner: TbpttRunner,
    device: B::Device,
}

impl<B: AutodiffBackend> Trainer<B> {
    /// Creates a trainer from a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`WorldModelError::Config`] if the configuration is invalid.
    pub fn new(config: TrainerConfig, device: B::Device) -> Result<Self> {
        config.validate()?;
        let runner = TbpttRunner::new(
            config.trainer.tbptt_stride,
            config.logging.scalar_log_frequency,
            config.experiment.learning_rate,
        )?
        .with_anomaly_detection(config.logging.debug)
        .with_progress(config.trainer.show_progress);

        Ok(Self {
            config,
            runner,
            device,
        })
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    /// The device passes run on.
    #[must_use]
    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// Runs `max_epochs` epochs and returns the trained model and optimizer.
    ///
    /// # Errors
    ///
    /// Returns [`WorldModelError::DataContract`] before the first epoch if
    /// either source has no sequences. Any pass, sink or checkpoint error
    /// aborts the run.
    #[allow(clippy::too_many_arguments)]
    pub fn fit<M, O, E, T, V, C>(
        &self,
        mut model: M,
        mut optimizer: O,
        encoder: &E,
        train: &T,
        val: &V,
        sink: &mut dyn MetricsSink,
        policy: &mut CheckpointPolicy<C>,
        rng: &mut StdRng,
    ) -> Result<(M, O, TrainingSummary)>
    where
        M: AutodiffModule<B> + LatentDynamicsModel<B>,
        M::InnerModule: LatentDynamicsModel<B::InnerBackend>,
        O: Optimizer<M, B>,
        E: FrozenEncoder,
        T: SequenceSource + ?Sized,
        V: SequenceSource + ?Sized,
        C: CheckpointStore,
    {
        require_sequences(train, "training")?;
        require_sequences(val, "validation")?;

        let debug = self.config.logging.debug;
        let max_epochs = self.config.experiment.max_epochs;

        if !debug {
            sink.record_text("Hyperparameter", &self.config.to_pretty_json()?, 0)?;
        }

        tracing::info!(
            max_epochs,
            train_sequences = train.num_sequences(),
            val_sequences = val.num_sequences(),
            tbptt_stride = self.runner.stride(),
            checkpoints = policy.is_enabled(),
            "starting training"
        );

        let mut train_step = 0;
        let mut val_step = 0;
        let mut epochs = Vec::with_capacity(max_epochs);

        for epoch in 0..max_epochs {
            let (trained, train_report) = self.runner.train_pass::<B, _, _, _, _, _>(
                model,
                &mut optimizer,
                encoder,
                train,
                &self.device,
                epoch,
                train_step,
                sink,
                rng,
            )?;
            model = trained;
            train_step = train_report.next_global_step;

            let val_report = self.runner.eval_pass::<B, _, _, _, _>(
                &model,
                encoder,
                val,
                &self.device,
                epoch,
                val_step,
                sink,
                rng,
            )?;
            val_step = val_report.next_global_step;

            let is_best =
                policy.consider::<B, M, O>(epoch, val_report.average_loss, &model, &optimizer)?;
            sink.flush()?;

            tracing::info!(
                "epoch {}/{}: loss={:.4} val_loss={:.4}{}",
                epoch + 1,
                max_epochs,
                train_report.average_loss,
                val_report.average_loss,
                if is_best { " (best)" } else { "" }
            );

            epochs.push(EpochSummary {
                epoch,
                train_loss: train_report.average_loss,
                val_loss: val_report.average_loss,
                is_best,
            });
        }

        let summary = TrainingSummary {
            epochs_completed: epochs.len(),
            final_val_loss: epochs.last().map(|e| e.val_loss),
            best_val_loss: policy.current_best(),
            train_log_steps: train_step,
            val_log_steps: val_step,
            epochs,
        };

        if !debug {
            let hparams = serde_json::json!({
                "final_val_loss": summary.final_val_loss,
                "best_val_loss": summary.best_val_loss,
            });
            sink.record_text("hparams", &hparams.to_string(), val_step)?;
            sink.flush()?;
        }

        Ok((model, optimizer, summary))
    }
}

/// Trains an LSTM dynamics model end to end from a configuration.
///
/// Loads the episode file, splits it, builds the model and optimizer
/// (optionally restoring them from a checkpoint slot directory), opens a
/// versioned run directory unless `debug` is set, and runs [`Trainer::fit`].
///
/// # Errors
///
/// Returns an error if any stage fails.
pub fn run_training(config: &TrainerConfig, resume: Option<&Path>) -> Result<TrainingSummary> {
    config.validate()?;
    let device = <DefaultBackend as Backend>::Device::default();
    let seed = config.experiment.manual_seed;
    DefaultBackend::seed(seed);
    let mut rng = StdRng::seed_from_u64(seed);

    let model_config = LstmDynamicsConfig::from_model_config(&config.model)?;
    let mut model = model_config.init::<DefaultBackend>(&device);
    let mut optimizer = AdamConfig::new().init::<DefaultBackend, LstmDynamics<DefaultBackend>>();

    if let Some(dir) = resume {
        let (restored_model, restored_optimizer, metadata) =
            load_checkpoint_dir::<DefaultBackend, _, _>(dir, model, optimizer, &device)?;
        model = restored_model;
        optimizer = restored_optimizer;
        tracing::info!(epoch = metadata.epoch, "resuming from {}", dir.display());
    }

    let dataset = EpisodeDataset::from_file(&config.experiment.data_path)?;
    check_dims(&dataset, config)?;
    let (train_set, val_set) = dataset.split(config.experiment.val_fraction);
    let transform = RewardTransform::for_mode(model.reward_output_mode());
    let train = train_set.into_sequence_source(
        config.experiment.sequence_length,
        config.experiment.batch_size,
        transform,
    )?;
    let val = val_set.into_sequence_source(
        config.experiment.sequence_length,
        config.experiment.batch_size,
        transform,
    )?;
    require_sequences(&train, "training")?;
    require_sequences(&val, "validation")?;

    let trainer = Trainer::<DefaultBackend>::new(config.clone(), device)?;
    let encoder = GaussianReparameterizer;

    let summary = if config.logging.debug {
        tracing::warn!("debug mode: metrics and checkpoints are disabled");
        let mut policy = CheckpointPolicy::<FileCheckpointStore>::new(None);
        let (_, _, summary) = trainer.fit(
            model,
            optimizer,
            &encoder,
            &train,
            &val,
            &mut NullSink,
            &mut policy,
            &mut rng,
        )?;
        summary
    } else {
        let mut sink = JsonlSink::create(&config.logging.base_save_dir)?;
        let run_dir = sink
            .log_dir()
            .ok_or_else(|| {
                WorldModelError::Config("metrics sink has no run directory".to_string())
            })?
            .to_path_buf();
        config.to_file(run_dir.join(CONFIG_COPY_FILE))?;

        let store = config
            .checkpoints_enabled()
            .then(|| FileCheckpointStore::new(&run_dir));
        let mut policy = CheckpointPolicy::new(store);
        let (_, _, summary) = trainer.fit(
            model,
            optimizer,
            &encoder,
            &train,
            &val,
            &mut sink,
            &mut policy,
            &mut rng,
        )?;
        tracing::info!("run artifacts in {}", run_dir.display());
        summary
    };

    Ok(summary)
}

fn require_sequences<S: SequenceSource + ?Sized>(source: &S, split: &str) -> Result<()> {
    if source.num_sequences() == 0 {
        return Err(WorldModelError::DataContract(format!(
            "{split} split has no sequences of at least one chunk"
        )));
    }
    Ok(())
}

fn check_dims(dataset: &EpisodeDataset, config: &TrainerConfig) -> Result<()> {
    if dataset.is_empty() {
        return Err(WorldModelError::DataContract("episode file has no episodes".to_string()));
    }
    if dataset.latent_size() != config.model.latent_size {
        return Err(WorldModelError::DataContract(format!(
            "episodes have latent size {}, model.latent_size is {}",
            dataset.latent_size(),
            config.model.latent_size
        )));
    }
    if dataset.action_size() != config.model.action_size {
        return Err(WorldModelError::DataContract(format!(
            "episodes have action size {}, model.action_size is {}",
            dataset.action_size(),
            config.model.action_size
        )));
    }
    Ok(())
}
