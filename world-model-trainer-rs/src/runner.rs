//! Truncated backpropagation through time over a collection of sequences.
//!
//! A pass walks every sequence of a [`SequenceSource`] once. The recurrent
//! state is created fresh at the start of each sequence, carried from step to
//! step, and cut from the graph at every truncation boundary:
//!
//! ```text
//! stride = 2, sequence of 5 steps
//!
//! step      0    1    2    3    4
//! window   [l0 + l1] [l2 + l3] [l4]
//! boundary       ▲         ▲    ▲     backward + optimizer step + detach
//! ```
//!
//! Step `i` is a boundary iff `(i + 1) % stride == 0` or it is the last step
//! of the sequence. Losses of the steps inside one window are summed and
//! backpropagated once, which gives the same gradient as accumulating one
//! backward call per step and applying the update at the boundary.
//!
//! The validation pass shares the traversal but runs the gradient-free copy
//! of the model in input order.

use burn::module::AutodiffModule;
use burn::optim::{GradientsParams, Optimizer};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;
use indicatif::{ProgressBar, ProgressStyle};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::data::SequenceSource;
use crate::encoder::FrozenEncoder;
use crate::error::{Result, WorldModelError};
use crate::metrics::{LossMeters, MetricKeys};
use crate::model::{LatentDynamicsModel, RecurrentState};
use crate::sink::MetricsSink;

/// Kind of pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassMode {
    /// Shuffled sequence order, parameter updates at truncation boundaries.
    Train,
    /// Input order, no gradient tracking.
    Eval,
}

impl PassMode {
    /// Metric names reported by this pass.
    #[must_use]
    pub fn keys(self) -> MetricKeys {
        match self {
            Self::Train => MetricKeys::TRAIN,
            Self::Eval => MetricKeys::EVAL,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Eval => "val",
        }
    }
}

/// Outcome of one pass.
#[derive(Debug, Clone, PartialEq)]
pub struct PassReport {
    /// Batch-weighted mean of the total loss.
    pub average_loss: f64,
    /// Batch-weighted mean of the latent term.
    pub average_latent_loss: f64,
    /// Batch-weighted mean of the reward term.
    pub average_reward_loss: f64,
    /// Global log step to hand to the next pass of the same kind.
    pub next_global_step: u64,
    /// Number of steps processed.
    pub steps: usize,
    /// Number of times the recurrent state was created from zeros.
    pub hidden_resets: usize,
    /// Source indices in the order they were visited.
    pub sequence_order: Vec<usize>,
    /// Optimizer updates per visited sequence, parallel to `sequence_order`.
    /// All zeros for evaluation.
    pub optimizer_steps: Vec<usize>,
}

/// Whether step `index` of a sequence of `len` steps closes a truncation
/// window.
#[must_use]
pub fn is_truncation_boundary(index: usize, len: usize, stride: usize) -> bool {
    (index + 1) % stride == 0 || index + 1 == len
}

/// Number of optimizer updates a sequence of `len` steps receives.
#[must_use]
pub fn optimizer_steps_for(len: usize, stride: usize) -> usize {
    len.div_ceil(stride)
}

/// Runs train and validation passes with a fixed truncation stride.
#[derive(Debug, Clone)]
pub struct TbpttRunner {
    stride: usize,
    log_every: u64,
    learning_rate: f64,
    detect_anomaly: bool,
    show_progress: bool,
}

impl TbpttRunner {
    /// Creates a runner.
    ///
    /// # Errors
    ///
    /// Returns [`WorldModelError::Config`] for a zero stride or log
    /// frequency, or a non-positive learning rate.
    pub fn new(stride: usize, log_every: usize, learning_rate: f64) -> Result<Self> {
        if stride == 0 {
            return Err(WorldModelError::Config("tbptt_stride must be > 0".to_string()));
        }
        if log_every == 0 {
            return Err(WorldModelError::Config(
                "scalar_log_frequency must be > 0".to_string(),
            ));
        }
        if !(learning_rate > 0.0 && learning_rate.is_finite()) {
            return Err(WorldModelError::Config(
                "learning_rate must be a positive finite number".to_string(),
            ));
        }
        Ok(Self {
            stride,
            log_every: log_every as u64,
            learning_rate,
            detect_anomaly: false,
            show_progress: false,
        })
    }

    /// Abort with [`WorldModelError::NumericalDivergence`] on a non-finite
    /// loss instead of carrying on with NaN.
    #[must_use]
    pub fn with_anomaly_detection(mut self, enabled: bool) -> Self {
        self.detect_anomaly = enabled;
        self
    }

    /// Draw a progress bar while a pass runs.
    #[must_use]
    pub fn with_progress(mut self, enabled: bool) -> Self {
        self.show_progress = enabled;
        self
    }

    /// Truncation stride.
    #[must_use]
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// One training pass. Consumes the model and returns the updated one.
    ///
    /// # Errors
    ///
    /// Fails on an empty source, a broken batch, a source that cannot report
    /// sequence lengths, a sink error, or (with anomaly detection) a
    /// non-finite loss.
    #[allow(clippy::too_many_arguments)]
    pub fn train_pass<B, M, O, E, S, R>(
        &self,
        model: M,
        optimizer: &mut O,
        encoder: &E,
        source: &S,
        device: &B::Device,
        epoch: usize,
        global_step: u64,
        sink: &mut dyn MetricsSink,
        rng: &mut R,
    ) -> Result<(M, PassReport)>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B> + LatentDynamicsModel<B>,
        O: Optimizer<M, B>,
        E: FrozenEncoder,
        S: SequenceSource + ?Sized,
        R: Rng,
    {
        let driver: TrainDriver<'_, B, M, O> = TrainDriver {
            model,
            optimizer,
            learning_rate: self.learning_rate,
            window: None,
        };
        let (driver, report) = self.run_pass::<B, _, _, _, _>(
            PassMode::Train,
            driver,
            encoder,
            source,
            device,
            epoch,
            global_step,
            sink,
            rng,
        )?;
        Ok((driver.model, report))
    }

    /// One validation pass over the gradient-free copy of `model`.
    ///
    /// # Errors
    ///
    /// Same as [`TbpttRunner::train_pass`].
    #[allow(clippy::too_many_arguments)]
    pub fn eval_pass<B, M, E, S, R>(
        &self,
        model: &M,
        encoder: &E,
        source: &S,
        device: &B::Device,
        epoch: usize,
        global_step: u64,
        sink: &mut dyn MetricsSink,
        rng: &mut R,
    ) -> Result<PassReport>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        M::InnerModule: LatentDynamicsModel<B::InnerBackend>,
        E: FrozenEncoder,
        S: SequenceSource + ?Sized,
        R: Rng,
    {
        let inner = model.valid();
        let driver = EvalDriver { model: &inner };
        let (_, report) = self.run_pass::<B::InnerBackend, _, _, _, _>(
            PassMode::Eval,
            driver,
            encoder,
            source,
            device,
            epoch,
            global_step,
            sink,
            rng,
        )?;
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    fn run_pass<B, D, E, S, R>(
        &self,
        mode: PassMode,
        mut driver: D,
        encoder: &E,
        source: &S,
        device: &B::Device,
        epoch: usize,
        global_step: u64,
        sink: &mut dyn MetricsSink,
        rng: &mut R,
    ) -> Result<(D, PassReport)>
    where
        B: Backend,
        D: PassDriver<B>,
        E: FrozenEncoder,
        S: SequenceSource + ?Sized,
        R: Rng,
    {
        let num_sequences = source.num_sequences();
        if num_sequences == 0 {
            return Err(WorldModelError::DataContract(format!(
                "{} pass needs at least one sequence",
                mode.label()
            )));
        }

        let lengths = (0..num_sequences)
            .map(|index| source.sequence_len(index))
            .collect::<Result<Vec<_>>>()?;
        let total_steps: usize = lengths.iter().sum();

        let mut order: Vec<usize> = (0..num_sequences).collect();
        if mode == PassMode::Train {
            order.shuffle(rng);
        }

        let keys = mode.keys();
        let mut meters = LossMeters::new(keys);
        let progress = self.progress_bar(mode, epoch, total_steps)?;

        let mut step = global_step;
        let mut hidden_resets = 0;
        let mut optimizer_steps = Vec::with_capacity(num_sequences);

        tracing::debug!(
            mode = mode.label(),
            epoch,
            sequences = num_sequences,
            total_steps,
            "starting pass"
        );

        for (position, &index) in order.iter().enumerate() {
            let len = lengths[index];
            if len == 0 {
                return Err(WorldModelError::DataContract(format!(
                    "sequence {index} has no steps"
                )));
            }
            let last_sequence = position + 1 == num_sequences;

            let mut state: Option<RecurrentState<B>> = None;
            let mut updates = 0;
            let mut seen = 0;

            for (i, batch) in source.sequence(index)?.enumerate() {
                if i >= len {
                    return Err(WorldModelError::DataContract(format!(
                        "sequence {index} yielded more than its {len} steps"
                    )));
                }
                let batch = batch?;
                let batch_size = batch.batch_size();
                let batch = batch.to_device::<B>(device)?;

                let state_in = match state.take() {
                    None => {
                        hidden_resets += 1;
                        driver.model().initialize_hidden(batch_size, device)
                    }
                    Some(carried) => carried.fit_batch(batch_size)?,
                };

                let latent = encoder.reparameterize(batch.mu, batch.log_var, rng);
                let next_latent = encoder.reparameterize(batch.next_mu, batch.next_log_var, rng);

                let (output, state_out) = driver.model().forward(latent, batch.action, state_in);
                let loss = driver.model().loss_function(next_latent, batch.reward, &output);
                let total = loss.total_value();

                if self.detect_anomaly && !total.is_finite() {
                    return Err(WorldModelError::NumericalDivergence {
                        sequence: index,
                        step: i,
                        value: total,
                    });
                }

                let boundary = is_truncation_boundary(i, len, self.stride);
                driver = driver.observe(loss.total, boundary);
                state = Some(if boundary { state_out.detach() } else { state_out });
                if boundary && mode == PassMode::Train {
                    updates += 1;
                }

                meters.update(total, loss.latent, loss.reward, batch_size);

                let final_step = last_sequence && i + 1 == len;
                if step % self.log_every == 0 || final_step {
                    for (name, value) in meters.averages() {
                        sink.record_scalar(name, value, step)?;
                    }
                    progress.set_message(meters.summary());
                }

                step += 1;
                seen += 1;
                progress.inc(1);
            }

            if seen != len {
                return Err(WorldModelError::DataContract(format!(
                    "sequence {index} reported {len} steps but yielded {seen}"
                )));
            }
            optimizer_steps.push(updates);
        }

        sink.record_scalar(
            &MetricKeys::epoch_key(keys.loss),
            meters.total.average(),
            epoch as u64,
        )?;
        progress.finish_and_clear();

        tracing::info!(
            mode = mode.label(),
            epoch,
            steps = total_steps,
            "{}",
            meters.summary()
        );

        let report = PassReport {
            average_loss: meters.total.average(),
            average_latent_loss: meters.latent.average(),
            average_reward_loss: meters.reward.average(),
            next_global_step: step,
            steps: total_steps,
            hidden_resets,
            sequence_order: order,
            optimizer_steps,
        };
        Ok((driver, report))
    }

    fn progress_bar(
        &self,
        mode: PassMode,
        epoch: usize,
        total_steps: usize,
    ) -> Result<ProgressBar> {
        if !self.show_progress {
            return Ok(ProgressBar::hidden());
        }
        let bar = ProgressBar::new(total_steps as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{prefix:>12} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>7}/{len:7} {msg}",
                )?
                .progress_chars("#>-"),
        );
        bar.set_prefix(format!("{} {epoch}", mode.label()));
        Ok(bar)
    }
}

/// Per-mode handling of step losses.
trait PassDriver<B: Backend>: Sized {
    type Model: LatentDynamicsModel<B>;

    fn model(&self) -> &Self::Model;

    /// Takes the loss of one step; `boundary` closes the truncation window.
    fn observe(self, loss: Tensor<B, 1>, boundary: bool) -> Self;
}

struct TrainDriver<'a, B: AutodiffBackend, M, O> {
    model: M,
    optimizer: &'a mut O,
    learning_rate: f64,
    window: Option<Tensor<B, 1>>,
}

impl<B, M, O> PassDriver<B> for TrainDriver<'_, B, M, O>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + LatentDynamicsModel<B>,
    O: Optimizer<M, B>,
{
    type Model = M;

    fn model(&self) -> &M {
        &self.model
    }

    fn observe(mut self, loss: Tensor<B, 1>, boundary: bool) -> Self {
        let window = match self.window.take() {
            Some(window) => window + loss,
            None => loss,
        };
        if boundary {
            let grads = GradientsParams::from_grads(window.backward(), &self.model);
            self.model = self.optimizer.step(self.learning_rate, self.model, grads);
        } else {
            self.window = Some(window);
        }
        self
    }
}

struct EvalDriver<'a, M> {
    model: &'a M,
}

impl<B, M> PassDriver<B> for EvalDriver<'_, M>
where
    B: Backend,
    M: LatentDynamicsModel<B>,
{
    type Model = M;

    fn model(&self) -> &M {
        self.model
    }

    fn observe(self, _loss: Tensor<B, 1>, _boundary: bool) -> Self {
        self
    }
}
