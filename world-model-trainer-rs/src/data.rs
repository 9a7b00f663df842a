//! Sequence data for the truncated-BPTT runner.
//!
//! A dataset is a collection of independent sequences. Each sequence is an
//! ordered stream of [`TransitionBatch`]es that must be consumed in order,
//! because the recurrent state is carried from one batch to the next.
//!
//! ```text
//! episode:   o0 o1 o2 ... oT            (VAE mu / log_var per observation)
//! chunks:    [c0][c1][c2][c3][c4]       (sequence_length transitions each)
//! batches:   [c0 c1][c2 c3][c4]         (batch_size chunks, last may be partial)
//! ```
//!
//! Batches live on the host as [`HostTensor`]s and are uploaded to the
//! training device one step at a time.

use burn::tensor::{backend::Backend, Tensor, TensorData};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Result, WorldModelError};
use crate::model::RewardOutputMode;

/// Dense row-major `f32` tensor held in host memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostTensor {
    /// Dimension sizes.
    pub shape: Vec<usize>,
    /// Elements in row-major order.
    pub data: Vec<f32>,
}

impl HostTensor {
    /// Creates a tensor, checking that `data` fills `shape` exactly.
    ///
    /// # Errors
    ///
    /// Returns [`WorldModelError::DataContract`] on a length mismatch.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(WorldModelError::DataContract(format!(
                "shape {shape:?} needs {expected} elements, got {}",
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// Tensor of zeros.
    #[must_use]
    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![0.0; len],
        }
    }

    /// Size of the leading dimension.
    #[must_use]
    pub fn leading_dim(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    /// Uploads the tensor to `device`.
    ///
    /// # Errors
    ///
    /// Returns [`WorldModelError::DataContract`] if the rank is not `D`.
    pub fn to_tensor<B: Backend, const D: usize>(
        &self,
        device: &B::Device,
    ) -> Result<Tensor<B, D>> {
        if self.shape.len() != D {
            return Err(WorldModelError::DataContract(format!(
                "expected rank {D}, got shape {:?}",
                self.shape
            )));
        }
        let data = TensorData::new(self.data.clone(), self.shape.clone());
        Ok(Tensor::from_data(data, device))
    }
}

/// One step of a sequence: aligned current/next latent statistics, action and
/// reward for a batch of chunks.
///
/// | Field | Shape |
/// |-------|-------|
/// | `mu`, `log_var`, `next_mu`, `next_log_var` | `[batch, chunk_len, latent_size]` |
/// | `action` | `[batch, chunk_len, action_size]` |
/// | `reward` | `[batch, chunk_len]` |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionBatch {
    /// Mean of the current latent.
    pub mu: HostTensor,
    /// Log-variance of the current latent.
    pub log_var: HostTensor,
    /// Mean of the next latent.
    pub next_mu: HostTensor,
    /// Log-variance of the next latent.
    pub next_log_var: HostTensor,
    /// Reward per transition.
    pub reward: HostTensor,
    /// Action per transition.
    pub action: HostTensor,
}

impl TransitionBatch {
    /// Creates a batch and validates its shapes.
    ///
    /// # Errors
    ///
    /// Returns [`WorldModelError::DataContract`] if the six elements disagree.
    pub fn new(
        mu: HostTensor,
        log_var: HostTensor,
        next_mu: HostTensor,
        next_log_var: HostTensor,
        reward: HostTensor,
        action: HostTensor,
    ) -> Result<Self> {
        let batch = Self {
            mu,
            log_var,
            next_mu,
            next_log_var,
            reward,
            action,
        };
        batch.validate()?;
        Ok(batch)
    }

    /// Checks ranks, the shared leading batch dimension and the shared chunk
    /// length.
    ///
    /// # Errors
    ///
    /// Returns [`WorldModelError::DataContract`] describing the mismatch.
    pub fn validate(&self) -> Result<()> {
        let latent_shape = &self.mu.shape;
        if latent_shape.len() != 3 {
            return Err(WorldModelError::DataContract(format!(
                "mu must be [batch, chunk, latent], got {latent_shape:?}"
            )));
        }
        for (name, tensor) in [
            ("log_var", &self.log_var),
            ("next_mu", &self.next_mu),
            ("next_log_var", &self.next_log_var),
        ] {
            if &tensor.shape != latent_shape {
                return Err(WorldModelError::DataContract(format!(
                    "{name} shape {:?} does not match mu shape {latent_shape:?}",
                    tensor.shape
                )));
            }
        }

        let (batch, chunk) = (latent_shape[0], latent_shape[1]);
        if batch == 0 {
            return Err(WorldModelError::DataContract("empty batch".to_string()));
        }
        if self.reward.shape != [batch, chunk] {
            return Err(WorldModelError::DataContract(format!(
                "reward shape {:?} must be [{batch}, {chunk}]",
                self.reward.shape
            )));
        }
        if self.action.shape.len() != 3 || self.action.shape[..2] != [batch, chunk] {
            return Err(WorldModelError::DataContract(format!(
                "action shape {:?} must be [{batch}, {chunk}, action_size]",
                self.action.shape
            )));
        }
        Ok(())
    }

    /// Number of chunks in the batch.
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.mu.leading_dim()
    }

    /// Uploads all six elements to `device`.
    ///
    /// # Errors
    ///
    /// Returns [`WorldModelError::DataContract`] on malformed shapes.
    pub fn to_device<B: Backend>(&self, device: &B::Device) -> Result<DeviceBatch<B>> {
        self.validate()?;
        Ok(DeviceBatch {
            mu: self.mu.to_tensor(device)?,
            log_var: self.log_var.to_tensor(device)?,
            next_mu: self.next_mu.to_tensor(device)?,
            next_log_var: self.next_log_var.to_tensor(device)?,
            reward: self.reward.to_tensor(device)?,
            action: self.action.to_tensor(device)?,
        })
    }
}

/// A [`TransitionBatch`] resident on a backend device.
#[derive(Debug, Clone)]
pub struct DeviceBatch<B: Backend> {
    /// Mean of the current latent.
    pub mu: Tensor<B, 3>,
    /// Log-variance of the current latent.
    pub log_var: Tensor<B, 3>,
    /// Mean of the next latent.
    pub next_mu: Tensor<B, 3>,
    /// Log-variance of the next latent.
    pub next_log_var: Tensor<B, 3>,
    /// Reward per transition.
    pub reward: Tensor<B, 2>,
    /// Action per transition.
    pub action: Tensor<B, 3>,
}

/// Boxed stream of the steps of one sequence.
pub type SequenceIter<'a> = Box<dyn Iterator<Item = Result<TransitionBatch>> + 'a>;

/// A collection of independent sequences.
pub trait SequenceSource {
    /// Number of sequences.
    fn num_sequences(&self) -> usize;

    /// Number of steps in sequence `index`.
    ///
    /// # Errors
    ///
    /// Sources that cannot report lengths return
    /// [`WorldModelError::Unsupported`].
    fn sequence_len(&self, index: usize) -> Result<usize> {
        let _ = index;
        Err(WorldModelError::Unsupported("sequence_len".to_string()))
    }

    /// Ordered steps of sequence `index`.
    ///
    /// # Errors
    ///
    /// Returns [`WorldModelError::DataContract`] for an out-of-range index.
    fn sequence(&self, index: usize) -> Result<SequenceIter<'_>>;

    /// Sum of all sequence lengths.
    ///
    /// # Errors
    ///
    /// Propagates the error of [`SequenceSource::sequence_len`].
    fn total_steps(&self) -> Result<usize> {
        (0..self.num_sequences()).map(|i| self.sequence_len(i)).sum()
    }
}

/// Sequences held fully in host memory.
#[derive(Debug, Clone, Default)]
pub struct InMemorySequences {
    sequences: Vec<Vec<TransitionBatch>>,
}

impl InMemorySequences {
    /// Wraps pre-built sequences, validating every batch.
    ///
    /// # Errors
    ///
    /// Returns [`WorldModelError::DataContract`] for an empty sequence or a
    /// malformed batch.
    pub fn new(sequences: Vec<Vec<TransitionBatch>>) -> Result<Self> {
        for (index, sequence) in sequences.iter().enumerate() {
            if sequence.is_empty() {
                return Err(WorldModelError::DataContract(format!(
                    "sequence {index} has no steps"
                )));
            }
            for batch in sequence {
                batch.validate()?;
            }
        }
        Ok(Self { sequences })
    }

    /// Whether there are no sequences.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }
}

impl SequenceSource for InMemorySequences {
    fn num_sequences(&self) -> usize {
        self.sequences.len()
    }

    fn sequence_len(&self, index: usize) -> Result<usize> {
        self.sequences
            .get(index)
            .map(Vec::len)
            .ok_or_else(|| out_of_range(index, self.sequences.len()))
    }

    fn sequence(&self, index: usize) -> Result<SequenceIter<'_>> {
        let sequence = self
            .sequences
            .get(index)
            .ok_or_else(|| out_of_range(index, self.sequences.len()))?;
        Ok(Box::new(sequence.iter().cloned().map(Ok)))
    }
}

fn out_of_range(index: usize, len: usize) -> WorldModelError {
    WorldModelError::DataContract(format!("sequence index {index} out of range ({len} sequences)"))
}

/// How raw rewards are mapped before they reach the loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewardTransform {
    /// Rewards are used as-is.
    Identity,
    /// `1` for positive rewards, `0` otherwise.
    Binary,
}

impl RewardTransform {
    /// Transform matching a model's reward output mode.
    #[must_use]
    pub fn for_mode(mode: RewardOutputMode) -> Self {
        match mode {
            RewardOutputMode::Continuous => Self::Identity,
            RewardOutputMode::Binary => Self::Binary,
        }
    }

    /// Applies the transform to one reward.
    #[must_use]
    pub fn apply(self, reward: f32) -> f32 {
        match self {
            Self::Identity => reward,
            Self::Binary => {
                if reward > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

/// One recorded episode, already encoded by the VAE.
///
/// `mu` and `log_var` hold one row per observation. `action[t]` and
/// `reward[t]` belong to the transition from observation `t` to `t + 1`, so
/// they may be one shorter than the observations (extra trailing entries are
/// ignored).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    /// Latent means, `[observations][latent_size]`.
    pub mu: Vec<Vec<f32>>,
    /// Latent log-variances, `[observations][latent_size]`.
    pub log_var: Vec<Vec<f32>>,
    /// Actions, `[transitions][action_size]`.
    pub action: Vec<Vec<f32>>,
    /// Rewards, `[transitions]`.
    pub reward: Vec<f32>,
}

impl Episode {
    /// Number of usable transitions.
    #[must_use]
    pub fn num_transitions(&self) -> usize {
        self.mu
            .len()
            .saturating_sub(1)
            .min(self.action.len())
            .min(self.reward.len())
    }
}

/// VAE-preprocessed episodes loaded from a JSON file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EpisodeDataset {
    /// Episodes in file order.
    pub episodes: Vec<Episode>,
    latent_size: usize,
    action_size: usize,
}

impl EpisodeDataset {
    /// Builds a dataset, checking that every row has consistent width.
    ///
    /// # Errors
    ///
    /// Returns [`WorldModelError::DataContract`] on ragged rows.
    pub fn from_episodes(episodes: Vec<Episode>) -> Result<Self> {
        let latent_size = episodes
            .iter()
            .find_map(|e| e.mu.first())
            .map_or(0, Vec::len);
        let action_size = episodes
            .iter()
            .find_map(|e| e.action.first())
            .map_or(0, Vec::len);

        for (index, episode) in episodes.iter().enumerate() {
            if episode.mu.len() != episode.log_var.len() {
                return Err(WorldModelError::DataContract(format!(
                    "episode {index}: {} mu rows but {} log_var rows",
                    episode.mu.len(),
                    episode.log_var.len()
                )));
            }
            let ragged_latent = episode
                .mu
                .iter()
                .chain(&episode.log_var)
                .any(|row| row.len() != latent_size);
            if ragged_latent {
                return Err(WorldModelError::DataContract(format!(
                    "episode {index}: latent rows must all have width {latent_size}"
                )));
            }
            if episode.action.iter().any(|row| row.len() != action_size) {
                return Err(WorldModelError::DataContract(format!(
                    "episode {index}: action rows must all have width {action_size}"
                )));
            }
        }

        Ok(Self {
            episodes,
            latent_size,
            action_size,
        })
    }

    /// Loads episodes from a JSON array of [`Episode`] objects.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or is ragged.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let episodes: Vec<Episode> = serde_json::from_str(&content)?;
        let dataset = Self::from_episodes(episodes)?;
        tracing::info!(
            episodes = dataset.len(),
            latent_size = dataset.latent_size,
            action_size = dataset.action_size,
            "loaded episode dataset from {}",
            path.as_ref().display()
        );
        Ok(dataset)
    }

    /// Number of episodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.episodes.len()
    }

    /// Whether there are no episodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.episodes.is_empty()
    }

    /// Width of a latent row.
    #[must_use]
    pub fn latent_size(&self) -> usize {
        self.latent_size
    }

    /// Width of an action row.
    #[must_use]
    pub fn action_size(&self) -> usize {
        self.action_size
    }

    /// Splits off the last `round(len * val_fraction)` episodes for
    /// validation. Returns `(train, val)`.
    #[must_use]
    pub fn split(mut self, val_fraction: f64) -> (Self, Self) {
        let n = self.episodes.len();
        let n_val = ((n as f64 * val_fraction).round() as usize).min(n);
        let val_episodes = self.episodes.split_off(n - n_val);
        let val = Self {
            episodes: val_episodes,
            latent_size: self.latent_size,
            action_size: self.action_size,
        };
        (self, val)
    }

    /// Turns every episode into one sequence of batched chunks.
    ///
    /// Transitions are cut into chunks of `sequence_length` (an incomplete
    /// trailing chunk is dropped) and consecutive chunks are stacked into
    /// batches of up to `batch_size`. Episodes shorter than one chunk are
    /// skipped.
    ///
    /// # Errors
    ///
    /// Returns [`WorldModelError::Config`] for zero sizes.
    pub fn into_sequence_source(
        self,
        sequence_length: usize,
        batch_size: usize,
        reward_transform: RewardTransform,
    ) -> Result<InMemorySequences> {
        if sequence_length == 0 || batch_size == 0 {
            return Err(WorldModelError::Config(
                "sequence_length and batch_size must be > 0".to_string(),
            ));
        }

        let mut sequences = Vec::with_capacity(self.episodes.len());
        for (index, episode) in self.episodes.iter().enumerate() {
            let num_chunks = episode.num_transitions() / sequence_length;
            if num_chunks == 0 {
                tracing::debug!(
                    episode = index,
                    transitions = episode.num_transitions(),
                    "skipping episode shorter than one chunk"
                );
                continue;
            }

            let mut batches = Vec::with_capacity(num_chunks.div_ceil(batch_size));
            for first_chunk in (0..num_chunks).step_by(batch_size) {
                let chunks = first_chunk..(first_chunk + batch_size).min(num_chunks);
                batches.push(self.chunk_batch(
                    episode,
                    chunks,
                    sequence_length,
                    reward_transform,
                )?);
            }
            sequences.push(batches);
        }

        InMemorySequences::new(sequences)
    }

    fn chunk_batch(
        &self,
        episode: &Episode,
        chunks: std::ops::Range<usize>,
        sequence_length: usize,
        reward_transform: RewardTransform,
    ) -> Result<TransitionBatch> {
        let batch = chunks.len();
        let mut mu = Vec::with_capacity(batch * sequence_length * self.latent_size);
        let mut log_var = Vec::with_capacity(mu.capacity());
        let mut next_mu = Vec::with_capacity(mu.capacity());
        let mut next_log_var = Vec::with_capacity(mu.capacity());
        let mut action = Vec::with_capacity(batch * sequence_length * self.action_size);
        let mut reward = Vec::with_capacity(batch * sequence_length);

        for chunk in chunks {
            for t in chunk * sequence_length..(chunk + 1) * sequence_length {
                mu.extend_from_slice(&episode.mu[t]);
                log_var.extend_from_slice(&episode.log_var[t]);
                next_mu.extend_from_slice(&episode.mu[t + 1]);
                next_log_var.extend_from_slice(&episode.log_var[t + 1]);
                action.extend_from_slice(&episode.action[t]);
                reward.push(reward_transform.apply(episode.reward[t]));
            }
        }

        let latent_shape = vec![batch, sequence_length, self.latent_size];
        TransitionBatch::new(
            HostTensor::new(latent_shape.clone(), mu)?,
            HostTensor::new(latent_shape.clone(), log_var)?,
            HostTensor::new(latent_shape.clone(), next_mu)?,
            HostTensor::new(latent_shape, next_log_var)?,
            HostTensor::new(vec![batch, sequence_length], reward)?,
            HostTensor::new(vec![batch, sequence_length, self.action_size], action)?,
        )
    }
}
