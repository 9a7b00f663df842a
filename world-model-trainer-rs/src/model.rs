//! Recurrent latent-dynamics models.
//!
//! The model predicts, for every timestep of a chunk, the next VAE latent and
//! the reward from the current latent and the action taken.
//!
//! # Architecture
//!
//! ```text
//!   latent [b, L, z]   action [b, L, a]
//!          └──────┬──────┘
//!                 ▼ concat
//!          LSTM (hidden h, batch-first) ◄── RecurrentState (cell, hidden)
//!                 ▼
//!          Linear h → z + 1
//!          ┌──────┴──────┐
//!   next latent [b, L, z]   reward [b, L]
//! ```
//!
//! Recurrent state is passed explicitly: `forward` takes the previous
//! [`RecurrentState`] and returns the next one, so the runner alone decides
//! when it is reset or detached.

use burn::config::Config;
use burn::module::{Ignored, Module};
use burn::nn::loss::{MseLoss, Reduction};
use burn::nn::{Linear, LinearConfig, Lstm, LstmConfig, LstmState};
use burn::tensor::activation::sigmoid;
use burn::tensor::{backend::Backend, ElementConversion, Tensor};
use serde::{Deserialize, Serialize};

use crate::config::ModelConfig;
use crate::error::{self, WorldModelError};

/// LSTM `(cell, hidden)` pair, each `[batch, hidden_size]`.
#[derive(Debug, Clone)]
pub struct RecurrentState<B: Backend> {
    /// Cell state.
    pub cell: Tensor<B, 2>,
    /// Hidden state.
    pub hidden: Tensor<B, 2>,
}

impl<B: Backend> RecurrentState<B> {
    /// Zero state.
    #[must_use]
    pub fn zeros(batch_size: usize, hidden_size: usize, device: &B::Device) -> Self {
        Self {
            cell: Tensor::zeros([batch_size, hidden_size], device),
            hidden: Tensor::zeros([batch_size, hidden_size], device),
        }
    }

    /// Number of rows.
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.hidden.dims()[0]
    }

    /// Same values, cut from the autodiff graph.
    #[must_use]
    pub fn detach(self) -> Self {
        Self {
            cell: self.cell.detach(),
            hidden: self.hidden.detach(),
        }
    }

    /// Keeps the leading `batch_size` rows.
    ///
    /// The last batch of a chunked episode may hold fewer chunks than the
    /// ones before it; those chunks continue the leading rows.
    ///
    /// # Errors
    ///
    /// Returns [`WorldModelError::DataContract`] if the state has fewer rows
    /// than requested.
    pub fn fit_batch(self, batch_size: usize) -> error::Result<Self> {
        let rows = self.batch_size();
        match batch_size.cmp(&rows) {
            std::cmp::Ordering::Equal => Ok(self),
            std::cmp::Ordering::Less => Ok(Self {
                cell: self.cell.narrow(0, 0, batch_size),
                hidden: self.hidden.narrow(0, 0, batch_size),
            }),
            std::cmp::Ordering::Greater => Err(WorldModelError::DataContract(format!(
                "batch of {batch_size} does not fit recurrent state of {rows} rows"
            ))),
        }
    }
}

impl<B: Backend> From<LstmState<B, 2>> for RecurrentState<B> {
    fn from(state: LstmState<B, 2>) -> Self {
        Self {
            cell: state.cell,
            hidden: state.hidden,
        }
    }
}

impl<B: Backend> From<RecurrentState<B>> for LstmState<B, 2> {
    fn from(state: RecurrentState<B>) -> Self {
        LstmState::new(state.cell, state.hidden)
    }
}

/// Raw predictions for one chunk batch.
#[derive(Debug, Clone)]
pub struct DynamicsOutput<B: Backend> {
    /// Predicted next latent, `[batch, chunk_len, latent_size]`.
    pub latent: Tensor<B, 3>,
    /// Reward prediction (value or logit), `[batch, chunk_len]`.
    pub reward: Tensor<B, 2>,
}

/// Loss of one step.
#[derive(Debug, Clone)]
pub struct DynamicsLoss<B: Backend> {
    /// Latent term + reward term; carries the graph.
    pub total: Tensor<B, 1>,
    /// Latent term.
    pub latent: f64,
    /// Reward term.
    pub reward: f64,
}

impl<B: Backend> DynamicsLoss<B> {
    /// Host copy of the total loss.
    #[must_use]
    pub fn total_value(&self) -> f64 {
        self.total.clone().into_scalar().elem::<f64>()
    }
}

/// What the reward output represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RewardOutputMode {
    /// A reward value.
    Continuous,
    /// A logit of `reward > 0`.
    Binary,
}

/// Loss applied to the reward output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RewardHead {
    /// Mean squared error against the raw reward.
    Mse,
    /// Binary cross-entropy with logits against `reward > 0`.
    Bce,
}

impl RewardHead {
    /// Output mode implied by the head.
    #[must_use]
    pub fn output_mode(self) -> RewardOutputMode {
        match self {
            Self::Mse => RewardOutputMode::Continuous,
            Self::Bce => RewardOutputMode::Binary,
        }
    }
}

/// Models known by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    /// LSTM with an MSE reward head (`lstm`, `lstm_mse`).
    LstmMse,
    /// LSTM with a BCE reward head (`lstm_bce`).
    LstmBce,
}

impl ModelKind {
    /// Looks a model up by its registry name.
    ///
    /// # Errors
    ///
    /// Returns [`WorldModelError::Config`] for unknown names.
    pub fn from_name(name: &str) -> error::Result<Self> {
        match name {
            "lstm" | "lstm_mse" => Ok(Self::LstmMse),
            "lstm_bce" => Ok(Self::LstmBce),
            other => Err(WorldModelError::Config(format!(
                "unknown model '{other}', expected one of lstm, lstm_mse, lstm_bce"
            ))),
        }
    }

    /// Reward head used by the model.
    #[must_use]
    pub fn reward_head(self) -> RewardHead {
        match self {
            Self::LstmMse => RewardHead::Mse,
            Self::LstmBce => RewardHead::Bce,
        }
    }
}

/// Recurrent predictor of next latent and reward.
pub trait LatentDynamicsModel<B: Backend> {
    /// Zero recurrent state for `batch_size` rows.
    fn initialize_hidden(&self, batch_size: usize, device: &B::Device) -> RecurrentState<B>;

    /// One chunk-batch step.
    fn forward(
        &self,
        latent: Tensor<B, 3>,
        action: Tensor<B, 3>,
        state: RecurrentState<B>,
    ) -> (DynamicsOutput<B>, RecurrentState<B>);

    /// Latent MSE plus the reward head's loss.
    fn loss_function(
        &self,
        next_latent: Tensor<B, 3>,
        reward: Tensor<B, 2>,
        output: &DynamicsOutput<B>,
    ) -> DynamicsLoss<B>;

    /// Whether rewards should be fed raw or binarized.
    fn reward_output_mode(&self) -> RewardOutputMode;

    /// `(latent, reward)` for inference; rewards are probabilities for binary
    /// heads.
    fn predict(&self, output: &DynamicsOutput<B>) -> (Tensor<B, 3>, Tensor<B, 2>);
}

/// Configuration of [`LstmDynamics`].
#[derive(Config, Debug)]
pub struct LstmDynamicsConfig {
    /// Dimension of the VAE latent.
    pub latent_size: usize,
    /// Dimension of the action.
    pub action_size: usize,
    /// Width of the recurrent state.
    pub hidden_size: usize,
    /// Reward loss.
    #[config(default = "RewardHead::Mse")]
    pub reward_head: RewardHead,
}

impl LstmDynamicsConfig {
    /// Resolves the model section of a training configuration.
    ///
    /// # Errors
    ///
    /// Returns [`WorldModelError::Config`] for an unknown model name.
    pub fn from_model_config(config: &ModelConfig) -> error::Result<Self> {
        let kind = ModelKind::from_name(&config.name)?;
        Ok(Self::new(config.latent_size, config.action_size, config.hidden_size)
            .with_reward_head(kind.reward_head()))
    }

    /// Builds the model with freshly initialized weights.
    pub fn init<B: Backend>(&self, device: &B::Device) -> LstmDynamics<B> {
        LstmDynamics {
            lstm: LstmConfig::new(self.latent_size + self.action_size, self.hidden_size, true)
                .init(device),
            head: LinearConfig::new(self.hidden_size, self.latent_size + 1).init(device),
            latent_size: self.latent_size,
            hidden_size: self.hidden_size,
            reward_head: Ignored(self.reward_head),
        }
    }
}

/// LSTM over `concat(latent, action)` with a linear head to
/// `latent_size + 1` outputs.
#[derive(Module, Debug)]
pub struct LstmDynamics<B: Backend> {
    lstm: Lstm<B>,
    head: Linear<B>,
    latent_size: usize,
    hidden_size: usize,
    reward_head: Ignored<RewardHead>,
}

impl<B: Backend> LstmDynamics<B> {
    /// Reward head the model was built with.
    #[must_use]
    pub fn reward_head(&self) -> RewardHead {
        self.reward_head.0
    }

    /// Width of the recurrent state.
    #[must_use]
    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }
}

impl<B: Backend> LatentDynamicsModel<B> for LstmDynamics<B> {
    fn initialize_hidden(&self, batch_size: usize, device: &B::Device) -> RecurrentState<B> {
        RecurrentState::zeros(batch_size, self.hidden_size, device)
    }

    fn forward(
        &self,
        latent: Tensor<B, 3>,
        action: Tensor<B, 3>,
        state: RecurrentState<B>,
    ) -> (DynamicsOutput<B>, RecurrentState<B>) {
        let input = Tensor::cat(vec![latent, action], 2);
        let (sequence, state) = self.lstm.forward(input, Some(state.into()));

        let projected = self.head.forward(sequence);
        let [batch, chunk, _] = projected.dims();
        let latent = projected.clone().narrow(2, 0, self.latent_size);
        let reward = projected
            .narrow(2, self.latent_size, 1)
            .reshape([batch, chunk]);

        (DynamicsOutput { latent, reward }, state.into())
    }

    fn loss_function(
        &self,
        next_latent: Tensor<B, 3>,
        reward: Tensor<B, 2>,
        output: &DynamicsOutput<B>,
    ) -> DynamicsLoss<B> {
        let latent_loss =
            MseLoss::new().forward(output.latent.clone(), next_latent, Reduction::Mean);
        let reward_loss = match self.reward_head.0 {
            RewardHead::Mse => {
                MseLoss::new().forward(output.reward.clone(), reward, Reduction::Mean)
            }
            RewardHead::Bce => {
                let target = reward.greater_elem(0.0).float();
                binary_cross_entropy_with_logits(output.reward.clone(), target)
            }
        };

        DynamicsLoss {
            latent: latent_loss.clone().into_scalar().elem::<f64>(),
            reward: reward_loss.clone().into_scalar().elem::<f64>(),
            total: latent_loss + reward_loss,
        }
    }

    fn reward_output_mode(&self) -> RewardOutputMode {
        self.reward_head.0.output_mode()
    }

    fn predict(&self, output: &DynamicsOutput<B>) -> (Tensor<B, 3>, Tensor<B, 2>) {
        let reward = match self.reward_head.0 {
            RewardHead::Mse => output.reward.clone(),
            RewardHead::Bce => sigmoid(output.reward.clone()),
        };
        (output.latent.clone(), reward)
    }
}

/// Mean of `max(x, 0) - x * y + ln(1 + e^{-|x|})`, stable for large logits.
fn binary_cross_entropy_with_logits<B: Backend>(
    logits: Tensor<B, 2>,
    targets: Tensor<B, 2>,
) -> Tensor<B, 1> {
    let softplus = logits.clone().abs().neg().exp().log1p();
    (logits.clone().clamp_min(0.0) - logits * targets + softplus).mean()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = NdArray;

    fn config(head: RewardHead) -> LstmDynamicsConfig {
        LstmDynamicsConfig::new(4, 2, 8).with_reward_head(head)
    }

    fn scalar(tensor: Tensor<TestBackend, 1>) -> f64 {
        tensor.into_scalar().elem::<f64>()
    }

    #[test]
    fn test_model_registry() {
        assert_eq!(ModelKind::from_name("lstm").unwrap(), ModelKind::LstmMse);
        assert_eq!(ModelKind::from_name("lstm_mse").unwrap(), ModelKind::LstmMse);
        assert_eq!(ModelKind::from_name("lstm_bce").unwrap(), ModelKind::LstmBce);
        assert!(ModelKind::from_name("mdn_rnn").unwrap_err().is_config());
    }

    #[test]
    fn test_forward_shapes() {
        let device = Default::default();
        let model = config(RewardHead::Mse).init::<TestBackend>(&device);

        let state = model.initialize_hidden(3, &device);
        let (output, state) = model.forward(
            Tensor::zeros([3, 5, 4], &device),
            Tensor::zeros([3, 5, 2], &device),
            state,
        );

        assert_eq!(output.latent.dims(), [3, 5, 4]);
        assert_eq!(output.reward.dims(), [3, 5]);
        assert_eq!(state.hidden.dims(), [3, 8]);
        assert_eq!(state.cell.dims(), [3, 8]);
    }

    #[test]
    fn test_state_carries_information() {
        let device = Default::default();
        let model = config(RewardHead::Mse).init::<TestBackend>(&device);
        let latent = Tensor::<TestBackend, 3>::ones([1, 2, 4], &device);
        let action = Tensor::<TestBackend, 3>::ones([1, 2, 2], &device);

        let (first, state) = model.forward(
            latent.clone(),
            action.clone(),
            model.initialize_hidden(1, &device),
        );
        let (second, _) = model.forward(latent, action, state);

        let diff = scalar((first.latent - second.latent).abs().sum());
        assert!(diff > 0.0);
    }

    #[test]
    fn test_detach_preserves_values() {
        let device = Default::default();
        let model = config(RewardHead::Mse).init::<Autodiff<TestBackend>>(&device);
        let (_, state) = model.forward(
            Tensor::ones([2, 3, 4], &device),
            Tensor::ones([2, 3, 2], &device),
            model.initialize_hidden(2, &device),
        );

        let before = state.hidden.clone().into_data().to_vec::<f32>().unwrap();
        let detached = state.detach();
        let after = detached.hidden.into_data().to_vec::<f32>().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_fit_batch_narrows_and_rejects_growth() {
        let device = Default::default();
        let state = RecurrentState::<TestBackend>::zeros(4, 8, &device);

        let narrowed = state.clone().fit_batch(2).unwrap();
        assert_eq!(narrowed.batch_size(), 2);
        assert_eq!(narrowed.cell.dims(), [2, 8]);

        let err = state.fit_batch(5).unwrap_err();
        assert!(matches!(err, WorldModelError::DataContract(_)));
    }

    #[test]
    fn test_bce_on_zero_logits_is_ln2() {
        let device = Default::default();
        let loss = binary_cross_entropy_with_logits(
            Tensor::<TestBackend, 2>::zeros([2, 3], &device),
            Tensor::<TestBackend, 2>::ones([2, 3], &device),
        );
        assert!((scalar(loss) - std::f64::consts::LN_2).abs() < 1e-5);
    }

    #[test]
    fn test_bce_stable_for_large_logits() {
        let device = Default::default();
        let loss = binary_cross_entropy_with_logits(
            Tensor::<TestBackend, 2>::full([1, 2], 80.0, &device),
            Tensor::<TestBackend, 2>::ones([1, 2], &device),
        );
        let value = scalar(loss);
        assert!(value.is_finite());
        assert!(value < 1e-6);
    }

    #[test]
    fn test_loss_total_is_sum_of_terms() {
        let device = Default::default();
        for head in [RewardHead::Mse, RewardHead::Bce] {
            let model = config(head).init::<TestBackend>(&device);
            let (output, _) = model.forward(
                Tensor::ones([2, 3, 4], &device),
                Tensor::zeros([2, 3, 2], &device),
                model.initialize_hidden(2, &device),
            );
            let loss = model.loss_function(
                Tensor::zeros([2, 3, 4], &device),
                Tensor::ones([2, 3], &device),
                &output,
            );
            assert!((loss.total_value() - (loss.latent + loss.reward)).abs() < 1e-5);
        }
    }

    #[test]
    fn test_bce_thresholds_raw_rewards() {
        let device = Default::default();
        let model = config(RewardHead::Bce).init::<TestBackend>(&device);
        let (output, _) = model.forward(
            Tensor::ones([1, 3, 4], &device),
            Tensor::zeros([1, 3, 2], &device),
            model.initialize_hidden(1, &device),
        );
        let reward_loss = |value: f32| {
            model
                .loss_function(
                    Tensor::zeros([1, 3, 4], &device),
                    Tensor::full([1, 3], value, &device),
                    &output,
                )
                .reward
        };

        let large = reward_loss(5.0);
        assert!(large >= 0.0);
        assert!((large - reward_loss(1.0)).abs() < 1e-6);
        assert!((reward_loss(-2.0) - reward_loss(0.0)).abs() < 1e-6);
    }

    #[test]
    fn test_reward_output_modes() {
        let device = Default::default();
        let mse = config(RewardHead::Mse).init::<TestBackend>(&device);
        let bce = config(RewardHead::Bce).init::<TestBackend>(&device);
        assert_eq!(mse.reward_output_mode(), RewardOutputMode::Continuous);
        assert_eq!(bce.reward_output_mode(), RewardOutputMode::Binary);
    }

    #[test]
    fn test_bce_predict_is_probability() {
        let device = Default::default();
        let model = config(RewardHead::Bce).init::<TestBackend>(&device);
        let output = DynamicsOutput {
            latent: Tensor::zeros([1, 2, 4], &device),
            reward: Tensor::from_floats([[-50.0, 0.0]], &device),
        };
        let (_, reward) = model.predict(&output);
        let values = reward.into_data().to_vec::<f32>().unwrap();
        assert!(values[0] < 1e-6);
        assert!((values[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_config_from_model_section() {
        let section = ModelConfig {
            name: "lstm_bce".into(),
            hidden_size: 16,
            latent_size: 6,
            action_size: 3,
        };
        let config = LstmDynamicsConfig::from_model_config(&section).unwrap();
        assert_eq!(config.reward_head, RewardHead::Bce);
        assert_eq!(config.latent_size, 6);
    }
}
