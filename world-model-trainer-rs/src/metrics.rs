//! Running loss statistics for training and validation passes.
//!
//! Every pass owns one [`LossMeters`], a triple of [`RunningStatistic`]s for
//! the total loss and its latent and reward terms. Each step contributes its
//! loss weighted by the batch size, so the pass average is the per-sample
//! mean even when the last batch of an episode is partial.
//!
//! # Collected Metrics
//!
//! | Train key | Eval key | Meaning |
//! |-----------|----------|---------|
//! | `loss` | `val_loss` | Latent term + reward term |
//! | `latent_loss` | `val_latent_loss` | MSE of the next-latent prediction |
//! | `reward_loss` | `val_reward_loss` | MSE or BCE of the reward prediction |
//!
//! Per-epoch aggregates are recorded as `epoch_<key>`.

use serde::{Deserialize, Serialize};

/// Weighted online mean of a scalar metric.
///
/// `average = sum_weighted / total_weight`, or 0 before the first update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningStatistic {
    /// Metric name, for display.
    pub name: String,

    /// Sum of `value * weight` over all updates.
    pub sum_weighted: f64,

    /// Sum of all weights.
    pub total_weight: f64,

    /// Number of updates.
    pub count: u64,

    /// Most recent value.
    pub last: f64,
}

impl RunningStatistic {
    /// Creates an empty statistic.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Folds in one observation.
    pub fn update(&mut self, value: f64, weight: f64) {
        self.last = value;
        self.sum_weighted += value * weight;
        self.total_weight += weight;
        self.count += 1;
    }

    /// Weighted mean of all observations so far.
    #[must_use]
    pub fn average(&self) -> f64 {
        if self.total_weight == 0.0 {
            0.0
        } else {
            self.sum_weighted / self.total_weight
        }
    }

    /// Clears all observations, keeping the name.
    pub fn reset(&mut self) {
        self.sum_weighted = 0.0;
        self.total_weight = 0.0;
        self.count = 0;
        self.last = 0.0;
    }
}

/// Metric names used by one kind of pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricKeys {
    /// Total loss key.
    pub loss: &'static str,
    /// Latent term key.
    pub latent_loss: &'static str,
    /// Reward term key.
    pub reward_loss: &'static str,
}

impl MetricKeys {
    /// Keys of the training pass.
    pub const TRAIN: Self = Self {
        loss: "loss",
        latent_loss: "latent_loss",
        reward_loss: "reward_loss",
    };

    /// Keys of the validation pass.
    pub const EVAL: Self = Self {
        loss: "val_loss",
        latent_loss: "val_latent_loss",
        reward_loss: "val_reward_loss",
    };

    /// Per-epoch name of a key.
    #[must_use]
    pub fn epoch_key(key: &str) -> String {
        format!("epoch_{key}")
    }
}

/// The three loss statistics tracked during a pass.
#[derive(Debug, Clone, PartialEq)]
pub struct LossMeters {
    /// Total loss.
    pub total: RunningStatistic,
    /// Latent prediction term.
    pub latent: RunningStatistic,
    /// Reward prediction term.
    pub reward: RunningStatistic,
    keys: MetricKeys,
}

impl LossMeters {
    /// Creates empty meters named after `keys`.
    #[must_use]
    pub fn new(keys: MetricKeys) -> Self {
        Self {
            total: RunningStatistic::new(keys.loss),
            latent: RunningStatistic::new(keys.latent_loss),
            reward: RunningStatistic::new(keys.reward_loss),
            keys,
        }
    }

    /// Keys the meters report under.
    #[must_use]
    pub fn keys(&self) -> MetricKeys {
        self.keys
    }

    /// Records one step's losses, weighted by its batch size.
    pub fn update(&mut self, total: f64, latent: f64, reward: f64, batch_size: usize) {
        let weight = batch_size as f64;
        self.total.update(total, weight);
        self.latent.update(latent, weight);
        self.reward.update(reward, weight);
    }

    /// `(key, running average)` for each meter.
    #[must_use]
    pub fn averages(&self) -> [(&'static str, f64); 3] {
        [
            (self.keys.loss, self.total.average()),
            (self.keys.latent_loss, self.latent.average()),
            (self.keys.reward_loss, self.reward.average()),
        ]
    }

    /// One-line rendering of the running averages.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{}={:.4} {}={:.4} {}={:.4}",
            self.keys.loss,
            self.total.average(),
            self.keys.latent_loss,
            self.latent.average(),
            self.keys.reward_loss,
            self.reward.average()
        )
    }

    /// Clears all three meters.
    pub fn reset(&mut self) {
        self.total.reset();
        self.latent.reset();
        self.reward.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_average_is_zero() {
        let stat = RunningStatistic::new("loss");
        assert_eq!(stat.average(), 0.0);
        assert_eq!(stat.count, 0);
    }

    #[test]
    fn test_single_update_yields_value() {
        let mut stat = RunningStatistic::new("loss");
        stat.update(0.75, 16.0);
        assert!((stat.average() - 0.75).abs() < 1e-12);
        assert_eq!(stat.last, 0.75);
    }

    #[test]
    fn test_weighted_mean() {
        let mut stat = RunningStatistic::new("loss");
        stat.update(1.0, 3.0);
        stat.update(4.0, 1.0);
        // (1*3 + 4*1) / 4
        assert!((stat.average() - 1.75).abs() < 1e-12);
        assert_eq!(stat.count, 2);
        assert_eq!(stat.last, 4.0);
    }

    #[test]
    fn test_reset_keeps_name() {
        let mut stat = RunningStatistic::new("reward_loss");
        stat.update(2.0, 1.0);
        stat.reset();
        assert_eq!(stat.name, "reward_loss");
        assert_eq!(stat.average(), 0.0);
        assert_eq!(stat.count, 0);
    }

    #[test]
    fn test_nan_propagates() {
        let mut stat = RunningStatistic::new("loss");
        stat.update(f64::NAN, 1.0);
        assert!(stat.average().is_nan());
    }

    #[test]
    fn test_meters_use_pass_keys() {
        let mut meters = LossMeters::new(MetricKeys::EVAL);
        meters.update(3.0, 2.0, 1.0, 4);
        meters.update(1.0, 0.5, 0.5, 4);

        let averages = meters.averages();
        assert_eq!(averages[0], ("val_loss", 2.0));
        assert_eq!(averages[1], ("val_latent_loss", 1.25));
        assert_eq!(averages[2], ("val_reward_loss", 0.75));
        assert!(meters.summary().starts_with("val_loss=2.0000"));
    }

    #[test]
    fn test_epoch_key() {
        assert_eq!(MetricKeys::epoch_key(MetricKeys::TRAIN.loss), "epoch_loss");
        assert_eq!(
            MetricKeys::epoch_key(MetricKeys::EVAL.reward_loss),
            "epoch_val_reward_loss"
        );
    }
}
