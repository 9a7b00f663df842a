//! Latent resampling through a frozen VAE encoder.
//!
//! Observations are encoded ahead of time into `(mu, log_var)`. During
//! training only the reparameterization step is needed, so every epoch sees
//! fresh latent samples of the same observations.
//!
//! Noise is drawn on the host from the caller's RNG, which keeps runs
//! reproducible regardless of the backend's own random state.

use burn::tensor::{backend::Backend, Tensor, TensorData};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

/// Read-only resampler of latent vectors.
pub trait FrozenEncoder {
    /// Draws `z ~ N(mu, exp(log_var))` element-wise.
    fn reparameterize<B: Backend, R: Rng + ?Sized>(
        &self,
        mu: Tensor<B, 3>,
        log_var: Tensor<B, 3>,
        rng: &mut R,
    ) -> Tensor<B, 3>;
}

/// `z = mu + eps * exp(0.5 * log_var)` with `eps ~ N(0, 1)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GaussianReparameterizer;

impl FrozenEncoder for GaussianReparameterizer {
    fn reparameterize<B: Backend, R: Rng + ?Sized>(
        &self,
        mu: Tensor<B, 3>,
        log_var: Tensor<B, 3>,
        rng: &mut R,
    ) -> Tensor<B, 3> {
        let eps = standard_normal::<B, R, 3>(mu.dims(), rng, &mu.device());
        let std = log_var.mul_scalar(0.5).exp();
        mu + eps * std
    }
}

/// Returns `mu` unchanged. Useful for deterministic evaluation.
#[derive(Debug, Clone, Copy, Default)]
pub struct MeanEncoder;

impl FrozenEncoder for MeanEncoder {
    fn reparameterize<B: Backend, R: Rng + ?Sized>(
        &self,
        mu: Tensor<B, 3>,
        _log_var: Tensor<B, 3>,
        _rng: &mut R,
    ) -> Tensor<B, 3> {
        mu
    }
}

fn standard_normal<B: Backend, R: Rng + ?Sized, const D: usize>(
    shape: [usize; D],
    rng: &mut R,
    device: &B::Device,
) -> Tensor<B, D> {
    let len = shape.iter().product();
    let values: Vec<f32> = (0..len).map(|_| StandardNormal.sample(rng)).collect();
    Tensor::from_data(TensorData::new(values, shape), device)
}
