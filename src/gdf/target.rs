//! Prediction targets: what the generator regresses to and how to invert it

use candle_core::Tensor;

use crate::error::Result;

/// Per-sample mixing coefficients, already reshaped to broadcast against latents.
pub struct Scales {
    pub signal: Tensor,
    pub noise: Tensor,
}

/// Defines the regression target and its inverse.
///
/// `x0` must be the exact algebraic inverse of `noised = signal * x0 + noise * epsilon`
/// given `target(x0, epsilon)` as the prediction.
pub trait PredictionTarget: Send + Sync {
    fn target(&self, x0: &Tensor, epsilon: &Tensor, scales: &Scales) -> Result<Tensor>;

    /// Recovers a clean-signal estimate from a prediction.
    fn x0(&self, noised: &Tensor, prediction: &Tensor, scales: &Scales) -> Result<Tensor>;

    /// Recovers a noise estimate from a prediction.
    fn epsilon(&self, noised: &Tensor, prediction: &Tensor, scales: &Scales) -> Result<Tensor>;
}

/// Epsilon target: the generator predicts the injected noise.
#[derive(Debug, Clone, Copy, Default)]
pub struct EpsilonTarget;

impl PredictionTarget for EpsilonTarget {
    fn target(&self, _x0: &Tensor, epsilon: &Tensor, _scales: &Scales) -> Result<Tensor> {
        Ok(epsilon.clone())
    }

    fn x0(&self, noised: &Tensor, prediction: &Tensor, scales: &Scales) -> Result<Tensor> {
        let noise_part = prediction.broadcast_mul(&scales.noise)?;
        Ok((noised - noise_part)?.broadcast_div(&scales.signal)?)
    }

    fn epsilon(&self, _noised: &Tensor, prediction: &Tensor, _scales: &Scales) -> Result<Tensor> {
        Ok(prediction.clone())
    }
}
