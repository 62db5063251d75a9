//! Generalized diffusion framework (GDF)
//!
//! Composes a noise schedule, an input scaler, a prediction target, a noise
//! conditioner and a loss weighting into the forward half of a training step:
//! given clean latents it produces the noised input, the regression target,
//! the generator's noise conditioning and the per-sample loss weights.
//!
//! Per-sample scalars are computed on the host in f64 and lifted into tensors
//! shaped `[batch, 1, 1, ...]` so they broadcast against latents of any rank.

pub mod loss_weight;
pub mod noise_cond;
pub mod scaler;
pub mod schedule;
pub mod target;

use candle_core::{DType, Device, Tensor};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use loss_weight::{AdaptiveLossState, AdaptiveLossWeight, LossWeight, LossWeighting, P2LossWeight};
pub use noise_cond::{CosineTNoiseCond, NoiseConditioner};
pub use scaler::{InputScaler, VPScaler};
pub use schedule::{CosineSchedule, NoiseSchedule};
pub use target::{EpsilonTarget, PredictionTarget, Scales};

/// GDF settings as they appear in the training config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GdfConfig {
    /// Clamp applied to `t` before the cosine schedule
    pub clamp_range: [f64; 2],
    /// Cosine offset; 0 gives `-2 ln(tan(t pi / 2))`
    pub cosine_s: f64,
    pub shift: f64,
    pub loss_shift: f64,
    pub adaptive_loss_weight: bool,
    pub adaptive_buckets: usize,
    pub adaptive_range: [f64; 2],
    pub adaptive_beta: f64,
    pub adaptive_weight_range: [f64; 2],
    pub p2_k: f64,
    pub p2_gamma: f64,
    pub p2_s: f64,
}

impl Default for GdfConfig {
    fn default() -> Self {
        Self {
            clamp_range: [1e-4, 0.9999],
            cosine_s: 0.0,
            shift: 1.0,
            loss_shift: 1.0,
            adaptive_loss_weight: false,
            adaptive_buckets: 300,
            adaptive_range: [-20.0, 20.0],
            adaptive_beta: 0.99,
            adaptive_weight_range: [1e-7, 1e7],
            p2_k: 1.0,
            p2_gamma: 1.0,
            p2_s: 1.0,
        }
    }
}

/// Everything `diffuse` produces for one batch.
#[derive(Debug, Clone)]
pub struct Diffused {
    pub noised: Tensor,
    pub noise: Tensor,
    pub target: Tensor,
    /// `[batch]`, F32
    pub log_snr: Tensor,
    /// `[batch]`, same dtype as the latents
    pub noise_cond: Tensor,
    /// `[batch]`, F32
    pub loss_weight: Tensor,
    /// Host copy of `log_snr` for bucket updates
    pub log_snr_values: Vec<f64>,
}

/// Knobs for a single `diffuse` call.
#[derive(Debug, Clone)]
pub struct DiffuseOptions {
    pub shift: f64,
    pub loss_shift: f64,
    /// Fixed schedule positions instead of uniform samples
    pub t: Option<Vec<f64>>,
    /// Fixed noise instead of a fresh Gaussian draw
    pub noise: Option<Tensor>,
    /// Added to the noise before mixing
    pub noise_offset: Option<Tensor>,
}

impl Default for DiffuseOptions {
    fn default() -> Self {
        Self {
            shift: 1.0,
            loss_shift: 1.0,
            t: None,
            noise: None,
            noise_offset: None,
        }
    }
}

pub struct Gdf {
    schedule: Box<dyn NoiseSchedule>,
    input_scaler: Box<dyn InputScaler>,
    target: Box<dyn PredictionTarget>,
    noise_cond: Box<dyn NoiseConditioner>,
    loss_weight: LossWeight,
}

impl Gdf {
    pub fn new(
        schedule: Box<dyn NoiseSchedule>,
        input_scaler: Box<dyn InputScaler>,
        target: Box<dyn PredictionTarget>,
        noise_cond: Box<dyn NoiseConditioner>,
        loss_weight: LossWeight,
    ) -> Self {
        Self {
            schedule,
            input_scaler,
            target,
            noise_cond,
            loss_weight,
        }
    }

    /// Cosine schedule, VP scaler, epsilon target and cosine-t conditioning,
    /// with P2 or adaptive loss weighting.
    pub fn from_config(config: &GdfConfig) -> Result<Self> {
        let [t_min, t_max] = config.clamp_range;
        if !(0.0 <= t_min && t_min < t_max && t_max <= 1.0) {
            return Err(Error::Config(format!("invalid schedule clamp range {:?}", config.clamp_range)));
        }
        let schedule = CosineSchedule::new(config.cosine_s, (t_min, t_max));
        let noise_cond = CosineTNoiseCond::matching(&schedule);
        let loss_weight = if config.adaptive_loss_weight {
            LossWeight::Adaptive(AdaptiveLossWeight::new(
                (config.adaptive_range[0], config.adaptive_range[1]),
                config.adaptive_buckets,
                config.adaptive_beta,
                (config.adaptive_weight_range[0], config.adaptive_weight_range[1]),
            )?)
        } else {
            LossWeight::P2(P2LossWeight {
                k: config.p2_k,
                gamma: config.p2_gamma,
                s: config.p2_s,
            })
        };
        Ok(Self::new(
            Box::new(schedule),
            Box::new(VPScaler),
            Box::new(EpsilonTarget),
            Box::new(noise_cond),
            loss_weight,
        ))
    }

    pub fn loss_weight(&self) -> &LossWeight {
        &self.loss_weight
    }

    pub fn loss_weight_mut(&mut self) -> &mut LossWeight {
        &mut self.loss_weight
    }

    /// Noises a batch with uniformly sampled `t` and fresh Gaussian noise.
    pub fn diffuse<R: Rng>(&self, x0: &Tensor, shift: f64, loss_shift: f64, rng: &mut R) -> Result<Diffused> {
        let options = DiffuseOptions {
            shift,
            loss_shift,
            ..Default::default()
        };
        self.diffuse_with(x0, &options, rng)
    }

    pub fn diffuse_with<R: Rng>(&self, x0: &Tensor, options: &DiffuseOptions, rng: &mut R) -> Result<Diffused> {
        let dims = x0.dims().to_vec();
        let batch_size = *dims
            .first()
            .ok_or_else(|| Error::ContractViolation("diffuse needs latents with a batch dimension".to_string()))?;

        let t = match &options.t {
            Some(t) if t.len() != batch_size => {
                return Err(Error::ContractViolation(format!(
                    "got {} t values for a batch of {}",
                    t.len(),
                    batch_size
                )));
            }
            Some(t) => t.clone(),
            None => (0..batch_size).map(|_| rng.gen::<f64>()).collect(),
        };

        let noise = match &options.noise {
            Some(noise) if noise.dims() != dims.as_slice() => {
                return Err(Error::ShapeMismatch {
                    expected: dims,
                    got: noise.dims().to_vec(),
                });
            }
            Some(noise) => noise.to_dtype(x0.dtype())?,
            None => gaussian_like(x0, rng)?,
        };
        let noise = match &options.noise_offset {
            Some(offset) => noise.broadcast_add(&offset.to_dtype(x0.dtype())?)?,
            None => noise,
        };

        let log_snr = self.schedule.log_snr_batch(&t, options.shift);
        let scales = self.scales(&log_snr, x0)?;

        let noised = (x0.broadcast_mul(&scales.signal)? + noise.broadcast_mul(&scales.noise)?)?;
        let target = self.target.target(x0, &noise, &scales)?;

        let noise_cond: Vec<f64> = log_snr.iter().map(|&l| self.noise_cond.condition(l)).collect();
        let loss_weight = loss_weight::weigh_batch(&self.loss_weight, &log_snr, options.loss_shift);

        let device = x0.device();
        Ok(Diffused {
            noised,
            noise,
            target,
            log_snr: vector(&log_snr, device, DType::F32)?,
            noise_cond: vector(&noise_cond, device, x0.dtype())?,
            loss_weight: vector(&loss_weight, device, DType::F32)?,
            log_snr_values: log_snr,
        })
    }

    /// Recovers `(x0, epsilon)` estimates from a generator prediction.
    pub fn undiffuse(&self, noised: &Tensor, log_snr: &[f64], prediction: &Tensor) -> Result<(Tensor, Tensor)> {
        let scales = self.scales(log_snr, noised)?;
        let x0 = self.target.x0(noised, prediction, &scales)?;
        let epsilon = self.target.epsilon(noised, prediction, &scales)?;
        Ok((x0, epsilon))
    }

    /// Target for given clean latents, noise and logSNR.
    pub fn get_target(&self, x0: &Tensor, noise: &Tensor, log_snr: &[f64]) -> Result<Tensor> {
        let scales = self.scales(log_snr, x0)?;
        self.target.target(x0, noise, &scales)
    }

    pub fn x0_from_prediction(&self, prediction: &Tensor, noised: &Tensor, log_snr: &[f64]) -> Result<Tensor> {
        let scales = self.scales(log_snr, noised)?;
        self.target.x0(noised, prediction, &scales)
    }

    fn scales(&self, log_snr: &[f64], like: &Tensor) -> Result<Scales> {
        let batch_size = like.dims().first().copied().unwrap_or(0);
        if log_snr.len() != batch_size {
            return Err(Error::ContractViolation(format!(
                "got {} logSNR values for a batch of {}",
                log_snr.len(),
                batch_size
            )));
        }
        let (signal, noise): (Vec<f64>, Vec<f64>) = log_snr.iter().map(|&l| self.input_scaler.scale(l)).unzip();
        Ok(Scales {
            signal: per_sample(&signal, like)?,
            noise: per_sample(&noise, like)?,
        })
    }
}

/// `[batch]` tensor from host values.
fn vector(values: &[f64], device: &Device, dtype: DType) -> Result<Tensor> {
    let values: Vec<f32> = values.iter().map(|&v| v as f32).collect();
    let len = values.len();
    Ok(Tensor::from_vec(values, len, device)?.to_dtype(dtype)?)
}

/// `[batch, 1, 1, ...]` tensor matching the rank, device and dtype of `like`.
fn per_sample(values: &[f64], like: &Tensor) -> Result<Tensor> {
    let mut shape = vec![1usize; like.rank()];
    shape[0] = values.len();
    let values: Vec<f32> = values.iter().map(|&v| v as f32).collect();
    Ok(Tensor::from_vec(values, shape, like.device())?.to_dtype(like.dtype())?)
}

fn gaussian_like<R: Rng>(like: &Tensor, rng: &mut R) -> Result<Tensor> {
    let data: Vec<f32> = (0..like.elem_count()).map(|_| rng.sample(StandardNormal)).collect();
    Ok(Tensor::from_vec(data, like.dims(), like.device())?.to_dtype(like.dtype())?)
}
