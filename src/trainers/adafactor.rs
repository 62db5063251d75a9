//! Adafactor optimizer with optional stochastic-rounding write-back
//!
//! Second moments are factored into row and column means for parameters of
//! rank >= 2, so a `[rows, cols]` matrix keeps `rows + cols` accumulators
//! instead of `rows * cols`. All arithmetic runs in f32 (f64 for f64
//! gradients) regardless of how the parameter is stored; bf16 parameters are
//! written back either by a plain cast or by stochastic rounding, chosen once
//! at construction.

use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var, D};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use super::stochastic_rounding::StochasticRounder;
use crate::error::{Error, Result};

/// How updated values reach reduced-precision parameter storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteBack {
    /// Plain cast to the storage dtype
    Direct,
    /// bf16 storage gets unbiased stochastic rounding, f16 a plain cast
    StochasticRounding,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdafactorConfig {
    /// Fixed learning rate; must be unset when `relative_step` is on
    pub lr: Option<f64>,
    /// `[added to squared gradients, floor for the parameter scale]`
    pub eps: [f64; 2],
    pub clip_threshold: f64,
    pub decay_rate: f64,
    /// Momentum; disabled when unset
    pub beta1: Option<f64>,
    pub weight_decay: f64,
    pub scale_parameter: bool,
    pub relative_step: bool,
    pub warmup_init: bool,
    /// Factor second moments of rank >= 2 parameters
    pub factored: bool,
    pub write_back: WriteBack,
    /// Seed for stochastic rounding noise
    pub seed: Option<u64>,
}

impl Default for AdafactorConfig {
    fn default() -> Self {
        Self {
            lr: Some(1e-4),
            eps: [1e-30, 1e-3],
            clip_threshold: 1.0,
            decay_rate: -0.8,
            beta1: None,
            weight_decay: 0.0,
            scale_parameter: false,
            relative_step: false,
            warmup_init: false,
            factored: true,
            write_back: WriteBack::StochasticRounding,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LearningRate {
    Fixed(f64),
    /// `min(1e-2, 1/sqrt(step))`, or `min(1e-6 * step, 1/sqrt(step))` with warmup
    Relative { warmup_init: bool },
}

/// A gradient as handed to the optimizer.
#[derive(Debug, Clone)]
pub enum Gradient {
    Dense(Tensor),
    /// COO layout; not supported by Adafactor
    Sparse {
        indices: Tensor,
        values: Tensor,
        shape: Vec<usize>,
    },
}

/// Where the optimizer looks up each parameter's gradient.
pub trait GradientSource {
    fn gradient(&self, index: usize, var: &Var) -> Option<Gradient>;
}

impl GradientSource for GradStore {
    fn gradient(&self, _index: usize, var: &Var) -> Option<Gradient> {
        self.get(var.as_tensor()).cloned().map(Gradient::Dense)
    }
}

/// Gradients keyed by parameter index.
impl GradientSource for HashMap<usize, Gradient> {
    fn gradient(&self, index: usize, _var: &Var) -> Option<Gradient> {
        self.get(&index).cloned()
    }
}

/// Collects dense gradients for `params`, rejecting sparse or misshapen ones
/// before any optimizer touches a parameter.
pub(crate) fn dense_gradients<G: GradientSource>(
    optimizer: &str,
    params: &[(String, Var)],
    grads: &G,
) -> Result<Vec<(usize, Tensor)>> {
    let mut dense = Vec::with_capacity(params.len());
    for (index, (name, var)) in params.iter().enumerate() {
        match grads.gradient(index, var) {
            None => {}
            Some(Gradient::Sparse { .. }) => {
                return Err(Error::UnsupportedInput(format!(
                    "{} does not support sparse gradients (parameter {})",
                    optimizer, name
                )));
            }
            Some(Gradient::Dense(grad)) => {
                if grad.dims() != var.dims() {
                    return Err(Error::ShapeMismatch {
                        expected: var.dims().to_vec(),
                        got: grad.dims().to_vec(),
                    });
                }
                dense.push((index, grad));
            }
        }
    }
    Ok(dense)
}

#[derive(Debug, Clone)]
pub enum SecondMoment {
    /// Row means `[..., rows]` and column means `[..., cols]`
    Factored { row: Tensor, col: Tensor },
    Full(Tensor),
}

/// Per-parameter optimizer state.
#[derive(Debug, Clone)]
pub struct ParamState {
    pub step: u64,
    pub exp_avg: Option<Tensor>,
    pub second_moment: SecondMoment,
    /// RMS of the parameter at the last step
    pub rms: f64,
}

impl ParamState {
    fn zeros(grad: &Tensor, factored: bool, use_first_moment: bool) -> Result<Self> {
        let dims = grad.dims();
        let (dtype, device) = (grad.dtype(), grad.device());
        let second_moment = if factored {
            let rank = dims.len();
            let row_dims = dims[..rank - 1].to_vec();
            let mut col_dims = dims[..rank - 2].to_vec();
            col_dims.push(dims[rank - 1]);
            SecondMoment::Factored {
                row: Tensor::zeros(row_dims, dtype, device)?,
                col: Tensor::zeros(col_dims, dtype, device)?,
            }
        } else {
            SecondMoment::Full(Tensor::zeros_like(grad)?)
        };
        let exp_avg = if use_first_moment { Some(Tensor::zeros_like(grad)?) } else { None };
        Ok(Self {
            step: 0,
            exp_avg,
            second_moment,
            rms: 0.0,
        })
    }

    /// Checks that the accumulators still fit a gradient of shape `dims`.
    fn check_fits(&self, name: &str, dims: &[usize], factored: bool, use_first_moment: bool) -> Result<()> {
        let second_fits = match (&self.second_moment, Self::zeros_shapes(dims, factored)) {
            (SecondMoment::Full(v), (None, full)) => v.dims() == full.as_slice(),
            (SecondMoment::Factored { row, col }, (Some(row_dims), col_dims)) => {
                row.dims() == row_dims.as_slice() && col.dims() == col_dims.as_slice()
            }
            _ => false,
        };
        if !second_fits {
            return Err(Error::ContractViolation(format!(
                "optimizer state for {} does not fit a gradient of shape {:?}",
                name, dims
            )));
        }
        if let (Some(m), true) = (&self.exp_avg, use_first_moment) {
            if m.dims() != dims {
                return Err(Error::ContractViolation(format!(
                    "momentum for {} does not fit a gradient of shape {:?}",
                    name, dims
                )));
            }
        }
        Ok(())
    }

    /// Moves and casts accumulators to match `grad`.
    fn reconcile(mut self, name: &str, grad: &Tensor, factored: bool, use_first_moment: bool) -> Result<Self> {
        self.check_fits(name, grad.dims(), factored, use_first_moment)?;
        let fits = |t: &Tensor| -> Result<Tensor> {
            let t = if t.device().same_device(grad.device()) { t.clone() } else { t.to_device(grad.device())? };
            Ok(t.to_dtype(grad.dtype())?)
        };

        self.second_moment = match self.second_moment {
            SecondMoment::Full(v) => SecondMoment::Full(fits(&v)?),
            SecondMoment::Factored { row, col } => SecondMoment::Factored {
                row: fits(&row)?,
                col: fits(&col)?,
            },
        };
        self.exp_avg = match (self.exp_avg.take(), use_first_moment) {
            (Some(m), true) => Some(fits(&m)?),
            (None, true) => Some(Tensor::zeros_like(grad)?),
            (_, false) => None,
        };
        Ok(self)
    }

    /// `(row dims, col dims)` when factored, `(None, full dims)` otherwise.
    fn zeros_shapes(dims: &[usize], factored: bool) -> (Option<Vec<usize>>, Vec<usize>) {
        if factored {
            let rank = dims.len();
            let mut col = dims[..rank - 2].to_vec();
            col.push(dims[rank - 1]);
            (Some(dims[..rank - 1].to_vec()), col)
        } else {
            (None, dims.to_vec())
        }
    }
}

pub struct Adafactor {
    params: Vec<(String, Var)>,
    states: Vec<Option<ParamState>>,
    config: AdafactorConfig,
    lr: LearningRate,
    rounder: StochasticRounder,
}

impl Adafactor {
    pub fn new(params: Vec<(String, Var)>, config: AdafactorConfig) -> Result<Self> {
        let lr = match (config.relative_step, config.lr) {
            (true, Some(_)) => {
                return Err(Error::Config("cannot combine a fixed lr with relative_step".to_string()));
            }
            (true, None) => LearningRate::Relative {
                warmup_init: config.warmup_init,
            },
            (false, Some(lr)) => LearningRate::Fixed(lr),
            (false, None) => {
                return Err(Error::Config("Adafactor needs an lr when relative_step is off".to_string()));
            }
        };
        if config.warmup_init && !config.relative_step {
            return Err(Error::Config("warmup_init requires relative_step".to_string()));
        }

        let states = vec![None; params.len()];
        let rounder = StochasticRounder::new(config.seed);
        Ok(Self {
            params,
            states,
            config,
            lr,
            rounder,
        })
    }

    pub fn learning_rate(&self) -> LearningRate {
        self.lr
    }

    /// Replaces a fixed learning rate; relative-step schedules are left alone.
    pub fn set_learning_rate(&mut self, lr: f64) {
        match &mut self.lr {
            LearningRate::Fixed(current) => *current = lr,
            LearningRate::Relative { .. } => debug!("Ignoring lr {} under relative_step", lr),
        }
    }

    pub fn params(&self) -> &[(String, Var)] {
        &self.params
    }

    pub fn state(&self, index: usize) -> Option<&ParamState> {
        self.states.get(index).and_then(|s| s.as_ref())
    }

    /// Performs one optimization step.
    ///
    /// Every gradient is checked before anything is updated: a sparse or
    /// misshapen gradient, or saved state that no longer fits its parameter,
    /// aborts the whole step and leaves all parameters and state untouched.
    /// Parameters without a gradient are skipped.
    pub fn step<G: GradientSource>(&mut self, grads: &G) -> Result<()> {
        let dense = dense_gradients("Adafactor", &self.params, grads)?;

        let use_first_moment = self.config.beta1.is_some();
        for (index, _) in &dense {
            if let Some(state) = &self.states[*index] {
                let (name, var) = &self.params[*index];
                let factored = self.config.factored && var.rank() >= 2;
                state.check_fits(name, var.dims(), factored, use_first_moment)?;
            }
        }

        for (index, grad) in dense {
            self.update(index, &grad)?;
        }
        Ok(())
    }

    fn update(&mut self, index: usize, grad: &Tensor) -> Result<()> {
        let Self {
            params,
            states,
            config,
            lr,
            rounder,
        } = self;
        let (name, var) = &params[index];

        // Upcast for the arithmetic below regardless of storage precision
        let compute = if grad.dtype() == DType::F64 || var.dtype() == DType::F64 {
            DType::F64
        } else {
            DType::F32
        };
        let grad = grad.detach().to_dtype(compute)?;
        let factored = config.factored && grad.rank() >= 2;
        let use_first_moment = config.beta1.is_some();

        // The stored state is only replaced once the update has gone through
        let mut state = match &states[index] {
            Some(state) => state.clone().reconcile(name, &grad, factored, use_first_moment)?,
            None => ParamState::zeros(&grad, factored, use_first_moment)?,
        };

        let mut p = var.as_tensor().detach().to_dtype(compute)?;

        state.step += 1;
        state.rms = rms(&p)?;
        let step_lr = step_learning_rate(*lr, config, state.step, state.rms);

        let beta2t = 1.0 - (state.step as f64).powf(config.decay_rate);
        let sq = (grad.sqr()? + config.eps[0])?;
        let mut update = match &mut state.second_moment {
            SecondMoment::Factored { row, col } => {
                *row = ((&*row * beta2t)? + (sq.mean(D::Minus1)? * (1.0 - beta2t))?)?;
                *col = ((&*col * beta2t)? + (sq.mean(D::Minus2)? * (1.0 - beta2t))?)?;
                approx_sq_grad(row, col)?.mul(&grad)?
            }
            SecondMoment::Full(v) => {
                *v = ((&*v * beta2t)? + (sq * (1.0 - beta2t))?)?;
                v.sqrt()?.recip()?.mul(&grad)?
            }
        };

        let clip = (rms(&update)? / config.clip_threshold).max(1.0);
        update = ((update / clip)? * step_lr)?;

        if let (Some(beta1), Some(exp_avg)) = (config.beta1, state.exp_avg.as_mut()) {
            *exp_avg = ((&*exp_avg * beta1)? + (update * (1.0 - beta1))?)?;
            update = exp_avg.clone();
        }

        if config.weight_decay != 0.0 {
            p = (&p * (1.0 - config.weight_decay * step_lr))?;
        }
        p = (p - update)?;

        let stored = match (var.dtype(), config.write_back) {
            (DType::BF16, WriteBack::StochasticRounding) => rounder.round_tensor(&p)?,
            (dtype, _) => p.to_dtype(dtype)?,
        };
        var.set(&stored)?;

        debug!("{}: step {} lr {:.3e} rms {:.4}", name, state.step, step_lr, state.rms);
        states[index] = Some(state);
        Ok(())
    }

    /// Number of accumulator elements held across all parameters.
    pub fn state_elements(&self) -> usize {
        self.states
            .iter()
            .flatten()
            .map(|state| {
                let second = match &state.second_moment {
                    SecondMoment::Factored { row, col } => row.elem_count() + col.elem_count(),
                    SecondMoment::Full(v) => v.elem_count(),
                };
                second + state.exp_avg.as_ref().map_or(0, |m| m.elem_count())
            })
            .sum()
    }

    /// Saves accumulators as safetensors, with step counters in the header metadata.
    pub fn save_state<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut tensors: Vec<(String, Tensor)> = Vec::new();
        let mut metadata = HashMap::new();
        metadata.insert("optimizer".to_string(), "adafactor".to_string());

        for ((name, _), state) in self.params.iter().zip(&self.states) {
            let Some(state) = state else { continue };
            metadata.insert(format!("{}.step", name), state.step.to_string());
            if let Some(m) = &state.exp_avg {
                tensors.push((format!("{}.exp_avg", name), m.clone()));
            }
            match &state.second_moment {
                SecondMoment::Factored { row, col } => {
                    tensors.push((format!("{}.exp_avg_sq_row", name), row.clone()));
                    tensors.push((format!("{}.exp_avg_sq_col", name), col.clone()));
                }
                SecondMoment::Full(v) => tensors.push((format!("{}.exp_avg_sq", name), v.clone())),
            }
        }

        safetensors::serialize_to_file(tensors, &Some(metadata), path.as_ref())
            .map_err(|e| Error::Checkpoint(format!("failed to write optimizer state: {}", e)))?;
        info!("Saved optimizer state to {}", path.as_ref().display());
        Ok(())
    }

    /// Loads state written by `save_state`. Tensors land on the CPU and are
    /// moved and cast to each gradient's device and dtype at the next step.
    pub fn load_state<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let buffer = std::fs::read(path.as_ref())?;
        let (_, header) = safetensors::SafeTensors::read_metadata(&buffer)
            .map_err(|e| Error::Checkpoint(format!("unreadable optimizer state: {}", e)))?;
        let metadata = header.metadata().clone().unwrap_or_default();
        let mut tensors = candle_core::safetensors::load_buffer(&buffer, &candle_core::Device::Cpu)?;

        let mut restored = 0;
        for ((name, _), slot) in self.params.iter().zip(self.states.iter_mut()) {
            let Some(step) = metadata.get(&format!("{}.step", name)) else {
                *slot = None;
                continue;
            };
            let step = step
                .parse::<u64>()
                .map_err(|e| Error::Checkpoint(format!("bad step counter for {}: {}", name, e)))?;

            let exp_avg = tensors.remove(&format!("{}.exp_avg", name));
            let row = tensors.remove(&format!("{}.exp_avg_sq_row", name));
            let col = tensors.remove(&format!("{}.exp_avg_sq_col", name));
            let full = tensors.remove(&format!("{}.exp_avg_sq", name));
            let second_moment = match (row, col, full) {
                (Some(row), Some(col), None) => SecondMoment::Factored { row, col },
                (None, None, Some(v)) => SecondMoment::Full(v),
                _ => {
                    return Err(Error::Checkpoint(format!("incomplete second moment for {}", name)));
                }
            };
            *slot = Some(ParamState {
                step,
                exp_avg,
                second_moment,
                rms: 0.0,
            });
            restored += 1;
        }
        info!("Restored optimizer state for {} parameters", restored);
        Ok(())
    }
}

fn step_learning_rate(lr: LearningRate, config: &AdafactorConfig, step: u64, rms: f64) -> f64 {
    let rel = match lr {
        LearningRate::Fixed(lr) => lr,
        LearningRate::Relative { warmup_init } => {
            let min_step = if warmup_init { 1e-6 * step as f64 } else { 1e-2 };
            min_step.min(1.0 / (step as f64).sqrt())
        }
    };
    let param_scale = if config.scale_parameter { config.eps[1].max(rms) } else { 1.0 };
    param_scale * rel
}

/// Root mean square over every element.
fn rms(t: &Tensor) -> Result<f64> {
    Ok(t.sqr()?.mean_all()?.to_dtype(DType::F64)?.to_scalar::<f64>()?.sqrt())
}

/// Reciprocal square root of the second moment rebuilt from row and column means.
fn approx_sq_grad(row: &Tensor, col: &Tensor) -> Result<Tensor> {
    let r_factor = row
        .broadcast_div(&row.mean_keepdim(D::Minus1)?)?
        .sqrt()?
        .recip()?
        .unsqueeze(row.rank())?;
    let c_factor = col.sqrt()?.recip()?.unsqueeze(col.rank() - 1)?;
    Ok(r_factor.broadcast_mul(&c_factor)?)
}
