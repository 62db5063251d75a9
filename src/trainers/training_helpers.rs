//! Training helper structs and utilities

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use log::debug;
use std::collections::HashMap;
use std::path::Path;

use crate::error::{Error, Result};

/// Sums gradients over micro-batches until an optimizer step is due.
pub struct GradientAccumulator {
    steps: usize,
    seen: usize,
    accumulated: Option<GradStore>,
}

impl GradientAccumulator {
    pub fn new(steps: usize) -> Self {
        Self {
            steps: steps.max(1),
            seen: 0,
            accumulated: None,
        }
    }

    /// Folds one micro-batch into the running sums; returns true once
    /// `steps` micro-batches have been collected.
    pub fn accumulate(&mut self, mut grads: GradStore, params: &[Var]) -> Result<bool> {
        match &mut self.accumulated {
            None => self.accumulated = Some(grads),
            Some(acc) => {
                for param in params {
                    let Some(grad) = grads.remove(param.as_tensor()) else { continue };
                    let sum = match acc.get(param.as_tensor()) {
                        Some(prev) => (prev + &grad)?,
                        None => grad,
                    };
                    acc.insert(param.as_tensor(), sum);
                }
            }
        }
        self.seen += 1;
        Ok(self.seen >= self.steps)
    }

    /// Hands out the summed gradients and starts a new window.
    pub fn take(&mut self) -> Option<GradStore> {
        self.seen = 0;
        self.accumulated.take()
    }

    pub fn micro_steps(&self) -> usize {
        self.seen
    }
}

/// Global L2 norm over the gradients of `params`; parameters without a
/// gradient contribute nothing.
pub fn grad_norm(grads: &GradStore, params: &[Var]) -> Result<f64> {
    let mut total = 0.0;
    for param in params {
        if let Some(grad) = grads.get(param.as_tensor()) {
            total += grad
                .to_dtype(DType::F64)?
                .sqr()?
                .sum_all()?
                .to_scalar::<f64>()?;
        }
    }
    Ok(total.sqrt())
}

/// Scales gradients in place so their global L2 norm is at most `max_norm`.
/// Returns the norm before clipping.
pub fn clip_grad_norm(grads: &mut GradStore, params: &[Var], max_norm: f64) -> Result<f64> {
    let norm = grad_norm(grads, params)?;

    if norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        debug!("Clipping gradient norm {:.4} to {}", norm, max_norm);
        for param in params {
            if let Some(grad) = grads.remove(param.as_tensor()) {
                grads.insert(param.as_tensor(), (grad * scale)?);
            }
        }
    }
    Ok(norm)
}

/// Learning rate scheduler trait
pub trait LRScheduler {
    fn get_lr(&self, step: usize) -> f64;
}

/// Linear warmup to `base_lr`, constant afterwards.
pub struct WarmupScheduler {
    base_lr: f64,
    warmup_steps: usize,
}

impl WarmupScheduler {
    pub fn new(base_lr: f64, warmup_steps: usize) -> Self {
        Self { base_lr, warmup_steps }
    }
}

impl LRScheduler for WarmupScheduler {
    fn get_lr(&self, step: usize) -> f64 {
        if self.warmup_steps == 0 {
            return self.base_lr;
        }
        self.base_lr * (step as f64 / self.warmup_steps as f64).min(1.0)
    }
}

/// Exponential moving average of the generator parameters.
pub struct EmaWeights {
    beta: f64,
    every: usize,
    start: usize,
    shadow: Vec<(String, Tensor)>,
}

impl EmaWeights {
    /// Snapshots the current parameter values. Updates run every `every`
    /// steps; up to and including step `start` the average just tracks the
    /// parameters.
    pub fn new(params: &[(String, Var)], beta: f64, every: usize, start: usize) -> Result<Self> {
        let shadow = params
            .iter()
            .map(|(name, var)| Ok((name.clone(), var.as_tensor().detach().copy()?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            beta,
            every: every.max(1),
            start,
            shadow,
        })
    }

    pub fn update(&mut self, params: &[(String, Var)], step: usize) -> Result<bool> {
        if step % self.every != 0 {
            return Ok(false);
        }
        let beta = if step <= self.start { 0.0 } else { self.beta };
        for ((_, ema), (_, var)) in self.shadow.iter_mut().zip(params) {
            let current = var.as_tensor().detach().to_dtype(ema.dtype())?;
            *ema = ((&*ema * beta)? + (current * (1.0 - beta))?)?;
        }
        Ok(true)
    }

    pub fn weights(&self) -> &[(String, Tensor)] {
        &self.shadow
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let tensors: HashMap<String, Tensor> = self.shadow.iter().cloned().collect();
        candle_core::safetensors::save(&tensors, path.as_ref())?;
        Ok(())
    }

    /// Replaces every averaged tensor with the one saved under its name.
    pub fn load<P: AsRef<Path>>(&mut self, path: P, device: &Device) -> Result<()> {
        let mut tensors = candle_core::safetensors::load(path.as_ref(), device)?;
        let mut loaded = Vec::with_capacity(self.shadow.len());
        for (name, ema) in &self.shadow {
            let tensor = tensors
                .remove(name)
                .ok_or_else(|| Error::Checkpoint(format!("EMA weights are missing {}", name)))?;
            if tensor.dims() != ema.dims() {
                return Err(Error::ShapeMismatch {
                    expected: ema.dims().to_vec(),
                    got: tensor.dims().to_vec(),
                });
            }
            loaded.push(tensor.to_dtype(ema.dtype())?);
        }
        for ((_, ema), tensor) in self.shadow.iter_mut().zip(loaded) {
            *ema = tensor;
        }
        Ok(())
    }

    /// Restarts the average from the current parameter values.
    pub fn reset_from(&mut self, params: &[(String, Var)]) -> Result<()> {
        for ((_, ema), (_, var)) in self.shadow.iter_mut().zip(params) {
            *ema = var.as_tensor().detach().to_dtype(ema.dtype())?.copy()?;
        }
        Ok(())
    }
}
