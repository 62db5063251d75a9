//! Stage C training step
//!
//! Drives one generator through GDF: noise the latents, predict, weigh the
//! per-sample MSE, update the adaptive loss buckets on the primary replica,
//! then accumulate, clip and apply gradients.

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use log::{info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::adafactor::{Adafactor, WriteBack};
use super::adamw8bit::AdamW8bit;
use super::sync::{ReplicaSync, SingleProcess};
use super::training_helpers::{clip_grad_norm, grad_norm, EmaWeights, GradientAccumulator, LRScheduler, WarmupScheduler};
use super::{OptimizerSettings, TrainSettings};
use crate::error::{Error, Result};
use crate::gdf::{AdaptiveLossState, Gdf};

const GENERATOR_FILE: &str = "generator.safetensors";
const GENERATOR_EMA_FILE: &str = "generator_ema.safetensors";
const OPTIMIZER_FILE: &str = "optimizer.safetensors";
const INFO_FILE: &str = "info.json";

/// Conditioning inputs for one batch.
#[derive(Debug, Clone)]
pub struct Conditioning {
    /// `[batch, seq, dim]`
    pub text_embedding: Tensor,
    /// `[batch, 1, dim]`
    pub pooled_text_embedding: Tensor,
    /// `[batch, 1, dim]`
    pub image_embedding: Tensor,
}

/// The network being trained. Predicts the GDF target for noised latents.
pub trait Generator {
    fn forward(&self, noised: &Tensor, noise_cond: &Tensor, cond: &Conditioning) -> Result<Tensor>;

    /// Trainable parameters with stable names.
    fn parameters(&self) -> Vec<(String, Var)>;
}

/// Zeroes the image embedding of every sample except a random `keep_prob` share.
pub fn mask_image_embeddings<R: Rng>(embedding: &Tensor, keep_prob: f64, rng: &mut R) -> Result<Tensor> {
    let dims = embedding.dims();
    let batch = *dims
        .first()
        .ok_or_else(|| Error::ContractViolation("image embedding needs a batch dimension".to_string()))?;

    let keep: Vec<f32> = (0..batch)
        .map(|_| if rng.gen::<f64>() < keep_prob { 1.0 } else { 0.0 })
        .collect();
    let mut mask_shape = vec![1; dims.len()];
    mask_shape[0] = batch;
    let mask = Tensor::from_vec(keep, mask_shape, embedding.device())?.to_dtype(embedding.dtype())?;
    Ok(embedding.broadcast_mul(&mask)?)
}

pub enum TrainerOptimizer {
    Adafactor(Adafactor),
    AdamW(AdamW),
    AdamW8bit(AdamW8bit),
}

impl TrainerOptimizer {
    pub fn from_settings(settings: &OptimizerSettings, params: Vec<(String, Var)>) -> Result<Self> {
        match settings.optimizer_type.to_lowercase().as_str() {
            "adafactor" => Ok(Self::Adafactor(Adafactor::new(
                params,
                settings.adafactor_config(WriteBack::Direct),
            )?)),
            "adafactorstoch" => Ok(Self::Adafactor(Adafactor::new(
                params,
                settings.adafactor_config(WriteBack::StochasticRounding),
            )?)),
            "adamw" => {
                let config = ParamsAdamW {
                    lr: settings.lr,
                    weight_decay: settings.weight_decay,
                    ..Default::default()
                };
                let vars = params.into_iter().map(|(_, var)| var).collect();
                Ok(Self::AdamW(AdamW::new(vars, config)?))
            }
            "adamw8bit" => Ok(Self::AdamW8bit(AdamW8bit::new(params, settings.adamw8bit_config()))),
            other => Err(Error::Config(format!("unknown optimizer type: {}", other))),
        }
    }

    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        match self {
            Self::Adafactor(opt) => opt.step(grads),
            Self::AdamW(opt) => Ok(opt.step(grads)?),
            Self::AdamW8bit(opt) => opt.step(grads),
        }
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        match self {
            Self::Adafactor(opt) => opt.set_learning_rate(lr),
            Self::AdamW(opt) => opt.set_learning_rate(lr),
            Self::AdamW8bit(opt) => opt.set_learning_rate(lr),
        }
    }

    /// False when the learning rate is managed by the optimizer itself.
    fn has_fixed_lr(&self) -> bool {
        match self {
            Self::Adafactor(opt) => matches!(opt.learning_rate(), super::LearningRate::Fixed(_)),
            Self::AdamW(_) | Self::AdamW8bit(_) => true,
        }
    }

    fn save_state(&self, path: &Path) -> Result<()> {
        match self {
            Self::Adafactor(opt) => opt.save_state(path),
            Self::AdamW8bit(opt) => opt.save_state(path),
            Self::AdamW(_) => {
                warn!("AdamW state is not persisted; moments restart on resume");
                Ok(())
            }
        }
    }

    fn load_state(&mut self, path: &Path) -> Result<()> {
        match self {
            Self::Adafactor(opt) => opt.load_state(path),
            Self::AdamW8bit(opt) => opt.load_state(path),
            Self::AdamW(_) => Ok(()),
        }
    }
}

/// Run progress persisted as `info.json` next to each checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingInfo {
    pub total_steps: usize,
    pub loss: Option<f64>,
    pub adaptive_loss: Option<AdaptiveLossState>,
}

impl TrainingInfo {
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }
}

/// What one call to `train_step` did.
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// Unweighted batch mean of the per-sample MSE
    pub loss: f64,
    /// Weighted loss divided by the accumulation count, as backpropagated
    pub loss_adjusted: f64,
    /// Set when this micro-batch completed an accumulation window
    pub optimizer_step: Option<UpdateStats>,
}

#[derive(Debug, Clone, Copy)]
pub struct UpdateStats {
    pub step: usize,
    pub lr: f64,
    pub grad_norm: f64,
}

pub struct StageCTrainer<G: Generator, S: ReplicaSync = SingleProcess> {
    generator: G,
    gdf: Gdf,
    optimizer: TrainerOptimizer,
    params: Vec<(String, Var)>,
    vars: Vec<Var>,
    accumulator: GradientAccumulator,
    scheduler: WarmupScheduler,
    ema: Option<EmaWeights>,
    sync: S,
    settings: TrainSettings,
    info: TrainingInfo,
    rng: StdRng,
}

impl<G: Generator> StageCTrainer<G, SingleProcess> {
    pub fn new(generator: G, settings: TrainSettings) -> Result<Self> {
        Self::with_sync(generator, settings, SingleProcess)
    }
}

impl<G: Generator, S: ReplicaSync> StageCTrainer<G, S> {
    pub fn with_sync(generator: G, settings: TrainSettings, sync: S) -> Result<Self> {
        let gdf = Gdf::from_config(&settings.gdf)?;
        let params = generator.parameters();
        let vars = params.iter().map(|(_, var)| var.clone()).collect();

        let mut optimizer_settings = settings.optimizer.clone();
        if optimizer_settings.seed.is_none() {
            optimizer_settings.seed = Some(settings.seed);
        }
        let optimizer = TrainerOptimizer::from_settings(&optimizer_settings, params.clone())?;

        let ema = match (settings.ema_iters, settings.ema_beta) {
            (Some(every), Some(beta)) => Some(EmaWeights::new(&params, beta, every, settings.ema_start_iters)?),
            _ => None,
        };

        info!(
            "Stage C trainer: {} parameter tensors, optimizer {}, adaptive loss weight {}",
            params.len(),
            settings.optimizer.optimizer_type,
            settings.gdf.adaptive_loss_weight
        );

        Ok(Self {
            generator,
            gdf,
            optimizer,
            params,
            vars,
            accumulator: GradientAccumulator::new(settings.grad_accum_steps),
            scheduler: WarmupScheduler::new(settings.optimizer.lr, settings.warmup_updates),
            ema,
            sync,
            rng: StdRng::seed_from_u64(settings.seed),
            settings,
            info: TrainingInfo::default(),
        })
    }

    pub fn gdf(&self) -> &Gdf {
        &self.gdf
    }

    pub fn generator(&self) -> &G {
        &self.generator
    }

    pub fn info(&self) -> &TrainingInfo {
        &self.info
    }

    pub fn ema(&self) -> Option<&EmaWeights> {
        self.ema.as_ref()
    }

    /// Runs forward and backward on one micro-batch, stepping the optimizer
    /// when the accumulation window is full.
    pub fn train_step(&mut self, latents: &Tensor, cond: &Conditioning) -> Result<StepOutput> {
        if latents.rank() < 2 {
            return Err(Error::ContractViolation(format!(
                "latents must be [batch, ...], got shape {:?}",
                latents.dims()
            )));
        }

        let diffused = self
            .gdf
            .diffuse(latents, self.settings.gdf.shift, self.settings.gdf.loss_shift, &mut self.rng)?;
        let cond = Conditioning {
            image_embedding: mask_image_embeddings(
                &cond.image_embedding,
                self.settings.image_embedding_keep_prob,
                &mut self.rng,
            )?,
            ..cond.clone()
        };

        let pred = self.generator.forward(&diffused.noised, &diffused.noise_cond, &cond)?;
        if pred.dims() != diffused.target.dims() || pred.dtype() != diffused.target.dtype() {
            return Err(Error::ContractViolation(format!(
                "prediction {:?} {:?} does not match target {:?} {:?}",
                pred.dims(),
                pred.dtype(),
                diffused.target.dims(),
                diffused.target.dtype()
            )));
        }

        let per_sample = (pred.to_dtype(DType::F32)? - diffused.target.to_dtype(DType::F32)?)?
            .sqr()?
            .flatten_from(1)?
            .mean(1)?;
        let accum = self.settings.grad_accum_steps.max(1) as f64;
        let loss_adjusted = (per_sample.mul(&diffused.loss_weight)?.mean_all()? / accum)?;

        let losses = per_sample.detach().to_dtype(DType::F64)?.to_vec1::<f64>()?;
        if let Some(adaptive) = self.gdf.loss_weight_mut().as_adaptive_mut() {
            if self.sync.is_primary() {
                adaptive.update_buckets(&diffused.log_snr_values, &losses)?;
            }
            let shared = self.sync.broadcast_loss_buckets(adaptive.state())?;
            adaptive.restore(shared)?;
        }

        let grads = loss_adjusted.backward()?;
        let loss = losses.iter().sum::<f64>() / losses.len() as f64;
        let loss_adjusted = loss_adjusted.to_dtype(DType::F64)?.to_scalar::<f64>()?;
        self.info.loss = Some(loss);

        let optimizer_step = if self.accumulator.accumulate(grads, &self.vars)? {
            Some(self.apply_update()?)
        } else {
            None
        };

        Ok(StepOutput {
            loss,
            loss_adjusted,
            optimizer_step,
        })
    }

    fn apply_update(&mut self) -> Result<UpdateStats> {
        let Some(mut grads) = self.accumulator.take() else {
            return Err(Error::ContractViolation("no accumulated gradients to apply".to_string()));
        };

        let grad_norm = if self.settings.max_grad_norm > 0.0 {
            clip_grad_norm(&mut grads, &self.vars, self.settings.max_grad_norm)?
        } else {
            grad_norm(&grads, &self.vars)?
        };

        let step = self.info.total_steps + 1;
        let lr = self.scheduler.get_lr(step);
        if self.optimizer.has_fixed_lr() {
            self.optimizer.set_learning_rate(lr);
        }
        self.optimizer.step(&grads)?;
        self.info.total_steps = step;

        if let Some(ema) = &mut self.ema {
            ema.update(&self.params, step)?;
        }

        Ok(UpdateStats { step, lr, grad_norm })
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.settings.checkpoint_dir()
    }

    /// Writes generator weights, EMA weights, optimizer state and `info.json`.
    pub fn save_checkpoint(&mut self) -> Result<PathBuf> {
        let dir = self.checkpoint_dir();
        fs::create_dir_all(&dir)?;

        let weights: HashMap<String, Tensor> = self
            .params
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect();
        candle_core::safetensors::save(&weights, dir.join(GENERATOR_FILE))?;
        if let Some(ema) = &self.ema {
            ema.save(dir.join(GENERATOR_EMA_FILE))?;
        }
        self.optimizer.save_state(&dir.join(OPTIMIZER_FILE))?;

        self.info.adaptive_loss = self.gdf.loss_weight().as_adaptive().map(|a| a.state());
        self.info.save(dir.join(INFO_FILE))?;

        info!("Saved checkpoint at step {} to {}", self.info.total_steps, dir.display());
        Ok(dir)
    }

    /// Resumes from the checkpoint directory if it holds an `info.json`.
    /// Returns whether anything was restored.
    pub fn load_checkpoint(&mut self, device: &Device) -> Result<bool> {
        let dir = self.checkpoint_dir();
        let info_path = dir.join(INFO_FILE);
        if !info_path.exists() {
            return Ok(false);
        }

        let info = TrainingInfo::load(&info_path)?;
        if let (Some(state), Some(adaptive)) = (&info.adaptive_loss, self.gdf.loss_weight_mut().as_adaptive_mut()) {
            adaptive.restore(state.clone())?;
        }

        let generator_path = dir.join(GENERATOR_FILE);
        if generator_path.exists() {
            let mut weights = candle_core::safetensors::load(&generator_path, device)?;
            for (name, var) in &self.params {
                let tensor = weights
                    .remove(name)
                    .ok_or_else(|| Error::Checkpoint(format!("checkpoint is missing {}", name)))?;
                if tensor.dims() != var.dims() {
                    return Err(Error::ShapeMismatch {
                        expected: var.dims().to_vec(),
                        got: tensor.dims().to_vec(),
                    });
                }
                var.set(&tensor.to_dtype(var.dtype())?)?;
            }
        }

        if let Some(ema) = &mut self.ema {
            let ema_path = dir.join(GENERATOR_EMA_FILE);
            if ema_path.exists() {
                ema.load(&ema_path, device)?;
            } else {
                warn!("No EMA weights in {}; restarting the average from the generator", dir.display());
                ema.reset_from(&self.params)?;
            }
        }

        let optimizer_path = dir.join(OPTIMIZER_FILE);
        if optimizer_path.exists() {
            self.optimizer.load_state(&optimizer_path)?;
        }

        info!("Resumed from {} at step {}", dir.display(), info.total_steps);
        self.info = info;
        Ok(true)
    }
}
