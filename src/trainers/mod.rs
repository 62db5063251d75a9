pub mod adafactor;
pub mod adamw8bit;
pub mod stage_c;
pub mod stochastic_rounding;
pub mod sync;
pub mod training_helpers;

// Re-export key types
pub use adafactor::{Adafactor, AdafactorConfig, Gradient, GradientSource, LearningRate, WriteBack};
pub use adamw8bit::{AdamW8bit, AdamW8bitConfig, QuantizedTensor};
pub use stage_c::{Conditioning, Generator, StageCTrainer, StepOutput, TrainerOptimizer, TrainingInfo};
pub use stochastic_rounding::StochasticRounder;
pub use sync::{ReplicaSync, SingleProcess};
pub use training_helpers::{clip_grad_norm, grad_norm, EmaWeights, GradientAccumulator, LRScheduler, WarmupScheduler};

use candle_core::DType;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::gdf::GdfConfig;

/// Training run settings. Every field has a default, so a config file only
/// needs to name what it changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainSettings {
    pub experiment_id: String,
    pub checkpoint_path: PathBuf,
    pub batch_size: usize,
    /// Total optimizer updates
    pub updates: usize,
    pub grad_accum_steps: usize,
    pub warmup_updates: usize,
    /// Global gradient norm limit; 0 disables clipping
    pub max_grad_norm: f64,
    /// Update the parameter EMA every this many optimizer steps
    pub ema_iters: Option<usize>,
    pub ema_beta: Option<f64>,
    pub ema_start_iters: usize,
    pub save_every: usize,
    pub seed: u64,
    /// Parameter storage dtype: f32, f64, bf16 or f16
    pub dtype: String,
    /// Fraction of samples that keep their image embedding
    pub image_embedding_keep_prob: f64,
    /// `[channels, height, width]` of the latents
    pub latent_shape: [usize; 3],
    pub gdf: GdfConfig,
    pub optimizer: OptimizerSettings,
}

impl Default for TrainSettings {
    fn default() -> Self {
        Self {
            experiment_id: "stage_c".to_string(),
            checkpoint_path: PathBuf::from("output"),
            batch_size: 4,
            updates: 1000,
            grad_accum_steps: 1,
            warmup_updates: 1,
            max_grad_norm: 1.0,
            ema_iters: None,
            ema_beta: None,
            ema_start_iters: 5000,
            save_every: 500,
            seed: 42,
            dtype: "f32".to_string(),
            image_embedding_keep_prob: 0.1,
            latent_shape: [16, 24, 24],
            gdf: GdfConfig::default(),
            optimizer: OptimizerSettings::default(),
        }
    }
}

impl TrainSettings {
    pub fn dtype(&self) -> Result<DType> {
        match self.dtype.to_lowercase().as_str() {
            "f32" | "float32" => Ok(DType::F32),
            "f64" | "float64" => Ok(DType::F64),
            "bf16" | "bfloat16" => Ok(DType::BF16),
            "f16" | "float16" => Ok(DType::F16),
            other => Err(Error::Config(format!("unsupported dtype: {}", other))),
        }
    }

    /// `<checkpoint_path>/<experiment_id>`
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.checkpoint_path.join(&self.experiment_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerSettings {
    /// adafactor, adafactorstoch, adamw or adamw8bit
    #[serde(rename = "type")]
    pub optimizer_type: String,
    pub lr: f64,
    pub decay_rate: f64,
    pub clip_threshold: f64,
    pub eps: [f64; 2],
    pub weight_decay: f64,
    pub beta1: Option<f64>,
    pub relative_step: bool,
    pub scale_parameter: bool,
    pub warmup_init: bool,
    /// Seed for stochastic rounding; derived from the run seed when unset
    pub seed: Option<u64>,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            optimizer_type: "adafactorstoch".to_string(),
            lr: 1e-4,
            decay_rate: -0.8,
            clip_threshold: 1.0,
            eps: [1e-30, 1e-3],
            weight_decay: 0.0,
            beta1: None,
            relative_step: false,
            scale_parameter: false,
            warmup_init: false,
            seed: None,
        }
    }
}

impl OptimizerSettings {
    pub fn adafactor_config(&self, write_back: WriteBack) -> AdafactorConfig {
        AdafactorConfig {
            lr: if self.relative_step { None } else { Some(self.lr) },
            eps: self.eps,
            clip_threshold: self.clip_threshold,
            decay_rate: self.decay_rate,
            beta1: self.beta1,
            weight_decay: self.weight_decay,
            scale_parameter: self.scale_parameter,
            relative_step: self.relative_step,
            warmup_init: self.warmup_init,
            factored: true,
            write_back,
            seed: self.seed,
        }
    }

    /// `beta1` falls back to the AdamW default when unset.
    pub fn adamw8bit_config(&self) -> AdamW8bitConfig {
        let defaults = AdamW8bitConfig::default();
        AdamW8bitConfig {
            lr: self.lr,
            beta1: self.beta1.unwrap_or(defaults.beta1),
            weight_decay: self.weight_decay,
            ..defaults
        }
    }
}

/// Loads settings from YAML or JSON, picked by file extension.
pub fn load_settings<P: AsRef<Path>>(path: P) -> Result<TrainSettings> {
    let path = path.as_ref();
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    let text = fs::read_to_string(path)?;
    match extension.as_str() {
        "yml" | "yaml" => Ok(serde_yaml::from_str(&text)?),
        "json" => Ok(serde_json::from_str(&text)?),
        _ => Err(Error::Config(format!(
            "config file must be .yml, .yaml or .json: {}",
            path.display()
        ))),
    }
}
