//! 8-bit AdamW optimizer for memory-efficient training
//! Stores both moments as blockwise-quantized u8 tensors to cut state memory to
//! roughly a quarter of f32 AdamW.
//!
//! Each block of 256 values shares one f32 absmax scale. The first moment is
//! stored signed (offset by 128); the second moment is stored as its square
//! root, which halves its dynamic range in log space.

use candle_core::{DType, Tensor, Var};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use super::adafactor::{dense_gradients, GradientSource};
use crate::error::{Error, Result};

/// Values per quantization block
const BLOCK: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdamW8bitConfig {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for AdamW8bitConfig {
    fn default() -> Self {
        Self {
            lr: 1e-4,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.01,
        }
    }
}

/// Blockwise absmax-quantized tensor.
#[derive(Debug, Clone)]
pub struct QuantizedTensor {
    /// u8 codes, `[blocks, BLOCK]`
    pub data: Tensor,
    /// f32 scale per block, `[blocks, 1]`
    pub scales: Tensor,
    pub signed: bool,
}

impl QuantizedTensor {
    pub fn quantize(tensor: &Tensor, signed: bool) -> Result<Self> {
        let flat = tensor.to_dtype(DType::F32)?.flatten_all()?;
        let n = flat.elem_count();
        let blocks = Self::blocks_for(n);
        let pad = blocks * BLOCK - n;
        let flat = if pad > 0 {
            Tensor::cat(&[&flat, &Tensor::zeros(pad, DType::F32, flat.device())?], 0)?
        } else {
            flat
        };
        let rows = flat.reshape((blocks, BLOCK))?;

        let levels = if signed { 127.0 } else { 255.0 };
        let scales = (rows.abs()?.max_keepdim(1)? / levels)?.maximum(1e-30)?;
        let codes = rows.broadcast_div(&scales)?.round()?;
        let codes = if signed {
            (codes + 128.0)?.clamp(1.0, 255.0)?
        } else {
            codes.clamp(0.0, 255.0)?
        };

        Ok(Self {
            data: codes.to_dtype(DType::U8)?,
            scales,
            signed,
        })
    }

    /// Dequantizes to f32 with the given shape.
    pub fn dequantize(&self, shape: &[usize]) -> Result<Tensor> {
        let codes = self.data.to_dtype(DType::F32)?;
        let codes = if self.signed { (codes - 128.0)? } else { codes };
        let flat = codes.broadcast_mul(&self.scales)?.flatten_all()?;
        let n = shape.iter().product();
        Ok(flat.narrow(0, 0, n)?.reshape(shape)?)
    }

    /// Whether this holds exactly the blocks needed for `n` values.
    fn fits(&self, n: usize) -> bool {
        self.data.dims() == [Self::blocks_for(n), BLOCK] && self.scales.dims() == [Self::blocks_for(n), 1]
    }

    fn blocks_for(n: usize) -> usize {
        n.div_ceil(BLOCK).max(1)
    }

    fn bytes(&self) -> usize {
        self.data.elem_count() + self.scales.elem_count() * 4
    }
}

#[derive(Debug, Clone)]
pub struct Moments {
    pub exp_avg: QuantizedTensor,
    /// Square root of the second moment
    pub exp_avg_sq: QuantizedTensor,
}

pub struct AdamW8bit {
    params: Vec<(String, Var)>,
    moments: Vec<Option<Moments>>,
    config: AdamW8bitConfig,
    step: usize,
}

impl AdamW8bit {
    pub fn new(params: Vec<(String, Var)>, config: AdamW8bitConfig) -> Self {
        let moments = vec![None; params.len()];
        Self {
            params,
            moments,
            config,
            step: 0,
        }
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.lr
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.lr = lr;
    }

    pub fn get_step(&self) -> usize {
        self.step
    }

    pub fn moments(&self, index: usize) -> Option<&Moments> {
        self.moments.get(index).and_then(|m| m.as_ref())
    }

    /// Performs one optimization step. As with Adafactor, every gradient and
    /// every stored moment is validated before any parameter is written.
    pub fn step<G: GradientSource>(&mut self, grads: &G) -> Result<()> {
        let dense = dense_gradients("AdamW8bit", &self.params, grads)?;
        for (index, _) in &dense {
            if let Some(moments) = &self.moments[*index] {
                let (name, var) = &self.params[*index];
                let n = var.elem_count();
                if !moments.exp_avg.fits(n) || !moments.exp_avg_sq.fits(n) {
                    return Err(Error::ContractViolation(format!(
                        "optimizer state for {} does not fit a parameter of shape {:?}",
                        name,
                        var.dims()
                    )));
                }
            }
        }
        if dense.is_empty() {
            return Ok(());
        }

        let step = self.step + 1;
        for (index, grad) in dense {
            let moments = self.update(index, &grad, step)?;
            self.moments[index] = Some(moments);
        }
        self.step = step;
        Ok(())
    }

    fn update(&self, index: usize, grad: &Tensor, step: usize) -> Result<Moments> {
        let AdamW8bitConfig {
            lr,
            beta1,
            beta2,
            eps,
            weight_decay,
        } = self.config;
        let var = &self.params[index].1;
        let compute = if var.dtype() == DType::F64 { DType::F64 } else { DType::F32 };
        let grad = grad.detach().to_dtype(compute)?;
        let device = grad.device();

        let (m, v) = match &self.moments[index] {
            Some(moments) => {
                let m = moments.exp_avg.dequantize(var.dims())?;
                let v = moments.exp_avg_sq.dequantize(var.dims())?.sqr()?;
                (
                    m.to_device(device)?.to_dtype(compute)?,
                    v.to_device(device)?.to_dtype(compute)?,
                )
            }
            None => (Tensor::zeros_like(&grad)?, Tensor::zeros_like(&grad)?),
        };

        let m = ((m * beta1)? + (&grad * (1.0 - beta1))?)?;
        let v = ((v * beta2)? + (grad.sqr()? * (1.0 - beta2))?)?;
        let m_hat = (&m / (1.0 - beta1.powi(step as i32)))?;
        let v_hat = (&v / (1.0 - beta2.powi(step as i32)))?;

        // Quantization can zero a second moment exact Adam would keep, so
        // bound the step by what exact Adam can produce
        let bound = ((1.0 - beta1) / (1.0 - beta2).sqrt()).max(1.0);
        let update = (m_hat / (v_hat.sqrt()? + eps)?)?.clamp(-bound, bound)?;

        let mut p = var.as_tensor().detach().to_dtype(compute)?;
        if weight_decay != 0.0 {
            p = (p * (1.0 - lr * weight_decay))?;
        }
        p = (p - (update * lr)?)?;
        var.set(&p.to_dtype(var.dtype())?)?;

        Ok(Moments {
            exp_avg: QuantizedTensor::quantize(&m, true)?,
            exp_avg_sq: QuantizedTensor::quantize(&v.sqrt()?, false)?,
        })
    }

    /// Get memory usage statistics: (parameters with state, state bytes)
    pub fn memory_stats(&self) -> (usize, usize) {
        self.moments.iter().flatten().fold((0, 0), |(count, bytes), m| {
            (count + 1, bytes + m.exp_avg.bytes() + m.exp_avg_sq.bytes())
        })
    }

    /// Saves quantized moments as safetensors, with the step counter in the header metadata.
    pub fn save_state<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut tensors: Vec<(String, Tensor)> = Vec::new();
        for ((name, _), moments) in self.params.iter().zip(&self.moments) {
            let Some(moments) = moments else { continue };
            for (key, q) in [("exp_avg", &moments.exp_avg), ("exp_avg_sq", &moments.exp_avg_sq)] {
                tensors.push((format!("{}.{}.q", name, key), q.data.clone()));
                tensors.push((format!("{}.{}.scales", name, key), q.scales.clone()));
            }
        }

        let mut metadata = HashMap::new();
        metadata.insert("optimizer".to_string(), "adamw8bit".to_string());
        metadata.insert("step".to_string(), self.step.to_string());
        safetensors::serialize_to_file(tensors, &Some(metadata), path.as_ref())
            .map_err(|e| Error::Checkpoint(format!("failed to write optimizer state: {}", e)))?;
        info!("Saved 8-bit optimizer state to {}", path.as_ref().display());
        Ok(())
    }

    /// Loads state written by `save_state`. Moments land on the CPU and are
    /// moved to each gradient's device when next used.
    pub fn load_state<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let buffer = std::fs::read(path.as_ref())?;
        let (_, header) = safetensors::SafeTensors::read_metadata(&buffer)
            .map_err(|e| Error::Checkpoint(format!("unreadable optimizer state: {}", e)))?;
        let metadata = header.metadata().clone().unwrap_or_default();
        let step = metadata
            .get("step")
            .ok_or_else(|| Error::Checkpoint("optimizer state has no step counter".to_string()))?
            .parse::<usize>()
            .map_err(|e| Error::Checkpoint(format!("bad step counter: {}", e)))?;
        let mut tensors = candle_core::safetensors::load_buffer(&buffer, &candle_core::Device::Cpu)?;

        let mut take = |name: &str, key: &str, signed: bool| -> Option<QuantizedTensor> {
            let data = tensors.remove(&format!("{}.{}.q", name, key))?;
            let scales = tensors.remove(&format!("{}.{}.scales", name, key))?;
            Some(QuantizedTensor { data, scales, signed })
        };

        let mut restored = 0;
        for ((name, _), slot) in self.params.iter().zip(self.moments.iter_mut()) {
            *slot = match (take(name, "exp_avg", true), take(name, "exp_avg_sq", false)) {
                (Some(exp_avg), Some(exp_avg_sq)) => {
                    restored += 1;
                    Some(Moments { exp_avg, exp_avg_sq })
                }
                (None, None) => None,
                _ => return Err(Error::Checkpoint(format!("incomplete moments for {}", name))),
            };
        }
        self.step = step;
        info!("Restored 8-bit optimizer state for {} parameters at step {}", restored, step);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trainers::adafactor::Gradient;
    use candle_core::Device;
    use candle_nn::{AdamW, Optimizer, ParamsAdamW};

    fn dense(grads: &[(usize, &Tensor)]) -> HashMap<usize, Gradient> {
        grads.iter().map(|(i, g)| (*i, Gradient::Dense((*g).clone()))).collect()
    }

    fn ramp(n: usize, lo: f32, hi: f32) -> Vec<f32> {
        (0..n).map(|i| lo + (hi - lo) * ((i * 37 % n) as f32 / n as f32)).collect()
    }

    #[test]
    fn test_quantize_round_trip_error_is_bounded() -> Result<()> {
        // 300 values: one full block plus a padded one
        let values: Vec<f32> = (0..300).map(|i| ((i as f32) * 0.3).sin() * (1.0 + i as f32 / 100.0)).collect();
        let t = Tensor::from_vec(values.clone(), (3, 100), &Device::Cpu)?;

        let q = QuantizedTensor::quantize(&t, true)?;
        assert_eq!(q.data.dims(), &[2, BLOCK]);
        assert_eq!(q.data.dtype(), DType::U8);
        let back = q.dequantize(&[3, 100])?.flatten_all()?.to_vec1::<f32>()?;
        for (block, chunk) in values.chunks(BLOCK).enumerate() {
            let absmax = chunk.iter().fold(0f32, |m, v| m.max(v.abs()));
            for (i, v) in chunk.iter().enumerate() {
                let err = (back[block * BLOCK + i] - v).abs();
                assert!(err <= absmax / 254.0 + 1e-6, "err {} at {}", err, block * BLOCK + i);
            }
        }

        let magnitudes = t.abs()?;
        let q = QuantizedTensor::quantize(&magnitudes, false)?;
        let back = q.dequantize(&[3, 100])?;
        let err = (back - magnitudes)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(err <= 4.0 / 510.0 + 1e-6);
        Ok(())
    }

    #[test]
    fn test_zero_tensor_quantizes_to_zero() -> Result<()> {
        let zeros = Tensor::zeros((4, 4), DType::F32, &Device::Cpu)?;
        let q = QuantizedTensor::quantize(&zeros, true)?;
        assert_eq!(q.dequantize(&[4, 4])?.abs()?.sum_all()?.to_scalar::<f32>()?, 0.0);
        Ok(())
    }

    #[test]
    fn test_tracks_full_precision_adamw() -> Result<()> {
        let device = Device::Cpu;
        let init = Tensor::from_vec(ramp(64, -1.0, 1.0), (8, 8), &device)?;
        let base = Tensor::from_vec(ramp(64, 0.5, 1.5), (8, 8), &device)?;
        let lr = 1e-2;

        let quantized = Var::from_tensor(&init)?;
        let exact = Var::from_tensor(&init)?;
        let config = AdamW8bitConfig {
            lr,
            ..Default::default()
        };
        let mut opt = AdamW8bit::new(vec![("w".to_string(), quantized.clone())], config.clone());
        let mut reference = AdamW::new(
            vec![exact.clone()],
            ParamsAdamW {
                lr,
                beta1: config.beta1,
                beta2: config.beta2,
                eps: config.eps,
                weight_decay: config.weight_decay,
            },
        )?;

        for t in 0..5 {
            let g = (&base * (1.0 + 0.1 * t as f64))?;
            opt.step(&dense(&[(0, &g)]))?;
            let loss = (exact.as_tensor() * &g)?.sum_all()?;
            reference.backward_step(&loss)?;
        }

        let diff = (quantized.as_tensor() - exact.as_tensor())?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 0.1 * lr as f32, "8-bit AdamW drifted {} from AdamW", diff);
        assert_eq!(opt.get_step(), 5);
        Ok(())
    }

    #[test]
    fn test_state_is_compact() -> Result<()> {
        let w = Var::zeros((64, 64), DType::F32, &Device::Cpu)?;
        let mut opt = AdamW8bit::new(vec![("w".to_string(), w)], AdamW8bitConfig::default());
        let g = Tensor::ones((64, 64), DType::F32, &Device::Cpu)?;
        opt.step(&dense(&[(0, &g)]))?;
        let (count, bytes) = opt.memory_stats();
        assert_eq!(count, 1);
        // two f32 moments would need 2 * 4096 * 4 bytes
        assert!(bytes < 2 * 4096 * 4 / 3, "{} bytes", bytes);
        Ok(())
    }

    #[test]
    fn test_sparse_gradient_rejected() -> Result<()> {
        let w = Var::ones(3, DType::F32, &Device::Cpu)?;
        let mut opt = AdamW8bit::new(vec![("w".to_string(), w.clone())], AdamW8bitConfig::default());
        let mut grads = HashMap::new();
        grads.insert(
            0,
            Gradient::Sparse {
                indices: Tensor::new(&[1u32], &Device::Cpu)?,
                values: Tensor::new(&[1.0f32], &Device::Cpu)?,
                shape: vec![3],
            },
        );
        assert!(matches!(opt.step(&grads), Err(Error::UnsupportedInput(_))));
        assert_eq!(w.as_tensor().to_vec1::<f32>()?, vec![1.0; 3]);
        assert_eq!(opt.get_step(), 0);
        Ok(())
    }

    #[test]
    fn test_state_save_load_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("optimizer.safetensors");
        let device = Device::Cpu;
        let init = Tensor::from_vec(ramp(300, -1.0, 1.0), 300, &device)?;
        let g1 = Tensor::from_vec(ramp(300, 0.2, 1.0), 300, &device)?;
        let g2 = Tensor::from_vec(ramp(300, -0.5, 0.7), 300, &device)?;

        let w = Var::from_tensor(&init)?;
        let mut opt = AdamW8bit::new(vec![("w".to_string(), w.clone())], AdamW8bitConfig::default());
        opt.step(&dense(&[(0, &g1)]))?;
        opt.save_state(&path)?;

        let w2 = Var::from_tensor(w.as_tensor())?;
        let mut resumed = AdamW8bit::new(vec![("w".to_string(), w2.clone())], AdamW8bitConfig::default());
        resumed.load_state(&path)?;
        assert_eq!(resumed.get_step(), 1);

        opt.step(&dense(&[(0, &g2)]))?;
        resumed.step(&dense(&[(0, &g2)]))?;
        let diff = (w.as_tensor() - w2.as_tensor())?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }

    #[test]
    fn test_stale_state_aborts_step() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("optimizer.safetensors");
        let a = Var::ones(4, DType::F32, &Device::Cpu)?;
        let b = Var::ones(4, DType::F32, &Device::Cpu)?;
        let mut opt = AdamW8bit::new(
            vec![("a".to_string(), a), ("b".to_string(), b)],
            AdamW8bitConfig::default(),
        );
        let g = Tensor::ones(4, DType::F32, &Device::Cpu)?;
        opt.step(&dense(&[(0, &g), (1, &g)]))?;
        opt.save_state(&path)?;

        // b grew past one quantization block
        let a2 = Var::ones(4, DType::F32, &Device::Cpu)?;
        let b2 = Var::ones(BLOCK + 1, DType::F32, &Device::Cpu)?;
        let mut grown = AdamW8bit::new(
            vec![("a".to_string(), a2.clone()), ("b".to_string(), b2)],
            AdamW8bitConfig::default(),
        );
        grown.load_state(&path)?;
        let gb = Tensor::ones(BLOCK + 1, DType::F32, &Device::Cpu)?;
        let err = grown.step(&dense(&[(0, &g), (1, &gb)])).unwrap_err();
        assert!(matches!(err, Error::ContractViolation(_)));
        assert_eq!(a2.as_tensor().to_vec1::<f32>()?, vec![1.0; 4]);
        assert!(grown.moments(1).is_some());
        assert_eq!(grown.get_step(), 1);
        Ok(())
    }
}
