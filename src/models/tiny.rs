//! Small stand-in generator for smoke runs and tests
//!
//! A 1x1 convolution over the latents plus per-channel offsets projected from
//! the pooled text embedding, the image embedding and the noise conditioning.
//! It has the same inputs and output shape as the real Stage C generator.

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Conv2d, Conv2dConfig, Init, Linear, Module, VarBuilder, VarMap};

use crate::error::{Error, Result};
use crate::trainers::{Conditioning, Generator};

pub struct TinyGenerator {
    conv: Conv2d,
    pooled_proj: Linear,
    image_proj: Linear,
    time_scale: Tensor,
    params: Vec<(String, Var)>,
    dtype: DType,
}

impl TinyGenerator {
    pub fn new(channels: usize, pooled_dim: usize, image_dim: usize, dtype: DType, device: &Device) -> Result<Self> {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, dtype, device);

        let conv = candle_nn::conv2d(channels, channels, 1, Conv2dConfig::default(), vb.pp("conv"))?;
        let pooled_proj = candle_nn::linear(pooled_dim, channels, vb.pp("pooled_proj"))?;
        let image_proj = candle_nn::linear(image_dim, channels, vb.pp("image_proj"))?;
        let time_scale = vb.get_with_hints((1, channels, 1, 1), "time_scale", Init::Const(0.1))?;

        let mut params: Vec<(String, Var)> = {
            let data = var_map
                .data()
                .lock()
                .map_err(|_| Error::ContractViolation("generator parameter map is poisoned".to_string()))?;
            data.iter().map(|(name, var)| (name.clone(), var.clone())).collect()
        };
        params.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(Self {
            conv,
            pooled_proj,
            image_proj,
            time_scale,
            params,
            dtype,
        })
    }

    /// Per-sample `[batch, channels, 1, 1]` offset from a `[batch, ...]` embedding.
    fn offset(proj: &Linear, embedding: &Tensor, dtype: DType, batch: usize, channels: usize) -> Result<Tensor> {
        let flat = embedding.flatten_from(1)?.to_dtype(dtype)?;
        Ok(proj.forward(&flat)?.reshape((batch, channels, 1, 1))?)
    }
}

impl Generator for TinyGenerator {
    fn forward(&self, noised: &Tensor, noise_cond: &Tensor, cond: &Conditioning) -> Result<Tensor> {
        let (batch, channels, _, _) = noised.dims4()?;
        let x = noised.to_dtype(self.dtype)?;

        let pooled = Self::offset(&self.pooled_proj, &cond.pooled_text_embedding, self.dtype, batch, channels)?;
        let image = Self::offset(&self.image_proj, &cond.image_embedding, self.dtype, batch, channels)?;
        let time = noise_cond
            .to_dtype(self.dtype)?
            .reshape((batch, 1, 1, 1))?
            .broadcast_mul(&self.time_scale)?;

        let out = self
            .conv
            .forward(&x)?
            .broadcast_add(&pooled)?
            .broadcast_add(&image)?
            .broadcast_add(&time)?;
        Ok(out.to_dtype(noised.dtype())?)
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        self.params.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_matches_latent_shape() -> Result<()> {
        let device = Device::Cpu;
        let generator = TinyGenerator::new(4, 8, 6, DType::F32, &device)?;
        let cond = Conditioning {
            text_embedding: Tensor::zeros((2, 3, 8), DType::F32, &device)?,
            pooled_text_embedding: Tensor::ones((2, 1, 8), DType::F32, &device)?,
            image_embedding: Tensor::ones((2, 1, 6), DType::F32, &device)?,
        };
        let noised = Tensor::randn(0f32, 1.0, (2, 4, 5, 5), &device)?;
        let noise_cond = Tensor::new(&[0.2f32, 0.7], &device)?;
        let out = generator.forward(&noised, &noise_cond, &cond)?;
        assert_eq!(out.dims(), noised.dims());

        let names: Vec<String> = generator.parameters().into_iter().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            vec![
                "conv.bias",
                "conv.weight",
                "image_proj.bias",
                "image_proj.weight",
                "pooled_proj.bias",
                "pooled_proj.weight",
                "time_scale"
            ]
        );
        Ok(())
    }
}
