//! Stochastic rounding of f32 master values into bf16 storage
//!
//! bf16 is the upper half of an f32. Adding a uniform random integer in
//! [0, 2^16) to the low half before truncating rounds up with probability
//! equal to the discarded fraction, so the stored value is unbiased and small
//! updates survive repeated quantization instead of being truncated away.

use candle_core::{DType, Tensor};
use half::bf16;
use once_cell::unsync::OnceCell;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::error::Result;

/// Elements rounded per parallel work item.
const CHUNK: usize = 1 << 14;

pub struct StochasticRounder {
    rng: StdRng,
    // FFFF0000: keeps sign, exponent and the 7 bf16 mantissa bits
    mask: OnceCell<u32>,
}

impl StochasticRounder {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng,
            mask: OnceCell::new(),
        }
    }

    fn mask(&self) -> u32 {
        *self.mask.get_or_init(|| !((1u32 << 16) - 1))
    }

    /// Rounds every value to bf16. Large inputs are split into chunks that are
    /// rounded in parallel, each with its own seed drawn from this rounder.
    pub fn round_slice(&mut self, values: &[f32]) -> Vec<bf16> {
        let mask = self.mask();
        let seeds: Vec<u64> = (0..values.len().div_ceil(CHUNK)).map(|_| self.rng.gen()).collect();

        let mut out = vec![bf16::ZERO; values.len()];
        out.par_chunks_mut(CHUNK)
            .zip(values.par_chunks(CHUNK))
            .zip(seeds.par_iter())
            .for_each(|((dst, src), &seed)| {
                let mut rng = StdRng::seed_from_u64(seed);
                for (d, &s) in dst.iter_mut().zip(src) {
                    *d = round_with(s, rng.gen_range(0..1u32 << 16), mask);
                }
            });
        out
    }

    /// Stochastically rounds `source` into a bf16 tensor of the same shape and device.
    pub fn round_tensor(&mut self, source: &Tensor) -> Result<Tensor> {
        let values = source.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let rounded = self.round_slice(&values);
        Ok(Tensor::from_vec(rounded, source.dims(), source.device())?)
    }
}

#[inline]
fn round_with(x: f32, noise: u32, mask: u32) -> bf16 {
    if x.is_nan() {
        return bf16::NAN;
    }
    let bits = x.to_bits().wrapping_add(noise) & mask;
    bf16::from_bits((bits >> 16) as u16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_zero_stays_zero() {
        let mut rounder = StochasticRounder::new(Some(0));
        let rounded = rounder.round_slice(&[0.0; 4096]);
        assert!(rounded.iter().all(|v| v.to_bits() == 0));
    }

    #[test]
    fn test_representable_values_unchanged() {
        let mut rounder = StochasticRounder::new(Some(1));
        let values = [1.0f32, -2.5, 0.15625, 3.0e10, -7.0e-20];
        let exact: Vec<f32> = values.iter().map(|&v| bf16::from_f32(v).to_f32()).collect();
        for _ in 0..100 {
            let rounded: Vec<f32> = rounder.round_slice(&exact).iter().map(|v| v.to_f32()).collect();
            assert_eq!(rounded, exact);
        }
    }

    #[test]
    fn test_rounding_is_unbiased() {
        let mut rounder = StochasticRounder::new(Some(2));
        for x in [1.0f32 + 2f32.powi(-10), -3.14159, 0.0123] {
            let n = 20_000;
            let rounded = rounder.round_slice(&vec![x; n]);
            let mean = rounded.iter().map(|v| v.to_f32() as f64).sum::<f64>() / n as f64;
            let ulp = (bf16::from_f32(x.abs()).to_f32() as f64) * 2f64.powi(-7);
            assert!((mean - x as f64).abs() < 0.02 * ulp, "x={} mean={}", x, mean);
            // only the two neighbouring bf16 values ever appear
            let lo = f32::from_bits(x.to_bits() & 0xFFFF_0000);
            let hi = f32::from_bits((x.to_bits() & 0xFFFF_0000) + 0x1_0000);
            assert!(rounded.iter().all(|v| v.to_f32() == lo || v.to_f32() == hi));
        }
    }

    #[test]
    fn test_seed_determines_result() {
        let values: Vec<f32> = (0..50_000).map(|i| (i as f32).sin() * 3.3).collect();
        let a = StochasticRounder::new(Some(9)).round_slice(&values);
        let b = StochasticRounder::new(Some(9)).round_slice(&values);
        assert_eq!(a, b);
    }

    #[test]
    fn test_round_tensor_keeps_shape() -> Result<()> {
        let mut rounder = StochasticRounder::new(Some(3));
        let source = Tensor::ones((3, 5), DType::F32, &Device::Cpu)?;
        let rounded = rounder.round_tensor(&source)?;
        assert_eq!(rounded.dtype(), DType::BF16);
        assert_eq!(rounded.dims(), &[3, 5]);
        Ok(())
    }

    #[test]
    fn test_nan_preserved() {
        let mut rounder = StochasticRounder::new(Some(4));
        assert!(rounder.round_slice(&[f32::NAN])[0].is_nan());
    }
}
