//! Noise conditioning: the scalar the generator sees instead of a raw timestep

use std::f64::consts::FRAC_PI_2;

use super::scaler::sigmoid;
use super::schedule::CosineSchedule;

pub trait NoiseConditioner: Send + Sync {
    fn condition(&self, log_snr: f64) -> f64;
}

/// Inverts the cosine schedule to recover the effective `t` for a logSNR.
#[derive(Debug, Clone)]
pub struct CosineTNoiseCond {
    s: f64,
    clamp_range: (f64, f64),
    min_var: f64,
}

impl Default for CosineTNoiseCond {
    fn default() -> Self {
        Self::new(0.0, (0.0, 1.0))
    }
}

impl CosineTNoiseCond {
    pub fn new(s: f64, clamp_range: (f64, f64)) -> Self {
        let min_var = (s / (1.0 + s) * FRAC_PI_2).cos().powi(2);
        Self { s, clamp_range, min_var }
    }

    /// Conditioner that inverts `schedule` exactly.
    pub fn matching(schedule: &CosineSchedule) -> Self {
        Self::new(schedule.offset(), (0.0, 1.0))
    }
}

impl NoiseConditioner for CosineTNoiseCond {
    fn condition(&self, log_snr: f64) -> f64 {
        let var = sigmoid(log_snr).clamp(self.clamp_range.0, self.clamp_range.1);
        (var * self.min_var).sqrt().acos() / FRAC_PI_2 * (1.0 + self.s) - self.s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gdf::schedule::NoiseSchedule;

    #[test]
    fn test_cosine_t_inverts_schedule() {
        for s in [0.0, 0.008] {
            let schedule = CosineSchedule::new(s, (1e-4, 0.9999));
            let cond = CosineTNoiseCond::matching(&schedule);
            for t in [0.01, 0.1, 0.25, 0.5, 0.75, 0.9, 0.99] {
                let recovered = cond.condition(schedule.log_snr(t));
                assert!((recovered - t).abs() < 1e-6, "s={} t={} got {}", s, t, recovered);
            }
        }
    }

    #[test]
    fn test_cosine_t_saturates() {
        let cond = CosineTNoiseCond::default();
        assert!(cond.condition(100.0).abs() < 1e-9);
        assert!((cond.condition(-100.0) - 1.0).abs() < 1e-9);
    }
}
