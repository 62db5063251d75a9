//! Noise schedules: map the progression variable `t` to a log signal-to-noise ratio

use std::f64::consts::FRAC_PI_2;

/// Maps a progression variable `t` in [0, 1) to logSNR.
///
/// Implementations must be monotonically decreasing in `t`: larger `t` is noisier.
pub trait NoiseSchedule: Send + Sync {
    fn log_snr(&self, t: f64) -> f64;

    /// Evaluates the schedule for a batch, applying the resolution shift.
    ///
    /// A shift other than 1 offsets every logSNR by `2 * ln(1 / shift)`, which is
    /// the same as warping `t` towards noisier levels for larger shifts.
    fn log_snr_batch(&self, t: &[f64], shift: f64) -> Vec<f64> {
        let offset = if shift != 1.0 { 2.0 * (1.0 / shift).ln() } else { 0.0 };
        t.iter().map(|&t| self.log_snr(t) + offset).collect()
    }
}

/// Cosine schedule.
///
/// With `s == 0` this is `logSNR = -2 * ln(tan(t * pi / 2))`. A positive `s`
/// offsets the cosine the way the improved-DDPM schedule does.
#[derive(Debug, Clone)]
pub struct CosineSchedule {
    s: f64,
    clamp_range: (f64, f64),
    min_var: f64,
}

impl Default for CosineSchedule {
    fn default() -> Self {
        Self::new(0.0, (1e-4, 0.9999))
    }
}

impl CosineSchedule {
    pub fn new(s: f64, clamp_range: (f64, f64)) -> Self {
        let min_var = (s / (1.0 + s) * FRAC_PI_2).cos().powi(2);
        Self { s, clamp_range, min_var }
    }

    pub fn offset(&self) -> f64 {
        self.s
    }

    pub fn clamp_range(&self) -> (f64, f64) {
        self.clamp_range
    }
}

impl NoiseSchedule for CosineSchedule {
    fn log_snr(&self, t: f64) -> f64 {
        let t = t.clamp(self.clamp_range.0, self.clamp_range.1);
        if self.s == 0.0 {
            return -2.0 * (t * FRAC_PI_2).tan().ln();
        }
        let var = ((t + self.s) / (1.0 + self.s) * FRAC_PI_2).cos().powi(2) / self.min_var;
        // keep var strictly inside (0, 1) so the log stays finite
        let var = var.clamp(f64::MIN_POSITIVE, 1.0 - f64::EPSILON);
        (var / (1.0 - var)).ln()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_schedule_finite_and_decreasing() {
        let schedule = CosineSchedule::default();
        let mut prev = f64::INFINITY;
        for i in 1..1000 {
            let t = i as f64 / 1000.0;
            let log_snr = schedule.log_snr(t);
            assert!(log_snr.is_finite(), "t={} gave {}", t, log_snr);
            assert!(log_snr < prev, "not decreasing at t={}", t);
            prev = log_snr;
        }
    }

    #[test]
    fn test_cosine_schedule_clamps_endpoints() {
        let schedule = CosineSchedule::default();
        assert!(schedule.log_snr(0.0).is_finite());
        assert!(schedule.log_snr(1.0).is_finite());
        assert_eq!(schedule.log_snr(0.0), schedule.log_snr(1e-4));
        assert_eq!(schedule.log_snr(1.0), schedule.log_snr(0.9999));
    }

    #[test]
    fn test_midpoint_is_zero_log_snr() {
        let schedule = CosineSchedule::default();
        assert!(schedule.log_snr(0.5).abs() < 1e-12);
    }

    #[test]
    fn test_offset_schedule_decreasing() {
        let schedule = CosineSchedule::new(0.008, (1e-4, 0.9999));
        let values: Vec<f64> = [0.05, 0.3, 0.6, 0.95].iter().map(|&t| schedule.log_snr(t)).collect();
        assert!(values.windows(2).all(|w| w[0] > w[1]));
        assert!(values.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_shift_offsets_log_snr() {
        let schedule = CosineSchedule::default();
        let base = schedule.log_snr_batch(&[0.3], 1.0)[0];
        let shifted = schedule.log_snr_batch(&[0.3], 2.0)[0];
        assert!((base - shifted - 2.0 * 2f64.ln()).abs() < 1e-12);
    }
}
