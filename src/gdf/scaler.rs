//! Input scalers: how much signal and noise go into a noised sample

/// Converts a logSNR into `(signal_scale, noise_scale)`.
pub trait InputScaler: Send + Sync {
    fn scale(&self, log_snr: f64) -> (f64, f64);
}

/// Variance-preserving scaler: `a^2 + b^2 == 1` for every logSNR.
#[derive(Debug, Clone, Copy, Default)]
pub struct VPScaler;

impl InputScaler for VPScaler {
    fn scale(&self, log_snr: f64) -> (f64, f64) {
        (sigmoid(log_snr).sqrt(), sigmoid(-log_snr).sqrt())
    }
}

/// Numerically stable logistic function.
pub(crate) fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vp_scaler_preserves_variance() {
        let scaler = VPScaler;
        for i in -400..=400 {
            let log_snr = i as f64 / 10.0;
            let (a, b) = scaler.scale(log_snr);
            assert!((a * a + b * b - 1.0).abs() < 1e-12, "logSNR {}", log_snr);
            assert!((0.0..=1.0).contains(&a));
            assert!((0.0..=1.0).contains(&b));
        }
    }

    #[test]
    fn test_vp_scaler_extremes() {
        let (a, b) = VPScaler.scale(1000.0);
        assert_eq!(a, 1.0);
        assert_eq!(b, 0.0);
        let (a, b) = VPScaler.scale(-1000.0);
        assert_eq!(a, 0.0);
        assert_eq!(b, 1.0);
    }
}
