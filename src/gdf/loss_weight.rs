//! Per-sample loss weighting by noise level
//!
//! Two policies are available:
//! - P2: a fixed analytic curve over logSNR
//! - Adaptive: running mean losses bucketed by logSNR, updated every step from
//!   the observed per-sample losses
//!
//! The adaptive bucket state is plain data (`AdaptiveLossState`) so it can be
//! written to `info.json` and broadcast between replicas.

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Range every weight is clamped into after weighting.
const WEIGHT_CLAMP: (f64, f64) = (-1e9, 1e9);

pub trait LossWeighting: Send + Sync {
    fn weight(&self, log_snr: f64) -> f64;
}

/// Weighting applied to a whole batch, with the loss shift applied first.
///
/// A `loss_shift` other than 1 evaluates the curve at `logSNR + 2 * ln(loss_shift)`.
pub fn weigh_batch<W: LossWeighting + ?Sized>(weighting: &W, log_snr: &[f64], loss_shift: f64) -> Vec<f64> {
    let offset = if loss_shift != 1.0 { 2.0 * loss_shift.ln() } else { 0.0 };
    log_snr
        .iter()
        .map(|&l| weighting.weight(l + offset).clamp(WEIGHT_CLAMP.0, WEIGHT_CLAMP.1))
        .collect()
}

/// P2 weighting: `(k + exp(s * logSNR))^(-gamma)`.
#[derive(Debug, Clone)]
pub struct P2LossWeight {
    pub k: f64,
    pub gamma: f64,
    pub s: f64,
}

impl Default for P2LossWeight {
    fn default() -> Self {
        Self { k: 1.0, gamma: 1.0, s: 1.0 }
    }
}

impl LossWeighting for P2LossWeight {
    fn weight(&self, log_snr: f64) -> f64 {
        (self.k + (log_snr * self.s).exp()).powf(-self.gamma)
    }
}

/// Serialized adaptive bucket state.
///
/// `bucket_ranges` holds the `N + 1` edges of the `N` in-range buckets and
/// `bucket_losses` the `N + 1` running means, the last one belonging to the
/// fallback bucket for out-of-range logSNR.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveLossState {
    pub bucket_ranges: Vec<f64>,
    pub bucket_losses: Vec<f64>,
}

/// Adaptive weighting from bucketed running mean losses.
///
/// Buckets are half-open: bucket `i` covers `[edges[i], edges[i + 1])`. A logSNR
/// below the first edge, at or above the last edge, or NaN lands in the
/// fallback bucket. Every bucket starts at 1.0, so an unobserved noise level
/// has neutral weight.
#[derive(Debug, Clone)]
pub struct AdaptiveLossWeight {
    edges: Vec<f64>,
    losses: Vec<f64>,
    beta: f64,
    weight_range: (f64, f64),
}

impl Default for AdaptiveLossWeight {
    fn default() -> Self {
        Self {
            edges: uniform_edges(-20.0, 20.0, 300),
            losses: vec![1.0; 301],
            beta: 0.99,
            weight_range: (1e-7, 1e7),
        }
    }
}

impl AdaptiveLossWeight {
    pub fn new(log_snr_range: (f64, f64), buckets: usize, beta: f64, weight_range: (f64, f64)) -> Result<Self> {
        let (lo, hi) = log_snr_range;
        if buckets == 0 || !(lo < hi) || !lo.is_finite() || !hi.is_finite() {
            return Err(Error::Config(format!(
                "adaptive loss needs at least one bucket over a finite range, got {} over {:?}",
                buckets, log_snr_range
            )));
        }
        if !(0.0..1.0).contains(&beta) {
            return Err(Error::Config(format!("adaptive loss beta must be in [0, 1), got {}", beta)));
        }
        if !(weight_range.0 <= weight_range.1) {
            return Err(Error::Config(format!("invalid adaptive weight range {:?}", weight_range)));
        }
        Ok(Self {
            edges: uniform_edges(lo, hi, buckets),
            losses: vec![1.0; buckets + 1],
            beta,
            weight_range,
        })
    }

    /// Number of in-range buckets, not counting the fallback bucket.
    pub fn num_buckets(&self) -> usize {
        self.edges.len() - 1
    }

    pub fn fallback_bucket(&self) -> usize {
        self.num_buckets()
    }

    pub fn bucket_index(&self, log_snr: f64) -> usize {
        let first = self.edges[0];
        let last = self.edges[self.edges.len() - 1];
        if !(log_snr >= first && log_snr < last) {
            return self.fallback_bucket();
        }
        // edges are sorted, so this is the last edge <= log_snr
        self.edges.partition_point(|&e| e <= log_snr) - 1
    }

    pub fn bucket_loss(&self, bucket: usize) -> Option<f64> {
        self.losses.get(bucket).copied()
    }

    /// Folds a batch of observed losses into the running means.
    ///
    /// Samples sharing a bucket are averaged first, then each touched bucket
    /// takes one EMA step towards that average.
    pub fn update_buckets(&mut self, log_snr: &[f64], loss: &[f64]) -> Result<()> {
        if log_snr.len() != loss.len() {
            return Err(Error::ContractViolation(format!(
                "update_buckets got {} logSNR values but {} losses",
                log_snr.len(),
                loss.len()
            )));
        }

        let mut sums = vec![0.0f64; self.losses.len()];
        let mut counts = vec![0usize; self.losses.len()];
        for (&l, &value) in log_snr.iter().zip(loss) {
            if !value.is_finite() {
                debug!("Skipping non-finite loss {} at logSNR {}", value, l);
                continue;
            }
            let bucket = self.bucket_index(l);
            sums[bucket] += value;
            counts[bucket] += 1;
        }

        for (bucket, (&sum, &count)) in sums.iter().zip(&counts).enumerate() {
            if count > 0 {
                let observed = sum / count as f64;
                self.losses[bucket] = self.losses[bucket] * self.beta + observed * (1.0 - self.beta);
            }
        }
        Ok(())
    }

    pub fn state(&self) -> AdaptiveLossState {
        AdaptiveLossState {
            bucket_ranges: self.edges.clone(),
            bucket_losses: self.losses.clone(),
        }
    }

    /// Restores bucket edges and means, e.g. when resuming a run.
    pub fn restore(&mut self, state: AdaptiveLossState) -> Result<()> {
        let AdaptiveLossState { bucket_ranges, bucket_losses } = state;
        if bucket_ranges.len() != bucket_losses.len() || bucket_ranges.len() < 2 {
            return Err(Error::Config(format!(
                "bucket state needs two equal-length sequences of at least 2 values, got {} and {}",
                bucket_ranges.len(),
                bucket_losses.len()
            )));
        }
        if bucket_ranges.iter().any(|e| !e.is_finite()) || bucket_ranges.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::Config("bucket ranges must be finite and strictly increasing".to_string()));
        }
        if bucket_losses.iter().any(|l| !l.is_finite()) {
            return Err(Error::Config("bucket losses must be finite".to_string()));
        }
        self.edges = bucket_ranges;
        self.losses = bucket_losses;
        Ok(())
    }
}

impl LossWeighting for AdaptiveLossWeight {
    fn weight(&self, log_snr: f64) -> f64 {
        self.losses[self.bucket_index(log_snr)].clamp(self.weight_range.0, self.weight_range.1)
    }
}

fn uniform_edges(lo: f64, hi: f64, buckets: usize) -> Vec<f64> {
    let width = (hi - lo) / buckets as f64;
    (0..=buckets)
        .map(|i| if i == buckets { hi } else { lo + width * i as f64 })
        .collect()
}

/// The loss weighting policy active for a run.
#[derive(Debug, Clone)]
pub enum LossWeight {
    P2(P2LossWeight),
    Adaptive(AdaptiveLossWeight),
}

impl LossWeight {
    pub fn as_adaptive(&self) -> Option<&AdaptiveLossWeight> {
        match self {
            LossWeight::Adaptive(adaptive) => Some(adaptive),
            LossWeight::P2(_) => None,
        }
    }

    pub fn as_adaptive_mut(&mut self) -> Option<&mut AdaptiveLossWeight> {
        match self {
            LossWeight::Adaptive(adaptive) => Some(adaptive),
            LossWeight::P2(_) => None,
        }
    }
}

impl LossWeighting for LossWeight {
    fn weight(&self, log_snr: f64) -> f64 {
        match self {
            LossWeight::P2(p2) => p2.weight(log_snr),
            LossWeight::Adaptive(adaptive) => adaptive.weight(log_snr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> AdaptiveLossWeight {
        AdaptiveLossWeight::new((-10.0, 10.0), 10, 0.9, (1e-7, 1e7)).unwrap()
    }

    #[test]
    fn test_p2_matches_logistic_with_defaults() {
        let p2 = P2LossWeight::default();
        for l in [-5.0, -1.0, 0.0, 2.0, 7.5] {
            let expected = 1.0 / (1.0 + f64::exp(l));
            assert!((p2.weight(l) - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn test_fresh_buckets_have_unit_weight() {
        let adaptive = small();
        for l in [-9.5, 0.0, 9.99, 42.0] {
            assert_eq!(adaptive.weight(l), 1.0);
        }
    }

    #[test]
    fn test_half_open_bucket_edges() {
        let adaptive = small();
        assert_eq!(adaptive.bucket_index(-10.0), 0);
        assert_eq!(adaptive.bucket_index(-8.0), 1);
        assert_eq!(adaptive.bucket_index(-8.000001), 0);
        assert_eq!(adaptive.bucket_index(9.999), 9);
        assert_eq!(adaptive.bucket_index(10.0), adaptive.fallback_bucket());
        assert_eq!(adaptive.bucket_index(-10.5), adaptive.fallback_bucket());
        assert_eq!(adaptive.bucket_index(f64::NAN), adaptive.fallback_bucket());
    }

    #[test]
    fn test_update_moves_towards_batch_mean_without_overshoot() {
        let mut adaptive = small();
        let log_snr = [0.5, 1.0, 1.5];
        let loss = [0.2, 0.3, 0.4];
        let target = 0.3;
        let mut prev = adaptive.weight(1.0);
        for _ in 0..50 {
            adaptive.update_buckets(&log_snr, &loss).unwrap();
            let w = adaptive.weight(1.0);
            assert!(w < prev, "weight should move down towards the batch mean");
            assert!(w > target, "weight must not pass the batch mean");
            prev = w;
        }
        assert!((prev - target).abs() < 0.01);
        // other buckets stay untouched
        assert_eq!(adaptive.weight(-5.0), 1.0);
    }

    #[test]
    fn test_out_of_range_uses_fallback_bucket() {
        let mut adaptive = small();
        adaptive.update_buckets(&[25.0, -30.0], &[3.0, 5.0]).unwrap();
        let fallback = adaptive.bucket_loss(adaptive.fallback_bucket()).unwrap();
        assert!((fallback - (0.9 + 0.1 * 4.0)).abs() < 1e-12);
        assert_eq!(adaptive.weight(1e6), fallback);
        assert_eq!(adaptive.weight(0.0), 1.0);
    }

    #[test]
    fn test_update_rejects_length_mismatch() {
        let mut adaptive = small();
        let err = adaptive.update_buckets(&[0.0, 1.0], &[1.0]).unwrap_err();
        assert!(matches!(err, Error::ContractViolation(_)));
    }

    #[test]
    fn test_state_round_trip_through_json() {
        let mut adaptive = small();
        adaptive.update_buckets(&[-3.0, 4.0], &[0.5, 2.0]).unwrap();
        let json = serde_json::to_string(&adaptive.state()).unwrap();
        let state: AdaptiveLossState = serde_json::from_str(&json).unwrap();
        assert_eq!(state.bucket_ranges.len(), state.bucket_losses.len());

        let mut restored = AdaptiveLossWeight::default();
        restored.restore(state).unwrap();
        assert_eq!(restored.num_buckets(), 10);
        for l in [-3.0, 4.0, 0.0, 11.0] {
            assert_eq!(restored.weight(l), adaptive.weight(l));
        }
    }

    #[test]
    fn test_restore_rejects_bad_state() {
        let mut adaptive = small();
        let uneven = AdaptiveLossState { bucket_ranges: vec![0.0, 1.0], bucket_losses: vec![1.0] };
        assert!(adaptive.restore(uneven).is_err());
        let unsorted = AdaptiveLossState { bucket_ranges: vec![1.0, 0.0], bucket_losses: vec![1.0, 1.0] };
        assert!(adaptive.restore(unsorted).is_err());
    }

    #[test]
    fn test_loss_shift_offsets_curve() {
        let p2 = P2LossWeight::default();
        let shifted = weigh_batch(&p2, &[0.0], 2.0)[0];
        assert!((shifted - p2.weight(2.0 * 2f64.ln())).abs() < 1e-12);
    }
}
