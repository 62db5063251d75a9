//! Criterion benchmarks for the bf16 write-back paths.
//!
//! Compares stochastic rounding against a plain cast, and a full Adafactor
//! step with each write-back, over a size sweep.
//!
//! Run: cargo bench --bench stochastic_rounding

use candle_core::{DType, Device, Tensor, Var};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::collections::HashMap;

use stagec_trainer::trainers::{Adafactor, AdafactorConfig, Gradient, StochasticRounder, WriteBack};

fn make_values(n: usize) -> Vec<f32> {
    (0..n).map(|i| ((i as f32) * 0.001).sin() * 4.0).collect()
}

fn bench_rounding(c: &mut Criterion) {
    let mut group = c.benchmark_group("bf16_write_back");
    for n in [1 << 12, 1 << 16, 1 << 20] {
        let values = make_values(n);
        let mut rounder = StochasticRounder::new(Some(42));
        group.throughput(Throughput::Elements(n as u64));

        group.bench_with_input(BenchmarkId::new("stochastic", n), &n, |b, _| {
            b.iter(|| rounder.round_slice(&values));
        });
        group.bench_with_input(BenchmarkId::new("cast", n), &n, |b, _| {
            b.iter(|| values.iter().map(|&v| half::bf16::from_f32(v)).collect::<Vec<_>>());
        });
    }
    group.finish();
}

fn bench_adafactor_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("adafactor_step");
    for dim in [256, 1024] {
        for write_back in [WriteBack::Direct, WriteBack::StochasticRounding] {
            let device = Device::Cpu;
            let init = Tensor::ones((dim, dim), DType::BF16, &device).unwrap();
            let var = Var::from_tensor(&init).unwrap();
            let config = AdafactorConfig {
                lr: Some(1e-3),
                write_back,
                seed: Some(0),
                ..Default::default()
            };
            let mut opt = Adafactor::new(vec![("w".to_string(), var)], config).unwrap();
            let grad = Tensor::randn(0f32, 1.0, (dim, dim), &device).unwrap();
            let grads: HashMap<usize, Gradient> = [(0, Gradient::Dense(grad))].into_iter().collect();

            group.bench_with_input(BenchmarkId::new(format!("{:?}", write_back), dim), &dim, |b, _| {
                b.iter(|| opt.step(&grads).unwrap());
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_rounding, bench_adafactor_step);
criterion_main!(benches);
