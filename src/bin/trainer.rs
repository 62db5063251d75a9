//! Stage C smoke-run trainer
//!
//! Trains the tiny generator on synthetic latents so the whole step runs end
//! to end: GDF noising, adaptive loss buckets, the configured optimizer,
//! checkpoints and info.json.
//!
//! Usage: cargo run --bin trainer -- --config config/stage_c.yaml

use anyhow::{bail, Context, Result};
use candle_core::{Device, Tensor};
use clap::Parser;
use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::path::PathBuf;

use stagec_trainer::models::TinyGenerator;
use stagec_trainer::trainers::{Conditioning, StageCTrainer, TrainSettings};

const EMBEDDING_DIM: usize = 64;
const TEXT_TOKENS: usize = 8;

#[derive(Parser, Debug)]
#[command(author, version, about = "Stage C smoke-run trainer")]
struct Args {
    /// Training configuration (.yaml, .yml or .json); defaults apply without one
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the number of optimizer updates
    #[arg(long)]
    steps: Option<usize>,

    /// Device to use (cpu, cuda, cuda:N)
    #[arg(long, default_value = "cpu")]
    device: String,
}

fn parse_device(name: &str) -> Result<Device> {
    match name {
        "cpu" => Ok(Device::Cpu),
        "cuda" => Ok(Device::new_cuda(0)?),
        other => match other.strip_prefix("cuda:") {
            Some(ordinal) => Ok(Device::new_cuda(ordinal.parse().context("bad cuda ordinal")?)?),
            None => bail!("unknown device: {}", other),
        },
    }
}

fn gaussian(rng: &mut StdRng, shape: &[usize], device: &Device) -> Result<Tensor> {
    let count = shape.iter().product();
    let values: Vec<f32> = (0..count).map(|_| rng.sample::<f32, _>(StandardNormal)).collect();
    Ok(Tensor::from_vec(values, shape, device)?)
}

fn synthetic_batch(rng: &mut StdRng, settings: &TrainSettings, device: &Device) -> Result<(Tensor, Conditioning)> {
    let b = settings.batch_size;
    let [c, h, w] = settings.latent_shape;
    let dtype = settings.dtype()?;
    let latents = gaussian(rng, &[b, c, h, w], device)?.to_dtype(dtype)?;
    let cond = Conditioning {
        text_embedding: gaussian(rng, &[b, TEXT_TOKENS, EMBEDDING_DIM], device)?,
        pooled_text_embedding: gaussian(rng, &[b, 1, EMBEDDING_DIM], device)?,
        image_embedding: gaussian(rng, &[b, 1, EMBEDDING_DIM], device)?,
    };
    Ok((latents, cond))
}

fn main() -> Result<()> {
    let args = Args::parse();
    stagec_trainer::logging::init_logger();

    let mut settings = match &args.config {
        Some(path) => stagec_trainer::load_settings(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => TrainSettings::default(),
    };
    if let Some(steps) = args.steps {
        settings.updates = steps;
    }
    let device = parse_device(&args.device)?;
    let dtype = settings.dtype()?;

    info!("Experiment {} on {:?}, {} updates", settings.experiment_id, device, settings.updates);

    let generator = TinyGenerator::new(settings.latent_shape[0], EMBEDDING_DIM, EMBEDDING_DIM, dtype, &device)?;
    let mut trainer = StageCTrainer::new(generator, settings.clone())?;
    if trainer.load_checkpoint(&device)? {
        info!("Continuing from step {}", trainer.info().total_steps);
    }

    let mut rng = StdRng::seed_from_u64(settings.seed.wrapping_add(trainer.info().total_steps as u64));

    #[cfg(feature = "progress-bar")]
    let progress = {
        let bar = indicatif::ProgressBar::new(settings.updates as u64);
        bar.set_style(
            indicatif::ProgressStyle::default_bar()
                .template("{bar:40} {pos}/{len} {msg}")
                .context("invalid progress template")?,
        );
        bar.set_position(trainer.info().total_steps as u64);
        bar
    };

    while trainer.info().total_steps < settings.updates {
        let (latents, cond) = synthetic_batch(&mut rng, &settings, &device)?;
        let out = trainer.train_step(&latents, &cond)?;

        let Some(update) = out.optimizer_step else { continue };

        #[cfg(feature = "progress-bar")]
        {
            progress.set_position(update.step as u64);
            progress.set_message(format!("loss {:.4}", out.loss));
        }

        if update.step % 10 == 0 {
            info!(
                "Step {}/{}: loss {:.6} adjusted {:.6} lr {:.3e} grad_norm {:.4}",
                update.step, settings.updates, out.loss, out.loss_adjusted, update.lr, update.grad_norm
            );
        }
        if settings.save_every > 0 && update.step % settings.save_every == 0 {
            trainer.save_checkpoint()?;
        }
    }

    #[cfg(feature = "progress-bar")]
    progress.finish();

    let dir = trainer.save_checkpoint()?;
    info!("Training complete, checkpoint at {}", dir.display());
    Ok(())
}
