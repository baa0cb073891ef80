#![recursion_limit = "256"]
use anyhow::{Context, Result};
use burn::backend::wgpu::graphics::AutoGraphicsApi;
use burn::backend::wgpu::{init_setup, RuntimeOptions, WgpuDevice};
use burn::backend::{Autodiff, NdArray, Wgpu};
use burn::config::Config;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use zssbir_burn::model::ModelConfig;
use zssbir_burn::training::{train, TrainingConfig};

#[derive(Parser, Debug)]
#[command(about = "Train zero-shot sketch-based image retrieval encoders with Burn")]
struct Args {
    /// JSON training config; flags below override its fields.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    data_dir: Option<String>,
    #[arg(long)]
    checkpoint_dir: Option<String>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    epochs: Option<usize>,
    #[arg(long)]
    learning_rate: Option<f64>,
    #[arg(long)]
    domain_loss_ratio: Option<f64>,
    #[arg(long)]
    triplet_loss_ratio: Option<f64>,
    #[arg(long)]
    grl_threshold_epoch: Option<usize>,
    #[arg(long)]
    print_every: Option<usize>,
    /// Continue from the checkpoint in this directory.
    #[arg(long)]
    resume: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = BackendKind::Wgpu)]
    backend: BackendKind,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum BackendKind {
    Ndarray,
    Wgpu,
    #[cfg(feature = "cuda")]
    Cuda,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let mut config = build_config(&args)?;
    let resume = args.resume.as_deref();

    match args.backend {
        BackendKind::Ndarray => {
            let device = burn::backend::ndarray::NdArrayDevice::default();
            train::<Autodiff<NdArray<f32>>>(config, device, resume)
        }
        BackendKind::Wgpu => {
            type Backend = Wgpu<f32, i32>;
            let device = WgpuDevice::default();
            let setup = init_setup::<AutoGraphicsApi>(&device, RuntimeOptions::default());
            let max_storage_buffer_binding_size =
                setup.device.limits().max_storage_buffer_binding_size as u64;
            adjust_batch_size_for_wgpu(&mut config, max_storage_buffer_binding_size)?;
            train::<Autodiff<Backend>>(config, device, resume)
        }
        #[cfg(feature = "cuda")]
        BackendKind::Cuda => {
            let device = burn::backend::cuda::CudaDevice::default();
            train::<Autodiff<burn::backend::Cuda<f32, i32>>>(config, device, resume)
        }
    }
}

fn build_config(args: &Args) -> Result<TrainingConfig> {
    let mut config = match &args.config {
        Some(path) => TrainingConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => {
            let data_dir = args
                .data_dir
                .clone()
                .context("--data-dir is required without --config")?;
            let checkpoint_dir = args
                .checkpoint_dir
                .clone()
                .context("--checkpoint-dir is required without --config")?;
            TrainingConfig::new(data_dir, checkpoint_dir)
        }
    };

    if let Some(data_dir) = &args.data_dir {
        config.data_dir = data_dir.clone();
    }
    if let Some(checkpoint_dir) = &args.checkpoint_dir {
        config.checkpoint_dir = checkpoint_dir.clone();
    }
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(epochs) = args.epochs {
        config.epochs = epochs;
    }
    if let Some(learning_rate) = args.learning_rate {
        config.learning_rate = learning_rate;
    }
    if let Some(ratio) = args.domain_loss_ratio {
        config.loss.domain_loss_ratio = ratio;
    }
    if let Some(ratio) = args.triplet_loss_ratio {
        config.loss.triplet_loss_ratio = ratio;
    }
    if let Some(epoch) = args.grl_threshold_epoch {
        config.grl_threshold_epoch = epoch;
    }
    if let Some(print_every) = args.print_every {
        config.print_every = print_every;
    }
    config.validate()?;
    Ok(config)
}

fn adjust_batch_size_for_wgpu(
    config: &mut TrainingConfig,
    max_storage_buffer_binding_size: u64,
) -> Result<()> {
    let elem_bytes = std::mem::size_of::<f32>() as u64;
    let per_sample_bytes = estimate_max_conv_workspace_elems(&config.model) * elem_bytes;
    if per_sample_bytes == 0 {
        return Ok(());
    }

    let max_batch = (max_storage_buffer_binding_size.saturating_sub(1) / per_sample_bytes) as usize;
    if max_batch == 0 {
        anyhow::bail!(
            "WGPU max storage buffer size ({max_storage_buffer_binding_size} bytes) is too small for a single sample (estimated {per_sample_bytes} bytes). Reduce image_size or encoder_dim."
        );
    }

    if config.batch_size > max_batch {
        log::warn!(
            "wgpu max storage buffer size {} bytes; estimated conv workspace per sample {} bytes. lowering batch_size from {} to {}.",
            max_storage_buffer_binding_size,
            per_sample_bytes,
            config.batch_size,
            max_batch
        );
        config.batch_size = max_batch;
    }
    Ok(())
}

/// Largest im2col workspace of any encoder conv, per sample.
fn estimate_max_conv_workspace_elems(model: &ModelConfig) -> u64 {
    let kernel_area = 9u64;
    let base = model.encoder_dim as u64;
    let mut size = model.image_size as u64;
    let mut in_channels = model.input_channels as u64;
    let mut out_channels = base;
    let mut max_elems = 0u64;

    for _ in 0..model.encoder_blocks.max(1) {
        size = conv_out(size, 3, 2, 1);
        max_elems = max_elems.max(in_channels * size * size * kernel_area);
        in_channels = out_channels;
        out_channels = (out_channels * 2).min(base * 8);
    }
    max_elems
}

fn conv_out(input: u64, kernel: u64, stride: u64, padding: u64) -> u64 {
    (input + 2 * padding - (kernel - 1) - 1) / stride + 1
}
