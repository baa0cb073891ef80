use crate::checkpoint::{load_checkpoint, save_checkpoint, CheckpointState, SbirOptimizer};
use crate::data::{DataConfig, Dataloaders, TrainDataloader, TripletBatch};
use crate::metrics::{EpochMeters, RunningAverage};
use crate::model::{compute_losses, gradient_counts, LossConfig, ModelConfig, SbirModels};
use crate::utils::{eta, format_duration, wall_clock};
use anyhow::{Context, Result};
use burn::config::Config;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::ElementConversion;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Training configuration, loadable from and saved as `config.json`.
#[derive(Config, Debug)]
pub struct TrainingConfig {
    pub data_dir: String,
    pub checkpoint_dir: String,
    #[config(default = 32)]
    pub batch_size: usize,
    #[config(default = 10)]
    pub epochs: usize,
    #[config(default = 1e-3)]
    pub learning_rate: f64,
    #[config(default = 10)]
    pub print_every: usize,
    #[config(default = 5)]
    pub grl_warmup_epochs: usize,
    #[config(default = 25)]
    pub grl_threshold_epoch: usize,
    #[config(default = "GrlRamp::Linear")]
    pub grl_ramp: GrlRamp,
    #[config(default = true)]
    pub shuffle: bool,
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = "ModelConfig::new()")]
    pub model: ModelConfig,
    #[config(default = "LossConfig::new()")]
    pub loss: LossConfig,
    #[config(default = "AdamConfig::new()")]
    pub optimizer: AdamConfig,
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            anyhow::bail!("batch_size must be positive");
        }
        if self.epochs == 0 {
            anyhow::bail!("epochs must be positive");
        }
        if self.print_every == 0 {
            anyhow::bail!("print_every must be positive");
        }
        if self.grl_threshold_epoch == 0 {
            anyhow::bail!("grl_threshold_epoch must be positive");
        }
        if !(self.learning_rate > 0.0) {
            anyhow::bail!("learning_rate must be positive, got {}", self.learning_rate);
        }
        if !(self.loss.triplet_margin > 0.0) {
            anyhow::bail!("triplet_margin must be positive, got {}", self.loss.triplet_margin);
        }
        if self.model.image_size == 0 || self.model.embedding_dim == 0 {
            anyhow::bail!("image_size and embedding_dim must be positive");
        }
        Ok(())
    }
}

/// How the adversarial weight grows between warm-up and saturation.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrlRamp {
    /// `λ = epoch / threshold`.
    Linear,
    /// `λ = λ_prev * epoch / threshold`. Once warm-up has pinned λ to zero it
    /// stays zero until saturation.
    Compounding,
}

/// Which part of the adversarial schedule an epoch falls in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdversarialPhase {
    Warmup,
    Ramping,
    Saturated,
}

/// Per-epoch gradient-reversal weight.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GrlSchedule {
    pub warmup_epochs: usize,
    pub threshold_epoch: usize,
    pub ramp: GrlRamp,
}

impl GrlSchedule {
    pub fn from_config(config: &TrainingConfig) -> Self {
        Self {
            warmup_epochs: config.grl_warmup_epochs,
            threshold_epoch: config.grl_threshold_epoch,
            ramp: config.grl_ramp,
        }
    }

    pub fn phase(&self, epoch: usize) -> AdversarialPhase {
        if epoch < self.warmup_epochs {
            AdversarialPhase::Warmup
        } else if epoch < self.threshold_epoch {
            AdversarialPhase::Ramping
        } else {
            AdversarialPhase::Saturated
        }
    }

    /// Weight for `epoch`, given the weight used in the previous epoch.
    pub fn weight(&self, epoch: usize, previous: f64) -> f64 {
        match self.phase(epoch) {
            AdversarialPhase::Warmup => 0.0,
            AdversarialPhase::Saturated => 1.0,
            AdversarialPhase::Ramping => {
                let ratio = epoch as f64 / self.threshold_epoch as f64;
                match self.ramp {
                    GrlRamp::Linear => ratio,
                    GrlRamp::Compounding => previous * ratio,
                }
            }
        }
    }
}

/// Detached loss values of one training iteration.
#[derive(Debug, Clone, Copy)]
pub struct StepOutput {
    pub batch_size: usize,
    pub triplet_loss: f64,
    pub image_domain_loss: f64,
    pub sketch_domain_loss: f64,
    pub total_loss: f64,
    pub elapsed: Duration,
}

/// Owns the models, the shared optimizer and the per-epoch meters of one run.
pub struct TrainingSession<B: AutodiffBackend> {
    config: TrainingConfig,
    models: SbirModels<B>,
    optimizer: SbirOptimizer<B>,
    schedule: GrlSchedule,
    grl_weight: f64,
    epoch: usize,
    start_epoch: usize,
    iteration: usize,
    meters: EpochMeters,
    epoch_start: Instant,
    device: B::Device,
}

impl<B: AutodiffBackend> TrainingSession<B> {
    pub fn new(config: TrainingConfig, device: B::Device) -> Result<Self> {
        config.validate()?;
        B::seed(&device, config.seed);

        let models = config.model.init::<B>(&device);
        let optimizer = config.optimizer.init::<B, SbirModels<B>>();
        let schedule = GrlSchedule::from_config(&config);

        Ok(Self {
            config,
            models,
            optimizer,
            schedule,
            grl_weight: 0.0,
            epoch: 0,
            start_epoch: 0,
            iteration: 0,
            meters: EpochMeters::default(),
            epoch_start: Instant::now(),
            device,
        })
    }

    /// Load a checkpoint; training continues with the epoch after the saved one.
    pub fn resume(&mut self, dir: &Path) -> Result<CheckpointState> {
        let (models, optimizer, state) = load_checkpoint(
            dir,
            self.models.clone(),
            self.optimizer.clone(),
            &self.device,
        )
        .with_context(|| format!("failed to resume from {}", dir.display()))?;
        self.models = models;
        self.optimizer = optimizer;
        self.grl_weight = state.grl_weight;
        self.iteration = state.iteration;
        self.epoch = state.epoch;
        self.start_epoch = state.epoch + 1;
        log::info!(
            "resumed from {} (epoch {}, iteration {})",
            dir.display(),
            state.epoch,
            state.iteration
        );
        Ok(state)
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn models(&self) -> &SbirModels<B> {
        &self.models
    }

    pub fn optimizer(&self) -> &SbirOptimizer<B> {
        &self.optimizer
    }

    pub fn meters(&self) -> &EpochMeters {
        &self.meters
    }

    pub fn grl_weight(&self) -> f64 {
        self.grl_weight
    }

    pub fn phase(&self) -> AdversarialPhase {
        self.schedule.phase(self.epoch)
    }

    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    pub fn checkpoint_state(&self) -> CheckpointState {
        CheckpointState {
            iteration: self.iteration,
            epoch: self.epoch,
            grl_weight: self.grl_weight,
        }
    }

    /// Reset the meters and fix the adversarial weight for `epoch`.
    pub fn begin_epoch(&mut self, epoch: usize) {
        self.meters.reset();
        self.epoch = epoch;
        self.grl_weight = self.schedule.weight(epoch, self.grl_weight);
        self.epoch_start = Instant::now();
        log::debug!(
            "epoch {epoch}: {:?}, grl weight {:.4}",
            self.schedule.phase(epoch),
            self.grl_weight
        );
    }

    /// One forward/backward pass and one optimizer step over all three models.
    pub fn step(&mut self, batch: &TripletBatch<B>) -> StepOutput {
        let started = Instant::now();
        let batch_size = batch.batch_size();

        let losses = compute_losses(
            &self.models.sketch_model,
            &self.models.image_model,
            &self.models.domain_model,
            &self.config.loss,
            batch.anchors.clone(),
            batch.positives.clone(),
            batch.negatives.clone(),
            self.grl_weight,
        );
        let triplet_loss = scalar(&losses.triplet_loss);
        let image_domain_loss = scalar(&losses.image_domain_loss);
        let sketch_domain_loss = scalar(&losses.sketch_domain_loss);
        let total_loss = scalar(&losses.total_loss);
        if !total_loss.is_finite() {
            log::warn!("non-finite loss at epoch {}: {total_loss}", self.epoch);
        }

        // Each backward pass yields fresh gradients, so nothing needs zeroing.
        let grads = GradientsParams::from_grads(losses.total_loss.backward(), &self.models);
        if log::log_enabled!(log::Level::Debug) {
            log::debug!("params with gradient: {:?}", gradient_counts(&self.models, &grads));
        }
        self.models = self
            .optimizer
            .step(self.config.learning_rate, self.models.clone(), grads);

        let elapsed = started.elapsed();
        let weight = batch_size as f64;
        self.meters.triplet_loss.update(triplet_loss, weight);
        self.meters.image_domain_loss.update(image_domain_loss, weight);
        self.meters.sketch_domain_loss.update(sketch_domain_loss, weight);
        self.meters.iteration_time.update(elapsed.as_secs_f64(), 1.0);

        StepOutput {
            batch_size,
            triplet_loss,
            image_domain_loss,
            sketch_domain_loss,
            total_loss,
            elapsed,
        }
    }

    /// Release cached device memory and overwrite the checkpoint.
    pub fn end_epoch(&mut self, last_iteration: usize, num_batches: usize) -> Result<Duration> {
        let elapsed = self.epoch_start.elapsed();
        log::info!(
            "Epoch {} complete, time taken: {}",
            self.epoch,
            format_duration(elapsed)
        );
        B::memory_cleanup(&self.device);

        self.iteration = last_iteration + self.epoch * num_batches;
        self.save_checkpoint(Path::new(&self.config.checkpoint_dir))?;
        log::info!("Saved epoch!");
        Ok(elapsed)
    }

    pub fn save_checkpoint(&self, dir: &Path) -> Result<()> {
        save_checkpoint(dir, &self.models, &self.optimizer, &self.checkpoint_state())
            .with_context(|| format!("failed to save checkpoint to {}", dir.display()))
    }

    pub fn run_epoch(&mut self, epoch: usize, loader: &TrainDataloader<B>) -> Result<()> {
        self.begin_epoch(epoch);
        let num_batches = loader.num_batches();
        let mut last_iteration = None;

        for (iteration, batch) in loader.iter().enumerate() {
            let output = self.step(&batch);
            if iteration % self.config.print_every == 0 {
                self.log_progress(iteration, num_batches, &output);
            }
            last_iteration = Some(iteration);
        }

        let last_iteration = last_iteration.context("training loader produced no batches")?;
        self.end_epoch(last_iteration, num_batches)?;
        Ok(())
    }

    /// Train from the start epoch through `config.epochs - 1`.
    pub fn fit(&mut self, loader: &TrainDataloader<B>) -> Result<()> {
        if loader.num_batches() == 0 {
            anyhow::bail!("no training batches");
        }
        log::info!("Training...");
        for epoch in self.start_epoch..self.config.epochs {
            self.run_epoch(epoch, loader)?;
        }
        Ok(())
    }

    fn log_progress(&self, iteration: usize, num_batches: usize, output: &StepOutput) {
        let mean_time = self.meters.iteration_time.value().unwrap_or(0.0);
        let remaining = eta(mean_time, num_batches.saturating_sub(iteration));
        log::info!(
            "{} Epoch: {} [{} / {}] ; eta: {}",
            wall_clock(),
            self.epoch,
            iteration,
            num_batches,
            format_duration(remaining)
        );
        log::info!(
            "Average Triplet loss: {:.6}({:.6});",
            output.triplet_loss,
            mean(&self.meters.triplet_loss)
        );
        log::info!(
            "Sketch domain loss: {:.6}; Image Domain loss: {:.6}",
            mean(&self.meters.sketch_domain_loss),
            mean(&self.meters.image_domain_loss)
        );
    }
}

fn scalar<B: Backend>(tensor: &Tensor<B, 1>) -> f64 {
    tensor.clone().into_scalar().elem::<f64>()
}

fn mean(average: &RunningAverage) -> f64 {
    average.value().unwrap_or(f64::NAN)
}

/// Train the sketch/photo encoders with domain-adversarial metric learning.
pub fn train<B: AutodiffBackend>(
    config: TrainingConfig,
    device: B::Device,
    resume: Option<&Path>,
) -> Result<()> {
    config.validate()?;
    let checkpoint_dir = PathBuf::from(&config.checkpoint_dir);
    std::fs::create_dir_all(&checkpoint_dir)
        .with_context(|| format!("failed to create {}", checkpoint_dir.display()))?;
    config
        .save(checkpoint_dir.join("config.json"))
        .context("failed to save config.json")?;

    let data_config = DataConfig {
        image_size: config.model.image_size as u32,
        seed: config.seed,
    };
    let dataloaders = Dataloaders::new(Path::new(&config.data_dir), data_config)
        .with_context(|| format!("failed to load dataset from {}", config.data_dir))?;
    log::info!(
        "train classes -> {}, train sketches -> {}, test classes -> {}, test sketches -> {}",
        dataloaders.train_dict.len(),
        dataloaders.train_len(),
        dataloaders.test_dict.len(),
        dataloaders.test_len()
    );

    let loader =
        dataloaders.get_train_dataloader::<B>(config.batch_size, config.shuffle, device.clone());
    let mut session = TrainingSession::<B>::new(config, device)?;
    if let Some(dir) = resume {
        session.resume(dir)?;
    }
    session.fit(&loader)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule(ramp: GrlRamp) -> GrlSchedule {
        GrlSchedule {
            warmup_epochs: 5,
            threshold_epoch: 25,
            ramp,
        }
    }

    #[test]
    fn schedule_boundaries() {
        for ramp in [GrlRamp::Linear, GrlRamp::Compounding] {
            let s = schedule(ramp);
            assert_eq!(s.weight(0, 0.0), 0.0);
            assert_eq!(s.weight(4, 0.0), 0.0);
            assert_eq!(s.weight(25, 0.0), 1.0);
            assert_eq!(s.weight(40, 0.3), 1.0);
        }
    }

    #[test]
    fn phases_follow_epoch_index() {
        let s = schedule(GrlRamp::Linear);
        assert_eq!(s.phase(0), AdversarialPhase::Warmup);
        assert_eq!(s.phase(4), AdversarialPhase::Warmup);
        assert_eq!(s.phase(5), AdversarialPhase::Ramping);
        assert_eq!(s.phase(24), AdversarialPhase::Ramping);
        assert_eq!(s.phase(25), AdversarialPhase::Saturated);
    }

    #[test]
    fn linear_ramp_is_epoch_over_threshold_and_non_decreasing() {
        let s = schedule(GrlRamp::Linear);
        let mut previous = 0.0;
        for epoch in 0..30 {
            let weight = s.weight(epoch, previous);
            assert!(weight >= previous, "epoch {epoch}: {weight} < {previous}");
            if (5..25).contains(&epoch) {
                assert_eq!(weight, epoch as f64 / 25.0);
            }
            previous = weight;
        }
        assert_eq!(s.weight(5, 0.0), 0.2);
    }

    #[test]
    fn compounding_ramp_stays_at_zero_after_warmup() {
        let s = schedule(GrlRamp::Compounding);
        let mut weight = 0.0;
        for epoch in 0..25 {
            weight = s.weight(epoch, weight);
            assert_eq!(weight, 0.0, "epoch {epoch}");
        }
        assert_eq!(s.weight(25, weight), 1.0);
    }

    #[test]
    fn compounding_ramp_multiplies_a_nonzero_previous_weight() {
        let s = schedule(GrlRamp::Compounding);
        let w10 = s.weight(10, 1.0);
        assert_eq!(w10, 0.4);
        assert!((s.weight(20, w10) - 0.4 * 0.8).abs() < 1e-12);
    }

    #[test]
    fn config_defaults_match_the_reference_run() {
        let config = TrainingConfig::new("data".into(), "ckpt".into());
        assert_eq!(config.batch_size, 32);
        assert_eq!(config.epochs, 10);
        assert_eq!(config.learning_rate, 1e-3);
        assert_eq!(config.print_every, 10);
        assert_eq!(config.grl_warmup_epochs, 5);
        assert_eq!(config.grl_threshold_epoch, 25);
        assert_eq!(config.grl_ramp, GrlRamp::Linear);
        assert_eq!(config.loss.triplet_margin, 1.0);
        assert_eq!(config.loss.triplet_loss_ratio, 1.0);
        assert_eq!(config.loss.domain_loss_ratio, 0.5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_degenerate_settings() {
        let base = TrainingConfig::new("data".into(), "ckpt".into());
        assert!(base.clone().with_batch_size(0).validate().is_err());
        assert!(base.clone().with_epochs(0).validate().is_err());
        assert!(base.clone().with_print_every(0).validate().is_err());
        assert!(base.clone().with_grl_threshold_epoch(0).validate().is_err());
        assert!(base.clone().with_learning_rate(0.0).validate().is_err());
        assert!(base
            .with_loss(LossConfig::new().with_triplet_margin(-1.0))
            .validate()
            .is_err());
    }

    #[test]
    fn config_round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = TrainingConfig::new("data".into(), "ckpt".into())
            .with_grl_ramp(GrlRamp::Compounding)
            .with_batch_size(8);
        config.save(&path).unwrap();
        let loaded = TrainingConfig::load(&path).unwrap();
        assert_eq!(loaded.grl_ramp, GrlRamp::Compounding);
        assert_eq!(loaded.batch_size, 8);
        assert_eq!(loaded.checkpoint_dir, "ckpt");
    }
}
