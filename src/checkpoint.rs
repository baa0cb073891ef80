use crate::model::{ModelKind, SbirModels};
use anyhow::{Context, Result};
use burn::module::{Module, ParamId};
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::record::{AdaptorRecord, AdaptorRecordV1};
use burn::optim::{Adam, AdamState, Optimizer};
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder};
use burn::tensor::backend::{AutodiffBackend, Backend};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Full precision so f32 weights and moments reload bit-for-bit.
pub type CheckpointRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

/// One Adam instance over all three models.
pub type SbirOptimizer<B> = OptimizerAdaptor<Adam, SbirModels<B>, B>;

type SbirOptimRecord<B> = <SbirOptimizer<B> as Optimizer<SbirModels<B>, B>>::Record;

pub const OPTIMIZER_BLOB: &str = "optim_dict";
pub const STATE_FILE: &str = "state.json";

/// Scalar training state stored next to the weight blobs.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct CheckpointState {
    /// Global index of the last iteration of the saved epoch.
    pub iteration: usize,
    /// Last completed epoch.
    pub epoch: usize,
    /// Adversarial weight in effect during that epoch.
    pub grl_weight: f64,
}

/// Write all three models, the optimizer and the state file into `dir`,
/// replacing whatever checkpoint was there.
pub fn save_checkpoint<B: AutodiffBackend>(
    dir: &Path,
    models: &SbirModels<B>,
    optimizer: &SbirOptimizer<B>,
    state: &CheckpointState,
) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create checkpoint dir {}", dir.display()))?;
    let recorder = CheckpointRecorder::new();

    models
        .image_model
        .clone()
        .save_file(dir.join(ModelKind::Image.blob_name()), &recorder)
        .context("failed to save image model")?;
    models
        .sketch_model
        .clone()
        .save_file(dir.join(ModelKind::Sketch.blob_name()), &recorder)
        .context("failed to save sketch model")?;
    models
        .domain_model
        .clone()
        .save_file(dir.join(ModelKind::Domain.blob_name()), &recorder)
        .context("failed to save domain model")?;
    Recorder::<B>::record(&recorder, optimizer.to_record(), dir.join(OPTIMIZER_BLOB))
        .context("failed to save optimizer state")?;

    let state_json =
        serde_json::to_string_pretty(state).context("failed to serialize checkpoint state")?;
    let state_path = dir.join(STATE_FILE);
    std::fs::write(&state_path, state_json)
        .with_context(|| format!("failed to write {}", state_path.display()))?;
    Ok(())
}

/// Restore models and optimizer from `dir`. Every blob must be present and
/// well formed.
pub fn load_checkpoint<B: AutodiffBackend>(
    dir: &Path,
    models: SbirModels<B>,
    optimizer: SbirOptimizer<B>,
    device: &B::Device,
) -> Result<(SbirModels<B>, SbirOptimizer<B>, CheckpointState)> {
    if !dir.is_dir() {
        anyhow::bail!("checkpoint dir {} does not exist", dir.display());
    }
    let recorder = CheckpointRecorder::new();

    let state_path = dir.join(STATE_FILE);
    let contents = std::fs::read_to_string(&state_path)
        .with_context(|| format!("failed to read {}", state_path.display()))?;
    let state: CheckpointState = serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse {}", state_path.display()))?;

    let SbirModels {
        image_model,
        sketch_model,
        domain_model,
    } = models;
    let models = SbirModels {
        image_model: image_model
            .load_file(dir.join(ModelKind::Image.blob_name()), &recorder, device)
            .context("failed to load image model")?,
        sketch_model: sketch_model
            .load_file(dir.join(ModelKind::Sketch.blob_name()), &recorder, device)
            .context("failed to load sketch model")?,
        domain_model: domain_model
            .load_file(dir.join(ModelKind::Domain.blob_name()), &recorder, device)
            .context("failed to load domain model")?,
    };

    let record: SbirOptimRecord<B> =
        Recorder::<B>::load(&recorder, dir.join(OPTIMIZER_BLOB), device)
            .context("failed to load optimizer state")?;
    let optimizer = optimizer.load_record(record);

    Ok((models, optimizer, state))
}

/// Adam moment estimates of one parameter, copied off the device.
#[derive(Debug, Clone, PartialEq)]
pub struct AdamMoments {
    pub time: usize,
    pub moment_1: Vec<f32>,
    pub moment_2: Vec<f32>,
}

/// Per-parameter Adam state held by `optimizer`. Empty before the first step.
pub fn adam_moments<B: AutodiffBackend>(
    optimizer: &SbirOptimizer<B>,
) -> HashMap<ParamId, AdamMoments> {
    optimizer
        .to_record()
        .into_iter()
        .map(|(id, record)| {
            let AdaptorRecord::V1(record) = record;
            let moments = match record {
                AdaptorRecordV1::Rank0(state) => moments_of(state),
                AdaptorRecordV1::Rank1(state) => moments_of(state),
                AdaptorRecordV1::Rank2(state) => moments_of(state),
                AdaptorRecordV1::Rank3(state) => moments_of(state),
                AdaptorRecordV1::Rank4(state) => moments_of(state),
                AdaptorRecordV1::Rank5(state) => moments_of(state),
                AdaptorRecordV1::Rank6(state) => moments_of(state),
                AdaptorRecordV1::Rank7(state) => moments_of(state),
                AdaptorRecordV1::Rank8(state) => moments_of(state),
            };
            (id, moments)
        })
        .collect()
}

fn moments_of<B: Backend, const D: usize>(state: AdamState<B, D>) -> AdamMoments {
    let to_vec = |tensor: burn::tensor::Tensor<B, D>| {
        tensor
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .unwrap_or_default()
    };
    AdamMoments {
        time: state.momentum.time,
        moment_1: to_vec(state.momentum.moment_1),
        moment_2: to_vec(state.momentum.moment_2),
    }
}
