use super::SbirModels;
use burn::module::{Module, ModuleVisitor, Param, ParamId};
use burn::optim::GradientsParams;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;

/// Which of the jointly optimized models a parameter belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ModelKind {
    Image,
    Sketch,
    Domain,
}

impl ModelKind {
    pub const ALL: [ModelKind; 3] = [ModelKind::Image, ModelKind::Sketch, ModelKind::Domain];

    /// Name used for the model's checkpoint blob.
    pub fn blob_name(self) -> &'static str {
        match self {
            ModelKind::Image => "image_model",
            ModelKind::Sketch => "sketch_model",
            ModelKind::Domain => "domain_model",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.blob_name())
    }
}

/// A composite of image encoder, sketch encoder and domain classifier whose
/// parameters can be walked one model at a time.
pub trait JointModels<B: Backend> {
    fn visit_model<V: ModuleVisitor<B>>(&self, kind: ModelKind, visitor: &mut V);
}

impl<B: Backend> JointModels<B> for SbirModels<B> {
    fn visit_model<V: ModuleVisitor<B>>(&self, kind: ModelKind, visitor: &mut V) {
        match kind {
            ModelKind::Image => self.image_model.visit(visitor),
            ModelKind::Sketch => self.sketch_model.visit(visitor),
            ModelKind::Domain => self.domain_model.visit(visitor),
        }
    }
}

/// One float parameter copied off the device.
#[derive(Clone, Debug)]
pub struct ParamSnapshot {
    pub id: ParamId,
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl ParamSnapshot {
    fn bitwise_eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.shape == other.shape
            && self.values.len() == other.values.len()
            && self
                .values
                .iter()
                .zip(&other.values)
                .all(|(a, b)| a.to_bits() == b.to_bits())
    }
}

/// Snapshot of every float parameter in [`SbirModels`], grouped by owner.
#[derive(Clone, Debug, Default)]
pub struct ParameterSet {
    params: BTreeMap<ModelKind, Vec<ParamSnapshot>>,
}

impl ParameterSet {
    pub fn capture<B: Backend, M: JointModels<B>>(models: &M) -> Self {
        let params = ModelKind::ALL
            .into_iter()
            .map(|kind| (kind, snapshot(models, kind)))
            .collect();
        Self { params }
    }

    pub fn get(&self, kind: ModelKind) -> &[ParamSnapshot] {
        self.params.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn num_params(&self, kind: ModelKind) -> usize {
        self.get(kind).iter().map(|p| p.values.len()).sum()
    }

    /// Models whose parameters differ (bitwise) between two snapshots.
    pub fn changed_models(&self, after: &ParameterSet) -> Vec<ModelKind> {
        ModelKind::ALL
            .into_iter()
            .filter(|&kind| {
                let before = self.get(kind);
                let after = after.get(kind);
                before.len() != after.len()
                    || before.iter().zip(after).any(|(a, b)| !a.bitwise_eq(b))
            })
            .collect()
    }

    /// True when both snapshots hold bit-identical parameters with the same ids.
    pub fn bitwise_eq(&self, other: &ParameterSet) -> bool {
        self.changed_models(other).is_empty()
    }
}

fn snapshot<B: Backend, M: JointModels<B>>(models: &M, kind: ModelKind) -> Vec<ParamSnapshot> {
    let mut collector = ParamCollector::<B> {
        params: Vec::new(),
        _phantom: PhantomData,
    };
    models.visit_model(kind, &mut collector);
    collector.params
}

struct ParamCollector<B: Backend> {
    params: Vec<ParamSnapshot>,
    _phantom: PhantomData<B>,
}

impl<B: Backend> ModuleVisitor<B> for ParamCollector<B> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        let tensor = param.val();
        let shape = tensor.dims().to_vec();
        let values = tensor
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .unwrap_or_default();
        self.params.push(ParamSnapshot {
            id: param.id,
            shape,
            values,
        });
    }
}

/// Count, per model, the parameters that received a non-zero gradient.
pub fn gradient_counts<B: AutodiffBackend, M: JointModels<B>>(
    models: &M,
    grads: &GradientsParams,
) -> BTreeMap<ModelKind, usize> {
    ModelKind::ALL
        .into_iter()
        .map(|kind| {
            let mut counter = GradsCounter::<B> {
                grads,
                nonzero: 0,
                _phantom: PhantomData,
            };
            models.visit_model(kind, &mut counter);
            (kind, counter.nonzero)
        })
        .collect()
}

struct GradsCounter<'a, B: AutodiffBackend> {
    grads: &'a GradientsParams,
    nonzero: usize,
    _phantom: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradsCounter<'_, B> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        if let Some(grad) = self.grads.get::<B::InnerBackend, D>(param.id) {
            let magnitude = grad.abs().sum().into_scalar().elem::<f64>();
            if magnitude > 0.0 {
                self.nonzero += 1;
            }
        }
    }
}
