pub mod domain;
pub mod encoder;
pub mod layers;
pub mod loss;
pub mod params;

use burn::prelude::*;

pub use domain::{DomainAdversarialNet, DomainAdversarialNetConfig};
pub use encoder::{Encoder, EncoderConfig};
pub use layers::grad_reverse;
pub use loss::{binary_cross_entropy, compute_losses, triplet_margin_loss, DomainAdversarialLosses};
pub use params::{gradient_counts, JointModels, ModelKind, ParameterSet};

/// Shapes of the two encoders and the domain classifier.
#[derive(Config, Debug)]
pub struct ModelConfig {
    #[config(default = 64)]
    pub image_size: usize,
    #[config(default = 3)]
    pub input_channels: usize,
    #[config(default = 32)]
    pub encoder_dim: usize,
    #[config(default = 4)]
    pub encoder_blocks: usize,
    #[config(default = 128)]
    pub embedding_dim: usize,
    #[config(default = 64)]
    pub domain_hidden_dim: usize,
}

/// Weighting for each loss term used during training.
#[derive(Config, Debug)]
pub struct LossConfig {
    #[config(default = 1.0)]
    pub triplet_margin: f64,
    #[config(default = 1.0)]
    pub triplet_loss_ratio: f64,
    #[config(default = 0.5)]
    pub domain_loss_ratio: f64,
}

impl ModelConfig {
    pub fn encoder_config(&self) -> EncoderConfig {
        EncoderConfig::new(self.input_channels, self.encoder_dim, self.embedding_dim)
            .with_num_blocks(self.encoder_blocks)
    }

    pub fn domain_config(&self) -> DomainAdversarialNetConfig {
        DomainAdversarialNetConfig::new(self.embedding_dim, self.domain_hidden_dim)
    }

    /// Build freshly initialized image, sketch and domain models.
    pub fn init<B: Backend>(&self, device: &B::Device) -> SbirModels<B> {
        let encoder = self.encoder_config();
        SbirModels {
            image_model: encoder.init(device),
            sketch_model: encoder.init(device),
            domain_model: self.domain_config().init(device),
        }
    }
}

/// The three jointly trained models.
///
/// A single optimizer steps this module, so every parameter of every
/// sub-model moves in the same update. [`ParameterSet`] and
/// [`gradient_counts`] attribute parameters back to the sub-model that owns
/// them.
#[derive(Module, Debug)]
pub struct SbirModels<B: Backend> {
    pub image_model: Encoder<B>,
    pub sketch_model: Encoder<B>,
    pub domain_model: DomainAdversarialNet<B>,
}

/// Anything that turns a batch of images into embeddings.
pub trait Encode<B: Backend> {
    fn encode(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;
}

/// Anything that scores embeddings with a photo-domain probability in `[0, 1]`.
pub trait DomainClassify<B: Backend> {
    fn classify(&self, embeddings: Tensor<B, 2>) -> Tensor<B, 2>;
}

impl<B: Backend> Encode<B> for Encoder<B> {
    fn encode(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.forward(images)
    }
}

impl<B: Backend> DomainClassify<B> for DomainAdversarialNet<B> {
    fn classify(&self, embeddings: Tensor<B, 2>) -> Tensor<B, 2> {
        self.forward(embeddings)
    }
}
