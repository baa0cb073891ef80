use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, Linear, LinearConfig, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation::leaky_relu;

/// Configuration for the convolutional embedding network shared by both domains.
#[derive(Config, Debug)]
pub struct EncoderConfig {
    pub input_channels: usize,
    pub base_dim: usize,
    pub embedding_dim: usize,
    #[config(default = 4)]
    pub num_blocks: usize,
}

/// Maps a batch of images (photos or sketches) to embedding vectors.
///
/// The photo and sketch encoders share this architecture but never share
/// parameters.
#[derive(Module, Debug)]
pub struct Encoder<B: Backend> {
    convs: Vec<Conv2d<B>>,
    bns: Vec<BatchNorm<B>>,
    fc: Linear<B>,
}

impl EncoderConfig {
    /// Initialize the encoder layers on the given device.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Encoder<B> {
        let blocks = self.num_blocks.max(1);
        let mut convs = Vec::with_capacity(blocks);
        let mut bns = Vec::with_capacity(blocks.saturating_sub(1));

        let mut in_channels = self.input_channels;
        let mut out_channels = self.base_dim;
        for block in 0..blocks {
            // First block has a bias and no norm, like a PatchGAN stem.
            convs.push(conv(in_channels, out_channels, block == 0, device));
            if block > 0 {
                bns.push(BatchNormConfig::new(out_channels).init(device));
            }
            in_channels = out_channels;
            out_channels = (out_channels * 2).min(self.base_dim * 8);
        }

        let fc = LinearConfig::new(in_channels, self.embedding_dim).init(device);
        Encoder { convs, bns, fc }
    }
}

impl<B: Backend> Encoder<B> {
    /// Forward pass returning `[batch, embedding_dim]` embeddings.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = leaky_relu(self.convs[0].forward(images), 0.2);
        for (conv, bn) in self.convs.iter().skip(1).zip(self.bns.iter()) {
            x = leaky_relu(bn.forward(conv.forward(x)), 0.2);
        }

        let [batch, channels, _, _] = x.dims();
        let pooled = x.mean_dim(3).mean_dim(2).reshape([batch, channels]);
        self.fc.forward(pooled)
    }
}

fn conv<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    bias: bool,
    device: &B::Device,
) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [3, 3])
        .with_stride([2, 2])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .with_bias(bias)
        .init(device)
}
