use super::layers::grad_reverse;
use super::{DomainClassify, Encode, LossConfig};
use burn::prelude::*;

/// Added to embedding differences before taking the norm, so identical
/// embeddings still have a finite distance gradient.
const PAIRWISE_EPS: f64 = 1e-6;
/// Lower bound for probabilities inside the BCE logarithms.
const BCE_EPS: f64 = 1e-12;

/// Loss terms produced by one adversarial training pass.
#[derive(Debug)]
pub struct DomainAdversarialLosses<B: Backend> {
    pub triplet_loss: Tensor<B, 1>,
    pub image_domain_loss: Tensor<B, 1>,
    pub sketch_domain_loss: Tensor<B, 1>,
    pub domain_loss: Tensor<B, 1>,
    pub total_loss: Tensor<B, 1>,
}

/// Triplet margin loss with Euclidean (p = 2) distance, averaged over the batch.
pub fn triplet_margin_loss<B: Backend>(
    anchor: Tensor<B, 2>,
    positive: Tensor<B, 2>,
    negative: Tensor<B, 2>,
    margin: f64,
) -> Tensor<B, 1> {
    let d_pos = pairwise_distance(anchor.clone(), positive);
    let d_neg = pairwise_distance(anchor, negative);
    d_pos.sub(d_neg).add_scalar(margin).clamp_min(0.0).mean()
}

fn pairwise_distance<B: Backend>(x: Tensor<B, 2>, y: Tensor<B, 2>) -> Tensor<B, 2> {
    x.sub(y).add_scalar(PAIRWISE_EPS).square().sum_dim(1).sqrt()
}

/// Mean binary cross-entropy between probabilities and `{0, 1}` targets.
pub fn binary_cross_entropy<B: Backend>(
    probs: Tensor<B, 2>,
    targets: Tensor<B, 2>,
) -> Tensor<B, 1> {
    let log_p = probs.clone().clamp(BCE_EPS, 1.0).log();
    let log_not_p = probs.neg().add_scalar(1.0).clamp(BCE_EPS, 1.0).log();
    let not_targets = targets.clone().neg().add_scalar(1.0);
    targets
        .mul(log_p)
        .add(not_targets.mul(log_not_p))
        .neg()
        .mean()
}

/// Forward both encoders and the domain classifier and combine the triplet and
/// domain-confusion objectives into one scalar.
///
/// Every embedding passes through [`grad_reverse`] at `grl_weight` before the
/// domain classifier, so the backward pass of `total_loss` trains the
/// classifier to separate the domains and the encoders to confuse it.
pub fn compute_losses<B, S, I, D>(
    sketch_encoder: &S,
    image_encoder: &I,
    domain_net: &D,
    loss_config: &LossConfig,
    anchors: Tensor<B, 4>,
    positives: Tensor<B, 4>,
    negatives: Tensor<B, 4>,
    grl_weight: f64,
) -> DomainAdversarialLosses<B>
where
    B: Backend,
    S: Encode<B>,
    I: Encode<B>,
    D: DomainClassify<B>,
{
    let device = anchors.device();
    let batch_size = anchors.dims()[0];

    let sketch_features = sketch_encoder.encode(anchors);
    let positive_features = image_encoder.encode(positives);
    let negative_features = image_encoder.encode(negatives);

    let triplet_loss = triplet_margin_loss(
        sketch_features.clone(),
        positive_features.clone(),
        negative_features.clone(),
        loss_config.triplet_margin,
    )
    .mul_scalar(loss_config.triplet_loss_ratio);

    let image_targets = Tensor::<B, 2>::ones([batch_size, 1], &device);
    let sketch_targets = Tensor::<B, 2>::zeros([batch_size, 1], &device);

    let pred_positives = domain_net.classify(grad_reverse(positive_features, grl_weight));
    let pred_negatives = domain_net.classify(grad_reverse(negative_features, grl_weight));
    let pred_sketches = domain_net.classify(grad_reverse(sketch_features, grl_weight));

    // Positives and negatives are both photos; their mean is the image half.
    let image_domain_loss = binary_cross_entropy(pred_positives, image_targets.clone())
        .add(binary_cross_entropy(pred_negatives, image_targets))
        .mul_scalar(0.5 * loss_config.domain_loss_ratio);
    let sketch_domain_loss = binary_cross_entropy(pred_sketches, sketch_targets)
        .mul_scalar(loss_config.domain_loss_ratio);
    let domain_loss = image_domain_loss.clone().add(sketch_domain_loss.clone());
    let total_loss = triplet_loss.clone().add(domain_loss.clone());

    DomainAdversarialLosses {
        triplet_loss,
        image_domain_loss,
        sketch_domain_loss,
        domain_loss,
        total_loss,
    }
}
