use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::{relu, sigmoid};

/// Configuration for the photo-vs-sketch domain classifier.
#[derive(Config, Debug)]
pub struct DomainAdversarialNetConfig {
    pub embedding_dim: usize,
    pub hidden_dim: usize,
}

/// Binary classifier over embeddings: probability that an embedding came from
/// the photo domain.
#[derive(Module, Debug)]
pub struct DomainAdversarialNet<B: Backend> {
    fc_hidden: Linear<B>,
    fc_out: Linear<B>,
}

impl DomainAdversarialNetConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> DomainAdversarialNet<B> {
        DomainAdversarialNet {
            fc_hidden: LinearConfig::new(self.embedding_dim, self.hidden_dim).init(device),
            fc_out: LinearConfig::new(self.hidden_dim, 1).init(device),
        }
    }
}

impl<B: Backend> DomainAdversarialNet<B> {
    /// Forward pass returning `[batch, 1]` photo-domain probabilities.
    pub fn forward(&self, embeddings: Tensor<B, 2>) -> Tensor<B, 2> {
        let hidden = relu(self.fc_hidden.forward(embeddings));
        sigmoid(self.fc_out.forward(hidden))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    #[test]
    fn outputs_are_probabilities() {
        let device = Default::default();
        let net = DomainAdversarialNetConfig::new(6, 4).init::<NdArray<f32>>(&device);
        let embeddings = Tensor::<NdArray<f32>, 2>::random(
            [5, 6],
            burn::tensor::Distribution::Normal(0.0, 3.0),
            &device,
        );
        let probs = net.forward(embeddings);
        assert_eq!(probs.dims(), [5, 1]);
        let values = probs.into_data().to_vec::<f32>().expect("f32 data");
        assert!(values.iter().all(|p| (0.0..=1.0).contains(p)));
    }
}
