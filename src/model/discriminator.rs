//! Labeled-vs-unlabeled discriminator for discriminative active learning
//!
//! A small MLP over pooled backbone embeddings. Class 1 means "from the unlabeled
//! pool".

use burn::{
    config::Config,
    module::Module,
    nn::{Linear, LinearConfig, Relu},
    tensor::{activation::softmax, backend::Backend, Tensor},
};

#[derive(Config, Debug)]
pub struct DiscriminatorConfig {
    pub input_dim: usize,

    #[config(default = "512")]
    pub hidden: usize,
}

impl DiscriminatorConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Discriminator<B> {
        Discriminator {
            fc1: LinearConfig::new(self.input_dim, self.hidden).init(device),
            fc2: LinearConfig::new(self.hidden, self.hidden).init(device),
            fc3: LinearConfig::new(self.hidden, 2).init(device),
            relu: Relu::new(),
        }
    }
}

#[derive(Module, Debug)]
pub struct Discriminator<B: Backend> {
    fc1: Linear<B>,
    fc2: Linear<B>,
    fc3: Linear<B>,
    relu: Relu,
}

impl<B: Backend> Discriminator<B> {
    /// Logits `[batch, 2]`
    pub fn forward(&self, embedding: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.relu.forward(self.fc1.forward(embedding));
        let x = self.relu.forward(self.fc2.forward(x));
        self.fc3.forward(x)
    }

    /// Probability that each row came from the unlabeled pool, shape `[batch]`
    pub fn prob_unlabeled(&self, embedding: Tensor<B, 2>) -> Tensor<B, 1> {
        let probs = softmax(self.forward(embedding), 1);
        let [batch_size, _] = probs.dims();
        probs.slice([0..batch_size, 1..2]).reshape([batch_size])
    }
}

#[cfg(all(test, feature = "ndarray"))]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_probabilities_in_unit_interval() {
        let device = Default::default();
        let disc = DiscriminatorConfig::new(6)
            .with_hidden(8)
            .init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 2>::random(
            [4, 6],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );

        let p = disc
            .prob_unlabeled(x)
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .unwrap();
        assert_eq!(p.len(), 4);
        assert!(p.iter().all(|v| (0.0..=1.0).contains(v)));
    }
}
