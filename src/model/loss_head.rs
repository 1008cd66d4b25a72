//! Loss-prediction head
//!
//! Each intermediate feature map is globally pooled and projected to a small
//! hidden vector; the concatenation is mapped to one scalar per image, the
//! predicted segmentation loss.

use burn::{
    config::Config,
    module::Module,
    nn::{
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        Linear, LinearConfig, Relu,
    },
    tensor::{backend::Backend, Tensor},
};

#[derive(Config, Debug)]
pub struct LossHeadConfig {
    /// Channel count of every feature map, in forward order
    pub feature_channels: Vec<usize>,

    #[config(default = "128")]
    pub hidden: usize,
}

impl LossHeadConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> LossPredictionHead<B> {
        let branches = self
            .feature_channels
            .iter()
            .map(|&c| LinearConfig::new(c, self.hidden).init(device))
            .collect();

        LossPredictionHead {
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            branches,
            out: LinearConfig::new(self.hidden * self.feature_channels.len(), 1).init(device),
            relu: Relu::new(),
        }
    }
}

#[derive(Module, Debug)]
pub struct LossPredictionHead<B: Backend> {
    pool: AdaptiveAvgPool2d,
    branches: Vec<Linear<B>>,
    out: Linear<B>,
    relu: Relu,
}

impl<B: Backend> LossPredictionHead<B> {
    /// Predicted loss per image, shape `[batch]`
    pub fn forward(&self, features: &[Tensor<B, 4>]) -> Tensor<B, 1> {
        let hidden: Vec<Tensor<B, 2>> = features
            .iter()
            .zip(self.branches.iter())
            .map(|(feature, linear)| {
                let [batch_size, channels, _, _] = feature.dims();
                let pooled = self
                    .pool
                    .forward(feature.clone())
                    .reshape([batch_size, channels]);
                self.relu.forward(linear.forward(pooled))
            })
            .collect();

        let joined = Tensor::cat(hidden, 1);
        let [batch_size, _] = joined.dims();
        self.out.forward(joined).reshape([batch_size])
    }
}
