//! Segmentation model and active-learning heads
//!
//! - `drn`: dilated residual segmentation network
//! - `loss_head`: auxiliary per-image loss predictor
//! - `discriminator`: labeled-vs-unlabeled classifier
//! - `config`: named architectures and network hyper-parameters

pub mod config;
pub mod discriminator;
pub mod drn;
pub mod loss_head;

use burn::{
    module::Module,
    tensor::{backend::Backend, Tensor},
};

pub use config::{Architecture, SegNetConfig};
pub use discriminator::{Discriminator, DiscriminatorConfig};
pub use drn::{check_input_size, SegNet, SegOutput, MIN_INPUT_SIZE};
pub use loss_head::{LossHeadConfig, LossPredictionHead};

/// Segmentation network with an optional loss-prediction head
#[derive(Module, Debug)]
pub struct ActiveSegModel<B: Backend> {
    pub net: SegNet<B>,
    pub loss_head: Option<LossPredictionHead<B>>,
}

impl<B: Backend> ActiveSegModel<B> {
    pub fn new(config: &SegNetConfig, device: &B::Device) -> Self {
        let loss_head = if config.loss_head {
            Some(
                LossHeadConfig::new(config.feature_channels())
                    .with_hidden(config.loss_head_width)
                    .init(device),
            )
        } else {
            None
        };

        Self {
            net: SegNet::new(config, device),
            loss_head,
        }
    }

    pub fn forward(&self, images: Tensor<B, 4>) -> SegOutput<B> {
        self.net.forward(images)
    }

    /// Predicted per-image loss, `None` without a loss head
    ///
    /// With `detach` the head still trains but sends no gradient into the backbone.
    pub fn predict_loss(&self, output: &SegOutput<B>, detach: bool) -> Option<Tensor<B, 1>> {
        self.loss_head.as_ref().map(|head| {
            if detach {
                let detached: Vec<Tensor<B, 4>> =
                    output.features.iter().map(|f| f.clone().detach()).collect();
                head.forward(&detached)
            } else {
                head.forward(&output.features)
            }
        })
    }

    pub fn num_classes(&self) -> usize {
        self.net.num_classes()
    }
}
