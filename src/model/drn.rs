//! Dilated residual segmentation network
//!
//! Three strided stages bring the input to output stride 8; two dilated stages then
//! grow the receptive field without further downsampling, followed by a
//! degridding pair of plain dilated convolutions. A 1x1 classifier and a fixed
//! bilinear transposed convolution return per-pixel log-probabilities at input
//! resolution.

use burn::{
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d, Relu,
    },
    tensor::{
        activation::log_softmax, backend::Backend, module::conv_transpose2d,
        ops::ConvTransposeOptions, Tensor, TensorData,
    },
};

use crate::model::config::SegNetConfig;
use crate::utils::error::{Result, SegmentationError};

/// Downsampling factor between the input and the classifier map
pub const OUTPUT_STRIDE: usize = 8;

/// Smallest input side the network accepts
pub const MIN_INPUT_SIZE: usize = 32;

const UPSAMPLE_KERNEL: usize = 2 * OUTPUT_STRIDE;

/// Reject inputs too small for the dilated stages
pub fn check_input_size(height: usize, width: usize) -> Result<()> {
    if height < MIN_INPUT_SIZE || width < MIN_INPUT_SIZE {
        return Err(SegmentationError::InvalidInput(format!(
            "input {}x{} is below the {} px minimum",
            width, height, MIN_INPUT_SIZE
        )));
    }
    Ok(())
}

/// Bilinear interpolation kernel of the x8 upsampling, one plane
pub fn bilinear_kernel() -> Vec<f32> {
    let factor = UPSAMPLE_KERNEL.div_ceil(2) as f32;
    let center = (2.0 * factor - 1.0 - (factor % 2.0)) / (2.0 * factor);
    let mut kernel = Vec::with_capacity(UPSAMPLE_KERNEL * UPSAMPLE_KERNEL);
    for i in 0..UPSAMPLE_KERNEL {
        for j in 0..UPSAMPLE_KERNEL {
            let wi = 1.0 - (i as f32 / factor - center).abs();
            let wj = 1.0 - (j as f32 / factor - center).abs();
            kernel.push(wi * wj);
        }
    }
    kernel
}

/// Per-channel x8 upsampling with fixed bilinear weights, cropped to `[height, width]`
///
/// The kernel is rebuilt as a constant on every call, so it never shows up in the
/// module record or the optimizer.
fn upsample<B: Backend>(logits: Tensor<B, 4>, height: usize, width: usize) -> Tensor<B, 4> {
    let [batch_size, channels, _, _] = logits.dims();
    let plane = bilinear_kernel();
    let weights: Vec<f32> = (0..channels).flat_map(|_| plane.iter().copied()).collect();
    let weight = Tensor::<B, 4>::from_data(
        TensorData::new(weights, [channels, 1, UPSAMPLE_KERNEL, UPSAMPLE_KERNEL]),
        &logits.device(),
    );

    let options = ConvTransposeOptions::new(
        [OUTPUT_STRIDE, OUTPUT_STRIDE],
        [OUTPUT_STRIDE / 2, OUTPUT_STRIDE / 2],
        [0, 0],
        [1, 1],
        channels,
    );
    conv_transpose2d(logits, weight, None, options).slice([
        0..batch_size,
        0..channels,
        0..height,
        0..width,
    ])
}

fn conv3x3<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    stride: usize,
    dilation: usize,
    device: &B::Device,
) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [3, 3])
        .with_stride([stride, stride])
        .with_dilation([dilation, dilation])
        .with_padding(PaddingConfig2d::Explicit(dilation, dilation))
        .with_bias(false)
        .init(device)
}

/// Basic residual block with optional projection shortcut
#[derive(Module, Debug)]
pub struct ResidualBlock<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B>,
    conv2: Conv2d<B>,
    bn2: BatchNorm<B>,
    shortcut: Option<Conv2d<B>>,
    shortcut_bn: Option<BatchNorm<B>>,
    relu: Relu,
}

impl<B: Backend> ResidualBlock<B> {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        dilation: usize,
        device: &B::Device,
    ) -> Self {
        let needs_projection = stride != 1 || in_channels != out_channels;
        let (shortcut, shortcut_bn) = if needs_projection {
            (
                Some(
                    Conv2dConfig::new([in_channels, out_channels], [1, 1])
                        .with_stride([stride, stride])
                        .with_bias(false)
                        .init(device),
                ),
                Some(BatchNormConfig::new(out_channels).init(device)),
            )
        } else {
            (None, None)
        };

        Self {
            conv1: conv3x3(in_channels, out_channels, stride, dilation, device),
            bn1: BatchNormConfig::new(out_channels).init(device),
            conv2: conv3x3(out_channels, out_channels, 1, dilation, device),
            bn2: BatchNormConfig::new(out_channels).init(device),
            shortcut,
            shortcut_bn,
            relu: Relu::new(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let residual = match (&self.shortcut, &self.shortcut_bn) {
            (Some(conv), Some(bn)) => bn.forward(conv.forward(x.clone())),
            _ => x.clone(),
        };

        let out = self.relu.forward(self.bn1.forward(self.conv1.forward(x)));
        let out = self.bn2.forward(self.conv2.forward(out));
        self.relu.forward(out + residual)
    }
}

/// Conv-BN-ReLU without a shortcut
#[derive(Module, Debug)]
pub struct ConvBnRelu<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B>,
    relu: Relu,
}

impl<B: Backend> ConvBnRelu<B> {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        dilation: usize,
        device: &B::Device,
    ) -> Self {
        Self {
            conv: conv3x3(in_channels, out_channels, stride, dilation, device),
            bn: BatchNormConfig::new(out_channels).init(device),
            relu: Relu::new(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.relu.forward(self.bn.forward(self.conv.forward(x)))
    }
}

/// Everything one forward pass produces
#[derive(Debug, Clone)]
pub struct SegOutput<B: Backend> {
    /// `[batch, classes, height, width]` at input resolution
    pub log_probs: Tensor<B, 4>,
    /// Intermediate maps consumed by the loss-prediction head
    pub features: Vec<Tensor<B, 4>>,
    /// `[batch, embedding_dim]` globally pooled backbone output
    pub embedding: Tensor<B, 2>,
}

#[derive(Module, Debug)]
pub struct SegNet<B: Backend> {
    stem: ConvBnRelu<B>,
    stage1: ResidualBlock<B>,
    stage2: ResidualBlock<B>,
    stage3: ResidualBlock<B>,
    stage4: Vec<ResidualBlock<B>>,
    stage5: Vec<ResidualBlock<B>>,
    degrid1: ConvBnRelu<B>,
    degrid2: ConvBnRelu<B>,
    classifier: Conv2d<B>,
    pool: AdaptiveAvgPool2d,
    num_classes: usize,
}

impl<B: Backend> SegNet<B> {
    pub fn new(config: &SegNetConfig, device: &B::Device) -> Self {
        let c = &config.channels;
        let dilated = |in_ch: usize, out_ch: usize, dilation: usize| -> Vec<ResidualBlock<B>> {
            (0..config.dilated_blocks)
                .map(|i| {
                    let from = if i == 0 { in_ch } else { out_ch };
                    ResidualBlock::new(from, out_ch, 1, dilation, device)
                })
                .collect()
        };

        Self {
            stem: ConvBnRelu::new(3, c[0], 1, 1, device),
            stage1: ResidualBlock::new(c[0], c[1], 2, 1, device),
            stage2: ResidualBlock::new(c[1], c[2], 2, 1, device),
            stage3: ResidualBlock::new(c[2], c[3], 2, 1, device),
            stage4: dilated(c[3], c[4], 2),
            stage5: dilated(c[4], c[5], 4),
            degrid1: ConvBnRelu::new(c[5], c[5], 1, 2, device),
            degrid2: ConvBnRelu::new(c[5], c[5], 1, 1, device),
            classifier: Conv2dConfig::new([c[5], config.num_classes], [1, 1]).init(device),
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            num_classes: config.num_classes,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> SegOutput<B> {
        let [batch_size, _, height, width] = x.dims();

        let x = self.stem.forward(x);
        let x = self.stage1.forward(x);
        let f2 = self.stage2.forward(x);
        let f3 = self.stage3.forward(f2.clone());
        let f4 = self
            .stage4
            .iter()
            .fold(f3.clone(), |acc, block| block.forward(acc));
        let f5 = self
            .stage5
            .iter()
            .fold(f4.clone(), |acc, block| block.forward(acc));
        let f6 = self.degrid2.forward(self.degrid1.forward(f5.clone()));

        let logits = upsample(self.classifier.forward(f6.clone()), height, width);

        let [_, channels, _, _] = f6.dims();
        let embedding = self.pool.forward(f6.clone()).reshape([batch_size, channels]);

        SegOutput {
            log_probs: log_softmax(logits, 1),
            features: vec![f2, f3, f4, f5, f6],
            embedding,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }
}

#[cfg(all(test, feature = "ndarray"))]
mod tests {
    use super::*;
    use crate::model::config::Architecture;
    use burn::backend::Autodiff;
    use burn::tensor::ElementConversion;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_output_matches_input_resolution() {
        let device = Default::default();
        let config = Architecture::DrnDTiny.config(3);
        let net = SegNet::<TestBackend>::new(&config, &device);

        let x = Tensor::<TestBackend, 4>::zeros([2, 3, 64, 48], &device);
        let out = net.forward(x);

        assert_eq!(out.log_probs.dims(), [2, 3, 64, 48]);
        assert_eq!(out.embedding.dims(), [2, 64]);
        assert_eq!(out.features.len(), 5);
        assert_eq!(out.features[0].dims(), [2, 32, 16, 12]);
        assert_eq!(out.features[1].dims(), [2, 64, 8, 6]);
    }

    #[test]
    fn test_odd_sizes_are_cropped_back() {
        let device = Default::default();
        let net = SegNet::<TestBackend>::new(&Architecture::DrnDTiny.config(2), &device);
        let x = Tensor::<TestBackend, 4>::zeros([1, 3, 37, 41], &device);

        assert_eq!(net.forward(x).log_probs.dims(), [1, 2, 37, 41]);
    }

    #[test]
    fn test_log_probs_normalize() {
        let device = Default::default();
        let net = SegNet::<TestBackend>::new(&Architecture::DrnDTiny.config(4), &device);
        let x = Tensor::<TestBackend, 4>::ones([1, 3, 32, 32], &device);

        let probs = net.forward(x).log_probs.exp().sum_dim(1);
        let values = probs.into_data().convert::<f32>().to_vec::<f32>().unwrap();
        assert!(values.iter().all(|v| (v - 1.0).abs() < 1e-4));
    }

    #[test]
    fn test_upsample_preserves_constant_interior() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 4>::ones([1, 2, 8, 8], &device);

        let up = upsample(logits, 64, 64);
        assert_eq!(up.dims(), [1, 2, 64, 64]);

        let center: f32 = up
            .slice([0..1, 1..2, 32..33, 32..33])
            .into_scalar()
            .elem();
        assert!((center - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_bilinear_kernel_is_symmetric() {
        let kernel = bilinear_kernel();
        assert_eq!(kernel.len(), 256);
        assert!((kernel[0] - kernel[255]).abs() < 1e-6);
        assert!((kernel[7 * 16 + 8] - kernel[8 * 16 + 7]).abs() < 1e-6);
    }

    #[test]
    fn test_backward_reaches_first_layer() {
        type Train = Autodiff<NdArray>;
        let device = Default::default();
        let net = SegNet::<Train>::new(&Architecture::DrnDTiny.config(3), &device);
        let x = Tensor::<Train, 4>::ones([2, 3, 32, 32], &device);

        let grads = net.forward(x).log_probs.mean().backward();
        assert!(net.classifier.weight.val().grad(&grads).is_some());
        assert!(net.stem.conv.weight.val().grad(&grads).is_some());
    }

    #[test]
    fn test_small_inputs_rejected() {
        assert!(check_input_size(32, 64).is_ok());
        assert!(matches!(
            check_input_size(24, 64),
            Err(SegmentationError::InvalidInput(_))
        ));
    }
}
