//! MobileNetV3 (Small and Large)
//!
//! Inverted-residual blocks with optional squeeze-and-excitation and
//! hard-swish activations, followed by a 1x1 conv, global pooling and a
//! two-layer classifier.

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d,
        Relu,
    },
    tensor::{backend::Backend, Tensor},
};
use serde::{Deserialize, Serialize};

use crate::utils::error::{self, Error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MobileNetVariant {
    Small,
    Large,
}

/// One inverted-residual row: kernel, expanded width, output width, SE, hard-swish, stride
struct BlockSpec(usize, usize, usize, bool, bool, usize);

const LARGE_BLOCKS: [BlockSpec; 15] = [
    BlockSpec(3, 16, 16, false, false, 1),
    BlockSpec(3, 64, 24, false, false, 2),
    BlockSpec(3, 72, 24, false, false, 1),
    BlockSpec(5, 72, 40, true, false, 2),
    BlockSpec(5, 120, 40, true, false, 1),
    BlockSpec(5, 120, 40, true, false, 1),
    BlockSpec(3, 240, 80, false, true, 2),
    BlockSpec(3, 200, 80, false, true, 1),
    BlockSpec(3, 184, 80, false, true, 1),
    BlockSpec(3, 184, 80, false, true, 1),
    BlockSpec(3, 480, 112, true, true, 1),
    BlockSpec(3, 672, 112, true, true, 1),
    BlockSpec(5, 672, 160, true, true, 2),
    BlockSpec(5, 960, 160, true, true, 1),
    BlockSpec(5, 960, 160, true, true, 1),
];

const SMALL_BLOCKS: [BlockSpec; 11] = [
    BlockSpec(3, 16, 16, true, false, 2),
    BlockSpec(3, 72, 24, false, false, 2),
    BlockSpec(3, 88, 24, false, false, 1),
    BlockSpec(5, 96, 40, true, true, 2),
    BlockSpec(5, 240, 40, true, true, 1),
    BlockSpec(5, 240, 40, true, true, 1),
    BlockSpec(5, 120, 48, true, true, 1),
    BlockSpec(5, 144, 48, true, true, 1),
    BlockSpec(5, 288, 96, true, true, 2),
    BlockSpec(5, 576, 96, true, true, 1),
    BlockSpec(5, 576, 96, true, true, 1),
];

const STEM_CHANNELS: usize = 16;

impl MobileNetVariant {
    fn blocks(&self) -> &'static [BlockSpec] {
        match self {
            MobileNetVariant::Small => &SMALL_BLOCKS,
            MobileNetVariant::Large => &LARGE_BLOCKS,
        }
    }

    /// Width of the 1x1 conv before pooling
    fn last_channels(&self) -> usize {
        match self {
            MobileNetVariant::Small => 576,
            MobileNetVariant::Large => 960,
        }
    }

    /// Width of the hidden classifier layer
    fn classifier_hidden(&self) -> usize {
        match self {
            MobileNetVariant::Small => 1024,
            MobileNetVariant::Large => 1280,
        }
    }
}

/// Configuration for MobileNetV3
#[derive(Config, Debug)]
pub struct MobileNetV3Config {
    pub num_classes: usize,

    #[config(default = "MobileNetVariant::Large")]
    pub variant: MobileNetVariant,

    /// Dropout before the final linear layer
    #[config(default = "0.2")]
    pub dropout: f64,

    #[config(default = "1e-3")]
    pub batch_norm_eps: f64,
}

impl MobileNetV3Config {
    pub fn validate(&self) -> error::Result<()> {
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::Config(format!("dropout must be in [0, 1), got {}", self.dropout)));
        }
        Ok(())
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> MobileNetV3<B> {
        let eps = self.batch_norm_eps;
        let stem = ConvBnAct::new([3, STEM_CHANNELS], 3, 2, 1, true, eps, device);

        let mut in_channels = STEM_CHANNELS;
        let blocks = self
            .variant
            .blocks()
            .iter()
            .map(|spec| {
                let block = InvertedResidual::new(in_channels, spec, eps, device);
                in_channels = spec.2;
                block
            })
            .collect();

        let last = self.variant.last_channels();
        let hidden = self.variant.classifier_hidden();

        MobileNetV3 {
            stem,
            blocks,
            last_conv: ConvBnAct::new([in_channels, last], 1, 1, 1, true, eps, device),
            fc: LinearConfig::new(last, hidden).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            head: LinearConfig::new(hidden, self.num_classes).init(device),
            hidden_size: hidden,
        }
    }
}

/// Round `value` to the nearest multiple of `divisor`, never dropping more than 10%
fn make_divisible(value: usize, divisor: usize) -> usize {
    let rounded = ((value + divisor / 2) / divisor * divisor).max(divisor);
    if (rounded as f64) < 0.9 * value as f64 {
        rounded + divisor
    } else {
        rounded
    }
}

fn hard_sigmoid<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    x.add_scalar(3.0).clamp(0.0, 6.0).div_scalar(6.0)
}

fn hard_swish<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    x.clone() * hard_sigmoid(x)
}

/// Bias-free convolution followed by batch norm
#[derive(Module, Debug)]
pub struct ConvBn<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B>,
}

impl<B: Backend> ConvBn<B> {
    fn new(
        channels: [usize; 2],
        kernel_size: usize,
        stride: usize,
        groups: usize,
        eps: f64,
        device: &B::Device,
    ) -> Self {
        let padding = (kernel_size - 1) / 2;
        Self {
            conv: Conv2dConfig::new(channels, [kernel_size, kernel_size])
                .with_stride([stride, stride])
                .with_padding(PaddingConfig2d::Explicit(padding, padding))
                .with_groups(groups)
                .with_bias(false)
                .init(device),
            bn: BatchNormConfig::new(channels[1]).with_epsilon(eps).init(device),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.bn.forward(self.conv.forward(x))
    }
}

/// [`ConvBn`] followed by ReLU or hard-swish
#[derive(Module, Debug)]
pub struct ConvBnAct<B: Backend> {
    inner: ConvBn<B>,
    hard_swish: bool,
}

impl<B: Backend> ConvBnAct<B> {
    fn new(
        channels: [usize; 2],
        kernel_size: usize,
        stride: usize,
        groups: usize,
        hard_swish: bool,
        eps: f64,
        device: &B::Device,
    ) -> Self {
        Self {
            inner: ConvBn::new(channels, kernel_size, stride, groups, eps, device),
            hard_swish,
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.inner.forward(x);
        if self.hard_swish {
            hard_swish(x)
        } else {
            Relu::new().forward(x)
        }
    }
}

#[derive(Module, Debug)]
pub struct SqueezeExcitation<B: Backend> {
    fc1: Conv2d<B>,
    fc2: Conv2d<B>,
}

impl<B: Backend> SqueezeExcitation<B> {
    fn new(channels: usize, device: &B::Device) -> Self {
        let squeeze = make_divisible(channels / 4, 8);
        Self {
            fc1: Conv2dConfig::new([channels, squeeze], [1, 1]).init(device),
            fc2: Conv2dConfig::new([squeeze, channels], [1, 1]).init(device),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let scale = x.clone().mean_dim(2).mean_dim(3);
        let scale = Relu::new().forward(self.fc1.forward(scale));
        let scale = hard_sigmoid(self.fc2.forward(scale));
        x * scale
    }
}

#[derive(Module, Debug)]
pub struct InvertedResidual<B: Backend> {
    expand: Option<ConvBnAct<B>>,
    depthwise: ConvBnAct<B>,
    se: Option<SqueezeExcitation<B>>,
    project: ConvBn<B>,
    use_residual: bool,
}

impl<B: Backend> InvertedResidual<B> {
    fn new(in_channels: usize, spec: &BlockSpec, eps: f64, device: &B::Device) -> Self {
        let &BlockSpec(kernel, expanded, out_channels, use_se, use_hs, stride) = spec;

        let expand = (expanded != in_channels)
            .then(|| ConvBnAct::new([in_channels, expanded], 1, 1, 1, use_hs, eps, device));

        Self {
            expand,
            depthwise: ConvBnAct::new(
                [expanded, expanded],
                kernel,
                stride,
                expanded,
                use_hs,
                eps,
                device,
            ),
            se: use_se.then(|| SqueezeExcitation::new(expanded, device)),
            project: ConvBn::new([expanded, out_channels], 1, 1, 1, eps, device),
            use_residual: stride == 1 && in_channels == out_channels,
        }
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = match &self.expand {
            Some(expand) => expand.forward(input.clone()),
            None => input.clone(),
        };
        x = self.depthwise.forward(x);
        if let Some(se) = &self.se {
            x = se.forward(x);
        }
        x = self.project.forward(x);

        if self.use_residual {
            x + input
        } else {
            x
        }
    }
}

#[derive(Module, Debug)]
pub struct MobileNetV3<B: Backend> {
    stem: ConvBnAct<B>,
    blocks: Vec<InvertedResidual<B>>,
    last_conv: ConvBnAct<B>,
    fc: Linear<B>,
    dropout: Dropout,
    head: Linear<B>,
    hidden_size: usize,
}

impl<B: Backend> MobileNetV3<B> {
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.features(images);
        let x = hard_swish(self.fc.forward(x));
        let x = self.dropout.forward(x);
        self.head.forward(x)
    }

    /// Globally pooled output of the last conv, `[batch, last_channels]`
    pub fn features(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = self.stem.forward(images);
        for block in &self.blocks {
            x = block.forward(x);
        }
        let x = self.last_conv.forward(x);

        let [batch_size, channels, _, _] = x.dims();
        x.mean_dim(2).mean_dim(3).reshape([batch_size, channels])
    }

    pub fn num_classes(&self) -> usize {
        self.head.weight.val().dims()[1]
    }

    pub fn with_new_head(mut self, num_classes: usize, device: &B::Device) -> Self {
        self.head = LinearConfig::new(self.hidden_size, num_classes).init(device);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::{Distribution, ElementConversion};
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_make_divisible() {
        assert_eq!(make_divisible(18, 8), 24);
        assert_eq!(make_divisible(4, 8), 8);
        assert_eq!(make_divisible(240, 8), 240);
        assert_eq!(make_divisible(30, 8), 32);
    }

    #[test]
    fn test_hard_activations() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 1>::from_floats([-4.0, 0.0, 3.0, 6.0], &device);

        let hs: Vec<f32> = hard_sigmoid(x.clone()).into_data().to_vec().unwrap();
        assert_eq!(hs, vec![0.0, 0.5, 1.0, 1.0]);

        let hw: Vec<f32> = hard_swish(x).into_data().to_vec().unwrap();
        assert_eq!(hw, vec![0.0, 0.0, 3.0, 6.0]);
    }

    #[test]
    fn test_small_forward_shape() {
        let device = Default::default();
        let model = MobileNetV3Config::new(4)
            .with_variant(MobileNetVariant::Small)
            .init::<TestBackend>(&device);

        let input =
            Tensor::<TestBackend, 4>::random([2, 3, 32, 32], Distribution::Default, &device);
        let output = model.forward(input);
        assert_eq!(output.dims(), [2, 4]);
        assert_eq!(model.num_classes(), 4);

        let nan_count = output.is_nan().int().sum().into_scalar().elem::<i64>();
        assert_eq!(nan_count, 0);
    }

    #[test]
    fn test_block_tables() {
        assert_eq!(MobileNetVariant::Large.blocks().len(), 15);
        assert_eq!(MobileNetVariant::Small.blocks().len(), 11);
        assert_eq!(MobileNetVariant::Large.blocks().last().map(|b| b.2), Some(160));
        assert_eq!(MobileNetVariant::Small.blocks().last().map(|b| b.2), Some(96));
    }

    #[test]
    fn test_new_head_and_validation() {
        let device = Default::default();
        let config = MobileNetV3Config::new(10).with_variant(MobileNetVariant::Small);
        assert!(config.validate().is_ok());
        assert!(config.clone().with_dropout(1.0).validate().is_err());

        let model = config.init::<TestBackend>(&device).with_new_head(3, &device);
        assert_eq!(model.num_classes(), 3);
    }
}
