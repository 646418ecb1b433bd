//! ConvNeXt V2
//!
//! Patchify stem, four stages of ConvNeXt V2 blocks separated by 2x2
//! downsampling, global average pooling, layer norm and a linear head.
//! Blocks use Global Response Normalization (GRN) in the inverted MLP.
//! Defaults match the Tiny variant.

use burn::{
    config::Config,
    module::{Module, Param},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        Gelu, LayerNorm, LayerNormConfig, Linear, LinearConfig, PaddingConfig2d,
    },
    tensor::{backend::Backend, Tensor},
};

use crate::utils::error::{self, Error};

/// Configuration for ConvNeXt V2
#[derive(Config, Debug)]
pub struct ConvNextV2Config {
    pub num_classes: usize,

    /// Number of blocks per stage
    #[config(default = "vec![3, 3, 9, 3]")]
    pub depths: Vec<usize>,

    /// Channel width per stage
    #[config(default = "vec![96, 192, 384, 768]")]
    pub hidden_sizes: Vec<usize>,

    #[config(default = "1e-6")]
    pub layer_norm_eps: f64,
}

impl ConvNextV2Config {
    pub fn validate(&self) -> error::Result<()> {
        if self.depths.is_empty() || self.depths.len() != self.hidden_sizes.len() {
            return Err(Error::Config(format!(
                "depths ({}) and hidden_sizes ({}) must be non-empty and equal length",
                self.depths.len(),
                self.hidden_sizes.len()
            )));
        }
        if self.hidden_sizes.iter().any(|&d| d == 0) {
            return Err(Error::Config("hidden_sizes must be positive".into()));
        }
        Ok(())
    }

    /// Smallest input side that survives the stem and every downsampling layer
    pub fn min_input_size(&self) -> usize {
        4 << self.depths.len().saturating_sub(1)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvNextV2<B> {
        let eps = self.layer_norm_eps;
        let first = self.hidden_sizes[0];
        let last = *self.hidden_sizes.last().unwrap_or(&first);

        let stem = Conv2dConfig::new([3, first], [4, 4])
            .with_stride([4, 4])
            .init(device);
        let stem_norm = LayerNormConfig::new(first).with_epsilon(eps).init(device);

        let stages = self
            .hidden_sizes
            .iter()
            .zip(self.depths.iter())
            .enumerate()
            .map(|(i, (&dim, &depth))| {
                let downsample =
                    (i > 0).then(|| Downsample::new(self.hidden_sizes[i - 1], dim, eps, device));
                let blocks = (0..depth).map(|_| ConvNextV2Block::new(dim, eps, device)).collect();
                Stage { downsample, blocks }
            })
            .collect();

        ConvNextV2 {
            stem,
            stem_norm,
            stages,
            norm: LayerNormConfig::new(last).with_epsilon(eps).init(device),
            head: LinearConfig::new(last, self.num_classes).init(device),
            hidden_size: last,
        }
    }
}

/// Layer norm over the channel axis of an NCHW tensor
fn channel_norm<B: Backend>(norm: &LayerNorm<B>, x: Tensor<B, 4>) -> Tensor<B, 4> {
    norm.forward(x.permute([0, 2, 3, 1])).permute([0, 3, 1, 2])
}

/// Global Response Normalization over NHWC input
#[derive(Module, Debug)]
pub struct Grn<B: Backend> {
    gamma: Param<Tensor<B, 1>>,
    beta: Param<Tensor<B, 1>>,
}

impl<B: Backend> Grn<B> {
    fn new(dim: usize, device: &B::Device) -> Self {
        Self {
            gamma: Param::from_tensor(Tensor::zeros([dim], device)),
            beta: Param::from_tensor(Tensor::zeros([dim], device)),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, _, _, channels] = x.dims();
        // L2 norm over the spatial axes, [N, 1, 1, C]
        let gx = x.clone().powf_scalar(2.0).sum_dim(1).sum_dim(2).sqrt();
        let nx = gx.clone() / (gx.mean_dim(3) + 1e-6);

        let gamma = self.gamma.val().reshape([1, 1, 1, channels]);
        let beta = self.beta.val().reshape([1, 1, 1, channels]);
        gamma * (x.clone() * nx) + beta + x
    }
}

#[derive(Module, Debug)]
pub struct ConvNextV2Block<B: Backend> {
    dwconv: Conv2d<B>,
    norm: LayerNorm<B>,
    pwconv1: Linear<B>,
    act: Gelu,
    grn: Grn<B>,
    pwconv2: Linear<B>,
}

impl<B: Backend> ConvNextV2Block<B> {
    fn new(dim: usize, eps: f64, device: &B::Device) -> Self {
        Self {
            dwconv: Conv2dConfig::new([dim, dim], [7, 7])
                .with_groups(dim)
                .with_padding(PaddingConfig2d::Explicit(3, 3))
                .init(device),
            norm: LayerNormConfig::new(dim).with_epsilon(eps).init(device),
            pwconv1: LinearConfig::new(dim, 4 * dim).init(device),
            act: Gelu::new(),
            grn: Grn::new(4 * dim, device),
            pwconv2: LinearConfig::new(4 * dim, dim).init(device),
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.dwconv.forward(input.clone());
        let x = x.permute([0, 2, 3, 1]);
        let x = self.norm.forward(x);
        let x = self.pwconv1.forward(x);
        let x = self.act.forward(x);
        let x = self.grn.forward(x);
        let x = self.pwconv2.forward(x);
        input + x.permute([0, 3, 1, 2])
    }
}

#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    norm: LayerNorm<B>,
    conv: Conv2d<B>,
}

impl<B: Backend> Downsample<B> {
    fn new(in_dim: usize, out_dim: usize, eps: f64, device: &B::Device) -> Self {
        Self {
            norm: LayerNormConfig::new(in_dim).with_epsilon(eps).init(device),
            conv: Conv2dConfig::new([in_dim, out_dim], [2, 2])
                .with_stride([2, 2])
                .init(device),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.conv.forward(channel_norm(&self.norm, x))
    }
}

#[derive(Module, Debug)]
pub struct Stage<B: Backend> {
    downsample: Option<Downsample<B>>,
    blocks: Vec<ConvNextV2Block<B>>,
}

#[derive(Module, Debug)]
pub struct ConvNextV2<B: Backend> {
    stem: Conv2d<B>,
    stem_norm: LayerNorm<B>,
    stages: Vec<Stage<B>>,
    norm: LayerNorm<B>,
    head: Linear<B>,
    hidden_size: usize,
}

impl<B: Backend> ConvNextV2<B> {
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let features = self.features(images);
        self.head.forward(features)
    }

    /// Pooled, normalized features `[batch, last_hidden]`
    pub fn features(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = channel_norm(&self.stem_norm, self.stem.forward(images));

        for stage in &self.stages {
            if let Some(downsample) = &stage.downsample {
                x = downsample.forward(x);
            }
            for block in &stage.blocks {
                x = block.forward(x);
            }
        }

        let [batch_size, channels, _, _] = x.dims();
        let pooled = x.mean_dim(2).mean_dim(3).reshape([batch_size, channels]);
        self.norm.forward(pooled)
    }

    pub fn num_classes(&self) -> usize {
        self.head.weight.val().dims()[1]
    }

    pub fn with_new_head(mut self, num_classes: usize, device: &B::Device) -> Self {
        self.head = LinearConfig::new(self.hidden_size, num_classes).init(device);
        self
    }
}
