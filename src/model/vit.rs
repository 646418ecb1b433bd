//! Vision Transformer (ViT)
//!
//! Conv patch embedding, learned class token and position embeddings, a
//! pre-norm transformer encoder, a final layer norm and a linear classifier
//! on the class token. Defaults match ViT-Base/16 at 224x224.

use burn::{
    config::Config,
    module::{Module, Param},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        transformer::{TransformerEncoder, TransformerEncoderConfig, TransformerEncoderInput},
        Dropout, DropoutConfig, LayerNorm, LayerNormConfig, Linear, LinearConfig,
    },
    tensor::{backend::Backend, Distribution, Tensor},
};

use crate::utils::error::{self, Error};

/// Configuration for the Vision Transformer
#[derive(Config, Debug)]
pub struct VitConfig {
    pub num_classes: usize,

    #[config(default = "224")]
    pub image_size: usize,

    #[config(default = "16")]
    pub patch_size: usize,

    #[config(default = "768")]
    pub hidden_size: usize,

    #[config(default = "12")]
    pub num_hidden_layers: usize,

    #[config(default = "12")]
    pub num_attention_heads: usize,

    #[config(default = "3072")]
    pub intermediate_size: usize,

    #[config(default = "0.0")]
    pub dropout: f64,

    #[config(default = "1e-12")]
    pub layer_norm_eps: f64,
}

impl VitConfig {
    pub fn validate(&self) -> error::Result<()> {
        if self.patch_size == 0 || self.image_size % self.patch_size != 0 {
            return Err(Error::Config(format!(
                "image_size {} must be a positive multiple of patch_size {}",
                self.image_size, self.patch_size
            )));
        }
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            return Err(Error::Config(format!(
                "hidden_size {} must be divisible by num_attention_heads {}",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if self.num_hidden_layers == 0 || self.intermediate_size == 0 {
            return Err(Error::Config("ViT needs at least one layer and a non-empty MLP".into()));
        }
        Ok(())
    }

    pub fn num_patches(&self) -> usize {
        let per_side = self.image_size / self.patch_size;
        per_side * per_side
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> VisionTransformer<B> {
        let patch = [self.patch_size, self.patch_size];
        let patch_embed = Conv2dConfig::new([3, self.hidden_size], patch)
            .with_stride(patch)
            .init(device);

        let cls_token = Param::from_tensor(Tensor::random(
            [1, 1, self.hidden_size],
            Distribution::Normal(0.0, 0.02),
            device,
        ));
        let position_embeddings = Param::from_tensor(Tensor::random(
            [1, self.num_patches() + 1, self.hidden_size],
            Distribution::Normal(0.0, 0.02),
            device,
        ));

        let encoder = TransformerEncoderConfig::new(
            self.hidden_size,
            self.intermediate_size,
            self.num_attention_heads,
            self.num_hidden_layers,
        )
        .with_dropout(self.dropout)
        .with_norm_first(true)
        .init(device);

        VisionTransformer {
            patch_embed,
            cls_token,
            position_embeddings,
            dropout: DropoutConfig::new(self.dropout).init(),
            encoder,
            norm: LayerNormConfig::new(self.hidden_size)
                .with_epsilon(self.layer_norm_eps)
                .init(device),
            head: LinearConfig::new(self.hidden_size, self.num_classes).init(device),
            hidden_size: self.hidden_size,
        }
    }
}

#[derive(Module, Debug)]
pub struct VisionTransformer<B: Backend> {
    patch_embed: Conv2d<B>,
    cls_token: Param<Tensor<B, 3>>,
    position_embeddings: Param<Tensor<B, 3>>,
    dropout: Dropout,
    encoder: TransformerEncoder<B>,
    norm: LayerNorm<B>,
    head: Linear<B>,
    hidden_size: usize,
}

impl<B: Backend> VisionTransformer<B> {
    /// Images `[batch, 3, H, W]` to logits `[batch, num_classes]`
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let features = self.features(images);
        self.head.forward(features)
    }

    /// Class-token embedding after the final norm, `[batch, hidden]`
    pub fn features(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();

        let patches = self.patch_embed.forward(images);
        let [_, hidden, grid_h, grid_w] = patches.dims();
        let tokens = patches
            .reshape([batch_size, hidden, grid_h * grid_w])
            .swap_dims(1, 2);

        let cls = self.cls_token.val().repeat_dim(0, batch_size);
        let x = Tensor::cat(vec![cls, tokens], 1) + self.position_embeddings.val();
        let x = self.dropout.forward(x);

        let x = self.encoder.forward(TransformerEncoderInput::new(x));
        let x = self.norm.forward(x);

        x.slice([0..batch_size, 0..1, 0..hidden])
            .reshape([batch_size, hidden])
    }

    pub fn num_classes(&self) -> usize {
        self.head.weight.val().dims()[1]
    }

    /// Replace the classifier with a freshly initialized one
    pub fn with_new_head(mut self, num_classes: usize, device: &B::Device) -> Self {
        self.head = LinearConfig::new(self.hidden_size, num_classes).init(device);
        self
    }
}
