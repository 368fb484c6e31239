use super::*;

mod attention_pool;
pub use attention_pool::*;

mod resnet;
pub use resnet::*;

mod vit;
pub use vit::*;

/// The image encoder, picked once from the vision config.
///
/// Both variants map (B, C, H, W) pixels to one pooled vector per image.
pub enum VisionTower {
    ResNet(ModifiedResNet),
    Transformer(VisionTransformer),
}

impl VisionTower {
    /// `output_dim` is the width the ResNet attention pool (or the ViT `proj`) maps into.
    pub fn new(vb: &VarBuilder, c: &ClipVisionConfig, output_dim: usize) -> Result<Self> {
        let out = match c.layers {
            VisionLayers::ResNet(layers) => {
                Self::ResNet(ModifiedResNet::new(vb, c, layers, output_dim)?)
            }
            VisionLayers::Transformer(layers) => {
                Self::Transformer(VisionTransformer::new(vb, c, layers, output_dim)?)
            }
        };
        Ok(out)
    }

    pub fn output_dim(&self) -> usize {
        match self {
            Self::ResNet(m) => m.output_dim(),
            Self::Transformer(m) => m.output_dim(),
        }
    }

    pub fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        match self {
            Self::ResNet(m) => m.forward(pixel_values),
            Self::Transformer(m) => m.forward(pixel_values),
        }
    }
}

impl ModuleT for VisionTower {
    fn forward_t(&self, xs: &Tensor, _: bool) -> candle_core::Result<Tensor> {
        self.forward(xs).map_err(candle_core::Error::wrap)
    }
}
