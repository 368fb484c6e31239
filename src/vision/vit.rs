use super::*;

/// Patch-convolution vision transformer with a learned class token.
pub struct VisionTransformer {
    pub conv1: Conv2d,
    pub class_embedding: Tensor,
    pub positional_embedding: Tensor,
    pub ln_pre: LayerNorm,
    pub transformer: TransformerStack,
    pub ln_post: LayerNorm,
    pub proj: Option<Tensor>,
    image_size: usize,
    name: String,
}

impl VisionTransformer {
    pub fn new(
        vb: &VarBuilder,
        c: &ClipVisionConfig,
        layers: usize,
        output_dim: usize,
    ) -> Result<Self> {
        let width = c.hidden_size;
        let scale = (width as f64).powf(-0.5);
        let grid = c.image_size / c.patch_size;

        let conv_cfg = Conv2dConfig {
            stride: c.patch_size,
            ..Default::default()
        };
        let conv1 = conv2d_no_bias(c.num_channels, width, c.patch_size, conv_cfg, vb.pp("conv1"))?;

        let class_embedding =
            vb.get_with_hints(width, "class_embedding", Init::Randn { mean: 0., stdev: scale })?;
        let positional_embedding = vb.get_with_hints(
            (grid * grid + 1, width),
            "positional_embedding",
            Init::Randn {
                mean: 0.,
                stdev: scale,
            },
        )?;

        let ln_pre = layer_norm(width, c.layer_norm_eps, vb.pp("ln_pre"))?;
        let transformer = TransformerStack::new(&vb.pp("transformer"), &c.stack(layers))?;
        let ln_post = layer_norm(width, c.layer_norm_eps, vb.pp("ln_post"))?;

        let proj = if c.use_proj {
            let p = vb.get_with_hints(
                (width, output_dim),
                "proj",
                Init::Randn {
                    mean: 0.,
                    stdev: scale,
                },
            )?;
            Some(p)
        } else {
            None
        };

        tracing::debug!(
            prefix = %vb.prefix(),
            width,
            grid,
            patch_size = c.patch_size,
            projected = proj.is_some(),
            "vision transformer assembled"
        );

        Ok(Self {
            conv1,
            class_embedding,
            positional_embedding,
            ln_pre,
            transformer,
            ln_post,
            proj,
            image_size: c.image_size,
            name: vb.prefix(),
        })
    }

    pub fn width(&self) -> usize {
        self.class_embedding.dims()[0]
    }

    pub fn output_dim(&self) -> usize {
        match &self.proj {
            Some(p) => p.dims()[1],
            None => self.width(),
        }
    }

    /// (B, C, H, W) pixels to token embeddings (B, grid*grid + 1, width), class token first.
    pub fn embed(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let (b, c, h, w) = pixel_values.dims4()?;
        if h != self.image_size || w != self.image_size {
            return Err(ClipError::shape(
                format!("{}.conv1", self.name),
                &[b, c, self.image_size, self.image_size],
                pixel_values.dims(),
            ));
        }
        let width = self.width();

        // (B, width, grid, grid) -> (B, grid*grid, width)
        let patches = self.conv1.forward(pixel_values)?.flatten_from(2)?.transpose(1, 2)?;

        let class_embeds = self.class_embedding.reshape((1, 1, width))?.expand((b, 1, width))?;
        let x = Tensor::cat(&[&class_embeds, &patches.contiguous()?], 1)?;

        Ok(x.broadcast_add(&self.positional_embedding)?)
    }

    /// Returns the pooled class token, projected when the tower owns a projection.
    pub fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let x = self.embed(pixel_values)?;
        let x = self.ln_pre.forward_t(&x, false)?;

        // batch-first all the way through; every block attends within one image
        let x = self.transformer.forward(&x, None)?;
        let x = self.ln_post.forward_t(&x, false)?;

        let pooled = x.i((.., 0, ..))?.contiguous()?;
        tracing::trace!(shape = ?pooled.dims(), "vision transformer pooled");
        match &self.proj {
            Some(proj) => Ok(pooled.matmul(proj)?),
            None => Ok(pooled),
        }
    }
}
