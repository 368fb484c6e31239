use super::*;

/// Attention pooling over a feature map, queried by the spatial mean.
pub struct AttentionPool2d {
    pub positional_embedding: Tensor,
    pub attn: MultiHeadAttention,
    spacial_dim: usize,
    name: String,
}

impl AttentionPool2d {
    pub fn new(
        vb: &VarBuilder,
        spacial_dim: usize,
        embed_dim: usize,
        num_heads: usize,
        output_dim: usize,
    ) -> Result<Self> {
        let attn = MultiHeadAttention::new(
            vb,
            embed_dim,
            num_heads,
            ProjectionLayout::Split,
            output_dim,
        )?;
        let positional_embedding = vb.get_with_hints(
            (spacial_dim * spacial_dim + 1, embed_dim),
            "positional_embedding",
            Init::Randn {
                mean: 0.,
                stdev: (embed_dim as f64).powf(-0.5),
            },
        )?;
        Ok(Self {
            positional_embedding,
            attn,
            spacial_dim,
            name: vb.prefix(),
        })
    }

    pub fn output_dim(&self) -> usize {
        self.attn.out_dim()
    }

    /// (B, C, H, W) -> (B, output_dim)
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, c, h, w) = xs.dims4()?;
        if h != self.spacial_dim || w != self.spacial_dim || c != self.attn.d_model {
            return Err(ClipError::shape(
                self.name.clone(),
                &[b, self.attn.d_model, self.spacial_dim, self.spacial_dim],
                xs.dims(),
            ));
        }

        // spatial positions become tokens: (B, H*W, C)
        let tokens = xs.flatten_from(2)?.transpose(1, 2)?.contiguous()?;
        let mean = tokens.mean_keepdim(1)?;
        let x = Tensor::cat(&[&mean, &tokens], 1)?;
        let x = x.broadcast_add(&self.positional_embedding)?;

        // only the mean token queries the full sequence
        let query = x.narrow(1, 0, 1)?;
        let pooled = self.attn.forward(&query, &x, &x, None)?;
        Ok(pooled.squeeze(1)?)
    }
}
