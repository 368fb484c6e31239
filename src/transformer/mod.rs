pub use super::*;
mod attention;
pub use attention::*;

mod feed_forward;
pub use feed_forward::*;

/// Shape of one encoder stack, shared by the text tower and the vision transformer.
#[derive(Clone, Copy, Debug)]
pub struct StackConfig {
    pub width: usize,
    pub layers: usize,
    pub heads: usize,
    pub intermediate_size: usize,
    pub layer_norm_eps: f64,
}

/// Pre-norm transformer encoder layer.
pub struct ResidualAttentionBlock {
    pub ln_1: LayerNorm,
    pub attn: MultiHeadAttention,
    pub ln_2: LayerNorm,
    pub mlp: Mlp,
    name: String,
}

impl ResidualAttentionBlock {
    pub fn new(vb: &VarBuilder, c: &StackConfig) -> Result<Self> {
        let attn = MultiHeadAttention::new(
            &vb.pp("attn"),
            c.width,
            c.heads,
            ProjectionLayout::Packed,
            c.width,
        )?;
        let ln_1 = layer_norm(c.width, c.layer_norm_eps, vb.pp("ln_1"))?;
        let mlp = Mlp::new(&vb.pp("mlp"), c.width, c.intermediate_size)?;
        let ln_2 = layer_norm(c.width, c.layer_norm_eps, vb.pp("ln_2"))?;
        Ok(Self {
            ln_1,
            attn,
            ln_2,
            mlp,
            name: vb.prefix(),
        })
    }

    pub fn forward(&self, xs: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let x = self.ln_1.forward_t(xs, false)?;
        let x = self.attn.self_attention(&x, mask)?;
        let xs = residual_add(&format!("{}.attn", self.name), xs, &x)?;

        let x = self.ln_2.forward_t(&xs, false)?;
        let x = self.mlp.forward_t(&x, false)?;
        residual_add(&format!("{}.mlp", self.name), &xs, &x)
    }
}

pub struct TransformerStack {
    pub resblocks: Vec<ResidualAttentionBlock>,
}

impl TransformerStack {
    pub fn new(vb: &VarBuilder, c: &StackConfig) -> Result<Self> {
        let vbr = vb.pp("resblocks");
        let mut resblocks = Vec::with_capacity(c.layers);
        for i in 0..c.layers {
            resblocks.push(ResidualAttentionBlock::new(&vbr.pp(i), c)?);
        }
        tracing::debug!(
            prefix = %vb.prefix(),
            layers = c.layers,
            width = c.width,
            heads = c.heads,
            "transformer stack assembled"
        );
        Ok(Self { resblocks })
    }

    pub fn len(&self) -> usize {
        self.resblocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resblocks.is_empty()
    }

    /// Runs every block in order; the same mask is handed to each of them.
    pub fn forward(&self, xs: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let mut x = xs.clone();
        for block in &self.resblocks {
            x = block.forward(&x, mask)?;
        }
        Ok(x)
    }
}
