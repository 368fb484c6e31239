use super::*;

/// The sigmoid approximation of GELU used throughout CLIP: `x * sigmoid(1.702 * x)`.
///
/// A unit struct in order to implement `candle_nn::ModuleT`
#[derive(Clone, Copy, Debug)]
pub struct QuickGelu;

impl ModuleT for QuickGelu {
    fn forward_t(&self, xs: &Tensor, _: bool) -> candle_core::Result<Tensor> {
        xs * sigmoid(&(xs * 1.702_f64)?)?
    }
}

pub struct Mlp {
    c_fc: Linear,
    gelu: QuickGelu,
    c_proj: Linear,
}

impl Mlp {
    pub fn new(vb: &VarBuilder, d_model: usize, intermediate_size: usize) -> Result<Self> {
        let c_fc = linear_b(d_model, intermediate_size, true, vb.pp("c_fc"))?;
        let c_proj = linear_b(intermediate_size, d_model, true, vb.pp("c_proj"))?;
        Ok(Self {
            c_fc,
            gelu: QuickGelu,
            c_proj,
        })
    }

    pub fn intermediate_size(&self) -> usize {
        self.c_fc.weight().dims()[0]
    }
}

impl ModuleT for Mlp {
    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let xs = self.c_fc.forward_t(xs, train)?;
        let xs = self.gelu.forward_t(&xs, train)?;
        self.c_proj.forward_t(&xs, train)
    }
}
