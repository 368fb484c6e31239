use super::*;

// Standardizes each group of channels of an image batch over (channels in group, H, W),
// then applies a per-channel scale and shift.
// With a single group every sample is normalized as a whole, which is what the ResNet tower uses.
pub struct GroupNorm {
    pub scale: Tensor,
    pub shift: Tensor,
    pub num_groups: usize,
    pub eps: f64,
}

impl GroupNorm {
    pub fn new(vb: &VarBuilder, num_groups: usize, num_channels: usize, eps: f64) -> Result<Self> {
        if num_groups == 0 || num_channels % num_groups != 0 {
            return Err(ClipError::config(
                "num_groups",
                format!(
                    "{}: {num_channels} channels cannot be split into {num_groups} groups",
                    vb.prefix()
                ),
            ));
        }
        let scale = vb.get_with_hints(num_channels, "weight", Init::Const(1.))?;
        let shift = vb.get_with_hints(num_channels, "bias", Init::Const(0.))?;
        Ok(Self {
            scale,
            shift,
            num_groups,
            eps,
        })
    }

    pub fn num_channels(&self) -> usize {
        self.scale.dims()[0]
    }
}

impl ModuleT for GroupNorm {
    fn forward_t(&self, xs: &Tensor, _: bool) -> candle_core::Result<Tensor> {
        let (b, c, h, w) = xs.dims4()?;
        let grouped = xs.reshape((b, self.num_groups, (c / self.num_groups) * h * w))?;

        // biased variance, as in the usual definition of group norm
        let mean = grouped.mean_keepdim(D::Minus1)?;
        let centered = grouped.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let std_gaus = centered.broadcast_div(&(var + self.eps)?.sqrt()?)?;

        let std_gaus = std_gaus.reshape((b, c, h, w))?;
        let scale = self.scale.reshape((1, c, 1, 1))?;
        let shift = self.shift.reshape((1, c, 1, 1))?;
        std_gaus.broadcast_mul(&scale)?.broadcast_add(&shift)
    }
}
