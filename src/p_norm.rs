use super::*;

/// Order of the vector norm.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum NormOrder {
    L1,
    L2,
    Inf,
    /// General `p > 0`: `sum(|x|^p)^(1/p)`.
    P(f64),
}

impl NormOrder {
    pub fn new(p: f64) -> Result<Self> {
        let out = match p {
            p if p == f64::INFINITY => Self::Inf,
            p if p == 1. => Self::L1,
            p if p == 2. => Self::L2,
            p if p.is_finite() && p > 0. => Self::P(p),
            p => return Err(ClipError::config("p", format!("norm order {p} is not positive"))),
        };
        Ok(out)
    }
}

/// Lp norm reducer over one axis, or over the whole tensor when `axis` is `None`.
///
/// Negative axes count from the end, so `-1` is the feature axis.
#[derive(Clone, Copy, Debug)]
pub struct PNorm {
    pub p: NormOrder,
    pub axis: Option<isize>,
    pub keepdim: bool,
}

impl PNorm {
    pub fn new(p: NormOrder, axis: Option<isize>, keepdim: bool) -> Self {
        Self { p, axis, keepdim }
    }

    /// The norm CLIP uses for its embeddings: p = 2 over the feature axis, keeping it.
    pub fn l2_features() -> Self {
        Self::new(NormOrder::L2, Some(-1), true)
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let Some(axis) = self.axis else {
            let norm = self.reduce(&xs.flatten_all()?, 0)?;
            if self.keepdim {
                return Ok(norm.reshape(vec![1; xs.rank()])?);
            }
            return Ok(norm.squeeze(0)?);
        };

        let dim = self.resolve(axis, xs.rank())?;
        let norm = self.reduce(xs, dim)?;
        if self.keepdim {
            Ok(norm)
        } else {
            Ok(norm.squeeze(dim)?)
        }
    }

    /// Divides `xs` by its own norm, broadcasting along the reduced axis.
    pub fn normalize(&self, xs: &Tensor) -> Result<Tensor> {
        let keep = Self {
            keepdim: true,
            ..*self
        };
        let norm = keep.forward(xs)?;
        Ok(xs.broadcast_div(&norm)?)
    }

    // keeps the reduced dimension
    fn reduce(&self, xs: &Tensor, dim: usize) -> candle_core::Result<Tensor> {
        match self.p {
            NormOrder::L1 => xs.abs()?.sum_keepdim(dim),
            NormOrder::L2 => xs.sqr()?.sum_keepdim(dim)?.sqrt(),
            NormOrder::Inf => xs.abs()?.max_keepdim(dim),
            NormOrder::P(p) => xs.abs()?.powf(p)?.sum_keepdim(dim)?.powf(1. / p),
        }
    }

    fn resolve(&self, axis: isize, rank: usize) -> Result<usize> {
        let dim = if axis < 0 {
            rank as isize + axis
        } else {
            axis
        };
        if dim < 0 || dim as usize >= rank {
            return Err(ClipError::config(
                "axis",
                format!("axis {axis} is out of range for a rank {rank} tensor"),
            ));
        }
        Ok(dim as usize)
    }
}
