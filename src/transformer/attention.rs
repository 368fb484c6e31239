use super::*;

/// Parameter layout of the query/key/value projections.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProjectionLayout {
    /// A single `in_proj` producing `3 * d_model` features, ordered query, key, value.
    Packed,
    /// Independent `q_proj`, `k_proj` and `v_proj`.
    Split,
}

#[derive(Clone, Copy, Debug)]
enum Role {
    Query = 0,
    Key = 1,
    Value = 2,
}

pub enum InProjection {
    Packed(Linear),
    Split {
        q_proj: Linear,
        k_proj: Linear,
        v_proj: Linear,
    },
}

impl InProjection {
    pub fn new(vb: &VarBuilder, d_model: usize, layout: ProjectionLayout) -> Result<Self> {
        let out = match layout {
            ProjectionLayout::Packed => {
                Self::Packed(linear_b(d_model, 3 * d_model, true, vb.pp("in_proj"))?)
            }
            ProjectionLayout::Split => Self::split_with_input_dims(vb, d_model, d_model, d_model)?,
        };
        Ok(out)
    }

    /// Split projections reading keys of width `key_dim` and values of width `value_dim`.
    pub fn split_with_input_dims(
        vb: &VarBuilder,
        d_model: usize,
        key_dim: usize,
        value_dim: usize,
    ) -> Result<Self> {
        Ok(Self::Split {
            q_proj: linear_b(d_model, d_model, true, vb.pp("q_proj"))?,
            k_proj: linear_b(key_dim, d_model, true, vb.pp("k_proj"))?,
            v_proj: linear_b(value_dim, d_model, true, vb.pp("v_proj"))?,
        })
    }

    pub fn layout(&self) -> ProjectionLayout {
        match self {
            Self::Packed(_) => ProjectionLayout::Packed,
            Self::Split { .. } => ProjectionLayout::Split,
        }
    }

    /// Width of each projected query/key/value.
    pub fn d_model(&self) -> usize {
        match self {
            Self::Packed(proj) => proj.weight().dims()[0] / 3,
            Self::Split { q_proj, .. } => q_proj.weight().dims()[0],
        }
    }

    /// Feature widths of the query, key and value inputs.
    pub fn input_dims(&self) -> [usize; 3] {
        match self {
            Self::Packed(proj) => [proj.weight().dims()[1]; 3],
            Self::Split {
                q_proj,
                k_proj,
                v_proj,
            } => [
                q_proj.weight().dims()[1],
                k_proj.weight().dims()[1],
                v_proj.weight().dims()[1],
            ],
        }
    }

    /// Splits a packed projection into its three role-wise projections.
    ///
    /// `in_proj.weight[0..D]`, `[D..2D]` and `[2D..3D]` (and the same bias slices)
    /// become the query, key and value projections. Split projections are returned as is.
    pub fn into_split(self) -> candle_core::Result<Self> {
        let Self::Packed(proj) = &self else {
            return Ok(self);
        };
        Ok(Self::Split {
            q_proj: Self::packed_role(proj, Role::Query)?,
            k_proj: Self::packed_role(proj, Role::Key)?,
            v_proj: Self::packed_role(proj, Role::Value)?,
        })
    }

    fn packed_role(proj: &Linear, role: Role) -> candle_core::Result<Linear> {
        let d = proj.weight().dims()[0] / 3;
        let start = role as usize * d;
        let weight = proj.weight().narrow(0, start, d)?;
        let bias = proj.bias().map(|b| b.narrow(0, start, d)).transpose()?;
        Ok(Linear::new(weight, bias))
    }

    fn project_role(&self, role: Role, xs: &Tensor) -> candle_core::Result<Tensor> {
        match (self, role) {
            (Self::Packed(proj), role) => Self::packed_role(proj, role)?.forward(xs),
            (Self::Split { q_proj, .. }, Role::Query) => q_proj.forward(xs),
            (Self::Split { k_proj, .. }, Role::Key) => k_proj.forward(xs),
            (Self::Split { v_proj, .. }, Role::Value) => v_proj.forward(xs),
        }
    }

    fn project(
        &self,
        queries: &Tensor,
        keys: &Tensor,
        values: &Tensor,
    ) -> candle_core::Result<(Tensor, Tensor, Tensor)> {
        let self_attention = queries.id() == keys.id() && keys.id() == values.id();
        match self {
            // one matmul for the whole packed projection
            Self::Packed(proj) if self_attention => {
                let d = self.d_model();
                let qkv = proj.forward(queries)?;
                Ok((
                    qkv.narrow(D::Minus1, 0, d)?,
                    qkv.narrow(D::Minus1, d, d)?,
                    qkv.narrow(D::Minus1, 2 * d, d)?,
                ))
            }
            _ => Ok((
                self.project_role(Role::Query, queries)?,
                self.project_role(Role::Key, keys)?,
                self.project_role(Role::Value, values)?,
            )),
        }
    }
}

pub struct MultiHeadAttention {
    pub num_heads: usize,
    pub d_model: usize,
    pub head_dim: usize,
    pub in_proj: InProjection,
    pub out_proj: Linear,
    pub scaling: f64,
    name: String,
}

impl MultiHeadAttention {
    /// Builds an attention layer whose output projection maps `d_model` to `out_dim`.
    pub fn new(
        vb: &VarBuilder,
        d_model: usize,
        num_heads: usize,
        layout: ProjectionLayout,
        out_dim: usize,
    ) -> Result<Self> {
        check_heads(&vb.prefix(), d_model, num_heads)?;
        let in_proj = InProjection::new(vb, d_model, layout)?;
        let out_name = match layout {
            ProjectionLayout::Packed => "out_proj",
            ProjectionLayout::Split => "c_proj",
        };
        let out_proj = linear_b(d_model, out_dim, true, vb.pp(out_name))?;
        Self::from_projections(vb.prefix(), in_proj, out_proj, num_heads)
    }

    /// Cross attention over keys and values whose widths differ from `d_model`.
    pub fn with_input_dims(
        vb: &VarBuilder,
        d_model: usize,
        key_dim: usize,
        value_dim: usize,
        num_heads: usize,
        out_dim: usize,
    ) -> Result<Self> {
        check_heads(&vb.prefix(), d_model, num_heads)?;
        let in_proj = InProjection::split_with_input_dims(vb, d_model, key_dim, value_dim)?;
        let out_proj = linear_b(d_model, out_dim, true, vb.pp("c_proj"))?;
        Self::from_projections(vb.prefix(), in_proj, out_proj, num_heads)
    }

    pub fn from_projections(
        name: impl Into<String>,
        in_proj: InProjection,
        out_proj: Linear,
        num_heads: usize,
    ) -> Result<Self> {
        let name = name.into();
        let d_model = in_proj.d_model();
        check_heads(&name, d_model, num_heads)?;

        let out_in = out_proj.weight().dims()[1];
        if out_in != d_model {
            return Err(ClipError::shape(
                format!("{name}.out_proj"),
                &[d_model],
                &[out_in],
            ));
        }

        let head_dim = d_model / num_heads;
        Ok(Self {
            num_heads,
            d_model,
            head_dim,
            in_proj,
            out_proj,
            scaling: 1. / (head_dim as f64).sqrt(),
            name,
        })
    }

    pub fn out_dim(&self) -> usize {
        self.out_proj.weight().dims()[0]
    }

    /// `queries` (B, L, D), `keys` (B, S, Dk), `values` (B, S, Dv), optional additive
    /// `mask` (L, S). Returns (B, L, out_dim).
    pub fn forward(
        &self,
        queries: &Tensor,
        keys: &Tensor,
        values: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (b, l, s) = self.check_inputs(queries, keys, Some(values))?;
        let (q, k, v) = self.in_proj.project(queries, keys, values)?;

        let weights = self.weights_from_projected(&q, &k, (b, l, s), mask)?;
        let v = self.split_heads(&v, b, s)?;

        // (B, H, L, head_dim) -> (B, L, D)
        let ctx = weights.matmul(&v)?.transpose(1, 2)?;
        let ctx = ctx.reshape((b, l, self.d_model))?;

        Ok(self.out_proj.forward(&ctx)?)
    }

    /// Self-attention over `xs`, the form used inside the residual blocks.
    pub fn self_attention(&self, xs: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        self.forward(xs, xs, xs, mask)
    }

    /// Softmaxed attention map (B, H, L, S).
    pub fn attention_weights(
        &self,
        queries: &Tensor,
        keys: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (b, l, s) = self.check_inputs(queries, keys, None)?;
        let q = self.in_proj.project_role(Role::Query, queries)?;
        let k = self.in_proj.project_role(Role::Key, keys)?;
        self.weights_from_projected(&q, &k, (b, l, s), mask)
    }

    fn check_inputs(
        &self,
        queries: &Tensor,
        keys: &Tensor,
        values: Option<&Tensor>,
    ) -> Result<(usize, usize, usize)> {
        let [q_dim, k_dim, v_dim] = self.in_proj.input_dims();

        let (b, l, qd) = queries.dims3()?;
        if qd != q_dim {
            return Err(ClipError::shape(
                format!("{}.queries", self.name),
                &[b, l, q_dim],
                queries.dims(),
            ));
        }
        let (kb, s, kd) = keys.dims3()?;
        if kb != b || kd != k_dim {
            return Err(ClipError::shape(
                format!("{}.keys", self.name),
                &[b, s, k_dim],
                keys.dims(),
            ));
        }
        if let Some(values) = values {
            if values.dims() != [b, s, v_dim] {
                return Err(ClipError::shape(
                    format!("{}.values", self.name),
                    &[b, s, v_dim],
                    values.dims(),
                ));
            }
        }
        Ok((b, l, s))
    }

    fn weights_from_projected(
        &self,
        q: &Tensor,
        k: &Tensor,
        (b, l, s): (usize, usize, usize),
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let q = self.split_heads(q, b, l)?;
        let k = self.split_heads(k, b, s)?;

        let scores = (q.matmul(&k.t()?)? * self.scaling)?;
        let scores = match mask {
            Some(mask) => {
                if mask.dims() != [l, s] {
                    return Err(ClipError::shape(
                        format!("{}.mask", self.name),
                        &[l, s],
                        mask.dims(),
                    ));
                }
                scores.broadcast_add(&mask.to_dtype(scores.dtype())?)?
            }
            None => scores,
        };

        Ok(softmax_last_dim(&scores)?)
    }

    // (B, N, D) -> (B, H, N, head_dim)
    fn split_heads(&self, xs: &Tensor, b: usize, n: usize) -> candle_core::Result<Tensor> {
        xs.reshape((b, n, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }
}

fn check_heads(component: &str, hidden_size: usize, num_heads: usize) -> Result<()> {
    if num_heads == 0 || hidden_size % num_heads != 0 {
        return Err(ClipError::HeadMismatch {
            component: component.to_string(),
            hidden_size,
            num_heads,
        });
    }
    Ok(())
}

/// Additive causal mask (size, size): 0 where `i >= j`, -inf above the diagonal.
pub fn causal_mask(size: usize, device: &Device) -> candle_core::Result<Tensor> {
    let rows = Tensor::arange(0u32, size as u32, device)?.unsqueeze(1)?;
    let cols = Tensor::arange(0u32, size as u32, device)?.unsqueeze(0)?;
    let allowed = rows.broadcast_ge(&cols)?;

    let zeros = Tensor::zeros((size, size), DType::F32, device)?;
    let blocked = Tensor::full(f32::NEG_INFINITY, (size, size), device)?;
    allowed.where_cond(&zeros, &blocked)
}
