use super::*;

pub const EXPANSION: usize = 4;

// every norm in the tower normalizes over a single group
const NORM_GROUPS: usize = 1;

fn conv(vb: VarBuilder, c_in: usize, c_out: usize, kernel: usize, stride: usize) -> Result<Conv2d> {
    let cfg = Conv2dConfig {
        padding: kernel / 2,
        stride,
        ..Default::default()
    };
    Ok(conv2d_no_bias(c_in, c_out, kernel, cfg, vb)?)
}

fn pool(xs: &Tensor, stride: usize) -> candle_core::Result<Tensor> {
    if stride > 1 {
        xs.max_pool2d(stride)
    } else {
        Ok(xs.clone())
    }
}

/// Projection shortcut: pool with the block's stride, 1x1 conv to the expanded width, norm.
pub struct Downsample {
    pub conv: Conv2d,
    pub norm: GroupNorm,
    pub stride: usize,
}

impl Downsample {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let x = pool(xs, self.stride)?;
        let x = self.conv.forward(&x)?;
        self.norm.forward_t(&x, false)
    }
}

/// 1x1 -> 3x3 -> 1x1 residual unit with x4 channel expansion.
pub struct Bottleneck {
    pub conv1: Conv2d,
    pub bn1: GroupNorm,
    pub conv2: Conv2d,
    pub bn2: GroupNorm,
    pub conv3: Conv2d,
    pub bn3: GroupNorm,
    pub stride: usize,
    pub downsample: Option<Downsample>,
    name: String,
}

impl Bottleneck {
    pub fn new(
        vb: &VarBuilder,
        inplanes: usize,
        planes: usize,
        stride: usize,
        eps: f64,
    ) -> Result<Self> {
        let expanded = planes * EXPANSION;

        let conv1 = conv(vb.pp("conv1"), inplanes, planes, 1, 1)?;
        let bn1 = GroupNorm::new(&vb.pp("bn1"), NORM_GROUPS, planes, eps)?;
        let conv2 = conv(vb.pp("conv2"), planes, planes, 3, 1)?;
        let bn2 = GroupNorm::new(&vb.pp("bn2"), NORM_GROUPS, planes, eps)?;
        let conv3 = conv(vb.pp("conv3"), planes, expanded, 1, 1)?;
        let bn3 = GroupNorm::new(&vb.pp("bn3"), NORM_GROUPS, expanded, eps)?;

        let downsample = if stride > 1 || inplanes != expanded {
            let vbd = vb.pp("downsample");
            Some(Downsample {
                conv: conv(vbd.pp("0"), inplanes, expanded, 1, 1)?,
                norm: GroupNorm::new(&vbd.pp("1"), NORM_GROUPS, expanded, eps)?,
                stride,
            })
        } else {
            None
        };

        Ok(Self {
            conv1,
            bn1,
            conv2,
            bn2,
            conv3,
            bn3,
            stride,
            downsample,
            name: vb.prefix(),
        })
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let out = self.bn1.forward_t(&self.conv1.forward(xs)?, false)?.relu()?;
        let out = self.bn2.forward_t(&self.conv2.forward(&out)?, false)?.relu()?;
        let out = pool(&out, self.stride)?;
        let out = self.bn3.forward_t(&self.conv3.forward(&out)?, false)?;

        let shortcut = match &self.downsample {
            Some(ds) => ds.forward(xs)?,
            None => xs.clone(),
        };
        Ok(residual_add(&self.name, &shortcut, &out)?.relu()?)
    }
}

/// Convolutional image tower: three-conv stem, four bottleneck stages, attention pooling.
pub struct ModifiedResNet {
    pub conv1: Conv2d,
    pub bn1: GroupNorm,
    pub conv2: Conv2d,
    pub bn2: GroupNorm,
    pub conv3: Conv2d,
    pub bn3: GroupNorm,
    pub layers: Vec<Vec<Bottleneck>>,
    pub attnpool: AttentionPool2d,
}

impl ModifiedResNet {
    pub fn new(
        vb: &VarBuilder,
        c: &ClipVisionConfig,
        layers: [usize; 4],
        output_dim: usize,
    ) -> Result<Self> {
        let width = c.hidden_size;
        let eps = c.layer_norm_eps;

        let conv1 = conv(vb.pp("conv1"), c.num_channels, width / 2, 3, 2)?;
        let bn1 = GroupNorm::new(&vb.pp("bn1"), NORM_GROUPS, width / 2, eps)?;
        let conv2 = conv(vb.pp("conv2"), width / 2, width / 2, 3, 1)?;
        let bn2 = GroupNorm::new(&vb.pp("bn2"), NORM_GROUPS, width / 2, eps)?;
        let conv3 = conv(vb.pp("conv3"), width / 2, width, 3, 1)?;
        let bn3 = GroupNorm::new(&vb.pp("bn3"), NORM_GROUPS, width, eps)?;

        let mut inplanes = width;
        let mut stages = Vec::with_capacity(layers.len());
        for (i, &blocks) in layers.iter().enumerate() {
            let planes = width << i;
            let stride = if i == 0 { 1 } else { 2 };
            let stage = Self::make_layer(
                &vb.pp(format!("layer{}", i + 1)),
                &mut inplanes,
                planes,
                blocks,
                stride,
                eps,
            )?;
            stages.push(stage);
        }

        let embed_dim = width * 32;
        let attnpool = AttentionPool2d::new(
            &vb.pp("attnpool"),
            c.image_size / 32,
            embed_dim,
            c.resnet_heads(),
            output_dim,
        )?;

        tracing::debug!(
            prefix = %vb.prefix(),
            width,
            ?layers,
            embed_dim,
            heads = c.resnet_heads(),
            "modified resnet assembled"
        );

        Ok(Self {
            conv1,
            bn1,
            conv2,
            bn2,
            conv3,
            bn3,
            layers: stages,
            attnpool,
        })
    }

    // only the first block of a stage strides
    fn make_layer(
        vb: &VarBuilder,
        inplanes: &mut usize,
        planes: usize,
        blocks: usize,
        stride: usize,
        eps: f64,
    ) -> Result<Vec<Bottleneck>> {
        let mut out = Vec::with_capacity(blocks);
        for i in 0..blocks {
            let stride = if i == 0 { stride } else { 1 };
            out.push(Bottleneck::new(&vb.pp(i), *inplanes, planes, stride, eps)?);
            *inplanes = planes * EXPANSION;
        }
        Ok(out)
    }

    pub fn output_dim(&self) -> usize {
        self.attnpool.output_dim()
    }

    pub fn stem(&self, xs: &Tensor) -> Result<Tensor> {
        let x = self.bn1.forward_t(&self.conv1.forward(xs)?, false)?.relu()?;
        let x = self.bn2.forward_t(&self.conv2.forward(&x)?, false)?.relu()?;
        let x = self.bn3.forward_t(&self.conv3.forward(&x)?, false)?.relu()?;
        Ok(x.max_pool2d(2)?)
    }

    /// Feature map before pooling: (B, width * 32, H / 32, W / 32).
    pub fn features(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let mut x = self.stem(pixel_values)?;
        for block in self.layers.iter().flatten() {
            x = block.forward(&x)?;
        }
        Ok(x)
    }

    pub fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let x = self.features(pixel_values)?;
        tracing::trace!(shape = ?x.dims(), "resnet features");
        self.attnpool.forward(&x)
    }
}
