use super::*;

mod config;
pub use config::*;

/// Inputs of one forward pass.
pub struct ClipInputs<'a> {
    pub input_ids: &'a Tensor,    // (B_text, context_length) token ids
    pub pixel_values: &'a Tensor, // (B_image, C, H, W)
    pub mask: Option<&'a Tensor>, // additive causal mask, built from the text length when absent
}

impl<'a> ClipInputs<'a> {
    pub fn new(input_ids: &'a Tensor, pixel_values: &'a Tensor) -> Self {
        Self {
            input_ids,
            pixel_values,
            mask: None,
        }
    }

    pub fn with_mask(mut self, mask: &'a Tensor) -> Self {
        self.mask = Some(mask);
        self
    }
}

#[derive(Debug)]
pub struct ClipOutput {
    pub image_embeds: Tensor,     // (B_image, projection_dim), unit rows
    pub text_embeds: Tensor,      // (B_text, projection_dim), unit rows
    pub logits_per_image: Tensor, // (B_image, B_text)
    pub logits_per_text: Tensor,  // (B_text, B_image)
}

pub struct ClipModel {
    pub text_model: TextTransformer,
    pub vision_model: VisionTower,
    pub text_projection: Linear,
    pub visual_projection: Option<Linear>,
    pub logit_scale: Tensor,
    embed_norm: PNorm,
}

impl ClipModel {
    pub fn new(vb: &VarBuilder, c: &ClipConfig) -> Result<Self> {
        c.validate()?;

        let text_model = TextTransformer::new(vb, &c.text_config)?;
        let text_projection = linear_no_bias(
            text_model.width(),
            c.projection_dim,
            vb.pp("text_projection"),
        )?;

        let vision_model = VisionTower::new(&vb.pp("visual"), &c.vision_config, c.projection_dim)?;
        // the attention pool and the ViT `proj` already land in the shared width
        let visual_projection = match &vision_model {
            VisionTower::Transformer(vit) if vit.proj.is_none() => Some(linear_no_bias(
                vit.width(),
                c.projection_dim,
                vb.pp("visual_projection"),
            )?),
            _ => None,
        };

        let logit_scale = vb.get_with_hints((), "logit_scale", Init::Const(c.logit_scale_init))?;

        tracing::debug!(
            projection_dim = c.projection_dim,
            vision = ?c.vision_config.layers,
            visual_projection = visual_projection.is_some(),
            "clip model assembled"
        );

        Ok(Self {
            text_model,
            vision_model,
            text_projection,
            visual_projection,
            logit_scale,
            embed_norm: PNorm::l2_features(),
        })
    }

    /// Projected, not yet normalized, text features (B, projection_dim).
    pub fn get_text_features(&self, input_ids: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let pooled = self.text_model.forward(input_ids, mask)?;
        Ok(self.text_projection.forward(&pooled)?)
    }

    /// Projected, not yet normalized, image features (B, projection_dim).
    pub fn get_image_features(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let pooled = self.vision_model.forward(pixel_values)?;
        match &self.visual_projection {
            Some(proj) => Ok(proj.forward(&pooled)?),
            None => Ok(pooled),
        }
    }

    /// `exp(logit_scale) * image_embeds @ text_embeds^T`, and its transpose.
    pub fn similarity(
        &self,
        image_embeds: &Tensor,
        text_embeds: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let cosine = image_embeds.matmul(&text_embeds.t()?)?;
        let scale = self.logit_scale.exp()?.to_dtype(cosine.dtype())?;
        let logits_per_image = cosine.broadcast_mul(&scale)?;
        let logits_per_text = logits_per_image.t()?;
        Ok((logits_per_image, logits_per_text))
    }

    pub fn forward(&self, inputs: &ClipInputs) -> Result<ClipOutput> {
        let image_features = self.get_image_features(inputs.pixel_values)?;
        let text_features = self.get_text_features(inputs.input_ids, inputs.mask)?;

        let image_embeds = self.embed_norm.normalize(&image_features)?;
        let text_embeds = self.embed_norm.normalize(&text_features)?;

        let (logits_per_image, logits_per_text) = self.similarity(&image_embeds, &text_embeds)?;
        tracing::trace!(shape = ?logits_per_image.dims(), "clip logits");

        Ok(ClipOutput {
            image_embeds,
            text_embeds,
            logits_per_image,
            logits_per_text,
        })
    }
}
