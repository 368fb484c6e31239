use super::*;

fn default_layer_norm_eps() -> f64 {
    1e-5
}

fn default_num_channels() -> usize {
    3
}

// ln(1 / 0.07)
fn default_logit_scale_init() -> f64 {
    (1. / 0.07_f64).ln()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClipTextConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_attention_heads: usize,
    pub num_hidden_layers: usize,
    pub max_position_embeddings: usize, // context length, also the side of the causal mask
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
}

impl ClipTextConfig {
    pub fn stack(&self) -> StackConfig {
        StackConfig {
            width: self.hidden_size,
            layers: self.num_hidden_layers,
            heads: self.num_attention_heads,
            intermediate_size: self.intermediate_size,
            layer_norm_eps: self.layer_norm_eps,
        }
    }

    pub fn validate(&self) -> Result<()> {
        positive("text_config.vocab_size", self.vocab_size)?;
        positive("text_config.hidden_size", self.hidden_size)?;
        positive("text_config.intermediate_size", self.intermediate_size)?;
        positive("text_config.num_hidden_layers", self.num_hidden_layers)?;
        positive("text_config.max_position_embeddings", self.max_position_embeddings)?;
        divisible("text_config", self.hidden_size, self.num_attention_heads)
    }
}

/// Layer layout of the image tower; an int selects the vision transformer,
/// four stage depths select the modified ResNet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VisionLayers {
    Transformer(usize),
    ResNet([usize; 4]),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClipVisionConfig {
    #[serde(rename = "num_hidden_layers")]
    pub layers: VisionLayers,
    pub hidden_size: usize, // transformer width, or the ResNet base width
    pub intermediate_size: usize,
    pub num_attention_heads: usize, // unused by the ResNet tower, whose heads derive from the width
    #[serde(default = "default_num_channels")]
    pub num_channels: usize,
    pub image_size: usize,
    pub patch_size: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default)]
    pub use_proj: bool, // transformer tower projects with its own `proj` matrix
}

impl ClipVisionConfig {
    pub fn stack(&self, layers: usize) -> StackConfig {
        StackConfig {
            width: self.hidden_size,
            layers,
            heads: self.num_attention_heads,
            intermediate_size: self.intermediate_size,
            layer_norm_eps: self.layer_norm_eps,
        }
    }

    pub fn resnet_heads(&self) -> usize {
        self.hidden_size * 32 / 64
    }

    pub fn validate(&self) -> Result<()> {
        positive("vision_config.hidden_size", self.hidden_size)?;
        positive("vision_config.num_channels", self.num_channels)?;
        positive("vision_config.image_size", self.image_size)?;

        match self.layers {
            VisionLayers::Transformer(layers) => {
                positive("vision_config.num_hidden_layers", layers)?;
                positive("vision_config.intermediate_size", self.intermediate_size)?;
                positive("vision_config.patch_size", self.patch_size)?;
                if self.image_size % self.patch_size != 0 {
                    return Err(ClipError::config(
                        "vision_config.image_size",
                        format!(
                            "{} is not a multiple of the patch size {}",
                            self.image_size, self.patch_size
                        ),
                    ));
                }
                divisible("vision_config", self.hidden_size, self.num_attention_heads)
            }
            VisionLayers::ResNet(layers) => {
                if layers.contains(&0) {
                    return Err(ClipError::config(
                        "vision_config.num_hidden_layers",
                        format!("every stage needs at least one block, got {layers:?}"),
                    ));
                }
                if self.image_size % 32 != 0 {
                    return Err(ClipError::config(
                        "vision_config.image_size",
                        format!("{} is not a multiple of 32", self.image_size),
                    ));
                }
                if self.hidden_size % 2 != 0 {
                    return Err(ClipError::config(
                        "vision_config.hidden_size",
                        format!("resnet width {} must be even", self.hidden_size),
                    ));
                }
                divisible("vision_config.attnpool", self.hidden_size * 32, self.resnet_heads())
            }
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClipConfig {
    pub text_config: ClipTextConfig,
    pub vision_config: ClipVisionConfig,
    pub projection_dim: usize,
    #[serde(default = "default_logit_scale_init")]
    pub logit_scale_init: f64,
}

impl ClipConfig {
    pub fn validate(&self) -> Result<()> {
        positive("projection_dim", self.projection_dim)?;
        self.text_config.validate()?;
        self.vision_config.validate()
    }

    pub fn from_json_str(json: &str) -> eyre::Result<Self> {
        let out: Self = serde_json::from_str(json)?;
        out.validate()?;
        Ok(out)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> eyre::Result<Self> {
        let json = fs::read_to_string(path.as_ref())
            .wrap_err_with(|| format!("reading {}", path.as_ref().display()))?;
        Self::from_json_str(&json)
    }

    fn text_base(hidden_size: usize, num_attention_heads: usize) -> ClipTextConfig {
        ClipTextConfig {
            vocab_size: 49408,
            hidden_size,
            intermediate_size: 4 * hidden_size,
            num_attention_heads,
            num_hidden_layers: 12,
            max_position_embeddings: 77,
            layer_norm_eps: 1e-5,
        }
    }

    pub fn vit_l_14() -> Self {
        Self {
            text_config: Self::text_base(768, 12),
            vision_config: ClipVisionConfig {
                layers: VisionLayers::Transformer(24),
                hidden_size: 1024,
                intermediate_size: 4096,
                num_attention_heads: 16,
                num_channels: 3,
                image_size: 224,
                patch_size: 14,
                layer_norm_eps: 1e-5,
                use_proj: false,
            },
            projection_dim: 768,
            logit_scale_init: default_logit_scale_init(),
        }
    }

    pub fn vit_b_32() -> Self {
        Self {
            text_config: Self::text_base(512, 8),
            vision_config: ClipVisionConfig {
                layers: VisionLayers::Transformer(12),
                hidden_size: 768,
                intermediate_size: 3072,
                num_attention_heads: 12,
                num_channels: 3,
                image_size: 224,
                patch_size: 32,
                layer_norm_eps: 1e-5,
                use_proj: false,
            },
            projection_dim: 512,
            logit_scale_init: default_logit_scale_init(),
        }
    }

    pub fn rn50() -> Self {
        Self {
            text_config: Self::text_base(512, 8),
            vision_config: ClipVisionConfig {
                layers: VisionLayers::ResNet([3, 4, 6, 3]),
                hidden_size: 64,
                intermediate_size: 0,
                num_attention_heads: 0,
                num_channels: 3,
                image_size: 224,
                patch_size: 0,
                layer_norm_eps: 1e-5,
                use_proj: false,
            },
            projection_dim: 1024,
            logit_scale_init: default_logit_scale_init(),
        }
    }
}

fn positive(field: &'static str, value: usize) -> Result<()> {
    if value == 0 {
        return Err(ClipError::config(field, "must be greater than zero"));
    }
    Ok(())
}

fn divisible(component: &str, hidden_size: usize, num_heads: usize) -> Result<()> {
    if num_heads == 0 || hidden_size % num_heads != 0 {
        return Err(ClipError::HeadMismatch {
            component: component.to_string(),
            hidden_size,
            num_heads,
        });
    }
    Ok(())
}
