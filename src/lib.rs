use candle_core::{D, DType, Device, IndexOp, Tensor};
use candle_nn::ops::{sigmoid, softmax_last_dim};
use candle_nn::{
    Conv2d, Conv2dConfig, Embedding, Init, LayerNorm, Linear, Module, ModuleT, VarBuilder,
    conv2d_no_bias, embedding, layer_norm, linear_b, linear_no_bias,
};

use eyre::WrapErr;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

mod error;
pub use error::*;

mod custom_norm;
pub use custom_norm::*;

mod p_norm;
pub use p_norm::*;

mod transformer;
pub use transformer::*;

mod vision;
pub use vision::*;

mod text;
pub use text::*;

mod clip;
pub use clip::*;
