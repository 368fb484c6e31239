use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClipError {
    #[error("{component}: hidden size {hidden_size} is not divisible by {num_heads} heads")]
    HeadMismatch {
        component: String,
        hidden_size: usize,
        num_heads: usize,
    },

    #[error("{component}: shape mismatch, expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        component: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("invalid config `{field}`: {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, ClipError>;

impl ClipError {
    pub fn shape(component: impl Into<String>, expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            component: component.into(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    pub fn config(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field,
            reason: reason.into(),
        }
    }
}

/// Adds a residual branch to its input, refusing to broadcast.
pub fn residual_add(
    component: &str,
    input: &candle_core::Tensor,
    branch: &candle_core::Tensor,
) -> Result<candle_core::Tensor> {
    if input.dims() != branch.dims() {
        return Err(ClipError::shape(component, input.dims(), branch.dims()));
    }
    Ok((input + branch)?)
}
