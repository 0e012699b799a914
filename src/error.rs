use thiserror::Error;

/// Errors surfaced by the layer simulation engine.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("layer index {index} is outside the catalog (0..{len})")]
    InvalidLayerIndex { index: isize, len: usize },

    #[error(
        "output dimension is not positive for input {input_dim}, kernel {kernel_size}, stride {stride}, padding {padding}"
    )]
    DegenerateOutputDimension {
        input_dim: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
    },

    #[error("invalid value {value} for parameter `{name}`")]
    InvalidParameter { name: &'static str, value: usize },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, SimError>;
