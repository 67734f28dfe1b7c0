use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    Config(#[from] serde_json::Error),

    #[error(transparent)]
    Regex(#[from] regex::Error),

    #[error("`{0}` called before create_network")]
    NotInitialized(&'static str),

    #[error("`{0}` needs an adjacency tensor but none is set")]
    MissingAdjacency(&'static str),

    #[error("`{0}` needs labels but none are set")]
    MissingLabels(&'static str),

    #[error("{layer}: expected {expected}, got {actual}")]
    ShapeMismatch {
        layer: &'static str,
        expected: String,
        actual: String,
    },

    #[error("keep probability must be in (0, 1], got {0}")]
    InvalidKeepProb(f32),

    #[error("convolution needs a positive filter size and stride, got {filter_size} and {stride}")]
    InvalidConvOptions { filter_size: usize, stride: usize },

    #[error("invalid graph #{index}: {reason}")]
    InvalidGraph { index: usize, reason: String },

    #[error("cannot batch an empty list of graphs")]
    EmptyBatch,

    #[error("cannot parse layer `{0}`")]
    LayerSpec(String),
}
