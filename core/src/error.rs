/// Contract violations raised before any computation starts.
///
/// Numerical divergence between two evaluation paths is not an error here;
/// it is reported by `compare::assert_close` inside tests.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecurrenceError {
    #[error("{name}: expected a {expected}-d tensor, got shape {actual:?}")]
    Rank {
        name: &'static str,
        expected: usize,
        actual: Vec<usize>,
    },

    #[error("shape mismatch for {name}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("tensor data length {len} does not match shape {shape:?}")]
    DataLength { len: usize, shape: Vec<usize> },

    #[error("chunk size must be a power of two >= 1, got {0}")]
    InvalidChunkSize(usize),

    #[error("block size must be >= 1")]
    InvalidBlockSize,

    #[error("invalid segment boundaries: {0}")]
    InvalidBoundaries(String),

    #[error("segment boundaries require batch size 1, got {0}")]
    VarlenBatch(usize),

    #[error("query heads ({query_heads}) must be a multiple of kv heads ({kv_heads})")]
    HeadGroup { query_heads: usize, kv_heads: usize },

    #[error("config error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for RecurrenceError {
    fn from(e: serde_json::Error) -> Self {
        RecurrenceError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RecurrenceError>;
