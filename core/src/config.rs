/// Run configuration for the recurrent and chunked evaluators.
///
/// Both structs deserialize from JSON with every field optional except the
/// NSA block size. Validation happens in `validate()`, which every entry
/// point calls before touching tensor data.

use serde::{Serialize, Deserialize};

use crate::error::{RecurrenceError, Result};
use crate::layout::Layout;

/// Default tiling unit for the chunked paths.
pub const DEFAULT_CHUNK_SIZE: usize = 64;

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn check_scale(scale: Option<f32>) -> Result<()> {
    match scale {
        Some(s) if !s.is_finite() => Err(RecurrenceError::Config(format!("scale must be finite, got {s}"))),
        _ => Ok(()),
    }
}

/// Configuration shared by the gated delta rule, GLA, linear attention and GSA.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecurrenceConfig {
    /// Query pre-multiplier. `None` means `1/sqrt(key_dim)`.
    pub scale: Option<f32>,
    /// Tiling unit for the chunked paths. Ignored by the recurrent paths.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Dimension order of the sequence tensors.
    pub layout: Layout,
    /// Emit the hidden state after the last step of every sequence/segment.
    pub output_final_state: bool,
}

impl Default for RecurrenceConfig {
    fn default() -> Self {
        RecurrenceConfig {
            scale: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            layout: Layout::HeadFirst,
            output_final_state: false,
        }
    }
}

impl RecurrenceConfig {
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_layout(mut self, layout: Layout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = Some(scale);
        self
    }

    pub fn with_final_state(mut self, output_final_state: bool) -> Self {
        self.output_final_state = output_final_state;
        self
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let cfg: RecurrenceConfig = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Chunk size must be a power of two (1 is allowed).
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || !self.chunk_size.is_power_of_two() {
            return Err(RecurrenceError::InvalidChunkSize(self.chunk_size));
        }
        self.validate_scale()
    }

    /// The part of `validate` that also applies to the recurrent paths.
    pub fn validate_scale(&self) -> Result<()> {
        check_scale(self.scale)
    }

    pub fn resolved_scale(&self, key_dim: usize) -> f32 {
        self.scale.unwrap_or_else(|| 1.0 / (key_dim as f32).sqrt())
    }
}

/// Configuration for native sparse attention.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SparseAttentionConfig {
    /// Number of consecutive key positions covered by one selected block.
    pub block_size: usize,
    #[serde(default)]
    pub scale: Option<f32>,
    #[serde(default)]
    pub layout: Layout,
}

impl SparseAttentionConfig {
    pub fn new(block_size: usize) -> Self {
        SparseAttentionConfig { block_size, scale: None, layout: Layout::HeadFirst }
    }

    pub fn with_layout(mut self, layout: Layout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = Some(scale);
        self
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let cfg: SparseAttentionConfig = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(RecurrenceError::InvalidBlockSize);
        }
        check_scale(self.scale)
    }

    pub fn resolved_scale(&self, key_dim: usize) -> f32 {
        self.scale.unwrap_or_else(|| 1.0 / (key_dim as f32).sqrt())
    }
}
