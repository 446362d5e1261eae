pub mod error;
pub mod tensor;
pub mod config;
pub mod layout;
pub mod varlen;
pub mod tril;
pub mod compare;
pub mod gradient;
pub mod gated_delta;
pub mod gated_delta_chunk;
pub mod gla;
pub mod linear_attn;
pub mod gsa;
pub mod nsa;

pub use config::{RecurrenceConfig, SparseAttentionConfig};
pub use error::{RecurrenceError, Result};
pub use gated_delta::{recurrent_gated_delta_rule, GatedDeltaGrads, GatedDeltaInputs};
pub use gated_delta_chunk::chunk_gated_delta_rule;
pub use layout::{Layout, RecurrenceOutput};
pub use tensor::Tensor;
pub use varlen::SegmentBoundaries;
