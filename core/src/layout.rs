/// Dimension-order handling for sequence tensors.
///
/// Callers hand tensors in either `[batch, heads, time, dim]` or
/// `[batch, time, heads, dim]` order. Every kernel works on the head-first
/// form, so inputs are normalized into a `SeqBuf` on entry and converted
/// back on exit. In head-first order the rows of one (batch, head) pair are
/// contiguous, which is what lets a work unit borrow a plain slice.

use serde::{Serialize, Deserialize};

use crate::error::{RecurrenceError, Result};
use crate::tensor::Tensor;
use crate::varlen::WorkUnit;

/// Dimension order of a sequence tensor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Layout {
    /// `[batch, heads, time, dim]`.
    #[default]
    #[serde(rename = "batch-heads-time-dim")]
    HeadFirst,
    /// `[batch, time, heads, dim]`.
    #[serde(rename = "batch-time-heads-dim")]
    TimeFirst,
}

impl Layout {
    /// Read (batch, heads, time, dim) out of a rank-4 shape in this order.
    pub fn split4(self, shape: [usize; 4]) -> (usize, usize, usize, usize) {
        match self {
            Layout::HeadFirst => (shape[0], shape[1], shape[2], shape[3]),
            Layout::TimeFirst => (shape[0], shape[2], shape[1], shape[3]),
        }
    }

    /// Read (batch, heads, time) out of a rank-3 per-step scalar shape.
    pub fn split3(self, shape: [usize; 3]) -> (usize, usize, usize) {
        match self {
            Layout::HeadFirst => (shape[0], shape[1], shape[2]),
            Layout::TimeFirst => (shape[0], shape[2], shape[1]),
        }
    }

    pub fn shape4(self, batch: usize, heads: usize, time: usize, dim: usize) -> Vec<usize> {
        match self {
            Layout::HeadFirst => vec![batch, heads, time, dim],
            Layout::TimeFirst => vec![batch, time, heads, dim],
        }
    }

    pub fn shape3(self, batch: usize, heads: usize, time: usize) -> Vec<usize> {
        match self {
            Layout::HeadFirst => vec![batch, heads, time],
            Layout::TimeFirst => vec![batch, time, heads],
        }
    }
}

/// Head-first `[batch, heads, time, dim]` buffer.
///
/// Per-step scalars (beta, scalar gates) are stored with `dim == 1`.
#[derive(Clone, Debug, PartialEq)]
pub struct SeqBuf {
    pub data: Vec<f32>,
    pub batch: usize,
    pub heads: usize,
    pub time: usize,
    pub dim: usize,
}

impl SeqBuf {
    pub fn zeros(batch: usize, heads: usize, time: usize, dim: usize) -> Self {
        SeqBuf {
            data: vec![0.0; batch * heads * time * dim],
            batch,
            heads,
            time,
            dim,
        }
    }

    /// Normalize a rank-4 sequence tensor.
    pub fn from_tensor(t: &Tensor, layout: Layout, name: &'static str) -> Result<Self> {
        let shape = t.dims::<4>(name)?;
        let (batch, heads, time, dim) = layout.split4(shape);
        Ok(Self::from_flat(&t.data, layout, batch, heads, time, dim))
    }

    /// Normalize a rank-3 per-step scalar tensor (beta, scalar gate).
    pub fn gate_from_tensor(t: &Tensor, layout: Layout, name: &'static str) -> Result<Self> {
        let shape = t.dims::<3>(name)?;
        let (batch, heads, time) = layout.split3(shape);
        Ok(Self::from_flat(&t.data, layout, batch, heads, time, 1))
    }

    fn from_flat(data: &[f32], layout: Layout, batch: usize, heads: usize, time: usize, dim: usize) -> Self {
        match layout {
            Layout::HeadFirst => SeqBuf { data: data.to_vec(), batch, heads, time, dim },
            Layout::TimeFirst => {
                let mut out = SeqBuf::zeros(batch, heads, time, dim);
                for b in 0..batch {
                    for t in 0..time {
                        for h in 0..heads {
                            let src = ((b * time + t) * heads + h) * dim;
                            let dst = ((b * heads + h) * time + t) * dim;
                            out.data[dst..dst + dim].copy_from_slice(&data[src..src + dim]);
                        }
                    }
                }
                out
            }
        }
    }

    fn to_flat(&self, layout: Layout) -> Vec<f32> {
        match layout {
            Layout::HeadFirst => self.data.clone(),
            Layout::TimeFirst => {
                let (batch, heads, time, dim) = (self.batch, self.heads, self.time, self.dim);
                let mut out = vec![0.0f32; self.data.len()];
                for b in 0..batch {
                    for h in 0..heads {
                        for t in 0..time {
                            let src = ((b * heads + h) * time + t) * dim;
                            let dst = ((b * time + t) * heads + h) * dim;
                            out[dst..dst + dim].copy_from_slice(&self.data[src..src + dim]);
                        }
                    }
                }
                out
            }
        }
    }

    /// Back to a rank-4 tensor in `layout` order.
    pub fn to_tensor(&self, layout: Layout) -> Tensor {
        Tensor {
            data: self.to_flat(layout),
            shape: layout.shape4(self.batch, self.heads, self.time, self.dim),
        }
    }

    /// Back to a rank-3 tensor in `layout` order. Only meaningful for `dim == 1`.
    pub fn to_gate_tensor(&self, layout: Layout) -> Tensor {
        debug_assert_eq!(self.dim, 1);
        Tensor {
            data: self.to_flat(layout),
            shape: layout.shape3(self.batch, self.heads, self.time),
        }
    }

    /// Fails unless this buffer has the given head-first dims. The error
    /// reports shapes in the caller's `layout`.
    pub fn expect_dims(
        &self,
        name: &'static str,
        layout: Layout,
        batch: usize,
        heads: usize,
        time: usize,
        dim: usize,
    ) -> Result<()> {
        if (self.batch, self.heads, self.time, self.dim) != (batch, heads, time, dim) {
            let (expected, actual) = if dim == 1 && self.dim == 1 {
                (layout.shape3(batch, heads, time), layout.shape3(self.batch, self.heads, self.time))
            } else {
                (
                    layout.shape4(batch, heads, time, dim),
                    layout.shape4(self.batch, self.heads, self.time, self.dim),
                )
            };
            return Err(RecurrenceError::ShapeMismatch { name, expected, actual });
        }
        Ok(())
    }

    /// Flat index of row `(b, h, t)`.
    #[inline]
    pub fn row_offset(&self, b: usize, h: usize, t: usize) -> usize {
        ((b * self.heads + h) * self.time + t) * self.dim
    }

    /// All rows of one work unit, contiguous.
    pub fn unit_rows(&self, unit: &WorkUnit) -> &[f32] {
        let start = self.row_offset(unit.span.batch, unit.head, unit.span.start);
        &self.data[start..start + unit.len() * self.dim]
    }

    /// Overwrite the rows of one work unit.
    pub fn write_unit(&mut self, unit: &WorkUnit, rows: &[f32]) {
        debug_assert_eq!(rows.len(), unit.len() * self.dim);
        let start = self.row_offset(unit.span.batch, unit.head, unit.span.start);
        self.data[start..start + rows.len()].copy_from_slice(rows);
    }
}

/// Result of every forward entry point, in the caller's layout.
#[derive(Clone, Debug)]
pub struct RecurrenceOutput {
    pub o: Tensor,
    /// `[num_states, heads, key_dim, value_dim]`, present when requested.
    pub final_state: Option<Tensor>,
}

/// Validate an optional per-slot state tensor and return its flat data.
pub(crate) fn state_data(
    state: Option<&Tensor>,
    name: &'static str,
    expected: &[usize],
) -> Result<Option<Vec<f32>>> {
    match state {
        Some(s) => {
            s.expect_shape(name, expected)?;
            Ok(Some(s.data.clone()))
        }
        None => Ok(None),
    }
}
