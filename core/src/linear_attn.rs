/// Linear attention: GLA with both gates absent.
///
///   S_t = S_{t−1} + k_t ⊗ v_t,   o_t = S_tᵀ (scale · q_t)
///
/// Output normalization is not provided.

use crate::config::RecurrenceConfig;
use crate::error::Result;
use crate::gla::{self, GlaCache, GlaInputs};
use crate::layout::RecurrenceOutput;
use crate::tensor::Tensor;
use crate::varlen::SegmentBoundaries;

#[derive(Clone, Debug)]
pub struct LinearAttnInputs {
    pub q: Tensor,
    pub k: Tensor,
    pub v: Tensor,
    pub initial_state: Option<Tensor>,
    pub cu_seqlens: Option<SegmentBoundaries>,
}

impl LinearAttnInputs {
    pub fn new(q: Tensor, k: Tensor, v: Tensor) -> Self {
        LinearAttnInputs { q, k, v, initial_state: None, cu_seqlens: None }
    }

    pub fn with_initial_state(mut self, h0: Tensor) -> Self {
        self.initial_state = Some(h0);
        self
    }

    pub fn with_boundaries(mut self, cu_seqlens: SegmentBoundaries) -> Self {
        self.cu_seqlens = Some(cu_seqlens);
        self
    }

    fn to_gla(&self) -> GlaInputs {
        GlaInputs {
            q: self.q.clone(),
            k: self.k.clone(),
            v: self.v.clone(),
            gk: None,
            gv: None,
            initial_state: self.initial_state.clone(),
            cu_seqlens: self.cu_seqlens.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct LinearAttnGrads {
    pub dq: Tensor,
    pub dk: Tensor,
    pub dv: Tensor,
    pub dh0: Option<Tensor>,
}

/// Forward cache. Wraps the GLA cache of the ungated problem.
pub struct LinearAttnCache(GlaCache);

pub fn recurrent_forward(
    inputs: &LinearAttnInputs,
    cfg: &RecurrenceConfig,
) -> Result<(RecurrenceOutput, LinearAttnCache)> {
    let (out, cache) = gla::recurrent_forward(&inputs.to_gla(), cfg)?;
    Ok((out, LinearAttnCache(cache)))
}

pub fn chunk_forward(
    inputs: &LinearAttnInputs,
    cfg: &RecurrenceConfig,
) -> Result<(RecurrenceOutput, LinearAttnCache)> {
    let (out, cache) = gla::chunk_forward(&inputs.to_gla(), cfg)?;
    Ok((out, LinearAttnCache(cache)))
}

fn backward(cache: &LinearAttnCache, d_o: &Tensor, d_final_state: Option<&Tensor>) -> Result<LinearAttnGrads> {
    let g = gla::backward(&cache.0, d_o, d_final_state)?;
    Ok(LinearAttnGrads { dq: g.dq, dk: g.dk, dv: g.dv, dh0: g.dh0 })
}

pub fn recurrent_backward(
    cache: &LinearAttnCache,
    d_o: &Tensor,
    d_final_state: Option<&Tensor>,
) -> Result<LinearAttnGrads> {
    backward(cache, d_o, d_final_state)
}

pub fn chunk_backward(
    cache: &LinearAttnCache,
    d_o: &Tensor,
    d_final_state: Option<&Tensor>,
) -> Result<LinearAttnGrads> {
    backward(cache, d_o, d_final_state)
}

/// Forward only: `(o, final_state)`.
pub fn recurrent_linear_attn(
    inputs: &LinearAttnInputs,
    cfg: &RecurrenceConfig,
) -> Result<(Tensor, Option<Tensor>)> {
    let (out, _) = recurrent_forward(inputs, cfg)?;
    Ok((out.o, out.final_state))
}

/// Forward only: `(o, final_state)`.
pub fn chunk_linear_attn(
    inputs: &LinearAttnInputs,
    cfg: &RecurrenceConfig,
) -> Result<(Tensor, Option<Tensor>)> {
    let (out, _) = chunk_forward(inputs, cfg)?;
    Ok((out.o, out.final_state))
}
