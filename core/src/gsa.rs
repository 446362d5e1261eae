/// Gated slot attention.
///
/// A bounded memory of M slots, read and written through two GLA passes
/// that share the slot logits s and slot log-decay g:
///
///   pass 1:  ok = GLA(q, k, s; value gate g, scale)        → [.., M]
///            qv = softmax_M(ok)
///   pass 2:  o  = GLA(qv, s, v; key gate g, scale 1)        → [.., V]
///
/// The carried state is the pair (Hk [K, M], Hv [M, V]). The backward pass
/// runs pass 2's adjoint, pushes dqv through the softmax, then runs pass 1's
/// adjoint; ds and dg collect contributions from both passes.
///
/// Queries may have more heads than k, v, s and g (HQ = G·H). Query head hq
/// reads the memory of kv head hq / G. Both passes run over HQ heads with the
/// kv-side tensors and states repeated G times; adjoints of the repeated
/// tensors are summed back over each group, and only the first copy of each
/// final state is reported.

use tracing::debug;

use crate::config::RecurrenceConfig;
use crate::error::{RecurrenceError, Result};
use crate::gla::{backward_canonical, forward_canonical, GlaMode, GlaProblem};
use crate::layout::{state_data, Layout, SeqBuf};
use crate::tensor::{softmax_backward_f32, softmax_f32, Tensor};
use crate::varlen::{self, SegmentBoundaries};

/// Inputs in the caller's layout.
///
/// q: [B, HQ, T, K]; k: [B, H, T, K]; v: [B, H, T, V]; s, g: [B, H, T, M]
/// (head-first shown), with HQ a multiple of H. The initial state pair is
/// ([N, H, K, M], [N, H, M, V]).
#[derive(Clone, Debug)]
pub struct GsaInputs {
    pub q: Tensor,
    pub k: Tensor,
    pub v: Tensor,
    pub s: Tensor,
    pub g: Tensor,
    pub initial_state: Option<(Tensor, Tensor)>,
    pub cu_seqlens: Option<SegmentBoundaries>,
}

impl GsaInputs {
    pub fn new(q: Tensor, k: Tensor, v: Tensor, s: Tensor, g: Tensor) -> Self {
        GsaInputs { q, k, v, s, g, initial_state: None, cu_seqlens: None }
    }

    pub fn with_initial_state(mut self, hk0: Tensor, hv0: Tensor) -> Self {
        self.initial_state = Some((hk0, hv0));
        self
    }

    pub fn with_boundaries(mut self, cu_seqlens: SegmentBoundaries) -> Self {
        self.cu_seqlens = Some(cu_seqlens);
        self
    }
}

#[derive(Clone, Debug)]
pub struct GsaOutput {
    /// [B, HQ, T, V]
    pub o: Tensor,
    /// (Hk_T, Hv_T) per kv head, present when requested.
    pub final_state: Option<(Tensor, Tensor)>,
}

#[derive(Clone, Debug)]
pub struct GsaGrads {
    pub dq: Tensor,
    pub dk: Tensor,
    pub dv: Tensor,
    pub ds: Tensor,
    pub dg: Tensor,
    /// Present iff an initial state pair was supplied.
    pub dh0: Option<(Tensor, Tensor)>,
}

pub struct GsaCache {
    pass1: GlaProblem,
    pass1_states: Vec<Vec<f32>>,
    pass2: GlaProblem,
    pass2_states: Vec<Vec<f32>>,
    /// Slot probabilities, the queries of pass 2.
    qv: SeqBuf,
    mode: GlaMode,
    /// kv heads H; the passes run over H·group heads.
    kv_heads: usize,
    group: usize,
    has_initial_state: bool,
}

// ── Head groups ──────────────────────────────────────────────────────

/// Every `block`-float run repeated `group` times in place.
fn repeat_blocks(data: &[f32], group: usize, block: usize) -> Vec<f32> {
    if group == 1 || block == 0 {
        return data.to_vec();
    }
    let mut out = Vec::with_capacity(data.len() * group);
    for src in data.chunks(block) {
        for _ in 0..group {
            out.extend_from_slice(src);
        }
    }
    out
}

/// Adjoint of `repeat_blocks`: sum each run of `group` consecutive blocks.
fn sum_block_groups(data: &[f32], group: usize, block: usize) -> Vec<f32> {
    if group == 1 || block == 0 {
        return data.to_vec();
    }
    let n = data.len() / (block * group);
    let mut out = vec![0.0f32; n * block];
    for i in 0..n {
        let dst = &mut out[i * block..(i + 1) * block];
        for gi in 0..group {
            let src = &data[(i * group + gi) * block..(i * group + gi + 1) * block];
            for (d, s) in dst.iter_mut().zip(src) {
                *d += s;
            }
        }
    }
    out
}

/// First block of each group; the copies are identical.
fn first_of_groups(data: &[f32], group: usize, block: usize) -> Vec<f32> {
    if group == 1 || block == 0 {
        return data.to_vec();
    }
    let n = data.len() / (block * group);
    let mut out = Vec::with_capacity(n * block);
    for i in 0..n {
        let start = i * group * block;
        out.extend_from_slice(&data[start..start + block]);
    }
    out
}

/// Adjoint of `first_of_groups`: the block goes to the first copy, zeros to the rest.
fn spread_to_first(data: &[f32], group: usize, block: usize) -> Vec<f32> {
    if group == 1 || block == 0 {
        return data.to_vec();
    }
    let mut out = vec![0.0f32; data.len() * group];
    for (i, src) in data.chunks(block).enumerate() {
        let start = i * group * block;
        out[start..start + block].copy_from_slice(src);
    }
    out
}

fn repeat_heads(buf: &SeqBuf, group: usize) -> SeqBuf {
    SeqBuf {
        data: repeat_blocks(&buf.data, group, buf.time * buf.dim),
        batch: buf.batch,
        heads: buf.heads * group,
        time: buf.time,
        dim: buf.dim,
    }
}

fn sum_heads(buf: &SeqBuf, group: usize) -> SeqBuf {
    SeqBuf {
        data: sum_block_groups(&buf.data, group, buf.time * buf.dim),
        batch: buf.batch,
        heads: buf.heads / group,
        time: buf.time,
        dim: buf.dim,
    }
}

// ── Forward / backward ───────────────────────────────────────────────

fn forward(inputs: &GsaInputs, cfg: &RecurrenceConfig, mode: GlaMode) -> Result<(GsaOutput, GsaCache)> {
    cfg.validate_scale()?;
    let layout = cfg.layout;
    let q = SeqBuf::from_tensor(&inputs.q, layout, "q")?;
    let (batch, q_heads, time, kd) = (q.batch, q.heads, q.time, q.dim);
    let k = SeqBuf::from_tensor(&inputs.k, layout, "k")?;
    let heads = k.heads;
    k.expect_dims("k", layout, batch, heads, time, kd)?;
    if heads == 0 || q_heads % heads != 0 {
        return Err(RecurrenceError::HeadGroup { query_heads: q_heads, kv_heads: heads });
    }
    let group = q_heads / heads;
    let v = SeqBuf::from_tensor(&inputs.v, layout, "v")?;
    let vd = v.dim;
    v.expect_dims("v", layout, batch, heads, time, vd)?;
    let s = SeqBuf::from_tensor(&inputs.s, layout, "s")?;
    let m = s.dim;
    s.expect_dims("s", layout, batch, heads, time, m)?;
    let g = SeqBuf::from_tensor(&inputs.g, layout, "g")?;
    g.expect_dims("g", layout, batch, heads, time, m)?;

    let bounds = inputs.cu_seqlens.as_ref();
    let spans = varlen::spans(batch, time, bounds)?;
    let num_states = varlen::num_state_slots(batch, bounds);
    let units = varlen::work_units(&spans, q_heads);
    let (hk0, hv0) = match inputs.initial_state.as_ref() {
        Some((hk, hv)) => (
            state_data(Some(hk), "initial_state.0", &[num_states, heads, kd, m])?,
            state_data(Some(hv), "initial_state.1", &[num_states, heads, m, vd])?,
        ),
        None => (None, None),
    };
    debug!(
        batch, query_heads = q_heads, heads, time, key_dim = kd, value_dim = vd, slots = m,
        mode = ?mode, "gsa forward"
    );

    let (s, g) = (repeat_heads(&s, group), repeat_heads(&g, group));
    let pass1 = GlaProblem {
        q,
        k: repeat_heads(&k, group),
        v: s.clone(),
        gk: None,
        gv: Some(g.clone()),
        h0: hk0.map(|h| repeat_blocks(&h, group, kd * m)),
        units: units.clone(),
        num_states,
        scale: cfg.resolved_scale(kd),
        layout,
        output_final_state: cfg.output_final_state,
    };
    let (ok, hk_t, pass1_states) = forward_canonical(&pass1, mode);

    let mut qv = SeqBuf::zeros(batch, q_heads, time, m);
    softmax_f32(&ok.data, &mut qv.data, batch * q_heads * time, m);

    let pass2 = GlaProblem {
        q: qv.clone(),
        k: s,
        v: repeat_heads(&v, group),
        gk: Some(g),
        gv: None,
        h0: hv0.map(|h| repeat_blocks(&h, group, m * vd)),
        units,
        num_states,
        scale: 1.0,
        layout,
        output_final_state: cfg.output_final_state,
    };
    let (o, hv_t, pass2_states) = forward_canonical(&pass2, mode);

    let final_state = if cfg.output_final_state {
        Some((
            Tensor { data: first_of_groups(&hk_t, group, kd * m), shape: vec![num_states, heads, kd, m] },
            Tensor { data: first_of_groups(&hv_t, group, m * vd), shape: vec![num_states, heads, m, vd] },
        ))
    } else {
        None
    };
    let out = GsaOutput { o: o.to_tensor(layout), final_state };
    let cache = GsaCache {
        pass1,
        pass1_states,
        pass2,
        pass2_states,
        qv,
        mode,
        kv_heads: heads,
        group,
        has_initial_state: inputs.initial_state.is_some(),
    };
    Ok((out, cache))
}

pub fn recurrent_forward(inputs: &GsaInputs, cfg: &RecurrenceConfig) -> Result<(GsaOutput, GsaCache)> {
    forward(inputs, cfg, GlaMode::Recurrent)
}

pub fn chunk_forward(inputs: &GsaInputs, cfg: &RecurrenceConfig) -> Result<(GsaOutput, GsaCache)> {
    cfg.validate()?;
    forward(inputs, cfg, GlaMode::Chunked(cfg.chunk_size))
}

fn add_into(dst: &mut SeqBuf, src: Option<&SeqBuf>) {
    if let Some(src) = src {
        for (d, s) in dst.data.iter_mut().zip(src.data.iter()) {
            *d += s;
        }
    }
}

/// Backward for a cache from either forward.
pub fn backward(
    cache: &GsaCache,
    d_o: &Tensor,
    d_final_state: Option<(&Tensor, &Tensor)>,
) -> Result<GsaGrads> {
    let (p1, p2) = (&cache.pass1, &cache.pass2);
    let layout: Layout = p2.layout;
    let (batch, q_heads, time) = (p2.batch(), p2.heads(), p2.time());
    let (kd, m, vd) = (p1.key_dim(), p2.key_dim(), p2.value_dim());
    let (heads, group) = (cache.kv_heads, cache.group);

    let d_o = SeqBuf::from_tensor(d_o, layout, "d_o")?;
    d_o.expect_dims("d_o", layout, batch, q_heads, time, vd)?;
    let (dhk_t, dhv_t) = match d_final_state {
        Some((dhk, dhv)) => (
            state_data(Some(dhk), "d_final_state.0", &[p1.num_states, heads, kd, m])?,
            state_data(Some(dhv), "d_final_state.1", &[p2.num_states, heads, m, vd])?,
        ),
        None => (None, None),
    };
    let dhk_t = dhk_t.map(|d| spread_to_first(&d, group, kd * m));
    let dhv_t = dhv_t.map(|d| spread_to_first(&d, group, m * vd));
    debug!(units = p2.units.len(), group, mode = ?cache.mode, "gsa backward");

    let g2 = backward_canonical(p2, cache.mode, &cache.pass2_states, &d_o, dhv_t.as_deref());

    let mut dok = SeqBuf::zeros(batch, q_heads, time, m);
    softmax_backward_f32(&cache.qv.data, &g2.dq.data, &mut dok.data, batch * q_heads * time, m);

    let g1 = backward_canonical(p1, cache.mode, &cache.pass1_states, &dok, dhk_t.as_deref());

    let mut ds = g1.dv;
    add_into(&mut ds, Some(&g2.dk));
    let mut dg = SeqBuf::zeros(batch, q_heads, time, m);
    add_into(&mut dg, g1.dgv.as_ref());
    add_into(&mut dg, g2.dgk.as_ref());

    let dh0 = if cache.has_initial_state {
        Some((
            Tensor { data: sum_block_groups(&g1.dh0, group, kd * m), shape: vec![p1.num_states, heads, kd, m] },
            Tensor { data: sum_block_groups(&g2.dh0, group, m * vd), shape: vec![p2.num_states, heads, m, vd] },
        ))
    } else {
        None
    };

    Ok(GsaGrads {
        dq: g1.dq.to_tensor(layout),
        dk: sum_heads(&g1.dk, group).to_tensor(layout),
        dv: sum_heads(&g2.dv, group).to_tensor(layout),
        ds: sum_heads(&ds, group).to_tensor(layout),
        dg: sum_heads(&dg, group).to_tensor(layout),
        dh0,
    })
}

pub fn recurrent_backward(
    cache: &GsaCache,
    d_o: &Tensor,
    d_final_state: Option<(&Tensor, &Tensor)>,
) -> Result<GsaGrads> {
    debug_assert_eq!(cache.mode, GlaMode::Recurrent);
    backward(cache, d_o, d_final_state)
}

pub fn chunk_backward(
    cache: &GsaCache,
    d_o: &Tensor,
    d_final_state: Option<(&Tensor, &Tensor)>,
) -> Result<GsaGrads> {
    debug_assert!(matches!(cache.mode, GlaMode::Chunked(_)));
    backward(cache, d_o, d_final_state)
}

/// Forward only: `(o, final_state)`.
pub fn recurrent_gsa(inputs: &GsaInputs, cfg: &RecurrenceConfig) -> Result<(Tensor, Option<(Tensor, Tensor)>)> {
    let (out, _) = recurrent_forward(inputs, cfg)?;
    Ok((out.o, out.final_state))
}

/// Forward only: `(o, final_state)`.
pub fn chunk_gsa(inputs: &GsaInputs, cfg: &RecurrenceConfig) -> Result<(Tensor, Option<(Tensor, Tensor)>)> {
    let (out, _) = chunk_forward(inputs, cfg)?;
    Ok((out.o, out.final_state))
}
