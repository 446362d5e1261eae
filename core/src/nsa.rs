/// Native sparse attention over selected key blocks.
///
/// For query token i (position within its sequence or segment) and query
/// head hq, with kv head h = hq / G (G = HQ / H), the candidate keys are
/// `idx·BS + j` for every selected block id idx of (i, h) and j < BS. A
/// candidate is used iff it is ≤ i, so out-of-range ids (e.g. a sentinel
/// past the end) are masked without being dereferenced. The output is the
/// softmax(scale · q kᵀ)-weighted sum of the used values, or zero when no
/// candidate survives.
///
/// Two evaluators:
/// - naive: gather every candidate, two-pass softmax; the backward pass
///   recomputes the probabilities the same way.
/// - parallel: one block at a time with a running max and running sum
///   (online softmax); saves the log-sum-exp per (token, query head) and the
///   backward pass rebuilds p = exp(s − lse) from it.
///
/// Work units are (sequence or segment, kv head). A unit owns all queries of
/// its head group and all key/value rows of its span, so dk and dv
/// accumulate without crossing units.

use rayon::prelude::*;
use tracing::{debug, trace};

use crate::config::SparseAttentionConfig;
use crate::error::{RecurrenceError, Result};
use crate::layout::{Layout, SeqBuf};
use crate::tensor::{axpy_f32, dot_f32, Tensor};
use crate::varlen::{self, SegmentBoundaries, WorkUnit};

/// Selected block ids, [B, H, T, S] or [B, T, H, S] following the config layout.
#[derive(Clone, Debug, PartialEq)]
pub struct BlockIndices {
    pub data: Vec<usize>,
    pub shape: Vec<usize>,
}

impl BlockIndices {
    pub fn new(data: Vec<usize>, shape: &[usize]) -> Result<Self> {
        if shape.len() != 4 {
            return Err(RecurrenceError::Rank { name: "block_indices", expected: 4, actual: shape.to_vec() });
        }
        if data.len() != shape.iter().product::<usize>() {
            return Err(RecurrenceError::DataLength { len: data.len(), shape: shape.to_vec() });
        }
        Ok(BlockIndices { data, shape: shape.to_vec() })
    }
}

#[derive(Clone, Debug)]
pub struct NsaInputs {
    /// [B, HQ, T, K]
    pub q: Tensor,
    /// [B, H, T, K]
    pub k: Tensor,
    /// [B, H, T, V]
    pub v: Tensor,
    pub block_indices: BlockIndices,
    pub cu_seqlens: Option<SegmentBoundaries>,
}

impl NsaInputs {
    pub fn new(q: Tensor, k: Tensor, v: Tensor, block_indices: BlockIndices) -> Self {
        NsaInputs { q, k, v, block_indices, cu_seqlens: None }
    }

    pub fn with_boundaries(mut self, cu_seqlens: SegmentBoundaries) -> Self {
        self.cu_seqlens = Some(cu_seqlens);
        self
    }
}

#[derive(Clone, Debug)]
pub struct NsaGrads {
    pub dq: Tensor,
    pub dk: Tensor,
    pub dv: Tensor,
}

pub struct NsaCache {
    problem: NsaProblem,
    o: SeqBuf,
    /// Per unit, [G, len] log-sum-exp. Only filled by the parallel path.
    lse: Option<Vec<Vec<f32>>>,
}

struct NsaProblem {
    q: SeqBuf,
    k: SeqBuf,
    v: SeqBuf,
    /// Head-first [B, H, T, S].
    indices: Vec<usize>,
    selected: usize,
    /// Work units over kv heads.
    units: Vec<WorkUnit>,
    group: usize,
    block_size: usize,
    scale: f32,
    layout: Layout,
}

impl NsaProblem {
    fn prepare(inputs: &NsaInputs, cfg: &SparseAttentionConfig) -> Result<Self> {
        cfg.validate()?;
        let layout = cfg.layout;
        let q = SeqBuf::from_tensor(&inputs.q, layout, "q")?;
        let (batch, q_heads, time, kd) = (q.batch, q.heads, q.time, q.dim);
        let k = SeqBuf::from_tensor(&inputs.k, layout, "k")?;
        let heads = k.heads;
        k.expect_dims("k", layout, batch, heads, time, kd)?;
        if heads == 0 || q_heads % heads != 0 {
            return Err(RecurrenceError::HeadGroup { query_heads: q_heads, kv_heads: heads });
        }
        let v = SeqBuf::from_tensor(&inputs.v, layout, "v")?;
        let vd = v.dim;
        v.expect_dims("v", layout, batch, heads, time, vd)?;

        let bi = BlockIndices::new(inputs.block_indices.data.clone(), &inputs.block_indices.shape)?;
        let shape = [bi.shape[0], bi.shape[1], bi.shape[2], bi.shape[3]];
        let (ib, ih, it, selected) = layout.split4(shape);
        if (ib, ih, it) != (batch, heads, time) {
            return Err(RecurrenceError::ShapeMismatch {
                name: "block_indices",
                expected: layout.shape4(batch, heads, time, selected),
                actual: bi.shape.clone(),
            });
        }
        let indices = match layout {
            Layout::HeadFirst => bi.data.clone(),
            Layout::TimeFirst => {
                let mut out = vec![0usize; bi.data.len()];
                for b in 0..batch {
                    for t in 0..time {
                        for h in 0..heads {
                            let src = ((b * time + t) * heads + h) * selected;
                            let dst = ((b * heads + h) * time + t) * selected;
                            out[dst..dst + selected].copy_from_slice(&bi.data[src..src + selected]);
                        }
                    }
                }
                out
            }
        };

        let spans = varlen::spans(batch, time, inputs.cu_seqlens.as_ref())?;
        Ok(NsaProblem {
            q, k, v, indices, selected,
            units: varlen::work_units(&spans, heads),
            group: q_heads / heads,
            block_size: cfg.block_size,
            scale: cfg.resolved_scale(kd),
            layout,
        })
    }

    fn key_dim(&self) -> usize {
        self.q.dim
    }

    fn value_dim(&self) -> usize {
        self.v.dim
    }

    /// The unit of query head `gi` within the group of `unit`.
    fn query_unit(&self, unit: &WorkUnit, gi: usize) -> WorkUnit {
        WorkUnit { span: unit.span, head: unit.head * self.group + gi }
    }

    /// Selected ids of token `p` (position within the unit).
    fn block_ids(&self, unit: &WorkUnit, p: usize) -> &[usize] {
        let base = ((unit.span.batch * self.k.heads + unit.head) * self.k.time + unit.span.start + p) * self.selected;
        &self.indices[base..base + self.selected]
    }

    /// Candidate key positions of one block that are visible from position `p`.
    fn block_positions(&self, id: usize, p: usize) -> std::ops::Range<usize> {
        let bs = self.block_size;
        match id.checked_mul(bs) {
            Some(first) if first <= p => first..(first.saturating_add(bs)).min(p + 1),
            _ => 0..0,
        }
    }
}

// ── Per-unit kernels ─────────────────────────────────────────────────

struct UnitOut {
    /// [G, len, V]
    o: Vec<f32>,
    /// [G, len]
    lse: Vec<f32>,
}

struct UnitGrads {
    /// [G, len, K]
    dq: Vec<f32>,
    /// [len, K]
    dk: Vec<f32>,
    /// [len, V]
    dv: Vec<f32>,
}

fn naive_unit(p: &NsaProblem, unit: &WorkUnit) -> UnitOut {
    let (kd, vd, len) = (p.key_dim(), p.value_dim(), unit.len());
    let k = p.k.unit_rows(unit);
    let v = p.v.unit_rows(unit);
    let mut o = vec![0.0f32; p.group * len * vd];
    let mut positions = Vec::new();
    let mut scores = Vec::new();

    for gi in 0..p.group {
        let q = p.q.unit_rows(&p.query_unit(unit, gi));
        for i in 0..len {
            positions.clear();
            for &id in p.block_ids(unit, i) {
                positions.extend(p.block_positions(id, i));
            }
            if positions.is_empty() {
                continue;
            }
            let q_i = &q[i * kd..(i + 1) * kd];
            scores.clear();
            scores.extend(positions.iter().map(|&j| p.scale * dot_f32(q_i, &k[j * kd..(j + 1) * kd])));
            let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let mut sum = 0.0f32;
            for s in scores.iter_mut() {
                *s = (*s - max).exp();
                sum += *s;
            }
            let o_i = &mut o[(gi * len + i) * vd..(gi * len + i + 1) * vd];
            for (&j, &w) in positions.iter().zip(scores.iter()) {
                axpy_f32(w / sum, &v[j * vd..(j + 1) * vd], o_i);
            }
        }
    }
    UnitOut { o, lse: Vec::new() }
}

fn parallel_unit(p: &NsaProblem, unit: &WorkUnit) -> UnitOut {
    let (kd, vd, len) = (p.key_dim(), p.value_dim(), unit.len());
    let k = p.k.unit_rows(unit);
    let v = p.v.unit_rows(unit);
    let mut o = vec![0.0f32; p.group * len * vd];
    let mut lse = vec![f32::NEG_INFINITY; p.group * len];
    let mut acc = vec![0.0f32; vd];
    let mut block_scores = Vec::with_capacity(p.block_size);

    for gi in 0..p.group {
        let q = p.q.unit_rows(&p.query_unit(unit, gi));
        for i in 0..len {
            let q_i = &q[i * kd..(i + 1) * kd];
            let mut m = f32::NEG_INFINITY;
            let mut l = 0.0f32;
            acc.fill(0.0);
            for &id in p.block_ids(unit, i) {
                let range = p.block_positions(id, i);
                if range.is_empty() {
                    continue;
                }
                block_scores.clear();
                block_scores.extend(range.clone().map(|j| p.scale * dot_f32(q_i, &k[j * kd..(j + 1) * kd])));
                let block_max = block_scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let m_new = m.max(block_max);
                let correction = (m - m_new).exp();
                l *= correction;
                for a in acc.iter_mut() {
                    *a *= correction;
                }
                for (j, &s) in range.zip(block_scores.iter()) {
                    let w = (s - m_new).exp();
                    l += w;
                    axpy_f32(w, &v[j * vd..(j + 1) * vd], &mut acc);
                }
                m = m_new;
            }
            if l > 0.0 {
                let o_i = &mut o[(gi * len + i) * vd..(gi * len + i + 1) * vd];
                for c in 0..vd {
                    o_i[c] = acc[c] / l;
                }
                lse[gi * len + i] = m + l.ln();
            }
        }
    }
    UnitOut { o, lse }
}

/// Shared backward. `probs` fills the candidate positions and their
/// probabilities for (group head, token).
fn backward_unit(
    p: &NsaProblem,
    unit: &WorkUnit,
    o: &SeqBuf,
    d_o: &SeqBuf,
    probs: impl Fn(usize, usize, &[f32], &mut Vec<usize>, &mut Vec<f32>),
) -> UnitGrads {
    let (kd, vd, len) = (p.key_dim(), p.value_dim(), unit.len());
    let k = p.k.unit_rows(unit);
    let v = p.v.unit_rows(unit);
    let mut gr = UnitGrads {
        dq: vec![0.0f32; p.group * len * kd],
        dk: vec![0.0f32; len * kd],
        dv: vec![0.0f32; len * vd],
    };
    let mut positions = Vec::new();
    let mut weights = Vec::new();

    for gi in 0..p.group {
        let qu = p.query_unit(unit, gi);
        let q = p.q.unit_rows(&qu);
        let o_rows = o.unit_rows(&qu);
        let do_rows = d_o.unit_rows(&qu);
        for i in 0..len {
            let q_i = &q[i * kd..(i + 1) * kd];
            probs(gi, i, q_i, &mut positions, &mut weights);
            if positions.is_empty() {
                continue;
            }
            let do_i = &do_rows[i * vd..(i + 1) * vd];
            let delta = dot_f32(do_i, &o_rows[i * vd..(i + 1) * vd]);
            let dq_i = &mut gr.dq[(gi * len + i) * kd..(gi * len + i + 1) * kd];
            for (&j, &pj) in positions.iter().zip(weights.iter()) {
                let v_j = &v[j * vd..(j + 1) * vd];
                axpy_f32(pj, do_i, &mut gr.dv[j * vd..(j + 1) * vd]);
                let ds = pj * (dot_f32(do_i, v_j) - delta);
                axpy_f32(p.scale * ds, &k[j * kd..(j + 1) * kd], dq_i);
                axpy_f32(p.scale * ds, q_i, &mut gr.dk[j * kd..(j + 1) * kd]);
            }
        }
    }
    gr
}

// ── Entry points ─────────────────────────────────────────────────────

fn forward(inputs: &NsaInputs, cfg: &SparseAttentionConfig, online: bool) -> Result<(Tensor, NsaCache)> {
    let problem = NsaProblem::prepare(inputs, cfg)?;
    debug!(
        batch = problem.q.batch, query_heads = problem.q.heads, kv_heads = problem.k.heads,
        time = problem.q.time, selected = problem.selected, block_size = problem.block_size,
        online, "nsa forward"
    );

    let results: Vec<UnitOut> = problem
        .units
        .par_iter()
        .map(|unit| {
            trace!(slot = unit.span.slot, head = unit.head, len = unit.len(), "nsa unit forward");
            if online {
                parallel_unit(&problem, unit)
            } else {
                naive_unit(&problem, unit)
            }
        })
        .collect();

    let q = &problem.q;
    let mut o = SeqBuf::zeros(q.batch, q.heads, q.time, problem.value_dim());
    let vd = problem.value_dim();
    let mut lse = Vec::with_capacity(results.len());
    for (unit, r) in problem.units.iter().zip(results) {
        let len = unit.len();
        for gi in 0..problem.group {
            o.write_unit(&problem.query_unit(unit, gi), &r.o[gi * len * vd..(gi + 1) * len * vd]);
        }
        lse.push(r.lse);
    }
    let out = o.to_tensor(problem.layout);
    let lse = if online { Some(lse) } else { None };
    Ok((out, NsaCache { problem, o, lse }))
}

fn backward(cache: &NsaCache, d_o: &Tensor) -> Result<NsaGrads> {
    let p = &cache.problem;
    let d_o = SeqBuf::from_tensor(d_o, p.layout, "d_o")?;
    d_o.expect_dims("d_o", p.layout, p.q.batch, p.q.heads, p.q.time, p.value_dim())?;
    let kd = p.key_dim();
    debug!(units = p.units.len(), online = cache.lse.is_some(), "nsa backward");

    let grads: Vec<UnitGrads> = p
        .units
        .par_iter()
        .enumerate()
        .map(|(ui, unit)| {
            let k = p.k.unit_rows(unit);
            match cache.lse.as_ref() {
                Some(lse) => {
                    let lse = &lse[ui];
                    let len = unit.len();
                    backward_unit(p, unit, &cache.o, &d_o, |gi, i, q_i, pos, w| {
                        pos.clear();
                        w.clear();
                        let l = lse[gi * len + i];
                        if l == f32::NEG_INFINITY {
                            return;
                        }
                        for &id in p.block_ids(unit, i) {
                            for j in p.block_positions(id, i) {
                                pos.push(j);
                                w.push((p.scale * dot_f32(q_i, &k[j * kd..(j + 1) * kd]) - l).exp());
                            }
                        }
                    })
                }
                None => backward_unit(p, unit, &cache.o, &d_o, |_, i, q_i, pos, w| {
                    pos.clear();
                    w.clear();
                    for &id in p.block_ids(unit, i) {
                        pos.extend(p.block_positions(id, i));
                    }
                    if pos.is_empty() {
                        return;
                    }
                    w.extend(pos.iter().map(|&j| p.scale * dot_f32(q_i, &k[j * kd..(j + 1) * kd])));
                    let max = w.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                    let mut sum = 0.0f32;
                    for s in w.iter_mut() {
                        *s = (*s - max).exp();
                        sum += *s;
                    }
                    for s in w.iter_mut() {
                        *s /= sum;
                    }
                }),
            }
        })
        .collect();

    let (q, k) = (&p.q, &p.k);
    let mut dq = SeqBuf::zeros(q.batch, q.heads, q.time, kd);
    let mut dk = SeqBuf::zeros(k.batch, k.heads, k.time, kd);
    let mut dv = SeqBuf::zeros(k.batch, k.heads, k.time, p.value_dim());
    for (unit, g) in p.units.iter().zip(grads) {
        let len = unit.len();
        for gi in 0..p.group {
            dq.write_unit(&p.query_unit(unit, gi), &g.dq[gi * len * kd..(gi + 1) * len * kd]);
        }
        dk.write_unit(unit, &g.dk);
        dv.write_unit(unit, &g.dv);
    }
    Ok(NsaGrads {
        dq: dq.to_tensor(p.layout),
        dk: dk.to_tensor(p.layout),
        dv: dv.to_tensor(p.layout),
    })
}

/// Gather + two-pass softmax per token.
pub fn naive_forward(inputs: &NsaInputs, cfg: &SparseAttentionConfig) -> Result<(Tensor, NsaCache)> {
    forward(inputs, cfg, false)
}

/// Blockwise online softmax; caches log-sum-exp.
pub fn parallel_forward(inputs: &NsaInputs, cfg: &SparseAttentionConfig) -> Result<(Tensor, NsaCache)> {
    forward(inputs, cfg, true)
}

pub fn naive_backward(cache: &NsaCache, d_o: &Tensor) -> Result<NsaGrads> {
    debug_assert!(cache.lse.is_none());
    backward(cache, d_o)
}

pub fn parallel_backward(cache: &NsaCache, d_o: &Tensor) -> Result<NsaGrads> {
    debug_assert!(cache.lse.is_some());
    backward(cache, d_o)
}

pub fn naive_nsa(inputs: &NsaInputs, cfg: &SparseAttentionConfig) -> Result<Tensor> {
    naive_forward(inputs, cfg).map(|(o, _)| o)
}

pub fn parallel_nsa(inputs: &NsaInputs, cfg: &SparseAttentionConfig) -> Result<Tensor> {
    parallel_forward(inputs, cfg).map(|(o, _)| o)
}
