/// Gated linear attention.
///
///   S_t = (exp(gk_t) ⊗ exp(gv_t)) ⊙ S_{t−1} + k_t ⊗ v_t
///   o_t = S_tᵀ q̂_t,     q̂ = scale · q
///
/// gk is [.., key_dim], gv is [.., value_dim]; either may be absent, which
/// is the same as an all-zero log gate. Two evaluators share one problem
/// description:
///
/// - recurrent: one step at a time, every state cached.
/// - chunked: per chunk with cumulative gates bk, bv and carried state S,
///
///     O_i = ((q̂_i ⊙ e^{bk_i}) S) ⊙ e^{bv_i}
///         + Σ_{j≤i} A_ij (v_j ⊙ e^{bv_i − bv_j}),
///     A_ij = Σ_d q̂_id k_jd e^{bk_id − bk_jd}
///     S'   = (e^{bk_last} ⊗ e^{bv_last}) ⊙ S
///         + Σ_j (k_j ⊙ e^{bk_last − bk_j}) ⊗ (v_j ⊙ e^{bv_last − bv_j})
///
///   Every exponent is a non-positive log-decay difference, so nothing
///   overflows for arbitrarily long chunks. Only chunk-start states are cached.

use rayon::prelude::*;
use tracing::{debug, trace};

use crate::config::RecurrenceConfig;
use crate::error::Result;
use crate::layout::{state_data, Layout, RecurrenceOutput, SeqBuf};
use crate::tensor::{axpy_f32, dot_f32, Tensor};
use crate::varlen::{self, chunk_ranges, SegmentBoundaries, WorkUnit};

/// Inputs in the caller's layout. State tensors are [N, H, K, V].
#[derive(Clone, Debug)]
pub struct GlaInputs {
    pub q: Tensor,
    pub k: Tensor,
    pub v: Tensor,
    pub gk: Option<Tensor>,
    pub gv: Option<Tensor>,
    pub initial_state: Option<Tensor>,
    pub cu_seqlens: Option<SegmentBoundaries>,
}

impl GlaInputs {
    pub fn new(q: Tensor, k: Tensor, v: Tensor) -> Self {
        GlaInputs { q, k, v, gk: None, gv: None, initial_state: None, cu_seqlens: None }
    }

    pub fn with_key_gate(mut self, gk: Tensor) -> Self {
        self.gk = Some(gk);
        self
    }

    pub fn with_value_gate(mut self, gv: Tensor) -> Self {
        self.gv = Some(gv);
        self
    }

    pub fn with_initial_state(mut self, h0: Tensor) -> Self {
        self.initial_state = Some(h0);
        self
    }

    pub fn with_boundaries(mut self, cu_seqlens: SegmentBoundaries) -> Self {
        self.cu_seqlens = Some(cu_seqlens);
        self
    }
}

#[derive(Clone, Debug)]
pub struct GlaGrads {
    pub dq: Tensor,
    pub dk: Tensor,
    pub dv: Tensor,
    /// Present iff the key gate was supplied.
    pub dgk: Option<Tensor>,
    /// Present iff the value gate was supplied.
    pub dgv: Option<Tensor>,
    /// Present iff an initial state was supplied.
    pub dh0: Option<Tensor>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum GlaMode {
    Recurrent,
    Chunked(usize),
}

/// Forward cache for either evaluator.
pub struct GlaCache {
    pub(crate) problem: GlaProblem,
    pub(crate) mode: GlaMode,
    /// Per unit: every state (recurrent) or chunk-start states (chunked).
    pub(crate) states: Vec<Vec<f32>>,
}

// ── Problem description ──────────────────────────────────────────────

pub(crate) struct GlaProblem {
    pub q: SeqBuf,
    pub k: SeqBuf,
    pub v: SeqBuf,
    pub gk: Option<SeqBuf>,
    pub gv: Option<SeqBuf>,
    pub h0: Option<Vec<f32>>,
    pub units: Vec<WorkUnit>,
    pub num_states: usize,
    pub scale: f32,
    pub layout: Layout,
    pub output_final_state: bool,
}

/// Head-first adjoints.
pub(crate) struct GlaCanonGrads {
    pub dq: SeqBuf,
    pub dk: SeqBuf,
    pub dv: SeqBuf,
    pub dgk: Option<SeqBuf>,
    pub dgv: Option<SeqBuf>,
    pub dh0: Vec<f32>,
}

struct UnitView<'a> {
    len: usize,
    q: &'a [f32],
    k: &'a [f32],
    v: &'a [f32],
    gk: Option<&'a [f32]>,
    gv: Option<&'a [f32]>,
    h0: Option<&'a [f32]>,
}

struct UnitGrads {
    dq: Vec<f32>,
    dk: Vec<f32>,
    dv: Vec<f32>,
    dgk: Vec<f32>,
    dgv: Vec<f32>,
    dh0: Vec<f32>,
}

impl UnitGrads {
    fn zeros(len: usize, kd: usize, vd: usize) -> Self {
        UnitGrads {
            dq: vec![0.0; len * kd],
            dk: vec![0.0; len * kd],
            dv: vec![0.0; len * vd],
            dgk: vec![0.0; len * kd],
            dgv: vec![0.0; len * vd],
            dh0: vec![0.0; kd * vd],
        }
    }
}

impl GlaProblem {
    fn prepare(inputs: &GlaInputs, cfg: &RecurrenceConfig) -> Result<Self> {
        cfg.validate_scale()?;
        let layout = cfg.layout;
        let q = SeqBuf::from_tensor(&inputs.q, layout, "q")?;
        let (batch, heads, time, kd) = (q.batch, q.heads, q.time, q.dim);
        let k = SeqBuf::from_tensor(&inputs.k, layout, "k")?;
        k.expect_dims("k", layout, batch, heads, time, kd)?;
        let v = SeqBuf::from_tensor(&inputs.v, layout, "v")?;
        let vd = v.dim;
        v.expect_dims("v", layout, batch, heads, time, vd)?;
        let gk = match inputs.gk.as_ref() {
            Some(t) => {
                let buf = SeqBuf::from_tensor(t, layout, "gk")?;
                buf.expect_dims("gk", layout, batch, heads, time, kd)?;
                Some(buf)
            }
            None => None,
        };
        let gv = match inputs.gv.as_ref() {
            Some(t) => {
                let buf = SeqBuf::from_tensor(t, layout, "gv")?;
                buf.expect_dims("gv", layout, batch, heads, time, vd)?;
                Some(buf)
            }
            None => None,
        };

        let bounds = inputs.cu_seqlens.as_ref();
        let spans = varlen::spans(batch, time, bounds)?;
        let num_states = varlen::num_state_slots(batch, bounds);
        let h0 = state_data(inputs.initial_state.as_ref(), "initial_state", &[num_states, heads, kd, vd])?;

        Ok(GlaProblem {
            q, k, v, gk, gv, h0,
            units: varlen::work_units(&spans, heads),
            num_states,
            scale: cfg.resolved_scale(kd),
            layout,
            output_final_state: cfg.output_final_state,
        })
    }

    pub fn batch(&self) -> usize {
        self.q.batch
    }

    pub fn heads(&self) -> usize {
        self.q.heads
    }

    pub fn time(&self) -> usize {
        self.q.time
    }

    pub fn key_dim(&self) -> usize {
        self.q.dim
    }

    pub fn value_dim(&self) -> usize {
        self.v.dim
    }

    pub fn state_shape(&self) -> Vec<usize> {
        vec![self.num_states, self.heads(), self.key_dim(), self.value_dim()]
    }

    fn state_size(&self) -> usize {
        self.key_dim() * self.value_dim()
    }

    fn slot<'a>(&self, data: &'a [f32], unit: &WorkUnit) -> &'a [f32] {
        let sz = self.state_size();
        let idx = unit.state_index(self.heads());
        &data[idx * sz..(idx + 1) * sz]
    }

    fn view(&self, unit: &WorkUnit) -> UnitView<'_> {
        UnitView {
            len: unit.len(),
            q: self.q.unit_rows(unit),
            k: self.k.unit_rows(unit),
            v: self.v.unit_rows(unit),
            gk: self.gk.as_ref().map(|g| g.unit_rows(unit)),
            gv: self.gv.as_ref().map(|g| g.unit_rows(unit)),
            h0: self.h0.as_ref().map(|h| self.slot(h, unit)),
        }
    }
}

// ── Recurrent kernels ────────────────────────────────────────────────

/// exp of one gate row, or ones when the gate is absent.
fn gate_row(gate: Option<&[f32]>, t: usize, dim: usize, out: &mut [f32]) {
    match gate {
        Some(g) => {
            for (o, x) in out.iter_mut().zip(&g[t * dim..(t + 1) * dim]) {
                *o = x.exp();
            }
        }
        None => out.fill(1.0),
    }
}

fn recurrent_unit(x: &UnitView<'_>, scale: f32, kd: usize, vd: usize) -> (Vec<f32>, Vec<f32>) {
    let len = x.len;
    let sz = kd * vd;
    let mut states = vec![0.0f32; (len + 1) * sz];
    if let Some(h) = x.h0 {
        states[..sz].copy_from_slice(h);
    }
    let mut o = vec![0.0f32; len * vd];
    let mut ak = vec![1.0f32; kd];
    let mut av = vec![1.0f32; vd];

    for t in 0..len {
        gate_row(x.gk, t, kd, &mut ak);
        gate_row(x.gv, t, vd, &mut av);
        let (prev, next) = states.split_at_mut((t + 1) * sz);
        let s_prev = &prev[t * sz..];
        let s = &mut next[..sz];
        let k_t = &x.k[t * kd..(t + 1) * kd];
        let v_t = &x.v[t * vd..(t + 1) * vd];
        for i in 0..kd {
            for j in 0..vd {
                s[i * vd + j] = ak[i] * av[j] * s_prev[i * vd + j] + k_t[i] * v_t[j];
            }
        }
        let o_t = &mut o[t * vd..(t + 1) * vd];
        for i in 0..kd {
            axpy_f32(scale * x.q[t * kd + i], &s[i * vd..(i + 1) * vd], o_t);
        }
    }
    (o, states)
}

fn recurrent_unit_backward(
    x: &UnitView<'_>,
    states: &[f32],
    d_o: &[f32],
    d_ht: Option<&[f32]>,
    scale: f32,
    kd: usize,
    vd: usize,
) -> UnitGrads {
    let len = x.len;
    let sz = kd * vd;
    let mut gr = UnitGrads::zeros(len, kd, vd);
    let mut ds = match d_ht {
        Some(d) => d.to_vec(),
        None => vec![0.0f32; sz],
    };
    let mut ak = vec![1.0f32; kd];
    let mut av = vec![1.0f32; vd];

    for t in (0..len).rev() {
        gate_row(x.gk, t, kd, &mut ak);
        gate_row(x.gv, t, vd, &mut av);
        let s_prev = &states[t * sz..(t + 1) * sz];
        let s_t = &states[(t + 1) * sz..(t + 2) * sz];
        let k_t = &x.k[t * kd..(t + 1) * kd];
        let v_t = &x.v[t * vd..(t + 1) * vd];
        let do_t = &d_o[t * vd..(t + 1) * vd];

        for i in 0..kd {
            gr.dq[t * kd + i] = scale * dot_f32(&s_t[i * vd..(i + 1) * vd], do_t);
            axpy_f32(scale * x.q[t * kd + i], do_t, &mut ds[i * vd..(i + 1) * vd]);
        }

        for i in 0..kd {
            let row = &ds[i * vd..(i + 1) * vd];
            gr.dk[t * kd + i] = dot_f32(row, v_t);
            axpy_f32(k_t[i], row, &mut gr.dv[t * vd..(t + 1) * vd]);
        }

        for i in 0..kd {
            for j in 0..vd {
                let idx = i * vd + j;
                let decayed = ak[i] * av[j] * s_prev[idx];
                let psi = ds[idx] * decayed;
                gr.dgk[t * kd + i] += psi;
                gr.dgv[t * vd + j] += psi;
                ds[idx] *= ak[i] * av[j];
            }
        }
    }

    gr.dh0 = ds;
    gr
}

// ── Chunked kernels ──────────────────────────────────────────────────

/// Cumulative log gate over rows `[c0, c1)`, zeros when absent.
fn cumulative_gate(gate: Option<&[f32]>, c0: usize, c1: usize, dim: usize) -> Vec<f32> {
    let n = c1 - c0;
    let mut b = vec![0.0f32; n * dim];
    if let Some(g) = gate {
        for i in 0..n {
            for d in 0..dim {
                let prev = if i > 0 { b[(i - 1) * dim + d] } else { 0.0 };
                b[i * dim + d] = prev + g[(c0 + i) * dim + d];
            }
        }
    }
    b
}

fn chunk_unit(x: &UnitView<'_>, scale: f32, chunk_size: usize, kd: usize, vd: usize) -> (Vec<f32>, Vec<f32>, Vec<f32>) {
    let len = x.len;
    let sz = kd * vd;
    let ranges = chunk_ranges(len, chunk_size);
    let mut s = match x.h0 {
        Some(h) => h.to_vec(),
        None => vec![0.0f32; sz],
    };
    let mut starts = Vec::with_capacity(ranges.len() * sz);
    let mut o = vec![0.0f32; len * vd];
    let mut qk = vec![0.0f32; kd];
    let mut r = vec![0.0f32; vd];

    for &(c0, c1) in &ranges {
        starts.extend_from_slice(&s);
        let n = c1 - c0;
        let bk = cumulative_gate(x.gk, c0, c1, kd);
        let bv = cumulative_gate(x.gv, c0, c1, vd);

        for i in 0..n {
            let t = c0 + i;
            let bk_i = &bk[i * kd..(i + 1) * kd];
            let bv_i = &bv[i * vd..(i + 1) * vd];
            for d in 0..kd {
                qk[d] = scale * x.q[t * kd + d] * bk_i[d].exp();
            }
            r.fill(0.0);
            for d in 0..kd {
                axpy_f32(qk[d], &s[d * vd..(d + 1) * vd], &mut r);
            }
            let o_i = &mut o[t * vd..(t + 1) * vd];
            for c in 0..vd {
                o_i[c] = r[c] * bv_i[c].exp();
            }
            for j in 0..=i {
                let tj = c0 + j;
                let bk_j = &bk[j * kd..(j + 1) * kd];
                let mut a = 0.0f32;
                for d in 0..kd {
                    a += scale * x.q[t * kd + d] * x.k[tj * kd + d] * (bk_i[d] - bk_j[d]).exp();
                }
                let bv_j = &bv[j * vd..(j + 1) * vd];
                for c in 0..vd {
                    o_i[c] += a * x.v[tj * vd + c] * (bv_i[c] - bv_j[c]).exp();
                }
            }
        }

        let bk_l = &bk[(n - 1) * kd..n * kd];
        let bv_l = &bv[(n - 1) * vd..n * vd];
        for d in 0..kd {
            for c in 0..vd {
                s[d * vd + c] *= (bk_l[d] + bv_l[c]).exp();
            }
        }
        for j in 0..n {
            let tj = c0 + j;
            for d in 0..kd {
                let kdj = x.k[tj * kd + d] * (bk_l[d] - bk[j * kd + d]).exp();
                for c in 0..vd {
                    s[d * vd + c] += kdj * x.v[tj * vd + c] * (bv_l[c] - bv[j * vd + c]).exp();
                }
            }
        }
    }

    (o, starts, s)
}

#[allow(clippy::too_many_arguments)]
fn chunk_unit_backward(
    x: &UnitView<'_>,
    starts: &[f32],
    d_o: &[f32],
    d_ht: Option<&[f32]>,
    scale: f32,
    chunk_size: usize,
    kd: usize,
    vd: usize,
) -> UnitGrads {
    let len = x.len;
    let sz = kd * vd;
    let ranges = chunk_ranges(len, chunk_size);
    let mut gr = UnitGrads::zeros(len, kd, vd);
    let mut ds = match d_ht {
        Some(d) => d.to_vec(),
        None => vec![0.0f32; sz],
    };

    for (ci, &(c0, c1)) in ranges.iter().enumerate().rev() {
        let s = &starts[ci * sz..(ci + 1) * sz];
        let n = c1 - c0;
        let bk = cumulative_gate(x.gk, c0, c1, kd);
        let bv = cumulative_gate(x.gv, c0, c1, vd);
        // adjoints of the cumulative gates, folded back into dg at the end
        let mut dbk = vec![0.0f32; n * kd];
        let mut dbv = vec![0.0f32; n * vd];
        let mut dqh = vec![0.0f32; n * kd];
        let bk_l = &bk[(n - 1) * kd..n * kd];
        let bv_l = &bv[(n - 1) * vd..n * vd];

        // ── S' = decay ⊙ S + Σ_j kd_j ⊗ vd_j ──
        let mut ds_prev = vec![0.0f32; sz];
        for d in 0..kd {
            for c in 0..vd {
                let idx = d * vd + c;
                let decay = (bk_l[d] + bv_l[c]).exp();
                ds_prev[idx] = ds[idx] * decay;
                let psi = ds[idx] * decay * s[idx];
                dbk[(n - 1) * kd + d] += psi;
                dbv[(n - 1) * vd + c] += psi;
            }
        }
        let mut kdj = vec![0.0f32; kd];
        let mut vdj = vec![0.0f32; vd];
        for j in 0..n {
            let tj = c0 + j;
            for d in 0..kd {
                kdj[d] = x.k[tj * kd + d] * (bk_l[d] - bk[j * kd + d]).exp();
            }
            for c in 0..vd {
                vdj[c] = x.v[tj * vd + c] * (bv_l[c] - bv[j * vd + c]).exp();
            }
            for d in 0..kd {
                let dkd = dot_f32(&ds[d * vd..(d + 1) * vd], &vdj);
                gr.dk[tj * kd + d] += dkd * (bk_l[d] - bk[j * kd + d]).exp();
                let zeta = dkd * kdj[d];
                dbk[(n - 1) * kd + d] += zeta;
                dbk[j * kd + d] -= zeta;
            }
            for c in 0..vd {
                let mut dvd = 0.0f32;
                for d in 0..kd {
                    dvd += ds[d * vd + c] * kdj[d];
                }
                gr.dv[tj * vd + c] += dvd * (bv_l[c] - bv[j * vd + c]).exp();
                let xi = dvd * vdj[c];
                dbv[(n - 1) * vd + c] += xi;
                dbv[j * vd + c] -= xi;
            }
        }

        // ── inter-chunk read-out ──
        let mut qk = vec![0.0f32; kd];
        let mut r = vec![0.0f32; vd];
        let mut dr = vec![0.0f32; vd];
        for i in 0..n {
            let t = c0 + i;
            let do_i = &d_o[t * vd..(t + 1) * vd];
            for d in 0..kd {
                qk[d] = scale * x.q[t * kd + d] * bk[i * kd + d].exp();
            }
            r.fill(0.0);
            for d in 0..kd {
                axpy_f32(qk[d], &s[d * vd..(d + 1) * vd], &mut r);
            }
            for c in 0..vd {
                let ev = bv[i * vd + c].exp();
                dr[c] = do_i[c] * ev;
                dbv[i * vd + c] += do_i[c] * r[c] * ev;
            }
            for d in 0..kd {
                let dqk = dot_f32(&dr, &s[d * vd..(d + 1) * vd]);
                dqh[i * kd + d] += bk[i * kd + d].exp() * dqk;
                dbk[i * kd + d] += dqk * qk[d];
                axpy_f32(qk[d], &dr, &mut ds_prev[d * vd..(d + 1) * vd]);
            }
        }

        // ── intra-chunk pairs ──
        for i in 0..n {
            let t = c0 + i;
            let do_i = &d_o[t * vd..(t + 1) * vd];
            for j in 0..=i {
                let tj = c0 + j;
                let mut a = 0.0f32;
                for d in 0..kd {
                    a += scale * x.q[t * kd + d] * x.k[tj * kd + d]
                        * (bk[i * kd + d] - bk[j * kd + d]).exp();
                }
                let mut da = 0.0f32;
                for c in 0..vd {
                    let gvij = (bv[i * vd + c] - bv[j * vd + c]).exp();
                    let vg = x.v[tj * vd + c] * gvij;
                    da += do_i[c] * vg;
                    gr.dv[tj * vd + c] += a * do_i[c] * gvij;
                    if i != j {
                        let tau = do_i[c] * a * vg;
                        dbv[i * vd + c] += tau;
                        dbv[j * vd + c] -= tau;
                    }
                }
                for d in 0..kd {
                    let gkij = (bk[i * kd + d] - bk[j * kd + d]).exp();
                    let qh = scale * x.q[t * kd + d];
                    dqh[i * kd + d] += da * x.k[tj * kd + d] * gkij;
                    gr.dk[tj * kd + d] += da * qh * gkij;
                    if i != j {
                        let sigma = da * qh * x.k[tj * kd + d] * gkij;
                        dbk[i * kd + d] += sigma;
                        dbk[j * kd + d] -= sigma;
                    }
                }
            }
        }

        // reverse cumulative sums
        for d in 0..kd {
            let mut acc = 0.0f32;
            for i in (0..n).rev() {
                acc += dbk[i * kd + d];
                gr.dgk[(c0 + i) * kd + d] = acc;
            }
        }
        for c in 0..vd {
            let mut acc = 0.0f32;
            for i in (0..n).rev() {
                acc += dbv[i * vd + c];
                gr.dgv[(c0 + i) * vd + c] = acc;
            }
        }
        for i in 0..n {
            for d in 0..kd {
                gr.dq[(c0 + i) * kd + d] = scale * dqh[i * kd + d];
            }
        }

        ds = ds_prev;
    }

    gr.dh0 = ds;
    gr
}

// ── Head-first evaluation (shared with gsa) ──────────────────────────

/// Returns (o, final states [N, H, K, V], per-unit cache).
pub(crate) fn forward_canonical(p: &GlaProblem, mode: GlaMode) -> (SeqBuf, Vec<f32>, Vec<Vec<f32>>) {
    let (kd, vd) = (p.key_dim(), p.value_dim());
    let sz = p.state_size();
    debug!(
        batch = p.batch(), heads = p.heads(), time = p.time(), key_dim = kd, value_dim = vd,
        units = p.units.len(), mode = ?mode, "gla forward"
    );

    let results: Vec<(Vec<f32>, Vec<f32>, Vec<f32>)> = p
        .units
        .par_iter()
        .map(|unit| {
            trace!(slot = unit.span.slot, head = unit.head, len = unit.len(), "gla unit forward");
            let x = p.view(unit);
            match mode {
                GlaMode::Recurrent => {
                    let (o, states) = recurrent_unit(&x, p.scale, kd, vd);
                    let last = states[states.len() - sz..].to_vec();
                    (o, states, last)
                }
                GlaMode::Chunked(c) => chunk_unit(&x, p.scale, c, kd, vd),
            }
        })
        .collect();

    let mut o = SeqBuf::zeros(p.batch(), p.heads(), p.time(), vd);
    let mut finals = vec![0.0f32; p.num_states * p.heads() * sz];
    let mut caches = Vec::with_capacity(results.len());
    for (unit, (rows, cache, last)) in p.units.iter().zip(results) {
        o.write_unit(unit, &rows);
        let idx = unit.state_index(p.heads());
        finals[idx * sz..(idx + 1) * sz].copy_from_slice(&last);
        caches.push(cache);
    }
    (o, finals, caches)
}

pub(crate) fn backward_canonical(
    p: &GlaProblem,
    mode: GlaMode,
    caches: &[Vec<f32>],
    d_o: &SeqBuf,
    d_ht: Option<&[f32]>,
) -> GlaCanonGrads {
    let (kd, vd) = (p.key_dim(), p.value_dim());
    debug!(units = p.units.len(), mode = ?mode, "gla backward");

    let grads: Vec<UnitGrads> = p
        .units
        .par_iter()
        .zip(caches.par_iter())
        .map(|(unit, cache)| {
            let x = p.view(unit);
            let d_o = d_o.unit_rows(unit);
            let d_ht = d_ht.map(|d| p.slot(d, unit));
            match mode {
                GlaMode::Recurrent => recurrent_unit_backward(&x, cache, d_o, d_ht, p.scale, kd, vd),
                GlaMode::Chunked(c) => chunk_unit_backward(&x, cache, d_o, d_ht, p.scale, c, kd, vd),
            }
        })
        .collect();

    let (b, h, t) = (p.batch(), p.heads(), p.time());
    let sz = p.state_size();
    let mut out = GlaCanonGrads {
        dq: SeqBuf::zeros(b, h, t, kd),
        dk: SeqBuf::zeros(b, h, t, kd),
        dv: SeqBuf::zeros(b, h, t, vd),
        dgk: p.gk.as_ref().map(|_| SeqBuf::zeros(b, h, t, kd)),
        dgv: p.gv.as_ref().map(|_| SeqBuf::zeros(b, h, t, vd)),
        dh0: vec![0.0f32; p.num_states * h * sz],
    };
    for (unit, ug) in p.units.iter().zip(grads) {
        out.dq.write_unit(unit, &ug.dq);
        out.dk.write_unit(unit, &ug.dk);
        out.dv.write_unit(unit, &ug.dv);
        if let Some(d) = out.dgk.as_mut() {
            d.write_unit(unit, &ug.dgk);
        }
        if let Some(d) = out.dgv.as_mut() {
            d.write_unit(unit, &ug.dgv);
        }
        let idx = unit.state_index(h);
        out.dh0[idx * sz..(idx + 1) * sz].copy_from_slice(&ug.dh0);
    }
    out
}

// ── Entry points ─────────────────────────────────────────────────────

fn forward(inputs: &GlaInputs, cfg: &RecurrenceConfig, mode: GlaMode) -> Result<(RecurrenceOutput, GlaCache)> {
    let problem = GlaProblem::prepare(inputs, cfg)?;
    let (o, finals, states) = forward_canonical(&problem, mode);
    let final_state = if problem.output_final_state {
        Some(Tensor { data: finals, shape: problem.state_shape() })
    } else {
        None
    };
    let out = RecurrenceOutput { o: o.to_tensor(problem.layout), final_state };
    Ok((out, GlaCache { problem, mode, states }))
}

pub fn recurrent_forward(inputs: &GlaInputs, cfg: &RecurrenceConfig) -> Result<(RecurrenceOutput, GlaCache)> {
    forward(inputs, cfg, GlaMode::Recurrent)
}

pub fn chunk_forward(inputs: &GlaInputs, cfg: &RecurrenceConfig) -> Result<(RecurrenceOutput, GlaCache)> {
    cfg.validate()?;
    forward(inputs, cfg, GlaMode::Chunked(cfg.chunk_size))
}

/// Backward for a cache from either forward; the cache records which
/// evaluator produced it.
pub fn backward(cache: &GlaCache, d_o: &Tensor, d_final_state: Option<&Tensor>) -> Result<GlaGrads> {
    let p = &cache.problem;
    let d_o = SeqBuf::from_tensor(d_o, p.layout, "d_o")?;
    d_o.expect_dims("d_o", p.layout, p.batch(), p.heads(), p.time(), p.value_dim())?;
    let d_ht = state_data(d_final_state, "d_final_state", &p.state_shape())?;

    let g = backward_canonical(p, cache.mode, &cache.states, &d_o, d_ht.as_deref());
    let layout = p.layout;
    Ok(GlaGrads {
        dq: g.dq.to_tensor(layout),
        dk: g.dk.to_tensor(layout),
        dv: g.dv.to_tensor(layout),
        dgk: g.dgk.map(|d| d.to_tensor(layout)),
        dgv: g.dgv.map(|d| d.to_tensor(layout)),
        dh0: p.h0.as_ref().map(|_| Tensor { data: g.dh0, shape: p.state_shape() }),
    })
}

pub fn recurrent_backward(cache: &GlaCache, d_o: &Tensor, d_final_state: Option<&Tensor>) -> Result<GlaGrads> {
    debug_assert_eq!(cache.mode, GlaMode::Recurrent);
    backward(cache, d_o, d_final_state)
}

pub fn chunk_backward(cache: &GlaCache, d_o: &Tensor, d_final_state: Option<&Tensor>) -> Result<GlaGrads> {
    debug_assert!(matches!(cache.mode, GlaMode::Chunked(_)));
    backward(cache, d_o, d_final_state)
}

/// Forward only: `(o, final_state)`.
pub fn recurrent_gla(inputs: &GlaInputs, cfg: &RecurrenceConfig) -> Result<(Tensor, Option<Tensor>)> {
    let (out, _) = recurrent_forward(inputs, cfg)?;
    Ok((out.o, out.final_state))
}

/// Forward only: `(o, final_state)`.
pub fn chunk_gla(inputs: &GlaInputs, cfg: &RecurrenceConfig) -> Result<(Tensor, Option<Tensor>)> {
    let (out, _) = chunk_forward(inputs, cfg)?;
    Ok((out.o, out.final_state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compare::assert_tensor_close;
    use crate::error::RecurrenceError;
    use crate::gradient::{assert_gradient, weighted_sum};
    use crate::tensor::{log_sigmoid_f32, SimpleRng};

    fn make_inputs(h: usize, t: usize, kd: usize, vd: usize, gates: (bool, bool), seed: u64) -> GlaInputs {
        let mut rng = SimpleRng::new(seed);
        let mut buf = |n: usize, scale: f32| {
            let mut v = vec![0.0f32; n];
            rng.fill_uniform(&mut v, scale);
            v
        };
        let mut inp = GlaInputs::new(
            Tensor::from_vec(buf(h * t * kd, 1.0), &[1, h, t, kd]).unwrap(),
            Tensor::from_vec(buf(h * t * kd, 1.0), &[1, h, t, kd]).unwrap(),
            Tensor::from_vec(buf(h * t * vd, 1.0), &[1, h, t, vd]).unwrap(),
        )
        .with_initial_state(Tensor::from_vec(buf(h * kd * vd, 0.5), &[1, h, kd, vd]).unwrap());
        if gates.0 {
            let gk: Vec<f32> = buf(h * t * kd, 3.0).into_iter().map(log_sigmoid_f32).collect();
            inp.gk = Some(Tensor::from_vec(gk, &[1, h, t, kd]).unwrap());
        }
        if gates.1 {
            let gv: Vec<f32> = buf(h * t * vd, 3.0).into_iter().map(log_sigmoid_f32).collect();
            inp.gv = Some(Tensor::from_vec(gv, &[1, h, t, vd]).unwrap());
        }
        inp
    }

    #[test]
    fn test_recurrent_finite_differences() {
        let (h, t, kd, vd) = (1, 5, 3, 2);
        let inputs = make_inputs(h, t, kd, vd, (true, true), 12);
        let cfg = RecurrenceConfig::default().with_final_state(true);
        let mut rng = SimpleRng::new(1);
        let mut w_o = vec![0.0f32; h * t * vd];
        rng.fill_uniform(&mut w_o, 1.0);
        let mut w_h = vec![0.0f32; h * kd * vd];
        rng.fill_uniform(&mut w_h, 1.0);

        let (_, cache) = recurrent_forward(&inputs, &cfg).unwrap();
        let grads = recurrent_backward(
            &cache,
            &Tensor::from_vec(w_o.clone(), &[1, h, t, vd]).unwrap(),
            Some(&Tensor::from_vec(w_h.clone(), &[1, h, kd, vd]).unwrap()),
        )
        .unwrap();

        let loss_of = |inp: &GlaInputs| -> f64 {
            let (o, ht) = recurrent_gla(inp, &cfg).unwrap();
            weighted_sum(&o.data, &w_o) + weighted_sum(&ht.unwrap().data, &w_h)
        };
        let base = inputs.clone();
        let (eps, tol) = (1e-2f32, 2e-2f32);
        assert_gradient("dq", &base.q.data, &grads.dq.data, |x| {
            let mut inp = base.clone();
            inp.q.data = x.to_vec();
            loss_of(&inp)
        }, 15, eps, tol);
        assert_gradient("dk", &base.k.data, &grads.dk.data, |x| {
            let mut inp = base.clone();
            inp.k.data = x.to_vec();
            loss_of(&inp)
        }, 15, eps, tol);
        assert_gradient("dv", &base.v.data, &grads.dv.data, |x| {
            let mut inp = base.clone();
            inp.v.data = x.to_vec();
            loss_of(&inp)
        }, 10, eps, tol);
        let gk = base.gk.clone().unwrap();
        assert_gradient("dgk", &gk.data, &grads.dgk.as_ref().unwrap().data, |x| {
            let mut inp = base.clone();
            inp.gk = Some(Tensor::from_vec(x.to_vec(), &gk.shape).unwrap());
            loss_of(&inp)
        }, 15, eps, tol);
        let gv = base.gv.clone().unwrap();
        assert_gradient("dgv", &gv.data, &grads.dgv.as_ref().unwrap().data, |x| {
            let mut inp = base.clone();
            inp.gv = Some(Tensor::from_vec(x.to_vec(), &gv.shape).unwrap());
            loss_of(&inp)
        }, 10, eps, tol);
    }

    #[test]
    fn test_chunk_matches_recurrent_all_gate_combinations() {
        for gates in [(false, false), (true, false), (false, true), (true, true)] {
            let inputs = make_inputs(2, 13, 4, 3, gates, 77);
            let cfg = RecurrenceConfig::default().with_chunk_size(4).with_final_state(true);
            let (ro, rc) = recurrent_forward(&inputs, &cfg).unwrap();
            let (co, cc) = chunk_forward(&inputs, &cfg).unwrap();
            assert_tensor_close("o", &ro.o, &co.o, 1e-4);
            assert_tensor_close("ht", ro.final_state.as_ref().unwrap(), co.final_state.as_ref().unwrap(), 1e-4);

            let mut rng = SimpleRng::new(5);
            let mut w = vec![0.0f32; ro.o.numel()];
            rng.fill_uniform(&mut w, 1.0);
            let d_o = Tensor::from_vec(w, &ro.o.shape).unwrap();
            let rg = backward(&rc, &d_o, None).unwrap();
            let cg = backward(&cc, &d_o, None).unwrap();
            assert_tensor_close("dq", &rg.dq, &cg.dq, 1e-4);
            assert_tensor_close("dk", &rg.dk, &cg.dk, 1e-4);
            assert_tensor_close("dv", &rg.dv, &cg.dv, 1e-4);
            assert_tensor_close("dh0", rg.dh0.as_ref().unwrap(), cg.dh0.as_ref().unwrap(), 1e-4);
            assert_eq!(rg.dgk.is_some(), gates.0);
            assert_eq!(rg.dgv.is_some(), gates.1);
            if let (Some(a), Some(b)) = (&rg.dgk, &cg.dgk) {
                assert_tensor_close("dgk", a, b, 1e-3);
            }
            if let (Some(a), Some(b)) = (&rg.dgv, &cg.dgv) {
                assert_tensor_close("dgv", a, b, 1e-3);
            }
        }
    }

    #[test]
    fn test_gate_shape_rejected() {
        let mut inputs = make_inputs(1, 4, 3, 2, (false, false), 1);
        inputs.gk = Some(Tensor::zeros(&[1, 1, 4, 2]));
        assert!(matches!(
            recurrent_forward(&inputs, &RecurrenceConfig::default()),
            Err(RecurrenceError::ShapeMismatch { name: "gk", .. })
        ));
    }

    /// With no key features the state is empty: outputs and value adjoints are zero.
    #[test]
    fn test_zero_key_dim() {
        let (h, t, kd, vd) = (2, 5, 0, 3);
        let inputs = make_inputs(h, t, kd, vd, (true, true), 8);
        let cfg = RecurrenceConfig::default().with_scale(1.0).with_final_state(true).with_chunk_size(2);
        let d_o = Tensor::from_vec(vec![1.0; h * t * vd], &[1, h, t, vd]).unwrap();
        for chunked in [false, true] {
            let (out, cache) = if chunked {
                chunk_forward(&inputs, &cfg).unwrap()
            } else {
                recurrent_forward(&inputs, &cfg).unwrap()
            };
            assert_eq!(out.o.shape, vec![1, h, t, vd]);
            assert!(out.o.data.iter().all(|&x| x == 0.0), "chunked={chunked}");
            assert_eq!(out.final_state.as_ref().unwrap().shape, vec![1, h, kd, vd]);

            let grads = backward(&cache, &d_o, None).unwrap();
            assert_eq!(grads.dq.shape, vec![1, h, t, kd]);
            assert!(grads.dv.data.iter().all(|&x| x == 0.0), "chunked={chunked}");
            assert!(grads.dgv.unwrap().data.iter().all(|&x| x == 0.0), "chunked={chunked}");
        }
    }

    #[test]
    fn test_non_finite_scale_rejected_by_recurrent_path() {
        let inputs = make_inputs(1, 3, 2, 2, (false, false), 1);
        for scale in [f32::NAN, f32::INFINITY] {
            let cfg = RecurrenceConfig::default().with_scale(scale);
            assert!(matches!(recurrent_forward(&inputs, &cfg), Err(RecurrenceError::Config(_))));
            assert!(matches!(chunk_forward(&inputs, &cfg), Err(RecurrenceError::Config(_))));
        }
    }
}
