/// Gated delta rule: sequential reference recurrence.
///
/// Per step, with q̂ = scale · q:
///   S ← exp(g_t) · S
///   u_t = β_t (v_t − Sᵀ k_t)
///   S ← S + k_t ⊗ u_t
///   o_t = Sᵀ q̂_t
///
/// S is [key_dim, value_dim], row-major. Every intermediate state is cached
/// so the backward pass can walk the steps in reverse with an accumulated
/// state adjoint dS:
///
///   dS    += q̂_t ⊗ do_t
///   du     = dSᵀ k_t,   dk_t += dS u_t
///   dβ_t   = du · r_t,  dv_t = β_t du,   dpred = −β_t du
///   dS_a   = dS + k_t ⊗ dpred,           dk_t += S_a dpred
///   dg_t   = ⟨dS_a, S_a⟩,                dS = exp(g_t) dS_a
///
/// where S_a is the decayed state and r_t = v_t − S_aᵀ k_t.

use rayon::prelude::*;
use tracing::{debug, trace};

use crate::config::RecurrenceConfig;
use crate::error::Result;
use crate::layout::{state_data, Layout, RecurrenceOutput, SeqBuf};
use crate::tensor::{axpy_f32, dot_f32, Tensor};
use crate::varlen::{self, SegmentBoundaries, WorkUnit};

// ── Public types ─────────────────────────────────────────────────────

/// Inputs in the caller's layout.
///
/// q, k: [B, H, T, K]; v: [B, H, T, V]; beta, g: [B, H, T] (head-first shown).
/// `initial_state` is [N, H, K, V] with N = batch, or N = number of segments
/// when `cu_seqlens` is given.
#[derive(Clone, Debug)]
pub struct GatedDeltaInputs {
    pub q: Tensor,
    pub k: Tensor,
    pub v: Tensor,
    pub beta: Tensor,
    pub g: Tensor,
    pub initial_state: Option<Tensor>,
    pub cu_seqlens: Option<SegmentBoundaries>,
}

impl GatedDeltaInputs {
    pub fn new(q: Tensor, k: Tensor, v: Tensor, beta: Tensor, g: Tensor) -> Self {
        GatedDeltaInputs { q, k, v, beta, g, initial_state: None, cu_seqlens: None }
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

/// Adjoints of every input, in the caller's layout.
#[derive(Clone, Debug)]
pub struct GatedDeltaGrads {
    pub dq: Tensor,
    pub dk: Tensor,
    pub dv: Tensor,
    pub dbeta: Tensor,
    pub dg: Tensor,
    /// Present iff an initial state was supplied.
    pub dh0: Option<Tensor>,
}

/// Cache for the reference backward pass.
pub struct GatedDeltaRecurrentCache {
    problem: DeltaProblem,
    /// Per unit: (len + 1) states of [K, V], state 0 is the initial state.
    states: Vec<Vec<f32>>,
}

// ── Normalized problem shared with the chunked path ─────────────────

/// Inputs converted to head-first buffers plus the work-unit decomposition.
pub(crate) struct DeltaProblem {
    pub q: SeqBuf,
    pub k: SeqBuf,
    pub v: SeqBuf,
    pub beta: SeqBuf,
    pub g: SeqBuf,
    pub h0: Option<Vec<f32>>,
    pub units: Vec<WorkUnit>,
    pub batch: usize,
    pub heads: usize,
    pub time: usize,
    pub key_dim: usize,
    pub value_dim: usize,
    pub num_states: usize,
    pub scale: f32,
    pub layout: Layout,
    pub output_final_state: bool,
}

/// Borrowed rows of one work unit.
pub(crate) struct UnitView<'a> {
    pub q: &'a [f32],
    pub k: &'a [f32],
    pub v: &'a [f32],
    pub beta: &'a [f32],
    pub g: &'a [f32],
    pub h0: Option<&'a [f32]>,
}

/// Adjoints of one work unit, head-first rows.
pub(crate) struct UnitGrads {
    pub dq: Vec<f32>,
    pub dk: Vec<f32>,
    pub dv: Vec<f32>,
    pub dbeta: Vec<f32>,
    pub dg: Vec<f32>,
    pub dh0: Vec<f32>,
}

impl UnitGrads {
    pub fn zeros(len: usize, kd: usize, vd: usize) -> Self {
        UnitGrads {
            dq: vec![0.0; len * kd],
            dk: vec![0.0; len * kd],
            dv: vec![0.0; len * vd],
            dbeta: vec![0.0; len],
            dg: vec![0.0; len],
            dh0: vec![0.0; kd * vd],
        }
    }
}

impl DeltaProblem {
    pub fn prepare(inputs: &GatedDeltaInputs, cfg: &RecurrenceConfig) -> Result<Self> {
        cfg.validate_scale()?;
        let layout = cfg.layout;
        let q = SeqBuf::from_tensor(&inputs.q, layout, "q")?;
        let (batch, heads, time, key_dim) = (q.batch, q.heads, q.time, q.dim);

        let k = SeqBuf::from_tensor(&inputs.k, layout, "k")?;
        k.expect_dims("k", layout, batch, heads, time, key_dim)?;
        let v = SeqBuf::from_tensor(&inputs.v, layout, "v")?;
        let value_dim = v.dim;
        v.expect_dims("v", layout, batch, heads, time, value_dim)?;
        let beta = SeqBuf::gate_from_tensor(&inputs.beta, layout, "beta")?;
        beta.expect_dims("beta", layout, batch, heads, time, 1)?;
        let g = SeqBuf::gate_from_tensor(&inputs.g, layout, "g")?;
        g.expect_dims("g", layout, batch, heads, time, 1)?;

        let bounds = inputs.cu_seqlens.as_ref();
        let spans = varlen::spans(batch, time, bounds)?;
        let num_states = varlen::num_state_slots(batch, bounds);
        let h0 = state_data(
            inputs.initial_state.as_ref(),
            "initial_state",
            &[num_states, heads, key_dim, value_dim],
        )?;

        Ok(DeltaProblem {
            q, k, v, beta, g, h0,
            units: varlen::work_units(&spans, heads),
            batch, heads, time, key_dim, value_dim, num_states,
            scale: cfg.resolved_scale(key_dim),
            layout,
            output_final_state: cfg.output_final_state,
        })
    }

    pub fn state_size(&self) -> usize {
        self.key_dim * self.value_dim
    }

    pub fn view(&self, unit: &WorkUnit) -> UnitView<'_> {
        let sz = self.state_size();
        let idx = unit.state_index(self.heads);
        UnitView {
            q: self.q.unit_rows(unit),
            k: self.k.unit_rows(unit),
            v: self.v.unit_rows(unit),
            beta: self.beta.unit_rows(unit),
            g: self.g.unit_rows(unit),
            h0: self.h0.as_ref().map(|h| &h[idx * sz..(idx + 1) * sz]),
        }
    }

    /// Validate upstream adjoints and normalize them to head-first.
    pub fn upstream(&self, d_o: &Tensor, d_final_state: Option<&Tensor>) -> Result<(SeqBuf, Option<Vec<f32>>)> {
        let d_o = SeqBuf::from_tensor(d_o, self.layout, "d_o")?;
        d_o.expect_dims("d_o", self.layout, self.batch, self.heads, self.time, self.value_dim)?;
        let d_ht = state_data(
            d_final_state,
            "d_final_state",
            &[self.num_states, self.heads, self.key_dim, self.value_dim],
        )?;
        Ok((d_o, d_ht))
    }

    pub fn unit_state<'a>(&self, states: &'a Option<Vec<f32>>, unit: &WorkUnit) -> Option<&'a [f32]> {
        let sz = self.state_size();
        let idx = unit.state_index(self.heads);
        states.as_ref().map(|s| &s[idx * sz..(idx + 1) * sz])
    }

    /// Scatter per-unit outputs and final states.
    pub fn assemble_output(&self, outputs: &[Vec<f32>], finals: &[&[f32]]) -> RecurrenceOutput {
        let mut o = SeqBuf::zeros(self.batch, self.heads, self.time, self.value_dim);
        for (unit, rows) in self.units.iter().zip(outputs) {
            o.write_unit(unit, rows);
        }
        let final_state = if self.output_final_state {
            let sz = self.state_size();
            let mut ht = vec![0.0f32; self.num_states * self.heads * sz];
            for (unit, st) in self.units.iter().zip(finals) {
                let idx = unit.state_index(self.heads);
                ht[idx * sz..(idx + 1) * sz].copy_from_slice(st);
            }
            Some(Tensor {
                data: ht,
                shape: vec![self.num_states, self.heads, self.key_dim, self.value_dim],
            })
        } else {
            None
        };
        RecurrenceOutput { o: o.to_tensor(self.layout), final_state }
    }

    /// Scatter per-unit adjoints back to the caller's layout.
    pub fn assemble_grads(&self, grads: &[UnitGrads]) -> GatedDeltaGrads {
        let (b, h, t) = (self.batch, self.heads, self.time);
        let mut dq = SeqBuf::zeros(b, h, t, self.key_dim);
        let mut dk = SeqBuf::zeros(b, h, t, self.key_dim);
        let mut dv = SeqBuf::zeros(b, h, t, self.value_dim);
        let mut dbeta = SeqBuf::zeros(b, h, t, 1);
        let mut dg = SeqBuf::zeros(b, h, t, 1);
        let sz = self.state_size();
        let mut dh0 = self.h0.as_ref().map(|_| vec![0.0f32; self.num_states * h * sz]);

        for (unit, ug) in self.units.iter().zip(grads) {
            dq.write_unit(unit, &ug.dq);
            dk.write_unit(unit, &ug.dk);
            dv.write_unit(unit, &ug.dv);
            dbeta.write_unit(unit, &ug.dbeta);
            dg.write_unit(unit, &ug.dg);
            if let Some(d) = dh0.as_mut() {
                let idx = unit.state_index(h);
                d[idx * sz..(idx + 1) * sz].copy_from_slice(&ug.dh0);
            }
        }

        GatedDeltaGrads {
            dq: dq.to_tensor(self.layout),
            dk: dk.to_tensor(self.layout),
            dv: dv.to_tensor(self.layout),
            dbeta: dbeta.to_gate_tensor(self.layout),
            dg: dg.to_gate_tensor(self.layout),
            dh0: dh0.map(|data| Tensor {
                data,
                shape: vec![self.num_states, h, self.key_dim, self.value_dim],
            }),
        }
    }
}

// ── Per-unit kernels ─────────────────────────────────────────────────

/// Run one unit forward. Returns (outputs [L, V], states [(L+1), K, V]).
fn forward_unit(x: &UnitView<'_>, scale: f32, kd: usize, vd: usize) -> (Vec<f32>, Vec<f32>) {
    let len = x.beta.len();
    let sz = kd * vd;
    let mut states = vec![0.0f32; (len + 1) * sz];
    if let Some(h) = x.h0 {
        states[..sz].copy_from_slice(h);
    }
    let mut o = vec![0.0f32; len * vd];
    let mut u = vec![0.0f32; vd];

    for t in 0..len {
        let (prev, next) = states.split_at_mut((t + 1) * sz);
        let s_prev = &prev[t * sz..];
        let s = &mut next[..sz];
        let a = x.g[t].exp();
        for (dst, src) in s.iter_mut().zip(s_prev.iter()) {
            *dst = a * src;
        }

        let k_t = &x.k[t * kd..(t + 1) * kd];
        let v_t = &x.v[t * vd..(t + 1) * vd];
        let q_t = &x.q[t * kd..(t + 1) * kd];

        // u = β (v − Sᵀ k)
        u.copy_from_slice(v_t);
        for i in 0..kd {
            axpy_f32(-k_t[i], &s[i * vd..(i + 1) * vd], &mut u);
        }
        for uj in u.iter_mut() {
            *uj *= x.beta[t];
        }

        for i in 0..kd {
            axpy_f32(k_t[i], &u, &mut s[i * vd..(i + 1) * vd]);
        }

        let o_t = &mut o[t * vd..(t + 1) * vd];
        for i in 0..kd {
            axpy_f32(scale * q_t[i], &s[i * vd..(i + 1) * vd], o_t);
        }
    }

    (o, states)
}

/// Reverse step loop for one unit.
fn backward_unit(
    x: &UnitView<'_>,
    states: &[f32],
    d_o: &[f32],
    d_ht: Option<&[f32]>,
    scale: f32,
    kd: usize,
    vd: usize,
) -> UnitGrads {
    let len = x.beta.len();
    let sz = kd * vd;
    let mut gr = UnitGrads::zeros(len, kd, vd);
    let mut ds = match d_ht {
        Some(d) => d.to_vec(),
        None => vec![0.0f32; sz],
    };
    let mut s_a = vec![0.0f32; sz];
    let mut r = vec![0.0f32; vd];
    let mut u = vec![0.0f32; vd];
    let mut du = vec![0.0f32; vd];

    for t in (0..len).rev() {
        let s_prev = &states[t * sz..(t + 1) * sz];
        let s_t = &states[(t + 1) * sz..(t + 2) * sz];
        let a = x.g[t].exp();
        let bt = x.beta[t];
        let q_t = &x.q[t * kd..(t + 1) * kd];
        let k_t = &x.k[t * kd..(t + 1) * kd];
        let v_t = &x.v[t * vd..(t + 1) * vd];
        let do_t = &d_o[t * vd..(t + 1) * vd];

        // o_t = S_tᵀ q̂_t
        for i in 0..kd {
            gr.dq[t * kd + i] = scale * dot_f32(&s_t[i * vd..(i + 1) * vd], do_t);
            axpy_f32(scale * q_t[i], do_t, &mut ds[i * vd..(i + 1) * vd]);
        }

        // recompute the update
        for (dst, src) in s_a.iter_mut().zip(s_prev.iter()) {
            *dst = a * src;
        }
        r.copy_from_slice(v_t);
        for i in 0..kd {
            axpy_f32(-k_t[i], &s_a[i * vd..(i + 1) * vd], &mut r);
        }
        for j in 0..vd {
            u[j] = bt * r[j];
        }

        // S_t = S_a + k ⊗ u
        du.fill(0.0);
        let dk_t = &mut gr.dk[t * kd..(t + 1) * kd];
        for i in 0..kd {
            let row = &ds[i * vd..(i + 1) * vd];
            dk_t[i] += dot_f32(row, &u);
            axpy_f32(k_t[i], row, &mut du);
        }

        gr.dbeta[t] = dot_f32(&du, &r);
        let dv_t = &mut gr.dv[t * vd..(t + 1) * vd];
        for j in 0..vd {
            dv_t[j] = bt * du[j];
        }

        // r = v − S_aᵀ k, so dpred = −dv_t
        for i in 0..kd {
            let sa_row = &s_a[i * vd..(i + 1) * vd];
            dk_t[i] -= dot_f32(sa_row, dv_t);
            axpy_f32(-k_t[i], dv_t, &mut ds[i * vd..(i + 1) * vd]);
        }

        gr.dg[t] = dot_f32(&ds, &s_a);
        for d in ds.iter_mut() {
            *d *= a;
        }
    }

    gr.dh0 = ds;
    gr
}

// ── Entry points ─────────────────────────────────────────────────────

/// Sequential forward over every (sequence or segment, head) unit.
pub fn recurrent_forward(
    inputs: &GatedDeltaInputs,
    cfg: &RecurrenceConfig,
) -> Result<(RecurrenceOutput, GatedDeltaRecurrentCache)> {
    let problem = DeltaProblem::prepare(inputs, cfg)?;
    let (kd, vd) = (problem.key_dim, problem.value_dim);
    debug!(
        batch = problem.batch, heads = problem.heads, time = problem.time,
        key_dim = kd, value_dim = vd, units = problem.units.len(),
        "gated delta recurrent forward"
    );

    let results: Vec<(Vec<f32>, Vec<f32>)> = problem
        .units
        .par_iter()
        .map(|unit| {
            trace!(slot = unit.span.slot, head = unit.head, len = unit.len(), "unit forward");
            forward_unit(&problem.view(unit), problem.scale, kd, vd)
        })
        .collect();

    let sz = problem.state_size();
    let (outputs, states): (Vec<Vec<f32>>, Vec<Vec<f32>>) = results.into_iter().unzip();
    let finals: Vec<&[f32]> = states.iter().map(|s| &s[s.len() - sz..]).collect();
    let out = problem.assemble_output(&outputs, &finals);

    Ok((out, GatedDeltaRecurrentCache { problem, states }))
}

/// Reverse pass. `d_final_state` is the adjoint of the final state, if it
/// participates in the loss.
pub fn recurrent_backward(
    cache: &GatedDeltaRecurrentCache,
    d_o: &Tensor,
    d_final_state: Option<&Tensor>,
) -> Result<GatedDeltaGrads> {
    let p = &cache.problem;
    let (d_o, d_ht) = p.upstream(d_o, d_final_state)?;
    debug!(units = p.units.len(), "gated delta recurrent backward");

    let grads: Vec<UnitGrads> = p
        .units
        .par_iter()
        .zip(cache.states.par_iter())
        .map(|(unit, states)| {
            backward_unit(
                &p.view(unit),
                states,
                d_o.unit_rows(unit),
                p.unit_state(&d_ht, unit),
                p.scale,
                p.key_dim,
                p.value_dim,
            )
        })
        .collect();

    Ok(p.assemble_grads(&grads))
}

/// Forward only: `(o, final_state)`.
pub fn recurrent_gated_delta_rule(
    inputs: &GatedDeltaInputs,
    cfg: &RecurrenceConfig,
) -> Result<(Tensor, Option<Tensor>)> {
    let (out, _) = recurrent_forward(inputs, cfg)?;
    Ok((out.o, out.final_state))
}
