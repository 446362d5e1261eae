/// Gated delta rule: chunked closed form.
///
/// Each unit's time axis is cut into chunks of `chunk_size` steps starting at
/// the unit's first token; the last chunk may be shorter. Within a chunk of n
/// steps with cumulative log decay b (e = exp(b), Γ_ij = exp(b_i − b_j) for
/// j ≤ i):
///
///   M  = strict_lower(β_i (k_i · k_j) Γ_ij)
///   T  = (I + M)^{-1}                      (forward substitution, see `tril`)
///   U  = T (β ⊙ v),   W = T (β ⊙ e ⊙ k)
///   Vn = U − W S                            (the per-step delta-rule updates)
///   O  = (q̂ ⊙ e) S + tril_incl_diag(q̂ kᵀ ⊙ Γ) Vn
///   S' = e_last S + Σ_j (k_j exp(b_last − b_j)) ⊗ Vn_j
///
/// Only chunk-start states are cached. The backward pass walks chunks in
/// reverse and rebuilds Γ, T, U, W, Vn from the inputs.

use rayon::prelude::*;
use tracing::{debug, trace};

use crate::config::RecurrenceConfig;
use crate::error::Result;
use crate::gated_delta::{DeltaProblem, GatedDeltaGrads, GatedDeltaInputs, UnitGrads, UnitView};
use crate::layout::RecurrenceOutput;
use crate::tensor::{axpy_f32, dot_f32, Tensor};
use crate::tril::{unit_lower_inverse, unit_lower_inverse_backward};
use crate::varlen::chunk_ranges;

/// Cache for the chunked backward pass.
pub struct GatedDeltaChunkCache {
    problem: DeltaProblem,
    chunk_size: usize,
    /// Per unit: state at the start of every chunk, [num_chunks, K, V].
    chunk_states: Vec<Vec<f32>>,
}

// ── Per-chunk terms ──────────────────────────────────────────────────

/// Everything about one chunk that does not depend on the carried state.
struct ChunkTerms {
    n: usize,
    /// Cumulative log decay within the chunk.
    b: Vec<f32>,
    /// [n, n] Γ_ij = exp(b_i − b_j) on and below the diagonal.
    gamma: Vec<f32>,
    /// [n, n] (I + M)^{-1}.
    t: Vec<f32>,
    /// [n, V] β ⊙ v
    vb: Vec<f32>,
    /// [n, K] β ⊙ e ⊙ k
    x: Vec<f32>,
    /// [n, V] T vb
    u: Vec<f32>,
    /// [n, K] T x
    w: Vec<f32>,
}

fn chunk_terms(k: &[f32], v: &[f32], beta: &[f32], g: &[f32], kd: usize, vd: usize) -> ChunkTerms {
    let n = beta.len();
    let mut b = vec![0.0f32; n];
    let mut acc = 0.0f32;
    for i in 0..n {
        acc += g[i];
        b[i] = acc;
    }

    let mut gamma = vec![0.0f32; n * n];
    let mut t = vec![0.0f32; n * n];
    for i in 0..n {
        let k_i = &k[i * kd..(i + 1) * kd];
        for j in 0..=i {
            let gij = (b[i] - b[j]).exp();
            gamma[i * n + j] = gij;
            if j < i {
                t[i * n + j] = beta[i] * dot_f32(k_i, &k[j * kd..(j + 1) * kd]) * gij;
            }
        }
    }
    unit_lower_inverse(&mut t, n);

    let mut vb = vec![0.0f32; n * vd];
    let mut x = vec![0.0f32; n * kd];
    for i in 0..n {
        for c in 0..vd {
            vb[i * vd + c] = beta[i] * v[i * vd + c];
        }
        let f = beta[i] * b[i].exp();
        for d in 0..kd {
            x[i * kd + d] = f * k[i * kd + d];
        }
    }

    let mut u = vec![0.0f32; n * vd];
    let mut w = vec![0.0f32; n * kd];
    for i in 0..n {
        for j in 0..=i {
            let tij = t[i * n + j];
            if tij == 0.0 {
                continue;
            }
            axpy_f32(tij, &vb[j * vd..(j + 1) * vd], &mut u[i * vd..(i + 1) * vd]);
            axpy_f32(tij, &x[j * kd..(j + 1) * kd], &mut w[i * kd..(i + 1) * kd]);
        }
    }

    ChunkTerms { n, b, gamma, t, vb, x, u, w }
}

/// Vn = U − W S.
fn new_values(terms: &ChunkTerms, s: &[f32], kd: usize, vd: usize) -> Vec<f32> {
    let mut vn = terms.u.clone();
    for i in 0..terms.n {
        let row = &mut vn[i * vd..(i + 1) * vd];
        for d in 0..kd {
            axpy_f32(-terms.w[i * kd + d], &s[d * vd..(d + 1) * vd], row);
        }
    }
    vn
}

/// P_ij = (q̂_i · k_j) Γ_ij for j ≤ i.
fn intra_scores(terms: &ChunkTerms, q: &[f32], k: &[f32], scale: f32, kd: usize) -> Vec<f32> {
    let n = terms.n;
    let mut p = vec![0.0f32; n * n];
    for i in 0..n {
        let q_i = &q[i * kd..(i + 1) * kd];
        for j in 0..=i {
            p[i * n + j] = scale * dot_f32(q_i, &k[j * kd..(j + 1) * kd]) * terms.gamma[i * n + j];
        }
    }
    p
}

// ── Per-unit kernels ─────────────────────────────────────────────────

/// Returns (outputs [L, V], chunk-start states, final state).
fn forward_unit(
    x: &UnitView<'_>,
    scale: f32,
    chunk_size: usize,
    kd: usize,
    vd: usize,
) -> (Vec<f32>, Vec<f32>, Vec<f32>) {
    let len = x.beta.len();
    let sz = kd * vd;
    let ranges = chunk_ranges(len, chunk_size);
    let mut s = match x.h0 {
        Some(h) => h.to_vec(),
        None => vec![0.0f32; sz],
    };
    let mut starts = Vec::with_capacity(ranges.len() * sz);
    let mut o = vec![0.0f32; len * vd];

    for &(c0, c1) in &ranges {
        starts.extend_from_slice(&s);
        let k = &x.k[c0 * kd..c1 * kd];
        let q = &x.q[c0 * kd..c1 * kd];
        let terms = chunk_terms(k, &x.v[c0 * vd..c1 * vd], &x.beta[c0..c1], &x.g[c0..c1], kd, vd);
        let n = terms.n;
        let vn = new_values(&terms, &s, kd, vd);
        let p = intra_scores(&terms, q, k, scale, kd);

        for i in 0..n {
            let o_i = &mut o[(c0 + i) * vd..(c0 + i + 1) * vd];
            let e_i = terms.b[i].exp();
            for d in 0..kd {
                axpy_f32(scale * q[i * kd + d] * e_i, &s[d * vd..(d + 1) * vd], o_i);
            }
            for j in 0..=i {
                axpy_f32(p[i * n + j], &vn[j * vd..(j + 1) * vd], o_i);
            }
        }

        let b_last = terms.b[n - 1];
        let e_last = b_last.exp();
        for val in s.iter_mut() {
            *val *= e_last;
        }
        for j in 0..n {
            let f = (b_last - terms.b[j]).exp();
            let vn_j = &vn[j * vd..(j + 1) * vd];
            for d in 0..kd {
                axpy_f32(f * k[j * kd + d], vn_j, &mut s[d * vd..(d + 1) * vd]);
            }
        }
    }

    (o, starts, s)
}

/// Reverse chunk loop for one unit.
#[allow(clippy::too_many_arguments)]
fn backward_unit(
    x: &UnitView<'_>,
    starts: &[f32],
    d_o: &[f32],
    d_ht: Option<&[f32]>,
    scale: f32,
    chunk_size: usize,
    kd: usize,
    vd: usize,
) -> UnitGrads {
    let len = x.beta.len();
    let sz = kd * vd;
    let ranges = chunk_ranges(len, chunk_size);
    let mut gr = UnitGrads::zeros(len, kd, vd);
    // adjoint of the state at the end of the current chunk
    let mut ds = match d_ht {
        Some(d) => d.to_vec(),
        None => vec![0.0f32; sz],
    };

    for (ci, &(c0, c1)) in ranges.iter().enumerate().rev() {
        let s = &starts[ci * sz..(ci + 1) * sz];
        let q = &x.q[c0 * kd..c1 * kd];
        let k = &x.k[c0 * kd..c1 * kd];
        let v = &x.v[c0 * vd..c1 * vd];
        let beta = &x.beta[c0..c1];
        let terms = chunk_terms(k, v, beta, &x.g[c0..c1], kd, vd);
        let n = terms.n;
        let vn = new_values(&terms, s, kd, vd);
        let p = intra_scores(&terms, q, k, scale, kd);
        let d_o = &d_o[c0 * vd..c1 * vd];
        let b = &terms.b;
        let b_last = b[n - 1];
        let e_last = b_last.exp();

        // local adjoints; dq_hat is w.r.t. the scaled query
        let mut dqh = vec![0.0f32; n * kd];
        let mut dk = vec![0.0f32; n * kd];
        let mut dv = vec![0.0f32; n * vd];
        let mut dbeta = vec![0.0f32; n];
        let mut db = vec![0.0f32; n];

        // ── S' = e_last S + Σ kd_j ⊗ Vn_j ──
        let mut dvn = vec![0.0f32; n * vd];
        for j in 0..n {
            let f = (b_last - b[j]).exp();
            let dvn_j = &mut dvn[j * vd..(j + 1) * vd];
            let vn_j = &vn[j * vd..(j + 1) * vd];
            let mut z = 0.0f32;
            for d in 0..kd {
                let ds_row = &ds[d * vd..(d + 1) * vd];
                let kdj = f * k[j * kd + d];
                axpy_f32(kdj, ds_row, dvn_j);
                let dkd = dot_f32(vn_j, ds_row);
                dk[j * kd + d] += f * dkd;
                z += dkd * kdj;
            }
            db[j] -= z;
            db[n - 1] += z;
        }
        db[n - 1] += e_last * dot_f32(&ds, s);

        let mut ds_prev: Vec<f32> = ds.iter().map(|d| e_last * d).collect();

        // ── O = (q̂ ⊙ e) S + P Vn ──
        let mut dp = vec![0.0f32; n * n];
        for i in 0..n {
            let do_i = &d_o[i * vd..(i + 1) * vd];
            let e_i = b[i].exp();
            let mut zq = 0.0f32;
            for d in 0..kd {
                let s_row = &s[d * vd..(d + 1) * vd];
                let dqe = dot_f32(do_i, s_row);
                let qe = scale * q[i * kd + d] * e_i;
                dqh[i * kd + d] += e_i * dqe;
                zq += dqe * qe;
                axpy_f32(qe, do_i, &mut ds_prev[d * vd..(d + 1) * vd]);
            }
            db[i] += zq;
            for j in 0..=i {
                dp[i * n + j] = dot_f32(do_i, &vn[j * vd..(j + 1) * vd]);
                axpy_f32(p[i * n + j], do_i, &mut dvn[j * vd..(j + 1) * vd]);
            }
        }
        for i in 0..n {
            for j in 0..=i {
                let c = dp[i * n + j];
                if c == 0.0 {
                    continue;
                }
                let gij = terms.gamma[i * n + j];
                for d in 0..kd {
                    dqh[i * kd + d] += c * gij * k[j * kd + d];
                    dk[j * kd + d] += c * gij * scale * q[i * kd + d];
                }
                let r = c * p[i * n + j];
                db[i] += r;
                db[j] -= r;
            }
        }

        // ── Vn = U − W S ──
        let mut dw = vec![0.0f32; n * kd];
        for i in 0..n {
            let dvn_i = &dvn[i * vd..(i + 1) * vd];
            for d in 0..kd {
                dw[i * kd + d] = -dot_f32(dvn_i, &s[d * vd..(d + 1) * vd]);
                axpy_f32(-terms.w[i * kd + d], dvn_i, &mut ds_prev[d * vd..(d + 1) * vd]);
            }
        }
        let du = &dvn;

        // ── U = T vb, W = T x ──
        let mut dt = vec![0.0f32; n * n];
        let mut dvb = vec![0.0f32; n * vd];
        let mut dx = vec![0.0f32; n * kd];
        for i in 0..n {
            let du_i = &du[i * vd..(i + 1) * vd];
            let dw_i = &dw[i * kd..(i + 1) * kd];
            for j in 0..=i {
                dt[i * n + j] = dot_f32(du_i, &terms.vb[j * vd..(j + 1) * vd])
                    + dot_f32(dw_i, &terms.x[j * kd..(j + 1) * kd]);
                let tij = terms.t[i * n + j];
                axpy_f32(tij, du_i, &mut dvb[j * vd..(j + 1) * vd]);
                axpy_f32(tij, dw_i, &mut dx[j * kd..(j + 1) * kd]);
            }
        }
        let dm = unit_lower_inverse_backward(&terms.t, &dt, n);

        // ── M_ij = β_i (k_i · k_j) Γ_ij ──
        for i in 0..n {
            for j in 0..i {
                let dmij = dm[i * n + j];
                if dmij == 0.0 {
                    continue;
                }
                let gij = terms.gamma[i * n + j];
                let kk = dot_f32(&k[i * kd..(i + 1) * kd], &k[j * kd..(j + 1) * kd]);
                let gm = dmij * gij;
                for d in 0..kd {
                    dk[i * kd + d] += beta[i] * gm * k[j * kd + d];
                    dk[j * kd + d] += beta[i] * gm * k[i * kd + d];
                }
                dbeta[i] += gm * kk;
                let r = dmij * beta[i] * kk * gij;
                db[i] += r;
                db[j] -= r;
            }
        }

        // ── vb = β v, x = β e k ──
        for i in 0..n {
            let dvb_i = &dvb[i * vd..(i + 1) * vd];
            dbeta[i] += dot_f32(dvb_i, &v[i * vd..(i + 1) * vd]);
            for c in 0..vd {
                dv[i * vd + c] += beta[i] * dvb_i[c];
            }
            let e_i = b[i].exp();
            let dx_i = &dx[i * kd..(i + 1) * kd];
            let dxk = dot_f32(dx_i, &k[i * kd..(i + 1) * kd]);
            dbeta[i] += e_i * dxk;
            db[i] += beta[i] * e_i * dxk;
            for d in 0..kd {
                dk[i * kd + d] += beta[i] * e_i * dx_i[d];
            }
        }

        // b = cumsum(g) → dg = reverse cumsum(db)
        let mut acc = 0.0f32;
        for i in (0..n).rev() {
            acc += db[i];
            gr.dg[c0 + i] = acc;
        }
        for (dst, src) in gr.dq[c0 * kd..c1 * kd].iter_mut().zip(dqh.iter()) {
            *dst = scale * src;
        }
        gr.dk[c0 * kd..c1 * kd].copy_from_slice(&dk);
        gr.dv[c0 * vd..c1 * vd].copy_from_slice(&dv);
        gr.dbeta[c0..c1].copy_from_slice(&dbeta);

        ds = ds_prev;
    }

    gr.dh0 = ds;
    gr
}

// ── Entry points ─────────────────────────────────────────────────────

/// Chunked forward. Equivalent to `gated_delta::recurrent_forward` up to
/// floating-point reassociation.
pub fn chunk_forward(
    inputs: &GatedDeltaInputs,
    cfg: &RecurrenceConfig,
) -> Result<(RecurrenceOutput, GatedDeltaChunkCache)> {
    cfg.validate()?;
    let problem = DeltaProblem::prepare(inputs, cfg)?;
    let (kd, vd, chunk_size) = (problem.key_dim, problem.value_dim, cfg.chunk_size);
    debug!(
        batch = problem.batch, heads = problem.heads, time = problem.time,
        key_dim = kd, value_dim = vd, chunk_size,
        chunks_per_seq = problem.time.div_ceil(chunk_size),
        units = problem.units.len(),
        "gated delta chunk forward"
    );

    let results: Vec<(Vec<f32>, Vec<f32>, Vec<f32>)> = problem
        .units
        .par_iter()
        .map(|unit| {
            trace!(slot = unit.span.slot, head = unit.head, len = unit.len(), "unit chunk forward");
            forward_unit(&problem.view(unit), problem.scale, chunk_size, kd, vd)
        })
        .collect();

    let mut outputs = Vec::with_capacity(results.len());
    let mut chunk_states = Vec::with_capacity(results.len());
    let mut finals = Vec::with_capacity(results.len());
    for (o, starts, last) in results {
        outputs.push(o);
        chunk_states.push(starts);
        finals.push(last);
    }
    let final_refs: Vec<&[f32]> = finals.iter().map(|f| f.as_slice()).collect();
    let out = problem.assemble_output(&outputs, &final_refs);

    Ok((out, GatedDeltaChunkCache { problem, chunk_size, chunk_states }))
}

/// Chunked backward: chunks in reverse order, terms recomputed per chunk.
pub fn chunk_backward(
    cache: &GatedDeltaChunkCache,
    d_o: &Tensor,
    d_final_state: Option<&Tensor>,
) -> Result<GatedDeltaGrads> {
    let p = &cache.problem;
    let (d_o, d_ht) = p.upstream(d_o, d_final_state)?;
    debug!(units = p.units.len(), chunk_size = cache.chunk_size, "gated delta chunk backward");

    let grads: Vec<UnitGrads> = p
        .units
        .par_iter()
        .zip(cache.chunk_states.par_iter())
        .map(|(unit, starts)| {
            backward_unit(
                &p.view(unit),
                starts,
                d_o.unit_rows(unit),
                p.unit_state(&d_ht, unit),
                p.scale,
                cache.chunk_size,
                p.key_dim,
                p.value_dim,
            )
        })
        .collect();

    Ok(p.assemble_grads(&grads))
}

/// Forward only: `(o, final_state)`.
pub fn chunk_gated_delta_rule(
    inputs: &GatedDeltaInputs,
    cfg: &RecurrenceConfig,
) -> Result<(Tensor, Option<Tensor>)> {
    let (out, _) = chunk_forward(inputs, cfg)?;
    Ok((out.o, out.final_state))
}
