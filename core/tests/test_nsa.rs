//! Native sparse attention: blockwise online softmax vs gather reference.
//!
//! Block selections are random permutations of the blocks visible from each
//! token, padded with an always-masked sentinel id.


use linattn_core::config::SparseAttentionConfig;
use linattn_core::error::RecurrenceError;
use linattn_core::layout::Layout;
use linattn_core::nsa::{
    naive_backward, naive_forward, parallel_backward, parallel_forward, parallel_nsa, BlockIndices, NsaInputs,
};
use linattn_core::tensor::{SimpleRng, Tensor};
use linattn_core::varlen::SegmentBoundaries;
use test_utils::{check_close, randn, upstream};

/// Random block selection: for each token, up to `selected` distinct blocks
/// drawn from those that start at or before it; the rest hold the sentinel
/// `time`, which is always out of range.
fn random_blocks(
    b: usize,
    h: usize,
    time: usize,
    selected: usize,
    block_size: usize,
    layout: Layout,
    bounds: Option<&SegmentBoundaries>,
    rng: &mut SimpleRng,
) -> BlockIndices {
    let positions: Vec<usize> = match bounds {
        Some(bd) => bd.token_indices().into_iter().map(|(_, p)| p).collect(),
        None => (0..time).collect(),
    };
    let shape = layout.shape4(b, h, time, selected);
    let mut data = vec![time; b * h * time * selected];
    for bi in 0..b {
        for hi in 0..h {
            for t in 0..time {
                let available = positions[t] / block_size + 1;
                let perm = rng.permutation(available);
                let base = match layout {
                    Layout::HeadFirst => ((bi * h + hi) * time + t) * selected,
                    Layout::TimeFirst => ((bi * time + t) * h + hi) * selected,
                };
                for (s, &id) in perm.iter().take(selected).enumerate() {
                    data[base + s] = id;
                }
            }
        }
    }
    BlockIndices::new(data, &shape).unwrap()
}

struct Case {
    b: usize,
    hq: usize,
    h: usize,
    t: usize,
    kd: usize,
    vd: usize,
    selected: usize,
    block_size: usize,
    layout: Layout,
}

fn make(case: &Case, bounds: Option<SegmentBoundaries>, seed: u64) -> NsaInputs {
    let mut rng = SimpleRng::new(seed);
    let l = case.layout;
    let q = randn(&mut rng, &l.shape4(case.b, case.hq, case.t, case.kd));
    let k = randn(&mut rng, &l.shape4(case.b, case.h, case.t, case.kd));
    let v = randn(&mut rng, &l.shape4(case.b, case.h, case.t, case.vd));
    let idx = random_blocks(case.b, case.h, case.t, case.selected, case.block_size, l, bounds.as_ref(), &mut rng);
    let inputs = NsaInputs::new(q, k, v, idx);
    match bounds {
        Some(bd) => inputs.with_boundaries(bd),
        None => inputs,
    }
}

fn assert_paths_agree(tag: &str, inputs: &NsaInputs, cfg: &SparseAttentionConfig) {
    let (on, cn) = naive_forward(inputs, cfg).unwrap();
    let (op, cp) = parallel_forward(inputs, cfg).unwrap();
    check_close(&format!("{tag} o"), &on, &op, 0.005);

    let d_o = upstream(&on, 17);
    let gn = naive_backward(&cn, &d_o).unwrap();
    let gp = parallel_backward(&cp, &d_o).unwrap();
    check_close(&format!("{tag} dq"), &gn.dq, &gp.dq, 0.008);
    check_close(&format!("{tag} dk"), &gn.dk, &gp.dk, 0.008);
    check_close(&format!("{tag} dv"), &gn.dv, &gp.dv, 0.008);
}

#[test]
fn test_parallel_matches_naive() {
    for layout in [Layout::HeadFirst, Layout::TimeFirst] {
        for &(t, selected, block_size) in &[(1usize, 1usize, 16usize), (64, 4, 16), (100, 3, 32), (256, 16, 8)] {
            let case = Case { b: 2, hq: 4, h: 2, t, kd: 16, vd: 16, selected, block_size, layout };
            let inputs = make(&case, None, t as u64 + selected as u64);
            let cfg = SparseAttentionConfig::new(block_size).with_layout(layout);
            assert_paths_agree(&format!("{layout:?} T={t} S={selected} BS={block_size}"), &inputs, &cfg);
        }
    }
}

#[test]
fn test_grouped_query_heads() {
    let case = Case { b: 1, hq: 8, h: 1, t: 80, kd: 8, vd: 12, selected: 2, block_size: 16, layout: Layout::HeadFirst };
    let inputs = make(&case, None, 3);
    let cfg = SparseAttentionConfig::new(16);
    assert_paths_agree("G=8", &inputs, &cfg);
    let o = parallel_nsa(&inputs, &cfg).unwrap();
    assert_eq!(o.shape, vec![1, 8, 80, 12]);
}

#[test]
fn test_varlen_paths_agree() {
    let bounds = SegmentBoundaries::from_lengths(&[50, 0, 7, 71]).unwrap();
    let case = Case { b: 1, hq: 4, h: 2, t: 128, kd: 8, vd: 8, selected: 3, block_size: 8, layout: Layout::TimeFirst };
    let inputs = make(&case, Some(bounds), 44);
    let cfg = SparseAttentionConfig::new(8).with_layout(Layout::TimeFirst);
    assert_paths_agree("varlen", &inputs, &cfg);
}

/// A token in a later segment that selects block 0 only sees keys of its own
/// segment.
#[test]
fn test_varlen_blocks_are_segment_relative() {
    let (t, kd, vd) = (12, 4, 4);
    let mut rng = SimpleRng::new(2);
    let q = randn(&mut rng, &[1, 1, t, kd]);
    let k = randn(&mut rng, &[1, 1, t, kd]);
    let v = randn(&mut rng, &[1, 1, t, vd]);
    let idx = BlockIndices::new(vec![0; t], &[1, 1, t, 1]).unwrap();
    let bounds = SegmentBoundaries::new(vec![0, 5, 12]).unwrap();
    let inputs = NsaInputs::new(q, k, v.clone(), idx).with_boundaries(bounds);
    let o = parallel_nsa(&inputs, &SparseAttentionConfig::new(4)).unwrap();

    // first token of the second segment attends only to itself
    let row = 5 * vd;
    for c in 0..vd {
        assert!((o.data[row + c] - v.data[row + c]).abs() < 1e-6);
    }
}

/// Brute-force softmax over the candidate positions of every token.
#[test]
fn test_matches_brute_force_reference() {
    let (t, kd, vd, bs, selected) = (40, 8, 6, 4, 3);
    let case = Case { b: 1, hq: 2, h: 1, t, kd, vd, selected, block_size: bs, layout: Layout::HeadFirst };
    let inputs = make(&case, None, 9);
    let cfg = SparseAttentionConfig::new(bs);
    let o = parallel_nsa(&inputs, &cfg).unwrap();

    let scale = 1.0 / (kd as f32).sqrt();
    let mut expected = Tensor::zeros(&o.shape);
    for hq in 0..2 {
        for i in 0..t {
            let q_i = &inputs.q.data[(hq * t + i) * kd..(hq * t + i + 1) * kd];
            let ids = &inputs.block_indices.data[i * selected..(i + 1) * selected];
            let cands: Vec<usize> = ids
                .iter()
                .flat_map(|&id| (id * bs..id * bs + bs).filter(move |&j| j <= i && id < t))
                .collect();
            let scores: Vec<f32> = cands
                .iter()
                .map(|&j| scale * (0..kd).map(|d| q_i[d] * inputs.k.data[j * kd + d]).sum::<f32>())
                .collect();
            let m = scores.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            let z: f32 = scores.iter().map(|s| (s - m).exp()).sum();
            let out = &mut expected.data[(hq * t + i) * vd..(hq * t + i + 1) * vd];
            for (&j, s) in cands.iter().zip(scores.iter()) {
                let p = (s - m).exp() / z;
                for c in 0..vd {
                    out[c] += p * inputs.v.data[j * vd + c];
                }
            }
        }
    }
    check_close("o", &expected, &o, 1e-4);
}

#[test]
fn test_contract_violations() {
    let case = Case { b: 1, hq: 3, h: 2, t: 8, kd: 4, vd: 4, selected: 1, block_size: 4, layout: Layout::HeadFirst };
    let mut rng = SimpleRng::new(1);
    let q = randn(&mut rng, &[1, case.hq, case.t, case.kd]);
    let k = randn(&mut rng, &[1, case.h, case.t, case.kd]);
    let v = randn(&mut rng, &[1, case.h, case.t, case.vd]);
    let idx = BlockIndices::new(vec![0; 16], &[1, 2, 8, 1]).unwrap();
    let inputs = NsaInputs::new(q, k.clone(), v.clone(), idx.clone());
    assert!(matches!(
        parallel_forward(&inputs, &SparseAttentionConfig::new(4)),
        Err(RecurrenceError::HeadGroup { query_heads: 3, kv_heads: 2 })
    ));

    let q = randn(&mut rng, &[1, 2, 8, 4]);
    let ok = NsaInputs::new(q.clone(), k.clone(), v.clone(), idx);
    assert!(matches!(
        naive_forward(&ok, &SparseAttentionConfig::new(0)),
        Err(RecurrenceError::InvalidBlockSize)
    ));

    let short_idx = BlockIndices::new(vec![0; 14], &[1, 2, 7, 1]).unwrap();
    let bad = NsaInputs::new(q, k, v, short_idx);
    assert!(matches!(
        naive_forward(&bad, &SparseAttentionConfig::new(4)),
        Err(RecurrenceError::ShapeMismatch { name: "block_indices", .. })
    ));

    assert!(matches!(
        BlockIndices::new(vec![0; 3], &[1, 1, 4, 1]),
        Err(RecurrenceError::DataLength { .. })
    ));
}
