//! GSA: chunked vs recurrent (forward, backward, segments) and token-by-token decode.


use linattn_core::config::RecurrenceConfig;
use linattn_core::gsa::{
    chunk_backward, chunk_forward, recurrent_backward, recurrent_forward, recurrent_gsa, GsaInputs,
};
use linattn_core::error::RecurrenceError;
use linattn_core::layout::Layout;
use linattn_core::tensor::{log_sigmoid_f32, SimpleRng, Tensor};
use linattn_core::varlen::SegmentBoundaries;
use test_utils::{check_close, randn, slice_time, upstream, write_time};

fn gsa_inputs(b: usize, h: usize, t: usize, kd: usize, vd: usize, m: usize, layout: Layout, seed: u64) -> GsaInputs {
    grouped_inputs(b, h, h, t, kd, vd, m, layout, seed)
}

/// `hq` query heads over `h` kv heads.
fn grouped_inputs(
    b: usize,
    hq: usize,
    h: usize,
    t: usize,
    kd: usize,
    vd: usize,
    m: usize,
    layout: Layout,
    seed: u64,
) -> GsaInputs {
    let mut rng = SimpleRng::new(seed);
    let q = randn(&mut rng, &layout.shape4(b, hq, t, kd));
    let k = randn(&mut rng, &layout.shape4(b, h, t, kd));
    let v = randn(&mut rng, &layout.shape4(b, h, t, vd));
    let s = randn(&mut rng, &layout.shape4(b, h, t, m));
    let g = randn(&mut rng, &layout.shape4(b, h, t, m)).map(|x| log_sigmoid_f32(x) / 8.0);
    GsaInputs::new(q, k, v, s, g)
}

fn with_states(x: GsaInputs, n: usize, h: usize, kd: usize, vd: usize, m: usize, seed: u64) -> GsaInputs {
    let mut rng = SimpleRng::new(seed);
    let hk = randn(&mut rng, &[n, h, kd, m]);
    let hv = randn(&mut rng, &[n, h, m, vd]);
    x.with_initial_state(hk, hv)
}

fn assert_paths_agree(tag: &str, x: &GsaInputs, cfg: &RecurrenceConfig) {
    let cfg = cfg.clone().with_final_state(true);
    let (ro, rc) = recurrent_forward(x, &cfg).unwrap();
    let (co, cc) = chunk_forward(x, &cfg).unwrap();
    let (rhk, rhv) = ro.final_state.unwrap();
    let (chk, chv) = co.final_state.unwrap();
    check_close(&format!("{tag} o"), &ro.o, &co.o, 0.005);
    check_close(&format!("{tag} hk"), &rhk, &chk, 0.005);
    check_close(&format!("{tag} hv"), &rhv, &chv, 0.005);

    let d_o = upstream(&ro.o, 1);
    let d_hk = upstream(&rhk, 2);
    let d_hv = upstream(&rhv, 3);
    let rg = recurrent_backward(&rc, &d_o, Some((&d_hk, &d_hv))).unwrap();
    let cg = chunk_backward(&cc, &d_o, Some((&d_hk, &d_hv))).unwrap();
    check_close(&format!("{tag} dq"), &rg.dq, &cg.dq, 0.008);
    check_close(&format!("{tag} dk"), &rg.dk, &cg.dk, 0.008);
    check_close(&format!("{tag} dv"), &rg.dv, &cg.dv, 0.008);
    check_close(&format!("{tag} ds"), &rg.ds, &cg.ds, 0.008);
    check_close(&format!("{tag} dg"), &rg.dg, &cg.dg, 0.02);
    if let (Some((a0, a1)), Some((b0, b1))) = (&rg.dh0, &cg.dh0) {
        check_close(&format!("{tag} dhk0"), a0, b0, 0.008);
        check_close(&format!("{tag} dhv0"), a1, b1, 0.008);
    }
}

#[test]
fn test_chunk_matches_recurrent() {
    for layout in [Layout::HeadFirst, Layout::TimeFirst] {
        for &t in &[1usize, 40, 100] {
            let x = gsa_inputs(2, 2, t, 16, 16, 8, layout, 70 + t as u64);
            let x = with_states(x, 2, 2, 16, 16, 8, 3 + t as u64);
            let cfg = RecurrenceConfig::default().with_layout(layout).with_chunk_size(16);
            assert_paths_agree(&format!("{layout:?} T={t}"), &x, &cfg);
        }
    }
}

#[test]
fn test_grouped_queries_chunk_matches_recurrent() {
    for layout in [Layout::HeadFirst, Layout::TimeFirst] {
        let x = grouped_inputs(2, 6, 2, 37, 8, 8, 4, layout, 17);
        let x = with_states(x, 2, 2, 8, 8, 4, 18);
        let cfg = RecurrenceConfig::default().with_layout(layout).with_chunk_size(16);
        assert_paths_agree(&format!("{layout:?} HQ=6 H=2"), &x, &cfg);
    }
}

/// Query heads of one group see the same memory: identical queries give
/// identical outputs, and the result matches a run with the kv heads repeated.
#[test]
fn test_grouped_queries_match_repeated_kv_heads() {
    let (hq, h, t, kd, vd, m) = (4, 2, 9, 4, 4, 3);
    let x = with_states(grouped_inputs(1, hq, h, t, kd, vd, m, Layout::HeadFirst, 23), 1, h, kd, vd, m, 24);
    let cfg = RecurrenceConfig::default().with_final_state(true);
    let (o, fin) = recurrent_gsa(&x, &cfg).unwrap();
    let (hk, hv) = fin.unwrap();
    assert_eq!(o.shape, vec![1, hq, t, vd]);
    assert_eq!(hk.shape, vec![1, h, kd, m]);
    assert_eq!(hv.shape, vec![1, h, m, vd]);

    let group = hq / h;
    let repeat = |src: &Tensor, block: usize| -> Vec<f32> {
        src.data.chunks(block).flat_map(|c| std::iter::repeat(c).take(group).flatten().copied()).collect()
    };
    let (hk0, hv0) = x.initial_state.clone().unwrap();
    let wide = GsaInputs::new(
        x.q.clone(),
        Tensor::from_vec(repeat(&x.k, t * kd), &[1, hq, t, kd]).unwrap(),
        Tensor::from_vec(repeat(&x.v, t * vd), &[1, hq, t, vd]).unwrap(),
        Tensor::from_vec(repeat(&x.s, t * m), &[1, hq, t, m]).unwrap(),
        Tensor::from_vec(repeat(&x.g, t * m), &[1, hq, t, m]).unwrap(),
    )
    .with_initial_state(
        Tensor::from_vec(repeat(&hk0, kd * m), &[1, hq, kd, m]).unwrap(),
        Tensor::from_vec(repeat(&hv0, m * vd), &[1, hq, m, vd]).unwrap(),
    );
    let (o_wide, fin_wide) = recurrent_gsa(&wide, &cfg).unwrap();
    check_close("o", &o_wide, &o, 1e-5);
    let (hk_wide, _) = fin_wide.unwrap();
    for head in 0..h {
        let got = &hk.data[head * kd * m..(head + 1) * kd * m];
        let want = &hk_wide.data[head * group * kd * m..(head * group + 1) * kd * m];
        for (a, b) in got.iter().zip(want) {
            assert!((a - b).abs() < 1e-5, "hk head {head}: {a} vs {b}");
        }
    }
}

#[test]
fn test_contract_violations() {
    let x = grouped_inputs(1, 3, 2, 4, 4, 4, 2, Layout::HeadFirst, 1);
    assert!(matches!(
        recurrent_forward(&x, &RecurrenceConfig::default()),
        Err(RecurrenceError::HeadGroup { query_heads: 3, kv_heads: 2 })
    ));
    assert!(matches!(
        chunk_forward(&x, &RecurrenceConfig::default()),
        Err(RecurrenceError::HeadGroup { query_heads: 3, kv_heads: 2 })
    ));

    let x = gsa_inputs(1, 2, 4, 4, 4, 2, Layout::HeadFirst, 2);
    for scale in [f32::NAN, f32::INFINITY] {
        let cfg = RecurrenceConfig::default().with_scale(scale);
        assert!(matches!(recurrent_forward(&x, &cfg), Err(RecurrenceError::Config(_))));
        assert!(matches!(chunk_forward(&x, &cfg), Err(RecurrenceError::Config(_))));
    }
}

#[test]
fn test_varlen_paths_agree() {
    let bounds = SegmentBoundaries::from_lengths(&[17, 0, 50]).unwrap();
    let x = gsa_inputs(1, 2, 67, 8, 8, 4, Layout::HeadFirst, 91).with_boundaries(bounds);
    let x = with_states(x, 3, 2, 8, 8, 4, 92);
    let cfg = RecurrenceConfig::default().with_chunk_size(16);
    assert_paths_agree("varlen", &x, &cfg);
}

/// Feeding one token at a time with the carried state pair reproduces the
/// full-sequence output, with and without grouped query heads.
#[test]
fn test_token_by_token_decode_matches_full_sequence() {
    for &(hq, h) in &[(2usize, 2usize), (8, 2)] {
        decode_matches_full_sequence(hq, h);
    }
}

fn decode_matches_full_sequence(hq: usize, h: usize) {
    let (t, kd, vd, m) = (12, 8, 8, 4);
    let x = grouped_inputs(1, hq, h, t, kd, vd, m, Layout::HeadFirst, 5 + hq as u64);
    let x = with_states(x, 1, h, kd, vd, m, 6);
    let cfg = RecurrenceConfig::default().with_final_state(true);
    let (full, full_state) = recurrent_gsa(&x, &cfg).unwrap();

    let mut state = x.initial_state.clone().unwrap();
    let mut decoded = Tensor::zeros(&full.shape);
    for step in 0..t {
        let token = GsaInputs::new(
            slice_time(&x.q, step, step + 1),
            slice_time(&x.k, step, step + 1),
            slice_time(&x.v, step, step + 1),
            slice_time(&x.s, step, step + 1),
            slice_time(&x.g, step, step + 1),
        )
        .with_initial_state(state.0.clone(), state.1.clone());
        let (o, next) = recurrent_gsa(&token, &cfg).unwrap();
        write_time(&mut decoded, &o, step);
        state = next.unwrap();
    }
    check_close(&format!("HQ={hq} H={h} decode o"), &full, &decoded, 1e-5);
    let (hk, hv) = full_state.unwrap();
    assert_eq!(state.0.shape, vec![1, h, kd, m]);
    check_close(&format!("HQ={hq} H={h} decode hk"), &hk, &state.0, 1e-5);
    check_close(&format!("HQ={hq} H={h} decode hv"), &hv, &state.1, 1e-5);
}
