/// Closeness diagnostics between a reference result and a candidate.
///
/// The error ratio is `rms(reference − candidate) / rms(reference)`, so it is
/// insensitive to the overall magnitude of the tensor. Tensors whose max
/// absolute difference is below `ABS_FLOOR` are accepted outright (all-zero
/// gradients, empty outputs).

use crate::tensor::Tensor;

pub const ABS_FLOOR: f32 = 1e-6;

/// Largest elementwise |a − b|. NaN if any difference is NaN.
pub fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0f32, |acc, d| if d.is_nan() || d > acc { d } else { acc })
}

/// RMS of the difference over RMS of the reference.
pub fn err_ratio(reference: &[f32], candidate: &[f32]) -> f32 {
    debug_assert_eq!(reference.len(), candidate.len());
    if reference.is_empty() {
        return 0.0;
    }
    let n = reference.len() as f64;
    let mut err = 0.0f64;
    let mut base = 0.0f64;
    for (r, c) in reference.iter().zip(candidate.iter()) {
        let d = (*r as f64) - (*c as f64);
        err += d * d;
        base += (*r as f64) * (*r as f64);
    }
    ((err / n).sqrt() / ((base / n).sqrt() + 1e-15)) as f32
}

/// Outcome of one comparison.
#[derive(Clone, Debug)]
pub struct Closeness {
    pub max_abs: f32,
    pub ratio: f32,
    pub passed: bool,
}

pub fn check(reference: &[f32], candidate: &[f32], ratio: f32) -> Closeness {
    let max_abs = max_abs_diff(reference, candidate);
    let r = err_ratio(reference, candidate);
    let passed = max_abs <= ABS_FLOOR || (r.is_finite() && r <= ratio);
    Closeness { max_abs, ratio: r, passed }
}

/// Panic with a labelled message unless `candidate` is within `ratio` of `reference`.
pub fn assert_close(name: &str, reference: &[f32], candidate: &[f32], ratio: f32) {
    assert_eq!(
        reference.len(), candidate.len(),
        "{name}: length mismatch {} vs {}", reference.len(), candidate.len()
    );
    let c = check(reference, candidate, ratio);
    tracing::debug!(name, max_abs = c.max_abs, ratio = c.ratio, "compare");
    assert!(
        c.passed,
        "{name} diff: {:.6} ratio: {:.6} (allowed {ratio})", c.max_abs, c.ratio
    );
}

/// `assert_close` that also requires identical shapes.
pub fn assert_tensor_close(name: &str, reference: &Tensor, candidate: &Tensor, ratio: f32) {
    assert_eq!(
        reference.shape, candidate.shape,
        "{name}: shape mismatch {:?} vs {:?}", reference.shape, candidate.shape
    );
    assert_close(name, &reference.data, &candidate.data, ratio);
}
