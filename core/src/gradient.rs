/// Gradient verification against central finite differences.
///
/// Every backward pass in the crate is hand-derived. The checks here perturb
/// one input element at a time, re-run the forward pass through a scalar
/// projected loss, and compare with the analytic adjoint:
///
///   numerical = (L(x + eps) − L(x − eps)) / (2 eps)
///
/// The projected loss is a fixed random projection of the outputs,
/// `L = Σ o ⊙ w_o + Σ h_T ⊙ w_h`, so the upstream adjoints are `w_o` and `w_h`.

/// Projection Σ a[i] w[i] accumulated in f64 to keep FD noise down.
pub fn weighted_sum(a: &[f32], w: &[f32]) -> f64 {
    debug_assert_eq!(a.len(), w.len());
    a.iter().zip(w.iter()).map(|(x, y)| (*x as f64) * (*y as f64)).sum()
}

/// Central finite difference of `loss` at element `idx` of `x`.
pub fn fd_single(loss: impl Fn(&[f32]) -> f64, x: &[f32], idx: usize, eps: f32) -> f32 {
    let mut plus = x.to_vec();
    plus[idx] += eps;
    let mut minus = x.to_vec();
    minus[idx] -= eps;
    ((loss(&plus) - loss(&minus)) / (2.0 * eps as f64)) as f32
}

/// Check `analytical` against finite differences on up to `num_samples`
/// evenly strided elements of `x`.
/// Returns (num_checked, num_passed, max_relative_error).
///
/// Uses relative error with denominator = max(|a|, |b|). Gradients where both
/// analytical and numerical are below `ABS_THRESHOLD` are auto-passed (below
/// FD resolution).
pub fn check_gradient(
    name: &str,
    x: &[f32],
    analytical: &[f32],
    loss: impl Fn(&[f32]) -> f64,
    num_samples: usize,
    eps: f32,
    tol: f32,
) -> (usize, usize, f32) {
    debug_assert_eq!(x.len(), analytical.len());
    let n = x.len();
    let step = if n > num_samples { n / num_samples } else { 1 };
    let mut checked = 0;
    let mut passed = 0;
    let mut max_rel_err = 0.0f32;

    for idx in (0..n).step_by(step.max(1)).take(num_samples) {
        let a = analytical[idx];
        let numerical = fd_single(&loss, x, idx, eps);

        let abs_diff = (a - numerical).abs();
        let denom = a.abs().max(numerical.abs());

        checked += 1;

        if denom < ABS_THRESHOLD {
            passed += 1;
            continue;
        }

        let rel_err = abs_diff / denom;
        if rel_err > max_rel_err {
            max_rel_err = rel_err;
        }

        if rel_err < tol {
            passed += 1;
        } else {
            eprintln!(
                "  FAIL {name}[{idx}]: analytical={a:.6e}, numerical={numerical:.6e}, \
                 rel_err={rel_err:.4e}"
            );
        }
    }

    (checked, passed, max_rel_err)
}

pub const ABS_THRESHOLD: f32 = 5e-4;

/// Panic unless every sampled element passes.
pub fn assert_gradient(
    name: &str,
    x: &[f32],
    analytical: &[f32],
    loss: impl Fn(&[f32]) -> f64,
    num_samples: usize,
    eps: f32,
    tol: f32,
) {
    let (checked, passed, max_rel) = check_gradient(name, x, analytical, loss, num_samples, eps, tol);
    eprintln!("{name}: {passed}/{checked} passed, max_rel_err={max_rel:.4e}");
    assert_eq!(passed, checked, "{name}: {} of {checked} FD checks failed", checked - passed);
}
