/// Minimal tensor utilities shared by every operator in the crate.
///
/// All math helpers are free functions on flat f32 slices with explicit
/// dimensions. Row-major layout throughout.

use crate::error::{RecurrenceError, Result};

/// Flat f32 tensor with shape metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    pub data: Vec<f32>,
    pub shape: Vec<usize>,
}

impl Tensor {
    pub fn zeros(shape: &[usize]) -> Self {
        let n: usize = shape.iter().product();
        Tensor {
            data: vec![0.0; n],
            shape: shape.to_vec(),
        }
    }

    /// Wrap an existing buffer. Fails if `data.len()` disagrees with `shape`.
    pub fn from_vec(data: Vec<f32>, shape: &[usize]) -> Result<Self> {
        let n: usize = shape.iter().product();
        if data.len() != n {
            return Err(RecurrenceError::DataLength { len: data.len(), shape: shape.to_vec() });
        }
        Ok(Tensor { data, shape: shape.to_vec() })
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Shape as a fixed-size array, or a rank error naming the tensor.
    pub fn dims<const N: usize>(&self, name: &'static str) -> Result<[usize; N]> {
        if self.shape.len() != N {
            return Err(RecurrenceError::Rank { name, expected: N, actual: self.shape.clone() });
        }
        if self.data.len() != self.shape.iter().product::<usize>() {
            return Err(RecurrenceError::DataLength { len: self.data.len(), shape: self.shape.clone() });
        }
        let mut out = [0usize; N];
        out.copy_from_slice(&self.shape);
        Ok(out)
    }

    /// Fails unless the shape is exactly `expected`.
    pub fn expect_shape(&self, name: &'static str, expected: &[usize]) -> Result<()> {
        if self.shape != expected {
            return Err(RecurrenceError::ShapeMismatch {
                name,
                expected: expected.to_vec(),
                actual: self.shape.clone(),
            });
        }
        if self.data.len() != expected.iter().product::<usize>() {
            return Err(RecurrenceError::DataLength { len: self.data.len(), shape: self.shape.clone() });
        }
        Ok(())
    }

    /// Copy of `self` with `f` applied elementwise.
    pub fn map(&self, f: impl Fn(f32) -> f32) -> Tensor {
        Tensor {
            data: self.data.iter().map(|&x| f(x)).collect(),
            shape: self.shape.clone(),
        }
    }
}

// ── Free-function math ops on flat slices ────────────────────────────

/// Inner product of two equal-length vectors.
#[inline]
pub fn dot_f32(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let mut sum = 0.0f32;
    for i in 0..a.len() {
        sum += a[i] * b[i];
    }
    sum
}

/// y += alpha * x.
#[inline]
pub fn axpy_f32(alpha: f32, x: &[f32], y: &mut [f32]) {
    debug_assert_eq!(x.len(), y.len());
    for i in 0..x.len() {
        y[i] += alpha * x[i];
    }
}

/// Matrix multiply: C[M,N] = A[M,K] @ B[K,N].  Row-major.
/// `out` must be pre-allocated with M*N elements (will be overwritten).
pub fn matmul_f32(a: &[f32], b: &[f32], out: &mut [f32], m: usize, k: usize, n: usize) {
    debug_assert_eq!(a.len(), m * k);
    debug_assert_eq!(b.len(), k * n);
    debug_assert_eq!(out.len(), m * n);

    out.fill(0.0);
    for i in 0..m {
        for p in 0..k {
            let a_ip = a[i * k + p];
            if a_ip == 0.0 {
                continue;
            }
            let row = &b[p * n..(p + 1) * n];
            let dst = &mut out[i * n..(i + 1) * n];
            for j in 0..n {
                dst[j] += a_ip * row[j];
            }
        }
    }
}

/// Row-wise softmax: each row of length `cols` in `scores` gets softmaxed into `out`.
/// `rows` * `cols` elements.
pub fn softmax_f32(scores: &[f32], out: &mut [f32], rows: usize, cols: usize) {
    debug_assert_eq!(scores.len(), rows * cols);
    debug_assert_eq!(out.len(), rows * cols);

    for r in 0..rows {
        let base = r * cols;
        let row = &scores[base..base + cols];

        // Numerically stable: subtract max
        let max_val = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut sum_exp = 0.0f32;
        for c in 0..cols {
            let e = (row[c] - max_val).exp();
            out[base + c] = e;
            sum_exp += e;
        }
        if sum_exp > 0.0 {
            for c in 0..cols {
                out[base + c] /= sum_exp;
            }
        }
    }
}

/// Adjoint of row-wise softmax: d_scores = p ⊙ (d_p − Σ d_p ⊙ p), per row.
pub fn softmax_backward_f32(probs: &[f32], d_probs: &[f32], d_scores: &mut [f32], rows: usize, cols: usize) {
    debug_assert_eq!(probs.len(), rows * cols);
    debug_assert_eq!(d_probs.len(), rows * cols);
    debug_assert_eq!(d_scores.len(), rows * cols);

    for r in 0..rows {
        let base = r * cols;
        let p = &probs[base..base + cols];
        let dp = &d_probs[base..base + cols];
        let inner = dot_f32(p, dp);
        for c in 0..cols {
            d_scores[base + c] = p[c] * (dp[c] - inner);
        }
    }
}

/// Sigmoid: 1 / (1 + exp(-x)). Clamped to avoid overflow.
#[inline]
pub fn sigmoid_f32(x: f32) -> f32 {
    if x >= 15.0 { return 1.0; }
    if x <= -15.0 { return 0.0; }
    1.0 / (1.0 + (-x).exp())
}

/// log(sigmoid(x)) without forming sigmoid(x) for very negative x.
#[inline]
pub fn log_sigmoid_f32(x: f32) -> f32 {
    if x >= 0.0 {
        -(-x).exp().ln_1p()
    } else {
        x - x.exp().ln_1p()
    }
}

/// L2 norm of a vector: sqrt(sum(a[i]^2)).
pub fn vec_norm_f32(a: &[f32]) -> f32 {
    a.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Normalize vector in-place to unit length. No-op if norm < eps.
pub fn vec_normalize_f32(a: &mut [f32]) {
    let norm = vec_norm_f32(a);
    if norm > 1e-8 {
        let inv = 1.0 / norm;
        for x in a.iter_mut() {
            *x *= inv;
        }
    }
}

/// Simple xorshift64 PRNG for deterministic test data. Not crypto-safe.
pub struct SimpleRng {
    state: u64,
}

impl SimpleRng {
    pub fn new(seed: u64) -> Self {
        SimpleRng { state: seed.max(1) } // avoid zero state
    }

    pub fn next_u64(&mut self) -> u64 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        self.state
    }

    /// Uniform in [0, 1).
    pub fn unit(&mut self) -> f32 {
        ((self.next_u64() >> 40) as f32) / ((1u64 << 24) as f32)
    }

    /// Uniform in [-scale, scale].
    pub fn uniform(&mut self, scale: f32) -> f32 {
        let u = (self.next_u64() as f64) / (u64::MAX as f64);
        (2.0 * u as f32 - 1.0) * scale
    }

    /// Standard normal sample (Box-Muller).
    pub fn normal(&mut self) -> f32 {
        let u1 = self.unit().max(1e-7);
        let u2 = self.unit();
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos()
    }

    /// Uniform integer in [0, n).
    pub fn below(&mut self, n: usize) -> usize {
        debug_assert!(n > 0);
        (self.next_u64() % n as u64) as usize
    }

    /// Fill slice with uniform random values in [-scale, scale].
    pub fn fill_uniform(&mut self, buf: &mut [f32], scale: f32) {
        for v in buf.iter_mut() {
            *v = self.uniform(scale);
        }
    }

    /// Fill slice with standard normal samples.
    pub fn fill_normal(&mut self, buf: &mut [f32]) {
        for v in buf.iter_mut() {
            *v = self.normal();
        }
    }

    /// Fisher-Yates permutation of 0..n.
    pub fn permutation(&mut self, n: usize) -> Vec<usize> {
        let mut p: Vec<usize> = (0..n).collect();
        for i in (1..n).rev() {
            let j = self.below(i + 1);
            p.swap(i, j);
        }
        p
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matmul_identity() {
        let a = [1.0, 0.0, 0.0, 1.0f32];
        let b = [1.0, 2.0, 3.0, 4.0f32];
        let mut out = [0.0f32; 4];
        matmul_f32(&a, &b, &mut out, 2, 2, 2);
        assert_eq!(out, b);
    }

    #[test]
    fn test_matmul_2x3_3x2() {
        let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0f32];
        let b = [7.0, 8.0, 9.0, 10.0, 11.0, 12.0f32];
        let mut out = [9.0f32; 4];
        matmul_f32(&a, &b, &mut out, 2, 3, 2);
        assert_eq!(out, [58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn test_softmax_two_rows() {
        let scores = [0.0, 1.0, 1.0, 0.0f32];
        let mut out = [0.0f32; 4];
        softmax_f32(&scores, &mut out, 2, 2);
        assert!((out[0] + out[1] - 1.0).abs() < 1e-6);
        assert!((out[2] + out[3] - 1.0).abs() < 1e-6);
        assert!(out[0] < out[1]);
        assert!(out[2] > out[3]);
    }

    #[test]
    fn test_softmax_backward_matches_fd() {
        let scores = [0.3f32, -1.2, 0.7, 2.0];
        let upstream = [0.5f32, -0.25, 1.0, 0.1];
        let mut p = [0.0f32; 4];
        softmax_f32(&scores, &mut p, 1, 4);
        let mut d = [0.0f32; 4];
        softmax_backward_f32(&p, &upstream, &mut d, 1, 4);

        let eps = 1e-3f32;
        for c in 0..4 {
            let mut plus = scores;
            let mut minus = scores;
            plus[c] += eps;
            minus[c] -= eps;
            let mut pp = [0.0f32; 4];
            let mut pm = [0.0f32; 4];
            softmax_f32(&plus, &mut pp, 1, 4);
            softmax_f32(&minus, &mut pm, 1, 4);
            let fd = (dot_f32(&pp, &upstream) - dot_f32(&pm, &upstream)) / (2.0 * eps);
            assert!((fd - d[c]).abs() < 1e-3, "col {c}: fd={fd} analytic={}", d[c]);
        }
    }

    #[test]
    fn test_log_sigmoid() {
        for &x in &[-30.0f32, -2.0, 0.0, 0.5, 3.0, 40.0] {
            let expected = (1.0f64 / (1.0 + (-(x as f64)).exp())).ln() as f32;
            assert!((log_sigmoid_f32(x) - expected).abs() < 1e-5, "x={x}");
        }
        assert!(log_sigmoid_f32(-100.0).is_finite());
    }

    #[test]
    fn test_tensor_dims_and_shape_errors() {
        let t = Tensor::zeros(&[2, 3, 4, 5]);
        assert_eq!(t.dims::<4>("q").unwrap(), [2, 3, 4, 5]);
        assert!(matches!(t.dims::<3>("q"), Err(RecurrenceError::Rank { .. })));
        assert!(t.expect_shape("q", &[2, 3, 4, 5]).is_ok());
        assert!(matches!(
            t.expect_shape("q", &[2, 3, 5, 4]),
            Err(RecurrenceError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            Tensor::from_vec(vec![0.0; 5], &[2, 3]),
            Err(RecurrenceError::DataLength { .. })
        ));
    }

    #[test]
    fn test_rng_deterministic() {
        let mut rng1 = SimpleRng::new(42);
        let mut rng2 = SimpleRng::new(42);
        for _ in 0..100 {
            assert_eq!(rng1.next_u64(), rng2.next_u64());
        }
    }

    #[test]
    fn test_rng_normal_moments() {
        let mut rng = SimpleRng::new(7);
        let mut buf = vec![0.0f32; 20000];
        rng.fill_normal(&mut buf);
        let mean = buf.iter().sum::<f32>() / buf.len() as f32;
        let var = buf.iter().map(|x| (x - mean) * (x - mean)).sum::<f32>() / buf.len() as f32;
        assert!(mean.abs() < 0.05, "mean={mean}");
        assert!((var - 1.0).abs() < 0.05, "var={var}");
    }

    #[test]
    fn test_rng_permutation_is_permutation() {
        let mut rng = SimpleRng::new(3);
        let mut p = rng.permutation(50);
        p.sort_unstable();
        assert_eq!(p, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_vec_normalize_basic() {
        let mut a = [3.0f32, 4.0];
        vec_normalize_f32(&mut a);
        assert!((a[0] - 0.6).abs() < 1e-6, "a[0]={}", a[0]);
        assert!((a[1] - 0.8).abs() < 1e-6, "a[1]={}", a[1]);
    }
}
