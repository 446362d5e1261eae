/// Inverse of a unit lower-triangular matrix and its adjoint.
///
/// The chunked delta rule needs `T = (I + M)^{-1}` where `M` is strictly
/// lower triangular (n × n, n ≤ chunk size). Row i of T only depends on rows
/// < i, so forward substitution fills T in place, one row at a time:
///
///   T[i,j] = −M[i,j] − Σ_{j<m<i} M[i,m] T[m,j]     (j < i)
///   T[i,i] = 1
///
/// Adjoint: with upstream dT, dM = −Tᵀ dT Tᵀ, kept on the strict lower
/// triangle only.

/// Overwrite `a` (holding strictly-lower `M`, row-major n×n) with `(I + M)^{-1}`.
/// Entries on and above the diagonal of the input are ignored.
pub fn unit_lower_inverse(a: &mut [f32], n: usize) {
    debug_assert_eq!(a.len(), n * n);
    let mut row = vec![0.0f32; n];
    for i in 0..n {
        // original −M[i, :i]
        for j in 0..i {
            row[j] = -a[i * n + j];
        }
        for j in 0..i {
            let mut acc = row[j];
            for m in (j + 1)..i {
                acc += row[m] * a[m * n + j];
            }
            a[i * n + j] = acc;
        }
        a[i * n + i] = 1.0;
        for j in (i + 1)..n {
            a[i * n + j] = 0.0;
        }
    }
}

/// dM = −Tᵀ dT Tᵀ on the strict lower triangle; zero elsewhere.
pub fn unit_lower_inverse_backward(t: &[f32], dt: &[f32], n: usize) -> Vec<f32> {
    debug_assert_eq!(t.len(), n * n);
    debug_assert_eq!(dt.len(), n * n);

    // tmp = dT Tᵀ, then dM = −Tᵀ tmp
    let mut tmp = vec![0.0f32; n * n];
    for i in 0..n {
        for j in 0..n {
            // (dT Tᵀ)[i,j] = Σ_m dT[i,m] T[j,m], T[j,m] = 0 for m > j
            let mut acc = 0.0f32;
            for m in 0..=j {
                acc += dt[i * n + m] * t[j * n + m];
            }
            tmp[i * n + j] = acc;
        }
    }
    let mut dm = vec![0.0f32; n * n];
    for i in 0..n {
        for j in 0..i {
            // (Tᵀ tmp)[i,j] = Σ_m T[m,i] tmp[m,j], T[m,i] = 0 for m < i
            let mut acc = 0.0f32;
            for m in i..n {
                acc += t[m * n + i] * tmp[m * n + j];
            }
            dm[i * n + j] = -acc;
        }
    }
    dm
}
