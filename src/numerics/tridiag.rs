//! Thomas-form LU factorization of tridiagonal systems, used by the neutral fast path of
//! the integrator where every per-axis Crank-Nicolson sub-step is tridiagonal.

/// Factor the tridiagonal system in place. `sub` holds the sub-diagonal (entry 0 unused),
/// `diag` the diagonal and `sup` the super-diagonal (last entry unused). After the call
/// `sub` holds the elimination multipliers and `diag` the pivots.
pub fn factor(sub: &mut [f64], diag: &mut [f64], sup: &[f64]) {
    let n = diag.len();
    for i in 1..n {
        let w = sub[i] / diag[i - 1];
        diag[i] -= w * sup[i - 1];
        sub[i] = w;
    }
}

/// Apply a factorization produced by [`factor`] to a right-hand side, overwriting it with
/// the solution.
pub fn solve(sub: &[f64], diag: &[f64], sup: &[f64], rhs: &mut [f64]) {
    let n = diag.len();
    for i in 1..n {
        rhs[i] -= sub[i] * rhs[i - 1];
    }
    rhs[n - 1] /= diag[n - 1];
    for i in (0..n - 1).rev() {
        rhs[i] = (rhs[i] - sup[i] * rhs[i + 1]) / diag[i];
    }
}

/// Multiply a tridiagonal matrix given by its three diagonals with a vector, overwriting
/// the vector. Used for the explicit half of the neutral Crank-Nicolson step.
pub fn mul_vec(sub: &[f64], diag: &[f64], sup: &[f64], x: &mut [f64], scratch: &mut [f64]) {
    let n = diag.len();
    scratch[..n].copy_from_slice(x);
    for i in 0..n {
        let mut acc = diag[i] * scratch[i];
        if i > 0 {
            acc += sub[i] * scratch[i - 1];
        }
        if i + 1 < n {
            acc += sup[i] * scratch[i + 1];
        }
        x[i] = acc;
    }
}
