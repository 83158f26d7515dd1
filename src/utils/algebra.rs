use log::warn;
use nalgebra::{DMatrix, DVector, SVD};
use sprs::CsMat;

use crate::core::MomentError;

/// Returns `true` if two arrays are element-wise equal within a tolerance. This behaves as the
/// numpy implementation at <https://numpy.org/doc/stable/reference/generated/numpy.allclose.html>.
///
/// # Arguments
///
/// * `a`: First vector to compare.
/// * `b`: Second vector to compare.
/// * `r_tol`: The relative tolerance parameter.
/// * `a_tol`: The absolute tolerance parameter.
///
/// returns: `bool`
pub fn all_close(a: &[f64], b: &[f64], r_tol: Option<f64>, a_tol: Option<f64>) -> bool {
    let r_tol = r_tol.unwrap_or(1e-05);
    let a_tol = a_tol.unwrap_or(1e-08);

    a.len() == b.len()
        && a.iter()
            .zip(b)
            .all(|(v1, v2)| (v1 - v2).abs() <= (a_tol + r_tol * v2.abs()))
}

/// Return the least-squares solution to a linear matrix equation using singular value
/// decomposition (SVD). This solves the linear system `A * x = b`, where `A` is the coefficient
/// matrix of the linear system, `b` the dependent variable and `x` the unknown. For
/// under-determined systems the minimum-norm solution is returned.
///
/// # Arguments
///
/// * `a`: The coefficient matrix.
/// * `b`: The column vector b.
///
/// returns: `Result<DVector<f64>, MomentError>`
pub fn solve_linear_system(a: &DMatrix<f64>, b: &DVector<f64>) -> Result<DVector<f64>, MomentError> {
    if a.nrows() != b.len() {
        return Err(MomentError::LinearSolver(format!(
            "the number of rows in A ({}) must match the size of b ({})",
            a.nrows(),
            b.len()
        )));
    }
    let svd = SVD::new(a.clone(), true, true);
    // rank cutoff relative to the largest singular value
    let cutoff = f64::EPSILON.sqrt() * svd.singular_values.max().max(f64::MIN_POSITIVE);
    svd.solve(b, cutoff)
        .map_err(|e| MomentError::LinearSolver(e.to_string()))
}

/// Solve `argmin_x || A x - b ||_2` subject to `x >= 0` with the Lawson-Hanson active-set
/// method. On hitting the iteration cap the best parameters found so far are returned together
/// with the residual norm, and a warning is emitted rather than an error.
///
/// # Arguments
///
/// * `a`: The coefficient matrix.
/// * `b`: Right-hand side vector.
///
/// returns: `Result<(DVector<f64>, f64), MomentError>`. The solution vector and `||Ax - b||_2`.
pub fn nnls(a: &DMatrix<f64>, b: &DVector<f64>) -> Result<(DVector<f64>, f64), MomentError> {
    let (m, n) = a.shape();
    if b.len() != m {
        return Err(MomentError::LinearSolver(format!(
            "incompatible dimensions in nnls: A is {}x{}, b has size {}",
            m,
            n,
            b.len()
        )));
    }

    let mut x = DVector::<f64>::zeros(n);
    let mut passive = vec![false; n];
    let max_iter = 3 * n.max(10);
    let mut iter = 0;

    loop {
        // w = A^T (b - A x), the negative gradient
        let residual = b - a * &x;
        let w = a.transpose() * &residual;

        // pick the most promising zero-bound variable
        let candidate = (0..n)
            .filter(|&j| !passive[j])
            .max_by(|&p, &q| w[p].total_cmp(&w[q]));
        let j_star = match candidate {
            Some(j) if w[j] > 1e-12 => j,
            _ => break,
        };
        passive[j_star] = true;

        loop {
            iter += 1;
            if iter > max_iter {
                warn!("too many iterations in nnls; returning best-effort parameters");
                let rnorm = (b - a * &x).norm();
                return Ok((x, rnorm));
            }

            // unconstrained least squares on the passive set
            let cols: Vec<usize> = (0..n).filter(|&j| passive[j]).collect();
            let sub = a.select_columns(cols.iter());
            let z_sub = solve_linear_system(&sub, b)?;
            let mut z = DVector::<f64>::zeros(n);
            for (pos, &j) in cols.iter().enumerate() {
                z[j] = z_sub[pos];
            }

            if cols.iter().all(|&j| z[j] > 0.0) {
                x = z;
                break;
            }

            // step back to the feasible boundary and drop the binding variables
            let mut alpha = f64::INFINITY;
            for &j in &cols {
                if z[j] <= 0.0 {
                    let a_j = x[j] / (x[j] - z[j]);
                    if a_j < alpha {
                        alpha = a_j;
                    }
                }
            }
            x = &x + alpha * (&z - &x);
            for j in 0..n {
                if passive[j] && x[j].abs() < 1e-14 {
                    passive[j] = false;
                    x[j] = 0.0;
                }
            }
        }
    }

    let rnorm = (b - a * &x).norm();
    Ok((x, rnorm))
}

/// Solve the sparse linear system `A x = b` with the Jacobi-preconditioned BiCGSTAB iteration.
/// The Crank-Nicolson matrices handed to this solver are strictly diagonally dominant at the
/// step sizes the integrators choose, where the iteration converges in a handful of steps.
///
/// # Arguments
///
/// * `a`: The CSR coefficient matrix.
/// * `b`: Right-hand side vector.
/// * `x0`: Starting guess, typically the previous time step.
/// * `tol`: Relative residual tolerance.
///
/// returns: `Result<Vec<f64>, MomentError>`
pub fn bicgstab(a: &CsMat<f64>, b: &[f64], x0: &[f64], tol: f64) -> Result<Vec<f64>, MomentError> {
    let n = b.len();
    if a.rows() != n || a.cols() != n {
        return Err(MomentError::LinearSolver(format!(
            "bicgstab needs a square {}x{} system, got {}x{}",
            n,
            n,
            a.rows(),
            a.cols()
        )));
    }

    let inv_diag: Vec<f64> = (0..n)
        .map(|i| {
            let d = a.get(i, i).copied().unwrap_or(0.0);
            if d.abs() < f64::MIN_POSITIVE {
                1.0
            } else {
                1.0 / d
            }
        })
        .collect();

    let spmv = |x: &[f64], y: &mut [f64]| {
        y.iter_mut().for_each(|v| *v = 0.0);
        for (row, vec) in a.outer_iterator().enumerate() {
            let mut acc = 0.0;
            for (col, &val) in vec.iter() {
                acc += val * x[col];
            }
            y[row] = acc;
        }
    };

    let b_norm = b.iter().map(|v| v * v).sum::<f64>().sqrt();
    if b_norm == 0.0 {
        return Ok(vec![0.0; n]);
    }

    let mut x = x0.to_vec();
    let mut ax = vec![0.0; n];
    spmv(&x, &mut ax);
    let mut r: Vec<f64> = b.iter().zip(&ax).map(|(bi, axi)| bi - axi).collect();
    let r_hat = r.clone();
    let mut rho = 1.0;
    let mut alpha = 1.0;
    let mut omega = 1.0;
    let mut v = vec![0.0; n];
    let mut p = vec![0.0; n];
    let mut t = vec![0.0; n];
    let max_iter = 1000;

    for _ in 0..max_iter {
        let rho_next: f64 = r_hat.iter().zip(&r).map(|(a, b)| a * b).sum();
        if rho_next.abs() < f64::MIN_POSITIVE {
            break;
        }
        let beta = (rho_next / rho) * (alpha / omega);
        rho = rho_next;
        for i in 0..n {
            p[i] = r[i] + beta * (p[i] - omega * v[i]);
        }
        let p_hat: Vec<f64> = p.iter().zip(&inv_diag).map(|(pi, di)| pi * di).collect();
        spmv(&p_hat, &mut v);
        let denom: f64 = r_hat.iter().zip(&v).map(|(a, b)| a * b).sum();
        if denom.abs() < f64::MIN_POSITIVE {
            break;
        }
        alpha = rho / denom;
        let s: Vec<f64> = r.iter().zip(&v).map(|(ri, vi)| ri - alpha * vi).collect();
        let s_norm = s.iter().map(|v| v * v).sum::<f64>().sqrt();
        if s_norm <= tol * b_norm {
            for i in 0..n {
                x[i] += alpha * p_hat[i];
            }
            return Ok(x);
        }
        let s_hat: Vec<f64> = s.iter().zip(&inv_diag).map(|(si, di)| si * di).collect();
        spmv(&s_hat, &mut t);
        let tt: f64 = t.iter().map(|v| v * v).sum();
        if tt.abs() < f64::MIN_POSITIVE {
            break;
        }
        omega = t.iter().zip(&s).map(|(a, b)| a * b).sum::<f64>() / tt;
        for i in 0..n {
            x[i] += alpha * p_hat[i] + omega * s_hat[i];
            r[i] = s[i] - omega * t[i];
        }
        let r_norm = r.iter().map(|v| v * v).sum::<f64>().sqrt();
        if r_norm <= tol * b_norm {
            return Ok(x);
        }
    }

    spmv(&x, &mut ax);
    let r_norm = b
        .iter()
        .zip(&ax)
        .map(|(bi, axi)| (bi - axi) * (bi - axi))
        .sum::<f64>()
        .sqrt();
    if r_norm <= 1e-8 * b_norm.max(1.0) {
        Ok(x)
    } else {
        Err(MomentError::LinearSolver(format!(
            "bicgstab did not converge: relative residual {:.3e}",
            r_norm / b_norm
        )))
    }
}

#[cfg(test)]
mod tests {
    use float_cmp::assert_approx_eq;
    use nalgebra::{DMatrix, DVector};
    use sprs::TriMat;

    use super::{all_close, bicgstab, nnls, solve_linear_system};

    #[test]
    /// Test the least-squares solver on a full-rank linear system.
    fn test_linear_system() {
        // solve x +9y -5z = -32 / -3x -5y -5z = -10 / -2x - 7y +z = 13
        let a = DMatrix::from_row_slice(
            3,
            3,
            &[1.0, 9.0, -5.0, -3.0, -5.0, -5.0, -2.0, -7.0, 1.0],
        );
        let b = DVector::from_vec(vec![-32.0, -10.0, 13.0]);
        let x = solve_linear_system(&a, &b).unwrap();

        assert!(all_close(x.as_slice(), &[5.0, -3.0, 2.0], None, Some(1e-9)));
    }

    #[test]
    /// Test least squares with linear regression. Example from numpy's lstsq documentation.
    fn test_linear_regression() {
        let a = DMatrix::from_row_slice(4, 2, &[0.0, 1.0, 1.0, 1.0, 2.0, 1.0, 3.0, 1.0]);
        let b = DVector::from_vec(vec![-1.0, 0.2, 0.9, 2.1]);

        let x = solve_linear_system(&a, &b).unwrap();
        assert_approx_eq!(f64, x[0], 1.0, epsilon = 0.0001);
        assert_approx_eq!(f64, x[1], -0.95, epsilon = 0.0001);
    }

    #[test]
    fn test_nnls_recovers_nonnegative_solution() {
        let a = DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
        let truth = DVector::from_vec(vec![0.5, 2.0]);
        let b = &a * &truth;
        let (x, rnorm) = nnls(&a, &b).unwrap();
        assert_approx_eq!(f64, x[0], 0.5, epsilon = 1e-10);
        assert_approx_eq!(f64, x[1], 2.0, epsilon = 1e-10);
        assert!(rnorm < 1e-10);
    }

    #[test]
    fn test_nnls_clips_negative_component() {
        // the unconstrained solution has a negative entry; nnls must clip it to zero
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, 1.0]);
        let b = DVector::from_vec(vec![-1.0, 2.0]);
        let (x, rnorm) = nnls(&a, &b).unwrap();
        assert_approx_eq!(f64, x[0], 0.0, epsilon = 1e-12);
        assert_approx_eq!(f64, x[1], 2.0, epsilon = 1e-12);
        assert_approx_eq!(f64, rnorm, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_bicgstab_matches_dense_solution() {
        let n = 20;
        let mut tri = TriMat::new((n, n));
        for i in 0..n {
            tri.add_triplet(i, i, 4.0 + (i as f64) * 0.1);
            if i > 0 {
                tri.add_triplet(i, i - 1, -1.0);
            }
            if i + 1 < n {
                tri.add_triplet(i, i + 1, -0.5);
            }
        }
        let a = tri.to_csr();
        let b: Vec<f64> = (0..n).map(|i| (i as f64).sin() + 1.0).collect();
        let x = bicgstab(&a, &b, &vec![0.0; n], 1e-13).unwrap();

        let mut dense = DMatrix::<f64>::zeros(n, n);
        for (row, vec) in a.outer_iterator().enumerate() {
            for (col, &val) in vec.iter() {
                dense[(row, col)] = val;
            }
        }
        let x_dense = dense
            .lu()
            .solve(&DVector::from_vec(b.clone()))
            .unwrap();
        assert!(all_close(&x, x_dense.as_slice(), Some(1e-8), Some(1e-10)));
    }
}
