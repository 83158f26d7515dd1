//! Single-axis operators of the moment system: drift, the two selection parts, and the
//! mutation models. The system integrated in internal time T = 2t reads
//!
//!   dPhi/dT = B(N) + (D/(4N) + gamma*h*S1 + gamma*(1-2h)*S2) Phi
//!
//! with D the Moran drift operator, S1 the additive selection part and S2 the dominance
//! deviation, both closed through the jackknife matrices.

use nalgebra::{DMatrix, DVector};
use ndarray::{ArrayD, IxDyn};

use crate::core::{MomentError, Spectrum};
use crate::utils::solve_linear_system;

/// The tridiagonal drift operator on a single axis with d = n + 1 entries:
/// row i couples (i-1, i, i+1) with coefficients (i-1)(n-i+1), -2i(n-i), (i+1)(n-i-1).
pub fn drift_matrix(d: usize) -> DMatrix<f64> {
    let n = (d - 1) as f64;
    let mut m = DMatrix::<f64>::zeros(d, d);
    for row in 0..d {
        let i = row as f64;
        m[(row, row)] = -2.0 * i * (n - i);
        if row > 0 {
            m[(row, row - 1)] = (i - 1.0) * (n - i + 1.0);
        }
        if row + 1 < d {
            m[(row, row + 1)] = (i + 1.0) * (n - i - 1.0);
        }
    }
    m
}

/// The three diagonals (sub, diag, sup) of [`drift_matrix`], for the tridiagonal fast path.
pub fn drift_diagonals(d: usize) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let n = (d - 1) as f64;
    let mut sub = vec![0.0; d];
    let mut diag = vec![0.0; d];
    let mut sup = vec![0.0; d];
    for row in 0..d {
        let i = row as f64;
        diag[row] = -2.0 * i * (n - i);
        if row > 0 {
            sub[row] = (i - 1.0) * (n - i + 1.0);
        }
        if row + 1 < d {
            sup[row] = (i + 1.0) * (n - i - 1.0);
        }
    }
    (sub, diag, sup)
}

/// The additive selection operator (the part proportional to gamma*h), closed back to the
/// n-sample basis with the order-1 jackknife.
pub fn selection_h(d: usize, jk13: &DMatrix<f64>) -> Result<DMatrix<f64>, MomentError> {
    let n = d - 1;
    if jk13.nrows() != d + 1 || jk13.ncols() != d {
        return Err(MomentError::OperatorDimension(
            "jackknife order 1".to_string(),
            jk13.nrows(),
            d + 1,
        ));
    }
    let nf = n as f64;
    // flux on the (n+1)-sample basis
    let mut s = DMatrix::<f64>::zeros(d, d + 1);
    for row in 0..d {
        let i = row as f64;
        s[(row, row)] = i * (nf + 1.0 - i) / (nf + 1.0);
        s[(row, row + 1)] = -(i + 1.0) * (nf - i) / (nf + 1.0);
    }
    Ok(s * jk13)
}

/// The dominance-deviation selection operator (the part proportional to gamma*(1-2h)),
/// closed with the order-2 jackknife.
pub fn selection_dominance(d: usize, jk23: &DMatrix<f64>) -> Result<DMatrix<f64>, MomentError> {
    let n = d - 1;
    if jk23.nrows() != d + 2 || jk23.ncols() != d {
        return Err(MomentError::OperatorDimension(
            "jackknife order 2".to_string(),
            jk23.nrows(),
            d + 2,
        ));
    }
    let nf = n as f64;
    let denom = (nf + 1.0) * (nf + 2.0);
    let mut s = DMatrix::<f64>::zeros(d, d + 2);
    for row in 0..d {
        let i = row as f64;
        s[(row, row + 1)] = i * (i + 1.0) * (nf + 1.0 - i) / denom;
        s[(row, row + 2)] = -(nf - i) * (i + 1.0) * (i + 2.0) / denom;
    }
    Ok(s * jk23)
}

/// The infinite-sites mutation source: density n_k * u_k injected on the singleton face of
/// each axis.
pub fn mutation_source(shape: &[usize], u: &[f64]) -> ArrayD<f64> {
    let mut b = ArrayD::<f64>::zeros(IxDyn(shape));
    for (axis, (&d, &rate)) in shape.iter().zip(u).enumerate() {
        let mut idx = vec![0usize; shape.len()];
        idx[axis] = 1;
        b[IxDyn(&idx)] += (d - 1) as f64 * rate;
    }
    b
}

/// The reversible (finite-genome) per-axis mutation operator with forward rate u and
/// backward rate v: ancestral lineages mutate in at rate u, derived lineages back at v.
pub fn reversible_mutation(d: usize, u: f64, v: f64) -> DMatrix<f64> {
    let n = (d - 1) as f64;
    let mut m = DMatrix::<f64>::zeros(d, d);
    for row in 0..d {
        let i = row as f64;
        m[(row, row)] = -((n - i) * u + i * v);
        if row > 0 {
            m[(row, row - 1)] = (n - i + 1.0) * u;
        }
        if row + 1 < d {
            m[(row, row + 1)] = (i + 1.0) * v;
        }
    }
    m
}

/// The neutral one-population equilibrium phi_k = theta / k, with the absorbing corners
/// masked.
pub fn steady_state_1d(n: usize, theta: f64) -> Result<Spectrum, MomentError> {
    if n < 2 {
        return Err(MomentError::SampleSizeTooSmall(
            n,
            "the neutral steady state".to_string(),
        ));
    }
    let mut data = ArrayD::<f64>::zeros(IxDyn(&[n + 1]));
    for k in 1..=n {
        data[IxDyn(&[k])] = theta / k as f64;
    }
    Spectrum::new(data, None, None, false, true)
}

/// The equilibrium of the reversible-mutation drift/selection system, obtained as the
/// normalized null vector of the generator. Finite mass sits on both fixation classes.
///
/// # Arguments
///
/// * `n`: Haploid sample size.
/// * `theta_fd`: Scaled forward mutation rate.
/// * `theta_bd`: Scaled backward mutation rate.
/// * `gamma`: Scaled selection coefficient.
/// * `h`: Dominance coefficient.
///
/// returns: `Result<Spectrum, MomentError>`, normalized to unit total mass and unmasked.
pub fn steady_state_1d_reversible(
    n: usize,
    theta_fd: f64,
    theta_bd: f64,
    gamma: f64,
    h: f64,
) -> Result<Spectrum, MomentError> {
    if theta_fd <= 0.0 || theta_bd <= 0.0 {
        return Err(MomentError::InvalidParameter(
            "theta_fd/theta_bd".to_string(),
            "the reversible model needs positive forward and backward rates".to_string(),
        ));
    }
    let d = n + 1;
    let jk13 = super::jackknife::closure_matrix(n, 1)?;
    let jk23 = super::jackknife::closure_matrix(n, 2)?;
    let mut a = drift_matrix(d) / 4.0;
    a += selection_h(d, &jk13)? * (gamma * h);
    a += selection_dominance(d, &jk23)? * (gamma * (1.0 - 2.0 * h));
    a += reversible_mutation(d, theta_fd / 4.0, theta_bd / 4.0);

    // stack a normalization row on the singular generator: the least-squares solution of
    // [A; 1^T] phi = e_last is the unit-mass equilibrium
    let mut stacked = DMatrix::<f64>::zeros(d + 1, d);
    stacked.view_mut((0, 0), (d, d)).copy_from(&a);
    for c in 0..d {
        stacked[(d, c)] = 1.0;
    }
    let mut rhs = DVector::<f64>::zeros(d + 1);
    rhs[d] = 1.0;
    let phi = solve_linear_system(&stacked, &rhs)?;

    let data = ArrayD::from_shape_vec(IxDyn(&[d]), phi.as_slice().to_vec())
        .map_err(|e| MomentError::Generic(e.to_string()))?;
    Spectrum::new(data, None, None, false, false)
}

/// A safe time step for the current sizes and selection strengths: a fraction of the
/// shortest of the drift and selection timescales.
pub fn compute_dt(sizes: &[f64], gamma: &[f64], h: &[f64], timescale_factor: f64) -> f64 {
    let mut timescale = sizes.iter().fold(f64::INFINITY, |acc, &n| acc.min(2.0 * n));
    for (&g, &hh) in gamma.iter().zip(h) {
        let rate = (g * hh).abs().max((g * (1.0 - 2.0 * hh)).abs());
        if rate > 0.0 {
            timescale = timescale.min(1.0 / rate);
        }
    }
    timescale_factor * timescale
}

#[cfg(test)]
mod tests {
    use nalgebra::DVector;

    use super::*;
    use crate::numerics::jackknife::closure_matrix;

    #[test]
    fn test_drift_conserves_mass() {
        // the columns of the drift operator sum to zero
        let d = 12;
        let m = drift_matrix(d);
        for c in 0..d {
            let col_sum: f64 = (0..d).map(|r| m[(r, c)]).sum();
            assert!(col_sum.abs() < 1e-12, "column {} sums to {}", c, col_sum);
        }
    }

    #[test]
    fn test_neutral_equilibrium_is_stationary() {
        // D (theta/k) / 4 + B = 0 on the interior frequency classes
        let n = 15;
        let d = n + 1;
        let m = drift_matrix(d);
        let phi = DVector::from_fn(d, |k, _| if k == 0 { 0.0 } else { 1.0 / k as f64 });
        let b = mutation_source(&[d], &[0.25]);
        let residual = &m * &phi / 4.0;
        for k in 1..n {
            let r = residual[k] + b[IxDyn(&[k])];
            assert!(r.abs() < 1e-12, "class {} has residual {}", k, r);
        }
    }

    #[test]
    fn test_selection_operators_conserve_mass() {
        let n = 20;
        let d = n + 1;
        let s1 = selection_h(d, &closure_matrix(n, 1).unwrap()).unwrap();
        let s2 = selection_dominance(d, &closure_matrix(n, 2).unwrap()).unwrap();
        for c in 0..d {
            let sum1: f64 = (0..d).map(|r| s1[(r, c)]).sum();
            let sum2: f64 = (0..d).map(|r| s2[(r, c)]).sum();
            assert!(sum1.abs() < 1e-10);
            assert!(sum2.abs() < 1e-10);
        }
    }

    #[test]
    fn test_reversible_steady_state_is_stationary_and_massive_at_fixation() {
        let n = 20;
        let (theta_fd, theta_bd, gamma, h) = (2e-3, 1e-3, -1.5, 0.3);
        let eq = steady_state_1d_reversible(n, theta_fd, theta_bd, gamma, h).unwrap();
        let phi = DVector::from_iterator(n + 1, eq.data().iter().copied());

        // unit mass, with most of it at the fixation classes for tiny theta
        assert!((phi.sum() - 1.0).abs() < 1e-10);
        assert!(phi[0] > 0.1 && phi[n] > 0.0);

        // stationarity of the full generator
        let jk13 = closure_matrix(n, 1).unwrap();
        let jk23 = closure_matrix(n, 2).unwrap();
        let mut a = drift_matrix(n + 1) / 4.0;
        a += selection_h(n + 1, &jk13).unwrap() * (gamma * h);
        a += selection_dominance(n + 1, &jk23).unwrap() * (gamma * (1.0 - 2.0 * h));
        a += reversible_mutation(n + 1, theta_fd / 4.0, theta_bd / 4.0);
        let residual = a * &phi;
        assert!(residual.amax() < 1e-9);
    }

    #[test]
    fn test_compute_dt_tracks_smallest_timescale() {
        let dt_neutral = compute_dt(&[1.0, 0.05], &[0.0, 0.0], &[0.5, 0.5], 0.1);
        assert!((dt_neutral - 0.01).abs() < 1e-12);
        let dt_selected = compute_dt(&[1.0], &[50.0], &[0.5], 0.1);
        assert!((dt_selected - 0.1 / 25.0).abs() < 1e-12);
    }
}
