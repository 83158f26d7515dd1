pub mod algebra;

pub use algebra::{all_close, bicgstab, nnls, solve_linear_system};

use statrs::function::gamma::ln_gamma;

/// Natural log of the binomial coefficient C(n, k).
pub fn ln_binomial(n: f64, k: f64) -> f64 {
    ln_gamma(n + 1.0) - ln_gamma(k + 1.0) - ln_gamma(n - k + 1.0)
}

/// The binomial coefficient C(n, k) as a float, computed in log space so that the
/// hypergeometric projection weights stay finite at large sample sizes.
pub fn binomial(n: usize, k: usize) -> f64 {
    if k > n {
        return 0.0;
    }
    ln_binomial(n as f64, k as f64).exp()
}

#[cfg(test)]
pub(crate) mod test_utils {
    use crate::utils::all_close;

    /// Panic unless the two arrays match element-wise within the given tolerances.
    pub fn assert_approx_array_eq(found: &[f64], expected: &[f64], r_tol: Option<f64>, a_tol: Option<f64>) {
        assert_eq!(
            found.len(),
            expected.len(),
            "array lengths differ: {} vs {}",
            found.len(),
            expected.len()
        );
        assert!(
            all_close(found, expected, r_tol, a_tol),
            "arrays differ beyond tolerance:\n  found:    {:?}\n  expected: {:?}",
            found,
            expected
        );
    }
}

#[cfg(test)]
mod tests {
    use float_cmp::assert_approx_eq;

    use super::binomial;

    #[test]
    fn test_binomial() {
        assert_approx_eq!(f64, binomial(5, 2), 10.0, epsilon = 1e-9);
        assert_approx_eq!(f64, binomial(10, 0), 1.0, epsilon = 1e-12);
        assert!((binomial(60, 30) / 1.18264581564861424e17 - 1.0).abs() < 1e-10);
        assert_approx_eq!(f64, binomial(4, 5), 0.0, epsilon = 0.0);
    }
}
