use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use nalgebra::{DMatrix, Matrix3, Vector3};

use crate::core::MomentError;

/// Moment of the n-sample binomial sampling kernel against x^r, r in {0, 1, 2}:
/// the image of the monomial basis under the sampling operator. These are the
/// quantities matched by the quadratic closure.
fn kernel_moment(n: usize, i: usize, r: usize) -> f64 {
    let n = n as f64;
    let i = i as f64;
    match r {
        0 => 1.0 / (n + 1.0),
        1 => (i + 1.0) / ((n + 1.0) * (n + 2.0)),
        _ => (i + 1.0) * (i + 2.0) / ((n + 1.0) * (n + 2.0) * (n + 3.0)),
    }
}

/// Build the order-k jackknife closure matrix taking an (n+1)-entry moment vector to the
/// (n+1+k)-entry extrapolated vector, k in {1, 2}. Each target entry is a combination of
/// three consecutive source entries, chosen so that the extrapolation is exact whenever the
/// underlying density is locally quadratic; near the frequency extremes the stencil clamps
/// to a one-sided quadratic.
pub fn closure_matrix(n: usize, k: usize) -> Result<DMatrix<f64>, MomentError> {
    if n < 2 {
        return Err(MomentError::SampleSizeTooSmall(
            n,
            "the jackknife closure".to_string(),
        ));
    }
    if !(1..=2).contains(&k) {
        return Err(MomentError::InvalidParameter(
            "order".to_string(),
            format!("the jackknife order must be 1 or 2, not {}", k),
        ));
    }
    let rows = n + 1 + k;
    let cols = n + 1;
    let mut jk = DMatrix::<f64>::zeros(rows, cols);

    for i in 0..rows {
        // center the stencil on the rescaled frequency class
        let center = ((i as f64) * (n as f64) / ((n + k) as f64)).round() as i64;
        let j0 = center.clamp(1, n as i64 - 1) as usize;
        let stencil = [j0 - 1, j0, j0 + 1];

        let mat = Matrix3::from_fn(|r, c| kernel_moment(n, stencil[c], r));
        let rhs = Vector3::from_fn(|r, _| kernel_moment(n + k, i, r));
        let alpha = mat.lu().solve(&rhs).ok_or_else(|| {
            MomentError::LinearSolver(format!(
                "singular jackknife stencil at n = {}, target {}",
                n, i
            ))
        })?;
        for (c, &j) in stencil.iter().enumerate() {
            jk[(i, j)] = alpha[c];
        }
    }
    Ok(jk)
}

/// Bounded cache of jackknife matrices keyed by (sample size, order).
pub struct JackknifeCache {
    entries: HashMap<(usize, usize), Rc<DMatrix<f64>>>,
    recency: VecDeque<(usize, usize)>,
    capacity: usize,
}

impl Default for JackknifeCache {
    fn default() -> Self {
        Self::with_capacity(64)
    }
}

impl JackknifeCache {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            recency: VecDeque::new(),
            capacity,
        }
    }

    /// The closure matrix for the given sample size and order, built on first use.
    pub fn get(&mut self, n: usize, order: usize) -> Result<Rc<DMatrix<f64>>, MomentError> {
        let key = (n, order);
        if let Some(found) = self.entries.get(&key) {
            return Ok(Rc::clone(found));
        }
        let built = Rc::new(closure_matrix(n, order)?);
        if self.entries.len() >= self.capacity {
            if let Some(oldest) = self.recency.pop_front() {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(key, Rc::clone(&built));
        self.recency.push_back(key);
        Ok(built)
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::DVector;

    use super::{closure_matrix, JackknifeCache};
    use crate::utils::test_utils::assert_approx_array_eq;

    /// Moments of a polynomial density x^p sampled with n lineages.
    fn sampled_moments(n: usize, p: usize) -> DVector<f64> {
        DVector::from_fn(n + 1, |i, _| {
            let mut v = 1.0;
            for t in 1..=p {
                v *= (i + t) as f64;
            }
            for t in 1..=(p + 1) {
                v /= (n + t) as f64;
            }
            v
        })
    }

    #[test]
    fn test_exact_for_quadratic_densities() {
        // the closure must reproduce the moments of 1, x and x^2 exactly, at both orders
        for n in [5usize, 12, 30] {
            for k in [1usize, 2] {
                let jk = closure_matrix(n, k).unwrap();
                for p in 0..=2 {
                    let extrapolated = &jk * sampled_moments(n, p);
                    let exact = sampled_moments(n + k, p);
                    assert_approx_array_eq(
                        extrapolated.as_slice(),
                        exact.as_slice(),
                        Some(1e-10),
                        Some(1e-14),
                    );
                }
            }
        }
    }

    #[test]
    fn test_rows_use_three_point_stencils() {
        let jk = closure_matrix(10, 1).unwrap();
        for i in 0..jk.nrows() {
            let nonzero = (0..jk.ncols()).filter(|&j| jk[(i, j)] != 0.0).count();
            assert!(nonzero <= 3, "row {} has {} nonzero entries", i, nonzero);
        }
    }

    #[test]
    fn test_cache_reuses_matrices() {
        let mut cache = JackknifeCache::with_capacity(2);
        let a = cache.get(8, 1).unwrap();
        let b = cache.get(8, 1).unwrap();
        assert!(std::rc::Rc::ptr_eq(&a, &b));
        cache.get(9, 1).unwrap();
        cache.get(10, 1).unwrap(); // evicts (8, 1)
        let c = cache.get(8, 1).unwrap();
        assert!(!std::rc::Rc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_rejects_tiny_samples() {
        assert!(closure_matrix(1, 1).is_err());
        assert!(closure_matrix(5, 3).is_err());
    }
}
