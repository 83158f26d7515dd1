use crate::core::MomentError;

/// Sentinel relative size substituted for frozen populations; large enough that drift,
/// measured in units of 1/(4N), is switched off to machine precision.
pub const FROZEN_SIZE: f64 = 1e40;

/// A population size history N(t), with t in units of 2·N_ref generations.
pub enum SizeSchedule {
    /// Sizes constant in time.
    Constant(Vec<f64>),
    /// Sizes given by a function of time.
    Callable(Box<dyn Fn(f64) -> Vec<f64>>),
}

impl SizeSchedule {
    /// A schedule from a constant vector of relative sizes.
    pub fn constant(sizes: Vec<f64>) -> Self {
        SizeSchedule::Constant(sizes)
    }

    /// A schedule from a closure of time.
    pub fn from_fn<F: Fn(f64) -> Vec<f64> + 'static>(f: F) -> Self {
        SizeSchedule::Callable(Box::new(f))
    }

    /// The relative population sizes at time `t`.
    pub fn evaluate(&self, t: f64) -> Vec<f64> {
        match self {
            SizeSchedule::Constant(sizes) => sizes.clone(),
            SizeSchedule::Callable(f) => f(t),
        }
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, SizeSchedule::Constant(_))
    }

    /// Validate the schedule against the number of populations and positivity at t = 0.
    pub fn validate(&self, num_pops: usize) -> Result<(), MomentError> {
        let sizes = self.evaluate(0.0);
        if sizes.len() != num_pops {
            return Err(MomentError::InvalidParameter(
                "size schedule".to_string(),
                format!("{} sizes provided for {} populations", sizes.len(), num_pops),
            ));
        }
        if sizes.iter().any(|&n| !n.is_finite() || n <= 0.0) {
            return Err(MomentError::InvalidParameter(
                "size schedule".to_string(),
                format!("population sizes must be positive and finite, got {:?}", sizes),
            ));
        }
        Ok(())
    }
}

/// Decorator substituting the frozen sentinel size on the frozen axes.
pub struct FrozenSchedule<'a> {
    inner: &'a SizeSchedule,
    frozen: Vec<bool>,
}

impl<'a> FrozenSchedule<'a> {
    pub fn new(inner: &'a SizeSchedule, frozen: Vec<bool>) -> Self {
        Self { inner, frozen }
    }

    pub fn evaluate(&self, t: f64) -> Vec<f64> {
        self.inner
            .evaluate(t)
            .into_iter()
            .zip(&self.frozen)
            .map(|(n, &f)| if f { FROZEN_SIZE } else { n })
            .collect()
    }

    /// Drift-effective sizes over the step [t0, t1]: the harmonic time average of N, with the
    /// reciprocal integrated by Simpson's rule. Constant histories are returned as-is.
    pub fn effective_size(&self, t0: f64, t1: f64) -> Vec<f64> {
        if t1 <= t0 {
            return self.evaluate(t0);
        }
        let a = self.evaluate(t0);
        let m = self.evaluate(0.5 * (t0 + t1));
        let b = self.evaluate(t1);
        a.iter()
            .zip(m.iter())
            .zip(b.iter())
            .map(|((&na, &nm), &nb)| 6.0 / (1.0 / na + 4.0 / nm + 1.0 / nb))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use float_cmp::assert_approx_eq;

    use super::{FrozenSchedule, SizeSchedule, FROZEN_SIZE};

    #[test]
    fn test_constant_schedule() {
        let s = SizeSchedule::constant(vec![1.0, 2.5]);
        assert_eq!(s.evaluate(3.0), vec![1.0, 2.5]);
        assert!(s.validate(2).is_ok());
        assert!(s.validate(3).is_err());
    }

    #[test]
    fn test_callable_schedule_and_frozen_overlay() {
        let s = SizeSchedule::from_fn(|t| vec![1.0 + t, 0.5]);
        let f = FrozenSchedule::new(&s, vec![false, true]);
        let sizes = f.evaluate(1.0);
        assert_approx_eq!(f64, sizes[0], 2.0, epsilon = 1e-12);
        assert_approx_eq!(f64, sizes[1], FROZEN_SIZE, epsilon = 0.0);
    }

    #[test]
    fn test_effective_size_is_harmonic_average() {
        // N alternating around 1: the harmonic mean is below the arithmetic mean
        let s = SizeSchedule::from_fn(|t| vec![if t < 0.5 { 0.5 } else { 2.0 }]);
        let f = FrozenSchedule::new(&s, vec![false]);
        let eff = f.effective_size(0.0, 1.0)[0];
        assert_approx_eq!(f64, eff, 6.0 / (2.0 + 2.0 + 0.5), epsilon = 1e-12);
    }
}
