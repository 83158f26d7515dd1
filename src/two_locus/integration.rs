//! Semi-implicit integration of the two-locus moment system on the simplex. Drift is
//! advanced by Crank-Nicolson with the sparse system solved iteratively; recombination
//! and selection act explicitly through the jackknife-closed (n -> n+1) operators; the
//! per-axis decoupling of the one-locus integrator is not available here, so each step is
//! one sparse solve over the whole simplex.

use std::collections::HashMap;
use std::rc::Rc;

use log::{info, warn};
use ordered_float::OrderedFloat;
use sprs::{CsMat, TriMat};

use crate::core::{MomentError, SizeSchedule};
use crate::two_locus::numerics::{
    drift, drift_reversible, jackknife, mutations_ism, mutations_reversible,
    mutations_reversible_alternate, recombination, selection, SimplexIndex,
};
use crate::two_locus::TwoLocusSpectrum;
use crate::utils::bicgstab;

/// Options for the two-locus integrator.
pub struct TwoLocusOptions {
    /// Scaled recombination rate rho = 4 N_ref r between the two loci.
    pub rho: f64,
    /// Time step, in units of 2 N_ref generations.
    pub dt: f64,
    /// Scaled mutation rate for the infinite-sites source.
    pub theta: f64,
    /// Scaled selection coefficient at the left locus; shorthand for
    /// `sel_params = [gamma, gamma, 0]`.
    pub gamma: f64,
    /// Dominance coefficient; only the additive value 1/2 is representable here.
    pub h: f64,
    /// Haplotype fitnesses (s_AB, s_A, s_B); overrides `gamma` when set.
    pub sel_params: Option<[f64; 3]>,
    /// Use the reversible mutation model with rates `u` and `v`.
    pub finite_genome: bool,
    /// Left-locus mutation rate of the reversible model (equal in both directions).
    pub u: Option<f64>,
    /// Right-locus mutation rate of the reversible model.
    pub v: Option<f64>,
    /// Use the boundary-injection variant of the reversible model, which recycles
    /// density reaching the fixed classes.
    pub alternate_fg: bool,
    /// Report progress through `log::info!`.
    pub verbose: bool,
}

impl Default for TwoLocusOptions {
    fn default() -> Self {
        Self {
            rho: 0.0,
            dt: 0.01,
            theta: 1.0,
            gamma: 0.0,
            h: 0.5,
            sel_params: None,
            finite_genome: false,
            u: None,
            v: None,
            alternate_fg: false,
            verbose: false,
        }
    }
}

/// Crank-Nicolson matrices (I -+ dt/(4 nu) D) built from the drift triplets.
fn cn_matrices(d: &CsMat<f64>, c: f64) -> (CsMat<f64>, CsMat<f64>) {
    let size = d.rows();
    let mut explicit = TriMat::new((size, size));
    let mut implicit = TriMat::new((size, size));
    for i in 0..size {
        explicit.add_triplet(i, i, 1.0);
        implicit.add_triplet(i, i, 1.0);
    }
    for (row, vec) in d.outer_iterator().enumerate() {
        for (col, &val) in vec.iter() {
            explicit.add_triplet(row, col, c * val);
            implicit.add_triplet(row, col, -c * val);
        }
    }
    (explicit.to_csr(), implicit.to_csr())
}

fn spmv_acc(m: &CsMat<f64>, x: &[f64], factor: f64, out: &mut [f64]) {
    for (row, vec) in m.outer_iterator().enumerate() {
        let mut acc = 0.0;
        for (col, &val) in vec.iter() {
            acc += val * x[col];
        }
        out[row] += factor * acc;
    }
}

/// Advance a two-locus spectrum forward in time.
///
/// # Arguments
///
/// * `fs`: The spectrum, mutated in place.
/// * `nu`: Relative population size over time, one population.
/// * `t_f`: Integration time in units of 2 N_ref generations.
/// * `opts`: Recombination, selection and mutation settings.
///
/// returns: `Result<(), MomentError>`
pub fn integrate(
    fs: &mut TwoLocusSpectrum,
    nu: &SizeSchedule,
    t_f: f64,
    opts: &TwoLocusOptions,
) -> Result<(), MomentError> {
    nu.validate(1)?;
    if t_f < 0.0 || !t_f.is_finite() {
        return Err(MomentError::InvalidParameter(
            "t_f".to_string(),
            format!("integration time must be non-negative, got {}", t_f),
        ));
    }
    if t_f == 0.0 {
        return Ok(());
    }
    if opts.dt <= 0.0 {
        return Err(MomentError::InvalidParameter(
            "dt".to_string(),
            format!("the time step must be positive, got {}", opts.dt),
        ));
    }
    if opts.h != 0.5 {
        return Err(MomentError::InvalidParameter(
            "h".to_string(),
            "the two-locus system only carries additive selection (h = 1/2)".to_string(),
        ));
    }

    let n = fs.sample_size();
    let idx = SimplexIndex::new(n);

    let sel_params = match (opts.sel_params, opts.gamma) {
        (Some(p), _) => Some(p),
        (None, g) if g != 0.0 => Some([g, g, 0.0]),
        _ => None,
    };

    // jackknife-closed explicit operator for recombination and selection
    let closed_explicit: Option<CsMat<f64>> = if opts.rho != 0.0 || sel_params.is_some() {
        let idx_up = SimplexIndex::new(n + 1);
        let mut op = recombination(&idx, &idx_up).map(|v| v * opts.rho);
        if let Some(p) = sel_params {
            op = &op + &selection(&idx, &idx_up, p);
        }
        let jk = jackknife(&idx, &idx_up)?;
        Some(&op * &jk)
    } else {
        None
    };

    let drift_op = if opts.finite_genome {
        drift_reversible(&idx)
    } else {
        drift(&idx)
    };

    enum Mutation {
        InfiniteSites { source: Vec<f64>, second: CsMat<f64> },
        Reversible(CsMat<f64>),
    }
    let mutation = if opts.finite_genome {
        let u = opts.u.ok_or_else(|| {
            MomentError::InvalidParameter(
                "u".to_string(),
                "the finite-genome model needs a left-locus rate".to_string(),
            )
        })?;
        let v = opts.v.ok_or_else(|| {
            MomentError::InvalidParameter(
                "v".to_string(),
                "the finite-genome model needs a right-locus rate".to_string(),
            )
        })?;
        if opts.alternate_fg {
            Mutation::Reversible(mutations_reversible_alternate(&idx, u, v))
        } else {
            Mutation::Reversible(mutations_reversible(&idx, u, v))
        }
    } else {
        let (source, second) = mutations_ism(&idx, opts.theta);
        Mutation::InfiniteSites { source, second }
    };

    let mut phi = idx.to_flat(fs.data());
    let mut t = 0.0;
    // Crank-Nicolson factors keyed by (nu, dt): piecewise histories revisit sizes
    let mut cn_cache: HashMap<(OrderedFloat<f64>, OrderedFloat<f64>), Rc<(CsMat<f64>, CsMat<f64>)>> =
        HashMap::new();

    while t < t_f - 1e-14 * t_f {
        let mut dt = opts.dt;
        if t + dt > t_f {
            dt = t_f - t;
        }
        let nu_now = nu.evaluate(t + dt / 2.0)[0];
        if nu_now <= 0.0 || !nu_now.is_finite() {
            return Err(MomentError::InvalidParameter(
                "nu".to_string(),
                format!("population size must be positive and finite, got {}", nu_now),
            ));
        }
        let key = (OrderedFloat(nu_now), OrderedFloat(dt));
        if !cn_cache.contains_key(&key) {
            if cn_cache.len() >= 16 {
                cn_cache.clear();
            }
            // dPhi/dt = D Phi / (2 nu): the half-step weight is dt / (4 nu)
            cn_cache.insert(key, Rc::new(cn_matrices(&drift_op, dt / (4.0 * nu_now))));
        }
        let factors = Rc::clone(&cn_cache[&key]);
        let (explicit, implicit) = (&factors.0, &factors.1);

        let mut rhs = vec![0.0; phi.len()];
        spmv_acc(explicit, &phi, 1.0, &mut rhs);
        if let Some(op) = &closed_explicit {
            spmv_acc(op, &phi, dt, &mut rhs);
        }
        match &mutation {
            Mutation::InfiniteSites { source, second } => {
                for (r, s) in rhs.iter_mut().zip(source) {
                    *r += dt * s;
                }
                spmv_acc(second, &phi, dt, &mut rhs);
            }
            Mutation::Reversible(op) => {
                spmv_acc(op, &phi, dt, &mut rhs);
            }
        }

        phi = bicgstab(implicit, &rhs, &phi, 1e-12)?;
        if phi.iter().any(|x| !x.is_finite()) {
            return Err(MomentError::NonFiniteSpectrum(format!(
                "the two-locus time step at t = {:.6}",
                t
            )));
        }
        t += dt;
        if opts.verbose {
            info!("two-locus system integrated to t = {:.6} / {:.6}", t, t_f);
        }
    }

    if opts.rho == 0.0 && sel_params.is_none() && opts.theta == 0.0 && !opts.finite_genome {
        warn!("two-locus integration ran with no recombination, selection or mutation");
    }

    *fs.data_mut() = idx.to_array(&phi);
    Ok(())
}

impl TwoLocusSpectrum {
    /// Advance this spectrum in time; see [`integrate`].
    pub fn integrate(
        &mut self,
        nu: &SizeSchedule,
        t_f: f64,
        opts: &TwoLocusOptions,
    ) -> Result<(), MomentError> {
        integrate(self, nu, t_f, opts)
    }
}

#[cfg(test)]
mod tests {
    use super::{integrate, TwoLocusOptions};
    use crate::core::SizeSchedule;
    use crate::two_locus::TwoLocusSpectrum;

    #[test]
    fn test_equilibrium_background_spectra_are_neutral_sfs() {
        // the one-locus background spectra live on the [0, j, 0] and [0, 0, k] axes;
        // with theta = 1 they equilibrate to the neutral 1/k, identically at each locus
        let n = 8;
        let mut fs = TwoLocusSpectrum::zeros(n).unwrap();
        let opts = TwoLocusOptions {
            dt: 0.05,
            ..Default::default()
        };
        integrate(&mut fs, &SizeSchedule::constant(vec![1.0]), 40.0, &opts).unwrap();

        for k in 1..n {
            let expected = 1.0 / k as f64;
            assert!(
                (fs.data()[[0, k, 0]] - expected).abs() < 1e-5 * expected,
                "left background at {}: {} vs {}",
                k,
                fs.data()[[0, k, 0]],
                expected
            );
            assert!(
                (fs.data()[[0, 0, k]] - expected).abs() < 1e-5 * expected,
                "right background at {}",
                k
            );
        }
        // the two loci are statistically identical
        let left = fs.left();
        let right = fs.right();
        for k in 0..=n {
            assert!((left[k] - right[k]).abs() < 1e-9 * left[k].abs().max(1.0));
        }
    }

    #[test]
    fn test_sigma_d2_is_ohta_kimura_at_zero_rho() {
        // with the unbiased estimators, E[D^2] / E[pi2] at the rho = 0 equilibrium is the
        // classical 10/22 exactly, not just in the large-n limit
        let n = 12;
        let mut fs = TwoLocusSpectrum::zeros(n).unwrap();
        let opts = TwoLocusOptions {
            dt: 0.05,
            ..Default::default()
        };
        integrate(&mut fs, &SizeSchedule::constant(vec![1.0]), 60.0, &opts).unwrap();
        let ratio = fs.d2(true) / fs.pi2(true);
        assert!(
            (ratio - 10.0 / 22.0).abs() < 1e-5,
            "sigma_d^2 at equilibrium was {}",
            ratio
        );
        // the companion Hill-Robertson identity Dz / pi2 = 4/11 is sharp as well
        let dz_ratio = fs.dz(true).unwrap() / fs.pi2(true);
        assert!(
            (dz_ratio - 4.0 / 11.0).abs() < 1e-5,
            "Dz / pi2 at equilibrium was {}",
            dz_ratio
        );
        // only the sampling-projection estimator of Dz exists
        assert!(fs.dz(false).is_err());
    }

    #[test]
    fn test_recombination_reduces_d2() {
        let n = 8;
        let run = |rho: f64| {
            let mut fs = TwoLocusSpectrum::zeros(n).unwrap();
            let opts = TwoLocusOptions {
                rho,
                dt: 0.05,
                ..Default::default()
            };
            integrate(&mut fs, &SizeSchedule::constant(vec![1.0]), 40.0, &opts).unwrap();
            fs.d2(true) / fs.pi2(true)
        };
        let tight = run(0.0);
        let loose = run(5.0);
        assert!(
            loose < 0.6 * tight,
            "sigma_d^2 did not fall with recombination: {} vs {}",
            tight,
            loose
        );
    }

    #[test]
    fn test_reversible_model_conserves_probability() {
        let n = 6;
        let mut fs = TwoLocusSpectrum::zeros(n).unwrap();
        // start with everything ancestral
        fs.data_mut()[[0, 0, 0]] = 1.0;
        let opts = TwoLocusOptions {
            finite_genome: true,
            u: Some(1e-3),
            v: Some(5e-4),
            theta: 0.0,
            dt: 0.1,
            ..Default::default()
        };
        integrate(&mut fs, &SizeSchedule::constant(vec![1.0]), 50.0, &opts).unwrap();
        let total: f64 = fs.data().iter().sum();
        assert!((total - 1.0).abs() < 1e-8, "probability drifted to {}", total);
        // two-way mutation has moved density off the ancestral class
        assert!(fs.data()[[0, 0, 0]] < 1.0);
        assert!(fs.data().iter().all(|v| *v >= -1e-10));
    }

    #[test]
    fn test_dominance_is_rejected() {
        let mut fs = TwoLocusSpectrum::zeros(6).unwrap();
        let opts = TwoLocusOptions {
            gamma: -1.0,
            h: 0.3,
            ..Default::default()
        };
        assert!(integrate(&mut fs, &SizeSchedule::constant(vec![1.0]), 1.0, &opts).is_err());
    }
}
