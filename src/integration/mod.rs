//! Forward-in-time integration of the spectrum moment system under drift, selection,
//! migration and mutation.
//!
//! Each step advances the spectrum by dt through a Strang-like splitting: an explicit
//! migration half-step, the explicit halves of the per-axis drift-selection
//! Crank-Nicolson sub-steps, mutation injection, the matching implicit halves, and the
//! closing migration half-step. Placing mutation between the explicit and implicit
//! halves makes stationary spectra of the generator exact fixed points of the discrete
//! step. The per-axis systems are tridiagonal on the neutral path and dense LU-factored
//! banded systems when selection is active; factorizations are cached and rebuilt only
//! when the population sizes, the time step or the selection parameters change.

use log::{info, warn};
use nalgebra::{DMatrix, DVector};
use ndarray::{ArrayD, Axis};

use crate::core::{FrozenSchedule, MomentError, SizeSchedule, Spectrum};
use crate::numerics::jackknife::JackknifeCache;
use crate::numerics::migration::apply_migration;
use crate::numerics::one_dim::{
    compute_dt, drift_diagonals, mutation_source, reversible_mutation, selection_dominance,
    selection_h,
};
use crate::numerics::{apply_along_axis, tridiag};

/// A scalar rate applied to every population, or one rate per population.
#[derive(Clone, Debug)]
pub enum Theta {
    Scalar(f64),
    PerPop(Vec<f64>),
}

impl Theta {
    fn resolve(&self, num_pops: usize, name: &str) -> Result<Vec<f64>, MomentError> {
        match self {
            Theta::Scalar(v) => Ok(vec![*v; num_pops]),
            Theta::PerPop(v) => {
                if v.len() != num_pops {
                    Err(MomentError::InvalidParameter(
                        name.to_string(),
                        format!("{} rates provided for {} populations", v.len(), num_pops),
                    ))
                } else {
                    Ok(v.clone())
                }
            }
        }
    }
}

/// Options for [`integrate`]. The defaults describe a neutral infinite-sites model with
/// theta = 1, no migration and nothing frozen.
pub struct IntegrationOptions {
    /// Cap on the time step as a fraction of the total integration time.
    pub dt_fac: f64,
    /// Scaled selection coefficients per population.
    pub gamma: Option<Vec<f64>>,
    /// Dominance coefficients per population.
    pub h: Option<Vec<f64>>,
    /// Scaled mutation rate for the infinite-sites source.
    pub theta: Theta,
    /// Scaled migration rates; entry (i, j) is the rate into i from j. Diagonal ignored.
    pub migration: Option<DMatrix<f64>>,
    /// Populations whose evolution is frozen (ancient samples).
    pub frozen: Option<Vec<bool>>,
    /// Use the reversible finite-genome mutation model instead of infinite sites.
    pub finite_genome: bool,
    /// Scaled forward mutation rate, required when `finite_genome` is set.
    pub theta_fd: Option<Theta>,
    /// Scaled backward mutation rate, required when `finite_genome` is set.
    pub theta_bd: Option<Theta>,
    /// Report progress through `log::info!`.
    pub verbose: bool,
}

impl Default for IntegrationOptions {
    fn default() -> Self {
        Self {
            dt_fac: 0.1,
            gamma: None,
            h: None,
            theta: Theta::Scalar(1.0),
            migration: None,
            frozen: None,
            finite_genome: false,
            theta_fd: None,
            theta_bd: None,
            verbose: false,
        }
    }
}

enum AxisSolver {
    /// Thomas factorization of the tridiagonal neutral system, plus the explicit half.
    Neutral {
        q_sub: Vec<f64>,
        q_diag: Vec<f64>,
        q_sup: Vec<f64>,
        f_sub: Vec<f64>,
        f_diag: Vec<f64>,
        f_sup: Vec<f64>,
    },
    /// Dense LU of the selected system, plus the explicit half.
    Selected {
        q: DMatrix<f64>,
        lu: nalgebra::LU<f64, nalgebra::Dyn, nalgebra::Dyn>,
    },
}

/// Advance a spectrum forward in time.
///
/// # Arguments
///
/// * `fs`: The spectrum, mutated in place; its mask is left untouched.
/// * `sizes`: Relative population sizes over time, evaluated in units of 2 N_ref
///   generations.
/// * `t_f`: Integration time in units of 2 N_ref generations.
/// * `opts`: Selection, mutation, migration and frozen-population settings.
///
/// returns: `Result<(), MomentError>`
pub fn integrate(
    fs: &mut Spectrum,
    sizes: &SizeSchedule,
    t_f: f64,
    opts: &IntegrationOptions,
) -> Result<(), MomentError> {
    let p = fs.num_pops();
    let dims: Vec<usize> = fs.data().shape().to_vec();
    let sample_sizes = fs.sample_sizes();
    sizes.validate(p)?;

    if t_f < 0.0 || !t_f.is_finite() {
        return Err(MomentError::InvalidParameter(
            "t_f".to_string(),
            format!("integration time must be non-negative, got {}", t_f),
        ));
    }
    if t_f == 0.0 {
        return Ok(());
    }
    if opts.dt_fac <= 0.0 || opts.dt_fac > 1.0 {
        return Err(MomentError::InvalidParameter(
            "dt_fac".to_string(),
            format!("the time-step fraction must lie in (0, 1], got {}", opts.dt_fac),
        ));
    }

    let mut gamma = match &opts.gamma {
        Some(g) => {
            if g.len() != p {
                return Err(MomentError::InvalidParameter(
                    "gamma".to_string(),
                    format!("{} coefficients provided for {} populations", g.len(), p),
                ));
            }
            g.clone()
        }
        None => vec![0.0; p],
    };
    let h = match &opts.h {
        Some(h) => {
            if h.len() != p {
                return Err(MomentError::InvalidParameter(
                    "h".to_string(),
                    format!("{} coefficients provided for {} populations", h.len(), p),
                ));
            }
            h.clone()
        }
        None => vec![0.5; p],
    };
    let frozen = match &opts.frozen {
        Some(f) => {
            if f.len() != p {
                return Err(MomentError::InvalidParameter(
                    "frozen".to_string(),
                    format!("{} flags provided for {} populations", f.len(), p),
                ));
            }
            f.clone()
        }
        None => vec![false; p],
    };

    // per-population mutation rates; frozen populations stop mutating and selecting
    let (mut u, mut v) = if opts.finite_genome {
        let fd = opts
            .theta_fd
            .as_ref()
            .ok_or_else(|| {
                MomentError::InvalidParameter(
                    "theta_fd".to_string(),
                    "the finite-genome model needs a forward rate".to_string(),
                )
            })?
            .resolve(p, "theta_fd")?;
        let bd = opts
            .theta_bd
            .as_ref()
            .ok_or_else(|| {
                MomentError::InvalidParameter(
                    "theta_bd".to_string(),
                    "the finite-genome model needs a backward rate".to_string(),
                )
            })?
            .resolve(p, "theta_bd")?;
        (
            fd.iter().map(|t| t / 4.0).collect::<Vec<f64>>(),
            bd.iter().map(|t| t / 4.0).collect::<Vec<f64>>(),
        )
    } else {
        (
            opts.theta
                .resolve(p, "theta")?
                .iter()
                .map(|t| t / 4.0)
                .collect(),
            vec![0.0; p],
        )
    };
    for i in 0..p {
        if frozen[i] {
            gamma[i] = 0.0;
            u[i] = 0.0;
            v[i] = 0.0;
        }
    }

    let selected = gamma.iter().any(|&g| g != 0.0);
    let migration_active = opts
        .migration
        .as_ref()
        .map(|m| {
            m.iter().enumerate().any(|(k, &r)| {
                let (row, col) = (k % m.nrows(), k / m.nrows());
                row != col && r != 0.0
            })
        })
        .unwrap_or(false);
    if let Some(m) = &opts.migration {
        if m.nrows() != p || m.ncols() != p {
            return Err(MomentError::OperatorDimension(
                "migration matrix".to_string(),
                m.nrows(),
                p,
            ));
        }
    }
    for (i, &n) in sample_sizes.iter().enumerate() {
        if (selected || migration_active) && n < 2 {
            return Err(MomentError::SampleSizeTooSmall(
                n,
                format!("selection or migration in population {}", i),
            ));
        }
    }

    let migration_matrix = if migration_active {
        opts.migration.as_ref()
    } else {
        None
    };
    let schedule = FrozenSchedule::new(sizes, frozen);
    let mut cache = JackknifeCache::default();

    // static per-axis pieces
    let drift: Vec<(Vec<f64>, Vec<f64>, Vec<f64>)> =
        dims.iter().map(|&d| drift_diagonals(d)).collect();
    let mut sel_parts: Vec<Option<(DMatrix<f64>, DMatrix<f64>)>> = vec![None; p];
    if selected {
        for k in 0..p {
            let jk13 = cache.get(sample_sizes[k], 1)?;
            let jk23 = cache.get(sample_sizes[k], 2)?;
            sel_parts[k] = Some((
                selection_h(dims[k], &jk13)?,
                selection_dominance(dims[k], &jk23)?,
            ));
        }
    }

    // mutation model
    let ism_source: Option<ArrayD<f64>> = if opts.finite_genome {
        None
    } else {
        Some(mutation_source(&dims, &u))
    };
    let reversible: Option<Vec<DMatrix<f64>>> = if opts.finite_genome {
        Some(
            dims.iter()
                .enumerate()
                .map(|(k, &d)| reversible_mutation(d, u[k], v[k]))
                .collect(),
        )
    } else {
        None
    };

    let t_max = 2.0 * t_f;
    let mut t = 0.0;
    let mut n_old = schedule.evaluate(0.0);
    let mut dt_old = f64::NAN;
    let mut solvers: Vec<AxisSolver> = Vec::new();
    let mut first = true;
    let largest_axis = dims.iter().copied().max().unwrap_or(0);
    let mut scratch = vec![0.0; largest_axis];

    while t < t_max - 1e-14 * t_max {
        let mut dt = compute_dt(&n_old, &gamma, &h, 0.1).min(opts.dt_fac * t_max);
        if t + dt > t_max {
            dt = t_max - t;
        }

        // end-of-step sizes and effective sizes over the step, in 2 N_ref generation units
        let mut n_new = schedule.evaluate((t + dt) / 2.0);
        let mut n_eff = schedule.effective_size(t / 2.0, (t + dt) / 2.0);
        if !sizes.is_constant() {
            let mut halvings = 0;
            while relative_change(&n_new, &n_old) > 0.5 {
                dt /= 2.0;
                n_new = schedule.evaluate((t + dt) / 2.0);
                n_eff = schedule.effective_size(t / 2.0, (t + dt) / 2.0);
                halvings += 1;
                if halvings >= 10 {
                    warn!(
                        "large population size change at t = {:.4}: {:?} -> {:?} (relative change {:.3})",
                        t / 2.0,
                        n_old,
                        n_new,
                        relative_change(&n_new, &n_old)
                    );
                    break;
                }
            }
        }

        if first || dt != dt_old || n_new != n_old {
            solvers = build_axis_solvers(&dims, &drift, &sel_parts, &gamma, &h, &n_eff, dt)?;
        }

        // migration half-step
        if let Some(m) = migration_matrix {
            migration_half_step(fs, m, dt, &mut cache)?;
        }

        // explicit halves of the drift-selection Crank-Nicolson step, one per axis
        for (k, solver) in solvers.iter().enumerate() {
            explicit_axis(fs.data_mut(), k, solver, &mut scratch);
        }

        // mutation injection sits between the explicit and implicit halves, so that a
        // stationary spectrum of the generator is a fixed point of the discrete step
        if let Some(b) = &ism_source {
            fs.data_mut().zip_mut_with(b, |x, &s| *x += dt * s);
        } else if let Some(ops) = &reversible {
            for (k, op) in ops.iter().enumerate() {
                let injected = apply_along_axis(fs.data(), op, k);
                fs.data_mut().zip_mut_with(&injected, |x, &s| *x += dt * s);
            }
        }

        // implicit halves
        for (k, solver) in solvers.iter().enumerate() {
            implicit_axis(fs.data_mut(), k, solver, &mut scratch)?;
        }

        // migration half-step
        if let Some(m) = migration_matrix {
            migration_half_step(fs, m, dt, &mut cache)?;
        }

        if fs.data().iter().any(|x| !x.is_finite()) {
            return Err(MomentError::NonFiniteSpectrum(format!(
                "the time step at t = {:.6}",
                t / 2.0
            )));
        }

        t += dt;
        n_old = n_new;
        dt_old = dt;
        first = false;
        if opts.verbose {
            info!("integrated to t = {:.6} / {:.6}", t / 2.0, t_f);
        }
    }
    Ok(())
}

fn relative_change(n_new: &[f64], n_old: &[f64]) -> f64 {
    n_new
        .iter()
        .zip(n_old)
        .map(|(a, b)| ((a - b) / b).abs())
        .fold(0.0, f64::max)
}

fn build_axis_solvers(
    dims: &[usize],
    drift: &[(Vec<f64>, Vec<f64>, Vec<f64>)],
    sel_parts: &[Option<(DMatrix<f64>, DMatrix<f64>)>],
    gamma: &[f64],
    h: &[f64],
    n_eff: &[f64],
    dt: f64,
) -> Result<Vec<AxisSolver>, MomentError> {
    let mut solvers = Vec::with_capacity(dims.len());
    for k in 0..dims.len() {
        let d = dims[k];
        let inv_4n = 1.0 / (4.0 * n_eff[k]);
        match &sel_parts[k] {
            None => {
                let (sub, diag, sup) = &drift[k];
                let half = 0.5 * dt * inv_4n;
                let q_sub: Vec<f64> = sub.iter().map(|s| half * s).collect();
                let q_sup: Vec<f64> = sup.iter().map(|s| half * s).collect();
                let q_diag: Vec<f64> = diag.iter().map(|s| 1.0 + half * s).collect();
                let mut f_sub: Vec<f64> = sub.iter().map(|s| -half * s).collect();
                let mut f_diag: Vec<f64> = diag.iter().map(|s| 1.0 - half * s).collect();
                let f_sup: Vec<f64> = sup.iter().map(|s| -half * s).collect();
                tridiag::factor(&mut f_sub, &mut f_diag, &f_sup);
                solvers.push(AxisSolver::Neutral {
                    q_sub,
                    q_diag,
                    q_sup,
                    f_sub,
                    f_diag,
                    f_sup,
                });
            }
            Some((s1, s2)) => {
                let mut a = DMatrix::<f64>::zeros(d, d);
                let (sub, diag, sup) = &drift[k];
                for i in 0..d {
                    a[(i, i)] = diag[i] * inv_4n;
                    if i > 0 {
                        a[(i, i - 1)] = sub[i] * inv_4n;
                    }
                    if i + 1 < d {
                        a[(i, i + 1)] = sup[i] * inv_4n;
                    }
                }
                a += s1 * (gamma[k] * h[k]);
                a += s2 * (gamma[k] * (1.0 - 2.0 * h[k]));
                let q = DMatrix::identity(d, d) + &a * (0.5 * dt);
                let implicit = DMatrix::identity(d, d) - &a * (0.5 * dt);
                solvers.push(AxisSolver::Selected {
                    q,
                    lu: implicit.lu(),
                });
            }
        }
    }
    Ok(solvers)
}

fn explicit_axis(data: &mut ArrayD<f64>, axis: usize, solver: &AxisSolver, scratch: &mut [f64]) {
    match solver {
        AxisSolver::Neutral {
            q_sub,
            q_diag,
            q_sup,
            ..
        } => {
            let d = q_diag.len();
            for mut lane in data.lanes_mut(Axis(axis)) {
                let pencil = &mut scratch[..d];
                for (i, x) in lane.iter().enumerate() {
                    pencil[i] = *x;
                }
                let mut tmp = pencil.to_vec();
                tridiag::mul_vec(q_sub, q_diag, q_sup, pencil, &mut tmp);
                for (i, x) in lane.iter_mut().enumerate() {
                    *x = pencil[i];
                }
            }
        }
        AxisSolver::Selected { q, .. } => {
            let d = q.nrows();
            for mut lane in data.lanes_mut(Axis(axis)) {
                let x = DVector::from_fn(d, |i, _| lane[i]);
                let rhs = q * x;
                for (i, val) in lane.iter_mut().enumerate() {
                    *val = rhs[i];
                }
            }
        }
    }
}

fn implicit_axis(
    data: &mut ArrayD<f64>,
    axis: usize,
    solver: &AxisSolver,
    scratch: &mut [f64],
) -> Result<(), MomentError> {
    match solver {
        AxisSolver::Neutral {
            f_sub,
            f_diag,
            f_sup,
            ..
        } => {
            let d = f_diag.len();
            for mut lane in data.lanes_mut(Axis(axis)) {
                let pencil = &mut scratch[..d];
                for (i, x) in lane.iter().enumerate() {
                    pencil[i] = *x;
                }
                tridiag::solve(f_sub, f_diag, f_sup, pencil);
                for (i, x) in lane.iter_mut().enumerate() {
                    *x = pencil[i];
                }
            }
        }
        AxisSolver::Selected { lu, .. } => {
            for mut lane in data.lanes_mut(Axis(axis)) {
                let x = DVector::from_fn(lane.len(), |i, _| lane[i]);
                let solved = lu.solve(&x).ok_or_else(|| {
                    MomentError::LinearSolver(
                        "the implicit drift-selection system is singular".to_string(),
                    )
                })?;
                for (i, val) in lane.iter_mut().enumerate() {
                    *val = solved[i];
                }
            }
        }
    }
    Ok(())
}

fn migration_half_step(
    fs: &mut Spectrum,
    rates: &DMatrix<f64>,
    dt: f64,
    cache: &mut JackknifeCache,
) -> Result<(), MomentError> {
    let flux = apply_migration(fs.data(), rates, cache)?;
    let mut data = fs.data_mut().view_mut();
    data.zip_mut_with(&flux, |x, &f| *x += 0.5 * dt * f);
    Ok(())
}

impl Spectrum {
    /// Advance this spectrum in time; see [`integrate`].
    pub fn integrate(
        &mut self,
        sizes: &SizeSchedule,
        t_f: f64,
        opts: &IntegrationOptions,
    ) -> Result<(), MomentError> {
        integrate(self, sizes, t_f, opts)
    }
}
