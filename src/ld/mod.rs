//! Linkage-disequilibrium moment statistics: the low-order system closed at second order
//! (D^2, Dz, pi2 and heterozygosities), its multi-population extension with migration,
//! population splits, and the sigma_d^2 normalization.

pub mod system;

use std::fs;
use std::path::Path;

use log::info;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::core::{MomentError, SizeSchedule};
use crate::utils::solve_linear_system;

pub use system::{Basis, Stat};

/// A vector of LD statistics for one to five populations: the two-locus block in the
/// canonical `STAT_i_j[_k_l]` order, followed by the heterozygosity block `H_i_j`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LdStats {
    num_pops: usize,
    ld: Vec<f64>,
    het: Vec<f64>,
}

/// Options for [`LdStats::integrate`].
pub struct LdOptions {
    /// Time step in units of 2 N_ref generations.
    pub dt: f64,
    /// Scaled recombination rate between the two loci.
    pub rho: f64,
    /// Scaled mutation rate.
    pub theta: f64,
    /// Scaled migration rates; entry (i, j) is the rate into i from j.
    pub migration: Option<DMatrix<f64>>,
    /// Report progress through `log::info!`.
    pub verbose: bool,
}

impl Default for LdOptions {
    fn default() -> Self {
        Self {
            dt: 0.001,
            rho: 0.0,
            theta: 0.0008,
            migration: None,
            verbose: false,
        }
    }
}

impl LdStats {
    /// A zero state for the given number of populations.
    pub fn zeros(num_pops: usize) -> Result<Self, MomentError> {
        if num_pops == 0 || num_pops > 5 {
            return Err(MomentError::InvalidParameter(
                "num_pops".to_string(),
                format!("LD statistics carry 1 to 5 populations, not {}", num_pops),
            ));
        }
        let basis = Basis::new(num_pops);
        Ok(Self {
            num_pops,
            ld: vec![0.0; basis.ld.len()],
            het: vec![0.0; basis.het.len()],
        })
    }

    /// The one-population equilibrium at the given recombination and mutation rates,
    /// solved exactly from the stationary linear system.
    pub fn steady_state(rho: f64, theta: f64) -> Result<Self, MomentError> {
        let basis = Basis::new(1);
        let g = system::generator(&basis, &[1.0], rho, theta, None)?;
        let m = basis.state_len() - 1;
        // solve A x = -b with b the constant-source column
        let a = g.view((0, 0), (m, m)).into_owned();
        let b = g.view((0, m), (m, 1)).into_owned();
        let x = solve_linear_system(&a, &DVector::from_column_slice((-b).as_slice()))?;
        Ok(Self {
            num_pops: 1,
            ld: x.as_slice()[..basis.ld.len()].to_vec(),
            het: x.as_slice()[basis.ld.len()..].to_vec(),
        })
    }

    pub fn num_pops(&self) -> usize {
        self.num_pops
    }

    pub fn ld(&self) -> &[f64] {
        &self.ld
    }

    pub fn het(&self) -> &[f64] {
        &self.het
    }

    /// The `(ld_names, het_names)` pair in storage order.
    pub fn names(&self) -> (Vec<String>, Vec<String>) {
        let basis = Basis::new(self.num_pops);
        (
            basis.ld.iter().map(|s| s.name()).collect(),
            basis
                .het
                .iter()
                .map(|&(i, j)| format!("H_{}_{}", i + 1, j + 1))
                .collect(),
        )
    }

    /// The value of a statistic by canonical name, e.g. `DD_1_2` or `H_1_1`.
    pub fn stat(&self, name: &str) -> Result<f64, MomentError> {
        let (ld_names, het_names) = self.names();
        if let Some(pos) = ld_names.iter().position(|n| n == name) {
            return Ok(self.ld[pos]);
        }
        if let Some(pos) = het_names.iter().position(|n| n == name) {
            return Ok(self.het[pos]);
        }
        Err(MomentError::NonExistingStatistic(
            name.to_string(),
            self.num_pops,
        ))
    }

    /// Split a population: the new population is appended with index p+1 and every
    /// statistic referencing it takes its value from the source population, since the
    /// two are perfectly correlated at the instant of the split.
    pub fn split(&self, pop: usize) -> Result<LdStats, MomentError> {
        if pop >= self.num_pops {
            return Err(MomentError::NonExistingPopulation(pop, self.num_pops));
        }
        if self.num_pops >= 5 {
            return Err(MomentError::InvalidParameter(
                "split".to_string(),
                "LD statistics cannot hold more than five populations".to_string(),
            ));
        }
        let from = Basis::new(self.num_pops);
        let to = Basis::new(self.num_pops + 1);
        let new_pop = self.num_pops;
        let remap = |idx: usize| if idx == new_pop { pop } else { idx };

        let ld = to
            .ld
            .iter()
            .map(|stat| self.ld[from.ld_index(stat.relabel(remap))])
            .collect();
        let het = to
            .het
            .iter()
            .map(|&(i, j)| self.het[from.het_index(remap(i), remap(j))])
            .collect();
        Ok(LdStats {
            num_pops: self.num_pops + 1,
            ld,
            het,
        })
    }

    /// Exchange two population labels.
    pub fn swap_pops(&self, a: usize, b: usize) -> Result<LdStats, MomentError> {
        if a >= self.num_pops {
            return Err(MomentError::NonExistingPopulation(a, self.num_pops));
        }
        if b >= self.num_pops {
            return Err(MomentError::NonExistingPopulation(b, self.num_pops));
        }
        let basis = Basis::new(self.num_pops);
        let remap = |idx: usize| {
            if idx == a {
                b
            } else if idx == b {
                a
            } else {
                idx
            }
        };
        let ld = basis
            .ld
            .iter()
            .map(|stat| self.ld[basis.ld_index(stat.relabel(remap))])
            .collect();
        let het = basis
            .het
            .iter()
            .map(|&(i, j)| self.het[basis.het_index(remap(i), remap(j))])
            .collect();
        Ok(LdStats {
            num_pops: self.num_pops,
            ld,
            het,
        })
    }

    /// Normalize to sigma_d^2-style statistics: the LD block is divided by
    /// `pi2_r_r_r_r` and the heterozygosity block by `H_r_r` of the reference
    /// population r.
    pub fn sigma_d2(&self, normalization: usize) -> Result<LdStats, MomentError> {
        if normalization >= self.num_pops {
            return Err(MomentError::NonExistingPopulation(
                normalization,
                self.num_pops,
            ));
        }
        let basis = Basis::new(self.num_pops);
        let r = normalization;
        let pi2_ref = self.ld[basis.ld_index(Stat::pi2(r, r, r, r))];
        let het_ref = self.het[basis.het_index(r, r)];
        if pi2_ref == 0.0 || het_ref == 0.0 {
            return Err(MomentError::InvalidParameter(
                "normalization".to_string(),
                "the reference statistics are zero".to_string(),
            ));
        }
        Ok(LdStats {
            num_pops: self.num_pops,
            ld: self.ld.iter().map(|v| v / pi2_ref).collect(),
            het: self.het.iter().map(|v| v / het_ref).collect(),
        })
    }

    /// Advance the statistics in time by Crank-Nicolson steps of the affine moment
    /// system.
    ///
    /// # Arguments
    ///
    /// * `nu`: Relative population sizes over time.
    /// * `t_f`: Integration time in units of 2 N_ref generations.
    /// * `opts`: Recombination, mutation and migration settings.
    ///
    /// returns: `Result<(), MomentError>`
    pub fn integrate(
        &mut self,
        nu: &SizeSchedule,
        t_f: f64,
        opts: &LdOptions,
    ) -> Result<(), MomentError> {
        nu.validate(self.num_pops)?;
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

        let basis = Basis::new(self.num_pops);
        let size = basis.state_len();
        let mut z = DVector::<f64>::zeros(size);
        z.as_mut_slice()[..self.ld.len()].copy_from_slice(&self.ld);
        z.as_mut_slice()[self.ld.len()..size - 1].copy_from_slice(&self.het);
        z[size - 1] = 1.0;

        let mut t = 0.0;
        let mut nu_old: Vec<f64> = Vec::new();
        let mut dt_old = f64::NAN;
        let mut stepper: Option<(DMatrix<f64>, nalgebra::LU<f64, nalgebra::Dyn, nalgebra::Dyn>)> =
            None;

        while t < t_f - 1e-14 * t_f {
            let mut dt = opts.dt;
            if t + dt > t_f {
                dt = t_f - t;
            }
            let nu_now = nu.evaluate(t + dt / 2.0);
            if stepper.is_none() || nu_now != nu_old || dt != dt_old {
                let g = system::generator(
                    &basis,
                    &nu_now,
                    opts.rho,
                    opts.theta,
                    opts.migration.as_ref(),
                )?;
                let explicit = DMatrix::identity(size, size) + &g * (dt / 2.0);
                let implicit = DMatrix::identity(size, size) - &g * (dt / 2.0);
                stepper = Some((explicit, implicit.lu()));
                nu_old = nu_now;
                dt_old = dt;
            }
            let (explicit, lu) = stepper.as_ref().unwrap();
            let rhs = explicit * &z;
            z = lu.solve(&rhs).ok_or_else(|| {
                MomentError::LinearSolver("the implicit LD system is singular".to_string())
            })?;
            if z.iter().any(|x| !x.is_finite()) {
                return Err(MomentError::NonFiniteSpectrum(format!(
                    "the LD time step at t = {:.6}",
                    t
                )));
            }
            t += dt;
            if opts.verbose {
                info!("LD system integrated to t = {:.6} / {:.6}", t, t_f);
            }
        }

        let ld_len = self.ld.len();
        self.ld.copy_from_slice(&z.as_slice()[..ld_len]);
        self.het
            .copy_from_slice(&z.as_slice()[ld_len..size - 1]);
        Ok(())
    }

    /// Read LD statistics from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<LdStats, MomentError> {
        let content =
            fs::read_to_string(&path).map_err(|e| MomentError::FileRead(e.to_string()))?;
        let stats: LdStats =
            serde_json::from_str(&content).map_err(|e| MomentError::FileRead(e.to_string()))?;
        let basis = Basis::new(stats.num_pops);
        if stats.ld.len() != basis.ld.len() || stats.het.len() != basis.het.len() {
            return Err(MomentError::FileRead(format!(
                "inconsistent block lengths for {} populations",
                stats.num_pops
            )));
        }
        Ok(stats)
    }

    /// Write LD statistics to a JSON file.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), MomentError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| MomentError::FileWrite(e.to_string()))?;
        fs::write(path, content).map_err(|e| MomentError::FileWrite(e.to_string()))
    }
}
