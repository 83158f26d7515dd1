//! The second-order LD moment basis and its time-evolution generator.
//!
//! The state carries E[D_i D_j], E[D_i z_j z_k] and the symmetrized joint
//! heterozygosities pi2(i, j; k, l), closed by the identity
//! E[z_a z_b] = 1 - 2 H_ab, together with the one-locus heterozygosity block H_ij and a
//! constant component that turns the mutation sources into a linear system. Drift and
//! migration coefficients follow from Ito calculus on the within-population sampling
//! noise and the deterministic migration flux; the one-population reduction is the
//! classical Hill-Robertson system with sigma_d^2 = (10 + rho) / (22 + 13 rho + rho^2)
//! at stationarity.

use nalgebra::DMatrix;

use crate::core::MomentError;

/// A two-locus second-moment statistic over population indices.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Stat {
    /// E[D_i D_j], i <= j.
    DD(usize, usize),
    /// E[D_i (1 - 2 p_j)(1 - 2 q_k)], j <= k by locus exchange.
    Dz(usize, usize, usize),
    /// E[p(i, j) q(k, l)] with p(i, j) the symmetrized cross heterozygosity; i <= j,
    /// k <= l and (i, j) <= (k, l).
    Pi2(usize, usize, usize, usize),
}

impl Stat {
    pub fn dd(i: usize, j: usize) -> Stat {
        Stat::DD(i.min(j), i.max(j))
    }

    pub fn dz(i: usize, j: usize, k: usize) -> Stat {
        Stat::Dz(i, j.min(k), j.max(k))
    }

    pub fn pi2(i: usize, j: usize, k: usize, l: usize) -> Stat {
        let p = (i.min(j), i.max(j));
        let q = (k.min(l), k.max(l));
        if q < p {
            Stat::Pi2(q.0, q.1, p.0, p.1)
        } else {
            Stat::Pi2(p.0, p.1, q.0, q.1)
        }
    }

    /// The canonical `STAT_i_j[_k_l]` name, with 1-based population indices.
    pub fn name(&self) -> String {
        match *self {
            Stat::DD(i, j) => format!("DD_{}_{}", i + 1, j + 1),
            Stat::Dz(i, j, k) => format!("Dz_{}_{}_{}", i + 1, j + 1, k + 1),
            Stat::Pi2(i, j, k, l) => format!("pi2_{}_{}_{}_{}", i + 1, j + 1, k + 1, l + 1),
        }
    }

    /// Remap population indices, re-canonicalizing the result.
    pub fn relabel<F: Fn(usize) -> usize>(&self, f: F) -> Stat {
        match *self {
            Stat::DD(i, j) => Stat::dd(f(i), f(j)),
            Stat::Dz(i, j, k) => Stat::dz(f(i), f(j), f(k)),
            Stat::Pi2(i, j, k, l) => Stat::pi2(f(i), f(j), f(k), f(l)),
        }
    }
}

/// The ordered LD and heterozygosity bases for a given number of populations.
pub struct Basis {
    pub num_pops: usize,
    pub ld: Vec<Stat>,
    pub het: Vec<(usize, usize)>,
}

impl Basis {
    pub fn new(num_pops: usize) -> Self {
        let p = num_pops;
        let mut ld = Vec::new();
        for i in 0..p {
            for j in i..p {
                ld.push(Stat::DD(i, j));
            }
        }
        for i in 0..p {
            for j in 0..p {
                for k in j..p {
                    ld.push(Stat::Dz(i, j, k));
                }
            }
        }
        let mut pairs = Vec::new();
        for i in 0..p {
            for j in i..p {
                pairs.push((i, j));
            }
        }
        for (a, &(i, j)) in pairs.iter().enumerate() {
            for &(k, l) in pairs.iter().skip(a) {
                ld.push(Stat::Pi2(i, j, k, l));
            }
        }
        let het = pairs;
        Basis { num_pops: p, ld, het }
    }

    pub fn ld_index(&self, stat: Stat) -> usize {
        self.ld
            .iter()
            .position(|s| *s == stat)
            .expect("statistic outside the basis")
    }

    pub fn het_index(&self, i: usize, j: usize) -> usize {
        let key = (i.min(j), i.max(j));
        self.het
            .iter()
            .position(|&p| p == key)
            .expect("heterozygosity outside the basis")
    }

    /// Total state length: LD block, heterozygosity block and the constant component.
    pub fn state_len(&self) -> usize {
        self.ld.len() + self.het.len() + 1
    }
}

/// Assemble the full generator on [ld block, het block, 1].
///
/// # Arguments
///
/// * `basis`: The statistic basis.
/// * `nu`: Relative population sizes.
/// * `rho`: Scaled recombination rate.
/// * `theta`: Scaled mutation rate.
/// * `migration`: Optional scaled migration matrix, entry (i, j) the rate into i from j.
///
/// returns: `Result<DMatrix<f64>, MomentError>`
pub fn generator(
    basis: &Basis,
    nu: &[f64],
    rho: f64,
    theta: f64,
    migration: Option<&DMatrix<f64>>,
) -> Result<DMatrix<f64>, MomentError> {
    let p = basis.num_pops;
    if nu.len() != p {
        return Err(MomentError::InvalidParameter(
            "nu".to_string(),
            format!("{} sizes provided for {} populations", nu.len(), p),
        ));
    }
    if let Some(m) = migration {
        if m.nrows() != p || m.ncols() != p {
            return Err(MomentError::OperatorDimension(
                "migration matrix".to_string(),
                m.nrows(),
                p,
            ));
        }
    }
    let n_ld = basis.ld.len();
    let size = basis.state_len();
    let one = size - 1;
    let mut g = DMatrix::<f64>::zeros(size, size);

    let mut add_ld = |g: &mut DMatrix<f64>, row: usize, stat: Stat, w: f64| {
        let col = basis.ld_index(stat);
        g[(row, col)] += w;
    };

    // LD block rows
    for (row, stat) in basis.ld.iter().enumerate() {
        match *stat {
            Stat::DD(i, j) => {
                if i == j {
                    add_ld(&mut g, row, Stat::dd(i, i), -3.0 / nu[i]);
                    add_ld(&mut g, row, Stat::dz(i, i, i), 1.0 / nu[i]);
                    add_ld(&mut g, row, Stat::pi2(i, i, i, i), 1.0 / nu[i]);
                } else {
                    add_ld(&mut g, row, Stat::dd(i, j), -1.0 / nu[i] - 1.0 / nu[j]);
                }
                g[(row, row)] += -rho;
                if let Some(m) = migration {
                    for (a, b) in [(i, j), (j, i)] {
                        for c in 0..p {
                            if c == a || m[(a, c)] == 0.0 {
                                continue;
                            }
                            let rate = m[(a, c)];
                            add_ld(&mut g, row, Stat::dd(c, b), rate);
                            add_ld(&mut g, row, Stat::dd(a, b), -rate);
                            add_ld(&mut g, row, Stat::dz(b, a, a), 0.25 * rate);
                            add_ld(&mut g, row, Stat::dz(b, a, c), -0.25 * rate);
                            add_ld(&mut g, row, Stat::dz(b, c, a), -0.25 * rate);
                            add_ld(&mut g, row, Stat::dz(b, c, c), 0.25 * rate);
                        }
                    }
                }
            }
            Stat::Dz(i, j, k) => {
                add_ld(&mut g, row, Stat::dz(i, j, k), -1.0 / nu[i]);
                if j == k {
                    add_ld(&mut g, row, Stat::dd(i, j), 4.0 / nu[j]);
                }
                if i == j {
                    add_ld(&mut g, row, Stat::dz(i, i, k), -2.0 / nu[i]);
                }
                if i == k {
                    add_ld(&mut g, row, Stat::dz(i, j, i), -2.0 / nu[i]);
                }
                g[(row, row)] += -rho / 2.0;
                if let Some(m) = migration {
                    for c in 0..p {
                        if c != i && m[(i, c)] != 0.0 {
                            let rate = m[(i, c)];
                            add_ld(&mut g, row, Stat::dz(c, j, k), rate);
                            add_ld(&mut g, row, Stat::dz(i, j, k), -rate);
                            add_ld(&mut g, row, Stat::pi2(i, j, i, k), 4.0 * rate);
                            add_ld(&mut g, row, Stat::pi2(i, j, c, k), -4.0 * rate);
                            add_ld(&mut g, row, Stat::pi2(c, j, i, k), -4.0 * rate);
                            add_ld(&mut g, row, Stat::pi2(c, j, c, k), 4.0 * rate);
                        }
                        if c != j && m[(j, c)] != 0.0 {
                            let rate = m[(j, c)];
                            add_ld(&mut g, row, Stat::dz(i, c, k), rate);
                            add_ld(&mut g, row, Stat::dz(i, j, k), -rate);
                        }
                        if c != k && m[(k, c)] != 0.0 {
                            let rate = m[(k, c)];
                            add_ld(&mut g, row, Stat::dz(i, j, c), rate);
                            add_ld(&mut g, row, Stat::dz(i, j, k), -rate);
                        }
                    }
                }
            }
            Stat::Pi2(i, j, k, l) => {
                if i == j {
                    add_ld(&mut g, row, Stat::pi2(i, i, k, l), -1.0 / nu[i]);
                }
                if k == l {
                    add_ld(&mut g, row, Stat::pi2(i, j, k, k), -1.0 / nu[k]);
                }
                if i == k {
                    add_ld(&mut g, row, Stat::dz(i, j, l), 0.25 / nu[i]);
                }
                if i == l {
                    add_ld(&mut g, row, Stat::dz(i, j, k), 0.25 / nu[i]);
                }
                if j == k {
                    add_ld(&mut g, row, Stat::dz(j, i, l), 0.25 / nu[j]);
                }
                if j == l {
                    add_ld(&mut g, row, Stat::dz(j, i, k), 0.25 / nu[j]);
                }
                // mutation feeds the joint heterozygosity from the one-locus block
                g[(row, n_ld + basis.het_index(i, j))] += theta / 4.0;
                g[(row, n_ld + basis.het_index(k, l))] += theta / 4.0;
                if let Some(m) = migration {
                    let positions = [(0usize, i), (1, j), (2, k), (3, l)];
                    for (slot, idx) in positions {
                        for c in 0..p {
                            if c == idx || m[(idx, c)] == 0.0 {
                                continue;
                            }
                            let rate = m[(idx, c)];
                            let replaced = |new_idx: usize| -> Stat {
                                let mut q = [i, j, k, l];
                                q[slot] = new_idx;
                                Stat::pi2(q[0], q[1], q[2], q[3])
                            };
                            add_ld(&mut g, row, replaced(c), rate);
                            add_ld(&mut g, row, replaced(idx), -rate);
                        }
                    }
                }
            }
        }
    }

    // heterozygosity block rows
    for (h_row, &(i, j)) in basis.het.iter().enumerate() {
        let row = n_ld + h_row;
        if i == j {
            g[(row, n_ld + basis.het_index(i, i))] += -1.0 / nu[i];
        }
        g[(row, one)] += theta;
        if let Some(m) = migration {
            for (a, b) in [(i, j), (j, i)] {
                for c in 0..p {
                    if c == a || m[(a, c)] == 0.0 {
                        continue;
                    }
                    let rate = m[(a, c)];
                    g[(row, n_ld + basis.het_index(c, b))] += rate;
                    g[(row, n_ld + basis.het_index(a, b))] += -rate;
                }
            }
        }
    }

    // the constant component is constant
    Ok(g)
}

#[cfg(test)]
mod tests {
    use nalgebra::DMatrix;

    use super::{generator, Basis, Stat};

    #[test]
    fn test_basis_sizes() {
        let b1 = Basis::new(1);
        assert_eq!(b1.ld.len(), 3);
        assert_eq!(b1.het.len(), 1);
        let b3 = Basis::new(3);
        // 6 DD + 3 * 6 Dz + C(6 + 1, 2) pi2
        assert_eq!(b3.ld.len(), 6 + 18 + 21);
        assert_eq!(b3.het.len(), 6);
    }

    #[test]
    fn test_canonicalization() {
        assert_eq!(Stat::dd(2, 0), Stat::DD(0, 2));
        assert_eq!(Stat::dz(1, 2, 0), Stat::Dz(1, 0, 2));
        assert_eq!(Stat::pi2(1, 0, 0, 0), Stat::Pi2(0, 0, 0, 1));
        assert_eq!(Stat::pi2(2, 1, 1, 0), Stat::Pi2(0, 1, 1, 2));
        assert_eq!(Stat::pi2(0, 1, 0, 0).name(), "pi2_1_1_1_2");
    }

    #[test]
    fn test_one_population_rows_are_hill_robertson() {
        let basis = Basis::new(1);
        let g = generator(&basis, &[1.0], 0.0, 0.0, None).unwrap();
        let dd = basis.ld_index(Stat::DD(0, 0));
        let dz = basis.ld_index(Stat::Dz(0, 0, 0));
        let pi2 = basis.ld_index(Stat::Pi2(0, 0, 0, 0));
        assert_eq!(g[(dd, dd)], -3.0);
        assert_eq!(g[(dd, dz)], 1.0);
        assert_eq!(g[(dd, pi2)], 1.0);
        assert_eq!(g[(dz, dd)], 4.0);
        assert_eq!(g[(dz, dz)], -5.0);
        assert_eq!(g[(dz, pi2)], 0.0);
        assert_eq!(g[(pi2, dz)], 1.0);
        assert_eq!(g[(pi2, pi2)], -2.0);
    }

    #[test]
    fn test_single_population_statistics_decouple_without_migration() {
        // with m = 0, the rows of statistics carried entirely by population 1 reference
        // nothing outside population 1: after a split the marginal system is unchanged
        let b2 = Basis::new(2);
        let g = generator(&b2, &[1.0, 0.3], 0.8, 0.05, None).unwrap();
        let pure: Vec<usize> = b2
            .ld
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == s.relabel(|_| 0))
            .map(|(pos, _)| pos)
            .collect();
        for &row in &pure {
            for (col, stat) in b2.ld.iter().enumerate() {
                if *stat != stat.relabel(|_| 0) {
                    assert_eq!(
                        g[(row, col)],
                        0.0,
                        "{} row references {}",
                        b2.ld[row].name(),
                        stat.name()
                    );
                }
            }
            for (h_pos, &(i, j)) in b2.het.iter().enumerate() {
                if (i, j) != (0, 0) {
                    assert_eq!(g[(row, b2.ld.len() + h_pos)], 0.0);
                }
            }
        }
    }

    #[test]
    fn test_migration_rows_balance() {
        // migration redistributes statistics: every migration contribution enters with a
        // matched positive and negative weight, so the row sums of the migration part
        // vanish on the subspace where all statistics of a kind are equal
        let b2 = Basis::new(2);
        let theta = 0.0;
        let base = generator(&b2, &[1.0, 1.0], 0.0, theta, None).unwrap();
        let mig = DMatrix::from_row_slice(2, 2, &[0.0, 1.5, 0.4, 0.0]);
        let with_m = generator(&b2, &[1.0, 1.0], 0.0, theta, Some(&mig)).unwrap();
        let diff = &with_m - &base;

        // on a state where every DD, Dz, pi2 and H coordinate equals 1, the migration
        // terms cancel pairwise in every row
        let y = nalgebra::DVector::<f64>::from_element(b2.state_len(), 1.0);
        let dy = &diff * &y;
        for row in 0..b2.state_len() - 1 {
            assert!(
                dy[row].abs() < 1e-12,
                "migration imbalance {} in row {}",
                dy[row],
                row
            );
        }
    }
}
