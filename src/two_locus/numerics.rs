//! Sparse operators of the two-locus moment system on the haplotype-count simplex
//! {(i, j, k) : i + j + k <= n}, with i, j, k counting AB, Ab and aB haplotypes and the
//! ab count implicit. Drift is the 13-term Moran kernel over the four haplotype classes,
//! recombination and selection map the n-sample state to n+1 samples and are closed back
//! by a quadratic jackknife on the simplex.

use nalgebra::{DMatrix, DVector};
use ndarray::Array3;
use sprs::{CsMat, TriMat};

use crate::core::MomentError;
use crate::utils::{ln_binomial, solve_linear_system};

/// Number of ordered triples (i, j, k) with i + j + k <= n.
pub fn simplex_size(n: usize) -> usize {
    (n + 1) * (n + 2) * (n + 3) / 6
}

/// Bidirectional map between simplex triples and their lexicographic flat index.
pub struct SimplexIndex {
    n: usize,
    triples: Vec<(usize, usize, usize)>,
    lookup: Vec<usize>,
}

impl SimplexIndex {
    pub fn new(n: usize) -> Self {
        let d = n + 1;
        let mut triples = Vec::with_capacity(simplex_size(n));
        let mut lookup = vec![usize::MAX; d * d * d];
        for i in 0..=n {
            for j in 0..=(n - i) {
                for k in 0..=(n - i - j) {
                    lookup[(i * d + j) * d + k] = triples.len();
                    triples.push((i, j, k));
                }
            }
        }
        Self { n, triples, lookup }
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn len(&self) -> usize {
        self.triples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triples.is_empty()
    }

    /// Flat index of the triple, or `None` outside the simplex.
    pub fn get(&self, i: usize, j: usize, k: usize) -> Option<usize> {
        let d = self.n + 1;
        if i >= d || j >= d || k >= d {
            return None;
        }
        match self.lookup[(i * d + j) * d + k] {
            usize::MAX => None,
            found => Some(found),
        }
    }

    /// Flat index of a triple known to lie in the simplex.
    pub fn index(&self, i: usize, j: usize, k: usize) -> usize {
        self.get(i, j, k).expect("triple outside the simplex")
    }

    pub fn triples(&self) -> &[(usize, usize, usize)] {
        &self.triples
    }

    /// Flatten the cube array onto the simplex.
    pub fn to_flat(&self, f: &Array3<f64>) -> Vec<f64> {
        self.triples.iter().map(|&(i, j, k)| f[[i, j, k]]).collect()
    }

    /// Scatter a flat simplex vector back into the cube, zero outside the simplex.
    pub fn to_array(&self, phi: &[f64]) -> Array3<f64> {
        let d = self.n + 1;
        let mut f = Array3::<f64>::zeros((d, d, d));
        for (&(i, j, k), &v) in self.triples.iter().zip(phi) {
            f[[i, j, k]] = v;
        }
        f
    }
}

/// The two-locus drift operator. Fixed classes are sinks; boundary classes where one
/// locus is monomorphic drift with the one-locus kernel along the other locus.
pub fn drift(idx: &SimplexIndex) -> CsMat<f64> {
    let n = idx.n();
    let nf = n as f64;
    let size = idx.len();
    let mut tri = TriMat::new((size, size));

    for &(i, j, k) in idx.triples() {
        let f_a = i + j;
        let f_b = i + k;
        if f_a == n || f_b == n {
            continue;
        }
        let (fi, fj, fk) = (i as f64, j as f64, k as f64);
        let fl = nf - fi - fj - fk;
        let this = idx.index(i, j, k);

        if f_a == 0 {
            // one-locus drift along the aB axis
            if k == 0 || k == n {
                continue;
            }
            tri.add_triplet(this, idx.index(i, j, k - 1), (fk - 1.0) * (nf - fk + 1.0));
            tri.add_triplet(this, this, -2.0 * fk * (nf - fk));
            tri.add_triplet(this, idx.index(i, j, k + 1), (fk + 1.0) * (nf - fk - 1.0));
        } else if f_b == 0 {
            // one-locus drift along the Ab axis
            if j == 0 || j == n {
                continue;
            }
            tri.add_triplet(this, idx.index(i, j - 1, k), (fj - 1.0) * (nf - fj + 1.0));
            tri.add_triplet(this, this, -2.0 * fj * (nf - fj));
            tri.add_triplet(this, idx.index(i, j + 1, k), (fj + 1.0) * (nf - fj - 1.0));
        } else {
            if i > 0 {
                tri.add_triplet(this, idx.index(i - 1, j, k), (fi - 1.0) * (fl + 1.0));
                tri.add_triplet(this, idx.index(i - 1, j, k + 1), (fi - 1.0) * (fk + 1.0));
                tri.add_triplet(this, idx.index(i - 1, j + 1, k), (fi - 1.0) * (fj + 1.0));
            }
            if fl > 0.0 {
                tri.add_triplet(this, idx.index(i + 1, j, k), (fi + 1.0) * (fl - 1.0));
                tri.add_triplet(this, idx.index(i, j + 1, k), (fj + 1.0) * (fl - 1.0));
                tri.add_triplet(this, idx.index(i, j, k + 1), (fk + 1.0) * (fl - 1.0));
            }
            if k > 0 {
                tri.add_triplet(this, idx.index(i + 1, j, k - 1), (fi + 1.0) * (fk - 1.0));
                tri.add_triplet(this, idx.index(i, j + 1, k - 1), (fj + 1.0) * (fk - 1.0));
                tri.add_triplet(this, idx.index(i, j, k - 1), (fk - 1.0) * (fl + 1.0));
            }
            if j > 0 {
                tri.add_triplet(this, idx.index(i + 1, j - 1, k), (fi + 1.0) * (fj - 1.0));
                tri.add_triplet(this, idx.index(i, j - 1, k), (fj - 1.0) * (fl + 1.0));
                tri.add_triplet(this, idx.index(i, j - 1, k + 1), (fj - 1.0) * (fk + 1.0));
            }
            let pairs = fi * fl + fi * fk + fi * fj + fj * fl + fj * fk + fk * fl;
            tri.add_triplet(this, this, -2.0 * pairs);
        }
    }
    tri.to_csr()
}

/// The drift operator of the reversible-mutation model: the same Moran kernel applied on
/// every class with no absorption, so that the fixed classes exchange density with the
/// rest of the simplex and total density is conserved.
pub fn drift_reversible(idx: &SimplexIndex) -> CsMat<f64> {
    let n = idx.n();
    let nf = n as f64;
    let size = idx.len();
    let mut tri = TriMat::new((size, size));

    for &(i, j, k) in idx.triples() {
        let (fi, fj, fk) = (i as f64, j as f64, k as f64);
        let fl = nf - fi - fj - fk;
        let this = idx.index(i, j, k);
        if i > 0 {
            tri.add_triplet(this, idx.index(i - 1, j, k), (fi - 1.0) * (fl + 1.0));
            tri.add_triplet(this, idx.index(i - 1, j, k + 1), (fi - 1.0) * (fk + 1.0));
            tri.add_triplet(this, idx.index(i - 1, j + 1, k), (fi - 1.0) * (fj + 1.0));
        }
        if fl > 0.0 {
            tri.add_triplet(this, idx.index(i + 1, j, k), (fi + 1.0) * (fl - 1.0));
            tri.add_triplet(this, idx.index(i, j + 1, k), (fj + 1.0) * (fl - 1.0));
            tri.add_triplet(this, idx.index(i, j, k + 1), (fk + 1.0) * (fl - 1.0));
        }
        if k > 0 {
            tri.add_triplet(this, idx.index(i + 1, j, k - 1), (fi + 1.0) * (fk - 1.0));
            tri.add_triplet(this, idx.index(i, j + 1, k - 1), (fj + 1.0) * (fk - 1.0));
            tri.add_triplet(this, idx.index(i, j, k - 1), (fk - 1.0) * (fl + 1.0));
        }
        if j > 0 {
            tri.add_triplet(this, idx.index(i + 1, j - 1, k), (fi + 1.0) * (fj - 1.0));
            tri.add_triplet(this, idx.index(i, j - 1, k), (fj - 1.0) * (fl + 1.0));
            tri.add_triplet(this, idx.index(i, j - 1, k + 1), (fj - 1.0) * (fk + 1.0));
        }
        let pairs = fi * fl + fi * fk + fi * fj + fj * fl + fj * fk + fk * fl;
        tri.add_triplet(this, this, -2.0 * pairs);
    }
    tri.to_csr()
}

/// The infinite-sites mutation model: a constant source injecting the first mutation at
/// either locus from the fixed ancestral state, and a linear term dropping the second
/// mutation onto existing single-locus backgrounds.
pub fn mutations_ism(idx: &SimplexIndex, theta: f64) -> (Vec<f64>, CsMat<f64>) {
    let n = idx.n();
    let nf = n as f64;
    let size = idx.len();

    let mut source = vec![0.0; size];
    source[idx.index(0, 0, 1)] = nf * theta / 2.0;
    source[idx.index(0, 1, 0)] = nf * theta / 2.0;

    let mut tri = TriMat::new((size, size));
    // B mutation on an A background or an a background
    for j in 0..n.saturating_sub(1) {
        tri.add_triplet(
            idx.index(1, j, 0),
            idx.index(0, j + 1, 0),
            (j + 1) as f64 * theta / 2.0,
        );
    }
    for j in 1..n {
        tri.add_triplet(
            idx.index(0, j, 1),
            idx.index(0, j, 0),
            (nf - j as f64) * theta / 2.0,
        );
    }
    // A mutation on a B background or a b background
    for k in 0..n.saturating_sub(1) {
        tri.add_triplet(
            idx.index(1, 0, k),
            idx.index(0, 0, k + 1),
            (k + 1) as f64 * theta / 2.0,
        );
    }
    for k in 1..n {
        tri.add_triplet(
            idx.index(0, 1, k),
            idx.index(0, 0, k),
            (nf - k as f64) * theta / 2.0,
        );
    }
    (source, tri.to_csr())
}

/// The reversible mutation operator with equal forward and backward rates, `u` at the
/// left locus and `v` at the right locus.
pub fn mutations_reversible(idx: &SimplexIndex, u: f64, v: f64) -> CsMat<f64> {
    let n = idx.n();
    let nf = n as f64;
    let size = idx.len();
    let mut tri = TriMat::new((size, size));

    for &(i, j, k) in idx.triples() {
        let this = idx.index(i, j, k);
        let (fi, fj, fk) = (i as f64, j as f64, k as f64);
        let fl = nf - fi - fj - fk;
        if i > 0 {
            tri.add_triplet(this, idx.index(i - 1, j, k + 1), u * (fk + 1.0));
            tri.add_triplet(this, idx.index(i - 1, j + 1, k), v * (fj + 1.0));
        }
        if j > 0 {
            tri.add_triplet(this, idx.index(i, j - 1, k), u * (fl + 1.0));
            tri.add_triplet(this, idx.index(i + 1, j - 1, k), v * (fi + 1.0));
        }
        if k > 0 {
            tri.add_triplet(this, idx.index(i + 1, j, k - 1), u * (fi + 1.0));
            tri.add_triplet(this, idx.index(i, j, k - 1), v * (fl + 1.0));
        }
        if fl > 0.0 {
            tri.add_triplet(this, idx.index(i, j + 1, k), u * (fj + 1.0));
            tri.add_triplet(this, idx.index(i, j, k + 1), v * (fk + 1.0));
        }
        tri.add_triplet(this, this, -(u + v) * nf);
    }
    tri.to_csr()
}

/// The boundary-injection variant of the reversible model: mutations fire only while the
/// focal locus is monomorphic, and density reaching a fixed class is recycled to the
/// ancestral state.
pub fn mutations_reversible_alternate(idx: &SimplexIndex, u: f64, v: f64) -> CsMat<f64> {
    let n = idx.n();
    let nf = n as f64;
    let size = idx.len();
    let mut tri = TriMat::new((size, size));

    // new A mutations along the aB/ab axis
    for k in 0..n.saturating_sub(1) {
        let w = (k + 1) as f64 * u / 2.0;
        tri.add_triplet(idx.index(1, 0, k), idx.index(0, 0, k + 1), w);
        tri.add_triplet(idx.index(0, 0, k + 1), idx.index(0, 0, k + 1), -w);
        let w = (nf - k as f64) * u / 2.0;
        tri.add_triplet(idx.index(0, 1, k), idx.index(0, 0, k), w);
        tri.add_triplet(idx.index(0, 0, k), idx.index(0, 0, k), -w);
    }
    // new B mutations along the Ab/ab axis
    for j in 0..n.saturating_sub(1) {
        let w = (j + 1) as f64 * v / 2.0;
        tri.add_triplet(idx.index(1, j, 0), idx.index(0, j + 1, 0), w);
        tri.add_triplet(idx.index(0, j + 1, 0), idx.index(0, j + 1, 0), -w);
        let w = (nf - j as f64) * v / 2.0;
        tri.add_triplet(idx.index(0, j, 1), idx.index(0, j, 0), w);
        tri.add_triplet(idx.index(0, j, 0), idx.index(0, j, 0), -w);
    }
    // recycle the fixed classes
    let origin = idx.index(0, 0, 0);
    for fixed in [idx.index(n, 0, 0), idx.index(0, n, 0), idx.index(0, 0, n)] {
        tri.add_triplet(origin, fixed, 1.0);
        tri.add_triplet(fixed, fixed, -1.0);
    }
    tri.to_csr()
}

/// The recombination operator at unit rho, mapping the n-sample state onto the
/// (n+1)-sample basis. The coefficients are the probabilities that a random sampled pair
/// recombines into or out of each haplotype class.
pub fn recombination(idx_n: &SimplexIndex, idx_up: &SimplexIndex) -> CsMat<f64> {
    let n = idx_n.n();
    let nf = n as f64;
    let mut tri = TriMat::new((idx_n.len(), idx_up.len()));
    let scale = 1.0 / (2.0 * (nf + 1.0));

    for &(i, j, k) in idx_n.triples() {
        let f_a = i + j;
        let f_b = i + k;
        if f_a == 0 || f_a == n || f_b == 0 || f_b == n {
            continue;
        }
        let (fi, fj, fk) = (i as f64, j as f64, k as f64);
        let fl = nf - fi - fj - fk;
        let this = idx_n.index(i, j, k);

        // incoming
        if j > 0 {
            tri.add_triplet(this, idx_up.index(i + 1, j - 1, k), scale * (fi + 1.0) * (fl + 1.0));
        }
        if k > 0 {
            tri.add_triplet(this, idx_up.index(i + 1, j, k - 1), scale * (fi + 1.0) * (fl + 1.0));
        }
        if i > 0 {
            tri.add_triplet(this, idx_up.index(i - 1, j + 1, k + 1), scale * (fj + 1.0) * (fk + 1.0));
        }
        if i + j + k < n {
            tri.add_triplet(this, idx_up.index(i, j + 1, k + 1), scale * (fj + 1.0) * (fk + 1.0));
        }
        // outgoing
        tri.add_triplet(this, idx_up.index(i + 1, j, k), -scale * (fi + 1.0) * fl);
        tri.add_triplet(this, idx_up.index(i, j + 1, k), -scale * (fj + 1.0) * fk);
        tri.add_triplet(this, idx_up.index(i, j, k + 1), -scale * fj * (fk + 1.0));
        tri.add_triplet(this, idx_up.index(i, j, k), -scale * fi * (fl + 1.0));
    }
    tri.to_csr()
}

/// The additive selection operator for haplotype fitnesses (s_AB, s_A, s_B), mapping the
/// n-sample state to n+1 samples; epistasis enters when s_AB != s_A + s_B.
pub fn selection(
    idx_n: &SimplexIndex,
    idx_up: &SimplexIndex,
    sel_params: [f64; 3],
) -> CsMat<f64> {
    let n = idx_n.n();
    let nf = n as f64;
    let [s_ab, s_a, s_b] = sel_params;
    let mut tri = TriMat::new((idx_n.len(), idx_up.len()));
    let scale = 1.0 / (nf + 1.0);

    for &(i, j, k) in idx_n.triples() {
        let (fi, fj, fk) = (i as f64, j as f64, k as f64);
        let fl = nf - fi - fj - fk;
        let this = idx_n.index(i, j, k);
        if i > 0 {
            tri.add_triplet(
                this,
                idx_up.index(i + 1, j, k),
                scale * (-s_ab * (fi + 1.0) * (nf - fi) + s_a * (fi + 1.0) * fj + s_b * (fi + 1.0) * fk),
            );
        }
        if j > 0 {
            tri.add_triplet(
                this,
                idx_up.index(i, j + 1, k),
                scale * (s_ab * fi * (fj + 1.0) - s_a * (fj + 1.0) * (nf - fj) + s_b * (fj + 1.0) * fk),
            );
        }
        if k > 0 {
            tri.add_triplet(
                this,
                idx_up.index(i, j, k + 1),
                scale * (s_ab * fi * (fk + 1.0) + s_a * fj * (fk + 1.0) - s_b * (fk + 1.0) * (nf - fk)),
            );
        }
        if fl > 0.0 {
            tri.add_triplet(
                this,
                idx_up.index(i, j, k),
                scale * (s_ab * fi * (fl + 1.0) + s_a * fj * (fl + 1.0) + s_b * fk * (fl + 1.0)),
            );
        }
    }
    tri.to_csr()
}

/// Dirichlet moment of the n-sample multinomial kernel at triple (i, j, k) against the
/// monomial x1^a x2^b x3^c.
fn simplex_kernel_moment(n: usize, triple: (usize, usize, usize), expo: (usize, usize, usize)) -> f64 {
    let (i, j, k) = triple;
    let (a, b, c) = expo;
    let mut value = 1.0;
    for t in 1..=a {
        value *= (i + t) as f64;
    }
    for t in 1..=b {
        value *= (j + t) as f64;
    }
    for t in 1..=c {
        value *= (k + t) as f64;
    }
    for t in 1..=(a + b + c + 3) {
        value /= (n + t) as f64;
    }
    value
}

const MONOMIALS: [(usize, usize, usize); 10] = [
    (0, 0, 0),
    (1, 0, 0),
    (0, 1, 0),
    (0, 0, 1),
    (2, 0, 0),
    (0, 2, 0),
    (0, 0, 2),
    (1, 1, 0),
    (1, 0, 1),
    (0, 1, 1),
];

/// The quadratic jackknife on the simplex, extrapolating the n-sample state to n+1
/// samples. Each target triple is matched against the ten quadratic monomial moments on a
/// local stencil of source triples, solved in least squares; this is the closure used to
/// restrict the recombination and selection operators back to the n-sample basis.
pub fn jackknife(idx_n: &SimplexIndex, idx_up: &SimplexIndex) -> Result<CsMat<f64>, MomentError> {
    let n = idx_n.n();
    if n < 3 {
        return Err(MomentError::SampleSizeTooSmall(
            n,
            "the two-locus jackknife".to_string(),
        ));
    }
    let mut tri = TriMat::new((idx_up.len(), idx_n.len()));

    for &(ti, tj, tk) in idx_up.triples() {
        let target = idx_up.index(ti, tj, tk);
        // rescaled center of the stencil in the source simplex
        let scale = n as f64 / (n + 1) as f64;
        let ci = (ti as f64 * scale).round() as i64;
        let cj = (tj as f64 * scale).round() as i64;
        let ck = (tk as f64 * scale).round() as i64;

        let mut stencil: Vec<(usize, usize, usize)> = Vec::new();
        for radius in 1..=(n as i64) {
            stencil.clear();
            for &(si, sj, sk) in idx_n.triples() {
                if (si as i64 - ci).abs() <= radius
                    && (sj as i64 - cj).abs() <= radius
                    && (sk as i64 - ck).abs() <= radius
                {
                    stencil.push((si, sj, sk));
                }
            }
            if stencil.len() >= MONOMIALS.len() {
                break;
            }
        }

        // match the ten quadratic moments, rows normalized for conditioning
        let mut a = DMatrix::<f64>::zeros(MONOMIALS.len(), stencil.len());
        let mut b = DVector::<f64>::zeros(MONOMIALS.len());
        for (r, &expo) in MONOMIALS.iter().enumerate() {
            let rhs = simplex_kernel_moment(n + 1, (ti, tj, tk), expo);
            let row_scale = 1.0 / simplex_kernel_moment(n, (0, 0, 0), expo).max(f64::MIN_POSITIVE);
            for (c, &src) in stencil.iter().enumerate() {
                a[(r, c)] = row_scale * simplex_kernel_moment(n, src, expo);
            }
            b[r] = row_scale * rhs;
        }
        let alpha = solve_linear_system(&a, &b)?;
        for (c, &(si, sj, sk)) in stencil.iter().enumerate() {
            if alpha[c] != 0.0 {
                tri.add_triplet(target, idx_n.index(si, sj, sk), alpha[c]);
            }
        }
    }
    Ok(tri.to_csr())
}

/// Hypergeometric projection of the two-locus spectrum to a smaller sample size,
/// with the one-locus boundary lines recomputed from the boundary alone so that the
/// background biallelic spectra stay pure.
pub fn project(
    f_from: &Array3<f64>,
    mask_from: &Array3<bool>,
    proj_to: usize,
) -> Result<Array3<f64>, MomentError> {
    let d_from = f_from.shape()[0];
    let proj_from = d_from - 1;
    if proj_to > proj_from {
        return Err(MomentError::InvalidParameter(
            "proj_to".to_string(),
            format!("cannot project up from {} to {} samples", proj_from, proj_to),
        ));
    }
    if proj_to == proj_from {
        return Ok(f_from.clone());
    }
    let d_to = proj_to + 1;
    let mut out = Array3::<f64>::zeros((d_to, d_to, d_to));

    let accumulate = |hits: (usize, usize, usize), weight_value: f64, out: &mut Array3<f64>| {
        let (x1, x2, x3) = hits;
        let x4 = proj_from - x1 - x2 - x3;
        let log_denom = ln_binomial(proj_from as f64, proj_to as f64);
        for ii in 0..=x1.min(proj_to) {
            for jj in 0..=x2.min(proj_to - ii) {
                for kk in 0..=x3.min(proj_to - ii - jj) {
                    let ll = proj_to - ii - jj - kk;
                    if ll > x4 {
                        continue;
                    }
                    let log_w = ln_binomial(x1 as f64, ii as f64)
                        + ln_binomial(x2 as f64, jj as f64)
                        + ln_binomial(x3 as f64, kk as f64)
                        + ln_binomial(x4 as f64, ll as f64)
                        - log_denom;
                    out[[ii, jj, kk]] += weight_value * log_w.exp();
                }
            }
        }
    };

    for x1 in 0..=proj_from {
        for x2 in 0..=(proj_from - x1) {
            for x3 in 0..=(proj_from - x1 - x2) {
                if !mask_from[[x1, x2, x3]] {
                    accumulate((x1, x2, x3), f_from[[x1, x2, x3]], &mut out);
                }
            }
        }
    }

    // rebuild the one-locus boundary lines from boundary density alone
    for jj in 0..d_to {
        out[[0, jj, 0]] = 0.0;
        out[[0, 0, jj]] = 0.0;
    }
    for x2 in 1..proj_from {
        accumulate((0, x2, 0), f_from[[0, x2, 0]], &mut out);
    }
    for x3 in 1..proj_from {
        accumulate((0, 0, x3), f_from[[0, 0, x3]], &mut out);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simplex_index_is_lexicographic_bijection() {
        let idx = SimplexIndex::new(6);
        assert_eq!(idx.len(), simplex_size(6));
        for (flat, &(i, j, k)) in idx.triples().iter().enumerate() {
            assert_eq!(idx.index(i, j, k), flat);
        }
        assert!(idx.get(4, 2, 1).is_none()); // outside the simplex
        assert_eq!(idx.get(0, 0, 0), Some(0));
    }

    #[test]
    fn test_reversible_drift_conserves_density() {
        // with no absorption every column of the generator sums to zero
        let idx = SimplexIndex::new(6);
        let d = drift_reversible(&idx);
        let mut col_sums = vec![0.0; idx.len()];
        for (_row, vec) in d.outer_iterator().enumerate() {
            for (col, &val) in vec.iter() {
                col_sums[col] += val;
            }
        }
        for (col, &s) in col_sums.iter().enumerate() {
            assert!(s.abs() < 1e-9, "column {} sums to {}", col, s);
        }
    }

    #[test]
    fn test_drift_marginal_matches_one_locus_kernel() {
        // the left-locus marginal of the drift action on an interior-supported state
        // follows the one-locus Moran kernel applied to the marginal
        let n = 8;
        let idx = SimplexIndex::new(n);
        let d = drift(&idx);

        // an interior state: support away from all monomorphic boundaries
        let mut phi = vec![0.0; idx.len()];
        for (flat, &(i, j, k)) in idx.triples().iter().enumerate() {
            let f_a = i + j;
            let f_b = i + k;
            if (2..n - 1).contains(&f_a) && (2..n - 1).contains(&f_b) {
                phi[flat] = 1.0 + (flat % 7) as f64 * 0.1;
            }
        }
        let mut dphi = vec![0.0; idx.len()];
        for (row, vec) in d.outer_iterator().enumerate() {
            for (col, &val) in vec.iter() {
                dphi[row] += val * phi[col];
            }
        }

        // marginalize both sides over the left locus
        let mut marg = vec![0.0; n + 1];
        let mut dmarg = vec![0.0; n + 1];
        for (flat, &(i, j, _k)) in idx.triples().iter().enumerate() {
            marg[i + j] += phi[flat];
            dmarg[i + j] += dphi[flat];
        }
        let d1 = crate::numerics::one_dim::drift_matrix(n + 1);
        for row in 0..=n {
            let expected: f64 = (0..=n).map(|c| d1[(row, c)] * marg[c]).sum();
            assert!(
                (dmarg[row] - expected).abs() < 1e-9,
                "row {}: {} vs {}",
                row,
                dmarg[row],
                expected
            );
        }
    }

    #[test]
    fn test_jackknife_exact_on_quadratic_densities() {
        let n = 8;
        let idx_n = SimplexIndex::new(n);
        let idx_up = SimplexIndex::new(n + 1);
        let jk = jackknife(&idx_n, &idx_up).unwrap();

        for expo in [(0, 0, 0), (1, 0, 0), (0, 0, 2), (1, 0, 1)] {
            let phi: Vec<f64> = idx_n
                .triples()
                .iter()
                .map(|&t| simplex_kernel_moment(n, t, expo))
                .collect();
            let expected: Vec<f64> = idx_up
                .triples()
                .iter()
                .map(|&t| simplex_kernel_moment(n + 1, t, expo))
                .collect();
            let mut found = vec![0.0; idx_up.len()];
            for (row, vec) in jk.outer_iterator().enumerate() {
                for (col, &val) in vec.iter() {
                    found[row] += val * phi[col];
                }
            }
            for (f, e) in found.iter().zip(&expected) {
                assert!((f - e).abs() < 1e-9 * e.abs().max(1e-3), "{} vs {}", f, e);
            }
        }
    }

    #[test]
    fn test_recombination_decays_d_at_half_unit_rate() {
        // at unit rho the closed operator R.J drives the unbiased D estimator at rate
        // -1/2; for a linear density the jackknife is exact, so the identity is sharp
        let n = 9;
        let idx_n = SimplexIndex::new(n);
        let idx_up = SimplexIndex::new(n + 1);
        let r = recombination(&idx_n, &idx_up);
        let jk = jackknife(&idx_n, &idx_up).unwrap();
        let closed = &r * &jk;

        let phi: Vec<f64> = idx_n
            .triples()
            .iter()
            .map(|&t| simplex_kernel_moment(n, t, (1, 0, 0)))
            .collect();
        let mut dphi = vec![0.0; idx_n.len()];
        for (row, vec) in closed.outer_iterator().enumerate() {
            for (col, &val) in vec.iter() {
                dphi[row] += val * phi[col];
            }
        }

        let d_estimator = |v: &[f64]| -> f64 {
            let nf = n as f64;
            idx_n
                .triples()
                .iter()
                .zip(v)
                .map(|(&(i, j, k), &w)| {
                    let l = n - i - j - k;
                    w * ((i * l) as f64 - (j * k) as f64) / (nf * (nf - 1.0))
                })
                .sum()
        };
        let d0 = d_estimator(&phi);
        let d1 = d_estimator(&dphi);
        assert!(d0 > 0.0);
        assert!(
            (d1 / d0 + 0.5).abs() < 1e-8,
            "relative decay rate {} instead of -0.5",
            d1 / d0
        );
    }

    #[test]
    fn test_project_keeps_boundary_lines_pure() {
        let n = 6;
        let d = n + 1;
        let mut f = Array3::<f64>::zeros((d, d, d));
        let mask = Array3::<bool>::from_elem((d, d, d), false);
        // interior density plus a boundary line entry
        f[[1, 2, 1]] = 1.0;
        f[[0, 3, 0]] = 2.0;
        let proj = project(&f, &mask, 4).unwrap();
        // the [0, :, 0] line only receives contributions from boundary density
        let direct: f64 = {
            // hypergeometric weight of (0, 3, 0) -> (0, 2, 0) at n 6 -> 4
            let w = (crate::utils::binomial(3, 2) * crate::utils::binomial(3, 2))
                / crate::utils::binomial(6, 4);
            2.0 * w
        };
        assert!((proj[[0, 2, 0]] - direct).abs() < 1e-12);
    }
}
