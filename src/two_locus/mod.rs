//! The two-locus haplotype frequency spectrum and its summary statistics.

pub mod integration;
pub mod numerics;

use std::fs;
use std::path::Path;

use ndarray::Array3;

use crate::core::MomentError;
use crate::utils::binomial;

pub use integration::{integrate, TwoLocusOptions};
pub use numerics::{simplex_size, SimplexIndex};

/// A two-locus frequency spectrum for sample size n: a cube of shape (n+1)^3 indexed by
/// the counts (i, j, k) of AB, Ab and aB haplotypes, with entries outside the simplex
/// i + j + k <= n masked as infeasible.
#[derive(Clone, Debug)]
pub struct TwoLocusSpectrum {
    data: Array3<f64>,
    mask: Array3<bool>,
    folded: bool,
}

impl TwoLocusSpectrum {
    /// Build a spectrum from a data cube.
    ///
    /// # Arguments
    ///
    /// * `data`: The (n+1)^3 data cube.
    /// * `mask`: Optional mask of the same shape.
    /// * `mask_infeasible`: Whether to mask entries outside the simplex.
    /// * `folded`: Whether the data is folded for the major/minor allele labeling.
    ///
    /// returns: `Result<TwoLocusSpectrum, MomentError>`
    pub fn new(
        data: Array3<f64>,
        mask: Option<Array3<bool>>,
        mask_infeasible: bool,
        folded: bool,
    ) -> Result<Self, MomentError> {
        let shape = data.shape().to_vec();
        if shape[0] < 2 || shape[0] != shape[1] || shape[0] != shape[2] {
            return Err(MomentError::InvalidParameter(
                "data".to_string(),
                format!("a two-locus spectrum must be a cube of side >= 2, got {:?}", shape),
            ));
        }
        let mask = match mask {
            Some(m) => {
                if m.shape() != data.shape() {
                    return Err(MomentError::ShapeMismatch(
                        "mask".to_string(),
                        m.shape().to_vec(),
                        shape,
                    ));
                }
                m
            }
            None => Array3::from_elem(data.raw_dim(), false),
        };
        let mut out = Self { data, mask, folded };
        if mask_infeasible {
            out.mask_infeasible();
        }
        Ok(out)
    }

    /// An all-zero spectrum for sample size n with infeasible entries masked.
    pub fn zeros(n: usize) -> Result<Self, MomentError> {
        Self::new(Array3::zeros((n + 1, n + 1, n + 1)), None, true, false)
    }

    pub fn data(&self) -> &Array3<f64> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Array3<f64> {
        &mut self.data
    }

    pub fn mask(&self) -> &Array3<bool> {
        &self.mask
    }

    pub fn folded(&self) -> bool {
        self.folded
    }

    pub fn sample_size(&self) -> usize {
        self.data.shape()[0] - 1
    }

    /// Mask every entry outside the simplex i + j + k <= n.
    pub fn mask_infeasible(&mut self) {
        let n = self.sample_size();
        for ((i, j, k), m) in self.mask.indexed_iter_mut() {
            if i + j + k > n {
                *m = true;
            }
        }
    }

    /// Mask the infeasible entries together with every class where either locus is not
    /// segregating.
    pub fn mask_fixed(&mut self) {
        let n = self.sample_size();
        self.mask_infeasible();
        for ((i, j, k), m) in self.mask.indexed_iter_mut() {
            if i + j + k > n {
                continue;
            }
            let f_a = i + j;
            let f_b = i + k;
            if f_a == 0 || f_a == n || f_b == 0 || f_b == n {
                *m = true;
            }
        }
    }

    /// The marginal one-locus frequency spectrum at the left locus.
    pub fn left(&self) -> Vec<f64> {
        let n = self.sample_size();
        let mut out = vec![0.0; n + 1];
        for i in 0..=n {
            for j in 0..=(n - i) {
                for k in 0..=(n - i - j) {
                    out[i + j] += self.data[[i, j, k]];
                }
            }
        }
        out
    }

    /// The marginal one-locus frequency spectrum at the right locus.
    pub fn right(&self) -> Vec<f64> {
        let n = self.sample_size();
        let mut out = vec![0.0; n + 1];
        for i in 0..=n {
            for j in 0..=(n - i) {
                for k in 0..=(n - i - j) {
                    out[i + k] += self.data[[i, j, k]];
                }
            }
        }
        out
    }

    fn sum_over_segregating<F: Fn(usize, usize, usize, usize) -> f64>(&self, weight: F) -> f64 {
        let n = self.sample_size();
        let mut acc = 0.0;
        for i in 0..=n {
            for j in 0..=(n - i) {
                for k in 0..=(n - i - j) {
                    if self.mask[[i, j, k]] {
                        continue;
                    }
                    let f_a = i + j;
                    let f_b = i + k;
                    if f_a == 0 || f_a == n || f_b == 0 || f_b == n {
                        continue;
                    }
                    acc += self.data[[i, j, k]] * weight(i, j, k, n - i - j - k);
                }
            }
        }
        acc
    }

    /// Expected D over the spectrum; `proj` selects the unbiased sampling estimator over
    /// the naive frequency plug-in.
    pub fn d(&self, proj: bool) -> f64 {
        let n = self.sample_size() as f64;
        self.sum_over_segregating(|i, j, k, l| {
            let (i, j, k, l) = (i as f64, j as f64, k as f64, l as f64);
            if proj {
                (i * l - j * k) / (n * (n - 1.0))
            } else {
                (i * l - j * k) / (n * n)
            }
        })
    }

    /// Expected D^2.
    pub fn d2(&self, proj: bool) -> f64 {
        let n = self.sample_size();
        let nf = n as f64;
        let denom = binomial(n, 4);
        self.sum_over_segregating(|i, j, k, l| {
            let (fi, fj, fk, fl) = (i as f64, j as f64, k as f64, l as f64);
            if proj {
                (binomial(i, 2) * binomial(l, 2) / denom + binomial(j, 2) * binomial(k, 2) / denom
                    - 0.5 * fi * fj * fk * fl / denom)
                    / 3.0
            } else {
                2.0 / nf.powi(4)
                    * (fi * fi * fl * fl + fj * fj * fk * fk - 2.0 * fi * fj * fk * fl)
            }
        })
    }

    /// Expected joint heterozygosity pi2 = p(1-p)q(1-q).
    pub fn pi2(&self, proj: bool) -> f64 {
        let n = self.sample_size();
        let denom = binomial(n, 4);
        self.sum_over_segregating(|i, j, k, l| {
            let (fi, fj, fk, fl) = (i as f64, j as f64, k as f64, l as f64);
            if proj {
                2.0 / denom
                    * (fi * (fi - 1.0) / 2.0 * fj * fk / 12.0
                        + fi * fj * (fj - 1.0) / 2.0 * fk / 12.0
                        + fi * fj * fk * (fk - 1.0) / 2.0 / 12.0
                        + fj * (fj - 1.0) / 2.0 * fk * (fk - 1.0) / 2.0 / 6.0
                        + fi * (fi - 1.0) / 2.0 * fj * fl / 12.0
                        + fi * fj * (fj - 1.0) / 2.0 * fl / 12.0
                        + fi * (fi - 1.0) / 2.0 * fk * fl / 12.0
                        + 2.0 * fi * fj * fk * fl / 24.0
                        + fj * (fj - 1.0) / 2.0 * fk * fl / 12.0
                        + fi * fk * (fk - 1.0) / 2.0 * fl / 12.0
                        + fj * fk * (fk - 1.0) / 2.0 * fl / 12.0
                        + fi * (fi - 1.0) / 2.0 * fl * (fl - 1.0) / 2.0 / 6.0
                        + fi * fj * fl * (fl - 1.0) / 2.0 / 12.0
                        + fi * fk * fl * (fl - 1.0) / 2.0 / 12.0
                        + fj * fk * fl * (fl - 1.0) / 2.0 / 12.0)
            } else {
                let nf = n as f64;
                2.0 / nf.powi(4)
                    * (fi * fi * fj * fk
                        + fi * fj * fj * fk
                        + fi * fj * fk * fk
                        + fj * fj * fk * fk
                        + fi * fi * fj * fl
                        + fi * fj * fj * fl
                        + fi * fi * fk * fl
                        + 2.0 * fi * fj * fk * fl
                        + fj * fj * fk * fl
                        + fi * fk * fk * fl
                        + fj * fk * fk * fl
                        + fi * fi * fl * fl
                        + fi * fj * fl * fl
                        + fi * fk * fl * fl
                        + fj * fk * fl * fl)
            }
        })
    }

    /// Expected D z = D (1 - 2p)(1 - 2q), evaluated through projection to four samples.
    /// Only the sampling-projection estimator exists; `proj = false` is rejected.
    pub fn dz(&self, proj: bool) -> Result<f64, MomentError> {
        if !proj {
            return Err(MomentError::InvalidParameter(
                "proj".to_string(),
                "the naive Dz estimator is not implemented; use the sampling projection"
                    .to_string(),
            ));
        }
        if self.sample_size() < 4 {
            return Err(MomentError::SampleSizeTooSmall(
                self.sample_size(),
                "the Dz statistic".to_string(),
            ));
        }
        let f = self.project(4)?;
        let d = &f.data;
        let stat = d[[3, 0, 0]] / 4.0 - d[[2, 0, 0]] / 3.0 + d[[1, 0, 0]] / 4.0
            - d[[2, 1, 1]] / 12.0
            - d[[1, 2, 0]] / 12.0
            - d[[1, 0, 2]] / 12.0
            - d[[0, 1, 1]] / 12.0
            + d[[0, 3, 1]] / 4.0
            - d[[0, 2, 2]] / 3.0
            + d[[0, 1, 3]] / 4.0
            + d[[1, 1, 1]] / 6.0;
        Ok(2.0 * stat)
    }

    /// Project to a smaller sample size.
    pub fn project(&self, n_new: usize) -> Result<TwoLocusSpectrum, MomentError> {
        let data = numerics::project(&self.data, &self.mask, n_new)?;
        TwoLocusSpectrum::new(data, None, true, self.folded)
    }

    /// Fold the spectrum onto major/minor allele labels at both loci. Folding an
    /// already-folded spectrum is the identity.
    pub fn fold(&self) -> Result<TwoLocusSpectrum, MomentError> {
        if self.folded {
            return Ok(self.clone());
        }
        let n = self.sample_size();
        let half = n as f64 / 2.0;
        let mut data = Array3::<f64>::zeros(self.data.raw_dim());
        let mut mask = self.mask.clone();

        for i in 0..=n {
            for j in 0..=(n - i) {
                for k in 0..=(n - i - j) {
                    if self.mask[[i, j, k]] {
                        continue;
                    }
                    let l = n - i - j - k;
                    let p = (i + j) as f64;
                    let q = (i + k) as f64;
                    if p > half && q > half {
                        // switch both loci: AB <-> ab, Ab <-> aB
                        data[[l, k, j]] += self.data[[i, j, k]];
                        mask[[i, j, k]] = true;
                    } else if p > half {
                        // switch A/a only
                        data[[k, l, i]] += self.data[[i, j, k]];
                        mask[[i, j, k]] = true;
                    } else if q > half {
                        // switch B/b only
                        data[[j, i, l]] += self.data[[i, j, k]];
                        mask[[i, j, k]] = true;
                    } else {
                        data[[i, j, k]] += self.data[[i, j, k]];
                    }
                }
            }
        }
        Ok(TwoLocusSpectrum {
            data,
            mask,
            folded: true,
        })
    }

    /// Drop the folded flag, returning an unfolded spectrum with the infeasible entries
    /// re-masked.
    pub fn unfold(&self) -> Result<TwoLocusSpectrum, MomentError> {
        if !self.folded {
            return Err(MomentError::NotFolded);
        }
        TwoLocusSpectrum::new(self.data.clone(), None, true, false)
    }

    /// Compare unmasked entries within tolerances.
    pub fn all_close(&self, other: &TwoLocusSpectrum, r_tol: f64, a_tol: f64) -> bool {
        self.data.shape() == other.data.shape()
            && self
                .data
                .iter()
                .zip(other.data.iter())
                .zip(self.mask.iter().zip(other.mask.iter()))
                .all(|((&a, &b), (&ma, &mb))| {
                    (ma && mb) || (!ma && !mb && (a - b).abs() <= a_tol + r_tol * b.abs())
                })
    }

    /// Read a spectrum from a file: comment lines, then a line with the sample size and
    /// the folding status, then the (n+1)^3 data entries and the 0/1 mask entries.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<TwoLocusSpectrum, MomentError> {
        let content =
            fs::read_to_string(&path).map_err(|e| MomentError::FileRead(e.to_string()))?;
        Self::from_str_format(&content)
    }

    pub(crate) fn from_str_format(content: &str) -> Result<TwoLocusSpectrum, MomentError> {
        let mut lines = content.lines().filter(|l| !l.trim_start().starts_with('#'));
        let header = lines
            .next()
            .ok_or_else(|| MomentError::FileRead("missing header line".to_string()))?;
        let mut tokens = header.split_whitespace();
        let n: usize = tokens
            .next()
            .ok_or_else(|| MomentError::FileRead("missing sample size".to_string()))?
            .parse()
            .map_err(|e: std::num::ParseIntError| MomentError::FileRead(e.to_string()))?;
        let folded = match tokens.next() {
            Some("folded") => true,
            Some("unfolded") | None => false,
            Some(other) => {
                return Err(MomentError::FileRead(format!(
                    "expected 'folded' or 'unfolded', found '{}'",
                    other
                )))
            }
        };
        let d = n + 1;
        let count = d * d * d;

        let data_line = lines
            .next()
            .ok_or_else(|| MomentError::FileRead("missing data line".to_string()))?;
        let values: Vec<f64> = data_line
            .split_whitespace()
            .map(|t| t.parse::<f64>())
            .collect::<Result<_, _>>()
            .map_err(|e| MomentError::FileRead(e.to_string()))?;
        if values.len() != count {
            return Err(MomentError::FileRead(format!(
                "expected {} data entries, found {}",
                count,
                values.len()
            )));
        }
        let data = Array3::from_shape_vec((d, d, d), values)
            .map_err(|e| MomentError::FileRead(e.to_string()))?;

        let mask = match lines.next() {
            Some(mask_line) if !mask_line.trim().is_empty() => {
                let flags: Vec<bool> = mask_line
                    .split_whitespace()
                    .map(|t| match t {
                        "0" => Ok(false),
                        "1" => Ok(true),
                        other => Err(MomentError::FileRead(format!(
                            "mask entries must be 0 or 1, found '{}'",
                            other
                        ))),
                    })
                    .collect::<Result<_, _>>()?;
                if flags.len() != count {
                    return Err(MomentError::FileRead(format!(
                        "expected {} mask entries, found {}",
                        count,
                        flags.len()
                    )));
                }
                Some(
                    Array3::from_shape_vec((d, d, d), flags)
                        .map_err(|e| MomentError::FileRead(e.to_string()))?,
                )
            }
            _ => None,
        };
        TwoLocusSpectrum::new(data, mask, true, folded)
    }

    /// Write the spectrum in the plain-text exchange format.
    pub fn to_file<P: AsRef<Path>>(&self, path: P, comments: &[&str]) -> Result<(), MomentError> {
        fs::write(path, self.to_string_format(comments))
            .map_err(|e| MomentError::FileWrite(e.to_string()))
    }

    pub(crate) fn to_string_format(&self, comments: &[&str]) -> String {
        let mut out = String::new();
        for line in comments {
            out.push_str("# ");
            out.push_str(line.trim());
            out.push('\n');
        }
        out.push_str(&format!(
            "{} {}\n",
            self.sample_size(),
            if self.folded { "folded" } else { "unfolded" }
        ));
        let data: Vec<String> = self.data.iter().map(|v| format!("{:.16e}", v)).collect();
        out.push_str(&data.join(" "));
        out.push('\n');
        let mask: Vec<&str> = self.mask.iter().map(|&m| if m { "1" } else { "0" }).collect();
        out.push_str(&mask.join(" "));
        out.push('\n');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::TwoLocusSpectrum;

    fn demo(n: usize) -> TwoLocusSpectrum {
        let mut fs = TwoLocusSpectrum::zeros(n).unwrap();
        for i in 0..=n {
            for j in 0..=(n - i) {
                for k in 0..=(n - i - j) {
                    fs.data_mut()[[i, j, k]] = 1.0 + ((3 * i + 5 * j + 7 * k) % 11) as f64 * 0.1;
                }
            }
        }
        fs
    }

    #[test]
    fn test_infeasible_entries_masked() {
        let fs = TwoLocusSpectrum::zeros(4).unwrap();
        assert!(fs.mask()[[3, 2, 0]]);
        assert!(!fs.mask()[[2, 2, 0]]);
    }

    #[test]
    fn test_marginals_share_total_density() {
        let fs = demo(6);
        let left: f64 = fs.left().iter().sum();
        let right: f64 = fs.right().iter().sum();
        assert!((left - right).abs() < 1e-12);
    }

    #[test]
    fn test_fold_conserves_unmasked_density_and_is_idempotent() {
        let fs = demo(5);
        let folded = fs.fold().unwrap();
        let twice = folded.fold().unwrap();
        assert!(twice.all_close(&folded, 0.0, 0.0));
        let before: f64 = fs
            .data()
            .iter()
            .zip(fs.mask().iter())
            .filter(|(_, &m)| !m)
            .map(|(&v, _)| v)
            .sum();
        let after: f64 = folded
            .data()
            .iter()
            .zip(folded.mask().iter())
            .filter(|(_, &m)| !m)
            .map(|(&v, _)| v)
            .sum();
        assert!((before - after).abs() < 1e-10);
    }

    #[test]
    fn test_d_vanishes_on_exchangeable_spectrum() {
        // a spectrum invariant under relabeling A <-> a carries no signed linkage
        // disequilibrium: the estimator weight i*l - j*k is antisymmetric under the swap
        let n = 5;
        let mut fs = TwoLocusSpectrum::zeros(n).unwrap();
        for i in 0..=n {
            for j in 0..=(n - i) {
                for k in 0..=(n - i - j) {
                    fs.data_mut()[[i, j, k]] = 1.0;
                }
            }
        }
        assert!(fs.d(true).abs() < 1e-12);
        assert!(fs.d(false).abs() < 1e-12);
    }

    #[test]
    fn test_file_roundtrip() {
        let fs = demo(4);
        let text = fs.to_string_format(&["two-locus demo"]);
        let back = TwoLocusSpectrum::from_str_format(&text).unwrap();
        assert!(fs.all_close(&back, 1e-12, 1e-12));
        assert_eq!(back.sample_size(), 4);
    }

    #[test]
    fn test_projection_is_identity_at_same_size() {
        let fs = demo(5);
        let same = fs.project(5).unwrap();
        assert!(fs.all_close(&same, 0.0, 0.0));
    }
}
