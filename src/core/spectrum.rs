use std::fs;
use std::path::Path;

use ndarray::{ArrayD, Axis, Dimension, IxDyn};

use crate::core::MomentError;

/// The expected site frequency spectrum over one to five populations.
///
/// The spectrum owns a dense array of shape `(n1+1, ..., np+1)` indexed by derived-allele
/// counts per population, a same-shape boolean mask (`true` entries are excluded from
/// inference and from summary statistics), ordered population labels, and a folded flag
/// recording whether the ancestral state is known.
#[derive(Clone, Debug)]
pub struct Spectrum {
    data: ArrayD<f64>,
    mask: ArrayD<bool>,
    pop_labels: Option<Vec<String>>,
    folded: bool,
}

impl Spectrum {
    /// Build a spectrum from a data array with shape validation.
    ///
    /// # Arguments
    ///
    /// * `data`: The frequency spectrum data.
    /// * `mask`: Optional mask of the same shape; `None` leaves every entry unmasked.
    /// * `pop_labels`: Optional population labels, one per axis.
    /// * `folded`: Whether the data is folded for the minor allele.
    /// * `mask_corners`: Whether to mask the all-lost and all-fixed cells.
    ///
    /// returns: `Result<Spectrum, MomentError>`
    pub fn new(
        data: ArrayD<f64>,
        mask: Option<ArrayD<bool>>,
        pop_labels: Option<Vec<String>>,
        folded: bool,
        mask_corners: bool,
    ) -> Result<Self, MomentError> {
        if data.ndim() == 0 || data.ndim() > 5 {
            return Err(MomentError::InvalidParameter(
                "data".to_string(),
                format!("a spectrum must have 1 to 5 axes, not {}", data.ndim()),
            ));
        }
        if data.shape().iter().any(|&d| d < 2) {
            return Err(MomentError::InvalidParameter(
                "data".to_string(),
                "every axis needs at least one sampled lineage".to_string(),
            ));
        }
        let mask = match mask {
            Some(m) => {
                if m.shape() != data.shape() {
                    return Err(MomentError::ShapeMismatch(
                        "mask".to_string(),
                        m.shape().to_vec(),
                        data.shape().to_vec(),
                    ));
                }
                m
            }
            None => ArrayD::from_elem(data.raw_dim(), false),
        };
        if let Some(labels) = &pop_labels {
            if labels.len() != data.ndim() {
                return Err(MomentError::InvalidParameter(
                    "pop_labels".to_string(),
                    format!("{} labels provided for {} populations", labels.len(), data.ndim()),
                ));
            }
        }
        let mut fs = Self {
            data,
            mask,
            pop_labels,
            folded,
        };
        if mask_corners {
            fs.mask_corners();
        }
        Ok(fs)
    }

    /// Build an unfolded spectrum from data alone, with corners masked.
    pub fn from_data(data: ArrayD<f64>) -> Result<Self, MomentError> {
        Self::new(data, None, None, false, true)
    }

    /// An all-zero spectrum for the given sample sizes.
    ///
    /// # Arguments
    ///
    /// * `sample_sizes`: Haploid sample size per population; axis `i` has `sample_sizes[i] + 1`
    ///   entries.
    /// * `mask_corners`: Whether to mask the absorbing corners.
    ///
    /// returns: `Result<Spectrum, MomentError>`
    pub fn zeros(sample_sizes: &[usize], mask_corners: bool) -> Result<Self, MomentError> {
        let shape: Vec<usize> = sample_sizes.iter().map(|&n| n + 1).collect();
        Self::new(ArrayD::zeros(IxDyn(&shape)), None, None, false, mask_corners)
    }

    pub fn data(&self) -> &ArrayD<f64> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut ArrayD<f64> {
        &mut self.data
    }

    pub fn mask(&self) -> &ArrayD<bool> {
        &self.mask
    }

    pub fn mask_mut(&mut self) -> &mut ArrayD<bool> {
        &mut self.mask
    }

    pub fn folded(&self) -> bool {
        self.folded
    }

    pub fn pop_labels(&self) -> Option<&[String]> {
        self.pop_labels.as_deref()
    }

    pub fn set_pop_labels(&mut self, labels: Option<Vec<String>>) {
        self.pop_labels = labels;
    }

    /// Number of populations (axes).
    pub fn num_pops(&self) -> usize {
        self.data.ndim()
    }

    /// Haploid sample size per population.
    pub fn sample_sizes(&self) -> Vec<usize> {
        self.data.shape().iter().map(|&d| d - 1).collect()
    }

    fn corner_indices(&self) -> (Vec<usize>, Vec<usize>) {
        let lost = vec![0; self.data.ndim()];
        let fixed: Vec<usize> = self.data.shape().iter().map(|&d| d - 1).collect();
        (lost, fixed)
    }

    /// Mask the all-lost and all-fixed cells.
    pub fn mask_corners(&mut self) {
        let (lost, fixed) = self.corner_indices();
        self.mask[IxDyn(&lost)] = true;
        self.mask[IxDyn(&fixed)] = true;
    }

    /// Clear the whole mask.
    pub fn unmask_all(&mut self) {
        self.mask.fill(false);
    }

    /// Whether the all-lost corner is masked.
    pub fn lost_corner_masked(&self) -> bool {
        let (lost, _) = self.corner_indices();
        self.mask[IxDyn(&lost)]
    }

    /// Whether the all-fixed corner is masked.
    pub fn fixed_corner_masked(&self) -> bool {
        let (_, fixed) = self.corner_indices();
        self.mask[IxDyn(&fixed)]
    }

    /// Re-apply the masked/unmasked status of the two absorbing corners, used by the
    /// manipulation primitives to carry corner masking across events.
    pub fn set_corner_masks(&mut self, mask_lost: bool, mask_fixed: bool) {
        let (lost, fixed) = self.corner_indices();
        self.mask[IxDyn(&lost)] = mask_lost;
        self.mask[IxDyn(&fixed)] = mask_fixed;
    }

    /// Sum of the unmasked entries.
    pub fn sum(&self) -> f64 {
        self.data
            .iter()
            .zip(self.mask.iter())
            .filter(|(_, &m)| !m)
            .map(|(&v, _)| v)
            .sum()
    }

    /// Element-wise sum of two spectra with matching shape and folding status. The result
    /// mask is the union of the operand masks.
    pub fn add(&self, other: &Spectrum) -> Result<Spectrum, MomentError> {
        if self.folded != other.folded {
            return Err(MomentError::FoldingMismatch);
        }
        if self.data.shape() != other.data.shape() {
            return Err(MomentError::ShapeMismatch(
                "spectrum".to_string(),
                other.data.shape().to_vec(),
                self.data.shape().to_vec(),
            ));
        }
        let mut out = self.clone();
        out.data += &other.data;
        out.mask.zip_mut_with(&other.mask, |a, &b| *a = *a || b);
        Ok(out)
    }

    /// Multiply every entry by a scalar, preserving metadata.
    pub fn mul_scalar(&self, factor: f64) -> Spectrum {
        let mut out = self.clone();
        out.data *= factor;
        out
    }

    /// Swap two population axes, together with their mask and labels.
    pub fn swap_axes(&self, a: usize, b: usize) -> Result<Spectrum, MomentError> {
        let p = self.num_pops();
        if a >= p {
            return Err(MomentError::NonExistingPopulation(a, p));
        }
        if b >= p {
            return Err(MomentError::NonExistingPopulation(b, p));
        }
        let mut data = self.data.clone();
        let mut mask = self.mask.clone();
        data.swap_axes(a, b);
        mask.swap_axes(a, b);
        let pop_labels = self.pop_labels.clone().map(|mut l| {
            l.swap(a, b);
            l
        });
        Ok(Spectrum {
            data: data.as_standard_layout().to_owned(),
            mask: mask.as_standard_layout().to_owned(),
            pop_labels,
            folded: self.folded,
        })
    }

    /// Sum out the given populations, keeping the remaining axes in order.
    ///
    /// # Arguments
    ///
    /// * `axes`: Population indices to remove.
    /// * `mask_corners`: Whether the result has its absorbing corners masked.
    ///
    /// returns: `Result<Spectrum, MomentError>`
    pub fn marginalize(&self, axes: &[usize], mask_corners: bool) -> Result<Spectrum, MomentError> {
        let p = self.num_pops();
        for &ax in axes {
            if ax >= p {
                return Err(MomentError::NonExistingPopulation(ax, p));
            }
        }
        if axes.len() >= p {
            return Err(MomentError::InvalidParameter(
                "axes".to_string(),
                "cannot marginalize away every population".to_string(),
            ));
        }
        let mut sorted = axes.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        let mut data = self.data.clone();
        for &ax in sorted.iter().rev() {
            data = data.sum_axis(Axis(ax));
        }
        let pop_labels = self.pop_labels.clone().map(|l| {
            l.into_iter()
                .enumerate()
                .filter(|(i, _)| !sorted.contains(i))
                .map(|(_, s)| s)
                .collect()
        });
        Spectrum::new(data, None, pop_labels, self.folded, mask_corners)
    }

    /// Fold the spectrum onto minor-allele counts. Entries whose total derived count exceeds
    /// half the total sample size are added to their complementary cell and masked; the
    /// ambiguous diagonal (exactly half) is averaged with its mirror image. Folding an
    /// already-folded spectrum is the identity.
    pub fn fold(&self) -> Result<Spectrum, MomentError> {
        if self.folded {
            return Ok(self.clone());
        }
        let shape = self.data.shape().to_vec();
        let total_n: usize = shape.iter().map(|&d| d - 1).sum();
        let mut data = ArrayD::<f64>::zeros(IxDyn(&shape));
        let mut mask = ArrayD::<bool>::from_elem(IxDyn(&shape), false);

        for (idx, &v) in self.data.indexed_iter() {
            let idx = idx.slice().to_vec();
            let d: usize = idx.iter().sum();
            let comp: Vec<usize> = idx.iter().zip(&shape).map(|(&i, &s)| s - 1 - i).collect();
            let src_masked = self.mask[IxDyn(&idx)];
            let comp_masked = self.mask[IxDyn(&comp)];
            if 2 * d < total_n {
                data[IxDyn(&idx)] += v;
                data[IxDyn(&idx)] += self.data[IxDyn(&comp)];
                mask[IxDyn(&idx)] = src_masked || comp_masked;
            } else if 2 * d == total_n {
                data[IxDyn(&idx)] = 0.5 * (v + self.data[IxDyn(&comp)]);
                mask[IxDyn(&idx)] = src_masked || comp_masked;
            } else {
                mask[IxDyn(&idx)] = true;
            }
        }

        Ok(Spectrum {
            data,
            mask,
            pop_labels: self.pop_labels.clone(),
            folded: true,
        })
    }

    /// Drop the folded flag, returning an unfolded spectrum with corners re-masked.
    pub fn unfold(&self) -> Result<Spectrum, MomentError> {
        if !self.folded {
            return Err(MomentError::NotFolded);
        }
        Spectrum::new(self.data.clone(), None, self.pop_labels.clone(), false, true)
    }

    /// Compare unmasked entries of two spectra within tolerances.
    pub fn all_close(&self, other: &Spectrum, r_tol: f64, a_tol: f64) -> bool {
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

    /// Read a spectrum from a file in the plain-text exchange format:
    /// any number of `#` comment lines; a line with the per-axis dimensions, the string
    /// `folded` or `unfolded`, and optional population labels; the data entries in C order;
    /// the 0/1 mask entries in C order.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Spectrum, MomentError> {
        let content =
            fs::read_to_string(&path).map_err(|e| MomentError::FileRead(e.to_string()))?;
        Self::from_str_format(&content)
    }

    pub(crate) fn from_str_format(content: &str) -> Result<Spectrum, MomentError> {
        let mut lines = content.lines().filter(|l| !l.trim_start().starts_with('#'));
        let header = lines
            .next()
            .ok_or_else(|| MomentError::FileRead("missing header line".to_string()))?;
        let mut shape = Vec::new();
        let mut folded = None;
        let mut labels = Vec::new();
        for token in header.split_whitespace() {
            if folded.is_none() {
                if let Ok(d) = token.parse::<usize>() {
                    shape.push(d);
                    continue;
                }
                folded = Some(match token {
                    "folded" => true,
                    "unfolded" => false,
                    other => {
                        return Err(MomentError::FileRead(format!(
                            "expected 'folded' or 'unfolded', found '{}'",
                            other
                        )))
                    }
                });
            } else {
                labels.push(token.to_string());
            }
        }
        let folded = folded
            .ok_or_else(|| MomentError::FileRead("missing folding status in header".to_string()))?;
        if shape.is_empty() {
            return Err(MomentError::FileRead("missing shape in header".to_string()));
        }
        let count: usize = shape.iter().product();

        let data_line = lines
            .next()
            .ok_or_else(|| MomentError::FileRead("missing data line".to_string()))?;
        let data: Vec<f64> = data_line
            .split_whitespace()
            .map(|t| t.parse::<f64>())
            .collect::<Result<_, _>>()
            .map_err(|e| MomentError::FileRead(e.to_string()))?;
        if data.len() != count {
            return Err(MomentError::FileRead(format!(
                "expected {} data entries, found {}",
                count,
                data.len()
            )));
        }

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
                    ArrayD::from_shape_vec(IxDyn(&shape), flags)
                        .map_err(|e| MomentError::FileRead(e.to_string()))?,
                )
            }
            _ => None,
        };

        let data = ArrayD::from_shape_vec(IxDyn(&shape), data)
            .map_err(|e| MomentError::FileRead(e.to_string()))?;
        let labels = if labels.is_empty() { None } else { Some(labels) };
        Spectrum::new(data, mask, labels, folded, false)
    }

    /// Write the spectrum in the plain-text exchange format.
    ///
    /// # Arguments
    ///
    /// * `path`: Output file path.
    /// * `comments`: Comment lines for the file header, written with a leading `#`.
    ///
    /// returns: `Result<(), MomentError>`
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
        for d in self.data.shape() {
            out.push_str(&format!("{} ", d));
        }
        out.push_str(if self.folded { "folded" } else { "unfolded" });
        if let Some(labels) = &self.pop_labels {
            for label in labels {
                out.push_str(&format!(" {}", label));
            }
        }
        out.push('\n');
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
    use ndarray::{ArrayD, Dimension, IxDyn};

    use super::Spectrum;

    fn demo_2d() -> Spectrum {
        let data = ArrayD::from_shape_fn(IxDyn(&[4, 3]), |ix| (ix[0] * 3 + ix[1]) as f64 + 0.25);
        Spectrum::from_data(data).unwrap()
    }

    #[test]
    fn test_constructor_validates_mask_shape() {
        let data = ArrayD::<f64>::zeros(IxDyn(&[4, 3]));
        let mask = ArrayD::from_elem(IxDyn(&[3, 4]), false);
        assert!(Spectrum::new(data, Some(mask), None, false, true).is_err());
    }

    #[test]
    fn test_corners_masked_by_default() {
        let fs = demo_2d();
        assert!(fs.lost_corner_masked());
        assert!(fs.fixed_corner_masked());
        assert_eq!(fs.sample_sizes(), vec![3, 2]);
    }

    #[test]
    fn test_fold_is_idempotent_cell_wise() {
        let fs = demo_2d();
        let folded = fs.fold().unwrap();
        let twice = folded.fold().unwrap();
        assert!(twice.all_close(&folded, 0.0, 0.0));
        // folding conserves the unmasked total
        assert!((folded.sum() - fs.sum()).abs() < 1e-12);
        // folded-out entries are masked
        let n_tot: usize = fs.sample_sizes().iter().sum();
        for (idx, &m) in folded.mask().indexed_iter() {
            let d: usize = idx.slice().iter().sum();
            if 2 * d > n_tot {
                assert!(m);
            }
        }
    }

    #[test]
    fn test_marginalize_sums_axes() {
        let fs = demo_2d();
        let m = fs.marginalize(&[1], false).unwrap();
        assert_eq!(m.num_pops(), 1);
        let expected: f64 = fs.data().iter().sum();
        assert!((m.data().iter().sum::<f64>() - expected).abs() < 1e-12);
    }

    #[test]
    fn test_swap_axes_roundtrip() {
        let fs = demo_2d();
        let back = fs.swap_axes(0, 1).unwrap().swap_axes(0, 1).unwrap();
        assert!(fs.all_close(&back, 0.0, 0.0));
    }

    #[test]
    fn test_file_format_roundtrip() {
        let mut fs = demo_2d();
        fs.set_pop_labels(Some(vec!["YRI".to_string(), "CEU".to_string()]));
        let text = fs.to_string_format(&["demo spectrum"]);
        let back = Spectrum::from_str_format(&text).unwrap();
        assert!(fs.all_close(&back, 1e-12, 1e-12));
        assert_eq!(back.pop_labels(), Some(&["YRI".to_string(), "CEU".to_string()][..]));
        assert_eq!(back.folded(), false);
        assert_eq!(back.mask(), fs.mask());
    }
}
