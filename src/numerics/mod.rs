pub mod jackknife;
pub mod migration;
pub mod one_dim;
pub mod tridiag;

use nalgebra::DMatrix;
use ndarray::{ArrayD, Axis, IxDyn};

/// Apply a matrix along one axis of an N-dimensional array: the array is viewed as a bundle
/// of pencils along `axis`, and each pencil is multiplied by `m`. The result has the axis
/// resized to `m.nrows()`.
pub(crate) fn apply_along_axis(arr: &ArrayD<f64>, m: &DMatrix<f64>, axis: usize) -> ArrayD<f64> {
    debug_assert_eq!(m.ncols(), arr.shape()[axis]);
    let mut shape = arr.shape().to_vec();
    shape[axis] = m.nrows();
    let mut out = ArrayD::<f64>::zeros(IxDyn(&shape));
    for (mut out_lane, in_lane) in out
        .lanes_mut(Axis(axis))
        .into_iter()
        .zip(arr.lanes(Axis(axis)))
    {
        for r in 0..m.nrows() {
            let mut acc = 0.0;
            for c in 0..m.ncols() {
                acc += m[(r, c)] * in_lane[c];
            }
            out_lane[r] = acc;
        }
    }
    out
}
