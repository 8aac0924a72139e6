use crate::errors::{LinopsError, Result};
use crate::scalar::Scalar;
use linfa::Float;
use ndarray::{Array2, ArrayView2, Zip};

/// Sparse interpolation operator `W` of shape `(n, m)` with the same number of
/// nonzero entries on every row.
///
/// Row `i` holds the weights `weights[i, ..]` at columns `indices[i, ..]`.
/// Weights are real: they depend on input locations only, never on kernel
/// hyperparameters.
#[derive(Clone, Debug)]
pub struct SparseInterpolation<F: Float> {
    indices: Array2<usize>,
    weights: Array2<F>,
    ncols: usize,
    n_clamped: usize,
}

impl<F: Float> SparseInterpolation<F> {
    /// Builds the operator, checking that indices and weights agree and
    /// that every index is a valid column.
    pub fn new(indices: Array2<usize>, weights: Array2<F>, ncols: usize) -> Result<Self> {
        if indices.dim() != weights.dim() {
            return Err(LinopsError::ShapeError {
                operation: "interpolation",
                expected: indices.dim(),
                actual: weights.dim(),
            });
        }
        if let Some(&bad) = indices.iter().find(|&&j| j >= ncols) {
            return Err(LinopsError::InvalidValueError(format!(
                "interpolation index {bad} out of range for {ncols} grid values"
            )));
        }
        Ok(SparseInterpolation {
            indices,
            weights,
            ncols,
            n_clamped: 0,
        })
    }

    /// Records how many rows were clamped onto the grid boundary
    pub fn with_clamped(mut self, n_clamped: usize) -> Self {
        self.n_clamped = n_clamped;
        self
    }

    /// Shape `(n, m)`
    pub fn dim(&self) -> (usize, usize) {
        (self.indices.nrows(), self.ncols)
    }

    /// Number of nonzero entries per row
    pub fn nnz_per_row(&self) -> usize {
        self.indices.ncols()
    }

    /// Column indices, one row per interpolated point
    pub fn indices(&self) -> &Array2<usize> {
        &self.indices
    }

    /// Weights, one row per interpolated point
    pub fn weights(&self) -> &Array2<F> {
        &self.weights
    }

    /// Number of points which fell outside the grid and were clamped
    pub fn n_clamped(&self) -> usize {
        self.n_clamped
    }

    /// Computes `W X` for `X` of shape `(m, k)`
    pub fn apply<S: Scalar<Real = F>>(&self, x: ArrayView2<S>) -> Array2<S> {
        let mut out = Array2::zeros((self.indices.nrows(), x.ncols()));
        Zip::from(out.rows_mut())
            .and(self.indices.rows())
            .and(self.weights.rows())
            .par_for_each(|mut row, idx, w| {
                for (&j, &wj) in idx.iter().zip(w.iter()) {
                    Zip::from(&mut row)
                        .and(x.row(j))
                        .for_each(|o, &v| *o += v.scale(wj));
                }
            });
        out
    }

    /// Computes `Wᵀ Y` for `Y` of shape `(n, k)`
    pub fn apply_t<S: Scalar<Real = F>>(&self, y: ArrayView2<S>) -> Array2<S> {
        let mut out = Array2::zeros((self.ncols, y.ncols()));
        for ((idx, w), yrow) in self
            .indices
            .rows()
            .into_iter()
            .zip(self.weights.rows())
            .zip(y.rows())
        {
            for (&j, &wj) in idx.iter().zip(w.iter()) {
                Zip::from(out.row_mut(j))
                    .and(&yrow)
                    .for_each(|o, &v| *o += v.scale(wj));
            }
        }
        out
    }

    /// Dense `(n, m)` matrix, for tests and small problems
    pub fn to_dense(&self) -> Array2<F> {
        let mut w = Array2::zeros(self.dim());
        for (i, (idx, wr)) in self.indices.rows().into_iter().zip(self.weights.rows()).enumerate() {
            for (&j, &wj) in idx.iter().zip(wr.iter()) {
                w[[i, j]] += wj;
            }
        }
        w
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_interpolation_apply_and_transpose() {
        let indices = array![[0, 1], [1, 2], [2, 3]];
        let weights = array![[0.25, 0.75], [0.5, 0.5], [1.0, 0.0]];
        let w = SparseInterpolation::new(indices, weights, 4).unwrap();
        let dense = w.to_dense();
        let x = array![[1., 2.], [3., 4.], [5., 6.], [7., 8.]];
        assert_abs_diff_eq!(w.apply(x.view()), dense.dot(&x), epsilon = 1e-14);
        let y = array![[1., 0.], [0., 1.], [2., -1.]];
        assert_abs_diff_eq!(w.apply_t(y.view()), dense.t().dot(&y), epsilon = 1e-14);
    }

    #[test]
    fn test_interpolation_rejects_bad_index() {
        let res = SparseInterpolation::new(array![[0, 5]], array![[0.5, 0.5]], 4);
        assert!(matches!(res, Err(LinopsError::InvalidValueError(_))));
        let res = SparseInterpolation::new(array![[0, 1]], array![[0.5, 0.5, 0.0]], 4);
        assert!(matches!(res, Err(LinopsError::ShapeError { .. })));
    }
}
