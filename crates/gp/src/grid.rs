//! Inducing grid of the structured kernel interpolation and the cubic
//! convolution weights mapping grid values to arbitrary locations.
//!
//! In each dimension the grid is evenly spaced with spacing
//! `h = (hi - lo) / (m - 3)` and points `g_k = lo + (k - 1) h`, `k = 0..m`:
//! one guard point lies before `lo` and two after `hi`, so that every point
//! of `[lo, hi]` has its four neighbours on the grid.

use crate::errors::{GpError, Result};
use linfa::Float;
use log::{debug, warn};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix2, Zip};
use ndarray_stats::QuantileExt;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use skigp_linops::{LinopsError, SparseInterpolation};

/// Smallest grid size giving four neighbours to every in-range point
pub const MIN_GRID_SIZE: usize = 4;

/// Keys cubic convolution weights (a = -1/2) of the neighbours at offsets
/// -1, 0, 1, 2 for a point at fractional position `t` in `[0, 1]`
fn cubic_weights<F: Float>(t: F) -> [F; 4] {
    let half = F::cast(0.5);
    let t2 = t * t;
    let t3 = t2 * t;
    [
        half * (-t3 + F::cast(2.) * t2 - t),
        half * (F::cast(3.) * t3 - F::cast(5.) * t2 + F::cast(2.)),
        half * (F::cast(-3.) * t3 + F::cast(4.) * t2 + t),
        half * (t3 - t2),
    ]
}

/// Evenly spaced tensor grid, `size` points per dimension
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct InducingGrid<F: Float> {
    lower: Array1<F>,
    upper: Array1<F>,
    spacing: Array1<F>,
    size: usize,
}

impl<F: Float> InducingGrid<F> {
    /// Grid covering explicit `bounds` given as a (nx, 2) array of `[lo, hi]` rows
    pub fn new(bounds: &ArrayBase<impl Data<Elem = F>, Ix2>, size: usize) -> Result<Self> {
        if size < MIN_GRID_SIZE {
            return Err(GpError::InvalidValueError(format!(
                "grid size should be at least {MIN_GRID_SIZE}, got {size}"
            )));
        }
        if bounds.ncols() != 2 || bounds.nrows() == 0 {
            return Err(LinopsError::ShapeError {
                operation: "inducing_grid",
                expected: (bounds.nrows().max(1), 2),
                actual: bounds.dim(),
            }
            .into());
        }
        let lower = bounds.column(0).to_owned();
        let upper = bounds.column(1).to_owned();
        if let Some(j) = (0..lower.len()).find(|&j| !(lower[j] < upper[j])) {
            return Err(GpError::InvalidValueError(format!(
                "grid bounds of dimension {j} should satisfy lo < hi, got [{}, {}]",
                lower[j], upper[j]
            )));
        }
        let steps = F::cast(size - 3);
        let spacing = (&upper - &lower) / steps;
        Ok(InducingGrid {
            lower,
            upper,
            spacing,
            size,
        })
    }

    /// Grid covering the bounding box of `x` (n, nx) widened by `padding`
    /// times its range on each side, unless explicit `bounds` are given
    pub fn from_data(
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        size: usize,
        bounds: Option<&Array2<F>>,
        padding: F,
    ) -> Result<Self> {
        if padding < F::zero() {
            return Err(GpError::InvalidValueError(format!(
                "grid padding should be non negative, got {padding}"
            )));
        }
        let first = x.rows().into_iter().next();
        let n_distinct_ok = match first {
            Some(row0) => x.rows().into_iter().any(|row| row != row0),
            None => false,
        };
        if !n_distinct_ok {
            return Err(GpError::DegenerateInputError(format!(
                "at least 2 distinct points are required to derive an inducing grid, got {} point(s)",
                x.nrows()
            )));
        }
        match bounds {
            Some(bounds) => {
                if bounds.nrows() != x.ncols() {
                    return Err(LinopsError::ShapeError {
                        operation: "inducing_grid",
                        expected: (x.ncols(), 2),
                        actual: bounds.dim(),
                    }
                    .into());
                }
                Self::new(bounds, size)
            }
            None => {
                let mut bounds = Array2::zeros((x.ncols(), 2));
                for (j, column) in x.columns().into_iter().enumerate() {
                    let (lo, hi) = match (column.min(), column.max()) {
                        (Ok(lo), Ok(hi)) => (*lo, *hi),
                        _ => {
                            return Err(GpError::InvalidValueError(format!(
                                "input dimension {j} has undefined values"
                            )))
                        }
                    };
                    let range = hi - lo;
                    if range <= F::zero() {
                        return Err(GpError::DegenerateInputError(format!(
                            "input dimension {j} has zero extent, explicit grid bounds are required"
                        )));
                    }
                    bounds[[j, 0]] = lo - padding * range;
                    bounds[[j, 1]] = hi + padding * range;
                }
                Self::new(&bounds, size)
            }
        }
    }

    /// Number of input dimensions
    pub fn dim(&self) -> usize {
        self.lower.len()
    }

    /// Number of grid points per dimension
    pub fn size(&self) -> usize {
        self.size
    }

    /// Total number of grid points
    pub fn n_points(&self) -> usize {
        self.size.pow(self.dim() as u32)
    }

    /// Grid spacing per dimension
    pub fn spacing(&self) -> &Array1<F> {
        &self.spacing
    }

    /// Covered extent as a (nx, 2) array of `[lo, hi]` rows
    pub fn bounds(&self) -> Array2<F> {
        let mut bounds = Array2::zeros((self.dim(), 2));
        bounds.column_mut(0).assign(&self.lower);
        bounds.column_mut(1).assign(&self.upper);
        bounds
    }

    /// Grid point coordinates along dimension `j`
    pub fn points(&self, j: usize) -> Array1<F> {
        let (lo, h) = (self.lower[j], self.spacing[j]);
        Array1::from_shape_fn(self.size, |k| lo + F::cast(k as f64 - 1.) * h)
    }

    /// Base neighbour index and fractional position along dimension `j`,
    /// with `x` already inside `[lo, hi]`
    fn locate(&self, j: usize, x: F) -> (usize, F) {
        let u = (x - self.lower[j]) / self.spacing[j] + F::one();
        let last = self.size - 3;
        let k = u.floor().to_f64().unwrap_or(1.).max(1.) as usize;
        if k > last {
            (last, F::one())
        } else {
            (k, u - F::cast(k))
        }
    }

    /// Sparse interpolation operator (n, size^nx) of `x` (n, nx) with 4^nx
    /// weights per row, the first dimension varying slowest.
    ///
    /// Points outside of the grid extent are clamped to its boundary; their
    /// count is recorded in the returned operator.
    pub fn interpolation(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<SparseInterpolation<F>> {
        let nx = self.dim();
        if x.ncols() != nx {
            return Err(LinopsError::ShapeError {
                operation: "interpolation",
                expected: (x.nrows(), nx),
                actual: x.dim(),
            }
            .into());
        }
        let nnz = 4usize.pow(nx as u32);
        let m = self.size;
        let mut indices = Array2::<usize>::zeros((x.nrows(), nnz));
        let mut weights = Array2::<F>::zeros((x.nrows(), nnz));
        let mut clamped = Array1::from_elem(x.nrows(), false);

        Zip::from(indices.rows_mut())
            .and(weights.rows_mut())
            .and(&mut clamped)
            .and(x.rows())
            .par_for_each(|mut idx_row, mut w_row, is_clamped, xi| {
                let local: Vec<(usize, [F; 4])> = (0..nx)
                    .map(|j| {
                        let v = xi[j];
                        let inside = if v < self.lower[j] {
                            *is_clamped = true;
                            self.lower[j]
                        } else if v > self.upper[j] {
                            *is_clamped = true;
                            self.upper[j]
                        } else {
                            v
                        };
                        let (k, t) = self.locate(j, inside);
                        (k, cubic_weights(t))
                    })
                    .collect();
                for c in 0..nnz {
                    let mut flat = 0;
                    let mut w = F::one();
                    let mut rest = c;
                    for (j, (k, wk)) in local.iter().enumerate() {
                        let digit = (rest / 4usize.pow((nx - 1 - j) as u32)) % 4;
                        rest %= 4usize.pow((nx - 1 - j) as u32);
                        flat = flat * m + (k - 1 + digit);
                        w *= wk[digit];
                    }
                    idx_row[c] = flat;
                    w_row[c] = w;
                }
            });

        let n_clamped = clamped.iter().filter(|&&c| c).count();
        if n_clamped > 0 {
            warn!(
                "{} point(s) outside of the inducing grid extent clamped to its boundary",
                n_clamped
            );
        }
        debug!(
            "Interpolation of {} points on a grid of {} points ({} weights per row)",
            x.nrows(),
            self.n_points(),
            nnz
        );
        Ok(SparseInterpolation::new(indices, weights, self.n_points())?.with_clamped(n_clamped))
    }
}
