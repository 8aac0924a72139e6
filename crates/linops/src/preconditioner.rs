//! Preconditioners for `K + D` systems.
//!
//! The main one is a partial pivoted Cholesky factorization `K ≈ L Lᵀ` of
//! fixed rank, inverted together with the positive diagonal `D` through the
//! Woodbury identity:
//!
//! `(D + L Lᵀ)⁻¹ = D⁻¹ - D⁻¹ L (I + Lᵀ D⁻¹ L)⁻¹ Lᵀ D⁻¹`
//!
//! which is symmetric positive definite and costs `O(n k)` per application.

use crate::dense::{cho_solve, cholesky};
use crate::errors::Result;
use crate::lazy::LazyMatrix;
use crate::scalar::Scalar;
use linfa::Float;
use num_traits::Zero;
use log::debug;
use ndarray::{Array1, Array2, ArrayView2, Axis, Zip};

/// Relative size of the remaining diagonal below which pivoting stops early
const PIVOTED_CHOLESKY_TOLERANCE: f64 = 1e-10;

/// Approximate inverse applied at every PCG iteration
#[derive(Clone, Debug)]
pub enum Preconditioner<S: Scalar> {
    /// No preconditioning
    Identity,
    /// Inverse of the diagonal
    Jacobi(Array1<S>),
    /// Woodbury inverse of `D + L Lᵀ`
    PivotedCholesky {
        /// Low-rank factor `L` of shape `(n, k)`
        factor: Array2<S>,
        /// Inverse of the diagonal `D`
        diag_inv: Array1<S>,
        /// Cholesky factor of `I + Lᵀ D⁻¹ L`
        inner_chol: Array2<S>,
    },
}

impl<S: Scalar> Preconditioner<S> {
    /// Builds the best available preconditioner of given rank for `op`:
    /// pivoted Cholesky + Woodbury when `op` is a matrix plus a positive
    /// diagonal, Jacobi when its diagonal is positive, identity otherwise
    pub fn build(op: &LazyMatrix<S>, rank: usize) -> Result<Self> {
        if rank == 0 {
            return Ok(Preconditioner::Identity);
        }
        let zero = S::Real::zero();
        if let Some((base, diag)) = op.split_added_diag() {
            if diag.iter().all(|d| d.re() > zero) {
                let factor = pivoted_cholesky(base, rank)?;
                return Self::woodbury(factor, diag);
            }
        }
        let diag = op.diagonal()?;
        if diag.iter().all(|d| d.re() > zero) {
            Ok(Preconditioner::Jacobi(diag.mapv(|d| S::one() / d)))
        } else {
            Ok(Preconditioner::Identity)
        }
    }

    /// Woodbury preconditioner of `diag(d) + L Lᵀ`
    pub fn woodbury(factor: Array2<S>, diag: &Array1<S>) -> Result<Self> {
        let diag_inv = diag.mapv(|d| S::one() / d);
        let k = factor.ncols();
        let mut scaled = factor.to_owned();
        Zip::from(scaled.rows_mut())
            .and(&diag_inv)
            .for_each(|mut row, &di| row.mapv_inplace(|v| v * di));
        let inner = Array2::<S>::eye(k) + factor.t().dot(&scaled);
        let inner_chol = cholesky(&inner)?;
        Ok(Preconditioner::PivotedCholesky {
            factor,
            diag_inv,
            inner_chol,
        })
    }

    /// Rank of the low-rank part
    pub fn rank(&self) -> usize {
        match self {
            Preconditioner::PivotedCholesky { factor, .. } => factor.ncols(),
            _ => 0,
        }
    }

    /// Applies the approximate inverse to the columns of `r`
    pub fn apply(&self, r: ArrayView2<S>) -> Array2<S> {
        match self {
            Preconditioner::Identity => r.to_owned(),
            Preconditioner::Jacobi(d_inv) => scale_rows(r, d_inv),
            Preconditioner::PivotedCholesky {
                factor,
                diag_inv,
                inner_chol,
            } => {
                let dr = scale_rows(r, diag_inv);
                let inner = cho_solve(inner_chol, &factor.t().dot(&dr));
                let correction = scale_rows(factor.dot(&inner).view(), diag_inv);
                dr - correction
            }
        }
    }
}

fn scale_rows<S: Scalar>(r: ArrayView2<S>, d: &Array1<S>) -> Array2<S> {
    let mut out = r.to_owned();
    Zip::from(out.rows_mut())
        .and(d)
        .for_each(|mut row, &di| row.mapv_inplace(|v| v * di));
    out
}

/// Row `i` of a symmetric operator, from entries when the structure gives
/// them, from a product with the unit vector otherwise
fn operator_row<S: Scalar>(op: &LazyMatrix<S>, i: usize) -> Array1<S> {
    let n = op.ncols();
    if let Some(first) = op.element(i, 0) {
        let mut row = Array1::from_elem(n, first);
        for j in 1..n {
            row[j] = op.element(i, j).unwrap_or_else(S::zero);
        }
        row
    } else {
        let mut e = Array2::zeros((n, 1));
        e[[i, 0]] = S::one();
        op.apply(e.view()).remove_axis(Axis(1))
    }
}

/// Partial pivoted Cholesky factor `L` of shape `(n, k)` with `L Lᵀ ≈ op`,
/// `k <= rank`, pivoting on the largest remaining diagonal entry
pub fn pivoted_cholesky<S: Scalar>(op: &LazyMatrix<S>, rank: usize) -> Result<Array2<S>> {
    let n = op.nrows();
    let rank = rank.min(n);
    let mut diag = op.diagonal()?;
    let mut perm: Vec<usize> = (0..n).collect();
    let max_diag = diag
        .iter()
        .map(|d| d.re())
        .fold(S::Real::zero(), |a, b| if b > a { b } else { a });
    let threshold = max_diag * S::Real::cast(PIVOTED_CHOLESKY_TOLERANCE);
    let mut columns: Vec<Array1<S>> = Vec::with_capacity(rank);

    for m in 0..rank {
        let (best, _) = (m..n).fold((m, diag[perm[m]].re()), |acc, j| {
            let v = diag[perm[j]].re();
            if v > acc.1 {
                (j, v)
            } else {
                acc
            }
        });
        perm.swap(m, best);
        let pivot = perm[m];
        if !(diag[pivot].re() > threshold) {
            debug!("Pivoted Cholesky stopped at rank {m} (remaining diagonal {})", diag[pivot].re());
            break;
        }
        let l_mm = diag[pivot].sqrt();
        let row = operator_row(op, pivot);
        let mut col = Array1::zeros(n);
        col[pivot] = l_mm;
        for &p in perm.iter().skip(m + 1) {
            let mut v = row[p];
            for prev in columns.iter() {
                v -= prev[pivot] * prev[p];
            }
            let lp = v / l_mm;
            col[p] = lp;
            diag[p] -= lp * lp;
        }
        columns.push(col);
    }

    let k = columns.len();
    let mut factor = Array2::zeros((n, k));
    for (j, col) in columns.iter().enumerate() {
        factor.column_mut(j).assign(col);
    }
    Ok(factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lazy::StructureTags;
    use approx::assert_abs_diff_eq;
    use ndarray::Array;

    fn se_kernel(n: usize, lengthscale: f64) -> Array2<f64> {
        let x = Array::linspace(0., 1., n);
        Array2::from_shape_fn((n, n), |(i, j)| {
            (-0.5 * ((x[i] - x[j]) / lengthscale).powi(2)).exp()
        })
    }

    #[test]
    fn test_pivoted_cholesky_full_rank_is_exact() {
        let k = se_kernel(6, 0.5) + Array2::<f64>::eye(6) * 0.1;
        let op = LazyMatrix::dense(k.clone()).with_tags(StructureTags::SPD);
        let l = pivoted_cholesky(&op, 6).unwrap();
        assert_abs_diff_eq!(l.dot(&l.t()), k, epsilon = 1e-10);
    }

    #[test]
    fn test_pivoted_cholesky_low_rank_error_decreases() {
        let k = se_kernel(40, 0.3);
        let op = LazyMatrix::dense(k.clone()).with_tags(StructureTags::PSD);
        let err = |rank| {
            let l = pivoted_cholesky(&op, rank).unwrap();
            (&k - &l.dot(&l.t())).mapv(f64::abs).sum()
        };
        assert!(err(8) < err(4));
        assert!(err(12) < 1e-3);
    }

    #[test]
    fn test_woodbury_inverse() {
        let k = se_kernel(30, 0.2);
        let op = LazyMatrix::dense(k.clone())
            .with_tags(StructureTags::PSD)
            .add_constant_diag(0.05)
            .unwrap();
        let p = Preconditioner::build(&op, 30).unwrap();
        assert!(p.rank() > 0);
        let dense = k + Array2::<f64>::eye(30) * 0.05;
        let applied = p.apply(dense.view());
        assert_abs_diff_eq!(applied, Array2::<f64>::eye(30), epsilon = 1e-6);
    }

    #[test]
    fn test_jacobi_fallback() {
        let op = LazyMatrix::diagonal_matrix(ndarray::array![2., 4.]);
        let p = Preconditioner::build(&op, 5).unwrap();
        assert!(matches!(p, Preconditioner::Jacobi(_)));
        let r = ndarray::array![[2.], [2.]];
        assert_abs_diff_eq!(p.apply(r.view()), ndarray::array![[1.], [0.5]]);
        assert!(matches!(
            Preconditioner::build(&op, 0).unwrap(),
            Preconditioner::Identity
        ));
    }
}
