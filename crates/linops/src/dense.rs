//! Small dense factorizations generic over [`Scalar`], so that they can be
//! differentiated. Used on `(rank, rank)` systems only.

use crate::errors::{LinopsError, Result};
use crate::scalar::Scalar;
use num_traits::Zero;
use ndarray::{Array2, ArrayBase, Data, Ix2};

/// Lower Cholesky factor `L` with `A = L Lᵀ`
pub fn cholesky<S: Scalar>(a: &ArrayBase<impl Data<Elem = S>, Ix2>) -> Result<Array2<S>> {
    let n = a.nrows();
    if a.ncols() != n {
        return Err(LinopsError::ShapeError {
            operation: "cholesky",
            expected: (n, n),
            actual: a.dim(),
        });
    }
    let mut l = Array2::<S>::zeros((n, n));
    for j in 0..n {
        let mut d = a[[j, j]];
        for k in 0..j {
            d -= l[[j, k]] * l[[j, k]];
        }
        if !(d.re() > S::Real::zero()) {
            return Err(LinopsError::InvalidValueError(format!(
                "matrix not positive definite: pivot {} at index {j}",
                d.re()
            )));
        }
        let ljj = d.sqrt();
        l[[j, j]] = ljj;
        for i in j + 1..n {
            let mut v = a[[i, j]];
            for k in 0..j {
                v -= l[[i, k]] * l[[j, k]];
            }
            l[[i, j]] = v / ljj;
        }
    }
    Ok(l)
}

/// Solves `L X = B` for lower triangular `L`
pub fn solve_lower<S: Scalar>(l: &Array2<S>, b: &ArrayBase<impl Data<Elem = S>, Ix2>) -> Array2<S> {
    let n = l.nrows();
    let mut x = b.to_owned();
    for c in 0..x.ncols() {
        for i in 0..n {
            let mut v = x[[i, c]];
            for k in 0..i {
                v -= l[[i, k]] * x[[k, c]];
            }
            x[[i, c]] = v / l[[i, i]];
        }
    }
    x
}

/// Solves `Lᵀ X = B` for lower triangular `L`
pub fn solve_lower_t<S: Scalar>(
    l: &Array2<S>,
    b: &ArrayBase<impl Data<Elem = S>, Ix2>,
) -> Array2<S> {
    let n = l.nrows();
    let mut x = b.to_owned();
    for c in 0..x.ncols() {
        for i in (0..n).rev() {
            let mut v = x[[i, c]];
            for k in i + 1..n {
                v -= l[[k, i]] * x[[k, c]];
            }
            x[[i, c]] = v / l[[i, i]];
        }
    }
    x
}

/// Solves `A X = B` given the Cholesky factor of `A`
pub fn cho_solve<S: Scalar>(l: &Array2<S>, b: &ArrayBase<impl Data<Elem = S>, Ix2>) -> Array2<S> {
    solve_lower_t(l, &solve_lower(l, b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_cholesky_solve() {
        let a = array![[4., 2., 0.6], [2., 5., 1.], [0.6, 1., 3.]];
        let l = cholesky(&a).unwrap();
        assert_abs_diff_eq!(l.dot(&l.t()), a, epsilon = 1e-12);
        let b = array![[1., 0.], [2., 1.], [3., -1.]];
        let x = cho_solve(&l, &b);
        assert_abs_diff_eq!(a.dot(&x), b, epsilon = 1e-12);
    }

    #[test]
    fn test_cholesky_not_positive() {
        let a = array![[1., 2.], [2., 1.]];
        assert!(matches!(
            cholesky(&a),
            Err(LinopsError::InvalidValueError(_))
        ));
    }
}
