//! Eigendecomposition of the small symmetric tridiagonal matrices produced
//! by Lanczos, by implicit QL iterations with Wilkinson-like shifts.
//!
//! Written over [`Scalar`] so that Ritz values and vectors carry tangents
//! when the Lanczos coefficients are dual numbers.

use crate::errors::{LinopsError, Result};
use crate::scalar::Scalar;
use num_traits::{Float as _, ToPrimitive, Zero};
use ndarray::{Array1, Array2};

const MAX_QL_ITERATIONS: usize = 60;

fn pythag<S: Scalar>(a: S, b: S) -> S {
    (a * a + b * b).sqrt()
}

fn with_sign_of<S: Scalar>(a: S, b: S) -> S {
    if b >= S::zero() {
        a.abs()
    } else {
        -a.abs()
    }
}

/// Eigenvalues (ascending) and eigenvectors (columns) of the symmetric
/// tridiagonal matrix with diagonal `alpha` and off-diagonal `beta`
pub fn tridiagonal_eigh<S: Scalar>(alpha: &[S], beta: &[S]) -> Result<(Array1<S>, Array2<S>)> {
    let n = alpha.len();
    if n == 0 || beta.len() + 1 != n {
        return Err(LinopsError::ShapeError {
            operation: "tridiagonal_eigh",
            expected: (n, n.saturating_sub(1)),
            actual: (alpha.len(), beta.len()),
        });
    }
    let eps = S::Real::epsilon();
    let mut d = alpha.to_vec();
    let mut e: Vec<S> = beta.to_vec();
    e.push(S::zero());
    let mut z = Array2::<S>::eye(n);

    for l in 0..n {
        let mut iter = 0;
        loop {
            let mut m = l;
            while m + 1 < n {
                let dd = d[m].re_abs() + d[m + 1].re_abs();
                if e[m].re_abs() <= eps * dd {
                    break;
                }
                m += 1;
            }
            if m == l {
                break;
            }
            iter += 1;
            if iter > MAX_QL_ITERATIONS {
                return Err(LinopsError::NonConvergence {
                    iterations: iter,
                    residual: e[l].re().to_f64().unwrap_or(f64::NAN),
                    tolerance: eps.to_f64().unwrap_or(f64::EPSILON),
                });
            }
            let two = S::lit(2.);
            let mut g = (d[l + 1] - d[l]) / (two * e[l]);
            let mut r = pythag(g, S::one());
            g = d[m] - d[l] + e[l] / (g + with_sign_of(r, g));
            let (mut s, mut c, mut p) = (S::one(), S::one(), S::zero());
            let mut deflated = false;
            let mut i = m;
            while i > l {
                i -= 1;
                let f = s * e[i];
                let b = c * e[i];
                r = pythag(f, g);
                e[i + 1] = r;
                if r.re() == S::Real::zero() {
                    d[i + 1] -= p;
                    e[m] = S::zero();
                    deflated = true;
                    break;
                }
                s = f / r;
                c = g / r;
                g = d[i + 1] - p;
                r = (d[i] - g) * s + two * c * b;
                p = s * r;
                d[i + 1] = g + p;
                g = c * r - b;
                for k in 0..n {
                    let zk = z[[k, i + 1]];
                    z[[k, i + 1]] = s * z[[k, i]] + c * zk;
                    z[[k, i]] = c * z[[k, i]] - s * zk;
                }
            }
            if deflated {
                continue;
            }
            d[l] -= p;
            e[l] = g;
            e[m] = S::zero();
        }
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        d[a].partial_cmp(&d[b])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let values = Array1::from_shape_fn(n, |k| d[order[k]]);
    let vectors = Array2::from_shape_fn((n, n), |(i, k)| z[[i, order[k]]]);
    Ok((values, vectors))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Dual;
    use approx::assert_abs_diff_eq;
    use linfa_linalg::eigh::*;

    fn dense(alpha: &[f64], beta: &[f64]) -> Array2<f64> {
        let n = alpha.len();
        let mut t = Array2::from_diag(&Array1::from(alpha.to_vec()));
        for i in 0..n - 1 {
            t[[i, i + 1]] = beta[i];
            t[[i + 1, i]] = beta[i];
        }
        t
    }

    #[test]
    fn test_tridiagonal_eigh_matches_dense() {
        let alpha = [4., 3., 2.5, 1., 6.];
        let beta = [1., 0.5, 2., 0.3];
        let (vals, vecs) = tridiagonal_eigh(&alpha, &beta).unwrap();
        let t = dense(&alpha, &beta);
        let (ref_vals, _) = t.clone().eigh_into().unwrap();
        let mut ref_vals = ref_vals.to_vec();
        ref_vals.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_abs_diff_eq!(vals, Array1::from(ref_vals), epsilon = 1e-10);
        let recon = vecs.dot(&Array2::from_diag(&vals)).dot(&vecs.t());
        assert_abs_diff_eq!(recon, t, epsilon = 1e-10);
    }

    #[test]
    fn test_tridiagonal_single() {
        let (vals, vecs) = tridiagonal_eigh(&[2.5], &[]).unwrap();
        assert_abs_diff_eq!(vals[0], 2.5);
        assert_abs_diff_eq!(vecs[[0, 0]], 1.);
        assert!(tridiagonal_eigh::<f64>(&[1., 2.], &[]).is_err());
    }

    #[test]
    fn test_tridiagonal_eigenvalue_tangent() {
        // T(x) = [[x, 1], [1, 2]], dλ/dx = v_0^2
        let x = 0.5;
        let alpha = [Dual::variable(x), Dual::constant(2.)];
        let beta = [Dual::constant(1.)];
        let (vals, vecs) = tridiagonal_eigh(&alpha, &beta).unwrap();
        for k in 0..2 {
            let v0 = vecs[[0, k]].re;
            assert_abs_diff_eq!(vals[k].eps, v0 * v0, epsilon = 1e-8);
        }
    }
}
