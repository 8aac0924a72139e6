//! Batched symmetric Lanczos tridiagonalization with full reorthogonalization.
//!
//! Each column of the starting block drives its own Krylov recursion. The
//! products of all active recursions with the operator are computed together.

use crate::errors::{LinopsError, Result};
use crate::lazy::LazyMatrix;
use crate::parameters::MAX_LANCZOS_STEPS;
use crate::scalar::Scalar;
use linfa::Float;
use num_traits::Zero;
use crate::tridiagonal::tridiagonal_eigh;

use log::{debug, warn};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix2};
use std::time::Instant;

/// Off-diagonal coefficient, relative to the running norm estimate, below
/// which the Krylov space is considered invariant
const LANCZOS_BREAKDOWN_TOLERANCE: f64 = 1e-10;

/// Decomposition `op Q ≈ Q T` obtained from one starting vector
#[derive(Clone, Debug)]
pub struct LanczosRun<S: Scalar> {
    /// Orthonormal Lanczos vectors `Q` of shape `(n, k)`
    pub basis: Array2<S>,
    /// Diagonal of `T` (length `k`)
    pub alpha: Array1<S>,
    /// Off-diagonal of `T` (length `k - 1`)
    pub beta: Array1<S>,
    /// Norm of the starting vector
    pub init_norm: S,
}

impl<S: Scalar> LanczosRun<S> {
    /// Number of steps actually performed
    pub fn steps(&self) -> usize {
        self.alpha.len()
    }

    /// Dense tridiagonal matrix `T`
    pub fn tridiagonal(&self) -> Array2<S> {
        let k = self.steps();
        let mut t = Array2::zeros((k, k));
        for i in 0..k {
            t[[i, i]] = self.alpha[i];
            if i + 1 < k {
                t[[i, i + 1]] = self.beta[i];
                t[[i + 1, i]] = self.beta[i];
            }
        }
        t
    }

    /// Ritz values (ascending) and eigenvectors of `T`
    pub fn ritz(&self) -> Result<(Array1<S>, Array2<S>)> {
        tridiagonal_eigh(&self.alpha.to_vec(), &self.beta.to_vec())
    }
}

/// Private per-column recursion state
struct LanczosState<S: Scalar> {
    vectors: Vec<Array1<S>>,
    alpha: Vec<S>,
    beta: Vec<S>,
    init_norm: S,
    active: bool,
}

impl<S: Scalar> LanczosState<S> {
    fn into_run(self) -> LanczosRun<S> {
        let n = self.vectors[0].len();
        let k = self.alpha.len();
        let mut basis = Array2::zeros((n, k));
        for (j, v) in self.vectors.iter().take(k).enumerate() {
            basis.column_mut(j).assign(v);
        }
        LanczosRun {
            basis,
            alpha: Array1::from(self.alpha),
            beta: Array1::from(self.beta),
            init_norm: self.init_norm,
        }
    }
}

/// Effective number of steps for an operator of size `n`
pub(crate) fn clamp_steps(steps: usize, n: usize) -> usize {
    let max = n.min(MAX_LANCZOS_STEPS).max(1);
    let clamped = steps.clamp(1, max);
    if clamped != steps {
        warn!("Lanczos steps {steps} clamped to {clamped} (operator size {n})");
    }
    clamped
}

/// Runs `steps` Lanczos iterations on the symmetric `op` from every column
/// of `init`, returning one run per column.
///
/// A column stops early when its Krylov space becomes invariant. The number
/// of steps is clamped to `[1, min(n, MAX_LANCZOS_STEPS)]`.
pub fn lanczos<S: Scalar>(
    op: &LazyMatrix<S>,
    init: &ArrayBase<impl Data<Elem = S>, Ix2>,
    steps: usize,
) -> Result<Vec<LanczosRun<S>>> {
    let n = op.nrows();
    if !op.is_square() || init.nrows() != n {
        return Err(LinopsError::ShapeError {
            operation: "lanczos",
            expected: (n, init.ncols()),
            actual: init.dim(),
        });
    }
    let steps = clamp_steps(steps, n);
    let zero = S::Real::zero();
    let breakdown = S::Real::cast(LANCZOS_BREAKDOWN_TOLERANCE);

    let mut states = Vec::with_capacity(init.ncols());
    for (j, col) in init.columns().into_iter().enumerate() {
        let norm = col.dot(&col).sqrt();
        if !(norm.re() > zero) {
            return Err(LinopsError::InvalidValueError(format!(
                "Lanczos starting vector {j} is zero"
            )));
        }
        states.push(LanczosState {
            vectors: vec![col.mapv(|v| v / norm)],
            alpha: Vec::with_capacity(steps),
            beta: Vec::with_capacity(steps),
            init_norm: norm,
            active: true,
        });
    }

    let now = Instant::now();
    let mut norm_estimate = zero;
    for step in 0..steps {
        let active: Vec<usize> = (0..states.len()).filter(|&c| states[c].active).collect();
        if active.is_empty() {
            break;
        }
        let mut block = Array2::zeros((n, active.len()));
        for (b, &c) in active.iter().enumerate() {
            block.column_mut(b).assign(&states[c].vectors[step]);
        }
        let products = op.apply(block.view());

        for (b, &c) in active.iter().enumerate() {
            let state = &mut states[c];
            let q = &state.vectors[step];
            let mut w = products.column(b).to_owned();
            let a = q.dot(&w);
            w.scaled_add(-a, q);
            if step > 0 {
                w.scaled_add(-state.beta[step - 1], &state.vectors[step - 1]);
            }
            // twice is enough
            for _ in 0..2 {
                for v in state.vectors.iter() {
                    let proj = v.dot(&w);
                    w.scaled_add(-proj, v);
                }
            }
            state.alpha.push(a);
            if a.re_abs() > norm_estimate {
                norm_estimate = a.re_abs();
            }
            if step + 1 == steps {
                continue;
            }
            let b_next = w.dot(&w).sqrt();
            if b_next.re() > norm_estimate {
                norm_estimate = b_next.re();
            }
            if !(b_next.re() > breakdown * norm_estimate) {
                debug!("Lanczos column {c} invariant after {} steps", step + 1);
                state.active = false;
                continue;
            }
            state.beta.push(b_next);
            state.vectors.push(w.mapv(|v| v / b_next));
        }
    }
    debug!(
        "Lanczos: {} runs of at most {} steps ({} ms)",
        states.len(),
        steps,
        now.elapsed().as_millis()
    );
    Ok(states.into_iter().map(LanczosState::into_run).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lazy::StructureTags;
    use approx::assert_abs_diff_eq;
    use linfa_linalg::eigh::*;
    use ndarray::{array, Array};

    fn spd(n: usize) -> Array2<f64> {
        let x: Array1<f64> = Array::linspace(0., 1., n);
        Array2::from_shape_fn((n, n), |(i, j)| {
            (-0.5 * ((x[i] - x[j]) / 0.3).powi(2)).exp() + if i == j { 0.1 } else { 0. }
        })
    }

    #[test]
    fn test_lanczos_decomposition() {
        let n = 20;
        let a = spd(n);
        let op = LazyMatrix::dense(a.clone()).with_tags(StructureTags::SPD);
        let init = Array2::from_shape_fn((n, 2), |(i, j)| 1. + (i * (j + 1)) as f64 * 0.1);
        let runs = lanczos(&op, &init, 8).unwrap();
        assert_eq!(runs.len(), 2);
        for run in runs.iter() {
            let k = run.steps();
            assert_eq!(run.basis.dim(), (n, k));
            assert_eq!(run.beta.len(), k - 1);
            // Q is orthonormal and Qᵀ A Q = T
            assert_abs_diff_eq!(
                run.basis.t().dot(&run.basis),
                Array2::<f64>::eye(k),
                epsilon = 1e-10
            );
            assert_abs_diff_eq!(
                run.basis.t().dot(&a).dot(&run.basis),
                run.tridiagonal(),
                epsilon = 1e-10
            );
        }
    }

    #[test]
    fn test_lanczos_full_steps_recover_spectrum() {
        let n = 12;
        let a = spd(n);
        let op = LazyMatrix::dense(a.clone());
        let init = Array2::ones((n, 1));
        // more steps than n are clamped
        let runs = lanczos(&op, &init, 50).unwrap();
        let (ritz, _) = runs[0].ritz().unwrap();
        let largest = ritz[ritz.len() - 1];
        let (eigs, _) = a.eigh_into().unwrap();
        let exact_max = eigs.iter().cloned().fold(f64::MIN, f64::max);
        assert_abs_diff_eq!(largest, exact_max, epsilon = 1e-8);
    }

    #[test]
    fn test_lanczos_invariant_subspace() {
        let op = LazyMatrix::diagonal_matrix(array![1., 2., 3., 4.]);
        let init = array![[1.], [1.], [0.], [0.]];
        let runs = lanczos(&op, &init, 4).unwrap();
        assert_eq!(runs[0].steps(), 2);
        let (ritz, _) = runs[0].ritz().unwrap();
        assert_abs_diff_eq!(ritz, array![1., 2.], epsilon = 1e-12);
        assert_abs_diff_eq!(runs[0].init_norm, 2f64.sqrt());
    }

    #[test]
    fn test_lanczos_errors() {
        let op = LazyMatrix::<f64>::identity(3);
        assert!(matches!(
            lanczos(&op, &Array2::zeros((3, 1)), 2),
            Err(LinopsError::InvalidValueError(_))
        ));
        assert!(matches!(
            lanczos(&op, &Array2::ones((4, 1)), 2),
            Err(LinopsError::ShapeError { .. })
        ));
        // zero steps still performs one
        let runs = lanczos(&op, &Array2::ones((3, 1)), 0).unwrap();
        assert_eq!(runs[0].steps(), 1);
    }
}
