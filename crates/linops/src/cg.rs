//! Batched preconditioned conjugate gradient.
//!
//! All right-hand sides share one product with the operator per iteration.
//! Convergence is tracked per column: a converged column is frozen while the
//! others keep iterating, and the loop ends when every column has converged
//! or the iteration cap is reached. Exhausting the cap is not an error: the
//! best iterate is returned with `converged == false`.

use crate::errors::{LinopsError, Result};
use crate::lazy::LazyMatrix;
use crate::parameters::CgParams;
use crate::preconditioner::Preconditioner;
use crate::scalar::Scalar;
use linfa::Float;
use num_traits::{ToPrimitive, Zero};

use log::{debug, warn};
use ndarray::{Array1, Array2, ArrayBase, Axis, Data, Ix2, Zip};
use std::time::Instant;

/// Outcome of a PCG run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// Every column reached the tolerance
    Converged,
    /// The iteration cap was reached first
    MaxIterationsReached,
    /// A search direction had non-positive curvature
    Breakdown,
}

/// Result of a PCG solve
#[derive(Clone, Debug)]
pub struct CgSolution<S: Scalar> {
    /// Solution, one column per right-hand side
    pub solution: Array2<S>,
    /// Whether every column converged
    pub converged: bool,
    /// Iterations used
    pub iterations: usize,
    /// Final relative residual norm of each column
    pub residual_norms: Array1<S::Real>,
    /// Per-column convergence
    pub column_converged: Vec<bool>,
    /// Requested tolerance
    pub tolerance: f64,
    /// Run outcome
    pub status: ConvergenceStatus,
}

impl<S: Scalar> CgSolution<S> {
    /// Worst relative residual over all columns
    pub fn max_residual(&self) -> f64 {
        self.residual_norms
            .iter()
            .map(|r| r.to_f64().unwrap_or(f64::INFINITY))
            .fold(0., f64::max)
    }

    /// Turns a non-converged solution into a [`LinopsError::NonConvergence`]
    /// for callers which require an accurate solve
    pub fn into_converged(self) -> Result<Self> {
        if self.converged {
            Ok(self)
        } else {
            Err(LinopsError::NonConvergence {
                iterations: self.iterations,
                residual: self.max_residual(),
                tolerance: self.tolerance,
            })
        }
    }
}

/// Working state of one batched PCG run
struct CgState<S: Scalar> {
    x: Array2<S>,
    r: Array2<S>,
    p: Array2<S>,
    rz: Array1<S>,
    active: Vec<bool>,
    converged: Vec<bool>,
}

fn column_norms<S: Scalar>(a: &Array2<S>) -> Array1<S::Real> {
    a.map_axis(Axis(0), |c| {
        let s = c
            .iter()
            .fold(S::Real::zero(), |acc, v| acc + v.re() * v.re());
        num_traits::Float::sqrt(s)
    })
}

fn column_dots<S: Scalar>(a: &Array2<S>, b: &Array2<S>) -> Array1<S> {
    Zip::from(a.columns())
        .and(b.columns())
        .map_collect(|ca, cb| ca.dot(&cb))
}

/// Solves `op X = rhs` starting from zero.
///
/// When no preconditioner is given, one of rank `params.preconditioner_rank`
/// is built from `op` (see [`Preconditioner::build`]).
pub fn solve<S: Scalar>(
    op: &LazyMatrix<S>,
    rhs: &ArrayBase<impl Data<Elem = S>, Ix2>,
    preconditioner: Option<&Preconditioner<S>>,
    params: &CgParams,
) -> Result<CgSolution<S>> {
    match preconditioner {
        Some(precond) => solve_from(op, rhs, None, precond, params),
        None => {
            let precond = Preconditioner::build(op, params.preconditioner_rank)?;
            solve_from(op, rhs, None, &precond, params)
        }
    }
}

/// Solves `op X = rhs` with a given preconditioner, starting from `x0` or zero
pub fn solve_from<S: Scalar>(
    op: &LazyMatrix<S>,
    rhs: &ArrayBase<impl Data<Elem = S>, Ix2>,
    x0: Option<&Array2<S>>,
    precond: &Preconditioner<S>,
    params: &CgParams,
) -> Result<CgSolution<S>> {
    params.check()?;
    let n = op.nrows();
    if !op.is_square() {
        return Err(LinopsError::ShapeError {
            operation: "cg",
            expected: (n, n),
            actual: op.shape(),
        });
    }
    if rhs.nrows() != n {
        return Err(LinopsError::ShapeError {
            operation: "cg",
            expected: (n, rhs.ncols()),
            actual: rhs.dim(),
        });
    }
    let k = rhs.ncols();
    let tol = S::Real::cast(params.tolerance);
    let b = rhs.to_owned();
    let b_norms = column_norms(&b);
    let zero = S::Real::zero();

    let x = match x0 {
        Some(x0) if x0.dim() == (n, k) => x0.to_owned(),
        Some(x0) => {
            return Err(LinopsError::ShapeError {
                operation: "cg initial guess",
                expected: (n, k),
                actual: x0.dim(),
            })
        }
        None => Array2::zeros((n, k)),
    };
    let r = if x0.is_some() { &b - &op.apply(x.view()) } else { b.clone() };
    let z = precond.apply(r.view());
    let rz = column_dots(&r, &z);
    let relative = |norms: &Array1<S::Real>| {
        Zip::from(norms)
            .and(&b_norms)
            .map_collect(|&rn, &bn| if bn > zero { rn / bn } else { zero })
    };
    let mut residuals = relative(&column_norms(&r));
    let converged: Vec<bool> = residuals.iter().map(|&res| res <= tol).collect();
    let mut state = CgState {
        x,
        r,
        p: z,
        rz,
        active: converged.iter().map(|c| !c).collect(),
        converged,
    };

    let now = Instant::now();
    let mut iterations = 0;
    let mut breakdown = false;
    while state.active.iter().any(|&a| a) && iterations < params.max_iterations {
        iterations += 1;
        let q = op.apply(state.p.view());
        let pq = column_dots(&state.p, &q);
        for j in 0..k {
            if !state.active[j] {
                continue;
            }
            if !(pq[j].re() > zero) {
                warn!("PCG breakdown on column {j}: non-positive curvature {}", pq[j].re());
                state.active[j] = false;
                breakdown = true;
                continue;
            }
            let alpha = state.rz[j] / pq[j];
            Zip::from(state.x.column_mut(j))
                .and(state.p.column(j))
                .for_each(|xi, &pi| *xi += alpha * pi);
            Zip::from(state.r.column_mut(j))
                .and(q.column(j))
                .for_each(|ri, &qi| *ri -= alpha * qi);
        }
        residuals = relative(&column_norms(&state.r));
        for j in 0..k {
            if state.active[j] && residuals[j] <= tol {
                state.active[j] = false;
                state.converged[j] = true;
            }
        }
        if !state.active.iter().any(|&a| a) {
            break;
        }
        let z = precond.apply(state.r.view());
        let rz_new = column_dots(&state.r, &z);
        for j in 0..k {
            if !state.active[j] {
                continue;
            }
            let beta = rz_new[j] / state.rz[j];
            Zip::from(state.p.column_mut(j))
                .and(z.column(j))
                .for_each(|pi, &zi| *pi = zi + beta * *pi);
            state.rz[j] = rz_new[j];
        }
    }

    let all_converged = state.converged.iter().all(|&c| c);
    let status = if all_converged {
        ConvergenceStatus::Converged
    } else if breakdown {
        ConvergenceStatus::Breakdown
    } else {
        ConvergenceStatus::MaxIterationsReached
    };
    let solution = CgSolution {
        solution: state.x,
        converged: all_converged,
        iterations,
        residual_norms: residuals,
        column_converged: state.converged,
        tolerance: params.tolerance,
        status,
    };
    if all_converged {
        debug!(
            "PCG converged in {} iterations ({} rhs, {} ms)",
            iterations,
            k,
            now.elapsed().as_millis()
        );
    } else {
        warn!(
            "PCG not converged ({:?}) after {} iterations: residual {:e} > tolerance {:e}",
            status,
            iterations,
            solution.max_residual(),
            params.tolerance
        );
    }
    Ok(solution)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lazy::StructureTags;
    use crate::Dual;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array};
    use ndarray_rand::rand::SeedableRng;
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;
    use rand_xoshiro::Xoshiro256Plus;

    fn random_spd(n: usize, seed: u64) -> Array2<f64> {
        let mut rng = Xoshiro256Plus::seed_from_u64(seed);
        let a = Array2::random_using((n, n), Uniform::new(-1., 1.), &mut rng);
        a.dot(&a.t()) + Array2::<f64>::eye(n) * (n as f64 * 0.1)
    }

    #[test]
    fn test_cg_round_trip() {
        let n = 40;
        let k = random_spd(n, 42);
        let op = LazyMatrix::dense(k).with_tags(StructureTags::SPD);
        let mut rng = Xoshiro256Plus::seed_from_u64(0);
        let x = Array2::random_using((n, 3), Uniform::new(-1., 1.), &mut rng);
        let b = op.matmul(&x).unwrap();
        let params = CgParams::default().tolerance(1e-10);
        let res = solve(&op, &b, None, &params).unwrap();
        assert!(res.converged);
        assert!(res.iterations < params.max_iterations);
        assert!(res.max_residual() < 1e-10);
        assert_eq!(res.status, ConvergenceStatus::Converged);
        assert_abs_diff_eq!(res.solution, x, epsilon = 1e-6);
    }

    #[test]
    fn test_cg_identity_with_jitter_converges_immediately() {
        let n = 10;
        let op = LazyMatrix::<f64>::identity(n).add_constant_diag(1e-6).unwrap();
        let b = Array::linspace(1., 10., n).insert_axis(Axis(1));
        let params = CgParams::default().tolerance(1e-14);
        let res = solve(&op, &b, None, &params).unwrap();
        assert!(res.converged);
        assert!(res.iterations <= 2, "took {} iterations", res.iterations);
        assert_abs_diff_eq!(res.solution, &b / (1. + 1e-6), epsilon = 1e-12);
    }

    #[test]
    fn test_cg_columns_converge_independently() {
        let op = LazyMatrix::diagonal_matrix(array![1., 2., 3., 4.]);
        // first column is an eigenvector, second one needs four iterations
        let b = array![[1., 1.], [0., 1.], [0., 1.], [0., 1.]];
        let params = CgParams::with_preconditioner_rank(0).tolerance(1e-12);
        let res = solve(&op, &b, None, &params).unwrap();
        assert!(res.converged);
        assert_eq!(res.column_converged, vec![true, true]);
        assert_abs_diff_eq!(
            res.solution,
            array![[1., 1.], [0., 0.5], [0., 1. / 3.], [0., 0.25]],
            epsilon = 1e-10
        );
    }

    #[test]
    fn test_cg_zero_rhs() {
        let op = LazyMatrix::dense(random_spd(5, 3));
        let res = solve(&op, &Array2::<f64>::zeros((5, 2)), None, &CgParams::default()).unwrap();
        assert!(res.converged);
        assert_eq!(res.iterations, 0);
        assert_abs_diff_eq!(res.solution, Array2::<f64>::zeros((5, 2)));
    }

    #[test]
    fn test_cg_non_convergence_signal() {
        let n = 50;
        let op = LazyMatrix::dense(random_spd(n, 5));
        let b = Array2::ones((n, 1));
        let params = CgParams::with_preconditioner_rank(0)
            .tolerance(1e-12)
            .max_iterations(3);
        let res = solve(&op, &b, None, &params).unwrap();
        assert!(!res.converged);
        assert_eq!(res.iterations, 3);
        assert_eq!(res.status, ConvergenceStatus::MaxIterationsReached);
        match res.into_converged() {
            Err(LinopsError::NonConvergence {
                iterations,
                residual,
                tolerance,
            }) => {
                assert_eq!(iterations, 3);
                assert!(residual > tolerance);
                assert_eq!(tolerance, 1e-12);
            }
            _ => panic!("expected a non convergence error"),
        }
    }

    #[test]
    fn test_cg_shape_errors() {
        let op = LazyMatrix::dense(random_spd(4, 1));
        assert!(matches!(
            solve(&op, &Array2::<f64>::ones((3, 1)), None, &CgParams::default()),
            Err(LinopsError::ShapeError { .. })
        ));
    }

    #[test]
    fn test_cg_dual_derivative() {
        // d/dt (A + t I)^-1 b = -(A + t I)^-2 b
        let n = 8;
        let a = random_spd(n, 11);
        let t = 0.5;
        let ad = a.mapv(Dual::constant);
        let op = LazyMatrix::dense(ad)
            .add_constant_diag(Dual::variable(t))
            .unwrap();
        let b = Array2::from_shape_fn((n, 1), |(i, _)| Dual::constant(i as f64 - 3.));
        let res = solve(&op, &b, None, &CgParams::default().tolerance(1e-13)).unwrap();
        let m = LazyMatrix::dense(a + Array2::<f64>::eye(n) * t);
        let bs = b.mapv(|v| v.re);
        let params = CgParams::default().tolerance(1e-13);
        let x = solve(&m, &bs, None, &params).unwrap().solution;
        let dx = solve(&m, &x, None, &params).unwrap().solution.mapv(|v| -v);
        assert_abs_diff_eq!(res.solution.mapv(|v| v.re), x, epsilon = 1e-9);
        assert_abs_diff_eq!(res.solution.mapv(|v| v.eps), dx, epsilon = 1e-7);
    }
}
