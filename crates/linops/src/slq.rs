//! Stochastic Lanczos quadrature.
//!
//! `tr f(A) ≈ 1/P Σ_p ‖z_p‖² Σ_k τ_pk² f(θ_pk)` where `θ_pk` are the Ritz
//! values of the Lanczos run started from probe `z_p` and `τ_pk` the first
//! components of the corresponding Ritz vectors.
//!
//! Gradients with respect to hyperparameters are obtained by running the
//! same estimate on [`Dual`] numbers, once per hyperparameter, with the
//! same probes: this is the derivative of the estimator itself.

use crate::cg;
use crate::dual::Dual;
use crate::errors::{LinopsError, Result};
use crate::lanczos::{lanczos, LanczosRun};
use crate::lazy::LazyMatrix;
use crate::parameters::{CgParams, SlqParams};
use crate::probes::seeded_probe_vectors;
use crate::scalar::Scalar;
use num_traits::{One, ToPrimitive, Zero};

use linfa::Float;
use log::{debug, warn};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix2, Zip};
use rayon::prelude::*;
use std::time::Instant;

/// Ritz values below this floor are clipped up to it before `ln`
pub const EIGENVALUE_FLOOR: f64 = 1e-10;
/// Negative Ritz values of magnitude above this fraction of the largest one
/// are not round-off and fail with [`LinopsError::NumericalDomainError`]
pub const NEGATIVE_EIGENVALUE_TOLERANCE: f64 = 1e-6;

/// A quadrature estimate, the number of Ritz values clipped to compute it
/// and the Lanczos runs it was computed from
struct Quadrature<S: Scalar> {
    value: S,
    n_clipped: usize,
    runs: Vec<LanczosRun<S>>,
}

fn quadrature<S, G>(
    op: &LazyMatrix<S>,
    f: &G,
    probes: &Array2<S::Real>,
    steps: usize,
) -> Result<Quadrature<S>>
where
    S: Scalar,
    G: Fn(S) -> S,
{
    let z = probes.mapv(S::from_real);
    let runs = lanczos(op, &z, steps)?;
    let zero = S::Real::zero();
    let floor = S::Real::cast(EIGENVALUE_FLOOR);
    let tolerance = S::Real::cast(NEGATIVE_EIGENVALUE_TOLERANCE);

    let mut total = S::zero();
    let mut n_clipped = 0;
    for run in runs.iter() {
        let (ritz, vectors) = run.ritz()?;
        let lambda_max = ritz
            .iter()
            .map(|l| l.re())
            .fold(zero, |a, b| if b > a { b } else { a });
        let mut acc = S::zero();
        for (k, &lambda) in ritz.iter().enumerate() {
            if lambda.re() < -(tolerance * lambda_max) {
                return Err(LinopsError::NumericalDomainError {
                    eigenvalue: lambda.re().to_f64().unwrap_or(f64::NAN),
                    floor: -(tolerance * lambda_max).to_f64().unwrap_or(0.),
                });
            }
            let lambda = if lambda.re() < floor {
                n_clipped += 1;
                S::from_real(floor)
            } else {
                lambda
            };
            let tau = vectors[[0, k]];
            acc += tau * tau * f(lambda);
        }
        total += run.init_norm * run.init_norm * acc;
    }
    if n_clipped > 0 {
        warn!("SLQ: {n_clipped} Ritz values clipped to {EIGENVALUE_FLOOR:e}");
    }
    Ok(Quadrature {
        value: total.scale(S::Real::one() / S::Real::cast(runs.len())),
        n_clipped,
        runs,
    })
}

fn check_square<S: Scalar>(op: &LazyMatrix<S>, operation: &'static str) -> Result<()> {
    if op.is_square() {
        Ok(())
    } else {
        Err(LinopsError::ShapeError {
            operation,
            expected: (op.nrows(), op.nrows()),
            actual: op.shape(),
        })
    }
}

/// Estimates `tr f(op)` for a symmetric `op`
pub fn trace_fn<S, G>(op: &LazyMatrix<S>, f: G, params: &SlqParams) -> Result<S>
where
    S: Scalar,
    G: Fn(S) -> S,
{
    params.check()?;
    check_square(op, "trace_fn")?;
    let probes = seeded_probe_vectors(
        op.nrows(),
        params.n_probes,
        params.distribution,
        params.seed,
    );
    Ok(quadrature(op, &f, &probes, params.lanczos_steps)?.value)
}

/// Estimates `log det op` for a symmetric positive definite `op`
pub fn log_det<S: Scalar>(op: &LazyMatrix<S>, params: &SlqParams) -> Result<S> {
    trace_fn(op, |l: S| l.ln(), params)
}

/// Log determinant estimate with its gradient
#[derive(Clone, Debug)]
pub struct LogDetEstimate<F: Float> {
    /// Estimated `log det`
    pub value: F,
    /// Derivative of the estimate with respect to each hyperparameter
    pub gradient: Array1<F>,
    /// False when eigenvalue clipping occurred or a tangent is not finite:
    /// the gradient is then the one of a modified function
    pub differentiable: bool,
}

/// Runs `pass` on dual hyperparameters, one tangent direction per
/// hyperparameter, in parallel. With no hyperparameter a single pass with
/// constant duals is run.
fn dual_passes<F, T, P>(theta: &Array1<F>, pass: P) -> Result<Vec<T>>
where
    F: Float,
    T: Send,
    P: Fn(&Array1<Dual<F>>) -> Result<T> + Sync,
{
    let seeded = |i: usize| {
        Array1::from_shape_fn(theta.len(), |j| {
            if i == j {
                Dual::variable(theta[j])
            } else {
                Dual::constant(theta[j])
            }
        })
    };
    (0..theta.len().max(1))
        .into_par_iter()
        .map(|i| pass(&seeded(i)))
        .collect()
}

/// Estimates `log det K(θ)` and `∂ log det K / ∂θ` where `build` returns
/// the operator `K(θ)` for dual-valued hyperparameters.
///
/// Every pass uses the probes drawn from `params.seed`, so the gradient is
/// the exact derivative of the (deterministic) estimate.
pub fn log_det_and_grad<F, B>(
    build: B,
    theta: &Array1<F>,
    params: &SlqParams,
) -> Result<LogDetEstimate<F>>
where
    F: Float,
    B: Fn(&Array1<Dual<F>>) -> Result<LazyMatrix<Dual<F>>> + Sync,
{
    params.check()?;
    let now = Instant::now();
    let passes = dual_passes(theta, |th| {
        let op = build(th)?;
        check_square(&op, "log_det_and_grad")?;
        let probes =
            seeded_probe_vectors(op.nrows(), params.n_probes, params.distribution, params.seed);
        quadrature(&op, &|l: Dual<F>| l.ln(), &probes, params.lanczos_steps)
    })?;
    let value = passes[0].value.re;
    let gradient = if theta.is_empty() {
        Array1::zeros(0)
    } else {
        passes.iter().map(|q| q.value.eps).collect()
    };
    let clipped = passes.iter().any(|q| q.n_clipped > 0);
    let differentiable = !clipped && gradient.iter().all(|g: &F| g.is_finite());
    debug!(
        "SLQ log det {} with gradient of size {} ({} ms)",
        value,
        theta.len(),
        now.elapsed().as_millis()
    );
    Ok(LogDetEstimate {
        value,
        gradient,
        differentiable,
    })
}

/// `Σ_j b_jᵀ op⁻¹ b_j` together with `log det op`
#[derive(Clone, Debug)]
pub struct InvQuadLogDet<S: Scalar> {
    /// Inverse quadratic form summed over right-hand sides
    pub inv_quad: S,
    /// Log determinant estimate
    pub log_det: S,
    /// `op⁻¹ b`
    pub solution: Array2<S>,
    /// Whether the PCG solve converged
    pub converged: bool,
    /// Number of clipped Ritz values
    pub n_clipped: usize,
    /// Lanczos runs of the log determinant, one per probe. They can be reused
    /// for a root decomposition of `op` with [`crate::RootDecomposition::from_lanczos`].
    pub lanczos_runs: Vec<LanczosRun<S>>,
}

/// Computes the two terms of a Gaussian log likelihood: the inverse
/// quadratic form by PCG and the log determinant by SLQ
pub fn inv_quad_log_det<S: Scalar>(
    op: &LazyMatrix<S>,
    rhs: &ArrayBase<impl Data<Elem = S>, Ix2>,
    cg_params: &CgParams,
    slq_params: &SlqParams,
) -> Result<InvQuadLogDet<S>> {
    slq_params.check()?;
    check_square(op, "inv_quad_log_det")?;
    let solve = cg::solve(op, rhs, None, cg_params)?;
    let inv_quad = Zip::from(rhs)
        .and(&solve.solution)
        .fold(S::zero(), |acc, &b, &x| acc + b * x);
    let probes = seeded_probe_vectors(
        op.nrows(),
        slq_params.n_probes,
        slq_params.distribution,
        slq_params.seed,
    );
    let quad = quadrature(op, &|l: S| l.ln(), &probes, slq_params.lanczos_steps)?;
    Ok(InvQuadLogDet {
        inv_quad,
        log_det: quad.value,
        solution: solve.solution,
        converged: solve.converged,
        n_clipped: quad.n_clipped,
        lanczos_runs: quad.runs,
    })
}

/// Inverse quadratic form and log determinant with their gradients
#[derive(Clone, Debug)]
pub struct InvQuadLogDetEstimate<F: Float> {
    /// Inverse quadratic form
    pub inv_quad: F,
    /// Its derivative with respect to each hyperparameter
    pub inv_quad_gradient: Array1<F>,
    /// Log determinant estimate and gradient
    pub log_det: LogDetEstimate<F>,
    /// Whether every PCG solve converged
    pub converged: bool,
}

/// Same as [`inv_quad_log_det`] for `K(θ)` given by `build`, with the
/// gradients with respect to `θ`
pub fn inv_quad_log_det_and_grad<F, B>(
    build: B,
    theta: &Array1<F>,
    rhs: &Array2<F>,
    cg_params: &CgParams,
    slq_params: &SlqParams,
) -> Result<InvQuadLogDetEstimate<F>>
where
    F: Float,
    B: Fn(&Array1<Dual<F>>) -> Result<LazyMatrix<Dual<F>>> + Sync,
{
    let rhs = rhs.mapv(Dual::constant);
    let now = Instant::now();
    let passes = dual_passes(theta, |th| {
        let op = build(th)?;
        inv_quad_log_det(&op, &rhs, cg_params, slq_params)
    })?;
    let grad = |get: &dyn Fn(&InvQuadLogDet<Dual<F>>) -> Dual<F>| -> Array1<F> {
        if theta.is_empty() {
            Array1::zeros(0)
        } else {
            passes.iter().map(|p| get(p).eps).collect()
        }
    };
    let inv_quad_gradient = grad(&|p| p.inv_quad);
    let log_det_gradient = grad(&|p| p.log_det);
    let clipped = passes.iter().any(|p| p.n_clipped > 0);
    let finite = inv_quad_gradient
        .iter()
        .chain(log_det_gradient.iter())
        .all(|g| g.is_finite());
    let converged = passes.iter().all(|p| p.converged);
    debug!(
        "Inverse quadratic and log det with gradients ({} ms)",
        now.elapsed().as_millis()
    );
    Ok(InvQuadLogDetEstimate {
        inv_quad: passes[0].inv_quad.re,
        inv_quad_gradient,
        log_det: LogDetEstimate {
            value: passes[0].log_det.re,
            gradient: log_det_gradient,
            differentiable: !clipped && finite,
        },
        converged,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dense::cholesky;
    use crate::lazy::StructureTags;
    use crate::probes::ProbeDistribution;
    use approx::assert_abs_diff_eq;
    use finitediff::FiniteDiff;
    use linfa_linalg::eigh::*;
    use ndarray::{array, Array};

    fn se_matrix(n: usize, lengthscale: f64, noise: f64) -> Array2<f64> {
        let x = Array::linspace(0., 1., n);
        Array2::from_shape_fn((n, n), |(i, j)| {
            (-0.5 * ((x[i] - x[j]) / lengthscale).powi(2)).exp() + if i == j { noise } else { 0. }
        })
    }

    fn exact_log_det(a: &Array2<f64>) -> f64 {
        let l = cholesky(a).unwrap();
        2. * l.diag().mapv(f64::ln).sum()
    }

    /// Builds `s · SE(ℓ) + 0.1 I` on `n` points with `θ = (ℓ, s)`
    fn se_operator<S: Scalar>(theta: &Array1<S>, n: usize) -> LazyMatrix<S> {
        let x = Array::linspace(0., 1., n);
        let (l, s) = (theta[0], theta[1]);
        let k = Array2::from_shape_fn((n, n), |(i, j)| {
            let r = S::lit(x[i] - x[j]) / l;
            s * (-(r * r).scale(S::Real::cast(0.5))).exp()
        });
        LazyMatrix::dense(k)
            .with_tags(StructureTags::PSD)
            .add_constant_diag(S::lit(0.1))
            .unwrap()
    }

    #[test]
    fn test_quadrature_bias_shrinks_with_steps() {
        let n = 30;
        let a = se_matrix(n, 0.2, 0.1);
        let op = LazyMatrix::dense(a.clone());
        let params = SlqParams::default().n_probes(4);
        // exact Hutchinson estimate for the same probes
        let (eigs, vecs) = a.eigh_into().unwrap();
        let ln_a = vecs.dot(&Array2::from_diag(&eigs.mapv(f64::ln))).dot(&vecs.t());
        let z: Array2<f64> = seeded_probe_vectors(n, 4, params.distribution, params.seed);
        let hutchinson = (&z * &ln_a.dot(&z)).sum() / 4.;

        let err = |steps| {
            (log_det(&op, &params.clone().lanczos_steps(steps)).unwrap() - hutchinson).abs()
        };
        assert!(err(2) > err(6));
        assert!(err(6) > err(12));
        assert_abs_diff_eq!(err(n), 0., epsilon = 1e-7);
    }

    #[test]
    fn test_log_det_converges_with_probes() {
        let n = 30;
        let a = se_matrix(n, 0.1, 1.);
        let exact = exact_log_det(&a);
        let op = LazyMatrix::dense(a);
        let estimate = log_det(&op, &SlqParams::default().n_probes(400)).unwrap();
        // per-probe standard deviation is about 5.2
        assert_abs_diff_eq!(estimate, exact, epsilon = 1.3);
    }

    #[test]
    fn test_log_det_diagonal_is_exact() {
        let d = array![0.5, 1., 2., 4., 8.];
        let op = LazyMatrix::diagonal_matrix(d.clone());
        let estimate = log_det(&op, &SlqParams::default().n_probes(3)).unwrap();
        assert_abs_diff_eq!(estimate, d.mapv(f64::ln).sum(), epsilon = 1e-10);
    }

    #[test]
    fn test_trace_fn_identity_function() {
        let a = se_matrix(10, 0.3, 0.5);
        let trace = a.diag().sum();
        let op = LazyMatrix::dense(a);
        let params = SlqParams::default()
            .n_probes(4000)
            .lanczos_steps(2)
            .distribution(ProbeDistribution::Rademacher);
        let estimate = trace_fn(&op, |l| l, &params).unwrap();
        // Gauss quadrature is exact for f(λ) = λ, only the probe variance remains
        assert_abs_diff_eq!(estimate, trace, epsilon = 0.05 * trace);
    }

    #[test]
    fn test_negative_eigenvalue_is_a_domain_error() {
        let op = LazyMatrix::diagonal_matrix(array![1., -1., 2.]);
        match log_det(&op, &SlqParams::default()) {
            Err(LinopsError::NumericalDomainError { eigenvalue, floor }) => {
                assert_abs_diff_eq!(eigenvalue, -1., epsilon = 1e-10);
                assert!(floor < 0.);
            }
            other => panic!("expected a domain error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_tiny_negative_eigenvalue_is_clipped() {
        let build = |theta: &Array1<Dual<f64>>| {
            Ok(LazyMatrix::diagonal_matrix(array![
                theta[0],
                Dual::constant(1.),
                Dual::constant(-1e-9)
            ]))
        };
        let estimate = log_det_and_grad(build, &array![2.], &SlqParams::default()).unwrap();
        assert!(!estimate.differentiable);
        assert!(estimate.value.is_finite());
        assert_abs_diff_eq!(estimate.value, 2f64.ln() + EIGENVALUE_FLOOR.ln(), epsilon = 1e-8);
        assert_abs_diff_eq!(estimate.gradient[0], 0.5, epsilon = 1e-8);
    }

    #[test]
    fn test_log_det_gradient_matches_finite_differences() {
        let n = 20;
        let params = SlqParams::default().n_probes(5).lanczos_steps(10);
        let theta = array![0.25, 1.5];
        let estimate =
            log_det_and_grad(|th| Ok(se_operator(th, n)), &theta, &params).unwrap();
        assert!(estimate.differentiable);
        let value = log_det(&se_operator(&theta, n), &params).unwrap();
        assert_abs_diff_eq!(estimate.value, value, epsilon = 1e-12);

        let f = |th: &Vec<f64>| -> f64 {
            log_det(&se_operator(&Array1::from(th.clone()), n), &params).unwrap()
        };
        let fd = theta.to_vec().central_diff(&f);
        for i in 0..2 {
            assert_abs_diff_eq!(estimate.gradient[i], fd[i], epsilon = 1e-3 * fd[i].abs().max(1.));
        }
    }

    #[test]
    fn test_inv_quad_log_det_gradient() {
        let n = 15;
        let cg_params = CgParams::default().tolerance(1e-12);
        let slq_params = SlqParams::default().n_probes(3).lanczos_steps(15);
        let theta = array![0.3, 2.];
        let y = Array2::from_shape_fn((n, 1), |(i, _)| (i as f64 * 0.4).sin());
        let estimate = inv_quad_log_det_and_grad(
            |th| Ok(se_operator(th, n)),
            &theta,
            &y,
            &cg_params,
            &slq_params,
        )
        .unwrap();
        assert!(estimate.converged);

        let k = se_operator(&theta, n).evaluate().unwrap();
        let l = cholesky(&k).unwrap();
        let alpha = crate::dense::cho_solve(&l, &y);
        assert_abs_diff_eq!(estimate.inv_quad, (&y * &alpha).sum(), epsilon = 1e-8);

        let f = |th: &Vec<f64>| -> f64 {
            let k = se_operator(&Array1::from(th.clone()), n).evaluate().unwrap();
            let l = cholesky(&k).unwrap();
            (&y * &crate::dense::cho_solve(&l, &y)).sum()
        };
        let fd = theta.to_vec().central_diff(&f);
        for i in 0..2 {
            assert_abs_diff_eq!(
                estimate.inv_quad_gradient[i],
                fd[i],
                epsilon = 1e-3 * fd[i].abs().max(1.)
            );
        }
    }
}
