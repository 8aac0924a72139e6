//! Kernel operators of a SKI GP model.
//!
//! [SkiKernel] approximates the covariance of the training points as
//! `W K_grid Wᵀ` where `K_grid = sigma2 ⊗_j T_j` is a Kronecker product of
//! symmetric Toeplitz matrices (stationary separable correlation on an evenly
//! spaced grid) and `W` the sparse cubic interpolation of the points on the
//! grid. [ExactKernel] evaluates kernel entries on demand and serves as the
//! reference for small problems.

use crate::correlation_models::CorrelationModel;
use crate::errors::{GpError, Result};
use crate::grid::InducingGrid;
use crate::hyperparameters::Hyperparameters;
use crate::love::{CrossCovariance, HyperFingerprint, PredictiveCache};
use crate::{GP_DEFAULT_JITTER, SKI_DEFAULT_GRID_PADDING, SKI_DEFAULT_GRID_SIZE};

use linfa::Float;
use ndarray::{Array1, Array2, ArrayBase, ArrayView1, Data, Ix2, Zip};
use skigp_linops::{CgParams, LazyMatrix, Scalar, SparseInterpolation, StructureTags};
use std::sync::Arc;

/// Stationary separable correlation between two points
fn kernel_entry<F, S, Corr>(corr: &Corr, a: ArrayView1<F>, b: ArrayView1<F>, theta: &Array1<S>) -> S
where
    F: Float,
    S: Scalar<Real = F>,
    Corr: CorrelationModel<F>,
{
    Zip::from(&a)
        .and(&b)
        .and(theta)
        .fold(S::one(), |acc, &ai, &bi, &t| {
            acc * corr.value_1d(t.scale(num_traits::Float::abs(ai - bi)))
        })
}

fn check_theta<S: Scalar>(theta: &Array1<S>, nx: usize) -> Result<()> {
    if theta.len() != nx {
        return Err(GpError::InvalidValueError(format!(
            "theta should have {nx} components (input dimension), got {}",
            theta.len()
        )));
    }
    Ok(())
}

/// Builder of [SkiKernel]: correlation model and inducing grid configuration
#[derive(Clone, Debug)]
pub struct SkiKernelBuilder<F: Float, Corr: CorrelationModel<F>> {
    corr: Corr,
    grid_size: usize,
    grid_bounds: Option<Array2<F>>,
    grid_padding: F,
    jitter: F,
}

impl<F: Float, Corr: CorrelationModel<F>> SkiKernelBuilder<F, Corr> {
    /// Builder with default grid size, padding and jitter
    pub fn new(corr: Corr) -> Self {
        SkiKernelBuilder {
            corr,
            grid_size: SKI_DEFAULT_GRID_SIZE,
            grid_bounds: None,
            grid_padding: F::cast(SKI_DEFAULT_GRID_PADDING),
            jitter: F::cast(GP_DEFAULT_JITTER),
        }
    }

    /// Set the number of grid points per dimension
    pub fn grid_size(mut self, grid_size: usize) -> Self {
        self.grid_size = grid_size;
        self
    }

    /// Set explicit grid bounds as a (nx, 2) array of `[lo, hi]` rows
    pub fn grid_bounds(mut self, bounds: Option<Array2<F>>) -> Self {
        self.grid_bounds = bounds;
        self
    }

    /// Set the padding fraction of the data range added on each side of the grid
    pub fn grid_padding(mut self, padding: F) -> Self {
        self.grid_padding = padding;
        self
    }

    /// Set the diagonal jitter, relative to the process variance
    pub fn jitter(mut self, jitter: F) -> Self {
        self.jitter = jitter;
        self
    }

    /// Derives the grid from training inputs `x` (n, nx) and interpolates them
    pub fn build(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<SkiKernel<F, Corr>> {
        let grid =
            InducingGrid::from_data(x, self.grid_size, self.grid_bounds.as_ref(), self.grid_padding)?;
        let interpolation = Arc::new(grid.interpolation(x)?);
        Ok(SkiKernel {
            corr: self.corr,
            grid,
            interpolation,
            jitter: self.jitter,
        })
    }
}

/// Interpolated kernel of a set of training points
#[derive(Clone, Debug)]
pub struct SkiKernel<F: Float, Corr: CorrelationModel<F>> {
    corr: Corr,
    grid: InducingGrid<F>,
    interpolation: Arc<SparseInterpolation<F>>,
    jitter: F,
}

impl<F: Float, Corr: CorrelationModel<F>> SkiKernel<F, Corr> {
    /// Inducing grid
    pub fn grid(&self) -> &InducingGrid<F> {
        &self.grid
    }

    /// Interpolation of the training points on the grid
    pub fn interpolation(&self) -> &Arc<SparseInterpolation<F>> {
        &self.interpolation
    }

    /// `sigma2 ⊗_j T_j(theta_j)` on the grid
    pub fn grid_covariance<S: Scalar<Real = F>>(
        &self,
        theta: &Array1<S>,
        sigma2: S,
    ) -> Result<LazyMatrix<S>> {
        check_theta(theta, self.grid.dim())?;
        let factors = theta
            .iter()
            .zip(self.grid.spacing().iter())
            .map(|(&t, &h)| {
                let column = Array1::from_shape_fn(self.grid.size(), |k| {
                    self.corr.value_1d(t.scale(F::cast(k) * h))
                });
                LazyMatrix::toeplitz(column).with_tags(StructureTags::PSD)
            })
            .collect();
        Ok(LazyMatrix::kronecker(factors)?.scaled(sigma2))
    }

    /// Training covariance `W K_grid Wᵀ + sigma2 (noise + jitter) I`
    pub fn covariance<S: Scalar<Real = F>>(
        &self,
        hyper: &Hyperparameters<S>,
    ) -> Result<LazyMatrix<S>> {
        let grid_cov = self.grid_covariance(&hyper.theta, hyper.sigma2)?;
        let interpolated = LazyMatrix::interpolated(
            self.interpolation.clone(),
            grid_cov,
            self.interpolation.clone(),
        )?;
        let diag = hyper.sigma2 * (hyper.noise + S::from_real(self.jitter));
        Ok(interpolated.add_constant_diag(diag)?)
    }

    /// Cross-covariance between `x` (n*, nx) and the training points
    pub fn cross_covariance(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        hyper: &Hyperparameters<F>,
    ) -> Result<CrossCovariance<F>> {
        check_theta(&hyper.theta, self.grid.dim())?;
        Ok(CrossCovariance::Interpolated {
            weights: self.grid.interpolation(x)?,
            prior_variance: Array1::from_elem(x.nrows(), hyper.sigma2),
        })
    }

    /// Interpolated prior covariance `W* K_grid W*ᵀ` of `x` (n*, nx), jitter included
    pub fn prior_covariance(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        hyper: &Hyperparameters<F>,
    ) -> Result<LazyMatrix<F>> {
        let weights = Arc::new(self.grid.interpolation(x)?);
        let grid_cov = self.grid_covariance(&hyper.theta, hyper.sigma2)?;
        let prior = LazyMatrix::interpolated(weights.clone(), grid_cov, weights)?;
        Ok(prior.add_constant_diag(hyper.sigma2 * self.jitter)?)
    }
}

/// Kernel evaluated entry by entry on the training points
#[derive(Clone, Debug)]
pub struct ExactKernel<F: Float, Corr: CorrelationModel<F>> {
    corr: Corr,
    x: Arc<Array2<F>>,
    jitter: F,
}

impl<F: Float, Corr: CorrelationModel<F>> ExactKernel<F, Corr> {
    /// Kernel of the training points `x` (n, nx)
    pub fn new(corr: Corr, x: &ArrayBase<impl Data<Elem = F>, Ix2>, jitter: F) -> Self {
        ExactKernel {
            corr,
            x: Arc::new(x.to_owned()),
            jitter,
        }
    }

    /// `sigma2 C(x_a, x_b)` as a lazy (na, nb) matrix
    fn kernel<S: Scalar<Real = F>>(
        &self,
        xa: Arc<Array2<F>>,
        xb: Arc<Array2<F>>,
        hyper: &Hyperparameters<S>,
        tags: StructureTags,
    ) -> LazyMatrix<S> {
        let corr = self.corr;
        let theta = hyper.theta.clone();
        let sigma2 = hyper.sigma2;
        LazyMatrix::from_fn(xa.nrows(), xb.nrows(), tags, move |i, j| {
            sigma2 * kernel_entry(&corr, xa.row(i), xb.row(j), &theta)
        })
    }

    /// Training covariance `sigma2 (C + (noise + jitter) I)`
    pub fn covariance<S: Scalar<Real = F>>(
        &self,
        hyper: &Hyperparameters<S>,
    ) -> Result<LazyMatrix<S>> {
        check_theta(&hyper.theta, self.x.ncols())?;
        let k = self.kernel(self.x.clone(), self.x.clone(), hyper, StructureTags::PSD);
        let diag = hyper.sigma2 * (hyper.noise + S::from_real(self.jitter));
        Ok(k.add_constant_diag(diag)?)
    }

    /// Cross-covariance between `x` (n*, nx) and the training points
    pub fn cross_covariance(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        hyper: &Hyperparameters<F>,
    ) -> Result<CrossCovariance<F>> {
        check_theta(&hyper.theta, self.x.ncols())?;
        let xnew = Arc::new(x.to_owned());
        Ok(CrossCovariance::Lazy {
            matrix: self.kernel(xnew, self.x.clone(), hyper, StructureTags::GENERAL),
            prior_variance: Array1::from_elem(x.nrows(), hyper.sigma2),
        })
    }

    /// Prior covariance of `x` (n*, nx), jitter included
    pub fn prior_covariance(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        hyper: &Hyperparameters<F>,
    ) -> Result<LazyMatrix<F>> {
        check_theta(&hyper.theta, self.x.ncols())?;
        let xnew = Arc::new(x.to_owned());
        let k = self.kernel(xnew.clone(), xnew, hyper, StructureTags::PSD);
        Ok(k.add_constant_diag(hyper.sigma2 * self.jitter)?)
    }
}

/// Covariance operator of a model, either interpolated or exact
#[derive(Clone, Debug)]
pub enum CovarianceKernel<F: Float, Corr: CorrelationModel<F>> {
    /// Structured kernel interpolation
    Ski(SkiKernel<F, Corr>),
    /// Entry-wise evaluation
    Exact(ExactKernel<F, Corr>),
}

impl<F: Float, Corr: CorrelationModel<F>> CovarianceKernel<F, Corr> {
    /// Training covariance for given (possibly dual) hyperparameters
    pub fn covariance<S: Scalar<Real = F>>(
        &self,
        hyper: &Hyperparameters<S>,
    ) -> Result<LazyMatrix<S>> {
        match self {
            CovarianceKernel::Ski(kernel) => kernel.covariance(hyper),
            CovarianceKernel::Exact(kernel) => kernel.covariance(hyper),
        }
    }

    /// Cross-covariance between `x` and the training points
    pub fn cross_covariance(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        hyper: &Hyperparameters<F>,
    ) -> Result<CrossCovariance<F>> {
        match self {
            CovarianceKernel::Ski(kernel) => kernel.cross_covariance(x, hyper),
            CovarianceKernel::Exact(kernel) => kernel.cross_covariance(x, hyper),
        }
    }

    /// Prior covariance of `x` consistent with [CovarianceKernel::cross_covariance]
    pub fn prior_covariance(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        hyper: &Hyperparameters<F>,
    ) -> Result<LazyMatrix<F>> {
        match self {
            CovarianceKernel::Ski(kernel) => kernel.prior_covariance(x, hyper),
            CovarianceKernel::Exact(kernel) => kernel.prior_covariance(x, hyper),
        }
    }

    /// Builds the LOVE cache of the training outputs `y` (n,)
    pub fn predictive_cache(
        &self,
        fingerprint: HyperFingerprint,
        hyper: &Hyperparameters<F>,
        y: &Array1<F>,
        rank: usize,
        cg_params: &CgParams,
        seed: u64,
    ) -> Result<PredictiveCache<F>> {
        let train_cov = self.covariance(hyper)?;
        match self {
            CovarianceKernel::Ski(kernel) => {
                let grid_cov = kernel.grid_covariance(&hyper.theta, hyper.sigma2)?;
                PredictiveCache::build_interpolated(
                    fingerprint,
                    &train_cov,
                    y,
                    kernel.interpolation(),
                    &grid_cov,
                    rank,
                    cg_params,
                    seed,
                )
            }
            CovarianceKernel::Exact(_) => {
                PredictiveCache::build(fingerprint, &train_cov, y, rank, cg_params, seed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation_models::SquaredExponentialCorr;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array, Axis};
    use ndarray_rand::rand::SeedableRng;
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;
    use rand_xoshiro::Xoshiro256Plus;
    use skigp_linops::Dual;

    fn hyper(theta: Array1<f64>, noise: f64) -> Hyperparameters<f64> {
        Hyperparameters::new(theta, 1., noise).unwrap()
    }

    // Largest error of K e_j over the canonical basis, noise free
    fn ski_error(grid_size: usize) -> f64 {
        let x = Array::linspace(0., 1., 15).insert_axis(Axis(1));
        let h = hyper(array![5.], 0.);
        let ski = SkiKernelBuilder::new(SquaredExponentialCorr::default())
            .grid_size(grid_size)
            .grid_bounds(Some(array![[0., 1.]]))
            .jitter(0.)
            .build(&x)
            .unwrap();
        let exact = ExactKernel::new(SquaredExponentialCorr::default(), &x, 0.);
        let eye = Array2::<f64>::eye(15);
        let approx = ski.covariance(&h).unwrap().matmul(&eye).unwrap();
        assert_eq!(approx.dim(), (15, 15));
        assert!(approx.iter().all(|v| v.is_finite()));
        let dense = exact.covariance(&h).unwrap().matmul(&eye).unwrap();
        (&approx - &dense).mapv(f64::abs).fold(0., |a: f64, &b| a.max(b))
    }

    #[test]
    fn test_ski_error_shrinks_with_grid_size() {
        let errors: Vec<f64> = [5, 10, 20, 40].iter().map(|&m| ski_error(m)).collect();
        assert!(errors.windows(2).all(|e| e[1] < e[0]), "{errors:?}");
        assert!(errors[2] < 1e-2, "{errors:?}");
        assert!(ski_error(100) < 1e-4);
    }

    #[test]
    fn test_five_point_grid() {
        // too coarse for a length scale of 0.2 but still a sound approximation
        let err = ski_error(5);
        assert!(err < 0.5, "{err}");
    }

    #[test]
    fn test_ski_2d_against_exact() {
        let mut rng = Xoshiro256Plus::seed_from_u64(42);
        let x = Array::random_using((40, 2), Uniform::new(0., 1.), &mut rng);
        let h = hyper(array![2., 3.], 0.1);
        let ski = SkiKernelBuilder::new(SquaredExponentialCorr::default())
            .grid_size(60)
            .build(&x)
            .unwrap();
        assert_eq!(ski.grid().n_points(), 3600);
        let exact = ExactKernel::new(SquaredExponentialCorr::default(), &x, GP_DEFAULT_JITTER);
        let v = Array::random_using((40, 2), Uniform::new(-1., 1.), &mut rng);
        let approx = ski.covariance(&h).unwrap().matmul(&v).unwrap();
        let dense = exact.covariance(&h).unwrap().matmul(&v).unwrap();
        assert_abs_diff_eq!(approx, dense, epsilon = 1e-3);
    }

    #[test]
    fn test_covariance_tags_and_diagonal() {
        let x = Array::linspace(0., 1., 10).insert_axis(Axis(1));
        let h = Hyperparameters::new(array![3.], 2., 0.1).unwrap();
        let ski = SkiKernelBuilder::new(SquaredExponentialCorr::default())
            .grid_size(50)
            .build(&x)
            .unwrap();
        let cov = ski.covariance(&h).unwrap();
        assert!(cov.tags().symmetric);
        assert!(cov.tags().positive_definite);
        let expected = 2. * (1. + 0.1 + GP_DEFAULT_JITTER);
        assert_abs_diff_eq!(cov.diagonal().unwrap(), Array1::from_elem(10, expected), epsilon = 1e-4);
    }

    #[test]
    fn test_dual_covariance_derivative() {
        let x = Array::linspace(0., 1., 8).insert_axis(Axis(1));
        let kernel = CovarianceKernel::Exact(ExactKernel::new(
            SquaredExponentialCorr::default(),
            &x,
            0.,
        ));
        let theta = 4.;
        let dual = Hyperparameters {
            theta: array![Dual::variable(theta)],
            sigma2: Dual::constant(1.),
            noise: Dual::constant(0.),
        };
        let v = Array2::<f64>::ones((8, 1));
        let dv = kernel.covariance(&dual).unwrap().matmul(&v.mapv(Dual::constant)).unwrap();
        let e = 1e-6;
        let up = kernel.covariance(&hyper(array![theta + e], 0.)).unwrap().matmul(&v).unwrap();
        let down = kernel.covariance(&hyper(array![theta - e], 0.)).unwrap().matmul(&v).unwrap();
        let fd = (up - down) / (2. * e);
        assert_abs_diff_eq!(dv.mapv(|d| d.eps), fd, epsilon = 1e-6);
    }

    #[test]
    fn test_wrong_theta_dimension() {
        let x = Array::linspace(0., 1., 8).insert_axis(Axis(1));
        let ski = SkiKernelBuilder::new(SquaredExponentialCorr::default())
            .grid_size(10)
            .build(&x)
            .unwrap();
        assert!(matches!(
            ski.covariance(&hyper(array![1., 2.], 0.1)),
            Err(GpError::InvalidValueError(_))
        ));
    }
}
