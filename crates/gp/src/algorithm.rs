use crate::correlation_models::CorrelationModel;
use crate::errors::{GpError, Result};
use crate::hyperparameters::Hyperparameters;
use crate::love::{CrossCovariance, HyperFingerprint, PredictiveCache};
use crate::optimization::{adam_minimize, optimize_params, AdamParams, CobylaParams};
use crate::parameters::{
    HyperOptimizer, KernelApproximation, NoiseTuning, SkiGpParams, SkiGpValidParams, ThetaTuning,
};
use crate::ski::{CovarianceKernel, ExactKernel, SkiKernelBuilder};
use crate::utils::NormalizedData;

use linfa::prelude::{DatasetBase, Fit, Float, PredictInplace};
use log::{debug, info, warn};
use ndarray::{Array1, Array2, ArrayBase, Axis, Data, Ix1, Ix2, Zip};
use ndarray_rand::rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256Plus;
use skigp_linops::{
    sample_mvn, slq, CgParams, Dual, InvQuadLogDet, LazyMatrix, LinopsError, RootDecomposition,
    Scalar, SlqParams,
};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Default number of inducing grid points per input dimension
pub const SKI_DEFAULT_GRID_SIZE: usize = 100;
/// Default grid padding as a fraction of the data range
pub const SKI_DEFAULT_GRID_PADDING: f64 = 0.1;
/// Default rank of the predictive variance cache
pub const LOVE_DEFAULT_CACHE_RANK: usize = 50;
/// Default jitter added to the covariance diagonal, relative to the process variance
pub const GP_DEFAULT_JITTER: f64 = 1e-6;
/// Minimum of function evaluations for COBYLA optimizer
pub const GP_COBYLA_MIN_EVAL: usize = 25;
/// Maximum of function evaluations for COBYLA optimizer
pub const GP_COBYLA_MAX_EVAL: usize = 1000;

/// A scalable Gaussian process model.
///
/// The covariance of the training outputs is `sigma2 * (C(theta) + noise * I)`,
/// `C` being either interpolated on an inducing grid ([KernelApproximation::Ski])
/// or evaluated entry by entry ([KernelApproximation::Exact]). Linear solves use
/// preconditioned conjugate gradients and log determinants stochastic Lanczos
/// quadrature, so the covariance matrix is never formed.
///
/// Hyperparameters live in the normalized training space: `theta` applies to
/// inputs centered and scaled by their standard deviation and `sigma2` to the
/// normalized outputs.
///
/// Predictions go through a [PredictiveCache] built after training and rebuilt
/// whenever the hyperparameters change.
#[derive(Clone, Debug)]
pub struct SkiGaussianProcess<F: Float, Corr: CorrelationModel<F>> {
    /// Current hyperparameters
    hyperparameters: Hyperparameters<F>,
    /// Number of hyperparameter changes since training
    version: u64,
    /// Marginal log likelihood at the current hyperparameters
    likelihood: F,
    /// Covariance operator builder over the training inputs
    kernel: CovarianceKernel<F, Corr>,
    /// Normalized training input data
    xt_norm: NormalizedData<F>,
    /// Normalized training output data
    yt_norm: NormalizedData<F>,
    /// Parameters used to fit this model
    params: SkiGpValidParams<F, Corr>,
    /// Predictive cache of the current hyperparameters
    cache: Arc<PredictiveCache<F>>,
    /// Low-rank root of the training covariance, from the Lanczos run of the
    /// likelihood log determinant
    training_root: Arc<RootDecomposition<F>>,
}

impl<F: Float, Corr: CorrelationModel<F>> SkiGaussianProcess<F, Corr> {
    /// SKI GP parameters constructor
    pub fn params<NewCorr: CorrelationModel<F>>(corr: NewCorr) -> SkiGpParams<F, NewCorr> {
        SkiGpParams::new(corr)
    }

    /// Current hyperparameters, in the normalized training space
    pub fn hyperparameters(&self) -> &Hyperparameters<F> {
        &self.hyperparameters
    }

    /// Optimized inverse length scales
    pub fn theta(&self) -> &Array1<F> {
        &self.hyperparameters.theta
    }

    /// Process variance in output units
    pub fn variance(&self) -> F {
        self.hyperparameters.sigma2 * self.yt_norm.std[0] * self.yt_norm.std[0]
    }

    /// Noise variance relative to the process variance
    pub fn noise(&self) -> F {
        self.hyperparameters.noise
    }

    /// Marginal log likelihood of the normalized training outputs
    pub fn likelihood(&self) -> F {
        self.likelihood
    }

    /// Parameters used to fit the model
    pub fn params_used(&self) -> &SkiGpValidParams<F, Corr> {
        &self.params
    }

    /// Input and output dimensions
    pub fn dims(&self) -> (usize, usize) {
        (self.xt_norm.ncols(), self.yt_norm.ncols())
    }

    /// Identity of the current hyperparameters
    pub fn fingerprint(&self) -> HyperFingerprint {
        HyperFingerprint::new(self.version, &self.hyperparameters)
    }

    /// Covariance operator of the normalized training outputs
    pub fn covariance(&self) -> Result<LazyMatrix<F>> {
        self.kernel.covariance(&self.hyperparameters)
    }

    fn y_column(&self) -> Array2<F> {
        self.yt_norm.data.to_owned()
    }

    /// Marginal log likelihood `-1/2 (yᵀ K⁻¹ y + log det K + n log 2π)` of the
    /// normalized training outputs at the current hyperparameters
    pub fn marginal_log_likelihood(&self) -> Result<F> {
        let y = self.y_column();
        let terms = likelihood_terms(&self.kernel, &self.hyperparameters, &y, &self.params)?;
        Ok(gaussian_log_likelihood(terms.inv_quad, terms.log_det, y.nrows()))
    }

    /// Marginal log likelihood and its gradient with respect to
    /// `(theta_1, ..., theta_nx, sigma2, noise)`.
    ///
    /// Derivatives are propagated through the iterative solvers with dual
    /// numbers, the probes being fixed by the model seed.
    pub fn marginal_log_likelihood_and_grad(&self) -> Result<(F, Array1<F>)> {
        let nx = self.xt_norm.ncols();
        let h = &self.hyperparameters;
        let mut point = Array1::zeros(nx + 2);
        point.slice_mut(ndarray::s![..nx]).assign(&h.theta);
        point[nx] = h.sigma2;
        point[nx + 1] = h.noise;
        let build = |p: &Array1<Dual<F>>| {
            let hyper = Hyperparameters {
                theta: p.slice(ndarray::s![..nx]).to_owned(),
                sigma2: p[nx],
                noise: p[nx + 1],
            };
            self.kernel.covariance(&hyper).map_err(into_linops)
        };
        let y = self.y_column();
        let estimate = slq::inv_quad_log_det_and_grad(
            build,
            &point,
            &y,
            self.params.cg_params(),
            self.params.slq_params(),
        )?;
        if !estimate.converged {
            warn!("Likelihood gradient computed from unconverged CG solves");
        }
        let value = gaussian_log_likelihood(estimate.inv_quad, estimate.log_det.value, y.nrows());
        let gradient =
            (&estimate.inv_quad_gradient + &estimate.log_det.gradient).mapv(|g| g * F::cast(-0.5));
        Ok((value, gradient))
    }

    /// Changes the hyperparameters and rebuilds the predictive cache.
    ///
    /// The new cache is built before anything is replaced, so on error the
    /// model is left unchanged. Caches obtained earlier become stale.
    pub fn set_hyperparameters(&mut self, hyperparameters: Hyperparameters<F>) -> Result<()> {
        let nx = self.xt_norm.ncols();
        if hyperparameters.theta.len() != nx {
            return Err(GpError::InvalidValueError(format!(
                "theta should have {nx} components, got {}",
                hyperparameters.theta.len()
            )));
        }
        let hyperparameters = Hyperparameters::new(
            hyperparameters.theta,
            hyperparameters.sigma2,
            hyperparameters.noise,
        )?;
        let version = self.version + 1;
        let fingerprint = HyperFingerprint::new(version, &hyperparameters);
        let cache = self.kernel.predictive_cache(
            fingerprint,
            &hyperparameters,
            &self.yt_norm.data.column(0).to_owned(),
            self.params.cache_rank(),
            self.params.cg_params(),
            self.params.seed(),
        )?;
        let y = self.y_column();
        let terms = likelihood_terms(&self.kernel, &hyperparameters, &y, &self.params)?;
        let likelihood = gaussian_log_likelihood(terms.inv_quad, terms.log_det, y.nrows());
        let training_root = training_root(&terms)?;
        debug!("Hyperparameters changed to {hyperparameters} ({fingerprint})");
        self.hyperparameters = hyperparameters;
        self.version = version;
        self.likelihood = likelihood;
        self.cache = Arc::new(cache);
        self.training_root = Arc::new(training_root);
        Ok(())
    }

    /// Builds a predictive cache of the given rank for the current hyperparameters.
    /// The model keeps using its own cache.
    pub fn build_predictive_cache(&self, rank: usize) -> Result<Arc<PredictiveCache<F>>> {
        if rank == 0 {
            return Err(GpError::InvalidValueError(
                "predictive cache rank should be at least 1".to_string(),
            ));
        }
        let cache = self.kernel.predictive_cache(
            self.fingerprint(),
            &self.hyperparameters,
            &self.yt_norm.data.column(0).to_owned(),
            rank,
            self.params.cg_params(),
            self.params.seed(),
        )?;
        if !cache.converged() {
            warn!("Predictive cache built from an unconverged CG solve");
        }
        Ok(Arc::new(cache))
    }

    /// Replaces the model predictive cache with one of the given rank
    pub fn refresh_predictive_cache(&mut self, rank: usize) -> Result<()> {
        self.cache = self.build_predictive_cache(rank)?;
        Ok(())
    }

    /// Predictive cache used by the model
    pub fn predictive_cache(&self) -> Arc<PredictiveCache<F>> {
        self.cache.clone()
    }

    fn check_dim(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<()> {
        if x.ncols() != self.xt_norm.ncols() {
            return Err(LinopsError::ShapeError {
                operation: "gp_query",
                expected: (x.nrows(), self.xt_norm.ncols()),
                actual: x.dim(),
            }
            .into());
        }
        Ok(())
    }

    /// Cross-covariance between `x` (n*, nx) given in input units and the
    /// training points
    pub fn cross_covariance(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<CrossCovariance<F>> {
        self.check_dim(x)?;
        let xnorm = self.xt_norm.apply(x);
        self.kernel.cross_covariance(&xnorm, &self.hyperparameters)
    }

    /// Predictive variances in output units from `cache`.
    ///
    /// Fails with [GpError::StaleCacheError] when the cache was built for other
    /// hyperparameters.
    pub fn query_variance(
        &self,
        cache: &PredictiveCache<F>,
        cross: &CrossCovariance<F>,
    ) -> Result<Array1<F>> {
        let ystd = self.yt_norm.std[0];
        Ok(cache.variance(self.fingerprint(), cross)? * (ystd * ystd))
    }

    /// Predict output values at n given `x` points of nx components specified as a (n, nx) matrix.
    /// Returns n scalar output values as (n,) column vector.
    pub fn predict(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array1<F>> {
        let cross = self.cross_covariance(x)?;
        let mean = self.cache.mean(self.fingerprint(), &cross)?;
        Ok(mean * self.yt_norm.std[0] + self.yt_norm.mean[0])
    }

    /// Predict variance values at n given `x` points of nx components specified as a (n, nx) matrix.
    /// Returns n variance values as (n,) column vector.
    pub fn predict_var(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array1<F>> {
        let cross = self.cross_covariance(x)?;
        self.query_variance(&self.cache, &cross)
    }

    /// Predict both output values and variances at n given `x` points of nx components
    pub fn predict_valvar(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<(Array1<F>, Array1<F>)> {
        let cross = self.cross_covariance(x)?;
        let fingerprint = self.fingerprint();
        let ystd = self.yt_norm.std[0];
        let mean = self.cache.mean(fingerprint, &cross)? * ystd + self.yt_norm.mean[0];
        let variance = self.cache.variance(fingerprint, &cross)? * (ystd * ystd);
        Ok((mean, variance))
    }

    /// Sample the posterior at `x` (n, nx) with a root of the posterior
    /// covariance from `lanczos_steps` Lanczos steps.
    /// Returns n_samples trajectories as the columns of a (n, n_samples) matrix.
    ///
    /// The draws come from a generator seeded with the model seed, so they
    /// are the same from call to call. See [SkiGaussianProcess::sample_posterior_with_rng].
    pub fn sample_posterior(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        lanczos_steps: usize,
        n_samples: usize,
    ) -> Result<Array2<F>> {
        let mut rng = Xoshiro256Plus::seed_from_u64(self.params.seed());
        self.sample_posterior_with_rng(x, lanczos_steps, n_samples, &mut rng)
    }

    /// Same as [SkiGaussianProcess::sample_posterior] drawing from `rng`
    pub fn sample_posterior_with_rng<R: Rng>(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        lanczos_steps: usize,
        n_samples: usize,
        rng: &mut R,
    ) -> Result<Array2<F>> {
        let cross = self.cross_covariance(x)?;
        let fingerprint = self.fingerprint();
        let mean = self.cache.mean(fingerprint, &cross)?;
        let q = self.cache.variance_factor(fingerprint, &cross)?;
        let prior = self
            .kernel
            .prior_covariance(&self.xt_norm.apply(x), &self.hyperparameters)?;
        let posterior = LazyMatrix::sum(vec![prior, LazyMatrix::low_rank(q).scaled(-F::one())])?;
        let samples = sample_mvn(&mean, &posterior, lanczos_steps, n_samples, rng)?;
        Ok(samples * self.yt_norm.std[0] + self.yt_norm.mean[0])
    }

    /// Low-rank root `R Rᵀ ≈ K` of the covariance of the normalized training
    /// outputs, reused from the Lanczos run of the likelihood log determinant.
    /// Its rank is the number of quadrature Lanczos steps.
    pub fn training_root(&self) -> &RootDecomposition<F> {
        &self.training_root
    }

    /// Draws the training outputs from the prior `N(0, K)` with the
    /// [SkiGaussianProcess::training_root] of the covariance.
    /// Returns n_samples draws in output units as the columns of a (nt, n_samples) matrix.
    pub fn sample_training_prior<R: Rng>(&self, n_samples: usize, rng: &mut R) -> Result<Array2<F>> {
        let zeros = Array1::zeros(self.yt_norm.data.nrows());
        let samples = self.training_root.sample(&zeros, n_samples, rng)?;
        Ok(samples * self.yt_norm.std[0] + self.yt_norm.mean[0])
    }
}

impl<F: Float, Corr: CorrelationModel<F>> fmt::Display for SkiGaussianProcess<F, Corr> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "SkiGP(corr={}, approximation={:?}, theta={}, variance={}, noise={}, likelihood={})",
            self.params.corr(),
            self.params.approximation(),
            self.hyperparameters.theta,
            self.variance(),
            self.hyperparameters.noise,
            self.likelihood,
        )
    }
}

impl<F, D, Corr> PredictInplace<ArrayBase<D, Ix2>, Array1<F>> for SkiGaussianProcess<F, Corr>
where
    F: Float,
    D: Data<Elem = F>,
    Corr: CorrelationModel<F>,
{
    fn predict_inplace(&self, x: &ArrayBase<D, Ix2>, y: &mut Array1<F>) {
        assert_eq!(
            x.nrows(),
            y.len(),
            "The number of data points must match the number of output targets."
        );

        let values = self.predict(x).expect("GP Prediction");
        *y = values;
    }

    fn default_target(&self, x: &ArrayBase<D, Ix2>) -> Array1<F> {
        Array1::zeros((x.nrows(),))
    }
}

/// Maps lower level errors raised while building an operator inside a linops routine
fn into_linops(err: GpError) -> LinopsError {
    match err {
        GpError::LinopsError(err) => err,
        err => LinopsError::InvalidValueError(err.to_string()),
    }
}

fn gaussian_log_likelihood<F: Float>(inv_quad: F, log_det: F, n: usize) -> F {
    let n_ln_2pi = F::cast(n) * num_traits::Float::ln(F::cast(2. * std::f64::consts::PI));
    -F::cast(0.5) * (inv_quad + log_det + n_ln_2pi)
}

fn likelihood_terms<F: Float, Corr: CorrelationModel<F>>(
    kernel: &CovarianceKernel<F, Corr>,
    hyper: &Hyperparameters<F>,
    y: &Array2<F>,
    params: &SkiGpValidParams<F, Corr>,
) -> Result<InvQuadLogDet<F>> {
    let op = kernel.covariance(hyper)?;
    let terms = slq::inv_quad_log_det(&op, y, params.cg_params(), params.slq_params())?;
    if !terms.converged {
        warn!("Marginal likelihood computed from an unconverged CG solve");
    }
    Ok(terms)
}

/// Root of the covariance from the first quadrature Lanczos run
fn training_root<F: Float>(terms: &InvQuadLogDet<F>) -> Result<RootDecomposition<F>> {
    match terms.lanczos_runs.first() {
        Some(run) => Ok(RootDecomposition::from_lanczos(run)?),
        None => Err(GpError::LikelihoodComputationError(
            "log determinant estimated without Lanczos run".to_string(),
        )),
    }
}

/// Reduced likelihood of the training outputs with the process variance
/// profiled out, as a function of the log10 of the free hyperparameters:
/// `log10(theta)` unless theta is fixed, then `log10(noise)` unless noise is fixed.
struct ReducedLikelihood<'a, F: Float, Corr: CorrelationModel<F>> {
    kernel: &'a CovarianceKernel<F, Corr>,
    y: Array2<F>,
    nx: usize,
    fixed_theta: Option<Array1<F>>,
    fixed_noise: Option<F>,
    cg_params: &'a CgParams,
    slq_params: &'a SlqParams,
}

impl<F: Float, Corr: CorrelationModel<F>> ReducedLikelihood<'_, F, Corr> {
    fn n_free(&self) -> usize {
        let theta = if self.fixed_theta.is_some() { 0 } else { self.nx };
        let noise = if self.fixed_noise.is_some() { 0 } else { 1 };
        theta + noise
    }

    /// Unit variance hyperparameters of the free variables `params`
    fn hyperparameters<S: Scalar<Real = F>>(&self, params: &Array1<S>) -> Hyperparameters<S> {
        let noise = self.fixed_noise.map(S::from_real);
        match &self.fixed_theta {
            None => Hyperparameters::from_log10(params, self.nx, S::one(), noise),
            Some(theta) => {
                let ln10 = F::cast(std::f64::consts::LN_10);
                Hyperparameters {
                    theta: theta.mapv(S::from_real),
                    sigma2: S::one(),
                    noise: noise.unwrap_or_else(|| params[0].scale(ln10).exp()),
                }
            }
        }
    }

    /// Profiled variance `yᵀ C⁻¹ y / n` and reduced likelihood `-n log(sigma2) - log det C`
    fn profile(&self, inv_quad: F, log_det: F) -> (F, F) {
        let n = F::cast(self.y.nrows());
        let sigma2 = num_traits::Float::max(inv_quad / n, num_traits::Float::min_positive_value());
        (sigma2, -n * num_traits::Float::ln(sigma2) - log_det)
    }

    /// Inverse quadratic form and log determinant of the unit variance covariance
    fn terms(&self, params: &Array1<F>) -> Result<InvQuadLogDet<F>> {
        let op = self.kernel.covariance(&self.hyperparameters(params))?;
        Ok(slq::inv_quad_log_det(&op, &self.y, self.cg_params, self.slq_params)?)
    }

    /// Returns the profiled variance and the reduced likelihood
    fn value(&self, params: &Array1<F>) -> Result<(F, F)> {
        let terms = self.terms(params)?;
        Ok(self.profile(terms.inv_quad, terms.log_det))
    }

    /// Reduced likelihood and its gradient
    fn value_and_grad(&self, params: &Array1<F>) -> Result<(F, Array1<F>)> {
        let build = |p: &Array1<Dual<F>>| {
            self.kernel
                .covariance(&self.hyperparameters(p))
                .map_err(into_linops)
        };
        let estimate = slq::inv_quad_log_det_and_grad(
            build,
            params,
            &self.y,
            self.cg_params,
            self.slq_params,
        )?;
        if !estimate.log_det.differentiable {
            debug!("Reduced likelihood gradient of a clipped log det estimate");
        }
        let (_, value) = self.profile(estimate.inv_quad, estimate.log_det.value);
        let n = F::cast(self.y.nrows());
        let scale = n / num_traits::Float::max(estimate.inv_quad, num_traits::Float::min_positive_value());
        let mut gradient = estimate.log_det.gradient.mapv(|g| -g);
        Zip::from(&mut gradient)
            .and(&estimate.inv_quad_gradient)
            .for_each(|g, &dq| *g = *g - scale * dq);
        Ok((value, gradient))
    }
}

/// Gives `values` of length `nx`, a single value being repeated
fn broadcast<T: Clone>(values: &Array1<T>, nx: usize, what: &str) -> Result<Array1<T>> {
    if values.len() == nx {
        Ok(values.to_owned())
    } else if values.len() == 1 {
        Ok(Array1::from_elem(nx, values[0].clone()))
    } else {
        Err(GpError::InvalidValueError(format!(
            "{what} should have 1 or {nx} components (input dimension), got {}",
            values.len()
        )))
    }
}

impl<F: Float, Corr: CorrelationModel<F>> SkiGpValidParams<F, Corr> {
    fn build_kernel(&self, xtrain: &NormalizedData<F>) -> Result<CovarianceKernel<F, Corr>> {
        match self.approximation() {
            KernelApproximation::Ski => {
                let bounds = match self.grid_bounds() {
                    Some(bounds) => {
                        let nx = xtrain.ncols();
                        if bounds.dim() != (nx, 2) {
                            return Err(LinopsError::ShapeError {
                                operation: "grid_bounds",
                                expected: (nx, 2),
                                actual: bounds.dim(),
                            }
                            .into());
                        }
                        let mut normalized = bounds.to_owned();
                        Zip::from(normalized.rows_mut())
                            .and(&xtrain.mean)
                            .and(&xtrain.std)
                            .for_each(|mut row, &m, &s| row.mapv_inplace(|v| (v - m) / s));
                        Some(normalized)
                    }
                    None => None,
                };
                let kernel = SkiKernelBuilder::new(*self.corr())
                    .grid_size(self.grid_size())
                    .grid_padding(self.grid_padding())
                    .grid_bounds(bounds)
                    .jitter(self.jitter())
                    .build(&xtrain.data)?;
                Ok(CovarianceKernel::Ski(kernel))
            }
            KernelApproximation::Exact => Ok(CovarianceKernel::Exact(ExactKernel::new(
                *self.corr(),
                &xtrain.data,
                self.jitter(),
            ))),
        }
    }
}

impl<F: Float, Corr: CorrelationModel<F>, D: Data<Elem = F>>
    Fit<ArrayBase<D, Ix2>, ArrayBase<D, Ix1>, GpError> for SkiGpValidParams<F, Corr>
{
    type Object = SkiGaussianProcess<F, Corr>;

    /// Fit SKI GP hyperparameters by maximizing the estimated marginal likelihood
    fn fit(
        &self,
        dataset: &DatasetBase<ArrayBase<D, Ix2>, ArrayBase<D, Ix1>>,
    ) -> Result<Self::Object> {
        let x = dataset.records();
        let y = dataset.targets();
        if x.nrows() != y.len() {
            return Err(LinopsError::ShapeError {
                operation: "fit",
                expected: (x.nrows(), 1),
                actual: (y.len(), 1),
            }
            .into());
        }
        if x.nrows() < 2 {
            return Err(GpError::DegenerateInputError(format!(
                "at least 2 training points are required, got {}",
                x.nrows()
            )));
        }
        let now = Instant::now();
        let xtrain = NormalizedData::new(x);
        let ytrain = NormalizedData::new(&y.to_owned().insert_axis(Axis(1)));
        let nx = x.ncols();
        let kernel = self.build_kernel(&xtrain)?;

        let theta0 = broadcast(self.theta_tuning().init(), nx, "theta init")?;
        let fixed_theta = match self.theta_tuning() {
            ThetaTuning::Fixed(_) => Some(theta0.to_owned()),
            ThetaTuning::Full { .. } => None,
        };
        let fixed_noise = match self.noise_tuning() {
            NoiseTuning::Fixed(noise) => Some(*noise),
            NoiseTuning::Full { .. } => None,
        };
        let problem = ReducedLikelihood {
            kernel: &kernel,
            y: ytrain.data.to_owned(),
            nx,
            fixed_theta,
            fixed_noise,
            cg_params: self.cg_params(),
            slq_params: self.slq_params(),
        };

        // Optimization in log10 space of the free hyperparameters
        let mut bounds: Vec<(F, F)> = vec![];
        let mut param0: Vec<F> = vec![];
        if let Some(theta_bounds) = self.theta_tuning().bounds() {
            let theta_bounds = broadcast(theta_bounds, nx, "theta bounds")?;
            Zip::from(&theta0).and(&theta_bounds).for_each(|&t, &(lo, up)| {
                let t = num_traits::Float::min(num_traits::Float::max(t, lo), up);
                param0.push(t.log10());
                bounds.push((lo.log10(), up.log10()));
            });
        }
        if let Some((lo, up)) = self.noise_tuning().bounds() {
            let noise = self.noise_tuning().init();
            let noise = num_traits::Float::min(num_traits::Float::max(noise, lo), up);
            param0.push(noise.log10());
            bounds.push((lo.log10(), up.log10()));
        }
        let param0 = Array1::from(param0);

        let opt_params = if problem.n_free() == 0 {
            param0
        } else {
            match self.optimizer() {
                HyperOptimizer::Cobyla => {
                    let objfn = |p: &[f64], _gradient: Option<&mut [f64]>, _params: &mut ()| -> f64 {
                        let p = p.iter().map(|v| F::cast(*v)).collect::<Array1<F>>();
                        match problem.value(&p) {
                            Ok((_, r)) => -r.to_f64().unwrap_or(f64::NAN),
                            Err(_) => f64::INFINITY,
                        }
                    };
                    let maxeval = (10 * problem.n_free())
                        .max(GP_COBYLA_MIN_EVAL)
                        .min(self.max_eval());
                    let cobyla = CobylaParams {
                        maxeval,
                        ..CobylaParams::default()
                    };
                    let (fmin, popt) = optimize_params(objfn, &param0, &bounds, cobyla);
                    debug!("Cobyla reduced likelihood optimum {}", -fmin);
                    popt.mapv(F::cast)
                }
                HyperOptimizer::Adam {
                    learning_rate,
                    max_iters,
                } => {
                    let objgrad = |p: &Array1<f64>| {
                        let p = p.mapv(F::cast);
                        match problem.value_and_grad(&p) {
                            Ok((r, g)) => {
                                let g = g.mapv(|v| -v.to_f64().unwrap_or(f64::NAN));
                                let r = -r.to_f64().unwrap_or(f64::NAN);
                                if r.is_finite() && g.iter().all(|v| v.is_finite()) {
                                    Some((r, g))
                                } else {
                                    None
                                }
                            }
                            Err(err) => {
                                debug!("Likelihood evaluation failed: {err}");
                                None
                            }
                        }
                    };
                    let bounds = bounds
                        .iter()
                        .map(|(lo, up)| (lo.to_f64().unwrap_or(f64::NAN), up.to_f64().unwrap_or(f64::NAN)))
                        .collect::<Vec<_>>();
                    let (fmin, popt) = adam_minimize(
                        objgrad,
                        &param0.mapv(|v| v.to_f64().unwrap_or(f64::NAN)),
                        &bounds,
                        AdamParams::new(learning_rate, max_iters),
                    );
                    debug!("Adam reduced likelihood optimum {}", -fmin);
                    popt.mapv(F::cast)
                }
            }
        };
        debug!("elapsed optim = {:?}", now.elapsed().as_millis());

        let terms = problem.terms(&opt_params).map_err(|err| {
            GpError::LikelihoodComputationError(format!(
                "likelihood at optimized hyperparameters: {err}"
            ))
        })?;
        let (sigma2, reduced) = problem.profile(terms.inv_quad, terms.log_det);
        let training_root = training_root(&terms)?.scaled(sigma2);
        let unit = problem.hyperparameters(&opt_params);
        let theta = match self.theta_tuning() {
            ThetaTuning::Fixed(_) => theta0,
            ThetaTuning::Full { .. } => unit.theta,
        };
        let hyperparameters = Hyperparameters::new(theta, sigma2, unit.noise)?;
        // with the profiled variance, yᵀ K⁻¹ y = n
        let n = F::cast(x.nrows());
        let likelihood = F::cast(0.5) * reduced
            - F::cast(0.5) * n * (F::one() + num_traits::Float::ln(F::cast(2. * std::f64::consts::PI)));

        let fingerprint = HyperFingerprint::new(0, &hyperparameters);
        let cache = kernel.predictive_cache(
            fingerprint,
            &hyperparameters,
            &ytrain.data.column(0).to_owned(),
            self.cache_rank(),
            self.cg_params(),
            self.seed(),
        )?;
        if !cache.converged() {
            warn!("Predictive cache built from an unconverged CG solve");
        }
        let gp = SkiGaussianProcess {
            hyperparameters,
            version: 0,
            likelihood,
            kernel,
            xt_norm: xtrain,
            yt_norm: ytrain,
            params: self.clone(),
            cache: Arc::new(cache),
            training_root: Arc::new(training_root),
        };
        info!("{gp}");
        debug!("elapsed fit = {:?}", now.elapsed().as_millis());
        Ok(gp)
    }
}
