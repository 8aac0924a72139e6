use crate::correlation_models::CorrelationModel;
use crate::errors::{GpError, Result};
use crate::grid::MIN_GRID_SIZE;
use crate::{
    GP_COBYLA_MAX_EVAL, GP_COBYLA_MIN_EVAL, GP_DEFAULT_JITTER, LOVE_DEFAULT_CACHE_RANK,
    SKI_DEFAULT_GRID_PADDING, SKI_DEFAULT_GRID_SIZE,
};
use linfa::{Float, ParamGuard};

use ndarray::{array, Array1, Array2};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use skigp_linops::{CgParams, SlqParams, DEFAULT_SEED};

/// An enum to represent a n-dim hyper parameter tuning
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum ThetaTuning<F: Float> {
    /// Constant parameter (ie given not estimated)
    Fixed(Array1<F>),
    /// Parameter is optimized between given bounds (lower, upper) starting from the inital guess
    Full {
        /// Initial guess for the parameter
        init: Array1<F>,
        /// Bounds for the parameter array(lower, upper)
        bounds: Array1<(F, F)>,
    },
}

impl<F: Float> Default for ThetaTuning<F> {
    fn default() -> Self {
        ThetaTuning::Full {
            init: array![F::cast(ThetaTuning::<F>::DEFAULT_INIT)],
            bounds: array![(
                F::cast(ThetaTuning::<F>::DEFAULT_BOUNDS.0),
                F::cast(ThetaTuning::<F>::DEFAULT_BOUNDS.1),
            )],
        }
    }
}

impl<F: Float> ThetaTuning<F> {
    /// Default initial theta value
    pub const DEFAULT_INIT: f64 = 1.;
    /// Default bounds for theta values
    pub const DEFAULT_BOUNDS: (f64, f64) = (1e-2, 1e2);

    /// Get initial theta value
    pub fn init(&self) -> &Array1<F> {
        match self {
            ThetaTuning::Full { init, bounds: _ } => init,
            ThetaTuning::Fixed(init) => init,
        }
    }

    /// Get bounds for theta value
    pub fn bounds(&self) -> Option<&Array1<(F, F)>> {
        match self {
            ThetaTuning::Full { init: _, bounds } => Some(bounds),
            ThetaTuning::Fixed(_) => None,
        }
    }
}

/// An enum to represent the tuning of the noise variance (relative to the process variance)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum NoiseTuning<F: Float> {
    /// Constant noise
    Fixed(F),
    /// Noise optimized between given bounds starting from the initial guess
    Full {
        /// Initial guess
        init: F,
        /// Bounds (lower, upper)
        bounds: (F, F),
    },
}

impl<F: Float> Default for NoiseTuning<F> {
    fn default() -> Self {
        NoiseTuning::Full {
            init: F::cast(NoiseTuning::<F>::DEFAULT_INIT),
            bounds: (
                F::cast(NoiseTuning::<F>::DEFAULT_BOUNDS.0),
                F::cast(NoiseTuning::<F>::DEFAULT_BOUNDS.1),
            ),
        }
    }
}

impl<F: Float> NoiseTuning<F> {
    /// Default initial noise value
    pub const DEFAULT_INIT: f64 = 1e-2;
    /// Default bounds for noise values
    pub const DEFAULT_BOUNDS: (f64, f64) = (1e-6, 1.);

    /// Get initial noise value
    pub fn init(&self) -> F {
        match self {
            NoiseTuning::Full { init, bounds: _ } => *init,
            NoiseTuning::Fixed(init) => *init,
        }
    }

    /// Get bounds for noise value
    pub fn bounds(&self) -> Option<(F, F)> {
        match self {
            NoiseTuning::Full { init: _, bounds } => Some(*bounds),
            NoiseTuning::Fixed(_) => None,
        }
    }
}

/// Covariance representation used for training and prediction
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum KernelApproximation {
    /// Structured kernel interpolation on an inducing grid
    #[default]
    Ski,
    /// Kernel entries evaluated on demand, for small training sets
    Exact,
}

/// Hyperparameter optimizer of the marginal likelihood
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum HyperOptimizer {
    /// Derivative-free COBYLA on the likelihood estimate
    #[default]
    Cobyla,
    /// Adam ascent using the likelihood gradient
    Adam {
        /// Step size in log10 hyperparameter space
        learning_rate: f64,
        /// Number of iterations
        max_iters: usize,
    },
}

/// A set of validated SKI GP parameters.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(
        serialize = "F: Serialize, Corr: Serialize",
        deserialize = "F: Deserialize<'de>, Corr: Deserialize<'de>"
    ))
)]
pub struct SkiGpValidParams<F: Float, Corr: CorrelationModel<F>> {
    /// Parameter tuning hint of the autocorrelation model
    pub(crate) theta_tuning: ThetaTuning<F>,
    /// Noise variance tuning, relative to the process variance
    pub(crate) noise_tuning: NoiseTuning<F>,
    /// Correlation model representing the spatial correlation between errors at e(x) and e(x')
    pub(crate) corr: Corr,
    /// Covariance representation
    pub(crate) approximation: KernelApproximation,
    /// Number of inducing grid points per dimension
    pub(crate) grid_size: usize,
    /// Grid padding as a fraction of the data range
    pub(crate) grid_padding: F,
    /// Explicit grid bounds (nx, 2) in input units
    pub(crate) grid_bounds: Option<Array2<F>>,
    /// Linear solves settings
    pub(crate) cg_params: CgParams,
    /// Log determinant estimation settings
    pub(crate) slq_params: SlqParams,
    /// Rank of the predictive variance cache
    pub(crate) cache_rank: usize,
    /// Parameter to improve numerical stability
    pub(crate) jitter: F,
    /// Seed of every random draw (probes, Lanczos starts, samples)
    pub(crate) seed: u64,
    /// Marginal likelihood optimizer
    pub(crate) optimizer: HyperOptimizer,
    /// Max number of internal likelihood evaluation during optimization
    pub(crate) max_eval: usize,
}

impl<F: Float, Corr: CorrelationModel<F>> Default for SkiGpValidParams<F, Corr> {
    fn default() -> SkiGpValidParams<F, Corr> {
        SkiGpValidParams {
            theta_tuning: ThetaTuning::default(),
            noise_tuning: NoiseTuning::default(),
            corr: Corr::default(),
            approximation: KernelApproximation::default(),
            grid_size: SKI_DEFAULT_GRID_SIZE,
            grid_padding: F::cast(SKI_DEFAULT_GRID_PADDING),
            grid_bounds: None,
            cg_params: CgParams::default(),
            slq_params: SlqParams::default(),
            cache_rank: LOVE_DEFAULT_CACHE_RANK,
            jitter: F::cast(GP_DEFAULT_JITTER),
            seed: DEFAULT_SEED,
            optimizer: HyperOptimizer::default(),
            max_eval: GP_COBYLA_MAX_EVAL,
        }
    }
}

impl<F: Float, Corr: CorrelationModel<F>> SkiGpValidParams<F, Corr> {
    /// Get correlation corr k(x, x')
    pub fn corr(&self) -> &Corr {
        &self.corr
    }

    /// Get starting theta value for optimization
    pub fn theta_tuning(&self) -> &ThetaTuning<F> {
        &self.theta_tuning
    }

    /// Get noise tuning
    pub fn noise_tuning(&self) -> &NoiseTuning<F> {
        &self.noise_tuning
    }

    /// Get covariance representation
    pub fn approximation(&self) -> KernelApproximation {
        self.approximation
    }

    /// Get the number of grid points per dimension
    pub fn grid_size(&self) -> usize {
        self.grid_size
    }

    /// Get the grid padding fraction
    pub fn grid_padding(&self) -> F {
        self.grid_padding
    }

    /// Get explicit grid bounds
    pub fn grid_bounds(&self) -> Option<&Array2<F>> {
        self.grid_bounds.as_ref()
    }

    /// Get PCG settings
    pub fn cg_params(&self) -> &CgParams {
        &self.cg_params
    }

    /// Get SLQ settings
    pub fn slq_params(&self) -> &SlqParams {
        &self.slq_params
    }

    /// Get predictive cache rank
    pub fn cache_rank(&self) -> usize {
        self.cache_rank
    }

    /// Get jitter
    pub fn jitter(&self) -> F {
        self.jitter
    }

    /// Get seed
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Get the hyperparameter optimizer
    pub fn optimizer(&self) -> HyperOptimizer {
        self.optimizer
    }

    /// Get the max number of internal likelihood evaluations during one optimization
    pub fn max_eval(&self) -> usize {
        self.max_eval
    }
}

#[derive(Clone, Debug)]
/// The set of hyperparameters that can be specified for the execution of
/// the [SKI GP algorithm](crate::SkiGaussianProcess).
pub struct SkiGpParams<F: Float, Corr: CorrelationModel<F>>(SkiGpValidParams<F, Corr>);

impl<F: Float, Corr: CorrelationModel<F>> SkiGpParams<F, Corr> {
    /// A constructor for SKI GP parameters given a correlation model
    pub fn new(corr: Corr) -> SkiGpParams<F, Corr> {
        Self(SkiGpValidParams {
            corr,
            ..Default::default()
        })
    }

    /// A constructor for SKI GP parameters from validated parameters
    pub fn new_from_valid(params: &SkiGpValidParams<F, Corr>) -> Self {
        Self(params.clone())
    }

    /// Set correlation model.
    pub fn corr(mut self, corr: Corr) -> Self {
        self.0.corr = corr;
        self
    }

    /// Set value for theta hyper parameter.
    ///
    /// When theta is optimized, the internal optimization is started from `theta_init`.
    /// When theta is fixed, this set theta constant value.
    pub fn theta_init(mut self, theta_init: Array1<F>) -> Self {
        self.0.theta_tuning = match self.0.theta_tuning {
            ThetaTuning::Full { init: _, bounds } => ThetaTuning::Full {
                init: theta_init,
                bounds,
            },
            ThetaTuning::Fixed(_) => ThetaTuning::Fixed(theta_init),
        };
        self
    }

    /// Set theta hyper parameter search space.
    ///
    /// This function is no-op when theta tuning is fixed
    pub fn theta_bounds(mut self, theta_bounds: Array1<(F, F)>) -> Self {
        self.0.theta_tuning = match self.0.theta_tuning {
            ThetaTuning::Full { init, bounds: _ } => ThetaTuning::Full {
                init,
                bounds: theta_bounds,
            },
            ThetaTuning::Fixed(f) => ThetaTuning::Fixed(f),
        };
        self
    }

    /// Set theta hyper parameter tuning
    pub fn theta_tuning(mut self, theta_tuning: ThetaTuning<F>) -> Self {
        self.0.theta_tuning = theta_tuning;
        self
    }

    /// Set noise tuning
    pub fn noise_tuning(mut self, noise_tuning: NoiseTuning<F>) -> Self {
        self.0.noise_tuning = noise_tuning;
        self
    }

    /// Set covariance representation
    pub fn approximation(mut self, approximation: KernelApproximation) -> Self {
        self.0.approximation = approximation;
        self
    }

    /// Set the number of inducing grid points per dimension
    pub fn grid_size(mut self, grid_size: usize) -> Self {
        self.0.grid_size = grid_size;
        self
    }

    /// Set the grid padding, a fraction of the data range added on each side
    pub fn grid_padding(mut self, grid_padding: F) -> Self {
        self.0.grid_padding = grid_padding;
        self
    }

    /// Set explicit grid bounds as a (nx, 2) array of `[lo, hi]` rows.
    ///
    /// Training or prediction points outside of them are clamped to the boundary.
    pub fn grid_bounds(mut self, grid_bounds: Option<Array2<F>>) -> Self {
        self.0.grid_bounds = grid_bounds;
        self
    }

    /// Set PCG settings
    pub fn cg_params(mut self, cg_params: CgParams) -> Self {
        self.0.cg_params = cg_params;
        self
    }

    /// Set SLQ settings
    pub fn slq_params(mut self, slq_params: SlqParams) -> Self {
        self.0.slq_params = slq_params;
        self
    }

    /// Set the rank of the predictive variance cache
    pub fn cache_rank(mut self, cache_rank: usize) -> Self {
        self.0.cache_rank = cache_rank;
        self
    }

    /// Set jitter.
    ///
    /// Jitter is used to improve numerical stability
    pub fn jitter(mut self, jitter: F) -> Self {
        self.0.jitter = jitter;
        self
    }

    /// Set the seed of random draws, the likelihood probes included
    pub fn seed(mut self, seed: u64) -> Self {
        self.0.seed = seed;
        self.0.slq_params = self.0.slq_params.clone().seed(seed);
        self
    }

    /// Set the marginal likelihood optimizer
    pub fn optimizer(mut self, optimizer: HyperOptimizer) -> Self {
        self.0.optimizer = optimizer;
        self
    }

    /// Set the max number of internal likelihood evaluations during one optimization
    /// Given max_eval has to be greater than [crate::GP_COBYLA_MIN_EVAL] otherwise
    /// max_eval is set to [crate::GP_COBYLA_MIN_EVAL].
    pub fn max_eval(mut self, max_eval: usize) -> Self {
        self.0.max_eval = GP_COBYLA_MIN_EVAL.max(max_eval);
        self
    }
}

impl<F: Float, Corr: CorrelationModel<F>> From<SkiGpValidParams<F, Corr>> for SkiGpParams<F, Corr> {
    fn from(valid: SkiGpValidParams<F, Corr>) -> Self {
        SkiGpParams(valid)
    }
}

impl<F: Float, Corr: CorrelationModel<F>> ParamGuard for SkiGpParams<F, Corr> {
    type Checked = SkiGpValidParams<F, Corr>;
    type Error = GpError;

    fn check_ref(&self) -> Result<&Self::Checked> {
        let params = &self.0;
        if params.grid_size < MIN_GRID_SIZE {
            return Err(GpError::InvalidValueError(format!(
                "`grid_size` should be at least {MIN_GRID_SIZE}, got {}",
                params.grid_size
            )));
        }
        if params.grid_padding < F::zero() {
            return Err(GpError::InvalidValueError(format!(
                "`grid_padding` should be non negative, got {}",
                params.grid_padding
            )));
        }
        if params.jitter < F::zero() {
            return Err(GpError::InvalidValueError(format!(
                "`jitter` should be non negative, got {}",
                params.jitter
            )));
        }
        if params.cache_rank == 0 {
            return Err(GpError::InvalidValueError(
                "`cache_rank` should be at least 1".to_string(),
            ));
        }
        let theta = params.theta_tuning.init();
        if theta.is_empty() || theta.iter().any(|t| !(*t > F::zero())) {
            return Err(GpError::InvalidValueError(format!(
                "initial theta should be non empty and positive, got {theta}"
            )));
        }
        if let Some(bounds) = params.theta_tuning.bounds() {
            if bounds.len() != 1 && bounds.len() != theta.len() {
                return Err(GpError::InvalidValueError(format!(
                    "theta bounds length ({}) should be 1 or match initial theta length ({})",
                    bounds.len(),
                    theta.len()
                )));
            }
            if bounds.iter().any(|(lo, up)| !(*lo > F::zero() && lo <= up)) {
                return Err(GpError::InvalidValueError(
                    "theta bounds should satisfy 0 < lower <= upper".to_string(),
                ));
            }
        }
        if !(params.noise_tuning.init() >= F::zero()) {
            return Err(GpError::InvalidValueError(
                "noise should be non negative".to_string(),
            ));
        }
        if let Some((lo, up)) = params.noise_tuning.bounds() {
            if !(lo > F::zero() && lo <= up) {
                return Err(GpError::InvalidValueError(
                    "noise bounds should satisfy 0 < lower <= upper".to_string(),
                ));
            }
        }
        if let HyperOptimizer::Adam {
            learning_rate,
            max_iters,
        } = params.optimizer
        {
            if !(learning_rate > 0.) || max_iters == 0 {
                return Err(GpError::InvalidValueError(format!(
                    "Adam needs a positive learning rate and iterations, got {learning_rate} and {max_iters}"
                )));
            }
        }
        params.cg_params.check()?;
        params.slq_params.check()?;
        Ok(&self.0)
    }

    fn check(self) -> Result<Self::Checked> {
        self.check_ref()?;
        Ok(self.0)
    }
}
