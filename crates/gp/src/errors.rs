use crate::love::HyperFingerprint;
use thiserror::Error;

/// A result type for SKI GP regression algorithm
pub type Result<T> = std::result::Result<T, GpError>;

/// An error when using [`SkiGaussianProcess`](crate::SkiGaussianProcess) or building its kernel operators
#[derive(Error, Debug)]
pub enum GpError {
    /// When LikelihoodComputation computation fails
    #[error("LikelihoodComputation computation error: {0}")]
    LikelihoodComputationError(String),
    /// When a lazy operator or an iterative algorithm fails
    #[error(transparent)]
    LinopsError(#[from] skigp_linops::LinopsError),
    /// When inputs do not allow to derive an interpolation grid
    #[error("Degenerate input error: {0}")]
    DegenerateInputError(String),
    /// When a predictive cache is queried after a hyperparameter change
    #[error("Stale cache error: cache built for {built}, model is now at {current}")]
    StaleCacheError {
        /// Fingerprint of the hyperparameters the cache was built with
        built: HyperFingerprint,
        /// Fingerprint of the current model hyperparameters
        current: HyperFingerprint,
    },
    #[error(transparent)]
    /// When linear algebra computation fails
    LinalgError(#[from] linfa_linalg::LinalgError),
    /// When a linfa error occurs
    #[error(transparent)]
    LinfaError(#[from] linfa::error::Error),
    /// When error dur to a bad value
    #[error("InvalidValue error: {0}")]
    InvalidValueError(String),
}
