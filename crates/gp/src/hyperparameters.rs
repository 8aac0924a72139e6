use crate::errors::{GpError, Result};
use linfa::Float;
use ndarray::{Array1, ArrayBase, Data, Ix1};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use skigp_linops::Scalar;
use std::fmt;

/// Kernel hyperparameters of a SKI GP model.
///
/// The covariance of the training outputs is `sigma2 * (C(theta) + noise * I)`
/// where `C` is the correlation matrix, so `noise` is relative to the process
/// variance.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct Hyperparameters<S> {
    /// Inverse length scales, one per input dimension
    pub theta: Array1<S>,
    /// Process variance
    pub sigma2: S,
    /// Observation noise variance relative to `sigma2`
    pub noise: S,
}

impl<F: Float> Hyperparameters<F> {
    /// Checked constructor
    pub fn new(theta: Array1<F>, sigma2: F, noise: F) -> Result<Self> {
        if theta.is_empty() {
            return Err(GpError::InvalidValueError(
                "theta should have at least one component".to_string(),
            ));
        }
        if theta.iter().any(|t| !(*t > F::zero()) || !t.is_finite()) {
            return Err(GpError::InvalidValueError(format!(
                "theta components should be positive, got {theta}"
            )));
        }
        if !(sigma2 > F::zero()) || !sigma2.is_finite() {
            return Err(GpError::InvalidValueError(format!(
                "sigma2 should be positive, got {sigma2}"
            )));
        }
        if !(noise >= F::zero()) || !noise.is_finite() {
            return Err(GpError::InvalidValueError(format!(
                "noise should be non negative, got {noise}"
            )));
        }
        Ok(Hyperparameters {
            theta,
            sigma2,
            noise,
        })
    }
}

impl<S: Scalar> Hyperparameters<S> {
    /// Builds hyperparameters from optimizer variables: `log10(theta)` followed
    /// by `log10(noise)` when `noise` is not given.
    ///
    /// Works on dual numbers so that kernels built from the result carry the
    /// derivatives with respect to the log10 variables.
    pub fn from_log10(
        params: &ArrayBase<impl Data<Elem = S>, Ix1>,
        nx: usize,
        sigma2: S,
        noise: Option<S>,
    ) -> Self {
        let ln10 = S::Real::cast(std::f64::consts::LN_10);
        let pow10 = |p: S| p.scale(ln10).exp();
        let theta = params.slice(ndarray::s![..nx]).mapv(pow10);
        let noise = match noise {
            Some(noise) => noise,
            None => pow10(params[nx]),
        };
        Hyperparameters {
            theta,
            sigma2,
            noise,
        }
    }
}

impl<F: Float> fmt::Display for Hyperparameters<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "theta = {}, sigma2 = {}, noise = {}",
            self.theta, self.sigma2, self.noise
        )
    }
}
