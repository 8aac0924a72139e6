//! This library implements scalable [Gaussian Process](https://en.wikipedia.org/wiki/Gaussian_process)
//! regression with structured kernel interpolation (SKI, also known as KISS-GP).
//!
//! The covariance of the training points is approximated as `W K_grid Wᵀ` where
//! `K_grid` is the kernel on a regular inducing grid, a Kronecker product of
//! Toeplitz matrices, and `W` a sparse cubic interpolation. The covariance is
//! never formed: the model works with lazy operators from [skigp_linops], solves
//! with preconditioned conjugate gradients, estimates log determinants with
//! stochastic Lanczos quadrature and answers variance queries from a LOVE
//! predictive cache.
//!
//! SKI GP models are implemented by [SkiGaussianProcess] parameterized by [SkiGpParams].
//!
//! ```no_run
//! use linfa::prelude::*;
//! use ndarray::{Array, Axis};
//! use skigp_gp::{correlation_models::SquaredExponentialCorr, SkiGaussianProcess};
//!
//! let xt = Array::linspace(0., 10., 200).insert_axis(Axis(1));
//! let yt = xt.column(0).mapv(|v: f64| v.sin());
//! let gp = SkiGaussianProcess::<f64, SquaredExponentialCorr>::params(
//!     SquaredExponentialCorr::default(),
//! )
//! .grid_size(200)
//! .fit(&Dataset::new(xt, yt))
//! .expect("GP fit error");
//! let xtest = Array::linspace(0., 10., 50).insert_axis(Axis(1));
//! let (mean, variance) = gp.predict_valvar(&xtest).expect("GP prediction error");
//! ```
#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]
mod algorithm;
pub mod correlation_models;
mod errors;
pub mod grid;
mod hyperparameters;
pub mod love;
mod optimization;
mod parameters;
pub mod ski;
mod utils;

pub use algorithm::*;
pub use errors::*;
pub use hyperparameters::*;
pub use love::{CacheKind, CrossCovariance, HyperFingerprint, PredictiveCache};
pub use parameters::*;
pub use ski::{CovarianceKernel, ExactKernel, SkiKernel, SkiKernelBuilder};
pub use utils::normalize;
