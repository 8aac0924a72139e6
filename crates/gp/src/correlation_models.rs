//! A module for stationary correlation models used to build kernel operators.
//!
//! The following correlation models are implemented:
//! * squared exponential,
//! * absolute exponential,
//! * matern 3/2,
//! * matern 5/2.
//!
//! All of them are products over input dimensions of a one-dimensional
//! correlation `k(r)` evaluated at the scaled distance `r_j = theta_j * |d_j|`,
//! theta being the inverse of the length scale. This separability is what
//! makes the grid kernel a Kronecker product of Toeplitz matrices.

use linfa::Float;
use ndarray::{Array2, ArrayBase, Data, Ix1, Ix2, Zip};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use skigp_linops::Scalar;
use std::convert::TryFrom;
use std::fmt;

/// A trait for using a correlation model in SKI GP regression
pub trait CorrelationModel<F: Float>:
    Clone + Copy + Default + fmt::Display + Send + Sync + 'static
{
    /// One-dimensional correlation `k(r)` at scaled distance `r >= 0`.
    ///
    /// Generic over [`Scalar`] so that hyperparameters may carry tangents.
    fn value_1d<S: Scalar<Real = F>>(&self, r: S) -> S;

    /// Correlation between two points separated by `d` (nx,) given `theta` (nx,)
    fn correlation<S: Scalar<Real = F>>(
        &self,
        d: &ArrayBase<impl Data<Elem = F>, Ix1>,
        theta: &ArrayBase<impl Data<Elem = S>, Ix1>,
    ) -> S {
        Zip::from(d).and(theta).fold(S::one(), |acc, &dj, &tj| {
            acc * self.value_1d(tj.scale(num_traits::Float::abs(dj)))
        })
    }

    /// Compute correlation function matrix r(x, x') given distances `d` (n, nx)
    /// between x and x' and `theta` parameters (nx,). Returns a (n, 1) matrix.
    fn value(
        &self,
        d: &ArrayBase<impl Data<Elem = F>, Ix2>,
        theta: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Array2<F> {
        let mut r = Array2::zeros((d.nrows(), 1));
        Zip::from(r.rows_mut())
            .and(d.rows())
            .for_each(|mut ri, di| ri[0] = self.correlation(&di, theta));
        r
    }
}

/// Squared exponential correlation models
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(into = "String"),
    serde(try_from = "String")
)]
pub struct SquaredExponentialCorr();

impl From<SquaredExponentialCorr> for String {
    fn from(_item: SquaredExponentialCorr) -> String {
        "SquaredExponential".to_string()
    }
}

impl TryFrom<String> for SquaredExponentialCorr {
    type Error = &'static str;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        if s == "SquaredExponential" {
            Ok(Self::default())
        } else {
            Err("Bad string value for SquaredExponentialCorr, should be \'SquaredExponential\'")
        }
    }
}

impl<F: Float> CorrelationModel<F> for SquaredExponentialCorr {
    /// exp( - r^2 / 2 )
    fn value_1d<S: Scalar<Real = F>>(&self, r: S) -> S {
        (-(r * r).scale(F::cast(0.5))).exp()
    }
}

impl fmt::Display for SquaredExponentialCorr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SquaredExponential")
    }
}

/// Absolute exponential correlation models
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(into = "String"),
    serde(try_from = "String")
)]
pub struct AbsoluteExponentialCorr();

impl From<AbsoluteExponentialCorr> for String {
    fn from(_item: AbsoluteExponentialCorr) -> String {
        "AbsoluteExponential".to_string()
    }
}

impl TryFrom<String> for AbsoluteExponentialCorr {
    type Error = &'static str;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        if s == "AbsoluteExponential" {
            Ok(Self::default())
        } else {
            Err("Bad string value for AbsoluteExponentialCorr, should be \'AbsoluteExponential\'")
        }
    }
}

impl<F: Float> CorrelationModel<F> for AbsoluteExponentialCorr {
    /// exp( - r )
    fn value_1d<S: Scalar<Real = F>>(&self, r: S) -> S {
        (-r).exp()
    }
}

impl fmt::Display for AbsoluteExponentialCorr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "AbsoluteExponential")
    }
}

/// Matern 3/2 correlation model
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(into = "String"),
    serde(try_from = "String")
)]
pub struct Matern32Corr();

impl From<Matern32Corr> for String {
    fn from(_item: Matern32Corr) -> String {
        "Matern32".to_string()
    }
}

impl TryFrom<String> for Matern32Corr {
    type Error = &'static str;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        if s == "Matern32" {
            Ok(Self::default())
        } else {
            Err("Bad string value for Matern32Corr, should be \'Matern32\'")
        }
    }
}

impl<F: Float> CorrelationModel<F> for Matern32Corr {
    /// (1 + sqrt(3) r) exp( - sqrt(3) r )
    fn value_1d<S: Scalar<Real = F>>(&self, r: S) -> S {
        let s = r.scale(F::cast(3f64.sqrt()));
        (S::one() + s) * (-s).exp()
    }
}

impl fmt::Display for Matern32Corr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Matern32")
    }
}

/// Matern 5/2 correlation model
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(into = "String"),
    serde(try_from = "String")
)]
pub struct Matern52Corr();

impl From<Matern52Corr> for String {
    fn from(_item: Matern52Corr) -> String {
        "Matern52".to_string()
    }
}

impl TryFrom<String> for Matern52Corr {
    type Error = &'static str;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        if s == "Matern52" {
            Ok(Self::default())
        } else {
            Err("Bad string value for Matern52Corr, should be \'Matern52\'")
        }
    }
}

impl<F: Float> CorrelationModel<F> for Matern52Corr {
    /// (1 + sqrt(5) r + 5/3 r^2) exp( - sqrt(5) r )
    fn value_1d<S: Scalar<Real = F>>(&self, r: S) -> S {
        let s = r.scale(F::cast(5f64.sqrt()));
        (S::one() + s + (s * s).scale(F::cast(1. / 3.))) * (-s).exp()
    }
}

impl fmt::Display for Matern52Corr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Matern52")
    }
}
