//! Scalar abstraction shared by every operator and iterative algorithm.
//!
//! Algorithms are written once against [`Scalar`]. Plain floats give the
//! value; [`Dual`](crate::Dual) numbers give the value together with its
//! directional derivative, obtained by running the very same iterations.

use linfa::Float;
use ndarray::{LinalgScalar, ScalarOperand};
use std::fmt;
use std::iter::Sum;
use std::ops::{AddAssign, DivAssign, MulAssign, Neg, SubAssign};

/// Element type of lazy matrices and Krylov vectors
pub trait Scalar:
    LinalgScalar
    + ScalarOperand
    + Neg<Output = Self>
    + AddAssign
    + SubAssign
    + MulAssign
    + DivAssign
    + PartialOrd
    + Sum
    + fmt::Debug
    + fmt::Display
    + Send
    + Sync
{
    /// Underlying real type
    type Real: Float;

    /// Value part
    fn re(&self) -> Self::Real;

    /// Absolute value of the value part
    fn re_abs(&self) -> Self::Real {
        num_traits::Float::abs(self.re())
    }

    /// Embeds a real value as a constant
    fn from_real(v: Self::Real) -> Self;

    /// Embeds a literal as a constant
    fn lit(v: f64) -> Self {
        Self::from_real(Self::Real::cast(v))
    }

    /// Multiplies by a real constant
    fn scale(self, r: Self::Real) -> Self {
        self * Self::from_real(r)
    }

    /// Square root
    fn sqrt(self) -> Self;

    /// Natural logarithm
    fn ln(self) -> Self;

    /// Exponential
    fn exp(self) -> Self;

    /// Absolute value
    fn abs(self) -> Self;
}

impl<F: Float> Scalar for F {
    type Real = F;

    #[inline]
    fn re(&self) -> F {
        *self
    }

    #[inline]
    fn from_real(v: F) -> F {
        v
    }

    #[inline]
    fn scale(self, r: F) -> F {
        self * r
    }

    #[inline]
    fn sqrt(self) -> F {
        num_traits::Float::sqrt(self)
    }

    #[inline]
    fn ln(self) -> F {
        num_traits::Float::ln(self)
    }

    #[inline]
    fn exp(self) -> F {
        num_traits::Float::exp(self)
    }

    #[inline]
    fn abs(self) -> F {
        num_traits::Float::abs(self)
    }
}
