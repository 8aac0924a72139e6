//! Forward-mode dual numbers.
//!
//! A `Dual { re, eps }` carries a value and one directional derivative.
//! Seeding the hyperparameters of a kernel with `eps = e_i` and running a
//! whole PCG or Lanczos computation on dual numbers yields the partial
//! derivative of the result with respect to hyperparameter `i`.

use crate::scalar::Scalar;
use linfa::Float;
use ndarray::ScalarOperand;
use num_traits::{One, Zero};
use std::cmp::Ordering;
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Div, DivAssign, Mul, MulAssign, Neg, Sub, SubAssign};

/// First order dual number
#[derive(Clone, Copy, Debug, Default)]
pub struct Dual<F: Float> {
    /// Value
    pub re: F,
    /// Tangent
    pub eps: F,
}

impl<F: Float> Dual<F> {
    /// Dual number with given value and tangent
    pub fn new(re: F, eps: F) -> Self {
        Dual { re, eps }
    }

    /// Constant (zero tangent)
    pub fn constant(re: F) -> Self {
        Dual { re, eps: F::zero() }
    }

    /// Independent variable (unit tangent)
    pub fn variable(re: F) -> Self {
        Dual { re, eps: F::one() }
    }

    /// Chain rule helper: `f(re)` with derivative `df(re)`
    #[inline]
    fn chain(self, f: F, df: F) -> Self {
        Dual {
            re: f,
            eps: self.eps * df,
        }
    }
}

impl<F: Float> PartialEq for Dual<F> {
    fn eq(&self, other: &Self) -> bool {
        self.re == other.re
    }
}

impl<F: Float> PartialOrd for Dual<F> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.re.partial_cmp(&other.re)
    }
}

impl<F: Float> fmt::Display for Dual<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}+{}ε", self.re, self.eps)
    }
}

impl<F: Float> Add for Dual<F> {
    type Output = Self;
    #[inline]
    fn add(self, rhs: Self) -> Self {
        Dual::new(self.re + rhs.re, self.eps + rhs.eps)
    }
}

impl<F: Float> Sub for Dual<F> {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: Self) -> Self {
        Dual::new(self.re - rhs.re, self.eps - rhs.eps)
    }
}

impl<F: Float> Mul for Dual<F> {
    type Output = Self;
    #[inline]
    fn mul(self, rhs: Self) -> Self {
        Dual::new(self.re * rhs.re, self.re * rhs.eps + self.eps * rhs.re)
    }
}

impl<F: Float> Div for Dual<F> {
    type Output = Self;
    #[inline]
    fn div(self, rhs: Self) -> Self {
        let re = self.re / rhs.re;
        Dual::new(re, (self.eps - re * rhs.eps) / rhs.re)
    }
}

impl<F: Float> Neg for Dual<F> {
    type Output = Self;
    #[inline]
    fn neg(self) -> Self {
        Dual::new(-self.re, -self.eps)
    }
}

macro_rules! impl_assign_op {
    ($trait:ident, $method:ident, $op:tt) => {
        impl<F: Float> $trait for Dual<F> {
            #[inline]
            fn $method(&mut self, rhs: Self) {
                *self = *self $op rhs;
            }
        }
    };
}

impl_assign_op!(AddAssign, add_assign, +);
impl_assign_op!(SubAssign, sub_assign, -);
impl_assign_op!(MulAssign, mul_assign, *);
impl_assign_op!(DivAssign, div_assign, /);

impl<F: Float> Zero for Dual<F> {
    fn zero() -> Self {
        Dual::constant(F::zero())
    }

    fn is_zero(&self) -> bool {
        self.re.is_zero() && self.eps.is_zero()
    }
}

impl<F: Float> One for Dual<F> {
    fn one() -> Self {
        Dual::constant(F::one())
    }
}

impl<F: Float> Sum for Dual<F> {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Dual::zero(), |acc, v| acc + v)
    }
}

impl<F: Float> ScalarOperand for Dual<F> {}

impl<F: Float> Scalar for Dual<F> {
    type Real = F;

    #[inline]
    fn re(&self) -> F {
        self.re
    }

    #[inline]
    fn from_real(v: F) -> Self {
        Dual::constant(v)
    }

    #[inline]
    fn scale(self, r: F) -> Self {
        Dual::new(self.re * r, self.eps * r)
    }

    fn sqrt(self) -> Self {
        let s = num_traits::Float::sqrt(self.re);
        if s > F::zero() {
            self.chain(s, F::cast(0.5) / s)
        } else {
            // derivative undefined at 0, taken as 0
            Dual::constant(s)
        }
    }

    fn ln(self) -> Self {
        self.chain(num_traits::Float::ln(self.re), F::one() / self.re)
    }

    fn exp(self) -> Self {
        let e = num_traits::Float::exp(self.re);
        self.chain(e, e)
    }

    fn abs(self) -> Self {
        if self.re < F::zero() {
            -self
        } else {
            self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_dual_arithmetic() {
        let x = Dual::variable(3.0);
        let c = Dual::constant(2.0);
        // f(x) = (x * x + 2) / x, f'(x) = 1 - 2 / x^2
        let f = (x * x + c) / x;
        assert_abs_diff_eq!(f.re, 11. / 3., epsilon = 1e-12);
        assert_abs_diff_eq!(f.eps, 1. - 2. / 9., epsilon = 1e-12);
    }

    #[test]
    fn test_dual_transcendental() {
        let x = Dual::variable(0.7_f64);
        let f = Scalar::exp(Scalar::ln(x).scale(2.)).sqrt();
        assert_abs_diff_eq!(f.re, 0.7, epsilon = 1e-12);
        assert_abs_diff_eq!(f.eps, 1.0, epsilon = 1e-12);

        let z = Scalar::sqrt(Dual::variable(0.0_f64));
        assert_eq!(z.eps, 0.);
    }

    #[test]
    fn test_dual_ordering_on_value() {
        let a = Dual::new(1.0, 10.0);
        let b = Dual::new(2.0, -10.0);
        assert!(a < b);
        assert_eq!(Dual::new(1.0, 0.0), Dual::new(1.0, 5.0));
        assert_eq!(Scalar::abs(Dual::new(-1.0, 3.0)).eps, -3.0);
    }
}
