//! Radix-2 Cooley-Tukey FFT over any [`Scalar`].
//!
//! Used by the circulant embedding of symmetric Toeplitz matrices. Twiddle
//! factors are constants, so running the transform on dual numbers
//! propagates derivatives through the Toeplitz product.

use crate::scalar::Scalar;

/// Complex number over a generic scalar. `num_complex::Complex` would need
/// `num_traits::Num` from the parts, which [`crate::Dual`] does not implement.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Complex<S: Scalar> {
    pub re: S,
    pub im: S,
}

impl<S: Scalar> Complex<S> {
    pub fn new(re: S, im: S) -> Self {
        Complex { re, im }
    }

    pub fn zero() -> Self {
        Complex::new(S::zero(), S::zero())
    }

    #[inline]
    pub fn add(self, o: Self) -> Self {
        Complex::new(self.re + o.re, self.im + o.im)
    }

    #[inline]
    pub fn sub(self, o: Self) -> Self {
        Complex::new(self.re - o.re, self.im - o.im)
    }

    #[inline]
    pub fn mul(self, o: Self) -> Self {
        Complex::new(
            self.re * o.re - self.im * o.im,
            self.re * o.im + self.im * o.re,
        )
    }
}

fn bit_reverse_permute<T>(data: &mut [T]) {
    let n = data.len();
    let mut j = 0;
    for i in 1..n {
        let mut bit = n >> 1;
        while j & bit != 0 {
            j ^= bit;
            bit >>= 1;
        }
        j |= bit;
        if i < j {
            data.swap(i, j);
        }
    }
}

/// In-place FFT of `data`, whose length must be a power of two.
/// The inverse transform includes the `1/n` normalisation.
pub(crate) fn fft_in_place<S: Scalar>(data: &mut [Complex<S>], inverse: bool) {
    let n = data.len();
    debug_assert!(n.is_power_of_two(), "FFT size must be a power of 2");
    if n <= 1 {
        return;
    }
    bit_reverse_permute(data);

    let sign = if inverse { 1.0 } else { -1.0 };
    let mut stage_len = 2;
    while stage_len <= n {
        let half = stage_len / 2;
        let angle = sign * 2.0 * std::f64::consts::PI / stage_len as f64;
        let twiddles: Vec<Complex<S>> = (0..half)
            .map(|j| {
                let theta = angle * j as f64;
                Complex::new(S::lit(theta.cos()), S::lit(theta.sin()))
            })
            .collect();
        for start in (0..n).step_by(stage_len) {
            for (j, w) in twiddles.iter().enumerate() {
                let even = data[start + j];
                let odd = data[start + j + half].mul(*w);
                data[start + j] = even.add(odd);
                data[start + j + half] = even.sub(odd);
            }
        }
        stage_len <<= 1;
    }

    if inverse {
        let inv_n = S::lit(1.0 / n as f64);
        for v in data.iter_mut() {
            v.re *= inv_n;
            v.im *= inv_n;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dual::Dual;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_fft_matches_dft() {
        let x = [1.0, 2.0, -1.0, 0.5, 3.0, 0.0, -2.0, 1.5];
        let n = x.len();
        let mut buf: Vec<Complex<f64>> = x.iter().map(|&v| Complex::new(v, 0.)).collect();
        fft_in_place(&mut buf, false);
        for (k, c) in buf.iter().enumerate() {
            let (mut re, mut im) = (0., 0.);
            for (j, v) in x.iter().enumerate() {
                let t = -2. * std::f64::consts::PI * (j * k) as f64 / n as f64;
                re += v * t.cos();
                im += v * t.sin();
            }
            assert_abs_diff_eq!(c.re, re, epsilon = 1e-10);
            assert_abs_diff_eq!(c.im, im, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_fft_inverse_roundtrip() {
        let x = [0.3, -1.2, 4.0, 2.2];
        let mut buf: Vec<Complex<f64>> = x.iter().map(|&v| Complex::new(v, 0.)).collect();
        fft_in_place(&mut buf, false);
        fft_in_place(&mut buf, true);
        for (c, v) in buf.iter().zip(x.iter()) {
            assert_abs_diff_eq!(c.re, *v, epsilon = 1e-12);
            assert_abs_diff_eq!(c.im, 0., epsilon = 1e-12);
        }
    }

    #[test]
    fn test_fft_of_dual_numbers() {
        // the tangent part transforms like the value part
        let x = [1.0, 2.0, -1.0, 0.5, 3.0, 0.0, -2.0, 1.5];
        let dx = [0.5, -0.25, 1.0, 0.0, 2.0, -1.0, 0.75, 0.1];
        let mut dual: Vec<Complex<Dual<f64>>> = x
            .iter()
            .zip(dx.iter())
            .map(|(&v, &e)| Complex::new(Dual::new(v, e), Dual::constant(0.)))
            .collect();
        let mut tangent: Vec<Complex<f64>> = dx.iter().map(|&e| Complex::new(e, 0.)).collect();
        let mut value: Vec<Complex<f64>> = x.iter().map(|&v| Complex::new(v, 0.)).collect();
        fft_in_place(&mut dual, false);
        fft_in_place(&mut tangent, false);
        fft_in_place(&mut value, false);
        for ((d, t), v) in dual.iter().zip(tangent.iter()).zip(value.iter()) {
            assert_abs_diff_eq!(d.re.re, v.re, epsilon = 1e-12);
            assert_abs_diff_eq!(d.im.re, v.im, epsilon = 1e-12);
            assert_abs_diff_eq!(d.re.eps, t.re, epsilon = 1e-12);
            assert_abs_diff_eq!(d.im.eps, t.im, epsilon = 1e-12);
        }
    }
}
