//! Symmetric Toeplitz matrices, the structure of a stationary kernel
//! evaluated on an evenly spaced one dimensional grid.

use crate::fft::{fft_in_place, Complex};
use crate::scalar::Scalar;
use ndarray::{Array1, Array2, ArrayView2, Axis, Zip};

/// Below this dimension the product is computed directly
pub const TOEPLITZ_FFT_THRESHOLD: usize = 64;

/// Symmetric Toeplitz matrix `T[i, j] = c[|i - j|]` given by its first column `c`
#[derive(Clone, Debug)]
pub struct SymmetricToeplitz<S: Scalar> {
    column: Array1<S>,
    /// Spectrum of the circulant embedding, computed once when FFT is used
    spectrum: Option<Vec<Complex<S>>>,
}

impl<S: Scalar> SymmetricToeplitz<S> {
    /// Constructor from the first column
    pub fn new(column: Array1<S>) -> Self {
        let spectrum = if column.len() >= TOEPLITZ_FFT_THRESHOLD {
            Some(circulant_spectrum(&column))
        } else {
            None
        };
        SymmetricToeplitz { column, spectrum }
    }

    /// Matrix dimension
    pub fn dim(&self) -> usize {
        self.column.len()
    }

    /// First column
    pub fn column(&self) -> &Array1<S> {
        &self.column
    }

    /// Entry `(i, j)`
    pub fn get(&self, i: usize, j: usize) -> S {
        self.column[i.abs_diff(j)]
    }

    /// Whether products go through the circulant FFT path
    pub fn uses_fft(&self) -> bool {
        self.spectrum.is_some()
    }

    /// Computes `T X` for a `(dim, k)` matrix `X`
    pub fn apply(&self, x: ArrayView2<S>) -> Array2<S> {
        match &self.spectrum {
            Some(spectrum) => self.apply_fft(spectrum, x),
            None => self.apply_direct(x),
        }
    }

    fn apply_direct(&self, x: ArrayView2<S>) -> Array2<S> {
        let m = self.dim();
        let mut out = Array2::zeros((m, x.ncols()));
        for i in 0..m {
            let mut row = out.row_mut(i);
            for j in 0..m {
                let c = self.column[i.abs_diff(j)];
                Zip::from(&mut row).and(x.row(j)).for_each(|o, &v| *o += c * v);
            }
        }
        out
    }

    fn apply_fft(&self, spectrum: &[Complex<S>], x: ArrayView2<S>) -> Array2<S> {
        let m = self.dim();
        let len = spectrum.len();
        let mut out = Array2::zeros((m, x.ncols()));
        let mut buf = vec![Complex::zero(); len];
        for (col_in, mut col_out) in x.axis_iter(Axis(1)).zip(out.axis_iter_mut(Axis(1))) {
            buf.iter_mut().for_each(|b| *b = Complex::zero());
            for (b, &v) in buf.iter_mut().zip(col_in.iter()) {
                b.re = v;
            }
            fft_in_place(&mut buf, false);
            for (b, s) in buf.iter_mut().zip(spectrum.iter()) {
                *b = b.mul(*s);
            }
            fft_in_place(&mut buf, true);
            for (o, b) in col_out.iter_mut().zip(buf.iter()) {
                *o = b.re;
            }
        }
        out
    }

    /// Dense matrix, for tests and small problems
    pub fn to_dense(&self) -> Array2<S> {
        let m = self.dim();
        Array2::from_shape_fn((m, m), |(i, j)| self.get(i, j))
    }
}

/// FFT of the first column of the `2^p >= 2m - 1` circulant embedding
fn circulant_spectrum<S: Scalar>(column: &Array1<S>) -> Vec<Complex<S>> {
    let m = column.len();
    let len = (2 * m - 1).next_power_of_two();
    let mut buf = vec![Complex::zero(); len];
    for i in 0..m {
        buf[i].re = column[i];
    }
    for i in 1..m {
        buf[len - i].re = column[i];
    }
    fft_in_place(&mut buf, false);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Dual;
    use approx::assert_abs_diff_eq;
    use ndarray_rand::rand::SeedableRng;
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;
    use rand_xoshiro::Xoshiro256Plus;

    #[test]
    fn test_toeplitz_fft_equals_direct() {
        let m = 100;
        let col = Array1::from_shape_fn(m, |i| (-0.5 * (i as f64 * 0.05).powi(2)).exp());
        let t = SymmetricToeplitz::new(col);
        assert!(t.uses_fft());
        let mut rng = Xoshiro256Plus::seed_from_u64(42);
        let x = Array2::random_using((m, 3), Uniform::new(-1., 1.), &mut rng);
        let fast = t.apply(x.view());
        let dense = t.to_dense().dot(&x);
        assert_abs_diff_eq!(fast, dense, epsilon = 1e-10);
        assert_abs_diff_eq!(t.apply_direct(x.view()), dense, epsilon = 1e-12);
    }

    #[test]
    fn test_toeplitz_small_is_direct() {
        let t = SymmetricToeplitz::new(Array1::from(vec![2., 1., 0.5]));
        assert!(!t.uses_fft());
        let x = Array2::from_shape_vec((3, 1), vec![1., 0., -1.]).unwrap();
        let y = t.apply(x.view());
        assert_abs_diff_eq!(y, ndarray::array![[1.5], [0.], [-1.5]], epsilon = 1e-14);
    }

    #[test]
    fn test_toeplitz_fft_dual_tangent() {
        // d/dl of T(l) x where c_i = exp(-l i)
        let m = 70;
        let l = 0.3;
        let col = Array1::from_shape_fn(m, |i| {
            let r = Dual::constant(i as f64);
            Scalar::exp(-(Dual::variable(l) * r))
        });
        let t = SymmetricToeplitz::new(col);
        let x = Array2::from_shape_fn((m, 1), |(i, _)| Dual::constant((i as f64).sin()));
        let y = t.apply(x.view());
        let dcol = Array1::from_shape_fn(m, |i| -(i as f64) * (-l * i as f64).exp());
        let dt = SymmetricToeplitz::new(dcol);
        let xs = x.mapv(|v| v.re);
        let dy = dt.to_dense().dot(&xs);
        for i in 0..m {
            assert_abs_diff_eq!(y[[i, 0]].eps, dy[[i, 0]], epsilon = 1e-9);
        }
    }
}
