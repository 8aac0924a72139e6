//! Low-rank root decompositions `K ≈ R Rᵀ` from Lanczos, and sampling.

use crate::errors::{LinopsError, Result};
use crate::lanczos::{lanczos, LanczosRun};
use crate::lazy::LazyMatrix;
use crate::probes::{probe_vectors, seeded_probe_vectors, ProbeDistribution};
use crate::scalar::Scalar;
use num_traits::{Float as _, Zero};

use linfa::Float;
use linfa_linalg::eigh::*;
use log::{debug, warn};
use ndarray::{Array1, Array2, Axis, Zip};
use ndarray_rand::rand::Rng;
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;

/// Eigen-pairs `(Λ, U)` with `K ≈ U Λ Uᵀ`, `Λ >= 0`
#[derive(Clone, Debug)]
pub struct RootDecomposition<S: Scalar> {
    vectors: Array2<S>,
    values: Array1<S>,
}

impl<S: Scalar> RootDecomposition<S> {
    /// Runs `steps` Lanczos iterations on `op` from a Gaussian vector drawn
    /// with `seed`. Zero steps is treated as one step (rank-one root).
    pub fn lanczos(op: &LazyMatrix<S>, steps: usize, seed: u64) -> Result<Self> {
        let init: Array2<S::Real> =
            seeded_probe_vectors(op.nrows(), 1, ProbeDistribution::Gaussian, seed);
        Self::lanczos_from(op, &init.mapv(S::from_real), steps)
    }

    /// Same as [`RootDecomposition::lanczos`] from a given starting vector
    /// of shape `(n, 1)`
    pub fn lanczos_from(op: &LazyMatrix<S>, init: &Array2<S>, steps: usize) -> Result<Self> {
        if steps == 0 {
            warn!("Root decomposition requested with 0 Lanczos steps, using 1 (rank-one root)");
        }
        let runs = lanczos(op, init, steps.max(1))?;
        match runs.first() {
            Some(run) => Self::from_lanczos(run),
            None => Err(LinopsError::InvalidValueError(
                "root decomposition needs a starting vector".to_string(),
            )),
        }
    }

    /// Reuses an existing Lanczos decomposition `op Q ≈ Q T`:
    /// with `T = V Λ Vᵀ`, `K ≈ (Q V) Λ (Q V)ᵀ`
    pub fn from_lanczos(run: &LanczosRun<S>) -> Result<Self> {
        let (ritz, v) = run.ritz()?;
        let zero = S::Real::zero();
        let n_negative = ritz.iter().filter(|l| l.re() < zero).count();
        if n_negative > 0 {
            debug!("Root decomposition: {n_negative} negative Ritz values clipped to 0");
        }
        let values = ritz.mapv(|l| if l.re() < zero { S::zero() } else { l });
        Ok(RootDecomposition {
            vectors: run.basis.dot(&v),
            values,
        })
    }

    /// Decomposition of `factor · K`, `factor >= 0`
    pub fn scaled(mut self, factor: S::Real) -> Self {
        self.values.mapv_inplace(|l| l.scale(factor));
        self
    }

    /// Rank of the decomposition
    pub fn rank(&self) -> usize {
        self.values.len()
    }

    /// Eigenvalues, ascending and non-negative
    pub fn values(&self) -> &Array1<S> {
        &self.values
    }

    /// Orthonormal eigenvectors as columns
    pub fn vectors(&self) -> &Array2<S> {
        &self.vectors
    }

    /// `R = U Λ^{1/2}` with `R Rᵀ ≈ K`
    pub fn root(&self) -> Array2<S> {
        self.scaled_vectors(|l| l.sqrt())
    }

    /// `R⁻ = U Λ^{-1/2}` with `R⁻ R⁻ᵀ ≈ K⁻¹`. Directions with numerically
    /// zero eigenvalues are dropped.
    pub fn inverse(&self) -> Array2<S> {
        let lambda_max = self
            .values
            .iter()
            .map(|l| l.re())
            .fold(S::Real::zero(), |a, b| if b > a { b } else { a });
        let threshold = lambda_max * S::Real::epsilon() * S::Real::cast(self.rank());
        self.scaled_vectors(|l| {
            if l.re() > threshold {
                S::one() / l.sqrt()
            } else {
                S::zero()
            }
        })
    }

    /// `R Rᵀ` as a low-rank lazy matrix
    pub fn as_lazy(&self) -> LazyMatrix<S> {
        LazyMatrix::low_rank(self.root())
    }

    fn scaled_vectors(&self, f: impl Fn(S) -> S) -> Array2<S> {
        let mut out = self.vectors.to_owned();
        Zip::from(out.columns_mut())
            .and(&self.values)
            .for_each(|mut col, &l| {
                let s = f(l);
                col.mapv_inplace(|v| v * s);
            });
        out
    }
}

impl<F: Float> RootDecomposition<F> {
    /// Exact decomposition of a small dense symmetric matrix
    pub fn exact(matrix: &Array2<F>) -> Result<Self> {
        let (values, vectors) = matrix.to_owned().eigh_into()?;
        let values = values.mapv(|l| if l < F::zero() { F::zero() } else { l });
        Ok(RootDecomposition { vectors, values })
    }

    /// Draws `n_samples` samples of `N(mean, R Rᵀ)` as the columns of an
    /// `(n, n_samples)` matrix
    pub fn sample<R: Rng>(&self, mean: &Array1<F>, n_samples: usize, rng: &mut R) -> Result<Array2<F>> {
        let n = mean.len();
        if self.vectors.nrows() != n {
            return Err(LinopsError::ShapeError {
                operation: "root_sample",
                expected: (n, self.rank()),
                actual: self.vectors.dim(),
            });
        }
        let z = Array2::<f64>::random_using((self.rank(), n_samples), StandardNormal, rng)
            .mapv(|v| F::cast(v));
        Ok(self.root().dot(&z) + &mean.view().insert_axis(Axis(1)))
    }
}

/// Draws `n_samples` samples of `N(mean, cov)` as the columns of an
/// `(n, n_samples)` matrix, using a root of `cov` from `steps` Lanczos steps
pub fn sample_mvn<F: Float, R: Rng>(
    mean: &Array1<F>,
    cov: &LazyMatrix<F>,
    steps: usize,
    n_samples: usize,
    rng: &mut R,
) -> Result<Array2<F>> {
    let n = mean.len();
    if cov.shape() != (n, n) {
        return Err(LinopsError::ShapeError {
            operation: "sample_mvn",
            expected: (n, n),
            actual: cov.shape(),
        });
    }
    let init = probe_vectors(n, 1, ProbeDistribution::Gaussian, rng);
    RootDecomposition::lanczos_from(cov, &init, steps)?.sample(mean, n_samples, rng)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lazy::StructureTags;
    use crate::parameters::{CgParams, SlqParams};
    use crate::slq;
    use approx::assert_abs_diff_eq;
    use ndarray::{s, Array};
    use ndarray_rand::rand::SeedableRng;
    use rand_xoshiro::Xoshiro256Plus;

    fn se_matrix(n: usize, lengthscale: f64) -> Array2<f64> {
        let x = Array::linspace(0., 1., n);
        Array2::from_shape_fn((n, n), |(i, j)| {
            (-0.5 * ((x[i] - x[j]) / lengthscale).powi(2)).exp()
        })
    }

    fn frobenius(a: &Array2<f64>) -> f64 {
        a.mapv(|v| v * v).sum().sqrt()
    }

    #[test]
    fn test_root_fidelity_improves_with_steps() {
        let k = se_matrix(30, 0.2);
        let op = LazyMatrix::dense(k.clone()).with_tags(StructureTags::PSD);
        let err = |steps| {
            let root = RootDecomposition::lanczos(&op, steps, 42).unwrap().root();
            frobenius(&(&k - &root.dot(&root.t()))) / frobenius(&k)
        };
        assert!(err(3) > err(5));
        assert!(err(5) > err(10));
        assert!(err(30) < 1e-6);
    }

    #[test]
    fn test_root_zero_steps_is_rank_one() {
        let op = LazyMatrix::dense(se_matrix(10, 0.3));
        let decomp = RootDecomposition::lanczos(&op, 0, 0).unwrap();
        assert_eq!(decomp.rank(), 1);
        assert!(decomp.values()[0] > 0.);
        assert_eq!(decomp.root().dim(), (10, 1));
    }

    #[test]
    fn test_inverse_root() {
        let k = se_matrix(8, 0.3) + Array2::<f64>::eye(8) * 0.5;
        let op = LazyMatrix::dense(k.clone());
        let decomp = RootDecomposition::lanczos(&op, 8, 1).unwrap();
        let inv = decomp.inverse();
        assert_abs_diff_eq!(
            inv.dot(&inv.t()).dot(&k),
            Array2::<f64>::eye(8),
            epsilon = 1e-8
        );
        assert_abs_diff_eq!(decomp.as_lazy().evaluate().unwrap(), k, epsilon = 1e-8);
    }

    #[test]
    fn test_exact_root() {
        let k = se_matrix(12, 0.2);
        let decomp = RootDecomposition::exact(&k).unwrap();
        assert_eq!(decomp.rank(), 12);
        assert!(decomp.values().iter().all(|&v| v >= 0.));
        let r = decomp.root();
        assert_abs_diff_eq!(r.dot(&r.t()), k, epsilon = 1e-8);
    }

    #[test]
    fn test_sample_mvn_moments() {
        let n = 6;
        let k = se_matrix(n, 0.4) + Array2::<f64>::eye(n) * 0.05;
        let mean = Array::linspace(-1., 1., n);
        let op = LazyMatrix::dense(k.clone());
        let mut rng = Xoshiro256Plus::seed_from_u64(42);
        let samples = sample_mvn(&mean, &op, n, 4000, &mut rng).unwrap();
        assert_eq!(samples.dim(), (n, 4000));
        let emp_mean = samples.mean_axis(Axis(1)).unwrap();
        assert_abs_diff_eq!(emp_mean, mean, epsilon = 0.1);
        let centered = &samples - &emp_mean.insert_axis(Axis(1));
        let emp_cov = centered.dot(&centered.t()) / 4000.;
        assert_abs_diff_eq!(emp_cov, k, epsilon = 0.15);
    }

    #[test]
    fn test_root_from_log_det_runs() {
        let n = 30;
        let k = se_matrix(n, 0.2) + Array2::<f64>::eye(n) * 0.1;
        let op = LazyMatrix::dense(k.clone()).with_tags(StructureTags::SPD);
        let y = Array::linspace(-1., 1., n).insert_axis(Axis(1));
        let slq_params = SlqParams::default().n_probes(3).lanczos_steps(8);
        let terms = slq::inv_quad_log_det(&op, &y, &CgParams::default(), &slq_params).unwrap();
        assert_eq!(terms.lanczos_runs.len(), 3);

        // same decomposition as a fresh Lanczos run from the first probe
        let reused = RootDecomposition::from_lanczos(&terms.lanczos_runs[0]).unwrap();
        let z: Array2<f64> = seeded_probe_vectors(n, 3, slq_params.distribution, slq_params.seed);
        let fresh = RootDecomposition::lanczos_from(&op, &z.slice(s![.., ..1]).to_owned(), 8).unwrap();
        assert_eq!(reused.rank(), 8);
        assert_abs_diff_eq!(reused.values(), fresh.values(), epsilon = 1e-10);
        let (r1, r2) = (reused.root(), fresh.root());
        assert_abs_diff_eq!(r1.dot(&r1.t()), r2.dot(&r2.t()), epsilon = 1e-10);

        let full = slq::inv_quad_log_det(
            &op,
            &y,
            &CgParams::default(),
            &slq_params.lanczos_steps(n),
        )
        .unwrap();
        let root = RootDecomposition::from_lanczos(&full.lanczos_runs[0])
            .unwrap()
            .scaled(2.)
            .root();
        assert_abs_diff_eq!(root.dot(&root.t()), &k * 2., epsilon = 1e-6);
    }

    #[test]
    fn test_root_sample_shape_error() {
        let decomp = RootDecomposition::exact(&Array2::<f64>::eye(3)).unwrap();
        let mut rng = Xoshiro256Plus::seed_from_u64(0);
        assert!(matches!(
            decomp.sample(&Array1::zeros(4), 2, &mut rng),
            Err(LinopsError::ShapeError { .. })
        ));
        assert_eq!(decomp.sample(&Array1::zeros(3), 5, &mut rng).unwrap().dim(), (3, 5));
    }

    #[test]
    fn test_sample_mvn_shape_error() {
        let op = LazyMatrix::<f64>::identity(3);
        let mut rng = Xoshiro256Plus::seed_from_u64(0);
        assert!(matches!(
            sample_mvn(&Array1::zeros(4), &op, 2, 1, &mut rng),
            Err(LinopsError::ShapeError { .. })
        ));
    }
}
