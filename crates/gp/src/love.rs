//! Fast predictive variances with Lanczos variance estimates (LOVE).
//!
//! A [PredictiveCache] is built once from the trained covariance `K` and the
//! training outputs: with `α = K⁻¹ y` from PCG and a Lanczos decomposition of
//! `K` started from `α`, the inverse root `R` satisfies `K⁻¹ ≈ R Rᵀ`. The
//! posterior variance at `x*` is then `k(x*, x*) - ‖k(x*, X) R‖²`.
//!
//! For interpolated covariances `k(x*, X) = w(x*)ᵀ K_grid Wᵀ`, so the cache
//! stores `K_grid Wᵀ α` and `K_grid Wᵀ R` and a query only touches the 4^d
//! interpolation weights of `x*`.
//!
//! A cache is immutable. It records the [HyperFingerprint] of the model it was
//! built from and is checked against the current one before every use.

use crate::errors::{GpError, Result};
use crate::hyperparameters::Hyperparameters;
use linfa::Float;
use log::{debug, warn};
use ndarray::{Array1, Array2, Axis, Zip};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use skigp_linops::{cg, CgParams, LazyMatrix, LinopsError, RootDecomposition, SparseInterpolation};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::Instant;

/// Identity of a set of hyperparameters: a version counter bumped on every
/// change plus a digest of the hyperparameter bits
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct HyperFingerprint {
    version: u64,
    digest: u64,
}

impl HyperFingerprint {
    /// Fingerprint of `hyper` at a given model `version`
    pub fn new<F: Float>(version: u64, hyper: &Hyperparameters<F>) -> Self {
        let mut hasher = DefaultHasher::new();
        let bits = |v: &F| v.to_f64().unwrap_or(f64::NAN).to_bits();
        hyper.theta.iter().for_each(|t| bits(t).hash(&mut hasher));
        bits(&hyper.sigma2).hash(&mut hasher);
        bits(&hyper.noise).hash(&mut hasher);
        HyperFingerprint {
            version,
            digest: hasher.finish(),
        }
    }

    /// Model version
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Digest of the hyperparameter values
    pub fn digest(&self) -> u64 {
        self.digest
    }
}

impl fmt::Display for HyperFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "version {} (digest {:016x})", self.version, self.digest)
    }
}

/// Covariance path a cache was built for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum CacheKind {
    /// Factors projected on the inducing grid, queried with interpolation weights
    Interpolated,
    /// Factors on the training points, queried with any lazy cross-covariance
    Lazy,
}

/// Covariance between query points and training points
#[derive(Clone, Debug)]
pub enum CrossCovariance<F: Float> {
    /// `k(x*, X) = w(x*)ᵀ K_grid Wᵀ`, given by the interpolation weights of `x*`
    Interpolated {
        /// Interpolation of the query points on the inducing grid
        weights: SparseInterpolation<F>,
        /// Prior variance `k(x*, x*)` of every query point
        prior_variance: Array1<F>,
    },
    /// `k(x*, X)` as a (n*, n) lazy matrix
    Lazy {
        /// Cross-covariance operator
        matrix: LazyMatrix<F>,
        /// Prior variance `k(x*, x*)` of every query point
        prior_variance: Array1<F>,
    },
}

impl<F: Float> CrossCovariance<F> {
    /// Number of query points
    pub fn nrows(&self) -> usize {
        self.prior_variance().len()
    }

    /// Prior variance of the query points
    pub fn prior_variance(&self) -> &Array1<F> {
        match self {
            CrossCovariance::Interpolated { prior_variance, .. } => prior_variance,
            CrossCovariance::Lazy { prior_variance, .. } => prior_variance,
        }
    }

    fn kind(&self) -> CacheKind {
        match self {
            CrossCovariance::Interpolated { .. } => CacheKind::Interpolated,
            CrossCovariance::Lazy { .. } => CacheKind::Lazy,
        }
    }
}

/// Precomputed mean and variance factors of a trained model
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct PredictiveCache<F: Float> {
    fingerprint: HyperFingerprint,
    kind: CacheKind,
    mean_cache: Array1<F>,
    variance_root: Array2<F>,
    converged: bool,
}

/// `α = K⁻¹ y` and the inverse root `R` of `K` from `rank` Lanczos steps started at `α`
fn love_factors<F: Float>(
    train_cov: &LazyMatrix<F>,
    y: &Array1<F>,
    rank: usize,
    cg_params: &CgParams,
    seed: u64,
) -> Result<(Array2<F>, Array2<F>, bool)> {
    let rhs = y.view().insert_axis(Axis(1));
    let solve = cg::solve(train_cov, &rhs, None, cg_params)?;
    let alpha = solve.solution;
    let root = if alpha.iter().all(|v| *v == F::zero()) {
        debug!("LOVE: zero mean weights, Lanczos started from a random vector");
        RootDecomposition::lanczos(train_cov, rank, seed)?
    } else {
        RootDecomposition::lanczos_from(train_cov, &alpha, rank)?
    };
    Ok((alpha, root.inverse(), solve.converged))
}

impl<F: Float> PredictiveCache<F> {
    /// Builds the cache of a covariance queried through lazy cross-covariances.
    ///
    /// `train_cov` is the covariance of the training outputs `y` (noise included).
    pub fn build(
        fingerprint: HyperFingerprint,
        train_cov: &LazyMatrix<F>,
        y: &Array1<F>,
        rank: usize,
        cg_params: &CgParams,
        seed: u64,
    ) -> Result<Self> {
        let now = Instant::now();
        let (alpha, inv_root, converged) = love_factors(train_cov, y, rank, cg_params, seed)?;
        let cache = PredictiveCache {
            fingerprint,
            kind: CacheKind::Lazy,
            mean_cache: alpha.column(0).to_owned(),
            variance_root: inv_root,
            converged,
        };
        debug!(
            "LOVE cache of rank {} built ({} ms)",
            cache.rank(),
            now.elapsed().as_millis()
        );
        Ok(cache)
    }

    /// Builds the cache of an interpolated covariance `W K_grid Wᵀ + D`, the
    /// factors being projected on the grid through `K_grid Wᵀ`
    #[allow(clippy::too_many_arguments)]
    pub fn build_interpolated(
        fingerprint: HyperFingerprint,
        train_cov: &LazyMatrix<F>,
        y: &Array1<F>,
        weights: &SparseInterpolation<F>,
        grid_cov: &LazyMatrix<F>,
        rank: usize,
        cg_params: &CgParams,
        seed: u64,
    ) -> Result<Self> {
        let now = Instant::now();
        let (alpha, inv_root, converged) = love_factors(train_cov, y, rank, cg_params, seed)?;
        let mean_cache = grid_cov.matmul(&weights.apply_t(alpha.view()))?;
        let variance_root = grid_cov.matmul(&weights.apply_t(inv_root.view()))?;
        let cache = PredictiveCache {
            fingerprint,
            kind: CacheKind::Interpolated,
            mean_cache: mean_cache.column(0).to_owned(),
            variance_root,
            converged,
        };
        debug!(
            "LOVE cache of rank {} on {} grid points built ({} ms)",
            cache.rank(),
            grid_cov.nrows(),
            now.elapsed().as_millis()
        );
        Ok(cache)
    }

    /// Fingerprint of the hyperparameters the cache was built with
    pub fn fingerprint(&self) -> HyperFingerprint {
        self.fingerprint
    }

    /// Covariance path of the cache
    pub fn kind(&self) -> CacheKind {
        self.kind
    }

    /// Rank of the variance factor
    pub fn rank(&self) -> usize {
        self.variance_root.ncols()
    }

    /// Whether the PCG solve of the mean weights converged
    pub fn converged(&self) -> bool {
        self.converged
    }

    /// Fails with [GpError::StaleCacheError] unless `current` is the
    /// fingerprint the cache was built with
    pub fn check(&self, current: HyperFingerprint) -> Result<()> {
        if self.fingerprint != current {
            warn!(
                "Predictive cache built for {} queried at {}",
                self.fingerprint, current
            );
            return Err(GpError::StaleCacheError {
                built: self.fingerprint,
                current,
            });
        }
        Ok(())
    }

    fn check_kind(&self, cross: &CrossCovariance<F>) -> Result<()> {
        if cross.kind() != self.kind {
            return Err(GpError::InvalidValueError(format!(
                "{:?} cross-covariance given to a cache built for {:?} covariance",
                cross.kind(),
                self.kind
            )));
        }
        Ok(())
    }

    /// `q(x*) = k(x*, X) R` of shape (n*, rank)
    fn project(&self, cross: &CrossCovariance<F>, factor: &Array2<F>) -> Result<Array2<F>> {
        self.check_kind(cross)?;
        match cross {
            CrossCovariance::Interpolated { weights, .. } => {
                let (n, m) = weights.dim();
                if m != factor.nrows() {
                    return Err(LinopsError::ShapeError {
                        operation: "love_query",
                        expected: (n, factor.nrows()),
                        actual: (n, m),
                    }
                    .into());
                }
                Ok(weights.apply(factor.view()))
            }
            CrossCovariance::Lazy { matrix, .. } => Ok(matrix.matmul(factor)?),
        }
    }

    /// Posterior mean `k(x*, X) K⁻¹ y`.
    ///
    /// `current` is the fingerprint of the model hyperparameters, the query
    /// fails with [GpError::StaleCacheError] when the cache was built for others.
    pub fn mean(&self, current: HyperFingerprint, cross: &CrossCovariance<F>) -> Result<Array1<F>> {
        self.check(current)?;
        let mean_cache = self.mean_cache.view().insert_axis(Axis(1)).to_owned();
        Ok(self.project(cross, &mean_cache)?.column(0).to_owned())
    }

    /// Low-rank factor `q(x*)` of the variance reduction, `k(x*, X) K⁻¹ k(X, x*) ≈ q qᵀ`
    pub fn variance_factor(
        &self,
        current: HyperFingerprint,
        cross: &CrossCovariance<F>,
    ) -> Result<Array2<F>> {
        self.check(current)?;
        self.project(cross, &self.variance_root)
    }

    /// Posterior variance `k(x*, x*) - ‖k(x*, X) R‖²`, floored at 0
    pub fn variance(
        &self,
        current: HyperFingerprint,
        cross: &CrossCovariance<F>,
    ) -> Result<Array1<F>> {
        let q = self.variance_factor(current, cross)?;
        let mut variance = cross.prior_variance().to_owned();
        Zip::from(&mut variance)
            .and(q.rows())
            .for_each(|v, qi| *v = (*v - qi.dot(&qi)).max(F::zero()));
        Ok(variance)
    }
}
