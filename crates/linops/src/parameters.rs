use crate::errors::{LinopsError, Result};
use crate::probes::ProbeDistribution;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// Default relative residual tolerance of PCG
pub const CG_DEFAULT_TOLERANCE: f64 = 1e-6;
/// Default rank of the pivoted Cholesky preconditioner
pub const CG_DEFAULT_PRECONDITIONER_RANK: usize = 15;
/// PCG iteration budget per unit of preconditioner rank
pub const CG_ITERATIONS_PER_RANK: usize = 20;
/// Default number of stochastic probes
pub const SLQ_DEFAULT_N_PROBES: usize = 10;
/// Default number of Lanczos steps per probe
pub const SLQ_DEFAULT_LANCZOS_STEPS: usize = 30;
/// Upper bound on Lanczos steps, limiting loss of orthogonality
pub const MAX_LANCZOS_STEPS: usize = 200;
/// Default seed of probe generation
pub const DEFAULT_SEED: u64 = 42;

/// Preconditioned conjugate gradient settings
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct CgParams {
    /// Relative residual `‖r‖ / ‖b‖` below which a column has converged
    pub tolerance: f64,
    /// Iteration cap, the solver's built-in timeout
    pub max_iterations: usize,
    /// Rank of the pivoted Cholesky preconditioner, 0 disables it
    pub preconditioner_rank: usize,
}

impl Default for CgParams {
    fn default() -> Self {
        CgParams::with_preconditioner_rank(CG_DEFAULT_PRECONDITIONER_RANK)
    }
}

impl CgParams {
    /// Settings with the iteration budget derived from the preconditioner rank
    pub fn with_preconditioner_rank(rank: usize) -> Self {
        CgParams {
            tolerance: CG_DEFAULT_TOLERANCE,
            max_iterations: CG_ITERATIONS_PER_RANK * rank.max(1),
            preconditioner_rank: rank,
        }
    }

    /// Set tolerance
    pub fn tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Set iteration cap
    pub fn max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Check settings consistency
    pub fn check(&self) -> Result<()> {
        if !(self.tolerance > 0.) {
            return Err(LinopsError::InvalidValueError(format!(
                "CG tolerance should be positive, got {}",
                self.tolerance
            )));
        }
        if self.max_iterations == 0 {
            return Err(LinopsError::InvalidValueError(
                "CG max iterations should be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Stochastic Lanczos quadrature settings
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct SlqParams {
    /// Number of probe vectors
    pub n_probes: usize,
    /// Lanczos steps per probe
    pub lanczos_steps: usize,
    /// Probe entries distribution
    pub distribution: ProbeDistribution,
    /// Seed of probe generation
    pub seed: u64,
}

impl Default for SlqParams {
    fn default() -> Self {
        SlqParams {
            n_probes: SLQ_DEFAULT_N_PROBES,
            lanczos_steps: SLQ_DEFAULT_LANCZOS_STEPS,
            distribution: ProbeDistribution::default(),
            seed: DEFAULT_SEED,
        }
    }
}

impl SlqParams {
    /// Set number of probes
    pub fn n_probes(mut self, n_probes: usize) -> Self {
        self.n_probes = n_probes;
        self
    }

    /// Set number of Lanczos steps
    pub fn lanczos_steps(mut self, lanczos_steps: usize) -> Self {
        self.lanczos_steps = lanczos_steps;
        self
    }

    /// Set probe distribution
    pub fn distribution(mut self, distribution: ProbeDistribution) -> Self {
        self.distribution = distribution;
        self
    }

    /// Set probe seed
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Check settings consistency
    pub fn check(&self) -> Result<()> {
        if self.n_probes == 0 {
            return Err(LinopsError::InvalidValueError(
                "number of probes should be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_budget_follows_rank() {
        let p = CgParams::default();
        assert_eq!(p.max_iterations, 300);
        assert_eq!(CgParams::with_preconditioner_rank(0).max_iterations, 20);
        assert!(p.clone().tolerance(0.).check().is_err());
        assert!(p.max_iterations(0).check().is_err());
        assert!(SlqParams::default().n_probes(0).check().is_err());
    }
}
