use thiserror::Error;

/// A result type for matrix-free linear algebra operations
pub type Result<T> = std::result::Result<T, LinopsError>;

/// An error when building or applying a [`LazyMatrix`](crate::LazyMatrix) or running
/// one of the iterative algorithms against it
#[derive(Error, Debug)]
pub enum LinopsError {
    /// When operand dimensions do not match
    #[error("Shape error in {operation}: expected {expected:?}, got {actual:?}")]
    ShapeError {
        /// Operation which detected the mismatch
        operation: &'static str,
        /// Shape required by the operator
        expected: (usize, usize),
        /// Shape actually given
        actual: (usize, usize),
    },
    /// When a dense evaluation would allocate more than the safety threshold
    #[error("Size error: dense evaluation of a ({rows}, {cols}) matrix exceeds the limit of {limit} elements")]
    SizeError {
        /// Number of rows of the lazy matrix
        rows: usize,
        /// Number of columns of the lazy matrix
        cols: usize,
        /// Maximum number of elements allowed
        limit: usize,
    },
    /// When an iterative solve exhausted its budget (strict mode only)
    #[error("Non convergence after {iterations} iterations: residual {residual:e} > tolerance {tolerance:e}")]
    NonConvergence {
        /// Iterations used
        iterations: usize,
        /// Worst relative residual norm over right-hand sides
        residual: f64,
        /// Requested relative tolerance
        tolerance: f64,
    },
    /// When a Ritz value is too negative to be explained by round-off
    #[error("Numerical domain error: eigenvalue {eigenvalue:e} below tolerated floor {floor:e}")]
    NumericalDomainError {
        /// Offending eigenvalue
        eigenvalue: f64,
        /// Most negative value accepted before clipping
        floor: f64,
    },
    /// When error due to a bad value
    #[error("InvalidValue error: {0}")]
    InvalidValueError(String),
    /// When dense linear algebra computation fails
    #[error(transparent)]
    LinalgError(#[from] linfa_linalg::LinalgError),
}
