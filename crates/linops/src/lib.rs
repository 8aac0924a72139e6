//! Matrix-free linear algebra for scalable Gaussian process kernels.
//!
//! Kernel matrices are represented as [LazyMatrix] trees: only their action on
//! blocks of vectors is computed, through structure (Toeplitz, Kronecker,
//! sparse interpolation, low rank, ...) whenever possible. On top of this
//! abstraction the crate provides:
//!
//! * batched preconditioned conjugate gradient ([cg::solve]) with a pivoted
//!   Cholesky preconditioner ([Preconditioner]),
//! * batched Lanczos tridiagonalization ([lanczos::lanczos]),
//! * stochastic Lanczos quadrature for traces and log determinants
//!   ([slq::log_det], [slq::log_det_and_grad]),
//! * low-rank root decompositions and sampling ([RootDecomposition], [sample_mvn]).
//!
//! Every algorithm is generic over [Scalar]. Running it on [Dual] numbers
//! gives the derivative of its result along one direction.
#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]
mod dual;
mod errors;
mod fft;
mod interpolation;
mod lazy;
mod parameters;
mod scalar;
mod toeplitz;

pub mod cg;
pub mod dense;
pub mod lanczos;
pub mod preconditioner;
pub mod probes;
pub mod root;
pub mod slq;
pub mod tridiagonal;

pub use cg::{CgSolution, ConvergenceStatus};
pub use dual::Dual;
pub use errors::*;
pub use interpolation::SparseInterpolation;
pub use lazy::*;
pub use parameters::*;
pub use preconditioner::Preconditioner;
pub use probes::ProbeDistribution;
pub use root::{sample_mvn, RootDecomposition};
pub use scalar::Scalar;
pub use slq::{InvQuadLogDet, InvQuadLogDetEstimate, LogDetEstimate};
pub use toeplitz::{SymmetricToeplitz, TOEPLITZ_FFT_THRESHOLD};
