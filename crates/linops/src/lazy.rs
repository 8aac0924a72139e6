//! Lazily evaluated matrices.
//!
//! A [`LazyMatrix`] is a tree of structured nodes. Only its action on a block
//! of vectors is ever computed: every composite node implements its product by
//! dispatching to the products of its children, never by evaluating them.
//! Children are shared through `Arc`, so the same kernel operator may appear
//! in several parents at no cost.

use crate::errors::{LinopsError, Result};
use crate::interpolation::SparseInterpolation;
use crate::scalar::Scalar;
use num_traits::Zero;
use crate::toeplitz::SymmetricToeplitz;

use ndarray::{concatenate, s, Array1, Array2, ArrayBase, ArrayView2, Axis, Data, Ix1, Ix2, Zip};
use std::fmt;
use std::sync::Arc;

/// Largest number of elements `evaluate()` will allocate (2^24, 128MiB of f64)
pub const DEFAULT_MAX_DENSE_ELEMENTS: usize = 1 << 24;

/// Number of identity columns pushed through an operator at once when
/// a dense evaluation or a diagonal falls back to products
const EVALUATION_BLOCK: usize = 256;

/// Entry generator of a [`LazyMatrix::from_fn`] operator
pub type EntryFn<S> = Arc<dyn Fn(usize, usize) -> S + Send + Sync>;

/// Structural properties carried along composition
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StructureTags {
    /// `A = Aᵀ`
    pub symmetric: bool,
    /// `vᵀ A v >= 0` for all `v`
    pub positive_semidefinite: bool,
    /// `vᵀ A v > 0` for all `v != 0`
    pub positive_definite: bool,
}

impl StructureTags {
    /// No known structure
    pub const GENERAL: StructureTags = StructureTags {
        symmetric: false,
        positive_semidefinite: false,
        positive_definite: false,
    };
    /// Symmetric only
    pub const SYMMETRIC: StructureTags = StructureTags {
        symmetric: true,
        positive_semidefinite: false,
        positive_definite: false,
    };
    /// Symmetric positive semi-definite, e.g. a kernel matrix
    pub const PSD: StructureTags = StructureTags {
        symmetric: true,
        positive_semidefinite: true,
        positive_definite: false,
    };
    /// Symmetric positive definite
    pub const SPD: StructureTags = StructureTags {
        symmetric: true,
        positive_semidefinite: true,
        positive_definite: true,
    };

    fn all(tags: impl Iterator<Item = StructureTags>) -> StructureTags {
        tags.fold(Self::SPD, |acc, t| StructureTags {
            symmetric: acc.symmetric && t.symmetric,
            positive_semidefinite: acc.positive_semidefinite && t.positive_semidefinite,
            positive_definite: acc.positive_definite && t.positive_definite,
        })
    }
}

/// Kind of the root node of a [`LazyMatrix`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LazyKind {
    /// Dense array
    Dense,
    /// Diagonal
    Diagonal,
    /// Multiple of the identity
    ConstantDiagonal,
    /// Entries computed on the fly
    Function,
    /// Symmetric Toeplitz
    Toeplitz,
    /// Kronecker product
    Kronecker,
    /// Sum
    Sum,
    /// Matrix product chain
    Product,
    /// Elementwise product with a low-rank factored matrix
    Hadamard,
    /// Block diagonal
    BlockDiag,
    /// Matrix plus diagonal
    AddedDiag,
    /// Matrix times scalar
    Scaled,
    /// `R Rᵀ`
    LowRank,
    /// `W_l K W_rᵀ`
    Interpolated,
}

enum LazyNode<S: Scalar> {
    Dense(Array2<S>),
    Diagonal(Array1<S>),
    ConstantDiagonal(S),
    Function(EntryFn<S>),
    Toeplitz(SymmetricToeplitz<S>),
    Kronecker(Vec<LazyMatrix<S>>),
    Sum(Vec<LazyMatrix<S>>),
    Product(Vec<LazyMatrix<S>>),
    Hadamard {
        left: LazyMatrix<S>,
        root: Array2<S>,
    },
    BlockDiag(Vec<LazyMatrix<S>>),
    AddedDiag {
        base: LazyMatrix<S>,
        diag: Array1<S>,
    },
    Scaled {
        base: LazyMatrix<S>,
        scale: S,
    },
    LowRank(Array2<S>),
    Interpolated {
        left: Arc<SparseInterpolation<S::Real>>,
        base: LazyMatrix<S>,
        right: Arc<SparseInterpolation<S::Real>>,
    },
}

/// A matrix known through its action on vectors
#[derive(Clone)]
pub struct LazyMatrix<S: Scalar> {
    node: Arc<LazyNode<S>>,
    shape: (usize, usize),
    tags: StructureTags,
}

impl<S: Scalar> fmt::Debug for LazyMatrix<S> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LazyMatrix")
            .field("kind", &self.kind())
            .field("shape", &self.shape)
            .field("tags", &self.tags)
            .finish()
    }
}

fn shape_error(operation: &'static str, expected: (usize, usize), actual: (usize, usize)) -> LinopsError {
    LinopsError::ShapeError {
        operation,
        expected,
        actual,
    }
}

impl<S: Scalar> LazyMatrix<S> {
    fn from_node(node: LazyNode<S>, shape: (usize, usize), tags: StructureTags) -> Self {
        LazyMatrix {
            node: Arc::new(node),
            shape,
            tags,
        }
    }

    /// Wraps a dense array. Symmetry is detected, definiteness is not
    /// (see [`LazyMatrix::with_tags`]).
    pub fn dense(a: Array2<S>) -> Self {
        let shape = a.dim();
        let symmetric = shape.0 == shape.1
            && (0..shape.0).all(|i| (0..i).all(|j| a[[i, j]] == a[[j, i]]));
        let tags = if symmetric {
            StructureTags::SYMMETRIC
        } else {
            StructureTags::GENERAL
        };
        Self::from_node(LazyNode::Dense(a), shape, tags)
    }

    /// Diagonal matrix
    pub fn diagonal_matrix(d: Array1<S>) -> Self {
        let n = d.len();
        let zero = S::Real::zero();
        let tags = StructureTags {
            symmetric: true,
            positive_semidefinite: d.iter().all(|v| v.re() >= zero),
            positive_definite: d.iter().all(|v| v.re() > zero),
        };
        Self::from_node(LazyNode::Diagonal(d), (n, n), tags)
    }

    /// `value * I` of size `n`
    pub fn constant_diagonal(value: S, n: usize) -> Self {
        let zero = S::Real::zero();
        let tags = StructureTags {
            symmetric: true,
            positive_semidefinite: value.re() >= zero,
            positive_definite: value.re() > zero,
        };
        Self::from_node(LazyNode::ConstantDiagonal(value), (n, n), tags)
    }

    /// Identity of size `n`
    pub fn identity(n: usize) -> Self {
        Self::constant_diagonal(S::one(), n)
    }

    /// Matrix whose entries are computed on demand by `f(i, j)`.
    /// Nothing is stored: a product costs `rows * cols` calls to `f`.
    pub fn from_fn<G>(rows: usize, cols: usize, tags: StructureTags, f: G) -> Self
    where
        G: Fn(usize, usize) -> S + Send + Sync + 'static,
    {
        let tags = if rows == cols {
            tags
        } else {
            StructureTags::GENERAL
        };
        Self::from_node(LazyNode::Function(Arc::new(f)), (rows, cols), tags)
    }

    /// Symmetric Toeplitz matrix from its first column
    pub fn toeplitz(column: Array1<S>) -> Self {
        let m = column.len();
        Self::from_node(
            LazyNode::Toeplitz(SymmetricToeplitz::new(column)),
            (m, m),
            StructureTags::SYMMETRIC,
        )
    }

    /// Kronecker product `A_1 ⊗ A_2 ⊗ ... ⊗ A_d`, the first factor varying slowest
    pub fn kronecker(factors: Vec<LazyMatrix<S>>) -> Result<Self> {
        if factors.is_empty() {
            return Err(LinopsError::InvalidValueError(
                "kronecker product of no factor".to_string(),
            ));
        }
        if factors.len() == 1 {
            return Ok(factors[0].clone());
        }
        let rows = factors.iter().map(|f| f.nrows()).product();
        let cols = factors.iter().map(|f| f.ncols()).product();
        let tags = StructureTags::all(factors.iter().map(|f| f.tags));
        Ok(Self::from_node(LazyNode::Kronecker(factors), (rows, cols), tags))
    }

    /// Sum of same-shaped matrices
    pub fn sum(terms: Vec<LazyMatrix<S>>) -> Result<Self> {
        let first = terms.first().ok_or_else(|| {
            LinopsError::InvalidValueError("sum of no term".to_string())
        })?;
        let shape = first.shape;
        if let Some(bad) = terms.iter().find(|t| t.shape != shape) {
            return Err(shape_error("sum", shape, bad.shape));
        }
        let tags = StructureTags::all(terms.iter().map(|t| t.tags));
        // one definite term is enough once all are semi-definite
        let tags = StructureTags {
            positive_definite: tags.positive_semidefinite
                && terms.iter().any(|t| t.tags.positive_definite),
            ..tags
        };
        Ok(Self::from_node(LazyNode::Sum(terms), shape, tags))
    }

    /// Product chain `A_1 A_2 ... A_k`
    pub fn product(factors: Vec<LazyMatrix<S>>) -> Result<Self> {
        let first = factors.first().ok_or_else(|| {
            LinopsError::InvalidValueError("product of no factor".to_string())
        })?;
        let rows = first.nrows();
        let mut inner = first.ncols();
        for f in factors.iter().skip(1) {
            if f.nrows() != inner {
                return Err(shape_error("product", (inner, f.ncols()), f.shape));
            }
            inner = f.ncols();
        }
        if factors.len() == 1 {
            return Ok(factors[0].clone());
        }
        Ok(Self::from_node(
            LazyNode::Product(factors),
            (rows, inner),
            StructureTags::GENERAL,
        ))
    }

    /// Elementwise product `A ∘ (R Rᵀ)` of a square matrix with a
    /// matrix given by a low-rank root `R` of shape `(n, q)`
    pub fn hadamard(left: LazyMatrix<S>, root: Array2<S>) -> Result<Self> {
        let n = left.nrows();
        if !left.is_square() {
            return Err(shape_error("hadamard", (n, n), left.shape));
        }
        if root.nrows() != n {
            return Err(shape_error("hadamard", (n, root.ncols()), root.dim()));
        }
        let zero = S::Real::zero();
        let nonzero_rows = root
            .rows()
            .into_iter()
            .all(|r| r.iter().any(|v| v.re() != zero));
        let tags = StructureTags {
            symmetric: left.tags.symmetric,
            positive_semidefinite: left.tags.positive_semidefinite,
            positive_definite: left.tags.positive_definite && nonzero_rows,
        };
        Ok(Self::from_node(
            LazyNode::Hadamard { left, root },
            (n, n),
            tags,
        ))
    }

    /// Block diagonal matrix, the natural layout of a batch of independent operators
    pub fn block_diag(blocks: Vec<LazyMatrix<S>>) -> Result<Self> {
        if blocks.is_empty() {
            return Err(LinopsError::InvalidValueError(
                "block diagonal of no block".to_string(),
            ));
        }
        let rows = blocks.iter().map(|b| b.nrows()).sum();
        let cols = blocks.iter().map(|b| b.ncols()).sum();
        let tags = if blocks.iter().all(|b| b.is_square()) {
            StructureTags::all(blocks.iter().map(|b| b.tags))
        } else {
            StructureTags::GENERAL
        };
        Ok(Self::from_node(LazyNode::BlockDiag(blocks), (rows, cols), tags))
    }

    /// Low-rank symmetric matrix `R Rᵀ`
    pub fn low_rank(root: Array2<S>) -> Self {
        let n = root.nrows();
        Self::from_node(LazyNode::LowRank(root), (n, n), StructureTags::PSD)
    }

    /// Interpolated operator `W_l K W_rᵀ`
    pub fn interpolated(
        left: Arc<SparseInterpolation<S::Real>>,
        base: LazyMatrix<S>,
        right: Arc<SparseInterpolation<S::Real>>,
    ) -> Result<Self> {
        let (n, ml) = left.dim();
        let (p, mr) = right.dim();
        if base.shape != (ml, mr) {
            return Err(shape_error("interpolated", (ml, mr), base.shape));
        }
        let tags = if Arc::ptr_eq(&left, &right) {
            StructureTags {
                positive_definite: false,
                ..base.tags
            }
        } else {
            StructureTags::GENERAL
        };
        Ok(Self::from_node(
            LazyNode::Interpolated { left, base, right },
            (n, p),
            tags,
        ))
    }

    /// `self + diag(d)`
    pub fn add_diag(&self, diag: Array1<S>) -> Result<Self> {
        let n = self.nrows();
        if !self.is_square() {
            return Err(shape_error("add_diag", (n, n), self.shape));
        }
        if diag.len() != n {
            return Err(shape_error("add_diag", (n, 1), (diag.len(), 1)));
        }
        let zero = S::Real::zero();
        let nonneg = diag.iter().all(|v| v.re() >= zero);
        let positive = diag.iter().all(|v| v.re() > zero);
        let tags = StructureTags {
            symmetric: self.tags.symmetric,
            positive_semidefinite: self.tags.positive_semidefinite && nonneg,
            positive_definite: (self.tags.positive_definite && nonneg)
                || (self.tags.positive_semidefinite && positive),
        };
        Ok(Self::from_node(
            LazyNode::AddedDiag {
                base: self.clone(),
                diag,
            },
            self.shape,
            tags,
        ))
    }

    /// `self + value * I`, used for noise and jitter
    pub fn add_constant_diag(&self, value: S) -> Result<Self> {
        self.add_diag(Array1::from_elem(self.nrows(), value))
    }

    /// `scale * self`
    pub fn scaled(&self, scale: S) -> Self {
        let tags = if scale.re() > S::Real::zero() {
            self.tags
        } else {
            StructureTags {
                symmetric: self.tags.symmetric,
                ..StructureTags::GENERAL
            }
        };
        Self::from_node(
            LazyNode::Scaled {
                base: self.clone(),
                scale,
            },
            self.shape,
            tags,
        )
    }

    /// Overrides the structure tags, for operators known to be
    /// definite by construction (e.g. a kernel matrix)
    pub fn with_tags(mut self, tags: StructureTags) -> Self {
        self.tags = tags;
        self
    }

    /// Shape `(rows, cols)`
    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    /// Number of rows
    pub fn nrows(&self) -> usize {
        self.shape.0
    }

    /// Number of columns
    pub fn ncols(&self) -> usize {
        self.shape.1
    }

    /// Square matrix
    pub fn is_square(&self) -> bool {
        self.shape.0 == self.shape.1
    }

    /// Structure tags
    pub fn tags(&self) -> StructureTags {
        self.tags
    }

    /// Kind of root node
    pub fn kind(&self) -> LazyKind {
        match self.node.as_ref() {
            LazyNode::Dense(_) => LazyKind::Dense,
            LazyNode::Diagonal(_) => LazyKind::Diagonal,
            LazyNode::ConstantDiagonal(_) => LazyKind::ConstantDiagonal,
            LazyNode::Function(_) => LazyKind::Function,
            LazyNode::Toeplitz(_) => LazyKind::Toeplitz,
            LazyNode::Kronecker(_) => LazyKind::Kronecker,
            LazyNode::Sum(_) => LazyKind::Sum,
            LazyNode::Product(_) => LazyKind::Product,
            LazyNode::Hadamard { .. } => LazyKind::Hadamard,
            LazyNode::BlockDiag(_) => LazyKind::BlockDiag,
            LazyNode::AddedDiag { .. } => LazyKind::AddedDiag,
            LazyNode::Scaled { .. } => LazyKind::Scaled,
            LazyNode::LowRank(_) => LazyKind::LowRank,
            LazyNode::Interpolated { .. } => LazyKind::Interpolated,
        }
    }

    /// Splits `self` as `(base, diag)` when it is a matrix plus a diagonal
    pub fn split_added_diag(&self) -> Option<(&LazyMatrix<S>, &Array1<S>)> {
        match self.node.as_ref() {
            LazyNode::AddedDiag { base, diag } => Some((base, diag)),
            _ => None,
        }
    }

    /// Computes `A X` for `X` of shape `(cols, k)`
    pub fn matmul(&self, rhs: &ArrayBase<impl Data<Elem = S>, Ix2>) -> Result<Array2<S>> {
        if rhs.nrows() != self.ncols() {
            return Err(shape_error("matmul", (self.ncols(), rhs.ncols()), rhs.dim()));
        }
        Ok(self.apply(rhs.view()))
    }

    /// Computes `A v`
    pub fn matvec(&self, v: &ArrayBase<impl Data<Elem = S>, Ix1>) -> Result<Array1<S>> {
        let col = v.view().insert_axis(Axis(1));
        Ok(self.matmul(&col)?.remove_axis(Axis(1)))
    }

    /// Computes `Aᵀ X` for `X` of shape `(rows, k)`
    pub fn t_matmul(&self, rhs: &ArrayBase<impl Data<Elem = S>, Ix2>) -> Result<Array2<S>> {
        if rhs.nrows() != self.nrows() {
            return Err(shape_error("t_matmul", (self.nrows(), rhs.ncols()), rhs.dim()));
        }
        Ok(self.apply_t(rhs.view()))
    }

    pub(crate) fn apply(&self, x: ArrayView2<S>) -> Array2<S> {
        match self.node.as_ref() {
            LazyNode::Dense(a) => a.dot(&x),
            LazyNode::Diagonal(d) => {
                let mut out = x.to_owned();
                Zip::from(out.rows_mut())
                    .and(d)
                    .for_each(|mut row, &di| row.mapv_inplace(|v| v * di));
                out
            }
            LazyNode::ConstantDiagonal(c) => x.mapv(|v| v * *c),
            LazyNode::Function(f) => {
                let (rows, cols) = self.shape;
                let mut out = Array2::zeros((rows, x.ncols()));
                Zip::indexed(out.rows_mut()).par_for_each(|i, mut row| {
                    for j in 0..cols {
                        let kij = f(i, j);
                        Zip::from(&mut row)
                            .and(x.row(j))
                            .for_each(|o, &v| *o += kij * v);
                    }
                });
                out
            }
            LazyNode::Toeplitz(t) => t.apply(x),
            LazyNode::Kronecker(factors) => kronecker_apply(factors, x, false),
            LazyNode::Sum(terms) => {
                let mut out = terms[0].apply(x);
                for t in terms.iter().skip(1) {
                    out += &t.apply(x);
                }
                out
            }
            LazyNode::Product(factors) => {
                let mut out = x.to_owned();
                for f in factors.iter().rev() {
                    out = f.apply(out.view());
                }
                out
            }
            LazyNode::Hadamard { left, root } => hadamard_apply(left, root, x, false),
            LazyNode::BlockDiag(blocks) => {
                let mut out = Array2::zeros((self.nrows(), x.ncols()));
                let (mut r0, mut c0) = (0, 0);
                for b in blocks {
                    let (r, c) = b.shape;
                    let y = b.apply(x.slice(s![c0..c0 + c, ..]));
                    out.slice_mut(s![r0..r0 + r, ..]).assign(&y);
                    r0 += r;
                    c0 += c;
                }
                out
            }
            LazyNode::AddedDiag { base, diag } => {
                let mut out = base.apply(x);
                Zip::from(out.rows_mut())
                    .and(x.rows())
                    .and(diag)
                    .for_each(|mut o, xi, &di| o.zip_mut_with(&xi, |a, &b| *a += di * b));
                out
            }
            LazyNode::Scaled { base, scale } => {
                let mut out = base.apply(x);
                out.mapv_inplace(|v| v * *scale);
                out
            }
            LazyNode::LowRank(r) => r.dot(&r.t().dot(&x)),
            LazyNode::Interpolated { left, base, right } => {
                let wtx = right.apply_t(x);
                let kw = base.apply(wtx.view());
                left.apply(kw.view())
            }
        }
    }

    pub(crate) fn apply_t(&self, x: ArrayView2<S>) -> Array2<S> {
        if self.tags.symmetric {
            return self.apply(x);
        }
        match self.node.as_ref() {
            LazyNode::Dense(a) => a.t().dot(&x),
            LazyNode::Function(f) => {
                let (rows, cols) = self.shape;
                let mut out = Array2::zeros((cols, x.ncols()));
                Zip::indexed(out.rows_mut()).par_for_each(|j, mut row| {
                    for i in 0..rows {
                        let kij = f(i, j);
                        Zip::from(&mut row)
                            .and(x.row(i))
                            .for_each(|o, &v| *o += kij * v);
                    }
                });
                out
            }
            LazyNode::Kronecker(factors) => kronecker_apply(factors, x, true),
            LazyNode::Sum(terms) => {
                let mut out = terms[0].apply_t(x);
                for t in terms.iter().skip(1) {
                    out += &t.apply_t(x);
                }
                out
            }
            LazyNode::Product(factors) => {
                let mut out = x.to_owned();
                for f in factors.iter() {
                    out = f.apply_t(out.view());
                }
                out
            }
            LazyNode::Hadamard { left, root } => hadamard_apply(left, root, x, true),
            LazyNode::BlockDiag(blocks) => {
                let mut out = Array2::zeros((self.ncols(), x.ncols()));
                let (mut r0, mut c0) = (0, 0);
                for b in blocks {
                    let (r, c) = b.shape;
                    let y = b.apply_t(x.slice(s![r0..r0 + r, ..]));
                    out.slice_mut(s![c0..c0 + c, ..]).assign(&y);
                    r0 += r;
                    c0 += c;
                }
                out
            }
            LazyNode::AddedDiag { base, diag } => {
                let mut out = base.apply_t(x);
                Zip::from(out.rows_mut())
                    .and(x.rows())
                    .and(diag)
                    .for_each(|mut o, xi, &di| o.zip_mut_with(&xi, |a, &b| *a += di * b));
                out
            }
            LazyNode::Scaled { base, scale } => {
                let mut out = base.apply_t(x);
                out.mapv_inplace(|v| v * *scale);
                out
            }
            LazyNode::Interpolated { left, base, right } => {
                let wtx = left.apply_t(x);
                let kw = base.apply_t(wtx.view());
                right.apply(kw.view())
            }
            // symmetric by construction
            LazyNode::Diagonal(_)
            | LazyNode::ConstantDiagonal(_)
            | LazyNode::Toeplitz(_)
            | LazyNode::LowRank(_) => self.apply(x),
        }
    }

    /// Entry `(i, j)` when the structure gives it without a product
    pub fn element(&self, i: usize, j: usize) -> Option<S> {
        let (rows, cols) = self.shape;
        if i >= rows || j >= cols {
            return None;
        }
        match self.node.as_ref() {
            LazyNode::Dense(a) => Some(a[[i, j]]),
            LazyNode::Diagonal(d) => Some(if i == j { d[i] } else { S::zero() }),
            LazyNode::ConstantDiagonal(c) => Some(if i == j { *c } else { S::zero() }),
            LazyNode::Function(f) => Some(f(i, j)),
            LazyNode::Toeplitz(t) => Some(t.get(i, j)),
            LazyNode::Kronecker(factors) => {
                let (mut ri, mut rj) = (i, j);
                let mut value = S::one();
                for f in factors.iter().rev() {
                    let (fr, fc) = f.shape;
                    value *= f.element(ri % fr, rj % fc)?;
                    ri /= fr;
                    rj /= fc;
                }
                Some(value)
            }
            LazyNode::Sum(terms) => terms.iter().map(|t| t.element(i, j)).sum(),
            LazyNode::Product(_) => None,
            LazyNode::Hadamard { left, root } => {
                let b = root.row(i).dot(&root.row(j));
                left.element(i, j).map(|a| a * b)
            }
            LazyNode::BlockDiag(blocks) => {
                let (mut r0, mut c0) = (0, 0);
                for b in blocks {
                    let (r, c) = b.shape;
                    if i < r0 + r {
                        return if j >= c0 && j < c0 + c {
                            b.element(i - r0, j - c0)
                        } else {
                            Some(S::zero())
                        };
                    }
                    r0 += r;
                    c0 += c;
                }
                None
            }
            LazyNode::AddedDiag { base, diag } => {
                let v = base.element(i, j)?;
                Some(if i == j { v + diag[i] } else { v })
            }
            LazyNode::Scaled { base, scale } => base.element(i, j).map(|v| v * *scale),
            LazyNode::LowRank(r) => Some(r.row(i).dot(&r.row(j))),
            LazyNode::Interpolated { left, base, right } => {
                let mut value = S::zero();
                let (li, lw) = (left.indices().row(i), left.weights().row(i));
                let (rj, rw) = (right.indices().row(j), right.weights().row(j));
                for (&a, &wa) in li.iter().zip(lw.iter()) {
                    for (&b, &wb) in rj.iter().zip(rw.iter()) {
                        value += base.element(a, b)?.scale(wa * wb);
                    }
                }
                Some(value)
            }
        }
    }

    /// Diagonal, computed from the structure when it allows it,
    /// otherwise from products against blocks of unit vectors
    pub fn diagonal(&self) -> Result<Array1<S>> {
        if !self.is_square() {
            let n = self.nrows();
            return Err(shape_error("diagonal", (n, n), self.shape));
        }
        if let Some(d) = self.fast_diagonal() {
            return Ok(d);
        }
        let n = self.nrows();
        let mut diag = Array1::zeros(n);
        for start in (0..n).step_by(EVALUATION_BLOCK) {
            let end = (start + EVALUATION_BLOCK).min(n);
            let mut e = Array2::zeros((n, end - start));
            for k in start..end {
                e[[k, k - start]] = S::one();
            }
            let cols = self.apply(e.view());
            for k in start..end {
                diag[k] = cols[[k, k - start]];
            }
        }
        Ok(diag)
    }

    fn fast_diagonal(&self) -> Option<Array1<S>> {
        let n = self.nrows();
        match self.node.as_ref() {
            LazyNode::Dense(a) => Some(a.diag().to_owned()),
            LazyNode::Diagonal(d) => Some(d.to_owned()),
            LazyNode::ConstantDiagonal(c) => Some(Array1::from_elem(n, *c)),
            LazyNode::Function(f) => Some(Array1::from_shape_fn(n, |i| f(i, i))),
            LazyNode::Toeplitz(t) => Some(Array1::from_elem(n, t.get(0, 0))),
            LazyNode::Kronecker(factors) => {
                let mut diag = Array1::from_elem(1, S::one());
                for f in factors {
                    if !f.is_square() {
                        return None;
                    }
                    let fd = f.fast_diagonal()?;
                    diag = Array1::from_shape_fn(diag.len() * fd.len(), |k| {
                        diag[k / fd.len()] * fd[k % fd.len()]
                    });
                }
                Some(diag)
            }
            LazyNode::Sum(terms) => {
                let mut diag = Array1::zeros(n);
                for t in terms {
                    diag += &t.fast_diagonal()?;
                }
                Some(diag)
            }
            LazyNode::Product(_) => None,
            LazyNode::Hadamard { left, root } => {
                let b = root.map_axis(Axis(1), |r| r.dot(&r));
                left.fast_diagonal().map(|a| a * b)
            }
            LazyNode::BlockDiag(blocks) => {
                let mut parts = Vec::with_capacity(blocks.len());
                for b in blocks {
                    if !b.is_square() {
                        return None;
                    }
                    parts.push(b.fast_diagonal()?);
                }
                let views: Vec<_> = parts.iter().map(|p| p.view()).collect();
                concatenate(Axis(0), &views).ok()
            }
            LazyNode::AddedDiag { base, diag } => base.fast_diagonal().map(|d| d + diag),
            LazyNode::Scaled { base, scale } => base.fast_diagonal().map(|d| d * *scale),
            LazyNode::LowRank(r) => Some(r.map_axis(Axis(1), |row| row.dot(&row))),
            LazyNode::Interpolated { .. } => {
                let diag: Option<Vec<S>> = (0..n).map(|i| self.element(i, i)).collect();
                diag.map(Array1::from)
            }
        }
    }

    /// Dense evaluation, refused above [`DEFAULT_MAX_DENSE_ELEMENTS`]
    pub fn evaluate(&self) -> Result<Array2<S>> {
        self.evaluate_with_limit(DEFAULT_MAX_DENSE_ELEMENTS)
    }

    /// Dense evaluation, refused above `limit` elements
    pub fn evaluate_with_limit(&self, limit: usize) -> Result<Array2<S>> {
        let (rows, cols) = self.shape;
        if rows.saturating_mul(cols) > limit {
            return Err(LinopsError::SizeError { rows, cols, limit });
        }
        if let LazyNode::Dense(a) = self.node.as_ref() {
            return Ok(a.to_owned());
        }
        let mut out = Array2::zeros((rows, cols));
        for start in (0..cols).step_by(EVALUATION_BLOCK) {
            let end = (start + EVALUATION_BLOCK).min(cols);
            let mut e = Array2::zeros((cols, end - start));
            for k in start..end {
                e[[k, k - start]] = S::one();
            }
            out.slice_mut(s![.., start..end]).assign(&self.apply(e.view()));
        }
        Ok(out)
    }
}

/// `(A_1 ⊗ ... ⊗ A_d) X` applying each factor along its own axis of the
/// row-major tensor view of `X`
fn kronecker_apply<S: Scalar>(
    factors: &[LazyMatrix<S>],
    x: ArrayView2<S>,
    transpose: bool,
) -> Array2<S> {
    let k = x.ncols();
    let dims: Vec<(usize, usize)> = factors
        .iter()
        .map(|f| {
            if transpose {
                (f.ncols(), f.nrows())
            } else {
                f.shape
            }
        })
        .collect();
    // tensor of shape (n_1, .., n_{i-1}, m_i, .., m_d, k) flattened
    let mut cur: Vec<S> = x.iter().copied().collect();
    for (i, f) in factors.iter().enumerate() {
        let pre: usize = dims[..i].iter().map(|d| d.0).product();
        let post: usize = dims[i + 1..].iter().map(|d| d.1).product::<usize>() * k;
        let (ni, mi) = dims[i];
        let mut next = Vec::with_capacity(pre * ni * post);
        for p in 0..pre {
            let offset = p * mi * post;
            let block = Array2::from_shape_fn((mi, post), |(a, b)| cur[offset + a * post + b]);
            let y = if transpose {
                f.apply_t(block.view())
            } else {
                f.apply(block.view())
            };
            next.extend(y.iter().copied());
        }
        cur = next;
    }
    let rows: usize = dims.iter().map(|d| d.0).product();
    Array2::from_shape_fn((rows, k), |(i, j)| cur[i * k + j])
}

/// `(A ∘ R Rᵀ) X = Σ_q diag(r_q) A diag(r_q) X`, the `q` terms batched
/// into one product with `A`
fn hadamard_apply<S: Scalar>(
    left: &LazyMatrix<S>,
    root: &Array2<S>,
    x: ArrayView2<S>,
    transpose: bool,
) -> Array2<S> {
    let (n, k) = x.dim();
    let q = root.ncols();
    let mut stacked = Array2::zeros((n, q * k));
    for (c, rq) in root.columns().into_iter().enumerate() {
        let mut blk = stacked.slice_mut(s![.., c * k..(c + 1) * k]);
        Zip::from(blk.rows_mut())
            .and(x.rows())
            .and(&rq)
            .for_each(|mut b, xi, &r| b.zip_mut_with(&xi, |o, &v| *o = v * r));
    }
    let y = if transpose {
        left.apply_t(stacked.view())
    } else {
        left.apply(stacked.view())
    };
    let mut out = Array2::zeros((n, k));
    for (c, rq) in root.columns().into_iter().enumerate() {
        let blk = y.slice(s![.., c * k..(c + 1) * k]);
        Zip::from(out.rows_mut())
            .and(blk.rows())
            .and(&rq)
            .for_each(|mut o, b, &r| o.zip_mut_with(&b, |a, &v| *a += v * r));
    }
    out
}
