//! Concrete tensor shapes and the static broadcastable pattern attached to graph values.

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Stores the logical dimensions of a tensor. Rank-0 shapes describe scalars.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    pub fn new<D: Into<Vec<usize>>>(dims: D) -> Self {
        Shape { dims: dims.into() }
    }

    pub fn scalar() -> Self {
        Shape { dims: Vec::new() }
    }

    /// Borrow the raw dimension slice for downstream calculations.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Returns the rank (number of axes) of the shape.
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Computes the total number of elements implied by the shape.
    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }

    /// Total element count, or `None` if the product overflows `usize`.
    pub fn checked_num_elements(&self) -> Option<usize> {
        self.dims
            .iter()
            .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
    }
}

/// Per-axis flags marking which dimensions are statically known to have extent 1.
///
/// The pattern is fixed when a node is constructed; its length is the rank of every tensor the
/// node produces.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BroadcastPattern(SmallVec<[bool; 6]>);

impl BroadcastPattern {
    pub fn new(flags: impl IntoIterator<Item = bool>) -> Self {
        BroadcastPattern(flags.into_iter().collect())
    }

    /// Pattern of the given rank with no broadcastable axis.
    pub fn dense(rank: usize) -> Self {
        BroadcastPattern(SmallVec::from_elem(false, rank))
    }

    /// `(false,)`: a vector.
    pub fn vector() -> Self {
        Self::dense(1)
    }

    /// `(false, false)`: a matrix.
    pub fn matrix() -> Self {
        Self::dense(2)
    }

    /// `(false, true)`: a column.
    pub fn column() -> Self {
        BroadcastPattern::new([false, true])
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn flags(&self) -> &[bool] {
        &self.0
    }

    pub fn is_broadcastable(&self, axis: usize) -> bool {
        self.0.get(axis).copied().unwrap_or(false)
    }

    /// Reports whether `shape` has this rank and extent 1 on every broadcastable axis.
    pub fn admits(&self, shape: &Shape) -> bool {
        shape.rank() == self.rank()
            && self
                .0
                .iter()
                .zip(shape.dims())
                .all(|(&broadcastable, &dim)| !broadcastable || dim == 1)
    }
}

impl fmt::Display for BroadcastPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (idx, flag) in self.0.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", if *flag { "True" } else { "False" })?;
        }
        if self.0.len() == 1 {
            f.write_str(",")?;
        }
        f.write_str(")")
    }
}
