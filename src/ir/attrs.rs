//! Attributes describing iteration domains and loop nests.
//!
//! - [`AccessPattern`]: maps the dimensions of an accessed value (or of a
//!   dimension's range) to dimensions of the enclosing domain.
//! - [`DomainShape`]: per-dimension dependency structure of a domain.
//! - [`LoopIterator`] / [`Loop`] / [`LoopNest`]: binding of named logical
//!   loops to domain dimensions.

use crate::utils::intern::Symbol;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

/// An access pattern `(d0, ..., dn-1) -> (d_a, d_b, ...)`.
///
/// `use_domain_size` is the number of dimensions of the domain the pattern is
/// evaluated in; `dimensions[k]` is the domain dimension that indexes the k-th
/// dimension of the accessed entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccessPattern {
    use_domain_size: usize,
    dimensions: Vec<usize>,
}

impl AccessPattern {
    pub fn new(use_domain_size: usize, dimensions: Vec<usize>) -> Self {
        debug_assert!(
            dimensions.iter().all(|&d| d < use_domain_size),
            "access pattern refers to a dimension outside of its use domain"
        );
        Self { use_domain_size, dimensions }
    }

    /// The identity pattern over `n` dimensions.
    pub fn identity(n: usize) -> Self {
        Self::new(n, (0..n).collect())
    }

    pub fn use_domain_size(&self) -> usize {
        self.use_domain_size
    }

    pub fn dimensions(&self) -> &[usize] {
        &self.dimensions
    }

    pub fn len(&self) -> usize {
        self.dimensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dimensions.is_empty()
    }

    pub fn is_identity(&self) -> bool {
        self.dimensions.len() == self.use_domain_size
            && self.dimensions.iter().enumerate().all(|(i, &d)| i == d)
    }

    /// Accounts for `offset` dimensions inserted at `start_from` in the use
    /// domain: accessed dimensions at or past `start_from` move right.
    pub fn shift_right(&self, offset: usize, start_from: usize) -> Self {
        let dimensions = self
            .dimensions
            .iter()
            .map(|&d| if d >= start_from { d + offset } else { d })
            .collect();
        Self {
            use_domain_size: self.use_domain_size + offset,
            dimensions,
        }
    }

    /// One flag per use-domain dimension, set if the dimension is accessed.
    pub fn dependency_mask(&self) -> Vec<bool> {
        let mut mask = vec![false; self.use_domain_size];
        for &d in &self.dimensions {
            mask[d] = true;
        }
        mask
    }
}

impl fmt::Display for AccessPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self.dimensions.iter().map(|d| format!("d{}", d)).collect();
        write!(f, "#{}({})", self.use_domain_size, dims.join(", "))
    }
}

/// A dimension of a domain shape.
///
/// The dependency pattern is evaluated in the domain formed by the dimensions
/// preceding this one, so its use-domain size equals the dimension position.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DomainShapeDim {
    dependency_pattern: AccessPattern,
}

impl DomainShapeDim {
    pub fn new(dependency_pattern: AccessPattern) -> Self {
        Self { dependency_pattern }
    }

    pub fn dependency_pattern(&self) -> &AccessPattern {
        &self.dependency_pattern
    }

    /// Positions of the earlier dimensions this dimension depends on.
    pub fn dependencies(&self) -> &[usize] {
        self.dependency_pattern.dimensions()
    }

    pub fn dependency_mask(&self) -> Vec<bool> {
        self.dependency_pattern.dependency_mask()
    }
}

/// The shape of an iteration domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct DomainShape {
    dims: Vec<DomainShapeDim>,
}

impl DomainShape {
    pub fn new(dims: Vec<DomainShapeDim>) -> Self {
        debug_assert!(
            dims.iter()
                .enumerate()
                .all(|(i, dim)| dim.dependency_pattern().use_domain_size() == i),
            "dependency pattern of dimension must be evaluated over preceding dimensions"
        );
        Self { dims }
    }

    /// A shape of `n` mutually independent dimensions.
    pub fn hyper_rectangular(n: usize) -> Self {
        Self::new(
            (0..n)
                .map(|i| DomainShapeDim::new(AccessPattern::new(i, Vec::new())))
                .collect(),
        )
    }

    /// The zero-dimensional shape.
    pub fn scalar() -> Self {
        Self::default()
    }

    pub fn dims(&self) -> &[DomainShapeDim] {
        &self.dims
    }

    pub fn num_dims(&self) -> usize {
        self.dims.len()
    }

    pub fn is_hyper_rectangular(&self) -> bool {
        self.dims.iter().all(|dim| dim.dependencies().is_empty())
    }

    /// The shape formed by the first `n` dimensions.
    pub fn prefix(&self, n: usize) -> Self {
        Self {
            dims: self.dims[..n.min(self.dims.len())].to_vec(),
        }
    }
}

impl fmt::Display for DomainShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dims.is_empty() {
            return write!(f, "()");
        }
        let dims: Vec<String> = self
            .dims
            .iter()
            .enumerate()
            .map(|(i, dim)| {
                let deps: Vec<String> = dim.dependencies().iter().map(|d| format!("d{}", d)).collect();
                if deps.is_empty() {
                    format!("d{}:range", i)
                } else {
                    format!("d{}:range({})", i, deps.join(","))
                }
            })
            .collect();
        write!(f, "{}", dims.join(" x "))
    }
}

/// How a logical loop is bound to the iteration domain of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopIterator {
    /// The loop iterates over domain dimension `dimension` with `step`.
    Dimension { dimension: usize, step: i64 },
    /// The loop is not backed by a domain dimension of this operation yet.
    Rematerialize,
}

impl LoopIterator {
    pub fn dimension(&self) -> Option<usize> {
        match self {
            LoopIterator::Dimension { dimension, .. } => Some(*dimension),
            LoopIterator::Rematerialize => None,
        }
    }

    pub fn step(&self) -> Option<i64> {
        match self {
            LoopIterator::Dimension { step, .. } => Some(*step),
            LoopIterator::Rematerialize => None,
        }
    }

    pub fn is_rematerialize(&self) -> bool {
        matches!(self, LoopIterator::Rematerialize)
    }
}

/// A named logical loop of a loop nest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Loop {
    pub name: Symbol,
    pub iter: LoopIterator,
}

impl Loop {
    pub fn new(name: impl Into<Symbol>, iter: LoopIterator) -> Self {
        Self { name: name.into(), iter }
    }

    /// A loop iterating over `dimension` with `step`.
    pub fn dim(name: impl Into<Symbol>, dimension: usize, step: i64) -> Self {
        Self::new(name, LoopIterator::Dimension { dimension, step })
    }

    /// A loop waiting for rematerialization.
    pub fn remat(name: impl Into<Symbol>) -> Self {
        Self::new(name, LoopIterator::Rematerialize)
    }
}

impl fmt::Display for Loop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.iter {
            LoopIterator::Dimension { dimension, step } => {
                write!(f, "{}:d{} step {}", self.name, dimension, step)
            }
            LoopIterator::Rematerialize => write!(f, "{}:remat", self.name),
        }
    }
}

/// Loops of an operation, outermost first.
pub type LoopNest = SmallVec<[Loop; 4]>;

/// Number of leading loop names shared by two loop nests.
pub fn num_common_loops(lhs: &[Symbol], rhs: &[Symbol]) -> usize {
    lhs.iter().zip(rhs).take_while(|(a, b)| a == b).count()
}
