//! Types of IR values.

use crate::ir::attrs::DomainShape;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Element type of values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    Index,
    I32,
    I64,
    F32,
    F64,
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ElementType::Index => "index",
            ElementType::I32 => "i32",
            ElementType::I64 => "i64",
            ElementType::F32 => "f32",
            ElementType::F64 => "f64",
        };
        write!(f, "{}", s)
    }
}

/// Type of a value: either a range usable as a domain dimension, or a
/// multi-dimensional value with an element type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    /// A range whose bounds may depend on the dimensions of `shape`
    Range { shape: DomainShape },
    /// A value defined over a domain of shape `shape`
    Value { shape: DomainShape, element: ElementType },
}

impl Type {
    pub fn range(shape: DomainShape) -> Self {
        Type::Range { shape }
    }

    pub fn value(shape: DomainShape, element: ElementType) -> Self {
        Type::Value { shape, element }
    }

    pub fn shape(&self) -> &DomainShape {
        match self {
            Type::Range { shape } | Type::Value { shape, .. } => shape,
        }
    }

    pub fn element(&self) -> Option<ElementType> {
        match self {
            Type::Value { element, .. } => Some(*element),
            Type::Range { .. } => None,
        }
    }

    pub fn is_range(&self) -> bool {
        matches!(self, Type::Range { .. })
    }

    /// The same kind of type over a different shape.
    pub fn with_shape(&self, shape: DomainShape) -> Self {
        match self {
            Type::Range { .. } => Type::Range { shape },
            Type::Value { element, .. } => Type::Value { shape, element: *element },
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Range { shape } => write!(f, "range<{}>", shape),
            Type::Value { shape, element } => write!(f, "value<{}, {}>", shape, element),
        }
    }
}

/// Where the result of an operation lives once lowered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemorySpace {
    Register,
    Memory,
}
