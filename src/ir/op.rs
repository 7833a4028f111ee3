//! Operations of the dataflow IR.
//!
//! Every operation has an iteration domain (a list of range values), a shape
//! describing the dependencies between domain dimensions, and value operands
//! accessed through access patterns. Compute operations additionally carry a
//! loop nest and an optional sequence hint.

use crate::ir::attrs::{AccessPattern, DomainShape, Loop, LoopNest};
use crate::ir::program::ValueId;
use crate::ir::types::{ElementType, MemorySpace, Type};
use crate::utils::intern::Symbol;
use crate::utils::location::Span;
use std::fmt;

/// Kind of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// Defines a range usable as a domain dimension. Its own domain holds the
    /// dimensions the range bounds depend on.
    Range { step: i64 },
    /// Introduces an external scalar into the program.
    FromScalar,
    /// Copies its single operand.
    Copy,
    /// Applies its body to each point of the domain.
    Map,
    /// Reduces over the trailing `domain.len() - num_parallel` dimensions.
    /// Operands are the `num_inits` initial values followed by the inputs.
    MapReduce { num_parallel: usize, num_inits: usize },
    /// Removes the trailing `domain.len() - num_parallel` dimensions of its
    /// operand.
    Projection { num_parallel: usize },
    /// Loop-carried value. Operand 0 is the initial value, operand 1 the value
    /// produced by the previous iteration.
    Feedback,
}

impl OpKind {
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Range { .. } => "range",
            OpKind::FromScalar => "from_scalar",
            OpKind::Copy => "copy",
            OpKind::Map => "map",
            OpKind::MapReduce { .. } => "map_reduce",
            OpKind::Projection { .. } => "projection",
            OpKind::Feedback => "feedback",
        }
    }

    /// Whether the operation has a position of its own in the sequence
    /// order. Other operations are placed relative to their producers.
    pub fn is_compute(&self) -> bool {
        matches!(self, OpKind::Copy | OpKind::Map | OpKind::MapReduce { .. })
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// How an operation uses a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UseKind {
    /// As a dimension of its domain
    Domain,
    /// As a regular operand
    Operand,
    /// As the value of the previous iteration of a feedback operation
    PriorIteration,
}

/// Binary operators available in bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// An expression computed by a body.
#[derive(Debug, Clone, PartialEq)]
pub enum BodyExpr {
    /// Reference to a block argument
    Argument(usize),
    Int(i64),
    Float(f64),
    Binary {
        op: BinaryOp,
        lhs: Box<BodyExpr>,
        rhs: Box<BodyExpr>,
    },
}

impl BodyExpr {
    pub fn binary(op: BinaryOp, lhs: BodyExpr, rhs: BodyExpr) -> Self {
        BodyExpr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    fn shift_arguments(&mut self, pos: usize, count: usize) {
        match self {
            BodyExpr::Argument(idx) if *idx >= pos => *idx += count,
            BodyExpr::Binary { lhs, rhs, .. } => {
                lhs.shift_arguments(pos, count);
                rhs.shift_arguments(pos, count);
            }
            _ => {}
        }
    }
}

/// The body of a map or map_reduce operation. Block arguments are the domain
/// indices followed by the operand elements.
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    pub arguments: Vec<ElementType>,
    pub yields: Vec<BodyExpr>,
}

impl Region {
    pub fn new(arguments: Vec<ElementType>, yields: Vec<BodyExpr>) -> Self {
        Self { arguments, yields }
    }

    pub fn num_arguments(&self) -> usize {
        self.arguments.len()
    }

    /// Insert `count` arguments of type `ty` at `pos`, keeping references to
    /// existing arguments pointed at the same arguments.
    pub fn insert_arguments(&mut self, pos: usize, count: usize, ty: ElementType) {
        let pos = pos.min(self.arguments.len());
        self.arguments
            .splice(pos..pos, std::iter::repeat(ty).take(count));
        for expr in &mut self.yields {
            expr.shift_arguments(pos, count);
        }
    }
}

/// An operation stored in a [`Program`](crate::ir::Program).
#[derive(Debug, Clone)]
pub struct Operation {
    pub kind: OpKind,
    /// Range values indexing the operation
    pub domain: Vec<ValueId>,
    /// Shape of the domain
    pub shape: DomainShape,
    /// One access pattern per value operand
    pub access_patterns: Vec<AccessPattern>,
    /// Value operands
    pub operands: Vec<ValueId>,
    pub results: Vec<ValueId>,
    pub loop_nest: Option<LoopNest>,
    /// Explicit sequence hint
    pub sequence: Option<i64>,
    /// One entry per result
    pub memory_spaces: Vec<Option<MemorySpace>>,
    pub body: Option<Region>,
    pub span: Span,
}

impl Operation {
    pub fn is_compute(&self) -> bool {
        self.kind.is_compute()
    }

    /// Number of leading domain dimensions that also index the results.
    pub fn num_parallel_dims(&self) -> usize {
        match self.kind {
            OpKind::MapReduce { num_parallel, .. } | OpKind::Projection { num_parallel } => {
                num_parallel
            }
            _ => self.domain.len(),
        }
    }

    pub fn parallel_domain(&self) -> &[ValueId] {
        &self.domain[..self.num_parallel_dims().min(self.domain.len())]
    }

    /// Loops of the loop nest, or nothing if the operation has none.
    pub fn loops(&self) -> &[Loop] {
        self.loop_nest.as_deref().unwrap_or(&[])
    }

    pub fn loop_names(&self) -> Vec<Symbol> {
        self.loops().iter().map(|l| l.name).collect()
    }

    /// Whether some loop of the nest waits for rematerialization.
    pub fn has_pending_loops(&self) -> bool {
        self.loops().iter().any(|l| l.iter.is_rematerialize())
    }

    pub fn use_kind(&self, operand_index: usize) -> UseKind {
        match self.kind {
            OpKind::Feedback if operand_index == 1 => UseKind::PriorIteration,
            _ => UseKind::Operand,
        }
    }

    /// Every value used by the operation along with how it is used.
    pub fn uses(&self) -> impl Iterator<Item = (ValueId, UseKind)> + '_ {
        let domain = self.domain.iter().map(|&v| (v, UseKind::Domain));
        let operands = self
            .operands
            .iter()
            .enumerate()
            .map(move |(i, &v)| (v, self.use_kind(i)));
        domain.chain(operands)
    }

    pub fn memory_space(&self, result: usize) -> Option<MemorySpace> {
        self.memory_spaces.get(result).copied().flatten()
    }
}

/// Everything needed to create an operation, except result values which the
/// program allocates.
#[derive(Debug, Clone)]
pub struct OperationState {
    pub kind: OpKind,
    pub domain: Vec<ValueId>,
    pub shape: DomainShape,
    pub access_patterns: Vec<AccessPattern>,
    pub operands: Vec<ValueId>,
    pub result_types: Vec<Type>,
    pub loop_nest: Option<LoopNest>,
    pub sequence: Option<i64>,
    pub memory_spaces: Vec<Option<MemorySpace>>,
    pub body: Option<Region>,
    pub span: Span,
}

impl OperationState {
    pub fn new(kind: OpKind) -> Self {
        Self {
            kind,
            domain: Vec::new(),
            shape: DomainShape::scalar(),
            access_patterns: Vec::new(),
            operands: Vec::new(),
            result_types: Vec::new(),
            loop_nest: None,
            sequence: None,
            memory_spaces: Vec::new(),
            body: None,
            span: Span::dummy(),
        }
    }

    /// Set the domain; the shape defaults to independent dimensions.
    pub fn domain(mut self, domain: Vec<ValueId>) -> Self {
        self.shape = DomainShape::hyper_rectangular(domain.len());
        self.domain = domain;
        self
    }

    pub fn shape(mut self, shape: DomainShape) -> Self {
        self.shape = shape;
        self
    }

    pub fn operand(mut self, value: ValueId, pattern: AccessPattern) -> Self {
        self.operands.push(value);
        self.access_patterns.push(pattern);
        self
    }

    pub fn result(mut self, ty: Type) -> Self {
        self.result_types.push(ty);
        self.memory_spaces.push(None);
        self
    }

    pub fn result_in(mut self, ty: Type, space: MemorySpace) -> Self {
        self.result_types.push(ty);
        self.memory_spaces.push(Some(space));
        self
    }

    pub fn loop_nest(mut self, loops: impl IntoIterator<Item = Loop>) -> Self {
        self.loop_nest = Some(loops.into_iter().collect());
        self
    }

    pub fn sequence(mut self, sequence: i64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    pub fn body(mut self, body: Region) -> Self {
        self.body = Some(body);
        self
    }

    pub fn span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }
}
