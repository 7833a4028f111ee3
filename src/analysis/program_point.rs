//! Points in the sequence order.

use crate::ir::{num_common_loops, OpId, Program};
use crate::utils::errors::IrError;
use crate::utils::intern::Symbol;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Side of an operation a point is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Before,
    After,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Direction::Before => Direction::After,
            Direction::After => Direction::Before,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Before => write!(f, "before"),
            Direction::After => write!(f, "after"),
        }
    }
}

/// A point in the program: immediately before or after an operation, or at
/// the start or end of the program, nested in a prefix of that operation's
/// loop nest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProgramPoint {
    op: Option<OpId>,
    direction: Direction,
    loop_nest: Vec<Symbol>,
}

impl ProgramPoint {
    /// The start (`Before`) or the end (`After`) of the program.
    pub fn boundary(direction: Direction) -> Self {
        Self {
            op: None,
            direction,
            loop_nest: Vec::new(),
        }
    }

    /// The point next to `op`, nested in all of its loops.
    pub fn at_op(program: &Program, op: OpId, direction: Direction) -> Result<Self, IrError> {
        let loop_nest = program.try_op(op)?.loop_names();
        Ok(Self {
            op: Some(op),
            direction,
            loop_nest,
        })
    }

    /// Replace the loop nest. Returns `None` unless `loop_nest` is a prefix of
    /// the current one.
    pub fn with_loop_nest(mut self, loop_nest: Vec<Symbol>) -> Option<Self> {
        if loop_nest.len() > self.loop_nest.len() || !self.loop_nest.starts_with(&loop_nest) {
            return None;
        }
        self.loop_nest = loop_nest;
        Some(self)
    }

    /// Keep only the `n` outermost loops.
    pub fn trim_loop_nest(mut self, n: usize) -> Self {
        self.loop_nest.truncate(n);
        self
    }

    pub fn operation(&self) -> Option<OpId> {
        self.op
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn loop_nest(&self) -> &[Symbol] {
        &self.loop_nest
    }

    pub fn is_boundary(&self) -> bool {
        self.op.is_none()
    }

    /// Number of outer loops shared with `other`.
    pub fn num_common_loops(&self, other: &ProgramPoint) -> usize {
        num_common_loops(&self.loop_nest, &other.loop_nest)
    }

    /// Number of outer loops shared with a loop nest given by names.
    pub fn num_common_loops_with(&self, loop_nest: &[Symbol]) -> usize {
        num_common_loops(&self.loop_nest, loop_nest)
    }
}

impl fmt::Display for ProgramPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.op {
            Some(op) => write!(f, "{} {}", self.direction, op)?,
            None => match self.direction {
                Direction::Before => write!(f, "program start")?,
                Direction::After => write!(f, "program end")?,
            },
        }
        if !self.loop_nest.is_empty() {
            let names: Vec<String> = self.loop_nest.iter().map(|s| s.to_string()).collect();
            write!(f, " in [{}]", names.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{DomainShape, ElementType, Loop, OpKind, OperationState, Type};

    fn nested_op(program: &mut Program) -> OpId {
        let r0 = program.add_range(1);
        let r1 = program.add_range(1);
        program.push(
            OperationState::new(OpKind::Map)
                .domain(vec![r0, r1])
                .result(Type::value(DomainShape::hyper_rectangular(2), ElementType::F32))
                .loop_nest([Loop::dim("i", 0, 1), Loop::dim("j", 1, 1)]),
        )
    }

    #[test]
    fn test_at_op_takes_full_nest() {
        let mut program = Program::new("p");
        let op = nested_op(&mut program);
        let point = ProgramPoint::at_op(&program, op, Direction::After).unwrap();
        assert_eq!(point.operation(), Some(op));
        assert_eq!(point.loop_nest(), &[Symbol::new("i"), Symbol::new("j")]);
        assert_eq!(point.to_string(), format!("after {} in [i, j]", op));
    }

    #[test]
    fn test_loop_nest_must_stay_a_prefix() {
        let mut program = Program::new("p");
        let op = nested_op(&mut program);
        let point = ProgramPoint::at_op(&program, op, Direction::Before).unwrap();
        assert!(point.clone().with_loop_nest(vec![Symbol::new("j")]).is_none());
        let outer = point.clone().with_loop_nest(vec![Symbol::new("i")]).unwrap();
        assert_eq!(outer.num_common_loops(&point), 1);
        assert_eq!(point.trim_loop_nest(0).loop_nest().len(), 0);
    }

    #[test]
    fn test_boundary() {
        let start = ProgramPoint::boundary(Direction::Before);
        assert!(start.is_boundary());
        assert!(start.loop_nest().is_empty());
        assert_eq!(start.to_string(), "program start");
        assert_eq!(Direction::Before.opposite(), Direction::After);
    }
}
