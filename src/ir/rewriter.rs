//! The mutation interface transforms use to edit a program.
//!
//! Transforms never touch the program arena directly: they read through
//! [`Rewriter::program`] and mutate through the other methods, so a host can
//! observe or veto edits and tests can record them.

use crate::ir::op::{OperationState, Region};
use crate::ir::program::{OpId, Program, ValueId};
use crate::utils::errors::IrError;

/// An IR mutation context.
pub trait Rewriter {
    /// Read access to the program being rewritten.
    fn program(&self) -> &Program;

    /// Create an operation immediately before `before`.
    fn create_op(&mut self, state: OperationState, before: OpId) -> Result<OpId, IrError>;

    /// Erase an operation whose results are no longer used.
    fn erase_op(&mut self, op: OpId) -> Result<(), IrError>;

    /// Redirect every use of `from` to `to`.
    fn replace_all_uses(&mut self, from: ValueId, to: ValueId);

    /// Detach the body of `op` so it can be moved to another operation.
    fn take_body(&mut self, op: OpId) -> Option<Region>;
}

impl Rewriter for Program {
    fn program(&self) -> &Program {
        self
    }

    fn create_op(&mut self, state: OperationState, before: OpId) -> Result<OpId, IrError> {
        self.insert_before(state, before)
    }

    fn erase_op(&mut self, op: OpId) -> Result<(), IrError> {
        self.erase(op)
    }

    fn replace_all_uses(&mut self, from: ValueId, to: ValueId) {
        Program::replace_all_uses(self, from, to)
    }

    fn take_body(&mut self, op: OpId) -> Option<Region> {
        self.op_mut(op).and_then(|op| op.body.take())
    }
}

/// A rewriter that forwards to a program and records every edit.
#[derive(Debug)]
pub struct RecordingRewriter<'a> {
    program: &'a mut Program,
    pub events: Vec<RewriteEvent>,
}

/// An edit performed through a [`RecordingRewriter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteEvent {
    Created { op: OpId, before: OpId },
    Erased(OpId),
    ReplacedUses { from: ValueId, to: ValueId },
    TookBody(OpId),
}

impl<'a> RecordingRewriter<'a> {
    pub fn new(program: &'a mut Program) -> Self {
        Self {
            program,
            events: Vec::new(),
        }
    }

    pub fn created(&self) -> Vec<OpId> {
        self.events
            .iter()
            .filter_map(|e| match e {
                RewriteEvent::Created { op, .. } => Some(*op),
                _ => None,
            })
            .collect()
    }
}

impl Rewriter for RecordingRewriter<'_> {
    fn program(&self) -> &Program {
        self.program
    }

    fn create_op(&mut self, state: OperationState, before: OpId) -> Result<OpId, IrError> {
        let op = self.program.insert_before(state, before)?;
        self.events.push(RewriteEvent::Created { op, before });
        Ok(op)
    }

    fn erase_op(&mut self, op: OpId) -> Result<(), IrError> {
        self.program.erase(op)?;
        self.events.push(RewriteEvent::Erased(op));
        Ok(())
    }

    fn replace_all_uses(&mut self, from: ValueId, to: ValueId) {
        self.program.replace_all_uses(from, to);
        self.events.push(RewriteEvent::ReplacedUses { from, to });
    }

    fn take_body(&mut self, op: OpId) -> Option<Region> {
        self.events.push(RewriteEvent::TookBody(op));
        self.program.op_mut(op).and_then(|op| op.body.take())
    }
}
