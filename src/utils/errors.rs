//! Error types for the scheduling passes.
//!
//! Errors are grouped by the component that produces them. Each component
//! error carries a kind that callers can match on and a human-readable
//! message for diagnostics.

use crate::ir::{OpId, ValueId};
use crate::utils::location::Span;
use std::fmt;
use thiserror::Error;

/// Top-level error type for the crate.
#[derive(Error, Debug)]
pub enum SchedError {
    /// Misuse of the program representation
    #[error("IR error: {0}")]
    Ir(#[from] IrError),

    /// Error during a transformation
    #[error("Transformation error: {0}")]
    Transform(#[from] TransformError),

    /// Error while building or querying the sequence analysis
    #[error("Sequence analysis error: {0}")]
    Sequence(#[from] SequenceError),
}

/// Errors raised by the program representation itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IrError {
    /// The operation does not exist or was erased
    #[error("unknown operation {0}")]
    UnknownOp(OpId),

    /// The value does not exist
    #[error("unknown value {0}")]
    UnknownValue(ValueId),

    /// Erasing the operation would leave dangling uses
    #[error("cannot erase {op}: result {value} still has uses")]
    ResultInUse { op: OpId, value: ValueId },
}

/// Error during a transformation.
#[derive(Error, Debug, Clone)]
pub struct TransformError {
    /// The error message
    pub message: String,
    /// The kind of transformation error
    pub kind: TransformErrorKind,
    /// The transformation that failed
    pub transform: String,
    /// The operation being rewritten, if any
    pub op: Option<OpId>,
    /// Location of that operation
    pub span: Option<Span>,
}

impl TransformError {
    pub fn new(kind: TransformErrorKind, transform: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind,
            transform: transform.to_string(),
            op: None,
            span: None,
        }
    }

    /// Shorthand for a [`TransformErrorKind::MalformedProgram`] error.
    pub fn malformed(transform: &str, message: impl Into<String>) -> Self {
        Self::new(TransformErrorKind::MalformedProgram, transform, message)
    }

    /// Attach the offending operation and its location.
    pub fn at(mut self, op: OpId, span: Span) -> Self {
        self.op = Some(op);
        if !span.is_dummy() {
            self.span = Some(span);
        }
        self
    }
}

impl fmt::Display for TransformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in {}", self.message, self.transform)?;
        if let Some(op) = self.op {
            write!(f, " (operation {})", op)?;
        }
        if let Some(ref span) = self.span {
            write!(f, " at {}", span)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformErrorKind {
    /// The program violates an assumption of the transformation, e.g. a
    /// loop without a materialized definition
    MalformedProgram,
    /// The operation kind is not handled by the transformation
    UnsupportedOperationKind,
}

/// Error while building the sequence analysis.
#[derive(Error, Debug, Clone)]
pub struct SequenceError {
    /// The error message
    pub message: String,
    /// The kind of sequence error
    pub kind: SequenceErrorKind,
    /// Operations on the offending cycle, in dependency order
    pub cycle: Vec<OpId>,
}

impl SequenceError {
    /// A [`SequenceErrorKind::CyclicSchedule`] error along `cycle`.
    pub fn cyclic(message: impl Into<String>, cycle: Vec<OpId>) -> Self {
        Self {
            message: message.into(),
            kind: SequenceErrorKind::CyclicSchedule,
            cycle,
        }
    }
}

impl fmt::Display for SequenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if !self.cycle.is_empty() {
            let ops: Vec<String> = self.cycle.iter().map(|op| op.to_string()).collect();
            write!(f, " [{}]", ops.join(" -> "))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceErrorKind {
    /// Use-def cycle not mediated by a feedback operation, or explicit
    /// sequence hints contradicting the use-def order
    CyclicSchedule,
}

/// Result type using SchedError.
pub type SchedResult<T> = Result<T, SchedError>;
