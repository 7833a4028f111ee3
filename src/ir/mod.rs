//! Dataflow IR consumed by the scheduling passes.
//!
//! - `attrs`: access patterns, domain shapes, loop nests
//! - `types`: value and range types
//! - `op`: operation kinds, operations and their bodies
//! - `program`: the operation arena in program order
//! - `rewriter`: the mutation interface used by transforms
//! - `op_set`: insertion-ordered operation sets

pub mod attrs;
pub mod op;
pub mod op_set;
pub mod program;
pub mod rewriter;
pub mod types;

pub use attrs::{num_common_loops, AccessPattern, DomainShape, DomainShapeDim, Loop, LoopIterator, LoopNest};
pub use op::{BinaryOp, BodyExpr, OpKind, Operation, OperationState, Region, UseKind};
pub use op_set::OpSet;
pub use program::{OpId, Program, ValueDef, ValueId};
pub use rewriter::{RecordingRewriter, RewriteEvent, Rewriter};
pub use types::{ElementType, MemorySpace, Type};
