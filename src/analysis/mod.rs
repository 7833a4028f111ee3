//! Analyses over dataflow programs.
//!
//! - `loop_bounds`: canonical bounds of logical loops and pending
//!   rematerializations
//! - `dataflow`: use-def graph with feedback edges kept apart
//! - `program_point`: positions in the sequence order
//! - `sequence`: total order of the operations

pub mod dataflow;
pub mod loop_bounds;
pub mod program_point;
pub mod sequence;

pub use dataflow::{DataflowGraph, EdgeKind, GraphNode};
pub use loop_bounds::{ConflictKind, LoopBounds, LoopBoundsCollector, LoopBoundsConflict, LoopBoundsTable};
pub use program_point::{Direction, ProgramPoint};
pub use sequence::{AllOps, SequenceAnalysis, SequenceKey};

use crate::ir::Program;

/// Collect the loop bounds of a program.
pub fn collect_loop_bounds(program: &Program) -> LoopBoundsTable {
    LoopBoundsCollector::new().collect(program)
}
