//! # PolySched - Scheduling Support for a Polyhedral Dataflow IR
//!
//! Two passes over programs whose operations are indexed by explicit
//! iteration domains and bound to named logical loops:
//! - Loop rematerialization: gives operations a real domain dimension for
//!   each loop they are nested in but do not iterate over yet
//! - Sequence analysis: a total, deterministic order of the operations built
//!   from explicit sequence hints and use-def chains
//!
//! ## Architecture
//!
//! ```text
//! Program → LoopBoundsCollector → Rematerialize → Program
//!         → DataflowGraph → SequenceAnalysis → ProgramPoint queries
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use polysched::prelude::*;
//!
//! let mut program = Program::new("example");
//! let ri = program.add_range(1);
//! // ... build operations, some with `Loop::remat(..)` entries ...
//! let report = polysched::rematerialize_program(&mut program, &PassConfig::default())?;
//! let sequence = polysched::analyze_sequence(&program, &PassConfig::default())?;
//! sequence.assign_inferred(&mut program);
//! ```

#![warn(clippy::all)]

pub mod analysis;
pub mod ir;
pub mod transform;
pub mod utils;

// Re-export commonly used types
pub mod prelude {
    //! Convenient re-exports of commonly used types and traits.

    pub use crate::analysis::{
        Direction, LoopBounds, LoopBoundsCollector, LoopBoundsTable, ProgramPoint, SequenceAnalysis,
    };
    pub use crate::ir::*;
    pub use crate::transform::{Rematerialize, RematerializeReport, Transform};
    pub use crate::utils::errors::*;
    pub use crate::utils::intern::Symbol;
    pub use crate::PassConfig;
}

use serde::{Deserialize, Serialize};

/// Configuration shared by the passes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassConfig {
    /// Fail rematerialization when a loop to rematerialize is materialized
    /// with different bounds in different operations; otherwise only warn
    pub strict_loop_bounds: bool,
    /// Log why a program cannot be sequenced
    pub report_errors: bool,
}

impl Default for PassConfig {
    fn default() -> Self {
        Self {
            strict_loop_bounds: true,
            report_errors: false,
        }
    }
}

impl PassConfig {
    pub fn with_strict_loop_bounds(mut self, strict: bool) -> Self {
        self.strict_loop_bounds = strict;
        self
    }

    pub fn with_report_errors(mut self, report: bool) -> Self {
        self.report_errors = report;
        self
    }
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Rematerialize every pending loop of `program`.
pub fn rematerialize_program(
    program: &mut ir::Program,
    config: &PassConfig,
) -> utils::SchedResult<transform::RematerializeReport> {
    Ok(transform::Rematerialize::new(config.clone()).run(program)?)
}

/// Compute the sequence order of `program`.
pub fn analyze_sequence(
    program: &ir::Program,
    config: &PassConfig,
) -> utils::SchedResult<analysis::SequenceAnalysis> {
    Ok(analysis::SequenceAnalysis::try_new(program, config)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_config_builder() {
        let config = PassConfig::default()
            .with_strict_loop_bounds(false)
            .with_report_errors(true);
        assert!(!config.strict_loop_bounds);
        assert!(config.report_errors);
        assert!(PassConfig::default().strict_loop_bounds);
    }
}
