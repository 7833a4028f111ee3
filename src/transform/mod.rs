//! Transformations of dataflow programs.

pub mod rematerialize;

pub use rematerialize::{update_sequence, Rematerialization, Rematerialize, RematerializeReport};

use crate::ir::Program;
use anyhow::Result;

/// Transformation pass trait.
pub trait Transform {
    /// Apply the transformation. Returns whether the program changed.
    fn apply(&self, program: &mut Program) -> Result<bool>;

    /// Get transformation name.
    fn name(&self) -> &str;
}
