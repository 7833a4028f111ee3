//! Canonical bounds of logical loops.
//!
//! A logical loop may be materialized as a domain dimension in several
//! operations and left pending in others. The collector walks the program
//! once, records the bounds of every loop from its first materialized
//! occurrence, and gathers the operations that still have pending loops.
//!
//! Later materialized occurrences are compared against the recorded bounds;
//! disagreements are reported as [`LoopBoundsConflict`]s rather than silently
//! ignored.

use crate::ir::{OpId, OpSet, Operation, Program, ValueId};
use crate::utils::intern::Symbol;
use log::{trace, warn};
use smallvec::SmallVec;
use std::collections::HashMap;
use std::fmt;

/// Bounds of a logical loop: the range it iterates over, its step and the
/// loops the range depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopBounds {
    pub range: ValueId,
    pub step: i64,
    pub dependent_on: SmallVec<[Symbol; 2]>,
    /// Dimensions the range depends on that no loop of the defining
    /// operation iterates over. They cannot be expressed by name.
    pub unbound_dependencies: usize,
}

impl LoopBounds {
    pub fn new(range: ValueId, step: i64, dependent_on: impl IntoIterator<Item = Symbol>) -> Self {
        Self {
            range,
            step,
            dependent_on: dependent_on.into_iter().collect(),
            unbound_dependencies: 0,
        }
    }

    /// Whether every dependency of the range is known by loop name.
    pub fn is_complete(&self) -> bool {
        self.unbound_dependencies == 0
    }
}

/// What differs between two materialized occurrences of the same loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    Range,
    Step,
    Dependencies,
}

/// A materialized occurrence of a loop that disagrees with its canonical
/// bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopBoundsConflict {
    pub loop_name: Symbol,
    pub op: OpId,
    pub kind: ConflictKind,
}

impl fmt::Display for LoopBoundsConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self.kind {
            ConflictKind::Range => "range",
            ConflictKind::Step => "step",
            ConflictKind::Dependencies => "dependencies",
        };
        write!(
            f,
            "loop '{}' in {} has a different {} than its first occurrence",
            self.loop_name, self.op, what
        )
    }
}

/// Result of [`LoopBoundsCollector::collect`].
#[derive(Debug, Clone, Default)]
pub struct LoopBoundsTable {
    bounds: HashMap<Symbol, LoopBounds>,
    /// Operations with at least one loop waiting for rematerialization, in
    /// program order.
    pub pending: OpSet,
    /// Occurrences disagreeing with the recorded bounds.
    pub conflicts: Vec<LoopBoundsConflict>,
}

impl LoopBoundsTable {
    pub fn get(&self, name: Symbol) -> Option<&LoopBounds> {
        self.bounds.get(&name)
    }

    pub fn contains(&self, name: Symbol) -> bool {
        self.bounds.contains_key(&name)
    }

    pub fn len(&self) -> usize {
        self.bounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bounds.is_empty()
    }

    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }
}

/// Collects loop bounds and pending rematerializations.
#[derive(Debug, Default)]
pub struct LoopBoundsCollector;

impl LoopBoundsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Scan `program` once. Never fails: operations whose loop nest points
    /// outside of their domain are skipped with a warning.
    pub fn collect(&self, program: &Program) -> LoopBoundsTable {
        let mut table = LoopBoundsTable::default();

        for (id, op) in program.ops() {
            for lp in op.loops() {
                let Some(dimension) = lp.iter.dimension() else {
                    table.pending.insert(id);
                    continue;
                };
                let step = lp.iter.step().unwrap_or(1);

                let Some(&range) = op.domain.get(dimension) else {
                    warn!(
                        "loop '{}' of {} refers to dimension {} outside of a {}-d domain",
                        lp.name,
                        id,
                        dimension,
                        op.domain.len()
                    );
                    continue;
                };
                let (names, unbound) = dependency_names(op, dimension);
                if unbound > 0 {
                    warn!(
                        "loop '{}' of {} depends on {} dimension(s) no loop iterates over",
                        lp.name, id, unbound
                    );
                }
                let mut bounds = LoopBounds::new(range, step, names);
                bounds.unbound_dependencies = unbound;

                match table.bounds.get(&lp.name) {
                    None => {
                        trace!("loop '{}' bounds taken from {}", lp.name, id);
                        table.bounds.insert(lp.name, bounds);
                    }
                    Some(existing) => {
                        if let Some(kind) = compare(existing, &bounds) {
                            table.conflicts.push(LoopBoundsConflict {
                                loop_name: lp.name,
                                op: id,
                                kind,
                            });
                        }
                    }
                }
            }
        }

        table
    }
}

/// Names of the loops iterating over the dimensions `dimension` depends on,
/// and the number of those dimensions no loop iterates over.
fn dependency_names(op: &Operation, dimension: usize) -> (SmallVec<[Symbol; 2]>, usize) {
    let mut names = SmallVec::new();
    let mut unbound = 0;
    let Some(dim) = op.shape.dims().get(dimension) else {
        return (names, unbound);
    };
    for (bit, &set) in dim.dependency_mask().iter().enumerate() {
        if !set {
            continue;
        }
        match op.loops().iter().find(|l| l.iter.dimension() == Some(bit)) {
            Some(lp) => names.push(lp.name),
            None => {
                trace!("dimension {} of {} depends on unbound d{}", dimension, op.kind, bit);
                unbound += 1;
            }
        }
    }
    (names, unbound)
}

fn compare(existing: &LoopBounds, other: &LoopBounds) -> Option<ConflictKind> {
    if existing.step != other.step {
        Some(ConflictKind::Step)
    } else if existing.dependent_on != other.dependent_on
        || existing.unbound_dependencies != other.unbound_dependencies
    {
        Some(ConflictKind::Dependencies)
    } else if existing.range != other.range {
        Some(ConflictKind::Range)
    } else {
        None
    }
}
