//! Insertion-ordered sets of operations.

use crate::ir::program::OpId;
use std::collections::HashSet;

/// A set of operations that remembers insertion order, so iterating over it
/// is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpSet {
    order: Vec<OpId>,
    members: HashSet<OpId>,
}

impl OpSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `op`; returns `false` if it was already present.
    pub fn insert(&mut self, op: OpId) -> bool {
        if self.members.insert(op) {
            self.order.push(op);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, op: OpId) -> bool {
        self.members.contains(&op)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = OpId> + '_ {
        self.order.iter().copied()
    }
}
