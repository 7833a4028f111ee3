//! Relative order of operations.
//!
//! Compute operations (copy, map, map_reduce) are *explicitly* sequenced: the
//! analysis stores them in a total order built from their sequence hints and
//! their use-def chains. Every other operation is *implicitly* sequenced: it
//! is placed right after the latest explicitly sequenced operation it
//! (transitively) depends on, its anchor, and is never stored.
//!
//! Reads of the previous iteration by feedback operations do not constrain
//! the order, which is what makes loop-carried values schedulable.

use crate::analysis::dataflow::DataflowGraph;
use crate::analysis::program_point::{Direction, ProgramPoint};
use crate::ir::{num_common_loops, OpId, Program, UseKind};
use crate::utils::errors::SequenceError;
use crate::utils::intern::Symbol;
use crate::PassConfig;
use log::{debug, error, trace, warn};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::ops::Bound;
use std::rc::Rc;

const SLOT_MIN: i64 = i64::MIN / 2;
const SLOT_MAX: i64 = i64::MAX / 2;
/// Distance between slots after a group is renumbered.
const SLOT_STRIDE: i64 = 1 << 32;

/// Position of an explicitly sequenced operation.
///
/// Operations inserted next to another one share its `number`; the `slot`
/// orders operations sharing a number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SequenceKey {
    pub number: i64,
    pub slot: i64,
}

impl SequenceKey {
    pub fn new(number: i64) -> Self {
        Self { number, slot: 0 }
    }
}

impl fmt::Display for SequenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.slot == 0 {
            write!(f, "{}", self.number)
        } else {
            write!(f, "{}.{}", self.number, self.slot)
        }
    }
}

/// Where an operation falls in the order. Implicitly sequenced operations
/// come right after their anchor; `None` anchors precede every key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Position {
    anchor: Option<SequenceKey>,
    implicit: bool,
}

type AnchorCache = HashMap<OpId, Option<SequenceKey>>;

/// Relative order of the operations of a program.
#[derive(Debug, Clone, Default)]
pub struct SequenceAnalysis {
    sequenced: BTreeMap<SequenceKey, OpId>,
    keys: HashMap<OpId, SequenceKey>,
}

impl SequenceAnalysis {
    /// Analyze `program`, or return `None` if its operations cannot be
    /// ordered. The reason is logged when `report_errors` is set.
    pub fn create(program: &Program, report_errors: bool) -> Option<Self> {
        match Self::build(program) {
            Ok(analysis) => Some(analysis),
            Err(err) => {
                if report_errors {
                    error!("{}: {}", program.name, err);
                }
                None
            }
        }
    }

    /// Analyze `program`, reporting why it cannot be ordered.
    pub fn try_new(program: &Program, config: &PassConfig) -> Result<Self, SequenceError> {
        Self::build(program).map_err(|err| {
            if config.report_errors {
                error!("{}: {}", program.name, err);
            }
            err
        })
    }

    fn build(program: &Program) -> Result<Self, SequenceError> {
        if let Some(cycle) = DataflowGraph::build(program).find_cycle() {
            return Err(SequenceError::cyclic(
                "use-def cycle not going through a feedback operation",
                cycle,
            ));
        }

        let graph = DataflowGraph::with_hints(program);
        if let Some(cycle) = graph.find_cycle() {
            return Err(SequenceError::cyclic(
                "sequence attributes contradict the use-def order",
                cycle,
            ));
        }
        let order = graph.topological_order().map_err(|unordered| {
            SequenceError::cyclic("operations cannot be ordered", unordered)
        })?;

        let mut analysis = Self::default();
        let compute = order
            .into_iter()
            .filter(|&op| program.op(op).map_or(false, |op| op.is_compute()));
        for (number, op) in compute.enumerate() {
            analysis.store(op, SequenceKey::new(number as i64));
        }
        debug!(
            "sequenced {} compute operations of '{}'",
            analysis.len(),
            program.name
        );
        Ok(analysis)
    }

    fn store(&mut self, op: OpId, key: SequenceKey) {
        self.sequenced.insert(key, op);
        self.keys.insert(op, key);
    }

    /// Explicitly sequenced operations in order.
    pub fn ops(&self) -> impl DoubleEndedIterator<Item = OpId> + '_ {
        self.sequenced.values().copied()
    }

    /// Explicitly sequenced operations strictly before `op`. Empty if `op`
    /// is not sequenced.
    pub fn ops_before(&self, op: OpId) -> impl DoubleEndedIterator<Item = OpId> + '_ {
        let end = match self.keys.get(&op) {
            Some(&key) => Bound::Excluded(key),
            None => Bound::Excluded(SequenceKey { number: i64::MIN, slot: i64::MIN }),
        };
        self.sequenced
            .range((Bound::Unbounded, end))
            .map(|(_, &op)| op)
    }

    pub fn contains(&self, op: OpId) -> bool {
        self.keys.contains_key(&op)
    }

    pub fn len(&self) -> usize {
        self.sequenced.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequenced.is_empty()
    }

    pub fn key(&self, op: OpId) -> Option<SequenceKey> {
        self.keys.get(&op).copied()
    }

    /// Sequence number of an explicitly sequenced operation. Inserted
    /// operations share the number of their reference.
    pub fn sequence_number(&self, op: OpId) -> Option<i64> {
        self.key(op).map(|key| key.number)
    }

    /// Sets the sequence hint of every sequenced operation to its index in
    /// the order.
    pub fn assign_inferred(&self, program: &mut Program) {
        for (index, op) in self.ops().enumerate() {
            match program.op_mut(op) {
                Some(op) => op.sequence = Some(index as i64),
                None => warn!("sequenced operation {} is not in the program", op),
            }
        }
    }

    pub fn prev_op(&self, op: OpId) -> Option<OpId> {
        let key = self.key(op)?;
        self.sequenced.range(..key).next_back().map(|(_, &op)| op)
    }

    pub fn next_op(&self, op: OpId) -> Option<OpId> {
        let key = self.key(op)?;
        self.sequenced
            .range((Bound::Excluded(key), Bound::Unbounded))
            .next()
            .map(|(_, &op)| op)
    }

    /// First and last of `ops` in the order, ignoring operations that are
    /// not sequenced.
    pub fn get_span(&self, ops: &[OpId]) -> Option<(OpId, OpId)> {
        let sequenced = || ops.iter().filter_map(|&op| self.key(op).map(|key| (key, op)));
        let (_, first) = sequenced().min()?;
        let (_, last) = sequenced().max()?;
        Some((first, last))
    }

    /// Latest explicitly sequenced operation `op` depends on, ignoring
    /// previous-iteration reads.
    fn anchor(&self, program: &Program, op: OpId, cache: &mut AnchorCache) -> Option<SequenceKey> {
        if let Some(&anchor) = cache.get(&op) {
            return anchor;
        }
        cache.insert(op, None);

        let mut anchor = None;
        if let Some(operation) = program.op(op) {
            for (value, kind) in operation.uses() {
                if kind == UseKind::PriorIteration {
                    continue;
                }
                let Some(producer) = program.producer(value) else {
                    continue;
                };
                let candidate = match self.key(producer) {
                    Some(key) => Some(key),
                    None => self.anchor(program, producer, cache),
                };
                anchor = anchor.max(candidate);
            }
        }

        cache.insert(op, anchor);
        anchor
    }

    fn position(&self, program: &Program, op: OpId, cache: &mut AnchorCache) -> Position {
        match self.key(op) {
            Some(key) => Position {
                anchor: Some(key),
                implicit: false,
            },
            None => Position {
                anchor: self.anchor(program, op, cache),
                implicit: true,
            },
        }
    }

    /// Whether `first` is known to come before `second`.
    ///
    /// Implicitly sequenced operations sharing an anchor are only ordered if
    /// one uses the other, directly or not.
    pub fn is_before(&self, program: &Program, first: OpId, second: OpId) -> bool {
        if first == second {
            return false;
        }
        let mut cache = AnchorCache::new();
        let lhs = self.position(program, first, &mut cache);
        let rhs = self.position(program, second, &mut cache);
        if lhs != rhs {
            return lhs < rhs;
        }
        DataflowGraph::build(program).reaches(first, second)
    }

    pub fn is_after(&self, program: &Program, first: OpId, second: OpId) -> bool {
        self.is_before(program, second, first)
    }

    /// Whether `point` comes before `op`.
    pub fn point_is_before(&self, program: &Program, point: &ProgramPoint, op: OpId) -> bool {
        match point.operation() {
            None => point.direction() == Direction::Before,
            Some(anchor) if anchor == op => point.direction() == Direction::Before,
            Some(anchor) => self.is_before(program, anchor, op),
        }
    }

    /// Whether `point` comes after `op`.
    pub fn point_is_after(&self, program: &Program, point: &ProgramPoint, op: OpId) -> bool {
        match point.operation() {
            None => point.direction() == Direction::After,
            Some(anchor) if anchor == op => point.direction() == Direction::After,
            Some(anchor) => self.is_after(program, anchor, op),
        }
    }

    /// Sequence `op` immediately before or after `reference`. Operations
    /// already sequenced are moved.
    ///
    /// If `reference` is not explicitly sequenced, `op` is placed next to
    /// the anchor of `reference` instead, or first if it has none.
    pub fn insert(&mut self, program: &Program, op: OpId, reference: OpId, direction: Direction) {
        if op == reference {
            warn!("cannot sequence {} relative to itself", op);
            return;
        }
        self.erase(op);

        let reference = if self.contains(reference) {
            Some(reference)
        } else {
            let anchor = self.anchor(program, reference, &mut AnchorCache::new());
            trace!(
                "{} is implicitly sequenced, inserting {} {} its anchor",
                reference,
                op,
                direction
            );
            anchor.and_then(|key| self.sequenced.get(&key).copied())
        };

        let key = self.allocate_key(reference, direction);
        trace!("sequencing {} at {}", op, key);
        self.store(op, key);
    }

    /// Remove `op` from the order. Returns `false` if it was not sequenced.
    pub fn erase(&mut self, op: OpId) -> bool {
        match self.keys.remove(&op) {
            Some(key) => {
                self.sequenced.remove(&key);
                true
            }
            None => false,
        }
    }

    /// Give `new` the position of `old`, which leaves the order.
    pub fn replace(&mut self, program: &Program, old: OpId, new: OpId) {
        if !self.contains(old) {
            warn!("{} is not sequenced, cannot replace it by {}", old, new);
            return;
        }
        self.insert(program, new, old, Direction::After);
        self.erase(old);
    }

    fn neighbours(
        &self,
        reference: Option<OpId>,
        direction: Direction,
    ) -> (Option<SequenceKey>, Option<SequenceKey>) {
        let Some(key) = reference.and_then(|op| self.key(op)) else {
            return (None, self.sequenced.keys().next().copied());
        };
        match direction {
            Direction::Before => (self.sequenced.range(..key).next_back().map(|(k, _)| *k), Some(key)),
            Direction::After => (
                Some(key),
                self.sequenced
                    .range((Bound::Excluded(key), Bound::Unbounded))
                    .next()
                    .map(|(k, _)| *k),
            ),
        }
    }

    /// A free key between `reference` and its neighbour on the `direction`
    /// side. With no reference, a key before every other one.
    fn allocate_key(&mut self, reference: Option<OpId>, direction: Direction) -> SequenceKey {
        loop {
            let (lower, upper) = self.neighbours(reference, direction);
            let number = reference
                .and_then(|op| self.sequence_number(op))
                .or(upper.map(|key| key.number))
                .unwrap_or(0);
            let lo = lower.filter(|key| key.number == number).map_or(SLOT_MIN, |key| key.slot);
            let hi = upper.filter(|key| key.number == number).map_or(SLOT_MAX, |key| key.slot);
            match midpoint(lo, hi) {
                Some(slot) => return SequenceKey { number, slot },
                None => self.renumber(number),
            }
        }
    }

    /// Spread the slots of the operations numbered `number` evenly.
    fn renumber(&mut self, number: i64) {
        let from = SequenceKey { number, slot: i64::MIN };
        let to = SequenceKey { number, slot: i64::MAX };
        let group: Vec<(SequenceKey, OpId)> = self
            .sequenced
            .range(from..=to)
            .map(|(k, op)| (*k, *op))
            .collect();
        debug!("renumbering {} operations sharing sequence number {}", group.len(), number);

        for (old, _) in &group {
            self.sequenced.remove(old);
        }
        let offset = (group.len() / 2) as i64;
        for (index, (_, op)) in group.into_iter().enumerate() {
            let slot = (index as i64 - offset) * SLOT_STRIDE;
            self.store(op, SequenceKey { number, slot });
        }
    }

    /// The first point, starting from `start` in `direction`, where an
    /// operation nested in the `num_loops` outermost loops of `loop_nest`
    /// can be inserted without splitting a deeper loop of `loop_nest`.
    ///
    /// An implicitly sequenced `start` is replaced by its anchor. If it has
    /// no anchor it sits at the start of the program, which is returned.
    /// Returns `None` if `start` is not in `program`.
    pub fn find_insertion_point(
        &self,
        program: &Program,
        start: OpId,
        loop_nest: &[Symbol],
        num_loops: usize,
        direction: Direction,
    ) -> Option<ProgramPoint> {
        if !program.contains(start) {
            return None;
        }
        let start = if self.contains(start) {
            start
        } else {
            let anchor = self.anchor(program, start, &mut AnchorCache::new());
            match anchor.and_then(|key| self.sequenced.get(&key).copied()) {
                Some(op) => op,
                None => return Some(ProgramPoint::boundary(Direction::Before)),
            }
        };
        let num_loops = num_loops.min(loop_nest.len());
        let loop_names = |op: OpId| program.op(op).map(|op| op.loop_names()).unwrap_or_default();

        let mut current = start;
        let mut current_depth = num_common_loops(&loop_names(start), loop_nest);
        // The point between `current` and `next` splits a loop if both are
        // nested in it.
        while current_depth > num_loops {
            let next = match direction {
                Direction::Before => self.prev_op(current),
                Direction::After => self.next_op(current),
            };
            let Some(next) = next else {
                return Some(ProgramPoint::boundary(direction));
            };
            let next_depth = num_common_loops(&loop_names(next), loop_nest);
            if next_depth <= num_loops {
                break;
            }
            current = next;
            current_depth = next_depth;
        }

        let point = ProgramPoint::at_op(program, current, direction).ok()?;
        let depth = point.num_common_loops_with(&loop_nest[..num_loops]);
        Some(point.trim_loop_nest(depth))
    }

    /// Every operation of `program`: explicitly sequenced operations in
    /// order, each followed by the operations anchored at it.
    pub fn all_ops<'a>(&'a self, program: &'a Program) -> AllOps<'a> {
        AllOps::new(self, program)
    }
}

fn midpoint(lo: i64, hi: i64) -> Option<i64> {
    let (lo, hi) = (lo as i128, hi as i128);
    if hi - lo < 2 {
        return None;
    }
    Some((lo + (hi - lo) / 2) as i64)
}

/// Implicitly sequenced operations grouped by anchor.
#[derive(Debug)]
struct ImplicitOps {
    groups: HashMap<Option<SequenceKey>, Vec<OpId>>,
    graph: DataflowGraph,
}

impl ImplicitOps {
    fn ordered(&self, anchor: Option<SequenceKey>) -> VecDeque<OpId> {
        match self.groups.get(&anchor) {
            Some(group) => self.graph.order_subset(group).into(),
            None => VecDeque::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cursor {
    Start,
    At(SequenceKey),
    Done,
}

/// Iterator over explicitly and implicitly sequenced operations.
///
/// Walks the explicit order with a cursor; after each explicit operation it
/// drains a buffer holding the implicit operations anchored there, ordered
/// so that producers come before their users.
#[derive(Debug, Clone)]
pub struct AllOps<'a> {
    analysis: &'a SequenceAnalysis,
    implicit: Rc<ImplicitOps>,
    cursor: Cursor,
    buffer: VecDeque<OpId>,
}

impl<'a> AllOps<'a> {
    fn new(analysis: &'a SequenceAnalysis, program: &'a Program) -> Self {
        let mut cache = AnchorCache::new();
        let mut groups: HashMap<Option<SequenceKey>, Vec<OpId>> = HashMap::new();
        for (id, _) in program.ops() {
            if analysis.contains(id) {
                continue;
            }
            let anchor = analysis.anchor(program, id, &mut cache);
            groups.entry(anchor).or_default().push(id);
        }
        let implicit = Rc::new(ImplicitOps {
            groups,
            graph: DataflowGraph::build(program),
        });
        let buffer = implicit.ordered(None);
        Self {
            analysis,
            implicit,
            cursor: Cursor::Start,
            buffer,
        }
    }
}

impl Iterator for AllOps<'_> {
    type Item = OpId;

    fn next(&mut self) -> Option<OpId> {
        if let Some(op) = self.buffer.pop_front() {
            return Some(op);
        }
        let next = match self.cursor {
            Cursor::Start => self.analysis.sequenced.iter().next(),
            Cursor::At(key) => self
                .analysis
                .sequenced
                .range((Bound::Excluded(key), Bound::Unbounded))
                .next(),
            Cursor::Done => return None,
        };
        match next {
            Some((&key, &op)) => {
                self.cursor = Cursor::At(key);
                self.buffer = self.implicit.ordered(Some(key));
                Some(op)
            }
            None => {
                self.cursor = Cursor::Done;
                None
            }
        }
    }
}

impl std::iter::FusedIterator for AllOps<'_> {}
