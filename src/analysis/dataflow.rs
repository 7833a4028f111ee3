//! Use-def graph of a program.
//!
//! Nodes are operations plus, optionally, barrier nodes that encode explicit
//! sequence hints: every operation with hint `h` points to the barrier
//! separating `h` from the next larger hint, which points to every operation
//! carrying that hint. Reads of the previous iteration by feedback operations
//! are kept as a distinct edge kind and ignored by every ordering query.

use crate::ir::{OpId, Program, UseKind};
use log::trace;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, EdgeFiltered, EdgeRef};
use petgraph::Direction;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};

/// A node of the dataflow graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GraphNode {
    Op(OpId),
    /// Separates operations hinted `< h` or `== h` from the next hint group.
    Barrier(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    /// Producer to consumer
    Data,
    /// Producer of the previous-iteration value to the feedback operation
    Feedback,
    /// Ordering imposed by explicit sequence hints
    Hint,
}

impl EdgeKind {
    /// Whether the edge constrains the sequence order.
    pub fn is_ordering(&self) -> bool {
        !matches!(self, EdgeKind::Feedback)
    }
}

/// Dataflow graph over the operations of a program.
#[derive(Debug, Clone)]
pub struct DataflowGraph {
    graph: DiGraph<GraphNode, EdgeKind>,
    nodes: HashMap<OpId, NodeIndex>,
    positions: HashMap<OpId, usize>,
}

impl DataflowGraph {
    /// Build the use-def graph of `program`.
    pub fn build(program: &Program) -> Self {
        let mut graph = DiGraph::new();
        let mut nodes = HashMap::new();
        let mut positions = HashMap::new();

        for (pos, (id, _)) in program.ops().enumerate() {
            nodes.insert(id, graph.add_node(GraphNode::Op(id)));
            positions.insert(id, pos);
        }

        for (id, op) in program.ops() {
            let user = nodes[&id];
            let mut seen = HashSet::new();
            for (value, kind) in op.uses() {
                let Some(producer) = program.producer(value) else {
                    continue;
                };
                let edge = match kind {
                    UseKind::PriorIteration => EdgeKind::Feedback,
                    UseKind::Domain | UseKind::Operand => EdgeKind::Data,
                };
                if seen.insert((producer, edge)) {
                    graph.add_edge(nodes[&producer], user, edge);
                }
            }
        }

        Self {
            graph,
            nodes,
            positions,
        }
    }

    /// Build the use-def graph of `program` and add hint edges for the
    /// explicit sequence hints of its compute operations.
    pub fn with_hints(program: &Program) -> Self {
        let mut this = Self::build(program);

        let mut groups: BTreeMap<i64, Vec<OpId>> = BTreeMap::new();
        for (id, op) in program.compute_ops() {
            if let Some(hint) = op.sequence {
                groups.entry(hint).or_default().push(id);
            }
        }

        let groups: Vec<(i64, Vec<OpId>)> = groups.into_iter().collect();
        for pair in groups.windows(2) {
            let (hint, earlier) = &pair[0];
            let (_, later) = &pair[1];
            let barrier = this.graph.add_node(GraphNode::Barrier(*hint));
            for op in earlier {
                this.graph.add_edge(this.nodes[op], barrier, EdgeKind::Hint);
            }
            for op in later {
                this.graph.add_edge(barrier, this.nodes[op], EdgeKind::Hint);
            }
        }
        trace!("added {} hint barriers", groups.len().saturating_sub(1));

        this
    }

    pub fn node(&self, op: OpId) -> Option<NodeIndex> {
        self.nodes.get(&op).copied()
    }

    pub fn num_ops(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph contains an edge of the given kind from `from` to `to`.
    pub fn has_edge(&self, from: OpId, to: OpId, kind: EdgeKind) -> bool {
        let (Some(from), Some(to)) = (self.node(from), self.node(to)) else {
            return false;
        };
        self.graph
            .edges_connecting(from, to)
            .any(|e| *e.weight() == kind)
    }

    /// Find a cycle made of ordering edges. Returns the operations on the
    /// cycle, starting and ending with the same operation.
    pub fn find_cycle(&self) -> Option<Vec<OpId>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let mut color = vec![Color::White; self.graph.node_count()];
        let mut parent: Vec<Option<NodeIndex>> = vec![None; self.graph.node_count()];

        for root in self.graph.node_indices() {
            if color[root.index()] != Color::White {
                continue;
            }
            // Iterative DFS; each frame holds the node and its pending successors.
            let mut stack = vec![(root, self.successors(root))];
            color[root.index()] = Color::Gray;

            while let Some((node, successors)) = stack.last_mut() {
                let node = *node;
                match successors.pop() {
                    Some(next) => match color[next.index()] {
                        Color::White => {
                            color[next.index()] = Color::Gray;
                            parent[next.index()] = Some(node);
                            stack.push((next, self.successors(next)));
                        }
                        Color::Gray => return Some(self.cycle_path(&parent, node, next)),
                        Color::Black => {}
                    },
                    None => {
                        color[node.index()] = Color::Black;
                        stack.pop();
                    }
                }
            }
        }
        None
    }

    fn successors(&self, node: NodeIndex) -> Vec<NodeIndex> {
        let mut successors: Vec<NodeIndex> = self
            .graph
            .edges_directed(node, Direction::Outgoing)
            .filter(|e| e.weight().is_ordering())
            .map(|e| e.target())
            .collect();
        // Visit in increasing node order once popped from the back.
        successors.sort_by(|a, b| b.cmp(a));
        successors
    }

    fn cycle_path(&self, parent: &[Option<NodeIndex>], last: NodeIndex, first: NodeIndex) -> Vec<OpId> {
        let mut path = vec![last];
        let mut current = last;
        while current != first {
            match parent[current.index()] {
                Some(p) => {
                    path.push(p);
                    current = p;
                }
                None => break,
            }
        }
        path.reverse();
        path.push(first);
        path.into_iter()
            .filter_map(|n| match self.graph[n] {
                GraphNode::Op(op) => Some(op),
                GraphNode::Barrier(_) => None,
            })
            .collect()
    }

    /// Whether `to` is reachable from `from` through data edges.
    pub fn reaches(&self, from: OpId, to: OpId) -> bool {
        let (Some(from), Some(to)) = (self.node(from), self.node(to)) else {
            return false;
        };
        if from == to {
            return false;
        }
        let data = EdgeFiltered::from_fn(&self.graph, |e| *e.weight() == EdgeKind::Data);
        let mut dfs = Dfs::new(&data, from);
        while let Some(node) = dfs.next(&data) {
            if node == to {
                return true;
            }
        }
        false
    }

    /// Deterministic topological order of the operations, following ordering
    /// edges. Among ready operations the one earliest in program order comes
    /// first; barriers are released as soon as they are ready.
    ///
    /// Returns the operations that could not be ordered if the graph has a
    /// cycle.
    pub fn topological_order(&self) -> Result<Vec<OpId>, Vec<OpId>> {
        let all: Vec<NodeIndex> = self.graph.node_indices().collect();
        self.kahn(&all)
    }

    /// Topological order of `ops` alone, following ordering edges between
    /// them. Ties are broken by program order.
    pub fn order_subset(&self, ops: &[OpId]) -> Vec<OpId> {
        let subset: Vec<NodeIndex> = ops.iter().filter_map(|&op| self.node(op)).collect();
        match self.kahn(&subset) {
            Ok(order) => order,
            Err(_) => {
                let mut order = ops.to_vec();
                order.sort_by_key(|op| self.positions.get(op).copied().unwrap_or(usize::MAX));
                order
            }
        }
    }

    fn kahn(&self, subset: &[NodeIndex]) -> Result<Vec<OpId>, Vec<OpId>> {
        let members: HashSet<NodeIndex> = subset.iter().copied().collect();
        let mut in_degree: HashMap<NodeIndex, usize> = subset.iter().map(|&n| (n, 0)).collect();
        for &node in subset {
            for edge in self.graph.edges_directed(node, Direction::Outgoing) {
                if edge.weight().is_ordering() && members.contains(&edge.target()) {
                    *in_degree.entry(edge.target()).or_default() += 1;
                }
            }
        }

        let mut ready_ops = BinaryHeap::new();
        let mut ready_barriers = Vec::new();
        for &node in subset {
            if in_degree[&node] == 0 {
                self.make_ready(node, &mut ready_ops, &mut ready_barriers);
            }
        }

        let mut order = Vec::with_capacity(subset.len());
        let mut visited = 0;
        loop {
            let node = match ready_barriers.pop() {
                Some(barrier) => barrier,
                None => match ready_ops.pop() {
                    Some(Reverse((_, node))) => node,
                    None => break,
                },
            };
            visited += 1;
            if let GraphNode::Op(op) = self.graph[node] {
                order.push(op);
            }
            for edge in self.graph.edges_directed(node, Direction::Outgoing) {
                let target = edge.target();
                if !edge.weight().is_ordering() || !members.contains(&target) {
                    continue;
                }
                if let Some(degree) = in_degree.get_mut(&target) {
                    *degree -= 1;
                    if *degree == 0 {
                        self.make_ready(target, &mut ready_ops, &mut ready_barriers);
                    }
                }
            }
        }

        if visited == subset.len() {
            Ok(order)
        } else {
            let placed: HashSet<OpId> = order.into_iter().collect();
            Err(subset
                .iter()
                .filter_map(|&n| match self.graph[n] {
                    GraphNode::Op(op) if !placed.contains(&op) => Some(op),
                    _ => None,
                })
                .collect())
        }
    }

    fn make_ready(
        &self,
        node: NodeIndex,
        ready_ops: &mut BinaryHeap<Reverse<(usize, NodeIndex)>>,
        ready_barriers: &mut Vec<NodeIndex>,
    ) {
        match self.graph[node] {
            GraphNode::Op(op) => {
                let pos = self.positions.get(&op).copied().unwrap_or(usize::MAX);
                ready_ops.push(Reverse((pos, node)));
            }
            GraphNode::Barrier(_) => ready_barriers.push(node),
        }
    }
}
