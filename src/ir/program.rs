//! Programs: an arena of operations in program order and the values they
//! define.

use crate::ir::attrs::DomainShape;
use crate::ir::op::{OpKind, Operation, OperationState};
use crate::ir::types::{ElementType, Type};
use crate::utils::errors::IrError;
use std::fmt;

/// A unique identifier for operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(pub u32);

impl OpId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op{}", self.0)
    }
}

/// A unique identifier for values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub u32);

impl ValueId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Definition of a value: its type and the result slot producing it.
#[derive(Debug, Clone)]
pub struct ValueDef {
    pub ty: Type,
    pub producer: OpId,
    pub index: usize,
}

/// A program: operations in program order.
///
/// Erased operations leave a hole in the arena so that ids stay stable.
#[derive(Debug, Clone, Default)]
pub struct Program {
    /// Name of the program
    pub name: String,
    ops: Vec<Option<Operation>>,
    order: Vec<OpId>,
    values: Vec<ValueDef>,
}

impl Program {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn op(&self, id: OpId) -> Option<&Operation> {
        self.ops.get(id.0 as usize).and_then(|op| op.as_ref())
    }

    pub fn op_mut(&mut self, id: OpId) -> Option<&mut Operation> {
        self.ops.get_mut(id.0 as usize).and_then(|op| op.as_mut())
    }

    /// Like [`Program::op`], reporting missing operations as errors.
    pub fn try_op(&self, id: OpId) -> Result<&Operation, IrError> {
        self.op(id).ok_or(IrError::UnknownOp(id))
    }

    pub fn contains(&self, id: OpId) -> bool {
        self.op(id).is_some()
    }

    pub fn value(&self, id: ValueId) -> Option<&ValueDef> {
        self.values.get(id.0 as usize)
    }

    pub fn value_type(&self, id: ValueId) -> Option<&Type> {
        self.value(id).map(|def| &def.ty)
    }

    /// The live operation producing `value`.
    pub fn producer(&self, value: ValueId) -> Option<OpId> {
        self.value(value)
            .map(|def| def.producer)
            .filter(|&op| self.contains(op))
    }

    /// Operation ids in program order.
    pub fn op_ids(&self) -> &[OpId] {
        &self.order
    }

    /// Operations in program order.
    pub fn ops(&self) -> impl Iterator<Item = (OpId, &Operation)> + '_ {
        self.order
            .iter()
            .filter_map(move |&id| self.op(id).map(|op| (id, op)))
    }

    /// Compute operations in program order.
    pub fn compute_ops(&self) -> impl Iterator<Item = (OpId, &Operation)> + '_ {
        self.ops().filter(|(_, op)| op.is_compute())
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Index of `op` in program order.
    pub fn position(&self, op: OpId) -> Option<usize> {
        self.order.iter().position(|&id| id == op)
    }

    /// Operations using `value`, in program order, without duplicates.
    pub fn users(&self, value: ValueId) -> Vec<OpId> {
        self.ops()
            .filter(|(_, op)| op.uses().any(|(v, _)| v == value))
            .map(|(id, _)| id)
            .collect()
    }

    pub fn has_uses(&self, value: ValueId) -> bool {
        self.ops().any(|(_, op)| op.uses().any(|(v, _)| v == value))
    }

    /// Append an operation at the end of the program.
    pub fn push(&mut self, state: OperationState) -> OpId {
        let id = self.allocate(state);
        self.order.push(id);
        id
    }

    /// Insert an operation immediately before `before`.
    pub fn insert_before(&mut self, state: OperationState, before: OpId) -> Result<OpId, IrError> {
        let pos = self.position(before).ok_or(IrError::UnknownOp(before))?;
        let id = self.allocate(state);
        self.order.insert(pos, id);
        Ok(id)
    }

    fn allocate(&mut self, state: OperationState) -> OpId {
        let id = OpId(self.ops.len() as u32);
        let results: Vec<ValueId> = state
            .result_types
            .into_iter()
            .enumerate()
            .map(|(index, ty)| {
                let value = ValueId(self.values.len() as u32);
                self.values.push(ValueDef { ty, producer: id, index });
                value
            })
            .collect();
        let mut memory_spaces = state.memory_spaces;
        memory_spaces.resize(results.len(), None);
        self.ops.push(Some(Operation {
            kind: state.kind,
            domain: state.domain,
            shape: state.shape,
            access_patterns: state.access_patterns,
            operands: state.operands,
            results,
            loop_nest: state.loop_nest,
            sequence: state.sequence,
            memory_spaces,
            body: state.body,
            span: state.span,
        }));
        id
    }

    /// Remove `op` from the program. Fails if any of its results is used.
    pub fn erase(&mut self, op: OpId) -> Result<(), IrError> {
        let results = self.try_op(op)?.results.clone();
        if let Some(&value) = results.iter().find(|&&v| self.has_uses(v)) {
            return Err(IrError::ResultInUse { op, value });
        }
        self.order.retain(|&id| id != op);
        self.ops[op.0 as usize] = None;
        Ok(())
    }

    /// Redirect every use of `from` to `to`.
    pub fn replace_all_uses(&mut self, from: ValueId, to: ValueId) {
        for op in self.ops.iter_mut().flatten() {
            for v in op.domain.iter_mut().chain(op.operands.iter_mut()) {
                if *v == from {
                    *v = to;
                }
            }
        }
    }

    /// Add an independent range with the given step.
    pub fn add_range(&mut self, step: i64) -> ValueId {
        let id = self.push(
            OperationState::new(OpKind::Range { step }).result(Type::range(DomainShape::scalar())),
        );
        self.result(id, 0)
    }

    /// Add a range whose bounds depend on the dimensions of `domain`.
    pub fn add_dependent_range(&mut self, domain: Vec<ValueId>, shape: DomainShape, step: i64) -> ValueId {
        let state = OperationState::new(OpKind::Range { step })
            .domain(domain)
            .shape(shape.clone())
            .result(Type::range(shape));
        let id = self.push(state);
        self.result(id, 0)
    }

    /// Add an external scalar of the given element type.
    pub fn add_scalar(&mut self, element: ElementType) -> ValueId {
        let id = self.push(
            OperationState::new(OpKind::FromScalar)
                .result(Type::value(DomainShape::scalar(), element)),
        );
        self.result(id, 0)
    }

    /// The `index`-th result of `op`.
    ///
    /// # Panics
    /// Panics if `op` does not exist or has fewer results; meant for building
    /// programs, not for passes.
    pub fn result(&self, op: OpId, index: usize) -> ValueId {
        match self.op(op) {
            Some(op) => op.results[index],
            None => panic!("no operation {}", op),
        }
    }
}
