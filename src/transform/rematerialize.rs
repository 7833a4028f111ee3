//! Loop rematerialization.
//!
//! An operation may name a logical loop in its loop nest without iterating
//! over it yet: the loop is marked for rematerialization. This pass gives
//! such operations a real domain dimension for every pending loop, taking
//! the range and step from the operation where the loop is materialized,
//! then projects the new dimensions out of the results so that users see
//! the original shapes.
//!
//! Example, with `i` materialized elsewhere over `%ri`:
//! ```text
//! %v = map[d0:%rj] loop_nest [j:d0, i:remat]
//! ```
//! becomes
//! ```text
//! %w = map[d0:%rj, d1:%ri] loop_nest [j:d0, i:d1]
//! %v = projection[d0:%rj] x [d1:%ri] (%w(d0, d1))
//! ```
//!
//! New dimensions go right after the parallel dimensions; reduction
//! dimensions of map_reduce operations move right to make room.

use crate::analysis::loop_bounds::{LoopBoundsCollector, LoopBoundsTable};
use crate::analysis::sequence::SequenceAnalysis;
use crate::ir::{
    AccessPattern, DomainShape, DomainShapeDim, ElementType, Loop, LoopIterator, LoopNest, OpId, OpKind,
    OperationState, Program, Rewriter, Type, ValueId,
};
use crate::transform::Transform;
use crate::utils::errors::{IrError, TransformError, TransformErrorKind};
use crate::utils::intern::Symbol;
use crate::PassConfig;
use anyhow::Result;
use log::{debug, trace, warn};
use std::collections::HashSet;

const NAME: &str = "rematerialize";

/// One rewritten operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rematerialization {
    /// The erased operation
    pub original: OpId,
    /// The operation with the extra dimensions
    pub replacement: OpId,
    /// One projection per result of the original operation
    pub projections: Vec<OpId>,
}

/// Operations rewritten by one run of the pass, in program order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RematerializeReport {
    pub rewrites: Vec<Rematerialization>,
}

impl RematerializeReport {
    pub fn len(&self) -> usize {
        self.rewrites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rewrites.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rematerialization> {
        self.rewrites.iter()
    }

    /// The rewrite of `original`, if it was rewritten.
    pub fn rewrite_of(&self, original: OpId) -> Option<&Rematerialization> {
        self.rewrites.iter().find(|r| r.original == original)
    }
}

/// Everything needed to rewrite one operation, computed before the program
/// is touched.
#[derive(Debug, Clone)]
struct Plan {
    op: OpId,
    num_parallel: usize,
    extra_domain: Vec<ValueId>,
    loop_nest: LoopNest,
    shape: DomainShape,
}

impl Plan {
    fn num_remat(&self) -> usize {
        self.extra_domain.len()
    }

    /// Shape of the results: the parallel and rematerialized dimensions.
    fn result_shape(&self) -> DomainShape {
        self.shape.prefix(self.num_parallel + self.num_remat())
    }
}

/// The rematerialization pass.
#[derive(Debug, Clone, Default)]
pub struct Rematerialize {
    config: PassConfig,
}

impl Rematerialize {
    pub fn new(config: PassConfig) -> Self {
        Self { config }
    }

    /// Rematerialize every pending loop of the program behind `rewriter`.
    ///
    /// All operations are validated before the first edit, so an error
    /// leaves the program untouched.
    pub fn run<R: Rewriter>(&self, rewriter: &mut R) -> Result<RematerializeReport, TransformError> {
        let table = LoopBoundsCollector::new().collect(rewriter.program());
        if table.pending.is_empty() {
            trace!("no loop to rematerialize in '{}'", rewriter.program().name);
            return Ok(RematerializeReport::default());
        }
        self.check_conflicts(rewriter.program(), &table)?;

        let plans = table
            .pending
            .iter()
            .map(|op| plan(rewriter.program(), op, &table))
            .collect::<Result<Vec<_>, _>>()?;

        let mut report = RematerializeReport::default();
        for plan in plans {
            report.rewrites.push(apply(rewriter, plan)?);
        }
        debug!(
            "rematerialized loops of {} operation(s) in '{}'",
            report.len(),
            rewriter.program().name
        );
        Ok(report)
    }

    /// Reject programs where a loop to rematerialize is materialized with
    /// different bounds in different operations.
    fn check_conflicts(&self, program: &Program, table: &LoopBoundsTable) -> Result<(), TransformError> {
        let pending: HashSet<Symbol> = table
            .pending
            .iter()
            .filter_map(|op| program.op(op))
            .flat_map(|op| op.loops().iter())
            .filter(|l| l.iter.is_rematerialize())
            .map(|l| l.name)
            .collect();

        for conflict in table.conflicts.iter().filter(|c| pending.contains(&c.loop_name)) {
            if self.config.strict_loop_bounds {
                let span = program.op(conflict.op).map(|op| op.span).unwrap_or_default();
                return Err(TransformError::malformed(NAME, conflict.to_string()).at(conflict.op, span));
            }
            warn!("{}", conflict);
        }
        Ok(())
    }
}

impl Transform for Rematerialize {
    fn apply(&self, program: &mut Program) -> Result<bool> {
        let report = self.run(program)?;
        Ok(!report.is_empty())
    }

    fn name(&self) -> &str {
        NAME
    }
}

/// Keep `analysis` current after `report`: each replacement takes the place
/// of its original.
pub fn update_sequence(analysis: &mut SequenceAnalysis, program: &Program, report: &RematerializeReport) {
    for rewrite in report.iter() {
        analysis.replace(program, rewrite.original, rewrite.replacement);
    }
}

fn plan(program: &Program, id: OpId, table: &LoopBoundsTable) -> Result<Plan, TransformError> {
    let op = program.try_op(id).map_err(|e| ir_error(id, e))?;
    let malformed = |message: String| TransformError::malformed(NAME, message).at(id, op.span);

    if !matches!(op.kind, OpKind::Copy | OpKind::Map | OpKind::MapReduce { .. }) {
        return Err(TransformError::new(
            TransformErrorKind::UnsupportedOperationKind,
            NAME,
            format!("cannot rematerialize loops of a '{}' operation", op.kind),
        )
        .at(id, op.span));
    }
    if op.shape.num_dims() != op.domain.len() {
        return Err(malformed(format!(
            "shape has {} dimensions for a domain of {}",
            op.shape.num_dims(),
            op.domain.len()
        )));
    }
    let num_parallel = op.num_parallel_dims();
    if num_parallel > op.domain.len() {
        return Err(malformed(format!(
            "{} parallel dimensions in a domain of {}",
            num_parallel,
            op.domain.len()
        )));
    }
    let num_remat = op.loops().iter().filter(|l| l.iter.is_rematerialize()).count();

    // Materialized loops past the parallel dimensions move right; pending
    // loops take the freed positions in order.
    let mut loop_nest = LoopNest::new();
    let mut extra_domain = Vec::with_capacity(num_remat);
    let mut position = num_parallel;
    for lp in op.loops() {
        match lp.iter {
            LoopIterator::Dimension { dimension, step } => {
                let dimension = if dimension >= num_parallel {
                    dimension + num_remat
                } else {
                    dimension
                };
                loop_nest.push(Loop::dim(lp.name, dimension, step));
            }
            LoopIterator::Rematerialize => {
                let bounds = table
                    .get(lp.name)
                    .ok_or_else(|| malformed(format!("loop '{}' is not materialized in any operation", lp.name)))?;
                extra_domain.push(bounds.range);
                loop_nest.push(Loop::dim(lp.name, position, bounds.step));
                position += 1;
            }
        }
    }

    let orig_dims = op.shape.dims();
    let mut dims: Vec<DomainShapeDim> = orig_dims[..num_parallel].to_vec();
    for (old, new) in op.loops().iter().zip(&loop_nest) {
        if !old.iter.is_rematerialize() {
            continue;
        }
        let own = new.iter.dimension().unwrap_or(position);
        let bounds = table
            .get(new.name)
            .ok_or_else(|| malformed(format!("loop '{}' is not materialized in any operation", new.name)))?;
        if !bounds.is_complete() {
            return Err(malformed(format!(
                "loop '{}' has a range depending on dimensions no loop iterates over",
                new.name
            )));
        }
        let dependencies = bounds
            .dependent_on
            .iter()
            .map(|&dep| {
                let dim = loop_nest
                    .iter()
                    .find(|l| l.name == dep)
                    .and_then(|l| l.iter.dimension())
                    .ok_or_else(|| {
                        malformed(format!(
                            "loop '{}' depends on loop '{}' which is missing from the loop nest",
                            new.name, dep
                        ))
                    })?;
                if dim >= own {
                    return Err(malformed(format!(
                        "loop '{}' depends on loop '{}' which is not placed before it",
                        new.name, dep
                    )));
                }
                Ok(dim)
            })
            .collect::<Result<Vec<_>, _>>()?;
        dims.push(DomainShapeDim::new(AccessPattern::new(own, dependencies)));
    }
    for dim in &orig_dims[num_parallel..] {
        dims.push(DomainShapeDim::new(
            dim.dependency_pattern().shift_right(num_remat, num_parallel),
        ));
    }

    Ok(Plan {
        op: id,
        num_parallel,
        extra_domain,
        loop_nest,
        shape: DomainShape::new(dims),
    })
}

fn apply<R: Rewriter>(rewriter: &mut R, plan: Plan) -> Result<Rematerialization, TransformError> {
    let id = plan.op;
    let op = rewriter.program().try_op(id).map_err(|e| ir_error(id, e))?.clone();
    let num_parallel = plan.num_parallel;
    let num_remat = plan.num_remat();
    let result_shape = plan.result_shape();
    debug!("rematerializing {} loop(s) of {} ({})", num_remat, id, op.kind);

    let original_types = op
        .results
        .iter()
        .map(|&v| {
            rewriter
                .program()
                .value_type(v)
                .cloned()
                .ok_or_else(|| ir_error(id, IrError::UnknownValue(v)))
        })
        .collect::<Result<Vec<Type>, _>>()?;

    // Copy and map operations have no reduction dimensions, so this only
    // appends to their domain.
    let mut domain = op.domain[..num_parallel].to_vec();
    domain.extend_from_slice(&plan.extra_domain);
    domain.extend_from_slice(&op.domain[num_parallel..]);

    // Inserted dimensions index the results, so they count as parallel.
    let kind = match op.kind {
        OpKind::MapReduce { num_parallel, num_inits } => OpKind::MapReduce {
            num_parallel: num_parallel + num_remat,
            num_inits,
        },
        kind => kind,
    };
    let mut state = OperationState::new(kind).domain(domain).shape(plan.shape.clone());
    state.operands = op.operands.clone();
    state.access_patterns = op
        .access_patterns
        .iter()
        .map(|p| p.shift_right(num_remat, num_parallel))
        .collect();
    state.result_types = original_types
        .iter()
        .map(|ty| ty.with_shape(result_shape.clone()))
        .collect();
    state.memory_spaces = op.memory_spaces.clone();
    state.loop_nest = Some(plan.loop_nest);
    state.sequence = op.sequence;
    state.span = op.span;
    if let Some(mut body) = rewriter.take_body(id) {
        body.insert_arguments(num_parallel, num_remat, ElementType::Index);
        state.body = Some(body);
    }

    let replacement = rewriter.create_op(state, id).map_err(|e| ir_error(id, e))?;
    trace!("created {} replacing {}", replacement, id);
    let new_results = rewriter
        .program()
        .try_op(replacement)
        .map_err(|e| ir_error(id, e))?
        .results
        .clone();

    let mut projection_domain = op.domain[..num_parallel].to_vec();
    projection_domain.extend_from_slice(&plan.extra_domain);

    let mut projections = Vec::with_capacity(op.results.len());
    for (index, (&old, &new)) in op.results.iter().zip(&new_results).enumerate() {
        let ty = original_types[index].clone();
        let state = OperationState::new(OpKind::Projection { num_parallel })
            .domain(projection_domain.clone())
            .shape(result_shape.clone())
            .operand(new, AccessPattern::identity(num_parallel + num_remat))
            .span(op.span);
        let state = match op.memory_space(index) {
            Some(space) => state.result_in(ty, space),
            None => state.result(ty),
        };
        let projection = rewriter.create_op(state, id).map_err(|e| ir_error(id, e))?;
        let projected = rewriter
            .program()
            .try_op(projection)
            .map_err(|e| ir_error(id, e))?
            .results[0];
        rewriter.replace_all_uses(old, projected);
        trace!("{} projects {} onto the shape of {}", projection, new, old);
        projections.push(projection);
    }

    rewriter.erase_op(id).map_err(|e| ir_error(id, e))?;

    Ok(Rematerialization {
        original: id,
        replacement,
        projections,
    })
}

fn ir_error(op: OpId, err: IrError) -> TransformError {
    let mut error = TransformError::malformed(NAME, err.to_string());
    error.op = Some(op);
    error
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BinaryOp, BodyExpr, MemorySpace, RecordingRewriter, RewriteEvent, Region};

    fn value_ty(dims: usize) -> Type {
        Type::value(DomainShape::hyper_rectangular(dims), ElementType::F32)
    }

    /// `i` materialized over `%ri` by a first map, pending in a second one.
    fn simple_program() -> (Program, ValueId, OpId) {
        let mut program = Program::new("p");
        let ri = program.add_range(1);
        let rj = program.add_range(2);
        program.push(
            OperationState::new(OpKind::Map)
                .domain(vec![ri])
                .result(value_ty(1))
                .loop_nest([Loop::dim("i", 0, 1)]),
        );
        let pending = program.push(
            OperationState::new(OpKind::Map)
                .domain(vec![rj])
                .result_in(value_ty(1), MemorySpace::Register)
                .loop_nest([Loop::dim("j", 0, 2), Loop::remat("i")])
                .body(Region::new(
                    vec![ElementType::Index],
                    vec![BodyExpr::binary(BinaryOp::Mul, BodyExpr::Argument(0), BodyExpr::Int(2))],
                )),
        );
        (program, ri, pending)
    }

    #[test]
    fn test_plan_map() {
        let (program, ri, pending) = simple_program();
        let table = LoopBoundsCollector::new().collect(&program);
        let plan = plan(&program, pending, &table).unwrap();
        assert_eq!(plan.num_parallel, 1);
        assert_eq!(plan.extra_domain, vec![ri]);
        assert_eq!(
            plan.loop_nest.as_slice(),
            &[Loop::dim("j", 0, 2), Loop::dim("i", 1, 1)]
        );
        assert_eq!(plan.shape, DomainShape::hyper_rectangular(2));
        assert_eq!(plan.result_shape().num_dims(), 2);
    }

    #[test]
    fn test_rewrite_through_recording_rewriter() {
        let (mut program, _, pending) = simple_program();
        let mut rewriter = RecordingRewriter::new(&mut program);
        let report = Rematerialize::default().run(&mut rewriter).unwrap();
        let rewrite = report.rewrite_of(pending).unwrap().clone();

        assert_eq!(rewriter.created(), vec![rewrite.replacement, rewrite.projections[0]]);
        assert_eq!(rewriter.events.first(), Some(&RewriteEvent::TookBody(pending)));
        assert_eq!(rewriter.events.last(), Some(&RewriteEvent::Erased(pending)));

        let replacement = program.op(rewrite.replacement).unwrap();
        let body = replacement.body.as_ref().unwrap();
        assert_eq!(body.arguments, vec![ElementType::Index, ElementType::Index]);
        assert_eq!(
            body.yields[0],
            BodyExpr::binary(BinaryOp::Mul, BodyExpr::Argument(0), BodyExpr::Int(2))
        );
        assert_eq!(replacement.memory_space(0), Some(MemorySpace::Register));

        let projection = program.op(rewrite.projections[0]).unwrap();
        assert_eq!(projection.kind, OpKind::Projection { num_parallel: 1 });
        assert_eq!(projection.memory_space(0), Some(MemorySpace::Register));
        assert_eq!(program.value_type(projection.results[0]), Some(&value_ty(1)));
    }

    #[test]
    fn test_map_reduce_moves_reduction_dims() {
        let mut program = Program::new("p");
        let ri = program.add_range(1);
        let rp = program.add_range(1);
        let rr = program.add_range(1);
        program.push(
            OperationState::new(OpKind::Map)
                .domain(vec![ri])
                .result(value_ty(1))
                .loop_nest([Loop::dim("i", 0, 1)]),
        );
        let init = program.push(
            OperationState::new(OpKind::Map)
                .domain(vec![rp])
                .result(value_ty(1))
                .loop_nest([Loop::dim("p", 0, 1)]),
        );
        let init_out = program.result(init, 0);
        let input = program.push(
            OperationState::new(OpKind::Map)
                .domain(vec![rp, rr])
                .result(value_ty(2))
                .loop_nest([Loop::dim("p", 0, 1), Loop::dim("r", 1, 1)]),
        );
        let input_out = program.result(input, 0);
        let reduce = program.push(
            OperationState::new(OpKind::MapReduce { num_parallel: 1, num_inits: 1 })
                .domain(vec![rp, rr])
                .operand(init_out, AccessPattern::new(2, vec![0]))
                .operand(input_out, AccessPattern::identity(2))
                .result(value_ty(1))
                .loop_nest([Loop::dim("p", 0, 1), Loop::dim("r", 1, 1), Loop::remat("i")])
                .body(Region::new(
                    vec![ElementType::Index, ElementType::Index, ElementType::F32, ElementType::F32],
                    vec![BodyExpr::binary(BinaryOp::Add, BodyExpr::Argument(2), BodyExpr::Argument(3))],
                )),
        );

        let report = Rematerialize::default().run(&mut program).unwrap();
        let rewrite = report.rewrite_of(reduce).unwrap();
        let op = program.op(rewrite.replacement).unwrap();
        assert_eq!(op.domain, vec![rp, ri, rr]);
        assert_eq!(op.kind, OpKind::MapReduce { num_parallel: 2, num_inits: 1 });
        assert_eq!(op.parallel_domain(), &[rp, ri]);
        assert_eq!(
            op.num_parallel_dims(),
            program.value_type(op.results[0]).unwrap().shape().num_dims()
        );
        assert_eq!(op.access_patterns[0], AccessPattern::new(3, vec![0]));
        assert_eq!(op.access_patterns[1], AccessPattern::new(3, vec![0, 2]));
        assert_eq!(
            op.loops(),
            &[Loop::dim("p", 0, 1), Loop::dim("r", 2, 1), Loop::dim("i", 1, 1)]
        );
        let body = op.body.as_ref().unwrap();
        assert_eq!(body.num_arguments(), 5);
        assert_eq!(
            body.yields[0],
            BodyExpr::binary(BinaryOp::Add, BodyExpr::Argument(3), BodyExpr::Argument(4))
        );
        assert_eq!(program.value_type(op.results[0]).unwrap().shape().num_dims(), 2);
    }

    #[test]
    fn test_copy_gains_dimension() {
        let (mut program, ri, _) = simple_program();
        let rj = program.add_range(1);
        let source = program.push(
            OperationState::new(OpKind::Map)
                .domain(vec![rj])
                .result(value_ty(1))
                .loop_nest([Loop::dim("j", 0, 1)]),
        );
        let source_out = program.result(source, 0);
        let copy = program.push(
            OperationState::new(OpKind::Copy)
                .domain(vec![rj])
                .operand(source_out, AccessPattern::identity(1))
                .result(value_ty(1))
                .loop_nest([Loop::dim("j", 0, 1), Loop::remat("i")]),
        );

        let report = Rematerialize::new(PassConfig::default().with_strict_loop_bounds(false))
            .run(&mut program)
            .unwrap();
        let op = program.op(report.rewrite_of(copy).unwrap().replacement).unwrap();
        assert_eq!(op.kind, OpKind::Copy);
        assert_eq!(op.domain, vec![rj, ri]);
        assert_eq!(op.operands, vec![source_out]);
        assert_eq!(op.access_patterns[0].use_domain_size(), 2);
        assert_eq!(op.access_patterns[0].dimensions(), &[0]);
        assert!(op.body.is_none());
        assert_eq!(program.value_type(op.results[0]), Some(&value_ty(2)));
    }

    #[test]
    fn test_unsupported_kind_is_rejected_before_any_edit() {
        let (mut program, _, _) = simple_program();
        let rk = program.add_range(1);
        let scalar = program.add_scalar(ElementType::F32);
        program.push(
            OperationState::new(OpKind::Feedback)
                .domain(vec![rk])
                .operand(scalar, AccessPattern::new(1, vec![]))
                .result(value_ty(1))
                .loop_nest([Loop::remat("i")]),
        );
        let before = program.len();

        let err = Rematerialize::default().run(&mut program).unwrap_err();
        assert_eq!(err.kind, TransformErrorKind::UnsupportedOperationKind);
        assert_eq!(program.len(), before);
    }

    #[test]
    fn test_dependency_on_later_loop_is_malformed() {
        let mut program = Program::new("p");
        let ri = program.add_range(1);
        let shape = DomainShape::new(vec![
            DomainShapeDim::new(AccessPattern::new(0, vec![])),
            DomainShapeDim::new(AccessPattern::new(1, vec![0])),
        ]);
        let rj = program.add_dependent_range(vec![ri], DomainShape::hyper_rectangular(1), 1);
        program.push(
            OperationState::new(OpKind::Map)
                .domain(vec![ri, rj])
                .shape(shape.clone())
                .result(Type::value(shape, ElementType::F32))
                .loop_nest([Loop::dim("i", 0, 1), Loop::dim("j", 1, 1)]),
        );
        let rk = program.add_range(1);
        // `j` needs `i`, which comes after it in this nest.
        program.push(
            OperationState::new(OpKind::Map)
                .domain(vec![rk])
                .result(value_ty(1))
                .loop_nest([Loop::dim("k", 0, 1), Loop::remat("j"), Loop::remat("i")]),
        );

        let err = Rematerialize::default().run(&mut program).unwrap_err();
        assert_eq!(err.kind, TransformErrorKind::MalformedProgram);
        assert!(err.message.contains("not placed before"));
    }

    #[test]
    fn test_dependency_without_loop_is_malformed() {
        let mut program = Program::new("p");
        let ri = program.add_range(1);
        let rj = program.add_dependent_range(vec![ri], DomainShape::hyper_rectangular(1), 1);
        let shape = DomainShape::new(vec![
            DomainShapeDim::new(AccessPattern::new(0, vec![])),
            DomainShapeDim::new(AccessPattern::new(1, vec![0])),
        ]);
        program.push(
            OperationState::new(OpKind::Map)
                .domain(vec![ri, rj])
                .shape(shape.clone())
                .result(Type::value(shape, ElementType::F32))
                .loop_nest([Loop::dim("j", 1, 1)]),
        );
        let rk = program.add_range(1);
        let pending = program.push(
            OperationState::new(OpKind::Map)
                .domain(vec![rk])
                .result(value_ty(1))
                .loop_nest([Loop::dim("k", 0, 1), Loop::remat("j")]),
        );
        let before = program.len();

        let err = Rematerialize::default().run(&mut program).unwrap_err();
        assert_eq!(err.kind, TransformErrorKind::MalformedProgram);
        assert_eq!(err.op, Some(pending));
        assert!(err.message.contains("no loop iterates over"));
        assert_eq!(program.len(), before);
    }

    #[test]
    fn test_conflicting_bounds() {
        let (mut program, _, _) = simple_program();
        let other = program.add_range(1);
        program.push(
            OperationState::new(OpKind::Map)
                .domain(vec![other])
                .result(value_ty(1))
                .loop_nest([Loop::dim("i", 0, 1)]),
        );

        let err = Rematerialize::default().run(&mut program.clone()).unwrap_err();
        assert_eq!(err.kind, TransformErrorKind::MalformedProgram);

        let lenient = Rematerialize::new(PassConfig::default().with_strict_loop_bounds(false));
        assert_eq!(lenient.run(&mut program).unwrap().len(), 1);
    }

    #[test]
    fn test_update_sequence() {
        let (mut program, _, pending) = simple_program();
        let mut analysis = SequenceAnalysis::create(&program, false).unwrap();
        let before: Vec<_> = analysis.ops().collect();

        let report = Rematerialize::default().run(&mut program).unwrap();
        update_sequence(&mut analysis, &program, &report);

        let replacement = report.rewrite_of(pending).unwrap().replacement;
        let after: Vec<_> = analysis.ops().collect();
        assert_eq!(after.len(), before.len());
        assert_eq!(after[1], replacement);
        assert!(!analysis.contains(pending));
    }
}
