//! Integration tests for rematerialization and sequencing.

use polysched::analysis::{collect_loop_bounds, AllOps, ConflictKind};
use polysched::prelude::*;
use polysched::transform::update_sequence;
use polysched::{analyze_sequence, rematerialize_program};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn value_ty(dims: usize) -> Type {
    Type::value(DomainShape::hyper_rectangular(dims), ElementType::F32)
}

fn map_op(domain: Vec<ValueId>) -> OperationState {
    let dims = domain.len();
    OperationState::new(OpKind::Map).domain(domain).result(value_ty(dims))
}

#[test]
fn test_basic_rematerialization() {
    init_logging();
    let mut program = Program::new("basic");
    let ri = program.add_range(1);
    let rj = program.add_range(1);
    program.push(map_op(vec![ri]).loop_nest([Loop::dim("i", 0, 1)]));
    let pending = program.push(map_op(vec![rj]).loop_nest([Loop::dim("j", 0, 1), Loop::remat("i")]));
    let pending_out = program.result(pending, 0);
    let user = program.push(
        map_op(vec![rj])
            .operand(pending_out, AccessPattern::identity(1))
            .loop_nest([Loop::dim("j", 0, 1)]),
    );

    let report = rematerialize_program(&mut program, &PassConfig::default()).unwrap();
    assert_eq!(report.len(), 1);
    let rewrite = report.rewrite_of(pending).unwrap();
    assert!(!program.contains(pending));

    // The replacement iterates over the range of `i` right after `j`.
    let replacement = program.op(rewrite.replacement).unwrap();
    assert_eq!(replacement.domain, vec![rj, ri]);
    assert_eq!(
        replacement.loops(),
        &[Loop::dim("j", 0, 1), Loop::dim("i", 1, 1)]
    );
    assert_eq!(replacement.shape.num_dims(), 2);

    // The projection removes that dimension again.
    assert_eq!(rewrite.projections.len(), 1);
    let projection = program.op(rewrite.projections[0]).unwrap();
    assert_eq!(projection.kind, OpKind::Projection { num_parallel: 1 });
    assert_eq!(projection.domain, vec![rj, ri]);
    assert_eq!(projection.operands, vec![replacement.results[0]]);
    assert_eq!(projection.access_patterns, vec![AccessPattern::identity(2)]);
    assert_eq!(program.value_type(projection.results[0]), Some(&value_ty(1)));

    // Uses are redirected and the new operations sit where the old one was.
    assert_eq!(program.op(user).unwrap().operands, vec![projection.results[0]]);
    let position = |op| program.position(op).unwrap();
    assert!(position(rewrite.replacement) < position(rewrite.projections[0]));
    assert!(position(rewrite.projections[0]) < position(user));
    assert!(collect_loop_bounds(&program).pending.is_empty());
}

#[test]
fn test_dependent_rematerialized_loops() {
    init_logging();
    let mut program = Program::new("dependent");
    let ri = program.add_range(1);
    let rj = program.add_dependent_range(vec![ri], DomainShape::hyper_rectangular(1), 1);
    let triangle = DomainShape::new(vec![
        DomainShapeDim::new(AccessPattern::new(0, vec![])),
        DomainShapeDim::new(AccessPattern::new(1, vec![0])),
    ]);
    program.push(
        OperationState::new(OpKind::Map)
            .domain(vec![ri, rj])
            .shape(triangle.clone())
            .result(Type::value(triangle, ElementType::F32))
            .loop_nest([Loop::dim("i", 0, 1), Loop::dim("j", 1, 1)]),
    );
    let rk = program.add_range(1);
    let pending = program.push(
        map_op(vec![rk]).loop_nest([Loop::dim("k", 0, 1), Loop::remat("i"), Loop::remat("j")]),
    );

    let report = rematerialize_program(&mut program, &PassConfig::default()).unwrap();
    let rewrite = report.rewrite_of(pending).unwrap();
    let op = program.op(rewrite.replacement).unwrap();

    assert_eq!(op.domain, vec![rk, ri, rj]);
    assert_eq!(op.loops()[1], Loop::dim("i", 1, 1));
    assert_eq!(op.loops()[2], Loop::dim("j", 2, 1));
    let dims = op.shape.dims();
    assert!(dims[1].dependencies().is_empty());
    assert_eq!(dims[2].dependencies(), &[1]);
    assert_eq!(dims[2].dependency_pattern().use_domain_size(), 2);
}

#[test]
fn test_unsupported_kind_leaves_program_untouched() {
    init_logging();
    let mut program = Program::new("unsupported");
    let ri = program.add_range(1);
    program.push(map_op(vec![ri]).loop_nest([Loop::dim("i", 0, 1)]));
    let pending = program.push(map_op(vec![ri]).loop_nest([Loop::remat("i")]));
    let source = program.push(map_op(vec![ri]));
    let source_out = program.result(source, 0);
    program.push(
        OperationState::new(OpKind::Projection { num_parallel: 0 })
            .domain(vec![ri])
            .operand(source_out, AccessPattern::identity(1))
            .result(Type::value(DomainShape::scalar(), ElementType::F32))
            .loop_nest([Loop::remat("i")]),
    );
    let ops_before: Vec<OpId> = program.op_ids().to_vec();

    let pass = Rematerialize::default();
    let err = pass.apply(&mut program).unwrap_err();
    let err = err.downcast_ref::<TransformError>().unwrap();
    assert_eq!(err.kind, TransformErrorKind::UnsupportedOperationKind);
    assert_eq!(program.op_ids(), ops_before.as_slice());
    assert!(program.op(pending).unwrap().has_pending_loops());
    assert_eq!(pass.name(), "rematerialize");
}

#[test]
fn test_missing_loop_bounds() {
    init_logging();
    let mut program = Program::new("missing");
    let ri = program.add_range(1);
    let pending = program.push(map_op(vec![ri]).loop_nest([Loop::dim("i", 0, 1), Loop::remat("nowhere")]));

    let err = rematerialize_program(&mut program, &PassConfig::default()).unwrap_err();
    match err {
        SchedError::Transform(err) => {
            assert_eq!(err.kind, TransformErrorKind::MalformedProgram);
            assert_eq!(err.op, Some(pending));
            assert!(err.message.contains("nowhere"));
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(program.contains(pending));
}

#[test]
fn test_lenient_loop_bounds() {
    init_logging();
    let mut program = Program::new("lenient");
    let ri = program.add_range(1);
    let ri2 = program.add_range(1);
    program.push(map_op(vec![ri]).loop_nest([Loop::dim("i", 0, 1)]));
    program.push(map_op(vec![ri2]).loop_nest([Loop::dim("i", 0, 1)]));
    let pending = program.push(map_op(vec![ri]).loop_nest([Loop::remat("i")]));

    let table = collect_loop_bounds(&program);
    assert_eq!(table.conflicts.len(), 1);
    assert_eq!(table.conflicts[0].kind, ConflictKind::Range);

    assert!(rematerialize_program(&mut program.clone(), &PassConfig::default()).is_err());
    let config = PassConfig::default().with_strict_loop_bounds(false);
    let report = rematerialize_program(&mut program, &config).unwrap();
    // The first occurrence wins.
    let op = program.op(report.rewrite_of(pending).unwrap().replacement).unwrap();
    assert_eq!(op.domain, vec![ri, ri]);
}

/// A diamond `a -> (b, c) -> d` plus an independent op `e` hinted before `a`.
fn diamond() -> (Program, [OpId; 5]) {
    let mut program = Program::new("diamond");
    let r = program.add_range(1);
    let a = program.push(map_op(vec![r]).sequence(0));
    let a_out = program.result(a, 0);
    let b = program.push(map_op(vec![r]).operand(a_out, AccessPattern::identity(1)));
    let c = program.push(
        OperationState::new(OpKind::Copy)
            .domain(vec![r])
            .operand(a_out, AccessPattern::identity(1))
            .result(value_ty(1)),
    );
    let (b_out, c_out) = (program.result(b, 0), program.result(c, 0));
    let d = program.push(
        map_op(vec![r])
            .operand(b_out, AccessPattern::identity(1))
            .operand(c_out, AccessPattern::identity(1)),
    );
    let e = program.push(map_op(vec![r]).sequence(-1));
    (program, [a, b, c, d, e])
}

#[test]
fn test_ordering_consistent_with_dataflow() {
    init_logging();
    let (program, [a, b, c, d, e]) = diamond();
    let analysis = analyze_sequence(&program, &PassConfig::default()).unwrap();
    assert_eq!(analysis.len(), 5);

    for (id, op) in program.compute_ops() {
        for &value in &op.operands {
            let producer = program.producer(value).unwrap();
            if program.op(producer).unwrap().is_compute() {
                assert!(analysis.is_before(&program, producer, id));
                assert!(analysis.is_after(&program, id, producer));
            }
        }
    }
    assert_eq!(analysis.ops().next(), Some(e));
    assert_eq!(analysis.get_span(&[d, b, c]), Some((b, d)));
    assert!(analysis.is_before(&program, a, d));
}

#[test]
fn test_cycles_need_feedback() {
    init_logging();
    let mut program = Program::new("cycle");
    let r = program.add_range(1);
    let a = program.push(map_op(vec![r]));
    let a_out = program.result(a, 0);
    let b = program.push(map_op(vec![r]).operand(a_out, AccessPattern::identity(1)));
    let b_out = program.result(b, 0);
    {
        let op = program.op_mut(a).unwrap();
        op.operands.push(b_out);
        op.access_patterns.push(AccessPattern::identity(1));
    }

    assert!(SequenceAnalysis::create(&program, true).is_none());
    let err = analyze_sequence(&program, &PassConfig::default().with_report_errors(true)).unwrap_err();
    match err {
        SchedError::Sequence(err) => {
            assert_eq!(err.kind, SequenceErrorKind::CyclicSchedule);
            assert!(err.cycle.contains(&a) && err.cycle.contains(&b));
        }
        other => panic!("unexpected error: {}", other),
    }

    // The same loop through a feedback operation is fine.
    let mut program = Program::new("feedback");
    let r = program.add_range(1);
    let init = program.add_scalar(ElementType::F32);
    let fby = program.push(OperationState::new(OpKind::Feedback).domain(vec![r]).result(value_ty(1)));
    let fby_out = program.result(fby, 0);
    let a = program.push(map_op(vec![r]).operand(fby_out, AccessPattern::identity(1)));
    let a_out = program.result(a, 0);
    let b = program.push(map_op(vec![r]).operand(a_out, AccessPattern::identity(1)));
    let b_out = program.result(b, 0);
    {
        let op = program.op_mut(fby).unwrap();
        op.operands = vec![init, b_out];
        op.access_patterns = vec![AccessPattern::new(1, vec![]), AccessPattern::identity(1)];
    }

    let analysis = SequenceAnalysis::create(&program, true).unwrap();
    assert_eq!(analysis.ops().collect::<Vec<_>>(), vec![a, b]);
    assert!(analysis.is_before(&program, fby, a));
    assert!(!analysis.is_before(&program, b, fby));
}

#[test]
fn test_assign_inferred_is_idempotent() {
    init_logging();
    let (mut program, _) = diamond();
    let analysis = SequenceAnalysis::create(&program, false).unwrap();
    let all_before: Vec<OpId> = analysis.all_ops(&program).collect();

    analysis.assign_inferred(&mut program);
    let hints: Vec<Option<i64>> = program.compute_ops().map(|(_, op)| op.sequence).collect();
    analysis.assign_inferred(&mut program);
    let hints_again: Vec<Option<i64>> = program.compute_ops().map(|(_, op)| op.sequence).collect();
    assert_eq!(hints, hints_again);
    assert_eq!(analysis.all_ops(&program).collect::<Vec<_>>(), all_before);

    // Rebuilding from the inferred hints gives the same order.
    let rebuilt = SequenceAnalysis::create(&program, false).unwrap();
    assert_eq!(rebuilt.ops().collect::<Vec<_>>(), analysis.ops().collect::<Vec<_>>());
    assert_eq!(rebuilt.all_ops(&program).collect::<Vec<_>>(), all_before);
}

#[test]
fn test_insert_erase_round_trip() {
    init_logging();
    let (mut program, [_, b, _, _, _]) = diamond();
    let r = program.op(b).unwrap().domain[0];
    let b_out = program.result(b, 0);
    let proj = program.push(
        OperationState::new(OpKind::Projection { num_parallel: 0 })
            .domain(vec![r])
            .operand(b_out, AccessPattern::identity(1))
            .result(Type::value(DomainShape::scalar(), ElementType::F32)),
    );
    let mut analysis = SequenceAnalysis::create(&program, false).unwrap();
    let x = program.push(map_op(vec![r]));

    let others: Vec<OpId> = program.op_ids().iter().copied().filter(|&op| op != x).collect();
    let snapshot = |analysis: &SequenceAnalysis| -> Vec<(bool, bool)> {
        let mut result = Vec::new();
        for &lhs in &others {
            for &rhs in &others {
                result.push((
                    analysis.is_before(&program, lhs, rhs),
                    analysis.is_after(&program, lhs, rhs),
                ));
            }
        }
        result
    };

    let before = snapshot(&analysis);
    analysis.insert(&program, x, b, Direction::Before);
    assert!(analysis.is_before(&program, x, b));
    assert_eq!(analysis.next_op(x), Some(b));
    assert!(analysis.is_after(&program, proj, b));
    assert!(analysis.erase(x));
    assert_eq!(snapshot(&analysis), before);
}

#[test]
fn test_merged_iteration_order() {
    init_logging();
    let mut program = Program::new("merged");
    let r = program.add_range(1);
    let s = program.add_scalar(ElementType::F32);
    let a = program.push(map_op(vec![r]).operand(s, AccessPattern::new(1, vec![])));
    let a_out = program.result(a, 0);
    let p1 = program.push(
        OperationState::new(OpKind::Projection { num_parallel: 0 })
            .domain(vec![r])
            .operand(a_out, AccessPattern::identity(1))
            .result(Type::value(DomainShape::scalar(), ElementType::F32)),
    );
    let p1_out = program.result(p1, 0);
    let b = program.push(map_op(vec![r]).operand(p1_out, AccessPattern::new(1, vec![])));

    let analysis = SequenceAnalysis::create(&program, false).unwrap();
    let range_op = program.producer(r).unwrap();
    let scalar_op = program.producer(s).unwrap();

    let iter: AllOps<'_> = analysis.all_ops(&program);
    let fork = iter.clone();
    let all: Vec<OpId> = iter.collect();
    assert_eq!(all, vec![range_op, scalar_op, a, p1, b]);
    assert_eq!(fork.count(), program.len());
}

#[test]
fn test_insertion_point_after_rematerialization() {
    init_logging();
    let mut program = Program::new("points");
    let ri = program.add_range(1);
    let rj = program.add_range(1);
    let first = program.push(map_op(vec![ri, rj]).loop_nest([Loop::dim("i", 0, 1), Loop::dim("j", 1, 1)]));
    let pending = program.push(map_op(vec![ri]).loop_nest([Loop::dim("i", 0, 1), Loop::remat("j")]));
    let last = program.push(map_op(vec![ri]).loop_nest([Loop::dim("i", 0, 1)]));

    let mut analysis = SequenceAnalysis::create(&program, false).unwrap();
    let report = rematerialize_program(&mut program, &PassConfig::default()).unwrap();
    update_sequence(&mut analysis, &program, &report);
    let replacement = report.rewrite_of(pending).unwrap().replacement;
    assert_eq!(analysis.ops().collect::<Vec<_>>(), vec![first, replacement, last]);

    // Leave loop `j` after `first`: both `first` and the replacement are in it.
    let nest = [Symbol::new("i"), Symbol::new("j")];
    let point = analysis
        .find_insertion_point(&program, first, &nest, 1, Direction::After)
        .unwrap();
    assert_eq!(point.operation(), Some(replacement));
    assert_eq!(point.loop_nest(), &[Symbol::new("i")]);
    assert!(analysis.point_is_before(&program, &point, last));
    assert!(analysis.point_is_after(&program, &point, first));
}
