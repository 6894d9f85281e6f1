//! End-to-end tests for the reduce combiner pass.

mod common;

use common::{Fixture, Link, copy_results, describe, instructions_with};
use spmd_analysis::CallGraph;
use spmd_ir::{
    ComputationBuilder, InstrKind, InstrRef, Instruction, Literal, Module, Opcode, PrimitiveType,
    ReplicaGroup, Shape, Sharding, dump_module, replica_groups, scalar_reducer,
};
use spmd_opt::{CollectivePairFinder, Pass, ReduceCombiner, Rejection, optimize};

fn bf16_input() -> Shape {
    Shape::array(PrimitiveType::BF16, [4])
}

fn combine(module: &mut Module) -> bool {
    combine_with(module, 2)
}

fn combine_with(module: &mut Module, num_partitions: usize) -> bool {
    let changed = ReduceCombiner::new(num_partitions).run(module).unwrap();
    module.verify().unwrap();
    changed
}

fn assert_all(module: &Module, expected: &str) {
    let results = copy_results(module);
    assert!(!results.is_empty());
    for (copy, r) in results.into_iter().enumerate() {
        assert_eq!(describe(module, r), expected, "copy {copy}");
    }
}

fn fused_groups(module: &Module) -> Vec<Vec<ReplicaGroup>> {
    instructions_with(module, Opcode::UnionReduce)
        .into_iter()
        .map(|r| module.instr(r).unwrap().replica_groups().unwrap().to_vec())
        .collect()
}

/// Asserts the combiner leaves `fixture` alone and that key 1 was rejected
/// for a reason accepted by `check`.
fn assert_rejected(fixture: &Fixture, num_partitions: usize, check: impl Fn(&Rejection) -> bool) {
    let mut module = fixture.build();
    {
        let cg = CallGraph::build(&module).unwrap();
        let mut finder = CollectivePairFinder::new(&module, &cg, num_partitions);
        assert!(finder.find().is_empty());
        let reason = finder.rejected().get(&1).expect("key 1 was not rejected");
        assert!(check(reason), "unexpected rejection: {reason}");
    }
    let before = dump_module(&module);
    assert!(!combine_with(&mut module, num_partitions));
    assert_eq!(dump_module(&module), before);
}

// --- Accepted shapes ---

#[test]
fn convert_chain() {
    let mut module = Fixture::with_chain(vec![Link::Convert(PrimitiveType::F32)])
        .input(bf16_input())
        .build();
    assert!(combine(&mut module));
    assert_all(&module, "union-reduce(convert(parameter))");
    assert!(instructions_with(&module, Opcode::PartialReduce).is_empty());
    assert_eq!(
        fused_groups(&module),
        vec![replica_groups(&[&[0, 1]]), replica_groups(&[&[0, 1]])]
    );
}

#[test]
fn fused_reduce_keeps_name_and_sharding() {
    let mut module = Fixture::with_chain(vec![Link::Negate]).build();
    assert!(combine(&mut module));
    for (copy, r) in copy_results(&module).into_iter().enumerate() {
        let ur = module.instr(r).unwrap();
        assert_eq!(ur.name, format!("ur{copy}"));
        assert_eq!(ur.sharding, Some(Sharding::maximal(copy as u32)));
    }
    assert_all(&module, "union-reduce(negate(parameter))");
}

#[test]
fn multiply_is_hoisted_after_reduce() {
    let mut module = Fixture::with_chain(vec![Link::Multiply(3.0)]).build();
    assert!(combine(&mut module));
    assert_all(&module, "multiply(union-reduce(parameter), constant(3))");
}

#[test]
fn add_leaf_is_divided_by_partition_count() {
    let mut module = Fixture::with_chain(vec![Link::Convert(PrimitiveType::F32), Link::Add(5.0)])
        .input(bf16_input())
        .build();
    assert!(combine(&mut module));
    assert_all(
        &module,
        "union-reduce(add(divide(constant(5), constant(2)), convert(parameter)))",
    );
}

#[test]
fn subtract_leaf_is_divided_on_either_side() {
    let mut module = Fixture::with_chain(vec![Link::Subtract(2.0)]).build();
    assert!(combine(&mut module));
    assert_all(
        &module,
        "union-reduce(subtract(parameter, divide(constant(2), constant(2))))",
    );

    let mut module = Fixture::with_chain(vec![Link::SubtractFrom(2.0)]).build();
    assert!(combine(&mut module));
    assert_all(
        &module,
        "union-reduce(subtract(divide(constant(2), constant(2)), parameter))",
    );
}

#[test]
fn bitcast_chain() {
    let mut module = Fixture::with_chain(vec![Link::Bitcast(PrimitiveType::F32)]).build();
    assert!(combine(&mut module));
    assert_all(&module, "union-reduce(bitcast(parameter))");
}

#[test]
fn integer_convert_chain() {
    let mut module = Fixture::with_chain(vec![Link::Convert(PrimitiveType::U32)])
        .input(Shape::array(PrimitiveType::S32, [4]))
        .build();
    assert!(combine(&mut module));
    assert_all(&module, "union-reduce(convert(parameter))");
}

#[test]
fn multiply_before_add_stays_in_place() {
    let mut module = Fixture::with_chain(vec![Link::Multiply(3.0), Link::Add(1.0)]).build();
    assert!(combine(&mut module));
    assert_all(
        &module,
        "union-reduce(add(divide(constant(1), constant(2)), multiply(parameter, constant(3))))",
    );
}

#[test]
fn trailing_multiplies_keep_their_order() {
    let mut module =
        Fixture::with_chain(vec![Link::Add(1.0), Link::Multiply(2.0), Link::Multiply(3.0)])
            .build();
    assert!(combine(&mut module));
    assert_all(
        &module,
        "multiply(multiply(union-reduce(add(divide(constant(1), constant(2)), parameter)), \
         constant(2)), constant(3))",
    );
}

#[test]
fn four_partitions() {
    let mut fixture = Fixture::with_chain(vec![Link::Add(8.0)]);
    fixture.partial_ids = (0..4).map(|i| vec![vec![i]]).collect();
    fixture.union_ids = vec![vec![0, 1, 2, 3]];
    fixture.shardings = (0..4).map(|d| Some(Sharding::maximal(d))).collect();
    let mut module = fixture.build();
    assert!(combine_with(&mut module, 4));
    assert_all(
        &module,
        "union-reduce(add(divide(constant(8), constant(4)), parameter))",
    );
}

#[test]
fn replica_ids_are_concatenated_per_branch() {
    let mut fixture = Fixture::with_chain(vec![Link::Negate]);
    fixture.partial_ids = vec![vec![vec![0], vec![2]], vec![vec![1], vec![3]]];
    fixture.union_ids = vec![vec![0, 1, 2, 3]];
    let mut module = fixture.build();
    assert!(combine(&mut module));
    for groups in fused_groups(&module) {
        assert_eq!(groups, vec![ReplicaGroup::new(vec![0, 2, 1, 3])]);
    }
}

// --- Rejected shapes ---

#[test]
fn differing_leaves_are_rejected() {
    let mut fixture = Fixture::with_chain(vec![Link::Convert(PrimitiveType::F32), Link::Add(5.0)])
        .input(bf16_input());
    fixture.leaf_override = Some((1, 1, 6.0));
    assert_rejected(&fixture, 2, |r| {
        matches!(r, Rejection::LeavesDiffer { position: 1, .. })
    });
}

#[test]
fn integer_arithmetic_is_rejected() {
    let s32 = Shape::array(PrimitiveType::S32, [4]);
    // 3 / 2 rounds to 1 in s32, so the fused sum would add 2 instead of 3.
    let fixture = Fixture::with_chain(vec![Link::Add(3.0)]).input(s32.clone());
    assert_rejected(&fixture, 2, |r| {
        matches!(
            r,
            Rejection::IntegerArithmetic {
                element: PrimitiveType::S32,
                ..
            }
        )
    });

    let fixture = Fixture::with_chain(vec![Link::Multiply(3.0)]).input(s32);
    assert_rejected(&fixture, 2, |r| matches!(r, Rejection::IntegerArithmetic { .. }));
}

#[test]
fn float_to_integer_convert_is_rejected() {
    let fixture = Fixture::with_chain(vec![Link::Convert(PrimitiveType::S32)]);
    assert_rejected(&fixture, 2, |r| {
        matches!(
            r,
            Rejection::LossyConvert {
                from: PrimitiveType::F32,
                to: PrimitiveType::S32,
                ..
            }
        )
    });

    let fixture = Fixture::with_chain(vec![Link::Convert(PrimitiveType::F32)])
        .input(Shape::array(PrimitiveType::S32, [4]));
    assert_rejected(&fixture, 2, |r| matches!(r, Rejection::LossyConvert { .. }));
}

#[test]
fn type_changing_bitcast_is_rejected() {
    let fixture = Fixture::with_chain(vec![Link::Bitcast(PrimitiveType::S32)]);
    assert_rejected(&fixture, 2, |r| {
        matches!(
            r,
            Rejection::TypeChangingBitcast {
                from: PrimitiveType::F32,
                to: PrimitiveType::S32,
                ..
            }
        )
    });
}

#[test]
fn union_reduce_with_several_groups_is_rejected() {
    let mut fixture = Fixture::with_chain(vec![Link::Negate]);
    fixture.partial_ids = vec![vec![vec![0], vec![2]], vec![vec![1], vec![3]]];
    fixture.union_ids = vec![vec![0, 1], vec![2, 3]];
    assert_rejected(&fixture, 2, |r| {
        matches!(r, Rejection::MultipleUnionGroups { groups: 2, .. })
    });
}

#[test]
fn missing_sharding_is_rejected() {
    let mut fixture = Fixture::with_chain(vec![Link::Negate]);
    fixture.shardings[1] = None;
    assert_rejected(&fixture, 2, |r| matches!(r, Rejection::MissingSharding { .. }));
}

#[test]
fn duplicate_sharding_is_rejected() {
    let mut fixture = Fixture::with_chain(vec![Link::Negate]);
    fixture.shardings = vec![Some(Sharding::maximal(0)), Some(Sharding::maximal(0))];
    assert_rejected(&fixture, 2, |r| matches!(r, Rejection::DuplicateSharding { .. }));
}

#[test]
fn branch_count_must_match_partitions() {
    let mut fixture = Fixture::with_chain(vec![Link::Negate]);
    fixture.partial_ids = (0..3).map(|i| vec![vec![i]]).collect();
    fixture.union_ids = vec![vec![0, 1, 2]];
    fixture.shardings = (0..3).map(|d| Some(Sharding::maximal(d))).collect();
    assert_rejected(&fixture, 2, |r| {
        matches!(r, Rejection::BranchCount { found: 3, expected: 2 })
    });
}

#[test]
fn non_sum_reducer_is_rejected() {
    let mut fixture = Fixture::with_chain(vec![Link::Negate]);
    fixture.partial_reducer = Opcode::Maximum;
    assert_rejected(&fixture, 2, |r| matches!(r, Rejection::NotSum { .. }));
}

#[test]
fn divide_cannot_be_hoisted() {
    let fixture = Fixture::with_chain(vec![Link::Divide(2.0)]);
    assert_rejected(&fixture, 2, |r| {
        matches!(r, Rejection::NotHoistable { opcode: Opcode::Divide, .. })
    });
}

#[test]
fn noop_union_reduce_is_rejected() {
    let mut fixture = Fixture::with_chain(vec![Link::Negate]);
    fixture.union_ids = vec![vec![0], vec![1]];
    assert_rejected(&fixture, 2, |r| matches!(r, Rejection::NoopUnionReduce { .. }));
}

#[test]
fn overlapping_replica_ids_are_rejected() {
    let mut fixture = Fixture::with_chain(vec![Link::Negate]);
    fixture.partial_ids = vec![vec![vec![0]], vec![vec![0]]];
    assert_rejected(&fixture, 2, |r| {
        matches!(r, Rejection::OverlappingReplicaIds { id: 0 })
    });
}

#[test]
fn unequal_group_sizes_are_rejected() {
    let mut fixture = Fixture::with_chain(vec![Link::Negate]);
    fixture.partial_ids = vec![vec![vec![0]], vec![vec![1, 2]]];
    fixture.union_ids = vec![vec![0, 1, 2]];
    assert_rejected(&fixture, 2, |r| matches!(r, Rejection::UnequalGroupSizes));
}

#[test]
fn union_participants_must_match() {
    let mut fixture = Fixture::with_chain(vec![Link::Negate]);
    fixture.union_ids = vec![vec![0, 1, 2]];
    assert_rejected(&fixture, 2, |r| matches!(r, Rejection::ParticipantsChanged { .. }));
}

#[test]
fn partial_reduce_with_two_users_is_rejected() {
    let mut module = Fixture::with_chain(vec![Link::Negate]).build();
    let pr0 = module.find_instruction("pr0").unwrap();
    let shape = module.instr(pr0).unwrap().shape.clone();
    let main = module.computation_mut(pr0.computation).unwrap();
    let extra = main.add_instruction(Instruction::new(
        "extra",
        InstrKind::Negate,
        shape,
        [pr0.instruction],
    ));
    let root = main.root().unwrap();
    main.get_mut(root).unwrap().operands.push(extra);

    let cg = CallGraph::build(&module).unwrap();
    let mut finder = CollectivePairFinder::new(&module, &cg, 2);
    assert!(finder.find().is_empty());
    assert!(matches!(
        finder.rejected().get(&1),
        Some(Rejection::UserCount { users: 2, .. })
    ));
}

// --- Module structure ---

#[test]
fn group_inside_while_body() {
    let mut module = Module::new("loop");
    let pr_sum = module.add_computation(scalar_reducer("pr_sum", PrimitiveType::F32, Opcode::Add));
    let ur_sum = module.add_computation(scalar_reducer("ur_sum", PrimitiveType::F32, Opcode::Add));
    let input = Shape::array(PrimitiveType::F32, [4]);
    let state = Shape::tuple([input.clone()]);
    let fixture = Fixture::with_chain(vec![Link::Convert(PrimitiveType::F32), Link::Add(1.0)]);

    let mut b = ComputationBuilder::new("body");
    let t = b.parameter(0, "t", state.clone());
    let x = b.get_tuple_element("x", t, 0);
    let (_, ur0) = fixture.build_copy(&mut b, 0, x, pr_sum, ur_sum);
    let (_, ur1) = fixture.build_copy(&mut b, 1, x, pr_sum, ur_sum);
    let sum = b.binary("sum", InstrKind::Add, ur0, ur1);
    let next = b.tuple("next", [sum]);
    let body = module.add_computation(b.build(next));

    let mut b = ComputationBuilder::new("cond");
    let t = b.parameter(0, "t", state);
    let x = b.get_tuple_element("x", t, 0);
    let cond = module.add_computation(b.build(x));

    let mut b = ComputationBuilder::new("main");
    let p = b.parameter(0, "p", input);
    let init = b.tuple("init", [p]);
    let w = b.while_loop("w", init, cond, body);
    let main = module.add_computation(b.build(w));
    module.set_entry(main);

    assert!(combine(&mut module));
    assert!(instructions_with(&module, Opcode::PartialReduce).is_empty());
    let fused = instructions_with(&module, Opcode::UnionReduce);
    assert_eq!(fused.len(), 2);
    for r in fused {
        assert_eq!(r.computation, body);
        assert_eq!(
            describe(&module, r),
            "union-reduce(add(divide(constant(1), constant(2)), convert(get-tuple-element(parameter))))"
        );
    }
}

/// Each copy feeds two partial reduces into one union reduce: key 1 through
/// `add` directly, key 2 through `negate` then `add`.
fn competing_keys() -> Module {
    let mut module = Module::new("competing");
    let sum = module.add_computation(scalar_reducer("sum", PrimitiveType::F32, Opcode::Add));
    let mut b = ComputationBuilder::new("main");
    let p = b.parameter(0, "p", Shape::array(PrimitiveType::F32, [4]));
    let mut outs = Vec::new();
    for copy in 0..2u64 {
        let sharding = Sharding::maximal(copy as u32);
        let a = b.partial_reduce(format!("a{copy}"), p, replica_groups(&[&[0, 1]]), Some(1), sum);
        b.set_sharding(a, sharding.clone());
        let pb = b.partial_reduce(format!("b{copy}"), p, replica_groups(&[&[copy]]), Some(2), sum);
        b.set_sharding(pb, sharding.clone());
        let neg = b.unary(format!("neg{copy}"), InstrKind::Negate, pb);
        let add = b.binary(format!("add{copy}"), InstrKind::Add, a, neg);
        let ur = b.union_reduce(format!("ur{copy}"), add, replica_groups(&[&[0, 1]]), sum);
        b.set_sharding(ur, sharding);
        outs.push(ur);
    }
    let root = b.tuple("out", outs);
    let main = module.add_computation(b.build(root));
    module.set_entry(main);
    module
}

#[test]
fn longer_chain_claims_shared_union_reduce() {
    let mut module = competing_keys();
    {
        let cg = CallGraph::build(&module).unwrap();
        let mut finder = CollectivePairFinder::new(&module, &cg, 2);
        assert!(finder.find().is_empty());
        assert!(matches!(
            finder.rejected().get(&1),
            Some(Rejection::LostUnionReduce { winner: 2, .. })
        ));
        // The winner's add reads the other key's partial reduce, which is
        // not a broadcast scalar.
        assert!(matches!(
            finder.rejected().get(&2),
            Some(Rejection::NonScalarLeaf { .. })
        ));
    }

    let before = dump_module(&module);
    assert!(!combine(&mut module));
    assert_eq!(dump_module(&module), before);
}

#[test]
fn branches_in_different_computations() {
    let mut module = Module::new("calls");
    let pr_sum = module.add_computation(scalar_reducer("pr_sum", PrimitiveType::F32, Opcode::Add));
    let ur_sum = module.add_computation(scalar_reducer("ur_sum", PrimitiveType::F32, Opcode::Add));
    let input = Shape::array(PrimitiveType::F32, [4]);
    let fixture = Fixture::with_chain(vec![Link::Add(1.0)]);

    let mut callees = Vec::new();
    for copy in 0..2 {
        let mut b = ComputationBuilder::new(format!("copy{copy}"));
        b.parameter(0, "q", input.clone());
        let x = b.constant("x", Literal::splat(&input, 2.0));
        let (_, ur) = fixture.build_copy(&mut b, copy, x, pr_sum, ur_sum);
        callees.push(module.add_computation(b.build(ur)));
    }

    let mut b = ComputationBuilder::new("main");
    let p = b.parameter(0, "p", input.clone());
    let call0 = b.call("call0", [p], callees[0], input.clone());
    let call1 = b.call("call1", [p], callees[1], input);
    let root = b.tuple("out", [call0, call1]);
    let main = module.add_computation(b.build(root));
    module.set_entry(main);

    assert!(combine(&mut module));
    assert!(instructions_with(&module, Opcode::PartialReduce).is_empty());
    for callee in callees {
        let comp = module.computation(callee).unwrap();
        let root = InstrRef::new(callee, comp.root().unwrap());
        assert_eq!(
            describe(&module, root),
            "union-reduce(add(divide(constant(1), constant(2)), constant(2)))"
        );
    }
}

#[test]
fn second_run_is_a_noop() {
    let mut module = Fixture::with_chain(vec![Link::Add(1.0), Link::Multiply(2.0)]).build();
    assert!(combine(&mut module));
    let once = dump_module(&module);
    assert!(!combine(&mut module));
    assert_eq!(dump_module(&module), once);
}

#[test]
fn rewrite_is_deterministic() {
    let fixture = Fixture::with_chain(vec![Link::Convert(PrimitiveType::F32), Link::Add(5.0)])
        .input(bf16_input());
    let mut a = fixture.build();
    let mut b = fixture.build();
    assert!(combine(&mut a));
    assert!(combine(&mut b));
    assert_eq!(dump_module(&a), dump_module(&b));
}

#[test]
fn optimize_pipeline_combines() {
    let mut module = Fixture::with_chain(vec![Link::Multiply(3.0)]).build();
    assert!(optimize(&mut module, 2).unwrap());
    module.verify().unwrap();
    assert_all(&module, "multiply(union-reduce(parameter), constant(3))");
}
