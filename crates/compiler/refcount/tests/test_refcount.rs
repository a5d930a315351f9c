//! End-to-end scenarios for refcount insertion: functions are built through
//! the IR builder, annotated, run through the pass, and checked for the
//! exact adjustments that must (and must not) appear.

use bumpalo::Bump;
use indoc::indoc;
use pretty_assertions::assert_eq;
use pylon_ir::{validate, BlockId, FuncBuilder, Function, Inst, TypeId, ValueData, ValueId};
use pylon_refcount::{
    add_refcounts, ObjectLayout, RefType, RefcountState, RefcountTracker, RuntimeSymbols,
};

struct Env {
    func: Function,
    tracker: RefcountTracker,
    object_ptr_ty: TypeId,
    /// `fn() -> *object`
    make: ValueId,
    /// `fn(*object) -> void`, reference-stealing by annotation
    sink: ValueId,
    /// `fn(*object) -> void`, borrowing
    use_fn: ValueId,
    /// `fn() -> void`, registered as may-throw by the tests that want it
    capi: ValueId,
    yield_capi: ValueId,
    xdecref_and_rethrow: ValueId,
    dealloc: ValueId,
    personality: ValueId,
}

fn new_env(name: &str) -> Env {
    let mut func = Function::new(name);

    let void = func.types.void();
    let i64 = func.types.i64();
    let i32 = func.types.i32();
    let i8_ptr = func.types.i8_ptr();

    let class_ty = func.types.named_struct("class", vec![i64, i8_ptr]);
    let class_ptr = func.types.ptr(class_ty);
    let object_ty = func.types.named_struct("object", vec![i64, class_ptr]);
    let object_ptr_ty = func.types.ptr(object_ty);

    let make_ty = func.types.func(vec![], object_ptr_ty, false);
    let make_ptr = func.types.ptr(make_ty);
    let make = func.add_global("obj_new", make_ptr);

    let unary_ty = func.types.func(vec![object_ptr_ty], void, false);
    let unary_ptr = func.types.ptr(unary_ty);
    let sink = func.add_global("obj_sink", unary_ptr);
    let use_fn = func.add_global("obj_use", unary_ptr);

    let capi_ty = func.types.func(vec![], void, false);
    let capi_ptr = func.types.ptr(capi_ty);
    let capi = func.add_global("capi_call", capi_ptr);

    let yield_ty = func
        .types
        .func(vec![object_ptr_ty, object_ptr_ty, i32], object_ptr_ty, true);
    let yield_ptr = func.types.ptr(yield_ty);
    let yield_capi = func.add_global("yield_capi", yield_ptr);

    let rethrow_ty = func.types.func(vec![i8_ptr, i32], void, true);
    let rethrow_ptr = func.types.ptr(rethrow_ty);
    let xdecref_and_rethrow = func.add_global("xdecref_and_rethrow", rethrow_ptr);

    let dealloc_ty = func.types.func(vec![object_ptr_ty], void, false);
    let dealloc_ptr = func.types.ptr(dealloc_ty);
    let dealloc = func.add_global("obj_dealloc", dealloc_ptr);

    let personality_ty = func.types.func(vec![], i32, true);
    let personality_ptr = func.types.ptr(personality_ty);
    let personality = func.add_global("eh_personality", personality_ptr);

    Env {
        func,
        tracker: RefcountTracker::new(),
        object_ptr_ty,
        make,
        sink,
        use_fn,
        capi,
        yield_capi,
        xdecref_and_rethrow,
        dealloc,
        personality,
    }
}

fn run(env: Env) -> Function {
    let Env {
        mut func,
        tracker,
        object_ptr_ty,
        yield_capi,
        xdecref_and_rethrow,
        dealloc,
        personality,
        ..
    } = env;

    let arena = Bump::new();
    let runtime = RuntimeSymbols {
        xdecref_and_rethrow,
        dealloc,
        yield_capi,
        personality,
        ref_total: None,
    };
    let layout = ObjectLayout {
        object_ptr_ty,
        refcount_index: 0,
        class_index: 1,
        dealloc_slot_index: 1,
    };

    let mut state = RefcountState {
        arena: &arena,
        func: &mut func,
        tracker,
        runtime,
        layout,
    };
    add_refcounts(&mut state);

    validate(&func);
    func
}

/// Every decref patchpoint in the function: (block, operand).
fn patchpoints(func: &Function) -> Vec<(BlockId, ValueId)> {
    let mut found = Vec::new();
    for &block in func.layout() {
        for &inst in func.block_insts(block) {
            if let Inst::Patchpoint { args, .. } = func.inst(inst) {
                found.push((block, args[0]));
            }
        }
    }
    found
}

fn blocks_named<'f>(func: &'f Function, name: &str) -> Vec<BlockId> {
    func.layout()
        .iter()
        .copied()
        .filter(|&block| func.block_name(block) == name)
        .collect()
}

fn const_value(func: &Function, v: ValueId) -> i64 {
    match func.value(v) {
        ValueData::ConstInt { value, .. } => *value,
        other => panic!("expected an integer constant, got {other:?}"),
    }
}

#[test]
fn straight_line_owned_value_gets_one_decref_after_last_use() {
    let mut env = new_env("straight_line");
    let entry = env.func.add_block("entry");
    let mut builder = FuncBuilder::new(&mut env.func);
    builder.position_at_end(entry);
    let v = builder.build_call(env.make, vec![]);
    let use_v = builder.build_call(env.use_fn, vec![v]);
    let ret = builder.build_ret(None);
    env.tracker.set_type(&env.func, v, RefType::Owned);

    let func = run(env);

    let pps = patchpoints(&func);
    assert_eq!(pps, vec![(entry, v)]);
    // The decref sits between the last use and the return.
    let insts = func.block_insts(entry);
    assert_eq!(insts.len(), 4);
    assert_eq!(insts[1], use_v);
    assert_eq!(insts[3], ret);
    assert!(blocks_named(&func, "incref").is_empty());
}

#[test]
fn straight_line_listing_is_stable() {
    let mut env = new_env("straight_line");
    let entry = env.func.add_block("entry");
    let mut builder = FuncBuilder::new(&mut env.func);
    builder.position_at_end(entry);
    let v = builder.build_call(env.make, vec![]);
    builder.build_call(env.use_fn, vec![v]);
    builder.build_ret(None);
    env.tracker.set_type(&env.func, v, RefType::Owned);

    let func = run(env);

    assert_eq!(
        func.to_string(),
        indoc!(
            r"
            fn @straight_line() {
            entry.0:
              %8 = call @obj_new()
              call @obj_use(%8)
              patchpoint id=1025, bytes=13, null(%8)
              ret void
            }
            "
        )
    );
}

#[test]
fn consume_at_call_absorbs_the_definition() {
    let mut env = new_env("consumed");
    let entry = env.func.add_block("entry");
    let mut builder = FuncBuilder::new(&mut env.func);
    builder.position_at_end(entry);
    let v = builder.build_call(env.make, vec![]);
    let consume = builder.build_call(env.sink, vec![v]);
    builder.build_ret(None);
    env.tracker.set_type(&env.func, v, RefType::Owned);
    env.tracker.ref_consumed(&env.func, v, consume);

    let before = env.func.to_string();
    let func = run(env);

    // Zero insertions: the consume absorbs the initial reference.
    assert_eq!(func.to_string(), before);
}

/// entry defines v and branches; only the left branch consumes it. The
/// merge must compensate with a decref on the non-consuming path.
fn diamond_env(name: &str) -> (Env, BlockId, BlockId, BlockId, BlockId) {
    let mut env = new_env(name);
    let i1 = env.func.types.i1();
    let cond = env.func.add_param("cond", i1);
    let entry = env.func.add_block("entry");
    let left = env.func.add_block("left");
    let right = env.func.add_block("right");
    let join = env.func.add_block("join");

    let mut builder = FuncBuilder::new(&mut env.func);
    builder.position_at_end(entry);
    let v = builder.build_call(env.make, vec![]);
    builder.build_cond_br(cond, left, right);
    builder.position_at_end(left);
    let consume = builder.build_call(env.sink, vec![v]);
    builder.build_br(join);
    builder.position_at_end(right);
    builder.build_br(join);
    builder.position_at_end(join);
    builder.build_ret(None);

    env.tracker.set_type(&env.func, v, RefType::Owned);
    env.tracker.ref_consumed(&env.func, v, consume);

    (env, entry, left, right, join)
}

#[test]
fn diamond_merge_decrefs_only_the_non_consuming_path() {
    let (env, _entry, left, right, _join) = diamond_env("diamond");

    let func = run(env);

    let pps = patchpoints(&func);
    assert_eq!(pps.len(), 1);
    let (decref_block, _) = pps[0];
    assert_eq!(decref_block, right);
    assert_ne!(decref_block, left);
    // No critical edge had to be split: right has a single predecessor.
    assert!(blocks_named(&func, "breaker").is_empty());
}

#[test]
fn merge_increfs_the_path_that_needs_more_references() {
    let mut env = new_env("extra_consumes");
    let i1 = env.func.types.i1();
    let cond = env.func.add_param("cond", i1);
    let entry = env.func.add_block("entry");
    let left = env.func.add_block("left");
    let right = env.func.add_block("right");

    let mut builder = FuncBuilder::new(&mut env.func);
    builder.position_at_end(entry);
    let v = builder.build_call(env.make, vec![]);
    builder.build_cond_br(cond, left, right);
    // left consumes two references, right only the one the definition gave.
    builder.position_at_end(left);
    let consume_a = builder.build_call(env.sink, vec![v]);
    let consume_b = builder.build_call(env.sink, vec![v]);
    builder.build_ret(None);
    builder.position_at_end(right);
    let consume_c = builder.build_call(env.sink, vec![v]);
    builder.build_ret(None);

    env.tracker.set_type(&env.func, v, RefType::Owned);
    env.tracker.ref_consumed(&env.func, v, consume_a);
    env.tracker.ref_consumed(&env.func, v, consume_b);
    env.tracker.ref_consumed(&env.func, v, consume_c);

    let func = run(env);

    // The second consume on the left path needs one extra reference, taken
    // at the top of that path; the right path is left alone.
    assert!(patchpoints(&func).is_empty());
    let left_insts = func.block_insts(left);
    assert_eq!(left_insts.len(), 7);
    assert!(matches!(func.inst(left_insts[0]), Inst::FieldPtr { base, field: 0 } if *base == v));
    assert!(matches!(func.inst(left_insts[2]), Inst::Add { .. }));
    assert!(matches!(func.inst(left_insts[3]), Inst::Store { .. }));
    assert_eq!(left_insts[4], consume_a);
    assert_eq!(func.block_insts(right), &[consume_c, func.terminator(right)]);
}

#[test]
fn excess_references_materialize_after_a_throwing_call() {
    let mut env = new_env("throwing_excess");
    let entry = env.func.add_block("entry");
    let mut builder = FuncBuilder::new(&mut env.func);
    builder.position_at_end(entry);
    let v = builder.build_call(env.make, vec![]);
    let throwing = builder.build_call(env.capi, vec![]);
    let consume_a = builder.build_call(env.sink, vec![v]);
    let consume_b = builder.build_call(env.sink, vec![v]);
    builder.build_ret(None);

    env.tracker.set_type(&env.func, v, RefType::Owned);
    env.tracker.set_may_throw(throwing);
    env.tracker.ref_consumed(&env.func, v, consume_a);
    env.tracker.ref_consumed(&env.func, v, consume_b);

    let xdecref_and_rethrow = env.xdecref_and_rethrow;
    let func = run(env);

    // Both consumes happen below the throwing call, but only the minimum
    // (one reference) is carried across it; the second reference is taken
    // after the call, where the unwind path doesn't have to release it.
    let (normal_dest, unwind_dest) = match func.inst(func.terminator(entry)) {
        Inst::Invoke {
            normal_dest,
            unwind_dest,
            ..
        } => (*normal_dest, *unwind_dest),
        other => panic!("expected invoke, got {other:?}"),
    };

    let normal_insts = func.block_insts(normal_dest);
    assert_eq!(normal_insts.len(), 7);
    assert!(matches!(func.inst(normal_insts[0]), Inst::FieldPtr { base, field: 0 } if *base == v));
    assert!(matches!(func.inst(normal_insts[3]), Inst::Store { .. }));
    assert_eq!(normal_insts[4], consume_a);
    assert_eq!(normal_insts[5], consume_b);

    // The unwind cleanup releases exactly the one carried reference.
    match func.inst(func.block_insts(unwind_dest)[2]) {
        Inst::Call { callee, args } => {
            assert_eq!(*callee, xdecref_and_rethrow);
            assert_eq!(const_value(&func, args[1]), 1);
            assert_eq!(args[2], v);
        }
        other => panic!("expected the rethrow helper call, got {other:?}"),
    }
    assert!(patchpoints(&func).is_empty());
}

#[test]
fn refcounting_is_deterministic() {
    let (first_env, ..) = diamond_env("deterministic");
    let (second_env, ..) = diamond_env("deterministic");

    let first = run(first_env);
    let second = run(second_env);

    assert_eq!(first.to_string(), second.to_string());
}

#[test]
fn nullable_borrowed_parameter_gets_a_guarded_entry_incref() {
    let mut env = new_env("borrowed_param");
    let p = env.func.add_param("p", env.object_ptr_ty);
    let entry = env.func.add_block("entry");
    let mut builder = FuncBuilder::new(&mut env.func);
    builder.position_at_end(entry);
    let consume = builder.build_call(env.sink, vec![p]);
    builder.build_ret(None);

    env.tracker.set_type(&env.func, p, RefType::Borrowed);
    env.tracker.set_nullable(&env.func, p, true);
    env.tracker.ref_consumed(&env.func, p, consume);

    let func = run(env);

    // The consume needs one reference the caller didn't give us, so the
    // entry increfs p behind a null check; borrowed values are never
    // decref'd by the pass itself.
    assert!(patchpoints(&func).is_empty());

    let incref_blocks = blocks_named(&func, "incref");
    assert_eq!(incref_blocks.len(), 1);
    let incref_block = incref_blocks[0];

    let (guard_cond, null_dest, incref_dest) = match func.inst(func.terminator(entry)) {
        Inst::CondBr {
            cond,
            then_dest,
            else_dest,
        } => (*cond, *then_dest, *else_dest),
        other => panic!("expected a null guard, got {other:?}"),
    };
    assert_eq!(incref_dest, incref_block);
    match func.inst(guard_cond) {
        Inst::IcmpEq { lhs, rhs } => {
            assert_eq!(*lhs, p);
            assert!(func.is_const_null(*rhs));
        }
        other => panic!("expected a null compare, got {other:?}"),
    }

    // Both arms rejoin before the consume runs.
    assert_eq!(func.successors(incref_block), vec![null_dest]);
    assert_eq!(func.first_inst(null_dest), Some(consume));

    // The incref block bumps the refcount field: fieldptr, load, add,
    // store, branch.
    let incref_insts = func.block_insts(incref_block);
    assert_eq!(incref_insts.len(), 5);
    assert!(matches!(func.inst(incref_insts[0]), Inst::FieldPtr { base, field: 0 } if *base == p));
    assert!(matches!(func.inst(incref_insts[3]), Inst::Store { .. }));
}

#[test]
fn throwing_call_gets_an_unwind_cleanup_path() {
    let mut env = new_env("throwing");
    let entry = env.func.add_block("entry");
    let mut builder = FuncBuilder::new(&mut env.func);
    builder.position_at_end(entry);
    let v = builder.build_call(env.make, vec![]);
    let throwing = builder.build_call(env.capi, vec![]);
    let use_v = builder.build_call(env.use_fn, vec![v]);
    let ret = builder.build_ret(None);

    env.tracker.set_type(&env.func, v, RefType::Owned);
    env.tracker.set_may_throw(throwing);

    let capi = env.capi;
    let xdecref_and_rethrow = env.xdecref_and_rethrow;
    let func = run(env);

    // The call was rewritten into an invoke whose unwind destination
    // releases v and rethrows.
    let (normal_dest, unwind_dest) = match func.inst(func.terminator(entry)) {
        Inst::Invoke {
            callee,
            normal_dest,
            unwind_dest,
            ..
        } => {
            assert_eq!(*callee, capi);
            (*normal_dest, *unwind_dest)
        }
        other => panic!("expected invoke, got {other:?}"),
    };

    assert_eq!(func.block_name(unwind_dest), "cxx_fixup");
    let fixup_insts = func.block_insts(unwind_dest).to_vec();
    assert_eq!(fixup_insts.len(), 4);
    assert!(matches!(func.inst(fixup_insts[0]), Inst::LandingPad { .. }));
    match func.inst(fixup_insts[2]) {
        Inst::Call { callee, args } => {
            assert_eq!(*callee, xdecref_and_rethrow);
            assert_eq!(args.len(), 3);
            assert_eq!(const_value(&func, args[1]), 1);
            assert_eq!(args[2], v);
        }
        other => panic!("expected the rethrow helper call, got {other:?}"),
    }
    assert!(matches!(func.inst(fixup_insts[3]), Inst::Unreachable));

    // On the normal path v is still released after its last use.
    assert_eq!(patchpoints(&func), vec![(normal_dest, v)]);
    let normal_insts = func.block_insts(normal_dest);
    assert_eq!(normal_insts.len(), 3);
    assert_eq!(normal_insts[0], use_v);
    assert!(matches!(func.inst(normal_insts[1]), Inst::Patchpoint { .. }));
    assert_eq!(normal_insts[2], ret);
}

#[test]
fn invoke_result_is_released_in_its_normal_destination() {
    let mut env = new_env("invoked");
    let entry = env.func.add_block("entry");
    let normal = env.func.add_block("normal");
    let lpad = env.func.add_block("lpad");
    let i8_ptr = env.func.types.i8_ptr();
    let void = env.func.types.void();
    let begin_catch_ty = env.func.types.func(vec![i8_ptr], void, false);
    let begin_catch_ptr = env.func.types.ptr(begin_catch_ty);
    let begin_catch = env.func.add_global("begin_catch", begin_catch_ptr);

    // The invoke's result type is *object, so it must be tracked.
    let make_obj = env.make;
    let personality = env.personality;
    let mut builder = FuncBuilder::new(&mut env.func);
    builder.position_at_end(entry);
    let result = builder.build_invoke(make_obj, vec![], normal, lpad);
    builder.position_at_end(normal);
    builder.build_ret(None);
    builder.position_at_end(lpad);
    let pad = builder.build_landing_pad(personality);
    let exc = builder.build_extract_value(pad, 0);
    builder.build_call(begin_catch, vec![exc]);
    builder.build_ret(None);

    env.tracker.set_type(&env.func, result, RefType::Owned);

    let func = run(env);

    // The unused owned result dies on arrival in the normal destination.
    assert_eq!(patchpoints(&func), vec![(normal, result)]);
}

#[test]
fn critical_edges_are_split_for_merge_compensation() {
    let mut env = new_env("critical");
    let i1 = env.func.types.i1();
    let cond = env.func.add_param("cond", i1);
    let entry = env.func.add_block("entry");
    let left = env.func.add_block("left");
    let join = env.func.add_block("join");

    let mut builder = FuncBuilder::new(&mut env.func);
    builder.position_at_end(entry);
    let v = builder.build_call(env.make, vec![]);
    // entry -> join is a critical edge: entry has two successors and join
    // has two predecessors.
    builder.build_cond_br(cond, left, join);
    builder.position_at_end(left);
    let consume = builder.build_call(env.sink, vec![v]);
    builder.build_br(join);
    builder.position_at_end(join);
    builder.build_ret(None);

    env.tracker.set_type(&env.func, v, RefType::Owned);
    env.tracker.ref_consumed(&env.func, v, consume);

    let func = run(env);

    let breakers = blocks_named(&func, "breaker");
    assert_eq!(breakers.len(), 1);
    let breaker = breakers[0];

    // The compensating decref lives in the breaker, which now carries the
    // entry -> join edge.
    assert_eq!(patchpoints(&func), vec![(breaker, v)]);
    assert_eq!(func.successors(breaker), vec![join]);
    match func.inst(func.terminator(entry)) {
        Inst::CondBr {
            then_dest,
            else_dest,
            ..
        } => {
            assert_eq!(*then_dest, left);
            assert_eq!(*else_dest, breaker);
        }
        other => panic!("expected condbr, got {other:?}"),
    }
}

#[test]
fn yield_carries_live_owned_references() {
    let mut env = new_env("yielding");
    let gen = env.func.add_param("generator", env.object_ptr_ty);
    let i32_ty = env.func.types.i32();
    let entry = env.func.add_block("entry");
    let resume = env.func.add_block("resume");

    let mut builder = FuncBuilder::new(&mut env.func);
    builder.position_at_end(entry);
    let u = builder.build_call(env.make, vec![]);
    let w = builder.build_call(env.make, vec![]);
    let y = builder.build_call(env.make, vec![]);
    builder.build_br(resume);

    builder.position_at_end(resume);
    let placeholder = builder.func().const_int(i32_ty, 0);
    let old_yield = builder.build_call(env.yield_capi, vec![gen, y, placeholder]);
    let sink_w = builder.build_call(env.sink, vec![w]);
    let sink_u = builder.build_call(env.sink, vec![u]);
    builder.build_ret(None);

    env.tracker.set_type(&env.func, gen, RefType::Borrowed);
    env.tracker.set_type(&env.func, u, RefType::Owned);
    env.tracker.set_type(&env.func, w, RefType::Owned);
    env.tracker.set_type(&env.func, y, RefType::Owned);
    env.tracker.set_type(&env.func, old_yield, RefType::Borrowed);
    env.tracker.ref_consumed(&env.func, y, old_yield);
    env.tracker.ref_consumed(&env.func, w, sink_w);
    env.tracker.ref_consumed(&env.func, u, sink_u);

    let yield_capi = env.yield_capi;
    let func = run(env);

    // The yield was rebuilt with the live owned references appended:
    // (generator, value, live count, u, w). The yielded value itself is
    // stolen by the yield and not listed.
    let new_yield = func.resolve(old_yield);
    assert_ne!(new_yield, old_yield);
    assert_eq!(func.first_inst(resume), Some(new_yield));
    match func.inst(new_yield) {
        Inst::Call { callee, args } => {
            assert_eq!(*callee, yield_capi);
            assert_eq!(args.len(), 5);
            assert_eq!(args[0], gen);
            assert_eq!(args[1], y);
            assert_eq!(const_value(&func, args[2]), 2);
            assert_eq!(&args[3..], &[u, w]);
        }
        other => panic!("expected the rebuilt yield call, got {other:?}"),
    }

    // Everything is consumed; no other adjustments appear.
    assert!(patchpoints(&func).is_empty());
    assert!(blocks_named(&func, "incref").is_empty());
}

#[test]
fn yield_with_no_live_owneds_is_left_alone() {
    let mut env = new_env("yielding_nothing");
    let gen = env.func.add_param("generator", env.object_ptr_ty);
    let i32_ty = env.func.types.i32();
    let entry = env.func.add_block("entry");

    let mut builder = FuncBuilder::new(&mut env.func);
    builder.position_at_end(entry);
    let y = builder.build_call(env.make, vec![]);
    let placeholder = builder.func().const_int(i32_ty, 0);
    let old_yield = builder.build_call(env.yield_capi, vec![gen, y, placeholder]);
    builder.build_ret(None);

    env.tracker.set_type(&env.func, gen, RefType::Borrowed);
    env.tracker.set_type(&env.func, y, RefType::Owned);
    env.tracker.set_type(&env.func, old_yield, RefType::Borrowed);
    env.tracker.ref_consumed(&env.func, y, old_yield);

    let func = run(env);

    // Only the yielded value was live, and the yield steals it: k = 0, the
    // original call stays.
    assert_eq!(func.resolve(old_yield), old_yield);
    match func.inst(old_yield) {
        Inst::Call { args, .. } => assert_eq!(args.len(), 3),
        other => panic!("expected the original yield call, got {other:?}"),
    }
}
