//! The refcount insertion pass.
//!
//! A backward dataflow fixpoint over the block graph: for each block we
//! compute the live-reference multiset at its top from the multisets at the
//! tops of its successors, reconciling disagreements with compensating
//! increfs/decrefs on the edges, then scan the block's instructions in
//! reverse updating the multiset for uses, consumes, throws and definitions.
//! Once the fixpoint settles, the recorded ops are materialized (splitting
//! critical edges as needed) and yield calls are rewritten to carry their
//! live owned references.

use bumpalo::collections::Vec as BumpVec;
use bumpalo::Bump;
use pylon_collections::{MutSet, VecMap};
use pylon_debug_flags::{
    dbg_do, PYLON_PRINT_IR_AFTER_REFCOUNT, PYLON_PRINT_IR_BEFORE_REFCOUNT,
    PYLON_PRINT_REFCOUNT_PROGRESS,
};
use pylon_error_macros::internal_error;
use pylon_ir::{BlockId, FuncBuilder, Function, Inst, TypeId, ValueId};

use crate::block_graph::{compute_traversal_order, BlockGraph, BlockOrderer};
use crate::emit::{emit_decrefs, emit_increfs};
use crate::fixup::emit_cxx_fixup;
use crate::insertion::{find_insertion_point, InsertionCache};
use crate::stats::PassTimer;
use crate::tracker::{RefType, RefcountTracker};

/// Handles to the runtime symbols the pass emits references to.
pub struct RuntimeSymbols {
    /// Variadic helper the fixup paths tail-call: `(exc_ptr, count, values…)`.
    pub xdecref_and_rethrow: ValueId,
    /// The deallocator the runtime dispatches to behind decref patchpoints.
    pub dealloc: ValueId,
    /// The yield helper; calls to it get the live owned references appended.
    pub yield_capi: ValueId,
    /// Personality function stamped on synthesized landing pads.
    pub personality: ValueId,
    /// Debug-runtime global tracking the process-wide live reference total.
    pub ref_total: Option<ValueId>,
}

/// Where the refcount field and class pointer live inside an object.
pub struct ObjectLayout {
    /// The canonical pointer-to-object type all refcount arithmetic runs on.
    /// Derived object types place this layout as their leading member.
    pub object_ptr_ty: TypeId,
    /// Field index of the refcount within the object struct.
    pub refcount_index: u32,
    /// Field index of the class pointer; always right after the refcount.
    pub class_index: u32,
    /// Field index of the deallocator slot within the class descriptor,
    /// consumed by the runtime when it patches decref sites.
    pub dealloc_slot_index: u32,
}

/// Everything the pass needs for one function.
pub struct RefcountState<'a> {
    pub arena: &'a Bump,
    pub func: &'a mut Function,
    pub tracker: RefcountTracker,
    pub runtime: RuntimeSymbols,
    pub layout: ObjectLayout,
}

/// Live references at a program point: value -> strictly positive count,
/// iterated in insertion order. The emitted IR observes that order.
type BlockMap = VecMap<ValueId, i64>;

fn ref_count(map: &BlockMap, v: ValueId) -> i64 {
    map.get(&v).copied().unwrap_or(0)
}

fn set_ref_count(map: &mut BlockMap, v: ValueId, count: i64) {
    debug_assert!(count >= 0);
    if count == 0 {
        map.remove(&v);
    } else {
        map.insert(v, count);
    }
}

#[derive(Clone, Copy, Debug)]
enum InsertAt {
    Before(ValueId),
    /// At the start of `block`, conceptually on the edge from `from`; the
    /// edge is split when `block` has several predecessors.
    TopOfBlock {
        block: BlockId,
        from: Option<BlockId>,
    },
}

#[derive(Clone, Copy, Debug)]
struct RefOp {
    operand: ValueId,
    nullable: bool,
    num_refs: i64,
    at: InsertAt,
}

struct CxxFixup {
    inst: ValueId,
    /// Iteration-ordered, one entry per live reference (values repeat).
    to_decref: Vec<ValueId>,
}

#[derive(Default)]
struct RefState {
    been_run: bool,

    /// The scan is backwards and starting/ending refer to the scan, not the
    /// instruction sequence: `starting_refs` is the refstate at the *end* of
    /// the block, `ending_refs` the refstate at its beginning (what the
    /// predecessors get to see).
    starting_refs: BlockMap,
    ending_refs: BlockMap,

    increfs: Vec<RefOp>,
    decrefs: Vec<RefOp>,
    cxx_fixups: Vec<CxxFixup>,
}

/// Entry point: materializes balanced refcount adjustments into
/// `state.func` according to `state.tracker`.
pub fn add_refcounts(state: &mut RefcountState<'_>) {
    let timer = PassTimer::start();

    let arena = state.arena;
    let tracker = &state.tracker;
    let runtime = &state.runtime;
    let layout = &state.layout;
    let func = &mut *state.func;

    dbg_do!(PYLON_PRINT_IR_BEFORE_REFCOUNT, {
        eprintln!("Before refcounts:\n{func}");
    });

    #[cfg(debug_assertions)]
    audit_tracked_values(func, tracker, layout);

    let graph = BlockGraph::new(func);
    let num_blocks = graph.num_blocks();

    let mut states: Vec<RefState> = std::iter::repeat_with(RefState::default)
        .take(num_blocks)
        .collect();

    let mut orderer = BlockOrderer::new(compute_traversal_order(&graph));
    for idx in 0..num_blocks {
        orderer.add(idx);
    }

    // Yields are rewritten at the very end but need their block's live-map;
    // tracked invokes define their value in their normal destination, which
    // the per-block scan has to know about.
    let mut yields: Vec<(ValueId, usize)> = Vec::new();
    let mut invokes: Vec<ValueId> = Vec::new();
    for (idx, &block) in graph.blocks.iter().enumerate() {
        for &inst in func.block_insts(block) {
            match func.inst(inst) {
                Inst::Call { callee, .. } if *callee == runtime.yield_capi => {
                    yields.push((inst, idx));
                }
                Inst::Invoke { .. } if tracker.is_tracked(inst) => invokes.push(inst),
                _ => {}
            }
        }
    }

    while let Some(idx) = orderer.pop() {
        let block = graph.blocks[idx];

        dbg_do!(PYLON_PRINT_REFCOUNT_PROGRESS, {
            eprintln!("Processing {}", func.block_name(block));
        });

        let first_time = !states[idx].been_run;
        states[idx].been_run = true;
        let orig_ending_refs = std::mem::take(&mut states[idx].ending_refs);

        // (a) Compute the incoming refstate from the refstate of every
        // successor that has been run at least once.
        let mut increfs: Vec<RefOp> = Vec::new();
        let mut decrefs: Vec<RefOp> = Vec::new();
        let mut starting_refs = BlockMap::new();

        let mut reconciled = BumpVec::new_in(arena);
        for &sidx in &graph.successors[idx] {
            if states[sidx].been_run {
                reconciled.push(sidx);
            }
        }

        if !reconciled.is_empty() {
            let mut tracked_values = BumpVec::new_in(arena);
            let mut in_tracked_values: MutSet<ValueId> = MutSet::default();
            for &sidx in reconciled.iter() {
                for (&v, &count) in states[sidx].ending_refs.iter() {
                    debug_assert!(count > 0);
                    if in_tracked_values.insert(v) {
                        tracked_values.push(v);
                    }
                }
            }

            for &v in tracked_values.iter() {
                let refstate = tracker.expect_tracked(v);

                let mut min_refs = i64::MAX;
                for &sidx in reconciled.iter() {
                    min_refs = min_refs.min(ref_count(&states[sidx].ending_refs, v));
                }

                // An owned value must carry at least one reference anywhere
                // it is live; less would mean some successor lost the
                // reference without a decref.
                if refstate.reftype == RefType::Owned {
                    min_refs = min_refs.max(1);
                }

                for &sidx in reconciled.iter() {
                    let this_refs = ref_count(&states[sidx].ending_refs, v);
                    let at = InsertAt::TopOfBlock {
                        block: graph.blocks[sidx],
                        from: Some(block),
                    };
                    if this_refs > min_refs {
                        increfs.push(RefOp {
                            operand: v,
                            nullable: refstate.nullable,
                            num_refs: this_refs - min_refs,
                            at,
                        });
                    } else if this_refs < min_refs {
                        if refstate.reftype != RefType::Owned {
                            internal_error!(
                                "would decref borrowed value {:?} on a merge edge",
                                v
                            );
                        }
                        decrefs.push(RefOp {
                            operand: v,
                            nullable: refstate.nullable,
                            num_refs: min_refs - this_refs,
                            at,
                        });
                    }
                }

                if min_refs > 0 {
                    starting_refs.insert(v, min_refs);
                }
            }
        }

        let state = &mut states[idx];
        state.starting_refs = starting_refs;
        state.increfs = increfs;
        state.decrefs = decrefs;
        state.cxx_fixups = Vec::new();
        state.ending_refs = state.starting_refs.clone();

        // (b) Iterate backwards through the instructions, updating the ref
        // state.
        //
        // φ-nodes only use one of their operands (based on the block we came
        // from); the φ generator accounts for that by recording a consume on
        // the terminator of each predecessor, so they are pass-through here.
        let terminator = func.terminator(block);
        let insts: Vec<ValueId> = func.block_insts(block).to_vec();
        for &inst in insts.iter().rev() {
            // Definition sites: the value is not live above its definition.
            // Invokes define their value in their normal destination and are
            // handled after the scan.
            if !matches!(func.inst(inst), Inst::Invoke { .. }) && tracker.is_tracked(inst) {
                let refstate = tracker.expect_tracked(inst);
                let defined = if refstate.reftype == RefType::Owned { 1 } else { 0 };
                let have = ref_count(&state.ending_refs, inst);
                if have != defined {
                    if inst == terminator {
                        internal_error!("tracked value {:?} is its block's terminator", inst);
                    }
                    let mut insertion_pt = next_inst_or_error(func, inst);
                    while func.is_phi(insertion_pt) {
                        insertion_pt = next_inst_or_error(func, insertion_pt);
                    }

                    if have < defined {
                        debug_assert!(refstate.reftype == RefType::Owned);
                        state.decrefs.push(RefOp {
                            operand: inst,
                            nullable: refstate.nullable,
                            num_refs: defined - have,
                            at: InsertAt::Before(insertion_pt),
                        });
                    } else {
                        state.increfs.push(RefOp {
                            operand: inst,
                            nullable: refstate.nullable,
                            num_refs: have - defined,
                            at: InsertAt::Before(insertion_pt),
                        });
                    }
                }
                state.ending_refs.remove(&inst);
            }

            if func.is_phi(inst) {
                continue;
            }

            // A fixup is coming for this call: materialize any excess
            // increfs after it rather than pushing them above it, where each
            // would need a matching decref on the unwind path. Only the
            // minimum is carried across the call.
            if tracker.may_throw.contains(&inst) {
                let entries: Vec<(ValueId, i64)> = state
                    .ending_refs
                    .iter()
                    .map(|(&v, &count)| (v, count))
                    .collect();
                for (v, count) in entries {
                    let var = tracker.expect_tracked(v);
                    let needed = if var.reftype == RefType::Owned { 1 } else { 0 };
                    if count > needed {
                        let next = next_inst_or_error(func, inst);
                        state.increfs.push(RefOp {
                            operand: v,
                            nullable: var.nullable,
                            num_refs: count - needed,
                            at: InsertAt::Before(next),
                        });
                    }
                    set_ref_count(&mut state.ending_refs, v, needed);
                }
            }

            // Per-operand usage, in operand order.
            let mut num_consumed_by_inst: VecMap<ValueId, i64> = VecMap::new();
            let mut num_times_as_op: VecMap<ValueId, i64> = VecMap::new();

            if let Some(consumed) = tracker.refs_consumed.get(&inst) {
                for &v in consumed {
                    debug_assert!(tracker.expect_tracked(v).reftype != RefType::Unknown);
                    *num_consumed_by_inst.get_or_insert(v, || 0) += 1;
                    // Just make sure it appears in there.
                    num_times_as_op.get_or_insert(v, || 0);
                }
            }

            if let Some(used) = tracker.refs_used.get(&inst) {
                for &v in used {
                    debug_assert!(tracker.expect_tracked(v).reftype != RefType::Unknown);
                    *num_times_as_op.get_or_insert(v, || 0) += 1;
                }
            }

            for op in func.inst(inst).operands() {
                if tracker.is_tracked(op) {
                    *num_times_as_op.get_or_insert(op, || 0) += 1;
                }
            }

            // First, keep alive anything that is used but not consumed: if
            // this is its last use, the reference is released right after
            // the instruction (on both destinations for an invoke).
            for (&op, &times) in num_times_as_op.iter() {
                let consumed = num_consumed_by_inst.get(&op).copied().unwrap_or(0);
                if times <= consumed {
                    continue;
                }
                let var = tracker.expect_tracked(op);
                if var.reftype != RefType::Owned {
                    continue;
                }
                if ref_count(&state.ending_refs, op) != 0 {
                    continue;
                }

                match func.inst(inst) {
                    Inst::Invoke {
                        normal_dest,
                        unwind_dest,
                        ..
                    } => {
                        let (normal_dest, unwind_dest) = (*normal_dest, *unwind_dest);
                        state.decrefs.push(RefOp {
                            operand: op,
                            nullable: var.nullable,
                            num_refs: 1,
                            at: InsertAt::TopOfBlock {
                                block: normal_dest,
                                from: Some(block),
                            },
                        });
                        state.decrefs.push(RefOp {
                            operand: op,
                            nullable: var.nullable,
                            num_refs: 1,
                            at: InsertAt::TopOfBlock {
                                block: unwind_dest,
                                from: Some(block),
                            },
                        });
                    }
                    _ => {
                        debug_assert!(inst != terminator);
                        let next = next_inst_or_error(func, inst);
                        if matches!(func.inst(next), Inst::Unreachable) {
                            // Nothing runs after this call on the normal
                            // path; the unwind path carries the decref.
                            if !tracker.may_throw.contains(&inst) {
                                internal_error!(
                                    "can't release {:?} after {:?}: successor is unreachable",
                                    op,
                                    inst
                                );
                            }
                        } else {
                            state.decrefs.push(RefOp {
                                operand: op,
                                nullable: var.nullable,
                                num_refs: 1,
                                at: InsertAt::Before(next),
                            });
                        }
                    }
                }
                state.ending_refs.insert(op, 1);
            }

            // Record the unwind cleanup for this call: everything currently
            // live, once per reference, in live-map order.
            if tracker.may_throw.contains(&inst) {
                let mut to_decref = Vec::new();
                for (&v, &count) in state.ending_refs.iter() {
                    for _ in 0..count {
                        to_decref.push(v);
                    }
                }
                if !to_decref.is_empty() {
                    state.cxx_fixups.push(CxxFixup { inst, to_decref });
                }
            }

            // Lastly, take care of any stolen refs. Stealing happens whether
            // or not an exception gets thrown, so (scanning in reverse) it
            // goes after the fixup recording.
            for (&op, _) in num_times_as_op.iter() {
                let consumed = num_consumed_by_inst.get(&op).copied().unwrap_or(0);
                if consumed > 0 {
                    *state.ending_refs.get_or_insert(op, || 0) += consumed;
                }
            }
        }

        // (c) Invokes are special: treat each one as if it happened in its
        // normal-destination block, with compensation on the incoming edge.
        for &invoke in &invokes {
            let normal_dest = match func.inst(invoke) {
                Inst::Invoke { normal_dest, .. } => *normal_dest,
                other => internal_error!("tracked invoke became {:?}", other),
            };
            if normal_dest != block {
                continue;
            }

            let refstate = tracker.expect_tracked(invoke);
            let defined = if refstate.reftype == RefType::Owned { 1 } else { 0 };
            let have = ref_count(&state.ending_refs, invoke);
            if have != defined {
                let at = InsertAt::TopOfBlock {
                    block,
                    from: Some(func.inst_block(invoke)),
                };
                if have < defined {
                    debug_assert!(refstate.reftype == RefType::Owned);
                    state.decrefs.push(RefOp {
                        operand: invoke,
                        nullable: refstate.nullable,
                        num_refs: defined - have,
                        at,
                    });
                } else {
                    state.increfs.push(RefOp {
                        operand: invoke,
                        nullable: refstate.nullable,
                        num_refs: have - defined,
                        at,
                    });
                }
            }
            state.ending_refs.remove(&invoke);
        }

        // (d) The entry block has no predecessor to hand the state to:
        // whatever is left must have entered the function alive (arguments,
        // constants, globals — all borrowed), and gets an initial incref.
        if block == func.entry_block() {
            let entries: Vec<(ValueId, i64)> = state
                .ending_refs
                .iter()
                .map(|(&v, &count)| (v, count))
                .collect();
            for (v, count) in entries {
                debug_assert!(count > 0);
                if func.is_inst(v) {
                    internal_error!("instruction {:?} is live above the entry block", v);
                }
                let var = tracker.expect_tracked(v);
                if var.reftype != RefType::Borrowed {
                    internal_error!("owned value {:?} leaks out of the entry block", v);
                }

                state.increfs.push(RefOp {
                    operand: v,
                    nullable: var.nullable,
                    num_refs: count,
                    at: InsertAt::TopOfBlock { block, from: None },
                });
            }
            state.ending_refs.clear();
        }

        dbg_do!(PYLON_PRINT_REFCOUNT_PROGRESS, {
            eprint!("End of {}:", func.block_name(block));
            for (&v, &count) in state.ending_refs.iter() {
                eprint!(" {v:?}={count}");
            }
            eprintln!();
        });

        // (e) It is possible that we ended with zero live references, which
        // (because un-run successors are skipped during reconciliation) is
        // not the same thing as an un-run block; hence the first_time check.
        if first_time || orig_ending_refs != state.ending_refs {
            for &pidx in &graph.predecessors[idx] {
                orderer.add(pidx);
            }
        }
    }

    if let Some(missed) = (0..num_blocks).find(|&idx| !states[idx].been_run) {
        internal_error!(
            "block {} was never processed",
            func.block_name(graph.blocks[missed])
        );
    }

    // First, find all insertion points. This may change the CFG by breaking
    // critical edges; resolving everything up front keeps the emission loop
    // off freshly created blocks.
    let mut insertion_cache = InsertionCache::default();
    for state in states.iter() {
        for op in state.increfs.iter().chain(state.decrefs.iter()) {
            if let InsertAt::TopOfBlock { block, from } = op.at {
                find_insertion_point(func, block, from, &mut insertion_cache);
            }
        }
    }

    // Then use the insertion points; this time every edge lookup hits the
    // cache. Null guards may still split blocks here.
    for state in states.iter_mut() {
        for op in std::mem::take(&mut state.increfs) {
            debug_assert!(tracker.is_tracked(op.operand));
            let at = resolve_insert_at(func, op.at, &mut insertion_cache);
            let operand = func.resolve(op.operand);
            emit_increfs(
                func,
                layout,
                runtime.ref_total,
                operand,
                op.nullable,
                op.num_refs,
                at,
            );
        }
        for op in std::mem::take(&mut state.decrefs) {
            debug_assert!(tracker.is_tracked(op.operand));
            let at = resolve_insert_at(func, op.at, &mut insertion_cache);
            let operand = func.resolve(op.operand);
            emit_decrefs(func, operand, op.nullable, op.num_refs, at);
        }
        for fixup in std::mem::take(&mut state.cxx_fixups) {
            emit_cxx_fixup(func, runtime, fixup.inst, &fixup.to_decref);
        }
    }

    // Yields get handled specially: every object we own at the yield point
    // is passed to the yield call so the runtime's traversal callback can
    // reach it. The front-end keeps yields at the start of their block, so
    // the block's live-at-top map is exactly the live set at the yield. A
    // call can't grow arguments in place; build a replacement.
    for &(old_yield, idx) in &yields {
        let old_yield = func.resolve(old_yield);
        let ending_refs = &states[idx].ending_refs;

        let args = match func.inst(old_yield) {
            Inst::Call { args, .. } => args.clone(),
            other => internal_error!("yield call became {:?}", other),
        };
        if args.len() != 3 {
            internal_error!(
                "yield call carries {} arguments, expected (generator, value, live count)",
                args.len()
            );
        }
        let yield_value = args[1];

        let mut live_owned: Vec<ValueId> = Vec::new();
        for (&v, _) in ending_refs.iter() {
            if tracker.expect_tracked(v).reftype == RefType::Owned {
                // The yield steals its value; don't list it.
                if func.resolve(v) != yield_value {
                    live_owned.push(func.resolve(v));
                }
            }
        }
        if live_owned.is_empty() {
            continue; // nothing to do
        }

        let i32_ty = func.types.i32();
        let live_count = func.const_int(i32_ty, live_owned.len() as i64);
        let mut new_args = vec![args[0], yield_value, live_count];
        new_args.extend(live_owned);

        let mut builder = FuncBuilder::new(func);
        builder.position_before(old_yield);
        let new_yield = builder.build_call(runtime.yield_capi, new_args);
        func.replace_all_uses(old_yield, new_yield);
        func.erase_inst(old_yield, Some(new_yield));
    }

    dbg_do!(PYLON_PRINT_IR_AFTER_REFCOUNT, {
        eprintln!("After refcounts:\n{func}");
    });

    timer.finish(&func.name);
}

fn next_inst_or_error(func: &Function, inst: ValueId) -> ValueId {
    match func.next_inst(inst) {
        Some(next) => next,
        None => internal_error!("no instruction after {:?} to insert at", inst),
    }
}

fn resolve_insert_at(
    func: &mut Function,
    at: InsertAt,
    cache: &mut InsertionCache,
) -> ValueId {
    match at {
        InsertAt::Before(inst) => func.resolve(inst),
        InsertAt::TopOfBlock { block, from } => find_insertion_point(func, block, from, cache),
    }
}

/// A value whose type looks like a refcounted object but which the front-end
/// did not annotate means the annotations cannot be trusted; refuse to run.
#[cfg(debug_assertions)]
fn audit_tracked_values(func: &Function, tracker: &RefcountTracker, layout: &ObjectLayout) {
    let object_struct = match func.types.pointee(layout.object_ptr_ty) {
        Some(ty) => ty,
        None => internal_error!("object pointer type is not a pointer"),
    };
    let class_ptr_ty = match func
        .types
        .struct_fields(object_struct)
        .and_then(|fields| fields.get(layout.class_index as usize).copied())
    {
        Some(ty) => ty,
        None => internal_error!("object layout has no class pointer field"),
    };

    let check = |v: ValueId| {
        if tracker.is_tracked(v) || func.is_undef(v) || func.is_const_null(v) {
            return;
        }
        let Some(mut pointee) = func.types.pointee(func.value_ty(v)) else {
            return;
        };

        // Take care of inheritance: it's represented as an instance of the
        // base type at the beginning of the derived type, not as the types
        // concatenated.
        loop {
            match func.types.struct_fields(pointee) {
                Some([first, ..]) if func.types.struct_fields(*first).is_some() => {
                    pointee = *first;
                }
                _ => break,
            }
        }

        let Some(fields) = func.types.struct_fields(pointee) else {
            return;
        };
        let refcount_index = layout.refcount_index as usize;
        if fields.len() < refcount_index + 2 {
            return;
        }
        if !func.types.is_int(fields[refcount_index]) {
            return;
        }
        if fields[refcount_index + 1] != class_ptr_ty {
            return;
        }

        internal_error!("missed a refcounted object: {:?}", v);
    };

    for &global in func.globals() {
        check(global);
    }
    for &param in func.params() {
        check(param);
    }
    for &block in func.layout() {
        for &inst in func.block_insts(block) {
            check(inst);
            for op in func.inst(inst).operands() {
                check(op);
            }
        }
    }
}
