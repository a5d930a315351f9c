//! Emits the refcount arithmetic itself: increfs inline, decrefs through the
//! patchpoint convention so the runtime can read a stack map at the site and
//! perform the decrement and conditional deallocation.

use pylon_error_macros::internal_error;
use pylon_ir::{FuncBuilder, Function, ValueId};

use crate::pass::ObjectLayout;

/// Stackmap id recorded at non-nullable decref patchpoints.
pub const DECREF_PP_ID: u64 = 1025;
/// Stackmap id recorded at null-guarded decref patchpoints.
pub const XDECREF_PP_ID: u64 = 1026;
/// Reserved byte size of a non-nullable decref patchpoint.
pub const DECREF_PP_SIZE: u32 = 13;
/// Reserved byte size of a null-guarded decref patchpoint.
pub const XDECREF_PP_SIZE: u32 = 13;

/// Adds `num_refs` to `v`'s refcount field, immediately before `at`.
///
/// `v` may have a derived object type; the leading-member chain is chased
/// down to the canonical object pointer first. When `nullable`, the
/// arithmetic is guarded by a null check that branches around it.
pub(crate) fn emit_increfs(
    func: &mut Function,
    layout: &ObjectLayout,
    ref_total: Option<ValueId>,
    v: ValueId,
    nullable: bool,
    num_refs: i64,
    at: ValueId,
) {
    if func.is_const_null(v) {
        debug_assert!(nullable);
        return;
    }

    if num_refs <= 0 {
        internal_error!("incref of {} refs", num_refs);
    }

    let at = func.resolve(at);

    // Deal with subtypes of the object type: the base is the leading member.
    let mut v = v;
    {
        let mut builder = FuncBuilder::new(func);
        builder.position_before(at);
        while builder.func().value_ty(v) != layout.object_ptr_ty {
            v = builder.build_field_ptr(v, 0);
        }
    }

    let guard = if nullable {
        let cur_block = func.inst_block(at);
        let continue_name = func.block_name(cur_block).to_string();
        let continue_block = func.split_block(at, continue_name);
        let incref_block = func.insert_block_before("incref", continue_block);

        let split_br = func.terminator(cur_block);
        func.erase_inst(split_br, None);

        let v_ty = func.value_ty(v);
        let null = func.const_null(v_ty);
        let mut builder = FuncBuilder::new(func);
        builder.position_at_end(cur_block);
        let is_null = builder.build_icmp_eq(v, null);
        builder.build_cond_br(is_null, continue_block, incref_block);

        Some((incref_block, continue_block))
    } else {
        None
    };

    let mut builder = FuncBuilder::new(func);
    match guard {
        Some((incref_block, _)) => builder.position_at_end(incref_block),
        None => builder.position_before(at),
    }

    // Debug runtimes keep a process-wide total of live references.
    if let Some(ref_total) = ref_total {
        let total = builder.build_load(ref_total);
        let total_ty = builder.func().value_ty(total);
        let amount = builder.func().const_int(total_ty, num_refs);
        let new_total = builder.build_add(total, amount);
        builder.build_store(new_total, ref_total);
    }

    let refcount_ptr = builder.build_field_ptr(v, layout.refcount_index);
    let refcount = builder.build_load(refcount_ptr);
    let refcount_ty = builder.func().value_ty(refcount);
    let amount = builder.func().const_int(refcount_ty, num_refs);
    let new_refcount = builder.build_add(refcount, amount);
    builder.build_store(new_refcount, refcount_ptr);

    if let Some((_, continue_block)) = guard {
        builder.build_br(continue_block);
    }
}

/// Releases one reference of `v` immediately before `at`, as an opaque
/// patchpoint call; the runtime performs the decrement and the conditional
/// deallocation behind it. When `nullable`, the site is guarded by a null
/// check and the patchpoint itself is emitted on the non-null arm.
pub(crate) fn emit_decrefs(
    func: &mut Function,
    v: ValueId,
    nullable: bool,
    num_refs: i64,
    at: ValueId,
) {
    if func.is_const_null(v) {
        debug_assert!(nullable);
        return;
    }

    if num_refs <= 0 {
        internal_error!("decref of {} refs", num_refs);
    }

    let at = func.resolve(at);

    if nullable {
        let cur_block = func.inst_block(at);
        let continue_name = func.block_name(cur_block).to_string();
        let continue_block = func.split_block(at, continue_name);
        let decref_block = func.insert_block_before("decref", continue_block);

        let split_br = func.terminator(cur_block);
        func.erase_inst(split_br, None);

        let v_ty = func.value_ty(v);
        let null = func.const_null(v_ty);
        let mut builder = FuncBuilder::new(func);
        builder.position_at_end(cur_block);
        let is_null = builder.build_icmp_eq(v, null);
        builder.build_cond_br(is_null, continue_block, decref_block);

        builder.position_at_end(decref_block);
        let jump = builder.build_br(continue_block);

        emit_decrefs(func, v, false, num_refs, jump);
        return;
    }

    if num_refs != 1 {
        internal_error!("decref patchpoints don't support >1 refs");
    }

    let (pp_id, pp_size) = if nullable {
        (XDECREF_PP_ID, XDECREF_PP_SIZE)
    } else {
        (DECREF_PP_ID, DECREF_PP_SIZE)
    };

    let i8_ptr = func.types.i8_ptr();
    let patch_target = func.const_null(i8_ptr);
    let mut builder = FuncBuilder::new(func);
    builder.position_before(at);
    builder.build_patchpoint(pp_id, pp_size, patch_target, vec![v]);
}
