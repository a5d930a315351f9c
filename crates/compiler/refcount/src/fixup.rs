//! Turns a throwing plain call into an invoke whose unwind destination
//! releases the references that were live across the call and rethrows.

use pylon_error_macros::internal_error;
use pylon_ir::{FuncBuilder, Function, Inst, ValueId};

use crate::pass::RuntimeSymbols;

/// Replaces `call` with an invoke. The normal destination is the split-off
/// continuation of its block; the unwind destination is a synthesized
/// `cxx_fixup` block that extracts the in-flight exception and tail-calls
/// the rethrow helper with `to_decref` (count first, then the values, in
/// live-map iteration order).
pub(crate) fn emit_cxx_fixup(
    func: &mut Function,
    runtime: &RuntimeSymbols,
    call: ValueId,
    to_decref: &[ValueId],
) {
    let call = func.resolve(call);
    let (callee, args) = match func.inst(call) {
        Inst::Call { callee, args } => (*callee, args.clone()),
        Inst::Invoke { .. } => internal_error!("don't need a fixup on an invoke"),
        other => internal_error!("cxx fixup on non-call {:?}", other),
    };

    let cur_block = func.inst_block(call);
    let continue_name = func.block_name(cur_block).to_string();
    let continue_block = func.split_block(call, continue_name);
    let fixup_block = func.insert_block_before("cxx_fixup", continue_block);

    let split_br = func.terminator(cur_block);
    func.erase_inst(split_br, None);

    let mut builder = FuncBuilder::new(func);
    builder.position_at_end(cur_block);
    let invoke = builder.build_invoke(callee, args, continue_block, fixup_block);

    func.replace_all_uses(call, invoke);
    func.erase_inst(call, Some(invoke));

    let i32_ty = func.types.i32();
    let count = func.const_int(i32_ty, to_decref.len() as i64);
    let mut call_args = Vec::with_capacity(to_decref.len() + 2);

    let mut builder = FuncBuilder::new(func);
    builder.position_at_end(fixup_block);
    let landing_pad = builder.build_landing_pad(runtime.personality);
    let exc_pointer = builder.build_extract_value(landing_pad, 0);
    call_args.push(exc_pointer);
    call_args.push(count);
    call_args.extend(to_decref.iter().map(|&v| builder.func().resolve(v)));
    builder.build_call(runtime.xdecref_and_rethrow, call_args);
    builder.build_unreachable();
}
