//! Resolves "insert refcount ops at the top of block B, coming from block F"
//! requests down to a concrete instruction, splitting critical edges on
//! demand.

use pylon_collections::MutMap;
use pylon_error_macros::internal_error;
use pylon_ir::{BlockId, Function, Inst, ValueId};

/// Memoizes resolved points per (target, from) edge so each critical edge is
/// split at most once and every op bound for it shares the breaker block.
pub(crate) type InsertionCache = MutMap<(BlockId, Option<BlockId>), ValueId>;

/// Returns an instruction before which refcount ops for the edge
/// `from -> target` can safely be placed.
///
/// When `target` has more than one predecessor the edge is rerouted through
/// a fresh `breaker` block (φ-nodes in `target` are remapped), and ops land
/// in the breaker. Otherwise ops go after the landing-pad prologue if
/// `target` is an unwind destination, or before the first instruction that
/// is neither a φ-node nor a stack allocation.
pub(crate) fn find_insertion_point(
    func: &mut Function,
    target: BlockId,
    from: Option<BlockId>,
    cache: &mut InsertionCache,
) -> ValueId {
    let key = (target, from);
    if let Some(&point) = cache.get(&key) {
        return point;
    }

    // Break critical edges if we need to.
    if func.predecessors(target).len() > 1 {
        let from = match from {
            Some(from) => from,
            None => internal_error!(
                "don't know how to break the critical edge to {}",
                func.block_name(target)
            ),
        };

        let breaker = break_critical_edge(func, target, from);
        let point = func.first_inst(breaker).unwrap_or_else(|| {
            internal_error!("breaker block ended up empty");
        });
        cache.insert(key, point);
        return point;
    }

    let point = match func.first_inst(target).map(|first| func.inst(first)) {
        Some(Inst::LandingPad { .. }) => {
            // Don't split up the landingpad + extract + begin-catch prologue.
            match func.block_insts(target).get(3) {
                Some(&after_prologue) => after_prologue,
                None => internal_error!(
                    "landing pad block {} has no instruction after its prologue",
                    func.block_name(target)
                ),
            }
        }
        _ => {
            let first_insertable = func
                .block_insts(target)
                .iter()
                .copied()
                .find(|&inst| !func.is_phi(inst) && !func.is_alloca(inst));
            match first_insertable {
                Some(inst) => inst,
                None => internal_error!(
                    "no insertion point in block {}",
                    func.block_name(target)
                ),
            }
        }
    };

    cache.insert(key, point);
    point
}

/// Reroutes exactly the edge `from -> target` through a new `breaker` block
/// that falls through to `target`, rewriting `from`'s terminator and the
/// φ-nodes in `target`.
fn break_critical_edge(func: &mut Function, target: BlockId, from: BlockId) -> BlockId {
    let breaker = func.insert_block_before("breaker", target);
    let void = func.types.void();
    func.push_inst(breaker, void, Inst::Br { dest: target });

    let terminator = func.terminator(from);
    match func.inst_mut(terminator) {
        Inst::Br { dest } => {
            if *dest == target {
                *dest = breaker;
            }
        }
        Inst::CondBr {
            then_dest,
            else_dest,
            ..
        } => {
            if *then_dest == target {
                *then_dest = breaker;
            }
            if *else_dest == target {
                *else_dest = breaker;
            }
        }
        Inst::Invoke {
            normal_dest,
            unwind_dest,
            ..
        } => {
            if *normal_dest == target {
                *normal_dest = breaker;
            }
            if *unwind_dest == target {
                internal_error!("don't know how to break critical unwind edges");
            }
        }
        other => internal_error!("unhandled terminator type {:?} at edge break", other),
    }

    func.remap_phi_incoming(target, from, breaker);

    breaker
}
