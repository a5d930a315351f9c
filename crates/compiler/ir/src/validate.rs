//! Structural well-formedness checks, run from tests and behind debug
//! assertions in the passes. A failure is always a compiler bug.

use crate::{Function, Inst, ValueData};
use pylon_collections::VecSet;
use pylon_error_macros::internal_error;

pub fn validate(func: &Function) {
    if func.layout().is_empty() {
        internal_error!("function {} has no blocks", func.name);
    }

    for &block in func.layout() {
        let insts = func.block_insts(block);
        if insts.is_empty() {
            internal_error!("block {} is empty", func.block_name(block));
        }

        let mut seen_non_phi = false;
        for (position, &inst) in insts.iter().enumerate() {
            let is_last = position + 1 == insts.len();
            let data = func.inst(inst);

            if data.is_terminator() && !is_last {
                internal_error!(
                    "terminator in the middle of block {}",
                    func.block_name(block)
                );
            }
            if is_last && !data.is_terminator() {
                internal_error!("block {} has no terminator", func.block_name(block));
            }

            match data {
                Inst::Phi { .. } => {
                    if seen_non_phi {
                        internal_error!(
                            "phi after non-phi in block {}",
                            func.block_name(block)
                        );
                    }
                }
                Inst::LandingPad { .. } => {
                    if position != 0 {
                        internal_error!(
                            "landing pad is not the first instruction of block {}",
                            func.block_name(block)
                        );
                    }
                    seen_non_phi = true;
                }
                _ => seen_non_phi = true,
            }

            for operand in data.operands() {
                let resolved = func.resolve(operand);
                if matches!(func.value(resolved), ValueData::Replaced { .. }) {
                    internal_error!(
                        "instruction {:?} in block {} uses erased value {:?}",
                        inst,
                        func.block_name(block),
                        operand
                    );
                }
            }

            if let Inst::Invoke { unwind_dest, .. } = data {
                let first = func.first_inst(*unwind_dest);
                if !matches!(first.map(|v| func.inst(v)), Some(Inst::LandingPad { .. })) {
                    internal_error!(
                        "unwind destination {} does not start with a landing pad",
                        func.block_name(*unwind_dest)
                    );
                }
            }
        }
    }

    // Each phi must name exactly the predecessor blocks of its block.
    for &block in func.layout() {
        let preds: VecSet<_> = func.predecessors(block).into_iter().collect();
        for &inst in func.block_insts(block) {
            if let Inst::Phi { incoming } = func.inst(inst) {
                let incoming_blocks: VecSet<_> =
                    incoming.iter().map(|(_, from)| *from).collect();
                let mismatch = incoming_blocks.iter().any(|from| !preds.contains(from))
                    || preds.iter().any(|pred| !incoming_blocks.contains(pred));
                if mismatch {
                    internal_error!(
                        "phi {:?} in block {} names {:?} but the predecessors are {:?}",
                        inst,
                        func.block_name(block),
                        incoming_blocks,
                        preds
                    );
                }
            }
        }
    }
}
