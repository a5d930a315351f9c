use crate::{BlockId, TypeId, TypeStore, ValueId};
use pylon_error_macros::internal_error;

/// A value in a function: an instruction result, or one of the
/// non-instruction value kinds (parameters, globals, constants).
///
/// Erased instructions leave a `Replaced` tombstone behind so that side
/// tables holding their old id can still find the replacement; see
/// [Function::resolve].
#[derive(Clone, Debug)]
pub enum ValueData {
    Param {
        ty: TypeId,
        name: String,
    },
    Global {
        ty: TypeId,
        name: String,
    },
    ConstInt {
        ty: TypeId,
        value: i64,
    },
    ConstNull {
        ty: TypeId,
    },
    Undef {
        ty: TypeId,
    },
    Inst {
        ty: TypeId,
        block: BlockId,
        inst: Inst,
    },
    Replaced {
        by: Option<ValueId>,
    },
}

/// An instruction. Instructions that produce no meaningful result (stores,
/// branches, void calls) still occupy a value id with void type.
#[derive(Clone, Debug)]
pub enum Inst {
    Phi {
        incoming: Vec<(ValueId, BlockId)>,
    },
    Alloca {
        allocated: TypeId,
    },
    Load {
        ptr: ValueId,
    },
    Store {
        value: ValueId,
        ptr: ValueId,
    },
    /// `&(*base).field` — constant field projection, the only
    /// pointer-arithmetic shape the compiler emits.
    FieldPtr {
        base: ValueId,
        field: u32,
    },
    Bitcast {
        value: ValueId,
    },
    Add {
        lhs: ValueId,
        rhs: ValueId,
    },
    Sub {
        lhs: ValueId,
        rhs: ValueId,
    },
    IcmpEq {
        lhs: ValueId,
        rhs: ValueId,
    },
    Call {
        callee: ValueId,
        args: Vec<ValueId>,
    },
    Invoke {
        callee: ValueId,
        args: Vec<ValueId>,
        normal_dest: BlockId,
        unwind_dest: BlockId,
    },
    /// Opaque runtime call site at which a stack map is recorded.
    Patchpoint {
        id: u64,
        num_bytes: u32,
        target: ValueId,
        args: Vec<ValueId>,
    },
    /// Must be the first instruction of its block. Catches everything.
    LandingPad {
        personality: ValueId,
    },
    ExtractValue {
        agg: ValueId,
        index: u32,
    },
    Br {
        dest: BlockId,
    },
    CondBr {
        cond: ValueId,
        then_dest: BlockId,
        else_dest: BlockId,
    },
    Ret {
        value: Option<ValueId>,
    },
    Unreachable,
}

impl Inst {
    /// Value operands in their source order. Block references are not
    /// operands.
    pub fn operands(&self) -> Vec<ValueId> {
        match self {
            Inst::Phi { incoming } => incoming.iter().map(|(value, _)| *value).collect(),
            Inst::Alloca { .. } | Inst::LandingPad { .. } | Inst::Unreachable => vec![],
            Inst::Load { ptr } => vec![*ptr],
            Inst::Store { value, ptr } => vec![*value, *ptr],
            Inst::FieldPtr { base, .. } => vec![*base],
            Inst::Bitcast { value } => vec![*value],
            Inst::Add { lhs, rhs } | Inst::Sub { lhs, rhs } | Inst::IcmpEq { lhs, rhs } => {
                vec![*lhs, *rhs]
            }
            Inst::Call { callee, args } | Inst::Invoke { callee, args, .. } => {
                let mut operands = args.clone();
                operands.push(*callee);
                operands
            }
            Inst::Patchpoint { target, args, .. } => {
                let mut operands = vec![*target];
                operands.extend(args.iter().copied());
                operands
            }
            Inst::ExtractValue { agg, .. } => vec![*agg],
            Inst::Br { .. } => vec![],
            Inst::CondBr { cond, .. } => vec![*cond],
            Inst::Ret { value } => value.iter().copied().collect(),
        }
    }

    fn operands_mut(&mut self) -> Vec<&mut ValueId> {
        match self {
            Inst::Phi { incoming } => incoming.iter_mut().map(|(value, _)| value).collect(),
            Inst::Alloca { .. } | Inst::LandingPad { .. } | Inst::Unreachable => vec![],
            Inst::Load { ptr } => vec![ptr],
            Inst::Store { value, ptr } => vec![value, ptr],
            Inst::FieldPtr { base, .. } => vec![base],
            Inst::Bitcast { value } => vec![value],
            Inst::Add { lhs, rhs } | Inst::Sub { lhs, rhs } | Inst::IcmpEq { lhs, rhs } => {
                vec![lhs, rhs]
            }
            Inst::Call { callee, args } | Inst::Invoke { callee, args, .. } => {
                let mut operands: Vec<&mut ValueId> = args.iter_mut().collect();
                operands.push(callee);
                operands
            }
            Inst::Patchpoint { target, args, .. } => {
                let mut operands: Vec<&mut ValueId> = vec![target];
                operands.extend(args.iter_mut());
                operands
            }
            Inst::ExtractValue { agg, .. } => vec![agg],
            Inst::Br { .. } => vec![],
            Inst::CondBr { cond, .. } => vec![cond],
            Inst::Ret { value } => value.iter_mut().collect(),
        }
    }

    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Inst::Br { .. }
                | Inst::CondBr { .. }
                | Inst::Invoke { .. }
                | Inst::Ret { .. }
                | Inst::Unreachable
        )
    }

    /// Successor blocks, one entry per CFG edge (a conditional branch with
    /// both targets equal contributes two entries).
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Inst::Br { dest } => vec![*dest],
            Inst::CondBr {
                then_dest,
                else_dest,
                ..
            } => vec![*then_dest, *else_dest],
            Inst::Invoke {
                normal_dest,
                unwind_dest,
                ..
            } => vec![*normal_dest, *unwind_dest],
            _ => vec![],
        }
    }
}

#[derive(Clone, Debug)]
pub struct BlockData {
    pub name: String,
    insts: Vec<ValueId>,
}

/// A function under construction or transformation. Owns its type store,
/// value table and blocks; blocks are kept in an explicit layout order that
/// printing and block-index passes observe.
#[derive(Clone, Debug)]
pub struct Function {
    pub name: String,
    pub types: TypeStore,
    values: Vec<ValueData>,
    blocks: Vec<BlockData>,
    layout: Vec<BlockId>,
    params: Vec<ValueId>,
    globals: Vec<ValueId>,
}

impl Function {
    pub fn new(name: impl Into<String>) -> Self {
        Function {
            name: name.into(),
            types: TypeStore::new(),
            values: Vec::new(),
            blocks: Vec::new(),
            layout: Vec::new(),
            params: Vec::new(),
            globals: Vec::new(),
        }
    }

    fn push_value(&mut self, data: ValueData) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.values.push(data);
        id
    }

    pub fn add_param(&mut self, name: impl Into<String>, ty: TypeId) -> ValueId {
        let id = self.push_value(ValueData::Param {
            ty,
            name: name.into(),
        });
        self.params.push(id);
        id
    }

    /// Registers a module-level symbol (global variable or function) used by
    /// this function. Its type is the pointer type through which it is used.
    pub fn add_global(&mut self, name: impl Into<String>, ty: TypeId) -> ValueId {
        let id = self.push_value(ValueData::Global {
            ty,
            name: name.into(),
        });
        self.globals.push(id);
        id
    }

    pub fn const_int(&mut self, ty: TypeId, value: i64) -> ValueId {
        self.push_value(ValueData::ConstInt { ty, value })
    }

    pub fn const_null(&mut self, ty: TypeId) -> ValueId {
        self.push_value(ValueData::ConstNull { ty })
    }

    pub fn undef(&mut self, ty: TypeId) -> ValueId {
        self.push_value(ValueData::Undef { ty })
    }

    pub fn params(&self) -> &[ValueId] {
        &self.params
    }

    pub fn globals(&self) -> &[ValueId] {
        &self.globals
    }

    pub fn num_values(&self) -> usize {
        self.values.len()
    }

    pub fn value(&self, v: ValueId) -> &ValueData {
        match self.values.get(v.0 as usize) {
            Some(data) => data,
            None => internal_error!("value {:?} is not in function {}", v, self.name),
        }
    }

    pub fn value_ty(&self, v: ValueId) -> TypeId {
        match self.value(self.resolve(v)) {
            ValueData::Param { ty, .. }
            | ValueData::Global { ty, .. }
            | ValueData::ConstInt { ty, .. }
            | ValueData::ConstNull { ty }
            | ValueData::Undef { ty }
            | ValueData::Inst { ty, .. } => *ty,
            ValueData::Replaced { .. } => {
                internal_error!("asked for the type of erased value {:?}", v)
            }
        }
    }

    /// Follows erased-instruction forwarding until a live value is reached.
    /// Side tables built before a call was rewritten resolve through this.
    pub fn resolve(&self, v: ValueId) -> ValueId {
        let mut cur = v;
        loop {
            match self.value(cur) {
                ValueData::Replaced { by: Some(next) } => cur = *next,
                ValueData::Replaced { by: None } => {
                    internal_error!("value {:?} was erased without a replacement", v)
                }
                _ => return cur,
            }
        }
    }

    pub fn is_const_null(&self, v: ValueId) -> bool {
        matches!(self.value(self.resolve(v)), ValueData::ConstNull { .. })
    }

    pub fn is_undef(&self, v: ValueId) -> bool {
        matches!(self.value(self.resolve(v)), ValueData::Undef { .. })
    }

    pub fn is_inst(&self, v: ValueId) -> bool {
        matches!(self.value(self.resolve(v)), ValueData::Inst { .. })
    }

    // === blocks ===

    pub fn add_block(&mut self, name: impl Into<String>) -> BlockId {
        let id = self.make_block(name);
        self.layout.push(id);
        id
    }

    /// Creates a block placed immediately before `before` in layout order.
    pub fn insert_block_before(&mut self, name: impl Into<String>, before: BlockId) -> BlockId {
        let id = self.make_block(name);
        let position = self.layout_position(before);
        self.layout.insert(position, id);
        id
    }

    /// Creates a block placed immediately after `after` in layout order.
    pub fn insert_block_after(&mut self, name: impl Into<String>, after: BlockId) -> BlockId {
        let id = self.make_block(name);
        let position = self.layout_position(after);
        self.layout.insert(position + 1, id);
        id
    }

    fn make_block(&mut self, name: impl Into<String>) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BlockData {
            name: name.into(),
            insts: Vec::new(),
        });
        id
    }

    fn layout_position(&self, block: BlockId) -> usize {
        match self.layout.iter().position(|b| *b == block) {
            Some(position) => position,
            None => internal_error!("block {:?} is not in the layout of {}", block, self.name),
        }
    }

    /// Blocks in layout order. The first entry is the entry block.
    pub fn layout(&self) -> &[BlockId] {
        &self.layout
    }

    pub fn entry_block(&self) -> BlockId {
        match self.layout.first() {
            Some(entry) => *entry,
            None => internal_error!("function {} has no blocks", self.name),
        }
    }

    pub fn block_name(&self, block: BlockId) -> &str {
        &self.block(block).name
    }

    fn block(&self, block: BlockId) -> &BlockData {
        match self.blocks.get(block.0 as usize) {
            Some(data) => data,
            None => internal_error!("block {:?} is not in function {}", block, self.name),
        }
    }

    pub fn block_insts(&self, block: BlockId) -> &[ValueId] {
        &self.block(block).insts
    }

    pub fn first_inst(&self, block: BlockId) -> Option<ValueId> {
        self.block(block).insts.first().copied()
    }

    pub fn terminator(&self, block: BlockId) -> ValueId {
        match self.block(block).insts.last() {
            Some(last) if self.inst(*last).is_terminator() => *last,
            _ => internal_error!(
                "block {} has no terminator",
                self.block_name(block)
            ),
        }
    }

    pub fn successors(&self, block: BlockId) -> Vec<BlockId> {
        self.inst(self.terminator(block)).successors()
    }

    /// Predecessors of `block`, one entry per incoming CFG edge, in layout
    /// order of the source blocks.
    pub fn predecessors(&self, block: BlockId) -> Vec<BlockId> {
        let mut preds = Vec::new();
        for &b in &self.layout {
            for succ in self.successors(b) {
                if succ == block {
                    preds.push(b);
                }
            }
        }
        preds
    }

    // === instructions ===

    pub fn push_inst(&mut self, block: BlockId, ty: TypeId, inst: Inst) -> ValueId {
        let id = self.push_value(ValueData::Inst { ty, block, inst });
        self.blocks[block.0 as usize].insts.push(id);
        id
    }

    pub fn insert_inst_before(&mut self, before: ValueId, ty: TypeId, inst: Inst) -> ValueId {
        let before = self.resolve(before);
        let block = self.inst_block(before);
        let position = self.inst_position(before);
        let id = self.push_value(ValueData::Inst { ty, block, inst });
        self.blocks[block.0 as usize].insts.insert(position, id);
        id
    }

    pub fn inst(&self, v: ValueId) -> &Inst {
        match self.value(self.resolve(v)) {
            ValueData::Inst { inst, .. } => inst,
            other => internal_error!("value {:?} is not an instruction: {:?}", v, other),
        }
    }

    pub fn inst_mut(&mut self, v: ValueId) -> &mut Inst {
        let v = self.resolve(v);
        match &mut self.values[v.0 as usize] {
            ValueData::Inst { inst, .. } => inst,
            other => internal_error!("value {:?} is not an instruction: {:?}", v, other),
        }
    }

    pub fn inst_block(&self, v: ValueId) -> BlockId {
        match self.value(self.resolve(v)) {
            ValueData::Inst { block, .. } => *block,
            other => internal_error!("value {:?} is not an instruction: {:?}", v, other),
        }
    }

    fn inst_position(&self, v: ValueId) -> usize {
        let block = self.inst_block(v);
        match self.block(block).insts.iter().position(|i| *i == v) {
            Some(position) => position,
            None => internal_error!(
                "instruction {:?} is not in its block {}",
                v,
                self.block_name(block)
            ),
        }
    }

    /// The instruction after `v` in its block, if any.
    pub fn next_inst(&self, v: ValueId) -> Option<ValueId> {
        let v = self.resolve(v);
        let block = self.inst_block(v);
        let position = self.inst_position(v);
        self.block(block).insts.get(position + 1).copied()
    }

    pub fn is_phi(&self, v: ValueId) -> bool {
        self.is_inst(v) && matches!(self.inst(v), Inst::Phi { .. })
    }

    pub fn is_alloca(&self, v: ValueId) -> bool {
        self.is_inst(v) && matches!(self.inst(v), Inst::Alloca { .. })
    }

    // === mutation ===

    /// Rewrites φ-nodes at the top of `in_block` so that incoming edges
    /// recorded from `old_from` are recorded from `new_from` instead.
    pub fn remap_phi_incoming(&mut self, in_block: BlockId, old_from: BlockId, new_from: BlockId) {
        let insts = self.blocks[in_block.0 as usize].insts.clone();
        for v in insts {
            match &mut self.values[v.0 as usize] {
                ValueData::Inst {
                    inst: Inst::Phi { incoming },
                    ..
                } => {
                    for (_, from) in incoming.iter_mut() {
                        if *from == old_from {
                            *from = new_from;
                        }
                    }
                }
                _ => break,
            }
        }
    }

    /// Splits the block containing `at` in two: `at` and everything after it
    /// move to a fresh block placed right after the original, the original
    /// gets an unconditional branch to the fresh block, and φ-nodes in the
    /// moved terminator's successors are retargeted.
    pub fn split_block(&mut self, at: ValueId, name: impl Into<String>) -> BlockId {
        let at = self.resolve(at);
        let old_block = self.inst_block(at);
        let position = self.inst_position(at);

        let new_block = self.insert_block_after(name, old_block);
        let moved = self.blocks[old_block.0 as usize].insts.split_off(position);
        for &v in &moved {
            match &mut self.values[v.0 as usize] {
                ValueData::Inst { block, .. } => *block = new_block,
                _ => internal_error!("non-instruction {:?} in block list", v),
            }
        }
        self.blocks[new_block.0 as usize].insts = moved;

        for succ in self.successors(new_block) {
            self.remap_phi_incoming(succ, old_block, new_block);
        }

        let void = self.types.void();
        self.push_inst(old_block, void, Inst::Br { dest: new_block });

        new_block
    }

    /// Replaces every operand use of `old` with `new`, in instructions and
    /// φ-nodes alike.
    pub fn replace_all_uses(&mut self, old: ValueId, new: ValueId) {
        for data in self.values.iter_mut() {
            if let ValueData::Inst { inst, .. } = data {
                for operand in inst.operands_mut() {
                    if *operand == old {
                        *operand = new;
                    }
                }
            }
        }
    }

    /// Removes `v` from its block. When `forward` is given, side tables and
    /// later lookups resolve `v` to it; erasing a value that still has uses
    /// and no forward is a bug the validator catches.
    pub fn erase_inst(&mut self, v: ValueId, forward: Option<ValueId>) {
        let block = self.inst_block(v);
        let position = self.inst_position(v);
        self.blocks[block.0 as usize].insts.remove(position);
        self.values[v.0 as usize] = ValueData::Replaced { by: forward };
    }
}
