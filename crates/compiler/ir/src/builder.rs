use crate::{BlockId, Function, Inst, TypeId, ValueId};
use pylon_error_macros::internal_error;

#[derive(Clone, Copy, Debug)]
enum Position {
    Nowhere,
    AtEnd(BlockId),
    /// New instructions go immediately before this one, in emission order.
    Before(ValueId),
}

/// Cursor-style instruction builder over a [Function]. Computes result types
/// from operand types so call sites stay terse.
pub struct FuncBuilder<'f> {
    func: &'f mut Function,
    position: Position,
}

impl<'f> FuncBuilder<'f> {
    pub fn new(func: &'f mut Function) -> Self {
        FuncBuilder {
            func,
            position: Position::Nowhere,
        }
    }

    pub fn func(&mut self) -> &mut Function {
        self.func
    }

    pub fn position_at_end(&mut self, block: BlockId) {
        self.position = Position::AtEnd(block);
    }

    pub fn position_before(&mut self, inst: ValueId) {
        self.position = Position::Before(inst);
    }

    /// The block new instructions currently go into.
    pub fn current_block(&self) -> BlockId {
        match self.position {
            Position::Nowhere => internal_error!("builder is not positioned"),
            Position::AtEnd(block) => block,
            Position::Before(inst) => self.func.inst_block(inst),
        }
    }

    fn insert(&mut self, ty: TypeId, inst: Inst) -> ValueId {
        match self.position {
            Position::Nowhere => internal_error!("builder is not positioned"),
            Position::AtEnd(block) => self.func.push_inst(block, ty, inst),
            Position::Before(before) => self.func.insert_inst_before(before, ty, inst),
        }
    }

    pub fn build_phi(&mut self, ty: TypeId, incoming: Vec<(ValueId, BlockId)>) -> ValueId {
        self.insert(ty, Inst::Phi { incoming })
    }

    pub fn build_alloca(&mut self, allocated: TypeId) -> ValueId {
        let ty = self.func.types.ptr(allocated);
        self.insert(ty, Inst::Alloca { allocated })
    }

    pub fn build_load(&mut self, ptr: ValueId) -> ValueId {
        let ptr_ty = self.func.value_ty(ptr);
        let ty = match self.func.types.pointee(ptr_ty) {
            Some(pointee) => pointee,
            None => internal_error!("load from non-pointer {:?}", ptr),
        };
        self.insert(ty, Inst::Load { ptr })
    }

    pub fn build_store(&mut self, value: ValueId, ptr: ValueId) -> ValueId {
        let void = self.func.types.void();
        self.insert(void, Inst::Store { value, ptr })
    }

    pub fn build_field_ptr(&mut self, base: ValueId, field: u32) -> ValueId {
        let base_ty = self.func.value_ty(base);
        let field_ty = match self.func.types.field_ty(base_ty, field) {
            Some(ty) => ty,
            None => internal_error!(
                "field {} projection from non-struct-pointer {:?}",
                field,
                base
            ),
        };
        let ty = self.func.types.ptr(field_ty);
        self.insert(ty, Inst::FieldPtr { base, field })
    }

    pub fn build_bitcast(&mut self, value: ValueId, ty: TypeId) -> ValueId {
        self.insert(ty, Inst::Bitcast { value })
    }

    pub fn build_add(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        let ty = self.func.value_ty(lhs);
        self.insert(ty, Inst::Add { lhs, rhs })
    }

    pub fn build_sub(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        let ty = self.func.value_ty(lhs);
        self.insert(ty, Inst::Sub { lhs, rhs })
    }

    pub fn build_icmp_eq(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        let ty = self.func.types.i1();
        self.insert(ty, Inst::IcmpEq { lhs, rhs })
    }

    fn callee_ret_ty(&mut self, callee: ValueId) -> TypeId {
        let callee_ty = self.func.value_ty(callee);
        let ret = self
            .func
            .types
            .pointee(callee_ty)
            .and_then(|fn_ty| self.func.types.func_ret(fn_ty));
        match ret {
            Some(ty) => ty,
            None => internal_error!("callee {:?} is not a function pointer", callee),
        }
    }

    pub fn build_call(&mut self, callee: ValueId, args: Vec<ValueId>) -> ValueId {
        let ty = self.callee_ret_ty(callee);
        self.insert(ty, Inst::Call { callee, args })
    }

    pub fn build_invoke(
        &mut self,
        callee: ValueId,
        args: Vec<ValueId>,
        normal_dest: BlockId,
        unwind_dest: BlockId,
    ) -> ValueId {
        let ty = self.callee_ret_ty(callee);
        self.insert(
            ty,
            Inst::Invoke {
                callee,
                args,
                normal_dest,
                unwind_dest,
            },
        )
    }

    pub fn build_patchpoint(
        &mut self,
        id: u64,
        num_bytes: u32,
        target: ValueId,
        args: Vec<ValueId>,
    ) -> ValueId {
        let void = self.func.types.void();
        self.insert(
            void,
            Inst::Patchpoint {
                id,
                num_bytes,
                target,
                args,
            },
        )
    }

    /// The result type is the `{ i8*, i64 }` exception record.
    pub fn build_landing_pad(&mut self, personality: ValueId) -> ValueId {
        let i8_ptr = self.func.types.i8_ptr();
        let i64 = self.func.types.i64();
        let ty = self.func.types.tuple(vec![i8_ptr, i64]);
        self.insert(ty, Inst::LandingPad { personality })
    }

    pub fn build_extract_value(&mut self, agg: ValueId, index: u32) -> ValueId {
        let agg_ty = self.func.value_ty(agg);
        let ty = match self
            .func
            .types
            .struct_fields(agg_ty)
            .and_then(|fields| fields.get(index as usize).copied())
        {
            Some(ty) => ty,
            None => internal_error!("extract {} from non-struct {:?}", index, agg),
        };
        self.insert(ty, Inst::ExtractValue { agg, index })
    }

    pub fn build_br(&mut self, dest: BlockId) -> ValueId {
        let void = self.func.types.void();
        self.insert(void, Inst::Br { dest })
    }

    pub fn build_cond_br(
        &mut self,
        cond: ValueId,
        then_dest: BlockId,
        else_dest: BlockId,
    ) -> ValueId {
        let void = self.func.types.void();
        self.insert(
            void,
            Inst::CondBr {
                cond,
                then_dest,
                else_dest,
            },
        )
    }

    pub fn build_ret(&mut self, value: Option<ValueId>) -> ValueId {
        let void = self.func.types.void();
        self.insert(void, Inst::Ret { value })
    }

    pub fn build_unreachable(&mut self) -> ValueId {
        let void = self.func.types.void();
        self.insert(void, Inst::Unreachable)
    }
}
