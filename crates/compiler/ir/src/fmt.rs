//! Plain-text listing of a function, in layout order. The output is stable
//! for a given function: value numbers are raw value ids and block labels are
//! `name.id`, so reprinting an unchanged function is byte-identical.

use crate::{BlockId, Function, Inst, TypeData, TypeId, ValueData, ValueId};
use std::fmt::{Display, Formatter, Result, Write};

impl Display for Function {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "fn @{}(", self.name)?;
        for (index, &param) in self.params().iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", operand(self, param), ty_str(self, self.value_ty(param)))?;
        }
        writeln!(f, ") {{")?;

        for &block in self.layout() {
            writeln!(f, "{}:", label(self, block))?;
            for &inst in self.block_insts(block) {
                writeln!(f, "  {}", inst_line(self, inst))?;
            }
        }

        writeln!(f, "}}")
    }
}

fn label(func: &Function, block: BlockId) -> String {
    format!("{}.{}", func.block_name(block), block.index())
}

fn operand(func: &Function, v: ValueId) -> String {
    let v = func.resolve(v);
    match func.value(v) {
        ValueData::ConstInt { value, .. } => format!("{value}"),
        ValueData::ConstNull { .. } => "null".to_string(),
        ValueData::Undef { .. } => "undef".to_string(),
        ValueData::Global { name, .. } => format!("@{name}"),
        _ => format!("%{}", v.index()),
    }
}

fn ty_str(func: &Function, ty: TypeId) -> String {
    match func.types.get(ty) {
        TypeData::Void => "void".to_string(),
        TypeData::Int { bits } => format!("i{bits}"),
        TypeData::Ptr { pointee } => format!("*{}", ty_str(func, *pointee)),
        TypeData::Struct {
            name: Some(name), ..
        } => name.clone(),
        TypeData::Struct { name: None, fields } => {
            let mut out = String::from("{");
            for (index, field) in fields.iter().enumerate() {
                if index > 0 {
                    out.push_str(", ");
                }
                out.push_str(&ty_str(func, *field));
            }
            out.push('}');
            out
        }
        TypeData::Func { params, ret, variadic } => {
            let mut out = String::from("fn(");
            for (index, param) in params.iter().enumerate() {
                if index > 0 {
                    out.push_str(", ");
                }
                out.push_str(&ty_str(func, *param));
            }
            if *variadic {
                if !params.is_empty() {
                    out.push_str(", ");
                }
                out.push_str("...");
            }
            let _ = write!(out, ") -> {}", ty_str(func, *ret));
            out
        }
    }
}

fn args_str(func: &Function, args: &[ValueId]) -> String {
    let mut out = String::new();
    for (index, &arg) in args.iter().enumerate() {
        if index > 0 {
            out.push_str(", ");
        }
        out.push_str(&operand(func, arg));
    }
    out
}

fn inst_line(func: &Function, v: ValueId) -> String {
    let ty = func.value_ty(v);
    let is_void = matches!(func.types.get(ty), TypeData::Void);
    let prefix = if is_void {
        String::new()
    } else {
        format!("%{} = ", v.index())
    };

    let body = match func.inst(v) {
        Inst::Phi { incoming } => {
            let mut out = String::from("phi ");
            for (index, (value, from)) in incoming.iter().enumerate() {
                if index > 0 {
                    out.push_str(", ");
                }
                let _ = write!(out, "[ {}, {} ]", operand(func, *value), label(func, *from));
            }
            out
        }
        Inst::Alloca { allocated } => format!("alloca {}", ty_str(func, *allocated)),
        Inst::Load { ptr } => format!("load {}", operand(func, *ptr)),
        Inst::Store { value, ptr } => {
            format!("store {}, {}", operand(func, *value), operand(func, *ptr))
        }
        Inst::FieldPtr { base, field } => {
            format!("fieldptr {}, {}", operand(func, *base), field)
        }
        Inst::Bitcast { value } => {
            format!("bitcast {} to {}", operand(func, *value), ty_str(func, ty))
        }
        Inst::Add { lhs, rhs } => {
            format!("add {}, {}", operand(func, *lhs), operand(func, *rhs))
        }
        Inst::Sub { lhs, rhs } => {
            format!("sub {}, {}", operand(func, *lhs), operand(func, *rhs))
        }
        Inst::IcmpEq { lhs, rhs } => {
            format!("icmp.eq {}, {}", operand(func, *lhs), operand(func, *rhs))
        }
        Inst::Call { callee, args } => {
            format!("call {}({})", operand(func, *callee), args_str(func, args))
        }
        Inst::Invoke {
            callee,
            args,
            normal_dest,
            unwind_dest,
        } => format!(
            "invoke {}({}) to {} unwind {}",
            operand(func, *callee),
            args_str(func, args),
            label(func, *normal_dest),
            label(func, *unwind_dest)
        ),
        Inst::Patchpoint {
            id,
            num_bytes,
            target,
            args,
        } => format!(
            "patchpoint id={}, bytes={}, {}({})",
            id,
            num_bytes,
            operand(func, *target),
            args_str(func, args)
        ),
        Inst::LandingPad { personality } => {
            format!("landingpad personality {}", operand(func, *personality))
        }
        Inst::ExtractValue { agg, index } => {
            format!("extractvalue {}, {}", operand(func, *agg), index)
        }
        Inst::Br { dest } => format!("br {}", label(func, *dest)),
        Inst::CondBr {
            cond,
            then_dest,
            else_dest,
        } => format!(
            "condbr {}, {}, {}",
            operand(func, *cond),
            label(func, *then_dest),
            label(func, *else_dest)
        ),
        Inst::Ret { value: Some(value) } => format!("ret {}", operand(func, *value)),
        Inst::Ret { value: None } => "ret void".to_string(),
        Inst::Unreachable => "unreachable".to_string(),
    };

    format!("{prefix}{body}")
}
