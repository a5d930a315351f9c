use pylon_collections::{MutMap, MutSet};
use pylon_error_macros::internal_error;
use pylon_ir::{Function, Inst, ValueId};

/// Reference semantics of a tracked value.
///
/// `Unknown` is a transient default while the front-end is still annotating;
/// every tracked value must be `Borrowed` or `Owned` by the time the pass
/// runs. An `Owned` value carries exactly one reference at its definition
/// site and the function must end up releasing it exactly once; a `Borrowed`
/// value holds no references at its definition site and must not be
/// net-decremented by this function.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefType {
    Unknown,
    Borrowed,
    Owned,
}

#[derive(Clone, Copy, Debug)]
pub struct TrackedRef {
    pub reftype: RefType,
    pub nullable: bool,
}

/// The per-function annotation table the front-end populates and the pass
/// consumes: reference semantics per value, consumed/used reference
/// multisets per instruction, and the set of calls that can raise.
///
/// The per-instruction multisets are plain vectors so that their order is
/// exactly the order the front-end recorded; that order reaches the emitted
/// IR through the exception fixups.
#[derive(Default)]
pub struct RefcountTracker {
    pub(crate) vars: MutMap<ValueId, TrackedRef>,
    pub(crate) refs_consumed: MutMap<ValueId, Vec<ValueId>>,
    pub(crate) refs_used: MutMap<ValueId, Vec<ValueId>>,
    pub(crate) may_throw: MutSet<ValueId>,
}

impl RefcountTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Annotates `v` with its reference semantics. Re-annotating with the
    /// same reftype is fine; a conflicting re-annotation is a bug.
    pub fn set_type(&mut self, func: &Function, v: ValueId, reftype: RefType) -> ValueId {
        if func.is_undef(v) {
            internal_error!("tried to track undef value {:?}", v);
        }

        // Tracked casts must be immediately after the thing they cast.
        // Otherwise there is the opportunity for things to happen between
        // them, which may cause the refcount state to be examined before the
        // set_type() call has been seen.
        if func.is_inst(v) {
            if let Inst::Bitcast { value } = func.inst(v) {
                let uncasted = *value;
                if !func.is_inst(uncasted) {
                    internal_error!("tracked cast {:?} of a non-instruction", v);
                }
                let adjacent = match func.inst(uncasted) {
                    Inst::Invoke { normal_dest, .. } => {
                        first_non_phi(func, *normal_dest) == Some(v)
                    }
                    _ => func.next_inst(uncasted) == Some(v),
                };
                if !adjacent {
                    internal_error!(
                        "refcount-tracked casts must be immediately after the value they cast"
                    );
                }
            }
        }

        let var = self.vars.entry(v).or_insert(TrackedRef {
            reftype: RefType::Unknown,
            nullable: false,
        });

        if var.reftype != reftype && var.reftype != RefType::Unknown {
            internal_error!(
                "value {:?} re-annotated as {:?} but was {:?}",
                v,
                reftype,
                var.reftype
            );
        }
        var.reftype = reftype;

        if func.is_const_null(v) {
            var.nullable = true;
        }

        v
    }

    /// Nullability can be turned on, never off.
    pub fn set_nullable(&mut self, func: &Function, v: ValueId, nullable: bool) -> ValueId {
        if func.is_undef(v) {
            internal_error!("tried to track undef value {:?}", v);
        }

        let var = self.vars.entry(v).or_insert(TrackedRef {
            reftype: RefType::Unknown,
            nullable: false,
        });

        if var.nullable != nullable && var.nullable {
            internal_error!("value {:?} cannot go back to non-nullable", v);
        }
        var.nullable = nullable;
        v
    }

    pub fn is_nullable(&self, v: ValueId) -> bool {
        match self.vars.get(&v) {
            Some(var) => var.nullable,
            None => internal_error!("value {:?} is not refcount-tracked", v),
        }
    }

    /// Records that `inst` steals one incoming reference of `v`.
    pub fn ref_consumed(&mut self, func: &Function, v: ValueId, inst: ValueId) {
        if func.is_undef(v) || func.is_const_null(v) {
            return;
        }

        debug_assert!(self.expect_tracked(v).reftype != RefType::Unknown);
        self.refs_consumed.entry(inst).or_default().push(v);
    }

    /// Records that `inst` relies on `v` staying live across it without
    /// taking ownership.
    pub fn ref_used(&mut self, func: &Function, v: ValueId, inst: ValueId) {
        if func.is_undef(v) || func.is_const_null(v) {
            return;
        }

        debug_assert!(self.expect_tracked(v).reftype != RefType::Unknown);
        self.refs_used.entry(inst).or_default().push(v);
    }

    pub fn set_may_throw(&mut self, inst: ValueId) {
        if !self.may_throw.insert(inst) {
            internal_error!("instruction {:?} registered as may-throw twice", inst);
        }
    }

    pub(crate) fn is_tracked(&self, v: ValueId) -> bool {
        self.vars.contains_key(&v)
    }

    pub(crate) fn expect_tracked(&self, v: ValueId) -> TrackedRef {
        match self.vars.get(&v) {
            Some(var) if var.reftype != RefType::Unknown => *var,
            Some(_) => internal_error!("value {:?} has unknown reftype at analysis time", v),
            None => internal_error!("value {:?} is not refcount-tracked", v),
        }
    }
}

fn first_non_phi(func: &Function, block: pylon_ir::BlockId) -> Option<ValueId> {
    func.block_insts(block)
        .iter()
        .copied()
        .find(|&inst| !func.is_phi(inst))
}
