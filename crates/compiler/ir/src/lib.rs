//! Pylon's SSA intermediate representation.
//!
//! A function is a graph of basic blocks holding instructions; instructions
//! are values, and so are parameters, globals and constants. Everything is
//! addressed by small copyable ids so passes can keep flat side tables
//! indexed by block or value number instead of holding references into the
//! graph while they mutate it.
#![warn(clippy::dbg_macro)]

mod builder;
mod fmt;
mod func;
mod types;
mod validate;

pub use builder::FuncBuilder;
pub use func::{BlockData, Function, Inst, ValueData};
pub use types::{TypeData, TypeStore};
pub use validate::validate;

use pylon_error_macros::{assert_copyable, assert_sizeof_all};

/// Identifies a value in a [Function]: an instruction result, parameter,
/// global, or constant.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub(crate) u32);

/// Identifies a basic block in a [Function].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub(crate) u32);

/// Identifies an interned type in a [TypeStore].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub(crate) u32);

assert_sizeof_all!(ValueId, 4);
assert_sizeof_all!(BlockId, 4);
assert_copyable!(TypeId);

impl ValueId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Debug for ValueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl std::fmt::Debug for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "b{}", self.0)
    }
}

impl std::fmt::Debug for TypeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}", self.0)
    }
}
