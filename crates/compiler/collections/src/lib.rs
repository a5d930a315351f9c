#![warn(clippy::dbg_macro)]

mod all;
mod vec_map;
mod vec_set;

pub use all::{default_hasher, BuildHasher, MutMap, MutSet};
pub use vec_map::VecMap;
pub use vec_set::VecSet;
