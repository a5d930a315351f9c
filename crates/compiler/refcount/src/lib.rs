//! Inserts reference count adjustments into generated IR.
//!
//! The front-end annotates each tracked SSA value as owned or borrowed (and
//! nullable or not) and records, per instruction, which incoming references
//! are consumed or merely used; this crate turns those annotations into
//! increfs, decrefs and exception-path cleanups such that every execution
//! path balances exactly and nothing is freed while still live. See
//! [add_refcounts] for the pass itself.
#![warn(clippy::dbg_macro)]

mod block_graph;
mod emit;
mod fixup;
mod insertion;
mod pass;
mod stats;
mod tracker;

pub use emit::{DECREF_PP_ID, DECREF_PP_SIZE, XDECREF_PP_ID, XDECREF_PP_SIZE};
pub use pass::{add_refcounts, ObjectLayout, RefcountState, RuntimeSymbols};
pub use stats::us_compiling_irgen_refcounting;
pub use tracker::{RefType, RefcountTracker, TrackedRef};
