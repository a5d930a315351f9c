//! Flags for debugging the pylon compiler.
//!
//! Lists environment variable flags that can be enabled for verbose debugging features in debug
//! builds of the compiler.
//!
//! For example, I might define the following alias to run cargo with the IR printed before and
//! after refcount insertion:
//!
//! ```bash
//! alias cargo="\
//!    PYLON_PRINT_IR_BEFORE_REFCOUNT=1 \
//!     PYLON_PRINT_IR_AFTER_REFCOUNT=1 \
//!   cargo"
//! ```
//!
//! Now you can turn debug flags on and off as you like.

#[macro_export]
macro_rules! dbg_set {
    ($flag:path) => {{
        #[cfg(not(debug_assertions))]
        {
            false
        }
        #[cfg(debug_assertions)]
        {
            let flag = std::env::var($flag);
            flag.is_ok() && flag.as_deref() != Ok("0")
        }
    }};
}

#[macro_export]
macro_rules! dbg_do {
    ($flag:path, $expr:expr) => {
        #[cfg(debug_assertions)]
        {
            if $crate::dbg_set!($flag) {
                $expr
            }
        }
    };
}

macro_rules! flags {
    ($($(#[doc = $doc:expr])+ $flag:ident)*) => {$(
        $(#[doc = $doc])+
        pub static $flag: &str = stringify!($flag);
    )*};
}

flags! {
    // ===Irgen===

    /// Prints the IR of a function before refcount insertion runs on it.
    PYLON_PRINT_IR_BEFORE_REFCOUNT

    /// Prints the IR of a function after refcount insertion ran on it.
    PYLON_PRINT_IR_AFTER_REFCOUNT

    /// Prints per-block progress of the refcount fixpoint.
    /// Only use this in single-threaded mode!
    PYLON_PRINT_REFCOUNT_PROGRESS
}
