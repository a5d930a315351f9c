/// `internal_error!` should be used whenever a compiler invariant is broken.
/// It is a wrapper around panic that tells the user to file a bug.
/// This should only be used in cases where there would be a compiler bug and the user can't fix it.
/// If there is simply an unimplemented feature, please use `unimplemented!`
/// If there is a user error, report it through the diagnostics pipeline instead.
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => ({
        eprintln!("An internal compiler expectation was broken.");
        eprintln!("This is definitely a compiler bug.");
        eprintln!("Please file an issue here: https://github.com/pylon-lang/pylon/issues/new/choose");
        #[allow(clippy::panic)] {
            panic!($($arg)*);
        }
    })
}

/// `user_error!` should only ever be used temporarily.
/// It is a way to document locations where we do not yet have nice error reporting.
#[macro_export]
macro_rules! user_error {
    ($($arg:tt)*) => ({
        eprintln!("We ran into an issue while compiling your code.");
        eprintln!("Sadly, we don't have a pretty error message for this case yet.");
        eprintln!($($arg)*);
        std::process::exit(1);
    })
}

/// Assert that a type has the expected size on all targets
#[macro_export]
macro_rules! assert_sizeof_all {
    ($t: ty, $expected_size: expr) => {
        static_assertions::assert_eq_size!($t, [u8; $expected_size]);
    };
}

/// Assert that a type has `Copy`
#[macro_export]
macro_rules! assert_copyable {
    ($t: ty) => {
        static_assertions::assert_impl_all!($t: Copy);
    };
}
