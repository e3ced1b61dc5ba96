//! Fatal-error reporting.
//!
//! Conditions the allocator cannot recover from (double release, guard band
//! corruption, deleting a sub-pool that still lends blocks, ...) are logged at
//! ERROR level and then panic. Release builds compile with `panic = "abort"`,
//! so a fatal error terminates the process.

/// Log `msg` at ERROR level and panic with the same message.
macro_rules! fatal {
    ($($arg:tt)+) => {{
        let message = ::std::format!($($arg)+);
        ::tracing::error!(target: "nebula_mempool::fatal", "{message}");
        ::std::panic!("{message}")
    }};
}

/// `fatal!` when `cond` holds.
macro_rules! fatal_if {
    ($cond:expr, $($arg:tt)+) => {
        if $cond {
            $crate::macros::fatal!($($arg)+);
        }
    };
}

pub(crate) use {fatal, fatal_if};
