//! Crate-internal logging macros.
//!
//! With the `tracing` feature every macro records an event under the `ledger_scanner` target.
//! Without it the macros expand to a borrow of each field value and nothing else, so call sites
//! are identical in both builds.
//!
//! Call sites use explicit `name = value` fields (optionally `%`/`?` formatted) followed by a
//! literal message.

#[cfg(feature = "tracing")]
#[allow(unused_macros)]
macro_rules! log_at {
    ($level:ident, $($arg:tt)+) => {
        tracing::event!(target: "ledger_scanner", tracing::Level::$level, $($arg)+)
    };
}

#[cfg(not(feature = "tracing"))]
#[allow(unused_macros)]
macro_rules! log_at {
    ($level:ident, $($arg:tt)+) => {
        discard_fields!($($arg)+)
    };
}

#[cfg(not(feature = "tracing"))]
#[allow(unused_macros)]
macro_rules! discard_fields {
    () => { () };
    ($message:literal $(, $($rest:tt)*)?) => {
        discard_fields!($($($rest)*)?)
    };
    ($field:ident = % $value:expr $(, $($rest:tt)*)?) => {{
        let _ = &$value;
        discard_fields!($($($rest)*)?);
    }};
    ($field:ident = ? $value:expr $(, $($rest:tt)*)?) => {{
        let _ = &$value;
        discard_fields!($($($rest)*)?);
    }};
    ($field:ident = $value:expr $(, $($rest:tt)*)?) => {{
        let _ = &$value;
        discard_fields!($($($rest)*)?);
    }};
}

#[allow(unused_macros)]
macro_rules! error {
    ($($arg:tt)+) => { log_at!(ERROR, $($arg)+) };
}

#[allow(unused_macros)]
macro_rules! warn {
    ($($arg:tt)+) => { log_at!(WARN, $($arg)+) };
}

#[allow(unused_macros)]
macro_rules! info {
    ($($arg:tt)+) => { log_at!(INFO, $($arg)+) };
}

#[allow(unused_macros)]
macro_rules! debug {
    ($($arg:tt)+) => { log_at!(DEBUG, $($arg)+) };
}

#[allow(unused_macros)]
macro_rules! trace {
    ($($arg:tt)+) => { log_at!(TRACE, $($arg)+) };
}
