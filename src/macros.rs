/// Logs a fatal runtime violation and aborts the current operation by panicking.
///
/// Corrupted headers and broken layout contracts are not recoverable, so they
/// never surface as error values.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        let message = format!($($arg)*);
        tracing::error!(target: "bespoke", "{}", message);
        panic!("{}", message)
    }};
}

/// Like `assert!`, but routed through [`fatal!`] and active in every build.
macro_rules! always_assert {
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            fatal!($($arg)*);
        }
    };
}
