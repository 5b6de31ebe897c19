//! Stage logging macros
//!
//! Prefix subprocess output with the stage that produced it. Trace-level
//! detail is only emitted in debug builds.

/// Log one line of stage output at debug level
#[macro_export]
macro_rules! stage_line {
    ($stage:expr, $($arg:tt)*) => {
        log::debug!("[{}] {}", $stage, format_args!($($arg)*))
    };
}

/// Stage trace logging - only active in debug builds
#[cfg(debug_assertions)]
#[macro_export]
macro_rules! stage_trace {
    ($stage:expr, $($arg:tt)*) => {
        log::trace!("[{}] {}", $stage, format_args!($($arg)*))
    };
}

/// Stage trace logging - no-op in release builds
#[cfg(not(debug_assertions))]
#[macro_export]
macro_rules! stage_trace {
    ($stage:expr, $($arg:tt)*) => {};
}
