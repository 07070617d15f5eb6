//! Invariant checks and the assertion/backtrace facility.

/// Checks an invariant; on failure, logs the condition, a backtrace, and aborts.
///
/// Invariant violations (a task resumed while already RUNNING, a direction armed twice,
/// and so on) are programming errors, not recoverable conditions: the runtime is not
/// left half-modified because we abort before any caller can observe the broken state.
#[macro_export]
macro_rules! rt_assert {
    ($cond:expr) => {
        if !$cond {
            $crate::assert::fail(stringify!($cond), file!(), line!())
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::assert::fail(&format!($($arg)+), file!(), line!())
        }
    };
}

#[doc(hidden)]
#[cold]
pub fn fail(msg: &str, file: &str, line: u32) -> ! {
    let bt = backtrace::Backtrace::new();
    log::error!("invariant violation at {}:{}: {}\n{:?}", file, line, msg, bt);
    std::process::abort();
}
