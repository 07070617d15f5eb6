//! A cooperative, stackful-coroutine runtime for Linux.
//!
//! User code runs inside lightweight [`task::Task`]s that look like ordinary blocking
//! code. The [`hook`] module replaces a fixed set of libc I/O entry points so that a
//! blocking call made from inside a task cooperatively suspends instead of blocking the
//! kernel thread, parking the task in the [`reactor::Reactor`] (an epoll instance plus a
//! self-pipe) or the [`timer::TimerSet`] until the fd is ready or the deadline passes.
//! The [`scheduler::Scheduler`] multiplexes any number of tasks over a small pool of
//! worker threads.
//!
//! See `DESIGN.md` in the repository root for module-by-module design notes.

#[macro_use]
extern crate lazy_static;

pub mod assert;
pub mod config;
pub mod error;
pub mod fd_table;
pub mod hook;
pub mod reactor;
pub mod scheduler;
pub mod task;
pub mod timer;

pub use error::{HookError, SchedulerError};
pub use reactor::Reactor;
pub use scheduler::Scheduler;
pub use task::{Task, TaskHandle};
pub use timer::{TimerHandle, TimerSet};

/// Monotonic milliseconds since an arbitrary, process-local epoch.
///
/// All deadlines in [`timer::TimerSet`] are expressed in this clock. It is backed by
/// [`std::time::Instant`] rather than `clock_gettime(CLOCK_MONOTONIC)` directly, which
/// gives the same monotonicity guarantee without an extra libc FFI call on every tick.
pub fn now_ms() -> u64 {
    lazy_static! {
        static ref EPOCH: std::time::Instant = std::time::Instant::now();
    }
    EPOCH.elapsed().as_millis() as u64
}
