//! Error types at the library boundary.
//!
//! Invariant violations are not represented here; they go through
//! [`crate::assert::rt_assert`] and abort the process after logging. These types cover
//! the failure modes that are meant to be recoverable by a caller: resource exhaustion
//! and misuse of the public API.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HookError {
    #[error("failed to resolve real libc symbol {0:?}")]
    SymbolResolution(&'static str),
    #[error("epoll_ctl failed for fd {fd}: {source}")]
    EpollCtl { fd: i32, source: nix::Error },
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler already started")]
    AlreadyStarted,
    #[error("scheduler not started")]
    NotStarted,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
}
