//! The per-fd state table.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::scheduler::Scheduler;
use crate::task::TaskHandle;

bitflags::bitflags! {
    /// Armed I/O directions for a given fd. The epoll event mask registered for an fd is
    /// the bitwise OR of its armed directions.
    pub struct Direction: u8 {
        const READ  = 0b01;
        const WRITE = 0b10;
    }
}

/// What a parked direction wakes: either the task that parked on it, or a thunk
/// submitted on its behalf.
pub enum Waiter {
    Task(TaskHandle),
    Thunk(Box<dyn FnOnce() + Send>),
}

pub(crate) struct EventSlot {
    pub scheduler: Weak<Scheduler>,
    pub waiter: Waiter,
}

/// Per-descriptor metadata.
pub struct FdCtx {
    pub fd: RawFd,
    pub is_init: AtomicBool,
    pub is_socket: AtomicBool,
    pub user_nonblock: AtomicBool,
    pub sys_nonblock: AtomicBool,
    pub closed: AtomicBool,
    pub recv_timeout_ms: AtomicI64,
    pub send_timeout_ms: AtomicI64,
    pub(crate) read_slot: Mutex<Option<EventSlot>>,
    pub(crate) write_slot: Mutex<Option<EventSlot>>,
    /// Armed directions, mirrored here so the reactor can compute `remaining` without
    /// re-deriving it from the two slots under two locks at once.
    pub(crate) armed: Mutex<Direction>,
}

impl FdCtx {
    fn new(fd: RawFd) -> Self {
        FdCtx {
            fd,
            is_init: AtomicBool::new(false),
            is_socket: AtomicBool::new(false),
            user_nonblock: AtomicBool::new(false),
            sys_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicI64::new(-1),
            send_timeout_ms: AtomicI64::new(-1),
            read_slot: Mutex::new(None),
            write_slot: Mutex::new(None),
            armed: Mutex::new(Direction::empty()),
        }
    }

    pub fn slot(&self, dir: Direction) -> &Mutex<Option<EventSlot>> {
        match dir {
            Direction::READ => &self.read_slot,
            Direction::WRITE => &self.write_slot,
            _ => unreachable!("slot() takes exactly one direction"),
        }
    }
}

/// Growable, indexed table of fd contexts, expanded by 1.5x on demand.
pub struct FdTable {
    slots: RwLock<Vec<Option<Arc<FdCtx>>>>,
}

impl FdTable {
    pub fn new() -> Self {
        FdTable { slots: RwLock::new(Vec::new()) }
    }

    fn ensure_capacity(&self, fd: RawFd) {
        let need = fd as usize + 1;
        {
            let slots = self.slots.read().unwrap();
            if slots.len() >= need {
                return;
            }
        }
        let mut slots = self.slots.write().unwrap();
        if slots.len() < need {
            let new_len = std::cmp::max(need, slots.len() * 3 / 2);
            slots.resize_with(new_len, || None);
        }
    }

    /// Returns the existing context for `fd`, or creates one.
    pub fn get_or_create(&self, fd: RawFd) -> Arc<FdCtx> {
        self.ensure_capacity(fd);
        {
            let slots = self.slots.read().unwrap();
            if let Some(Some(ctx)) = slots.get(fd as usize) {
                return ctx.clone();
            }
        }
        let mut slots = self.slots.write().unwrap();
        if let Some(ctx) = slots[fd as usize].clone() {
            return ctx;
        }
        let ctx = Arc::new(FdCtx::new(fd));
        slots[fd as usize] = Some(ctx.clone());
        ctx
    }

    pub fn get(&self, fd: RawFd) -> Option<Arc<FdCtx>> {
        let slots = self.slots.read().unwrap();
        slots.get(fd as usize).and_then(|s| s.clone())
    }

    /// Removes the context for `fd`. Called from the hooked `close()` path.
    pub fn remove(&self, fd: RawFd) -> Option<Arc<FdCtx>> {
        let mut slots = self.slots.write().unwrap();
        slots.get_mut(fd as usize).and_then(|s| s.take())
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_create_grows_table_and_is_idempotent() {
        let t = FdTable::new();
        let a = t.get_or_create(5);
        let b = t.get_or_create(5);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.fd, 5);
    }

    #[test]
    fn remove_clears_slot() {
        let t = FdTable::new();
        t.get_or_create(3);
        assert!(t.get(3).is_some());
        t.remove(3);
        assert!(t.get(3).is_none());
    }
}
