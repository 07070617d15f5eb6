//! The reactor / I/O manager: an epoll instance plus a self-pipe, integrated with the
//! timer set and the scheduler's idle loop.

use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::epoll::{epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp};

use crate::fd_table::{Direction, EventSlot, FdCtx, FdTable, Waiter};
use crate::scheduler::{ReadyEntry, Scheduler, ANY_THREAD};
use crate::task::Task;
use crate::timer::TimerSet;

/// Capacity passed to `epoll_wait` per cycle.
const EPOLL_BATCH: usize = 64;
/// Upper bound on the idle loop's wait when no timer is pending.
const MAX_IDLE_MS: u64 = 5000;

thread_local! {
    static CURRENT_REACTOR: RefCell<Option<Weak<Reactor>>> = RefCell::new(None);
}

/// Owns the epoll fd, the self-pipe, and the fd-context table; integrates the timer
/// set; drives the scheduler's idle loop when attached via [`Scheduler::attach_reactor`].
pub struct Reactor {
    epoll_fd: RawFd,
    pipe_r: RawFd,
    pipe_w: RawFd,
    fds: FdTable,
    pending: AtomicUsize,
    timers: TimerSet,
    scheduler: Weak<Scheduler>,
}

// SAFETY: epoll_fd/pipe_r/pipe_w are plain fds guarded by nix syscalls that are
// themselves thread-safe; FdTable/TimerSet have their own internal synchronization.
unsafe impl Send for Reactor {}
unsafe impl Sync for Reactor {}

impl Reactor {
    /// Builds a scheduler and an attached reactor together, since each needs a
    /// reference to the other: the reactor overrides the scheduler's
    /// `idle`/`tickle`/`stopping` behavior once attached.
    pub fn new(scheduler_name: impl Into<String>, thread_count: usize, use_caller: bool) -> (Arc<Scheduler>, Arc<Reactor>) {
        let sched = Scheduler::new(scheduler_name, thread_count, use_caller);

        let epoll_fd = epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC).expect("epoll_create1 failed");
        let (pipe_r, pipe_w) = nix::unistd::pipe().expect("self-pipe creation failed");
        fcntl(pipe_r, FcntlArg::F_SETFL(OFlag::O_NONBLOCK)).expect("set self-pipe read end nonblocking");

        let reactor = Arc::new(Reactor {
            epoll_fd,
            pipe_r,
            pipe_w,
            fds: FdTable::new(),
            pending: AtomicUsize::new(0),
            timers: TimerSet::new(),
            scheduler: Arc::downgrade(&sched),
        });

        // pipe()[0] is the read end, registered in epoll; pipe()[1] is the write end,
        // written by tickle(). The self-pipe's `data` is the sentinel 0, distinguishing
        // it from a real fd context's pointer (never null, since it comes from
        // `Arc::as_ptr` on a live allocation).
        let mut ev = EpollEvent::new(EpollFlags::EPOLLIN | EpollFlags::EPOLLET, 0);
        epoll_ctl(epoll_fd, EpollOp::EpollCtlAdd, pipe_r, Some(&mut ev)).expect("register self-pipe in epoll");

        sched.attach_reactor(reactor.clone());
        (sched, reactor)
    }

    pub fn timers(&self) -> &TimerSet {
        &self.timers
    }

    pub fn fds(&self) -> &FdTable {
        &self.fds
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// The scheduler this reactor is attached to, if it hasn't been dropped. Used by
    /// the syscall shim (C6) to resubmit a task from a timer callback.
    pub(crate) fn scheduler_arc(&self) -> Option<Arc<Scheduler>> {
        self.scheduler.upgrade()
    }

    /// Installs `self` as the reactor the current OS thread's hooked syscalls consult.
    pub fn install_on_this_thread(self: &Arc<Self>) {
        CURRENT_REACTOR.with(|c| *c.borrow_mut() = Some(Arc::downgrade(self)));
    }

    /// The reactor installed on the current thread, if any.
    pub fn current() -> Option<Arc<Reactor>> {
        CURRENT_REACTOR.with(|c| c.borrow().as_ref().and_then(Weak::upgrade))
    }

    fn epoll_flags_for(dir: Direction) -> EpollFlags {
        let mut f = EpollFlags::EPOLLET;
        if dir.contains(Direction::READ) {
            f |= EpollFlags::EPOLLIN;
        }
        if dir.contains(Direction::WRITE) {
            f |= EpollFlags::EPOLLOUT;
        }
        f
    }

    fn direction_for_flags(flags: EpollFlags) -> Direction {
        let mut d = Direction::empty();
        if flags.contains(EpollFlags::EPOLLIN) {
            d |= Direction::READ;
        }
        if flags.contains(EpollFlags::EPOLLOUT) {
            d |= Direction::WRITE;
        }
        d
    }

    /// Registers interest in `dir` on `fd`. `waiter` defaults to the current task when
    /// `None`. Asserts the direction isn't already armed.
    pub fn register(&self, fd: RawFd, dir: Direction, waiter: Option<Waiter>) -> bool {
        let ctx = self.fds.get_or_create(fd);
        let waiter = waiter.unwrap_or_else(|| Waiter::Task(Task::current()));
        {
            let mut slot = ctx.slot(dir).lock().unwrap();
            crate::rt_assert!(slot.is_none(), "direction already armed for fd {}", fd);
            *slot = Some(EventSlot { scheduler: self.scheduler.clone(), waiter });
        }
        let (had_mask, combined) = {
            let mut armed = ctx.armed.lock().unwrap();
            let had_mask = !armed.is_empty();
            *armed |= dir;
            (had_mask, *armed)
        };
        let op = if had_mask { EpollOp::EpollCtlMod } else { EpollOp::EpollCtlAdd };
        let mut ev = EpollEvent::new(Self::epoll_flags_for(combined), Arc::as_ptr(&ctx) as u64);
        match epoll_ctl(self.epoll_fd, op, fd, Some(&mut ev)) {
            Ok(()) => {
                self.pending.fetch_add(1, Ordering::SeqCst);
                true
            }
            Err(e) => {
                log::error!("{}", crate::error::HookError::EpollCtl { fd, source: e });
                *ctx.slot(dir).lock().unwrap() = None;
                ctx.armed.lock().unwrap().remove(dir);
                false
            }
        }
    }

    fn unregister_inner(&self, fd: RawFd, dir: Direction, fire: bool) -> bool {
        let Some(ctx) = self.fds.get(fd) else { return false };
        let taken = ctx.slot(dir).lock().unwrap().take();
        let Some(slot) = taken else { return false };

        let remaining = {
            let mut armed = ctx.armed.lock().unwrap();
            armed.remove(dir);
            *armed
        };
        if remaining.is_empty() {
            let _ = epoll_ctl(self.epoll_fd, EpollOp::EpollCtlDel, fd, None);
        } else {
            let mut ev = EpollEvent::new(Self::epoll_flags_for(remaining), Arc::as_ptr(&ctx) as u64);
            let _ = epoll_ctl(self.epoll_fd, EpollOp::EpollCtlMod, fd, Some(&mut ev));
        }
        self.pending.fetch_sub(1, Ordering::SeqCst);
        if fire {
            self.fire_slot(slot);
        }
        true
    }

    /// Opposite of `register` without firing.
    pub fn unregister(&self, fd: RawFd, dir: Direction) -> bool {
        self.unregister_inner(fd, dir, false)
    }

    /// Unregisters and fires the bound waiter; used when a timeout elapses.
    pub fn cancel(&self, fd: RawFd, dir: Direction) -> bool {
        self.unregister_inner(fd, dir, true)
    }

    /// Removes all epoll interest in `fd` and fires every armed direction; used on
    /// close.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(ctx) = self.fds.get(fd) else { return false };
        let _ = epoll_ctl(self.epoll_fd, EpollOp::EpollCtlDel, fd, None);
        let mut fired_any = false;
        for dir in [Direction::READ, Direction::WRITE] {
            let taken = ctx.slot(dir).lock().unwrap().take();
            if let Some(slot) = taken {
                ctx.armed.lock().unwrap().remove(dir);
                self.pending.fetch_sub(1, Ordering::SeqCst);
                self.fire_slot(slot);
                fired_any = true;
            }
        }
        fired_any
    }

    fn fire_slot(&self, slot: EventSlot) {
        let Some(sched) = slot.scheduler.upgrade() else {
            log::debug!("fd event fired after its scheduler was dropped; discarding");
            return;
        };
        match slot.waiter {
            Waiter::Task(t) => {
                sched.submit(ReadyEntry::Task(t), ANY_THREAD);
            }
            Waiter::Thunk(f) => {
                sched.submit(ReadyEntry::Thunk(f), ANY_THREAD);
            }
        }
    }

    /// Writes one byte to the self-pipe's write end if any worker is currently idle.
    pub fn tickle(&self, sched: &Scheduler) {
        if sched.idle_worker_count() > 0 {
            let buf = [1u8];
            if let Err(e) = nix::unistd::write(self.pipe_w, &buf) {
                if e != nix::Error::EAGAIN {
                    log::warn!("tickle write failed: {}", e);
                }
            }
        }
    }

    fn drain_self_pipe(&self) {
        let mut buf = [0u8; 256];
        loop {
            match nix::unistd::read(self.pipe_r, &mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(nix::Error::EAGAIN) => break,
                Err(nix::Error::EINTR) => continue,
                Err(e) => {
                    log::warn!("self-pipe drain error: {}", e);
                    break;
                }
            }
        }
    }

    /// Authoritative whenever a reactor is attached: ANDs the base predicate with "no
    /// armed registrations, no unexpired timers".
    pub fn stopping_extra(&self) -> bool {
        self.pending.load(Ordering::SeqCst) == 0 && self.timers.is_empty()
    }

    fn handle_event(&self, ev: &EpollEvent) {
        if ev.data() == 0 {
            self.drain_self_pipe();
            return;
        }
        // SAFETY: `data` is the address of an `FdCtx` kept alive by `self.fds` as long
        // as the fd hasn't been closed; close() always calls `cancel_all` (which
        // removes every epoll interest in the fd) before the context is dropped, so a
        // pointer surviving to this point is always still valid.
        let ctx: &FdCtx = unsafe { &*(ev.data() as *const FdCtx) };

        let mut flags = ev.events();
        if flags.intersects(EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP) {
            flags |= EpollFlags::EPOLLIN | EpollFlags::EPOLLOUT;
        }

        let (real, remaining) = {
            let mut armed = ctx.armed.lock().unwrap();
            let real = Self::direction_for_flags(flags) & *armed;
            if real.is_empty() {
                return; // stale event
            }
            *armed -= real;
            (real, *armed)
        };

        for dir in [Direction::READ, Direction::WRITE] {
            if real.contains(dir) {
                if let Some(slot) = ctx.slot(dir).lock().unwrap().take() {
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                    self.fire_slot(slot);
                }
            }
        }

        if remaining.is_empty() {
            let _ = epoll_ctl(self.epoll_fd, EpollOp::EpollCtlDel, ctx.fd, None);
        } else {
            let mut newev = EpollEvent::new(Self::epoll_flags_for(remaining), ev.data());
            let _ = epoll_ctl(self.epoll_fd, EpollOp::EpollCtlMod, ctx.fd, Some(&mut newev));
        }
    }

    fn idle_once(self: &Arc<Self>) {
        let wait_ms = match self.timers.next_timeout_ms() {
            u64::MAX => MAX_IDLE_MS,
            ms => ms.min(MAX_IDLE_MS),
        };
        let mut events = [EpollEvent::empty(); EPOLL_BATCH];
        let n = loop {
            match epoll_wait(self.epoll_fd, &mut events, wait_ms as isize) {
                Ok(n) => break n,
                Err(nix::Error::EINTR) => continue,
                Err(e) => {
                    log::error!("epoll_wait failed: {}", e);
                    break 0;
                }
            }
        };

        self.timers.drain_expired();

        for ev in &events[..n] {
            self.handle_event(ev);
        }
    }

    /// The body run by a worker's idle task when a reactor is attached.
    pub fn idle_loop(self: &Arc<Self>, sched: &Arc<Scheduler>) {
        self.install_on_this_thread();
        while !sched.stopping() {
            self.idle_once();
            // Step 5: let other ready work run before returning to epoll_wait.
            Task::yield_hold();
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        let _ = nix::unistd::close(self.pipe_r);
        let _ = nix::unistd::close(self.pipe_w);
        let _ = nix::unistd::close(self.epoll_fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn register_unregister_leaves_no_pending() {
        let (sched, reactor) = Reactor::new("react-test", 1, false);
        let (r, w) = nix::unistd::pipe().unwrap();
        fcntl(r, FcntlArg::F_SETFL(OFlag::O_NONBLOCK)).unwrap();
        assert!(reactor.register(r, Direction::READ, Some(Waiter::Thunk(Box::new(|| {})))));
        assert_eq!(reactor.pending(), 1);
        assert!(reactor.unregister(r, Direction::READ));
        assert_eq!(reactor.pending(), 0);
        let _ = nix::unistd::close(r);
        let _ = nix::unistd::close(w);
        drop(sched);
    }

    #[test]
    fn cancel_all_wakes_parked_waiter_on_close() {
        let (sched, reactor) = Reactor::new("react-close", 1, false);
        sched.start().unwrap();
        let (r, w) = nix::unistd::pipe().unwrap();
        fcntl(r, FcntlArg::F_SETFL(OFlag::O_NONBLOCK)).unwrap();
        let woke = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let woke2 = woke.clone();
        reactor.register(r, Direction::READ, Some(Waiter::Thunk(Box::new(move || {
            woke2.store(true, std::sync::atomic::Ordering::SeqCst);
        }))));
        assert!(reactor.cancel_all(r));
        std::thread::sleep(Duration::from_millis(200));
        sched.stop();
        assert!(woke.load(std::sync::atomic::Ordering::SeqCst));
        let _ = nix::unistd::close(r);
        let _ = nix::unistd::close(w);
    }
}
