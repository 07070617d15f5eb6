//! The syscall shim: intercepts a fixed set of blocking libc entry points and converts
//! their EAGAIN paths into reactor-mediated cooperative suspension.
//!
//! Each hooked symbol here is `#[no_mangle] extern "C"`, matching the libc ABI it
//! shadows, so that `LD_PRELOAD`-ing this crate's cdylib (or simply linking a binary
//! against it ahead of libc) redirects ordinary blocking calls through the runtime.
//! `fcntl`/`ioctl` are declared with a single fixed-width trailing argument rather than
//! as C variadics, which Rust cannot express directly; this covers every command this
//! shim cares about (`F_GETFL`/`F_SETFL`, `FIONBIO`) and forwards anything else through
//! unchanged.

use std::cell::Cell;
use std::ffi::c_void;
use std::os::raw::{c_int, c_uint};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use libc::{size_t, sockaddr, socklen_t, ssize_t};

use crate::config::TCP_CONNECT_TIMEOUT_MS;
use crate::error::HookError;
use crate::fd_table::{Direction, FdCtx};
use crate::reactor::Reactor;
use crate::scheduler::ANY_THREAD;
use crate::task::Task;

thread_local! {
    static HOOK_ENABLED: Cell<bool> = Cell::new(true);
}

/// Turns the shim off (or back on) for the calling thread. With it off, every hooked
/// call below is behaviorally identical to the underlying libc function.
pub fn set_hook_enable(enabled: bool) {
    HOOK_ENABLED.with(|h| h.set(enabled));
}

pub fn hook_enabled() -> bool {
    HOOK_ENABLED.with(|h| h.get())
}

fn errno() -> c_int {
    unsafe { *libc::__errno_location() }
}

fn set_errno(e: c_int) {
    unsafe { *libc::__errno_location() = e };
}

struct RealFns {
    sleep: unsafe extern "C" fn(c_uint) -> c_uint,
    usleep: unsafe extern "C" fn(libc::useconds_t) -> c_int,
    nanosleep: unsafe extern "C" fn(*const libc::timespec, *mut libc::timespec) -> c_int,
    socket: unsafe extern "C" fn(c_int, c_int, c_int) -> c_int,
    accept: unsafe extern "C" fn(c_int, *mut sockaddr, *mut socklen_t) -> c_int,
    connect: unsafe extern "C" fn(c_int, *const sockaddr, socklen_t) -> c_int,
    read: unsafe extern "C" fn(c_int, *mut c_void, size_t) -> ssize_t,
    readv: unsafe extern "C" fn(c_int, *const libc::iovec, c_int) -> ssize_t,
    recv: unsafe extern "C" fn(c_int, *mut c_void, size_t, c_int) -> ssize_t,
    recvfrom: unsafe extern "C" fn(c_int, *mut c_void, size_t, c_int, *mut sockaddr, *mut socklen_t) -> ssize_t,
    recvmsg: unsafe extern "C" fn(c_int, *mut libc::msghdr, c_int) -> ssize_t,
    write: unsafe extern "C" fn(c_int, *const c_void, size_t) -> ssize_t,
    writev: unsafe extern "C" fn(c_int, *const libc::iovec, c_int) -> ssize_t,
    send: unsafe extern "C" fn(c_int, *const c_void, size_t, c_int) -> ssize_t,
    sendto: unsafe extern "C" fn(c_int, *const c_void, size_t, c_int, *const sockaddr, socklen_t) -> ssize_t,
    sendmsg: unsafe extern "C" fn(c_int, *const libc::msghdr, c_int) -> ssize_t,
    close: unsafe extern "C" fn(c_int) -> c_int,
    fcntl: unsafe extern "C" fn(c_int, c_int, usize) -> c_int,
    ioctl: unsafe extern "C" fn(c_int, libc::c_ulong, usize) -> c_int,
    getsockopt: unsafe extern "C" fn(c_int, c_int, c_int, *mut c_void, *mut socklen_t) -> c_int,
    setsockopt: unsafe extern "C" fn(c_int, c_int, c_int, *const c_void, socklen_t) -> c_int,
}

fn resolve_one(name: &'static str) -> Result<*mut c_void, HookError> {
    let mut cname = String::with_capacity(name.len() + 1);
    cname.push_str(name);
    cname.push('\0');
    // SAFETY: `cname` is NUL-terminated and outlives the call.
    let ptr = unsafe { libc::dlsym(libc::RTLD_NEXT, cname.as_ptr() as *const libc::c_char) };
    if ptr.is_null() {
        Err(HookError::SymbolResolution(name))
    } else {
        Ok(ptr)
    }
}

macro_rules! sym {
    ($name:literal) => {
        // SAFETY: the resolved symbol is the real libc function of the same name,
        // which shares the declared field's signature by construction.
        unsafe { std::mem::transmute(resolve_one($name)?) }
    };
}

impl RealFns {
    fn resolve() -> Result<RealFns, HookError> {
        Ok(RealFns {
            sleep: sym!("sleep"),
            usleep: sym!("usleep"),
            nanosleep: sym!("nanosleep"),
            socket: sym!("socket"),
            accept: sym!("accept"),
            connect: sym!("connect"),
            read: sym!("read"),
            readv: sym!("readv"),
            recv: sym!("recv"),
            recvfrom: sym!("recvfrom"),
            recvmsg: sym!("recvmsg"),
            write: sym!("write"),
            writev: sym!("writev"),
            send: sym!("send"),
            sendto: sym!("sendto"),
            sendmsg: sym!("sendmsg"),
            close: sym!("close"),
            fcntl: sym!("fcntl"),
            ioctl: sym!("ioctl"),
            getsockopt: sym!("getsockopt"),
            setsockopt: sym!("setsockopt"),
        })
    }
}

static REAL: OnceLock<RealFns> = OnceLock::new();

fn real() -> &'static RealFns {
    REAL.get_or_init(|| {
        RealFns::resolve().unwrap_or_else(|e| crate::assert::fail(&e.to_string(), file!(), line!()))
    })
}

/// Eagerly resolves every real symbol this shim needs, returning an error instead of
/// aborting on failure. Hooked calls resolve lazily (and abort on failure) regardless;
/// this exists for callers that want to fail the program's startup gracefully instead.
pub fn init() -> Result<(), HookError> {
    let fns = RealFns::resolve()?;
    let _ = REAL.set(fns);
    Ok(())
}

/// Pass-through test: hook disabled, no fd context, closed, not a socket, or the user
/// already set O_NONBLOCK all fall through to the real call unmodified. A thread with no
/// reactor installed (e.g. one never added to a scheduler) always passes through too,
/// since there is nothing to park it on.
fn shimmed(fd: RawFd) -> Option<(Arc<Reactor>, Arc<FdCtx>)> {
    if !hook_enabled() {
        return None;
    }
    let reactor = Reactor::current()?;
    let ctx = reactor.fds().get(fd)?;
    if ctx.closed.load(Ordering::SeqCst) {
        return None;
    }
    if !ctx.is_socket.load(Ordering::SeqCst) {
        return None;
    }
    if ctx.user_nonblock.load(Ordering::SeqCst) {
        return None;
    }
    Some((reactor, ctx))
}

/// Witness record for a single parked call's conditional timeout timer: a small heap
/// record exclusive to this call, used so the timer can tell whether it actually fired
/// (the call woke up on I/O readiness instead) without touching a freed call frame.
struct TInfo {
    cancelled: AtomicBool,
}

/// Registers interest in `dir` on `fd`, arms a conditional timeout if `timeout_ms >=
/// 0`, and yields HOLD. On resume, cancels the timer; if it had already fired, sets
/// `ETIMEDOUT` and returns `Err(())`.
fn park_for_io(reactor: &Arc<Reactor>, fd: RawFd, dir: Direction, timeout_ms: i64) -> Result<(), ()> {
    let timer = if timeout_ms >= 0 {
        let tinfo = Arc::new(TInfo { cancelled: AtomicBool::new(false) });
        let witness = Arc::downgrade(&tinfo);
        let tinfo_cb = tinfo.clone();
        let reactor_cb = reactor.clone();
        let handle = reactor
            .timers()
            .add_conditional(timeout_ms as u64, move || {
                tinfo_cb.cancelled.store(true, Ordering::SeqCst);
                reactor_cb.cancel(fd, dir);
            }, witness, false);
        Some((handle, tinfo))
    } else {
        None
    };

    reactor.register(fd, dir, None);
    Task::yield_hold();

    if let Some((handle, tinfo)) = timer {
        reactor.timers().cancel(handle);
        if tinfo.cancelled.load(Ordering::SeqCst) {
            set_errno(libc::ETIMEDOUT);
            return Err(());
        }
    }
    Ok(())
}

/// Core retry idiom shared by every byte-moving call.
fn do_io(fd: RawFd, dir: Direction, mut attempt: impl FnMut() -> ssize_t) -> ssize_t {
    let Some((reactor, ctx)) = shimmed(fd) else {
        return attempt();
    };
    let timeout_ms = match dir {
        Direction::READ => ctx.recv_timeout_ms.load(Ordering::SeqCst),
        _ => ctx.send_timeout_ms.load(Ordering::SeqCst),
    };
    loop {
        let rc = loop {
            let r = attempt();
            if r == -1 && errno() == libc::EINTR {
                continue;
            }
            break r;
        };
        if rc != -1 {
            return rc;
        }
        let e = errno();
        if e != libc::EAGAIN && e != libc::EWOULDBLOCK {
            return rc;
        }
        if park_for_io(&reactor, fd, dir, timeout_ms).is_err() {
            return -1;
        }
    }
}

fn sleep_ms(ms: u64) {
    let Some(reactor) = Reactor::current() else {
        // No reactor on this thread: no way to cooperate, so behave like the real
        // libc call by blocking the OS thread outright.
        std::thread::sleep(std::time::Duration::from_millis(ms));
        return;
    };
    let task = Task::current();
    let sched = reactor.scheduler_arc();
    reactor.timers().add(
        ms,
        move || {
            if let Some(s) = sched.clone() {
                s.submit_task(task.clone(), ANY_THREAD);
            }
        },
        false,
    );
    Task::yield_hold();
}

fn init_fd_context(fd: RawFd) {
    let Some(reactor) = Reactor::current() else { return };
    let ctx = reactor.fds().get_or_create(fd);
    if ctx.is_init.swap(true, Ordering::SeqCst) {
        return;
    }
    let is_socket = unsafe {
        let mut st: libc::stat = std::mem::zeroed();
        libc::fstat(fd, &mut st) == 0 && (st.st_mode & libc::S_IFMT) == libc::S_IFSOCK
    };
    ctx.is_socket.store(is_socket, Ordering::SeqCst);
    if is_socket {
        unsafe {
            let flags = (real().fcntl)(fd, libc::F_GETFL, 0);
            if flags != -1 {
                let _ = (real().fcntl)(fd, libc::F_SETFL, (flags | libc::O_NONBLOCK) as usize);
            }
        }
        ctx.sys_nonblock.store(true, Ordering::SeqCst);
    }
}

#[no_mangle]
pub unsafe extern "C" fn sleep(seconds: c_uint) -> c_uint {
    if !hook_enabled() || Reactor::current().is_none() {
        return (real().sleep)(seconds);
    }
    sleep_ms(seconds as u64 * 1000);
    0
}

#[no_mangle]
pub unsafe extern "C" fn usleep(useconds: libc::useconds_t) -> c_int {
    if !hook_enabled() || Reactor::current().is_none() {
        return (real().usleep)(useconds);
    }
    sleep_ms(useconds as u64 / 1000);
    0
}

#[no_mangle]
pub unsafe extern "C" fn nanosleep(req: *const libc::timespec, rem: *mut libc::timespec) -> c_int {
    if !hook_enabled() || Reactor::current().is_none() || req.is_null() {
        return (real().nanosleep)(req, rem);
    }
    let req = unsafe { &*req };
    let ms = req.tv_sec as u64 * 1000 + req.tv_nsec as u64 / 1_000_000;
    sleep_ms(ms);
    0
}

#[no_mangle]
pub unsafe extern "C" fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    let fd = (real().socket)(domain, ty, protocol);
    if fd != -1 && hook_enabled() {
        init_fd_context(fd);
    }
    fd
}

#[no_mangle]
pub unsafe extern "C" fn accept(fd: c_int, addr: *mut sockaddr, addrlen: *mut socklen_t) -> c_int {
    let Some((reactor, ctx)) = shimmed(fd) else {
        let rc = (real().accept)(fd, addr, addrlen);
        if rc != -1 && hook_enabled() {
            init_fd_context(rc);
        }
        return rc;
    };
    let timeout_ms = ctx.recv_timeout_ms.load(Ordering::SeqCst);
    loop {
        let rc = loop {
            let r = (real().accept)(fd, addr, addrlen);
            if r == -1 && errno() == libc::EINTR {
                continue;
            }
            break r;
        };
        if rc != -1 {
            init_fd_context(rc);
            return rc;
        }
        let e = errno();
        if e != libc::EAGAIN && e != libc::EWOULDBLOCK {
            return rc;
        }
        if park_for_io(&reactor, fd, Direction::READ, timeout_ms).is_err() {
            return -1;
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn connect(fd: c_int, addr: *const sockaddr, len: socklen_t) -> c_int {
    let Some((reactor, _ctx)) = shimmed(fd) else {
        return (real().connect)(fd, addr, len);
    };
    let rc = (real().connect)(fd, addr, len);
    if rc == 0 || errno() != libc::EINPROGRESS {
        return rc;
    }
    let timeout_ms = TCP_CONNECT_TIMEOUT_MS.get() as i64;
    if park_for_io(&reactor, fd, Direction::WRITE, timeout_ms).is_err() {
        return -1;
    }
    let mut err: c_int = 0;
    let mut len2 = std::mem::size_of::<c_int>() as socklen_t;
    unsafe {
        (real().getsockopt)(fd, libc::SOL_SOCKET, libc::SO_ERROR, &mut err as *mut c_int as *mut c_void, &mut len2);
    }
    if err != 0 {
        set_errno(err);
        return -1;
    }
    0
}

#[no_mangle]
pub unsafe extern "C" fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    do_io(fd, Direction::READ, || unsafe { (real().read)(fd, buf, count) })
}

#[no_mangle]
pub unsafe extern "C" fn readv(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, Direction::READ, || unsafe { (real().readv)(fd, iov, iovcnt) })
}

#[no_mangle]
pub unsafe extern "C" fn recv(fd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(fd, Direction::READ, || unsafe { (real().recv)(fd, buf, len, flags) })
}

#[no_mangle]
pub unsafe extern "C" fn recvfrom(
    fd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    src_addr: *mut sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    do_io(fd, Direction::READ, || unsafe { (real().recvfrom)(fd, buf, len, flags, src_addr, addrlen) })
}

#[no_mangle]
pub unsafe extern "C" fn recvmsg(fd: c_int, msg: *mut libc::msghdr, flags: c_int) -> ssize_t {
    do_io(fd, Direction::READ, || unsafe { (real().recvmsg)(fd, msg, flags) })
}

#[no_mangle]
pub unsafe extern "C" fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    do_io(fd, Direction::WRITE, || unsafe { (real().write)(fd, buf, count) })
}

#[no_mangle]
pub unsafe extern "C" fn writev(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, Direction::WRITE, || unsafe { (real().writev)(fd, iov, iovcnt) })
}

#[no_mangle]
pub unsafe extern "C" fn send(fd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(fd, Direction::WRITE, || unsafe { (real().send)(fd, buf, len, flags) })
}

#[no_mangle]
pub unsafe extern "C" fn sendto(
    fd: c_int,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
    dst_addr: *const sockaddr,
    addrlen: socklen_t,
) -> ssize_t {
    do_io(fd, Direction::WRITE, || unsafe { (real().sendto)(fd, buf, len, flags, dst_addr, addrlen) })
}

#[no_mangle]
pub unsafe extern "C" fn sendmsg(fd: c_int, msg: *const libc::msghdr, flags: c_int) -> ssize_t {
    do_io(fd, Direction::WRITE, || unsafe { (real().sendmsg)(fd, msg, flags) })
}

#[no_mangle]
pub unsafe extern "C" fn close(fd: c_int) -> c_int {
    if hook_enabled() {
        if let Some(reactor) = Reactor::current() {
            if let Some(ctx) = reactor.fds().get(fd) {
                ctx.closed.store(true, Ordering::SeqCst);
                reactor.cancel_all(fd);
                reactor.fds().remove(fd);
            }
        }
    }
    (real().close)(fd)
}

#[no_mangle]
pub unsafe extern "C" fn fcntl(fd: c_int, cmd: c_int, arg: usize) -> c_int {
    if !hook_enabled() {
        return (real().fcntl)(fd, cmd, arg);
    }
    let Some(reactor) = Reactor::current() else {
        return (real().fcntl)(fd, cmd, arg);
    };
    let Some(ctx) = reactor.fds().get(fd) else {
        return (real().fcntl)(fd, cmd, arg);
    };
    if !ctx.is_socket.load(Ordering::SeqCst) {
        return (real().fcntl)(fd, cmd, arg);
    }
    match cmd {
        libc::F_SETFL => {
            let wants_nonblock = (arg as c_int & libc::O_NONBLOCK) != 0;
            ctx.user_nonblock.store(wants_nonblock, Ordering::SeqCst);
            let forced = (arg as c_int) | libc::O_NONBLOCK;
            (real().fcntl)(fd, libc::F_SETFL, forced as usize)
        }
        libc::F_GETFL => {
            let real_flags = (real().fcntl)(fd, libc::F_GETFL, 0);
            if real_flags == -1 {
                return -1;
            }
            if ctx.user_nonblock.load(Ordering::SeqCst) {
                real_flags | libc::O_NONBLOCK
            } else {
                real_flags & !libc::O_NONBLOCK
            }
        }
        _ => (real().fcntl)(fd, cmd, arg),
    }
}

#[no_mangle]
pub unsafe extern "C" fn ioctl(fd: c_int, request: libc::c_ulong, arg: usize) -> c_int {
    if hook_enabled() && request == libc::FIONBIO as libc::c_ulong {
        if let Some(reactor) = Reactor::current() {
            if let Some(ctx) = reactor.fds().get(fd) {
                if ctx.is_socket.load(Ordering::SeqCst) {
                    let wants_nonblock = unsafe { *(arg as *const c_int) != 0 };
                    ctx.user_nonblock.store(wants_nonblock, Ordering::SeqCst);
                    let mut forced: c_int = 1;
                    return (real().ioctl)(fd, request, &mut forced as *mut c_int as usize);
                }
            }
        }
    }
    (real().ioctl)(fd, request, arg)
}

#[no_mangle]
pub unsafe extern "C" fn getsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *mut c_void,
    optlen: *mut socklen_t,
) -> c_int {
    if hook_enabled() && level == libc::SOL_SOCKET && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO) {
        if let Some(reactor) = Reactor::current() {
            if let Some(ctx) = reactor.fds().get(fd) {
                let ms = if optname == libc::SO_RCVTIMEO {
                    ctx.recv_timeout_ms.load(Ordering::SeqCst)
                } else {
                    ctx.send_timeout_ms.load(Ordering::SeqCst)
                };
                let ms = ms.max(0);
                unsafe {
                    let tv = &mut *(optval as *mut libc::timeval);
                    tv.tv_sec = (ms / 1000) as libc::time_t;
                    tv.tv_usec = ((ms % 1000) * 1000) as libc::suseconds_t;
                    *optlen = std::mem::size_of::<libc::timeval>() as socklen_t;
                }
                return 0;
            }
        }
    }
    (real().getsockopt)(fd, level, optname, optval, optlen)
}

#[no_mangle]
pub unsafe extern "C" fn setsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: socklen_t,
) -> c_int {
    if hook_enabled() && level == libc::SOL_SOCKET && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO) {
        if let Some(reactor) = Reactor::current() {
            init_fd_context(fd);
            let ctx = reactor.fds().get_or_create(fd);
            let tv = unsafe { &*(optval as *const libc::timeval) };
            let ms = tv.tv_sec as i64 * 1000 + tv.tv_usec as i64 / 1000;
            let ms = if ms == 0 { -1 } else { ms };
            if optname == libc::SO_RCVTIMEO {
                ctx.recv_timeout_ms.store(ms, Ordering::SeqCst);
            } else {
                ctx.send_timeout_ms.store(ms, Ordering::SeqCst);
            }
            return 0;
        }
    }
    (real().setsockopt)(fd, level, optname, optval, optlen)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_enable_toggle_is_per_thread() {
        assert!(hook_enabled());
        set_hook_enable(false);
        assert!(!hook_enabled());
        set_hook_enable(true);
    }

    #[test]
    fn shimmed_is_none_without_an_installed_reactor() {
        // No scheduler/reactor has been created on this test thread.
        assert!(shimmed(0).is_none());
    }
}
