//! The task primitive: a ucontext-style stackful coroutine.
//!
//! A [`Task`] owns a private stack and a saved machine context (`ucontext_t`). Exactly
//! one thread observes a given task RUNNING at any time. The scheduler holds the owning
//! [`TaskHandle`] while a task sits in the ready queue or is being resumed; the
//! thread-local "current task" slot borrows it for the duration of execution.

use std::cell::{RefCell, UnsafeCell};
use std::mem::MaybeUninit;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crate::config::FIBER_STACK_SIZE;
use crate::rt_assert;

/// A task's lifecycle state.
#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum State {
    Init = 0,
    Ready = 1,
    Running = 2,
    Hold = 3,
    Done = 4,
    Failed = 5,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Init,
            1 => State::Ready,
            2 => State::Running,
            3 => State::Hold,
            4 => State::Done,
            5 => State::Failed,
            _ => unreachable!("invalid task state byte"),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, State::Done | State::Failed)
    }
}

/// Pluggable stack allocator.
pub trait StackAllocator: Send + Sync {
    fn alloc(&self, size: usize) -> *mut u8;
    fn dealloc(&self, ptr: *mut u8, size: usize);
}

/// The default allocator: a plain heap allocation, sized by the `fiber.stack_size`
/// config key.
pub struct MallocStackAllocator;

impl StackAllocator for MallocStackAllocator {
    fn alloc(&self, size: usize) -> *mut u8 {
        let layout = std::alloc::Layout::from_size_align(size, 16).unwrap();
        // SAFETY: layout has non-zero size (callers never request a zero-size stack).
        unsafe { std::alloc::alloc(layout) }
    }

    fn dealloc(&self, ptr: *mut u8, size: usize) {
        let layout = std::alloc::Layout::from_size_align(size, 16).unwrap();
        // SAFETY: `ptr` was returned by `alloc` with the same layout.
        unsafe { std::alloc::dealloc(ptr, layout) }
    }
}

lazy_static::lazy_static! {
    static ref DEFAULT_ALLOCATOR: Arc<dyn StackAllocator> = Arc::new(MallocStackAllocator);
}

struct Stack {
    ptr: *mut u8,
    size: usize,
    allocator: Arc<dyn StackAllocator>,
}

// SAFETY: the buffer is privately owned by exactly one `Task`, which itself asserts
// `Send`/`Sync` below under the single-active-thread invariant.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

impl Drop for Stack {
    fn drop(&mut self) {
        self.allocator.dealloc(self.ptr, self.size);
    }
}

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

type Body = Box<dyn FnOnce() + Send + 'static>;

/// A stackful cooperative task. See the module docs above.
pub struct Task {
    id: u64,
    state: AtomicU8,
    ctx: UnsafeCell<MaybeUninit<libc::ucontext_t>>,
    stack: Option<Stack>,
    body: UnsafeCell<Option<Body>>,
    /// Whether this task swaps back to the creator's bootstrap task (the thread that
    /// embeds the scheduler via `use_caller`) rather than the worker's own dispatch
    /// task. See DESIGN.md for how this differs from an aliased pointer.
    pub runs_on_caller: bool,
    /// The task to swap back into on yield: whichever task most recently called
    /// `resume` on this one. Set fresh on every `resume`, not aliased across calls.
    return_target: UnsafeCell<Option<Arc<Task>>>,
}

// SAFETY: a `Task` is resumed by at most one thread at a time; all interior mutability
// here is only ever touched while RUNNING on that one thread, or before/after a
// `resume`/yield handoff that happens-before the next access.
unsafe impl Send for Task {}
unsafe impl Sync for Task {}

thread_local! {
    static CURRENT: RefCell<Option<Arc<Task>>> = RefCell::new(None);
    static BOOTSTRAP: RefCell<Option<Arc<Task>>> = RefCell::new(None);
}

impl Task {
    /// Allocates a new task. Initial state is `INIT`. `stack_size` of 0 uses the
    /// `fiber.stack_size` config default.
    pub fn create(body: Body, stack_size: usize, runs_on_caller: bool) -> Arc<Task> {
        let stack_size = if stack_size == 0 {
            FIBER_STACK_SIZE.get() as usize
        } else {
            stack_size
        };
        let stack = Stack {
            ptr: DEFAULT_ALLOCATOR.alloc(stack_size),
            size: stack_size,
            allocator: DEFAULT_ALLOCATOR.clone(),
        };
        rt_assert!(!stack.ptr.is_null(), "stack allocation of {} bytes failed", stack_size);

        let id = NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed);
        let task = Arc::new(Task {
            id,
            state: AtomicU8::new(State::Init as u8),
            ctx: UnsafeCell::new(MaybeUninit::zeroed()),
            stack: Some(stack),
            body: UnsafeCell::new(Some(body)),
            runs_on_caller,
            return_target: UnsafeCell::new(None),
        });
        task.prep_context();
        log::trace!("task {} created, runs_on_caller={}", task.id, task.runs_on_caller);
        task
    }

    /// Builds (or, for reset, rebuilds) the ucontext to enter `trampoline` on this
    /// task's own stack.
    fn prep_context(self: &Arc<Self>) {
        let stack = self.stack.as_ref().expect("bootstrap task has no stack to prep");
        unsafe {
            let ctx = self.ctx.get();
            if libc::getcontext(ctx as *mut libc::ucontext_t) != 0 {
                rt_assert!(false, "getcontext failed");
            }
            let ctx_ref = &mut *(ctx as *mut libc::ucontext_t);
            ctx_ref.uc_link = std::ptr::null_mut();
            ctx_ref.uc_stack.ss_sp = stack.ptr as *mut libc::c_void;
            ctx_ref.uc_stack.ss_size = stack.size;
            libc::makecontext(ctx as *mut libc::ucontext_t, trampoline_entry, 0);
        }
    }

    /// Only legal in {INIT, DONE, FAILED}.
    pub fn reset(self: &Arc<Self>, body: Body) {
        let s = self.state();
        rt_assert!(
            matches!(s, State::Init | State::Done | State::Failed),
            "reset() called on task {} in state {:?}",
            self.id,
            s
        );
        unsafe { *self.body.get() = Some(body) };
        self.prep_context();
        self.set_state(State::Init);
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, s: State) {
        self.state.store(s as u8, Ordering::Release);
    }

    fn ctx_ptr(&self) -> *mut libc::ucontext_t {
        self.ctx.get() as *mut libc::ucontext_t
    }

    /// Returns the thread's current task, lazily creating a stackless bootstrap task the
    /// first time it's called on a given thread.
    pub fn current() -> Arc<Task> {
        if let Some(t) = CURRENT.with(|c| c.borrow().clone()) {
            return t;
        }
        let bootstrap = Arc::new(Task {
            id: 0,
            state: AtomicU8::new(State::Running as u8),
            ctx: UnsafeCell::new(MaybeUninit::zeroed()),
            stack: None,
            body: UnsafeCell::new(None),
            runs_on_caller: false,
            return_target: UnsafeCell::new(None),
        });
        CURRENT.with(|c| *c.borrow_mut() = Some(bootstrap.clone()));
        BOOTSTRAP.with(|b| *b.borrow_mut() = Some(bootstrap.clone()));
        bootstrap
    }

    /// Whether this is a thread's bootstrap task (no stack buffer).
    pub fn is_bootstrap(&self) -> bool {
        self.stack.is_none()
    }

    /// Resumes `task`. Must be invoked on a task whose state is not RUNNING. Sets state
    /// RUNNING, installs it as this thread's current task, and swaps the calling context
    /// into it.
    pub fn resume(task: &Arc<Task>) {
        rt_assert!(
            task.state() != State::Running,
            "resume() called on task {} already RUNNING",
            task.id
        );
        let prev = Task::current();
        unsafe {
            *task.return_target.get() = Some(prev.clone());
        }
        task.set_state(State::Running);
        CURRENT.with(|c| *c.borrow_mut() = Some(task.clone()));
        let prev_ctx = prev.ctx_ptr();
        let task_ctx = task.ctx_ptr();
        // SAFETY: `prev` stays alive on this call stack for the duration of the swap
        // (it's a local `Arc` here); `task` stays alive because the caller holds (or
        // transitively owns via the ready queue) a strong reference across this call.
        unsafe {
            if libc::swapcontext(prev_ctx, task_ctx) != 0 {
                rt_assert!(false, "swapcontext (resume) failed");
            }
        }
    }

    fn yield_to(state: State) {
        let cur = Task::current();
        rt_assert!(!cur.is_bootstrap(), "bootstrap task cannot yield");
        let target = unsafe { (*cur.return_target.get()).clone() }
            .expect("task yielded with no return target recorded by resume()");
        cur.set_state(state);
        CURRENT.with(|c| *c.borrow_mut() = Some(target.clone()));
        let cur_ctx = cur.ctx_ptr();
        let target_ctx = target.ctx_ptr();
        // SAFETY: `cur` is kept alive by the scheduler's owning handle across the
        // handoff (see trampoline for the terminal-state exception); `target` is kept
        // alive on the resuming thread's real call stack inside `Task::resume`.
        unsafe {
            if libc::swapcontext(cur_ctx, target_ctx) != 0 {
                rt_assert!(false, "swapcontext (yield) failed");
            }
        }
    }

    /// Yields to HOLD: parked pending I/O or a timer.
    pub fn yield_hold() {
        Task::yield_to(State::Hold);
    }

    /// Yields to READY: cooperatively give up the worker to other ready work.
    pub fn yield_ready() {
        Task::yield_to(State::Ready);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

extern "C" fn trampoline_entry() {
    // The task that `Task::resume` just swapped into is `CURRENT` on this thread.
    let cur = Task::current();
    rt_assert!(!cur.is_bootstrap(), "trampoline entered on a bootstrap task");

    let body = unsafe { (*cur.body.get()).take() };
    let result = catch_unwind(AssertUnwindSafe(|| {
        if let Some(f) = body {
            f();
        }
    }));

    match result {
        Ok(()) => {
            cur.set_state(State::Done);
            log::trace!("task {} finished", cur.id);
        }
        Err(payload) => {
            cur.set_state(State::Failed);
            log::error!("task {} panicked: {}", cur.id, panic_message(&payload));
        }
    }

    // Fetch the return target and the raw pointer to this task *before* dropping our
    // reference, so the final swap never reads freed memory. Whoever still owns a
    // strong reference (typically the scheduler's ready-queue entry, held on the
    // resuming thread's own call stack inside `Task::resume`) keeps the allocation
    // alive until after this swap returns control there and the scheduler drops it.
    let target = unsafe { (*cur.return_target.get()).clone() }
        .expect("trampoline has no return target");
    let raw: *const Task = Arc::as_ptr(&cur);
    drop(cur);

    CURRENT.with(|c| *c.borrow_mut() = Some(target.clone()));
    unsafe {
        let cur_ctx = (*raw).ctx_ptr();
        let target_ctx = target.ctx_ptr();
        if libc::swapcontext(cur_ctx, target_ctx) != 0 {
            rt_assert!(false, "swapcontext (trampoline exit) failed");
        }
    }
    unreachable!("a terminated task must never be resumed again");
}

/// A shared handle to a task. Currently a thin alias; kept as a distinct name in the
/// public API so call sites read as operating on "a task handle" rather than an
/// arbitrary `Arc`.
pub type TaskHandle = Arc<Task>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn simple_resume_and_finish() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let t = Task::create(Box::new(move || ran2.store(true, Ordering::SeqCst)), 64 * 1024, false);
        assert_eq!(t.state(), State::Init);
        Task::resume(&t);
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(t.state(), State::Done);
    }

    #[test]
    fn yield_hold_then_resume_again() {
        let t = Task::create(
            Box::new(|| {
                Task::yield_hold();
            }),
            64 * 1024,
            false,
        );
        Task::resume(&t);
        assert_eq!(t.state(), State::Hold);
        Task::resume(&t);
        assert_eq!(t.state(), State::Done);
    }

    #[test]
    fn panic_in_body_sets_failed() {
        let t = Task::create(Box::new(|| panic!("boom")), 64 * 1024, false);
        Task::resume(&t);
        assert_eq!(t.state(), State::Failed);
    }

    #[test]
    fn reset_allows_reuse_after_done() {
        let counter = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let c1 = counter.clone();
        let t = Task::create(Box::new(move || { c1.fetch_add(1, Ordering::SeqCst); }), 64 * 1024, false);
        Task::resume(&t);
        assert_eq!(t.state(), State::Done);
        let c2 = counter.clone();
        t.reset(Box::new(move || { c2.fetch_add(1, Ordering::SeqCst); }));
        assert_eq!(t.state(), State::Init);
        Task::resume(&t);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
