//! The scheduler: a pool of worker threads draining a mutex-protected ready queue, plus
//! the tickle protocol and the `idle()`/`stopping()` hooks a [`Reactor`] overrides.
//!
//! [`Reactor`]: crate::reactor::Reactor

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread::JoinHandle;

use crate::error::SchedulerError;
use crate::reactor::Reactor;
use crate::rt_assert;
use crate::task::{State, Task, TaskHandle};

/// "Any worker" affinity.
pub const ANY_THREAD: i64 = -1;

pub enum ReadyEntry {
    Task(TaskHandle),
    Thunk(Box<dyn FnOnce() + Send + 'static>),
}

struct QueueItem {
    entry: ReadyEntry,
    affinity: i64,
}

thread_local! {
    static WORKER_INDEX: Cell<i64> = Cell::new(-1);
    static IDLE_TASK: RefCell<Option<TaskHandle>> = RefCell::new(None);
    static SHELL_TASK: RefCell<Option<TaskHandle>> = RefCell::new(None);
}

/// The worker-thread pool and ready-queue driver. Optionally paired with a [`Reactor`]
/// via [`Scheduler::attach_reactor`], which then supplies the `idle`/`tickle`/`stopping`
/// overrides.
pub struct Scheduler {
    name: String,
    queue: Mutex<VecDeque<QueueItem>>,
    active: AtomicUsize,
    idle: AtomicUsize,
    stop_flag: AtomicBool,
    auto_stop: AtomicBool,
    use_caller: bool,
    thread_count: usize,
    workers: Mutex<Vec<JoinHandle<()>>>,
    reactor: OnceLock<Arc<Reactor>>,
    self_weak: OnceLock<Weak<Scheduler>>,
    /// Default stack size handed to each lazily-created idle/shell bootstrap task.
    stack_size: AtomicI64,
}

impl Scheduler {
    /// Creates a scheduler with `thread_count` worker threads. If `use_caller` is set,
    /// the thread that calls [`Scheduler::stop`] also runs the dispatch loop until
    /// drained, embedding itself as an extra worker rather than just joining the pool.
    pub fn new(name: impl Into<String>, thread_count: usize, use_caller: bool) -> Arc<Scheduler> {
        let sched = Arc::new(Scheduler {
            name: name.into(),
            queue: Mutex::new(VecDeque::new()),
            active: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            stop_flag: AtomicBool::new(false),
            auto_stop: AtomicBool::new(false),
            use_caller,
            thread_count,
            workers: Mutex::new(Vec::new()),
            reactor: OnceLock::new(),
            self_weak: OnceLock::new(),
            stack_size: AtomicI64::new(0),
        });
        let weak = Arc::downgrade(&sched);
        let _ = sched.self_weak.set(weak);
        sched
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn attach_reactor(&self, reactor: Arc<Reactor>) {
        self.reactor
            .set(reactor)
            .unwrap_or_else(|_| panic!("scheduler {} already has a reactor attached", self.name));
    }

    pub fn reactor(&self) -> Option<&Arc<Reactor>> {
        self.reactor.get()
    }

    fn self_arc(&self) -> Arc<Scheduler> {
        self.self_weak
            .get()
            .expect("self_weak initialized in new()")
            .upgrade()
            .expect("scheduler dropped while a task referencing it is still live")
    }

    /// Appends to the ready queue. Returns whether the queue was previously empty.
    /// Tickles if so.
    pub fn submit(self: &Arc<Self>, entry: ReadyEntry, affinity: i64) -> bool {
        let was_empty = {
            let mut q = self.queue.lock().unwrap();
            let was_empty = q.is_empty();
            q.push_back(QueueItem { entry, affinity });
            was_empty
        };
        if was_empty {
            self.tickle();
        }
        was_empty
    }

    pub fn submit_task(self: &Arc<Self>, task: TaskHandle, affinity: i64) -> bool {
        self.submit(ReadyEntry::Task(task), affinity)
    }

    pub fn submit_thunk(self: &Arc<Self>, f: impl FnOnce() + Send + 'static, affinity: i64) -> bool {
        self.submit(ReadyEntry::Thunk(Box::new(f)), affinity)
    }

    /// Amortizes the queue mutex over multiple entries.
    pub fn submit_batch(self: &Arc<Self>, entries: impl IntoIterator<Item = (ReadyEntry, i64)>) {
        let was_empty = {
            let mut q = self.queue.lock().unwrap();
            let was_empty = q.is_empty();
            for (entry, affinity) in entries {
                q.push_back(QueueItem { entry, affinity });
            }
            was_empty
        };
        if was_empty {
            self.tickle();
        }
    }

    pub fn start(self: &Arc<Self>) -> Result<(), SchedulerError> {
        let mut workers = self.workers.lock().unwrap();
        if !workers.is_empty() {
            return Err(SchedulerError::AlreadyStarted);
        }
        for idx in 0..self.thread_count {
            let sched = self.clone();
            let name = format!("{}-worker-{}", self.name, idx);
            let handle = std::thread::Builder::new()
                .name(name)
                .spawn(move || {
                    WORKER_INDEX.with(|w| w.set(idx as i64));
                    if let Some(r) = sched.reactor.get() {
                        r.install_on_this_thread();
                    }
                    sched.dispatch_loop();
                })
                .map_err(SchedulerError::Spawn)?;
            workers.push(handle);
        }
        log::info!("scheduler {} started with {} workers", self.name, self.thread_count);
        Ok(())
    }

    /// Sets auto-stop, tickles every worker, runs the dispatch loop on the caller if
    /// `use_caller`, then joins all worker threads.
    pub fn stop(self: &Arc<Self>) {
        self.auto_stop.store(true, Ordering::SeqCst);
        self.stop_flag.store(true, Ordering::SeqCst);
        self.tickle();
        if self.use_caller {
            WORKER_INDEX.with(|w| w.set(self.thread_count as i64));
            if let Some(r) = self.reactor.get() {
                r.install_on_this_thread();
            }
            self.dispatch_loop();
        }
        let handles: Vec<_> = { std::mem::take(&mut *self.workers.lock().unwrap()) };
        for h in handles {
            let _ = h.join();
        }
        log::info!("scheduler {} stopped", self.name);
    }

    pub(crate) fn mark_active(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn mark_inactive(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn mark_idle_enter(&self) {
        self.idle.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn mark_idle_exit(&self) {
        self.idle.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn idle_worker_count(&self) -> usize {
        self.idle.load(Ordering::SeqCst)
    }

    fn queue_empty(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }

    /// Base predicate. The reactor, when attached, ANDs in its own conditions and is
    /// authoritative.
    pub fn stopping(&self) -> bool {
        let base = self.auto_stop.load(Ordering::SeqCst)
            && self.stop_flag.load(Ordering::SeqCst)
            && self.queue_empty()
            && self.active.load(Ordering::SeqCst) == 0;
        match self.reactor.get() {
            Some(r) => base && r.stopping_extra(),
            None => base,
        }
    }

    /// Writes one byte to the self-pipe if a reactor is attached and a worker is idle;
    /// a no-op on a plain scheduler.
    pub fn tickle(&self) {
        if let Some(r) = self.reactor.get() {
            r.tickle(self);
        }
    }

    fn default_stack_size(&self) -> usize {
        let v = self.stack_size.load(Ordering::Relaxed);
        if v > 0 {
            v as usize
        } else {
            0 // Task::create() falls back to the fiber.stack_size config default.
        }
    }

    fn idle_task(self: &Arc<Self>) -> TaskHandle {
        if let Some(t) = IDLE_TASK.with(|c| c.borrow().clone()) {
            return t;
        }
        let sched = Arc::downgrade(self);
        let t = Task::create(
            Box::new(move || {
                let sched = sched.upgrade().expect("scheduler dropped with live idle task");
                if let Some(r) = sched.reactor.get().cloned() {
                    r.idle_loop(&sched);
                } else {
                    while !sched.stopping() {
                        Task::yield_hold();
                    }
                }
            }),
            self.default_stack_size(),
            false,
        );
        IDLE_TASK.with(|c| *c.borrow_mut() = Some(t.clone()));
        t
    }

    fn shell_task(self: &Arc<Self>) -> TaskHandle {
        if let Some(t) = SHELL_TASK.with(|c| c.borrow().clone()) {
            return t;
        }
        let t = Task::create(Box::new(|| {}), self.default_stack_size(), false);
        SHELL_TASK.with(|c| *c.borrow_mut() = Some(t.clone()));
        t
    }

    fn this_thread_index(&self) -> i64 {
        WORKER_INDEX.with(|w| w.get())
    }

    /// The per-worker (or embedded-caller) dispatch loop.
    fn dispatch_loop(self: &Arc<Self>) {
        let _ = Task::current(); // ensure this thread's bootstrap task exists
        let my_index = self.this_thread_index();
        loop {
            let mut dequeued = None;
            let mut tickle_me = false;
            {
                let mut q = self.queue.lock().unwrap();
                let mut take_at = None;
                for (i, item) in q.iter().enumerate() {
                    if item.affinity != ANY_THREAD && item.affinity != my_index {
                        tickle_me = true;
                        continue;
                    }
                    if let ReadyEntry::Task(t) = &item.entry {
                        if t.state() == State::Running {
                            continue;
                        }
                    }
                    take_at = Some(i);
                    break;
                }
                if let Some(i) = take_at {
                    dequeued = q.remove(i);
                    if !q.is_empty() {
                        tickle_me = true;
                    }
                }
            }
            if tickle_me {
                self.tickle();
            }

            match dequeued {
                Some(item) => self.run_one(item.entry),
                None => {
                    let idle_task = self.idle_task();
                    self.mark_idle_enter();
                    Task::resume(&idle_task);
                    self.mark_idle_exit();
                    if idle_task.state() == State::Done {
                        break;
                    }
                    if idle_task.state() == State::Failed {
                        rt_assert!(false, "idle task on scheduler {} panicked", self.name);
                    }
                }
            }
        }
    }

    fn run_one(self: &Arc<Self>, entry: ReadyEntry) {
        match entry {
            ReadyEntry::Task(t) => {
                self.mark_active();
                Task::resume(&t);
                self.mark_inactive();
                match t.state() {
                    State::Ready => {
                        self.submit_task(t, ANY_THREAD);
                    }
                    State::Hold => {}
                    State::Done | State::Failed => {}
                    other => rt_assert!(false, "task left in unexpected state {:?} after resume", other),
                }
            }
            ReadyEntry::Thunk(f) => {
                let shell = self.shell_task();
                shell.reset(f);
                self.mark_active();
                Task::resume(&shell);
                self.mark_inactive();
                match shell.state() {
                    State::Ready => {
                        self.submit_task(shell, ANY_THREAD);
                    }
                    State::Hold => {
                        // The thunk parked instead of running to completion (e.g. it called
                        // a blocking hook). It will resume and finish on its own via whatever
                        // woke it, but this thread's cached shell task is now that parked
                        // instance, so drop the cache and let the next thunk get a fresh one.
                        log::warn!("thunk on scheduler {} parked; discarding cached shell task", self.name);
                        SHELL_TASK.with(|c| *c.borrow_mut() = None);
                    }
                    State::Done | State::Failed => {}
                    other => rt_assert!(false, "shell task left in unexpected state {:?}", other),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn tasks_run_fifo_without_affinity() {
        let sched = Scheduler::new("t", 1, false);
        sched.start().unwrap();
        let log = Arc::new(StdMutex::new(Vec::new()));
        for i in 0..5 {
            let log = log.clone();
            sched.submit_thunk(move || log.lock().unwrap().push(i), ANY_THREAD);
        }
        // give the worker time to drain
        std::thread::sleep(std::time::Duration::from_millis(100));
        sched.stop();
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn tickle_fans_out_to_multiple_workers() {
        let sched = Scheduler::new("multi", 4, false);
        sched.start().unwrap();
        let count = Arc::new(AtomicU32::new(0));
        for _ in 0..100 {
            let count = count.clone();
            sched.submit_thunk(move || { count.fetch_add(1, Ordering::SeqCst); }, ANY_THREAD);
        }
        std::thread::sleep(std::time::Duration::from_millis(500));
        sched.stop();
        assert_eq!(count.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn task_yielding_ready_gets_resubmitted() {
        let sched = Scheduler::new("yield", 1, false);
        sched.start().unwrap();
        let done = Arc::new(AtomicBool::new(false));
        let d = done.clone();
        let t = Task::create(
            Box::new(move || {
                Task::yield_ready();
                d.store(true, Ordering::SeqCst);
            }),
            64 * 1024,
            false,
        );
        sched.submit_task(t, ANY_THREAD);
        std::thread::sleep(std::time::Duration::from_millis(100));
        sched.stop();
        assert!(done.load(Ordering::SeqCst));
    }
}
