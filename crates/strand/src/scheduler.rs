//! Cooperative task scheduling over a fixed worker pool.
//!
//! A [`Task`] wraps a coroutine together with a dispatch affinity and an
//! absolute deadline. Workers scan the shared FIFO front to back and take
//! the first task that either matches their affinity or whose deadline has
//! passed; an expired task loses its affinity so that a pinned task can
//! never deadlock the pool. When a worker finds nothing to run it parks in
//! the reactor's blocking `wait` phase through a per-worker wait
//! coroutine.
//!
//! The queue discipline, the `DISCARD`/`TRIGGER` timeout modes and the
//! remind threshold mirror the worker loop described in the scheduler
//! contract; dispatch order is FIFO per thread, unordered across threads.

use crate::coroutine::{self, CoState, Coroutine};
use crate::hook;
use crate::reactor::Reactor;
use crate::timer::now_ms;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Queue length (per active worker) beyond which idle workers are pulled
/// out of the wait phase. Tunable.
pub const SCHEDULER_REMIND_THRESHOLD: usize = 50;

/// Dispatch preference of a task. Advisory: any worker may take a task
/// whose deadline has passed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Affinity {
    /// Any worker.
    Any,
    /// The worker thread with this name.
    Name(String),
    /// The worker thread with this kernel thread id.
    Tid(libc::pid_t),
}

impl Affinity {
    fn matches(&self, thread_name: &str, tid: libc::pid_t) -> bool {
        match self {
            Affinity::Any => true,
            Affinity::Name(name) => name == thread_name,
            Affinity::Tid(t) => *t == tid,
        }
    }
}

/// What happens to a task whose deadline passed before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutMode {
    /// Drop it without running.
    Discard = 0,
    /// Run it anyway (on whichever worker got to it).
    Trigger = 1,
}

/// A scheduled unit: one coroutine plus dispatch metadata.
#[derive(Debug)]
pub(crate) struct Task {
    pub co: Arc<Coroutine>,
    pub affinity: Affinity,
    /// Absolute deadline in ms; stamped on every (re-)enqueue.
    pub deadline_ms: u64,
}

impl Task {
    pub fn new(co: Arc<Coroutine>, affinity: Affinity) -> Self {
        Self {
            co,
            affinity,
            deadline_ms: 0,
        }
    }
}

/// Shared scheduler state: the task FIFO, the worker pool bookkeeping and
/// the dispatch parameters.
#[derive(Debug)]
pub(crate) struct Scheduler {
    name: String,
    stop: AtomicBool,
    timeout_ms: AtomicU64,
    mode: AtomicU8,
    thread_count: u32,
    task_count: AtomicU32,
    waiting_threads: AtomicU32,
    queue: Mutex<VecDeque<Task>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(name: &str, thread_count: u32, mode: TimeoutMode, timeout_ms: u64) -> Self {
        Self {
            name: name.chars().take(10).collect(),
            stop: AtomicBool::new(true),
            timeout_ms: AtomicU64::new(timeout_ms),
            mode: AtomicU8::new(mode as u8),
            thread_count,
            task_count: AtomicU32::new(0),
            waiting_threads: AtomicU32::new(0),
            queue: Mutex::new(VecDeque::new()),
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn thread_count(&self) -> u32 {
        self.thread_count
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms.load(Ordering::Relaxed)
    }

    pub fn mode(&self) -> TimeoutMode {
        if self.mode.load(Ordering::Relaxed) == TimeoutMode::Discard as u8 {
            TimeoutMode::Discard
        } else {
            TimeoutMode::Trigger
        }
    }

    pub fn set_mode(&self, mode: TimeoutMode) {
        self.mode.store(mode as u8, Ordering::Relaxed);
    }

    pub fn task_count(&self) -> u32 {
        self.task_count.load(Ordering::Acquire)
    }

    pub fn waiting_thread_count(&self) -> u32 {
        self.waiting_threads.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Marks the pool as started. Returns `false` if it already was.
    pub fn mark_started(&self) -> bool {
        self.stop.swap(false, Ordering::AcqRel)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn add_worker_handle(&self, handle: JoinHandle<()>) {
        self.threads.lock().expect("worker list poisoned").push(handle);
    }

    pub fn join_workers(&self) {
        let handles = std::mem::take(&mut *self.threads.lock().expect("worker list poisoned"));
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Stamps the task's deadline and appends it to the FIFO. Returns
    /// whether the queue was empty (the caller must then `remind`).
    pub fn enqueue(&self, mut task: Task) -> bool {
        task.deadline_ms = now_ms() + self.timeout_ms();
        let mut queue = self.queue.lock().expect("task queue poisoned");
        let need_remind = queue.is_empty();
        queue.push_back(task);
        self.task_count.fetch_add(1, Ordering::AcqRel);
        need_remind
    }

    /// Bulk insert under one lock. Returns whether the queue was empty.
    pub fn enqueue_batch(&self, tasks: impl IntoIterator<Item = Task>) -> bool {
        let deadline = now_ms() + self.timeout_ms();
        let mut queue = self.queue.lock().expect("task queue poisoned");
        let need_remind = queue.is_empty();
        for mut task in tasks {
            task.deadline_ms = deadline;
            queue.push_back(task);
            self.task_count.fetch_add(1, Ordering::AcqRel);
        }
        need_remind
    }
}

struct WorkerTls {
    reactor: Arc<Reactor>,
    current: Option<Task>,
}

thread_local! {
    static WORKER: RefCell<Option<WorkerTls>> = const { RefCell::new(None) };
}

/// The reactor driving the calling worker thread, if any.
pub fn current_reactor() -> Option<Arc<Reactor>> {
    WORKER.with(|w| w.borrow().as_ref().map(|tls| tls.reactor.clone()))
}

/// Name of the scheduler driving the calling thread.
pub fn current_scheduler_name() -> Option<String> {
    current_reactor().map(|r| r.name().to_string())
}

/// Task timeout of the scheduler driving the calling thread.
pub fn current_scheduler_timeout() -> Option<u64> {
    current_reactor().map(|r| r.task_timeout_ms())
}

/// Moves the current task out of the worker slot. After this the worker
/// will not re-enqueue the coroutine when it yields; whoever took the task
/// is responsible for scheduling it again.
pub(crate) fn take_current_task() -> Option<Task> {
    WORKER.with(|w| w.borrow_mut().as_mut().and_then(|tls| tls.current.take()))
}

/// Puts a stolen task back (used when arming a waker failed).
pub(crate) fn put_current_task(task: Task) {
    WORKER.with(|w| {
        if let Some(tls) = w.borrow_mut().as_mut() {
            tls.current = Some(task);
        }
    });
}

/// Rewrites the current task's affinity and yields. On re-dispatch only a
/// matching worker will pick the task up, unless its deadline passes
/// first. Panics when called outside of a scheduled task.
pub fn reschedule_current(affinity: Affinity) {
    let rewritten = WORKER.with(|w| {
        let mut w = w.borrow_mut();
        match w.as_mut().and_then(|tls| tls.current.as_mut()) {
            Some(task) => {
                task.affinity = affinity;
                true
            }
            None => false,
        }
    });
    assert!(rewritten, "reschedule_current called outside of a scheduled task");
    coroutine::yield_now();
}

/// Kernel thread id of the calling thread.
pub(crate) fn os_tid() -> libc::pid_t {
    thread_local! {
        static TID: Cell<libc::pid_t> = const { Cell::new(0) };
    }
    TID.with(|cache| {
        let tid = cache.get();
        if tid != 0 {
            return tid;
        }
        // Safety: gettid has no preconditions.
        let tid = unsafe { libc::syscall(libc::SYS_gettid) } as libc::pid_t;
        cache.set(tid);
        tid
    })
}

/// Body of one worker thread.
pub(crate) fn worker_loop(reactor: Arc<Reactor>) {
    WORKER.with(|w| {
        *w.borrow_mut() = Some(WorkerTls {
            reactor: reactor.clone(),
            current: None,
        });
    });
    hook::set_async(true);

    let thread_name = std::thread::current().name().unwrap_or_default().to_string();
    let tid = os_tid();
    tracing::debug!(target: "system", thread = %thread_name, tid, "worker started");

    let wait_co = {
        let reactor = reactor.clone();
        Coroutine::new(move || reactor.wait()).expect("could not create wait coroutine")
    };

    let sched = reactor.sched();
    while reactor.has_work() {
        let mut taken: Option<Task> = None;
        {
            let mut queue = sched.queue.lock().expect("task queue poisoned");
            if !queue.is_empty() {
                let waiting = sched.waiting_thread_count();
                let active = sched.thread_count.saturating_sub(waiting) as usize;
                if queue.len() >= active * SCHEDULER_REMIND_THRESHOLD {
                    reactor.remind();
                }

                let now = now_ms();
                for index in 0..queue.len() {
                    let task = &queue[index];
                    if task.deadline_ms < now || task.affinity.matches(&thread_name, tid) {
                        taken = queue.remove(index);
                        break;
                    }
                    // A pinned task is waiting for some other worker; each
                    // remind wakes at most one parked wait.
                    reactor.remind();
                }
            }
        }

        match taken {
            Some(task) => {
                if task.deadline_ms < now_ms() && sched.mode() == TimeoutMode::Discard {
                    tracing::debug!(target: "system", cid = task.co.cid(), "discarding expired task");
                    sched.task_count.fetch_sub(1, Ordering::AcqRel);
                    continue;
                }

                let co = task.co.clone();
                WORKER.with(|w| {
                    w.borrow_mut().as_mut().expect("worker context missing").current = Some(task);
                });
                co.resume();
                // The shim may have moved the task into a waker; only
                // re-enqueue what is still ours.
                if let Some(task) = take_current_task() {
                    if co.state() == CoState::Hold {
                        reactor.requeue(task);
                    }
                }
                sched.task_count.fetch_sub(1, Ordering::AcqRel);
            }
            None => {
                sched.waiting_threads.fetch_add(1, Ordering::AcqRel);
                wait_co.resume();
                sched.waiting_threads.fetch_sub(1, Ordering::AcqRel);
                wait_co.reset(None);
            }
        }
    }

    tracing::debug!(target: "system", thread = %thread_name, tid, "worker exiting");
    WORKER.with(|w| *w.borrow_mut() = None);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn affinity_matching() {
        assert!(Affinity::Any.matches("x_th_0", 1));
        assert!(Affinity::Name("x_th_0".into()).matches("x_th_0", 1));
        assert!(!Affinity::Name("x_th_1".into()).matches("x_th_0", 1));
        assert!(Affinity::Tid(7).matches("whatever", 7));
        assert!(!Affinity::Tid(7).matches("whatever", 8));
    }

    #[test]
    fn enqueue_stamps_deadline_and_reports_empty_queue() {
        let sched = Scheduler::new("test", 1, TimeoutMode::Trigger, 1000);
        let co = Coroutine::new(|| {}).unwrap();

        let before = now_ms();
        assert!(sched.enqueue(Task::new(co.clone(), Affinity::Any)));
        assert!(!sched.enqueue(Task::new(co, Affinity::Any)));
        assert_eq!(sched.task_count(), 2);

        let queue = sched.queue.lock().unwrap();
        for task in queue.iter() {
            assert!(task.deadline_ms >= before + 1000);
        }
    }

    #[test]
    fn name_is_truncated() {
        let sched = Scheduler::new("a_very_long_scheduler_name", 1, TimeoutMode::Trigger, 1000);
        assert_eq!(sched.name(), "a_very_lon");
    }

    #[test]
    fn os_tid_is_stable() {
        assert_eq!(os_tid(), os_tid());
        assert!(os_tid() > 0);
    }
}
