//! The epoll reactor: readiness notification, timers and the scheduler's
//! blocking phase, composed into one object.
//!
//! The reactor owns an epoll instance, a self-pipe and a table of
//! [`FdEvent`] slots (at most one read waker and one write waker per fd).
//! Idle workers park inside [`Reactor::wait`], which blocks on
//! `epoll_wait` with a timeout merged from the next timer deadline and a
//! 3 s cap; [`Reactor::remind`] unblocks a parked wait by writing one byte
//! into the self-pipe. Readiness and expired timers both turn into
//! ordinary scheduled tasks, timers first.

use crate::coroutine::Coroutine;
use crate::error::Error;
use crate::scheduler::{worker_loop, Affinity, Scheduler, Task, TimeoutMode};
use crate::timer::{now_ms, Timer, TimerCore, TimerManager, NO_DEADLINE};
use rustc_hash::FxHashMap;
use std::any::Any;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Readiness direction of an event registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    fn bits(self) -> u32 {
        match self {
            Direction::Read => libc::EPOLLIN as u32,
            Direction::Write => libc::EPOLLOUT as u32,
        }
    }
}

/// Per-fd waker slots. One entry per fd, created lazily, removed only at
/// reactor teardown.
#[derive(Debug)]
struct FdEvent {
    state: Mutex<FdEventState>,
}

#[derive(Debug, Default)]
struct FdEventState {
    mask: u32,
    read: Option<Arc<Coroutine>>,
    write: Option<Arc<Coroutine>>,
}

impl FdEventState {
    fn slot(&mut self, dir: Direction) -> &mut Option<Arc<Coroutine>> {
        match dir {
            Direction::Read => &mut self.read,
            Direction::Write => &mut self.write,
        }
    }
}

const EP_MAX_TIMEOUT_MS: u64 = 3000;
const EP_MAX_EVENTS: usize = 1024;

/// Default task timeout for reactors.
pub const DEFAULT_TASK_TIMEOUT_MS: u64 = 3000;

/// A multi-threaded cooperative scheduler bound to an epoll reactor and a
/// timer manager.
pub struct Reactor {
    sched: Scheduler,
    timers: TimerManager,
    running: AtomicBool,
    epoll_fd: AtomicI32,
    pipe_r: AtomicI32,
    pipe_w: AtomicI32,
    fd_events: Mutex<FxHashMap<RawFd, Arc<FdEvent>>>,
    event_count: AtomicU32,
}

impl Reactor {
    /// Creates a reactor with the default timeout mode (`Trigger`) and
    /// task timeout. A `thread_count` of 0 means one worker per CPU.
    pub fn new(name: &str, thread_count: u32) -> Arc<Self> {
        Self::with_options(name, thread_count, TimeoutMode::Trigger, DEFAULT_TASK_TIMEOUT_MS)
    }

    /// Creates a reactor with explicit dispatch parameters.
    pub fn with_options(
        name: &str,
        thread_count: u32,
        mode: TimeoutMode,
        task_timeout_ms: u64,
    ) -> Arc<Self> {
        let thread_count = if thread_count == 0 {
            num_cpus::get() as u32
        } else {
            thread_count
        };
        Arc::new(Self {
            sched: Scheduler::new(name, thread_count, mode, task_timeout_ms),
            timers: TimerManager::new(),
            running: AtomicBool::new(false),
            epoll_fd: AtomicI32::new(-1),
            pipe_r: AtomicI32::new(-1),
            pipe_w: AtomicI32::new(-1),
            fd_events: Mutex::new(FxHashMap::default()),
            event_count: AtomicU32::new(0),
        })
    }

    pub fn name(&self) -> &str {
        self.sched.name()
    }

    pub fn task_count(&self) -> u32 {
        self.sched.task_count()
    }

    pub fn waiting_thread_count(&self) -> u32 {
        self.sched.waiting_thread_count()
    }

    pub fn task_timeout_ms(&self) -> u64 {
        self.sched.timeout_ms()
    }

    pub fn set_timeout_mode(&self, mode: TimeoutMode) {
        self.sched.set_mode(mode);
    }

    pub fn event_count(&self) -> u32 {
        self.event_count.load(Ordering::Acquire)
    }

    pub fn timer_count(&self) -> u32 {
        self.timers.count()
    }

    pub(crate) fn sched(&self) -> &Scheduler {
        &self.sched
    }

    /// Creates the epoll instance and the self-pipe, then spawns the
    /// worker pool. Idempotent. Readiness facility failures are fatal.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }

        // Safety: epoll_create1 has no preconditions.
        let epoll_fd = unsafe { libc::epoll_create1(0) };
        assert!(epoll_fd >= 0, "epoll_create1 failed: {}", io::Error::last_os_error());
        self.epoll_fd.store(epoll_fd, Ordering::Release);

        let mut pipe_fds = [0 as libc::c_int; 2];
        // Safety: the array has room for both pipe ends.
        let rt = unsafe { libc::pipe(pipe_fds.as_mut_ptr()) };
        assert!(rt == 0, "pipe failed: {}", io::Error::last_os_error());
        for fd in pipe_fds {
            set_nonblocking(fd);
        }
        self.pipe_r.store(pipe_fds[0], Ordering::Release);
        self.pipe_w.store(pipe_fds[1], Ordering::Release);

        // The self-pipe is registered directly, without a waker slot: the
        // wait loop drains it in place.
        assert!(
            self.epoll_ctl(
                libc::EPOLL_CTL_ADD,
                pipe_fds[0],
                libc::EPOLLIN as u32 | libc::EPOLLET as u32,
            ),
            "could not register self-pipe"
        );

        if self.sched.mark_started() {
            for index in 0..self.sched.thread_count() {
                let name = format!("{}_th_{}", self.sched.name(), index);
                let reactor = self.clone();
                let handle = std::thread::Builder::new()
                    .name(name)
                    .spawn(move || worker_loop(reactor))
                    .expect("could not create worker thread");
                self.sched.add_worker_handle(handle);
            }
        }
        tracing::debug!(target: "system", name = self.name(), "reactor started");
    }

    /// Re-schedules every pending waker, clears all timers, stops and
    /// joins the workers, then closes the readiness handles. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(target: "system", name = self.name(), "reactor stopping");

        self.trigger_all();
        self.timers.clear();

        self.sched.request_stop();
        while self.sched.waiting_thread_count() > 0 {
            self.remind();
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        self.sched.join_workers();

        for fd in [
            self.epoll_fd.swap(-1, Ordering::AcqRel),
            self.pipe_r.swap(-1, Ordering::AcqRel),
            self.pipe_w.swap(-1, Ordering::AcqRel),
        ] {
            if fd >= 0 {
                // Safety: closing an fd we own.
                unsafe { libc::close(fd) };
            }
        }
        self.fd_events.lock().expect("fd table poisoned").clear();
    }

    /// Everything the worker loop keeps running for.
    pub(crate) fn has_work(&self) -> bool {
        !self.sched.is_stopped()
            || self.sched.task_count() > 0
            || self.timers.count() > 0
            || self.event_count() > 0
    }

    // ---- scheduling -----------------------------------------------------

    /// Wraps `func` into a coroutine and enqueues it with `Any` affinity.
    pub fn schedule(&self, func: impl FnMut() + Send + 'static) -> Result<(), Error> {
        let co = Coroutine::new(func)?;
        self.schedule_coroutine(co);
        Ok(())
    }

    /// Enqueues a coroutine with `Any` affinity.
    pub fn schedule_coroutine(&self, co: Arc<Coroutine>) {
        self.enqueue(Task::new(co, Affinity::Any));
    }

    /// Wraps `func` into a coroutine and enqueues it with an affinity.
    pub fn schedule_with(
        &self,
        affinity: Affinity,
        func: impl FnMut() + Send + 'static,
    ) -> Result<(), Error> {
        let co = Coroutine::new(func)?;
        self.schedule_coroutine_with(affinity, co);
        Ok(())
    }

    /// Enqueues a coroutine with an affinity.
    pub fn schedule_coroutine_with(&self, affinity: Affinity, co: Arc<Coroutine>) {
        self.enqueue(Task::new(co, affinity));
    }

    /// Bulk insert; the pool is reminded once if the queue was empty.
    pub fn batch_schedule(&self, cos: impl IntoIterator<Item = Arc<Coroutine>>) {
        let tasks = cos.into_iter().map(|co| Task::new(co, Affinity::Any));
        if self.sched.enqueue_batch(tasks) {
            self.remind();
        }
    }

    pub(crate) fn enqueue(&self, task: Task) {
        if self.sched.enqueue(task) {
            self.remind();
        }
    }

    /// Re-enqueues a held task, preserving its affinity.
    pub(crate) fn requeue(&self, task: Task) {
        self.enqueue(task);
    }

    /// Enqueues a stolen task under a new affinity (shim wake path).
    pub(crate) fn schedule_task(&self, mut task: Task, affinity: Affinity) {
        task.affinity = affinity;
        self.enqueue(task);
    }

    // ---- timers ---------------------------------------------------------

    /// Arms a timer due in `interval_ms`; `periodic` timers re-arm
    /// themselves on every firing.
    pub fn add_timer(
        self: &Arc<Self>,
        interval_ms: u64,
        func: impl Fn() + Send + Sync + 'static,
        periodic: bool,
    ) -> Timer {
        let (core, became_front) = self.timers.add(interval_ms, Arc::new(func), None, periodic);
        if became_front {
            self.remind();
        }
        Timer {
            reactor: Arc::downgrade(self),
            core,
        }
    }

    /// Like [`Reactor::add_timer`], but the callback only runs while
    /// `cond` can still be upgraded.
    pub fn add_conditional_timer(
        self: &Arc<Self>,
        interval_ms: u64,
        func: impl Fn() + Send + Sync + 'static,
        cond: Weak<dyn Any + Send + Sync>,
        periodic: bool,
    ) -> Timer {
        let (core, became_front) = self
            .timers
            .add(interval_ms, Arc::new(func), Some(cond), periodic);
        if became_front {
            self.remind();
        }
        Timer {
            reactor: Arc::downgrade(self),
            core,
        }
    }

    pub(crate) fn cancel_timer(&self, core: &Arc<TimerCore>) {
        self.timers.cancel(core);
    }

    pub(crate) fn refresh_timer(&self, core: &Arc<TimerCore>) -> bool {
        let (found, became_front) = self.timers.refresh(core);
        if became_front {
            self.remind();
        }
        found
    }

    // ---- fd events ------------------------------------------------------

    /// Arms a waker callback for one direction of `fd`. The callback is
    /// wrapped into a coroutine and scheduled as a task when the event
    /// triggers. Returns `false` if the direction is already armed or the
    /// registration fails.
    pub fn add_event(
        &self,
        fd: RawFd,
        dir: Direction,
        func: impl FnMut() + Send + 'static,
    ) -> bool {
        match Coroutine::new(func) {
            Ok(co) => self.add_event_coroutine(fd, dir, co),
            Err(error) => {
                tracing::error!(target: "system", fd, %error, "could not create waker coroutine");
                false
            }
        }
    }

    /// Arms an existing coroutine as the waker for one direction of `fd`.
    pub fn add_event_coroutine(&self, fd: RawFd, dir: Direction, co: Arc<Coroutine>) -> bool {
        if fd < 0 {
            return false;
        }
        let event = self.fd_event(fd);
        let mut state = event.state.lock().expect("fd event poisoned");

        if state.mask & dir.bits() != 0 {
            tracing::debug!(target: "system", fd, ?dir, "direction already armed");
            return false;
        }

        let new_mask = state.mask | dir.bits();
        let op = if state.mask == 0 {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        if !self.epoll_ctl(op, fd, new_mask | libc::EPOLLET as u32) {
            tracing::debug!(target: "system", fd, ?dir, "epoll_ctl failed on add");
            return false;
        }

        state.mask = new_mask;
        *state.slot(dir) = Some(co);
        self.event_count.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Disarms one direction of `fd`, dropping the waker.
    pub fn del_event(&self, fd: RawFd, dir: Direction) -> bool {
        self.remove_event(fd, dir, false)
    }

    /// Disarms one direction of `fd` and schedules its waker as a task.
    pub fn trigger_event(&self, fd: RawFd, dir: Direction) -> bool {
        self.remove_event(fd, dir, true)
    }

    fn remove_event(&self, fd: RawFd, dir: Direction, schedule: bool) -> bool {
        if fd < 0 {
            return false;
        }
        let event = self.fd_event(fd);
        let mut state = event.state.lock().expect("fd event poisoned");

        if state.mask & dir.bits() == 0 {
            tracing::debug!(target: "system", fd, ?dir, "direction not armed");
            return false;
        }

        let new_mask = state.mask & !dir.bits();
        let op = if new_mask == 0 {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        if !self.epoll_ctl(op, fd, new_mask | libc::EPOLLET as u32) {
            // A closed fd is deregistered by the kernel already; the waker
            // must still be released so its coroutine can observe EBADF.
            tracing::debug!(target: "system", fd, ?dir, "epoll_ctl failed on remove");
        }

        state.mask = new_mask;
        let waker = state.slot(dir).take();
        if schedule {
            if let Some(co) = waker {
                self.schedule_coroutine(co);
            }
        }
        self.event_count.fetch_sub(1, Ordering::AcqRel);
        true
    }

    /// Disarms both directions of `fd`, scheduling any pending wakers.
    pub fn trigger_all_fd(&self, fd: RawFd) {
        self.remove_all_fd(fd, true);
    }

    /// Disarms both directions of `fd`, dropping any pending wakers.
    pub fn del_all_fd(&self, fd: RawFd) {
        self.remove_all_fd(fd, false);
    }

    fn remove_all_fd(&self, fd: RawFd, schedule: bool) {
        if fd < 0 {
            return;
        }
        let event = self.fd_event(fd);
        let mut state = event.state.lock().expect("fd event poisoned");
        if state.mask == 0 {
            return;
        }
        if !self.epoll_ctl(libc::EPOLL_CTL_DEL, fd, 0) {
            tracing::debug!(target: "system", fd, mask = state.mask, "epoll_ctl failed on removal of fd");
        }

        for dir in [Direction::Read, Direction::Write] {
            if state.mask & dir.bits() == 0 {
                continue;
            }
            let waker = state.slot(dir).take();
            if schedule {
                if let Some(co) = waker {
                    self.schedule_coroutine(co);
                }
            }
            self.event_count.fetch_sub(1, Ordering::AcqRel);
        }
        state.mask = 0;
    }

    /// Triggers every registered event (used at teardown so that every
    /// suspended waiter gets one final wake).
    pub fn trigger_all(&self) {
        for fd in self.registered_fds() {
            self.trigger_all_fd(fd);
        }
    }

    /// Drops every registered event.
    pub fn del_all(&self) {
        for fd in self.registered_fds() {
            self.del_all_fd(fd);
        }
    }

    fn registered_fds(&self) -> Vec<RawFd> {
        let table = self.fd_events.lock().expect("fd table poisoned");
        table.keys().copied().collect()
    }

    fn fd_event(&self, fd: RawFd) -> Arc<FdEvent> {
        let mut table = self.fd_events.lock().expect("fd table poisoned");
        table
            .entry(fd)
            .or_insert_with(|| {
                Arc::new(FdEvent {
                    state: Mutex::new(FdEventState::default()),
                })
            })
            .clone()
    }

    fn epoll_ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> bool {
        let epoll_fd = self.epoll_fd.load(Ordering::Acquire);
        if epoll_fd < 0 {
            return false;
        }
        let mut event = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let event_ptr = if op == libc::EPOLL_CTL_DEL {
            std::ptr::null_mut()
        } else {
            &mut event
        };
        // Safety: `event` outlives the call; a null pointer is allowed for
        // EPOLL_CTL_DEL.
        unsafe { libc::epoll_ctl(epoll_fd, op, fd, event_ptr) == 0 }
    }

    // ---- wait / remind --------------------------------------------------

    /// One blocking wait cycle: sleep in `epoll_wait` until readiness, the
    /// next timer deadline or a remind, then turn expired timers and ready
    /// events into tasks. Runs inside each worker's wait coroutine.
    pub(crate) fn wait(&self) {
        let epoll_fd = self.epoll_fd.load(Ordering::Acquire);
        if epoll_fd < 0 {
            return;
        }

        let mut events: Vec<libc::epoll_event> = Vec::with_capacity(EP_MAX_EVENTS);
        let ready = loop {
            let next = self.timers.next_deadline_ms();
            let now = now_ms();
            let timeout = if next == NO_DEADLINE {
                EP_MAX_TIMEOUT_MS
            } else if next > now + EP_MAX_TIMEOUT_MS {
                EP_MAX_TIMEOUT_MS
            } else {
                next.saturating_sub(now)
            };

            // Safety: the buffer has capacity for EP_MAX_EVENTS entries.
            let rt = unsafe {
                libc::epoll_wait(
                    epoll_fd,
                    events.as_mut_ptr(),
                    EP_MAX_EVENTS as libc::c_int,
                    timeout as libc::c_int,
                )
            };
            if rt >= 0 {
                // Safety: the kernel initialized `rt` entries.
                unsafe { events.set_len(rt as usize) };
                break rt as usize;
            }
            let error = io::Error::last_os_error();
            if error.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            tracing::error!(target: "system", %error, "epoll_wait failed");
            std::process::abort();
        };

        // Timers become tasks before I/O events.
        let (expired, became_front) = self.timers.drain_expired(now_ms());
        if became_front {
            self.remind();
        }
        for core in expired {
            let runner = move || core.fire();
            if let Err(error) = self.schedule(runner) {
                tracing::error!(target: "system", %error, "could not schedule timer callback");
            }
        }

        let pipe_r = self.pipe_r.load(Ordering::Acquire);
        for index in 0..ready {
            let event = events[index];
            let fd = event.u64 as RawFd;
            if fd == pipe_r {
                self.drain_pipe(pipe_r);
                continue;
            }
            if event.events & libc::EPOLLIN as u32 != 0 {
                self.trigger_event(fd, Direction::Read);
            }
            if event.events & libc::EPOLLOUT as u32 != 0 {
                self.trigger_event(fd, Direction::Write);
            }
        }
    }

    /// Wakes one parked wait by writing a byte into the self-pipe. No-op
    /// while no worker is waiting.
    pub(crate) fn remind(&self) {
        if self.sched.waiting_thread_count() == 0 {
            return;
        }
        let fd = self.pipe_w.load(Ordering::Acquire);
        if fd < 0 {
            return;
        }
        // Safety: writing one byte from a live buffer into an owned fd.
        let rt = unsafe { libc::write(fd, b"T".as_ptr().cast(), 1) };
        if rt == -1 && io::Error::last_os_error().raw_os_error() == Some(libc::EAGAIN) {
            // The pipe is full, so a wake-up is already pending.
            return;
        }
        assert_eq!(rt, 1, "self-pipe write failed: {}", io::Error::last_os_error());
    }

    fn drain_pipe(&self, fd: RawFd) {
        let mut buffer = [0u8; 256];
        // Safety: reading into a live buffer from the owned nonblocking
        // pipe end.
        while unsafe { libc::read(fd, buffer.as_mut_ptr().cast(), buffer.len()) } > 0 {}
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("name", &self.name())
            .field("task_count", &self.task_count())
            .field("timer_count", &self.timer_count())
            .field("event_count", &self.event_count())
            .field("waiting_threads", &self.waiting_thread_count())
            .finish_non_exhaustive()
    }
}

fn set_nonblocking(fd: RawFd) {
    // Safety: fcntl on an owned fd.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        assert!(flags != -1, "fcntl(F_GETFL) failed");
        let rt = libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        assert!(rt != -1, "fcntl(F_SETFL) failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_event_rejects_bad_fd_and_duplicates() {
        let reactor = Reactor::new("ev", 1);
        reactor.start();

        assert!(!reactor.add_event(-1, Direction::Read, || {}));
        assert_eq!(reactor.event_count(), 0);

        let mut pipe_fds = [0 as libc::c_int; 2];
        // Safety: the array has room for both ends.
        assert_eq!(unsafe { libc::pipe(pipe_fds.as_mut_ptr()) }, 0);
        let [read_fd, write_fd] = pipe_fds;

        assert!(reactor.add_event(read_fd, Direction::Read, || {}));
        assert!(!reactor.add_event(read_fd, Direction::Read, || {}), "duplicate direction");
        assert_eq!(reactor.event_count(), 1);

        assert!(reactor.del_event(read_fd, Direction::Read));
        assert!(!reactor.del_event(read_fd, Direction::Read), "already disarmed");
        assert_eq!(reactor.event_count(), 0);

        reactor.stop();
        // Safety: closing fds we created above.
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn trigger_all_is_idempotent() {
        let reactor = Reactor::new("trig", 1);
        reactor.start();

        let mut pipe_fds = [0 as libc::c_int; 2];
        // Safety: the array has room for both ends.
        assert_eq!(unsafe { libc::pipe(pipe_fds.as_mut_ptr()) }, 0);
        let [read_fd, write_fd] = pipe_fds;

        assert!(reactor.add_event(read_fd, Direction::Read, || {}));
        reactor.trigger_all_fd(read_fd);
        assert_eq!(reactor.event_count(), 0);
        // Second trigger finds nothing armed.
        reactor.trigger_all_fd(read_fd);
        assert_eq!(reactor.event_count(), 0);

        reactor.stop();
        // Safety: closing fds we created above.
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }
}
