//! Stackful coroutines with explicit symmetric context switches.
//!
//! A [`Coroutine`] owns a guarded stack and a saved machine context. The
//! thread that resumes it becomes its *primary*: the primary's own context
//! is saved into a thread-local slot for the duration of the resume, and
//! [`yield_now`] switches back through that slot. A coroutine therefore
//! runs on exactly one thread at a time but may migrate between resumes.
//!
//! State machine: `Init -resume-> Exec -yield-> Hold -resume-> Exec
//! -return-> Term`, with `Except` as the terminal state of a panicking
//! body. `Term`/`Init` coroutines can be [`reset`](Coroutine::reset) to
//! reuse their stack.

use crate::config::{self, Config};
use crate::error::Error;
use std::cell::RefCell;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

/// Execution state of a coroutine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoState {
    /// Created or reset, never resumed since.
    Init,
    /// Currently running on some thread.
    Exec,
    /// Suspended at a yield point, resumable.
    Hold,
    /// The body returned.
    Term,
    /// The body panicked; the panic was contained here.
    Except,
}

type CoFn = Box<dyn FnMut() + Send>;

struct CoInner {
    state: CoState,
    stack: context::stack::ProtectedFixedSizeStack,
    ctx: Option<context::Context>,
    func: Option<CoFn>,
}

/// A stackful user-space execution unit.
pub struct Coroutine {
    cid: u32,
    inner: Mutex<CoInner>,
}

// Safety: the runtime guarantees that a coroutine is executed by at most
// one thread at a time; between resumes the saved context and stack are an
// opaque unit handed over through the task queue. All mutable state is
// behind the inner mutex.
unsafe impl Send for Coroutine {}
// Safety: see above.
unsafe impl Sync for Coroutine {}

struct ThreadContext {
    /// Saved context of the worker that resumed the running coroutine.
    primary: Option<context::Context>,
    /// The coroutine currently executing on this thread.
    current: Option<Arc<Coroutine>>,
}

thread_local! {
    static THREAD: RefCell<ThreadContext> = const {
        RefCell::new(ThreadContext {
            primary: None,
            current: None,
        })
    };
}

impl Coroutine {
    /// Creates a coroutine around `func` with the configured stack size.
    ///
    /// Fails with [`Error::Config`] if `coroutine.stackSize` does not
    /// evaluate to a positive byte count, or [`Error::StackAlloc`] if the
    /// guarded stack cannot be mapped.
    pub fn new(func: impl FnMut() + Send + 'static) -> Result<Arc<Self>, Error> {
        Self::from_boxed(Box::new(func))
    }

    pub(crate) fn from_boxed(func: CoFn) -> Result<Arc<Self>, Error> {
        let size = configured_stack_size()?;
        let stack = context::stack::ProtectedFixedSizeStack::new(size)
            .map_err(|_| Error::StackAlloc { size })?;
        // Safety: the stack outlives the context; both live in `CoInner`
        // and are dropped together.
        let ctx = unsafe { context::Context::new(&stack, coroutine_entry) };

        Ok(Arc::new(Self {
            cid: next_cid(),
            inner: Mutex::new(CoInner {
                state: CoState::Init,
                stack,
                ctx: Some(ctx),
                func: Some(func),
            }),
        }))
    }

    /// The coroutine's 5-digit diagnostic id. Best-effort unique.
    pub fn cid(&self) -> u32 {
        self.cid
    }

    /// Current state.
    pub fn state(&self) -> CoState {
        self.inner.lock().expect("coroutine poisoned").state
    }

    /// Runs the coroutine on the calling thread until it yields, returns
    /// or panics. The state must be `Init` or `Hold`.
    pub fn resume(self: &Arc<Self>) {
        let ctx = {
            let mut inner = self.inner.lock().expect("coroutine poisoned");
            assert!(
                matches!(inner.state, CoState::Init | CoState::Hold),
                "coroutine {} resumed in state {:?}",
                self.cid,
                inner.state
            );
            inner.state = CoState::Exec;
            inner.ctx.take().expect("coroutine context missing")
        };

        let previous = THREAD.with(|t| t.borrow_mut().current.replace(self.clone()));
        assert!(previous.is_none(), "nested coroutine resume");

        // Safety: the context belongs to this coroutine's live stack and
        // was either freshly created or saved by the last suspension.
        let transfer = unsafe { ctx.resume(Arc::as_ptr(self) as usize) };

        THREAD.with(|t| t.borrow_mut().current = None);

        let mut inner = self.inner.lock().expect("coroutine poisoned");
        match inner.state {
            // The entry frame has finished; its context must not be
            // resumed again.
            CoState::Term | CoState::Except => {}
            _ => inner.ctx = Some(transfer.context),
        }
    }

    /// Rebuilds the context over the existing stack so the coroutine can
    /// run again. Valid only in `Init` or `Term`; optionally replaces the
    /// body.
    pub fn reset(&self, func: Option<CoFn>) {
        let mut inner = self.inner.lock().expect("coroutine poisoned");
        assert!(
            matches!(inner.state, CoState::Init | CoState::Term),
            "coroutine {} reset in state {:?}",
            self.cid,
            inner.state
        );
        if let Some(func) = func {
            inner.func = Some(func);
        }
        // Safety: the stack is not in use; the old context (if any) is
        // replaced wholesale.
        inner.ctx = Some(unsafe { context::Context::new(&inner.stack, coroutine_entry) });
        inner.state = CoState::Init;
    }
}

impl std::fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coroutine")
            .field("cid", &self.cid)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Suspends the currently running coroutine and switches back to its
/// resumer. Panics when called outside of a coroutine.
pub fn yield_now() {
    let co = THREAD
        .with(|t| t.borrow().current.clone())
        .expect("yield_now called outside of a coroutine");
    {
        let mut inner = co.inner.lock().expect("coroutine poisoned");
        assert_eq!(inner.state, CoState::Exec, "yield from a non-running coroutine");
        inner.state = CoState::Hold;
    }
    switch_to_primary();
}

/// Id of the running coroutine, or the OS thread id outside of one.
pub fn current_cid() -> u64 {
    THREAD
        .with(|t| t.borrow().current.as_ref().map(|co| u64::from(co.cid())))
        .unwrap_or_else(|| crate::scheduler::os_tid() as u64)
}

/// State of the running coroutine; `Exec` outside of one (the primary is
/// always running).
pub fn current_state() -> CoState {
    THREAD
        .with(|t| t.borrow().current.as_ref().map(|co| co.state()))
        .unwrap_or(CoState::Exec)
}

fn switch_to_primary() {
    let primary = THREAD
        .with(|t| t.borrow_mut().primary.take())
        .expect("no primary context to switch to");
    // Safety: the primary context was saved on this thread by the resume
    // that entered the coroutine and has not been consumed since.
    let transfer = unsafe { primary.resume(0) };
    // Resumed again, possibly on a different thread: re-save the resumer.
    THREAD.with(|t| t.borrow_mut().primary = Some(transfer.context));
}

extern "C" fn coroutine_entry(t: context::Transfer) -> ! {
    // Safety: `data` is the pointer passed by `resume`; the Arc clone in
    // the thread-local `current` slot keeps the allocation alive for the
    // whole resume slice.
    let co = unsafe { &*(t.data as *const Coroutine) };
    THREAD.with(|tc| tc.borrow_mut().primary = Some(t.context));

    let mut func = co
        .inner
        .lock()
        .expect("coroutine poisoned")
        .func
        .take()
        .expect("coroutine body missing");
    let result = std::panic::catch_unwind(AssertUnwindSafe(|| func()));
    if result.is_err() {
        tracing::error!(target: "system", cid = co.cid, "coroutine body panicked");
    }
    {
        let mut inner = co.inner.lock().expect("coroutine poisoned");
        inner.func = Some(func);
        inner.state = if result.is_ok() {
            CoState::Term
        } else {
            CoState::Except
        };
    }

    let primary = THREAD
        .with(|tc| tc.borrow_mut().primary.take())
        .expect("primary context missing");
    // Safety: switches back to the worker that resumed us for the last
    // time; this frame is never entered again.
    unsafe { primary.resume(0) };
    std::process::abort();
}

fn next_cid() -> u32 {
    let (hi, lo) = uuid::Uuid::new_v4().as_u64_pair();
    ((hi ^ lo) % 100_000) as u32
}

fn configured_stack_size() -> Result<usize, Error> {
    static SIZE: OnceLock<Arc<AtomicUsize>> = OnceLock::new();
    let size = SIZE.get_or_init(|| {
        let size = Arc::new(AtomicUsize::new(0));
        let watched = size.clone();
        Config::global().watch("coroutine.stackSize", move |_, new| {
            match config::eval_formula(new) {
                Ok(bytes) if bytes > 0 => watched.store(bytes as usize, Ordering::Relaxed),
                _ => {
                    tracing::error!(target: "system", value = new, "ignoring invalid coroutine.stackSize");
                }
            }
        });
        size
    });

    let cached = size.load(Ordering::Relaxed);
    if cached != 0 {
        return Ok(cached);
    }
    let formula = Config::global().get_or("coroutine.stackSize", config::DEFAULT_STACK_SIZE);
    let bytes = config::eval_formula(&formula)?;
    if bytes == 0 {
        return Err(Error::config("coroutine.stackSize", "stack size must be positive"));
    }
    size.store(bytes as usize, Ordering::Relaxed);
    Ok(bytes as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn runs_to_completion() {
        let steps = Arc::new(AtomicU32::new(0));
        let s = steps.clone();
        let co = Coroutine::new(move || {
            s.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        assert_eq!(co.state(), CoState::Init);
        co.resume();
        assert_eq!(co.state(), CoState::Term);
        assert_eq!(steps.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn yield_suspends_and_resumes() {
        let steps = Arc::new(AtomicU32::new(0));
        let s = steps.clone();
        let co = Coroutine::new(move || {
            s.fetch_add(1, Ordering::SeqCst);
            yield_now();
            s.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        co.resume();
        assert_eq!(co.state(), CoState::Hold);
        assert_eq!(steps.load(Ordering::SeqCst), 1);
        co.resume();
        assert_eq!(co.state(), CoState::Term);
        assert_eq!(steps.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn reset_reuses_the_stack() {
        let steps = Arc::new(AtomicU32::new(0));
        let s = steps.clone();
        let co = Coroutine::new(move || {
            s.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        co.resume();
        assert_eq!(co.state(), CoState::Term);
        co.reset(None);
        assert_eq!(co.state(), CoState::Init);
        co.resume();
        assert_eq!(steps.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panic_is_contained() {
        let co = Coroutine::new(|| panic!("boom")).unwrap();
        co.resume();
        assert_eq!(co.state(), CoState::Except);
        // The resuming thread survived and can keep running coroutines.
        let co2 = Coroutine::new(|| {}).unwrap();
        co2.resume();
        assert_eq!(co2.state(), CoState::Term);
    }

    #[test]
    fn cid_is_five_digits() {
        for _ in 0..64 {
            assert!(next_cid() < 100_000);
        }
    }

    #[test]
    fn current_helpers_outside_coroutine() {
        assert_eq!(current_state(), CoState::Exec);
        assert!(current_cid() > 0);
    }

    #[test]
    fn migrates_between_threads() {
        let co = Coroutine::new(|| {
            yield_now();
        })
        .unwrap();
        co.resume();
        assert_eq!(co.state(), CoState::Hold);

        let handle = std::thread::spawn({
            let co = co.clone();
            move || {
                co.resume();
                co.state()
            }
        });
        assert_eq!(handle.join().unwrap(), CoState::Term);
    }
}
