//! strand — a stackful-coroutine networking runtime.
//!
//! The runtime multiplexes thousands of connections per worker over a
//! single epoll instance while letting server code read as if it were
//! blocking. It is built from five pieces:
//!
//! * [`coroutine`] — stackful coroutines with explicit resume/yield,
//!   switched with the `context` crate.
//! * [`timer`] — an ordered store of absolute-deadline timers (one-shot,
//!   periodic and condition-gated).
//! * [`scheduler`] — a fixed worker pool over a FIFO task queue with
//!   name/tid affinities and deadline bypass.
//! * [`reactor`] — the epoll reactor owning the workers' blocking phase,
//!   per-fd read/write wakers and a self-pipe wake-up.
//! * [`hook`] + [`fd_info`] — the syscall shim: with the per-thread async
//!   flag on, blocking socket calls and sleeps become cooperative
//!   suspensions that retry after readiness.
//!
//! [`socket::Socket`] is the application-facing wrapper tying it together.
//!
//! ```no_run
//! use strand::{Reactor, Socket};
//!
//! let reactor = Reactor::new("echo", 4);
//! reactor.start();
//! reactor
//!     .schedule(|| {
//!         let server = Socket::tcp_v4().unwrap();
//!         server.bind(&"127.0.0.1:8080".parse().unwrap()).unwrap();
//!         server.listen(128).unwrap();
//!         loop {
//!             // Suspends this coroutine, not the worker thread.
//!             let (client, _peer) = server.accept().unwrap();
//!             let mut buffer = [0u8; 1024];
//!             let received = client.recv(&mut buffer, 0).unwrap();
//!             client.send(&buffer[..received], 0).unwrap();
//!         }
//!     })
//!     .unwrap();
//! ```
//!
//! Linux-only: the reactor needs `epoll`, the self-pipe and `gettid`.

pub mod config;
pub mod coroutine;
pub mod error;
pub mod fd_info;
pub mod hook;
pub mod reactor;
pub mod scheduler;
pub mod socket;
pub mod timer;

pub use coroutine::{yield_now, CoState, Coroutine};
pub use error::Error;
pub use reactor::{Direction, Reactor};
pub use scheduler::{Affinity, TimeoutMode};
pub use socket::Socket;
pub use timer::Timer;
