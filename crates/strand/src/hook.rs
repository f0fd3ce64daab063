//! The async syscall shim.
//!
//! Every function here mirrors the C call it wraps: raw return values and
//! errno, so code written against the shim behaves exactly like code
//! written against the syscalls themselves. While the per-thread async
//! flag is off (the default) each call is a plain passthrough.
//!
//! With the flag on — worker threads enable it on entry — a blocking
//! operation on a tracked socket becomes a cooperative suspension: the
//! call is attempted non-blocking, and on `EAGAIN` the current task is
//! moved out of the worker's slot, a readiness waker (plus an optional
//! timeout timer) is armed on the current reactor, and the coroutine
//! yields. The waker re-schedules the task pinned to its previous thread;
//! the call is then retried exactly once.
//!
//! Expected failures use the errno channel: `EBADF` for untracked fds,
//! `EINVAL` for async use outside a reactor or an arming failure,
//! `ETIMEDOUT` when the timer wins, `EIO` when the post-wake retry fails.

use crate::coroutine;
use crate::fd_info::{FdInfoTable, NO_TIMEOUT};
use crate::reactor::{Direction, Reactor};
use crate::scheduler::{self, Affinity};
use libc::{c_int, c_void, size_t, socklen_t, ssize_t};
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

thread_local! {
    static IS_ASYNC: Cell<bool> = const { Cell::new(false) };
}

/// Toggles the calling thread's async mode.
pub fn set_async(value: bool) {
    IS_ASYNC.with(|flag| flag.set(value));
}

/// Whether the calling thread reroutes blocking calls through the reactor.
pub fn is_async() -> bool {
    IS_ASYNC.with(|flag| flag.get())
}

fn set_errno(err: c_int) {
    // Safety: __errno_location returns the thread's errno slot.
    unsafe { *libc::__errno_location() = err };
}

fn errno() -> c_int {
    // Safety: __errno_location returns the thread's errno slot.
    unsafe { *libc::__errno_location() }
}

/// Moves the current task out of the worker, arms a waker for `fd`/`dir`
/// (and a one-shot timeout timer when `timeout_ms` is finite) and yields.
///
/// Returns `Ok(true)` when the timer fired first, `Ok(false)` on a
/// readiness wake, `Err(errno)` when nothing could be armed.
fn suspend_on_event(
    reactor: &Arc<Reactor>,
    fd: c_int,
    dir: Direction,
    timeout_ms: u64,
    what: &'static str,
) -> Result<bool, c_int> {
    let Some(task) = scheduler::take_current_task() else {
        return Err(libc::EINVAL);
    };
    let tid = scheduler::os_tid();

    // The task travels into the waker through a shared slot so it can be
    // recovered if arming fails.
    let slot = Arc::new(Mutex::new(Some(task)));
    let waker = {
        let slot = slot.clone();
        let reactor = reactor.clone();
        move || {
            if let Some(task) = slot.lock().expect("waker slot poisoned").take() {
                reactor.schedule_task(task, Affinity::Tid(tid));
            }
        }
    };
    if !reactor.add_event(fd, dir, waker) {
        tracing::error!(target: "system", func = what, fd, "could not arm readiness waker");
        if let Some(task) = slot.lock().expect("waker slot poisoned").take() {
            scheduler::put_current_task(task);
        }
        return Err(libc::EINVAL);
    }

    let timed_out = Arc::new(AtomicBool::new(false));
    let timer = if timeout_ms != NO_TIMEOUT {
        let reactor_for_timer = reactor.clone();
        let flag = timed_out.clone();
        Some(reactor.add_timer(
            timeout_ms,
            move || {
                // Winning the race against readiness means the event was
                // still armed and this wake is a timeout.
                flag.store(
                    reactor_for_timer.trigger_event(fd, dir),
                    Ordering::SeqCst,
                );
            },
            false,
        ))
    } else {
        None
    };

    coroutine::yield_now();

    if timed_out.load(Ordering::SeqCst) {
        return Ok(true);
    }
    if let Some(timer) = timer {
        timer.cancel();
    }
    Ok(false)
}

/// Parks the current task on a one-shot timer and yields.
fn suspend_on_timer(ms: u64) -> Result<(), c_int> {
    let Some(reactor) = scheduler::current_reactor() else {
        return Err(libc::EINVAL);
    };
    let Some(task) = scheduler::take_current_task() else {
        return Err(libc::EINVAL);
    };
    let tid = scheduler::os_tid();

    let slot = Arc::new(Mutex::new(Some(task)));
    {
        let slot = slot.clone();
        let reactor_for_timer = reactor.clone();
        reactor.add_timer(
            ms,
            move || {
                if let Some(task) = slot.lock().expect("sleep slot poisoned").take() {
                    reactor_for_timer.schedule_task(task, Affinity::Tid(tid));
                }
            },
            false,
        );
    }
    coroutine::yield_now();
    Ok(())
}

/// Shared protocol for the plain I/O calls.
fn shim_io(
    fd: c_int,
    dir: Direction,
    what: &'static str,
    mut raw: impl FnMut() -> ssize_t,
) -> ssize_t {
    if !is_async() {
        return raw();
    }
    let Some(info) = FdInfoTable::global().get_fd(fd) else {
        set_errno(libc::EBADF);
        return -1;
    };
    if info.user_nonblock() {
        // The user opted into non-blocking semantics; EAGAIN is theirs.
        return raw();
    }

    let mut rt = loop {
        let rt = raw();
        if rt == -1 && errno() == libc::EINTR {
            continue;
        }
        break rt;
    };

    if rt == -1 && errno() == libc::EAGAIN {
        let Some(reactor) = scheduler::current_reactor() else {
            set_errno(libc::EINVAL);
            return -1;
        };
        let timeout_ms = match dir {
            Direction::Read => info.recv_timeout_ms(),
            Direction::Write => info.send_timeout_ms(),
        };
        match suspend_on_event(&reactor, fd, dir, timeout_ms, what) {
            Err(err) => {
                set_errno(err);
                return -1;
            }
            Ok(true) => {
                set_errno(libc::ETIMEDOUT);
                return -1;
            }
            Ok(false) => {}
        }
        rt = raw();
        if rt < 0 {
            set_errno(libc::EIO);
            return -1;
        }
    }
    rt
}

// ---- sleep ----------------------------------------------------------------

/// Cooperative `sleep`. Returns 0 on success; outside a reactor in async
/// mode the full duration is reported unslept with `EINVAL`.
pub fn sleep(seconds: libc::c_uint) -> libc::c_uint {
    if !is_async() {
        // Safety: no pointer arguments.
        return unsafe { libc::sleep(seconds) };
    }
    match suspend_on_timer(u64::from(seconds) * 1000) {
        Ok(()) => 0,
        Err(err) => {
            set_errno(err);
            seconds
        }
    }
}

/// Cooperative `usleep`.
pub fn usleep(usec: libc::useconds_t) -> c_int {
    if !is_async() {
        // Safety: no pointer arguments.
        return unsafe { libc::usleep(usec) };
    }
    match suspend_on_timer(u64::from(usec) / 1000) {
        Ok(()) => 0,
        Err(err) => {
            set_errno(err);
            -1
        }
    }
}

// ---- socket lifecycle ------------------------------------------------------

/// `socket`, registering the new fd with the info table in async mode.
pub fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    // Safety: no pointer arguments.
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if !is_async() || fd < 0 {
        return fd;
    }
    if FdInfoTable::global().add_fd(fd).is_none() {
        tracing::error!(target: "system", fd, "new socket could not be tracked");
        // Safety: the fd was just created and is unusable to the caller.
        unsafe { libc::close(fd) };
        set_errno(libc::EBADF);
        return -1;
    }
    fd
}

/// `bind` passthrough.
///
/// # Safety
///
/// `addr` must point to a valid socket address of `len` bytes.
pub unsafe fn bind(fd: c_int, addr: *const libc::sockaddr, len: socklen_t) -> c_int {
    // Safety: forwarded contract.
    unsafe { libc::bind(fd, addr, len) }
}

/// `listen` passthrough.
pub fn listen(fd: c_int, backlog: c_int) -> c_int {
    // Safety: no pointer arguments.
    unsafe { libc::listen(fd, backlog) }
}

/// `accept`; in async mode the wait for an incoming connection suspends
/// the coroutine, and the accepted fd is registered with the info table.
///
/// # Safety
///
/// `addr`/`len`, when non-null, must follow the `accept(2)` contract.
pub unsafe fn accept(fd: c_int, addr: *mut libc::sockaddr, len: *mut socklen_t) -> c_int {
    if !is_async() {
        // Safety: forwarded contract.
        return unsafe { libc::accept(fd, addr, len) };
    }
    let Some(info) = FdInfoTable::global().get_fd(fd) else {
        set_errno(libc::EBADF);
        return -1;
    };
    if info.user_nonblock() {
        // Safety: forwarded contract.
        return unsafe { libc::accept(fd, addr, len) };
    }

    let mut new_fd = loop {
        // Safety: forwarded contract.
        let rt = unsafe { libc::accept(fd, addr, len) };
        if rt == -1 && errno() == libc::EINTR {
            continue;
        }
        break rt;
    };

    if new_fd == -1 && errno() == libc::EAGAIN {
        let Some(reactor) = scheduler::current_reactor() else {
            set_errno(libc::EINVAL);
            return -1;
        };
        match suspend_on_event(&reactor, fd, Direction::Read, NO_TIMEOUT, "accept") {
            Err(err) => {
                set_errno(err);
                return -1;
            }
            Ok(_) => {}
        }
        // Safety: forwarded contract.
        new_fd = unsafe { libc::accept(fd, addr, len) };
        if new_fd < 0 {
            set_errno(libc::EIO);
            return -1;
        }
    }

    if new_fd >= 0 && FdInfoTable::global().add_fd(new_fd).is_none() {
        tracing::error!(target: "system", fd = new_fd, "accepted socket could not be tracked");
        set_errno(libc::EBADF);
        return -1;
    }
    new_fd
}

/// Non-async fallback for [`connect_with_timeout`]: the classic
/// temporarily-nonblocking `connect` + `select` dance.
///
/// # Safety
///
/// `addr` must point to a valid socket address of `len` bytes.
unsafe fn select_connect_timeout(
    fd: c_int,
    addr: *const libc::sockaddr,
    len: socklen_t,
    timeout_ms: u64,
) -> c_int {
    // Safety: fcntl on the caller's fd.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags & libc::O_NONBLOCK != 0 {
        // Safety: forwarded contract.
        return unsafe { libc::connect(fd, addr, len) };
    }
    // Safety: fcntl on the caller's fd.
    unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };

    // Safety: forwarded contract.
    let rt = unsafe { libc::connect(fd, addr, len) };
    if rt == -1 && errno() == libc::EINPROGRESS {
        // Safety: fd_set/timeval are plain data; select reads the set we
        // initialized.
        unsafe {
            let mut write_set: libc::fd_set = std::mem::zeroed();
            libc::FD_ZERO(&mut write_set);
            libc::FD_SET(fd, &mut write_set);
            let mut tv = libc::timeval {
                tv_sec: (timeout_ms / 1000) as libc::time_t,
                tv_usec: ((timeout_ms % 1000) * 1000) as libc::suseconds_t,
            };
            let ready = libc::select(
                fd + 1,
                std::ptr::null_mut(),
                &mut write_set,
                std::ptr::null_mut(),
                &mut tv,
            );
            libc::fcntl(fd, libc::F_SETFL, flags);
            if ready == 0 {
                set_errno(libc::ETIMEDOUT);
                return -1;
            }
            if ready < 0 {
                tracing::error!(target: "system", fd, errno = errno(), "select failed during connect");
                return -1;
            }
        }
    } else {
        // Safety: fcntl on the caller's fd.
        unsafe { libc::fcntl(fd, libc::F_SETFL, flags) };
        return rt;
    }

    check_so_error(fd)
}

fn check_so_error(fd: c_int) -> c_int {
    let mut error: c_int = 0;
    let mut len = std::mem::size_of::<c_int>() as socklen_t;
    // Safety: the out parameters point at live locals of the right size.
    let rt = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            (&mut error as *mut c_int).cast(),
            &mut len,
        )
    };
    if rt < 0 {
        tracing::error!(target: "system", fd, errno = errno(), "getsockopt(SO_ERROR) failed");
        return -1;
    }
    if error != 0 {
        set_errno(error);
        return -1;
    }
    set_errno(0);
    0
}

/// # Safety
///
/// `addr` must point to a valid socket address of `len` bytes.
unsafe fn connect_inner(
    fd: c_int,
    addr: *const libc::sockaddr,
    len: socklen_t,
    timeout_ms: u64,
    what: &'static str,
) -> c_int {
    let Some(info) = FdInfoTable::global().get_fd(fd) else {
        set_errno(libc::EBADF);
        return -1;
    };
    if info.user_nonblock() {
        // Safety: forwarded contract.
        return unsafe { libc::connect(fd, addr, len) };
    }

    let rt = loop {
        // Safety: forwarded contract.
        let rt = unsafe { libc::connect(fd, addr, len) };
        if rt == -1 && errno() == libc::EINTR {
            continue;
        }
        break rt;
    };

    if rt == -1 && errno() == libc::EINPROGRESS {
        let Some(reactor) = scheduler::current_reactor() else {
            set_errno(libc::EINVAL);
            return -1;
        };
        match suspend_on_event(&reactor, fd, Direction::Write, timeout_ms, what) {
            Err(err) => {
                set_errno(err);
                return -1;
            }
            Ok(true) => {
                set_errno(libc::ETIMEDOUT);
                return -1;
            }
            Ok(false) => {}
        }
    }

    check_so_error(fd)
}

/// `connect`; in async mode the in-progress wait suspends the coroutine.
///
/// # Safety
///
/// `addr` must point to a valid socket address of `len` bytes.
pub unsafe fn connect(fd: c_int, addr: *const libc::sockaddr, len: socklen_t) -> c_int {
    if !is_async() {
        // Safety: forwarded contract.
        return unsafe { libc::connect(fd, addr, len) };
    }
    // Safety: forwarded contract.
    unsafe { connect_inner(fd, addr, len, NO_TIMEOUT, "connect") }
}

/// [`connect`] with a deadline; `ETIMEDOUT` when it elapses first.
///
/// # Safety
///
/// `addr` must point to a valid socket address of `len` bytes.
pub unsafe fn connect_with_timeout(
    fd: c_int,
    addr: *const libc::sockaddr,
    len: socklen_t,
    timeout_ms: u64,
) -> c_int {
    if !is_async() {
        // Safety: forwarded contract.
        return unsafe { select_connect_timeout(fd, addr, len, timeout_ms) };
    }
    // Safety: forwarded contract.
    unsafe { connect_inner(fd, addr, len, timeout_ms, "connect_with_timeout") }
}

/// `close`; soft-resets the fd's info entry. `EBADF` for untracked fds in
/// async mode.
pub fn close(fd: c_int) -> c_int {
    if !is_async() {
        // Safety: no pointer arguments.
        return unsafe { libc::close(fd) };
    }
    let Some(info) = FdInfoTable::global().get_fd(fd) else {
        set_errno(libc::EBADF);
        return -1;
    };
    info.set_closed(true);
    // Safety: no pointer arguments.
    unsafe { libc::close(fd) }
}

// ---- reads -----------------------------------------------------------------

/// # Safety
///
/// `buf` must be valid for writes of `count` bytes.
pub unsafe fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    // Safety: forwarded contract.
    shim_io(fd, Direction::Read, "read", || unsafe { libc::read(fd, buf, count) })
}

/// # Safety
///
/// `iov` must point to `iovcnt` valid iovecs.
pub unsafe fn readv(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t {
    // Safety: forwarded contract.
    shim_io(fd, Direction::Read, "readv", || unsafe { libc::readv(fd, iov, iovcnt) })
}

/// # Safety
///
/// `buf` must be valid for writes of `len` bytes.
pub unsafe fn recv(fd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    // Safety: forwarded contract.
    shim_io(fd, Direction::Read, "recv", || unsafe { libc::recv(fd, buf, len, flags) })
}

/// # Safety
///
/// `buf`, `src_addr` and `addrlen` must follow the `recvfrom(2)` contract.
pub unsafe fn recvfrom(
    fd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    src_addr: *mut libc::sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    shim_io(fd, Direction::Read, "recvfrom", || {
        // Safety: forwarded contract.
        unsafe { libc::recvfrom(fd, buf, len, flags, src_addr, addrlen) }
    })
}

/// # Safety
///
/// `msg` must point to a valid msghdr.
pub unsafe fn recvmsg(fd: c_int, msg: *mut libc::msghdr, flags: c_int) -> ssize_t {
    // Safety: forwarded contract.
    shim_io(fd, Direction::Read, "recvmsg", || unsafe { libc::recvmsg(fd, msg, flags) })
}

// ---- writes ----------------------------------------------------------------

/// # Safety
///
/// `buf` must be valid for reads of `count` bytes.
pub unsafe fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    // Safety: forwarded contract.
    shim_io(fd, Direction::Write, "write", || unsafe { libc::write(fd, buf, count) })
}

/// # Safety
///
/// `iov` must point to `iovcnt` valid iovecs.
pub unsafe fn writev(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t {
    // Safety: forwarded contract.
    shim_io(fd, Direction::Write, "writev", || unsafe { libc::writev(fd, iov, iovcnt) })
}

/// # Safety
///
/// `buf` must be valid for reads of `len` bytes.
pub unsafe fn send(fd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    // Safety: forwarded contract.
    shim_io(fd, Direction::Write, "send", || unsafe { libc::send(fd, buf, len, flags) })
}

/// # Safety
///
/// `buf` and `dest_addr` must follow the `sendto(2)` contract.
pub unsafe fn sendto(
    fd: c_int,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
    dest_addr: *const libc::sockaddr,
    addrlen: socklen_t,
) -> ssize_t {
    shim_io(fd, Direction::Write, "sendto", || {
        // Safety: forwarded contract.
        unsafe { libc::sendto(fd, buf, len, flags, dest_addr, addrlen) }
    })
}

/// # Safety
///
/// `msg` must point to a valid msghdr.
pub unsafe fn sendmsg(fd: c_int, msg: *const libc::msghdr, flags: c_int) -> ssize_t {
    // Safety: forwarded contract.
    shim_io(fd, Direction::Write, "sendmsg", || unsafe { libc::sendmsg(fd, msg, flags) })
}

// ---- control ---------------------------------------------------------------

/// Mirrors the kernel's `struct f_owner_ex` (`F_SETOWN_EX`/`F_GETOWN_EX`
/// payload, `linux/fcntl.h`); not exposed by the `libc` crate.
#[repr(C)]
#[derive(Debug)]
pub struct f_owner_ex {
    pub type_: c_int,
    pub pid: libc::pid_t,
}

/// Typed third argument for [`fcntl`], replacing the C varargs.
#[derive(Debug)]
pub enum FcntlArg<'a> {
    None,
    Int(c_int),
    Flock(&'a mut libc::flock),
    OwnerEx(&'a mut f_owner_ex),
}

/// `fcntl` with the shim's flag bookkeeping:
///
/// * `F_GETFL` masks `O_NONBLOCK` according to the user's request, hiding
///   the non-blocking mode the shim imposes on the real fd.
/// * `F_SETFL` records a requested `O_NONBLOCK` in the info entry and
///   always ORs `O_NONBLOCK` into the real flags.
pub fn fcntl(fd: c_int, cmd: c_int, arg: FcntlArg<'_>) -> c_int {
    if cmd == libc::F_GETFL {
        // Safety: no pointer payload.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        if !is_async() || flags == -1 {
            return flags;
        }
        let Some(info) = FdInfoTable::global().get_fd(fd) else {
            set_errno(libc::EBADF);
            return -1;
        };
        return if info.user_nonblock() {
            flags
        } else {
            flags & !libc::O_NONBLOCK
        };
    }

    if cmd == libc::F_SETFL {
        let FcntlArg::Int(value) = arg else {
            set_errno(libc::EINVAL);
            return -1;
        };
        if !is_async() {
            // Safety: integer payload.
            return unsafe { libc::fcntl(fd, cmd, value) };
        }
        let Some(info) = FdInfoTable::global().get_fd(fd) else {
            set_errno(libc::EBADF);
            return -1;
        };
        if value & libc::O_NONBLOCK != 0 {
            info.set_user_nonblock(true);
        }
        // Safety: integer payload.
        return unsafe { libc::fcntl(fd, cmd, value | libc::O_NONBLOCK) };
    }

    match arg {
        // Safety: integer payload commands.
        FcntlArg::Int(value) => unsafe { libc::fcntl(fd, cmd, value) },
        // Safety: pointer payload commands with a live referent.
        FcntlArg::Flock(lock) => unsafe { libc::fcntl(fd, cmd, lock as *mut libc::flock) },
        // Safety: pointer payload commands with a live referent.
        FcntlArg::OwnerEx(owner) => unsafe { libc::fcntl(fd, cmd, owner as *mut f_owner_ex) },
        // Safety: void commands.
        FcntlArg::None => unsafe { libc::fcntl(fd, cmd, 0) },
    }
}

/// `getsockopt`; `SO_RCVTIMEO`/`SO_SNDTIMEO` read the shim's per-fd
/// timeouts instead of the kernel's.
///
/// # Safety
///
/// `optval`/`optlen` must follow the `getsockopt(2)` contract.
pub unsafe fn getsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *mut c_void,
    optlen: *mut socklen_t,
) -> c_int {
    if !is_async() {
        // Safety: forwarded contract.
        return unsafe { libc::getsockopt(fd, level, optname, optval, optlen) };
    }
    let Some(info) = FdInfoTable::global().get_fd(fd) else {
        set_errno(libc::EBADF);
        return -1;
    };

    if level == libc::SOL_SOCKET && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO) {
        let ms = if optname == libc::SO_RCVTIMEO {
            info.recv_timeout_ms()
        } else {
            info.send_timeout_ms()
        };
        // Safety: the caller hands us a timeval-sized buffer.
        unsafe {
            if ms == NO_TIMEOUT {
                std::ptr::write_bytes(optval.cast::<u8>(), 0, *optlen as usize);
            } else {
                let tv = optval.cast::<libc::timeval>();
                (*tv).tv_sec = (ms / 1000) as libc::time_t;
                (*tv).tv_usec = ((ms % 1000) * 1000) as libc::suseconds_t;
            }
        }
        return 0;
    }
    // Safety: forwarded contract.
    unsafe { libc::getsockopt(fd, level, optname, optval, optlen) }
}

/// `setsockopt`; `SO_RCVTIMEO`/`SO_SNDTIMEO` write the shim's per-fd
/// timeouts instead of the kernel's.
///
/// # Safety
///
/// `optval` must point to `optlen` valid bytes.
pub unsafe fn setsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: socklen_t,
) -> c_int {
    if !is_async() {
        // Safety: forwarded contract.
        return unsafe { libc::setsockopt(fd, level, optname, optval, optlen) };
    }
    let Some(info) = FdInfoTable::global().get_fd(fd) else {
        set_errno(libc::EBADF);
        return -1;
    };

    if level == libc::SOL_SOCKET && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO) {
        // Safety: the option carries a timeval payload.
        let tv = unsafe { &*optval.cast::<libc::timeval>() };
        let ms = tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000;
        if optname == libc::SO_RCVTIMEO {
            info.set_recv_timeout_ms(ms);
        } else {
            info.set_send_timeout_ms(ms);
        }
        return 0;
    }
    // Safety: forwarded contract.
    unsafe { libc::setsockopt(fd, level, optname, optval, optlen) }
}

/// `ioctl`; `FIONBIO` only flips the user non-block bit and never reaches
/// the kernel (the real fd stays non-blocking).
///
/// # Safety
///
/// `arg` must follow the contract of the given request.
pub unsafe fn ioctl(fd: c_int, request: libc::c_ulong, arg: *mut c_void) -> c_int {
    if !is_async() {
        // Safety: forwarded contract.
        return unsafe { libc::ioctl(fd, request as _, arg) };
    }
    if request == libc::FIONBIO as libc::c_ulong {
        let Some(info) = FdInfoTable::global().get_fd(fd) else {
            set_errno(libc::EBADF);
            return -1;
        };
        // Safety: FIONBIO carries an int payload.
        let value = unsafe { *arg.cast::<c_int>() };
        info.set_user_nonblock(value != 0);
        return 0;
    }
    // Safety: forwarded contract.
    unsafe { libc::ioctl(fd, request as _, arg) }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AsyncGuard;
    impl AsyncGuard {
        fn enable() -> Self {
            set_async(true);
            AsyncGuard
        }
    }
    impl Drop for AsyncGuard {
        fn drop(&mut self) {
            set_async(false);
        }
    }

    #[test]
    fn async_flag_is_per_thread() {
        assert!(!is_async());
        let _guard = AsyncGuard::enable();
        assert!(is_async());
        std::thread::spawn(|| assert!(!is_async())).join().unwrap();
    }

    #[test]
    fn socket_registers_in_async_mode() {
        let _guard = AsyncGuard::enable();
        let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= 0);
        assert!(FdInfoTable::global().get_fd(fd).is_some());
        assert_eq!(close(fd), 0);
        assert!(FdInfoTable::global().get_fd(fd).is_none());
    }

    #[test]
    fn fcntl_masks_the_imposed_nonblock() {
        let _guard = AsyncGuard::enable();
        let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= 0);

        // The shim forces the real fd non-blocking but the user never
        // asked for it.
        let flags = fcntl(fd, libc::F_GETFL, FcntlArg::None);
        assert_eq!(flags & libc::O_NONBLOCK, 0);

        assert!(fcntl(fd, libc::F_SETFL, FcntlArg::Int(libc::O_NONBLOCK)) >= 0);
        let flags = fcntl(fd, libc::F_GETFL, FcntlArg::None);
        assert!(flags & libc::O_NONBLOCK != 0);

        close(fd);
    }

    #[test]
    fn ioctl_fionbio_tracks_user_intent() {
        let _guard = AsyncGuard::enable();
        let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        let info = FdInfoTable::global().get_fd(fd).unwrap();

        let mut on: c_int = 1;
        // Safety: FIONBIO takes an int payload.
        assert_eq!(unsafe { ioctl(fd, libc::FIONBIO as libc::c_ulong, (&mut on as *mut c_int).cast()) }, 0);
        assert!(info.user_nonblock());

        let mut off: c_int = 0;
        // Safety: FIONBIO takes an int payload.
        assert_eq!(unsafe { ioctl(fd, libc::FIONBIO as libc::c_ulong, (&mut off as *mut c_int).cast()) }, 0);
        assert!(!info.user_nonblock());

        close(fd);
    }

    #[test]
    fn sockopt_timeouts_stay_in_the_shim() {
        let _guard = AsyncGuard::enable();
        let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        let info = FdInfoTable::global().get_fd(fd).unwrap();

        let tv = libc::timeval {
            tv_sec: 1,
            tv_usec: 500_000,
        };
        // Safety: passing a valid timeval.
        let rt = unsafe {
            setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                (&tv as *const libc::timeval).cast(),
                std::mem::size_of::<libc::timeval>() as socklen_t,
            )
        };
        assert_eq!(rt, 0);
        assert_eq!(info.recv_timeout_ms(), 1500);

        let mut out = libc::timeval { tv_sec: 0, tv_usec: 0 };
        let mut out_len = std::mem::size_of::<libc::timeval>() as socklen_t;
        // Safety: passing a valid timeval out-buffer.
        let rt = unsafe {
            getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                (&mut out as *mut libc::timeval).cast(),
                &mut out_len,
            )
        };
        assert_eq!(rt, 0);
        assert_eq!(out.tv_sec, 1);
        assert_eq!(out.tv_usec, 500_000);

        close(fd);
    }

    #[test]
    fn untracked_fd_is_ebadf_in_async_mode() {
        let _guard = AsyncGuard::enable();
        let mut buffer = [0u8; 8];
        // 999_999 is almost certainly not a tracked fd.
        // Safety: the buffer is live.
        let rt = unsafe { recv(999_999, buffer.as_mut_ptr().cast(), buffer.len(), 0) };
        assert_eq!(rt, -1);
        assert_eq!(errno(), libc::EBADF);
    }
}
