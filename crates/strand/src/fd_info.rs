//! Process-wide bookkeeping for sockets managed by the syscall shim.
//!
//! Every socket that passes through the shim is forced into real
//! non-blocking mode; [`SockFdInfo`] remembers what the *user* asked for
//! (the user non-block bit) alongside the per-direction timeouts. Closing
//! an fd is a soft reset rather than a map removal: the kernel recycles fd
//! numbers, and a later [`FdInfoTable::add_fd`] for the same number
//! re-initializes the entry.

use rustc_hash::FxHashMap;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, OnceLock, RwLock};

/// Timeout value meaning "no deadline".
pub const NO_TIMEOUT: u64 = u64::MAX;

#[derive(Debug)]
struct SockFdState {
    closed: bool,
    recv_timeout_ms: u64,
    send_timeout_ms: u64,
    user_nonblock: bool,
}

impl SockFdState {
    fn fresh() -> Self {
        Self {
            closed: true,
            recv_timeout_ms: NO_TIMEOUT,
            send_timeout_ms: NO_TIMEOUT,
            user_nonblock: false,
        }
    }
}

/// Shim-visible state of one socket fd.
#[derive(Debug)]
pub struct SockFdInfo {
    fd: RawFd,
    state: RwLock<SockFdState>,
}

impl SockFdInfo {
    fn new(fd: RawFd) -> Self {
        Self {
            fd,
            state: RwLock::new(SockFdState::fresh()),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_closed(&self) -> bool {
        self.state.read().expect("fd info poisoned").closed
    }

    pub fn recv_timeout_ms(&self) -> u64 {
        self.state.read().expect("fd info poisoned").recv_timeout_ms
    }

    pub fn send_timeout_ms(&self) -> u64 {
        self.state.read().expect("fd info poisoned").send_timeout_ms
    }

    pub fn user_nonblock(&self) -> bool {
        self.state.read().expect("fd info poisoned").user_nonblock
    }

    pub fn set_recv_timeout_ms(&self, ms: u64) {
        self.state.write().expect("fd info poisoned").recv_timeout_ms = ms;
    }

    pub fn set_send_timeout_ms(&self, ms: u64) {
        self.state.write().expect("fd info poisoned").send_timeout_ms = ms;
    }

    pub fn set_user_nonblock(&self, value: bool) {
        self.state.write().expect("fd info poisoned").user_nonblock = value;
    }

    /// Marking an fd closed resets the timeouts and the user non-block
    /// bit; re-opening only clears the closed flag.
    pub fn set_closed(&self, value: bool) {
        let mut state = self.state.write().expect("fd info poisoned");
        if value {
            *state = SockFdState::fresh();
        } else {
            state.closed = false;
        }
    }
}

/// The process-wide `fd -> SockFdInfo` table.
#[derive(Debug, Default)]
pub struct FdInfoTable {
    entries: Mutex<FxHashMap<RawFd, Arc<SockFdInfo>>>,
}

impl FdInfoTable {
    /// Returns the process-wide table.
    pub fn global() -> &'static FdInfoTable {
        static TABLE: OnceLock<FdInfoTable> = OnceLock::new();
        TABLE.get_or_init(FdInfoTable::default)
    }

    /// Starts tracking `fd`. Returns `None` when the fd is not a socket
    /// or is already tracked and open. The real fd is switched to
    /// non-blocking mode.
    pub fn add_fd(&self, fd: RawFd) -> Option<Arc<SockFdInfo>> {
        // Safety: fstat writes into the zeroed buffer we hand it.
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        let rt = unsafe { libc::fstat(fd, &mut stat) };
        if rt < 0 {
            tracing::debug!(target: "system", fd, "fstat failed, not tracking fd");
            return None;
        }
        if (stat.st_mode & libc::S_IFMT) != libc::S_IFSOCK {
            return None;
        }

        // The shim always drives sockets in non-blocking mode; the user
        // visible flag lives in the entry instead.
        // Safety: fcntl on a live fd.
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL, 0);
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }

        let mut entries = self.entries.lock().expect("fd table poisoned");
        let entry = entries
            .entry(fd)
            .or_insert_with(|| Arc::new(SockFdInfo::new(fd)));
        if !entry.is_closed() {
            return None;
        }
        entry.set_closed(false);
        Some(entry.clone())
    }

    /// Looks up a tracked, open fd.
    pub fn get_fd(&self, fd: RawFd) -> Option<Arc<SockFdInfo>> {
        let entries = self.entries.lock().expect("fd table poisoned");
        entries.get(&fd).filter(|info| !info.is_closed()).cloned()
    }

    /// Forgets an fd entirely.
    pub fn del_fd(&self, fd: RawFd) {
        self.entries.lock().expect("fd table poisoned").remove(&fd);
    }

    /// Forgets every fd.
    pub fn clear(&self) {
        self.entries.lock().expect("fd table poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp_fd() -> RawFd {
        // Safety: plain socket creation.
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);
        fd
    }

    #[test]
    fn tracks_sockets_only() {
        let table = FdInfoTable::default();
        let fd = tcp_fd();

        let info = table.add_fd(fd).expect("socket should be tracked");
        assert_eq!(info.fd(), fd);
        assert!(!info.is_closed());
        assert_eq!(info.recv_timeout_ms(), NO_TIMEOUT);

        // The real fd was forced non-blocking.
        // Safety: fcntl on a live fd.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        assert!(flags & libc::O_NONBLOCK != 0);

        // A pipe is not a socket.
        let mut pipe_fds = [0 as libc::c_int; 2];
        // Safety: the array has room for both ends.
        assert_eq!(unsafe { libc::pipe(pipe_fds.as_mut_ptr()) }, 0);
        assert!(table.add_fd(pipe_fds[0]).is_none());

        // Safety: closing fds we created.
        unsafe {
            libc::close(fd);
            libc::close(pipe_fds[0]);
            libc::close(pipe_fds[1]);
        }
    }

    #[test]
    fn duplicate_add_is_refused_until_closed() {
        let table = FdInfoTable::default();
        let fd = tcp_fd();

        let info = table.add_fd(fd).unwrap();
        assert!(table.add_fd(fd).is_none(), "live entry must not be reissued");

        info.set_recv_timeout_ms(500);
        info.set_user_nonblock(true);
        info.set_closed(true);
        assert!(table.get_fd(fd).is_none(), "closed entries are invisible");

        // Closing reset the per-fd state; re-adding reuses the entry.
        let reopened = table.add_fd(fd).unwrap();
        assert_eq!(reopened.recv_timeout_ms(), NO_TIMEOUT);
        assert!(!reopened.user_nonblock());

        // Safety: closing the fd we created.
        unsafe { libc::close(fd) };
    }
}
