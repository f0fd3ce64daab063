//! Owned-fd socket wrapper over the syscall shim.
//!
//! Every operation delegates to [`crate::hook`], so a `Socket` used inside
//! a reactor coroutine suspends cooperatively instead of blocking its
//! worker, while the same code outside a reactor behaves like ordinary
//! blocking sockets. Construction registers the fd with the process-wide
//! info table; `-1`/errno results are converted into [`io::Error`]s.

use crate::fd_info::NO_TIMEOUT;
use crate::hook::{self, FcntlArg};
use std::io::{self, IoSlice, IoSliceMut};
use std::net::SocketAddr;
use std::os::fd::RawFd;

/// A socket whose blocking operations are cooperative inside a reactor.
#[derive(Debug)]
pub struct Socket {
    fd: RawFd,
    closed: bool,
}

impl Socket {
    fn create(domain: libc::c_int, ty: libc::c_int) -> io::Result<Self> {
        let fd = hook::socket(domain, ty, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd, closed: false })
    }

    pub fn tcp_v4() -> io::Result<Self> {
        Self::create(libc::AF_INET, libc::SOCK_STREAM)
    }

    pub fn udp_v4() -> io::Result<Self> {
        Self::create(libc::AF_INET, libc::SOCK_DGRAM)
    }

    pub fn tcp_v6() -> io::Result<Self> {
        Self::create(libc::AF_INET6, libc::SOCK_STREAM)
    }

    pub fn udp_v6() -> io::Result<Self> {
        Self::create(libc::AF_INET6, libc::SOCK_DGRAM)
    }

    /// Wraps an fd that is already registered with the info table (e.g. an
    /// accepted connection).
    pub fn from_raw_fd(fd: RawFd) -> Self {
        Self { fd, closed: false }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn bind(&self, addr: &SocketAddr) -> io::Result<()> {
        let (storage, len) = to_storage(addr);
        // Safety: the storage is a valid address of `len` bytes.
        let rt = unsafe { hook::bind(self.fd, (&storage as *const libc::sockaddr_storage).cast(), len) };
        check_rc(rt)
    }

    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        check_rc(hook::listen(self.fd, backlog))
    }

    /// Accepts one connection; inside a reactor this suspends until a
    /// client arrives.
    pub fn accept(&self) -> io::Result<(Socket, SocketAddr)> {
        // Safety: out-parameters point at a live storage/len pair.
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let fd = unsafe {
            hook::accept(
                self.fd,
                (&mut storage as *mut libc::sockaddr_storage).cast(),
                &mut len,
            )
        };
        if fd < 0 {
            let error = io::Error::last_os_error();
            tracing::debug!(target: "server", fd = self.fd, %error, "accept failed");
            return Err(error);
        }
        let peer = from_storage(&storage)?;
        tracing::debug!(target: "server", fd, peer = %peer, "accepted connection");
        Ok((Socket::from_raw_fd(fd), peer))
    }

    pub fn connect(&self, addr: &SocketAddr) -> io::Result<()> {
        let (storage, len) = to_storage(addr);
        // Safety: the storage is a valid address of `len` bytes.
        let rt = unsafe { hook::connect(self.fd, (&storage as *const libc::sockaddr_storage).cast(), len) };
        check_rc(rt)
    }

    pub fn connect_with_timeout(&self, addr: &SocketAddr, timeout_ms: u64) -> io::Result<()> {
        let (storage, len) = to_storage(addr);
        // Safety: the storage is a valid address of `len` bytes.
        let rt = unsafe {
            hook::connect_with_timeout(
                self.fd,
                (&storage as *const libc::sockaddr_storage).cast(),
                len,
                timeout_ms,
            )
        };
        check_rc(rt)
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        // Safety: the buffer is live for the call.
        let rt = unsafe { hook::read(self.fd, buf.as_mut_ptr().cast(), buf.len()) };
        check_len(rt)
    }

    pub fn readv(&self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        // Safety: IoSliceMut is ABI-compatible with iovec.
        let rt = unsafe {
            hook::readv(self.fd, bufs.as_mut_ptr().cast::<libc::iovec>(), bufs.len() as libc::c_int)
        };
        check_len(rt)
    }

    pub fn recv(&self, buf: &mut [u8], flags: i32) -> io::Result<usize> {
        // Safety: the buffer is live for the call.
        let rt = unsafe { hook::recv(self.fd, buf.as_mut_ptr().cast(), buf.len(), flags) };
        check_len(rt)
    }

    pub fn recvfrom(&self, buf: &mut [u8], flags: i32) -> io::Result<(usize, SocketAddr)> {
        // Safety: out-parameters point at a live storage/len pair.
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let rt = unsafe {
            hook::recvfrom(
                self.fd,
                buf.as_mut_ptr().cast(),
                buf.len(),
                flags,
                (&mut storage as *mut libc::sockaddr_storage).cast(),
                &mut len,
            )
        };
        let received = check_len(rt)?;
        Ok((received, from_storage(&storage)?))
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        // Safety: the buffer is live for the call.
        let rt = unsafe { hook::write(self.fd, buf.as_ptr().cast(), buf.len()) };
        check_len(rt)
    }

    pub fn writev(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        // Safety: IoSlice is ABI-compatible with iovec.
        let rt = unsafe {
            hook::writev(self.fd, bufs.as_ptr().cast::<libc::iovec>(), bufs.len() as libc::c_int)
        };
        check_len(rt)
    }

    pub fn send(&self, buf: &[u8], flags: i32) -> io::Result<usize> {
        // Safety: the buffer is live for the call.
        let rt = unsafe { hook::send(self.fd, buf.as_ptr().cast(), buf.len(), flags) };
        check_len(rt)
    }

    pub fn sendto(&self, buf: &[u8], addr: &SocketAddr, flags: i32) -> io::Result<usize> {
        let (storage, len) = to_storage(addr);
        // Safety: the buffer and the address are live for the call.
        let rt = unsafe {
            hook::sendto(
                self.fd,
                buf.as_ptr().cast(),
                buf.len(),
                flags,
                (&storage as *const libc::sockaddr_storage).cast(),
                len,
            )
        };
        check_len(rt)
    }

    /// Sets the shim-side receive deadline in milliseconds.
    pub fn set_recv_timeout(&self, timeout_ms: u64) -> io::Result<()> {
        self.set_timeout(libc::SO_RCVTIMEO, timeout_ms)
    }

    /// Sets the shim-side send deadline in milliseconds.
    pub fn set_send_timeout(&self, timeout_ms: u64) -> io::Result<()> {
        self.set_timeout(libc::SO_SNDTIMEO, timeout_ms)
    }

    /// The receive deadline; [`NO_TIMEOUT`] when none is set.
    pub fn recv_timeout(&self) -> io::Result<u64> {
        self.get_timeout(libc::SO_RCVTIMEO)
    }

    /// The send deadline; [`NO_TIMEOUT`] when none is set.
    pub fn send_timeout(&self) -> io::Result<u64> {
        self.get_timeout(libc::SO_SNDTIMEO)
    }

    fn set_timeout(&self, optname: libc::c_int, timeout_ms: u64) -> io::Result<()> {
        let tv = libc::timeval {
            tv_sec: (timeout_ms / 1000) as libc::time_t,
            tv_usec: ((timeout_ms % 1000) * 1000) as libc::suseconds_t,
        };
        // Safety: passing a valid timeval.
        let rt = unsafe {
            hook::setsockopt(
                self.fd,
                libc::SOL_SOCKET,
                optname,
                (&tv as *const libc::timeval).cast(),
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        check_rc(rt)
    }

    fn get_timeout(&self, optname: libc::c_int) -> io::Result<u64> {
        let mut tv = libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        };
        let mut len = std::mem::size_of::<libc::timeval>() as libc::socklen_t;
        // Safety: passing a valid timeval out-buffer.
        let rt = unsafe {
            hook::getsockopt(
                self.fd,
                libc::SOL_SOCKET,
                optname,
                (&mut tv as *mut libc::timeval).cast(),
                &mut len,
            )
        };
        check_rc(rt)?;
        if tv.tv_sec == 0 && tv.tv_usec == 0 {
            return Ok(NO_TIMEOUT);
        }
        Ok(tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000)
    }

    /// Flips the *user-visible* non-blocking mode (the real fd stays
    /// non-blocking under the shim).
    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        let mut value: libc::c_int = libc::c_int::from(nonblocking);
        // Safety: FIONBIO takes an int payload.
        let rt = unsafe {
            hook::ioctl(
                self.fd,
                libc::FIONBIO as libc::c_ulong,
                (&mut value as *mut libc::c_int).cast(),
            )
        };
        check_rc(rt)
    }

    pub fn set_reuse_addr(&self) -> io::Result<()> {
        let value: libc::c_int = 1;
        // Safety: SO_REUSEADDR takes an int payload.
        let rt = unsafe {
            hook::setsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                (&value as *const libc::c_int).cast(),
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        check_rc(rt)
    }

    /// The user-visible flags of the fd, via the shim's `fcntl`.
    pub fn flags(&self) -> io::Result<i32> {
        let flags = hook::fcntl(self.fd, libc::F_GETFL, FcntlArg::None);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(flags)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        // Safety: out-parameters point at a live storage/len pair.
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let rt = unsafe {
            libc::getsockname(
                self.fd,
                (&mut storage as *mut libc::sockaddr_storage).cast(),
                &mut len,
            )
        };
        check_rc(rt)?;
        from_storage(&storage)
    }

    pub fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        check_rc(hook::close(self.fd))
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(error) = self.close() {
                tracing::debug!(target: "server", fd = self.fd, %error, "close on drop failed");
            }
        }
    }
}

fn check_rc(rt: libc::c_int) -> io::Result<()> {
    if rt < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn check_len(rt: libc::ssize_t) -> io::Result<usize> {
    if rt < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(rt as usize)
}

fn to_storage(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    // Safety: an all-zero sockaddr_storage is a valid template.
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = (&mut storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr_in>();
            // Safety: sockaddr_in fits inside sockaddr_storage.
            unsafe {
                (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sin).sin_port = v4.port().to_be();
                (*sin).sin_addr = libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                };
            }
            (storage, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = (&mut storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr_in6>();
            // Safety: sockaddr_in6 fits inside sockaddr_storage.
            unsafe {
                (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sin6).sin6_port = v6.port().to_be();
                (*sin6).sin6_flowinfo = v6.flowinfo();
                (*sin6).sin6_scope_id = v6.scope_id();
                (*sin6).sin6_addr.s6_addr = v6.ip().octets();
            }
            (storage, std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

fn from_storage(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match libc::c_int::from(storage.ss_family) {
        libc::AF_INET => {
            let sin = (storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_in>();
            // Safety: the family says this is a sockaddr_in.
            let sin = unsafe { &*sin };
            Ok(SocketAddr::from((
                sin.sin_addr.s_addr.to_ne_bytes(),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let sin6 = (storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_in6>();
            // Safety: the family says this is a sockaddr_in6.
            let sin6 = unsafe { &*sin6 };
            Ok(SocketAddr::from((
                sin6.sin6_addr.s6_addr,
                u16::from_be(sin6.sin6_port),
            )))
        }
        family => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported address family {family}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_round_trip() {
        for text in ["127.0.0.1:8080", "[::1]:9090"] {
            let addr: SocketAddr = text.parse().unwrap();
            let (storage, _) = to_storage(&addr);
            assert_eq!(from_storage(&storage).unwrap(), addr);
        }
    }

    #[test]
    fn bind_and_local_addr_without_reactor() {
        // Outside async mode the wrapper behaves like plain sockets.
        let socket = Socket::tcp_v4().unwrap();
        socket.set_reuse_addr().unwrap();
        socket.bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
        let local = socket.local_addr().unwrap();
        assert!(local.port() > 0);
        assert!(local.ip().is_loopback());
    }
}
