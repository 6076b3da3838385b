//! Non-blocking TCP sockets driven by the reactor
//!
//! Every operation is attempted first; on `WouldBlock` the task parks on the
//! reactor until the descriptor is ready and then retries.

use std::io::{self, Read, Write};
use std::mem;
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use strand_core::{Handle, Interest};

/// Listening socket
#[derive(Debug)]
pub struct TcpListener {
    inner: std::net::TcpListener,
    handle: Handle,
}

impl TcpListener {
    /// Bind to `addr` on `handle`'s reactor
    pub fn bind(handle: &Handle, addr: impl ToSocketAddrs) -> io::Result<Self> {
        let inner = std::net::TcpListener::bind(addr)?;
        inner.set_nonblocking(true)?;
        Ok(Self {
            inner,
            handle: handle.clone(),
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Wait for the next incoming connection
    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        loop {
            match self.inner.accept() {
                Ok((stream, peer)) => {
                    stream.set_nonblocking(true)?;
                    return Ok((TcpStream::from_std(stream, &self.handle), peer));
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.handle.ready(self.as_raw_fd(), Interest::READ).await;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
    }
}

impl AsRawFd for TcpListener {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

/// Connected stream
#[derive(Debug)]
pub struct TcpStream {
    inner: std::net::TcpStream,
    handle: Handle,
}

impl TcpStream {
    fn from_std(inner: std::net::TcpStream, handle: &Handle) -> Self {
        Self {
            inner,
            handle: handle.clone(),
        }
    }

    /// Connect to `addr` without blocking the worker
    pub async fn connect(handle: &Handle, addr: SocketAddr) -> io::Result<TcpStream> {
        let fd = nonblocking_socket(&addr)?;
        // SAFETY: `fd` is a fresh socket nobody else owns; the std stream
        // closes it on every path from here on
        let stream = unsafe { std::net::TcpStream::from_raw_fd(fd) };

        let (storage, len) = raw_socket_addr(&addr);
        // SAFETY: `storage` holds a sockaddr of `len` bytes matching the family
        let rc = unsafe {
            libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len)
        };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINPROGRESS) {
                return Err(err);
            }
            handle.ready(fd, Interest::WRITE).await;
            if let Some(err) = stream.take_error()? {
                return Err(err);
            }
        }
        tracing::trace!(%addr, "connected");
        Ok(Self::from_std(stream, handle))
    }

    /// Local address
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Remote address
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }

    /// Read whatever is available (at least one byte unless the peer closed)
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match (&self.inner).read(buf) {
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.handle.ready(self.as_raw_fd(), Interest::READ).await;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                result => return result,
            }
        }
    }

    /// Write as much of `buf` as the socket takes
    pub async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match (&self.inner).write(buf) {
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.handle.ready(self.as_raw_fd(), Interest::WRITE).await;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                result => return result,
            }
        }
    }

    /// Fill `buf` completely; `UnexpectedEof` if the peer closes first
    pub async fn read_all(&self, buf: &mut [u8]) -> io::Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read(&mut buf[filled..]).await? {
                0 => return Err(io::ErrorKind::UnexpectedEof.into()),
                n => filled += n,
            }
        }
        Ok(())
    }

    /// Write all of `buf`
    pub async fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let mut written = 0;
        while written < buf.len() {
            match self.write(&buf[written..]).await? {
                0 => return Err(io::ErrorKind::WriteZero.into()),
                n => written += n,
            }
        }
        Ok(())
    }

    /// Shut down one or both directions
    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        self.inner.shutdown(how)
    }
}

impl AsRawFd for TcpStream {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

fn nonblocking_socket(addr: &SocketAddr) -> io::Result<RawFd> {
    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    // SAFETY: plain syscall, no pointers
    let fd = unsafe { libc::socket(family, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let configure = || -> io::Result<()> {
        // SAFETY: `fd` is a valid descriptor we own
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                return Err(io::Error::last_os_error());
            }
            let fd_flags = libc::fcntl(fd, libc::F_GETFD);
            if fd_flags < 0 || libc::fcntl(fd, libc::F_SETFD, fd_flags | libc::FD_CLOEXEC) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    };
    if let Err(err) = configure() {
        // SAFETY: closing the descriptor created above
        unsafe { libc::close(fd) };
        return Err(err);
    }
    Ok(fd)
}

fn raw_socket_addr(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    // SAFETY: all-zero is a valid sockaddr_storage
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            // SAFETY: sockaddr_storage is large and aligned enough for sockaddr_in
            let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(v4.ip().octets()),
            };
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            // SAFETY: as above, for sockaddr_in6
            let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_flowinfo = v6.flowinfo();
            sin6.sin6_addr = libc::in6_addr {
                s6_addr: v6.ip().octets(),
            };
            sin6.sin6_scope_id = v6.scope_id();
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV6};

    #[test]
    fn test_raw_v4_addr() {
        let addr = SocketAddr::from((Ipv4Addr::new(127, 0, 0, 1), 8080));
        let (storage, len) = raw_socket_addr(&addr);
        assert_eq!(len as usize, mem::size_of::<libc::sockaddr_in>());
        // SAFETY: written as sockaddr_in above
        let sin = unsafe { &*(&storage as *const _ as *const libc::sockaddr_in) };
        assert_eq!(sin.sin_family as i32, libc::AF_INET);
        assert_eq!(u16::from_be(sin.sin_port), 8080);
        assert_eq!(sin.sin_addr.s_addr.to_ne_bytes(), [127, 0, 0, 1]);
    }

    #[test]
    fn test_raw_v6_addr() {
        let addr = SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::LOCALHOST, 9, 0, 0));
        let (storage, len) = raw_socket_addr(&addr);
        assert_eq!(len as usize, mem::size_of::<libc::sockaddr_in6>());
        // SAFETY: written as sockaddr_in6 above
        let sin6 = unsafe { &*(&storage as *const _ as *const libc::sockaddr_in6) };
        assert_eq!(u16::from_be(sin6.sin6_port), 9);
        assert_eq!(sin6.sin6_addr.s6_addr, Ipv6Addr::LOCALHOST.octets());
    }

    #[test]
    fn test_nonblocking_socket_flags() {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
        let fd = nonblocking_socket(&addr).unwrap();
        // SAFETY: querying and closing our own descriptor
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        assert_ne!(flags & libc::O_NONBLOCK, 0);
        unsafe { libc::close(fd) };
    }
}
