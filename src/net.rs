//! Raw non-blocking sockets and address parsing.

use std::io;
use std::mem::{self, MaybeUninit};
use std::net::{self, SocketAddr};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};
use std::os::unix::io::RawFd;

use crate::error::{Error, Result};

/// A stream socket owned by the caller, non-blocking unless stated
/// otherwise.
///
/// This is the unit a [`SocketTransport`](crate::SocketTransport) is built
/// around: [`accept`](Socket::accept) hands out new `Socket`s and
/// [`SocketTransport::with_socket`](crate::SocketTransport::with_socket)
/// adopts them. Dropping a `Socket` closes the descriptor.
#[derive(Debug)]
pub struct Socket {
    fd: OwnedFd,
}

/// A `sockaddr_in`/`sockaddr_in6` big enough for either family, passable to
/// the socket syscalls by pointer.
#[repr(C)]
union RawAddr {
    v4: libc::sockaddr_in,
    v6: libc::sockaddr_in6,
}

impl RawAddr {
    fn as_ptr(&self) -> *const libc::sockaddr {
        self as *const RawAddr as *const libc::sockaddr
    }
}

fn from_socket_addr(addr: &SocketAddr) -> (RawAddr, libc::socklen_t) {
    match addr {
        SocketAddr::V4(addr) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: addr.port().to_be(),
                sin_addr: libc::in_addr {
                    // The octets are already in network order.
                    s_addr: u32::from_ne_bytes(addr.ip().octets()),
                },
                ..unsafe { mem::zeroed() }
            };
            (
                RawAddr { v4: sin },
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        }
        SocketAddr::V6(addr) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: addr.port().to_be(),
                sin6_addr: libc::in6_addr {
                    s6_addr: addr.ip().octets(),
                },
                sin6_flowinfo: addr.flowinfo(),
                sin6_scope_id: addr.scope_id(),
                ..unsafe { mem::zeroed() }
            };
            (
                RawAddr { v6: sin6 },
                mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        }
    }
}

/// `storage` must hold a `sockaddr_in` or `sockaddr_in6` written by the OS.
unsafe fn to_socket_addr(storage: *const libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match (*storage).ss_family as libc::c_int {
        libc::AF_INET => {
            let addr = &*(storage as *const libc::sockaddr_in);
            let ip = net::Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
            Ok(SocketAddr::V4(net::SocketAddrV4::new(
                ip,
                u16::from_be(addr.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let addr = &*(storage as *const libc::sockaddr_in6);
            let ip = net::Ipv6Addr::from(addr.sin6_addr.s6_addr);
            Ok(SocketAddr::V6(net::SocketAddrV6::new(
                ip,
                u16::from_be(addr.sin6_port),
                addr.sin6_flowinfo,
                addr.sin6_scope_id,
            )))
        }
        _ => Err(io::ErrorKind::InvalidInput.into()),
    }
}

fn new_stream_socket(domain: libc::c_int) -> io::Result<Socket> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    let fd = syscall!(socket(
        domain,
        libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        0,
    ))?;

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let fd = {
        let fd = syscall!(socket(domain, libc::SOCK_STREAM, 0))?;
        syscall!(fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC))
            .and_then(|_| syscall!(fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK)))
            .map_err(|err| {
                let _ = unsafe { libc::close(fd) };
                err
            })?;
        fd
    };

    // macOS has no MSG_NOSIGNAL; suppress SIGPIPE at the socket level.
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        let value: libc::c_int = 1;
        if let Err(err) = syscall!(setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_NOSIGPIPE,
            &value as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )) {
            let _ = unsafe { libc::close(fd) };
            return Err(err);
        }
    }

    // SAFETY: the fd was just created and is owned by no one else.
    Ok(Socket {
        fd: unsafe { OwnedFd::from_raw_fd(fd) },
    })
}

impl Socket {
    /// A fresh non-blocking IPv4 stream socket.
    pub fn stream_v4() -> io::Result<Socket> {
        new_stream_socket(libc::AF_INET)
    }

    /// A fresh non-blocking IPv6 stream socket.
    pub fn stream_v6() -> io::Result<Socket> {
        new_stream_socket(libc::AF_INET6)
    }

    /// A fresh non-blocking stream socket matching the family of `addr`.
    pub fn stream_for(addr: &SocketAddr) -> io::Result<Socket> {
        match addr {
            SocketAddr::V4(..) => Socket::stream_v4(),
            SocketAddr::V6(..) => Socket::stream_v6(),
        }
    }

    pub fn bind(&self, addr: SocketAddr) -> io::Result<()> {
        let (raw_addr, raw_len) = from_socket_addr(&addr);
        syscall!(bind(self.as_raw_fd(), raw_addr.as_ptr(), raw_len)).map(|_| ())
    }

    pub fn listen(&self, backlog: u32) -> io::Result<()> {
        let backlog = backlog.min(libc::c_int::MAX as u32) as libc::c_int;
        syscall!(listen(self.as_raw_fd(), backlog)).map(|_| ())
    }

    /// Initiate a connect. `EINPROGRESS` propagates to the caller; the
    /// transport layer interprets it as connect-in-progress.
    pub fn connect(&self, addr: SocketAddr) -> io::Result<()> {
        let (raw_addr, raw_len) = from_socket_addr(&addr);
        syscall!(connect(self.as_raw_fd(), raw_addr.as_ptr(), raw_len)).map(|_| ())
    }

    /// Accept one pending connection. Would-block propagates; the new socket
    /// is non-blocking and close-on-exec.
    pub fn accept(&self) -> io::Result<(Socket, SocketAddr)> {
        let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::uninit();
        let mut length = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

        #[cfg(any(target_os = "linux", target_os = "android"))]
        let fd = syscall!(accept4(
            self.as_raw_fd(),
            storage.as_mut_ptr() as *mut libc::sockaddr,
            &mut length,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        ))?;

        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        let fd = {
            let fd = syscall!(accept(
                self.as_raw_fd(),
                storage.as_mut_ptr() as *mut libc::sockaddr,
                &mut length,
            ))?;
            syscall!(fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC))
                .and_then(|_| syscall!(fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK)))
                .map_err(|err| {
                    let _ = unsafe { libc::close(fd) };
                    err
                })?;
            fd
        };

        // SAFETY: accept wrote a valid address of `length` bytes; the fd is
        // fresh and unowned.
        let addr = unsafe { to_socket_addr(storage.as_ptr())? };
        Ok((
            Socket {
                fd: unsafe { OwnedFd::from_raw_fd(fd) },
            },
            addr,
        ))
    }

    pub fn send(&self, buf: &[u8], flags: libc::c_int) -> io::Result<usize> {
        // Broken pipes must come back as EPIPE, not as a SIGPIPE.
        #[cfg(not(any(target_os = "macos", target_os = "ios")))]
        let flags = flags | libc::MSG_NOSIGNAL;

        syscall!(send(
            self.as_raw_fd(),
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            flags,
        ))
        .map(|n| n as usize)
    }

    pub fn recv(&self, buf: &mut [u8], flags: libc::c_int) -> io::Result<usize> {
        syscall!(recv(
            self.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            flags,
        ))
        .map(|n| n as usize)
    }

    /// `recv` with `MSG_PEEK`: data stays queued.
    pub fn peek(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.recv(buf, libc::MSG_PEEK)
    }

    /// Take the pending socket error (`SO_ERROR`), if any.
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        let mut raw: libc::c_int = 0;
        let mut length = mem::size_of::<libc::c_int>() as libc::socklen_t;
        syscall!(getsockopt(
            self.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut raw as *mut _ as *mut libc::c_void,
            &mut length,
        ))?;
        if raw == 0 {
            Ok(None)
        } else {
            Ok(Some(io::Error::from_raw_os_error(raw)))
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::uninit();
        let mut length = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        syscall!(getsockname(
            self.as_raw_fd(),
            storage.as_mut_ptr() as *mut libc::sockaddr,
            &mut length,
        ))?;
        unsafe { to_socket_addr(storage.as_ptr()) }
    }

    /// Whether the socket has a peer, regardless of address family.
    /// `ENOTCONN` (and `EINVAL` on some platforms) is the non-erroneous
    /// "not yet connected" answer.
    pub fn is_connected(&self) -> io::Result<bool> {
        let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::uninit();
        let mut length = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        match syscall!(getpeername(
            self.as_raw_fd(),
            storage.as_mut_ptr() as *mut libc::sockaddr,
            &mut length,
        )) {
            Ok(_) => Ok(true),
            Err(ref err)
                if matches!(
                    err.raw_os_error(),
                    Some(libc::ENOTCONN) | Some(libc::EINVAL)
                ) =>
            {
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::uninit();
        let mut length = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        syscall!(getpeername(
            self.as_raw_fd(),
            storage.as_mut_ptr() as *mut libc::sockaddr,
            &mut length,
        ))?;
        unsafe { to_socket_addr(storage.as_ptr()) }
    }

    pub fn set_reuseaddr(&self, reuse: bool) -> io::Result<()> {
        let value: libc::c_int = i32::from(reuse);
        syscall!(setsockopt(
            self.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &value as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        ))
        .map(|_| ())
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        let flags = syscall!(fcntl(self.as_raw_fd(), libc::F_GETFL))?;
        let flags = if nonblocking {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        syscall!(fcntl(self.as_raw_fd(), libc::F_SETFL, flags)).map(|_| ())
    }

    pub fn shutdown(&self, how: net::Shutdown) -> io::Result<()> {
        let how = match how {
            net::Shutdown::Read => libc::SHUT_RD,
            net::Shutdown::Write => libc::SHUT_WR,
            net::Shutdown::Both => libc::SHUT_RDWR,
        };
        syscall!(shutdown(self.as_raw_fd(), how)).map(|_| ())
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl FromRawFd for Socket {
    /// SAFETY: the caller must own `fd` and hand over that ownership.
    unsafe fn from_raw_fd(fd: RawFd) -> Socket {
        Socket {
            fd: OwnedFd::from_raw_fd(fd),
        }
    }
}

impl IntoRawFd for Socket {
    fn into_raw_fd(self) -> RawFd {
        self.fd.into_raw_fd()
    }
}

/// A connected bidirectional local pair, usable as a wake-up channel.
///
/// The pair is intentionally *blocking*: the interrupt handshake relies on
/// blocking reads of single control bytes.
pub fn socket_pair() -> io::Result<(Socket, Socket)> {
    let mut fds: [libc::c_int; 2] = [0; 2];
    syscall!(socketpair(
        libc::AF_UNIX,
        libc::SOCK_STREAM,
        0,
        fds.as_mut_ptr(),
    ))?;
    for &fd in &fds {
        if let Err(err) = syscall!(fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC)) {
            for &fd in &fds {
                let _ = unsafe { libc::close(fd) };
            }
            return Err(err);
        }
    }
    // SAFETY: both fds are fresh and unowned.
    unsafe {
        Ok((
            Socket::from_raw_fd(fds[0]),
            Socket::from_raw_fd(fds[1]),
        ))
    }
}

/// Split an IPv4 endpoint string into host and port.
///
/// `HOST` yields `default_port`; `HOST:PORT` yields the explicit port. More
/// than one colon is malformed here (use [`parse_ip`], which dispatches to
/// the IPv6 parser instead).
pub fn parse_ipv4(input: &str, default_port: u16) -> Result<(&str, u16)> {
    let mut split = input.splitn(2, ':');
    let host = split.next().unwrap_or("");
    match split.next() {
        None => Ok((input, default_port)),
        Some(port) if !port.contains(':') => {
            let port = port
                .parse()
                .map_err(|_| Error::MalformedAddress(input.to_owned()))?;
            Ok((host, port))
        }
        Some(_) => Err(Error::MalformedAddress(input.to_owned())),
    }
}

/// Split an IPv6 endpoint string into host and port.
///
/// `HOST` (no brackets) yields `default_port`; `[HOST]` likewise;
/// `[HOST]:PORT` yields the explicit port. Unbalanced brackets are
/// malformed.
pub fn parse_ipv6(input: &str, default_port: u16) -> Result<(&str, u16)> {
    let has_open = input.starts_with('[');
    let has_close = input.contains(']');
    match (has_open, has_close) {
        (false, false) => Ok((input, default_port)),
        (true, true) => {
            let inner = &input[1..];
            match inner.split_once("]:") {
                Some((host, port)) => {
                    let port = port
                        .parse()
                        .map_err(|_| Error::MalformedAddress(input.to_owned()))?;
                    Ok((host, port))
                }
                None if input.ends_with(']') => Ok((&input[1..input.len() - 1], default_port)),
                None => Err(Error::MalformedAddress(input.to_owned())),
            }
        }
        _ => Err(Error::MalformedAddress(input.to_owned())),
    }
}

/// Split an endpoint string into host and port, auto-detecting the family.
///
/// More than one colon selects IPv6 parsing, otherwise IPv4. When no port is
/// present `default_port` is substituted.
///
/// ```
/// use evio::parse_ip;
///
/// assert_eq!(parse_ip("127.0.0.1:1234", 0).unwrap(), ("127.0.0.1", 1234));
/// assert_eq!(
///     parse_ip("[2001:db8::1]:443", 0).unwrap(),
///     ("2001:db8::1", 443)
/// );
/// assert_eq!(parse_ip("localhost", 80).unwrap(), ("localhost", 80));
/// ```
pub fn parse_ip(input: &str, default_port: u16) -> Result<(&str, u16)> {
    if input.matches(':').count() > 1 {
        parse_ipv6(input, default_port)
    } else {
        parse_ipv4(input, default_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ipv4_with_and_without_port() {
        assert_eq!(parse_ip("10.0.0.1:80", 1).unwrap(), ("10.0.0.1", 80));
        assert_eq!(parse_ip("10.0.0.1", 7).unwrap(), ("10.0.0.1", 7));
    }

    #[test]
    fn parses_ipv6_variants() {
        assert_eq!(parse_ip("::1", 9).unwrap(), ("::1", 9));
        assert_eq!(parse_ip("[::1]", 9).unwrap(), ("::1", 9));
        assert_eq!(parse_ip("[2001:db8::2]:443", 9).unwrap(), ("2001:db8::2", 443));
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert!(parse_ip("1.2.3.4:x", 0).is_err());
        assert!(parse_ipv6("[::1", 0).is_err());
        assert!(parse_ipv6("::1]", 0).is_err());
        assert!(parse_ipv4("1:2:3", 0).is_err());
    }

    #[test]
    fn socket_pair_is_bidirectional() {
        let (a, b) = socket_pair().unwrap();
        a.send(b"x", 0).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(b.recv(&mut buf, 0).unwrap(), 1);
        b.send(b"y", 0).unwrap();
        assert_eq!(a.recv(&mut buf, 0).unwrap(), 1);
        assert_eq!(&buf, b"y");
    }
}
