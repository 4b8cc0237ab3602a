//! Raw socket plumbing
//!
//! libc-level socket creation, option setting, and sockaddr handling.
//! Everything here is synchronous and non-blocking-safe; the async I/O
//! on these descriptors goes through the ring engine.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::io::RawFd;

use ringsock_core::{SockError, SockResult};

fn last_errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

/// Create a TCP socket for the address family, CLOEXEC + NODELAY.
pub fn tcp_socket(addr: &SocketAddr) -> SockResult<RawFd> {
    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = unsafe { libc::socket(family, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(SockError::from_errno(last_errno()));
    }
    set_nodelay(fd);
    Ok(fd)
}

/// TCP_NODELAY. Best effort; a failure only costs latency.
pub fn set_nodelay(fd: RawFd) {
    unsafe {
        let opt: libc::c_int = 1;
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &opt as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

/// Create, configure, bind, and listen. Returns the listening fd.
pub fn listener_socket(addr: &SocketAddr, backlog: u32) -> SockResult<RawFd> {
    let fd = tcp_socket(addr)?;

    // SO_REUSEADDR + SO_REUSEPORT
    unsafe {
        let opt: libc::c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &opt as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            &opt as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }

    let encoded = encode_sockaddr(addr);
    let ret = unsafe {
        libc::bind(
            fd,
            encoded.as_ptr() as *const libc::sockaddr,
            encoded.len() as libc::socklen_t,
        )
    };
    if ret != 0 {
        let errno = last_errno();
        close_fd(fd);
        return Err(SockError::from_errno(errno));
    }

    let ret = unsafe { libc::listen(fd, backlog.min(i32::MAX as u32) as libc::c_int) };
    if ret != 0 {
        let errno = last_errno();
        close_fd(fd);
        return Err(SockError::from_errno(errno));
    }

    Ok(fd)
}

/// Encode a `SocketAddr` into the raw bytes a connect/bind SQE points at.
pub fn encode_sockaddr(addr: &SocketAddr) -> Vec<u8> {
    match addr {
        SocketAddr::V4(v4) => {
            let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            let bytes = unsafe {
                std::slice::from_raw_parts(
                    &sin as *const _ as *const u8,
                    std::mem::size_of::<libc::sockaddr_in>(),
                )
            };
            bytes.to_vec()
        }
        SocketAddr::V6(v6) => {
            let mut sin6: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_addr.s6_addr = v6.ip().octets();
            sin6.sin6_scope_id = v6.scope_id();
            let bytes = unsafe {
                std::slice::from_raw_parts(
                    &sin6 as *const _ as *const u8,
                    std::mem::size_of::<libc::sockaddr_in6>(),
                )
            };
            bytes.to_vec()
        }
    }
}

fn decode_sockaddr(storage: &libc::sockaddr_storage) -> SockResult<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Ok(SocketAddr::new(IpAddr::V4(ip), u16::from_be(sin.sin_port)))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Ok(SocketAddr::new(IpAddr::V6(ip), u16::from_be(sin6.sin6_port)))
        }
        other => Err(SockError::Configuration(format!(
            "unexpected address family {}",
            other
        ))),
    }
}

/// The locally bound address of `fd`.
pub fn local_addr(fd: RawFd) -> SockResult<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockname(
            fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        )
    };
    if ret != 0 {
        return Err(SockError::from_errno(last_errno()));
    }
    decode_sockaddr(&storage)
}

/// The peer address of a connected `fd`.
pub fn peer_addr(fd: RawFd) -> SockResult<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let ret = unsafe {
        libc::getpeername(
            fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        )
    };
    if ret != 0 {
        return Err(SockError::from_errno(last_errno()));
    }
    decode_sockaddr(&storage)
}

/// The kernel's receive buffer size (SO_RCVBUF) for `fd`.
pub fn recv_buffer_size(fd: RawFd) -> SockResult<usize> {
    let mut size: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &mut size as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if ret != 0 {
        return Err(SockError::from_errno(last_errno()));
    }
    Ok(size.max(1) as usize)
}

/// Synchronous close, for error paths and Drop.
pub fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}
