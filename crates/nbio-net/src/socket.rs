//! Socket plumbing
//!
//! Conversions between `std::net::SocketAddrV4` and `libc::sockaddr_in`,
//! plus the socket option helpers the transport needs. Everything here
//! is IPv4/TCP; that is the only address family the transport speaks.

use crate::error::{NetError, NetResult};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::io::RawFd;

/// Local/remote endpoint pair for an outbound connection.
///
/// The local endpoint is bound before `connect`; `0.0.0.0:0` leaves the
/// choice to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketAddress {
    local: SocketAddrV4,
    remote: SocketAddrV4,
}

impl SocketAddress {
    /// Connect to `remote` from a kernel-chosen local endpoint.
    pub fn to(remote: SocketAddrV4) -> Self {
        Self {
            local: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
            remote,
        }
    }

    /// Connect to `remote` from an explicit local endpoint.
    pub fn new(local: SocketAddrV4, remote: SocketAddrV4) -> Self {
        Self { local, remote }
    }

    #[inline]
    pub fn local(&self) -> SocketAddrV4 {
        self.local
    }

    #[inline]
    pub fn remote(&self) -> SocketAddrV4 {
        self.remote
    }
}

/// Last errno.
#[inline]
pub(crate) fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

pub(crate) fn sockaddr_in(addr: SocketAddrV4) -> libc::sockaddr_in {
    let mut raw: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    raw.sin_family = libc::AF_INET as libc::sa_family_t;
    raw.sin_port = addr.port().to_be();
    raw.sin_addr.s_addr = u32::from(*addr.ip()).to_be();
    raw
}

pub(crate) fn sockaddr_v4_from(raw: &libc::sockaddr_in) -> SocketAddrV4 {
    SocketAddrV4::new(
        Ipv4Addr::from(u32::from_be(raw.sin_addr.s_addr)),
        u16::from_be(raw.sin_port),
    )
}

/// Create a non-blocking TCP socket.
pub fn nonblocking_stream_socket() -> NetResult<RawFd> {
    let fd = unsafe {
        libc::socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(NetError::Io(errno()));
    }
    Ok(fd)
}

pub fn set_reuse_addr(fd: RawFd, enable: bool) -> NetResult<()> {
    let opt: libc::c_int = enable as libc::c_int;
    set_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, opt)
}

pub fn set_nodelay(fd: RawFd, enable: bool) -> NetResult<()> {
    let opt: libc::c_int = enable as libc::c_int;
    set_opt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, opt)
}

/// Size both the send and receive buffers.
pub fn set_window(fd: RawFd, bytes: usize) -> NetResult<()> {
    let opt = bytes as libc::c_int;
    set_opt(fd, libc::SOL_SOCKET, libc::SO_SNDBUF, opt)?;
    set_opt(fd, libc::SOL_SOCKET, libc::SO_RCVBUF, opt)
}

fn set_opt(fd: RawFd, level: libc::c_int, name: libc::c_int, opt: libc::c_int) -> NetResult<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &opt as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(NetError::Io(errno()));
    }
    Ok(())
}

pub fn bind_fd(fd: RawFd, addr: SocketAddrV4) -> NetResult<()> {
    let raw = sockaddr_in(addr);
    let rc = unsafe {
        libc::bind(
            fd,
            &raw as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(NetError::Io(errno()));
    }
    Ok(())
}

/// The address the fd is bound to (getsockname).
pub fn local_addr_of(fd: RawFd) -> NetResult<SocketAddrV4> {
    let mut raw: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockname(fd, &mut raw as *mut _ as *mut libc::sockaddr, &mut len)
    };
    if rc != 0 {
        return Err(NetError::Io(errno()));
    }
    Ok(sockaddr_v4_from(&raw))
}

/// Fetch and clear the pending socket error (SO_ERROR).
pub fn take_socket_error(fd: RawFd) -> NetResult<i32> {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(NetError::Io(errno()));
    }
    Ok(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sockaddr_round_trip() {
        let addr: SocketAddrV4 = "192.168.1.10:8080".parse().unwrap();
        let raw = sockaddr_in(addr);
        assert_eq!(sockaddr_v4_from(&raw), addr);
    }

    #[test]
    fn test_socket_address_defaults() {
        let remote: SocketAddrV4 = "127.0.0.1:9000".parse().unwrap();
        let sa = SocketAddress::to(remote);
        assert_eq!(sa.remote(), remote);
        assert_eq!(sa.local().port(), 0);
        assert_eq!(*sa.local().ip(), Ipv4Addr::UNSPECIFIED);
    }

    #[test]
    fn test_bind_and_getsockname() {
        let fd = nonblocking_stream_socket().unwrap();
        bind_fd(fd, "127.0.0.1:0".parse().unwrap()).unwrap();
        let bound = local_addr_of(fd).unwrap();
        assert_eq!(*bound.ip(), Ipv4Addr::new(127, 0, 0, 1));
        assert_ne!(bound.port(), 0);
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_socket_options_apply() {
        let fd = nonblocking_stream_socket().unwrap();
        set_reuse_addr(fd, true).unwrap();
        set_nodelay(fd, true).unwrap();
        set_window(fd, 64 * 1024).unwrap();
        unsafe { libc::close(fd) };
    }
}
