// src/syscalls.rs
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::Instant;

use libc::{c_int, c_void, socklen_t};

use crate::error::{RavelError, RavelResult};

/// Create a non-blocking TCP listener bound to `addr`.
pub fn create_listen_socket(addr: &str) -> RavelResult<RawFd> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|_| RavelError::Addr(addr.to_string()))?;

    let domain = if addr.is_ipv6() {
        libc::AF_INET6
    } else {
        libc::AF_INET
    };

    unsafe {
        #[cfg(target_os = "linux")]
        let fd = libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0);
        #[cfg(not(target_os = "linux"))]
        let fd = libc::socket(domain, libc::SOCK_STREAM, 0);

        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        #[cfg(not(target_os = "linux"))]
        if let Err(e) = set_nonblocking(fd) {
            libc::close(fd);
            return Err(e.into());
        }

        let one: c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        if let Err(e) = bind_addr(fd, &addr) {
            libc::close(fd);
            return Err(e.into());
        }

        if libc::listen(fd, libc::SOMAXCONN) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        Ok(fd)
    }
}

fn bind_addr(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    unsafe {
        match addr {
            SocketAddr::V4(a) => {
                let sin = libc::sockaddr_in {
                    #[cfg(any(target_os = "macos", target_os = "freebsd"))]
                    sin_len: mem::size_of::<libc::sockaddr_in>() as u8,
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: a.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(a.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                if libc::bind(
                    fd,
                    &sin as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin) as socklen_t,
                ) < 0
                {
                    return Err(io::Error::last_os_error());
                }
            }
            SocketAddr::V6(a) => {
                let sin6 = libc::sockaddr_in6 {
                    #[cfg(any(target_os = "macos", target_os = "freebsd"))]
                    sin6_len: mem::size_of::<libc::sockaddr_in6>() as u8,
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: a.port().to_be(),
                    sin6_flowinfo: a.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: a.ip().octets(),
                    },
                    sin6_scope_id: a.scope_id(),
                };
                if libc::bind(
                    fd,
                    &sin6 as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin6) as socklen_t,
                ) < 0
                {
                    return Err(io::Error::last_os_error());
                }
            }
        }
        Ok(())
    }
}

/// Accept one pending connection. `Ok(None)` means the accept queue is
/// drained (would block).
pub fn accept_connection(listen_fd: RawFd) -> RavelResult<Option<RawFd>> {
    #[cfg(target_os = "linux")]
    unsafe {
        let fd = libc::accept4(
            listen_fd,
            ptr::null_mut(),
            ptr::null_mut(),
            libc::SOCK_NONBLOCK,
        );

        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else {
            Ok(Some(fd))
        }
    }

    #[cfg(not(target_os = "linux"))]
    unsafe {
        let fd = libc::accept(listen_fd, ptr::null_mut(), ptr::null_mut());

        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else {
            if let Err(e) = set_nonblocking(fd) {
                libc::close(fd);
                return Err(e.into());
            }
            Ok(Some(fd))
        }
    }
}

pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Apply the per-connection socket options the engine expects: Nagle off,
/// TCP keepalive on with a 30 s first-probe delay. Option failures are not
/// fatal for the connection.
pub fn set_client_socket_opts(fd: RawFd, keepalive_delay_secs: c_int) {
    unsafe {
        let one: c_int = 1;
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        );

        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        );

        #[cfg(target_os = "linux")]
        let keepidle_opt = libc::TCP_KEEPIDLE;
        // macOS spells the first-probe delay TCP_KEEPALIVE (0x10)
        #[cfg(target_os = "macos")]
        let keepidle_opt = 0x10;
        #[cfg(not(any(target_os = "linux", target_os = "macos")))]
        let keepidle_opt = libc::TCP_KEEPIDLE;

        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            keepidle_opt,
            &keepalive_delay_secs as *const _ as *const c_void,
            mem::size_of_val(&keepalive_delay_secs) as socklen_t,
        );
    }
}

/// Read from a non-blocking fd. `Ok(0)` is EOF; a would-block condition
/// surfaces as `ErrorKind::WouldBlock`.
pub fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    unsafe {
        let res = libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len());
        if res < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(res as usize)
        }
    }
}

/// Write to a non-blocking fd. A would-block condition surfaces as
/// `ErrorKind::WouldBlock`.
pub fn write_fd(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    unsafe {
        let res = libc::write(fd, buf.as_ptr() as *const c_void, buf.len());
        if res < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(res as usize)
        }
    }
}

/// Write the whole buffer, retrying on partial writes and EAGAIN until the
/// deadline passes. Simplified back-pressure: the proper refinement is to
/// re-register for write readiness and resume from the stored offset.
pub fn write_full(fd: RawFd, buf: &[u8], deadline: Option<Instant>) -> io::Result<()> {
    let mut written = 0;
    while written < buf.len() {
        match write_fd(fd, &buf[written..]) {
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if let Some(d) = deadline {
                    if Instant::now() >= d {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "write timed out",
                        ));
                    }
                }
                std::thread::yield_now();
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

pub fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// Local address of a bound socket, for port-0 binds.
pub fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;

        if libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) < 0 {
            return Err(io::Error::last_os_error());
        }

        match storage.ss_family as c_int {
            libc::AF_INET => {
                let sin: &libc::sockaddr_in = &*(&storage as *const _ as *const libc::sockaddr_in);
                let ip = std::net::Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr).to_be_bytes());
                Ok(SocketAddr::new(ip.into(), u16::from_be(sin.sin_port)))
            }
            libc::AF_INET6 => {
                let sin6: &libc::sockaddr_in6 =
                    &*(&storage as *const _ as *const libc::sockaddr_in6);
                let ip = std::net::Ipv6Addr::from(sin6.sin6_addr.s6_addr);
                Ok(SocketAddr::new(ip.into(), u16::from_be(sin6.sin6_port)))
            }
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected address family {}", other),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listen_and_accept_drained() {
        let fd = create_listen_socket("127.0.0.1:0").unwrap();
        // Nothing queued: accept must report would-block as None.
        assert!(accept_connection(fd).unwrap().is_none());
        close_fd(fd);
    }

    #[test]
    fn test_bad_address() {
        assert!(matches!(
            create_listen_socket("not-an-address"),
            Err(RavelError::Addr(_))
        ));
    }
}
