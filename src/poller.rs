// src/poller.rs
//
// Readiness multiplexer over non-blocking descriptors: epoll on Linux,
// kqueue on macOS/BSD. Interest is read + peer-hangup, level-triggered, so
// a descriptor keeps reporting ready while unread data remains.

use std::io;
use std::os::unix::io::RawFd;

/// Number of event slots fetched per wait call.
pub const EVENT_BATCH: usize = 1024;

#[cfg(target_os = "linux")]
pub use linux_impl::Poller;

#[cfg(target_os = "linux")]
mod linux_impl {
    use super::*;

    pub struct Poller {
        epfd: RawFd,
    }

    impl Poller {
        pub fn new() -> io::Result<Self> {
            unsafe {
                let epfd = libc::epoll_create1(0);
                if epfd < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(Self { epfd })
            }
        }

        /// Register `fd` for read readiness and peer hangup. Re-adding an
        /// already-registered fd with the same interest is not an error.
        pub fn add(&self, fd: RawFd) -> io::Result<()> {
            let mut event = libc::epoll_event {
                events: (libc::EPOLLIN | libc::EPOLLRDHUP) as u32,
                u64: fd as u64,
            };

            unsafe {
                if libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut event) < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::EEXIST) {
                        return Ok(());
                    }
                    return Err(err);
                }
            }
            Ok(())
        }

        pub fn remove(&self, fd: RawFd) -> io::Result<()> {
            unsafe {
                if libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) < 0 {
                    let err = io::Error::last_os_error();
                    // Already gone: treat as removed.
                    if err.raw_os_error() != Some(libc::ENOENT) {
                        return Err(err);
                    }
                }
            }
            Ok(())
        }

        /// Collect ready fds into `ready`. A negative timeout blocks
        /// indefinitely. EINTR and timeouts both yield an empty set.
        pub fn wait(&self, ready: &mut Vec<RawFd>, timeout_ms: i32) -> io::Result<()> {
            ready.clear();

            let mut events: [libc::epoll_event; EVENT_BATCH] =
                unsafe { std::mem::zeroed() };

            unsafe {
                let n = libc::epoll_wait(
                    self.epfd,
                    events.as_mut_ptr(),
                    EVENT_BATCH as libc::c_int,
                    timeout_ms,
                );

                if n < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::EINTR) {
                        return Ok(());
                    }
                    return Err(err);
                }

                for ev in events.iter().take(n as usize) {
                    ready.push(ev.u64 as RawFd);
                }
            }
            Ok(())
        }
    }

    impl Drop for Poller {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.epfd);
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub use kqueue_impl::Poller;

#[cfg(not(target_os = "linux"))]
mod kqueue_impl {
    use super::*;
    use libc::{kevent, kqueue, timespec, EVFILT_READ, EV_ADD, EV_DELETE, EV_ENABLE};

    pub struct Poller {
        kq: RawFd,
    }

    impl Poller {
        pub fn new() -> io::Result<Self> {
            unsafe {
                let kq = kqueue();
                if kq < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(Self { kq })
            }
        }

        // Level-triggered on kqueue means plain EV_ADD with no EV_CLEAR.
        pub fn add(&self, fd: RawFd) -> io::Result<()> {
            self.change(fd, EV_ADD | EV_ENABLE)
        }

        pub fn remove(&self, fd: RawFd) -> io::Result<()> {
            // Deleting a filter that was never added reports ENOENT; the fd
            // is gone either way.
            let _ = self.change(fd, EV_DELETE);
            Ok(())
        }

        fn change(&self, fd: RawFd, flags: u16) -> io::Result<()> {
            let change = kevent {
                ident: fd as usize,
                filter: EVFILT_READ,
                flags,
                fflags: 0,
                data: 0,
                udata: std::ptr::null_mut(),
            };

            unsafe {
                if libc::kevent(self.kq, &change, 1, std::ptr::null_mut(), 0, std::ptr::null())
                    < 0
                {
                    return Err(io::Error::last_os_error());
                }
            }
            Ok(())
        }

        pub fn wait(&self, ready: &mut Vec<RawFd>, timeout_ms: i32) -> io::Result<()> {
            ready.clear();

            let mut events: [kevent; EVENT_BATCH] = unsafe { std::mem::zeroed() };

            let ts = if timeout_ms >= 0 {
                Some(timespec {
                    tv_sec: (timeout_ms / 1000) as libc::time_t,
                    tv_nsec: ((timeout_ms % 1000) * 1_000_000) as libc::c_long,
                })
            } else {
                None
            };
            let ts_ptr = ts
                .as_ref()
                .map(|t| t as *const timespec)
                .unwrap_or(std::ptr::null());

            unsafe {
                let n = libc::kevent(
                    self.kq,
                    std::ptr::null(),
                    0,
                    events.as_mut_ptr(),
                    EVENT_BATCH as libc::c_int,
                    ts_ptr,
                );

                if n < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::EINTR) {
                        return Ok(());
                    }
                    return Err(err);
                }

                for ev in events.iter().take(n as usize) {
                    ready.push(ev.ident as RawFd);
                }
            }
            Ok(())
        }
    }

    impl Drop for Poller {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.kq);
            }
        }
    }
}
