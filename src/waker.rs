use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// An `eventfd`-backed handle used to break a [`Reactor`](crate::reactor::Reactor)
/// out of a blocking `poll()`/`epoll_wait()` call from another thread.
///
/// Grounded in the teacher crate's own `eventfd`-based `Waker`: a single
/// non-blocking, close-on-exec `eventfd(2)` counter. `wake()` adds `1`;
/// `reset()` drains the counter back to zero so the reactor's wakeup
/// channel goes level-quiet again until the next `wake()`.
pub struct Waker {
    fd: OwnedFd,
}

impl Waker {
    pub fn new() -> io::Result<Waker> {
        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
        Ok(Waker {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn wake(&self) -> io::Result<()> {
        let buf: u64 = 1;
        match syscall!(write(
            self.fd.as_raw_fd(),
            &buf as *const u64 as *const libc::c_void,
            std::mem::size_of::<u64>(),
        )) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                // The counter is saturated; draining and retrying once
                // mirrors the teacher's own eventfd waker.
                self.reset()?;
                self.wake()
            }
            Err(e) => Err(e),
        }
    }

    pub fn reset(&self) -> io::Result<()> {
        let mut buf: u64 = 0;
        match syscall!(read(
            self.fd.as_raw_fd(),
            &mut buf as *mut u64 as *mut libc::c_void,
            std::mem::size_of::<u64>(),
        )) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }
}
