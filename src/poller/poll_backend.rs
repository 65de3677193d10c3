use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::time::Duration;

use log::trace;

use crate::channel::SharedChannel;
use crate::interest::Interest;
use crate::timestamp::Timestamp;

/// Level-triggered `poll(2)` scan: a contiguous array of `pollfd` records
/// plus a `fd -> Channel` map. Always available, used as the portable
/// fallback and as the backend both poller-contract test suites run
/// against to prove the two implementations agree.
///
/// An "uninterested" descriptor (interest == none, kept around because its
/// owner hasn't removed the channel yet) is marked with the one's-complement
/// sentinel `-fd-1`: `poll(2)` skips negative fds entirely, so the kernel
/// never reports on it, while the array slot and the channel's `index`
/// stay valid so later updates can find it again without a linear scan.
pub struct PollBackend {
    fds: Vec<libc::pollfd>,
    channels: HashMap<RawFd, SharedChannel>,
}

impl PollBackend {
    pub fn new() -> PollBackend {
        PollBackend {
            fds: Vec::new(),
            channels: HashMap::new(),
        }
    }

    pub fn has_channel(&self, fd: RawFd) -> bool {
        self.channels.contains_key(&fd)
    }

    pub fn poll(&mut self, timeout: Duration, active: &mut Vec<SharedChannel>) -> Timestamp {
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        let n = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        let now = Timestamp::now();
        if n <= 0 {
            return now;
        }
        let mut remaining = n;
        for pfd in &self.fds {
            if remaining == 0 {
                break;
            }
            if pfd.revents == 0 {
                continue;
            }
            remaining -= 1;
            let fd = real_fd(pfd.fd);
            if let Some(channel) = self.channels.get(&fd) {
                channel.lock().unwrap().set_ready(to_interest(pfd.revents));
                active.push(channel.clone());
            }
        }
        now
    }

    pub fn update_channel(&mut self, channel: &SharedChannel) {
        let (fd, interest, index) = {
            let ch = channel.lock().unwrap();
            (ch.fd(), ch.interest(), ch.index)
        };

        if index < 0 {
            // New channel: append a fresh slot.
            let pfd = libc::pollfd {
                fd: if interest.is_none() { sentinel(fd) } else { fd },
                events: to_events(interest),
                revents: 0,
            };
            let new_index = self.fds.len() as i32;
            self.fds.push(pfd);
            channel.lock().unwrap().index = new_index;
            self.channels.insert(fd, channel.clone());
            trace!("poll backend: added fd={fd} at index={new_index}");
        } else {
            let slot = &mut self.fds[index as usize];
            slot.fd = if interest.is_none() { sentinel(fd) } else { fd };
            slot.events = to_events(interest);
            slot.revents = 0;
        }
    }

    pub fn remove_channel(&mut self, fd: RawFd) {
        let Some(channel) = self.channels.remove(&fd) else {
            return;
        };
        let index = channel.lock().unwrap().index as usize;
        let last = self.fds.len() - 1;
        if index != last {
            self.fds.swap(index, last);
            let moved_fd = real_fd(self.fds[index].fd);
            if let Some(moved_channel) = self.channels.get(&moved_fd) {
                moved_channel.lock().unwrap().index = index as i32;
            }
        }
        self.fds.pop();
    }
}

/// Encodes "not currently interested" without losing the fd's identity:
/// `poll(2)` ignores negative fds, and `-fd-1` is reversible for any
/// non-negative `fd`.
fn sentinel(fd: RawFd) -> RawFd {
    -fd - 1
}

fn real_fd(maybe_sentinel: RawFd) -> RawFd {
    if maybe_sentinel < 0 {
        -maybe_sentinel - 1
    } else {
        maybe_sentinel
    }
}

fn to_events(interest: Interest) -> libc::c_short {
    let mut events = 0;
    if interest.contains(Interest::READABLE) {
        events |= libc::POLLIN | libc::POLLPRI;
    }
    if interest.contains(Interest::WRITABLE) {
        events |= libc::POLLOUT;
    }
    events as libc::c_short
}

fn to_interest(revents: libc::c_short) -> Interest {
    let revents = revents as libc::c_int;
    let mut interest = Interest::NONE;
    if revents & (libc::POLLIN as libc::c_int) != 0 {
        interest |= Interest::READABLE;
    }
    if revents & (libc::POLLPRI as libc::c_int) != 0 {
        interest |= Interest::PRIORITY;
    }
    if revents & (libc::POLLOUT as libc::c_int) != 0 {
        interest |= Interest::WRITABLE;
    }
    if revents & (libc::POLLHUP as libc::c_int) != 0 {
        interest |= Interest::HANGUP;
    }
    if revents & (libc::POLLERR as libc::c_int) != 0 {
        interest |= Interest::ERROR;
    }
    if revents & (libc::POLLNVAL as libc::c_int) != 0 {
        interest |= Interest::INVALID;
    }
    interest
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::new_shared;
    use std::time::Duration;

    #[test]
    fn register_then_poll_reports_readable_pipe() {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (read_fd, write_fd) = (fds[0], fds[1]);

        let mut backend = PollBackend::new();
        let channel = new_shared(read_fd);
        channel.lock().unwrap().enable_reading();
        backend.update_channel(&channel);

        unsafe {
            libc::write(write_fd, b"x".as_ptr() as *const libc::c_void, 1);
        }

        let mut active = Vec::new();
        backend.poll(Duration::from_millis(500), &mut active);
        assert_eq!(active.len(), 1);

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn remove_channel_compacts_array() {
        let mut backend = PollBackend::new();
        let mut fds = Vec::new();
        for _ in 0..3 {
            let mut pipe = [0i32; 2];
            assert_eq!(unsafe { libc::pipe(pipe.as_mut_ptr()) }, 0);
            let channel = new_shared(pipe[0]);
            channel.lock().unwrap().enable_reading();
            backend.update_channel(&channel);
            fds.push(pipe);
        }
        assert!(backend.has_channel(fds[0][0]));
        backend.remove_channel(fds[0][0]);
        assert!(!backend.has_channel(fds[0][0]));
        assert!(backend.has_channel(fds[1][0]));
        assert!(backend.has_channel(fds[2][0]));
        for pipe in fds {
            unsafe {
                libc::close(pipe[0]);
                libc::close(pipe[1]);
            }
        }
    }
}
