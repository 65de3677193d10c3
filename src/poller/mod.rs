//! The readiness multiplexer a [`Reactor`](crate::reactor::Reactor) wraps.
//!
//! Two interchangeable back-ends implement the same contract: a
//! level-triggered `poll(2)` scan (always available, §4.2 Back-end A) and
//! an edge-capable `epoll(2)` set (§4.2 Back-end B). Both map `fd -> Channel`
//! and return the list of channels with non-zero ready bits from a single
//! `poll()` call.

mod epoll_backend;
mod poll_backend;

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::channel::SharedChannel;
use crate::timestamp::Timestamp;

pub use epoll_backend::EpollBackend;
pub use poll_backend::PollBackend;

/// Selects a back-end at construction time. The edge-capable back-end is
/// the default; setting `creactor_force_poll_backend` (an internal cfg, not
/// a public feature) forces the level-triggered scan, which is how this
/// crate's own tests exercise both implementations against the same
/// scenarios.
pub enum Poller {
    Poll(PollBackend),
    Epoll(EpollBackend),
}

impl Poller {
    pub fn new() -> io::Result<Poller> {
        if cfg!(creactor_force_poll_backend) {
            Ok(Poller::Poll(PollBackend::new()))
        } else {
            Ok(Poller::Epoll(EpollBackend::new()?))
        }
    }

    pub fn new_poll_backend() -> Poller {
        Poller::Poll(PollBackend::new())
    }

    pub fn new_epoll_backend() -> io::Result<Poller> {
        Ok(Poller::Epoll(EpollBackend::new()?))
    }

    /// Blocks up to `timeout`, fills `active` with channels whose ready
    /// bits are non-zero (cleared first), and returns the timestamp of
    /// return.
    pub fn poll(&mut self, timeout: Duration, active: &mut Vec<SharedChannel>) -> Timestamp {
        active.clear();
        match self {
            Poller::Poll(p) => p.poll(timeout, active),
            Poller::Epoll(p) => p.poll(timeout, active),
        }
    }

    pub fn update_channel(&mut self, channel: &SharedChannel) {
        match self {
            Poller::Poll(p) => p.update_channel(channel),
            Poller::Epoll(p) => p.update_channel(channel),
        }
    }

    pub fn remove_channel(&mut self, fd: RawFd) {
        match self {
            Poller::Poll(p) => p.remove_channel(fd),
            Poller::Epoll(p) => p.remove_channel(fd),
        }
    }

    pub fn has_channel(&self, fd: RawFd) -> bool {
        match self {
            Poller::Poll(p) => p.has_channel(fd),
            Poller::Epoll(p) => p.has_channel(fd),
        }
    }
}
