use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

use log::warn;

use crate::interest::Interest;
use crate::timestamp::Timestamp;

type ReadCallback = Box<dyn FnMut(Timestamp) + Send>;
type EventCallback = Box<dyn FnMut() + Send>;

/// A handle shared between the [`Poller`](crate::poller::Poller) backend
/// that dispatches readiness on it and the single entity that owns its
/// lifecycle (an `Acceptor`, `Connector`, `TcpConnection`, or the
/// `TimerQueue`'s timer fd).
pub type SharedChannel = Arc<Mutex<Channel>>;

pub fn new_shared(fd: RawFd) -> SharedChannel {
    Arc::new(Mutex::new(Channel::new(fd)))
}

/// The per-fd record of interest/ready bits and the four typed callbacks a
/// readiness event fans out to. A `Channel` never owns the fd it wraps —
/// the owning entity's `Socket` (or raw fd, for the timer/wakeup fds)
/// outlives it.
pub struct Channel {
    fd: RawFd,
    interest: Interest,
    ready: Interest,
    /// Poller-private scratch: the poll-array backend's slot index, or the
    /// epoll backend's lifecycle tag encoded as a small integer. Does not
    /// escape the poller module.
    pub(crate) index: i32,
    handling: bool,
    read_cb: Option<ReadCallback>,
    write_cb: Option<EventCallback>,
    close_cb: Option<EventCallback>,
    error_cb: Option<EventCallback>,
}

impl Channel {
    pub fn new(fd: RawFd) -> Channel {
        Channel {
            fd,
            interest: Interest::NONE,
            ready: Interest::NONE,
            index: -1,
            handling: false,
            read_cb: None,
            write_cb: None,
            close_cb: None,
            error_cb: None,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn interest(&self) -> Interest {
        self.interest
    }

    pub fn is_none_interest(&self) -> bool {
        self.interest.is_none()
    }

    pub fn set_ready(&mut self, ready: Interest) {
        self.ready = ready;
    }

    pub fn enable_reading(&mut self) {
        self.interest |= Interest::READABLE;
    }

    pub fn enable_writing(&mut self) {
        self.interest |= Interest::WRITABLE;
    }

    pub fn disable_writing(&mut self) {
        self.interest = self.interest.remove(Interest::WRITABLE);
    }

    pub fn disable_all(&mut self) {
        self.interest = Interest::NONE;
    }

    pub fn is_writing(&self) -> bool {
        self.interest.contains(Interest::WRITABLE)
    }

    pub fn is_reading(&self) -> bool {
        self.interest.contains(Interest::READABLE)
    }

    pub fn set_read_callback<F>(&mut self, cb: F)
    where
        F: FnMut(Timestamp) + Send + 'static,
    {
        self.read_cb = Some(Box::new(cb));
    }

    pub fn set_write_callback<F>(&mut self, cb: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.write_cb = Some(Box::new(cb));
    }

    pub fn set_close_callback<F>(&mut self, cb: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.close_cb = Some(Box::new(cb));
    }

    pub fn set_error_callback<F>(&mut self, cb: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.error_cb = Some(Box::new(cb));
    }

    /// Fans `ready` out to the four callbacks in the fixed priority order
    /// the poller contract specifies. Must not be re-entered while
    /// `handling` is true; callers queue destruction rather than dropping a
    /// channel from inside its own dispatch.
    pub fn dispatch(&mut self, when: Timestamp) {
        self.handling = true;
        let ready = self.ready;

        if ready.contains(Interest::INVALID) {
            warn!("channel fd={} received POLLNVAL, ignoring", self.fd);
        }
        if ready.contains(Interest::HANGUP) && !ready.intersects(Interest::READABLE) {
            if let Some(cb) = self.close_cb.as_mut() {
                cb();
            }
        }
        if ready.intersects(Interest::ERROR | Interest::INVALID) {
            if let Some(cb) = self.error_cb.as_mut() {
                cb();
            }
        }
        if ready.is_readable() || ready.contains(Interest::READ_CLOSED) {
            if let Some(cb) = self.read_cb.as_mut() {
                cb(when);
            }
        }
        if ready.is_writable() {
            if let Some(cb) = self.write_cb.as_mut() {
                cb();
            }
        }

        self.handling = false;
    }

    pub fn is_handling_event(&self) -> bool {
        self.handling
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn dispatch_order_close_before_error_before_read_before_write() {
        let order = Arc::new(Mutex::new(Vec::<&'static str>::new()));
        let mut ch = Channel::new(3);

        let o = order.clone();
        ch.set_close_callback(move || o.lock().unwrap().push("close"));
        let o = order.clone();
        ch.set_error_callback(move || o.lock().unwrap().push("error"));
        let o = order.clone();
        ch.set_read_callback(move |_| o.lock().unwrap().push("read"));
        let o = order.clone();
        ch.set_write_callback(move || o.lock().unwrap().push("write"));

        ch.set_ready(
            Interest::HANGUP | Interest::ERROR | Interest::READABLE | Interest::WRITABLE,
        );
        ch.dispatch(Timestamp::now());

        assert_eq!(
            *order.lock().unwrap(),
            vec!["close", "error", "read", "write"]
        );
    }

    #[test]
    fn hangup_with_readable_skips_close_callback() {
        let closed = Arc::new(AtomicUsize::new(0));
        let mut ch = Channel::new(3);
        let c = closed.clone();
        ch.set_close_callback(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        ch.set_ready(Interest::HANGUP | Interest::READABLE);
        ch.dispatch(Timestamp::now());
        assert_eq!(closed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn enable_disable_writing_toggles_interest() {
        let mut ch = Channel::new(3);
        ch.enable_writing();
        assert!(ch.is_writing());
        ch.disable_writing();
        assert!(!ch.is_writing());
    }
}
