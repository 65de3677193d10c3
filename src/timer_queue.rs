use std::collections::{BTreeSet, HashMap, HashSet};
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Weak;

use log::{error, trace};

use crate::channel::{new_shared, SharedChannel};
use crate::reactor::Reactor;
use crate::timer::{Timer, TimerCallback};
use crate::timer_id::TimerId;
use crate::timestamp::Timestamp;

const MIN_TIMEOUT_MICROS: i64 = 100;

/// A deadline-ordered set of timers fronted by a single kernel `timerfd`,
/// registered as a [`Channel`](crate::channel::Channel) on the owning
/// reactor. Only ever mutated on the owning reactor's thread; `add`/`cancel`
/// are the cross-thread-safe facade that funnels through
/// [`Reactor::run_in_loop`].
pub struct TimerQueue {
    timerfd: OwnedFd,
    channel: SharedChannel,
    timers: BTreeSet<(Timestamp, u64)>,
    by_sequence: HashMap<u64, Timer>,
    active: HashSet<u64>,
    canceling: HashSet<u64>,
    calling_expired: bool,
}

impl TimerQueue {
    pub fn new(owner: Weak<Reactor>) -> io::Result<TimerQueue> {
        let fd = syscall!(timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
        ))?;
        let timerfd = unsafe { OwnedFd::from_raw_fd(fd) };
        let channel = new_shared(timerfd.as_raw_fd());
        {
            let mut ch = channel.lock().unwrap();
            let owner_for_read = owner.clone();
            ch.set_read_callback(move |_when| {
                if let Some(reactor) = owner_for_read.upgrade() {
                    reactor.handle_timer_expired();
                }
            });
            ch.enable_reading();
        }
        // Registering this channel with the owning reactor's poller is the
        // caller's job (`Reactor::new`): during `Arc::new_cyclic`
        // construction `owner` cannot yet be upgraded, so the callback
        // above only captures it for later use once the reactor is live.

        Ok(TimerQueue {
            timerfd,
            channel,
            timers: BTreeSet::new(),
            by_sequence: HashMap::new(),
            active: HashSet::new(),
            canceling: HashSet::new(),
            calling_expired: false,
        })
    }

    pub fn channel(&self) -> SharedChannel {
        self.channel.clone()
    }

    /// Inserts a brand-new timer (under a sequence number already handed to
    /// the caller as part of its `TimerId`) and resets the kernel timer fd
    /// if it became the new minimum.
    pub fn add_in_loop(&mut self, sequence: u64, callback: TimerCallback, when: Timestamp, interval_micros: i64) {
        let timer = Timer::new(callback, when, interval_micros, sequence);
        let became_earliest = self
            .timers
            .iter()
            .next()
            .map(|(t, _)| when < *t)
            .unwrap_or(true);

        self.timers.insert((when, sequence));
        self.active.insert(sequence);
        self.by_sequence.insert(sequence, timer);
        debug_assert_eq!(self.timers.len(), self.active.len());

        if became_earliest {
            self.reset_timerfd(when);
        }
    }

    /// Idempotent: cancelling a `TimerId` that is neither active nor
    /// currently firing is a silent no-op (§9).
    pub fn cancel_in_loop(&mut self, id: TimerId) {
        let sequence = id.sequence;
        if self.active.remove(&sequence) {
            if let Some(timer) = self.by_sequence.remove(&sequence) {
                self.timers.remove(&(timer.expiration, sequence));
            }
            debug_assert_eq!(self.timers.len(), self.active.len());
        } else if self.calling_expired {
            self.canceling.insert(sequence);
        }
    }

    /// Drains the kernel notification, runs every timer whose deadline has
    /// passed, re-seats repeats, and re-arms the timer fd.
    pub fn handle_expired(&mut self) {
        self.drain_timerfd_notification();
        let now = Timestamp::now();

        let mut expired = Vec::new();
        while let Some(&(when, sequence)) = self.timers.iter().next() {
            if when > now {
                break;
            }
            self.timers.remove(&(when, sequence));
            self.active.remove(&sequence);
            expired.push(sequence);
        }
        debug_assert_eq!(self.timers.len(), self.active.len());

        self.calling_expired = true;
        for sequence in &expired {
            if let Some(timer) = self.by_sequence.get_mut(sequence) {
                timer.run();
            }
        }
        self.calling_expired = false;

        for sequence in expired {
            let repeat = self
                .by_sequence
                .get(&sequence)
                .map(|t| t.is_repeat())
                .unwrap_or(false);
            if repeat && !self.canceling.contains(&sequence) {
                let timer = self.by_sequence.get_mut(&sequence).unwrap();
                timer.restart(now);
                let new_expiration = timer.expiration;
                self.timers.insert((new_expiration, sequence));
                self.active.insert(sequence);
            } else {
                self.by_sequence.remove(&sequence);
            }
        }
        self.canceling.clear();
        debug_assert_eq!(self.timers.len(), self.active.len());

        if let Some(&(when, _)) = self.timers.iter().next() {
            self.reset_timerfd(when);
        }
    }

    fn drain_timerfd_notification(&self) {
        let mut buf: u64 = 0;
        match syscall!(read(
            self.timerfd.as_raw_fd(),
            &mut buf as *mut u64 as *mut libc::c_void,
            std::mem::size_of::<u64>(),
        )) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => error!("timerfd read anomaly: {e}"),
        }
    }

    fn reset_timerfd(&self, when: Timestamp) {
        let now = Timestamp::now();
        let micros = (when.micros_since_epoch() - now.micros_since_epoch()).max(MIN_TIMEOUT_MICROS);
        trace!("timerfd reset to fire in {micros}us");
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: micros / 1_000_000,
                tv_nsec: (micros % 1_000_000) * 1_000,
            },
        };
        let res = unsafe {
            libc::timerfd_settime(self.timerfd.as_raw_fd(), 0, &spec, std::ptr::null_mut())
        };
        if res == -1 {
            error!("timerfd_settime failed: {}", io::Error::last_os_error());
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.timers.len()
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        self.channel.lock().unwrap().disable_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::Reactor;

    #[test]
    fn add_then_cancel_keeps_size_invariant() {
        let reactor = Reactor::new().unwrap();
        let mut queue = TimerQueue::new(std::sync::Arc::downgrade(&reactor)).unwrap();
        let sequence = TimerId::next_sequence();
        queue.add_in_loop(sequence, Box::new(|| {}), Timestamp::now().add_seconds(60.0), 0);
        assert_eq!(queue.len(), 1);
        queue.cancel_in_loop(TimerId::new(sequence));
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn double_cancel_is_a_silent_no_op() {
        let reactor = Reactor::new().unwrap();
        let mut queue = TimerQueue::new(std::sync::Arc::downgrade(&reactor)).unwrap();
        let sequence = TimerId::next_sequence();
        queue.add_in_loop(sequence, Box::new(|| {}), Timestamp::now().add_seconds(60.0), 0);
        queue.cancel_in_loop(TimerId::new(sequence));
        queue.cancel_in_loop(TimerId::new(sequence));
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn expired_timers_fire_in_ascending_order() {
        let reactor = Reactor::new().unwrap();
        let mut queue = TimerQueue::new(std::sync::Arc::downgrade(&reactor)).unwrap();
        let order = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let now = Timestamp::now();

        for i in [3, 1, 2] {
            let o = order.clone();
            queue.add_in_loop(
                TimerId::next_sequence(),
                Box::new(move || o.lock().unwrap().push(i)),
                now.add_seconds(-1.0 + (i as f64) * 0.0001),
                0,
            );
        }
        queue.handle_expired();
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    }
}
