use std::cell::Cell;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once, Weak};
use std::thread::ThreadId;
use std::time::Duration;

use log::{debug, error, trace};

use crate::channel::SharedChannel;
use crate::poller::Poller;
use crate::timer::TimerCallback;
use crate::timer_id::TimerId;
use crate::timer_queue::TimerQueue;
use crate::timestamp::Timestamp;
use crate::waker::Waker;

type Task = Box<dyn FnOnce() + Send>;

const POLL_TIMEOUT: Duration = Duration::from_secs(10);

static IGNORE_SIGPIPE: Once = Once::new();

thread_local! {
    static LOOP_IN_THIS_THREAD: Cell<bool> = Cell::new(false);
}

/// A single-threaded event pump: owns a [`Poller`] and a [`TimerQueue`],
/// hosts a wakeup fd, and runs a cross-thread task queue (§4.4).
///
/// Every field that is only ever touched by the owning thread is still
/// wrapped in a `Mutex` rather than left bare, because the reactor's own
/// handle (`Arc<Reactor>`) is routinely captured by closures that cross
/// threads (timer callbacks, queued tasks, channel callbacks wired up from
/// the base reactor). The lock is never contended in practice — every call
/// site is guarded by `assert_owner_thread` first — it exists to satisfy
/// `Send + Sync` honestly instead of asserting it away. See `DESIGN.md`.
pub struct Reactor {
    owner_thread: ThreadId,
    looping: AtomicBool,
    quitting: AtomicBool,
    calling_pending: AtomicBool,
    poller: Mutex<Poller>,
    timer_queue: Mutex<TimerQueue>,
    waker: Waker,
    wakeup_channel: SharedChannel,
    active_channels: Mutex<Vec<SharedChannel>>,
    pending_tasks: Mutex<Vec<Task>>,
    self_weak: Weak<Reactor>,
}

impl Reactor {
    /// Constructs a reactor owned by the calling thread. Constructing a
    /// second reactor on the same thread is a fatal misuse (§4.4).
    pub fn new() -> io::Result<Arc<Reactor>> {
        IGNORE_SIGPIPE.call_once(ignore_sigpipe);

        LOOP_IN_THIS_THREAD.with(|flag| {
            if flag.get() {
                panic!("a Reactor already exists on this thread");
            }
            flag.set(true);
        });

        let owner_thread = std::thread::current().id();
        let waker = Waker::new()?;
        let mut poller = Poller::new()?;
        let timer_queue = TimerQueue::new(Weak::new())?;
        let wakeup_channel = crate::channel::new_shared(waker.as_raw_fd());

        poller.update_channel(&timer_queue.channel());
        poller.update_channel(&wakeup_channel);

        let reactor = Arc::new_cyclic(|weak: &Weak<Reactor>| {
            {
                let weak_for_read = weak.clone();
                wakeup_channel.lock().unwrap().set_read_callback(move |_| {
                    if let Some(reactor) = weak_for_read.upgrade() {
                        reactor.handle_wakeup();
                    }
                });
                wakeup_channel.lock().unwrap().enable_reading();
            }
            Reactor {
                owner_thread,
                looping: AtomicBool::new(false),
                quitting: AtomicBool::new(false),
                calling_pending: AtomicBool::new(false),
                poller: Mutex::new(poller),
                timer_queue: Mutex::new(timer_queue),
                waker,
                wakeup_channel,
                active_channels: Mutex::new(Vec::new()),
                pending_tasks: Mutex::new(Vec::new()),
                self_weak: weak.clone(),
            }
        });

        // The timer queue's own read callback captured a not-yet-upgradable
        // `Weak` at its own construction time; re-point it now that the
        // reactor is actually alive.
        reactor.rewire_timer_queue_callback();

        Ok(reactor)
    }

    fn rewire_timer_queue_callback(self: &Arc<Reactor>) {
        let weak = self.self_weak.clone();
        let channel = {
            let tq = self.timer_queue.lock().unwrap();
            tq.channel()
        };
        channel.lock().unwrap().set_read_callback(move |_when| {
            if let Some(reactor) = weak.upgrade() {
                reactor.handle_timer_expired();
            }
        });
    }

    pub fn handle(&self) -> Arc<Reactor> {
        self.self_weak.upgrade().expect("reactor dropped while handle requested")
    }

    fn is_owner_thread(&self) -> bool {
        std::thread::current().id() == self.owner_thread
    }

    pub fn assert_owner_thread(&self) {
        if !self.is_owner_thread() {
            panic!(
                "reactor operation performed from a foreign thread (owner={:?}, caller={:?})",
                self.owner_thread,
                std::thread::current().id()
            );
        }
    }

    /// Runs the loop body until `quit()` is called. Must run on the owning
    /// thread.
    pub fn run(self: &Arc<Reactor>) {
        self.assert_owner_thread();
        self.looping.store(true, Ordering::SeqCst);
        self.quitting.store(false, Ordering::SeqCst);
        debug!("reactor started");

        while !self.quitting.load(Ordering::SeqCst) {
            let (active, poll_return_time) = {
                let mut active = self.active_channels.lock().unwrap();
                let when = self.poller.lock().unwrap().poll(POLL_TIMEOUT, &mut active);
                (std::mem::take(&mut *active), when)
            };
            for channel in &active {
                channel.lock().unwrap().dispatch(poll_return_time);
            }
            self.do_pending_tasks();
        }

        self.looping.store(false, Ordering::SeqCst);
        debug!("reactor stopped");
    }

    /// Thread-safe. Schedules the loop to stop after its current iteration;
    /// wakes the loop if it is blocked in `poll()`.
    pub fn quit(&self) {
        self.quitting.store(true, Ordering::SeqCst);
        if !self.is_owner_thread() {
            self.wakeup();
        }
    }

    pub fn is_running(&self) -> bool {
        self.looping.load(Ordering::SeqCst)
    }

    pub fn run_in_loop<F>(self: &Arc<Reactor>, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_owner_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    pub fn queue_in_loop<F>(self: &Arc<Reactor>, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let should_wake = {
            let mut tasks = self.pending_tasks.lock().unwrap();
            tasks.push(Box::new(task));
            !self.is_owner_thread() || self.calling_pending.load(Ordering::SeqCst)
        };
        if should_wake {
            self.wakeup();
        }
    }

    fn do_pending_tasks(&self) {
        let tasks = {
            let mut guard = self.pending_tasks.lock().unwrap();
            std::mem::take(&mut *guard)
        };
        self.calling_pending.store(true, Ordering::SeqCst);
        for task in tasks {
            task();
        }
        self.calling_pending.store(false, Ordering::SeqCst);
    }

    fn wakeup(&self) {
        if let Err(e) = self.waker.wake() {
            error!("failed to wake reactor: {e}");
        }
    }

    fn handle_wakeup(&self) {
        if let Err(e) = self.waker.reset() {
            error!("failed to drain reactor wakeup fd: {e}");
        }
    }

    pub(crate) fn handle_timer_expired(&self) {
        self.timer_queue.lock().unwrap().handle_expired();
    }

    pub fn run_at<F>(self: &Arc<Reactor>, when: Timestamp, callback: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.schedule(when, 0, callback)
    }

    pub fn run_after<F>(self: &Arc<Reactor>, delay_seconds: f64, callback: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.schedule(Timestamp::now().add_seconds(delay_seconds), 0, callback)
    }

    pub fn run_every<F>(self: &Arc<Reactor>, interval_seconds: f64, callback: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        let interval_micros = (interval_seconds * 1_000_000.0) as i64;
        self.schedule(
            Timestamp::now().add_seconds(interval_seconds),
            interval_micros,
            callback,
        )
    }

    fn schedule<F>(self: &Arc<Reactor>, when: Timestamp, interval_micros: i64, callback: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        let cb: TimerCallback = Box::new(callback);
        let this = self.clone();
        // The sequence is allocated here, synchronously, so a `TimerId` can
        // be handed back to the caller even when the actual insertion is
        // deferred to the owning thread via `run_in_loop`. A `cancel()`
        // submitted right after this call still funnels through the same
        // task queue and therefore always runs after `add_in_loop`.
        let sequence = TimerId::next_sequence();
        self.run_in_loop(move || {
            this.timer_queue
                .lock()
                .unwrap()
                .add_in_loop(sequence, cb, when, interval_micros);
        });
        TimerId::new(sequence)
    }

    pub fn cancel(self: &Arc<Reactor>, id: TimerId) {
        let this = self.clone();
        self.run_in_loop(move || {
            this.timer_queue.lock().unwrap().cancel_in_loop(id);
        });
    }

    pub fn update_channel(&self, channel: &SharedChannel) {
        self.assert_owner_thread();
        self.poller.lock().unwrap().update_channel(channel);
    }

    pub fn remove_channel(&self, fd: std::os::unix::io::RawFd) {
        self.assert_owner_thread();
        self.poller.lock().unwrap().remove_channel(fd);
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        LOOP_IN_THIS_THREAD.with(|flag| flag.set(false));
    }
}

fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
    trace!("SIGPIPE ignored process-wide");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_loop_returns_after_quit_timer() {
        let reactor = Reactor::new().unwrap();
        let r = reactor.clone();
        reactor.run_after(0.02, move || r.quit());
        let start = std::time::Instant::now();
        reactor.run();
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn run_in_loop_from_owner_thread_executes_inline() {
        let reactor = Reactor::new().unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let r2 = ran.clone();
        reactor.run_in_loop(move || r2.store(true, Ordering::SeqCst));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn queue_in_loop_from_another_thread_wakes_the_loop() {
        let reactor = Reactor::new().unwrap();
        let ran = Arc::new(AtomicBool::new(false));

        let reactor_for_thread = reactor.clone();
        let ran2 = ran.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            reactor_for_thread.queue_in_loop(move || ran2.store(true, Ordering::SeqCst));
            std::thread::sleep(Duration::from_millis(20));
            reactor_for_thread.quit();
        });

        reactor.run();
        handle.join().unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    #[should_panic]
    fn second_reactor_on_same_thread_is_fatal() {
        let _a = Reactor::new().unwrap();
        let _b = Reactor::new().unwrap();
    }

    #[test]
    fn repeating_timer_cancelled_from_its_own_callback_fires_exactly_three_times() {
        use std::sync::atomic::AtomicUsize;

        let reactor = Reactor::new().unwrap();
        let fires = Arc::new(AtomicUsize::new(0));
        let id_slot: Arc<Mutex<Option<TimerId>>> = Arc::new(Mutex::new(None));

        let f = fires.clone();
        let slot = id_slot.clone();
        let r = reactor.clone();
        let id = reactor.run_every(0.01, move || {
            let n = f.fetch_add(1, Ordering::SeqCst) + 1;
            if n == 3 {
                if let Some(id) = *slot.lock().unwrap() {
                    r.cancel(id);
                }
                r.quit();
            }
        });
        *id_slot.lock().unwrap() = Some(id);

        reactor.run();
        assert_eq!(fires.load(Ordering::SeqCst), 3);
    }
}
