use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, error, info, trace, warn};

use crate::channel::new_shared;
use crate::net::{Address, Socket};
use crate::reactor::Reactor;
use crate::timer_id::TimerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Disconnected,
    Connecting,
    Connected,
}

type NewConnectionCallback = Box<dyn FnMut(Socket) + Send>;

const DEFAULT_INITIAL_RETRY_DELAY_MS: u64 = 500;
const DEFAULT_MAX_RETRY_DELAY_MS: u64 = 30_000;

/// Non-blocking active connect with exponential back-off and self-connect
/// detection (§4.6), grounded directly in the original implementation's
/// `Connector`.
pub struct Connector {
    reactor: Arc<Reactor>,
    server_addr: Address,
    connect: AtomicBool,
    state: Mutex<State>,
    channel: Mutex<Option<crate::channel::SharedChannel>>,
    retry_delay_ms: Mutex<u64>,
    initial_retry_delay_ms: u64,
    max_retry_delay_ms: u64,
    retry_timer: Mutex<Option<TimerId>>,
    new_connection_cb: Mutex<Option<NewConnectionCallback>>,
}

impl Connector {
    pub fn new(reactor: Arc<Reactor>, server_addr: Address) -> Arc<Connector> {
        Connector::with_retry_delays(
            reactor,
            server_addr,
            DEFAULT_INITIAL_RETRY_DELAY_MS,
            DEFAULT_MAX_RETRY_DELAY_MS,
        )
    }

    pub fn with_retry_delays(
        reactor: Arc<Reactor>,
        server_addr: Address,
        initial_retry_delay_ms: u64,
        max_retry_delay_ms: u64,
    ) -> Arc<Connector> {
        Arc::new(Connector {
            reactor,
            server_addr,
            connect: AtomicBool::new(false),
            state: Mutex::new(State::Disconnected),
            channel: Mutex::new(None),
            retry_delay_ms: Mutex::new(initial_retry_delay_ms),
            initial_retry_delay_ms,
            max_retry_delay_ms,
            retry_timer: Mutex::new(None),
            new_connection_cb: Mutex::new(None),
        })
    }

    pub fn set_new_connection_callback<F>(&self, cb: F)
    where
        F: FnMut(Socket) + Send + 'static,
    {
        *self.new_connection_cb.lock().unwrap() = Some(Box::new(cb));
    }

    /// Can be called from any thread (§4.6).
    pub fn start(self: &Arc<Connector>) {
        self.connect.store(true, Ordering::SeqCst);
        let this = self.clone();
        self.reactor.run_in_loop(move || this.start_in_loop());
    }

    fn start_in_loop(self: &Arc<Connector>) {
        self.reactor.assert_owner_thread();
        debug_assert_eq!(*self.state.lock().unwrap(), State::Disconnected);
        if self.connect.load(Ordering::SeqCst) {
            self.connect_now();
        } else {
            debug!("connector: do not connect");
        }
    }

    pub fn restart(self: &Arc<Connector>) {
        self.reactor.assert_owner_thread();
        *self.state.lock().unwrap() = State::Disconnected;
        *self.retry_delay_ms.lock().unwrap() = self.initial_retry_delay_ms;
        self.connect.store(true, Ordering::SeqCst);
        self.start_in_loop();
    }

    /// Can be called from any thread.
    pub fn stop(self: &Arc<Connector>) {
        self.connect.store(false, Ordering::SeqCst);
        let this = self.clone();
        self.reactor.run_in_loop(move || {
            if let Some(id) = this.retry_timer.lock().unwrap().take() {
                this.reactor.cancel(id);
            }
        });
    }

    fn connect_now(self: &Arc<Connector>) {
        let socket = match Socket::new_nonblocking() {
            Ok(s) => s,
            Err(e) => {
                error!("connector: failed to create socket: {e}");
                return;
            }
        };
        let result = socket.connect(&self.server_addr);
        let errno = result.err().and_then(|e| e.raw_os_error());
        match errno {
            None | Some(libc::EINPROGRESS) | Some(libc::EINTR) | Some(libc::EISCONN) => {
                self.connecting(socket);
            }
            Some(libc::EAGAIN)
            | Some(libc::EADDRINUSE)
            | Some(libc::EADDRNOTAVAIL)
            | Some(libc::ECONNREFUSED)
            | Some(libc::ENETUNREACH) => {
                self.retry(socket);
            }
            Some(errno) => {
                error!("connector: unexpected connect() errno {errno}");
            }
        }
    }

    fn connecting(self: &Arc<Connector>, socket: Socket) {
        *self.state.lock().unwrap() = State::Connecting;
        let fd = socket.as_raw_fd();
        let channel = new_shared(fd);

        let this_write = self.clone();
        let this_error = self.clone();
        {
            let mut ch = channel.lock().unwrap();
            ch.set_write_callback(move || this_write.handle_write());
            ch.set_error_callback(move || this_error.handle_error());
            ch.enable_writing();
        }
        self.reactor.update_channel(&channel);
        *self.channel.lock().unwrap() = Some(channel);
        // `socket`'s fd now lives on inside the channel's registration and
        // will be handed to `new_connection_cb` (or closed by `retry`) from
        // `handle_write`; leak the RAII wrapper without closing the fd.
        std::mem::forget(socket);
        let _ = fd;
    }

    /// Removes the channel from the poller now (we are inside its own
    /// dispatch) but defers actually dropping it to a queued task — the
    /// generalised "queue the delete" pattern (§9).
    fn remove_and_reset_channel(self: &Arc<Connector>) -> i32 {
        let channel = self.channel.lock().unwrap().take().expect("channel missing");
        channel.lock().unwrap().disable_all();
        let fd = channel.lock().unwrap().fd();
        self.reactor.remove_channel(fd);
        let this = self.clone();
        self.reactor.run_in_loop(move || {
            drop(channel);
            let _ = &this;
        });
        fd
    }

    fn handle_write(self: &Arc<Connector>) {
        trace!("connector handle_write, state={:?}", *self.state.lock().unwrap());
        if *self.state.lock().unwrap() == State::Connecting {
            let fd = self.remove_and_reset_channel();
            let socket = unsafe { Socket::from_raw_fd(fd) };
            match socket.take_error() {
                Ok(Some(err)) => {
                    warn!("connector: SO_ERROR = {err}");
                    self.retry(socket);
                }
                Ok(None) => match Address::is_self_connect(fd) {
                    Ok(true) => {
                        warn!("connector: self connect detected");
                        self.retry(socket);
                    }
                    _ => {
                        *self.state.lock().unwrap() = State::Connected;
                        if self.connect.load(Ordering::SeqCst) {
                            let mut cb = self.new_connection_cb.lock().unwrap();
                            if let Some(cb) = cb.as_mut() {
                                cb(socket);
                            }
                        }
                    }
                },
                Err(e) => {
                    warn!("connector: failed reading SO_ERROR: {e}");
                    self.retry(socket);
                }
            }
        } else {
            debug_assert_eq!(*self.state.lock().unwrap(), State::Disconnected);
        }
    }

    fn handle_error(self: &Arc<Connector>) {
        error!("connector handle_error");
        let fd = self.remove_and_reset_channel();
        let socket = unsafe { Socket::from_raw_fd(fd) };
        let err = socket.take_error().ok().flatten();
        trace!("connector SO_ERROR = {err:?}");
        self.retry(socket);
    }

    fn retry(self: &Arc<Connector>, socket: Socket) {
        drop(socket);
        *self.state.lock().unwrap() = State::Disconnected;
        if self.connect.load(Ordering::SeqCst) {
            let delay_ms = *self.retry_delay_ms.lock().unwrap();
            info!(
                "connector: retrying {} in {} ms",
                self.server_addr.to_host_port(),
                delay_ms
            );
            let this = self.clone();
            let id = self
                .reactor
                .run_after(delay_ms as f64 / 1000.0, move || this.start_in_loop());
            *self.retry_timer.lock().unwrap() = Some(id);
            let mut retry_delay = self.retry_delay_ms.lock().unwrap();
            *retry_delay = (*retry_delay * 2).min(self.max_retry_delay_ms);
        } else {
            debug!("connector: do not connect");
        }
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        if let Some(id) = self.retry_timer.lock().unwrap().take() {
            self.reactor.cancel(id);
        }
        debug_assert!(self.channel.lock().unwrap().is_none());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_doubles_then_clamps_at_the_configured_max() {
        let reactor = Reactor::new().unwrap();
        let connector = Connector::with_retry_delays(reactor, Address::new(0), 500, 30_000);
        connector.connect.store(true, Ordering::SeqCst);

        let mut used_ms = Vec::new();
        for _ in 0..8 {
            used_ms.push(*connector.retry_delay_ms.lock().unwrap());
            let socket = Socket::new_nonblocking().unwrap();
            connector.retry(socket);
        }

        assert_eq!(used_ms, vec![500, 1000, 2000, 4000, 8000, 16_000, 30_000, 30_000]);
    }
}
