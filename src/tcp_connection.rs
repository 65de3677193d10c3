use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, error, trace, warn};

use crate::buffer::Buffer;
use crate::callbacks::{
    default_connection_callback, default_message_callback, CloseCallback, ConnectionCallback,
    HighWaterCallback, MessageCallback, WriteCompleteCallback,
};
use crate::channel::{new_shared, SharedChannel};
use crate::net::{Address, Socket};
use crate::reactor::Reactor;
use crate::timestamp::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// Per-session mutable state, separated from the identity fields so the
/// constructor can wire channel callbacks against a `Weak<TcpConnection>`
/// before the `Arc` finishes building (§4.7, mirrors `Reactor::new`'s
/// `Arc::new_cyclic` pattern).
struct Guts {
    state: State,
    socket: Socket,
    input_buffer: Buffer,
    output_buffer: Buffer,
    connection_cb: ConnectionCallback,
    message_cb: MessageCallback,
    write_complete_cb: Option<WriteCompleteCallback>,
    high_water_cb: Option<HighWaterCallback>,
    close_cb: Option<CloseCallback>,
    high_water_mark: usize,
}

pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

/// One TCP session's state machine: `Connecting -> Connected ->
/// Disconnecting? -> Disconnected`, never reversing (§4.7). Lives entirely
/// on its owning reactor's thread except for `send`/`shutdown`, which are
/// thread-safe by queueing onto that reactor.
pub struct TcpConnection {
    reactor: Arc<Reactor>,
    name: String,
    local_addr: Address,
    peer_addr: Address,
    channel: SharedChannel,
    guts: Mutex<Guts>,
    self_weak: Mutex<Weak<TcpConnection>>,
    handle_close_called: AtomicUsize,
}

impl TcpConnection {
    /// Constructed by `TcpServer`/`TcpClient` from an already-accepted or
    /// already-connected fd, in state `Connecting`. `connect_established`
    /// must be queued onto `reactor` exactly once before any I/O occurs.
    pub fn new(
        reactor: Arc<Reactor>,
        name: String,
        socket: Socket,
        local_addr: Address,
        peer_addr: Address,
    ) -> Arc<TcpConnection> {
        let fd = socket.as_raw_fd();
        let channel = new_shared(fd);
        socket.set_tcp_no_delay(true);

        let conn = Arc::new(TcpConnection {
            reactor,
            name,
            local_addr,
            peer_addr,
            channel,
            guts: Mutex::new(Guts {
                state: State::Connecting,
                socket,
                input_buffer: Buffer::new(),
                output_buffer: Buffer::new(),
                connection_cb: default_connection_callback(),
                message_cb: default_message_callback(),
                write_complete_cb: None,
                high_water_cb: None,
                close_cb: None,
                high_water_mark: DEFAULT_HIGH_WATER_MARK,
            }),
            self_weak: Mutex::new(Weak::new()),
            handle_close_called: AtomicUsize::new(0),
        });

        *conn.self_weak.lock().unwrap() = Arc::downgrade(&conn);
        let weak = conn.self_weak.lock().unwrap().clone();
        {
            let mut ch = conn.channel.lock().unwrap();
            let w = weak.clone();
            ch.set_read_callback(move |when| {
                if let Some(conn) = w.upgrade() {
                    conn.handle_read(when);
                }
            });
            let w = weak.clone();
            ch.set_write_callback(move || {
                if let Some(conn) = w.upgrade() {
                    conn.handle_write();
                }
            });
            let w = weak.clone();
            ch.set_close_callback(move || {
                if let Some(conn) = w.upgrade() {
                    conn.handle_close();
                }
            });
            let w = weak.clone();
            ch.set_error_callback(move || {
                if let Some(conn) = w.upgrade() {
                    conn.handle_error();
                }
            });
        }

        conn
    }

    pub fn get_loop(&self) -> Arc<Reactor> {
        self.reactor.clone()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_address(&self) -> Address {
        self.local_addr
    }

    pub fn peer_address(&self) -> Address {
        self.peer_addr
    }

    pub fn connected(&self) -> bool {
        self.guts.lock().unwrap().state == State::Connected
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        self.guts.lock().unwrap().connection_cb = cb;
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        self.guts.lock().unwrap().message_cb = cb;
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        self.guts.lock().unwrap().write_complete_cb = Some(cb);
    }

    pub fn set_high_water_callback(&self, cb: HighWaterCallback, mark: usize) {
        let mut guts = self.guts.lock().unwrap();
        guts.high_water_cb = Some(cb);
        guts.high_water_mark = mark;
    }

    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        self.guts.lock().unwrap().close_cb = Some(cb);
    }

    pub fn set_tcp_no_delay(&self, on: bool) {
        self.guts.lock().unwrap().socket.set_tcp_no_delay(on);
    }

    /// Must run exactly once, on the owning reactor's thread.
    pub fn connect_established(self: &Arc<Self>) {
        self.reactor.assert_owner_thread();
        {
            let mut guts = self.guts.lock().unwrap();
            debug_assert_eq!(guts.state, State::Connecting);
            guts.state = State::Connected;
        }
        self.channel.lock().unwrap().enable_reading();
        self.reactor.update_channel(&self.channel);
        let cb = self.guts.lock().unwrap().connection_cb.clone();
        cb(self);
    }

    fn handle_read(self: &Arc<Self>, when: Timestamp) {
        self.reactor.assert_owner_thread();
        let fd = self.channel.lock().unwrap().fd();
        let mut guts = self.guts.lock().unwrap();
        match guts.input_buffer.read_from_fd(fd) {
            Ok(0) => {
                drop(guts);
                self.handle_close();
            }
            Ok(_n) => {
                let cb = guts.message_cb.clone();
                drop(guts);
                cb(self, &mut self.guts.lock().unwrap().input_buffer, when);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => {
                drop(guts);
                error!("connection {}: read error: {e}", self.name);
                self.handle_error();
            }
        }
    }

    fn handle_write(self: &Arc<Self>) {
        self.reactor.assert_owner_thread();
        if !self.channel.lock().unwrap().is_writing() {
            trace!("connection {}: write event with no write interest, ignoring", self.name);
            return;
        }
        let fd = self.channel.lock().unwrap().fd();
        let mut guts = self.guts.lock().unwrap();
        match guts.output_buffer.write_to_fd(fd) {
            Ok(_n) => {
                if guts.output_buffer.readable_bytes() == 0 {
                    self.channel.lock().unwrap().disable_writing();
                    self.reactor.update_channel(&self.channel);
                    let write_complete_cb = guts.write_complete_cb.clone();
                    let state = guts.state;
                    drop(guts);
                    if let Some(cb) = write_complete_cb {
                        let this = self.clone();
                        self.reactor.queue_in_loop(move || cb(&this));
                    }
                    if state == State::Disconnecting {
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => {
                error!("connection {}: write error: {e}", self.name);
            }
        }
    }

    fn handle_close(self: &Arc<Self>) {
        self.reactor.assert_owner_thread();
        {
            let mut guts = self.guts.lock().unwrap();
            debug_assert!(guts.state == State::Connected || guts.state == State::Disconnecting);
            guts.state = State::Disconnected;
        }
        self.channel.lock().unwrap().disable_all();
        self.reactor.update_channel(&self.channel);

        if self.handle_close_called.fetch_add(1, Ordering::SeqCst) == 0 {
            let connection_cb = self.guts.lock().unwrap().connection_cb.clone();
            connection_cb(self);
            let close_cb = self.guts.lock().unwrap().close_cb.clone();
            if let Some(cb) = close_cb {
                cb(self);
            }
        }
    }

    fn handle_error(&self) {
        let fd = self.channel.lock().unwrap().fd();
        let err = unsafe { Socket::from_raw_fd(fd) };
        let so_error = err.take_error().ok().flatten();
        std::mem::forget(err);
        warn!("connection {}: SO_ERROR = {:?}", self.name, so_error);
    }

    /// Thread-safe.
    pub fn send(self: &Arc<Self>, bytes: &[u8]) {
        let owned = bytes.to_vec();
        let this = self.clone();
        self.reactor.run_in_loop(move || this.send_in_loop(&owned));
    }

    fn send_in_loop(self: &Arc<Self>, bytes: &[u8]) {
        self.reactor.assert_owner_thread();
        let mut guts = self.guts.lock().unwrap();
        if guts.state == State::Disconnected {
            warn!("connection {}: send() called after disconnect, dropping", self.name);
            return;
        }

        let mut remaining: &[u8] = bytes;
        if !self.channel.lock().unwrap().is_writing() && guts.output_buffer.readable_bytes() == 0 {
            let fd = guts.socket.as_raw_fd();
            let n = unsafe { libc::write(fd, remaining.as_ptr() as *const libc::c_void, remaining.len()) };
            if n >= 0 {
                let n = n as usize;
                remaining = &remaining[n..];
                if remaining.is_empty() {
                    if let Some(cb) = guts.write_complete_cb.clone() {
                        let this = self.clone();
                        drop(guts);
                        self.reactor.queue_in_loop(move || cb(&this));
                        return;
                    }
                }
            } else {
                let err = std::io::Error::last_os_error();
                if err.kind() != std::io::ErrorKind::WouldBlock {
                    error!("connection {}: direct write failed: {err}", self.name);
                    if err.raw_os_error() == Some(libc::EPIPE) || err.raw_os_error() == Some(libc::ECONNRESET) {
                        return;
                    }
                }
            }
        }

        if !remaining.is_empty() {
            let new_len = guts.output_buffer.readable_bytes() + remaining.len();
            let high_water_mark = guts.high_water_mark;
            let crossed = new_len >= high_water_mark && guts.output_buffer.readable_bytes() < high_water_mark;
            guts.output_buffer.append(remaining);
            if !self.channel.lock().unwrap().is_writing() {
                self.channel.lock().unwrap().enable_writing();
                self.reactor.update_channel(&self.channel);
            }
            if crossed {
                if let Some(cb) = guts.high_water_cb.clone() {
                    let this = self.clone();
                    drop(guts);
                    self.reactor.queue_in_loop(move || cb(&this, new_len));
                }
            }
        }
    }

    /// Thread-safe.
    pub fn shutdown(self: &Arc<Self>) {
        let this = self.clone();
        self.reactor.run_in_loop(move || this.shutdown_internal());
    }

    fn shutdown_internal(self: &Arc<Self>) {
        let mut guts = self.guts.lock().unwrap();
        if guts.state == State::Connected {
            guts.state = State::Disconnecting;
            drop(guts);
            self.shutdown_in_loop();
        }
    }

    fn shutdown_in_loop(&self) {
        self.reactor.assert_owner_thread();
        if !self.channel.lock().unwrap().is_writing() {
            let guts = self.guts.lock().unwrap();
            if let Err(e) = guts.socket.shutdown_write() {
                debug!("connection {}: shutdown_write failed: {e}", self.name);
            }
        }
    }

    /// Torn out of the server/client's connection map exactly once: removes
    /// the channel from the poller and makes sure the user callback has
    /// fired even if the peer never sent a close event (§4.7, §5 fd
    /// ownership: channel removal must happen before the `Socket` drops).
    pub fn connect_destroyed(self: &Arc<Self>) {
        self.reactor.assert_owner_thread();
        {
            let mut guts = self.guts.lock().unwrap();
            if guts.state == State::Connected {
                guts.state = State::Disconnected;
            }
        }
        self.channel.lock().unwrap().disable_all();
        self.reactor.remove_channel(self.channel.lock().unwrap().fd());

        if self.handle_close_called.fetch_add(1, Ordering::SeqCst) == 0 {
            let connection_cb = self.guts.lock().unwrap().connection_cb.clone();
            connection_cb(self);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::Reactor;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex as StdMutex;

    fn connected_pair() -> (Socket, Socket, Address, Address) {
        let listener = Socket::new_nonblocking().unwrap();
        listener.set_reuse_addr(true);
        listener.bind(&Address::new(0)).unwrap();
        listener.listen().unwrap();
        let bound = listener.local_addr().unwrap();

        let client = Socket::new_nonblocking().unwrap();
        let connect_addr = Address::with_ip(std::net::Ipv4Addr::new(127, 0, 0, 1), bound.port());
        let _ = client.connect(&connect_addr);

        let mut server_side = None;
        for _ in 0..200 {
            if let Some((s, _peer)) = listener.accept().unwrap() {
                server_side = Some(s);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        let server_side = server_side.expect("listener never saw the pending connection");
        let client_local = client.local_addr().unwrap();
        let server_peer = server_side.local_addr().unwrap();
        (server_side, client, server_peer, client_local)
    }

    #[test]
    fn connect_established_enables_reading_and_fires_callback() {
        let reactor = Reactor::new().unwrap();
        let (server_sock, _client_sock, local, peer) = connected_pair();
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();

        let conn = TcpConnection::new(reactor.clone(), "test#1".into(), server_sock, local, peer);
        conn.set_connection_callback(Arc::new(move |c: &Arc<TcpConnection>| {
            if c.connected() {
                f.store(true, Ordering::SeqCst);
            }
        }));
        conn.connect_established();

        assert!(fired.load(Ordering::SeqCst));
        assert!(conn.connected());
    }

    #[test]
    fn send_fast_path_delivers_all_bytes_to_peer() {
        let reactor = Reactor::new().unwrap();
        let (server_sock, client_sock, local, peer) = connected_pair();
        let conn = TcpConnection::new(reactor.clone(), "test#2".into(), server_sock, local, peer);
        conn.connect_established();
        conn.send(b"hello");

        let mut buf = [0u8; 16];
        let mut got = 0usize;
        for _ in 0..100 {
            let n = unsafe {
                libc::read(
                    client_sock.as_raw_fd(),
                    buf.as_mut_ptr().add(got) as *mut libc::c_void,
                    buf.len() - got,
                )
            };
            if n > 0 {
                got += n as usize;
                if got >= 5 {
                    break;
                }
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(&buf[..5], b"hello");
    }

    #[test]
    fn name_and_addresses_are_stable() {
        let reactor = Reactor::new().unwrap();
        let (server_sock, _client_sock, local, peer) = connected_pair();
        let conn = TcpConnection::new(reactor, "session#7".into(), server_sock, local, peer);
        assert_eq!(conn.name(), "session#7");
        assert_eq!(conn.local_address(), local);
        assert_eq!(conn.peer_address(), peer);
    }

    #[test]
    fn connect_destroyed_invokes_connection_callback_once() {
        let reactor = Reactor::new().unwrap();
        let (server_sock, _client_sock, local, peer) = connected_pair();
        let calls = Arc::new(StdMutex::new(0));
        let c = calls.clone();

        let conn = TcpConnection::new(reactor, "test#3".into(), server_sock, local, peer);
        conn.set_connection_callback(Arc::new(move |_conn: &Arc<TcpConnection>| {
            *c.lock().unwrap() += 1;
        }));
        conn.connect_established();
        assert_eq!(*calls.lock().unwrap(), 1);
        conn.connect_destroyed();
        assert_eq!(*calls.lock().unwrap(), 2);
        conn.connect_destroyed();
        assert_eq!(*calls.lock().unwrap(), 2, "connect_destroyed must not double-fire");
    }
}
