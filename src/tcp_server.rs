use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::info;

use crate::acceptor::Acceptor;
use crate::callbacks::{
    default_connection_callback, default_message_callback, ConnectionCallback, MessageCallback,
    WriteCompleteCallback,
};
use crate::net::Address;
use crate::reactor::Reactor;
use crate::reactor_pool::ReactorThreadPool;
use crate::tcp_connection::TcpConnection;

/// Accepts inbound connections on `loop_`, names each session
/// `"listen_host:port#N"`, hands it off round-robin to one of the pool's
/// io-loops, and owns the connection map for the server's lifetime (§4.8).
pub struct TcpServer {
    reactor: Arc<Reactor>,
    name: String,
    acceptor: Arc<Acceptor>,
    pool: Mutex<ReactorThreadPool>,
    connections: Mutex<HashMap<String, Arc<TcpConnection>>>,
    next_conn_id: AtomicUsize,
    started: AtomicBool,
    connection_cb: Mutex<ConnectionCallback>,
    message_cb: Mutex<MessageCallback>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
}

impl TcpServer {
    pub fn new(reactor: Arc<Reactor>, listen_addr: Address) -> std::io::Result<Arc<TcpServer>> {
        Self::with_reuse_port(reactor, listen_addr, true)
    }

    pub fn with_reuse_port(
        reactor: Arc<Reactor>,
        listen_addr: Address,
        reuse_port: bool,
    ) -> std::io::Result<Arc<TcpServer>> {
        let name = listen_addr.to_host_port();
        let acceptor = Acceptor::new(reactor.clone(), listen_addr, reuse_port)?;
        let pool = ReactorThreadPool::new(reactor.clone());

        let server = Arc::new(TcpServer {
            reactor,
            name,
            acceptor,
            pool: Mutex::new(pool),
            connections: Mutex::new(HashMap::new()),
            next_conn_id: AtomicUsize::new(1),
            started: AtomicBool::new(false),
            connection_cb: Mutex::new(default_connection_callback()),
            message_cb: Mutex::new(default_message_callback()),
            write_complete_cb: Mutex::new(None),
        });

        let weak = Arc::downgrade(&server);
        server.acceptor.set_new_connection_callback(move |socket, peer| {
            if let Some(server) = weak.upgrade() {
                server.new_connection(socket, peer);
            }
        });

        Ok(server)
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.connection_cb.lock().unwrap() = cb;
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.message_cb.lock().unwrap() = cb;
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.write_complete_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_thread_count(&self, count: usize) {
        self.pool.lock().unwrap().set_thread_count(count);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start(self: &Arc<Self>) {
        if !self.started.swap(true, Ordering::SeqCst) {
            self.pool.lock().unwrap().start();
        }
        let acceptor = self.acceptor.clone();
        self.reactor.run_in_loop(move || acceptor.listen());
    }

    fn new_connection(self: &Arc<Self>, socket: crate::net::Socket, peer_addr: Address) {
        self.reactor.assert_owner_thread();
        let id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let conn_name = format!("{}#{}", self.name, id);
        info!("TcpServer[{}]: new connection [{}] from {}", self.name, conn_name, peer_addr);

        let io_reactor = self.pool.lock().unwrap().next();
        let local_addr = socket.local_addr().unwrap_or(peer_addr);
        let conn = TcpConnection::new(io_reactor.clone(), conn_name.clone(), socket, local_addr, peer_addr);
        conn.set_connection_callback(self.connection_cb.lock().unwrap().clone());
        conn.set_message_callback(self.message_cb.lock().unwrap().clone());
        if let Some(cb) = self.write_complete_cb.lock().unwrap().clone() {
            conn.set_write_complete_callback(cb);
        }

        let weak = Arc::downgrade(self);
        conn.set_close_callback(Arc::new(move |conn: &Arc<TcpConnection>| {
            if let Some(this) = weak.upgrade() {
                this.remove_connection(conn);
            }
        }));

        self.connections.lock().unwrap().insert(conn_name, conn.clone());
        let c = conn.clone();
        io_reactor.run_in_loop(move || c.connect_established());
    }

    fn remove_connection(self: &Arc<Self>, conn: &Arc<TcpConnection>) {
        let this = self.clone();
        let conn = conn.clone();
        self.reactor.run_in_loop(move || {
            this.connections.lock().unwrap().remove(conn.name());
            let io_reactor = conn.get_loop();
            let c = conn.clone();
            io_reactor.queue_in_loop(move || c.connect_destroyed());
        });
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn local_addr(&self) -> Address {
        self.acceptor.local_addr()
    }
}
