use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::info;

use crate::callbacks::{
    default_connection_callback, default_message_callback, ConnectionCallback, MessageCallback,
    WriteCompleteCallback,
};
use crate::connector::Connector;
use crate::net::{Address, Socket};
use crate::reactor::Reactor;
use crate::tcp_connection::TcpConnection;

/// Holds a [`Connector`] and at most one live [`TcpConnection`] at a time.
/// `enable_retry()` makes a dropped connection re-trigger the connector;
/// without it a closed connection simply stays closed (§4.8).
pub struct TcpClient {
    reactor: Arc<Reactor>,
    connector: Arc<Connector>,
    connection: Mutex<Option<Arc<TcpConnection>>>,
    retry: AtomicBool,
    connect_enabled: AtomicBool,
    next_conn_id: AtomicUsize,
    connection_cb: Mutex<ConnectionCallback>,
    message_cb: Mutex<MessageCallback>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
}

impl TcpClient {
    pub fn new(reactor: Arc<Reactor>, server_addr: Address) -> Arc<TcpClient> {
        let connector = Connector::new(reactor.clone(), server_addr);
        let client = Arc::new(TcpClient {
            reactor,
            connector,
            connection: Mutex::new(None),
            retry: AtomicBool::new(false),
            connect_enabled: AtomicBool::new(true),
            next_conn_id: AtomicUsize::new(1),
            connection_cb: Mutex::new(default_connection_callback()),
            message_cb: Mutex::new(default_message_callback()),
            write_complete_cb: Mutex::new(None),
        });

        let weak = Arc::downgrade(&client);
        client.connector.set_new_connection_callback(move |socket| {
            if let Some(client) = weak.upgrade() {
                client.new_connection(socket);
            }
        });

        client
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

    pub fn enable_retry(&self) {
        self.retry.store(true, Ordering::SeqCst);
    }

    pub fn connect(self: &Arc<Self>) {
        info!("TcpClient: connecting");
        self.connect_enabled.store(true, Ordering::SeqCst);
        self.connector.start();
    }

    pub fn disconnect(&self) {
        self.connect_enabled.store(false, Ordering::SeqCst);
        if let Some(conn) = self.connection.lock().unwrap().clone() {
            conn.shutdown();
        }
    }

    pub fn stop(&self) {
        self.connect_enabled.store(false, Ordering::SeqCst);
        self.connector.stop();
    }

    pub fn connection(&self) -> Option<Arc<TcpConnection>> {
        self.connection.lock().unwrap().clone()
    }

    fn new_connection(self: &Arc<Self>, socket: Socket) {
        self.reactor.assert_owner_thread();
        let peer_addr = socket.peer_addr().unwrap_or(Address::new(0));
        let local_addr = socket.local_addr().unwrap_or(Address::new(0));
        let id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let conn_name = format!(":{}#{}", peer_addr, id);

        let conn = TcpConnection::new(self.reactor.clone(), conn_name, socket, local_addr, peer_addr);
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

        *self.connection.lock().unwrap() = Some(conn.clone());
        conn.connect_established();
    }

    fn remove_connection(self: &Arc<Self>, conn: &Arc<TcpConnection>) {
        self.reactor.assert_owner_thread();
        debug_assert!(Arc::ptr_eq(&self.reactor, &conn.get_loop()));
        *self.connection.lock().unwrap() = None;

        let c = conn.clone();
        self.reactor.queue_in_loop(move || c.connect_destroyed());

        if self.retry.load(Ordering::SeqCst) && self.connect_enabled.load(Ordering::SeqCst) {
            info!("TcpClient: reconnecting");
            self.connector.restart();
        }
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        let conn = self.connection.lock().unwrap().take();
        match conn {
            Some(conn) => {
                let reactor = self.reactor.clone();
                reactor.run_in_loop(move || {
                    conn.set_close_callback(Arc::new(move |conn: &Arc<TcpConnection>| {
                        let c = conn.clone();
                        conn.get_loop().queue_in_loop(move || c.connect_destroyed());
                    }));
                });
            }
            None => {
                self.connector.stop();
                let connector = self.connector.clone();
                self.reactor
                    .run_after(1.0, move || {
                        let _ = &connector;
                    });
            }
        }
    }
}
