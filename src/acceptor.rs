use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::channel::new_shared;
use crate::net::{Address, Socket};
use crate::reactor::Reactor;

type NewConnectionCallback = Box<dyn FnMut(Socket, Address) + Send>;

/// Owns a listening socket and the [`Channel`](crate::channel::Channel)
/// bound to it. `handle_accept` accepts exactly one connection per readable
/// notification — the level-triggered poller guarantees a re-notify if
/// more are pending (§4.5).
pub struct Acceptor {
    reactor: Arc<Reactor>,
    socket: Socket,
    channel: crate::channel::SharedChannel,
    new_connection_cb: Mutex<Option<NewConnectionCallback>>,
    listening: std::sync::atomic::AtomicBool,
}

impl Acceptor {
    pub fn new(reactor: Arc<Reactor>, listen_addr: Address, reuse_port: bool) -> std::io::Result<Arc<Acceptor>> {
        let socket = Socket::new_nonblocking()?;
        socket.set_reuse_addr(true);
        if reuse_port {
            socket.set_reuse_port(true);
        }
        socket.bind(&listen_addr)?;
        let channel = new_shared(socket.as_raw_fd());

        let acceptor = Arc::new(Acceptor {
            reactor,
            socket,
            channel,
            new_connection_cb: Mutex::new(None),
            listening: std::sync::atomic::AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&acceptor);
        acceptor.channel.lock().unwrap().set_read_callback(move |_when| {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_accept();
            }
        });

        Ok(acceptor)
    }

    pub fn set_new_connection_callback<F>(&self, cb: F)
    where
        F: FnMut(Socket, Address) + Send + 'static,
    {
        *self.new_connection_cb.lock().unwrap() = Some(Box::new(cb));
    }

    pub fn listen(&self) {
        self.reactor.assert_owner_thread();
        self.listening.store(true, std::sync::atomic::Ordering::SeqCst);
        self.socket.listen().expect("listen() failed");
        self.channel.lock().unwrap().enable_reading();
        self.reactor.update_channel(&self.channel);
        debug!("acceptor listening on {}", self.local_addr());
    }

    pub fn local_addr(&self) -> Address {
        self.socket.local_addr().expect("listening socket has no local address")
    }

    fn handle_accept(&self) {
        self.reactor.assert_owner_thread();
        match self.socket.accept() {
            Ok(Some((conn_socket, peer))) => {
                let mut cb = self.new_connection_cb.lock().unwrap();
                match cb.as_mut() {
                    Some(cb) => cb(conn_socket, peer),
                    None => debug!("no new-connection callback set, dropping accepted fd"),
                }
            }
            Ok(None) => {}
            Err(e) => warn!("accept() failed: {e}"),
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.channel.lock().unwrap().disable_all();
        self.reactor.remove_channel(self.socket.as_raw_fd());
    }
}
