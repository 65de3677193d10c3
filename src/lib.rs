//! A reactor-style, multi-threaded TCP networking runtime: one
//! [`Reactor`] per thread multiplexes readiness over `poll(2)` or
//! `epoll(2)`, [`TcpServer`] and [`TcpClient`] build session management on
//! top of it, and a [`TimerQueue`](timer_queue::TimerQueue) fronted by a
//! single `timerfd` provides one-shot and repeating timers.
//!
//! The event loop, its timer wheel, and its non-blocking TCP plumbing are
//! all single-threaded by design: every `Channel`, socket, and buffer is
//! read and mutated only on the thread that owns its `Reactor`. Crossing
//! threads always goes through `Reactor::run_in_loop`/`queue_in_loop`,
//! which marshal a boxed closure across an `eventfd`-backed wakeup.

#[macro_use]
mod macros;

pub mod acceptor;
pub mod buffer;
pub mod callbacks;
pub mod channel;
pub mod connector;
pub mod interest;
pub mod net;
pub mod poller;
pub mod reactor;
pub mod reactor_pool;
pub mod reactor_thread;
pub mod tcp_client;
pub mod tcp_connection;
pub mod tcp_server;
mod timer;
mod timer_id;
mod timer_queue;
pub mod timestamp;
mod waker;

pub use acceptor::Acceptor;
pub use buffer::Buffer;
pub use channel::Channel;
pub use connector::Connector;
pub use interest::Interest;
pub use net::{Address, Socket};
pub use reactor::Reactor;
pub use reactor_pool::ReactorThreadPool;
pub use reactor_thread::ReactorThread;
pub use tcp_client::TcpClient;
pub use tcp_connection::TcpConnection;
pub use tcp_server::TcpServer;
pub use timer_id::TimerId;
pub use timestamp::Timestamp;
