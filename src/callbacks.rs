use std::sync::Arc;

use log::debug;

use crate::buffer::Buffer;
use crate::tcp_connection::TcpConnection;
use crate::timestamp::Timestamp;

pub type ConnectionCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(&Arc<TcpConnection>, &mut Buffer, Timestamp) + Send + Sync>;
pub type WriteCompleteCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
pub type HighWaterCallback = Arc<dyn Fn(&Arc<TcpConnection>, usize) + Send + Sync>;
pub type CloseCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

/// Logs the up/down transition; the default until an application installs
/// its own, matching the teacher ecosystem's habit of a harmless default
/// handler rather than an `Option` the dispatch path has to branch on.
pub fn default_connection_callback() -> ConnectionCallback {
    Arc::new(|conn: &Arc<TcpConnection>| {
        debug!(
            "connection {} is {}",
            conn.name(),
            if conn.connected() { "up" } else { "down" }
        );
    })
}

/// Silently discards whatever arrived, the same behaviour the original
/// implementation's default message handler has: a server that forgot to
/// set a message callback does not spin retrying a read it never
/// consumes.
pub fn default_message_callback() -> MessageCallback {
    Arc::new(|_conn: &Arc<TcpConnection>, buf: &mut Buffer, _when: Timestamp| {
        buf.retrieve_all();
    })
}
