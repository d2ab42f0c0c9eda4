//! Listen sockets.
//!
//! A listen socket is the parent of its accepted child connections and
//! aggregates their received messages onto a single queue.  It does not
//! own the children; the runtime's registry does.  The socket holds child
//! handles, the children hold the socket handle, and teardown clears the
//! back-reference first.

use crate::config::ConnectionConfig;
use crate::message::QueueId;

pub(crate) struct ListenSocket {
    pub(crate) handle: u32,
    /// Aggregate receive queue, merge-ordered by arrival across children.
    pub(crate) recv_queue: QueueId,
    /// Handles of accepted child connections.
    pub(crate) children: Vec<u32>,
    pub(crate) config: ConnectionConfig,
}

impl ListenSocket {
    pub(crate) fn new(handle: u32, recv_queue: QueueId, config: ConnectionConfig) -> Self {
        Self {
            handle,
            recv_queue,
            children: Vec::new(),
            config,
        }
    }

    pub(crate) fn add_child(&mut self, conn: u32) {
        debug_assert!(!self.children.contains(&conn));
        self.children.push(conn);
    }

    pub(crate) fn remove_child(&mut self, conn: u32) {
        self.children.retain(|&c| c != conn);
    }
}
