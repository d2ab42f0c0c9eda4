//! Events queued for the host.
//!
//! State changes are published through a queue the host drains; nothing is
//! delivered from inside library calls, so the host never sees a callback
//! while a connection is mid-mutation.

use std::net::SocketAddr;

use keel_proto::Identity;

use crate::connection::ConnectionState;

/// Snapshot of a connection, as shown to the application.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Collapsed API-visible state.
    pub state: ConnectionState,
    /// Parent listen socket, for accepted connections.
    pub listen_socket: Option<u32>,
    pub identity_remote: Identity,
    /// Remote network address, when the identity carries one.
    pub address_remote: Option<SocketAddr>,
    pub user_data: i64,
    pub end_reason: i32,
    pub end_debug: String,
    pub description: String,
}

/// Posted whenever a connection's API-visible state changes.
#[derive(Debug, Clone)]
pub struct ConnectionStatusChanged {
    pub info: ConnectionInfo,
    /// API-visible state before the change.
    pub old_state: ConnectionState,
    /// Handle of the connection.
    pub connection: u32,
}

/// Host-visible event.
#[derive(Debug, Clone)]
pub enum Event {
    StatusChanged(ConnectionStatusChanged),
    /// A connection needs a CA-signed cert; the host should obtain one and
    /// call `Runtime::install_cert` (or `Runtime::cert_request_failed`).
    CertRequested,
}
