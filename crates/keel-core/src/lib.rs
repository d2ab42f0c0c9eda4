//! Keel connection core.
//!
//! This crate owns the per-connection state machine, the cryptographic
//! handshake driver, connection-id allocation, receive-message queues, and
//! the in-process loopback ("pipe") transport.  Reliability, reassembly and
//! congestion control live behind the [`reliability::Reliability`] trait;
//! socket I/O and timers belong to the host.
//!
//! Everything is single-threaded and cooperative: the host owns a
//! [`Runtime`] and drives [`Runtime::think`] at (or after) the wake times
//! the runtime reports.  Errors surface as state transitions plus queued
//! [`events::Event`]s, never as panics.

#![forbid(unsafe_code)]

pub mod config;
pub mod connection;
pub mod events;
pub mod listen;
pub mod message;
pub mod pipe;
pub mod reliability;
pub mod runtime;
pub mod stats;

pub use config::ConnectionConfig;
pub use connection::ConnectionState;
pub use events::{ConnectionInfo, ConnectionStatusChanged, Event};
pub use message::Message;
pub use runtime::Runtime;

/// Monotonic timestamps, in microseconds.  The host supplies them; the
/// library never reads a clock.
pub type Micros = i64;

pub(crate) const MILLION: Micros = 1_000_000;

/// How often to re-send the end-to-end connect request while connecting.
pub const CONNECT_RETRY_INTERVAL: Micros = MILLION / 2;

/// Poll interval while waiting on cert material during connect.
pub const CRYPTO_READY_POLL_INTERVAL: Micros = MILLION / 20;

/// Grace period in FinWait before the connection reclaims itself.
pub const FIN_WAIT_TIMEOUT: Micros = 5 * MILLION;

/// Ordinary keepalive interval once connected.
pub const KEEP_ALIVE_INTERVAL: Micros = 10 * MILLION;

/// Ping interval while the connection appears to be timing out.
pub const AGGRESSIVE_PING_INTERVAL: Micros = 200 * 1000;

/// Minimum spacing between replies to unauthenticated garbage.
pub const SPAM_REPLY_INTERVAL: Micros = MILLION / 4;

/// Reply timeouts tolerated before a connected link is declared dead.
pub const MAX_REPLY_TIMEOUTS: i32 = 4;

/// Hard cap on simultaneously live connections per runtime.
pub const MAX_CONNECTIONS: usize = 0x1FFF;

/// Recently retired lower-16 connection ids remembered to avoid reuse.
pub const MAX_RECENT_CONNECTION_IDS: usize = 256;

/// Message send modifier flags.
pub mod send_flags {
    pub const UNRELIABLE: i32 = 0;
    pub const NO_NAGLE: i32 = 1;
    /// Drop the message instead of queueing it if it cannot go out now.
    pub const NO_DELAY: i32 = 4;
    pub const RELIABLE: i32 = 8;
}
