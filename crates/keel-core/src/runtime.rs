//! The runtime: connection registry, id allocation, and the host API.
//!
//! A [`Runtime`] owns every connection and listen socket, the message
//! arena, the recent-connection-id ring and the host event queue.  Hosts
//! that want a process-wide instance can hold one in a static of their
//! own; keeping it a value means tests get a fresh isolated world each.
//!
//! All calls are made from a single logical owner thread, interleaved with
//! [`Runtime::think`].

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use keel_common::Error;
use keel_crypto::{SigningKeypair, TrustedCaKey, TRUSTED_CA_KEYS};
use keel_proto::{Identity, SignedCertificate, SignedSessionCryptInfo, MAX_MESSAGE_SIZE_SEND};
use tracing::debug;

use crate::config::ConnectionConfig;
use crate::connection::{
    pipe_fake_send_stats, pipe_fake_stats_round_trip, ConnCtx, Connection, ConnectionState,
    DeferredOp, LocalCertStore, Transport,
};
use crate::events::{ConnectionInfo, Event};
use crate::listen::ListenSocket;
use crate::message::Message;
use crate::message::MessageArena;
use crate::reliability::{DatagramReliability, Reliability};
use crate::{
    send_flags, Micros, MAX_CONNECTIONS, MAX_RECENT_CONNECTION_IDS, SPAM_REPLY_INTERVAL,
};

/// Attempts at drawing an unused random connection id before giving up.
const MAX_CONNECTION_ID_TRIES: u32 = 10_000;

pub struct Runtime {
    identity_local: Identity,
    app_id: u32,
    config: ConnectionConfig,
    trusted_keys: Vec<TrustedCaKey>,
    local_cert: Option<LocalCertStore>,

    /// Live connections, keyed by the lower 16 bits of their id.
    pub(crate) connections: HashMap<u16, Connection>,
    listen_sockets: HashMap<u32, ListenSocket>,
    next_listen_handle: u32,

    pub(crate) messages: MessageArena,
    /// Recently retired lower-16 ids, oldest first.
    recent_conn_ids: VecDeque<u16>,

    events: VecDeque<Event>,
    deferred: Vec<DeferredOp>,
    in_deferred: bool,

    /// Shared gate on replies to unauthenticated garbage.
    /// TODO make this per-peer so one spoofed source cannot silence
    /// replies to everyone else.
    last_spam_reply: Micros,
    last_decrypt_warn: Micros,

    /// Wall-clock seconds, used only for cert expiry checks.
    now_unix: u32,
    cert_request_outstanding: bool,
}

impl Runtime {
    pub fn new(identity_local: Identity, app_id: u32) -> Self {
        Self {
            identity_local,
            app_id,
            config: ConnectionConfig::default(),
            trusted_keys: TRUSTED_CA_KEYS.to_vec(),
            local_cert: None,
            connections: HashMap::new(),
            listen_sockets: HashMap::new(),
            next_listen_handle: 1,
            messages: MessageArena::new(),
            recent_conn_ids: VecDeque::new(),
            events: VecDeque::new(),
            deferred: Vec::new(),
            in_deferred: false,
            last_spam_reply: 0,
            last_decrypt_warn: 0,
            now_unix: 0,
            cert_request_outstanding: false,
        }
    }

    /// Replace the runtime-scope configuration defaults.
    pub fn set_config(&mut self, config: ConnectionConfig) {
        self.config = config;
    }

    /// Replace the trusted CA table.  Production uses the compiled-in
    /// table; tests issue their own CAs.
    pub fn set_trusted_ca_keys(&mut self, keys: Vec<TrustedCaKey>) {
        self.trusted_keys = keys;
    }

    /// Tell the runtime what time it is, wall-clock, for cert expiry.
    pub fn set_wall_clock_unix(&mut self, secs: u32) {
        self.now_unix = secs;
    }

    pub fn app_id(&self) -> u32 {
        self.app_id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity_local
    }

    pub fn connection_count(&self) -> usize {
        self.connections.values().filter(|c| c.id_local != 0).count()
    }

    /// Next host event, if any.
    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    // ------------------------------------------------------------------
    // Connection creation
    // ------------------------------------------------------------------

    /// Begin connecting to a remote identity over a host-driven transport.
    ///
    /// The host exchanges the handshake material and datagrams; see
    /// [`Runtime::handshake_material`], [`Runtime::recv_crypto_handshake`]
    /// and [`Runtime::handle_data_chunk`].
    pub fn connect(&mut self, identity_remote: Identity, now: Micros) -> Result<u32, Error> {
        let config = self.config.clone();
        self.init_connection(
            Identity::Invalid,
            identity_remote,
            Transport::External,
            None,
            config,
            Box::new(DatagramReliability::new()),
            now,
        )
    }

    /// Create a listen socket.  `config` overrides are inherited by every
    /// accepted child.
    pub fn create_listen_socket(&mut self, mut config: ConnectionConfig) -> u32 {
        config.inherit(&self.config);
        let handle = self.next_listen_handle;
        self.next_listen_handle += 1;
        let queue = self.messages.new_listen_queue();
        self.listen_sockets
            .insert(handle, ListenSocket::new(handle, queue, config));
        handle
    }

    /// Accept an incoming connection attempt as a child of `listen`.
    ///
    /// The transport supplies the claimed remote identity and the remote
    /// connection id from the connect request.  The connection waits in
    /// `Connecting` until the application calls
    /// [`Runtime::accept_connection`].
    pub fn begin_accept(
        &mut self,
        listen: u32,
        identity_remote: Identity,
        remote_conn_id: u32,
        now: Micros,
    ) -> Result<u32, Error> {
        let config = self
            .listen_sockets
            .get(&listen)
            .ok_or_else(|| Error::not_found("listen socket"))?
            .config
            .clone();
        let conn = self.init_connection(
            Identity::Invalid,
            identity_remote,
            Transport::External,
            Some(listen),
            config,
            Box::new(DatagramReliability::new()),
            now,
        )?;
        if let Some(c) = self.connections.get_mut(&(conn as u16)) {
            c.id_remote = remote_conn_id;
        }
        Ok(conn)
    }

    /// The application accepts a pending incoming connection.
    pub fn accept_connection(&mut self, conn: u32, now: Micros) -> Result<(), Error> {
        self.with_conn(conn, now, |c, ctx| {
            if c.state() != ConnectionState::Connecting || c.parent_listen_socket.is_none() {
                return Err(Error::invalid_state(
                    "accept is only valid on an incoming connection in the connecting state",
                ));
            }
            c.accepted = true;
            let _ = c.think_crypto_ready(ctx, now);
            c.set_next_think_time(now);
            Ok(())
        })?
    }

    /// Create a pair of loopback connections wired to each other.  Both
    /// come back fully connected.
    pub fn create_socket_pair(
        &mut self,
        identity_a: Identity,
        identity_b: Identity,
        now: Micros,
    ) -> Result<(u32, u32), Error> {
        crate::pipe::create_socket_pair(self, identity_a, identity_b, now)
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn init_connection(
        &mut self,
        identity_local: Identity,
        identity_remote: Identity,
        transport: Transport,
        parent_listen: Option<u32>,
        mut config: ConnectionConfig,
        reliability: Box<dyn Reliability>,
        now: Micros,
    ) -> Result<u32, Error> {
        if self.connection_count() >= MAX_CONNECTIONS {
            return Err(Error::limit_exceeded("Too many connections."));
        }

        let identity_local = if identity_local.is_invalid() {
            self.identity_local.clone()
        } else {
            identity_local
        };
        if identity_local.is_invalid() {
            return Err(Error::config("We don't know our local identity."));
        }

        // Validate the parent before allocating anything.
        let parent_queue = match parent_listen {
            Some(ls) => Some(
                self.listen_sockets
                    .get(&ls)
                    .ok_or_else(|| Error::not_found("listen socket"))?
                    .recv_queue,
            ),
            None => None,
        };

        let id = self.allocate_connection_id()?;
        config.inherit(&self.config);

        let queue = self.messages.new_connection_queue();
        let mut conn = Connection::new(identity_local, config, transport, reliability, queue);
        conn.id_local = id;
        conn.identity_remote = identity_remote;
        conn.parent_listen_socket = parent_listen;
        conn.parent_listen_queue = parent_queue;
        conn.set_description();
        conn.clear_crypto();
        debug!(conn = %conn.description(), "connection initialized");

        let key = id as u16;
        self.connections.insert(key, conn);
        if let Some(ls) = parent_listen {
            if let Some(sock) = self.listen_sockets.get_mut(&ls) {
                sock.add_child(id);
            }
        }

        self.with_conn(id, now, |c, ctx| {
            c.set_state(ctx, now, ConnectionState::Connecting);
            c.init_connection_crypto(ctx, now);
            c.set_next_think_time(now);
        })?;
        Ok(id)
    }

    /// Draw a random connection id passing the sanity rules: neither
    /// 16-bit half zero, lower half not live and not recently used.
    fn allocate_connection_id(&mut self) -> Result<u32, Error> {
        for _ in 0..MAX_CONNECTION_ID_TRIES {
            let id: u32 = rand::random();
            if id & 0xFFFF == 0 || id & 0xFFFF_0000 == 0 {
                continue;
            }
            let low = id as u16;
            if self.recent_conn_ids.contains(&low) {
                continue;
            }
            if self.connections.contains_key(&low) {
                continue;
            }
            return Ok(id);
        }
        Err(Error::internal("Unable to find unique connection ID"))
    }

    // ------------------------------------------------------------------
    // Connection access plumbing
    // ------------------------------------------------------------------

    fn resolve(&self, conn: u32) -> Result<u16, Error> {
        let key = conn as u16;
        match self.connections.get(&key) {
            Some(c) if c.id_local == conn => Ok(key),
            _ => Err(Error::not_found(format!("connection #{conn}"))),
        }
    }

    /// Run `f` against one connection with runtime resources in scope.
    /// Deferred cross-connection work and destruction requests are applied
    /// before returning.
    fn with_conn<R>(
        &mut self,
        conn: u32,
        now: Micros,
        f: impl FnOnce(&mut Connection, &mut ConnCtx<'_>) -> R,
    ) -> Result<R, Error> {
        let key = self.resolve(conn)?;
        let Some(mut c) = self.connections.remove(&key) else {
            return Err(Error::not_found(format!("connection #{conn}")));
        };
        let result = {
            let mut ctx = ConnCtx {
                messages: &mut self.messages,
                events: &mut self.events,
                deferred: &mut self.deferred,
                local_cert: self.local_cert.as_ref(),
                app_id: self.app_id,
                trusted: &self.trusted_keys,
                now_unix: self.now_unix,
                cert_request_outstanding: &mut self.cert_request_outstanding,
                last_decrypt_warn: &mut self.last_decrypt_warn,
            };
            f(&mut c, &mut ctx)
        };
        let reclaim = c.pending_destroy;
        self.connections.insert(key, c);
        if reclaim {
            self.free_connection_resources(key, now);
        }
        self.process_deferred();
        Ok(result)
    }

    /// Tear a connection down: final state change, queue release, listen
    /// detach, and the recent-id ring.  The husk stays in the table as
    /// `Dead` until the next think sweeps it.
    fn free_connection_resources(&mut self, key: u16, now: Micros) {
        let Some(mut c) = self.connections.remove(&key) else {
            return;
        };
        {
            let mut ctx = ConnCtx {
                messages: &mut self.messages,
                events: &mut self.events,
                deferred: &mut self.deferred,
                local_cert: self.local_cert.as_ref(),
                app_id: self.app_id,
                trusted: &self.trusted_keys,
                now_unix: self.now_unix,
                cert_request_outstanding: &mut self.cert_request_outstanding,
                last_decrypt_warn: &mut self.last_decrypt_warn,
            };
            c.set_state(&mut ctx, now, ConnectionState::Dead);
        }
        c.pending_destroy = false;
        self.messages.free_queue(c.recv_queue);

        if let Some(ls) = c.parent_listen_socket.take() {
            if let Some(sock) = self.listen_sockets.get_mut(&ls) {
                sock.remove_child(c.id_local);
            }
            c.parent_listen_queue = None;
        }

        // Remember the id so we don't hand it out again soon.
        if c.id_local != 0 {
            while self.recent_conn_ids.len() >= MAX_RECENT_CONNECTION_IDS {
                self.recent_conn_ids.pop_front();
            }
            self.recent_conn_ids.push_back(key);
            c.id_local = 0;
        }

        c.set_next_think_time(now);
        self.connections.insert(key, c);
        self.process_deferred();
    }

    fn process_deferred(&mut self) {
        if self.in_deferred {
            return;
        }
        self.in_deferred = true;
        while !self.deferred.is_empty() {
            let ops: Vec<DeferredOp> = self.deferred.drain(..).collect();
            for op in ops {
                match op {
                    DeferredOp::PartnerClosedByPeer {
                        partner,
                        reason,
                        debug,
                        now: op_now,
                    } => {
                        if let Ok(key) = self.resolve(partner) {
                            if let Some(mut c) = self.connections.remove(&key) {
                                {
                                    let mut ctx = ConnCtx {
                                        messages: &mut self.messages,
                                        events: &mut self.events,
                                        deferred: &mut self.deferred,
                                        local_cert: self.local_cert.as_ref(),
                                        app_id: self.app_id,
                                        trusted: &self.trusted_keys,
                                        now_unix: self.now_unix,
                                        cert_request_outstanding: &mut self
                                            .cert_request_outstanding,
                                        last_decrypt_warn: &mut self.last_decrypt_warn,
                                    };
                                    c.connection_state_closed_by_peer(
                                        &mut ctx, op_now, reason, &debug,
                                    );
                                }
                                self.connections.insert(key, c);
                            }
                        }
                    }
                    DeferredOp::PipeStatsRoundTrip {
                        local,
                        partner,
                        now: op_now,
                    } => {
                        self.pipe_round_trip(local, partner, op_now);
                    }
                }
            }
        }
        self.in_deferred = false;
    }

    fn pipe_round_trip(&mut self, a: u32, b: u32, now: Micros) {
        let (Ok(ka), Ok(kb)) = (self.resolve(a), self.resolve(b)) else {
            return;
        };
        let Some(mut ca) = self.connections.remove(&ka) else {
            return;
        };
        let Some(mut cb) = self.connections.remove(&kb) else {
            self.connections.insert(ka, ca);
            return;
        };
        pipe_fake_stats_round_trip(&mut ca, &mut cb, now);
        self.connections.insert(ka, ca);
        self.connections.insert(kb, cb);
    }

    // ------------------------------------------------------------------
    // Lifecycle API
    // ------------------------------------------------------------------

    /// Close a connection.  With `linger`, a connected connection drains
    /// queued reliable data before tearing down.
    pub fn close_connection(
        &mut self,
        conn: u32,
        reason: i32,
        debug: Option<&str>,
        linger: bool,
        now: Micros,
    ) -> Result<(), Error> {
        self.with_conn(conn, now, |c, ctx| c.api_close(ctx, now, reason, debug, linger))?
    }

    /// Destroy a connection immediately.
    pub fn destroy_connection(&mut self, conn: u32, now: Micros) -> Result<(), Error> {
        let key = self.resolve(conn)?;
        self.free_connection_resources(key, now);
        self.connections.remove(&key);
        Ok(())
    }

    /// Destroy on the next think, once the stack is unwound.
    pub fn queue_destroy_connection(&mut self, conn: u32, now: Micros) -> Result<(), Error> {
        let key = self.resolve(conn)?;
        self.free_connection_resources(key, now);
        Ok(())
    }

    /// Destroy a listen socket and all of its child connections.
    pub fn destroy_listen_socket(&mut self, listen: u32, now: Micros) -> Result<(), Error> {
        let sock = self
            .listen_sockets
            .remove(&listen)
            .ok_or_else(|| Error::not_found("listen socket"))?;
        debug!(listen = sock.handle, children = sock.children.len(), "destroying listen socket");
        for child in sock.children.clone() {
            let _ = self.destroy_connection(child, now);
        }
        debug_assert!(self.messages.is_empty(sock.recv_queue));
        self.messages.purge(sock.recv_queue);
        self.messages.free_queue(sock.recv_queue);
        Ok(())
    }

    /// The peer told us (through the host's transport) that it closed.
    pub fn handle_peer_close(
        &mut self,
        conn: u32,
        reason: i32,
        debug: &str,
        now: Micros,
    ) -> Result<(), Error> {
        self.with_conn(conn, now, |c, ctx| {
            c.connection_state_closed_by_peer(ctx, now, reason, debug)
        })
    }

    // ------------------------------------------------------------------
    // Handshake API (host-driven transports)
    // ------------------------------------------------------------------

    /// Our signed cert and signed session-crypt info, once ready, for the
    /// host to put on the wire.
    pub fn handshake_material(
        &self,
        conn: u32,
    ) -> Result<(SignedCertificate, SignedSessionCryptInfo), Error> {
        let key = self.resolve(conn)?;
        self.connections[&key]
            .handshake_material()
            .ok_or_else(|| Error::invalid_state("local crypto not initialized yet"))
    }

    /// Record the connection id the peer chose, from its connect packets.
    /// Must happen before the handshake: the id pair is mixed into key
    /// derivation.
    pub fn set_remote_connection_id(&mut self, conn: u32, remote_id: u32) -> Result<(), Error> {
        let key = self.resolve(conn)?;
        if let Some(c) = self.connections.get_mut(&key) {
            c.id_remote = remote_id;
        }
        Ok(())
    }

    /// Process the peer's crypto handshake (cert + signed session info).
    pub fn recv_crypto_handshake(
        &mut self,
        conn: u32,
        peer_cert: &SignedCertificate,
        peer_crypt: &SignedSessionCryptInfo,
        is_server: bool,
        now: Micros,
    ) -> Result<(), Error> {
        let ok = self.with_conn(conn, now, |c, ctx| {
            c.recv_crypto_handshake(ctx, now, peer_cert, peer_crypt, is_server)
        })?;
        if ok {
            Ok(())
        } else {
            let detail = self
                .connection_info(conn)
                .map(|i| i.end_debug)
                .unwrap_or_default();
            Err(Error::protocol(detail))
        }
    }

    /// Promote a freshly wired loopback half to connected.
    pub(crate) fn mark_pipe_connected(&mut self, conn: u32, now: Micros) -> Result<(), Error> {
        self.with_conn(conn, now, |c, ctx| c.connection_state_connected(ctx, now))?
    }

    /// True once the crypto handshake completed and keys are live.
    pub fn handshake_complete(&self, conn: u32) -> bool {
        self.resolve(conn)
            .ok()
            .map(|key| self.connections[&key].crypt_keys_valid())
            .unwrap_or(false)
    }

    /// The transport indicated route/NAT negotiation is under way.
    pub fn begin_route_negotiation(&mut self, conn: u32, now: Micros) -> Result<(), Error> {
        self.with_conn(conn, now, |c, ctx| c.connection_state_finding_route(ctx, now))?
    }

    /// Whether our local cert names an identity.  Transports that do not
    /// see one in the cert must advertise the identity out of band.
    pub fn local_cert_binds_identity(&self, conn: u32) -> Option<bool> {
        let key = self.resolve(conn).ok()?;
        Some(self.connections[&key].local_cert_binds_identity())
    }

    /// The peer's verified certificate, once the handshake completed.
    pub fn peer_certificate(&self, conn: u32) -> Option<keel_proto::Certificate> {
        let key = self.resolve(conn).ok()?;
        self.connections[&key].peer_certificate().cloned()
    }

    /// The protocol version the peer claimed in its session crypt info.
    pub fn peer_protocol_version(&self, conn: u32) -> Option<u32> {
        let key = self.resolve(conn).ok()?;
        self.connections[&key]
            .peer_session_info()
            .map(|info| info.protocol_version)
    }

    // ------------------------------------------------------------------
    // Data path
    // ------------------------------------------------------------------

    /// Send a message on a connection.  Returns the assigned message
    /// number, or 0 if a no-delay message was dropped.
    pub fn send_message(
        &mut self,
        conn: u32,
        payload: impl Into<Bytes>,
        flags: i32,
        now: Micros,
    ) -> Result<i64, Error> {
        let payload: Bytes = payload.into();
        if payload.len() > MAX_MESSAGE_SIZE_SEND {
            return Err(Error::protocol(format!(
                "Message size {} is too big.  Max is {}",
                payload.len(),
                MAX_MESSAGE_SIZE_SEND
            )));
        }

        enum SendPath {
            Pipe { partner: u32, msg_num: i64 },
            External(i64),
            Dropped,
        }

        let path = self.with_conn(conn, now, |c, _ctx| -> Result<SendPath, Error> {
            match c.state() {
                ConnectionState::None
                | ConnectionState::FinWait
                | ConnectionState::Linger
                | ConnectionState::Dead => {
                    Err(Error::invalid_state("connection is closed"))
                }
                ConnectionState::ClosedByPeer | ConnectionState::ProblemDetectedLocally => {
                    Err(Error::invalid_state("no connection"))
                }
                ConnectionState::Connecting | ConnectionState::FindingRoute
                    if flags & send_flags::NO_DELAY != 0 =>
                {
                    Ok(SendPath::Dropped)
                }
                ConnectionState::Connecting
                | ConnectionState::FindingRoute
                | ConnectionState::Connected => match &c.transport {
                    Transport::Pipe { partner } => {
                        let Some(p) = partner else {
                            return Err(Error::internal("no partner pipe"));
                        };
                        let partner = *p;
                        c.last_sent_msg_num += 1;
                        Ok(SendPath::Pipe {
                            partner,
                            msg_num: c.last_sent_msg_num,
                        })
                    }
                    Transport::External => {
                        let n = c.reliability.send_message(payload.clone(), flags, now);
                        Ok(SendPath::External(n))
                    }
                },
            }
        })??;

        match path {
            SendPath::Dropped => Ok(0),
            SendPath::External(n) => Ok(n),
            SendPath::Pipe { partner, msg_num } => {
                self.pipe_deliver(conn, partner, payload, msg_num, now);
                Ok(msg_num)
            }
        }
    }

    /// Deliver a message directly across a loopback pair, faking the wire
    /// stats on both ends.
    fn pipe_deliver(&mut self, from: u32, to: u32, payload: Bytes, msg_num: i64, now: Micros) {
        let (Ok(from_key), Ok(to_key)) = (self.resolve(from), self.resolve(to)) else {
            return;
        };
        let Some(mut sender) = self.connections.remove(&from_key) else {
            return;
        };
        let Some(mut receiver) = self.connections.remove(&to_key) else {
            self.connections.insert(from_key, sender);
            return;
        };

        pipe_fake_send_stats(&mut sender, &mut receiver, payload.len(), now);
        {
            let mut ctx = ConnCtx {
                messages: &mut self.messages,
                events: &mut self.events,
                deferred: &mut self.deferred,
                local_cert: self.local_cert.as_ref(),
                app_id: self.app_id,
                trusted: &self.trusted_keys,
                now_unix: self.now_unix,
                cert_request_outstanding: &mut self.cert_request_outstanding,
                last_decrypt_warn: &mut self.last_decrypt_warn,
            };
            receiver.received_message(&mut ctx, now, payload, msg_num, -1);
        }

        self.connections.insert(from_key, sender);
        self.connections.insert(to_key, receiver);
    }

    /// Pull up to `max` received messages off a connection.
    pub fn receive_messages(&mut self, conn: u32, max: usize) -> Result<Vec<Message>, Error> {
        let key = self.resolve(conn)?;
        let queue = self.connections[&key].recv_queue;
        Ok(self.messages.remove_up_to(queue, max))
    }

    /// Pull up to `max` messages aggregated across a listen socket's
    /// children.
    pub fn receive_messages_on_listen_socket(
        &mut self,
        listen: u32,
        max: usize,
    ) -> Result<Vec<Message>, Error> {
        let queue = self
            .listen_sockets
            .get(&listen)
            .ok_or_else(|| Error::not_found("listen socket"))?
            .recv_queue;
        Ok(self.messages.remove_up_to(queue, max))
    }

    /// Encrypt one outgoing chunk; the host frames and transmits it.
    /// Returns the 16-bit wire sequence number and ciphertext.
    pub fn encrypt_data_chunk(
        &mut self,
        conn: u32,
        plaintext: &[u8],
        now: Micros,
    ) -> Result<(u16, Vec<u8>), Error> {
        self.with_conn(conn, now, |c, _ctx| c.encrypt_data_chunk(now, plaintext))?
    }

    /// Feed one received encrypted chunk through decrypt, sequencing and
    /// the reliability engine.  Returns whether the packet was processed
    /// (false = silently dropped).
    pub fn handle_data_chunk(
        &mut self,
        conn: u32,
        wire_seq: u16,
        chunk: &[u8],
        now: Micros,
    ) -> Result<bool, Error> {
        self.with_conn(conn, now, |c, ctx| -> Result<bool, Error> {
            if !c.crypt_keys_valid() {
                return Err(Error::invalid_state("crypto handshake incomplete"));
            }
            match c.state() {
                ConnectionState::Connecting
                | ConnectionState::FindingRoute
                | ConnectionState::Connected
                | ConnectionState::Linger => {}
                other => {
                    return Err(Error::invalid_state(format!(
                        "cannot receive data in {other:?}"
                    )))
                }
            }
            let Some((full_seq, plaintext)) = c.decrypt_data_chunk(ctx, now, wire_seq, chunk)
            else {
                return Ok(false);
            };
            // An authenticated packet is proof the route works; implicit
            // connect for sides still waiting on one.
            if matches!(
                c.state(),
                ConnectionState::Connecting | ConnectionState::FindingRoute
            ) {
                let _ = c.connection_state_connected(ctx, now);
            }
            Ok(c.process_plaintext_chunk(ctx, now, full_seq, &plaintext))
        })?
    }

    /// Drain messages the reliability engine queued for transmission.
    pub fn take_outbound_messages(&mut self, conn: u32) -> Result<Vec<(i64, Bytes)>, Error> {
        let key = self.resolve(conn)?;
        let c = self
            .connections
            .get_mut(&key)
            .ok_or_else(|| Error::not_found("connection"))?;
        Ok(c.reliability.take_outbound())
    }

    // ------------------------------------------------------------------
    // Introspection & small setters
    // ------------------------------------------------------------------

    /// API-visible state, or `None` if the handle no longer resolves.
    pub fn connection_state(&self, conn: u32) -> Option<ConnectionState> {
        let key = self.resolve(conn).ok()?;
        Some(self.connections[&key].api_state())
    }

    pub fn connection_info(&self, conn: u32) -> Option<ConnectionInfo> {
        let key = self.resolve(conn).ok()?;
        Some(self.connections[&key].populate_info())
    }

    pub fn connection_ping_ms(&self, conn: u32) -> Option<i32> {
        let key = self.resolve(conn).ok()?;
        Some(self.connections[&key].stats.ping.smoothed_ping_ms())
    }

    pub fn set_connection_user_data(&mut self, conn: u32, user_data: i64) -> Result<(), Error> {
        let key = self.resolve(conn)?;
        let c = self
            .connections
            .get_mut(&key)
            .ok_or_else(|| Error::not_found("connection"))?;
        c.user_data = user_data;
        // Messages already delivered but not yet picked up get the new
        // value, so the app never races its own installation of it.
        let queue = c.recv_queue;
        self.messages
            .for_each_mut(queue, |m| m.connection_user_data = user_data);
        Ok(())
    }

    pub fn connection_user_data(&self, conn: u32) -> Option<i64> {
        let key = self.resolve(conn).ok()?;
        Some(self.connections[&key].user_data)
    }

    pub fn set_connection_name(&mut self, conn: u32, name: &str) -> Result<(), Error> {
        let key = self.resolve(conn)?;
        if let Some(c) = self.connections.get_mut(&key) {
            c.set_app_name(name);
        }
        Ok(())
    }

    /// May we send a reply to a packet that could be spoofed garbage?
    /// Shared across the runtime and gated to one per interval.
    pub fn check_spam_reply_rate_limit(&mut self, now: Micros) -> bool {
        if self.last_spam_reply + SPAM_REPLY_INTERVAL > now {
            return false;
        }
        self.last_spam_reply = now;
        true
    }

    // ------------------------------------------------------------------
    // Interface certificate plumbing
    // ------------------------------------------------------------------

    /// Install the interface-level signed cert, waking any connections
    /// that were waiting on it.
    pub fn install_cert(
        &mut self,
        signed: SignedCertificate,
        private_key: SigningKeypair,
        cert_has_identity: bool,
        now: Micros,
    ) {
        self.local_cert = Some(LocalCertStore {
            signed,
            key: private_key,
            has_identity: cert_has_identity,
        });
        self.cert_request_outstanding = false;
        for id in self.connecting_connections() {
            let _ = self.with_conn(id, now, |c, ctx| c.interface_got_cert(ctx, now));
        }
    }

    /// The async cert request failed; connections fall back to
    /// self-signed certs where allowed and fail otherwise.
    pub fn cert_request_failed(&mut self, reason: i32, msg: &str, now: Micros) {
        self.cert_request_outstanding = false;
        for id in self.connecting_connections() {
            let _ = self.with_conn(id, now, |c, ctx| c.cert_request_failed(ctx, now, reason, msg));
        }
    }

    fn connecting_connections(&self) -> Vec<u32> {
        self.connections
            .values()
            .filter(|c| c.id_local != 0 && c.state() == ConnectionState::Connecting)
            .map(|c| c.id_local)
            .collect()
    }

    // ------------------------------------------------------------------
    // Think loop
    // ------------------------------------------------------------------

    /// Run every connection whose scheduled think time has arrived, and
    /// sweep connections that queued themselves for deletion.
    pub fn think(&mut self, now: Micros) {
        // Sweep first: anything Dead queued itself on a previous pass.
        let dead: Vec<u16> = self
            .connections
            .iter()
            .filter(|(_, c)| c.state() == ConnectionState::Dead)
            .map(|(k, _)| *k)
            .collect();
        for key in dead {
            self.connections.remove(&key);
        }

        let due: Vec<u32> = self
            .connections
            .values()
            .filter(|c| c.id_local != 0 && c.next_think_min() <= now)
            .map(|c| c.id_local)
            .collect();
        for id in due {
            let _ = self.with_conn(id, now, |c, ctx| c.think(ctx, now));
        }
    }

    /// Earliest scheduled wakeup across all connections.
    pub fn next_wake_time(&self) -> Option<Micros> {
        self.connections
            .values()
            .map(|c| c.next_think_min())
            .filter(|&t| t != Micros::MAX)
            .min()
    }

    /// One connection's scheduled wake window `[min, max]`.  Waking before
    /// `min` just re-sleeps; waking after `max` risks late timeouts.
    pub fn connection_think_window(&self, conn: u32) -> Option<(Micros, Micros)> {
        let key = self.resolve(conn).ok()?;
        Some(self.connections[&key].next_think_window())
    }
}
