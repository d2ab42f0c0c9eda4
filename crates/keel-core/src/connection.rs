//! The per-connection state machine and handshake driver.
//!
//! A connection walks a fixed set of states; every transition has entry
//! effects (timestamps, key wiping, status events) and the cooperative
//! think loop schedules timeouts, retries and keepalives per state.  All
//! the cryptographic handshake steps live here too: local cert readiness,
//! session crypt-info signing, peer handshake verification and session key
//! derivation.
//!
//! Connections are owned by the [`crate::Runtime`]; methods that need
//! runtime resources (message arena, event queue) receive a [`ConnCtx`].
//! Work that must touch *another* connection (a loopback partner) is pushed
//! onto the deferred-op list and applied by the runtime afterwards.

use std::collections::VecDeque;

use bytes::Bytes;
use keel_common::Error;
use keel_crypto::{
    cert::{self, CertVerifyError, CertVerifyOptions, TrustedCaKey},
    derive_session_keys, keys, KeyExchangeKeypair, PacketCipher, SessionKdfInput,
    SigningKeypair, UnsignedCertPolicy,
};
use keel_proto::{
    decode_msg, encode_msg, end_reason, CryptKeyType, Certificate, Identity, SessionCryptInfo,
    SignedCertificate, SignedSessionCryptInfo, MAX_PACKET_NUMBER_GAP, PROTOCOL_VERSION_CURRENT,
    PROTOCOL_VERSION_MIN,
};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::config::ConnectionConfig;
use crate::events::{ConnectionInfo, ConnectionStatusChanged, Event};
use crate::message::{MessageArena, QueueId};
use crate::reliability::Reliability;
use crate::stats::EndToEndStats;
use crate::{
    Micros, AGGRESSIVE_PING_INTERVAL, CONNECT_RETRY_INTERVAL, CRYPTO_READY_POLL_INTERVAL,
    FIN_WAIT_TIMEOUT, KEEP_ALIVE_INTERVAL, MAX_REPLY_TIMEOUTS, MILLION, SPAM_REPLY_INTERVAL,
};

/// Longest end-debug string we keep.
const MAX_END_DEBUG_LEN: usize = 128;

/// Connection lifecycle states.
///
/// `Linger`, `FinWait` and `Dead` are internal: the application sees them
/// collapsed through [`ConnectionState::collapse_to_api`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never initialized, or fully torn down.
    None,
    /// Initiator or acceptor, route not yet confirmed.
    Connecting,
    /// Route/NAT negotiation in progress.
    FindingRoute,
    /// Keys exchanged; data may flow.
    Connected,
    /// The peer signaled close.
    ClosedByPeer,
    /// We detected a fatal error.
    ProblemDetectedLocally,
    /// Locally closed, draining unacked reliable data.
    Linger,
    /// Waiting out the grace period before reclaim.
    FinWait,
    /// Queued for deletion on the next think.
    Dead,
}

impl ConnectionState {
    /// Replace internal states with what the application is shown.
    pub fn collapse_to_api(self) -> ConnectionState {
        match self {
            // A lingering connection still looks connected: data is
            // draining on its behalf.
            ConnectionState::Linger => ConnectionState::Connected,
            ConnectionState::FinWait | ConnectionState::Dead => ConnectionState::None,
            other => other,
        }
    }
}

/// How bytes physically move for this connection.
pub(crate) enum Transport {
    /// Driven by the host: it pulls encrypted chunks and feeds received
    /// datagrams back in.
    External,
    /// Loopback pipe; `partner` is the other half's handle.
    Pipe { partner: Option<u32> },
}

impl Transport {
    fn describe(&self) -> &'static str {
        match self {
            Transport::External => "conn",
            Transport::Pipe { .. } => "pipe",
        }
    }
}

/// Cross-connection work queued during a connection method and applied by
/// the runtime once the borrow is released.
pub(crate) enum DeferredOp {
    /// Tell a loopback partner the other half closed.
    PartnerClosedByPeer {
        partner: u32,
        reason: i32,
        debug: String,
        now: Micros,
    },
    /// Fake a keepalive round trip across a loopback pair.
    PipeStatsRoundTrip {
        local: u32,
        partner: u32,
        now: Micros,
    },
}

/// The interface-level signed cert, shared by every connection that needs
/// a CA-signed identity.
pub(crate) struct LocalCertStore {
    pub signed: SignedCertificate,
    pub key: SigningKeypair,
    pub has_identity: bool,
}

/// Runtime resources a connection method may touch.
pub(crate) struct ConnCtx<'a> {
    pub messages: &'a mut MessageArena,
    pub events: &'a mut VecDeque<Event>,
    pub deferred: &'a mut Vec<DeferredOp>,
    pub local_cert: Option<&'a LocalCertStore>,
    pub app_id: u32,
    pub trusted: &'a [TrustedCaKey],
    /// Wall-clock seconds, for cert expiry.
    pub now_unix: u32,
    pub cert_request_outstanding: &'a mut bool,
    /// Gate for rate-limited decrypt warnings.
    pub last_decrypt_warn: &'a mut Micros,
}

/// Candidate think window; the final values land on the connection.
struct ThinkWindow {
    min: Micros,
    max: Micros,
}

impl ThinkWindow {
    fn new(now: Micros) -> Self {
        // Default: check in about a second regardless.
        let min = now + MILLION;
        Self {
            min,
            max: min + 100 * 1000,
        }
    }

    fn update(&mut self, when: Micros, tolerance_ms: i64) {
        if when < self.min {
            self.min = when;
        }
        let end = when + tolerance_ms * 1000;
        if end < self.max {
            self.max = end;
        }
    }
}

pub(crate) struct Connection {
    pub(crate) id_local: u32,
    pub(crate) id_remote: u32,
    pub(crate) identity_local: Identity,
    pub(crate) identity_remote: Identity,

    state: ConnectionState,
    pub(crate) entered_state_at: Micros,
    sent_connect_request_at: Micros,
    pub(crate) end_reason: i32,
    pub(crate) end_debug: String,
    description: String,
    app_name: String,
    pub(crate) user_data: i64,

    pub(crate) config: ConnectionConfig,
    pub(crate) transport: Transport,
    pub(crate) parent_listen_socket: Option<u32>,
    pub(crate) parent_listen_queue: Option<QueueId>,
    pub(crate) recv_queue: QueueId,

    pub(crate) stats: EndToEndStats,
    pub(crate) reliability: Box<dyn Reliability>,

    // Handshake state.
    signed_cert_local: Option<SignedCertificate>,
    cert_has_identity: bool,
    crypt_local: Option<SessionCryptInfo>,
    signed_crypt_local: Option<SignedSessionCryptInfo>,
    key_exchange_private: Option<KeyExchangeKeypair>,
    cert_remote: Option<Certificate>,
    crypt_remote: Option<SessionCryptInfo>,
    /// Raw peer handshake bytes, kept to detect rekey attempts.
    peer_handshake_bytes: Option<(Vec<u8>, Vec<u8>)>,
    cipher: Option<PacketCipher>,
    crypt_keys_valid: bool,

    /// Server side: the application accepted this connection.
    pub(crate) accepted: bool,
    /// Message numbering for transports that bypass the reliability layer.
    pub(crate) last_sent_msg_num: i64,

    // Think scheduling.
    next_think_min: Micros,
    next_think_max: Micros,
    /// Set when the connection wants the runtime to reclaim it.
    pub(crate) pending_destroy: bool,
}

impl Connection {
    pub(crate) fn new(
        identity_local: Identity,
        config: ConnectionConfig,
        transport: Transport,
        reliability: Box<dyn Reliability>,
        recv_queue: QueueId,
    ) -> Self {
        Self {
            id_local: 0,
            id_remote: 0,
            identity_local,
            identity_remote: Identity::Invalid,
            state: ConnectionState::None,
            entered_state_at: 0,
            sent_connect_request_at: 0,
            end_reason: end_reason::INVALID,
            end_debug: String::new(),
            description: String::new(),
            app_name: String::new(),
            user_data: -1,
            config,
            transport,
            parent_listen_socket: None,
            parent_listen_queue: None,
            recv_queue,
            stats: EndToEndStats::new(true),
            reliability,
            signed_cert_local: None,
            cert_has_identity: false,
            crypt_local: None,
            signed_crypt_local: None,
            key_exchange_private: None,
            cert_remote: None,
            crypt_remote: None,
            peer_handshake_bytes: None,
            cipher: None,
            crypt_keys_valid: false,
            accepted: false,
            last_sent_msg_num: 0,
            next_think_min: Micros::MAX,
            next_think_max: Micros::MAX,
            pending_destroy: false,
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn api_state(&self) -> ConnectionState {
        self.state.collapse_to_api()
    }

    pub(crate) fn crypt_keys_valid(&self) -> bool {
        self.crypt_keys_valid
    }

    pub(crate) fn description(&self) -> &str {
        &self.description
    }

    pub(crate) fn next_think_min(&self) -> Micros {
        self.next_think_min
    }

    pub(crate) fn next_think_window(&self) -> (Micros, Micros) {
        (self.next_think_min, self.next_think_max)
    }

    /// Move the scheduled wakeup earlier; never later.
    pub(crate) fn set_next_think_time(&mut self, when: Micros) {
        if when < self.next_think_min {
            self.next_think_min = when;
        }
        if self.next_think_max < self.next_think_min {
            self.next_think_max = self.next_think_min;
        }
    }

    pub(crate) fn set_app_name(&mut self, name: &str) {
        self.app_name = name.to_string();
        self.set_description();
    }

    pub(crate) fn set_description(&mut self) {
        let kind = self.transport.describe();
        self.description = if self.app_name.is_empty() {
            format!("#{} {}", self.id_local, kind)
        } else {
            format!("#{} {} '{}'", self.id_local, kind, self.app_name)
        };
    }

    pub(crate) fn populate_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            state: self.api_state(),
            listen_socket: self.parent_listen_socket,
            identity_remote: self.identity_remote.clone(),
            address_remote: match &self.identity_remote {
                Identity::Ip(addr) => Some(*addr),
                _ => None,
            },
            user_data: self.user_data,
            end_reason: self.end_reason,
            end_debug: self.end_debug.clone(),
            description: self.description.clone(),
        }
    }

    /// Wipe everything key-shaped.  Idempotent; the local signed cert is
    /// kept so a reconnect can reuse it.
    pub(crate) fn clear_crypto(&mut self) {
        self.cert_remote = None;
        self.crypt_remote = None;
        self.key_exchange_private = None;
        self.crypt_local = None;
        self.signed_crypt_local = None;
        self.peer_handshake_bytes = None;
        self.cert_has_identity = false;
        self.crypt_keys_valid = false;
        self.cipher = None;
    }

    // ------------------------------------------------------------------
    // State transitions
    // ------------------------------------------------------------------

    pub(crate) fn set_state(&mut self, ctx: &mut ConnCtx<'_>, now: Micros, new_state: ConnectionState) {
        if new_state == self.state {
            return;
        }
        let old_state = self.state;
        self.state = new_state;
        self.entered_state_at = now;

        let old_api = old_state.collapse_to_api();
        let new_api = new_state.collapse_to_api();

        // Entry effects first: key material must be gone before the status
        // event is even queued.
        match new_state {
            ConnectionState::Dead
            | ConnectionState::None
            | ConnectionState::ProblemDetectedLocally
            | ConnectionState::FinWait
            | ConnectionState::ClosedByPeer => {
                self.clear_crypto();
                self.stats.set_disconnected(true);
            }
            ConnectionState::Linger => {
                // No point trading stats with the peer anymore; the only
                // thing left to tell them is that we closed.
                self.stats.set_disconnected(true);
            }
            ConnectionState::Connected | ConnectionState::FindingRoute => {
                debug_assert!(self.crypt_keys_valid);
                self.stats.set_disconnected(false);
            }
            ConnectionState::Connecting => {
                debug_assert!(!self.crypt_keys_valid);
            }
        }

        // Once closed from the API's point of view, unread messages are
        // never going to be read.
        if new_api == ConnectionState::None {
            ctx.messages.purge(self.recv_queue);
        }

        if old_api != new_api && !self.suppress_status_event(new_api) {
            ctx.events.push_back(Event::StatusChanged(ConnectionStatusChanged {
                info: self.populate_info(),
                old_state: old_api,
                connection: self.id_local,
            }));
        }

        // Loopback partner bookkeeping.
        if let Transport::Pipe { partner } = &mut self.transport {
            match new_state {
                ConnectionState::None
                | ConnectionState::Dead
                | ConnectionState::FinWait
                | ConnectionState::Linger => {
                    // Clear the back-reference first to stop recursion,
                    // then tell the partner we're gone.
                    if let Some(p) = partner.take() {
                        ctx.deferred.push(DeferredOp::PartnerClosedByPeer {
                            partner: p,
                            reason: self.end_reason,
                            debug: self.end_debug.clone(),
                            now,
                        });
                    }
                }
                ConnectionState::ClosedByPeer => {
                    // The partner initiated this and already dropped its
                    // reference to us.
                    *partner = None;
                }
                _ => {}
            }
        }
    }

    /// Loopback pairs are born connected; don't spam the app with the
    /// transitions every pair goes through.
    fn suppress_status_event(&self, new_api: ConnectionState) -> bool {
        matches!(self.transport, Transport::Pipe { .. })
            && matches!(
                new_api,
                ConnectionState::Connecting | ConnectionState::Connected
            )
    }

    pub(crate) fn problem_detected_locally(
        &mut self,
        ctx: &mut ConnCtx<'_>,
        now: Micros,
        reason: i32,
        msg: &str,
    ) {
        debug_assert!(reason > end_reason::APP_EXCEPTION_MAX);
        // First reason wins, except a problem discovered while lingering
        // replaces the app's close reason.
        if self.end_reason == end_reason::INVALID || self.state == ConnectionState::Linger {
            self.end_reason = reason;
            self.end_debug = truncate_debug(msg);
        }

        match self.state {
            ConnectionState::Dead | ConnectionState::None => {
                debug_assert!(false, "problem reported on a dead connection");
                return;
            }
            ConnectionState::ProblemDetectedLocally
            | ConnectionState::FinWait
            | ConnectionState::ClosedByPeer => {}
            ConnectionState::Linger => {
                self.connection_state_fin_wait(ctx, now);
                return;
            }
            ConnectionState::Connecting
            | ConnectionState::FindingRoute
            | ConnectionState::Connected => {
                self.set_state(ctx, now, ConnectionState::ProblemDetectedLocally);
            }
        }
        self.check_state_and_set_next_think(ctx, now);
    }

    pub(crate) fn connection_state_fin_wait(&mut self, ctx: &mut ConnCtx<'_>, now: Micros) {
        match self.state {
            ConnectionState::Dead | ConnectionState::None => {
                debug_assert!(false);
            }
            ConnectionState::FinWait => {}
            _ => {
                self.set_state(ctx, now, ConnectionState::FinWait);
                self.check_state_and_set_next_think(ctx, now);
            }
        }
    }

    pub(crate) fn connection_state_closed_by_peer(
        &mut self,
        ctx: &mut ConnCtx<'_>,
        now: Micros,
        reason: i32,
        debug: &str,
    ) {
        match self.state {
            ConnectionState::Dead | ConnectionState::None => {
                debug_assert!(false);
            }
            ConnectionState::FinWait => {
                // Keep hanging out until the grace period is up.
            }
            ConnectionState::Linger => {
                // Mutual close; finish gracefully.
                self.connection_state_fin_wait(ctx, now);
            }
            ConnectionState::ProblemDetectedLocally | ConnectionState::ClosedByPeer => {
                // We already have a verdict; wait for the app to close us.
            }
            ConnectionState::Connecting
            | ConnectionState::FindingRoute
            | ConnectionState::Connected => {
                if !debug.is_empty() {
                    self.end_debug = truncate_debug(debug);
                } else if self.end_debug.is_empty() {
                    self.end_debug = "The remote host closed the connection.".to_string();
                }
                self.end_reason = reason;
                self.set_state(ctx, now, ConnectionState::ClosedByPeer);
            }
        }
    }

    pub(crate) fn connection_state_connected(
        &mut self,
        ctx: &mut ConnCtx<'_>,
        now: Micros,
    ) -> Result<(), Error> {
        match self.state {
            ConnectionState::Connecting | ConnectionState::FindingRoute => {
                // We must have received something to get here.
                debug_assert!(self.stats.time_last_recv > 0);
                self.set_state(ctx, now, ConnectionState::Connected);
                self.reliability.on_connected(now);
            }
            ConnectionState::Connected => {}
            _ => {
                return Err(Error::invalid_state(format!(
                    "cannot mark connection connected from {:?}",
                    self.state
                )))
            }
        }
        self.check_state_and_set_next_think(ctx, now);
        Ok(())
    }

    pub(crate) fn connection_state_finding_route(
        &mut self,
        ctx: &mut ConnCtx<'_>,
        now: Micros,
    ) -> Result<(), Error> {
        match self.state {
            ConnectionState::Connecting => {
                self.set_state(ctx, now, ConnectionState::FindingRoute);
            }
            ConnectionState::FindingRoute => {}
            _ => {
                return Err(Error::invalid_state(format!(
                    "cannot start route negotiation from {:?}",
                    self.state
                )))
            }
        }
        self.check_state_and_set_next_think(ctx, now);
        Ok(())
    }

    pub(crate) fn api_close(
        &mut self,
        ctx: &mut ConnCtx<'_>,
        now: Micros,
        reason: i32,
        debug: Option<&str>,
        linger: bool,
    ) -> Result<(), Error> {
        // If we already know why this connection is over, ignore theirs.
        if self.end_reason == end_reason::INVALID
            || matches!(
                self.state,
                ConnectionState::Connecting
                    | ConnectionState::FindingRoute
                    | ConnectionState::Connected
            )
        {
            let (code, override_debug) = end_reason::validate_app_reason(reason);
            self.end_reason = code;
            if self.end_debug.is_empty() {
                let text = match override_debug.or(debug) {
                    Some(d) if !d.is_empty() => d,
                    _ => {
                        if code >= end_reason::APP_EXCEPTION_MIN {
                            "Application closed connection in an unusual way"
                        } else {
                            "Application closed connection"
                        }
                    }
                };
                self.end_debug = truncate_debug(text);
            }
        }

        match self.state {
            ConnectionState::Dead
            | ConnectionState::None
            | ConnectionState::FinWait
            | ConnectionState::Linger => Err(Error::invalid_state(format!(
                "close is not valid in {:?}",
                self.state
            ))),
            ConnectionState::ClosedByPeer
            | ConnectionState::ProblemDetectedLocally
            | ConnectionState::Connecting
            | ConnectionState::FindingRoute => {
                self.connection_state_fin_wait(ctx, now);
                Ok(())
            }
            ConnectionState::Connected => {
                if linger {
                    self.set_state(ctx, now, ConnectionState::Linger);
                    self.check_state_and_set_next_think(ctx, now);
                } else {
                    self.connection_state_fin_wait(ctx, now);
                }
                Ok(())
            }
        }
    }

    fn connection_timed_out(&mut self, ctx: &mut ConnCtx<'_>, now: Micros) {
        let msg = match self.state {
            ConnectionState::Connecting => "Timed out attempting to connect",
            ConnectionState::FindingRoute => "Timed out attempting to negotiate rendezvous",
            _ => "Connection dropped",
        };
        self.problem_detected_locally(ctx, now, end_reason::MISC_TIMEOUT, msg);
    }

    // ------------------------------------------------------------------
    // Crypto handshake
    // ------------------------------------------------------------------

    fn allow_local_unsigned(&self) -> bool {
        match self.transport {
            // It's definitely us, and we trust ourselves.
            Transport::Pipe { .. } => true,
            Transport::External => self.config.allow_unsigned_local(),
        }
    }

    fn unsigned_remote_policy(&self) -> UnsignedCertPolicy {
        match self.transport {
            Transport::Pipe { .. } => UnsignedCertPolicy::Allow,
            Transport::External => self.config.unsigned_remote_policy(),
        }
    }

    pub(crate) fn init_connection_crypto(&mut self, ctx: &mut ConnCtx<'_>, now: Micros) {
        match self.transport {
            Transport::Pipe { .. } => self.init_local_crypto_unsigned(ctx.app_id),
            Transport::External => {
                let _ = self.think_crypto_ready(ctx, now);
            }
        }
    }

    /// Make sure we have a local cert and session crypt material, kicking
    /// off an async cert request if the host must supply one.  Returns true
    /// once the local side of the handshake is ready.
    pub(crate) fn think_crypto_ready(&mut self, ctx: &mut ConnCtx<'_>, _now: Micros) -> bool {
        debug_assert_eq!(self.state, ConnectionState::Connecting);

        if self.signed_cert_local.is_some() {
            return true;
        }

        // Anonymous identities always use self-signed; no CA should ever
        // issue a cert for them.
        if self.identity_local.is_localhost() {
            self.init_local_crypto_unsigned(ctx.app_id);
            return true;
        }

        if let Some(store) = ctx.local_cert {
            if store.signed.has_ca_signature() {
                let signed = store.signed.clone();
                let has_identity = store.has_identity;
                self.init_local_crypto(ctx, signed, has_identity);
                return true;
            }
        }

        if self.allow_local_unsigned() {
            self.init_local_crypto_unsigned(ctx.app_id);
            return true;
        }

        // We need a CA-signed cert and don't have one (yet?).  Ask the
        // host; it answers through install_cert / cert_request_failed.
        if !*ctx.cert_request_outstanding {
            *ctx.cert_request_outstanding = true;
            ctx.events.push_back(Event::CertRequested);
        }
        false
    }

    /// The host delivered an interface-level cert.
    pub(crate) fn interface_got_cert(&mut self, ctx: &mut ConnCtx<'_>, now: Micros) {
        if self.state != ConnectionState::Connecting || self.signed_cert_local.is_some() {
            return;
        }
        let Some(store) = ctx.local_cert else { return };
        let signed = store.signed.clone();
        let has_identity = store.has_identity;
        self.init_local_crypto(ctx, signed, has_identity);
        // Don't run the state machine from here; just wake up soon.
        self.set_next_think_time(now);
    }

    /// The host could not obtain a cert.
    pub(crate) fn cert_request_failed(
        &mut self,
        ctx: &mut ConnCtx<'_>,
        now: Micros,
        reason: i32,
        msg: &str,
    ) {
        if self.state != ConnectionState::Connecting || self.signed_cert_local.is_some() {
            return;
        }
        if !self.allow_local_unsigned() {
            warn!(conn = %self.description, "cannot use self-signed cert; failing connection");
            self.problem_detected_locally(ctx, now, reason, &format!("Cert failure: {msg}"));
            return;
        }
        warn!(conn = %self.description, "continuing with self-signed cert");
        self.init_local_crypto_unsigned(ctx.app_id);
        self.set_next_think_time(now);
    }

    fn init_local_crypto(
        &mut self,
        ctx: &mut ConnCtx<'_>,
        signed_cert: SignedCertificate,
        cert_has_identity: bool,
    ) {
        let Some(store) = ctx.local_cert else {
            debug_assert!(false, "interface cert disappeared");
            return;
        };
        self.install_local_crypto(signed_cert, &store.key, cert_has_identity);
    }

    fn init_local_crypto_unsigned(&mut self, app_id: u32) {
        let key = SigningKeypair::generate();
        let signed = cert::self_signed_cert(&key.public_key_bytes(), &self.identity_local, app_id);
        self.install_local_crypto(signed, &key, true);
    }

    fn install_local_crypto(
        &mut self,
        signed_cert: SignedCertificate,
        private_key: &SigningKeypair,
        cert_has_identity: bool,
    ) {
        debug_assert!(!signed_cert.cert.is_empty());
        self.signed_cert_local = Some(signed_cert);
        self.cert_has_identity = cert_has_identity;

        // Fresh key-exchange keypair and nonce for this session.
        let kx = KeyExchangeKeypair::generate();
        let crypt = SessionCryptInfo {
            key_type: CryptKeyType::Curve25519 as i32,
            key_data: kx.public_key_bytes().to_vec(),
            nonce: rand::random::<u64>(),
            protocol_version: PROTOCOL_VERSION_CURRENT,
        };
        self.key_exchange_private = Some(kx);

        // Sign the serialized crypt info with the cert's private key.
        let info = encode_msg(&crypt);
        let signature = private_key.sign(&info);
        self.signed_crypt_local = Some(SignedSessionCryptInfo {
            info,
            signature: signature.to_vec(),
        });
        self.crypt_local = Some(crypt);
    }

    pub(crate) fn handshake_material(
        &self,
    ) -> Option<(SignedCertificate, SignedSessionCryptInfo)> {
        Some((
            self.signed_cert_local.clone()?,
            self.signed_crypt_local.clone()?,
        ))
    }

    /// Does our local cert name an identity (as opposed to an anonymous
    /// key-only cert)?  Transports that advertise identity out of band
    /// need to know.
    pub(crate) fn local_cert_binds_identity(&self) -> bool {
        self.cert_has_identity
    }

    pub(crate) fn peer_certificate(&self) -> Option<&Certificate> {
        self.cert_remote.as_ref()
    }

    pub(crate) fn peer_session_info(&self) -> Option<&SessionCryptInfo> {
        self.crypt_remote.as_ref()
    }

    /// Process the peer's half of the crypto handshake.
    ///
    /// On success the session keys are derived and the connection can
    /// encrypt and decrypt.  On failure the connection has already
    /// transitioned to `ProblemDetectedLocally` with the matching reason.
    /// A repeat call with byte-identical inputs is a no-op; a repeat with
    /// different bytes is rejected (rekeying is not supported).
    pub(crate) fn recv_crypto_handshake(
        &mut self,
        ctx: &mut ConnCtx<'_>,
        now: Micros,
        peer_cert: &SignedCertificate,
        peer_crypt: &SignedSessionCryptInfo,
        is_server: bool,
    ) -> bool {
        if self.crypt_keys_valid {
            if let Some((cert_bytes, info_bytes)) = &self.peer_handshake_bytes {
                if *cert_bytes == peer_cert.cert && *info_bytes == peer_crypt.info {
                    return true;
                }
            }
            self.problem_detected_locally(
                ctx,
                now,
                end_reason::REMOTE_BAD_CRYPT,
                "Rekeying is not supported",
            );
            return false;
        }

        if peer_cert.cert.is_empty() || peer_crypt.info.is_empty() {
            self.problem_detected_locally(
                ctx,
                now,
                end_reason::REMOTE_BAD_CRYPT,
                "Crypto handshake missing cert or session data",
            );
            return false;
        }

        let opts = CertVerifyOptions {
            expected_identity: &self.identity_remote,
            local_app_id: ctx.app_id,
            unsigned_policy: self.unsigned_remote_policy(),
            enforce_expiry: self.config.enforce_cert_expiry(),
            now_unix: ctx.now_unix,
        };
        let verified = match cert::verify_signed_cert(peer_cert, ctx.trusted, &opts) {
            Ok(v) => v,
            Err(CertVerifyError::BadCert(msg)) => {
                self.problem_detected_locally(ctx, now, end_reason::REMOTE_BAD_CERT, &msg);
                return false;
            }
            Err(CertVerifyError::BadCrypt(msg)) => {
                self.problem_detected_locally(ctx, now, end_reason::REMOTE_BAD_CRYPT, &msg);
                return false;
            }
        };

        // We need our own cert by now; generate a self-signed one if the
        // host never supplied anything.
        if self.signed_cert_local.is_none() {
            if !self.allow_local_unsigned() {
                warn!(
                    conn = %self.description,
                    "no cert where unsigned certs are not supposed to be allowed; continuing anyway"
                );
            }
            self.init_local_crypto_unsigned(ctx.app_id);
        }

        // The session info must be signed by the cert's key, or anyone
        // could splice their own key exchange under a stolen cert.
        if !keys::verify_signature(&verified.public_key, &peer_crypt.info, &peer_crypt.signature)
        {
            self.problem_detected_locally(
                ctx,
                now,
                end_reason::REMOTE_BAD_CRYPT,
                "Crypt info signature is invalid",
            );
            return false;
        }

        let crypt_remote: SessionCryptInfo = match decode_msg(&peer_crypt.info) {
            Ok(m) => m,
            Err(_) => {
                self.problem_detected_locally(
                    ctx,
                    now,
                    end_reason::REMOTE_BAD_CRYPT,
                    "Crypt info failed protobuf decode",
                );
                return false;
            }
        };

        if crypt_remote.protocol_version < PROTOCOL_VERSION_MIN {
            let msg = format!(
                "Peer is running old software and needs to be updated.  (V{}, >=V{} is required)",
                crypt_remote.protocol_version, PROTOCOL_VERSION_MIN
            );
            self.problem_detected_locally(
                ctx,
                now,
                end_reason::REMOTE_BAD_PROTOCOL_VERSION,
                &msg,
            );
            return false;
        }
        // A peer that already told us its version must not change it.
        if self.stats.peer_protocol_version != 0
            && self.stats.peer_protocol_version != crypt_remote.protocol_version
        {
            let msg = format!(
                "Claiming protocol V{} now, but earlier was using V{}",
                crypt_remote.protocol_version, self.stats.peer_protocol_version
            );
            self.problem_detected_locally(
                ctx,
                now,
                end_reason::REMOTE_BAD_PROTOCOL_VERSION,
                &msg,
            );
            return false;
        }
        self.stats.peer_protocol_version = crypt_remote.protocol_version;

        if crypt_remote.key_type != CryptKeyType::Curve25519 as i32 {
            self.problem_detected_locally(
                ctx,
                now,
                end_reason::REMOTE_BAD_CRYPT,
                "Unsupported DH key type",
            );
            return false;
        }

        let Some(kx) = self.key_exchange_private.take() else {
            self.problem_detected_locally(
                ctx,
                now,
                end_reason::MISC_INTERNAL_ERROR,
                "Local key exchange state missing",
            );
            return false;
        };
        let premaster = match kx.key_exchange(&crypt_remote.key_data) {
            Ok(secret) => Zeroizing::new(secret),
            Err(keel_crypto::keys::KeyError::InvalidLength { .. }) => {
                self.problem_detected_locally(
                    ctx,
                    now,
                    end_reason::REMOTE_BAD_CRYPT,
                    "Invalid DH key",
                );
                return false;
            }
            Err(_) => {
                self.problem_detected_locally(
                    ctx,
                    now,
                    end_reason::REMOTE_BAD_CRYPT,
                    "Key exchange failed",
                );
                return false;
            }
        };
        // kx (and the private scalar) is gone as of here.

        let (Some(nonce_local), Some(cert_local), Some(info_local)) = (
            self.crypt_local.as_ref().map(|c| c.nonce),
            self.signed_cert_local.as_ref().map(|c| c.cert.clone()),
            self.signed_crypt_local.as_ref().map(|s| s.info.clone()),
        ) else {
            self.problem_detected_locally(
                ctx,
                now,
                end_reason::MISC_INTERNAL_ERROR,
                "Local crypto state missing",
            );
            return false;
        };

        let keys = derive_session_keys(
            &premaster,
            &SessionKdfInput {
                nonce_local,
                nonce_remote: crypt_remote.nonce,
                conn_id_local: self.id_local,
                conn_id_remote: self.id_remote,
                cert_local: &cert_local,
                cert_remote: &peer_cert.cert,
                info_local: &info_local,
                info_remote: &peer_crypt.info,
                is_server,
            },
        );
        self.cipher = Some(PacketCipher::new(&keys));

        self.cert_remote = Some(verified.cert);
        self.crypt_remote = Some(crypt_remote);
        self.peer_handshake_bytes = Some((peer_cert.cert.clone(), peer_crypt.info.clone()));

        // Often we only learn who the peer really is during the handshake.
        self.set_description();

        self.crypt_keys_valid = true;
        true
    }

    // ------------------------------------------------------------------
    // Packet crypto
    // ------------------------------------------------------------------

    /// Encrypt a chunk for the wire.  Returns the 16-bit wire sequence
    /// number and the ciphertext (tag appended).
    pub(crate) fn encrypt_data_chunk(
        &mut self,
        now: Micros,
        plaintext: &[u8],
    ) -> Result<(u16, Vec<u8>), Error> {
        if !self.crypt_keys_valid {
            return Err(Error::invalid_state("crypto handshake incomplete"));
        }
        let full_seq = self.stats.consume_send_packet_number(now);
        let cipher = self
            .cipher
            .as_ref()
            .ok_or_else(|| Error::internal("cipher missing with valid keys"))?;
        let ciphertext = cipher
            .encrypt(full_seq, plaintext)
            .map_err(|e| Error::crypto(e))?;
        self.stats.track_sent_packet(ciphertext.len());
        Ok((full_seq as u16, ciphertext))
    }

    /// Decrypt an arriving chunk.  Returns the full sequence number and
    /// plaintext, or `None` when the packet must be dropped (in which case
    /// a sequence lurch may have already killed the connection).
    pub(crate) fn decrypt_data_chunk(
        &mut self,
        ctx: &mut ConnCtx<'_>,
        now: Micros,
        wire_seq: u16,
        chunk: &[u8],
    ) -> Option<(i64, Vec<u8>)> {
        debug_assert!(self.crypt_keys_valid);

        // Track flow even if we end up discarding this.
        self.stats.track_recv_packet(chunk.len(), now);

        let full_seq = self.stats.seq.expand_and_check(wire_seq);
        if full_seq <= 0 {
            return None;
        }

        let plaintext = match self.cipher.as_ref() {
            Some(cipher) => match cipher.decrypt(full_seq, chunk) {
                Ok(p) => p,
                Err(_) => {
                    // Just drop it.  Either we have a bug, or somebody is
                    // spoofing/tampering; don't magnify their effort.
                    if now >= *ctx.last_decrypt_warn + SPAM_REPLY_INTERVAL {
                        *ctx.last_decrypt_warn = now;
                        warn!(
                            conn = %self.description,
                            "packet data chunk failed to decrypt; could be tampering/spoofing or a bug"
                        );
                    }
                    return None;
                }
            },
            None => return None,
        };

        // The packet authenticated, so it really is from our peer.  A huge
        // forward gap still means we are about to lose sequence-number
        // sync, and that is unrecoverable.
        let gap = full_seq - self.stats.seq.max_recv();
        if gap > MAX_PACKET_NUMBER_GAP {
            let msg = format!(
                "Pkt number lurch by {gap}; {:04x}->{:04x}",
                self.stats.seq.max_recv() as u16,
                wire_seq
            );
            self.problem_detected_locally(ctx, now, end_reason::MISC_GENERIC, &msg);
            return None;
        }

        Some((full_seq, plaintext))
    }

    /// Feed a decrypted chunk through the reliability engine and deliver
    /// any completed messages.
    pub(crate) fn process_plaintext_chunk(
        &mut self,
        ctx: &mut ConnCtx<'_>,
        now: Micros,
        full_seq: i64,
        chunk: &[u8],
    ) -> bool {
        let mut completed = Vec::new();
        if !self
            .reliability
            .recv_data_chunk(full_seq, chunk, now, &mut completed)
        {
            debug!(conn = %self.description, pkt = full_seq, "discarding packet");
            return false;
        }
        for msg in completed {
            self.received_message(ctx, now, msg.payload, msg.message_number, msg.channel);
        }
        self.stats.track_process_sequenced_packet(full_seq, now);
        true
    }

    /// Deliver one completed message into the receive queue(s).
    pub(crate) fn received_message(
        &mut self,
        ctx: &mut ConnCtx<'_>,
        now: Micros,
        payload: Bytes,
        message_number: i64,
        channel: i32,
    ) {
        debug!(
            conn = %self.description,
            msg_num = message_number,
            size = payload.len(),
            "received message"
        );
        let msg = crate::Message {
            sender: self.identity_remote.clone(),
            connection: self.id_local,
            connection_user_data: self.user_data,
            payload,
            channel,
            received_at: now,
            message_number,
        };
        ctx.messages
            .push_message(msg, self.recv_queue, self.parent_listen_queue);
    }

    // ------------------------------------------------------------------
    // Think loop
    // ------------------------------------------------------------------

    pub(crate) fn can_send_end_to_end_data(&self) -> bool {
        match &self.transport {
            Transport::Pipe { partner } => partner.is_some(),
            Transport::External => false,
        }
    }

    fn can_send_connect_request(&self) -> bool {
        // No in-core transport drives its own connect packets; the host
        // does.  The retry scheduling stays here so a transport that can
        // send gets the standard cadence.
        false
    }

    fn send_connect_request(&mut self, _ctx: &mut ConnCtx<'_>, _now: Micros) {}

    fn send_keepalive(&mut self, ctx: &mut ConnCtx<'_>, now: Micros, immediate: bool) {
        debug!(conn = %self.description, immediate, "sending keepalive");
        self.stats.track_sent_ping_request(now);
        if let Transport::Pipe {
            partner: Some(partner),
        } = &self.transport
        {
            ctx.deferred.push(DeferredOp::PipeStatsRoundTrip {
                local: self.id_local,
                partner: *partner,
                now,
            });
        }
    }

    pub(crate) fn think(&mut self, ctx: &mut ConnCtx<'_>, now: Micros) {
        self.check_state_and_set_next_think(ctx, now);
    }

    /// Examine the current state, take any due actions, and schedule the
    /// next wakeup.  Safe to call at any time.
    pub(crate) fn check_state_and_set_next_think(&mut self, ctx: &mut ConnCtx<'_>, now: Micros) {
        self.next_think_min = Micros::MAX;
        self.next_think_max = Micros::MAX;
        let mut window = ThinkWindow::new(now);

        match self.state {
            ConnectionState::Dead => {
                self.pending_destroy = true;
                return;
            }
            ConnectionState::None => {
                debug_assert!(false, "thinking on an uninitialized connection");
                return;
            }
            ConnectionState::FinWait => {
                let timeout = self.entered_state_at + FIN_WAIT_TIMEOUT;
                if now >= timeout {
                    self.pending_destroy = true;
                } else {
                    self.next_think_min = timeout;
                    self.next_think_max = timeout + 100 * 1000;
                }
                return;
            }
            ConnectionState::ProblemDetectedLocally | ConnectionState::ClosedByPeer => {
                // Nothing to send; we're waiting for the app to close us.
                return;
            }
            ConnectionState::Connecting | ConnectionState::FindingRoute => {
                let timeout = self.entered_state_at
                    + self.config.timeout_initial_ms() as Micros * 1000;
                if now >= timeout {
                    if self.state == ConnectionState::Connecting
                        && self.parent_listen_socket.is_some()
                        && !self.accepted
                    {
                        self.problem_detected_locally(
                            ctx,
                            now,
                            end_reason::MISC_TIMEOUT,
                            "App didn't accept or close incoming connection in time.",
                        );
                    } else {
                        self.connection_timed_out(ctx, now);
                    }
                    return;
                }

                if self.parent_listen_socket.is_some()
                    || self.state == ConnectionState::FindingRoute
                {
                    // Acceptors just wait (for the app, or for routing).
                    window.update(timeout, 10);
                } else {
                    let mut retry = now + CRYPTO_READY_POLL_INTERVAL;
                    if self.think_crypto_ready(ctx, now) && self.can_send_connect_request() {
                        retry = self.sent_connect_request_at + CONNECT_RETRY_INTERVAL;
                        if now >= retry {
                            self.send_connect_request(ctx, now);
                            self.sent_connect_request_at = now;
                            retry = now + CONNECT_RETRY_INTERVAL;
                        }
                    }
                    window.update(retry, 5);
                }
            }
            ConnectionState::Linger => {
                if self.reliability.is_drained() {
                    // Everything went out; close for real.
                    self.connection_state_fin_wait(ctx, now);
                    return;
                }
                self.think_connected_data(&mut window, now);
            }
            ConnectionState::Connected => {
                self.think_connected_data(&mut window, now);
            }
        }

        self.stats.think(now);

        // Keepalives and connected-flow timeout.
        if !matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::FindingRoute
        ) {
            debug_assert!(self.stats.time_last_recv > 0);

            let timeout = self.stats.time_last_recv
                + self.config.timeout_connected_ms() as Micros * 1000;
            if now >= timeout {
                if self.stats.reply_timeouts_since_last_recv >= MAX_REPLY_TIMEOUTS
                    || !self.can_send_end_to_end_data()
                {
                    self.connection_timed_out(ctx, now);
                    return;
                }
                // Timed out on the clock but not enough dropped replies
                // yet; check again shortly.
                window.update(now + 100 * 1000, 100);
            } else {
                window.update(timeout, 100);
            }

            // Ping aggressively while the connection looks like it's dying.
            if self.stats.reply_timeouts_since_last_recv > 0 {
                let aggressive = self
                    .stats
                    .time_last_recv
                    .max(self.stats.last_send_expecting_reply)
                    + AGGRESSIVE_PING_INTERVAL;
                if now >= aggressive {
                    if self.can_send_end_to_end_data() {
                        self.send_keepalive(ctx, now, true);
                    } else {
                        window.update(now + 20 * 1000, 5);
                    }
                } else {
                    window.update(aggressive, 20);
                }
            }

            // Ordinary keepalive, when no reply is already in flight.
            if self.stats.in_flight_reply_timeout == 0 {
                let keepalive_at = self.stats.time_last_recv + KEEP_ALIVE_INTERVAL;
                if now >= keepalive_at {
                    if self.can_send_end_to_end_data() {
                        self.send_keepalive(ctx, now, false);
                    } else {
                        window.update(now + 20 * 1000, 5);
                    }
                } else {
                    window.update(keepalive_at, 100);
                }
            }
        }

        // The scheduled time must be in the future; waking exactly "now"
        // would just re-sleep.
        if window.min <= now {
            window.min = now + 1000;
            window.max = window.min + 2000;
        }
        if window.max < window.min {
            window.max = window.min;
        }
        self.next_think_min = window.min;
        self.next_think_max = window.max;
    }

    fn think_connected_data(&mut self, window: &mut ThinkWindow, now: Micros) {
        if self.can_send_end_to_end_data() {
            let next = self.reliability.next_think_time(now);
            if next != Micros::MAX {
                window.update(next.max(now + 1000), 1);
            }
        } else {
            window.update(now + 20 * 1000, 5);
        }
    }
}

pub(crate) fn truncate_debug(msg: &str) -> String {
    if msg.len() <= MAX_END_DEBUG_LEN {
        msg.to_string()
    } else {
        let mut end = MAX_END_DEBUG_LEN;
        while !msg.is_char_boundary(end) {
            end -= 1;
        }
        msg[..end].to_string()
    }
}

/// Fake one packet flowing `sender` → `receiver` across a loopback pair,
/// so sequence numbers, timestamps and ping samples look realistic.
pub(crate) fn pipe_fake_send_stats(
    sender: &mut Connection,
    receiver: &mut Connection,
    packet_bytes: usize,
    now: Micros,
) {
    let full_seq = sender.stats.consume_send_packet_number(now);
    let wire = full_seq as u16;

    // The partner "receives" it instantly, and every packet doubles as a
    // zero-latency ping sample.
    let pkt = receiver.stats.seq.expand_and_check(wire);
    debug_assert_eq!(pkt, full_seq);
    if pkt > 0 {
        receiver.stats.track_process_sequenced_packet(pkt, now);
    }
    receiver.stats.track_recv_packet(packet_bytes, now);
    receiver.stats.ping.received_ping(0);

    sender.stats.track_sent_packet(packet_bytes);
}

/// Fake a keepalive request and its immediate reply across a pair.
pub(crate) fn pipe_fake_stats_round_trip(a: &mut Connection, b: &mut Connection, now: Micros) {
    pipe_fake_send_stats(a, b, 0, now);
    b.stats.peer_acked();
    pipe_fake_send_stats(b, a, 0, now);
    a.stats.peer_acked();
}
