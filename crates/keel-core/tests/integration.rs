//! End-to-end tests across the connection core: loopback pairs, external
//! handshakes, sequence-number policing, cert failures, and lifecycle
//! timeouts.

use bytes::Bytes;
use keel_core::{send_flags, ConnectionState, Event, Runtime, FIN_WAIT_TIMEOUT};
use keel_crypto::{SigningKeypair, TrustedCaKey};
use keel_proto::{end_reason, Identity};

const NOW: i64 = 1_000_000;
const WALL_NOW: u32 = 1_700_000_000;

fn alice() -> Identity {
    Identity::GenericString("alice".into())
}

fn bob() -> Identity {
    Identity::GenericString("bob".into())
}

/// Two runtimes, one external connection each, with the crypto handshake
/// completed in both directions.
/// Returns (rt_a, rt_b, conn_a, conn_b, listen_b).
fn external_handshake_with_listen() -> (Runtime, Runtime, u32, u32, u32) {
    let mut rt_a = Runtime::new(alice(), 480);
    let mut rt_b = Runtime::new(bob(), 480);

    let a = rt_a.connect(bob(), NOW).unwrap();
    let listen = rt_b.create_listen_socket(Default::default());
    let b = rt_b.begin_accept(listen, alice(), a, NOW).unwrap();
    rt_b.accept_connection(b, NOW).unwrap();
    rt_a.set_remote_connection_id(a, b).unwrap();

    let (cert_a, crypt_a) = rt_a.handshake_material(a).unwrap();
    let (cert_b, crypt_b) = rt_b.handshake_material(b).unwrap();
    rt_b.recv_crypto_handshake(b, &cert_a, &crypt_a, true, NOW).unwrap();
    rt_a.recv_crypto_handshake(a, &cert_b, &crypt_b, false, NOW).unwrap();

    assert!(rt_a.handshake_complete(a));
    assert!(rt_b.handshake_complete(b));
    (rt_a, rt_b, a, b, listen)
}

fn external_handshake() -> (Runtime, Runtime, u32, u32) {
    let (rt_a, rt_b, a, b, _) = external_handshake_with_listen();
    (rt_a, rt_b, a, b)
}

#[test]
fn loopback_pair_delivers_hello() {
    let mut rt = Runtime::new(Identity::LocalHost, 480);
    let (a, b) = rt
        .create_socket_pair(Identity::LocalHost, Identity::LocalHost, NOW)
        .unwrap();

    assert_eq!(rt.connection_state(a), Some(ConnectionState::Connected));
    assert_eq!(rt.connection_state(b), Some(ConnectionState::Connected));

    let n = rt
        .send_message(a, Bytes::from_static(b"hello"), send_flags::RELIABLE, NOW)
        .unwrap();
    assert_eq!(n, 1);

    let msgs = rt.receive_messages(b, 10).unwrap();
    assert_eq!(msgs.len(), 1);
    assert_eq!(&msgs[0].payload[..], b"hello");
    assert_eq!(msgs[0].message_number, 1);
    assert_eq!(msgs[0].sender, Identity::LocalHost);
    assert_eq!(msgs[0].connection, b);

    // Nothing left afterwards.
    assert!(rt.receive_messages(b, 10).unwrap().is_empty());

    // Pipes fake a zero-latency ping sample.
    assert_eq!(rt.connection_ping_ms(a), Some(0));
}

#[test]
fn loopback_close_reaches_partner() {
    let mut rt = Runtime::new(Identity::LocalHost, 480);
    let (a, b) = rt
        .create_socket_pair(Identity::LocalHost, Identity::LocalHost, NOW)
        .unwrap();

    rt.close_connection(a, 1005, Some("done here"), false, NOW)
        .unwrap();

    assert_eq!(rt.connection_state(b), Some(ConnectionState::ClosedByPeer));
    let info = rt.connection_info(b).unwrap();
    assert_eq!(info.end_reason, 1005);
    assert_eq!(info.end_debug, "done here");

    // The partner's transition was published.
    let mut saw_closed_by_peer = false;
    while let Some(event) = rt.poll_event() {
        if let Event::StatusChanged(sc) = event {
            if sc.connection == b && sc.info.state == ConnectionState::ClosedByPeer {
                saw_closed_by_peer = true;
            }
        }
    }
    assert!(saw_closed_by_peer);
}

#[test]
fn external_data_roundtrip_and_listen_queue() {
    let (mut rt_a, mut rt_b, a, b, listen) = external_handshake_with_listen();

    let (wire, chunk) = rt_a.encrypt_data_chunk(a, b"ping", NOW).unwrap();
    assert_eq!(wire, 1);
    assert!(rt_b.handle_data_chunk(b, wire, &chunk, NOW).unwrap());

    // First authenticated packet promotes the acceptor.
    assert_eq!(rt_b.connection_state(b), Some(ConnectionState::Connected));

    // The message shows up both on the connection and the parent listen
    // socket's aggregate queue; pulling from the aggregate drains both.
    let msgs = rt_b.receive_messages_on_listen_socket(listen, 10).unwrap();
    assert_eq!(msgs.len(), 1);
    assert_eq!(&msgs[0].payload[..], b"ping");
    assert!(rt_b.receive_messages(b, 10).unwrap().is_empty());

    // And the reverse direction.
    let (wire, chunk) = rt_b.encrypt_data_chunk(b, b"pong", NOW).unwrap();
    assert!(rt_a.handle_data_chunk(a, wire, &chunk, NOW).unwrap());
    assert_eq!(rt_a.connection_state(a), Some(ConnectionState::Connected));
    let msgs = rt_a.receive_messages(a, 10).unwrap();
    assert_eq!(&msgs[0].payload[..], b"pong");
}

#[test]
fn tampered_chunk_is_dropped_silently() {
    let (mut rt_a, mut rt_b, a, b) = external_handshake();

    let (wire, mut chunk) = rt_a.encrypt_data_chunk(a, b"payload", NOW).unwrap();
    chunk[0] ^= 0xFF;
    assert!(!rt_b.handle_data_chunk(b, wire, &chunk, NOW).unwrap());

    // Still connecting and healthy; a forged packet must not kill us.
    assert_eq!(rt_b.connection_state(b), Some(ConnectionState::Connecting));
    assert!(rt_b.receive_messages(b, 10).unwrap().is_empty());
}

#[test]
fn wire_sequence_wraparound() {
    let (mut rt_a, mut rt_b, a, b) = external_handshake();

    // Climb toward the 16-bit wrap in steps the gap police allow, then
    // cross it one packet at a time.
    let deliver: &[i64] = &[1, 16385, 32769, 49153, 65533, 65534, 65535, 65536, 65537];
    for seq in 1..=65537i64 {
        let (wire, chunk) = rt_a.encrypt_data_chunk(a, b"pkt", NOW).unwrap();
        assert_eq!(wire, seq as u16);
        if deliver.contains(&seq) {
            assert!(
                rt_b.handle_data_chunk(b, wire, &chunk, NOW).unwrap(),
                "packet {seq} should decrypt"
            );
        }
    }

    // All nine arrived in order, and the wrap did not upset anyone.
    assert_eq!(rt_b.connection_state(b), Some(ConnectionState::Connected));
    let msgs = rt_b.receive_messages(b, 100).unwrap();
    assert_eq!(msgs.len(), deliver.len());
    for (i, m) in msgs.iter().enumerate() {
        assert_eq!(m.message_number, i as i64 + 1);
    }
}

#[test]
fn sequence_lurch_is_fatal() {
    let (mut rt_a, mut rt_b, a, b) = external_handshake();

    let (wire, chunk) = rt_a.encrypt_data_chunk(a, b"x", NOW).unwrap();
    assert!(rt_b.handle_data_chunk(b, wire, &chunk, NOW).unwrap());

    // Skip ahead by 0x4001 packets.
    let mut last = None;
    for _ in 0..0x4001 {
        last = Some(rt_a.encrypt_data_chunk(a, b"x", NOW).unwrap());
    }
    let (wire, chunk) = last.unwrap();
    assert!(!rt_b.handle_data_chunk(b, wire, &chunk, NOW).unwrap());

    assert_eq!(
        rt_b.connection_state(b),
        Some(ConnectionState::ProblemDetectedLocally)
    );
    let info = rt_b.connection_info(b).unwrap();
    assert_eq!(info.end_reason, end_reason::MISC_GENERIC);
    assert!(
        info.end_debug.contains("Pkt number lurch by 16385"),
        "unexpected debug: {}",
        info.end_debug
    );
}

/// Build a CA plus a signed cert for `identity`, bound to `app_id`.
fn issue_cert(
    identity: &Identity,
    app_id: u32,
    time_expiry: u32,
) -> (SigningKeypair, SigningKeypair, keel_proto::SignedCertificate) {
    let ca = SigningKeypair::generate();
    let subject = SigningKeypair::generate();
    let cert = keel_proto::Certificate {
        key_type: keel_proto::CertKeyType::Ed25519 as i32,
        key_data: subject.public_key_bytes().to_vec(),
        legacy_steam_id: None,
        identity: Some(identity.render()),
        gameserver_datacenter_ids: vec![],
        time_created: Some(WALL_NOW - 1000),
        time_expiry: Some(time_expiry),
        app_id: Some(app_id),
    };
    let signed = keel_crypto::cert::ca_signed_cert(&ca, &cert);
    (ca, subject, signed)
}

fn handshake_with_cert(
    signed: keel_proto::SignedCertificate,
    subject: SigningKeypair,
    ca: &SigningKeypair,
) -> (Runtime, u32, Result<(), keel_common::Error>) {
    let mut rt_a = Runtime::new(alice(), 480);
    let mut rt_b = Runtime::new(bob(), 480);
    rt_a.set_trusted_ca_keys(vec![TrustedCaKey {
        id: ca.public_key_id(),
        public_key: ca.public_key_bytes(),
    }]);
    rt_a.set_wall_clock_unix(WALL_NOW);
    rt_b.install_cert(signed, subject, true, NOW);

    let a = rt_a.connect(bob(), NOW).unwrap();
    let listen = rt_b.create_listen_socket(Default::default());
    let b = rt_b.begin_accept(listen, alice(), a, NOW).unwrap();
    rt_b.accept_connection(b, NOW).unwrap();
    rt_a.set_remote_connection_id(a, b).unwrap();

    let (cert_b, crypt_b) = rt_b.handshake_material(b).unwrap();
    let result = rt_a.recv_crypto_handshake(a, &cert_b, &crypt_b, false, NOW);
    (rt_a, a, result)
}

#[test]
fn expired_signed_cert_is_lenient() {
    // Expired 100 seconds ago; the default policy warns and proceeds.
    let (ca, subject, signed) = issue_cert(&bob(), 480, WALL_NOW - 100);
    let (rt_a, a, result) = handshake_with_cert(signed, subject, &ca);
    result.unwrap();
    assert!(rt_a.handshake_complete(a));
}

#[test]
fn flipped_ca_signature_is_rejected() {
    let (ca, subject, mut signed) = issue_cert(&bob(), 480, WALL_NOW + 100_000);
    signed.ca_signature.as_mut().unwrap()[7] ^= 0x01;
    let (rt_a, a, result) = handshake_with_cert(signed, subject, &ca);
    assert!(result.is_err());
    assert!(!rt_a.handshake_complete(a));

    let info = rt_a.connection_info(a).unwrap();
    assert_eq!(info.state, ConnectionState::ProblemDetectedLocally);
    assert_eq!(info.end_reason, end_reason::REMOTE_BAD_CERT);
    assert_eq!(info.end_debug, "Invalid cert signature");
}

#[test]
fn app_id_mismatch_is_rejected() {
    let (ca, subject, signed) = issue_cert(&bob(), 730, WALL_NOW + 100_000);
    let (rt_a, a, result) = handshake_with_cert(signed, subject, &ca);
    assert!(result.is_err());

    let info = rt_a.connection_info(a).unwrap();
    assert_eq!(info.end_reason, end_reason::REMOTE_BAD_CERT);
    assert_eq!(info.end_debug, "Cert is for AppID 730 instead of 480");
}

#[test]
fn repeated_handshake_is_idempotent_but_rekey_is_not() {
    let (mut rt_a, rt_b, a, b) = external_handshake();

    // Same inputs again: silently fine.
    let (cert_b, crypt_b) = rt_b.handshake_material(b).unwrap();
    rt_a.recv_crypto_handshake(a, &cert_b, &crypt_b, false, NOW).unwrap();
    assert_eq!(rt_a.connection_state(a), Some(ConnectionState::Connecting));

    // Different crypt info bytes: rejected outright.
    let mut altered = crypt_b.clone();
    altered.info[0] ^= 0x01;
    assert!(rt_a
        .recv_crypto_handshake(a, &cert_b, &altered, false, NOW)
        .is_err());
    let info = rt_a.connection_info(a).unwrap();
    assert_eq!(info.end_reason, end_reason::REMOTE_BAD_CRYPT);
    assert_eq!(info.end_debug, "Rekeying is not supported");
}

#[test]
fn recent_connection_ids_are_not_reused() {
    let mut rt = Runtime::new(Identity::LocalHost, 480);
    let mut retired = Vec::new();
    for _ in 0..10 {
        let (a, b) = rt
            .create_socket_pair(Identity::LocalHost, Identity::LocalHost, NOW)
            .unwrap();
        retired.push(a as u16);
        retired.push(b as u16);
        rt.destroy_connection(a, NOW).unwrap();
        rt.destroy_connection(b, NOW).unwrap();
    }
    assert_eq!(rt.connection_count(), 0);

    let (x, y) = rt
        .create_socket_pair(Identity::LocalHost, Identity::LocalHost, NOW)
        .unwrap();
    assert!(!retired.contains(&(x as u16)));
    assert!(!retired.contains(&(y as u16)));
}

#[test]
fn fin_wait_reclaims_on_think() {
    let mut rt = Runtime::new(Identity::LocalHost, 480);
    let (a, b) = rt
        .create_socket_pair(Identity::LocalHost, Identity::LocalHost, NOW)
        .unwrap();
    let _ = b;

    rt.close_connection(a, 0, None, false, NOW).unwrap();
    // Internally FinWait; the app sees it as gone already.
    assert_eq!(rt.connection_state(a), Some(ConnectionState::None));

    // Not yet: the grace period is still running.
    rt.think(NOW + FIN_WAIT_TIMEOUT - 1);
    assert!(rt.connection_state(a).is_some());

    // After the grace period the next think reclaims it.
    rt.think(NOW + FIN_WAIT_TIMEOUT + 1);
    assert_eq!(rt.connection_state(a), None);

    // Closing again is a host error.
    assert!(rt.close_connection(a, 0, None, false, NOW).is_err());
}

#[test]
fn connect_timeout_fails_with_misc_timeout() {
    let mut rt = Runtime::new(alice(), 480);
    let c = rt.connect(bob(), NOW).unwrap();
    assert_eq!(rt.connection_state(c), Some(ConnectionState::Connecting));

    rt.think(NOW + 10_000_000 + 1);
    assert_eq!(
        rt.connection_state(c),
        Some(ConnectionState::ProblemDetectedLocally)
    );
    let info = rt.connection_info(c).unwrap();
    assert_eq!(info.end_reason, end_reason::MISC_TIMEOUT);
    assert_eq!(info.end_debug, "Timed out attempting to connect");
}

#[test]
fn unaccepted_incoming_connection_times_out() {
    let mut rt = Runtime::new(bob(), 480);
    let listen = rt.create_listen_socket(Default::default());
    let c = rt.begin_accept(listen, alice(), 0x0101_0101, NOW).unwrap();

    rt.think(NOW + 10_000_000 + 1);
    let info = rt.connection_info(c).unwrap();
    assert_eq!(info.end_reason, end_reason::MISC_TIMEOUT);
    assert_eq!(
        info.end_debug,
        "App didn't accept or close incoming connection in time."
    );
}

#[test]
fn linger_drains_before_fin_wait() {
    let (mut rt_a, mut rt_b, a, b) = external_handshake();

    // Promote both sides with one packet each way.
    let (wire, chunk) = rt_a.encrypt_data_chunk(a, b"up", NOW).unwrap();
    rt_b.handle_data_chunk(b, wire, &chunk, NOW).unwrap();
    let (wire, chunk) = rt_b.encrypt_data_chunk(b, b"down", NOW).unwrap();
    rt_a.handle_data_chunk(a, wire, &chunk, NOW).unwrap();
    assert_eq!(rt_a.connection_state(a), Some(ConnectionState::Connected));

    // Queue something, then close with linger: still "connected" while
    // the queue drains.
    rt_a.send_message(a, Bytes::from_static(b"tail"), send_flags::RELIABLE, NOW)
        .unwrap();
    rt_a.close_connection(a, 0, None, true, NOW).unwrap();
    assert_eq!(rt_a.connection_state(a), Some(ConnectionState::Connected));

    rt_a.think(NOW + 50_000);
    assert_eq!(rt_a.connection_state(a), Some(ConnectionState::Connected));

    // The host drains the queue; the next think finishes the close.
    let outbound = rt_a.take_outbound_messages(a).unwrap();
    assert_eq!(outbound.len(), 1);
    rt_a.think(NOW + 100_000);
    assert_eq!(rt_a.connection_state(a), Some(ConnectionState::None));
}

#[test]
fn cert_request_flow() {
    let mut rt = Runtime::new(alice(), 480);
    rt.set_config(keel_core::ConnectionConfig {
        allow_unsigned_local: Some(false),
        ..Default::default()
    });

    let c = rt.connect(bob(), NOW).unwrap();
    assert!(rt.handshake_material(c).is_err());

    let mut saw_request = false;
    while let Some(event) = rt.poll_event() {
        if matches!(event, Event::CertRequested) {
            saw_request = true;
        }
    }
    assert!(saw_request);

    // The host obtains a cert for us and installs it.
    let (_ca, subject, signed) = issue_cert(&alice(), 480, WALL_NOW + 100_000);
    rt.install_cert(signed, subject, true, NOW);
    assert!(rt.handshake_material(c).is_ok());
}

#[test]
fn cert_request_failure_kills_strict_connections() {
    let mut rt = Runtime::new(alice(), 480);
    rt.set_config(keel_core::ConnectionConfig {
        allow_unsigned_local: Some(false),
        ..Default::default()
    });
    let c = rt.connect(bob(), NOW).unwrap();

    rt.cert_request_failed(end_reason::MISC_INTERNAL_ERROR, "no cert authority", NOW);
    let info = rt.connection_info(c).unwrap();
    assert_eq!(info.state, ConnectionState::ProblemDetectedLocally);
    assert_eq!(info.end_debug, "Cert failure: no cert authority");
}

#[test]
fn invalid_app_close_reason_is_clamped() {
    let mut rt = Runtime::new(Identity::LocalHost, 480);
    let (a, b) = rt
        .create_socket_pair(Identity::LocalHost, Identity::LocalHost, NOW)
        .unwrap();
    let _ = a;

    // 5001 is not an application code.
    rt.close_connection(b, 5001, Some("whatever"), false, NOW)
        .unwrap();
    let info = rt.connection_info(b).unwrap();
    assert_eq!(info.end_reason, end_reason::APP_MAX);
    assert_eq!(info.end_debug, "Invalid numeric reason code");
}
