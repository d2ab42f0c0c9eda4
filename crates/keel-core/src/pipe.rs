//! Loopback ("pipe") connection pairs.
//!
//! Two connections in the same runtime wired straight together: the full
//! init and crypto handshake run exactly as they would across a wire, but
//! sends are delivered directly into the partner's receive queue and the
//! timing/ping bookkeeping is faked to look like a zero-latency link.  No
//! packet-layer encryption happens because there is no packet layer.

use keel_common::Error;
use keel_proto::Identity;

use crate::config::ConnectionConfig;
use crate::connection::{pipe_fake_send_stats, Transport};
use crate::reliability::DatagramReliability;
use crate::runtime::Runtime;
use crate::Micros;

/// Pipes never block on rate limits; slam something enormous in.
const PIPE_SEND_RATE: i32 = 0x1000_0000;

/// Create two connections joined as a loopback pair.  Both are returned in
/// the connected state, ready to carry messages.
pub(crate) fn create_socket_pair(
    rt: &mut Runtime,
    identity_a: Identity,
    identity_b: Identity,
    now: Micros,
) -> Result<(u32, u32), Error> {
    let config = ConnectionConfig {
        send_rate_min: Some(PIPE_SEND_RATE),
        send_rate_max: Some(PIPE_SEND_RATE),
        ..Default::default()
    };

    let a = rt.init_connection(
        identity_a,
        Identity::Invalid,
        Transport::Pipe { partner: None },
        None,
        config.clone(),
        Box::new(DatagramReliability::new()),
        now,
    )?;
    let b = match rt.init_connection(
        identity_b,
        Identity::Invalid,
        Transport::Pipe { partner: None },
        None,
        config,
        Box::new(DatagramReliability::new()),
        now,
    ) {
        Ok(b) => b,
        Err(e) => {
            let _ = rt.destroy_connection(a, now);
            return Err(e);
        }
    };

    match wire_pair(rt, a, b, now) {
        Ok(()) => Ok((a, b)),
        Err(e) => {
            let _ = rt.destroy_connection(a, now);
            let _ = rt.destroy_connection(b, now);
            Err(e)
        }
    }
}

fn wire_pair(rt: &mut Runtime, a: u32, b: u32, now: Micros) -> Result<(), Error> {
    // Tie the halves together and exchange identities/ids.
    {
        let (mut ca, mut cb) = take_pair(rt, a, b)?;
        ca.transport = Transport::Pipe { partner: Some(b) };
        cb.transport = Transport::Pipe { partner: Some(a) };
        ca.identity_remote = cb.identity_local.clone();
        cb.identity_remote = ca.identity_local.clone();
        ca.id_remote = cb.id_local;
        cb.id_remote = ca.id_local;

        // Trade a dummy "connect" packet in each direction so sequence
        // numbers and ping look as realistic as possible.
        pipe_fake_send_stats(&mut ca, &mut cb, 0, now);
        pipe_fake_send_stats(&mut cb, &mut ca, 0, now);

        put_pair(rt, a, ca, b, cb);
    }

    // Cross-feed the handshakes.  One side plays the server so the key
    // derivation swaps agree.
    for (local, remote, is_server) in [(a, b, true), (b, a, false)] {
        let (cert, crypt) = rt.handshake_material(remote)?;
        rt.recv_crypto_handshake(local, &cert, &crypt, is_server, now)
            .map_err(|e| Error::internal(format!("loopback handshake failed: {e}")))?;
    }

    for conn in [a, b] {
        rt.mark_pipe_connected(conn, now)?;
    }
    Ok(())
}

fn take_pair(
    rt: &mut Runtime,
    a: u32,
    b: u32,
) -> Result<(crate::connection::Connection, crate::connection::Connection), Error> {
    let ca = rt
        .connections
        .remove(&(a as u16))
        .ok_or_else(|| Error::not_found("pipe connection"))?;
    let cb = match rt.connections.remove(&(b as u16)) {
        Some(c) => c,
        None => {
            rt.connections.insert(a as u16, ca);
            return Err(Error::not_found("pipe connection"));
        }
    };
    Ok((ca, cb))
}

fn put_pair(
    rt: &mut Runtime,
    a: u32,
    ca: crate::connection::Connection,
    b: u32,
    cb: crate::connection::Connection,
) {
    rt.connections.insert(a as u16, ca);
    rt.connections.insert(b as u16, cb);
}
