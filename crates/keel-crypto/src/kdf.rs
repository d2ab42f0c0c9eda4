//! Session key derivation.
//!
//! HKDF-style extract-then-expand over HMAC-SHA256 (RFC 5869 shape), turning
//! the X25519 premaster secret into per-direction AEAD keys and base IVs.
//! Both peers run the same function; the `is_server` flag swaps the
//! role-dependent halves so that one side's send keys are the other side's
//! receive keys.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::{Zeroize, Zeroizing};

type HmacSha256 = Hmac<Sha256>;

/// Fixed label mixed into the expand context (14 bytes).
const KDF_LABEL: &[u8] = b"Steam datagram";

/// Derived session key material.  Wiped on drop.
#[derive(Zeroize, zeroize::ZeroizeOnDrop)]
pub struct SessionKeys {
    pub key_send: [u8; 32],
    pub key_recv: [u8; 32],
    pub iv_send: [u8; 12],
    pub iv_recv: [u8; 12],
}

/// Connection-specific context for the derivation.
///
/// `cert_*` and `info_*` are the exact serialized bytes exchanged in the
/// handshake (not re-encoded), so both sides hash identical input.
pub struct SessionKdfInput<'a> {
    pub nonce_local: u64,
    pub nonce_remote: u64,
    pub conn_id_local: u32,
    pub conn_id_remote: u32,
    pub cert_local: &'a [u8],
    pub cert_remote: &'a [u8],
    pub info_local: &'a [u8],
    pub info_remote: &'a [u8],
    pub is_server: bool,
}

/// Derive the four session outputs from the premaster secret.
///
/// Extract: `PRK = HMAC(premaster, nonce_remote ∥ nonce_local)` with the
/// nonce halves swapped on the server so both sides agree.
///
/// Expand: four HMAC rounds over `prev_digest ∥ conn-ids ∥ label ∥ certs ∥
/// infos ∥ round-byte`, yielding `key_send, key_recv, iv_send, iv_recv`
/// (server swaps within each pair).  The first round has no previous digest.
pub fn derive_session_keys(premaster: &[u8; 32], input: &SessionKdfInput<'_>) -> SessionKeys {
    // 1. Extract.
    let mut salt = [0u8; 16];
    let (first, second) = if input.is_server {
        (input.nonce_local, input.nonce_remote)
    } else {
        (input.nonce_remote, input.nonce_local)
    };
    salt[..8].copy_from_slice(&first.to_le_bytes());
    salt[8..].copy_from_slice(&second.to_le_bytes());

    let mut mac = HmacSha256::new_from_slice(premaster).expect("hmac accepts any key length");
    mac.update(&salt);
    let prk = Zeroizing::new(<[u8; 32]>::from(mac.finalize().into_bytes()));

    // 2. Expand.  Build the shared context once; the per-round digest and
    // round byte are fed separately.
    let (id_a, id_b) = if input.is_server {
        (input.conn_id_remote, input.conn_id_local)
    } else {
        (input.conn_id_local, input.conn_id_remote)
    };
    let context: [&[u8]; 4] = if input.is_server {
        [
            input.cert_remote,
            input.cert_local,
            input.info_remote,
            input.info_local,
        ]
    } else {
        [
            input.cert_local,
            input.cert_remote,
            input.info_local,
            input.info_remote,
        ]
    };

    let mut core = Vec::with_capacity(
        8 + KDF_LABEL.len() + context.iter().map(|c| c.len()).sum::<usize>(),
    );
    core.extend_from_slice(&id_a.to_le_bytes());
    core.extend_from_slice(&id_b.to_le_bytes());
    core.extend_from_slice(KDF_LABEL);
    for c in context {
        core.extend_from_slice(c);
    }

    let mut out32 = [[0u8; 32]; 2];
    let mut out12 = [[0u8; 12]; 2];
    let mut prev = Zeroizing::new([0u8; 32]);
    for round in 0u8..4 {
        let mut mac = HmacSha256::new_from_slice(&prk[..]).expect("hmac accepts any key length");
        if round > 0 {
            mac.update(&prev[..]);
        }
        mac.update(&core);
        mac.update(&[round + 1]);
        let mut digest = <[u8; 32]>::from(mac.finalize().into_bytes());
        match round {
            0 => out32[0].copy_from_slice(&digest),
            1 => out32[1].copy_from_slice(&digest),
            2 => out12[0].copy_from_slice(&digest[..12]),
            _ => out12[1].copy_from_slice(&digest[..12]),
        }
        prev.copy_from_slice(&digest);
        digest.zeroize();
    }

    let keys = if input.is_server {
        SessionKeys {
            key_send: out32[1],
            key_recv: out32[0],
            iv_send: out12[1],
            iv_recv: out12[0],
        }
    } else {
        SessionKeys {
            key_send: out32[0],
            key_recv: out32[1],
            iv_send: out12[0],
            iv_recv: out12[1],
        }
    };
    out32.zeroize();
    out12.zeroize();
    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_input(is_server: bool) -> SessionKdfInput<'static> {
        // "local" and "remote" are from the client's point of view; the
        // server sees them mirrored.
        const CERT_A: &[u8] = b"cert bytes for side a";
        const CERT_B: &[u8] = b"cert bytes for side b";
        const INFO_A: &[u8] = b"crypt info a";
        const INFO_B: &[u8] = b"crypt info b";
        if is_server {
            SessionKdfInput {
                nonce_local: 222,
                nonce_remote: 111,
                conn_id_local: 0xB0B0_0002,
                conn_id_remote: 0xA0A0_0001,
                cert_local: CERT_B,
                cert_remote: CERT_A,
                info_local: INFO_B,
                info_remote: INFO_A,
                is_server: true,
            }
        } else {
            SessionKdfInput {
                nonce_local: 111,
                nonce_remote: 222,
                conn_id_local: 0xA0A0_0001,
                conn_id_remote: 0xB0B0_0002,
                cert_local: CERT_A,
                cert_remote: CERT_B,
                info_local: INFO_A,
                info_remote: INFO_B,
                is_server: false,
            }
        }
    }

    #[test]
    fn role_swap_symmetry() {
        let premaster = [7u8; 32];
        let client = derive_session_keys(&premaster, &sample_input(false));
        let server = derive_session_keys(&premaster, &sample_input(true));

        assert_eq!(client.key_send, server.key_recv);
        assert_eq!(client.key_recv, server.key_send);
        assert_eq!(client.iv_send, server.iv_recv);
        assert_eq!(client.iv_recv, server.iv_send);

        // Directions must not collapse onto each other.
        assert_ne!(client.key_send, client.key_recv);
        assert_ne!(client.iv_send, client.iv_recv);
    }

    #[test]
    fn premaster_changes_everything() {
        let a = derive_session_keys(&[1u8; 32], &sample_input(false));
        let b = derive_session_keys(&[2u8; 32], &sample_input(false));
        assert_ne!(a.key_send, b.key_send);
        assert_ne!(a.key_recv, b.key_recv);
        assert_ne!(a.iv_send, b.iv_send);
    }

    #[test]
    fn context_changes_keys() {
        let premaster = [7u8; 32];
        let base = derive_session_keys(&premaster, &sample_input(false));
        let mut input = sample_input(false);
        input.conn_id_remote ^= 1;
        let other = derive_session_keys(&premaster, &input);
        assert_ne!(base.key_send, other.key_send);
    }

    #[test]
    fn derivation_is_deterministic() {
        let premaster = [9u8; 32];
        let a = derive_session_keys(&premaster, &sample_input(false));
        let b = derive_session_keys(&premaster, &sample_input(false));
        assert_eq!(a.key_send, b.key_send);
        assert_eq!(a.key_recv, b.key_recv);
        assert_eq!(a.iv_send, b.iv_send);
        assert_eq!(a.iv_recv, b.iv_recv);
    }
}
